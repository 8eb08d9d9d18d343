//! # AspenDB - Embedded Copy-on-Write Key/Value Store Core
//!
//! AspenDB is the storage core of an embedded, single-file, memory-mapped
//! key/value store in the copy-on-write B+tree family. A writer never
//! overwrites a page a concurrent reader might observe; it copies the
//! page to a fresh id and hands the old one to the freelist. This crate
//! implements that page-lifecycle machinery:
//!
//! - **Freelist** with two interchangeable backends (sorted array and
//!   span-indexed hashmap) behind one interface
//! - **Pending-page interlock** keyed by transaction ids, so reclamation
//!   never races a reader snapshot
//! - **Durable serialization** of the freelist onto file pages, crash-safe
//!   against torn commits
//! - **Write transactions** with page allocation, accounting, commit, and
//!   rollback over a memory-mapped file
//!
//! ## Quick Start
//!
//! ```ignore
//! use aspendb::{Database, FreelistBackend};
//!
//! let db = Database::builder()
//!     .path("./data.adb")
//!     .freelist_backend(FreelistBackend::Hashmap)
//!     .open()?;
//!
//! let mut tx = db.begin_rw()?;
//! let id = tx.allocate(2)?;
//! tx.page_mut(id)?[16..21].copy_from_slice(b"hello");
//! tx.commit()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │       Database (open/begin)         │
//! ├──────────────────┬──────────────────┤
//! │  Transaction     │  ReadTransaction │
//! │  (dirty pages,   │  (snapshot pin)  │
//! │   accounting)    │                  │
//! ├──────────────────┴──────────────────┤
//! │  Freelist (pending / cache / pool)  │
//! │    Array backend | Hashmap backend  │
//! ├─────────────────────────────────────┤
//! │  Pages + Meta (zerocopy layouts)    │
//! ├─────────────────────────────────────┤
//! │  MmapStorage (memory-mapped file)   │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Concurrency Model
//!
//! Single writer, many readers. The write gate serializes writers for
//! their whole lifetime; readers only pin a snapshot txid in a registry
//! the next writer consults before recycling pages. The freelist itself
//! is single-threaded by construction and carries no locks.
//!
//! ## Module Overview
//!
//! - [`storage`]: pages, meta, freelist backends, memory-mapped file I/O
//! - [`db`]: database handle, builder, open/init path, reader registry
//! - [`tx`]: write transactions and snapshot pins

pub mod db;
pub mod storage;
pub mod tx;

pub use db::{Database, DatabaseBuilder, DbStats};
pub use storage::{Freelist, FreelistBackend, PageHeader, Pgid, Txid, PAGE_SIZE};
pub use tx::{ReadTransaction, Transaction, TxStats};
