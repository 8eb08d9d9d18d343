//! # Storage Module
//!
//! This module provides the storage layer for aspendb: a single
//! memory-mapped database file carved into fixed-size pages, the meta
//! pages that anchor each committed snapshot, and the freelist that
//! decides which pages a writer may reuse.
//!
//! ## File Layout
//!
//! The database is one file of 4KB pages:
//!
//! ```text
//! Page 0   Meta slot A (even txids)
//! Page 1   Meta slot B (odd txids)
//! Page 2+  B+tree branch/leaf pages, freelist pages, overflow pages
//! ```
//!
//! Each committed transaction writes the meta slot `txid % 2`, so the
//! previous meta stays intact until the new one is durable. A meta page
//! points at the tree root, the persisted freelist span, and the
//! high-water mark (the first page id past end-of-file growth).
//!
//! ## Copy-on-Write Discipline
//!
//! Writers never modify a page a concurrent reader may observe. Every
//! touched page is rewritten at a freshly allocated id; the old id is
//! handed to the freelist, which parks it as *pending* until the oldest
//! live reader snapshot has moved past the freeing transaction. The
//! freelist is therefore the interlock between reclamation and MVCC; its
//! design is documented in [`freelist`].
//!
//! ## Safety Model
//!
//! Memory-mapped page slices become invalid when the file is grown and
//! remapped. `MmapStorage` leans on the borrow checker for this:
//! `page()` borrows `&self` while `grow()` takes `&mut self`, so no page
//! reference can be held across a remap. No runtime guards are needed.
//!
//! ## Module Organization
//!
//! - `page`: page identity (`Pgid`/`Txid`), flags, the 16-byte header
//! - `meta`: the checksummed meta page
//! - `freelist`: free-page tracking with array and hashmap backends
//! - `mmap`: low-level memory-mapped file access

pub mod freelist;
mod meta;
mod mmap;
mod page;

pub use freelist::{Freelist, FreelistBackend};
pub use meta::{Meta, MAGIC, VERSION};
pub use mmap::MmapStorage;
pub use page::{
    PageHeader, Pgid, Txid, BRANCH_PAGE_FLAG, FREELIST_PAGE_FLAG, LEAF_PAGE_FLAG, META_PAGE_FLAG,
    PGID_NO_FREELIST,
};

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, KnownLayout};

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_HEADER_SIZE: usize = 16;

/// Parses a zerocopy struct from a byte slice with size validation.
#[inline]
pub fn parse_zerocopy<'a, T: FromBytes + KnownLayout + Immutable>(
    bytes: &'a [u8],
    type_name: &str,
) -> Result<&'a T> {
    let size = std::mem::size_of::<T>();
    ensure!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        type_name,
        bytes.len(),
        size
    );
    T::ref_from_bytes(&bytes[..size])
        .map_err(|e| {
            eprintln!("DEBUG parse_zerocopy size={} bytes.len={} err={:?}", size, bytes.len(), e);
            eyre::eyre!("failed to parse {}: {:?}", type_name, e)
        })
}

/// Parses a mutable zerocopy struct from a byte slice with size validation.
#[inline]
pub fn parse_zerocopy_mut<'a, T: FromBytes + KnownLayout + zerocopy::IntoBytes>(
    bytes: &'a mut [u8],
    type_name: &str,
) -> Result<&'a mut T> {
    let size = std::mem::size_of::<T>();
    ensure!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        type_name,
        bytes.len(),
        size
    );
    T::mut_from_bytes(&mut bytes[..size])
        .map_err(|e| eyre::eyre!("failed to parse {}: {:?}", type_name, e))
}
