//! # Page Types and Header Layout
//!
//! This module defines page identity and the page header for aspendb's
//! storage layer. Every 4KB page begins with a 16-byte header describing
//! what the page holds and how far it extends.
//!
//! ## Page Identity
//!
//! Pages are addressed by `Pgid`, a 64-bit index into the database file:
//! page `i` occupies bytes `i * PAGE_SIZE .. (i + 1) * PAGE_SIZE`. Pages 0
//! and 1 are the two alternating meta pages and are never allocated or
//! freed. The sentinel `PGID_NO_FREELIST` in a meta page's freelist field
//! means no freelist page has been persisted yet.
//!
//! Write transactions are numbered by `Txid`, a 64-bit counter that the
//! writer increments once per commit. Page reclamation is interlocked on
//! txids: a freed page stays pending until no reader snapshot can still
//! observe it.
//!
//! ## Page Header Layout (16 bytes)
//!
//! ```text
//! Offset  Size  Field     Description
//! ------  ----  --------  ----------------------------------------
//! 0       8     id        Page id (equals the page's file position)
//! 8       2     flags     Page kind bits (branch/leaf/meta/freelist)
//! 10      2     count     Element count; 0xFFFF escapes to a leading
//!                         length word (freelist pages only)
//! 12      4     overflow  Number of extra contiguous pages in this
//!                         page's span
//! ```
//!
//! A page plus its overflow pages form a *span* of `1 + overflow`
//! contiguous pages that are allocated and freed as a unit.
//!
//! ## Zero-Copy Access
//!
//! `PageHeader` uses `zerocopy` little-endian fields so headers can be
//! read directly from mmap'd pages without copying, at any alignment.

use eyre::Result;
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{parse_zerocopy, parse_zerocopy_mut, PAGE_HEADER_SIZE};

pub type Pgid = u64;
pub type Txid = u64;

/// Meta-page freelist field value meaning "no freelist page stored".
pub const PGID_NO_FREELIST: Pgid = u64::MAX;

pub const BRANCH_PAGE_FLAG: u16 = 0x01;
pub const LEAF_PAGE_FLAG: u16 = 0x02;
pub const META_PAGE_FLAG: u16 = 0x04;
pub const FREELIST_PAGE_FLAG: u16 = 0x10;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageHeader {
    id: U64,
    flags: U16,
    count: U16,
    overflow: U32,
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);

impl PageHeader {
    pub fn new(id: Pgid, flags: u16) -> Self {
        Self {
            id: U64::new(id),
            flags: U16::new(flags),
            count: U16::new(0),
            overflow: U32::new(0),
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        parse_zerocopy(data, "PageHeader")
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        parse_zerocopy_mut(data, "PageHeader")
    }

    pub fn id(&self) -> Pgid {
        self.id.get()
    }

    pub fn set_id(&mut self, id: Pgid) {
        self.id = U64::new(id);
    }

    pub fn flags(&self) -> u16 {
        self.flags.get()
    }

    pub fn set_flags(&mut self, flags: u16) {
        self.flags = U16::new(flags);
    }

    pub fn count(&self) -> u16 {
        self.count.get()
    }

    pub fn set_count(&mut self, count: u16) {
        self.count = U16::new(count);
    }

    pub fn overflow(&self) -> u32 {
        self.overflow.get()
    }

    pub fn set_overflow(&mut self, overflow: u32) {
        self.overflow = U32::new(overflow);
    }

    /// Total pages in this page's span, the base page included.
    pub fn span(&self) -> u64 {
        1 + self.overflow.get() as u64
    }

    /// Last page id covered by this page's span.
    pub fn span_end(&self) -> Pgid {
        self.id.get() + self.overflow.get() as u64
    }
}
