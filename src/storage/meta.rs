//! # Meta Page
//!
//! A meta page anchors one committed snapshot of the database: the tree
//! root, the persisted freelist span, the high-water mark, and the commit
//! txid. Two slots alternate on pages 0 and 1 (`txid % 2`), so a crash
//! mid-commit always leaves the previous slot intact. On open, both slots
//! are read and the valid one with the highest txid wins.
//!
//! ## Layout (56 bytes, after the 16-byte page header)
//!
//! ```text
//! Offset  Size  Field      Description
//! ------  ----  ---------  ----------------------------------------
//! 0       4     magic      0xA5BEDB01, marks an aspendb file
//! 4       4     version    File format version
//! 8       4     page_size  Page size the file was created with
//! 12      4     flags      Reserved
//! 16      8     root       Root page of the B+tree
//! 24      8     freelist   First freelist page, or PGID_NO_FREELIST
//! 32      8     pgid       High-water mark (first id past the file)
//! 40      8     txid       Txid of the committing transaction
//! 48      8     checksum   CRC-64/ECMA over the preceding 48 bytes
//! ```
//!
//! The checksum detects torn meta writes: a slot whose checksum does not
//! match is skipped at open in favor of the other slot.

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::page::{PageHeader, Pgid, Txid, META_PAGE_FLAG, PGID_NO_FREELIST};
use super::{parse_zerocopy, PAGE_HEADER_SIZE, PAGE_SIZE};

// A meta slot must fit in a single page.
const _: () = assert!(PAGE_HEADER_SIZE + META_SIZE <= PAGE_SIZE);

pub const MAGIC: u32 = 0xA5BE_DB01;
pub const VERSION: u32 = 1;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

const META_SIZE: usize = 56;
const CHECKSUM_OFFSET: usize = META_SIZE - 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Meta {
    magic: U32,
    version: U32,
    page_size: U32,
    flags: U32,
    root: U64,
    freelist: U64,
    pgid: U64,
    txid: U64,
    checksum: U64,
}

const _: () = assert!(std::mem::size_of::<Meta>() == META_SIZE);

impl Meta {
    pub fn new() -> Self {
        Self {
            magic: U32::new(MAGIC),
            version: U32::new(VERSION),
            page_size: U32::new(PAGE_SIZE as u32),
            flags: U32::new(0),
            root: U64::new(0),
            freelist: U64::new(PGID_NO_FREELIST),
            pgid: U64::new(0),
            txid: U64::new(0),
            checksum: U64::new(0),
        }
    }

    pub fn root(&self) -> Pgid {
        self.root.get()
    }

    pub fn set_root(&mut self, root: Pgid) {
        self.root = U64::new(root);
    }

    pub fn freelist(&self) -> Pgid {
        self.freelist.get()
    }

    pub fn set_freelist(&mut self, freelist: Pgid) {
        self.freelist = U64::new(freelist);
    }

    pub fn pgid(&self) -> Pgid {
        self.pgid.get()
    }

    pub fn set_pgid(&mut self, pgid: Pgid) {
        self.pgid = U64::new(pgid);
    }

    pub fn txid(&self) -> Txid {
        self.txid.get()
    }

    pub fn set_txid(&mut self, txid: Txid) {
        self.txid = U64::new(txid);
    }

    /// Page id of the meta slot this meta belongs to.
    pub fn slot(&self) -> Pgid {
        self.txid.get() % 2
    }

    pub fn sum64(&self) -> u64 {
        CRC64.checksum(&self.as_bytes()[..CHECKSUM_OFFSET])
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.magic.get() == MAGIC,
            "invalid magic: {:#010x} (expected {:#010x})",
            self.magic.get(),
            MAGIC
        );

        ensure!(
            self.version.get() == VERSION,
            "unsupported file format version: {} (expected {})",
            self.version.get(),
            VERSION
        );

        ensure!(
            self.page_size.get() == PAGE_SIZE as u32,
            "page size mismatch: file has {}, build uses {}",
            self.page_size.get(),
            PAGE_SIZE
        );

        ensure!(
            self.checksum.get() == self.sum64(),
            "meta checksum mismatch: {:#018x} != {:#018x}",
            self.checksum.get(),
            self.sum64()
        );

        Ok(())
    }

    /// Stamps the page header and writes this meta, checksummed, into a
    /// meta slot buffer.
    pub fn write_to(&mut self, page: &mut [u8]) -> Result<()> {
        println!("DEBUG write_to entered, page.len()={}", page.len());
        ensure!(
            page.len() >= PAGE_HEADER_SIZE + META_SIZE,
            "buffer too small for meta page: {} < {}",
            page.len(),
            PAGE_HEADER_SIZE + META_SIZE
        );
        println!("DEBUG ensure passed");

        self.checksum = U64::new(self.sum64());

        let header = match PageHeader::from_bytes_mut(page) {
            Ok(h) => h,
            Err(e) => {
                println!("DEBUG from_bytes_mut error: {:?} / {}", e, e);
                return Err(e);
            }
        };
        println!("DEBUG from_bytes_mut ok");
        header.set_id(self.slot());
        header.set_flags(META_PAGE_FLAG);

        page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + META_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    /// Reads and validates a meta from a meta slot buffer.
    pub fn read_from(page: &[u8]) -> Result<Meta> {
        let header = PageHeader::from_bytes(page)?;
        ensure!(
            header.flags() & META_PAGE_FLAG != 0,
            "page {} is not a meta page (flags {:#06x})",
            header.id(),
            header.flags()
        );

        let meta: &Meta = parse_zerocopy(&page[PAGE_HEADER_SIZE..], "Meta")?;
        meta.validate()?;
        Ok(*meta)
    }
}

impl Default for Meta {
    fn default() -> Self {
        Self::new()
    }
}
