//! # Database Handle
//!
//! `Database` owns the mapped file, the committed meta, the freelist,
//! and the reader registry. It enforces the single-writer/multi-reader
//! discipline: `begin_rw` takes the write gate for the transaction's
//! lifetime, while `begin_read` only pins a snapshot txid.
//!
//! ## Open Path
//!
//! A missing file is initialized with four pages: the two meta slots, an
//! empty freelist page, and an empty leaf root. An existing file has
//! both meta slots read and validated; the valid one with the highest
//! txid wins, so a commit torn before its meta write simply falls back
//! to the previous snapshot. The freelist is then loaded from the page
//! span the winning meta points at (or starts empty when the meta holds
//! the no-freelist sentinel, to be re-persisted on the next commit).
//!
//! ## Page Reclamation
//!
//! Before each write transaction starts, `free_pages` walks the sorted
//! open-reader txids: everything pending below the oldest reader is
//! released outright, and each gap between adjacent readers is offered
//! to the freelist as a `release_range`. Adjacent readers produce empty
//! gaps with `begin > end`; the freelist absorbs those as no-ops.

use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use parking_lot::{Mutex, RwLock};

use crate::storage::{
    Freelist, FreelistBackend, Meta, MmapStorage, PageHeader, Txid, LEAF_PAGE_FLAG,
    PGID_NO_FREELIST,
};
use crate::tx::{ReadTransaction, Transaction};

/// Pages reserved by a fresh database: two meta slots, the freelist
/// page, and the tree root.
const INITIAL_PAGE_COUNT: u64 = 4;

/// Point-in-time counters for a database handle.
#[derive(Debug, Clone, Copy)]
pub struct DbStats {
    free_page_count: usize,
    pending_page_count: usize,
    page_count: u64,
    txid: Txid,
}

impl DbStats {
    /// Pages immediately available for re-allocation.
    pub fn free_page_count(&self) -> usize {
        self.free_page_count
    }

    /// Freed pages still pinned by possible reader snapshots.
    pub fn pending_page_count(&self) -> usize {
        self.pending_page_count
    }

    /// Pages currently backed by the file.
    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    /// Txid of the last committed transaction.
    pub fn txid(&self) -> Txid {
        self.txid
    }
}

/// Builder for configuring and opening a database.
pub struct DatabaseBuilder {
    path: Option<PathBuf>,
    backend: FreelistBackend,
}

impl DatabaseBuilder {
    pub fn new() -> Self {
        Self {
            path: None,
            backend: FreelistBackend::default(),
        }
    }

    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Selects the free-pool representation. The choice is never
    /// persisted; an existing file may be reopened with either backend.
    pub fn freelist_backend(mut self, backend: FreelistBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn open(self) -> Result<Database> {
        let Some(path) = self.path else {
            bail!("no database path configured");
        };
        Database::open_with(path, self.backend)
    }
}

impl Default for DatabaseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct Database {
    path: PathBuf,
    pub(crate) storage: RwLock<MmapStorage>,
    pub(crate) freelist: Mutex<Freelist>,
    pub(crate) meta: Mutex<Meta>,
    pub(crate) readers: Mutex<Vec<Txid>>,
    pub(crate) write_gate: Mutex<()>,
}

impl Database {
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::new()
    }

    /// Opens the database at `path` with default options, creating the
    /// file if it does not exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::builder().path(path).open()
    }

    fn open_with(path: PathBuf, backend: FreelistBackend) -> Result<Self> {
        let storage = if path.exists() {
            MmapStorage::open(&path)
                .wrap_err_with(|| format!("failed to open database '{}'", path.display()))?
        } else {
            Self::init(&path, backend)
                .wrap_err_with(|| format!("failed to initialize database '{}'", path.display()))?
        };

        let meta = Self::load_meta(&storage)?;

        let mut freelist = Freelist::new(backend);
        Self::load_freelist(&storage, &meta, &mut freelist)?;

        Ok(Self {
            path,
            storage: RwLock::new(storage),
            freelist: Mutex::new(freelist),
            meta: Mutex::new(meta),
            readers: Mutex::new(Vec::new()),
            write_gate: Mutex::new(()),
        })
    }

    /// Lays out a fresh file: meta slots on pages 0 and 1, an empty
    /// freelist on page 2, an empty leaf root on page 3.
    fn init(path: &Path, backend: FreelistBackend) -> Result<MmapStorage> {
        let mut storage = MmapStorage::create(path, INITIAL_PAGE_COUNT)?;

        {
            let page = storage.page_mut(2)?;
            let header = PageHeader::from_bytes_mut(page)?;
            header.set_id(2);
            Freelist::new(backend).write(page)?;
        }

        {
            let page = storage.page_mut(3)?;
            let header = PageHeader::from_bytes_mut(page)?;
            header.set_id(3);
            header.set_flags(LEAF_PAGE_FLAG);
        }

        let mut meta = Meta::new();
        meta.set_root(3);
        meta.set_freelist(2);
        meta.set_pgid(INITIAL_PAGE_COUNT);
        for txid in 0..2 {
            meta.set_txid(txid);
            meta.write_to(storage.page_mut(txid % 2)?)?;
        }

        storage.sync()?;
        Ok(storage)
    }

    /// Reads both meta slots and returns the valid one with the highest
    /// txid.
    fn load_meta(storage: &MmapStorage) -> Result<Meta> {
        let slot_a = Meta::read_from(storage.page(0)?);
        let slot_b = Meta::read_from(storage.page(1)?);

        match (slot_a, slot_b) {
            (Ok(a), Ok(b)) => Ok(if a.txid() >= b.txid() { a } else { b }),
            (Ok(a), Err(_)) => Ok(a),
            (Err(_), Ok(b)) => Ok(b),
            (Err(a), Err(_)) => Err(a).wrap_err("both meta pages are invalid"),
        }
    }

    fn load_freelist(storage: &MmapStorage, meta: &Meta, freelist: &mut Freelist) -> Result<()> {
        if meta.freelist() == PGID_NO_FREELIST {
            // Nothing persisted; the next commit writes a fresh page.
            return Ok(());
        }

        let head = PageHeader::from_bytes(storage.page(meta.freelist())?)?;
        let buf = storage.pages(meta.freelist(), head.span())?;
        freelist
            .read(buf)
            .wrap_err_with(|| format!("failed to load freelist page {}", meta.freelist()))?;

        if let Some(&max) = freelist.free_page_ids().last() {
            ensure!(
                max < meta.pgid(),
                "freelist references page {} beyond high water mark {}",
                max,
                meta.pgid()
            );
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> DbStats {
        let freelist = self.freelist.lock();
        DbStats {
            free_page_count: freelist.free_count(),
            pending_page_count: freelist.pending_count(),
            page_count: self.storage.read().page_count(),
            txid: self.meta.lock().txid(),
        }
    }

    /// Starts the write transaction. Blocks while another writer is
    /// active; releases reclaimable pending pages before handing over.
    pub fn begin_rw(&self) -> Result<Transaction<'_>> {
        let gate = self.write_gate.lock();

        {
            let mut freelist = self.freelist.lock();
            self.free_pages(&mut freelist);
        }

        let mut meta = *self.meta.lock();
        meta.set_txid(meta.txid() + 1);
        Ok(Transaction::new(self, meta, gate))
    }

    /// Pins the current committed snapshot for reading.
    pub fn begin_read(&self) -> ReadTransaction<'_> {
        let txid = self.meta.lock().txid();
        self.readers.lock().push(txid);
        ReadTransaction::new(self, txid)
    }

    /// Releases every pending page no open reader can still observe:
    /// everything below the oldest reader, then each alloc-to-free
    /// extent confined to a gap between adjacent readers.
    fn free_pages(&self, freelist: &mut Freelist) {
        let mut readers = self.readers.lock().clone();
        readers.sort_unstable();

        let mut minid = Txid::MAX;
        if let Some(&oldest) = readers.first() {
            minid = oldest;
        }
        if minid > 0 {
            freelist.release(minid - 1);
        }
        for &txid in &readers {
            freelist.release_range(minid, txid.saturating_sub(1));
            minid = txid + 1;
        }
        freelist.release_range(minid, Txid::MAX);
    }
}
