//! # Transactions
//!
//! A [`Transaction`] is the single writer of the database: it owns the
//! write gate for its whole lifetime, copies the committed meta, and
//! accumulates dirty pages in memory until commit. Page allocation
//! prefers the freelist and falls back to extending the file past the
//! high-water mark; either way the transaction's page-count statistic
//! grows by exactly the number of pages handed out.
//!
//! A [`ReadTransaction`] pins a snapshot txid in the database's reader
//! registry. It holds no pages and takes no locks; its only job is to
//! keep the freelist from recycling pages the snapshot can still see.
//! Dropping it lifts the pin.
//!
//! Commit order matters: the previous freelist span is freed, the new
//! freelist (free pool plus every pending id) is serialized into fresh
//! pages, dirty pages are flushed and synced, and only then is the meta
//! slot stamped. A crash before the meta write leaves the old snapshot
//! fully intact.

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::MutexGuard;

use crate::db::Database;
use crate::storage::{Meta, PageHeader, Pgid, Txid, PAGE_SIZE, PGID_NO_FREELIST};

/// Page accounting for one write transaction.
#[derive(Debug, Default, Clone, Copy)]
pub struct TxStats {
    page_count: u64,
    page_alloc: u64,
}

impl TxStats {
    /// Pages allocated by this transaction, freelist and high-water
    /// allocations both counted.
    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    /// Bytes allocated for pages by this transaction.
    pub fn page_alloc(&self) -> u64 {
        self.page_alloc
    }
}

pub struct Transaction<'db> {
    db: &'db Database,
    meta: Meta,
    pages: HashMap<Pgid, Box<[u8]>>,
    stats: TxStats,
    closed: bool,
    /// Write gate, held until the transaction resolves.
    _gate: Option<MutexGuard<'db, ()>>,
}

impl<'db> Transaction<'db> {
    pub(crate) fn new(db: &'db Database, meta: Meta, gate: MutexGuard<'db, ()>) -> Self {
        Self {
            db,
            meta,
            pages: HashMap::new(),
            stats: TxStats::default(),
            closed: false,
            _gate: Some(gate),
        }
    }

    pub fn id(&self) -> Txid {
        self.meta.txid()
    }

    pub fn stats(&self) -> &TxStats {
        &self.stats
    }

    /// Allocates a span of `count` contiguous pages and returns its
    /// start. The span comes from the freelist when one fits, otherwise
    /// the file is extended past the high-water mark (growing the
    /// mapping when the span reaches beyond it).
    pub fn allocate(&mut self, count: usize) -> Result<Pgid> {
        ensure!(!self.closed, "transaction already closed");
        ensure!(count > 0, "cannot allocate an empty page span");

        let from_freelist = self.db.freelist.lock().allocate(self.meta.txid(), count);
        let id = match from_freelist {
            Some(id) => id,
            None => {
                let id = self.meta.pgid();
                let needed = id + count as u64;
                let mut storage = self.db.storage.write();
                if needed > storage.page_count() {
                    storage
                        .grow(needed)
                        .wrap_err("database cannot grow for allocation")?;
                }
                self.meta.set_pgid(needed);
                id
            }
        };

        let mut buf = vec![0u8; count * PAGE_SIZE].into_boxed_slice();
        {
            let header = PageHeader::from_bytes_mut(&mut buf)?;
            header.set_id(id);
            header.set_overflow(count as u32 - 1);
        }
        self.pages.insert(id, buf);

        self.stats.page_count += count as u64;
        self.stats.page_alloc += (count * PAGE_SIZE) as u64;
        Ok(id)
    }

    /// Mutable access to a dirty page span allocated by this
    /// transaction.
    pub fn page_mut(&mut self, id: Pgid) -> Result<&mut [u8]> {
        ensure!(!self.closed, "transaction already closed");
        self.pages
            .get_mut(&id)
            .map(|buf| &mut buf[..])
            .ok_or_else(|| eyre::eyre!("page {} is not dirty in this transaction", id))
    }

    /// Frees the page span starting at `id`, staging it as pending under
    /// this transaction's txid.
    pub fn free(&mut self, id: Pgid) -> Result<()> {
        ensure!(!self.closed, "transaction already closed");

        let header: PageHeader = if let Some(buf) = self.pages.get(&id) {
            *PageHeader::from_bytes(buf)?
        } else {
            let storage = self.db.storage.read();
            *PageHeader::from_bytes(storage.page(id)?)?
        };

        self.db.freelist.lock().free(self.meta.txid(), &header)
    }

    /// Whether `id` is already free or pending.
    pub fn freed(&self, id: Pgid) -> bool {
        self.db.freelist.lock().freed(id)
    }

    pub fn commit(&mut self) -> Result<()> {
        ensure!(!self.closed, "transaction already closed");

        self.write_freelist()?;
        self.flush_pages()?;
        self.write_meta()?;

        *self.db.meta.lock() = self.meta;
        self.closed = true;
        self._gate = None;
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        ensure!(!self.closed, "transaction already closed");
        self.rollback_inner()
    }

    /// Frees the previous freelist span and serializes the current
    /// freelist (pending included) into freshly allocated pages.
    fn write_freelist(&mut self) -> Result<()> {
        let old = self.meta.freelist();
        if old != PGID_NO_FREELIST {
            self.free(old)?;
        }

        let size = self.db.freelist.lock().size();
        let count = size / PAGE_SIZE + 1;
        let id = self.allocate(count)?;

        {
            let freelist = self.db.freelist.lock();
            let buf = self
                .pages
                .get_mut(&id)
                .ok_or_else(|| eyre::eyre!("freelist page {} missing from dirty set", id))?;
            freelist.write(buf)?;
        }

        self.meta.set_freelist(id);
        Ok(())
    }

    fn flush_pages(&mut self) -> Result<()> {
        let mut storage = self.db.storage.write();

        if self.meta.pgid() > storage.page_count() {
            storage.grow(self.meta.pgid())?;
        }

        for (&id, buf) in &self.pages {
            let span = (buf.len() / PAGE_SIZE) as u64;
            storage.pages_mut(id, span)?.copy_from_slice(buf);
        }
        storage.sync()
    }

    fn write_meta(&mut self) -> Result<()> {
        let mut storage = self.db.storage.write();
        let slot = self.meta.slot();
        self.meta.write_to(storage.page_mut(slot)?)?;
        storage.sync()
    }

    /// Discards this transaction's pending frees and restores the
    /// freelist from the last committed freelist page, returning any
    /// pages this transaction had allocated to the pool.
    fn rollback_inner(&mut self) -> Result<()> {
        self.closed = true;

        let mut freelist = self.db.freelist.lock();
        self._gate = None;
        freelist.rollback(self.meta.txid());

        let committed = *self.db.meta.lock();
        if committed.freelist() != PGID_NO_FREELIST {
            let storage = self.db.storage.read();
            let span = PageHeader::from_bytes(storage.page(committed.freelist())?)?.span();
            let buf = storage.pages(committed.freelist(), span)?;
            freelist.reload(buf)?;
        }
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.rollback_inner();
        }
    }
}

/// A read-only snapshot pin. While alive, pages freed at or after its
/// txid are kept out of the free pool.
pub struct ReadTransaction<'db> {
    db: &'db Database,
    txid: Txid,
}

impl<'db> ReadTransaction<'db> {
    pub(crate) fn new(db: &'db Database, txid: Txid) -> Self {
        Self { db, txid }
    }

    pub fn id(&self) -> Txid {
        self.txid
    }
}

impl Drop for ReadTransaction<'_> {
    fn drop(&mut self) {
        let mut readers = self.db.readers.lock();
        if let Some(pos) = readers.iter().position(|&t| t == self.txid) {
            readers.swap_remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::db::Database;
    use crate::storage::{FreelistBackend, PAGE_SIZE};

    fn create_test_db(backend: FreelistBackend) -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::builder()
            .path(dir.path().join("test.adb"))
            .freelist_backend(backend)
            .open()
            .unwrap();
        (dir, db)
    }

    #[test]
    fn allocate_updates_page_count_stat() {
        for backend in [FreelistBackend::Array, FreelistBackend::Hashmap] {
            let (_dir, db) = create_test_db(backend);
            let mut tx = db.begin_rw().unwrap();

            let before = tx.stats().page_count();
            tx.allocate(3).unwrap();
            tx.allocate(1).unwrap();

            assert_eq!(tx.stats().page_count(), before + 4);
            assert_eq!(tx.stats().page_alloc(), 4 * PAGE_SIZE as u64);
        }
    }

    #[test]
    fn allocate_counts_freelist_pages_same_as_growth() {
        for backend in [FreelistBackend::Array, FreelistBackend::Hashmap] {
            let (_dir, db) = create_test_db(backend);

            // Stock the free pool with a released span.
            let mut tx = db.begin_rw().unwrap();
            let id = tx.allocate(2).unwrap();
            tx.free(id).unwrap();
            tx.commit().unwrap();

            let mut tx = db.begin_rw().unwrap();
            let free_count = db.stats().free_page_count();
            assert!(free_count >= 2);

            let before = tx.stats().page_count();
            let reused = tx.allocate(2).unwrap();

            assert_eq!(reused, id);
            assert_eq!(tx.stats().page_count(), before + 2);
        }
    }

    #[test]
    fn allocate_extends_high_water_mark() {
        let (_dir, db) = create_test_db(FreelistBackend::Array);
        let high_water = db.stats().page_count();
        let mut tx = db.begin_rw().unwrap();

        let id = tx.allocate(2).unwrap();

        assert_eq!(id, high_water);
        tx.commit().unwrap();
        assert_eq!(db.stats().page_count(), high_water + 2 + 1);
    }

    #[test]
    fn allocate_zero_pages_is_rejected() {
        let (_dir, db) = create_test_db(FreelistBackend::Array);
        let mut tx = db.begin_rw().unwrap();

        let result = tx.allocate(0);

        assert!(result.is_err());
    }

    #[test]
    fn operations_on_committed_transaction_fail() {
        let (_dir, db) = create_test_db(FreelistBackend::Array);
        let mut tx = db.begin_rw().unwrap();
        tx.commit().unwrap();

        let result = tx.allocate(1);

        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("transaction already closed"));
        assert!(tx.free(3).is_err());
        assert!(tx.commit().is_err());
    }

    #[test]
    fn free_stages_span_until_release() {
        let (_dir, db) = create_test_db(FreelistBackend::Hashmap);

        let mut tx = db.begin_rw().unwrap();
        let id = tx.allocate(3).unwrap();
        tx.commit().unwrap();

        let mut tx = db.begin_rw().unwrap();
        tx.free(id).unwrap();
        assert!(tx.freed(id));
        assert!(tx.freed(id + 2));
        tx.commit().unwrap();

        // The span stays pending until the next writer releases it.
        assert!(db.stats().pending_page_count() >= 3);
        assert_eq!(db.stats().free_page_count(), 0);

        let mut tx = db.begin_rw().unwrap();
        assert_eq!(tx.allocate(3).unwrap(), id);
        tx.commit().unwrap();
    }

    #[test]
    fn double_free_is_rejected() {
        let (_dir, db) = create_test_db(FreelistBackend::Array);
        let mut tx = db.begin_rw().unwrap();
        let id = tx.allocate(1).unwrap();
        tx.free(id).unwrap();

        let result = tx.free(id);

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("already freed"));
    }

    #[test]
    fn freeing_meta_page_is_rejected() {
        let (_dir, db) = create_test_db(FreelistBackend::Array);
        let mut tx = db.begin_rw().unwrap();

        let result = tx.free(0);

        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("cannot free meta page"));
    }

    #[test]
    fn rollback_returns_pending_frees() {
        let (_dir, db) = create_test_db(FreelistBackend::Array);

        let mut tx = db.begin_rw().unwrap();
        let id = tx.allocate(1).unwrap();
        tx.commit().unwrap();

        let mut tx = db.begin_rw().unwrap();
        tx.free(id).unwrap();
        tx.rollback().unwrap();

        assert_eq!(db.stats().pending_page_count(), 0);
        assert!(!db.freelist.lock().freed(id));
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let (_dir, db) = create_test_db(FreelistBackend::Array);
        let committed_txid = db.stats().txid();

        {
            let mut tx = db.begin_rw().unwrap();
            tx.allocate(2).unwrap();
            // Dropped without commit.
        }

        assert_eq!(db.stats().txid(), committed_txid);
        let mut tx = db.begin_rw().unwrap();
        assert_eq!(tx.id(), committed_txid + 1);
        tx.commit().unwrap();
    }

    #[test]
    fn page_mut_exposes_dirty_span() {
        let (_dir, db) = create_test_db(FreelistBackend::Array);
        let mut tx = db.begin_rw().unwrap();
        let id = tx.allocate(2).unwrap();

        let buf = tx.page_mut(id).unwrap();
        assert_eq!(buf.len(), 2 * PAGE_SIZE);
        buf[PAGE_SIZE] = 0x5A;

        assert!(tx.page_mut(id + 1).is_err());
    }
}
