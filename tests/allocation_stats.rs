//! # Allocation Accounting Tests
//!
//! A transaction's page-count statistic must grow by exactly the number
//! of pages handed out, whether a span comes from the freelist or from
//! extending the file past the high-water mark.

use aspendb::{Database, FreelistBackend, PAGE_SIZE};

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
fn test_draining_the_freelist_counts_every_page() {
    for backend in [FreelistBackend::Array, FreelistBackend::Hashmap] {
        let (_dir, db) = create_test_db(backend);

        // Stock the pool: allocate, free, and let the next writer
        // release the pending pages.
        let mut tx = db.begin_rw().unwrap();
        let ids: Vec<_> = (0..3).map(|_| tx.allocate(1).unwrap()).collect();
        tx.commit().unwrap();

        let mut tx = db.begin_rw().unwrap();
        for &id in &ids {
            tx.free(id).unwrap();
        }
        tx.commit().unwrap();

        let tx = db.begin_rw().unwrap();
        drop(tx);

        let free_count = db.stats().free_page_count();
        assert!(free_count >= 3);

        let mut tx = db.begin_rw().unwrap();
        let before = tx.stats().page_count();
        for _ in 0..free_count {
            tx.allocate(1).unwrap();
        }

        assert_eq!(tx.stats().page_count(), before + free_count as u64);
        assert_eq!(
            tx.stats().page_alloc(),
            free_count as u64 * PAGE_SIZE as u64
        );
        drop(tx);
    }
}

#[test]
fn test_high_water_allocations_count_the_same() {
    for backend in [FreelistBackend::Array, FreelistBackend::Hashmap] {
        let (_dir, db) = create_test_db(backend);
        let mut tx = db.begin_rw().unwrap();

        tx.allocate(4).unwrap();
        tx.allocate(1).unwrap();
        tx.allocate(2).unwrap();

        assert_eq!(tx.stats().page_count(), 7);
        assert_eq!(tx.stats().page_alloc(), 7 * PAGE_SIZE as u64);
        drop(tx);
    }
}

#[test]
fn test_mixed_pool_and_growth_allocations() {
    let (_dir, db) = create_test_db(FreelistBackend::Hashmap);

    let mut tx = db.begin_rw().unwrap();
    let id = tx.allocate(2).unwrap();
    tx.commit().unwrap();

    let mut tx = db.begin_rw().unwrap();
    tx.free(id).unwrap();
    tx.commit().unwrap();

    let tx = db.begin_rw().unwrap();
    drop(tx);

    // One span from the pool, one from growth; both counted once.
    let high_water = db.stats().page_count();
    let mut tx = db.begin_rw().unwrap();
    let reused = tx.allocate(2).unwrap();
    let grown = tx.allocate(8).unwrap();

    assert_eq!(reused, id);
    assert_eq!(grown, high_water);
    assert_eq!(tx.stats().page_count(), 10);
    drop(tx);
}
