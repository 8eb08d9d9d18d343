//! # Memory-Mapped File Storage
//!
//! `MmapStorage` maps the single database file into the process address
//! space and hands out bounds-checked page slices. Pages are addressed
//! by 64-bit id; a span of contiguous pages (a base page plus its
//! overflow pages) can be borrowed as one slice, which is how multi-page
//! freelists and overflow values are read and written.
//!
//! ## Safety Considerations
//!
//! A mapped region becomes invalid when the file is grown and remapped.
//! Rather than runtime guards, the borrow checker enforces safety:
//! `page()`/`pages()` borrow `&self` while `grow()` takes `&mut self`,
//! so no page slice can be live across a remap. Writers serialize all
//! growth behind the database's single-writer gate.
//!
//! ## Durability
//!
//! `sync()` flushes the mapping with `msync`-equivalent semantics. The
//! commit path flushes data pages before stamping the meta slot and
//! flushes again after, so a torn commit is always detected by the meta
//! checksum rather than silently read.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use super::page::Pgid;
use super::PAGE_SIZE;

#[derive(Debug)]
pub struct MmapStorage {
    file: File,
    mmap: MmapMut,
    page_count: u64,
}

impl MmapStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let metadata = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?;

        let file_size = metadata.len();

        ensure!(
            file_size > 0,
            "cannot open empty database file '{}'",
            path.display()
        );

        ensure!(
            file_size % PAGE_SIZE as u64 == 0,
            "database file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            PAGE_SIZE
        );

        let page_count = file_size / PAGE_SIZE as u64;

        // SAFETY: MmapMut::map_mut is unsafe because memory-mapped files
        // can be modified externally, leading to undefined behavior.
        // This is safe because:
        // 1. The file is opened read+write and owned by this handle
        // 2. Database files are not meant to be modified by external
        //    processes while open
        // 3. The mmap lifetime is tied to MmapStorage, preventing
        //    use-after-unmap
        // 4. All access goes through page()/pages() which bounds-check
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_count,
        })
    }

    pub fn create<P: AsRef<Path>>(path: P, initial_page_count: u64) -> Result<Self> {
        let path = path.as_ref();

        ensure!(
            initial_page_count > 0,
            "initial page count must be at least 1"
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create database file '{}'", path.display()))?;

        let file_size = initial_page_count * PAGE_SIZE as u64;

        file.set_len(file_size)
            .wrap_err_with(|| format!("failed to set file size to {} bytes", file_size))?;

        // SAFETY: same argument as open(); additionally the file was just
        // created with truncate=true, so no other mapping of it exists.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_count: initial_page_count,
        })
    }

    pub fn page(&self, id: Pgid) -> Result<&[u8]> {
        self.pages(id, 1)
    }

    pub fn page_mut(&mut self, id: Pgid) -> Result<&mut [u8]> {
        self.pages_mut(id, 1)
    }

    /// Borrows `count` contiguous pages starting at `id` as one slice.
    pub fn pages(&self, id: Pgid, count: u64) -> Result<&[u8]> {
        self.check_span(id, count)?;
        let offset = id as usize * PAGE_SIZE;
        let len = count as usize * PAGE_SIZE;
        Ok(&self.mmap[offset..offset + len])
    }

    pub fn pages_mut(&mut self, id: Pgid, count: u64) -> Result<&mut [u8]> {
        self.check_span(id, count)?;
        let offset = id as usize * PAGE_SIZE;
        let len = count as usize * PAGE_SIZE;
        Ok(&mut self.mmap[offset..offset + len])
    }

    fn check_span(&self, id: Pgid, count: u64) -> Result<()> {
        ensure!(count > 0, "page span must cover at least one page");
        ensure!(
            id < self.page_count && count <= self.page_count - id,
            "page span {}..{} out of bounds (page_count={})",
            id,
            id + count,
            self.page_count
        );
        Ok(())
    }

    pub fn grow(&mut self, new_page_count: u64) -> Result<()> {
        if new_page_count <= self.page_count {
            return Ok(());
        }

        self.mmap
            .flush_async()
            .wrap_err("failed to flush mmap before grow")?;

        let new_size = new_page_count * PAGE_SIZE as u64;

        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to extend file to {} bytes", new_size))?;

        // SAFETY: MmapMut::map_mut is unsafe because the old mmap becomes
        // invalid. This is safe because:
        // 1. grow() takes &mut self, so no page slices exist (borrow
        //    checker)
        // 2. The old mapping was flushed above
        // 3. The file was extended to new_size before remapping
        // 4. The old mmap is dropped when the new one is assigned
        self.mmap =
            unsafe { MmapMut::map_mut(&self.file).wrap_err("failed to remap file after grow")? };

        self.page_count = new_page_count;

        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync mmap to disk")
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    pub fn file_size(&self) -> u64 {
        self.page_count * PAGE_SIZE as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_storage(page_count: u64) -> (tempfile::TempDir, MmapStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = MmapStorage::create(dir.path().join("test.adb"), page_count).unwrap();
        (dir, storage)
    }

    #[test]
    fn create_sizes_file_to_page_count() {
        let (_dir, storage) = create_test_storage(4);

        assert_eq!(storage.page_count(), 4);
        assert_eq!(storage.file_size(), 4 * PAGE_SIZE as u64);
    }

    #[test]
    fn create_rejects_zero_pages() {
        let dir = tempfile::tempdir().unwrap();

        let result = MmapStorage::create(dir.path().join("test.adb"), 0);

        assert!(result.is_err());
    }

    #[test]
    fn page_round_trips_written_bytes() {
        let (_dir, mut storage) = create_test_storage(4);

        storage.page_mut(2).unwrap()[0..4].copy_from_slice(b"adbx");

        assert_eq!(&storage.page(2).unwrap()[0..4], b"adbx");
    }

    #[test]
    fn pages_spans_contiguous_pages() {
        let (_dir, mut storage) = create_test_storage(4);

        let span = storage.pages_mut(1, 3).unwrap();
        assert_eq!(span.len(), 3 * PAGE_SIZE);
        span[PAGE_SIZE] = 0xAB;

        assert_eq!(storage.page(2).unwrap()[0], 0xAB);
    }

    #[test]
    fn page_out_of_bounds_is_rejected() {
        let (_dir, storage) = create_test_storage(4);

        let result = storage.page(4);

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("out of bounds"));
    }

    #[test]
    fn pages_span_past_end_is_rejected() {
        let (_dir, storage) = create_test_storage(4);

        let result = storage.pages(3, 2);

        assert!(result.is_err());
    }

    #[test]
    fn grow_extends_file_and_preserves_data() {
        let (_dir, mut storage) = create_test_storage(2);
        storage.page_mut(1).unwrap()[0] = 0x42;

        storage.grow(8).unwrap();

        assert_eq!(storage.page_count(), 8);
        assert_eq!(storage.page(1).unwrap()[0], 0x42);
        assert!(storage.page(7).is_ok());
    }

    #[test]
    fn grow_to_smaller_count_is_noop() {
        let (_dir, mut storage) = create_test_storage(4);

        storage.grow(2).unwrap();

        assert_eq!(storage.page_count(), 4);
    }

    #[test]
    fn open_rejects_file_with_partial_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.adb");
        std::fs::write(&path, vec![0u8; PAGE_SIZE + 1]).unwrap();

        let result = MmapStorage::open(&path);

        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("not a multiple of page size"));
    }

    #[test]
    fn open_reads_back_created_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.adb");
        {
            let mut storage = MmapStorage::create(&path, 3).unwrap();
            storage.page_mut(2).unwrap()[7] = 0x07;
            storage.sync().unwrap();
        }

        let storage = MmapStorage::open(&path).unwrap();

        assert_eq!(storage.page_count(), 3);
        assert_eq!(storage.page(2).unwrap()[7], 0x07);
    }
}
