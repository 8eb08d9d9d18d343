//! # Freelist Management
//!
//! This module tracks which pages of the database file are free for
//! reuse, and decides *when* a freed page may actually be handed out
//! again. Under copy-on-write MVCC that second question is the hard one:
//! a page freed by transaction `t` may still be visible to a reader
//! whose snapshot predates `t`, so it must not be overwritten until
//! every such reader is gone.
//!
//! ## Pools
//!
//! The freelist keeps freed pages in two pools:
//!
//! - **free**: pages no live reader can observe; immediately allocatable.
//! - **pending**: pages freed by some transaction, keyed by the freeing
//!   txid, waiting for older readers to finish. Each pending id also
//!   remembers the txid that originally *allocated* it, which lets
//!   [`Freelist::release_range`] reclaim pages whose whole
//!   alloc-to-free lifetime fits between two live readers.
//!
//! A `cache` set holds the union of both pools so `freed(id)` is O(1);
//! the tree uses it to avoid double-freeing overflow pages.
//!
//! ## Backends
//!
//! The free pool itself has two interchangeable representations chosen
//! at open time and never persisted: a sorted id vector with linear-scan
//! allocation ([`array`]) and a span-indexed hashmap with constant-time
//! allocation ([`map`]). Both are observationally equivalent except for
//! which span `allocate` picks among equals.
//!
//! ## Wire Format
//!
//! At commit the whole freelist is serialized onto one or more
//! contiguous freelist pages, free pool *and* pending together: after a
//! crash only the committed page is trusted, so pending ids must be in
//! it or they would leak.
//!
//! ```text
//! +--------------------+----------------------------------+
//! | PageHeader         | pgid[] ascending, little-endian  |
//! |   flags |= 0x10    |                                  |
//! |   count = N        | (N ids)                          |
//! +--------------------+----------------------------------+
//! ```
//!
//! When `N >= 0xFFFF` the 16-bit count field cannot hold it: `count` is
//! set to `0xFFFF` and the real length is stored as the first `u64` of
//! the payload. This encoding is shared with existing files and must not
//! change.

mod array;
mod map;

use eyre::{ensure, Result};
use hashbrown::{HashMap, HashSet};
use smallvec::SmallVec;
use zerocopy::little_endian::U64;
use zerocopy::FromBytes;

use super::page::{PageHeader, Pgid, Txid, FREELIST_PAGE_FLAG};
use super::PAGE_HEADER_SIZE;
use array::ArrayFreelist;
use map::MapFreelist;

/// Count-field value signalling that the real id count is stored as the
/// first payload word.
const COUNT_OVERFLOW: u16 = 0xFFFF;

/// Free-pool representation, selected at open and never persisted; a
/// database may be reopened with either backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FreelistBackend {
    #[default]
    Array,
    Hashmap,
}

/// Pages freed by one transaction, parallel with the txids that
/// originally allocated them.
#[derive(Debug, Default)]
struct TxPending {
    ids: SmallVec<[Pgid; 16]>,
    alloctx: SmallVec<[Txid; 16]>,
    last_release_begin: Txid,
}

#[derive(Debug)]
enum Backend {
    Array(ArrayFreelist),
    Map(MapFreelist),
}

#[derive(Debug)]
pub struct Freelist {
    backend: Backend,
    /// Allocating txid per handed-out span start, consumed on free.
    allocs: HashMap<Pgid, Txid>,
    pending: HashMap<Txid, TxPending>,
    /// Union of the free pool and all pending ids.
    cache: HashSet<Pgid>,
}

impl Freelist {
    pub fn new(backend: FreelistBackend) -> Self {
        let backend = match backend {
            FreelistBackend::Array => Backend::Array(ArrayFreelist::default()),
            FreelistBackend::Hashmap => Backend::Map(MapFreelist::default()),
        };
        Self {
            backend,
            allocs: HashMap::new(),
            pending: HashMap::new(),
            cache: HashSet::new(),
        }
    }

    /// Total pages tracked, free and pending together.
    pub fn count(&self) -> usize {
        self.free_count() + self.pending_count()
    }

    pub fn free_count(&self) -> usize {
        match &self.backend {
            Backend::Array(a) => a.free_count(),
            Backend::Map(m) => m.free_count(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(|txp| txp.ids.len()).sum()
    }

    /// Whether `pgid` is in the free pool or pending.
    pub fn freed(&self, pgid: Pgid) -> bool {
        self.cache.contains(&pgid)
    }

    /// All free-pool ids, ascending.
    pub fn free_page_ids(&self) -> Vec<Pgid> {
        match &self.backend {
            Backend::Array(a) => a.free_page_ids(),
            Backend::Map(m) => m.free_page_ids(),
        }
    }

    /// Stages a page span freed by transaction `txid` as pending. Every
    /// id of the span records the txid that allocated it, so
    /// `release_range` can judge each id's full lifetime.
    pub fn free(&mut self, txid: Txid, page: &PageHeader) -> Result<()> {
        let id = page.id();
        ensure!(id > 1, "cannot free meta page {}", id);

        let alloc_txid = match self.allocs.remove(&id) {
            Some(tx) => tx,
            // The freelist span is always written by the previous commit.
            None if page.flags() & FREELIST_PAGE_FLAG != 0 => txid.saturating_sub(1),
            None => 0,
        };

        let txp = self.pending.entry(txid).or_default();
        for pid in id..=page.span_end() {
            ensure!(self.cache.insert(pid), "page {} already freed", pid);
            txp.ids.push(pid);
            txp.alloctx.push(alloc_txid);
        }
        Ok(())
    }

    /// Moves all pages pending under txids `<= txid` into the free pool.
    /// Monotone: an increasing sequence of calls ends in the same state
    /// as one call with the maximum.
    pub fn release(&mut self, txid: Txid) {
        let mut released: Vec<Pgid> = Vec::new();
        self.pending.retain(|&tid, txp| {
            if tid <= txid {
                released.extend_from_slice(&txp.ids);
                false
            } else {
                true
            }
        });
        released.sort_unstable();
        self.merge_spans(&released);
    }

    /// Moves into the free pool exactly those pending ids whose freeing
    /// txid *and* recorded alloc txid both lie in `[begin, end]`: no
    /// reader in that gap can have observed the page at all. A
    /// `begin > end` range is the caller's way of saying two live
    /// readers are adjacent, and is a no-op.
    pub fn release_range(&mut self, begin: Txid, end: Txid) {
        if begin > end {
            return;
        }

        let mut released: Vec<Pgid> = Vec::new();
        self.pending.retain(|&tid, txp| {
            if tid < begin || tid > end {
                return true;
            }
            // Ranges repeat between writes; skip already-scanned entries.
            if txp.last_release_begin == begin {
                return true;
            }

            let mut i = 0;
            while i < txp.ids.len() {
                let atx = txp.alloctx[i];
                if atx < begin || atx > end {
                    i += 1;
                    continue;
                }
                released.push(txp.ids.swap_remove(i));
                txp.alloctx.swap_remove(i);
            }
            txp.last_release_begin = begin;
            !txp.ids.is_empty()
        });
        released.sort_unstable();
        self.merge_spans(&released);
    }

    /// Discards transaction `txid`'s pending pages and this txid's
    /// allocation records; the caller is expected to reload the freelist
    /// from its committed page afterwards.
    pub fn rollback(&mut self, txid: Txid) {
        if let Some(txp) = self.pending.remove(&txid) {
            for id in txp.ids {
                self.cache.remove(&id);
            }
        }
        self.allocs.retain(|_, &mut tx| tx != txid);
    }

    /// Allocates a span of `n` contiguous free pages for transaction
    /// `txid`, returning its start. `None` means the caller must extend
    /// the file. `n = 0` is a no-op.
    pub fn allocate(&mut self, txid: Txid, n: usize) -> Option<Pgid> {
        if n == 0 {
            return None;
        }

        let start = match &mut self.backend {
            Backend::Array(a) => a.allocate(n),
            Backend::Map(m) => m.allocate(n),
        }?;

        for id in start..start + n as u64 {
            self.cache.remove(&id);
        }
        self.allocs.insert(start, txid);
        Some(start)
    }

    /// Replaces the free pool with `ids` and rebuilds the cache. Pending
    /// entries are untouched.
    pub fn read_ids(&mut self, mut ids: Vec<Pgid>) {
        ids.sort_unstable();
        match &mut self.backend {
            Backend::Array(a) => a.read_ids(ids),
            Backend::Map(m) => m.read_ids(&ids),
        }
        self.reindex();
    }

    /// Decodes a serialized freelist span and loads it as the free pool.
    pub fn read(&mut self, page: &[u8]) -> Result<()> {
        let header = PageHeader::from_bytes(page)?;
        ensure!(
            header.flags() & FREELIST_PAGE_FLAG != 0,
            "page {} is not a freelist page (flags {:#06x})",
            header.id(),
            header.flags()
        );

        let data = &page[PAGE_HEADER_SIZE..];
        let mut skip = 0usize;
        let mut count = header.count() as usize;
        if count == COUNT_OVERFLOW as usize {
            // Real length lives in the first payload word.
            let word: &U64 = super::parse_zerocopy(data, "freelist length word")?;
            skip = 1;
            count = word.get() as usize;
        }

        let need = (skip + count) * size_of::<Pgid>();
        ensure!(
            data.len() >= need,
            "freelist page truncated: {} ids need {} bytes, page has {}",
            count,
            need,
            data.len()
        );

        let words = <[U64]>::ref_from_bytes(&data[..need])
            .map_err(|e| eyre::eyre!("failed to parse freelist ids: {:?}", e))?;
        let ids: Vec<Pgid> = words[skip..].iter().map(|w| w.get()).collect();

        for w in ids.windows(2) {
            ensure!(
                w[0] < w[1],
                "freelist ids out of order: {} then {}",
                w[0],
                w[1]
            );
        }

        self.read_ids(ids);
        Ok(())
    }

    /// Serializes the free pool plus all pending ids, ascending, into a
    /// page buffer the caller has sized via [`Freelist::size`].
    pub fn write(&self, page: &mut [u8]) -> Result<()> {
        let (head, data) = page.split_at_mut(PAGE_HEADER_SIZE);
        let header = PageHeader::from_bytes_mut(head)?;
        header.set_flags(header.flags() | FREELIST_PAGE_FLAG);

        let count = self.count();
        let skip = if count >= COUNT_OVERFLOW as usize { 1 } else { 0 };
        let need = (skip + count) * size_of::<Pgid>();
        ensure!(
            data.len() >= need,
            "freelist of {} ids does not fit: need {} bytes, have {}",
            count,
            need,
            data.len()
        );

        if count == 0 {
            header.set_count(0);
            return Ok(());
        }

        let words = <[U64]>::mut_from_bytes(&mut data[..need])
            .map_err(|e| eyre::eyre!("failed to map freelist ids: {:?}", e))?;
        if skip == 1 {
            header.set_count(COUNT_OVERFLOW);
            words[0] = U64::new(count as u64);
        } else {
            header.set_count(count as u16);
        }
        self.copy_all(&mut words[skip..]);
        Ok(())
    }

    /// Re-reads a committed freelist page, then drops any ids we still
    /// hold as pending: the committed page includes them, and counting
    /// them in both pools would hand the same page out twice.
    pub fn reload(&mut self, page: &[u8]) -> Result<()> {
        self.read(page)?;

        let pending: HashSet<Pgid> = self
            .pending
            .values()
            .flat_map(|txp| txp.ids.iter().copied())
            .collect();

        let available: Vec<Pgid> = self
            .free_page_ids()
            .into_iter()
            .filter(|id| !pending.contains(id))
            .collect();
        self.read_ids(available);
        Ok(())
    }

    /// Serialized size in bytes, header included.
    pub fn size(&self) -> usize {
        let mut n = self.count();
        if n >= COUNT_OVERFLOW as usize {
            n += 1;
        }
        PAGE_HEADER_SIZE + size_of::<Pgid>() * n
    }

    /// Merge-writes the sorted free pool and sorted pending ids into
    /// `dst`, which must hold exactly `count()` words.
    fn copy_all(&self, dst: &mut [U64]) {
        let mut pending: Vec<Pgid> = Vec::with_capacity(self.pending_count());
        for txp in self.pending.values() {
            pending.extend_from_slice(&txp.ids);
        }
        pending.sort_unstable();

        let free = self.free_page_ids();
        debug_assert_eq!(dst.len(), free.len() + pending.len());

        let (mut i, mut j) = (0, 0);
        for slot in dst.iter_mut() {
            let id = if i < free.len() && (j >= pending.len() || free[i] <= pending[j]) {
                i += 1;
                free[i - 1]
            } else {
                j += 1;
                pending[j - 1]
            };
            *slot = U64::new(id);
        }
    }

    /// Feeds released ids (sorted) into the backend's merge path.
    fn merge_spans(&mut self, ids: &[Pgid]) {
        match &mut self.backend {
            Backend::Array(a) => a.merge_ids(ids),
            Backend::Map(m) => {
                for &id in ids {
                    m.merge_with_existing_span(id);
                }
            }
        }
    }

    /// Rebuilds the cache as free pool plus pending.
    fn reindex(&mut self) {
        self.cache = self.free_page_ids().into_iter().collect();
        for txp in self.pending.values() {
            self.cache.extend(txp.ids.iter().copied());
        }
    }
}
