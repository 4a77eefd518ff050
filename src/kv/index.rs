//! The memory-mapped open-addressing hash index.
//!
//! Buckets are 128 bytes, cacheline-sized, found by linear probing from
//! `key mod bucket_count`. The first word of each bucket is a two-state
//! spinlock (0 free, 1 held) acquired with a compare-exchange and released
//! with a plain release store; the second word is set exactly once, with
//! release ordering, when a bucket is claimed for a key. The key and
//! history entries are plain memory protected by the lock word's
//! happens-before edges.

use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use memmap2::MmapMut;
use zerocopy::{FromBytes, IntoBytes};

use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::kv::layout::{
    HistoryEntry, BUCKET_HISTORY_OFFSET, BUCKET_IN_USE_OFFSET, BUCKET_KEY_OFFSET,
    BUCKET_LOCK_OFFSET, BUCKET_SIZE, HEADER_ALL_SYNCED_OFFSET, HEADER_COUNTER_OFFSET,
    HEADER_SIZE, HEADER_WRITE_INTERRUPTED_OFFSET, HISTORY_DEPTH,
};

pub(crate) struct MappedIndex {
    // Kept alive for the mapping; all access goes through `base`.
    _map: MmapMut,
    base: *mut u8,
    len: u64,
    buckets: u64,
}

// Shared mutable access to the mapping is mediated entirely by the atomic
// words below; the raw pointer itself is never handed out.
unsafe impl Send for MappedIndex {}
unsafe impl Sync for MappedIndex {}

impl std::fmt::Debug for MappedIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedIndex")
            .field("len", &self.len)
            .field("buckets", &self.buckets)
            .finish()
    }
}

impl MappedIndex {
    /// Maps `index_file`, whose length must already cover the header and a
    /// whole number of buckets.
    pub(crate) fn map(index_file: &Handle, len: u64) -> Result<MappedIndex> {
        if len < HEADER_SIZE {
            return Err(Error::CorruptedStore);
        }
        let buckets = (len - HEADER_SIZE) / BUCKET_SIZE;
        if buckets == 0 {
            return Err(Error::CorruptedStore);
        }
        let mut map = unsafe {
            memmap2::MmapOptions::new()
                .len(len as usize)
                .map_mut(index_file.as_raw_fd())
        }
        .map_err(Error::from)?;
        let base = map.as_mut_ptr();
        Ok(MappedIndex { _map: map, base, len, buckets })
    }

    pub(crate) fn bucket_count(&self) -> u64 {
        self.buckets
    }

    fn at(&self, offset: u64) -> *mut u8 {
        debug_assert!(offset < self.len);
        unsafe { self.base.add(offset as usize) }
    }

    /// The global transaction counter, updated with compare-exchange by
    /// committing writers.
    pub(crate) fn transaction_counter(&self) -> &AtomicU64 {
        unsafe { &*(self.at(HEADER_COUNTER_OFFSET) as *const AtomicU64) }
    }

    pub(crate) fn write_interrupted(&self) -> &AtomicU8 {
        unsafe { &*(self.at(HEADER_WRITE_INTERRUPTED_OFFSET) as *const AtomicU8) }
    }

    pub(crate) fn all_writes_synced(&self) -> &AtomicU8 {
        unsafe { &*(self.at(HEADER_ALL_SYNCED_OFFSET) as *const AtomicU8) }
    }

    fn lock_word(&self, bucket: u64) -> &AtomicU32 {
        let off = HEADER_SIZE + bucket * BUCKET_SIZE + BUCKET_LOCK_OFFSET;
        unsafe { &*(self.at(off) as *const AtomicU32) }
    }

    fn in_use_word(&self, bucket: u64) -> &AtomicU32 {
        let off = HEADER_SIZE + bucket * BUCKET_SIZE + BUCKET_IN_USE_OFFSET;
        unsafe { &*(self.at(off) as *const AtomicU32) }
    }

    fn lock_bucket(&self, bucket: u64) -> BucketGuard<'_> {
        let word = self.lock_word(bucket);
        let mut spins = 0u32;
        loop {
            if word
                .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return BucketGuard { index: self, bucket };
            }
            spins += 1;
            if spins < 1000 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    fn start_bucket(&self, key: u128) -> u64 {
        (key % self.buckets as u128) as u64
    }

    // Reads the key of an in-use bucket without taking its lock. Safe
    // because the key bytes are written before the in-use word's release
    // store and never change afterwards; probing therefore never blocks on
    // buckets other transactions hold, which is what makes the sorted
    // multi-bucket locking of commits deadlock-free.
    fn key_at(&self, bucket: u64) -> u128 {
        let mut bytes = [0u8; 16];
        let off = HEADER_SIZE + bucket * BUCKET_SIZE + BUCKET_KEY_OFFSET;
        unsafe { std::ptr::copy_nonoverlapping(self.at(off), bytes.as_mut_ptr(), 16) };
        u128::from_le_bytes(bytes)
    }

    /// Finds the locked bucket holding `key`. `None` when probing reaches
    /// a never-used bucket first.
    pub(crate) fn lookup(&self, key: u128) -> Option<BucketGuard<'_>> {
        let start = self.start_bucket(key);
        for probe in 0..self.buckets {
            let bucket = (start + probe) % self.buckets;
            if self.in_use_word(bucket).load(Ordering::Acquire) == 0 {
                return None;
            }
            if self.key_at(bucket) == key {
                return Some(self.lock_bucket(bucket));
            }
        }
        None
    }

    /// Finds the locked bucket holding `key`, claiming a fresh bucket if
    /// the key has none yet. Fails `NoBufferSpace` when the table is full.
    pub(crate) fn lookup_or_insert(&self, key: u128) -> Result<BucketGuard<'_>> {
        let start = self.start_bucket(key);
        for probe in 0..self.buckets {
            let bucket = (start + probe) % self.buckets;
            if self.in_use_word(bucket).load(Ordering::Acquire) == 0 {
                let guard = self.lock_bucket(bucket);
                if self.in_use_word(bucket).load(Ordering::Relaxed) == 0 {
                    // Claim: the key is published by the in-use release
                    // store.
                    guard.set_key(key);
                    self.in_use_word(bucket).store(1, Ordering::Release);
                    return Ok(guard);
                }
                // Lost the claim race; fall through to the key check.
                drop(guard);
            }
            if self.key_at(bucket) == key {
                return Ok(self.lock_bucket(bucket));
            }
        }
        Err(Error::NoBufferSpace)
    }
}

/// A locked bucket. The lock is released on drop.
#[derive(Debug)]
pub(crate) struct BucketGuard<'a> {
    index: &'a MappedIndex,
    bucket: u64,
}

impl BucketGuard<'_> {
    fn field_ptr(&self, offset: u64) -> *mut u8 {
        self.index
            .at(HEADER_SIZE + self.bucket * BUCKET_SIZE + offset)
    }

    pub(crate) fn key(&self) -> u128 {
        let mut bytes = [0u8; 16];
        unsafe {
            std::ptr::copy_nonoverlapping(self.field_ptr(BUCKET_KEY_OFFSET), bytes.as_mut_ptr(), 16)
        };
        u128::from_le_bytes(bytes)
    }

    fn set_key(&self, key: u128) {
        let bytes = key.to_le_bytes();
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.field_ptr(BUCKET_KEY_OFFSET), 16)
        };
    }

    /// Reads history entry `revision`, 0 = newest.
    pub(crate) fn history(&self, revision: usize) -> HistoryEntry {
        debug_assert!(revision < HISTORY_DEPTH);
        let mut bytes = [0u8; 24];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.field_ptr(BUCKET_HISTORY_OFFSET + revision as u64 * 24),
                bytes.as_mut_ptr(),
                24,
            )
        };
        HistoryEntry::read_from_bytes(&bytes).expect("24 bytes is exactly one entry")
    }

    fn write_history(&self, revision: usize, entry: HistoryEntry) {
        debug_assert!(revision < HISTORY_DEPTH);
        unsafe {
            std::ptr::copy_nonoverlapping(
                entry.as_bytes().as_ptr(),
                self.field_ptr(BUCKET_HISTORY_OFFSET + revision as u64 * 24),
                24,
            )
        };
    }

    /// Demotes the existing versions and installs `entry` as newest.
    pub(crate) fn push_history(&self, entry: HistoryEntry) {
        for revision in (1..HISTORY_DEPTH).rev() {
            self.write_history(revision, self.history(revision - 1));
        }
        self.write_history(0, entry);
    }

    /// Inserts `entry` keeping counters descending, for the repair scan
    /// which discovers versions out of order. Entries older than the whole
    /// window are dropped.
    pub(crate) fn insert_history_sorted(&self, entry: HistoryEntry) {
        let seq = entry.transaction_counter.get();
        let mut slot = HISTORY_DEPTH;
        for revision in 0..HISTORY_DEPTH {
            let existing = self.history(revision);
            if existing.is_vacant() {
                slot = revision;
                break;
            }
            if existing.transaction_counter.get() == seq {
                return;
            }
            if existing.transaction_counter.get() < seq {
                slot = revision;
                break;
            }
        }
        if slot == HISTORY_DEPTH {
            return;
        }
        for revision in (slot + 1..HISTORY_DEPTH).rev() {
            self.write_history(revision, self.history(revision - 1));
        }
        self.write_history(slot, entry);
    }
}

impl Drop for BucketGuard<'_> {
    fn drop(&mut self) {
        self.index.lock_word(self.bucket).store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent;
    use crate::handle::{CachingMode, Creation, Mode, OpenFlags};
    use std::path::Path;

    fn fresh_index(buckets: u64) -> (tempfile::TempDir, Handle, MappedIndex) {
        let dir = tempfile::tempdir().unwrap();
        let base = Handle::directory(
            None,
            dir.path(),
            Mode::Read,
            Creation::OpenExisting,
            CachingMode::All,
            OpenFlags::empty(),
        )
        .unwrap();
        let file = Handle::file(
            Some(&base),
            Path::new("index"),
            Mode::Write,
            Creation::OnlyIfNotExist,
            CachingMode::All,
            OpenFlags::empty(),
        )
        .unwrap();
        // Exact size: the bucket count is derived from the file length.
        let len = HEADER_SIZE + buckets * BUCKET_SIZE;
        extent::truncate(&file, len).unwrap();
        let index = MappedIndex::map(&file, len).unwrap();
        assert_eq!(index.bucket_count(), buckets);
        (dir, file, index)
    }

    #[test]
    fn lookup_of_absent_key_is_none() {
        let (_d, _f, index) = fresh_index(10);
        assert!(index.lookup(42).is_none());
    }

    #[test]
    fn insert_then_lookup() {
        let (_d, _f, index) = fresh_index(10);
        {
            let b = index.lookup_or_insert(42).unwrap();
            b.push_history(HistoryEntry::new(1, 4, 0, 100));
        }
        let b = index.lookup(42).expect("inserted key must be found");
        assert_eq!(b.key(), 42);
        assert_eq!(b.history(0).length.get(), 100);
        assert!(b.history(1).is_vacant());
    }

    #[test]
    fn colliding_keys_probe_linearly() {
        let (_d, _f, index) = fresh_index(10);
        // Same start bucket for both keys.
        let (a, b) = (7u128, 17u128);
        index.lookup_or_insert(a).unwrap().push_history(HistoryEntry::new(1, 1, 0, 1));
        index.lookup_or_insert(b).unwrap().push_history(HistoryEntry::new(2, 2, 0, 2));
        assert_eq!(index.lookup(a).unwrap().history(0).length.get(), 1);
        assert_eq!(index.lookup(b).unwrap().history(0).length.get(), 2);
    }

    #[test]
    fn history_demotes_oldest_out() {
        let (_d, _f, index) = fresh_index(4);
        let b = index.lookup_or_insert(1).unwrap();
        for n in 1..=5u64 {
            b.push_history(HistoryEntry::new(n, n, 0, n));
        }
        assert_eq!(b.history(0).transaction_counter.get(), 5);
        assert_eq!(b.history(1).transaction_counter.get(), 4);
        assert_eq!(b.history(2).transaction_counter.get(), 3);
        assert_eq!(b.history(3).transaction_counter.get(), 2);
    }

    #[test]
    fn full_table_reports_no_space() {
        let (_d, _f, index) = fresh_index(2);
        index.lookup_or_insert(1).unwrap();
        index.lookup_or_insert(2).unwrap();
        assert_eq!(index.lookup_or_insert(3).unwrap_err(), Error::NoBufferSpace);
    }

    #[test]
    fn sorted_insert_for_repair() {
        let (_d, _f, index) = fresh_index(4);
        let b = index.lookup_or_insert(9).unwrap();
        b.insert_history_sorted(HistoryEntry::new(5, 5, 0, 5));
        b.insert_history_sorted(HistoryEntry::new(3, 3, 0, 3));
        b.insert_history_sorted(HistoryEntry::new(4, 4, 0, 4));
        b.insert_history_sorted(HistoryEntry::new(5, 5, 0, 5));
        assert_eq!(b.history(0).transaction_counter.get(), 5);
        assert_eq!(b.history(1).transaction_counter.get(), 4);
        assert_eq!(b.history(2).transaction_counter.get(), 3);
        assert!(b.history(3).is_vacant());
    }
}
