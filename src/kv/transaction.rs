//! Transactions: atomic multi-key updates with optimistic concurrency.
//!
//! A transaction accumulates fetched snapshots and pending updates. A
//! commit locks every affected bucket in ascending key order — the global
//! lock order across writers, which is what makes concurrent committers
//! deadlock-free — validates the fetched snapshots, and keeps the locks
//! held through the counter claim, the log appends and the installation
//! of the new history entries. Nothing is written to a value log until
//! every snapshot has been validated under its held lock, so an aborted
//! commit leaves no orphan record behind for a repair scan to resurrect.

use std::sync::atomic::Ordering;

use crate::error::{Error, Result};
use crate::kv::layout::{compose_counter, counter_sequence, HistoryEntry};
use crate::kv::{Key, Store};

// A fetch that found no bucket at all records this counter; commit treats
// it as "the key must still be absent or vacant".
const ABSENT: u64 = u64::MAX;

/// Most distinct keys one transaction may touch.
pub const TRANSACTION_ITEM_LIMIT: usize = 65_535;

#[derive(Debug)]
struct TxItem {
    key: Key,
    fetched_counter: u64,
    fetched_value: Option<Vec<u8>>,
    // None: fetched only. Some(None): remove. Some(Some(v)): update to v.
    pending: Option<Option<Vec<u8>>>,
}

/// An in-flight transaction against a [`Store`].
///
/// Dropping a transaction without committing abandons it without effect.
#[derive(Debug)]
pub struct Transaction<'s> {
    store: &'s Store,
    items: Vec<TxItem>,
}

impl<'s> Transaction<'s> {
    pub(crate) fn new(store: &'s Store) -> Transaction<'s> {
        Transaction { store, items: Vec::new() }
    }

    /// Fetches a key's current value into the transaction, or returns the
    /// cached copy if this transaction fetched it before. `None` means the
    /// key is absent (or removed).
    ///
    /// The 65,536th distinct key fails `TransactionLimitReached`.
    pub fn fetch(&mut self, key: Key) -> Result<Option<&[u8]>> {
        if let Some(at) = self.items.iter().position(|i| i.key == key) {
            return Ok(self.items[at].fetched_value.as_deref());
        }
        if self.items.len() == TRANSACTION_ITEM_LIMIT {
            return Err(Error::TransactionLimitReached);
        }
        let (fetched_value, fetched_counter) = match self.store.find_entry(key, 0)? {
            None => (None, ABSENT),
            Some((snapshot, counter)) => (snapshot.map(|s| s.value), counter),
        };
        self.items.push(TxItem { key, fetched_counter, fetched_value, pending: None });
        Ok(self.items.last().expect("just pushed").fetched_value.as_deref())
    }

    /// Records the value `key` will be set to on commit. The key must
    /// have been fetched by this transaction first.
    pub fn update(&mut self, key: Key, value: impl Into<Vec<u8>>) -> Result<()> {
        let item = self
            .items
            .iter_mut()
            .find(|i| i.key == key)
            .ok_or(Error::BadUpdate)?;
        item.pending = Some(Some(value.into()));
        Ok(())
    }

    /// Records the removal of `key` on commit. Equivalent to an update to
    /// the empty sentinel; the key must have been fetched first.
    pub fn remove(&mut self, key: Key) -> Result<()> {
        let item = self
            .items
            .iter_mut()
            .find(|i| i.key == key)
            .ok_or(Error::BadUpdate)?;
        item.pending = Some(None);
        Ok(())
    }

    /// Commits every pending update atomically.
    ///
    /// Fails `TransactionAborted(key)` if any updated key changed after
    /// this transaction fetched it; the store is left exactly as some
    /// other writer's transactions made it.
    pub fn commit(mut self) -> Result<()> {
        let store = self.store;
        let log = store.writer_log.as_ref().ok_or(Error::PermissionDenied)?;
        // Lock order across writers is ascending key order.
        self.items.sort_by_key(|i| i.key);
        let updates: Vec<&TxItem> =
            self.items.iter().filter(|i| i.pending.is_some()).collect();
        if updates.is_empty() {
            return Ok(());
        }

        // Lock every affected bucket, validating each snapshot as its
        // lock is taken. The locks stay held until the new entries are
        // installed: releasing between validation and append would let a
        // competing commit slip a newer value in, leaving our durably
        // appended record as an orphan with a claimed counter that a
        // later repair scan would wrongly resurrect over the winner.
        let mut buckets = Vec::with_capacity(updates.len());
        for item in &updates {
            let bucket = store.index.lookup_or_insert(item.key)?;
            let head = bucket.history(0);
            let head_counter = if head.is_vacant() {
                ABSENT
            } else {
                head.transaction_counter.get()
            };
            if head_counter != item.fetched_counter {
                // Guards drop here, releasing every lock taken so far.
                return Err(Error::TransactionAborted(item.key));
            }
            buckets.push(bucket);
        }

        // Claim a transaction counter, racing other writers.
        let counter_word = store.index.transaction_counter();
        let mut current = counter_word.load(Ordering::Acquire);
        let this_counter = loop {
            let proposed = compose_counter(
                counter_sequence(current).wrapping_add(1),
                updates.len() as u64,
            );
            match counter_word.compare_exchange_weak(
                current,
                proposed,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break proposed,
                Err(changed) => current = changed,
            }
        };

        store.index.write_interrupted().store(1, Ordering::Release);

        // Append every new value to our log, still under the bucket
        // locks.
        let mut entries: Vec<HistoryEntry> = Vec::with_capacity(updates.len());
        {
            let mut end = log.end.lock();
            for item in &updates {
                let value: &[u8] = match item.pending.as_ref().expect("filtered") {
                    Some(v) => v,
                    None => &[],
                };
                entries.push(store.append_record(&mut end, item.key, value, this_counter)?);
            }
        }

        // Install, then release everything together so readers see the
        // transaction whole.
        for (bucket, entry) in buckets.iter().zip(entries) {
            bucket.push_history(entry);
        }
        store.index.write_interrupted().store(0, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{Durability, StoreMode};

    fn open_store(dir: &tempfile::TempDir, entries: u64) -> Store {
        Store::open_path(&dir.path().join("teststore"), entries, StoreMode::Write, Durability::None)
            .unwrap()
    }

    #[test]
    fn insert_lookup_update_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 10);

        let mut tx = store.transaction();
        assert_eq!(tx.fetch(78).unwrap(), None);
        tx.update(78, &b"niall"[..]).unwrap();
        tx.commit().unwrap();
        assert_eq!(store.find(78, 0).unwrap().unwrap().value, b"niall");

        let mut tx = store.transaction();
        tx.fetch(79).unwrap();
        tx.update(79, &b"douglas"[..]).unwrap();
        tx.commit().unwrap();
        assert_eq!(store.find(79, 0).unwrap().unwrap().value, b"douglas");
        assert_eq!(store.find(78, 0).unwrap().unwrap().value, b"niall");

        let mut tx = store.transaction();
        tx.fetch(78).unwrap();
        tx.remove(78).unwrap();
        tx.commit().unwrap();
        assert_eq!(store.find(78, 0).unwrap(), None);
        assert_eq!(store.find(78, 1).unwrap().unwrap().value, b"niall");
    }

    #[test]
    fn update_without_fetch_is_a_bad_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 10);
        let mut tx = store.transaction();
        assert_eq!(tx.update(5, &b"v"[..]).unwrap_err(), Error::BadUpdate);
        assert_eq!(tx.remove(5).unwrap_err(), Error::BadUpdate);
    }

    #[test]
    fn stale_snapshot_aborts_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store_a = open_store(&dir, 10);
        let store_b = open_store(&dir, 10);

        let mut tx_a = store_a.transaction();
        tx_a.fetch(7).unwrap();

        let mut tx_b = store_b.transaction();
        tx_b.fetch(7).unwrap();
        tx_b.update(7, &b"from b"[..]).unwrap();
        tx_b.commit().unwrap();

        tx_a.update(7, &b"from a"[..]).unwrap();
        assert_eq!(tx_a.commit().unwrap_err(), Error::TransactionAborted(7));
        assert_eq!(store_a.find(7, 0).unwrap().unwrap().value, b"from b");
    }

    #[test]
    fn repeated_fetch_returns_cached_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 10);
        let mut tx = store.transaction();
        tx.fetch(1).unwrap();
        tx.update(1, &b"v1"[..]).unwrap();
        tx.commit().unwrap();

        let mut tx = store.transaction();
        assert_eq!(tx.fetch(1).unwrap().unwrap(), b"v1");
        // A concurrent change is invisible to this transaction's cache.
        let mut tx2 = store.transaction();
        tx2.fetch(1).unwrap();
        tx2.update(1, &b"v2"[..]).unwrap();
        tx2.commit().unwrap();
        assert_eq!(tx.fetch(1).unwrap().unwrap(), b"v1");
    }

    #[test]
    fn multi_key_commit_is_ordered_and_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 32);
        let mut tx = store.transaction();
        for key in [9u128, 3, 27, 1] {
            tx.fetch(key).unwrap();
            tx.update(key, format!("value{key}").into_bytes()).unwrap();
        }
        tx.commit().unwrap();
        for key in [1u128, 3, 9, 27] {
            let got = store.find(key, 0).unwrap().unwrap();
            assert_eq!(got.value, format!("value{key}").into_bytes());
        }
        // All four carry the same transaction counter, with the update
        // count in the top bits.
        let mut counters = std::collections::BTreeSet::new();
        for key in [1u128, 3, 9, 27] {
            counters.insert(store.find(key, 0).unwrap().unwrap().transaction_counter);
        }
        assert_eq!(counters.len(), 1);
        let counter = *counters.iter().next().unwrap();
        assert_eq!(counter >> 48, 4);
        assert_eq!(counter & ((1 << 48) - 1), 1);
    }

    #[test]
    fn counters_increase_across_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 10);
        let mut seen = Vec::new();
        for n in 0..4u8 {
            let mut tx = store.transaction();
            tx.fetch(50).unwrap();
            tx.update(50, vec![n]).unwrap();
            tx.commit().unwrap();
            seen.push(store.find(50, 0).unwrap().unwrap().transaction_counter);
        }
        for pair in seen.windows(2) {
            assert!(
                (pair[1] & ((1 << 48) - 1)) > (pair[0] & ((1 << 48) - 1)),
                "counters must be strictly increasing"
            );
        }
        // The four-deep history holds every version.
        for (revision, n) in (0..4usize).zip([3u8, 2, 1, 0]) {
            assert_eq!(store.find(50, revision).unwrap().unwrap().value, vec![n]);
        }
    }

    #[test]
    fn empty_commit_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 10);
        let mut tx = store.transaction();
        tx.fetch(1).unwrap();
        tx.commit().unwrap();
        assert_eq!(store.find(1, 0).unwrap(), None);
    }

    #[test]
    fn values_round_trip_through_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("teststore");
        {
            let store = Store::open_path(&path, 64, StoreMode::Write, Durability::Durable)
                .unwrap();
            let mut tx = store.transaction();
            for key in 0..20u128 {
                tx.fetch(key).unwrap();
                tx.update(key, vec![key as u8; (key as usize % 200) + 1]).unwrap();
            }
            tx.commit().unwrap();
        }
        let store =
            Store::open_path(&path, 0, StoreMode::Read, Durability::Durable).unwrap();
        for key in 0..20u128 {
            let got = store.find(key, 0).unwrap().unwrap();
            assert_eq!(got.value, vec![key as u8; (key as usize % 200) + 1]);
        }
    }
}
