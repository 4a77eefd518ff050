//! Rebuilding the hash index from the value logs after a crash.
//!
//! Every value log record ends with a self-describing tail, so the index
//! is redundant: this scan walks each log backwards from its end, placing
//! each recovered `(key, counter, offset, length)` into the key's history
//! in counter order. When the header says every writer since creation had
//! durable writes, only the newest record of each log can disagree with
//! the index and the scan stops there; otherwise the whole log is walked.

use std::sync::atomic::Ordering;

use log::{debug, warn};
use zerocopy::FromBytes;

use crate::error::Result;
use crate::extent;
use crate::kv::layout::{
    self, counter_sequence, HistoryEntry, ValueTail, GOOD_MAGIC, RECORD_ALIGNMENT,
    VALUE_TAIL_SIZE,
};
use crate::kv::Store;

pub(crate) fn repair(store: &Store) -> Result<()> {
    let all_synced = store.index.all_writes_synced().load(Ordering::Acquire) != 0;
    let log_count = store.logs.read().len() as u32;
    let mut newest_sequence = counter_sequence(store.index.transaction_counter().load(Ordering::Acquire));
    let mut recovered = 0u64;
    for file_id in 0..log_count {
        let len = store.with_log(file_id, |log| extent::maximum_extent(log))?;
        let mut end = len & !(RECORD_ALIGNMENT - 1);
        while end >= RECORD_ALIGNMENT {
            match recover_record(store, file_id, end) {
                Ok(Some((entry, key))) => {
                    let sequence = counter_sequence(entry.transaction_counter.get());
                    if sequence > newest_sequence {
                        newest_sequence = sequence;
                    }
                    let record_len = layout::padded_record_length(entry.length.get());
                    store.index.lookup_or_insert(key)?.insert_history_sorted(entry);
                    recovered += 1;
                    if all_synced {
                        // Only the newest record of a durably written log
                        // can be missing from the index.
                        break;
                    }
                    end -= record_len.min(end);
                }
                Ok(None) => {
                    // Not a valid tail here; hunt one alignment unit
                    // earlier for the previous record boundary.
                    end -= RECORD_ALIGNMENT;
                }
                Err(err) => return Err(err),
            }
        }
    }
    debug!("repair recovered {recovered} records");

    // The counter resumes after the newest recovered transaction.
    let current = store.index.transaction_counter().load(Ordering::Acquire);
    if newest_sequence > counter_sequence(current) {
        store
            .index
            .transaction_counter()
            .store(layout::compose_counter(newest_sequence, 0), Ordering::Release);
    }
    store.index.write_interrupted().store(0, Ordering::Release);
    store.index_file.write_all_at(0, &GOOD_MAGIC)?;
    store.index_file.barrier()?;
    Ok(())
}

// Validates the record whose tail would end at `end`, returning its
// history entry and key.
fn recover_record(
    store: &Store,
    file_id: u32,
    end: u64,
) -> Result<Option<(HistoryEntry, u128)>> {
    let mut tail_bytes = [0u8; VALUE_TAIL_SIZE as usize];
    if store.read_log(file_id, end - VALUE_TAIL_SIZE, &mut tail_bytes).is_err() {
        return Ok(None);
    }
    let Ok(tail) = ValueTail::read_from_bytes(&tail_bytes) else {
        return Ok(None);
    };
    let length = tail.length.get();
    if tail.transaction_counter.get() == 0 || length > (1 << 48) {
        return Ok(None);
    }
    let padded = layout::padded_record_length(length);
    if padded > end {
        return Ok(None);
    }
    if store.hashed() && length > 0 && tail.hash.get() != 0 {
        let mut value = vec![0u8; length as usize];
        if store.read_log(file_id, end - padded, &mut value).is_err() {
            return Ok(None);
        }
        if layout::content_hash(&value) != tail.hash.get() {
            warn!("discarding value log {file_id} record at {end}: hash mismatch");
            return Ok(None);
        }
    }
    Ok(Some((
        HistoryEntry::new(
            tail.transaction_counter.get(),
            end / RECORD_ALIGNMENT,
            file_id,
            length,
        ),
        tail.key.get(),
    )))
}
