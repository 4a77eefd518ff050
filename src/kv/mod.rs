//! A transactional key-value store built on the handle model.
//!
//! A store is a directory holding one `index` file and up to 48
//! numerically named value log files, one per concurrent writer. The index
//! is memory mapped for direct CPU access: a 24-byte header followed by a
//! table of 128-byte buckets, each protecting a 128-bit key and the four
//! newest versions of its value. Values live in the append-only logs, each
//! record finishing with a 48-byte tail that points back at its key so the
//! index can always be rebuilt.
//!
//! Writers claim their identity with byte-range locks: the first entrant
//! formats the index under an exclusive lock, every open holds a shared
//! lock on the index for its lifetime, and each writer holds an exclusive
//! lock on the value log it appends to. Updates are transactional with
//! optimistic concurrency; see [`Transaction`].

mod index;
mod layout;
mod repair;
mod transaction;

pub use transaction::Transaction;

use std::io::IoSlice;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::atomic::Ordering;

use log::{debug, warn};
use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use zerocopy::{FromBytes, IntoBytes};

use crate::error::{Error, Result};
use crate::extent;
use crate::handle::{CachingMode, Creation, Handle, Mode, OpenFlags};
use crate::lock::{range_fcntl_fd, LockKind};
use crate::utils;

use index::MappedIndex;
use layout::{IndexHeader, ValueTail, BAD_MAGIC, GOOD_MAGIC, HEADER_SIZE};

pub use layout::{BUCKET_SIZE, HISTORY_DEPTH, MAX_VALUE_FILES};

/// Keys are caller-chosen 128-bit integers.
pub type Key = u128;

// Writers advertise themselves with a one-byte lock at this offset of the
// index file or a value log. Pre-masked below the POSIX sign bit so the
// store never trips the byte-range engine's top-bit warning on its own
// locks.
const CLAIM_OFFSET: u64 = u64::MAX >> 1;

/// Read-only or read-write access to a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Find and fetch only.
    Read,
    /// Also commit transactions, claiming one value log file.
    Write,
}

/// The durability configurations a store can be opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Plain caching with a crash-survival hint withdrawn: fast, survives
    /// a clean close only. Value tails carry no content hash.
    None,
    /// As [`Durability::None`], but value tails are content-hashed so
    /// corruption is detectable.
    Integrity,
    /// As [`Durability::None`], with value reads served through memory
    /// mappings of the logs.
    MappedValues,
    /// Every write durable before return and tails hashed; the store can
    /// be repaired after a crash.
    Durable,
}

impl Durability {
    fn caching(&self) -> CachingMode {
        match self {
            Durability::Durable => CachingMode::Reads,
            _ => CachingMode::Temporary,
        }
    }

    fn hashed(&self) -> bool {
        matches!(self, Durability::Integrity | Durability::Durable)
    }

    fn mapped(&self) -> bool {
        matches!(self, Durability::MappedValues)
    }
}

/// A value read out of the store, together with the transaction counter
/// that wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueSnapshot {
    /// The key the value belongs to.
    pub key: Key,
    /// The value bytes.
    pub value: Vec<u8>,
    /// The transaction counter of the writing transaction.
    pub transaction_counter: u64,
}

// A byte-range lock owned by raw descriptor, releasing on drop. Used
// instead of the borrowing guard so the store can keep lock and handle in
// one struct; field order in `Store` drops these before their handles.
#[derive(Debug)]
struct HeldLock {
    fd: RawFd,
}

impl HeldLock {
    fn try_exclusive(h: &Handle) -> Result<Option<HeldLock>> {
        match range_fcntl_fd(h.as_raw_fd(), Some(LockKind::Exclusive), CLAIM_OFFSET, 1, false) {
            Ok(_) => Ok(Some(HeldLock { fd: h.as_raw_fd() })),
            Err(Error::TryAgain) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn shared_blocking(h: &Handle) -> Result<HeldLock> {
        range_fcntl_fd(h.as_raw_fd(), Some(LockKind::Shared), CLAIM_OFFSET, 1, true)?;
        Ok(HeldLock { fd: h.as_raw_fd() })
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if let Err(err) = range_fcntl_fd(self.fd, None, CLAIM_OFFSET, 1, false) {
            warn!("failed to release store claim lock: {err}");
        }
    }
}

#[derive(Debug)]
struct WriterLog {
    id: u32,
    handle: Handle,
    /// End offset of the log; appends go here. Only this store appends to
    /// this log, so the value is authoritative.
    end: Mutex<u64>,
}

/// An open key-value store.
#[derive(Debug)]
pub struct Store {
    // Lock fields precede the handles they refer to, so drops release the
    // locks while the descriptors are still open.
    _log_lock: Option<HeldLock>,
    _index_lock: HeldLock,
    pub(crate) index: MappedIndex,
    index_file: Handle,
    pub(crate) writer_log: Option<WriterLog>,
    // Read handles for every value log seen so far, indexed by file id.
    // Logs created by writers arriving later are opened on demand.
    logs: RwLock<Vec<Option<Handle>>>,
    // Read-only mappings of the logs, for Durability::MappedValues.
    maps: RwLock<Vec<Option<Mmap>>>,
    dir: Handle,
    hashed: bool,
    mapped: bool,
    mode: StoreMode,
}

impl Store {
    /// Opens (or, for the first writer, creates) the store in the
    /// directory behind `dir`, with a hash table of `hashtable_entries`
    /// buckets when creating.
    pub fn open(
        dir: Handle,
        hashtable_entries: u64,
        mode: StoreMode,
        durability: Durability,
    ) -> Result<Store> {
        let caching = durability.caching();
        // Even read-only opens map the index writable: probing a bucket
        // takes its lock, and the lock words live in the mapping.
        let index_file = Handle::file(
            Some(&dir),
            Path::new("index"),
            Mode::Write,
            if mode == StoreMode::Write { Creation::IfNeeded } else { Creation::OpenExisting },
            caching,
            OpenFlags::empty(),
        )?;

        if mode == StoreMode::Write {
            // The first entrant formats the index under an exclusive lock.
            if let Some(first) = HeldLock::try_exclusive(&index_file)? {
                if extent::maximum_extent(&index_file)? == 0 {
                    if hashtable_entries == 0 {
                        return Err(Error::InvalidArgument);
                    }
                    let size = utils::round_up_to_page_size(
                        HEADER_SIZE + hashtable_entries * layout::BUCKET_SIZE,
                    );
                    extent::truncate(&index_file, size)?;
                    let header = IndexHeader {
                        magic: GOOD_MAGIC,
                        transaction_counter: 0.into(),
                        write_interrupted: 0,
                        all_writes_synced: index_file.are_writes_durable() as u8,
                        padding: [0u8; 6],
                    };
                    index_file.write_all_at(0, header.as_bytes())?;
                } else {
                    let mut bytes = [0u8; HEADER_SIZE as usize];
                    index_file.read_exact_at(0, &mut bytes)?;
                    if let Ok(mut header) = IndexHeader::read_from_bytes(&bytes) {
                        if header.write_interrupted != 0 && header.magic == GOOD_MAGIC {
                            // A writer died mid-commit; demand a repair
                            // pass before anyone trusts the index.
                            header.magic = BAD_MAGIC;
                        }
                        // "All writes synced" means since creation; it can
                        // only ever be withdrawn.
                        header.all_writes_synced &= index_file.are_writes_durable() as u8;
                        index_file.write_all_at(0, header.as_bytes())?;
                    }
                }
                drop(first);
            }
        }

        // Everyone holds a shared lock for the lifetime of the open,
        // blocking here while a first entrant is still formatting.
        let index_lock = HeldLock::shared_blocking(&index_file)?;

        let mut magic = [0u8; 8];
        index_file.read_exact_at(0, &mut magic)?;
        let needs_repair = magic == BAD_MAGIC;
        if needs_repair && mode == StoreMode::Read {
            return Err(Error::CorruptedStore);
        }
        if !needs_repair && magic != GOOD_MAGIC {
            return Err(Error::UnknownStore);
        }

        let index_len = extent::maximum_extent(&index_file)?;
        let index = MappedIndex::map(&index_file, index_len)?;

        // Open the value logs, claiming the first free one as ours when
        // writing.
        let mut logs: Vec<Option<Handle>> = Vec::new();
        let mut writer_log = None;
        let mut log_lock = None;
        let mut id: u32 = 0;
        while id < MAX_VALUE_FILES {
            let name = id.to_string();
            match Handle::file(
                Some(&dir),
                Path::new(&name),
                Mode::Read,
                Creation::OpenExisting,
                CachingMode::All,
                OpenFlags::empty(),
            ) {
                Ok(read_handle) => {
                    if mode == StoreMode::Write && writer_log.is_none() {
                        if let Some(claim) = HeldLock::try_exclusive(&read_handle)? {
                            let append = Handle::file(
                                Some(&dir),
                                Path::new(&name),
                                Mode::Write,
                                Creation::OpenExisting,
                                caching,
                                OpenFlags::empty(),
                            )?;
                            let end = extent::maximum_extent(&append)?;
                            writer_log =
                                Some(WriterLog { id, handle: append, end: Mutex::new(end) });
                            log_lock = Some(claim);
                        }
                    }
                    logs.push(Some(read_handle));
                    id += 1;
                }
                Err(Error::NotFound) => {
                    if mode == StoreMode::Write && writer_log.is_none() {
                        // Need a fresh log; racing creators are fine, the
                        // loop simply looks at this id again.
                        match Handle::file(
                            Some(&dir),
                            Path::new(&name),
                            Mode::Write,
                            Creation::OnlyIfNotExist,
                            caching,
                            OpenFlags::empty(),
                        ) {
                            Ok(_created) => continue,
                            Err(Error::AlreadyExists) => continue,
                            Err(err) => return Err(err),
                        }
                    }
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        if mode == StoreMode::Write && writer_log.is_none() {
            return Err(Error::MaximumWritersReached);
        }

        let maps = RwLock::new(Vec::new());
        let store = Store {
            _log_lock: log_lock,
            _index_lock: index_lock,
            index,
            index_file,
            writer_log,
            logs: RwLock::new(logs),
            maps,
            dir,
            hashed: durability.hashed(),
            mapped: durability.mapped(),
            mode,
        };

        if needs_repair {
            debug!("store index carries the repair magic, rebuilding");
            repair::repair(&store)?;
        }

        if mode == StoreMode::Write && !store.index_file.are_writes_durable() {
            store.index.all_writes_synced().store(0, Ordering::Release);
        }
        Ok(store)
    }

    /// Convenience: opens the store in the directory at `path`, creating
    /// the directory for writers if needed.
    pub fn open_path(
        path: &Path,
        hashtable_entries: u64,
        mode: StoreMode,
        durability: Durability,
    ) -> Result<Store> {
        let dir = Handle::directory(
            None,
            path,
            Mode::Read,
            if mode == StoreMode::Write { Creation::IfNeeded } else { Creation::OpenExisting },
            CachingMode::All,
            OpenFlags::empty(),
        )?;
        Store::open(dir, hashtable_entries, mode, durability)
    }

    /// Whether this store may commit transactions.
    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    /// Starts a transaction against this store.
    pub fn transaction(&self) -> Transaction<'_> {
        Transaction::new(self)
    }

    /// Sets each key's second element to the transaction counter of its
    /// newest version, or `u64::MAX` for unknown keys.
    pub fn last_updated(&self, keys: &mut [(Key, u64)]) {
        for (key, counter) in keys.iter_mut() {
            *counter = match self.index.lookup(*key) {
                Some(bucket) => {
                    let head = bucket.history(0);
                    if head.is_vacant() { u64::MAX } else { head.transaction_counter.get() }
                }
                None => u64::MAX,
            };
        }
    }

    // Reads `len` bytes at `offset` of value log `file_id`, opening or
    // mapping the log on demand.
    fn read_log(&self, file_id: u32, offset: u64, buf: &mut [u8]) -> Result<()> {
        if file_id >= MAX_VALUE_FILES {
            return Err(Error::CorruptedStore);
        }
        if self.mapped {
            {
                let maps = self.maps.read();
                if let Some(Some(map)) = maps.get(file_id as usize) {
                    let end = offset as usize + buf.len();
                    if end <= map.len() {
                        buf.copy_from_slice(&map[offset as usize..end]);
                        return Ok(());
                    }
                }
            }
            // Missing or stale mapping; rebuild it at the current length.
            self.with_log(file_id, |log| {
                let map = unsafe { memmap2::Mmap::map(log.as_raw_fd()) }.map_err(Error::from)?;
                let end = offset as usize + buf.len();
                if end > map.len() {
                    return Err(Error::TryAgain);
                }
                buf.copy_from_slice(&map[offset as usize..end]);
                let mut maps = self.maps.write();
                if maps.len() <= file_id as usize {
                    maps.resize_with(file_id as usize + 1, || None);
                }
                maps[file_id as usize] = Some(map);
                Ok(())
            })
        } else {
            self.with_log(file_id, |log| log.read_exact_at(offset, buf))
        }
    }

    fn with_log<R>(&self, file_id: u32, f: impl FnOnce(&Handle) -> Result<R>) -> Result<R> {
        {
            let logs = self.logs.read();
            if let Some(Some(log)) = logs.get(file_id as usize) {
                return f(log);
            }
        }
        // A writer that arrived after we opened created this log.
        let opened = Handle::file(
            Some(&self.dir),
            Path::new(&file_id.to_string()),
            Mode::Read,
            Creation::OpenExisting,
            CachingMode::All,
            OpenFlags::empty(),
        )?;
        let mut logs = self.logs.write();
        if logs.len() <= file_id as usize {
            logs.resize_with(file_id as usize + 1, || None);
        }
        if logs[file_id as usize].is_none() {
            logs[file_id as usize] = Some(opened);
        }
        f(logs[file_id as usize].as_ref().expect("just inserted"))
    }

    /// Retrieves a version of a key's value. `revision` 0 is the newest of
    /// the four kept versions. Returns `None` for unknown or removed keys.
    pub fn find(&self, key: Key, revision: usize) -> Result<Option<ValueSnapshot>> {
        Ok(self.find_entry(key, revision)?.and_then(|(snapshot, _)| snapshot))
    }

    // Returns (value-or-tombstone, newest counter) for the transaction
    // machinery: the outer Option is "bucket/revision known at all".
    pub(crate) fn find_entry(
        &self,
        key: Key,
        revision: usize,
    ) -> Result<Option<(Option<ValueSnapshot>, u64)>> {
        if revision >= HISTORY_DEPTH {
            return Err(Error::InvalidArgument);
        }
        let entry = {
            let Some(bucket) = self.index.lookup(key) else {
                return Ok(None);
            };
            let entry = bucket.history(revision);
            if entry.is_vacant() {
                return Ok(None);
            }
            entry
        };
        let counter = entry.transaction_counter.get();
        if entry.is_deletion() {
            return Ok(Some((None, counter)));
        }
        let length = entry.length.get();
        let padded = layout::padded_record_length(length);
        let end = entry.record_end();
        if end < padded {
            return Err(Error::CorruptedStore);
        }
        let mut record = vec![0u8; padded as usize];
        self.read_log(entry.file_id(), end - padded, &mut record)?;
        let tail = ValueTail::read_from_bytes(&record[(padded - layout::VALUE_TAIL_SIZE) as usize..])
            .map_err(|_| Error::CorruptedStore)?;
        if tail.key.get() != key
            || tail.length.get() != length
            || tail.transaction_counter.get() != counter
        {
            return Err(Error::CorruptedStore);
        }
        record.truncate(length as usize);
        if self.hashed && tail.hash.get() != 0 && layout::content_hash(&record) != tail.hash.get() {
            return Err(Error::CorruptedStore);
        }
        Ok(Some((
            Some(ValueSnapshot { key, value: record, transaction_counter: counter }),
            counter,
        )))
    }

    pub(crate) fn hashed(&self) -> bool {
        self.hashed
    }

    // Appends one record to this writer's log, returning the history
    // entry pointing at it. The caller holds the log's end-offset lock.
    pub(crate) fn append_record(
        &self,
        end: &mut u64,
        key: Key,
        value: &[u8],
        transaction_counter: u64,
    ) -> Result<layout::HistoryEntry> {
        let log = self.writer_log.as_ref().ok_or(Error::PermissionDenied)?;
        let length = value.len() as u64;
        let padded = layout::padded_record_length(length);
        let tail = ValueTail {
            hash: if self.hashed && !value.is_empty() {
                layout::content_hash(value).into()
            } else {
                0.into()
            },
            key: key.into(),
            transaction_counter: transaction_counter.into(),
            length: length.into(),
        };
        // Zero padding plus the tail always fit one record alignment unit
        // over the tail size.
        let mut pad_and_tail = [0u8; 128];
        let suffix_len = (padded - length) as usize;
        pad_and_tail[suffix_len - layout::VALUE_TAIL_SIZE as usize..suffix_len]
            .copy_from_slice(tail.as_bytes());
        log.handle.write_gather_at(
            *end,
            &[IoSlice::new(value), IoSlice::new(&pad_and_tail[..suffix_len])],
        )?;
        *end += padded;
        Ok(layout::HistoryEntry::new(
            transaction_counter,
            *end / layout::RECORD_ALIGNMENT,
            log.id,
            length,
        ))
    }
}
