//! Reliable, parallel removal of a directory tree.
//!
//! The algorithm, in order: rename the root to a random sibling name so
//! concurrent users stop seeing the tree at all; enumerate and unlink with
//! a pool of kernel threads, always draining shallower directories first;
//! park entries that cannot be unlinked under random names just inside the
//! root; and finally retry the stragglers in a sequential sweep, which
//! catches entries whose concurrent holders have since let go.
//!
//! Progress and trouble are reported through a callback which may cancel
//! the whole operation by returning an error. The default callback gives
//! up with `TimedOut` once ten seconds have passed since the first entry
//! it could not remove.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::Mutex;

use crate::deadline::Deadline;
use crate::dir::{DirBuffers, ReadRequest};
use crate::error::{Error, Result};
use crate::fs_ops;
use crate::handle::{cstr, CachingMode, Creation, Handle, Mode, OpenFlags};
use crate::pool::{WorkGroup, WorkItem, WORK_DONE, WORK_LATER};
use crate::stat::{FileType, Stat, StatWant};
use crate::utils;

use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd};

/// Progress events delivered to the [`remove_all`] callback.
///
/// Counts are per reporting thread for `ProgressEnumeration` and totals
/// for `EndEnumeration` and `Finished`.
#[derive(Debug)]
pub enum RemoveEvent<'a> {
    /// Enumeration is about to begin. `base_renamed` says whether the
    /// root was successfully renamed aside first.
    BeginEnumeration {
        /// True if the rename-to-random of the root succeeded.
        base_renamed: bool,
    },
    /// A directory's entries have just been processed.
    ProgressEnumeration {
        /// Entries this thread could not remove in this directory.
        not_removed: u64,
        /// Entries this thread removed in this directory.
        removed: u64,
    },
    /// The parallel pass and the sequential sweep are complete.
    EndEnumeration {
        /// Total entries not removed.
        not_removed: u64,
        /// Total entries removed.
        removed: u64,
    },
    /// The operation is about to return.
    Finished {
        /// Total entries not removed.
        not_removed: u64,
        /// Total entries removed, including the root on success.
        removed: u64,
    },
    /// An entry could not be renamed aside.
    Unrenameable {
        /// The directory containing the problem entry.
        dir: &'a Handle,
        /// The problem entry's leafname.
        leafname: &'a OsStr,
    },
    /// An entry could not be unlinked.
    Unremoveable {
        /// The directory containing the problem entry.
        dir: &'a Handle,
        /// The problem entry's leafname.
        leafname: &'a OsStr,
    },
}

type Callback = dyn Fn(RemoveEvent<'_>) -> Result<()> + Send + Sync;

/// Returned when [`remove_all`] fails: the root handle comes back to the
/// caller, still referring to the (possibly renamed) directory, for
/// inspection or a rescue rename elsewhere.
#[derive(Debug)]
pub struct RemoveAllFailure {
    /// The root directory handle, untouched.
    pub dirh: Handle,
    /// Why the removal failed.
    pub error: Error,
}

struct TreeState {
    root: Handle,
    levels: Mutex<Vec<VecDeque<(Handle, usize)>>>,
    outstanding: AtomicUsize,
    removed: AtomicU64,
    not_removed: AtomicU64,
}

impl TreeState {
    fn push_dir(&self, dirh: Handle, depth: usize) {
        let mut levels = self.levels.lock();
        if levels.len() <= depth {
            levels.resize_with(depth + 1, VecDeque::new);
        }
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        levels[depth].push_back((dirh, depth));
    }
}

struct RemoveWorker {
    state: Arc<TreeState>,
    callback: Arc<Callback>,
    current: Option<(Handle, usize)>,
    bufs: DirBuffers,
}

impl WorkItem for RemoveWorker {
    fn next(&mut self, deadline: &mut Option<Deadline>) -> isize {
        {
            let mut levels = self.state.levels.lock();
            // Shallowest level first, to guarantee forward progress at the
            // outer tree however many subtrees pile up below.
            for q in levels.iter_mut() {
                if let Some(pending) = q.pop_front() {
                    self.current = Some(pending);
                    return 1;
                }
            }
        }
        if self.state.outstanding.load(Ordering::Acquire) > 0 {
            // Another worker is still filling the queues.
            *deadline = Some(Deadline::After(Duration::from_millis(1)));
            return WORK_LATER;
        }
        WORK_DONE
    }

    fn execute(&mut self, _work: isize) -> Result<()> {
        let (dirh, depth) = self.current.take().ok_or(Error::InvalidArgument)?;
        let outcome =
            process_directory(&self.state, &self.callback, &dirh, depth, &mut self.bufs);
        self.state.outstanding.fetch_sub(1, Ordering::AcqRel);
        match outcome {
            Ok(true) => {
                // Ran out of descriptors; try this directory again later.
                self.state.push_dir(dirh, depth);
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn entry_kind(dirh: &Handle, leafname: &OsStr, enumerated: Option<FileType>) -> Option<FileType> {
    match enumerated {
        Some(kind) => Some(kind),
        None => Stat::fill_at(dirh.as_fd(), leafname, StatWant::TYPE).ok()?.kind,
    }
}

// Unlinks everything in one directory, queueing subdirectories for deeper
// levels. Returns Ok(true) when the directory must be revisited because
// descriptors ran out.
fn process_directory(
    state: &TreeState,
    callback: &Arc<Callback>,
    dirh: &Handle,
    depth: usize,
    bufs: &mut DirBuffers,
) -> Result<bool> {
    let mut requeue_self = false;
    loop {
        let req = ReadRequest { want: StatWant::TYPE | StatWant::INO, ..Default::default() };
        crate::dir::read(dirh, bufs, &req)?;
        let done = bufs.done();
        let mut removed_here = 0u64;
        let mut kept_here = 0u64;
        for i in 0..bufs.len() {
            let entry = bufs.get(i).ok_or(Error::InvalidArgument)?;
            let leaf = entry.leafname;
            let cleaf = cstr(leaf)?;
            let is_dir = entry_kind(dirh, leaf, entry.stat.kind) == Some(FileType::Directory);
            if is_dir {
                // An empty subdirectory goes away right here; a populated
                // one becomes deeper work.
                let rc =
                    unsafe { libc::unlinkat(dirh.as_raw_fd(), cleaf.as_ptr(), libc::AT_REMOVEDIR) };
                if rc == 0 {
                    removed_here += 1;
                    continue;
                }
                match Error::last_os_error() {
                    Error::NotFound => continue,
                    Error::Os(errno)
                        if errno == libc::ENOTEMPTY || errno == libc::EEXIST =>
                    {
                        match Handle::directory(
                            Some(dirh),
                            Path::new(leaf),
                            Mode::Read,
                            Creation::OpenExisting,
                            CachingMode::All,
                            OpenFlags::empty(),
                        ) {
                            Ok(sub) => state.push_dir(sub, depth + 1),
                            Err(Error::NotFound) => {}
                            Err(Error::Os(errno))
                                if errno == libc::EMFILE || errno == libc::ENFILE =>
                            {
                                debug!("out of descriptors under tree removal, backing off");
                                requeue_self = true;
                            }
                            Err(_) => {
                                callback(RemoveEvent::Unremoveable { dir: dirh, leafname: leaf })?;
                                kept_here += 1;
                            }
                        }
                    }
                    _ => {
                        callback(RemoveEvent::Unremoveable { dir: dirh, leafname: leaf })?;
                        kept_here += 1;
                    }
                }
            } else {
                let rc = unsafe { libc::unlinkat(dirh.as_raw_fd(), cleaf.as_ptr(), 0) };
                if rc == 0 {
                    removed_here += 1;
                    continue;
                }
                if Error::last_os_error() == Error::NotFound {
                    continue;
                }
                callback(RemoveEvent::Unremoveable { dir: dirh, leafname: leaf })?;
                // Park the entry just inside the root under a random name,
                // out of the way of the directories being torn down.
                let parked = cstr(&utils::random_leafname())?;
                let rc = unsafe {
                    libc::renameat(
                        dirh.as_raw_fd(),
                        cleaf.as_ptr(),
                        state.root.as_raw_fd(),
                        parked.as_ptr(),
                    )
                };
                if rc != 0 {
                    callback(RemoveEvent::Unrenameable { dir: dirh, leafname: leaf })?;
                }
                kept_here += 1;
            }
        }
        state.removed.fetch_add(removed_here, Ordering::AcqRel);
        state.not_removed.fetch_add(kept_here, Ordering::AcqRel);
        callback(RemoveEvent::ProgressEnumeration {
            not_removed: kept_here,
            removed: removed_here,
        })?;
        if done || requeue_self {
            break;
        }
        if removed_here == 0 {
            // No progress this round; whatever is left is unremovable
            // right now and the sweep will return to it.
            break;
        }
    }
    // The directory itself, unless it is the root or still has children
    // queued below.
    if depth > 0 {
        match fs_ops::unlink(dirh, Some(Deadline::NOW)) {
            Ok(()) => {
                state.removed.fetch_add(1, Ordering::AcqRel);
            }
            Err(_) => {
                // Not empty yet or contended; the sweep gets it.
            }
        }
    }
    Ok(requeue_self)
}

// One recursive bottom-up pass over whatever is left.
fn sweep_dir(
    callback: &Arc<Callback>,
    dirh: &Handle,
    bufs: &mut DirBuffers,
) -> Result<(u64, u64)> {
    let mut removed = 0u64;
    let mut remaining = 0u64;
    loop {
        let req = ReadRequest { want: StatWant::TYPE, ..Default::default() };
        crate::dir::read(dirh, bufs, &req)?;
        let done = bufs.done();
        let mut progressed = 0u64;
        for i in 0..bufs.len() {
            let entry = bufs.get(i).ok_or(Error::InvalidArgument)?;
            let leaf = entry.leafname.to_os_string();
            let cleaf = cstr(&leaf)?;
            let is_dir = entry_kind(dirh, &leaf, entry.stat.kind) == Some(FileType::Directory);
            if is_dir {
                match Handle::directory(
                    Some(dirh),
                    Path::new(&leaf),
                    Mode::Read,
                    Creation::OpenExisting,
                    CachingMode::All,
                    OpenFlags::empty(),
                ) {
                    Ok(sub) => {
                        let mut sub_bufs = DirBuffers::bulk();
                        let (r, kept) = sweep_dir(callback, &sub, &mut sub_bufs)?;
                        removed += r;
                        progressed += r;
                        if kept > 0 {
                            remaining += kept;
                            continue;
                        }
                    }
                    Err(Error::NotFound) => continue,
                    Err(_) => {
                        remaining += 1;
                        callback(RemoveEvent::Unremoveable { dir: dirh, leafname: &leaf })?;
                        continue;
                    }
                }
                let rc =
                    unsafe { libc::unlinkat(dirh.as_raw_fd(), cleaf.as_ptr(), libc::AT_REMOVEDIR) };
                if rc == 0 || Error::last_os_error() == Error::NotFound {
                    removed += 1;
                    progressed += 1;
                } else {
                    remaining += 1;
                    callback(RemoveEvent::Unremoveable { dir: dirh, leafname: &leaf })?;
                }
            } else {
                let rc = unsafe { libc::unlinkat(dirh.as_raw_fd(), cleaf.as_ptr(), 0) };
                if rc == 0 || Error::last_os_error() == Error::NotFound {
                    removed += 1;
                    progressed += 1;
                } else {
                    remaining += 1;
                    callback(RemoveEvent::Unremoveable { dir: dirh, leafname: &leaf })?;
                }
            }
        }
        if done {
            break;
        }
        if progressed == 0 {
            break;
        }
    }
    Ok((removed, remaining))
}

/// Removes `dirh` and everything under it with the default callback, which
/// times out ten seconds after the first entry it cannot remove.
///
/// `threads` of zero means half the hardware concurrency, but at least
/// four. On success the handle is consumed and the total number of
/// filesystem entries removed (including the root) is returned. On
/// failure the handle comes back inside the error, still referring to the
/// possibly-renamed directory.
pub fn remove_all(
    dirh: Handle,
    threads: usize,
) -> std::result::Result<u64, RemoveAllFailure> {
    let first_failure: Mutex<Option<Instant>> = Mutex::new(None);
    remove_all_with(dirh, move |event| {
        if let RemoveEvent::Unremoveable { .. } = event {
            let mut first = first_failure.lock();
            let first = first.get_or_insert_with(Instant::now);
            if first.elapsed() > Duration::from_secs(10) {
                return Err(Error::TimedOut);
            }
        }
        Ok(())
    }, threads)
}

/// [`remove_all`] with a caller-supplied callback.
///
/// The callback may be invoked from several kernel threads at once.
/// Returning an error cancels the operation and surfaces that error.
pub fn remove_all_with(
    mut dirh: Handle,
    callback: impl Fn(RemoveEvent<'_>) -> Result<()> + Send + Sync + 'static,
    threads: usize,
) -> std::result::Result<u64, RemoveAllFailure> {
    let callback: Arc<Callback> = Arc::new(callback);

    // Hide the tree from concurrent users up front. Failure is noted, not
    // fatal: permissions may forbid the rename but allow the removal.
    let base_renamed = match fs_ops::parent_path_handle(
        &dirh,
        Some(Deadline::After(Duration::from_secs(1))),
    ) {
        Ok(parent) => fs_ops::relink(
            &mut dirh,
            Some(&parent),
            Path::new(&utils::random_leafname()),
            false,
            Some(Deadline::After(Duration::from_secs(1))),
        )
        .is_ok(),
        Err(_) => false,
    };
    if let Err(error) = callback(RemoveEvent::BeginEnumeration { base_renamed }) {
        return Err(RemoveAllFailure { dirh, error });
    }

    let threads = if threads == 0 {
        (std::thread::available_parallelism().map(|n| n.get()).unwrap_or(8) / 2).max(4)
    } else {
        threads
    };

    let root_enum = match dirh.clone_handle(None, None, None) {
        Ok(h) => h,
        Err(error) => return Err(RemoveAllFailure { dirh, error }),
    };
    let state = Arc::new(TreeState {
        root: dirh,
        levels: Mutex::new(Vec::new()),
        outstanding: AtomicUsize::new(0),
        removed: AtomicU64::new(0),
        not_removed: AtomicU64::new(0),
    });
    state.push_dir(root_enum, 0);

    let group = WorkGroup::new();
    for _ in 0..threads {
        group.submit(Box::new(RemoveWorker {
            state: state.clone(),
            callback: callback.clone(),
            current: None,
            bufs: DirBuffers::bulk(),
        }));
    }
    let parallel_result = group.wait(None);

    // Recover sole ownership of the state; the workers are gone once the
    // group has completed.
    let mut state = state;
    let state = loop {
        match Arc::try_unwrap(state) {
            Ok(inner) => break inner,
            Err(back) => {
                state = back;
                std::thread::yield_now();
            }
        }
    };
    let TreeState { root, removed, not_removed, .. } = state;
    let mut removed = removed.into_inner();
    let not_removed = not_removed.into_inner();

    if let Err(error) = parallel_result {
        return Err(RemoveAllFailure { dirh: root, error });
    }

    // Sequential fallback: retry whatever survived the parallel pass,
    // waiting out concurrent holders.
    let mut bufs = DirBuffers::bulk();
    loop {
        let (removed_now, remaining) = match sweep_dir(&callback, &root, &mut bufs) {
            Ok(counts) => counts,
            Err(error) => return Err(RemoveAllFailure { dirh: root, error }),
        };
        removed += removed_now;
        if remaining == 0 {
            break;
        }
        if removed_now == 0 {
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    if let Err(error) = callback(RemoveEvent::EndEnumeration { not_removed, removed }) {
        return Err(RemoveAllFailure { dirh: root, error });
    }

    match fs_ops::unlink(&root, Some(Deadline::After(Duration::from_secs(10)))) {
        Ok(()) => {
            removed += 1;
        }
        Err(error) => return Err(RemoveAllFailure { dirh: root, error }),
    }
    // Failures from here cannot return the handle usefully; the tree is
    // gone.
    let _ = callback(RemoveEvent::Finished { not_removed, removed });
    let _ = root.close();
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_tree(root: &std::path::Path, dirs: usize, files_per_dir: usize) {
        for d in 0..dirs {
            let sub = root.join(format!("dir{d:04}"));
            std::fs::create_dir(&sub).unwrap();
            for f in 0..files_per_dir {
                std::fs::write(sub.join(format!("f{f:03}")), b"x").unwrap();
            }
        }
    }

    fn open_root(path: &std::path::Path) -> Handle {
        Handle::directory(
            None,
            path,
            Mode::Read,
            Creation::OpenExisting,
            CachingMode::All,
            OpenFlags::empty(),
        )
        .unwrap()
    }

    #[test]
    fn removes_small_tree_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("victim");
        std::fs::create_dir(&target).unwrap();
        build_tree(&target, 10, 16);
        let h = open_root(&target);
        let count = remove_all(h, 4).unwrap();
        assert_eq!(count, 10 * 16 + 10 + 1);
        assert!(!target.exists());
    }

    #[test]
    fn removes_nested_tree() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("deep");
        let mut p = target.clone();
        for i in 0..12 {
            p = p.join(format!("level{i}"));
        }
        std::fs::create_dir_all(&p).unwrap();
        std::fs::write(p.join("leaf"), b"x").unwrap();
        let h = open_root(&target);
        let count = remove_all(h, 2).unwrap();
        assert_eq!(count, 12 + 1 + 1);
        assert!(!target.exists());
    }

    #[test]
    fn removal_hides_tree_by_renaming_first() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("hideme");
        std::fs::create_dir(&target).unwrap();
        build_tree(&target, 2, 2);
        let h = open_root(&target);
        let seen = Arc::new(Mutex::new(false));
        let seen2 = seen.clone();
        let count = remove_all_with(
            h,
            move |event| {
                if let RemoveEvent::BeginEnumeration { base_renamed } = event {
                    *seen2.lock() = base_renamed;
                }
                Ok(())
            },
            2,
        )
        .unwrap();
        assert_eq!(count, 2 * 2 + 2 + 1);
        assert!(*seen.lock(), "root should have been renamed aside");
        assert!(!target.exists());
    }

    #[test]
    fn callback_error_cancels_and_returns_handle() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("keepme");
        std::fs::create_dir(&target).unwrap();
        build_tree(&target, 1, 1);
        let h = open_root(&target);
        let id = h.fetch_inode().unwrap();
        let failure = remove_all_with(
            h,
            |event| match event {
                RemoveEvent::BeginEnumeration { .. } => Err(Error::PermissionDenied),
                _ => Ok(()),
            },
            1,
        )
        .unwrap_err();
        assert_eq!(failure.error, Error::PermissionDenied);
        assert_eq!(failure.dirh.fetch_inode().unwrap(), id);
    }

    #[test]
    fn empty_directory_is_just_removed() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("empty");
        std::fs::create_dir(&target).unwrap();
        let h = open_root(&target);
        assert_eq!(remove_all(h, 1).unwrap(), 1);
        assert!(!target.exists());
    }
}
