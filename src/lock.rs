//! Whole-file and byte-range locks on handles.
//!
//! Whole-file locks map onto `flock`. On Windows the same surface is
//! emulated with a byte-range lock on the highest lockable byte — see
//! [`WHOLE_FILE_LOCK_OFFSET`].
//!
//! Byte-range locks return a scoped [`RangeGuard`] whose drop releases the
//! range. On Linux the open-file-description variants (`F_OFD_SETLK`) are
//! preferred; where only traditional process-wide POSIX locks exist, the
//! handle gets [`OpenFlags::BYTE_LOCK_INSANITY`] set to warn that closing
//! any descriptor on the inode may release the lock and that same-process
//! locks replace one another.

use std::time::Duration;

use log::warn;

use crate::deadline::{Countdown, Deadline};
use crate::error::{Error, Result};
use crate::handle::{Handle, OpenFlags};
use std::os::fd::AsRawFd;

/// On Windows, whole-file locks are emulated as a one-byte range lock at
/// this offset (`u64::MAX - 1`). Callers using byte-range locks for their
/// own purposes should treat that byte as reserved. On POSIX whole-file
/// locks use `flock` and this offset is never locked.
pub const WHOLE_FILE_LOCK_OFFSET: u64 = u64::MAX - 1;

/// Shared or exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Multiple holders permitted.
    Shared,
    /// Single holder.
    Exclusive,
}

#[derive(Debug)]
pub(crate) struct LockedRange {
    pub(crate) offset: u64,
    pub(crate) length: u64,
    pub(crate) kind: LockKind,
    id: u64,
}

/// Lock state tracked per handle: the whole-file lock currently held, and
/// the byte ranges locked through this handle, sorted by offset.
#[derive(Debug, Default)]
pub(crate) struct LockState {
    pub(crate) whole_file: Option<LockKind>,
    pub(crate) ranges: Vec<LockedRange>,
    next_id: u64,
}

fn flock_op(kind: LockKind, nonblocking: bool) -> libc::c_int {
    let base = match kind {
        LockKind::Shared => libc::LOCK_SH,
        LockKind::Exclusive => libc::LOCK_EX,
    };
    if nonblocking {
        base | libc::LOCK_NB
    } else {
        base
    }
}

/// Acquires a whole-file lock of `kind`, waiting until `deadline`.
pub fn lock_file(h: &Handle, kind: LockKind, deadline: Option<Deadline>) -> Result<()> {
    let countdown = Countdown::begin(deadline);
    if deadline.is_none() {
        loop {
            let rc = unsafe { libc::flock(h.as_raw_fd(), flock_op(kind, false)) };
            if rc == 0 {
                h.lock_state.lock().whole_file = Some(kind);
                return Ok(());
            }
            let err = Error::last_os_error();
            if err != Error::Os(libc::EINTR) {
                return Err(err);
            }
        }
    }
    loop {
        if try_lock_file(h, kind)? {
            return Ok(());
        }
        countdown.check()?;
        countdown.sleep(Duration::from_millis(1));
    }
}

/// Attempts a whole-file lock of `kind` without blocking. Returns `false`
/// if someone else holds a conflicting lock.
pub fn try_lock_file(h: &Handle, kind: LockKind) -> Result<bool> {
    loop {
        let rc = unsafe { libc::flock(h.as_raw_fd(), flock_op(kind, true)) };
        if rc == 0 {
            h.lock_state.lock().whole_file = Some(kind);
            return Ok(true);
        }
        match Error::last_os_error() {
            Error::TryAgain => return Ok(false),
            Error::Os(errno) if errno == libc::EINTR => continue,
            err => return Err(err),
        }
    }
}

/// Releases the whole-file lock held through this handle.
pub fn unlock_file(h: &Handle) -> Result<()> {
    let rc = unsafe { libc::flock(h.as_raw_fd(), libc::LOCK_UN) };
    if rc == -1 {
        return Err(Error::last_os_error());
    }
    h.lock_state.lock().whole_file = None;
    Ok(())
}

/// The whole-file lock kind currently held through this handle, if any.
pub fn held_file_lock(h: &Handle) -> Option<LockKind> {
    h.lock_state.lock().whole_file
}

// POSIX lock offsets are signed, so the top bit of offset and length is
// cleared, with a warning, rather than rejected.
fn mask_top_bit(value: u64, what: &str) -> u64 {
    if value & (1 << 63) != 0 {
        warn!("byte-range lock {what} {value:#x} has the top bit set; masking it off");
        value & !(1 << 63)
    } else {
        value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RangeBackend {
    #[cfg(target_os = "linux")]
    OpenFileDescription,
    Posix,
}

fn flock_struct(kind: Option<LockKind>, offset: u64, length: u64) -> libc::flock {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = match kind {
        Some(LockKind::Shared) => libc::F_RDLCK as libc::c_short,
        Some(LockKind::Exclusive) => libc::F_WRLCK as libc::c_short,
        None => libc::F_UNLCK as libc::c_short,
    };
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = offset as libc::off_t;
    fl.l_len = length as libc::off_t;
    fl
}

pub(crate) fn range_fcntl_fd(
    fd: std::os::fd::RawFd,
    kind: Option<LockKind>,
    offset: u64,
    length: u64,
    blocking: bool,
) -> Result<RangeBackend> {
    let fl = flock_struct(kind, offset, length);
    #[cfg(target_os = "linux")]
    {
        let cmd = if blocking { libc::F_OFD_SETLKW } else { libc::F_OFD_SETLK };
        loop {
            let rc = unsafe { libc::fcntl(fd, cmd, &fl) };
            if rc == 0 {
                return Ok(RangeBackend::OpenFileDescription);
            }
            match Error::last_os_error() {
                // Kernel predates OFD locks; fall through to process locks.
                Error::InvalidArgument => break,
                Error::Os(errno) if errno == libc::EINTR => continue,
                err => return Err(err),
            }
        }
    }
    let cmd = if blocking { libc::F_SETLKW } else { libc::F_SETLK };
    loop {
        let rc = unsafe { libc::fcntl(fd, cmd, &fl) };
        if rc == 0 {
            return Ok(RangeBackend::Posix);
        }
        match Error::last_os_error() {
            Error::Os(errno) if errno == libc::EINTR => continue,
            // Both EACCES and EAGAIN mean "held by someone else" here.
            Error::PermissionDenied => return Err(Error::TryAgain),
            err => return Err(err),
        }
    }
}

fn range_fcntl(
    h: &Handle,
    kind: Option<LockKind>,
    offset: u64,
    length: u64,
    blocking: bool,
) -> Result<RangeBackend> {
    let backend = range_fcntl_fd(h.as_raw_fd(), kind, offset, length, blocking)?;
    if backend == RangeBackend::Posix {
        h.set_flag(OpenFlags::BYTE_LOCK_INSANITY);
    }
    Ok(backend)
}

/// A held byte-range lock. Dropping it releases the range; use
/// [`RangeGuard::unlock`] to observe release errors.
#[derive(Debug)]
pub struct RangeGuard<'h> {
    handle: &'h Handle,
    offset: u64,
    length: u64,
    /// The kind this guard was granted with.
    pub kind: LockKind,
    id: u64,
    armed: bool,
}

/// Locks `[offset, offset + length)` on `h`.
///
/// A `deadline` of zero makes exactly one non-blocking attempt. Upgrades
/// and downgrades are performed by acquiring the new guard first and
/// releasing the old one after; the release notices the surviving guard
/// and re-asserts its kind instead of unlocking the range.
pub fn lock_range<'h>(
    h: &'h Handle,
    offset: u64,
    length: u64,
    kind: LockKind,
    deadline: Option<Deadline>,
) -> Result<RangeGuard<'h>> {
    let offset = mask_top_bit(offset, "offset");
    let length = mask_top_bit(length, "length");
    if length == 0 {
        return Err(Error::InvalidArgument);
    }
    let countdown = Countdown::begin(deadline);
    let immediate = matches!(deadline, Some(d) if d.is_immediate());
    loop {
        let result = if deadline.is_none() {
            range_fcntl(h, Some(kind), offset, length, true)
        } else {
            range_fcntl(h, Some(kind), offset, length, false)
        };
        match result {
            Ok(_) => {
                let id = {
                    let mut st = h.lock_state.lock();
                    st.next_id += 1;
                    let id = st.next_id;
                    let at = st
                        .ranges
                        .partition_point(|r| (r.offset, r.id) < (offset, id));
                    st.ranges.insert(at, LockedRange { offset, length, kind, id });
                    id
                };
                return Ok(RangeGuard { handle: h, offset, length, kind, id, armed: true });
            }
            Err(Error::TryAgain) => {
                if immediate {
                    return Err(Error::TimedOut);
                }
                countdown.check()?;
                countdown.sleep(Duration::from_millis(1));
            }
            Err(err) => return Err(err),
        }
    }
}

impl RangeGuard<'_> {
    /// The locked range.
    pub fn range(&self) -> (u64, u64) {
        (self.offset, self.length)
    }

    fn release(&mut self) -> Result<()> {
        if !self.armed {
            return Ok(());
        }
        self.armed = false;
        let survivor = {
            let mut st = self.handle.lock_state.lock();
            if let Some(at) = st.ranges.iter().position(|r| r.id == self.id) {
                st.ranges.remove(at);
            }
            // If another guard still covers part of this range, re-assert
            // it rather than unlock, so upgrade/downgrade sequences do not
            // drop the lock out from under the surviving guard.
            st.ranges
                .iter()
                .filter(|r| r.offset < self.offset + self.length
                    && self.offset < r.offset + r.length)
                .map(|r| (r.offset, r.length, r.kind))
                .next()
        };
        match survivor {
            Some((offset, length, kind)) => {
                range_fcntl(self.handle, Some(kind), offset, length, false).map(|_| ())
            }
            None => range_fcntl(self.handle, None, self.offset, self.length, false).map(|_| ()),
        }
    }

    /// Releases the lock, surfacing any error from the OS.
    pub fn unlock(mut self) -> Result<()> {
        self.release()
    }
}

impl Drop for RangeGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!("failed to release byte-range lock: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{CachingMode, Creation, Mode};
    use std::path::Path;

    fn two_handles() -> (tempfile::TempDir, Handle, Handle) {
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
        let open = || {
            Handle::file(
                Some(&base),
                Path::new("lockee"),
                Mode::Write,
                Creation::IfNeeded,
                CachingMode::All,
                OpenFlags::empty(),
            )
            .unwrap()
        };
        (dir, open(), open())
    }

    #[test]
    fn whole_file_exclusive_excludes() {
        let (_d, a, b) = two_handles();
        lock_file(&a, LockKind::Exclusive, None).unwrap();
        assert_eq!(held_file_lock(&a), Some(LockKind::Exclusive));
        assert!(!try_lock_file(&b, LockKind::Exclusive).unwrap());
        assert!(!try_lock_file(&b, LockKind::Shared).unwrap());
        unlock_file(&a).unwrap();
        assert!(try_lock_file(&b, LockKind::Shared).unwrap());
    }

    #[test]
    fn shared_locks_coexist() {
        let (_d, a, b) = two_handles();
        lock_file(&a, LockKind::Shared, None).unwrap();
        assert!(try_lock_file(&b, LockKind::Shared).unwrap());
    }

    #[test]
    fn range_lock_times_out_against_holder() {
        let (_d, a, b) = two_handles();
        let _guard = lock_range(&a, 0, 1024, LockKind::Exclusive, None).unwrap();
        let started = std::time::Instant::now();
        let err = lock_range(
            &b,
            0,
            1024,
            LockKind::Exclusive,
            Some(Deadline::After(Duration::from_millis(100))),
        )
        .unwrap_err();
        assert_eq!(err, Error::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(100));
        // The original holder is unaffected.
        assert_eq!(a.lock_state.lock().ranges.len(), 1);
    }

    #[test]
    fn immediate_deadline_is_one_try() {
        let (_d, a, b) = two_handles();
        let _guard = lock_range(&a, 0, 64, LockKind::Exclusive, None).unwrap();
        let err = lock_range(&b, 0, 64, LockKind::Shared, Some(Deadline::NOW)).unwrap_err();
        assert_eq!(err, Error::TimedOut);
    }

    #[test]
    fn dropping_guard_releases() {
        let (_d, a, b) = two_handles();
        {
            let _guard = lock_range(&a, 0, 10, LockKind::Exclusive, None).unwrap();
            assert!(lock_range(&b, 0, 10, LockKind::Exclusive, Some(Deadline::NOW)).is_err());
        }
        lock_range(&b, 0, 10, LockKind::Exclusive, Some(Deadline::NOW)).unwrap();
    }

    #[test]
    fn disjoint_ranges_do_not_conflict() {
        let (_d, a, b) = two_handles();
        let _low = lock_range(&a, 0, 100, LockKind::Exclusive, None).unwrap();
        lock_range(&b, 100, 100, LockKind::Exclusive, Some(Deadline::NOW)).unwrap();
    }

    #[test]
    fn top_bit_is_masked() {
        let (_d, a, _b) = two_handles();
        let guard = lock_range(&a, (1 << 63) | 8, 8, LockKind::Exclusive, None).unwrap();
        assert_eq!(guard.range(), (8, 8));
    }

    #[test]
    fn upgrade_then_release_old_guard_keeps_exclusive() {
        let (_d, a, b) = two_handles();
        let shared = lock_range(&a, 0, 32, LockKind::Shared, None).unwrap();
        let _exclusive = lock_range(&a, 0, 32, LockKind::Exclusive, None).unwrap();
        shared.unlock().unwrap();
        // The exclusive guard must still hold the range.
        let err = lock_range(&b, 0, 32, LockKind::Shared, Some(Deadline::NOW)).unwrap_err();
        assert_eq!(err, Error::TimedOut);
    }
}
