//! Handles: owned references to OS filesystem resources.
//!
//! A [`Handle`] owns exactly one descriptor for a regular file, a directory,
//! a path reference (used only for relative lookups), or a symlink. Handles
//! are moved, never copied, and closed exactly once. Operations elsewhere in
//! this crate take a handle rather than a path string wherever possible, and
//! verify the handle's inode identity before acting by name, which removes
//! whole classes of check-to-use races.

use std::ffi::{CString, OsStr};
use std::io::IoSlice;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;
use log::error;
use parking_lot::Mutex;

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::fs_ops;
use crate::lock::LockState;
use crate::stat::{Stat, StatWant};

/// What kind of resource a handle owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// A regular file.
    File,
    /// A directory.
    Directory,
    /// A path reference: an openable descriptor usable only as the base for
    /// relative lookups.
    Path,
    /// A symlink itself, not its target.
    Symlink,
    /// A pipe or other non-seekable stream.
    Pipe,
}

/// Requested access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Read-only access.
    Read,
    /// Read and write access.
    Write,
    /// Write access where all writes land at the end of the file.
    Append,
}

/// What to do about an existing (or missing) entry on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Creation {
    /// The entry must already exist.
    OpenExisting,
    /// The entry must not exist; it is created.
    OnlyIfNotExist,
    /// Open the entry, creating it if missing.
    IfNeeded,
    /// The entry must exist and is truncated to zero length.
    TruncateExisting,
    /// A fresh entry replaces whatever is there. For directories the swap
    /// is performed by renaming an empty directory over a random sibling
    /// name, so concurrent readers see either the old or the new entry,
    /// never a missing one.
    AlwaysNew,
}

/// How the kernel may cache this handle's data and metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachingMode {
    /// Keep whatever the source handle had (only meaningful to
    /// [`Handle::clone_handle`]).
    Unchanged,
    /// No caching: all writes durable before return, reads bypass the cache
    /// where the platform allows.
    None,
    /// Cache metadata only; data I/O bypasses the cache.
    OnlyMetadata,
    /// Cache reads; writes of data and metadata are durable before return.
    Reads,
    /// Cache reads and metadata writes; data writes are durable before
    /// return.
    ReadsAndMetadata,
    /// Normal caching.
    All,
    /// Normal caching, but writes are barrier-flushed when the handle is
    /// closed and at explicit sync points.
    SafetyBarriers,
    /// Normal caching plus a hint that the data need not survive a crash.
    Temporary,
}

bitflags! {
    /// Open flags for a handle. The `WIN_` flags configure Windows-only
    /// behavior and are accepted but inert on POSIX.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// The first close of this handle attempts to unlink the entry.
        const UNLINK_ON_FIRST_CLOSE = 1 << 0;
        /// Skip the stat-and-compare inode verification that relink, unlink
        /// and parent-path resolution otherwise perform.
        const DISABLE_SAFETY_UNLINKS = 1 << 1;
        /// Hint that readahead is not useful for this handle.
        const DISABLE_PREFETCHING = 1 << 2;
        /// Hint that aggressive readahead is useful for this handle.
        const MAXIMUM_PREFETCHING = 1 << 3;
        /// The handle may be used by several threads at once.
        const MULTIPLEXABLE = 1 << 4;
        /// Set by the byte-range lock engine when it had to fall back to
        /// process-wide POSIX locks: closing any descriptor for the inode
        /// may release locks, and same-process locks replace one another.
        const BYTE_LOCK_INSANITY = 1 << 5;
        /// The handle refers to an inode with no name in any directory.
        const ANONYMOUS_INODE = 1 << 6;
        /// Windows: do not emulate POSIX unlink by renaming aside.
        const WIN_DISABLE_UNLINK_EMULATION = 1 << 7;
        /// Windows: do not create files with the sparse attribute.
        const WIN_DISABLE_SPARSE_FILE_CREATION = 1 << 8;
        /// Windows: create directories case sensitive.
        const WIN_CREATE_CASE_SENSITIVE_DIRECTORY = 1 << 9;
    }
}

// Private marker kept with the public flags: set once the close protocol
// has run, so a Drop after an explicit close() does nothing.
const FLAG_CLOSED: u32 = 1 << 31;

bitflags! {
    /// Observed behavior of an open handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Behavior: u32 {
        /// Reads and writes can be issued at arbitrary offsets.
        const SEEKABLE = 1 << 0;
        /// The handle can be read.
        const READABLE = 1 << 1;
        /// The handle can be written.
        const WRITABLE = 1 << 2;
        /// All writes land at the end of the file.
        const APPEND_ONLY = 1 << 3;
        /// I/O must be aligned to the device granularity.
        const ALIGNED_IO = 1 << 4;
        /// I/O does not block.
        const NONBLOCKING = 1 << 5;
    }
}

/// The `(device, inode)` pair uniquely naming a filesystem object on this
/// machine. The all-zero pair is the "not yet fetched" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeId {
    /// Device id.
    pub dev: u64,
    /// Inode number.
    pub ino: u64,
}

impl InodeId {
    /// True once a real identity has been recorded.
    pub fn is_set(&self) -> bool {
        self.dev != 0 || self.ino != 0
    }
}

/// An owned reference to an OS filesystem resource.
pub struct Handle {
    fd: OwnedFd,
    kind: HandleKind,
    mode: Mode,
    caching: CachingMode,
    flags: AtomicU32,
    behavior: Behavior,
    // Inode identity, zero until first fetched, monotonic afterwards.
    dev: AtomicU64,
    ino: AtomicU64,
    pub(crate) lock_state: Mutex<LockState>,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("fd", &self.fd.as_raw_fd())
            .field("kind", &self.kind)
            .field("mode", &self.mode)
            .field("caching", &self.caching)
            .field("flags", &self.flags())
            .field("behavior", &self.behavior)
            .finish()
    }
}

pub(crate) fn cstr(path: &OsStr) -> Result<CString> {
    CString::new(path.as_bytes()).map_err(|_| Error::InvalidArgument)
}

fn openat_raw(
    base: Option<BorrowedFd<'_>>,
    path: &OsStr,
    oflags: libc::c_int,
    perms: libc::mode_t,
) -> Result<OwnedFd> {
    let cpath = cstr(path)?;
    let dirfd = base.map_or(libc::AT_FDCWD, |b| b.as_raw_fd());
    loop {
        let fd = unsafe {
            libc::openat(
                dirfd,
                cpath.as_ptr(),
                oflags | libc::O_CLOEXEC,
                libc::c_uint::from(perms as u16),
            )
        };
        if fd >= 0 {
            return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
        }
        let err = Error::last_os_error();
        if err != Error::Os(libc::EINTR) {
            return Err(err);
        }
    }
}

fn caching_oflags(caching: CachingMode) -> libc::c_int {
    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    let direct = libc::O_DIRECT;
    // macOS has no O_DIRECT; callers get F_NOCACHE applied after open.
    #[cfg(target_os = "macos")]
    let direct = 0;
    #[cfg(not(target_os = "macos"))]
    let dsync = libc::O_DSYNC;
    #[cfg(target_os = "macos")]
    let dsync = libc::O_SYNC;
    match caching {
        CachingMode::None => direct | libc::O_SYNC,
        CachingMode::OnlyMetadata => direct,
        CachingMode::Reads => libc::O_SYNC,
        CachingMode::ReadsAndMetadata => dsync,
        _ => 0,
    }
}

#[cfg(target_os = "macos")]
fn apply_nocache(fd: BorrowedFd<'_>, caching: CachingMode) {
    if matches!(caching, CachingMode::None | CachingMode::OnlyMetadata) {
        unsafe {
            libc::fcntl(fd.as_raw_fd(), libc::F_NOCACHE, 1);
        }
    }
}

impl Handle {
    fn from_parts(
        fd: OwnedFd,
        kind: HandleKind,
        mode: Mode,
        caching: CachingMode,
        flags: OpenFlags,
        behavior: Behavior,
    ) -> Handle {
        Handle {
            fd,
            kind,
            mode,
            caching,
            flags: AtomicU32::new(flags.bits()),
            behavior,
            dev: AtomicU64::new(0),
            ino: AtomicU64::new(0),
            lock_state: Mutex::new(LockState::default()),
        }
    }

    /// Opens a regular file at `path`, resolved relative to `base` when one
    /// is given.
    pub fn file(
        base: Option<&Handle>,
        path: &Path,
        mode: Mode,
        creation: Creation,
        caching: CachingMode,
        flags: OpenFlags,
    ) -> Result<Handle> {
        let caching = match caching {
            CachingMode::Unchanged => CachingMode::All,
            other => other,
        };
        let mut oflags = match mode {
            Mode::Read => libc::O_RDONLY,
            Mode::Write => libc::O_RDWR,
            Mode::Append => libc::O_WRONLY | libc::O_APPEND,
        };
        oflags |= caching_oflags(caching);
        let basefd = base.map(|b| b.as_fd());
        let fd = match creation {
            Creation::OpenExisting => openat_raw(basefd, path.as_os_str(), oflags, 0)?,
            Creation::OnlyIfNotExist => {
                openat_raw(basefd, path.as_os_str(), oflags | libc::O_CREAT | libc::O_EXCL, 0o600)?
            }
            Creation::IfNeeded => {
                openat_raw(basefd, path.as_os_str(), oflags | libc::O_CREAT, 0o600)?
            }
            Creation::TruncateExisting => {
                openat_raw(basefd, path.as_os_str(), oflags | libc::O_TRUNC, 0)?
            }
            Creation::AlwaysNew => {
                // Create under a random sibling name, then rename over the
                // target so concurrent openers never observe a half-created
                // entry.
                let parent = path.parent().unwrap_or(Path::new("."));
                let random = crate::utils::random_leafname();
                let tmp = parent.join(&random);
                let fd = openat_raw(
                    basefd,
                    tmp.as_os_str(),
                    oflags | libc::O_CREAT | libc::O_EXCL,
                    0o600,
                )?;
                let ctmp = cstr(tmp.as_os_str())?;
                let ctarget = cstr(path.as_os_str())?;
                let dirfd = basefd.map_or(libc::AT_FDCWD, |b| b.as_raw_fd());
                let rc = unsafe { libc::renameat(dirfd, ctmp.as_ptr(), dirfd, ctarget.as_ptr()) };
                if rc == -1 {
                    let err = Error::last_os_error();
                    unsafe { libc::unlinkat(dirfd, ctmp.as_ptr(), 0) };
                    return Err(err);
                }
                fd
            }
        };
        #[cfg(target_os = "macos")]
        apply_nocache(fd.as_fd(), caching);
        let mut behavior = Behavior::SEEKABLE;
        match mode {
            Mode::Read => behavior |= Behavior::READABLE,
            Mode::Write => behavior |= Behavior::READABLE | Behavior::WRITABLE,
            Mode::Append => behavior |= Behavior::WRITABLE | Behavior::APPEND_ONLY,
        }
        if matches!(caching, CachingMode::None | CachingMode::OnlyMetadata) {
            behavior |= Behavior::ALIGNED_IO;
        }
        Ok(Handle::from_parts(fd, HandleKind::File, mode, caching, flags, behavior))
    }

    /// Opens (or creates) a directory at `path`.
    pub fn directory(
        base: Option<&Handle>,
        path: &Path,
        mode: Mode,
        creation: Creation,
        caching: CachingMode,
        flags: OpenFlags,
    ) -> Result<Handle> {
        let caching = match caching {
            CachingMode::Unchanged => CachingMode::All,
            other => other,
        };
        let basefd = base.map(|b| b.as_fd());
        let dirfd = basefd.map_or(libc::AT_FDCWD, |b| b.as_raw_fd());
        let cpath = cstr(path.as_os_str())?;
        match creation {
            Creation::OpenExisting => {}
            Creation::OnlyIfNotExist => {
                let rc = unsafe { libc::mkdirat(dirfd, cpath.as_ptr(), 0o700) };
                if rc == -1 {
                    return Err(Error::last_os_error());
                }
            }
            Creation::IfNeeded => {
                let rc = unsafe { libc::mkdirat(dirfd, cpath.as_ptr(), 0o700) };
                if rc == -1 {
                    let err = Error::last_os_error();
                    if err != Error::AlreadyExists {
                        return Err(err);
                    }
                }
            }
            Creation::TruncateExisting => return Err(Error::IsADirectory),
            Creation::AlwaysNew => {
                // Make an empty directory under a random sibling name and
                // rename it over the target. POSIX permits that rename only
                // when the target is absent or an empty directory.
                let parent = path.parent().unwrap_or(Path::new("."));
                let random = parent.join(crate::utils::random_leafname());
                let crandom = cstr(random.as_os_str())?;
                let rc = unsafe { libc::mkdirat(dirfd, crandom.as_ptr(), 0o700) };
                if rc == -1 {
                    return Err(Error::last_os_error());
                }
                let rc = unsafe { libc::renameat(dirfd, crandom.as_ptr(), dirfd, cpath.as_ptr()) };
                if rc == -1 {
                    let err = Error::last_os_error();
                    unsafe { libc::unlinkat(dirfd, crandom.as_ptr(), libc::AT_REMOVEDIR) };
                    return Err(err);
                }
            }
        }
        let fd = openat_raw(basefd, path.as_os_str(), libc::O_RDONLY | libc::O_DIRECTORY, 0)?;
        let behavior = Behavior::READABLE;
        Ok(Handle::from_parts(fd, HandleKind::Directory, mode, caching, flags, behavior))
    }

    /// Opens a path reference: a descriptor whose only use is as the base
    /// for relative lookups and `*at` calls.
    pub fn path(base: Option<&Handle>, path: &Path) -> Result<Handle> {
        #[cfg(any(target_os = "linux", target_os = "freebsd"))]
        let oflags = libc::O_PATH;
        #[cfg(target_os = "macos")]
        let oflags = libc::O_RDONLY;
        let fd = openat_raw(base.map(|b| b.as_fd()), path.as_os_str(), oflags, 0)?;
        Ok(Handle::from_parts(
            fd,
            HandleKind::Path,
            Mode::Read,
            CachingMode::All,
            OpenFlags::empty(),
            Behavior::empty(),
        ))
    }

    /// Opens the symlink at `path` itself, not its target.
    pub fn symlink(base: Option<&Handle>, path: &Path) -> Result<Handle> {
        #[cfg(any(target_os = "linux", target_os = "freebsd"))]
        let oflags = libc::O_PATH | libc::O_NOFOLLOW;
        #[cfg(target_os = "macos")]
        let oflags = libc::O_SYMLINK;
        let fd = openat_raw(base.map(|b| b.as_fd()), path.as_os_str(), oflags, 0)?;
        Ok(Handle::from_parts(
            fd,
            HandleKind::Symlink,
            Mode::Read,
            CachingMode::All,
            OpenFlags::empty(),
            Behavior::empty(),
        ))
    }

    /// Creates a file with no name in any directory, inside the filesystem
    /// backing `base`.
    pub fn temp_inode(base: &Handle) -> Result<Handle> {
        #[cfg(target_os = "linux")]
        {
            match openat_raw(
                Some(base.as_fd()),
                OsStr::new("."),
                libc::O_TMPFILE | libc::O_RDWR,
                0o600,
            ) {
                Ok(fd) => {
                    return Ok(Handle::from_parts(
                        fd,
                        HandleKind::File,
                        Mode::Write,
                        CachingMode::Temporary,
                        OpenFlags::ANONYMOUS_INODE,
                        Behavior::SEEKABLE | Behavior::READABLE | Behavior::WRITABLE,
                    ));
                }
                Err(Error::NotSupported) | Err(Error::InvalidArgument) => {}
                Err(err) => return Err(err),
            }
        }
        // No kernel support: create under a random name and unlink it
        // before handing the handle out.
        let name = crate::utils::random_leafname();
        let fd = openat_raw(
            Some(base.as_fd()),
            &name,
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
            0o600,
        )?;
        let cname = cstr(&name)?;
        let rc = unsafe { libc::unlinkat(base.as_raw_fd(), cname.as_ptr(), 0) };
        if rc == -1 {
            return Err(Error::last_os_error());
        }
        Ok(Handle::from_parts(
            fd,
            HandleKind::File,
            Mode::Write,
            CachingMode::Temporary,
            OpenFlags::ANONYMOUS_INODE,
            Behavior::SEEKABLE | Behavior::READABLE | Behavior::WRITABLE,
        ))
    }

    /// The kind of resource this handle owns.
    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// The access mode the handle was opened with.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The caching mode the handle was opened with.
    pub fn caching(&self) -> CachingMode {
        self.caching
    }

    /// The open flags, including any set later by the lock engine.
    pub fn flags(&self) -> OpenFlags {
        OpenFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flag(&self, flag: OpenFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    /// The behavior bits observed for this handle.
    pub fn behavior(&self) -> Behavior {
        self.behavior
    }

    /// True when writes to this handle reach storage before returning.
    pub fn are_writes_durable(&self) -> bool {
        matches!(
            self.caching,
            CachingMode::None | CachingMode::Reads | CachingMode::ReadsAndMetadata
        )
    }

    /// The OS-reported path of the descriptor. Empty if the entry has been
    /// unlinked, or if what the OS reports no longer names this inode.
    pub fn current_path(&self) -> Result<PathBuf> {
        let reported = self.os_reported_path()?;
        if reported.as_os_str().is_empty() {
            return Ok(reported);
        }
        // The report is advisory; confirm it still names our inode.
        let ours = self.fetch_inode()?;
        let creported = cstr(reported.as_os_str())?;
        let mut st = mem::MaybeUninit::<libc::stat>::uninit();
        let rc = unsafe {
            libc::fstatat(
                libc::AT_FDCWD,
                creported.as_ptr(),
                st.as_mut_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if rc == -1 {
            return Ok(PathBuf::new());
        }
        let st = unsafe { st.assume_init() };
        if st.st_dev as u64 != ours.dev || st.st_ino as u64 != ours.ino {
            return Ok(PathBuf::new());
        }
        Ok(reported)
    }

    #[cfg(target_os = "linux")]
    fn os_reported_path(&self) -> Result<PathBuf> {
        let proc = format!("/proc/self/fd/{}", self.fd.as_raw_fd());
        match std::fs::read_link(&proc) {
            Ok(p) => {
                // An unlinked entry is reported with a " (deleted)" suffix.
                if p.as_os_str().as_bytes().ends_with(b" (deleted)") {
                    Ok(PathBuf::new())
                } else {
                    Ok(p)
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    #[cfg(target_os = "macos")]
    fn os_reported_path(&self) -> Result<PathBuf> {
        let mut buf = [0u8; libc::PATH_MAX as usize];
        let rc = unsafe {
            libc::fcntl(self.fd.as_raw_fd(), libc::F_GETPATH, buf.as_mut_ptr())
        };
        if rc == -1 {
            let err = Error::last_os_error();
            return if err == Error::NotFound { Ok(PathBuf::new()) } else { Err(err) };
        }
        let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        Ok(PathBuf::from(OsStr::from_bytes(&buf[..len])))
    }

    #[cfg(target_os = "freebsd")]
    fn os_reported_path(&self) -> Result<PathBuf> {
        let mut kf = mem::MaybeUninit::<libc::kinfo_file>::zeroed();
        unsafe {
            (*kf.as_mut_ptr()).kf_structsize = libc::KINFO_FILE_SIZE;
        }
        let rc = unsafe { libc::fcntl(self.fd.as_raw_fd(), libc::F_KINFO, kf.as_mut_ptr()) };
        if rc == -1 {
            return Err(Error::last_os_error());
        }
        let kf = unsafe { kf.assume_init() };
        let bytes: Vec<u8> = kf
            .kf_path
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        Ok(PathBuf::from(OsStr::from_bytes(&bytes)))
    }

    /// Fetches (and caches) the inode identity of this handle.
    ///
    /// The pair is written at most once per handle; concurrent callers are
    /// safe because both fields only move from zero to their final value.
    pub fn fetch_inode(&self) -> Result<InodeId> {
        let id = InodeId {
            dev: self.dev.load(Ordering::Acquire),
            ino: self.ino.load(Ordering::Acquire),
        };
        if id.is_set() {
            return Ok(id);
        }
        let st = Stat::fill(self.as_fd(), StatWant::identity())?;
        self.dev.store(st.dev, Ordering::Release);
        self.ino.store(st.ino, Ordering::Release);
        Ok(InodeId { dev: st.dev, ino: st.ino })
    }

    /// The inode identity, if it has been fetched already.
    pub fn inode_if_fetched(&self) -> Option<InodeId> {
        let id = InodeId {
            dev: self.dev.load(Ordering::Acquire),
            ino: self.ino.load(Ordering::Acquire),
        };
        id.is_set().then_some(id)
    }

    /// Swaps in a freshly opened descriptor for the same inode. Used by the
    /// relink fallback that re-opens to preserve path tracking.
    pub(crate) fn replace_fd(&mut self, fd: OwnedFd) {
        self.fd = fd;
    }

    /// Takes the descriptor out without running the close protocol.
    pub(crate) fn into_fd(self) -> OwnedFd {
        let this = mem::ManuallyDrop::new(self);
        // The ManuallyDrop wrapper suppresses Drop for every other field
        // too; only the descriptor needs moving out.
        unsafe { std::ptr::read(&this.fd) }
    }

    /// Reads at `offset`. A short read is returned as-is.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        loop {
            let rc = unsafe {
                libc::pread(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                    offset as libc::off_t,
                )
            };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let err = Error::last_os_error();
            if err != Error::Os(libc::EINTR) {
                return Err(err);
            }
        }
    }

    /// Reads exactly `buf.len()` bytes at `offset`. A short read is treated
    /// as corruption racing the caller and surfaces as
    /// [`Error::TryAgain`].
    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let n = self.read_at(offset, buf)?;
        if n != buf.len() {
            return Err(Error::TryAgain);
        }
        Ok(())
    }

    /// Writes at `offset`. A short write is returned as-is.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        loop {
            let rc = unsafe {
                libc::pwrite(
                    self.fd.as_raw_fd(),
                    buf.as_ptr().cast(),
                    buf.len(),
                    offset as libc::off_t,
                )
            };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let err = Error::last_os_error();
            if err != Error::Os(libc::EINTR) {
                return Err(err);
            }
        }
    }

    /// Writes all of `buf` at `offset`; a short write surfaces as
    /// [`Error::TryAgain`].
    pub fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let n = self.write_at(offset, buf)?;
        if n != buf.len() {
            return Err(Error::TryAgain);
        }
        Ok(())
    }

    /// Gather-writes all of `bufs` at `offset` in one syscall; a short
    /// write surfaces as [`Error::TryAgain`].
    pub fn write_gather_at(&self, offset: u64, bufs: &[IoSlice<'_>]) -> Result<()> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        loop {
            let rc = unsafe {
                libc::pwritev(
                    self.fd.as_raw_fd(),
                    bufs.as_ptr().cast(),
                    bufs.len() as libc::c_int,
                    offset as libc::off_t,
                )
            };
            if rc >= 0 {
                if rc as usize != total {
                    return Err(Error::TryAgain);
                }
                return Ok(());
            }
            let err = Error::last_os_error();
            if err != Error::Os(libc::EINTR) {
                return Err(err);
            }
        }
    }

    /// Flushes this handle's writes to storage.
    pub fn barrier(&self) -> Result<()> {
        #[cfg(target_os = "linux")]
        let rc = unsafe { libc::fdatasync(self.fd.as_raw_fd()) };
        #[cfg(not(target_os = "linux"))]
        let rc = unsafe { libc::fsync(self.fd.as_raw_fd()) };
        if rc == -1 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    /// Clones this handle, optionally changing mode or caching.
    ///
    /// A plain clone duplicates the descriptor. Changing direct-I/O or sync
    /// caching bits, or the access mode, requires a re-open by current path
    /// because `fcntl` cannot flip those on every platform; the re-opened
    /// descriptor is only accepted once its inode matches this handle's,
    /// retrying until `deadline`.
    pub fn clone_handle(
        &self,
        mode: Option<Mode>,
        caching: Option<CachingMode>,
        deadline: Option<Deadline>,
    ) -> Result<Handle> {
        let new_mode = mode.unwrap_or(self.mode);
        let new_caching = match caching {
            None | Some(CachingMode::Unchanged) => self.caching,
            Some(other) => other,
        };
        let reopen_needed = new_mode != self.mode
            || caching_oflags(new_caching) != caching_oflags(self.caching);
        if !reopen_needed {
            let fd = self.fd.try_clone().map_err(Error::from)?;
            let mut h = Handle::from_parts(
                fd,
                self.kind,
                new_mode,
                new_caching,
                self.flags(),
                self.behavior,
            );
            if let Some(id) = self.inode_if_fetched() {
                h.dev = AtomicU64::new(id.dev);
                h.ino = AtomicU64::new(id.ino);
            }
            return Ok(h);
        }
        let want = self.fetch_inode()?;
        let countdown = crate::deadline::Countdown::begin(deadline);
        loop {
            let path = self.current_path()?;
            if path.as_os_str().is_empty() {
                return Err(Error::NotFound);
            }
            let reopened = match self.kind {
                HandleKind::Directory => Handle::directory(
                    None,
                    &path,
                    new_mode,
                    Creation::OpenExisting,
                    new_caching,
                    self.flags(),
                )?,
                HandleKind::Path => Handle::path(None, &path)?,
                _ => Handle::file(
                    None,
                    &path,
                    new_mode,
                    Creation::OpenExisting,
                    new_caching,
                    self.flags(),
                )?,
            };
            if reopened.fetch_inode()? == want {
                return Ok(reopened);
            }
            countdown.check()?;
            countdown.sleep(std::time::Duration::from_millis(1));
        }
    }

    // The close protocol. Runs at most once; both the explicit close() and
    // Drop funnel through here.
    fn pre_close(&mut self) -> Result<()> {
        let prior = self.flags.fetch_or(FLAG_CLOSED, Ordering::AcqRel);
        if prior & FLAG_CLOSED != 0 {
            return Ok(());
        }
        let mut result = Ok(());
        if self.flags().contains(OpenFlags::UNLINK_ON_FIRST_CLOSE) {
            match fs_ops::unlink(self, Some(Deadline::NOW)) {
                Ok(()) | Err(Error::NotFound) => {}
                Err(err) => result = Err(err),
            }
        }
        if self.caching == CachingMode::SafetyBarriers
            && self.behavior.contains(Behavior::WRITABLE)
        {
            if let Err(err) = self.barrier() {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Closes the handle, running the unlink-on-first-close and safety
    /// barrier protocols. Errors other than "already gone" are surfaced.
    pub fn close(mut self) -> Result<()> {
        self.pre_close()
        // Dropping self closes the descriptor.
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Err(err) = self.pre_close() {
            error!("error in close protocol for fd {}: {err}", self.fd.as_raw_fd());
        }
    }
}

impl AsFd for Handle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for Handle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempdir_handle() -> (tempfile::TempDir, Handle) {
        let dir = tempfile::tempdir().unwrap();
        let h = Handle::directory(
            None,
            dir.path(),
            Mode::Read,
            Creation::OpenExisting,
            CachingMode::All,
            OpenFlags::empty(),
        )
        .unwrap();
        (dir, h)
    }

    #[test]
    fn create_write_read() {
        let (_dir, base) = tempdir_handle();
        let h = Handle::file(
            Some(&base),
            Path::new("f"),
            Mode::Write,
            Creation::OnlyIfNotExist,
            CachingMode::All,
            OpenFlags::empty(),
        )
        .unwrap();
        h.write_all_at(0, b"hello world").unwrap();
        let mut buf = [0u8; 5];
        h.read_exact_at(6, &mut buf).unwrap();
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn only_if_not_exist_collides() {
        let (_dir, base) = tempdir_handle();
        let open = |creation| {
            Handle::file(
                Some(&base),
                Path::new("f"),
                Mode::Write,
                creation,
                CachingMode::All,
                OpenFlags::empty(),
            )
        };
        open(Creation::OnlyIfNotExist).unwrap();
        assert_eq!(open(Creation::OnlyIfNotExist).unwrap_err(), Error::AlreadyExists);
        open(Creation::OpenExisting).unwrap();
    }

    #[test]
    fn inode_identity_is_stable() {
        let (_dir, base) = tempdir_handle();
        let h = Handle::file(
            Some(&base),
            Path::new("f"),
            Mode::Write,
            Creation::IfNeeded,
            CachingMode::All,
            OpenFlags::empty(),
        )
        .unwrap();
        let first = h.fetch_inode().unwrap();
        assert!(first.is_set());
        h.write_all_at(0, b"data").unwrap();
        assert_eq!(h.fetch_inode().unwrap(), first);
        assert_eq!(h.inode_if_fetched(), Some(first));
    }

    #[test]
    fn current_path_empties_after_external_unlink() {
        let (dir, base) = tempdir_handle();
        let h = Handle::file(
            Some(&base),
            Path::new("gone"),
            Mode::Write,
            Creation::IfNeeded,
            CachingMode::All,
            OpenFlags::empty(),
        )
        .unwrap();
        assert!(!h.current_path().unwrap().as_os_str().is_empty());
        std::fs::remove_file(dir.path().join("gone")).unwrap();
        assert!(h.current_path().unwrap().as_os_str().is_empty());
    }

    #[test]
    fn clone_by_dup_keeps_identity() {
        let (_dir, base) = tempdir_handle();
        let h = Handle::file(
            Some(&base),
            Path::new("f"),
            Mode::Write,
            Creation::IfNeeded,
            CachingMode::All,
            OpenFlags::empty(),
        )
        .unwrap();
        let id = h.fetch_inode().unwrap();
        let dup = h.clone_handle(None, None, None).unwrap();
        assert_eq!(dup.fetch_inode().unwrap(), id);
        assert_ne!(dup.as_raw_fd(), h.as_raw_fd());
    }

    #[test]
    fn clone_with_mode_change_reopens() {
        let (_dir, base) = tempdir_handle();
        let h = Handle::file(
            Some(&base),
            Path::new("f"),
            Mode::Write,
            Creation::IfNeeded,
            CachingMode::All,
            OpenFlags::empty(),
        )
        .unwrap();
        h.write_all_at(0, b"x").unwrap();
        let ro = h.clone_handle(Some(Mode::Read), None, None).unwrap();
        assert_eq!(ro.fetch_inode().unwrap(), h.fetch_inode().unwrap());
        assert!(ro.write_at(0, b"y").is_err());
    }

    #[test]
    fn temp_inode_has_no_name() {
        let (_dir, base) = tempdir_handle();
        let h = Handle::temp_inode(&base).unwrap();
        assert!(h.flags().contains(OpenFlags::ANONYMOUS_INODE));
        h.write_all_at(0, b"scratch").unwrap();
        let mut buf = [0u8; 7];
        h.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"scratch");
    }

    #[test]
    fn unlink_on_first_close_removes_entry() {
        let (dir, base) = tempdir_handle();
        let h = Handle::file(
            Some(&base),
            Path::new("ephemeral"),
            Mode::Write,
            Creation::OnlyIfNotExist,
            CachingMode::All,
            OpenFlags::UNLINK_ON_FIRST_CLOSE,
        )
        .unwrap();
        h.close().unwrap();
        assert!(!dir.path().join("ephemeral").exists());
    }
}
