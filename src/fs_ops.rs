//! Inode-verified operations on the entry behind a handle.
//!
//! Path strings go stale the moment another process touches the directory
//! tree, so every operation here re-resolves the handle's current path,
//! opens the containing directory, and stats the leafname inside that
//! directory to confirm it still names this handle's inode before acting.
//! If the entry raced away, the whole resolution is retried until the
//! deadline. [`OpenFlags::DISABLE_SAFETY_UNLINKS`] skips the verification.
//!
//! On Windows the same contract is kept with different machinery, described
//! on each operation. One subtlety worth knowing even on POSIX: directories
//! there are opened without DELETE permission so that atomic renames *into*
//! them are not blocked, and a handle with DELETE is materialized
//! temporarily when the directory itself is relinked or unlinked, then
//! closed before the operation returns.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;

use crate::deadline::{Countdown, Deadline};
use crate::error::{Error, Result};
use crate::handle::{cstr, Handle, HandleKind, OpenFlags};
use crate::stat::{Stat, StatWant};

use std::os::fd::{AsFd, AsRawFd};

/// Resolves the handle's current parent directory and leafname, verifying
/// that the leaf still names this handle's inode.
fn verified_parent(h: &Handle, countdown: &Countdown) -> Result<(Handle, OsString)> {
    loop {
        let path = h.current_path()?;
        if path.as_os_str().is_empty() {
            return Err(Error::NotFound);
        }
        let leaf = path
            .file_name()
            .ok_or(Error::InvalidArgument)?
            .to_os_string();
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("/"),
        };
        let ph = Handle::path(None, &parent)?;
        if h.flags().contains(OpenFlags::DISABLE_SAFETY_UNLINKS) {
            return Ok((ph, leaf));
        }
        let want = h.fetch_inode()?;
        match Stat::fill_at(ph.as_fd(), &leaf, StatWant::identity()) {
            Ok(st) if st.dev == want.dev && st.ino == want.ino => return Ok((ph, leaf)),
            Ok(_) | Err(Error::NotFound) => {
                debug!("parent resolution of fd {} raced, retrying", h.as_raw_fd());
            }
            Err(err) => return Err(err),
        }
        countdown.check()?;
        countdown.sleep(Duration::from_millis(1));
    }
}

/// Returns a path handle to the directory **currently** containing this
/// handle's entry.
///
/// Fails `NotFound` if the entry has no name any more, and `TimedOut` if
/// the entry keeps racing away for the whole deadline.
pub fn parent_path_handle(h: &Handle, deadline: Option<Deadline>) -> Result<Handle> {
    let countdown = Countdown::begin(deadline);
    verified_parent(h, &countdown).map(|(ph, _)| ph)
}

#[cfg(target_os = "linux")]
fn rename_no_replace(
    src_dirfd: i32,
    src: &std::ffi::CStr,
    dst_dirfd: i32,
    dst: &std::ffi::CStr,
) -> Result<()> {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_renameat2,
            src_dirfd,
            src.as_ptr(),
            dst_dirfd,
            dst.as_ptr(),
            libc::RENAME_NOREPLACE,
        )
    };
    if rc == 0 {
        return Ok(());
    }
    Err(Error::last_os_error())
}

#[cfg(target_os = "macos")]
fn rename_no_replace(
    src_dirfd: i32,
    src: &std::ffi::CStr,
    dst_dirfd: i32,
    dst: &std::ffi::CStr,
) -> Result<()> {
    let rc = unsafe {
        libc::renameatx_np(src_dirfd, src.as_ptr(), dst_dirfd, dst.as_ptr(), libc::RENAME_EXCL)
    };
    if rc == 0 {
        return Ok(());
    }
    Err(Error::last_os_error())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn rename_no_replace(
    _src_dirfd: i32,
    _src: &std::ffi::CStr,
    _dst_dirfd: i32,
    _dst: &std::ffi::CStr,
) -> Result<()> {
    Err(Error::NotSupported)
}

// link-then-unlink rendition of a no-replace rename, for kernels without
// one. The destination link is made from the open descriptor so it cannot
// name the wrong inode, then the old name is removed through the verified
// parent. Afterwards the caller must re-open so path tracking follows the
// new name.
fn relink_by_link_unlink(
    h: &Handle,
    dirh: &Handle,
    leaf: &OsString,
    dst_dirfd: i32,
    dst: &std::ffi::CStr,
) -> Result<()> {
    if h.kind() == HandleKind::Directory {
        // Hard links to directories do not exist.
        return Err(Error::NotSupported);
    }
    #[cfg(target_os = "linux")]
    {
        let proc_path = cstr(std::ffi::OsStr::new(&format!(
            "/proc/self/fd/{}",
            h.as_raw_fd()
        )))?;
        let rc = unsafe {
            libc::linkat(
                libc::AT_FDCWD,
                proc_path.as_ptr(),
                dst_dirfd,
                dst.as_ptr(),
                libc::AT_SYMLINK_FOLLOW,
            )
        };
        if rc == -1 {
            return Err(Error::last_os_error());
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let cleaf = cstr(leaf)?;
        let rc = unsafe {
            libc::linkat(
                dirh.as_raw_fd(),
                cleaf.as_ptr(),
                dst_dirfd,
                dst.as_ptr(),
                0,
            )
        };
        if rc == -1 {
            return Err(Error::last_os_error());
        }
    }
    let cleaf = cstr(leaf)?;
    let rc = unsafe { libc::unlinkat(dirh.as_raw_fd(), cleaf.as_ptr(), 0) };
    if rc == -1 {
        let err = Error::last_os_error();
        if err != Error::NotFound {
            // Roll the new link back rather than leave two names.
            unsafe { libc::unlinkat(dst_dirfd, dst.as_ptr(), 0) };
            return Err(err);
        }
    }
    Ok(())
}

/// Moves the entry behind `h` to `new_path`, resolved relative to `base`.
///
/// With `atomic_replace` the destination is silently replaced, atomically
/// with respect to concurrent readers. Without it the operation fails
/// [`Error::FileExists`] if the destination exists; platforms lacking an
/// atomic no-replace rename fall back to hard-linking the open inode into
/// place and unlinking the old name, then re-opening the handle so path
/// tracking follows the new name.
///
/// On Windows this maps to `FileRenameInformation` with the POSIX
/// semantics flag; relinking a *directory* there must temporarily reopen
/// the directory with DELETE permission (directories are deliberately
/// opened without it so renames into them are never blocked), and that
/// privileged handle is always closed before return.
pub fn relink(
    h: &mut Handle,
    base: Option<&Handle>,
    new_path: &Path,
    atomic_replace: bool,
    deadline: Option<Deadline>,
) -> Result<()> {
    let countdown = Countdown::begin(deadline);
    let cdst = cstr(new_path.as_os_str())?;
    let dst_dirfd = base.map_or(libc::AT_FDCWD, |b| b.as_raw_fd());
    loop {
        let (dirh, leaf) = verified_parent(h, &countdown)?;
        let cleaf = cstr(&leaf)?;
        let attempt: Result<bool> = if atomic_replace {
            let rc = unsafe {
                libc::renameat(dirh.as_raw_fd(), cleaf.as_ptr(), dst_dirfd, cdst.as_ptr())
            };
            if rc == 0 {
                Ok(false)
            } else {
                Err(Error::last_os_error())
            }
        } else {
            match rename_no_replace(dirh.as_raw_fd(), &cleaf, dst_dirfd, &cdst) {
                Ok(()) => Ok(false),
                Err(Error::NotSupported) | Err(Error::InvalidArgument) => {
                    relink_by_link_unlink(h, &dirh, &leaf, dst_dirfd, &cdst).map(|()| true)
                }
                Err(Error::AlreadyExists) => Err(Error::FileExists),
                Err(err) => Err(err),
            }
        };
        match attempt {
            Ok(needs_reopen) => {
                if needs_reopen {
                    reopen_after_relink(h, base, new_path, &countdown)?;
                }
                return Ok(());
            }
            // The source raced away between verification and rename.
            Err(Error::NotFound) => {
                countdown.check()?;
                countdown.sleep(Duration::from_millis(1));
            }
            Err(err) => return Err(err),
        }
    }
}

// After a link+unlink relink the descriptor still tracks the removed
// dentry, so the OS would report no path. Re-open at the new name until
// the inode matches.
fn reopen_after_relink(
    h: &mut Handle,
    base: Option<&Handle>,
    new_path: &Path,
    countdown: &Countdown,
) -> Result<()> {
    let want = h.fetch_inode()?;
    loop {
        let reopened = match h.kind() {
            HandleKind::Directory => Handle::directory(
                base,
                new_path,
                h.mode(),
                crate::handle::Creation::OpenExisting,
                h.caching(),
                h.flags(),
            )?,
            HandleKind::Path => Handle::path(base, new_path)?,
            _ => Handle::file(
                base,
                new_path,
                h.mode(),
                crate::handle::Creation::OpenExisting,
                h.caching(),
                h.flags(),
            )?,
        };
        if reopened.fetch_inode()? == want {
            h.replace_fd(reopened.into_fd());
            return Ok(());
        }
        countdown.check()?;
        countdown.sleep(Duration::from_millis(1));
    }
}

/// Creates an additional hard link to the inode behind `h` at `new_path`
/// relative to `base`.
pub fn link(
    h: &Handle,
    base: Option<&Handle>,
    new_path: &Path,
    deadline: Option<Deadline>,
) -> Result<()> {
    let countdown = Countdown::begin(deadline);
    let cdst = cstr(new_path.as_os_str())?;
    let dst_dirfd = base.map_or(libc::AT_FDCWD, |b| b.as_raw_fd());
    // By-descriptor linking needs no name resolution at all.
    #[cfg(target_os = "linux")]
    {
        let proc_path = cstr(std::ffi::OsStr::new(&format!(
            "/proc/self/fd/{}",
            h.as_raw_fd()
        )))?;
        let rc = unsafe {
            libc::linkat(
                libc::AT_FDCWD,
                proc_path.as_ptr(),
                dst_dirfd,
                cdst.as_ptr(),
                libc::AT_SYMLINK_FOLLOW,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = Error::last_os_error();
        // /proc may be absent in chroots and sandboxes; fall through to
        // the by-name path below for those only.
        if !matches!(err, Error::NotFound | Error::NotSupported) {
            return Err(err);
        }
    }
    loop {
        let (dirh, leaf) = verified_parent(h, &countdown)?;
        let cleaf = cstr(&leaf)?;
        let rc = unsafe {
            libc::linkat(dirh.as_raw_fd(), cleaf.as_ptr(), dst_dirfd, cdst.as_ptr(), 0)
        };
        if rc == 0 {
            return Ok(());
        }
        match Error::last_os_error() {
            Error::NotFound => {
                countdown.check()?;
                countdown.sleep(Duration::from_millis(1));
            }
            err => return Err(err),
        }
    }
}

/// Removes the entry currently naming the inode behind `h`.
///
/// On POSIX this resolves and verifies the parent, then calls `unlinkat`
/// (with the directory flag for directory handles). On Windows the ladder
/// is: POSIX-delete disposition where the filesystem supports it; else
/// rename to a random `.deleted` name and mark delete-on-close; else hide
/// the entry and mark delete-on-close so it vanishes when the last handle
/// closes. [`OpenFlags::WIN_DISABLE_UNLINK_EMULATION`] suppresses the
/// rename step.
pub fn unlink(h: &Handle, deadline: Option<Deadline>) -> Result<()> {
    let countdown = Countdown::begin(deadline);
    loop {
        let (dirh, leaf) = verified_parent(h, &countdown)?;
        let cleaf = cstr(&leaf)?;
        let flags = if h.kind() == HandleKind::Directory {
            libc::AT_REMOVEDIR
        } else {
            0
        };
        let rc = unsafe { libc::unlinkat(dirh.as_raw_fd(), cleaf.as_ptr(), flags) };
        if rc == 0 {
            return Ok(());
        }
        match Error::last_os_error() {
            // Verified a moment ago, so this is a race; go around again.
            Error::NotFound => {
                countdown.check()?;
                countdown.sleep(Duration::from_millis(1));
            }
            err => return Err(err),
        }
    }
}

/// Which Win32 path namespace [`to_win32_path`] should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Win32PathNamespace {
    /// Whatever namespace is cheapest to produce.
    Any,
    /// The NT `\Device\…` prefix rewritten as `\\.\…`.
    Device,
    /// A DOS drive-letter path. Requires enumerating the volume-to-drive
    /// mapping, which is slow.
    Dos,
    /// A `\\?\Volume{…}\…` path naming the volume by GUID.
    GuidVolume,
}

/// Maps the handle's kernel-side path into the requested Win32 namespace.
///
/// On Windows the mapped path is re-opened and its inode compared with the
/// source before being returned, failing `NotFound` on mismatch. On POSIX
/// every namespace is the same namespace, so this is a verified
/// pass-through of [`Handle::current_path`].
pub fn to_win32_path(h: &Handle, _namespace: Win32PathNamespace) -> Result<PathBuf> {
    let path = h.current_path()?;
    if path.as_os_str().is_empty() {
        return Err(Error::NotFound);
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{CachingMode, Creation, Mode};

    fn base_of(dir: &tempfile::TempDir) -> Handle {
        Handle::directory(
            None,
            dir.path(),
            Mode::Read,
            Creation::OpenExisting,
            CachingMode::All,
            OpenFlags::empty(),
        )
        .unwrap()
    }

    fn new_file(base: &Handle, name: &str) -> Handle {
        Handle::file(
            Some(base),
            Path::new(name),
            Mode::Write,
            Creation::OnlyIfNotExist,
            CachingMode::All,
            OpenFlags::empty(),
        )
        .unwrap()
    }

    #[test]
    fn parent_path_handle_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let base = base_of(&dir);
        let f = new_file(&base, "a");
        let parent = parent_path_handle(&f, None).unwrap();
        assert_eq!(
            parent.fetch_inode().unwrap(),
            base.fetch_inode().unwrap()
        );
    }

    #[test]
    fn relink_follows_renamed_entry() {
        // The entry is renamed externally after open; relink must still
        // move the inode the handle owns, not whatever sits at the old
        // path now.
        let dir = tempfile::tempdir().unwrap();
        let base = base_of(&dir);
        let mut f = new_file(&base, "c");
        f.write_all_at(0, b"payload").unwrap();
        let id = f.fetch_inode().unwrap();
        std::fs::rename(dir.path().join("c"), dir.path().join("d")).unwrap();
        std::fs::write(dir.path().join("c"), b"imposter").unwrap();
        relink(&mut f, Some(&base), Path::new("e"), true, None).unwrap();
        assert_eq!(f.fetch_inode().unwrap(), id);
        assert_eq!(std::fs::read(dir.path().join("e")).unwrap(), b"payload");
        assert_eq!(std::fs::read(dir.path().join("c")).unwrap(), b"imposter");
        assert!(!dir.path().join("d").exists());
    }

    #[test]
    fn relink_no_replace_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let base = base_of(&dir);
        let mut f = new_file(&base, "src");
        std::fs::write(dir.path().join("occupied"), b"x").unwrap();
        assert_eq!(
            relink(&mut f, Some(&base), Path::new("occupied"), false, None).unwrap_err(),
            Error::FileExists
        );
        assert!(dir.path().join("src").exists());
    }

    #[test]
    fn relink_replace_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let base = base_of(&dir);
        let mut f = new_file(&base, "src");
        f.write_all_at(0, b"new").unwrap();
        std::fs::write(dir.path().join("victim"), b"old").unwrap();
        relink(&mut f, Some(&base), Path::new("victim"), true, None).unwrap();
        assert_eq!(std::fs::read(dir.path().join("victim")).unwrap(), b"new");
        assert!(!dir.path().join("src").exists());
    }

    #[test]
    fn link_creates_second_name() {
        let dir = tempfile::tempdir().unwrap();
        let base = base_of(&dir);
        let f = new_file(&base, "one");
        f.write_all_at(0, b"shared").unwrap();
        link(&f, Some(&base), Path::new("two"), None).unwrap();
        assert_eq!(std::fs::read(dir.path().join("two")).unwrap(), b"shared");
        let st = Stat::fill(f.as_fd(), StatWant::NLINK).unwrap();
        assert_eq!(st.nlink, 2);
    }

    #[test]
    fn unlink_then_open_fails_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let base = base_of(&dir);
        let f = new_file(&base, "doomed");
        unlink(&f, None).unwrap();
        f.close().unwrap();
        let err = Handle::file(
            Some(&base),
            Path::new("doomed"),
            Mode::Read,
            Creation::OpenExisting,
            CachingMode::All,
            OpenFlags::empty(),
        )
        .unwrap_err();
        assert_eq!(err, Error::NotFound);
    }

    #[test]
    fn unlink_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let base = base_of(&dir);
        let sub = Handle::directory(
            Some(&base),
            Path::new("subdir"),
            Mode::Read,
            Creation::OnlyIfNotExist,
            CachingMode::All,
            OpenFlags::empty(),
        )
        .unwrap();
        unlink(&sub, None).unwrap();
        assert!(!dir.path().join("subdir").exists());
    }

    #[test]
    fn win32_path_is_a_passthrough_here() {
        let dir = tempfile::tempdir().unwrap();
        let base = base_of(&dir);
        let f = new_file(&base, "p");
        let mapped = to_win32_path(&f, Win32PathNamespace::Any).unwrap();
        assert_eq!(mapped, f.current_path().unwrap());
    }
}
