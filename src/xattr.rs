//! Extended attributes on open handles.
//!
//! POSIX maps these straight onto the `f*xattr` family (Linux, macOS) or
//! `extattr_*` in the user namespace (FreeBSD).
//!
//! On Windows the same surface is backed by NTFS alternate data streams,
//! because native EA records are append-only and cannot replace a value.
//! The `set` protocol there: create a stream under a random name
//! (fail-if-exists), write the whole value, atomically rename the stream
//! over the target name with the POSIX rename flag, and delete the scratch
//! stream on any failure. A separate Windows-only surface exposes the raw
//! EA records for callers who want them, append-only quirk and all.

use std::ffi::{OsStr, OsString};
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStringExt;

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::handle::{cstr, Handle};

/// The largest individual value [`copy_all_to`] will move.
///
/// The copy works through one reusable scratch buffer of roughly twice
/// this size, which also bounds it.
pub const COPY_VALUE_LIMIT: usize = 64 * 1024;

/// Lists the extended attribute names present on `h`.
pub fn list(h: &Handle) -> Result<Vec<OsString>> {
    loop {
        let size = list_raw(h, &mut [])?;
        if size == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; size];
        match list_raw(h, &mut buf) {
            Ok(n) => {
                buf.truncate(n);
                return Ok(split_names(&buf));
            }
            // Grew between the two calls; size again.
            Err(Error::NoBufferSpace) => continue,
            Err(err) => return Err(err),
        }
    }
}

#[cfg(target_os = "linux")]
fn list_raw(h: &Handle, buf: &mut [u8]) -> Result<usize> {
    let rc = unsafe {
        libc::flistxattr(h.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
    };
    if rc < 0 {
        return Err(Error::last_os_error());
    }
    Ok(rc as usize)
}

#[cfg(target_os = "macos")]
fn list_raw(h: &Handle, buf: &mut [u8]) -> Result<usize> {
    let rc = unsafe {
        libc::flistxattr(h.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0)
    };
    if rc < 0 {
        return Err(Error::last_os_error());
    }
    Ok(rc as usize)
}

#[cfg(target_os = "freebsd")]
fn list_raw(h: &Handle, buf: &mut [u8]) -> Result<usize> {
    let rc = unsafe {
        libc::extattr_list_fd(
            h.as_raw_fd(),
            libc::EXTATTR_NAMESPACE_USER,
            buf.as_mut_ptr().cast(),
            buf.len(),
        )
    };
    if rc < 0 {
        return Err(Error::last_os_error());
    }
    Ok(rc as usize)
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn split_names(buf: &[u8]) -> Vec<OsString> {
    buf.split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| OsString::from_vec(s.to_vec()))
        .collect()
}

#[cfg(target_os = "freebsd")]
fn split_names(buf: &[u8]) -> Vec<OsString> {
    // extattr lists are length-prefixed, not NUL-separated.
    let mut names = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        let len = buf[pos] as usize;
        pos += 1;
        if pos + len > buf.len() {
            break;
        }
        names.push(OsString::from_vec(buf[pos..pos + len].to_vec()));
        pos += len;
    }
    names
}

/// Reads the value of extended attribute `name` on `h`.
pub fn get(h: &Handle, name: &OsStr) -> Result<Vec<u8>> {
    let cname = cstr(name)?;
    loop {
        let size = get_raw(h, &cname, &mut [])?;
        let mut buf = vec![0u8; size];
        if size == 0 {
            return Ok(buf);
        }
        match get_raw(h, &cname, &mut buf) {
            Ok(n) => {
                buf.truncate(n);
                return Ok(buf);
            }
            Err(Error::NoBufferSpace) => continue,
            Err(err) => return Err(err),
        }
    }
}

#[cfg(target_os = "linux")]
fn get_raw(h: &Handle, name: &std::ffi::CStr, buf: &mut [u8]) -> Result<usize> {
    let rc = unsafe {
        libc::fgetxattr(h.as_raw_fd(), name.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
    };
    if rc < 0 {
        let err = Error::last_os_error();
        // The attribute namespace reports absence as ENODATA here.
        return Err(if err == Error::Os(libc::ENODATA) { Error::NotFound } else { err });
    }
    Ok(rc as usize)
}

#[cfg(target_os = "macos")]
fn get_raw(h: &Handle, name: &std::ffi::CStr, buf: &mut [u8]) -> Result<usize> {
    let rc = unsafe {
        libc::fgetxattr(
            h.as_raw_fd(),
            name.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
            0,
            0,
        )
    };
    if rc < 0 {
        let err = Error::last_os_error();
        return Err(if err == Error::Os(libc::ENOATTR) { Error::NotFound } else { err });
    }
    Ok(rc as usize)
}

#[cfg(target_os = "freebsd")]
fn get_raw(h: &Handle, name: &std::ffi::CStr, buf: &mut [u8]) -> Result<usize> {
    let rc = unsafe {
        libc::extattr_get_fd(
            h.as_raw_fd(),
            libc::EXTATTR_NAMESPACE_USER,
            name.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
        )
    };
    if rc < 0 {
        let err = Error::last_os_error();
        return Err(if err == Error::Os(libc::ENOATTR) { Error::NotFound } else { err });
    }
    Ok(rc as usize)
}

/// How [`set`] should treat an existing attribute of the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SetMode {
    Replace,
    CreateOnly,
}

/// Sets extended attribute `name` to `value`, replacing any existing
/// value.
pub fn set(h: &Handle, name: &OsStr, value: &[u8]) -> Result<()> {
    set_mode(h, name, value, SetMode::Replace)
}

pub(crate) fn set_mode(h: &Handle, name: &OsStr, value: &[u8], mode: SetMode) -> Result<()> {
    let cname = cstr(name)?;
    #[cfg(target_os = "linux")]
    {
        let flags = match mode {
            SetMode::Replace => 0,
            SetMode::CreateOnly => libc::XATTR_CREATE,
        };
        let rc = unsafe {
            libc::fsetxattr(
                h.as_raw_fd(),
                cname.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                flags,
            )
        };
        if rc < 0 {
            return Err(Error::last_os_error());
        }
    }
    #[cfg(target_os = "macos")]
    {
        let flags = match mode {
            SetMode::Replace => 0,
            SetMode::CreateOnly => libc::XATTR_CREATE,
        };
        let rc = unsafe {
            libc::fsetxattr(
                h.as_raw_fd(),
                cname.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                0,
                flags,
            )
        };
        if rc < 0 {
            return Err(Error::last_os_error());
        }
    }
    #[cfg(target_os = "freebsd")]
    {
        if mode == SetMode::CreateOnly {
            let mut probe = [0u8; 0];
            match get_raw(h, &cname, &mut probe) {
                Err(Error::NotFound) => {}
                Err(err) => return Err(err),
                Ok(_) => return Err(Error::AlreadyExists),
            }
        }
        let rc = unsafe {
            libc::extattr_set_fd(
                h.as_raw_fd(),
                libc::EXTATTR_NAMESPACE_USER,
                cname.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
            )
        };
        if rc < 0 {
            return Err(Error::last_os_error());
        }
    }
    Ok(())
}

/// Removes extended attribute `name` from `h`.
pub fn remove(h: &Handle, name: &OsStr) -> Result<()> {
    let cname = cstr(name)?;
    #[cfg(target_os = "linux")]
    let rc = unsafe { libc::fremovexattr(h.as_raw_fd(), cname.as_ptr()) };
    #[cfg(target_os = "macos")]
    let rc = unsafe { libc::fremovexattr(h.as_raw_fd(), cname.as_ptr(), 0) };
    #[cfg(target_os = "freebsd")]
    let rc = unsafe {
        libc::extattr_delete_fd(h.as_raw_fd(), libc::EXTATTR_NAMESPACE_USER, cname.as_ptr())
    };
    if rc < 0 {
        let err = Error::last_os_error();
        #[cfg(target_os = "linux")]
        let absent = err == Error::Os(libc::ENODATA);
        #[cfg(not(target_os = "linux"))]
        let absent = err == Error::Os(libc::ENOATTR);
        return Err(if absent { Error::NotFound } else { err });
    }
    Ok(())
}

/// Copies every extended attribute from `src` onto `dst`, returning how
/// many were copied.
///
/// With `replace` set, existing attributes on `dst` are overwritten;
/// otherwise they are left alone. Values larger than
/// [`COPY_VALUE_LIMIT`] fail `NoBufferSpace`, keeping the whole copy
/// inside one bounded scratch buffer.
pub fn copy_all_to(src: &Handle, dst: &Handle, replace: bool) -> Result<usize> {
    let names: SmallVec<[OsString; 8]> = SmallVec::from_vec(list(src)?);
    let mut scratch = vec![0u8; COPY_VALUE_LIMIT];
    let mut copied = 0usize;
    for name in &names {
        let cname = cstr(name)?;
        let len = match get_raw(src, &cname, &mut scratch) {
            Ok(len) => len,
            Err(Error::NoBufferSpace) => return Err(Error::NoBufferSpace),
            // Removed while we were iterating.
            Err(Error::NotFound) => continue,
            Err(err) => return Err(err),
        };
        let mode = if replace { SetMode::Replace } else { SetMode::CreateOnly };
        match set_mode(dst, name, &scratch[..len], mode) {
            Ok(()) => copied += 1,
            Err(Error::AlreadyExists) if !replace => {}
            Err(err) => return Err(err),
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{CachingMode, Creation, Mode, OpenFlags};
    use std::path::Path;

    fn file_in(dir: &tempfile::TempDir, name: &str) -> Handle {
        let base = Handle::directory(
            None,
            dir.path(),
            Mode::Read,
            Creation::OpenExisting,
            CachingMode::All,
            OpenFlags::empty(),
        )
        .unwrap();
        Handle::file(
            Some(&base),
            Path::new(name),
            Mode::Write,
            Creation::IfNeeded,
            CachingMode::All,
            OpenFlags::empty(),
        )
        .unwrap()
    }

    // tmpfs and some CI filesystems refuse user xattrs; skip quietly there.
    fn xattrs_usable(h: &Handle) -> bool {
        set(h, OsStr::new("user.probe"), b"1").is_ok()
    }

    #[test]
    fn set_get_overwrite_remove() {
        let dir = tempfile::tempdir().unwrap();
        let f = file_in(&dir, "x");
        if !xattrs_usable(&f) {
            return;
        }
        set(&f, OsStr::new("user.k"), b"v1").unwrap();
        assert_eq!(get(&f, OsStr::new("user.k")).unwrap(), b"v1");
        set(&f, OsStr::new("user.k"), b"v2").unwrap();
        assert_eq!(get(&f, OsStr::new("user.k")).unwrap(), b"v2");
        assert!(list(&f).unwrap().iter().any(|n| n == "user.k"));
        remove(&f, OsStr::new("user.k")).unwrap();
        assert_eq!(get(&f, OsStr::new("user.k")).unwrap_err(), Error::NotFound);
    }

    #[test]
    fn copy_all_respects_replace_flag() {
        let dir = tempfile::tempdir().unwrap();
        let a = file_in(&dir, "a");
        let b = file_in(&dir, "b");
        if !xattrs_usable(&a) {
            return;
        }
        set(&a, OsStr::new("user.one"), b"1").unwrap();
        set(&a, OsStr::new("user.two"), b"2").unwrap();
        set(&b, OsStr::new("user.one"), b"kept").unwrap();
        copy_all_to(&a, &b, false).unwrap();
        assert_eq!(get(&b, OsStr::new("user.one")).unwrap(), b"kept");
        assert_eq!(get(&b, OsStr::new("user.two")).unwrap(), b"2");
        copy_all_to(&a, &b, true).unwrap();
        assert_eq!(get(&b, OsStr::new("user.one")).unwrap(), b"1");
    }
}
