//! Stat records with per-field presence tracking.
//!
//! A [`Stat`] is filled from a handle or from a leafname inside a directory
//! handle. Not every platform can supply every field, so the caller states
//! which fields it wants and the filled record carries a [`StatWant`] bitset
//! of what was actually populated.

use std::ffi::OsStr;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::ffi::OsStrExt;
use std::time::{Duration, SystemTime};

use bitflags::bitflags;

use crate::error::{Error, Result};

/// Kinds of filesystem entry a stat can report.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FileType {
    /// Named pipe (`S_IFIFO`)
    NamedPipe,
    /// Character device (`S_IFCHR`)
    CharDevice,
    /// Block device (`S_IFBLK`)
    BlockDevice,
    /// Directory (`S_IFDIR`)
    Directory,
    /// Regular file (`S_IFREG`)
    RegularFile,
    /// Symbolic link (`S_IFLNK`)
    Symlink,
    /// Unix domain socket (`S_IFSOCK`)
    Socket,
}

impl FileType {
    /// Maps the `S_IFMT` bits of a raw mode.
    pub fn from_mode(mode: u32) -> Option<FileType> {
        match mode & libc::S_IFMT as u32 {
            x if x == libc::S_IFIFO as u32 => Some(FileType::NamedPipe),
            x if x == libc::S_IFCHR as u32 => Some(FileType::CharDevice),
            x if x == libc::S_IFBLK as u32 => Some(FileType::BlockDevice),
            x if x == libc::S_IFDIR as u32 => Some(FileType::Directory),
            x if x == libc::S_IFREG as u32 => Some(FileType::RegularFile),
            x if x == libc::S_IFLNK as u32 => Some(FileType::Symlink),
            x if x == libc::S_IFSOCK as u32 => Some(FileType::Socket),
            _ => None,
        }
    }
}

bitflags! {
    /// Which fields of a [`Stat`] the caller wants, and which were filled.
    /// The default is the empty set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatWant: u32 {
        /// Device id.
        const DEV = 1 << 0;
        /// Inode number.
        const INO = 1 << 1;
        /// Entry kind.
        const TYPE = 1 << 2;
        /// Permission bits.
        const PERMS = 1 << 3;
        /// Hard link count.
        const NLINK = 1 << 4;
        /// Owning user.
        const UID = 1 << 5;
        /// Owning group.
        const GID = 1 << 6;
        /// Device number for device entries.
        const RDEV = 1 << 7;
        /// Access timestamp.
        const ATIM = 1 << 8;
        /// Modification timestamp.
        const MTIM = 1 << 9;
        /// Status-change timestamp.
        const CTIM = 1 << 10;
        /// Size in bytes.
        const SIZE = 1 << 11;
        /// Bytes of storage allocated.
        const ALLOCATED = 1 << 12;
        /// Number of blocks allocated.
        const BLOCKS = 1 << 13;
        /// Preferred I/O block size.
        const BLKSIZE = 1 << 14;
        /// BSD-style file flags.
        const FLAGS = 1 << 15;
        /// Inode generation number.
        const GEN = 1 << 16;
        /// Birth timestamp.
        const BIRTHTIM = 1 << 17;
        /// Entry has unallocated regions.
        const SPARSE = 1 << 18;
        /// Entry is transparently compressed (Windows/NTFS; never set here).
        const COMPRESSED = 1 << 19;
        /// Entry is a reparse point (Windows/NTFS; never set here).
        const REPARSE_POINT = 1 << 20;
    }
}

impl StatWant {
    /// Shorthand for the identity pair used by race-free verification.
    pub fn identity() -> StatWant {
        StatWant::DEV | StatWant::INO
    }
}

/// A stat record. Only fields whose bit is set in [`Stat::want`] are
/// meaningful; the rest hold defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// Which fields below were populated.
    pub want: StatWant,
    /// Device id.
    pub dev: u64,
    /// Inode number.
    pub ino: u64,
    /// Entry kind.
    pub kind: Option<FileType>,
    /// Permission bits (the low 12 bits of the mode).
    pub perms: u32,
    /// Hard link count.
    pub nlink: u64,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Device number, for device entries.
    pub rdev: u64,
    /// Access timestamp, nanosecond precision where the platform keeps it.
    pub atim: SystemTime,
    /// Modification timestamp.
    pub mtim: SystemTime,
    /// Status-change timestamp.
    pub ctim: SystemTime,
    /// Birth timestamp, where the platform records one.
    pub birthtim: SystemTime,
    /// Size in bytes.
    pub size: u64,
    /// Bytes of storage actually allocated.
    pub allocated: u64,
    /// 512-byte blocks allocated.
    pub blocks: u64,
    /// Preferred I/O block size.
    pub blksize: u32,
    /// BSD-style file flags.
    pub flags: u32,
    /// Inode generation number.
    pub generation: u32,
    /// True if allocated storage is smaller than the size.
    pub sparse: bool,
    /// True if transparently compressed. Windows only; never set here.
    pub compressed: bool,
    /// True if a reparse point. Windows only; never set here.
    pub reparse_point: bool,
}

impl Default for Stat {
    fn default() -> Stat {
        Stat {
            want: StatWant::empty(),
            dev: 0,
            ino: 0,
            kind: None,
            perms: 0,
            nlink: 0,
            uid: 0,
            gid: 0,
            rdev: 0,
            atim: SystemTime::UNIX_EPOCH,
            mtim: SystemTime::UNIX_EPOCH,
            ctim: SystemTime::UNIX_EPOCH,
            birthtim: SystemTime::UNIX_EPOCH,
            size: 0,
            allocated: 0,
            blocks: 0,
            blksize: 0,
            flags: 0,
            generation: 0,
            sparse: false,
            compressed: false,
            reparse_point: false,
        }
    }
}

fn timestamp(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        SystemTime::UNIX_EPOCH - Duration::new((-secs) as u64, 0) + Duration::new(0, nsecs as u32)
    }
}

impl Stat {
    /// Fills a record from an open descriptor.
    pub fn fill(fd: BorrowedFd<'_>, want: StatWant) -> Result<Stat> {
        let mut st = mem::MaybeUninit::<libc::stat>::uninit();
        let rc = unsafe { libc::fstat(fd.as_raw_fd(), st.as_mut_ptr()) };
        if rc == -1 {
            return Err(Error::last_os_error());
        }
        Ok(Stat::from_raw(unsafe { st.assume_init() }, want))
    }

    /// Fills a record for `leaf` inside the directory open at `dirfd`,
    /// without following a symlink leaf. This is the primitive behind the
    /// inode verification protocol.
    pub fn fill_at(dirfd: BorrowedFd<'_>, leaf: &OsStr, want: StatWant) -> Result<Stat> {
        let cleaf = std::ffi::CString::new(leaf.as_bytes()).map_err(|_| Error::InvalidArgument)?;
        let mut st = mem::MaybeUninit::<libc::stat>::uninit();
        let rc = unsafe {
            libc::fstatat(
                dirfd.as_raw_fd(),
                cleaf.as_ptr(),
                st.as_mut_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if rc == -1 {
            return Err(Error::last_os_error());
        }
        Ok(Stat::from_raw(unsafe { st.assume_init() }, want))
    }

    /// Converts a raw stat buffer, populating the requested fields.
    pub(crate) fn from_raw(st: libc::stat, want: StatWant) -> Stat {
        let mut out = Stat::default();
        let mut filled = StatWant::empty();
        if want.contains(StatWant::DEV) {
            out.dev = st.st_dev as u64;
            filled |= StatWant::DEV;
        }
        if want.contains(StatWant::INO) {
            out.ino = st.st_ino as u64;
            filled |= StatWant::INO;
        }
        if want.contains(StatWant::TYPE) {
            out.kind = FileType::from_mode(st.st_mode as u32);
            filled |= StatWant::TYPE;
        }
        if want.contains(StatWant::PERMS) {
            out.perms = st.st_mode as u32 & 0o7777;
            filled |= StatWant::PERMS;
        }
        if want.contains(StatWant::NLINK) {
            out.nlink = st.st_nlink as u64;
            filled |= StatWant::NLINK;
        }
        if want.contains(StatWant::UID) {
            out.uid = st.st_uid;
            filled |= StatWant::UID;
        }
        if want.contains(StatWant::GID) {
            out.gid = st.st_gid;
            filled |= StatWant::GID;
        }
        if want.contains(StatWant::RDEV) {
            out.rdev = st.st_rdev as u64;
            filled |= StatWant::RDEV;
        }
        if want.contains(StatWant::ATIM) {
            out.atim = timestamp(st.st_atime as i64, st.st_atime_nsec as i64);
            filled |= StatWant::ATIM;
        }
        if want.contains(StatWant::MTIM) {
            out.mtim = timestamp(st.st_mtime as i64, st.st_mtime_nsec as i64);
            filled |= StatWant::MTIM;
        }
        if want.contains(StatWant::CTIM) {
            out.ctim = timestamp(st.st_ctime as i64, st.st_ctime_nsec as i64);
            filled |= StatWant::CTIM;
        }
        #[cfg(any(target_os = "macos", target_os = "freebsd"))]
        if want.contains(StatWant::BIRTHTIM) {
            out.birthtim = timestamp(st.st_birthtime as i64, st.st_birthtime_nsec as i64);
            filled |= StatWant::BIRTHTIM;
        }
        if want.contains(StatWant::SIZE) {
            out.size = st.st_size as u64;
            filled |= StatWant::SIZE;
        }
        if want.contains(StatWant::ALLOCATED) {
            out.allocated = st.st_blocks as u64 * 512;
            filled |= StatWant::ALLOCATED;
        }
        if want.contains(StatWant::BLOCKS) {
            out.blocks = st.st_blocks as u64;
            filled |= StatWant::BLOCKS;
        }
        if want.contains(StatWant::BLKSIZE) {
            out.blksize = st.st_blksize as u32;
            filled |= StatWant::BLKSIZE;
        }
        #[cfg(any(target_os = "macos", target_os = "freebsd"))]
        {
            if want.contains(StatWant::FLAGS) {
                out.flags = st.st_flags;
                filled |= StatWant::FLAGS;
            }
            if want.contains(StatWant::GEN) {
                out.generation = st.st_gen;
                filled |= StatWant::GEN;
            }
        }
        if want.contains(StatWant::SPARSE) {
            out.sparse = (st.st_blocks as u64 * 512) < st.st_size as u64;
            filled |= StatWant::SPARSE;
        }
        out.want = filled;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsFd;

    #[test]
    fn fill_reports_requested_fields_only() {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(b"hello").unwrap();
        let st = Stat::fill(f.as_fd(), StatWant::identity() | StatWant::SIZE).unwrap();
        assert!(st.want.contains(StatWant::DEV | StatWant::INO | StatWant::SIZE));
        assert!(!st.want.contains(StatWant::UID));
        assert_eq!(st.size, 5);
        assert_ne!(st.ino, 0);
    }

    #[test]
    fn fill_at_does_not_follow_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("target"), b"x").unwrap();
        std::os::unix::fs::symlink("target", dir.path().join("l")).unwrap();
        let d = std::fs::File::open(dir.path()).unwrap();
        let st = Stat::fill_at(d.as_fd(), OsStr::new("l"), StatWant::TYPE).unwrap();
        assert_eq!(st.kind, Some(FileType::Symlink));
    }

    #[test]
    fn kind_mapping() {
        assert_eq!(FileType::from_mode(libc::S_IFREG as u32 | 0o644), Some(FileType::RegularFile));
        assert_eq!(FileType::from_mode(libc::S_IFDIR as u32 | 0o755), Some(FileType::Directory));
        assert_eq!(FileType::from_mode(0), None);
    }
}
