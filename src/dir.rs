//! Directory enumeration into reusable buffers.
//!
//! [`read`] fills a caller-owned [`DirBuffers`] with entries, each carrying
//! a leafname that borrows the buffers' kernel buffer and a partially
//! populated stat record. Reusing one `DirBuffers` across calls keeps the
//! kernel buffer allocation alive. Exclusive use of the buffers during a
//! read is enforced by the `&mut` borrow, which plays the role the
//! original design gave a compare-and-swap spinlock on the buffer object.

use std::ffi::{OsStr, OsString};
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;

use memchr::memchr3;

use crate::error::{Error, Result};
use crate::handle::{Handle, HandleKind};
use crate::stat::{FileType, Stat, StatWant};

/// One enumerated entry. The leafname borrows the [`DirBuffers`] it came
/// from and must not outlive it.
#[derive(Debug, Clone, Copy)]
pub struct DirEntry<'a> {
    /// The entry's name within the directory.
    pub leafname: &'a OsStr,
    /// Stat fields for the entry; see [`DirBuffers::want`] for which ones
    /// enumeration filled.
    pub stat: Stat,
}

/// Entry filtering applied during enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Filtering {
    /// Return everything except `.` and `..`.
    #[default]
    None,
    /// Additionally skip entries named like the Windows "simulated unlink"
    /// renames. POSIX unlinks are real, so this is a no-op here.
    FastDeleted,
}

/// Parameters for one [`read`] call.
#[derive(Debug, Default)]
pub struct ReadRequest {
    /// Optional glob the leafname must match (shell wildcard syntax). A
    /// glob with no wildcard characters takes a stat fast path instead of
    /// enumerating.
    pub glob: Option<OsString>,
    /// Entry filtering mode.
    pub filtering: Filtering,
    /// Stat fields the caller would like. Enumeration fills the subset the
    /// platform hands out for free; see [`DirBuffers::want`].
    pub want: StatWant,
}

#[derive(Debug, Clone, Copy)]
struct EntryMeta {
    name_off: usize,
    name_len: usize,
    stat: Stat,
}

/// Reusable enumeration buffers: a kernel buffer the directory stream is
/// read into, and the parsed entry table pointing into it.
#[derive(Debug)]
pub struct DirBuffers {
    kernel: Vec<u8>,
    entries: Vec<EntryMeta>,
    max_entries: usize,
    done: bool,
    want: StatWant,
}

impl DirBuffers {
    /// Creates buffers able to hold `max_entries` entries per read, backed
    /// by a kernel buffer of `kernel_bytes`.
    pub fn with_capacity(max_entries: usize, kernel_bytes: usize) -> DirBuffers {
        DirBuffers {
            kernel: vec![0u8; kernel_bytes.max(1024)],
            entries: Vec::with_capacity(max_entries),
            max_entries: max_entries.max(1),
            done: false,
            want: StatWant::empty(),
        }
    }

    /// Buffers sized for bulk scans: 64 KiB of kernel buffer.
    pub fn bulk() -> DirBuffers {
        DirBuffers::with_capacity(4096, 64 * 1024)
    }

    /// Number of entries the last read produced.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the last read produced no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if the directory was fully enumerated; false if the buffers
    /// filled up first and another read is needed.
    pub fn done(&self) -> bool {
        self.done
    }

    /// Which stat fields enumeration populated on every entry.
    pub fn want(&self) -> StatWant {
        self.want
    }

    /// The `index`th entry of the last read.
    pub fn get(&self, index: usize) -> Option<DirEntry<'_>> {
        self.entries.get(index).map(|m| DirEntry {
            leafname: OsStr::from_bytes(&self.kernel[m.name_off..m.name_off + m.name_len]),
            stat: m.stat,
        })
    }

    /// Iterates the entries of the last read.
    pub fn iter(&self) -> impl Iterator<Item = DirEntry<'_>> {
        (0..self.entries.len()).map(move |i| self.get(i).unwrap())
    }

    fn reset(&mut self) {
        self.entries.clear();
        self.done = false;
        self.want = StatWant::empty();
    }

    // Appends a name to the kernel arena, growing it if the caller's size
    // was too small for the entries requested.
    fn push_name(&mut self, used: &mut usize, name: &[u8], stat: Stat) {
        if *used + name.len() > self.kernel.len() {
            self.kernel.resize((*used + name.len()).next_power_of_two(), 0);
        }
        self.kernel[*used..*used + name.len()].copy_from_slice(name);
        self.entries.push(EntryMeta { name_off: *used, name_len: name.len(), stat });
        *used += name.len();
    }
}

fn glob_is_literal(glob: &OsStr) -> bool {
    memchr3(b'*', b'?', b'[', glob.as_bytes()).is_none()
}

fn matches_glob(pattern: Option<&glob::Pattern>, name: &[u8]) -> bool {
    match pattern {
        None => true,
        Some(p) => match std::str::from_utf8(name) {
            Ok(s) => p.matches(s),
            Err(_) => false,
        },
    }
}

fn keep_entry(name: &[u8], filtering: Filtering) -> bool {
    if name == b"." || name == b".." {
        return false;
    }
    // FastDeleted filtering only has meaning where unlinks are simulated
    // by renaming; nothing to skip on POSIX.
    let _ = filtering;
    true
}

/// Enumerates `h` into `bufs` according to `req`.
///
/// Each call restarts enumeration from the beginning of the directory.
/// On return, [`DirBuffers::done`] tells whether everything fit; if not,
/// enlarge the buffers and call again.
pub fn read(h: &Handle, bufs: &mut DirBuffers, req: &ReadRequest) -> Result<()> {
    if h.kind() != HandleKind::Directory {
        return Err(Error::NotADirectory);
    }
    bufs.reset();

    // A glob naming exactly one entry wants a stat, not an enumeration.
    if let Some(glob_os) = &req.glob {
        if glob_is_literal(glob_os) {
            let mut used = 0usize;
            match Stat::fill_at(as_fd(h), glob_os, req.want | StatWant::identity()) {
                Ok(st) => {
                    bufs.want = st.want;
                    bufs.push_name(&mut used, glob_os.as_bytes(), st);
                }
                Err(Error::NotFound) => {}
                Err(err) => return Err(err),
            }
            bufs.done = true;
            return Ok(());
        }
    }

    let pattern = match &req.glob {
        Some(g) => Some(
            glob::Pattern::new(g.to_str().ok_or(Error::InvalidArgument)?)
                .map_err(|_| Error::InvalidArgument)?,
        ),
        None => None,
    };
    read_native(h, bufs, pattern.as_ref(), req.filtering)
}

fn as_fd(h: &Handle) -> std::os::fd::BorrowedFd<'_> {
    use std::os::fd::AsFd;
    h.as_fd()
}

#[cfg(target_os = "linux")]
fn read_native(
    h: &Handle,
    bufs: &mut DirBuffers,
    pattern: Option<&glob::Pattern>,
    filtering: Filtering,
) -> Result<()> {
    // Rewind: each read is a fresh enumeration.
    let rc = unsafe { libc::lseek(h.as_raw_fd(), 0, libc::SEEK_SET) };
    if rc == -1 {
        return Err(Error::last_os_error());
    }
    let mut batch = vec![0u8; 64 * 1024];
    let mut used = 0usize;
    bufs.want = StatWant::INO | StatWant::TYPE;
    loop {
        if bufs.entries.len() >= bufs.max_entries {
            bufs.done = false;
            return Ok(());
        }
        let n = unsafe {
            libc::syscall(
                libc::SYS_getdents64,
                h.as_raw_fd(),
                batch.as_mut_ptr(),
                batch.len(),
            )
        };
        if n < 0 {
            return Err(Error::last_os_error());
        }
        if n == 0 {
            bufs.done = true;
            return Ok(());
        }
        let mut pos = 0usize;
        while pos < n as usize {
            // struct linux_dirent64: u64 ino, i64 off, u16 reclen, u8 type,
            // then the NUL-terminated name.
            let rec = &batch[pos..];
            let ino = u64::from_ne_bytes(rec[0..8].try_into().unwrap());
            let reclen = u16::from_ne_bytes(rec[16..18].try_into().unwrap()) as usize;
            let dtype = rec[18];
            let name_bytes = &rec[19..reclen];
            let name_end = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
            let name = &name_bytes[..name_end];
            pos += reclen;
            if !keep_entry(name, filtering) || !matches_glob(pattern, name) {
                continue;
            }
            let mut st = Stat { ino, ..Stat::default() };
            st.want = StatWant::INO;
            if let Some(kind) = dtype_to_kind(dtype) {
                st.kind = Some(kind);
                st.want |= StatWant::TYPE;
            } else {
                // This filesystem's getdents omits the type.
                bufs.want.remove(StatWant::TYPE);
            }
            bufs.push_name(&mut used, name, st);
        }
    }
}

#[cfg(target_os = "linux")]
fn dtype_to_kind(dtype: u8) -> Option<FileType> {
    match dtype {
        libc::DT_FIFO => Some(FileType::NamedPipe),
        libc::DT_CHR => Some(FileType::CharDevice),
        libc::DT_BLK => Some(FileType::BlockDevice),
        libc::DT_DIR => Some(FileType::Directory),
        libc::DT_REG => Some(FileType::RegularFile),
        libc::DT_LNK => Some(FileType::Symlink),
        libc::DT_SOCK => Some(FileType::Socket),
        _ => None,
    }
}

#[cfg(not(target_os = "linux"))]
fn read_native(
    h: &Handle,
    bufs: &mut DirBuffers,
    pattern: Option<&glob::Pattern>,
    filtering: Filtering,
) -> Result<()> {
    // readdir consumes a descriptor, so enumerate through a duplicate.
    let dup = unsafe { libc::fcntl(h.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 0) };
    if dup == -1 {
        return Err(Error::last_os_error());
    }
    let dirp = unsafe { libc::fdopendir(dup) };
    if dirp.is_null() {
        let err = Error::last_os_error();
        unsafe { libc::close(dup) };
        return Err(err);
    }
    unsafe { libc::rewinddir(dirp) };
    let mut used = 0usize;
    bufs.want = StatWant::INO | StatWant::TYPE;
    let result = loop {
        if bufs.entries.len() >= bufs.max_entries {
            bufs.done = false;
            break Ok(());
        }
        nix::errno::Errno::clear();
        let ent = unsafe { libc::readdir(dirp) };
        if ent.is_null() {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(0) | None => {
                    bufs.done = true;
                    break Ok(());
                }
                Some(errno) => break Err(Error::from_errno(errno)),
            }
        }
        let ent = unsafe { &*ent };
        let name_cstr = unsafe { std::ffi::CStr::from_ptr(ent.d_name.as_ptr()) };
        let name = name_cstr.to_bytes();
        if !keep_entry(name, filtering) || !matches_glob(pattern, name) {
            continue;
        }
        let mut st = Stat { ino: ent.d_ino as u64, ..Stat::default() };
        st.want = StatWant::INO;
        if let Some(kind) = bsd_dtype_to_kind(ent.d_type) {
            st.kind = Some(kind);
            st.want |= StatWant::TYPE;
        } else {
            bufs.want.remove(StatWant::TYPE);
        }
        let name = name.to_vec();
        bufs.push_name(&mut used, &name, st);
    };
    unsafe { libc::closedir(dirp) };
    result
}

#[cfg(not(target_os = "linux"))]
fn bsd_dtype_to_kind(dtype: u8) -> Option<FileType> {
    match dtype {
        libc::DT_FIFO => Some(FileType::NamedPipe),
        libc::DT_CHR => Some(FileType::CharDevice),
        libc::DT_BLK => Some(FileType::BlockDevice),
        libc::DT_DIR => Some(FileType::Directory),
        libc::DT_REG => Some(FileType::RegularFile),
        libc::DT_LNK => Some(FileType::Symlink),
        libc::DT_SOCK => Some(FileType::Socket),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{CachingMode, Creation, Mode, OpenFlags};
    use std::collections::BTreeSet;
    use std::path::Path;

    fn dir_with(names: &[&str]) -> (tempfile::TempDir, Handle) {
        let dir = tempfile::tempdir().unwrap();
        for n in names {
            std::fs::write(dir.path().join(n), b"x").unwrap();
        }
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
    fn enumerates_all_entries_once() {
        let (_d, h) = dir_with(&["alpha", "beta", "gamma"]);
        let mut bufs = DirBuffers::bulk();
        read(&h, &mut bufs, &ReadRequest::default()).unwrap();
        assert!(bufs.done());
        let names: BTreeSet<String> = bufs
            .iter()
            .map(|e| e.leafname.to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 3, "names must be distinct");
        assert_eq!(
            names,
            ["alpha", "beta", "gamma"].iter().map(|s| s.to_string()).collect()
        );
        for e in bufs.iter() {
            assert!(!e.leafname.is_empty());
            assert_ne!(e.leafname, ".");
            assert_ne!(e.leafname, "..");
        }
    }

    #[test]
    fn entries_carry_inode_and_type() {
        let (dir, h) = dir_with(&["file"]);
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let mut bufs = DirBuffers::bulk();
        read(&h, &mut bufs, &ReadRequest::default()).unwrap();
        assert!(bufs.want().contains(StatWant::INO));
        for e in bufs.iter() {
            assert_ne!(e.stat.ino, 0);
            if bufs.want().contains(StatWant::TYPE) {
                let expect = if e.leafname == "sub" {
                    FileType::Directory
                } else {
                    FileType::RegularFile
                };
                assert_eq!(e.stat.kind, Some(expect));
            }
        }
    }

    #[test]
    fn glob_filters_entries() {
        let (_d, h) = dir_with(&["a.log", "b.log", "c.txt"]);
        let mut bufs = DirBuffers::bulk();
        let req = ReadRequest { glob: Some("*.log".into()), ..Default::default() };
        read(&h, &mut bufs, &req).unwrap();
        assert_eq!(bufs.len(), 2);
        assert!(bufs.iter().all(|e| e.leafname.to_string_lossy().ends_with(".log")));
    }

    #[test]
    fn literal_glob_takes_stat_fast_path() {
        let (_d, h) = dir_with(&["exact", "other"]);
        let mut bufs = DirBuffers::bulk();
        let req = ReadRequest {
            glob: Some("exact".into()),
            want: StatWant::SIZE,
            ..Default::default()
        };
        read(&h, &mut bufs, &req).unwrap();
        assert!(bufs.done());
        assert_eq!(bufs.len(), 1);
        let e = bufs.get(0).unwrap();
        assert_eq!(e.leafname, "exact");
        assert_eq!(e.stat.size, 1);

        let req = ReadRequest { glob: Some("missing".into()), ..Default::default() };
        read(&h, &mut bufs, &req).unwrap();
        assert!(bufs.done());
        assert_eq!(bufs.len(), 0);
    }

    #[test]
    fn small_entry_capacity_reports_not_done() {
        let (_d, h) = dir_with(&["a", "b", "c", "d", "e", "f"]);
        let mut bufs = DirBuffers::with_capacity(2, 4096);
        read(&h, &mut bufs, &ReadRequest::default()).unwrap();
        assert!(!bufs.done());
        assert!(bufs.len() >= 2);
        // A bigger table finishes the job.
        let mut bufs = DirBuffers::with_capacity(64, 4096);
        read(&h, &mut bufs, &ReadRequest::default()).unwrap();
        assert!(bufs.done());
        assert_eq!(bufs.len(), 6);
    }

    #[test]
    fn buffers_are_reusable() {
        let (_d, h) = dir_with(&["one", "two"]);
        let mut bufs = DirBuffers::bulk();
        read(&h, &mut bufs, &ReadRequest::default()).unwrap();
        assert_eq!(bufs.len(), 2);
        read(&h, &mut bufs, &ReadRequest::default()).unwrap();
        assert_eq!(bufs.len(), 2);
    }
}
