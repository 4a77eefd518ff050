//! File extents: enumeration, cloning, zeroing, sparse-aware copying.
//!
//! Sparse files are first-class here. [`extents`] reports the allocated
//! regions of a file, and [`clone_extents_to`] copies a range between
//! files while preserving holes, sharing extents where the filesystem can,
//! and degrading stepwise to plain reads and writes where it cannot.

use std::os::fd::AsRawFd;

use log::debug;
use smallvec::SmallVec;

use crate::deadline::{Countdown, Deadline};
use crate::error::{Error, Result};
use crate::handle::{Behavior, CachingMode, Handle, HandleKind};
use crate::stat::{Stat, StatWant};
use crate::utils;

/// A contiguous region of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Byte offset of the start of the region.
    pub offset: u64,
    /// Length of the region in bytes.
    pub length: u64,
}

impl Extent {
    /// Sentinel accepted by range-taking APIs to mean "the whole file".
    pub const WHOLE_FILE: Extent = Extent { offset: u64::MAX, length: u64::MAX };

    /// Exclusive end of the region. Fails `ValueTooLarge` on overflow.
    pub fn end(&self) -> Result<u64> {
        self.offset.checked_add(self.length).ok_or(Error::ValueTooLarge)
    }
}

fn file_fd(h: &Handle) -> Result<std::os::fd::BorrowedFd<'_>> {
    use std::os::fd::AsFd;
    match h.kind() {
        HandleKind::Directory => Err(Error::IsADirectory),
        _ => Ok(h.as_fd()),
    }
}

/// Reads the current maximum extent (the end of file) of `h`.
pub fn maximum_extent(h: &Handle) -> Result<u64> {
    let st = Stat::fill(file_fd(h)?, StatWant::SIZE)?;
    Ok(st.size)
}

/// Sets the end of file of `h`.
///
/// No physical allocation is implied. On a handle opened with
/// [`CachingMode::SafetyBarriers`] the truncate is followed by a barrier.
pub fn truncate(h: &Handle, new_size: u64) -> Result<()> {
    let rc = unsafe { libc::ftruncate(h.as_raw_fd(), new_size as libc::off_t) };
    if rc == -1 {
        return Err(Error::last_os_error());
    }
    if h.caching() == CachingMode::SafetyBarriers {
        h.barrier()?;
    }
    Ok(())
}

// Some filesystems (observed on ZFS-on-Linux) report no data after an
// mmap rewrite until any byte of the file is read, so a one-byte read is
// issued before each data seek. Aligned-I/O handles get a page-sized,
// page-aligned read instead.
fn prod_page_cache(h: &Handle, position: u64, size: u64) {
    if position >= size {
        return;
    }
    if h.behavior().contains(Behavior::ALIGNED_IO) {
        let page = page_size::get() as u64;
        let aligned = position & !(page - 1);
        let layout = std::alloc::Layout::from_size_align(page as usize, page as usize).unwrap();
        unsafe {
            let buf = std::alloc::alloc(layout);
            if !buf.is_null() {
                libc::pread(
                    h.as_raw_fd(),
                    buf.cast(),
                    page as usize,
                    aligned as libc::off_t,
                );
                std::alloc::dealloc(buf, layout);
            }
        }
    } else {
        let mut byte = [0u8; 1];
        let _ = h.read_at(position, &mut byte);
    }
}

fn seek(h: &Handle, position: u64, whence: libc::c_int) -> Result<u64> {
    let rc = unsafe { libc::lseek(h.as_raw_fd(), position as libc::off_t, whence) };
    if rc == -1 {
        return Err(Error::last_os_error());
    }
    Ok(rc as u64)
}

/// Enumerates the allocated (non-hole) regions of `h`.
///
/// Enumeration races with writers: an observed region may already be gone.
/// Regions that come back non-positive are discarded. Filesystems that do
/// not support extent queries report one extent spanning the whole file.
pub fn extents(h: &Handle) -> Result<Vec<Extent>> {
    let size = maximum_extent(h)?;
    let mut out = Vec::new();
    if size == 0 {
        return Ok(out);
    }
    let mut position = 0u64;
    loop {
        prod_page_cache(h, position, size);
        let data = match seek(h, position, libc::SEEK_DATA) {
            Ok(d) => d,
            Err(Error::Os(errno)) if errno == libc::ENXIO => break,
            Err(Error::InvalidArgument) | Err(Error::NotSupported) => {
                // No sparse support; the whole file is one extent.
                return Ok(vec![Extent { offset: 0, length: size }]);
            }
            Err(err) => return Err(err),
        };
        let hole = match seek(h, data, libc::SEEK_HOLE) {
            Ok(e) => e,
            Err(Error::Os(errno)) if errno == libc::ENXIO => size,
            Err(err) => return Err(err),
        };
        if hole > data {
            out.push(Extent { offset: data, length: hole - data });
        }
        position = hole;
        if position >= size {
            break;
        }
    }
    Ok(out)
}

fn punch_hole(h: &Handle, offset: u64, length: u64) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        let rc = unsafe {
            libc::fallocate(
                h.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                length as libc::off_t,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        match Error::last_os_error() {
            Error::NotSupported | Error::InvalidArgument => Err(Error::NotSupported),
            err => Err(err),
        }
    }
    #[cfg(target_os = "macos")]
    {
        let args = libc::fpunchhole_t {
            fp_flags: 0,
            reserved: 0,
            fp_offset: offset as libc::off_t,
            fp_length: length as libc::off_t,
        };
        let rc = unsafe { libc::fcntl(h.as_raw_fd(), libc::F_PUNCHHOLE, &args) };
        if rc == -1 {
            return match Error::last_os_error() {
                Error::NotSupported | Error::InvalidArgument => Err(Error::NotSupported),
                err => Err(err),
            };
        }
        Ok(())
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = (h, offset, length);
        Err(Error::NotSupported)
    }
}

fn write_zeros(h: &Handle, offset: u64, length: u64, countdown: &Countdown) -> Result<()> {
    let chunk = utils::file_buffer_default_size().min(length as usize).max(1);
    let scratch = vec![0u8; chunk];
    let mut written = 0u64;
    while written < length {
        countdown.check()?;
        let n = ((length - written) as usize).min(scratch.len());
        h.write_all_at(offset + written, &scratch[..n])?;
        written += n as u64;
    }
    Ok(())
}

/// Deallocates `[range.offset, range.offset + range.length)` of `h`.
///
/// Reads of the range return zeros afterwards. Filesystems that cannot
/// punch holes get explicit zeros written instead.
pub fn zero(h: &Handle, range: Extent, deadline: Option<Deadline>) -> Result<()> {
    let countdown = Countdown::begin(deadline);
    range.end()?;
    if range.length == 0 {
        return Ok(());
    }
    match punch_hole(h, range.offset, range.length) {
        Ok(()) => Ok(()),
        Err(Error::NotSupported) => write_zeros(h, range.offset, range.length, &countdown),
        Err(err) => Err(err),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkKind {
    /// Share or copy allocated source blocks.
    CloneExtents,
    /// Source hole; deallocate the destination region.
    DeleteExtents,
}

#[derive(Debug, Clone, Copy)]
struct WorkItem {
    kind: WorkKind,
    src_offset: u64,
    length: u64,
    /// The destination region lies beyond the destination's old end of
    /// file, so it is known to be zero-filled already and zero writes into
    /// it may be elided.
    dest_is_new: bool,
}

#[cfg(any(target_os = "linux", target_os = "freebsd"))]
fn clone_range_syscall(
    src: &Handle,
    src_offset: u64,
    dst: &Handle,
    dst_offset: u64,
    length: usize,
) -> Result<usize> {
    let mut off_in = src_offset as libc::off_t;
    let mut off_out = dst_offset as libc::off_t;
    let rc = unsafe {
        libc::copy_file_range(
            src.as_raw_fd(),
            &mut off_in,
            dst.as_raw_fd(),
            &mut off_out,
            length,
            0,
        )
    };
    if rc < 0 {
        return match Error::last_os_error() {
            // Runtime detection: unsupported kernels and filesystems show
            // up here, never at build time.
            Error::NotSupported | Error::InvalidArgument | Error::Os(libc::EXDEV) => {
                Err(Error::NotSupported)
            }
            err => Err(err),
        };
    }
    Ok(rc as usize)
}

#[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
fn clone_range_syscall(
    _src: &Handle,
    _src_offset: u64,
    _dst: &Handle,
    _dst_offset: u64,
    _length: usize,
) -> Result<usize> {
    Err(Error::NotSupported)
}

// Copies one chunk by read+write. When the destination region is newly
// allocated, runs of zeros of at least 1024 bytes are skipped instead of
// written, preserving sparseness.
fn copy_chunk(
    src: &Handle,
    src_offset: u64,
    dst: &Handle,
    dst_offset: u64,
    length: usize,
    dest_is_new: bool,
    scratch: &mut Vec<u8>,
) -> Result<()> {
    scratch.resize(length, 0);
    src.read_exact_at(src_offset, &mut scratch[..length])?;
    if !dest_is_new {
        return dst.write_all_at(dst_offset, &scratch[..length]);
    }
    const ZERO_RUN: usize = 1024;
    let buf = &scratch[..length];
    let mut pos = 0usize;
    while pos < length {
        let span_end = (pos + ZERO_RUN).min(length);
        if utils::is_all_zero(&buf[pos..span_end]) {
            pos = span_end;
            continue;
        }
        // Find the end of this non-elidable span.
        let mut end = span_end;
        while end < length {
            let next = (end + ZERO_RUN).min(length);
            if utils::is_all_zero(&buf[end..next]) {
                break;
            }
            end = next;
        }
        dst.write_all_at(dst_offset + pos as u64, &buf[pos..end])?;
        pos = end;
    }
    Ok(())
}

fn streaming_copy(
    src: &Handle,
    range: Extent,
    dst: &Handle,
    countdown: &Countdown,
) -> Result<u64> {
    let mut scratch = vec![0u8; utils::file_buffer_default_size()];
    let mut copied = 0u64;
    while copied < range.length {
        countdown.check()?;
        let n = ((range.length - copied) as usize).min(scratch.len());
        let got = src.read_at(range.offset + copied, &mut scratch[..n])?;
        if got == 0 {
            break;
        }
        // Pipes have no offsets; write sequentially and completely.
        let mut sent = 0usize;
        while sent < got {
            let rc = unsafe {
                libc::write(
                    dst.as_raw_fd(),
                    scratch[sent..got].as_ptr().cast(),
                    got - sent,
                )
            };
            if rc < 0 {
                let err = Error::last_os_error();
                if err == Error::Os(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }
            sent += rc as usize;
        }
        copied += got as u64;
    }
    Ok(copied)
}

/// Copies or shares `range` of `src` into `dst` at `dst_offset`.
///
/// Allocated source regions are extent-cloned where the platform can,
/// holes become holes, and everything degrades to explicit copies and
/// zero writes when `emulate_if_unsupported` permits. `force_copy_now`
/// implies emulation and forbids extent sharing, guaranteeing the
/// destination owns private storage afterwards.
///
/// When source and destination are the same inode and the ranges overlap,
/// the work runs in the direction that never clobbers unread data;
/// overlap finer than one filesystem block fails `InvalidArgument`.
///
/// Returns the destination extent written.
pub fn clone_extents_to(
    src: &Handle,
    range: Extent,
    dst: &Handle,
    dst_offset: u64,
    deadline: Option<Deadline>,
    force_copy_now: bool,
    emulate_if_unsupported: bool,
) -> Result<Extent> {
    let countdown = Countdown::begin(deadline);
    let src_size = maximum_extent(src)?;
    // Clamp the requested range to what the source holds right now.
    let mut range = if range == Extent::WHOLE_FILE {
        Extent { offset: 0, length: src_size }
    } else {
        range
    };
    range.end()?;
    if range.offset >= src_size {
        return Ok(Extent { offset: dst_offset, length: 0 });
    }
    range.length = range.length.min(src_size - range.offset);
    if range.length == 0 {
        return Ok(Extent { offset: dst_offset, length: 0 });
    }
    dst_offset.checked_add(range.length).ok_or(Error::ValueTooLarge)?;

    if dst.kind() != HandleKind::File {
        let copied = streaming_copy(src, range, dst, &countdown)?;
        return Ok(Extent { offset: dst_offset, length: copied });
    }

    let same_inode = src.fetch_inode()? == dst.fetch_inode()?;
    let mut reverse = false;
    if same_inode {
        if range.offset == dst_offset {
            return Ok(Extent { offset: dst_offset, length: range.length });
        }
        let overlap = range.offset < dst_offset + range.length
            && dst_offset < range.offset + range.length;
        if overlap {
            let blksize = Stat::fill(file_fd(src)?, StatWant::BLKSIZE)?.blksize.max(512);
            if range.offset.abs_diff(dst_offset) < blksize as u64 {
                return Err(Error::InvalidArgument);
            }
            // Copy back-to-front when the destination is ahead of the
            // source so no block is clobbered before it is read.
            reverse = dst_offset > range.offset;
        }
    }

    let dst_old_size = maximum_extent(dst)?;
    let dst_required = dst_offset + range.length;
    let range_end = range.offset + range.length;

    // Build the work list from the allocation map intersected with the
    // requested range.
    let allocation = extents(src)?;
    let mut work: SmallVec<[WorkItem; 8]> = SmallVec::new();
    let mut cursor = range.offset;
    for ext in &allocation {
        let ext_end = ext.offset.saturating_add(ext.length);
        if ext_end <= cursor {
            continue;
        }
        if ext.offset >= range_end {
            break;
        }
        let start = ext.offset.max(cursor);
        if start > cursor {
            work.push(WorkItem {
                kind: WorkKind::DeleteExtents,
                src_offset: cursor,
                length: start - cursor,
                dest_is_new: false,
            });
        }
        let end = ext_end.min(range_end);
        work.push(WorkItem {
            kind: WorkKind::CloneExtents,
            src_offset: start,
            length: end - start,
            dest_is_new: false,
        });
        cursor = end;
    }
    if cursor < range_end {
        work.push(WorkItem {
            kind: WorkKind::DeleteExtents,
            src_offset: cursor,
            length: range_end - cursor,
            dest_is_new: false,
        });
    }
    for item in work.iter_mut() {
        let item_dst = dst_offset + (item.src_offset - range.offset);
        item.dest_is_new = item_dst >= dst_old_size;
    }

    // Grow the destination first so a failure can roll the size back.
    let grew = dst_required > dst_old_size;
    if grew {
        truncate(dst, dst_required)?;
    }

    let result = run_work_list(
        src,
        &work,
        reverse,
        range.offset,
        dst,
        dst_offset,
        &countdown,
        force_copy_now || same_inode,
        emulate_if_unsupported || force_copy_now,
    );
    if result.is_err() && grew {
        let _ = truncate(dst, dst_old_size);
    }
    result?;
    Ok(Extent { offset: dst_offset, length: range.length })
}

#[allow(clippy::too_many_arguments)]
fn run_work_list(
    src: &Handle,
    work: &[WorkItem],
    reverse: bool,
    range_offset: u64,
    dst: &Handle,
    dst_offset: u64,
    countdown: &Countdown,
    force_copy_now: bool,
    emulate: bool,
) -> Result<()> {
    let chunk = utils::file_buffer_default_size();
    let mut scratch = Vec::new();
    // Extent sharing is disabled outright under force_copy_now (and for
    // same-inode copies, where the kernel refuses overlaps), and after the
    // first "unsupported" report when emulation is on.
    let mut cloning_works = !force_copy_now;
    let mut run_item = |item: &WorkItem| -> Result<()> {
        let item_dst = dst_offset + (item.src_offset - range_offset);
        let mut done = 0u64;
        while done < item.length {
            countdown.check()?;
            let n = ((item.length - done) as usize).min(chunk);
            let (s_off, d_off) = if reverse {
                let remaining = item.length - done;
                (item.src_offset + remaining - n as u64, item_dst + remaining - n as u64)
            } else {
                (item.src_offset + done, item_dst + done)
            };
            match item.kind {
                WorkKind::CloneExtents => {
                    let mut copied = false;
                    if cloning_works {
                        match clone_range_syscall(src, s_off, dst, d_off, n) {
                            Ok(got) if got == n => copied = true,
                            // A short clone is completed by plain copy.
                            Ok(_) | Err(Error::NotSupported) => {
                                if !emulate {
                                    return Err(Error::NotSupported);
                                }
                                debug!("extent cloning unsupported here, copying instead");
                                cloning_works = false;
                            }
                            Err(err) => return Err(err),
                        }
                    }
                    if !copied {
                        copy_chunk(src, s_off, dst, d_off, n, item.dest_is_new, &mut scratch)?;
                    }
                }
                WorkKind::DeleteExtents => {
                    if !item.dest_is_new {
                        match punch_hole(dst, d_off, n as u64) {
                            Ok(()) => {}
                            Err(Error::NotSupported) => {
                                write_zeros(dst, d_off, n as u64, countdown)?;
                            }
                            Err(err) => return Err(err),
                        }
                    }
                }
            }
            done += n as u64;
        }
        Ok(())
    };
    if reverse {
        for item in work.iter().rev() {
            run_item(item)?;
        }
    } else {
        for item in work {
            run_item(item)?;
        }
    }
    Ok(())
}
