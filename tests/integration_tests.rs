//! End-to-end scenarios exercising handles, relinking, locks and the
//! sparse copy engine against a real filesystem.

use std::path::Path;
use std::time::{Duration, Instant};

use relio::extent;
use relio::{
    lock_range, relink, unlink, CachingMode, Creation, Deadline, Error, Extent, Handle, LockKind,
    Mode, OpenFlags,
};

fn open_dir(path: &Path) -> Handle {
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

fn create_file(base: &Handle, name: &str) -> Handle {
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
fn relink_follows_the_inode_not_the_path() {
    // Open a/b/c, then externally rename it to a/b/d and plant an
    // imposter at a/b/c. Relinking the handle must move the original
    // inode and leave the imposter alone.
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("a/b")).unwrap();
    let base = open_dir(&root.path().join("a/b"));
    let mut h = create_file(&base, "c");
    h.write_all_at(0, b"the real one").unwrap();
    let id = h.fetch_inode().unwrap();

    std::fs::rename(root.path().join("a/b/c"), root.path().join("a/b/d")).unwrap();
    std::fs::write(root.path().join("a/b/c"), b"imposter").unwrap();

    relink(&mut h, Some(&base), Path::new("e"), false, None).unwrap();

    assert_eq!(h.fetch_inode().unwrap(), id);
    assert_eq!(
        std::fs::read(root.path().join("a/b/e")).unwrap(),
        b"the real one"
    );
    assert_eq!(std::fs::read(root.path().join("a/b/c")).unwrap(), b"imposter");
    assert!(!root.path().join("a/b/d").exists());
}

#[test]
fn atomic_replace_keeps_inode_and_evicts_target() {
    let root = tempfile::tempdir().unwrap();
    let base = open_dir(root.path());
    let mut h = create_file(&base, "mover");
    h.write_all_at(0, b"payload").unwrap();
    let id = h.fetch_inode().unwrap();
    std::fs::write(root.path().join("victim"), b"doomed").unwrap();

    relink(&mut h, Some(&base), Path::new("victim"), true, None).unwrap();

    assert_eq!(h.fetch_inode().unwrap(), id);
    assert_eq!(std::fs::read(root.path().join("victim")).unwrap(), b"payload");
    // The old name is gone; the replaced file is no longer reachable.
    assert!(!root.path().join("mover").exists());
}

#[test]
fn unlink_then_open_is_not_found() {
    let root = tempfile::tempdir().unwrap();
    let base = open_dir(root.path());
    let h = create_file(&base, "shortlived");
    unlink(&h, None).unwrap();
    h.close().unwrap();
    let err = Handle::file(
        Some(&base),
        Path::new("shortlived"),
        Mode::Read,
        Creation::OpenExisting,
        CachingMode::All,
        OpenFlags::empty(),
    )
    .unwrap_err();
    assert_eq!(err, Error::NotFound);
}

#[test]
fn byte_range_lock_times_out_against_a_holder() {
    let root = tempfile::tempdir().unwrap();
    let base = open_dir(root.path());
    let h1 = create_file(&base, "locked");
    let h2 = Handle::file(
        Some(&base),
        Path::new("locked"),
        Mode::Write,
        Creation::OpenExisting,
        CachingMode::All,
        OpenFlags::empty(),
    )
    .unwrap();

    let guard = lock_range(&h1, 0, 1024, LockKind::Exclusive, None).unwrap();
    let started = Instant::now();
    let err = lock_range(
        &h2,
        0,
        1024,
        LockKind::Exclusive,
        Some(Deadline::After(Duration::from_millis(100))),
    )
    .unwrap_err();
    assert_eq!(err, Error::TimedOut);
    assert!(started.elapsed() >= Duration::from_millis(100));
    // The holder is untouched and can still release cleanly.
    guard.unlock().unwrap();
    lock_range(&h2, 0, 1024, LockKind::Exclusive, Some(Deadline::NOW)).unwrap();
}

#[test]
fn sparse_copy_preserves_holes_end_to_end() {
    const MIB: u64 = 1024 * 1024;
    let root = tempfile::tempdir().unwrap();
    let base = open_dir(root.path());
    let src = create_file(&base, "sparse");
    let dst = create_file(&base, "copy");

    // 1 MiB hole, 4 KiB of 0xAA, 1 MiB hole.
    extent::truncate(&src, 2 * MIB + 4096).unwrap();
    src.write_all_at(MIB, &[0xAA; 4096]).unwrap();

    extent::clone_extents_to(&src, Extent::WHOLE_FILE, &dst, 0, None, false, true).unwrap();

    assert_eq!(extent::maximum_extent(&dst).unwrap(), 2 * MIB + 4096);
    let mut data = vec![0u8; 4096];
    dst.read_exact_at(MIB, &mut data).unwrap();
    assert!(data.iter().all(|&b| b == 0xAA));
    let allocated: u64 = extent::extents(&dst).unwrap().iter().map(|e| e.length).sum();
    assert!(
        allocated < MIB,
        "copy should not allocate the holes ({allocated} bytes allocated)"
    );
}

#[test]
fn forced_copy_matches_source_bytes() {
    let root = tempfile::tempdir().unwrap();
    let base = open_dir(root.path());
    let src = create_file(&base, "a");
    let dst = create_file(&base, "b");
    let payload: Vec<u8> = (0..3_000_000u32).map(|i| (i * 31 % 251) as u8).collect();
    src.write_all_at(0, &payload).unwrap();

    extent::clone_extents_to(&src, Extent::WHOLE_FILE, &dst, 0, None, true, true).unwrap();

    let mut back = vec![0u8; payload.len()];
    dst.read_exact_at(0, &mut back).unwrap();
    assert_eq!(back, payload);
}

#[test]
fn handle_caching_clone_changes_durability_reporting() {
    let root = tempfile::tempdir().unwrap();
    let base = open_dir(root.path());
    let h = create_file(&base, "durable");
    assert!(!h.are_writes_durable());
    let sync = h
        .clone_handle(None, Some(CachingMode::Reads), None)
        .unwrap();
    assert!(sync.are_writes_durable());
    assert_eq!(sync.fetch_inode().unwrap(), h.fetch_inode().unwrap());
}
