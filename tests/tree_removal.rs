//! Tree removal under load and under concurrent readers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use relio::{remove_all, remove_all_with, CachingMode, Creation, Handle, Mode, OpenFlags, RemoveEvent};

fn build_tree(root: &std::path::Path, dirs: usize, files_per_dir: usize) {
    for d in 0..dirs {
        let sub = root.join(format!("d{d:05}"));
        std::fs::create_dir(&sub).unwrap();
        for f in 0..files_per_dir {
            std::fs::write(sub.join(format!("f{f:04}")), b"payload").unwrap();
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
fn parallel_removal_counts_every_entry() {
    let scratch = tempfile::tempdir().unwrap();
    let target = scratch.path().join("big");
    std::fs::create_dir(&target).unwrap();
    // Scaled-down rendition of the thousand-directory case.
    const DIRS: usize = 100;
    const FILES: usize = 32;
    build_tree(&target, DIRS, FILES);

    let removed = remove_all(open_root(&target), 4).unwrap();
    assert_eq!(removed as usize, DIRS * FILES + DIRS + 1);
    assert!(!target.exists());
}

#[test]
fn removal_succeeds_while_a_reader_holds_a_file() {
    let scratch = tempfile::tempdir().unwrap();
    let target = scratch.path().join("contended");
    std::fs::create_dir(&target).unwrap();
    build_tree(&target, 8, 8);
    // A concurrent reader keeps one file open across the whole removal.
    let held = std::fs::File::open(target.join("d00003/f0002")).unwrap();

    let removed = remove_all(open_root(&target), 4).unwrap();
    assert_eq!(removed, 8 * 8 + 8 + 1);
    assert!(!target.exists());
    drop(held);
}

#[test]
fn callbacks_report_progress_totals() {
    let scratch = tempfile::tempdir().unwrap();
    let target = scratch.path().join("audited");
    std::fs::create_dir(&target).unwrap();
    build_tree(&target, 5, 10);

    let progressed = Arc::new(AtomicU64::new(0));
    let finished_total = Arc::new(AtomicU64::new(0));
    let progressed2 = progressed.clone();
    let finished2 = finished_total.clone();
    let removed = remove_all_with(
        open_root(&target),
        move |event| {
            match event {
                RemoveEvent::ProgressEnumeration { removed, .. } => {
                    progressed2.fetch_add(removed, Ordering::Relaxed);
                }
                RemoveEvent::Finished { removed, .. } => {
                    finished2.store(removed, Ordering::Relaxed);
                }
                _ => {}
            }
            Ok(())
        },
        2,
    )
    .unwrap();
    assert_eq!(removed, 5 * 10 + 5 + 1);
    assert_eq!(finished_total.load(Ordering::Relaxed), removed);
    // Per-directory progress covers at least every plain file.
    assert!(progressed.load(Ordering::Relaxed) >= 5 * 10);
    assert!(!target.exists());
}

#[test]
fn zero_threads_means_automatic_sizing() {
    let scratch = tempfile::tempdir().unwrap();
    let target = scratch.path().join("auto");
    std::fs::create_dir(&target).unwrap();
    build_tree(&target, 3, 3);
    let removed = remove_all(open_root(&target), 0).unwrap();
    assert_eq!(removed, 3 * 3 + 3 + 1);
}
