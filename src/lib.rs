//! Race-free, high-throughput filesystem access for Rust
//!
//! This library ties filesystem operations to *inodes* instead of path
//! strings. A [`Handle`] owns a descriptor; operations that must act by
//! name (relink, unlink, parent resolution) re-resolve the handle's path
//! and refuse to proceed unless the entry they found still carries the
//! handle's recorded inode identity, retrying under a deadline. On top of
//! that foundation sit a sparse-aware file extent engine, a lock engine,
//! glob-filtered directory enumeration with a parallel failure-tolerant
//! tree removal, a dynamic worker pool, and a transactional key-value
//! store with optimistic concurrency and a four-deep version history.
//!
//! The crate targets Linux first, with macOS and FreeBSD variants where
//! the syscalls differ. The Windows NT renditions of the same contracts
//! (POSIX-delete emulation, alternate-data-stream attributes, the
//! reserved whole-file lock byte) are documented on the operations they
//! concern so a port has a contract to follow.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use crate::deadline::Deadline;
pub use crate::dir::DirBuffers;
pub use crate::dir::DirEntry;
pub use crate::dir::Filtering;
pub use crate::dir::ReadRequest;
pub use crate::error::Error;
pub use crate::error::Result;
pub use crate::extent::Extent;
pub use crate::fs_ops::link;
pub use crate::fs_ops::parent_path_handle;
pub use crate::fs_ops::relink;
pub use crate::fs_ops::to_win32_path;
pub use crate::fs_ops::unlink;
pub use crate::fs_ops::Win32PathNamespace;
pub use crate::handle::Behavior;
pub use crate::handle::CachingMode;
pub use crate::handle::Creation;
pub use crate::handle::Handle;
pub use crate::handle::HandleKind;
pub use crate::handle::InodeId;
pub use crate::handle::Mode;
pub use crate::handle::OpenFlags;
pub use crate::lock::lock_file;
pub use crate::lock::lock_range;
pub use crate::lock::try_lock_file;
pub use crate::lock::unlock_file;
pub use crate::lock::LockKind;
pub use crate::lock::RangeGuard;
pub use crate::lock::WHOLE_FILE_LOCK_OFFSET;
pub use crate::pool::IoAwareTuning;
pub use crate::pool::IoAwareWorkItem;
pub use crate::pool::WorkGroup;
pub use crate::pool::WorkItem;
pub use crate::remove_all::remove_all;
pub use crate::remove_all::remove_all_with;
pub use crate::remove_all::RemoveAllFailure;
pub use crate::remove_all::RemoveEvent;
pub use crate::stat::FileType;
pub use crate::stat::Stat;
pub use crate::stat::StatWant;
pub use crate::utils::file_buffer_default_size;
pub use crate::utils::round_up_to_page_size;

pub mod deadline;
pub mod dir;
mod error;
pub mod extent;
pub mod fs_ops;
pub mod handle;
pub mod kv;
pub mod lock;
pub mod pool;
pub mod remove_all;
pub mod stat;
mod utils;
pub mod xattr;
