//! The error type shared by every operation in the crate.
//!
//! Everything recoverable is returned as a value; nothing unwinds across the
//! public API. Syscall failures are converted from the raw errno at the call
//! site, so each error keeps enough information to distinguish e.g. a
//! creation collision from a rename refusing to overwrite.

use std::fmt;
use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error kinds every operation in this crate can return.
///
/// The filesystem kinds map onto the POSIX errnos noted on each variant;
/// the key-value store kinds are produced only by the [`kv`](crate::kv)
/// module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The entry is missing (`ENOENT`). Callers performing inode-verified
    /// operations should treat this as "raced away" rather than "never
    /// existed" when a prior resolution succeeded.
    NotFound,
    /// A creation collided with an existing entry (`EEXIST` on create).
    AlreadyExists,
    /// The entry is not a directory (`ENOTDIR`).
    NotADirectory,
    /// The entry is a directory where a non-directory was required
    /// (`EISDIR`).
    IsADirectory,
    /// Permission denied (`EACCES`, `EPERM`).
    PermissionDenied,
    /// The deadline elapsed before the operation completed. The operation
    /// may have had partial effect; the caller must treat the target as
    /// potentially modified.
    TimedOut,
    /// The operation was cancelled by an explicit stop.
    Cancelled,
    /// An argument was invalid, e.g. overlapping clone regions smaller than
    /// one block (`EINVAL`).
    InvalidArgument,
    /// A rename with atomic replacement disabled would have overwritten an
    /// existing entry.
    FileExists,
    /// A caller-supplied buffer was too small. The failed call had no
    /// effect, so retrying with a larger buffer is safe.
    NoBufferSpace,
    /// A read or write returned short. Under the protocols in this crate
    /// that indicates corruption racing with the operation (`EAGAIN`).
    TryAgain,
    /// An offset plus a length would overflow (`EOVERFLOW`, `EFBIG`).
    ValueTooLarge,
    /// The platform lacks the needed syscall (`ENOSYS`, `EOPNOTSUPP`).
    NotSupported,
    /// All 48 value log files of a key-value store are claimed by writers.
    MaximumWritersReached,
    /// A key was modified after this transaction fetched it. Carries the
    /// offending key.
    TransactionAborted(u128),
    /// A key was updated in a transaction without being fetched first.
    BadUpdate,
    /// A transaction tried to fetch more than 65,535 distinct keys.
    TransactionLimitReached,
    /// The store's index file carries the needs-repair magic and the store
    /// was opened read-only, or repair failed.
    CorruptedStore,
    /// The store's index file carries an unrecognized magic.
    UnknownStore,
    /// Any other OS error, carrying the raw errno.
    Os(i32),
}

impl Error {
    /// Converts a raw errno into the matching error kind.
    pub fn from_errno(errno: i32) -> Error {
        match errno {
            libc::ENOENT => Error::NotFound,
            libc::EEXIST => Error::AlreadyExists,
            libc::ENOTDIR => Error::NotADirectory,
            libc::EISDIR => Error::IsADirectory,
            libc::EACCES | libc::EPERM => Error::PermissionDenied,
            libc::ETIMEDOUT => Error::TimedOut,
            libc::ECANCELED => Error::Cancelled,
            libc::EINVAL => Error::InvalidArgument,
            libc::ERANGE | libc::ENOBUFS => Error::NoBufferSpace,
            libc::EAGAIN => Error::TryAgain,
            libc::EOVERFLOW | libc::EFBIG => Error::ValueTooLarge,
            libc::ENOSYS | libc::EOPNOTSUPP | libc::ENOTTY => Error::NotSupported,
            other => Error::Os(other),
        }
    }

    /// Reads `errno` and converts it. Call immediately after a failed
    /// syscall, before anything else can clobber the thread's errno.
    pub(crate) fn last_os_error() -> Error {
        Error::from_errno(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }

    /// The raw errno behind this error, if it came from the OS.
    pub fn raw_os_error(&self) -> Option<i32> {
        match *self {
            Error::NotFound => Some(libc::ENOENT),
            Error::AlreadyExists | Error::FileExists => Some(libc::EEXIST),
            Error::NotADirectory => Some(libc::ENOTDIR),
            Error::IsADirectory => Some(libc::EISDIR),
            Error::PermissionDenied => Some(libc::EACCES),
            Error::TimedOut => Some(libc::ETIMEDOUT),
            Error::Cancelled => Some(libc::ECANCELED),
            Error::InvalidArgument => Some(libc::EINVAL),
            Error::NoBufferSpace => Some(libc::ENOBUFS),
            Error::TryAgain => Some(libc::EAGAIN),
            Error::ValueTooLarge => Some(libc::EOVERFLOW),
            Error::NotSupported => Some(libc::EOPNOTSUPP),
            Error::Os(errno) => Some(errno),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::NotFound => write!(f, "entry not found"),
            Error::AlreadyExists => write!(f, "entry already exists"),
            Error::NotADirectory => write!(f, "not a directory"),
            Error::IsADirectory => write!(f, "is a directory"),
            Error::PermissionDenied => write!(f, "permission denied"),
            Error::TimedOut => write!(f, "deadline elapsed"),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::FileExists => write!(f, "destination exists and atomic replace is off"),
            Error::NoBufferSpace => write!(f, "supplied buffer too small"),
            Error::TryAgain => write!(f, "short transfer, try again"),
            Error::ValueTooLarge => write!(f, "offset plus length overflows"),
            Error::NotSupported => write!(f, "not supported on this platform or filesystem"),
            Error::MaximumWritersReached => {
                write!(f, "all 48 value log files are claimed by writers")
            }
            Error::TransactionAborted(key) => {
                write!(f, "transaction aborted: key {key:#034x} changed since fetch")
            }
            Error::BadUpdate => write!(f, "update of a key that was never fetched"),
            Error::TransactionLimitReached => {
                write!(f, "transactions may fetch at most 65535 distinct keys")
            }
            Error::CorruptedStore => write!(f, "store is corrupted and needs repair"),
            Error::UnknownStore => write!(f, "store has an unknown format version"),
            Error::Os(errno) => {
                write!(f, "{}", io::Error::from_raw_os_error(errno))
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.raw_os_error() {
            Some(errno) => Error::from_errno(errno),
            None => match err.kind() {
                io::ErrorKind::NotFound => Error::NotFound,
                io::ErrorKind::AlreadyExists => Error::AlreadyExists,
                io::ErrorKind::PermissionDenied => Error::PermissionDenied,
                io::ErrorKind::TimedOut => Error::TimedOut,
                io::ErrorKind::InvalidInput => Error::InvalidArgument,
                io::ErrorKind::WouldBlock => Error::TryAgain,
                io::ErrorKind::Unsupported => Error::NotSupported,
                _ => Error::Os(libc::EIO),
            },
        }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Error {
        Error::from_errno(errno as i32)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err.raw_os_error() {
            Some(errno) => io::Error::from_raw_os_error(errno),
            None => io::Error::other(err.to_string()),
        }
    }
}
