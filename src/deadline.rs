//! Deadline handling for blocking operations.
//!
//! Every long-running operation in this crate accepts an `Option<Deadline>`.
//! `None` blocks forever. A zero relative deadline means "try exactly once
//! and do not block". Implementations compute the remaining time before
//! each wait and recheck after each syscall, returning
//! [`Error::TimedOut`](crate::Error::TimedOut) once it is spent without
//! issuing further I/O.

use std::time::{Duration, Instant, SystemTime};

use crate::error::{Error, Result};

/// A point in time after which an operation gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Relative to the steady (monotonic) clock, measured from the moment
    /// the operation begins.
    After(Duration),
    /// An absolute system-clock time point.
    At(SystemTime),
}

impl Deadline {
    /// A deadline which permits a single non-blocking attempt.
    pub const NOW: Deadline = Deadline::After(Duration::ZERO);

    /// True if this deadline permits no blocking at all.
    pub fn is_immediate(&self) -> bool {
        matches!(self, Deadline::After(d) if d.is_zero())
    }
}

/// Tracks a deadline from the start of an operation.
///
/// Constructed once on entry; each retry loop calls [`Countdown::check`]
/// after a syscall and passes [`Countdown::remaining`] to whatever wait
/// primitive it uses next.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Countdown {
    started: Instant,
    deadline: Option<Deadline>,
}

impl Countdown {
    pub(crate) fn begin(deadline: Option<Deadline>) -> Countdown {
        Countdown {
            started: Instant::now(),
            deadline,
        }
    }

    /// Time left before expiry. `None` means unlimited.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        match self.deadline {
            None => None,
            Some(Deadline::After(d)) => Some(d.saturating_sub(self.started.elapsed())),
            Some(Deadline::At(t)) => {
                Some(t.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO))
            }
        }
    }

    pub(crate) fn expired(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }

    /// Fails with `TimedOut` once the deadline is spent.
    pub(crate) fn check(&self) -> Result<()> {
        if self.expired() {
            Err(Error::TimedOut)
        } else {
            Ok(())
        }
    }

    /// Sleeps for the retry interval or the remaining time, whichever is
    /// shorter. Used by retry ladders that have no kernel wait to park on.
    pub(crate) fn sleep(&self, interval: Duration) {
        let nap = match self.remaining() {
            Some(left) => interval.min(left),
            None => interval,
        };
        if !nap.is_zero() {
            std::thread::sleep(nap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_deadline_is_immediate() {
        assert!(Deadline::NOW.is_immediate());
        assert!(!Deadline::After(Duration::from_millis(1)).is_immediate());
        let c = Countdown::begin(Some(Deadline::NOW));
        assert!(c.expired());
        assert_eq!(c.check(), Err(Error::TimedOut));
    }

    #[test]
    fn unlimited_never_expires() {
        let c = Countdown::begin(None);
        assert_eq!(c.remaining(), None);
        assert!(!c.expired());
        assert!(c.check().is_ok());
    }

    #[test]
    fn relative_deadline_counts_down() {
        let c = Countdown::begin(Some(Deadline::After(Duration::from_secs(60))));
        let left = c.remaining().unwrap();
        assert!(left <= Duration::from_secs(60));
        assert!(left > Duration::from_secs(59));
        assert!(!c.expired());
    }

    #[test]
    fn absolute_deadline_in_the_past_expires() {
        let past = SystemTime::now() - Duration::from_secs(5);
        let c = Countdown::begin(Some(Deadline::At(past)));
        assert!(c.expired());
    }
}
