// Bounded sleep-poll waits
//
// Every external wait in a run (destination sync confirmation, a fresh copy
// of a corrupted archive) goes through `poll_until`: an optional minimum
// wait, then periodic checks until the condition holds or the timeout passes.

use std::thread;
use std::time::{Duration, Instant};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSpec {
    pub min_wait: Duration,
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollSpec {
    pub fn from_secs(min_wait: u64, interval: u64, timeout: u64) -> Self {
        Self {
            min_wait: Duration::from_secs(min_wait),
            interval: Duration::from_secs(interval),
            timeout: Duration::from_secs(timeout),
        }
    }

    /// Check once, immediately
    pub fn once() -> Self {
        Self {
            min_wait: Duration::ZERO,
            interval: Duration::ZERO,
            timeout: Duration::ZERO,
        }
    }
}

/// Poll `check` until it returns true. Returns false on timeout; errors from
/// `check` end the wait immediately.
pub fn poll_until<F>(spec: PollSpec, mut check: F) -> Result<bool>
where
    F: FnMut() -> Result<bool>,
{
    if !spec.min_wait.is_zero() {
        thread::sleep(spec.min_wait);
    }

    let started = Instant::now();
    loop {
        if check()? {
            return Ok(true);
        }
        let elapsed = started.elapsed();
        if elapsed >= spec.timeout {
            return Ok(false);
        }
        let remaining = spec.timeout - elapsed;
        let nap = if spec.interval.is_zero() {
            remaining.min(Duration::from_millis(50))
        } else {
            spec.interval.min(remaining)
        };
        thread::sleep(nap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MigrateError;

    #[test]
    fn test_succeeds_after_a_few_checks() {
        let mut calls = 0;
        let spec = PollSpec {
            min_wait: Duration::ZERO,
            interval: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
        };
        let ok = poll_until(spec, || {
            calls += 1;
            Ok(calls >= 3)
        })
        .unwrap();
        assert!(ok);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_once_checks_exactly_once() {
        let mut calls = 0;
        let ok = poll_until(PollSpec::once(), || {
            calls += 1;
            Ok(false)
        })
        .unwrap();
        assert!(!ok);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_times_out() {
        let spec = PollSpec {
            min_wait: Duration::ZERO,
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(30),
        };
        let started = Instant::now();
        assert!(!poll_until(spec, || Ok(false)).unwrap());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_error_ends_wait() {
        let result = poll_until(PollSpec::from_secs(0, 1, 60), || {
            Err(MigrateError::Other("gone".into()))
        });
        assert!(result.is_err());
    }
}
