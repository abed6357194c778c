//! Deadlines and busy-wait backoff.
//!
//! Every blocking operation in the crate spins by default with no time limit. The
//! `*_until` variants take an `Option<Deadline>` and give up with
//! [`TransportError::TimedOut`] once it passes. Between polls they walk a
//! [`Backoff`] ladder: CPU pause, then `yield_now`, then a short sleep.

use std::time::{Duration, Instant};

use crate::config::BackoffConfig;
use crate::error::{Result, TransportError};

/// Absolute point in time after which a wait gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    start: Instant,
    expiry: Instant,
}

impl Deadline {
    /// Creates a deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        let start = Instant::now();
        Self {
            start,
            expiry: start + timeout,
        }
    }

    /// Returns the remaining time, or `None` if the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.expiry.checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
    }

    /// Returns `true` if the deadline has passed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expiry
    }

    /// Time since the deadline was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Fails with [`TransportError::TimedOut`] if the deadline has passed.
    pub fn check(&self, operation: &'static str) -> Result<()> {
        if self.is_expired() {
            return Err(TransportError::TimedOut {
                operation,
                elapsed_ms: self.elapsed().as_millis() as u64,
            });
        }
        Ok(())
    }
}

/// Escalating pause between polls of a busy-wait loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    step: u32,
}

impl Backoff {
    /// A ladder at its first rung.
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, step: 0 }
    }

    /// Pure spinning with no yield or sleep.
    pub fn spin() -> Self {
        Self::new(BackoffConfig {
            spin_limit: u32::MAX,
            yield_limit: u32::MAX,
            sleep_us: 0,
        })
    }

    /// Waits once, moving one step up the ladder.
    pub fn snooze(&mut self) {
        if self.step < self.config.spin_limit {
            std::hint::spin_loop();
        } else if self.step < self.config.yield_limit {
            std::thread::yield_now();
        } else if self.config.sleep_us > 0 {
            std::thread::sleep(Duration::from_micros(self.config.sleep_us));
        } else {
            std::thread::yield_now();
        }
        self.step = self.step.saturating_add(1);
    }

    /// `true` once the ladder has reached the sleeping rung.
    pub fn is_sleeping(&self) -> bool {
        self.step >= self.config.yield_limit
    }

    /// Back to spinning.
    pub fn reset(&mut self) {
        self.step = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

/// Calls `poll` until it yields a value, backing off in between.
///
/// `poll` errors are returned unchanged. With a deadline, the wait ends with
/// [`TransportError::TimedOut`] naming `operation` once the deadline passes.
pub fn wait_until<T, F>(
    operation: &'static str,
    deadline: Option<Deadline>,
    backoff: &mut Backoff,
    mut poll: F,
) -> Result<T>
where
    F: FnMut() -> Result<Option<T>>,
{
    loop {
        if let Some(v) = poll()? {
            backoff.reset();
            return Ok(v);
        }
        if let Some(d) = &deadline {
            d.check(operation)?;
        }
        backoff.snooze();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_deadline_expiry() {
        let d = Deadline::after(Duration::from_millis(0));
        assert!(d.is_expired());
        assert!(d.remaining().is_none());
        assert!(matches!(
            d.check("poll"),
            Err(TransportError::TimedOut { operation: "poll", .. })
        ));

        let d = Deadline::after(Duration::from_secs(60));
        assert!(!d.is_expired());
        assert!(d.remaining().unwrap() > Duration::from_secs(59));
        assert!(d.check("poll").is_ok());
    }

    #[test]
    fn test_wait_until_returns_value() {
        let calls = Cell::new(0);
        let mut backoff = Backoff::default();
        let v = wait_until("test", None, &mut backoff, || {
            calls.set(calls.get() + 1);
            Ok(if calls.get() == 5 { Some(42) } else { None })
        })
        .unwrap();
        assert_eq!(v, 42);
        assert_eq!(calls.get(), 5);
    }

    #[test]
    fn test_wait_until_times_out() {
        let mut backoff = Backoff::default();
        let err = wait_until::<(), _>(
            "never",
            Some(Deadline::after(Duration::from_millis(10))),
            &mut backoff,
            || Ok(None),
        )
        .unwrap_err();
        assert!(matches!(err, TransportError::TimedOut { operation: "never", .. }));
    }

    #[test]
    fn test_wait_until_propagates_poll_error() {
        let mut backoff = Backoff::spin();
        let err = wait_until::<(), _>("poll", None, &mut backoff, || {
            Err(TransportError::UnknownClient(3))
        })
        .unwrap_err();
        assert!(matches!(err, TransportError::UnknownClient(3)));
    }

    #[test]
    fn test_backoff_ladder() {
        let mut b = Backoff::new(BackoffConfig {
            spin_limit: 2,
            yield_limit: 4,
            sleep_us: 1,
        });
        for _ in 0..4 {
            assert!(!b.is_sleeping());
            b.snooze();
        }
        assert!(b.is_sleeping());
        b.reset();
        assert!(!b.is_sleeping());
    }
}
