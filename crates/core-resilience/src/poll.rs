//! Interval polling with an optional overall deadline

use std::thread;
use std::time::{Duration, Instant};

/// Result of [`Poller::until`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The check produced a value
    Ready(T),
    /// The deadline passed before the check produced a value
    TimedOut,
}

/// Calls a check every `interval` until it yields a value.
///
/// With `timeout: None` the poller waits forever; use that only when some
/// other layer bounds the wait.
#[derive(Debug, Clone, Copy)]
pub struct Poller {
    pub interval: Duration,
    pub timeout: Option<Duration>,
}

impl Poller {
    pub fn new(interval: Duration, timeout: Option<Duration>) -> Self {
        Self { interval, timeout }
    }

    /// Check until `Ok(Some(_))`, an error, or the deadline.
    ///
    /// The check always runs at least once, even with a zero timeout. It
    /// receives the zero-based round number.
    pub fn until<T, E, F>(&self, mut check: F) -> Result<PollOutcome<T>, E>
    where
        F: FnMut(u32) -> Result<Option<T>, E>,
    {
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let mut round = 0;

        loop {
            if let Some(value) = check(round)? {
                return Ok(PollOutcome::Ready(value));
            }
            round += 1;

            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(PollOutcome::TimedOut);
                    }
                    self.interval.min(deadline - now)
                }
                None => self.interval,
            };

            if !pause.is_zero() {
                thread::sleep(pause);
            }
        }
    }
}
