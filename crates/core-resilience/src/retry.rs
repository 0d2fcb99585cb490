//! Fixed-delay retry loop
//!
//! The caller decides per failure whether another attempt makes sense and gets
//! a chance to repair state (reconnect, reset a handle) before the next one.

use std::thread;
use std::time::Duration;

/// Decision returned by the error hook of [`RetryPolicy::run`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Sleep and try again if attempts remain
    Retry,
    /// Give up immediately and return the error
    Abort,
}

/// Retry configuration: total attempts and the pause between them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first. Zero is treated as one.
    pub attempts: u32,
    /// Pause before every attempt after the first
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 11,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with `attempts` total attempts
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// A policy that never retries
    pub fn once() -> Self {
        Self {
            attempts: 1,
            delay: Duration::ZERO,
        }
    }

    /// Run `operation` until it succeeds, the hook aborts, or attempts run out.
    ///
    /// `operation` receives the zero-based attempt number. `on_error` sees every
    /// failure together with the attempt that produced it; it runs before the
    /// pause so it can tear down broken state. The last error is returned when
    /// the policy gives up.
    ///
    /// # Example
    /// ```
    /// use hive_core_resilience::{RetryPolicy, Verdict};
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::new(3, Duration::ZERO);
    /// let result: Result<u32, &str> = policy.run(
    ///     |attempt| if attempt < 2 { Err("flaky") } else { Ok(attempt) },
    ///     |_, _| Verdict::Retry,
    /// );
    /// assert_eq!(result, Ok(2));
    /// ```
    pub fn run<T, E, F, H>(&self, mut operation: F, mut on_error: H) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        H: FnMut(&E, u32) -> Verdict,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;

        loop {
            match operation(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let verdict = on_error(&err, attempt);
                    attempt += 1;

                    if verdict == Verdict::Abort || attempt >= attempts {
                        return Err(err);
                    }

                    tracing::debug!(attempt, of = attempts, "retrying after {:?}", self.delay);
                    if !self.delay.is_zero() {
                        thread::sleep(self.delay);
                    }
                }
            }
        }
    }
}
