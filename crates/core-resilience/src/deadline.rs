//! Bounded waits on work that may never return
//!
//! Disposing a wedged transport handle can block forever. Threads cannot be
//! killed safely, so the work runs on a detached worker and the caller waits
//! for at most the given timeout. On timeout the worker is abandoned together
//! with whatever it holds.

use crossbeam_channel::{bounded, RecvTimeoutError};
use std::thread;
use std::time::Duration;

/// Result of [`run_with_deadline`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion<T> {
    /// The work finished within the deadline
    Finished(T),
    /// The deadline passed; the worker keeps running unobserved
    Abandoned,
}

impl<T> Completion<T> {
    pub fn is_finished(&self) -> bool {
        matches!(self, Completion::Finished(_))
    }
}

/// Run `work` on a named worker thread and wait at most `timeout` for it.
///
/// A worker that panics counts as abandoned.
///
/// # Example
/// ```
/// use hive_core_resilience::{run_with_deadline, Completion};
/// use std::time::Duration;
///
/// let outcome = run_with_deadline("quick", Duration::from_secs(1), || 40 + 2);
/// assert_eq!(outcome, Completion::Finished(42));
/// ```
pub fn run_with_deadline<T, F>(label: &str, timeout: Duration, work: F) -> Completion<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = bounded(1);

    let spawned = thread::Builder::new()
        .name(format!("deadline-{label}"))
        .spawn(move || {
            // The receiver may already be gone if we were abandoned.
            let _ = tx.send(work());
        });

    if let Err(err) = spawned {
        tracing::warn!(label, "failed to spawn worker: {}", err);
        return Completion::Abandoned;
    }

    match rx.recv_timeout(timeout) {
        Ok(value) => Completion::Finished(value),
        Err(RecvTimeoutError::Timeout) => {
            tracing::warn!(label, "worker did not finish within {:?}; abandoning it", timeout);
            Completion::Abandoned
        }
        Err(RecvTimeoutError::Disconnected) => {
            tracing::warn!(label, "worker exited without a result");
            Completion::Abandoned
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_finished() {
        let outcome = run_with_deadline("ok", Duration::from_secs(1), || "done");
        assert_eq!(outcome, Completion::Finished("done"));
    }

    #[test]
    fn test_abandoned_on_timeout() {
        let release = Arc::new(AtomicBool::new(false));
        let flag = release.clone();
        let outcome = run_with_deadline("stuck", Duration::from_millis(20), move || {
            while !flag.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(5));
            }
        });
        assert_eq!(outcome, Completion::Abandoned);
        release.store(true, Ordering::SeqCst);
    }

    #[test]
    fn test_panicking_worker_is_abandoned() {
        let outcome: Completion<()> =
            run_with_deadline("panics", Duration::from_secs(1), || panic!("boom"));
        assert!(!outcome.is_finished());
    }
}
