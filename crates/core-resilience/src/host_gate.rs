//! Per-host connection arbitration
//!
//! Some SSH client stacks corrupt their handshake state when two connection
//! attempts race against the same server. [`HostGate`] serializes connection
//! attempts per host name while letting attempts against different hosts run
//! in parallel.
//!
//! Gates are created on first use and never evicted: the map grows by one
//! mutex per distinct host name ever seen. That is bounded by the size of the
//! fleet in practice.

use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Owned permit for a single host. The gate is released when this is dropped.
pub struct HostPermit {
    host: String,
    _guard: ArcMutexGuard<RawMutex, ()>,
}

impl HostPermit {
    /// Host name this permit was issued for
    pub fn host(&self) -> &str {
        &self.host
    }
}

impl std::fmt::Debug for HostPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostPermit").field("host", &self.host).finish()
    }
}

/// Map of host name to mutex, guarded by its own lock.
///
/// # Example
/// ```
/// use hive_core_resilience::HostGate;
///
/// let gate = HostGate::new();
/// let permit = gate.acquire("10.0.0.5");
/// assert_eq!(permit.host(), "10.0.0.5");
/// drop(permit);
/// assert_eq!(gate.tracked_hosts(), 1);
/// ```
#[derive(Debug, Default)]
pub struct HostGate {
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl HostGate {
    /// Create an empty gate map
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide gate shared by every proxy that does not inject its own
    pub fn global() -> Arc<HostGate> {
        static GLOBAL: OnceLock<Arc<HostGate>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(HostGate::new())).clone()
    }

    /// Block until the gate for `host` is free and take it.
    pub fn acquire(&self, host: &str) -> HostPermit {
        let gate = {
            let mut gates = self.gates.lock();
            gates
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        // The map lock is released before waiting so other hosts stay unblocked.
        let guard = gate.lock_arc();
        tracing::trace!(host, "host gate acquired");

        HostPermit {
            host: host.to_string(),
            _guard: guard,
        }
    }

    /// Try to take the gate for `host` without blocking.
    pub fn try_acquire(&self, host: &str) -> Option<HostPermit> {
        let gate = {
            let mut gates = self.gates.lock();
            gates
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        gate.try_lock_arc().map(|guard| HostPermit {
            host: host.to_string(),
            _guard: guard,
        })
    }

    /// Number of host names that have ever been gated
    pub fn tracked_hosts(&self) -> usize {
        self.gates.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_same_host_is_exclusive() {
        let gate = HostGate::new();
        let permit = gate.acquire("node-0");
        assert!(gate.try_acquire("node-0").is_none());
        drop(permit);
        assert!(gate.try_acquire("node-0").is_some());
    }

    #[test]
    fn test_different_hosts_are_independent() {
        let gate = HostGate::new();
        let _a = gate.acquire("node-0");
        let b = gate.try_acquire("node-1");
        assert!(b.is_some());
        assert_eq!(gate.tracked_hosts(), 2);
    }

    #[test]
    fn test_entries_are_never_evicted() {
        let gate = HostGate::new();
        for i in 0..5 {
            drop(gate.acquire(&format!("node-{i}")));
        }
        assert_eq!(gate.tracked_hosts(), 5);
    }

    #[test]
    fn test_contended_acquire_never_overlaps() {
        let gate = Arc::new(HostGate::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    let _permit = gate.acquire("shared");
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_global_is_shared() {
        let a = HostGate::global();
        let b = HostGate::global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
