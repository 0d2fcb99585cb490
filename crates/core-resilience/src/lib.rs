//! Hive Core Resilience: pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! Building blocks for talking to unreliable remote hosts from blocking code:
//!
//! - **Host Gate**: serializes connection attempts per host name
//! - **Retry Policy**: fixed-delay retry with a caller-supplied verdict per failure
//! - **Poller**: interval polling with an optional deadline
//! - **Deadline**: runs work on a detached worker and stops waiting after a timeout
//!
//! This crate knows nothing about SSH, shells or files.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Node proxy                      │
//! └─────────────┬───────────────────────────┘
//!               │ connect
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Host Gate                         │  ← one handshake per host
//! └─────────────┬───────────────────────────┘
//!               │ every session call
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Retry Policy                      │  ← reconnect + pause
//! └─────────────┬───────────────────────────┘
//!               │ long-running remote work
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Poller                            │  ← marker files, reboots
//! └─────────────────────────────────────────┘
//!
//!  On dispose:
//!   Deadline → bounded teardown, abandon wedged workers
//! ```

pub mod deadline;
pub mod host_gate;
pub mod poll;
pub mod retry;

pub use deadline::{run_with_deadline, Completion};
pub use host_gate::{HostGate, HostPermit};
pub use poll::{PollOutcome, Poller};
pub use retry::{RetryPolicy, Verdict};

/// Prelude module for convenient imports
pub mod prelude {
    pub use super::deadline::{run_with_deadline, Completion};
    pub use super::host_gate::{HostGate, HostPermit};
    pub use super::poll::{PollOutcome, Poller};
    pub use super::retry::{RetryPolicy, Verdict};
}
