//! Core error kinds.
//!
//! Nothing in the composition pipeline is fatal at tick scope; these types
//! classify faults so call sites can pick the right degradation path.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// The configuration snapshot is invalid or inconsistent.
    /// Fatal at startup; on reload the previous snapshot is kept.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A driver is not connected. Degrade to software-only operation.
    #[error("hardware unavailable: {0}")]
    HardwareUnavailable(String),

    /// A single hardware read/write failed; the supervisor decides when to
    /// force a reconnect.
    #[error("transient hardware fault: {0}")]
    HardwareTransient(String),

    /// A tick exceeded its budget. Logged rate-limited; ticks are never
    /// skipped or batched.
    #[error("tick overran its {budget_ms}ms budget ({overruns} of last {window} ticks)")]
    TickOverrun {
        budget_ms: u64,
        overruns: usize,
        window: usize,
    },

    /// A slow subscriber was disconnected.
    #[error("broadcast subscriber {0} dropped")]
    BroadcastDrop(usize),

    /// A value escaped its contractual range. Clamped and logged upstream.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The dirty bit stays set; the flush is retried on the next interval.
    #[error("state persistence failed: {0}")]
    Persistence(String),
}
