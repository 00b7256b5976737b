//! GuC Command Transport (CT) - host/firmware messaging channel
//!
//! # Purpose
//! Implements the bidirectional, ring-buffer-based command transport
//! between a host GPU driver and the GuC, the GPU's embedded scheduling
//! microcontroller: ordered delivery over paired H2G/G2H rings, bounded
//! flow control, blocking and non-blocking request/response semantics, and
//! forward progress while the GPU is mid-reset.
//!
//! # Integration Points
//! - Depends on: an interrupt source calling [`CtChannel::irq_handler`],
//!   and a firmware endpoint on the far side of the rings (the built-in
//!   [`mock::MockGuc`] for tests and simulation).
//! - Provides to: engine, scheduling, and power collaborators submitting
//!   opaque actions through the send variants, and receiving unsolicited
//!   events through an [`EventSink`].
//!
//! # Architecture
//! One send lock serializes the H2G write side; a single dispatch worker
//! per channel drains G2H off the interrupt path; a narrow fast path
//! delivers latency-critical events directly from the interrupt entry
//! point. Round-trip requests are correlated by fence through the
//! outstanding-request table, one completion signal per request.
//!
//! # Testing Strategy
//! - Unit tests: codec, ring framing, fence table, lifecycle.
//! - Integration tests: full channel against the mock firmware
//!   (`tests/channel_test.rs`).

use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

pub mod channel;
pub mod dispatch;
pub mod events;
pub mod msg;
pub mod pending;
pub mod ring;
pub mod snapshot;

#[cfg(feature = "mock")]
pub mod mock;

pub use channel::{CtChannel, CtConfig, CtState, SendGuard};
pub use events::{EventSink, NullSink};
pub use msg::{MsgFlags, MsgHeader};
pub use ring::RingSide;
pub use snapshot::{CtSnapshot, RingSnapshot};

/// Error taxonomy of the CT channel.
#[derive(Debug, Clone, Error)]
pub enum CtError {
    /// Channel not `Enabled` at call time, or became disabled while the
    /// caller was waiting.
    #[error("channel disabled")]
    ChannelDisabled,

    /// Transient ring-capacity backpressure; retryable.
    #[error("no space in {ring} ring (needed {needed} words, {available} available)")]
    NoSpace {
        ring: ring::RingSide,
        needed: u32,
        available: u32,
    },

    /// Transient contention (send lock held, fence space exhausted);
    /// retryable.
    #[error("transport busy")]
    Busy,

    /// No matching response within the allotted window.
    #[error("timed out waiting for response")]
    Timeout,

    /// Malformed header, length mismatch, or unknown fence: host and
    /// firmware have desynchronized.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Resource setup failure during `init`.
    #[error("allocation failure: {0}")]
    Alloc(String),
}

pub type Result<T> = core::result::Result<T, CtError>;

/// Lock a mutex, recovering the guard if a panicking holder poisoned it.
/// Channel state stays consistent under poisoning because every critical
/// section either completes its cursor/table update or leaves it untouched.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
