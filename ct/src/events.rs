//! Unsolicited-event interface
//!
//! The original driver wires per-engine interrupt callbacks through raw
//! function pointers; here the channel dispatches through a trait object
//! chosen at construction. Implementors live outside the CT core
//! (scheduling, engine reset, power collaborators).

use log::debug;

/// Receives unsolicited G2H events.
///
/// `event` runs on the channel's dispatch worker and may perform real work,
/// including restricted sends via
/// [`CtChannel::send_from_handler`](crate::CtChannel::send_from_handler).
/// `fast_event` runs inline from the interrupt entry point and must be
/// short and non-blocking.
pub trait EventSink: Send + Sync {
    /// Action codes handled on the fast path. Empty by default.
    fn fast_actions(&self) -> &[u32] {
        &[]
    }

    /// Latency-critical delivery, invoked from interrupt context for
    /// actions listed in [`fast_actions`](Self::fast_actions).
    fn fast_event(&self, action: u32, payload: &[u32]) {
        let _ = (action, payload);
    }

    /// Ordinary delivery from the dispatch worker.
    fn event(&self, action: u32, payload: &[u32]);
}

impl<T: EventSink + ?Sized> EventSink for std::sync::Arc<T> {
    fn fast_actions(&self) -> &[u32] {
        (**self).fast_actions()
    }

    fn fast_event(&self, action: u32, payload: &[u32]) {
        (**self).fast_event(action, payload)
    }

    fn event(&self, action: u32, payload: &[u32]) {
        (**self).event(action, payload)
    }
}

/// Sink that logs and drops every event; useful for bring-up and tests
/// that only exercise the request/response path.
pub struct NullSink;

impl EventSink for NullSink {
    fn event(&self, action: u32, payload: &[u32]) {
        debug!("dropping unhandled event {action:#x} ({} words)", payload.len());
    }
}
