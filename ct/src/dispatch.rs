//! Receive/dispatch engine
//!
//! # Purpose
//! Drains the G2H ring off the interrupt path. The interrupt handler
//! enqueues a kick token; a single worker thread per channel consumes the
//! queue, preserving per-channel ordering, and demultiplexes responses to
//! outstanding requests versus unsolicited events.
//!
//! # Error policy
//! A malformed message is logged and skipped, never aborts the loop:
//! forward progress for other outstanding requests is preserved. Responses
//! with an unknown fence and events with no interested handler are logged
//! and dropped.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Sender};
use log::{debug, warn};

use crate::channel::Shared;
use crate::lock_or_recover;
use crate::msg::{MsgFlags, MsgHeader};
use crate::{CtError, Result};

/// Work tokens consumed by the per-channel dispatch thread.
pub(crate) enum Token {
    /// G2H ring may have new data.
    Kick,
    /// Channel is being dropped; exit.
    Shutdown,
}

/// Spawn the dispatch worker for a channel.
pub(crate) fn spawn_worker(shared: Arc<Shared>) -> Result<(Sender<Token>, JoinHandle<()>)> {
    let (tx, rx) = unbounded();
    let handle = std::thread::Builder::new()
        .name("ct-g2h".into())
        .spawn(move || {
            while let Ok(Token::Kick) = rx.recv() {
                process_g2h(&shared);
            }
        })
        .map_err(|e| CtError::Alloc(format!("failed to spawn dispatch worker: {e}")))?;
    Ok((tx, handle))
}

/// Drain every complete G2H message. The recv lock is dropped before a
/// message is routed so the fast path (and handler-context sends) can run
/// while a sink handler works.
pub(crate) fn process_g2h(shared: &Shared) {
    loop {
        let (hdr, payload) = {
            let mut rs = lock_or_recover(&shared.recv);
            let Some(ring) = rs.g2h.as_mut() else {
                return;
            };
            let hdr = match ring.peek_header() {
                Ok(Some(hdr)) => hdr,
                Ok(None) => return,
                Err(e) => {
                    warn!("G2H dispatch: {e}; skipping damaged message");
                    ring.drop_damaged();
                    continue;
                }
            };
            let payload = ring.payload(&hdr).to_vec();
            ring.consume(&hdr);
            (hdr, payload)
        };
        deliver(shared, hdr, &payload);
    }
}

fn deliver(shared: &Shared, hdr: MsgHeader, payload: &[u32]) {
    if hdr.flags.contains(MsgFlags::HANDLED) {
        // Already delivered by the fast path; just settle the credits.
        shared.release_unfenced(hdr.msg_words());
        return;
    }

    match hdr.flags.class() {
        MsgFlags::RESPONSE => match shared.pending.remove(hdr.fence) {
            Some(entry) => {
                shared.release_g2h(entry.g2h_reserved());
                match entry.response_capacity() {
                    Some(capacity) if payload.len() > capacity => {
                        warn!(
                            "response to action {:#x} (fence {}) is {} words, caller buffer \
                             holds {capacity}",
                            hdr.action,
                            hdr.fence,
                            payload.len()
                        );
                        entry.complete(Err(CtError::Protocol(format!(
                            "response of {} words exceeds caller buffer of {capacity}",
                            payload.len()
                        ))));
                    }
                    Some(_) => entry.complete(Ok(payload.to_vec())),
                    None => {
                        if !payload.is_empty() {
                            debug!(
                                "dropping {}-word response payload for ack-only fence {}",
                                payload.len(),
                                hdr.fence
                            );
                        }
                        entry.complete(Ok(Vec::new()));
                    }
                }
            }
            None => warn!(
                "G2H response to action {:#x} with unknown fence {}; dropping",
                hdr.action, hdr.fence
            ),
        },
        MsgFlags::EVENT => {
            shared.release_unfenced(hdr.msg_words());
            shared.sink.event(hdr.action, payload);
        }
        _ => warn!(
            "unexpected {:?} message on G2H ring (action {:#x}); dropping",
            hdr.flags.class(),
            hdr.action
        ),
    }
}
