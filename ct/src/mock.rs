//! Mock GuC firmware
//!
//! # Purpose
//! A host-threaded stand-in for the firmware side of the CT channel, used
//! by unit/integration tests and the `ctsim` tool. It drains H2G messages,
//! runs a programmable responder over each, writes replies into G2H, and
//! fires the channel's interrupt entry point: the same contract real
//! hardware has with the driver.
//!
//! # Testing hooks
//! - `pause`/`resume` stall H2G consumption so backpressure paths
//!   (`NoSpace`, no-fail retry) can be exercised deterministically.
//! - `inject_event`/`inject_raw` place unsolicited (or deliberately
//!   damaged) traffic on the G2H ring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};

use crate::channel::CtChannel;
use crate::msg::MsgFlags;
use crate::Result;

/// What the responder wants done with one H2G request.
pub enum MockReply {
    /// Send a response with these payload words, correlated by the
    /// request's fence. Ignored for untracked (fence 0) requests.
    Respond(Vec<u32>),
    /// Swallow the request; the sender times out (or retries, for no-fail).
    Ignore,
    /// Swallow the request and emit an unsolicited event instead.
    Event { action: u32, payload: Vec<u32> },
}

/// Per-request firmware behavior. Receives the action code and payload of
/// every H2G message, tracked or not.
pub type Responder = Box<dyn FnMut(u32, &[u32]) -> MockReply + Send>;

/// Emulated GuC endpoint bound to one channel.
pub struct MockGuc {
    ct: Arc<CtChannel>,
    stop: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MockGuc {
    /// Start the firmware thread with the given responder.
    pub fn spawn(ct: Arc<CtChannel>, mut responder: Responder) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let paused = Arc::new(AtomicBool::new(false));

        let thread = {
            let ct = Arc::clone(&ct);
            let stop = Arc::clone(&stop);
            let paused = Arc::clone(&paused);
            std::thread::Builder::new()
                .name("mock-guc".into())
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        if paused.load(Ordering::Acquire) {
                            std::thread::sleep(Duration::from_micros(500));
                            continue;
                        }
                        match ct.fw_pop_h2g() {
                            Some((hdr, payload)) => {
                                let reply = responder(hdr.action, &payload);
                                match reply {
                                    MockReply::Respond(words) => {
                                        if hdr.fence == 0 {
                                            debug!(
                                                "mock fw: no response for untracked action {:#x}",
                                                hdr.action
                                            );
                                        } else if let Err(e) = ct.fw_push_g2h(
                                            MsgFlags::RESPONSE,
                                            hdr.action,
                                            &words,
                                            hdr.fence,
                                        ) {
                                            warn!("mock fw: response dropped: {e}");
                                        }
                                    }
                                    MockReply::Ignore => {}
                                    MockReply::Event { action, payload } => {
                                        if let Err(e) = ct.fw_push_g2h(
                                            MsgFlags::EVENT,
                                            action,
                                            &payload,
                                            0,
                                        ) {
                                            warn!("mock fw: event dropped: {e}");
                                        }
                                    }
                                }
                                // H2G space freed and/or G2H data produced.
                                ct.irq_handler();
                            }
                            None => std::thread::sleep(Duration::from_micros(200)),
                        }
                    }
                })
                .unwrap_or_else(|e| panic!("failed to spawn mock firmware thread: {e}"))
        };

        Self {
            ct,
            stop,
            paused,
            thread: Some(thread),
        }
    }

    /// Firmware that echoes every tracked request's payload back.
    pub fn echo(ct: Arc<CtChannel>) -> Self {
        Self::spawn(ct, Box::new(|_, payload| MockReply::Respond(payload.to_vec())))
    }

    /// Stall H2G consumption (the firmware "hangs").
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Resume H2G consumption.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    /// Emit an unsolicited event and raise the interrupt.
    pub fn inject_event(&self, action: u32, payload: &[u32]) -> Result<()> {
        self.ct.fw_push_g2h(MsgFlags::EVENT, action, payload, 0)?;
        self.ct.irq_handler();
        Ok(())
    }

    /// Emit raw words onto the G2H ring (for protocol-error tests) and
    /// raise the interrupt.
    pub fn inject_raw(&self, words: &[u32]) -> Result<()> {
        self.ct.fw_push_raw(words)?;
        self.ct.irq_handler();
        Ok(())
    }
}

impl Drop for MockGuc {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
