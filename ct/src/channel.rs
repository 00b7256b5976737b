//! CT channel
//!
//! # Purpose
//! Owns both rings, the outstanding-request table, and the lifecycle state
//! machine, and implements the send engine: fire-and-forget, caller-locked,
//! blocking round-trip, no-fail, and G2H-handler-context sends.
//!
//! # Architecture
//! All H2G write-side state sits behind one send lock; the G2H ring sits
//! behind its own lock shared by the fast path and the dispatch worker; the
//! request table and the G2H credit pool have independent locks. Lock order
//! is state → send → recv → credits; no path acquires them in reverse.
//!
//! # Integration Points
//! - Inbound: `irq_handler` from the interrupt layer; the four send
//!   variants from engine/power collaborators.
//! - Outbound: [`EventSink`] for unsolicited events; [`CtSnapshot`] for
//!   crash-dump formatting.
//!
//! [`CtSnapshot`]: crate::snapshot::CtSnapshot

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, TryLockError};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, warn};

use crate::dispatch::{self, Token};
use crate::events::EventSink;
use crate::lock_or_recover;
use crate::msg::{MsgFlags, MsgHeader, HEADER_WORDS, MAX_PAYLOAD_WORDS};
use crate::pending::{PendingRequest, PendingTable};
use crate::ring::{CtRing, RingSide};
use crate::{CtError, Result};

/// Channel construction parameters.
#[derive(Debug, Clone)]
pub struct CtConfig {
    /// H2G ring capacity in words (power of two).
    pub h2g_words: u32,
    /// G2H ring capacity in words (power of two).
    pub g2h_words: u32,
    /// How long a blocking send waits for its response.
    pub response_timeout: Duration,
    /// Bounded retry budget for transient `NoSpace`/`Busy` on ordinary sends.
    pub send_retries: u32,
    /// Pause between retries while waiting for ring space.
    pub retry_backoff: Duration,
}

impl Default for CtConfig {
    fn default() -> Self {
        Self {
            h2g_words: 1024,
            g2h_words: 1024,
            response_timeout: Duration::from_secs(1),
            send_retries: 8,
            retry_backoff: Duration::from_millis(2),
        }
    }
}

/// Channel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtState {
    Uninitialized,
    Initialized,
    Enabled,
    Disabled,
}

pub(crate) struct SendState {
    pub(crate) h2g: Option<CtRing>,
}

pub(crate) struct RecvState {
    pub(crate) g2h: Option<CtRing>,
}

/// G2H flow-control credits. Round-trip sends reserve the words their
/// response will occupy; fire-and-forget sends that expect asynchronous
/// completion events reserve into the `unfenced` pool, drained as events
/// are consumed.
pub(crate) struct Credits {
    pub(crate) capacity: u32,
    pub(crate) reserved: u32,
    pub(crate) unfenced: u32,
}

/// State shared between the public channel handle, the dispatch worker, and
/// the fast path.
pub(crate) struct Shared {
    pub(crate) state: Mutex<CtState>,
    pub(crate) enabled: AtomicBool,
    pub(crate) cfg: Mutex<CtConfig>,
    pub(crate) send: Mutex<SendState>,
    pub(crate) recv: Mutex<RecvState>,
    pub(crate) credits: Mutex<Credits>,
    pub(crate) pending: PendingTable,
    pub(crate) sink: Box<dyn EventSink>,
    /// Senders blocked on ring space park here; woken by `irq_handler`.
    pub(crate) space_lock: Mutex<()>,
    pub(crate) space_cond: Condvar,
    pub(crate) queue_tx: OnceLock<crossbeam::channel::Sender<Token>>,
}

impl Shared {
    pub(crate) fn reserve_g2h(&self, words: u32, unfenced: bool) -> Result<()> {
        let mut credits = lock_or_recover(&self.credits);
        // reserved never exceeds capacity, so this cannot underflow; the
        // subtraction form also keeps a degenerate `words` from wrapping.
        if words > credits.capacity - credits.reserved {
            return Err(CtError::NoSpace {
                ring: RingSide::G2h,
                needed: words,
                available: credits.capacity - credits.reserved,
            });
        }
        credits.reserved += words;
        if unfenced {
            credits.unfenced += words;
        }
        Ok(())
    }

    pub(crate) fn release_g2h(&self, words: u32) {
        let mut credits = lock_or_recover(&self.credits);
        credits.reserved = credits.reserved.saturating_sub(words);
    }

    /// Release credits covering an unsolicited event of `words` footprint,
    /// capped at what fire-and-forget senders actually reserved.
    pub(crate) fn release_unfenced(&self, words: u32) {
        let mut credits = lock_or_recover(&self.credits);
        let take = credits.unfenced.min(words);
        credits.unfenced -= take;
        credits.reserved = credits.reserved.saturating_sub(take);
    }

    fn reset_credits(&self) {
        let mut credits = lock_or_recover(&self.credits);
        credits.reserved = 0;
        credits.unfenced = 0;
    }

    /// Wake everything that can be blocked on this channel: request waiters
    /// re-check their own completion slot, space waiters retry reservation.
    pub(crate) fn wake_all(&self) {
        self.pending.wake_all();
        let _guard = lock_or_recover(&self.space_lock);
        self.space_cond.notify_all();
    }

    /// Latency-privileged pre-check run inline from the interrupt entry
    /// point. Scans undelivered G2H messages, hands events the sink marked
    /// as fast directly to it, stamps them handled in-ring, and broadcasts
    /// a coarse wake; everything else waits for the dispatch worker.
    pub(crate) fn fast_path(&self) {
        let fast = self.sink.fast_actions();
        if fast.is_empty() {
            return;
        }
        let mut rs = lock_or_recover(&self.recv);
        let Some(ring) = rs.g2h.as_mut() else {
            return;
        };
        for (offset, hdr) in ring.scan() {
            if hdr.flags.class() != MsgFlags::EVENT
                || hdr.flags.contains(MsgFlags::HANDLED)
                || !fast.contains(&hdr.action)
            {
                continue;
            }
            let payload = ring.payload_at(offset, &hdr).to_vec();
            let mut marked = hdr;
            marked.flags |= MsgFlags::HANDLED;
            ring.annotate_header(offset, &marked);
            self.sink.fast_event(hdr.action, &payload);
            self.pending.wake_all();
        }
    }
}

/// The command-transport channel.
///
/// Created with [`CtChannel::new`], then driven through the lifecycle:
/// [`init`](Self::init) → [`enable`](Self::enable) →
/// ([`disable`](Self::disable) ⇄ `enable`). Wrap it in an [`Arc`] to share
/// between sender contexts, the interrupt layer, and collaborators.
pub struct CtChannel {
    pub(crate) shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Proof that the caller holds the channel's send lock; required by
/// [`CtChannel::send_locked`] so an outer protocol step already serialized
/// on the lock cannot deadlock by re-acquiring it.
pub struct SendGuard<'a> {
    pub(crate) st: MutexGuard<'a, SendState>,
}

fn post(
    ring: &mut CtRing,
    flags: MsgFlags,
    action: u32,
    payload: &[u32],
    fence: u16,
) -> Result<()> {
    if payload.len() > MAX_PAYLOAD_WORDS {
        return Err(CtError::Protocol(format!(
            "payload of {} words exceeds header length field",
            payload.len()
        )));
    }
    let hdr = MsgHeader::new(flags, action, payload.len() as u16, fence);
    let offset = ring.reserve(hdr.msg_words())?;
    let mut words = Vec::with_capacity(hdr.msg_words() as usize);
    words.extend_from_slice(&hdr.encode());
    words.extend_from_slice(payload);
    ring.commit(offset, &words);
    Ok(())
}

fn copy_response(response: Option<&mut [u32]>, words: &[u32]) -> usize {
    if let Some(buf) = response {
        buf[..words.len()].copy_from_slice(words);
    }
    words.len()
}

impl CtChannel {
    /// Create an unconfigured channel. The sink receives unsolicited events
    /// and defines the fast-path action set for the channel's lifetime.
    pub fn new(sink: Box<dyn EventSink>) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(CtState::Uninitialized),
                enabled: AtomicBool::new(false),
                cfg: Mutex::new(CtConfig::default()),
                send: Mutex::new(SendState { h2g: None }),
                recv: Mutex::new(RecvState { g2h: None }),
                credits: Mutex::new(Credits {
                    capacity: 0,
                    reserved: 0,
                    unfenced: 0,
                }),
                pending: PendingTable::new(),
                sink,
                space_lock: Mutex::new(()),
                space_cond: Condvar::new(),
                queue_tx: OnceLock::new(),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Allocate rings, credits, and the dispatch worker.
    ///
    /// On failure the state stays `Uninitialized` and `init` may be called
    /// again. Calling it after a successful init is an error.
    pub fn init(&self, cfg: CtConfig) -> Result<()> {
        let mut state = lock_or_recover(&self.shared.state);
        if *state != CtState::Uninitialized {
            return Err(CtError::Alloc("channel already initialized".into()));
        }
        if cfg.response_timeout.is_zero() {
            return Err(CtError::Alloc("response timeout must be nonzero".into()));
        }

        let h2g = CtRing::new(RingSide::H2g, cfg.h2g_words)?;
        let g2h = CtRing::new(RingSide::G2h, cfg.g2h_words)?;

        let (tx, handle) = dispatch::spawn_worker(Arc::clone(&self.shared))?;
        // First init is the only one that gets here, so set() cannot race.
        let _ = self.shared.queue_tx.set(tx);
        *lock_or_recover(&self.worker) = Some(handle);

        lock_or_recover(&self.shared.send).h2g = Some(h2g);
        lock_or_recover(&self.shared.recv).g2h = Some(g2h);
        {
            let mut credits = lock_or_recover(&self.shared.credits);
            credits.capacity = cfg.g2h_words;
            credits.reserved = 0;
            credits.unfenced = 0;
        }
        *lock_or_recover(&self.shared.cfg) = cfg;
        *state = CtState::Initialized;
        debug!("CT channel initialized");
        Ok(())
    }

    /// Bring the channel up after the firmware handshake. Resets both rings
    /// for the new session and wakes any stragglers from a previous one.
    /// Idempotent while enabled.
    pub fn enable(&self) -> Result<()> {
        let mut state = lock_or_recover(&self.shared.state);
        match *state {
            CtState::Uninitialized => Err(CtError::ChannelDisabled),
            CtState::Enabled => Ok(()),
            CtState::Initialized | CtState::Disabled => {
                if let Some(ring) = lock_or_recover(&self.shared.send).h2g.as_mut() {
                    ring.reset();
                }
                if let Some(ring) = lock_or_recover(&self.shared.recv).g2h.as_mut() {
                    ring.reset();
                }
                self.shared.reset_credits();
                *state = CtState::Enabled;
                self.shared.enabled.store(true, Ordering::Release);
                drop(state);
                self.shared.wake_all();
                debug!("CT channel enabled");
                Ok(())
            }
        }
    }

    /// Take the channel down. Every outstanding request resolves with
    /// [`CtError::ChannelDisabled`]; in-flight blocking sends observe the
    /// failure. The channel remains reusable via [`enable`](Self::enable).
    pub fn disable(&self) {
        {
            let mut state = lock_or_recover(&self.shared.state);
            self.shared.enabled.store(false, Ordering::Release);
            if *state == CtState::Enabled {
                *state = CtState::Disabled;
            }
        }
        let flushed = self.shared.pending.flush_all(CtError::ChannelDisabled);
        if !flushed.is_empty() {
            warn!(
                "CT channel disabled with {} outstanding requests",
                flushed.len()
            );
        }
        self.shared.reset_credits();
        self.shared.wake_all();
    }

    pub fn state(&self) -> CtState {
        *lock_or_recover(&self.shared.state)
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(CtError::ChannelDisabled)
        }
    }

    fn config(&self) -> CtConfig {
        lock_or_recover(&self.shared.cfg).clone()
    }

    /// Interrupt entry point: "the G2H ring and/or fast-path condition may
    /// have new data". Safe to invoke at high frequency; never blocks on
    /// the send lock and never sleeps.
    pub fn irq_handler(&self) {
        if !self.is_enabled() {
            return;
        }
        self.shared.wake_all();
        if let Some(tx) = self.shared.queue_tx.get() {
            let _ = tx.send(Token::Kick);
        }
        self.shared.fast_path();
    }

    /// Acquire the send lock for a sequence of [`send_locked`] calls.
    ///
    /// [`send_locked`]: Self::send_locked
    pub fn lock_send(&self) -> SendGuard<'_> {
        SendGuard {
            st: lock_or_recover(&self.shared.send),
        }
    }

    /// Fire-and-forget send with the send lock already held. No retry: the
    /// caller serialized on the lock and owns backoff policy.
    ///
    /// `g2h_words` is the G2H footprint of any asynchronous completion this
    /// action will later produce; it is reserved from the credit pool.
    pub fn send_locked(
        &self,
        guard: &mut SendGuard<'_>,
        action: u32,
        payload: &[u32],
        g2h_words: u32,
    ) -> Result<()> {
        self.ensure_enabled()?;
        if g2h_words > 0 {
            self.shared.reserve_g2h(g2h_words, true)?;
        }
        let ring = guard.st.h2g.as_mut().ok_or(CtError::ChannelDisabled)?;
        match post(ring, MsgFlags::REQUEST, action, payload, 0) {
            Ok(()) => Ok(()),
            Err(e) => {
                if g2h_words > 0 {
                    self.shared.release_unfenced(g2h_words);
                }
                Err(e)
            }
        }
    }

    /// Fire-and-forget send. Retries transient `NoSpace`/`Busy` up to the
    /// configured budget, parking on the space condition between attempts,
    /// then surfaces the error.
    pub fn send(&self, action: u32, payload: &[u32], g2h_words: u32) -> Result<()> {
        let cfg = self.config();
        let mut attempts = 0;
        loop {
            let result = {
                let mut guard = self.lock_send();
                self.send_locked(&mut guard, action, payload, g2h_words)
            };
            match result {
                Err(CtError::NoSpace { .. }) | Err(CtError::Busy)
                    if attempts < cfg.send_retries =>
                {
                    attempts += 1;
                    self.wait_for_space(cfg.retry_backoff);
                }
                other => return other,
            }
        }
    }

    /// Blocking round-trip send.
    ///
    /// Posts the action with a fresh fence, releases the send lock, and
    /// suspends until the matching response arrives (copied into
    /// `response`, returning its word count), the configured timeout
    /// elapses, or the channel is disabled mid-flight. Pass `None` to block
    /// for the acknowledgement alone. A response larger than the caller's
    /// buffer fails with [`CtError::Protocol`] rather than truncating.
    pub fn send_recv(
        &self,
        action: u32,
        payload: &[u32],
        mut response: Option<&mut [u32]>,
    ) -> Result<usize> {
        let cfg = self.config();
        let capacity = response.as_ref().map(|b| b.len());
        // Header plus the widest response we told the caller we can take.
        let g2h_words = HEADER_WORDS + capacity.unwrap_or(0) as u32;

        let mut attempts = 0;
        let entry = loop {
            match self.try_post_tracked(action, payload, capacity, g2h_words) {
                Ok(entry) => break entry,
                Err(CtError::NoSpace { .. }) | Err(CtError::Busy)
                    if attempts < cfg.send_retries =>
                {
                    attempts += 1;
                    self.wait_for_space(cfg.retry_backoff);
                }
                Err(e) => return Err(e),
            }
        };

        match entry.wait(cfg.response_timeout) {
            Ok(words) => Ok(copy_response(response.as_deref_mut(), &words)),
            Err(CtError::Timeout) => {
                // The response may have landed between the timeout and now;
                // only report Timeout if the entry is really still ours.
                match self.shared.pending.remove(entry.fence()) {
                    Some(stale) => {
                        self.shared.release_g2h(stale.g2h_reserved());
                        debug!("request {:#x} (fence {}) timed out", action, entry.fence());
                        Err(CtError::Timeout)
                    }
                    None => match entry.try_take_result() {
                        Some(Ok(words)) => Ok(copy_response(response.as_deref_mut(), &words)),
                        Some(Err(e)) => Err(e),
                        None => Err(CtError::Timeout),
                    },
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Blocking send that waits for the bare acknowledgement.
    pub fn send_block(&self, action: u32, payload: &[u32]) -> Result<()> {
        self.send_recv(action, payload, None).map(|_| ())
    }

    /// Round-trip send for reset recovery, where the caller has no
    /// fallback. Transient failures (`NoSpace`, `Busy`, and even
    /// `Timeout`) are absorbed into bounded-backoff retry; only structural
    /// disablement surfaces, and it is logged as severe because no recovery
    /// path remains.
    pub fn send_recv_no_fail(
        &self,
        action: u32,
        payload: &[u32],
        mut response: Option<&mut [u32]>,
    ) -> Result<usize> {
        let cfg = self.config();
        let mut backoff = cfg.retry_backoff.max(Duration::from_micros(100));
        loop {
            match self.send_recv(action, payload, response.as_deref_mut()) {
                Ok(len) => return Ok(len),
                Err(CtError::ChannelDisabled) => {
                    error!(
                        "no-fail send of action {action:#x} failed: channel disabled, \
                         no recovery path remains"
                    );
                    return Err(CtError::ChannelDisabled);
                }
                Err(e) => {
                    debug!("no-fail send of action {action:#x} retrying after {e}");
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(Duration::from_millis(100));
                }
            }
        }
    }

    /// No-fail variant of [`send_block`](Self::send_block).
    pub fn send_block_no_fail(&self, action: u32, payload: &[u32]) -> Result<()> {
        self.send_recv_no_fail(action, payload, None).map(|_| ())
    }

    /// Restricted send for G2H handler context: never takes the normal send
    /// lock (contention surfaces as [`CtError::Busy`]), never blocks, and
    /// cannot wait for a response.
    pub fn send_from_handler(&self, action: u32, payload: &[u32]) -> Result<()> {
        self.ensure_enabled()?;
        let mut st = match self.shared.send.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(CtError::Busy),
        };
        let ring = st.h2g.as_mut().ok_or(CtError::ChannelDisabled)?;
        post(ring, MsgFlags::REQUEST, action, payload, 0)
    }

    /// Reserve credits, register a fence, and post a tracked request, all
    /// under the send lock. Unwinds the registration on a failed post.
    fn try_post_tracked(
        &self,
        action: u32,
        payload: &[u32],
        capacity: Option<usize>,
        g2h_words: u32,
    ) -> Result<Arc<PendingRequest>> {
        self.ensure_enabled()?;
        let mut st = lock_or_recover(&self.shared.send);
        self.shared.reserve_g2h(g2h_words, false)?;
        let entry = match self.shared.pending.register(capacity, g2h_words) {
            Ok(entry) => entry,
            Err(e) => {
                self.shared.release_g2h(g2h_words);
                return Err(e);
            }
        };
        let ring = match st.h2g.as_mut() {
            Some(ring) => ring,
            None => {
                self.shared.pending.remove(entry.fence());
                self.shared.release_g2h(g2h_words);
                return Err(CtError::ChannelDisabled);
            }
        };
        match post(ring, MsgFlags::REQUEST, action, payload, entry.fence()) {
            Ok(()) => {
                // disable() does not serialize on the send lock, so its
                // flush can run between the enabled check above and the
                // registration. Re-check now that the entry is in the
                // table: either the flush saw it, or we unwind it here.
                if !self.is_enabled() {
                    if self.shared.pending.remove(entry.fence()).is_some() {
                        self.shared.release_g2h(g2h_words);
                    }
                    return Err(CtError::ChannelDisabled);
                }
                Ok(entry)
            }
            Err(e) => {
                self.shared.pending.remove(entry.fence());
                self.shared.release_g2h(g2h_words);
                Err(e)
            }
        }
    }

    fn wait_for_space(&self, backoff: Duration) {
        let guard = lock_or_recover(&self.shared.space_lock);
        let _ = self
            .shared
            .space_cond
            .wait_timeout(guard, backoff)
            .unwrap_or_else(|e| e.into_inner());
    }

    // Firmware-side accessors used by the mock backend. A real deployment
    // replaces these with the hardware's view of the shared rings.

    #[cfg(feature = "mock")]
    pub(crate) fn fw_pop_h2g(&self) -> Option<(MsgHeader, Vec<u32>)> {
        let mut st = lock_or_recover(&self.shared.send);
        let ring = st.h2g.as_mut()?;
        match ring.peek_header() {
            Ok(Some(hdr)) => {
                let payload = ring.payload(&hdr).to_vec();
                ring.consume(&hdr);
                Some((hdr, payload))
            }
            Ok(None) => None,
            Err(e) => {
                warn!("firmware saw damaged H2G message: {e}");
                ring.drop_damaged();
                None
            }
        }
    }

    #[cfg(feature = "mock")]
    pub(crate) fn fw_push_g2h(
        &self,
        flags: MsgFlags,
        action: u32,
        payload: &[u32],
        fence: u16,
    ) -> Result<()> {
        let mut rs = lock_or_recover(&self.shared.recv);
        let ring = rs.g2h.as_mut().ok_or(CtError::ChannelDisabled)?;
        post(ring, flags, action, payload, fence)
    }

    #[cfg(feature = "mock")]
    pub(crate) fn fw_push_raw(&self, words: &[u32]) -> Result<()> {
        let mut rs = lock_or_recover(&self.shared.recv);
        let ring = rs.g2h.as_mut().ok_or(CtError::ChannelDisabled)?;
        let offset = ring.reserve(words.len() as u32)?;
        ring.commit(offset, words);
        Ok(())
    }
}

impl Drop for CtChannel {
    fn drop(&mut self) {
        if let Some(tx) = self.shared.queue_tx.get() {
            let _ = tx.send(Token::Shutdown);
        }
        if let Some(handle) = lock_or_recover(&self.worker).take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;

    fn channel() -> Arc<CtChannel> {
        CtChannel::new(Box::new(NullSink))
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let ct = channel();
        assert_eq!(ct.state(), CtState::Uninitialized);
        ct.init(CtConfig::default()).unwrap();
        assert_eq!(ct.state(), CtState::Initialized);
        ct.enable().unwrap();
        assert_eq!(ct.state(), CtState::Enabled);
        ct.disable();
        assert_eq!(ct.state(), CtState::Disabled);
        ct.enable().unwrap();
        assert_eq!(ct.state(), CtState::Enabled);
    }

    #[test]
    fn test_init_rejects_bad_config() {
        let ct = channel();
        let cfg = CtConfig {
            h2g_words: 100, // not a power of two
            ..CtConfig::default()
        };
        assert!(matches!(ct.init(cfg), Err(CtError::Alloc(_))));
        assert_eq!(ct.state(), CtState::Uninitialized);

        let cfg = CtConfig {
            response_timeout: Duration::ZERO,
            ..CtConfig::default()
        };
        assert!(matches!(ct.init(cfg), Err(CtError::Alloc(_))));
        assert_eq!(ct.state(), CtState::Uninitialized);

        // Still usable after failed attempts.
        ct.init(CtConfig::default()).unwrap();
        assert_eq!(ct.state(), CtState::Initialized);
    }

    #[test]
    fn test_double_init_rejected() {
        let ct = channel();
        ct.init(CtConfig::default()).unwrap();
        assert!(matches!(
            ct.init(CtConfig::default()),
            Err(CtError::Alloc(_))
        ));
    }

    #[test]
    fn test_enable_before_init_rejected() {
        let ct = channel();
        assert!(matches!(ct.enable(), Err(CtError::ChannelDisabled)));
    }

    #[test]
    fn test_sends_fail_while_not_enabled() {
        let ct = channel();
        assert!(matches!(
            ct.send(0x10, &[], 0),
            Err(CtError::ChannelDisabled)
        ));

        ct.init(CtConfig::default()).unwrap();
        assert!(matches!(
            ct.send(0x10, &[], 0),
            Err(CtError::ChannelDisabled)
        ));
        assert!(matches!(
            ct.send_from_handler(0x10, &[]),
            Err(CtError::ChannelDisabled)
        ));

        ct.enable().unwrap();
        ct.send(0x10, &[1, 2], 0).unwrap();

        ct.disable();
        assert!(matches!(
            ct.send(0x10, &[], 0),
            Err(CtError::ChannelDisabled)
        ));
    }

    #[test]
    #[cfg(feature = "mock")]
    fn test_send_locked_posts_without_reacquiring() {
        let ct = channel();
        ct.init(CtConfig::default()).unwrap();
        ct.enable().unwrap();

        let mut guard = ct.lock_send();
        ct.send_locked(&mut guard, 0x20, &[1], 0).unwrap();
        ct.send_locked(&mut guard, 0x21, &[2], 0).unwrap();
        drop(guard);

        let (hdr, payload) = ct.fw_pop_h2g().unwrap();
        assert_eq!(hdr.action, 0x20);
        assert_eq!(payload, vec![1]);
        let (hdr, _) = ct.fw_pop_h2g().unwrap();
        assert_eq!(hdr.action, 0x21);
    }

    #[test]
    fn test_huge_credit_reservation_is_no_space() {
        let ct = channel();
        let cfg = CtConfig {
            g2h_words: 16,
            send_retries: 0,
            ..CtConfig::default()
        };
        ct.init(cfg).unwrap();
        ct.enable().unwrap();

        let mut guard = ct.lock_send();
        ct.send_locked(&mut guard, 0x32, &[], 12).unwrap();
        // A near-u32::MAX request must not wrap the credit counter past
        // the capacity check; it fails like any other oversized one.
        let result = ct.send_locked(&mut guard, 0x33, &[], 0xFFFF_FFF8);
        assert!(matches!(
            result,
            Err(CtError::NoSpace {
                ring: RingSide::G2h,
                needed: 0xFFFF_FFF8,
                available: 4,
            })
        ));
        drop(guard);

        // The failed reservation left the pool intact.
        ct.send(0x34, &[], 4).unwrap();
    }

    #[test]
    fn test_disable_racing_tracked_post_resolves_promptly() {
        use std::time::Instant;

        let ct = channel();
        let cfg = CtConfig {
            // Long enough that a stranded waiter would be obvious.
            response_timeout: Duration::from_secs(10),
            send_retries: 0,
            ..CtConfig::default()
        };
        ct.init(cfg).unwrap();
        ct.enable().unwrap();

        // Park a blocking sender on the send lock so it passes the enabled
        // check but cannot register until after disable() has flushed.
        let guard = ct.lock_send();
        let sender = Arc::clone(&ct);
        let handle = std::thread::spawn(move || sender.send_block(0x50, &[1]));
        std::thread::sleep(Duration::from_millis(50));

        ct.disable();
        drop(guard);

        let start = Instant::now();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(CtError::ChannelDisabled)));
        assert!(start.elapsed() < Duration::from_secs(5), "sender stranded");
        assert!(ct.shared.pending.is_empty());
    }

    #[test]
    fn test_g2h_credit_exhaustion_is_no_space() {
        let ct = channel();
        let cfg = CtConfig {
            g2h_words: 16,
            send_retries: 0,
            ..CtConfig::default()
        };
        ct.init(cfg).unwrap();
        ct.enable().unwrap();

        // Reserve 12 of the 16 credit words.
        let mut guard = ct.lock_send();
        ct.send_locked(&mut guard, 0x30, &[], 12).unwrap();
        // 8 more cannot fit.
        let result = ct.send_locked(&mut guard, 0x31, &[], 8);
        assert!(matches!(
            result,
            Err(CtError::NoSpace {
                ring: RingSide::G2h,
                ..
            })
        ));
    }

    #[test]
    fn test_disable_releases_credits() {
        let ct = channel();
        let cfg = CtConfig {
            g2h_words: 16,
            send_retries: 0,
            ..CtConfig::default()
        };
        ct.init(cfg).unwrap();
        ct.enable().unwrap();

        ct.send(0x40, &[], 12).unwrap();
        ct.disable();
        ct.enable().unwrap();
        // Full credit pool again after the reset.
        ct.send(0x41, &[], 16).unwrap();
    }
}
