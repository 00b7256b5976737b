//! Outstanding-request table
//!
//! # Purpose
//! Tracks round-trip sends awaiting a firmware response, keyed by fence.
//! Each entry carries its own completion slot and condition variable, so a
//! response wakes exactly the waiter it belongs to; the fast path may still
//! broadcast a coarse wake, in which case every waiter re-checks its own
//! completion flag.
//!
//! # Concurrency
//! The table itself is behind one lock; completion slots are write-once, so
//! racing completion sources (response, timeout, channel disable) cannot
//! corrupt an entry or resolve it twice.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::lock_or_recover;
use crate::{CtError, Result};

/// Completion slot of one in-flight request.
struct CompletionState {
    done: bool,
    /// Response payload on success; the surfaced error otherwise.
    result: Option<Result<Vec<u32>>>,
}

/// One outstanding round-trip request.
pub struct PendingRequest {
    fence: u16,
    /// Caller's response-buffer capacity in words; `None` for ack-only.
    response_capacity: Option<usize>,
    /// G2H words reserved for this request's reply (flow-control credits).
    g2h_reserved: u32,
    state: Mutex<CompletionState>,
    cond: Condvar,
}

impl PendingRequest {
    pub fn fence(&self) -> u16 {
        self.fence
    }

    pub fn response_capacity(&self) -> Option<usize> {
        self.response_capacity
    }

    pub fn g2h_reserved(&self) -> u32 {
        self.g2h_reserved
    }

    /// Resolve the request. First caller wins; later attempts are the
    /// duplicate-wake case and are ignored.
    pub fn complete(&self, result: Result<Vec<u32>>) {
        let mut st = lock_or_recover(&self.state);
        if st.done {
            return;
        }
        st.result = Some(result);
        st.done = true;
        self.cond.notify_all();
    }

    /// Coarse wake without resolving; the waiter re-validates `done`.
    pub fn wake(&self) {
        self.cond.notify_all();
    }

    /// Non-blocking check, used after a timeout raced with a completion.
    pub fn try_take_result(&self) -> Option<Result<Vec<u32>>> {
        let mut st = lock_or_recover(&self.state);
        if st.done {
            st.result.take()
        } else {
            None
        }
    }

    /// Block until resolved or `timeout` elapses. Spurious and broadcast
    /// wakes loop back into the `done` check.
    pub fn wait(&self, timeout: Duration) -> Result<Vec<u32>> {
        let deadline = Instant::now() + timeout;
        let mut st = lock_or_recover(&self.state);
        while !st.done {
            let now = Instant::now();
            if now >= deadline {
                return Err(CtError::Timeout);
            }
            let (guard, _) = self
                .cond
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            st = guard;
        }
        match st.result.take() {
            Some(result) => result,
            // done without a result: already taken, treat as protocol desync
            None => Err(CtError::Protocol("request resolved twice".into())),
        }
    }
}

/// Table of in-flight requests plus the fence allocator.
pub struct PendingTable {
    inner: Mutex<TableInner>,
}

struct TableInner {
    entries: HashMap<u16, Arc<PendingRequest>>,
    next_fence: u16,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                entries: HashMap::new(),
                // Fence 0 is reserved for untracked (fire-and-forget) sends.
                next_fence: 1,
            }),
        }
    }

    /// Allocate a fence unique among outstanding requests and register an
    /// entry for it. Fails with `Busy` only if all 65535 fences are in
    /// flight, which indicates a stuck firmware.
    pub fn register(
        &self,
        response_capacity: Option<usize>,
        g2h_reserved: u32,
    ) -> Result<Arc<PendingRequest>> {
        let mut inner = lock_or_recover(&self.inner);

        let mut fence = 0;
        for _ in 0..u16::MAX {
            let candidate = inner.next_fence;
            inner.next_fence = if candidate == u16::MAX {
                1
            } else {
                candidate + 1
            };
            if !inner.entries.contains_key(&candidate) {
                fence = candidate;
                break;
            }
        }
        if fence == 0 {
            return Err(CtError::Busy);
        }

        let entry = Arc::new(PendingRequest {
            fence,
            response_capacity,
            g2h_reserved,
            state: Mutex::new(CompletionState {
                done: false,
                result: None,
            }),
            cond: Condvar::new(),
        });
        inner.entries.insert(fence, Arc::clone(&entry));
        Ok(entry)
    }

    /// Remove an entry, returning it so the caller can complete it or
    /// release its credits. `None` means another path got there first.
    pub fn remove(&self, fence: u16) -> Option<Arc<PendingRequest>> {
        lock_or_recover(&self.inner).entries.remove(&fence)
    }

    /// Resolve every outstanding entry with `err` and empty the table.
    /// Returns the removed entries so the caller can release their G2H
    /// credits.
    pub fn flush_all(&self, err: CtError) -> Vec<Arc<PendingRequest>> {
        let drained: Vec<Arc<PendingRequest>> = {
            let mut inner = lock_or_recover(&self.inner);
            inner.entries.drain().map(|(_, e)| e).collect()
        };
        for entry in &drained {
            entry.complete(Err(err.clone()));
        }
        drained
    }

    /// Broadcast wake: every waiter re-checks its own completion slot.
    pub fn wake_all(&self) {
        let inner = lock_or_recover(&self.inner);
        for entry in inner.entries.values() {
            entry.wake();
        }
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-blocking occupancy probe for atomic snapshot capture.
    pub fn try_len(&self) -> Option<usize> {
        self.inner.try_lock().ok().map(|inner| inner.entries.len())
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fences_unique_while_outstanding() {
        let table = PendingTable::new();
        let a = table.register(None, 0).unwrap();
        let b = table.register(None, 0).unwrap();
        assert_ne!(a.fence(), b.fence());
        assert_ne!(a.fence(), 0);
        assert_ne!(b.fence(), 0);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_fence_allocator_skips_outstanding() {
        let table = PendingTable::new();
        let mut held = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let entry = table.register(None, 0).unwrap();
            assert!(seen.insert(entry.fence()), "fence reused while in flight");
            held.push(entry);
        }
    }

    #[test]
    fn test_complete_wakes_waiter() {
        let table = PendingTable::new();
        let entry = table.register(Some(4), 0).unwrap();
        let waiter = Arc::clone(&entry);

        let handle = thread::spawn(move || waiter.wait(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        entry.complete(Ok(vec![1, 2, 3]));

        let result = handle.join().unwrap().unwrap();
        assert_eq!(result, vec![1, 2, 3]);
    }

    #[test]
    fn test_wait_times_out() {
        let table = PendingTable::new();
        let entry = table.register(None, 0).unwrap();
        let result = entry.wait(Duration::from_millis(30));
        assert!(matches!(result, Err(CtError::Timeout)));
    }

    #[test]
    fn test_duplicate_completion_ignored() {
        let table = PendingTable::new();
        let entry = table.register(None, 0).unwrap();
        entry.complete(Ok(vec![7]));
        entry.complete(Err(CtError::ChannelDisabled));

        // First result wins.
        let result = entry.wait(Duration::from_millis(10)).unwrap();
        assert_eq!(result, vec![7]);
    }

    #[test]
    fn test_broadcast_wake_does_not_resolve() {
        let table = PendingTable::new();
        let entry = table.register(None, 0).unwrap();
        let waiter = Arc::clone(&entry);

        let handle = thread::spawn(move || waiter.wait(Duration::from_millis(200)));
        thread::sleep(Duration::from_millis(20));
        // Coarse wake only: waiter must re-check and keep waiting.
        table.wake_all();
        thread::sleep(Duration::from_millis(20));
        entry.complete(Ok(vec![9]));

        let result = handle.join().unwrap().unwrap();
        assert_eq!(result, vec![9]);
    }

    #[test]
    fn test_flush_all_resolves_everything() {
        let table = PendingTable::new();
        let entries: Vec<_> = (0..5).map(|_| table.register(None, 2).unwrap()).collect();

        let flushed = table.flush_all(CtError::ChannelDisabled);
        assert_eq!(flushed.len(), 5);
        assert!(table.is_empty());

        for entry in entries {
            let result = entry.wait(Duration::from_millis(10));
            assert!(matches!(result, Err(CtError::ChannelDisabled)));
        }
    }

    #[test]
    fn test_remove_is_exactly_once() {
        let table = PendingTable::new();
        let entry = table.register(None, 0).unwrap();
        let fence = entry.fence();
        assert!(table.remove(fence).is_some());
        assert!(table.remove(fence).is_none());
    }
}
