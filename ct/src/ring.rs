//! Ring transport
//!
//! # Purpose
//! Fixed-capacity circular word buffer used for both CT directions. The
//! write side reserves contiguous space and commits whole messages; the read
//! side peeks a header, borrows the payload, and consumes the message.
//!
//! # Invariants
//! - Capacity is a power of two (words). Cursors increase monotonically and
//!   are masked on access; `write - read` never exceeds capacity.
//! - A message never wraps: if the tail cannot hold it contiguously, the
//!   tail is padded with [`WRAP_MARKER`] words and the message starts at
//!   offset 0. Readers skip marker runs.
//! - A full ring is backpressure ([`CtError::NoSpace`]), never an overwrite.

use log::warn;

use crate::msg::{MsgHeader, HEADER_WORDS, WRAP_MARKER};
use crate::{CtError, Result};

/// Which direction a ring carries; used in errors and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingSide {
    H2g,
    G2h,
}

impl core::fmt::Display for RingSide {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RingSide::H2g => f.write_str("H2G"),
            RingSide::G2h => f.write_str("G2H"),
        }
    }
}

/// A single-direction CT ring.
///
/// Both cursors live here because this models the shared-memory buffer
/// itself; in a real deployment one cursor register is owned by firmware.
/// Callers serialize access externally (the channel's send and recv locks).
pub struct CtRing {
    side: RingSide,
    buf: Vec<u32>,
    capacity: u32,
    /// Monotonic write cursor (committed words).
    write: u32,
    /// Monotonic read cursor (consumed words).
    read: u32,
}

impl CtRing {
    /// Allocate a ring. Capacity must be a power of two and large enough
    /// for at least one header.
    pub fn new(side: RingSide, capacity: u32) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() || capacity < 2 * HEADER_WORDS {
            return Err(CtError::Alloc(format!(
                "{side} ring capacity {capacity} is not a usable power of two"
            )));
        }
        Ok(Self {
            side,
            buf: vec![0; capacity as usize],
            capacity,
            write: 0,
            read: 0,
        })
    }

    pub fn side(&self) -> RingSide {
        self.side
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn write_cursor(&self) -> u32 {
        self.write
    }

    pub fn read_cursor(&self) -> u32 {
        self.read
    }

    fn mask(&self) -> u32 {
        self.capacity - 1
    }

    /// Words currently in flight (committed, not yet consumed).
    pub fn used(&self) -> u32 {
        let used = self.write.wrapping_sub(self.read);
        debug_assert!(used <= self.capacity, "{} ring overrun", self.side);
        used
    }

    /// Words available to writers.
    pub fn space(&self) -> u32 {
        self.capacity - self.used()
    }

    pub fn is_empty(&self) -> bool {
        self.used() == 0
    }

    /// Drop all in-flight content and rewind cursors; used when a channel
    /// (re-)enables against a fresh firmware session.
    pub fn reset(&mut self) {
        self.write = 0;
        self.read = 0;
        self.buf.fill(0);
    }

    /// Reserve `n_words` of contiguous space.
    ///
    /// If the tail cannot hold the message, the remaining tail words are
    /// padded with wrap markers (immediately committed; readers skip them)
    /// and the reservation lands at offset 0. Returns the word offset the
    /// caller must pass to [`commit`](Self::commit).
    pub fn reserve(&mut self, n_words: u32) -> Result<u32> {
        // A full-capacity message only fits when the write cursor happens
        // to be ring-aligned; anywhere else it would need tail padding on
        // top of `capacity` words and could never succeed. Rejecting it
        // here keeps retry loops from spinning on an unsatisfiable size.
        if n_words == 0 || n_words >= self.capacity {
            return Err(CtError::Protocol(format!(
                "reservation of {n_words} words on {} ring (capacity {})",
                self.side, self.capacity
            )));
        }

        let tail_room = self.capacity - (self.write & self.mask());
        let needed = if tail_room >= n_words {
            n_words
        } else {
            tail_room + n_words
        };

        if self.space() < needed {
            return Err(CtError::NoSpace {
                ring: self.side,
                needed,
                available: self.space(),
            });
        }

        if tail_room < n_words {
            let start = (self.write & self.mask()) as usize;
            self.buf[start..].fill(WRAP_MARKER);
            self.write = self.write.wrapping_add(tail_room);
            debug_assert_eq!(self.write & self.mask(), 0);
        }

        Ok(self.write & self.mask())
    }

    /// Commit a reserved message. `offset` must be the value returned by the
    /// matching `reserve`, with no interleaved reservation (callers hold the
    /// side's lock across the pair).
    pub fn commit(&mut self, offset: u32, words: &[u32]) {
        debug_assert_eq!(offset, self.write & self.mask(), "commit out of order");
        debug_assert!(words.len() as u32 <= self.capacity - offset);
        let start = offset as usize;
        self.buf[start..start + words.len()].copy_from_slice(words);
        self.write = self.write.wrapping_add(words.len() as u32);
    }

    /// Peek the header of the next unconsumed message, skipping wrap
    /// markers. `Ok(None)` means the ring is empty; a decode failure is a
    /// protocol error the caller handles (log + [`drop_damaged`]).
    ///
    /// [`drop_damaged`]: Self::drop_damaged
    pub fn peek_header(&mut self) -> Result<Option<MsgHeader>> {
        loop {
            let avail = self.used();
            if avail == 0 {
                return Ok(None);
            }

            let idx = (self.read & self.mask()) as usize;
            let w0 = self.buf[idx];
            if w0 == WRAP_MARKER {
                self.read = self.read.wrapping_add(1);
                continue;
            }

            if avail < HEADER_WORDS {
                // Writers commit whole messages; a lone word is torn state.
                return Err(CtError::Protocol(format!(
                    "truncated header on {} ring",
                    self.side
                )));
            }

            let w1 = self.buf[((self.read.wrapping_add(1)) & self.mask()) as usize];
            let hdr = MsgHeader::decode(w0, w1)?;
            if hdr.msg_words() > avail {
                return Err(CtError::Protocol(format!(
                    "{} ring header claims {} words but only {} committed",
                    self.side,
                    hdr.msg_words(),
                    avail
                )));
            }
            return Ok(Some(hdr));
        }
    }

    /// Borrow the payload of the message whose header was just peeked.
    pub fn payload(&self, hdr: &MsgHeader) -> &[u32] {
        self.payload_at(0, hdr)
    }

    /// Borrow the payload of an unconsumed message at `offset` words past
    /// the read cursor (as yielded by [`scan`](Self::scan)). Messages are
    /// contiguous, so no second masking is needed past the start.
    pub fn payload_at(&self, offset: u32, hdr: &MsgHeader) -> &[u32] {
        let start = ((self.read.wrapping_add(offset) & self.mask()) + HEADER_WORDS) as usize;
        &self.buf[start..start + hdr.len as usize]
    }

    /// Rewrite the header flags of an unconsumed message at `offset` words
    /// past the read cursor. Used by the fast path to stamp
    /// [`MsgFlags::HANDLED`](crate::msg::MsgFlags::HANDLED) onto events it
    /// delivered ahead of the dispatch loop.
    pub fn annotate_header(&mut self, offset: u32, hdr: &MsgHeader) {
        let idx = ((self.read.wrapping_add(offset)) & self.mask()) as usize;
        self.buf[idx] = hdr.encode()[0];
    }

    /// Walk all complete, unconsumed messages without consuming them.
    /// Yields `(offset_from_read_cursor, header)` pairs; stops at the first
    /// undecodable header (the dispatch loop owns error recovery).
    pub fn scan(&self) -> Vec<(u32, MsgHeader)> {
        let mut out = Vec::new();
        let mut cursor = self.read;
        loop {
            let avail = self.write.wrapping_sub(cursor);
            if avail < HEADER_WORDS {
                break;
            }
            let idx = (cursor & self.mask()) as usize;
            let w0 = self.buf[idx];
            if w0 == WRAP_MARKER {
                cursor = cursor.wrapping_add(1);
                continue;
            }
            let w1 = self.buf[((cursor.wrapping_add(1)) & self.mask()) as usize];
            let Ok(hdr) = MsgHeader::decode(w0, w1) else {
                break;
            };
            if hdr.msg_words() > avail {
                break;
            }
            out.push((cursor.wrapping_sub(self.read), hdr));
            cursor = cursor.wrapping_add(hdr.msg_words());
        }
        out
    }

    /// Consume the message whose header was just peeked.
    pub fn consume(&mut self, hdr: &MsgHeader) {
        debug_assert!(hdr.msg_words() <= self.used());
        self.read = self.read.wrapping_add(hdr.msg_words());
    }

    /// Best-effort resync after a malformed header: if the length field of
    /// the damaged message is plausible, skip exactly that message;
    /// otherwise drop everything in flight. Keeps the dispatch loop alive
    /// for later traffic.
    pub fn drop_damaged(&mut self) {
        let avail = self.used();
        if avail == 0 {
            return;
        }
        if avail >= HEADER_WORDS {
            let w1 = self.buf[((self.read.wrapping_add(1)) & self.mask()) as usize];
            let claimed = HEADER_WORDS + (w1 >> 16);
            if claimed <= avail {
                warn!(
                    "{} ring: skipping damaged message of {claimed} words",
                    self.side
                );
                self.read = self.read.wrapping_add(claimed);
                return;
            }
        }
        warn!(
            "{} ring: unrecoverable framing damage, dropping {avail} in-flight words",
            self.side
        );
        self.read = self.write;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::MsgFlags;

    fn post(ring: &mut CtRing, action: u32, payload: &[u32], fence: u16) -> Result<()> {
        let hdr = MsgHeader::new(MsgFlags::REQUEST, action, payload.len() as u16, fence);
        let off = ring.reserve(hdr.msg_words())?;
        let mut words = hdr.encode().to_vec();
        words.extend_from_slice(payload);
        ring.commit(off, &words);
        Ok(())
    }

    #[test]
    fn test_post_peek_consume() {
        let mut ring = CtRing::new(RingSide::H2g, 16).unwrap();
        post(&mut ring, 0x10, &[1, 2, 3], 7).unwrap();

        let hdr = ring.peek_header().unwrap().unwrap();
        assert_eq!(hdr.action, 0x10);
        assert_eq!(hdr.fence, 7);
        assert_eq!(ring.payload(&hdr), &[1, 2, 3]);

        ring.consume(&hdr);
        assert!(ring.is_empty());
        assert_eq!(ring.space(), 16);
    }

    #[test]
    fn test_full_ring_is_backpressure() {
        let mut ring = CtRing::new(RingSide::H2g, 16).unwrap();
        // 4-word messages: exactly four fit.
        for i in 0..4 {
            post(&mut ring, i, &[i, i], 0).unwrap();
        }
        assert_eq!(ring.space(), 0);

        let result = post(&mut ring, 99, &[9, 9], 0);
        assert!(matches!(result, Err(CtError::NoSpace { .. })));

        // First message is untouched.
        let hdr = ring.peek_header().unwrap().unwrap();
        assert_eq!(hdr.action, 0);
        assert_eq!(ring.payload(&hdr), &[0, 0]);
    }

    #[test]
    fn test_wrap_marker_padding() {
        let mut ring = CtRing::new(RingSide::G2h, 16).unwrap();
        // 6-word message, then consume it so the next lands near the tail.
        post(&mut ring, 1, &[0; 4], 0).unwrap();
        let hdr = ring.peek_header().unwrap().unwrap();
        ring.consume(&hdr);

        // 6 more words: offsets 6..12. A further 6-word message cannot fit
        // in tail room 4, so reserve pads 4 markers and wraps to 0.
        post(&mut ring, 2, &[0; 4], 0).unwrap();
        post(&mut ring, 3, &[7, 8, 9, 10], 0).unwrap();

        let hdr = ring.peek_header().unwrap().unwrap();
        assert_eq!(hdr.action, 2);
        ring.consume(&hdr);

        // Reader must skip the marker run and find the wrapped message.
        let hdr = ring.peek_header().unwrap().unwrap();
        assert_eq!(hdr.action, 3);
        assert_eq!(ring.payload(&hdr), &[7, 8, 9, 10]);
        ring.consume(&hdr);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_cursor_invariant_across_many_wraps() {
        let mut ring = CtRing::new(RingSide::H2g, 32).unwrap();
        for round in 0..200u32 {
            let payload = [round; 5];
            post(&mut ring, round, &payload, 0).unwrap();
            assert!(ring.used() <= ring.capacity());

            let hdr = ring.peek_header().unwrap().unwrap();
            assert_eq!(hdr.action, round & crate::msg::MAX_ACTION);
            assert_eq!(ring.payload(&hdr), &payload);
            ring.consume(&hdr);
            assert!(ring.used() <= ring.capacity());
        }
    }

    #[test]
    fn test_oversized_reservation_rejected() {
        let mut ring = CtRing::new(RingSide::H2g, 16).unwrap();
        assert!(matches!(ring.reserve(17), Err(CtError::Protocol(_))));
        assert!(matches!(ring.reserve(0), Err(CtError::Protocol(_))));
    }

    #[test]
    fn test_full_capacity_reservation_rejected() {
        let mut ring = CtRing::new(RingSide::G2h, 16).unwrap();
        // Leave the ring empty but the write cursor unaligned; a
        // capacity-sized message could then never fit, so the size is
        // rejected outright rather than surfacing retryable NoSpace.
        post(&mut ring, 1, &[9], 0).unwrap();
        let hdr = ring.peek_header().unwrap().unwrap();
        ring.consume(&hdr);
        assert!(ring.is_empty());

        assert!(matches!(ring.reserve(16), Err(CtError::Protocol(_))));
        // Smaller messages still reserve normally from here.
        assert!(ring.reserve(12).is_ok());
    }

    #[test]
    fn test_bad_capacity_rejected() {
        assert!(matches!(
            CtRing::new(RingSide::H2g, 12),
            Err(CtError::Alloc(_))
        ));
        assert!(matches!(
            CtRing::new(RingSide::H2g, 0),
            Err(CtError::Alloc(_))
        ));
        assert!(matches!(
            CtRing::new(RingSide::H2g, 2),
            Err(CtError::Alloc(_))
        ));
    }

    #[test]
    fn test_drop_damaged_skips_one_message() {
        let mut ring = CtRing::new(RingSide::G2h, 32).unwrap();
        // Raw garbage header with a plausible length field (1 payload word),
        // followed by a valid message.
        let off = ring.reserve(3).unwrap();
        ring.commit(off, &[0x0300_0000, 0x0001_0000, 0xDEAD]);
        post(&mut ring, 0x42, &[5], 0).unwrap();

        assert!(ring.peek_header().is_err());
        ring.drop_damaged();

        let hdr = ring.peek_header().unwrap().unwrap();
        assert_eq!(hdr.action, 0x42);
    }

    #[test]
    fn test_scan_lists_unconsumed_messages() {
        let mut ring = CtRing::new(RingSide::G2h, 32).unwrap();
        post(&mut ring, 1, &[], 0).unwrap();
        post(&mut ring, 2, &[9], 0).unwrap();
        post(&mut ring, 3, &[], 0).unwrap();

        let scanned = ring.scan();
        let actions: Vec<u32> = scanned.iter().map(|(_, h)| h.action).collect();
        assert_eq!(actions, vec![1, 2, 3]);
        // Offsets are cumulative message footprints.
        assert_eq!(scanned[0].0, 0);
        assert_eq!(scanned[1].0, 2);
        assert_eq!(scanned[2].0, 5);
    }

    #[test]
    fn test_reset_rewinds_cursors() {
        let mut ring = CtRing::new(RingSide::H2g, 16).unwrap();
        post(&mut ring, 1, &[1], 0).unwrap();
        ring.reset();
        assert!(ring.is_empty());
        assert_eq!(ring.write_cursor(), 0);
        assert_eq!(ring.read_cursor(), 0);
    }
}
