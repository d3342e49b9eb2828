//! Receive-side sliding window: a ring of `RCV.MAX` slots.
//!
//! Slots are addressed by sequence number modulo the ring size, relative to
//! the handshake anchor. `first` names the oldest buffered sequence and
//! `last` the newest; the advertised window is the slot count not covered
//! by that span. A slot lives (`in_use`) from arrival until the consumer
//! releases it, and releases always happen in `first`-to-`last` order.

use bytes::Bytes;

use crate::error::{ArdpError, Result};
use crate::events::RcvMessage;
use crate::packet::MIN_SEGMENT_LEN;
use crate::types::seq_lt;

#[derive(Debug, Default)]
pub(crate) struct RecvSlot {
    pub seq: u32,
    pub payload: Bytes,
    pub som: u32,
    pub fcnt: u16,
    pub in_use: bool,
    pub delivered: bool,
    /// Arrived carrying the expired TTL marker; acknowledged but never
    /// handed to the consumer.
    pub expired: bool,
}

#[derive(Debug)]
pub(crate) struct RecvBuffers {
    slots: Vec<RecvSlot>,
    /// Ring origin; slot addressing is relative to it so that indexing
    /// stays contiguous across 32-bit sequence wrap for any ring size.
    anchor: u32,
    /// Largest segment payload we accept (the segbmax we advertised).
    pub max_seg_len: u16,
    pub first: u32,
    pub last: u32,
    pub window: u16,
}

/// Outcome of buffering one data segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StoreOutcome {
    Stored,
    /// Same sequence already buffered; ack again, deliver nothing.
    Duplicate,
}

impl RecvBuffers {
    pub fn init(segmax: u16, segbmax: u16) -> Result<Self> {
        if segmax == 0 {
            return Err(ArdpError::OutOfMemory);
        }
        if (segbmax as u32) < MIN_SEGMENT_LEN {
            return Err(ArdpError::InvalidData);
        }
        let mut slots = Vec::with_capacity(segmax as usize);
        slots.resize_with(segmax as usize, RecvSlot::default);
        Ok(Self {
            slots,
            anchor: 0,
            max_seg_len: segbmax,
            first: 0,
            last: 0,
            window: segmax,
        })
    }

    /// Anchor the ring once the in-order point is known (handshake done).
    pub fn post_init(&mut self, cur: u32) {
        self.first = cur.wrapping_add(1);
        self.last = cur.wrapping_add(1);
        self.anchor = cur.wrapping_add(1);
    }

    pub fn capacity(&self) -> u16 {
        self.slots.len() as u16
    }

    fn index(&self, seq: u32) -> usize {
        (seq.wrapping_sub(self.anchor) % self.slots.len() as u32) as usize
    }

    pub fn slot(&self, seq: u32) -> &RecvSlot {
        &self.slots[self.index(seq)]
    }

    fn slot_mut(&mut self, seq: u32) -> &mut RecvSlot {
        let idx = self.index(seq);
        &mut self.slots[idx]
    }

    /// True when `seq` is buffered in its ring position.
    pub fn has_buffered(&self, seq: u32) -> bool {
        let slot = self.slot(seq);
        slot.in_use && slot.seq == seq
    }

    /// Buffer one segment's payload.
    pub fn store(
        &mut self,
        seq: u32,
        som: u32,
        fcnt: u16,
        expired: bool,
        payload: Bytes,
    ) -> Result<StoreOutcome> {
        if payload.len() > self.max_seg_len as usize {
            return Err(ArdpError::Fail);
        }
        // A full window only admits segments that fill a gap below `last`.
        if self.window == 0 && !seq_lt(seq, self.last) {
            return Err(ArdpError::Fail);
        }

        let slot = self.slot(seq);
        if slot.in_use {
            if slot.seq == seq {
                return Ok(StoreOutcome::Duplicate);
            }
            return Err(ArdpError::Fail);
        }

        if seq_lt(self.last, seq) {
            self.last = seq;
        }
        *self.slot_mut(seq) = RecvSlot {
            seq,
            payload,
            som,
            fcnt,
            in_use: true,
            delivered: false,
            expired,
        };
        self.update_window();
        Ok(StoreOutcome::Stored)
    }

    fn update_window(&mut self) {
        if seq_lt(self.last, self.first) {
            self.window = self.capacity();
            self.last = self.first;
        } else {
            let span = self.last.wrapping_sub(self.first).wrapping_add(1);
            self.window = (self.capacity() as u32).saturating_sub(span) as u16;
        }
    }

    /// Whether delivery may proceed at `seq`: the previous slot must be
    /// either released or already delivered (delivery never leapfrogs a
    /// message the consumer has not taken yet).
    pub fn deliverable_after_prev(&self, seq: u32) -> bool {
        let prev = self.slot(seq.wrapping_sub(1));
        !prev.in_use || prev.delivered
    }

    /// Build the delivery value for the message starting at `som`,
    /// validating that every fragment is present and undelivered.
    pub fn assemble(&self, som: u32, fcnt: u16) -> Option<RcvMessage> {
        let mut fragments = Vec::with_capacity(fcnt.max(1) as usize);
        let mut len = 0usize;
        for i in 0..fcnt.max(1) as u32 {
            let seq = som.wrapping_add(i);
            let slot = self.slot(seq);
            if !slot.in_use
                || slot.delivered
                || slot.seq != seq
                || slot.som != som
                || slot.fcnt != fcnt
            {
                return None;
            }
            len += slot.payload.len();
            fragments.push(slot.payload.clone());
        }
        Some(RcvMessage {
            som,
            fcnt,
            len,
            fragments,
        })
    }

    /// Flag every fragment of the message starting at `som` as delivered.
    pub fn mark_delivered(&mut self, som: u32, fcnt: u16) {
        for i in 0..fcnt.max(1) as u32 {
            let seq = som.wrapping_add(i);
            let slot = self.slot_mut(seq);
            if slot.in_use && slot.som == som {
                slot.delivered = true;
            }
        }
    }

    /// True when any buffered fragment of the message carries the expired
    /// marker (mixed chains happen when reordering races an in-flight
    /// expiry).
    pub fn message_has_expired_fragment(&self, som: u32, fcnt: u16) -> bool {
        (0..fcnt.max(1) as u32).any(|i| {
            let seq = som.wrapping_add(i);
            let slot = self.slot(seq);
            slot.in_use && slot.seq == seq && slot.som == som && slot.expired
        })
    }

    /// An expired fragment invalidates its whole message: siblings already
    /// buffered will never assemble, so flag them for silent release.
    pub fn mark_message_expired(&mut self, som: u32, fcnt: u16) {
        for i in 0..fcnt.max(1) as u32 {
            let seq = som.wrapping_add(i);
            let slot = self.slot_mut(seq);
            if slot.in_use && slot.seq == seq && slot.som == som && !slot.expired {
                slot.expired = true;
                slot.delivered = true;
            }
        }
    }

    /// Release expired slots sitting at the head of the ring so they never
    /// wait on a `recv_ready` the consumer cannot issue. Returns how many
    /// slots were freed.
    pub fn release_expired_head(&mut self) -> u32 {
        let mut released = 0;
        while !seq_lt(self.last, self.first) {
            let head = self.first;
            let slot = self.slot(head);
            if !(slot.in_use && slot.seq == head && slot.delivered && slot.expired) {
                break;
            }
            let slot = self.slot_mut(head);
            slot.in_use = false;
            slot.delivered = false;
            slot.expired = false;
            slot.payload = Bytes::new();
            self.first = self.first.wrapping_add(1);
            released += 1;
        }
        if released > 0 {
            self.update_window();
        }
        released
    }

    /// Release the consumed message's slots. The message must be exactly the
    /// one at the head of the ring; all validation happens before any state
    /// changes.
    pub fn release(&mut self, som: u32, fcnt: u16) -> Result<()> {
        if fcnt == 0 {
            return Err(ArdpError::InvalidData);
        }
        if som != self.first {
            return Err(ArdpError::Fail);
        }
        for i in 0..fcnt as u32 {
            let seq = som.wrapping_add(i);
            let slot = self.slot(seq);
            if !slot.in_use || !slot.delivered || slot.seq != seq || slot.som != som {
                return Err(ArdpError::Fail);
            }
        }

        for i in 0..fcnt as u32 {
            let seq = som.wrapping_add(i);
            let slot = self.slot_mut(seq);
            slot.in_use = false;
            slot.delivered = false;
            slot.expired = false;
            slot.payload = Bytes::new();
            self.first = self.first.wrapping_add(1);
        }
        self.update_window();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(segmax: u16) -> RecvBuffers {
        let mut buf = RecvBuffers::init(segmax, 1024).unwrap();
        buf.post_init(99); // first in-order sequence will be 100
        buf
    }

    fn store(buf: &mut RecvBuffers, seq: u32, data: &'static [u8]) -> Result<StoreOutcome> {
        buf.store(seq, seq, 1, false, Bytes::from_static(data))
    }

    // ========================================================================
    // Window accounting
    // ========================================================================

    #[test]
    fn test_store_shrinks_window() {
        let mut buf = ring(4);
        assert_eq!(buf.window, 4);

        store(&mut buf, 100, b"a").unwrap();
        assert_eq!(buf.window, 3);

        store(&mut buf, 101, b"b").unwrap();
        assert_eq!(buf.window, 2);
    }

    #[test]
    fn test_out_of_order_store_counts_span_not_slots() {
        let mut buf = ring(4);
        store(&mut buf, 102, b"c").unwrap();
        // Span covers 100..=102 even though 100 and 101 are missing.
        assert_eq!(buf.window, 1);
    }

    #[test]
    fn test_release_restores_window_and_empties() {
        let mut buf = ring(4);
        store(&mut buf, 100, b"a").unwrap();
        buf.mark_delivered(100, 1);

        buf.release(100, 1).unwrap();
        assert_eq!(buf.window, 4);
        assert_eq!(buf.first, 101);
        assert_eq!(buf.last, 101);
    }

    #[test]
    fn test_window_invariant_holds_when_nonempty() {
        let mut buf = ring(8);
        for seq in [100u32, 101, 104] {
            store(&mut buf, seq, b"x").unwrap();
        }
        let span = buf.last.wrapping_sub(buf.first).wrapping_add(1);
        assert_eq!(buf.window as u32 + span, 8);
    }

    // ========================================================================
    // Store rejection
    // ========================================================================

    #[test]
    fn test_full_window_rejects_beyond_last_but_fills_gaps() {
        let mut buf = ring(2);
        store(&mut buf, 100, b"a").unwrap();
        store(&mut buf, 101, b"b").unwrap();
        assert_eq!(buf.window, 0);

        // Beyond `last` is refused outright.
        assert_eq!(store(&mut buf, 102, b"c"), Err(ArdpError::Fail));
    }

    #[test]
    fn test_gap_fill_allowed_at_zero_window() {
        let mut buf = ring(2);
        store(&mut buf, 101, b"b").unwrap();
        assert_eq!(buf.window, 0);

        // 100 lies inside [first, last): allowed despite the closed window.
        assert_eq!(store(&mut buf, 100, b"a"), Ok(StoreOutcome::Stored));
    }

    #[test]
    fn test_duplicate_store_reports_duplicate() {
        let mut buf = ring(4);
        store(&mut buf, 100, b"a").unwrap();
        assert_eq!(store(&mut buf, 100, b"a"), Ok(StoreOutcome::Duplicate));
        assert_eq!(buf.window, 3);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut buf = RecvBuffers::init(4, 128).unwrap();
        buf.post_init(99);
        let payload = Bytes::from(vec![0u8; 129]);
        assert_eq!(
            buf.store(100, 100, 1, false, payload),
            Err(ArdpError::Fail)
        );
    }

    // ========================================================================
    // Release discipline
    // ========================================================================

    #[test]
    fn test_release_requires_head() {
        let mut buf = ring(4);
        store(&mut buf, 100, b"a").unwrap();
        store(&mut buf, 101, b"b").unwrap();
        buf.mark_delivered(100, 1);
        buf.mark_delivered(101, 1);

        assert_eq!(buf.release(101, 1), Err(ArdpError::Fail));
        buf.release(100, 1).unwrap();
        buf.release(101, 1).unwrap();
    }

    #[test]
    fn test_release_of_released_buffer_rejected_without_corruption() {
        let mut buf = ring(4);
        store(&mut buf, 100, b"a").unwrap();
        buf.mark_delivered(100, 1);
        buf.release(100, 1).unwrap();

        let first = buf.first;
        let window = buf.window;
        assert_eq!(buf.release(100, 1), Err(ArdpError::Fail));
        assert_eq!(buf.first, first);
        assert_eq!(buf.window, window);
    }

    #[test]
    fn test_release_undelivered_rejected() {
        let mut buf = ring(4);
        store(&mut buf, 100, b"a").unwrap();
        assert_eq!(buf.release(100, 1), Err(ArdpError::Fail));
    }

    #[test]
    fn test_release_zero_fcnt_rejected() {
        let mut buf = ring(4);
        assert_eq!(buf.release(100, 0), Err(ArdpError::InvalidData));
    }

    // ========================================================================
    // Assembly
    // ========================================================================

    #[test]
    fn test_assemble_fragment_chain() {
        let mut buf = ring(8);
        for i in 0..3u32 {
            buf.store(100 + i, 100, 3, false, Bytes::from_static(b"ab"))
                .unwrap();
        }

        let msg = buf.assemble(100, 3).unwrap();
        assert_eq!(msg.len, 6);
        assert_eq!(msg.fcnt, 3);
        assert_eq!(msg.fragments.len(), 3);
    }

    #[test]
    fn test_assemble_fails_on_gap_or_mismatch() {
        let mut buf = ring(8);
        buf.store(100, 100, 3, false, Bytes::from_static(b"ab"))
            .unwrap();
        buf.store(102, 100, 3, false, Bytes::from_static(b"ef"))
            .unwrap();
        assert!(buf.assemble(100, 3).is_none());
    }

    // ========================================================================
    // Expired segments
    // ========================================================================

    #[test]
    fn test_expired_head_released_silently() {
        let mut buf = ring(4);
        buf.store(100, 100, 1, true, Bytes::from_static(b"a"))
            .unwrap();
        buf.mark_delivered(100, 1);

        assert_eq!(buf.release_expired_head(), 1);
        assert_eq!(buf.first, 101);
        assert_eq!(buf.window, 4);
    }

    #[test]
    fn test_expired_release_stops_at_live_message() {
        let mut buf = ring(4);
        store(&mut buf, 100, b"a").unwrap(); // live, undelivered
        buf.store(101, 101, 1, true, Bytes::from_static(b"b"))
            .unwrap();
        buf.mark_delivered(101, 1);

        // Head is a live message; the expired one behind it must wait.
        assert_eq!(buf.release_expired_head(), 0);
    }

    #[test]
    fn test_mark_message_expired_flags_buffered_siblings() {
        let mut buf = ring(8);
        buf.store(100, 100, 3, false, Bytes::from_static(b"ab"))
            .unwrap();
        buf.store(101, 100, 3, false, Bytes::from_static(b"cd"))
            .unwrap();

        buf.mark_message_expired(100, 3);
        assert!(buf.slot(100).expired);
        assert!(buf.slot(100).delivered);
        assert!(buf.slot(101).expired);
    }
}
