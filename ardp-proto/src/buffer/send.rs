//! Send-side sliding window: a ring of `SND.MAX` slots.
//!
//! A slot holds one outbound segment: the fragment's payload view, a handle
//! on the whole user message (so completion and failure can return the
//! original buffer without back-pointers), fragmentation coordinates, and
//! the TTL clock. Slots are addressed by sequence number modulo the ring
//! size, relative to the ring's first sequence; a slot is live only while
//! `in_use` is set.

use bytes::Bytes;

use crate::buffer::eack;
use crate::error::{ArdpError, Result};
use crate::packet::{IP_UDP_OVERHEAD, MIN_SEGMENT_LEN};
use crate::timer::{TimerKind, TimerTable};
use crate::types::seq_le;

#[derive(Debug, Default, PartialEq)]
pub(crate) struct SendSlot {
    pub seq: u32,
    /// This fragment's payload (a zero-copy slice of `message`).
    pub payload: Bytes,
    /// The whole user message this fragment belongs to.
    pub message: Bytes,
    pub som: u32,
    pub fcnt: u16,
    /// Message TTL in ms; 0 = infinite.
    pub ttl: u32,
    /// Timestamp of the send() call that staged the message.
    pub t_start: u32,
    /// Set once the segment reached the socket at least once.
    pub on_the_wire: bool,
    /// Set when the segment was retransmitted carrying the expired marker.
    pub expired: bool,
    pub in_use: bool,
}

/// Completion to report through `on_send_done`.
#[derive(Debug)]
pub(crate) struct SendCompletion {
    pub message: Bytes,
    pub len: usize,
    pub expired: bool,
}

#[derive(Debug, PartialEq)]
pub(crate) struct SendBuffers {
    slots: Vec<SendSlot>,
    /// Ring origin; slot addressing is relative to it so that indexing
    /// stays contiguous across 32-bit sequence wrap for any ring size.
    anchor: u32,
    /// Largest payload that fits one segment at the peer.
    pub max_dlen: usize,
    /// Count of slots with `in_use` set.
    pub pending: u16,
}

impl SendBuffers {
    /// Build the ring from the peer's advertised parameters. `snd_hdr_len`
    /// is our full send header length (fixed part plus our EACK words);
    /// `anchor` is the first sequence the ring will carry.
    pub fn init(snd_max: u16, peer_segbmax: u16, snd_hdr_len: usize, anchor: u32) -> Result<Self> {
        if snd_max == 0 {
            return Err(ArdpError::OutOfMemory);
        }
        if (peer_segbmax as u32) < MIN_SEGMENT_LEN {
            return Err(ArdpError::InvalidData);
        }
        let overhead = IP_UDP_OVERHEAD as usize + snd_hdr_len;
        if (peer_segbmax as usize) <= overhead {
            return Err(ArdpError::Fail);
        }

        let mut slots = Vec::with_capacity(snd_max as usize);
        slots.resize_with(snd_max as usize, SendSlot::default);
        Ok(Self {
            slots,
            anchor,
            max_dlen: peer_segbmax as usize - overhead,
            pending: 0,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    fn index(&self, seq: u32) -> usize {
        (seq.wrapping_sub(self.anchor) % self.slots.len() as u32) as usize
    }

    pub fn slot(&self, seq: u32) -> &SendSlot {
        &self.slots[self.index(seq)]
    }

    pub fn slot_mut(&mut self, seq: u32) -> &mut SendSlot {
        let idx = self.index(seq);
        &mut self.slots[idx]
    }

    /// Write a fragment into its slot without consuming window space yet.
    #[allow(clippy::too_many_arguments)]
    pub fn stage(
        &mut self,
        seq: u32,
        som: u32,
        fcnt: u16,
        payload: Bytes,
        message: Bytes,
        ttl: u32,
        now: u32,
    ) {
        let slot = self.slot_mut(seq);
        debug_assert!(!slot.in_use, "staging into a live slot");
        *slot = SendSlot {
            seq,
            payload,
            message,
            som,
            fcnt,
            ttl,
            t_start: now,
            on_the_wire: false,
            expired: false,
            in_use: false,
        };
    }

    /// Consume the window slot staged for `seq`.
    pub fn commit(&mut self, seq: u32) {
        let slot = self.slot_mut(seq);
        debug_assert!(!slot.in_use);
        slot.in_use = true;
        self.pending += 1;
    }

    /// Release every slot cumulatively confirmed by `ack`, cancelling its
    /// retransmit timer. Returns one completion per finished user message:
    /// immediately for unfragmented slots, at the last fragment otherwise.
    pub fn flush_acked(&mut self, ack: u32, timers: &mut TimerTable) -> Vec<SendCompletion> {
        let mut done = Vec::new();
        let capacity = self.slots.len();

        for idx in 0..capacity {
            let (seq, fcnt, som, expired) = {
                let slot = &self.slots[idx];
                if !slot.in_use || !seq_le(slot.seq, ack) {
                    continue;
                }
                (slot.seq, slot.fcnt, slot.som, slot.expired)
            };

            timers.cancel(TimerKind::Retransmit { seq });
            self.slots[idx].in_use = false;
            self.pending -= 1;

            if fcnt <= 1 {
                let slot = &self.slots[idx];
                done.push(SendCompletion {
                    message: slot.message.clone(),
                    len: slot.message.len(),
                    expired,
                });
            } else if seq == som.wrapping_add(fcnt as u32 - 1) {
                // Last fragment closes out the whole message.
                let slot = &self.slots[idx];
                done.push(SendCompletion {
                    message: slot.message.clone(),
                    len: slot.message.len(),
                    expired,
                });
            } else if expired {
                // Let the final fragment carry the expiry verdict for the
                // message as a whole.
                let last = self.index(som.wrapping_add(fcnt as u32 - 1));
                if self.slots[last].in_use && self.slots[last].som == som {
                    self.slots[last].expired = true;
                }
            }
        }
        done
    }

    /// Process a selective-ack mask whose first bit names `una + 1`:
    /// expedite the retransmission of the gap slot (`una`) and cancel the
    /// retransmit timers of every selectively confirmed slot.
    pub fn cancel_eacked(&mut self, una: u32, mask: &[u32], timers: &mut TimerTable, now: u32) {
        timers.expedite(TimerKind::Retransmit { seq: una }, now);

        for bit in eack::set_bits(mask) {
            let seq = una.wrapping_add(1).wrapping_add(bit as u32);
            timers.cancel(TimerKind::Retransmit { seq });
        }
    }

    /// Give up on the message owning `trigger_seq`: release all of its
    /// fragments and their timers, returning the failure completion.
    pub fn abandon_message(&mut self, trigger_seq: u32, timers: &mut TimerTable) -> SendCompletion {
        let (som, fcnt, message) = {
            let slot = self.slot(trigger_seq);
            (slot.som, slot.fcnt, slot.message.clone())
        };

        for i in 0..fcnt.max(1) as u32 {
            let seq = som.wrapping_add(i);
            timers.cancel(TimerKind::Retransmit { seq });
            let idx = self.index(seq);
            let slot = &mut self.slots[idx];
            if slot.in_use && slot.som == som {
                slot.in_use = false;
                self.pending -= 1;
            }
        }

        let len = message.len();
        SendCompletion {
            message,
            len,
            expired: false,
        }
    }

    /// Release every live slot, reporting one failure completion per
    /// distinct pending message. Used when the connection is destroyed.
    pub fn fail_all_pending(&mut self, timers: &mut TimerTable) -> Vec<SendCompletion> {
        let mut seen: Vec<u32> = Vec::new();
        let mut failed = Vec::new();

        for idx in 0..self.slots.len() {
            if !self.slots[idx].in_use {
                continue;
            }
            let (seq, som) = (self.slots[idx].seq, self.slots[idx].som);
            timers.cancel(TimerKind::Retransmit { seq });
            self.slots[idx].in_use = false;
            self.pending -= 1;

            if !seen.contains(&som) {
                seen.push(som);
                let message = self.slots[idx].message.clone();
                let len = message.len();
                failed.push(SendCompletion {
                    message,
                    len,
                    expired: false,
                });
            }
        }
        failed
    }

    /// True when `seq` may be staged without clobbering a live slot.
    #[cfg(test)]
    pub fn slot_free(&self, seq: u32) -> bool {
        !self.slot(seq).in_use
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::RETRANSMIT_RETRY;

    fn ring(snd_max: u16) -> SendBuffers {
        // segbmax 1000, header 30 bytes -> max_dlen = 1000 - 28 - 30 = 942
        SendBuffers::init(snd_max, 1000, 30, 0).unwrap()
    }

    fn stage_commit(buf: &mut SendBuffers, seq: u32, som: u32, fcnt: u16, data: &'static [u8]) {
        buf.stage(
            seq,
            som,
            fcnt,
            Bytes::from_static(data),
            Bytes::from_static(data),
            0,
            0,
        );
        buf.commit(seq);
    }

    // ========================================================================
    // Sizing
    // ========================================================================

    #[test]
    fn test_init_computes_max_dlen() {
        let buf = ring(4);
        assert_eq!(buf.max_dlen, 942);
        assert_eq!(buf.capacity(), 4);
    }

    #[test]
    fn test_init_rejects_tiny_segment() {
        assert_eq!(
            SendBuffers::init(4, 100, 30, 0),
            Err(ArdpError::InvalidData)
        );
        assert_eq!(SendBuffers::init(0, 1000, 30, 0), Err(ArdpError::OutOfMemory));
    }

    #[test]
    fn test_init_rejects_segment_smaller_than_overhead() {
        // 120 >= MIN_SEGMENT_LEN but smaller than 28 + 100 bytes of header.
        assert_eq!(SendBuffers::init(4, 120, 100, 0), Err(ArdpError::Fail));
    }

    // ========================================================================
    // Cumulative flush
    // ========================================================================

    #[test]
    fn test_flush_acked_releases_and_completes() {
        let mut buf = ring(4);
        let mut timers = TimerTable::new();
        for seq in 10..13u32 {
            stage_commit(&mut buf, seq, seq, 1, b"x");
            timers.arm(TimerKind::Retransmit { seq }, 0, 500, RETRANSMIT_RETRY);
        }
        assert_eq!(buf.pending, 3);

        let done = buf.flush_acked(11, &mut timers);
        assert_eq!(done.len(), 2);
        assert_eq!(buf.pending, 1);
        assert!(!timers.contains(TimerKind::Retransmit { seq: 10 }));
        assert!(!timers.contains(TimerKind::Retransmit { seq: 11 }));
        assert!(timers.contains(TimerKind::Retransmit { seq: 12 }));
    }

    #[test]
    fn test_flush_acked_fragmented_completes_once_on_last() {
        let mut buf = ring(8);
        let mut timers = TimerTable::new();
        let message = Bytes::from_static(b"abcdefgh");
        for i in 0..4u32 {
            buf.stage(
                20 + i,
                20,
                4,
                message.slice((i as usize * 2)..(i as usize * 2 + 2)),
                message.clone(),
                0,
                0,
            );
            buf.commit(20 + i);
        }

        // Ack of the first three fragments completes nothing.
        assert!(buf.flush_acked(22, &mut timers).is_empty());
        // Ack covering the last fragment completes the message, full length.
        let done = buf.flush_acked(23, &mut timers);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].len, 8);
        assert_eq!(&done[0].message[..], b"abcdefgh");
        assert_eq!(buf.pending, 0);
    }

    #[test]
    fn test_flush_acked_wrap_aware() {
        let mut buf = ring(4);
        let mut timers = TimerTable::new();
        stage_commit(&mut buf, 0xFFFF_FFFE, 0xFFFF_FFFE, 1, b"a");
        stage_commit(&mut buf, 0xFFFF_FFFF, 0xFFFF_FFFF, 1, b"b");
        stage_commit(&mut buf, 0, 0, 1, b"c");

        let done = buf.flush_acked(0, &mut timers);
        assert_eq!(done.len(), 3);
        assert_eq!(buf.pending, 0);
    }

    // ========================================================================
    // Selective ack
    // ========================================================================

    #[test]
    fn test_cancel_eacked_expedites_gap_and_cancels_confirmed() {
        let mut buf = ring(8);
        let mut timers = TimerTable::new();
        for seq in 100..105u32 {
            stage_commit(&mut buf, seq, seq, 1, b"x");
            timers.arm(TimerKind::Retransmit { seq }, 0, 500, RETRANSMIT_RETRY);
        }

        // Peer holds 102 and 104: bits 1 and 3 relative to una+1 = 101.
        let mask = [0b0101u32 << 28];
        buf.cancel_eacked(100, &mask, &mut timers, 40);

        assert_eq!(timers.due(40), vec![TimerKind::Retransmit { seq: 100 }]);
        assert!(timers.contains(TimerKind::Retransmit { seq: 101 }));
        assert!(!timers.contains(TimerKind::Retransmit { seq: 102 }));
        assert!(timers.contains(TimerKind::Retransmit { seq: 103 }));
        assert!(!timers.contains(TimerKind::Retransmit { seq: 104 }));
    }

    // ========================================================================
    // Abandon / teardown
    // ========================================================================

    #[test]
    fn test_abandon_message_clears_all_fragments() {
        let mut buf = ring(8);
        let mut timers = TimerTable::new();
        let message = Bytes::from_static(b"abcdef");
        for i in 0..3u32 {
            buf.stage(
                50 + i,
                50,
                3,
                message.slice((i as usize * 2)..(i as usize * 2 + 2)),
                message.clone(),
                0,
                0,
            );
            buf.commit(50 + i);
            timers.arm(
                TimerKind::Retransmit { seq: 50 + i },
                0,
                500,
                RETRANSMIT_RETRY,
            );
        }

        let completion = buf.abandon_message(51, &mut timers);
        assert_eq!(completion.len, 6);
        assert_eq!(buf.pending, 0);
        for i in 0..3u32 {
            assert!(!timers.contains(TimerKind::Retransmit { seq: 50 + i }));
        }
    }

    #[test]
    fn test_fail_all_pending_one_completion_per_message() {
        let mut buf = ring(8);
        let mut timers = TimerTable::new();
        // One unfragmented message plus one 3-fragment message.
        stage_commit(&mut buf, 10, 10, 1, b"solo");
        let message = Bytes::from_static(b"abcdef");
        for i in 0..3u32 {
            buf.stage(
                11 + i,
                11,
                3,
                message.slice((i as usize * 2)..(i as usize * 2 + 2)),
                message.clone(),
                0,
                0,
            );
            buf.commit(11 + i);
        }

        let failed = buf.fail_all_pending(&mut timers);
        assert_eq!(failed.len(), 2);
        assert_eq!(buf.pending, 0);
    }

    #[test]
    fn test_window_accounting_pending_tracks_in_use() {
        let mut buf = ring(4);
        let mut timers = TimerTable::new();
        for seq in 0..4u32 {
            stage_commit(&mut buf, seq, seq, 1, b"x");
        }
        assert_eq!(buf.pending, 4);
        assert!(!buf.slot_free(0));

        buf.flush_acked(1, &mut timers);
        assert_eq!(buf.pending, 2);
        assert!(buf.slot_free(0));
        assert!(buf.slot_free(1));
    }
}
