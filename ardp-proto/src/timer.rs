//! Per-connection timer table.
//!
//! Each connection keeps a small ordered-by-insertion list of timer records.
//! A timer identifies its target by value (a retransmit timer carries the
//! slot's sequence number, a delivery-retry timer the message's start
//! sequence), so nothing dangles when a slot is released out from under a
//! pending timer; the firing code revalidates the target instead.

use crate::types::seq_lt;

/// Retry sentinel: the timer is rescheduled forever and never auto-deleted.
pub(crate) const RETRY_ALWAYS: u16 = u16::MAX;

/// Retransmissions attempted before a message is abandoned.
pub(crate) const RETRANSMIT_RETRY: u16 = 4;

/// Delivery re-attempts before the connection is dropped.
pub(crate) const RECV_RETRY: u16 = 4;

/// Connect timers fire once.
pub(crate) const CONNECT_RETRY: u16 = 0;

/// Disconnect timers fire once.
pub(crate) const DISCONNECT_RETRY: u16 = 0;

/// What a timer does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// Handshake deadline.
    Connect,
    /// CLOSE_WAIT grace period.
    Disconnect,
    /// Retransmission of the send slot holding `seq`.
    Retransmit { seq: u32 },
    /// Delivery retry for the message starting at `som`.
    Recv { som: u32 },
    /// Keep-alive / persist probe.
    WindowCheck,
}

#[derive(Debug, Clone)]
pub(crate) struct Timer {
    pub kind: TimerKind,
    pub delta: u32,
    pub deadline: u32,
    pub retry: u16,
}

/// The timers scheduled on one connection.
#[derive(Debug, Default)]
pub(crate) struct TimerTable {
    timers: Vec<Timer>,
}

impl TimerTable {
    pub fn new() -> Self {
        Self { timers: Vec::new() }
    }

    /// Schedule `kind` to fire `delta` ms from `now`. An existing timer of
    /// the same kind is replaced.
    pub fn arm(&mut self, kind: TimerKind, now: u32, delta: u32, retry: u16) {
        self.cancel(kind);
        self.timers.push(Timer {
            kind,
            delta,
            deadline: now.wrapping_add(delta),
            retry,
        });
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        self.timers.retain(|t| t.kind != kind);
    }

    pub fn cancel_all(&mut self) {
        self.timers.clear();
    }

    pub fn contains(&self, kind: TimerKind) -> bool {
        self.timers.iter().any(|t| t.kind == kind)
    }

    /// Remaining fire count of `kind`, if scheduled.
    pub fn retry_of(&self, kind: TimerKind) -> Option<u16> {
        self.timers.iter().find(|t| t.kind == kind).map(|t| t.retry)
    }

    /// Change the reschedule interval of `kind` (used to switch a retransmit
    /// timer between its base and urgent cadence).
    pub fn set_delta(&mut self, kind: TimerKind, delta: u32) {
        if let Some(t) = self.timers.iter_mut().find(|t| t.kind == kind) {
            t.delta = delta;
        }
    }

    /// Pull `kind`'s deadline forward to `now` (fast retransmit).
    pub fn expedite(&mut self, kind: TimerKind, now: u32) {
        if let Some(t) = self.timers.iter_mut().find(|t| t.kind == kind) {
            t.deadline = now;
        }
    }

    /// Kinds whose deadline has passed, in insertion order. Snapshot taken
    /// before any handler runs, so timers armed while firing wait for the
    /// next pass.
    pub fn due(&self, now: u32) -> Vec<TimerKind> {
        self.timers
            .iter()
            .filter(|t| !seq_lt(now, t.deadline))
            .map(|t| t.kind)
            .collect()
    }

    /// Post-fire bookkeeping for `kind`: reschedule an `ALWAYS` timer,
    /// otherwise burn one retry and delete the timer when none remain.
    ///
    /// No-op when the handler already cancelled the timer.
    pub fn finish_fire(&mut self, kind: TimerKind, now: u32) {
        let Some(pos) = self.timers.iter().position(|t| t.kind == kind) else {
            return;
        };
        let timer = &mut self.timers[pos];
        if timer.retry == RETRY_ALWAYS {
            timer.deadline = now.wrapping_add(timer.delta);
        } else if timer.retry > 0 {
            timer.retry -= 1;
            if timer.retry == 0 {
                self.timers.remove(pos);
            } else {
                timer.deadline = now.wrapping_add(timer.delta);
            }
        } else {
            self.timers.remove(pos);
        }
    }

    /// Earliest scheduled deadline, if any.
    pub fn next_deadline(&self) -> Option<u32> {
        self.timers
            .iter()
            .map(|t| t.deadline)
            .reduce(|a, b| if seq_lt(b, a) { b } else { a })
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}
