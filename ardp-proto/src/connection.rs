//! Per-connection record and the six-state protocol machine.
//!
//! A [`Connection`] is pure bookkeeping plus transitions: segments and timer
//! expirations come in through [`Connection::process`] and
//! [`Connection::process_timers`] with the environment (config, socket,
//! handler, time, scratch buffer) passed in a [`Ctx`], and every outbound
//! datagram or user callback happens through that context. The engine owns
//! the records and decides when a `defunct` record is removed.

use bytes::{Bytes, BytesMut};
use std::net::IpAddr;
use tracing::{debug, error, trace, warn};

use crate::buffer::eack::EackMask;
use crate::buffer::recv::{RecvBuffers, StoreOutcome};
use crate::buffer::send::SendBuffers;
use crate::config::ArdpConfig;
use crate::error::{ArdpError, Result};
use crate::events::ArdpHandler;
use crate::packet::header::{Header, Segment, SynSegment};
use crate::packet::{flags, mask_words_for, OPT_SDM, TTL_EXPIRED, TTL_MAX};
use crate::socket::DatagramSocket;
use crate::timer::{
    TimerKind, TimerTable, CONNECT_RETRY, DISCONNECT_RETRY, RECV_RETRY, RETRANSMIT_RETRY,
    RETRY_ALWAYS,
};
use crate::types::{in_window, seq_lt, ConnId};

/// Connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Open,
    CloseWait,
}

/// Send-side sequence state.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SndState {
    /// Initial send sequence, carried in our SYN.
    pub iss: u32,
    /// Next sequence to send.
    pub nxt: u32,
    /// Oldest unacknowledged sequence.
    pub una: u32,
    /// Peer-advertised window capacity (their segmax).
    pub max: u32,
}

/// Receive-side sequence state.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RcvState {
    /// Peer's initial sequence, from their SYN.
    pub irs: u32,
    /// Last sequence received correctly and in order.
    pub cur: u32,
    /// Our window capacity (the segmax we advertised).
    pub max: u32,
}

/// A parsed inbound datagram handed to the state machine.
#[derive(Debug)]
pub(crate) enum Inbound {
    Syn(SynSegment, Bytes),
    Seg(Segment),
}

/// Environment for one processing step.
pub(crate) struct Ctx<'a, S: DatagramSocket, H: ArdpHandler> {
    pub cfg: &'a ArdpConfig,
    pub socket: &'a mut S,
    pub handler: &'a mut H,
    pub now: u32,
    pub scratch: &'a mut BytesMut,
}

pub(crate) struct Connection {
    pub id: ConnId,
    pub state: State,
    pub passive: bool,
    pub local: u16,
    pub foreign: u16,
    pub peer_addr: IpAddr,
    pub peer_port: u16,
    pub snd: SndState,
    pub rcv: RcvState,
    /// Send ring; present once the peer's parameters are known.
    pub sbuf: Option<SendBuffers>,
    /// Receive ring; present once our parameters are chosen.
    pub rbuf: Option<RecvBuffers>,
    /// Out-of-order tracking, sized with the receive ring.
    pub mask: Option<EackMask>,
    pub timers: TimerTable,
    /// Peer's advertised receive window, updated by every segment.
    pub window: u16,
    /// Smallest peer window that can carry a maximum-size message.
    pub min_send_window: u16,
    /// Our full header length (fixed part + our EACK words).
    pub snd_hdr_len: usize,
    /// Header length we expect on inbound segments.
    pub rcv_hdr_len: usize,
    /// Peer's advertised segment size, pending send-ring setup.
    pub peer_segbmax: u16,
    pub last_seen: u32,
    pub context: u64,
    /// Set when the record should be removed by the engine.
    pub defunct: bool,
    connect_notified: bool,
    disconnect_notified: bool,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ConnId,
        local: u16,
        foreign: u16,
        peer_addr: IpAddr,
        peer_port: u16,
        iss: u32,
        now: u32,
    ) -> Self {
        Self {
            id,
            state: State::Closed,
            passive: false,
            local,
            foreign,
            peer_addr,
            peer_port,
            snd: SndState {
                iss,
                nxt: iss.wrapping_add(1),
                una: iss,
                max: 0,
            },
            rcv: RcvState {
                irs: 0,
                cur: 0,
                max: 0,
            },
            sbuf: None,
            rbuf: None,
            mask: None,
            timers: TimerTable::new(),
            window: 0,
            min_send_window: 0,
            snd_hdr_len: crate::packet::FIXED_HEADER_LEN,
            rcv_hdr_len: crate::packet::FIXED_HEADER_LEN,
            peer_segbmax: 0,
            last_seen: now,
            context: 0,
            defunct: false,
            connect_notified: false,
            disconnect_notified: false,
        }
    }

    fn set_state(&mut self, state: State) {
        trace!(conn = %self.id, from = ?self.state, to = ?state, "state transition");
        self.state = state;
    }

    // ------------------------------------------------------------------
    // Ring setup
    // ------------------------------------------------------------------

    /// Build the receive ring and EACK mask from our own parameters; also
    /// fixes our send header length, which carries our mask words.
    pub fn init_rcv(&mut self, segmax: u16, segbmax: u16) -> Result<()> {
        self.rbuf = Some(RecvBuffers::init(segmax, segbmax)?);
        self.mask = Some(EackMask::new(segmax));
        self.rcv.max = segmax as u32;
        self.snd_hdr_len = Header::len_with_mask(mask_words_for(segmax));
        Ok(())
    }

    /// Build the send ring once the peer's segmax/segbmax are known.
    fn init_sbuf(&mut self, cfg: &ArdpConfig) -> Result<()> {
        let sbuf = SendBuffers::init(
            self.snd.max as u16,
            self.peer_segbmax,
            self.snd_hdr_len,
            self.snd.nxt,
        )?;
        self.min_send_window =
            ((cfg.max_message_len as usize + sbuf.max_dlen - 1) / sbuf.max_dlen) as u16;
        debug!(
            conn = %self.id,
            max_dlen = sbuf.max_dlen,
            min_send_window = self.min_send_window,
            "send ring ready"
        );
        self.sbuf = Some(sbuf);
        Ok(())
    }

    /// Record the peer's handshake parameters from a SYN.
    fn absorb_syn_params(&mut self, syn: &SynSegment) {
        self.snd.max = syn.segmax as u32;
        self.window = syn.segmax;
        self.peer_segbmax = syn.segbmax;
        let remote_words = mask_words_for(syn.segmax);
        self.rcv_hdr_len = Header::len_with_mask(remote_words);
        self.rcv.cur = syn.seq;
        self.rcv.irs = syn.seq;
        self.foreign = syn.src;
    }

    fn rbuf_mut(&mut self) -> Result<&mut RecvBuffers> {
        self.rbuf.as_mut().ok_or(ArdpError::InvalidState)
    }

    fn sbuf_mut(&mut self) -> Result<&mut SendBuffers> {
        self.sbuf.as_mut().ok_or(ArdpError::InvalidState)
    }

    fn rcv_window(&self) -> u16 {
        self.rbuf.as_ref().map_or(0, |r| r.window)
    }

    // ------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------

    /// Emit a zero-payload control segment (ACK, NUL, RST combinations).
    /// The current EACK mask rides along whenever it is non-empty.
    fn send_control<S: DatagramSocket, H: ArdpHandler>(
        &mut self,
        ctx: &mut Ctx<'_, S, H>,
        flag_bits: u8,
        seq: u32,
        ack: u32,
        window: u16,
    ) -> Result<()> {
        let mut flag_bits = flag_bits;
        let words: &[u32] = match &self.mask {
            Some(mask) => {
                if !mask.is_empty() {
                    flag_bits |= flags::EACK;
                }
                mask.words()
            }
            None => &[],
        };
        let hdr = Header {
            flags: flag_bits,
            src: self.local,
            dst: self.foreign,
            dlen: 0,
            seq,
            ack,
            window,
            ttl: 0,
            som: 0,
            fcnt: 0,
        };
        ctx.scratch.clear();
        hdr.encode(ctx.scratch, words);
        trace!(conn = %self.id, flags = flag_bits, seq, ack, window, "send control");
        ctx.socket
            .send_to(self.peer_addr, self.peer_port, ctx.scratch)
            .map(|_| ())
    }

    /// Emit our SYN or SYN+ACK, arming the connect timer.
    fn send_syn<S: DatagramSocket, H: ArdpHandler>(
        &mut self,
        ctx: &mut Ctx<'_, S, H>,
        synack: bool,
        data: &Bytes,
    ) -> Result<()> {
        let rbuf = self.rbuf.as_ref().ok_or(ArdpError::InvalidState)?;
        let syn = SynSegment {
            flags: if synack {
                flags::SYN | flags::ACK | flags::VER
            } else {
                flags::SYN | flags::VER
            },
            src: self.local,
            dst: self.foreign,
            dlen: data.len() as u16,
            seq: self.snd.iss,
            ack: if synack { self.rcv.cur } else { 0 },
            segmax: self.rcv.max as u16,
            segbmax: rbuf.max_seg_len,
            options: OPT_SDM,
        };

        self.timers.arm(
            TimerKind::Connect,
            ctx.now,
            ctx.cfg.connect_timeout_ms,
            CONNECT_RETRY,
        );

        ctx.scratch.clear();
        syn.encode(ctx.scratch);
        ctx.scratch.extend_from_slice(data);
        debug!(conn = %self.id, synack, seq = syn.seq, segmax = syn.segmax, segbmax = syn.segbmax, "send SYN");
        ctx.socket
            .send_to(self.peer_addr, self.peer_port, ctx.scratch)
            .map(|_| ())
    }

    /// Emit the data segment held in the send slot for `seq`, refreshing its
    /// ack/window fields and applying the TTL rules: a staged-but-uncommitted
    /// segment that already expired is dropped silently; a committed segment
    /// that expired goes out carrying the expired marker so the peer can
    /// acknowledge and discard it.
    fn transmit_slot<S: DatagramSocket, H: ArdpHandler>(
        &mut self,
        ctx: &mut Ctx<'_, S, H>,
        seq: u32,
    ) -> Result<()> {
        let ack = self.rcv.cur;
        let window = self.rcv_window();
        let local = self.local;
        let foreign = self.foreign;
        let peer_addr = self.peer_addr;
        let peer_port = self.peer_port;

        let (mask_words, mask_live): (Vec<u32>, bool) = match &self.mask {
            Some(mask) => (mask.words().to_vec(), !mask.is_empty()),
            None => (Vec::new(), false),
        };

        let sbuf = self.sbuf.as_mut().ok_or(ArdpError::InvalidState)?;
        let slot = sbuf.slot_mut(seq);

        let wire_ttl: u16 = if slot.ttl == 0 {
            0
        } else {
            let elapsed = ctx.now.wrapping_sub(slot.t_start);
            if elapsed >= slot.ttl {
                if !slot.in_use {
                    debug!(seq, ttl = slot.ttl, elapsed, "message expired before first transmission");
                    return Err(ArdpError::TtlExpired);
                }
                slot.expired = true;
                TTL_EXPIRED
            } else {
                (slot.ttl - elapsed).min(TTL_MAX as u32) as u16
            }
        };

        let mut flag_bits = flags::ACK | flags::VER;
        if slot.fcnt > 1 {
            flag_bits |= flags::FRAG;
        }
        if mask_live {
            flag_bits |= flags::EACK;
        }

        let hdr = Header {
            flags: flag_bits,
            src: local,
            dst: foreign,
            dlen: slot.payload.len() as u16,
            seq: slot.seq,
            ack,
            window,
            ttl: wire_ttl,
            som: slot.som,
            fcnt: slot.fcnt,
        };
        ctx.scratch.clear();
        hdr.encode(ctx.scratch, &mask_words);
        ctx.scratch.extend_from_slice(&slot.payload);
        trace!(seq, dlen = slot.payload.len(), ttl = wire_ttl, "send data");

        match ctx.socket.send_to(peer_addr, peer_port, ctx.scratch) {
            Ok(_) => {
                slot.on_the_wire = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Public operations (driven by the engine)
    // ------------------------------------------------------------------

    /// Active open: initialize the receive side and fire off the SYN.
    pub fn start_connect<S: DatagramSocket, H: ArdpHandler>(
        &mut self,
        ctx: &mut Ctx<'_, S, H>,
        segmax: u16,
        segbmax: u16,
        data: Bytes,
    ) -> Result<()> {
        self.init_rcv(segmax, segbmax)?;
        self.passive = false;
        self.set_state(State::SynSent);
        match self.send_syn(ctx, false, &data) {
            Ok(()) | Err(ArdpError::WouldBlock) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Passive open completion: the owner accepted, so initialize both rings
    /// and answer with SYN+ACK.
    pub fn start_accept<S: DatagramSocket, H: ArdpHandler>(
        &mut self,
        ctx: &mut Ctx<'_, S, H>,
        segmax: u16,
        segbmax: u16,
        data: Bytes,
    ) -> Result<()> {
        if !matches!(self.state, State::Listen | State::SynSent) {
            return Err(ArdpError::InvalidState);
        }
        self.init_rcv(segmax, segbmax)?;
        self.init_sbuf(ctx.cfg)?;
        self.passive = true;
        self.set_state(State::SynRcvd);
        match self.send_syn(ctx, true, &data) {
            Ok(()) | Err(ArdpError::WouldBlock) => Ok(()),
            Err(e) => {
                warn!(conn = %self.id, error = %e, "SYN+ACK emission failed");
                Err(e)
            }
        }
    }

    /// Queue one user message, fragmenting it across send slots as needed.
    pub fn send<S: DatagramSocket, H: ArdpHandler>(
        &mut self,
        ctx: &mut Ctx<'_, S, H>,
        buf: Bytes,
        ttl: u32,
    ) -> Result<()> {
        if self.state != State::Open {
            return Err(ArdpError::InvalidState);
        }
        if buf.is_empty() || buf.len() > u32::MAX as usize {
            return Err(ArdpError::InvalidData);
        }

        let max_dlen = self.sbuf.as_ref().ok_or(ArdpError::InvalidState)?.max_dlen;
        let in_flight = self.snd.nxt.wrapping_sub(self.snd.una);
        if self.window == 0 || in_flight >= self.window as u32 || in_flight >= self.snd.max {
            return Err(ArdpError::BackPressure);
        }

        let fcnt = (buf.len() + max_dlen - 1) / max_dlen;
        if fcnt > u16::MAX as usize || fcnt as u32 > self.snd.max {
            return Err(ArdpError::Fail);
        }
        if fcnt > 1 && fcnt > self.window as usize {
            return Err(ArdpError::BackPressure);
        }

        let som = self.snd.nxt;
        debug!(conn = %self.id, len = buf.len(), fcnt, som, ttl, "send message");

        for i in 0..fcnt {
            let start = i * max_dlen;
            let end = (start + max_dlen).min(buf.len());
            let seq = self.snd.nxt;

            self.sbuf_mut()?
                .stage(seq, som, fcnt as u16, buf.slice(start..end), buf.clone(), ttl, ctx.now);

            let delta = match self.transmit_slot(ctx, seq) {
                Ok(()) => ctx.cfg.retransmit_timeout_ms,
                Err(ArdpError::WouldBlock) => ctx.cfg.urgent_retransmit_ms(),
                Err(ArdpError::TtlExpired) => return Err(ArdpError::TtlExpired),
                Err(e) => {
                    error!(conn = %self.id, error = %e, "socket failure on data send");
                    let _ = self.start_disconnect(ctx);
                    return Err(ArdpError::Fail);
                }
            };

            self.sbuf_mut()?.commit(seq);
            self.timers.arm(
                TimerKind::Retransmit { seq },
                ctx.now,
                delta,
                RETRANSMIT_RETRY + 1,
            );
            self.snd.nxt = self.snd.nxt.wrapping_add(1);
        }
        Ok(())
    }

    /// Release a consumed delivery back to the receive ring.
    pub fn recv_ready(&mut self, som: u32, fcnt: u16) -> Result<()> {
        let rbuf = self.rbuf_mut()?;
        rbuf.release(som, fcnt)?;
        rbuf.release_expired_head();
        Ok(())
    }

    /// Close: RST the peer and linger in CLOSE_WAIT, or collapse immediately
    /// when no handshake completed.
    pub fn start_disconnect<S: DatagramSocket, H: ArdpHandler>(
        &mut self,
        ctx: &mut Ctx<'_, S, H>,
    ) -> Result<()> {
        match self.state {
            State::Closed | State::CloseWait => Err(ArdpError::InvalidState),
            State::Open => {
                self.cancel_transfer_timers();
                self.timers.arm(
                    TimerKind::Disconnect,
                    ctx.now,
                    ctx.cfg.timewait_ms,
                    DISCONNECT_RETRY,
                );
                self.set_state(State::CloseWait);
                let (nxt, cur, window) = (self.snd.nxt, self.rcv.cur, self.rcv_window());
                if let Err(e) = self.send_control(ctx, flags::RST | flags::VER, nxt, cur, window) {
                    debug!(conn = %self.id, error = %e, "RST emission failed");
                }
                Ok(())
            }
            _ => {
                self.cancel_transfer_timers();
                self.timers.cancel(TimerKind::Connect);
                self.set_state(State::Closed);
                self.timers
                    .arm(TimerKind::Disconnect, ctx.now, 0, DISCONNECT_RETRY);
                Ok(())
            }
        }
    }

    /// Drop every timer that only makes sense while data can still flow.
    fn cancel_transfer_timers(&mut self) {
        self.timers.cancel(TimerKind::WindowCheck);
        if let Some(sbuf) = &self.sbuf {
            let capacity = sbuf.capacity();
            for i in 0..capacity {
                let seq = self.snd.una.wrapping_add(i);
                self.timers.cancel(TimerKind::Retransmit { seq });
            }
        }
        if let Some(rbuf) = &self.rbuf {
            let capacity = rbuf.capacity() as u32;
            for i in 0..capacity {
                let som = self.rcv.cur.wrapping_sub(i);
                self.timers.cancel(TimerKind::Recv { som });
            }
        }
    }

    // ------------------------------------------------------------------
    // Callbacks, fired at most once each
    // ------------------------------------------------------------------

    fn fire_connect<S: DatagramSocket, H: ArdpHandler>(
        &mut self,
        ctx: &mut Ctx<'_, S, H>,
        data: &[u8],
        status: Result<()>,
    ) {
        if self.connect_notified {
            return;
        }
        self.connect_notified = true;
        ctx.handler.on_connect(self.id, self.passive, data, status);
    }

    fn fire_disconnect<S: DatagramSocket, H: ArdpHandler>(
        &mut self,
        ctx: &mut Ctx<'_, S, H>,
        status: Result<()>,
    ) {
        if self.disconnect_notified {
            return;
        }
        self.disconnect_notified = true;
        ctx.handler.on_disconnect(self.id, status);
    }

    /// Fail out every user message still holding send slots. Runs when the
    /// record dies so each `send` still gets its single completion.
    fn flush_pending_send_failures<S: DatagramSocket, H: ArdpHandler>(
        &mut self,
        ctx: &mut Ctx<'_, S, H>,
    ) {
        if let Some(sbuf) = &mut self.sbuf {
            for completion in sbuf.fail_all_pending(&mut self.timers) {
                ctx.handler.on_send_done(
                    self.id,
                    completion.message,
                    completion.len,
                    Err(ArdpError::Fail),
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound segment processing
    // ------------------------------------------------------------------

    pub fn process<S: DatagramSocket, H: ArdpHandler>(
        &mut self,
        ctx: &mut Ctx<'_, S, H>,
        inbound: Inbound,
    ) {
        match self.state {
            State::Closed => self.on_closed(ctx, inbound),
            State::Listen => self.on_listen(ctx, inbound),
            State::SynSent => self.on_syn_sent(ctx, inbound),
            State::SynRcvd => self.on_syn_rcvd(ctx, inbound),
            State::Open => self.on_open(ctx, inbound),
            State::CloseWait => {
                // Only the TIMWAIT delay moves us out of CLOSE_WAIT.
                trace!(conn = %self.id, "segment ignored in CLOSE_WAIT");
            }
        }
    }

    fn on_closed<S: DatagramSocket, H: ArdpHandler>(
        &mut self,
        ctx: &mut Ctx<'_, S, H>,
        inbound: Inbound,
    ) {
        let (flag_bits, ack, seq) = match &inbound {
            Inbound::Syn(syn, _) => (syn.flags, syn.ack, syn.seq),
            Inbound::Seg(seg) => (seg.hdr.flags, seg.hdr.ack, seg.hdr.seq),
        };
        if flag_bits & flags::RST != 0 {
            return;
        }
        let max = self.rcv.max as u16;
        if flag_bits & (flags::ACK | flags::NUL) != 0 {
            let _ = self.send_control(ctx, flags::RST | flags::VER, ack.wrapping_add(1), 0, max);
        } else {
            let _ = self.send_control(ctx, flags::RST | flags::ACK | flags::VER, 0, seq, max);
        }
    }

    fn on_listen<S: DatagramSocket, H: ArdpHandler>(
        &mut self,
        ctx: &mut Ctx<'_, S, H>,
        inbound: Inbound,
    ) {
        match inbound {
            Inbound::Seg(seg) => {
                if seg.hdr.flags & flags::RST != 0 {
                    return;
                }
                if seg.hdr.flags & (flags::ACK | flags::NUL) != 0 {
                    let _ = self.send_control(
                        ctx,
                        flags::RST | flags::VER,
                        seg.hdr.ack.wrapping_add(1),
                        0,
                        0,
                    );
                }
            }
            Inbound::Syn(syn, data) => {
                debug!(conn = %self.id, peer = %self.peer_addr, "SYN received, offering to accept");
                self.absorb_syn_params(&syn);
                let accepted =
                    ctx.handler
                        .on_accept(self.id, (self.peer_addr, self.peer_port), &data);
                if !accepted {
                    debug!(conn = %self.id, "owner refused inbound connection");
                    self.defunct = true;
                }
                // Otherwise the owner follows up with accept().
            }
        }
    }

    fn on_syn_sent<S: DatagramSocket, H: ArdpHandler>(
        &mut self,
        ctx: &mut Ctx<'_, S, H>,
        inbound: Inbound,
    ) {
        match inbound {
            Inbound::Syn(syn, data) => {
                self.absorb_syn_params(&syn);
                if let Err(e) = self.init_sbuf(ctx.cfg) {
                    warn!(conn = %self.id, error = %e, "peer parameters unusable");
                    self.fire_connect(ctx, &[], Err(e));
                    self.set_state(State::Closed);
                    self.defunct = true;
                    return;
                }

                if syn.flags & flags::ACK != 0 {
                    self.snd.una = syn.ack.wrapping_add(1);
                    let cur = self.rcv.cur;
                    if let Ok(rbuf) = self.rbuf_mut() {
                        rbuf.post_init(cur);
                    }
                    self.set_state(State::Open);
                    self.timers.cancel(TimerKind::Connect);
                    self.last_seen = ctx.now;
                    self.timers.arm(
                        TimerKind::WindowCheck,
                        ctx.now,
                        ctx.cfg.persist_timeout_ms,
                        RETRY_ALWAYS,
                    );
                    self.fire_connect(ctx, &data, Ok(()));
                    let (nxt, cur, max) = (self.snd.nxt, self.rcv.cur, self.rcv.max as u16);
                    if let Err(e) = self.send_control(ctx, flags::ACK | flags::VER, nxt, cur, max) {
                        debug!(conn = %self.id, error = %e, "handshake ACK deferred: {e}");
                    }
                } else {
                    // Simultaneous open: offer the SYN to the owner, who
                    // completes it through accept().
                    debug!(conn = %self.id, "simultaneous open");
                    ctx.handler
                        .on_accept(self.id, (self.peer_addr, self.peer_port), &data);
                }
            }
            Inbound::Seg(seg) => {
                if seg.hdr.flags & flags::RST != 0 {
                    debug!(conn = %self.id, "connection refused");
                    self.set_state(State::Closed);
                    return;
                }
                if seg.hdr.flags & flags::ACK != 0 && seg.hdr.ack != self.snd.iss {
                    self.set_state(State::Closed);
                    let max = self.rcv.max as u16;
                    let _ = self.send_control(
                        ctx,
                        flags::RST | flags::VER,
                        seg.hdr.ack.wrapping_add(1),
                        0,
                        max,
                    );
                }
            }
        }
    }

    fn on_syn_rcvd<S: DatagramSocket, H: ArdpHandler>(
        &mut self,
        ctx: &mut Ctx<'_, S, H>,
        inbound: Inbound,
    ) {
        let seg = match inbound {
            Inbound::Syn(syn, _) => {
                // A second SYN here is a protocol violation.
                self.set_state(State::Closed);
                let max = self.rcv.max as u16;
                let _ = self.send_control(
                    ctx,
                    flags::RST | flags::VER,
                    syn.ack.wrapping_add(1),
                    0,
                    max,
                );
                return;
            }
            Inbound::Seg(seg) => seg,
        };

        if seg.hdr.flags & flags::RST != 0 {
            if self.passive {
                debug!(conn = %self.id, "RST during passive open, back to LISTEN");
                self.set_state(State::Listen);
            } else {
                debug!(conn = %self.id, "RST during active open");
                self.set_state(State::Closed);
            }
            return;
        }

        if !in_window(self.rcv.cur.wrapping_add(1), self.rcv.max, seg.hdr.seq) {
            let (nxt, cur, max) = (self.snd.nxt, self.rcv.cur, self.rcv.max as u16);
            let _ = self.send_control(ctx, flags::ACK | flags::VER, nxt, cur, max);
            return;
        }

        if seg.hdr.flags & flags::EACK != 0 {
            let max = self.rcv.max as u16;
            let _ = self.send_control(
                ctx,
                flags::RST | flags::VER,
                seg.hdr.ack.wrapping_add(1),
                0,
                max,
            );
            return;
        }

        if seg.hdr.flags & flags::ACK == 0 {
            trace!(conn = %self.id, "datagram without ACK in SYN_RCVD");
            return;
        }

        if seg.hdr.ack != self.snd.iss {
            let max = self.rcv.max as u16;
            let _ = self.send_control(
                ctx,
                flags::RST | flags::VER,
                seg.hdr.ack.wrapping_add(1),
                0,
                max,
            );
            return;
        }

        // Correct acknowledgement: the handshake is complete.
        let cur = self.rcv.cur;
        if let Ok(rbuf) = self.rbuf_mut() {
            rbuf.post_init(cur);
        }
        self.set_state(State::Open);
        self.timers.cancel(TimerKind::Connect);
        self.last_seen = ctx.now;
        self.timers.arm(
            TimerKind::WindowCheck,
            ctx.now,
            ctx.cfg.persist_timeout_ms,
            RETRY_ALWAYS,
        );
        self.fire_connect(ctx, &[], Ok(()));

        if seg.hdr.dlen > 0 || seg.hdr.flags & flags::NUL != 0 {
            if seg.hdr.dlen > 0 {
                if let Err(e) = self.buffer_inbound_data(ctx, &seg) {
                    warn!(conn = %self.id, error = %e, "piggybacked data rejected");
                }
            }
            let (nxt, cur, window) = (self.snd.nxt, self.rcv.cur, self.rcv_window());
            let _ = self.send_control(ctx, flags::ACK | flags::VER, nxt, cur, window);
        }
    }

    fn on_open<S: DatagramSocket, H: ArdpHandler>(
        &mut self,
        ctx: &mut Ctx<'_, S, H>,
        inbound: Inbound,
    ) {
        let seg = match inbound {
            Inbound::Syn(syn, _) => {
                if self.passive {
                    self.set_state(State::Listen);
                } else {
                    self.set_state(State::Closed);
                }
                let window = self.rcv_window();
                let _ = self.send_control(
                    ctx,
                    flags::RST | flags::VER,
                    syn.ack.wrapping_add(1),
                    0,
                    window,
                );
                return;
            }
            Inbound::Seg(seg) => seg,
        };

        if seg.hdr.flags & flags::RST != 0 {
            debug!(conn = %self.id, "RST received, entering CLOSE_WAIT");
            self.cancel_transfer_timers();
            self.timers.arm(
                TimerKind::Disconnect,
                ctx.now,
                ctx.cfg.timewait_ms,
                DISCONNECT_RETRY,
            );
            self.set_state(State::CloseWait);
            return;
        }

        if !in_window(self.rcv.cur.wrapping_add(1), self.rcv.max, seg.hdr.seq) {
            trace!(conn = %self.id, seq = seg.hdr.seq, cur = self.rcv.cur, "sequence outside window");
            let (nxt, cur, window) = (self.snd.nxt, self.rcv.cur, self.rcv_window());
            let _ = self.send_control(ctx, flags::ACK | flags::VER, nxt, cur, window);
            return;
        }

        if seg.hdr.flags & flags::NUL != 0 {
            trace!(conn = %self.id, "NUL probe");
            let (nxt, cur, window) = (self.snd.nxt, self.rcv.cur, self.rcv_window());
            let _ = self.send_control(ctx, flags::ACK | flags::VER, nxt, cur, window);
            return;
        }

        if seg.hdr.flags & flags::ACK != 0 {
            let span = self.snd.nxt.wrapping_sub(self.snd.una).wrapping_add(1);
            if in_window(self.snd.una, span, seg.hdr.ack) {
                let completions = match self.sbuf.as_mut() {
                    Some(sbuf) => sbuf.flush_acked(seg.hdr.ack, &mut self.timers),
                    None => Vec::new(),
                };
                self.snd.una = seg.hdr.ack.wrapping_add(1);
                for completion in completions {
                    let status = if completion.expired {
                        Err(ArdpError::TtlExpired)
                    } else {
                        Ok(())
                    };
                    ctx.handler
                        .on_send_done(self.id, completion.message, completion.len, status);
                }
            }
        }

        if seg.hdr.flags & flags::EACK != 0 {
            let una = self.snd.una;
            if let Some(sbuf) = self.sbuf.as_mut() {
                sbuf.cancel_eacked(una, &seg.mask, &mut self.timers, ctx.now);
            }
        }

        if seg.hdr.dlen > 0 {
            let fresh = seq_lt(self.rcv.cur, seg.hdr.seq);
            let status = if fresh {
                self.buffer_inbound_data(ctx, &seg)
            } else {
                // Duplicate of something already consumed; just re-ack.
                Ok(())
            };
            match status {
                Ok(()) => {
                    let (nxt, cur, window) = (self.snd.nxt, self.rcv.cur, self.rcv_window());
                    let _ = self.send_control(ctx, flags::ACK | flags::VER, nxt, cur, window);
                }
                Err(e) => {
                    warn!(conn = %self.id, seq = seg.hdr.seq, error = %e, "data segment dropped");
                }
            }
        }

        if self.window != seg.hdr.window {
            self.window = seg.hdr.window;
            let status = if self.window == 0 {
                Err(ArdpError::BackPressure)
            } else {
                Ok(())
            };
            ctx.handler.on_send_window(self.id, self.window, status);
        }
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Buffer one data segment and, when it lands in order, deliver the
    /// contiguous run it unblocks.
    fn buffer_inbound_data<S: DatagramSocket, H: ArdpHandler>(
        &mut self,
        ctx: &mut Ctx<'_, S, H>,
        seg: &Segment,
    ) -> Result<()> {
        let fragged = seg.hdr.flags & flags::FRAG != 0;
        if fragged && seg.hdr.fcnt == 0 {
            return Err(ArdpError::InvalidData);
        }
        let (som, fcnt) = if fragged {
            (seg.hdr.som, seg.hdr.fcnt)
        } else {
            (seg.hdr.seq, 1)
        };
        let expired = seg.hdr.ttl == TTL_EXPIRED;
        let ordered = seg.hdr.seq == self.rcv.cur.wrapping_add(1);

        let outcome = self
            .rbuf_mut()?
            .store(seg.hdr.seq, som, fcnt, expired, seg.payload.clone())?;
        if outcome == StoreOutcome::Duplicate {
            return Ok(());
        }

        if expired {
            trace!(seq = seg.hdr.seq, "expired segment buffered for discard");
            self.rbuf_mut()?.mark_message_expired(som, fcnt);
        } else if fcnt > 1 {
            // A sibling may already carry the expired marker; this arrival
            // can then never assemble either.
            let rbuf = self.rbuf_mut()?;
            if rbuf.message_has_expired_fragment(som, fcnt) {
                rbuf.mark_message_expired(som, fcnt);
            }
        }

        if ordered {
            let consumed = self.deliver_in_order(ctx, seg.hdr.seq);
            if let Some(mask) = &mut self.mask {
                mask.shift(consumed);
            }
            self.rbuf_mut()?.release_expired_head();
        } else {
            let delta = seg.hdr.seq.wrapping_sub(self.rcv.cur.wrapping_add(1));
            if let Some(mask) = &mut self.mask {
                mask.add(delta);
            }
        }
        Ok(())
    }

    /// Walk the contiguous run starting at `start_seq`, advancing `RCV.CUR`
    /// over every buffered slot and delivering completed messages in order.
    /// Returns the number of slots the in-order point moved past.
    fn deliver_in_order<S: DatagramSocket, H: ArdpHandler>(
        &mut self,
        ctx: &mut Ctx<'_, S, H>,
        start_seq: u32,
    ) -> u32 {
        let mut seq = start_seq;
        let mut consumed = 0u32;
        let mut deliver = match self.rbuf.as_ref() {
            Some(rbuf) => rbuf.deliverable_after_prev(start_seq),
            None => return 0,
        };

        loop {
            self.rcv.cur = seq;
            consumed += 1;

            let (som, fcnt, expired, delivered) = {
                let Some(rbuf) = self.rbuf.as_ref() else { break };
                let slot = rbuf.slot(seq);
                (slot.som, slot.fcnt, slot.expired, slot.delivered)
            };

            if expired {
                // Acknowledged but never delivered; mark_message_expired has
                // already flagged it (and its siblings) for release.
            } else if fcnt > 1 {
                let last_of_chain = seq == som.wrapping_add(fcnt as u32 - 1);
                if last_of_chain && deliver {
                    deliver = self.offer_message(ctx, som, fcnt);
                }
            } else if deliver && !delivered {
                deliver = self.offer_message(ctx, seq, 1);
            }

            let next = seq.wrapping_add(1);
            let has_next = self
                .rbuf
                .as_ref()
                .map(|rbuf| rbuf.has_buffered(next))
                .unwrap_or(false);
            if !has_next {
                break;
            }
            seq = next;
        }
        consumed
    }

    /// Hand one complete message to the owner. Returns whether delivery may
    /// continue past it; a refusal arms the delivery-retry timer and stalls
    /// the pipeline until the owner relents.
    fn offer_message<S: DatagramSocket, H: ArdpHandler>(
        &mut self,
        ctx: &mut Ctx<'_, S, H>,
        som: u32,
        fcnt: u16,
    ) -> bool {
        let msg = {
            let Some(rbuf) = self.rbuf.as_ref() else {
                return false;
            };
            match rbuf.assemble(som, fcnt) {
                Some(msg) => msg,
                None => {
                    // A gap inside a supposedly complete chain means the
                    // peer's fragmentation bookkeeping is corrupt.
                    error!(conn = %self.id, som, fcnt, "fragment chain failed validation");
                    return false;
                }
            }
        };

        if ctx.handler.on_recv(self.id, &msg) {
            if let Some(rbuf) = self.rbuf.as_mut() {
                rbuf.mark_delivered(som, fcnt);
            }
            true
        } else {
            trace!(conn = %self.id, som, "delivery refused, scheduling retry");
            self.timers.arm(
                TimerKind::Recv { som },
                ctx.now,
                ctx.cfg.recv_timeout_ms,
                RECV_RETRY,
            );
            false
        }
    }

    /// Delivery-retry sweep: re-offer the stalled message and, if it is
    /// finally taken, every complete successor already buffered in order.
    fn retry_delivery<S: DatagramSocket, H: ArdpHandler>(
        &mut self,
        ctx: &mut Ctx<'_, S, H>,
        som: u32,
    ) {
        let fcnt = {
            let Some(rbuf) = self.rbuf.as_ref() else { return };
            let slot = rbuf.slot(som);
            if !slot.in_use || slot.seq != som || slot.delivered {
                self.timers.cancel(TimerKind::Recv { som });
                return;
            }
            slot.fcnt.max(1)
        };

        if !self.offer_retry(ctx, som, fcnt) {
            // Refused again. The timer table burns one retry per firing;
            // when this was the last one, give up on the peer entirely.
            if self.timers.retry_of(TimerKind::Recv { som }) == Some(1) {
                warn!(conn = %self.id, som, "consumer refused delivery to exhaustion");
                let _ = self.start_disconnect(ctx);
            }
            return;
        }
        self.timers.cancel(TimerKind::Recv { som });

        // Flush the successors the stall was holding back.
        let mut next = som.wrapping_add(fcnt as u32);
        loop {
            let step = {
                let Some(rbuf) = self.rbuf.as_ref() else { break };
                if !rbuf.has_buffered(next) || seq_lt(self.rcv.cur, next) {
                    break;
                }
                let slot = rbuf.slot(next);
                if slot.delivered {
                    Some(slot.fcnt.max(1) as u32)
                } else if slot.seq == slot.som {
                    None
                } else {
                    break;
                }
            };

            match step {
                Some(skip) => {
                    next = next.wrapping_add(skip);
                }
                None => {
                    let next_fcnt = {
                        let Some(rbuf) = self.rbuf.as_ref() else { break };
                        rbuf.slot(next).fcnt.max(1)
                    };
                    // The whole chain must already be in order to deliver.
                    let last = next.wrapping_add(next_fcnt as u32 - 1);
                    if seq_lt(self.rcv.cur, last) {
                        break;
                    }
                    if !self.offer_retry(ctx, next, next_fcnt) {
                        self.timers.arm(
                            TimerKind::Recv { som: next },
                            ctx.now,
                            ctx.cfg.recv_timeout_ms,
                            RECV_RETRY,
                        );
                        break;
                    }
                    next = next.wrapping_add(next_fcnt as u32);
                }
            }
        }

        if let Ok(rbuf) = self.rbuf_mut() {
            rbuf.release_expired_head();
        }
    }

    fn offer_retry<S: DatagramSocket, H: ArdpHandler>(
        &mut self,
        ctx: &mut Ctx<'_, S, H>,
        som: u32,
        fcnt: u16,
    ) -> bool {
        let msg = {
            let Some(rbuf) = self.rbuf.as_ref() else {
                return false;
            };
            match rbuf.assemble(som, fcnt) {
                Some(msg) => msg,
                None => return false,
            }
        };
        if ctx.handler.on_recv(self.id, &msg) {
            if let Some(rbuf) = self.rbuf.as_mut() {
                rbuf.mark_delivered(som, fcnt);
            }
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // Timer dispatch
    // ------------------------------------------------------------------

    /// Fire every due timer; the table handles retry bookkeeping afterwards.
    pub fn process_timers<S: DatagramSocket, H: ArdpHandler>(&mut self, ctx: &mut Ctx<'_, S, H>) {
        for kind in self.timers.due(ctx.now) {
            if self.defunct {
                break;
            }
            if !self.timers.contains(kind) {
                continue;
            }
            self.fire_timer(ctx, kind);
            if self.defunct {
                break;
            }
            self.timers.finish_fire(kind, ctx.now);
        }
    }

    fn fire_timer<S: DatagramSocket, H: ArdpHandler>(
        &mut self,
        ctx: &mut Ctx<'_, S, H>,
        kind: TimerKind,
    ) {
        match kind {
            TimerKind::Connect => {
                debug!(conn = %self.id, "handshake timed out");
                self.fire_connect(ctx, &[], Err(ArdpError::Fail));
                self.set_state(State::Closed);
                self.flush_pending_send_failures(ctx);
                self.timers.cancel_all();
                self.defunct = true;
            }

            TimerKind::Disconnect => {
                self.set_state(State::Closed);
                self.flush_pending_send_failures(ctx);
                self.fire_disconnect(ctx, Ok(()));
                self.timers.cancel_all();
                self.defunct = true;
            }

            TimerKind::Retransmit { seq } => {
                let live = self
                    .sbuf
                    .as_ref()
                    .map(|sbuf| {
                        let slot = sbuf.slot(seq);
                        slot.in_use && slot.seq == seq
                    })
                    .unwrap_or(false);
                if !live {
                    self.timers.cancel(kind);
                    return;
                }

                let remaining = self.timers.retry_of(kind).unwrap_or(0);
                if remaining > 1 {
                    match self.transmit_slot(ctx, seq) {
                        Ok(()) => self.timers.set_delta(kind, ctx.cfg.retransmit_timeout_ms),
                        Err(ArdpError::WouldBlock) => {
                            self.timers.set_delta(kind, ctx.cfg.urgent_retransmit_ms())
                        }
                        Err(e) => {
                            error!(conn = %self.id, seq, error = %e, "retransmission failed");
                        }
                    }
                } else {
                    // Retries exhausted: the message (all fragments if it
                    // spans several) is abandoned with a single failure
                    // completion.
                    warn!(conn = %self.id, seq, "retransmission retries exhausted");
                    let completion = match self.sbuf.as_mut() {
                        Some(sbuf) => sbuf.abandon_message(seq, &mut self.timers),
                        None => return,
                    };
                    ctx.handler.on_send_done(
                        self.id,
                        completion.message,
                        completion.len,
                        Err(ArdpError::Fail),
                    );
                }
            }

            TimerKind::Recv { som } => {
                self.retry_delivery(ctx, som);
            }

            TimerKind::WindowCheck => {
                let silent_for = ctx.now.wrapping_sub(self.last_seen);
                if silent_for >= ctx.cfg.link_timeout_ms() {
                    warn!(conn = %self.id, silent_for, "link timeout, disconnecting");
                    let _ = self.start_disconnect(ctx);
                    return;
                }
                if silent_for >= ctx.cfg.persist_timeout_ms || self.window < self.min_send_window {
                    trace!(conn = %self.id, window = self.window, "persist probe");
                    let (nxt, cur, window) = (self.snd.nxt, self.rcv.cur, self.rcv_window());
                    if let Err(e) = self.send_control(
                        ctx,
                        flags::ACK | flags::NUL | flags::VER,
                        nxt,
                        cur,
                        window,
                    ) {
                        debug!(conn = %self.id, error = %e, "probe emission failed");
                    }
                }
            }
        }
    }

    /// Final teardown when the engine removes the record outside the normal
    /// disconnect path.
    pub fn destroy<S: DatagramSocket, H: ArdpHandler>(&mut self, ctx: &mut Ctx<'_, S, H>) {
        self.flush_pending_send_failures(ctx);
        self.timers.cancel_all();
        self.set_state(State::Closed);
        self.defunct = true;
    }

    /// Prime a freshly allocated record for the passive-open flow.
    pub fn begin_listen(&mut self) {
        self.passive = true;
        self.set_state(State::Listen);
    }
}
