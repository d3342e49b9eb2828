//! The top-level protocol engine.
//!
//! An [`ArdpEngine`] owns the connection set, demultiplexes inbound
//! datagrams by `(local port, foreign port)`, drives every connection's
//! timers, and exposes the public operations: `connect`, `accept`, `send`,
//! `recv_ready`, `disconnect`, `run`. It is single-threaded and cooperative;
//! all calls must come from the thread that owns the engine, and `run`
//! never blocks: it drains the socket, fires due timers, and reports when
//! it next wants to be called.

use bytes::BytesMut;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::net::IpAddr;
use tracing::{debug, trace, warn};

use crate::clock::{MonotonicClock, StdClock};
use crate::config::ArdpConfig;
use crate::connection::{Connection, Ctx, Inbound};
use crate::error::{ArdpError, Result};
use crate::events::{ArdpHandler, RcvMessage};
use crate::packet::header::{peek_ports, peek_syn, Header, Segment, SynSegment};
use crate::packet::{flags, FIXED_HEADER_LEN, MAX_DATAGRAM_LEN};
use crate::socket::DatagramSocket;
use crate::types::{seq_lt, ConnId};

pub struct ArdpEngine<S, H, C = StdClock, R = StdRng>
where
    S: DatagramSocket,
    H: ArdpHandler,
    C: MonotonicClock,
    R: RngCore,
{
    config: ArdpConfig,
    socket: S,
    handler: H,
    clock: C,
    rng: R,
    accepting: bool,
    conns: Vec<Option<Connection>>,
    next_gen: u32,
    recv_buf: Vec<u8>,
    scratch: BytesMut,
}

impl<S, H> ArdpEngine<S, H, StdClock, StdRng>
where
    S: DatagramSocket,
    H: ArdpHandler,
{
    /// Build an engine with the standard clock and an OS-seeded RNG.
    pub fn new(config: ArdpConfig, socket: S, handler: H) -> Result<Self> {
        Self::with_rng(config, socket, handler, StdClock::new(), StdRng::from_entropy())
    }
}

impl<S, H, C, R> ArdpEngine<S, H, C, R>
where
    S: DatagramSocket,
    H: ArdpHandler,
    C: MonotonicClock,
    R: RngCore,
{
    /// Build an engine with injected time and randomness. The RNG draws the
    /// initial send sequence first and the ephemeral local port second for
    /// each connection, in that order.
    pub fn with_rng(config: ArdpConfig, socket: S, handler: H, clock: C, rng: R) -> Result<Self> {
        if let Err(problems) = config.validate() {
            warn!(?problems, "rejecting engine configuration");
            return Err(ArdpError::InvalidData);
        }
        Ok(Self {
            config,
            socket,
            handler,
            clock,
            rng,
            accepting: false,
            conns: Vec::new(),
            next_gen: 0,
            recv_buf: vec![0u8; MAX_DATAGRAM_LEN],
            scratch: BytesMut::with_capacity(MAX_DATAGRAM_LEN),
        })
    }

    /// Start honoring unsolicited SYNs by offering them to the handler.
    pub fn start_passive(&mut self) {
        self.accepting = true;
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    pub fn config(&self) -> &ArdpConfig {
        &self.config
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Number of live connection records.
    pub fn connection_count(&self) -> usize {
        self.conns.iter().flatten().count()
    }

    // ------------------------------------------------------------------
    // Connection bookkeeping
    // ------------------------------------------------------------------

    fn alloc_conn(&mut self, peer_addr: IpAddr, peer_port: u16, foreign: u16, now: u32) -> ConnId {
        let iss = self.rng.next_u32();
        let local = ((self.rng.next_u32() % 65_534) + 1) as u16;

        self.next_gen = self.next_gen.wrapping_add(1);
        let gen = self.next_gen;

        let index = match self.conns.iter().position(Option::is_none) {
            Some(idx) => idx,
            None => {
                self.conns.push(None);
                self.conns.len() - 1
            }
        };
        let id = ConnId {
            index: index as u32,
            gen,
        };
        self.conns[index] = Some(Connection::new(
            id, local, foreign, peer_addr, peer_port, iss, now,
        ));
        trace!(conn = %id, local, foreign, "connection record allocated");
        id
    }

    fn resolve(&self, id: ConnId) -> Result<usize> {
        match self.conns.get(id.index as usize) {
            Some(Some(conn)) if conn.id == id => Ok(id.index as usize),
            _ => Err(ArdpError::InvalidState),
        }
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Active open toward `(addr, port)`. `segmax`/`segbmax` advertise our
    /// receive window; `data` rides in the SYN (may be empty).
    pub fn connect(
        &mut self,
        addr: IpAddr,
        port: u16,
        segmax: u16,
        segbmax: u16,
        data: bytes::Bytes,
    ) -> Result<ConnId> {
        if data.len() > u16::MAX as usize {
            return Err(ArdpError::InvalidData);
        }
        let now = self.clock.now_ms();
        let id = self.alloc_conn(addr, port, 0, now);
        let index = id.index as usize;

        let ArdpEngine {
            config,
            socket,
            handler,
            scratch,
            conns,
            ..
        } = self;
        let conn = conns[index].as_mut().expect("just allocated");
        let mut ctx = Ctx {
            cfg: config,
            socket,
            handler,
            now,
            scratch,
        };
        match conn.start_connect(&mut ctx, segmax, segbmax, data) {
            Ok(()) => Ok(id),
            Err(e) => {
                self.conns[index] = None;
                Err(e)
            }
        }
    }

    /// Complete a passive open previously offered through `on_accept`.
    pub fn accept(
        &mut self,
        id: ConnId,
        segmax: u16,
        segbmax: u16,
        data: bytes::Bytes,
    ) -> Result<()> {
        if data.len() > u16::MAX as usize {
            return Err(ArdpError::InvalidData);
        }
        let index = self.resolve(id)?;
        let now = self.clock.now_ms();

        let ArdpEngine {
            config,
            socket,
            handler,
            scratch,
            conns,
            ..
        } = self;
        let conn = conns[index].as_mut().expect("resolved");
        let mut ctx = Ctx {
            cfg: config,
            socket,
            handler,
            now,
            scratch,
        };
        match conn.start_accept(&mut ctx, segmax, segbmax, data) {
            Ok(()) => Ok(()),
            Err(ArdpError::WouldBlock) => Ok(()),
            Err(e) => {
                conn.destroy(&mut ctx);
                self.conns[index] = None;
                Err(e)
            }
        }
    }

    /// Queue `buf` for reliable delivery. `ttl_ms` bounds how long the
    /// engine may try before the payload goes stale (0 = forever).
    pub fn send(&mut self, id: ConnId, buf: bytes::Bytes, ttl_ms: u32) -> Result<()> {
        let index = self.resolve(id)?;
        let now = self.clock.now_ms();

        let ArdpEngine {
            config,
            socket,
            handler,
            scratch,
            conns,
            ..
        } = self;
        let conn = conns[index].as_mut().expect("resolved");
        let mut ctx = Ctx {
            cfg: config,
            socket,
            handler,
            now,
            scratch,
        };
        let result = conn.send(&mut ctx, buf, ttl_ms);
        if conn.defunct {
            self.conns[index] = None;
        }
        result
    }

    /// Return an accepted delivery, releasing its receive-window slots.
    /// `msg` must be the delivery currently at the head of the window.
    pub fn recv_ready(&mut self, id: ConnId, msg: &RcvMessage) -> Result<()> {
        let index = self.resolve(id)?;
        let conn = self.conns[index].as_mut().expect("resolved");
        conn.recv_ready(msg.som, msg.fcnt)
    }

    /// Active close: RST the peer and linger in CLOSE_WAIT for the
    /// configured grace period before `on_disconnect` fires.
    pub fn disconnect(&mut self, id: ConnId) -> Result<()> {
        let index = self.resolve(id)?;
        let now = self.clock.now_ms();

        let ArdpEngine {
            config,
            socket,
            handler,
            scratch,
            conns,
            ..
        } = self;
        let conn = conns[index].as_mut().expect("resolved");
        let mut ctx = Ctx {
            cfg: config,
            socket,
            handler,
            now,
            scratch,
        };
        conn.start_disconnect(&mut ctx)
    }

    /// Attach an owner-defined value to the connection.
    pub fn set_context(&mut self, id: ConnId, context: u64) -> Result<()> {
        let index = self.resolve(id)?;
        self.conns[index].as_mut().expect("resolved").context = context;
        Ok(())
    }

    pub fn context(&self, id: ConnId) -> Option<u64> {
        let index = self.resolve(id).ok()?;
        Some(self.conns[index].as_ref()?.context)
    }

    pub fn peer_addr(&self, id: ConnId) -> Option<(IpAddr, u16)> {
        let index = self.resolve(id).ok()?;
        let conn = self.conns[index].as_ref()?;
        Some((conn.peer_addr, conn.peer_port))
    }

    pub fn local_port(&self, id: ConnId) -> Option<u16> {
        let index = self.resolve(id).ok()?;
        Some(self.conns[index].as_ref()?.local)
    }

    // ------------------------------------------------------------------
    // The run loop
    // ------------------------------------------------------------------

    /// Drive the engine: drain the socket while `socket_ready`, fire due
    /// timers, and report the delay in ms until the next timer deadline
    /// (`None` when nothing is scheduled). Socket read failures other than
    /// `WouldBlock` propagate.
    pub fn run(&mut self, socket_ready: bool) -> Result<Option<u32>> {
        if socket_ready {
            loop {
                let received = {
                    let ArdpEngine {
                        socket, recv_buf, ..
                    } = self;
                    socket.recv_from(recv_buf)
                };
                match received {
                    Err(ArdpError::WouldBlock) => break,
                    Err(e) => return Err(e),
                    Ok((addr, port, len)) => {
                        let now = self.clock.now_ms();
                        self.dispatch(addr, port, len, now);
                    }
                }
            }
        }

        let now = self.clock.now_ms();
        self.run_timers(now);
        Ok(self.next_timeout(now))
    }

    /// Route one inbound datagram to its connection, or handle it as an
    /// unsolicited connection request.
    fn dispatch(&mut self, addr: IpAddr, port: u16, len: usize, now: u32) {
        if len == 0 || len > MAX_DATAGRAM_LEN {
            return;
        }

        let Some((local, foreign)) = peek_ports(&self.recv_buf[..len]) else {
            trace!(%addr, port, len, "runt datagram dropped");
            return;
        };

        if local == 0 {
            self.dispatch_unsolicited(addr, port, len, foreign, now);
            return;
        }

        let index = find_conn(&self.conns, local, foreign)
            .or_else(|| find_conn(&self.conns, local, 0));
        let Some(index) = index else {
            trace!(%addr, port, local, foreign, "no matching connection, dropped");
            return;
        };

        let ArdpEngine {
            config,
            socket,
            handler,
            scratch,
            conns,
            recv_buf,
            ..
        } = self;
        let conn = conns[index].as_mut().expect("found above");
        let datagram = &recv_buf[..len];

        let inbound = if peek_syn(datagram) {
            match SynSegment::parse(datagram) {
                Ok((syn, data)) => Inbound::Syn(syn, data),
                Err(e) => {
                    warn!(%addr, port, error = %e, "malformed SYN dropped");
                    return;
                }
            }
        } else {
            match Segment::parse(datagram, Some(conn.rcv_hdr_len)) {
                Ok(seg) => Inbound::Seg(seg),
                Err(e) => {
                    warn!(%addr, port, local, foreign, error = %e, "malformed segment dropped");
                    return;
                }
            }
        };

        conn.last_seen = now;
        let mut ctx = Ctx {
            cfg: config,
            socket,
            handler,
            now,
            scratch,
        };
        conn.process(&mut ctx, inbound);
        if conn.defunct {
            self.conns[index] = None;
        }
    }

    /// A datagram addressed to port 0 is a connection request. When we are
    /// accepting, a record is allocated and the SYN offered to the handler;
    /// anything else draws a reset.
    fn dispatch_unsolicited(
        &mut self,
        addr: IpAddr,
        port: u16,
        len: usize,
        foreign: u16,
        now: u32,
    ) {
        let syn_parse = if self.accepting && peek_syn(&self.recv_buf[..len]) {
            SynSegment::parse(&self.recv_buf[..len]).ok()
        } else {
            None
        };

        let Some((syn, data)) = syn_parse else {
            debug!(%addr, port, foreign, "unsolicited datagram refused with RST");
            let ArdpEngine {
                socket, scratch, ..
            } = self;
            send_raw_rst(socket, scratch, addr, port, 0, foreign);
            return;
        };

        let id = self.alloc_conn(addr, port, foreign, now);
        let index = id.index as usize;

        let ArdpEngine {
            config,
            socket,
            handler,
            scratch,
            conns,
            ..
        } = self;
        let conn = conns[index].as_mut().expect("just allocated");
        conn.begin_listen();
        let mut ctx = Ctx {
            cfg: config,
            socket,
            handler,
            now,
            scratch,
        };
        conn.process(&mut ctx, Inbound::Syn(syn, data));
        if conn.defunct {
            self.conns[index] = None;
        }
    }

    fn run_timers(&mut self, now: u32) {
        let ArdpEngine {
            config,
            socket,
            handler,
            scratch,
            conns,
            ..
        } = self;

        for slot in conns.iter_mut() {
            let Some(conn) = slot else { continue };
            if conn.timers.is_empty() {
                continue;
            }
            let mut ctx = Ctx {
                cfg: config,
                socket: &mut *socket,
                handler: &mut *handler,
                now,
                scratch: &mut *scratch,
            };
            conn.process_timers(&mut ctx);
            if conn.defunct {
                *slot = None;
            }
        }
    }

    fn next_timeout(&self, now: u32) -> Option<u32> {
        self.conns
            .iter()
            .flatten()
            .filter_map(|conn| conn.timers.next_deadline())
            .map(|deadline| {
                if seq_lt(now, deadline) {
                    deadline.wrapping_sub(now)
                } else {
                    0
                }
            })
            .min()
    }
}

fn find_conn(conns: &[Option<Connection>], local: u16, foreign: u16) -> Option<usize> {
    conns.iter().position(|slot| {
        slot.as_ref()
            .map(|conn| conn.local == local && conn.foreign == foreign)
            .unwrap_or(false)
    })
}

/// Reset an endpoint we hold no record for.
fn send_raw_rst<S: DatagramSocket>(
    socket: &mut S,
    scratch: &mut BytesMut,
    addr: IpAddr,
    port: u16,
    local: u16,
    foreign: u16,
) {
    let hdr = Header {
        flags: flags::RST | flags::VER,
        src: local,
        dst: foreign,
        dlen: 0,
        seq: 0,
        ack: 0,
        window: 0,
        ttl: 0,
        som: 0,
        fcnt: 0,
    };
    scratch.clear();
    hdr.encode(scratch, &[]);
    debug_assert_eq!(scratch.len(), FIXED_HEADER_LEN);
    if let Err(e) = socket.send_to(addr, port, scratch) {
        trace!(%addr, port, error = %e, "raw RST not sent");
    }
}
