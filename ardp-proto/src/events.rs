//! Callback surface between the engine and its owner.
//!
//! ARDP is callback-driven rather than event-queue-driven because two of the
//! notifications are questions: the owner can refuse an inbound connection
//! (`on_accept`) or refuse a delivery (`on_recv`), and the protocol reacts to
//! the answer immediately. All callbacks run on the thread driving the
//! engine; a handler must not call back into the engine from inside a
//! callback.

use bytes::{Bytes, BytesMut};
use std::net::IpAddr;

use crate::error::Result;
use crate::types::ConnId;

/// One delivered message, possibly spanning several segments.
///
/// `fragments` holds the payload in arrival order; for an unfragmented
/// message it has a single element. The handles are reference-counted, so a
/// handler that wants to keep the data beyond the callback clones them
/// cheaply. After accepting a delivery the owner must eventually hand the
/// message back through [`crate::ArdpEngine::recv_ready`] to release its
/// receive-window slots.
#[derive(Debug, Clone)]
pub struct RcvMessage {
    /// Sequence number of the first segment of the message.
    pub som: u32,
    /// Number of segments the message spans (1 for unfragmented).
    pub fcnt: u16,
    /// Total payload length in bytes.
    pub len: usize,
    /// Payload fragments in order.
    pub fragments: Vec<Bytes>,
}

impl RcvMessage {
    /// Copy the fragments into one contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.len);
        for fragment in &self.fragments {
            out.extend_from_slice(fragment);
        }
        out.freeze()
    }
}

/// Protocol notifications delivered to the engine's owner.
///
/// Default implementations refuse inbound connections and accept every
/// delivery, so a minimal client only overrides what it uses.
pub trait ArdpHandler {
    /// An inbound connection request arrived carrying `data` from the peer's
    /// SYN. Return `true` to proceed (the owner then calls
    /// [`crate::ArdpEngine::accept`]), `false` to drop the request.
    fn on_accept(&mut self, conn: ConnId, peer: (IpAddr, u16), data: &[u8]) -> bool {
        let _ = (conn, peer, data);
        false
    }

    /// The handshake finished (`Ok`) or failed. `passive` tells which side
    /// initiated; `data` carries any user bytes from the peer's SYN.
    fn on_connect(&mut self, conn: ConnId, passive: bool, data: &[u8], status: Result<()>) {
        let _ = (conn, passive, data, status);
    }

    /// The connection is gone. Fires at most once, after `on_connect` or an
    /// explicit disconnect.
    fn on_disconnect(&mut self, conn: ConnId, status: Result<()>) {
        let _ = (conn, status);
    }

    /// An in-order message is ready. Return `true` to accept it (releasing
    /// it later via `recv_ready`), `false` to have delivery retried.
    fn on_recv(&mut self, conn: ConnId, msg: &RcvMessage) -> bool {
        let _ = (conn, msg);
        true
    }

    /// The engine is done with a sent buffer. Fires exactly once per `send`
    /// that consumed window space: `Ok` when the peer acknowledged the whole
    /// message, `Err(TtlExpired)` when it expired in flight, `Err(Fail)` when
    /// retries were exhausted or the connection died first.
    fn on_send_done(&mut self, conn: ConnId, buf: Bytes, len: usize, status: Result<()>) {
        let _ = (conn, buf, len, status);
    }

    /// The peer advertised a different receive window. `status` is
    /// `Err(BackPressure)` when the window closed to zero.
    fn on_send_window(&mut self, conn: ConnId, window: u16, status: Result<()>) {
        let _ = (conn, window, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rcv_message_to_bytes_concatenates() {
        let msg = RcvMessage {
            som: 7,
            fcnt: 2,
            len: 10,
            fragments: vec![Bytes::from_static(b"hello"), Bytes::from_static(b"world")],
        };
        assert_eq!(&msg.to_bytes()[..], b"helloworld");
    }

    #[test]
    fn test_default_handler_refuses_accept_and_takes_delivery() {
        struct Noop;
        impl ArdpHandler for Noop {}

        let mut h = Noop;
        let id = ConnId { index: 0, gen: 0 };
        assert!(!h.on_accept(id, ("127.0.0.1".parse().unwrap(), 9), b""));
        let msg = RcvMessage {
            som: 0,
            fcnt: 1,
            len: 0,
            fragments: vec![],
        };
        assert!(h.on_recv(id, &msg));
    }
}
