//! Sliding-window buffer management.
//!
//! Send and receive sides each keep a fixed ring of slots sized by the
//! window negotiated in the handshake; the EACK mask tracks out-of-order
//! arrivals on the receive side and drives selective-ack cancellation on the
//! send side.

pub(crate) mod eack;
pub(crate) mod recv;
pub(crate) mod send;
