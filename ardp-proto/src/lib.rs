//! # ardp-proto: Reliable Datagram Protocol engine
//!
//! A connection-oriented, sequenced, reliable, **message-preserving**
//! transport layered on unreliable datagrams (UDP). It provides TCP-like
//! guarantees: handshake, in-order delivery, retransmission, cumulative and
//! selective acknowledgment, flow control, and keep-alive, while keeping
//! message boundaries intact and supporting a per-message time-to-live, so
//! stale payloads can expire without tearing the stream down.
//!
//! ## Architecture Overview
//!
//! ```text
//! ardp-proto/
//! ├── packet      - wire codec: fixed header, SYN segment, EACK mask
//! ├── timer       - per-connection timer table (retransmit, persist, ...)
//! ├── buffer      - send/receive slot rings, fragmentation, EACK tracking
//! ├── connection  - connection record and the six-state protocol machine
//! ├── engine      - connection set, demux, public API, run loop
//! ├── socket      - non-blocking datagram socket trait + std adapter
//! ├── events      - callback trait connecting the engine to its owner
//! └── clock       - injected monotonic time
//! ```
//!
//! ## Design Principles
//!
//! 1. **Single-threaded, cooperative**: all state lives behind one
//!    [`ArdpEngine`] and mutates only on the thread driving it. No internal
//!    threads, no locks.
//!
//! 2. **Nothing blocks**: the socket is non-blocking; [`ArdpEngine::run`]
//!    returns the delay until the next timer deadline so the owner can poll
//!    with exactly that timeout.
//!
//! 3. **Injected environment**: time ([`MonotonicClock`]), randomness (the
//!    RNG behind sequence numbers and ephemeral ports), and the socket are
//!    all supplied by the owner, which makes every protocol behavior
//!    reproducible under test.
//!
//! 4. **Borrowed payloads, owned receive buffers**: a sent message is held
//!    as a reference-counted handle and returned through exactly one
//!    [`ArdpHandler::on_send_done`]; received payloads belong to the engine
//!    until the owner releases them with [`ArdpEngine::recv_ready`].
//!
//! ## Usage Sketch
//!
//! ```rust,ignore
//! let socket = StdUdpSocket::bind("0.0.0.0:7000")?;
//! let mut engine = ArdpEngine::new(ArdpConfig::default(), socket, MyHandler::new())?;
//! engine.start_passive();
//!
//! loop {
//!     let readable = poll(engine_socket, next_timeout)?;
//!     let next_timeout = engine.run(readable)?;
//!     // drain handler-side queues, call send()/recv_ready()/accept() here
//! }
//! ```

#![forbid(unsafe_code)]

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod packet;
pub mod socket;

mod buffer;
mod connection;
mod timer;
mod types;

pub use clock::{MonotonicClock, StdClock};
pub use config::ArdpConfig;
pub use engine::ArdpEngine;
pub use error::{ArdpError, Result};
pub use events::{ArdpHandler, RcvMessage};
pub use socket::{DatagramSocket, StdUdpSocket};
pub use types::ConnId;
