//! Datagram socket abstraction.
//!
//! The engine does not own a socket implementation; it issues `send_to` and
//! `recv_from` against this trait and interprets [`ArdpError::WouldBlock`]
//! as "defer and retry". Tests drive the engine through in-memory
//! implementations; production code uses [`StdUdpSocket`].

use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};

use crate::error::{ArdpError, Result};

/// Non-blocking datagram sink/source.
///
/// Implementations must never block: a send or receive that cannot proceed
/// returns [`ArdpError::WouldBlock`]. Any other error is treated as a
/// transport failure.
pub trait DatagramSocket {
    /// Send one datagram to `(addr, port)`. Returns the number of bytes sent.
    fn send_to(&mut self, addr: IpAddr, port: u16, datagram: &[u8]) -> Result<usize>;

    /// Receive one datagram into `buf`, returning the sender and length.
    fn recv_from(&mut self, buf: &mut [u8]) -> Result<(IpAddr, u16, usize)>;
}

/// [`DatagramSocket`] over a non-blocking `std::net::UdpSocket`.
#[derive(Debug)]
pub struct StdUdpSocket {
    inner: UdpSocket,
}

impl StdUdpSocket {
    /// Bind a UDP socket and switch it to non-blocking mode.
    pub fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let inner = UdpSocket::bind(addr)?;
        inner.set_nonblocking(true)?;
        Ok(Self { inner })
    }

    /// The locally bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Access the underlying socket, e.g. to register it with a poller.
    pub fn get_ref(&self) -> &UdpSocket {
        &self.inner
    }
}

fn map_io_error(err: &io::Error) -> ArdpError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => ArdpError::WouldBlock,
        _ => ArdpError::Fail,
    }
}

impl DatagramSocket for StdUdpSocket {
    fn send_to(&mut self, addr: IpAddr, port: u16, datagram: &[u8]) -> Result<usize> {
        self.inner
            .send_to(datagram, SocketAddr::new(addr, port))
            .map_err(|e| map_io_error(&e))
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> Result<(IpAddr, u16, usize)> {
        let (n, from) = self
            .inner
            .recv_from(buf)
            .map_err(|e| map_io_error(&e))?;
        Ok((from.ip(), from.port(), n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_nonblocking_socket_would_block() {
        let mut sock = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(sock.recv_from(&mut buf), Err(ArdpError::WouldBlock));
    }

    #[test]
    fn test_loopback_round_trip() {
        let mut a = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let mut b = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let b_addr = b.local_addr().unwrap();

        a.send_to(b_addr.ip(), b_addr.port(), b"ping").unwrap();

        // Loopback delivery is fast but not synchronous.
        let mut buf = [0u8; 16];
        for _ in 0..100 {
            match b.recv_from(&mut buf) {
                Ok((_, _, n)) => {
                    assert_eq!(&buf[..n], b"ping");
                    return;
                }
                Err(ArdpError::WouldBlock) => std::thread::sleep(std::time::Duration::from_millis(1)),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        panic!("datagram never arrived");
    }
}
