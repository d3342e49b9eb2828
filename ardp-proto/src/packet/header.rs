//! Header encoding and decoding over `bytes` buffers.

use bytes::{Buf, BufMut, Bytes};

use crate::error::{ArdpError, Result};
use crate::packet::{flags, FIXED_HEADER_LEN, OPT_SDM, SYN_HEADER_LEN};

/// Fixed data/ack header.
///
/// | off | size | field  |
/// |-----|------|--------|
/// | 0   | 1    | flags  |
/// | 1   | 1    | hlen (units of 2 octets, EACK words included) |
/// | 2   | 2    | src    |
/// | 4   | 2    | dst    |
/// | 6   | 2    | dlen   |
/// | 8   | 4    | seq    |
/// | 12  | 4    | ack    |
/// | 16  | 2    | window |
/// | 18  | 2    | ttl    |
/// | 20  | 4    | som    |
/// | 24  | 2    | fcnt   |
/// | 26  | 4×n  | EACK mask words |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub flags: u8,
    pub src: u16,
    pub dst: u16,
    pub dlen: u16,
    pub seq: u32,
    pub ack: u32,
    pub window: u16,
    pub ttl: u16,
    pub som: u32,
    pub fcnt: u16,
}

impl Header {
    /// Total header length for a mask of `mask_words` 32-bit words.
    pub fn len_with_mask(mask_words: usize) -> usize {
        FIXED_HEADER_LEN + 4 * mask_words
    }

    /// Write the header followed by `mask` words. The caller is responsible
    /// for having set [`flags::EACK`] when the mask carries live bits.
    pub fn encode<B: BufMut>(&self, buf: &mut B, mask: &[u32]) {
        let hlen = Self::len_with_mask(mask.len()) / 2;
        buf.put_u8(self.flags);
        buf.put_u8(hlen as u8);
        buf.put_u16(self.src);
        buf.put_u16(self.dst);
        buf.put_u16(self.dlen);
        buf.put_u32(self.seq);
        buf.put_u32(self.ack);
        buf.put_u16(self.window);
        buf.put_u16(self.ttl);
        buf.put_u32(self.som);
        buf.put_u16(self.fcnt);
        for word in mask {
            buf.put_u32(*word);
        }
    }
}

/// A parsed non-SYN segment: header, selective-ack mask, payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub hdr: Header,
    /// Header length on the wire, mask words included.
    pub header_len: usize,
    /// EACK mask words in host order; empty when the segment carried none.
    pub mask: Vec<u32>,
    /// Payload (`hdr.dlen` bytes), copied out of the datagram buffer.
    pub payload: Bytes,
}

impl Segment {
    /// Parse a non-SYN segment.
    ///
    /// `expected_header_len` is the header length negotiated for the
    /// connection; a segment declaring any other length is rejected, as is a
    /// missing VER bit or a payload length that disagrees with the datagram
    /// size.
    pub fn parse(datagram: &[u8], expected_header_len: Option<usize>) -> Result<Segment> {
        if datagram.len() < FIXED_HEADER_LEN {
            return Err(ArdpError::InvalidData);
        }

        let mut buf = datagram;
        let flag_bits = buf.get_u8();
        let hlen = buf.get_u8();
        let header_len = hlen as usize * 2;

        if flag_bits & flags::VER == 0 || flag_bits & flags::SYN != 0 {
            return Err(ArdpError::InvalidData);
        }
        if header_len < FIXED_HEADER_LEN
            || header_len > datagram.len()
            || (header_len - FIXED_HEADER_LEN) % 4 != 0
        {
            return Err(ArdpError::InvalidData);
        }
        if let Some(expected) = expected_header_len {
            if header_len != expected {
                return Err(ArdpError::InvalidData);
            }
        }

        let hdr = Header {
            flags: flag_bits,
            src: buf.get_u16(),
            dst: buf.get_u16(),
            dlen: buf.get_u16(),
            seq: buf.get_u32(),
            ack: buf.get_u32(),
            window: buf.get_u16(),
            ttl: buf.get_u16(),
            som: buf.get_u32(),
            fcnt: buf.get_u16(),
        };

        if datagram.len() != header_len + hdr.dlen as usize {
            return Err(ArdpError::InvalidData);
        }

        let mask_words = (header_len - FIXED_HEADER_LEN) / 4;
        let mut mask = Vec::with_capacity(mask_words);
        for _ in 0..mask_words {
            mask.push(buf.get_u32());
        }

        let payload = Bytes::copy_from_slice(&datagram[header_len..]);
        Ok(Segment {
            hdr,
            header_len,
            mask,
            payload,
        })
    }
}

/// SYN segment: shares offsets 0–19 with [`Header`], then carries the
/// advertised window parameters.
///
/// | off | size | field   |
/// |-----|------|---------|
/// | 0–19|      | as [`Header`] (`window` mirrors `segmax`, `ttl` is 0) |
/// | 20  | 2    | segmax  |
/// | 22  | 2    | segbmax |
/// | 24  | 2    | options |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynSegment {
    pub flags: u8,
    pub src: u16,
    pub dst: u16,
    pub dlen: u16,
    pub seq: u32,
    pub ack: u32,
    pub segmax: u16,
    pub segbmax: u16,
    pub options: u16,
}

impl SynSegment {
    /// Parse a SYN segment; `datagram` may carry user data after the header.
    pub fn parse(datagram: &[u8]) -> Result<(SynSegment, Bytes)> {
        if datagram.len() < SYN_HEADER_LEN {
            return Err(ArdpError::InvalidData);
        }

        let mut buf = datagram;
        let flag_bits = buf.get_u8();
        let hlen = buf.get_u8();

        if flag_bits & (flags::SYN | flags::VER) != (flags::SYN | flags::VER) {
            return Err(ArdpError::InvalidData);
        }
        if hlen as usize * 2 != SYN_HEADER_LEN {
            return Err(ArdpError::InvalidData);
        }

        let src = buf.get_u16();
        let dst = buf.get_u16();
        let dlen = buf.get_u16();
        let seq = buf.get_u32();
        let ack = buf.get_u32();
        let _window = buf.get_u16();
        let _ttl = buf.get_u16();
        let segmax = buf.get_u16();
        let segbmax = buf.get_u16();
        let options = buf.get_u16();

        if options & OPT_SDM == 0 {
            return Err(ArdpError::InvalidData);
        }
        if datagram.len() != SYN_HEADER_LEN + dlen as usize {
            return Err(ArdpError::InvalidData);
        }

        let syn = SynSegment {
            flags: flag_bits,
            src,
            dst,
            dlen,
            seq,
            ack,
            segmax,
            segbmax,
            options,
        };
        let payload = Bytes::copy_from_slice(&datagram[SYN_HEADER_LEN..]);
        Ok((syn, payload))
    }

    /// Write the SYN header. User data, if any, follows separately.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.flags);
        buf.put_u8((SYN_HEADER_LEN / 2) as u8);
        buf.put_u16(self.src);
        buf.put_u16(self.dst);
        buf.put_u16(self.dlen);
        buf.put_u32(self.seq);
        buf.put_u32(self.ack);
        buf.put_u16(self.segmax);
        buf.put_u16(0); // ttl field unused in SYN
        buf.put_u16(self.segmax);
        buf.put_u16(self.segbmax);
        buf.put_u16(self.options);
    }
}

/// Extract `(dst, src)` ports from a raw datagram for connection demux.
/// Returns `None` when the datagram is too short to carry a header.
pub(crate) fn peek_ports(datagram: &[u8]) -> Option<(u16, u16)> {
    if datagram.len() < 6 {
        return None;
    }
    let src = u16::from_be_bytes([datagram[2], datagram[3]]);
    let dst = u16::from_be_bytes([datagram[4], datagram[5]]);
    Some((dst, src))
}

/// True when the datagram's flag octet carries SYN.
pub(crate) fn peek_syn(datagram: &[u8]) -> bool {
    !datagram.is_empty() && datagram[0] & flags::SYN != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn sample_header() -> Header {
        Header {
            flags: flags::ACK | flags::VER,
            src: 4660,
            dst: 22136,
            dlen: 5,
            seq: 0xDEAD_BEEF,
            ack: 0x0102_0304,
            window: 7,
            ttl: 250,
            som: 0xDEAD_BEEF,
            fcnt: 1,
        }
    }

    // ========================================================================
    // Fixed header round-trips
    // ========================================================================

    #[test]
    fn test_header_round_trip_no_mask() {
        let hdr = sample_header();
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf, &[]);
        buf.extend_from_slice(b"hello");

        let seg = Segment::parse(&buf, Some(FIXED_HEADER_LEN)).unwrap();
        assert_eq!(seg.hdr, hdr);
        assert_eq!(seg.header_len, FIXED_HEADER_LEN);
        assert!(seg.mask.is_empty());
        assert_eq!(&seg.payload[..], b"hello");
    }

    #[test]
    fn test_header_round_trip_with_mask() {
        let mut hdr = sample_header();
        hdr.flags |= flags::EACK;
        hdr.dlen = 0;
        let mask = [0x8000_0001u32, 0x0000_0010];

        let mut buf = BytesMut::new();
        hdr.encode(&mut buf, &mask);

        let seg = Segment::parse(&buf, Some(FIXED_HEADER_LEN + 8)).unwrap();
        assert_eq!(seg.hdr, hdr);
        assert_eq!(seg.mask, mask);
        assert!(seg.payload.is_empty());
    }

    #[test]
    fn test_header_wire_offsets() {
        let hdr = sample_header();
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf, &[]);

        assert_eq!(buf.len(), FIXED_HEADER_LEN);
        assert_eq!(buf[0], flags::ACK | flags::VER);
        assert_eq!(buf[1], (FIXED_HEADER_LEN / 2) as u8);
        assert_eq!(&buf[2..4], &4660u16.to_be_bytes());
        assert_eq!(&buf[4..6], &22136u16.to_be_bytes());
        assert_eq!(&buf[8..12], &0xDEAD_BEEFu32.to_be_bytes());
        assert_eq!(&buf[16..18], &7u16.to_be_bytes());
    }

    // ========================================================================
    // Validation failures
    // ========================================================================

    #[test]
    fn test_rejects_wrong_negotiated_hlen() {
        let hdr = sample_header();
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf, &[]);
        buf.extend_from_slice(b"hello");

        // Connection agreed on a 30-byte header (one mask word).
        assert_eq!(
            Segment::parse(&buf, Some(FIXED_HEADER_LEN + 4)),
            Err(ArdpError::InvalidData)
        );
    }

    #[test]
    fn test_rejects_missing_version_bit() {
        let mut hdr = sample_header();
        hdr.flags = flags::ACK;
        hdr.dlen = 0;
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf, &[]);

        assert_eq!(Segment::parse(&buf, None), Err(ArdpError::InvalidData));
    }

    #[test]
    fn test_rejects_dlen_disagreeing_with_datagram() {
        let hdr = sample_header(); // dlen = 5
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf, &[]);
        buf.extend_from_slice(b"hi");

        assert_eq!(Segment::parse(&buf, None), Err(ArdpError::InvalidData));
    }

    #[test]
    fn test_rejects_truncated_datagram() {
        assert_eq!(Segment::parse(&[0x42; 10], None), Err(ArdpError::InvalidData));
    }

    // ========================================================================
    // SYN segment
    // ========================================================================

    #[test]
    fn test_syn_round_trip_with_data() {
        let syn = SynSegment {
            flags: flags::SYN | flags::VER,
            src: 100,
            dst: 0,
            dlen: 5,
            seq: 42,
            ack: 0,
            segmax: 4,
            segbmax: 1024,
            options: OPT_SDM,
        };

        let mut buf = BytesMut::new();
        syn.encode(&mut buf);
        buf.extend_from_slice(b"hello");

        let (parsed, data) = SynSegment::parse(&buf).unwrap();
        assert_eq!(parsed, syn);
        assert_eq!(&data[..], b"hello");
    }

    #[test]
    fn test_syn_rejects_missing_sdm_option() {
        let syn = SynSegment {
            flags: flags::SYN | flags::VER,
            src: 100,
            dst: 0,
            dlen: 0,
            seq: 42,
            ack: 0,
            segmax: 4,
            segbmax: 1024,
            options: 0,
        };
        let mut buf = BytesMut::new();
        syn.encode(&mut buf);

        assert_eq!(SynSegment::parse(&buf), Err(ArdpError::InvalidData));
    }

    #[test]
    fn test_syn_rejects_missing_syn_flag() {
        let mut buf = BytesMut::new();
        let syn = SynSegment {
            flags: flags::VER,
            src: 1,
            dst: 2,
            dlen: 0,
            seq: 0,
            ack: 0,
            segmax: 1,
            segbmax: 1024,
            options: OPT_SDM,
        };
        syn.encode(&mut buf);
        assert_eq!(SynSegment::parse(&buf), Err(ArdpError::InvalidData));
    }

    // ========================================================================
    // Demux peeking
    // ========================================================================

    #[test]
    fn test_peek_ports() {
        let hdr = sample_header();
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf, &[]);
        buf.extend_from_slice(b"hello");

        assert_eq!(peek_ports(&buf), Some((22136, 4660)));
        assert_eq!(peek_ports(&buf[..4]), None);
    }

    #[test]
    fn test_peek_syn() {
        assert!(peek_syn(&[flags::SYN | flags::VER, 0, 0]));
        assert!(!peek_syn(&[flags::ACK | flags::VER]));
        assert!(!peek_syn(&[]));
    }
}
