//! Hand-built IPv4/UDP framing for the link-layer transport.

use bytes::{BufMut, BytesMut};
use std::net::{Ipv4Addr, SocketAddrV4};

pub const MIN_IP_HEADER_LEN: usize = 20;
pub const MAX_IP_HEADER_LEN: usize = 60;
pub const UDP_HEADER_LEN: usize = 8;
pub const IP_PROTO_UDP: u8 = 17;
/// Largest payload whose lengths fit the 16-bit IPv4 and UDP length fields.
pub const MAX_UDP_PAYLOAD: usize = u16::MAX as usize - MIN_IP_HEADER_LEN - UDP_HEADER_LEN;

const IP_VERSION_IHL: u8 = 0x45;
const TTL: u8 = 16;

/// Ones' complement sum of the 16-bit words in `data`, inverted.
///
/// Over a header whose checksum field holds the value returned here the
/// result is zero.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = words.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum = (sum >> 16) + (sum & 0xffff);
    sum += sum >> 16;
    !(sum as u16)
}

/// Wraps `payload` in a 20-byte IPv4 header and an 8-byte UDP header.
///
/// The UDP checksum is left at zero, which IPv4 permits. Returns `None`
/// when `payload` is longer than [`MAX_UDP_PAYLOAD`].
pub fn encode(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    identification: u8,
    payload: &[u8],
) -> Option<BytesMut> {
    if payload.len() > MAX_UDP_PAYLOAD {
        return None;
    }
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = MIN_IP_HEADER_LEN + udp_len;
    let mut frame = BytesMut::with_capacity(total_len);

    frame.put_u8(IP_VERSION_IHL);
    frame.put_u8(0); // tos
    frame.put_u16(total_len as u16);
    frame.put_u8(identification);
    frame.put_u8(0);
    frame.put_u16(0); // flags + fragment offset
    frame.put_u8(TTL);
    frame.put_u8(IP_PROTO_UDP);
    frame.put_u16(0); // checksum, filled below
    frame.put_slice(&src.ip().octets());
    frame.put_slice(&dst.ip().octets());

    let sum = checksum(&frame[..MIN_IP_HEADER_LEN]);
    frame[10..12].copy_from_slice(&sum.to_be_bytes());

    frame.put_u16(src.port());
    frame.put_u16(dst.port());
    frame.put_u16(udp_len as u16);
    frame.put_u16(0);

    frame.put_slice(payload);
    Some(frame)
}

/// A datagram located inside a received IPv4 frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Datagram {
    pub source: SocketAddrV4,
    pub dest_port: u16,
    pub protocol: u8,
    /// Offset of the UDP payload in the frame.
    pub offset: usize,
    /// Payload length as far as the frame actually carries it.
    pub len: usize,
}

/// Locates the UDP payload in `frame`. Returns `None` for frames too short
/// to hold the headers they declare.
pub fn parse(frame: &[u8]) -> Option<Datagram> {
    if frame.len() < MIN_IP_HEADER_LEN || frame[0] >> 4 != 4 {
        return None;
    }
    let ihl = usize::from(frame[0] & 0x0f) * 4;
    if ihl < MIN_IP_HEADER_LEN || frame.len() < ihl + UDP_HEADER_LEN {
        return None;
    }

    let ip = Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]);
    let udp = &frame[ihl..ihl + UDP_HEADER_LEN];
    let src_port = u16::from_be_bytes([udp[0], udp[1]]);
    let dest_port = u16::from_be_bytes([udp[2], udp[3]]);
    let udp_len = usize::from(u16::from_be_bytes([udp[4], udp[5]]));

    let offset = ihl + UDP_HEADER_LEN;
    let available = frame.len() - offset;
    let len = match udp_len.checked_sub(UDP_HEADER_LEN) {
        Some(declared) if declared <= available => declared,
        _ => available,
    };

    Some(Datagram {
        source: SocketAddrV4::new(ip, src_port),
        dest_port,
        protocol: frame[9],
        offset,
        len,
    })
}

/// Copies the UDP payload of `frame` into `buf`, bounded by `buf.len()`.
pub fn decode(frame: &[u8], buf: &mut [u8]) -> Option<(usize, SocketAddrV4)> {
    let datagram = parse(frame)?;
    let n = datagram.len.min(buf.len());
    buf[..n].copy_from_slice(&frame[datagram.offset..datagram.offset + n]);
    Some((n, datagram.source))
}
