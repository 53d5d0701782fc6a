//! Raw IP packet inspection.

use std::net::Ipv4Addr;

const IPV4_HEADER_LEN: usize = 20;

/// True when the first nibble carries an IP version number (4 or 6).
pub fn is_ip(buf: &[u8]) -> bool {
    match buf.first() {
        Some(b) => matches!(b >> 4, 4 | 6),
        None => false,
    }
}

/// IP version nibble, if the buffer is non-empty.
pub fn version(buf: &[u8]) -> Option<u8> {
    buf.first().map(|b| b >> 4)
}

/// IPv4 destination address, bytes 16-19 of the header.
pub fn ipv4_dst(buf: &[u8]) -> Option<Ipv4Addr> {
    if version(buf) != Some(4) || buf.len() < IPV4_HEADER_LEN {
        return None;
    }
    Some(Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]))
}

/// IPv4 source address, bytes 12-15 of the header.
pub fn ipv4_src(buf: &[u8]) -> Option<Ipv4Addr> {
    if version(buf) != Some(4) || buf.len() < IPV4_HEADER_LEN {
        return None;
    }
    Some(Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]))
}

/// Builds a minimal IPv4/UDP-shaped packet; used by tests and loopback
/// probes, never emitted on a real tunnel.
pub fn fake_ipv4(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total = IPV4_HEADER_LEN + payload.len();
    let mut pkt = vec![0u8; total];
    pkt[0] = 0x45;
    pkt[2] = (total >> 8) as u8;
    pkt[3] = total as u8;
    pkt[8] = 64;
    pkt[9] = 17;
    pkt[12..16].copy_from_slice(&src.octets());
    pkt[16..20].copy_from_slice(&dst.octets());
    pkt[IPV4_HEADER_LEN..].copy_from_slice(payload);
    pkt
}
