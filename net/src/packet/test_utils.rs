// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Reference frames and checks shared by the unit tests.

#![allow(clippy::unwrap_used)]

use etherparse::{IpNumber, Ipv4Header, PacketBuilder, TcpHeader, UdpHeader};

pub fn tcp_frame() -> Vec<u8> {
    let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
        .tcp(1234, 80, 7, 4096);
    let payload = [0xAB; 11];
    let mut out = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut out, &payload).unwrap();
    out
}

/// A UDP frame carrying an 802.1Q tag with id 7.
pub fn tagged_udp_frame() -> Vec<u8> {
    let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
        .udp(53, 5353);
    let payload = [1, 2, 3, 4, 5];
    let mut out = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut out, &payload).unwrap();
    out.splice(12..12, [0x81, 0x00, 0x00, 0x07]);
    out
}

/// Verify the IPv4 header checksum and the TCP/UDP checksum (pseudo header included).
pub fn assert_checksums_valid(frame: &[u8], l3: usize) {
    let (ip, rest) = Ipv4Header::from_slice(&frame[l3..]).unwrap();
    assert_eq!(ip.header_checksum, ip.calc_header_checksum(), "ipv4 header checksum");
    let segment = &rest[..usize::from(ip.total_len) - ip.header_len()];
    match ip.protocol {
        IpNumber::TCP => {
            let (tcp, payload) = TcpHeader::from_slice(segment).unwrap();
            let expected = tcp.calc_checksum_ipv4(&ip, payload).unwrap();
            assert_eq!(tcp.checksum, expected, "tcp checksum");
        }
        IpNumber::UDP => {
            let (udp, payload) = UdpHeader::from_slice(segment).unwrap();
            if udp.checksum != 0 {
                let expected = udp.calc_checksum_ipv4(&ip, payload).unwrap();
                assert_eq!(udp.checksum, expected, "udp checksum");
            }
        }
        _ => {}
    }
}
