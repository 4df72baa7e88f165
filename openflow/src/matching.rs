// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The 48 byte match structure, carried as a [`FlowKey`].

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut};
use net::eth::{EthType, Mac};
use net::flow_key::{FlowKey, Wildcards};
use net::mpls::MplsLabel;
use net::port::PortNo;

use crate::error::DecodeError;

/// Match size on the wire.
pub const MATCH_LEN: usize = 48;

fn get_mac(buf: &mut impl Buf) -> Mac {
    let mut mac = [0u8; 6];
    buf.copy_to_slice(&mut mac);
    Mac(mac)
}

/// Read a match. The key is returned as sent; callers normalize it.
///
/// Unknown wildcard bits are dropped.
///
/// # Errors
///
/// Fails with [`DecodeError::BadLen`] if fewer than 48 bytes remain.
pub fn decode(buf: &mut impl Buf) -> Result<FlowKey, DecodeError> {
    if buf.remaining() < MATCH_LEN {
        return Err(DecodeError::BadLen(buf.remaining()));
    }
    let wildcards = Wildcards::from_bits_truncate(buf.get_u32());
    let in_port = PortNo(buf.get_u32());
    let dl_src = get_mac(buf);
    let dl_dst = get_mac(buf);
    let dl_vlan = buf.get_u16();
    let dl_type = EthType::new(buf.get_u16());
    let nw_proto = buf.get_u8();
    buf.advance(3);
    Ok(FlowKey {
        wildcards,
        in_port,
        dl_vlan,
        dl_src,
        dl_dst,
        dl_type,
        nw_proto,
        nw_src: Ipv4Addr::from(buf.get_u32()),
        nw_dst: Ipv4Addr::from(buf.get_u32()),
        tp_src: buf.get_u16(),
        tp_dst: buf.get_u16(),
        mpls_label1: MplsLabel(buf.get_u32()),
        mpls_label2: MplsLabel(buf.get_u32()),
    })
}

/// Write `key` as a match.
pub fn encode(key: &FlowKey, out: &mut impl BufMut) {
    out.put_u32(key.wildcards.bits());
    out.put_u32(key.in_port.0);
    out.put_slice(&key.dl_src.0);
    out.put_slice(&key.dl_dst.0);
    out.put_u16(key.dl_vlan);
    out.put_u16(key.dl_type.raw());
    out.put_u8(key.nw_proto);
    out.put_bytes(0, 3);
    out.put_u32(u32::from(key.nw_src));
    out.put_u32(u32::from(key.nw_dst));
    out.put_u16(key.tp_src);
    out.put_u16(key.tp_dst);
    out.put_u32(key.mpls_label1.0);
    out.put_u32(key.mpls_label2.0);
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn layout_matches_wire_offsets() {
        let key = FlowKey {
            wildcards: Wildcards::DL_VLAN.with_nw_dst_bits(8),
            in_port: PortNo(3),
            dl_src: Mac([2, 0, 0, 0, 0, 1]),
            dl_dst: Mac([2, 0, 0, 0, 0, 2]),
            dl_type: EthType::IPV4,
            nw_proto: 6,
            nw_src: Ipv4Addr::new(10, 0, 0, 1),
            nw_dst: Ipv4Addr::new(10, 0, 1, 0),
            tp_src: 1234,
            tp_dst: 80,
            ..FlowKey::default()
        };
        let mut raw = Vec::new();
        encode(&key, &mut raw);
        assert_eq!(raw.len(), MATCH_LEN);
        assert_eq!(&raw[4..8], &[0, 0, 0, 3]);
        assert_eq!(&raw[22..24], &[0x08, 0x00]);
        assert_eq!(raw[24], 6);
        assert_eq!(&raw[28..32], &[10, 0, 0, 1]);
        assert_eq!(&raw[36..38], &1234u16.to_be_bytes());
        assert_eq!(&raw[40..44], &[0xff; 4]);
        assert_eq!(decode(&mut raw.as_slice()).unwrap(), key);
    }

    #[test]
    fn short_match_is_rejected() {
        let raw = [0u8; MATCH_LEN - 1];
        assert_eq!(
            decode(&mut raw.as_slice()),
            Err(DecodeError::BadLen(MATCH_LEN - 1))
        );
    }

    #[test]
    fn unknown_wildcard_bits_are_dropped() {
        let mut raw = vec![0u8; MATCH_LEN];
        raw[..4].copy_from_slice(&u32::MAX.to_be_bytes());
        let key = decode(&mut raw.as_slice()).unwrap();
        assert_eq!(key.wildcards, Wildcards::ALL);
    }
}
