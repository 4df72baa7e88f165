// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flow keys: the header fields a flow entry matches on, and their extraction from frames.

use crate::buffer::PacketBufferMut;
use crate::eth::{EthType, LLC_SNAP_LEN, Mac, VLAN_NONE};
use crate::mpls::{LABEL_LEN, LabelWord, MplsLabel};
use crate::packet::{Layers, Packet, Transport};
use crate::port::PortNo;
use bitflags::bitflags;
use etherparse::{
    Ethernet2Header, Icmpv4Slice, IpNumber, Ipv4Header, SingleVlanHeader, TcpHeader, UdpHeader,
};
use std::fmt::Display;
use std::net::Ipv4Addr;
use tracing::debug;

bitflags! {
    /// Fields of a [`FlowKey`] which are "don't care".
    ///
    /// The IPv4 source and destination carry a count of wildcarded low-order bits in a 6-bit
    /// field instead of a single bit; counts of 32 and above wildcard the whole address.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Wildcards: u32 {
        /// Ingress port.
        const IN_PORT = 1 << 0;
        /// VLAN id.
        const DL_VLAN = 1 << 1;
        /// Ethernet source address.
        const DL_SRC = 1 << 2;
        /// Ethernet destination address.
        const DL_DST = 1 << 3;
        /// Ethernet frame type.
        const DL_TYPE = 1 << 4;
        /// IP protocol.
        const NW_PROTO = 1 << 5;
        /// TCP/UDP source port (ICMP type).
        const TP_SRC = 1 << 6;
        /// TCP/UDP destination port (ICMP code).
        const TP_DST = 1 << 7;
        /// IPv4 source wildcarded-bit count.
        const NW_SRC_MASK = 0x3F << 8;
        /// IPv4 source fully wildcarded.
        const NW_SRC_ALL = 32 << 8;
        /// IPv4 destination wildcarded-bit count.
        const NW_DST_MASK = 0x3F << 14;
        /// IPv4 destination fully wildcarded.
        const NW_DST_ALL = 32 << 14;
        /// Top MPLS label.
        const MPLS_L1 = 1 << 20;
        /// Second MPLS label.
        const MPLS_L2 = 1 << 21;
        /// Every field.
        const ALL = (1 << 22) - 1;
    }
}

impl Wildcards {
    const NW_SRC_SHIFT: u32 = 8;
    const NW_DST_SHIFT: u32 = 14;
    /// The single-bit wildcards.
    pub const SINGLE_BITS: Wildcards = Wildcards::IN_PORT
        .union(Wildcards::DL_VLAN)
        .union(Wildcards::DL_SRC)
        .union(Wildcards::DL_DST)
        .union(Wildcards::DL_TYPE)
        .union(Wildcards::NW_PROTO)
        .union(Wildcards::TP_SRC)
        .union(Wildcards::TP_DST)
        .union(Wildcards::MPLS_L1)
        .union(Wildcards::MPLS_L2);

    /// Number of wildcarded low-order bits of the IPv4 source (0..=32).
    #[must_use]
    pub fn nw_src_bits(self) -> u32 {
        ((self.bits() & Self::NW_SRC_MASK.bits()) >> Self::NW_SRC_SHIFT).min(32)
    }

    /// Number of wildcarded low-order bits of the IPv4 destination (0..=32).
    #[must_use]
    pub fn nw_dst_bits(self) -> u32 {
        ((self.bits() & Self::NW_DST_MASK.bits()) >> Self::NW_DST_SHIFT).min(32)
    }

    /// These wildcards with `bits` (clamped to 32) wildcarded bits of IPv4 source.
    #[must_use]
    pub fn with_nw_src_bits(self, bits: u32) -> Wildcards {
        let cleared = self.difference(Self::NW_SRC_MASK).bits();
        Wildcards::from_bits_retain(cleared | (bits.min(32) << Self::NW_SRC_SHIFT))
    }

    /// These wildcards with `bits` (clamped to 32) wildcarded bits of IPv4 destination.
    #[must_use]
    pub fn with_nw_dst_bits(self, bits: u32) -> Wildcards {
        let cleared = self.difference(Self::NW_DST_MASK).bits();
        Wildcards::from_bits_retain(cleared | (bits.min(32) << Self::NW_DST_SHIFT))
    }

    /// Netmask of the matched part of the IPv4 source.
    #[must_use]
    pub fn nw_src_mask(self) -> u32 {
        prefix_mask(self.nw_src_bits())
    }

    /// Netmask of the matched part of the IPv4 destination.
    #[must_use]
    pub fn nw_dst_mask(self) -> u32 {
        prefix_mask(self.nw_dst_bits())
    }

    /// How much these wildcards leave unmatched: one per single-bit wildcard plus the
    /// wildcarded bits of each IPv4 address. Fewer is more specific.
    #[must_use]
    pub fn weight(self) -> u32 {
        self.intersection(Self::SINGLE_BITS).bits().count_ones()
            + self.nw_src_bits()
            + self.nw_dst_bits()
    }

    /// The looser of two wildcard sets: every single bit of either, and the larger count of
    /// wildcarded address bits.
    #[must_use]
    pub fn loosest(self, other: Wildcards) -> Wildcards {
        self.union(other)
            .intersection(Self::SINGLE_BITS)
            .with_nw_src_bits(self.nw_src_bits().max(other.nw_src_bits()))
            .with_nw_dst_bits(self.nw_dst_bits().max(other.nw_dst_bits()))
    }
}

fn prefix_mask(wild_bits: u32) -> u32 {
    if wild_bits >= 32 {
        0
    } else {
        u32::MAX << wild_bits
    }
}

/// The header fields a flow entry matches on.
///
/// A key extracted from a packet has no wildcards. A key stored in the flow table has been
/// [normalized](FlowKey::normalize).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Which fields are "don't care".
    pub wildcards: Wildcards,
    /// Ingress port.
    pub in_port: PortNo,
    /// VLAN id, [`VLAN_NONE`] for untagged frames.
    pub dl_vlan: u16,
    /// Ethernet source address.
    pub dl_src: Mac,
    /// Ethernet destination address.
    pub dl_dst: Mac,
    /// Ethernet frame type (the innermost one, after any 802.1Q tag).
    pub dl_type: EthType,
    /// IP protocol.
    pub nw_proto: u8,
    /// IPv4 source address.
    pub nw_src: Ipv4Addr,
    /// IPv4 destination address.
    pub nw_dst: Ipv4Addr,
    /// TCP/UDP source port, or ICMP type.
    pub tp_src: u16,
    /// TCP/UDP destination port, or ICMP code.
    pub tp_dst: u16,
    /// Top MPLS label.
    pub mpls_label1: MplsLabel,
    /// Second MPLS label.
    pub mpls_label2: MplsLabel,
}

impl Default for FlowKey {
    fn default() -> Self {
        FlowKey {
            wildcards: Wildcards::empty(),
            in_port: PortNo::default(),
            dl_vlan: VLAN_NONE,
            dl_src: Mac::ZERO,
            dl_dst: Mac::ZERO,
            dl_type: EthType::default(),
            nw_proto: 0,
            nw_src: Ipv4Addr::UNSPECIFIED,
            nw_dst: Ipv4Addr::UNSPECIFIED,
            tp_src: 0,
            tp_dst: 0,
            mpls_label1: MplsLabel::INVALID,
            mpls_label2: MplsLabel::INVALID,
        }
    }
}

impl FlowKey {
    /// True if no field is wildcarded.
    #[must_use]
    pub fn is_exact(&self) -> bool {
        self.wildcards.is_empty()
    }

    fn masked_nw_src(&self, mask: u32) -> u32 {
        u32::from(self.nw_src) & mask
    }

    fn masked_nw_dst(&self, mask: u32) -> u32 {
        u32::from(self.nw_dst) & mask
    }

    /// Bring the key into canonical form so that rules with the same meaning compare equal.
    ///
    /// * a wildcarded frame type wildcards every network, transport and label field;
    /// * an MPLS frame type wildcards every network and transport field;
    /// * any other frame type matches on unlabeled packets only;
    /// * wildcarded fields are zeroed and addresses are masked to their prefix.
    pub fn normalize(&mut self) {
        let transport = Wildcards::NW_PROTO | Wildcards::TP_SRC | Wildcards::TP_DST;
        let mut w = self.wildcards.intersection(Wildcards::ALL);
        if w.contains(Wildcards::DL_TYPE) {
            w = w
                .union(transport)
                .union(Wildcards::MPLS_L1 | Wildcards::MPLS_L2)
                .with_nw_src_bits(32)
                .with_nw_dst_bits(32);
        } else if self.dl_type.is_mpls() {
            w = w.union(transport).with_nw_src_bits(32).with_nw_dst_bits(32);
        } else {
            w = w.difference(Wildcards::MPLS_L1 | Wildcards::MPLS_L2);
            self.mpls_label1 = MplsLabel::INVALID;
            self.mpls_label2 = MplsLabel::INVALID;
        }
        // canonical encoding of the address counts
        w = w
            .with_nw_src_bits(w.nw_src_bits())
            .with_nw_dst_bits(w.nw_dst_bits());
        self.wildcards = w;

        if w.contains(Wildcards::IN_PORT) {
            self.in_port = PortNo(0);
        }
        if w.contains(Wildcards::DL_VLAN) {
            self.dl_vlan = 0;
        }
        if w.contains(Wildcards::DL_SRC) {
            self.dl_src = Mac::ZERO;
        }
        if w.contains(Wildcards::DL_DST) {
            self.dl_dst = Mac::ZERO;
        }
        if w.contains(Wildcards::DL_TYPE) {
            self.dl_type = EthType::new(0);
        }
        if w.contains(Wildcards::NW_PROTO) {
            self.nw_proto = 0;
        }
        if w.contains(Wildcards::TP_SRC) {
            self.tp_src = 0;
        }
        if w.contains(Wildcards::TP_DST) {
            self.tp_dst = 0;
        }
        if w.contains(Wildcards::MPLS_L1) {
            self.mpls_label1 = MplsLabel(0);
        }
        if w.contains(Wildcards::MPLS_L2) {
            self.mpls_label2 = MplsLabel(0);
        }
        self.nw_src = Ipv4Addr::from(self.masked_nw_src(w.nw_src_mask()));
        self.nw_dst = Ipv4Addr::from(self.masked_nw_dst(w.nw_dst_mask()));
    }

    /// This key, [normalized](FlowKey::normalize).
    #[must_use]
    pub fn normalized(mut self) -> FlowKey {
        self.normalize();
        self
    }

    /// Compare two keys on the fields not wildcarded by `w`.
    fn equal_under(&self, other: &FlowKey, w: Wildcards) -> bool {
        let src_mask = w.nw_src_mask();
        let dst_mask = w.nw_dst_mask();
        (w.contains(Wildcards::IN_PORT) || self.in_port == other.in_port)
            && (w.contains(Wildcards::DL_VLAN) || self.dl_vlan == other.dl_vlan)
            && (w.contains(Wildcards::DL_SRC) || self.dl_src == other.dl_src)
            && (w.contains(Wildcards::DL_DST) || self.dl_dst == other.dl_dst)
            && (w.contains(Wildcards::DL_TYPE) || self.dl_type == other.dl_type)
            && (w.contains(Wildcards::NW_PROTO) || self.nw_proto == other.nw_proto)
            && (w.contains(Wildcards::TP_SRC) || self.tp_src == other.tp_src)
            && (w.contains(Wildcards::TP_DST) || self.tp_dst == other.tp_dst)
            && (w.contains(Wildcards::MPLS_L1) || self.mpls_label1 == other.mpls_label1)
            && (w.contains(Wildcards::MPLS_L2) || self.mpls_label2 == other.mpls_label2)
            && self.masked_nw_src(src_mask) == other.masked_nw_src(src_mask)
            && self.masked_nw_dst(dst_mask) == other.masked_nw_dst(dst_mask)
    }

    /// True if `self` (typically a packet key) matches `rule` modulo the rule's wildcards.
    #[must_use]
    pub fn matches_1wild(&self, rule: &FlowKey) -> bool {
        self.equal_under(rule, rule.wildcards)
    }

    /// True if the two keys agree modulo the union of their wildcards (and the shorter of
    /// each address prefix), i.e. some packet could match both.
    #[must_use]
    pub fn matches_2wild(&self, other: &FlowKey) -> bool {
        self.equal_under(other, self.wildcards.loosest(other.wildcards))
    }
}

impl Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let w = self.wildcards;
        write!(f, "in_port={}", self.in_port)?;
        if !w.contains(Wildcards::DL_VLAN) && self.dl_vlan != VLAN_NONE {
            write!(f, " vlan={}", self.dl_vlan)?;
        }
        if !w.contains(Wildcards::DL_SRC) {
            write!(f, " dl_src={}", self.dl_src)?;
        }
        if !w.contains(Wildcards::DL_DST) {
            write!(f, " dl_dst={}", self.dl_dst)?;
        }
        if !w.contains(Wildcards::DL_TYPE) {
            write!(f, " dl_type={}", self.dl_type)?;
        }
        if self.mpls_label1.is_valid() {
            write!(f, " mpls={}/{}", self.mpls_label1, self.mpls_label2)?;
        }
        if w.nw_src_bits() < 32 {
            write!(f, " nw_src={}/{}", self.nw_src, 32 - w.nw_src_bits())?;
        }
        if w.nw_dst_bits() < 32 {
            write!(f, " nw_dst={}/{}", self.nw_dst, 32 - w.nw_dst_bits())?;
        }
        if !w.contains(Wildcards::NW_PROTO) && self.nw_proto != 0 {
            write!(f, " proto={}", self.nw_proto)?;
        }
        if !w.contains(Wildcards::TP_SRC) || !w.contains(Wildcards::TP_DST) {
            write!(f, " tp={}->{}", self.tp_src, self.tp_dst)?;
        }
        Ok(())
    }
}

#[allow(clippy::cast_possible_truncation)] // frame offsets fit in u16
fn off16(off: usize) -> u16 {
    off as u16
}

/// The ethertype carried by an 802.3 frame: only LLC + SNAP with a zero OUI carries one.
fn llc_snap_type(payload: &[u8]) -> Option<u16> {
    match payload.get(..LLC_SNAP_LEN)? {
        [0xAA, 0xAA, 0x03, 0, 0, 0, t0, t1] => Some(u16::from_be_bytes([*t0, *t1])),
        _ => None,
    }
}

/// Parse the link layer. Returns the offset just past the innermost ethertype field.
fn extract_l2(data: &[u8], key: &mut FlowKey, layers: &mut Layers) -> Option<usize> {
    let (eth, rest) = Ethernet2Header::from_slice(data).ok()?;
    key.dl_dst = Mac(eth.destination);
    key.dl_src = Mac(eth.source);
    let mut off = Ethernet2Header::LEN;
    let mut eth_type = eth.ether_type.0;
    if eth_type < EthType::MIN_ETH_TYPE {
        eth_type = match llc_snap_type(rest) {
            Some(inner) => {
                off += LLC_SNAP_LEN;
                inner
            }
            None => EthType::NOT_ETH_TYPE.raw(),
        };
    }
    if eth_type == EthType::VLAN.raw() {
        let (tag, _) = SingleVlanHeader::from_slice(data.get(off..)?).ok()?;
        key.dl_vlan = tag.vlan_id.value();
        layers.vlan = Some(off16(off - 2));
        off += SingleVlanHeader::LEN;
        eth_type = tag.ether_type.0;
    }
    key.dl_type = EthType::new(eth_type);
    layers.l2_end = off16(off);
    Some(off)
}

/// Parse the label stack starting at `off`. Returns the offset of the payload.
fn extract_mpls(data: &[u8], off: usize, key: &mut FlowKey, layers: &mut Layers) -> Option<usize> {
    layers.mpls = Some(off16(off));
    let mut off = off;
    let mut depth = 0;
    loop {
        let bytes = data.get(off..off + LABEL_LEN as usize)?;
        let word = LabelWord(u32::from_be_bytes(bytes.try_into().ok()?));
        match depth {
            0 => key.mpls_label1 = MplsLabel(word.label()),
            1 => key.mpls_label2 = MplsLabel(word.label()),
            _ => {}
        }
        depth += 1;
        off += LABEL_LEN as usize;
        if word.bos() {
            return Some(off);
        }
    }
}

/// Parse an IPv4 header at `off`. Returns the fragment flag.
fn extract_ipv4(data: &[u8], off: usize, key: &mut FlowKey, layers: &mut Layers) -> Option<bool> {
    let (ip, rest) = Ipv4Header::from_slice(data.get(off..)?).ok()?;
    layers.l3 = Some(off16(off));
    key.nw_proto = ip.protocol.0;
    key.nw_src = Ipv4Addr::from(ip.source);
    key.nw_dst = Ipv4Addr::from(ip.destination);
    if ip.more_fragments || ip.fragment_offset.value() != 0 {
        return Some(true);
    }

    let transport = match ip.protocol {
        IpNumber::TCP => TcpHeader::from_slice(rest).ok().map(|(tcp, _)| {
            key.tp_src = tcp.source_port;
            key.tp_dst = tcp.destination_port;
            Transport::Tcp
        }),
        IpNumber::UDP => UdpHeader::from_slice(rest).ok().map(|(udp, _)| {
            key.tp_src = udp.source_port;
            key.tp_dst = udp.destination_port;
            Transport::Udp
        }),
        IpNumber::ICMP => Icmpv4Slice::from_slice(rest).ok().map(|icmp| {
            key.tp_src = u16::from(icmp.type_u8());
            key.tp_dst = u16::from(icmp.code_u8());
            Transport::Icmp
        }),
        _ => None,
    };
    layers.l4 = transport.map(|t| (off16(off + ip.header_len()), t));
    Some(false)
}

/// Build the flow key of `packet` (received on `packet.meta.in_port`) and record its layers.
///
/// Returns the key and whether the packet is an IPv4 fragment. Extraction never fails: a
/// short or malformed header leaves the remaining fields at their defaults.
pub fn extract<Buf: PacketBufferMut>(packet: &mut Packet<Buf>) -> (FlowKey, bool) {
    let mut key = FlowKey {
        in_port: packet.meta.in_port,
        ..FlowKey::default()
    };
    let mut layers = Layers::default();
    let data = packet.data();
    if data.len() < Ethernet2Header::LEN {
        debug!(
            "frame of {} bytes on port {} is shorter than an ethernet header",
            data.len(),
            key.in_port
        );
    }
    let mut is_fragment = false;
    if let Some(mut off) = extract_l2(data, &mut key, &mut layers) {
        let mut payload_ipv4 = key.dl_type == EthType::IPV4;
        if key.dl_type.is_mpls() {
            // the payload of a label stack is assumed to be IPv4
            match extract_mpls(data, off, &mut key, &mut layers) {
                Some(payload) => {
                    off = payload;
                    payload_ipv4 = true;
                }
                None => payload_ipv4 = false,
            }
        }
        if payload_ipv4 {
            is_fragment = extract_ipv4(data, off, &mut key, &mut layers).unwrap_or(false);
        }
    }
    *packet.layers_mut() = layers;
    (key, is_fragment)
}
