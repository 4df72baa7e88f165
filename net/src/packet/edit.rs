// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! In-place header rewrites.
//!
//! Each rewrite parses the header at the offset recorded by extraction, changes the field,
//! folds the changed words into the affected checksums and writes the header back.

use crate::buffer::PacketBufferMut;
use crate::checksum;
use crate::eth::{ETH_TYPE_OFFSET, Mac, VLAN_TAG_LEN};
use crate::packet::{EditError, Packet, Transport};
use etherparse::{
    EtherType, Ethernet2Header, IpDscp, IpEcn, Ipv4Header, SingleVlanHeader, TcpHeader,
    UdpHeader, VlanId, VlanPcp,
};
use std::net::Ipv4Addr;
use tracing::trace;

#[allow(clippy::cast_possible_truncation)] // VLAN_TAG_LEN is 4
const TAG_LEN: u16 = VLAN_TAG_LEN as u16;

/// The source and destination addresses, as the pseudo header carries them.
fn pseudo_addresses(ip: &Ipv4Header) -> [u8; 8] {
    let mut addrs = [0; 8];
    addrs[..4].copy_from_slice(&ip.source);
    addrs[4..].copy_from_slice(&ip.destination);
    addrs
}

/// The type of service byte of an IPv4 header.
fn tos(ip: &Ipv4Header) -> u8 {
    (ip.dscp.value() << 2) | ip.ecn.value()
}

impl<Buf: PacketBufferMut> Packet<Buf> {
    fn rewrite_eth(&mut self, edit: impl FnOnce(&mut Ethernet2Header)) -> Result<(), EditError> {
        let (mut eth, _) =
            Ethernet2Header::from_slice(self.data()).map_err(|_| EditError::TooShort(0))?;
        edit(&mut eth);
        self.write_bytes(0, &eth.to_bytes())
    }

    /// Rewrite the source link-layer address.
    ///
    /// # Errors
    ///
    /// Fails if the frame is shorter than an ethernet header.
    pub fn set_dl_src(&mut self, mac: Mac) -> Result<(), EditError> {
        self.rewrite_eth(|eth| eth.source = mac.0)
    }

    /// Rewrite the destination link-layer address.
    ///
    /// # Errors
    ///
    /// Fails if the frame is shorter than an ethernet header.
    pub fn set_dl_dst(&mut self, mac: Mac) -> Result<(), EditError> {
        self.rewrite_eth(|eth| eth.destination = mac.0)
    }

    /// The 802.1Q tag (priority, id and inner ethertype), if the frame is tagged.
    #[must_use]
    pub fn vlan_tag(&self) -> Option<SingleVlanHeader> {
        let at = usize::from(self.layers().vlan?) + 2;
        let (tag, _) = SingleVlanHeader::from_slice(self.data().get(at..)?).ok()?;
        Some(tag)
    }

    fn write_vlan_tag(&mut self, tag: &SingleVlanHeader) -> Result<(), EditError> {
        let vlan = self.layers().vlan.ok_or(EditError::TooShort(ETH_TYPE_OFFSET))?;
        self.write_bytes(usize::from(vlan) + 2, &tag.to_bytes())
    }

    /// Insert an 802.1Q tag after the link-layer addresses.
    fn push_vlan(&mut self, pcp: VlanPcp, vlan_id: VlanId) -> Result<(), EditError> {
        let (mut eth, _) =
            Ethernet2Header::from_slice(self.data()).map_err(|_| EditError::TooShort(0))?;
        let tag = SingleVlanHeader {
            pcp,
            drop_eligible_indicator: false,
            vlan_id,
            ether_type: eth.ether_type,
        };
        eth.ether_type = EtherType::VLAN_TAGGED_FRAME;
        self.insert_gap(ETH_TYPE_OFFSET, TAG_LEN)?;
        self.write_bytes(0, &eth.to_bytes())?;
        self.write_bytes(Ethernet2Header::LEN, &tag.to_bytes())?;
        #[allow(clippy::cast_possible_truncation)] // constant offset
        let at = ETH_TYPE_OFFSET as u16;
        let layers = self.layers_mut();
        layers.shift_from(at, i32::from(TAG_LEN));
        layers.vlan = Some(at);
        trace!("pushed 802.1Q tag: pcp {} vid {}", pcp.value(), vlan_id.value());
        Ok(())
    }

    /// Set the VLAN id, tagging the frame (priority 0) if it is untagged.
    ///
    /// # Errors
    ///
    /// Fails if `vid` does not fit in 12 bits, or if a tag has to be inserted and there is no
    /// headroom left.
    pub fn set_vlan_vid(&mut self, vid: u16) -> Result<(), EditError> {
        let vlan_id = VlanId::try_new(vid).map_err(|_| EditError::OutOfRange("vlan id"))?;
        match self.vlan_tag() {
            Some(mut tag) => {
                tag.vlan_id = vlan_id;
                self.write_vlan_tag(&tag)
            }
            None => {
                let pcp = VlanPcp::try_new(0).map_err(|_| EditError::OutOfRange("vlan pcp"))?;
                self.push_vlan(pcp, vlan_id)
            }
        }
    }

    /// Set the VLAN priority, tagging the frame (id 0) if it is untagged.
    ///
    /// # Errors
    ///
    /// Fails if `pcp` does not fit in 3 bits, or if a tag has to be inserted and there is no
    /// headroom left.
    pub fn set_vlan_pcp(&mut self, pcp: u8) -> Result<(), EditError> {
        let pcp = VlanPcp::try_new(pcp).map_err(|_| EditError::OutOfRange("vlan pcp"))?;
        match self.vlan_tag() {
            Some(mut tag) => {
                tag.pcp = pcp;
                self.write_vlan_tag(&tag)
            }
            None => {
                let vlan_id = VlanId::try_new(0).map_err(|_| EditError::OutOfRange("vlan id"))?;
                self.push_vlan(pcp, vlan_id)
            }
        }
    }

    /// Remove the 802.1Q tag. Untagged frames are left alone.
    ///
    /// # Errors
    ///
    /// Fails if the recorded tag lies outside the frame.
    pub fn strip_vlan(&mut self) -> Result<(), EditError> {
        let Some(vlan) = self.layers().vlan else {
            return Ok(());
        };
        self.remove_gap(usize::from(vlan), TAG_LEN)?;
        let layers = self.layers_mut();
        layers.vlan = None;
        layers.shift_from(vlan + TAG_LEN, -i32::from(TAG_LEN));
        Ok(())
    }

    /// The IPv4 header found by extraction, with its offset.
    fn ipv4_header(&self) -> Result<Option<(usize, Ipv4Header)>, EditError> {
        let Some(l3) = self.layers().l3 else {
            return Ok(None);
        };
        let l3 = usize::from(l3);
        let bytes = self.data().get(l3..).ok_or(EditError::TooShort(l3))?;
        let (ip, _) = Ipv4Header::from_slice(bytes).map_err(|_| EditError::Malformed(l3))?;
        Ok(Some((l3, ip)))
    }

    /// Change the IPv4 header, then update its checksum and, if an address changed, the
    /// transport checksum.
    fn rewrite_ipv4(&mut self, edit: impl FnOnce(&mut Ipv4Header)) -> Result<(), EditError> {
        let Some((l3, mut ip)) = self.ipv4_header()? else {
            return Ok(());
        };
        let before = ip.to_bytes();
        let old_addrs = pseudo_addresses(&ip);
        edit(&mut ip);
        ip.header_checksum = checksum::update_bytes(ip.header_checksum, &before, &ip.to_bytes());
        self.write_bytes(l3, &ip.to_bytes())?;
        let new_addrs = pseudo_addresses(&ip);
        if old_addrs != new_addrs {
            // the transport checksum covers the addresses through the pseudo header
            self.rewrite_transport((&old_addrs, &new_addrs), None, None)?;
        }
        Ok(())
    }

    /// Set the given TCP/UDP ports and update the transport checksum for them and for the
    /// pseudo header change `addrs` (old, new).
    ///
    /// A UDP checksum of zero means "none" and stays zero.
    fn rewrite_transport(
        &mut self,
        addrs: (&[u8], &[u8]),
        src: Option<u16>,
        dst: Option<u16>,
    ) -> Result<(), EditError> {
        let Some((l4, kind)) = self.layers().l4 else {
            return Ok(());
        };
        let l4 = usize::from(l4);
        let segment = self.data().get(l4..).ok_or(EditError::TooShort(l4))?;
        match kind {
            Transport::Tcp => {
                let (mut tcp, _) =
                    TcpHeader::from_slice(segment).map_err(|_| EditError::Malformed(l4))?;
                let before = tcp.to_bytes();
                tcp.source_port = src.unwrap_or(tcp.source_port);
                tcp.destination_port = dst.unwrap_or(tcp.destination_port);
                let sum = checksum::update_bytes(tcp.checksum, addrs.0, addrs.1);
                tcp.checksum = checksum::update_bytes(sum, &before, &tcp.to_bytes());
                self.write_bytes(l4, &tcp.to_bytes())
            }
            Transport::Udp => {
                let (mut udp, _) =
                    UdpHeader::from_slice(segment).map_err(|_| EditError::Malformed(l4))?;
                let before = udp.to_bytes();
                udp.source_port = src.unwrap_or(udp.source_port);
                udp.destination_port = dst.unwrap_or(udp.destination_port);
                if udp.checksum != 0 {
                    let sum = checksum::update_bytes(udp.checksum, addrs.0, addrs.1);
                    let sum = checksum::update_bytes(sum, &before, &udp.to_bytes());
                    // zero on the wire means "no checksum"
                    udp.checksum = if sum == 0 { 0xFFFF } else { sum };
                }
                self.write_bytes(l4, &udp.to_bytes())
            }
            Transport::Icmp => Ok(()),
        }
    }

    /// Rewrite the IPv4 source address. Non-IPv4 frames are left alone.
    ///
    /// # Errors
    ///
    /// Fails if the recorded headers no longer parse.
    pub fn set_nw_src(&mut self, addr: Ipv4Addr) -> Result<(), EditError> {
        self.rewrite_ipv4(|ip| ip.source = addr.octets())?;
        trace!("IPv4 source -> {addr}");
        Ok(())
    }

    /// Rewrite the IPv4 destination address. Non-IPv4 frames are left alone.
    ///
    /// # Errors
    ///
    /// Fails if the recorded headers no longer parse.
    pub fn set_nw_dst(&mut self, addr: Ipv4Addr) -> Result<(), EditError> {
        self.rewrite_ipv4(|ip| ip.destination = addr.octets())?;
        trace!("IPv4 destination -> {addr}");
        Ok(())
    }

    fn set_tp_ports(&mut self, src: Option<u16>, dst: Option<u16>) -> Result<(), EditError> {
        let Some((_, Transport::Tcp | Transport::Udp)) = self.layers().l4 else {
            return Ok(());
        };
        self.rewrite_transport((&[], &[]), src, dst)
    }

    /// Rewrite the TCP/UDP source port. Other frames are left alone.
    ///
    /// # Errors
    ///
    /// Fails if the recorded headers no longer parse.
    pub fn set_tp_src(&mut self, port: u16) -> Result<(), EditError> {
        self.set_tp_ports(Some(port), None)
    }

    /// Rewrite the TCP/UDP destination port. Other frames are left alone.
    ///
    /// # Errors
    ///
    /// Fails if the recorded headers no longer parse.
    pub fn set_tp_dst(&mut self, port: u16) -> Result<(), EditError> {
        self.set_tp_ports(None, Some(port))
    }

    /// The IPv4 TTL and ToS, if an IPv4 header was found.
    #[must_use]
    pub fn ipv4_ttl_tos(&self) -> Option<(u8, u8)> {
        let (_, ip) = self.ipv4_header().ok()??;
        Some((ip.time_to_live, tos(&ip)))
    }

    /// Rewrite the IPv4 TTL. Non-IPv4 frames are left alone.
    ///
    /// # Errors
    ///
    /// Fails if the recorded header no longer parses.
    pub fn set_ipv4_ttl(&mut self, ttl: u8) -> Result<(), EditError> {
        self.rewrite_ipv4(|ip| ip.time_to_live = ttl)
    }

    /// Rewrite the IPv4 ToS. Non-IPv4 frames are left alone.
    ///
    /// # Errors
    ///
    /// Fails if the recorded header no longer parses.
    pub fn set_ipv4_tos(&mut self, tos: u8) -> Result<(), EditError> {
        let dscp = IpDscp::try_new(tos >> 2).map_err(|_| EditError::OutOfRange("dscp"))?;
        let ecn = IpEcn::try_new(tos & 0b11).map_err(|_| EditError::OutOfRange("ecn"))?;
        self.rewrite_ipv4(|ip| {
            ip.dscp = dscp;
            ip.ecn = ecn;
        })
    }
}

#[cfg(test)]
mod test {
    use crate::buffer::HeapBuffer;
    use crate::eth::Mac;
    use crate::flow_key::extract;
    use crate::packet::test_utils::{assert_checksums_valid, tagged_udp_frame, tcp_frame};
    use crate::packet::{EditError, Packet};
    use crate::port::PortNo;
    use std::net::Ipv4Addr;

    fn parsed(frame: &[u8]) -> Packet<HeapBuffer> {
        let mut packet = Packet::new(HeapBuffer::from_raw_data(frame), PortNo(1));
        extract(&mut packet);
        packet
    }

    #[test]
    fn builder_frames_are_valid() {
        assert_checksums_valid(&tcp_frame(), 14);
        assert_checksums_valid(&tagged_udp_frame(), 18);
    }

    #[test]
    fn nw_and_tp_rewrites_keep_checksums_valid() {
        for (frame, l3) in [(tcp_frame(), 14), (tagged_udp_frame(), 18)] {
            let mut packet = parsed(&frame);
            packet.set_nw_src(Ipv4Addr::new(192, 168, 7, 9)).unwrap();
            packet.set_nw_dst(Ipv4Addr::new(172, 16, 0, 254)).unwrap();
            packet.set_tp_src(40000).unwrap();
            packet.set_tp_dst(8080).unwrap();
            packet.set_ipv4_ttl(3).unwrap();
            packet.set_ipv4_tos(0xA0).unwrap();
            assert_checksums_valid(packet.data(), l3);
            assert_eq!(packet.ipv4_ttl_tos(), Some((3, 0xA0)));
            assert_eq!(&packet.data()[l3 + 12..l3 + 16], &[192, 168, 7, 9]);
        }
    }

    #[test]
    fn rewrites_keep_checksums_valid_for_any_value() {
        bolero::check!()
            .with_type()
            .for_each(|(src, dst, sport, dport): &(u32, u32, u16, u16)| {
                let mut packet = parsed(&tcp_frame());
                packet.set_nw_src(Ipv4Addr::from(*src)).unwrap();
                packet.set_nw_dst(Ipv4Addr::from(*dst)).unwrap();
                packet.set_tp_src(*sport).unwrap();
                packet.set_tp_dst(*dport).unwrap();
                assert_checksums_valid(packet.data(), 14);
            });
    }

    #[test]
    fn checksums_are_updated_in_place() {
        let mut frame = tcp_frame();
        // a stale sum stays stale by the same amount: tcp checksum at 14 + 20 + 16
        frame[50] ^= 0x01;
        let mut packet = parsed(&frame);
        packet.set_tp_dst(8080).unwrap();
        packet.set_nw_dst(Ipv4Addr::new(192, 168, 0, 1)).unwrap();
        packet.set_nw_dst(Ipv4Addr::new(10, 0, 0, 2)).unwrap();
        packet.set_tp_dst(80).unwrap();
        assert_eq!(packet.data(), frame.as_slice());
    }

    #[test]
    fn vlan_tag_insert_modify_strip() {
        let original = tcp_frame();
        let mut packet = parsed(&original);
        assert_eq!(packet.vlan_tag(), None);
        packet.set_vlan_vid(42).unwrap();
        assert_eq!(packet.len(), original.len() + 4);
        assert_eq!(&packet.data()[12..18], &[0x81, 0x00, 0x00, 42, 0x08, 0x00]);
        assert_eq!(packet.layers().l2_end, 18);
        assert_eq!(packet.layers().l3, Some(18));
        packet.set_vlan_pcp(5).unwrap();
        let tag = packet.vlan_tag().unwrap();
        assert_eq!((tag.pcp.value(), tag.vlan_id.value()), (5, 42));
        packet.strip_vlan().unwrap();
        assert_eq!(packet.data(), original.as_slice());
        assert_eq!(*packet.layers(), *parsed(&original).layers());
    }

    #[test]
    fn vlan_fields_out_of_range_are_refused() {
        let mut packet = parsed(&tcp_frame());
        assert_eq!(
            packet.set_vlan_vid(0x1000),
            Err(EditError::OutOfRange("vlan id"))
        );
        assert_eq!(packet.set_vlan_pcp(8), Err(EditError::OutOfRange("vlan pcp")));
        assert_eq!(packet.data(), tcp_frame().as_slice());
    }

    #[test]
    fn link_layer_rewrites() {
        let mut packet = parsed(&tcp_frame());
        packet.set_dl_src(Mac([0xaa; 6])).unwrap();
        packet.set_dl_dst(Mac::BROADCAST).unwrap();
        assert_eq!(&packet.data()[..12], &[[0xff; 6], [0xaa; 6]].concat()[..]);
        let mut runt = Packet::new(HeapBuffer::from_raw_data(&[0; 10]), PortNo(1));
        assert_eq!(runt.set_dl_src(Mac::BROADCAST), Err(EditError::TooShort(0)));
    }

    #[test]
    fn udp_without_checksum_stays_without() {
        let mut frame = tagged_udp_frame();
        // eth + tag + ipv4 header places the udp checksum at 18 + 20 + 6
        frame[44] = 0;
        frame[45] = 0;
        let mut packet = parsed(&frame);
        packet.set_tp_dst(1).unwrap();
        packet.set_nw_src(Ipv4Addr::new(1, 1, 1, 1)).unwrap();
        assert_eq!(&packet.data()[44..46], &[0, 0]);
        assert_eq!(&packet.data()[40..42], &[0, 1]);
    }
}
