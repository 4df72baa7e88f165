// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Running action lists.
//!
//! Field rewrites change the packet bytes and the packet's [`FlowKey`] together, so later
//! actions (and a [`PortNo::TABLE`] lookup) see the rewritten headers.

use std::time::Instant;

use bytes::Bytes;
use net::buffer::{HeapBuffer, PacketBufferMut};
use net::eth::VLAN_NONE;
use net::flow_key::FlowKey;
use net::mpls::{self, MplsError};
use net::packet::{EditError, Packet};
use net::port::PortNo;
use openflow::action::{Action, VendorAction};
use openflow::message::{Message, PacketIn, PacketInReason};
use openflow::BufferId;
use tracing::{debug, trace};

use crate::datapath::{Datapath, saturating_len};

/// Where packets leave the datapath.
pub trait Transmit<Buf: PacketBufferMut>: Send + Sync {
    /// Send `packet` out of `port`: a physical port, or one of [`PortNo::FLOOD`],
    /// [`PortNo::ALL`], [`PortNo::NORMAL`] and [`PortNo::LOCAL`], which are the transmitter's
    /// to interpret.
    fn transmit(&self, port: PortNo, packet: Packet<Buf>);
}

/// Why an action could not be applied. The packet is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ActionFailed {
    /// A header rewrite failed.
    #[error(transparent)]
    Edit(#[from] EditError),
    /// A label stack operation failed.
    #[error(transparent)]
    Mpls(#[from] MplsError),
}

/// Apply one non-output action to `packet`, keeping `key` in step.
///
/// Output actions are ignored here; they are resolved by the caller.
///
/// # Errors
///
/// Fails if the frame cannot be edited (no room, no label, expired TTL).
pub fn apply<Buf: PacketBufferMut>(
    packet: &mut Packet<Buf>,
    key: &mut FlowKey,
    action: &Action,
) -> Result<(), ActionFailed> {
    let has_l3 = packet.layers().l3.is_some();
    let has_l4 = packet.layers().l4.is_some();
    match *action {
        Action::Output { .. } => {}
        Action::SetVlanVid(vid) => {
            packet.set_vlan_vid(vid)?;
            key.dl_vlan = vid;
        }
        Action::SetVlanPcp(pcp) => {
            packet.set_vlan_pcp(pcp)?;
            if let Some(tag) = packet.vlan_tag() {
                key.dl_vlan = tag.vlan_id.value();
            }
        }
        Action::StripVlan => {
            packet.strip_vlan()?;
            key.dl_vlan = VLAN_NONE;
        }
        Action::SetDlSrc(mac) => {
            packet.set_dl_src(mac)?;
            key.dl_src = mac;
        }
        Action::SetDlDst(mac) => {
            packet.set_dl_dst(mac)?;
            key.dl_dst = mac;
        }
        Action::SetNwSrc(addr) => {
            packet.set_nw_src(addr)?;
            if has_l3 {
                key.nw_src = addr;
            }
        }
        Action::SetNwDst(addr) => {
            packet.set_nw_dst(addr)?;
            if has_l3 {
                key.nw_dst = addr;
            }
        }
        Action::SetTpSrc(port) => {
            packet.set_tp_src(port)?;
            if has_l4 {
                key.tp_src = port;
            }
        }
        Action::SetTpDst(port) => {
            packet.set_tp_dst(port)?;
            if has_l4 {
                key.tp_dst = port;
            }
        }
        Action::SetMplsLabel(label) => mpls::set_label(packet, key, label)?,
        Action::SetMplsExp(exp) => mpls::set_exp(packet, exp)?,
        Action::Vendor(VendorAction::PopMpls { flags, eth_type }) => {
            mpls::pop(packet, key, flags, eth_type)?;
        }
        Action::Vendor(VendorAction::PushMpls { flags, label }) => {
            mpls::push(packet, key, flags, label)?;
        }
    }
    trace!("applied {action:?}");
    Ok(())
}

impl<Tx: Transmit<HeapBuffer>> Datapath<Tx> {
    /// Run `actions` on `packet`.
    ///
    /// Every output but the last gets a copy of the packet as it is at that point; the last
    /// one gets the packet itself. A list without outputs drops the packet. `TABLE` outputs
    /// are honored only when `from_packet_out` is set.
    pub(crate) fn execute(
        &self,
        mut packet: Packet<HeapBuffer>,
        mut key: FlowKey,
        actions: &[Action],
        from_packet_out: bool,
        now: Instant,
    ) {
        let mut pending: Option<(PortNo, u16)> = None;
        for action in actions {
            if let Action::Output { port, max_len } = *action {
                if let Some((prev, prev_len)) = pending.replace((port, max_len)) {
                    self.output(packet.clone(), key, prev, prev_len, from_packet_out, now);
                }
                continue;
            }
            if let Err(e) = apply(&mut packet, &mut key, action) {
                debug!("{action:?} failed: {e}, dropping packet");
                return;
            }
        }
        match pending {
            Some((port, max_len)) => self.output(packet, key, port, max_len, from_packet_out, now),
            None => trace!("no output action, dropping packet"),
        }
    }

    fn output(
        &self,
        mut packet: Packet<HeapBuffer>,
        mut key: FlowKey,
        port: PortNo,
        max_len: u16,
        from_packet_out: bool,
        now: Instant,
    ) {
        match port {
            PortNo::IN_PORT => self.transmit(packet.meta.in_port, packet),
            PortNo::CONTROLLER => {
                let packet_in = PacketIn {
                    buffer_id: BufferId::NONE,
                    total_len: saturating_len(packet.len()),
                    in_port: packet.meta.in_port,
                    reason: PacketInReason::Action,
                    data: Bytes::copy_from_slice(packet.truncated(usize::from(max_len))),
                };
                self.upcall(Message::PacketIn(packet_in));
            }
            PortNo::TABLE if from_packet_out => match self.flows().lookup(&key) {
                Some(entry) => {
                    entry.hit(packet.len(), now);
                    self.execute(packet, key, &entry.actions(), false, now);
                }
                None => self.miss(&packet, now),
            },
            PortNo::TABLE => debug!("TABLE output outside packet-out, dropping packet"),
            port if port.is_virtual() => {
                if let Some(physical) = self.vports().run_chain(port, &mut packet, &mut key) {
                    self.transmit(physical, packet);
                }
            }
            port => self.transmit(port, packet),
        }
    }
}
