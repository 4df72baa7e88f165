// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Action lists: validation, decoding and encoding.
//!
//! An action list is only ever turned into [`Action`] values through [`decode_list`], which
//! checks the whole list first. Everything downstream can rely on a decoded action being
//! well formed for the scope it was decoded for.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut};
use net::eth::{EthType, Mac, VLAN_PCP_MAX, VLAN_VID_MAX};
use net::mpls::{LabelWord, MplsLabel, PopFlags, PushFlags};
use net::port::{PortKind, PortNo};
use tracing::debug;

use crate::error::ActionError;

/// Vendor id of the MPLS extension actions.
pub const MPLS_VENDOR_ID: u32 = 0x00D0_F0A1;
/// Vendor subtype of the virtual-port-table actions.
pub const VPORT_TABLE_SUBTYPE: u16 = 1;

const ACTION_HEADER_LEN: usize = 4;
const VENDOR_HEADER_LEN: usize = 8;

const OUTPUT: u16 = 0;
const SET_VLAN_VID: u16 = 1;
const SET_VLAN_PCP: u16 = 2;
const STRIP_VLAN: u16 = 3;
const SET_DL_SRC: u16 = 4;
const SET_DL_DST: u16 = 5;
const SET_NW_SRC: u16 = 6;
const SET_NW_DST: u16 = 7;
const SET_TP_SRC: u16 = 9;
const SET_TP_DST: u16 = 10;
const SET_MPLS_LABEL: u16 = 13;
const SET_MPLS_EXP: u16 = 14;
const VENDOR: u16 = 0xFFFF;

const POP_MPLS: u16 = 1;
const PUSH_MPLS: u16 = 2;

/// Bitmap of the supported standard action types, as advertised in the features reply.
pub const SUPPORTED_ACTIONS: u32 = (1 << OUTPUT)
    | (1 << SET_VLAN_VID)
    | (1 << SET_VLAN_PCP)
    | (1 << STRIP_VLAN)
    | (1 << SET_DL_SRC)
    | (1 << SET_DL_DST)
    | (1 << SET_NW_SRC)
    | (1 << SET_NW_DST)
    | (1 << SET_TP_SRC)
    | (1 << SET_TP_DST)
    | (1 << SET_MPLS_LABEL)
    | (1 << SET_MPLS_EXP);

/// Where an action list is going to run. Output port legality depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionScope {
    /// Actions of a flow entry.
    Flow,
    /// Actions of a packet-out message.
    PacketOut,
    /// Actions of a virtual port entry.
    Vport,
}

/// Actions of the MPLS vendor extension (virtual-port-table subtype).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VendorAction {
    /// Remove the top label.
    PopMpls {
        /// TTL options.
        flags: PopFlags,
        /// Ethertype set when the stack empties.
        eth_type: EthType,
    },
    /// Push a new label.
    PushMpls {
        /// TTL and EXP sources.
        flags: PushFlags,
        /// The label word pushed (TTL and EXP used unless `flags` say otherwise).
        label: LabelWord,
    },
}

impl VendorAction {
    /// Vendor id of the action.
    #[must_use]
    pub const fn vendor(&self) -> u32 {
        MPLS_VENDOR_ID
    }

    /// Vendor subtype of the action.
    #[must_use]
    pub const fn subtype(&self) -> u16 {
        VPORT_TABLE_SUBTYPE
    }
}

/// A decoded action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Send the packet to a port.
    Output {
        /// Destination port.
        port: PortNo,
        /// Bytes sent to the controller when `port` is [`PortNo::CONTROLLER`].
        max_len: u16,
    },
    /// Set the VLAN id, adding a tag if needed.
    SetVlanVid(u16),
    /// Set the VLAN priority, adding a tag if needed.
    SetVlanPcp(u8),
    /// Remove the VLAN tag.
    StripVlan,
    /// Set the ethernet source.
    SetDlSrc(Mac),
    /// Set the ethernet destination.
    SetDlDst(Mac),
    /// Set the IPv4 source.
    SetNwSrc(Ipv4Addr),
    /// Set the IPv4 destination.
    SetNwDst(Ipv4Addr),
    /// Set the transport source port.
    SetTpSrc(u16),
    /// Set the transport destination port.
    SetTpDst(u16),
    /// Set the top MPLS label.
    SetMplsLabel(u32),
    /// Set the EXP bits of the top MPLS label.
    SetMplsExp(u8),
    /// A vendor extension.
    Vendor(VendorAction),
}

fn fixed_len(kind: u16) -> Option<usize> {
    match kind {
        OUTPUT | SET_DL_SRC | SET_DL_DST => Some(16),
        SET_VLAN_VID | SET_VLAN_PCP | STRIP_VLAN | SET_NW_SRC | SET_NW_DST | SET_TP_SRC
        | SET_TP_DST | SET_MPLS_LABEL | SET_MPLS_EXP => Some(8),
        _ => None,
    }
}

fn vendor_len(command: u16) -> Option<usize> {
    match command {
        POP_MPLS => Some(16),
        PUSH_MPLS => Some(24),
        _ => None,
    }
}

fn check_output(port: PortNo, scope: ActionScope) -> Result<(), ActionError> {
    if scope == ActionScope::Vport {
        return Err(ActionError::BadOutPort(port));
    }
    let legal = match port.kind() {
        PortKind::Physical | PortKind::Virtual => true,
        PortKind::Reserved => match port {
            PortNo::TABLE => scope == ActionScope::PacketOut,
            PortNo::NONE => false,
            _ => true,
        },
        PortKind::Invalid => false,
    };
    if legal {
        Ok(())
    } else {
        Err(ActionError::BadOutPort(port))
    }
}

fn get_mac(body: &mut &[u8]) -> Mac {
    let mut mac = [0u8; 6];
    body.copy_to_slice(&mut mac);
    Mac(mac)
}

/// Decode one action whose header and length were checked; `body` follows the 4 byte header.
fn decode_one(kind: u16, mut body: &[u8], scope: ActionScope) -> Result<Action, ActionError> {
    let action = match kind {
        OUTPUT => {
            let port = PortNo(body.get_u32());
            check_output(port, scope)?;
            Action::Output {
                port,
                max_len: body.get_u16(),
            }
        }
        SET_VLAN_VID => {
            let vid = body.get_u16();
            if vid > VLAN_VID_MAX {
                return Err(ActionError::BadArgument("vlan id"));
            }
            Action::SetVlanVid(vid)
        }
        SET_VLAN_PCP => {
            let pcp = body.get_u8();
            if pcp > VLAN_PCP_MAX {
                return Err(ActionError::BadArgument("vlan priority"));
            }
            Action::SetVlanPcp(pcp)
        }
        STRIP_VLAN => Action::StripVlan,
        SET_DL_SRC => Action::SetDlSrc(get_mac(&mut body)),
        SET_DL_DST => Action::SetDlDst(get_mac(&mut body)),
        SET_NW_SRC => Action::SetNwSrc(Ipv4Addr::from(body.get_u32())),
        SET_NW_DST => Action::SetNwDst(Ipv4Addr::from(body.get_u32())),
        SET_TP_SRC => Action::SetTpSrc(body.get_u16()),
        SET_TP_DST => Action::SetTpDst(body.get_u16()),
        SET_MPLS_LABEL => {
            let label = body.get_u32();
            if label > MplsLabel::MAX {
                return Err(ActionError::BadArgument("mpls label"));
            }
            Action::SetMplsLabel(label)
        }
        SET_MPLS_EXP => {
            let exp = body.get_u8();
            if exp > 7 {
                return Err(ActionError::BadArgument("mpls exp"));
            }
            Action::SetMplsExp(exp)
        }
        other => return Err(ActionError::BadType(other)),
    };
    Ok(action)
}

/// Decode a vendor action; `body` follows the sub-subtype.
fn decode_vendor(command: u16, mut body: &[u8]) -> Result<Action, ActionError> {
    let vendor = match command {
        POP_MPLS => {
            let flags =
                PopFlags::from_bits(body.get_u16()).ok_or(ActionError::BadArgument("pop flags"))?;
            let eth_type = body.get_u16();
            if eth_type < EthType::MIN_ETH_TYPE {
                return Err(ActionError::BadArgument("pop ethertype"));
            }
            VendorAction::PopMpls {
                flags,
                eth_type: EthType::new(eth_type),
            }
        }
        PUSH_MPLS => {
            let flags = PushFlags::from_bits(body.get_u16())
                .filter(|flags| flags.is_consistent())
                .ok_or(ActionError::BadArgument("push flags"))?;
            body.advance(2);
            VendorAction::PushMpls {
                flags,
                label: LabelWord(body.get_u32()),
            }
        }
        subsub => {
            return Err(ActionError::BadVendorType {
                subtype: VPORT_TABLE_SUBTYPE,
                command: subsub,
            });
        }
    };
    Ok(Action::Vendor(vendor))
}

/// Validate and decode an action list.
///
/// Checks, in order for each action: the header length (at least 8, a multiple of 8, within
/// the list), the type (and vendor id, subtype and sub-subtype), the exact length of the
/// type, the argument ranges and finally output port legality for `scope`.
///
/// # Errors
///
/// Returns the first problem found.
pub fn decode_list(raw: &[u8], scope: ActionScope) -> Result<Vec<Action>, ActionError> {
    let mut actions = Vec::new();
    let mut offset = 0;
    while offset < raw.len() {
        let rest = &raw[offset..];
        if rest.len() < VENDOR_HEADER_LEN {
            #[allow(clippy::cast_possible_truncation)] // fewer than 8 bytes
            let len = rest.len() as u16;
            return Err(ActionError::BadLen { offset, len });
        }
        let mut header = rest;
        let kind = header.get_u16();
        let len = header.get_u16();
        let size = len as usize;
        if size < VENDOR_HEADER_LEN || size % 8 != 0 || size > rest.len() {
            return Err(ActionError::BadLen { offset, len });
        }
        let action = if kind == VENDOR {
            let vendor = header.get_u32();
            if vendor != MPLS_VENDOR_ID {
                return Err(ActionError::BadVendor(vendor));
            }
            if size < 12 {
                return Err(ActionError::BadLen { offset, len });
            }
            let subtype = header.get_u16();
            let command = header.get_u16();
            if subtype != VPORT_TABLE_SUBTYPE {
                return Err(ActionError::BadVendorType { subtype, command });
            }
            let expected =
                vendor_len(command).ok_or(ActionError::BadVendorType { subtype, command })?;
            if size != expected {
                return Err(ActionError::BadLen { offset, len });
            }
            decode_vendor(command, &rest[12..size])?
        } else {
            let expected = fixed_len(kind).ok_or(ActionError::BadType(kind))?;
            if size != expected {
                return Err(ActionError::BadLen { offset, len });
            }
            decode_one(kind, &rest[ACTION_HEADER_LEN..size], scope)?
        };
        actions.push(action);
        offset += size;
    }
    debug!("decoded {} actions for {scope:?}", actions.len());
    Ok(actions)
}

/// Check an action list without keeping the result.
///
/// # Errors
///
/// See [`decode_list`].
pub fn validate(raw: &[u8], scope: ActionScope) -> Result<(), ActionError> {
    decode_list(raw, scope).map(|_| ())
}

fn put_header(out: &mut impl BufMut, kind: u16, len: u16) {
    out.put_u16(kind);
    out.put_u16(len);
}

impl Action {
    /// Encoded size in bytes.
    #[must_use]
    pub fn wire_len(&self) -> u16 {
        match self {
            Action::Output { .. }
            | Action::SetDlSrc(_)
            | Action::SetDlDst(_)
            | Action::Vendor(VendorAction::PopMpls { .. }) => 16,
            Action::Vendor(VendorAction::PushMpls { .. }) => 24,
            _ => 8,
        }
    }

    /// Write the action.
    pub fn encode(&self, out: &mut impl BufMut) {
        let len = self.wire_len();
        match *self {
            Action::Output { port, max_len } => {
                put_header(out, OUTPUT, len);
                out.put_u32(port.0);
                out.put_u16(max_len);
                out.put_bytes(0, 6);
            }
            Action::SetVlanVid(vid) => {
                put_header(out, SET_VLAN_VID, len);
                out.put_u16(vid);
                out.put_bytes(0, 2);
            }
            Action::SetVlanPcp(pcp) => {
                put_header(out, SET_VLAN_PCP, len);
                out.put_u8(pcp);
                out.put_bytes(0, 3);
            }
            Action::StripVlan => {
                put_header(out, STRIP_VLAN, len);
                out.put_bytes(0, 4);
            }
            Action::SetDlSrc(mac) => {
                put_header(out, SET_DL_SRC, len);
                out.put_slice(&mac.0);
                out.put_bytes(0, 6);
            }
            Action::SetDlDst(mac) => {
                put_header(out, SET_DL_DST, len);
                out.put_slice(&mac.0);
                out.put_bytes(0, 6);
            }
            Action::SetNwSrc(addr) => {
                put_header(out, SET_NW_SRC, len);
                out.put_u32(u32::from(addr));
            }
            Action::SetNwDst(addr) => {
                put_header(out, SET_NW_DST, len);
                out.put_u32(u32::from(addr));
            }
            Action::SetTpSrc(port) => {
                put_header(out, SET_TP_SRC, len);
                out.put_u16(port);
                out.put_bytes(0, 2);
            }
            Action::SetTpDst(port) => {
                put_header(out, SET_TP_DST, len);
                out.put_u16(port);
                out.put_bytes(0, 2);
            }
            Action::SetMplsLabel(label) => {
                put_header(out, SET_MPLS_LABEL, len);
                out.put_u32(label);
            }
            Action::SetMplsExp(exp) => {
                put_header(out, SET_MPLS_EXP, len);
                out.put_u8(exp);
                out.put_bytes(0, 3);
            }
            Action::Vendor(vendor) => {
                put_header(out, VENDOR, len);
                out.put_u32(vendor.vendor());
                out.put_u16(vendor.subtype());
                match vendor {
                    VendorAction::PopMpls { flags, eth_type } => {
                        out.put_u16(POP_MPLS);
                        out.put_u16(flags.bits());
                        out.put_u16(eth_type.raw());
                    }
                    VendorAction::PushMpls { flags, label } => {
                        out.put_u16(PUSH_MPLS);
                        out.put_u16(flags.bits());
                        out.put_bytes(0, 2);
                        out.put_u32(label.0);
                        out.put_bytes(0, 4);
                    }
                }
            }
        }
    }

    /// True for an output action (to any port).
    #[must_use]
    pub fn is_output(&self) -> bool {
        matches!(self, Action::Output { .. })
    }
}

/// Encoded size of a list.
#[must_use]
pub fn list_len(actions: &[Action]) -> usize {
    actions.iter().map(|a| a.wire_len() as usize).sum()
}

/// Write a list of actions back to back.
pub fn encode_list(actions: &[Action], out: &mut impl BufMut) {
    for action in actions {
        action.encode(out);
    }
}
