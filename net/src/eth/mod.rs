// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Ethernet and 802.1Q layout

pub mod ethtype;
pub mod mac;

pub use ethtype::EthType;
pub use mac::Mac;

/// Offset of the type/length field in an Ethernet header.
pub const ETH_TYPE_OFFSET: usize = 12;
/// Length of an 802.1Q tag (TPID and TCI).
pub const VLAN_TAG_LEN: usize = 4;
/// Length of an 802.2 LLC header followed by a SNAP header.
pub const LLC_SNAP_LEN: usize = 8;

/// VLAN id reported for untagged frames.
pub const VLAN_NONE: u16 = 0xFFFF;
/// Largest legal VLAN id.
pub const VLAN_VID_MAX: u16 = 0x0FFF;
/// Largest legal VLAN priority.
pub const VLAN_PCP_MAX: u8 = 7;
