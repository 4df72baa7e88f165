// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Switch port numbers

use std::fmt::Display;

/// A 32-bit switch port number.
///
/// The number space is split into physical ports, virtual ports and a handful of reserved
/// values with special forwarding meaning.
#[repr(transparent)]
#[cfg_attr(any(test, feature = "bolero"), derive(bolero::TypeGenerator))]
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PortNo(pub u32);

/// How a [`PortNo`] is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    /// A physical port.
    Physical,
    /// A virtual port, looked up in the virtual port table.
    Virtual,
    /// One of the reserved port numbers.
    Reserved,
    /// Not assigned to anything.
    Invalid,
}

impl PortNo {
    /// Largest physical port number.
    pub const MAX_PHYSICAL: PortNo = PortNo(0xFF00);
    /// First virtual port number.
    pub const VPORT_MIN: PortNo = PortNo(0x0001_0000);
    /// Last virtual port number.
    pub const VPORT_MAX: PortNo = PortNo(0x0001_FFFF);
    /// Send the packet back out of its ingress port.
    pub const IN_PORT: PortNo = PortNo(0xFFFF_FFF8);
    /// Run the packet through the flow table (packet-out only).
    pub const TABLE: PortNo = PortNo(0xFFFF_FFF9);
    /// Traditional L2/L3 processing.
    pub const NORMAL: PortNo = PortNo(0xFFFF_FFFA);
    /// All physical ports except the ingress port.
    pub const FLOOD: PortNo = PortNo(0xFFFF_FFFB);
    /// All physical ports except the ingress port, ignoring flooding restrictions.
    pub const ALL: PortNo = PortNo(0xFFFF_FFFC);
    /// Send to the controller.
    pub const CONTROLLER: PortNo = PortNo(0xFFFF_FFFD);
    /// The local networking stack.
    pub const LOCAL: PortNo = PortNo(0xFFFF_FFFE);
    /// No port.
    pub const NONE: PortNo = PortNo(0xFFFF_FFFF);

    /// Number of virtual port numbers.
    #[allow(clippy::cast_possible_truncation)] // 2^16
    pub const VPORT_COUNT: usize = (Self::VPORT_MAX.0 - Self::VPORT_MIN.0 + 1) as usize;

    /// Classify this port number.
    #[must_use]
    pub const fn kind(self) -> PortKind {
        match self.0 {
            1..=0xFF00 => PortKind::Physical,
            0x0001_0000..=0x0001_FFFF => PortKind::Virtual,
            0xFFFF_FFF8..=0xFFFF_FFFF => PortKind::Reserved,
            _ => PortKind::Invalid,
        }
    }

    /// True for physical ports.
    #[must_use]
    pub const fn is_physical(self) -> bool {
        matches!(self.kind(), PortKind::Physical)
    }

    /// True for virtual ports.
    #[must_use]
    pub const fn is_virtual(self) -> bool {
        matches!(self.kind(), PortKind::Virtual)
    }
}

impl From<u32> for PortNo {
    fn from(value: u32) -> Self {
        PortNo(value)
    }
}

impl From<PortNo> for u32 {
    fn from(value: PortNo) -> Self {
        value.0
    }
}

impl Display for PortNo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            PortNo::IN_PORT => write!(f, "in_port"),
            PortNo::TABLE => write!(f, "table"),
            PortNo::NORMAL => write!(f, "normal"),
            PortNo::FLOOD => write!(f, "flood"),
            PortNo::ALL => write!(f, "all"),
            PortNo::CONTROLLER => write!(f, "controller"),
            PortNo::LOCAL => write!(f, "local"),
            PortNo::NONE => write!(f, "none"),
            PortNo(n) if self.is_virtual() => write!(f, "vport:{n:#x}"),
            PortNo(n) => write!(f, "{n}"),
        }
    }
}
