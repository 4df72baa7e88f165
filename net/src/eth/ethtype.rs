// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Ethernet type related fields

use etherparse::EtherType;
use std::fmt::Display;

/// The ethernet header's ethertype field.
///
/// This is a transparent wrapper around the type provided by etherparse.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EthType(pub(crate) EtherType);

impl EthType {
    /// Ethernet type for [address resolution protocol](https://en.wikipedia.org/wiki/Address_Resolution_Protocol)
    pub const ARP: EthType = EthType(EtherType::ARP);
    /// Ethernet type for [IPv4](https://en.wikipedia.org/wiki/IPv4)
    pub const IPV4: EthType = EthType(EtherType::IPV4);
    /// Ethernet type for [IPv6](https://en.wikipedia.org/wiki/IPv6)
    pub const IPV6: EthType = EthType(EtherType::IPV6);
    /// Ethernet type for [VLAN](https://en.wikipedia.org/wiki/IEEE_802.1Q)
    pub const VLAN: EthType = EthType(EtherType::VLAN_TAGGED_FRAME);
    /// Ethernet type for unicast [MPLS](https://en.wikipedia.org/wiki/Multiprotocol_Label_Switching)
    pub const MPLS_UNICAST: EthType = EthType(EtherType(0x8847));
    /// Ethernet type for multicast MPLS
    pub const MPLS_MULTICAST: EthType = EthType(EtherType(0x8848));
    /// Value reported for 802.3 frames without a SNAP header.
    pub const NOT_ETH_TYPE: EthType = EthType(EtherType(0x05FF));
    /// Smallest value of the type/length field which is an ethertype rather than a length.
    pub const MIN_ETH_TYPE: u16 = 0x0600;

    /// Map a raw (native-endian) u16 into an [`EthType`]
    #[must_use]
    pub const fn new(raw: u16) -> EthType {
        EthType(EtherType(raw))
    }

    /// Map a raw (big-endian) u16 into an [`EthType`]
    #[must_use]
    pub const fn new_from_be_bytes(raw: [u8; 2]) -> EthType {
        EthType(EtherType(u16::from_be_bytes(raw)))
    }

    /// get the raw `u16` value (native-endian)
    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0.0
    }

    /// True for the MPLS unicast ethertype.
    #[must_use]
    pub const fn is_mpls(self) -> bool {
        self.0.0 == Self::MPLS_UNICAST.0.0
    }
}

impl Default for EthType {
    fn default() -> Self {
        EthType::new(0)
    }
}

impl Display for EthType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.raw())
    }
}

#[cfg(any(test, feature = "bolero"))]
mod contract {
    use super::EthType;
    use bolero::{Driver, TypeGenerator};

    impl TypeGenerator for EthType {
        fn generate<D: Driver>(u: &mut D) -> Option<Self> {
            Some(EthType::new(u.produce()?))
        }
    }
}
