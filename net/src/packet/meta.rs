// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::mpls::LabelWord;
use crate::port::PortNo;

/// Metadata carried with a packet through one top-level execution.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PacketMeta {
    /// Port the packet was received on.
    pub in_port: PortNo,
    /// Most recently popped MPLS label word, consulted by a later push.
    pub popped_label: Option<LabelWord>,
}

impl PacketMeta {
    /// Metadata for a packet received on `in_port`.
    #[must_use]
    pub fn new(in_port: PortNo) -> Self {
        Self {
            in_port,
            popped_label: None,
        }
    }
}
