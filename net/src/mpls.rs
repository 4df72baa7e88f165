// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! MPLS label stack operations.
//!
//! A label stack entry is the 32-bit word `label:20 | exp:3 | s:1 | ttl:8`. The stack sits
//! between the link layer and the payload; pushing or popping an entry moves the link-layer
//! header by four bytes and leaves the payload where it is.

use crate::buffer::PacketBufferMut;
use crate::eth::EthType;
use crate::flow_key::FlowKey;
use crate::packet::{EditError, Packet};
use bitflags::bitflags;
use std::fmt::Display;
use std::net::Ipv4Addr;
use tracing::{debug, trace};

/// Size of a label stack entry.
pub const LABEL_LEN: u16 = 4;

/// The 20-bit label value as carried in a flow key, or [`MplsLabel::INVALID`].
#[repr(transparent)]
#[cfg_attr(any(test, feature = "bolero"), derive(bolero::TypeGenerator))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MplsLabel(pub u32);

impl MplsLabel {
    /// No label.
    pub const INVALID: MplsLabel = MplsLabel(0xFFFF_FFFF);
    /// Largest label value.
    pub const MAX: u32 = 0x000F_FFFF;

    /// True unless this is the [`MplsLabel::INVALID`] sentinel.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self != MplsLabel::INVALID
    }
}

impl Default for MplsLabel {
    fn default() -> Self {
        MplsLabel::INVALID
    }
}

impl Display for MplsLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "-")
        }
    }
}

/// A label stack entry.
#[repr(transparent)]
#[cfg_attr(any(test, feature = "bolero"), derive(bolero::TypeGenerator))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelWord(pub u32);

#[allow(clippy::cast_possible_truncation)] // all fields are masked to their width
impl LabelWord {
    const LABEL_SHIFT: u32 = 12;
    const EXP_SHIFT: u32 = 9;
    const BOS_BIT: u32 = 1 << 8;

    /// Build an entry from its fields. `label` and `exp` are masked to their width.
    #[must_use]
    pub fn new(label: u32, exp: u8, bos: bool, ttl: u8) -> LabelWord {
        LabelWord(
            ((label & MplsLabel::MAX) << Self::LABEL_SHIFT)
                | (u32::from(exp & 0x7) << Self::EXP_SHIFT)
                | if bos { Self::BOS_BIT } else { 0 }
                | u32::from(ttl),
        )
    }

    /// The label value.
    #[must_use]
    pub fn label(self) -> u32 {
        self.0 >> Self::LABEL_SHIFT
    }

    /// The experimental (traffic class) bits.
    #[must_use]
    pub fn exp(self) -> u8 {
        ((self.0 >> Self::EXP_SHIFT) & 0x7) as u8
    }

    /// The bottom-of-stack bit.
    #[must_use]
    pub fn bos(self) -> bool {
        self.0 & Self::BOS_BIT != 0
    }

    /// The time to live.
    #[must_use]
    pub fn ttl(self) -> u8 {
        self.0 as u8
    }

    /// This entry with another label value.
    #[must_use]
    pub fn with_label(self, label: u32) -> LabelWord {
        LabelWord::new(label, self.exp(), self.bos(), self.ttl())
    }

    /// This entry with other experimental bits.
    #[must_use]
    pub fn with_exp(self, exp: u8) -> LabelWord {
        LabelWord::new(self.label(), exp, self.bos(), self.ttl())
    }

    /// This entry with another bottom-of-stack bit.
    #[must_use]
    pub fn with_bos(self, bos: bool) -> LabelWord {
        LabelWord::new(self.label(), self.exp(), bos, self.ttl())
    }

    /// This entry with another time to live.
    #[must_use]
    pub fn with_ttl(self, ttl: u8) -> LabelWord {
        LabelWord::new(self.label(), self.exp(), self.bos(), ttl)
    }
}

bitflags! {
    /// Options of a label pop.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PopFlags: u16 {
        /// Decrement the TTL first; a TTL of 1 or less drops the packet.
        const DECREMENT_TTL = 1 << 0;
        /// Copy the TTL into the next label, or into IPv4 when the stack empties.
        const COPY_TTL = 1 << 1;
        /// Copy EXP into the next label, or into the IPv4 precedence bits when the stack empties.
        const COPY_EXP = 1 << 2;
    }
}

bitflags! {
    /// Where a pushed label takes its TTL and EXP from.
    ///
    /// With neither bit of a pair set, the value in the pushed label word is used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PushFlags: u16 {
        /// TTL of the most recently popped label.
        const TTL_FROM_PREV = 1 << 0;
        /// TTL of the current top label (or the IPv4 TTL).
        const TTL_FROM_NEXT = 1 << 1;
        /// EXP of the most recently popped label.
        const EXP_FROM_PREV = 1 << 2;
        /// EXP of the current top label (or the IPv4 precedence bits).
        const EXP_FROM_NEXT = 1 << 3;
    }
}

impl PushFlags {
    /// False if both TTL sources or both EXP sources are named.
    #[must_use]
    pub fn is_consistent(self) -> bool {
        !self.contains(PushFlags::TTL_FROM_PREV | PushFlags::TTL_FROM_NEXT)
            && !self.contains(PushFlags::EXP_FROM_PREV | PushFlags::EXP_FROM_NEXT)
    }
}

/// Errors which may occur while editing the label stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MplsError {
    /// The packet carries no label.
    #[error("packet has no MPLS label")]
    NoLabel,
    /// The TTL would reach zero.
    #[error("MPLS TTL expired")]
    TtlExpired,
    /// The frame could not be resized.
    #[error(transparent)]
    Edit(#[from] EditError),
}

fn top_label<Buf: PacketBufferMut>(packet: &Packet<Buf>) -> Result<(usize, LabelWord), MplsError> {
    let top = packet.layers().mpls.ok_or(MplsError::NoLabel)? as usize;
    let word = packet.read_u32(top).ok_or(MplsError::NoLabel)?;
    Ok((top, LabelWord(word)))
}

/// Refresh the key's labels from the current stack.
fn update_key_labels<Buf: PacketBufferMut>(packet: &Packet<Buf>, key: &mut FlowKey) {
    key.mpls_label1 = MplsLabel::INVALID;
    key.mpls_label2 = MplsLabel::INVALID;
    if let Ok((top, word)) = top_label(packet) {
        key.mpls_label1 = MplsLabel(word.label());
        if !word.bos() {
            if let Some(second) = packet.read_u32(top + LABEL_LEN as usize) {
                key.mpls_label2 = MplsLabel(LabelWord(second).label());
            }
        }
    }
}

/// Remove the top label.
///
/// The popped entry (after any TTL decrement) is remembered in the packet metadata. When the
/// stack empties the ethertype becomes `eth_type`.
///
/// # Errors
///
/// Fails with [`MplsError::NoLabel`] on an unlabeled packet and with [`MplsError::TtlExpired`]
/// when asked to decrement a TTL of 1 or less. The packet is unchanged on error.
pub fn pop<Buf: PacketBufferMut>(
    packet: &mut Packet<Buf>,
    key: &mut FlowKey,
    flags: PopFlags,
    eth_type: EthType,
) -> Result<(), MplsError> {
    let (top, mut word) = top_label(packet)?;
    if flags.contains(PopFlags::DECREMENT_TTL) {
        if word.ttl() <= 1 {
            debug!("MPLS pop: ttl {} expired, label {}", word.ttl(), word.label());
            return Err(MplsError::TtlExpired);
        }
        word = word.with_ttl(word.ttl() - 1);
    }
    packet.remove_gap(top, LABEL_LEN)?;
    packet.meta.popped_label = Some(word);
    #[allow(clippy::cast_possible_truncation)] // offsets within the frame
    let top16 = top as u16;
    packet
        .layers_mut()
        .shift_from(top16 + LABEL_LEN, -i32::from(LABEL_LEN));

    if word.bos() {
        packet.layers_mut().mpls = None;
        let at = packet
            .layers()
            .eth_type_offset()
            .ok_or(EditError::TooShort(top))?;
        packet.write_u16(at, eth_type.raw())?;
        key.dl_type = eth_type;
        if eth_type == EthType::IPV4 {
            if let Some((ttl, tos)) = packet.ipv4_ttl_tos() {
                if flags.contains(PopFlags::COPY_TTL) {
                    packet.set_ipv4_ttl(word.ttl())?;
                }
                if flags.contains(PopFlags::COPY_EXP) {
                    packet.set_ipv4_tos((tos & 0x1F) | (word.exp() << 5))?;
                }
                trace!("MPLS pop to IPv4: ttl {ttl} -> {}", word.ttl());
            }
        } else {
            // the payload is no longer assumed to be IPv4
            let layers = packet.layers_mut();
            layers.l3 = None;
            layers.l4 = None;
            key.nw_proto = 0;
            key.nw_src = Ipv4Addr::UNSPECIFIED;
            key.nw_dst = Ipv4Addr::UNSPECIFIED;
            key.tp_src = 0;
            key.tp_dst = 0;
        }
    } else {
        let mut next = LabelWord(packet.read_u32(top).ok_or(MplsError::NoLabel)?);
        if flags.contains(PopFlags::COPY_TTL) {
            next = next.with_ttl(word.ttl());
        }
        if flags.contains(PopFlags::COPY_EXP) {
            next = next.with_exp(word.exp());
        }
        packet.write_u32(top, next.0)?;
    }
    update_key_labels(packet, key);
    trace!("MPLS pop: label {} (bos {})", word.label(), word.bos());
    Ok(())
}

/// The (ttl, exp) a pushed label inherits as "next": the current top label, else the IPv4
/// header, else nothing.
fn next_ttl_exp<Buf: PacketBufferMut>(packet: &Packet<Buf>, key: &FlowKey) -> Option<(u8, u8)> {
    match top_label(packet) {
        Ok((_, word)) => Some((word.ttl(), word.exp())),
        Err(_) if key.dl_type == EthType::IPV4 => {
            packet.ipv4_ttl_tos().map(|(ttl, tos)| (ttl, tos >> 5))
        }
        Err(_) => None,
    }
}

/// Push `label` (a full label stack entry) on top of the stack.
///
/// TTL and EXP come from the entry itself unless `flags` name another source. The first label
/// pushed gets the bottom-of-stack bit and turns the ethertype into MPLS unicast.
///
/// # Errors
///
/// Fails if the buffer has no headroom left; the packet is unchanged in that case.
pub fn push<Buf: PacketBufferMut>(
    packet: &mut Packet<Buf>,
    key: &mut FlowKey,
    flags: PushFlags,
    label: LabelWord,
) -> Result<(), MplsError> {
    let at = packet.layers().l2_end;
    let eth_type_at = packet
        .layers()
        .eth_type_offset()
        .ok_or(EditError::TooShort(at as usize))?;
    let next = next_ttl_exp(packet, key);
    let prev = packet
        .meta
        .popped_label
        .map(|word| (word.ttl(), word.exp()))
        .or(next);

    let mut word = label;
    let ttl_source = if flags.contains(PushFlags::TTL_FROM_PREV) {
        prev
    } else if flags.contains(PushFlags::TTL_FROM_NEXT) {
        next
    } else {
        None
    };
    if let Some((ttl, _)) = ttl_source {
        word = word.with_ttl(ttl);
    }
    let exp_source = if flags.contains(PushFlags::EXP_FROM_PREV) {
        prev
    } else if flags.contains(PushFlags::EXP_FROM_NEXT) {
        next
    } else {
        None
    };
    if let Some((_, exp)) = exp_source {
        word = word.with_exp(exp);
    }
    let first = packet.layers().mpls.is_none();
    word = word.with_bos(first);

    packet.insert_gap(at as usize, LABEL_LEN)?;
    packet.write_u32(at as usize, word.0)?;
    let layers = packet.layers_mut();
    layers.shift_from(at, i32::from(LABEL_LEN));
    layers.l2_end = at;
    layers.mpls = Some(at);
    if first {
        packet.write_u16(eth_type_at, EthType::MPLS_UNICAST.raw())?;
        key.dl_type = EthType::MPLS_UNICAST;
    }
    update_key_labels(packet, key);
    trace!(
        "MPLS push: label {} exp {} ttl {} (first {first})",
        word.label(),
        word.exp(),
        word.ttl()
    );
    Ok(())
}

/// Replace the value of the top label.
///
/// # Errors
///
/// Fails with [`MplsError::NoLabel`] on an unlabeled packet.
pub fn set_label<Buf: PacketBufferMut>(
    packet: &mut Packet<Buf>,
    key: &mut FlowKey,
    label: u32,
) -> Result<(), MplsError> {
    let (top, word) = top_label(packet)?;
    packet.write_u32(top, word.with_label(label).0)?;
    key.mpls_label1 = MplsLabel(label & MplsLabel::MAX);
    Ok(())
}

/// Replace the experimental bits of the top label.
///
/// # Errors
///
/// Fails with [`MplsError::NoLabel`] on an unlabeled packet.
pub fn set_exp<Buf: PacketBufferMut>(packet: &mut Packet<Buf>, exp: u8) -> Result<(), MplsError> {
    let (top, word) = top_label(packet)?;
    packet.write_u32(top, word.with_exp(exp).0)?;
    Ok(())
}
