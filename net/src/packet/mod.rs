// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Packet struct and methods

mod edit;
mod meta;

#[cfg(test)]
pub(crate) mod test_utils;

pub use edit::*;
pub use meta::*;

use crate::buffer::PacketBufferMut;
use crate::port::PortNo;

/// Transport protocols whose headers the datapath edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// TCP, full 20 byte header present.
    Tcp,
    /// UDP, full 8 byte header present.
    Udp,
    /// ICMP, full 8 byte header present.
    Icmp,
}

/// Offsets (from the start of the frame) of the layers found by flow-key extraction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Layers {
    /// Start of the 802.1Q tag, if the frame is tagged.
    pub vlan: Option<u16>,
    /// End of the link layer: the byte after the innermost ethertype field.
    pub l2_end: u16,
    /// Start of the top MPLS label.
    pub mpls: Option<u16>,
    /// Start of a complete IPv4 header.
    pub l3: Option<u16>,
    /// Start and kind of a complete transport header (never set for fragments).
    pub l4: Option<(u16, Transport)>,
}

impl Layers {
    /// Offset of the innermost ethertype field.
    #[must_use]
    pub fn eth_type_offset(&self) -> Option<usize> {
        (self.l2_end as usize).checked_sub(2)
    }

    /// Move every offset located at or after `from` by `delta` bytes.
    pub(crate) fn shift_from(&mut self, from: u16, delta: i32) {
        let shift = |off: u16| -> u16 {
            if off >= from {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // frames < 64k
                {
                    (i32::from(off) + delta).max(0) as u16
                }
            } else {
                off
            }
        };
        self.vlan = self.vlan.map(shift);
        self.l2_end = shift(self.l2_end);
        self.mpls = self.mpls.map(shift);
        self.l3 = self.l3.map(shift);
        self.l4 = self.l4.map(|(off, kind)| (shift(off), kind));
    }
}

/// Errors which may occur when growing or shrinking a frame in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EditError {
    /// There is not enough headroom left in the buffer.
    #[error("not enough headroom in packet buffer")]
    NotEnoughHeadroom,
    /// The frame is too short for the requested edit.
    #[error("frame too short for edit at offset {0}")]
    TooShort(usize),
    /// The header recorded at this offset no longer parses.
    #[error("malformed header at offset {0}")]
    Malformed(usize),
    /// The new value does not fit in the header field.
    #[error("value out of range for {0}")]
    OutOfRange(&'static str),
}

/// An ethernet frame plus the state the datapath keeps about it.
#[derive(Debug, Clone)]
pub struct Packet<Buf: PacketBufferMut> {
    buf: Buf,
    layers: Layers,
    /// packet metadata carried through the action pipeline
    pub meta: PacketMeta,
}

impl<Buf: PacketBufferMut> Packet<Buf> {
    /// Wrap a received frame. Layers are unknown until [`crate::flow_key::extract`] runs.
    pub fn new(buf: Buf, in_port: PortNo) -> Packet<Buf> {
        Packet {
            buf,
            layers: Layers::default(),
            meta: PacketMeta::new(in_port),
        }
    }

    /// The frame bytes.
    pub fn data(&self) -> &[u8] {
        self.buf.as_ref()
    }

    /// The frame bytes, mutably.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    /// Frame length.
    pub fn len(&self) -> usize {
        self.data().len()
    }

    /// True for an empty frame.
    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    /// At most the first `max_len` bytes of the frame.
    pub fn truncated(&self, max_len: usize) -> &[u8] {
        let data = self.data();
        &data[..data.len().min(max_len)]
    }

    /// The layer offsets found by the last extraction (and kept current by edits).
    pub fn layers(&self) -> &Layers {
        &self.layers
    }

    pub(crate) fn layers_mut(&mut self) -> &mut Layers {
        &mut self.layers
    }

    /// The underlying buffer.
    pub fn buffer(&self) -> &Buf {
        &self.buf
    }

    /// Give up the packet, keeping the buffer.
    pub fn into_buffer(self) -> Buf {
        self.buf
    }

    pub(crate) fn read_u32(&self, off: usize) -> Option<u32> {
        let bytes = self.data().get(off..off + 4)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn write_u16(&mut self, off: usize, value: u16) -> Result<(), EditError> {
        self.write_bytes(off, &value.to_be_bytes())
    }

    pub(crate) fn write_u32(&mut self, off: usize, value: u32) -> Result<(), EditError> {
        self.write_bytes(off, &value.to_be_bytes())
    }

    /// Overwrite the frame with `bytes`, starting at `off`.
    pub(crate) fn write_bytes(&mut self, off: usize, bytes: &[u8]) -> Result<(), EditError> {
        self.data_mut()
            .get_mut(off..off + bytes.len())
            .ok_or(EditError::TooShort(off))?
            .copy_from_slice(bytes);
        Ok(())
    }

    /// Open `len` bytes at offset `at` by moving the preceding `at` bytes towards the front.
    ///
    /// The new bytes hold stale data until overwritten. Layer offsets are not adjusted.
    pub(crate) fn insert_gap(&mut self, at: usize, len: u16) -> Result<(), EditError> {
        if at > self.len() {
            return Err(EditError::TooShort(at));
        }
        let data = self
            .buf
            .prepend(len)
            .map_err(|_| EditError::NotEnoughHeadroom)?;
        data.copy_within(len as usize..len as usize + at, 0);
        Ok(())
    }

    /// Remove `len` bytes at offset `at` by moving the preceding `at` bytes towards the back.
    ///
    /// Layer offsets are not adjusted.
    pub(crate) fn remove_gap(&mut self, at: usize, len: u16) -> Result<(), EditError> {
        if at + len as usize > self.len() {
            return Err(EditError::TooShort(at));
        }
        self.data_mut().copy_within(0..at, len as usize);
        self.buf
            .trim_from_start(len)
            .map_err(|_| EditError::TooShort(at))?;
        Ok(())
    }
}
