// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The 8 byte header which starts every message.

use bytes::{Buf, BufMut};

use crate::error::DecodeError;

/// The only protocol version spoken.
pub const OFP_VERSION: u8 = 0x01;

/// Message types.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum MsgType {
    Hello = 0,
    Error = 1,
    EchoRequest = 2,
    EchoReply = 3,
    Vendor = 4,
    FeaturesRequest = 5,
    FeaturesReply = 6,
    PacketIn = 10,
    FlowRemoved = 11,
    PacketOut = 13,
    FlowMod = 14,
    BarrierRequest = 18,
    BarrierReply = 19,
    VportMod = 22,
}

impl TryFrom<u8> for MsgType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        Ok(match value {
            0 => MsgType::Hello,
            1 => MsgType::Error,
            2 => MsgType::EchoRequest,
            3 => MsgType::EchoReply,
            4 => MsgType::Vendor,
            5 => MsgType::FeaturesRequest,
            6 => MsgType::FeaturesReply,
            10 => MsgType::PacketIn,
            11 => MsgType::FlowRemoved,
            13 => MsgType::PacketOut,
            14 => MsgType::FlowMod,
            18 => MsgType::BarrierRequest,
            19 => MsgType::BarrierReply,
            22 => MsgType::VportMod,
            other => return Err(DecodeError::BadType(other)),
        })
    }
}

/// Message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version.
    pub version: u8,
    /// Raw message type.
    pub kind: u8,
    /// Total message length, header included.
    pub length: u16,
    /// Transaction id, echoed in replies.
    pub xid: u32,
}

impl Header {
    /// Header size on the wire.
    pub const LEN: usize = 8;

    /// Read the header at the start of `raw` without checking version, type or length.
    ///
    /// # Errors
    ///
    /// Fails with [`DecodeError::BadLen`] if fewer than 8 bytes are available.
    pub fn peek(raw: &[u8]) -> Result<Header, DecodeError> {
        if raw.len() < Self::LEN {
            return Err(DecodeError::BadLen(raw.len()));
        }
        let mut buf = raw;
        Ok(Header {
            version: buf.get_u8(),
            kind: buf.get_u8(),
            length: buf.get_u16(),
            xid: buf.get_u32(),
        })
    }

    pub(crate) fn put(&self, out: &mut impl BufMut) {
        out.put_u8(self.version);
        out.put_u8(self.kind);
        out.put_u16(self.length);
        out.put_u32(self.xid);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn peek_reads_big_endian() {
        let raw = [1, 14, 0, 76, 0xde, 0xad, 0xbe, 0xef, 0xff];
        let header = Header::peek(&raw).unwrap();
        assert_eq!(
            header,
            Header {
                version: 1,
                kind: 14,
                length: 76,
                xid: 0xdead_beef
            }
        );
        assert_eq!(MsgType::try_from(header.kind), Ok(MsgType::FlowMod));
        assert_eq!(MsgType::try_from(7), Err(DecodeError::BadType(7)));
        assert_eq!(Header::peek(&raw[..7]), Err(DecodeError::BadLen(7)));
    }
}
