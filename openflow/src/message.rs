// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Messages and their framing.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use net::flow_key::FlowKey;
use net::port::PortNo;
use tracing::{debug, trace};

use crate::action::{self, Action, ActionScope};
use crate::error::{DecodeError, ErrorCode};
use crate::header::{Header, MsgType, OFP_VERSION};
use crate::matching::{self, MATCH_LEN};

/// Most bytes of an offending message copied into an error reply.
pub const ERROR_DATA_MAX: usize = 64;

/// Largest message the 16-bit header length can describe, header included.
pub const MAX_MESSAGE_LEN: usize = 0xFFFF;

/// Append as much of `data` as still fits in the message.
fn put_tail(out: &mut BytesMut, data: &[u8]) {
    let room = MAX_MESSAGE_LEN.saturating_sub(out.len());
    if data.len() > room {
        debug!("message full: keeping {room} of {} data bytes", data.len());
    }
    out.put_slice(&data[..data.len().min(room)]);
}

/// Handle of a packet held by the datapath while the controller decides about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

impl BufferId {
    /// No buffered packet.
    pub const NONE: BufferId = BufferId(0xFFFF_FFFF);

    /// True unless this is [`BufferId::NONE`].
    #[must_use]
    pub fn is_some(self) -> bool {
        self != Self::NONE
    }
}

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Flow table commands.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowModCommand {
    /// Add a flow, replacing an identical one.
    Add = 0,
    /// Replace the actions of every flow covered by the match.
    Modify = 1,
    /// Replace the actions of the flow with exactly this match and priority.
    ModifyStrict = 2,
    /// Delete every flow covered by the match.
    Delete = 3,
    /// Delete the flow with exactly this match and priority.
    DeleteStrict = 4,
}

impl TryFrom<u16> for FlowModCommand {
    type Error = DecodeError;

    fn try_from(value: u16) -> Result<Self, DecodeError> {
        Ok(match value {
            0 => FlowModCommand::Add,
            1 => FlowModCommand::Modify,
            2 => FlowModCommand::ModifyStrict,
            3 => FlowModCommand::Delete,
            4 => FlowModCommand::DeleteStrict,
            other => return Err(DecodeError::BadFlowModCommand(other)),
        })
    }
}

/// Virtual port table commands.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VportModCommand {
    /// Register a virtual port.
    Add = 0,
    /// Remove a virtual port.
    Delete = 1,
}

impl TryFrom<u16> for VportModCommand {
    type Error = DecodeError;

    fn try_from(value: u16) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(VportModCommand::Add),
            1 => Ok(VportModCommand::Delete),
            other => Err(DecodeError::BadVportModCommand(other)),
        }
    }
}

/// Why a packet is sent to the controller.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketInReason {
    /// No flow matched.
    NoMatch = 0,
    /// An output action named the controller.
    Action = 1,
}

/// Why a flow was removed.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovedReason {
    /// The idle timeout elapsed.
    IdleTimeout = 0,
    /// The hard timeout elapsed.
    HardTimeout = 1,
    /// A delete command removed it.
    Delete = 2,
}

/// Datapath description sent in reply to a features request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeaturesReply {
    /// Datapath id.
    pub datapath_id: u64,
    /// Packets that can be buffered at once.
    pub n_buffers: u32,
    /// Number of flow tables.
    pub n_tables: u8,
    /// Capability bitmap.
    pub capabilities: u32,
    /// Bitmap of supported action types.
    pub actions: u32,
}

/// A packet sent to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketIn {
    /// Where the full packet is kept, or [`BufferId::NONE`].
    pub buffer_id: BufferId,
    /// Length of the full frame.
    pub total_len: u16,
    /// Ingress port.
    pub in_port: PortNo,
    /// Why the packet is sent.
    pub reason: PacketInReason,
    /// The frame, possibly truncated. Encoding keeps only what fits in [`MAX_MESSAGE_LEN`].
    pub data: Bytes,
}

/// Notification of a removed flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRemoved {
    /// The flow's match.
    pub key: FlowKey,
    /// The flow's priority.
    pub priority: u16,
    /// Why it was removed.
    pub reason: RemovedReason,
    /// How long the flow was installed.
    pub duration: Duration,
    /// The flow's idle timeout.
    pub idle_timeout: u16,
    /// Packets matched.
    pub packet_count: u64,
    /// Bytes matched.
    pub byte_count: u64,
}

/// A packet to run through an action list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketOut {
    /// A buffered packet, or [`BufferId::NONE`] when `data` holds the frame.
    pub buffer_id: BufferId,
    /// Ingress port the packet is treated as coming from.
    pub in_port: PortNo,
    /// Actions to apply.
    pub actions: Vec<Action>,
    /// The frame when unbuffered.
    pub data: Bytes,
}

/// A flow table change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowMod {
    /// The flow's match, as sent.
    pub key: FlowKey,
    /// What to do.
    pub command: FlowModCommand,
    /// Seconds without traffic before removal, 0 for never.
    pub idle_timeout: u16,
    /// Seconds before removal, 0 for never.
    pub hard_timeout: u16,
    /// Priority among overlapping wildcard flows.
    pub priority: u16,
    /// A buffered packet to run through the new actions.
    pub buffer_id: BufferId,
    /// Restricts deletes to flows that output to this port, unless [`PortNo::NONE`].
    pub out_port: PortNo,
    /// The flow's actions.
    pub actions: Vec<Action>,
}

/// A virtual port table change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VportMod {
    /// The virtual port.
    pub vport: PortNo,
    /// Where packets go after the actions ran.
    pub parent: PortNo,
    /// What to do.
    pub command: VportModCommand,
    /// Actions run on every packet sent to the port.
    pub actions: Vec<Action>,
}

/// An error report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMsg {
    /// Error type and code.
    pub code: ErrorCode,
    /// Start of the offending message.
    pub data: Bytes,
}

/// A message body.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Message {
    Hello,
    Error(ErrorMsg),
    EchoRequest(Bytes),
    EchoReply(Bytes),
    Vendor { vendor: u32, data: Bytes },
    FeaturesRequest,
    FeaturesReply(FeaturesReply),
    PacketIn(PacketIn),
    FlowRemoved(FlowRemoved),
    PacketOut(PacketOut),
    FlowMod(FlowMod),
    BarrierRequest,
    BarrierReply,
    VportMod(VportMod),
}

impl Message {
    /// Wire type of the message.
    #[must_use]
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::Hello => MsgType::Hello,
            Message::Error(_) => MsgType::Error,
            Message::EchoRequest(_) => MsgType::EchoRequest,
            Message::EchoReply(_) => MsgType::EchoReply,
            Message::Vendor { .. } => MsgType::Vendor,
            Message::FeaturesRequest => MsgType::FeaturesRequest,
            Message::FeaturesReply(_) => MsgType::FeaturesReply,
            Message::PacketIn(_) => MsgType::PacketIn,
            Message::FlowRemoved(_) => MsgType::FlowRemoved,
            Message::PacketOut(_) => MsgType::PacketOut,
            Message::FlowMod(_) => MsgType::FlowMod,
            Message::BarrierRequest => MsgType::BarrierRequest,
            Message::BarrierReply => MsgType::BarrierReply,
            Message::VportMod(_) => MsgType::VportMod,
        }
    }
}

/// A message with its transaction id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Transaction id.
    pub xid: u32,
    /// The message.
    pub body: Message,
}

fn need(body: &[u8], len: usize) -> Result<(), DecodeError> {
    if body.len() < len {
        Err(DecodeError::BadLen(body.len()))
    } else {
        Ok(())
    }
}

fn exact(body: &[u8], len: usize) -> Result<(), DecodeError> {
    if body.len() == len {
        Ok(())
    } else {
        Err(DecodeError::BadLen(body.len()))
    }
}

fn duration_parts(duration: Duration) -> (u32, u32) {
    (
        u32::try_from(duration.as_secs()).unwrap_or(u32::MAX),
        duration.subsec_nanos(),
    )
}

impl Frame {
    /// Pair a message with a transaction id.
    #[must_use]
    pub fn new(xid: u32, body: Message) -> Frame {
        Frame { xid, body }
    }

    /// An error reply quoting the start of `offending`.
    #[must_use]
    pub fn error(xid: u32, code: ErrorCode, offending: &[u8]) -> Frame {
        let quoted = &offending[..offending.len().min(ERROR_DATA_MAX)];
        Frame::new(
            xid,
            Message::Error(ErrorMsg {
                code,
                data: Bytes::copy_from_slice(quoted),
            }),
        )
    }

    /// Decode exactly one message.
    ///
    /// Action lists are validated for the scope of the carrying message.
    ///
    /// # Errors
    ///
    /// Fails if the header is malformed, names another version, an unknown type, or a length
    /// other than `raw.len()`, or if the body does not decode.
    pub fn decode(raw: &[u8]) -> Result<Frame, DecodeError> {
        let header = Header::peek(raw)?;
        if header.version != OFP_VERSION {
            return Err(DecodeError::BadVersion(header.version));
        }
        if header.length as usize != raw.len() {
            return Err(DecodeError::BadLen(header.length as usize));
        }
        let kind = MsgType::try_from(header.kind)?;
        let mut body = &raw[Header::LEN..];
        let message = match kind {
            MsgType::Hello => Message::Hello,
            MsgType::FeaturesRequest => {
                exact(body, 0)?;
                Message::FeaturesRequest
            }
            MsgType::BarrierRequest => {
                exact(body, 0)?;
                Message::BarrierRequest
            }
            MsgType::BarrierReply => {
                exact(body, 0)?;
                Message::BarrierReply
            }
            MsgType::EchoRequest => Message::EchoRequest(Bytes::copy_from_slice(body)),
            MsgType::EchoReply => Message::EchoReply(Bytes::copy_from_slice(body)),
            MsgType::Vendor => {
                need(body, 4)?;
                let vendor = body.get_u32();
                Message::Vendor {
                    vendor,
                    data: Bytes::copy_from_slice(body),
                }
            }
            MsgType::Error => {
                need(body, 4)?;
                let code = ErrorCode {
                    kind: body.get_u16(),
                    code: body.get_u16(),
                };
                Message::Error(ErrorMsg {
                    code,
                    data: Bytes::copy_from_slice(body),
                })
            }
            MsgType::FeaturesReply => {
                exact(body, 24)?;
                let datapath_id = body.get_u64();
                let n_buffers = body.get_u32();
                let n_tables = body.get_u8();
                body.advance(3);
                Message::FeaturesReply(FeaturesReply {
                    datapath_id,
                    n_buffers,
                    n_tables,
                    capabilities: body.get_u32(),
                    actions: body.get_u32(),
                })
            }
            MsgType::PacketIn => {
                need(body, 12)?;
                let buffer_id = BufferId(body.get_u32());
                let total_len = body.get_u16();
                let reason = match body.get_u8() {
                    0 => PacketInReason::NoMatch,
                    _ => PacketInReason::Action,
                };
                body.advance(1);
                Message::PacketIn(PacketIn {
                    buffer_id,
                    total_len,
                    in_port: PortNo(body.get_u32()),
                    reason,
                    data: Bytes::copy_from_slice(body),
                })
            }
            MsgType::FlowRemoved => {
                exact(body, 80)?;
                let key = matching::decode(&mut body)?;
                let priority = body.get_u16();
                let reason = match body.get_u8() {
                    0 => RemovedReason::IdleTimeout,
                    1 => RemovedReason::HardTimeout,
                    _ => RemovedReason::Delete,
                };
                body.advance(1);
                let secs = body.get_u32();
                let nanos = body.get_u32();
                let idle_timeout = body.get_u16();
                body.advance(2);
                Message::FlowRemoved(FlowRemoved {
                    key,
                    priority,
                    reason,
                    duration: Duration::new(u64::from(secs), nanos),
                    idle_timeout,
                    packet_count: body.get_u64(),
                    byte_count: body.get_u64(),
                })
            }
            MsgType::PacketOut => {
                need(body, 16)?;
                let buffer_id = BufferId(body.get_u32());
                let in_port = PortNo(body.get_u32());
                let actions_len = body.get_u16() as usize;
                body.advance(6);
                need(body, actions_len)?;
                let actions = action::decode_list(&body[..actions_len], ActionScope::PacketOut)?;
                body.advance(actions_len);
                Message::PacketOut(PacketOut {
                    buffer_id,
                    in_port,
                    actions,
                    data: Bytes::copy_from_slice(body),
                })
            }
            MsgType::FlowMod => {
                need(body, MATCH_LEN + 20)?;
                let key = matching::decode(&mut body)?;
                let command = FlowModCommand::try_from(body.get_u16())?;
                let idle_timeout = body.get_u16();
                let hard_timeout = body.get_u16();
                let priority = body.get_u16();
                let buffer_id = BufferId(body.get_u32());
                let out_port = PortNo(body.get_u32());
                body.advance(4);
                Message::FlowMod(FlowMod {
                    key,
                    command,
                    idle_timeout,
                    hard_timeout,
                    priority,
                    buffer_id,
                    out_port,
                    actions: action::decode_list(body, ActionScope::Flow)?,
                })
            }
            MsgType::VportMod => {
                need(body, 12)?;
                let vport = PortNo(body.get_u32());
                let parent = PortNo(body.get_u32());
                let command = VportModCommand::try_from(body.get_u16())?;
                body.advance(2);
                Message::VportMod(VportMod {
                    vport,
                    parent,
                    command,
                    actions: action::decode_list(body, ActionScope::Vport)?,
                })
            }
        };
        debug!("decoded {kind:?} xid {}", header.xid);
        Ok(Frame {
            xid: header.xid,
            body: message,
        })
    }

    /// Encode the message, header included.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(64);
        Header {
            version: OFP_VERSION,
            kind: self.body.msg_type() as u8,
            length: 0,
            xid: self.xid,
        }
        .put(&mut out);
        match &self.body {
            Message::Hello
            | Message::FeaturesRequest
            | Message::BarrierRequest
            | Message::BarrierReply => {}
            Message::EchoRequest(data) | Message::EchoReply(data) => put_tail(&mut out, data),
            Message::Vendor { vendor, data } => {
                out.put_u32(*vendor);
                put_tail(&mut out, data);
            }
            Message::Error(err) => {
                out.put_u16(err.code.kind);
                out.put_u16(err.code.code);
                out.put_slice(&err.data[..err.data.len().min(ERROR_DATA_MAX)]);
            }
            Message::FeaturesReply(features) => {
                out.put_u64(features.datapath_id);
                out.put_u32(features.n_buffers);
                out.put_u8(features.n_tables);
                out.put_bytes(0, 3);
                out.put_u32(features.capabilities);
                out.put_u32(features.actions);
            }
            Message::PacketIn(packet_in) => {
                out.put_u32(packet_in.buffer_id.0);
                out.put_u16(packet_in.total_len);
                out.put_u8(packet_in.reason as u8);
                out.put_u8(0);
                out.put_u32(packet_in.in_port.0);
                put_tail(&mut out, &packet_in.data);
            }
            Message::FlowRemoved(removed) => {
                let (secs, nanos) = duration_parts(removed.duration);
                matching::encode(&removed.key, &mut out);
                out.put_u16(removed.priority);
                out.put_u8(removed.reason as u8);
                out.put_u8(0);
                out.put_u32(secs);
                out.put_u32(nanos);
                out.put_u16(removed.idle_timeout);
                out.put_bytes(0, 2);
                out.put_u64(removed.packet_count);
                out.put_u64(removed.byte_count);
            }
            Message::PacketOut(packet_out) => {
                out.put_u32(packet_out.buffer_id.0);
                out.put_u32(packet_out.in_port.0);
                #[allow(clippy::cast_possible_truncation)] // bounded by the message length
                out.put_u16(action::list_len(&packet_out.actions) as u16);
                out.put_bytes(0, 6);
                action::encode_list(&packet_out.actions, &mut out);
                put_tail(&mut out, &packet_out.data);
            }
            Message::FlowMod(flow_mod) => {
                matching::encode(&flow_mod.key, &mut out);
                out.put_u16(flow_mod.command as u16);
                out.put_u16(flow_mod.idle_timeout);
                out.put_u16(flow_mod.hard_timeout);
                out.put_u16(flow_mod.priority);
                out.put_u32(flow_mod.buffer_id.0);
                out.put_u32(flow_mod.out_port.0);
                out.put_u32(0);
                action::encode_list(&flow_mod.actions, &mut out);
            }
            Message::VportMod(vport_mod) => {
                out.put_u32(vport_mod.vport.0);
                out.put_u32(vport_mod.parent.0);
                out.put_u16(vport_mod.command as u16);
                out.put_u16(0);
                action::encode_list(&vport_mod.actions, &mut out);
            }
        }
        // only an oversized action list can still overflow; the header must describe the body
        out.truncate(MAX_MESSAGE_LEN);
        let length = u16::try_from(out.len()).unwrap_or(u16::MAX);
        out[2..4].copy_from_slice(&length.to_be_bytes());
        trace!("encoded {:?} ({length} bytes)", self.body.msg_type());
        out.freeze()
    }
}
