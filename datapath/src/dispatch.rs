// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Control messages.
//!
//! A message is decoded and validated in full before any table is touched. Replies are
//! returned to the caller; packet-in and flow-removed notifications go to the upcall queue.

use std::time::Instant;

use net::buffer::HeapBuffer;
use net::flow_key::extract;
use net::packet::Packet;
use openflow::action::SUPPORTED_ACTIONS;
use openflow::error::{BadRequestCode, FlowModFailedCode};
use openflow::message::{
    FeaturesReply, FlowMod, FlowModCommand, PacketOut, VportMod, VportModCommand,
};
use openflow::{BufferId, ErrorCode, Frame, Header, Message};
use tracing::debug;

use crate::chain::{FlowEntry, Selector};
use crate::datapath::Datapath;
use crate::execute::Transmit;

impl<Tx: Transmit<HeapBuffer>> Datapath<Tx> {
    /// Handle one control message and return the replies to send back.
    pub fn handle_control(&self, raw: &[u8]) -> Vec<Frame> {
        self.handle_control_at(raw, Instant::now())
    }

    pub(crate) fn handle_control_at(&self, raw: &[u8], now: Instant) -> Vec<Frame> {
        let frame = match Frame::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                let xid = Header::peek(raw).map_or(0, |header| header.xid);
                debug!("xid {xid}: rejected message: {e}");
                return vec![Frame::error(xid, e.code(), raw)];
            }
        };
        let xid = frame.xid;
        debug!("xid {xid}: {:?}", frame.body.msg_type());
        let result = match frame.body {
            Message::Hello => Ok(None),
            Message::EchoRequest(data) => Ok(Some(Message::EchoReply(data))),
            Message::FeaturesRequest => Ok(Some(Message::FeaturesReply(self.features()))),
            Message::BarrierRequest => Ok(Some(Message::BarrierReply)),
            Message::FlowMod(flow_mod) => self.flow_mod(flow_mod, now).map(|()| None),
            Message::VportMod(vport_mod) => self.vport_mod(vport_mod).map(|()| None),
            Message::PacketOut(packet_out) => self.packet_out(packet_out, now).map(|()| None),
            Message::Vendor { vendor, .. } => {
                debug!("unknown vendor {vendor:#x}");
                Err(BadRequestCode::BadVendor.into())
            }
            other => {
                debug!("unexpected {:?} from the controller", other.msg_type());
                Err(BadRequestCode::BadType.into())
            }
        };
        match result {
            Ok(reply) => reply.map(|body| Frame::new(xid, body)).into_iter().collect(),
            Err(code) => {
                debug!("xid {xid}: error {code}");
                vec![Frame::error(xid, code, raw)]
            }
        }
    }

    fn features(&self) -> FeaturesReply {
        FeaturesReply {
            datapath_id: self.config().datapath_id,
            n_buffers: u32::try_from(self.buffers().capacity()).unwrap_or(u32::MAX),
            n_tables: 1,
            capabilities: 0,
            actions: SUPPORTED_ACTIONS,
        }
    }

    fn flow_mod(&self, flow_mod: FlowMod, now: Instant) -> Result<(), ErrorCode> {
        let selector = Selector {
            key: &flow_mod.key,
            priority: flow_mod.priority,
            strict: matches!(
                flow_mod.command,
                FlowModCommand::ModifyStrict | FlowModCommand::DeleteStrict
            ),
        };
        match flow_mod.command {
            FlowModCommand::Add => self.add_flow(&flow_mod, now)?,
            FlowModCommand::Modify | FlowModCommand::ModifyStrict => {
                if self.flows().modify(&selector, &flow_mod.actions) == 0 {
                    self.add_flow(&flow_mod, now)?;
                }
            }
            FlowModCommand::Delete | FlowModCommand::DeleteStrict => {
                let removed = self.flows().delete(&selector, flow_mod.out_port);
                self.notify_deleted(&removed, now);
                return Ok(());
            }
        }
        self.release_buffer(flow_mod.buffer_id, &flow_mod, now);
        Ok(())
    }

    fn add_flow(&self, flow_mod: &FlowMod, now: Instant) -> Result<(), ErrorCode> {
        let entry = FlowEntry::new(
            flow_mod.key,
            flow_mod.priority,
            flow_mod.idle_timeout,
            flow_mod.hard_timeout,
            flow_mod.actions.clone(),
            now,
        );
        match self.flows().insert(entry) {
            Ok(_) => Ok(()),
            Err(e) => {
                debug!("{e}");
                Err(FlowModFailedCode::AllTablesFull.into())
            }
        }
    }

    /// Run the packet buffered as `id`, if any, through the new flow's actions.
    fn release_buffer(&self, id: BufferId, flow_mod: &FlowMod, now: Instant) {
        if !id.is_some() {
            return;
        }
        let Some(mut packet) = self.buffers().retrieve(id) else {
            debug!("buffer {id} is gone, flow installed anyway");
            return;
        };
        let (key, _) = extract(&mut packet);
        self.execute(packet, key, &flow_mod.actions, false, now);
    }

    fn vport_mod(&self, vport_mod: VportMod) -> Result<(), ErrorCode> {
        let result = match vport_mod.command {
            VportModCommand::Add => {
                self.vports()
                    .add(vport_mod.vport, vport_mod.parent, vport_mod.actions)
            }
            VportModCommand::Delete => self.vports().delete(vport_mod.vport),
        };
        result.map_err(|e| {
            debug!("{e}");
            e.code().into()
        })
    }

    fn packet_out(&self, packet_out: PacketOut, now: Instant) -> Result<(), ErrorCode> {
        let mut packet = if packet_out.buffer_id.is_some() {
            let mut packet = self
                .buffers()
                .retrieve(packet_out.buffer_id)
                .ok_or(BadRequestCode::BufferUnknown)?;
            packet.meta.in_port = packet_out.in_port;
            packet
        } else if packet_out.data.is_empty() {
            return Err(BadRequestCode::BadLen.into());
        } else {
            Packet::new(HeapBuffer::from_raw_data(&packet_out.data), packet_out.in_port)
        };
        let (key, _) = extract(&mut packet);
        self.execute(packet, key, &packet_out.actions, true, now);
        Ok(())
    }
}

#[cfg(all(test, not(feature = "shuttle")))]
mod test {
    use super::*;
    use crate::config::DatapathConfig;
    use crate::test_utils::{Recorder, tcp_frame};
    use net::flow_key::{FlowKey, Wildcards};
    use net::port::PortNo;
    use openflow::action::Action;
    use openflow::error::{BadActionCode, VportModFailedCode};
    use openflow::message::{ErrorMsg, PacketInReason, RemovedReason};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn datapath() -> Datapath<Recorder> {
        Datapath::new(DatapathConfig::default(), Recorder::default()).unwrap()
    }

    fn output(port: PortNo) -> Action {
        Action::Output { port, max_len: 0 }
    }

    fn wildcard_all() -> FlowKey {
        FlowKey {
            wildcards: Wildcards::ALL,
            ..FlowKey::default()
        }
    }

    fn flow_mod(command: FlowModCommand, priority: u16, actions: Vec<Action>) -> FlowMod {
        FlowMod {
            key: wildcard_all(),
            command,
            idle_timeout: 0,
            hard_timeout: 0,
            priority,
            buffer_id: BufferId::NONE,
            out_port: PortNo::NONE,
            actions,
        }
    }

    fn send(dp: &Datapath<Recorder>, xid: u32, body: Message) -> Vec<Frame> {
        dp.handle_control(&Frame::new(xid, body).encode())
    }

    fn error_code(replies: &[Frame]) -> ErrorCode {
        match replies {
            [
                Frame {
                    body: Message::Error(ErrorMsg { code, .. }),
                    ..
                },
            ] => *code,
            other => panic!("expected one error reply, got {other:?}"),
        }
    }

    #[test]
    fn echo_mirrors_payload_and_xid() {
        let dp = datapath();
        let replies = send(&dp, 77, Message::EchoRequest(bytes::Bytes::from_static(b"ping")));
        assert_eq!(
            replies,
            vec![Frame::new(77, Message::EchoReply(bytes::Bytes::from_static(b"ping")))]
        );
    }

    #[test]
    fn session_messages() {
        let dp = datapath();
        assert_eq!(send(&dp, 1, Message::Hello), vec![]);
        assert_eq!(
            send(&dp, 2, Message::BarrierRequest),
            vec![Frame::new(2, Message::BarrierReply)]
        );
        let replies = send(&dp, 3, Message::FeaturesRequest);
        let [Frame {
            xid: 3,
            body: Message::FeaturesReply(features),
        }] = replies.as_slice()
        else {
            panic!("expected a features reply, got {replies:?}");
        };
        assert_eq!(features.n_buffers, 256);
        assert_eq!(features.n_tables, 1);
        assert_eq!(features.actions, SUPPORTED_ACTIONS);
    }

    #[test]
    fn unexpected_messages_are_refused() {
        let dp = datapath();
        let vendor = Message::Vendor {
            vendor: 0x1234,
            data: bytes::Bytes::new(),
        };
        assert_eq!(error_code(&send(&dp, 1, vendor)), BadRequestCode::BadVendor.into());
        assert_eq!(
            error_code(&send(&dp, 1, Message::BarrierReply)),
            BadRequestCode::BadType.into()
        );
    }

    #[test]
    fn malformed_headers_are_reported_with_their_xid() {
        let dp = datapath();
        let mut raw = Frame::new(9, Message::Hello).encode().to_vec();
        raw[0] = 4;
        let replies = dp.handle_control(&raw);
        assert_eq!(replies[0].xid, 9);
        assert_eq!(error_code(&replies), BadRequestCode::BadVersion.into());

        let mut raw = Frame::new(9, Message::EchoRequest(bytes::Bytes::from_static(b"x")))
            .encode()
            .to_vec();
        raw.push(0);
        assert_eq!(error_code(&dp.handle_control(&raw)), BadRequestCode::BadLen.into());
    }

    #[test]
    fn malformed_actions_yield_the_exact_code() {
        // the first action starts after the header, the match and the fixed flow-mod fields
        const ACTION: usize = 76;
        let dp = datapath();
        let encoded = Frame::new(5, Message::FlowMod(flow_mod(
            FlowModCommand::Add,
            1,
            vec![output(PortNo(3))],
        )))
        .encode();

        let mut bad_type = encoded.to_vec();
        bad_type[ACTION..ACTION + 2].copy_from_slice(&8u16.to_be_bytes());
        let replies = dp.handle_control(&bad_type);
        assert_eq!(error_code(&replies), BadActionCode::BadType.into());
        let Message::Error(ErrorMsg { data, .. }) = &replies[0].body else {
            unreachable!()
        };
        assert_eq!(&data[..], &bad_type[..64]);

        let mut bad_len = encoded.to_vec();
        bad_len[ACTION + 2..ACTION + 4].copy_from_slice(&12u16.to_be_bytes());
        assert_eq!(error_code(&dp.handle_control(&bad_len)), BadActionCode::BadLen.into());

        let to_table = flow_mod(FlowModCommand::Add, 1, vec![output(PortNo::TABLE)]);
        assert_eq!(
            error_code(&send(&dp, 6, Message::FlowMod(to_table))),
            BadActionCode::BadOutPort.into()
        );
        let bad_pcp = flow_mod(FlowModCommand::Add, 1, vec![Action::SetVlanPcp(8)]);
        assert_eq!(
            error_code(&send(&dp, 7, Message::FlowMod(bad_pcp))),
            BadActionCode::BadArgument.into()
        );
        assert_eq!(dp.flows().stats().active, 0);
    }

    #[test]
    fn modify_on_an_empty_table_adds() {
        let dp = datapath();
        let modify = flow_mod(FlowModCommand::Modify, 10, vec![output(PortNo(3))]);
        assert_eq!(send(&dp, 1, Message::FlowMod(modify)), vec![]);
        assert_eq!(dp.flows().stats().active, 1);
        dp.receive(PortNo(1), HeapBuffer::from_raw_data(&tcp_frame()));
        assert_eq!(dp.tx_sent_ports(), vec![PortNo(3)]);

        let modify = flow_mod(FlowModCommand::ModifyStrict, 10, vec![output(PortNo(4))]);
        send(&dp, 2, Message::FlowMod(modify));
        assert_eq!(dp.flows().stats().active, 1);
        dp.receive(PortNo(1), HeapBuffer::from_raw_data(&tcp_frame()));
        assert_eq!(dp.tx_sent_ports(), vec![PortNo(3), PortNo(4)]);
    }

    #[test]
    #[traced_test]
    fn flow_mod_releases_the_buffered_packet() {
        let dp = datapath();
        let frame = tcp_frame();
        dp.receive(PortNo(1), HeapBuffer::from_raw_data(&frame));
        let Message::PacketIn(packet_in) = dp.upcalls().try_recv().unwrap().body else {
            panic!("expected a packet-in");
        };
        assert_eq!(packet_in.reason, PacketInReason::NoMatch);
        assert!(packet_in.buffer_id.is_some());

        let add = FlowMod {
            buffer_id: packet_in.buffer_id,
            ..flow_mod(FlowModCommand::Add, 1, vec![output(PortNo(3))])
        };
        assert_eq!(send(&dp, 1, Message::FlowMod(add.clone())), vec![]);
        assert_eq!(dp.tx_sent_ports(), vec![PortNo(3)]);

        // the buffer was consumed: the flow is still installed, with no error
        let again = FlowMod {
            priority: 2,
            ..add
        };
        assert_eq!(send(&dp, 2, Message::FlowMod(again)), vec![]);
        assert_eq!(dp.flows().stats().active, 2);
        assert_eq!(dp.tx_sent_ports(), vec![PortNo(3)]);
        assert!(logs_contain("flow installed anyway"));
    }

    #[test]
    fn deletes_notify_the_controller() {
        let dp = datapath();
        send(&dp, 1, Message::FlowMod(flow_mod(FlowModCommand::Add, 10, vec![output(PortNo(3))])));
        send(&dp, 2, Message::FlowMod(flow_mod(FlowModCommand::Add, 20, vec![output(PortNo(4))])));

        let strict_miss = flow_mod(FlowModCommand::DeleteStrict, 11, vec![]);
        assert_eq!(send(&dp, 3, Message::FlowMod(strict_miss)), vec![]);
        assert_eq!(dp.flows().stats().active, 2);
        assert!(dp.upcalls().try_recv().is_err());

        let by_port = FlowMod {
            out_port: PortNo(4),
            ..flow_mod(FlowModCommand::Delete, 0, vec![])
        };
        send(&dp, 4, Message::FlowMod(by_port));
        assert_eq!(dp.flows().stats().active, 1);
        let Message::FlowRemoved(removed) = dp.upcalls().try_recv().unwrap().body else {
            panic!("expected a flow-removed");
        };
        assert_eq!(removed.reason, RemovedReason::Delete);
        assert_eq!(removed.priority, 20);

        send(&dp, 5, Message::FlowMod(flow_mod(FlowModCommand::Delete, 0, vec![])));
        assert_eq!(dp.flows().stats().active, 0);
        assert_eq!(dp.upcalls().try_iter().count(), 1);
    }

    #[test]
    fn timeouts_notify_the_controller() {
        let dp = datapath();
        let now = Instant::now();
        let hard = FlowMod {
            hard_timeout: 5,
            ..flow_mod(FlowModCommand::Add, 1, vec![output(PortNo(3))])
        };
        let raw = Frame::new(1, Message::FlowMod(hard)).encode();
        assert_eq!(dp.handle_control_at(&raw, now), vec![]);
        assert_eq!(dp.expire_flows(now + Duration::from_secs(4)), 0);
        assert_eq!(dp.expire_flows(now + Duration::from_secs(5)), 1);
        let Message::FlowRemoved(removed) = dp.upcalls().try_recv().unwrap().body else {
            panic!("expected a flow-removed");
        };
        assert_eq!(removed.reason, RemovedReason::HardTimeout);
        assert_eq!(removed.duration, Duration::from_secs(5));
    }

    #[test]
    fn packet_out() {
        let dp = datapath();
        let frame = bytes::Bytes::from(tcp_frame());
        let inline = PacketOut {
            buffer_id: BufferId::NONE,
            in_port: PortNo(2),
            actions: vec![output(PortNo(5)), output(PortNo::IN_PORT)],
            data: frame,
        };
        assert_eq!(send(&dp, 1, Message::PacketOut(inline)), vec![]);
        assert_eq!(dp.tx_sent_ports(), vec![PortNo(5), PortNo(2)]);

        let unknown = PacketOut {
            buffer_id: BufferId(12),
            in_port: PortNo(2),
            actions: vec![output(PortNo(5))],
            data: bytes::Bytes::new(),
        };
        assert_eq!(
            error_code(&send(&dp, 2, Message::PacketOut(unknown.clone()))),
            BadRequestCode::BufferUnknown.into()
        );
        let empty = PacketOut {
            buffer_id: BufferId::NONE,
            ..unknown
        };
        assert_eq!(
            error_code(&send(&dp, 3, Message::PacketOut(empty))),
            BadRequestCode::BadLen.into()
        );
    }

    #[test]
    fn packet_out_to_table_runs_the_flow_table() {
        let dp = datapath();
        let frame = bytes::Bytes::from(tcp_frame());
        let to_table = PacketOut {
            buffer_id: BufferId::NONE,
            in_port: PortNo(2),
            actions: vec![output(PortNo::TABLE)],
            data: frame,
        };
        // nothing installed: the packet misses
        send(&dp, 1, Message::PacketOut(to_table.clone()));
        let Message::PacketIn(packet_in) = dp.upcalls().try_recv().unwrap().body else {
            panic!("expected a packet-in");
        };
        assert_eq!(packet_in.in_port, PortNo(2));

        send(&dp, 2, Message::FlowMod(flow_mod(FlowModCommand::Add, 1, vec![output(PortNo(6))])));
        send(&dp, 3, Message::PacketOut(to_table));
        assert_eq!(dp.tx_sent_ports(), vec![PortNo(6)]);
        assert_eq!(dp.flows().stats().matches, 1);
    }

    #[test]
    fn buffered_packet_out_uses_the_given_in_port() {
        let dp = datapath();
        dp.receive(PortNo(1), HeapBuffer::from_raw_data(&tcp_frame()));
        let Message::PacketIn(packet_in) = dp.upcalls().try_recv().unwrap().body else {
            panic!("expected a packet-in");
        };
        let release = PacketOut {
            buffer_id: packet_in.buffer_id,
            in_port: PortNo(9),
            actions: vec![output(PortNo::IN_PORT)],
            data: bytes::Bytes::new(),
        };
        assert_eq!(send(&dp, 1, Message::PacketOut(release.clone())), vec![]);
        assert_eq!(dp.tx_sent_ports(), vec![PortNo(9)]);
        assert_eq!(
            error_code(&send(&dp, 2, Message::PacketOut(release))),
            BadRequestCode::BufferUnknown.into()
        );
    }

    #[test]
    fn vport_mod() {
        let dp = datapath();
        let add = |vport: u32, parent: u32| VportMod {
            vport: PortNo(vport),
            parent: PortNo(parent),
            command: VportModCommand::Add,
            actions: vec![Action::SetVlanVid(7)],
        };
        assert_eq!(send(&dp, 1, Message::VportMod(add(0x1_0001, 2))), vec![]);
        assert_eq!(
            error_code(&send(&dp, 2, Message::VportMod(add(0x1_0003, 0x1_0002)))),
            VportModFailedCode::BadParent.into()
        );
        assert_eq!(
            error_code(&send(&dp, 3, Message::VportMod(add(0x1_0001, 2)))),
            VportModFailedCode::Exists.into()
        );
        let to_vport = flow_mod(FlowModCommand::Add, 1, vec![output(PortNo(0x1_0001))]);
        send(&dp, 4, Message::FlowMod(to_vport));
        dp.receive(PortNo(1), HeapBuffer::from_raw_data(&tcp_frame()));
        assert_eq!(dp.tx_sent_ports(), vec![PortNo(2)]);

        let delete = VportMod {
            command: VportModCommand::Delete,
            ..add(0x1_0001, 0)
        };
        assert_eq!(send(&dp, 5, Message::VportMod(delete.clone())), vec![]);
        assert_eq!(
            error_code(&send(&dp, 6, Message::VportMod(delete))),
            VportModFailedCode::Unknown.into()
        );
    }

    #[test]
    fn full_flow_table_is_reported() {
        let config = DatapathConfig {
            max_flows: 1,
            ..DatapathConfig::default()
        };
        let dp = Datapath::new(config, Recorder::default()).unwrap();
        send(&dp, 1, Message::FlowMod(flow_mod(FlowModCommand::Add, 1, vec![])));
        assert_eq!(
            error_code(&send(&dp, 2, Message::FlowMod(flow_mod(FlowModCommand::Add, 2, vec![])))),
            FlowModFailedCode::AllTablesFull.into()
        );
    }

    impl Datapath<Recorder> {
        fn tx_sent_ports(&self) -> Vec<PortNo> {
            self.tx().sent().into_iter().map(|(port, _)| port).collect()
        }
    }
}
