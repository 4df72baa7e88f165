// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The datapath: tables, buffers and the receive path.

use std::time::Instant;

use bytes::Bytes;
use concurrency::sync::Arc;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use net::buffer::HeapBuffer;
use net::flow_key::extract;
use net::packet::Packet;
use net::port::PortNo;
use openflow::message::{Message, PacketIn, PacketInReason, RemovedReason};
use openflow::{BufferId, Frame};
use tracing::{debug, trace, warn};

use crate::buffer_pool::BufferPool;
use crate::chain::{FlowEntry, FlowTable};
use crate::config::{ConfigError, DatapathConfig};
use crate::execute::Transmit;
use crate::vport::VportTable;

/// An OpenFlow datapath.
///
/// Every entry point takes `&self`; the forwarding path ([`Datapath::receive`]) and the
/// control path ([`Datapath::handle_control`]) may run on different threads against one
/// `Arc<Datapath>`.
pub struct Datapath<Tx: Transmit<HeapBuffer>> {
    config: DatapathConfig,
    flows: FlowTable,
    vports: VportTable,
    buffers: BufferPool<HeapBuffer>,
    tx: Tx,
    upcall_tx: Sender<Frame>,
    upcall_rx: Receiver<Frame>,
}

impl<Tx: Transmit<HeapBuffer>> std::fmt::Debug for Datapath<Tx> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datapath")
            .field("config", &self.config)
            .field("flows", &self.flows.stats())
            .field("vports", &self.vports.stats())
            .finish_non_exhaustive()
    }
}

pub(crate) fn saturating_len(len: usize) -> u16 {
    u16::try_from(len).unwrap_or(u16::MAX)
}

impl<Tx: Transmit<HeapBuffer>> Datapath<Tx> {
    /// Build a datapath sending its packets to `tx`.
    ///
    /// # Errors
    ///
    /// Fails if `config` does not validate or its tracing string is rejected.
    pub fn new(config: DatapathConfig, tx: Tx) -> Result<Self, ConfigError> {
        config.validate()?;
        if let Some(tracing) = &config.tracing {
            tracectl::log_control().setup_from_string(tracing)?;
        }
        let (upcall_tx, upcall_rx) = crossbeam_channel::bounded(config.upcall_queue_depth);
        debug!(
            "datapath {:#x}: {} flows, {} vports, {} buffers",
            config.datapath_id, config.max_flows, config.max_vports, config.buffer_slots
        );
        Ok(Datapath {
            flows: FlowTable::new(config.max_flows),
            vports: VportTable::new(config.max_vports),
            buffers: BufferPool::new(config.buffer_slots, config.buffer_retention()),
            tx,
            upcall_tx,
            upcall_rx,
            config,
        })
    }

    /// The configuration the datapath was built with.
    #[must_use]
    pub fn config(&self) -> &DatapathConfig {
        &self.config
    }

    /// The flow table.
    #[must_use]
    pub fn flows(&self) -> &FlowTable {
        &self.flows
    }

    /// The virtual port table.
    #[must_use]
    pub fn vports(&self) -> &VportTable {
        &self.vports
    }

    /// Where packets are sent.
    #[must_use]
    pub fn tx(&self) -> &Tx {
        &self.tx
    }

    /// Packets buffered for the controller.
    #[must_use]
    pub fn buffers(&self) -> &BufferPool<HeapBuffer> {
        &self.buffers
    }

    /// The asynchronous messages for the controller (packet-in, flow-removed).
    #[must_use]
    pub fn upcalls(&self) -> Receiver<Frame> {
        self.upcall_rx.clone()
    }

    /// Process a frame received on a physical port.
    pub fn receive(&self, in_port: PortNo, buf: HeapBuffer) {
        self.receive_at(in_port, buf, Instant::now());
    }

    pub(crate) fn receive_at(&self, in_port: PortNo, buf: HeapBuffer, now: Instant) {
        let mut packet = Packet::new(buf, in_port);
        let (key, fragment) = extract(&mut packet);
        trace!("received {} bytes on {in_port}: {key} (fragment: {fragment})", packet.len());
        match self.flows.lookup(&key) {
            Some(entry) => {
                entry.hit(packet.len(), now);
                self.execute(packet, key, &entry.actions(), false, now);
            }
            None => self.miss(&packet, now),
        }
    }

    /// Send a packet nothing matched to the controller, buffering it if a slot is free.
    pub(crate) fn miss(&self, packet: &Packet<HeapBuffer>, now: Instant) {
        let (buffer_id, data) = match self.buffers.save(packet, now) {
            Ok(id) => (id, packet.truncated(usize::from(self.config.miss_send_len))),
            Err(e) => {
                warn!("{e}, sending the full frame");
                (BufferId::NONE, packet.data())
            }
        };
        debug!("miss on {}, upcall with buffer {buffer_id}", packet.meta.in_port);
        self.upcall(Message::PacketIn(PacketIn {
            buffer_id,
            total_len: saturating_len(packet.len()),
            in_port: packet.meta.in_port,
            reason: PacketInReason::NoMatch,
            data: Bytes::copy_from_slice(data),
        }));
    }

    /// Queue an asynchronous message. Never blocks; the message is dropped if the queue is full.
    pub(crate) fn upcall(&self, body: Message) {
        match self.upcall_tx.try_send(Frame::new(0, body)) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                warn!("upcall queue full, dropping {:?}", frame.body.msg_type());
            }
            Err(TrySendError::Disconnected(_)) => debug!("no upcall receiver"),
        }
    }

    pub(crate) fn transmit(&self, port: PortNo, packet: Packet<HeapBuffer>) {
        trace!("transmit {} bytes on {port}", packet.len());
        self.tx.transmit(port, packet);
    }

    /// Remove the flows whose timeout elapsed and notify the controller.
    ///
    /// Returns the number of removed flows.
    pub fn expire_flows(&self, now: Instant) -> usize {
        let expired = self.flows.expire(now);
        for (entry, reason) in &expired {
            self.upcall(Message::FlowRemoved(entry.removed(*reason, now)));
        }
        expired.len()
    }

    pub(crate) fn notify_deleted(&self, entries: &[Arc<FlowEntry>], now: Instant) {
        for entry in entries {
            self.upcall(Message::FlowRemoved(entry.removed(RemovedReason::Delete, now)));
        }
    }
}
