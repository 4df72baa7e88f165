// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Frames and a recording transmitter for the datapath tests.

use concurrency::MutexExt;
use concurrency::sync::Mutex;
use net::buffer::HeapBuffer;
use net::mpls::LabelWord;
use net::packet::Packet;
use net::port::PortNo;

use crate::execute::Transmit;

/// Keeps every transmitted frame.
#[derive(Debug, Default)]
pub(crate) struct Recorder {
    sent: Mutex<Vec<(PortNo, Vec<u8>)>>,
}

impl Recorder {
    pub(crate) fn sent(&self) -> Vec<(PortNo, Vec<u8>)> {
        self.sent.lock_or_recover().clone()
    }
}

impl Transmit<HeapBuffer> for Recorder {
    fn transmit(&self, port: PortNo, packet: Packet<HeapBuffer>) {
        self.sent.lock_or_recover().push((port, packet.data().to_vec()));
    }
}

pub(crate) fn tcp_frame() -> Vec<u8> {
    let mut frame = Vec::new();
    etherparse::PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
        .tcp(1234, 80, 1, 1024)
        .write(&mut frame, b"payload")
        .unwrap();
    frame
}

/// An IPv4/UDP frame under one bottom-of-stack label.
pub(crate) fn mpls_udp_frame(label: u32, ttl: u8) -> Vec<u8> {
    let mut inner = Vec::new();
    etherparse::PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
        .udp(53, 5353)
        .write(&mut inner, b"hello")
        .unwrap();
    let mut frame = inner[..12].to_vec();
    frame.extend_from_slice(&[0x88, 0x47]);
    frame.extend_from_slice(&LabelWord::new(label, 0, true, ttl).0.to_be_bytes());
    frame.extend_from_slice(&inner[14..]);
    frame
}
