// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Virtual ports.
//!
//! A virtual port runs a fixed action list on every packet sent to it and hands the packet on
//! to its parent, which is either a physical port or another virtual port. Parents must exist
//! before their children and cannot be removed while they have any, so the parent graph is a
//! forest rooted at physical ports.

use std::collections::BTreeMap;

use concurrency::RwLockExt;
use concurrency::sync::RwLock;
use concurrency::sync::atomic::{AtomicU64, Ordering};
use net::buffer::PacketBufferMut;
use net::flow_key::FlowKey;
use net::packet::Packet;
use net::port::PortNo;
use openflow::action::Action;
use openflow::error::VportModFailedCode;
use tracing::{debug, error};

use crate::execute::apply;

/// Reasons a virtual port table change is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VportError {
    /// The port is already registered.
    #[error("virtual port {0} already exists")]
    Exists(PortNo),
    /// The parent is neither physical nor registered.
    #[error("parent {0} is neither a physical nor a known virtual port")]
    BadParent(PortNo),
    /// The number lies outside the virtual range.
    #[error("{0} is not a virtual port number")]
    BadVport(PortNo),
    /// The table is at capacity.
    #[error("virtual port table full ({0} entries)")]
    TableFull(usize),
    /// The port is not registered.
    #[error("no virtual port {0}")]
    Unknown(PortNo),
    /// Another virtual port still names this one as parent.
    #[error("virtual port {0} is the parent of another virtual port")]
    InUse(PortNo),
}

impl VportError {
    /// The protocol error code reported for this error.
    #[must_use]
    pub fn code(&self) -> VportModFailedCode {
        match self {
            VportError::Exists(_) => VportModFailedCode::Exists,
            VportError::BadParent(_) => VportModFailedCode::BadParent,
            VportError::BadVport(_) => VportModFailedCode::BadVport,
            VportError::TableFull(_) => VportModFailedCode::TableFull,
            VportError::Unknown(_) => VportModFailedCode::Unknown,
            VportError::InUse(_) => VportModFailedCode::InUse,
        }
    }
}

#[derive(Debug)]
struct VportEntry {
    parent: PortNo,
    actions: Vec<Action>,
    packets: AtomicU64,
    bytes: AtomicU64,
}

/// Virtual port table counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VportStats {
    /// Registered ports.
    pub entries: usize,
    /// Chain walks started.
    pub lookups: u64,
    /// Walks whose first port was found.
    pub direct_matches: u64,
    /// Entries found by following a virtual parent.
    pub chain_matches: u64,
}

/// The virtual ports, keyed by port number.
#[derive(Debug)]
pub struct VportTable {
    entries: RwLock<BTreeMap<PortNo, VportEntry>>,
    capacity: usize,
    lookups: AtomicU64,
    direct_matches: AtomicU64,
    chain_matches: AtomicU64,
}

impl VportTable {
    /// An empty table holding at most `capacity` ports (capped at the virtual range).
    #[must_use]
    pub fn new(capacity: usize) -> VportTable {
        VportTable {
            entries: RwLock::new(BTreeMap::new()),
            capacity: capacity.min(PortNo::VPORT_COUNT),
            lookups: AtomicU64::new(0),
            direct_matches: AtomicU64::new(0),
            chain_matches: AtomicU64::new(0),
        }
    }

    /// Register `vport`.
    ///
    /// # Errors
    ///
    /// Refuses numbers outside the virtual range, existing ports, a full table and parents
    /// that are neither physical nor registered.
    pub fn add(&self, vport: PortNo, parent: PortNo, actions: Vec<Action>) -> Result<(), VportError> {
        if !vport.is_virtual() {
            return Err(VportError::BadVport(vport));
        }
        let mut entries = self.entries.write_or_recover();
        if entries.contains_key(&vport) {
            return Err(VportError::Exists(vport));
        }
        if entries.len() >= self.capacity {
            return Err(VportError::TableFull(self.capacity));
        }
        if !parent.is_physical() && !entries.contains_key(&parent) {
            return Err(VportError::BadParent(parent));
        }
        debug!("add vport {vport} parent {parent} ({} actions)", actions.len());
        entries.insert(
            vport,
            VportEntry {
                parent,
                actions,
                packets: AtomicU64::new(0),
                bytes: AtomicU64::new(0),
            },
        );
        Ok(())
    }

    /// Remove `vport`.
    ///
    /// # Errors
    ///
    /// Refuses unknown ports and ports that are still some entry's parent.
    pub fn delete(&self, vport: PortNo) -> Result<(), VportError> {
        let mut entries = self.entries.write_or_recover();
        if !entries.contains_key(&vport) {
            return Err(VportError::Unknown(vport));
        }
        if entries.values().any(|entry| entry.parent == vport) {
            return Err(VportError::InUse(vport));
        }
        entries.remove(&vport);
        debug!("deleted vport {vport}");
        Ok(())
    }

    /// Packet and byte counters of `vport`.
    #[must_use]
    pub fn counters(&self, vport: PortNo) -> Option<(u64, u64)> {
        self.entries.read_or_recover().get(&vport).map(|entry| {
            (
                entry.packets.load(Ordering::Relaxed),
                entry.bytes.load(Ordering::Relaxed),
            )
        })
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> VportStats {
        VportStats {
            entries: self.entries.read_or_recover().len(),
            lookups: self.lookups.load(Ordering::Relaxed),
            direct_matches: self.direct_matches.load(Ordering::Relaxed),
            chain_matches: self.chain_matches.load(Ordering::Relaxed),
        }
    }

    /// Walk the chain starting at `start`, applying each entry's actions to the packet.
    ///
    /// Returns the physical port the packet leaves on, or `None` if it must be dropped
    /// because a port is missing or an action failed.
    pub fn run_chain<Buf: PacketBufferMut>(
        &self,
        start: PortNo,
        packet: &mut Packet<Buf>,
        key: &mut FlowKey,
    ) -> Option<PortNo> {
        let entries = self.entries.read_or_recover();
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let mut port = start;
        for depth in 0..=entries.len() {
            let Some(entry) = entries.get(&port) else {
                debug!("no virtual port {port}, dropping packet");
                return None;
            };
            if depth == 0 {
                self.direct_matches.fetch_add(1, Ordering::Relaxed);
            } else {
                self.chain_matches.fetch_add(1, Ordering::Relaxed);
            }
            entry.packets.fetch_add(1, Ordering::Relaxed);
            entry.bytes.fetch_add(packet.len() as u64, Ordering::Relaxed);
            for action in &entry.actions {
                if let Err(e) = apply(packet, key, action) {
                    debug!("vport {port}: {e}, dropping packet");
                    return None;
                }
            }
            if entry.parent.is_physical() {
                return Some(entry.parent);
            }
            port = entry.parent;
        }
        error!("virtual port chain from {start} does not end at a physical port");
        None
    }
}

#[cfg(all(test, not(feature = "shuttle")))]
mod test {
    use super::*;
    use net::buffer::HeapBuffer;
    use net::eth::EthType;
    use net::flow_key::extract;
    use net::mpls::{LabelWord, PopFlags, PushFlags};
    use openflow::action::VendorAction;

    fn push(label: u32) -> Action {
        Action::Vendor(VendorAction::PushMpls {
            flags: PushFlags::empty(),
            label: LabelWord::new(label, 0, false, 64),
        })
    }

    fn udp_packet() -> (Packet<HeapBuffer>, FlowKey) {
        let mut frame = Vec::new();
        etherparse::PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .udp(53, 5353)
            .write(&mut frame, b"hello")
            .unwrap();
        let mut packet = Packet::new(HeapBuffer::from_raw_data(&frame), PortNo(1));
        let (key, _) = extract(&mut packet);
        (packet, key)
    }

    #[test]
    fn add_checks() {
        let table = VportTable::new(2);
        assert_eq!(
            table.add(PortNo(5), PortNo(1), vec![]),
            Err(VportError::BadVport(PortNo(5)))
        );
        assert_eq!(
            table.add(PortNo(0x1_0001), PortNo(0x1_0002), vec![]),
            Err(VportError::BadParent(PortNo(0x1_0002)))
        );
        assert_eq!(
            table.add(PortNo(0x1_0001), PortNo::CONTROLLER, vec![]),
            Err(VportError::BadParent(PortNo::CONTROLLER))
        );
        table.add(PortNo(0x1_0001), PortNo(2), vec![]).unwrap();
        assert_eq!(
            table.add(PortNo(0x1_0001), PortNo(2), vec![]),
            Err(VportError::Exists(PortNo(0x1_0001)))
        );
        table.add(PortNo(0x1_0002), PortNo(0x1_0001), vec![]).unwrap();
        assert_eq!(
            table.add(PortNo(0x1_0003), PortNo(2), vec![]),
            Err(VportError::TableFull(2))
        );
        assert_eq!(table.stats().entries, 2);
    }

    #[test]
    fn parents_cannot_be_deleted_before_children() {
        let table = VportTable::new(8);
        table.add(PortNo(0x1_0001), PortNo(2), vec![]).unwrap();
        table.add(PortNo(0x1_0002), PortNo(0x1_0001), vec![]).unwrap();
        assert_eq!(
            table.delete(PortNo(0x1_0001)),
            Err(VportError::InUse(PortNo(0x1_0001)))
        );
        table.delete(PortNo(0x1_0002)).unwrap();
        table.delete(PortNo(0x1_0001)).unwrap();
        assert_eq!(
            table.delete(PortNo(0x1_0001)),
            Err(VportError::Unknown(PortNo(0x1_0001)))
        );
        assert_eq!(VportError::InUse(PortNo(1)).code() as u16, 6);
    }

    #[test]
    fn chain_runs_every_list_once_and_ends_at_the_physical_port() {
        const DEPTH: u32 = 4;
        let table = VportTable::new(16);
        let mut parent = PortNo(7);
        for i in 0..DEPTH {
            let vport = PortNo(0x1_0001 + i);
            table.add(vport, parent, vec![push(100 + i)]).unwrap();
            parent = vport;
        }
        let (mut packet, mut key) = udp_packet();
        let original_len = packet.len();
        assert_eq!(table.run_chain(parent, &mut packet, &mut key), Some(PortNo(7)));
        assert_eq!(packet.len(), original_len + 4 * DEPTH as usize);
        // the last list run is the one closest to the physical port
        assert_eq!(key.mpls_label1.0, 100);
        assert_eq!(key.mpls_label2.0, 101);
        for i in 0..DEPTH {
            assert_eq!(table.counters(PortNo(0x1_0001 + i)).map(|c| c.0), Some(1));
        }
        let stats = table.stats();
        assert_eq!(stats.lookups, 1);
        assert_eq!(stats.direct_matches, 1);
        assert_eq!(stats.chain_matches, u64::from(DEPTH - 1));
    }

    #[test]
    fn missing_port_or_failed_action_drops() {
        let table = VportTable::new(16);
        let (mut packet, mut key) = udp_packet();
        assert_eq!(table.run_chain(PortNo(0x1_0001), &mut packet, &mut key), None);
        table
            .add(
                PortNo(0x1_0001),
                PortNo(2),
                vec![Action::Vendor(VendorAction::PopMpls {
                    flags: PopFlags::empty(),
                    eth_type: EthType::IPV4,
                })],
            )
            .unwrap();
        // nothing to pop
        assert_eq!(table.run_chain(PortNo(0x1_0001), &mut packet, &mut key), None);
        assert_eq!(table.stats().direct_matches, 1);
    }
}

#[cfg(all(test, feature = "shuttle"))]
mod shuttle_test {
    use super::*;
    use concurrency::sync::Arc;
    use concurrency::thread;
    use net::buffer::HeapBuffer;
    use net::flow_key::extract;
    use net::mpls::{LabelWord, PushFlags};
    use openflow::action::VendorAction;

    const OUTER: PortNo = PortNo(0x1_0001);
    const INNER: PortNo = PortNo(0x1_0002);

    fn push(label: u32) -> Action {
        Action::Vendor(VendorAction::PushMpls {
            flags: PushFlags::empty(),
            label: LabelWord::new(label, 0, false, 64),
        })
    }

    fn udp_packet() -> (Packet<HeapBuffer>, FlowKey) {
        let mut frame = Vec::new();
        etherparse::PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .udp(53, 5353)
            .write(&mut frame, b"hello")
            .unwrap();
        let mut packet = Packet::new(HeapBuffer::from_raw_data(&frame), PortNo(1));
        let (key, _) = extract(&mut packet);
        (packet, key)
    }

    #[test]
    #[allow(clippy::panic)]
    fn add_and_delete_race_chain_walks() {
        shuttle::check_random(
            || {
                let table = Arc::new(VportTable::new(8));
                table.add(OUTER, PortNo(2), vec![push(100)]).unwrap();
                let adder = {
                    let table = table.clone();
                    thread::spawn(move || table.add(INNER, OUTER, vec![push(200)]))
                };
                let deleter = {
                    let table = table.clone();
                    thread::spawn(move || table.delete(OUTER))
                };
                let walker = {
                    let table = table.clone();
                    thread::spawn(move || {
                        let (mut packet, mut key) = udp_packet();
                        let before = packet.len();
                        match table.run_chain(INNER, &mut packet, &mut key) {
                            // both lists ran, in order
                            Some(port) => {
                                assert_eq!(port, PortNo(2));
                                assert_eq!(packet.len(), before + 8);
                                assert_eq!(key.mpls_label1.0, 100);
                                assert_eq!(key.mpls_label2.0, 200);
                            }
                            None => assert_eq!(packet.len(), before),
                        }
                    })
                };
                let added = adder.join().unwrap();
                let deleted = deleter.join().unwrap();
                walker.join().unwrap();
                match (added, deleted) {
                    (Ok(()), Err(e)) => {
                        assert_eq!(e, VportError::InUse(OUTER));
                        assert_eq!(table.stats().entries, 2);
                    }
                    (Err(e), Ok(())) => {
                        assert_eq!(e, VportError::BadParent(OUTER));
                        assert_eq!(table.stats().entries, 0);
                    }
                    other => panic!("add and delete both applied or both refused: {other:?}"),
                }
            },
            100,
        );
    }

    #[test]
    fn concurrent_adds_respect_capacity() {
        shuttle::check_random(
            || {
                let table = Arc::new(VportTable::new(2));
                let handles: Vec<_> = (0..3)
                    .map(|i| {
                        let table = table.clone();
                        thread::spawn(move || table.add(PortNo(0x1_0001 + i), PortNo(1), vec![]))
                    })
                    .collect();
                let refused = handles
                    .into_iter()
                    .filter_map(|h| h.join().unwrap().err())
                    .collect::<Vec<_>>();
                assert_eq!(refused, vec![VportError::TableFull(2)]);
                assert_eq!(table.stats().entries, 2);
            },
            100,
        );
    }
}
