// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The flow table.
//!
//! Exact-match entries live in a hash map keyed by the full [`FlowKey`]. Wildcard entries are
//! kept in one list sorted by preference: fewest wildcarded bits first, then higher priority,
//! then earlier insertion. Lookup takes the first wildcard entry the packet matches.

mod entry;

pub use entry::FlowEntry;

use std::cmp::Reverse;
use std::collections::HashMap;
use std::time::Instant;

use ahash::RandomState;
use concurrency::sync::atomic::{AtomicU64, Ordering};
use concurrency::sync::{Arc, RwLock};
use concurrency::RwLockExt;
use net::flow_key::FlowKey;
use net::port::PortNo;
use openflow::action::Action;
use openflow::message::RemovedReason;
use tracing::{debug, trace};

/// The flow table is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Flow table full ({0} entries)")]
pub struct TableFull(pub usize);

/// Flow table counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    /// Installed entries.
    pub active: usize,
    /// Lookups performed.
    pub lookups: u64,
    /// Lookups that found an entry.
    pub matches: u64,
}

fn hasher_state() -> &'static RandomState {
    use std::sync::OnceLock;
    static HASHER_STATE: OnceLock<RandomState> = OnceLock::new();
    HASHER_STATE.get_or_init(|| RandomState::with_seeds(0, 0, 0, 0))
}

type ExactMap = HashMap<FlowKey, Arc<FlowEntry>, RandomState>;

fn preference(entry: &FlowEntry) -> (u32, Reverse<u16>, u64) {
    (
        entry.key().wildcards.weight(),
        Reverse(entry.priority()),
        entry.serial,
    )
}

/// Which entries a modify or delete applies to.
#[derive(Debug, Clone, Copy)]
pub struct Selector<'a> {
    /// The request's match.
    pub key: &'a FlowKey,
    /// The request's priority (only compared when `strict`).
    pub priority: u16,
    /// Same match and priority only, rather than every entry the match covers.
    pub strict: bool,
}

impl Selector<'_> {
    fn selects(&self, key: &FlowKey, entry: &FlowEntry) -> bool {
        if self.strict {
            let priority = if key.is_exact() {
                u16::MAX
            } else {
                self.priority
            };
            entry.key() == key && entry.priority() == priority
        } else {
            entry.key().matches_1wild(key)
        }
    }
}

/// The entries, behind the table lock.
#[derive(Debug)]
struct Chain {
    exact: ExactMap,
    wild: Vec<Arc<FlowEntry>>,
    capacity: usize,
    next_serial: u64,
}

impl Chain {
    fn new(capacity: usize) -> Chain {
        Chain {
            exact: ExactMap::with_hasher(hasher_state().clone()),
            wild: Vec::new(),
            capacity,
            next_serial: 0,
        }
    }

    fn len(&self) -> usize {
        self.exact.len() + self.wild.len()
    }

    fn lookup(&self, key: &FlowKey) -> Option<&Arc<FlowEntry>> {
        self.exact
            .get(key)
            .or_else(|| self.wild.iter().find(|entry| key.matches_1wild(entry.key())))
    }

    /// Position of a wildcard entry the new one replaces: same wildcards, same priority, and
    /// agreeing on every field they both match.
    fn replaced(&self, entry: &FlowEntry) -> Option<usize> {
        self.wild.iter().position(|old| {
            old.priority() == entry.priority()
                && old.key().wildcards == entry.key().wildcards
                && old.key().matches_2wild(entry.key())
        })
    }

    fn insert(&mut self, mut entry: FlowEntry) -> Result<Option<Arc<FlowEntry>>, TableFull> {
        entry.serial = self.next_serial;
        let key = *entry.key();
        if key.is_exact() {
            if !self.exact.contains_key(&key) && self.len() >= self.capacity {
                return Err(TableFull(self.capacity));
            }
            self.next_serial += 1;
            return Ok(self.exact.insert(key, Arc::new(entry)));
        }
        let old = match self.replaced(&entry) {
            Some(index) => Some(self.wild.remove(index)),
            None if self.len() >= self.capacity => return Err(TableFull(self.capacity)),
            None => None,
        };
        self.next_serial += 1;
        let rank = preference(&entry);
        let at = self.wild.partition_point(|e| preference(e) < rank);
        self.wild.insert(at, Arc::new(entry));
        Ok(old)
    }

    fn entries(&self) -> impl Iterator<Item = &Arc<FlowEntry>> {
        self.exact.values().chain(self.wild.iter())
    }

    fn drain_where<T>(
        &mut self,
        mut pick: impl FnMut(&FlowEntry) -> Option<T>,
    ) -> Vec<(Arc<FlowEntry>, T)> {
        let mut drained = Vec::new();
        let mut keep = |entry: &Arc<FlowEntry>| match pick(entry) {
            Some(tag) => {
                drained.push((entry.clone(), tag));
                false
            }
            None => true,
        };
        self.exact.retain(|_, entry| keep(entry));
        self.wild.retain(|entry| keep(entry));
        drained
    }
}

/// The flow table shared by the forwarding and control paths.
#[derive(Debug)]
pub struct FlowTable {
    chain: RwLock<Chain>,
    lookups: AtomicU64,
    matches: AtomicU64,
}

impl FlowTable {
    /// An empty table holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> FlowTable {
        FlowTable {
            chain: RwLock::new(Chain::new(capacity)),
            lookups: AtomicU64::new(0),
            matches: AtomicU64::new(0),
        }
    }

    /// Best entry for a packet key.
    pub fn lookup(&self, key: &FlowKey) -> Option<Arc<FlowEntry>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let found = self.chain.read_or_recover().lookup(key).cloned();
        if found.is_some() {
            self.matches.fetch_add(1, Ordering::Relaxed);
        }
        trace!("lookup {key}: hit {}", found.is_some());
        found
    }

    /// Install an entry, replacing one with the same match and priority.
    ///
    /// # Errors
    ///
    /// Fails with [`TableFull`] if the entry replaces nothing and the table is at capacity.
    pub fn insert(&self, entry: FlowEntry) -> Result<Option<Arc<FlowEntry>>, TableFull> {
        debug!("insert {} priority {}", entry.key(), entry.priority());
        self.chain.write_or_recover().insert(entry)
    }

    /// Replace the actions of every selected entry and return how many there were.
    pub fn modify(&self, selector: &Selector<'_>, actions: &[Action]) -> usize {
        let key = selector.key.normalized();
        // exclusive so that concurrent modifies and lookups see all of it or none of it
        let chain = self.chain.write_or_recover();
        let mut modified = 0;
        for entry in chain.entries().filter(|entry| selector.selects(&key, entry)) {
            entry.set_actions(actions.to_vec());
            modified += 1;
        }
        debug!("modify {key}: {modified} entries");
        modified
    }

    /// Remove every selected entry which, unless `out_port` is [`PortNo::NONE`], outputs to
    /// `out_port`.
    pub fn delete(&self, selector: &Selector<'_>, out_port: PortNo) -> Vec<Arc<FlowEntry>> {
        let key = selector.key.normalized();
        let removed: Vec<_> = self
            .chain
            .write_or_recover()
            .drain_where(|entry| {
                (selector.selects(&key, entry)
                    && (out_port == PortNo::NONE || entry.outputs_to(out_port)))
                .then_some(())
            })
            .into_iter()
            .map(|(entry, ())| entry)
            .collect();
        debug!("delete {key}: {} entries", removed.len());
        removed
    }

    /// Evict the entries whose timeout elapsed at `now`.
    pub fn expire(&self, now: Instant) -> Vec<(Arc<FlowEntry>, RemovedReason)> {
        {
            let chain = self.chain.read_or_recover();
            if chain.entries().all(|entry| entry.expiry(now).is_none()) {
                return Vec::new();
            }
        }
        let expired = self
            .chain
            .write_or_recover()
            .drain_where(|entry| entry.expiry(now));
        for (entry, reason) in &expired {
            debug!("expire {} ({reason:?})", entry.key());
        }
        expired
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> TableStats {
        TableStats {
            active: self.chain.read_or_recover().len(),
            lookups: self.lookups.load(Ordering::Relaxed),
            matches: self.matches.load(Ordering::Relaxed),
        }
    }
}

// shuttle primitives only work inside a shuttle model
#[cfg(all(test, not(feature = "shuttle")))]
mod test {
    use super::*;
    use net::buffer::HeapBuffer;
    use net::eth::EthType;
    use net::flow_key::{Wildcards, extract};
    use net::packet::Packet;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn output(port: u32) -> Vec<Action> {
        vec![Action::Output {
            port: PortNo(port),
            max_len: 0,
        }]
    }

    fn packet_key() -> FlowKey {
        FlowKey {
            in_port: PortNo(1),
            dl_type: EthType::IPV4,
            nw_proto: 6,
            nw_src: Ipv4Addr::new(10, 0, 0, 1),
            nw_dst: Ipv4Addr::new(10, 0, 0, 2),
            tp_src: 1234,
            tp_dst: 80,
            ..FlowKey::default()
        }
    }

    fn rule(wildcards: Wildcards, priority: u16, port: u32) -> FlowEntry {
        FlowEntry::new(
            FlowKey {
                wildcards,
                ..packet_key()
            },
            priority,
            0,
            0,
            output(port),
            Instant::now(),
        )
    }

    fn out_port(entry: &FlowEntry) -> Option<PortNo> {
        match entry.actions().first() {
            Some(Action::Output { port, .. }) => Some(*port),
            _ => None,
        }
    }

    #[test]
    fn exact_match_wins_over_wildcards() {
        let table = FlowTable::new(16);
        table.insert(rule(Wildcards::TP_SRC, 0xFFFF, 2)).unwrap();
        table.insert(rule(Wildcards::empty(), 0, 3)).unwrap();
        let hit = table.lookup(&packet_key()).unwrap();
        assert_eq!(out_port(&hit), Some(PortNo(3)));
        assert_eq!(hit.priority(), u16::MAX);
    }

    #[test]
    fn narrower_wildcards_win_regardless_of_insertion_order() {
        let narrow = Wildcards::TP_SRC;
        let wide = Wildcards::TP_SRC | Wildcards::TP_DST | Wildcards::NW_PROTO;
        for order in [[narrow, wide], [wide, narrow]] {
            let table = FlowTable::new(16);
            for w in order {
                let port = if w == narrow { 5 } else { 6 };
                table.insert(rule(w, 100, port)).unwrap();
            }
            let hit = table.lookup(&packet_key()).unwrap();
            assert_eq!(out_port(&hit), Some(PortNo(5)));
        }
    }

    #[test]
    fn priority_then_insertion_order_break_ties() {
        let table = FlowTable::new(16);
        table.insert(rule(Wildcards::TP_SRC, 10, 1)).unwrap();
        table.insert(rule(Wildcards::TP_DST, 20, 2)).unwrap();
        table.insert(rule(Wildcards::NW_PROTO, 20, 3)).unwrap();
        assert_eq!(out_port(&table.lookup(&packet_key()).unwrap()), Some(PortNo(2)));
    }

    #[test]
    fn prefixes_count_their_wildcarded_bits() {
        let table = FlowTable::new(16);
        table
            .insert(rule(Wildcards::empty().with_nw_dst_bits(8), 1, 7))
            .unwrap();
        table
            .insert(rule(Wildcards::IN_PORT | Wildcards::TP_SRC, 1, 8))
            .unwrap();
        // 2 single bits beat 8 address bits
        assert_eq!(out_port(&table.lookup(&packet_key()).unwrap()), Some(PortNo(8)));
        let other = FlowKey {
            nw_dst: Ipv4Addr::new(10, 0, 0, 99),
            ..packet_key()
        };
        assert_eq!(out_port(&table.lookup(&other).unwrap()), Some(PortNo(7)));
    }

    #[test]
    fn lookup_is_idempotent() {
        let table = FlowTable::new(16);
        table.insert(rule(Wildcards::TP_SRC, 10, 1)).unwrap();
        let first = table.lookup(&packet_key()).unwrap();
        let second = table.lookup(&packet_key()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            table.stats(),
            TableStats {
                active: 1,
                lookups: 2,
                matches: 2
            }
        );
    }

    #[test]
    fn identical_rule_is_replaced_without_using_capacity() {
        let table = FlowTable::new(1);
        table.insert(rule(Wildcards::TP_SRC, 10, 1)).unwrap();
        let old = table.insert(rule(Wildcards::TP_SRC, 10, 2)).unwrap();
        assert_eq!(out_port(&old.unwrap()), Some(PortNo(1)));
        assert_eq!(
            table.insert(rule(Wildcards::TP_SRC, 11, 2)).unwrap_err(),
            TableFull(1)
        );
        assert_eq!(
            table.insert(rule(Wildcards::empty(), 0, 2)).unwrap_err(),
            TableFull(1)
        );
        assert_eq!(table.stats().active, 1);
    }

    #[test]
    fn modify_keeps_counters() {
        let table = FlowTable::new(16);
        table.insert(rule(Wildcards::TP_SRC, 10, 1)).unwrap();
        table.insert(rule(Wildcards::TP_DST, 10, 1)).unwrap();
        table.lookup(&packet_key()).unwrap().hit(64, Instant::now());
        let everything = FlowKey {
            wildcards: Wildcards::ALL,
            ..FlowKey::default()
        };
        let selector = Selector {
            key: &everything,
            priority: 0,
            strict: false,
        };
        assert_eq!(table.modify(&selector, &output(9)), 2);
        let hit = table.lookup(&packet_key()).unwrap();
        assert_eq!(out_port(&hit), Some(PortNo(9)));
        assert_eq!(hit.packet_count(), 1);
    }

    #[test]
    fn strict_delete_needs_the_same_priority() {
        let table = FlowTable::new(16);
        table.insert(rule(Wildcards::TP_SRC, 10, 1)).unwrap();
        let key = FlowKey {
            wildcards: Wildcards::TP_SRC,
            ..packet_key()
        };
        let mut selector = Selector {
            key: &key,
            priority: 11,
            strict: true,
        };
        assert!(table.delete(&selector, PortNo::NONE).is_empty());
        selector.priority = 10;
        assert!(table.delete(&selector, PortNo(2)).is_empty());
        assert_eq!(table.delete(&selector, PortNo(1)).len(), 1);
        assert_eq!(table.stats().active, 0);
    }

    #[test]
    fn non_strict_delete_removes_covered_entries() {
        let table = FlowTable::new(16);
        table.insert(rule(Wildcards::empty(), 0, 1)).unwrap();
        table.insert(rule(Wildcards::TP_SRC, 10, 1)).unwrap();
        let mut unrelated = packet_key();
        unrelated.in_port = PortNo(2);
        table
            .insert(FlowEntry::new(unrelated, 0, 0, 0, output(1), Instant::now()))
            .unwrap();
        let by_port = FlowKey {
            wildcards: Wildcards::ALL.difference(Wildcards::IN_PORT),
            in_port: PortNo(1),
            ..FlowKey::default()
        };
        let selector = Selector {
            key: &by_port,
            priority: 0,
            strict: false,
        };
        assert_eq!(table.delete(&selector, PortNo::NONE).len(), 2);
        assert_eq!(table.stats().active, 1);
    }

    #[test]
    fn expiry_reports_reasons() {
        let now = Instant::now();
        let table = FlowTable::new(16);
        let key = |port| FlowKey {
            in_port: PortNo(port),
            ..packet_key()
        };
        table
            .insert(FlowEntry::new(key(1), 0, 1, 0, vec![], now))
            .unwrap();
        table
            .insert(FlowEntry::new(key(2), 0, 0, 2, vec![], now))
            .unwrap();
        table
            .insert(FlowEntry::new(key(3), 0, 0, 0, vec![], now))
            .unwrap();
        assert!(table.expire(now).is_empty());
        let first = table.expire(now + Duration::from_millis(1500));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].1, RemovedReason::IdleTimeout);
        assert_eq!(first[0].0.key().in_port, PortNo(1));
        let second = table.expire(now + Duration::from_secs(2));
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].1, RemovedReason::HardTimeout);
        assert_eq!(table.stats().active, 1);
    }

    #[test]
    fn lookup_of_any_frame_is_idempotent() {
        let table = FlowTable::new(16);
        table.insert(rule(Wildcards::TP_SRC, 10, 1)).unwrap();
        table
            .insert(rule(Wildcards::empty().with_nw_src_bits(40), 3, 1))
            .unwrap();
        bolero::check!()
            .with_type::<HeapBuffer>()
            .for_each(|buf: &HeapBuffer| {
                let mut packet = Packet::new(buf.clone(), PortNo(1));
                let (key, _) = extract(&mut packet);
                let once = table.lookup(&key).map(|e| e.serial);
                assert_eq!(once, table.lookup(&key).map(|e| e.serial));
            });
    }
}
