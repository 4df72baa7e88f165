// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flow table entries.

use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use concurrency::sync::atomic::{AtomicU64, Ordering};
use net::flow_key::FlowKey;
use net::port::PortNo;
use openflow::action::Action;
use openflow::message::{FlowRemoved, RemovedReason};

/// A flow table entry.
///
/// Everything but the counters, the last-used time and the action list is fixed at creation.
/// Those three are updated through shared references, so the forwarding path only needs the
/// table's read lock.
#[derive(Debug)]
pub struct FlowEntry {
    key: FlowKey,
    priority: u16,
    idle_timeout: u16,
    hard_timeout: u16,
    created: Instant,
    // nanoseconds since `created`
    last_used: AtomicU64,
    packets: AtomicU64,
    bytes: AtomicU64,
    actions: ArcSwap<Vec<Action>>,
    pub(crate) serial: u64,
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

impl FlowEntry {
    /// Build an entry. The key is normalized and exact-match entries get the top priority.
    #[must_use]
    pub fn new(
        key: FlowKey,
        priority: u16,
        idle_timeout: u16,
        hard_timeout: u16,
        actions: Vec<Action>,
        now: Instant,
    ) -> FlowEntry {
        let key = key.normalized();
        let priority = if key.is_exact() { u16::MAX } else { priority };
        FlowEntry {
            key,
            priority,
            idle_timeout,
            hard_timeout,
            created: now,
            last_used: AtomicU64::new(0),
            packets: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            actions: ArcSwap::from_pointee(actions),
            serial: 0,
        }
    }

    /// The normalized match.
    #[must_use]
    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    /// Priority; exact entries always carry the highest.
    #[must_use]
    pub fn priority(&self) -> u16 {
        self.priority
    }

    /// Seconds without a match before the entry expires, 0 for never.
    #[must_use]
    pub fn idle_timeout(&self) -> u16 {
        self.idle_timeout
    }

    /// Seconds after creation at which the entry expires, 0 for never.
    #[must_use]
    pub fn hard_timeout(&self) -> u16 {
        self.hard_timeout
    }

    /// The current action list.
    #[must_use]
    pub fn actions(&self) -> std::sync::Arc<Vec<Action>> {
        self.actions.load_full()
    }

    /// Replace the action list. Counters and timestamps are kept.
    pub fn set_actions(&self, actions: Vec<Action>) {
        self.actions.store(std::sync::Arc::new(actions));
    }

    /// True if some output action sends to `port`.
    #[must_use]
    pub fn outputs_to(&self, port: PortNo) -> bool {
        self.actions
            .load()
            .iter()
            .any(|action| matches!(action, Action::Output { port: p, .. } if *p == port))
    }

    /// Account for a matched packet of `len` bytes.
    pub fn hit(&self, len: usize, now: Instant) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.last_used.fetch_max(
            nanos(now.saturating_duration_since(self.created)),
            Ordering::Relaxed,
        );
    }

    /// Packets matched so far.
    #[must_use]
    pub fn packet_count(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    /// Bytes matched so far.
    #[must_use]
    pub fn byte_count(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// When the entry last matched a packet (its creation time if it never did).
    #[must_use]
    pub fn last_used(&self) -> Instant {
        self.created + Duration::from_nanos(self.last_used.load(Ordering::Relaxed))
    }

    /// How long the entry has been installed.
    #[must_use]
    pub fn duration(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created)
    }

    /// Whether a timeout elapsed at `now`. A hard timeout wins over an idle one.
    #[must_use]
    pub fn expiry(&self, now: Instant) -> Option<RemovedReason> {
        let elapsed = |since: Instant, secs: u16| {
            secs != 0 && now.saturating_duration_since(since) >= Duration::from_secs(secs.into())
        };
        if elapsed(self.created, self.hard_timeout) {
            Some(RemovedReason::HardTimeout)
        } else if elapsed(self.last_used(), self.idle_timeout) {
            Some(RemovedReason::IdleTimeout)
        } else {
            None
        }
    }

    /// The removal notification for this entry.
    #[must_use]
    pub fn removed(&self, reason: RemovedReason, now: Instant) -> FlowRemoved {
        FlowRemoved {
            key: self.key,
            priority: self.priority,
            reason,
            duration: self.duration(now),
            idle_timeout: self.idle_timeout,
            packet_count: self.packet_count(),
            byte_count: self.byte_count(),
        }
    }
}

#[cfg(all(test, not(feature = "shuttle")))]
mod test {
    use super::*;
    use net::flow_key::Wildcards;

    fn entry(idle: u16, hard: u16, now: Instant) -> FlowEntry {
        let key = FlowKey {
            wildcards: Wildcards::ALL,
            ..FlowKey::default()
        };
        FlowEntry::new(key, 10, idle, hard, vec![], now)
    }

    #[test]
    fn exact_entries_get_top_priority() {
        let now = Instant::now();
        let exact = FlowEntry::new(FlowKey::default(), 10, 0, 0, vec![], now);
        assert_eq!(exact.priority(), u16::MAX);
        assert_eq!(entry(0, 0, now).priority(), 10);
    }

    #[test]
    fn hits_update_counters_and_idle_clock() {
        let now = Instant::now();
        let flow = entry(2, 0, now);
        flow.hit(60, now + Duration::from_secs(1));
        flow.hit(40, now + Duration::from_millis(500));
        assert_eq!(flow.packet_count(), 2);
        assert_eq!(flow.byte_count(), 100);
        assert_eq!(flow.last_used(), now + Duration::from_secs(1));
        assert_eq!(flow.expiry(now + Duration::from_secs(2)), None);
        assert_eq!(
            flow.expiry(now + Duration::from_secs(3)),
            Some(RemovedReason::IdleTimeout)
        );
    }

    #[test]
    fn hard_timeout_wins() {
        let now = Instant::now();
        let flow = entry(1, 1, now);
        assert_eq!(
            flow.expiry(now + Duration::from_secs(5)),
            Some(RemovedReason::HardTimeout)
        );
        assert_eq!(entry(0, 0, now).expiry(now + Duration::from_secs(99_999)), None);
    }

    #[test]
    fn actions_are_replaced_in_place() {
        let now = Instant::now();
        let flow = entry(0, 0, now);
        flow.hit(10, now);
        flow.set_actions(vec![Action::Output {
            port: PortNo(3),
            max_len: 0,
        }]);
        assert!(flow.outputs_to(PortNo(3)));
        assert!(!flow.outputs_to(PortNo(4)));
        assert_eq!(flow.packet_count(), 1);
    }
}
