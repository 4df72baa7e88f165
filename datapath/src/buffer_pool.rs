// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Packets held while the controller decides about them.
//!
//! The pool is a ring of slots. A [`BufferId`] names a slot and the generation of the packet
//! stored in it, so an id handed out before a slot was reused retrieves nothing.

use std::time::{Duration, Instant};

use concurrency::MutexExt;
use concurrency::sync::Mutex;
use net::buffer::PacketBufferMut;
use net::packet::Packet;
use openflow::BufferId;
use tracing::{debug, trace};

/// The ring slot due for reuse holds a packet younger than the retention period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("No free packet buffer")]
pub struct NoSpace;

#[derive(Debug)]
struct Slot<Buf: PacketBufferMut> {
    packet: Option<Packet<Buf>>,
    generation: u32,
    saved_at: Option<Instant>,
}

#[derive(Debug)]
struct PoolSlots<Buf: PacketBufferMut> {
    slots: Vec<Slot<Buf>>,
    next: usize,
}

/// Fixed-size pool of buffered packets.
#[derive(Debug)]
pub struct BufferPool<Buf: PacketBufferMut> {
    inner: Mutex<PoolSlots<Buf>>,
    index_bits: u32,
    retention: Duration,
}

impl<Buf: PacketBufferMut> BufferPool<Buf> {
    /// A pool of `slots` slots (rounded up to a power of two, at most 65536).
    #[must_use]
    pub fn new(slots: usize, retention: Duration) -> BufferPool<Buf> {
        let slots = slots.clamp(1, 1 << 16).next_power_of_two();
        let slots_vec = (0..slots)
            .map(|_| Slot {
                packet: None,
                generation: 0,
                saved_at: None,
            })
            .collect();
        BufferPool {
            inner: Mutex::new(PoolSlots {
                slots: slots_vec,
                next: 0,
            }),
            index_bits: slots.trailing_zeros(),
            retention,
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        1 << self.index_bits
    }

    fn index_mask(&self) -> u32 {
        (1 << self.index_bits) - 1
    }

    fn generation_mask(&self) -> u32 {
        u32::MAX >> self.index_bits
    }

    fn cookie(&self, generation: u32, index: usize) -> BufferId {
        #[allow(clippy::cast_possible_truncation)] // index < 2^16
        BufferId((generation << self.index_bits) | index as u32)
    }

    fn split(&self, id: BufferId) -> (u32, usize) {
        (id.0 >> self.index_bits, (id.0 & self.index_mask()) as usize)
    }

    /// Keep a copy of `packet`.
    ///
    /// # Errors
    ///
    /// Fails with [`NoSpace`] if the next slot still holds a packet saved less than the
    /// retention period ago.
    pub fn save(&self, packet: &Packet<Buf>, now: Instant) -> Result<BufferId, NoSpace> {
        let mut pool = self.inner.lock_or_recover();
        let index = pool.next;
        let slot = &mut pool.slots[index];
        if slot.packet.is_some() {
            let young = slot
                .saved_at
                .is_some_and(|at| now.saturating_duration_since(at) < self.retention);
            if young {
                debug!("buffer slot {index} busy, not buffering");
                return Err(NoSpace);
            }
            trace!("evicting buffer slot {index}");
        }
        let mut generation = slot.generation.wrapping_add(1) & self.generation_mask();
        if self.cookie(generation, index) == BufferId::NONE {
            generation = 0;
        }
        slot.generation = generation;
        slot.packet = Some(packet.clone());
        slot.saved_at = Some(now);
        pool.next = (index + 1) & self.index_mask() as usize;
        let id = self.cookie(generation, index);
        trace!("buffered packet as {id}");
        Ok(id)
    }

    /// Take the packet saved as `id`, if it is still there.
    pub fn retrieve(&self, id: BufferId) -> Option<Packet<Buf>> {
        if id == BufferId::NONE {
            return None;
        }
        let (generation, index) = self.split(id);
        let mut pool = self.inner.lock_or_recover();
        let slot = pool.slots.get_mut(index)?;
        if slot.generation != generation {
            debug!("stale buffer id {id}");
            return None;
        }
        slot.saved_at = None;
        slot.packet.take()
    }

    /// Drop the packet saved as `id`. Returns `false` if it was not there.
    pub fn discard(&self, id: BufferId) -> bool {
        self.retrieve(id).is_some()
    }

    /// Drop every buffered packet.
    pub fn discard_all(&self) {
        let mut pool = self.inner.lock_or_recover();
        for slot in &mut pool.slots {
            slot.packet = None;
            slot.saved_at = None;
        }
    }
}
