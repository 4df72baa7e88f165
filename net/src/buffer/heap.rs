// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Owned, heap allocated implementation of [`PacketBufferMut`].

#[cfg(any(test, feature = "bolero"))]
pub use contract::*;

use crate::buffer::{
    Append, Headroom, MemoryBufferNotLongEnough, NotEnoughHeadRoom, NotEnoughTailRoom, Prepend,
    Tailroom, TrimFromEnd, TrimFromStart,
};

// only included for doc ref
#[cfg(doc)]
use crate::buffer::PacketBufferMut;

/// A frame stored in a `Vec<u8>` with reserved room on both sides.
///
/// The frame occupies `buffer[headroom..buffer.len() - tailroom]`. Growing or shrinking the
/// frame only moves those two boundaries, so prepending a header never reallocates as long as
/// there is room left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapBuffer {
    buffer: Vec<u8>,
    headroom: u16,
    tailroom: u16,
}

impl HeapBuffer {
    /// The largest frame a `HeapBuffer` built by [`HeapBuffer::from_raw_data`] is meant to hold.
    pub const CAPACITY: u16 = 2048;
    /// The default reserved headroom.
    pub const HEADROOM: u16 = 96;
    /// The default reserved tailroom.
    pub const TAILROOM: u16 = 96;

    /// Create a `HeapBuffer` holding a copy of `data` with the default head and tail room.
    #[must_use]
    pub fn from_raw_data(data: &[u8]) -> HeapBuffer {
        HeapBuffer::with_room(data, HeapBuffer::HEADROOM, HeapBuffer::TAILROOM)
    }

    /// Create a `HeapBuffer` holding a copy of `data` with the given head and tail room.
    #[must_use]
    pub fn with_room(data: &[u8], headroom: u16, tailroom: u16) -> HeapBuffer {
        let mut buffer = Vec::with_capacity(headroom as usize + data.len() + tailroom as usize);
        buffer.resize(headroom as usize, 0);
        buffer.extend_from_slice(data);
        buffer.resize(buffer.len() + tailroom as usize, 0);
        HeapBuffer {
            buffer,
            headroom,
            tailroom,
        }
    }

    /// Length of the frame currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len() - self.headroom as usize - self.tailroom as usize
    }

    /// True if the frame is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn frame_bounds(&self) -> (usize, usize) {
        (
            self.headroom as usize,
            self.buffer.len() - self.tailroom as usize,
        )
    }
}

impl AsRef<[u8]> for HeapBuffer {
    fn as_ref(&self) -> &[u8] {
        let (start, end) = self.frame_bounds();
        &self.buffer[start..end]
    }
}

impl AsMut<[u8]> for HeapBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        let (start, end) = self.frame_bounds();
        &mut self.buffer[start..end]
    }
}

impl Headroom for HeapBuffer {
    fn headroom(&self) -> u16 {
        self.headroom
    }
}

impl Tailroom for HeapBuffer {
    fn tailroom(&self) -> u16 {
        self.tailroom
    }
}

impl Prepend for HeapBuffer {
    type Error = NotEnoughHeadRoom;
    fn prepend(&mut self, len: u16) -> Result<&mut [u8], Self::Error> {
        if self.headroom < len {
            return Err(NotEnoughHeadRoom);
        }
        self.headroom -= len;
        Ok(self.as_mut())
    }
}

impl Append for HeapBuffer {
    type Error = NotEnoughTailRoom;
    fn append(&mut self, len: u16) -> Result<&mut [u8], Self::Error> {
        if self.tailroom < len {
            return Err(NotEnoughTailRoom);
        }
        self.tailroom -= len;
        Ok(self.as_mut())
    }
}

impl TrimFromStart for HeapBuffer {
    type Error = MemoryBufferNotLongEnough;
    fn trim_from_start(&mut self, len: u16) -> Result<&mut [u8], MemoryBufferNotLongEnough> {
        if len as usize > self.len() {
            return Err(MemoryBufferNotLongEnough);
        }
        self.headroom += len;
        Ok(self.as_mut())
    }
}

impl TrimFromEnd for HeapBuffer {
    type Error = MemoryBufferNotLongEnough;
    fn trim_from_end(&mut self, len: u16) -> Result<&mut [u8], MemoryBufferNotLongEnough> {
        if len as usize > self.len() {
            return Err(MemoryBufferNotLongEnough);
        }
        self.tailroom += len;
        Ok(self.as_mut())
    }
}

#[cfg(any(test, feature = "bolero"))]
mod contract {
    use crate::buffer::HeapBuffer;
    use bolero::{Driver, TypeGenerator, ValueGenerator};

    /// [`ValueGenerator`] which produces [`HeapBuffer`]s of up to `max_len` arbitrary bytes.
    #[repr(transparent)]
    pub struct GenerateHeapBuffer(u16);

    impl GenerateHeapBuffer {
        /// Generate frames of at most `max_len` bytes (capped at [`HeapBuffer::CAPACITY`]).
        #[must_use]
        pub fn new(max_len: u16) -> Self {
            Self(max_len.min(HeapBuffer::CAPACITY))
        }
    }

    impl ValueGenerator for GenerateHeapBuffer {
        type Output = HeapBuffer;

        fn generate<D: Driver>(&self, driver: &mut D) -> Option<Self::Output> {
            let len: u16 = driver.produce::<u16>()? % (self.0 + 1);
            let mut data = Vec::with_capacity(len as usize);
            for _ in 0..len {
                data.push(driver.produce()?);
            }
            Some(HeapBuffer::from_raw_data(&data))
        }
    }

    impl TypeGenerator for HeapBuffer {
        fn generate<D: Driver>(driver: &mut D) -> Option<Self> {
            GenerateHeapBuffer::new(256).generate(driver)
        }
    }
}
