// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! [`PacketBuffer`] and related traits

mod heap;

use core::fmt::Debug;
use std::error::Error;

pub use heap::*;

/// Super trait representing the read-only view of a packet buffer.
pub trait PacketBuffer: AsRef<[u8]> + Headroom + Debug + 'static {}
impl<T> PacketBuffer for T where T: AsRef<[u8]> + Headroom + Debug + 'static {}

/// Super trait representing the operations the datapath performs on a packet buffer.
///
/// `Clone` is required since a packet may be output to several ports or saved for the
/// controller while it keeps being processed.
pub trait PacketBufferMut:
    PacketBuffer
    + AsMut<[u8]>
    + Clone
    + Prepend
    + Append
    + Send
    + Sync
    + TrimFromStart
    + TrimFromEnd
    + Headroom
    + Tailroom
{
}
impl<T> PacketBufferMut for T where
    T: PacketBuffer
        + AsMut<[u8]>
        + Clone
        + Prepend
        + Append
        + Send
        + Sync
        + TrimFromStart
        + TrimFromEnd
        + Headroom
        + Tailroom
{
}

/// Trait representing the ability to get the unused headroom in a packet buffer.
pub trait Headroom {
    /// Get the (unused) headroom in a packet buffer.
    fn headroom(&self) -> u16;
}

/// Trait representing the ability to get the unused tailroom in a packet buffer.
pub trait Tailroom {
    /// Get the (unused) tailroom in a packet buffer.
    fn tailroom(&self) -> u16;
}

/// Trait representing the ability to prepend data to a packet buffer.
pub trait Prepend {
    /// Error which may occur when attempting to prepend data to the buffer.
    type Error: Debug + Error;
    /// Grow the buffer by `len` bytes at the front if possible.
    ///
    /// If successful, this method returns a slice to the new start of the buffer.
    /// The contents of the buffer will not be otherwise altered.
    ///
    /// # Errors
    ///
    /// Returns [`Self::Error`] if there is not enough headroom available.
    fn prepend(&mut self, len: u16) -> Result<&mut [u8], Self::Error>;
}

/// Trait representing the ability to append data to a packet buffer.
pub trait Append {
    /// Error which may occur when attempting to append data to the buffer.
    type Error: Debug + Error;
    /// Grow the buffer by `len` bytes at the end if possible.
    ///
    /// # Errors
    ///
    /// Returns [`Self::Error`] if there is not enough tailroom available.
    fn append(&mut self, len: u16) -> Result<&mut [u8], Self::Error>;
}

/// Trait representing the ability to trim data from the start of a packet buffer.
pub trait TrimFromStart {
    /// Error which may occur when attempting to trim data from the start of the buffer.
    type Error: Debug + Error;
    /// Trim data from the start of the buffer if possible.
    ///
    /// # Errors
    ///
    /// Returns [`Self::Error`] if the buffer does not have `len` bytes in it to begin with.
    fn trim_from_start(&mut self, len: u16) -> Result<&mut [u8], Self::Error>;
}

/// Trait representing the ability to trim data from the end of a packet buffer.
pub trait TrimFromEnd {
    /// Error which may occur when attempting to trim data from the end of the buffer.
    type Error: Debug + Error;
    /// Trim data from the end of the buffer if possible.
    ///
    /// # Errors
    ///
    /// Returns [`Self::Error`] if the buffer does not have `len` bytes in it to begin with.
    fn trim_from_end(&mut self, len: u16) -> Result<&mut [u8], Self::Error>;
}

/// Error indicating that there is not enough headroom in a memory buffer for the requested
/// operation.
#[non_exhaustive]
#[repr(transparent)]
#[derive(Debug, thiserror::Error)]
#[error("Not enough head room in memory buffer")]
pub struct NotEnoughHeadRoom;

/// Error indicating that there is not enough tailroom in a memory buffer for the requested
/// operation.
#[non_exhaustive]
#[repr(transparent)]
#[derive(Debug, thiserror::Error)]
#[error("Not enough tail room in memory buffer")]
pub struct NotEnoughTailRoom;

/// Error indicating that the buffer is not long enough to perform the requested operation.
#[non_exhaustive]
#[repr(transparent)]
#[derive(Debug, thiserror::Error)]
#[error("Memory buffer not long enough to remove required number of bytes")]
pub struct MemoryBufferNotLongEnough;
