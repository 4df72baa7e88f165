// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Incremental internet checksum updates.
//!
//! A stored checksum `HC` over a word that changes from `m` to `m'` becomes
//! `HC' = ~(~HC + ~m + m')` in one's complement arithmetic.

/// `sum` after one 16-bit word it covers changed from `old` to `new`.
fn update_u16(sum: u16, old: u16, new: u16) -> u16 {
    let mut acc = u32::from(!sum) + u32::from(!old) + u32::from(new);
    acc = (acc & 0xFFFF) + (acc >> 16);
    acc = (acc & 0xFFFF) + (acc >> 16);
    #[allow(clippy::cast_possible_truncation)] // folded to 16 bits
    let folded = acc as u16;
    !folded
}

fn word(bytes: &[u8]) -> u16 {
    match *bytes {
        [hi, lo] => u16::from_be_bytes([hi, lo]),
        [hi] => u16::from_be_bytes([hi, 0]),
        _ => 0,
    }
}

/// `sum` after the bytes it covers changed from `old` to `new`.
///
/// Both slices start on an even offset of the checksummed data and have the same length.
#[must_use]
pub(crate) fn update_bytes(sum: u16, old: &[u8], new: &[u8]) -> u16 {
    old.chunks(2)
        .zip(new.chunks(2))
        .filter(|(o, n)| o != n)
        .fold(sum, |sum, (o, n)| update_u16(sum, word(o), word(n)))
}
