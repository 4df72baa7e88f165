// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Synchronization primitives for the datapath tables.
//!
//! Every shared table in the datapath takes its locks, atomics and `Arc`s from this crate rather
//! than from `std::sync` directly.  With the `shuttle` feature enabled the same code runs against
//! [`shuttle`](https://docs.rs/shuttle)'s model-checked primitives instead.

#![deny(
    unsafe_code,
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

#[macro_use]
mod macros;

#[cfg(not(feature = "shuttle"))]
pub use std::sync;

#[cfg(not(feature = "shuttle"))]
pub use std::thread;

#[cfg(feature = "shuttle")]
pub use shuttle::sync;

#[cfg(feature = "shuttle")]
pub use shuttle::thread;

use std::sync::PoisonError;

/// Poison-tolerant locking for [`sync::Mutex`].
///
/// A poisoned lock only means a holder panicked; datapath tables are never left half-updated
/// across a point that can panic, so the guard is recovered instead of propagating the panic to
/// the forwarding path.
pub trait MutexExt<T> {
    /// Acquire the lock, recovering the guard if the lock is poisoned.
    fn lock_or_recover(&self) -> sync::MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for sync::Mutex<T> {
    fn lock_or_recover(&self) -> sync::MutexGuard<'_, T> {
        self.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Poison-tolerant locking for [`sync::RwLock`].
pub trait RwLockExt<T> {
    /// Acquire the read lock, recovering the guard if the lock is poisoned.
    fn read_or_recover(&self) -> sync::RwLockReadGuard<'_, T>;
    /// Acquire the write lock, recovering the guard if the lock is poisoned.
    fn write_or_recover(&self) -> sync::RwLockWriteGuard<'_, T>;
}

impl<T> RwLockExt<T> for sync::RwLock<T> {
    fn read_or_recover(&self) -> sync::RwLockReadGuard<'_, T> {
        self.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_or_recover(&self) -> sync::RwLockWriteGuard<'_, T> {
        self.write().unwrap_or_else(PoisonError::into_inner)
    }
}
