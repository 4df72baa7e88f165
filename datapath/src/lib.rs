// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! An OpenFlow datapath with MPLS label actions and virtual ports.
//!
//! Packets enter through [`Datapath::receive`], are matched against the flow table and leave
//! through a [`Transmit`] implementation. The controller drives the datapath with
//! [`Datapath::handle_control`] and reads asynchronous notifications from
//! [`Datapath::upcalls`].

#![deny(
    unsafe_code,
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod buffer_pool;
pub mod chain;
pub mod config;
mod datapath;
mod dispatch;
pub mod execute;
pub mod vport;

#[cfg(all(test, not(feature = "shuttle")))]
mod test_utils;

pub use config::{ConfigError, DatapathConfig};
pub use datapath::Datapath;
pub use execute::Transmit;

tracectl::trace_target!("datapath", tracectl::LevelFilter::INFO, &["datapath"]);
