// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Runtime control of the datapath's tracing targets.
//!
//! Crates declare their targets with [`trace_target!`] (or [`custom_target!`]); the declarations
//! are collected at link time and registered with a reloadable filter the first time
//! [`log_control`] is called.

pub mod control;
pub mod display;
pub mod targets;

// re-exports
pub use control::{LogControl, TraceConfigError, log_control};
pub use tracing_subscriber::filter::LevelFilter;
