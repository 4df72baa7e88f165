// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![forbid(unsafe_code)] // Validation logic should always be strictly safe
#![deny(missing_docs, clippy::all, clippy::pedantic)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(clippy::module_name_repetitions)]

//! Packet buffers, header editing and flow-key extraction for the OpenFlow datapath.

pub mod buffer;
mod checksum;
pub mod eth;
pub mod flow_key;
pub mod mpls;
pub mod packet;
pub mod port;

use tracectl::trace_target;
trace_target!("net", tracectl::LevelFilter::INFO, &["datapath"]);
