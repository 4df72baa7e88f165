// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Wire codec for the OpenFlow control protocol with MPLS virtual-port extensions.
//!
//! Every inbound message is fully decoded and validated by [`message::Frame::decode`]
//! before the datapath acts on it; outbound messages are produced by
//! [`message::Frame::encode`].

#![forbid(unsafe_code)]
#![deny(missing_docs, clippy::all, clippy::pedantic)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(clippy::module_name_repetitions)]

pub mod action;
pub mod error;
pub mod header;
pub mod matching;
pub mod message;

pub use error::{ActionError, DecodeError, ErrorCode};
pub use header::{Header, MsgType, OFP_VERSION};
pub use message::{BufferId, Frame, Message};

tracectl::trace_target!("openflow", tracectl::LevelFilter::INFO, &["datapath"]);
