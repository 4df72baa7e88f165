// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Datapath configuration.

use std::time::Duration;

use net::port::PortNo;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The reasons why a configuration may be rejected
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The YAML document does not describe a configuration.
    #[error("Malformed configuration: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
    /// `max_flows` is zero.
    #[error("The flow table must hold at least one flow")]
    NoFlows,
    /// `max_vports` exceeds the virtual port range.
    #[error("At most {max} virtual ports can be configured, got {0}", max = PortNo::VPORT_COUNT)]
    TooManyVports(usize),
    /// `buffer_slots` is not a power of two in range.
    #[error("Buffer slots must be a power of two no larger than 65536, got {0}")]
    BadBufferSlots(usize),
    /// `upcall_queue_depth` is zero.
    #[error("The upcall queue must hold at least one message")]
    NoUpcallQueue,
    /// The tracing string does not parse.
    #[error("Bad tracing configuration: {0}")]
    Tracing(#[from] tracectl::TraceConfigError),
}

/// Sizing and identity of a datapath.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatapathConfig {
    /// Identifier reported to the controller.
    pub datapath_id: u64,
    /// Flow table capacity.
    pub max_flows: usize,
    /// Virtual port table capacity.
    pub max_vports: usize,
    /// Number of packet buffer slots (a power of two).
    pub buffer_slots: usize,
    /// How long a buffered packet is protected from eviction, in milliseconds.
    pub buffer_retention_ms: u64,
    /// Bytes of a buffered packet sent in a table-miss packet-in.
    pub miss_send_len: u16,
    /// Bound of the upcall channel.
    pub upcall_queue_depth: usize,
    /// Tracing configuration string, e.g. `default=info,datapath=debug`.
    pub tracing: Option<String>,
}

impl Default for DatapathConfig {
    fn default() -> Self {
        Self {
            datapath_id: 0,
            max_flows: 65_536,
            max_vports: 4096,
            buffer_slots: 256,
            buffer_retention_ms: 1000,
            miss_send_len: 128,
            upcall_queue_depth: 1024,
            tracing: None,
        }
    }
}

impl DatapathConfig {
    /// Largest supported number of buffer slots.
    pub const MAX_BUFFER_SLOTS: usize = 1 << 16;

    /// Parse a YAML document. Missing fields take their default value.
    ///
    /// # Errors
    ///
    /// Fails on malformed YAML or unknown fields. The result is not validated.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml_ng::from_str(yaml)?)
    }

    /// Check that the configuration can be used to build a datapath.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_flows == 0 {
            return Err(ConfigError::NoFlows);
        }
        if self.max_vports > PortNo::VPORT_COUNT {
            return Err(ConfigError::TooManyVports(self.max_vports));
        }
        if !self.buffer_slots.is_power_of_two() || self.buffer_slots > Self::MAX_BUFFER_SLOTS {
            return Err(ConfigError::BadBufferSlots(self.buffer_slots));
        }
        if self.upcall_queue_depth == 0 {
            return Err(ConfigError::NoUpcallQueue);
        }
        Ok(())
    }

    /// Minimum time a buffered packet is kept.
    #[must_use]
    pub fn buffer_retention(&self) -> Duration {
        Duration::from_millis(self.buffer_retention_ms)
    }
}
