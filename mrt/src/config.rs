// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default interval between periodic join/prune messages.
pub const DEFAULT_JOIN_PRUNE_PERIOD: u16 = 60;

/// Default holdtime carried in join/prune messages, 3.5 times the period.
pub const DEFAULT_JOIN_PRUNE_HOLDTIME: u16 = 210;

/// Default time a kernel cache entry may stay idle before removal.
pub const DEFAULT_DATA_TIMEOUT: u16 = 210;

pub const DEFAULT_ASSERT_TIMEOUT: u16 = 180;

pub const DEFAULT_REGISTER_SUPPRESSION_TIMEOUT: u16 = 60;

/// Default aging pass interval in seconds.
pub const DEFAULT_TIMER_INTERVAL: u16 = 5;

pub const DEFAULT_MAX_ROUTES: usize = 65536;

/// When to leave the shared tree for the shortest path tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SptThreshold {
    /// Switch on the first packet for a group with local members.
    Immediate,
    /// Never switch.
    Infinity,
    /// Switch once a source sends more than `bytes` within `interval`
    /// seconds.
    Rate { bytes: u64, interval: u16 },
}

impl Default for SptThreshold {
    fn default() -> Self {
        Self::Rate {
            bytes: 50_000,
            interval: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Set when this router is a candidate RP. Groups mapped to this
    /// address do not get register encapsulation.
    pub local_rp_address: Option<Ipv4Addr>,
    pub spt_threshold: SptThreshold,
    pub join_prune_period: u16,
    pub join_prune_holdtime: u16,
    pub data_timeout: u16,
    pub assert_timeout: u16,
    pub register_suppression_timeout: u16,
    pub max_routes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_rp_address: None,
            spt_threshold: SptThreshold::default(),
            join_prune_period: DEFAULT_JOIN_PRUNE_PERIOD,
            join_prune_holdtime: DEFAULT_JOIN_PRUNE_HOLDTIME,
            data_timeout: DEFAULT_DATA_TIMEOUT,
            assert_timeout: DEFAULT_ASSERT_TIMEOUT,
            register_suppression_timeout:
                DEFAULT_REGISTER_SUPPRESSION_TIMEOUT,
            max_routes: DEFAULT_MAX_ROUTES,
        }
    }
}

impl EngineConfig {
    pub fn join_prune_period(&self) -> Duration {
        secs(self.join_prune_period)
    }

    pub fn join_prune_holdtime(&self) -> Duration {
        secs(self.join_prune_holdtime)
    }

    pub fn data_timeout(&self) -> Duration {
        secs(self.data_timeout)
    }

    pub fn assert_timeout(&self) -> Duration {
        secs(self.assert_timeout)
    }

    pub fn register_suppression_timeout(&self) -> Duration {
        secs(self.register_suppression_timeout)
    }
}

fn secs(s: u16) -> Duration {
    Duration::from_secs(s.into())
}
