// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Daemon configuration, read from a JSON file at startup.

use std::net::Ipv4Addr;
use std::path::Path;

use mrt::{EngineConfig, RpGrpSpec, StaticRoute, Vif, VifConfig, VifTable};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A statically configured local member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticMember {
    /// Name of the interface the member is on.
    pub vif: String,
    pub source: Option<Ipv4Addr>,
    pub group: Ipv4Addr,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Interfaces in vif index order.
    pub vifs: Vec<VifConfig>,
    /// Unicast routes used for RPF lookups.
    pub routes: Vec<StaticRoute>,
    pub rp_set: Vec<RpGrpSpec>,
    pub members: Vec<StaticMember>,
    pub engine: EngineConfig,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let cfg: Self = serde_json::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build the vif table and check that routes and members refer to
    /// interfaces that exist.
    pub fn validate(&self) -> Result<VifTable, Error> {
        let table = VifTable::from_config(&self.vifs)?;
        for r in &self.routes {
            if table.get(r.rpf.incoming).is_none() {
                return Err(Error::Config(format!(
                    "route {} uses unknown vif {}",
                    r.prefix, r.rpf.incoming
                )));
            }
        }
        for m in &self.members {
            self.member_vif(&table, m)?;
        }
        Ok(table)
    }

    pub fn member_vif(
        &self,
        table: &VifTable,
        member: &StaticMember,
    ) -> Result<Vif, Error> {
        table
            .iter()
            .find(|v| v.name == member.vif)
            .map(|v| v.index)
            .ok_or_else(|| {
                Error::Config(format!(
                    "member of {} on unknown interface {}",
                    member.group, member.vif
                ))
            })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use mrt::{RpOrigin, SptThreshold};
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"{
        "vifs": [
            { "name": "pimreg", "address": "10.0.1.1",
              "subnet": { "value": "10.0.1.1", "length": 32 },
              "register": true },
            { "name": "up0", "address": "10.0.1.1",
              "subnet": { "value": "10.0.1.0", "length": 24 } },
            { "name": "lan0", "address": "10.0.3.1",
              "subnet": { "value": "10.0.3.0", "length": 24 },
              "dr": true }
        ],
        "routes": [
            { "prefix": { "value": "0.0.0.0", "length": 0 },
              "incoming": 1, "upstream": "10.0.1.2",
              "metric": 10, "preference": 110 }
        ],
        "rp_set": [
            { "rp": "10.0.1.100",
              "prefix": { "value": "224.0.0.0", "length": 4 },
              "priority": 1 }
        ],
        "members": [
            { "vif": "lan0", "source": null, "group": "224.1.1.1" }
        ],
        "engine": { "spt_threshold": "immediate" }
    }"#;

    #[test]
    fn sample_config() {
        let cfg = DaemonConfig::parse(SAMPLE).expect("parse");
        let table = cfg.validate().expect("validate");
        assert_eq!(table.len(), 3);
        assert_eq!(table.register_vif(), Some(0));
        assert!(table.is_dr(2));

        assert_eq!(cfg.rp_set[0].origin, RpOrigin::Static);
        assert_eq!(cfg.rp_set[0].hash_mask_len, 30);
        assert_eq!(cfg.engine.spt_threshold, SptThreshold::Immediate);
        assert_eq!(cfg.engine.join_prune_holdtime, 210);
        assert_eq!(cfg.member_vif(&table, &cfg.members[0]).ok(), Some(2));
    }

    #[test]
    fn empty_config_is_valid() {
        let cfg = DaemonConfig::parse("{}").expect("parse");
        assert_eq!(cfg, DaemonConfig::default());
    }

    #[test]
    fn unknown_member_vif() {
        let text = SAMPLE.replace(r#""vif": "lan0""#, r#""vif": "lan9""#);
        let r = DaemonConfig::parse(&text);
        assert!(matches!(r, Err(Error::Config(_))));
    }

    #[test]
    fn route_on_missing_vif() {
        let text = SAMPLE.replace(r#""incoming": 1"#, r#""incoming": 7"#);
        let r = DaemonConfig::parse(&text);
        assert!(matches!(r, Err(Error::Config(_))));
    }
}
