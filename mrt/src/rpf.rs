// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reverse path forwarding queries against the unicast routing table.
//!
//! The engine asks which interface and neighbor lead back toward a source or
//! RP. Those answers set the incoming interface of routes and the upstream
//! neighbor join/prune messages are sent to. The unicast table itself is an
//! external collaborator behind [`UnicastRib`]; [`StaticRib`] is a
//! longest-prefix-match table used by the daemon for configured routes and
//! by tests.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use pim_common::lock;
use serde::{Deserialize, Serialize};

use crate::types::{Prefix4, Vif};

/// The result of an RPF lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpfInfo {
    pub incoming: Vif,
    /// Upstream PIM neighbor. `None` when the address is directly attached.
    pub upstream: Option<Ipv4Addr>,
    pub metric: u32,
    pub preference: u32,
}

pub trait UnicastRib {
    fn resolve_rpf(&self, addr: Ipv4Addr) -> Option<RpfInfo>;
}

/// A configured unicast route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRoute {
    pub prefix: Prefix4,
    #[serde(flatten)]
    pub rpf: RpfInfo,
}

#[derive(Default)]
pub struct StaticRib {
    routes: Mutex<BTreeMap<Prefix4, RpfInfo>>,
}

impl StaticRib {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_routes(routes: &[StaticRoute]) -> Self {
        let rib = Self::new();
        for r in routes {
            rib.add_route(r.prefix, r.rpf);
        }
        rib
    }

    pub fn add_route(&self, prefix: Prefix4, rpf: RpfInfo) {
        lock!(self.routes).insert(prefix, rpf);
    }

    pub fn remove_route(&self, prefix: Prefix4) -> Option<RpfInfo> {
        lock!(self.routes).remove(&prefix)
    }

    pub fn len(&self) -> usize {
        lock!(self.routes).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl UnicastRib for StaticRib {
    /// Longest prefix match by linear scan. Configured tables are small.
    fn resolve_rpf(&self, addr: Ipv4Addr) -> Option<RpfInfo> {
        let routes = lock!(self.routes);
        let mut best: Option<(u8, RpfInfo)> = None;
        for (prefix, rpf) in routes.iter() {
            if !prefix.contains(addr) {
                continue;
            }
            match best {
                Some((len, _)) if len >= prefix.length => {}
                _ => best = Some((prefix.length, *rpf)),
            }
        }
        best.map(|(_, rpf)| rpf)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pim_common::cidr;

    fn info(incoming: Vif, metric: u32) -> RpfInfo {
        RpfInfo {
            incoming,
            upstream: Some(Ipv4Addr::new(198, 51, 100, 1)),
            metric,
            preference: 1,
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let rib = StaticRib::new();
        rib.add_route(cidr!("0.0.0.0/0"), info(1, 100));
        rib.add_route(cidr!("192.0.2.0/24"), info(2, 10));
        rib.add_route(cidr!("192.0.2.128/25"), info(3, 5));

        let lookup = |a: [u8; 4]| rib.resolve_rpf(Ipv4Addr::from(a));
        assert_eq!(lookup([192, 0, 2, 200]), Some(info(3, 5)));
        assert_eq!(lookup([192, 0, 2, 20]), Some(info(2, 10)));
        assert_eq!(lookup([203, 0, 113, 1]), Some(info(1, 100)));

        rib.remove_route(cidr!("0.0.0.0/0"));
        assert_eq!(lookup([203, 0, 113, 1]), None);
        assert_eq!(rib.len(), 2);
    }

    #[test]
    fn static_route_config() {
        let r: StaticRoute = serde_json::from_str(
            r#"{
                "prefix": {"value": "192.0.2.0", "length": 24},
                "incoming": 2,
                "upstream": "10.0.2.2",
                "metric": 10,
                "preference": 1
            }"#,
        )
        .expect("parse static route");
        let rib = StaticRib::from_routes(&[r]);
        let rpf = rib
            .resolve_rpf(Ipv4Addr::new(192, 0, 2, 9))
            .expect("route to source");
        assert_eq!(rpf.incoming, 2);
        assert_eq!(rpf.upstream, Some(Ipv4Addr::new(10, 0, 2, 2)));
    }
}
