// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The periodic aging pass.
//!
//! Every timer in the routing table is a countdown inside the entry that
//! owns it. [`MrtEngine::age_routes`] advances them all by the time since
//! the previous pass and acts on the ones that expired. It also samples
//! kernel cache counters and re-resolves unicast paths toward RPs and
//! sources.

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::catalog::{MrtEngine, PathInfo};
use crate::config::SptThreshold;
use crate::error::Error;
use crate::log::mrt_log;
use crate::rpset::RpGrpKey;
use crate::types::{MrtKey, VifSet};

const LOG_UNIT: &str = "age";

impl MrtEngine {
    /// Advance all timers by `elapsed` and act on whatever expired.
    pub fn age_routes(&mut self, elapsed: Duration) {
        self.age_rp_set(elapsed);
        self.refresh_rpf();
        self.age_route_timers(elapsed);
        self.sample_kernel_cache(elapsed);
        self.expire_routes(elapsed);
        self.check_spt_rate(elapsed);
    }

    fn age_rp_set(&mut self, elapsed: Duration) {
        let mut expired: Vec<RpGrpKey> = Vec::new();
        for (key, edge) in self.rpset.edges_mut() {
            edge.expiry.tick(elapsed);
            if edge.expiry.expired() {
                expired.push(*key);
            }
        }
        if expired.is_empty() {
            return;
        }
        mrt_log!(self, info, "rp-set holdtime expired";
            "edges" => expired.len()
        );
        if let Err(e) = self.delete_edges(expired) {
            mrt_log!(self, error, "expiring rp-set edges: {e}");
        }
    }

    /// Re-resolve the unicast path toward every RP and source, and push
    /// changes into the routes that use them.
    fn refresh_rpf(&mut self) {
        let rps: Vec<Ipv4Addr> =
            self.rpset.candidates().map(|c| c.rpentry.address).collect();
        for rp in rps {
            let path = PathInfo::from(self.rib.resolve_rpf(rp));
            if !self.rpset.set_rp_path(rp, path) {
                continue;
            }
            mrt_log!(self, info, "path to rp {rp} changed";
                "iif" => format!("{:?}", path.incoming),
                "upstream" => format!("{:?}", path.upstream)
            );
            if let Err(e) = self.apply_rp_path(rp, path) {
                mrt_log!(self, error, "applying rp path change: {e}");
            }
        }

        let sources: Vec<Ipv4Addr> = self.sources.keys().copied().collect();
        for source in sources {
            let path = PathInfo::from(self.rib.resolve_rpf(source));
            let Some(entry) = self.sources.get_mut(&source) else {
                continue;
            };
            if entry.rpf == path {
                continue;
            }
            entry.rpf = path;
            let groups: Vec<Ipv4Addr> = entry.groups().collect();
            mrt_log!(self, info, "path to source {source} changed";
                "iif" => format!("{:?}", path.incoming)
            );

            for group in groups {
                let key = MrtKey::sg(source, group);
                let Some(e) = self.routes.get_mut(&key) else {
                    continue;
                };
                if e.rp_bit() {
                    continue;
                }
                e.set_path(&path);
                let ifs = e.ifs;
                if let Err(err) =
                    self.change_interfaces(&key, path.incoming, ifs, false)
                {
                    mrt_log!(self, error, "applying source path: {err}";
                        "route" => key.to_string()
                    );
                }
            }
        }
    }

    fn apply_rp_path(
        &mut self,
        rp: Ipv4Addr,
        path: PathInfo,
    ) -> Result<(), Error> {
        let key = MrtKey::rp(rp);
        if let Some(e) = self.routes.get_mut(&key) {
            e.set_path(&path);
            let ifs = e.ifs;
            self.change_interfaces(&key, path.incoming, ifs, false)?;
        }
        for group in self.rpset.groups_of_rp(rp) {
            self.refresh_group_from_rp(group, false)?;
        }
        Ok(())
    }

    /// Per-vif join timers, assert timers, register suppression and the
    /// periodic join/prune timer.
    fn age_route_timers(&mut self, elapsed: Duration) {
        let register_vif = self.vifs.register_vif();
        let period = self.config.join_prune_period();
        let keys: Vec<MrtKey> = self.routes.keys().copied().collect();

        for key in keys {
            let Some(e) = self.routes.get_mut(&key) else {
                continue;
            };
            let mut ifs = e.ifs;
            let mut changed = false;

            let mut expired = Vec::new();
            for (vif, t) in e.vif_timers.iter_mut() {
                t.tick(elapsed);
                if t.expired() {
                    expired.push(*vif);
                }
            }
            for vif in expired {
                e.vif_timers.remove(&vif);
                ifs.joined.remove(vif);
                changed = true;
            }

            e.assert_timer.tick(elapsed);
            if e.assert_timer.expired() {
                e.assert_timer.disable();
                if !ifs.asserted.is_empty() {
                    ifs.asserted = VifSet::EMPTY;
                    changed = true;
                }
            }

            if let Some(spt) = e.spt_state_mut() {
                spt.rs_timer.tick(elapsed);
                if spt.rs_timer.expired() {
                    spt.rs_timer.disable();
                    if let (true, Some(reg)) = (spt.register, register_vif) {
                        ifs.joined.insert(reg);
                        changed = true;
                    }
                }
            }

            e.jp_timer.tick(elapsed);
            let jp_due = e.jp_timer.expired();
            if jp_due {
                e.jp_timer.arm(period);
            }
            let iif = e.incoming;

            if changed {
                if let Err(err) = self.change_interfaces(&key, iif, ifs, false)
                {
                    mrt_log!(self, error, "timer expiry update: {err}";
                        "route" => key.to_string()
                    );
                }
            }
            if jp_due {
                self.protocol.notify_route_changed(&key);
            }
        }
    }

    /// Read kernel counters for every cache node. Nodes that saw no new
    /// packets for the data timeout are removed. Traffic on an (S,G) node
    /// keeps the route alive.
    fn sample_kernel_cache(&mut self, elapsed: Duration) {
        let data_timeout = self.config.data_timeout();
        let nodes: Vec<(MrtKey, Ipv4Addr, Ipv4Addr)> = self
            .routes
            .iter()
            .flat_map(|(k, e)| {
                e.cache.pairs().into_iter().map(move |(s, g)| (*k, s, g))
            })
            .collect();

        for (key, source, group) in nodes {
            let count = match self.kernel.query_counters(source, group) {
                Ok(c) => c,
                Err(e) => {
                    mrt_log!(self, debug, "counter query failed: {e}";
                        "source" => source.to_string(),
                        "group" => group.to_string()
                    );
                    continue;
                }
            };
            let Some(entry) = self.routes.get_mut(&key) else {
                continue;
            };
            let Some(node) = entry.cache.get_mut(source, group) else {
                continue;
            };
            let active = count.packets != node.count.packets;
            node.count = count;
            if active {
                node.idle = Duration::ZERO;
            } else {
                node.idle += elapsed;
            }
            let idle = node.idle >= data_timeout;

            if active
                && entry.spt_state().is_some()
                && (!entry.timer.enabled()
                    || entry.timer.remaining() < data_timeout)
            {
                entry.timer.arm(data_timeout);
            }
            if idle {
                mrt_log!(self, debug, "data timeout";
                    "route" => key.to_string(),
                    "source" => source.to_string(),
                    "group" => group.to_string()
                );
                self.delete_single_kernel_cache(&key, source, group);
            }
        }
    }

    /// Delete routes whose entry timer expired and that have nothing left
    /// to do. Routes still carrying state get another holdtime.
    fn expire_routes(&mut self, elapsed: Duration) {
        let holdtime = self.config.join_prune_holdtime();
        let keys: Vec<MrtKey> = self.routes.keys().copied().collect();
        for key in keys {
            let expired = match self.routes.get_mut(&key) {
                Some(e) => {
                    e.timer.tick(elapsed);
                    e.timer.expired()
                }
                None => false,
            };
            if !expired {
                continue;
            }
            let pruned = self
                .routes
                .get(&key)
                .is_some_and(|e| !e.ifs.pruned.is_empty());
            if pruned {
                mrt_log!(self, debug, "rpt prune timed out";
                    "route" => key.to_string()
                );
                if let Err(err) =
                    self.update_ifs(&key, |ifs| ifs.pruned = VifSet::EMPTY)
                {
                    mrt_log!(self, error, "prune expiry update: {err}";
                        "route" => key.to_string()
                    );
                }
            }
            let busy = self.has_own_state(&key)
                || self.routes.get(&key).is_some_and(|e| e.has_kernel_cache());
            if busy {
                if let Some(e) = self.routes.get_mut(&key) {
                    e.timer.arm(holdtime);
                }
            } else {
                mrt_log!(self, debug, "route expired";
                    "route" => key.to_string()
                );
                self.delete_mrtentry(&key);
            }
        }
    }

    /// Switch shared-tree traffic to the shortest path tree once a source
    /// sends faster than the configured rate.
    fn check_spt_rate(&mut self, elapsed: Duration) {
        let SptThreshold::Rate { bytes, .. } = self.config.spt_threshold
        else {
            return;
        };
        self.rate_timer.tick(elapsed);
        if !self.rate_timer.expired() {
            return;
        }
        self.rate_timer.reset();

        let shared: Vec<(MrtKey, Ipv4Addr, Ipv4Addr)> = self
            .routes
            .iter()
            .filter(|(k, _)| !matches!(k, MrtKey::SourceGroup { .. }))
            .flat_map(|(k, e)| {
                e.cache.pairs().into_iter().map(move |(s, g)| (*k, s, g))
            })
            .collect();

        for (key, source, group) in shared {
            let Some(node) = self
                .routes
                .get_mut(&key)
                .and_then(|e| e.cache.get_mut(source, group))
            else {
                continue;
            };
            let delta = node.count.bytes.saturating_sub(node.rate_bytes);
            node.rate_bytes = node.count.bytes;

            let members = self.has_local_members(&key)
                || self.has_local_members(&MrtKey::wc(group));
            if delta <= bytes || !members {
                continue;
            }
            match self.switch_shortest_path(source, group) {
                Ok(_) => {
                    mrt_log!(self, info, "rate threshold crossed";
                        "source" => source.to_string(),
                        "group" => group.to_string(),
                        "bytes" => delta
                    );
                }
                Err(e) => {
                    mrt_log!(self, warn, "spt switch failed: {e}";
                        "source" => source.to_string(),
                        "group" => group.to_string()
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::EngineConfig;
    use crate::kernel::SgCount;
    use crate::rpf::RpfInfo;
    use crate::rpset::RpOrigin;
    use crate::test::{
        harness, harness_with, rp_spec, KernelCall, G1, R1, S1, S_LOCAL,
        VIF_LAN, VIF_LAN2, VIF_REG, VIF_RP, VIF_SRC,
    };
    use crate::types::{Interfaces, KindMask};
    use pim_common::cidr;
    use pretty_assertions::assert_eq;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn bootstrap_edge_expires() {
        let mut h = harness("age_bootstrap_expiry");
        let mut spec = rp_spec(R1, cidr!("232.0.0.0/8"), 0);
        spec.origin = RpOrigin::Bootstrap;
        spec.holdtime = 30;
        h.engine.add_rp_grp_entry(&spec).expect("add edge");
        let g = Ipv4Addr::new(232, 1, 1, 1);
        h.engine
            .find_route(None, Some(g), KindMask::WC, true)
            .expect("create");

        h.engine.age_routes(secs(20));
        assert!(h.engine.group(g).is_some());
        h.engine.age_routes(secs(10));
        assert!(h.engine.group(g).is_none());
        assert!(h.engine.rpset().mask(&cidr!("232.0.0.0/8")).is_none());
        // static edges stay
        assert!(h.engine.rp_grp_match(G1).is_some());
        h.engine.audit().expect("audit");
    }

    #[test]
    fn join_timer_expiry_clears_joined() {
        let mut h = harness("age_join_timer");
        let wc = MrtKey::wc(G1);
        h.engine.join(wc, VIF_LAN, 30).expect("join");
        h.engine.join(wc, VIF_LAN2, 300).expect("join");

        h.engine.age_routes(secs(30));
        assert_eq!(
            h.engine.route(&wc).map(|e| e.oifs),
            Some(VifSet::single(VIF_LAN2))
        );
    }

    #[test]
    fn jp_timer_notifies_and_rearms() {
        let mut h = harness("age_jp_timer");
        let wc = MrtKey::wc(G1);
        h.engine.add_leaf(VIF_LAN, None, G1).expect("leaf");

        // the join fired the timer, so the first pass sends
        h.engine.age_routes(secs(5));
        assert_eq!(h.protocol.changed(), vec![wc]);

        h.engine.age_routes(secs(30));
        assert_eq!(h.protocol.changed().len(), 1);
        h.engine.age_routes(secs(30));
        assert_eq!(h.protocol.changed(), vec![wc, wc]);
    }

    #[test]
    fn stateless_route_reclaimed() {
        let mut h = harness("age_reclaim");
        h.engine.add_leaf(VIF_LAN, None, G1).expect("leaf");
        h.engine.delete_leaf(VIF_LAN, None, G1).expect("leaf gone");
        h.engine.age_routes(secs(5));
        assert_eq!(h.engine.route_count(), 0);
        assert!(h.engine.group(G1).is_none());
        h.engine.audit().expect("audit");
    }

    #[test]
    fn route_with_members_survives_expiry() {
        let mut h = harness("age_keep_members");
        let wc = h.engine.add_leaf(VIF_LAN, None, G1).expect("leaf");
        h.engine.age_routes(secs(210));
        let e = h.engine.route(&wc).expect("route kept");
        assert!(!e.timer().expired());
    }

    #[test]
    fn idle_cache_times_out() {
        let mut h = harness("age_data_timeout");
        let wc = h.engine.add_leaf(VIF_LAN, None, G1).expect("leaf");
        h.engine.on_cache_miss(S1, G1, VIF_RP).expect("miss");
        assert_eq!(h.engine.cache_owner(S1, G1), Some(wc));

        h.kernel.set_counters(S1, G1, SgCount {
            packets: 10,
            bytes: 1000,
            wrong_if: 0,
        });
        h.engine.age_routes(secs(200));
        assert_eq!(h.engine.cache_owner(S1, G1), Some(wc));
        // no packets since the last sample
        h.engine.age_routes(secs(100));
        assert_eq!(h.engine.cache_owner(S1, G1), Some(wc));
        h.kernel.clear();
        h.engine.age_routes(secs(110));
        assert_eq!(h.engine.cache_owner(S1, G1), None);
        assert!(h
            .kernel
            .calls()
            .contains(&KernelCall::Uninstall { source: S1, group: G1 }));
    }

    #[test]
    fn source_path_change_moves_iif() {
        let mut h = harness("age_source_rpf");
        let sg = h
            .engine
            .find_route(Some(S1), Some(G1), KindMask::SG, true)
            .expect("create")
            .expect("key");
        h.engine
            .change_interfaces(
                &sg,
                Some(VIF_SRC),
                Interfaces {
                    joined: VifSet::single(VIF_LAN),
                    ..Default::default()
                },
                false,
            )
            .expect("join");
        h.engine.add_kernel_cache(&sg, S1, G1).expect("cache");

        h.rib.add_route(
            cidr!("192.0.2.0/28"),
            RpfInfo {
                incoming: VIF_LAN2,
                upstream: Some(Ipv4Addr::new(10, 0, 4, 2)),
                metric: 1,
                preference: 1,
            },
        );
        h.kernel.clear();
        h.engine.age_routes(secs(5));

        let e = h.engine.route(&sg).expect("(S,G)");
        assert_eq!(e.incoming, Some(VIF_LAN2));
        assert_eq!(e.upstream, Some(Ipv4Addr::new(10, 0, 4, 2)));
        assert_eq!(
            h.kernel.installed(S1, G1),
            Some((VIF_LAN2, VifSet::single(VIF_LAN), Some(R1)))
        );
    }

    #[test]
    fn lost_source_route_keeps_entries() {
        let mut h = harness("age_source_lost");
        let sg = h
            .engine
            .add_leaf(VIF_LAN, Some(S1), G1)
            .expect("source specific leaf");
        h.rib.remove_route(cidr!("192.0.2.0/24"));
        h.engine.age_routes(secs(5));

        let e = h.engine.route(&sg).expect("(S,G) kept");
        assert_eq!(e.incoming, None);
        assert_eq!(h.engine.source(S1).and_then(|s| s.rpf.incoming), None);
    }

    #[test]
    fn rp_path_change_reaches_wc() {
        let mut h = harness("age_rp_rpf");
        let wc = h.engine.add_leaf(VIF_LAN, None, G1).expect("leaf");
        h.rib.add_route(
            cidr!("10.0.1.100/32"),
            RpfInfo {
                incoming: VIF_LAN2,
                upstream: Some(Ipv4Addr::new(10, 0, 4, 2)),
                metric: 1,
                preference: 1,
            },
        );
        h.engine.age_routes(secs(5));
        let e = h.engine.route(&wc).expect("(*,G)");
        assert_eq!(e.incoming, Some(VIF_LAN2));
        assert_eq!(e.upstream, Some(Ipv4Addr::new(10, 0, 4, 2)));
        assert_eq!(
            h.engine
                .rpset()
                .candidate(R1)
                .and_then(|c| c.rpentry.rpf.incoming),
            Some(VIF_LAN2)
        );
    }

    #[test]
    fn assert_expiry_restores_oif() {
        let mut h = harness("age_assert");
        let wc = h.engine.add_leaf(VIF_LAN, None, G1).expect("leaf");
        h.engine.set_asserted(&wc, VIF_LAN, 60).expect("assert");
        h.engine.age_routes(secs(60));
        assert_eq!(
            h.engine.route(&wc).map(|e| e.oifs),
            Some(VifSet::single(VIF_LAN))
        );
    }

    #[test]
    fn register_suppression_expires() {
        let mut h = harness("age_register_suppression");
        h.engine.on_cache_miss(S_LOCAL, G1, VIF_LAN).expect("miss");
        h.engine.register_stop(S_LOCAL, G1).expect("stop");
        let sg = MrtKey::sg(S_LOCAL, G1);
        assert_eq!(h.engine.route(&sg).map(|e| e.oifs), Some(VifSet::EMPTY));

        h.engine.age_routes(secs(60));
        assert_eq!(
            h.engine.route(&sg).map(|e| e.oifs),
            Some(VifSet::single(VIF_REG))
        );
    }

    #[test]
    fn rate_threshold_switches() {
        let mut h = harness_with(
            "age_spt_rate",
            EngineConfig {
                spt_threshold: SptThreshold::Rate {
                    bytes: 500,
                    interval: 10,
                },
                ..Default::default()
            },
        );
        h.engine.add_leaf(VIF_LAN, None, G1).expect("leaf");
        h.engine.on_cache_miss(S1, G1, VIF_RP).expect("miss");

        h.kernel.set_counters(S1, G1, SgCount {
            packets: 3,
            bytes: 400,
            wrong_if: 0,
        });
        h.engine.age_routes(secs(10));
        assert!(h.engine.route(&MrtKey::sg(S1, G1)).is_none());

        h.kernel.set_counters(S1, G1, SgCount {
            packets: 9,
            bytes: 1400,
            wrong_if: 0,
        });
        h.engine.age_routes(secs(10));
        let sg = MrtKey::sg(S1, G1);
        assert!(h.engine.route(&sg).is_some());
        assert_eq!(h.engine.cache_owner(S1, G1), Some(sg));
        h.engine.audit().expect("audit");
    }
}
