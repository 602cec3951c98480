// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel upcalls: cache misses, wrong-interface arrivals, the shortest
//! path switch and the DR register path.

use std::net::Ipv4Addr;

use crate::catalog::MrtEngine;
use crate::config::SptThreshold;
use crate::error::Error;
use crate::log::mrt_log;
use crate::types::{is_routable_group, KindMask, MrtKey, Vif};

const LOG_UNIT: &str = "upcall";

impl MrtEngine {
    /// The kernel has no forwarding entry for traffic from `source` to
    /// `group` that arrived on `iif`.
    pub fn on_cache_miss(
        &mut self,
        source: Ipv4Addr,
        group: Ipv4Addr,
        iif: Vif,
    ) -> Result<(), Error> {
        if !is_routable_group(group) {
            mrt_log!(self, trace, "ignoring cache miss for {group}");
            return Ok(());
        }

        let directly_attached = self.vifs.is_dr(iif)
            && self.vifs.find_vif_direct_local(source) == Some(iif);

        let key = if directly_attached {
            self.start_register(source, group)?
        } else {
            let Some(key) =
                self.lookup_route(Some(source), Some(group), KindMask::all())
            else {
                mrt_log!(self, debug, "no route for ({source},{group})";
                    "iif" => iif
                );
                return Ok(());
            };
            let shared = !matches!(key, MrtKey::SourceGroup { .. });
            if shared
                && self.config.spt_threshold == SptThreshold::Immediate
                && self.has_local_members(&key)
            {
                self.switch_shortest_path(source, group)?;
            }
            key
        };

        let Some(entry) = self.routes.get(&key) else {
            return Ok(());
        };
        if entry.incoming != Some(iif) || entry.oifs.is_empty() {
            mrt_log!(self, debug, "not forwarding ({source},{group})";
                "route" => key.to_string(),
                "iif" => iif
            );
            return Ok(());
        }

        if let MrtKey::SourceGroup { .. } = key {
            let parent = self
                .lookup_route(None, Some(group), KindMask::WC | KindMask::RP)
                .and_then(|k| self.routes.get(&k))
                .map(|p| (p.incoming, p.upstream));
            let data_timeout = self.config.data_timeout();
            if let Some(e) = self.routes.get_mut(&key) {
                if e.timer.remaining() < data_timeout || !e.timer.enabled() {
                    e.timer.arm(data_timeout);
                }
                let path = (e.incoming, e.upstream);
                if let Some(spt) = e.spt_state_mut() {
                    if !spt.spt && parent.is_some_and(|p| p != path) {
                        spt.spt = true;
                        spt.rp_bit = false;
                    }
                }
            }
        }

        self.add_kernel_cache(&key, source, group)
    }

    /// Traffic from `source` to `group` arrived on `iif`, which is not the
    /// incoming interface of its kernel entry.
    pub fn on_wrong_iif(
        &mut self,
        source: Ipv4Addr,
        group: Ipv4Addr,
        iif: Vif,
    ) -> Result<(), Error> {
        if !is_routable_group(group) || self.vifs.is_register(iif) {
            return Ok(());
        }
        let Some(key) =
            self.lookup_route(Some(source), Some(group), KindMask::all())
        else {
            return Ok(());
        };

        if let MrtKey::SourceGroup { .. } = key {
            let source_path = self.sources.get(&source).map(|s| s.rpf);
            let on_spt = self
                .routes
                .get(&key)
                .and_then(|e| e.spt_state())
                .is_some_and(|s| s.spt);

            if let Some(path) = source_path {
                if !on_spt && path.incoming == Some(iif) {
                    return self.complete_spt_switch(&key, source, group, iif);
                }
            }
        }

        if self.routes.get(&key).is_some_and(|e| e.oifs.contains(iif)) {
            mrt_log!(self, debug, "assert needed on vif {iif}";
                "route" => key.to_string()
            );
            self.protocol.notify_assert_needed(source, group, iif, &key);
        }
        Ok(())
    }

    /// Source traffic arrived on the shortest path: move the (S,G) onto it.
    fn complete_spt_switch(
        &mut self,
        key: &MrtKey,
        source: Ipv4Addr,
        group: Ipv4Addr,
        iif: Vif,
    ) -> Result<(), Error> {
        let path = self
            .sources
            .get(&source)
            .map(|s| s.rpf)
            .unwrap_or_default();
        let owned = self.cache_owner(source, group) == Some(*key);

        let Some(e) = self.routes.get_mut(key) else {
            return Err(Error::NotFound(key.to_string()));
        };
        if let Some(spt) = e.spt_state_mut() {
            spt.rp_bit = false;
            spt.spt = true;
        }
        e.set_path(&path);
        let ifs = e.ifs;

        self.change_interfaces(key, Some(iif), ifs, false)?;
        if !owned {
            self.add_kernel_cache(key, source, group)?;
        }
        if let Some(e) = self.routes.get_mut(key) {
            e.jp_timer.fire();
        }
        mrt_log!(self, info, "switched to shortest path tree";
            "route" => key.to_string(),
            "iif" => iif
        );
        Ok(())
    }

    /// Create (or convert) the (S,G) so its join goes toward the source.
    pub fn switch_shortest_path(
        &mut self,
        source: Ipv4Addr,
        group: Ipv4Addr,
    ) -> Result<Option<MrtKey>, Error> {
        let Some(key) =
            self.find_route(Some(source), Some(group), KindMask::SG, true)?
        else {
            return Ok(None);
        };
        let path = self
            .sources
            .get(&source)
            .map(|s| s.rpf)
            .unwrap_or_default();

        let Some(e) = self.routes.get_mut(&key) else {
            return Ok(None);
        };
        if e.new {
            e.new = false;
        } else if e.rp_bit() {
            if let Some(spt) = e.spt_state_mut() {
                spt.rp_bit = false;
            }
            e.set_path(&path);
            let ifs = e.ifs;
            self.delete_mrtentry_all_kernel_cache(&key);
            self.change_interfaces(&key, path.incoming, ifs, false)?;
        }

        let data_timeout = self.config.data_timeout();
        if let Some(e) = self.routes.get_mut(&key) {
            e.timer.arm(data_timeout);
            e.jp_timer.fire();
        }
        mrt_log!(self, info, "joining shortest path tree";
            "route" => key.to_string()
        );
        Ok(Some(key))
    }

    /// True if the route has directly attached members.
    pub(crate) fn has_local_members(&self, key: &MrtKey) -> bool {
        self.routes
            .get(key)
            .is_some_and(|e| !e.ifs.leaves.is_empty())
    }

    /// The DR saw the first packet from a directly attached source: set up
    /// the (S,G) that registers its traffic to the RP.
    fn start_register(
        &mut self,
        source: Ipv4Addr,
        group: Ipv4Addr,
    ) -> Result<MrtKey, Error> {
        let key = self
            .find_route(Some(source), Some(group), KindMask::SG, true)?
            .ok_or_else(|| Error::NotFound(format!("({source},{group})")))?;
        let register_vif = if self.is_local_rp_for(group) {
            None
        } else {
            self.vifs.register_vif()
        };

        let Some(e) = self.routes.get_mut(&key) else {
            return Err(Error::NotFound(key.to_string()));
        };
        e.new = false;
        let mut suppressed = false;
        if let Some(spt) = e.spt_state_mut() {
            spt.register = true;
            suppressed = spt.rs_timer.enabled();
        }
        let (iif, mut ifs) = (e.incoming, e.ifs);
        if let Some(reg) = register_vif {
            if !suppressed {
                ifs.joined.insert(reg);
            }
        }
        self.change_interfaces(&key, iif, ifs, false)?;
        Ok(key)
    }

    /// The RP asked us to stop registering for `source, group`. The
    /// register vif comes back when the suppression timer expires.
    pub fn register_stop(
        &mut self,
        source: Ipv4Addr,
        group: Ipv4Addr,
    ) -> Result<(), Error> {
        let key = MrtKey::sg(source, group);
        let Some(reg) = self.vifs.register_vif() else {
            return Ok(());
        };
        let suppression = self.config.register_suppression_timeout();
        let Some(spt) =
            self.routes.get_mut(&key).and_then(|e| e.spt_state_mut())
        else {
            return Ok(());
        };
        if !spt.register {
            return Ok(());
        }
        spt.rs_timer.arm(suppression);
        self.update_ifs(&key, |ifs| ifs.joined.remove(reg))?;
        mrt_log!(self, debug, "register stopped";
            "route" => key.to_string()
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::EngineConfig;
    use crate::test::{
        harness, harness_with, KernelCall, G1, R1, S1, S2, S_LOCAL,
        VIF_LAN, VIF_LAN2, VIF_REG, VIF_RP, VIF_SRC,
    };
    use crate::types::{Interfaces, VifSet};
    use pretty_assertions::assert_eq;

    #[test]
    fn link_local_miss_ignored() {
        let mut h = harness("upcall_link_local");
        h.engine
            .on_cache_miss(S1, Ipv4Addr::new(224, 0, 0, 5), VIF_SRC)
            .expect("miss");
        assert_eq!(h.engine.route_count(), 0);
        assert_eq!(h.kernel.calls(), vec![]);
    }

    #[test]
    fn miss_without_route_does_nothing() {
        let mut h = harness("upcall_no_route");
        h.engine.on_cache_miss(S1, G1, VIF_SRC).expect("miss");
        assert_eq!(h.engine.route_count(), 0);
        assert_eq!(h.kernel.calls(), vec![]);
    }

    #[test]
    fn miss_on_shared_tree_installs() {
        let mut h = harness("upcall_shared_tree");
        let wc = MrtKey::wc(G1);
        h.engine.join(wc, VIF_LAN, 210).expect("join");
        h.kernel.clear();

        h.engine.on_cache_miss(S2, G1, VIF_RP).expect("miss");
        assert_eq!(h.engine.cache_owner(S2, G1), Some(wc));
        assert_eq!(
            h.kernel.calls(),
            vec![KernelCall::Install {
                source: S2,
                group: G1,
                iif: VIF_RP,
                oifs: VifSet::single(VIF_LAN),
                rp: Some(R1),
            }]
        );

        // wrong iif on the shared route only installs when it matches
        h.kernel.clear();
        h.engine.on_cache_miss(S1, G1, VIF_LAN2).expect("miss");
        assert_eq!(h.kernel.calls(), vec![]);
    }

    #[test]
    fn immediate_threshold_switches_on_first_packet() {
        let mut h = harness_with(
            "upcall_immediate_spt",
            EngineConfig {
                spt_threshold: SptThreshold::Immediate,
                ..Default::default()
            },
        );
        h.engine.add_leaf(VIF_LAN, None, G1).expect("leaf");
        h.engine.on_cache_miss(S1, G1, VIF_RP).expect("miss");

        let sg = MrtKey::sg(S1, G1);
        let e = h.engine.route(&sg).expect("(S,G) created");
        assert!(!e.new);
        assert!(e.jp_timer().expired());
        assert_eq!(e.incoming, Some(VIF_SRC));
        // the packet still rides the shared tree until the SPT delivers
        assert_eq!(h.engine.cache_owner(S1, G1), Some(MrtKey::wc(G1)));
    }

    #[test]
    fn dr_registers_direct_source() {
        let mut h = harness("upcall_register");
        h.engine.on_cache_miss(S_LOCAL, G1, VIF_LAN).expect("miss");

        let sg = MrtKey::sg(S_LOCAL, G1);
        let e = h.engine.route(&sg).expect("(S,G)");
        let spt = e.spt_state().expect("spt state");
        assert!(spt.register);
        assert!(!e.new);
        assert_eq!(e.oifs, VifSet::single(VIF_REG));
        assert_eq!(
            h.kernel.installed(S_LOCAL, G1),
            Some((VIF_LAN, VifSet::single(VIF_REG), Some(R1)))
        );

        h.engine.register_stop(S_LOCAL, G1).expect("register stop");
        let e = h.engine.route(&sg).expect("(S,G)");
        assert_eq!(e.oifs, VifSet::EMPTY);
        assert!(e.spt_state().expect("spt").rs_timer.enabled());
        assert_eq!(
            h.kernel.installed(S_LOCAL, G1),
            Some((VIF_LAN, VifSet::EMPTY, Some(R1)))
        );
    }

    #[test]
    fn rp_does_not_register_to_itself() {
        let mut h = harness_with(
            "upcall_local_rp",
            EngineConfig {
                local_rp_address: Some(R1),
                ..Default::default()
            },
        );
        h.engine.on_cache_miss(S_LOCAL, G1, VIF_LAN).expect("miss");
        let e = h.engine.route(&MrtKey::sg(S_LOCAL, G1)).expect("(S,G)");
        assert!(e.spt_state().expect("spt").register);
        assert_eq!(e.oifs, VifSet::EMPTY);
    }

    // An RP-bit (S,G) seeing its source's traffic on the source's own
    // interface completes the switch to the shortest path tree.
    #[test]
    fn wrong_iif_completes_spt_switch() {
        let mut h = harness("upcall_spt_complete");
        let sg = h
            .engine
            .find_route(Some(S1), Some(G1), KindMask::SG, true)
            .expect("create")
            .expect("key");
        h.engine.set_rp_bit(&sg).expect("rp bit");
        h.engine
            .update_ifs(&sg, |ifs| ifs.joined.insert(VIF_LAN))
            .expect("join");
        let iif = h.engine.route(&sg).and_then(|e| e.incoming);
        assert_eq!(iif, Some(VIF_RP));
        h.kernel.clear();

        h.engine.on_wrong_iif(S1, G1, VIF_SRC).expect("wrong iif");

        let e = h.engine.route(&sg).expect("(S,G)");
        let spt = e.spt_state().expect("spt");
        assert!(spt.spt);
        assert!(!spt.rp_bit);
        assert_eq!(e.incoming, Some(VIF_SRC));
        assert!(e.jp_timer().expired());
        assert_eq!(
            h.kernel.calls(),
            vec![KernelCall::Install {
                source: S1,
                group: G1,
                iif: VIF_SRC,
                oifs: VifSet::single(VIF_LAN),
                rp: Some(R1),
            }]
        );
        h.engine.audit().expect("audit");
    }

    #[test]
    fn wrong_iif_on_oif_asks_for_assert() {
        let mut h = harness("upcall_assert");
        let wc = MrtKey::wc(G1);
        h.engine.join(wc, VIF_LAN, 210).expect("join");
        h.engine.on_wrong_iif(S1, G1, VIF_LAN).expect("wrong iif");
        assert_eq!(h.protocol.asserts(), vec![(S1, G1, VIF_LAN, wc)]);

        // the register vif never triggers anything
        h.engine.on_wrong_iif(S1, G1, VIF_REG).expect("wrong iif");
        assert_eq!(h.protocol.asserts().len(), 1);
    }

    #[test]
    fn switch_converts_rp_bit_entry() {
        let mut h = harness("upcall_switch_rpt");
        let sg = h
            .engine
            .find_route(Some(S1), Some(G1), KindMask::SG, true)
            .expect("create")
            .expect("key");
        h.engine
            .change_interfaces(&sg, Some(VIF_SRC), Interfaces::default(), false)
            .expect("settle");
        if let Some(e) = h.engine.routes.get_mut(&sg) {
            e.new = false;
        }
        h.engine.set_rp_bit(&sg).expect("rp bit");

        let key = h.engine.switch_shortest_path(S1, G1).expect("switch");
        assert_eq!(key, Some(sg));
        let e = h.engine.route(&sg).expect("(S,G)");
        assert!(!e.rp_bit());
        assert_eq!(e.incoming, Some(VIF_SRC));
    }
}
