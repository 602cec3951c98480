// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entry points for local membership and PIM join/prune/assert state.

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::catalog::MrtEngine;
use crate::error::Error;
use crate::log::mrt_log;
use crate::timer::Timer;
use crate::types::{Interfaces, KindMask, MrtKey, OifTransition, Vif, VifSet};

const LOG_UNIT: &str = "membership";

impl MrtEngine {
    fn check_vif(&self, vif: Vif) -> Result<(), Error> {
        if !self.vifs.is_usable(vif) {
            return Err(Error::InvalidVif(vif));
        }
        Ok(())
    }

    /// Find or create the route `target` names.
    fn create_target(&mut self, target: &MrtKey) -> Result<MrtKey, Error> {
        let (source, group, kinds) = match *target {
            MrtKey::SourceGroup { source, group } => {
                (Some(source), Some(group), KindMask::SG)
            }
            MrtKey::Group { group } => (None, Some(group), KindMask::WC),
            MrtKey::Rp { rp } => (Some(rp), None, KindMask::RP),
        };
        self.find_route(source, group, kinds, true)?
            .ok_or_else(|| Error::NotFound(target.to_string()))
    }

    /// Apply `f` to a route's interface state and propagate.
    pub(crate) fn update_ifs(
        &mut self,
        key: &MrtKey,
        f: impl FnOnce(&mut Interfaces),
    ) -> Result<OifTransition, Error> {
        let Some(e) = self.routes.get(key) else {
            return Err(Error::NotFound(key.to_string()));
        };
        let (iif, mut ifs) = (e.incoming, e.ifs);
        f(&mut ifs);
        self.change_interfaces(key, iif, ifs, false)
    }

    /// True if the route has joins (other than the register vif) or local
    /// members of its own.
    pub(crate) fn has_own_state(&self, key: &MrtKey) -> bool {
        let reg = self
            .vifs
            .register_vif()
            .map(VifSet::single)
            .unwrap_or_default();
        self.routes.get(key).is_some_and(|e| {
            !((e.ifs.joined - reg) | e.ifs.leaves).is_empty()
        })
    }

    /// Expire a route without state so the next aging pass reclaims it.
    fn expire_if_stateless(&mut self, key: &MrtKey) {
        if self.has_own_state(key) {
            return;
        }
        if let Some(e) = self.routes.get_mut(key) {
            e.timer.fire();
        }
    }

    /// A local member joined `group` on `vif`, for one source or for all.
    pub fn add_leaf(
        &mut self,
        vif: Vif,
        source: Option<Ipv4Addr>,
        group: Ipv4Addr,
    ) -> Result<MrtKey, Error> {
        self.check_vif(vif)?;
        let target = match source {
            Some(s) => MrtKey::sg(s, group),
            None => MrtKey::wc(group),
        };
        let key = self.create_target(&target)?;
        self.update_ifs(&key, |ifs| ifs.leaves.insert(vif))?;
        mrt_log!(self, info, "leaf added on vif {vif}";
            "route" => key.to_string()
        );
        Ok(key)
    }

    /// The last local member of `group` on `vif` left.
    pub fn delete_leaf(
        &mut self,
        vif: Vif,
        source: Option<Ipv4Addr>,
        group: Ipv4Addr,
    ) -> Result<(), Error> {
        let key = match source {
            Some(s) => MrtKey::sg(s, group),
            None => MrtKey::wc(group),
        };
        if !self.routes.contains_key(&key) {
            return Ok(());
        }
        self.update_ifs(&key, |ifs| ifs.leaves.remove(vif))?;
        self.expire_if_stateless(&key);
        mrt_log!(self, info, "leaf removed on vif {vif}";
            "route" => key.to_string()
        );
        Ok(())
    }

    /// A PIM join for `target` arrived on `vif`.
    pub fn join(
        &mut self,
        target: MrtKey,
        vif: Vif,
        holdtime: u16,
    ) -> Result<MrtKey, Error> {
        self.check_vif(vif)?;
        let key = self.create_target(&target)?;
        let hold = Duration::from_secs(holdtime.into());
        if let Some(e) = self.routes.get_mut(&key) {
            e.vif_timers.insert(vif, Timer::armed(hold));
            e.timer.arm(hold.max(e.timer.remaining()));
        }
        self.update_ifs(&key, |ifs| {
            ifs.joined.insert(vif);
            ifs.pruned.remove(vif);
        })?;
        Ok(key)
    }

    /// A PIM prune for `target` arrived on `vif`. With `rpt`, an (S,G)
    /// target is pruned off the shared tree: the (S,G) is created with the
    /// RP bit if needed and `vif` is added to its pruned set.
    pub fn prune(
        &mut self,
        target: MrtKey,
        vif: Vif,
        rpt: bool,
    ) -> Result<(), Error> {
        self.check_vif(vif)?;

        if rpt && matches!(target, MrtKey::SourceGroup { .. }) {
            let existed = self.routes.contains_key(&target);
            let key = self.create_target(&target)?;
            if !existed {
                self.set_rp_bit(&key)?;
            }
            let hold = self.config.join_prune_holdtime();
            if let Some(e) = self.routes.get_mut(&key) {
                e.vif_timers.remove(&vif);
                e.timer.arm(hold);
            }
            self.update_ifs(&key, |ifs| {
                ifs.pruned.insert(vif);
                ifs.joined.remove(vif);
            })?;
            return Ok(());
        }

        let Some(e) = self.routes.get_mut(&target) else {
            return Ok(());
        };
        e.vif_timers.remove(&vif);
        self.update_ifs(&target, |ifs| ifs.joined.remove(vif))?;
        self.expire_if_stateless(&target);
        Ok(())
    }

    /// This router lost an assert on `vif` for the route.
    pub fn set_asserted(
        &mut self,
        key: &MrtKey,
        vif: Vif,
        holdtime: u16,
    ) -> Result<(), Error> {
        self.check_vif(vif)?;
        let Some(e) = self.routes.get_mut(key) else {
            return Err(Error::NotFound(key.to_string()));
        };
        e.assert_timer.arm(Duration::from_secs(holdtime.into()));
        self.update_ifs(key, |ifs| ifs.asserted.insert(vif))?;
        Ok(())
    }

    pub fn clear_asserted(
        &mut self,
        key: &MrtKey,
        vif: Vif,
    ) -> Result<(), Error> {
        self.update_ifs(key, |ifs| ifs.asserted.remove(vif))?;
        Ok(())
    }

    /// Turn an (S,G) into an (S,G)RPT entry whose iif points at the RP.
    pub fn set_rp_bit(&mut self, key: &MrtKey) -> Result<(), Error> {
        let MrtKey::SourceGroup { group, .. } = *key else {
            return Err(Error::InvalidAddress(format!(
                "{key} cannot carry the rp bit"
            )));
        };
        let path = self
            .groups
            .get(&group)
            .and_then(|g| self.rpset.rp_path(g.rp_address))
            .unwrap_or_default();

        let Some(e) = self.routes.get_mut(key) else {
            return Err(Error::NotFound(key.to_string()));
        };
        let Some(spt) = e.spt_state_mut() else {
            return Err(Error::InvalidAddress(format!(
                "{key} cannot carry the rp bit"
            )));
        };
        if spt.rp_bit {
            return Ok(());
        }
        spt.rp_bit = true;
        spt.spt = false;
        e.set_path(&path);
        e.jp_timer.fire();
        let ifs = e.ifs;
        self.change_interfaces(key, path.incoming, ifs, false)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::{harness, G1, S1, VIF_LAN, VIF_LAN2, VIF_REG, VIF_RP};
    use pretty_assertions::assert_eq;

    #[test]
    fn leaf_lifecycle() {
        let mut h = harness("membership_leaf");
        let key = h.engine.add_leaf(VIF_LAN, None, G1).expect("add leaf");
        assert_eq!(key, MrtKey::wc(G1));
        let e = h.engine.route(&key).expect("route");
        assert_eq!(e.oifs, VifSet::single(VIF_LAN));
        assert!(!e.timer().expired());

        h.engine.delete_leaf(VIF_LAN, None, G1).expect("delete leaf");
        let e = h.engine.route(&key).expect("route kept until aged");
        assert_eq!(e.oifs, VifSet::EMPTY);
        assert!(e.timer().expired());

        // unknown routes are ignored
        h.engine
            .delete_leaf(VIF_LAN, Some(S1), G1)
            .expect("delete unknown leaf");
    }

    #[test]
    fn bad_vif_rejected() {
        let mut h = harness("membership_bad_vif");
        assert_eq!(
            h.engine.add_leaf(31, None, G1),
            Err(Error::InvalidVif(31))
        );
        assert!(h.engine.group(G1).is_none());
    }

    #[test]
    fn join_then_prune() {
        let mut h = harness("membership_join_prune");
        let wc = MrtKey::wc(G1);
        h.engine.join(wc, VIF_LAN2, 210).expect("join");
        let e = h.engine.route(&wc).expect("route");
        assert_eq!(e.oifs, VifSet::single(VIF_LAN2));
        assert_eq!(
            e.vif_timer(VIF_LAN2).map(|t| t.remaining()),
            Some(Duration::from_secs(210))
        );
        let rp = h.engine.group(G1).map(|g| g.rp_address);
        assert_eq!(rp, Some(crate::test::R1));

        h.engine.prune(wc, VIF_LAN2, false).expect("prune");
        let e = h.engine.route(&wc).expect("route");
        assert_eq!(e.oifs, VifSet::EMPTY);
        assert!(e.vif_timer(VIF_LAN2).is_none());
        assert!(e.timer().expired());
    }

    #[test]
    fn rpt_prune_creates_rp_bit_entry() {
        let mut h = harness("membership_rpt_prune");
        h.engine.join(MrtKey::wc(G1), VIF_LAN, 210).expect("join");
        h.engine.join(MrtKey::wc(G1), VIF_LAN2, 210).expect("join");

        let sg = MrtKey::sg(S1, G1);
        h.engine.prune(sg, VIF_LAN2, true).expect("rpt prune");
        let e = h.engine.route(&sg).expect("(S,G)RPT");
        assert!(e.rp_bit());
        assert_eq!(e.incoming, Some(VIF_RP));
        assert_eq!(e.oifs, VifSet::single(VIF_LAN));
        h.engine.audit().expect("audit");
    }

    #[test]
    fn rpt_prune_of_last_oif_holds() {
        let mut h = harness("membership_rpt_prune_hold");
        let wc = h.engine.join(MrtKey::wc(G1), VIF_LAN, 210).expect("join");
        h.engine.on_cache_miss(S1, G1, VIF_RP).expect("miss");
        assert_eq!(h.engine.cache_owner(S1, G1), Some(wc));

        let sg = MrtKey::sg(S1, G1);
        h.engine.prune(sg, VIF_LAN, true).expect("rpt prune");
        let e = h.engine.route(&sg).expect("(S,G)RPT");
        assert_eq!(e.oifs, VifSet::EMPTY);
        assert!(!e.timer().expired());

        h.engine.age_routes(Duration::from_secs(5));
        h.engine.age_routes(Duration::from_secs(60));
        let e = h.engine.route(&sg).expect("prune survives aging");
        assert!(e.rp_bit());
        assert!(e.ifs.pruned.contains(VIF_LAN));
        assert_eq!(e.oifs, VifSet::EMPTY);
        assert_eq!(h.engine.cache_owner(S1, G1), Some(sg));
        assert_eq!(
            h.kernel.installed(S1, G1).map(|(iif, oifs, _)| (iif, oifs)),
            Some((VIF_RP, VifSet::EMPTY))
        );
        h.engine.audit().expect("audit");
    }

    #[test]
    fn rpt_prune_times_out() {
        let mut h = harness("membership_rpt_prune_expiry");
        h.engine.join(MrtKey::wc(G1), VIF_LAN, 210).expect("join");
        h.engine.join(MrtKey::wc(G1), VIF_LAN2, 420).expect("join");
        let sg = MrtKey::sg(S1, G1);
        h.engine.prune(sg, VIF_LAN2, true).expect("rpt prune");
        h.engine.prune(sg, VIF_LAN, true).expect("rpt prune");

        h.engine.age_routes(Duration::from_secs(200));
        let e = h.engine.route(&sg).expect("prune still held");
        assert_eq!(e.oifs, VifSet::EMPTY);

        // holdtime over: nothing is left on the (S,G)RPT
        h.engine.age_routes(Duration::from_secs(10));
        assert!(h.engine.route(&sg).is_none());
        let wc = h.engine.route(&MrtKey::wc(G1)).expect("(*,G)");
        assert_eq!(wc.oifs, VifSet::single(VIF_LAN2));
        h.engine.audit().expect("audit");
    }

    #[test]
    fn assert_overrides_leaf() {
        let mut h = harness("membership_assert");
        let key = h.engine.add_leaf(VIF_LAN, None, G1).expect("add leaf");
        h.engine.set_asserted(&key, VIF_LAN, 180).expect("assert");
        assert_eq!(h.engine.route(&key).map(|e| e.oifs), Some(VifSet::EMPTY));
        h.engine.clear_asserted(&key, VIF_LAN).expect("clear");
        assert_eq!(
            h.engine.route(&key).map(|e| e.oifs),
            Some(VifSet::single(VIF_LAN))
        );
    }

    #[test]
    fn register_vif_is_not_own_state() {
        let mut h = harness("membership_register_state");
        let key = h
            .engine
            .find_route(Some(S1), Some(G1), KindMask::SG, true)
            .expect("create")
            .expect("key");
        h.engine
            .update_ifs(&key, |ifs| ifs.joined.insert(VIF_REG))
            .expect("update");
        assert!(!h.engine.has_own_state(&key));
        h.engine
            .update_ifs(&key, |ifs| ifs.leaves.insert(VIF_LAN))
            .expect("update");
        assert!(h.engine.has_own_state(&key));
    }
}
