// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Outgoing interface computation and propagation.
//!
//! A route's outgoing interfaces are its own join, prune, leaf and assert
//! state folded over what it inherits. An (S,G) inherits from the (*,G) of
//! its group and from the (*,*,RP) of the group's RP, and a (*,G) inherits
//! from the (*,*,RP). A change to a coarser route therefore cascades to
//! every route below it, parent first.

use std::net::Ipv4Addr;

use crate::catalog::MrtEngine;
use crate::error::Error;
use crate::log::mrt_log;
use crate::types::{Interfaces, MrtKey, OifTransition, Vif, VifSet};

const LOG_UNIT: &str = "oifs";

impl MrtEngine {
    /// The routes `key` inherits from, coarsest first. Missing routes are
    /// included, they contribute nothing.
    fn inheritance(&self, key: &MrtKey) -> Vec<MrtKey> {
        match *key {
            MrtKey::Rp { .. } => Vec::new(),
            MrtKey::Group { .. } => {
                self.owner_rp(key).map(MrtKey::rp).into_iter().collect()
            }
            MrtKey::SourceGroup { group, .. } => {
                let mut chain: Vec<MrtKey> =
                    self.owner_rp(key).map(MrtKey::rp).into_iter().collect();
                chain.push(MrtKey::wc(group));
                chain
            }
        }
    }

    /// Compute the outgoing interfaces of `key` from its own state and the
    /// state it inherits. The incoming interface is not removed here.
    pub fn calc_oifs(&self, key: &MrtKey) -> VifSet {
        let Some(entry) = self.routes.get(key) else {
            return VifSet::EMPTY;
        };
        let inherited = self
            .inheritance(key)
            .iter()
            .filter_map(|k| self.routes.get(k))
            .fold(VifSet::EMPTY, |oifs, parent| parent.ifs.apply(oifs));
        entry.ifs.apply(inherited)
    }

    /// The routes whose oifs depend on `key`: for a (*,*,RP), the (*,G) of
    /// every group threaded through the RP, or that group's (S,G)s when it
    /// has no (*,G). For a (*,G), the (S,G)s of its group.
    pub(crate) fn dependents(&self, key: &MrtKey) -> Vec<MrtKey> {
        match *key {
            MrtKey::SourceGroup { .. } => Vec::new(),
            MrtKey::Group { group } => self.sg_keys(group),
            MrtKey::Rp { rp } => {
                let mut keys = Vec::new();
                for group in self.rpset.groups_of_rp(rp) {
                    let wc = MrtKey::wc(group);
                    if self.routes.contains_key(&wc) {
                        keys.push(wc);
                    } else {
                        keys.extend(self.sg_keys(group));
                    }
                }
                keys
            }
        }
    }

    fn sg_keys(&self, group: Ipv4Addr) -> Vec<MrtKey> {
        self.groups
            .get(&group)
            .map(|g| g.sources().map(|s| MrtKey::sg(s, group)).collect())
            .unwrap_or_default()
    }

    /// Re-evaluate a route with its current state.
    pub(crate) fn refresh_route(
        &mut self,
        key: &MrtKey,
    ) -> Result<OifTransition, Error> {
        let Some(e) = self.routes.get(key) else {
            return Ok(OifTransition::Unchanged);
        };
        let (iif, ifs) = (e.incoming, e.ifs);
        self.change_interfaces(key, iif, ifs, false)
    }

    /// Replace a route's incoming interface and interface state, recompute
    /// its oifs, and propagate the result to the kernel and to every route
    /// that inherits from it.
    ///
    /// The new incoming interface is removed from all four sets first. If
    /// neither the oifs nor the iif change and `force` is not set, nothing
    /// else happens, so repeating a call has no effect on the kernel.
    pub fn change_interfaces(
        &mut self,
        key: &MrtKey,
        iif: Option<Vif>,
        ifs: Interfaces,
        force: bool,
    ) -> Result<OifTransition, Error> {
        let mut ifs = ifs;
        if let Some(v) = iif {
            ifs.remove_vif(v);
        }

        let Some(entry) = self.routes.get_mut(key) else {
            return Err(Error::NotFound(key.to_string()));
        };
        let old_oifs = entry.oifs;
        let old_iif = entry.incoming;
        entry.incoming = iif;
        entry.ifs = ifs;

        let new_oifs = self.calc_oifs(key);
        let transition = OifTransition::between(old_oifs, new_oifs);
        if new_oifs == old_oifs && iif == old_iif && !force {
            return Ok(OifTransition::Unchanged);
        }

        let Some(entry) = self.routes.get_mut(key) else {
            return Err(Error::NotFound(key.to_string()));
        };
        entry.oifs = new_oifs;
        if transition != OifTransition::Unchanged || iif != old_iif || force {
            entry.jp_timer.fire();
        }
        // an rpt prune keeps its own holdtime on the entry timer
        if new_oifs.is_empty() && entry.ifs.pruned.is_empty() {
            entry.timer.fire();
        }
        let has_cache = entry.has_kernel_cache();

        mrt_log!(self, debug, "interfaces changed on {}", key;
            "iif" => format!("{iif:?}"),
            "oifs" => new_oifs.to_string(),
            "transition" => i8::from(transition)
        );

        match *key {
            MrtKey::Rp { rp } => {
                self.rpset.set_rp_incoming(rp, iif);
                if has_cache {
                    if new_oifs.is_empty() {
                        self.delete_mrtentry_all_kernel_cache(key);
                    } else {
                        self.sync_cache_chain(key);
                    }
                }
                self.cascade(key, iif, force)?;
            }
            MrtKey::Group { .. } => {
                if has_cache {
                    if new_oifs.is_empty() {
                        self.delete_mrtentry_all_kernel_cache(key);
                    } else {
                        self.sync_cache_chain(key);
                    }
                }
                self.cascade(key, iif, force)?;
            }
            MrtKey::SourceGroup { source, .. } => {
                // an empty set installs a negative entry
                if has_cache {
                    self.sync_cache_chain(key);
                }
                let source_iif =
                    self.sources.get(&source).and_then(|s| s.rpf.incoming);
                if iif != old_iif && iif.is_some() && iif == source_iif {
                    if let Some(spt) = self
                        .routes
                        .get_mut(key)
                        .and_then(|e| e.spt_state_mut())
                    {
                        spt.rp_bit = false;
                    }
                }
            }
        }

        Ok(transition)
    }

    /// Re-evaluate every route inheriting from `key`, which has already
    /// been committed. Shared-tree children take `iif`, the others keep
    /// their own. A child transition fires the parent's jp timer.
    fn cascade(
        &mut self,
        key: &MrtKey,
        iif: Option<Vif>,
        force: bool,
    ) -> Result<(), Error> {
        let mut child_changed = false;
        for child in self.dependents(key) {
            let Some(c) = self.routes.get(&child) else {
                continue;
            };
            let follows_parent = match child {
                MrtKey::Group { .. } => true,
                _ => c.rp_bit(),
            };
            let child_iif = if follows_parent { iif } else { c.incoming };
            let ifs = c.ifs;
            let t = self.change_interfaces(&child, child_iif, ifs, force)?;
            child_changed |= t != OifTransition::Unchanged;
        }
        if child_changed {
            if let Some(e) = self.routes.get_mut(key) {
                e.jp_timer.fire();
            }
        }
        Ok(())
    }
}
