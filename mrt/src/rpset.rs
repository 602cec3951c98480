// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The RP-set: which rendezvous points serve which group ranges.
//!
//! The set is a bipartite graph. Candidate RPs sit on one side, advertised
//! group prefixes on the other, and each [`RpGrpEntry`] edge carries the
//! priority and holdtime of one RP serving one prefix. Every group entry in
//! the routing table is threaded through exactly the edge
//! [`RpSet::rp_grp_match`] picks for it, and is remapped whenever the graph
//! changes under it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::{MrtEngine, PathInfo};
use crate::error::Error;
use crate::log::mrt_log;
use crate::timer::Timer;
use crate::types::{is_valid_source, mask_from_len, MrtKey, Prefix4};

const LOG_UNIT: &str = "rpset";

const HASH_MULTIPLIER: u32 = 1_103_515_245;
const HASH_INCREMENT: u32 = 12_345;

/// Hash mask length used when none is advertised.
pub const DEFAULT_HASH_MASK_LEN: u8 = 30;

/// The PIM-SM group-to-RP hash. Wrapping 32-bit arithmetic, reduced
/// modulo 2^31.
pub fn rp_hash(group: Ipv4Addr, hash_mask: u32, rp: Ipv4Addr) -> u32 {
    let g = u32::from(group) & hash_mask;
    let inner = HASH_MULTIPLIER
        .wrapping_mul(g)
        .wrapping_add(HASH_INCREMENT)
        ^ u32::from(rp);
    HASH_MULTIPLIER
        .wrapping_mul(inner)
        .wrapping_add(HASH_INCREMENT)
        & 0x7fff_ffff
}

/// Identifies an RP-set edge.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
    Deserialize,
)]
pub struct RpGrpKey {
    pub prefix: Prefix4,
    pub rp: Ipv4Addr,
}

impl fmt::Display for RpGrpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} for {}", self.rp, self.prefix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpOrigin {
    /// Configured. Never ages out.
    Static,
    /// Learned from a bootstrap message. Expires with its holdtime.
    Bootstrap,
}

fn default_origin() -> RpOrigin {
    RpOrigin::Static
}

fn default_hash_mask_len() -> u8 {
    DEFAULT_HASH_MASK_LEN
}

/// An RP-set advertisement, as configured or as received from the BSR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpGrpSpec {
    pub rp: Ipv4Addr,
    pub prefix: Prefix4,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub holdtime: u16,
    #[serde(default = "default_hash_mask_len")]
    pub hash_mask_len: u8,
    #[serde(default)]
    pub fragment_tag: u16,
    #[serde(default = "default_origin")]
    pub origin: RpOrigin,
}

/// The routing state of an RP address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpEntry {
    pub address: Ipv4Addr,
    pub rpf: PathInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandRp {
    pub rpentry: RpEntry,
    pub(crate) prefixes: BTreeSet<Prefix4>,
}

impl CandRp {
    pub fn prefixes(&self) -> impl Iterator<Item = Prefix4> + '_ {
        self.prefixes.iter().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMask {
    pub prefix: Prefix4,
    pub hash_mask: u32,
    /// (priority, rp), so iteration runs from most to least preferred.
    pub(crate) rps: BTreeSet<(u8, Ipv4Addr)>,
}

impl GroupMask {
    pub fn rps(&self) -> impl Iterator<Item = (u8, Ipv4Addr)> + '_ {
        self.rps.iter().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpGrpEntry {
    pub key: RpGrpKey,
    /// Lower is preferred.
    pub priority: u8,
    pub holdtime: u16,
    pub fragment_tag: u16,
    pub origin: RpOrigin,
    pub(crate) expiry: Timer,
    pub(crate) groups: BTreeSet<Ipv4Addr>,
}

impl RpGrpEntry {
    fn new(key: RpGrpKey, spec: &RpGrpSpec) -> Self {
        let mut e = Self {
            key,
            priority: spec.priority,
            holdtime: 0,
            fragment_tag: 0,
            origin: spec.origin,
            expiry: Timer::default(),
            groups: BTreeSet::new(),
        };
        e.refresh(spec);
        e
    }

    fn refresh(&mut self, spec: &RpGrpSpec) {
        self.holdtime = spec.holdtime;
        self.fragment_tag = spec.fragment_tag;
        self.origin = spec.origin;
        match spec.origin {
            RpOrigin::Static => self.expiry.disable(),
            RpOrigin::Bootstrap => self
                .expiry
                .arm(Duration::from_secs(spec.holdtime.into())),
        }
    }

    /// Groups currently threaded through this edge.
    pub fn groups(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.groups.iter().copied()
    }

    pub fn expiry(&self) -> &Timer {
        &self.expiry
    }
}

#[derive(Debug, Clone, Default)]
pub struct RpSet {
    rps: BTreeMap<Ipv4Addr, CandRp>,
    masks: BTreeMap<Prefix4, GroupMask>,
    edges: BTreeMap<RpGrpKey, RpGrpEntry>,
}

impl RpSet {
    pub fn candidate(&self, rp: Ipv4Addr) -> Option<&CandRp> {
        self.rps.get(&rp)
    }

    pub fn candidates(&self) -> impl Iterator<Item = &CandRp> {
        self.rps.values()
    }

    pub fn mask(&self, prefix: &Prefix4) -> Option<&GroupMask> {
        self.masks.get(prefix)
    }

    pub fn masks(&self) -> impl Iterator<Item = &GroupMask> {
        self.masks.values()
    }

    pub fn edge(&self, key: &RpGrpKey) -> Option<&RpGrpEntry> {
        self.edges.get(key)
    }

    pub fn edges(&self) -> impl Iterator<Item = (&RpGrpKey, &RpGrpEntry)> {
        self.edges.iter()
    }

    pub(crate) fn edges_mut(
        &mut self,
    ) -> impl Iterator<Item = (&RpGrpKey, &mut RpGrpEntry)> {
        self.edges.iter_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn rp_path(&self, rp: Ipv4Addr) -> Option<PathInfo> {
        self.rps.get(&rp).map(|c| c.rpentry.rpf)
    }

    /// Update the path toward `rp`. Returns true if it changed.
    pub(crate) fn set_rp_path(&mut self, rp: Ipv4Addr, path: PathInfo) -> bool {
        match self.rps.get_mut(&rp) {
            Some(c) if c.rpentry.rpf != path => {
                c.rpentry.rpf = path;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn set_rp_incoming(
        &mut self,
        rp: Ipv4Addr,
        incoming: Option<crate::types::Vif>,
    ) {
        if let Some(c) = self.rps.get_mut(&rp) {
            c.rpentry.rpf.incoming = incoming;
        }
    }

    /// Select the edge serving `group`: among all prefixes containing the
    /// group, the lowest priority, then the highest hash, then the highest
    /// RP address.
    pub fn rp_grp_match(&self, group: Ipv4Addr) -> Option<RpGrpKey> {
        let mut best: Option<(u8, u32, RpGrpKey)> = None;
        for (prefix, mask) in &self.masks {
            if !prefix.contains(group) {
                continue;
            }
            for &(priority, rp) in &mask.rps {
                if best.is_some_and(|(bp, _, _)| priority > bp) {
                    break;
                }
                let hash = rp_hash(group, mask.hash_mask, rp);
                let better = match best {
                    None => true,
                    Some((bp, bh, bk)) => {
                        priority < bp
                            || (priority == bp
                                && (hash > bh || (hash == bh && rp > bk.rp)))
                    }
                };
                if better {
                    best = Some((priority, hash, RpGrpKey {
                        prefix: *prefix,
                        rp,
                    }));
                }
            }
        }
        best.map(|(_, _, key)| key)
    }

    /// Groups threaded through any edge of `rp`.
    pub fn groups_of_rp(&self, rp: Ipv4Addr) -> Vec<Ipv4Addr> {
        let Some(cand) = self.rps.get(&rp) else {
            return Vec::new();
        };
        let mut groups = BTreeSet::new();
        for prefix in &cand.prefixes {
            if let Some(e) = self.edges.get(&RpGrpKey { prefix: *prefix, rp })
            {
                groups.extend(e.groups.iter().copied());
            }
        }
        groups.into_iter().collect()
    }

    pub(crate) fn thread_group(&mut self, key: &RpGrpKey, group: Ipv4Addr) {
        if let Some(e) = self.edges.get_mut(key) {
            e.groups.insert(group);
        }
    }

    pub(crate) fn unthread_group(&mut self, key: &RpGrpKey, group: Ipv4Addr) {
        if let Some(e) = self.edges.get_mut(key) {
            e.groups.remove(&group);
        }
    }

    /// Insert or refresh an edge along with its candidate RP and mask.
    /// `path` is only used when the candidate RP is new.
    fn upsert(&mut self, spec: &RpGrpSpec, path: PathInfo) -> RpGrpKey {
        let key = RpGrpKey {
            prefix: Prefix4::new(spec.prefix.value, spec.prefix.length),
            rp: spec.rp,
        };

        let cand = self.rps.entry(spec.rp).or_insert_with(|| CandRp {
            rpentry: RpEntry {
                address: spec.rp,
                rpf: path,
            },
            prefixes: BTreeSet::new(),
        });
        cand.prefixes.insert(key.prefix);

        let mask = self.masks.entry(key.prefix).or_insert_with(|| GroupMask {
            prefix: key.prefix,
            hash_mask: 0,
            rps: BTreeSet::new(),
        });
        mask.hash_mask = mask_from_len(spec.hash_mask_len);

        match self.edges.get_mut(&key) {
            Some(edge) => {
                if edge.priority != spec.priority {
                    mask.rps.remove(&(edge.priority, spec.rp));
                    mask.rps.insert((spec.priority, spec.rp));
                    edge.priority = spec.priority;
                }
                edge.refresh(spec);
            }
            None => {
                mask.rps.insert((spec.priority, spec.rp));
                self.edges.insert(key, RpGrpEntry::new(key, spec));
            }
        }
        key
    }

    /// Remove an edge, along with its mask and candidate RP if they have
    /// no edges left. The flag is true if the candidate RP went away.
    fn remove_edge(&mut self, key: &RpGrpKey) -> Option<(RpGrpEntry, bool)> {
        let edge = self.edges.remove(key)?;
        if let Some(mask) = self.masks.get_mut(&key.prefix) {
            mask.rps.remove(&(edge.priority, key.rp));
            if mask.rps.is_empty() {
                self.masks.remove(&key.prefix);
            }
        }
        let mut rp_gone = false;
        if let Some(c) = self.rps.get_mut(&key.rp) {
            c.prefixes.remove(&key.prefix);
            if c.prefixes.is_empty() {
                self.rps.remove(&key.rp);
                rp_gone = true;
            }
        }
        Some((edge, rp_gone))
    }
}

impl MrtEngine {
    pub fn rp_grp_match(&self, group: Ipv4Addr) -> Option<RpGrpKey> {
        self.rpset.rp_grp_match(group)
    }

    /// Add or refresh an RP-set edge and remap every group it covers.
    pub fn add_rp_grp_entry(
        &mut self,
        spec: &RpGrpSpec,
    ) -> Result<RpGrpKey, Error> {
        if !spec.prefix.value.is_multicast() {
            return Err(Error::InvalidAddress(format!(
                "{} is not a multicast prefix",
                spec.prefix
            )));
        }
        if !is_valid_source(spec.rp) {
            return Err(Error::InvalidAddress(format!(
                "{} is not a valid rp address",
                spec.rp
            )));
        }

        let path = PathInfo::from(self.rib.resolve_rpf(spec.rp));
        if path.incoming.is_none() && self.rpset.candidate(spec.rp).is_none() {
            mrt_log!(self, warn, "no unicast route to rp {}", spec.rp);
        }
        let key = self.rpset.upsert(spec, path);
        mrt_log!(self, info, "rp-set edge {key}";
            "priority" => spec.priority,
            "holdtime" => spec.holdtime,
            "origin" => format!("{:?}", spec.origin)
        );

        let covered: Vec<Ipv4Addr> = self
            .groups
            .keys()
            .filter(|g| key.prefix.contains(**g))
            .copied()
            .collect();
        for group in covered {
            self.remap_grpentry(group)?;
        }
        Ok(key)
    }

    /// Remove an RP-set edge. Groups threaded through it are remapped, or
    /// deleted when no RP is left for them. A candidate RP left without
    /// edges is deleted with its (*,*,RP) route. Returns false if there was
    /// no such edge.
    pub fn delete_rp_grp_entry(
        &mut self,
        rp: Ipv4Addr,
        prefix: Prefix4,
    ) -> Result<bool, Error> {
        let key = RpGrpKey {
            prefix: Prefix4::new(prefix.value, prefix.length),
            rp,
        };
        let Some((edge, rp_gone)) = self.rpset.remove_edge(&key) else {
            return Ok(false);
        };
        mrt_log!(self, info, "removed rp-set edge {key}";
            "groups" => edge.groups.len()
        );

        for group in edge.groups() {
            if self.groups.contains_key(&group) {
                self.remap_grpentry(group)?;
            }
        }
        if rp_gone {
            self.delete_mrtentry(&MrtKey::rp(rp));
        }
        Ok(true)
    }

    /// Remove every edge for a group prefix.
    pub fn delete_grp_mask(&mut self, prefix: Prefix4) -> Result<usize, Error> {
        let rps: Vec<Ipv4Addr> = match self.rpset.mask(&prefix) {
            Some(m) => m.rps().map(|(_, rp)| rp).collect(),
            None => return Ok(0),
        };
        let mut n = 0;
        for rp in rps {
            if self.delete_rp_grp_entry(rp, prefix)? {
                n += 1;
            }
        }
        Ok(n)
    }

    /// Remove every edge of a candidate RP.
    pub fn delete_rp(&mut self, rp: Ipv4Addr) -> Result<usize, Error> {
        let prefixes: Vec<Prefix4> = match self.rpset.candidate(rp) {
            Some(c) => c.prefixes().collect(),
            None => return Ok(0),
        };
        let mut n = 0;
        for prefix in prefixes {
            if self.delete_rp_grp_entry(rp, prefix)? {
                n += 1;
            }
        }
        Ok(n)
    }

    pub fn clear_rp_set(&mut self) -> Result<usize, Error> {
        let keys: Vec<RpGrpKey> = self.rpset.edges().map(|(k, _)| *k).collect();
        self.delete_edges(keys)
    }

    /// Remove bootstrap-learned edges carrying fragment tag `tag`.
    pub fn delete_rp_set_fragment(&mut self, tag: u16) -> Result<usize, Error> {
        let keys: Vec<RpGrpKey> = self
            .rpset
            .edges()
            .filter(|(_, e)| {
                e.origin == RpOrigin::Bootstrap && e.fragment_tag == tag
            })
            .map(|(k, _)| *k)
            .collect();
        self.delete_edges(keys)
    }

    pub(crate) fn delete_edges(
        &mut self,
        keys: Vec<RpGrpKey>,
    ) -> Result<usize, Error> {
        let mut n = 0;
        for k in keys {
            if self.delete_rp_grp_entry(k.rp, k.prefix)? {
                n += 1;
            }
        }
        Ok(n)
    }

    /// Re-run the RP match for a group. A group no RP maps to is deleted
    /// with all of its routes and `false` is returned. A group whose RP
    /// changed has the new RP's path pushed into its shared tree routes.
    pub fn remap_grpentry(&mut self, group: Ipv4Addr) -> Result<bool, Error> {
        let Some(entry) = self.groups.get(&group) else {
            return Err(Error::NotFound(format!("group {group}")));
        };
        let old = entry.active_rp_grp;
        let old_rp = entry.rp_address;

        let Some(new) = self.rpset.rp_grp_match(group) else {
            mrt_log!(self, warn, "no rp left for group {group}, deleting");
            self.delete_group_entry(group);
            return Ok(false);
        };
        if old == Some(new) {
            return Ok(true);
        }

        if let Some(old) = old {
            self.rpset.unthread_group(&old, group);
        }
        self.rpset.thread_group(&new, group);
        if let Some(e) = self.groups.get_mut(&group) {
            e.active_rp_grp = Some(new);
            e.rp_address = new.rp;
        }

        if new.rp != old_rp {
            mrt_log!(self, info, "group {group} moved to rp {}", new.rp;
                "previous" => old_rp.to_string()
            );
            self.rehome_group_cache(group, old_rp);
            self.refresh_group_from_rp(group, true)?;
        }
        Ok(true)
    }

    /// Hand the group's kernel cache nodes held by the old RP's (*,*,RP)
    /// to the most specific route now covering them, or uninstall them if
    /// there is none.
    fn rehome_group_cache(&mut self, group: Ipv4Addr, old_rp: Ipv4Addr) {
        let old_key = MrtKey::rp(old_rp);
        let pairs: Vec<(Ipv4Addr, Ipv4Addr)> = self
            .routes
            .get(&old_key)
            .map(|e| {
                e.cache
                    .pairs()
                    .into_iter()
                    .filter(|(_, g)| *g == group)
                    .collect()
            })
            .unwrap_or_default();

        for (source, group) in pairs {
            let target = [
                MrtKey::sg(source, group),
                MrtKey::wc(group),
                self.owner_rp(&MrtKey::wc(group))
                    .map(MrtKey::rp)
                    .unwrap_or(old_key),
            ]
            .into_iter()
            .find(|k| *k != old_key && self.routes.contains_key(k));

            match target {
                Some(t) => {
                    if let Err(e) = self.add_kernel_cache(&t, source, group) {
                        mrt_log!(self, warn, "rehome cache failed: {e}";
                            "route" => t.to_string()
                        );
                    }
                }
                None => {
                    self.delete_single_kernel_cache(&old_key, source, group);
                }
            }
        }
    }

    /// Push the group's RP path into its (*,G) and RP-bit (S,G)s, then
    /// re-evaluate them. With `force`, kernel cache is re-installed even if
    /// nothing changed so the kernel learns a new RP address.
    pub(crate) fn refresh_group_from_rp(
        &mut self,
        group: Ipv4Addr,
        force: bool,
    ) -> Result<(), Error> {
        let Some(rp) = self.groups.get(&group).map(|g| g.rp_address) else {
            return Ok(());
        };
        let path = self.rpset.rp_path(rp).unwrap_or_default();
        let sources: Vec<Ipv4Addr> = self
            .groups
            .get(&group)
            .map(|g| g.sources().collect())
            .unwrap_or_default();

        for s in &sources {
            if let Some(e) = self.routes.get_mut(&MrtKey::sg(*s, group)) {
                if e.rp_bit() {
                    e.set_path(&path);
                }
            }
        }

        let wc = MrtKey::wc(group);
        if let Some(e) = self.routes.get_mut(&wc) {
            e.set_path(&path);
            let ifs = e.ifs;
            self.change_interfaces(&wc, path.incoming, ifs, force)?;
            return Ok(());
        }

        for s in sources {
            let key = MrtKey::sg(s, group);
            let Some(e) = self.routes.get(&key) else {
                continue;
            };
            let iif = if e.rp_bit() { path.incoming } else { e.incoming };
            let ifs = e.ifs;
            self.change_interfaces(&key, iif, ifs, force)?;
        }
        Ok(())
    }
}
