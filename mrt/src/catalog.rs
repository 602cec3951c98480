// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The multicast routing table catalog.
//!
//! Routes live in a single table keyed by [`MrtKey`]. Source and group
//! entries hold the chains that tie (S,G) routes together: a source's chain
//! is the set of groups it has (S,G) routes for, and a group's chain is the
//! set of sources. Both chains are updated by the same private functions so
//! a route is never linked into one and not the other.
//!
//! Source and group entries are created on demand by [`MrtEngine::find_route`]
//! and removed as soon as they no longer anchor any route.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use slog::Logger;

use crate::config::{EngineConfig, SptThreshold};
use crate::error::Error;
use crate::kernel::{CacheChain, Kernel};
use crate::log::mrt_log;
use crate::protocol::Protocol;
use crate::rpf::{RpfInfo, UnicastRib};
use crate::rpset::{RpGrpKey, RpSet};
use crate::timer::Timer;
use crate::types::{
    is_routable_group, is_valid_source, Interfaces, KindMask, MrtKey, Vif,
    VifSet,
};
use crate::vif::VifTable;

const LOG_UNIT: &str = "catalog";

/// Where traffic from an address comes from, as last resolved through the
/// unicast routing table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathInfo {
    pub incoming: Option<Vif>,
    pub upstream: Option<Ipv4Addr>,
    pub metric: u32,
    pub preference: u32,
}

impl From<Option<RpfInfo>> for PathInfo {
    fn from(rpf: Option<RpfInfo>) -> Self {
        match rpf {
            Some(r) => Self {
                incoming: Some(r.incoming),
                upstream: r.upstream,
                metric: r.metric,
                preference: r.preference,
            },
            None => Self::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub address: Ipv4Addr,
    pub rpf: PathInfo,
    pub(crate) groups: BTreeSet<Ipv4Addr>,
}

impl SourceEntry {
    fn new(address: Ipv4Addr, rpf: PathInfo) -> Self {
        Self {
            address,
            rpf,
            groups: BTreeSet::new(),
        }
    }

    /// Groups this source has (S,G) routes for, in address order.
    pub fn groups(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.groups.iter().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub address: Ipv4Addr,
    pub rp_address: Ipv4Addr,
    /// The RP-set edge this group is threaded through.
    pub active_rp_grp: Option<RpGrpKey>,
    pub(crate) sources: BTreeSet<Ipv4Addr>,
}

impl GroupEntry {
    fn new(address: Ipv4Addr, edge: RpGrpKey) -> Self {
        Self {
            address,
            rp_address: edge.rp,
            active_rp_grp: Some(edge),
            sources: BTreeSet::new(),
        }
    }

    /// Sources with (S,G) routes for this group, in address order.
    pub fn sources(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.sources.iter().copied()
    }
}

/// State only (S,G) routes carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SptState {
    /// Traffic is arriving on the shortest path tree.
    pub spt: bool,
    /// The entry is an (S,G)RPT entry: it follows the shared tree and only
    /// exists to carry prunes.
    pub rp_bit: bool,
    /// This router is the DR for the source and registers its traffic.
    pub register: bool,
    /// Register-suppression timer, armed by a register-stop.
    pub(crate) rs_timer: Timer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// (S,G)
    SourceSpecific(SptState),
    /// (*,G)
    WildcardGroup,
    /// (*,*,RP)
    WildcardAll,
}

#[derive(Debug, Clone)]
pub struct MrtEntry {
    pub kind: RouteKind,
    pub incoming: Option<Vif>,
    pub upstream: Option<Ipv4Addr>,
    pub metric: u32,
    pub preference: u32,
    pub ifs: Interfaces,
    /// Derived by `calc_oifs`, never written directly.
    pub oifs: VifSet,
    /// Set at creation, cleared once the protocol machinery has handled the
    /// route.
    pub new: bool,
    pub(crate) vif_timers: BTreeMap<Vif, Timer>,
    pub(crate) jp_timer: Timer,
    pub(crate) assert_timer: Timer,
    pub(crate) timer: Timer,
    pub(crate) cache: CacheChain,
}

impl MrtEntry {
    fn new(kind: RouteKind, path: PathInfo, cfg: &EngineConfig) -> Self {
        let mut e = Self {
            kind,
            incoming: path.incoming,
            upstream: None,
            metric: 0,
            preference: 0,
            ifs: Interfaces::default(),
            oifs: VifSet::EMPTY,
            new: true,
            vif_timers: BTreeMap::new(),
            jp_timer: Timer::armed(cfg.join_prune_period()),
            assert_timer: Timer::new(cfg.assert_timeout()),
            timer: Timer::armed(cfg.join_prune_holdtime()),
            cache: CacheChain::default(),
        };
        e.set_path(&path);
        e
    }

    /// Copy upstream neighbor, metric and preference. The incoming
    /// interface only changes through `change_interfaces`.
    pub(crate) fn set_path(&mut self, path: &PathInfo) {
        self.upstream = path.upstream;
        self.metric = path.metric;
        self.preference = path.preference;
    }

    pub fn spt_state(&self) -> Option<&SptState> {
        match &self.kind {
            RouteKind::SourceSpecific(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn spt_state_mut(&mut self) -> Option<&mut SptState> {
        match &mut self.kind {
            RouteKind::SourceSpecific(s) => Some(s),
            _ => None,
        }
    }

    pub fn rp_bit(&self) -> bool {
        self.spt_state().is_some_and(|s| s.rp_bit)
    }

    pub fn kernel_cache(&self) -> &CacheChain {
        &self.cache
    }

    pub fn has_kernel_cache(&self) -> bool {
        !self.cache.is_empty()
    }

    pub fn jp_timer(&self) -> &Timer {
        &self.jp_timer
    }

    pub fn assert_timer(&self) -> &Timer {
        &self.assert_timer
    }

    /// Entry expiry timer.
    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub fn vif_timer(&self, vif: Vif) -> Option<&Timer> {
        self.vif_timers.get(&vif)
    }
}

/// The multicast routing table engine.
///
/// Owns every catalog and talks to its collaborators through trait objects.
/// All entry points take `&mut self` and run to completion, cascades
/// included, before the next one starts.
pub struct MrtEngine {
    pub(crate) config: EngineConfig,
    pub(crate) vifs: VifTable,
    pub(crate) sources: BTreeMap<Ipv4Addr, SourceEntry>,
    pub(crate) groups: BTreeMap<Ipv4Addr, GroupEntry>,
    pub(crate) routes: BTreeMap<MrtKey, MrtEntry>,
    pub(crate) rpset: RpSet,
    /// Which route owns the kernel cache node for a (group, source) pair.
    pub(crate) cache_owner: BTreeMap<(Ipv4Addr, Ipv4Addr), MrtKey>,
    pub(crate) rate_timer: Timer,
    pub(crate) kernel: Arc<dyn Kernel>,
    pub(crate) rib: Arc<dyn UnicastRib>,
    pub(crate) protocol: Arc<dyn Protocol>,
    pub log: Logger,
}

impl MrtEngine {
    pub fn new(
        config: EngineConfig,
        vifs: VifTable,
        kernel: Arc<dyn Kernel>,
        rib: Arc<dyn UnicastRib>,
        protocol: Arc<dyn Protocol>,
        log: Logger,
    ) -> Self {
        let rate_timer = match config.spt_threshold {
            SptThreshold::Rate { interval, .. } => Timer::armed(
                std::time::Duration::from_secs(interval.into()),
            ),
            _ => Timer::default(),
        };
        Self {
            config,
            vifs,
            sources: BTreeMap::new(),
            groups: BTreeMap::new(),
            routes: BTreeMap::new(),
            rpset: RpSet::default(),
            cache_owner: BTreeMap::new(),
            rate_timer,
            kernel,
            rib,
            protocol,
            log,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn vifs(&self) -> &VifTable {
        &self.vifs
    }

    pub fn rpset(&self) -> &RpSet {
        &self.rpset
    }

    pub fn route(&self, key: &MrtKey) -> Option<&MrtEntry> {
        self.routes.get(key)
    }

    pub fn routes(&self) -> impl Iterator<Item = (&MrtKey, &MrtEntry)> {
        self.routes.iter()
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn source(&self, addr: Ipv4Addr) -> Option<&SourceEntry> {
        self.sources.get(&addr)
    }

    pub fn sources(&self) -> impl Iterator<Item = &SourceEntry> {
        self.sources.values()
    }

    pub fn group(&self, addr: Ipv4Addr) -> Option<&GroupEntry> {
        self.groups.get(&addr)
    }

    pub fn groups(&self) -> impl Iterator<Item = &GroupEntry> {
        self.groups.values()
    }

    /// The route owning the kernel cache node for `source, group`.
    pub fn cache_owner(
        &self,
        source: Ipv4Addr,
        group: Ipv4Addr,
    ) -> Option<MrtKey> {
        self.cache_owner.get(&(group, source)).copied()
    }

    /// The RP a group maps to: the one recorded in its group entry, or the
    /// RP-set's current choice when there is no entry.
    pub fn rp_for_group(&self, group: Ipv4Addr) -> Option<Ipv4Addr> {
        match self.groups.get(&group) {
            Some(g) => Some(g.rp_address),
            None => self.rpset.rp_grp_match(group).map(|k| k.rp),
        }
    }

    /// The RP whose address the kernel is given when installing for `key`.
    pub(crate) fn owner_rp(&self, key: &MrtKey) -> Option<Ipv4Addr> {
        match key {
            MrtKey::Rp { rp } => Some(*rp),
            MrtKey::SourceGroup { group, .. } | MrtKey::Group { group } => {
                self.groups.get(group).map(|g| g.rp_address)
            }
        }
    }

    /// True if `group` maps to an RP that is this router.
    pub fn is_local_rp_for(&self, group: Ipv4Addr) -> bool {
        match (self.config.local_rp_address, self.rp_for_group(group)) {
            (Some(local), Some(rp)) => local == rp,
            _ => false,
        }
    }

    /// Look up or create a route.
    ///
    /// Without `create`, returns the most specific existing route among the
    /// requested kinds, (S,G) before (*,G) before (*,*,RP). The (*,*,RP)
    /// candidate is the RP `group` maps to, or `source` taken as an RP
    /// address when no group is given.
    ///
    /// With `create`, the most specific requested kind is returned, created
    /// along with any missing source or group entry. On failure nothing
    /// created by the call is left behind.
    pub fn find_route(
        &mut self,
        source: Option<Ipv4Addr>,
        group: Option<Ipv4Addr>,
        kinds: KindMask,
        create: bool,
    ) -> Result<Option<MrtKey>, Error> {
        if let Some(g) = group {
            if !is_routable_group(g) {
                return Err(Error::InvalidAddress(format!(
                    "{g} is not a routable group"
                )));
            }
        }

        if !create {
            return Ok(self.lookup_route(source, group, kinds));
        }

        let key = if kinds.contains(KindMask::SG) {
            let (Some(s), Some(g)) = (source, group) else {
                return Err(Error::InvalidAddress(
                    "(S,G) route needs a source and a group".into(),
                ));
            };
            if !is_valid_source(s) {
                return Err(Error::InvalidAddress(format!(
                    "{s} is not a valid source"
                )));
            }
            self.create_sg(s, g)?
        } else if kinds.contains(KindMask::WC) {
            let Some(g) = group else {
                return Err(Error::InvalidAddress(
                    "(*,G) route needs a group".into(),
                ));
            };
            self.create_wc(g)?
        } else if kinds.contains(KindMask::RP) {
            let rp = match (group, source) {
                (Some(g), _) => self.rp_for_group(g).ok_or(Error::NoRp(g))?,
                (None, Some(rp)) => rp,
                (None, None) => {
                    return Err(Error::InvalidAddress(
                        "(*,*,RP) route needs an RP or a group".into(),
                    ))
                }
            };
            self.create_rp(rp)?
        } else {
            return Ok(None);
        };

        Ok(Some(key))
    }

    pub fn lookup_route(
        &self,
        source: Option<Ipv4Addr>,
        group: Option<Ipv4Addr>,
        kinds: KindMask,
    ) -> Option<MrtKey> {
        let Some(g) = group else {
            if !kinds.contains(KindMask::RP) {
                return None;
            }
            return source
                .map(MrtKey::rp)
                .filter(|k| self.routes.contains_key(k));
        };

        let mut candidates = Vec::with_capacity(3);
        if kinds.contains(KindMask::SG) {
            if let Some(s) = source {
                candidates.push(MrtKey::sg(s, g));
            }
        }
        if kinds.contains(KindMask::WC) {
            candidates.push(MrtKey::wc(g));
        }
        if kinds.contains(KindMask::RP) {
            if let Some(rp) = self.rp_for_group(g) {
                candidates.push(MrtKey::rp(rp));
            }
        }
        candidates.into_iter().find(|k| self.routes.contains_key(k))
    }

    fn check_capacity(&self) -> Result<(), Error> {
        if self.routes.len() >= self.config.max_routes {
            return Err(Error::AllocationFailure(format!(
                "route table full at {} routes",
                self.config.max_routes
            )));
        }
        Ok(())
    }

    /// Create the source entry if missing. Returns true if it was created.
    fn ensure_source(&mut self, source: Ipv4Addr) -> Result<bool, Error> {
        if self.sources.contains_key(&source) {
            return Ok(false);
        }
        let Some(rpf) = self.rib.resolve_rpf(source) else {
            return Err(Error::NoRoute(source));
        };
        self.sources
            .insert(source, SourceEntry::new(source, Some(rpf).into()));
        Ok(true)
    }

    /// Create the group entry if missing, threading it through the RP-set
    /// edge it maps to. Returns true if it was created.
    fn ensure_group(&mut self, group: Ipv4Addr) -> Result<bool, Error> {
        if self.groups.contains_key(&group) {
            return Ok(false);
        }
        let Some(edge) = self.rpset.rp_grp_match(group) else {
            return Err(Error::NoRp(group));
        };
        self.groups.insert(group, GroupEntry::new(group, edge));
        self.rpset.thread_group(&edge, group);
        Ok(true)
    }

    fn create_sg(
        &mut self,
        source: Ipv4Addr,
        group: Ipv4Addr,
    ) -> Result<MrtKey, Error> {
        let key = MrtKey::sg(source, group);
        if self.routes.contains_key(&key) {
            return Ok(key);
        }
        self.check_capacity()?;

        let new_source = self.ensure_source(source)?;
        if let Err(e) = self.ensure_group(group) {
            if new_source {
                self.sources.remove(&source);
            }
            return Err(e);
        }

        let path = self
            .sources
            .get(&source)
            .map(|s| s.rpf)
            .unwrap_or_default();
        let entry = MrtEntry::new(
            RouteKind::SourceSpecific(SptState::default()),
            path,
            &self.config,
        );
        self.routes.insert(key, entry);
        self.link_sg(source, group);
        self.finish_create(&key);
        Ok(key)
    }

    fn create_wc(&mut self, group: Ipv4Addr) -> Result<MrtKey, Error> {
        let key = MrtKey::wc(group);
        if self.routes.contains_key(&key) {
            return Ok(key);
        }
        self.check_capacity()?;

        let new_group = self.ensure_group(group)?;
        let rp = self.groups.get(&group).map(|g| g.rp_address);
        let Some(path) = rp.and_then(|rp| self.rpset.rp_path(rp)) else {
            if new_group {
                self.remove_group(group);
            }
            return Err(Error::NoRp(group));
        };

        let entry = MrtEntry::new(RouteKind::WildcardGroup, path, &self.config);
        self.routes.insert(key, entry);
        self.finish_create(&key);
        Ok(key)
    }

    fn create_rp(&mut self, rp: Ipv4Addr) -> Result<MrtKey, Error> {
        let key = MrtKey::rp(rp);
        if self.routes.contains_key(&key) {
            return Ok(key);
        }
        let Some(path) = self.rpset.rp_path(rp) else {
            return Err(Error::NotFound(format!("candidate rp {rp}")));
        };
        self.check_capacity()?;

        let entry = MrtEntry::new(RouteKind::WildcardAll, path, &self.config);
        self.routes.insert(key, entry);
        self.finish_create(&key);
        Ok(key)
    }

    fn finish_create(&mut self, key: &MrtKey) {
        let oifs = self.calc_oifs(key);
        if let Some(e) = self.routes.get_mut(key) {
            e.oifs = oifs;
        }
        let moved = self.move_kernel_cache(key);
        mrt_log!(self, info, "created route {}", key;
            "oifs" => oifs.to_string(),
            "moved_cache" => moved
        );
    }

    fn link_sg(&mut self, source: Ipv4Addr, group: Ipv4Addr) {
        if let Some(s) = self.sources.get_mut(&source) {
            s.groups.insert(group);
        }
        if let Some(g) = self.groups.get_mut(&group) {
            g.sources.insert(source);
        }
    }

    fn unlink_sg(&mut self, source: Ipv4Addr, group: Ipv4Addr) {
        if let Some(s) = self.sources.get_mut(&source) {
            s.groups.remove(&group);
        }
        if let Some(g) = self.groups.get_mut(&group) {
            g.sources.remove(&source);
        }
    }

    fn reclaim_source(&mut self, source: Ipv4Addr) {
        if self
            .sources
            .get(&source)
            .is_some_and(|s| s.groups.is_empty())
        {
            self.sources.remove(&source);
        }
    }

    fn reclaim_group(&mut self, group: Ipv4Addr) {
        let empty = self.groups.get(&group).is_some_and(|g| {
            g.sources.is_empty()
                && !self.routes.contains_key(&MrtKey::wc(group))
        });
        if empty {
            self.remove_group(group);
        }
    }

    /// Drop a group entry and unthread it from its RP-set edge.
    pub(crate) fn remove_group(&mut self, group: Ipv4Addr) {
        if let Some(g) = self.groups.remove(&group) {
            if let Some(edge) = g.active_rp_grp {
                self.rpset.unthread_group(&edge, group);
            }
        }
    }

    /// Delete a route along with its kernel cache. Source and group entries
    /// left without routes are deleted as well. Routes that inherited from
    /// the deleted one are recomputed. Returns false if there was no route.
    pub fn delete_mrtentry(&mut self, key: &MrtKey) -> bool {
        if !self.routes.contains_key(key) {
            return false;
        }
        self.delete_mrtentry_all_kernel_cache(key);
        let children = self.dependents(key);
        self.routes.remove(key);

        match *key {
            MrtKey::SourceGroup { source, group } => {
                self.unlink_sg(source, group);
                self.reclaim_source(source);
                self.reclaim_group(group);
            }
            MrtKey::Group { group } => self.reclaim_group(group),
            MrtKey::Rp { .. } => {}
        }
        mrt_log!(self, info, "deleted route {}", key);

        for child in children {
            if let Err(e) = self.refresh_route(&child) {
                mrt_log!(self, warn, "refresh after delete failed: {e}";
                    "route" => child.to_string()
                );
            }
        }
        true
    }

    /// Delete every route for `source`. The source entry goes with the
    /// last one.
    pub fn delete_source_entry(&mut self, source: Ipv4Addr) -> usize {
        let keys: Vec<MrtKey> = match self.sources.get(&source) {
            Some(s) => s.groups().map(|g| MrtKey::sg(source, g)).collect(),
            None => return 0,
        };
        keys.iter().filter(|k| self.delete_mrtentry(k)).count()
    }

    /// Delete every route for `group`, (S,G)s first, then the (*,G).
    pub fn delete_group_entry(&mut self, group: Ipv4Addr) -> usize {
        let mut keys: Vec<MrtKey> = match self.groups.get(&group) {
            Some(g) => g.sources().map(|s| MrtKey::sg(s, group)).collect(),
            None => return 0,
        };
        keys.push(MrtKey::wc(group));
        let n = keys.iter().filter(|k| self.delete_mrtentry(k)).count();
        self.remove_group(group);
        n
    }

    /// Delete every route along with its kernel cache.
    pub fn clear_routes(&mut self) -> usize {
        // key order puts (S,G) before (*,G) before (*,*,RP)
        let keys: Vec<MrtKey> = self.routes.keys().copied().collect();
        keys.iter().filter(|k| self.delete_mrtentry(k)).count()
    }

    /// Check that every chain, edge thread and cache owner record agrees
    /// with the route table.
    pub fn audit(&self) -> Result<(), Error> {
        let bad = |msg: String| Err(Error::Inconsistent(msg));

        for (key, entry) in &self.routes {
            match *key {
                MrtKey::SourceGroup { source, group } => {
                    if !self
                        .sources
                        .get(&source)
                        .is_some_and(|s| s.groups.contains(&group))
                    {
                        return bad(format!("{key} missing from source chain"));
                    }
                    if !self
                        .groups
                        .get(&group)
                        .is_some_and(|g| g.sources.contains(&source))
                    {
                        return bad(format!("{key} missing from group chain"));
                    }
                    if entry.spt_state().is_none() {
                        return bad(format!("{key} is not source specific"));
                    }
                }
                MrtKey::Group { group } => {
                    if !self.groups.contains_key(&group) {
                        return bad(format!("{key} has no group entry"));
                    }
                }
                MrtKey::Rp { rp } => {
                    if self.rpset.candidate(rp).is_none() {
                        return bad(format!("{key} has no candidate rp"));
                    }
                }
            }
            for node in entry.cache.iter() {
                if self.cache_owner(node.source, node.group) != Some(*key) {
                    return bad(format!(
                        "cache ({},{}) on {key} not owned by it",
                        node.source, node.group
                    ));
                }
            }
        }

        for (addr, s) in &self.sources {
            if s.groups.is_empty() {
                return bad(format!("source {addr} has an empty chain"));
            }
            for g in s.groups() {
                if !self.routes.contains_key(&MrtKey::sg(*addr, g)) {
                    return bad(format!("source {addr} links missing {g}"));
                }
            }
        }

        for (addr, g) in &self.groups {
            if g.sources.is_empty()
                && !self.routes.contains_key(&MrtKey::wc(*addr))
            {
                return bad(format!("group {addr} anchors no routes"));
            }
            for s in g.sources() {
                if !self.routes.contains_key(&MrtKey::sg(s, *addr)) {
                    return bad(format!("group {addr} links missing {s}"));
                }
            }
            let expected = self.rpset.rp_grp_match(*addr);
            if g.active_rp_grp != expected {
                return bad(format!(
                    "group {addr} threaded through {:?}, expected {:?}",
                    g.active_rp_grp, expected
                ));
            }
            match expected {
                Some(edge) if edge.rp == g.rp_address => {
                    if !self
                        .rpset
                        .edge(&edge)
                        .is_some_and(|e| e.groups.contains(addr))
                    {
                        return bad(format!("edge {edge} lacks group {addr}"));
                    }
                }
                _ => {
                    return bad(format!("group {addr} has a stale rp"));
                }
            }
        }

        for (key, edge) in self.rpset.edges() {
            for g in edge.groups() {
                if self.groups.get(&g).and_then(|e| e.active_rp_grp)
                    != Some(*key)
                {
                    return bad(format!("edge {key} threads stale group {g}"));
                }
            }
        }

        for ((group, source), owner) in &self.cache_owner {
            if !self
                .routes
                .get(owner)
                .is_some_and(|e| e.cache.contains(*source, *group))
            {
                return bad(format!(
                    "owner index points ({source},{group}) at {owner}"
                ));
            }
        }

        Ok(())
    }
}
