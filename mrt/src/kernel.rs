// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel multicast forwarding cache synchronization.
//!
//! Every (source, group) pair the kernel forwards for is represented by a
//! [`KernelCacheEntry`] node owned by exactly one route. The node follows
//! the most specific route covering the traffic: when a finer route is
//! created the node moves to it, and it is re-installed with the new
//! owner's incoming interface and outgoing set.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::catalog::MrtEngine;
use crate::log::mrt_log;
use crate::types::{MrtKey, Vif, VifSet};

const LOG_UNIT: &str = "kernel";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("kernel rejected {0}")]
    Rejected(String),

    #[error("no cache entry for ({src},{group})")]
    NotInstalled { src: Ipv4Addr, group: Ipv4Addr },

    #[error("route has no incoming interface")]
    NoIncoming,

    #[error("transport error: {0}")]
    Transport(String),
}

/// Per (source, group) forwarding counters as reported by the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SgCount {
    pub packets: u64,
    pub bytes: u64,
    pub wrong_if: u64,
}

/// The kernel forwarding cache transport.
pub trait Kernel {
    /// Install or replace the forwarding entry for `source, group`. An empty
    /// `oifs` installs a negative entry that drops traffic without further
    /// upcalls.
    fn install(
        &self,
        source: Ipv4Addr,
        group: Ipv4Addr,
        iif: Vif,
        oifs: VifSet,
        rp: Option<Ipv4Addr>,
    ) -> Result<(), KernelError>;

    fn uninstall(
        &self,
        source: Ipv4Addr,
        group: Ipv4Addr,
    ) -> Result<(), KernelError>;

    fn query_counters(
        &self,
        source: Ipv4Addr,
        group: Ipv4Addr,
    ) -> Result<SgCount, KernelError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelCacheEntry {
    pub source: Ipv4Addr,
    pub group: Ipv4Addr,
    /// Counters as of the last aging pass.
    pub count: SgCount,
    /// Byte count at the last SPT rate sample.
    pub rate_bytes: u64,
    /// How long the packet count has not moved.
    pub idle: Duration,
}

impl KernelCacheEntry {
    pub fn new(source: Ipv4Addr, group: Ipv4Addr) -> Self {
        Self {
            source,
            group,
            count: SgCount::default(),
            rate_bytes: 0,
            idle: Duration::ZERO,
        }
    }
}

/// All (group, source) keys for one group.
fn group_range(
    group: Ipv4Addr,
) -> std::ops::RangeInclusive<(Ipv4Addr, Ipv4Addr)> {
    (group, Ipv4Addr::UNSPECIFIED)..=(group, Ipv4Addr::BROADCAST)
}

/// The kernel cache nodes owned by one route, ordered by (group, source).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheChain(BTreeMap<(Ipv4Addr, Ipv4Addr), KernelCacheEntry>);

impl CacheChain {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KernelCacheEntry> {
        self.0.values()
    }

    pub fn contains(&self, source: Ipv4Addr, group: Ipv4Addr) -> bool {
        self.0.contains_key(&(group, source))
    }

    pub fn get(
        &self,
        source: Ipv4Addr,
        group: Ipv4Addr,
    ) -> Option<&KernelCacheEntry> {
        self.0.get(&(group, source))
    }

    pub(crate) fn get_mut(
        &mut self,
        source: Ipv4Addr,
        group: Ipv4Addr,
    ) -> Option<&mut KernelCacheEntry> {
        self.0.get_mut(&(group, source))
    }

    /// (source, group) pairs in chain order.
    pub fn pairs(&self) -> Vec<(Ipv4Addr, Ipv4Addr)> {
        self.0.values().map(|e| (e.source, e.group)).collect()
    }

    pub(crate) fn insert(&mut self, entry: KernelCacheEntry) {
        self.0.insert((entry.group, entry.source), entry);
    }

    pub(crate) fn remove(
        &mut self,
        source: Ipv4Addr,
        group: Ipv4Addr,
    ) -> Option<KernelCacheEntry> {
        self.0.remove(&(group, source))
    }

    /// Take the node for one pair out of this chain.
    pub(crate) fn take_pair(
        &mut self,
        source: Ipv4Addr,
        group: Ipv4Addr,
    ) -> CacheChain {
        let mut taken = CacheChain::default();
        if let Some(e) = self.remove(source, group) {
            taken.insert(e);
        }
        taken
    }

    pub(crate) fn take_all(&mut self) -> CacheChain {
        std::mem::take(self)
    }

    /// Merge `other` into this chain.
    pub(crate) fn give(&mut self, other: CacheChain) {
        self.0.extend(other.0);
    }
}

impl MrtEngine {
    /// Add the kernel cache node for `source, group` to `key`'s chain and
    /// install it. A node owned by another route is moved rather than
    /// duplicated.
    pub fn add_kernel_cache(
        &mut self,
        key: &MrtKey,
        source: Ipv4Addr,
        group: Ipv4Addr,
    ) -> Result<(), crate::error::Error> {
        if !self.routes.contains_key(key) {
            return Err(crate::error::Error::NotFound(key.to_string()));
        }
        match self.cache_owner(source, group) {
            Some(owner) if owner == *key => {}
            Some(owner) => {
                let node = match self.routes.get_mut(&owner) {
                    Some(o) => o.cache.take_pair(source, group),
                    None => CacheChain::default(),
                };
                self.adopt(key, node, source, group);
            }
            None => {
                let mut node = CacheChain::default();
                node.insert(KernelCacheEntry::new(source, group));
                self.adopt(key, node, source, group);
            }
        }
        self.sync_cache_node(key, source, group);
        Ok(())
    }

    fn adopt(
        &mut self,
        key: &MrtKey,
        mut chain: CacheChain,
        source: Ipv4Addr,
        group: Ipv4Addr,
    ) {
        // a node lost from a stale owner is recreated fresh
        if chain.is_empty() {
            chain.insert(KernelCacheEntry::new(source, group));
        }
        if let Some(e) = self.routes.get_mut(key) {
            e.cache.give(chain);
            self.cache_owner.insert((group, source), *key);
        }
    }

    /// Remove one node from `key`'s chain and the kernel. Returns false if
    /// `key` does not own a node for the pair.
    pub fn delete_single_kernel_cache(
        &mut self,
        key: &MrtKey,
        source: Ipv4Addr,
        group: Ipv4Addr,
    ) -> bool {
        let removed = self
            .routes
            .get_mut(key)
            .and_then(|e| e.cache.remove(source, group));
        if removed.is_none() {
            return false;
        }
        self.cache_owner.remove(&(group, source));
        self.kernel_uninstall(source, group);
        true
    }

    /// Remove the node for `source, group` from whichever route owns it.
    pub fn delete_single_kernel_cache_addr(
        &mut self,
        source: Ipv4Addr,
        group: Ipv4Addr,
    ) -> bool {
        match self.cache_owner(source, group) {
            Some(owner) => {
                self.delete_single_kernel_cache(&owner, source, group)
            }
            None => false,
        }
    }

    /// Remove every node owned by `key` from the kernel.
    pub fn delete_mrtentry_all_kernel_cache(&mut self, key: &MrtKey) -> usize {
        let chain = match self.routes.get_mut(key) {
            Some(e) => e.cache.take_all(),
            None => return 0,
        };
        for (source, group) in chain.pairs() {
            self.cache_owner.remove(&(group, source));
            self.kernel_uninstall(source, group);
        }
        chain.len()
    }

    /// Move kernel cache nodes held by coarser routes to `key`: every
    /// (*,*,RP) node of the group for a (*,G), and the pair's node from the
    /// (*,G) or a (*,*,RP) for an (S,G). Moved nodes are re-installed with
    /// `key`'s state. Returns how many nodes moved.
    pub fn move_kernel_cache(&mut self, key: &MrtKey) -> usize {
        let pairs: Vec<(Ipv4Addr, Ipv4Addr)> = match *key {
            MrtKey::Rp { .. } => return 0,
            MrtKey::Group { group } => self
                .cache_owner
                .range(group_range(group))
                .filter(|(_, owner)| matches!(owner, MrtKey::Rp { .. }))
                .map(|((g, s), _)| (*s, *g))
                .collect(),
            MrtKey::SourceGroup { source, group } => {
                match self.cache_owner(source, group) {
                    Some(MrtKey::Group { .. }) | Some(MrtKey::Rp { .. }) => {
                        vec![(source, group)]
                    }
                    _ => Vec::new(),
                }
            }
        };

        for &(source, group) in &pairs {
            let Some(owner) = self.cache_owner(source, group) else {
                continue;
            };
            let node = match self.routes.get_mut(&owner) {
                Some(o) => o.cache.take_pair(source, group),
                None => continue,
            };
            self.adopt(key, node, source, group);
            mrt_log!(self, debug, "moved cache ({source},{group})";
                "from" => owner.to_string(),
                "to" => key.to_string()
            );
        }
        for &(source, group) in &pairs {
            self.sync_cache_node(key, source, group);
        }
        pairs.len()
    }

    /// Re-install every node `key` owns with its current state.
    pub(crate) fn sync_cache_chain(&mut self, key: &MrtKey) {
        let pairs = match self.routes.get(key) {
            Some(e) => e.cache.pairs(),
            None => return,
        };
        for (source, group) in pairs {
            self.sync_cache_node(key, source, group);
        }
    }

    /// Install one node with its owner's iif, oifs and RP. A node that
    /// cannot be installed is dropped, and traffic will upcall again.
    pub(crate) fn sync_cache_node(
        &mut self,
        key: &MrtKey,
        source: Ipv4Addr,
        group: Ipv4Addr,
    ) {
        let Some(entry) = self.routes.get(key) else {
            return;
        };
        let rp = self.owner_rp(key);
        let result = match entry.incoming {
            Some(iif) => {
                self.kernel.install(source, group, iif, entry.oifs, rp)
            }
            None => Err(KernelError::NoIncoming),
        };
        if let Err(e) = result {
            mrt_log!(self, error, "install failed: {e}";
                "route" => key.to_string(),
                "source" => source.to_string(),
                "group" => group.to_string()
            );
            if let Some(entry) = self.routes.get_mut(key) {
                entry.cache.remove(source, group);
            }
            self.cache_owner.remove(&(group, source));
            self.kernel_uninstall(source, group);
        }
    }

    fn kernel_uninstall(&self, source: Ipv4Addr, group: Ipv4Addr) {
        match self.kernel.uninstall(source, group) {
            Ok(()) | Err(KernelError::NotInstalled { .. }) => {}
            Err(e) => {
                mrt_log!(self, warn, "uninstall failed: {e}";
                    "source" => source.to_string(),
                    "group" => group.to_string()
                );
            }
        }
    }
}
