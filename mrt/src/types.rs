// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::cmp::Ordering;
use std::fmt;
use std::net::Ipv4Addr;
use std::ops::{BitAnd, BitOr, Sub};
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Maximum number of virtual interfaces, matching the width of the kernel's
/// multicast interface bitmap.
pub const MAX_VIFS: usize = 32;

/// A virtual interface index, `0..MAX_VIFS`.
pub type Vif = usize;

/// A set of virtual interfaces stored as a bitmap.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct VifSet(u32);

impl VifSet {
    pub const EMPTY: VifSet = VifSet(0);

    pub fn single(vif: Vif) -> Self {
        let mut s = Self::EMPTY;
        s.insert(vif);
        s
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn contains(&self, vif: Vif) -> bool {
        vif < MAX_VIFS && self.0 & (1 << vif) != 0
    }

    /// Add `vif` to the set. Indices outside `0..MAX_VIFS` are ignored.
    pub fn insert(&mut self, vif: Vif) {
        if vif < MAX_VIFS {
            self.0 |= 1 << vif;
        }
    }

    pub fn remove(&mut self, vif: Vif) {
        if vif < MAX_VIFS {
            self.0 &= !(1 << vif);
        }
    }

    pub fn union(self, other: VifSet) -> VifSet {
        VifSet(self.0 | other.0)
    }

    pub fn intersection(self, other: VifSet) -> VifSet {
        VifSet(self.0 & other.0)
    }

    pub fn difference(self, other: VifSet) -> VifSet {
        VifSet(self.0 & !other.0)
    }

    /// Iterate over member vifs in ascending index order.
    pub fn iter(&self) -> impl Iterator<Item = Vif> + '_ {
        (0..MAX_VIFS).filter(move |v| self.contains(*v))
    }
}

impl BitOr for VifSet {
    type Output = VifSet;
    fn bitor(self, rhs: VifSet) -> VifSet {
        self.union(rhs)
    }
}

impl BitAnd for VifSet {
    type Output = VifSet;
    fn bitand(self, rhs: VifSet) -> VifSet {
        self.intersection(rhs)
    }
}

impl Sub for VifSet {
    type Output = VifSet;
    fn sub(self, rhs: VifSet) -> VifSet {
        self.difference(rhs)
    }
}

impl FromIterator<Vif> for VifSet {
    fn from_iter<I: IntoIterator<Item = Vif>>(iter: I) -> Self {
        let mut s = VifSet::EMPTY;
        for v in iter {
            s.insert(v);
        }
        s
    }
}

impl fmt::Display for VifSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let vifs: Vec<String> = self.iter().map(|v| v.to_string()).collect();
        write!(f, "{{{}}}", vifs.join(","))
    }
}

impl fmt::Debug for VifSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VifSet{self}")
    }
}

/// An IPv4 prefix. Used both for advertised group ranges and for the
/// unicast subnets attached to interfaces.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, Eq, Hash, PartialEq)]
pub struct Prefix4 {
    pub value: Ipv4Addr,
    pub length: u8,
}

impl PartialOrd for Prefix4 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Prefix4 {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.value != other.value {
            return self.value.cmp(&other.value);
        }
        self.length.cmp(&other.length)
    }
}

impl Prefix4 {
    /// Create a new `Prefix4` with host bits zeroed.
    pub fn new(ip: Ipv4Addr, length: u8) -> Self {
        let length = length.min(32);
        let mut new = Self { value: ip, length };
        new.unset_host_bits();
        new
    }

    pub fn mask(&self) -> u32 {
        mask_from_len(self.length)
    }

    pub fn unset_host_bits(&mut self) {
        self.value = Ipv4Addr::from(u32::from(self.value) & self.mask());
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & self.mask() == u32::from(self.value)
    }
}

impl fmt::Display for Prefix4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.value, self.length)
    }
}

impl FromStr for Prefix4 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (value, length) =
            s.split_once('/').ok_or("malformed prefix".to_string())?;
        let value: Ipv4Addr =
            value.parse().map_err(|_| "malformed ip addr".to_string())?;
        let length: u8 =
            length.parse().map_err(|_| "malformed length".to_string())?;
        if length > 32 {
            return Err(format!("prefix length {length} exceeds 32"));
        }
        Ok(Self::new(value, length))
    }
}

/// Netmask with the `len` most significant bits set.
pub fn mask_from_len(len: u8) -> u32 {
    match len {
        0 => 0,
        l if l >= 32 => !0,
        l => (!0u32) << (32 - l),
    }
}

/// Groups in 224.0.0.0/24 are link-local and never routed.
pub fn is_routable_group(group: Ipv4Addr) -> bool {
    group.is_multicast() && !matches!(group.octets(), [224, 0, 0, _])
}

pub fn is_valid_source(source: Ipv4Addr) -> bool {
    !(source.is_unspecified()
        || source.is_multicast()
        || source.is_broadcast()
        || source.is_loopback())
}

/// Identifies a multicast routing entry.
///
/// The variant order makes a `BTreeMap<MrtKey, _>` list all (S,G) entries
/// by group and then source, followed by (*,G) and (*,*,RP) entries.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
    Deserialize,
)]
pub enum MrtKey {
    /// (S,G)
    SourceGroup { group: Ipv4Addr, source: Ipv4Addr },
    /// (*,G)
    Group { group: Ipv4Addr },
    /// (*,*,RP)
    Rp { rp: Ipv4Addr },
}

impl MrtKey {
    pub fn sg(source: Ipv4Addr, group: Ipv4Addr) -> Self {
        Self::SourceGroup { group, source }
    }

    pub fn wc(group: Ipv4Addr) -> Self {
        Self::Group { group }
    }

    pub fn rp(rp: Ipv4Addr) -> Self {
        Self::Rp { rp }
    }

    pub fn group(&self) -> Option<Ipv4Addr> {
        match self {
            Self::SourceGroup { group, .. } | Self::Group { group } => {
                Some(*group)
            }
            Self::Rp { .. } => None,
        }
    }

    pub fn source(&self) -> Option<Ipv4Addr> {
        match self {
            Self::SourceGroup { source, .. } => Some(*source),
            _ => None,
        }
    }

    pub fn kind_mask(&self) -> KindMask {
        match self {
            Self::SourceGroup { .. } => KindMask::SG,
            Self::Group { .. } => KindMask::WC,
            Self::Rp { .. } => KindMask::RP,
        }
    }
}

impl fmt::Display for MrtKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourceGroup { group, source } => {
                write!(f, "({source},{group})")
            }
            Self::Group { group } => write!(f, "(*,{group})"),
            Self::Rp { rp } => write!(f, "(*,*,{rp})"),
        }
    }
}

bitflags! {
    /// The route kinds a lookup may return.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct KindMask: u8 {
        const SG = 0b001;
        const WC = 0b010;
        const RP = 0b100;
    }
}

/// The edge class of an outgoing interface set change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OifTransition {
    /// Non-empty to empty.
    Deactivated,
    Unchanged,
    /// Empty to non-empty.
    Activated,
}

impl OifTransition {
    pub fn between(old: VifSet, new: VifSet) -> Self {
        match (old.is_empty(), new.is_empty()) {
            (true, false) => Self::Activated,
            (false, true) => Self::Deactivated,
            _ => Self::Unchanged,
        }
    }
}

impl From<OifTransition> for i8 {
    fn from(t: OifTransition) -> i8 {
        match t {
            OifTransition::Deactivated => -1,
            OifTransition::Unchanged => 0,
            OifTransition::Activated => 1,
        }
    }
}

/// The four interface bitmaps a route carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interfaces {
    /// Interfaces that received a PIM join.
    pub joined: VifSet,
    /// Interfaces that received a PIM prune.
    pub pruned: VifSet,
    /// Interfaces with directly attached members.
    pub leaves: VifSet,
    /// Interfaces on which this router lost an assert.
    pub asserted: VifSet,
}

impl Interfaces {
    /// Fold this route's contribution into an inherited oif set. Pruned
    /// overrides joined, leaves override pruned, asserted overrides all.
    pub fn apply(&self, inherited: VifSet) -> VifSet {
        (((inherited | self.joined) - self.pruned) | self.leaves)
            - self.asserted
    }

    pub fn remove_vif(&mut self, vif: Vif) {
        self.joined.remove(vif);
        self.pruned.remove(vif);
        self.leaves.remove(vif);
        self.asserted.remove(vif);
    }

    pub fn is_empty(&self) -> bool {
        self.joined.is_empty()
            && self.pruned.is_empty()
            && self.leaves.is_empty()
            && self.asserted.is_empty()
    }
}
