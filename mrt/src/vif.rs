// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The virtual interface table.

use std::net::Ipv4Addr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::{Prefix4, Vif, MAX_VIFS};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VifFlags: u8 {
        /// This router is the designated router on the attached subnet.
        const DR = 0b001;
        /// The pseudo interface used for register encapsulation.
        const REGISTER = 0b010;
        const DISABLED = 0b100;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VifEntry {
    pub index: Vif,
    pub name: String,
    pub address: Ipv4Addr,
    pub subnet: Prefix4,
    pub flags: VifFlags,
}

/// Interface configuration as it appears in the daemon config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VifConfig {
    pub name: String,
    pub address: Ipv4Addr,
    pub subnet: Prefix4,
    #[serde(default)]
    pub dr: bool,
    #[serde(default)]
    pub register: bool,
    #[serde(default)]
    pub disabled: bool,
}

impl VifConfig {
    fn flags(&self) -> VifFlags {
        let mut flags = VifFlags::empty();
        flags.set(VifFlags::DR, self.dr);
        flags.set(VifFlags::REGISTER, self.register);
        flags.set(VifFlags::DISABLED, self.disabled);
        flags
    }
}

#[derive(Debug, Clone, Default)]
pub struct VifTable {
    vifs: Vec<VifEntry>,
}

impl VifTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(cfg: &[VifConfig]) -> Result<Self, Error> {
        let mut table = Self::new();
        for v in cfg {
            table.add(&v.name, v.address, v.subnet, v.flags())?;
        }
        Ok(table)
    }

    /// Add an interface, returning the vif index it was assigned.
    pub fn add(
        &mut self,
        name: &str,
        address: Ipv4Addr,
        subnet: Prefix4,
        flags: VifFlags,
    ) -> Result<Vif, Error> {
        let index = self.vifs.len();
        if index >= MAX_VIFS {
            return Err(Error::InvalidVif(index));
        }
        if flags.contains(VifFlags::REGISTER) && self.register_vif().is_some()
        {
            return Err(Error::InvalidAddress(format!(
                "{name}: only one register vif is allowed"
            )));
        }
        self.vifs.push(VifEntry {
            index,
            name: name.to_string(),
            address,
            subnet,
            flags,
        });
        Ok(index)
    }

    pub fn get(&self, vif: Vif) -> Option<&VifEntry> {
        self.vifs.get(vif)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VifEntry> {
        self.vifs.iter()
    }

    pub fn len(&self) -> usize {
        self.vifs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vifs.is_empty()
    }

    /// True if `vif` exists and is not disabled.
    pub fn is_usable(&self, vif: Vif) -> bool {
        self.get(vif)
            .is_some_and(|v| !v.flags.contains(VifFlags::DISABLED))
    }

    pub fn is_dr(&self, vif: Vif) -> bool {
        self.get(vif).is_some_and(|v| v.flags.contains(VifFlags::DR))
    }

    pub fn is_register(&self, vif: Vif) -> bool {
        self.get(vif)
            .is_some_and(|v| v.flags.contains(VifFlags::REGISTER))
    }

    pub fn register_vif(&self) -> Option<Vif> {
        self.vifs
            .iter()
            .find(|v| v.flags.contains(VifFlags::REGISTER))
            .map(|v| v.index)
    }

    /// The vif whose subnet contains `addr`, if `addr` is directly
    /// attached. The register vif is never a match.
    pub fn find_vif_direct_local(&self, addr: Ipv4Addr) -> Option<Vif> {
        self.vifs
            .iter()
            .filter(|v| {
                !v.flags.intersects(VifFlags::REGISTER | VifFlags::DISABLED)
            })
            .find(|v| v.subnet.contains(addr))
            .map(|v| v.index)
    }

    pub fn is_local_address(&self, addr: Ipv4Addr) -> bool {
        self.vifs.iter().any(|v| v.address == addr)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pim_common::{cidr, ip};

    #[test]
    fn direct_local_lookup() {
        let mut t = VifTable::new();
        let reg = t
            .add(
                "pimreg",
                ip!("0.0.0.0"),
                cidr!("0.0.0.0/32"),
                VifFlags::REGISTER,
            )
            .expect("add register vif");
        let lan = t
            .add("lan0", ip!("10.0.3.1"), cidr!("10.0.3.0/24"), VifFlags::DR)
            .expect("add lan vif");
        let off = t
            .add(
                "lan1",
                ip!("10.0.4.1"),
                cidr!("10.0.4.0/24"),
                VifFlags::DISABLED,
            )
            .expect("add disabled vif");

        assert_eq!(t.register_vif(), Some(reg));
        assert_eq!(t.find_vif_direct_local(ip!("10.0.3.77")), Some(lan));
        assert_eq!(t.find_vif_direct_local(ip!("10.0.4.77")), None);
        assert!(t.is_dr(lan));
        assert!(!t.is_usable(off));
        assert!(t.is_local_address(ip!("10.0.3.1")));

        assert!(t
            .add(
                "pimreg2",
                ip!("0.0.0.0"),
                cidr!("0.0.0.0/32"),
                VifFlags::REGISTER,
            )
            .is_err());
    }

    #[test]
    fn table_full() {
        let mut t = VifTable::new();
        let subnet: Prefix4 = cidr!("10.0.0.0/24");
        let addr: Ipv4Addr = ip!("10.0.0.1");
        for i in 0..MAX_VIFS {
            t.add(&format!("v{i}"), addr, subnet, VifFlags::empty())
                .expect("add vif");
        }
        let full = t.add("one-too-many", addr, subnet, VifFlags::empty());
        assert_eq!(full, Err(Error::InvalidVif(MAX_VIFS)));
    }
}
