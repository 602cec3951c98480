// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory forwarding cache standing in for the kernel multicast
//! routing socket. Every change is logged so the engine's decisions can be
//! followed from the daemon log.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use mrt::{Kernel, KernelError, SgCount, Vif, VifSet};
use pim_common::lock;
use slog::Logger;

use crate::log::klog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MfcEntry {
    pub iif: Vif,
    pub oifs: VifSet,
    pub rp: Option<Ipv4Addr>,
    pub count: SgCount,
}

pub struct MemoryKernel {
    mfc: Mutex<BTreeMap<(Ipv4Addr, Ipv4Addr), MfcEntry>>,
    log: Logger,
}

impl MemoryKernel {
    pub fn new(log: Logger) -> Self {
        Self {
            mfc: Mutex::new(BTreeMap::new()),
            log,
        }
    }

    /// Installed entries in (source, group) order.
    pub fn entries(&self) -> Vec<(Ipv4Addr, Ipv4Addr, MfcEntry)> {
        lock!(self.mfc)
            .iter()
            .map(|((s, g), e)| (*s, *g, *e))
            .collect()
    }
}

impl Kernel for MemoryKernel {
    fn install(
        &self,
        source: Ipv4Addr,
        group: Ipv4Addr,
        iif: Vif,
        oifs: VifSet,
        rp: Option<Ipv4Addr>,
    ) -> Result<(), KernelError> {
        let mut mfc = lock!(self.mfc);
        let count = mfc
            .get(&(source, group))
            .map(|e| e.count)
            .unwrap_or_default();
        mfc.insert(
            (source, group),
            MfcEntry {
                iif,
                oifs,
                rp,
                count,
            },
        );
        klog!(self.log, debug, "install ({source},{group})";
            "iif" => iif,
            "oifs" => oifs.to_string(),
            "rp" => format!("{rp:?}")
        );
        Ok(())
    }

    fn uninstall(
        &self,
        source: Ipv4Addr,
        group: Ipv4Addr,
    ) -> Result<(), KernelError> {
        match lock!(self.mfc).remove(&(source, group)) {
            Some(_) => {
                klog!(self.log, debug, "uninstall";
                    "source" => source.to_string(),
                    "group" => group.to_string()
                );
                Ok(())
            }
            None => Err(KernelError::NotInstalled { src: source, group }),
        }
    }

    fn query_counters(
        &self,
        source: Ipv4Addr,
        group: Ipv4Addr,
    ) -> Result<SgCount, KernelError> {
        lock!(self.mfc)
            .get(&(source, group))
            .map(|e| e.count)
            .ok_or(KernelError::NotInstalled { src: source, group })
    }
}
