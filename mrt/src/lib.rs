// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The PIM-SM multicast routing table.
//!
//! [`MrtEngine`] keeps (S,G), (*,G) and (*,*,RP) routes together with the
//! source and group entries that anchor them, computes outgoing interfaces
//! through the route hierarchy, maps groups to RPs and keeps the kernel
//! forwarding cache in step with the table. The kernel, the unicast routing
//! table and the PIM protocol machinery are reached through the [`Kernel`],
//! [`UnicastRib`] and [`Protocol`] traits.

pub mod age;
pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod kernel;
pub mod log;
pub mod membership;
pub mod oifs;
pub mod protocol;
pub mod rpf;
pub mod rpset;
pub mod timer;
pub mod types;
pub mod upcall;
pub mod vif;

pub use catalog::MrtEngine;
pub use config::{EngineConfig, SptThreshold};
pub use dispatch::{Dispatcher, Event};
pub use error::Error;
pub use kernel::{Kernel, KernelError, SgCount};
pub use protocol::Protocol;
pub use rpf::{RpfInfo, StaticRib, StaticRoute, UnicastRib};
pub use rpset::{RpGrpKey, RpGrpSpec, RpOrigin};
pub use types::*;
pub use vif::{VifConfig, VifTable};

#[cfg(test)]
mod proptest;


pub const COMPONENT_MRT: &str = "mrt";
pub const MOD_ENGINE: &str = "engine";
