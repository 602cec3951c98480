// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::Ipv4Addr;

use crate::types::Vif;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("allocation failure: {0}")]
    AllocationFailure(String),

    #[error("no unicast route to {0}")]
    NoRoute(Ipv4Addr),

    #[error("no rp for group {0}")]
    NoRp(Ipv4Addr),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid vif {0}")]
    InvalidVif(Vif),

    #[error("inconsistent routing table: {0}")]
    Inconsistent(String),
}
