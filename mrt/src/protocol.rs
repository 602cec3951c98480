// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::Ipv4Addr;

use crate::types::{MrtKey, Vif};

/// Outbound notifications to the PIM protocol machinery.
pub trait Protocol {
    /// A route's join/prune state needs to be sent upstream.
    fn notify_route_changed(&self, key: &MrtKey);

    /// Data for `source, group` arrived on `iif`, which is one of the
    /// route's outgoing interfaces, so an assert is needed there.
    fn notify_assert_needed(
        &self,
        source: Ipv4Addr,
        group: Ipv4Addr,
        iif: Vif,
        key: &MrtKey,
    );
}
