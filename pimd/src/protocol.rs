// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::Ipv4Addr;

use mrt::{MrtKey, Protocol, Vif};
use slog::Logger;

use crate::log::plog;

/// Records protocol notifications in the log. No PIM messages are sent.
pub struct LogNotifier {
    log: Logger,
}

impl LogNotifier {
    pub fn new(log: Logger) -> Self {
        Self { log }
    }
}

impl Protocol for LogNotifier {
    fn notify_route_changed(&self, key: &MrtKey) {
        plog!(self.log, debug, "join/prune due";
            "route" => key.to_string()
        );
    }

    fn notify_assert_needed(
        &self,
        source: Ipv4Addr,
        group: Ipv4Addr,
        iif: Vif,
        key: &MrtKey,
    ) {
        plog!(self.log, info, "assert needed";
            "source" => source.to_string(),
            "group" => group.to_string(),
            "vif" => iif,
            "route" => key.to_string()
        );
    }
}
