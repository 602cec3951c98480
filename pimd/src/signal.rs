// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::mpsc::Sender;

use mrt::Event;
use slog::Logger;

use crate::log::sig_log;

/// Stop the dispatcher on SIGINT or SIGTERM.
pub(crate) fn termination_handler(
    tx: Sender<Event>,
    log: Logger,
) -> anyhow::Result<()> {
    ctrlc::set_handler(move || {
        sig_log!(log, info, "termination requested");
        if let Err(e) = tx.send(Event::Shutdown) {
            sig_log!(log, error, "dispatcher gone";
                "error" => format!("{e}")
            );
        }
    })?;
    Ok(())
}
