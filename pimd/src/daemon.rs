// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use mrt::{MrtEngine, StaticRib};
use slog::Logger;

use crate::config::DaemonConfig;
use crate::error::Error;
use crate::log::dlog;
use crate::lower::MemoryKernel;
use crate::protocol::LogNotifier;

/// Build an engine from configuration: interfaces, the RPF table, the
/// static RP set and static members, in that order.
pub(crate) fn build_engine(
    cfg: &DaemonConfig,
    kernel: Arc<MemoryKernel>,
    log: Logger,
) -> Result<MrtEngine, Error> {
    let vifs = cfg.validate()?;
    let rib = Arc::new(StaticRib::from_routes(&cfg.routes));
    let protocol = Arc::new(LogNotifier::new(log.clone()));

    let mut engine = MrtEngine::new(
        cfg.engine.clone(),
        vifs.clone(),
        kernel,
        rib,
        protocol,
        log.clone(),
    );

    for spec in &cfg.rp_set {
        let key = engine.add_rp_grp_entry(spec)?;
        dlog!(log, info, "rp-set entry {key}";
            "priority" => spec.priority
        );
    }

    for m in &cfg.members {
        let vif = cfg.member_vif(&vifs, m)?;
        match engine.add_leaf(vif, m.source, m.group) {
            Ok(key) => {
                dlog!(log, info, "static member on {}", m.vif;
                    "route" => key.to_string()
                );
            }
            Err(e) => {
                dlog!(log, warn, "static member on {} failed: {e}", m.vif;
                    "group" => m.group.to_string()
                );
            }
        }
    }

    Ok(engine)
}
