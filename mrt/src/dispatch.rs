// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The single-threaded event loop that owns the engine.
//!
//! Kernel upcalls, protocol messages and configuration changes arrive as
//! [`Event`]s on a channel and are applied one at a time, each running to
//! completion. Between events the loop runs the aging pass once per tick.

use std::net::Ipv4Addr;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use slog::Logger;

use crate::catalog::MrtEngine;
use crate::error::Error;
use crate::log::mrt_log;
use crate::rpset::RpGrpSpec;
use crate::types::{MrtKey, Prefix4, Vif};

const LOG_UNIT: &str = "dispatch";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    CacheMiss {
        source: Ipv4Addr,
        group: Ipv4Addr,
        iif: Vif,
    },
    WrongIif {
        source: Ipv4Addr,
        group: Ipv4Addr,
        iif: Vif,
    },
    AddLeaf {
        vif: Vif,
        source: Option<Ipv4Addr>,
        group: Ipv4Addr,
    },
    DeleteLeaf {
        vif: Vif,
        source: Option<Ipv4Addr>,
        group: Ipv4Addr,
    },
    Join {
        target: MrtKey,
        vif: Vif,
        holdtime: u16,
    },
    Prune {
        target: MrtKey,
        vif: Vif,
        rpt: bool,
    },
    RegisterStop {
        source: Ipv4Addr,
        group: Ipv4Addr,
    },
    RpSetAdd(RpGrpSpec),
    RpSetDelete {
        rp: Ipv4Addr,
        prefix: Prefix4,
    },
    Shutdown,
}

pub struct Dispatcher {
    engine: MrtEngine,
    tick: Duration,
    log: Logger,
}

impl Dispatcher {
    pub fn new(engine: MrtEngine, tick: Duration) -> Self {
        let log = engine.log.clone();
        Self { engine, tick, log }
    }

    pub fn engine(&self) -> &MrtEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut MrtEngine {
        &mut self.engine
    }

    pub fn into_engine(self) -> MrtEngine {
        self.engine
    }

    /// Apply one event to the engine.
    pub fn handle(&mut self, event: Event) -> Result<(), Error> {
        let e = &mut self.engine;
        match event {
            Event::CacheMiss { source, group, iif } => {
                e.on_cache_miss(source, group, iif)
            }
            Event::WrongIif { source, group, iif } => {
                e.on_wrong_iif(source, group, iif)
            }
            Event::AddLeaf { vif, source, group } => {
                e.add_leaf(vif, source, group).map(|_| ())
            }
            Event::DeleteLeaf { vif, source, group } => {
                e.delete_leaf(vif, source, group)
            }
            Event::Join {
                target,
                vif,
                holdtime,
            } => e.join(target, vif, holdtime).map(|_| ()),
            Event::Prune { target, vif, rpt } => e.prune(target, vif, rpt),
            Event::RegisterStop { source, group } => {
                e.register_stop(source, group)
            }
            Event::RpSetAdd(spec) => e.add_rp_grp_entry(&spec).map(|_| ()),
            Event::RpSetDelete { rp, prefix } => {
                e.delete_rp_grp_entry(rp, prefix).map(|_| ())
            }
            Event::Shutdown => Ok(()),
        }
    }

    /// Run until a shutdown event arrives or every sender is gone.
    pub fn run(&mut self, rx: Receiver<Event>) {
        mrt_log!(self, info, "dispatcher running";
            "tick_ms" => self.tick.as_millis() as u64
        );
        let mut last = Instant::now();
        loop {
            let timeout = self.tick.saturating_sub(last.elapsed());
            match rx.recv_timeout(timeout) {
                Ok(Event::Shutdown) => break,
                Ok(event) => {
                    let name = format!("{event:?}");
                    if let Err(e) = self.handle(event) {
                        mrt_log!(self, warn, "event failed: {e}";
                            "event" => name
                        );
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let elapsed = last.elapsed();
            if elapsed >= self.tick {
                self.engine.age_routes(elapsed);
                last = Instant::now();
            }
        }
        mrt_log!(self, info, "dispatcher shutting down";
            "routes" => self.engine.route_count()
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::{harness, Harness, G1, R1, S1, VIF_LAN, VIF_RP};
    use crate::types::VifSet;
    use pim_common::cidr;
    use pretty_assertions::assert_eq;
    use std::sync::mpsc;

    const LONG_TICK: Duration = Duration::from_secs(3600);

    #[test]
    fn events_apply_in_order() {
        let Harness { engine, kernel, .. } = harness("dispatch_order");
        let mut d = Dispatcher::new(engine, LONG_TICK);
        let (tx, rx) = mpsc::channel();

        for event in [
            Event::AddLeaf {
                vif: VIF_LAN,
                source: None,
                group: G1,
            },
            Event::CacheMiss {
                source: S1,
                group: G1,
                iif: VIF_RP,
            },
            Event::Shutdown,
            // never reached
            Event::DeleteLeaf {
                vif: VIF_LAN,
                source: None,
                group: G1,
            },
        ] {
            tx.send(event).expect("send");
        }
        d.run(rx);

        let wc = MrtKey::wc(G1);
        assert_eq!(
            d.engine().route(&wc).map(|e| e.oifs),
            Some(VifSet::single(VIF_LAN))
        );
        assert_eq!(d.engine().cache_owner(S1, G1), Some(wc));
        assert_eq!(
            kernel.installed(S1, G1),
            Some((VIF_RP, VifSet::single(VIF_LAN), Some(R1)))
        );
    }

    #[test]
    fn failed_event_does_not_stop_loop() {
        let Harness { engine, .. } = harness("dispatch_failure");
        let mut d = Dispatcher::new(engine, LONG_TICK);
        let (tx, rx) = mpsc::channel();

        // no rp covers 239/8
        tx.send(Event::AddLeaf {
            vif: VIF_LAN,
            source: None,
            group: Ipv4Addr::new(239, 1, 1, 1),
        })
        .expect("send");
        tx.send(Event::AddLeaf {
            vif: VIF_LAN,
            source: None,
            group: G1,
        })
        .expect("send");
        drop(tx);
        d.run(rx);

        assert_eq!(d.engine().route_count(), 1);
    }

    #[test]
    fn rp_set_events() {
        let Harness { engine, .. } = harness("dispatch_rpset");
        let mut d = Dispatcher::new(engine, LONG_TICK);
        d.handle(Event::AddLeaf {
            vif: VIF_LAN,
            source: None,
            group: G1,
        })
        .expect("leaf");
        d.handle(Event::RpSetDelete {
            rp: R1,
            prefix: cidr!("224.0.0.0/7"),
        })
        .expect("delete edge");
        assert_eq!(
            d.engine().group(G1).map(|g| g.rp_address),
            Some(crate::test::R2)
        );
        d.engine().audit().expect("audit");
    }

    #[test]
    fn ticks_age_routes() {
        let Harness { engine, .. } = harness("dispatch_tick");
        let mut d = Dispatcher::new(engine, Duration::from_millis(1));
        d.handle(Event::AddLeaf {
            vif: VIF_LAN,
            source: None,
            group: G1,
        })
        .expect("leaf");
        d.handle(Event::DeleteLeaf {
            vif: VIF_LAN,
            source: None,
            group: G1,
        })
        .expect("leaf gone");

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let _ = tx.send(Event::Shutdown);
        });
        d.run(rx);
        assert_eq!(d.engine().route_count(), 0);
    }
}
