//! In-process radio simulation.
//!
//! Every node runs its own event-loop driver on one current-thread
//! runtime; a radio task copies each transmitted frame to every other
//! node (broadcast) or to its addressee (unicast). All nodes share one
//! master key preloaded into their flash images, so the master-key
//! scheme yields a pre-secret for every pair.

use crate::config::SimConfig;
use anyhow::Result;
use apkes_core::{
    Apkes, Driver, Dst, ExtendedAddr, Mac, MasterKeyScheme, NeighborIds, Platform, ShortAddr,
    TokioClock, WireFrame,
};
use apkes_crypto::{Key128, Prng, SEED_LEN};
use apkes_store::{MemFlash, preload_keying};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing::info;

struct RadioMac {
    uplink: mpsc::UnboundedSender<WireFrame>,
}

impl Mac for RadioMac {
    fn send(&mut self, frame: WireFrame) {
        // The radio task may already be gone during shutdown.
        let _ = self.uplink.send(frame);
    }
}

/// Run the simulation to completion and print the resulting tables.
pub fn run(config: &SimConfig) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_inner(config))
}

async fn run_inner(config: &SimConfig) -> Result<()> {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (radio_tx, mut radio_rx) = mpsc::unbounded_channel::<WireFrame>();
            let mut inject: HashMap<ExtendedAddr, mpsc::UnboundedSender<WireFrame>> =
                HashMap::new();
            let mut drivers = Vec::new();

            let master = master_key(config.seed);
            let protocol = config.protocol_config();

            for i in 0..config.nodes {
                let index = u8::try_from(i + 1)?;
                let addr = ExtendedAddr::new([index; 8]);

                let mut seed = [0u8; SEED_LEN];
                seed[0] = index;
                if let Some(base) = config.seed {
                    seed[1] = base;
                }
                let mut flash = MemFlash::new();
                preload_keying(&mut flash, &seed, master.as_bytes())?;

                let prng = match config.seed {
                    Some(_) => Prng::from_seed(seed, 0),
                    None => Prng::from_entropy(),
                };
                let platform = Platform {
                    mac: Box::new(RadioMac {
                        uplink: radio_tx.clone(),
                    }),
                    scheme: Box::new(MasterKeyScheme::new(addr)),
                    flash: Box::new(flash),
                    clock: Box::new(TokioClock::new()),
                    prng,
                };
                let apkes = Apkes::new(
                    protocol.clone(),
                    NeighborIds::new(addr, ShortAddr::new(u16::from(index))),
                    platform,
                );

                let (mut driver, tx) = Driver::new(apkes);
                driver
                    .apkes_mut()
                    .bootstrap(Box::new(move || info!(node = index, "bootstrapped")));
                inject.insert(addr, tx);
                drivers.push(tokio::task::spawn_local(driver.run()));
            }
            drop(radio_tx);

            let routes = inject.clone();
            let radio = tokio::task::spawn_local(async move {
                while let Some(frame) = radio_rx.recv().await {
                    match frame.dst {
                        Dst::Unicast(addr) => {
                            if let Some(tx) = routes.get(&addr) {
                                let _ = tx.send(frame);
                            }
                        }
                        Dst::Broadcast => {
                            for (addr, tx) in &routes {
                                if *addr != frame.src {
                                    let _ = tx.send(frame.clone());
                                }
                            }
                        }
                    }
                }
            });

            info!(
                nodes = config.nodes,
                duration = config.duration_secs,
                "simulation running"
            );
            tokio::time::sleep(Duration::from_secs(config.duration_secs)).await;

            radio.abort();
            drop(inject);

            let mut nodes = Vec::new();
            for driver in drivers {
                nodes.push(driver.await?);
            }
            print_report(&nodes);
            Ok(())
        })
        .await
}

fn master_key(seed: Option<u8>) -> Key128 {
    let mut prng = match seed {
        Some(base) => Prng::from_seed([base; SEED_LEN], 0),
        None => Prng::from_entropy(),
    };
    prng.key()
}

fn print_report(nodes: &[Apkes]) {
    for apkes in nodes {
        let ids = apkes.own_ids();
        println!(
            "node {} (short {}): {} neighbors, bootstrapped: {}",
            ids.extended_addr,
            ids.short_addr,
            apkes.neighbors().count(),
            apkes.is_bootstrapped()
        );
        for n in apkes.neighbors().iter() {
            println!(
                "  peer {} short {} local {} foreign {} {:?}",
                n.ids.extended_addr, n.ids.short_addr, n.local_index, n.foreign_index, n.status
            );
        }
    }
}
