// ptpsyncd — Port Event Loop
// Distributed under the MIT software license.

//! Single-task cooperative loop per port.
//!
//! Level-triggered readiness over the event socket (data + error queue) and
//! the general socket, plus a 62.5 ms tick. Nothing in the loop blocks; the
//! port engine is fed and its outbound queue drained after every wakeup.

use crate::clock::{Clock, ClockRegistry, FrequencyStore, SavedCorrection};
use crate::config::Config;
use crate::error::PortError;
use crate::port::{PtpPort, TICK_RESOLUTION};
use crate::transport::PortSockets;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// How often the saved frequency correction is rewritten.
const PERSIST_INTERVAL: Duration = Duration::from_secs(60);

/// How often a stats line is logged.
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Read the EUI-48 of a network interface from sysfs.
pub fn interface_mac(name: &str) -> io::Result<[u8; 6]> {
    let path = format!("/sys/class/net/{}/address", name);
    let text = fs::read_to_string(Path::new(&path))?;
    parse_mac(text.trim())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed mac address"))
}

fn parse_mac(text: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = text.split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    parts.next().is_none().then_some(mac)
}

pub struct Engine {
    port: PtpPort,
    sockets: PortSockets,
    registry: Arc<ClockRegistry>,
    clock_id: u32,
    store: Option<FrequencyStore>,
    clock_name: String,
}

impl Engine {
    /// Build sockets and the port. Any failure here is the fatal setup
    /// class: the caller reports upward and decides whether to retry.
    /// `reference` is the cross-check clock (the system clock when a PHC is
    /// being disciplined); the port compares against it periodically.
    pub fn new(
        config: Config,
        mac: [u8; 6],
        clock: Arc<dyn Clock>,
        reference: Option<Arc<dyn Clock>>,
        registry: Arc<ClockRegistry>,
    ) -> Result<Self, PortError> {
        config.validate().map_err(|e| PortError::Fatal(e.to_string()))?;

        let sockets = PortSockets::open(&config)?;
        let clock_name = clock.name().to_string();
        let clock_id = registry.register(clock.clone());

        let store = config.persistent_correction.then(|| FrequencyStore::new(&config.state_dir));
        let saved = store
            .as_ref()
            .and_then(|s| s.load(&clock_name))
            .map(|c| {
                info!("restored frequency correction {:.1} ppb for {}", c.ppb, clock_name);
                c.ppb
            })
            .unwrap_or(0.0);

        let trailer_len = sockets.trailer_len();
        let mut port = PtpPort::new(config, mac, 1, clock, saved, trailer_len)
            .map_err(|e| PortError::Fatal(e.to_string()))?;
        if let Some(reference) = reference {
            registry.register(reference.clone());
            port.set_reference_clock(reference);
        }

        Ok(Engine { port, sockets, registry, clock_id, store, clock_name })
    }

    pub fn port(&self) -> &PtpPort {
        &self.port
    }

    /// Run until the shutdown signal flips. Teardown is deterministic:
    /// timers stop, the TX cache flushes, sockets drop (leaving their
    /// groups), and the final correction is persisted.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), PortError> {
        let Engine { port, sockets, registry, clock_id, store, clock_name } = &mut self;

        port.start();

        let mut tick = tokio::time::interval(TICK_RESOLUTION);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_tick = Instant::now();
        let mut last_persist = Instant::now();
        let mut last_status = Instant::now();

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let now = Instant::now();
                    port.tick(now.saturating_duration_since(last_tick), now);
                    last_tick = now;

                    if last_status.elapsed() >= STATUS_INTERVAL {
                        last_status = now;
                        info!(
                            "state {:?} | offset {:?} ns | mpd {:?} ns | alarms {} | {}",
                            port.state(),
                            port.servo().last_offset_ns.map(|o| o.round()),
                            port.servo().last_mean_path_delay_ns.map(|d| d.round()),
                            port.alarms,
                            port.stats,
                        );
                    }
                    if store.is_some() && last_persist.elapsed() >= PERSIST_INTERVAL {
                        last_persist = now;
                        persist_correction(store, clock_name, port);
                    }
                }
                result = sockets.recv_event() => {
                    match result {
                        Ok(packet) => {
                            let now = Instant::now();
                            port.on_rx(&packet.data, packet.from, packet.timestamp, now);
                        }
                        Err(e) => warn!("event socket receive failed: {}", e),
                    }
                }
                result = sockets.recv_general() => {
                    match result {
                        Ok(packet) => {
                            let now = Instant::now();
                            port.on_rx(&packet.data, packet.from, packet.timestamp, now);
                        }
                        Err(e) => warn!("general socket receive failed: {}", e),
                    }
                }
                result = sockets.recv_tx_timestamp() => {
                    match result {
                        Ok(ts) => {
                            let now = Instant::now();
                            port.on_tx_ts(&ts.payload, ts.timestamp, now);
                        }
                        Err(e) => warn!("error queue receive failed: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }

            for out in port.take_outbound() {
                if let Err(e) = sockets.send(out.kind, &out.bytes, out.dest).await {
                    warn!("send failed: {}", e);
                }
            }
        }

        info!("port {} shutting down", port.identity());
        port.stop();
        persist_correction(store, clock_name, port);
        debug!("clock {} released from registry ({} registered)",
            clock_id, registry.snapshot().len());
        Ok(())
    }
}

fn persist_correction(store: &Option<FrequencyStore>, clock_name: &str, port: &PtpPort) {
    let Some(store) = store else { return };
    let correction = SavedCorrection {
        ppb: port.servo().correction_ppb(),
        updated_unix: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
    };
    if let Err(e) = store.save(clock_name, &correction) {
        warn!("failed to persist frequency correction: {}", e);
    } else {
        debug!("persisted {:.1} ppb for {}", correction.ppb, clock_name);
    }
}
