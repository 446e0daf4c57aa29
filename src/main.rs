//! ptpsyncd — IEEE 1588 slave daemon.
//!
//! Synchronises the system clock or a NIC hardware clock to a remote PTP
//! master: port engine, best-master selection, PID servo.

use clap::Parser;
use ptpsyncd::clock::{Clock, ClockRegistry, PhcClock, SystemClock};
use ptpsyncd::config::{ClockCtrlPolicy, Config};
use ptpsyncd::engine::{interface_mac, Engine};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "ptpsyncd", version, about = "IEEE 1588 PTP slave daemon")]
struct Args {
    /// Config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Network interface (overrides the config file)
    #[arg(short, long)]
    interface: Option<String>,

    /// PHC device to discipline (e.g. /dev/ptp0); default is the system clock
    #[arg(short, long)]
    phc: Option<String>,

    /// PTP domain number (overrides the config file)
    #[arg(short, long)]
    domain: Option<u8>,

    /// Never take the master role
    #[arg(long)]
    slave_only: bool,

    /// Observe only: measure offsets without touching any clock
    #[arg(long)]
    no_adjust: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ptpsyncd=info".parse().expect("static directive")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("config error: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Some(interface) = args.interface {
        config.interface = interface;
    }
    if let Some(domain) = args.domain {
        config.domain_number = domain;
    }
    if args.slave_only {
        config.slave_only = true;
    }
    if args.no_adjust {
        config.clock_ctrl_policy = ClockCtrlPolicy::NoAdjust;
    }

    info!("ptpsyncd v{} starting on {}", VERSION, config.interface);

    let mac = match interface_mac(&config.interface) {
        Ok(mac) => mac,
        Err(e) => {
            error!("cannot read MAC of {}: {}", config.interface, e);
            std::process::exit(1);
        }
    };

    // Disciplining a PHC keeps the system clock around as a cross-check
    // reference; disciplining the system clock has nothing to compare to.
    let (clock, reference): (Arc<dyn Clock>, Option<Arc<dyn Clock>>) = match &args.phc {
        Some(device) => match PhcClock::open(device) {
            Ok(phc) => {
                info!("disciplining {}", device);
                (Arc::new(phc), Some(Arc::new(SystemClock)))
            }
            Err(e) => {
                error!("{}", e);
                std::process::exit(1);
            }
        },
        None => {
            info!("disciplining the system clock");
            (Arc::new(SystemClock), None)
        }
    };

    let registry = Arc::new(ClockRegistry::new());
    let engine = match Engine::new(config, mac, clock, reference, registry) {
        Ok(engine) => engine,
        Err(e) => {
            error!("port setup failed: {}", e);
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let runner = tokio::spawn(engine.run(shutdown_rx));

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down...");
    shutdown_tx.send(true).ok();

    match runner.await {
        Ok(Ok(())) => info!("stopped"),
        Ok(Err(e)) => error!("port failed: {}", e),
        Err(e) => error!("engine task panicked: {}", e),
    }
}
