use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::Parser;
use tracing::info;

use virtance_core::{
    abstractions::time::{Clock, SystemClock},
    config::VirtanceConfig,
    event_lease::EventLeases,
    ip_allocator::AddressAllocator,
    metering::{MeteredEntity, SweepReport, UsageLedger},
    orchestration_log::{EntityRef, OrchestrationLog},
    storage::Store,
    sweepers::MeteringSweeper,
    types::{ImageId, Virtance, VirtanceId},
    VirtanceError, VirtanceResult,
};

#[derive(Parser)]
#[command(name = "virtance")]
#[command(about = "Operator tool for the virtance orchestrator", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run one metering sweep
    Meter {
        /// Sweep as of this RFC 3339 instant instead of now
        #[arg(long, conflicts_with = "watch")]
        at: Option<String>,

        /// Keep sweeping on the configured interval until interrupted
        #[arg(long)]
        watch: bool,
    },
    /// Show a virtance, its event lease and its open billing interval
    Status {
        #[arg(long)]
        virtance: u64,
    },
    /// Show the error log of a virtance or image
    Errors {
        #[arg(long, conflicts_with = "image")]
        virtance: Option<u64>,
        #[arg(long)]
        image: Option<u64>,
    },
    /// Clear a stuck event so the virtance accepts new operations
    ReleaseEvent {
        #[arg(long)]
        virtance: u64,
    },
    /// Show allocation counts per address pool
    Pools,
}

fn load_config(path: Option<PathBuf>) -> VirtanceResult<VirtanceConfig> {
    let mut config = match path {
        Some(path) => VirtanceConfig::from_file(path)?,
        None => VirtanceConfig::default(),
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

fn parse_instant(value: &str) -> VirtanceResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| VirtanceError::Configuration {
            message: format!("Invalid instant '{}': {}", value, e),
        })
}

fn print_sweep(report: &SweepReport) {
    println!(
        "rolled over: {}, closed: {}, opened: {}, accrued: {}, repaired: {}",
        report.rolled_over, report.closed, report.opened, report.accrued, report.repaired
    );
}

#[tokio::main]
async fn main() -> VirtanceResult<()> {
    // Initialize logging
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in ["virtance=info", "virtance_core=info"] {
        filter = filter.add_directive(directive.parse().map_err(|e| {
            VirtanceError::Configuration {
                message: format!("Invalid log directive: {}", e),
            }
        })?);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = load_config(cli.config)?;
    if let Some(parent) = config.storage.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Store::open(&config.storage.path)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

    match cli.command {
        Commands::Meter { at, watch } => {
            let ledger = UsageLedger::new(store, clock.clone(), config.metering.clone());
            let sweeper = MeteringSweeper::new(ledger);
            if watch {
                let mut ticker = tokio::time::interval(config.metering.sweep_interval);
                info!("Metering every {:?}, Ctrl-C to stop", config.metering.sweep_interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => print_sweep(&sweeper.run_once(clock.now())?),
                        _ = tokio::signal::ctrl_c() => break,
                    }
                }
            } else {
                let now = match at {
                    Some(at) => parse_instant(&at)?,
                    None => clock.now(),
                };
                print_sweep(&sweeper.run_once(now)?);
            }
        }
        Commands::Status { virtance } => {
            let id = VirtanceId(virtance);
            let record: Virtance = store.require(id.0)?;
            println!("{}", serde_json::to_string_pretty(&record)?);

            let leases = EventLeases::new(store.clone(), clock.clone(), config.orchestrator.lease_ttl);
            match leases.current(id)? {
                Some(lease) => println!("lease: {} {:?}", lease.event, lease.state),
                None => println!("lease: none"),
            }

            let ledger = UsageLedger::new(store, clock, config.metering.clone());
            match ledger.open_interval(MeteredEntity::Virtance(id))? {
                Some(interval) => println!(
                    "billing: open since {} at {}/h, {} charged",
                    interval.started, interval.rate, interval.amount
                ),
                None => println!("billing: no open interval"),
            }
        }
        Commands::Errors { virtance, image } => {
            let entity = match (virtance, image) {
                (Some(id), _) => EntityRef::Virtance(VirtanceId(id)),
                (None, Some(id)) => EntityRef::Image(ImageId(id)),
                (None, None) => {
                    return Err(VirtanceError::Configuration {
                        message: "Pass --virtance or --image".to_string(),
                    })
                }
            };
            let log = OrchestrationLog::new(store, clock);
            let errors = log.errors_for(entity)?;
            if errors.is_empty() {
                println!("No errors recorded for {}", entity);
            }
            for entry in errors {
                println!("{} {:<24} {}", entry.recorded_at, entry.operation, entry.message);
            }
        }
        Commands::ReleaseEvent { virtance } => {
            let leases = EventLeases::new(store, clock, config.orchestrator.lease_ttl);
            match leases.release(VirtanceId(virtance))? {
                Some(lease) => {
                    info!(virtance, event = %lease.event, "Released event");
                    println!("Released {} on virtance {}", lease.event, virtance);
                }
                None => println!("Virtance {} had no lease", virtance),
            }
        }
        Commands::Pools => {
            let allocator = AddressAllocator::new(store, clock);
            for usage in allocator.pool_usage()? {
                println!(
                    "{:<6} {:<8} {:<6} {:<20} allocated {:>5}  floating {:>5}{}",
                    usage.pool.id,
                    usage.pool.pool_type,
                    usage.pool.region,
                    usage.pool.subnet.to_string(),
                    usage.allocated,
                    usage.floating,
                    if usage.pool.active { "" } else { "  (inactive)" }
                );
            }
        }
    }

    Ok(())
}
