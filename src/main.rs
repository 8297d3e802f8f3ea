use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use portguard::checker::DefaultAvailabilityChecker;
use portguard::AvailabilityChecker;
use portguard::config::Config;
use portguard::conflict::ConflictDetector;
use portguard::container::{BollardContainerRuntime, ContainerIntegration, ContainerRuntime};
use portguard::logging::init_logging;
use portguard::reservation::{ReservationManager, ReservationRequest};
use portguard::scheduler::Supervisor;
use portguard::store::{ReservationStore, SqliteReservationStore};
use portguard::suggestion::{ServiceHint, SuggestionEngine, SuggestionRequest};
use portguard::types::{Host, PortNumber, Protocol};
use portguard::CacheManager;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "portguardd")]
#[command(about = "Port monitoring and reservation service")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<String>,

    /// Override the configured log level
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan configured port ranges and print current status.
    Scan {
        /// Limit the scan to a single port.
        #[arg(long)]
        port: Option<u16>,
    },

    /// Reserve a port for an owner.
    Reserve {
        port: u16,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        duration_secs: Option<u64>,
    },

    /// Release a reservation.
    Release {
        port: u16,
        #[arg(long)]
        owner: String,
    },

    /// Suggest available alternative ports.
    Suggest {
        #[arg(long)]
        preferred: Option<u16>,
        #[arg(long)]
        count: Option<u32>,
    },

    /// Validate a set of ports intended for deployment.
    Validate {
        ports: Vec<u16>,
    },

    /// Probe every port in an inclusive range once and print occupancy.
    ScanRange {
        start: u16,
        end: u16,
    },

    /// Print the enriched view of every port currently in use: system
    /// occupancy, reservation ownership, container binding, and any label
    /// or documentation override.
    PortsInUse,

    /// Print an aggregate statistics snapshot across monitoring, cache and
    /// reservation state.
    Stats,

    /// Set or print the user-facing label override for a port.
    Label {
        port: u16,
        /// New label to set. Omit to print the current label instead.
        value: Option<String>,
        /// Clear the label override.
        #[arg(long)]
        clear: bool,
    },

    /// Set the freeform documentation note attached to a port.
    Document {
        port: u16,
        text: String,
    },

    /// Run the long-lived supervisor: periodic scanning, GC, container
    /// reconciliation, until interrupted.
    Serve,
}

/// Environment-variable overrides applied on top of the loaded config.
/// This is the only place in the process that reads the process
/// environment — the core library never does (config layer Design Notes).
fn apply_env_overrides(config: &mut Config) {
    if let Ok(level) = std::env::var("PORTGUARD_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(host_ip) = std::env::var("PORTGUARD_HOST_IP") {
        config.host_ip = Some(host_ip);
    }
}

struct Runtime {
    config: Config,
    store: Arc<dyn ReservationStore>,
    checker: Arc<dyn AvailabilityChecker>,
    reservations: Arc<ReservationManager>,
    conflicts: Arc<ConflictDetector>,
    container: Option<Arc<ContainerIntegration>>,
    cache: Arc<CacheManager>,
}

async fn build_runtime(config: Config) -> Result<Runtime> {
    let db_path = config
        .store
        .db_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("portguard.db"));
    let store: Arc<dyn ReservationStore> = Arc::new(SqliteReservationStore::new(db_path)?);
    store.initialize().await?;

    let checker: Arc<dyn AvailabilityChecker> = Arc::new(DefaultAvailabilityChecker::new(
        config.check_method,
        std::time::Duration::from_secs(config.check_timeout_secs),
        config.host_ip.clone(),
    ));

    let reservations = Arc::new(ReservationManager::new(
        store.clone(),
        checker.clone(),
        config.reservation.clone(),
    ));

    let cache = Arc::new(CacheManager::new(std::time::Duration::from_secs(config.cache_ttl_secs)));
    let conflicts = Arc::new(ConflictDetector::new(
        checker.clone(),
        reservations.clone(),
        cache.clone(),
        store.clone(),
    ));
    let suggestions = Arc::new(SuggestionEngine::new(
        checker.clone(),
        reservations.clone(),
        config.suggestion.clone(),
        config.excluded_ports.clone(),
        config.port_ranges.clone(),
    ));

    let container = match BollardContainerRuntime::connect() {
        Ok(runtime) => {
            let runtime: Arc<dyn ContainerRuntime> = Arc::new(runtime);
            Some(Arc::new(ContainerIntegration::new(
                runtime,
                reservations.clone(),
                conflicts.clone(),
                suggestions.clone(),
                cache.clone(),
                config.container.clone(),
            )))
        }
        Err(e) => {
            warn!("container runtime unavailable, continuing in reservation-only mode: {}", e);
            None
        }
    };

    Ok(Runtime {
        config,
        store,
        checker,
        reservations,
        conflicts,
        container,
        cache,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.as_ref().map(PathBuf::from);
    let mut config = Config::load(config_path.as_deref())
        .await
        .context("failed to load configuration")?;
    apply_env_overrides(&mut config);
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }

    let _log_guard = init_logging(&config.logging).context("failed to initialize logging")?;

    let runtime = build_runtime(config).await?;
    let host = Host::canonicalize("localhost");

    match cli.command {
        Commands::Scan { port } => {
            if let Some(port) = port {
                let port = PortNumber::new(port).context("invalid port")?;
                let status = runtime.conflicts.status(&host, port, Protocol::Tcp).await?;
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                for range in &runtime.config.port_ranges {
                    let ports: Vec<PortNumber> = range.as_range().filter_map(|p| PortNumber::new(p).ok()).collect();
                    let results = runtime.checker.is_available_many(&host, &ports, Protocol::Tcp).await;
                    let occupied: Vec<u16> = results
                        .into_iter()
                        .filter(|(_, available)| !available)
                        .map(|(p, _)| p.get())
                        .collect();
                    println!("range {}-{}: occupied = {:?}", range.start, range.end, occupied);
                }
            }
        }

        Commands::Reserve { port, owner, duration_secs } => {
            let port = PortNumber::new(port).context("invalid port")?;
            let request = ReservationRequest {
                port,
                protocol: Protocol::Tcp,
                duration_secs,
                metadata: HashMap::new(),
            };
            let reservation = runtime.reservations.reserve(&owner, None, request).await?;
            println!("{}", serde_json::to_string_pretty(&reservation)?);
        }

        Commands::Release { port, owner } => {
            let port = PortNumber::new(port).context("invalid port")?;
            runtime.reservations.release(&owner, port, Protocol::Tcp).await?;
            info!(port = %port, owner = %owner, "reservation released");
        }

        Commands::Suggest { preferred, count } => {
            let engine = SuggestionEngine::new(
                runtime.checker.clone(),
                runtime.reservations.clone(),
                runtime.config.suggestion.clone(),
                runtime.config.excluded_ports.clone(),
                runtime.config.port_ranges.clone(),
            );
            let request = SuggestionRequest {
                preferred_port: preferred.and_then(|p| PortNumber::new(p).ok()),
                protocol: Protocol::Tcp,
                service_hint: Some(ServiceHint::Custom),
                count,
                ..Default::default()
            };
            let suggestions = engine.suggest(&host, request).await?;
            for s in suggestions {
                println!(
                    "{:?} (+{}, via {})",
                    s.block, s.distance_from_preferred, s.strategy
                );
            }
        }

        Commands::Validate { ports } => {
            let candidates: Vec<(PortNumber, Protocol)> = ports
                .into_iter()
                .filter_map(|p| PortNumber::new(p).ok())
                .map(|p| (p, Protocol::Tcp))
                .collect();
            let report = runtime.conflicts.validate_deployment(&host, &candidates, None).await?;
            if report.is_clean() {
                println!("no conflicts");
            } else {
                for conflict in &report.conflicts {
                    println!("conflict: port {} ({:?})", conflict.port, conflict.kind);
                }
            }
            for warning in &report.warnings {
                println!("warning: {}", warning.message);
            }
        }

        Commands::ScanRange { start, end } => {
            let supervisor = Supervisor::new(
                runtime.config.clone(),
                runtime.store.clone(),
                runtime.checker.clone(),
                runtime.reservations.clone(),
                runtime.conflicts.clone(),
                runtime.container.clone(),
                runtime.cache.clone(),
            );
            let results = supervisor.scan_range(start, end, Protocol::Tcp).await;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }

        Commands::PortsInUse => {
            let supervisor = Supervisor::new(
                runtime.config.clone(),
                runtime.store.clone(),
                runtime.checker.clone(),
                runtime.reservations.clone(),
                runtime.conflicts.clone(),
                runtime.container.clone(),
                runtime.cache.clone(),
            );
            let ports = supervisor.get_ports_in_use().await?;
            println!("{}", serde_json::to_string_pretty(&ports)?);
        }

        Commands::Stats => {
            let supervisor = Supervisor::new(
                runtime.config.clone(),
                runtime.store.clone(),
                runtime.checker.clone(),
                runtime.reservations.clone(),
                runtime.conflicts.clone(),
                runtime.container.clone(),
                runtime.cache.clone(),
            );
            supervisor.scan_once().await;
            let stats = supervisor.statistics().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Commands::Label { port, value, clear } => {
            let port = PortNumber::new(port).context("invalid port")?;
            if clear {
                runtime.conflicts.update_port_label(port, Protocol::Tcp, None).await?;
            } else if let Some(value) = value {
                runtime
                    .conflicts
                    .update_port_label(port, Protocol::Tcp, Some(value))
                    .await?;
            } else {
                let label = runtime.conflicts.get_port_label(port, Protocol::Tcp).await?;
                println!("{}", label.unwrap_or_else(|| "(none)".to_string()));
            }
        }

        Commands::Document { port, text } => {
            let port = PortNumber::new(port).context("invalid port")?;
            runtime
                .conflicts
                .update_port_documentation(port, Protocol::Tcp, Some(text))
                .await?;
        }

        Commands::Serve => {
            let supervisor = Supervisor::new(
                runtime.config.clone(),
                runtime.store.clone(),
                runtime.checker.clone(),
                runtime.reservations.clone(),
                runtime.conflicts.clone(),
                runtime.container.clone(),
                runtime.cache.clone(),
            );
            supervisor.initialize().await?;
            info!("portguardd is running, press Ctrl+C to stop");

            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for shutdown signal: {}", e);
            }

            supervisor.stop().await?;
        }
    }

    Ok(())
}
