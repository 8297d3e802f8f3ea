use crate::cache::CacheManager;
use crate::checker::AvailabilityChecker;
use crate::config::{Config, PortRange};
use crate::conflict::ConflictDetector;
use crate::container::ContainerIntegration;
use crate::error::{Result, SchedulerError};
use crate::reservation::ReservationManager;
use crate::store::ReservationStore;
use crate::types::{service_label_for, EnrichedPort, Host, OccupancySource, PortNumber, PortStatus, Protocol};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Top-level process supervisor tying the components together and owning
/// their background tasks. Construction order mirrors the dependency graph
/// from the system overview (store/checker first, conflict detector and
/// container integration on top, scheduler last) so every subsystem is an
/// explicitly constructed field rather than a lazily-initialized global.
pub struct Supervisor {
    config: Config,
    store: Arc<dyn ReservationStore>,
    checker: Arc<dyn AvailabilityChecker>,
    reservations: Arc<ReservationManager>,
    conflicts: Arc<ConflictDetector>,
    container: Option<Arc<ContainerIntegration>>,
    cache: Arc<CacheManager>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    running: AtomicBool,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    last_scan_time: Arc<std::sync::Mutex<Option<DateTime<Utc>>>>,
}

/// Snapshot returned by `statistics()`, aggregating every subsystem's view
/// of the world at a single instant.
#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    pub monitored: usize,
    pub reservations: usize,
    pub available_in_range: usize,
    pub conflicts_recent: usize,
    pub last_scan: Option<DateTime<Utc>>,
    pub ranges: Vec<PortRange>,
    pub excluded: Vec<u16>,
    pub port_status_breakdown: HashMap<String, usize>,
    pub alert_counts_by_severity: HashMap<String, usize>,
}

impl Supervisor {
    pub fn new(
        config: Config,
        store: Arc<dyn ReservationStore>,
        checker: Arc<dyn AvailabilityChecker>,
        reservations: Arc<ReservationManager>,
        conflicts: Arc<ConflictDetector>,
        container: Option<Arc<ContainerIntegration>>,
        cache: Arc<CacheManager>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            store,
            checker,
            reservations,
            conflicts,
            container,
            cache,
            shutdown_tx,
            shutdown_rx,
            running: AtomicBool::new(false),
            tasks: std::sync::Mutex::new(Vec::new()),
            last_scan_time: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    /// Boot sequence: store init, container reconcile, initial scan,
    /// periodic scanner, GC timer. Each step is best-effort except store
    /// initialization, which is fatal on failure.
    pub async fn initialize(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyInitialized.into());
        }

        self.store.initialize().await?;

        if let Some(container) = &self.container {
            container.clone().spawn_event_listener();
            match container.reconcile().await {
                Ok(count) => info!(count, "reconciled container-owned reservations at startup"),
                Err(e) => warn!("container reconcile failed at startup: {}", e),
            }
        }

        self.initial_scan().await;

        if self.config.real_time_monitoring {
            self.spawn_periodic_scanner();
        }
        self.spawn_gc_timer();

        info!("supervisor initialized");
        Ok(())
    }

    /// Run a single probe pass without starting any background timers.
    /// Used by one-shot callers (e.g. a `stats` CLI command) that want a
    /// fresh `statistics()` snapshot without committing to `initialize()`'s
    /// full boot sequence.
    pub async fn scan_once(&self) {
        self.initial_scan().await;
    }

    /// Probe every configured port range once at startup so the cache is
    /// warm before the first external query.
    async fn initial_scan(&self) {
        let host = Host::canonicalize("localhost");
        for range in &self.config.port_ranges {
            let ports: Vec<PortNumber> = range
                .as_range()
                .filter(|p| !self.config.is_excluded(*p))
                .filter_map(|p| PortNumber::new(p).ok())
                .collect();

            // Pre-populate the monitored-port map with an optimistic
            // placeholder so statistics are queryable before the batch
            // below resolves.
            for port in &ports {
                let key = format!("local:{}:tcp", port);
                self.cache.monitor_state.set(
                    &key,
                    PortStatus {
                        port: *port,
                        protocol: Protocol::Tcp,
                        available: true,
                        reserved: false,
                        owner_id: None,
                        reserved_until: None,
                        source: OccupancySource::Unknown,
                        service_label: service_label_for(port.get()).map(|s| s.to_string()),
                        label: None,
                        documentation: None,
                    },
                    &[&format!("port:{}", port.get())],
                );
            }

            for batch in ports.chunks(100) {
                let results = self
                    .checker
                    .is_available_many(&host, batch, Protocol::Tcp)
                    .await;
                for (port, available) in results {
                    let key = format!("local:{}:tcp", port);
                    self.cache
                        .availability
                        .set(&key, available, &[&format!("port:{}", port.get())]);
                    if let Some(mut status) = self.cache.monitor_state.get(&key) {
                        status.available = available;
                        status.source = if available {
                            OccupancySource::Unknown
                        } else {
                            OccupancySource::System
                        };
                        self.cache
                            .monitor_state
                            .set(&key, status, &[&format!("port:{}", port.get())]);
                    }
                }
            }
        }
        *self.last_scan_time.lock().unwrap() = Some(Utc::now());
    }

    /// Periodically rescans a bounded window of configured ports, emitting
    /// diffed conflict events through the cache's port-tagged invalidation.
    fn spawn_periodic_scanner(&self) {
        let checker = self.checker.clone();
        let cache = self.cache.clone();
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let last_scan_time = self.last_scan_time.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(config.scan_interval_secs));
            let host = Host::canonicalize("localhost");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let all_ports: Vec<u16> = config
                            .port_ranges
                            .iter()
                            .flat_map(|r| r.as_range())
                            .filter(|p| !config.is_excluded(*p))
                            .collect();
                        let mut window: Vec<PortNumber> = {
                            use rand::seq::SliceRandom;
                            let mut rng = rand::thread_rng();
                            all_ports
                                .choose_multiple(&mut rng, all_ports.len().min(50))
                                .filter_map(|p| PortNumber::new(*p).ok())
                                .collect()
                        };
                        window.sort();

                        let results = checker.is_available_many(&host, &window, Protocol::Tcp).await;
                        for (port, available) in results {
                            let key = format!("local:{}:tcp", port);
                            let previous = cache.availability.get(&key);
                            if previous != Some(available) {
                                cache.invalidate_port(port.get());
                            }
                            cache
                                .availability
                                .set(&key, available, &[&format!("port:{}", port.get())]);
                            if let Some(mut status) = cache.monitor_state.get(&key) {
                                status.available = available;
                                status.source = if available {
                                    OccupancySource::Unknown
                                } else {
                                    OccupancySource::System
                                };
                                cache.monitor_state.set(&key, status, &[&format!("port:{}", port.get())]);
                            }
                        }
                        *last_scan_time.lock().unwrap() = Some(Utc::now());
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        self.tasks.lock().unwrap().push(handle);
    }

    /// Periodic reservation garbage collection.
    fn spawn_gc_timer(&self) {
        let store = self.store.clone();
        let interval_secs = self.config.reservation.gc_interval_secs;
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = store.gc_expired().await {
                            warn!("reservation gc failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        self.tasks.lock().unwrap().push(handle);
    }

    /// Idempotent graceful shutdown: flips the shutdown signal, awaits
    /// background tasks up to `5 * check_timeout_secs`, force-aborts
    /// stragglers, then runs a final GC pass.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.shutdown_tx.send(true);

        let deadline = Duration::from_secs(self.config.check_timeout_secs.saturating_mul(5).max(1));
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());

        for handle in handles {
            if tokio::time::timeout(deadline, handle).await.is_err() {
                warn!("background task did not shut down within deadline, aborting");
            }
        }

        if let Err(e) = self.store.gc_expired().await {
            warn!("final gc pass failed during shutdown: {}", e);
        }

        info!("supervisor stopped");
        Ok(())
    }

    /// Probe every port in `[start, end]` once, outside of the cache and
    /// without touching `last_scan_time` — a caller-initiated one-shot range
    /// scan, distinct from the periodic scanner's bounded random window.
    pub async fn scan_range(&self, start: u16, end: u16, protocol: Protocol) -> HashMap<u16, bool> {
        let host = Host::canonicalize("localhost");
        let ports: Vec<PortNumber> = (start..=end).filter_map(|p| PortNumber::new(p).ok()).collect();
        self.checker
            .is_available_many(&host, &ports, protocol)
            .await
            .into_iter()
            .map(|(port, available)| (port.get(), available))
            .collect()
    }

    /// The union of system-occupied ports, actively reserved ports, and
    /// container-published ports, each enriched with its static service
    /// label, any user-set label/documentation override, and reservation or
    /// container ownership. This is `get_ports_in_use` from the external
    /// interface (§6) — real data only, never a fabricated TCP/UDP split.
    pub async fn get_ports_in_use(&self) -> Result<Vec<EnrichedPort>> {
        let host = Host::canonicalize("localhost");

        let system_ports = self.checker.get_system_ports_in_use(&host).await?;
        let reservations = self.store.get_all_active().await.unwrap_or_default();
        let containers = match &self.container {
            Some(container) => container.list_containers().await,
            None => Vec::new(),
        };

        let mut by_port: HashMap<(u16, Protocol), EnrichedPort> = HashMap::new();

        for info in system_ports {
            by_port.insert(
                (info.port, info.protocol),
                EnrichedPort {
                    port: info.port,
                    protocol: info.protocol,
                    in_use: true,
                    process_name: info.process_name,
                    pid: info.pid,
                    service_label: service_label_for(info.port).map(|s| s.to_string()),
                    label: None,
                    documentation: None,
                    reservation_owner: None,
                    reserved_until: None,
                    container: None,
                },
            );
        }

        for reservation in &reservations {
            let key = (reservation.port.get(), reservation.protocol);
            let entry = by_port.entry(key).or_insert_with(|| EnrichedPort {
                port: reservation.port.get(),
                protocol: reservation.protocol,
                in_use: true,
                process_name: None,
                pid: None,
                service_label: service_label_for(reservation.port.get()).map(|s| s.to_string()),
                label: None,
                documentation: None,
                reservation_owner: None,
                reserved_until: None,
                container: None,
            });
            entry.in_use = true;
            entry.reservation_owner = Some(reservation.owner_id.clone());
            entry.reserved_until = Some(reservation.expires_at);
        }

        for container in &containers {
            for binding in &container.bindings {
                let Some(host_port) = binding.host_port else { continue };
                let key = (host_port, binding.protocol);
                let entry = by_port.entry(key).or_insert_with(|| EnrichedPort {
                    port: host_port,
                    protocol: binding.protocol,
                    in_use: true,
                    process_name: None,
                    pid: None,
                    service_label: service_label_for(host_port).map(|s| s.to_string()),
                    label: None,
                    documentation: None,
                    reservation_owner: None,
                    reserved_until: None,
                    container: None,
                });
                entry.container = Some(container.clone());
            }
        }

        for entry in by_port.values_mut() {
            let Ok(port_number) = PortNumber::new(entry.port) else { continue };
            if let Ok(Some(over)) = self.store.get_port_override(port_number, entry.protocol).await {
                entry.label = over.label;
                entry.documentation = over.documentation;
            }
        }

        let mut enriched: Vec<EnrichedPort> = by_port.into_values().collect();
        enriched.sort_by_key(|e| (e.port, e.protocol.as_str().to_string()));
        Ok(enriched)
    }

    pub fn conflicts(&self) -> Arc<ConflictDetector> {
        self.conflicts.clone()
    }

    pub fn reservations(&self) -> Arc<ReservationManager> {
        self.reservations.clone()
    }

    pub fn cache(&self) -> Arc<CacheManager> {
        self.cache.clone()
    }

    /// Aggregate snapshot across every subsystem. Real counts only — never
    /// a fabricated split of any kind.
    pub async fn statistics(&self) -> Statistics {
        let reservations = self.store.get_all_active().await.unwrap_or_default();
        let monitored_statuses = self.cache.monitor_state.values();

        let mut port_status_breakdown: HashMap<String, usize> = HashMap::new();
        let mut available_in_range = 0usize;
        for status in &monitored_statuses {
            let bucket = if status.reserved {
                "reserved"
            } else if status.available {
                "available"
            } else {
                "occupied"
            };
            *port_status_breakdown.entry(bucket.to_string()).or_insert(0) += 1;
            if status.available {
                available_in_range += 1;
            }
        }

        let alert_counts_by_severity = self
            .conflicts
            .recent_conflict_counts_by_severity()
            .await
            .into_iter()
            .map(|(severity, count)| (format!("{:?}", severity).to_lowercase(), count))
            .collect();

        Statistics {
            monitored: monitored_statuses.len(),
            reservations: reservations.len(),
            available_in_range,
            conflicts_recent: self.conflicts.recent_conflict_count().await,
            last_scan: *self.last_scan_time.lock().unwrap(),
            ranges: self.config.port_ranges.clone(),
            excluded: self.config.excluded_ports.iter().copied().collect(),
            port_status_breakdown,
            alert_counts_by_severity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::DefaultAvailabilityChecker;
    use crate::config::CheckMethod;
    use crate::store::SqliteReservationStore;

    async fn supervisor() -> Supervisor {
        let mut config = Config::default();
        config.port_ranges = vec![crate::config::PortRange::new(40000, 40010)];
        config.real_time_monitoring = false;
        let store: Arc<dyn ReservationStore> = Arc::new(SqliteReservationStore::in_memory().unwrap());
        let checker: Arc<dyn AvailabilityChecker> = Arc::new(DefaultAvailabilityChecker::new(
            CheckMethod::Socket,
            Duration::from_millis(50),
            None,
        ));
        let reservations = Arc::new(ReservationManager::new(
            store.clone(),
            checker.clone(),
            config.reservation.clone(),
        ));
        let cache = Arc::new(CacheManager::new(Duration::from_secs(config.cache_ttl_secs)));
        let conflicts = Arc::new(ConflictDetector::new(
            checker.clone(),
            reservations.clone(),
            cache.clone(),
            store.clone(),
        ));
        Supervisor::new(config, store, checker, reservations, conflicts, None, cache)
    }

    #[tokio::test]
    async fn double_initialize_fails() {
        let supervisor = supervisor().await;
        supervisor.initialize().await.unwrap();
        assert!(supervisor.initialize().await.is_err());
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_initialize_is_a_noop() {
        let supervisor = supervisor().await;
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn scan_range_reports_every_port_in_the_window() {
        let supervisor = supervisor().await;
        let results = supervisor.scan_range(40000, 40005, Protocol::Tcp).await;
        assert_eq!(results.len(), 6);
    }

    #[tokio::test]
    async fn ports_in_use_reflects_an_active_reservation() {
        let supervisor = supervisor().await;
        supervisor
            .reservations
            .reserve(
                "alice",
                None,
                crate::reservation::ReservationRequest {
                    port: PortNumber::new(40002).unwrap(),
                    protocol: Protocol::Tcp,
                    duration_secs: Some(300),
                    metadata: Default::default(),
                },
            )
            .await
            .unwrap();

        // get_system_ports_in_use may legitimately fail in sandboxes lacking
        // ss/netstat; that is a ScanFailure the caller must surface, not a
        // reason for get_ports_in_use to silently return an empty list.
        match supervisor.get_ports_in_use().await {
            Ok(ports) => {
                let reserved = ports.iter().find(|p| p.port == 40002 && p.protocol == Protocol::Tcp);
                assert!(reserved.is_some());
                assert_eq!(reserved.unwrap().reservation_owner.as_deref(), Some("alice"));
            }
            Err(e) => assert!(matches!(e, crate::error::PortGuardError::Checker(_))),
        }
    }
}
