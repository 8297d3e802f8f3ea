use crate::cache::CacheManager;
use crate::checker::AvailabilityChecker;
use crate::error::{ConflictError, Result};
use crate::reservation::ReservationManager;
use crate::store::ReservationStore;
use crate::types::{
    is_privileged, is_well_known, service_label_for, Conflict, ConflictKind, Host, OccupancySource,
    PortNumber, PortStatus, Protocol, Severity,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, Duration};
use tracing::debug;
use uuid::Uuid;

/// Window over which the "recent conflicts" counter is kept.
const RECENT_CONFLICT_WINDOW: chrono::Duration = chrono::Duration::minutes(5);

/// Warnings surfaced by `validate_deployment` for risky-but-not-conflicting
/// choices.
#[derive(Debug, Clone)]
pub struct DeploymentWarning {
    pub port: u16,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct DeploymentReport {
    pub conflicts: Vec<Conflict>,
    pub warnings: Vec<DeploymentWarning>,
}

impl DeploymentReport {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Events emitted by a live monitor session as port status changes.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    ConflictDetected(Conflict),
    ConflictResolved { port: u16, protocol: Protocol },
    ReservationExpired(u16),
    Error(String),
}

/// Fuses system occupancy with reservation state into a single conflict
/// view, and runs tick-based live monitor sessions over a port set. System-
/// process occupancy is always `Severity::High`; a reservation held by
/// someone else is `Severity::Medium`.
pub struct ConflictDetector {
    checker: Arc<dyn AvailabilityChecker>,
    reservations: Arc<ReservationManager>,
    cache: Arc<CacheManager>,
    store: Arc<dyn ReservationStore>,
    sessions: DashMap<String, MonitorSessionHandle>,
    recent_conflicts: Mutex<VecDeque<(DateTime<Utc>, Severity)>>,
}

struct MonitorSessionHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl ConflictDetector {
    pub fn new(
        checker: Arc<dyn AvailabilityChecker>,
        reservations: Arc<ReservationManager>,
        cache: Arc<CacheManager>,
        store: Arc<dyn ReservationStore>,
    ) -> Self {
        Self {
            checker,
            reservations,
            cache,
            store,
            sessions: DashMap::new(),
            recent_conflicts: Mutex::new(VecDeque::new()),
        }
    }

    /// Evaluate a single port for conflicts, consulting the cache first.
    ///
    /// `exclude_owner` lets a container re-validate its own reservations
    /// without self-conflicting.
    pub async fn detect(
        &self,
        host: &Host,
        port: PortNumber,
        protocol: Protocol,
        exclude_owner: Option<&str>,
    ) -> Result<Option<Conflict>> {
        let cache_key = format!("{}:{}:{}:{}", host, port, protocol, exclude_owner.unwrap_or("-"));
        if let Some(conflicts) = self.cache.conflicts.get(&cache_key) {
            return Ok(conflicts.into_iter().next());
        }

        let conflict = self.evaluate(host, port, protocol, exclude_owner).await?;
        if let Some(c) = &conflict {
            self.record_conflict(c.severity).await;
        }

        let tag = format!("port:{}", port.get());
        self.cache
            .conflicts
            .set(&cache_key, conflict.clone().into_iter().collect(), &[&tag]);

        Ok(conflict)
    }

    async fn evaluate(
        &self,
        host: &Host,
        port: PortNumber,
        protocol: Protocol,
        exclude_owner: Option<&str>,
    ) -> Result<Option<Conflict>> {
        let occupied = !self.checker.is_available(host, port, protocol).await;
        if occupied {
            return Ok(Some(Conflict {
                port,
                protocol,
                kind: ConflictKind::SystemProcess,
                severity: Severity::High,
                owner_id: None,
                reservation_expires: None,
            }));
        }

        if let Some(reservation) = self.reservations.get_active(port, protocol).await? {
            if Some(reservation.owner_id.as_str()) != exclude_owner {
                return Ok(Some(Conflict {
                    port,
                    protocol,
                    kind: ConflictKind::Reservation,
                    severity: Severity::Medium,
                    owner_id: Some(reservation.owner_id),
                    reservation_expires: Some(reservation.expires_at),
                }));
            }
        }

        Ok(None)
    }

    /// Record a conflict observation for the rolling "recent conflicts"
    /// counter, pruning anything older than `RECENT_CONFLICT_WINDOW`.
    async fn record_conflict(&self, severity: Severity) {
        let mut log = self.recent_conflicts.lock().await;
        let now = Utc::now();
        log.push_back((now, severity));
        Self::evict_stale(&mut log, now);
    }

    fn evict_stale(log: &mut VecDeque<(DateTime<Utc>, Severity)>, now: DateTime<Utc>) {
        while let Some((at, _)) = log.front() {
            if now - *at > RECENT_CONFLICT_WINDOW {
                log.pop_front();
            } else {
                break;
            }
        }
    }

    /// Count of conflicts observed within the trailing window — a real
    /// rolling counter, not an estimate derived from cache size.
    pub async fn recent_conflict_count(&self) -> usize {
        let mut log = self.recent_conflicts.lock().await;
        Self::evict_stale(&mut log, Utc::now());
        log.len()
    }

    /// Recent conflicts bucketed by severity, for `statistics()`.
    pub async fn recent_conflict_counts_by_severity(&self) -> std::collections::HashMap<Severity, usize> {
        let mut log = self.recent_conflicts.lock().await;
        Self::evict_stale(&mut log, Utc::now());
        let mut counts = std::collections::HashMap::new();
        for (_, severity) in log.iter() {
            *counts.entry(*severity).or_insert(0) += 1;
        }
        counts
    }

    /// Build a transient `PortStatus` snapshot for a single port.
    pub async fn status(&self, host: &Host, port: PortNumber, protocol: Protocol) -> Result<PortStatus> {
        let conflict = self.detect(host, port, protocol, None).await?;
        let reservation = self.reservations.get_active(port, protocol).await?;
        let over = self.store.get_port_override(port, protocol).await.unwrap_or_default();

        Ok(PortStatus {
            port,
            protocol,
            available: conflict.is_none(),
            reserved: reservation.is_some(),
            owner_id: reservation.as_ref().map(|r| r.owner_id.clone()),
            reserved_until: reservation.as_ref().map(|r| r.expires_at),
            source: match &conflict {
                Some(c) if c.kind == ConflictKind::SystemProcess => OccupancySource::System,
                Some(c) if c.kind == ConflictKind::Reservation => OccupancySource::Reservation,
                _ => OccupancySource::Unknown,
            },
            service_label: service_label_for(port.get()).map(|s| s.to_string()),
            label: over.as_ref().and_then(|o| o.label.clone()),
            documentation: over.and_then(|o| o.documentation),
        })
    }

    /// `update_port_label`: set or clear the user-facing label override.
    pub async fn update_port_label(
        &self,
        port: PortNumber,
        protocol: Protocol,
        label: Option<String>,
    ) -> Result<()> {
        self.store.set_port_label(port, protocol, label).await
    }

    /// `get_port_label`: current label override, if any.
    pub async fn get_port_label(&self, port: PortNumber, protocol: Protocol) -> Result<Option<String>> {
        Ok(self
            .store
            .get_port_override(port, protocol)
            .await?
            .and_then(|o| o.label))
    }

    /// `update_port_documentation`: set or clear the freeform note attached
    /// to a port.
    pub async fn update_port_documentation(
        &self,
        port: PortNumber,
        protocol: Protocol,
        text: Option<String>,
    ) -> Result<()> {
        self.store.set_port_documentation(port, protocol, text).await
    }

    /// Evaluate a batch of candidate deployment ports, returning hard
    /// conflicts plus soft warnings for privileged/well-known/UDP choices.
    pub async fn validate_deployment(
        &self,
        host: &Host,
        ports: &[(PortNumber, Protocol)],
        exclude_owner: Option<&str>,
    ) -> Result<DeploymentReport> {
        let mut conflicts = Vec::new();
        let mut warnings = Vec::new();

        for (port, protocol) in ports {
            if let Some(conflict) = self.detect(host, *port, *protocol, exclude_owner).await? {
                conflicts.push(conflict);
                continue;
            }

            if is_privileged(port.get()) {
                warnings.push(DeploymentWarning {
                    port: port.get(),
                    message: format!("port {} is privileged (<1024)", port),
                });
            } else if is_well_known(port.get()) {
                warnings.push(DeploymentWarning {
                    port: port.get(),
                    message: format!(
                        "port {} is well-known ({})",
                        port,
                        service_label_for(port.get()).unwrap_or("unlabeled")
                    ),
                });
            }

            if *protocol == Protocol::Udp {
                warnings.push(DeploymentWarning {
                    port: port.get(),
                    message: format!("port {} is UDP; occupancy detection is less reliable", port),
                });
            }
        }

        Ok(DeploymentReport { conflicts, warnings })
    }

    /// Start a live monitor session over a fixed port set, ticking at
    /// `interval_secs` and diffing against last-observed state.
    /// Returns a session id plus an event receiver; the session never
    /// terminates itself on a transient probe error.
    pub async fn start_monitor(
        &self,
        host: Host,
        ports: Vec<(PortNumber, Protocol)>,
        interval_secs: u64,
        exclude_owner: Option<String>,
    ) -> (String, mpsc::UnboundedReceiver<MonitorEvent>) {
        let session_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        let checker = self.checker.clone();
        let reservations = self.reservations.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(interval_secs));
            let mut last_state: std::collections::HashMap<(u16, Protocol), bool> =
                std::collections::HashMap::new();

            loop {
                ticker.tick().await;

                for (port, protocol) in &ports {
                    let occupied = !checker.is_available(&host, *port, *protocol).await;
                    let reservation = reservations.get_active(*port, *protocol).await;

                    let conflict = match reservation {
                        Ok(reservation) => {
                            if occupied {
                                Some(Conflict {
                                    port: *port,
                                    protocol: *protocol,
                                    kind: ConflictKind::SystemProcess,
                                    severity: Severity::High,
                                    owner_id: None,
                                    reservation_expires: None,
                                })
                            } else if let Some(r) = reservation.filter(|r| {
                                Some(r.owner_id.as_str()) != exclude_owner.as_deref()
                            }) {
                                Some(Conflict {
                                    port: *port,
                                    protocol: *protocol,
                                    kind: ConflictKind::Reservation,
                                    severity: Severity::Medium,
                                    owner_id: Some(r.owner_id),
                                    reservation_expires: Some(r.expires_at),
                                })
                            } else {
                                None
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(MonitorEvent::Error(e.to_string()));
                            continue;
                        }
                    };

                    let key = (port.get(), *protocol);
                    let was_conflicted = last_state.get(&key).copied().unwrap_or(false);
                    let is_conflicted = conflict.is_some();

                    if is_conflicted && !was_conflicted {
                        if tx.send(MonitorEvent::ConflictDetected(conflict.unwrap())).is_err() {
                            debug!("monitor session has no listener left, stopping");
                            return;
                        }
                    } else if was_conflicted && !is_conflicted {
                        if tx
                            .send(MonitorEvent::ConflictResolved { port: port.get(), protocol: *protocol })
                            .is_err()
                        {
                            debug!("monitor session has no listener left, stopping");
                            return;
                        }
                    }
                    last_state.insert(key, is_conflicted);
                }
            }
        });

        self.sessions.insert(session_id.clone(), MonitorSessionHandle { handle });
        (session_id, rx)
    }

    pub fn stop_monitor(&self, session_id: &str) -> Result<()> {
        match self.sessions.remove(session_id) {
            Some((_, session)) => {
                session.handle.abort();
                Ok(())
            }
            None => Err(ConflictError::SessionNotFound {
                session_id: session_id.to_string(),
            }
            .into()),
        }
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::DefaultAvailabilityChecker;
    use crate::config::{CheckMethod, ReservationConfig};
    use crate::store::SqliteReservationStore;
    use std::time::Duration as StdDuration;

    async fn detector() -> ConflictDetector {
        let store: Arc<dyn crate::store::ReservationStore> = Arc::new(SqliteReservationStore::in_memory().unwrap());
        store.initialize().await.unwrap();
        let checker = Arc::new(DefaultAvailabilityChecker::new(
            CheckMethod::Socket,
            StdDuration::from_millis(100),
            None,
        ));
        let reservations = Arc::new(ReservationManager::new(
            store.clone(),
            checker.clone(),
            ReservationConfig::default(),
        ));
        let cache = Arc::new(CacheManager::new(StdDuration::from_secs(5)));
        ConflictDetector::new(checker, reservations, cache, store)
    }

    #[tokio::test]
    async fn validate_deployment_flags_privileged_port() {
        let detector = detector().await;
        let host = Host::canonicalize("localhost");
        let report = detector
            .validate_deployment(&host, &[(PortNumber::new(22).unwrap(), Protocol::Tcp)], None)
            .await
            .unwrap();
        assert!(!report.warnings.is_empty() || !report.conflicts.is_empty());
    }

    #[tokio::test]
    async fn stop_unknown_session_errors() {
        let detector = detector().await;
        assert!(detector.stop_monitor("nonexistent").is_err());
    }

    #[tokio::test]
    async fn exclude_owner_suppresses_self_conflict() {
        let detector = detector().await;
        let host = Host::canonicalize("localhost");
        let port = PortNumber::new(25100).unwrap();

        detector
            .reservations
            .reserve(
                "alice",
                None,
                crate::reservation::ReservationRequest {
                    port,
                    protocol: Protocol::Tcp,
                    duration_secs: Some(300),
                    metadata: Default::default(),
                },
            )
            .await
            .unwrap();

        let self_check = detector.detect(&host, port, Protocol::Tcp, Some("alice")).await.unwrap();
        assert!(self_check.is_none());

        let other_check = detector.detect(&host, port, Protocol::Tcp, Some("bob")).await.unwrap();
        assert!(other_check.is_some());
    }

    #[tokio::test]
    async fn recent_conflict_count_tracks_observations() {
        let detector = detector().await;
        let host = Host::canonicalize("localhost");
        assert_eq!(detector.recent_conflict_count().await, 0);

        detector
            .reservations
            .reserve(
                "alice",
                None,
                crate::reservation::ReservationRequest {
                    port: PortNumber::new(25200).unwrap(),
                    protocol: Protocol::Tcp,
                    duration_secs: Some(300),
                    metadata: Default::default(),
                },
            )
            .await
            .unwrap();

        detector
            .detect(&host, PortNumber::new(25200).unwrap(), Protocol::Tcp, None)
            .await
            .unwrap();
        assert_eq!(detector.recent_conflict_count().await, 1);
    }
}
