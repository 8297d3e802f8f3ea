use crate::cache::CacheManager;
use crate::conflict::{ConflictDetector, DeploymentReport};
use crate::config::ContainerConfig;
use crate::error::{ContainerError, Result};
use crate::reservation::{ReservationManager, ReservationRequest};
use crate::suggestion::{PortSuggestion, SuggestionEngine, SuggestionRequest};
use crate::types::{ContainerPortInfo, Host, PortBinding, PortNumber, Protocol};
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerInspectResponse, ContainerSummary};
use bollard::Docker;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Docker lifecycle events relevant to port bookkeeping.
#[derive(Debug, Clone)]
pub enum ContainerLifecycleEvent {
    Started(ContainerPortInfo),
    Stopped(String),
}

/// Raw lifecycle events published by the runtime itself.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    Started(String),
    Stopped(String),
    Destroyed(String),
}

/// Minimal container-runtime surface the integration layer depends on,
/// allowing the Docker client to be swapped for a test double: just
/// `list_running`, `inspect(id)`, and `subscribe_events`.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn list_running(&self) -> Result<Vec<ContainerPortInfo>>;

    async fn inspect(&self, container_id: &str) -> Result<ContainerPortInfo>;

    async fn subscribe_events(&self) -> Result<broadcast::Receiver<RuntimeEvent>>;
}

/// Deterministic owner id for reservations auto-created on behalf of a
/// container, so `release_all_for_owner` on one container's stop never
/// touches another container's leases.
pub fn container_owner_id(container_id: &str) -> String {
    format!("docker:{}", container_id)
}

pub struct BollardContainerRuntime {
    client: Docker,
    events_tx: broadcast::Sender<RuntimeEvent>,
}

impl BollardContainerRuntime {
    pub fn connect() -> Result<Self> {
        let client = Docker::connect_with_local_defaults().map_err(|e| ContainerError::RuntimeUnavailable {
            reason: e.to_string(),
        })?;
        let (events_tx, _) = broadcast::channel(256);
        let runtime = Self { client, events_tx };
        runtime.spawn_event_forwarder();
        Ok(runtime)
    }

    /// Republish Docker's own event stream onto an internal broadcast
    /// channel so multiple internal subscribers (auto-reserve path,
    /// monitor-session path) can each react independently without the
    /// runtime knowing about either.
    fn spawn_event_forwarder(&self) {
        let client = self.client.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            use bollard::system::EventsOptions;
            let mut stream = client.events(None::<EventsOptions<String>>);
            while let Some(event) = stream.next().await {
                let Ok(event) = event else { continue };
                let Some(id) = event.actor.and_then(|a| a.id) else { continue };
                let mapped = match event.action.as_deref() {
                    Some("start") => Some(RuntimeEvent::Started(id)),
                    Some("stop") | Some("die") => Some(RuntimeEvent::Stopped(id)),
                    Some("destroy") => Some(RuntimeEvent::Destroyed(id)),
                    _ => None,
                };
                if let Some(mapped) = mapped {
                    let _ = tx.send(mapped);
                }
            }
        });
    }

    fn parse_summary(summary: ContainerSummary) -> ContainerPortInfo {
        let bindings: Vec<PortBinding> = summary
            .ports
            .unwrap_or_default()
            .into_iter()
            .map(|p| PortBinding {
                container_port: p.private_port,
                host_port: p.public_port,
                host_ip: if p.public_port.is_some() { p.ip } else { None },
                protocol: match p.typ.map(|t| t.to_string().to_lowercase()) {
                    Some(ref t) if t == "udp" => Protocol::Udp,
                    _ => Protocol::Tcp,
                },
            })
            .collect();

        let exposed_ports = bindings.iter().map(|b| b.container_port).collect();

        ContainerPortInfo {
            container_id: summary.id.unwrap_or_default(),
            container_name: summary
                .names
                .as_deref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            image: summary.image,
            exposed_ports,
            bindings,
            started_at: summary
                .created
                .and_then(|ts| DateTime::from_timestamp(ts, 0))
                .unwrap_or_else(Utc::now),
        }
    }

    /// Parse the `"80/tcp"`-style container-port key and the
    /// `NetworkSettings.Ports` binding map from an inspect response.
    fn parse_inspect(details: ContainerInspectResponse) -> ContainerPortInfo {
        let bindings: Vec<PortBinding> = details
            .network_settings
            .as_ref()
            .and_then(|ns| ns.ports.as_ref())
            .map(|port_map| {
                port_map
                    .iter()
                    .flat_map(|(key, host_bindings)| {
                        let (port_str, protocol_str) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
                        let container_port: u16 = port_str.parse().unwrap_or(0);
                        let protocol = if protocol_str == "udp" {
                            Protocol::Udp
                        } else {
                            Protocol::Tcp
                        };
                        let bound = host_bindings.as_deref().unwrap_or(&[]);
                        if bound.is_empty() {
                            vec![PortBinding {
                                container_port,
                                host_port: None,
                                host_ip: None,
                                protocol,
                            }]
                        } else {
                            bound
                                .iter()
                                .map(|b| PortBinding {
                                    container_port,
                                    host_port: b.host_port.as_deref().and_then(|p| p.parse().ok()),
                                    host_ip: b.host_ip.clone(),
                                    protocol,
                                })
                                .collect()
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        let exposed_ports = bindings.iter().map(|b| b.container_port).collect();

        ContainerPortInfo {
            container_id: details.id.unwrap_or_default(),
            container_name: details
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            image: details.config.and_then(|c| c.image),
            exposed_ports,
            bindings,
            started_at: details
                .state
                .as_ref()
                .and_then(|s| s.started_at.as_deref())
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
        }
    }
}

#[async_trait]
impl ContainerRuntime for BollardContainerRuntime {
    async fn list_running(&self) -> Result<Vec<ContainerPortInfo>> {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| ContainerError::RuntimeUnavailable { reason: e.to_string() })?;

        Ok(containers.into_iter().map(Self::parse_summary).collect())
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerPortInfo> {
        let details = self
            .client
            .inspect_container(container_id, None)
            .await
            .map_err(|_| ContainerError::NotFound {
                container_id: container_id.to_string(),
            })?;
        Ok(Self::parse_inspect(details))
    }

    async fn subscribe_events(&self) -> Result<broadcast::Receiver<RuntimeEvent>> {
        Ok(self.events_tx.subscribe())
    }
}

/// Outcome of `pre_start`: whether the container may proceed to bind its
/// ports, and if not, why.
#[derive(Debug, Clone)]
pub struct StartDecision {
    pub proceed: bool,
    pub reason: Option<String>,
    pub recommended_action: Option<String>,
    pub alternatives: Vec<PortSuggestion>,
}

/// Bridges container lifecycle to the reservation and conflict-detection
/// systems: validates, reserves, monitors, and releases a container's
/// published host ports automatically. Container state is advisory —
/// the runtime being unreachable must never block reservation or
/// conflict-detection paths using live system state.
pub struct ContainerIntegration {
    runtime: Arc<dyn ContainerRuntime>,
    reservations: Arc<ReservationManager>,
    conflicts: Arc<ConflictDetector>,
    suggestions: Arc<SuggestionEngine>,
    cache: Arc<CacheManager>,
    config: ContainerConfig,
    events_tx: broadcast::Sender<ContainerLifecycleEvent>,
    /// Monitor sessions keyed by container id.
    monitor_sessions: DashMap<String, String>,
}

impl ContainerIntegration {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        reservations: Arc<ReservationManager>,
        conflicts: Arc<ConflictDetector>,
        suggestions: Arc<SuggestionEngine>,
        cache: Arc<CacheManager>,
        config: ContainerConfig,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            runtime,
            reservations,
            conflicts,
            suggestions,
            cache,
            config,
            events_tx,
            monitor_sessions: DashMap::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContainerLifecycleEvent> {
        self.events_tx.subscribe()
    }

    /// Subscribe to the runtime's own lifecycle events and drive
    /// `on_start`/`on_stop` automatically. The listener task runs for the
    /// process lifetime; it is not tracked by the `Supervisor`'s shutdown
    /// watch because it has nothing to flush on exit.
    pub fn spawn_event_listener(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut events = match self.runtime.subscribe_events().await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!("container runtime event subscription failed: {}", e);
                    return;
                }
            };

            loop {
                match events.recv().await {
                    Ok(RuntimeEvent::Started(id)) => match self.runtime.inspect(&id).await {
                        Ok(info) => {
                            if let Err(e) = self.on_start(&info).await {
                                warn!("on_start failed for container {}: {}", id, e);
                            }
                        }
                        Err(e) => warn!("inspect failed for started container {}: {}", id, e),
                    },
                    Ok(RuntimeEvent::Stopped(id)) | Ok(RuntimeEvent::Destroyed(id)) => {
                        if let Err(e) = self.on_stop(&id).await {
                            warn!("on_stop failed for container {}: {}", id, e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "container event listener lagged, some events were dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Reconcile current container state against reservations, reserving
    /// host ports for any running container that doesn't already have one.
    pub async fn reconcile(&self) -> Result<u32> {
        if !self.config.auto_reserve {
            return Ok(0);
        }

        let containers = match self.runtime.list_running().await {
            Ok(c) => c,
            Err(e) => {
                warn!("container runtime unreachable during reconcile: {}", e);
                return Ok(0);
            }
        };

        let mut reserved = 0;
        for container in containers {
            reserved += self.reserve_for_container(&container).await;
        }
        Ok(reserved)
    }

    async fn reserve_for_container(&self, container: &ContainerPortInfo) -> u32 {
        let mut count = 0;
        for binding in &container.bindings {
            let Some(host_port) = binding.host_port else { continue };
            let Ok(port) = PortNumber::new(host_port) else { continue };

            let existing = self.reservations.get_active(port, binding.protocol).await.ok().flatten();
            if existing.is_some() {
                continue;
            }

            let mut metadata = HashMap::new();
            metadata.insert("container_id".to_string(), serde_json::json!(container.container_id));
            metadata.insert("container_name".to_string(), serde_json::json!(container.container_name));

            let request = ReservationRequest {
                port,
                protocol: binding.protocol,
                duration_secs: Some(self.config.reservation_duration_secs),
                metadata,
            };

            let owner_id = container_owner_id(&container.container_id);
            match self.reservations.reserve(&owner_id, Some(container.container_name.clone()), request).await {
                Ok(_) => {
                    count += 1;
                    info!(port = %port, container = %container.container_name, "auto-reserved container port");
                }
                Err(e) => warn!("failed to auto-reserve container port {}: {}", port, e),
            }
        }
        count
    }

    /// Extract exposed ports from a container's published bindings,
    /// de-duplicate, then check each against the conflict detector excluding the container's
    /// own id, so a container re-validating its own already-held
    /// reservation never self-conflicts.
    pub async fn validate(&self, container: &ContainerPortInfo) -> Result<DeploymentReport> {
        let host = Host::canonicalize("localhost");
        let owner_id = container_owner_id(&container.container_id);

        let mut seen = std::collections::BTreeSet::new();
        let mut candidates = Vec::new();
        for binding in &container.bindings {
            let Some(host_port) = binding.host_port else { continue };
            let Ok(port) = PortNumber::new(host_port) else { continue };
            if seen.insert((port.get(), binding.protocol)) {
                candidates.push((port, binding.protocol));
            }
        }

        self.conflicts
            .validate_deployment(&host, &candidates, Some(&owner_id))
            .await
    }

    /// Run `validate`; if clear and `auto_reserve` is on, reserve every
    /// binding for `reservation_duration_secs`. If conflicts exist, report
    /// them (optionally with alternatives from the suggestion engine) without retrying.
    pub async fn pre_start(&self, container: &ContainerPortInfo) -> Result<StartDecision> {
        let report = self.validate(container).await?;

        if !report.is_clean() {
            let mut alternatives = Vec::new();
            if self.config.suggest_alternatives {
                for conflict in &report.conflicts {
                    let host = Host::canonicalize("localhost");
                    let request = SuggestionRequest {
                        preferred_port: PortNumber::new(conflict.port.get()).ok(),
                        protocol: conflict.protocol,
                        count: Some(1),
                        ..Default::default()
                    };
                    if let Ok(mut found) = self.suggestions.suggest(&host, request).await {
                        alternatives.append(&mut found);
                    }
                }
            }

            let reason = report
                .conflicts
                .iter()
                .map(|c| format!("port {} conflicts ({:?})", c.port, c.kind))
                .collect::<Vec<_>>()
                .join("; ");

            return Ok(StartDecision {
                proceed: false,
                reason: Some(reason),
                recommended_action: Some("choose a different port or stop the conflicting owner".to_string()),
                alternatives,
            });
        }

        if self.config.auto_reserve {
            self.reserve_for_container(container).await;
        }

        Ok(StartDecision {
            proceed: true,
            reason: None,
            recommended_action: None,
            alternatives: Vec::new(),
        })
    }

    /// Cache port info and, if `monitor_running` is on, spawn a conflict monitor
    /// session keyed by the container id.
    pub async fn on_start(&self, container: &ContainerPortInfo) -> Result<()> {
        let host = Host::canonicalize("localhost");
        let container_tag = format!("container:{}", container.container_id);
        for binding in &container.bindings {
            let Some(host_port) = binding.host_port else { continue };
            let Ok(port) = PortNumber::new(host_port) else { continue };
            let key = format!("{}:{}:{}", host, port, binding.protocol);
            if let Ok(status) = self.conflicts.status(&host, port, binding.protocol).await {
                self.cache.monitor_state.set(
                    &key,
                    status,
                    &[&container_tag, &format!("port:{}", port.get())],
                );
            }
        }

        if self.config.monitor_running {
            let host = Host::canonicalize("localhost");
            let ports: Vec<(PortNumber, Protocol)> = container
                .bindings
                .iter()
                .filter_map(|b| b.host_port.and_then(|p| PortNumber::new(p).ok()).map(|p| (p, b.protocol)))
                .collect();

            if !ports.is_empty() {
                let owner_id = container_owner_id(&container.container_id);
                let (session_id, _rx) = self
                    .conflicts
                    .start_monitor(host, ports, 30, Some(owner_id))
                    .await;
                self.monitor_sessions.insert(container.container_id.clone(), session_id);
            }
        }

        let _ = self.events_tx.send(ContainerLifecycleEvent::Started(container.clone()));
        Ok(())
    }

    /// Stop the monitor session, release reservations if configured, and
    /// evict cached entries for the container.
    pub async fn on_stop(&self, container_id: &str) -> Result<()> {
        if let Some((_, session_id)) = self.monitor_sessions.remove(container_id) {
            let _ = self.conflicts.stop_monitor(&session_id);
        }

        if self.config.release_on_stop {
            let owner_id = container_owner_id(container_id);
            let released = self.reservations.release_all_for_owner(&owner_id).await?;
            if released > 0 {
                info!(container = %container_id, released, "released container-owned reservations on stop");
            }
        }

        let container_tag = format!("container:{}", container_id);
        self.cache.monitor_state.invalidate_tag(&container_tag);
        let _ = self.events_tx.send(ContainerLifecycleEvent::Stopped(container_id.to_string()));
        Ok(())
    }

    pub async fn get_container_ports(&self, container_id: &str) -> Result<ContainerPortInfo> {
        self.runtime.inspect(container_id).await
    }

    /// Every currently running container's port info, for `get_ports_in_use`
    /// enrichment. Falls back to an empty list when the runtime is
    /// unreachable rather than propagating the error — container metadata is
    /// an enrichment, not a correctness requirement of port reporting.
    pub async fn list_containers(&self) -> Vec<ContainerPortInfo> {
        self.runtime.list_running().await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::DefaultAvailabilityChecker;
    use crate::config::{CheckMethod, ReservationConfig};
    use crate::store::SqliteReservationStore;
    use std::time::Duration as StdDuration;

    struct FakeRuntime {
        containers: Vec<ContainerPortInfo>,
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn list_running(&self) -> Result<Vec<ContainerPortInfo>> {
            Ok(self.containers.clone())
        }

        async fn inspect(&self, container_id: &str) -> Result<ContainerPortInfo> {
            self.containers
                .iter()
                .find(|c| c.container_id == container_id)
                .cloned()
                .ok_or_else(|| ContainerError::NotFound {
                    container_id: container_id.to_string(),
                }
                .into())
        }

        async fn subscribe_events(&self) -> Result<broadcast::Receiver<RuntimeEvent>> {
            let (_tx, rx) = broadcast::channel(1);
            Ok(rx)
        }
    }

    fn container_with_host_port(container_id: &str, host_port: u16) -> ContainerPortInfo {
        ContainerPortInfo {
            container_id: container_id.to_string(),
            container_name: "web".to_string(),
            image: Some("nginx".to_string()),
            exposed_ports: vec![80],
            bindings: vec![PortBinding {
                container_port: 80,
                host_port: Some(host_port),
                host_ip: Some("0.0.0.0".to_string()),
                protocol: Protocol::Tcp,
            }],
            started_at: Utc::now(),
        }
    }

    async fn integration(containers: Vec<ContainerPortInfo>) -> ContainerIntegration {
        integration_with_config(containers, ContainerConfig::default()).await
    }

    async fn integration_with_config(containers: Vec<ContainerPortInfo>, config: ContainerConfig) -> ContainerIntegration {
        let store: Arc<dyn crate::store::ReservationStore> = Arc::new(SqliteReservationStore::in_memory().unwrap());
        store.initialize().await.unwrap();
        let checker: Arc<dyn crate::checker::AvailabilityChecker> = Arc::new(DefaultAvailabilityChecker::new(
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
        let conflicts = Arc::new(ConflictDetector::new(checker.clone(), reservations.clone(), cache.clone(), store));
        let suggestions = Arc::new(SuggestionEngine::new(
            checker,
            reservations.clone(),
            crate::config::SuggestionConfig::default(),
            Default::default(),
            vec![crate::config::PortRange::new(1024, 65535)],
        ));
        let runtime = Arc::new(FakeRuntime { containers });
        ContainerIntegration::new(runtime, reservations, conflicts, suggestions, cache, config)
    }

    #[tokio::test]
    async fn reconcile_reserves_published_host_ports() {
        let container = container_with_host_port("abc123", 28080);
        let integration = integration(vec![container]).await;
        let reserved = integration.reconcile().await.unwrap();
        assert_eq!(reserved, 1);

        let active = integration
            .reservations
            .get_active(PortNumber::new(28080).unwrap(), Protocol::Tcp)
            .await
            .unwrap();
        assert!(active.is_some());
    }

    #[tokio::test]
    async fn on_stop_releases_only_the_owning_containers_reservations() {
        let integration = integration(vec![
            container_with_host_port("abc123", 28081),
            container_with_host_port("def456", 28082),
        ])
        .await;
        integration.reconcile().await.unwrap();

        integration.on_stop("abc123").await.unwrap();

        let abc_port_released = integration
            .reservations
            .get_active(PortNumber::new(28081).unwrap(), Protocol::Tcp)
            .await
            .unwrap();
        assert!(abc_port_released.is_none());

        let def_port_still_held = integration
            .reservations
            .get_active(PortNumber::new(28082).unwrap(), Protocol::Tcp)
            .await
            .unwrap();
        assert!(def_port_still_held.is_some());
    }

    #[tokio::test]
    async fn on_stop_without_reservations_is_a_noop() {
        let integration = integration(vec![]).await;
        integration.on_stop("abc123").await.unwrap();
    }

    #[tokio::test]
    async fn validate_excludes_the_containers_own_reservation() {
        let container = container_with_host_port("abc123", 28090);
        let integration = integration(vec![container.clone()]).await;
        integration.reconcile().await.unwrap();

        let report = integration.validate(&container).await.unwrap();
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn pre_start_proceeds_and_reserves_when_clear() {
        let container = container_with_host_port("abc123", 28091);
        let integration = integration(vec![container.clone()]).await;

        let decision = integration.pre_start(&container).await.unwrap();
        assert!(decision.proceed);

        let active = integration
            .reservations
            .get_active(PortNumber::new(28091).unwrap(), Protocol::Tcp)
            .await
            .unwrap();
        assert!(active.is_some());
    }

    #[tokio::test]
    async fn pre_start_blocks_on_conflict_with_another_owner() {
        let port = PortNumber::new(28092).unwrap();
        let container = container_with_host_port("abc123", 28092);
        let integration = integration(vec![container.clone()]).await;

        integration
            .reservations
            .reserve(
                "someone-else",
                None,
                ReservationRequest {
                    port,
                    protocol: Protocol::Tcp,
                    duration_secs: Some(300),
                    metadata: Default::default(),
                },
            )
            .await
            .unwrap();

        let decision = integration.pre_start(&container).await.unwrap();
        assert!(!decision.proceed);
        assert!(decision.reason.is_some());
    }

    #[tokio::test]
    async fn on_start_spawns_a_monitor_session_when_configured() {
        let mut config = ContainerConfig::default();
        config.monitor_running = true;
        let container = container_with_host_port("abc123", 28093);
        let integration = integration_with_config(vec![container.clone()], config).await;

        integration.on_start(&container).await.unwrap();
        assert_eq!(integration.conflicts.active_session_count(), 1);

        integration.on_stop("abc123").await.unwrap();
        assert_eq!(integration.conflicts.active_session_count(), 0);
    }
}
