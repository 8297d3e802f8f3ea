use crate::checker::AvailabilityChecker;
use crate::config::ReservationConfig;
use crate::error::{ReservationError, Result};
use crate::store::ReservationStore;
use crate::types::{forever, Host, Metadata, PortNumber, Protocol, Reservation};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// A single port/protocol request within a batch reservation call.
#[derive(Debug, Clone)]
pub struct ReservationRequest {
    pub port: PortNumber,
    pub protocol: Protocol,
    pub duration_secs: Option<u64>,
    pub metadata: Metadata,
}

/// Policy layer over the durable store. Enforces duration clamping, the
/// FOREVER sentinel, per-owner caps, and pre-flight conflict checks against
/// both the store and live system state. The store itself has no opinion on
/// any of this — it only persists what it is told to.
pub struct ReservationManager {
    store: Arc<dyn ReservationStore>,
    checker: Arc<dyn AvailabilityChecker>,
    config: ReservationConfig,
}

impl ReservationManager {
    pub fn new(
        store: Arc<dyn ReservationStore>,
        checker: Arc<dyn AvailabilityChecker>,
        config: ReservationConfig,
    ) -> Self {
        Self { store, checker, config }
    }

    /// Clamp a requested duration into `[60s, max_duration_secs]`, treating
    /// any request of a century or more as an explicit FOREVER lease.
    fn resolve_expiry(&self, requested_secs: Option<u64>) -> DateTime<Utc> {
        let requested = requested_secs.unwrap_or(self.config.default_duration_secs);

        const CENTURY_SECS: u64 = 100 * 365 * 24 * 3600;
        if requested >= CENTURY_SECS {
            return forever();
        }

        let clamped = requested.clamp(60, self.config.max_duration_secs);
        Utc::now() + ChronoDuration::seconds(clamped as i64)
    }

    /// Create a single reservation, enforcing owner caps and conflict checks.
    pub async fn reserve(
        &self,
        owner_id: &str,
        owner_name: Option<String>,
        request: ReservationRequest,
    ) -> Result<Reservation> {
        self.check_owner_cap(owner_id).await?;
        self.check_conflict(owner_id, request.port, request.protocol).await?;

        let reservation = Reservation {
            id: Uuid::new_v4().to_string(),
            port: request.port,
            protocol: request.protocol,
            owner_id: owner_id.to_string(),
            owner_name,
            created_at: Utc::now(),
            expires_at: self.resolve_expiry(request.duration_secs),
            metadata: request.metadata,
        };

        self.store.create(&reservation).await?;
        info!(port = %reservation.port, owner = %owner_id, "reservation created");
        Ok(reservation)
    }

    /// Atomic all-or-nothing batch reservation. Duplicate ports within the
    /// same request are rejected before anything is persisted.
    pub async fn reserve_batch(
        &self,
        owner_id: &str,
        owner_name: Option<String>,
        requests: Vec<ReservationRequest>,
    ) -> Result<Vec<Reservation>> {
        let mut seen = std::collections::HashSet::new();
        for req in &requests {
            if !seen.insert((req.port, req.protocol)) {
                return Err(ReservationError::InvalidInput {
                    reason: format!("duplicate port {} in a single batch request", req.port),
                }
                .into());
            }
        }

        let projected_count = self.store.count_active_for_owner(owner_id).await? + requests.len() as u32;
        if projected_count > self.config.max_per_owner {
            return Err(ReservationError::OwnerLimitExceeded {
                owner: owner_id.to_string(),
                max: self.config.max_per_owner,
            }
            .into());
        }

        let mut conflicts = Vec::new();
        for req in &requests {
            if self.check_conflict(owner_id, req.port, req.protocol).await.is_err() {
                conflicts.push(req.port.get());
            }
        }
        if !conflicts.is_empty() {
            return Err(ReservationError::PortConflict { ports: conflicts }.into());
        }

        let mut created = Vec::with_capacity(requests.len());
        for req in requests {
            let reservation = Reservation {
                id: Uuid::new_v4().to_string(),
                port: req.port,
                protocol: req.protocol,
                owner_id: owner_id.to_string(),
                owner_name: owner_name.clone(),
                created_at: Utc::now(),
                expires_at: self.resolve_expiry(req.duration_secs),
                metadata: req.metadata,
            };
            if let Err(e) = self.store.create(&reservation).await {
                warn!("batch reservation failed partway, rolling back created entries");
                for rollback in &created {
                    let r: &Reservation = rollback;
                    let _ = self.store.release(r.port, r.protocol).await;
                }
                return Err(e);
            }
            created.push(reservation);
        }

        Ok(created)
    }

    pub async fn release(&self, owner_id: &str, port: PortNumber, protocol: Protocol) -> Result<()> {
        let existing = self.store.get_active(port, protocol).await?;
        match existing {
            Some(reservation) if reservation.owner_id == owner_id => {
                self.store.release(port, protocol).await?;
                Ok(())
            }
            Some(_) => Err(ReservationError::NotOwner.into()),
            None => Ok(()),
        }
    }

    pub async fn release_all_for_owner(&self, owner_id: &str) -> Result<u32> {
        self.store.release_all(owner_id).await
    }

    /// Extend an existing lease, respecting the `allow_extension` policy and
    /// re-applying the same duration clamping as initial creation.
    pub async fn extend(
        &self,
        owner_id: &str,
        port: PortNumber,
        protocol: Protocol,
        additional_secs: u64,
    ) -> Result<Reservation> {
        if !self.config.allow_extension {
            return Err(ReservationError::NotAllowed {
                reason: "extension is disabled by policy".to_string(),
            }
            .into());
        }

        let existing = self
            .store
            .get_active(port, protocol)
            .await?
            .ok_or_else(|| ReservationError::InvalidInput {
                reason: format!("no active reservation for {}/{}", port, protocol),
            })?;

        if existing.owner_id != owner_id {
            return Err(ReservationError::NotOwner.into());
        }

        let new_expiry = if existing.is_permanent() {
            forever()
        } else {
            let extended = (existing.expires_at - Utc::now()).num_seconds().max(0) as u64 + additional_secs;
            self.resolve_expiry(Some(extended))
        };

        self.store.extend(port, protocol, new_expiry).await?;

        let mut updated = existing;
        updated.expires_at = new_expiry;
        Ok(updated)
    }

    pub async fn get_active(&self, port: PortNumber, protocol: Protocol) -> Result<Option<Reservation>> {
        self.store.get_active(port, protocol).await
    }

    pub async fn get_by_owner(&self, owner_id: &str) -> Result<Vec<Reservation>> {
        self.store.get_by_owner(owner_id).await
    }

    async fn check_owner_cap(&self, owner_id: &str) -> Result<()> {
        let current = self.store.count_active_for_owner(owner_id).await?;
        if current >= self.config.max_per_owner {
            return Err(ReservationError::OwnerLimitExceeded {
                owner: owner_id.to_string(),
                max: self.config.max_per_owner,
            }
            .into());
        }
        Ok(())
    }

    /// Reject a request when the port is already reserved by a different
    /// owner or is currently occupied on the system. A reservation already
    /// held by `owner_id` itself is not a conflict.
    async fn check_conflict(&self, owner_id: &str, port: PortNumber, protocol: Protocol) -> Result<()> {
        if let Some(existing) = self.store.get_active(port, protocol).await? {
            if existing.owner_id != owner_id {
                return Err(ReservationError::PortConflict {
                    ports: vec![existing.port.get()],
                }
                .into());
            }
        }

        let host = Host::canonicalize("localhost");
        if !self.checker.is_available(&host, port, protocol).await {
            return Err(ReservationError::PortConflict {
                ports: vec![port.get()],
            }
            .into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::DefaultAvailabilityChecker;
    use crate::config::CheckMethod;
    use crate::store::SqliteReservationStore;
    use std::collections::HashMap;
    use std::time::Duration as StdDuration;

    async fn manager() -> ReservationManager {
        let store = SqliteReservationStore::in_memory().unwrap();
        store.initialize().await.unwrap();
        let checker =
            DefaultAvailabilityChecker::new(CheckMethod::Socket, StdDuration::from_millis(100), None);
        ReservationManager::new(Arc::new(store), Arc::new(checker), ReservationConfig::default())
    }

    #[tokio::test]
    async fn duration_near_century_becomes_forever() {
        let mgr = manager().await;
        let expiry = mgr.resolve_expiry(Some(100 * 365 * 24 * 3600));
        assert!(crate::types::is_forever(expiry));
    }

    #[tokio::test]
    async fn short_duration_is_clamped_to_minimum() {
        let mgr = manager().await;
        let expiry = mgr.resolve_expiry(Some(5));
        let delta = (expiry - Utc::now()).num_seconds();
        assert!(delta >= 55 && delta <= 65);
    }

    #[tokio::test]
    async fn batch_rejects_internal_duplicate_ports() {
        let mgr = manager().await;
        let requests = vec![
            ReservationRequest {
                port: PortNumber::new(19000).unwrap(),
                protocol: Protocol::Tcp,
                duration_secs: None,
                metadata: HashMap::new(),
            },
            ReservationRequest {
                port: PortNumber::new(19000).unwrap(),
                protocol: Protocol::Tcp,
                duration_secs: None,
                metadata: HashMap::new(),
            },
        ];
        let result = mgr.reserve_batch("alice", None, requests).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn release_by_non_owner_is_rejected() {
        let mgr = manager().await;
        let request = ReservationRequest {
            port: PortNumber::new(19100).unwrap(),
            protocol: Protocol::Tcp,
            duration_secs: Some(300),
            metadata: HashMap::new(),
        };
        mgr.reserve("alice", None, request).await.unwrap();
        let result = mgr
            .release("bob", PortNumber::new(19100).unwrap(), Protocol::Tcp)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn owner_can_re_reserve_its_own_active_port() {
        let mgr = manager().await;
        let port = PortNumber::new(19200).unwrap();
        let first = ReservationRequest {
            port,
            protocol: Protocol::Tcp,
            duration_secs: Some(300),
            metadata: HashMap::new(),
        };
        mgr.reserve("alice", None, first).await.unwrap();

        let second = ReservationRequest {
            port,
            protocol: Protocol::Tcp,
            duration_secs: Some(600),
            metadata: HashMap::new(),
        };
        let renewed = mgr.reserve("alice", None, second).await.unwrap();
        assert_eq!(renewed.owner_id, "alice");

        let active = mgr.get_active(port, Protocol::Tcp).await.unwrap().unwrap();
        assert_eq!(active.id, renewed.id);
    }

    #[tokio::test]
    async fn different_owner_conflicts_on_active_port() {
        let mgr = manager().await;
        let port = PortNumber::new(19300).unwrap();
        let first = ReservationRequest {
            port,
            protocol: Protocol::Tcp,
            duration_secs: Some(300),
            metadata: HashMap::new(),
        };
        mgr.reserve("alice", None, first).await.unwrap();

        let second = ReservationRequest {
            port,
            protocol: Protocol::Tcp,
            duration_secs: Some(300),
            metadata: HashMap::new(),
        };
        let result = mgr.reserve("bob", None, second).await;
        assert!(matches!(
            result,
            Err(crate::error::PortGuardError::Reservation(
                ReservationError::PortConflict { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn expired_reservation_does_not_block_fresh_create() {
        let store = SqliteReservationStore::in_memory().unwrap();
        store.initialize().await.unwrap();
        let port = PortNumber::new(19400).unwrap();
        let expired = Reservation {
            id: Uuid::new_v4().to_string(),
            port,
            protocol: Protocol::Tcp,
            owner_id: "alice".to_string(),
            owner_name: None,
            created_at: Utc::now() - ChronoDuration::seconds(120),
            expires_at: Utc::now() - ChronoDuration::seconds(60),
            metadata: HashMap::new(),
        };
        store.create(&expired).await.unwrap();

        let fresh = Reservation {
            id: Uuid::new_v4().to_string(),
            port,
            protocol: Protocol::Tcp,
            owner_id: "bob".to_string(),
            owner_name: None,
            created_at: Utc::now(),
            expires_at: Utc::now() + ChronoDuration::seconds(300),
            metadata: HashMap::new(),
        };
        store.create(&fresh).await.unwrap();

        let active = store.get_active(port, Protocol::Tcp).await.unwrap().unwrap();
        assert_eq!(active.owner_id, "bob");
    }
}
