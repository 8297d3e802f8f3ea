use crate::checker::AvailabilityChecker;
use crate::config::{PortRange, SuggestionConfig};
use crate::error::{Result, SuggestionError};
use crate::reservation::ReservationManager;
use crate::types::{is_well_known, Host, PortNumber, Protocol};
use std::collections::HashSet;
use std::sync::Arc;

/// Lower bound for any suggested port.
const MIN_SUGGESTABLE_PORT: u16 = 1024;

/// Service category used to bias range-based suggestion fallback toward
/// conventional ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceHint {
    Web,
    Api,
    Database,
    Cache,
    Monitoring,
    Development,
    Custom,
}

impl ServiceHint {
    fn range(&self) -> (u16, u16) {
        match self {
            ServiceHint::Web => (8000, 8999),
            ServiceHint::Api => (3000, 3999),
            ServiceHint::Database => (5000, 5999),
            ServiceHint::Cache => (6000, 6999),
            ServiceHint::Monitoring => (9000, 9999),
            ServiceHint::Development => (4000, 4999),
            ServiceHint::Custom => (7000, 7999),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SuggestionRequest {
    pub preferred_port: Option<PortNumber>,
    /// The full requested port set, when the caller asked for alternatives
    /// to more than one port at once. Empty unless the caller is requesting a
    /// sequential block for a multi-port deployment.
    pub ports: Vec<PortNumber>,
    pub protocol: Protocol,
    pub service_hint: Option<ServiceHint>,
    pub count: Option<u32>,
    pub prefer_sequential: bool,
}

impl Default for SuggestionRequest {
    fn default() -> Self {
        Self {
            preferred_port: None,
            ports: Vec::new(),
            protocol: Protocol::Tcp,
            service_hint: None,
            count: None,
            prefer_sequential: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortSuggestion {
    pub port: PortNumber,
    pub distance_from_preferred: u32,
    pub strategy: &'static str,
    /// The full contiguous block this suggestion represents, when
    /// `strategy == "sequential_block"`; otherwise just `[port]`.
    pub block: Vec<u16>,
}

/// Finds available, unreserved ports using layered search strategies: a
/// sequential block starting at the preferred port, a proximity-ordered
/// nearby search, and a service-typed range fallback.
pub struct SuggestionEngine {
    checker: Arc<dyn AvailabilityChecker>,
    reservations: Arc<ReservationManager>,
    config: SuggestionConfig,
    excluded_ports: HashSet<u16>,
    port_ranges: Vec<PortRange>,
}

impl SuggestionEngine {
    pub fn new(
        checker: Arc<dyn AvailabilityChecker>,
        reservations: Arc<ReservationManager>,
        config: SuggestionConfig,
        excluded_ports: HashSet<u16>,
        port_ranges: Vec<PortRange>,
    ) -> Self {
        Self {
            checker,
            reservations,
            config,
            excluded_ports,
            port_ranges,
        }
    }

    /// Suitability predicate: in-range, not excluded, not well-known
    /// (when configured to avoid those), within the configured port ranges
    /// (when `respect_ranges`), available for at least one of the
    /// requested protocols, and not actively reserved.
    async fn is_suitable(&self, host: &Host, port: u16, protocol: Protocol) -> bool {
        self.is_suitable_with(host, port, protocol, self.config.avoid_well_known).await
    }

    async fn is_suitable_with(&self, host: &Host, port: u16, protocol: Protocol, avoid_well_known: bool) -> bool {
        if !(MIN_SUGGESTABLE_PORT..=65535).contains(&port) {
            return false;
        }
        if self.excluded_ports.contains(&port) {
            return false;
        }
        if avoid_well_known && is_well_known(port) {
            return false;
        }
        if self.config.respect_ranges && !self.port_ranges.iter().any(|r| r.contains(port)) {
            return false;
        }
        let Ok(port_number) = PortNumber::new(port) else {
            return false;
        };
        if self.reservations.get_active(port_number, protocol).await.ok().flatten().is_some() {
            return false;
        }
        self.checker.is_available(host, port_number, protocol).await
    }

    /// Run the full layered search, returning up to `max_suggestions`
    /// candidates ordered best-first.
    pub async fn suggest(&self, host: &Host, request: SuggestionRequest) -> Result<Vec<PortSuggestion>> {
        let max = request.count.unwrap_or(self.config.max_suggestions).max(1) as usize;

        if request.prefer_sequential && request.ports.len() > 1 {
            return self.suggest_sequential_blocks(host, &request.ports, request.protocol, max).await;
        }

        let mut found = Vec::new();

        if let Some(preferred) = request.preferred_port {
            found.extend(self.sequential_block(host, preferred, request.protocol, max).await);
        }

        if found.len() < max {
            if let Some(preferred) = request.preferred_port {
                let remaining = max - found.len();
                let nearby = self.nearby_search(host, preferred, request.protocol, remaining).await;
                for suggestion in nearby {
                    if !found.iter().any(|s: &PortSuggestion| s.port == suggestion.port) {
                        found.push(suggestion);
                    }
                }
            }
        }

        if found.len() < max {
            let remaining = max - found.len();
            let hint = request.service_hint.unwrap_or(ServiceHint::Custom);
            let ranged = self.range_fallback(host, hint, request.protocol, remaining).await;
            for suggestion in ranged {
                if !found.iter().any(|s: &PortSuggestion| s.port == suggestion.port) {
                    found.push(suggestion);
                }
            }
        }

        // Too few results with avoid_well_known on: retry the preferred port's
        // nearby search with well-known ports allowed and merge, deduplicated.
        if found.len() < max && self.config.avoid_well_known {
            if let Some(preferred) = request.preferred_port {
                let remaining = max - found.len();
                let relaxed = self.nearby_search_relaxed(host, preferred, request.protocol, remaining).await;
                for suggestion in relaxed {
                    if !found.iter().any(|s: &PortSuggestion| s.port == suggestion.port) {
                        found.push(suggestion);
                    }
                }
            }
        }

        if found.is_empty() {
            return Err(SuggestionError::Exhausted.into());
        }

        found.truncate(max);
        Ok(found)
    }

    /// Same search as `nearby_search` but with `avoid_well_known` forced off,
    /// used as a last resort when the strict search came up short.
    async fn nearby_search_relaxed(
        &self,
        host: &Host,
        preferred: PortNumber,
        protocol: Protocol,
        max: usize,
    ) -> Vec<PortSuggestion> {
        let start = preferred.get() as i32;
        let range = self.config.nearby_range as i32;

        let mut candidates: Vec<i32> = (1..=range).flat_map(|d| [start + d, start - d]).collect();
        candidates.retain(|&p| p >= 1 && p <= 65535);

        let mut results = Vec::new();
        for candidate in candidates {
            let port = candidate as u16;
            if self.is_suitable_with(host, port, protocol, false).await {
                results.push(PortSuggestion {
                    port: PortNumber::new(port).unwrap(),
                    distance_from_preferred: (candidate - start).unsigned_abs(),
                    strategy: "nearby_relaxed",
                    block: vec![port],
                });
                if results.len() >= max {
                    break;
                }
            }
        }
        results
    }

    /// Scan a contiguous block immediately after the preferred port.
    async fn sequential_block(
        &self,
        host: &Host,
        preferred: PortNumber,
        protocol: Protocol,
        max: usize,
    ) -> Vec<PortSuggestion> {
        let mut results = Vec::new();
        let start = preferred.get();
        for offset in 0..=20u32 {
            let Some(candidate) = start.checked_add(offset as u16) else {
                break;
            };
            if self.is_suitable(host, candidate, protocol).await {
                results.push(PortSuggestion {
                    port: PortNumber::new(candidate).unwrap(),
                    distance_from_preferred: offset,
                    strategy: "sequential",
                    block: vec![candidate],
                });
                if results.len() >= max {
                    break;
                }
            }
        }
        results
    }

    /// Search for a contiguous block of `ports.len()` suitable ports for a
    /// multi-port deployment request: windows starting in
    /// `[base, base+nearby_range]` first, then `[base-nearby_range, base]`,
    /// then progressively further out, stopping at the first
    /// `max_suggestions` viable blocks found.
    async fn suggest_sequential_blocks(
        &self,
        host: &Host,
        ports: &[PortNumber],
        protocol: Protocol,
        max_suggestions: usize,
    ) -> Result<Vec<PortSuggestion>> {
        let block_size = ports.len() as u16;
        let base = ports.iter().map(|p| p.get()).min().unwrap_or(1024) as i32;
        let range = self.config.nearby_range as i32;

        let mut offsets: Vec<i32> = Vec::new();
        offsets.push(0);
        for d in 1..=range {
            offsets.push(d);
            offsets.push(-d);
        }
        // Beyond the nearby window, keep widening in both directions so a
        // block is eventually found even in a dense port space.
        for d in (range + 1)..=(range * 4).max(range + 200) {
            offsets.push(d);
            offsets.push(-d);
        }

        let mut found = Vec::new();
        for offset in offsets {
            let Some(window_start) = base.checked_add(offset) else { continue };
            if window_start < MIN_SUGGESTABLE_PORT as i32 {
                continue;
            }
            let Some(window_end) = window_start.checked_add(block_size as i32 - 1) else { continue };
            if window_end > 65535 {
                continue;
            }

            let mut block: Vec<u16> = Vec::with_capacity(block_size as usize);
            let mut viable = true;
            for p in window_start..=window_end {
                if self.is_suitable(host, p as u16, protocol).await {
                    block.push(p as u16);
                } else {
                    viable = false;
                    break;
                }
            }

            if viable {
                found.push(PortSuggestion {
                    port: PortNumber::new(block[0]).unwrap(),
                    distance_from_preferred: offset.unsigned_abs(),
                    strategy: "sequential_block",
                    block,
                });
                if found.len() >= max_suggestions {
                    break;
                }
            }
        }

        if found.is_empty() {
            return Err(SuggestionError::Exhausted.into());
        }
        Ok(found)
    }

    /// Breadth-first search outward from the preferred port within
    /// `nearby_range`, sorted by absolute distance.
    async fn nearby_search(
        &self,
        host: &Host,
        preferred: PortNumber,
        protocol: Protocol,
        max: usize,
    ) -> Vec<PortSuggestion> {
        let start = preferred.get() as i32;
        let range = self.config.nearby_range as i32;

        let mut candidates: Vec<i32> = (1..=range).flat_map(|d| [start + d, start - d]).collect();
        candidates.retain(|&p| p >= 1 && p <= 65535);

        let mut results = Vec::new();
        for candidate in candidates {
            let port = candidate as u16;
            if self.is_suitable(host, port, protocol).await {
                results.push(PortSuggestion {
                    port: PortNumber::new(port).unwrap(),
                    distance_from_preferred: (candidate - start).unsigned_abs(),
                    strategy: "nearby",
                    block: vec![port],
                });
                if results.len() >= max {
                    break;
                }
            }
        }
        results
    }

    /// Fall back to scanning a conventional service-typed range, capped at
    /// `range_scan_cap` ports per call to bound worst-case latency.
    async fn range_fallback(
        &self,
        host: &Host,
        hint: ServiceHint,
        protocol: Protocol,
        max: usize,
    ) -> Vec<PortSuggestion> {
        let (start, end) = hint.range();
        let cap = self.config.range_scan_cap.min(end - start + 1);

        let mut results = Vec::new();
        for port in start..=end.min(start.saturating_add(cap)) {
            if self.is_suitable(host, port, protocol).await {
                results.push(PortSuggestion {
                    port: PortNumber::new(port).unwrap(),
                    distance_from_preferred: 0,
                    strategy: "range",
                    block: vec![port],
                });
                if results.len() >= max {
                    break;
                }
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::DefaultAvailabilityChecker;
    use crate::config::{CheckMethod, ReservationConfig};
    use crate::store::SqliteReservationStore;
    use std::time::Duration as StdDuration;

    async fn engine() -> SuggestionEngine {
        let store = SqliteReservationStore::in_memory().unwrap();
        store.initialize().await.unwrap();
        let checker = Arc::new(DefaultAvailabilityChecker::new(
            CheckMethod::Socket,
            StdDuration::from_millis(100),
            None,
        ));
        let reservations = Arc::new(ReservationManager::new(
            Arc::new(store),
            checker.clone(),
            ReservationConfig::default(),
        ));
        SuggestionEngine::new(
            checker,
            reservations,
            SuggestionConfig::default(),
            Default::default(),
            vec![crate::config::PortRange::new(1024, 65535)],
        )
    }

    #[tokio::test]
    async fn suggest_returns_at_least_one_port_in_range_fallback() {
        let engine = engine().await;
        let host = Host::canonicalize("localhost");
        let request = SuggestionRequest {
            service_hint: Some(ServiceHint::Api),
            count: Some(3),
            ..Default::default()
        };
        let suggestions = engine.suggest(&host, request).await.unwrap();
        assert!(!suggestions.is_empty());
        assert!(suggestions.len() <= 3);
    }

    #[tokio::test]
    async fn avoid_well_known_excludes_service_table_ports() {
        let engine = engine().await;
        let host = Host::canonicalize("localhost");
        assert!(!engine.is_suitable(&host, 443, Protocol::Tcp).await);
    }

    #[tokio::test]
    async fn excluded_port_is_never_suggested() {
        let store = SqliteReservationStore::in_memory().unwrap();
        store.initialize().await.unwrap();
        let checker = Arc::new(DefaultAvailabilityChecker::new(
            CheckMethod::Socket,
            StdDuration::from_millis(100),
            None,
        ));
        let reservations = Arc::new(ReservationManager::new(
            Arc::new(store),
            checker.clone(),
            ReservationConfig::default(),
        ));
        let mut excluded = std::collections::HashSet::new();
        excluded.insert(9001u16);
        let engine = SuggestionEngine::new(
            checker,
            reservations,
            SuggestionConfig::default(),
            excluded,
            vec![crate::config::PortRange::new(1024, 65535)],
        );
        let host = Host::canonicalize("localhost");
        assert!(!engine.is_suitable(&host, 9001, Protocol::Tcp).await);
    }

    #[tokio::test]
    async fn sequential_block_finds_contiguous_run_skipping_excluded() {
        let store = SqliteReservationStore::in_memory().unwrap();
        store.initialize().await.unwrap();
        let checker = Arc::new(DefaultAvailabilityChecker::new(
            CheckMethod::Socket,
            StdDuration::from_millis(100),
            None,
        ));
        let reservations = Arc::new(ReservationManager::new(
            Arc::new(store),
            checker.clone(),
            ReservationConfig::default(),
        ));
        let mut excluded = std::collections::HashSet::new();
        excluded.insert(30001u16);
        let engine = SuggestionEngine::new(
            checker,
            reservations,
            SuggestionConfig::default(),
            excluded,
            vec![crate::config::PortRange::new(1024, 65535)],
        );
        let host = Host::canonicalize("localhost");
        let request = SuggestionRequest {
            ports: vec![
                PortNumber::new(30000).unwrap(),
                PortNumber::new(30001).unwrap(),
                PortNumber::new(30002).unwrap(),
            ],
            prefer_sequential: true,
            count: Some(1),
            ..Default::default()
        };
        let suggestions = engine.suggest(&host, request).await.unwrap();
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].block.len(), 3);
        assert!(!suggestions[0].block.contains(&30001));
    }
}
