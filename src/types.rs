#![allow(dead_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A validated port number in `[1, 65535]`.
///
/// Construction rejects `0`, negative numbers, and values above `65535` so
/// the boundary cases in the port namespace are caught before they reach any
/// subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortNumber(u16);

impl PortNumber {
    pub fn new(value: u16) -> Result<Self, String> {
        if value == 0 {
            Err("port 0 is not a valid port".to_string())
        } else {
            Ok(Self(value))
        }
    }

    pub fn get(&self) -> u16 {
        self.0
    }
}

impl TryFrom<i64> for PortNumber {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if value <= 0 || value > 65535 {
            Err(format!("port {} is out of range [1, 65535]", value))
        } else {
            Ok(Self(value as u16))
        }
    }
}

impl TryFrom<u16> for PortNumber {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl fmt::Display for PortNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport protocol a port is bound on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A DNS name or IP literal identifying the target of a probe, canonicalized
/// so that `localhost`/`127.0.0.1`/`::1` all collapse to `"local"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Host(String);

impl Host {
    pub fn canonicalize(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed {
            "localhost" | "127.0.0.1" | "::1" | "local" => Host("local".to_string()),
            other => Host(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_local(&self) -> bool {
        self.0 == "local"
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A `(host, port, protocol)` tuple identifying a network endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortKey {
    pub host: Host,
    pub port: PortNumber,
    pub protocol: Protocol,
}

impl PortKey {
    pub fn new(host: Host, port: PortNumber, protocol: Protocol) -> Self {
        Self { host, port, protocol }
    }
}

/// Sentinel `expires_at` denoting a permanent lease.
pub fn forever() -> DateTime<Utc> {
    "9999-12-31T23:59:59Z".parse().expect("valid sentinel timestamp")
}

pub fn is_forever(at: DateTime<Utc>) -> bool {
    at >= forever()
}

/// Opaque metadata value: string, number, bool, or null — never a nested
/// object or array.
pub type Metadata = HashMap<String, serde_json::Value>;

/// A time-bounded claim on a port by an owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub port: PortNumber,
    pub protocol: Protocol,
    pub owner_id: String,
    pub owner_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub metadata: Metadata,
}

impl Reservation {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    pub fn is_permanent(&self) -> bool {
        is_forever(self.expires_at)
    }
}

/// Where a port-occupancy observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OccupancySource {
    System,
    Docker,
    Reservation,
    Unknown,
}

/// Transient view of a single port's status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortStatus {
    pub port: PortNumber,
    pub protocol: Protocol,
    pub available: bool,
    pub reserved: bool,
    pub owner_id: Option<String>,
    pub reserved_until: Option<DateTime<Utc>>,
    pub source: OccupancySource,
    pub service_label: Option<String>,
    pub label: Option<String>,
    pub documentation: Option<String>,
}

/// Conflict kinds fused by the Conflict Detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    SystemProcess,
    Reservation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub port: PortNumber,
    pub protocol: Protocol,
    pub kind: ConflictKind,
    pub severity: Severity,
    pub owner_id: Option<String>,
    pub reservation_expires: Option<DateTime<Utc>>,
}

/// Per-container port binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: Option<u16>,
    pub host_ip: Option<String>,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerPortInfo {
    pub container_id: String,
    pub container_name: String,
    pub image: Option<String>,
    pub exposed_ports: Vec<u16>,
    pub bindings: Vec<PortBinding>,
    pub started_at: DateTime<Utc>,
}

/// A single port's full enriched view for the `get_ports_in_use` external
/// operation: system occupancy, reservation ownership, container binding
/// (when the port belongs to a published container port), and any label or
/// documentation override — everything the original spec's §6 "enriched
/// port" shape names, fused from C1, C2/C3, and C6 in one record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedPort {
    pub port: u16,
    pub protocol: Protocol,
    pub in_use: bool,
    pub process_name: Option<String>,
    pub pid: Option<u32>,
    pub service_label: Option<String>,
    pub label: Option<String>,
    pub documentation: Option<String>,
    pub reservation_owner: Option<String>,
    pub reserved_until: Option<DateTime<Utc>>,
    pub container: Option<ContainerPortInfo>,
}

/// Static service-identification table. Matched case-insensitively against the
/// canonical lowercase name on the right; lookups normalize the caller's
/// string before comparing.
pub const SERVICE_TABLE: &[(u16, &str)] = &[
    (22, "SSH"),
    (53, "DNS"),
    (80, "HTTP"),
    (443, "HTTPS"),
    (3306, "MySQL"),
    (5432, "PostgreSQL"),
    (6379, "Redis"),
    (27017, "MongoDB"),
    (2375, "Docker-API"),
    (9090, "Prometheus"),
    (8096, "Jellyfin"),
    (32400, "Plex"),
];

pub fn service_label_for(port: u16) -> Option<&'static str> {
    SERVICE_TABLE
        .iter()
        .find(|(p, _)| *p == port)
        .map(|(_, name)| *name)
}

/// Ports considered "well known" for deployment-validation warnings.
pub const WELL_KNOWN_PORTS: &[u16] = &[22, 80, 443, 3306, 5432, 6379, 27017, 53, 8080, 8443];

pub fn is_well_known(port: u16) -> bool {
    WELL_KNOWN_PORTS.contains(&port) || port < 1024
}

pub fn is_privileged(port: u16) -> bool {
    port < 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_number_rejects_zero_and_overflow() {
        assert!(PortNumber::new(0).is_err());
        assert!(PortNumber::try_from(0i64).is_err());
        assert!(PortNumber::try_from(65536i64).is_err());
        assert!(PortNumber::try_from(-1i64).is_err());
        assert!(PortNumber::try_from(65535i64).is_ok());
    }

    #[test]
    fn host_canonicalizes_local_forms() {
        assert_eq!(Host::canonicalize("localhost").as_str(), "local");
        assert_eq!(Host::canonicalize("127.0.0.1").as_str(), "local");
        assert_eq!(Host::canonicalize("::1").as_str(), "local");
        assert_eq!(Host::canonicalize("example.com").as_str(), "example.com");
    }

    #[test]
    fn forever_is_far_future() {
        assert!(forever().to_string().starts_with("9999-12-31"));
        assert!(is_forever(forever()));
    }

    #[test]
    fn service_table_has_required_entries() {
        assert_eq!(service_label_for(22), Some("SSH"));
        assert_eq!(service_label_for(5432), Some("PostgreSQL"));
        assert_eq!(service_label_for(32400), Some("Plex"));
        assert_eq!(service_label_for(12345), None);
    }
}
