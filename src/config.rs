use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Probe method selection for the Availability Checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckMethod {
    Socket,
    Netstat,
    Ss,
}

impl Default for CheckMethod {
    fn default() -> Self {
        CheckMethod::Socket
    }
}

/// A single inclusive port range, e.g. `3000-9999`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn as_range(&self) -> RangeInclusive<u16> {
        self.start..=self.end
    }
}

/// Main configuration for the port guard core.
///
/// Loaded once at construction. The core never reads environment variables
/// directly; only the `portguardd` binary may apply CLI/env overrides before
/// building this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub port_ranges: Vec<PortRange>,
    pub excluded_ports: HashSet<u16>,
    pub scan_interval_secs: u64,
    pub check_timeout_secs: u64,
    pub check_method: CheckMethod,
    pub cache_ttl_secs: u64,
    pub host_ip: Option<String>,
    pub real_time_monitoring: bool,
    pub reservation: ReservationConfig,
    pub suggestion: SuggestionConfig,
    pub container: ContainerConfig,
    pub logging: LoggingConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationConfig {
    pub default_duration_secs: u64,
    pub max_duration_secs: u64,
    pub max_per_owner: u32,
    pub allow_extension: bool,
    pub gc_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestionConfig {
    pub nearby_range: u16,
    pub max_suggestions: u32,
    pub avoid_well_known: bool,
    pub respect_ranges: bool,
    pub range_scan_cap: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub auto_reserve: bool,
    pub suggest_alternatives: bool,
    pub monitor_running: bool,
    pub release_on_stop: bool,
    pub reservation_duration_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub console_enabled: bool,
    pub file_enabled: bool,
    pub log_dir: PathBuf,
    pub file_prefix: String,
    pub rotation: String,
    pub json_format: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub db_path: Option<PathBuf>,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            default_duration_secs: 3600,
            max_duration_secs: 30 * 24 * 3600,
            max_per_owner: 100,
            allow_extension: true,
            gc_interval_secs: 60,
        }
    }
}

impl Default for SuggestionConfig {
    fn default() -> Self {
        Self {
            nearby_range: 20,
            max_suggestions: 5,
            avoid_well_known: true,
            respect_ranges: true,
            range_scan_cap: 200,
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            auto_reserve: true,
            suggest_alternatives: true,
            monitor_running: true,
            release_on_stop: true,
            reservation_duration_secs: 3600,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console_enabled: true,
            file_enabled: true,
            log_dir: PathBuf::from("logs"),
            file_prefix: "portguard".to_string(),
            rotation: "daily".to_string(),
            json_format: false,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { db_path: None }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port_ranges: vec![PortRange::new(3000, 9999)],
            excluded_ports: HashSet::new(),
            scan_interval_secs: 30,
            check_timeout_secs: 1,
            check_method: CheckMethod::default(),
            cache_ttl_secs: 5,
            host_ip: None,
            real_time_monitoring: true,
            reservation: ReservationConfig::default(),
            suggestion: SuggestionConfig::default(),
            container: ContainerConfig::default(),
            logging: LoggingConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML or JSON file, or write out and return
    /// the default configuration if the file does not yet exist.
    pub async fn load(config_path: Option<&Path>) -> Result<Self> {
        let config_file = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path(),
        };

        let config = if config_file.exists() {
            let content = fs::read_to_string(&config_file).await?;
            if config_file.extension().and_then(|s| s.to_str()) == Some("toml") {
                toml::from_str(&content)?
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            let config = Self::default();
            if let Some(parent) = config_file.parent() {
                fs::create_dir_all(parent).await?;
            }
            let serialized = serde_json::to_string_pretty(&config)?;
            fs::write(&config_file, serialized).await?;
            config
        };

        config.validate()?;
        Ok(config)
    }

    fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("portguard")
            .join("config.json")
    }

    /// Validate internal consistency of the loaded configuration.
    pub fn validate(&self) -> Result<()> {
        if self.port_ranges.is_empty() {
            return Err(ConfigError::ValidationFailed {
                field: "port_ranges".to_string(),
                reason: "at least one port range must be configured".to_string(),
            }
            .into());
        }

        for range in &self.port_ranges {
            if range.start == 0 || range.start > range.end {
                return Err(ConfigError::ValidationFailed {
                    field: "port_ranges".to_string(),
                    reason: format!("invalid range {}-{}", range.start, range.end),
                }
                .into());
            }
        }

        if self.reservation.default_duration_secs < 60 {
            return Err(ConfigError::ValidationFailed {
                field: "reservation.default_duration_secs".to_string(),
                reason: "default duration must be at least 60s".to_string(),
            }
            .into());
        }

        if self.reservation.max_duration_secs < self.reservation.default_duration_secs {
            return Err(ConfigError::ValidationFailed {
                field: "reservation.max_duration_secs".to_string(),
                reason: "max duration must be >= default duration".to_string(),
            }
            .into());
        }

        Ok(())
    }

    pub fn is_excluded(&self, port: u16) -> bool {
        self.excluded_ports.contains(&port)
    }

    pub fn is_in_configured_ranges(&self, port: u16) -> bool {
        self.port_ranges.iter().any(|r| r.contains(port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_empty_port_ranges() {
        let mut config = Config::default();
        config.port_ranges.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_range() {
        let mut config = Config::default();
        config.port_ranges = vec![PortRange::new(9000, 8000)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_max_duration_below_default() {
        let mut config = Config::default();
        config.reservation.max_duration_secs = 30;
        config.reservation.default_duration_secs = 60;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn load_writes_default_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config::load(Some(&path)).await.unwrap();
        assert!(path.exists());
        assert_eq!(config.scan_interval_secs, 30);
    }
}
