use thiserror::Error;

/// Top-level error type for the port guard core.
#[derive(Error, Debug, Clone)]
pub enum PortGuardError {
    #[error("Configuration error: {0}")]
    Config(ConfigError),

    #[error("Availability check error: {0}")]
    Checker(CheckerError),

    #[error("Reservation store error: {0}")]
    Store(StoreError),

    #[error("Reservation error: {0}")]
    Reservation(ReservationError),

    #[error("Conflict detector error: {0}")]
    Conflict(ConflictError),

    #[error("Suggestion engine error: {0}")]
    Suggestion(SuggestionError),

    #[error("Container integration error: {0}")]
    Container(ContainerError),

    #[error("Scheduler error: {0}")]
    Scheduler(SchedulerError),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("TOML error: {0}")]
    Toml(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Anyhow error: {0}")]
    Anyhow(String),
}

/// Configuration-related errors.
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration validation failed: {field}: {reason}")]
    ValidationFailed { field: String, reason: String },
}

/// Availability checker errors.
#[derive(Error, Debug, Clone)]
pub enum CheckerError {
    #[error("Probe tool unavailable: {tool}")]
    ProbeUnavailable { tool: String },

    #[error("Probe timed out for {host}:{port}")]
    ProbeTimeout { host: String, port: u16, fail_closed: bool },

    #[error("Scan of system ports failed: {reason}")]
    ScanFailure { reason: String },

    #[error("DNS resolution failed for host: {host}")]
    DnsFailure { host: String },

    #[error("No host IP candidate was reachable")]
    HostUnreachable,
}

/// Reservation store errors.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Store has not been initialized")]
    NotInitialized,

    #[error("Underlying persistence failure: {reason}")]
    Backend { reason: String },

    #[error("Migration failed at version {version}: {reason}")]
    MigrationFailed { version: i32, reason: String },
}

/// Reservation manager policy errors.
#[derive(Error, Debug, Clone)]
pub enum ReservationError {
    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("Owner {owner} has reached its reservation limit of {max}")]
    OwnerLimitExceeded { owner: String, max: u32 },

    #[error("Port conflict on: {ports:?}")]
    PortConflict { ports: Vec<u16> },

    #[error("Caller is not the owner of this reservation")]
    NotOwner,

    #[error("Operation not allowed by policy: {reason}")]
    NotAllowed { reason: String },
}

/// Conflict detector errors.
#[derive(Error, Debug, Clone)]
pub enum ConflictError {
    #[error("Monitor session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Conflict evaluation failed: {reason}")]
    EvaluationFailed { reason: String },
}

/// Suggestion engine errors.
#[derive(Error, Debug, Clone)]
pub enum SuggestionError {
    #[error("No suitable ports found within search bounds")]
    Exhausted,

    #[error("Invalid suggestion request: {reason}")]
    InvalidRequest { reason: String },
}

/// Container integration errors.
#[derive(Error, Debug, Clone)]
pub enum ContainerError {
    #[error("Container runtime unavailable: {reason}")]
    RuntimeUnavailable { reason: String },

    #[error("Container not found: {container_id}")]
    NotFound { container_id: String },

    #[error("Deployment validation failed: {reason}")]
    ValidationFailed { reason: String },
}

/// Monitor supervisor errors.
#[derive(Error, Debug, Clone)]
pub enum SchedulerError {
    #[error("Supervisor already initialized")]
    AlreadyInitialized,

    #[error("Supervisor not running")]
    NotRunning,

    #[error("Shutdown did not complete within deadline")]
    ShutdownTimeout,
}

pub type Result<T> = std::result::Result<T, PortGuardError>;

impl From<ConfigError> for PortGuardError {
    fn from(err: ConfigError) -> Self {
        PortGuardError::Config(err)
    }
}

impl From<CheckerError> for PortGuardError {
    fn from(err: CheckerError) -> Self {
        PortGuardError::Checker(err)
    }
}

impl From<StoreError> for PortGuardError {
    fn from(err: StoreError) -> Self {
        PortGuardError::Store(err)
    }
}

impl From<ReservationError> for PortGuardError {
    fn from(err: ReservationError) -> Self {
        PortGuardError::Reservation(err)
    }
}

impl From<ConflictError> for PortGuardError {
    fn from(err: ConflictError) -> Self {
        PortGuardError::Conflict(err)
    }
}

impl From<SuggestionError> for PortGuardError {
    fn from(err: SuggestionError) -> Self {
        PortGuardError::Suggestion(err)
    }
}

impl From<ContainerError> for PortGuardError {
    fn from(err: ContainerError) -> Self {
        PortGuardError::Container(err)
    }
}

impl From<SchedulerError> for PortGuardError {
    fn from(err: SchedulerError) -> Self {
        PortGuardError::Scheduler(err)
    }
}

impl From<std::io::Error> for PortGuardError {
    fn from(err: std::io::Error) -> Self {
        PortGuardError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PortGuardError {
    fn from(err: serde_json::Error) -> Self {
        PortGuardError::Json(err.to_string())
    }
}

impl From<toml::de::Error> for PortGuardError {
    fn from(err: toml::de::Error) -> Self {
        PortGuardError::Toml(err.to_string())
    }
}

impl From<rusqlite::Error> for PortGuardError {
    fn from(err: rusqlite::Error) -> Self {
        PortGuardError::Database(err.to_string())
    }
}

impl From<anyhow::Error> for PortGuardError {
    fn from(err: anyhow::Error) -> Self {
        PortGuardError::Anyhow(err.to_string())
    }
}

/// Error severity levels, used for log routing and alert counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Low => "LOW",
            ErrorSeverity::Medium => "MEDIUM",
            ErrorSeverity::High => "HIGH",
        }
    }
}

impl PortGuardError {
    /// Whether a caller may reasonably retry this operation.
    pub fn is_recoverable(&self) -> bool {
        match self {
            PortGuardError::Checker(CheckerError::ProbeTimeout { .. }) => true,
            PortGuardError::Checker(CheckerError::ProbeUnavailable { .. }) => true,
            PortGuardError::Container(ContainerError::RuntimeUnavailable { .. }) => true,
            PortGuardError::Store(StoreError::Backend { .. }) => true,
            PortGuardError::Io(_) => true,
            _ => false,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PortGuardError::Config(_) => ErrorSeverity::High,
            PortGuardError::Store(StoreError::NotInitialized) => ErrorSeverity::High,
            PortGuardError::Reservation(ReservationError::OwnerLimitExceeded { .. }) => {
                ErrorSeverity::Medium
            }
            PortGuardError::Reservation(ReservationError::PortConflict { .. }) => {
                ErrorSeverity::Medium
            }
            PortGuardError::Checker(_) => ErrorSeverity::Medium,
            PortGuardError::Container(_) => ErrorSeverity::Medium,
            _ => ErrorSeverity::Medium,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            PortGuardError::Reservation(ReservationError::PortConflict { ports }) => {
                format!(
                    "The following ports are already reserved by another owner: {:?}",
                    ports
                )
            }
            PortGuardError::Reservation(ReservationError::OwnerLimitExceeded { owner, max }) => {
                format!("Owner '{}' has reached its reservation limit of {}", owner, max)
            }
            PortGuardError::Container(ContainerError::RuntimeUnavailable { .. }) => {
                "Container runtime is unreachable; continuing in reservation-only mode."
                    .to_string()
            }
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_conflict_is_medium_severity() {
        let err = PortGuardError::Reservation(ReservationError::PortConflict { ports: vec![8080] });
        assert_eq!(err.severity(), ErrorSeverity::Medium);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn probe_timeout_is_recoverable() {
        let err = PortGuardError::Checker(CheckerError::ProbeTimeout {
            host: "local".to_string(),
            port: 8080,
            fail_closed: true,
        });
        assert!(err.is_recoverable());
    }
}
