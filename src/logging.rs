#![allow(dead_code)]

use crate::config::LoggingConfig;
use crate::error::{ErrorSeverity, PortGuardError};
use std::collections::HashMap;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Initialize the process-wide tracing subscriber from configuration.
///
/// Returns the file-appender worker guard, which must be kept alive for the
/// lifetime of the process for buffered log lines to be flushed.
pub fn init_logging(
    config: &LoggingConfig,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?;

    let mut layers = Vec::new();
    let mut guard = None;

    if config.console_enabled {
        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::NONE)
            .with_filter(env_filter.clone());
        layers.push(console_layer.boxed());
    }

    if config.file_enabled {
        std::fs::create_dir_all(&config.log_dir)?;

        let file_appender = match config.rotation.as_str() {
            "daily" => rolling::daily(&config.log_dir, &config.file_prefix),
            "hourly" => rolling::hourly(&config.log_dir, &config.file_prefix),
            _ => rolling::never(&config.log_dir, format!("{}.log", config.file_prefix)),
        };

        let (non_blocking_writer, worker_guard) = non_blocking(file_appender);
        guard = Some(worker_guard);

        let file_layer = if config.json_format {
            fmt::layer()
                .json()
                .with_writer(non_blocking_writer)
                .with_span_events(FmtSpan::NONE)
                .with_filter(env_filter.clone())
                .boxed()
        } else {
            fmt::layer()
                .with_writer(non_blocking_writer)
                .with_span_events(FmtSpan::NONE)
                .with_filter(env_filter.clone())
                .boxed()
        };

        layers.push(file_layer);
    }

    tracing_subscriber::registry().with(layers).init();

    Ok(guard)
}

/// Structured log entry shape for errors surfaced across subsystem
/// boundaries.
#[derive(Debug, serde::Serialize)]
pub struct ErrorLogEntry {
    pub level: String,
    pub error_message: String,
    pub user_message: String,
    pub severity: String,
    pub component: String,
    pub operation: String,
    pub recoverable: bool,
    pub context: HashMap<String, String>,
}

impl ErrorLogEntry {
    pub fn from_error(error: &PortGuardError, component: &str, operation: &str) -> Self {
        Self {
            level: match error.severity() {
                ErrorSeverity::Low => "WARN".to_string(),
                ErrorSeverity::Medium | ErrorSeverity::High => "ERROR".to_string(),
            },
            error_message: error.to_string(),
            user_message: error.user_message(),
            severity: error.severity().as_str().to_string(),
            component: component.to_string(),
            operation: operation.to_string(),
            recoverable: error.is_recoverable(),
            context: HashMap::new(),
        }
    }
}

/// Small helper wrapping common structured-log call sites so subsystems
/// don't hand-assemble `tracing` macro invocations inconsistently.
pub struct StructuredLogger;

impl StructuredLogger {
    pub fn log_error(error: &PortGuardError, component: &str, operation: &str) {
        let entry = ErrorLogEntry::from_error(error, component, operation);
        match error.severity() {
            ErrorSeverity::Low => {
                tracing::warn!(
                    component = %entry.component,
                    operation = %entry.operation,
                    recoverable = %entry.recoverable,
                    "{}",
                    entry.error_message
                );
            }
            ErrorSeverity::Medium => {
                tracing::error!(
                    component = %entry.component,
                    operation = %entry.operation,
                    recoverable = %entry.recoverable,
                    "{}",
                    entry.error_message
                );
            }
            ErrorSeverity::High => {
                tracing::error!(
                    component = %entry.component,
                    operation = %entry.operation,
                    recoverable = %entry.recoverable,
                    user_message = %entry.user_message,
                    "CRITICAL: {}",
                    entry.error_message
                );
            }
        }
    }

    pub fn log_port_event(port: u16, protocol: &str, event: &str) {
        tracing::info!(port = %port, protocol = %protocol, event = %event, "port event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, PortGuardError};

    #[test]
    fn error_log_entry_carries_component_and_operation() {
        let error = PortGuardError::Config(ConfigError::Invalid {
            message: "bad value".to_string(),
        });
        let entry = ErrorLogEntry::from_error(&error, "config", "load");
        assert_eq!(entry.component, "config");
        assert_eq!(entry.operation, "load");
        assert_eq!(entry.severity, "HIGH");
    }
}
