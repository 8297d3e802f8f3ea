//! Port monitoring and reservation service core.
//!
//! Detects port occupancy on the local system and inside containers, tracks
//! time-bounded reservations, fuses both into conflict reports, and
//! suggests alternatives when a preferred port is unavailable. The core
//! never reads environment variables or touches process-global state; the
//! `portguardd` binary owns that responsibility and constructs every
//! subsystem explicitly (see [`scheduler::Supervisor`]).

pub mod cache;
pub mod checker;
pub mod config;
pub mod conflict;
pub mod container;
pub mod error;
pub mod host_resolver;
pub mod logging;
pub mod reservation;
pub mod scheduler;
pub mod store;
pub mod suggestion;
pub mod types;

pub use cache::CacheManager;
pub use checker::{AvailabilityChecker, DefaultAvailabilityChecker};
pub use config::Config;
pub use conflict::ConflictDetector;
pub use container::{BollardContainerRuntime, ContainerIntegration, ContainerRuntime};
pub use error::{PortGuardError, Result};
pub use reservation::ReservationManager;
pub use scheduler::Supervisor;
pub use store::{ReservationStore, SqliteReservationStore};
pub use suggestion::SuggestionEngine;
