use crate::error::{Result, StoreError};
use crate::types::{Metadata, PortNumber, Protocol, Reservation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info};

const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Durable storage for reservations. The store enforces no leasing policy of
/// its own — duration clamping, owner caps and conflict checks belong to the
/// Reservation Manager. This trait only guarantees durable CRUD plus
/// expiry bookkeeping.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    async fn initialize(&self) -> Result<()>;

    async fn create(&self, reservation: &Reservation) -> Result<()>;

    async fn release(&self, port: PortNumber, protocol: Protocol) -> Result<bool>;

    async fn release_all(&self, owner_id: &str) -> Result<u32>;

    async fn get_active(&self, port: PortNumber, protocol: Protocol) -> Result<Option<Reservation>>;

    async fn get_by_owner(&self, owner_id: &str) -> Result<Vec<Reservation>>;

    async fn get_all_active(&self) -> Result<Vec<Reservation>>;

    async fn extend(&self, port: PortNumber, protocol: Protocol, new_expiry: DateTime<Utc>) -> Result<()>;

    async fn count_active_for_owner(&self, owner_id: &str) -> Result<u32>;

    /// Remove reservations whose `expires_at` is in the past. Returns the
    /// number of rows removed.
    async fn gc_expired(&self) -> Result<u32>;

    /// Set (or clear, with `label = None`) the user-facing label override
    /// for a `(port, protocol)` pair, independent of any reservation.
    async fn set_port_label(&self, port: PortNumber, protocol: Protocol, label: Option<String>) -> Result<()>;

    async fn set_port_documentation(
        &self,
        port: PortNumber,
        protocol: Protocol,
        text: Option<String>,
    ) -> Result<()>;

    /// Fetch the label/documentation overrides for a port, if any were set.
    async fn get_port_override(&self, port: PortNumber, protocol: Protocol) -> Result<Option<PortOverride>>;
}

/// A user-set label and/or freeform documentation note attached to a port,
/// independent of reservation state and the static service-identification
/// table.
#[derive(Debug, Clone, Default)]
pub struct PortOverride {
    pub label: Option<String>,
    pub documentation: Option<String>,
}

/// SQLite-backed reservation store.
///
/// A single connection serializes all writes behind a `tokio::sync::Mutex`
/// — reservations are low-volume enough that connection pooling would be
/// unwarranted.
pub struct SqliteReservationStore {
    conn: Mutex<Connection>,
}

impl SqliteReservationStore {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        let conn = Connection::open(&db_path)?;
        Self::apply_pragmas(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::apply_pragmas(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn apply_pragmas(conn: &Connection) -> Result<()> {
        conn.execute("PRAGMA journal_mode = WAL", []).or_else(|e| match e {
            rusqlite::Error::ExecuteReturnedResults => Ok(0),
            other => Err(other),
        })?;
        conn.execute("PRAGMA synchronous = NORMAL", []).or_else(|e| match e {
            rusqlite::Error::ExecuteReturnedResults => Ok(0),
            other => Err(other),
        })?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(())
    }

    fn create_tables(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS reservations (
                id TEXT PRIMARY KEY,
                port INTEGER NOT NULL,
                protocol TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                owner_name TEXT,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                metadata_json TEXT NOT NULL,
                UNIQUE(port, protocol)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_reservations_owner ON reservations (owner_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_reservations_expires ON reservations (expires_at)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS port_overrides (
                port INTEGER NOT NULL,
                protocol TEXT NOT NULL,
                label TEXT,
                documentation TEXT,
                PRIMARY KEY (port, protocol)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        let applied: Option<i32> = conn
            .query_row(
                "SELECT MAX(version) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        if applied.unwrap_or(0) < CURRENT_SCHEMA_VERSION {
            conn.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                params![CURRENT_SCHEMA_VERSION, Utc::now().to_rfc3339()],
            )?;
        }

        Ok(())
    }

    fn row_to_reservation(row: &rusqlite::Row) -> rusqlite::Result<Reservation> {
        let port_raw: i64 = row.get("port")?;
        let protocol_raw: String = row.get("protocol")?;
        let metadata_raw: String = row.get("metadata_json")?;

        let port = PortNumber::try_from(port_raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Integer,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?;
        let protocol = match protocol_raw.as_str() {
            "udp" => Protocol::Udp,
            _ => Protocol::Tcp,
        };
        let metadata: Metadata = serde_json::from_str(&metadata_raw).unwrap_or_default();

        Ok(Reservation {
            id: row.get("id")?,
            port,
            protocol,
            owner_id: row.get("owner_id")?,
            owner_name: row.get("owner_name")?,
            created_at: row.get("created_at")?,
            expires_at: row.get("expires_at")?,
            metadata,
        })
    }
}

#[async_trait]
impl ReservationStore for SqliteReservationStore {
    async fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        Self::create_tables(&conn)?;
        info!("reservation store schema ready (version {})", CURRENT_SCHEMA_VERSION);
        Ok(())
    }

    async fn create(&self, reservation: &Reservation) -> Result<()> {
        let conn = self.conn.lock().await;
        let metadata_json = serde_json::to_string(&reservation.metadata)?;
        let now = Utc::now().to_rfc3339();

        // The UNIQUE(port, protocol) index covers every row, but the
        // uniqueness invariant only applies to active leases — an expired
        // row for this (port, protocol) is logically free and would
        // otherwise block this insert until the next GC sweep. A live row
        // already held by the same owner is a renewal, not a conflict
        // (the manager's conflict check already allows same-owner
        // re-reservation). Clearing both cases inside this same locked
        // section keeps the active-only, per-owner uniqueness check and
        // the insert atomic.
        conn.execute(
            "DELETE FROM reservations
             WHERE port = ?1 AND protocol = ?2 AND (expires_at <= ?3 OR owner_id = ?4)",
            params![
                reservation.port.get(),
                reservation.protocol.as_str(),
                now,
                reservation.owner_id,
            ],
        )
        .map_err(|e| StoreError::Backend {
            reason: e.to_string(),
        })?;

        conn.execute(
            "INSERT INTO reservations
                (id, port, protocol, owner_id, owner_name, created_at, expires_at, metadata_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                reservation.id,
                reservation.port.get(),
                reservation.protocol.as_str(),
                reservation.owner_id,
                reservation.owner_name,
                reservation.created_at.to_rfc3339(),
                reservation.expires_at.to_rfc3339(),
                metadata_json,
            ],
        )
        .map_err(|e| StoreError::Backend {
            reason: e.to_string(),
        })?;
        Ok(())
    }

    async fn release(&self, port: PortNumber, protocol: Protocol) -> Result<bool> {
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "DELETE FROM reservations WHERE port = ?1 AND protocol = ?2",
            params![port.get(), protocol.as_str()],
        )?;
        Ok(affected > 0)
    }

    async fn release_all(&self, owner_id: &str) -> Result<u32> {
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "DELETE FROM reservations WHERE owner_id = ?1",
            params![owner_id],
        )?;
        Ok(affected as u32)
    }

    async fn get_active(&self, port: PortNumber, protocol: Protocol) -> Result<Option<Reservation>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM reservations WHERE port = ?1 AND protocol = ?2 AND expires_at > ?3",
        )?;
        let now = Utc::now().to_rfc3339();
        let reservation = stmt
            .query_row(params![port.get(), protocol.as_str(), now], Self::row_to_reservation)
            .optional()?;
        Ok(reservation)
    }

    async fn get_by_owner(&self, owner_id: &str) -> Result<Vec<Reservation>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM reservations WHERE owner_id = ?1")?;
        let rows = stmt
            .query_map(params![owner_id], Self::row_to_reservation)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn get_all_active(&self) -> Result<Vec<Reservation>> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let mut stmt = conn.prepare("SELECT * FROM reservations WHERE expires_at > ?1")?;
        let rows = stmt
            .query_map(params![now], Self::row_to_reservation)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn extend(&self, port: PortNumber, protocol: Protocol, new_expiry: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "UPDATE reservations SET expires_at = ?1 WHERE port = ?2 AND protocol = ?3",
            params![new_expiry.to_rfc3339(), port.get(), protocol.as_str()],
        )?;
        if affected == 0 {
            return Err(StoreError::Backend {
                reason: format!("no active reservation for {}/{}", port, protocol),
            }
            .into());
        }
        Ok(())
    }

    async fn count_active_for_owner(&self, owner_id: &str) -> Result<u32> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM reservations WHERE owner_id = ?1 AND expires_at > ?2",
            params![owner_id, now],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    async fn gc_expired(&self) -> Result<u32> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let affected = conn.execute("DELETE FROM reservations WHERE expires_at <= ?1", params![now])?;
        if affected > 0 {
            debug!(count = affected, "garbage-collected expired reservations");
        }
        Ok(affected as u32)
    }

    async fn set_port_label(&self, port: PortNumber, protocol: Protocol, label: Option<String>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO port_overrides (port, protocol, label) VALUES (?1, ?2, ?3)
             ON CONFLICT(port, protocol) DO UPDATE SET label = excluded.label",
            params![port.get(), protocol.as_str(), label],
        )?;
        Ok(())
    }

    async fn set_port_documentation(
        &self,
        port: PortNumber,
        protocol: Protocol,
        text: Option<String>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO port_overrides (port, protocol, documentation) VALUES (?1, ?2, ?3)
             ON CONFLICT(port, protocol) DO UPDATE SET documentation = excluded.documentation",
            params![port.get(), protocol.as_str(), text],
        )?;
        Ok(())
    }

    async fn get_port_override(&self, port: PortNumber, protocol: Protocol) -> Result<Option<PortOverride>> {
        let conn = self.conn.lock().await;
        let result = conn
            .query_row(
                "SELECT label, documentation FROM port_overrides WHERE port = ?1 AND protocol = ?2",
                params![port.get(), protocol.as_str()],
                |row| {
                    Ok(PortOverride {
                        label: row.get(0)?,
                        documentation: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::forever;
    use std::collections::HashMap;

    fn sample_reservation(port: u16, owner: &str) -> Reservation {
        Reservation {
            id: uuid::Uuid::new_v4().to_string(),
            port: PortNumber::new(port).unwrap(),
            protocol: Protocol::Tcp,
            owner_id: owner.to_string(),
            owner_name: None,
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(3600),
            metadata: HashMap::new(),
        }
    }

    async fn store() -> SqliteReservationStore {
        let store = SqliteReservationStore::in_memory().unwrap();
        store.initialize().await.unwrap();
        store
    }

    #[tokio::test]
    async fn create_then_get_active_roundtrips() {
        let store = store().await;
        let reservation = sample_reservation(8080, "alice");
        store.create(&reservation).await.unwrap();

        let fetched = store
            .get_active(PortNumber::new(8080).unwrap(), Protocol::Tcp)
            .await
            .unwrap();
        assert_eq!(fetched.unwrap().owner_id, "alice");
    }

    #[tokio::test]
    async fn duplicate_port_protocol_is_rejected() {
        let store = store().await;
        store.create(&sample_reservation(8080, "alice")).await.unwrap();
        let err = store.create(&sample_reservation(8080, "bob")).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn expired_row_does_not_block_a_fresh_create() {
        let store = store().await;
        let mut expired = sample_reservation(8090, "alice");
        expired.expires_at = Utc::now() - chrono::Duration::seconds(1);
        store.create(&expired).await.unwrap();

        store.create(&sample_reservation(8090, "bob")).await.unwrap();

        let active = store
            .get_active(PortNumber::new(8090).unwrap(), Protocol::Tcp)
            .await
            .unwrap();
        assert_eq!(active.unwrap().owner_id, "bob");
    }

    #[tokio::test]
    async fn same_owner_create_replaces_its_own_active_row() {
        let store = store().await;
        let first = sample_reservation(8095, "alice");
        let first_id = first.id.clone();
        store.create(&first).await.unwrap();
        store.create(&sample_reservation(8095, "alice")).await.unwrap();

        let active = store
            .get_active(PortNumber::new(8095).unwrap(), Protocol::Tcp)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.owner_id, "alice");
        assert_ne!(active.id, first_id);
    }

    #[tokio::test]
    async fn release_removes_reservation() {
        let store = store().await;
        store.create(&sample_reservation(9000, "alice")).await.unwrap();
        let released = store.release(PortNumber::new(9000).unwrap(), Protocol::Tcp).await.unwrap();
        assert!(released);
        assert!(store
            .get_active(PortNumber::new(9000).unwrap(), Protocol::Tcp)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn gc_expired_removes_only_past_reservations() {
        let store = store().await;
        let mut expired = sample_reservation(7000, "alice");
        expired.expires_at = Utc::now() - chrono::Duration::seconds(1);
        store.create(&expired).await.unwrap();
        store.create(&sample_reservation(7001, "alice")).await.unwrap();

        let removed = store.gc_expired().await.unwrap();
        assert_eq!(removed, 1);
        assert!(store
            .get_active(PortNumber::new(7001).unwrap(), Protocol::Tcp)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn forever_reservation_survives_gc() {
        let store = store().await;
        let mut permanent = sample_reservation(7100, "alice");
        permanent.expires_at = forever();
        store.create(&permanent).await.unwrap();

        store.gc_expired().await.unwrap();
        assert!(store
            .get_active(PortNumber::new(7100).unwrap(), Protocol::Tcp)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn count_active_for_owner_excludes_expired() {
        let store = store().await;
        store.create(&sample_reservation(7200, "alice")).await.unwrap();
        let mut expired = sample_reservation(7201, "alice");
        expired.expires_at = Utc::now() - chrono::Duration::seconds(1);
        store.create(&expired).await.unwrap();

        assert_eq!(store.count_active_for_owner("alice").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn port_label_and_documentation_roundtrip_independent_of_reservations() {
        let store = store().await;
        let port = PortNumber::new(8080).unwrap();

        assert!(store.get_port_override(port, Protocol::Tcp).await.unwrap().is_none());

        store
            .set_port_label(port, Protocol::Tcp, Some("prod-api".to_string()))
            .await
            .unwrap();
        store
            .set_port_documentation(port, Protocol::Tcp, Some("owned by platform team".to_string()))
            .await
            .unwrap();

        let over = store.get_port_override(port, Protocol::Tcp).await.unwrap().unwrap();
        assert_eq!(over.label.as_deref(), Some("prod-api"));
        assert_eq!(over.documentation.as_deref(), Some("owned by platform team"));

        store.set_port_label(port, Protocol::Tcp, None).await.unwrap();
        let over = store.get_port_override(port, Protocol::Tcp).await.unwrap().unwrap();
        assert!(over.label.is_none());
        assert_eq!(over.documentation.as_deref(), Some("owned by platform team"));
    }
}
