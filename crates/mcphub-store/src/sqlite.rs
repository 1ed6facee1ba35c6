//! SQLite-backed descriptor store.
//!
//! Transport, auth and connection settings are stored as JSON text so new
//! transport or credential variants need no schema change.

use std::fs;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mcphub_core::{Scope, ServerDescriptor, ServerId};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use tracing::debug;
use uuid::Uuid;

use crate::{Result, ServerStore, StoreError};

const COLUMNS: &str = "id, scope, name, transport, auth, settings, enabled, auto_connect, \
                       version, description, created_at, updated_at";

/// SQLite-backed descriptor storage.
pub struct SqliteServerStore {
    /// Database connection (wrapped in mutex for thread safety).
    conn: Mutex<Connection>,
}

/// Raw column values, decoded after the row borrow ends.
struct StoredRow {
    id: String,
    scope: String,
    name: String,
    transport: String,
    auth: String,
    settings: String,
    enabled: bool,
    auto_connect: bool,
    version: Option<String>,
    description: Option<String>,
    created_at: String,
    updated_at: String,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            scope: row.get(1)?,
            name: row.get(2)?,
            transport: row.get(3)?,
            auth: row.get(4)?,
            settings: row.get(5)?,
            enabled: row.get(6)?,
            auto_connect: row.get(7)?,
            version: row.get(8)?,
            description: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_descriptor(self) -> Result<ServerDescriptor> {
        let id = Uuid::parse_str(&self.id).map_err(|e| StoreError::Corrupt(format!("id '{}': {}", self.id, e)))?;
        Ok(ServerDescriptor {
            id: ServerId::from_uuid(id),
            scope: Scope::new(self.scope),
            name: self.name,
            transport: serde_json::from_str(&self.transport)?,
            auth: serde_json::from_str(&self.auth)?,
            settings: serde_json::from_str(&self.settings)?,
            enabled: self.enabled,
            auto_connect: self.auto_connect,
            version: self.version,
            description: self.description,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

impl SqliteServerStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        debug!(path = %path.display(), "Opening server store");
        Self::from_connection(Connection::open(path)?)
    }

    /// In-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        // WAL is silently ignored by in-memory databases.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self { conn: Mutex::new(conn) };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        let has_version_table: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
            [],
            |row| row.get(0),
        )?;
        let current_version: i32 = if has_version_table {
            conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
                row.get(0)
            })?
        } else {
            0
        };

        if current_version < 1 {
            debug!("Applying server store migration 1");
            conn.execute_batch(include_str!("../migrations/001_initial.sql"))?;
        }

        Ok(())
    }

    fn query(&self, filter: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<ServerDescriptor>> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&format!("SELECT {} FROM servers {}", COLUMNS, filter))?;
            let rows = stmt
                .query_map(args, StoredRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter().map(StoredRow::into_descriptor).collect()
    }

    fn query_one(&self, filter: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Option<ServerDescriptor>> {
        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!("SELECT {} FROM servers {}", COLUMNS, filter),
                args,
                StoredRow::from_row,
            )
            .optional()?
        };
        row.map(StoredRow::into_descriptor).transpose()
    }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {}", s, e)))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation)
}

fn duplicate(descriptor: &ServerDescriptor) -> StoreError {
    StoreError::Duplicate {
        scope: descriptor.scope.to_string(),
        name: descriptor.name.clone(),
    }
}

#[async_trait]
impl ServerStore for SqliteServerStore {
    async fn list(&self, scope: &Scope) -> Result<Vec<ServerDescriptor>> {
        self.query("WHERE scope = ?1 ORDER BY name", &[&scope.as_str()])
    }

    async fn list_all(&self) -> Result<Vec<ServerDescriptor>> {
        self.query("ORDER BY scope, name", &[])
    }

    async fn get(&self, id: ServerId) -> Result<Option<ServerDescriptor>> {
        self.query_one("WHERE id = ?1", &[&id.to_string()])
    }

    async fn find_by_name(&self, scope: &Scope, name: &str) -> Result<Option<ServerDescriptor>> {
        self.query_one("WHERE scope = ?1 AND name = ?2", &[&scope.as_str(), &name])
    }

    async fn insert(&self, descriptor: &ServerDescriptor) -> Result<()> {
        let transport = serde_json::to_string(&descriptor.transport)?;
        let auth = serde_json::to_string(&descriptor.auth)?;
        let settings = serde_json::to_string(&descriptor.settings)?;

        let conn = self.conn.lock();
        let result = conn.execute(
            &format!(
                "INSERT INTO servers ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                COLUMNS
            ),
            params![
                descriptor.id.to_string(),
                descriptor.scope.as_str(),
                descriptor.name,
                transport,
                auth,
                settings,
                descriptor.enabled,
                descriptor.auto_connect,
                descriptor.version,
                descriptor.description,
                format_datetime(&descriptor.created_at),
                format_datetime(&descriptor.updated_at),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(duplicate(descriptor)),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, descriptor: &ServerDescriptor) -> Result<()> {
        let transport = serde_json::to_string(&descriptor.transport)?;
        let auth = serde_json::to_string(&descriptor.auth)?;
        let settings = serde_json::to_string(&descriptor.settings)?;

        let conn = self.conn.lock();
        let result = conn.execute(
            r#"
            UPDATE servers SET
                scope = ?2, name = ?3, transport = ?4, auth = ?5, settings = ?6,
                enabled = ?7, auto_connect = ?8, version = ?9, description = ?10,
                created_at = ?11, updated_at = ?12
            WHERE id = ?1
            "#,
            params![
                descriptor.id.to_string(),
                descriptor.scope.as_str(),
                descriptor.name,
                transport,
                auth,
                settings,
                descriptor.enabled,
                descriptor.auto_connect,
                descriptor.version,
                descriptor.description,
                format_datetime(&descriptor.created_at),
                format_datetime(&descriptor.updated_at),
            ],
        );

        match result {
            Ok(0) => Err(StoreError::NotFound(descriptor.id.to_string())),
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(duplicate(descriptor)),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, id: ServerId) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM servers WHERE id = ?1", params![id.to_string()])?;
        Ok(deleted > 0)
    }
}
