//! Persistence of assigned servers
//!
//! The store records which servers should be running. It is read at startup
//! to restore service and written when servers are created, re-attached or
//! deleted; it holds no business logic.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::models::StoredServer;
use crate::Result;

#[cfg_attr(test, mockall::automock)]
pub trait ServerStore: Send + Sync {
    fn list_servers(&self) -> Result<Vec<StoredServer>>;

    fn get_server(&self, server_id: &str) -> Result<Option<StoredServer>>;

    /// Insert, or update everything but `created_at` of an existing record
    fn upsert_server(&self, server: &StoredServer) -> Result<()>;

    /// Record a new runtime container for an existing server
    fn update_container_id(&self, server_id: &str, container_id: &str) -> Result<()>;

    /// Returns whether a record was deleted
    fn delete_server(&self, server_id: &str) -> Result<bool>;
}

/// SQLite-backed store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS servers (
                server_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                container_id TEXT NOT NULL,
                mc_version TEXT NOT NULL,
                port INTEGER NOT NULL,
                ram_mb INTEGER NOT NULL,
                owner TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_servers_owner ON servers(owner);
            "#,
        )?;
        Ok(())
    }

    fn row_to_server(row: &Row) -> rusqlite::Result<StoredServer> {
        let created_at: String = row.get(7)?;
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        Ok(StoredServer {
            server_id: row.get(0)?,
            name: row.get(1)?,
            container_id: row.get(2)?,
            mc_version: row.get(3)?,
            port: row.get(4)?,
            ram_mb: row.get(5)?,
            owner: row.get(6)?,
            created_at,
        })
    }
}

const SELECT_SERVER: &str =
    "SELECT server_id, name, container_id, mc_version, port, ram_mb, owner, created_at FROM servers";

impl ServerStore for SqliteStore {
    fn list_servers(&self) -> Result<Vec<StoredServer>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{} ORDER BY created_at", SELECT_SERVER))?;
        let servers = stmt
            .query_map([], Self::row_to_server)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(servers)
    }

    fn get_server(&self, server_id: &str) -> Result<Option<StoredServer>> {
        let conn = self.conn.lock();
        let server = conn
            .query_row(
                &format!("{} WHERE server_id = ?1", SELECT_SERVER),
                params![server_id],
                Self::row_to_server,
            )
            .optional()?;
        Ok(server)
    }

    fn upsert_server(&self, server: &StoredServer) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT INTO servers (server_id, name, container_id, mc_version, port, ram_mb, owner, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
               ON CONFLICT(server_id) DO UPDATE SET
                   name = excluded.name,
                   container_id = excluded.container_id,
                   mc_version = excluded.mc_version,
                   port = excluded.port,
                   ram_mb = excluded.ram_mb,
                   owner = excluded.owner"#,
            params![
                server.server_id,
                server.name,
                server.container_id,
                server.mc_version,
                server.port,
                server.ram_mb,
                server.owner,
                server.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn update_container_id(&self, server_id: &str, container_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE servers SET container_id = ?1 WHERE server_id = ?2",
            params![container_id, server_id],
        )?;
        Ok(())
    }

    fn delete_server(&self, server_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM servers WHERE server_id = ?1", params![server_id])?;
        Ok(deleted > 0)
    }
}
