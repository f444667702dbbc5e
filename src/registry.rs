//! SQLite tenant registry
//!
//! Durable store for bot records. The front door only needs to know whether
//! a tenant exists, its display name and the outcome of its last gateway
//! startup.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rand::Rng;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Length of generated tenant ids
pub const TENANT_ID_LEN: usize = 12;

const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Inactive,
    Error,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Active => "active",
            TenantStatus::Inactive => "inactive",
            TenantStatus::Error => "error",
        }
    }
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TenantStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(TenantStatus::Active),
            "inactive" => Ok(TenantStatus::Inactive),
            "error" => Ok(TenantStatus::Error),
            other => Err(format!("unknown tenant status '{}'", other)),
        }
    }
}

/// A registered bot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    /// Unix milliseconds
    pub created_at: i64,
    pub status: TenantStatus,
}

/// Generate a URL-safe tenant id
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    (0..TENANT_ID_LEN)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

fn tenant_from_row(row: &Row<'_>) -> rusqlite::Result<Tenant> {
    let status: String = row.get(3)?;
    let status = status
        .parse::<TenantStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, e.into()))?;
    Ok(Tenant {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: row.get(2)?,
        status,
    })
}

/// Tenant store with thread-safe access
#[derive(Clone)]
pub struct Registry {
    conn: Arc<Mutex<Connection>>,
}

impl Registry {
    /// Open or create a registry at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let conn = Connection::open(path).context("Failed to open registry database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let registry = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        registry.run_migrations()?;

        info!("Registry opened at {}", path.display());
        Ok(registry)
    }

    /// Open an in-memory registry (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory registry")?;
        let registry = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        registry.run_migrations()?;
        Ok(registry)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: bots table
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: bots table");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS bots (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'active'
            );

            CREATE INDEX IF NOT EXISTS idx_bots_created_at ON bots(created_at);

            INSERT INTO schema_migrations (version) VALUES (1);
            "#,
        )
        .context("Failed to apply migration v1")?;

        Ok(())
    }

    /// All tenants, newest first
    pub fn list(&self) -> Result<Vec<Tenant>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, created_at, status FROM bots ORDER BY created_at DESC, rowid DESC",
        )?;

        let tenants = stmt
            .query_map([], tenant_from_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list bots")?;

        Ok(tenants)
    }

    pub fn get(&self, id: &str) -> Result<Option<Tenant>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, created_at, status FROM bots WHERE id = ?1",
            params![id],
            tenant_from_row,
        )
        .optional()
        .context("Failed to get bot")
    }

    /// Register a new tenant with a fresh id
    pub fn create(&self, name: &str) -> Result<Tenant> {
        let tenant = Tenant {
            id: generate_id(),
            name: name.to_string(),
            created_at: chrono::Utc::now().timestamp_millis(),
            status: TenantStatus::Active,
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO bots (id, name, created_at, status) VALUES (?1, ?2, ?3, ?4)",
            params![tenant.id, tenant.name, tenant.created_at, tenant.status.as_str()],
        )
        .context("Failed to create bot")?;

        debug!(tenant = %tenant.id, name = %tenant.name, "Registered bot");
        Ok(tenant)
    }

    /// Returns false when the tenant does not exist
    pub fn update_status(&self, id: &str, status: TenantStatus) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE bots SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update bot status")?;
        Ok(rows > 0)
    }

    /// Returns false when the tenant does not exist
    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM bots WHERE id = ?1", params![id])
            .context("Failed to delete bot")?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_url_safe() {
        for _ in 0..50 {
            let id = generate_id();
            assert_eq!(id.len(), TENANT_ID_LEN);
            assert!(id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-'));
        }
        assert_ne!(generate_id(), generate_id());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("active".parse::<TenantStatus>().unwrap(), TenantStatus::Active);
        assert_eq!("error".parse::<TenantStatus>().unwrap(), TenantStatus::Error);
        assert!("paused".parse::<TenantStatus>().is_err());
        assert_eq!(TenantStatus::Inactive.to_string(), "inactive");
    }

    #[test]
    fn test_create_and_get() {
        let registry = Registry::open_in_memory().unwrap();

        let bot = registry.create("Support Bot").unwrap();
        assert_eq!(bot.status, TenantStatus::Active);
        assert!(bot.created_at > 0);

        let fetched = registry.get(&bot.id).unwrap().unwrap();
        assert_eq!(fetched, bot);
        assert!(registry.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_list_newest_first() {
        let registry = Registry::open_in_memory().unwrap();
        let first = registry.create("first").unwrap();
        let second = registry.create("second").unwrap();
        let third = registry.create("third").unwrap();

        let ids: Vec<_> = registry.list().unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![third.id, second.id, first.id]);
    }

    #[test]
    fn test_update_status() {
        let registry = Registry::open_in_memory().unwrap();
        let bot = registry.create("bot").unwrap();

        assert!(registry.update_status(&bot.id, TenantStatus::Error).unwrap());
        assert_eq!(registry.get(&bot.id).unwrap().unwrap().status, TenantStatus::Error);
        assert!(!registry.update_status("missing", TenantStatus::Active).unwrap());
    }

    #[test]
    fn test_delete() {
        let registry = Registry::open_in_memory().unwrap();
        let bot = registry.create("bot").unwrap();

        assert!(registry.delete(&bot.id).unwrap());
        assert!(!registry.delete(&bot.id).unwrap());
        assert!(registry.get(&bot.id).unwrap().is_none());
    }

    #[test]
    fn test_reopen_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("botgate.db");

        let id = {
            let registry = Registry::open(&path).unwrap();
            registry.create("persistent").unwrap().id
        };

        let registry = Registry::open(&path).unwrap();
        assert_eq!(registry.get(&id).unwrap().unwrap().name, "persistent");
    }
}
