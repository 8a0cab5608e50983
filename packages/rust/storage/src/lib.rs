//! Key-value persistence boundary for CaseBrief.
//!
//! [`KeyValueStore`] is the only storage contract the rest of the workspace
//! relies on: whole-value `get`, `set` and `delete` by key, plus an atomic
//! read-modify-write [`KeyValueStore::update`]. Two implementations ship here:
//! - [`LibsqlStore`]: an embedded libSQL (Turso) database, used by the CLI
//! - [`MemoryStore`]: a `HashMap`, used by tests and `--ephemeral` runs
//!
//! **Access rules:**
//! - Writers open with [`LibsqlStore::open`]
//! - Listing commands may use [`LibsqlStore::open_readonly`]
//! - Any number of handles (and processes) may write the same database file;
//!   `update` runs in a `BEGIN IMMEDIATE` transaction so read-modify-write
//!   cycles never interleave

mod memory;
mod migrations;

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use casebrief_shared::{CaseBriefError, Result};
use chrono::Utc;
use libsql::{Connection, Database, TransactionBehavior, params};
use tokio::sync::Mutex;

pub use memory::MemoryStore;

/// Whole-value key-value storage. Every call is fail-fast.
pub trait KeyValueStore: Send + Sync {
    /// Read the value under `key`, or `None` if absent.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;
    /// Replace the value under `key`.
    fn set(&self, key: &str, value: &str) -> impl Future<Output = Result<()>> + Send;
    /// Remove `key`. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Read `key`, let `f` decide what to write, and apply it atomically.
    ///
    /// No other write to the store can land between the read and the write,
    /// whichever handle it comes from. When `f` fails nothing is written.
    fn update<T, F>(&self, key: &str, f: F) -> impl Future<Output = Result<T>> + Send
    where
        T: Send,
        F: FnOnce(Option<String>) -> Result<(KvWrite, T)> + Send;
}

/// What an [`KeyValueStore::update`] closure writes back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvWrite {
    /// Leave the stored value as it is.
    Keep,
    Set(String),
    Delete,
}

/// How long a writer waits for another connection's transaction to finish.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Key-value store over an embedded libSQL database.
pub struct LibsqlStore {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    /// Serializes writes issued through this handle's single connection.
    write_lock: Mutex<()>,
}

impl LibsqlStore {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CaseBriefError::io(parent, e))?;
        }

        let store = Self::connect(path, false).await?;
        store.run_migrations().await?;
        Ok(store)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CaseBriefError::NotFound(format!(
                "database {}",
                path.display()
            )));
        }
        Self::connect(path, true).await
    }

    async fn connect(path: &Path, readonly: bool) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(storage_err)?;
        tracing::debug!(path = %path.display(), readonly, "opened case database");

        Ok(Self {
            db,
            conn,
            readonly,
            write_lock: Mutex::new(()),
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        CaseBriefError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(CaseBriefError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }
}

impl KeyValueStore for LibsqlStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        read_value(&self.conn, key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        write_value(&self.conn, key, value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        delete_value(&self.conn, key).await
    }

    async fn update<T, F>(&self, key: &str, f: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(Option<String>) -> Result<(KvWrite, T)> + Send,
    {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;

        // IMMEDIATE takes the database write lock before the read.
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(storage_err)?;

        let applied = async {
            let current = read_value(&tx, key).await?;
            let (write, out) = f(current)?;
            match &write {
                KvWrite::Keep => {}
                KvWrite::Set(value) => write_value(&tx, key, value).await?,
                KvWrite::Delete => delete_value(&tx, key).await?,
            }
            Ok::<_, CaseBriefError>(out)
        }
        .await;

        match applied {
            Ok(out) => {
                tx.commit().await.map_err(storage_err)?;
                Ok(out)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(key, error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }
}

async fn read_value(conn: &Connection, key: &str) -> Result<Option<String>> {
    let mut rows = conn
        .query("SELECT value FROM kv WHERE key = ?1", params![key])
        .await
        .map_err(storage_err)?;

    match rows.next().await.map_err(storage_err)? {
        Some(row) => {
            let value: String = row.get(0).map_err(storage_err)?;
            tracing::debug!(key, bytes = value.len(), "kv get hit");
            Ok(Some(value))
        }
        None => {
            tracing::debug!(key, "kv get miss");
            Ok(None)
        }
    }
}

async fn write_value(conn: &Connection, key: &str, value: &str) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET
           value = excluded.value,
           updated_at = excluded.updated_at",
        params![key, value, now.as_str()],
    )
    .await
    .map_err(storage_err)?;
    tracing::debug!(key, bytes = value.len(), "kv set");
    Ok(())
}

async fn delete_value(conn: &Connection, key: &str) -> Result<()> {
    conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
        .await
        .map_err(storage_err)?;
    tracing::debug!(key, "kv delete");
    Ok(())
}

fn storage_err(e: libsql::Error) -> CaseBriefError {
    CaseBriefError::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    /// Create a temp file store for testing.
    async fn test_store() -> LibsqlStore {
        let tmp = std::env::temp_dir().join(format!("cb_test_{}.db", Uuid::now_v7()));
        LibsqlStore::open(&tmp).await.expect("open test db")
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let store = test_store().await;
        let version = store.get_schema_version().await;
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("cb_test_{}.db", Uuid::now_v7()));
        let _s1 = LibsqlStore::open(&tmp).await.expect("first open");
        drop(_s1);
        let s2 = LibsqlStore::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn kv_roundtrip() {
        let store = test_store().await;

        assert!(store.get("cases").await.expect("get miss").is_none());

        store.set("cases", r#"[{"name":"a"}]"#).await.expect("set");
        let value = store.get("cases").await.expect("get hit");
        assert_eq!(value.as_deref(), Some(r#"[{"name":"a"}]"#));

        // Overwrite replaces the whole value
        store.set("cases", "[]").await.expect("overwrite");
        assert_eq!(store.get("cases").await.unwrap().as_deref(), Some("[]"));

        store.delete("cases").await.expect("delete");
        assert!(store.get("cases").await.unwrap().is_none());

        // Deleting an absent key is fine
        store.delete("cases").await.expect("delete absent");
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let store = test_store().await;
        store.set("cases", "[]").await.unwrap();
        store.set("drafts", "{}").await.unwrap();
        store.delete("drafts").await.unwrap();
        assert_eq!(store.get("cases").await.unwrap().as_deref(), Some("[]"));
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("cb_test_{}.db", Uuid::now_v7()));
        let rw = LibsqlStore::open(&tmp).await.unwrap();
        rw.set("cases", "[]").await.unwrap();
        drop(rw);

        let ro = LibsqlStore::open_readonly(&tmp).await.unwrap();
        assert_eq!(ro.get("cases").await.unwrap().as_deref(), Some("[]"));

        let result = ro.set("cases", "[1]").await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));

        assert!(ro.delete("cases").await.is_err());
    }

    #[tokio::test]
    async fn readonly_requires_existing_database() {
        let tmp = std::env::temp_dir().join(format!("cb_missing_{}.db", Uuid::now_v7()));
        assert!(matches!(
            LibsqlStore::open_readonly(&tmp).await,
            Err(CaseBriefError::NotFound(_))
        ));
    }

    async fn bump(store: &LibsqlStore) -> Result<u32> {
        store
            .update("counter", |current| {
                let n = current.map_or(Ok(0), |raw| {
                    raw.parse::<u32>()
                        .map_err(|e| CaseBriefError::Storage(e.to_string()))
                })? + 1;
                Ok((KvWrite::Set(n.to_string()), n))
            })
            .await
    }

    #[tokio::test]
    async fn update_writes_and_returns() {
        let store = test_store().await;
        assert_eq!(bump(&store).await.unwrap(), 1);
        assert_eq!(bump(&store).await.unwrap(), 2);
        assert_eq!(store.get("counter").await.unwrap().as_deref(), Some("2"));

        let seen = store
            .update("counter", |current| Ok((KvWrite::Delete, current)))
            .await
            .unwrap();
        assert_eq!(seen.as_deref(), Some("2"));
        assert!(store.get("counter").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_update_writes_nothing() {
        let store = test_store().await;
        store.set("cases", "[]").await.unwrap();

        let result: Result<()> = store
            .update("cases", |_| Err(CaseBriefError::validation("rejected")))
            .await;
        assert!(result.is_err());
        assert_eq!(store.get("cases").await.unwrap().as_deref(), Some("[]"));

        // The transaction was closed; later writes still work
        assert_eq!(bump(&store).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn keep_leaves_value() {
        let store = test_store().await;
        store.set("cases", "[1]").await.unwrap();
        store
            .update("cases", |_| Ok((KvWrite::Keep, ())))
            .await
            .unwrap();
        assert_eq!(store.get("cases").await.unwrap().as_deref(), Some("[1]"));
    }

    #[tokio::test]
    async fn readonly_rejects_update() {
        let tmp = std::env::temp_dir().join(format!("cb_test_{}.db", Uuid::now_v7()));
        drop(LibsqlStore::open(&tmp).await.unwrap());
        let ro = LibsqlStore::open_readonly(&tmp).await.unwrap();
        assert!(bump(&ro).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_across_handles() {
        let tmp = std::env::temp_dir().join(format!("cb_test_{}.db", Uuid::now_v7()));
        let first = std::sync::Arc::new(LibsqlStore::open(&tmp).await.unwrap());
        let second = std::sync::Arc::new(LibsqlStore::open(&tmp).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = if i % 2 == 0 { first.clone() } else { second.clone() };
            handles.push(tokio::spawn(async move { bump(&store).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(first.get("counter").await.unwrap().as_deref(), Some("20"));
    }
}
