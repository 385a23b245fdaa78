use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use super::{CacheBackend, KeyTtl};
use crate::error::StoreError;

const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;

const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    expires_at INTEGER
) WITHOUT ROWID;
CREATE INDEX IF NOT EXISTS idx_kv_expires_at ON kv(expires_at);
"#;

/// Rows count as live while `expires_at` is NULL or in the future (unix ms).
const LIVE: &str = "(expires_at IS NULL OR expires_at > ?2)";

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn deadline_ms(ttl: Duration) -> i64 {
    now_ms().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

/// Backend on a shared SQLite file. Several gateway processes on one host can
/// open the same path; SQLite serializes their writes.
pub struct SqliteCache {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteCache {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("create dir: {e}")))?;
        }
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        info!(path = %path.display(), "sqlite cache opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_owned(),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    fn init(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(PRAGMAS)
            .map_err(|e| StoreError::Backend(format!("pragmas: {e}")))?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StoreError::Backend(format!("schema: {e}")))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete expired rows. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now_ms()],
            )?)
        })
        .await
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("sqlite task: {e}")))?
    }
}

#[async_trait]
impl CacheBackend for SqliteCache {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let (key, value) = (key.to_string(), value.to_string());
        let expires_at = ttl.map(deadline_ms);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                params![key, value, expires_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let (key, value) = (key.to_string(), value.to_string());
        let expires_at = deadline_ms(ttl);
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
                 WHERE kv.expires_at IS NOT NULL AND kv.expires_at <= ?4",
                params![key, value, expires_at, now_ms()],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT value FROM kv WHERE key = ?1 AND {LIVE}"),
                    params![key, now_ms()],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        let keys = keys.to_vec();
        self.with_conn(move |conn| {
            let now = now_ms();
            let mut stmt =
                conn.prepare_cached(&format!("SELECT value FROM kv WHERE key = ?1 AND {LIVE}"))?;
            let mut out = Vec::with_capacity(keys.len());
            for key in &keys {
                out.push(
                    stmt.query_row(params![key, now], |row| row.get(0))
                        .optional()?,
                );
            }
            Ok(out)
        })
        .await
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let live: bool = conn.query_row(
                &format!("SELECT EXISTS(SELECT 1 FROM kv WHERE key = ?1 AND {LIVE})"),
                params![key, now_ms()],
                |row| row.get(0),
            )?;
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            Ok(live)
        })
        .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let key = key.to_string();
        let expires_at = deadline_ms(ttl);
        self.with_conn(move |conn| {
            let changed = conn.execute(
                &format!("UPDATE kv SET expires_at = ?3 WHERE key = ?1 AND {LIVE}"),
                params![key, now_ms(), expires_at],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let now = now_ms();
            let row: Option<Option<i64>> = conn
                .query_row(
                    &format!("SELECT expires_at FROM kv WHERE key = ?1 AND {LIVE}"),
                    params![key, now],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(match row {
                None => KeyTtl::Missing,
                Some(None) => KeyTtl::Persistent,
                Some(Some(at)) => {
                    KeyTtl::Expires(Duration::from_millis(u64::try_from(at - now).unwrap_or(0)))
                }
            })
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            Ok(conn.query_row(
                &format!("SELECT EXISTS(SELECT 1 FROM kv WHERE key = ?1 AND {LIVE})"),
                params![key, now_ms()],
                |row| row.get(0),
            )?)
        })
        .await
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let pattern = pattern.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT key FROM kv WHERE key GLOB ?1 AND {LIVE} ORDER BY key"
            ))?;
            let keys = stmt
                .query_map(params![pattern, now_ms()], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(keys)
        })
        .await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let (key, expected) = (key.to_string(), expected.to_string());
        self.with_conn(move |conn| {
            let changed = conn.execute(
                &format!("DELETE FROM kv WHERE key = ?1 AND {LIVE} AND value = ?3"),
                params![key, now_ms(), expected],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let current: Option<String> = conn
                .query_row(
                    &format!("SELECT value FROM kv WHERE key = ?1 AND {LIVE}"),
                    params![key, now_ms()],
                    |row| row.get(0),
                )
                .optional()?;
            let next = match current {
                Some(raw) => {
                    let n: i64 = raw.parse().map_err(|_| {
                        StoreError::Serialization(format!("{key} does not hold an integer"))
                    })?;
                    n.checked_add(delta).ok_or_else(|| {
                        StoreError::Serialization(format!("{key} would overflow"))
                    })?
                }
                None => delta,
            };
            // Keep an existing TTL on live rows; a fresh counter never expires.
            conn.execute(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, NULL)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                   expires_at = CASE WHEN kv.expires_at IS NOT NULL AND kv.expires_at <= ?3
                                     THEN NULL ELSE kv.expires_at END",
                params![key, next.to_string(), now_ms()],
            )?;
            Ok(next)
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let _: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
            Ok(())
        })
        .await
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
