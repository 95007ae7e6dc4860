use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use super::tamper_log::{TamperStore, TamperStoreError};

/// Durable tamper log in a single SQLite file.
///
/// Each call opens its own connection on the blocking pool; WAL mode plus a busy timeout lets
/// concurrent requests insert the same record without tripping over each other.
#[derive(Clone, Debug)]
pub struct SqliteTamperStore {
    path: PathBuf,
}

impl SqliteTamperStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), TamperStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), TamperStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    pub async fn count(&self) -> Result<u64, TamperStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<u64, TamperStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM tamper_log", [], |row| row.get(0))?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
        .await?
    }
}

#[async_trait]
impl TamperStore for SqliteTamperStore {
    async fn insert_if_absent(
        &self,
        key_id: &str,
        persona: &str,
        prefix: &str,
    ) -> Result<(), TamperStoreError> {
        let path = self.path.clone();
        let key_id = key_id.to_string();
        let persona = persona.to_string();
        let prefix = prefix.to_string();
        let ts_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<(), TamperStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT OR IGNORE INTO tamper_log (key_id, persona, conversation, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![key_id, persona, prefix, ts_ms],
            )?;
            Ok(())
        })
        .await?
    }

    async fn exists(
        &self,
        key_id: &str,
        persona: &str,
        prefix: &str,
    ) -> Result<bool, TamperStoreError> {
        let path = self.path.clone();
        let key_id = key_id.to_string();
        let persona = persona.to_string();
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || -> Result<bool, TamperStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let found: bool = conn.query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM tamper_log
                    WHERE key_id = ?1 AND persona = ?2 AND conversation = ?3
                 )",
                rusqlite::params![key_id, persona, prefix],
                |row| row.get(0),
            )?;
            Ok(found)
        })
        .await?
    }
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tamper_log (
            key_id TEXT NOT NULL,
            persona TEXT NOT NULL,
            conversation TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL,
            PRIMARY KEY (key_id, persona, conversation)
        );",
    )
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
