use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TamperStoreError {
    #[error("tamper store join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[cfg(feature = "gateway-store-sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("tamper store lock poisoned")]
    Poisoned,
}

/// Append-only record of the conversation prefixes this gateway produced.
///
/// A record `(key_id, persona, prefix)` means the serialized `prefix`, ending in an assistant
/// message, was generated here for that key and persona. Records are never updated or removed,
/// and inserting an existing record is a no-op rather than an error.
#[async_trait]
pub trait TamperStore: Send + Sync {
    async fn insert_if_absent(
        &self,
        key_id: &str,
        persona: &str,
        prefix: &str,
    ) -> Result<(), TamperStoreError>;

    async fn exists(
        &self,
        key_id: &str,
        persona: &str,
        prefix: &str,
    ) -> Result<bool, TamperStoreError>;
}

/// Process-local store; history does not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryTamperStore {
    records: Mutex<HashSet<(String, String, String)>>,
}

impl MemoryTamperStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TamperStore for MemoryTamperStore {
    async fn insert_if_absent(
        &self,
        key_id: &str,
        persona: &str,
        prefix: &str,
    ) -> Result<(), TamperStoreError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| TamperStoreError::Poisoned)?;
        records.insert((key_id.to_string(), persona.to_string(), prefix.to_string()));
        Ok(())
    }

    async fn exists(
        &self,
        key_id: &str,
        persona: &str,
        prefix: &str,
    ) -> Result<bool, TamperStoreError> {
        let records = self
            .records
            .lock()
            .map_err(|_| TamperStoreError::Poisoned)?;
        Ok(records.contains(&(key_id.to_string(), persona.to_string(), prefix.to_string())))
    }
}
