//! Durable ledger store.
//!
//! State lives in memory behind a single `RwLock`. Every mutation goes
//! through [`LedgerStore::transaction`], which holds the write lock for the
//! whole check-then-act sequence; this is what serialises reservations for a
//! user. When a storage path is configured, a JSON snapshot is written
//! before each transaction commits, and a transaction whose snapshot fails
//! is rolled back.

use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::types::{CreditAllocation, StreamingSession, UsageRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Data version for schema migrations.
const DATA_VERSION: u32 = 1;

/// Persistent data structure for the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerData {
    /// Schema version for migrations.
    pub version: u32,
    /// Every allocation ever created, in creation order.
    pub allocations: Vec<CreditAllocation>,
    /// Append-only usage log.
    pub usage_log: Vec<UsageRecord>,
    /// Streaming sessions by session id.
    pub sessions: HashMap<String, StreamingSession>,
}

impl Default for LedgerData {
    fn default() -> Self {
        Self {
            version: DATA_VERSION,
            allocations: Vec::new(),
            usage_log: Vec::new(),
            sessions: HashMap::new(),
        }
    }
}

/// In-memory ledger with optional JSON snapshots.
pub struct LedgerStore {
    data: RwLock<LedgerData>,
    storage_path: Option<PathBuf>,
    /// Orders snapshot writes so an older snapshot never overwrites a newer one.
    persist_lock: Mutex<()>,
}

impl LedgerStore {
    /// Create a store that never touches disk.
    pub fn memory() -> Arc<Self> {
        Arc::new(Self {
            data: RwLock::new(LedgerData::default()),
            storage_path: None,
            persist_lock: Mutex::new(()),
        })
    }

    /// Create a store backed by a snapshot file, loading it if present.
    pub async fn open(storage_path: PathBuf) -> Result<Arc<Self>, LedgerError> {
        let store = Arc::new(Self {
            data: RwLock::new(LedgerData::default()),
            storage_path: Some(storage_path),
            persist_lock: Mutex::new(()),
        });

        store.load().await?;

        Ok(store)
    }

    /// Create the store described by the configuration.
    pub async fn from_config(config: &LedgerConfig) -> Result<Arc<Self>, LedgerError> {
        if config.persist {
            Self::open(config.storage_path.clone()).await
        } else {
            info!("Ledger persistence disabled, using in-memory storage");
            Ok(Self::memory())
        }
    }

    /// Run a read-only closure against the current state.
    pub async fn read<R>(&self, f: impl FnOnce(&LedgerData) -> R) -> R {
        let data = self.data.read().await;
        f(&data)
    }

    /// Run a mutation under the write lock and persist it.
    ///
    /// All-or-nothing when a storage path is configured: if the closure
    /// fails or the snapshot cannot be written, the state is restored to
    /// what it was before the call. The write lock is held until the
    /// snapshot is on disk, so snapshots are written in commit order.
    /// In-memory stores skip the pre-image, so their closures must validate
    /// before they mutate.
    pub async fn transaction<R>(
        &self,
        f: impl FnOnce(&mut LedgerData) -> Result<R, LedgerError>,
    ) -> Result<R, LedgerError> {
        let mut data = self.data.write().await;

        let Some(path) = &self.storage_path else {
            return f(&mut data);
        };

        let before = data.clone();
        let result = match f(&mut data) {
            Ok(result) => result,
            Err(e) => {
                *data = before;
                return Err(e);
            }
        };

        if let Err(e) = write_snapshot(path, &data).await {
            error!("Failed to persist ledger, rolling back transaction: {}", e);
            *data = before;
            return Err(e);
        }

        Ok(result)
    }

    /// Write a snapshot to disk, if a storage path is configured.
    pub async fn persist(&self) -> Result<(), LedgerError> {
        let Some(path) = &self.storage_path else {
            return Ok(());
        };

        let _guard = self.persist_lock.lock().await;
        let data = self.data.read().await;
        write_snapshot(path, &data).await
    }

    /// Load data from the snapshot file.
    async fn load(&self) -> Result<(), LedgerError> {
        let Some(path) = &self.storage_path else {
            return Ok(());
        };

        if !fs::try_exists(path).await? {
            info!("Ledger snapshot not found at {:?}, starting fresh", path);
            return Ok(());
        }

        let bytes = fs::read(path).await?;
        if bytes.is_empty() {
            warn!("Ledger snapshot at {:?} is empty, starting fresh", path);
            return Ok(());
        }

        let data: LedgerData = serde_json::from_slice(&bytes)?;
        if data.version != DATA_VERSION {
            return Err(LedgerError::Storage(format!(
                "unsupported ledger snapshot version {} (expected {})",
                data.version, DATA_VERSION
            )));
        }

        info!(
            "Loaded ledger: {} allocations, {} usage records, {} sessions",
            data.allocations.len(),
            data.usage_log.len(),
            data.sessions.len()
        );

        *self.data.write().await = data;

        Ok(())
    }

    /// Get summary statistics.
    pub async fn stats(&self) -> LedgerStats {
        self.read(|data| LedgerStats {
            total_allocations: data.allocations.len(),
            total_usage_records: data.usage_log.len(),
            total_sessions: data.sessions.len(),
            active_sessions: data
                .sessions
                .values()
                .filter(|s| !s.status.is_terminal())
                .count(),
        })
        .await
    }
}

/// Serialize `data` and replace the snapshot at `path` via a temp file.
async fn write_snapshot(path: &Path, data: &LedgerData) -> Result<(), LedgerError> {
    let bytes = serde_json::to_vec(data)?;

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    // Atomic write
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, &bytes).await?;
    fs::rename(&temp_path, path).await?;

    debug!("Saved ledger ({} bytes) to {:?}", bytes.len(), path);

    Ok(())
}

/// Summary statistics for the ledger.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerStats {
    pub total_allocations: usize,
    pub total_usage_records: usize,
    pub total_sessions: usize,
    pub active_sessions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    fn allocation(user: &str, amount: u64) -> CreditAllocation {
        CreditAllocation::new(user, amount, Utc::now() + Duration::days(30), "admin grant")
    }

    #[tokio::test]
    async fn test_transaction_commits() {
        let store = LedgerStore::memory();

        store
            .transaction(|data| {
                data.allocations.push(allocation("alice", 10));
                Ok(())
            })
            .await
            .unwrap();

        let count = store.read(|data| data.allocations.len()).await;
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_transaction_error_propagates() {
        let store = LedgerStore::memory();

        let result: Result<(), _> = store
            .transaction(|_| Err(LedgerError::InvalidAmount("zero".into())))
            .await;

        assert!(matches!(result, Err(LedgerError::InvalidAmount(_))));
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let storage_path = temp_dir.path().join("ledger.json");

        {
            let store = LedgerStore::open(storage_path.clone()).await.unwrap();
            store
                .transaction(|data| {
                    data.allocations.push(allocation("alice", 42));
                    Ok(())
                })
                .await
                .unwrap();
        }

        {
            let store = LedgerStore::open(storage_path).await.unwrap();
            let remaining = store
                .read(|data| data.allocations.iter().map(|a| a.remaining).sum::<u64>())
                .await;
            assert_eq!(remaining, 42);
        }
    }

    #[tokio::test]
    async fn test_failed_snapshot_rolls_back() {
        let temp_dir = TempDir::new().unwrap();
        let snapshot_dir = temp_dir.path().join("d");
        let store = LedgerStore::open(snapshot_dir.join("ledger.json"))
            .await
            .unwrap();

        store
            .transaction(|data| {
                data.allocations.push(allocation("alice", 10));
                Ok(())
            })
            .await
            .unwrap();

        // A regular file where the snapshot directory should be
        std::fs::remove_dir_all(&snapshot_dir).unwrap();
        std::fs::write(&snapshot_dir, b"").unwrap();

        let result = store
            .transaction(|data| {
                data.allocations[0].remaining = 0;
                data.allocations.push(allocation("alice", 5));
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(LedgerError::Storage(_))));
        let (count, remaining) = store
            .read(|data| {
                (
                    data.allocations.len(),
                    data.allocations.iter().map(|a| a.remaining).sum::<u64>(),
                )
            })
            .await;
        assert_eq!(count, 1);
        assert_eq!(remaining, 10);
    }

    #[tokio::test]
    async fn test_closure_error_rolls_back_persisted_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = LedgerStore::open(temp_dir.path().join("ledger.json"))
            .await
            .unwrap();

        let result: Result<(), _> = store
            .transaction(|data| {
                data.allocations.push(allocation("alice", 10));
                Err(LedgerError::InvalidAmount("late".into()))
            })
            .await;

        assert!(matches!(result, Err(LedgerError::InvalidAmount(_))));
        assert_eq!(store.read(|data| data.allocations.len()).await, 0);
    }

    #[tokio::test]
    async fn test_missing_snapshot_starts_fresh() {
        let temp_dir = TempDir::new().unwrap();
        let store = LedgerStore::open(temp_dir.path().join("nested/ledger.json"))
            .await
            .unwrap();

        let stats = store.stats().await;
        assert_eq!(stats.total_allocations, 0);
        assert_eq!(stats.total_sessions, 0);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let storage_path = temp_dir.path().join("ledger.json");
        std::fs::write(&storage_path, b"not json").unwrap();

        let result = LedgerStore::open(storage_path).await;
        assert!(matches!(result, Err(LedgerError::Serialization(_))));
    }
}
