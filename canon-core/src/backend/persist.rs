//! Durable batch markers in a JSON file.
//!
//! The file is rewritten whole on every change, through a temporary file and
//! a rename, so a crash leaves either the old or the new contents.

use super::BatchLedger;
use crate::commit::ScopeBatch;
use crate::error::StoreError;
use crate::id::ScopeId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

impl From<PersistError> for StoreError {
    fn from(e: PersistError) -> Self {
        StoreError::Permanent(e.to_string())
    }
}

/// Current ledger file version.
const LEDGER_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    saved_at: DateTime<Utc>,
    batches: Vec<ScopeBatch>,
}

/// Batch ledger persisted to a single JSON file.
#[derive(Debug)]
pub struct JsonBatchLedger {
    path: PathBuf,
    batches: Mutex<HashMap<ScopeId, ScopeBatch>>,
}

impl JsonBatchLedger {
    /// Open the ledger at `path`, starting empty if the file does not exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let path = path.as_ref().to_path_buf();
        let batches = match fs::read_to_string(&path).await {
            Ok(content) => {
                let file: LedgerFile = serde_json::from_str(&content)?;
                if file.version != LEDGER_VERSION {
                    return Err(PersistError::VersionMismatch {
                        expected: LEDGER_VERSION,
                        found: file.version,
                    });
                }
                file.batches
                    .into_iter()
                    .map(|b| (b.scope.clone(), b))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), batches = batches.len(), "batch ledger opened");
        Ok(Self {
            path,
            batches: Mutex::new(batches),
        })
    }

    /// Where the ledger lives.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Scopes with a marker, in no particular order.
    pub async fn scopes(&self) -> Vec<ScopeId> {
        self.batches.lock().await.keys().cloned().collect()
    }

    async fn save(&self, batches: &HashMap<ScopeId, ScopeBatch>) -> Result<(), PersistError> {
        let mut sorted: Vec<ScopeBatch> = batches.values().cloned().collect();
        sorted.sort_by(|a, b| a.scope.cmp(&b.scope));
        let file = LedgerFile {
            version: LEDGER_VERSION,
            saved_at: Utc::now(),
            batches: sorted,
        };
        let content = serde_json::to_string_pretty(&file)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl BatchLedger for JsonBatchLedger {
    async fn get(&self, scope: &ScopeId) -> Result<Option<ScopeBatch>, StoreError> {
        Ok(self.batches.lock().await.get(scope).cloned())
    }

    async fn put(&self, batch: &ScopeBatch) -> Result<(), StoreError> {
        let mut batches = self.batches.lock().await;
        let previous = batches.insert(batch.scope.clone(), batch.clone());
        if let Err(e) = self.save(&batches).await {
            // Keep memory in step with disk.
            match previous {
                Some(prev) => batches.insert(batch.scope.clone(), prev),
                None => batches.remove(&batch.scope),
            };
            return Err(e.into());
        }
        Ok(())
    }

    async fn clear(&self, scope: &ScopeId) -> Result<(), StoreError> {
        let mut batches = self.batches.lock().await;
        let Some(previous) = batches.remove(scope) else {
            return Ok(());
        };
        if let Err(e) = self.save(&batches).await {
            batches.insert(scope.clone(), previous);
            return Err(e.into());
        }
        Ok(())
    }
}
