use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{StoreBatch, SyncStore};
use crate::error::{Result, SyncError};

/// Last fully projected block of one listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub listener: String,
    pub last_processed_block: u64,
    pub updated_at: DateTime<Utc>,
}

/// Durable, monotonic sync progress for a single listener
#[derive(Clone)]
pub struct CheckpointTracker {
    store: Arc<SyncStore>,
    listener: String,
}

impl CheckpointTracker {
    pub fn new(store: Arc<SyncStore>, listener: impl Into<String>) -> Self {
        Self {
            store,
            listener: listener.into(),
        }
    }

    pub fn listener(&self) -> &str {
        &self.listener
    }

    /// Last committed block, 0 if the listener never committed
    pub fn get(&self) -> Result<u64> {
        Ok(self
            .store
            .checkpoint(&self.listener)?
            .map(|c| c.last_processed_block)
            .unwrap_or(0))
    }

    /// Commit `block_number` on its own
    pub fn commit(&self, block_number: u64) -> Result<()> {
        let mut batch = self.store.begin_write();
        self.stage(&mut batch, block_number)?;
        batch.commit()
    }

    /// Add the checkpoint advance to a pending batch. Fails with
    /// `StaleCheckpoint` unless `block_number` is above the current value.
    pub fn stage(&self, batch: &mut StoreBatch<'_>, block_number: u64) -> Result<()> {
        let current = batch
            .get_checkpoint(&self.listener)?
            .map(|c| c.last_processed_block);
        if let Some(current) = current {
            if block_number <= current {
                return Err(SyncError::StaleCheckpoint {
                    listener: self.listener.clone(),
                    attempted: block_number,
                    current,
                });
            }
        }
        batch.put_checkpoint(&SyncCheckpoint {
            listener: self.listener.clone(),
            last_processed_block: block_number,
            updated_at: Utc::now(),
        })
    }

    /// Checkpoints of every listener that has committed
    pub fn list(store: &SyncStore) -> Result<Vec<SyncCheckpoint>> {
        store.checkpoints()
    }
}
