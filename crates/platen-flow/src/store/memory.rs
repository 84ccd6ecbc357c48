//! In-memory state store for testing.
//!
//! Not durable: snapshots are lost when the process exits.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use platen_core::BatchId;

use super::StateStore;
use crate::batch::BatchState;
use crate::error::{Error, Result};

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

/// In-memory store for tests and local development.
#[derive(Debug, Default)]
pub struct MemoryStore {
    batches: RwLock<HashMap<BatchId, BatchState>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored batches.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn batch_count(&self) -> Result<usize> {
        let batches = self.batches.read().map_err(poison_err)?;
        Ok(batches.len())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_batch(&self, batch_id: &BatchId) -> Result<Option<BatchState>> {
        let batches = self.batches.read().map_err(poison_err)?;
        Ok(batches.get(batch_id).cloned())
    }

    async fn save_batch(&self, state: &BatchState) -> Result<()> {
        let mut batches = self.batches.write().map_err(poison_err)?;
        batches.insert(state.batch_id.clone(), state.clone());
        Ok(())
    }

    async fn list_batch_ids(&self) -> Result<Vec<BatchId>> {
        let batches = self.batches.read().map_err(poison_err)?;
        Ok(batches.keys().cloned().collect())
    }
}
