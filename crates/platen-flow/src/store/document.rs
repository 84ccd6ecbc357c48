//! Durable state store over a storage backend.
//!
//! Persists each batch as one JSON document at `batches/{batch_id}.json`.
//! Durability is whatever the backend provides; with an object-store
//! backend the snapshot survives process restarts, which is what recovery
//! depends on.

use std::sync::Arc;

use async_trait::async_trait;

use platen_core::BatchId;
use platen_core::storage::StorageBackend;

use super::StateStore;
use crate::batch::BatchState;
use crate::error::{Error, Result};

/// Key prefix for batch snapshots.
const BATCH_PREFIX: &str = "batches/";

/// JSON-document store over a [`StorageBackend`].
pub struct DocumentStore {
    backend: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("backend", &"<StorageBackend>")
            .finish()
    }
}

impl DocumentStore {
    /// Creates a store over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    fn key_for(batch_id: &BatchId) -> String {
        format!("{BATCH_PREFIX}{batch_id}.json")
    }

    fn id_from_key(key: &str) -> Option<BatchId> {
        key.strip_prefix(BATCH_PREFIX)?
            .strip_suffix(".json")?
            .parse()
            .ok()
    }
}

#[async_trait]
impl StateStore for DocumentStore {
    async fn get_batch(&self, batch_id: &BatchId) -> Result<Option<BatchState>> {
        let Some(bytes) = self.backend.get(&Self::key_for(batch_id)).await? else {
            return Ok(None);
        };
        let state = serde_json::from_slice(&bytes)
            .map_err(|e| Error::serialization(format!("corrupt batch snapshot: {e}")))?;
        Ok(Some(state))
    }

    async fn save_batch(&self, state: &BatchState) -> Result<()> {
        let bytes = serde_json::to_vec(state)
            .map_err(|e| Error::serialization(format!("failed to encode batch snapshot: {e}")))?;
        self.backend
            .put(&Self::key_for(&state.batch_id), bytes)
            .await?;
        Ok(())
    }

    async fn list_batch_ids(&self) -> Result<Vec<BatchId>> {
        let keys = self.backend.list(BATCH_PREFIX).await?;
        Ok(keys.iter().filter_map(|k| Self::id_from_key(k)).collect())
    }
}
