//! Pluggable persistence for batch control state.
//!
//! The [`StateStore`] trait is the durability seam of the orchestrator: a
//! snapshot saved here must survive a process restart so that recovery can
//! re-arm alarms for in-flight batches. [`MemoryStore`] backs unit tests;
//! [`DocumentStore`] persists JSON documents through a
//! [`StorageBackend`](platen_core::storage::StorageBackend).

pub mod document;
pub mod memory;

use async_trait::async_trait;

use platen_core::BatchId;

use crate::batch::BatchState;
use crate::error::Result;

pub use document::DocumentStore;
pub use memory::MemoryStore;

/// Persistence for batch snapshots, one logical record per batch id.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Reads a batch snapshot. Returns `None` if the batch is unknown.
    async fn get_batch(&self, batch_id: &BatchId) -> Result<Option<BatchState>>;

    /// Writes a batch snapshot, replacing any prior record.
    async fn save_batch(&self, state: &BatchState) -> Result<()>;

    /// Lists every persisted batch id.
    async fn list_batch_ids(&self) -> Result<Vec<BatchId>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::PhaseTag;
    use platen_core::storage::StorageBackend;

    fn state(batch_id: &str) -> BatchState {
        let message = serde_json::from_value(serde_json::json!({
            "batch_id": batch_id,
            "directories": []
        }))
        .unwrap();
        BatchState::new(message, PhaseTag::TiffConversion, vec![], chrono::Utc::now())
    }

    #[tokio::test]
    async fn memory_store_roundtrip() -> Result<()> {
        let store = MemoryStore::new();
        let original = state("B1");

        store.save_batch(&original).await?;
        let loaded = store.get_batch(&original.batch_id).await?.unwrap();
        assert_eq!(loaded.batch_id, original.batch_id);
        assert_eq!(loaded.status, original.status);
        Ok(())
    }

    #[tokio::test]
    async fn memory_store_lists_ids() -> Result<()> {
        let store = MemoryStore::new();
        store.save_batch(&state("B2")).await?;
        store.save_batch(&state("B1")).await?;

        let mut ids: Vec<_> = store
            .list_batch_ids()
            .await?
            .into_iter()
            .map(|id| id.to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["B1", "B2"]);
        Ok(())
    }

    #[tokio::test]
    async fn document_store_roundtrip() -> Result<()> {
        use platen_core::storage::MemoryBackend;
        use std::sync::Arc;

        let backend = Arc::new(MemoryBackend::new());
        let store = DocumentStore::new(backend.clone());
        let original = state("B1");

        store.save_batch(&original).await?;
        assert!(backend.head("batches/B1.json").await?);

        let loaded = store.get_batch(&original.batch_id).await?.unwrap();
        assert_eq!(loaded.batch_id, original.batch_id);

        let ids = store.list_batch_ids().await?;
        assert_eq!(ids.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_batch_is_none() -> Result<()> {
        let store = MemoryStore::new();
        let missing = BatchId::new("missing").unwrap();
        assert!(store.get_batch(&missing).await?.is_none());
        Ok(())
    }
}
