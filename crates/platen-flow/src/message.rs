//! Inbound batch message model.
//!
//! The upstream producer finalizes an upload and emits one message per
//! batch describing the staged directory tree. The message is the only
//! input to phase discovery and is retained verbatim on the batch state so
//! later phases can re-discover from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use platen_core::BatchId;

/// One staged file within a directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// Object-store key of the staged file.
    pub r2_key: String,
    /// Path of the file within the uploaded tree.
    #[serde(default)]
    pub logical_path: String,
    /// Bare file name, used for phase classification.
    pub file_name: String,
    /// Size in bytes as reported by the uploader.
    #[serde(default)]
    pub file_size: u64,
    /// MIME type as reported by the uploader.
    #[serde(default)]
    pub content_type: String,
    /// Content identifier, when the uploader computed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
}

/// One directory of the uploaded tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// Directory path within the uploaded tree.
    #[serde(default)]
    pub directory_path: String,
    /// Uploader-provided processing hints; opaque to the orchestrator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_config: Option<serde_json::Value>,
    /// Files in this directory.
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

/// The batch descriptor delivered by the queue.
///
/// Immutable once installed on a batch: the orchestrator never rewrites the
/// message, it only derives task sets from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMessage {
    /// Batch identity; the orchestrator's primary key.
    pub batch_id: BatchId,
    /// Object-store prefix the batch was staged under.
    #[serde(default)]
    pub r2_prefix: String,
    /// Directory inventory.
    #[serde(default)]
    pub directories: Vec<DirectoryEntry>,
    /// Uploader identity.
    #[serde(default)]
    pub uploader: Option<String>,
    /// Root path of the upload.
    #[serde(default)]
    pub root_path: Option<String>,
    /// Total file count as reported by the uploader.
    #[serde(default)]
    pub total_files: u64,
    /// Total byte count as reported by the uploader.
    #[serde(default)]
    pub total_bytes: u64,
    /// When the upload started.
    #[serde(default)]
    pub uploaded_at: Option<DateTime<Utc>>,
    /// When the upload was finalized.
    #[serde(default)]
    pub finalized_at: Option<DateTime<Utc>>,
    /// Free-form producer metadata; opaque to the orchestrator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl BatchMessage {
    /// Iterates over every file in every directory.
    pub fn files(&self) -> impl Iterator<Item = &FileEntry> {
        self.directories.iter().flat_map(|d| d.files.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_minimal_message() {
        let json = serde_json::json!({
            "batch_id": "B1",
            "directories": [
                { "files": [
                    { "r2_key": "staging/B1/a.tiff", "file_name": "a.tiff" }
                ]}
            ]
        });

        let message: BatchMessage = serde_json::from_value(json).unwrap();
        assert_eq!(message.batch_id.as_str(), "B1");
        assert_eq!(message.files().count(), 1);
    }

    #[test]
    fn files_flattens_directories() {
        let json = serde_json::json!({
            "batch_id": "B1",
            "directories": [
                { "directory_path": "box-1", "files": [
                    { "r2_key": "staging/B1/box-1/a.tiff", "file_name": "a.tiff" },
                    { "r2_key": "staging/B1/box-1/b.jpg", "file_name": "b.jpg" }
                ]},
                { "directory_path": "box-2", "files": [
                    { "r2_key": "staging/B1/box-2/c.TIF", "file_name": "c.TIF" }
                ]}
            ]
        });

        let message: BatchMessage = serde_json::from_value(json).unwrap();
        let keys: Vec<_> = message.files().map(|f| f.r2_key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "staging/B1/box-1/a.tiff",
                "staging/B1/box-1/b.jpg",
                "staging/B1/box-2/c.TIF"
            ]
        );
    }

    #[test]
    fn rejects_invalid_batch_id() {
        let json = serde_json::json!({ "batch_id": "", "directories": [] });
        assert!(serde_json::from_value::<BatchMessage>(json).is_err());
    }
}
