//! TIFF conversion phase.
//!
//! The initial (and currently only) pipeline stage: every staged TIFF is
//! converted to a JPEG by one worker machine. Qualification is purely by
//! file-name suffix; the orchestrator never inspects file contents.

use platen_core::id::task_id;

use crate::message::BatchMessage;
use crate::phase::{Phase, PhaseTag};
use crate::task::Task;

/// File-name suffixes that qualify for conversion.
const TIFF_SUFFIXES: [&str; 2] = [".tif", ".tiff"];

/// The TIFF to JPEG conversion phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct TiffConversionPhase;

impl TiffConversionPhase {
    /// Returns true if the file name qualifies for this phase.
    ///
    /// Case-insensitive suffix match: `a.tiff`, `c.TIF`, and `d.TiFf` all
    /// qualify.
    #[must_use]
    pub fn matches(file_name: &str) -> bool {
        let lower = file_name.to_ascii_lowercase();
        TIFF_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
    }
}

impl Phase for TiffConversionPhase {
    fn tag(&self) -> PhaseTag {
        PhaseTag::TiffConversion
    }

    fn discover(&self, message: &BatchMessage) -> Vec<Task> {
        message
            .files()
            .filter(|file| Self::matches(&file.file_name))
            .map(|file| {
                Task::new(
                    task_id(&message.batch_id, self.tag().as_str(), &file.r2_key),
                    file.r2_key.clone(),
                    file.file_name.clone(),
                )
            })
            .collect()
    }

    fn next_phase(&self) -> Option<PhaseTag> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;

    fn message(files: &[&str]) -> BatchMessage {
        let entries: Vec<_> = files
            .iter()
            .map(|name| {
                serde_json::json!({
                    "r2_key": format!("staging/B1/{name}"),
                    "file_name": name,
                })
            })
            .collect();

        serde_json::from_value(serde_json::json!({
            "batch_id": "B1",
            "directories": [{ "files": entries }]
        }))
        .unwrap()
    }

    #[test]
    fn matches_is_case_insensitive() {
        assert!(TiffConversionPhase::matches("a.tiff"));
        assert!(TiffConversionPhase::matches("c.TIF"));
        assert!(TiffConversionPhase::matches("d.TiFf"));
        assert!(!TiffConversionPhase::matches("b.jpg"));
        assert!(!TiffConversionPhase::matches("d.pdf"));
        assert!(!TiffConversionPhase::matches("tiff"));
    }

    #[test]
    fn discover_emits_only_qualifying_files() {
        let tasks = TiffConversionPhase.discover(&message(&["a.tiff", "b.jpg", "c.TIF", "d.pdf"]));

        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Pending));
        assert!(tasks.iter().all(|t| t.retry_count == 0));

        let names: Vec<_> = tasks.iter().map(|t| t.input_name.as_str()).collect();
        assert_eq!(names, vec!["a.tiff", "c.TIF"]);
    }

    #[test]
    fn discover_is_deterministic() {
        let msg = message(&["a.tiff", "c.TIF"]);
        let first: Vec<_> = TiffConversionPhase
            .discover(&msg)
            .into_iter()
            .map(|t| t.task_id)
            .collect();
        let second: Vec<_> = TiffConversionPhase
            .discover(&msg)
            .into_iter()
            .map(|t| t.task_id)
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn conversion_is_the_final_phase() {
        assert!(TiffConversionPhase.next_phase().is_none());
    }
}
