//! Mutant descriptors and replacement-text application.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A single-location source edit candidate, produced upstream by the mutant
/// generator and consumed exactly once per job by the orchestrator.
///
/// `id` is assigned monotonically by the generator and serves as the
/// deduplication key for resumed jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutant {
    /// Unique, monotonically assigned identifier.
    pub id: u64,
    /// Path of the target file in the base project's path space.
    pub file_path: PathBuf,
    /// Byte offset where the replacement starts.
    pub start: usize,
    /// Byte offset where the replacement ends (exclusive).
    pub end: usize,
    /// Text written over the `start..end` range.
    pub replacement: String,
}

impl Mutant {
    /// Splice the replacement text into `source`.
    ///
    /// Returns `None` when the span is out of bounds, inverted, or does not
    /// fall on UTF-8 boundaries; a malformed span must fail the mutant, not
    /// the process.
    pub fn apply_to(&self, source: &str) -> Option<String> {
        if self.start > self.end {
            return None;
        }
        let head = source.get(..self.start)?;
        let tail = source.get(self.end..)?;

        let mut mutated = String::with_capacity(head.len() + self.replacement.len() + tail.len());
        mutated.push_str(head);
        mutated.push_str(&self.replacement);
        mutated.push_str(tail);
        Some(mutated)
    }
}
