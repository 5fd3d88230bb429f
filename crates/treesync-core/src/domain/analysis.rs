//! Analysis results and change-tracking cursors

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::change::ChangeDescriptor;
use super::item::RawItem;
use super::newtypes::{AdapterId, CursorToken, UniqueId};

// ============================================================================
// ChangeTrackingCursor
// ============================================================================

/// One raw change reported by an adapter's change feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawChange {
    pub item: RawItem,
    pub deleted: bool,
}

/// Delta view returned by an adapter's change-tracking capability
///
/// `token` is committed back to the adapter only after a pass completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeTrackingCursor {
    pub token: CursorToken,
    pub changes: Vec<RawChange>,
}

impl ChangeTrackingCursor {
    #[must_use]
    pub fn new(token: CursorToken, changes: Vec<RawChange>) -> Self {
        Self { token, changes }
    }

    /// Changes with duplicates removed; the last occurrence of a unique id
    /// wins and keeps its position in the feed
    #[must_use]
    pub fn deduplicated(&self) -> Vec<RawChange> {
        let mut last: HashMap<&UniqueId, usize> = HashMap::new();
        for (idx, change) in self.changes.iter().enumerate() {
            last.insert(&change.item.unique_id, idx);
        }
        self.changes
            .iter()
            .enumerate()
            .filter(|(idx, change)| last.get(&change.item.unique_id) == Some(idx))
            .map(|(_, change)| change.clone())
            .collect()
    }
}

// ============================================================================
// AnalysisResult
// ============================================================================

/// Outcome of analysing one originating adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub adapter_id: AdapterId,
    pub descriptors: Vec<ChangeDescriptor>,
    /// Analysis-fatal error, if the analysis of this adapter was aborted
    pub exception: Option<String>,
    pub unchanged_files: u64,
    pub unchanged_directories: u64,
    /// Items skipped because the adapter flagged them with an error marker
    pub skipped: u64,
    /// Token to commit once the pass completes
    pub cursor: Option<CursorToken>,
}

impl AnalysisResult {
    #[must_use]
    pub fn new(adapter_id: AdapterId) -> Self {
        Self {
            adapter_id,
            descriptors: Vec::new(),
            exception: None,
            unchanged_files: 0,
            unchanged_directories: 0,
            skipped: 0,
            cursor: None,
        }
    }

    /// Result for an adapter whose analysis failed
    #[must_use]
    pub fn failed(adapter_id: AdapterId, message: impl Into<String>) -> Self {
        let mut result = Self::new(adapter_id);
        result.exception = Some(message.into());
        result
    }

    pub fn is_up_to_date(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn unchanged(&self) -> u64 {
        self.unchanged_files + self.unchanged_directories
    }
}

/// Relationship-wide aggregation of per-adapter results
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub results: Vec<AnalysisResult>,
}

impl AnalysisSummary {
    #[must_use]
    pub fn new(results: Vec<AnalysisResult>) -> Self {
        Self { results }
    }

    /// True iff every adapter result is empty
    pub fn is_up_to_date(&self) -> bool {
        self.results.iter().all(AnalysisResult::is_up_to_date)
    }

    pub fn total_changes(&self) -> usize {
        self.results.iter().map(|r| r.descriptors.len()).sum()
    }

    pub fn total_unchanged(&self) -> u64 {
        self.results.iter().map(AnalysisResult::unchanged).sum()
    }

    pub fn total_skipped(&self) -> u64 {
        self.results.iter().map(|r| r.skipped).sum()
    }

    pub fn has_exceptions(&self) -> bool {
        self.results.iter().any(|r| r.exception.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entry::{ContentHashes, EntryKind};
    use chrono::Utc;

    fn change(uid: &str, name: &str, deleted: bool) -> RawChange {
        RawChange {
            item: RawItem {
                unique_id: UniqueId::new(uid.to_string()).unwrap(),
                parent_id: None,
                name: name.to_string(),
                kind: EntryKind::File,
                size: 0,
                hashes: ContentHashes::default(),
                created: None,
                modified: Utc::now(),
                error: None,
            },
            deleted,
        }
    }

    #[test]
    fn test_deduplicated_keeps_last_occurrence() {
        let cursor = ChangeTrackingCursor::new(
            CursorToken::new("2".to_string()).unwrap(),
            vec![
                change("a", "first", false),
                change("b", "other", false),
                change("a", "second", false),
                change("a", "third", true),
            ],
        );
        let changes = cursor.deduplicated();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].item.name, "other");
        assert_eq!(changes[1].item.name, "third");
        assert!(changes[1].deleted);
    }

    #[test]
    fn test_summary_up_to_date() {
        let adapter = AdapterId::new("local".to_string()).unwrap();
        let mut result = AnalysisResult::new(adapter.clone());
        result.unchanged_files = 3;
        result.unchanged_directories = 1;
        let summary = AnalysisSummary::new(vec![result, AnalysisResult::new(adapter.clone())]);
        assert!(summary.is_up_to_date());
        assert_eq!(summary.total_unchanged(), 4);
        assert_eq!(summary.total_changes(), 0);
        assert!(!summary.has_exceptions());

        let failed = AnalysisSummary::new(vec![AnalysisResult::failed(adapter, "cycle")]);
        assert!(failed.has_exceptions());
    }
}
