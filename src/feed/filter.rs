//! Reconciliation of transient items against persisted ids.
//!
//! Persisted ids are not uniform: depending on which backend path stored an
//! item, its id is the raw stream item id or that id behind a legacy role
//! prefix (`msg_t1`, `tool_abc`, ...). Every lookup here checks all forms.

use std::collections::HashSet;

use super::items::{PersistedItem, TransientItem};
use super::processor::StreamProcessor;

/// Role prefixes persisted ids may carry in front of the stream item id.
pub const ALIAS_PREFIXES: [&str; 6] = [
    "msg_",
    "tool_",
    "approval_",
    "tools_",
    "websearch_",
    "reasoning_",
];

/// Every persisted-id form a stream item id may appear under.
pub fn aliases(item_id: &str) -> impl Iterator<Item = String> + '_ {
    std::iter::once(item_id.to_string())
        .chain(ALIAS_PREFIXES.iter().map(move |prefix| format!("{prefix}{item_id}")))
}

/// Stream item ids a persisted id may stand for: itself, plus the id with
/// any one alias prefix removed.
pub fn candidate_item_ids(persisted_id: &str) -> impl Iterator<Item = &str> {
    std::iter::once(persisted_id).chain(
        ALIAS_PREFIXES
            .iter()
            .filter_map(move |prefix| persisted_id.strip_prefix(prefix))
            .filter(|rest| !rest.is_empty()),
    )
}

/// The persisted-id set as supplied by the task-fetch collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedIds {
    ids: HashSet<String>,
}

impl PersistedIds {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Ids of canonical items. Replayed event records are not items and
    /// are left out.
    pub fn from_items(items: &[PersistedItem]) -> Self {
        Self::from_ids(
            items
                .iter()
                .filter(|item| !item.is_replayed_event())
                .map(|item| item.id.clone()),
        )
    }

    pub fn insert(&mut self, id: impl Into<String>) {
        self.ids.insert(id.into());
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Whether a persisted item exists for `item_id` under any alias.
    pub fn contains_item(&self, item_id: &str) -> bool {
        aliases(item_id).any(|alias| self.ids.contains(&alias))
    }
}

/// Owns the persisted-id set of one conversation context and prunes the
/// transient map against it.
#[derive(Debug, Default)]
pub struct Reconciler {
    persisted: PersistedIds,
}

impl Reconciler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn persisted(&self) -> &PersistedIds {
        &self.persisted
    }

    /// Replace the persisted-id set with a fresh snapshot.
    pub fn set_persisted(&mut self, ids: PersistedIds) {
        self.persisted = ids;
    }

    /// Evict superseded transient items; returns the survivors in display order.
    ///
    /// Idempotent for an unchanged persisted set.
    pub fn reconcile(&self, processor: &mut StreamProcessor) -> Vec<TransientItem> {
        let before = processor.len();
        let remaining = processor.filter_out_persistent_items(&self.persisted);
        if remaining.len() != before {
            tracing::debug!(
                evicted = before - remaining.len(),
                remaining = remaining.len(),
                "Reconciled transient items"
            );
        }
        remaining
    }

    /// Whether a freshly arriving event for `item_id` must be ignored.
    pub fn supersedes(&self, item_id: &str) -> bool {
        self.persisted.contains_item(item_id)
    }

    /// Forget all state for the current identity.
    ///
    /// Takes the processor by `&mut` so nothing else can apply events to it
    /// until the reset has finished.
    pub fn reset(&mut self, processor: &mut StreamProcessor) {
        self.persisted = PersistedIds::new();
        processor.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_every_alias_matches() {
        for prefix in ALIAS_PREFIXES {
            let ids = PersistedIds::from_ids([format!("{prefix}abc")]);
            assert!(ids.contains_item("abc"), "prefix {prefix} should match");
            assert!(!ids.contains_item("abcd"));
        }
        assert!(PersistedIds::from_ids(["abc"]).contains_item("abc"));
    }

    #[test]
    fn test_raw_ids_that_look_prefixed() {
        // Backend ids such as `msg_01` are raw stream ids, not aliases.
        let ids = PersistedIds::from_ids(["msg_msg_01"]);
        assert!(ids.contains_item("msg_01"));
        assert!(!ids.contains_item("01"));
    }

    #[test]
    fn test_candidate_item_ids() {
        let candidates: Vec<_> = candidate_item_ids("tools_x1").collect();
        assert_eq!(candidates, vec!["tools_x1", "x1"]);
        let candidates: Vec<_> = candidate_item_ids("plain").collect();
        assert_eq!(candidates, vec!["plain"]);
    }

    #[test]
    fn test_replayed_records_are_not_ids() {
        let items: Vec<PersistedItem> = serde_json::from_value(json!([
            { "id": "msg_t1", "type": "message" },
            { "id": "r1", "type": "response.reasoning_summary_text.done" }
        ]))
        .unwrap();
        let ids = PersistedIds::from_items(&items);
        assert_eq!(ids.len(), 1);
        assert!(ids.contains_item("t1"));
        assert!(!ids.contains_item("r1"));
    }
}
