//! Folds normalized events into a map of in-flight conversation items.
//!
//! The processor owns the transient map for one conversation context. It
//! applies every event it is given exactly once and in the order given; it
//! does not deduplicate deliveries. Callers hand it batches already ordered by
//! sequence number (see [`order_batch`]) and call [`StreamProcessor::rebuild`]
//! when an event turns up behind ones already applied.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use super::filter::PersistedIds;
use super::items::{ItemKind, ItemStatus, TransientItem};
use crate::normalized::{EventPayload, ItemSnapshot, NormalizedEvent, SnapshotKind, WebSearchPhase};

/// Separator between reasoning summary fragments.
const SUMMARY_SEPARATOR: &str = "\n\n";

/// Stable-sort a batch by sequence number.
///
/// Events of one item keep their relative order when numbers tie.
pub fn order_batch(events: &mut [NormalizedEvent]) {
    events.sort_by_key(|e| e.sequence_number);
}

/// Stateful accumulator of transient items, keyed by stream item id.
#[derive(Debug, Default)]
pub struct StreamProcessor {
    items: HashMap<String, TransientItem>,
    /// Item ids already superseded by persisted items.
    sealed: HashSet<String>,
    touches: u64,
}

impl StreamProcessor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, item_id: &str) -> Option<&TransientItem> {
        self.items.get(item_id)
    }

    /// Whether events for `item_id` are ignored because a persisted item owns it.
    pub fn is_sealed(&self, item_id: &str) -> bool {
        self.sealed.contains(item_id)
    }

    /// Current items ordered by last update.
    pub fn items(&self) -> Vec<&TransientItem> {
        let mut items: Vec<_> = self.items.values().collect();
        items.sort_by_key(|i| i.order_key());
        items
    }

    /// Drop every item and tombstone.
    pub fn clear(&mut self) {
        self.items.clear();
        self.sealed.clear();
        self.touches = 0;
    }

    /// Drop `item_id` and fold `events` into it again from scratch, each at
    /// its own receive time. The rebuilt item counts as updated at `now`.
    pub fn rebuild<'a>(
        &mut self,
        item_id: &str,
        events: impl IntoIterator<Item = (&'a NormalizedEvent, DateTime<Utc>)>,
        now: DateTime<Utc>,
    ) -> Option<&TransientItem> {
        self.items.remove(item_id);
        for (event, at) in events {
            self.apply(event, at);
        }
        let item = self.items.get_mut(item_id)?;
        item.last_updated = item.last_updated.max(now);
        Some(item)
    }

    /// Apply one event. Returns the item it touched, if any.
    pub fn apply(&mut self, event: &NormalizedEvent, now: DateTime<Utc>) -> Option<&TransientItem> {
        let item_id = event.item_id.as_str();
        if self.sealed.contains(item_id) {
            tracing::debug!(item_id, kind = event.kind_label(), "Ignoring event for persisted item");
            return None;
        }

        match &event.payload {
            EventPayload::TextDelta { delta } => {
                let item = self.entry(item_id, ItemKind::Text, ItemStatus::InProgress, now);
                item.content.push_str(delta);
                item.is_streaming = true;
            }
            EventPayload::TextDone { text } => {
                let item = self.entry(item_id, ItemKind::Text, ItemStatus::InProgress, now);
                if let Some(text) = text {
                    item.content.clone_from(text);
                }
                item.is_streaming = false;
                item.status = ItemStatus::Completed;
            }
            EventPayload::ReasoningDelta { delta } => {
                let item = self.entry(item_id, ItemKind::Reasoning, ItemStatus::InProgress, now);
                item.started_at.get_or_insert(now);
                item.content.push_str(delta);
                item.is_streaming = true;
            }
            EventPayload::ReasoningDone { text } => {
                let item = self.entry(item_id, ItemKind::Reasoning, ItemStatus::InProgress, now);
                if let Some(text) = text {
                    item.content.clone_from(text);
                }
                item.is_streaming = false;
                item.status = ItemStatus::Completed;
                item.duration_secs = Some(elapsed_secs(item.started_at.unwrap_or(now), now));
            }
            EventPayload::ItemAdded { item: snapshot } => {
                let Some(kind) = item_kind(snapshot) else {
                    tracing::debug!(item_id, "Ignoring item-added for unsupported item type");
                    return None;
                };
                let status = default_status(kind);
                let item = self.entry(item_id, kind, status, now);
                if kind == ItemKind::Reasoning {
                    item.started_at.get_or_insert(now);
                }
                absorb_snapshot(item, snapshot);
            }
            EventPayload::ItemDone { item: snapshot } => {
                let kind = match (self.items.get(item_id), item_kind(snapshot)) {
                    (Some(existing), _) => existing.kind,
                    (None, Some(kind)) => kind,
                    (None, None) => {
                        tracing::debug!(item_id, "Ignoring item-done for unsupported item type");
                        return None;
                    }
                };
                let item = self.entry(item_id, kind, default_status(kind), now);
                absorb_snapshot(item, snapshot);
                finalize(item, snapshot, now);
            }
            EventPayload::WebSearchStateChange { phase } => {
                let status = ItemStatus::parse(phase.status_label());
                let item = self.entry(item_id, ItemKind::WebSearch, status.clone(), now);
                item.status = status;
                item.is_streaming = *phase != WebSearchPhase::Completed;
            }
        }

        self.touches += 1;
        let touch = self.touches;
        let item = self.items.get_mut(item_id)?;
        item.last_updated = now;
        item.touch = touch;
        Some(item)
    }

    /// Evict every item whose id is present among the persisted ids under
    /// any alias prefix, and return the survivors ordered by last update.
    ///
    /// Evicted ids are tombstoned: later events for them are ignored.
    pub fn filter_out_persistent_items(&mut self, persisted: &PersistedIds) -> Vec<TransientItem> {
        let evicted: Vec<String> = self
            .items
            .keys()
            .filter(|item_id| persisted.contains_item(item_id))
            .cloned()
            .collect();
        for item_id in evicted {
            tracing::debug!(item_id = %item_id, "Transient item superseded by persisted item");
            self.items.remove(&item_id);
            self.sealed.insert(item_id);
        }
        self.items().into_iter().cloned().collect()
    }

    fn entry(
        &mut self,
        item_id: &str,
        kind: ItemKind,
        status: ItemStatus,
        now: DateTime<Utc>,
    ) -> &mut TransientItem {
        self.items
            .entry(item_id.to_string())
            .or_insert_with(|| TransientItem::new(item_id, kind, status, now))
    }
}

fn item_kind(snapshot: &ItemSnapshot) -> Option<ItemKind> {
    match snapshot.kind.as_ref()? {
        SnapshotKind::Message => Some(ItemKind::Text),
        SnapshotKind::ToolCall => Some(ItemKind::ToolCall),
        SnapshotKind::ToolList => Some(ItemKind::ToolList),
        SnapshotKind::ApprovalRequest => Some(ItemKind::ApprovalRequest),
        SnapshotKind::WebSearch => Some(ItemKind::WebSearch),
        SnapshotKind::Reasoning => Some(ItemKind::Reasoning),
        SnapshotKind::Other(_) => None,
    }
}

fn default_status(kind: ItemKind) -> ItemStatus {
    match kind {
        ItemKind::ApprovalRequest => ItemStatus::WaitingApproval,
        _ => ItemStatus::InProgress,
    }
}

/// Copy the kind-specific fields a snapshot carries onto the item.
fn absorb_snapshot(item: &mut TransientItem, snapshot: &ItemSnapshot) {
    if let Some(name) = &snapshot.name {
        item.tool_name = Some(name.clone());
    }
    if let Some(arguments) = &snapshot.arguments {
        item.tool_arguments = Some(arguments.clone());
    }
    if let Some(label) = &snapshot.server_label {
        item.server_label = Some(label.clone());
    }
    if item.kind == ItemKind::ApprovalRequest && item.approval_id.is_none() {
        item.approval_id = snapshot
            .approval_id
            .clone()
            .or_else(|| snapshot.id.clone())
            .or_else(|| Some(item.item_id.clone()));
    }
}

/// Apply the terminal fields of an `item-done` snapshot.
fn finalize(item: &mut TransientItem, snapshot: &ItemSnapshot, now: DateTime<Utc>) {
    item.is_streaming = false;
    match item.kind {
        ItemKind::ToolCall => {
            item.tool_output = snapshot.output.clone().or_else(|| snapshot.error.clone());
        }
        ItemKind::ToolList => {
            item.tool_names.clone_from(&snapshot.tools);
            item.content = snapshot.tools.join(", ");
        }
        ItemKind::WebSearch => {
            if let Some(query) = &snapshot.query {
                item.content.clone_from(query);
            }
        }
        ItemKind::Reasoning => {
            if !snapshot.summary.is_empty() {
                item.content = snapshot.summary.join(SUMMARY_SEPARATOR);
            }
            if item.duration_secs.is_none() {
                item.duration_secs = Some(elapsed_secs(item.started_at.unwrap_or(now), now));
            }
        }
        ItemKind::Text => {
            if let Some(text) = &snapshot.text {
                item.content.clone_from(text);
            }
        }
        // The gate stays open until the approval controller resolves it.
        ItemKind::ApprovalRequest => return,
    }
    item.status = if snapshot.is_failed() {
        ItemStatus::Failed
    } else {
        ItemStatus::Completed
    };
}

/// Whole seconds between two instants, rounded, never negative.
fn elapsed_secs(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    let millis = (end - start).num_milliseconds().max(0);
    u64::try_from((millis + 500) / 1000).unwrap_or(0)
}
