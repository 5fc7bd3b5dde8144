//! Merges persisted history with surviving transient items.
//!
//! Output order: persisted items in storage order, then transient items by
//! last update. Persisted records that embed a raw stream event are replayed
//! through a scratch [`StreamProcessor`] to recover what only the event knew
//! (a reasoning duration, say). A replay-derived item is emitted only when
//! neither a canonical persisted item nor a live transient item already
//! represents the same stream item.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use super::filter::{PersistedIds, candidate_item_ids};
use super::items::{
    ApprovalRequest, ItemKind, ItemPayload, ItemSource, ItemStatus, PersistedItem, TransientItem,
    UnifiedConversationItem,
};
use super::processor::StreamProcessor;
use crate::normalized::{ItemSnapshot, NormalizedEvent, SnapshotKind, normalize_replayed};

/// Build the ordered, deduplicated conversation.
pub fn assemble(persisted: &[PersistedItem], transient: &[TransientItem]) -> Vec<UnifiedConversationItem> {
    let canonical_ids = PersistedIds::from_items(persisted);
    let live_ids: HashSet<&str> = transient.iter().map(|t| t.item_id.as_str()).collect();
    let replay = replay_events(persisted);

    let mut out = Vec::with_capacity(persisted.len() + transient.len());
    for (position, item) in persisted.iter().enumerate() {
        if item.is_replayed_event() {
            // Derived items surface at the storage position of their first record.
            for derived in replay.first_seen_at(position) {
                if canonical_ids.contains_item(&derived.item_id) || live_ids.contains(derived.item_id.as_str()) {
                    continue;
                }
                let mut unified = derived.to_unified();
                unified.source = ItemSource::Replayed;
                out.push(unified);
            }
            continue;
        }
        let mut unified = persisted_to_unified(item);
        replay.enrich(item, &mut unified);
        out.push(unified);
    }

    let mut live: Vec<&TransientItem> = transient
        .iter()
        .filter(|t| !canonical_ids.contains_item(&t.item_id))
        .collect();
    live.sort_by_key(|t| t.order_key());
    out.extend(live.into_iter().map(TransientItem::to_unified));

    dedupe_ids(out)
}

/// Convert a canonical persisted item into the assembled shape.
pub fn persisted_to_unified(item: &PersistedItem) -> UnifiedConversationItem {
    let snapshot = ItemSnapshot::from_value(&item.data);
    let kind = SnapshotKind::parse(&item.kind);
    let payload = match &kind {
        SnapshotKind::Message => ItemPayload::Text {
            role: snapshot.role.clone(),
            content: snapshot
                .text
                .clone()
                .or_else(|| text_field(&item.data))
                .unwrap_or_default(),
        },
        SnapshotKind::ToolCall => ItemPayload::ToolCall {
            name: snapshot.name.clone(),
            arguments: snapshot.arguments.clone(),
            output: snapshot.output.clone().or_else(|| snapshot.error.clone()),
            server_label: snapshot.server_label.clone(),
        },
        SnapshotKind::ToolList => ItemPayload::ToolList {
            server_label: snapshot.server_label.clone(),
            summary: snapshot.tools.join(", "),
            tools: snapshot.tools.clone(),
        },
        SnapshotKind::ApprovalRequest => ItemPayload::ApprovalRequest(ApprovalRequest {
            approval_id: snapshot
                .approval_id
                .clone()
                .or_else(|| snapshot.id.clone())
                .unwrap_or_else(|| wrapped_item_id(&item.id).to_string()),
            name: snapshot.name.clone(),
            arguments: snapshot.arguments.clone(),
            server_label: snapshot.server_label.clone(),
        }),
        SnapshotKind::WebSearch => ItemPayload::WebSearch {
            query: snapshot.query.clone(),
        },
        SnapshotKind::Reasoning => ItemPayload::Reasoning {
            content: if snapshot.summary.is_empty() {
                text_field(&item.data).unwrap_or_default()
            } else {
                snapshot.summary.join("\n\n")
            },
            duration_secs: item.data.get("duration_secs").and_then(Value::as_u64),
        },
        SnapshotKind::Other(type_name) => ItemPayload::Other {
            type_name: type_name.clone(),
            data: item.data.clone(),
        },
    };

    let status = item
        .status
        .as_deref()
        .or(snapshot.status.as_deref())
        .map_or_else(|| default_persisted_status(&kind), ItemStatus::parse);

    UnifiedConversationItem {
        id: item.id.clone(),
        item_id: None,
        timestamp: item.timestamp,
        is_streaming: false,
        status,
        source: ItemSource::Persisted,
        payload,
    }
}

fn default_persisted_status(kind: &SnapshotKind) -> ItemStatus {
    match kind {
        SnapshotKind::ApprovalRequest => ItemStatus::WaitingApproval,
        _ => ItemStatus::Completed,
    }
}

/// The stream id behind a persisted id, for display fallbacks only.
fn wrapped_item_id(persisted_id: &str) -> &str {
    candidate_item_ids(persisted_id).last().unwrap_or(persisted_id)
}

fn text_field(data: &Value) -> Option<String> {
    data.get("text")
        .or_else(|| data.get("content"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

/// Items derived from replayed event records.
#[derive(Debug, Default)]
struct Replay {
    items: HashMap<String, TransientItem>,
    /// Storage position of the first record of each item, in first-seen order.
    first_seen: Vec<(usize, String)>,
}

impl Replay {
    fn first_seen_at(&self, position: usize) -> impl Iterator<Item = &TransientItem> {
        self.first_seen
            .iter()
            .filter(move |(pos, _)| *pos == position)
            .filter_map(|(_, item_id)| self.items.get(item_id))
    }

    /// Fill gaps in a canonical item from what its replayed events carried.
    fn enrich(&self, persisted: &PersistedItem, unified: &mut UnifiedConversationItem) {
        let Some(derived) = candidate_item_ids(&persisted.id).find_map(|id| self.items.get(id)) else {
            return;
        };
        unified.item_id = Some(derived.item_id.clone());
        match &mut unified.payload {
            ItemPayload::Reasoning {
                content,
                duration_secs,
            } if derived.kind == ItemKind::Reasoning => {
                if duration_secs.is_none() {
                    *duration_secs = derived.duration_secs;
                }
                if content.is_empty() {
                    content.clone_from(&derived.content);
                }
            }
            ItemPayload::Text { content, .. } if derived.kind == ItemKind::Text => {
                if content.is_empty() {
                    content.clone_from(&derived.content);
                }
            }
            ItemPayload::ToolCall { output, .. } if derived.kind == ItemKind::ToolCall => {
                if output.is_none() {
                    output.clone_from(&derived.tool_output);
                }
            }
            _ => {}
        }
    }
}

/// Normalize every replayed record and fold them per item.
///
/// A malformed record is skipped on its own; the rest still replay.
fn replay_events(persisted: &[PersistedItem]) -> Replay {
    let mut events: Vec<(usize, NormalizedEvent)> = Vec::new();
    for (position, item) in persisted.iter().enumerate() {
        if !item.is_replayed_event() {
            continue;
        }
        match normalize_replayed(&item.kind, &item.data) {
            Ok(event) => events.push((position, event)),
            Err(err) => {
                tracing::warn!(persisted_id = %item.id, reason = %err, "Skipping replayed event");
            }
        }
    }
    // Per-item sequence order; storage order breaks ties.
    events.sort_by_key(|(position, event)| (event.sequence_number, *position));

    let mut processor = StreamProcessor::new();
    let mut replay = Replay::default();
    let mut seen: HashMap<String, usize> = HashMap::new();
    for (position, event) in &events {
        let first = seen.entry(event.item_id.clone()).or_insert(*position);
        *first = (*first).min(*position);
        processor.apply(event, persisted[*position].timestamp);
    }

    let mut first_seen: Vec<(usize, String)> = seen.into_iter().map(|(id, pos)| (pos, id)).collect();
    first_seen.sort();
    for (_, item_id) in &first_seen {
        if let Some(item) = processor.get(item_id) {
            replay.items.insert(item_id.clone(), item.clone());
        }
    }
    replay.first_seen = first_seen;
    replay
}

/// Keep the first occurrence of every id.
fn dedupe_ids(items: Vec<UnifiedConversationItem>) -> Vec<UnifiedConversationItem> {
    let mut seen = HashSet::with_capacity(items.len());
    items
        .into_iter()
        .filter(|item| {
            let fresh = seen.insert(item.id.clone());
            if !fresh {
                tracing::warn!(id = %item.id, "Dropping duplicate conversation item");
            }
            fresh
        })
        .collect()
}
