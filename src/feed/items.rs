//! Conversation item types: transient, persisted and assembled.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::normalized::EventType;

/// Prefix of the synthetic id given to items that only exist in the stream.
pub const TRANSIENT_ID_PREFIX: &str = "stream_";

/// Kinds of in-flight item the processor can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemKind {
    Text,
    ToolCall,
    ToolList,
    ApprovalRequest,
    WebSearch,
    Reasoning,
}

/// Item status, mirroring the backend vocabulary.
///
/// Backends spell statuses with either `_` or `-`; both parse to the same
/// variant. Anything unrecognized is carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ItemStatus {
    InProgress,
    Completed,
    Failed,
    WaitingApproval,
    Searching,
    Other(String),
}

impl ItemStatus {
    pub fn parse(s: &str) -> Self {
        match s.replace('_', "-").as_str() {
            "in-progress" => Self::InProgress,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "waiting-approval" => Self::WaitingApproval,
            "searching" => Self::Searching,
            _ => Self::Other(s.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::WaitingApproval => "waiting-approval",
            Self::Searching => "searching",
            Self::Other(s) => s,
        }
    }

    /// `completed` or `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl From<String> for ItemStatus {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<ItemStatus> for String {
    fn from(status: ItemStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An item known only from the live stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransientItem {
    /// Raw stream item id, shared with the persisted item once it lands.
    pub item_id: String,
    /// Synthetic presentation id.
    pub id: String,
    pub kind: ItemKind,
    pub content: String,
    pub is_streaming: bool,
    pub status: ItemStatus,
    pub tool_name: Option<String>,
    pub tool_arguments: Option<String>,
    pub tool_output: Option<String>,
    pub server_label: Option<String>,
    /// Tool names announced by a tool-list item.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_names: Vec<String>,
    /// Approval id for approval-request items.
    pub approval_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    /// Whole seconds between reasoning start and its final summary.
    pub duration_secs: Option<u64>,
    pub last_updated: DateTime<Utc>,
    /// Tie-breaker for items touched within the same clock tick.
    #[serde(skip)]
    pub(crate) touch: u64,
}

impl TransientItem {
    pub(crate) fn new(item_id: &str, kind: ItemKind, status: ItemStatus, now: DateTime<Utc>) -> Self {
        Self {
            item_id: item_id.to_string(),
            id: format!("{TRANSIENT_ID_PREFIX}{item_id}"),
            kind,
            content: String::new(),
            is_streaming: true,
            status,
            tool_name: None,
            tool_arguments: None,
            tool_output: None,
            server_label: None,
            tool_names: Vec::new(),
            approval_id: None,
            started_at: None,
            duration_secs: None,
            last_updated: now,
            touch: 0,
        }
    }

    /// Display ordering key: last update, then touch order.
    pub fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.last_updated, self.touch)
    }

    /// Convert into the assembled output shape.
    pub fn to_unified(&self) -> UnifiedConversationItem {
        let payload = match self.kind {
            ItemKind::Text => ItemPayload::Text {
                role: Some("assistant".to_string()),
                content: self.content.clone(),
            },
            ItemKind::ToolCall => ItemPayload::ToolCall {
                name: self.tool_name.clone(),
                arguments: self.tool_arguments.clone(),
                output: self.tool_output.clone(),
                server_label: self.server_label.clone(),
            },
            ItemKind::ToolList => ItemPayload::ToolList {
                server_label: self.server_label.clone(),
                tools: self.tool_names.clone(),
                summary: self.content.clone(),
            },
            ItemKind::ApprovalRequest => ItemPayload::ApprovalRequest(ApprovalRequest {
                approval_id: self
                    .approval_id
                    .clone()
                    .unwrap_or_else(|| self.item_id.clone()),
                name: self.tool_name.clone(),
                arguments: self.tool_arguments.clone(),
                server_label: self.server_label.clone(),
            }),
            ItemKind::WebSearch => ItemPayload::WebSearch {
                query: (!self.content.is_empty()).then(|| self.content.clone()),
            },
            ItemKind::Reasoning => ItemPayload::Reasoning {
                content: self.content.clone(),
                duration_secs: self.duration_secs,
            },
        };

        UnifiedConversationItem {
            id: self.id.clone(),
            item_id: Some(self.item_id.clone()),
            timestamp: self.last_updated,
            is_streaming: self.is_streaming,
            status: self.status.clone(),
            source: ItemSource::Stream,
            payload,
        }
    }
}

/// A canonical, backend-owned conversation item.
///
/// Its id may carry one of the legacy role prefixes (`msg_`, `tool_`, ...)
/// in front of the raw stream item id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedItem {
    pub id: String,
    /// Item type, or a dotted event name for replayed stream records.
    #[serde(rename = "type", alias = "kind")]
    pub kind: String,
    #[serde(alias = "created_at", default = "epoch")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub data: Value,
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

impl PersistedItem {
    /// Whether this item stores a raw stream event rather than a conversation item.
    pub fn is_replayed_event(&self) -> bool {
        EventType::is_event_type_name(&self.kind)
    }
}

/// Where an assembled item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemSource {
    Persisted,
    /// Derived from raw events stored in the persisted list.
    Replayed,
    Stream,
}

/// A human-in-the-loop gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    /// Payload-embedded id when present, otherwise the wrapping item id.
    pub approval_id: String,
    pub name: Option<String>,
    pub arguments: Option<String>,
    pub server_label: Option<String>,
}

/// Kind-specific payload of an assembled item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ItemPayload {
    Text {
        role: Option<String>,
        content: String,
    },
    ToolCall {
        name: Option<String>,
        arguments: Option<String>,
        output: Option<String>,
        server_label: Option<String>,
    },
    ToolList {
        server_label: Option<String>,
        tools: Vec<String>,
        summary: String,
    },
    ApprovalRequest(ApprovalRequest),
    WebSearch {
        query: Option<String>,
    },
    Reasoning {
        content: String,
        duration_secs: Option<u64>,
    },
    /// Persisted item of a type this crate does not interpret.
    Other {
        type_name: String,
        data: Value,
    },
}

impl ItemPayload {
    /// Item kind, when it is one of the known kinds.
    pub fn kind(&self) -> Option<ItemKind> {
        match self {
            Self::Text { .. } => Some(ItemKind::Text),
            Self::ToolCall { .. } => Some(ItemKind::ToolCall),
            Self::ToolList { .. } => Some(ItemKind::ToolList),
            Self::ApprovalRequest(_) => Some(ItemKind::ApprovalRequest),
            Self::WebSearch { .. } => Some(ItemKind::WebSearch),
            Self::Reasoning { .. } => Some(ItemKind::Reasoning),
            Self::Other { .. } => None,
        }
    }
}

/// The assembled item handed to presentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedConversationItem {
    /// Unique within one assembled conversation.
    pub id: String,
    /// Raw stream item id, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub is_streaming: bool,
    pub status: ItemStatus,
    pub source: ItemSource,
    #[serde(flatten)]
    pub payload: ItemPayload,
}

impl UnifiedConversationItem {
    pub fn kind(&self) -> Option<ItemKind> {
        self.payload.kind()
    }

    pub fn as_approval(&self) -> Option<&ApprovalRequest> {
        match &self.payload {
            ItemPayload::ApprovalRequest(request) => Some(request),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_spellings() {
        assert_eq!(ItemStatus::parse("in_progress"), ItemStatus::InProgress);
        assert_eq!(ItemStatus::parse("waiting-approval"), ItemStatus::WaitingApproval);
        assert_eq!(
            ItemStatus::parse("queued"),
            ItemStatus::Other("queued".to_string())
        );
        assert!(ItemStatus::Failed.is_terminal());
        assert!(!ItemStatus::Searching.is_terminal());
    }

    #[test]
    fn test_persisted_item_deserialization() {
        let item: PersistedItem = serde_json::from_value(json!({
            "id": "msg_t1",
            "type": "message",
            "created_at": "2025-01-01T00:00:00Z",
            "data": { "role": "assistant", "content": "Hi" }
        }))
        .unwrap();
        assert_eq!(item.kind, "message");
        assert!(!item.is_replayed_event());

        let replay: PersistedItem = serde_json::from_value(json!({
            "id": "evt_9",
            "type": "response.reasoning_summary_text.done",
        }))
        .unwrap();
        assert!(replay.is_replayed_event());
        assert_eq!(replay.timestamp, DateTime::<Utc>::default());
    }

    #[test]
    fn test_unified_serializes_kind_tag() {
        let item = TransientItem::new("t1", ItemKind::Text, ItemStatus::InProgress, Utc::now());
        let json = serde_json::to_value(item.to_unified()).unwrap();
        assert_eq!(json["kind"], "text");
        assert_eq!(json["id"], "stream_t1");
        assert_eq!(json["status"], "in-progress");
        assert_eq!(json["isStreaming"], true);
    }

    #[test]
    fn test_payload_fields_share_item_casing() {
        let mut reasoning = TransientItem::new("r1", ItemKind::Reasoning, ItemStatus::Completed, Utc::now());
        reasoning.duration_secs = Some(3);
        let json = serde_json::to_value(reasoning.to_unified()).unwrap();
        assert_eq!(json["durationSecs"], 3);
        assert!(json.get("duration_secs").is_none());

        let mut approval = TransientItem::new("ap1", ItemKind::ApprovalRequest, ItemStatus::WaitingApproval, Utc::now());
        approval.server_label = Some("github".to_string());
        let json = serde_json::to_value(approval.to_unified()).unwrap();
        assert_eq!(json["kind"], "approval-request");
        assert_eq!(json["approvalId"], "ap1");
        assert_eq!(json["serverLabel"], "github");
        assert_eq!(json["itemId"], "ap1");

        let back: UnifiedConversationItem = serde_json::from_value(json).unwrap();
        assert_eq!(back.as_approval().unwrap().approval_id, "ap1");
    }
}
