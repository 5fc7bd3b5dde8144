//! Normalized event model for live and replayed agent feeds.
//!
//! Raw records reach this crate in two shapes:
//! - live feed frames, where the event fields sit at the top level
//!   (`{"type": "response.output_text.delta", "item_id": "t1", "delta": "Hel"}`);
//! - replayed records embedded in persisted items, where the event body is
//!   wrapped in a `data`, `event` or `payload` object.
//!
//! Both are mapped onto one [`NormalizedEvent`] contract. Records that do not
//! fit the vocabulary are rejected with a [`NormalizeError`] and never reach
//! the processor.
//!
//! # Example
//!
//! ```rust
//! use agent_feed::normalized::{normalize, EventPayload};
//!
//! let raw = serde_json::json!({
//!     "type": "response.output_text.delta",
//!     "sequence_number": 3,
//!     "item_id": "t1",
//!     "delta": "Hel"
//! });
//! let event = normalize(&raw).unwrap();
//! assert_eq!(event.item_id, "t1");
//! assert!(matches!(event.payload, EventPayload::TextDelta { .. }));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::NormalizeError;

/// Namespace some producers put in front of every event type.
const RESPONSE_NAMESPACE: &str = "response.";

/// Fields that may wrap the event body of a replayed record.
const ENVELOPE_FIELDS: [&str; 3] = ["data", "event", "payload"];

/// Phase reported by a `web_search_call.*` side-channel event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebSearchPhase {
    InProgress,
    Searching,
    Completed,
}

impl WebSearchPhase {
    /// Status label the phase maps onto.
    pub fn status_label(self) -> &'static str {
        match self {
            Self::InProgress => "in-progress",
            Self::Searching => "searching",
            Self::Completed => "completed",
        }
    }
}

/// Event type names of the input vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventType {
    OutputItemAdded,
    OutputItemDone,
    OutputTextDelta,
    OutputTextDone,
    ReasoningSummaryTextDelta,
    ReasoningSummaryTextDone,
    WebSearchCall(WebSearchPhase),
    /// Anything outside the vocabulary. Kept so callers can log the name.
    Unknown(String),
}

impl EventType {
    /// Parse a dotted type name, with or without the `response.` namespace.
    pub fn parse(name: &str) -> Self {
        let short = name.strip_prefix(RESPONSE_NAMESPACE).unwrap_or(name);
        match short {
            "output_item.added" => Self::OutputItemAdded,
            "output_item.done" => Self::OutputItemDone,
            "output_text.delta" => Self::OutputTextDelta,
            "output_text.done" => Self::OutputTextDone,
            "reasoning_summary_text.delta" => Self::ReasoningSummaryTextDelta,
            "reasoning_summary_text.done" => Self::ReasoningSummaryTextDone,
            "web_search_call.in_progress" => Self::WebSearchCall(WebSearchPhase::InProgress),
            "web_search_call.searching" => Self::WebSearchCall(WebSearchPhase::Searching),
            "web_search_call.completed" => Self::WebSearchCall(WebSearchPhase::Completed),
            _ => Self::Unknown(name.to_string()),
        }
    }

    /// Canonical wire name (without namespace).
    pub fn wire_name(&self) -> &str {
        match self {
            Self::OutputItemAdded => "output_item.added",
            Self::OutputItemDone => "output_item.done",
            Self::OutputTextDelta => "output_text.delta",
            Self::OutputTextDone => "output_text.done",
            Self::ReasoningSummaryTextDelta => "reasoning_summary_text.delta",
            Self::ReasoningSummaryTextDone => "reasoning_summary_text.done",
            Self::WebSearchCall(WebSearchPhase::InProgress) => "web_search_call.in_progress",
            Self::WebSearchCall(WebSearchPhase::Searching) => "web_search_call.searching",
            Self::WebSearchCall(WebSearchPhase::Completed) => "web_search_call.completed",
            Self::Unknown(name) => name,
        }
    }

    /// Whether a type name looks like a stream event rather than a stored item.
    ///
    /// Persisted items that embed a raw event are recognized by this
    /// convention: their type is a dotted event name.
    pub fn is_event_type_name(name: &str) -> bool {
        name.contains('.')
    }
}

/// Item-kind tag found inside an `item` snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Message,
    ToolCall,
    ToolList,
    ApprovalRequest,
    WebSearch,
    Reasoning,
    Other(String),
}

impl SnapshotKind {
    /// Map a backend item type onto a snapshot kind.
    pub fn parse(type_name: &str) -> Self {
        match type_name {
            "message" | "text" => Self::Message,
            "function_call" | "mcp_call" | "tool_call" | "custom_tool_call"
            | "file_search_call" | "code_interpreter_call" => Self::ToolCall,
            "mcp_list_tools" | "tool_list" => Self::ToolList,
            "mcp_approval_request" | "approval_request" => Self::ApprovalRequest,
            "web_search_call" | "web_search" => Self::WebSearch,
            "reasoning" => Self::Reasoning,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Kind-specific payload carried by `output_item.*` events.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub kind: Option<SnapshotKind>,
    pub id: Option<String>,
    pub status: Option<String>,
    pub role: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub server_label: Option<String>,
    pub query: Option<String>,
    /// Names listed by a tool-list item.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Reasoning summary fragments, in order.
    #[serde(default)]
    pub summary: Vec<String>,
    /// Final text of a message item, joined from its content parts.
    pub text: Option<String>,
    /// Id embedded in an approval payload, distinct from the stream item id.
    pub approval_id: Option<String>,
}

impl ItemSnapshot {
    /// Read a snapshot out of an `item` object. Unknown fields are ignored.
    pub fn from_value(item: &Value) -> Self {
        let kind = str_field(item, "type").map(SnapshotKind::parse);
        let tools = item
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|t| str_field(t, "name").or_else(|| t.as_str()))
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let summary = item
            .get("summary")
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| str_field(p, "text").or_else(|| p.as_str()))
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let query = item
            .get("action")
            .and_then(|a| str_field(a, "query"))
            .or_else(|| str_field(item, "query"))
            .map(ToString::to_string);

        Self {
            kind,
            id: owned(str_field(item, "id")),
            status: owned(str_field(item, "status")),
            role: owned(str_field(item, "role")),
            name: owned(str_field(item, "name")),
            arguments: item.get("arguments").and_then(text_or_json),
            output: item.get("output").and_then(text_or_json),
            error: item.get("error").and_then(text_or_json),
            server_label: owned(str_field(item, "server_label")),
            query,
            tools,
            summary,
            text: message_text(item),
            approval_id: owned(
                str_field(item, "approval_request_id").or_else(|| str_field(item, "approval_id")),
            ),
        }
    }

    /// Whether the backend reported this item as failed.
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
            || matches!(self.status.as_deref(), Some("failed" | "incomplete"))
    }
}

/// Kind-tagged body of a [`NormalizedEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum EventPayload {
    ItemAdded { item: ItemSnapshot },
    ItemDone { item: ItemSnapshot },
    TextDelta { delta: String },
    /// `text` is the authoritative final value when present.
    TextDone { text: Option<String> },
    ReasoningDelta { delta: String },
    ReasoningDone { text: Option<String> },
    WebSearchStateChange { phase: WebSearchPhase },
}

/// One event of an agent turn, independent of how it was delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Monotonic per-turn ordering key, 0 when absent.
    pub sequence_number: u64,
    /// Stream item the event belongs to.
    pub item_id: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl NormalizedEvent {
    /// Short label of the payload kind, used in logs.
    pub fn kind_label(&self) -> &'static str {
        match &self.payload {
            EventPayload::ItemAdded { .. } => "item-added",
            EventPayload::ItemDone { .. } => "item-done",
            EventPayload::TextDelta { .. } => "text-delta",
            EventPayload::TextDone { .. } => "text-done",
            EventPayload::ReasoningDelta { .. } => "reasoning-delta",
            EventPayload::ReasoningDone { .. } => "reasoning-done",
            EventPayload::WebSearchStateChange { .. } => "web-search-state-change",
        }
    }
}

/// Normalize a raw record from the live feed or a wrapped replay record.
pub fn normalize(raw: &Value) -> Result<NormalizedEvent, NormalizeError> {
    if !raw.is_object() {
        return Err(NormalizeError::NotAnObject);
    }
    let body = envelope_body(raw).unwrap_or(raw);
    let type_name = str_field(body, "type")
        .or_else(|| str_field(raw, "type"))
        .ok_or(NormalizeError::MissingType)?;
    normalize_parts(type_name, body, raw)
}

/// Normalize a replayed record whose type name is stored apart from its body.
///
/// This is the shape persisted items use: the item's own type carries the
/// event name and its data carries the event fields.
pub fn normalize_replayed(type_name: &str, body: &Value) -> Result<NormalizedEvent, NormalizeError> {
    if !body.is_object() {
        return Err(NormalizeError::NotAnObject);
    }
    let inner = envelope_body(body).unwrap_or(body);
    let type_name = str_field(inner, "type")
        .filter(|t| EventType::is_event_type_name(t))
        .unwrap_or(type_name);
    normalize_parts(type_name, inner, body)
}

/// Normalize a batch, dropping what does not fit.
///
/// Unrecognized types are dropped quietly; records with no resolvable item id
/// are logged as recoverable anomalies.
pub fn normalize_batch<'a>(raws: impl IntoIterator<Item = &'a Value>) -> Vec<NormalizedEvent> {
    raws.into_iter()
        .filter_map(|raw| match normalize(raw) {
            Ok(event) => Some(event),
            Err(err) => {
                log_dropped(&err);
                None
            }
        })
        .collect()
}

/// Log a dropped record at the level its reason deserves.
pub fn log_dropped(err: &NormalizeError) {
    match err {
        NormalizeError::MissingItemId(_) | NormalizeError::MissingSnapshot(_) => {
            tracing::warn!(reason = %err, "Dropping feed event");
        }
        _ => tracing::debug!(reason = %err, "Ignoring feed event"),
    }
}

fn normalize_parts(
    type_name: &str,
    body: &Value,
    outer: &Value,
) -> Result<NormalizedEvent, NormalizeError> {
    let event_type = EventType::parse(type_name);
    if let EventType::Unknown(name) = &event_type {
        return Err(NormalizeError::Unrecognized(name.clone()));
    }

    let sequence_number = u64_field(body, "sequence_number")
        .or_else(|| u64_field(body, "sequenceNumber"))
        .or_else(|| u64_field(outer, "sequence_number"))
        .unwrap_or(0);

    let item_id = resolve_item_id(body)
        .ok_or_else(|| NormalizeError::MissingItemId(event_type.wire_name().to_string()))?;

    let payload = match &event_type {
        EventType::OutputItemAdded | EventType::OutputItemDone => {
            let item = body
                .get("item")
                .filter(|i| i.is_object())
                .map(ItemSnapshot::from_value)
                .ok_or_else(|| NormalizeError::MissingSnapshot(event_type.wire_name().to_string()))?;
            if event_type == EventType::OutputItemAdded {
                EventPayload::ItemAdded { item }
            } else {
                EventPayload::ItemDone { item }
            }
        }
        EventType::OutputTextDelta => EventPayload::TextDelta {
            delta: str_field(body, "delta").unwrap_or_default().to_string(),
        },
        EventType::OutputTextDone => EventPayload::TextDone {
            text: owned(str_field(body, "text")),
        },
        EventType::ReasoningSummaryTextDelta => EventPayload::ReasoningDelta {
            delta: str_field(body, "delta").unwrap_or_default().to_string(),
        },
        EventType::ReasoningSummaryTextDone => EventPayload::ReasoningDone {
            text: owned(str_field(body, "text")),
        },
        EventType::WebSearchCall(phase) => EventPayload::WebSearchStateChange { phase: *phase },
        EventType::Unknown(name) => return Err(NormalizeError::Unrecognized(name.clone())),
    };

    Ok(NormalizedEvent {
        sequence_number,
        item_id,
        payload,
    })
}

/// Resolve the stream item id from whichever source field is present.
///
/// Direct ids win; the output-index form is only a fallback.
fn resolve_item_id(body: &Value) -> Option<String> {
    str_field(body, "item_id")
        .or_else(|| str_field(body, "itemId"))
        .or_else(|| body.get("item").and_then(|i| str_field(i, "id")))
        .filter(|id| !id.is_empty())
        .map(ToString::to_string)
        .or_else(|| u64_field(body, "output_index").map(|idx| format!("output_{idx}")))
}

fn envelope_body(raw: &Value) -> Option<&Value> {
    ENVELOPE_FIELDS
        .iter()
        .filter_map(|field| raw.get(*field))
        .find(|v| v.is_object())
}

fn str_field<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str)
}

fn u64_field(v: &Value, key: &str) -> Option<u64> {
    v.get(key).and_then(Value::as_u64)
}

fn owned(s: Option<&str>) -> Option<String> {
    s.map(ToString::to_string)
}

/// Strings pass through; structured values are rendered as JSON.
fn text_or_json(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Join the text parts of a message item's `content`.
fn message_text(item: &Value) -> Option<String> {
    match item.get("content")? {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let texts: Vec<&str> = parts.iter().filter_map(|p| str_field(p, "text")).collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.concat())
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_live_frame_text_delta() {
        let event = normalize(&json!({
            "type": "response.output_text.delta",
            "sequence_number": 7,
            "item_id": "t1",
            "delta": "Hel"
        }))
        .unwrap();
        assert_eq!(event.sequence_number, 7);
        assert_eq!(event.item_id, "t1");
        assert_eq!(
            event.payload,
            EventPayload::TextDelta {
                delta: "Hel".to_string()
            }
        );
    }

    #[test]
    fn test_namespace_is_optional() {
        let event = normalize(&json!({
            "type": "output_text.done",
            "item_id": "t1",
            "text": "Hello world!"
        }))
        .unwrap();
        assert_eq!(event.sequence_number, 0);
        assert_eq!(
            event.payload,
            EventPayload::TextDone {
                text: Some("Hello world!".to_string())
            }
        );
    }

    #[test]
    fn test_item_id_from_snapshot() {
        let event = normalize(&json!({
            "type": "response.output_item.added",
            "item": { "type": "function_call", "id": "abc", "name": "search" }
        }))
        .unwrap();
        assert_eq!(event.item_id, "abc");
        let EventPayload::ItemAdded { item } = event.payload else {
            panic!("expected item-added");
        };
        assert_eq!(item.kind, Some(SnapshotKind::ToolCall));
        assert_eq!(item.name.as_deref(), Some("search"));
    }

    #[test]
    fn test_output_index_fallback_only_without_direct_id() {
        let fallback = normalize(&json!({
            "type": "response.output_text.delta",
            "output_index": 2,
            "delta": "x"
        }))
        .unwrap();
        assert_eq!(fallback.item_id, "output_2");

        let direct = normalize(&json!({
            "type": "response.output_text.delta",
            "output_index": 2,
            "item_id": "t9",
            "delta": "x"
        }))
        .unwrap();
        assert_eq!(direct.item_id, "t9");
    }

    #[test]
    fn test_missing_item_id_is_rejected() {
        let err = normalize(&json!({ "type": "response.output_text.delta", "delta": "x" }))
            .unwrap_err();
        assert_eq!(
            err,
            NormalizeError::MissingItemId("output_text.delta".to_string())
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = normalize(&json!({ "type": "response.created", "item_id": "x" })).unwrap_err();
        assert!(matches!(err, NormalizeError::Unrecognized(_)));
        assert_eq!(normalize(&json!("text")).unwrap_err(), NormalizeError::NotAnObject);
        assert_eq!(
            normalize(&json!({ "item_id": "x" })).unwrap_err(),
            NormalizeError::MissingType
        );
    }

    #[test]
    fn test_wrapped_replay_record() {
        let event = normalize(&json!({
            "id": "evt_1",
            "type": "response.reasoning_summary_text.done",
            "data": { "item_id": "r1", "sequence_number": 4, "text": "Thinking" }
        }))
        .unwrap();
        assert_eq!(event.item_id, "r1");
        assert_eq!(event.sequence_number, 4);
        assert_eq!(
            event.payload,
            EventPayload::ReasoningDone {
                text: Some("Thinking".to_string())
            }
        );
    }

    #[test]
    fn test_replayed_type_from_outer_name() {
        let event = normalize_replayed(
            "response.web_search_call.searching",
            &json!({ "item_id": "ws1" }),
        )
        .unwrap();
        assert_eq!(
            event.payload,
            EventPayload::WebSearchStateChange {
                phase: WebSearchPhase::Searching
            }
        );
    }

    #[test]
    fn test_snapshot_fields() {
        let snap = ItemSnapshot::from_value(&json!({
            "type": "mcp_list_tools",
            "id": "tl1",
            "server_label": "github",
            "tools": [{ "name": "search_issues" }, { "name": "create_pr" }]
        }));
        assert_eq!(snap.kind, Some(SnapshotKind::ToolList));
        assert_eq!(snap.tools, vec!["search_issues", "create_pr"]);

        let snap = ItemSnapshot::from_value(&json!({
            "type": "function_call",
            "arguments": { "q": "rust" },
            "output": "3 results"
        }));
        assert_eq!(snap.arguments.as_deref(), Some(r#"{"q":"rust"}"#));
        assert_eq!(snap.output.as_deref(), Some("3 results"));

        let snap = ItemSnapshot::from_value(&json!({
            "type": "message",
            "content": [{ "type": "output_text", "text": "Hi " }, { "type": "output_text", "text": "there" }]
        }));
        assert_eq!(snap.text.as_deref(), Some("Hi there"));
    }

    #[test]
    fn test_batch_drops_bad_records() {
        let raws = vec![
            json!({ "type": "response.output_text.delta", "item_id": "a", "delta": "1" }),
            json!({ "type": "response.created" }),
            json!({ "type": "response.output_text.delta", "delta": "orphan" }),
            json!({ "type": "response.output_item.done", "item_id": "b" }),
        ];
        let events = normalize_batch(&raws);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].item_id, "a");
    }
}
