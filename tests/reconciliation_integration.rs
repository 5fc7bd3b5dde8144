use std::sync::Arc;
use std::time::Duration;

use agent_feed::FeedError;
use agent_feed::approval::{ApprovalDecision, ApprovalStatus, ConfirmationOutcome};
use agent_feed::backend::{MemoryBackend, TaskSnapshot, TraceSnapshot, TraceSource};
use agent_feed::feed::{ItemKind, ItemPayload, ItemStatus, PersistedItem};
use agent_feed::session::ConversationContext;
use serde_json::{Value, json};

fn task(task_id: &str, items: Value) -> TaskSnapshot {
    TaskSnapshot {
        task_id: task_id.to_string(),
        agent_correlation_id: format!("corr-{task_id}"),
        items: serde_json::from_value::<Vec<PersistedItem>>(items).unwrap(),
    }
}

fn delta(item_id: &str, seq: u64, text: &str) -> Value {
    json!({
        "type": "response.output_text.delta",
        "item_id": item_id,
        "sequence_number": seq,
        "delta": text
    })
}

fn approval_added(item_id: &str) -> Value {
    json!({
        "type": "response.output_item.added",
        "item_id": item_id,
        "item": { "type": "mcp_approval_request", "name": "delete_repo", "server_label": "github" }
    })
}

#[test]
fn tool_call_done_sets_output() {
    let mut ctx = ConversationContext::default();
    let generation = ctx.load(task("t", json!([])));
    ctx.ingest(
        generation,
        &[
            json!({
                "type": "response.output_item.added",
                "sequence_number": 1,
                "item_id": "abc",
                "item": { "type": "function_call", "name": "search" }
            }),
            json!({
                "type": "response.output_item.done",
                "sequence_number": 2,
                "item_id": "abc",
                "item": { "type": "function_call", "output": "3 results" }
            }),
        ],
    )
    .unwrap();

    let conversation = ctx.conversation();
    assert_eq!(conversation.len(), 1);
    let item = &conversation[0];
    assert_eq!(item.kind(), Some(ItemKind::ToolCall));
    assert_eq!(item.status, ItemStatus::Completed);
    let ItemPayload::ToolCall { name, output, .. } = &item.payload else {
        panic!("expected a tool call");
    };
    assert_eq!(name.as_deref(), Some("search"));
    assert_eq!(output.as_deref(), Some("3 results"));
}

#[test]
fn text_done_overrides_streamed_deltas() {
    let mut ctx = ConversationContext::default();
    let generation = ctx.load(task("t", json!([])));
    // Delivered out of order.
    ctx.ingest(
        generation,
        &[delta("t1", 2, "lo wo"), delta("t1", 1, "Hel"), delta("t1", 3, "rld")],
    )
    .unwrap();
    assert_eq!(ctx.transient_items()[0].content, "Hello world");

    ctx.ingest(
        generation,
        &[json!({
            "type": "response.output_text.done",
            "sequence_number": 4,
            "item_id": "t1",
            "text": "Hello world!"
        })],
    )
    .unwrap();
    let items = ctx.transient_items();
    assert_eq!(items[0].content, "Hello world!");
    assert!(!items[0].is_streaming);
}

#[test]
fn deltas_split_across_batches_apply_in_sequence_order() {
    let mut ctx = ConversationContext::default();
    let generation = ctx.load(task("t", json!([])));
    ctx.ingest(generation, &[delta("t1", 2, "lo")]).unwrap();
    ctx.ingest(generation, &[delta("t1", 1, "Hel")]).unwrap();
    assert_eq!(ctx.transient_items()[0].content, "Hello");

    // The final text still wins once it arrives, and a late delta after it
    // does not reopen the item.
    ctx.ingest(
        generation,
        &[json!({
            "type": "response.output_text.done",
            "sequence_number": 5,
            "item_id": "t1",
            "text": "Hello, world"
        })],
    )
    .unwrap();
    ctx.ingest(generation, &[delta("t1", 3, ", wor")]).unwrap();
    let items = ctx.transient_items();
    assert_eq!(items[0].content, "Hello, world");
    assert!(!items[0].is_streaming);
    assert_eq!(items[0].status, ItemStatus::Completed);
}

#[test]
fn redelivered_delta_is_not_appended_twice() {
    let mut ctx = ConversationContext::default();
    let generation = ctx.load(task("t", json!([])));
    ctx.ingest(generation, &[delta("t1", 1, "Hel"), delta("t1", 2, "lo")]).unwrap();
    ctx.ingest(generation, &[delta("t1", 2, "lo"), delta("t1", 3, "!")]).unwrap();
    assert_eq!(ctx.transient_items()[0].content, "Hello!");
}

#[test]
fn persisted_alias_evicts_transient() {
    let mut ctx = ConversationContext::default();
    let generation = ctx.load(task("t", json!([])));
    ctx.ingest(generation, &[delta("t1", 1, "Hello")]).unwrap();
    assert_eq!(ctx.conversation().len(), 1);

    ctx.replace_persisted(
        serde_json::from_value(json!([
            { "id": "msg_t1", "type": "message", "data": { "role": "assistant", "content": "Hello" } }
        ]))
        .unwrap(),
    );
    let conversation = ctx.conversation();
    assert_eq!(conversation.len(), 1);
    assert_eq!(conversation[0].id, "msg_t1");
    assert!(conversation.iter().all(|i| i.id != "stream_t1"));
    assert!(ctx.transient_items().is_empty());
}

#[tokio::test]
async fn unconfirmed_denial_reverts_to_waiting() {
    let backend = MemoryBackend::new();
    backend.insert_task(task("t", json!([])));
    backend.push_outcome(Ok(ConfirmationOutcome {
        success: false,
        error: None,
    }));

    let mut ctx = ConversationContext::default();
    let generation = ctx.open(&backend, "t").await.unwrap();
    ctx.ingest(generation, &[approval_added("ap1")]).unwrap();

    let err = ctx
        .decide_approval("ap1", ApprovalDecision::Deny, &backend)
        .await
        .unwrap_err();
    assert!(matches!(err, FeedError::Confirmation { .. }));

    let conversation = ctx.conversation();
    assert_eq!(conversation[0].status, ItemStatus::WaitingApproval);
    assert_eq!(ctx.approval_status("ap1"), Some(ApprovalStatus::WaitingApproval));

    let sent = backend.confirmations();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].agent_correlation_id, "corr-t");
    assert!(!sent[0].approved);

    // Actionable again: a second attempt goes through.
    let status = ctx
        .decide_approval("ap1", ApprovalDecision::Approve, &backend)
        .await
        .unwrap();
    assert_eq!(status, ApprovalStatus::Completed);
    assert_eq!(ctx.conversation()[0].status, ItemStatus::Completed);
}

#[tokio::test]
async fn approval_prefers_embedded_id() {
    let backend = MemoryBackend::new();
    backend.insert_task(task("t", json!([])));
    let mut ctx = ConversationContext::default();
    let generation = ctx.open(&backend, "t").await.unwrap();
    ctx.ingest(
        generation,
        &[json!({
            "type": "response.output_item.added",
            "item_id": "ap1",
            "item": { "type": "mcp_approval_request", "id": "mcpr_5", "name": "deploy" }
        })],
    )
    .unwrap();

    ctx.decide_approval("mcpr_5", ApprovalDecision::Approve, &backend)
        .await
        .unwrap();
    assert_eq!(backend.confirmations()[0].approval_id, "mcpr_5");
}

#[test]
fn decision_survives_persisted_gate_without_embedded_id() {
    let mut ctx = ConversationContext::default();
    let generation = ctx.load(task("t", json!([])));
    ctx.ingest(
        generation,
        &[json!({
            "type": "response.output_item.added",
            "item_id": "ap1",
            "item": { "type": "mcp_approval_request", "id": "mcpr_5", "name": "deploy" }
        })],
    )
    .unwrap();
    ctx.begin_approval("mcpr_5", ApprovalDecision::Approve).unwrap();

    ctx.replace_persisted(
        serde_json::from_value(json!([
            { "id": "approval_ap1", "type": "mcp_approval_request", "data": { "name": "deploy" } }
        ]))
        .unwrap(),
    );
    let conversation = ctx.conversation();
    assert_eq!(conversation.len(), 1);
    assert_eq!(conversation[0].id, "approval_ap1");
    assert_eq!(conversation[0].status, ItemStatus::Completed);
    assert!(ctx.begin_approval("ap1", ApprovalDecision::Deny).is_err());
}

#[test]
fn stream_keeps_flowing_while_confirmation_is_pending() {
    let mut ctx = ConversationContext::default();
    let generation = ctx.load(task("t", json!([])));
    ctx.ingest(generation, &[approval_added("ap1")]).unwrap();

    let request = ctx.begin_approval("ap1", ApprovalDecision::Approve).unwrap();
    assert_eq!(ctx.conversation()[0].status, ItemStatus::Completed);

    ctx.ingest(generation, &[delta("t2", 5, "still streaming")]).unwrap();
    assert_eq!(ctx.conversation().len(), 2);

    let status = ctx
        .settle_approval(generation, &request, &ConfirmationOutcome::rejected("timeout"))
        .unwrap();
    assert_eq!(status, ApprovalStatus::WaitingApproval);
    assert_eq!(ctx.conversation()[0].status, ItemStatus::WaitingApproval);
}

#[test]
fn filtering_is_idempotent() {
    let mut ctx = ConversationContext::default();
    let generation = ctx.load(task("t", json!([])));
    ctx.ingest(generation, &[delta("a", 1, "x"), delta("b", 2, "y"), delta("c", 3, "z")])
        .unwrap();
    let persisted: Vec<PersistedItem> =
        serde_json::from_value(json!([{ "id": "tool_b", "type": "function_call" }])).unwrap();

    ctx.replace_persisted(persisted.clone());
    let once = ctx.transient_items();
    ctx.replace_persisted(persisted);
    let twice = ctx.transient_items();
    assert_eq!(once, twice);
    assert_eq!(once.len(), 2);
}

#[tokio::test]
async fn load_failure_leaves_context_unloaded() {
    let backend = MemoryBackend::new();
    let mut ctx = ConversationContext::default();
    let err = ctx.open(&backend, "missing").await.unwrap_err();
    assert!(matches!(err, FeedError::Load { ref task_id, .. } if task_id == "missing"));
    assert!(!ctx.is_loaded());
    assert!(matches!(
        ctx.ingest(ctx.generation(), &[delta("t1", 0, "x")]),
        Err(FeedError::NotLoaded)
    ));
}

#[tokio::test]
async fn switching_tasks_resets_everything() {
    let backend = MemoryBackend::new();
    backend.insert_task(task("one", json!([])));
    backend.insert_task(task("two", json!([])));

    let mut ctx = ConversationContext::default();
    let first = ctx.open(&backend, "one").await.unwrap();
    ctx.ingest(first, &[delta("t1", 1, "from one")]).unwrap();

    let second = ctx.open(&backend, "two").await.unwrap();
    assert!(ctx.conversation().is_empty());
    // A late batch for the old task is discarded.
    assert_eq!(ctx.ingest(first, &[delta("t1", 2, " late")]).unwrap(), 0);

    ctx.ingest(second, &[delta("t1", 1, "from two")]).unwrap();
    assert_eq!(ctx.transient_items()[0].content, "from two");
    assert_eq!(ctx.agent_correlation_id(), Some("corr-two"));
}

#[test]
fn replayed_events_fill_reasoning_duration() {
    let mut ctx = ConversationContext::default();
    let generation = ctx.load(task(
        "t",
        json!([
            { "id": "msg_u1", "type": "message", "created_at": "2025-03-01T12:00:00Z",
              "data": { "role": "user", "content": "Plan a trip" } },
            { "id": "evt_1", "type": "response.reasoning_summary_text.delta", "created_at": "2025-03-01T12:00:01Z",
              "data": { "item_id": "r1", "sequence_number": 1, "delta": "Thinking" } },
            { "id": "evt_2", "type": "response.reasoning_summary_text.done", "created_at": "2025-03-01T12:00:08Z",
              "data": { "item_id": "r1", "sequence_number": 2, "text": "Thinking about routes" } },
            { "id": "reasoning_r1", "type": "reasoning", "created_at": "2025-03-01T12:00:08Z",
              "data": { "summary": [{ "text": "Thinking about routes" }] } }
        ]),
    ));
    assert!(ctx.transient_items().is_empty());
    assert_eq!(generation, ctx.generation());

    let conversation = ctx.conversation();
    let ids: Vec<_> = conversation.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["msg_u1", "reasoning_r1"]);
    assert_eq!(
        conversation[1].payload,
        ItemPayload::Reasoning {
            content: "Thinking about routes".to_string(),
            duration_secs: Some(7),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn trace_polling_stops_on_reset() {
    let backend = Arc::new(MemoryBackend::new());
    backend.insert_task(task("t", json!([])));
    backend.set_traces(
        "t",
        TraceSnapshot {
            traces: vec![json!({ "span": "tool.search" })],
            metrics: json!({ "tokens": 42 }),
        },
    );

    let mut ctx = ConversationContext::new(Duration::from_secs(2));
    ctx.open(backend.as_ref(), "t").await.unwrap();
    let source: Arc<dyn TraceSource> = Arc::<MemoryBackend>::clone(&backend);
    let mut updates = ctx.start_trace_polling(source).unwrap();
    assert!(ctx.is_polling());

    let update = updates.recv().await.unwrap();
    assert!(ctx.accept_traces(update));
    assert_eq!(ctx.latest_traces().unwrap().metrics["tokens"], 42);
    let update = updates.recv().await.unwrap();
    assert!(ctx.accept_traces(update));

    ctx.reset();
    assert!(!ctx.is_polling());
    while let Some(update) = updates.recv().await {
        assert!(!ctx.accept_traces(update));
    }
    let fetched = backend.trace_fetches();
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(backend.trace_fetches(), fetched);
}
