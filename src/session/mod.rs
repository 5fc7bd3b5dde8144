//! Per-conversation reconciliation state.
//!
//! A [`ConversationContext`] is the explicit owner of everything the feed
//! pipeline mutates for one conversation: the transient item map, the
//! persisted snapshot, approval state and the trace poller. There is no
//! module-level state; two contexts never share anything.
//!
//! # Example
//!
//! ```rust
//! use agent_feed::backend::TaskSnapshot;
//! use agent_feed::session::ConversationContext;
//!
//! let mut ctx = ConversationContext::default();
//! let generation = ctx.load(TaskSnapshot {
//!     task_id: "task-1".into(),
//!     agent_correlation_id: "corr-1".into(),
//!     items: Vec::new(),
//! });
//!
//! let raw = serde_json::json!({
//!     "type": "response.output_text.delta",
//!     "item_id": "t1",
//!     "delta": "Hello"
//! });
//! ctx.ingest(generation, &[raw]).unwrap();
//!
//! let conversation = ctx.conversation();
//! assert_eq!(conversation.len(), 1);
//! assert_eq!(conversation[0].id, "stream_t1");
//! ```

mod context;

pub use context::{ConversationContext, DEFAULT_POLL_INTERVAL};
