//! External collaborators of a conversation context.
//!
//! The reconciliation core never talks to the network itself. It consumes
//! three seams:
//!
//! - [`TaskSource`]: resolves a task to its correlation id and persisted items
//! - [`ApprovalConfirmer`]: confirms an approve/deny decision
//! - [`TraceSource`]: fetches traces and metrics for periodic polling
//!
//! [`HttpBackend`] implements all three against the agent backend's REST API;
//! [`MemoryBackend`] keeps everything in process for replay and tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::approval::{ConfirmationOutcome, ConfirmationRequest};
use crate::error::Result;
use crate::feed::items::PersistedItem;

pub mod http;
pub mod memory;

pub use http::HttpBackend;
pub use memory::MemoryBackend;

/// A task as the task-identity collaborator resolves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub task_id: String,
    pub agent_correlation_id: String,
    /// Persisted conversation in storage order.
    #[serde(default)]
    pub items: Vec<PersistedItem>,
}

/// Traces and metrics for one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceSnapshot {
    #[serde(default)]
    pub traces: Vec<Value>,
    #[serde(default)]
    pub metrics: Value,
}

#[async_trait]
pub trait TaskSource: Send + Sync + std::fmt::Debug {
    /// Resolve a task. A failure here is a load error; nothing reconciles.
    async fn load_task(&self, task_id: &str) -> Result<TaskSnapshot>;
}

#[async_trait]
pub trait ApprovalConfirmer: Send + Sync + std::fmt::Debug {
    /// Send one confirmation. Called at most once per user action.
    async fn confirm(&self, request: &ConfirmationRequest) -> Result<ConfirmationOutcome>;
}

#[async_trait]
pub trait TraceSource: Send + Sync + std::fmt::Debug {
    async fn fetch_traces(&self, task_id: &str, agent_correlation_id: &str) -> Result<TraceSnapshot>;
}
