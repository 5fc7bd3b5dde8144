//! In-process collaborators for replay mode and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ApprovalConfirmer, TaskSnapshot, TaskSource, TraceSnapshot, TraceSource};
use crate::approval::{ConfirmationOutcome, ConfirmationRequest};
use crate::error::{FeedError, Result};

/// Collaborator state held in memory.
///
/// Confirmation outcomes are scripted per call and consumed in order; once
/// the script runs out every confirmation succeeds. Every confirmation
/// request is recorded.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    tasks: Mutex<HashMap<String, TaskSnapshot>>,
    traces: Mutex<HashMap<String, TraceSnapshot>>,
    outcomes: Mutex<VecDeque<Result<ConfirmationOutcome>>>,
    confirmations: Mutex<Vec<ConfirmationRequest>>,
    trace_fetches: Mutex<usize>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_task(&self, task: TaskSnapshot) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.insert(task.task_id.clone(), task);
        }
    }

    pub fn set_traces(&self, task_id: impl Into<String>, traces: TraceSnapshot) {
        if let Ok(mut map) = self.traces.lock() {
            map.insert(task_id.into(), traces);
        }
    }

    /// Queue the outcome of the next confirmation call.
    pub fn push_outcome(&self, outcome: Result<ConfirmationOutcome>) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.push_back(outcome);
        }
    }

    pub fn confirmations(&self) -> Vec<ConfirmationRequest> {
        self.confirmations
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn trace_fetches(&self) -> usize {
        self.trace_fetches.lock().map(|n| *n).unwrap_or_default()
    }
}

#[async_trait]
impl TaskSource for MemoryBackend {
    async fn load_task(&self, task_id: &str) -> Result<TaskSnapshot> {
        self.tasks
            .lock()
            .ok()
            .and_then(|tasks| tasks.get(task_id).cloned())
            .ok_or_else(|| FeedError::Api {
                status: 404,
                message: format!("task {task_id} not found"),
            })
    }
}

#[async_trait]
impl ApprovalConfirmer for MemoryBackend {
    async fn confirm(&self, request: &ConfirmationRequest) -> Result<ConfirmationOutcome> {
        if let Ok(mut seen) = self.confirmations.lock() {
            seen.push(request.clone());
        }
        self.outcomes
            .lock()
            .ok()
            .and_then(|mut outcomes| outcomes.pop_front())
            .unwrap_or_else(|| Ok(ConfirmationOutcome::confirmed()))
    }
}

#[async_trait]
impl TraceSource for MemoryBackend {
    async fn fetch_traces(&self, task_id: &str, _agent_correlation_id: &str) -> Result<TraceSnapshot> {
        if let Ok(mut n) = self.trace_fetches.lock() {
            *n += 1;
        }
        Ok(self
            .traces
            .lock()
            .ok()
            .and_then(|map| map.get(task_id).cloned())
            .unwrap_or_default())
    }
}
