//! The per-conversation reconciliation context.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::instrument;

use crate::approval::{
    ApprovalController, ApprovalDecision, ApprovalStatus, ConfirmationOutcome, ConfirmationRequest,
};
use crate::backend::{ApprovalConfirmer, TaskSnapshot, TaskSource, TraceSnapshot, TraceSource};
use crate::error::{FeedError, Result};
use crate::feed::assembler::assemble;
use crate::feed::filter::{PersistedIds, Reconciler};
use crate::feed::items::{PersistedItem, TransientItem, UnifiedConversationItem};
use crate::feed::processor::{StreamProcessor, order_batch};
use crate::feed::sequencer::{Placement, Sequencer};
use crate::normalized::{NormalizedEvent, normalize_batch};
use crate::poller::{PollTarget, TracePoller, TraceUpdate, UPDATE_BUFFER};

/// Default trace poll cadence.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// All reconciliation state for one active conversation.
///
/// A context owns its transient map, persisted snapshot, approval state and
/// trace poller exclusively. Switching to another task resets everything and
/// bumps [`generation`](Self::generation); work tagged with an older
/// generation is discarded when it comes back.
#[derive(Debug)]
pub struct ConversationContext {
    task_id: Option<String>,
    agent_correlation_id: Option<String>,
    generation: u64,
    persisted: Vec<PersistedItem>,
    reconciler: Reconciler,
    sequencer: Sequencer,
    processor: StreamProcessor,
    approvals: ApprovalController,
    poller: Option<TracePoller>,
    poll_interval: Duration,
    latest_traces: Option<TraceSnapshot>,
}

impl Default for ConversationContext {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl ConversationContext {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            task_id: None,
            agent_correlation_id: None,
            generation: 0,
            persisted: Vec::new(),
            reconciler: Reconciler::new(),
            sequencer: Sequencer::new(),
            processor: StreamProcessor::new(),
            approvals: ApprovalController::default(),
            poller: None,
            poll_interval,
            latest_traces: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    pub fn agent_correlation_id(&self) -> Option<&str> {
        self.agent_correlation_id.as_deref()
    }

    pub fn is_loaded(&self) -> bool {
        self.task_id.is_some()
    }

    pub fn persisted(&self) -> &[PersistedItem] {
        &self.persisted
    }

    /// Surviving transient items, ordered by last update.
    pub fn transient_items(&self) -> Vec<TransientItem> {
        self.processor.items().into_iter().cloned().collect()
    }

    pub fn latest_traces(&self) -> Option<&TraceSnapshot> {
        self.latest_traces.as_ref()
    }

    pub fn approval_status(&self, approval_id: &str) -> Option<ApprovalStatus> {
        self.approvals.status(approval_id)
    }

    /// Drop all state of the current identity and start a new generation.
    ///
    /// The poller is stopped before anything else is cleared. Returns the
    /// new generation.
    #[instrument(skip(self), fields(task_id = ?self.task_id, generation = self.generation))]
    pub fn reset(&mut self) -> u64 {
        self.stop_trace_polling();
        self.reconciler.reset(&mut self.processor);
        self.sequencer.clear();
        self.persisted.clear();
        self.approvals = ApprovalController::default();
        self.task_id = None;
        self.agent_correlation_id = None;
        self.latest_traces = None;
        self.generation += 1;
        tracing::debug!(next_generation = self.generation, "Context reset");
        self.generation
    }

    /// Install an already resolved task. Resets first.
    pub fn load(&mut self, snapshot: TaskSnapshot) -> u64 {
        self.reset();
        self.install(snapshot);
        self.generation
    }

    /// Switch to `task_id`, resolving it through `source`.
    ///
    /// The previous identity is fully reset before the task is fetched. On a
    /// fetch failure the context stays unloaded and every ingest is refused.
    #[instrument(skip_all, fields(task_id = %task_id, generation = tracing::field::Empty))]
    pub async fn open(&mut self, source: &dyn TaskSource, task_id: &str) -> Result<u64> {
        let generation = self.reset();
        tracing::Span::current().record("generation", generation);

        match source.load_task(task_id).await {
            Ok(snapshot) => {
                self.install(snapshot);
                tracing::info!(
                    persisted = self.persisted.len(),
                    "Conversation loaded"
                );
                Ok(generation)
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to load conversation");
                Err(FeedError::Load {
                    task_id: task_id.to_string(),
                    message: err.to_string(),
                })
            }
        }
    }

    fn install(&mut self, snapshot: TaskSnapshot) {
        self.approvals = ApprovalController::new(snapshot.agent_correlation_id.clone());
        self.task_id = Some(snapshot.task_id);
        self.agent_correlation_id = Some(snapshot.agent_correlation_id);
        self.replace_persisted(snapshot.items);
    }

    /// Swap in a fresh persisted snapshot and evict what it supersedes.
    pub fn replace_persisted(&mut self, items: Vec<PersistedItem>) {
        self.reconciler.set_persisted(PersistedIds::from_items(&items));
        self.persisted = items;
        self.reconciler.reconcile(&mut self.processor);
        self.prune_sequencer();
    }

    /// Normalize and apply a batch of raw feed records.
    ///
    /// `generation` is the generation the batch was requested for; a stale
    /// batch is discarded. Returns how many events changed an item.
    pub fn ingest(&mut self, generation: u64, raws: &[Value]) -> Result<usize> {
        self.ingest_events_at(generation, normalize_batch(raws), Utc::now())
    }

    /// Apply already normalized events, stamped with `now`.
    ///
    /// Each item's events apply in sequence order even across batches: an
    /// event older than one already applied rebuilds its item, and a
    /// redelivered sequence number is dropped.
    #[instrument(skip_all, fields(task_id = ?self.task_id, generation = self.generation, batch_generation = generation, events = events.len()))]
    pub fn ingest_events_at(
        &mut self,
        generation: u64,
        mut events: Vec<NormalizedEvent>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        if generation != self.generation {
            tracing::debug!(stale_generation = generation, "Discarding stale batch");
            return Ok(0);
        }
        if !self.is_loaded() {
            return Err(FeedError::NotLoaded);
        }

        order_batch(&mut events);
        events.retain(|event| !self.reconciler.supersedes(&event.item_id));
        let mut applied = 0;
        for event in &events {
            let touched = match self.sequencer.record(event, now) {
                Placement::InOrder => self.processor.apply(event, now).is_some(),
                Placement::Late => {
                    tracing::debug!(
                        item_id = %event.item_id,
                        sequence_number = event.sequence_number,
                        "Late event, rebuilding item"
                    );
                    self.processor
                        .rebuild(&event.item_id, self.sequencer.events(&event.item_id), now)
                        .is_some()
                }
                Placement::Duplicate => {
                    tracing::debug!(
                        item_id = %event.item_id,
                        sequence_number = event.sequence_number,
                        "Dropping redelivered event"
                    );
                    false
                }
            };
            applied += usize::from(touched);
        }
        self.reconciler.reconcile(&mut self.processor);
        self.prune_sequencer();
        Ok(applied)
    }

    /// Forget the logs of items the processor no longer holds.
    fn prune_sequencer(&mut self) {
        let processor = &self.processor;
        self.sequencer.retain(|item_id| processor.get(item_id).is_some());
    }

    /// The assembled conversation with approval state overlaid.
    pub fn conversation(&mut self) -> Vec<UnifiedConversationItem> {
        let transient = self.transient_items();
        let mut items = assemble(&self.persisted, &transient);
        self.approvals.track(&items);
        self.approvals.overlay(&mut items);
        items
    }

    /// Optimistically apply a user decision. The caller sends the returned
    /// request and reports back through [`settle_approval`](Self::settle_approval);
    /// the stream keeps flowing in between.
    pub fn begin_approval(
        &mut self,
        approval_id: &str,
        decision: ApprovalDecision,
    ) -> Result<ConfirmationRequest> {
        if !self.is_loaded() {
            return Err(FeedError::NotLoaded);
        }
        self.conversation();
        Ok(self.approvals.begin(approval_id, decision)?)
    }

    /// Apply a confirmation result. `None` when the request belongs to an
    /// earlier generation.
    pub fn settle_approval(
        &mut self,
        generation: u64,
        request: &ConfirmationRequest,
        outcome: &ConfirmationOutcome,
    ) -> Option<ApprovalStatus> {
        if generation != self.generation {
            tracing::debug!(approval_id = %request.approval_id, "Discarding stale confirmation");
            return None;
        }
        Some(self.approvals.settle(request, outcome))
    }

    /// Approve or deny and wait for the confirmation in one call.
    #[instrument(skip(self, confirmer), fields(task_id = ?self.task_id, generation = self.generation))]
    pub async fn decide_approval(
        &mut self,
        approval_id: &str,
        decision: ApprovalDecision,
        confirmer: &dyn ApprovalConfirmer,
    ) -> Result<ApprovalStatus> {
        if !self.is_loaded() {
            return Err(FeedError::NotLoaded);
        }
        self.conversation();
        self.approvals.decide(approval_id, decision, confirmer).await
    }

    /// Start the trace poller for the loaded task, replacing any running one.
    pub fn start_trace_polling(
        &mut self,
        source: Arc<dyn TraceSource>,
    ) -> Result<mpsc::Receiver<TraceUpdate>> {
        let (Some(task_id), Some(agent_correlation_id)) =
            (self.task_id.clone(), self.agent_correlation_id.clone())
        else {
            return Err(FeedError::NotLoaded);
        };
        self.stop_trace_polling();

        let (tx, rx) = mpsc::channel(UPDATE_BUFFER);
        let target = PollTarget {
            task_id,
            agent_correlation_id,
            generation: self.generation,
        };
        self.poller = Some(TracePoller::spawn(source, target, self.poll_interval, tx));
        Ok(rx)
    }

    pub fn stop_trace_polling(&mut self) {
        if let Some(mut poller) = self.poller.take() {
            poller.stop();
        }
    }

    pub fn is_polling(&self) -> bool {
        self.poller.as_ref().is_some_and(TracePoller::is_running)
    }

    /// Store a poll result if it belongs to the current generation.
    pub fn accept_traces(&mut self, update: TraceUpdate) -> bool {
        if update.generation != self.generation {
            tracing::debug!(stale_generation = update.generation, "Discarding stale trace update");
            return false;
        }
        match update.result {
            Ok(snapshot) => {
                self.latest_traces = Some(snapshot);
                true
            }
            Err(_) => false,
        }
    }
}
