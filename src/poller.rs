//! Periodic trace/metrics polling bound to a conversation context.
//!
//! A [`TracePoller`] is owned by the context that started it. Resetting or
//! dropping the context stops it; every update it sends is tagged with the
//! context generation it was started for so a late delivery can be told
//! apart from current data.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::backend::{TraceSnapshot, TraceSource};
use crate::error::Result;

/// Buffered updates before the poller waits on the consumer.
pub const UPDATE_BUFFER: usize = 8;

/// One poll result.
#[derive(Debug)]
pub struct TraceUpdate {
    pub generation: u64,
    pub task_id: String,
    pub result: Result<TraceSnapshot>,
}

/// What to poll and for which context generation.
#[derive(Debug, Clone)]
pub struct PollTarget {
    pub task_id: String,
    pub agent_correlation_id: String,
    pub generation: u64,
}

/// Handle to a running poll loop.
#[derive(Debug)]
pub struct TracePoller {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl TracePoller {
    /// Start polling `source` every `interval`. The first poll runs
    /// immediately. Must be called inside a tokio runtime.
    pub fn spawn(
        source: Arc<dyn TraceSource>,
        target: PollTarget,
        interval: Duration,
        updates: mpsc::Sender<TraceUpdate>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let generation = target.generation;

        let handle = tokio::spawn(async move {
            tracing::debug!(task_id = %target.task_id, generation, ?interval, "Trace poller started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let result = tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    result = source.fetch_traces(&target.task_id, &target.agent_correlation_id) => result,
                };
                if let Err(err) = &result {
                    tracing::warn!(task_id = %target.task_id, error = %err, "Trace poll failed");
                }
                let update = TraceUpdate {
                    generation,
                    task_id: target.task_id.clone(),
                    result,
                };
                if updates.send(update).await.is_err() {
                    break;
                }
            }
            tracing::debug!(task_id = %target.task_id, generation, "Trace poller stopped");
        });

        Self {
            cancel,
            handle: Some(handle),
            generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancel the loop. Nothing is polled after this returns.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for TracePoller {
    fn drop(&mut self) {
        self.stop();
    }
}
