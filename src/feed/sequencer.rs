//! Per-item delivery log that keeps stream events in sequence order across
//! ingest batches.
//!
//! Sequence numbers are monotonic per turn, so gaps between the numbers of
//! one item are normal and say nothing about a missing event. An event older
//! than one already applied for its item is slotted into place and the item
//! is rebuilt from its log. A number seen twice for one item is a redelivery.
//! Events without a number (0) keep arrival order.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::normalized::NormalizedEvent;

/// Where an incoming event lands in its item's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// After everything logged so far: apply it directly.
    InOrder,
    /// Ahead of events already applied: rebuild the item from the log.
    Late,
    /// The item already logged this sequence number: drop it.
    Duplicate,
}

#[derive(Debug, Clone)]
struct Logged {
    event: NormalizedEvent,
    at: DateTime<Utc>,
}

/// Applied events per stream item id, in sequence order.
#[derive(Debug, Default)]
pub struct Sequencer {
    logs: HashMap<String, Vec<Logged>>,
}

impl Sequencer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items with a log.
    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    /// Log `event`, received at `at`, and report where it landed.
    pub fn record(&mut self, event: &NormalizedEvent, at: DateTime<Utc>) -> Placement {
        let log = self.logs.entry(event.item_id.clone()).or_default();
        let seq = event.sequence_number;
        let entry = Logged {
            event: event.clone(),
            at,
        };
        if seq == 0 {
            log.push(entry);
            return Placement::InOrder;
        }
        if log.iter().any(|logged| logged.event.sequence_number == seq) {
            return Placement::Duplicate;
        }
        match log.iter().position(|logged| logged.event.sequence_number > seq) {
            Some(index) => {
                log.insert(index, entry);
                Placement::Late
            }
            None => {
                log.push(entry);
                Placement::InOrder
            }
        }
    }

    /// Logged events of `item_id` with their receive times, in application order.
    pub fn events(&self, item_id: &str) -> impl Iterator<Item = (&NormalizedEvent, DateTime<Utc>)> {
        self.logs
            .get(item_id)
            .into_iter()
            .flatten()
            .map(|logged| (&logged.event, logged.at))
    }

    /// Keep only the logs whose item id passes `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.logs.retain(|item_id, _| keep(item_id));
    }

    pub fn clear(&mut self) {
        self.logs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalized::normalize;
    use serde_json::json;

    fn delta(item_id: &str, seq: u64, text: &str) -> NormalizedEvent {
        normalize(&json!({
            "type": "response.output_text.delta",
            "item_id": item_id,
            "sequence_number": seq,
            "delta": text
        }))
        .unwrap()
    }

    fn logged_seqs(sequencer: &Sequencer, item_id: &str) -> Vec<u64> {
        sequencer.events(item_id).map(|(e, _)| e.sequence_number).collect()
    }

    #[test]
    fn test_late_event_is_slotted_in() {
        let mut sequencer = Sequencer::new();
        let now = Utc::now();
        assert_eq!(sequencer.record(&delta("t1", 2, "lo"), now), Placement::InOrder);
        assert_eq!(sequencer.record(&delta("t1", 5, "!"), now), Placement::InOrder);
        assert_eq!(sequencer.record(&delta("t1", 1, "Hel"), now), Placement::Late);
        assert_eq!(logged_seqs(&sequencer, "t1"), vec![1, 2, 5]);
    }

    #[test]
    fn test_redelivery_is_flagged() {
        let mut sequencer = Sequencer::new();
        let now = Utc::now();
        sequencer.record(&delta("t1", 3, "a"), now);
        assert_eq!(sequencer.record(&delta("t1", 3, "a"), now), Placement::Duplicate);
        // Same number on another item is unrelated.
        assert_eq!(sequencer.record(&delta("t2", 3, "b"), now), Placement::InOrder);
        assert_eq!(logged_seqs(&sequencer, "t1"), vec![3]);
    }

    #[test]
    fn test_unnumbered_events_keep_arrival_order() {
        let mut sequencer = Sequencer::new();
        let now = Utc::now();
        assert_eq!(sequencer.record(&delta("t1", 0, "a"), now), Placement::InOrder);
        assert_eq!(sequencer.record(&delta("t1", 0, "b"), now), Placement::InOrder);
        assert_eq!(sequencer.events("t1").count(), 2);
    }

    #[test]
    fn test_retain_and_clear() {
        let mut sequencer = Sequencer::new();
        let now = Utc::now();
        sequencer.record(&delta("t1", 1, "a"), now);
        sequencer.record(&delta("t2", 2, "b"), now);
        sequencer.retain(|item_id| item_id == "t2");
        assert_eq!(sequencer.len(), 1);
        assert_eq!(sequencer.events("t1").count(), 0);
        sequencer.clear();
        assert!(sequencer.is_empty());
    }
}
