//! Approval controller for human-in-the-loop gates.
//!
//! Each approval request moves through a tiny state machine:
//!
//! ```text
//! waiting-approval --approve/deny--> completed | failed   (optimistic)
//! completed | failed --confirmation failed--> waiting-approval
//! ```
//!
//! [`transition`] is the pure rule. [`ApprovalController`] keeps the per-id
//! state for one conversation and drives the confirmation collaborator.
//! A confirmation result is applied as last-write-wins against whatever
//! status holds when it arrives.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::ApprovalConfirmer;
use crate::error::{ApprovalError, FeedError, Result};
use crate::feed::filter::candidate_item_ids;
use crate::feed::items::{ApprovalRequest, ItemStatus, UnifiedConversationItem};

/// Status of one approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalStatus {
    WaitingApproval,
    Completed,
    Failed,
}

impl ApprovalStatus {
    pub fn as_item_status(self) -> ItemStatus {
        match self {
            Self::WaitingApproval => ItemStatus::WaitingApproval,
            Self::Completed => ItemStatus::Completed,
            Self::Failed => ItemStatus::Failed,
        }
    }

    /// Map an item status onto the approval vocabulary.
    ///
    /// Statuses outside it (e.g. `in-progress` before the gate is announced)
    /// count as waiting.
    pub fn from_item_status(status: &ItemStatus) -> Self {
        match status {
            ItemStatus::Completed => Self::Completed,
            ItemStatus::Failed => Self::Failed,
            _ => Self::WaitingApproval,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != Self::WaitingApproval
    }
}

/// A user decision on an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approve,
    Deny,
}

impl ApprovalDecision {
    pub fn approved(self) -> bool {
        self == Self::Approve
    }

    /// Status shown once this decision is accepted.
    pub fn terminal_status(self) -> ApprovalStatus {
        match self {
            Self::Approve => ApprovalStatus::Completed,
            Self::Deny => ApprovalStatus::Failed,
        }
    }
}

/// Result reported by the confirmation collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConfirmationOutcome {
    pub fn confirmed() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Inputs of the approval state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalEvent {
    /// The user approved or denied.
    Requested(ApprovalDecision),
    /// The collaborator answered for an earlier request.
    Confirmed {
        decision: ApprovalDecision,
        outcome: ConfirmationOutcome,
    },
}

/// Next status for `state` given `event`, or `None` if the event is not
/// allowed from `state`.
pub fn transition(state: ApprovalStatus, event: &ApprovalEvent) -> Option<ApprovalStatus> {
    match event {
        ApprovalEvent::Requested(decision) => {
            (state == ApprovalStatus::WaitingApproval).then(|| decision.terminal_status())
        }
        ApprovalEvent::Confirmed { decision, outcome } if outcome.success => {
            Some(decision.terminal_status())
        }
        ApprovalEvent::Confirmed { .. } => Some(ApprovalStatus::WaitingApproval),
    }
}

/// Payload sent to the confirmation collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationRequest {
    /// Unique per user action; lets a backend spot duplicate submissions.
    pub request_id: Uuid,
    pub agent_correlation_id: String,
    pub approval_id: String,
    pub approved: bool,
}

impl ConfirmationRequest {
    pub fn decision(&self) -> ApprovalDecision {
        if self.approved {
            ApprovalDecision::Approve
        } else {
            ApprovalDecision::Deny
        }
    }
}

/// Approval state for one conversation context.
///
/// State is keyed by the approval id first seen for a gate. The stream and
/// the persisted snapshot may name the same gate differently (an embedded
/// `mcpr_` id versus the wrapping item id), so the stream item id of every
/// tracked gate maps back to its key.
#[derive(Debug, Clone, Default)]
pub struct ApprovalController {
    agent_correlation_id: String,
    states: HashMap<String, ApprovalStatus>,
    /// Stream item id to state key.
    by_item: HashMap<String, String>,
}

impl ApprovalController {
    pub fn new(agent_correlation_id: impl Into<String>) -> Self {
        Self {
            agent_correlation_id: agent_correlation_id.into(),
            states: HashMap::new(),
            by_item: HashMap::new(),
        }
    }

    /// State key for an id the caller knows a gate by.
    fn resolve<'a>(&'a self, approval_id: &'a str) -> &'a str {
        if self.states.contains_key(approval_id) {
            return approval_id;
        }
        self.by_item.get(approval_id).map_or(approval_id, String::as_str)
    }

    /// State key for an assembled approval item.
    fn key_for(&self, item: &UnifiedConversationItem, request: &ApprovalRequest) -> String {
        if self.states.contains_key(&request.approval_id) {
            return request.approval_id.clone();
        }
        item.item_id
            .as_deref()
            .into_iter()
            .chain(candidate_item_ids(&item.id))
            .find_map(|id| self.by_item.get(id))
            .cloned()
            .unwrap_or_else(|| request.approval_id.clone())
    }

    pub fn agent_correlation_id(&self) -> &str {
        &self.agent_correlation_id
    }

    /// Register the approval items of an assembled conversation.
    ///
    /// New approvals start from the item's own status. A terminal status on
    /// the item (from the persisted snapshot) overrides local state.
    pub fn track(&mut self, items: &[UnifiedConversationItem]) {
        for item in items {
            let Some(request) = item.as_approval() else {
                continue;
            };
            let observed = ApprovalStatus::from_item_status(&item.status);
            let key = self.key_for(item, request);
            if let Some(item_id) = &item.item_id {
                self.by_item.insert(item_id.clone(), key.clone());
            }
            self.states
                .entry(key)
                .and_modify(|state| {
                    if observed.is_terminal() {
                        *state = observed;
                    }
                })
                .or_insert(observed);
        }
    }

    /// Status of a gate, by approval id or by its stream item id.
    pub fn status(&self, approval_id: &str) -> Option<ApprovalStatus> {
        self.states.get(self.resolve(approval_id)).copied()
    }

    /// Whether the user may approve or deny right now.
    pub fn is_actionable(&self, approval_id: &str) -> bool {
        self.status(approval_id) == Some(ApprovalStatus::WaitingApproval)
    }

    /// Apply the optimistic transition for a user action and build the
    /// confirmation request to send.
    pub fn begin(
        &mut self,
        approval_id: &str,
        decision: ApprovalDecision,
    ) -> std::result::Result<ConfirmationRequest, ApprovalError> {
        let key = self.resolve(approval_id).to_string();
        let state = self
            .states
            .get_mut(&key)
            .ok_or_else(|| ApprovalError::Unknown(approval_id.to_string()))?;
        let next = transition(*state, &ApprovalEvent::Requested(decision)).ok_or_else(|| {
            ApprovalError::NotWaiting {
                approval_id: key.clone(),
                status: state.as_item_status().to_string(),
            }
        })?;
        *state = next;
        tracing::debug!(approval_id = %key, ?decision, "Optimistic approval transition");

        Ok(ConfirmationRequest {
            request_id: Uuid::new_v4(),
            agent_correlation_id: self.agent_correlation_id.clone(),
            approval_id: key,
            approved: decision.approved(),
        })
    }

    /// Apply the collaborator's answer. Returns the resulting status.
    pub fn settle(&mut self, request: &ConfirmationRequest, outcome: &ConfirmationOutcome) -> ApprovalStatus {
        let event = ApprovalEvent::Confirmed {
            decision: request.decision(),
            outcome: outcome.clone(),
        };
        let state = self
            .states
            .entry(request.approval_id.clone())
            .or_insert(ApprovalStatus::WaitingApproval);
        if let Some(next) = transition(*state, &event) {
            *state = next;
        }
        if !outcome.success {
            tracing::warn!(
                approval_id = %request.approval_id,
                error = outcome.error.as_deref().unwrap_or("unconfirmed"),
                "Approval not confirmed, reverting to waiting"
            );
        }
        *state
    }

    /// Run one user action end to end: optimistic update, confirmation call,
    /// revert on failure.
    ///
    /// Returns [`FeedError::Confirmation`] after a revert so the caller can
    /// notify the user. There is no retry.
    pub async fn decide(
        &mut self,
        approval_id: &str,
        decision: ApprovalDecision,
        confirmer: &dyn ApprovalConfirmer,
    ) -> Result<ApprovalStatus> {
        let request = self.begin(approval_id, decision)?;
        let outcome = match confirmer.confirm(&request).await {
            Ok(outcome) => outcome,
            Err(err) => ConfirmationOutcome::rejected(err.to_string()),
        };
        let status = self.settle(&request, &outcome);
        if outcome.success {
            Ok(status)
        } else {
            Err(FeedError::Confirmation {
                approval_id: approval_id.to_string(),
                message: outcome
                    .error
                    .unwrap_or_else(|| "confirmation returned success=false".to_string()),
            })
        }
    }

    /// Project controller state onto assembled approval items.
    ///
    /// Items already terminal keep their own status.
    pub fn overlay(&self, items: &mut [UnifiedConversationItem]) {
        for item in items.iter_mut() {
            if item.status.is_terminal() {
                continue;
            }
            let Some(state) = item
                .as_approval()
                .and_then(|request| self.states.get(&self.key_for(item, request)).copied())
            else {
                continue;
            };
            item.status = state.as_item_status();
        }
    }
}
