//! Error types for the reconciliation core and its collaborators.

use thiserror::Error;

/// Errors surfaced by a conversation context and its external collaborators.
#[derive(Error, Debug)]
pub enum FeedError {
    /// The task-identity collaborator could not resolve the task.
    ///
    /// Reconciliation never starts for a context whose load failed.
    #[error("Failed to load task {task_id}: {message}")]
    Load {
        /// Task or conversation that was requested.
        task_id: String,
        /// Collaborator-provided reason.
        message: String,
    },

    /// The approval-confirmation collaborator rejected or failed the call.
    #[error("Approval {approval_id} was not confirmed: {message}")]
    Confirmation {
        /// Approval that was being confirmed.
        approval_id: String,
        /// Collaborator-provided reason.
        message: String,
    },

    /// The approval controller refused the user action.
    #[error(transparent)]
    Approval(#[from] ApprovalError),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Backend returned an error response.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error message from the backend.
        message: String,
    },

    /// A context operation was attempted before a task was loaded.
    #[error("No task is loaded in this context")]
    NotLoaded,
}

/// Reasons a raw record was not turned into a normalized event.
///
/// None of these are fatal; the record is dropped and the feed continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    /// The record is not a JSON object.
    #[error("event record is not an object")]
    NotAnObject,

    /// The record has no `type` field.
    #[error("event record has no type")]
    MissingType,

    /// The type name is outside the supported vocabulary.
    #[error("unrecognized event type `{0}`")]
    Unrecognized(String),

    /// Neither a direct item id nor an output index was present.
    #[error("event `{0}` carries no item id")]
    MissingItemId(String),

    /// An `output_item.*` event without an `item` snapshot.
    #[error("event `{0}` carries no item snapshot")]
    MissingSnapshot(String),
}

/// Rejected approval-controller transitions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApprovalError {
    /// The approval id is not known to the controller.
    #[error("unknown approval `{0}`")]
    Unknown(String),

    /// The approval is not waiting for a decision.
    #[error("approval `{approval_id}` is already {status}")]
    NotWaiting {
        /// Approval the action targeted.
        approval_id: String,
        /// Current status label.
        status: String,
    },
}

/// Result type alias for context and collaborator operations.
pub type Result<T> = std::result::Result<T, FeedError>;
