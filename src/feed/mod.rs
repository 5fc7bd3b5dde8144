//! Streaming item processing, reconciliation and assembly.
//!
//! - [`sequencer`]: keeps each item's events in sequence order across batches
//! - [`processor`]: folds normalized events into transient items
//! - [`filter`]: evicts transient items that a persisted item supersedes
//! - [`assembler`]: merges persisted history with the surviving transients
//! - [`items`]: the item types shared by all three

pub mod assembler;
pub mod filter;
pub mod items;
pub mod processor;
pub mod sequencer;

pub use assembler::assemble;
pub use filter::{PersistedIds, Reconciler};
pub use items::{
    ApprovalRequest, ItemKind, ItemPayload, ItemSource, ItemStatus, PersistedItem, TransientItem,
    UnifiedConversationItem,
};
pub use processor::{StreamProcessor, order_batch};
pub use sequencer::{Placement, Sequencer};
