//! Agent Feed
//!
//! Reconciles a live, incrementally delivered agent event stream with
//! persisted conversation history, so a conversation renders without
//! duplicates or gaps while the agent is still working.
//!
//! # Architecture
//!
//! raw events → [`normalized`] → [`feed::processor`] → [`feed::filter`] →
//! [`feed::assembler`] → ordered, unique conversation items.
//!
//! [`approval`] runs beside the pipeline and resolves human-in-the-loop
//! gates against an external confirmation service.
//!
//! # Modules
//!
//! - [`normalized`]: Unified event model for live and replayed records
//! - [`feed`]: Transient items, reconciliation and assembly
//! - [`approval`]: Approval state machine
//! - [`session`]: Per-conversation context owning all mutable state
//! - [`backend`]: Task, approval and trace collaborators
//! - [`poller`]: Cancellable trace polling
//! - [`config`] / [`telemetry`]: Configuration and logging

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::assigning_clones)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]

pub mod approval;
pub mod backend;
pub mod config;
pub mod error;
pub mod feed;
pub mod normalized;
pub mod poller;
pub mod session;
pub mod telemetry;

pub use error::{FeedError, Result};
