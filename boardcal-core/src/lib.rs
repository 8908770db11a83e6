//! Core library for the boardcal ecosystem.
//!
//! boardcal keeps a work-tracking board and a calendar service mirrored in
//! both directions. This crate carries everything below the webhook
//! surface:
//! - field types and the board⇄calendar translator
//! - the correlation store (tracked pairs + per-pair sync state)
//! - the channel registry and notification dedup window
//! - the external client seams
//! - the sync orchestrator / anti-loop engine

pub mod change;
pub mod clients;
pub mod config;
pub mod dedup;
pub mod error;
pub mod fields;
pub mod fingerprint;
pub mod orchestrator;
pub mod registry;
pub mod store;
pub mod translate;

// Re-export the types the server works with day to day
pub use change::{ChangeEvent, ChangeKind, ChangedFields, FieldKind, SourceSystem};
pub use clients::{BoardClient, CalendarClient, RetryPolicy, UnconfiguredBoardClient, UnconfiguredCalendarClient};
pub use config::SyncConfig;
pub use dedup::DedupWindow;
pub use error::{SyncError, SyncResult};
pub use fields::{BoardFields, CalendarFields, EventTime};
pub use fingerprint::Fingerprint;
pub use orchestrator::{Orchestrator, OrchestratorOptions, Outcome};
pub use registry::{ChannelRegistry, ChannelSubscription, RENEWAL_LEAD_HOURS};
pub use store::{CorrelationStore, SyncState, TrackedPair, WriteDirection};
