//! Normalized change notifications.
//!
//! The webhook ingestors reduce both providers' payload shapes to
//! `ChangeEvent`, the single unit the orchestrator consumes. A `ChangeEvent`
//! is ephemeral: it lives for the processing of one notification and is
//! never persisted.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which side produced a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceSystem {
    Board,
    Calendar,
}

impl fmt::Display for SourceSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceSystem::Board => write!(f, "board"),
            SourceSystem::Calendar => write!(f, "calendar"),
        }
    }
}

/// What happened to the source entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Created or updated; the orchestrator reads current state to decide.
    Upsert,
    Delete,
}

/// A synced field the provider named in its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FieldKind {
    Schedule,
    Title,
    Owner,
}

/// Which fields a notification claims changed.
///
/// Most real provider webhooks carry only "something changed"; those
/// normalize to `Unknown`, which makes the orchestrator refetch the full
/// entity instead of guessing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangedFields {
    Known(BTreeSet<FieldKind>),
    Unknown,
}

/// The normalized unit the orchestrator consumes, one per inbound
/// notification.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub source: SourceSystem,
    /// Board item id or calendar event id, depending on `source`.
    pub entity_id: String,
    /// Which calendar holds the event; resolved by the channel registry.
    /// Always set for calendar-side events, never for board-side ones.
    pub calendar_owner: Option<String>,
    pub kind: ChangeKind,
    pub changed: ChangedFields,
    pub observed_at: DateTime<Utc>,
    /// Provider-assigned notification id, when the provider supplies one.
    /// Used by the ingestors for redelivery dedup.
    pub provider_event_id: Option<String>,
}
