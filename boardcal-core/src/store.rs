//! Correlation store: the persisted mapping between board items and
//! calendar events, plus the per-pair sync state the anti-loop engine
//! depends on.
//!
//! Durability matters more than query richness here — losing the last-write
//! fingerprint across a restart makes the engine re-propagate its own last
//! write as new, which shows up as a visible ping-pong. Every mutation is
//! written through to disk atomically (temp file + rename).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::fingerprint::Fingerprint;

const PAIRS_FILE: &str = "pairs.json";

/// Which side the engine wrote last for a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteDirection {
    None,
    BoardToCalendar,
    CalendarToBoard,
}

/// Per-pair state used for loop suppression. Mutated only by the
/// orchestrator, immediately after it performs a write, and always
/// overwritten whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub direction: WriteDirection,
    pub last_write_at: Option<DateTime<Utc>>,
    pub last_applied: Option<Fingerprint>,
    pub debounce_until: Option<DateTime<Utc>>,
}

impl Default for SyncState {
    fn default() -> Self {
        SyncState {
            direction: WriteDirection::None,
            last_write_at: None,
            last_applied: None,
            debounce_until: None,
        }
    }
}

impl SyncState {
    /// Whether the debounce window opened by the last write is still active.
    pub fn debounce_active(&self, now: DateTime<Utc>) -> bool {
        self.debounce_until.is_some_and(|until| now < until)
    }
}

/// The unit of correlation: one board item linked to one calendar event.
///
/// A pair starts provisional — created from whichever side notified first,
/// with no counterpart yet — and is completed by the orchestrator's first
/// successful write to the opposite side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedPair {
    pub key: String,
    pub board_item_id: Option<String>,
    pub calendar_owner: Option<String>,
    pub calendar_event_id: Option<String>,
    pub state: SyncState,
    /// Tombstone marker. Deleted pairs are retained for a grace period to
    /// absorb late duplicate deletion notifications, then pruned.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TrackedPair {
    pub fn provisional_board(board_item_id: String) -> TrackedPair {
        TrackedPair {
            key: Uuid::new_v4().to_string(),
            board_item_id: Some(board_item_id),
            calendar_owner: None,
            calendar_event_id: None,
            state: SyncState::default(),
            deleted_at: None,
        }
    }

    pub fn provisional_calendar(owner: String, event_id: String) -> TrackedPair {
        TrackedPair {
            key: Uuid::new_v4().to_string(),
            board_item_id: None,
            calendar_owner: Some(owner),
            calendar_event_id: Some(event_id),
            state: SyncState::default(),
            deleted_at: None,
        }
    }

    fn calendar_identity(&self) -> Option<(String, String)> {
        match (&self.calendar_owner, &self.calendar_event_id) {
            (Some(owner), Some(id)) => Some((owner.clone(), id.clone())),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Inner {
    pairs: HashMap<String, TrackedPair>,
    by_board_item: HashMap<String, String>,
    by_calendar_event: HashMap<(String, String), String>,
}

impl Inner {
    fn index(&mut self, pair: &TrackedPair) {
        if let Some(board_id) = &pair.board_item_id {
            self.by_board_item.insert(board_id.clone(), pair.key.clone());
        }
        if let Some(identity) = pair.calendar_identity() {
            self.by_calendar_event.insert(identity, pair.key.clone());
        }
    }

    fn unindex(&mut self, pair: &TrackedPair) {
        if let Some(board_id) = &pair.board_item_id {
            self.by_board_item.remove(board_id);
        }
        if let Some(identity) = pair.calendar_identity() {
            self.by_calendar_event.remove(&identity);
        }
    }
}

/// Key-value store of tracked pairs with O(1) lookup from either side's
/// identity. Lookups return tombstoned pairs too, so late notifications can
/// be recognized and suppressed.
pub struct CorrelationStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

#[derive(Serialize, Deserialize, Default)]
struct StoreFile {
    pairs: Vec<TrackedPair>,
}

impl CorrelationStore {
    /// Load the store from `state_dir/pairs.json`, creating the directory
    /// (and an empty store) on first run.
    pub fn open(state_dir: &Path) -> SyncResult<CorrelationStore> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join(PAIRS_FILE);

        let mut inner = Inner::default();
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            let file: StoreFile = serde_json::from_str(&contents).map_err(|e| {
                SyncError::Store(format!("could not parse {}: {e}", path.display()))
            })?;
            for pair in file.pairs {
                inner.index(&pair);
                inner.pairs.insert(pair.key.clone(), pair);
            }
        }

        Ok(CorrelationStore {
            path,
            inner: Mutex::new(inner),
        })
    }

    pub fn find_by_board_item(&self, board_item_id: &str) -> Option<TrackedPair> {
        let inner = self.inner.lock().unwrap();
        let key = inner.by_board_item.get(board_item_id)?;
        inner.pairs.get(key).cloned()
    }

    pub fn find_by_calendar_event(&self, owner: &str, event_id: &str) -> Option<TrackedPair> {
        let inner = self.inner.lock().unwrap();
        let key = inner
            .by_calendar_event
            .get(&(owner.to_string(), event_id.to_string()))?;
        inner.pairs.get(key).cloned()
    }

    pub fn find_by_key(&self, key: &str) -> Option<TrackedPair> {
        self.inner.lock().unwrap().pairs.get(key).cloned()
    }

    /// Insert or replace a pair, overwriting its `SyncState` entirely.
    ///
    /// Enforces the correlation invariant: at most one live pair per board
    /// item and per `(owner, event)` identity. A pair claiming a counterpart
    /// already linked elsewhere is rejected with `CorrelationConflict` and
    /// left for manual reconciliation — silently picking a winner risks
    /// losing data.
    pub fn upsert(&self, pair: TrackedPair) -> SyncResult<()> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(board_id) = &pair.board_item_id {
            if let Some(other) = inner.by_board_item.get(board_id) {
                if *other != pair.key {
                    return Err(SyncError::CorrelationConflict(format!(
                        "board item {board_id} is already linked to another pair"
                    )));
                }
            }
        }
        if let Some((owner, event_id)) = pair.calendar_identity() {
            if let Some(other) = inner.by_calendar_event.get(&(owner.clone(), event_id.clone())) {
                if *other != pair.key {
                    return Err(SyncError::CorrelationConflict(format!(
                        "calendar event {event_id} in {owner} is already linked to another pair"
                    )));
                }
            }
        }

        if let Some(previous) = inner.pairs.remove(&pair.key) {
            inner.unindex(&previous);
        }
        inner.index(&pair);
        inner.pairs.insert(pair.key.clone(), pair);

        self.persist(&inner)
    }

    /// Tombstone a pair. The record and its indexes stay in place so late
    /// duplicate notifications still resolve to it.
    pub fn mark_deleted(&self, key: &str, now: DateTime<Utc>) -> SyncResult<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.pairs.get_mut(key) {
            Some(pair) => pair.deleted_at = Some(now),
            None => return Err(SyncError::Store(format!("no such pair: {key}"))),
        }
        self.persist(&inner)
    }

    /// Drop tombstones older than the grace period. Returns how many were
    /// pruned.
    pub fn prune_tombstones(&self, grace: Duration, now: DateTime<Utc>) -> SyncResult<usize> {
        let mut inner = self.inner.lock().unwrap();

        let expired: Vec<TrackedPair> = inner
            .pairs
            .values()
            .filter(|p| p.deleted_at.is_some_and(|at| now - at > grace))
            .cloned()
            .collect();

        if expired.is_empty() {
            return Ok(0);
        }
        for pair in &expired {
            inner.unindex(pair);
            inner.pairs.remove(&pair.key);
        }
        self.persist(&inner)?;
        Ok(expired.len())
    }

    /// (live, tombstoned) pair counts, for the status surface.
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        let tombstoned = inner.pairs.values().filter(|p| p.deleted_at.is_some()).count();
        (inner.pairs.len() - tombstoned, tombstoned)
    }

    fn persist(&self, inner: &Inner) -> SyncResult<()> {
        let mut pairs: Vec<TrackedPair> = inner.pairs.values().cloned().collect();
        // Sort for deterministic output
        pairs.sort_by(|a, b| a.key.cmp(&b.key));

        let contents = serde_json::to_string_pretty(&StoreFile { pairs })
            .map_err(|e| SyncError::Serialization(e.to_string()))?;

        // Write to temp file first, then rename: a crash mid-write must not
        // lose the previous snapshot
        let temp = self.path.with_extension("json.tmp");
        std::fs::write(&temp, contents)?;
        std::fs::rename(&temp, &self.path)?;
        Ok(())
    }
}
