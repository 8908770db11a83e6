//! Sync orchestrator: the per-pair anti-loop state machine.
//!
//! Consumes normalized `ChangeEvent`s, correlates them to a tracked pair,
//! decides propagate-or-suppress, and writes to the opposite side exactly
//! once per genuine change. Loop damping works by recording a fingerprint
//! of every write the engine performs and suppressing notifications whose
//! refetched fields hash to the same value — the predictable echo of our
//! own write — while letting field-different edits through even inside the
//! debounce window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::change::{ChangeEvent, ChangeKind, SourceSystem};
use crate::clients::{with_retries, BoardClient, CalendarClient, RetryPolicy};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::fields::{BoardFields, CalendarFields, CorrelationTag};
use crate::fingerprint::Fingerprint;
use crate::store::{CorrelationStore, SyncState, TrackedPair, WriteDirection};
use crate::translate;

/// What the orchestrator decided for one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Propagated: exactly one write to the opposite side.
    Wrote(WriteDirection),
    /// Matched the last-applied fingerprint inside the debounce window —
    /// the predictable echo of our own write.
    SuppressedEcho,
    /// Matched the last-applied fingerprint outside the window (provider
    /// redelivery or stale notification after convergence).
    SuppressedIdempotent,
    /// Late notification for a pair already tombstoned.
    SuppressedTombstone,
    /// Deletion notification for an entity the store has never linked.
    Unlinked,
    /// Source entity deleted; pair tombstoned.
    Deleted,
    /// Could not take the pair's processing slot within the bounded wait;
    /// the caller must put the event back on the queue.
    Requeued,
}

/// Orchestrator knobs, derived from [`SyncConfig`].
#[derive(Clone)]
pub struct OrchestratorOptions {
    pub timezone: Tz,
    pub debounce: Duration,
    pub default_event_duration: Duration,
    pub retry: RetryPolicy,
    pub master_calendar: String,
    pub person_calendars: HashMap<String, String>,
    /// Bounded wait for a pair's processing slot before requeueing.
    pub lock_wait: std::time::Duration,
}

impl OrchestratorOptions {
    pub fn from_config(config: &SyncConfig) -> OrchestratorOptions {
        OrchestratorOptions {
            timezone: config.timezone,
            debounce: Duration::from_std(config.debounce)
                .unwrap_or_else(|_| Duration::seconds(20)),
            default_event_duration: Duration::from_std(config.default_event_duration)
                .unwrap_or_else(|_| Duration::hours(1)),
            retry: config.retry_policy(),
            master_calendar: config.master_calendar.clone(),
            person_calendars: config.person_calendars.clone(),
            lock_wait: std::time::Duration::from_secs(5),
        }
    }
}

/// The decision core. All collaborators are injected; the orchestrator owns
/// no global state beyond the per-pair admission map.
pub struct Orchestrator {
    store: Arc<CorrelationStore>,
    board: Arc<dyn BoardClient>,
    calendar: Arc<dyn CalendarClient>,
    opts: OrchestratorOptions,
    /// Single-flight admission: one in-flight processing run per pair.
    /// Entries are keyed by pair key once linked, by source identity before.
    inflight: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<CorrelationStore>,
        board: Arc<dyn BoardClient>,
        calendar: Arc<dyn CalendarClient>,
        opts: OrchestratorOptions,
    ) -> Orchestrator {
        Orchestrator {
            store,
            board,
            calendar,
            opts,
            inflight: StdMutex::new(HashMap::new()),
        }
    }

    /// Process one notification end to end.
    ///
    /// Steps 2–6 of the sync state machine run atomically with respect to
    /// the pair's key; notifications for different pairs proceed in
    /// parallel. A notification that cannot take its slot within the
    /// bounded wait comes back as [`Outcome::Requeued`] — never dropped,
    /// since a dropped genuine edit is permanent divergence.
    pub async fn handle(&self, event: &ChangeEvent) -> SyncResult<Outcome> {
        let slot = self.slot(&self.lock_key(event));
        let _guard = match timeout(self.opts.lock_wait, slot.lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                debug!(source = %event.source, entity = %event.entity_id,
                       "pair busy, requeueing notification");
                return Ok(Outcome::Requeued);
            }
        };

        debug!(source = %event.source, entity = %event.entity_id, changed = ?event.changed,
               "processing notification");

        // State is re-read from the store now that we own the slot: a
        // concurrent run for the same pair may have just updated it.
        let now = Utc::now();
        match event.source {
            SourceSystem::Board => self.process_board(event, now).await,
            SourceSystem::Calendar => self.process_calendar(event, now).await,
        }
    }

    fn lock_key(&self, event: &ChangeEvent) -> String {
        match event.source {
            SourceSystem::Board => self
                .store
                .find_by_board_item(&event.entity_id)
                .map(|p| p.key)
                .unwrap_or_else(|| format!("board:{}", event.entity_id)),
            SourceSystem::Calendar => {
                let owner = event.calendar_owner.as_deref().unwrap_or_default();
                self.store
                    .find_by_calendar_event(owner, &event.entity_id)
                    .map(|p| p.key)
                    .unwrap_or_else(|| format!("calendar:{owner}:{}", event.entity_id))
            }
        }
    }

    fn slot(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut inflight = self.inflight.lock().unwrap();
        inflight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn target_owner(&self, fields: &BoardFields) -> String {
        fields
            .owner
            .as_deref()
            .and_then(|owner| self.opts.person_calendars.get(&owner.trim().to_lowercase()))
            .cloned()
            .unwrap_or_else(|| self.opts.master_calendar.clone())
    }

    async fn process_board(&self, event: &ChangeEvent, now: DateTime<Utc>) -> SyncResult<Outcome> {
        let pair = self.store.find_by_board_item(&event.entity_id);

        if let Some(pair) = &pair {
            if pair.deleted_at.is_some() {
                debug!(item = %event.entity_id, "late notification for tombstoned pair");
                return Ok(Outcome::SuppressedTombstone);
            }
        }

        if event.kind == ChangeKind::Delete {
            return match pair {
                Some(pair) => self.tombstone_from_board(pair, now).await,
                None => Ok(Outcome::Unlinked),
            };
        }

        // Board webhooks name columns, not values; the item's current
        // field state always comes from the read path.
        let fields = with_retries(&self.opts.retry, || self.board.read_item(&event.entity_id))
            .await?;
        let Some(fields) = fields else {
            // Gone between notification and refetch
            return match pair {
                Some(pair) => self.tombstone_from_board(pair, now).await,
                None => Ok(Outcome::Unlinked),
            };
        };

        let fingerprint = Fingerprint::of_board(&fields, self.opts.timezone)?;
        let mut pair = pair
            .unwrap_or_else(|| TrackedPair::provisional_board(event.entity_id.clone()));

        // Echo / idempotence: the same comparison, split by whether the
        // debounce window for a calendar->board write is still open.
        if pair.state.last_applied.as_ref() == Some(&fingerprint) {
            let is_echo = pair.state.debounce_active(now)
                && pair.state.direction == WriteDirection::CalendarToBoard;
            if is_echo {
                debug!(item = %event.entity_id, %fingerprint, "suppressed echo of calendar->board write");
                return Ok(Outcome::SuppressedEcho);
            }
            debug!(item = %event.entity_id, %fingerprint, "fields already applied, nothing to do");
            return Ok(Outcome::SuppressedIdempotent);
        }

        // Genuine board change: translate and write to the calendar.
        let mut calendar_fields =
            translate::board_to_calendar(&fields, self.opts.timezone, self.opts.default_event_duration)?;
        calendar_fields.correlation = Some(CorrelationTag {
            board_item_id: event.entity_id.clone(),
        });

        let owner = pair
            .calendar_owner
            .clone()
            .unwrap_or_else(|| self.target_owner(&fields));
        let event_id = with_retries(&self.opts.retry, || {
            self.calendar
                .create_or_update_event(&owner, pair.calendar_event_id.as_deref(), &calendar_fields)
        })
        .await?;

        info!(item = %event.entity_id, event = %event_id, calendar = %owner,
              "propagated board change to calendar");

        pair.calendar_owner = Some(owner);
        pair.calendar_event_id = Some(event_id);
        pair.state = SyncState {
            direction: WriteDirection::BoardToCalendar,
            last_write_at: Some(now),
            last_applied: Some(fingerprint),
            debounce_until: Some(now + self.opts.debounce),
        };
        self.record(pair)?;
        Ok(Outcome::Wrote(WriteDirection::BoardToCalendar))
    }

    async fn process_calendar(
        &self,
        event: &ChangeEvent,
        now: DateTime<Utc>,
    ) -> SyncResult<Outcome> {
        let owner = event.calendar_owner.clone().ok_or_else(|| {
            SyncError::Auth(format!(
                "calendar notification for {} has no resolvable channel scope",
                event.entity_id
            ))
        })?;

        let pair = self.store.find_by_calendar_event(&owner, &event.entity_id);

        if let Some(pair) = &pair {
            if pair.deleted_at.is_some() {
                debug!(event = %event.entity_id, "late notification for tombstoned pair");
                return Ok(Outcome::SuppressedTombstone);
            }
        }

        if event.kind == ChangeKind::Delete {
            return match pair {
                Some(pair) => self.tombstone_from_calendar(pair, now),
                None => Ok(Outcome::Unlinked),
            };
        }

        let fields = with_retries(&self.opts.retry, || {
            self.calendar.read_event(&owner, &event.entity_id)
        })
        .await?;
        let Some(fields) = fields else {
            return match pair {
                Some(pair) => self.tombstone_from_calendar(pair, now),
                None => Ok(Outcome::Unlinked),
            };
        };

        let fingerprint = Fingerprint::of_calendar(&fields, self.opts.timezone)?;
        let mut pair = self.resolve_calendar_pair(pair, &fields, &owner, &event.entity_id)?;

        if pair.state.last_applied.as_ref() == Some(&fingerprint) {
            let is_echo = pair.state.debounce_active(now)
                && pair.state.direction == WriteDirection::BoardToCalendar;
            if is_echo {
                debug!(event = %event.entity_id, %fingerprint, "suppressed echo of board->calendar write");
                return Ok(Outcome::SuppressedEcho);
            }
            debug!(event = %event.entity_id, %fingerprint, "fields already applied, nothing to do");
            return Ok(Outcome::SuppressedIdempotent);
        }

        let board_fields = translate::calendar_to_board(&fields, self.opts.timezone)?;
        let item_id = with_retries(&self.opts.retry, || {
            self.board
                .create_or_update_item(pair.board_item_id.as_deref(), &board_fields)
        })
        .await?;

        info!(event = %event.entity_id, item = %item_id, calendar = %owner,
              "propagated calendar change to board");

        pair.board_item_id = Some(item_id);
        pair.state = SyncState {
            direction: WriteDirection::CalendarToBoard,
            last_write_at: Some(now),
            last_applied: Some(fingerprint),
            debounce_until: Some(now + self.opts.debounce),
        };
        self.record(pair)?;
        Ok(Outcome::Wrote(WriteDirection::CalendarToBoard))
    }

    /// Resolve which pair a calendar notification belongs to: the store
    /// first, then the event's own correlation tag (the self-describing
    /// secondary channel), then a fresh provisional pair.
    fn resolve_calendar_pair(
        &self,
        found: Option<TrackedPair>,
        fields: &CalendarFields,
        owner: &str,
        event_id: &str,
    ) -> SyncResult<TrackedPair> {
        let tag = fields.correlation.as_ref();

        if let Some(pair) = found {
            if let (Some(tagged), Some(linked)) = (tag, pair.board_item_id.as_deref()) {
                if tagged.board_item_id != linked {
                    return Err(SyncError::CorrelationConflict(format!(
                        "event {event_id} is tagged for board item {} but linked to {}",
                        tagged.board_item_id, linked
                    )));
                }
            }
            return Ok(pair);
        }

        if let Some(tag) = tag {
            if let Some(mut linked) = self.store.find_by_board_item(&tag.board_item_id) {
                return match linked.calendar_event_id.clone() {
                    // Provisional pair with no counterpart yet; the tag
                    // re-links it to this event.
                    None => {
                        linked.calendar_owner = Some(owner.to_string());
                        linked.calendar_event_id = Some(event_id.to_string());
                        Ok(linked)
                    }
                    Some(current) if current == event_id => Ok(linked),
                    Some(other) => Err(SyncError::CorrelationConflict(format!(
                        "event {event_id} is tagged for board item {} already linked to event {other}",
                        tag.board_item_id
                    ))),
                };
            }
            // Tag names a board item the store has never tracked: adopt it
            // so the write updates that item instead of creating a twin.
            let mut pair = TrackedPair::provisional_calendar(owner.to_string(), event_id.to_string());
            pair.board_item_id = Some(tag.board_item_id.clone());
            return Ok(pair);
        }

        Ok(TrackedPair::provisional_calendar(
            owner.to_string(),
            event_id.to_string(),
        ))
    }

    async fn tombstone_from_board(
        &self,
        pair: TrackedPair,
        now: DateTime<Utc>,
    ) -> SyncResult<Outcome> {
        if let (Some(owner), Some(event_id)) = (&pair.calendar_owner, &pair.calendar_event_id) {
            with_retries(&self.opts.retry, || self.calendar.delete_event(owner, event_id)).await?;
            info!(item = ?pair.board_item_id, event = %event_id, "board item deleted, cancelled calendar event");
        }
        self.store.mark_deleted(&pair.key, now)?;
        Ok(Outcome::Deleted)
    }

    /// Calendar-side deletion tombstones the pair but leaves the board item
    /// in place: the board is the system of record, and destroying work
    /// items in response to a calendar cleanup risks data loss.
    fn tombstone_from_calendar(&self, pair: TrackedPair, now: DateTime<Utc>) -> SyncResult<Outcome> {
        info!(event = ?pair.calendar_event_id, item = ?pair.board_item_id,
              "calendar event deleted, unlinking pair (board item kept)");
        self.store.mark_deleted(&pair.key, now)?;
        Ok(Outcome::Deleted)
    }

    /// Persist the post-write state. The external write has already
    /// happened: a failure here means "write succeeded, suppression state
    /// lost", and we accept the bounded risk of one extra echo cycle (the
    /// fingerprint check absorbs it) instead of retrying the external write
    /// and risking a duplicate.
    fn record(&self, pair: TrackedPair) -> SyncResult<()> {
        if let Err(err) = self.store.upsert(pair) {
            match &err {
                SyncError::CorrelationConflict(msg) => {
                    error!("{msg}; flagged for manual reconciliation");
                }
                other => {
                    warn!(error = %other,
                          "write succeeded but recording sync state failed; \
                           suppression now relies on the fingerprint check");
                }
            }
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangedFields;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockBoard {
        items: StdMutex<HashMap<String, BoardFields>>,
        writes: AtomicUsize,
        next_id: AtomicUsize,
    }

    impl MockBoard {
        fn new() -> Arc<MockBoard> {
            Arc::new(MockBoard {
                items: StdMutex::new(HashMap::new()),
                writes: AtomicUsize::new(0),
                next_id: AtomicUsize::new(1),
            })
        }

        fn seed(&self, id: &str, fields: BoardFields) {
            self.items.lock().unwrap().insert(id.to_string(), fields);
        }

        fn get(&self, id: &str) -> Option<BoardFields> {
            self.items.lock().unwrap().get(id).cloned()
        }
    }

    #[async_trait]
    impl BoardClient for MockBoard {
        async fn create_or_update_item(
            &self,
            existing: Option<&str>,
            fields: &BoardFields,
        ) -> SyncResult<String> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let id = match existing {
                Some(id) => id.to_string(),
                None => format!("item-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            };
            self.items.lock().unwrap().insert(id.clone(), fields.clone());
            Ok(id)
        }

        async fn read_item(&self, id: &str) -> SyncResult<Option<BoardFields>> {
            Ok(self.items.lock().unwrap().get(id).cloned())
        }
    }

    struct MockCalendar {
        events: StdMutex<HashMap<(String, String), CalendarFields>>,
        writes: AtomicUsize,
        deletes: AtomicUsize,
        next_id: AtomicUsize,
        delay: Option<std::time::Duration>,
    }

    impl MockCalendar {
        fn new() -> Arc<MockCalendar> {
            Self::with_delay(None)
        }

        fn with_delay(delay: Option<std::time::Duration>) -> Arc<MockCalendar> {
            Arc::new(MockCalendar {
                events: StdMutex::new(HashMap::new()),
                writes: AtomicUsize::new(0),
                deletes: AtomicUsize::new(0),
                next_id: AtomicUsize::new(1),
                delay,
            })
        }

        fn seed(&self, owner: &str, id: &str, fields: CalendarFields) {
            self.events
                .lock()
                .unwrap()
                .insert((owner.to_string(), id.to_string()), fields);
        }

        fn get(&self, owner: &str, id: &str) -> Option<CalendarFields> {
            self.events
                .lock()
                .unwrap()
                .get(&(owner.to_string(), id.to_string()))
                .cloned()
        }
    }

    #[async_trait]
    impl CalendarClient for MockCalendar {
        async fn create_or_update_event(
            &self,
            owner: &str,
            existing: Option<&str>,
            fields: &CalendarFields,
        ) -> SyncResult<String> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            let id = match existing {
                Some(id) => id.to_string(),
                None => format!("evt-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            };
            self.events
                .lock()
                .unwrap()
                .insert((owner.to_string(), id.clone()), fields.clone());
            Ok(id)
        }

        async fn read_event(&self, owner: &str, id: &str) -> SyncResult<Option<CalendarFields>> {
            Ok(self.get(owner, id))
        }

        async fn delete_event(&self, owner: &str, id: &str) -> SyncResult<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.events
                .lock()
                .unwrap()
                .remove(&(owner.to_string(), id.to_string()));
            Ok(())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<CorrelationStore>,
        board: Arc<MockBoard>,
        calendar: Arc<MockCalendar>,
        orchestrator: Orchestrator,
    }

    fn options() -> OrchestratorOptions {
        OrchestratorOptions {
            timezone: "Europe/Madrid".parse().unwrap(),
            debounce: Duration::seconds(60),
            default_event_duration: Duration::hours(1),
            retry: RetryPolicy {
                attempts: 2,
                backoff: std::time::Duration::from_millis(1),
            },
            master_calendar: "master".to_string(),
            person_calendars: HashMap::from([("alice".to_string(), "alice-cal".to_string())]),
            lock_wait: std::time::Duration::from_secs(2),
        }
    }

    fn harness_with(calendar: Arc<MockCalendar>, opts: OrchestratorOptions) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CorrelationStore::open(dir.path()).unwrap());
        let board = MockBoard::new();
        let orchestrator = Orchestrator::new(
            store.clone(),
            board.clone(),
            calendar.clone(),
            opts,
        );
        Harness {
            _dir: dir,
            store,
            board,
            calendar,
            orchestrator,
        }
    }

    fn harness() -> Harness {
        harness_with(MockCalendar::new(), options())
    }

    fn board_event(item_id: &str) -> ChangeEvent {
        ChangeEvent {
            source: SourceSystem::Board,
            entity_id: item_id.to_string(),
            calendar_owner: None,
            kind: ChangeKind::Upsert,
            changed: ChangedFields::Unknown,
            observed_at: Utc::now(),
            provider_event_id: None,
        }
    }

    fn calendar_event(owner: &str, event_id: &str) -> ChangeEvent {
        ChangeEvent {
            source: SourceSystem::Calendar,
            entity_id: event_id.to_string(),
            calendar_owner: Some(owner.to_string()),
            kind: ChangeKind::Upsert,
            changed: ChangedFields::Unknown,
            observed_at: Utc::now(),
            provider_event_id: None,
        }
    }

    fn delete_of(mut event: ChangeEvent) -> ChangeEvent {
        event.kind = ChangeKind::Delete;
        event
    }

    fn kickoff(due: &str) -> BoardFields {
        BoardFields {
            title: "Kickoff".to_string(),
            due: Some(due.to_string()),
            owner: Some("alice".to_string()),
        }
    }

    #[tokio::test]
    async fn test_board_change_creates_calendar_event() {
        let h = harness();
        h.board.seed("item-7", kickoff("2025-08-19 10:30"));

        let outcome = h.orchestrator.handle(&board_event("item-7")).await.unwrap();
        assert_eq!(outcome, Outcome::Wrote(WriteDirection::BoardToCalendar));
        assert_eq!(h.calendar.writes.load(Ordering::SeqCst), 1);

        // Owner "alice" maps to her calendar
        let pair = h.store.find_by_board_item("item-7").unwrap();
        assert_eq!(pair.calendar_owner.as_deref(), Some("alice-cal"));
        let event_id = pair.calendar_event_id.unwrap();
        let written = h.calendar.get("alice-cal", &event_id).unwrap();
        assert_eq!(written.summary, "Kickoff");
        assert_eq!(
            written.correlation,
            Some(CorrelationTag {
                board_item_id: "item-7".to_string()
            })
        );

        // State records the write for loop suppression
        assert_eq!(pair.state.direction, WriteDirection::BoardToCalendar);
        assert!(pair.state.last_applied.is_some());
        assert!(pair.state.debounce_active(Utc::now()));
    }

    #[tokio::test]
    async fn test_unmapped_owner_lands_on_master_calendar() {
        let h = harness();
        h.board.seed(
            "item-1",
            BoardFields {
                title: "Ops review".to_string(),
                due: Some("2025-08-19".to_string()),
                owner: Some("charlie".to_string()),
            },
        );

        h.orchestrator.handle(&board_event("item-1")).await.unwrap();
        let pair = h.store.find_by_board_item("item-1").unwrap();
        assert_eq!(pair.calendar_owner.as_deref(), Some("master"));
    }

    #[tokio::test]
    async fn test_redelivered_notification_writes_once() {
        let h = harness();
        h.board.seed("item-7", kickoff("2025-08-19 10:30"));

        let first = h.orchestrator.handle(&board_event("item-7")).await.unwrap();
        let second = h.orchestrator.handle(&board_event("item-7")).await.unwrap();

        assert_eq!(first, Outcome::Wrote(WriteDirection::BoardToCalendar));
        assert_eq!(second, Outcome::SuppressedIdempotent);
        assert_eq!(h.calendar.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_calendar_echo_of_board_write_is_suppressed() {
        let h = harness();
        h.board.seed("item-7", kickoff("2025-08-19 10:30"));
        h.orchestrator.handle(&board_event("item-7")).await.unwrap();

        let pair = h.store.find_by_board_item("item-7").unwrap();
        let event_id = pair.calendar_event_id.clone().unwrap();

        // The provider notifies about the event we just created
        let outcome = h
            .orchestrator
            .handle(&calendar_event("alice-cal", &event_id))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::SuppressedEcho);
        // Zero writes back to the board
        assert_eq!(h.board.writes.load(Ordering::SeqCst), 0);
        // Suppression mutates nothing
        let after = h.store.find_by_board_item("item-7").unwrap();
        assert_eq!(after.state.direction, WriteDirection::BoardToCalendar);
    }

    #[tokio::test]
    async fn test_independent_edit_inside_debounce_propagates() {
        let h = harness();
        h.board.seed("item-7", kickoff("2025-08-19 10:30"));
        h.orchestrator.handle(&board_event("item-7")).await.unwrap();

        let pair = h.store.find_by_board_item("item-7").unwrap();
        let event_id = pair.calendar_event_id.clone().unwrap();

        // A genuine user edit lands while the debounce window is open:
        // the event moves to the next day
        let mut fields = h.calendar.get("alice-cal", &event_id).unwrap();
        let moved = chrono::NaiveDate::from_ymd_opt(2025, 8, 20)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap();
        fields.start = crate::fields::EventTime::Zoned {
            datetime: moved,
            tzid: "Europe/Madrid".to_string(),
        };
        fields.end = crate::fields::EventTime::Zoned {
            datetime: moved + Duration::hours(1),
            tzid: "Europe/Madrid".to_string(),
        };
        h.calendar.seed("alice-cal", &event_id, fields);

        let outcome = h
            .orchestrator
            .handle(&calendar_event("alice-cal", &event_id))
            .await
            .unwrap();

        // Fingerprints differ, so the edit is never silently dropped
        assert_eq!(outcome, Outcome::Wrote(WriteDirection::CalendarToBoard));
        assert_eq!(h.board.writes.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.board.get("item-7").unwrap().due.as_deref(),
            Some("2025-08-20 10:30")
        );

        // A new debounce window opens for the other direction, so the
        // board's own echo is suppressed in turn
        let pair = h.store.find_by_board_item("item-7").unwrap();
        assert_eq!(pair.state.direction, WriteDirection::CalendarToBoard);
        let echo = h.orchestrator.handle(&board_event("item-7")).await.unwrap();
        assert_eq!(echo, Outcome::SuppressedEcho);
        assert_eq!(h.calendar.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_calendar_event_creates_board_item() {
        let h = harness();
        let due = chrono::NaiveDate::from_ymd_opt(2025, 9, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        h.calendar.seed(
            "master",
            "evt-77",
            CalendarFields {
                summary: "Town hall".to_string(),
                start: crate::fields::EventTime::Zoned {
                    datetime: due,
                    tzid: "Europe/Madrid".to_string(),
                },
                end: crate::fields::EventTime::Zoned {
                    datetime: due + Duration::hours(1),
                    tzid: "Europe/Madrid".to_string(),
                },
                owner: None,
                correlation: None,
            },
        );

        let outcome = h
            .orchestrator
            .handle(&calendar_event("master", "evt-77"))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Wrote(WriteDirection::CalendarToBoard));
        let pair = h.store.find_by_calendar_event("master", "evt-77").unwrap();
        let item_id = pair.board_item_id.unwrap();
        assert_eq!(
            h.board.get(&item_id).unwrap().due.as_deref(),
            Some("2025-09-01 09:00")
        );
    }

    #[tokio::test]
    async fn test_correlation_tag_relinks_instead_of_duplicating() {
        let h = harness();
        h.board.seed("item-7", kickoff("2025-08-19 10:30"));

        // An event tagged for item-7 that the store has never seen (state
        // was lost, or the event was recreated provider-side)
        let due = chrono::NaiveDate::from_ymd_opt(2025, 8, 19)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        h.calendar.seed(
            "alice-cal",
            "evt-recreated",
            CalendarFields {
                summary: "Kickoff".to_string(),
                start: crate::fields::EventTime::Zoned {
                    datetime: due,
                    tzid: "Europe/Madrid".to_string(),
                },
                end: crate::fields::EventTime::Zoned {
                    datetime: due + Duration::hours(1),
                    tzid: "Europe/Madrid".to_string(),
                },
                owner: Some("alice".to_string()),
                correlation: Some(CorrelationTag {
                    board_item_id: "item-7".to_string(),
                }),
            },
        );

        let outcome = h
            .orchestrator
            .handle(&calendar_event("alice-cal", "evt-recreated"))
            .await
            .unwrap();

        // The tag routes the write to the existing item: update, not create
        assert_eq!(outcome, Outcome::Wrote(WriteDirection::CalendarToBoard));
        assert_eq!(h.board.items.lock().unwrap().len(), 1);
        assert_eq!(
            h.board.get("item-7").unwrap().due.as_deref(),
            Some("2025-08-19 12:00")
        );
        let pair = h.store.find_by_board_item("item-7").unwrap();
        assert_eq!(pair.calendar_event_id.as_deref(), Some("evt-recreated"));
    }

    #[tokio::test]
    async fn test_board_deletion_cancels_calendar_event() {
        let h = harness();
        h.board.seed("item-7", kickoff("2025-08-19 10:30"));
        h.orchestrator.handle(&board_event("item-7")).await.unwrap();

        let outcome = h
            .orchestrator
            .handle(&delete_of(board_event("item-7")))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Deleted);
        assert_eq!(h.calendar.deletes.load(Ordering::SeqCst), 1);
        assert!(h.store.find_by_board_item("item-7").unwrap().deleted_at.is_some());

        // A late duplicate deletion notification hits the tombstone
        let again = h
            .orchestrator
            .handle(&delete_of(board_event("item-7")))
            .await
            .unwrap();
        assert_eq!(again, Outcome::SuppressedTombstone);
        assert_eq!(h.calendar.deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_calendar_deletion_keeps_board_item() {
        let h = harness();
        h.board.seed("item-7", kickoff("2025-08-19 10:30"));
        h.orchestrator.handle(&board_event("item-7")).await.unwrap();
        let pair = h.store.find_by_board_item("item-7").unwrap();
        let event_id = pair.calendar_event_id.clone().unwrap();

        let outcome = h
            .orchestrator
            .handle(&delete_of(calendar_event("alice-cal", &event_id)))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Deleted);
        // Board is the system of record; the item survives unlinking
        assert!(h.board.get("item-7").is_some());
        assert!(h.store.find_by_board_item("item-7").unwrap().deleted_at.is_some());
    }

    #[tokio::test]
    async fn test_translation_failure_writes_nothing() {
        let h = harness();
        h.board.seed(
            "item-9",
            BoardFields {
                title: "Broken".to_string(),
                due: Some("not a date".to_string()),
                owner: None,
            },
        );

        let result = h.orchestrator.handle(&board_event("item-9")).await;
        assert!(matches!(result, Err(SyncError::Translation(_))));
        assert_eq!(h.calendar.writes.load(Ordering::SeqCst), 0);
        // The entity is left unlinked, not half-recorded
        assert!(h.store.find_by_board_item("item-9").is_none());
    }

    #[tokio::test]
    async fn test_same_pair_notifications_serialize() {
        let h = harness_with(
            MockCalendar::with_delay(Some(std::time::Duration::from_millis(100))),
            options(),
        );
        h.board.seed("item-7", kickoff("2025-08-19 10:30"));

        let event = board_event("item-7");
        let (a, b) = tokio::join!(
            h.orchestrator.handle(&event),
            h.orchestrator.handle(&event)
        );
        let outcomes = [a.unwrap(), b.unwrap()];

        // One run owns the write; the other re-evaluates against the
        // updated state and finds nothing to do
        assert!(outcomes.contains(&Outcome::Wrote(WriteDirection::BoardToCalendar)));
        assert!(outcomes.contains(&Outcome::SuppressedIdempotent));
        assert_eq!(h.calendar.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_pairs_do_not_block_each_other() {
        let h = harness_with(
            MockCalendar::with_delay(Some(std::time::Duration::from_millis(200))),
            options(),
        );
        h.board.seed("item-1", kickoff("2025-08-19 10:30"));
        h.board.seed("item-2", kickoff("2025-08-20 10:30"));

        let start = std::time::Instant::now();
        let event1 = board_event("item-1");
        let event2 = board_event("item-2");
        let (a, b) = tokio::join!(
            h.orchestrator.handle(&event1),
            h.orchestrator.handle(&event2)
        );
        let elapsed = start.elapsed();

        assert_eq!(a.unwrap(), Outcome::Wrote(WriteDirection::BoardToCalendar));
        assert_eq!(b.unwrap(), Outcome::Wrote(WriteDirection::BoardToCalendar));
        // Processed concurrently, not back to back
        assert!(elapsed < std::time::Duration::from_millis(350), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_busy_pair_requeues_instead_of_dropping() {
        let mut opts = options();
        opts.lock_wait = std::time::Duration::from_millis(10);
        let h = harness_with(
            MockCalendar::with_delay(Some(std::time::Duration::from_millis(200))),
            opts,
        );
        h.board.seed("item-7", kickoff("2025-08-19 10:30"));

        let event = board_event("item-7");
        let (a, b) = tokio::join!(
            h.orchestrator.handle(&event),
            h.orchestrator.handle(&event)
        );
        let outcomes = [a.unwrap(), b.unwrap()];

        assert!(outcomes.contains(&Outcome::Wrote(WriteDirection::BoardToCalendar)));
        assert!(outcomes.contains(&Outcome::Requeued));
        assert_eq!(h.calendar.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deletion_for_unknown_entity_is_unlinked() {
        let h = harness();
        let outcome = h
            .orchestrator
            .handle(&delete_of(board_event("item-404")))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Unlinked);
    }
}
