//! External write-client seams.
//!
//! The thin authenticated API clients for each provider live outside this
//! crate; the engine only depends on these traits. Both contracts are
//! idempotent under retry given the same fields, which is what lets the
//! retry helper re-issue a timed-out write without risking duplicates.

use std::future::Future;

use async_trait::async_trait;

use crate::error::{SyncError, SyncResult};
use crate::fields::{BoardFields, CalendarFields};

/// Read/write access to the work-tracking board.
#[async_trait]
pub trait BoardClient: Send + Sync {
    /// Create a new item (`existing` = None) or update one in place.
    /// Returns the item id.
    async fn create_or_update_item(
        &self,
        existing: Option<&str>,
        fields: &BoardFields,
    ) -> SyncResult<String>;

    /// Read the synced columns of an item. `None` means the item is gone.
    async fn read_item(&self, id: &str) -> SyncResult<Option<BoardFields>>;
}

/// Read/write access to the calendar service.
#[async_trait]
pub trait CalendarClient: Send + Sync {
    /// Create a new event on `owner`'s calendar (`existing` = None) or
    /// update one in place. Returns the event id.
    async fn create_or_update_event(
        &self,
        owner: &str,
        existing: Option<&str>,
        fields: &CalendarFields,
    ) -> SyncResult<String>;

    /// Read the synced fields of an event. `None` means the event is gone.
    async fn read_event(&self, owner: &str, id: &str) -> SyncResult<Option<CalendarFields>>;

    /// Cancel an event. Deleting an already-gone event is a success.
    async fn delete_event(&self, owner: &str, id: &str) -> SyncResult<()>;
}

/// Bounded-retry policy for transient provider failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Base delay; doubles per retry.
    pub backoff: std::time::Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 3,
            backoff: std::time::Duration::from_millis(500),
        }
    }
}

/// Run an operation with bounded retries and exponential backoff.
///
/// Only `TransientProvider` errors are retried; translation, auth, and
/// conflict failures pass through immediately.
pub async fn with_retries<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < policy.attempts => {
                let delay = policy.backoff * 2u32.saturating_pow(attempt);
                tracing::debug!(attempt, ?delay, error = %err, "transient provider error, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Placeholder board client wired by the stock server binary until a
/// deployment links a real implementation.
pub struct UnconfiguredBoardClient;

#[async_trait]
impl BoardClient for UnconfiguredBoardClient {
    async fn create_or_update_item(
        &self,
        _existing: Option<&str>,
        _fields: &BoardFields,
    ) -> SyncResult<String> {
        Err(SyncError::Auth("no board client configured".into()))
    }

    async fn read_item(&self, _id: &str) -> SyncResult<Option<BoardFields>> {
        Err(SyncError::Auth("no board client configured".into()))
    }
}

/// Placeholder calendar client, same idea.
pub struct UnconfiguredCalendarClient;

#[async_trait]
impl CalendarClient for UnconfiguredCalendarClient {
    async fn create_or_update_event(
        &self,
        _owner: &str,
        _existing: Option<&str>,
        _fields: &CalendarFields,
    ) -> SyncResult<String> {
        Err(SyncError::Auth("no calendar client configured".into()))
    }

    async fn read_event(&self, _owner: &str, _id: &str) -> SyncResult<Option<CalendarFields>> {
        Err(SyncError::Auth("no calendar client configured".into()))
    }

    async fn delete_event(&self, _owner: &str, _id: &str) -> SyncResult<()> {
        Err(SyncError::Auth("no calendar client configured".into()))
    }
}
