//! Side-neutral field types.
//!
//! These types represent the synced field set of both systems: the board's
//! date/title/owner column values and the calendar's event fields. The
//! translator converts between them; everything downstream (fingerprints,
//! clients, orchestrator) works exclusively with these shapes.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Start or end of a calendar event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventTime {
    /// All-day event boundary.
    Date(NaiveDate),
    /// Timed event boundary: wall-clock time plus an explicit IANA timezone.
    Zoned { datetime: NaiveDateTime, tzid: String },
}

impl EventTime {
    /// Resolve to an absolute instant. All-day boundaries resolve to
    /// midnight UTC, which keeps ordering stable across both shapes.
    pub fn to_utc(&self) -> SyncResult<DateTime<Utc>> {
        match self {
            EventTime::Date(d) => {
                let midnight = d
                    .and_hms_opt(0, 0, 0)
                    .ok_or_else(|| SyncError::Translation(format!("invalid date: {d}")))?;
                Ok(midnight.and_utc())
            }
            EventTime::Zoned { datetime, tzid } => {
                let tz: Tz = tzid
                    .parse()
                    .map_err(|_| SyncError::Translation(format!("unknown timezone: {tzid}")))?;
                let local = tz.from_local_datetime(datetime).earliest().ok_or_else(|| {
                    SyncError::Translation(format!("nonexistent local time {datetime} in {tzid}"))
                })?;
                Ok(local.with_timezone(&Utc))
            }
        }
    }
}

/// A parsed board due value: a date column with an optional time component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardDue {
    pub date: NaiveDate,
    pub time: Option<NaiveTime>,
}

impl BoardDue {
    /// Parse a board date column value: `2025-08-19`, `2025-08-19 10:30`
    /// or `2025-08-19 10:30:00`.
    pub fn parse(value: &str) -> SyncResult<BoardDue> {
        let value = value.trim();
        for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
            if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
                return Ok(BoardDue {
                    date: dt.date(),
                    time: Some(dt.time()),
                });
            }
        }
        if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
            return Ok(BoardDue { date, time: None });
        }
        Err(SyncError::Translation(format!(
            "malformed board date value: '{value}'"
        )))
    }

    /// Render back into the board's column format.
    pub fn render(&self) -> String {
        match self.time {
            Some(t) => format!("{} {}", self.date.format("%Y-%m-%d"), t.format("%H:%M")),
            None => self.date.format("%Y-%m-%d").to_string(),
        }
    }
}

/// The synced subset of a board item's columns. The due value is kept in the
/// board's own column text format; parsing it is the translator's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardFields {
    pub title: String,
    pub due: Option<String>,
    pub owner: Option<String>,
}

/// Opaque metadata attached to calendar events the engine creates, so a
/// calendar-side notification can be traced back to its board item even
/// when the correlation store has no record of the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationTag {
    pub board_item_id: String,
}

/// The synced subset of a calendar event's fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarFields {
    pub summary: String,
    pub start: EventTime,
    pub end: EventTime,
    pub owner: Option<String>,
    pub correlation: Option<CorrelationTag>,
}
