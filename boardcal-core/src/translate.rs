//! Field translation between board columns and calendar events.
//!
//! Pure functions, no state. A date-only board value becomes an all-day
//! event; a date+time value becomes a timed event in the configured
//! timezone. Calendar-only fields (description, attendees, ...) have no
//! board counterpart and are dropped, not stored.

use chrono::{Duration, TimeZone};
use chrono_tz::Tz;

use crate::error::{SyncError, SyncResult};
use crate::fields::{BoardDue, BoardFields, CalendarFields, EventTime};

/// Translate board columns into calendar event fields.
///
/// The configured timezone is attached to every timed event the engine
/// creates, regardless of which side authored the date. `default_duration`
/// sets the end of timed events (the board only has a start column).
pub fn board_to_calendar(
    fields: &BoardFields,
    tz: Tz,
    default_duration: Duration,
) -> SyncResult<CalendarFields> {
    let due = fields
        .due
        .as_deref()
        .ok_or_else(|| SyncError::Translation(format!("board item '{}' has no date", fields.title)))?;
    let due = BoardDue::parse(due)?;

    let (start, end) = match due.time {
        None => {
            // All-day event with the conventional exclusive end date
            let end = due.date.succ_opt().ok_or_else(|| {
                SyncError::Translation(format!("date out of range: {}", due.date))
            })?;
            (EventTime::Date(due.date), EventTime::Date(end))
        }
        Some(time) => {
            let start_naive = due.date.and_time(time);
            // Reject local times that don't exist in the configured zone
            // (spring-forward gap); ambiguous times take the earlier offset
            tz.from_local_datetime(&start_naive).earliest().ok_or_else(|| {
                SyncError::Translation(format!(
                    "local time {start_naive} does not exist in {}",
                    tz.name()
                ))
            })?;
            let end_naive = start_naive.checked_add_signed(default_duration).ok_or_else(
                || SyncError::Translation(format!("event end out of range: {start_naive}")),
            )?;
            (
                EventTime::Zoned {
                    datetime: start_naive,
                    tzid: tz.name().to_string(),
                },
                EventTime::Zoned {
                    datetime: end_naive,
                    tzid: tz.name().to_string(),
                },
            )
        }
    };

    Ok(CalendarFields {
        summary: fields.title.clone(),
        start,
        end,
        owner: fields.owner.clone(),
        correlation: None,
    })
}

/// Translate calendar event fields into board columns.
///
/// A timed event's start instant is rendered as wall-clock time in the
/// configured timezone; an all-day event becomes a date-only value.
pub fn calendar_to_board(fields: &CalendarFields, tz: Tz) -> SyncResult<BoardFields> {
    let due = match &fields.start {
        EventTime::Date(d) => BoardDue {
            date: *d,
            time: None,
        },
        zoned @ EventTime::Zoned { .. } => {
            let local = zoned.to_utc()?.with_timezone(&tz);
            BoardDue {
                date: local.date_naive(),
                time: Some(local.time()),
            }
        }
    };

    Ok(BoardFields {
        title: fields.summary.clone(),
        due: Some(due.render()),
        owner: fields.owner.clone(),
    })
}
