//! Fingerprints over the synced field set.
//!
//! A fingerprint is the SHA-256 of a canonical rendering of the fields both
//! sides can represent (title, schedule, owner). Both sides hash the same
//! canonical form: board fields are hashed directly, calendar fields are
//! first projected through the board translation. That makes the fingerprint
//! stable across representation differences — the board due value
//! `2025-08-19 10:30` and the calendar event created from it produce the
//! same fingerprint, which is what the echo and idempotence checks rely on.

use chrono::SecondsFormat;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SyncResult;
use crate::fields::{BoardDue, BoardFields, CalendarFields, EventTime};
use crate::translate;

/// Hash of the normalized synced field set, as last written to one side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint of board columns. Timed due values are canonicalized to
    /// their UTC instant in the given zone, so the hash does not depend on
    /// which side rendered the fields.
    pub fn of_board(fields: &BoardFields, tz: Tz) -> SyncResult<Fingerprint> {
        let when = match fields.due.as_deref() {
            None => "none".to_string(),
            Some(raw) => {
                let due = BoardDue::parse(raw)?;
                match due.time {
                    None => format!("d:{}", due.date.format("%Y-%m-%d")),
                    Some(time) => {
                        let zoned = EventTime::Zoned {
                            datetime: due.date.and_time(time),
                            tzid: tz.name().to_string(),
                        };
                        format!(
                            "t:{}",
                            zoned.to_utc()?.to_rfc3339_opts(SecondsFormat::Secs, true)
                        )
                    }
                }
            }
        };
        let owner = fields
            .owner
            .as_deref()
            .map(|o| o.trim().to_lowercase())
            .unwrap_or_default();

        let canonical = format!("title={}\nwhen={}\nowner={}", fields.title.trim(), when, owner);

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Ok(Fingerprint(hex::encode(hasher.finalize())))
    }

    /// Fingerprint of calendar event fields: the event is projected onto the
    /// board-representable subset first, so fields the board cannot express
    /// (the end time, descriptions) never perturb the hash.
    pub fn of_calendar(fields: &CalendarFields, tz: Tz) -> SyncResult<Fingerprint> {
        let projected = translate::calendar_to_board(fields, tz)?;
        Fingerprint::of_board(&projected, tz)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // enough hex to be unambiguous in logs
        write!(f, "{}", &self.0[..12.min(self.0.len())])
    }
}
