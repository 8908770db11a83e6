//! Global boardcal configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono_tz::Tz;
use serde::Deserialize;

use crate::clients::RetryPolicy;
use crate::error::{SyncError, SyncResult};

const CONFIG_ENV: &str = "BOARDCAL_CONFIG";

/// Raw file shape at ~/.config/boardcal/config.toml. Durations are
/// humantime strings (`"20s"`, `"5m"`); everything is optional and falls
/// back to a default.
#[derive(Deserialize, Default)]
struct ConfigFile {
    timezone: Option<String>,
    debounce: Option<String>,
    dedup_window: Option<String>,
    tombstone_grace: Option<String>,
    default_event_duration: Option<String>,
    write_retries: Option<u32>,
    retry_backoff: Option<String>,
    state_dir: Option<PathBuf>,
    port: Option<u16>,
    board_webhook_token: Option<String>,
    master_calendar: Option<String>,
    #[serde(default)]
    person_calendars: HashMap<String, String>,
    #[serde(default)]
    board: BoardColumnsFile,
}

#[derive(Deserialize, Default)]
struct BoardColumnsFile {
    date_column: Option<String>,
    title_column: Option<String>,
    owner_column: Option<String>,
}

/// Which board columns map onto the synced field set.
#[derive(Debug, Clone)]
pub struct BoardColumns {
    pub date_column: String,
    pub title_column: String,
    pub owner_column: String,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Timezone attached to every timed event the engine creates.
    pub timezone: Tz,
    /// Echo-suppression window opened after each write.
    pub debounce: Duration,
    /// How long provider notification ids are remembered for redelivery dedup.
    pub dedup_window: Duration,
    /// How long deleted pairs linger as tombstones.
    pub tombstone_grace: Duration,
    /// Length of timed events created from a board date+time value.
    pub default_event_duration: Duration,
    pub write_retries: u32,
    pub retry_backoff: Duration,
    pub state_dir: PathBuf,
    pub port: u16,
    /// Shared secret the board provider sends with each webhook call.
    pub board_webhook_token: Option<String>,
    /// Calendar that holds events for unmapped owners.
    pub master_calendar: String,
    /// Owner column value -> per-person calendar.
    pub person_calendars: HashMap<String, String>,
    pub board: BoardColumns,
}

impl SyncConfig {
    pub fn config_path() -> SyncResult<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        let config_dir = dirs::config_dir()
            .ok_or_else(|| SyncError::Config("Could not determine config directory".into()))?
            .join("boardcal");
        Ok(config_dir.join("config.toml"))
    }

    /// Load the config file, writing a commented sample on first run.
    pub fn load() -> SyncResult<SyncConfig> {
        let path = Self::config_path()?;

        let file = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| SyncError::Config(format!("Could not read config file: {e}")))?;
            toml::from_str(&contents)
                .map_err(|e| SyncError::Config(format!("Could not parse {}: {e}", path.display())))?
        } else {
            if let Err(e) = Self::create_default_config(&path) {
                tracing::warn!("could not write default config at {}: {e}", path.display());
            }
            ConfigFile::default()
        };

        Self::resolve(file)
    }

    fn resolve(file: ConfigFile) -> SyncResult<SyncConfig> {
        let timezone: Tz = file
            .timezone
            .as_deref()
            .unwrap_or("Europe/Madrid")
            .parse()
            .map_err(|_| {
                SyncError::Config(format!(
                    "unknown timezone: {}",
                    file.timezone.as_deref().unwrap_or_default()
                ))
            })?;

        let state_dir = match file.state_dir {
            Some(dir) => dir,
            None => dirs::data_dir()
                .ok_or_else(|| SyncError::Config("Could not determine data directory".into()))?
                .join("boardcal"),
        };

        Ok(SyncConfig {
            timezone,
            debounce: parse_duration(file.debounce.as_deref(), "20s", "debounce")?,
            dedup_window: parse_duration(file.dedup_window.as_deref(), "5m", "dedup_window")?,
            tombstone_grace: parse_duration(
                file.tombstone_grace.as_deref(),
                "10m",
                "tombstone_grace",
            )?,
            default_event_duration: parse_duration(
                file.default_event_duration.as_deref(),
                "1h",
                "default_event_duration",
            )?,
            write_retries: file.write_retries.unwrap_or(3),
            retry_backoff: parse_duration(file.retry_backoff.as_deref(), "500ms", "retry_backoff")?,
            state_dir,
            port: file.port.unwrap_or(4097),
            board_webhook_token: file.board_webhook_token,
            master_calendar: file.master_calendar.unwrap_or_else(|| "master".to_string()),
            person_calendars: file.person_calendars,
            board: BoardColumns {
                date_column: file.board.date_column.unwrap_or_else(|| "date".to_string()),
                title_column: file.board.title_column.unwrap_or_else(|| "name".to_string()),
                owner_column: file.board.owner_column.unwrap_or_else(|| "person".to_string()),
            },
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.write_retries.max(1),
            backoff: self.retry_backoff,
        }
    }

    /// Create a default config file with all options commented out.
    pub fn create_default_config(path: &std::path::Path) -> SyncResult<()> {
        let contents = "\
# boardcal configuration

# Timezone attached to timed calendar events the engine creates:
# timezone = \"Europe/Madrid\"

# How long incoming notifications for a pair count as probable echoes
# after the engine writes that pair:
# debounce = \"20s\"

# Redelivery dedup window for provider notification ids:
# dedup_window = \"5m\"

# How long deleted pairs linger to absorb late duplicate notifications:
# tombstone_grace = \"10m\"

# Length of timed events created from a board date+time value:
# default_event_duration = \"1h\"

# Bounded retries for transient provider failures:
# write_retries = 3
# retry_backoff = \"500ms\"

# Where correlation state and channel registrations persist:
# state_dir = \"~/.local/share/boardcal\"

# Webhook server port (loopback only):
# port = 4097

# Shared secret the board provider echoes with each webhook call:
# board_webhook_token = \"...\"

# Calendar for events whose owner has no per-person calendar:
# master_calendar = \"master\"

# Owner column value -> per-person calendar:
# [person_calendars]
# alice = \"alice-calendar-id\"

# Board column ids for the synced fields:
# [board]
# date_column = \"date\"
# title_column = \"name\"
# owner_column = \"person\"
";

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SyncError::Config(format!("Could not create config directory: {e}"))
            })?;
        }
        std::fs::write(path, contents)
            .map_err(|e| SyncError::Config(format!("Could not write config file: {e}")))?;
        Ok(())
    }
}

fn parse_duration(value: Option<&str>, default: &str, field: &str) -> SyncResult<Duration> {
    let raw = value.unwrap_or(default);
    humantime::parse_duration(raw)
        .map_err(|e| SyncError::Config(format!("invalid duration for {field}: '{raw}' ({e})")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_resolve() {
        let config = SyncConfig::resolve(ConfigFile::default()).unwrap();
        assert_eq!(config.timezone.name(), "Europe/Madrid");
        assert_eq!(config.debounce, Duration::from_secs(20));
        assert_eq!(config.port, 4097);
        assert_eq!(config.board.date_column, "date");
    }

    #[test]
    fn test_parses_toml_overrides() {
        let file: ConfigFile = toml::from_str(
            r#"
            timezone = "America/New_York"
            debounce = "45s"
            master_calendar = "team"

            [person_calendars]
            alice = "alice-cal"

            [board]
            date_column = "due_date"
            "#,
        )
        .unwrap();
        let config = SyncConfig::resolve(file).unwrap();
        assert_eq!(config.timezone.name(), "America/New_York");
        assert_eq!(config.debounce, Duration::from_secs(45));
        assert_eq!(config.person_calendars.get("alice").unwrap(), "alice-cal");
        assert_eq!(config.board.date_column, "due_date");
        assert_eq!(config.board.title_column, "name");
    }

    #[test]
    fn test_bad_duration_is_config_error() {
        let file: ConfigFile = toml::from_str(r#"debounce = "soonish""#).unwrap();
        assert!(matches!(
            SyncConfig::resolve(file),
            Err(SyncError::Config(_))
        ));
    }
}
