//! Channel registry: active push-notification subscriptions.
//!
//! Incoming provider notifications typically carry only a channel
//! identifier, not the entity that changed. The registry maps that
//! identifier back to a system and scope so the ingestors can route the
//! notification. Creating and renewing subscriptions is an external
//! collaborator's job; the registry only tracks what exists and reports
//! what is about to expire.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::change::SourceSystem;
use crate::error::{SyncError, SyncResult};

const CHANNELS_FILE: &str = "channels.json";

/// How far ahead of expiry a subscription counts as due for renewal.
pub const RENEWAL_LEAD_HOURS: i64 = 12;

/// One active push-notification subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSubscription {
    /// The provider's channel / subscription identifier.
    pub channel_id: String,
    /// Shared secret the provider echoes back with each notification.
    pub client_state: Option<String>,
    pub system: SourceSystem,
    /// What the channel watches: a calendar owner or a board id.
    pub scope: String,
    pub expires_at: DateTime<Utc>,
}

impl ChannelSubscription {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Registry of active subscriptions, persisted beside the correlation store.
pub struct ChannelRegistry {
    path: PathBuf,
    inner: Mutex<HashMap<String, ChannelSubscription>>,
}

#[derive(Serialize, Deserialize, Default)]
struct RegistryFile {
    channels: Vec<ChannelSubscription>,
}

impl ChannelRegistry {
    pub fn open(state_dir: &Path) -> SyncResult<ChannelRegistry> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join(CHANNELS_FILE);

        let mut channels = HashMap::new();
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            let file: RegistryFile = serde_json::from_str(&contents).map_err(|e| {
                SyncError::Store(format!("could not parse {}: {e}", path.display()))
            })?;
            for sub in file.channels {
                channels.insert(sub.channel_id.clone(), sub);
            }
        }

        Ok(ChannelRegistry {
            path,
            inner: Mutex::new(channels),
        })
    }

    pub fn register(&self, sub: ChannelSubscription) -> SyncResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(sub.channel_id.clone(), sub);
        self.persist(&inner)
    }

    pub fn remove(&self, channel_id: &str) -> SyncResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.remove(channel_id).is_some();
        if removed {
            self.persist(&inner)?;
        }
        Ok(removed)
    }

    /// Resolve a channel id to its subscription.
    ///
    /// A notification arriving after the subscription's nominal expiry is
    /// still routed — the registered channel id itself proves provenance,
    /// and providers keep delivering briefly while a renewal is in flight.
    /// Unknown channels resolve to `None` and must be rejected upstream.
    pub fn owner_of(&self, channel_id: &str) -> Option<ChannelSubscription> {
        let inner = self.inner.lock().unwrap();
        let sub = inner.get(channel_id)?;
        if sub.expired(Utc::now()) {
            tracing::debug!(
                channel = %channel_id,
                expired_at = %sub.expires_at,
                "routing notification for nominally expired channel (renewal lag)"
            );
        }
        Some(sub.clone())
    }

    /// Subscriptions expiring within the lead window (or already expired),
    /// for the renewal collaborator to act on.
    pub fn renewal_due(&self, lead: Duration, now: DateTime<Utc>) -> Vec<ChannelSubscription> {
        let inner = self.inner.lock().unwrap();
        let mut due: Vec<ChannelSubscription> = inner
            .values()
            .filter(|sub| sub.expires_at - now <= lead)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        due
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, inner: &HashMap<String, ChannelSubscription>) -> SyncResult<()> {
        let mut channels: Vec<ChannelSubscription> = inner.values().cloned().collect();
        channels.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));

        let contents = serde_json::to_string_pretty(&RegistryFile { channels })
            .map_err(|e| SyncError::Serialization(e.to_string()))?;

        let temp = self.path.with_extension("json.tmp");
        std::fs::write(&temp, contents)?;
        std::fs::rename(&temp, &self.path)?;
        Ok(())
    }
}
