use std::sync::Arc;

use boardcal_core::{ChannelRegistry, CorrelationStore, DedupWindow, SyncConfig};

use crate::queue::SyncQueue;

/// Shared application state: every collaborator the routes need, injected
/// once at startup.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SyncConfig>,
    pub store: Arc<CorrelationStore>,
    pub registry: Arc<ChannelRegistry>,
    pub dedup: Arc<DedupWindow>,
    pub queue: SyncQueue,
}
