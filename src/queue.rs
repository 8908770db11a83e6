//! Internal processing queue.
//!
//! Webhook handlers must acknowledge sub-second, so they only normalize and
//! enqueue; this queue decouples the provider's response-time SLA from the
//! actual sync work. Each event is processed on its own task — the
//! orchestrator's per-pair admission keeps same-pair runs serialized while
//! unrelated pairs proceed in parallel.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use boardcal_core::{ChangeEvent, Orchestrator, Outcome, SyncError};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// How long a busy-pair event waits before going back on the queue.
const REQUEUE_DELAY: std::time::Duration = std::time::Duration::from_millis(250);

#[derive(Clone)]
pub struct SyncQueue {
    tx: mpsc::UnboundedSender<ChangeEvent>,
    depth: Arc<AtomicUsize>,
}

impl SyncQueue {
    /// Spawn the drain task and hand back the enqueue side.
    pub fn start(orchestrator: Arc<Orchestrator>) -> SyncQueue {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));

        let queue = SyncQueue {
            tx: tx.clone(),
            depth: depth.clone(),
        };
        tokio::spawn(drain(rx, orchestrator, queue.clone()));
        queue
    }

    pub fn enqueue(&self, event: ChangeEvent) {
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(event).is_err() {
            // Only happens during shutdown
            self.depth.fetch_sub(1, Ordering::SeqCst);
            warn!("processing queue is gone, notification dropped at shutdown");
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

async fn drain(
    mut rx: mpsc::UnboundedReceiver<ChangeEvent>,
    orchestrator: Arc<Orchestrator>,
    queue: SyncQueue,
) {
    while let Some(event) = rx.recv().await {
        queue.depth.fetch_sub(1, Ordering::SeqCst);
        let orchestrator = orchestrator.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            match orchestrator.handle(&event).await {
                Ok(Outcome::Requeued) => {
                    // Another run owns the pair right now; re-evaluate the
                    // notification against its updated state shortly.
                    tokio::time::sleep(REQUEUE_DELAY).await;
                    queue.enqueue(event);
                }
                Ok(outcome) => {
                    debug!(source = %event.source, entity = %event.entity_id, ?outcome,
                           "notification processed");
                }
                Err(err) => escalate(&event, err),
            }
        });
    }
}

/// Map failures to the operator surface per the error taxonomy. Retries
/// have already been exhausted by the time an error reaches this point.
fn escalate(event: &ChangeEvent, err: SyncError) {
    match &err {
        SyncError::Translation(msg) => {
            warn!(source = %event.source, entity = %event.entity_id,
                  "translation failed, entity left unlinked: {msg}");
        }
        SyncError::TransientProvider(msg) => {
            warn!(source = %event.source, entity = %event.entity_id,
                  "provider kept failing after bounded retries: {msg}");
        }
        SyncError::Auth(msg) => {
            error!(source = %event.source, entity = %event.entity_id,
                   "credential or permission failure: {msg}");
        }
        SyncError::CorrelationConflict(msg) => {
            error!(source = %event.source, entity = %event.entity_id,
                   "correlation conflict, manual reconciliation required: {msg}");
        }
        other => {
            error!(source = %event.source, entity = %event.entity_id,
                   "notification processing failed: {other}");
        }
    }
}
