//! Calendar-side webhook ingestor.
//!
//! Accepts push-channel notifications: a validation handshake when the
//! subscription is created, then batches of change notices that carry a
//! subscription id and the changed event's id — never field values. The
//! channel registry resolves the subscription to its calendar scope and
//! proves provenance; the orchestrator refetches the event itself.

use std::collections::HashMap;

use axum::{
    Router,
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use serde::Deserialize;

use boardcal_core::{ChangeEvent, ChangeKind, ChangedFields, SourceSystem};

use crate::routes::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/webhooks/calendar", post(receive))
}

#[derive(Deserialize)]
struct CalendarWebhook {
    #[serde(default)]
    value: Vec<CalendarNotification>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarNotification {
    subscription_id: String,
    client_state: Option<String>,
    change_type: String,
    resource_data: Option<ResourceData>,
    /// Provider-assigned notification id, when present.
    id: Option<String>,
}

#[derive(Deserialize)]
struct ResourceData {
    id: String,
}

/// POST /webhooks/calendar - Inbound calendar push notifications
async fn receive(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Response, AppError> {
    // Subscription handshake: the provider expects the token echoed back
    // as plain text before it activates the channel
    if let Some(token) = params.get("validationToken") {
        return Ok((StatusCode::OK, token.clone()).into_response());
    }

    if body.is_empty() {
        return Ok(StatusCode::ACCEPTED.into_response());
    }
    let payload: CalendarWebhook = serde_json::from_slice(&body)
        .map_err(|e| anyhow::anyhow!("malformed calendar notification: {e}"))?;

    for notification in payload.value {
        if let Some(change) = normalize(&state, notification) {
            state.queue.enqueue(change);
        }
    }

    // Acknowledge before processing; the provider's SLA is sub-second
    Ok(StatusCode::ACCEPTED.into_response())
}

/// Resolve one notification against the channel registry. Returns `None`
/// for notices that must not reach the orchestrator (unknown channel, bad
/// client state, dedup hit, sync pings).
fn normalize(state: &AppState, notification: CalendarNotification) -> Option<ChangeEvent> {
    let Some(sub) = state.registry.owner_of(&notification.subscription_id) else {
        tracing::warn!(
            subscription = %notification.subscription_id,
            "notification for unknown channel rejected"
        );
        return None;
    };

    // The channel's shared secret proves the call came from the provider
    if sub.client_state.is_some() && sub.client_state != notification.client_state {
        tracing::warn!(
            subscription = %notification.subscription_id,
            "notification with wrong client state rejected"
        );
        return None;
    }

    if let Some(id) = &notification.id {
        if !state.dedup.first_seen(id) {
            tracing::debug!(notification = %id, "duplicate calendar notification dropped");
            return None;
        }
    }

    let kind = match notification.change_type.as_str() {
        "created" | "updated" | "missed" => ChangeKind::Upsert,
        "deleted" => ChangeKind::Delete,
        other => {
            tracing::debug!(change_type = %other, "ignoring calendar lifecycle notice");
            return None;
        }
    };

    let resource = notification.resource_data?;

    Some(ChangeEvent {
        source: SourceSystem::Calendar,
        entity_id: resource.id,
        calendar_owner: Some(sub.scope),
        kind,
        // Push notices never carry field detail; the orchestrator refetches
        changed: ChangedFields::Unknown,
        observed_at: chrono::Utc::now(),
        provider_event_id: notification.id,
    })
}
