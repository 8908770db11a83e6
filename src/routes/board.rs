//! Board-side webhook ingestor.
//!
//! Accepts the board provider's native payload: a one-time `challenge`
//! handshake when the webhook is registered, then per-item event payloads.
//! The handler authenticates, dedups redeliveries, normalizes to a
//! `ChangeEvent` and acknowledges immediately — processing happens on the
//! internal queue.

use std::collections::BTreeSet;

use axum::{
    Json, Router,
    extract::State,
    http::HeaderMap,
    routing::post,
};
use serde::Deserialize;
use serde_json::{Value, json};

use boardcal_core::{
    ChangeEvent, ChangeKind, ChangedFields, FieldKind, SyncError,
};

use crate::routes::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/webhooks/board", post(receive))
}

#[derive(Deserialize)]
struct BoardWebhook {
    challenge: Option<String>,
    event: Option<BoardEvent>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BoardEvent {
    #[serde(rename = "type")]
    kind: String,
    pulse_id: i64,
    column_id: Option<String>,
    trigger_uuid: Option<String>,
}

/// POST /webhooks/board - Inbound board notifications
async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<BoardWebhook>,
) -> Result<Json<Value>, AppError> {
    authorize(&state, &headers)?;

    // Registration handshake: the provider expects its challenge echoed back
    if let Some(challenge) = payload.challenge {
        return Ok(Json(json!({ "challenge": challenge })));
    }

    let Some(event) = payload.event else {
        return Ok(Json(json!({ "ok": true })));
    };

    // At-least-once delivery: drop redeliveries within the dedup window
    if let Some(trigger) = &event.trigger_uuid {
        if !state.dedup.first_seen(trigger) {
            tracing::debug!(trigger = %trigger, "duplicate board notification dropped");
            return Ok(Json(json!({ "ok": true })));
        }
    }

    let change = normalize(&state, event);
    state.queue.enqueue(change);
    Ok(Json(json!({ "ok": true })))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), SyncError> {
    let Some(expected) = &state.config.board_webhook_token else {
        return Ok(());
    };
    let presented = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok());
    if presented == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(SyncError::Auth("board webhook token mismatch".into()))
    }
}

fn normalize(state: &AppState, event: BoardEvent) -> ChangeEvent {
    let kind = match event.kind.as_str() {
        "delete_pulse" | "archive_pulse" => ChangeKind::Delete,
        _ => ChangeKind::Upsert,
    };

    // Column-change payloads name the column; everything else (creation,
    // moves, columns we don't recognize) forces a full refetch.
    let changed = match (kind, event.column_id.as_deref()) {
        (ChangeKind::Delete, _) => ChangedFields::Unknown,
        (_, Some(column)) => {
            let columns = &state.config.board;
            if column == columns.date_column {
                ChangedFields::Known(BTreeSet::from([FieldKind::Schedule]))
            } else if column == columns.title_column {
                ChangedFields::Known(BTreeSet::from([FieldKind::Title]))
            } else if column == columns.owner_column {
                ChangedFields::Known(BTreeSet::from([FieldKind::Owner]))
            } else {
                ChangedFields::Unknown
            }
        }
        (_, None) => ChangedFields::Unknown,
    };

    ChangeEvent {
        source: boardcal_core::SourceSystem::Board,
        entity_id: event.pulse_id.to_string(),
        calendar_owner: None,
        kind,
        changed,
        observed_at: chrono::Utc::now(),
        provider_event_id: event.trigger_uuid,
    }
}
