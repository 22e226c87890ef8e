//! `POST /webhook/github`

use axum::{extract::State, http::HeaderMap, Json};

use crate::error::{AppError, AppResult};
use crate::services::webhook::{WebhookEvent, WebhookOutcome, WebhookPayload};
use crate::state::AppState;

const EVENT_HEADER: &str = "x-github-event";

pub async fn github(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> AppResult<Json<WebhookOutcome>> {
    let event = headers
        .get(EVENT_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::BadRequest("missing X-GitHub-Event header".to_string()))?
        .to_string();

    if event == "ping" {
        return Ok(Json(WebhookOutcome::Pong));
    }

    let action = body.get("action").and_then(|value| value.as_str());
    if WebhookEvent::from_header(&event, action).is_none() {
        tracing::debug!(event = %event, action = ?action, "Ignoring webhook event");
        return Ok(Json(WebhookOutcome::Ignored {
            reason: format!("unsupported event {event}"),
        }));
    }

    let Some(webhooks) = &state.webhooks else {
        return Err(AppError::NotFound("webhook ingress is not configured".to_string()));
    };

    let payload: WebhookPayload = serde_json::from_value(body)
        .map_err(|e| AppError::BadRequest(format!("invalid {event} payload: {e}")))?;

    Ok(Json(webhooks.handle(&event, payload).await?))
}
