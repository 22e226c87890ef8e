//! Run request handlers.
//!
//! - `POST /request/create` (and `PUT`): submit a run, `202` with `submitted`
//! - `GET /request/status/{id}`: poll a run
//! - `POST /request/cancel/{id}`: cancel a run

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use policy_engine::{PolicyEngineRequest, RunStatus, ValidationIssue};

use crate::error::{AppError, AppResult};
use crate::result_ext::ResultExt;
use crate::state::AppState;

pub async fn create(
    State(state): State<AppState>,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> AppResult<(StatusCode, Json<RunStatus>)> {
    let Json(body) = body.map_err(|rejection| {
        AppError::Validation(vec![ValidationIssue::new(
            rejection.body_text(),
            vec!["body".to_string()],
            "json_invalid",
        )])
    })?;

    let request = PolicyEngineRequest::from_json_value(body)?;
    let status = state.backend.submit(request).await.log("submitting run")?;

    tracing::debug!(task_id = ?status.id(), backend = state.backend.kind().as_str(), "Run accepted");
    Ok((StatusCode::ACCEPTED, Json(status)))
}

pub async fn status(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<RunStatus>> {
    let status = state.backend.status(&id).await.log("polling run status")?;
    Ok(Json(status))
}

pub async fn cancel(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<RunStatus>> {
    let status = state.backend.cancel(&id).await.log("cancelling run")?;
    Ok(Json(status))
}
