use crate::dtos::ResetStuckResponse;
use crate::middleware::UserId;
use crate::startup::AppState;
use crate::workers::INTERRUPTED_SENTINEL;
use axum::{extract::State, response::IntoResponse, Json};
use service_core::error::AppError;

/// Force everything stranded mid-flight back to a recoverable state:
/// statements return to `pending`, jobs and items fail with a sentinel
/// message so clients stop polling them.
pub async fn reset_stuck(
    State(state): State<AppState>,
    user_id: UserId,
) -> Result<impl IntoResponse, AppError> {
    let statements_reset = state.db.reset_stuck_statements(&user_id.0).await?;
    let (jobs_reset, job_items_reset) = state
        .db
        .reset_stuck_jobs(&user_id.0, INTERRUPTED_SENTINEL)
        .await?;

    tracing::info!(
        statements_reset,
        jobs_reset,
        job_items_reset,
        "Stuck state reset"
    );

    Ok(Json(ResetStuckResponse {
        statements_reset,
        jobs_reset,
        job_items_reset,
    }))
}
