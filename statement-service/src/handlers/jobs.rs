use crate::dtos::{JobDetailResponse, JobListResponse, ListParams};
use crate::middleware::UserId;
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    Json,
};
use futures::stream::Stream;
use service_core::error::AppError;
use std::convert::Infallible;
use uuid::Uuid;

pub async fn list_jobs(
    State(state): State<AppState>,
    user_id: UserId,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, AppError> {
    let (jobs, next_page_token) = state
        .db
        .list_jobs(&user_id.0, params.page_size.unwrap_or(20), params.page_token)
        .await?;

    Ok(Json(JobListResponse {
        jobs: jobs.into_iter().map(Into::into).collect(),
        next_page_token,
    }))
}

pub async fn get_job(
    State(state): State<AppState>,
    user_id: UserId,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let job = state
        .db
        .get_job(&user_id.0, job_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Job not found")))?;
    let items = state.db.get_job_items(job_id).await?;

    Ok(Json(JobDetailResponse {
        job: job.into(),
        items: items.into_iter().map(Into::into).collect(),
    }))
}

/// Live job progress as server-sent events.
///
/// Emits a `progress` snapshot (job plus items) immediately and then on
/// every poll interval; the terminal snapshot goes out as `done` and
/// closes the stream. A job that vanishes mid-stream yields `error`.
pub async fn job_progress(
    State(state): State<AppState>,
    user_id: UserId,
    Path(job_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    // 404 before committing to a stream.
    state
        .db
        .get_job(&user_id.0, job_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Job not found")))?;

    let db = state.db.clone();
    let owner_id = user_id.0;
    let interval = state.config.processing.progress_poll_interval();

    let stream = futures::stream::unfold((true, false), move |(first, done)| {
        let db = db.clone();
        let owner_id = owner_id.clone();
        async move {
            if done {
                return None;
            }
            if !first {
                tokio::time::sleep(interval).await;
            }

            let snapshot = match db.get_job(&owner_id, job_id).await {
                Ok(Some(job)) => match db.get_job_items(job_id).await {
                    Ok(items) => Some((job, items)),
                    Err(_) => None,
                },
                Ok(None) | Err(_) => None,
            };

            let (event, terminal) = match snapshot {
                Some((job, items)) => {
                    let terminal = job.is_terminal();
                    let body = JobDetailResponse {
                        job: job.into(),
                        items: items.into_iter().map(Into::into).collect(),
                    };
                    let event = Event::default()
                        .event(if terminal { "done" } else { "progress" })
                        .json_data(&body)
                        .unwrap_or_default();
                    (event, terminal)
                }
                // The job disappearing or a transient query failure both end
                // the stream; the client re-connects or falls back to GET.
                None => (Event::default().event("error"), true),
            };

            Some((Ok(event), (false, terminal)))
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
