use crate::dtos::{
    JobResponse, ListParams, ProcessRequest, StatementListResponse, StatementResponse,
    UploadResponse, UploadedFileResponse, VerificationUpdateRequest,
};
use crate::ingest::{IngestOutcome, UploadedFile};
use crate::middleware::UserId;
use crate::models::{StatementStatus, VerificationStatus};
use crate::startup::AppState;
use crate::workers::JobRequest;
use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

/// Accept a multipart batch of statement files, dedup and persist them, and
/// start a background job over the newly created statements.
pub async fn upload_statements(
    State(state): State<AppState>,
    user_id: UserId,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        AppError::BadRequest(anyhow::anyhow!("Failed to read multipart field: {}", e))
    })? {
        let file_name = field.file_name().unwrap_or("unnamed").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| {
                AppError::BadRequest(anyhow::anyhow!("Failed to read file bytes: {}", e))
            })?
            .to_vec();
        files.push(UploadedFile { file_name, bytes });
    }

    if files.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("No file uploaded")));
    }

    let expanded = state.ingest.expand_batch(files)?;

    let mut responses = Vec::with_capacity(expanded.len());
    let mut job_items = Vec::new();
    for file in &expanded {
        let outcome = state.ingest.ingest_file(&user_id.0, file).await?;
        let duplicate = matches!(outcome, IngestOutcome::Duplicate { .. });
        if !duplicate {
            job_items.push((outcome.statement_id(), file.file_name.clone()));
        }
        responses.push(UploadedFileResponse {
            statement_id: outcome.statement_id(),
            file_name: file.file_name.clone(),
            duplicate,
        });
    }

    // Duplicates are already processed (or pending elsewhere); only fresh
    // statements get a job.
    let job = if job_items.is_empty() {
        None
    } else {
        let (job, _) = state.db.create_job(&user_id.0, &job_items).await?;
        enqueue_job(&state, &user_id.0, job.job_id).await?;

        tracing::info!(job_id = %job.job_id, items = job.total_items, "Upload job enqueued");
        Some(job.into())
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            job,
            files: responses,
        }),
    ))
}

/// Start a background job over a batch of already-ingested statements.
/// Returns immediately; progress is observed through the job endpoints.
pub async fn process_statements(
    State(state): State<AppState>,
    user_id: UserId,
    Json(request): Json<ProcessRequest>,
) -> Result<impl IntoResponse, AppError> {
    if request.statement_ids.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "statement_ids must not be empty"
        )));
    }

    let mut items = Vec::with_capacity(request.statement_ids.len());
    for statement_id in &request.statement_ids {
        let statement = state
            .db
            .get_statement(&user_id.0, *statement_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Statement {} not found", statement_id))
            })?;
        items.push((statement.statement_id, statement.file_name));
    }

    let (job, _) = state.db.create_job(&user_id.0, &items).await?;
    enqueue_job(&state, &user_id.0, job.job_id).await?;

    tracing::info!(job_id = %job.job_id, items = job.total_items, "Processing job enqueued");
    Ok((StatusCode::ACCEPTED, Json(JobResponse::from(job))))
}

/// Reprocess one statement inline from its stored bytes. Derived
/// transactions are rebuilt; a human verification override survives.
pub async fn reprocess_statement(
    State(state): State<AppState>,
    user_id: UserId,
    Path(statement_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state.processor.process(&user_id.0, statement_id).await?;
    Ok(Json(outcome))
}

async fn enqueue_job(state: &AppState, owner_id: &str, job_id: Uuid) -> Result<(), AppError> {
    let job_tx = state.job_tx.as_ref().ok_or_else(|| {
        AppError::ServiceUnavailable(anyhow::anyhow!("Worker pool not available"))
    })?;
    job_tx
        .send(JobRequest {
            job_id,
            owner_id: owner_id.to_string(),
        })
        .await
        .map_err(|_| AppError::ServiceUnavailable(anyhow::anyhow!("Worker queue is full")))
}

pub async fn update_verification(
    State(state): State<AppState>,
    user_id: UserId,
    Path(statement_id): Path<Uuid>,
    Json(request): Json<VerificationUpdateRequest>,
) -> Result<impl IntoResponse, AppError> {
    if VerificationStatus::parse(&request.verification_status)
        != Some(VerificationStatus::HumanVerified)
    {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Only 'human_verified' can be set manually"
        )));
    }

    match state.db.override_verification(&user_id.0, statement_id).await? {
        Some(statement) => Ok(Json(StatementResponse::from(statement))),
        None => {
            // Distinguish a missing statement from one not yet processed.
            let existing = state
                .db
                .get_statement(&user_id.0, statement_id)
                .await?
                .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Statement not found")))?;
            Err(AppError::Conflict(anyhow::anyhow!(
                "Statement must be processed before verification (status: {})",
                StatementStatus::parse(&existing.status).as_str()
            )))
        }
    }
}

pub async fn get_statement(
    State(state): State<AppState>,
    user_id: UserId,
    Path(statement_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let statement = state
        .db
        .get_statement(&user_id.0, statement_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Statement not found")))?;
    Ok(Json(StatementResponse::from(statement)))
}

pub async fn list_statements(
    State(state): State<AppState>,
    user_id: UserId,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, AppError> {
    let (statements, next_page_token) = state
        .db
        .list_statements(&user_id.0, params.page_size.unwrap_or(20), params.page_token)
        .await?;

    Ok(Json(StatementListResponse {
        statements: statements.into_iter().map(Into::into).collect(),
        next_page_token,
    }))
}
