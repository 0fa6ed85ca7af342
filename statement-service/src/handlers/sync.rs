use crate::dtos::{ConnectionResponse, CreateConnectionRequest, SyncAcceptedResponse, WebhookRequest};
use crate::middleware::UserId;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

pub async fn create_connection(
    State(state): State<AppState>,
    user_id: UserId,
    Json(request): Json<CreateConnectionRequest>,
) -> Result<impl IntoResponse, AppError> {
    if request.provider_item_id.trim().is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "provider_item_id must not be empty"
        )));
    }

    let connection = state
        .db
        .create_connection(&user_id.0, request.provider_item_id.trim())
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ConnectionResponse::from(connection)),
    ))
}

pub async fn get_connection(
    State(state): State<AppState>,
    user_id: UserId,
    Path(connection_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let connection = state
        .db
        .get_connection(&user_id.0, connection_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Sync connection not found")))?;
    Ok(Json(ConnectionResponse::from(connection)))
}

/// Pull and apply all outstanding provider deltas for a connection.
/// The pull runs detached; the caller polls the connection record for
/// `last_synced_utc` or an error.
pub async fn trigger_sync(
    State(state): State<AppState>,
    user_id: UserId,
    Path(connection_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    // Validate ownership before accepting the work.
    state
        .db
        .get_connection(&user_id.0, connection_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Sync connection not found")))?;

    spawn_sync(&state, user_id.0, connection_id);

    Ok((
        StatusCode::ACCEPTED,
        Json(SyncAcceptedResponse {
            connection_id,
            status: "accepted",
        }),
    ))
}

/// Provider-initiated notification. The provider only knows its own item
/// id, so the owner is resolved from the stored connection.
pub async fn sync_webhook(
    State(state): State<AppState>,
    Json(request): Json<WebhookRequest>,
) -> Result<impl IntoResponse, AppError> {
    let connection = state
        .db
        .find_connection_by_item(&request.provider_item_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!(
                "No connection registered for this provider item"
            ))
        })?;

    tracing::info!(
        connection_id = %connection.connection_id,
        "Webhook sync accepted"
    );

    let connection_id = connection.connection_id;
    spawn_sync(&state, connection.owner_id, connection_id);

    Ok((
        StatusCode::ACCEPTED,
        Json(SyncAcceptedResponse {
            connection_id,
            status: "accepted",
        }),
    ))
}

fn spawn_sync(state: &AppState, owner_id: String, connection_id: Uuid) {
    let engine = state.sync_engine.clone();
    tokio::spawn(async move {
        // The engine already records failures on the connection.
        if let Err(e) = engine.sync_connection(&owner_id, connection_id).await {
            tracing::warn!(connection_id = %connection_id, error = %e, "Detached sync failed");
            crate::services::metrics::record_error("sync");
        }
    });
}
