//! Request and response types for the HTTP surface.

use crate::models::{Job, JobItem, Statement, SyncConnection};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub page_size: Option<i32>,
    pub page_token: Option<Uuid>,
}

// ============================================================================
// Statements
// ============================================================================

#[derive(Debug, Serialize)]
pub struct StatementResponse {
    pub statement_id: Uuid,
    pub file_name: String,
    pub size_bytes: i64,
    pub status: String,
    pub verification_status: Option<String>,
    pub bank_name: Option<String>,
    pub account_number_masked: Option<String>,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub opening_balance: Option<Decimal>,
    pub closing_balance: Option<Decimal>,
    pub total_deposits: Option<Decimal>,
    pub total_withdrawals: Option<Decimal>,
    pub discrepancy_amount: Option<Decimal>,
    pub error_message: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl From<Statement> for StatementResponse {
    fn from(s: Statement) -> Self {
        Self {
            statement_id: s.statement_id,
            file_name: s.file_name,
            size_bytes: s.size_bytes,
            status: s.status,
            verification_status: s.verification_status,
            bank_name: s.bank_name,
            account_number_masked: s.account_number_masked,
            period_start: s.period_start,
            period_end: s.period_end,
            opening_balance: s.opening_balance,
            closing_balance: s.closing_balance,
            total_deposits: s.total_deposits,
            total_withdrawals: s.total_withdrawals,
            discrepancy_amount: s.discrepancy_amount,
            error_message: s.error_message,
            created_utc: s.created_utc,
            updated_utc: s.updated_utc,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatementListResponse {
    pub statements: Vec<StatementResponse>,
    pub next_page_token: Option<String>,
}

/// Per-file result echoed back from an upload batch.
#[derive(Debug, Serialize)]
pub struct UploadedFileResponse {
    pub statement_id: Uuid,
    pub file_name: String,
    pub duplicate: bool,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    /// Absent when every file in the batch was a duplicate.
    pub job: Option<JobResponse>,
    pub files: Vec<UploadedFileResponse>,
}

/// Batch processing request; becomes a job with one item per statement.
#[derive(Debug, Deserialize)]
pub struct ProcessRequest {
    pub statement_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct VerificationUpdateRequest {
    pub verification_status: String,
}

// ============================================================================
// Jobs
// ============================================================================

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job_id: Uuid,
    pub status: String,
    pub total_items: i32,
    pub completed_items: i32,
    pub progress: i32,
    pub error_message: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl From<Job> for JobResponse {
    fn from(j: Job) -> Self {
        Self {
            job_id: j.job_id,
            status: j.status,
            total_items: j.total_items,
            completed_items: j.completed_items,
            progress: j.progress,
            error_message: j.error_message,
            created_utc: j.created_utc,
            updated_utc: j.updated_utc,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobItemResponse {
    pub job_item_id: Uuid,
    pub statement_id: Uuid,
    pub file_name: String,
    pub status: String,
    pub error_message: Option<String>,
    pub started_utc: Option<DateTime<Utc>>,
    pub completed_utc: Option<DateTime<Utc>>,
}

impl From<JobItem> for JobItemResponse {
    fn from(i: JobItem) -> Self {
        Self {
            job_item_id: i.job_item_id,
            statement_id: i.statement_id,
            file_name: i.file_name,
            status: i.status,
            error_message: i.error_message,
            started_utc: i.started_utc,
            completed_utc: i.completed_utc,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobDetailResponse {
    #[serde(flatten)]
    pub job: JobResponse,
    pub items: Vec<JobItemResponse>,
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
    pub next_page_token: Option<String>,
}

// ============================================================================
// Sync
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateConnectionRequest {
    pub provider_item_id: String,
}

#[derive(Debug, Serialize)]
pub struct ConnectionResponse {
    pub connection_id: Uuid,
    pub provider_item_id: String,
    pub status: String,
    pub last_synced_utc: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_utc: DateTime<Utc>,
}

impl From<SyncConnection> for ConnectionResponse {
    fn from(c: SyncConnection) -> Self {
        Self {
            connection_id: c.connection_id,
            provider_item_id: c.provider_item_id,
            status: c.status,
            last_synced_utc: c.last_synced_utc,
            error_message: c.error_message,
            created_utc: c.created_utc,
        }
    }
}

/// Sync runs detached from the triggering request; the caller polls the
/// connection for the outcome.
#[derive(Debug, Serialize)]
pub struct SyncAcceptedResponse {
    pub connection_id: Uuid,
    pub status: &'static str,
}

/// Provider webhook notification that a connection has new deltas.
#[derive(Debug, Deserialize)]
pub struct WebhookRequest {
    pub provider_item_id: String,
}

// ============================================================================
// Maintenance
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ResetStuckResponse {
    pub statements_reset: u64,
    pub jobs_reset: u64,
    pub job_items_reset: u64,
}
