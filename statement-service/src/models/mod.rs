//! Domain models for statement-service.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;
use uuid::Uuid;

// ============================================================================
// Statement Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementStatus {
    Pending,
    Processing,
    Done,
    Error,
}

impl StatementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => Self::Processing,
            "done" => Self::Done,
            "error" => Self::Error,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationStatus {
    Unbalanced,
    Verified,
    HumanVerified,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unbalanced => "unbalanced",
            Self::Verified => "verified",
            Self::HumanVerified => "human_verified",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unbalanced" => Some(Self::Unbalanced),
            "verified" => Some(Self::Verified),
            "human_verified" => Some(Self::HumanVerified),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Statement {
    pub statement_id: Uuid,
    pub owner_id: String,
    pub file_name: String,
    pub content_hash: String,
    pub storage_key: String,
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

impl Statement {
    pub fn is_human_verified(&self) -> bool {
        self.verification_status.as_deref() == Some(VerificationStatus::HumanVerified.as_str())
    }
}

// ============================================================================
// Transaction Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionSource {
    Statement,
    Sync,
}

impl TransactionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Statement => "statement",
            Self::Sync => "sync",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Transaction {
    pub transaction_id: Uuid,
    pub owner_id: String,
    pub statement_id: Option<Uuid>,
    pub txn_date: NaiveDate,
    pub description: String,
    pub amount: Decimal,
    pub running_balance: Option<Decimal>,
    pub category: Option<String>,
    pub source: String,
    pub is_provisional: bool,
    pub external_id: Option<String>,
    pub created_utc: DateTime<Utc>,
}

/// A normalized statement transaction ready for insertion, produced by the
/// statement processor from extraction output. Amounts already carry the
/// ledger sign convention (credits positive, debits negative).
#[derive(Debug, Clone)]
pub struct NewStatementTransaction {
    pub txn_date: NaiveDate,
    pub description: String,
    pub amount: Decimal,
    pub running_balance: Option<Decimal>,
    pub category: Option<String>,
}

// ============================================================================
// Job Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Job {
    pub job_id: Uuid,
    pub owner_id: String,
    pub status: String,
    pub total_items: i32,
    pub completed_items: i32,
    pub progress: i32,
    pub error_message: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        JobStatus::parse(&self.status).is_terminal()
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct JobItem {
    pub job_item_id: Uuid,
    pub job_id: Uuid,
    pub statement_id: Uuid,
    pub file_name: String,
    pub status: String,
    pub error_message: Option<String>,
    pub started_utc: Option<DateTime<Utc>>,
    pub completed_utc: Option<DateTime<Utc>>,
}

/// Compute the integer percentage shown to pollers.
pub fn job_progress(completed_items: i32, total_items: i32) -> i32 {
    if total_items <= 0 {
        return 0;
    }
    let pct = (completed_items as f64 / total_items as f64) * 100.0;
    (pct.round() as i32).clamp(0, 100)
}

// ============================================================================
// Sync Connection Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Active,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SyncConnection {
    pub connection_id: Uuid,
    pub owner_id: String,
    pub provider_item_id: String,
    pub cursor: Option<String>,
    pub last_synced_utc: Option<DateTime<Utc>>,
    pub status: String,
    pub error_message: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}
