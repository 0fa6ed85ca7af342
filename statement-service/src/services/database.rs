//! Database service for statement-service.

use crate::models::{
    ConnectionStatus, Job, JobItem, JobStatus, NewStatementTransaction, Statement,
    StatementStatus, SyncConnection, Transaction, TransactionSource, VerificationStatus,
    job_progress,
};
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const STATEMENT_COLUMNS: &str = "statement_id, owner_id, file_name, content_hash, storage_key, \
     size_bytes, status, verification_status, bank_name, account_number_masked, period_start, \
     period_end, opening_balance, closing_balance, total_deposits, total_withdrawals, \
     discrepancy_amount, error_message, created_utc, updated_utc";

const TRANSACTION_COLUMNS: &str = "transaction_id, owner_id, statement_id, txn_date, description, \
     amount, running_balance, category, source, is_provisional, external_id, created_utc";

const JOB_COLUMNS: &str =
    "job_id, owner_id, status, total_items, completed_items, progress, error_message, \
     created_utc, updated_utc";

const JOB_ITEM_COLUMNS: &str = "job_item_id, job_id, statement_id, file_name, status, \
     error_message, started_utc, completed_utc";

const CONNECTION_COLUMNS: &str = "connection_id, owner_id, provider_item_id, cursor, \
     last_synced_utc, status, error_message, created_utc, updated_utc";

/// Result fields persisted when statement processing completes.
#[derive(Debug, Clone)]
pub struct StatementCompletion {
    pub bank_name: Option<String>,
    pub account_number_masked: Option<String>,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub opening_balance: Option<Decimal>,
    pub closing_balance: Option<Decimal>,
    pub total_deposits: Decimal,
    pub total_withdrawals: Decimal,
    pub discrepancy_amount: Option<Decimal>,
    /// None preserves the existing verification status (human_verified).
    pub verification_status: Option<VerificationStatus>,
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "statement-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // =========================================================================
    // Statement Operations
    // =========================================================================

    /// Look up a statement id by content hash. This is the dedup check and
    /// runs before any storage write.
    #[instrument(skip(self, content_hash), fields(owner_id = %owner_id))]
    pub async fn find_statement_by_hash(
        &self,
        owner_id: &str,
        content_hash: &str,
    ) -> Result<Option<Uuid>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_statement_by_hash"])
            .start_timer();

        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT statement_id FROM statements WHERE owner_id = $1 AND content_hash = $2",
        )
        .bind(owner_id)
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to check content hash: {}", e))
        })?;

        timer.observe_duration();
        Ok(row.map(|(id,)| id))
    }

    #[instrument(skip(self, content_hash, storage_key), fields(owner_id = %owner_id, file_name = %file_name))]
    pub async fn create_statement(
        &self,
        owner_id: &str,
        file_name: &str,
        content_hash: &str,
        storage_key: &str,
        size_bytes: i64,
    ) -> Result<Statement, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_statement"])
            .start_timer();

        let statement = sqlx::query_as::<_, Statement>(&format!(
            "INSERT INTO statements (statement_id, owner_id, file_name, content_hash, storage_key, size_bytes, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {STATEMENT_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(owner_id)
        .bind(file_name)
        .bind(content_hash)
        .bind(storage_key)
        .bind(size_bytes)
        .bind(StatementStatus::Pending.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            // Two concurrent uploads of the same bytes race past the
            // pre-insert hash check; the unique constraint settles it.
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!("Duplicate file: already uploaded"))
            }
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to create statement: {}", e)),
        })?;

        timer.observe_duration();
        info!(statement_id = %statement.statement_id, "Statement created");

        Ok(statement)
    }

    #[instrument(skip(self), fields(owner_id = %owner_id, statement_id = %statement_id))]
    pub async fn get_statement(
        &self,
        owner_id: &str,
        statement_id: Uuid,
    ) -> Result<Option<Statement>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_statement"])
            .start_timer();

        let statement = sqlx::query_as::<_, Statement>(&format!(
            "SELECT {STATEMENT_COLUMNS} FROM statements WHERE owner_id = $1 AND statement_id = $2"
        ))
        .bind(owner_id)
        .bind(statement_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get statement: {}", e)))?;

        timer.observe_duration();
        Ok(statement)
    }

    #[instrument(skip(self), fields(owner_id = %owner_id))]
    pub async fn list_statements(
        &self,
        owner_id: &str,
        page_size: i32,
        page_token: Option<Uuid>,
    ) -> Result<(Vec<Statement>, Option<String>), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_statements"])
            .start_timer();

        let limit = page_size.clamp(1, 100) as i64;

        let statements = if let Some(cursor) = page_token {
            sqlx::query_as::<_, Statement>(&format!(
                "SELECT {STATEMENT_COLUMNS} FROM statements
                 WHERE owner_id = $1 AND statement_id > $2
                 ORDER BY statement_id
                 LIMIT $3"
            ))
            .bind(owner_id)
            .bind(cursor)
            .bind(limit + 1)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, Statement>(&format!(
                "SELECT {STATEMENT_COLUMNS} FROM statements
                 WHERE owner_id = $1
                 ORDER BY statement_id
                 LIMIT $2"
            ))
            .bind(owner_id)
            .bind(limit + 1)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list statements: {}", e)))?;

        timer.observe_duration();

        let (statements, next_token) = paginate(statements, limit, |s| s.statement_id.to_string());
        Ok((statements, next_token))
    }

    /// Claim a statement for processing with an optimistic status guard.
    /// Returns `None` when another processor holds the claim.
    #[instrument(skip(self), fields(owner_id = %owner_id, statement_id = %statement_id))]
    pub async fn claim_statement(
        &self,
        owner_id: &str,
        statement_id: Uuid,
    ) -> Result<Option<Statement>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["claim_statement"])
            .start_timer();

        let statement = sqlx::query_as::<_, Statement>(&format!(
            "UPDATE statements
             SET status = $3, error_message = NULL, updated_utc = NOW()
             WHERE owner_id = $1 AND statement_id = $2 AND status <> $3
             RETURNING {STATEMENT_COLUMNS}"
        ))
        .bind(owner_id)
        .bind(statement_id)
        .bind(StatementStatus::Processing.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to claim statement: {}", e)))?;

        timer.observe_duration();
        Ok(statement)
    }

    /// Record a processing failure on the statement.
    #[instrument(skip(self, message), fields(statement_id = %statement_id))]
    pub async fn mark_statement_error(
        &self,
        statement_id: Uuid,
        message: &str,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_statement_error"])
            .start_timer();

        sqlx::query(
            "UPDATE statements SET status = $2, error_message = $3, updated_utc = NOW()
             WHERE statement_id = $1",
        )
        .bind(statement_id)
        .bind(StatementStatus::Error.as_str())
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to mark statement error: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }

    /// Atomically replace a statement's derived transactions and persist its
    /// extraction/verification results. One transaction keeps reprocessing
    /// idempotent: a crash leaves either the old rows or the new rows, never
    /// a mix.
    #[instrument(skip(self, completion, transactions), fields(statement_id = %statement_id, count = transactions.len()))]
    pub async fn complete_statement_processing(
        &self,
        owner_id: &str,
        statement_id: Uuid,
        completion: &StatementCompletion,
        transactions: &[NewStatementTransaction],
    ) -> Result<i64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["complete_statement_processing"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        sqlx::query("DELETE FROM transactions WHERE statement_id = $1")
            .bind(statement_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to delete prior transactions: {}",
                    e
                ))
            })?;

        let mut inserted: i64 = 0;
        for txn in transactions {
            sqlx::query(
                "INSERT INTO transactions (transaction_id, owner_id, statement_id, txn_date, description, amount, running_balance, category, source, is_provisional)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE)",
            )
            .bind(Uuid::new_v4())
            .bind(owner_id)
            .bind(statement_id)
            .bind(txn.txn_date)
            .bind(&txn.description)
            .bind(txn.amount)
            .bind(txn.running_balance)
            .bind(&txn.category)
            .bind(TransactionSource::Statement.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to insert transaction: {}", e))
            })?;
            inserted += 1;
        }

        sqlx::query(
            "UPDATE statements
             SET status = $2,
                 bank_name = $3,
                 account_number_masked = $4,
                 period_start = $5,
                 period_end = $6,
                 opening_balance = $7,
                 closing_balance = $8,
                 total_deposits = $9,
                 total_withdrawals = $10,
                 discrepancy_amount = $11,
                 verification_status = COALESCE($12, verification_status),
                 error_message = NULL,
                 updated_utc = NOW()
             WHERE statement_id = $1",
        )
        .bind(statement_id)
        .bind(StatementStatus::Done.as_str())
        .bind(&completion.bank_name)
        .bind(&completion.account_number_masked)
        .bind(completion.period_start)
        .bind(completion.period_end)
        .bind(completion.opening_balance)
        .bind(completion.closing_balance)
        .bind(completion.total_deposits)
        .bind(completion.total_withdrawals)
        .bind(completion.discrepancy_amount)
        .bind(completion.verification_status.map(|v| v.as_str()))
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to finalize statement: {}", e))
        })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit processing result: {}", e))
        })?;

        timer.observe_duration();
        info!(statement_id = %statement_id, inserted = inserted, "Statement processing persisted");

        Ok(inserted)
    }

    /// Owner override of the verification outcome. Only `done` statements
    /// can be overridden; the processor never reverts `human_verified`.
    #[instrument(skip(self), fields(owner_id = %owner_id, statement_id = %statement_id))]
    pub async fn override_verification(
        &self,
        owner_id: &str,
        statement_id: Uuid,
    ) -> Result<Option<Statement>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["override_verification"])
            .start_timer();

        let statement = sqlx::query_as::<_, Statement>(&format!(
            "UPDATE statements
             SET verification_status = $3, updated_utc = NOW()
             WHERE owner_id = $1 AND statement_id = $2 AND status = 'done'
             RETURNING {STATEMENT_COLUMNS}"
        ))
        .bind(owner_id)
        .bind(statement_id)
        .bind(VerificationStatus::HumanVerified.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to override verification: {}", e))
        })?;

        timer.observe_duration();
        Ok(statement)
    }

    /// Force statements stranded in `processing` back to `pending`.
    #[instrument(skip(self), fields(owner_id = %owner_id))]
    pub async fn reset_stuck_statements(&self, owner_id: &str) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["reset_stuck_statements"])
            .start_timer();

        let result = sqlx::query(
            "UPDATE statements SET status = $2, updated_utc = NOW()
             WHERE owner_id = $1 AND status = $3",
        )
        .bind(owner_id)
        .bind(StatementStatus::Pending.as_str())
        .bind(StatementStatus::Processing.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to reset stuck statements: {}", e))
        })?;

        timer.observe_duration();
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Transaction Operations
    // =========================================================================

    /// Upsert a sync-sourced transaction keyed by the provider's stable id.
    #[instrument(skip(self, description, category), fields(owner_id = %owner_id, external_id = %external_id))]
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_sync_transaction(
        &self,
        owner_id: &str,
        external_id: &str,
        txn_date: NaiveDate,
        description: &str,
        amount: Decimal,
        category: Option<&str>,
        is_provisional: bool,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_sync_transaction"])
            .start_timer();

        sqlx::query(
            "INSERT INTO transactions (transaction_id, owner_id, txn_date, description, amount, category, source, is_provisional, external_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (owner_id, source, external_id) DO UPDATE
             SET txn_date = EXCLUDED.txn_date,
                 description = EXCLUDED.description,
                 amount = EXCLUDED.amount,
                 category = EXCLUDED.category,
                 is_provisional = EXCLUDED.is_provisional",
        )
        .bind(Uuid::new_v4())
        .bind(owner_id)
        .bind(txn_date)
        .bind(description)
        .bind(amount)
        .bind(category)
        .bind(TransactionSource::Sync.as_str())
        .bind(is_provisional)
        .bind(external_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to upsert sync transaction: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }

    /// Hard-delete sync transactions the provider retracted.
    #[instrument(skip(self, external_ids), fields(owner_id = %owner_id, count = external_ids.len()))]
    pub async fn delete_sync_transactions(
        &self,
        owner_id: &str,
        external_ids: &[String],
    ) -> Result<u64, AppError> {
        if external_ids.is_empty() {
            return Ok(0);
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_sync_transactions"])
            .start_timer();

        let result = sqlx::query(
            "DELETE FROM transactions
             WHERE owner_id = $1 AND source = $2 AND external_id = ANY($3)",
        )
        .bind(owner_id)
        .bind(TransactionSource::Sync.as_str())
        .bind(external_ids)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to delete sync transactions: {}", e))
        })?;

        timer.observe_duration();
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(owner_id = %owner_id))]
    pub async fn provisional_sync_in_range(
        &self,
        owner_id: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Vec<Transaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["provisional_sync_in_range"])
            .start_timer();

        let transactions = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions
             WHERE owner_id = $1 AND source = $2 AND is_provisional = TRUE
               AND txn_date BETWEEN $3 AND $4
             ORDER BY txn_date, transaction_id"
        ))
        .bind(owner_id)
        .bind(TransactionSource::Sync.as_str())
        .bind(period_start)
        .bind(period_end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Failed to load provisional transactions: {}",
                e
            ))
        })?;

        timer.observe_duration();
        Ok(transactions)
    }

    #[instrument(skip(self), fields(owner_id = %owner_id))]
    pub async fn statement_transactions_in_range(
        &self,
        owner_id: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Vec<Transaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["statement_transactions_in_range"])
            .start_timer();

        let transactions = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions
             WHERE owner_id = $1 AND source = $2 AND txn_date BETWEEN $3 AND $4
             ORDER BY txn_date, transaction_id"
        ))
        .bind(owner_id)
        .bind(TransactionSource::Statement.as_str())
        .bind(period_start)
        .bind(period_end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Failed to load statement transactions: {}",
                e
            ))
        })?;

        timer.observe_duration();
        Ok(transactions)
    }

    /// Delete provisional rows superseded by statement data.
    #[instrument(skip(self, transaction_ids), fields(count = transaction_ids.len()))]
    pub async fn delete_transactions(&self, transaction_ids: &[Uuid]) -> Result<u64, AppError> {
        if transaction_ids.is_empty() {
            return Ok(0);
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_transactions"])
            .start_timer();

        let result = sqlx::query("DELETE FROM transactions WHERE transaction_id = ANY($1)")
            .bind(transaction_ids)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to delete transactions: {}", e))
            })?;

        timer.observe_duration();
        Ok(result.rows_affected())
    }

    /// Flip every remaining provisional row in a statement-covered period to
    /// corroborated.
    #[instrument(skip(self), fields(owner_id = %owner_id))]
    pub async fn confirm_provisional_in_range(
        &self,
        owner_id: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["confirm_provisional_in_range"])
            .start_timer();

        let result = sqlx::query(
            "UPDATE transactions SET is_provisional = FALSE
             WHERE owner_id = $1 AND source = $2 AND is_provisional = TRUE
               AND txn_date BETWEEN $3 AND $4",
        )
        .bind(owner_id)
        .bind(TransactionSource::Sync.as_str())
        .bind(period_start)
        .bind(period_end)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Failed to confirm provisional transactions: {}",
                e
            ))
        })?;

        timer.observe_duration();
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Job Operations
    // =========================================================================

    /// Create a job and its items in one transaction, all pending.
    #[instrument(skip(self, items), fields(owner_id = %owner_id, count = items.len()))]
    pub async fn create_job(
        &self,
        owner_id: &str,
        items: &[(Uuid, String)],
    ) -> Result<(Job, Vec<JobItem>), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_job"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let job = sqlx::query_as::<_, Job>(&format!(
            "INSERT INTO jobs (job_id, owner_id, status, total_items)
             VALUES ($1, $2, $3, $4)
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(owner_id)
        .bind(JobStatus::Pending.as_str())
        .bind(items.len() as i32)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create job: {}", e)))?;

        let mut job_items = Vec::with_capacity(items.len());
        for (statement_id, file_name) in items {
            let item = sqlx::query_as::<_, JobItem>(&format!(
                "INSERT INTO job_items (job_item_id, job_id, statement_id, file_name, status)
                 VALUES ($1, $2, $3, $4, $5)
                 RETURNING {JOB_ITEM_COLUMNS}"
            ))
            .bind(Uuid::new_v4())
            .bind(job.job_id)
            .bind(statement_id)
            .bind(file_name)
            .bind(JobStatus::Pending.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to create job item: {}", e))
            })?;
            job_items.push(item);
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit job creation: {}", e))
        })?;

        timer.observe_duration();
        info!(job_id = %job.job_id, total_items = job.total_items, "Job created");

        Ok((job, job_items))
    }

    #[instrument(skip(self), fields(owner_id = %owner_id, job_id = %job_id))]
    pub async fn get_job(&self, owner_id: &str, job_id: Uuid) -> Result<Option<Job>, AppError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["get_job"]).start_timer();

        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE owner_id = $1 AND job_id = $2"
        ))
        .bind(owner_id)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get job: {}", e)))?;

        timer.observe_duration();
        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn get_job_items(&self, job_id: Uuid) -> Result<Vec<JobItem>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_job_items"])
            .start_timer();

        let items = sqlx::query_as::<_, JobItem>(&format!(
            "SELECT {JOB_ITEM_COLUMNS} FROM job_items WHERE job_id = $1 ORDER BY job_item_id"
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get job items: {}", e)))?;

        timer.observe_duration();
        Ok(items)
    }

    #[instrument(skip(self), fields(owner_id = %owner_id))]
    pub async fn list_jobs(
        &self,
        owner_id: &str,
        page_size: i32,
        page_token: Option<Uuid>,
    ) -> Result<(Vec<Job>, Option<String>), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_jobs"])
            .start_timer();

        let limit = page_size.clamp(1, 100) as i64;

        let jobs = if let Some(cursor) = page_token {
            sqlx::query_as::<_, Job>(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE owner_id = $1 AND job_id > $2
                 ORDER BY job_id
                 LIMIT $3"
            ))
            .bind(owner_id)
            .bind(cursor)
            .bind(limit + 1)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, Job>(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE owner_id = $1
                 ORDER BY job_id
                 LIMIT $2"
            ))
            .bind(owner_id)
            .bind(limit + 1)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list jobs: {}", e)))?;

        timer.observe_duration();

        let (jobs, next_token) = paginate(jobs, limit, |j| j.job_id.to_string());
        Ok((jobs, next_token))
    }

    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn mark_job_running(&self, job_id: Uuid) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_job_running"])
            .start_timer();

        sqlx::query(
            "UPDATE jobs SET status = $2, updated_utc = NOW() WHERE job_id = $1 AND status = $3",
        )
        .bind(job_id)
        .bind(JobStatus::Running.as_str())
        .bind(JobStatus::Pending.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to mark job running: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(job_item_id = %job_item_id))]
    pub async fn mark_item_running(&self, job_item_id: Uuid) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_item_running"])
            .start_timer();

        sqlx::query(
            "UPDATE job_items SET status = $2, started_utc = NOW() WHERE job_item_id = $1",
        )
        .bind(job_item_id)
        .bind(JobStatus::Running.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to mark item running: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, error), fields(job_item_id = %job_item_id))]
    pub async fn mark_item_finished(
        &self,
        job_item_id: Uuid,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_item_finished"])
            .start_timer();

        sqlx::query(
            "UPDATE job_items SET status = $2, error_message = $3, completed_utc = NOW()
             WHERE job_item_id = $1",
        )
        .bind(job_item_id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to mark item finished: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }

    /// Persist progress after each item so pollers observe live movement.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn update_job_progress(
        &self,
        job_id: Uuid,
        completed_items: i32,
        total_items: i32,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_job_progress"])
            .start_timer();

        sqlx::query(
            "UPDATE jobs SET completed_items = $2, progress = $3, updated_utc = NOW()
             WHERE job_id = $1",
        )
        .bind(job_id)
        .bind(completed_items)
        .bind(job_progress(completed_items, total_items))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update job progress: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, error), fields(job_id = %job_id))]
    pub async fn finalize_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["finalize_job"])
            .start_timer();

        sqlx::query(
            "UPDATE jobs SET status = $2, error_message = $3, updated_utc = NOW()
             WHERE job_id = $1",
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to finalize job: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Force jobs and items stranded in a non-terminal state to `failed`
    /// with a sentinel message. Returns (jobs, items) counts.
    #[instrument(skip(self), fields(owner_id = %owner_id))]
    pub async fn reset_stuck_jobs(
        &self,
        owner_id: &str,
        sentinel: &str,
    ) -> Result<(u64, u64), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["reset_stuck_jobs"])
            .start_timer();

        let items = sqlx::query(
            "UPDATE job_items SET status = $2, error_message = $3, completed_utc = NOW()
             WHERE status IN ($4, $5)
               AND job_id IN (SELECT job_id FROM jobs WHERE owner_id = $1)",
        )
        .bind(owner_id)
        .bind(JobStatus::Failed.as_str())
        .bind(sentinel)
        .bind(JobStatus::Pending.as_str())
        .bind(JobStatus::Running.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to reset stuck job items: {}", e))
        })?;

        let jobs = sqlx::query(
            "UPDATE jobs SET status = $2, error_message = $3, updated_utc = NOW()
             WHERE owner_id = $1 AND status IN ($4, $5)",
        )
        .bind(owner_id)
        .bind(JobStatus::Failed.as_str())
        .bind(sentinel)
        .bind(JobStatus::Pending.as_str())
        .bind(JobStatus::Running.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to reset stuck jobs: {}", e))
        })?;

        timer.observe_duration();
        Ok((jobs.rows_affected(), items.rows_affected()))
    }

    // =========================================================================
    // Sync Connection Operations
    // =========================================================================

    #[instrument(skip(self), fields(owner_id = %owner_id, provider_item_id = %provider_item_id))]
    pub async fn create_connection(
        &self,
        owner_id: &str,
        provider_item_id: &str,
    ) -> Result<SyncConnection, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_connection"])
            .start_timer();

        let connection = sqlx::query_as::<_, SyncConnection>(&format!(
            "INSERT INTO sync_connections (connection_id, owner_id, provider_item_id, status)
             VALUES ($1, $2, $3, $4)
             RETURNING {CONNECTION_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(owner_id)
        .bind(provider_item_id)
        .bind(ConnectionStatus::Active.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!("Connection already registered for this item"))
            }
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to create connection: {}", e)),
        })?;

        timer.observe_duration();
        info!(connection_id = %connection.connection_id, "Sync connection created");

        Ok(connection)
    }

    #[instrument(skip(self), fields(owner_id = %owner_id, connection_id = %connection_id))]
    pub async fn get_connection(
        &self,
        owner_id: &str,
        connection_id: Uuid,
    ) -> Result<Option<SyncConnection>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_connection"])
            .start_timer();

        let connection = sqlx::query_as::<_, SyncConnection>(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM sync_connections
             WHERE owner_id = $1 AND connection_id = $2"
        ))
        .bind(owner_id)
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get connection: {}", e)))?;

        timer.observe_duration();
        Ok(connection)
    }

    /// Webhook lookup; the provider only knows its own item id.
    #[instrument(skip(self), fields(provider_item_id = %provider_item_id))]
    pub async fn find_connection_by_item(
        &self,
        provider_item_id: &str,
    ) -> Result<Option<SyncConnection>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_connection_by_item"])
            .start_timer();

        let connection = sqlx::query_as::<_, SyncConnection>(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM sync_connections WHERE provider_item_id = $1"
        ))
        .bind(provider_item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to find connection by item: {}", e))
        })?;

        timer.observe_duration();
        Ok(connection)
    }

    /// Persist the cursor only after a full sync loop completed; a crash
    /// mid-loop re-fetches from the previous cursor on the next attempt.
    #[instrument(skip(self, cursor), fields(connection_id = %connection_id))]
    pub async fn persist_cursor(&self, connection_id: Uuid, cursor: &str) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["persist_cursor"])
            .start_timer();

        sqlx::query(
            "UPDATE sync_connections
             SET cursor = $2, last_synced_utc = NOW(), status = $3, error_message = NULL,
                 updated_utc = NOW()
             WHERE connection_id = $1",
        )
        .bind(connection_id)
        .bind(cursor)
        .bind(ConnectionStatus::Active.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to persist cursor: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, message), fields(connection_id = %connection_id))]
    pub async fn mark_connection_error(
        &self,
        connection_id: Uuid,
        message: &str,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_connection_error"])
            .start_timer();

        sqlx::query(
            "UPDATE sync_connections SET status = $2, error_message = $3, updated_utc = NOW()
             WHERE connection_id = $1",
        )
        .bind(connection_id)
        .bind(ConnectionStatus::Error.as_str())
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to mark connection error: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }
}

/// Drop the probe row fetched with `limit + 1` and derive the next page token.
fn paginate<T>(mut rows: Vec<T>, limit: i64, token: impl Fn(&T) -> String) -> (Vec<T>, Option<String>) {
    let has_more = rows.len() > limit as usize;
    if has_more {
        rows.pop();
    }
    let next_token = if has_more {
        rows.last().map(token)
    } else {
        None
    };
    (rows, next_token)
}

#[cfg(test)]
mod tests {
    use super::paginate;

    #[test]
    fn paginate_returns_token_only_when_more_rows_exist() {
        let rows = vec![1, 2, 3, 4];
        let (page, next) = paginate(rows, 3, |n| n.to_string());
        assert_eq!(page, vec![1, 2, 3]);
        assert_eq!(next.as_deref(), Some("3"));

        let rows = vec![1, 2, 3];
        let (page, next) = paginate(rows, 3, |n| n.to_string());
        assert_eq!(page, vec![1, 2, 3]);
        assert_eq!(next, None);
    }

    #[test]
    fn paginate_handles_empty_result() {
        let rows: Vec<i32> = Vec::new();
        let (page, next) = paginate(rows, 10, |n| n.to_string());
        assert!(page.is_empty());
        assert_eq!(next, None);
    }
}
