//! Statement processing: extraction, normalization, and balance verification.

use crate::models::{NewStatementTransaction, Statement, VerificationStatus};
use crate::reconcile::Reconciler;
use crate::services::database::{Database, StatementCompletion};
use crate::services::extraction::{Direction, ExtractedStatement, Extractor};
use crate::services::ledger::LedgerHook;
use crate::services::metrics::{PROCESSING_DURATION, PROCESSING_OUTCOMES};
use crate::services::storage::Storage;
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Normalized extraction output with ledger-signed amounts and totals.
#[derive(Debug)]
pub struct NormalizedStatement {
    pub transactions: Vec<NewStatementTransaction>,
    pub total_deposits: Decimal,
    pub total_withdrawals: Decimal,
}

/// Apply the ledger sign convention (credits positive, debits negative)
/// and accumulate category totals. Extraction reports magnitudes; the
/// direction field carries the sign.
pub fn normalize_transactions(extracted: &ExtractedStatement) -> NormalizedStatement {
    let mut transactions = Vec::with_capacity(extracted.transactions.len());
    let mut total_deposits = Decimal::ZERO;
    let mut total_withdrawals = Decimal::ZERO;

    for txn in &extracted.transactions {
        let magnitude = txn.amount.abs();
        let amount = match txn.direction {
            Direction::Credit => {
                total_deposits += magnitude;
                magnitude
            }
            Direction::Debit => {
                total_withdrawals += magnitude;
                -magnitude
            }
        };
        transactions.push(NewStatementTransaction {
            txn_date: txn.date,
            description: txn.description.clone(),
            amount,
            running_balance: txn.running_balance,
            category: txn.category.clone(),
        });
    }

    NormalizedStatement {
        transactions,
        total_deposits,
        total_withdrawals,
    }
}

/// Verify the reported closing balance against the recomputed one:
/// `opening + deposits - withdrawals`. The stored discrepancy keeps its
/// sign (calculated minus reported). Missing balances cannot be verified
/// and report unbalanced with no discrepancy figure.
pub fn verify_balance(
    opening: Option<Decimal>,
    closing: Option<Decimal>,
    total_deposits: Decimal,
    total_withdrawals: Decimal,
    epsilon: Decimal,
) -> (VerificationStatus, Option<Decimal>) {
    let (Some(opening), Some(closing)) = (opening, closing) else {
        return (VerificationStatus::Unbalanced, None);
    };

    let calculated = opening + total_deposits - total_withdrawals;
    let discrepancy = calculated - closing;
    if discrepancy.abs() < epsilon {
        (VerificationStatus::Verified, Some(discrepancy))
    } else {
        (VerificationStatus::Unbalanced, Some(discrepancy))
    }
}

/// Result of one processing run.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProcessOutcome {
    pub statement_id: Uuid,
    pub transaction_count: i64,
    pub is_balanced: bool,
}

pub struct StatementProcessor {
    db: Database,
    storage: Arc<dyn Storage>,
    extractor: Arc<dyn Extractor>,
    reconciler: Reconciler,
    ledger: LedgerHook,
    balance_epsilon: Decimal,
}

impl StatementProcessor {
    pub fn new(
        db: Database,
        storage: Arc<dyn Storage>,
        extractor: Arc<dyn Extractor>,
        reconciler: Reconciler,
        ledger: LedgerHook,
        balance_epsilon: Decimal,
    ) -> Self {
        Self {
            db,
            storage,
            extractor,
            reconciler,
            ledger,
            balance_epsilon,
        }
    }

    /// Process one statement end to end.
    ///
    /// Reprocessing a `done` statement runs the same path; the final write
    /// replaces prior derived transactions atomically, so the operation is
    /// idempotent apart from fresh row ids. A statement already claimed by
    /// another processor yields `Conflict`.
    #[instrument(skip(self), fields(owner_id = %owner_id, statement_id = %statement_id))]
    pub async fn process(
        &self,
        owner_id: &str,
        statement_id: Uuid,
    ) -> Result<ProcessOutcome, AppError> {
        let started = Instant::now();

        let claimed = match self.db.claim_statement(owner_id, statement_id).await? {
            Some(statement) => statement,
            // A failed claim is ambiguous: the statement may not exist at
            // all, or another processor may hold it right now.
            None => {
                return match self.db.get_statement(owner_id, statement_id).await? {
                    Some(_) => Err(AppError::Conflict(anyhow::anyhow!(
                        "Statement is not available for processing"
                    ))),
                    None => Err(AppError::NotFound(anyhow::anyhow!("Statement not found"))),
                };
            }
        };

        match self.run(owner_id, &claimed).await {
            Ok(outcome) => {
                let label = if outcome.is_balanced {
                    "verified"
                } else {
                    "unbalanced"
                };
                PROCESSING_OUTCOMES.with_label_values(&[label]).inc();
                PROCESSING_DURATION
                    .with_label_values(&[label])
                    .observe(started.elapsed().as_secs_f64());
                Ok(outcome)
            }
            Err(e) => {
                self.db
                    .mark_statement_error(statement_id, &e.to_string())
                    .await?;
                PROCESSING_OUTCOMES.with_label_values(&["error"]).inc();
                PROCESSING_DURATION
                    .with_label_values(&["error"])
                    .observe(started.elapsed().as_secs_f64());
                Err(e)
            }
        }
    }

    async fn run(&self, owner_id: &str, claimed: &Statement) -> Result<ProcessOutcome, AppError> {
        let bytes = self.storage.download(&claimed.storage_key).await?;
        let text = String::from_utf8_lossy(&bytes).into_owned();

        let extracted = self.extractor.extract(&text).await?;
        if extracted.is_unusable() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "No statement data could be extracted from '{}'",
                claimed.file_name
            )));
        }

        let normalized = normalize_transactions(&extracted);
        let (verification, discrepancy) = verify_balance(
            extracted.opening_balance,
            extracted.closing_balance,
            normalized.total_deposits,
            normalized.total_withdrawals,
            self.balance_epsilon,
        );

        let is_balanced = verification == VerificationStatus::Verified;

        // An owner's manual confirmation outlives reprocessing; only the
        // machine-derived statuses get overwritten.
        let verification = if claimed.is_human_verified() {
            None
        } else {
            Some(verification)
        };

        let completion = StatementCompletion {
            bank_name: extracted.bank_name.clone(),
            account_number_masked: extracted.account_number_masked.clone(),
            period_start: extracted.period_start,
            period_end: extracted.period_end,
            opening_balance: extracted.opening_balance,
            closing_balance: extracted.closing_balance,
            total_deposits: normalized.total_deposits,
            total_withdrawals: normalized.total_withdrawals,
            discrepancy_amount: discrepancy,
            verification_status: verification,
        };

        let inserted = self
            .db
            .complete_statement_processing(
                owner_id,
                claimed.statement_id,
                &completion,
                &normalized.transactions,
            )
            .await?;

        info!(
            statement_id = %claimed.statement_id,
            transactions = inserted,
            is_balanced = is_balanced,
            verification = completion
                .verification_status
                .map(|v| v.as_str())
                .unwrap_or("human_verified"),
            "Statement processed"
        );

        if let (Some(start), Some(end)) = (extracted.period_start, extracted.period_end) {
            if let Err(e) = self.reconciler.reconcile_period(owner_id, start, end).await {
                // Statement data is already durable; reconciliation can run
                // again on the next sync.
                warn!(error = %e, "Reconciliation after processing failed");
            }
        }

        self.ledger.notify_recalculation(owner_id);

        Ok(ProcessOutcome {
            statement_id: claimed.statement_id,
            transaction_count: inserted,
            is_balanced,
        })
    }
}
