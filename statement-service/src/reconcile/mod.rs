//! Sync pull and reconciliation against statement data.
//!
//! Two responsibilities live here: pulling incremental transaction deltas
//! from the sync provider (cursor-based, resumable), and reconciling
//! provisional sync rows against the exact transactions a processed
//! statement produced for the same period.

use crate::models::Transaction;
use crate::services::database::Database;
use crate::services::metrics::{RECONCILIATION_RESULTS, SYNC_APPLIED};
use crate::services::sync_provider::{ProviderTransaction, SyncProvider};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Providers report outflows as positive amounts; the ledger stores
/// outflows as negative. Applied exactly once, at ingress.
pub fn invert_provider_amount(amount: Decimal) -> Decimal {
    -amount
}

/// Lowercase, strip punctuation, collapse runs of whitespace.
pub fn normalize_description(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;
    for ch in raw.chars() {
        if ch.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_space = true;
        }
    }
    out
}

fn descriptions_match(a: &str, b: &str) -> bool {
    let a = normalize_description(a);
    let b = normalize_description(b);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a == b || a.contains(&b) || b.contains(&a)
}

fn amounts_match(a: Decimal, b: Decimal, epsilon: Decimal) -> bool {
    (a - b).abs() <= epsilon
}

/// Pair provisional sync rows with statement rows: same date, amount within
/// epsilon, and fuzzy description agreement. Each statement row is consumed
/// by at most one provisional row. Returns the matched provisional ids.
pub fn plan_matches(
    provisional: &[Transaction],
    statement_txns: &[Transaction],
    amount_epsilon: Decimal,
) -> Vec<Uuid> {
    let mut consumed = vec![false; statement_txns.len()];
    let mut matched = Vec::new();

    for prov in provisional {
        let hit = statement_txns.iter().enumerate().find(|(i, stmt)| {
            !consumed[*i]
                && stmt.txn_date == prov.txn_date
                && amounts_match(stmt.amount, prov.amount, amount_epsilon)
                && descriptions_match(&stmt.description, &prov.description)
        });
        if let Some((i, _)) = hit {
            consumed[i] = true;
            matched.push(prov.transaction_id);
        }
    }

    matched
}

/// Outcome counts from reconciling one statement period.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReconcileSummary {
    /// Provisional rows superseded by an exact statement row and deleted.
    pub matched: u64,
    /// Provisional rows in the period with no statement counterpart,
    /// now treated as corroborated.
    pub confirmed: u64,
}

#[derive(Clone)]
pub struct Reconciler {
    db: Database,
    amount_epsilon: Decimal,
}

impl Reconciler {
    pub fn new(db: Database, amount_epsilon: Decimal) -> Self {
        Self { db, amount_epsilon }
    }

    /// Reconcile every provisional sync row inside a statement-covered
    /// period against the statement's own transactions.
    #[instrument(skip(self), fields(owner_id = %owner_id))]
    pub async fn reconcile_period(
        &self,
        owner_id: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<ReconcileSummary, AppError> {
        let provisional = self
            .db
            .provisional_sync_in_range(owner_id, period_start, period_end)
            .await?;

        if provisional.is_empty() {
            return Ok(ReconcileSummary::default());
        }

        let statement_txns = self
            .db
            .statement_transactions_in_range(owner_id, period_start, period_end)
            .await?;

        let matched_ids = plan_matches(&provisional, &statement_txns, self.amount_epsilon);
        let matched = self.db.delete_transactions(&matched_ids).await?;

        // The statement is authoritative for its period; whatever the
        // provider reported there that the statement did not contradict
        // stops being provisional.
        let confirmed = self
            .db
            .confirm_provisional_in_range(owner_id, period_start, period_end)
            .await?;

        RECONCILIATION_RESULTS
            .with_label_values(&["matched"])
            .inc_by(matched as f64);
        RECONCILIATION_RESULTS
            .with_label_values(&["confirmed"])
            .inc_by(confirmed as f64);

        info!(matched, confirmed, "Reconciliation completed for period");

        Ok(ReconcileSummary { matched, confirmed })
    }
}

/// Counts of provider deltas applied during one sync run.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SyncSummary {
    pub added: u64,
    pub modified: u64,
    pub removed: u64,
}

pub struct SyncEngine {
    db: Database,
    provider: Arc<dyn SyncProvider>,
}

impl SyncEngine {
    pub fn new(db: Database, provider: Arc<dyn SyncProvider>) -> Self {
        Self { db, provider }
    }

    /// Pull all outstanding deltas for a connection and apply them.
    ///
    /// Pages are accumulated until the provider reports no more, then
    /// applied, then the final cursor is persisted. A crash before the
    /// cursor write means the next run re-fetches the same deltas; the
    /// upsert and delete operations make that harmless.
    #[instrument(skip(self), fields(owner_id = %owner_id, connection_id = %connection_id))]
    pub async fn sync_connection(
        &self,
        owner_id: &str,
        connection_id: Uuid,
    ) -> Result<SyncSummary, AppError> {
        let connection = self
            .db
            .get_connection(owner_id, connection_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Sync connection not found")))?;

        let mut cursor = connection.cursor.clone();
        let mut added: Vec<ProviderTransaction> = Vec::new();
        let mut modified: Vec<ProviderTransaction> = Vec::new();
        let mut removed: Vec<String> = Vec::new();

        loop {
            let page = match self
                .provider
                .transactions_sync(&connection.provider_item_id, cursor.as_deref())
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    self.db
                        .mark_connection_error(connection_id, &e.to_string())
                        .await?;
                    return Err(e);
                }
            };

            added.extend(page.added);
            modified.extend(page.modified);
            removed.extend(page.removed);
            cursor = Some(page.next_cursor);

            if !page.has_more {
                break;
            }
        }

        let summary = SyncSummary {
            added: added.len() as u64,
            modified: modified.len() as u64,
            removed: removed.len() as u64,
        };

        // Apply-phase failures mark the connection the same way provider
        // failures do, so a half-applied run is visible on the connection.
        let deleted = match self
            .apply_delta(owner_id, connection_id, &added, &modified, &removed, cursor.as_deref())
            .await
        {
            Ok(deleted) => deleted,
            Err(e) => {
                self.db
                    .mark_connection_error(connection_id, &e.to_string())
                    .await?;
                return Err(e);
            }
        };

        SYNC_APPLIED
            .with_label_values(&["added"])
            .inc_by(summary.added as f64);
        SYNC_APPLIED
            .with_label_values(&["modified"])
            .inc_by(summary.modified as f64);
        SYNC_APPLIED.with_label_values(&["removed"]).inc_by(deleted as f64);

        info!(
            added = summary.added,
            modified = summary.modified,
            removed = summary.removed,
            "Sync run applied"
        );

        Ok(summary)
    }

    async fn apply_delta(
        &self,
        owner_id: &str,
        connection_id: Uuid,
        added: &[ProviderTransaction],
        modified: &[ProviderTransaction],
        removed: &[String],
        cursor: Option<&str>,
    ) -> Result<u64, AppError> {
        for txn in added.iter().chain(modified.iter()) {
            self.db
                .upsert_sync_transaction(
                    owner_id,
                    &txn.external_id,
                    txn.date,
                    &txn.description,
                    invert_provider_amount(txn.amount),
                    txn.category.as_deref(),
                    txn.pending,
                )
                .await?;
        }

        let deleted = self.db.delete_sync_transactions(owner_id, removed).await?;

        if let Some(cursor) = cursor {
            self.db.persist_cursor(connection_id, cursor).await?;
        }

        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn txn(date: &str, description: &str, amount: &str) -> Transaction {
        Transaction {
            transaction_id: Uuid::new_v4(),
            owner_id: "owner-1".to_string(),
            statement_id: None,
            txn_date: date.parse().unwrap(),
            description: description.to_string(),
            amount: amount.parse().unwrap(),
            running_balance: None,
            category: None,
            source: "sync".to_string(),
            is_provisional: true,
            external_id: Some("ext-1".to_string()),
            created_utc: DateTime::<Utc>::MIN_UTC,
        }
    }

    fn eps() -> Decimal {
        Decimal::new(1, 2)
    }

    #[test]
    fn provider_amounts_are_sign_inverted() {
        assert_eq!(
            invert_provider_amount("25.00".parse().unwrap()),
            "-25.00".parse::<Decimal>().unwrap()
        );
        assert_eq!(
            invert_provider_amount("-1200.00".parse().unwrap()),
            "1200.00".parse::<Decimal>().unwrap()
        );
    }

    #[test]
    fn normalization_drops_case_and_punctuation() {
        assert_eq!(normalize_description("STARBUCKS #1234"), "starbucks 1234");
        assert_eq!(normalize_description("  Pay-Roll,  ACME  "), "pay roll acme");
        assert_eq!(normalize_description("***"), "");
    }

    #[test]
    fn fuzzy_match_accepts_containment() {
        let provisional = vec![txn("2026-01-15", "Starbucks", "-4.50")];
        let statement = vec![txn("2026-01-15", "STARBUCKS #1234", "-4.50")];
        let matched = plan_matches(&provisional, &statement, eps());
        assert_eq!(matched, vec![provisional[0].transaction_id]);
    }

    #[test]
    fn match_requires_same_date_and_close_amount() {
        let provisional = vec![
            txn("2026-01-15", "Starbucks", "-4.50"),
            txn("2026-01-16", "Starbucks", "-4.50"),
            txn("2026-01-15", "Starbucks", "-4.60"),
        ];
        let statement = vec![txn("2026-01-15", "STARBUCKS #1234", "-4.50")];

        let matched = plan_matches(&provisional, &statement, eps());
        // Only the first provisional row agrees on date and amount.
        assert_eq!(matched, vec![provisional[0].transaction_id]);
    }

    #[test]
    fn statement_row_is_consumed_at_most_once() {
        let provisional = vec![
            txn("2026-01-15", "Coffee Shop", "-4.50"),
            txn("2026-01-15", "Coffee Shop", "-4.50"),
        ];
        let statement = vec![txn("2026-01-15", "COFFEE SHOP", "-4.50")];

        let matched = plan_matches(&provisional, &statement, eps());
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0], provisional[0].transaction_id);
    }

    #[test]
    fn amount_within_epsilon_matches() {
        let provisional = vec![txn("2026-01-15", "Grocer", "-20.00")];
        let statement = vec![txn("2026-01-15", "GROCER STORE", "-20.01")];
        let matched = plan_matches(&provisional, &statement, eps());
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn empty_descriptions_never_match() {
        let provisional = vec![txn("2026-01-15", "---", "-5.00")];
        let statement = vec![txn("2026-01-15", "...", "-5.00")];
        let matched = plan_matches(&provisional, &statement, eps());
        assert!(matched.is_empty());
    }
}
