//! Client for the external bank-sync provider.
//!
//! The provider speaks a cursor-based incremental protocol: each call returns
//! the transactions added, modified, or removed since the supplied cursor,
//! plus the next cursor and a flag indicating whether more pages remain.
//! Provider amounts use the opposite sign convention (positive = outflow);
//! the reconciliation engine inverts them at its ingress boundary.

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use service_core::error::AppError;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderTransaction {
    /// The provider's stable transaction id.
    pub external_id: String,
    pub date: NaiveDate,
    pub description: String,
    /// Provider sign convention: positive = debit/outflow.
    pub amount: Decimal,
    pub pending: bool,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncPage {
    #[serde(default)]
    pub added: Vec<ProviderTransaction>,
    #[serde(default)]
    pub modified: Vec<ProviderTransaction>,
    /// External ids of transactions the provider retracted.
    #[serde(default)]
    pub removed: Vec<String>,
    pub next_cursor: String,
    pub has_more: bool,
}

#[async_trait]
pub trait SyncProvider: Send + Sync {
    async fn transactions_sync(
        &self,
        item_id: &str,
        cursor: Option<&str>,
    ) -> Result<SyncPage, AppError>;
}

/// HTTP implementation posting to the provider's sync endpoint.
pub struct HttpSyncProvider {
    client: reqwest::Client,
    url: String,
}

impl HttpSyncProvider {
    pub fn new(url: impl Into<String>) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                AppError::InternalError(anyhow::anyhow!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl SyncProvider for HttpSyncProvider {
    async fn transactions_sync(
        &self,
        item_id: &str,
        cursor: Option<&str>,
    ) -> Result<SyncPage, AppError> {
        let endpoint = format!("{}/transactions/sync", self.url.trim_end_matches('/'));

        let response = self
            .client
            .post(&endpoint)
            .json(&serde_json::json!({ "item_id": item_id, "cursor": cursor }))
            .send()
            .await
            .map_err(|e| AppError::BadGateway(format!("Sync provider unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::BadGateway(format!(
                "Sync provider returned {}",
                response.status()
            )));
        }

        response.json::<SyncPage>().await.map_err(|e| {
            AppError::BadGateway(format!("Sync provider returned malformed output: {}", e))
        })
    }
}
