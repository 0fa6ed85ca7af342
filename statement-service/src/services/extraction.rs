//! Client for the external statement-extraction collaborator.
//!
//! The collaborator receives raw statement text and returns structured fields
//! (bank, account, period, reported balances, transactions tagged
//! credit/debit). We treat it as a black box behind the [`Extractor`] trait so
//! tests can substitute a scripted implementation.

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use service_core::error::AppError;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Credit,
    Debit,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedTransaction {
    pub date: NaiveDate,
    pub description: String,
    /// Magnitude as reported by the collaborator; sign is carried by
    /// `direction`, not by this field.
    pub amount: Decimal,
    pub direction: Direction,
    pub running_balance: Option<Decimal>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedStatement {
    pub bank_name: Option<String>,
    pub account_number_masked: Option<String>,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub opening_balance: Option<Decimal>,
    pub closing_balance: Option<Decimal>,
    #[serde(default)]
    pub transactions: Vec<ExtractedTransaction>,
}

impl ExtractedStatement {
    /// True when the collaborator produced nothing a processor could act on.
    pub fn is_unusable(&self) -> bool {
        self.transactions.is_empty()
            && self.opening_balance.is_none()
            && self.closing_balance.is_none()
    }
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, text: &str) -> Result<ExtractedStatement, AppError>;
}

/// HTTP implementation posting to the extraction service.
pub struct HttpExtractor {
    client: reqwest::Client,
    url: String,
}

impl HttpExtractor {
    pub fn new(url: impl Into<String>) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            // Extraction runs a language model; allow for slow responses.
            .timeout(Duration::from_secs(120))
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
impl Extractor for HttpExtractor {
    async fn extract(&self, text: &str) -> Result<ExtractedStatement, AppError> {
        let endpoint = format!("{}/extract", self.url.trim_end_matches('/'));

        let response = self
            .client
            .post(&endpoint)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| AppError::BadGateway(format!("Extraction service unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::BadGateway(format!(
                "Extraction service returned {}",
                response.status()
            )));
        }

        response.json::<ExtractedStatement>().await.map_err(|e| {
            AppError::BadGateway(format!("Extraction service returned malformed output: {}", e))
        })
    }
}
