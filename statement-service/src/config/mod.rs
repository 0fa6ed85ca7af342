//! Configuration module for statement-service.

use rust_decimal::Decimal;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct StatementConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub ingest: IngestConfig,
    pub worker: WorkerConfig,
    pub processing: ProcessingConfig,
    pub extraction: ExtractionConfig,
    pub sync: SyncConfig,
    pub ledger: LedgerConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub local_path: String,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub max_file_bytes: usize,
    pub max_batch_bytes: usize,
    pub allowed_extensions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub worker_count: usize,
    pub queue_size: usize,
}

#[derive(Debug, Clone)]
pub struct ProcessingConfig {
    /// Tolerance for the closing-balance check.
    pub balance_epsilon: Decimal,
    /// Tolerance for amount equality during reconciliation matching.
    pub match_amount_epsilon: Decimal,
    pub progress_poll_interval_secs: u64,
}

impl ProcessingConfig {
    pub fn progress_poll_interval(&self) -> Duration {
        Duration::from_secs(self.progress_poll_interval_secs)
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub provider_url: String,
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Recalculation hook; empty disables the notification.
    pub recalc_url: String,
}

impl StatementConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "statement-service".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", 2),
            },
            storage: StorageConfig {
                local_path: env::var("STORAGE_LOCAL_PATH")
                    .unwrap_or_else(|_| "storage".to_string()),
            },
            ingest: IngestConfig {
                max_file_bytes: parse_env("INGEST_MAX_FILE_BYTES", 20 * 1024 * 1024),
                max_batch_bytes: parse_env("INGEST_MAX_BATCH_BYTES", 100 * 1024 * 1024),
                allowed_extensions: env::var("INGEST_ALLOWED_EXTENSIONS")
                    .map(|v| v.split(',').map(|s| s.trim().to_lowercase()).collect())
                    .unwrap_or_else(|_| {
                        vec!["pdf".to_string(), "txt".to_string(), "csv".to_string()]
                    }),
            },
            worker: WorkerConfig {
                enabled: parse_env("WORKER_ENABLED", true),
                worker_count: parse_env("WORKER_COUNT", 2),
                queue_size: parse_env("WORKER_QUEUE_SIZE", 64),
            },
            processing: ProcessingConfig {
                balance_epsilon: parse_decimal_env("BALANCE_EPSILON", Decimal::new(1, 2))?,
                match_amount_epsilon: parse_decimal_env("MATCH_AMOUNT_EPSILON", Decimal::new(1, 2))?,
                progress_poll_interval_secs: parse_env("PROGRESS_POLL_INTERVAL_SECS", 2),
            },
            extraction: ExtractionConfig {
                url: env::var("EXTRACTION_SERVICE_URL")
                    .unwrap_or_else(|_| "http://extraction-service:3001".to_string()),
            },
            sync: SyncConfig {
                provider_url: env::var("SYNC_PROVIDER_URL")
                    .unwrap_or_else(|_| "http://sync-provider:3001".to_string()),
            },
            ledger: LedgerConfig {
                recalc_url: env::var("LEDGER_RECALC_URL").unwrap_or_default(),
            },
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn parse_decimal_env(key: &str, default: Decimal) -> Result<Decimal, AppError> {
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| {
            AppError::ConfigError(anyhow::anyhow!("{} is not a valid decimal: {}", key, raw))
        }),
        Err(_) => Ok(default),
    }
}
