//! Common test utilities for statement-service integration tests.

use rust_decimal::Decimal;
use async_trait::async_trait;
use service_core::error::AppError;
use statement_service::config::{
    DatabaseConfig, ExtractionConfig, IngestConfig, LedgerConfig, ProcessingConfig,
    StatementConfig, StorageConfig, SyncConfig, WorkerConfig,
};
use statement_service::services::database::Database;
use statement_service::services::extraction::{
    Direction, ExtractedStatement, ExtractedTransaction, Extractor,
};
use statement_service::services::sync_provider::{SyncPage, SyncProvider};
use statement_service::startup::Application;
use std::sync::{Arc, Mutex, Once};
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,statement_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn test_config(storage_dir: &std::path::Path, database_url: String) -> StatementConfig {
    StatementConfig {
        common: service_core::config::Config { port: 0 },
        service_name: "statement-service-test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: database_url,
            max_connections: 2,
            min_connections: 1,
        },
        storage: StorageConfig {
            local_path: storage_dir.to_string_lossy().into_owned(),
        },
        ingest: IngestConfig {
            max_file_bytes: 1024 * 1024,
            max_batch_bytes: 4 * 1024 * 1024,
            allowed_extensions: vec!["pdf".to_string(), "txt".to_string(), "csv".to_string()],
        },
        worker: WorkerConfig {
            enabled: true,
            worker_count: 1,
            queue_size: 16,
        },
        processing: ProcessingConfig {
            balance_epsilon: Decimal::new(1, 2),
            match_amount_epsilon: Decimal::new(1, 2),
            progress_poll_interval_secs: 1,
        },
        extraction: ExtractionConfig { url: String::new() },
        sync: SyncConfig {
            provider_url: String::new(),
        },
        ledger: LedgerConfig {
            recalc_url: String::new(), // Empty = notifications disabled
        },
    }
}

/// Extractor driven by the uploaded file content, so each test controls
/// extraction output per file.
///
/// Format: a header line `opening=..,closing=..,start=..,end=..` (any field
/// may be omitted), then one line per transaction:
/// `date,description,credit|debit,amount`. A file whose content starts with
/// `ERROR` fails extraction; an empty file extracts nothing.
pub struct FixtureExtractor;

#[async_trait]
impl Extractor for FixtureExtractor {
    async fn extract(&self, text: &str) -> Result<ExtractedStatement, AppError> {
        if text.trim_start().starts_with("ERROR") {
            return Err(AppError::BadGateway("extraction failed".to_string()));
        }

        let mut extracted = ExtractedStatement {
            bank_name: Some("Fixture Bank".to_string()),
            account_number_masked: Some("****0001".to_string()),
            period_start: None,
            period_end: None,
            opening_balance: None,
            closing_balance: None,
            transactions: Vec::new(),
        };

        for (i, line) in text.lines().filter(|l| !l.trim().is_empty()).enumerate() {
            if i == 0 && line.contains('=') {
                for field in line.split(',') {
                    let Some((key, value)) = field.split_once('=') else {
                        continue;
                    };
                    match key.trim() {
                        "opening" => extracted.opening_balance = value.trim().parse().ok(),
                        "closing" => extracted.closing_balance = value.trim().parse().ok(),
                        "start" => extracted.period_start = value.trim().parse().ok(),
                        "end" => extracted.period_end = value.trim().parse().ok(),
                        _ => {}
                    }
                }
                continue;
            }

            let parts: Vec<&str> = line.split(',').collect();
            if parts.len() != 4 {
                continue;
            }
            extracted.transactions.push(ExtractedTransaction {
                date: parts[0].trim().parse().map_err(|_| {
                    AppError::BadGateway(format!("bad fixture date: {}", parts[0]))
                })?,
                description: parts[1].trim().to_string(),
                direction: if parts[2].trim() == "credit" {
                    Direction::Credit
                } else {
                    Direction::Debit
                },
                amount: parts[3].trim().parse().map_err(|_| {
                    AppError::BadGateway(format!("bad fixture amount: {}", parts[3]))
                })?,
                running_balance: None,
                category: None,
            });
        }

        Ok(extracted)
    }
}

/// Provider that serves a scripted sequence of pages and records the
/// cursor it was handed on each call.
pub struct ScriptedProvider {
    pages: Mutex<Vec<SyncPage>>,
    pub cursors_seen: Mutex<Vec<Option<String>>>,
}

impl ScriptedProvider {
    pub fn new(pages: Vec<SyncPage>) -> Self {
        let mut pages = pages;
        pages.reverse(); // pop() serves them in order
        Self {
            pages: Mutex::new(pages),
            cursors_seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SyncProvider for ScriptedProvider {
    async fn transactions_sync(
        &self,
        _item_id: &str,
        cursor: Option<&str>,
    ) -> Result<SyncPage, AppError> {
        self.cursors_seen
            .lock()
            .unwrap()
            .push(cursor.map(str::to_string));

        self.pages.lock().unwrap().pop().ok_or_else(|| {
            AppError::BadGateway("scripted provider exhausted".to_string())
        })
    }
}

#[allow(dead_code)]
pub struct TestApp {
    pub client: reqwest::Client,
    pub address: String,
    pub owner_id: String,
    pub db: Database,
    // Holds the storage directory alive for the app's lifetime.
    _storage_dir: tempfile::TempDir,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }
}

/// Spawn a test application, or None when no test database is configured.
pub async fn spawn_app() -> Option<TestApp> {
    spawn_app_with(Arc::new(FixtureExtractor), Arc::new(ScriptedProvider::new(Vec::new()))).await
}

pub async fn spawn_app_with(
    extractor: Arc<dyn Extractor>,
    provider: Arc<dyn SyncProvider>,
) -> Option<TestApp> {
    init_tracing();

    let Ok(database_url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set - skipping integration test");
        return None;
    };

    let storage_dir = tempfile::tempdir().expect("Failed to create storage dir");
    let config = test_config(storage_dir.path(), database_url);

    let app = Application::build_with_collaborators(config, extractor, provider)
        .await
        .expect("Failed to build application");

    let port = app.port();
    let db = app.db().clone();

    tokio::spawn(async move {
        app.run_until_stopped().await.ok();
    });

    Some(TestApp {
        client: reqwest::Client::new(),
        address: format!("http://127.0.0.1:{}", port),
        owner_id: format!("owner-{}", Uuid::new_v4()),
        db,
        _storage_dir: storage_dir,
    })
}

/// Poll a job until it reaches a terminal state.
#[allow(dead_code)]
pub async fn wait_for_job(app: &TestApp, job_id: &str) -> serde_json::Value {
    for _ in 0..100 {
        let body: serde_json::Value = app
            .client
            .get(app.url(&format!("/jobs/{}", job_id)))
            .header("X-User-ID", &app.owner_id)
            .send()
            .await
            .expect("Failed to fetch job")
            .json()
            .await
            .expect("Job response was not JSON");

        let status = body["status"].as_str().unwrap_or_default();
        if status == "completed" || status == "failed" {
            return body;
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
    panic!("Job {} did not reach a terminal state", job_id);
}
