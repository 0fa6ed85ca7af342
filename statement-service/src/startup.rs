use crate::config::StatementConfig;
use crate::handlers;
use crate::ingest::IngestService;
use crate::processor::StatementProcessor;
use crate::reconcile::{Reconciler, SyncEngine};
use crate::services::database::Database;
use crate::services::extraction::{Extractor, HttpExtractor};
use crate::services::ledger::LedgerHook;
use crate::services::metrics;
use crate::services::storage::{LocalStorage, Storage};
use crate::services::sync_provider::{HttpSyncProvider, SyncProvider};
use crate::workers::{JobOrchestrator, JobRequest};
use axum::extract::DefaultBodyLimit;
use axum::{
    routing::{get, post, put},
    Router,
};
use service_core::error::AppError;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: StatementConfig,
    pub db: Database,
    pub storage: Arc<dyn Storage>,
    pub ingest: Arc<IngestService>,
    pub processor: Arc<StatementProcessor>,
    pub sync_engine: Arc<SyncEngine>,
    pub job_tx: Option<mpsc::Sender<JobRequest>>,
}

pub struct Application {
    port: u16,
    server: Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + Unpin>,
    state: AppState,
    worker_shutdown: Option<CancellationToken>,
}

impl Application {
    pub async fn build(config: StatementConfig) -> Result<Self, AppError> {
        let extractor: Arc<dyn Extractor> = Arc::new(HttpExtractor::new(&config.extraction.url)?);
        let provider: Arc<dyn SyncProvider> =
            Arc::new(HttpSyncProvider::new(&config.sync.provider_url)?);
        Self::build_with_collaborators(config, extractor, provider).await
    }

    /// Build with injected extraction and sync collaborators. Tests use this
    /// to substitute scripted implementations.
    pub async fn build_with_collaborators(
        config: StatementConfig,
        extractor: Arc<dyn Extractor>,
        provider: Arc<dyn SyncProvider>,
    ) -> Result<Self, AppError> {
        metrics::init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await?;
        db.run_migrations().await?;

        let storage: Arc<dyn Storage> = Arc::new(
            LocalStorage::new(config.storage.local_path.clone())
                .await
                .map_err(|e| {
                    tracing::error!(
                        path = %config.storage.local_path,
                        error = %e,
                        "Failed to initialize local storage"
                    );
                    e
                })?,
        );

        let ingest = Arc::new(IngestService::new(
            db.clone(),
            storage.clone(),
            config.ingest.clone(),
        ));

        let reconciler = Reconciler::new(db.clone(), config.processing.match_amount_epsilon);
        let ledger = LedgerHook::new(&config.ledger.recalc_url);
        let processor = Arc::new(StatementProcessor::new(
            db.clone(),
            storage.clone(),
            extractor,
            reconciler,
            ledger,
            config.processing.balance_epsilon,
        ));

        let sync_engine = Arc::new(SyncEngine::new(db.clone(), provider));

        let (orchestrator, job_tx) =
            JobOrchestrator::new(config.worker.clone(), db.clone(), processor.clone());
        let (job_tx, worker_shutdown) = if config.worker.enabled {
            let token = orchestrator.shutdown_token();
            orchestrator.start().await;
            (Some(job_tx), Some(token))
        } else {
            (None, None)
        };

        let state = AppState {
            config: config.clone(),
            db,
            storage,
            ingest,
            processor,
            sync_engine,
            job_tx,
        };

        let app = Router::new()
            .route("/health", get(handlers::health_check))
            .route("/ready", get(handlers::readiness_check))
            .route("/metrics", get(handlers::metrics_handler))
            .route(
                "/statements",
                post(handlers::upload_statements).get(handlers::list_statements),
            )
            .route("/statements/process", post(handlers::process_statements))
            .route("/statements/:id", get(handlers::get_statement))
            .route(
                "/statements/:id/reprocess",
                post(handlers::reprocess_statement),
            )
            .route(
                "/statements/:id/verification",
                put(handlers::update_verification),
            )
            .route("/jobs", get(handlers::list_jobs))
            .route("/jobs/:id", get(handlers::get_job))
            .route("/jobs/:id/progress", get(handlers::job_progress))
            .route("/sync/connections", post(handlers::create_connection))
            .route("/sync/connections/:id", get(handlers::get_connection))
            .route("/sync/connections/:id/sync", post(handlers::trigger_sync))
            .route("/sync/webhook", post(handlers::sync_webhook))
            .route("/maintenance/reset-stuck", post(handlers::reset_stuck))
            .layer(DefaultBodyLimit::max(config.ingest.max_batch_bytes))
            .layer(axum::middleware::from_fn(
                crate::middleware::http_metrics_middleware,
            ))
            .layer(axum::middleware::from_fn(
                service_core::middleware::tracing::request_id_middleware,
            ))
            .layer(TraceLayer::new_for_http())
            .with_state(state.clone());

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind TCP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Listening on {}", port);

        let server = axum::serve(listener, app);

        Ok(Self {
            port,
            server: Box::new(server.into_future()),
            state,
            worker_shutdown,
        })
    }

    pub fn db(&self) -> &Database {
        &self.state.db
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let result = self.server.await;
        if let Some(token) = self.worker_shutdown {
            token.cancel();
        }
        result
    }
}
