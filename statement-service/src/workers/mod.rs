//! Background job execution for statement batches.

use crate::config::WorkerConfig;
use crate::models::{JobItem, JobStatus};
use crate::processor::StatementProcessor;
use crate::services::database::Database;
use crate::services::metrics::JOB_ITEM_OUTCOMES;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Message left on jobs and items that a restart found non-terminal.
pub const INTERRUPTED_SENTINEL: &str = "interrupted by restart";

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub job_id: Uuid,
    pub owner_id: String,
}

/// Derive the terminal job status from per-item outcomes. A job fails only
/// when every item failed; partial failure still completes, with the
/// failure count surfaced in the error message.
pub fn finalize_from_counts(failed_items: usize, total_items: usize) -> (JobStatus, Option<String>) {
    if total_items > 0 && failed_items == total_items {
        (JobStatus::Failed, Some("All files failed".to_string()))
    } else if failed_items > 0 {
        (
            JobStatus::Completed,
            Some(format!("{} of {} files failed", failed_items, total_items)),
        )
    } else {
        (JobStatus::Completed, None)
    }
}

pub struct JobOrchestrator {
    config: WorkerConfig,
    db: Database,
    processor: Arc<StatementProcessor>,
    job_rx: Option<mpsc::Receiver<JobRequest>>,
    shutdown_token: CancellationToken,
}

impl JobOrchestrator {
    pub fn new(
        config: WorkerConfig,
        db: Database,
        processor: Arc<StatementProcessor>,
    ) -> (Self, mpsc::Sender<JobRequest>) {
        let (job_tx, job_rx) = mpsc::channel(config.queue_size);
        let shutdown_token = CancellationToken::new();

        let orchestrator = Self {
            config,
            db,
            processor,
            job_rx: Some(job_rx),
            shutdown_token,
        };

        (orchestrator, job_tx)
    }

    /// Token that stops the distributor; cancel it during shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub async fn start(mut self) {
        if !self.config.enabled {
            tracing::info!("Worker pool disabled by configuration");
            return;
        }

        let mut job_rx = self.job_rx.take().expect("start() can only be called once");

        tracing::info!(
            worker_count = self.config.worker_count,
            "Starting job worker pool"
        );

        let mut workers = Vec::new();
        for worker_id in 0..self.config.worker_count {
            workers.push(JobWorker {
                id: worker_id,
                db: self.db.clone(),
                processor: self.processor.clone(),
            });
        }

        let shutdown = self.shutdown_token.clone();

        // One distributor task, round-robin across workers. Items within a
        // job stay sequential; only whole jobs run concurrently.
        tokio::spawn(async move {
            let mut next_worker = 0;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Job distributor shutting down");
                        break;
                    }
                    request = job_rx.recv() => {
                        match request {
                            Some(request) => {
                                let worker = workers[next_worker].clone();
                                next_worker = (next_worker + 1) % workers.len();

                                tracing::info!(
                                    worker_id = worker.id,
                                    job_id = %request.job_id,
                                    "Dispatching job to worker"
                                );

                                tokio::spawn(async move {
                                    worker.run_job(request).await;
                                });
                            }
                            None => {
                                tracing::info!("Channel closed, job distributor exiting");
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

}

#[derive(Clone)]
struct JobWorker {
    id: usize,
    db: Database,
    processor: Arc<StatementProcessor>,
}

impl JobWorker {
    async fn run_job(&self, request: JobRequest) {
        let start = Instant::now();

        tracing::info!(
            worker_id = self.id,
            job_id = %request.job_id,
            "Job started"
        );

        if let Err(e) = self.db.mark_job_running(request.job_id).await {
            tracing::error!(job_id = %request.job_id, error = %e, "Failed to mark job running");
            return;
        }

        let items = match self.db.get_job_items(request.job_id).await {
            Ok(items) => items,
            Err(e) => {
                tracing::error!(job_id = %request.job_id, error = %e, "Failed to load job items");
                let _ = self
                    .db
                    .finalize_job(request.job_id, JobStatus::Failed, Some(&e.to_string()))
                    .await;
                return;
            }
        };

        let total = items.len();
        let mut completed: i32 = 0;
        let mut failed: usize = 0;

        for item in items {
            if JobStatus::parse(&item.status).is_terminal() {
                completed += 1;
                continue;
            }

            if !self.run_item(&request, &item).await {
                failed += 1;
            }

            completed += 1;
            if let Err(e) = self
                .db
                .update_job_progress(request.job_id, completed, total as i32)
                .await
            {
                tracing::error!(job_id = %request.job_id, error = %e, "Failed to persist progress");
            }
        }

        let (status, error) = finalize_from_counts(failed, total);
        if let Err(e) = self
            .db
            .finalize_job(request.job_id, status, error.as_deref())
            .await
        {
            tracing::error!(job_id = %request.job_id, error = %e, "Failed to finalize job");
            return;
        }

        tracing::info!(
            worker_id = self.id,
            job_id = %request.job_id,
            status = status.as_str(),
            failed_items = failed,
            total_items = total,
            duration_ms = start.elapsed().as_millis(),
            "Job finished"
        );
    }

    /// Process one item; its failure never aborts the rest of the job.
    async fn run_item(&self, request: &JobRequest, item: &JobItem) -> bool {
        if let Err(e) = self.db.mark_item_running(item.job_item_id).await {
            tracing::error!(job_item_id = %item.job_item_id, error = %e, "Failed to mark item running");
        }

        match self
            .processor
            .process(&request.owner_id, item.statement_id)
            .await
        {
            Ok(_) => {
                JOB_ITEM_OUTCOMES.with_label_values(&["completed"]).inc();
                if let Err(e) = self
                    .db
                    .mark_item_finished(item.job_item_id, JobStatus::Completed, None)
                    .await
                {
                    tracing::error!(job_item_id = %item.job_item_id, error = %e, "Failed to mark item completed");
                }
                true
            }
            Err(e) => {
                JOB_ITEM_OUTCOMES.with_label_values(&["failed"]).inc();
                tracing::warn!(
                    job_item_id = %item.job_item_id,
                    file_name = %item.file_name,
                    error = %e,
                    "Job item failed"
                );
                if let Err(e) = self
                    .db
                    .mark_item_finished(item.job_item_id, JobStatus::Failed, Some(&e.to_string()))
                    .await
                {
                    tracing::error!(job_item_id = %item.job_item_id, error = %e, "Failed to mark item failed");
                }
                false
            }
        }
    }
}
