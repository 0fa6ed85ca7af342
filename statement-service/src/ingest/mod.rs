//! Upload ingestion: archive expansion, content hashing, and dedup.

use crate::config::IngestConfig;
use crate::models::Statement;
use crate::services::database::Database;
use crate::services::metrics::INGEST_OUTCOMES;
use crate::services::storage::Storage;
use service_core::error::AppError;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// One file as received from the client, after any archive expansion.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Per-file result of an ingest batch.
#[derive(Debug)]
pub enum IngestOutcome {
    Created(Statement),
    Duplicate {
        file_name: String,
        statement_id: Uuid,
    },
}

impl IngestOutcome {
    pub fn statement_id(&self) -> Uuid {
        match self {
            IngestOutcome::Created(s) => s.statement_id,
            IngestOutcome::Duplicate { statement_id, .. } => *statement_id,
        }
    }
}

pub struct IngestService {
    db: Database,
    storage: Arc<dyn Storage>,
    config: IngestConfig,
}

impl IngestService {
    pub fn new(db: Database, storage: Arc<dyn Storage>, config: IngestConfig) -> Self {
        Self { db, storage, config }
    }

    /// Validate and expand an upload batch. Zip archives are flattened into
    /// their member files; everything else passes through unchanged.
    #[instrument(skip(self, files), fields(count = files.len()))]
    pub fn expand_batch(&self, files: Vec<UploadedFile>) -> Result<Vec<UploadedFile>, AppError> {
        let mut expanded = Vec::new();
        let mut batch_bytes: usize = 0;

        for file in files {
            if is_zip(&file.file_name) {
                // Bundles mix content; unusable members are dropped, not
                // rejected. Directly uploaded files are still hard errors.
                for member in
                    expand_zip(&file.file_name, &file.bytes, &self.config.allowed_extensions)?
                {
                    batch_bytes += member.bytes.len();
                    self.check_file(&member)?;
                    expanded.push(member);
                }
            } else {
                batch_bytes += file.bytes.len();
                self.check_file(&file)?;
                expanded.push(file);
            }

            if batch_bytes > self.config.max_batch_bytes {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Upload batch exceeds {} bytes",
                    self.config.max_batch_bytes
                )));
            }
        }

        if expanded.is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "No ingestable files in upload"
            )));
        }

        Ok(expanded)
    }

    fn check_file(&self, file: &UploadedFile) -> Result<(), AppError> {
        if file.bytes.is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "File '{}' is empty",
                file.file_name
            )));
        }
        if file.bytes.len() > self.config.max_file_bytes {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "File '{}' exceeds {} bytes",
                file.file_name,
                self.config.max_file_bytes
            )));
        }
        if !is_allowed_extension(&file.file_name, &self.config.allowed_extensions) {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "File '{}' has unsupported type '{}'",
                file.file_name,
                file_extension(&file.file_name)
            )));
        }
        Ok(())
    }

    /// Ingest one file: hash, dedup against prior uploads, then persist
    /// bytes and the pending statement row. The hash check runs before any
    /// write so duplicates cost nothing.
    #[instrument(skip(self, file), fields(owner_id = %owner_id, file_name = %file.file_name))]
    pub async fn ingest_file(
        &self,
        owner_id: &str,
        file: &UploadedFile,
    ) -> Result<IngestOutcome, AppError> {
        let hash = content_hash(&file.bytes);

        if let Some(existing) = self.db.find_statement_by_hash(owner_id, &hash).await? {
            INGEST_OUTCOMES.with_label_values(&["duplicate"]).inc();
            info!(statement_id = %existing, "Duplicate upload skipped");
            return Ok(IngestOutcome::Duplicate {
                file_name: file.file_name.clone(),
                statement_id: existing,
            });
        }

        let storage_key = format!("{}/{}.{}", owner_id, hash, file_extension(&file.file_name));
        self.storage.upload(&storage_key, file.bytes.clone()).await?;

        let created = self
            .db
            .create_statement(
                owner_id,
                &file.file_name,
                &hash,
                &storage_key,
                file.bytes.len() as i64,
            )
            .await;

        match created {
            Ok(statement) => {
                INGEST_OUTCOMES.with_label_values(&["created"]).inc();
                Ok(IngestOutcome::Created(statement))
            }
            // Lost a race with a concurrent upload of the same bytes.
            Err(AppError::Conflict(_)) => {
                let existing = self
                    .db
                    .find_statement_by_hash(owner_id, &hash)
                    .await?
                    .ok_or_else(|| {
                        AppError::InternalError(anyhow::anyhow!(
                            "Duplicate statement vanished during ingest"
                        ))
                    })?;
                INGEST_OUTCOMES.with_label_values(&["duplicate"]).inc();
                Ok(IngestOutcome::Duplicate {
                    file_name: file.file_name.clone(),
                    statement_id: existing,
                })
            }
            Err(e) => Err(e),
        }
    }
}

pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn file_extension(name: &str) -> String {
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

fn is_allowed_extension(name: &str, allowed: &[String]) -> bool {
    let ext = file_extension(name);
    allowed.iter().any(|a| a.eq_ignore_ascii_case(&ext))
}

fn is_zip(name: &str) -> bool {
    file_extension(name) == "zip"
}

/// Entries the archiver added on its own, not user data.
fn is_archive_noise(path: &str) -> bool {
    path.split('/').any(|part| part.starts_with('.') || part == "__MACOSX")
}

/// Expand a zip bundle, keeping only ingestable members: directories,
/// archiver noise, empty entries, and types outside the allow-list are
/// skipped rather than failing the batch.
fn expand_zip(
    archive_name: &str,
    bytes: &[u8],
    allowed_extensions: &[String],
) -> Result<Vec<UploadedFile>, AppError> {
    let cursor = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor).map_err(|e| {
        AppError::BadRequest(anyhow::anyhow!("Invalid zip archive '{}': {}", archive_name, e))
    })?;

    let mut members = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| {
            AppError::BadRequest(anyhow::anyhow!("Corrupt zip entry in '{}': {}", archive_name, e))
        })?;

        if entry.is_dir() {
            continue;
        }
        let entry_name = entry.name().to_string();
        if is_archive_noise(&entry_name) {
            continue;
        }
        if !is_allowed_extension(&entry_name, allowed_extensions) {
            warn!(archive = %archive_name, entry = %entry_name, "Skipping unsupported zip member");
            continue;
        }

        let mut content = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut content).map_err(|e| {
            AppError::BadRequest(anyhow::anyhow!(
                "Failed to read zip entry '{}': {}",
                entry_name,
                e
            ))
        })?;
        if content.is_empty() {
            warn!(archive = %archive_name, entry = %entry_name, "Skipping empty zip member");
            continue;
        }

        // Keep the leaf name; archive directory structure is not meaningful here.
        let leaf = entry_name
            .rsplit('/')
            .next()
            .unwrap_or(&entry_name)
            .to_string();

        members.push(UploadedFile {
            file_name: leaf,
            bytes: content,
        });
    }

    if members.is_empty() {
        warn!(archive = %archive_name, "Zip archive contained no usable files");
    }

    Ok(members)
}
