//! Job preparation: turns one preparation request into staged inputs plus one execution request
//! per validator.

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use validation_core::{
    ledger::Ledger,
    model::{JobMessage, JobPreparationMessage, Message, ValidationInformation},
    pool::MessageHandler,
    validators::ValidatorRegistry,
    workdir, Error, Queue, QueueMessage, Result,
};

pub mod crypt4gh;
pub mod sda_client;
pub mod staging;

use sda_client::FileService;

/// Message recorded on every row when preparation fails for reasons the user cannot act on.
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal error";

#[derive(Default)]
pub struct JobPreparationServiceBuilder {
    queue: Option<Arc<dyn Queue>>,
    ledger: Option<Arc<dyn Ledger>>,
    registry: Option<Arc<ValidatorRegistry>>,
    file_service: Option<Arc<dyn FileService>>,
    work_dir: Option<PathBuf>,
    destination_queue: Option<String>,
}

impl JobPreparationServiceBuilder {
    /// Queue execution requests are published to.
    pub fn queue(mut self, queue: Arc<dyn Queue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn registry(mut self, registry: Arc<ValidatorRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn file_service(mut self, file_service: Arc<dyn FileService>) -> Self {
        self.file_service = Some(file_service);
        self
    }

    pub fn work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(work_dir.into());
        self
    }

    pub fn destination_queue(mut self, destination_queue: impl Into<String>) -> Self {
        self.destination_queue = Some(destination_queue.into());
        self
    }

    pub fn build(self) -> Result<JobPreparationService> {
        Ok(JobPreparationService {
            queue: self.queue.ok_or_else(|| Error::msg("queue is required"))?,
            ledger: self.ledger.ok_or_else(|| Error::msg("ledger is required"))?,
            registry: self
                .registry
                .ok_or_else(|| Error::msg("registry is required"))?,
            file_service: self
                .file_service
                .ok_or_else(|| Error::msg("file_service is required"))?,
            work_dir: self
                .work_dir
                .filter(|p| !p.as_os_str().is_empty())
                .ok_or_else(|| Error::msg("work_dir is required"))?,
            destination_queue: self
                .destination_queue
                .filter(|q| !q.is_empty())
                .ok_or_else(|| Error::msg("destination_queue is required"))?,
        })
    }
}

pub struct JobPreparationService {
    queue: Arc<dyn Queue>,
    ledger: Arc<dyn Ledger>,
    registry: Arc<ValidatorRegistry>,
    file_service: Arc<dyn FileService>,
    work_dir: PathBuf,
    destination_queue: String,
}

impl JobPreparationService {
    pub fn builder() -> JobPreparationServiceBuilder {
        JobPreparationServiceBuilder::default()
    }

    /// Stage a validation and fan out its execution requests.
    ///
    /// Returns `Err` only when the request should be redelivered: the ledger could not be read,
    /// the failure could not be recorded, or publishing failed.
    pub async fn prepare(&self, validation_id: &str) -> anyhow::Result<()> {
        let info = self
            .ledger
            .read_validation_information(validation_id)
            .await
            .map_err(Error::into_anyhow)
            .with_context(|| format!("read validation information validation_id={validation_id}"))?;

        let Some(info) = info else {
            tracing::info!(
                event = "validation.prepare.nothing_pending",
                validation_id = %validation_id,
                "no pending jobs for validation; skipping"
            );
            return Ok(());
        };

        let validation_dir = match workdir::validation_dir(&self.work_dir, validation_id) {
            Ok(dir) => dir,
            Err(err) => {
                tracing::error!(
                    event = "validation.prepare.invalid_id",
                    validation_id = %validation_id,
                    error = %err,
                    "validation id cannot name a working directory"
                );
                return self.fail_validation(validation_id).await;
            }
        };
        let files_dir = workdir::files_dir(&validation_dir);

        if let Err(err) = workdir::create_dir_all(&files_dir).await {
            tracing::error!(
                event = "validation.prepare.workdir_failed",
                validation_id = %validation_id,
                dir = %files_dir.display(),
                error = %err,
                "failed to create validation working directory"
            );
            return self.fail_validation(validation_id).await;
        }

        if self.registry.requires_file_content(&info.validator_ids) {
            if let Err(err) =
                staging::stage_files(self.file_service.as_ref(), &files_dir, &info).await
            {
                tracing::error!(
                    event = "validation.prepare.staging_failed",
                    validation_id = %validation_id,
                    kind = ?err.kind,
                    error = %err,
                    "failed to stage validation files"
                );
                remove_best_effort(&validation_dir).await;
                return self.fail_validation(validation_id).await;
            }
        }

        self.publish_jobs(&validation_dir, &info).await?;

        tracing::info!(
            event = "validation.prepare.dispatched",
            validation_id = %validation_id,
            validators = info.validator_ids.len(),
            files = info.files.len(),
            "execution jobs published"
        );
        Ok(())
    }

    async fn publish_jobs(
        &self,
        validation_dir: &Path,
        info: &ValidationInformation,
    ) -> anyhow::Result<()> {
        let working_directory = validation_dir.to_string_lossy().into_owned();
        for validator_id in &info.validator_ids {
            let job = JobMessage {
                validation_id: info.validation_id.clone(),
                validator_id: validator_id.clone(),
                working_directory: working_directory.clone(),
                files: info.files.clone(),
            };
            let payload = serde_json::to_value(&job).context("encode job message")?;
            self.queue
                .publish(&self.destination_queue, payload, Utc::now())
                .await
                .map_err(Error::into_anyhow)
                .with_context(|| {
                    format!(
                        "publish job validation_id={} validator_id={validator_id}",
                        info.validation_id
                    )
                })?;
        }
        Ok(())
    }

    async fn fail_validation(&self, validation_id: &str) -> anyhow::Result<()> {
        self.ledger
            .update_all_validation_job_files_on_error(
                validation_id,
                &Message::error(INTERNAL_ERROR_MESSAGE),
            )
            .await
            .map_err(Error::into_anyhow)
            .with_context(|| format!("mark validation failed validation_id={validation_id}"))
    }
}

async fn remove_best_effort(dir: &Path) {
    if let Err(err) = workdir::remove_dir_all(dir).await {
        tracing::warn!(
            event = "validation.prepare.cleanup_failed",
            dir = %dir.display(),
            error = %err,
            "failed to remove validation working directory"
        );
    }
}

#[async_trait]
impl MessageHandler for JobPreparationService {
    async fn handle(&self, message: &QueueMessage) -> anyhow::Result<()> {
        let request: JobPreparationMessage = match serde_json::from_value(message.payload.clone())
        {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(
                    event = "validation.prepare.invalid_message",
                    message_id = %message.message_id,
                    error = %err,
                    "dropping undecodable preparation request"
                );
                return Ok(());
            }
        };

        self.prepare(&request.validation_id).await
    }
}
