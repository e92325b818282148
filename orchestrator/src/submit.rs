//! Intake helper: register a validation in the ledger and request its preparation.

use anyhow::{anyhow, bail, Context};
use chrono::Utc;
use std::collections::HashSet;
use validation_core::{
    ledger::Ledger,
    model::{JobPreparationMessage, NewFileValidationJob},
    Queue,
};
use validation_prep::sda_client::{FileService, UserFile};

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub user: String,
    pub triggered_by: String,
    pub validator_ids: Vec<String>,
    pub file_paths: Vec<String>,
}

/// Insert one pending row per (validator, file) in a single transaction, then publish the
/// preparation request. Returns the new validation id.
pub async fn submit(
    ledger: &dyn Ledger,
    queue: &dyn Queue,
    files: &dyn FileService,
    preparation_queue: &str,
    req: &SubmitRequest,
) -> anyhow::Result<String> {
    let validator_ids = distinct(&req.validator_ids);
    let file_paths = distinct(&req.file_paths);
    if validator_ids.is_empty() {
        bail!("at least one validator is required");
    }
    if file_paths.is_empty() {
        bail!("at least one file is required");
    }

    let listed = files
        .list_user_files(&req.user)
        .await
        .with_context(|| format!("list files of user {}", req.user))?;
    let resolved = file_paths
        .iter()
        .map(|path| {
            resolve(&listed, path)
                .ok_or_else(|| anyhow!("file {path} not found for user {}", req.user))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let validation_id = uuid::Uuid::new_v4().to_string();
    let started_at = Utc::now();

    let mut tx = ledger.begin().await?;
    for validator_id in &validator_ids {
        for file in &resolved {
            tx.insert_file_validation_job(&NewFileValidationJob {
                validation_id: validation_id.clone(),
                validator_id: validator_id.to_string(),
                file_id: file.file_id.clone(),
                file_path: data_path(file).to_string(),
                submission_file_size: file.submission_file_size,
                submission_user: req.user.clone(),
                triggered_by: req.triggered_by.clone(),
                started_at,
            })
            .await?;
        }
    }
    tx.commit().await?;

    let payload = serde_json::to_value(JobPreparationMessage {
        validation_id: validation_id.clone(),
    })
    .context("encode preparation request")?;
    queue
        .publish(preparation_queue, payload, Utc::now())
        .await
        .context("publish preparation request")?;

    tracing::info!(
        event = "validation.submit.accepted",
        validation_id = %validation_id,
        validators = validator_ids.len(),
        files = resolved.len(),
        "validation submitted"
    );
    Ok(validation_id)
}

fn distinct(values: &[String]) -> Vec<&str> {
    let mut seen = HashSet::new();
    values
        .iter()
        .map(String::as_str)
        .filter(|v| !v.is_empty() && seen.insert(*v))
        .collect()
}

/// Path of the decrypted file below the staged files directory.
fn data_path(file: &UserFile) -> &str {
    let inbox = file.inbox_path.trim_start_matches('/');
    inbox.strip_suffix(".c4gh").unwrap_or(inbox)
}

/// Upstream paths carry the encrypted `.c4gh` suffix; users may name a file either way.
fn resolve<'a>(listed: &'a [UserFile], path: &str) -> Option<&'a UserFile> {
    let wanted = path.trim_start_matches('/');
    listed.iter().find(|f| {
        f.inbox_path.trim_start_matches('/') == wanted || data_path(f) == wanted
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use validation_core::{
        lite::memory::{MemoryLedger, MemoryQueue},
        model::JobResult,
    };
    use validation_prep::{sda_client::FileStream, staging::StagingError};

    struct Listing(Vec<UserFile>);

    #[async_trait]
    impl FileService for Listing {
        async fn list_user_files(&self, _user: &str) -> Result<Vec<UserFile>, StagingError> {
            Ok(self.0.clone())
        }

        async fn download_file(
            &self,
            _user: &str,
            file_id: &str,
            _public_key: &str,
        ) -> Result<Box<dyn FileStream>, StagingError> {
            Err(StagingError::permanent(anyhow!("no download for {file_id}")))
        }
    }

    fn listing() -> Listing {
        Listing(vec![
            UserFile {
                file_id: "f1".to_string(),
                inbox_path: "alice/a.txt.c4gh".to_string(),
                submission_file_size: 5,
            },
            UserFile {
                file_id: "f2".to_string(),
                inbox_path: "alice/b/c.txt.c4gh".to_string(),
                submission_file_size: 9,
            },
        ])
    }

    fn request(validators: &[&str], files: &[&str]) -> SubmitRequest {
        SubmitRequest {
            user: "alice".to_string(),
            triggered_by: "alice".to_string(),
            validator_ids: validators.iter().map(|v| v.to_string()).collect(),
            file_paths: files.iter().map(|f| f.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn inserts_one_row_per_validator_and_file_then_publishes() {
        let ledger = MemoryLedger::new();
        let queue = MemoryQueue::new();

        let id = submit(
            &ledger,
            &queue,
            &listing(),
            "prep",
            &request(&["fmt", "tree", "fmt"], &["alice/a.txt", "alice/b/c.txt.c4gh"]),
        )
        .await
        .unwrap();

        let rows = ledger.rows(&id);
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.finished_at.is_none()
            && r.file_result == JobResult::Pending
            && r.submission_user == "alice"));
        let c = rows.iter().find(|r| r.file_id == "f2").unwrap();
        assert_eq!(c.file_path, "alice/b/c.txt");
        assert_eq!(c.submission_file_size, 9);

        assert_eq!(queue.peek("prep"), vec![serde_json::json!({ "validation_id": id })]);
    }

    #[tokio::test]
    async fn unknown_file_inserts_nothing() {
        let ledger = MemoryLedger::new();
        let queue = MemoryQueue::new();

        let err = submit(
            &ledger,
            &queue,
            &listing(),
            "prep",
            &request(&["fmt"], &["alice/a.txt", "alice/missing.txt"]),
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("alice/missing.txt"));
        assert!(queue.is_empty("prep"));
    }

    #[tokio::test]
    async fn empty_selection_is_rejected() {
        let ledger = MemoryLedger::new();
        let queue = MemoryQueue::new();
        let err = submit(&ledger, &queue, &listing(), "prep", &request(&[], &["alice/a.txt"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("validator"));
    }
}
