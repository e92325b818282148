//! Job execution: runs one validator over a validation's staged files and records the outcome.
//!
//! Validator failures (non-zero exit, missing or invalid result manifest, unknown mode,
//! unregistered validator) are business outcomes: they are written to the ledger as `error` rows
//! and the message is acked. Only infrastructure failures (scratch directories, ledger) fail
//! the handler so the message is redelivered.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use validation_core::{
    ledger::Ledger,
    model::{FileValidationJobUpdate, JobMessage, JobResult, Message},
    pool::MessageHandler,
    sandbox::{Sandbox, SandboxRun},
    validators::ValidatorRegistry,
    workdir, Error, QueueMessage, Result,
};

pub mod manifest;

use manifest::{reported_result, ValidatorInput, ValidatorOutput};

pub const FILE_RESULT_NOT_FOUND: &str = "file result not found in validator output";

#[derive(Default)]
pub struct JobExecutionServiceBuilder {
    ledger: Option<Arc<dyn Ledger>>,
    registry: Option<Arc<ValidatorRegistry>>,
    sandbox: Option<Arc<dyn Sandbox>>,
}

impl JobExecutionServiceBuilder {
    pub fn ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn registry(mut self, registry: Arc<ValidatorRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn build(self) -> Result<JobExecutionService> {
        Ok(JobExecutionService {
            ledger: self.ledger.ok_or_else(|| Error::msg("ledger is required"))?,
            registry: self
                .registry
                .ok_or_else(|| Error::msg("registry is required"))?,
            sandbox: self.sandbox.ok_or_else(|| Error::msg("sandbox is required"))?,
        })
    }
}

pub struct JobExecutionService {
    ledger: Arc<dyn Ledger>,
    registry: Arc<ValidatorRegistry>,
    sandbox: Arc<dyn Sandbox>,
}

#[derive(Debug)]
enum RunOutcome {
    Reported(ValidatorOutput),
    Failed(String),
}

impl JobExecutionService {
    pub fn builder() -> JobExecutionServiceBuilder {
        JobExecutionServiceBuilder::default()
    }

    pub async fn execute(&self, job: &JobMessage) -> anyhow::Result<()> {
        let validation_dir = PathBuf::from(&job.working_directory);

        let recorded: anyhow::Result<()> = async {
            let outcome = self.run(job, &validation_dir).await?;
            if let RunOutcome::Failed(reason) = &outcome {
                tracing::warn!(
                    event = "validation.execute.validator_failed",
                    validation_id = %job.validation_id,
                    validator_id = %job.validator_id,
                    reason = %reason,
                    "validator produced no usable result"
                );
            }
            self.record(job, outcome).await
        }
        .await;

        if let Err(err) = recorded {
            if let Ok(job_dir) = workdir::job_dir(&validation_dir, &job.validator_id) {
                if let Err(rm_err) = workdir::remove_dir_all(&job_dir).await {
                    tracing::warn!(
                        event = "validation.execute.cleanup_failed",
                        dir = %job_dir.display(),
                        error = %rm_err,
                        "failed to remove job directory"
                    );
                }
            }
            return Err(err);
        }

        self.complete(job, &validation_dir).await
    }

    /// Everything up to (not including) the ledger write. `Err` means infrastructure failure.
    async fn run(&self, job: &JobMessage, validation_dir: &Path) -> anyhow::Result<RunOutcome> {
        let job_dir = match workdir::job_dir(validation_dir, &job.validator_id) {
            Ok(dir) => dir,
            Err(err) => return Ok(RunOutcome::Failed(err.to_string())),
        };
        let input_dir = job_dir.join(workdir::INPUT_DIR);
        let output_dir = job_dir.join(workdir::OUTPUT_DIR);
        for dir in [&output_dir, &input_dir] {
            workdir::create_dir_all(dir)
                .await
                .with_context(|| format!("create job dir {}", dir.display()))?;
        }

        // Never read a manifest left behind by an earlier delivery.
        let result_path = output_dir.join(workdir::RESULT_MANIFEST);
        match tokio::fs::remove_file(&result_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("remove stale {}", result_path.display()))
            }
        }

        let Some(descriptor) = self.registry.get(&job.validator_id) else {
            return Ok(RunOutcome::Failed(format!(
                "validator {} no longer found as a valid validator",
                job.validator_id
            )));
        };

        let Some(input) = ValidatorInput::for_mode(&descriptor.mode, &job.files) else {
            return Ok(RunOutcome::Failed(format!(
                "validator has unknown mode: {}",
                descriptor.mode
            )));
        };

        let input_path = input_dir.join(workdir::INPUT_MANIFEST);
        let input_bytes = serde_json::to_vec(&input).context("encode validator input")?;
        tokio::fs::write(&input_path, input_bytes)
            .await
            .with_context(|| format!("write {}", input_path.display()))?;

        let run = SandboxRun {
            image: descriptor.image.clone(),
            job_dir: job_dir.clone(),
            files_dir: workdir::files_dir(validation_dir),
        };
        tracing::debug!(
            event = "validation.execute.run",
            validation_id = %job.validation_id,
            validator_id = %job.validator_id,
            image = %run.image.display(),
            files = job.files.len(),
            "running validator"
        );
        if let Err(err) = self.sandbox.run(&run).await {
            return Ok(RunOutcome::Failed(format!(
                "failed to execute run command due to: {err}"
            )));
        }

        let raw = match tokio::fs::read(&result_path).await {
            Ok(raw) => raw,
            Err(err) => {
                return Ok(RunOutcome::Failed(format!(
                    "failed to read result file: {err}"
                )))
            }
        };
        Ok(match serde_json::from_slice::<ValidatorOutput>(&raw) {
            Ok(output) => RunOutcome::Reported(output),
            Err(err) => RunOutcome::Failed(format!("failed to parse result file: {err}")),
        })
    }

    /// Write every file's outcome for this (validation, validator) pair in one transaction.
    async fn record(&self, job: &JobMessage, outcome: RunOutcome) -> anyhow::Result<()> {
        let updates = file_updates(job, &outcome, Utc::now());

        let mut tx = self
            .ledger
            .begin()
            .await
            .map_err(Error::into_anyhow)
            .context("begin ledger tx")?;
        for update in &updates {
            tx.update_file_validation_job(update)
                .await
                .map_err(Error::into_anyhow)
                .with_context(|| format!("update file_id={}", update.file_id))?;
        }
        tx.commit().await.map_err(Error::into_anyhow)?;

        tracing::info!(
            event = "validation.execute.recorded",
            validation_id = %job.validation_id,
            validator_id = %job.validator_id,
            result = %updates.first().map(|u| u.validator_result).unwrap_or(JobResult::Error),
            files = updates.len(),
            "validator outcome recorded"
        );
        Ok(())
    }

    /// Remove the validation's working directory once no row is pending anymore.
    async fn complete(&self, job: &JobMessage, validation_dir: &Path) -> anyhow::Result<()> {
        let done = self
            .ledger
            .all_validation_jobs_done(&job.validation_id)
            .await
            .map_err(Error::into_anyhow)
            .with_context(|| format!("check validation done validation_id={}", job.validation_id))?;
        if !done {
            return Ok(());
        }

        match workdir::remove_dir_all(validation_dir).await {
            Ok(()) => tracing::info!(
                event = "validation.execute.workdir_removed",
                validation_id = %job.validation_id,
                dir = %validation_dir.display(),
                "validation finished; working directory removed"
            ),
            Err(err) => tracing::error!(
                event = "validation.execute.workdir_remove_failed",
                validation_id = %job.validation_id,
                dir = %validation_dir.display(),
                error = %err,
                "failed to remove working directory of finished validation"
            ),
        }
        Ok(())
    }
}

fn file_updates(
    job: &JobMessage,
    outcome: &RunOutcome,
    finished_at: DateTime<Utc>,
) -> Vec<FileValidationJobUpdate> {
    let update = |file_id: &str, file_result, file_messages, validator_result, validator_messages| {
        FileValidationJobUpdate {
            validation_id: job.validation_id.clone(),
            validator_id: job.validator_id.clone(),
            file_id: file_id.to_string(),
            file_result,
            file_messages,
            finished_at,
            validator_result,
            validator_messages,
        }
    };

    match outcome {
        RunOutcome::Failed(reason) => {
            let messages = vec![Message::error(reason.clone())];
            job.files
                .iter()
                .map(|file| {
                    update(
                        &file.file_id,
                        JobResult::Error,
                        Vec::new(),
                        JobResult::Error,
                        messages.clone(),
                    )
                })
                .collect()
        }
        RunOutcome::Reported(output) => {
            let mut validator_messages = output.messages();
            let validator_result = reported_result(&output.result).unwrap_or_else(|| {
                validator_messages.push(Message::error(format!(
                    "validator reported unknown result: {}",
                    output.result
                )));
                JobResult::Error
            });

            job.files
                .iter()
                .map(|file| {
                    let (file_result, file_messages) = match output.file(&file.file_path) {
                        Some(entry) => {
                            let mut messages = entry.messages();
                            let result = reported_result(&entry.result).unwrap_or_else(|| {
                                messages.push(Message::error(format!(
                                    "validator reported unknown result: {}",
                                    entry.result
                                )));
                                JobResult::Error
                            });
                            (result, messages)
                        }
                        None => (
                            JobResult::Error,
                            vec![Message::error(FILE_RESULT_NOT_FOUND)],
                        ),
                    };
                    update(
                        &file.file_id,
                        file_result,
                        file_messages,
                        validator_result,
                        validator_messages.clone(),
                    )
                })
                .collect()
        }
    }
}

#[async_trait]
impl MessageHandler for JobExecutionService {
    async fn handle(&self, message: &QueueMessage) -> anyhow::Result<()> {
        let job: JobMessage = match serde_json::from_value(message.payload.clone()) {
            Ok(job) => job,
            Err(err) => {
                tracing::warn!(
                    event = "validation.execute.invalid_message",
                    message_id = %message.message_id,
                    error = %err,
                    "dropping undecodable job message"
                );
                return Ok(());
            }
        };

        self.execute(&job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };
    use validation_core::{
        lite::memory::MemoryLedger,
        model::{FileInformation, NewFileValidationJob},
        validators::{ValidatorDescriptor, ValidatorMode},
    };

    enum Script {
        Write(serde_json::Value),
        WriteRaw(&'static str),
        Exit(&'static str),
        Silent,
    }

    struct FakeSandbox {
        script: Script,
        runs: AtomicUsize,
        inputs: Mutex<Vec<serde_json::Value>>,
    }

    impl FakeSandbox {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                runs: AtomicUsize::new(0),
                inputs: Mutex::new(Vec::new()),
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        async fn describe(&self, _image: &Path) -> Result<ValidatorDescriptor> {
            Err(Error::msg("describe is not scripted"))
        }

        async fn run(&self, run: &SandboxRun) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let input = std::fs::read(run.job_dir.join("input/input.json"))?;
            self.inputs
                .lock()
                .unwrap()
                .push(serde_json::from_slice(&input).map_err(anyhow::Error::from)?);

            let result = run.job_dir.join("output/result.json");
            match &self.script {
                Script::Write(value) => std::fs::write(result, value.to_string())?,
                Script::WriteRaw(raw) => std::fs::write(result, raw)?,
                Script::Exit(stderr) => {
                    return Err(Error::msg(format!("validator exited with status 1: {stderr}")))
                }
                Script::Silent => {}
            }
            Ok(())
        }
    }

    fn descriptor(id: &str, mode: ValidatorMode) -> ValidatorDescriptor {
        ValidatorDescriptor {
            validator_id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            version: "1.0.0".to_string(),
            mode,
            path_specification: Vec::new(),
            image: PathBuf::from(format!("/validators/{id}.sif")),
        }
    }

    const FILES: [(&str, &str); 3] = [("f1", "a"), ("f2", "b"), ("f3", "c")];

    struct Fixture {
        tmp: tempfile::TempDir,
        ledger: Arc<MemoryLedger>,
        sandbox: Arc<FakeSandbox>,
        service: JobExecutionService,
    }

    impl Fixture {
        fn validation_dir(&self) -> PathBuf {
            self.tmp.path().join("v1")
        }

        fn job(&self, validator_id: &str) -> JobMessage {
            JobMessage {
                validation_id: "v1".to_string(),
                validator_id: validator_id.to_string(),
                working_directory: self.validation_dir().to_string_lossy().into_owned(),
                files: FILES
                    .iter()
                    .map(|(id, path)| FileInformation {
                        file_id: id.to_string(),
                        file_path: path.to_string(),
                        size: 1,
                    })
                    .collect(),
            }
        }

        fn results(&self, validator_id: &str) -> Vec<(String, JobResult, JobResult)> {
            self.ledger
                .rows("v1")
                .into_iter()
                .filter(|r| r.validator_id == validator_id)
                .map(|r| (r.file_path, r.file_result, r.validator_result))
                .collect()
        }
    }

    async fn fixture(
        registered: Vec<ValidatorDescriptor>,
        seeded: &[&str],
        script: Script,
    ) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("v1/files")).unwrap();

        let ledger = Arc::new(MemoryLedger::new());
        let now = Utc::now();
        let mut tx = ledger.begin().await.unwrap();
        for validator in seeded {
            for (file_id, path) in FILES {
                tx.insert_file_validation_job(&NewFileValidationJob {
                    validation_id: "v1".to_string(),
                    validator_id: validator.to_string(),
                    file_id: file_id.to_string(),
                    file_path: path.to_string(),
                    submission_file_size: 1,
                    submission_user: "alice".to_string(),
                    triggered_by: "alice".to_string(),
                    started_at: now,
                })
                .await
                .unwrap();
            }
        }
        tx.commit().await.unwrap();

        let sandbox = FakeSandbox::new(script);
        let service = JobExecutionService::builder()
            .ledger(ledger.clone())
            .registry(Arc::new(ValidatorRegistry::from_descriptors(registered)))
            .sandbox(sandbox.clone())
            .build()
            .unwrap();
        Fixture {
            tmp,
            ledger,
            sandbox,
            service,
        }
    }

    fn row(path: &str, file: JobResult, validator: JobResult) -> (String, JobResult, JobResult) {
        (path.to_string(), file, validator)
    }

    #[tokio::test]
    async fn failed_manifest_is_mirrored_and_workdir_removed() {
        let f = fixture(
            vec![descriptor("fmt", ValidatorMode::PerFile)],
            &["fmt"],
            Script::Write(serde_json::json!({
                "result": "failed",
                "files": [
                    {"path": "/mnt/input/data/a", "result": "passed", "messages": []},
                    {"path": "/mnt/input/data/b", "result": "passed", "messages": []},
                    {"path": "/mnt/input/data/c", "result": "failed",
                     "messages": [{"level": "error", "time": "2026-01-01T00:00:00Z", "message": "bad header"}]}
                ],
                "messages": []
            })),
        )
        .await;

        f.service.execute(&f.job("fmt")).await.unwrap();

        assert_eq!(
            f.results("fmt"),
            vec![
                row("a", JobResult::Passed, JobResult::Failed),
                row("b", JobResult::Passed, JobResult::Failed),
                row("c", JobResult::Failed, JobResult::Failed),
            ]
        );
        let c = &f.ledger.rows("v1")[2];
        assert_eq!(c.file_messages[0].message, "bad header");
        assert!(f.ledger.all_validation_jobs_done("v1").await.unwrap());
        assert!(!f.validation_dir().exists());
    }

    #[tokio::test]
    async fn sandbox_failure_marks_every_file_error() {
        let f = fixture(
            vec![descriptor("fmt", ValidatorMode::PerFile)],
            &["fmt"],
            Script::Exit("boom"),
        )
        .await;

        f.service.execute(&f.job("fmt")).await.unwrap();

        let rows = f.ledger.rows("v1");
        assert!(rows
            .iter()
            .all(|r| r.file_result == JobResult::Error && r.validator_result == JobResult::Error));
        assert!(rows[0].validator_messages[0].message.contains("boom"));
        assert!(!f.validation_dir().exists(), "completion check still runs");
    }

    #[tokio::test]
    async fn unknown_mode_never_invokes_the_sandbox() {
        let f = fixture(
            vec![descriptor(
                "odd",
                ValidatorMode::Unrecognized("directory".to_string()),
            )],
            &["odd"],
            Script::Silent,
        )
        .await;

        f.service.execute(&f.job("odd")).await.unwrap();

        assert_eq!(f.sandbox.runs(), 0);
        let rows = f.ledger.rows("v1");
        assert!(rows.iter().all(|r| r.file_result == JobResult::Error));
        assert_eq!(
            rows[0].validator_messages[0].message,
            "validator has unknown mode: directory"
        );
    }

    #[tokio::test]
    async fn unregistered_validator_is_recorded_not_retried() {
        let f = fixture(vec![], &["gone"], Script::Silent).await;

        f.service.execute(&f.job("gone")).await.unwrap();

        assert_eq!(f.sandbox.runs(), 0);
        assert!(f
            .results("gone")
            .iter()
            .all(|(_, file, validator)| *file == JobResult::Error
                && *validator == JobResult::Error));
    }

    #[tokio::test]
    async fn missing_entry_errors_only_that_file() {
        let f = fixture(
            vec![descriptor("fmt", ValidatorMode::PerFile)],
            &["fmt"],
            Script::Write(serde_json::json!({
                "result": "passed",
                "files": [
                    {"path": "/mnt/input/data/a", "result": "passed"},
                    {"path": "/mnt/input/data/c", "result": "passed"}
                ],
                "messages": [{"level": "info", "time": "2026-01-01T00:00:00Z", "message": "2 files checked"}]
            })),
        )
        .await;

        f.service.execute(&f.job("fmt")).await.unwrap();

        assert_eq!(
            f.results("fmt"),
            vec![
                row("a", JobResult::Passed, JobResult::Passed),
                row("b", JobResult::Error, JobResult::Passed),
                row("c", JobResult::Passed, JobResult::Passed),
            ]
        );
        let b = &f.ledger.rows("v1")[1];
        assert_eq!(b.file_messages[0].message, FILE_RESULT_NOT_FOUND);
        assert_eq!(b.validator_messages[0].message, "2 files checked");
    }

    #[tokio::test]
    async fn unparseable_manifest_is_an_error_outcome() {
        let f = fixture(
            vec![descriptor("fmt", ValidatorMode::PerFile)],
            &["fmt"],
            Script::WriteRaw("{not json"),
        )
        .await;

        f.service.execute(&f.job("fmt")).await.unwrap();

        let rows = f.ledger.rows("v1");
        assert!(rows[0].validator_messages[0]
            .message
            .starts_with("failed to parse result file"));
    }

    #[tokio::test]
    async fn missing_manifest_is_an_error_outcome() {
        let f = fixture(
            vec![descriptor("fmt", ValidatorMode::PerFile)],
            &["fmt"],
            Script::Silent,
        )
        .await;

        f.service.execute(&f.job("fmt")).await.unwrap();

        assert!(f.ledger.rows("v1")[0].validator_messages[0]
            .message
            .starts_with("failed to read result file"));
    }

    #[tokio::test]
    async fn structure_validator_receives_bare_paths() {
        let f = fixture(
            vec![descriptor("tree", ValidatorMode::FileStructureOnly)],
            &["tree"],
            Script::Write(serde_json::json!({"result": "passed", "files": [], "messages": []})),
        )
        .await;

        f.service.execute(&f.job("tree")).await.unwrap();

        let inputs = f.sandbox.inputs.lock().unwrap();
        assert_eq!(
            inputs[0],
            serde_json::json!({
                "files": [],
                "paths": ["/mnt/input/data/a", "/mnt/input/data/b", "/mnt/input/data/c"],
                "config": {}
            })
        );
    }

    #[tokio::test]
    async fn last_validator_out_removes_the_workdir() {
        let f = fixture(
            vec![
                descriptor("fmt", ValidatorMode::PerFile),
                descriptor("tree", ValidatorMode::FileStructureOnly),
            ],
            &["fmt", "tree"],
            Script::Exit("boom"),
        )
        .await;

        f.service.execute(&f.job("fmt")).await.unwrap();
        assert!(f.validation_dir().join("files").is_dir());
        assert!(!f.ledger.all_validation_jobs_done("v1").await.unwrap());

        f.service.execute(&f.job("tree")).await.unwrap();
        assert!(!f.validation_dir().exists());

        // Redelivery after the directory is gone: rows stay terminal, nothing fails.
        f.service.execute(&f.job("tree")).await.unwrap();
        assert!(f.ledger.all_validation_jobs_done("v1").await.unwrap());
    }

    #[tokio::test]
    async fn scratch_failure_requeues_and_leaves_rows_pending() {
        let f = fixture(
            vec![descriptor("fmt", ValidatorMode::PerFile)],
            &["fmt"],
            Script::Silent,
        )
        .await;
        // A regular file where the job directory should go.
        std::fs::write(f.validation_dir().join("fmt"), b"").unwrap();

        assert!(f.service.execute(&f.job("fmt")).await.is_err());
        assert_eq!(f.sandbox.runs(), 0);
        assert!(f
            .ledger
            .rows("v1")
            .iter()
            .all(|r| r.finished_at.is_none()));
    }

    #[tokio::test]
    async fn undecodable_job_is_dropped() {
        let f = fixture(vec![], &["fmt"], Script::Silent).await;
        let message = QueueMessage {
            ack_token: "t".to_string(),
            message_id: "m".to_string(),
            queue_name: "validation-jobs".to_string(),
            payload: serde_json::json!({"validation_id": 1}),
            deliveries: 1,
        };

        f.service.handle(&message).await.unwrap();
        assert_eq!(f.sandbox.runs(), 0);
    }
}
