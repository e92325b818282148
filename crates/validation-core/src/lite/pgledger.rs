use crate::{
    ledger::{Ledger, LedgerTx},
    model::{
        FileInformation, FileResult, FileValidationJobUpdate, JobResult, Message,
        NewFileValidationJob, ValidationInformation, ValidationResult, ValidatorResult,
    },
    Error, Result,
};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{postgres::PgRow, PgPool, Postgres, Row, Transaction};
use std::collections::HashSet;

/// Job ledger stored in `state.file_validation_job`.
#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl Ledger for PgLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        let tx = self.pool.begin().await.context("begin ledger tx")?;
        Ok(Box::new(PgLedgerTx { tx }))
    }

    async fn read_validation_information(
        &self,
        validation_id: &str,
    ) -> Result<Option<ValidationInformation>> {
        let rows = sqlx::query(
            r#"
            SELECT validation_id, validator_id, file_id, file_path, submission_file_size, submission_user
            FROM state.file_validation_job
            WHERE validation_id = $1
              AND finished_at IS NULL
            ORDER BY started_at, validator_id, file_path
            "#,
        )
        .bind(validation_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("read validation information validation_id={validation_id}"))?;

        let Some(first) = rows.first() else {
            return Ok(None);
        };

        let mut info = ValidationInformation {
            validation_id: first.try_get("validation_id").context("validation_id")?,
            validator_ids: Vec::new(),
            submission_user: first.try_get("submission_user").context("submission_user")?,
            files: Vec::new(),
        };

        let mut seen_validators = HashSet::new();
        let mut seen_files = HashSet::new();
        for row in &rows {
            let validator_id: String = row.try_get("validator_id").context("validator_id")?;
            if seen_validators.insert(validator_id.clone()) {
                info.validator_ids.push(validator_id);
            }

            let file_id: String = row.try_get("file_id").context("file_id")?;
            if seen_files.insert(file_id.clone()) {
                info.files.push(FileInformation {
                    file_id,
                    file_path: row.try_get("file_path").context("file_path")?,
                    size: row
                        .try_get("submission_file_size")
                        .context("submission_file_size")?,
                });
            }
        }

        Ok(Some(info))
    }

    async fn read_validation_result(
        &self,
        validation_id: &str,
        user_id: Option<&str>,
    ) -> Result<Option<ValidationResult>> {
        let rows = sqlx::query(
            r#"
            SELECT validator_id, validator_result, validator_messages, started_at, finished_at,
                   file_path, file_result, file_messages
            FROM state.file_validation_job
            WHERE validation_id = $1
              AND ($2::text IS NULL OR submission_user = $2)
            ORDER BY validator_id, file_path
            "#,
        )
        .bind(validation_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("read validation result validation_id={validation_id}"))?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut validator_results: Vec<ValidatorResult> = Vec::new();
        for row in &rows {
            let validator_id: String = row.try_get("validator_id").context("validator_id")?;
            let file = FileResult {
                path: row.try_get("file_path").context("file_path")?,
                result: result_column(row, "file_result")?,
                messages: messages_column(row, "file_messages")?,
            };

            // Rows are ordered by validator, so a new validator always starts a new group.
            match validator_results.last_mut() {
                Some(current) if current.validator_id == validator_id => {
                    current.files.push(file);
                }
                _ => {
                    let started_at: DateTime<Utc> =
                        row.try_get("started_at").context("started_at")?;
                    let finished_at: Option<DateTime<Utc>> =
                        row.try_get("finished_at").context("finished_at")?;
                    validator_results.push(ValidatorResult {
                        validator_id,
                        result: result_column(row, "validator_result")?,
                        started_at,
                        finished_at,
                        messages: messages_column(row, "validator_messages")?,
                        files: vec![file],
                    });
                }
            }
        }

        Ok(Some(ValidationResult {
            validation_id: validation_id.to_string(),
            validator_results,
        }))
    }

    async fn update_all_validation_job_files_on_error(
        &self,
        validation_id: &str,
        message: &Message,
    ) -> Result<()> {
        let validator_messages = messages_value(std::slice::from_ref(message))?;
        sqlx::query(
            r#"
            UPDATE state.file_validation_job
            SET finished_at = now(),
                file_result = 'error',
                file_messages = '[]'::jsonb,
                validator_result = 'error',
                validator_messages = $2
            WHERE validation_id = $1
              AND finished_at IS NULL
            "#,
        )
        .bind(validation_id)
        .bind(validator_messages)
        .execute(&self.pool)
        .await
        .with_context(|| format!("mark validation on error validation_id={validation_id}"))?;

        Ok(())
    }

    async fn all_validation_jobs_done(&self, validation_id: &str) -> Result<bool> {
        let done: bool = sqlx::query_scalar(
            r#"
            SELECT NOT EXISTS (
              SELECT 1
              FROM state.file_validation_job
              WHERE validation_id = $1
                AND finished_at IS NULL
            )
            "#,
        )
        .bind(validation_id)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("check validation done validation_id={validation_id}"))?;

        Ok(done)
    }
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn insert_file_validation_job(&mut self, job: &NewFileValidationJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO state.file_validation_job (
              validation_id, validator_id, file_id, file_path, submission_file_size,
              submission_user, triggered_by, started_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&job.validation_id)
        .bind(&job.validator_id)
        .bind(&job.file_id)
        .bind(&job.file_path)
        .bind(job.submission_file_size)
        .bind(&job.submission_user)
        .bind(&job.triggered_by)
        .bind(job.started_at)
        .execute(&mut *self.tx)
        .await
        .context("insert file_validation_job")?;

        Ok(())
    }

    async fn update_file_validation_job(
        &mut self,
        update: &FileValidationJobUpdate,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE state.file_validation_job
            SET finished_at = $4,
                file_result = $5,
                file_messages = $6,
                validator_result = $7,
                validator_messages = $8
            WHERE validation_id = $1
              AND validator_id = $2
              AND file_id = $3
              AND finished_at IS NULL
            "#,
        )
        .bind(&update.validation_id)
        .bind(&update.validator_id)
        .bind(&update.file_id)
        .bind(update.finished_at)
        .bind(update.file_result.as_str())
        .bind(messages_value(&update.file_messages)?)
        .bind(update.validator_result.as_str())
        .bind(messages_value(&update.validator_messages)?)
        .execute(&mut *self.tx)
        .await
        .context("update file_validation_job")?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.context("commit ledger tx")?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.context("rollback ledger tx")?;
        Ok(())
    }
}

fn messages_value(messages: &[Message]) -> Result<Value> {
    serde_json::to_value(messages)
        .context("encode messages")
        .map_err(Error::from)
}

fn messages_column(row: &PgRow, column: &str) -> Result<Vec<Message>> {
    let value: Option<Value> = row.try_get(column).with_context(|| column.to_string())?;
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value)
            .with_context(|| format!("decode {column}"))
            .map_err(Error::from),
    }
}

fn result_column(row: &PgRow, column: &str) -> Result<JobResult> {
    let raw: String = row.try_get(column).with_context(|| column.to_string())?;
    JobResult::parse(&raw)
        .ok_or_else(|| Error::from(anyhow!("unknown {column} value '{raw}'")))
}
