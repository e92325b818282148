//! Transactional contract over the `file_validation_job` table.
//!
//! One row exists per (validation, validator, file). A row moves from `pending` to exactly one
//! terminal result and stays there; callers never re-read a row before writing it, so a
//! successful commit is the only event that may mark rows finished.

use async_trait::async_trait;

use crate::{
    model::{
        FileValidationJobUpdate, Message, NewFileValidationJob, ValidationInformation,
        ValidationResult,
    },
    Result,
};

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Start a transaction. Dropping the returned scope without [`LedgerTx::commit`] rolls it
    /// back.
    async fn begin(&self) -> Result<Box<dyn LedgerTx>>;

    /// Pending rows of a validation, aggregated into distinct validators and files.
    ///
    /// Returns `None` when the validation has no pending rows.
    async fn read_validation_information(
        &self,
        validation_id: &str,
    ) -> Result<Option<ValidationInformation>>;

    /// Every row of a validation grouped per validator, optionally restricted to rows submitted
    /// by `user_id`. Returns `None` when nothing matches.
    async fn read_validation_result(
        &self,
        validation_id: &str,
        user_id: Option<&str>,
    ) -> Result<Option<ValidationResult>>;

    /// Mark every still-pending row of a validation as `error` with `message`.
    async fn update_all_validation_job_files_on_error(
        &self,
        validation_id: &str,
        message: &Message,
    ) -> Result<()>;

    /// True iff no row of the validation has a null `finished_at`.
    async fn all_validation_jobs_done(&self, validation_id: &str) -> Result<bool>;
}

#[async_trait]
pub trait LedgerTx: Send {
    async fn insert_file_validation_job(&mut self, job: &NewFileValidationJob) -> Result<()>;

    async fn update_file_validation_job(&mut self, update: &FileValidationJobUpdate)
        -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
