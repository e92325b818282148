//! In-process queue and ledger.
//!
//! Both keep the observable semantics of their Postgres counterparts (visibility timeouts,
//! delivery counts, transactional ledger writes) so services can be exercised without a database.

use crate::{
    ledger::{Ledger, LedgerTx},
    model::{
        FileInformation, FileResult, FileValidationJobUpdate, JobResult, Message,
        NewFileValidationJob, ValidationInformation, ValidationResult, ValidatorResult,
    },
    Error, Queue, QueueMessage, Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: Uuid,
    payload: Value,
    available_at: DateTime<Utc>,
    invisible_until: Option<DateTime<Utc>>,
    deliveries: i32,
    seq: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    queues: HashMap<String, Vec<StoredMessage>>,
    next_seq: u64,
}

#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages stored on `queue`, including ones currently hidden by a receive.
    pub fn len(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    /// Payloads stored on `queue` in publish order.
    pub fn peek(&self, queue: &str) -> Vec<Value> {
        let state = lock(&self.state);
        let mut stored: Vec<&StoredMessage> = state
            .queues
            .get(queue)
            .map(|msgs| msgs.iter().collect())
            .unwrap_or_default();
        stored.sort_by_key(|m| m.seq);
        stored.into_iter().map(|m| m.payload.clone()).collect()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn publish(
        &self,
        queue: &str,
        payload: Value,
        available_at: DateTime<Utc>,
    ) -> Result<String> {
        let mut state = lock(&self.state);
        let seq = state.next_seq;
        state.next_seq += 1;

        let message_id = Uuid::new_v4();
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push(StoredMessage {
                message_id,
                payload,
                available_at,
                invisible_until: None,
                deliveries: 0,
                seq,
            });
        Ok(message_id.to_string())
    }

    async fn receive(
        &self,
        queue: &str,
        max: i64,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>> {
        let now = Utc::now();
        let mut state = lock(&self.state);
        let Some(messages) = state.queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let mut visible: Vec<&mut StoredMessage> = messages
            .iter_mut()
            .filter(|m| m.available_at <= now && m.invisible_until.map_or(true, |t| t <= now))
            .collect();
        visible.sort_by_key(|m| (m.available_at, m.seq));

        let limit = usize::try_from(max.max(0)).unwrap_or(usize::MAX);
        Ok(visible
            .into_iter()
            .take(limit)
            .map(|m| {
                m.invisible_until = Some(after(now, visibility_timeout));
                m.deliveries += 1;
                QueueMessage {
                    ack_token: m.message_id.to_string(),
                    message_id: m.message_id.to_string(),
                    queue_name: queue.to_string(),
                    payload: m.payload.clone(),
                    deliveries: m.deliveries,
                }
            })
            .collect())
    }

    async fn ack(&self, ack_token: &str) -> Result<()> {
        let id = parse_token(ack_token)?;
        let mut state = lock(&self.state);
        for messages in state.queues.values_mut() {
            messages.retain(|m| m.message_id != id);
        }
        Ok(())
    }

    async fn nack_or_requeue(&self, ack_token: &str, delay: Duration) -> Result<()> {
        let id = parse_token(ack_token)?;
        let now = Utc::now();
        let mut state = lock(&self.state);
        for message in state.queues.values_mut().flatten() {
            if message.message_id == id {
                message.available_at = after(now, delay);
                message.invisible_until = None;
            }
        }
        Ok(())
    }
}

fn parse_token(ack_token: &str) -> Result<Uuid> {
    Uuid::parse_str(ack_token)
        .map_err(|err| Error::msg(format!("invalid ack token '{ack_token}': {err}")))
}

/// One stored `file_validation_job` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRow {
    pub validation_id: String,
    pub validator_id: String,
    pub file_id: String,
    pub file_path: String,
    pub submission_file_size: i64,
    pub submission_user: String,
    pub triggered_by: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub file_result: JobResult,
    pub file_messages: Vec<Message>,
    pub validator_result: JobResult,
    pub validator_messages: Vec<Message>,
}

impl LedgerRow {
    fn key(&self) -> (&str, &str, &str) {
        (&self.validation_id, &self.validator_id, &self.file_id)
    }
}

#[derive(Debug, Default, Clone)]
pub struct MemoryLedger {
    rows: Arc<Mutex<Vec<LedgerRow>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows of a validation, ordered like the Postgres ledger reads them.
    pub fn rows(&self, validation_id: &str) -> Vec<LedgerRow> {
        let mut rows: Vec<LedgerRow> = lock(&self.rows)
            .iter()
            .filter(|r| r.validation_id == validation_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (a.started_at, &a.validator_id, &a.file_path).cmp(&(
                b.started_at,
                &b.validator_id,
                &b.file_path,
            ))
        });
        rows
    }
}

enum PendingWrite {
    Insert(NewFileValidationJob),
    Update(FileValidationJobUpdate),
}

pub struct MemoryLedgerTx {
    rows: Arc<Mutex<Vec<LedgerRow>>>,
    writes: Vec<PendingWrite>,
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        Ok(Box::new(MemoryLedgerTx {
            rows: self.rows.clone(),
            writes: Vec::new(),
        }))
    }

    async fn read_validation_information(
        &self,
        validation_id: &str,
    ) -> Result<Option<ValidationInformation>> {
        let pending: Vec<LedgerRow> = self
            .rows(validation_id)
            .into_iter()
            .filter(|r| r.finished_at.is_none())
            .collect();
        let Some(first) = pending.first() else {
            return Ok(None);
        };

        let mut info = ValidationInformation {
            validation_id: first.validation_id.clone(),
            validator_ids: Vec::new(),
            submission_user: first.submission_user.clone(),
            files: Vec::new(),
        };
        let mut seen_validators = HashSet::new();
        let mut seen_files = HashSet::new();
        for row in &pending {
            if seen_validators.insert(row.validator_id.clone()) {
                info.validator_ids.push(row.validator_id.clone());
            }
            if seen_files.insert(row.file_id.clone()) {
                info.files.push(FileInformation {
                    file_id: row.file_id.clone(),
                    file_path: row.file_path.clone(),
                    size: row.submission_file_size,
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
        let mut rows: Vec<LedgerRow> = self
            .rows(validation_id)
            .into_iter()
            .filter(|r| user_id.map_or(true, |u| r.submission_user == u))
            .collect();
        if rows.is_empty() {
            return Ok(None);
        }
        rows.sort_by(|a, b| (&a.validator_id, &a.file_path).cmp(&(&b.validator_id, &b.file_path)));

        let mut validator_results: Vec<ValidatorResult> = Vec::new();
        for row in rows {
            let file = FileResult {
                path: row.file_path.clone(),
                result: row.file_result,
                messages: row.file_messages.clone(),
            };
            match validator_results.last_mut() {
                Some(current) if current.validator_id == row.validator_id => {
                    current.files.push(file)
                }
                _ => validator_results.push(ValidatorResult {
                    validator_id: row.validator_id,
                    result: row.validator_result,
                    started_at: row.started_at,
                    finished_at: row.finished_at,
                    messages: row.validator_messages,
                    files: vec![file],
                }),
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
        let now = Utc::now();
        let mut rows = lock(&self.rows);
        for row in rows
            .iter_mut()
            .filter(|r| r.validation_id == validation_id && r.finished_at.is_none())
        {
            row.finished_at = Some(now);
            row.file_result = JobResult::Error;
            row.file_messages = Vec::new();
            row.validator_result = JobResult::Error;
            row.validator_messages = vec![message.clone()];
        }
        Ok(())
    }

    async fn all_validation_jobs_done(&self, validation_id: &str) -> Result<bool> {
        Ok(lock(&self.rows)
            .iter()
            .filter(|r| r.validation_id == validation_id)
            .all(|r| r.finished_at.is_some()))
    }
}

#[async_trait]
impl LedgerTx for MemoryLedgerTx {
    async fn insert_file_validation_job(&mut self, job: &NewFileValidationJob) -> Result<()> {
        self.writes.push(PendingWrite::Insert(job.clone()));
        Ok(())
    }

    async fn update_file_validation_job(
        &mut self,
        update: &FileValidationJobUpdate,
    ) -> Result<()> {
        self.writes.push(PendingWrite::Update(update.clone()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut rows = lock(&self.rows);
        // Apply to a copy so a failing write leaves the ledger untouched.
        let mut next = rows.clone();
        for write in &self.writes {
            match write {
                PendingWrite::Insert(job) => {
                    let key = (
                        job.validation_id.as_str(),
                        job.validator_id.as_str(),
                        job.file_id.as_str(),
                    );
                    if next.iter().any(|r| r.key() == key) {
                        return Err(Error::msg(format!(
                            "duplicate file_validation_job validation_id={} validator_id={} file_id={}",
                            job.validation_id, job.validator_id, job.file_id
                        )));
                    }
                    next.push(LedgerRow {
                        validation_id: job.validation_id.clone(),
                        validator_id: job.validator_id.clone(),
                        file_id: job.file_id.clone(),
                        file_path: job.file_path.clone(),
                        submission_file_size: job.submission_file_size,
                        submission_user: job.submission_user.clone(),
                        triggered_by: job.triggered_by.clone(),
                        started_at: job.started_at,
                        finished_at: None,
                        file_result: JobResult::Pending,
                        file_messages: Vec::new(),
                        validator_result: JobResult::Pending,
                        validator_messages: Vec::new(),
                    });
                }
                PendingWrite::Update(update) => {
                    let key = (
                        update.validation_id.as_str(),
                        update.validator_id.as_str(),
                        update.file_id.as_str(),
                    );
                    if let Some(row) = next
                        .iter_mut()
                        .find(|r| r.key() == key && r.finished_at.is_none())
                    {
                        row.finished_at = Some(update.finished_at);
                        row.file_result = update.file_result;
                        row.file_messages = update.file_messages.clone();
                        row.validator_result = update.validator_result;
                        row.validator_messages = update.validator_messages.clone();
                    }
                }
            }
        }
        *rows = next;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
