use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mount point of a job's own scratch directory inside the sandbox.
pub const SANDBOX_ROOT: &str = "/mnt";

/// Mount point of the validation's shared staged files inside the sandbox.
pub const SANDBOX_INPUT_DATA: &str = "/mnt/input/data";

/// Preparation queue payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPreparationMessage {
    pub validation_id: String,
}

/// Execution queue payload: one validator run over the staged files of a validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub validation_id: String,
    pub validator_id: String,
    pub working_directory: String,
    pub files: Vec<FileInformation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInformation {
    pub file_id: String,
    pub file_path: String,
    pub size: i64,
}

/// Projection over the still-pending ledger rows of one validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationInformation {
    pub validation_id: String,
    pub validator_ids: Vec<String>,
    pub submission_user: String,
    pub files: Vec<FileInformation>,
}

/// Outcome of a ledger row, at validator level and at file level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobResult {
    Pending,
    Passed,
    Failed,
    Error,
}

impl JobResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobResult::Pending => "pending",
            JobResult::Passed => "passed",
            JobResult::Failed => "failed",
            JobResult::Error => "error",
        }
    }

    /// Parse a result reported by a validator or read back from the ledger.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobResult::Pending),
            "passed" => Some(JobResult::Passed),
            "failed" => Some(JobResult::Failed),
            "error" => Some(JobResult::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobResult::Pending)
    }
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub time: String,
    pub message: String,
}

impl Message {
    pub fn error(message: impl Into<String>) -> Self {
        Self::at("error", Utc::now(), message)
    }

    pub fn at(level: &str, time: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            level: level.to_string(),
            time: time.to_rfc3339_opts(SecondsFormat::Secs, true),
            message: message.into(),
        }
    }
}

/// Parameters for creating one pending ledger row.
#[derive(Debug, Clone)]
pub struct NewFileValidationJob {
    pub validation_id: String,
    pub validator_id: String,
    pub file_id: String,
    pub file_path: String,
    pub submission_file_size: i64,
    pub submission_user: String,
    pub triggered_by: String,
    pub started_at: DateTime<Utc>,
}

/// Terminal write for one ledger row.
#[derive(Debug, Clone)]
pub struct FileValidationJobUpdate {
    pub validation_id: String,
    pub validator_id: String,
    pub file_id: String,
    pub file_result: JobResult,
    pub file_messages: Vec<Message>,
    pub finished_at: DateTime<Utc>,
    pub validator_result: JobResult,
    pub validator_messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub validation_id: String,
    pub validator_results: Vec<ValidatorResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidatorResult {
    pub validator_id: String,
    pub result: JobResult,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub messages: Vec<Message>,
    pub files: Vec<FileResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileResult {
    pub path: String,
    pub result: JobResult,
    pub messages: Vec<Message>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_message_wire_shape() {
        let msg = JobMessage {
            validation_id: "v1".to_string(),
            validator_id: "fmt".to_string(),
            working_directory: "/work/v1".to_string(),
            files: vec![FileInformation {
                file_id: "f1".to_string(),
                file_path: "a.txt".to_string(),
                size: 12,
            }],
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "validation_id": "v1",
                "validator_id": "fmt",
                "working_directory": "/work/v1",
                "files": [{"file_id": "f1", "file_path": "a.txt", "size": 12}],
            })
        );
    }

    #[test]
    fn job_result_parse_rejects_unknown() {
        assert_eq!(JobResult::parse("passed"), Some(JobResult::Passed));
        assert_eq!(JobResult::parse("PASSED"), None);
        assert!(!JobResult::Pending.is_terminal());
        assert!(JobResult::Error.is_terminal());
    }
}
