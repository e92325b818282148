use serde::{Deserialize, Serialize};
use validation_core::{
    model::{FileInformation, JobResult, Message},
    validators::ValidatorMode,
    workdir,
};

/// `input/input.json`, read by the validator inside the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorInput {
    pub files: Vec<FileInput>,
    pub paths: Vec<String>,
    pub config: ValidatorConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInput {
    pub path: String,
}

/// Validator configuration. No options are defined yet; validators receive `{}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorConfig {}

impl ValidatorInput {
    /// Address `files` at the sandbox data mount the way `mode` expects them.
    ///
    /// Returns `None` for a mode this orchestrator cannot drive.
    pub fn for_mode(mode: &ValidatorMode, files: &[FileInformation]) -> Option<Self> {
        let paths = files.iter().map(|f| workdir::sandbox_data_path(&f.file_path));
        match mode {
            ValidatorMode::PerFile | ValidatorMode::FilePair => Some(Self {
                files: paths.map(|path| FileInput { path }).collect(),
                ..Self::default()
            }),
            ValidatorMode::FileStructureOnly => Some(Self {
                paths: paths.collect(),
                ..Self::default()
            }),
            ValidatorMode::Unrecognized(_) => None,
        }
    }
}

/// `output/result.json`, written by the validator.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ValidatorOutput {
    pub result: String,
    #[serde(default)]
    pub files: Option<Vec<FileOutput>>,
    #[serde(default)]
    pub messages: Option<Vec<Message>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileOutput {
    pub path: String,
    pub result: String,
    #[serde(default)]
    pub messages: Option<Vec<Message>>,
}

impl ValidatorOutput {
    /// Result entry for a requested file, matched after stripping the sandbox data mount.
    pub fn file(&self, file_path: &str) -> Option<&FileOutput> {
        let wanted = file_path.trim_start_matches('/');
        self.files
            .iter()
            .flatten()
            .find(|f| workdir::strip_sandbox_prefix(&f.path) == wanted)
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.clone().unwrap_or_default()
    }
}

impl FileOutput {
    pub fn messages(&self) -> Vec<Message> {
        self.messages.clone().unwrap_or_default()
    }
}

/// A result as reported by a validator. Anything but a terminal result is recorded as `error`.
pub fn reported_result(raw: &str) -> Option<JobResult> {
    JobResult::parse(raw).filter(JobResult::is_terminal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files() -> Vec<FileInformation> {
        vec![
            FileInformation {
                file_id: "f1".to_string(),
                file_path: "a.txt".to_string(),
                size: 1,
            },
            FileInformation {
                file_id: "f2".to_string(),
                file_path: "b/c.txt".to_string(),
                size: 1,
            },
        ]
    }

    #[test]
    fn per_file_modes_list_file_entries() {
        let input = ValidatorInput::for_mode(&ValidatorMode::FilePair, &files()).unwrap();
        assert_eq!(
            serde_json::to_value(&input).unwrap(),
            serde_json::json!({
                "files": [
                    {"path": "/mnt/input/data/a.txt"},
                    {"path": "/mnt/input/data/b/c.txt"}
                ],
                "paths": [],
                "config": {}
            })
        );
    }

    #[test]
    fn structure_mode_lists_bare_paths() {
        let input = ValidatorInput::for_mode(&ValidatorMode::FileStructureOnly, &files()).unwrap();
        assert!(input.files.is_empty());
        assert_eq!(
            input.paths,
            vec!["/mnt/input/data/a.txt", "/mnt/input/data/b/c.txt"]
        );
        assert!(
            ValidatorInput::for_mode(&ValidatorMode::Unrecognized("x".into()), &files()).is_none()
        );
    }

    #[test]
    fn output_tolerates_null_lists_and_matches_by_relative_path() {
        let output: ValidatorOutput = serde_json::from_str(
            r#"{"result": "passed", "files": [{"path": "/mnt/input/data/b/c.txt", "result": "failed", "messages": null}], "messages": null}"#,
        )
        .unwrap();
        assert_eq!(output.file("b/c.txt").unwrap().result, "failed");
        assert!(output.file("a.txt").is_none());
        assert!(output.messages().is_empty());
    }

    #[test]
    fn sibling_of_the_data_mount_matches_no_file() {
        let output: ValidatorOutput = serde_json::from_str(
            r#"{"result": "failed", "files": [{"path": "/mnt/input/dataa", "result": "failed"}]}"#,
        )
        .unwrap();
        assert!(output.file("a").is_none());
    }

    #[test]
    fn only_terminal_results_are_accepted() {
        assert_eq!(reported_result("failed"), Some(JobResult::Failed));
        assert_eq!(reported_result("pending"), None);
        assert_eq!(reported_result("ok"), None);
    }
}
