use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

use crate::{sandbox::Sandbox, Error, Result};

/// How a validator consumes the files of a validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ValidatorMode {
    /// Each file is validated on its own (`file`).
    PerFile,
    /// Files are validated in pairs (`file-pair`).
    FilePair,
    /// Only the file tree is inspected, content is never read (`file-structure`).
    FileStructureOnly,
    /// A mode this orchestrator does not know how to drive.
    Unrecognized(String),
}

impl ValidatorMode {
    pub fn as_str(&self) -> &str {
        match self {
            ValidatorMode::PerFile => "file",
            ValidatorMode::FilePair => "file-pair",
            ValidatorMode::FileStructureOnly => "file-structure",
            ValidatorMode::Unrecognized(mode) => mode,
        }
    }

    pub fn requires_file_content(&self) -> bool {
        !matches!(self, ValidatorMode::FileStructureOnly)
    }
}

impl From<String> for ValidatorMode {
    fn from(value: String) -> Self {
        match value.as_str() {
            "file" => ValidatorMode::PerFile,
            "file-pair" => ValidatorMode::FilePair,
            "file-structure" => ValidatorMode::FileStructureOnly,
            _ => ValidatorMode::Unrecognized(value),
        }
    }
}

impl From<ValidatorMode> for String {
    fn from(value: ValidatorMode) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ValidatorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of a validator's describe invocation, plus where the validator image lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorDescriptor {
    #[serde(rename = "validatorId", alias = "validatorID")]
    pub validator_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
    pub mode: ValidatorMode,
    #[serde(default)]
    pub path_specification: Vec<String>,

    #[serde(skip)]
    pub image: PathBuf,
}

impl ValidatorDescriptor {
    pub fn requires_file_content(&self) -> bool {
        self.mode.requires_file_content()
    }
}

/// Static set of validators known to this process, keyed by validator id.
#[derive(Debug, Clone, Default)]
pub struct ValidatorRegistry {
    by_id: BTreeMap<String, ValidatorDescriptor>,
}

impl ValidatorRegistry {
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = ValidatorDescriptor>) -> Self {
        let by_id = descriptors
            .into_iter()
            .map(|d| (d.validator_id.clone(), d))
            .collect();
        Self { by_id }
    }

    /// Describe every validator image and register it under the id it reports.
    pub async fn load(paths: &[PathBuf], sandbox: &dyn Sandbox) -> Result<Self> {
        let mut by_id = BTreeMap::new();
        for path in paths {
            tokio::fs::metadata(path)
                .await
                .with_context(|| format!("stat validator image {}", path.display()))
                .map_err(Error::from)?;

            let descriptor = sandbox.describe(path).await.map_err(|err| {
                Error::from(
                    err.into_anyhow()
                        .context(format!("describe validator {}", path.display())),
                )
            })?;

            tracing::info!(
                event = "validation.registry.loaded",
                validator_id = %descriptor.validator_id,
                version = %descriptor.version,
                mode = %descriptor.mode,
                image = %path.display(),
                "validator registered"
            );
            by_id.insert(descriptor.validator_id.clone(), descriptor);
        }
        Ok(Self { by_id })
    }

    pub fn get(&self, validator_id: &str) -> Option<&ValidatorDescriptor> {
        self.by_id.get(validator_id)
    }

    /// True if any known validator among `validator_ids` reads file bytes.
    ///
    /// Ids missing from the registry do not count; their execution jobs fail on their own.
    pub fn requires_file_content<S: AsRef<str>>(&self, validator_ids: &[S]) -> bool {
        validator_ids
            .iter()
            .filter_map(|id| self.get(id.as_ref()))
            .any(ValidatorDescriptor::requires_file_content)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidatorDescriptor> {
        self.by_id.values()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Parse the JSON a validator prints for `--describe`.
pub fn parse_descriptor(bytes: &[u8], image: &Path) -> Result<ValidatorDescriptor> {
    let mut descriptor: ValidatorDescriptor = serde_json::from_slice(bytes)
        .context("decode describe output")
        .map_err(Error::from)?;
    descriptor.image = image.to_path_buf();
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn mode_wire_names() {
        assert_eq!(ValidatorMode::from("file".to_string()), ValidatorMode::PerFile);
        assert_eq!(
            ValidatorMode::from("file-pair".to_string()),
            ValidatorMode::FilePair
        );
        assert_eq!(
            ValidatorMode::from("file-structure".to_string()),
            ValidatorMode::FileStructureOnly
        );
        assert_eq!(
            ValidatorMode::from("directory".to_string()),
            ValidatorMode::Unrecognized("directory".to_string())
        );
    }

    #[test]
    fn only_structure_mode_skips_content() {
        assert!(ValidatorMode::PerFile.requires_file_content());
        assert!(ValidatorMode::FilePair.requires_file_content());
        assert!(!ValidatorMode::FileStructureOnly.requires_file_content());
        assert!(ValidatorMode::Unrecognized("x".to_string()).requires_file_content());
    }

    #[test]
    fn parse_describe_output() {
        let out = br#"{
            "validatorId": "csv-header",
            "name": "CSV header check",
            "description": "checks headers",
            "version": "0.3.1",
            "mode": "file-structure",
            "pathSpecification": ["*.csv"]
        }"#;
        let d = parse_descriptor(out, Path::new("/validators/csv.sif")).unwrap();
        assert_eq!(d.validator_id, "csv-header");
        assert_eq!(d.mode, ValidatorMode::FileStructureOnly);
        assert_eq!(d.path_specification, vec!["*.csv".to_string()]);
        assert_eq!(d.image, PathBuf::from("/validators/csv.sif"));
    }

    #[test]
    fn registry_requires_content_if_any_validator_does() {
        let registry = ValidatorRegistry::from_descriptors([
            descriptor("tree", ValidatorMode::FileStructureOnly),
            descriptor("fmt", ValidatorMode::PerFile),
        ]);

        assert!(!registry.requires_file_content(&["tree"]));
        assert!(registry.requires_file_content(&["tree", "fmt"]));
        assert!(!registry.requires_file_content(&["tree", "gone"]));
        assert_eq!(registry.len(), 2);
    }
}
