use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::{validators::ValidatorDescriptor, Result};

/// One validator run inside the sandbox.
#[derive(Debug, Clone)]
pub struct SandboxRun {
    /// Validator image to run.
    pub image: PathBuf,

    /// The job's scratch directory, mounted as the sandbox root (`/mnt`). Holds `input/` and
    /// `output/`.
    pub job_dir: PathBuf,

    /// The validation's shared staged files, mounted read-only at `/mnt/input/data`.
    pub files_dir: PathBuf,
}

/// Isolated, network-less execution of validator images.
///
/// The sandbox only runs the validator; writing the input manifest and reading the result
/// manifest is the caller's job.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn describe(&self, image: &Path) -> Result<ValidatorDescriptor>;

    /// Run a validator to completion. Any error (spawn failure, non-zero exit, timeout) means
    /// the run produced no trustworthy output.
    async fn run(&self, run: &SandboxRun) -> Result<()>;
}
