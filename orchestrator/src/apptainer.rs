use anyhow::{anyhow, Context};
use async_trait::async_trait;
use std::{ffi::OsString, path::Path, process::Stdio, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
};
use validation_core::{
    model::{SANDBOX_INPUT_DATA, SANDBOX_ROOT},
    sandbox::{Sandbox, SandboxRun},
    validators::{parse_descriptor, ValidatorDescriptor},
    Error, Result,
};

use crate::config::OrchestratorConfig;

/// Runs validator images with Apptainer, without network and with only the job directory and
/// the staged files mounted.
#[derive(Debug, Clone)]
pub struct ApptainerSandbox {
    bin: String,
    timeout: Duration,
    max_stdout_bytes: usize,
    max_stderr_bytes: usize,
}

impl ApptainerSandbox {
    pub fn new(bin: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            timeout: Duration::from_secs(3600),
            max_stdout_bytes: 1024 * 1024,
            max_stderr_bytes: 1024 * 1024,
        }
    }

    pub fn from_config(cfg: &OrchestratorConfig) -> Self {
        Self {
            bin: cfg.apptainer_bin.clone(),
            timeout: cfg.sandbox_timeout(),
            max_stdout_bytes: cfg.sandbox_max_stdout_bytes,
            max_stderr_bytes: cfg.sandbox_max_stderr_bytes,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `args` to completion and return stdout.
    async fn exec(&self, args: Vec<OsString>) -> anyhow::Result<Vec<u8>> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .kill_on_drop(true);

        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {}", self.bin))?;

        let stdout = child.stdout.take().context("take stdout")?;
        let stderr = child.stderr.take().context("take stderr")?;

        let stdout_task =
            tokio::spawn(read_stream_limited(stdout, self.max_stdout_bytes, "stdout"));
        let stderr_task =
            tokio::spawn(read_stream_limited(stderr, self.max_stderr_bytes, "stderr"));

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(res) => res.context("wait sandbox process")?,
            Err(_) => {
                stdout_task.abort();
                stderr_task.abort();
                let _ = child.kill().await;
                let _ = child.wait().await;
                return Err(anyhow!(
                    "sandbox process timed out after {}s",
                    self.timeout.as_secs()
                ));
            }
        };

        let stdout_bytes = stdout_task
            .await
            .context("join stdout task")?
            .context("read stdout")?;
        let stderr_bytes = stderr_task
            .await
            .context("join stderr task")?
            .context("read stderr")?;

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr_bytes);
            return Err(anyhow!("sandbox process failed ({status}): {}", stderr.trim()));
        }

        Ok(stdout_bytes)
    }
}

fn isolation_args() -> Vec<OsString> {
    ["run", "--userns", "--net", "--network", "none"]
        .into_iter()
        .map(OsString::from)
        .collect()
}

fn bind_arg(host: &Path, target: &str) -> OsString {
    let mut arg = host.as_os_str().to_os_string();
    arg.push(":");
    arg.push(target);
    arg
}

pub fn run_args(run: &SandboxRun) -> Vec<OsString> {
    let mut args = isolation_args();
    args.push("--bind".into());
    args.push(bind_arg(&run.job_dir, SANDBOX_ROOT));
    args.push("--bind".into());
    args.push(bind_arg(&run.files_dir, SANDBOX_INPUT_DATA));
    args.push(run.image.as_os_str().to_os_string());
    args
}

pub fn describe_args(image: &Path) -> Vec<OsString> {
    let mut args = isolation_args();
    args.push(image.as_os_str().to_os_string());
    args.push("--describe".into());
    args
}

#[async_trait]
impl Sandbox for ApptainerSandbox {
    async fn describe(&self, image: &Path) -> Result<ValidatorDescriptor> {
        let stdout = self
            .exec(describe_args(image))
            .await
            .with_context(|| format!("describe {}", image.display()))
            .map_err(Error::from)?;
        parse_descriptor(&stdout, image)
    }

    async fn run(&self, run: &SandboxRun) -> Result<()> {
        tracing::debug!(
            event = "validation.sandbox.run",
            image = %run.image.display(),
            job_dir = %run.job_dir.display(),
            "starting sandbox run"
        );
        self.exec(run_args(run)).await.map_err(Error::from)?;
        Ok(())
    }
}

async fn read_stream_limited<R: AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
    label: &'static str,
) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await.context("read")?;
        if n == 0 {
            break;
        }
        if buf.len() + n > max_bytes {
            return Err(anyhow!("{label} exceeds max bytes: {}", max_bytes));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(buf)
}
