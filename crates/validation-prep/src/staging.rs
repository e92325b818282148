use anyhow::{anyhow, Context};
use std::{fmt, path::Path};
use tokio::io::AsyncWriteExt;
use validation_core::{model::ValidationInformation, workdir};

use crate::{crypt4gh::KeyPair, sda_client::FileService};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingErrorKind {
    /// Transport failures and upstream 5xx.
    Retryable,
    /// Upstream 4xx, undecryptable content, size mismatches.
    Permanent,
}

#[derive(Debug)]
pub struct StagingError {
    pub kind: StagingErrorKind,
    pub error: anyhow::Error,
}

impl StagingError {
    pub fn retryable(err: anyhow::Error) -> Self {
        Self {
            kind: StagingErrorKind::Retryable,
            error: err,
        }
    }

    pub fn permanent(err: anyhow::Error) -> Self {
        Self {
            kind: StagingErrorKind::Permanent,
            error: err,
        }
    }
}

impl fmt::Display for StagingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.error)
    }
}

impl std::error::Error for StagingError {}

struct StagedFile {
    file_id: String,
    path: std::path::PathBuf,
    size: u64,
    file: tokio::fs::File,
}

/// Download and decrypt every file of a validation into `files_dir`.
///
/// All files are created and sized up front so a shortage of disk space fails before any
/// download starts. Handles are closed when this returns, on every path.
pub async fn stage_files(
    service: &dyn FileService,
    files_dir: &Path,
    info: &ValidationInformation,
) -> Result<(), StagingError> {
    let mut staged = Vec::with_capacity(info.files.len());
    for file in &info.files {
        let relative = workdir::relative_data_path(&file.file_path)
            .map_err(|err| StagingError::permanent(err.into_anyhow()))?;
        let size = u64::try_from(file.size).map_err(|_| {
            StagingError::permanent(anyhow!(
                "file {} has negative size {}",
                file.file_id,
                file.size
            ))
        })?;
        let path = files_dir.join(relative);
        let handle = reserve(&path, size)
            .await
            .map_err(StagingError::retryable)?;
        staged.push(StagedFile {
            file_id: file.file_id.clone(),
            path,
            size,
            file: handle,
        });
    }

    let keys = KeyPair::generate();
    let public_key = keys.public_key_header();

    for file in &mut staged {
        download(service, &info.submission_user, &keys, &public_key, file).await?;
        tracing::debug!(
            event = "validation.prepare.file_staged",
            validation_id = %info.validation_id,
            file_id = %file.file_id,
            bytes = file.size,
            "file staged"
        );
    }

    Ok(())
}

/// Create (or recreate) a read-only file of exactly `size` bytes, opened for writing.
async fn reserve(path: &Path, size: u64) -> anyhow::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        workdir::create_dir_all(parent)
            .await
            .with_context(|| format!("create dir {}", parent.display()))?;
    }

    // A previous attempt may have left a read-only copy behind.
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("remove stale file {}", path.display()))
        }
    }

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o444);
    let file = options
        .open(path)
        .await
        .with_context(|| format!("create file {}", path.display()))?;
    file.set_len(size)
        .await
        .with_context(|| format!("reserve {size} bytes for {}", path.display()))?;
    Ok(file)
}

async fn download(
    service: &dyn FileService,
    user: &str,
    keys: &KeyPair,
    public_key: &str,
    staged: &mut StagedFile,
) -> Result<(), StagingError> {
    let mut stream = service
        .download_file(user, &staged.file_id, public_key)
        .await?;
    let mut decryptor = keys.decryptor();
    let mut plain = Vec::new();
    let mut written: u64 = 0;

    while let Some(chunk) = stream
        .next_chunk()
        .await
        .with_context(|| format!("download file {}", staged.file_id))
        .map_err(StagingError::retryable)?
    {
        plain.clear();
        decryptor
            .update(&chunk, &mut plain)
            .with_context(|| format!("decrypt file {}", staged.file_id))
            .map_err(StagingError::permanent)?;
        written = write_plain(staged, &plain, written).await?;
    }

    plain.clear();
    decryptor
        .finish(&mut plain)
        .with_context(|| format!("decrypt file {}", staged.file_id))
        .map_err(StagingError::permanent)?;
    written = write_plain(staged, &plain, written).await?;

    if written != staged.size {
        return Err(StagingError::permanent(anyhow!(
            "file {} size mismatch: decrypted {written} bytes, expected {}",
            staged.file_id,
            staged.size
        )));
    }

    staged
        .file
        .flush()
        .await
        .with_context(|| format!("flush {}", staged.path.display()))
        .map_err(StagingError::retryable)?;
    Ok(())
}

async fn write_plain(
    staged: &mut StagedFile,
    plain: &[u8],
    written: u64,
) -> Result<u64, StagingError> {
    let total = written + plain.len() as u64;
    if total > staged.size {
        return Err(StagingError::permanent(anyhow!(
            "file {} exceeds expected size {}",
            staged.file_id,
            staged.size
        )));
    }
    staged
        .file
        .write_all(plain)
        .await
        .with_context(|| format!("write {}", staged.path.display()))
        .map_err(StagingError::retryable)?;
    Ok(total)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::{
        crypt4gh,
        sda_client::{FileStream, UserFile},
    };
    use async_trait::async_trait;
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    /// Upstream double serving plaintexts re-encrypted for whichever key asks.
    #[derive(Default)]
    pub struct FakeFileService {
        pub files: Mutex<HashMap<String, Vec<u8>>>,
        pub status: Mutex<HashMap<String, u16>>,
        pub downloads: AtomicUsize,
    }

    impl FakeFileService {
        pub fn with_file(self, file_id: &str, content: &[u8]) -> Self {
            self.files
                .lock()
                .unwrap()
                .insert(file_id.to_string(), content.to_vec());
            self
        }

        pub fn failing(self, file_id: &str, status: u16) -> Self {
            self.status
                .lock()
                .unwrap()
                .insert(file_id.to_string(), status);
            self
        }

        pub fn downloads(&self) -> usize {
            self.downloads.load(Ordering::SeqCst)
        }
    }

    struct ChunkedStream {
        bytes: Vec<u8>,
        pos: usize,
    }

    #[async_trait]
    impl FileStream for ChunkedStream {
        async fn next_chunk(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
            if self.pos >= self.bytes.len() {
                return Ok(None);
            }
            let end = (self.pos + 1000).min(self.bytes.len());
            let chunk = self.bytes[self.pos..end].to_vec();
            self.pos = end;
            Ok(Some(chunk))
        }
    }

    #[async_trait]
    impl FileService for FakeFileService {
        async fn list_user_files(&self, _user: &str) -> Result<Vec<UserFile>, StagingError> {
            Ok(self
                .files
                .lock()
                .unwrap()
                .iter()
                .map(|(id, content)| UserFile {
                    file_id: id.clone(),
                    inbox_path: format!("{id}.c4gh"),
                    submission_file_size: content.len() as i64,
                })
                .collect())
        }

        async fn download_file(
            &self,
            _user: &str,
            file_id: &str,
            public_key: &str,
        ) -> Result<Box<dyn FileStream>, StagingError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            if let Some(status) = self.status.lock().unwrap().get(file_id) {
                let err = anyhow!("server returned status {status}");
                return Err(if *status >= 500 {
                    StagingError::retryable(err)
                } else {
                    StagingError::permanent(err)
                });
            }
            let plain = self
                .files
                .lock()
                .unwrap()
                .get(file_id)
                .cloned()
                .ok_or_else(|| StagingError::permanent(anyhow!("no such file {file_id}")))?;
            let reader_pk = crypt4gh::parse_public_key_header(public_key)
                .map_err(StagingError::permanent)?;
            Ok(Box::new(ChunkedStream {
                bytes: crypt4gh::encrypt(&plain, &reader_pk),
                pos: 0,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{testing::FakeFileService, *};
    use validation_core::model::FileInformation;

    fn info(files: &[(&str, &str, i64)]) -> ValidationInformation {
        ValidationInformation {
            validation_id: "v1".to_string(),
            validator_ids: vec!["fmt".to_string()],
            submission_user: "alice".to_string(),
            files: files
                .iter()
                .map(|(id, path, size)| FileInformation {
                    file_id: id.to_string(),
                    file_path: path.to_string(),
                    size: *size,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn stages_decrypted_files_under_their_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let big: Vec<u8> = (0..150_000).map(|i| (i % 7) as u8).collect();
        let service = FakeFileService::default()
            .with_file("f1", b"alpha")
            .with_file("f2", &big);

        stage_files(
            &service,
            tmp.path(),
            &info(&[("f1", "a.txt", 5), ("f2", "b/c.bin", big.len() as i64)]),
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read(tmp.path().join("a.txt")).unwrap(), b"alpha");
        assert_eq!(std::fs::read(tmp.path().join("b/c.bin")).unwrap(), big);
    }

    #[tokio::test]
    async fn size_mismatch_is_permanent() {
        let tmp = tempfile::tempdir().unwrap();
        let service = FakeFileService::default().with_file("f1", b"alpha");

        let err = stage_files(&service, tmp.path(), &info(&[("f1", "a.txt", 9)]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, StagingErrorKind::Permanent);
        assert!(err.to_string().contains("size mismatch"));
    }

    #[tokio::test]
    async fn upstream_status_decides_error_kind() {
        let tmp = tempfile::tempdir().unwrap();
        let service = FakeFileService::default()
            .with_file("f1", b"alpha")
            .failing("f1", 503);
        let err = stage_files(&service, tmp.path(), &info(&[("f1", "a.txt", 5)]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, StagingErrorKind::Retryable);

        let service = FakeFileService::default().failing("f1", 404);
        let err = stage_files(&service, tmp.path(), &info(&[("f1", "a.txt", 5)]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, StagingErrorKind::Permanent);
    }

    #[tokio::test]
    async fn escaping_paths_are_rejected_before_download() {
        let tmp = tempfile::tempdir().unwrap();
        let service = FakeFileService::default().with_file("f1", b"alpha");

        let err = stage_files(&service, tmp.path(), &info(&[("f1", "../a.txt", 5)]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, StagingErrorKind::Permanent);
        assert_eq!(service.downloads(), 0);
    }

    #[tokio::test]
    async fn restaging_replaces_previous_read_only_copy() {
        let tmp = tempfile::tempdir().unwrap();
        let service = FakeFileService::default().with_file("f1", b"alpha");
        let files = info(&[("f1", "a.txt", 5)]);

        stage_files(&service, tmp.path(), &files).await.unwrap();
        stage_files(&service, tmp.path(), &files).await.unwrap();
        assert_eq!(std::fs::read(tmp.path().join("a.txt")).unwrap(), b"alpha");
    }
}
