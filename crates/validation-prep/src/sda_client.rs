use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::Deserialize;

use crate::staging::StagingError;

/// Header carrying the reader's base64 Crypt4GH public key on download requests.
pub const PUBLIC_KEY_HEADER: &str = "C4GH-Public-Key";

/// A submitted file as listed by the upstream file service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserFile {
    #[serde(rename = "fileID")]
    pub file_id: String,
    #[serde(rename = "inboxPath")]
    pub inbox_path: String,
    #[serde(rename = "submissionFileSize")]
    pub submission_file_size: i64,
}

/// Byte stream of one download.
#[async_trait]
pub trait FileStream: Send {
    async fn next_chunk(&mut self) -> anyhow::Result<Option<Vec<u8>>>;
}

/// Upstream service holding the submitted (encrypted) files.
#[async_trait]
pub trait FileService: Send + Sync {
    async fn list_user_files(&self, user: &str) -> Result<Vec<UserFile>, StagingError>;

    /// Request a file re-encrypted for `public_key` (a `C4GH-Public-Key` header value).
    async fn download_file(
        &self,
        user: &str,
        file_id: &str,
        public_key: &str,
    ) -> Result<Box<dyn FileStream>, StagingError>;
}

#[derive(Clone)]
pub struct SdaClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl std::fmt::Debug for SdaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdaClient")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl SdaClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            http: reqwest::Client::new(),
        }
    }

    async fn get(
        &self,
        url: &str,
        public_key: Option<&str>,
    ) -> Result<reqwest::Response, StagingError> {
        let mut req = self.http.get(url).bearer_auth(&self.token);
        if let Some(public_key) = public_key {
            req = req.header(PUBLIC_KEY_HEADER, public_key);
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("GET {url}"))
            .map_err(StagingError::retryable)?;

        let status = resp.status();
        if !status.is_success() {
            let err = anyhow!("server returned status {} for {url}", status.as_u16());
            return Err(if status.is_server_error() {
                StagingError::retryable(err)
            } else {
                StagingError::permanent(err)
            });
        }
        Ok(resp)
    }
}

struct ResponseStream {
    resp: reqwest::Response,
}

#[async_trait]
impl FileStream for ResponseStream {
    async fn next_chunk(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        let chunk = self.resp.chunk().await.context("read response chunk")?;
        Ok(chunk.map(|bytes| bytes.to_vec()))
    }
}

#[async_trait]
impl FileService for SdaClient {
    async fn list_user_files(&self, user: &str) -> Result<Vec<UserFile>, StagingError> {
        let url = format!("{}/users/{user}/files", self.base_url);
        let resp = self.get(&url, None).await?;
        resp.json::<Vec<UserFile>>()
            .await
            .with_context(|| format!("decode file list from {url}"))
            .map_err(StagingError::permanent)
    }

    async fn download_file(
        &self,
        user: &str,
        file_id: &str,
        public_key: &str,
    ) -> Result<Box<dyn FileStream>, StagingError> {
        let url = format!("{}/users/{user}/file/{file_id}", self.base_url);
        let resp = self.get(&url, Some(public_key)).await?;
        Ok(Box::new(ResponseStream { resp }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_file_wire_names() {
        let files: Vec<UserFile> = serde_json::from_str(
            r#"[{"fileID": "f1", "inboxPath": "b/c.txt.c4gh", "submissionFileSize": 42}]"#,
        )
        .unwrap();
        assert_eq!(
            files[0],
            UserFile {
                file_id: "f1".to_string(),
                inbox_path: "b/c.txt.c4gh".to_string(),
                submission_file_size: 42,
            }
        );
    }

    #[test]
    fn debug_redacts_token() {
        let client = SdaClient::new("http://sda.local/", "s3cret");
        let rendered = format!("{client:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("http://sda.local"));
    }
}
