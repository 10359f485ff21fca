use crate::media::{Downloader, Uploader};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use gpufleet_common::UploadResult;
use gpufleet_providers::ObjectStorage;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Where an input locator points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Http(String),
    Object { bucket: Option<String>, key: String },
    Local(PathBuf),
}

impl Locator {
    /// `http(s)://` URLs, `s3://bucket/key`, existing local paths, and
    /// anything else as a key in the configured bucket.
    pub fn parse(raw: &str) -> Locator {
        let raw = raw.trim();
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Locator::Http(raw.to_string());
        }
        if let Some(rest) = raw.strip_prefix("s3://") {
            let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
            return Locator::Object {
                bucket: Some(bucket.to_string()),
                key: key.to_string(),
            };
        }
        let path = Path::new(raw);
        if path.is_absolute() || path.exists() {
            return Locator::Local(path.to_path_buf());
        }
        Locator::Object {
            bucket: None,
            key: raw.trim_start_matches('/').to_string(),
        }
    }

    /// Base file name, without query strings.
    pub fn file_name(&self) -> String {
        let raw = match self {
            Locator::Http(url) => url.split(['?', '#']).next().unwrap_or(url).to_string(),
            Locator::Object { key, .. } => key.clone(),
            Locator::Local(p) => p.display().to_string(),
        };
        let name = raw.rsplit('/').next().unwrap_or("").trim();
        if name.is_empty() {
            "input.bin".to_string()
        } else {
            name.to_string()
        }
    }
}

pub struct LocatorDownloader {
    storage: Option<Arc<dyn ObjectStorage>>,
    client: Client,
}

impl LocatorDownloader {
    pub fn new(storage: Option<Arc<dyn ObjectStorage>>, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(request_timeout)
            .build()
            .context("failed to build download client")?;
        Ok(Self { storage, client })
    }

    async fn download_http(&self, url: &str, dest: &Path) -> Result<u64> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(anyhow!("GET {} failed: status={}", redact(url), resp.status()));
        }
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("cannot create {}", dest.display()))?;
        let mut stream = resp.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("download interrupted")?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

/// Drop the query string (presigned signatures) before logging a URL.
pub fn redact(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

#[async_trait]
impl Downloader for LocatorDownloader {
    async fn download(&self, locator: &str, dest_dir: &Path) -> Result<PathBuf> {
        let loc = Locator::parse(locator);
        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(loc.file_name());
        let bytes = match &loc {
            Locator::Http(url) => self.download_http(url, &dest).await?,
            Locator::Local(src) => tokio::fs::copy(src, &dest)
                .await
                .with_context(|| format!("cannot copy {}", src.display()))?,
            Locator::Object { bucket, key } => {
                let storage = self
                    .storage
                    .as_ref()
                    .ok_or_else(|| anyhow!("no object storage configured for {}", locator))?;
                if let Some(b) = bucket {
                    if b != storage.bucket() {
                        return Err(anyhow!(
                            "input bucket {} does not match configured bucket {}",
                            b,
                            storage.bucket()
                        ));
                    }
                }
                storage.download_file(key, &dest).await?
            }
        };
        info!("[download] {} -> {} ({} bytes)", redact(locator), dest.display(), bytes);
        Ok(dest)
    }
}

/// Uploads through the storage client (node has credentials).
pub struct StorageUploader {
    storage: Arc<dyn ObjectStorage>,
}

impl StorageUploader {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl Uploader for StorageUploader {
    fn bucket(&self) -> &str {
        self.storage.bucket()
    }

    async fn upload(&self, file: &Path, key: &str) -> Result<UploadResult> {
        self.storage.upload_file(file, key).await
    }

    async fn existing_size(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.storage.head(key).await?.map(|o| o.size))
    }
}

/// Uploads with a presigned PUT URL (node has no credentials). The URL is
/// bound to one key; uploads for any other key are refused.
pub struct PresignedUploader {
    client: Client,
    bucket: String,
    key: String,
    put_url: String,
}

impl PresignedUploader {
    pub fn new(bucket: &str, key: &str, put_url: &str, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(request_timeout)
            .build()
            .context("failed to build upload client")?;
        Ok(Self {
            client,
            bucket: bucket.to_string(),
            key: key.to_string(),
            put_url: put_url.to_string(),
        })
    }
}

#[async_trait]
impl Uploader for PresignedUploader {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn upload(&self, file: &Path, key: &str) -> Result<UploadResult> {
        if key != self.key {
            return Err(anyhow!("presigned URL is for {}, not {}", self.key, key));
        }
        let f = tokio::fs::File::open(file)
            .await
            .with_context(|| format!("cannot open {}", file.display()))?;
        let size = f.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(tokio_util::io::ReaderStream::new(f));
        let resp = self
            .client
            .put(&self.put_url)
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(body)
            .send()
            .await
            .with_context(|| format!("PUT {} failed", redact(&self.put_url)))?;
        if !resp.status().is_success() {
            return Err(anyhow!(
                "PUT {} failed: status={}",
                redact(&self.put_url),
                resp.status()
            ));
        }
        let etag = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        Ok(UploadResult {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            size,
            etag,
            url: Some(redact(&self.put_url).to_string()),
            multipart: false,
        })
    }

    async fn existing_size(&self, _key: &str) -> Result<Option<u64>> {
        // A PUT-only URL cannot read the object back.
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpufleet_providers::mock::MemoryStorage;

    #[test]
    fn locators_are_classified() {
        assert_eq!(
            Locator::parse("https://h/b/in.mp4?X-Amz-Signature=abc"),
            Locator::Http("https://h/b/in.mp4?X-Amz-Signature=abc".into())
        );
        assert_eq!(
            Locator::parse("s3://media/in/a.mp4"),
            Locator::Object {
                bucket: Some("media".into()),
                key: "in/a.mp4".into()
            }
        );
        assert_eq!(
            Locator::parse("in/b.mp4"),
            Locator::Object {
                bucket: None,
                key: "in/b.mp4".into()
            }
        );
        assert_eq!(Locator::parse("/tmp/x.mp4"), Locator::Local("/tmp/x.mp4".into()));
        assert_eq!(Locator::parse("https://h/b/in.mp4?sig=1").file_name(), "in.mp4");
        assert_eq!(redact("https://h/k?sig=secret"), "https://h/k");
    }

    #[tokio::test]
    async fn downloads_from_storage_and_checks_bucket() {
        let storage = Arc::new(MemoryStorage::new("media"));
        storage.put("in/a.mp4", b"video");
        let d = LocatorDownloader::new(Some(storage), Duration::from_secs(5)).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let path = d.download("s3://media/in/a.mp4", dir.path()).await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"video");
        assert!(d.download("s3://other/in/a.mp4", dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn storage_uploader_reports_existing_size() {
        let storage = Arc::new(MemoryStorage::new("media"));
        storage.put("out/a.mp4", b"12345");
        let up = StorageUploader::new(storage);
        assert_eq!(up.existing_size("out/a.mp4").await.unwrap(), Some(5));
        assert_eq!(up.existing_size("out/b.mp4").await.unwrap(), None);
    }

    #[tokio::test]
    async fn presigned_uploader_is_bound_to_its_key() {
        let up = PresignedUploader::new("media", "out/a.mp4", "http://127.0.0.1:9/x", Duration::from_secs(1)).unwrap();
        let err = up.upload(Path::new("/nonexistent"), "out/b.mp4").await.unwrap_err();
        assert!(err.to_string().contains("presigned URL is for out/a.mp4"));
    }
}
