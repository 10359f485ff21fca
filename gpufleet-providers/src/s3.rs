use crate::{MultipartOptions, ObjectInfo, ObjectStorage};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use gpufleet_common::UploadResult;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// SigV4 presigned URLs cannot outlive seven days.
pub const MAX_PRESIGN_VALIDITY: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible stores (R2, MinIO, B2...). None = AWS.
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub operation_timeout: Duration,
    pub multipart: MultipartOptions,
}

pub struct S3Storage {
    client: Arc<S3Client>,
    bucket: String,
    multipart: MultipartOptions,
}

impl S3Storage {
    pub async fn connect(settings: &S3Settings) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .timeout_config(
                TimeoutConfig::builder()
                    .connect_timeout(Duration::from_secs(10))
                    .operation_timeout(settings.operation_timeout)
                    .build(),
            );
        if let (Some(ak), Some(sk)) = (&settings.access_key_id, &settings.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                ak.clone(),
                sk.clone(),
                None,
                None,
                "gpufleet-static",
            ));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = settings.endpoint.as_deref().filter(|e| !e.trim().is_empty()) {
            builder = builder.endpoint_url(endpoint.trim()).force_path_style(true);
        }
        let client = S3Client::from_conf(builder.build());

        Ok(Self {
            client: Arc::new(client),
            bucket: settings.bucket.clone(),
            multipart: settings.multipart.clone(),
        })
    }

    async fn put_single(&self, path: &Path, key: &str, size: u64) -> Result<UploadResult> {
        let body = ByteStream::from_path(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        let resp = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .with_context(|| format!("put_object {} failed", key))?;
        Ok(UploadResult {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            size,
            etag: resp.e_tag().map(|s| s.to_string()),
            url: None,
            multipart: false,
        })
    }

    async fn put_multipart(&self, path: &Path, key: &str, size: u64) -> Result<UploadResult> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("create_multipart_upload {} failed", key))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| anyhow!("multipart upload for {} returned no upload id", key))?
            .to_string();

        let part_size = self.multipart.part_size_for(size);
        let part_count = size.div_ceil(part_size).max(1);
        info!(
            "[s3] multipart upload {} ({} bytes, {} part(s) of {} bytes)",
            key, size, part_count, part_size
        );

        let uploaded: Result<Vec<CompletedPart>> = stream::iter(0..part_count)
            .map(|idx| {
                let upload_id = upload_id.clone();
                async move {
                    let offset = idx * part_size;
                    let len = part_size.min(size - offset);
                    let mut file = tokio::fs::File::open(path).await?;
                    file.seek(std::io::SeekFrom::Start(offset)).await?;
                    let mut buf = vec![0u8; len as usize];
                    file.read_exact(&mut buf).await?;
                    let part_number = (idx + 1) as i32;
                    let resp = self
                        .client
                        .upload_part()
                        .bucket(&self.bucket)
                        .key(key)
                        .upload_id(&upload_id)
                        .part_number(part_number)
                        .body(ByteStream::from(buf))
                        .send()
                        .await
                        .with_context(|| format!("upload_part {} of {} failed", part_number, key))?;
                    debug!("[s3] part {}/{} of {} uploaded", part_number, part_count, key);
                    Ok::<_, anyhow::Error>(
                        CompletedPart::builder()
                            .part_number(part_number)
                            .set_e_tag(resp.e_tag().map(|s| s.to_string()))
                            .build(),
                    )
                }
            })
            .buffered(self.multipart.concurrency.max(1))
            .try_collect()
            .await;

        let parts = match uploaded {
            Ok(parts) => parts,
            Err(e) => {
                // Never leave billed, orphaned parts behind.
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!("[s3] abort of multipart upload {} failed: {}", key, abort_err);
                }
                return Err(e);
            }
        };

        let resp = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .with_context(|| format!("complete_multipart_upload {} failed", key))?;

        Ok(UploadResult {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            size,
            etag: resp.e_tag().map(|s| s.to_string()),
            url: None,
            multipart: true,
        })
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut out = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.with_context(|| format!("list_objects_v2 {} failed", prefix))?;
            for obj in page.contents() {
                let Some(key) = obj.key() else {
                    continue;
                };
                out.push(ObjectInfo {
                    key: key.to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    etag: obj.e_tag().map(|s| s.to_string()),
                });
            }
        }
        Ok(out)
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(resp) => Ok(Some(ObjectInfo {
                key: key.to_string(),
                size: resp.content_length().unwrap_or(0).max(0) as u64,
                etag: resp.e_tag().map(|s| s.to_string()),
            })),
            Err(e) => {
                let not_found = e
                    .as_service_error()
                    .map(|se| se.is_not_found())
                    .unwrap_or(false);
                if not_found {
                    Ok(None)
                } else {
                    Err(anyhow!("head_object {} failed: {}", key, e))
                }
            }
        }
    }

    async fn upload_file(&self, path: &Path, key: &str) -> Result<UploadResult> {
        let size = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("cannot stat {}", path.display()))?
            .len();
        if size > self.multipart.threshold_bytes {
            self.put_multipart(path, key, size).await
        } else {
            self.put_single(path, key, size).await
        }
    }

    async fn download_file(&self, key: &str, dest: &Path) -> Result<u64> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("get_object {} failed", key))?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("cannot create {}", dest.display()))?;
        let mut body = resp.body;
        let mut written = 0u64;
        while let Some(chunk) = body
            .try_next()
            .await
            .with_context(|| format!("reading body of {} failed", key))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String> {
        let cfg = PresigningConfig::expires_in(expires_in.min(MAX_PRESIGN_VALIDITY))?;
        let req = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(cfg)
            .await
            .with_context(|| format!("presign GET {} failed", key))?;
        Ok(req.uri().to_string())
    }

    async fn presign_put(&self, key: &str, expires_in: Duration) -> Result<String> {
        let cfg = PresigningConfig::expires_in(expires_in.min(MAX_PRESIGN_VALIDITY))?;
        let req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(cfg)
            .await
            .with_context(|| format!("presign PUT {} failed", key))?;
        Ok(req.uri().to_string())
    }
}
