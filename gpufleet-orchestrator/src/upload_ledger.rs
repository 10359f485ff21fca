use crate::media::Uploader;
use crate::retry::{retry, RetryPolicy};
use chrono::Utc;
use gpufleet_common::{FleetError, FleetResult, PendingUpload, UploadResult};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Durable marker for the one upload this process has not seen confirmed.
///
/// The record lives in a single JSON file replaced atomically (write to a
/// sibling temp file, then rename). Absence of the file means nothing is
/// pending.
pub struct UploadLedger {
    path: PathBuf,
    lock: Mutex<()>,
}

impl UploadLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> FleetResult<Option<PendingUpload>> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    async fn read(&self) -> FleetResult<Option<PendingUpload>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, record: &PendingUpload) -> FleetResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn remove(&self) -> FleetResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Record an upload before its first attempt. Re-beginning the same
    /// (bucket, key) resumes the existing record; a different one is refused
    /// until the pending record is confirmed or abandoned.
    pub async fn begin(&self, file_path: &Path, bucket: &str, key: &str) -> FleetResult<PendingUpload> {
        let _guard = self.lock.lock().await;
        if let Some(existing) = self.read().await? {
            if existing.bucket == bucket && existing.key == key {
                info!(
                    "[ledger] resuming pending upload s3://{}/{} ({} earlier attempt(s))",
                    bucket, key, existing.attempts
                );
                return Ok(existing);
            }
            return Err(FleetError::storage(format!(
                "pending upload of s3://{}/{} must be confirmed or abandoned before s3://{}/{}",
                existing.bucket, existing.key, bucket, key
            )));
        }
        let now = Utc::now();
        let record = PendingUpload {
            file_path: file_path.to_path_buf(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            attempts: 0,
            created_at: now,
            updated_at: now,
        };
        self.write(&record).await?;
        Ok(record)
    }

    pub async fn record_attempt(&self, bucket: &str, key: &str) -> FleetResult<u32> {
        let _guard = self.lock.lock().await;
        let Some(mut record) = self.read().await? else {
            return Err(FleetError::storage(format!(
                "no pending upload recorded for s3://{}/{}",
                bucket, key
            )));
        };
        if record.bucket != bucket || record.key != key {
            return Err(FleetError::storage(format!(
                "pending upload is s3://{}/{}, not s3://{}/{}",
                record.bucket, record.key, bucket, key
            )));
        }
        record.attempts += 1;
        record.updated_at = Utc::now();
        self.write(&record).await?;
        Ok(record.attempts)
    }

    /// Clear the marker after the object store confirmed (bucket, key).
    /// Returns false when the pending record is for something else.
    pub async fn confirm(&self, bucket: &str, key: &str) -> FleetResult<bool> {
        let _guard = self.lock.lock().await;
        match self.read().await? {
            Some(r) if r.bucket == bucket && r.key == key => {
                self.remove().await?;
                info!("[ledger] upload s3://{}/{} confirmed", bucket, key);
                Ok(true)
            }
            Some(r) => {
                warn!(
                    "[ledger] confirm for s3://{}/{} ignored, pending record is s3://{}/{}",
                    bucket, key, r.bucket, r.key
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Drop the pending record if it targets anything other than
    /// (bucket, key). An earlier job's failed upload must not block the next
    /// job; its local file stays where it was.
    pub async fn abandon_other(&self, bucket: &str, key: &str) -> FleetResult<Option<PendingUpload>> {
        let _guard = self.lock.lock().await;
        match self.read().await? {
            Some(r) if r.bucket != bucket || r.key != key => {
                warn!(
                    "[ledger] abandoning pending upload s3://{}/{} ({} attempt(s), file {}) for s3://{}/{}",
                    r.bucket,
                    r.key,
                    r.attempts,
                    r.file_path.display(),
                    bucket,
                    key
                );
                self.remove().await?;
                Ok(Some(r))
            }
            _ => Ok(None),
        }
    }

    /// Drop whatever is pending, returning it.
    pub async fn abandon(&self) -> FleetResult<Option<PendingUpload>> {
        let _guard = self.lock.lock().await;
        let existing = self.read().await?;
        if let Some(r) = &existing {
            warn!("[ledger] abandoning pending upload s3://{}/{}", r.bucket, r.key);
            self.remove().await?;
        }
        Ok(existing)
    }
}

/// What `resume_pending` did with the ledger's record.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    NothingPending,
    /// The object was already there with the same size; only the marker was cleared.
    AlreadyPresent { key: String, size: u64 },
    Uploaded(UploadResult),
    /// The local file is gone, so the record can never complete.
    Abandoned(PendingUpload),
}

/// Re-drive the pending upload left by a previous run, if any.
pub async fn resume_pending(
    ledger: &UploadLedger,
    uploader: &dyn Uploader,
    policy: &RetryPolicy,
) -> FleetResult<ResumeOutcome> {
    let Some(pending) = ledger.load().await? else {
        return Ok(ResumeOutcome::NothingPending);
    };
    if pending.bucket != uploader.bucket() {
        return Err(FleetError::storage(format!(
            "pending upload targets bucket {}, configured bucket is {}",
            pending.bucket,
            uploader.bucket()
        )));
    }
    let local_size = match tokio::fs::metadata(&pending.file_path).await {
        Ok(m) => Some(m.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };

    let remote_size = uploader
        .existing_size(&pending.key)
        .await
        .map_err(|e| FleetError::storage(format!("head {}: {:#}", pending.key, e)))?;
    if let (Some(remote), Some(local)) = (remote_size, local_size) {
        if remote == local {
            info!(
                "[ledger] s3://{}/{} already present ({} bytes), clearing marker",
                pending.bucket, pending.key, remote
            );
            ledger.confirm(&pending.bucket, &pending.key).await?;
            return Ok(ResumeOutcome::AlreadyPresent {
                key: pending.key,
                size: remote,
            });
        }
    }

    if local_size.is_none() {
        warn!(
            "[ledger] source {} of pending upload is gone",
            pending.file_path.display()
        );
        ledger.abandon().await?;
        return Ok(ResumeOutcome::Abandoned(pending));
    }

    let attempts = AtomicU32::new(pending.attempts);
    let attempts_ref = &attempts;
    let (bucket, key, file) = (pending.bucket.as_str(), pending.key.as_str(), pending.file_path.as_path());
    let uploaded = retry(policy, "resume_upload", |_| async move {
        let n = ledger.record_attempt(bucket, key).await?;
        attempts_ref.store(n, Ordering::SeqCst);
        uploader.upload(file, key).await
    })
    .await
    .map_err(|e| FleetError::UploadFailure {
        key: key.to_string(),
        attempts: attempts.load(Ordering::SeqCst),
        message: format!("{:#}", e),
    })?;
    ledger.confirm(bucket, key).await?;
    Ok(ResumeOutcome::Uploaded(uploaded))
}
