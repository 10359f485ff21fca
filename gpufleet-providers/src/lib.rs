use anyhow::Result;
use async_trait::async_trait;
use gpufleet_common::{Instance, Offer, UploadResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub mod shapes;

/// The marketplace answered a create call but would not rent the offer
/// (already taken, host gone). Retrying the same offer cannot succeed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("marketplace refused offer {offer_id}: {reason}")]
pub struct OfferRefused {
    pub offer_id: String,
    pub reason: String,
}

impl OfferRefused {
    pub fn new(offer_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            offer_id: offer_id.into(),
            reason: reason.into(),
        }
    }

    /// The refusal carried by `err`, if that is what it is.
    pub fn find(err: &anyhow::Error) -> Option<&OfferRefused> {
        err.chain().find_map(|e| e.downcast_ref::<OfferRefused>())
    }
}

/// Spot GPU marketplace. Every method is a network call; implementations must
/// bound each call with a timeout and return `Err` on transport failure so the
/// caller's retry executor can decide what to do.
#[async_trait]
pub trait Marketplace: Send + Sync {
    fn name(&self) -> &str;

    /// Server-side offer search. The marketplace's own filtering is not trusted;
    /// callers re-filter the result.
    async fn search_offers(&self, query: &OfferQuery) -> Result<Vec<Offer>>;

    /// Accept an offer. Returns the new instance id.
    async fn create_instance(&self, offer_id: &str, spec: &LaunchSpec) -> Result<String>;

    /// Current instance snapshot, `None` once the marketplace no longer knows it.
    async fn get_instance(&self, instance_id: &str) -> Result<Option<Instance>>;

    /// Last `tail` lines of the instance's container log.
    async fn get_logs(&self, instance_id: &str, tail: usize) -> Result<String>;

    // Halts compute billing while preserving the disk. Returns false if the
    // instance was already stopped or gone.
    async fn stop_instance(&self, instance_id: &str) -> Result<bool>;

    // Returns false if the instance was already gone.
    async fn destroy_instance(&self, instance_id: &str) -> Result<bool>;
}

/// Hints sent with the search call. Only a subset of constraints is expressible
/// server-side; the catalog enforces the full set after the call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OfferQuery {
    pub min_vram_mb: u64,
    pub max_price_per_hour: Option<f64>,
    pub min_reliability: f64,
    pub num_gpus: u32,
    pub verified_only: bool,
    pub datacenter_only: bool,
    pub min_inet_down_mbps: f64,
    pub limit: usize,
}

/// What to run on a freshly accepted offer.
///
/// Instances are launched run-once: the marketplace is always told not to
/// restart the container, so a crashed job never silently bills twice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaunchSpec {
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub onstart: String,
    pub disk_gb: u32,
    pub label: Option<String>,
}

impl LaunchSpec {
    pub const RESTART_POLICY: &'static str = "no";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
}

/// S3-compatible object storage bound to one bucket.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    fn bucket(&self) -> &str;

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>>;

    /// Upload a local file, switching to multipart above the configured threshold.
    async fn upload_file(&self, path: &Path, key: &str) -> Result<UploadResult>;

    /// Download `key` to `dest`, returning the number of bytes written.
    async fn download_file(&self, key: &str, dest: &Path) -> Result<u64>;

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String>;

    async fn presign_put(&self, key: &str, expires_in: Duration) -> Result<String>;
}

/// Multipart tuning for `ObjectStorage::upload_file`.
#[derive(Debug, Clone, PartialEq)]
pub struct MultipartOptions {
    pub threshold_bytes: u64,
    pub chunk_size_bytes: u64,
    pub concurrency: usize,
}

impl Default for MultipartOptions {
    fn default() -> Self {
        Self {
            threshold_bytes: 64 * 1024 * 1024,
            chunk_size_bytes: 16 * 1024 * 1024,
            concurrency: 4,
        }
    }
}

impl MultipartOptions {
    /// S3 rejects non-final parts below 5 MiB and more than 10 000 parts.
    pub fn part_size_for(&self, total: u64) -> u64 {
        const MIN_PART: u64 = 5 * 1024 * 1024;
        const MAX_PARTS: u64 = 10_000;
        let mut part = self.chunk_size_bytes.max(MIN_PART);
        while total.div_ceil(part) > MAX_PARTS {
            part *= 2;
        }
        part
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "s3")]
pub mod s3;
