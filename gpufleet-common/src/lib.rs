use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

pub mod bus;
pub mod error;
pub mod gpu_patterns;

pub use error::{FleetError, FleetResult, RelaxationAttempt};

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Created,    // Contract accepted, not scheduled yet
    Starting,   // Image pulling / container booting
    Running,    // Startup command is executing
    Stopped,    // Compute billing halted, disk preserved
    Terminated, // Destroyed
}

impl InstanceStatus {
    /// Map a marketplace status string onto the lifecycle.
    /// Unknown strings return None so callers can keep polling instead of guessing.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "created" | "scheduling" | "pending" => Some(Self::Created),
            "loading" | "starting" | "booting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "stopped" | "exited" | "offline" | "inactive" => Some(Self::Stopped),
            "destroyed" | "deleted" | "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
        }
    }

    /// Stopped and terminated instances will never reach `Running` on their own
    /// (run-once semantics: nothing restarts them).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Terminated)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    Upscale,
    Interpolate,
    Both,
}

impl JobMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "upscale" => Some(Self::Upscale),
            "interpolate" | "interp" => Some(Self::Interpolate),
            "both" => Some(Self::Both),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upscale => "upscale",
            Self::Interpolate => "interpolate",
            Self::Both => "both",
        }
    }
}

/// Execution order for `JobMode::Both`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CombinedStrategy {
    /// Interpolate at source resolution, then upscale every produced frame.
    /// Lower peak memory.
    #[default]
    InterpolateThenUpscale,
    /// Upscale first, then interpolate fewer but larger frames.
    UpscaleThenInterpolate,
}

impl CombinedStrategy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "interpolate_then_upscale" | "interp_first" => Some(Self::InterpolateThenUpscale),
            "upscale_then_interpolate" | "upscale_first" => Some(Self::UpscaleThenInterpolate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InterpolateThenUpscale => "interpolate_then_upscale",
            Self::UpscaleThenInterpolate => "upscale_then_interpolate",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Downloading,
    Extracting,
    Processing,
    Assembling,
    Uploading,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Downloading => "downloading",
            Self::Extracting => "extracting",
            Self::Processing => "processing",
            Self::Assembling => "assembling",
            Self::Uploading => "uploading",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "created" => Some(Self::Created),
            "downloading" => Some(Self::Downloading),
            "extracting" => Some(Self::Extracting),
            "processing" => Some(Self::Processing),
            "assembling" => Some(Self::Assembling),
            "uploading" => Some(Self::Uploading),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// The stage that follows this one on the happy path.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Created => Some(Self::Downloading),
            Self::Downloading => Some(Self::Extracting),
            Self::Extracting => Some(Self::Processing),
            Self::Processing => Some(Self::Assembling),
            Self::Assembling => Some(Self::Uploading),
            Self::Uploading => Some(Self::Done),
            Self::Done | Self::Failed => None,
        }
    }
}

// --- Entities ---

/// Immutable snapshot of a marketplace bid.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Offer {
    pub id: String,
    pub gpu_name: String,
    pub vram_mb: u64,
    pub num_gpus: u32,
    /// `f64::INFINITY` when the marketplace price could not be parsed.
    pub price_per_hour: f64,
    pub reliability: f64,
    pub inet_up_mbps: f64,
    pub inet_down_mbps: f64,
    pub host_id: String,
    #[serde(default)]
    pub datacenter: bool,
    #[serde(default)]
    pub verified: bool,
}

impl Offer {
    pub fn has_parsable_price(&self) -> bool {
        self.price_per_hour.is_finite()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ConnectionInfo {
    pub public_ip: Option<String>,
    pub ssh_host: Option<String>,
    pub ssh_port: Option<u16>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Instance {
    pub id: String,
    pub offer_id: Option<String>,
    pub status: InstanceStatus,
    /// Raw marketplace status string, kept for diagnostics.
    pub raw_status: Option<String>,
    pub connection: ConnectionInfo,
    pub price_per_hour: f64,
    pub gpu_name: String,
    pub num_gpus: u32,
    pub created_at: DateTime<Utc>,
}

/// Numeric knobs of a job. `target_fps` is ignored for upscale-only jobs.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct JobParams {
    pub scale: u32,
    pub target_fps: Option<f64>,
    pub interpolation_factor: Option<f64>,
    /// Starting batch size handed to the processor; shrunk on OOM.
    pub batch_size: u32,
    /// Backend preference forwarded to the processor (e.g. "cuda", "vulkan", "cpu").
    pub backend: Option<String>,
    /// When true a missing GPU backend fails the job instead of falling back.
    pub strict_gpu: bool,
}

impl Default for JobParams {
    fn default() -> Self {
        Self {
            scale: 2,
            target_fps: None,
            interpolation_factor: None,
            batch_size: 8,
            backend: None,
            strict_gpu: false,
        }
    }
}

impl JobParams {
    /// Interpolation factor for a source of `input_fps`.
    /// Explicit factor wins, then target/input, then 2x.
    pub fn effective_factor(&self, input_fps: f64) -> f64 {
        if let Some(f) = self.interpolation_factor.filter(|f| *f > 0.0) {
            return f;
        }
        if let Some(target) = self.target_fps.filter(|t| *t > 0.0) {
            if input_fps > 0.0 {
                return target / input_fps;
            }
        }
        2.0
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StageTiming {
    pub stage: JobStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StageError {
    pub stage: JobStatus,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StateTransition {
    pub from: JobStatus,
    pub to: JobStatus,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Job {
    pub id: Uuid,
    /// `s3://bucket/key`, bare object key, local path or http(s) URL.
    pub input: String,
    pub mode: JobMode,
    pub params: JobParams,
    pub strategy: CombinedStrategy,
    pub output_key: String,
    /// Input size when the caller already knows it (batch enumeration).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_bytes: Option<u64>,
    pub status: JobStatus,
    pub timings: Vec<StageTiming>,
    pub errors: Vec<StageError>,
    pub history: Vec<StateTransition>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(input: &str, mode: JobMode, params: JobParams, output_key: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            input: input.to_string(),
            mode,
            params,
            strategy: CombinedStrategy::default(),
            output_key: output_key.to_string(),
            input_bytes: None,
            status: JobStatus::Created,
            timings: Vec::new(),
            errors: Vec::new(),
            history: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn with_strategy(mut self, strategy: CombinedStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_input_bytes(mut self, bytes: u64) -> Self {
        self.input_bytes = Some(bytes);
        self
    }

    pub fn last_error(&self) -> Option<&StageError> {
        self.errors.last()
    }
}

/// One object of a batch input collection.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BatchItem {
    pub key: String,
    pub size: u64,
    /// Base name with the ordering prefix removed, e.g. "_show.mp4".
    pub canonical_key: String,
    /// Numeric ordering prefix when present, e.g. 7 for "7_show.mp4".
    pub order: Option<u64>,
}

impl BatchItem {
    pub fn base_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// Marker for an upload that has not been confirmed by the object store yet.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PendingUpload {
    pub file_path: PathBuf,
    pub bucket: String,
    pub key: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UploadResult {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    pub url: Option<String>,
    pub multipart: bool,
}

/// Named options forwarded verbatim to the processor.
pub type ProcessorOptions = BTreeMap<String, String>;
