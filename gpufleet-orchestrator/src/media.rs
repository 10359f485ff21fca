//! Collaborator boundaries of the on-node pipeline.
//!
//! The orchestrator never touches pixels. Downloading, frame extraction,
//! the actual upscale/interpolation work, assembly and upload all sit behind
//! these traits so the pipeline can be driven by real tools or by scripted
//! test doubles.

use anyhow::Result;
use async_trait::async_trait;
use gpufleet_common::{JobParams, ProcessorOptions, UploadResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub fps: f64,
    pub frame_count: u64,
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
    pub has_audio: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedMedia {
    pub info: MediaInfo,
    /// Frames in presentation order.
    pub frames: Vec<PathBuf>,
    pub audio: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProcessOperation {
    Upscale { scale: u32 },
    Interpolate { factor: f64 },
}

impl ProcessOperation {
    pub fn name(&self) -> &'static str {
        match self {
            ProcessOperation::Upscale { .. } => "upscale",
            ProcessOperation::Interpolate { .. } => "interpolate",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessRequest {
    pub operation: ProcessOperation,
    pub inputs: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub batch_size: u32,
    pub options: ProcessorOptions,
    pub timeout: Duration,
}

/// Aggregate result of one processor invocation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProcessOutcome {
    pub success: bool,
    /// Produced artifacts in order.
    pub artifacts: Vec<PathBuf>,
    pub errors: Vec<String>,
    pub exit_code: Option<i32>,
    /// Tail of the captured output, used to classify failures.
    pub output: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssembleRequest {
    pub frames: Vec<PathBuf>,
    pub fps: f64,
    pub audio: Option<PathBuf>,
    pub output: PathBuf,
}

#[async_trait]
pub trait Downloader: Send + Sync {
    /// Fetch `locator` into `dest_dir`, returning the local file.
    async fn download(&self, locator: &str, dest_dir: &Path) -> Result<PathBuf>;
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn probe(&self, video: &Path) -> Result<MediaInfo>;

    async fn extract(&self, video: &Path, frames_dir: &Path) -> Result<ExtractedMedia>;
}

/// `Err` means the processor could not be invoked at all; a run that
/// started and failed is `Ok` with `success == false`.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, request: &ProcessRequest) -> Result<ProcessOutcome>;
}

#[async_trait]
pub trait Assembler: Send + Sync {
    async fn assemble(&self, request: &AssembleRequest) -> Result<PathBuf>;
}

#[async_trait]
pub trait Uploader: Send + Sync {
    fn bucket(&self) -> &str;

    async fn upload(&self, file: &Path, key: &str) -> Result<UploadResult>;

    /// Size of `key` when it already exists remotely.
    async fn existing_size(&self, key: &str) -> Result<Option<u64>>;
}

/// How the processor backend was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendDecision {
    Gpu { backend: String },
    CpuFallback { reason: String },
    Rejected { reason: String },
}

impl BackendDecision {
    pub fn reason_code(&self) -> &'static str {
        match self {
            BackendDecision::Gpu { .. } => "gpu",
            BackendDecision::CpuFallback { .. } => "cpu_fallback",
            BackendDecision::Rejected { .. } => "gpu_required",
        }
    }
}

/// Pick the processor backend from the job's preference and whether a GPU
/// was detected. Strict jobs are rejected rather than silently slowed down.
pub fn resolve_backend(params: &JobParams, gpu_available: bool) -> BackendDecision {
    let preferred = params
        .backend
        .as_deref()
        .map(|b| b.trim().to_ascii_lowercase())
        .filter(|b| !b.is_empty());
    if preferred.as_deref() == Some("cpu") {
        return BackendDecision::CpuFallback {
            reason: "cpu backend requested".to_string(),
        };
    }
    if gpu_available {
        return BackendDecision::Gpu {
            backend: preferred.unwrap_or_else(|| "cuda".to_string()),
        };
    }
    if params.strict_gpu {
        BackendDecision::Rejected {
            reason: "no GPU detected and strict GPU mode is on".to_string(),
        }
    } else {
        BackendDecision::CpuFallback {
            reason: "no GPU detected".to_string(),
        }
    }
}

/// Options forwarded to every processor call for a job.
pub fn processor_options(params: &JobParams, decision: &BackendDecision) -> ProcessorOptions {
    let mut opts = ProcessorOptions::new();
    let backend = match decision {
        BackendDecision::Gpu { backend } => backend.clone(),
        BackendDecision::CpuFallback { .. } | BackendDecision::Rejected { .. } => "cpu".to_string(),
    };
    opts.insert("backend".to_string(), backend);
    if let Some(t) = params.target_fps {
        opts.insert("target_fps".to_string(), format!("{}", t));
    }
    opts
}
