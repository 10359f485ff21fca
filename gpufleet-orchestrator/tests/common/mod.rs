// Shared fixtures: scripted media collaborators, in-memory providers and
// fast settings so whole jobs run in milliseconds.
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use gpufleet_common::{Job, Offer};
use gpufleet_orchestrator::fleet::FleetManager;
use gpufleet_orchestrator::framerate::expected_interpolated_frames;
use gpufleet_orchestrator::log_monitor::{LogMonitor, MonitorSettings};
use gpufleet_orchestrator::logger::ActionLogger;
use gpufleet_orchestrator::media::{
    AssembleRequest, Assembler, Downloader, ExtractedMedia, Extractor, MediaInfo, ProcessOperation,
    ProcessOutcome, ProcessRequest, Processor,
};
use gpufleet_orchestrator::offer_catalog::{OfferCatalog, OfferConstraints};
use gpufleet_orchestrator::orchestrator::{JobReport, JobRunner, RemoteExecution, RemoteSettings};
use gpufleet_orchestrator::pipeline::{Collaborators, Pipeline, PipelineSettings};
use gpufleet_orchestrator::retry::{OomPolicy, RetryPolicy};
use gpufleet_orchestrator::transfer::StorageUploader;
use gpufleet_orchestrator::upload_ledger::UploadLedger;
use gpufleet_providers::mock::{MemoryStorage, MockMarketplace};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const BUCKET: &str = "media";

/// Copies the input object (or writes a placeholder) into the job workspace.
pub struct StoreDownloader {
    pub storage: Arc<MemoryStorage>,
    pub fail: bool,
}

#[async_trait]
impl Downloader for StoreDownloader {
    async fn download(&self, locator: &str, dest_dir: &Path) -> Result<PathBuf> {
        if self.fail {
            return Err(anyhow!("connection refused"));
        }
        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join("input.mp4");
        let bytes = self.storage.get(locator).unwrap_or_else(|| b"video".to_vec());
        tokio::fs::write(&dest, bytes).await?;
        Ok(dest)
    }
}

/// Writes `frames` placeholder frames at 24 fps.
pub struct FrameExtractor {
    pub frames: usize,
    pub fps: f64,
}

impl FrameExtractor {
    fn info(&self) -> MediaInfo {
        MediaInfo {
            fps: self.fps,
            frame_count: self.frames as u64,
            duration_secs: self.frames as f64 / self.fps,
            width: 640,
            height: 360,
            has_audio: false,
        }
    }
}

#[async_trait]
impl Extractor for FrameExtractor {
    async fn probe(&self, _video: &Path) -> Result<MediaInfo> {
        Ok(self.info())
    }

    async fn extract(&self, _video: &Path, frames_dir: &Path) -> Result<ExtractedMedia> {
        tokio::fs::create_dir_all(frames_dir).await?;
        let mut frames = Vec::with_capacity(self.frames);
        for i in 0..self.frames {
            let frame = frames_dir.join(format!("frame_{:06}.png", i + 1));
            tokio::fs::write(&frame, b"px").await?;
            frames.push(frame);
        }
        Ok(ExtractedMedia {
            info: self.info(),
            frames,
            audio: None,
        })
    }
}

/// Fails with the scripted outputs first, then succeeds. Every call's
/// batch size is recorded.
#[derive(Default)]
pub struct ScriptedProcessor {
    pub failures: Mutex<VecDeque<String>>,
    pub calls: Mutex<Vec<(&'static str, u32)>>,
    /// Interpolation returns its inputs unchanged.
    pub short_interpolation: bool,
}

impl ScriptedProcessor {
    pub fn failing_with(outputs: &[&str]) -> Self {
        Self {
            failures: Mutex::new(outputs.iter().map(|s| s.to_string()).collect()),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<(&'static str, u32)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn batch_sizes(&self) -> Vec<u32> {
        self.calls().into_iter().map(|(_, b)| b).collect()
    }
}

#[async_trait]
impl Processor for ScriptedProcessor {
    async fn process(&self, request: &ProcessRequest) -> Result<ProcessOutcome> {
        self.calls
            .lock()
            .unwrap()
            .push((request.operation.name(), request.batch_size));
        if let Some(output) = self.failures.lock().unwrap().pop_front() {
            return Ok(ProcessOutcome {
                success: false,
                errors: vec![output.lines().last().unwrap_or_default().to_string()],
                exit_code: Some(1),
                output,
                ..Default::default()
            });
        }
        let produced = match request.operation {
            ProcessOperation::Upscale { .. } => request.inputs.len() as u64,
            ProcessOperation::Interpolate { .. } if self.short_interpolation => request.inputs.len() as u64,
            ProcessOperation::Interpolate { factor } => {
                expected_interpolated_frames(request.inputs.len() as u64, factor)
            }
        };
        let artifacts = (0..produced)
            .map(|i| request.output_dir.join(format!("out_{:06}.png", i + 1)))
            .collect();
        Ok(ProcessOutcome {
            success: true,
            artifacts,
            exit_code: Some(0),
            ..Default::default()
        })
    }
}

/// Writes a small file describing what it was asked to assemble.
pub struct SummaryAssembler;

#[async_trait]
impl Assembler for SummaryAssembler {
    async fn assemble(&self, request: &AssembleRequest) -> Result<PathBuf> {
        let body = format!("{} frames @ {:.3}", request.frames.len(), request.fps);
        tokio::fs::write(&request.output, body).await?;
        Ok(request.output.clone())
    }
}

pub fn fast_transfer() -> RetryPolicy {
    RetryPolicy::no_delay(3)
}

pub fn pipeline_settings(root: &Path) -> PipelineSettings {
    PipelineSettings {
        workspace_root: root.join("work"),
        processor_timeout: Duration::from_secs(5),
        transfer_retry: fast_transfer(),
        oom: OomPolicy::default(),
        emit_markers: false,
        gpu_available: true,
    }
}

pub struct LocalFixture {
    pub storage: Arc<MemoryStorage>,
    pub processor: Arc<ScriptedProcessor>,
    pub ledger: Arc<UploadLedger>,
    pub pipeline: Pipeline,
}

pub fn local_fixture(root: &Path, processor: ScriptedProcessor, frames: usize) -> LocalFixture {
    local_fixture_with(root, processor, frames, pipeline_settings(root))
}

pub fn local_fixture_with(
    root: &Path,
    processor: ScriptedProcessor,
    frames: usize,
    settings: PipelineSettings,
) -> LocalFixture {
    let storage = Arc::new(MemoryStorage::new(BUCKET));
    let processor = Arc::new(processor);
    let ledger = Arc::new(UploadLedger::new(root.join("pending_upload.json")));
    let collaborators = Collaborators {
        downloader: Arc::new(StoreDownloader {
            storage: storage.clone(),
            fail: false,
        }),
        extractor: Arc::new(FrameExtractor { frames, fps: 24.0 }),
        processor: processor.clone(),
        assembler: Arc::new(SummaryAssembler),
        uploader: Arc::new(StorageUploader::new(storage.clone())),
    };
    let pipeline = Pipeline::new(collaborators, ledger.clone(), ActionLogger::disabled(), settings);
    LocalFixture {
        storage,
        processor,
        ledger,
        pipeline,
    }
}

pub fn offer(id: &str, gpu: &str, price: f64) -> Offer {
    Offer {
        id: id.to_string(),
        gpu_name: gpu.to_string(),
        vram_mb: 24 * 1024,
        num_gpus: 1,
        price_per_hour: price,
        reliability: 0.99,
        inet_up_mbps: 500.0,
        inet_down_mbps: 800.0,
        host_id: format!("host-{}", id),
        datacenter: true,
        verified: true,
    }
}

pub fn fast_monitor() -> MonitorSettings {
    MonitorSettings {
        poll_interval: Duration::from_millis(2),
        max_backoff: Duration::from_millis(10),
        overall_timeout: Duration::from_secs(5),
        fatal_scan_every: 1,
        ..Default::default()
    }
}

pub fn remote_settings() -> RemoteSettings {
    RemoteSettings {
        constraints: OfferConstraints::default(),
        startup_timeout: Duration::from_secs(2),
        startup_poll: Duration::from_millis(1),
        ..Default::default()
    }
}

pub fn remote_execution(
    market: Arc<MockMarketplace>,
    storage: Arc<MemoryStorage>,
    settings: RemoteSettings,
) -> RemoteExecution {
    let fleet = Arc::new(FleetManager::new(
        market.clone(),
        RetryPolicy::no_delay(2),
        Duration::from_secs(1),
        ActionLogger::disabled(),
    ));
    RemoteExecution {
        catalog: OfferCatalog::new(market, RetryPolicy::no_delay(2), Duration::from_secs(1)),
        monitor: Arc::new(LogMonitor::new(fleet.clone(), fast_monitor())),
        fleet,
        storage,
        settings,
    }
}

/// Job runner that fails inputs whose key contains one of `fail_on`, and
/// records every job it was handed.
#[derive(Default)]
pub struct RecordingRunner {
    pub fail_on: Vec<String>,
    jobs: Mutex<Vec<Job>>,
}

impl RecordingRunner {
    pub fn failing_on(keys: &[&str]) -> Self {
        Self {
            fail_on: keys.iter().map(|k| k.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobRunner for RecordingRunner {
    async fn run_job(&self, mut job: Job, _cancel: CancellationToken) -> JobReport {
        use gpufleet_common::{FleetError, JobStatus};
        use gpufleet_orchestrator::orchestrator::JobMetrics;
        use gpufleet_orchestrator::state_machine::{advance, fail};

        self.jobs.lock().unwrap().push(job.clone());
        if self.fail_on.iter().any(|k| job.input.contains(k.as_str())) {
            advance(&mut job, JobStatus::Processing, "test");
            let err = FleetError::ProcessorFailure {
                stage: JobStatus::Processing,
                exit_code: Some(1),
                message: "decoder crashed".to_string(),
            };
            fail(&mut job, JobStatus::Processing, &err.to_string());
            return JobReport::from_job(&job, JobMetrics::default(), Some(&err));
        }
        let mut stage = job.status;
        while let Some(next) = stage.next() {
            advance(&mut job, next, "test");
            stage = next;
        }
        JobReport::from_job(&job, JobMetrics::default(), None)
    }
}
