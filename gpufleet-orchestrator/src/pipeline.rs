//! On-node job pipeline: download -> extract -> process -> assemble -> upload.
//!
//! This is what `run-job` executes on a rented instance (or locally). Every
//! stage entry is printed as a `::phase::` line and the confirmed upload as an
//! `::event::upload_confirmed` line, so a remote `LogMonitor` can follow the
//! job from the container log alone.

use crate::framerate::{plan_output, OutputTiming};
use crate::logger::ActionLogger;
use crate::media::{
    processor_options, resolve_backend, AssembleRequest, Assembler, BackendDecision, Downloader,
    ExtractedMedia, Extractor, ProcessOperation, ProcessOutcome, ProcessRequest, Processor, Uploader,
};
use crate::orchestrator::{JobMetrics, JobReport};
use crate::retry::{
    retry, run_with_oom_backoff, with_timeout, AttemptFailure, FailureClass, OomPolicy, RetryPolicy,
};
use crate::state_machine::{advance, fail};
use crate::upload_ledger::UploadLedger;
use chrono::Utc;
use gpufleet_common::bus::{
    event_line, phase_line, FleetEventEnvelope, FleetEventType, JobFailedPayload, RemoteEventKind,
    UploadConfirmedPayload,
};
use gpufleet_common::{
    CombinedStrategy, FleetError, FleetResult, Job, JobMode, JobStatus, StageTiming, UploadResult,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// External capabilities the pipeline drives.
#[derive(Clone)]
pub struct Collaborators {
    pub downloader: Arc<dyn Downloader>,
    pub extractor: Arc<dyn Extractor>,
    pub processor: Arc<dyn Processor>,
    pub assembler: Arc<dyn Assembler>,
    pub uploader: Arc<dyn Uploader>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    /// Each job works in `<workspace_root>/job-<id>`.
    pub workspace_root: PathBuf,
    pub processor_timeout: Duration,
    pub transfer_retry: RetryPolicy,
    pub oom: OomPolicy,
    /// Print `::phase::` / `::event::` lines on stdout.
    pub emit_markers: bool,
    pub gpu_available: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("gpufleet"),
            processor_timeout: Duration::from_secs(6 * 3600),
            transfer_retry: RetryPolicy::default(),
            oom: OomPolicy::default(),
            emit_markers: true,
            gpu_available: true,
        }
    }
}

/// A stage failure: where it happened and why.
#[derive(Debug)]
struct StageFailure {
    stage: JobStatus,
    error: FleetError,
}

impl StageFailure {
    fn new(stage: JobStatus, error: FleetError) -> Self {
        Self { stage, error }
    }
}

fn processor_failure(stage: JobStatus, message: String) -> FleetError {
    FleetError::ProcessorFailure {
        stage,
        exit_code: None,
        message,
    }
}

pub struct Pipeline {
    collaborators: Collaborators,
    ledger: Arc<UploadLedger>,
    actions: ActionLogger,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        collaborators: Collaborators,
        ledger: Arc<UploadLedger>,
        actions: ActionLogger,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            collaborators,
            ledger,
            actions,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn workspace_for(&self, job: &Job) -> PathBuf {
        self.settings.workspace_root.join(format!("job-{}", job.id))
    }

    /// Run every stage of `job`. The job's terminal state is set exactly once;
    /// the workspace is removed on success and kept on failure.
    pub async fn run(&self, job: &mut Job, cancel: &CancellationToken) -> JobReport {
        let started = Instant::now();
        let workspace = self.workspace_for(job);
        let mut metrics = JobMetrics::default();
        let log_id = self
            .actions
            .log_event_with_metadata(
                "JOB_RUN",
                "in_progress",
                &job.id.to_string(),
                None,
                Some(json!({
                    "input": job.input,
                    "mode": job.mode.as_str(),
                    "strategy": job.strategy.as_str(),
                    "output_key": job.output_key,
                })),
            )
            .await;

        let result = self.run_stages(job, &workspace, &mut metrics, cancel).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(upload) => {
                advance(job, JobStatus::Done, "upload confirmed");
                if let Err(e) = tokio::fs::remove_dir_all(&workspace).await {
                    warn!("[pipeline] cannot remove workspace {}: {}", workspace.display(), e);
                }
                self.actions
                    .log_event_complete_with_metadata(
                        log_id,
                        "success",
                        duration_ms,
                        None,
                        Some(json!({ "bucket": upload.bucket, "key": upload.key, "size": upload.size })),
                    )
                    .await;
                self.actions
                    .emit(&FleetEventEnvelope::new(
                        FleetEventType::JobDone,
                        json!({ "job_id": job.id, "output_key": job.output_key, "duration_ms": duration_ms }),
                        "pipeline",
                    ))
                    .await;
                info!("[pipeline] job {} done in {}ms", job.id, duration_ms);
                let mut report = JobReport::from_job(job, metrics, None);
                report.result_url = upload.url.or_else(|| Some(format!("s3://{}/{}", upload.bucket, upload.key)));
                report
            }
            Err(failure) => {
                let message = failure.error.to_string();
                fail(job, failure.stage, &message);
                if self.settings.emit_markers {
                    println!(
                        "{}",
                        event_line(
                            RemoteEventKind::JobFailed,
                            &JobFailedPayload {
                                stage: failure.stage.as_str().to_string(),
                                message: message.clone(),
                            },
                        )
                    );
                }
                error!(
                    "[pipeline] job {} failed in {}: {} (workspace kept at {})",
                    job.id,
                    failure.stage.as_str(),
                    message,
                    workspace.display()
                );
                self.actions
                    .log_event_complete_with_metadata(
                        log_id,
                        "failed",
                        duration_ms,
                        Some(&message),
                        Some(json!({
                            "stage": failure.stage.as_str(),
                            "code": failure.error.code(),
                            "workspace": workspace,
                        })),
                    )
                    .await;
                self.actions
                    .emit(&FleetEventEnvelope::new(
                        FleetEventType::JobFailed,
                        json!({
                            "job_id": job.id,
                            "stage": failure.stage.as_str(),
                            "code": failure.error.code(),
                            "message": message,
                        }),
                        "pipeline",
                    ))
                    .await;
                JobReport::from_job(job, metrics, Some(&failure.error))
            }
        }
    }

    async fn enter(&self, job: &mut Job, stage: JobStatus) -> StageClock {
        if self.settings.emit_markers {
            println!("{}", phase_line(stage));
        }
        advance(job, stage, "pipeline");
        self.actions
            .emit(&FleetEventEnvelope::new(
                FleetEventType::JobStage,
                json!({ "job_id": job.id, "stage": stage.as_str() }),
                "pipeline",
            ))
            .await;
        StageClock {
            stage,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    async fn run_stages(
        &self,
        job: &mut Job,
        workspace: &Path,
        metrics: &mut JobMetrics,
        cancel: &CancellationToken,
    ) -> Result<UploadResult, StageFailure> {
        tokio::fs::create_dir_all(workspace)
            .await
            .map_err(|e| StageFailure::new(JobStatus::Downloading, e.into()))?;

        // Download
        check_cancelled(cancel, JobStatus::Downloading)?;
        let clock = self.enter(job, JobStatus::Downloading).await;
        let video = self
            .download(&job.input, &workspace.join("input"))
            .await
            .map_err(|e| StageFailure::new(JobStatus::Downloading, e))?;
        clock.finish(job);

        // Extract
        check_cancelled(cancel, JobStatus::Extracting)?;
        let clock = self.enter(job, JobStatus::Extracting).await;
        let mut extracted = self
            .extract(&video, &workspace.join("frames"))
            .await
            .map_err(|e| StageFailure::new(JobStatus::Extracting, e))?;
        extracted.info.frame_count = extracted.frames.len() as u64;
        metrics.input_frames = Some(extracted.info.frame_count);
        metrics.input_fps = Some(extracted.info.fps);
        clock.finish(job);

        // Process
        check_cancelled(cancel, JobStatus::Processing)?;
        let clock = self.enter(job, JobStatus::Processing).await;
        let (frames, timing) = self
            .process(job, &extracted, workspace, metrics)
            .await
            .map_err(|e| StageFailure::new(JobStatus::Processing, e))?;
        clock.finish(job);

        // Assemble
        check_cancelled(cancel, JobStatus::Assembling)?;
        let clock = self.enter(job, JobStatus::Assembling).await;
        let output = self
            .collaborators
            .assembler
            .assemble(&AssembleRequest {
                frames,
                fps: timing.fps,
                audio: extracted.audio.clone(),
                output: workspace.join("output.mp4"),
            })
            .await
            .map_err(|e| {
                StageFailure::new(JobStatus::Assembling, processor_failure(JobStatus::Assembling, format!("{:#}", e)))
            })?;
        clock.finish(job);

        // Upload
        check_cancelled(cancel, JobStatus::Uploading)?;
        let clock = self.enter(job, JobStatus::Uploading).await;
        let uploaded = self
            .upload(&output, &job.output_key)
            .await
            .map_err(|e| StageFailure::new(JobStatus::Uploading, e))?;
        metrics.output_bytes = Some(uploaded.size);
        clock.finish(job);
        Ok(uploaded)
    }

    async fn download(&self, locator: &str, dest_dir: &Path) -> FleetResult<PathBuf> {
        let downloader = &self.collaborators.downloader;
        retry(&self.settings.transfer_retry, "download", |_| async move {
            downloader.download(locator, dest_dir).await
        })
        .await
        .map_err(|e| FleetError::storage(format!("download of {} failed: {:#}", crate::transfer::redact(locator), e)))
    }

    async fn extract(&self, video: &Path, frames_dir: &Path) -> FleetResult<ExtractedMedia> {
        let extracted = self
            .collaborators
            .extractor
            .extract(video, frames_dir)
            .await
            .map_err(|e| processor_failure(JobStatus::Extracting, format!("{:#}", e)))?;
        if extracted.frames.is_empty() {
            return Err(processor_failure(
                JobStatus::Extracting,
                format!("no frames extracted from {}", video.display()),
            ));
        }
        info!(
            "[pipeline] extracted {} frame(s) at {:.3} fps ({}x{}, audio={})",
            extracted.frames.len(),
            extracted.info.fps,
            extracted.info.width,
            extracted.info.height,
            extracted.info.has_audio
        );
        Ok(extracted)
    }

    /// Run every processing step for the job's mode, then check the produced
    /// frames against the frame-rate rules.
    async fn process(
        &self,
        job: &Job,
        extracted: &ExtractedMedia,
        workspace: &Path,
        metrics: &mut JobMetrics,
    ) -> FleetResult<(Vec<PathBuf>, OutputTiming)> {
        let decision = resolve_backend(&job.params, self.settings.gpu_available);
        metrics.backend_reason = Some(decision.reason_code().to_string());
        match &decision {
            BackendDecision::Rejected { reason } => {
                return Err(processor_failure(
                    JobStatus::Processing,
                    format!("{}: {}", decision.reason_code(), reason),
                ));
            }
            BackendDecision::CpuFallback { reason } => {
                warn!("[pipeline] job {} runs on CPU: {}", job.id, reason);
            }
            BackendDecision::Gpu { backend } => {
                info!("[pipeline] job {} uses {} backend", job.id, backend);
            }
        }
        let options = processor_options(&job.params, &decision);
        metrics.backend = options.get("backend").cloned();

        let factor = job.params.effective_factor(extracted.info.fps);
        let steps = processing_steps(job.mode, job.strategy, job.params.scale, factor);

        let mut frames = extracted.frames.clone();
        for (i, op) in steps.iter().enumerate() {
            let output_dir = workspace.join(format!("step{}-{}", i + 1, op.name()));
            let outcome = self
                .process_step(*op, &frames, &output_dir, &options, job.params.batch_size, metrics)
                .await?;
            info!(
                "[pipeline] {} produced {} artifact(s) from {} input(s)",
                op.name(),
                outcome.artifacts.len(),
                frames.len()
            );
            frames = outcome.artifacts;
        }
        metrics.produced_frames = Some(frames.len() as u64);

        let timing = plan_output(job.mode, job.strategy, &job.params, &extracted.info, frames.len() as u64)?;
        metrics.output_fps = Some(timing.fps);
        metrics.output_duration_secs = Some(timing.duration_secs);
        Ok((frames, timing))
    }

    async fn process_step(
        &self,
        operation: ProcessOperation,
        inputs: &[PathBuf],
        output_dir: &Path,
        options: &gpufleet_common::ProcessorOptions,
        initial_batch_size: u32,
        metrics: &mut JobMetrics,
    ) -> FleetResult<ProcessOutcome> {
        let processor = &self.collaborators.processor;
        let timeout = self.settings.processor_timeout;
        let result = run_with_oom_backoff(&self.settings.oom, operation.name(), initial_batch_size, |batch_size| {
            let request = ProcessRequest {
                operation,
                inputs: inputs.to_vec(),
                output_dir: output_dir.to_path_buf(),
                batch_size,
                options: options.clone(),
                timeout,
            };
            async move {
                let outcome = with_timeout(timeout, "processor", processor.process(&request))
                    .await
                    .map_err(|e| AttemptFailure {
                        message: format!("{:#}", e),
                        output: String::new(),
                        exit_code: None,
                    })?;
                if outcome.success {
                    return Ok(outcome);
                }
                let message = if outcome.errors.is_empty() {
                    format!("{} exited with {:?}", operation.name(), outcome.exit_code)
                } else {
                    outcome.errors.join("; ")
                };
                Err(AttemptFailure {
                    message,
                    output: outcome.output,
                    exit_code: outcome.exit_code,
                })
            }
        })
        .await;

        match result {
            Ok(ok) => {
                metrics.batch_sizes_attempted.extend(ok.attempted.iter().copied());
                metrics.final_batch_size = Some(ok.batch_size);
                Ok(ok.value)
            }
            Err(failure) => {
                metrics.batch_sizes_attempted.extend(failure.attempted.iter().copied());
                metrics.final_batch_size = Some(failure.final_batch_size());
                match failure.class {
                    FailureClass::Unrelated => Err(FleetError::ProcessorFailure {
                        stage: JobStatus::Processing,
                        exit_code: failure.last.exit_code,
                        message: failure.last.message,
                    }),
                    FailureClass::ResourceExhausted | FailureClass::Ambiguous => Err(FleetError::ResourceExhausted {
                        batch_size: failure.final_batch_size(),
                        message: failure.last.message,
                    }),
                }
            }
        }
    }

    /// Upload with a pending-upload marker held until the store confirms.
    /// A failed upload leaves the marker (and the workspace) behind for `resume`
    /// until the next job's upload replaces it.
    async fn upload(&self, file: &Path, key: &str) -> FleetResult<UploadResult> {
        let uploader = &self.collaborators.uploader;
        let bucket = uploader.bucket().to_string();
        if let Some(stale) = self.ledger.abandon_other(&bucket, key).await? {
            warn!(
                "[pipeline] earlier upload of s3://{}/{} was never confirmed, its output stays at {}",
                stale.bucket,
                stale.key,
                stale.file_path.display()
            );
        }
        self.ledger.begin(file, &bucket, key).await?;

        let attempts = AtomicU32::new(0);
        let ledger = &self.ledger;
        let bucket_ref = bucket.as_str();
        let attempts_ref = &attempts;
        let res = retry(&self.settings.transfer_retry, "upload", |_| async move {
            let n = ledger.record_attempt(bucket_ref, key).await?;
            attempts_ref.store(n, Ordering::SeqCst);
            uploader.upload(file, key).await
        })
        .await;

        match res {
            Ok(result) => {
                self.ledger.confirm(&bucket, key).await?;
                if self.settings.emit_markers {
                    println!(
                        "{}",
                        event_line(
                            RemoteEventKind::UploadConfirmed,
                            &UploadConfirmedPayload {
                                bucket: result.bucket.clone(),
                                key: result.key.clone(),
                                url: result.url.clone(),
                                size: Some(result.size),
                            },
                        )
                    );
                }
                self.actions
                    .emit(&FleetEventEnvelope::new(
                        FleetEventType::UploadConfirmed,
                        json!({ "bucket": result.bucket, "key": result.key, "size": result.size }),
                        "pipeline",
                    ))
                    .await;
                Ok(result)
            }
            Err(e) => Err(FleetError::UploadFailure {
                key: key.to_string(),
                attempts: attempts.load(Ordering::SeqCst),
                message: format!("{:#}", e),
            }),
        }
    }
}

struct StageClock {
    stage: JobStatus,
    started_at: chrono::DateTime<Utc>,
    started: Instant,
}

impl StageClock {
    fn finish(self, job: &mut Job) {
        job.timings.push(StageTiming {
            stage: self.stage,
            started_at: self.started_at,
            duration_ms: self.started.elapsed().as_millis() as u64,
        });
    }
}

fn check_cancelled(cancel: &CancellationToken, next: JobStatus) -> Result<(), StageFailure> {
    if cancel.is_cancelled() {
        return Err(StageFailure::new(
            next,
            FleetError::Cancelled(format!("stopped before {}", next.as_str())),
        ));
    }
    Ok(())
}

/// Processor invocations for a mode, in execution order.
pub fn processing_steps(mode: JobMode, strategy: CombinedStrategy, scale: u32, factor: f64) -> Vec<ProcessOperation> {
    let up = ProcessOperation::Upscale { scale };
    let interp = ProcessOperation::Interpolate { factor };
    match mode {
        JobMode::Upscale => vec![up],
        JobMode::Interpolate => vec![interp],
        JobMode::Both => match strategy {
            CombinedStrategy::InterpolateThenUpscale => vec![interp, up],
            CombinedStrategy::UpscaleThenInterpolate => vec![up, interp],
        },
    }
}
