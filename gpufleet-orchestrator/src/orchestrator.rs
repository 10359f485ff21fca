//! Single-job orchestration.
//!
//! A job runs either on this machine (the on-node [`Pipeline`]) or on a rented
//! instance: pick an offer, launch `run-job` on it, follow its log until the
//! upload is confirmed, then release the instance.

use crate::config::JobEnv;
use crate::disk_sizing::recommended_disk_gb;
use crate::fleet::{elapsed_ms, FleetManager, ReleaseAction};
use crate::log_monitor::{CompletionExpectation, LogMonitor, MonitorOutcome, MonitorState};
use crate::logger::ActionLogger;
use crate::offer_catalog::{OfferCatalog, OfferConstraints};
use crate::pipeline::Pipeline;
use crate::state_machine::{advance, fail, failed_stage};
use crate::transfer::Locator;
use async_trait::async_trait;
use gpufleet_common::bus::{FleetEventEnvelope, FleetEventType};
use gpufleet_common::{FleetError, FleetResult, Job, JobStatus, StageTiming};
use gpufleet_providers::{LaunchSpec, ObjectStorage};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Presigned URLs are valid for at most one week.
pub const MAX_PRESIGN_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Metrics gathered while a job ran. Every field is optional so a failed job
/// still reports whatever it got to.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobMetrics {
    pub input_frames: Option<u64>,
    pub input_fps: Option<f64>,
    pub produced_frames: Option<u64>,
    pub output_fps: Option<f64>,
    pub output_duration_secs: Option<f64>,
    pub output_bytes: Option<u64>,
    pub batch_sizes_attempted: Vec<u32>,
    pub final_batch_size: Option<u32>,
    pub backend: Option<String>,
    pub backend_reason: Option<String>,
    pub offer_id: Option<String>,
    pub gpu_name: Option<String>,
    pub price_per_hour: Option<f64>,
    pub relaxation: Option<String>,
    pub billed_secs: Option<u64>,
    pub estimated_cost_usd: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub input: String,
    pub status: JobStatus,
    pub failed_stage: Option<JobStatus>,
    pub error_code: Option<String>,
    pub message: Option<String>,
    pub output_key: String,
    pub result_url: Option<String>,
    pub instance_id: Option<String>,
    pub timings: Vec<StageTiming>,
    pub metrics: JobMetrics,
}

impl JobReport {
    pub fn from_job(job: &Job, metrics: JobMetrics, error: Option<&FleetError>) -> Self {
        Self {
            job_id: job.id,
            input: job.input.clone(),
            status: job.status,
            failed_stage: failed_stage(job),
            error_code: error.map(|e| e.code().to_string()),
            message: error
                .map(|e| e.to_string())
                .or_else(|| job.last_error().map(|e| e.message.clone())),
            output_key: job.output_key.clone(),
            result_url: None,
            instance_id: None,
            timings: job.timings.clone(),
            metrics,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Done
    }
}

/// Runs one job to a terminal state. Never panics on job failure: the
/// outcome is in the report.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run_job(&self, job: Job, cancel: CancellationToken) -> JobReport;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSettings {
    pub image: String,
    /// Startup command; it must run `gpufleet-orchestrator run-job`.
    pub onstart: String,
    pub constraints: OfferConstraints,
    pub startup_timeout: Duration,
    pub startup_poll: Duration,
    pub presign_ttl: Duration,
    pub disk_gb_override: Option<u32>,
    /// Applied when the job did not complete. Completion is released by the
    /// monitor per its own settings.
    pub release_on_failure: ReleaseAction,
    pub label_prefix: String,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            image: "ghcr.io/gpufleet/worker:latest".to_string(),
            onstart: "gpufleet-orchestrator run-job".to_string(),
            constraints: OfferConstraints::default(),
            startup_timeout: Duration::from_secs(15 * 60),
            startup_poll: Duration::from_secs(10),
            presign_ttl: MAX_PRESIGN_TTL,
            disk_gb_override: None,
            release_on_failure: ReleaseAction::Stop,
            label_prefix: "gpufleet".to_string(),
        }
    }
}

/// Everything the remote path needs.
pub struct RemoteExecution {
    pub catalog: OfferCatalog,
    pub fleet: Arc<FleetManager>,
    pub monitor: Arc<LogMonitor>,
    pub storage: Arc<dyn ObjectStorage>,
    pub settings: RemoteSettings,
}

pub enum ExecutionTarget {
    Local(Pipeline),
    Remote(RemoteExecution),
}

pub struct JobOrchestrator {
    target: ExecutionTarget,
    actions: ActionLogger,
}

impl JobOrchestrator {
    pub fn local(pipeline: Pipeline, actions: ActionLogger) -> Self {
        Self {
            target: ExecutionTarget::Local(pipeline),
            actions,
        }
    }

    pub fn remote(remote: RemoteExecution, actions: ActionLogger) -> Self {
        Self {
            target: ExecutionTarget::Remote(remote),
            actions,
        }
    }

    pub async fn run(&self, mut job: Job, cancel: &CancellationToken) -> JobReport {
        info!(
            "[orchestrator] job {}: {} {} -> {}",
            job.id,
            job.mode.as_str(),
            job.input,
            job.output_key
        );
        match &self.target {
            ExecutionTarget::Local(pipeline) => pipeline.run(&mut job, cancel).await,
            ExecutionTarget::Remote(remote) => self.run_remote(remote, &mut job, cancel).await,
        }
    }

    async fn run_remote(&self, remote: &RemoteExecution, job: &mut Job, cancel: &CancellationToken) -> JobReport {
        let mut metrics = JobMetrics::default();
        let prepared = match self.launch(remote, job, &mut metrics).await {
            Ok(p) => p,
            Err(e) => {
                fail(job, JobStatus::Created, &e.to_string());
                error!("[orchestrator] job {} could not start: {}", job.id, e);
                return JobReport::from_job(job, metrics, Some(&e));
            }
        };
        let instance_id = prepared.instance_id.clone();
        let started = prepared.started;

        if let Err(e) = remote
            .fleet
            .wait_until_running(&instance_id, remote.settings.startup_timeout, remote.settings.startup_poll)
            .await
        {
            remote.fleet.release(&instance_id, remote.settings.release_on_failure).await;
            record_cost(&mut metrics, started);
            fail(job, JobStatus::Created, &e.to_string());
            let mut report = JobReport::from_job(job, metrics, Some(&e));
            report.instance_id = Some(instance_id);
            return report;
        }

        let expectation = CompletionExpectation {
            output_key: job.output_key.clone(),
        };
        let monitored = remote.monitor.watch_new_instance(&instance_id, &expectation, cancel).await;
        apply_remote_phases(job, &monitored.state);

        let (error, result_url) = match monitored.outcome {
            MonitorOutcome::Completed(c) => {
                advance(job, JobStatus::Done, "upload confirmed by instance");
                self.verify_output(remote, &job.output_key).await;
                metrics.output_bytes = c.payload.size;
                let url = c
                    .result_url
                    .or_else(|| Some(format!("s3://{}/{}", c.payload.bucket, c.payload.key)));
                (None, url)
            }
            MonitorOutcome::Failed { stage, reason } => {
                let stage = stage
                    .as_deref()
                    .and_then(JobStatus::parse)
                    .filter(|s| !s.is_terminal())
                    .or_else(|| monitored.state.last_phase())
                    .unwrap_or(job.status);
                (Some((stage, FleetError::RemoteJobFailed(reason))), None)
            }
            MonitorOutcome::TimedOut { waited } => (
                Some((job.status, FleetError::MonitorTimeout(waited.as_secs()))),
                None,
            ),
            MonitorOutcome::Cancelled => (
                Some((
                    job.status,
                    FleetError::Cancelled(format!("monitoring of {} cancelled", instance_id)),
                )),
                None,
            ),
        };

        if error.is_some() || !monitored.released {
            let action = if error.is_some() {
                remote.settings.release_on_failure
            } else {
                remote.monitor.settings().release_on_completion
            };
            remote.fleet.release(&instance_id, action).await;
        }
        record_cost(&mut metrics, started);

        let mut report = match error {
            None => {
                self.actions
                    .emit(&FleetEventEnvelope::new(
                        FleetEventType::JobDone,
                        json!({
                            "job_id": job.id,
                            "instance_id": instance_id,
                            "output_key": job.output_key,
                            "estimated_cost_usd": metrics.estimated_cost_usd,
                        }),
                        "orchestrator",
                    ))
                    .await;
                JobReport::from_job(job, metrics, None)
            }
            Some((stage, e)) => {
                fail(job, stage, &e.to_string());
                self.actions
                    .emit(&FleetEventEnvelope::new(
                        FleetEventType::JobFailed,
                        json!({
                            "job_id": job.id,
                            "instance_id": instance_id,
                            "stage": stage.as_str(),
                            "code": e.code(),
                            "message": e.to_string(),
                            "error_lines": monitored.state.error_lines,
                        }),
                        "orchestrator",
                    ))
                    .await;
                JobReport::from_job(job, metrics, Some(&e))
            }
        };
        report.instance_id = Some(instance_id);
        report.result_url = result_url;
        report
    }

    /// Select offers, presign the transfers and create the instance on the
    /// cheapest offer the marketplace accepts. A refused offer falls through
    /// to the next one in ranked order.
    async fn launch(&self, remote: &RemoteExecution, job: &Job, metrics: &mut JobMetrics) -> FleetResult<Launched> {
        let selection = remote.catalog.select_cheapest(&remote.settings.constraints).await?;

        let ttl = remote.settings.presign_ttl.min(MAX_PRESIGN_TTL);
        let (input_url, probed_bytes) = self.presign_input(remote, &job.input, ttl).await?;
        let put_url = remote
            .storage
            .presign_put(&job.output_key, ttl)
            .await
            .map_err(|e| FleetError::storage(format!("presign PUT {}: {:#}", job.output_key, e)))?;

        // Source fps is unknown until the node probes the input, so a
        // target-fps job is sized for the default factor.
        let factor = job.params.effective_factor(0.0);
        let input_bytes = probed_bytes.or(job.input_bytes);
        if input_bytes.is_none() {
            warn!("[orchestrator] input size of {} unknown, disk sized for an empty input", job.input);
        }
        let disk_gb = recommended_disk_gb(
            input_bytes.unwrap_or(0),
            job.mode,
            job.params.scale,
            factor,
            remote.settings.disk_gb_override,
        );

        let env = JobEnv {
            job_id: job.id,
            input: input_url,
            output_bucket: remote.storage.bucket().to_string(),
            output_key: job.output_key.clone(),
            output_put_url: Some(put_url),
            mode: job.mode,
            params: job.params.clone(),
            strategy: job.strategy,
        };
        let spec = LaunchSpec {
            image: remote.settings.image.clone(),
            env: env.to_env(),
            onstart: remote.settings.onstart.clone(),
            disk_gb,
            label: Some(format!("{}-{}", remote.settings.label_prefix, job.id)),
        };

        let mut refusals = Vec::new();
        for offer in &selection.offers {
            let started = Instant::now();
            let instance = match remote.fleet.create_instance(offer, &spec).await {
                Ok(instance) => instance,
                Err(FleetError::OfferRejected { reason }) => {
                    info!("[orchestrator] offer {} refused, trying the next one", offer.id);
                    refusals.push(reason);
                    continue;
                }
                Err(e) => return Err(e),
            };

            metrics.offer_id = Some(offer.id.clone());
            metrics.gpu_name = Some(offer.gpu_name.clone());
            metrics.price_per_hour = Some(offer.price_per_hour);
            metrics.relaxation = Some(selection.relaxation.as_str().to_string());
            self.actions
                .emit(&FleetEventEnvelope::new(
                    FleetEventType::OfferSelected,
                    json!({
                        "job_id": job.id,
                        "offer_id": offer.id,
                        "gpu_name": offer.gpu_name,
                        "price_per_hour": offer.price_per_hour,
                        "relaxation": selection.relaxation.as_str(),
                        "history": selection.history,
                        "refused": refusals,
                    }),
                    "orchestrator",
                ))
                .await;
            return Ok(Launched {
                instance_id: instance.id,
                started,
            });
        }
        Err(FleetError::OfferRejected {
            reason: format!(
                "all {} selected offer(s) refused: {}",
                selection.offers.len(),
                refusals.join("; ")
            ),
        })
    }

    /// Storage inputs are handed to the node as presigned GET URLs; anything
    /// else is passed through.
    async fn presign_input(
        &self,
        remote: &RemoteExecution,
        input: &str,
        ttl: Duration,
    ) -> FleetResult<(String, Option<u64>)> {
        match Locator::parse(input) {
            Locator::Object { bucket, key } => {
                if let Some(b) = bucket.filter(|b| b != remote.storage.bucket()) {
                    return Err(FleetError::config(format!(
                        "input bucket {} does not match storage bucket {}",
                        b,
                        remote.storage.bucket()
                    )));
                }
                let size = match remote.storage.head(&key).await {
                    Ok(Some(obj)) => Some(obj.size),
                    Ok(None) => return Err(FleetError::storage(format!("input {} not found", key))),
                    Err(e) => {
                        warn!("[orchestrator] head {} failed, sizing disk blind: {:#}", key, e);
                        None
                    }
                };
                let url = remote
                    .storage
                    .presign_get(&key, ttl)
                    .await
                    .map_err(|e| FleetError::storage(format!("presign GET {}: {:#}", key, e)))?;
                Ok((url, size))
            }
            Locator::Http(url) => Ok((url, None)),
            Locator::Local(path) => Err(FleetError::config(format!(
                "local input {} cannot be used by a remote instance",
                path.display()
            ))),
        }
    }

    /// The upload event is authoritative; a missing object is only a warning.
    async fn verify_output(&self, remote: &RemoteExecution, key: &str) {
        match remote.storage.head(key).await {
            Ok(Some(obj)) => info!("[orchestrator] output {} present ({} bytes)", key, obj.size),
            Ok(None) => warn!("[orchestrator] upload of {} confirmed but head-object finds nothing yet", key),
            Err(e) => warn!("[orchestrator] cannot verify {}: {:#}", key, e),
        }
    }
}

#[async_trait]
impl JobRunner for JobOrchestrator {
    async fn run_job(&self, job: Job, cancel: CancellationToken) -> JobReport {
        self.run(job, &cancel).await
    }
}

struct Launched {
    instance_id: String,
    started: Instant,
}

/// Drive the local job record from the phases the instance reported, and
/// derive stage timings from the marker timestamps.
fn apply_remote_phases(job: &mut Job, state: &MonitorState) {
    for (i, (stage, at)) in state.phases.iter().enumerate() {
        if !advance(job, *stage, "remote phase marker") {
            continue;
        }
        let duration_ms = state
            .phases
            .get(i + 1)
            .map(|(_, next)| (*next - *at).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        job.timings.push(StageTiming {
            stage: *stage,
            started_at: *at,
            duration_ms,
        });
    }
}

fn record_cost(metrics: &mut JobMetrics, started: Instant) {
    let billed_secs = elapsed_ms(started) / 1000;
    metrics.billed_secs = Some(billed_secs);
    if let Some(price) = metrics.price_per_hour {
        metrics.estimated_cost_usd = Some(price * billed_secs as f64 / 3600.0);
    }
}
