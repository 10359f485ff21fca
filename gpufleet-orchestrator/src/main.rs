use gpufleet_common::{FleetError, FleetResult, Job};
use gpufleet_orchestrator::batch::BatchScheduler;
use gpufleet_orchestrator::config::{ExecutionMode, JobEnv, Settings, ENV_OUTPUT_BUCKET};
use gpufleet_orchestrator::fleet::FleetManager;
use gpufleet_orchestrator::log_monitor::LogMonitor;
use gpufleet_orchestrator::logger::ActionLogger;
use gpufleet_orchestrator::media::Uploader;
use gpufleet_orchestrator::offer_catalog::OfferCatalog;
use gpufleet_orchestrator::orchestrator::{JobOrchestrator, JobReport, RemoteExecution};
use gpufleet_orchestrator::pipeline::{Collaborators, Pipeline, PipelineSettings};
use gpufleet_orchestrator::processor::CommandProcessor;
use gpufleet_orchestrator::provider_manager::ProviderManager;
use gpufleet_orchestrator::toolkit::{detect_gpu, FfmpegToolkit};
use gpufleet_orchestrator::transfer::{LocatorDownloader, PresignedUploader, StorageUploader};
use gpufleet_orchestrator::upload_ledger::{resume_pending, ResumeOutcome, UploadLedger};
use gpufleet_providers::ObjectStorage;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const USAGE: &str = "usage: gpufleet-orchestrator <batch|job <input> <output_key>|run-job|resume>";

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let stop = CancellationToken::new();
    let abort = CancellationToken::new();
    spawn_signal_handler(stop.clone(), abort.clone());

    let result = match args.first().map(String::as_str) {
        Some("batch") => cmd_batch(&stop, &abort).await,
        Some("job") => match (args.get(1), args.get(2)) {
            (Some(input), Some(output_key)) => cmd_job(input, output_key, &abort).await,
            _ => Err(FleetError::config(USAGE)),
        },
        Some("run-job") => cmd_run_job(&abort).await,
        Some("resume") => cmd_resume().await,
        _ => Err(FleetError::config(USAGE)),
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{}", e);
            eprintln!("error: {}", e);
            std::process::exit(2);
        }
    }
}

/// First Ctrl-C stops the batch after the in-flight item; the second aborts it.
fn spawn_signal_handler(stop: CancellationToken, abort: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("interrupt: finishing the in-flight job, press Ctrl-C again to abort it");
        stop.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("second interrupt: aborting");
            abort.cancel();
        }
    });
}

fn actions(settings: &Settings) -> ActionLogger {
    ActionLogger::new(settings.action_log.clone())
}

async fn local_pipeline(
    settings: &Settings,
    storage: Option<Arc<dyn ObjectStorage>>,
    uploader: Arc<dyn Uploader>,
) -> FleetResult<Pipeline> {
    let local = &settings.local;
    let toolkit = Arc::new(FfmpegToolkit {
        ffmpeg: local.ffmpeg_bin.clone(),
        ffprobe: local.ffprobe_bin.clone(),
        timeout: local.processor_timeout,
        ..FfmpegToolkit::default()
    });
    let downloader = LocatorDownloader::new(storage, local.download_timeout)
        .map_err(|e| FleetError::config(format!("{:#}", e)))?;
    let gpu_available = detect_gpu().await;
    info!("gpu detected: {}", gpu_available);

    let collaborators = Collaborators {
        downloader: Arc::new(downloader),
        extractor: toolkit.clone(),
        processor: Arc::new(CommandProcessor::new(&local.processor_bin, local.processor_args.clone())),
        assembler: toolkit,
        uploader,
    };
    Ok(Pipeline::new(
        collaborators,
        Arc::new(UploadLedger::new(local.ledger_path.clone())),
        actions(settings).with_component("pipeline"),
        PipelineSettings {
            workspace_root: local.workspace_root.clone(),
            processor_timeout: local.processor_timeout,
            transfer_retry: settings.retry.transfer.clone(),
            oom: settings.retry.oom.clone(),
            emit_markers: true,
            gpu_available,
        },
    ))
}

async fn build_orchestrator(settings: &Settings, storage: Arc<dyn ObjectStorage>) -> FleetResult<JobOrchestrator> {
    let actions = actions(settings);
    match settings.execution {
        ExecutionMode::Local => {
            let uploader = Arc::new(StorageUploader::new(storage.clone()));
            let pipeline = local_pipeline(settings, Some(storage), uploader).await?;
            Ok(JobOrchestrator::local(pipeline, actions))
        }
        ExecutionMode::Remote => {
            let marketplace = ProviderManager::marketplace(&settings.marketplace)?;
            let call_timeout = settings.marketplace.request_timeout + Duration::from_secs(5);
            let fleet = Arc::new(FleetManager::new(
                marketplace.clone(),
                settings.retry.network.clone(),
                call_timeout,
                actions.clone().with_component("fleet"),
            ));
            let remote = RemoteExecution {
                catalog: OfferCatalog::new(marketplace, settings.retry.network.clone(), call_timeout),
                monitor: Arc::new(LogMonitor::new(fleet.clone(), settings.monitor.clone())),
                fleet,
                storage,
                settings: settings.remote.clone(),
            };
            Ok(JobOrchestrator::remote(remote, actions))
        }
    }
}

async fn cmd_batch(stop: &CancellationToken, abort: &CancellationToken) -> FleetResult<bool> {
    let settings = Settings::from_env()?;
    let storage = ProviderManager::storage(&settings.storage).await?;
    let orchestrator = build_orchestrator(&settings, storage.clone()).await?;
    let scheduler = BatchScheduler::new(
        storage,
        Arc::new(orchestrator),
        settings.batch.clone(),
        settings.job.clone(),
        settings.retry.network.clone(),
        actions(&settings).with_component("batch"),
    )?;
    let report = scheduler.run(stop, abort).await?;
    println!("{}", report.render_table());
    Ok(report.failed == 0)
}

async fn cmd_job(input: &str, output_key: &str, abort: &CancellationToken) -> FleetResult<bool> {
    let settings = Settings::from_env()?;
    let storage = ProviderManager::storage(&settings.storage).await?;
    let orchestrator = build_orchestrator(&settings, storage).await?;
    let job = Job::new(input, settings.job.mode, settings.job.params.clone(), output_key)
        .with_strategy(settings.job.strategy);
    let report = orchestrator.run(job, abort).await;
    print_report(&report);
    Ok(report.succeeded())
}

/// On-node entry point: the job comes from the instance environment.
async fn cmd_run_job(abort: &CancellationToken) -> FleetResult<bool> {
    let job_env = JobEnv::from_env()?;
    // Nodes run the pipeline locally; the output bucket doubles as the
    // storage bucket when only presigned URLs were provided.
    let lookup = |k: &str| match k {
        "FLEET_EXECUTION" => Some("local".to_string()),
        "S3_BUCKET" => std::env::var(k)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| std::env::var(ENV_OUTPUT_BUCKET).ok()),
        _ => std::env::var(k).ok(),
    };
    let settings = Settings::from_lookup(&lookup)?;
    let timeout = settings.local.download_timeout;

    let needs_storage = job_env.output_put_url.is_none()
        || !(job_env.input.starts_with("http://") || job_env.input.starts_with("https://"));
    let storage = if needs_storage {
        Some(ProviderManager::storage(&settings.storage).await?)
    } else {
        None
    };
    let uploader: Arc<dyn Uploader> = match (&job_env.output_put_url, &storage) {
        (Some(url), _) => Arc::new(
            PresignedUploader::new(&job_env.output_bucket, &job_env.output_key, url, timeout)
                .map_err(|e| FleetError::config(format!("{:#}", e)))?,
        ),
        (None, Some(storage)) => Arc::new(StorageUploader::new(storage.clone())),
        (None, None) => return Err(FleetError::config("no way to upload the output")),
    };

    let pipeline = local_pipeline(&settings, storage, uploader).await?;
    let mut job = job_env.to_job();
    let report = pipeline.run(&mut job, abort).await;
    print_report(&report);
    if !report.succeeded() {
        println!("PIPELINE FAILED: {}", report.message.as_deref().unwrap_or("unknown error"));
    }
    Ok(report.succeeded())
}

async fn cmd_resume() -> FleetResult<bool> {
    let settings = Settings::from_env()?;
    let ledger = UploadLedger::new(settings.local.ledger_path.clone());
    if ledger.load().await?.is_none() {
        info!("no pending upload in {}", ledger.path().display());
        return Ok(true);
    }
    let storage = ProviderManager::storage(&settings.storage).await?;
    let uploader = StorageUploader::new(storage);
    match resume_pending(&ledger, &uploader, &settings.retry.transfer).await? {
        ResumeOutcome::NothingPending => info!("nothing to resume"),
        ResumeOutcome::AlreadyPresent { key, size } => info!("{} already uploaded ({} bytes)", key, size),
        ResumeOutcome::Uploaded(r) => info!("resumed upload of s3://{}/{} ({} bytes)", r.bucket, r.key, r.size),
        ResumeOutcome::Abandoned(p) => {
            warn!("abandoned s3://{}/{}: {} is gone", p.bucket, p.key, p.file_path.display());
            return Ok(false);
        }
    }
    Ok(true)
}

fn print_report(report: &JobReport) {
    match serde_json::to_string_pretty(report) {
        Ok(s) => println!("{}", s),
        Err(e) => warn!("cannot render job report: {}", e),
    }
}
