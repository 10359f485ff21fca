// Remote jobs against the mock marketplace: offer selection, launch,
// log monitoring and release.

mod common;

use common::{offer, remote_execution, remote_settings, BUCKET};
use gpufleet_common::bus::{event_line, phase_line, JobFailedPayload, RemoteEventKind, UploadConfirmedPayload};
use gpufleet_common::{InstanceStatus, Job, JobMode, JobParams, JobStatus};
use gpufleet_orchestrator::config::{ENV_INPUT, ENV_OUTPUT_KEY, ENV_OUTPUT_PUT_URL};
use gpufleet_orchestrator::disk_sizing::recommended_disk_gb;
use gpufleet_orchestrator::logger::ActionLogger;
use gpufleet_orchestrator::orchestrator::JobOrchestrator;
use gpufleet_providers::mock::{MemoryStorage, MockMarketplace};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const OUTPUT_KEY: &str = "output/show_20260101T000000Z.mp4";

fn confirmed(key: &str) -> String {
    event_line(
        RemoteEventKind::UploadConfirmed,
        &UploadConfirmedPayload {
            bucket: BUCKET.into(),
            key: key.into(),
            url: Some(format!("https://storage.mock/{}/{}?sig=abc", BUCKET, key)),
            size: Some(4096),
        },
    )
}

fn job() -> Job {
    Job::new("input/01_show.mp4", JobMode::Upscale, JobParams::default(), OUTPUT_KEY)
}

fn storage_with_input() -> Arc<MemoryStorage> {
    let storage = Arc::new(MemoryStorage::new(BUCKET));
    storage.put("input/01_show.mp4", &[0u8; 2048]);
    storage
}

#[tokio::test]
async fn remote_job_completes_and_stops_the_instance() {
    let market = Arc::new(MockMarketplace::new().with_offers(vec![
        offer("a", "RTX 4090", 0.45),
        offer("b", "RTX 3090", 0.22),
        offer("c", "RTX 4090 Laptop GPU", 0.05),
    ]));
    let fresh = [
        "booting".to_string(),
        phase_line(JobStatus::Downloading),
        phase_line(JobStatus::Extracting),
        phase_line(JobStatus::Processing),
        phase_line(JobStatus::Assembling),
        phase_line(JobStatus::Uploading),
        confirmed(OUTPUT_KEY),
    ]
    .join("\n");
    market.set_default_log_script(vec!["booting".to_string(), fresh]);
    let storage = storage_with_input();
    let orchestrator = JobOrchestrator::remote(
        remote_execution(market.clone(), storage, remote_settings()),
        ActionLogger::disabled(),
    );

    let report = orchestrator.run(job(), &CancellationToken::new()).await;

    assert!(report.succeeded(), "{:?}", report.message);
    assert_eq!(report.instance_id.as_deref(), Some("1001"));
    assert_eq!(report.metrics.offer_id.as_deref(), Some("b"));
    assert_eq!(report.metrics.relaxation.as_deref(), Some("initial"));
    assert_eq!(
        report.result_url.as_deref(),
        Some("https://storage.mock/media/output/show_20260101T000000Z.mp4?sig=abc")
    );
    assert_eq!(report.metrics.output_bytes, Some(4096));
    assert!(report.timings.iter().any(|t| t.stage == JobStatus::Processing));
    assert_eq!(market.stop_calls(), vec!["1001".to_string()]);
    assert!(market.destroy_calls().is_empty());

    let created = market.created();
    assert_eq!(created.len(), 1);
    let (_, offer_id, spec) = &created[0];
    assert_eq!(offer_id, "b");
    assert!(spec.env[ENV_INPUT].starts_with("https://storage.mock/media/input/01_show.mp4"));
    assert!(spec.env[ENV_OUTPUT_PUT_URL].contains("method=PUT"));
    assert_eq!(spec.env[ENV_OUTPUT_KEY], OUTPUT_KEY);
}

#[tokio::test]
async fn exhausted_ladder_fails_without_launching() {
    let market = Arc::new(MockMarketplace::new().with_offers(vec![offer("x", "H100", 40.0)]));
    let orchestrator = JobOrchestrator::remote(
        remote_execution(market.clone(), storage_with_input(), remote_settings()),
        ActionLogger::disabled(),
    );

    let report = orchestrator.run(job(), &CancellationToken::new()).await;

    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.failed_stage, Some(JobStatus::Created));
    assert_eq!(report.error_code.as_deref(), Some("no_offers_found"));
    // One search per rung, never a second pass.
    assert_eq!(market.search_calls().len(), 7);
    assert!(market.created().is_empty());
}

#[tokio::test]
async fn upload_of_another_key_is_not_mistaken_for_this_job() {
    let market = Arc::new(MockMarketplace::new().with_offers(vec![offer("a", "RTX 4090", 0.30)]));
    let other = ["warming up".to_string(), confirmed("output/other_20251231T000000Z.mp4")].join("\n");
    let failed = [
        other.clone(),
        phase_line(JobStatus::Downloading),
        phase_line(JobStatus::Processing),
        event_line(
            RemoteEventKind::JobFailed,
            &JobFailedPayload {
                stage: "processing".to_string(),
                message: "decoder crashed".to_string(),
            },
        ),
    ]
    .join("\n");
    market.set_default_log_script(vec![other.clone(), other, failed]);
    let orchestrator = JobOrchestrator::remote(
        remote_execution(market.clone(), storage_with_input(), remote_settings()),
        ActionLogger::disabled(),
    );

    let report = orchestrator.run(job(), &CancellationToken::new()).await;

    assert!(!report.succeeded());
    assert_eq!(report.failed_stage, Some(JobStatus::Processing));
    assert_eq!(report.error_code.as_deref(), Some("remote_job_failed"));
    assert!(report.message.unwrap_or_default().contains("decoder crashed"));
    assert_eq!(market.stop_calls(), vec!["1001".to_string()]);
}

#[tokio::test]
async fn job_finished_before_the_first_poll_completes() {
    let market = Arc::new(MockMarketplace::new().with_offers(vec![offer("a", "RTX 4090", 0.30)]));
    let whole_run = [
        phase_line(JobStatus::Downloading),
        phase_line(JobStatus::Processing),
        phase_line(JobStatus::Uploading),
        confirmed(OUTPUT_KEY),
    ]
    .join("\n");
    market.set_default_log_script(vec![whole_run]);
    let orchestrator = JobOrchestrator::remote(
        remote_execution(market.clone(), storage_with_input(), remote_settings()),
        ActionLogger::disabled(),
    );

    let report = tokio::time::timeout(
        Duration::from_secs(3),
        orchestrator.run(job(), &CancellationToken::new()),
    )
    .await
    .expect("completion in the first log fetch must not be ignored");

    assert!(report.succeeded(), "{:?}", report.message);
    assert_eq!(report.metrics.output_bytes, Some(4096));
    assert_eq!(market.stop_calls(), vec!["1001".to_string()]);
}

#[tokio::test]
async fn refused_offer_falls_through_to_the_next_one() {
    let market = Arc::new(MockMarketplace::new().with_offers(vec![
        offer("a", "RTX 4090", 0.45),
        offer("b", "RTX 3090", 0.22),
    ]));
    market.refuse_offers(&["b"]);
    market.set_default_log_script(vec![confirmed(OUTPUT_KEY)]);
    let orchestrator = JobOrchestrator::remote(
        remote_execution(market.clone(), storage_with_input(), remote_settings()),
        ActionLogger::disabled(),
    );

    let report = orchestrator.run(job(), &CancellationToken::new()).await;

    assert!(report.succeeded(), "{:?}", report.message);
    // The refusal is final for that offer: one call, no retries.
    assert_eq!(market.create_calls(), vec!["b".to_string(), "a".to_string()]);
    let created = market.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].1, "a");
    assert_eq!(report.metrics.offer_id.as_deref(), Some("a"));
    assert_eq!(report.metrics.price_per_hour, Some(0.45));
}

#[tokio::test]
async fn every_offer_refused_fails_the_launch() {
    let market = Arc::new(MockMarketplace::new().with_offers(vec![
        offer("a", "RTX 4090", 0.45),
        offer("b", "RTX 3090", 0.22),
    ]));
    market.refuse_offers(&["a", "b"]);
    let orchestrator = JobOrchestrator::remote(
        remote_execution(market.clone(), storage_with_input(), remote_settings()),
        ActionLogger::disabled(),
    );

    let report = orchestrator.run(job(), &CancellationToken::new()).await;

    assert_eq!(report.failed_stage, Some(JobStatus::Created));
    assert_eq!(report.error_code.as_deref(), Some("offer_rejected"));
    assert_eq!(market.create_calls(), vec!["b".to_string(), "a".to_string()]);
    assert!(market.created().is_empty());
    assert!(report.instance_id.is_none());
}

#[tokio::test]
async fn enumerated_input_size_sizes_the_disk() {
    let market = Arc::new(MockMarketplace::new().with_offers(vec![offer("a", "RTX 4090", 0.30)]));
    market.set_default_log_script(vec![confirmed(OUTPUT_KEY)]);
    let orchestrator = JobOrchestrator::remote(
        remote_execution(market.clone(), storage_with_input(), remote_settings()),
        ActionLogger::disabled(),
    );
    let input_bytes = 6u64 << 30;
    let job = Job::new(
        "https://cdn.example/show.mp4",
        JobMode::Upscale,
        JobParams::default(),
        OUTPUT_KEY,
    )
    .with_input_bytes(input_bytes);

    let report = orchestrator.run(job, &CancellationToken::new()).await;

    assert!(report.succeeded(), "{:?}", report.message);
    let (_, _, spec) = &market.created()[0];
    let expected = recommended_disk_gb(input_bytes, JobMode::Upscale, JobParams::default().scale, 2.0, None);
    assert_eq!(spec.disk_gb, expected);
    assert!(spec.disk_gb > recommended_disk_gb(0, JobMode::Upscale, JobParams::default().scale, 2.0, None));
}

#[tokio::test]
async fn instance_that_never_starts_is_released() {
    let market = Arc::new(MockMarketplace::new().with_offers(vec![offer("a", "RTX 4090", 0.30)]));
    market.set_default_status_script(vec![InstanceStatus::Created, InstanceStatus::Starting]);
    let settings = gpufleet_orchestrator::orchestrator::RemoteSettings {
        startup_timeout: Duration::from_millis(30),
        startup_poll: Duration::from_millis(5),
        ..remote_settings()
    };
    let orchestrator = JobOrchestrator::remote(
        remote_execution(market.clone(), storage_with_input(), settings),
        ActionLogger::disabled(),
    );

    let report = orchestrator.run(job(), &CancellationToken::new()).await;

    assert_eq!(report.error_code.as_deref(), Some("instance_startup_timeout"));
    assert_eq!(report.failed_stage, Some(JobStatus::Created));
    assert_eq!(report.instance_id.as_deref(), Some("1001"));
    assert_eq!(market.stop_calls(), vec!["1001".to_string()]);
    assert_eq!(market.status_of("1001"), Some(InstanceStatus::Stopped));
}

#[tokio::test]
async fn missing_input_object_fails_before_launch() {
    let market = Arc::new(MockMarketplace::new().with_offers(vec![offer("a", "RTX 4090", 0.30)]));
    let orchestrator = JobOrchestrator::remote(
        remote_execution(market.clone(), Arc::new(MemoryStorage::new(BUCKET)), remote_settings()),
        ActionLogger::disabled(),
    );

    let report = orchestrator.run(job(), &CancellationToken::new()).await;

    assert_eq!(report.error_code.as_deref(), Some("storage"));
    assert!(market.created().is_empty());
}
