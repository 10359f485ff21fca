// Batch runs: enumeration, duplicate handling, skip-existing and per-item
// isolation.

mod common;

use common::{local_fixture, RecordingRunner, ScriptedProcessor};
use gpufleet_common::{CombinedStrategy, JobMode, JobParams};
use gpufleet_orchestrator::batch::{BatchScheduler, ItemStatus};
use gpufleet_orchestrator::config::{BatchSettings, JobDefaults, DEFAULT_CANONICAL_PATTERN};
use gpufleet_orchestrator::logger::ActionLogger;
use gpufleet_orchestrator::orchestrator::{JobOrchestrator, JobRunner};
use gpufleet_orchestrator::retry::RetryPolicy;
use gpufleet_providers::mock::MemoryStorage;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn settings(skip_existing: bool, overwrite: bool) -> BatchSettings {
    BatchSettings {
        input_prefix: "input/".to_string(),
        output_prefix: "output/".to_string(),
        media_extensions: vec!["mp4".to_string(), "mkv".to_string()],
        skip_existing,
        overwrite,
        canonical_pattern: DEFAULT_CANONICAL_PATTERN.to_string(),
    }
}

fn defaults() -> JobDefaults {
    JobDefaults {
        mode: JobMode::Upscale,
        params: JobParams::default(),
        strategy: CombinedStrategy::default(),
    }
}

fn scheduler(storage: Arc<MemoryStorage>, runner: Arc<dyn JobRunner>, settings: BatchSettings) -> BatchScheduler {
    BatchScheduler::new(
        storage,
        runner,
        settings,
        defaults(),
        RetryPolicy::no_delay(2),
        ActionLogger::disabled(),
    )
    .unwrap()
}

fn status_of(report: &gpufleet_orchestrator::batch::BatchReport, key: &str) -> ItemStatus {
    report
        .items
        .iter()
        .find(|i| i.key == key)
        .map(|i| i.status)
        .unwrap_or_else(|| panic!("{} not in report", key))
}

#[tokio::test]
async fn one_failing_item_does_not_stop_the_batch() {
    let storage = Arc::new(MemoryStorage::new("media"));
    for key in ["input/01_a.mp4", "input/02_b.mp4", "input/03_c.mkv", "input/notes.txt"] {
        storage.put(key, b"x");
    }
    let runner = Arc::new(RecordingRunner::failing_on(&["02_b"]));
    let batch = scheduler(storage, runner.clone(), settings(true, false));

    let report = batch
        .run(&CancellationToken::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.attempted, 3);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);
    let inputs: Vec<String> = runner.jobs().into_iter().map(|j| j.input).collect();
    assert_eq!(inputs, vec!["input/01_a.mp4", "input/02_b.mp4", "input/03_c.mkv"]);
    let failed = report.items.iter().find(|i| i.key == "input/02_b.mp4").unwrap();
    assert_eq!(failed.failed_stage.as_deref(), Some("processing"));
    assert!(failed.message.as_deref().unwrap_or_default().contains("decoder crashed"));
    assert!(report.render_table().contains("input/02_b.mp4"));
}

#[tokio::test]
async fn duplicates_and_existing_outputs_are_not_run() {
    let storage = Arc::new(MemoryStorage::new("media"));
    storage.put("input/07_show.mp4", b"x");
    storage.put("input/01_show.mp4", b"x");
    storage.put("input/02_other.mp4", b"x");
    storage.put("output/other_20260101T000000Z.mp4", b"done");
    // Shares a prefix with "other" but is a different stem.
    storage.put("output/other_cut_20260101T000000Z.mp4", b"done");
    let runner = Arc::new(RecordingRunner::default());
    let batch = scheduler(storage, runner.clone(), settings(true, false));

    let report = batch
        .run(&CancellationToken::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(status_of(&report, "input/07_show.mp4"), ItemStatus::DroppedDuplicate);
    assert_eq!(status_of(&report, "input/01_show.mp4"), ItemStatus::Succeeded);
    assert_eq!(status_of(&report, "input/02_other.mp4"), ItemStatus::Skipped);
    let skipped = report.items.iter().find(|i| i.key == "input/02_other.mp4").unwrap();
    assert_eq!(skipped.matched_keys, vec!["output/other_20260101T000000Z.mp4".to_string()]);
    let dropped = report.items.iter().find(|i| i.key == "input/07_show.mp4").unwrap();
    assert_eq!(dropped.matched_keys, vec!["input/01_show.mp4".to_string()]);

    let jobs = runner.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].input, "input/01_show.mp4");
    assert!(jobs[0].output_key.starts_with("output/show_"));
    assert_eq!((report.duplicates, report.skipped, report.attempted), (1, 1, 1));
}

#[tokio::test]
async fn overwrite_runs_items_with_existing_outputs() {
    let storage = Arc::new(MemoryStorage::new("media"));
    storage.put("input/02_other.mp4", b"x");
    storage.put("output/other_20260101T000000Z.mp4", b"done");
    let runner = Arc::new(RecordingRunner::default());
    let batch = scheduler(storage, runner.clone(), settings(true, true));

    let report = batch
        .run(&CancellationToken::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.skipped, 0);
    assert_eq!(report.succeeded, 1);
    assert_eq!(runner.jobs().len(), 1);
}

#[tokio::test]
async fn stopped_batch_leaves_items_not_started() {
    let storage = Arc::new(MemoryStorage::new("media"));
    storage.put("input/01_a.mp4", b"x");
    storage.put("input/02_b.mp4", b"x");
    let runner = Arc::new(RecordingRunner::default());
    let batch = scheduler(storage, runner.clone(), settings(true, false));
    let stop = CancellationToken::new();
    stop.cancel();

    let report = batch.run(&stop, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.not_started, 2);
    assert_eq!(report.attempted, 0);
    assert!(runner.jobs().is_empty());
}

#[tokio::test]
async fn invalid_canonical_pattern_is_a_config_error() {
    let storage = Arc::new(MemoryStorage::new("media"));
    let mut s = settings(true, false);
    s.canonical_pattern = "(unclosed".to_string();
    let err = BatchScheduler::new(
        storage,
        Arc::new(RecordingRunner::default()),
        s,
        defaults(),
        RetryPolicy::no_delay(1),
        ActionLogger::disabled(),
    )
    .err()
    .unwrap();
    assert_eq!(err.code(), "config");
}

#[tokio::test]
async fn local_batch_writes_timestamped_outputs() {
    let tmp = tempfile::tempdir().unwrap();
    let fx = local_fixture(tmp.path(), ScriptedProcessor::default(), 5);
    fx.storage.put("input/01_intro.mp4", b"a");
    fx.storage.put("input/02_outro.mp4", b"b");
    let storage = fx.storage.clone();
    let orchestrator = Arc::new(JobOrchestrator::local(fx.pipeline, ActionLogger::disabled()));
    let batch = scheduler(storage.clone(), orchestrator, settings(true, false));

    let report = batch
        .run(&CancellationToken::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.succeeded, 2);
    let outputs: Vec<String> = storage
        .keys()
        .into_iter()
        .filter(|k| k.starts_with("output/"))
        .collect();
    assert_eq!(outputs.len(), 2);
    assert!(outputs[0].starts_with("output/intro_") && outputs[0].ends_with("Z.mp4"));
    assert!(outputs[1].starts_with("output/outro_"));
    for item in &report.items {
        let key = item.output_key.as_deref().unwrap();
        assert_eq!(storage.get(key).unwrap(), b"5 frames @ 24.000");
    }
}

#[tokio::test]
async fn failed_upload_does_not_block_later_items() {
    let tmp = tempfile::tempdir().unwrap();
    let fx = local_fixture(tmp.path(), ScriptedProcessor::default(), 3);
    for key in ["input/01_a.mp4", "input/02_b.mp4", "input/03_c.mp4"] {
        fx.storage.put(key, b"x");
    }
    // Exhausts the first item's upload retries only.
    fx.storage.fail_next_uploads(3);
    let storage = fx.storage.clone();
    let ledger = fx.ledger.clone();
    let orchestrator = Arc::new(JobOrchestrator::local(fx.pipeline, ActionLogger::disabled()));
    let batch = scheduler(storage.clone(), orchestrator, settings(true, false));

    let report = batch
        .run(&CancellationToken::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!((report.succeeded, report.failed), (2, 1));
    let first = report.items.iter().find(|i| i.key == "input/01_a.mp4").unwrap();
    assert_eq!(first.status, ItemStatus::Failed);
    assert_eq!(first.failed_stage.as_deref(), Some("uploading"));
    assert_eq!(status_of(&report, "input/02_b.mp4"), ItemStatus::Succeeded);
    assert_eq!(status_of(&report, "input/03_c.mp4"), ItemStatus::Succeeded);
    let outputs: Vec<String> = storage
        .keys()
        .into_iter()
        .filter(|k| k.starts_with("output/"))
        .collect();
    assert_eq!(outputs.len(), 2);
    assert!(outputs.iter().all(|k| !k.starts_with("output/a_")));
    assert!(ledger.load().await.unwrap().is_none());
}
