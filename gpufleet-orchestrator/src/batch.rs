//! Batch scheduling over a storage prefix.
//!
//! Enumerate media objects, collapse duplicates that differ only by their
//! ordering prefix, skip inputs whose output already exists, then run one job
//! per remaining item. A failed item never stops the batch.

use crate::config::{BatchSettings, JobDefaults};
use crate::logger::ActionLogger;
use crate::orchestrator::{JobReport, JobRunner};
use crate::retry::{retry, RetryPolicy};
use chrono::{DateTime, Utc};
use gpufleet_common::{BatchItem, FleetError, FleetResult, Job};
use gpufleet_providers::ObjectStorage;
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Strips the ordering prefix from base names: with `^(\d+)_`,
/// "12_show.mp4" becomes "_show.mp4" with order 12.
#[derive(Debug, Clone)]
pub struct CanonicalNamer {
    pattern: Regex,
}

impl CanonicalNamer {
    pub fn new(pattern: &str) -> FleetResult<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| FleetError::config(format!("invalid canonical pattern {:?}: {}", pattern, e)))?;
        Ok(Self { pattern })
    }

    /// Canonical key and numeric order of a base name. Only the first capture
    /// group (or the whole match without groups) is removed.
    pub fn canonical(&self, base_name: &str) -> (String, Option<u64>) {
        let Some(caps) = self.pattern.captures(base_name) else {
            return (base_name.to_string(), None);
        };
        let Some(m) = caps.get(1).or_else(|| caps.get(0)) else {
            return (base_name.to_string(), None);
        };
        let order = m.as_str().parse::<u64>().ok();
        let canonical = format!("{}{}", &base_name[..m.start()], &base_name[m.end()..]);
        (canonical, order)
    }

    pub fn item(&self, key: &str, size: u64) -> BatchItem {
        let base = key.rsplit('/').next().unwrap_or(key);
        let (canonical_key, order) = self.canonical(base);
        BatchItem {
            key: key.to_string(),
            size,
            canonical_key,
            order,
        }
    }
}

fn strip_extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(i) if i > 0 => &name[..i],
        _ => name,
    }
}

/// Stem an item's output is named after: "_show.mp4" -> "show".
pub fn canonical_stem(item: &BatchItem) -> String {
    strip_extension(&item.canonical_key).trim_matches('_').to_string()
}

fn timestamp_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_\d{8}T\d{6}Z$").expect("static timestamp pattern"))
}

/// Stem of an existing output key: "output/show_20260101T000000Z.mp4" -> "show".
pub fn output_stem(key: &str) -> String {
    let base = key.rsplit('/').next().unwrap_or(key);
    let stem = strip_extension(base);
    timestamp_suffix().replace(stem, "").to_string()
}

pub fn output_key(prefix: &str, stem: &str, at: DateTime<Utc>) -> String {
    let prefix = prefix.trim_end_matches('/');
    let name = format!("{}_{}.mp4", stem, at.format("%Y%m%dT%H%M%SZ"));
    if prefix.is_empty() {
        name
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// Items dropped as duplicates, with the key that was kept instead.
#[derive(Debug, Clone, PartialEq)]
pub struct DroppedDuplicate {
    pub item: BatchItem,
    pub kept_key: String,
}

/// Keep one item per canonical key: the lower numeric prefix wins, otherwise
/// the first seen. Survivors come back in processing order.
pub fn dedup(items: Vec<BatchItem>) -> (Vec<BatchItem>, Vec<DroppedDuplicate>) {
    let mut kept: Vec<BatchItem> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut dropped = Vec::new();

    for item in items {
        let Some(&i) = index.get(&item.canonical_key) else {
            index.insert(item.canonical_key.clone(), kept.len());
            kept.push(item);
            continue;
        };
        let replace = matches!((item.order, kept[i].order), (Some(new), Some(old)) if new < old);
        let (keep, drop) = if replace {
            let old = std::mem::replace(&mut kept[i], item);
            (kept[i].key.clone(), old)
        } else {
            (kept[i].key.clone(), item)
        };
        info!(
            "[batch] dropping duplicate {} (canonical {}), keeping {}",
            drop.key, drop.canonical_key, keep
        );
        dropped.push(DroppedDuplicate {
            item: drop,
            kept_key: keep,
        });
    }

    kept.sort_by(|a, b| {
        a.order
            .unwrap_or(u64::MAX)
            .cmp(&b.order.unwrap_or(u64::MAX))
            .then_with(|| a.key.cmp(&b.key))
    });
    (kept, dropped)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Succeeded,
    Failed,
    Skipped,
    DroppedDuplicate,
    NotStarted,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Succeeded => "succeeded",
            ItemStatus::Failed => "failed",
            ItemStatus::Skipped => "skipped",
            ItemStatus::DroppedDuplicate => "duplicate",
            ItemStatus::NotStarted => "not_started",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemOutcome {
    pub key: String,
    pub canonical_key: String,
    pub status: ItemStatus,
    pub output_key: Option<String>,
    /// Existing outputs that caused a skip, or the kept key for a duplicate.
    pub matched_keys: Vec<String>,
    pub failed_stage: Option<String>,
    pub message: Option<String>,
    pub duration_ms: Option<u64>,
    #[serde(skip)]
    pub report: Option<JobReport>,
}

impl ItemOutcome {
    fn new(item: &BatchItem, status: ItemStatus) -> Self {
        Self {
            key: item.key.clone(),
            canonical_key: item.canonical_key.clone(),
            status,
            output_key: None,
            matched_keys: Vec::new(),
            failed_stage: None,
            message: None,
            duration_ms: None,
            report: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub items: Vec<ItemOutcome>,
    pub attempted: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub duplicates: usize,
    pub not_started: usize,
}

impl BatchReport {
    fn push(&mut self, outcome: ItemOutcome) {
        match outcome.status {
            ItemStatus::Succeeded => {
                self.attempted += 1;
                self.succeeded += 1;
            }
            ItemStatus::Failed => {
                self.attempted += 1;
                self.failed += 1;
            }
            ItemStatus::Skipped => self.skipped += 1,
            ItemStatus::DroppedDuplicate => self.duplicates += 1,
            ItemStatus::NotStarted => self.not_started += 1,
        }
        self.items.push(outcome);
    }

    /// Fixed-width table, one row per item, followed by the counts.
    pub fn render_table(&self) -> String {
        let headers = ["input", "status", "output / matched", "detail"];
        let rows: Vec<[String; 4]> = self
            .items
            .iter()
            .map(|o| {
                let target = match o.status {
                    ItemStatus::Skipped | ItemStatus::DroppedDuplicate => o.matched_keys.join(", "),
                    _ => o.output_key.clone().unwrap_or_default(),
                };
                let detail = match (&o.failed_stage, &o.message) {
                    (Some(stage), Some(msg)) => format!("{}: {}", stage, msg),
                    (None, Some(msg)) => msg.clone(),
                    _ => String::new(),
                };
                [o.key.clone(), o.status.as_str().to_string(), target, detail]
            })
            .collect();

        let mut widths = headers.map(|h| h.len());
        for row in &rows {
            for (w, cell) in widths.iter_mut().zip(row.iter()) {
                *w = (*w).max(cell.chars().count());
            }
        }
        let line = |cells: [&str; 4]| -> String {
            cells
                .iter()
                .zip(widths.iter())
                .map(|(c, w)| format!("{:<width$}", c, width = *w))
                .collect::<Vec<_>>()
                .join(" | ")
                .trim_end()
                .to_string()
        };

        let mut out = String::new();
        out.push_str(&line(headers));
        out.push('\n');
        out.push_str(
            &widths
                .iter()
                .map(|w| "-".repeat(*w))
                .collect::<Vec<_>>()
                .join("-+-"),
        );
        out.push('\n');
        for row in &rows {
            out.push_str(&line([&row[0], &row[1], &row[2], &row[3]]));
            out.push('\n');
        }
        out.push_str(&format!(
            "attempted={} succeeded={} skipped={} failed={} duplicates={} not_started={}\n",
            self.attempted, self.succeeded, self.skipped, self.failed, self.duplicates, self.not_started
        ));
        out
    }
}

pub struct BatchScheduler {
    storage: Arc<dyn ObjectStorage>,
    runner: Arc<dyn JobRunner>,
    settings: BatchSettings,
    defaults: JobDefaults,
    namer: CanonicalNamer,
    retry: RetryPolicy,
    actions: ActionLogger,
}

impl BatchScheduler {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        runner: Arc<dyn JobRunner>,
        settings: BatchSettings,
        defaults: JobDefaults,
        retry: RetryPolicy,
        actions: ActionLogger,
    ) -> FleetResult<Self> {
        let namer = CanonicalNamer::new(&settings.canonical_pattern)?;
        Ok(Self {
            storage,
            runner,
            settings,
            defaults,
            namer,
            retry,
            actions,
        })
    }

    async fn list(&self, prefix: &str) -> FleetResult<Vec<gpufleet_providers::ObjectInfo>> {
        let storage = &self.storage;
        retry(&self.retry, "list_objects", |_| async move { storage.list(prefix).await })
            .await
            .map_err(|e| FleetError::storage(format!("list {}: {:#}", prefix, e)))
    }

    /// Media objects under `prefix`, as batch items.
    pub async fn enumerate(&self, prefix: &str) -> FleetResult<Vec<BatchItem>> {
        let objects = self.list(prefix).await?;
        let total = objects.len();
        let items: Vec<BatchItem> = objects
            .into_iter()
            .filter(|o| self.is_media(&o.key))
            .map(|o| self.namer.item(&o.key, o.size))
            .collect();
        info!(
            "[batch] {} object(s) under {}, {} media file(s)",
            total,
            prefix,
            items.len()
        );
        Ok(items)
    }

    fn is_media(&self, key: &str) -> bool {
        let base = key.rsplit('/').next().unwrap_or(key);
        match base.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => {
                let ext = ext.to_ascii_lowercase();
                self.settings.media_extensions.iter().any(|e| *e == ext)
            }
            _ => false,
        }
    }

    /// Existing outputs grouped by stem.
    pub async fn existing_outputs(&self) -> FleetResult<BTreeMap<String, Vec<String>>> {
        let mut by_stem: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for obj in self.list(&self.settings.output_prefix).await? {
            by_stem.entry(output_stem(&obj.key)).or_default().push(obj.key);
        }
        Ok(by_stem)
    }

    /// Run the whole batch. `stop` ends the batch after the in-flight item;
    /// `abort` is handed to each job.
    pub async fn run(&self, stop: &CancellationToken, abort: &CancellationToken) -> FleetResult<BatchReport> {
        let started = Instant::now();
        let log_id = self
            .actions
            .log_event_with_metadata(
                "BATCH_RUN",
                "in_progress",
                &self.settings.input_prefix,
                None,
                Some(json!({
                    "output_prefix": self.settings.output_prefix,
                    "mode": self.defaults.mode.as_str(),
                    "overwrite": self.settings.overwrite,
                    "skip_existing": self.settings.skip_existing,
                })),
            )
            .await;

        let items = match self.enumerate(&self.settings.input_prefix).await {
            Ok(items) => items,
            Err(e) => {
                self.actions
                    .log_event_complete(log_id, "failed", started.elapsed().as_millis() as u64, Some(&e.to_string()))
                    .await;
                return Err(e);
            }
        };
        let (items, dropped) = dedup(items);
        let check_existing = self.settings.skip_existing && !self.settings.overwrite;
        let existing = if check_existing {
            self.existing_outputs().await?
        } else {
            BTreeMap::new()
        };

        let mut report = BatchReport::default();
        for d in &dropped {
            let mut outcome = ItemOutcome::new(&d.item, ItemStatus::DroppedDuplicate);
            outcome.matched_keys = vec![d.kept_key.clone()];
            report.push(outcome);
        }

        for item in &items {
            if stop.is_cancelled() || abort.is_cancelled() {
                report.push(ItemOutcome::new(item, ItemStatus::NotStarted));
                continue;
            }
            let stem = canonical_stem(item);
            if let Some(matched) = existing.get(&stem) {
                info!("[batch] skipping {}: output exists ({})", item.key, matched.join(", "));
                let mut outcome = ItemOutcome::new(item, ItemStatus::Skipped);
                outcome.matched_keys = matched.clone();
                report.push(outcome);
                continue;
            }
            report.push(self.run_item(item, &stem, abort).await);
        }

        let status = if report.failed == 0 { "success" } else { "partial" };
        self.actions
            .log_event_complete_with_metadata(
                log_id,
                status,
                started.elapsed().as_millis() as u64,
                None,
                Some(json!({
                    "attempted": report.attempted,
                    "succeeded": report.succeeded,
                    "skipped": report.skipped,
                    "failed": report.failed,
                    "duplicates": report.duplicates,
                    "not_started": report.not_started,
                })),
            )
            .await;
        info!(
            "[batch] done: attempted={} succeeded={} skipped={} failed={}",
            report.attempted, report.succeeded, report.skipped, report.failed
        );
        Ok(report)
    }

    async fn run_item(&self, item: &BatchItem, stem: &str, abort: &CancellationToken) -> ItemOutcome {
        let key = output_key(&self.settings.output_prefix, stem, Utc::now());
        let job = Job::new(&item.key, self.defaults.mode, self.defaults.params.clone(), &key)
            .with_strategy(self.defaults.strategy)
            .with_input_bytes(item.size);
        info!("[batch] {} -> {} (job {})", item.key, key, job.id);

        let started = Instant::now();
        let report = self.runner.run_job(job, abort.clone()).await;
        let mut outcome = ItemOutcome::new(
            item,
            if report.succeeded() {
                ItemStatus::Succeeded
            } else {
                ItemStatus::Failed
            },
        );
        outcome.output_key = Some(key);
        outcome.duration_ms = Some(started.elapsed().as_millis() as u64);
        if !report.succeeded() {
            outcome.failed_stage = report.failed_stage.map(|s| s.as_str().to_string());
            outcome.message = report.message.clone();
            warn!(
                "[batch] {} failed in {}: {}",
                item.key,
                outcome.failed_stage.as_deref().unwrap_or("unknown stage"),
                outcome.message.as_deref().unwrap_or("no message")
            );
        }
        outcome.report = Some(report);
        outcome
    }
}
