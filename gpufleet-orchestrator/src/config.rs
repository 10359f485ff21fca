//! Environment-driven configuration.
//!
//! Everything is read through a lookup function so tests can feed a map
//! instead of mutating the process environment. Secrets prefer a `*_FILE`
//! variable (Docker/K8s secrets) over the plain one.

use crate::fleet::ReleaseAction;
use crate::log_monitor::MonitorSettings;
use crate::offer_catalog::OfferConstraints;
use crate::orchestrator::{RemoteSettings, MAX_PRESIGN_TTL};
use crate::retry::{OomPolicy, RetryPolicy};
use gpufleet_common::gpu_patterns::{parse_patterns, DEFAULT_MOBILE_GPU_MARKERS};
use gpufleet_common::{CombinedStrategy, FleetError, FleetResult, JobMode, JobParams};
use gpufleet_providers::MultipartOptions;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_MEDIA_EXTENSIONS: &str = "mp4,mkv,mov,avi,webm,m4v";
pub const DEFAULT_CANONICAL_PATTERN: &str = r"^(\d+)_";

// Job contract between the orchestrator and `run-job` on the node.
pub const ENV_JOB_ID: &str = "FLEET_JOB_ID";
pub const ENV_INPUT: &str = "FLEET_INPUT";
pub const ENV_OUTPUT_BUCKET: &str = "FLEET_OUTPUT_BUCKET";
pub const ENV_OUTPUT_KEY: &str = "FLEET_OUTPUT_KEY";
pub const ENV_OUTPUT_PUT_URL: &str = "FLEET_OUTPUT_PUT_URL";
pub const ENV_MODE: &str = "FLEET_MODE";
pub const ENV_SCALE: &str = "FLEET_SCALE";
pub const ENV_TARGET_FPS: &str = "FLEET_TARGET_FPS";
pub const ENV_INTERP_FACTOR: &str = "FLEET_INTERP_FACTOR";
pub const ENV_BATCH_SIZE: &str = "FLEET_BATCH_SIZE";
pub const ENV_BACKEND: &str = "FLEET_BACKEND";
pub const ENV_STRICT_GPU: &str = "FLEET_STRICT_GPU";
pub const ENV_STRATEGY: &str = "FLEET_STRATEGY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketplaceKind {
    Http,
    Mock,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketplaceSettings {
    pub kind: MarketplaceKind,
    /// Primary base first, then alternates.
    pub bases: Vec<String>,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    S3,
    Memory,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageSettings {
    pub kind: StorageKind,
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub operation_timeout: Duration,
    pub multipart: MultipartOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobDefaults {
    pub mode: JobMode,
    pub params: JobParams,
    pub strategy: CombinedStrategy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchSettings {
    pub input_prefix: String,
    pub output_prefix: String,
    /// Lowercase, without the dot.
    pub media_extensions: Vec<String>,
    pub skip_existing: bool,
    pub overwrite: bool,
    /// Regex whose first capture group is the numeric ordering prefix.
    pub canonical_pattern: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    pub network: RetryPolicy,
    pub transfer: RetryPolicy,
    pub oom: OomPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Local,
    Remote,
}

/// Where the on-node pipeline works and which tools it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalSettings {
    pub workspace_root: PathBuf,
    pub ledger_path: PathBuf,
    pub processor_bin: String,
    pub processor_args: Vec<String>,
    pub processor_timeout: Duration,
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
    pub download_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub execution: ExecutionMode,
    pub marketplace: MarketplaceSettings,
    pub storage: StorageSettings,
    pub constraints: OfferConstraints,
    pub job: JobDefaults,
    pub batch: BatchSettings,
    pub monitor: MonitorSettings,
    pub retry: RetrySettings,
    pub remote: RemoteSettings,
    pub local: LocalSettings,
    pub action_log: Option<PathBuf>,
}

/// Typed access over a string lookup.
struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl<'a> Env<'a> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    /// `KEY_FILE` wins over `KEY`.
    fn secret(&self, key: &str) -> FleetResult<Option<String>> {
        if let Some(path) = self.get(&format!("{}_FILE", key)) {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| FleetError::config(format!("{}_FILE={}: {}", key, path, e)))?;
            let v = raw.trim().to_string();
            return Ok(if v.is_empty() { None } else { Some(v) });
        }
        Ok(self.get(key))
    }

    fn parse<T: FromStr>(&self, key: &str) -> FleetResult<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|_| FleetError::config(format!("{}: cannot parse {:?}", key, raw))),
        }
    }

    fn num<T: FromStr>(&self, key: &str, default: T) -> FleetResult<T> {
        Ok(self.parse(key)?.unwrap_or(default))
    }

    fn secs(&self, key: &str, default: Duration) -> FleetResult<Duration> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_secs).unwrap_or(default))
    }

    fn millis(&self, key: &str, default: Duration) -> FleetResult<Duration> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis).unwrap_or(default))
    }

    fn flag(&self, key: &str, default: bool) -> FleetResult<bool> {
        match self.get(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(FleetError::config(format!("{}: expected a boolean, got {:?}", key, v))),
            },
        }
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

impl Settings {
    /// Read settings from the process environment and validate them.
    pub fn from_env() -> FleetResult<Self> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> FleetResult<Self> {
        let env = Env { lookup };

        let execution = match env.string("FLEET_EXECUTION", "remote").to_ascii_lowercase().as_str() {
            "local" => ExecutionMode::Local,
            "remote" => ExecutionMode::Remote,
            other => return Err(FleetError::config(format!("FLEET_EXECUTION: unknown mode {:?}", other))),
        };

        let kind = match env.string("PROVIDER", "http").to_ascii_lowercase().as_str() {
            "http" => MarketplaceKind::Http,
            "mock" => MarketplaceKind::Mock,
            other => return Err(FleetError::config(format!("PROVIDER: unknown marketplace {:?}", other))),
        };
        let mut bases = env.list("MARKETPLACE_API_BASE");
        bases.extend(env.list("MARKETPLACE_API_BASE_FALLBACK"));
        if bases.is_empty() {
            bases.push("https://console.vast.ai/api/v0".to_string());
        }
        let marketplace = MarketplaceSettings {
            kind,
            bases,
            api_key: env.secret("MARKETPLACE_API_KEY")?,
            request_timeout: env.secs("MARKETPLACE_TIMEOUT_SECS", Duration::from_secs(30))?,
        };

        let storage_kind = match env.string("STORAGE_BACKEND", "s3").to_ascii_lowercase().as_str() {
            "s3" => StorageKind::S3,
            "memory" => StorageKind::Memory,
            other => return Err(FleetError::config(format!("STORAGE_BACKEND: unknown backend {:?}", other))),
        };
        let mp_default = MultipartOptions::default();
        let storage = StorageSettings {
            kind: storage_kind,
            bucket: env.string("S3_BUCKET", ""),
            region: env.string("S3_REGION", "us-east-1"),
            endpoint: env.get("S3_ENDPOINT"),
            access_key_id: env.get("S3_ACCESS_KEY_ID"),
            secret_access_key: env.secret("S3_SECRET_ACCESS_KEY")?,
            operation_timeout: env.secs("S3_OPERATION_TIMEOUT_SECS", Duration::from_secs(600))?,
            multipart: MultipartOptions {
                threshold_bytes: env.num("S3_MULTIPART_THRESHOLD_MB", mp_default.threshold_bytes >> 20)? << 20,
                chunk_size_bytes: env.num("S3_MULTIPART_CHUNK_MB", mp_default.chunk_size_bytes >> 20)? << 20,
                concurrency: env.num("S3_MULTIPART_CONCURRENCY", mp_default.concurrency)?,
            },
        };

        let constraints = constraints_from(&env)?;
        let job = JobDefaults::from_env_view(&env)?;

        let batch = BatchSettings {
            input_prefix: env.string("BATCH_INPUT_PREFIX", "input/"),
            output_prefix: env.string("BATCH_OUTPUT_PREFIX", "output/"),
            media_extensions: env
                .get("BATCH_EXTENSIONS")
                .unwrap_or_else(|| DEFAULT_MEDIA_EXTENSIONS.to_string())
                .split(',')
                .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
            skip_existing: env.flag("BATCH_SKIP_EXISTING", true)?,
            overwrite: env.flag("BATCH_OVERWRITE", false)?,
            canonical_pattern: env.string("BATCH_CANONICAL_PATTERN", DEFAULT_CANONICAL_PATTERN),
        };

        let release_on_completion = parse_release(&env.string("FLEET_RELEASE_ACTION", "stop"))?;
        let monitor_default = MonitorSettings::default();
        let monitor = MonitorSettings {
            poll_interval: env.secs("MONITOR_POLL_SECS", monitor_default.poll_interval)?,
            tail_lines: env.num("MONITOR_TAIL_LINES", monitor_default.tail_lines)?,
            fatal_scan_every: env.num("MONITOR_FATAL_SCAN_EVERY", monitor_default.fatal_scan_every)?,
            fatal_scan_lines: env.num("MONITOR_FATAL_SCAN_LINES", monitor_default.fatal_scan_lines)?,
            status_check_every: env.num("MONITOR_STATUS_CHECK_EVERY", monitor_default.status_check_every)?,
            fatal_markers: match env.list("MONITOR_FATAL_MARKERS") {
                m if m.is_empty() => monitor_default.fatal_markers,
                m => m,
            },
            max_backoff: env.secs("MONITOR_MAX_BACKOFF_SECS", monitor_default.max_backoff)?,
            overall_timeout: env.secs("MONITOR_TIMEOUT_SECS", monitor_default.overall_timeout)?,
            release_on_completion,
        };

        let retry_default = RetryPolicy::default();
        let network = RetryPolicy {
            max_attempts: env.num("RETRY_MAX_ATTEMPTS", retry_default.max_attempts)?,
            base_delay: env.millis("RETRY_BASE_DELAY_MS", retry_default.base_delay)?,
            max_delay: env.millis("RETRY_MAX_DELAY_MS", retry_default.max_delay)?,
            exponential: env.flag("RETRY_EXPONENTIAL", retry_default.exponential)?,
            jitter: env.flag("RETRY_JITTER", retry_default.jitter)?,
        };
        let transfer = RetryPolicy {
            max_attempts: env.num("UPLOAD_MAX_ATTEMPTS", 5)?,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            ..network.clone()
        };
        let oom_default = OomPolicy::default();
        let oom = OomPolicy {
            max_attempts: env.num("OOM_MAX_ATTEMPTS", oom_default.max_attempts)?,
            min_batch_size: env.num("OOM_MIN_BATCH_SIZE", oom_default.min_batch_size)?,
            ..oom_default
        };

        let remote_default = RemoteSettings::default();
        let remote = RemoteSettings {
            image: env.string("FLEET_IMAGE", &remote_default.image),
            onstart: env.string("FLEET_ONSTART", &remote_default.onstart),
            constraints: constraints.clone(),
            startup_timeout: env.secs("FLEET_STARTUP_TIMEOUT_SECS", remote_default.startup_timeout)?,
            startup_poll: env.secs("FLEET_STARTUP_POLL_SECS", remote_default.startup_poll)?,
            presign_ttl: env.secs("FLEET_PRESIGN_TTL_SECS", remote_default.presign_ttl)?,
            disk_gb_override: env.parse("FLEET_DISK_GB")?,
            release_on_failure: parse_release(&env.string("FLEET_RELEASE_ON_FAILURE", "stop"))?,
            label_prefix: env.string("FLEET_LABEL_PREFIX", &remote_default.label_prefix),
        };

        let workspace_root = env
            .get("FLEET_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("gpufleet"));
        let local = LocalSettings {
            ledger_path: env
                .get("FLEET_LEDGER_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("pending_upload.json")),
            workspace_root,
            processor_bin: env.string("PROCESSOR_BIN", "vfx-processor"),
            processor_args: env
                .get("PROCESSOR_ARGS")
                .map(|a| a.split_whitespace().map(|s| s.to_string()).collect())
                .unwrap_or_default(),
            processor_timeout: env.secs("PROCESSOR_TIMEOUT_SECS", Duration::from_secs(6 * 3600))?,
            ffmpeg_bin: env.string("FFMPEG_BIN", "ffmpeg"),
            ffprobe_bin: env.string("FFPROBE_BIN", "ffprobe"),
            download_timeout: env.secs("DOWNLOAD_TIMEOUT_SECS", Duration::from_secs(3600))?,
        };

        let settings = Settings {
            execution,
            marketplace,
            storage,
            constraints,
            job,
            batch,
            monitor,
            retry: RetrySettings { network, transfer, oom },
            remote,
            local,
            action_log: env.get("FLEET_ACTION_LOG").map(PathBuf::from),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> FleetResult<()> {
        self.job.validate()?;
        if self.storage.bucket.is_empty() && self.storage.kind == StorageKind::S3 {
            return Err(FleetError::config("S3_BUCKET is required"));
        }
        if self.marketplace.kind == MarketplaceKind::Http
            && self.execution == ExecutionMode::Remote
            && self.marketplace.api_key.is_none()
        {
            return Err(FleetError::config(
                "MARKETPLACE_API_KEY (or MARKETPLACE_API_KEY_FILE) is required for remote execution",
            ));
        }
        let c = &self.constraints;
        if !(0.0..=1.0).contains(&c.min_reliability) {
            return Err(FleetError::config("FLEET_MIN_RELIABILITY must be within 0..=1"));
        }
        if c.max_price_per_hour.is_some_and(|p| p <= 0.0) {
            return Err(FleetError::config("FLEET_MAX_PRICE must be positive"));
        }
        if c.num_gpus == 0 {
            return Err(FleetError::config("FLEET_NUM_GPUS must be at least 1"));
        }
        if self.batch.media_extensions.is_empty() {
            return Err(FleetError::config("BATCH_EXTENSIONS is empty"));
        }
        if self.batch.input_prefix.trim_matches('/') == self.batch.output_prefix.trim_matches('/') {
            return Err(FleetError::config("BATCH_INPUT_PREFIX and BATCH_OUTPUT_PREFIX must differ"));
        }
        if self.remote.presign_ttl > MAX_PRESIGN_TTL {
            return Err(FleetError::config("FLEET_PRESIGN_TTL_SECS exceeds one week"));
        }
        if self.monitor.tail_lines == 0 || self.monitor.poll_interval.is_zero() {
            return Err(FleetError::config("monitor tail lines and poll interval must be positive"));
        }
        if self.retry.oom.min_batch_size == 0 {
            return Err(FleetError::config("OOM_MIN_BATCH_SIZE must be at least 1"));
        }
        Ok(())
    }
}

fn parse_release(raw: &str) -> FleetResult<ReleaseAction> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "stop" => Ok(ReleaseAction::Stop),
        "destroy" => Ok(ReleaseAction::Destroy),
        other => Err(FleetError::config(format!("unknown release action {:?} (stop|destroy)", other))),
    }
}

fn constraints_from(env: &Env<'_>) -> FleetResult<OfferConstraints> {
    let d = OfferConstraints::default();
    let max_price = match env.get("FLEET_MAX_PRICE").map(|v| v.to_ascii_lowercase()) {
        Some(v) if v == "none" || v == "unlimited" => None,
        Some(_) => env.parse::<f64>("FLEET_MAX_PRICE")?,
        None => d.max_price_per_hour,
    };
    let mobile_raw = env.get("FLEET_GPU_MOBILE_MARKERS");
    Ok(OfferConstraints {
        min_vram_mb: env.parse::<u64>("FLEET_MIN_VRAM_GB")?.map(|gb| gb * 1024).unwrap_or(d.min_vram_mb),
        max_price_per_hour: max_price,
        min_reliability: env.num("FLEET_MIN_RELIABILITY", d.min_reliability)?,
        num_gpus: env.num("FLEET_NUM_GPUS", d.num_gpus)?,
        gpu_allow: env.list("FLEET_GPU_ALLOW"),
        gpu_deny: env.list("FLEET_GPU_DENY"),
        mobile_markers: parse_patterns(mobile_raw.as_deref(), DEFAULT_MOBILE_GPU_MARKERS),
        preferred_gpus: env.list("FLEET_PREFERRED_GPUS"),
        strict_preferred: env.flag("FLEET_STRICT_PREFERRED", d.strict_preferred)?,
        host_allow: env.list("FLEET_HOST_ALLOW"),
        host_deny: env.list("FLEET_HOST_DENY"),
        min_inet_down_mbps: env.num("FLEET_MIN_DOWN_MBPS", d.min_inet_down_mbps)?,
        min_inet_up_mbps: env.num("FLEET_MIN_UP_MBPS", d.min_inet_up_mbps)?,
        datacenter_only: env.flag("FLEET_DATACENTER_ONLY", d.datacenter_only)?,
        verified_only: env.flag("FLEET_VERIFIED_ONLY", d.verified_only)?,
        search_limit: env.num("FLEET_SEARCH_LIMIT", d.search_limit)?,
    })
}

impl JobDefaults {
    fn from_env_view(env: &Env<'_>) -> FleetResult<Self> {
        let mode_raw = env.string(ENV_MODE, "upscale");
        let mode = JobMode::parse(&mode_raw)
            .ok_or_else(|| FleetError::config(format!("{}: unknown mode {:?}", ENV_MODE, mode_raw)))?;
        let strategy = match env.get(ENV_STRATEGY) {
            None => CombinedStrategy::default(),
            Some(raw) => CombinedStrategy::parse(&raw)
                .ok_or_else(|| FleetError::config(format!("{}: unknown strategy {:?}", ENV_STRATEGY, raw)))?,
        };
        let d = JobParams::default();
        let params = JobParams {
            scale: env.num(ENV_SCALE, d.scale)?,
            target_fps: env.parse(ENV_TARGET_FPS)?,
            interpolation_factor: env.parse(ENV_INTERP_FACTOR)?,
            batch_size: env.num(ENV_BATCH_SIZE, d.batch_size)?,
            backend: env.get(ENV_BACKEND),
            strict_gpu: env.flag(ENV_STRICT_GPU, d.strict_gpu)?,
        };
        Ok(Self { mode, params, strategy })
    }

    pub fn validate(&self) -> FleetResult<()> {
        let p = &self.params;
        if matches!(self.mode, JobMode::Upscale | JobMode::Both) && p.scale == 0 {
            return Err(FleetError::config(format!("{} must be at least 1", ENV_SCALE)));
        }
        if matches!(self.mode, JobMode::Interpolate | JobMode::Both) {
            if let Some(f) = p.interpolation_factor {
                if f <= 1.0 {
                    return Err(FleetError::config(format!("{} must be greater than 1", ENV_INTERP_FACTOR)));
                }
            }
            if p.target_fps.is_some_and(|t| t <= 0.0) {
                return Err(FleetError::config(format!("{} must be positive", ENV_TARGET_FPS)));
            }
        }
        if p.batch_size == 0 {
            return Err(FleetError::config(format!("{} must be at least 1", ENV_BATCH_SIZE)));
        }
        Ok(())
    }
}

/// A single job as handed to `run-job` through the instance environment.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEnv {
    pub job_id: Uuid,
    pub input: String,
    pub output_bucket: String,
    pub output_key: String,
    /// Present when the node uploads with a presigned URL instead of credentials.
    pub output_put_url: Option<String>,
    pub mode: JobMode,
    pub params: JobParams,
    pub strategy: CombinedStrategy,
}

impl JobEnv {
    pub fn to_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        let mut put = |k: &str, v: String| {
            env.insert(k.to_string(), v);
        };
        put(ENV_JOB_ID, self.job_id.to_string());
        put(ENV_INPUT, self.input.clone());
        put(ENV_OUTPUT_BUCKET, self.output_bucket.clone());
        put(ENV_OUTPUT_KEY, self.output_key.clone());
        if let Some(url) = &self.output_put_url {
            put(ENV_OUTPUT_PUT_URL, url.clone());
        }
        put(ENV_MODE, self.mode.as_str().to_string());
        put(ENV_STRATEGY, self.strategy.as_str().to_string());
        put(ENV_SCALE, self.params.scale.to_string());
        put(ENV_BATCH_SIZE, self.params.batch_size.to_string());
        put(ENV_STRICT_GPU, self.params.strict_gpu.to_string());
        if let Some(t) = self.params.target_fps {
            put(ENV_TARGET_FPS, t.to_string());
        }
        if let Some(f) = self.params.interpolation_factor {
            put(ENV_INTERP_FACTOR, f.to_string());
        }
        if let Some(b) = &self.params.backend {
            put(ENV_BACKEND, b.clone());
        }
        env
    }

    pub fn from_env() -> FleetResult<Self> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> FleetResult<Self> {
        let env = Env { lookup };
        let required = |key: &str| env.get(key).ok_or_else(|| FleetError::config(format!("{} is required", key)));
        let job_id = match env.get(ENV_JOB_ID) {
            Some(raw) => Uuid::parse_str(&raw)
                .map_err(|_| FleetError::config(format!("{}: invalid uuid {:?}", ENV_JOB_ID, raw)))?,
            None => Uuid::new_v4(),
        };
        let defaults = JobDefaults::from_env_view(&env)?;
        defaults.validate()?;
        Ok(Self {
            job_id,
            input: required(ENV_INPUT)?,
            output_bucket: env.string(ENV_OUTPUT_BUCKET, ""),
            output_key: required(ENV_OUTPUT_KEY)?,
            output_put_url: env.get(ENV_OUTPUT_PUT_URL),
            mode: defaults.mode,
            params: defaults.params,
            strategy: defaults.strategy,
        })
    }

    pub fn to_job(&self) -> gpufleet_common::Job {
        let mut job = gpufleet_common::Job::new(&self.input, self.mode, self.params.clone(), &self.output_key)
            .with_strategy(self.strategy);
        job.id = self.job_id;
        job
    }
}
