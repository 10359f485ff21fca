//! In-memory marketplace and object store.
//!
//! Used by the orchestrator's tests and for local dry runs. Behaviour is
//! scripted: offers, per-instance status sequences, log snapshots and failure
//! injection are all configured up front and every call is recorded.

use crate::{LaunchSpec, Marketplace, ObjectInfo, ObjectStorage, OfferQuery, OfferRefused};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use gpufleet_common::{ConnectionInfo, Instance, InstanceStatus, Offer, UploadResult};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
enum LogStep {
    Text(String),
    Fail(String),
}

#[derive(Debug)]
struct MockInstance {
    instance: Instance,
    status_script: VecDeque<InstanceStatus>,
    log_script: VecDeque<LogStep>,
    last_logs: String,
}

#[derive(Default)]
struct MarketState {
    offers: Vec<Offer>,
    search_calls: Vec<OfferQuery>,
    search_failures: u32,
    create_failures: u32,
    refused_offers: Vec<String>,
    create_calls: Vec<String>,
    status_failures: u32,
    stop_failures: u32,
    instances: HashMap<String, MockInstance>,
    created: Vec<(String, String, LaunchSpec)>,
    stop_calls: Vec<String>,
    destroy_calls: Vec<String>,
    default_status_script: Vec<InstanceStatus>,
    default_log_script: Vec<String>,
    next_id: u64,
}

pub struct MockMarketplace {
    state: Mutex<MarketState>,
}

impl Default for MockMarketplace {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMarketplace {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MarketState {
                default_status_script: vec![
                    InstanceStatus::Created,
                    InstanceStatus::Starting,
                    InstanceStatus::Running,
                ],
                next_id: 1000,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MarketState> {
        // A panicking test thread must not cascade into unrelated assertions.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_offers(self, offers: Vec<Offer>) -> Self {
        self.lock().offers = offers;
        self
    }

    pub fn set_offers(&self, offers: Vec<Offer>) {
        self.lock().offers = offers;
    }

    pub fn fail_next_searches(&self, n: u32) {
        self.lock().search_failures = n;
    }

    pub fn fail_next_creates(&self, n: u32) {
        self.lock().create_failures = n;
    }

    /// Every create on these offers is answered with a refusal.
    pub fn refuse_offers(&self, offer_ids: &[&str]) {
        self.lock().refused_offers = offer_ids.iter().map(|id| id.to_string()).collect();
    }

    /// Offer ids of every create call, refused and failed ones included.
    pub fn create_calls(&self) -> Vec<String> {
        self.lock().create_calls.clone()
    }

    pub fn fail_next_status_calls(&self, n: u32) {
        self.lock().status_failures = n;
    }

    pub fn fail_next_stops(&self, n: u32) {
        self.lock().stop_failures = n;
    }

    /// Status sequence every newly created instance walks through
    /// (the last entry is sticky).
    pub fn set_default_status_script(&self, script: Vec<InstanceStatus>) {
        self.lock().default_status_script = script;
    }

    /// Log snapshots every newly created instance returns, one per call
    /// (the last entry is sticky).
    pub fn set_default_log_script(&self, script: Vec<String>) {
        self.lock().default_log_script = script;
    }

    /// Register an instance directly, e.g. a node that is being reused.
    pub fn insert_instance(&self, id: &str, status: InstanceStatus) {
        let mut st = self.lock();
        let inst = mock_instance(id, None, status, 0.0, "RTX 4090");
        st.instances.insert(
            id.to_string(),
            MockInstance {
                instance: inst,
                status_script: VecDeque::new(),
                log_script: VecDeque::new(),
                last_logs: String::new(),
            },
        );
    }

    pub fn push_logs(&self, id: &str, text: &str) {
        if let Some(mi) = self.lock().instances.get_mut(id) {
            mi.log_script.push_back(LogStep::Text(text.to_string()));
        }
    }

    pub fn push_log_failure(&self, id: &str, message: &str) {
        if let Some(mi) = self.lock().instances.get_mut(id) {
            mi.log_script.push_back(LogStep::Fail(message.to_string()));
        }
    }

    pub fn search_calls(&self) -> Vec<OfferQuery> {
        self.lock().search_calls.clone()
    }

    pub fn created(&self) -> Vec<(String, String, LaunchSpec)> {
        self.lock().created.clone()
    }

    pub fn stop_calls(&self) -> Vec<String> {
        self.lock().stop_calls.clone()
    }

    pub fn destroy_calls(&self) -> Vec<String> {
        self.lock().destroy_calls.clone()
    }

    pub fn status_of(&self, id: &str) -> Option<InstanceStatus> {
        self.lock().instances.get(id).map(|mi| mi.instance.status)
    }
}

fn mock_instance(
    id: &str,
    offer_id: Option<&str>,
    status: InstanceStatus,
    price: f64,
    gpu: &str,
) -> Instance {
    Instance {
        id: id.to_string(),
        offer_id: offer_id.map(|s| s.to_string()),
        status,
        raw_status: Some(status.as_str().to_string()),
        connection: ConnectionInfo {
            public_ip: Some("127.0.0.1".to_string()),
            ssh_host: Some("ssh.mock".to_string()),
            ssh_port: Some(22),
        },
        price_per_hour: price,
        gpu_name: gpu.to_string(),
        num_gpus: 1,
        created_at: Utc::now(),
    }
}

#[async_trait]
impl Marketplace for MockMarketplace {
    fn name(&self) -> &str {
        "mock"
    }

    async fn search_offers(&self, query: &OfferQuery) -> Result<Vec<Offer>> {
        let mut st = self.lock();
        st.search_calls.push(query.clone());
        if st.search_failures > 0 {
            st.search_failures -= 1;
            return Err(anyhow!("mock: search unavailable (503)"));
        }
        // Server-side filtering is deliberately ignored, like a flaky real API.
        Ok(st.offers.clone())
    }

    async fn create_instance(&self, offer_id: &str, spec: &LaunchSpec) -> Result<String> {
        let mut st = self.lock();
        st.create_calls.push(offer_id.to_string());
        if st.create_failures > 0 {
            st.create_failures -= 1;
            return Err(anyhow!("mock: create failed (502)"));
        }
        if st.refused_offers.iter().any(|id| id == offer_id) {
            return Err(OfferRefused::new(offer_id, "offer no longer available").into());
        }
        let offer = st.offers.iter().find(|o| o.id == offer_id).cloned();
        let (price, gpu) = offer
            .map(|o| (o.price_per_hour, o.gpu_name))
            .unwrap_or((0.0, "unknown".to_string()));
        st.next_id += 1;
        let id = st.next_id.to_string();
        let mut script: VecDeque<InstanceStatus> = st.default_status_script.iter().copied().collect();
        let first = script.pop_front().unwrap_or(InstanceStatus::Created);
        let logs: VecDeque<LogStep> = st
            .default_log_script
            .iter()
            .cloned()
            .map(LogStep::Text)
            .collect();
        st.instances.insert(
            id.clone(),
            MockInstance {
                instance: mock_instance(&id, Some(offer_id), first, price, &gpu),
                status_script: script,
                log_script: logs,
                last_logs: String::new(),
            },
        );
        st.created.push((id.clone(), offer_id.to_string(), spec.clone()));
        Ok(id)
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<Instance>> {
        let mut st = self.lock();
        if st.status_failures > 0 {
            st.status_failures -= 1;
            return Err(anyhow!("mock: status unavailable (504)"));
        }
        let Some(mi) = st.instances.get_mut(instance_id) else {
            return Ok(None);
        };
        // Stop/destroy override the script.
        if !mi.instance.status.is_terminal() {
            if let Some(next) = mi.status_script.pop_front() {
                mi.instance.status = next;
                mi.instance.raw_status = Some(next.as_str().to_string());
            }
        }
        Ok(Some(mi.instance.clone()))
    }

    async fn get_logs(&self, instance_id: &str, _tail: usize) -> Result<String> {
        let mut st = self.lock();
        let mi = st
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| anyhow!("mock: unknown instance {}", instance_id))?;
        match mi.log_script.pop_front() {
            Some(LogStep::Text(t)) => {
                mi.last_logs = t.clone();
                Ok(t)
            }
            Some(LogStep::Fail(msg)) => Err(anyhow!("mock: {}", msg)),
            None => Ok(mi.last_logs.clone()),
        }
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<bool> {
        let mut st = self.lock();
        st.stop_calls.push(instance_id.to_string());
        if st.stop_failures > 0 {
            st.stop_failures -= 1;
            return Err(anyhow!("mock: stop failed (500)"));
        }
        match st.instances.get_mut(instance_id) {
            Some(mi) if !mi.instance.status.is_terminal() => {
                mi.instance.status = InstanceStatus::Stopped;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn destroy_instance(&self, instance_id: &str) -> Result<bool> {
        let mut st = self.lock();
        st.destroy_calls.push(instance_id.to_string());
        match st.instances.get_mut(instance_id) {
            Some(mi) if mi.instance.status != InstanceStatus::Terminated => {
                mi.instance.status = InstanceStatus::Terminated;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Default)]
struct StoreState {
    objects: BTreeMap<String, Vec<u8>>,
    upload_failures: u32,
    upload_calls: Vec<String>,
}

/// Object store backed by a map; presigned URLs are fake but well-formed.
pub struct MemoryStorage {
    bucket: String,
    state: Mutex<StoreState>,
}

impl MemoryStorage {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            state: Mutex::new(StoreState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn put(&self, key: &str, bytes: &[u8]) {
        self.lock().objects.insert(key.to_string(), bytes.to_vec());
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    pub fn fail_next_uploads(&self, n: u32) {
        self.lock().upload_failures = n;
    }

    pub fn upload_calls(&self) -> Vec<String> {
        self.lock().upload_calls.clone()
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| ObjectInfo {
                key: k.clone(),
                size: v.len() as u64,
                etag: None,
            })
            .collect())
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>> {
        Ok(self.lock().objects.get(key).map(|v| ObjectInfo {
            key: key.to_string(),
            size: v.len() as u64,
            etag: None,
        }))
    }

    async fn upload_file(&self, path: &Path, key: &str) -> Result<UploadResult> {
        let bytes = tokio::fs::read(path).await?;
        let mut st = self.lock();
        st.upload_calls.push(key.to_string());
        if st.upload_failures > 0 {
            st.upload_failures -= 1;
            return Err(anyhow!("mock: upload of {} failed (connection reset)", key));
        }
        let size = bytes.len() as u64;
        st.objects.insert(key.to_string(), bytes);
        Ok(UploadResult {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            size,
            etag: None,
            url: None,
            multipart: false,
        })
    }

    async fn download_file(&self, key: &str, dest: &Path) -> Result<u64> {
        let bytes = self
            .get(key)
            .ok_or_else(|| anyhow!("mock: no such key {}", key))?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &bytes).await?;
        Ok(bytes.len() as u64)
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String> {
        Ok(format!(
            "https://storage.mock/{}/{}?X-Amz-Expires={}",
            self.bucket,
            key,
            expires_in.as_secs()
        ))
    }

    async fn presign_put(&self, key: &str, expires_in: Duration) -> Result<String> {
        Ok(format!(
            "https://storage.mock/{}/{}?X-Amz-Expires={}&method=PUT",
            self.bucket,
            key,
            expires_in.as_secs()
        ))
    }
}
