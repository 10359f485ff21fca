use crate::shapes::{self, LogsLocation};
use crate::{LaunchSpec, Marketplace, OfferQuery};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use gpufleet_common::{Instance, Offer};
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Marketplace REST client with ordered base-URL failover.
///
/// Requests go to the primary base first and walk the fallbacks in order.
/// The first fallback that answers is pinned for the rest of this client's
/// lifetime: later requests go only to it and the primary is not retried.
/// The pin lives on the client, so two clients never influence each other.
pub struct HttpMarketplace {
    client: Client,
    bases: Vec<String>,
    api_key: String,
    pinned: AtomicUsize,
}

struct ApiResponse {
    status: StatusCode,
    body: String,
}

impl HttpMarketplace {
    pub fn new(bases: Vec<String>, api_key: String, request_timeout: Duration) -> Result<Self> {
        // Default reqwest client has no overall timeout. If the marketplace stalls, a job can hang forever.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(request_timeout)
            .build()
            .context("failed to build marketplace HTTP client")?;
        let bases: Vec<String> = bases
            .into_iter()
            .map(|b| b.trim().trim_end_matches('/').to_string())
            .filter(|b| !b.is_empty())
            .collect();
        if bases.is_empty() {
            return Err(anyhow!("at least one marketplace base URL is required"));
        }
        Ok(Self {
            client,
            bases,
            api_key: api_key.trim().to_string(),
            pinned: AtomicUsize::new(0),
        })
    }

    /// Base URL currently used first.
    pub fn active_base(&self) -> &str {
        &self.bases[self.pinned.load(Ordering::Relaxed) % self.bases.len()]
    }

    fn base_order(&self) -> Vec<usize> {
        match self.pinned.load(Ordering::Relaxed) % self.bases.len() {
            0 => (0..self.bases.len()).collect(),
            pinned => vec![pinned],
        }
    }

    /// Send one request, walking the base list on transport errors, 5xx and 429.
    /// Any other status is an answer from a healthy base and is returned as-is.
    async fn call(&self, method: Method, path: &str, body: Option<&Value>) -> Result<ApiResponse> {
        let mut failures = Vec::new();
        for idx in self.base_order() {
            let url = format!("{}/{}", self.bases[idx], path.trim_start_matches('/'));
            let mut req = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(&self.api_key);
            if let Some(b) = body {
                req = req.json(b);
            }
            debug!("[marketplace] {} {}", method, url);

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                        warn!("[marketplace] {} {} -> {} (trying next base)", method, url, status);
                        failures.push(format!("{}: status={}", self.bases[idx], status));
                        continue;
                    }
                    if idx != 0
                        && self
                            .pinned
                            .compare_exchange(0, idx, Ordering::Relaxed, Ordering::Relaxed)
                            .is_ok()
                    {
                        info!(
                            "[marketplace] pinned API base {} after failover from {}",
                            self.bases[idx], self.bases[0]
                        );
                    }
                    return Ok(ApiResponse { status, body: text });
                }
                Err(e) => {
                    warn!("[marketplace] {} {} failed: {}", method, url, e);
                    failures.push(format!("{}: {}", self.bases[idx], e));
                }
            }
        }
        Err(anyhow!(
            "all marketplace bases failed: {}",
            failures.join("; ")
        ))
    }

    fn ensure_success(resp: &ApiResponse, what: &str) -> Result<()> {
        if resp.status.is_success() {
            return Ok(());
        }
        Err(anyhow!(
            "marketplace {} failed: status={} body={}",
            what,
            resp.status.as_u16(),
            resp.body
        ))
    }

    fn search_payload(query: &OfferQuery) -> Value {
        let mut q = json!({
            "rentable": {"eq": true},
            "rented": {"eq": false},
            "gpu_ram": {"gte": query.min_vram_mb},
            "reliability2": {"gte": query.min_reliability},
            "num_gpus": {"gte": query.num_gpus.max(1)},
            "inet_down": {"gte": query.min_inet_down_mbps},
            "order": [["dph_total", "asc"]],
            "type": "on-demand",
            "limit": query.limit.max(1),
        });
        if let Some(max) = query.max_price_per_hour {
            q["dph_total"] = json!({"lte": max});
        }
        if query.verified_only {
            q["verified"] = json!({"eq": true});
        }
        if query.datacenter_only {
            q["datacenter"] = json!({"eq": true});
        }
        json!({ "q": q })
    }

    async fn fetch_deferred_logs(&self, url: &str) -> Result<String> {
        // The log file is uploaded asynchronously; early GETs commonly 404.
        for attempt in 0..5u32 {
            let resp = self.client.get(url).send().await?;
            if resp.status().is_success() {
                return Ok(resp.text().await?);
            }
            if resp.status() != StatusCode::NOT_FOUND && resp.status() != StatusCode::FORBIDDEN {
                return Err(anyhow!("log download failed: status={}", resp.status()));
            }
            sleep(Duration::from_millis(500 * (attempt as u64 + 1))).await;
        }
        Err(anyhow!("log file at {} never became available", url))
    }
}

#[async_trait]
impl Marketplace for HttpMarketplace {
    fn name(&self) -> &str {
        "http"
    }

    async fn search_offers(&self, query: &OfferQuery) -> Result<Vec<Offer>> {
        let payload = Self::search_payload(query);
        let resp = self.call(Method::POST, "bundles/", Some(&payload)).await?;
        Self::ensure_success(&resp, "search")?;
        let offers = shapes::parse_offers(&resp.body)?;
        debug!("[marketplace] search returned {} offer(s)", offers.len());
        Ok(offers)
    }

    async fn create_instance(&self, offer_id: &str, spec: &LaunchSpec) -> Result<String> {
        let body = json!({
            "client_id": "me",
            "image": spec.image,
            "env": spec.env,
            "onstart": spec.onstart,
            "disk": spec.disk_gb,
            "label": spec.label,
            "runtype": "ssh",
            "restart_policy": LaunchSpec::RESTART_POLICY,
        });
        info!(
            "[marketplace] creating instance from offer {} (image={}, disk={}GB)",
            offer_id, spec.image, spec.disk_gb
        );
        let resp = self
            .call(Method::PUT, &format!("asks/{}/", offer_id), Some(&body))
            .await?;
        Self::ensure_success(&resp, "create_instance")?;
        let id = shapes::parse_created_id(offer_id, &resp.body)?;
        info!("[marketplace] instance {} created from offer {}", id, offer_id);
        Ok(id)
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<Instance>> {
        let resp = self
            .call(Method::GET, &format!("instances/{}/", instance_id), None)
            .await?;
        if resp.status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::ensure_success(&resp, "get_instance")?;
        shapes::parse_instance(&resp.body)
    }

    async fn get_logs(&self, instance_id: &str, tail: usize) -> Result<String> {
        let body = json!({ "tail": tail.to_string() });
        let resp = self
            .call(
                Method::PUT,
                &format!("instances/request_logs/{}/", instance_id),
                Some(&body),
            )
            .await?;
        Self::ensure_success(&resp, "get_logs")?;
        match shapes::parse_logs(&resp.body)? {
            LogsLocation::Inline(text) => Ok(text),
            LogsLocation::Deferred(url) => self.fetch_deferred_logs(&url).await,
        }
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<bool> {
        let body = json!({ "state": "stopped" });
        let resp = self
            .call(Method::PUT, &format!("instances/{}/", instance_id), Some(&body))
            .await?;
        if resp.status == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::ensure_success(&resp, "stop_instance")?;
        Ok(true)
    }

    async fn destroy_instance(&self, instance_id: &str) -> Result<bool> {
        let resp = self
            .call(Method::DELETE, &format!("instances/{}/", instance_id), None)
            .await?;
        if resp.status == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::ensure_success(&resp, "destroy_instance")?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn base_order_starts_with_pinned() {
        let m = HttpMarketplace::new(
            vec!["https://a/api/v0/".into(), "https://b/api/v0".into(), " ".into()],
            "k".into(),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(m.active_base(), "https://a/api/v0");
        assert_eq!(m.base_order(), vec![0, 1]);
        m.pinned.store(1, Ordering::Relaxed);
        assert_eq!(m.base_order(), vec![1]);
        assert_eq!(m.active_base(), "https://b/api/v0");
    }

    /// Minimal HTTP/1.1 server answering with `statuses` in order (the last
    /// one repeats). Returns its base URL and the number of requests served.
    async fn scripted_server(statuses: Vec<u16>, body: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let script = Arc::new(Mutex::new(VecDeque::from(statuses)));
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let status = {
                    let mut s = script.lock().unwrap();
                    if s.len() > 1 {
                        s.pop_front().unwrap()
                    } else {
                        s[0]
                    }
                };
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    loop {
                        let n = match sock.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        buf.extend_from_slice(&chunk[..n]);
                        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
                            let len = head
                                .lines()
                                .find_map(|l| l.strip_prefix("content-length:"))
                                .and_then(|v| v.trim().parse::<usize>().ok())
                                .unwrap_or(0);
                            if buf.len() >= end + 4 + len {
                                break;
                            }
                        }
                    }
                    let resp = format!(
                        "HTTP/1.1 {} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = sock.write_all(resp.as_bytes()).await;
                    let _ = sock.shutdown().await;
                });
            }
        });
        (base, hits)
    }

    #[tokio::test]
    async fn fallback_that_answers_stays_pinned() {
        let (primary, primary_hits) = scripted_server(vec![503], r#"{"error":"busy"}"#).await;
        let (secondary, secondary_hits) = scripted_server(vec![200, 200, 502], r#"{"offers":[]}"#).await;
        let m = HttpMarketplace::new(
            vec![primary.clone(), secondary.clone()],
            "k".into(),
            Duration::from_secs(2),
        )
        .unwrap();

        assert!(m.search_offers(&OfferQuery::default()).await.unwrap().is_empty());
        assert_eq!(primary_hits.load(Ordering::SeqCst), 1);
        assert_eq!(secondary_hits.load(Ordering::SeqCst), 1);
        assert_eq!(m.active_base(), secondary);

        m.search_offers(&OfferQuery::default()).await.unwrap();
        assert_eq!(primary_hits.load(Ordering::SeqCst), 1);
        assert_eq!(secondary_hits.load(Ordering::SeqCst), 2);

        // The pinned fallback failing is an error, not a return to the primary.
        let err = m.search_offers(&OfferQuery::default()).await.unwrap_err().to_string();
        assert!(err.contains("status=502"), "{}", err);
        assert_eq!(primary_hits.load(Ordering::SeqCst), 1);
        assert_eq!(secondary_hits.load(Ordering::SeqCst), 3);
        assert_eq!(m.active_base(), secondary);
    }

    #[tokio::test]
    async fn healthy_primary_is_never_left() {
        let (primary, primary_hits) = scripted_server(vec![200], r#"[]"#).await;
        let (secondary, secondary_hits) = scripted_server(vec![200], r#"[]"#).await;
        let m = HttpMarketplace::new(vec![primary.clone(), secondary], "k".into(), Duration::from_secs(2)).unwrap();
        for _ in 0..3 {
            m.search_offers(&OfferQuery::default()).await.unwrap();
        }
        assert_eq!(primary_hits.load(Ordering::SeqCst), 3);
        assert_eq!(secondary_hits.load(Ordering::SeqCst), 0);
        assert_eq!(m.active_base(), primary);
    }

    #[test]
    fn empty_base_list_is_rejected() {
        assert!(HttpMarketplace::new(vec![], "k".into(), Duration::from_secs(1)).is_err());
    }

    #[test]
    fn search_payload_carries_ceiling_and_flags() {
        let q = OfferQuery {
            min_vram_mb: 16000,
            max_price_per_hour: Some(0.5),
            min_reliability: 0.9,
            num_gpus: 1,
            verified_only: true,
            datacenter_only: false,
            min_inet_down_mbps: 100.0,
            limit: 64,
        };
        let p = HttpMarketplace::search_payload(&q);
        assert_eq!(p["q"]["dph_total"]["lte"], json!(0.5));
        assert_eq!(p["q"]["verified"]["eq"], json!(true));
        assert!(p["q"].get("datacenter").is_none());
    }

    #[tokio::test]
    async fn unreachable_bases_fail_with_all_failures_listed() {
        let m = HttpMarketplace::new(
            vec!["http://127.0.0.1:9".into(), "http://127.0.0.1:10".into()],
            "k".into(),
            Duration::from_millis(300),
        )
        .unwrap();
        let err = m.get_instance("1").await.unwrap_err().to_string();
        assert!(err.contains("all marketplace bases failed"));
        assert!(err.contains("127.0.0.1:9") && err.contains("127.0.0.1:10"));
    }
}
