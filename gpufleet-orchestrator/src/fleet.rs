use crate::logger::ActionLogger;
use crate::retry::{retry, retry_if, with_timeout, RetryPolicy};
use chrono::Utc;
use gpufleet_common::bus::{FleetEventEnvelope, FleetEventType};
use gpufleet_common::{ConnectionInfo, FleetError, FleetResult, Instance, InstanceStatus, Offer};
use gpufleet_providers::{LaunchSpec, Marketplace, OfferRefused};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// What to do with an instance once its job is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleaseAction {
    /// Halts compute billing, keeps the disk for inspection.
    #[default]
    Stop,
    Destroy,
}

impl ReleaseAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseAction::Stop => "stop",
            ReleaseAction::Destroy => "destroy",
        }
    }
}

/// Instance lifecycle against one marketplace client. Every call is bounded
/// by `call_timeout` and retried with `retry`.
pub struct FleetManager {
    marketplace: Arc<dyn Marketplace>,
    retry: RetryPolicy,
    call_timeout: Duration,
    actions: ActionLogger,
}

impl FleetManager {
    pub fn new(
        marketplace: Arc<dyn Marketplace>,
        retry: RetryPolicy,
        call_timeout: Duration,
        actions: ActionLogger,
    ) -> Self {
        Self {
            marketplace,
            retry,
            call_timeout,
            actions,
        }
    }

    pub fn marketplace(&self) -> &Arc<dyn Marketplace> {
        &self.marketplace
    }

    pub async fn create_instance(&self, offer: &Offer, spec: &LaunchSpec) -> FleetResult<Instance> {
        let started = Instant::now();
        let log_id = self
            .actions
            .log_event_with_metadata(
                "INSTANCE_CREATE",
                "in_progress",
                &offer.id,
                None,
                Some(json!({
                    "gpu_name": offer.gpu_name,
                    "price_per_hour": offer.price_per_hour,
                    "image": spec.image,
                    "disk_gb": spec.disk_gb,
                    "restart_policy": LaunchSpec::RESTART_POLICY,
                })),
            )
            .await;

        let limit = self.call_timeout;
        let created = retry_if(
            &self.retry,
            "create_instance",
            |e: &anyhow::Error| OfferRefused::find(e).is_none(),
            |_| {
                let marketplace = self.marketplace.clone();
                async move {
                    with_timeout(limit, "create_instance", marketplace.create_instance(&offer.id, spec))
                        .await
                }
            },
        )
        .await;

        let instance_id = match created {
            Ok(id) => id,
            Err(e) => {
                let msg = format!("{:#}", e);
                self.actions
                    .log_event_complete(log_id, "failed", elapsed_ms(started), Some(&msg))
                    .await;
                // A refusal concerns this offer only; the caller may try another.
                if let Some(refused) = OfferRefused::find(&e) {
                    warn!("[fleet] {}", refused);
                    return Err(FleetError::OfferRejected {
                        reason: refused.to_string(),
                    });
                }
                return Err(FleetError::marketplace(msg));
            }
        };

        self.actions
            .log_event_complete_with_metadata(
                log_id,
                "success",
                elapsed_ms(started),
                None,
                Some(json!({ "instance_id": instance_id })),
            )
            .await;
        self.actions
            .emit(&FleetEventEnvelope::new(
                FleetEventType::InstanceCostStart,
                json!({
                    "instance_id": instance_id,
                    "offer_id": offer.id,
                    "price_per_hour": offer.price_per_hour,
                }),
                "fleet",
            ))
            .await;

        // The snapshot is best-effort; the create call is what matters.
        let snapshot = match self.status(&instance_id).await {
            Ok(Some(inst)) => inst,
            Ok(None) | Err(_) => Instance {
                id: instance_id.clone(),
                offer_id: Some(offer.id.clone()),
                status: InstanceStatus::Created,
                raw_status: None,
                connection: ConnectionInfo::default(),
                price_per_hour: offer.price_per_hour,
                gpu_name: offer.gpu_name.clone(),
                num_gpus: offer.num_gpus,
                created_at: Utc::now(),
            },
        };
        info!(
            "[fleet] instance {} created from offer {} ({})",
            snapshot.id,
            offer.id,
            snapshot.status.as_str()
        );
        Ok(snapshot)
    }

    pub async fn status(&self, instance_id: &str) -> FleetResult<Option<Instance>> {
        let limit = self.call_timeout;
        retry(&self.retry, "get_instance", |_| {
            let marketplace = self.marketplace.clone();
            async move { with_timeout(limit, "get_instance", marketplace.get_instance(instance_id)).await }
        })
        .await
        .map_err(|e| FleetError::marketplace(format!("{:#}", e)))
    }

    /// Poll until the instance reports running. Status-call failures are
    /// tolerated until the deadline; a terminal or vanished instance is not.
    pub async fn wait_until_running(
        &self,
        instance_id: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> FleetResult<Instance> {
        let started = Instant::now();
        let mut last_status = "unknown".to_string();
        loop {
            match self.status(instance_id).await {
                Ok(Some(inst)) => {
                    last_status = inst
                        .raw_status
                        .clone()
                        .unwrap_or_else(|| inst.status.as_str().to_string());
                    if inst.status == InstanceStatus::Running {
                        info!(
                            "[fleet] instance {} running after {}s",
                            instance_id,
                            started.elapsed().as_secs()
                        );
                        return Ok(inst);
                    }
                    if inst.status.is_terminal() {
                        warn!("[fleet] instance {} reached {} before running", instance_id, last_status);
                        return Err(FleetError::InstanceTerminatedUnexpectedly {
                            instance_id: instance_id.to_string(),
                            status: last_status,
                        });
                    }
                }
                Ok(None) => {
                    return Err(FleetError::InstanceTerminatedUnexpectedly {
                        instance_id: instance_id.to_string(),
                        status: "gone".to_string(),
                    });
                }
                Err(e) => warn!("[fleet] status of {} unavailable: {}", instance_id, e),
            }

            if started.elapsed() + poll_interval > timeout {
                return Err(FleetError::InstanceStartupTimeout {
                    instance_id: instance_id.to_string(),
                    waited_secs: started.elapsed().as_secs(),
                    last_status,
                });
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// One bounded log fetch. No retry here: the monitor owns the backoff.
    pub async fn fetch_logs(&self, instance_id: &str, tail: usize) -> anyhow::Result<String> {
        with_timeout(
            self.call_timeout,
            "get_logs",
            self.marketplace.get_logs(instance_id, tail),
        )
        .await
    }

    /// Idempotent. Failures are warnings only.
    pub async fn stop(&self, instance_id: &str) -> bool {
        self.release(instance_id, ReleaseAction::Stop).await
    }

    /// Idempotent. Failures are warnings only.
    pub async fn destroy(&self, instance_id: &str) -> bool {
        self.release(instance_id, ReleaseAction::Destroy).await
    }

    /// Returns true when the marketplace acknowledged a state change.
    pub async fn release(&self, instance_id: &str, action: ReleaseAction) -> bool {
        let action_type = match action {
            ReleaseAction::Stop => "INSTANCE_STOP",
            ReleaseAction::Destroy => "INSTANCE_DESTROY",
        };
        let started = Instant::now();
        let log_id = self
            .actions
            .log_event(action_type, "in_progress", instance_id, None)
            .await;

        let limit = self.call_timeout;
        let res = retry(&self.retry, action_type, |_| {
            let marketplace = self.marketplace.clone();
            async move {
                match action {
                    ReleaseAction::Stop => {
                        with_timeout(limit, "stop_instance", marketplace.stop_instance(instance_id)).await
                    }
                    ReleaseAction::Destroy => {
                        with_timeout(limit, "destroy_instance", marketplace.destroy_instance(instance_id))
                            .await
                    }
                }
            }
        })
        .await;

        match res {
            Ok(changed) => {
                if changed {
                    info!("[fleet] instance {} {}", instance_id, action.as_str());
                } else {
                    info!(
                        "[fleet] instance {} already released ({} was a no-op)",
                        instance_id,
                        action.as_str()
                    );
                }
                self.actions
                    .log_event_complete(log_id, "success", elapsed_ms(started), None)
                    .await;
                self.actions
                    .emit(&FleetEventEnvelope::new(
                        FleetEventType::InstanceCostStop,
                        json!({ "instance_id": instance_id, "action": action.as_str() }),
                        "fleet",
                    ))
                    .await;
                changed
            }
            Err(e) => {
                let msg = format!("{:#}", e);
                warn!(
                    "[fleet] {} of instance {} failed, it may still be billing: {}",
                    action.as_str(),
                    instance_id,
                    msg
                );
                self.actions
                    .log_event_complete(log_id, "failed", elapsed_ms(started), Some(&msg))
                    .await;
                false
            }
        }
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
