use chrono::Utc;
use gpufleet_common::bus::FleetEventEnvelope;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Action logger for the orchestrator: every record is one JSON line appended
/// to the configured file. Without a file, records only go to tracing.
///
/// Logging never fails the caller; write errors are downgraded to warnings.
#[derive(Clone)]
pub struct ActionLogger {
    path: Option<Arc<PathBuf>>,
    component: &'static str,
    write_lock: Arc<Mutex<()>>,
}

impl ActionLogger {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path: path.map(Arc::new),
            component: "orchestrator",
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn with_component(mut self, component: &'static str) -> Self {
        self.component = component;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref().map(|p| p.as_path())
    }

    async fn append(&self, record: Value) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        let mut line = record.to_string();
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("[actions] cannot create {}: {}", parent.display(), e);
                return;
            }
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await;
        match file {
            Ok(mut f) => {
                if let Err(e) = f.write_all(line.as_bytes()).await {
                    warn!("[actions] write to {} failed: {}", path.display(), e);
                }
            }
            Err(e) => warn!("[actions] cannot open {}: {}", path.display(), e),
        }
    }

    pub async fn log_event(
        &self,
        action_type: &str,
        status: &str,
        subject_id: &str,
        error_message: Option<&str>,
    ) -> Uuid {
        self.log_event_with_metadata(action_type, status, subject_id, error_message, None)
            .await
    }

    /// Log event with metadata (context info)
    pub async fn log_event_with_metadata(
        &self,
        action_type: &str,
        status: &str,
        subject_id: &str,
        error_message: Option<&str>,
        metadata: Option<Value>,
    ) -> Uuid {
        let log_id = Uuid::new_v4();
        info!(
            "[actions] {} - {} ({}) subject={}",
            action_type, status, log_id, subject_id
        );
        self.append(json!({
            "kind": "start",
            "id": log_id,
            "action_type": action_type,
            "component": self.component,
            "status": status,
            "error_message": error_message,
            "subject_id": subject_id,
            "metadata": metadata,
            "created_at": Utc::now(),
        }))
        .await;
        log_id
    }

    pub async fn log_event_complete(
        &self,
        log_id: Uuid,
        status: &str,
        duration_ms: u64,
        error_message: Option<&str>,
    ) {
        self.log_event_complete_with_metadata(log_id, status, duration_ms, error_message, None)
            .await
    }

    pub async fn log_event_complete_with_metadata(
        &self,
        log_id: Uuid,
        status: &str,
        duration_ms: u64,
        error_message: Option<&str>,
        metadata: Option<Value>,
    ) {
        if let Some(err) = error_message {
            warn!("[actions] {} -> {} after {}ms: {}", log_id, status, duration_ms, err);
        } else {
            info!("[actions] {} -> {} after {}ms", log_id, status, duration_ms);
        }
        self.append(json!({
            "kind": "complete",
            "id": log_id,
            "component": self.component,
            "status": status,
            "duration_ms": duration_ms,
            "error_message": error_message,
            "metadata": metadata,
            "completed_at": Utc::now(),
        }))
        .await;
    }

    /// Quick log for one-off events (like state transitions)
    pub async fn log_quick(&self, action_type: &str, subject_id: &str, details: Option<&str>) {
        let _ = self.log_event(action_type, "success", subject_id, details).await;
    }

    /// Record a fleet domain event (offer selection, cost start/stop...).
    pub async fn emit(&self, envelope: &FleetEventEnvelope) {
        info!(
            "[events] {} from {}",
            envelope.event_type.as_str(),
            envelope.source
        );
        match serde_json::to_value(envelope) {
            Ok(mut v) => {
                v["kind"] = json!("event");
                self.append(v).await;
            }
            Err(e) => warn!("[events] cannot serialize {}: {}", envelope.event_type.as_str(), e),
        }
    }
}

/// Read back every record of an action log file. Unparsable lines are skipped.
pub async fn read_records(path: &Path) -> std::io::Result<Vec<Value>> {
    let text = tokio::fs::read_to_string(path).await?;
    Ok(text
        .lines()
        .filter_map(|l| serde_json::from_str::<Value>(l).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpufleet_common::bus::FleetEventType;

    #[tokio::test]
    async fn start_and_complete_records_share_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("actions.jsonl");
        let logger = ActionLogger::new(Some(path.clone()));

        let id = logger
            .log_event("CREATE_INSTANCE", "in_progress", "1001", None)
            .await;
        logger
            .log_event_complete(id, "failed", 42, Some("marketplace 502"))
            .await;

        let records = read_records(&path).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["id"], records[1]["id"]);
        assert_eq!(records[0]["kind"], "start");
        assert_eq!(records[1]["status"], "failed");
        assert_eq!(records[1]["duration_ms"], 42);
        assert_eq!(records[1]["error_message"], "marketplace 502");
    }

    #[tokio::test]
    async fn events_are_tagged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actions.jsonl");
        let logger = ActionLogger::new(Some(path.clone())).with_component("test");
        logger
            .emit(&FleetEventEnvelope::new(
                FleetEventType::InstanceCostStart,
                json!({"instance_id": "1001", "price_per_hour": 0.4}),
                "fleet",
            ))
            .await;
        let records = read_records(&path).await.unwrap();
        assert_eq!(records[0]["kind"], "event");
        assert_eq!(records[0]["type"], "EVT:INSTANCE_COST_START");
    }

    #[tokio::test]
    async fn disabled_logger_is_a_no_op() {
        let logger = ActionLogger::disabled();
        assert!(logger.path().is_none());
        logger.log_quick("NOOP", "x", None).await;
    }
}
