use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::JobStatus;

// -----------------------------------------------------------------------------
// Remote log protocol (printed by the on-node pipeline, parsed by the monitor)
// -----------------------------------------------------------------------------

pub const PHASE_MARKER_PREFIX: &str = "::phase::";
pub const EVENT_MARKER_PREFIX: &str = "::event::";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum RemoteEventKind {
    #[serde(rename = "upload_confirmed")]
    UploadConfirmed,
    #[serde(rename = "job_failed")]
    JobFailed,
}

impl RemoteEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteEventKind::UploadConfirmed => "upload_confirmed",
            RemoteEventKind::JobFailed => "job_failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "upload_confirmed" => Some(RemoteEventKind::UploadConfirmed),
            "job_failed" => Some(RemoteEventKind::JobFailed),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UploadConfirmedPayload {
    pub bucket: String,
    pub key: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct JobFailedPayload {
    pub stage: String,
    pub message: String,
}

/// `::phase::<stage>` line emitted when the on-node pipeline enters a stage.
pub fn phase_line(stage: JobStatus) -> String {
    format!("{}{}", PHASE_MARKER_PREFIX, stage.as_str())
}

/// `::event::<kind> <json>` line.
pub fn event_line<T: Serialize>(kind: RemoteEventKind, payload: &T) -> String {
    let body = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    format!("{}{} {}", EVENT_MARKER_PREFIX, kind.as_str(), body)
}

// -----------------------------------------------------------------------------
// Fleet domain events (EVT:*), recorded in the action log
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum FleetEventType {
    #[serde(rename = "EVT:OFFER_SELECTED")]
    OfferSelected,
    #[serde(rename = "EVT:INSTANCE_COST_START")]
    InstanceCostStart,
    #[serde(rename = "EVT:INSTANCE_COST_STOP")]
    InstanceCostStop,
    #[serde(rename = "EVT:JOB_STAGE")]
    JobStage,
    #[serde(rename = "EVT:JOB_DONE")]
    JobDone,
    #[serde(rename = "EVT:JOB_FAILED")]
    JobFailed,
    #[serde(rename = "EVT:UPLOAD_CONFIRMED")]
    UploadConfirmed,
}

impl FleetEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FleetEventType::OfferSelected => "EVT:OFFER_SELECTED",
            FleetEventType::InstanceCostStart => "EVT:INSTANCE_COST_START",
            FleetEventType::InstanceCostStop => "EVT:INSTANCE_COST_STOP",
            FleetEventType::JobStage => "EVT:JOB_STAGE",
            FleetEventType::JobDone => "EVT:JOB_DONE",
            FleetEventType::JobFailed => "EVT:JOB_FAILED",
            FleetEventType::UploadConfirmed => "EVT:UPLOAD_CONFIRMED",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FleetEventEnvelope {
    pub event_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: FleetEventType,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub source: String,
}

impl FleetEventEnvelope {
    pub fn new(event_type: FleetEventType, payload: serde_json::Value, source: &str) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            occurred_at: Utc::now(),
            payload,
            source: source.to_string(),
        }
    }
}
