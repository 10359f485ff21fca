use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::JobStatus;

pub type FleetResult<T> = std::result::Result<T, FleetError>;

/// One rung of the offer relaxation ladder, recorded for auditability.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RelaxationAttempt {
    pub step: String,
    pub max_price: Option<f64>,
    pub min_vram_mb: u64,
    pub min_reliability: f64,
    pub candidates: usize,
}

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("marketplace unavailable: {0}")]
    MarketplaceUnavailable(String),

    #[error("no offers found after {} relaxation step(s)", .history.len())]
    NoOffersFound { history: Vec<RelaxationAttempt> },

    #[error("offer rejected: {reason}")]
    OfferRejected { reason: String },

    #[error("instance {instance_id} not running after {waited_secs}s (last status: {last_status})")]
    InstanceStartupTimeout {
        instance_id: String,
        waited_secs: u64,
        last_status: String,
    },

    #[error("instance {instance_id} reached {status} before running")]
    InstanceTerminatedUnexpectedly { instance_id: String, status: String },

    #[error("processor failed during {stage:?} (exit={exit_code:?}): {message}")]
    ProcessorFailure {
        stage: JobStatus,
        exit_code: Option<i32>,
        message: String,
    },

    #[error("frame count mismatch: expected {expected} frame(s), processor produced {actual}")]
    FrameCountMismatch { expected: u64, actual: u64 },

    #[error("upload of {key} failed after {attempts} attempt(s): {message}")]
    UploadFailure {
        key: String,
        attempts: u32,
        message: String,
    },

    #[error("resource exhausted at batch size {batch_size}: {message}")]
    ResourceExhausted { batch_size: u32, message: String },

    #[error("remote job failed: {0}")]
    RemoteJobFailed(String),

    #[error("monitor timed out after {0}s without a completion event")]
    MonitorTimeout(u64),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn marketplace(msg: impl Into<String>) -> Self {
        Self::MarketplaceUnavailable(msg.into())
    }

    /// Transient errors are worth retrying locally; everything else is terminal
    /// for the current attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::MarketplaceUnavailable(_) | Self::UploadFailure { .. } | Self::Storage(_) | Self::Io(_)
        )
    }

    /// Short machine-readable code used in reports and action logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MarketplaceUnavailable(_) => "marketplace_unavailable",
            Self::NoOffersFound { .. } => "no_offers_found",
            Self::OfferRejected { .. } => "offer_rejected",
            Self::InstanceStartupTimeout { .. } => "instance_startup_timeout",
            Self::InstanceTerminatedUnexpectedly { .. } => "instance_terminated_unexpectedly",
            Self::ProcessorFailure { .. } => "processor_failure",
            Self::FrameCountMismatch { .. } => "frame_count_mismatch",
            Self::UploadFailure { .. } => "upload_failure",
            Self::ResourceExhausted { .. } => "resource_exhausted",
            Self::RemoteJobFailed(_) => "remote_job_failed",
            Self::MonitorTimeout(_) => "monitor_timeout",
            Self::Storage(_) => "storage",
            Self::Config(_) => "config",
            Self::Cancelled(_) => "cancelled",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(FleetError::marketplace("502").is_transient());
        assert!(!FleetError::FrameCountMismatch {
            expected: 289,
            actual: 144
        }
        .is_transient());
        assert!(!FleetError::NoOffersFound { history: vec![] }.is_transient());
    }

    #[test]
    fn no_offers_message_counts_steps() {
        let history = vec![
            RelaxationAttempt {
                step: "initial".into(),
                max_price: Some(0.5),
                min_vram_mb: 16384,
                min_reliability: 0.95,
                candidates: 0,
            },
            RelaxationAttempt {
                step: "raise_price".into(),
                max_price: Some(0.75),
                min_vram_mb: 16384,
                min_reliability: 0.95,
                candidates: 0,
            },
        ];
        let err = FleetError::NoOffersFound { history };
        assert_eq!(err.to_string(), "no offers found after 2 relaxation step(s)");
        assert_eq!(err.code(), "no_offers_found");
    }
}
