use chrono::Utc;
use gpufleet_common::{Job, JobStatus, StageError, StateTransition};
use tracing::{info, warn};

/// Record a state transition in the job's history.
fn log_state_transition(job: &mut Job, from: JobStatus, to: JobStatus, reason: &str) {
    job.history.push(StateTransition {
        from,
        to,
        reason: reason.to_string(),
        at: Utc::now(),
    });
}

/// Move a job forward to `to` (idempotent).
///
/// Stages only move forward; a remote job may skip stages whose markers
/// scrolled out of the log window. Terminal states are never left, and
/// `Failed` must go through [`fail`].
pub fn advance(job: &mut Job, to: JobStatus, reason: &str) -> bool {
    let from = job.status;
    if from == to {
        return false;
    }
    if from.is_terminal() {
        warn!(
            "[state_machine] job {}: ignoring {} -> {} (already terminal)",
            job.id,
            from.as_str(),
            to.as_str()
        );
        return false;
    }
    if to == JobStatus::Failed || to < from {
        warn!(
            "[state_machine] job {}: refusing {} -> {}",
            job.id,
            from.as_str(),
            to.as_str()
        );
        return false;
    }

    job.status = to;
    if to == JobStatus::Done {
        job.finished_at = Some(Utc::now());
    }
    info!(
        "[state_machine] job {}: {} -> {} ({})",
        job.id,
        from.as_str(),
        to.as_str(),
        reason
    );
    log_state_transition(job, from, to, reason);
    true
}

/// Any non-terminal state -> FAILED (idempotent). The failing stage and cause
/// are recorded; the job's terminal state is set exactly once.
pub fn fail(job: &mut Job, stage: JobStatus, message: &str) -> bool {
    let from = job.status;
    if from.is_terminal() {
        warn!(
            "[state_machine] job {}: ignoring failure in {} ({}), already {}",
            job.id,
            stage.as_str(),
            message,
            from.as_str()
        );
        return false;
    }
    job.errors.push(StageError {
        stage,
        message: message.to_string(),
        at: Utc::now(),
    });
    job.status = JobStatus::Failed;
    job.finished_at = Some(Utc::now());
    warn!(
        "[state_machine] job {}: {} -> failed in {}: {}",
        job.id,
        from.as_str(),
        stage.as_str(),
        message
    );
    log_state_transition(job, from, JobStatus::Failed, message);
    true
}

/// Stage the job failed in, or its current stage when still running.
pub fn failed_stage(job: &Job) -> Option<JobStatus> {
    if job.status == JobStatus::Failed {
        job.last_error().map(|e| e.stage)
    } else {
        None
    }
}
