use crate::fleet::{FleetManager, ReleaseAction};
use crate::log_parser::{
    extract_result_url, parse_log_delta, scan_fatal, LogCursor, LogEvent, DEFAULT_FATAL_MARKERS,
};
use chrono::{DateTime, Utc};
use gpufleet_common::bus::UploadConfirmedPayload;
use gpufleet_common::JobStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_REPORTED_ERROR_LINES: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    /// Lines requested per fetch.
    pub tail_lines: usize,
    /// Run the fatal-marker scan every Nth successful poll.
    pub fatal_scan_every: u32,
    pub fatal_scan_lines: usize,
    pub fatal_markers: Vec<String>,
    /// Ask the marketplace for the instance status every Nth poll; 0 disables.
    pub status_check_every: u32,
    pub max_backoff: Duration,
    /// Give up waiting for completion after this long.
    pub overall_timeout: Duration,
    pub release_on_completion: ReleaseAction,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            tail_lines: 200,
            fatal_scan_every: 4,
            fatal_scan_lines: 100,
            fatal_markers: DEFAULT_FATAL_MARKERS.iter().map(|s| s.to_string()).collect(),
            status_check_every: 4,
            max_backoff: Duration::from_secs(300),
            overall_timeout: Duration::from_secs(12 * 3600),
            release_on_completion: ReleaseAction::Stop,
        }
    }
}

/// What the monitor is waiting for.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionExpectation {
    /// Output key the upload event must name; result URLs must contain it.
    pub output_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub payload: UploadConfirmedPayload,
    pub result_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorOutcome {
    Completed(Completion),
    Failed { stage: Option<String>, reason: String },
    TimedOut { waited: Duration },
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorState {
    pub last_offset: u64,
    pub initial_marker_count: u64,
    pub saw_new_completion: bool,
    pub last_upload_event_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub polls: u64,
    pub phases: Vec<(JobStatus, DateTime<Utc>)>,
    pub error_lines: Vec<String>,
}

impl MonitorState {
    pub fn last_phase(&self) -> Option<JobStatus> {
        self.phases.last().map(|(s, _)| *s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorReport {
    pub instance_id: String,
    pub outcome: MonitorOutcome,
    pub state: MonitorState,
    /// True when the monitor itself released the instance.
    pub released: bool,
}

/// Per-instance log polling loop. One monitor task per instance; monitors
/// share nothing but the fleet client.
pub struct LogMonitor {
    fleet: Arc<FleetManager>,
    settings: MonitorSettings,
}

impl LogMonitor {
    pub fn new(fleet: Arc<FleetManager>, settings: MonitorSettings) -> Self {
        Self { fleet, settings }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn spawn(
        self: Arc<Self>,
        instance_id: String,
        expectation: CompletionExpectation,
        cancel: CancellationToken,
    ) -> JoinHandle<MonitorReport> {
        tokio::spawn(async move { self.watch(&instance_id, &expectation, &cancel).await })
    }

    /// Watch an instance that was just created for this job: nothing in its
    /// log predates the job, so a marker in the very first fetch counts.
    pub async fn watch_new_instance(
        &self,
        instance_id: &str,
        expectation: &CompletionExpectation,
        cancel: &CancellationToken,
    ) -> MonitorReport {
        let mut cursor = LogCursor::without_baseline();
        self.watch_with_cursor(instance_id, &mut cursor, expectation, cancel)
            .await
    }

    /// Watch with a fresh cursor; the first fetch is a baseline. Use this when
    /// the instance may carry log lines from an earlier run.
    pub async fn watch(
        &self,
        instance_id: &str,
        expectation: &CompletionExpectation,
        cancel: &CancellationToken,
    ) -> MonitorReport {
        let mut cursor = LogCursor::new();
        self.watch_with_cursor(instance_id, &mut cursor, expectation, cancel)
            .await
    }

    /// Watch with a caller-owned cursor, so a reused instance can be re-bound
    /// (`LogCursor::rebind`) for the next job.
    pub async fn watch_with_cursor(
        &self,
        instance_id: &str,
        cursor: &mut LogCursor,
        expectation: &CompletionExpectation,
        cancel: &CancellationToken,
    ) -> MonitorReport {
        let started = Instant::now();
        let mut state = MonitorState::default();
        let mut successful_polls: u64 = 0;
        // Set once the marketplace reports the instance gone; one more log
        // fetch runs so a completion written just before exit still counts.
        let mut gone: Option<String> = None;
        info!(
            "[log_monitor] watching instance {} for {}",
            instance_id, expectation.output_key
        );

        let outcome = loop {
            if cancel.is_cancelled() {
                break MonitorOutcome::Cancelled;
            }
            if started.elapsed() >= self.settings.overall_timeout {
                break MonitorOutcome::TimedOut {
                    waited: started.elapsed(),
                };
            }
            state.polls += 1;

            let text = match self.fleet.fetch_logs(instance_id, self.settings.tail_lines).await {
                Ok(text) => {
                    state.consecutive_failures = 0;
                    text
                }
                Err(e) => {
                    state.consecutive_failures += 1;
                    if let Some(reason) = gone.take() {
                        break self.instance_gone_outcome(&state, reason);
                    }
                    if self.status_check_due(state.polls) {
                        if let Some(reason) = self.check_instance(instance_id).await {
                            break self.instance_gone_outcome(&state, reason);
                        }
                    }
                    let backoff = self.backoff(state.consecutive_failures);
                    warn!(
                        "[log_monitor] log fetch for {} failed ({} in a row), retrying in {:?}: {:#}",
                        instance_id, state.consecutive_failures, backoff, e
                    );
                    if sleep_or_cancel(backoff, cancel).await {
                        break MonitorOutcome::Cancelled;
                    }
                    continue;
                }
            };
            successful_polls += 1;

            let delta = parse_log_delta(cursor, &text);
            state.last_offset = cursor.offset();
            if delta.baseline {
                state.initial_marker_count = cursor.baseline_markers();
                info!(
                    "[log_monitor] baseline for {}: {} line(s), {} earlier completion marker(s) ignored",
                    instance_id,
                    cursor.offset(),
                    state.initial_marker_count
                );
            }

            let mut finished = None;
            for event in delta.events {
                match event {
                    LogEvent::Phase(stage) => {
                        info!("[log_monitor] {} entered {}", instance_id, stage.as_str());
                        state.phases.push((stage, Utc::now()));
                    }
                    LogEvent::ErrorLine(line) => {
                        warn!("[log_monitor] {}: {}", instance_id, line);
                        if state.error_lines.len() < MAX_REPORTED_ERROR_LINES {
                            state.error_lines.push(line);
                        }
                    }
                    LogEvent::MalformedMarker(line) => {
                        warn!("[log_monitor] {}: unparsable marker: {}", instance_id, line);
                    }
                    LogEvent::JobFailed(p) => {
                        error!("[log_monitor] {} reported failure in {}: {}", instance_id, p.stage, p.message);
                        finished.get_or_insert(MonitorOutcome::Failed {
                            stage: Some(p.stage),
                            reason: p.message,
                        });
                    }
                    LogEvent::UploadConfirmed(p) => {
                        if p.key != expectation.output_key {
                            warn!(
                                "[log_monitor] {} confirmed upload of {}, expected {}; ignoring",
                                instance_id, p.key, expectation.output_key
                            );
                            continue;
                        }
                        state.saw_new_completion = true;
                        state.last_upload_event_at = Some(Utc::now());
                        let result_url = p
                            .url
                            .clone()
                            .filter(|u| u.contains(&expectation.output_key))
                            .or_else(|| extract_result_url(&text, &expectation.output_key));
                        if result_url.is_none() {
                            warn!(
                                "[log_monitor] no result URL for {} in the log tail",
                                expectation.output_key
                            );
                        }
                        finished.get_or_insert(MonitorOutcome::Completed(Completion {
                            payload: p,
                            result_url,
                        }));
                    }
                }
            }
            if let Some(outcome) = finished {
                break outcome;
            }
            if let Some(reason) = gone.take() {
                break self.instance_gone_outcome(&state, reason);
            }

            let every = self.settings.fatal_scan_every.max(1) as u64;
            if successful_polls % every == 0 {
                if let Some(hit) = scan_fatal(
                    cursor.fresh_tail(self.settings.fatal_scan_lines),
                    &self.settings.fatal_markers,
                ) {
                    error!("[log_monitor] {} fatal marker {:?}: {}", instance_id, hit.marker, hit.line);
                    break MonitorOutcome::Failed {
                        stage: state.last_phase().map(|s| s.as_str().to_string()),
                        reason: hit.line,
                    };
                }
            }
            if self.status_check_due(state.polls) {
                if let Some(reason) = self.check_instance(instance_id).await {
                    gone = Some(reason);
                    continue;
                }
            }
            debug!(
                "[log_monitor] {} poll {} offset {}",
                instance_id, state.polls, state.last_offset
            );

            if sleep_or_cancel(self.settings.poll_interval, cancel).await {
                break MonitorOutcome::Cancelled;
            }
        };

        let mut released = false;
        if let MonitorOutcome::Completed(c) = &outcome {
            info!(
                "[log_monitor] {} completed: s3://{}/{}",
                instance_id, c.payload.bucket, c.payload.key
            );
            released = self
                .fleet
                .release(instance_id, self.settings.release_on_completion)
                .await;
        }

        MonitorReport {
            instance_id: instance_id.to_string(),
            outcome,
            state,
            released,
        }
    }

    fn status_check_due(&self, polls: u64) -> bool {
        let every = self.settings.status_check_every as u64;
        every > 0 && polls % every == 0
    }

    /// Why the instance can no longer finish the job, if it can't. Status
    /// errors are not conclusive and only logged.
    async fn check_instance(&self, instance_id: &str) -> Option<String> {
        match self.fleet.status(instance_id).await {
            Ok(None) => Some(format!("instance {} no longer exists", instance_id)),
            Ok(Some(inst)) if inst.status.is_terminal() => Some(format!(
                "instance {} is {} ({})",
                instance_id,
                inst.status.as_str(),
                inst.raw_status.as_deref().unwrap_or("no raw status")
            )),
            Ok(Some(_)) => None,
            Err(e) => {
                warn!("[log_monitor] status check for {} failed: {}", instance_id, e);
                None
            }
        }
    }

    fn instance_gone_outcome(&self, state: &MonitorState, reason: String) -> MonitorOutcome {
        error!("[log_monitor] {}", reason);
        MonitorOutcome::Failed {
            stage: state.last_phase().map(|s| s.as_str().to_string()),
            reason,
        }
    }

    fn backoff(&self, consecutive_failures: u32) -> Duration {
        let exp = consecutive_failures.saturating_sub(1).min(16);
        self.settings
            .poll_interval
            .saturating_mul(1u32 << exp)
            .min(self.settings.max_backoff)
    }
}

/// Returns true when cancelled before the delay elapsed.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::ActionLogger;
    use crate::retry::RetryPolicy;
    use gpufleet_common::bus::{event_line, phase_line, RemoteEventKind};
    use gpufleet_common::InstanceStatus;
    use gpufleet_providers::mock::MockMarketplace;

    fn monitor(m: Arc<MockMarketplace>, settings: MonitorSettings) -> LogMonitor {
        let fleet = FleetManager::new(
            m,
            RetryPolicy::no_delay(2),
            Duration::from_secs(1),
            ActionLogger::disabled(),
        );
        LogMonitor::new(Arc::new(fleet), settings)
    }

    fn fast() -> MonitorSettings {
        MonitorSettings {
            poll_interval: Duration::from_millis(2),
            max_backoff: Duration::from_millis(10),
            overall_timeout: Duration::from_secs(5),
            fatal_scan_every: 1,
            ..Default::default()
        }
    }

    fn confirmed(key: &str) -> String {
        event_line(
            RemoteEventKind::UploadConfirmed,
            &UploadConfirmedPayload {
                bucket: "media".into(),
                key: key.into(),
                url: Some(format!("https://s3.example/media/{}?sig=1", key)),
                size: Some(1),
            },
        )
    }

    fn expect(key: &str) -> CompletionExpectation {
        CompletionExpectation {
            output_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn completes_on_fresh_marker_and_stops_instance() {
        let m = Arc::new(MockMarketplace::new());
        m.insert_instance("7", InstanceStatus::Running);
        let base: Vec<String> = (0..50)
            .map(|i| if i == 10 { confirmed("out/a.mp4") } else { format!("l{}", i) })
            .collect();
        m.push_logs("7", &base.join("\n"));
        m.push_logs("7", &base.join("\n"));
        let mut next = base.clone();
        next.extend([phase_line(JobStatus::Uploading), confirmed("out/a.mp4")]);
        m.push_logs("7", &next.join("\n"));

        let report = monitor(m.clone(), fast())
            .watch("7", &expect("out/a.mp4"), &CancellationToken::new())
            .await;
        match &report.outcome {
            MonitorOutcome::Completed(c) => {
                assert_eq!(c.result_url.as_deref(), Some("https://s3.example/media/out/a.mp4?sig=1"))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(report.state.initial_marker_count, 1);
        assert!(report.state.saw_new_completion);
        assert_eq!(report.state.last_phase(), Some(JobStatus::Uploading));
        assert_eq!(report.state.polls, 3);
        assert!(report.released);
        assert_eq!(m.stop_calls(), vec!["7".to_string()]);
        assert!(m.destroy_calls().is_empty());
    }

    #[tokio::test]
    async fn fetch_failures_back_off_without_failing() {
        let m = Arc::new(MockMarketplace::new());
        m.insert_instance("8", InstanceStatus::Running);
        m.push_logs("8", "boot");
        m.push_log_failure("8", "502");
        m.push_log_failure("8", "timeout");
        m.push_logs("8", &format!("boot\n{}", confirmed("k")));
        let settings = MonitorSettings {
            release_on_completion: ReleaseAction::Destroy,
            ..fast()
        };
        let report = monitor(m.clone(), settings)
            .watch("8", &expect("k"), &CancellationToken::new())
            .await;
        assert!(matches!(report.outcome, MonitorOutcome::Completed(_)));
        assert_eq!(report.state.consecutive_failures, 0);
        assert_eq!(m.destroy_calls(), vec!["8".to_string()]);
    }

    #[tokio::test]
    async fn fatal_marker_fails_without_releasing() {
        let m = Arc::new(MockMarketplace::new());
        m.insert_instance("9", InstanceStatus::Running);
        m.push_logs("9", "boot");
        m.push_logs(
            "9",
            &format!("boot\n{}\nsome error, continuing\nPIPELINE FAILED at processing", phase_line(JobStatus::Processing)),
        );
        let report = monitor(m.clone(), fast())
            .watch("9", &expect("k"), &CancellationToken::new())
            .await;
        match report.outcome {
            MonitorOutcome::Failed { stage, reason } => {
                assert_eq!(stage.as_deref(), Some("processing"));
                assert!(reason.contains("PIPELINE FAILED"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(report
            .state
            .error_lines
            .iter()
            .any(|l| l.contains("some error")));
        assert!(m.stop_calls().is_empty());
    }

    #[tokio::test]
    async fn structured_failure_event_ends_the_loop() {
        let m = Arc::new(MockMarketplace::new());
        m.insert_instance("10", InstanceStatus::Running);
        m.push_logs("10", "boot");
        m.push_logs(
            "10",
            "boot\n::event::job_failed {\"stage\":\"assembling\",\"message\":\"ffmpeg exited 1\"}",
        );
        let report = monitor(m, fast())
            .watch("10", &expect("k"), &CancellationToken::new())
            .await;
        assert_eq!(
            report.outcome,
            MonitorOutcome::Failed {
                stage: Some("assembling".into()),
                reason: "ffmpeg exited 1".into()
            }
        );
    }

    #[tokio::test]
    async fn cancellation_is_checked_every_poll() {
        let m = Arc::new(MockMarketplace::new());
        m.insert_instance("11", InstanceStatus::Running);
        m.push_logs("11", "working");
        let settings = MonitorSettings {
            poll_interval: Duration::from_secs(30),
            ..fast()
        };
        let cancel = CancellationToken::new();
        let handle = Arc::new(monitor(m, settings)).spawn("11".into(), expect("k"), cancel.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let report = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.outcome, MonitorOutcome::Cancelled);
    }

    #[tokio::test]
    async fn gives_up_after_overall_timeout() {
        let m = Arc::new(MockMarketplace::new());
        m.insert_instance("12", InstanceStatus::Running);
        m.push_logs("12", "working");
        let settings = MonitorSettings {
            overall_timeout: Duration::from_millis(30),
            ..fast()
        };
        let report = monitor(m, settings)
            .watch("12", &expect("k"), &CancellationToken::new())
            .await;
        assert!(matches!(report.outcome, MonitorOutcome::TimedOut { .. }));
    }

    #[tokio::test]
    async fn new_instance_counts_a_marker_in_the_first_fetch() {
        let m = Arc::new(MockMarketplace::new());
        m.insert_instance("13", InstanceStatus::Running);
        m.push_logs(
            "13",
            &[phase_line(JobStatus::Uploading), confirmed("out/fast.mp4")].join("\n"),
        );
        let report = monitor(m.clone(), fast())
            .watch_new_instance("13", &expect("out/fast.mp4"), &CancellationToken::new())
            .await;
        assert!(matches!(report.outcome, MonitorOutcome::Completed(_)), "{:?}", report.outcome);
        assert_eq!(report.state.polls, 1);
        assert_eq!(report.state.initial_marker_count, 0);
        assert_eq!(m.stop_calls(), vec!["13".to_string()]);
    }

    #[tokio::test]
    async fn stopped_instance_ends_the_watch() {
        let m = Arc::new(MockMarketplace::new());
        m.insert_instance("14", InstanceStatus::Stopped);
        m.push_logs("14", &format!("boot\n{}", phase_line(JobStatus::Processing)));
        let settings = MonitorSettings {
            status_check_every: 1,
            ..fast()
        };
        let report = monitor(m.clone(), settings)
            .watch_new_instance("14", &expect("k"), &CancellationToken::new())
            .await;
        match report.outcome {
            MonitorOutcome::Failed { stage, reason } => {
                assert_eq!(stage.as_deref(), Some("processing"));
                assert!(reason.contains("instance 14 is stopped"), "{}", reason);
            }
            other => panic!("unexpected {:?}", other),
        }
        // One extra fetch after the status check, then give up.
        assert_eq!(report.state.polls, 2);
        assert!(m.stop_calls().is_empty());
    }

    #[tokio::test]
    async fn completion_logged_before_exit_still_counts() {
        let m = Arc::new(MockMarketplace::new());
        m.insert_instance("15", InstanceStatus::Stopped);
        m.push_logs("15", "boot");
        m.push_logs("15", &format!("boot\n{}", confirmed("k")));
        let settings = MonitorSettings {
            status_check_every: 1,
            ..fast()
        };
        let report = monitor(m, settings)
            .watch_new_instance("15", &expect("k"), &CancellationToken::new())
            .await;
        assert!(matches!(report.outcome, MonitorOutcome::Completed(_)), "{:?}", report.outcome);
    }

    #[tokio::test]
    async fn vanished_instance_fails_while_logs_are_unreachable() {
        let m = Arc::new(MockMarketplace::new());
        let settings = MonitorSettings {
            status_check_every: 1,
            ..fast()
        };
        let report = monitor(m, settings)
            .watch_new_instance("16", &expect("k"), &CancellationToken::new())
            .await;
        match report.outcome {
            MonitorOutcome::Failed { stage, reason } => {
                assert_eq!(stage, None);
                assert!(reason.contains("no longer exists"), "{}", reason);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(report.state.polls, 1);
    }

    #[test]
    fn backoff_is_capped() {
        let m = Arc::new(MockMarketplace::new());
        let mon = monitor(m, fast());
        assert_eq!(mon.backoff(1), Duration::from_millis(2));
        assert_eq!(mon.backoff(2), Duration::from_millis(4));
        assert_eq!(mon.backoff(30), Duration::from_millis(10));
    }
}
