//! Remote log scraping.
//!
//! The container log is the only signal a remote job gives us. Everything
//! that pattern-matches log text lives here, behind [`parse_log_delta`], so
//! the polling loop only ever sees typed events.

use gpufleet_common::bus::{
    JobFailedPayload, RemoteEventKind, UploadConfirmedPayload, EVENT_MARKER_PREFIX,
    PHASE_MARKER_PREFIX,
};
use gpufleet_common::JobStatus;
use regex::Regex;
use std::sync::OnceLock;

pub const DEFAULT_FATAL_MARKERS: &[&str] = &[
    "FATAL:",
    "PIPELINE FAILED",
    "Traceback (most recent call last)",
];

const GENERIC_ERROR_WORDS: &[&str] = &["error", "exception", "failed"];

/// Per-instance read position over a sliding tail window.
///
/// Never persisted: a fresh cursor always treats its first fetch as a
/// baseline, so markers already in the log are not mistaken for new ones.
#[derive(Debug, Clone, Default)]
pub struct LogCursor {
    /// Lines consumed so far, including the baseline. Only ever grows.
    offset: u64,
    /// Completion markers seen after the baseline.
    completion_markers: u64,
    /// Completion markers already present at baseline.
    baseline_markers: u64,
    window: Vec<String>,
    baseline_taken: bool,
    /// How many trailing lines of `window` arrived after the baseline.
    fresh_in_window: usize,
}

impl LogCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cursor for an instance created for this job: its log holds nothing
    /// from earlier runs, so the first fetch is read like any other.
    pub fn without_baseline() -> Self {
        Self {
            baseline_taken: true,
            ..Self::default()
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn completion_markers(&self) -> u64 {
        self.completion_markers
    }

    pub fn baseline_markers(&self) -> u64 {
        self.baseline_markers
    }

    pub fn is_baseline_taken(&self) -> bool {
        self.baseline_taken
    }

    /// Bind the cursor to a new job on a reused instance: the next fetch is a
    /// baseline again and everything before it is history.
    pub fn rebind(&mut self) {
        *self = Self::default();
    }

    /// The last `n` lines of the window that arrived after the baseline.
    pub fn fresh_tail(&self, n: usize) -> &[String] {
        let take = n.min(self.fresh_in_window).min(self.window.len());
        &self.window[self.window.len() - take..]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    Phase(JobStatus),
    UploadConfirmed(UploadConfirmedPayload),
    JobFailed(JobFailedPayload),
    /// A marker line whose payload did not parse. Reported, never acted on.
    MalformedMarker(String),
    /// Generic error-looking line. Non-terminal.
    ErrorLine(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogDelta {
    pub baseline: bool,
    pub fresh_lines: Vec<String>,
    pub events: Vec<LogEvent>,
}

fn split_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(|l| l.trim_end_matches('\r').to_string())
        .filter(|l| !l.trim().is_empty())
        .collect()
}

/// Index into `current` where unseen lines start: the longest suffix of
/// `previous` that is a prefix of `current` has been read already. Without
/// any overlap the whole window is new.
fn fresh_start(previous: &[String], current: &[String]) -> usize {
    for d in 0..previous.len() {
        let suffix = &previous[d..];
        if suffix.len() <= current.len() && current[..suffix.len()] == *suffix {
            return suffix.len();
        }
    }
    0
}

/// Advance `cursor` over a newly fetched tail window and return the events
/// found in the unseen part only.
pub fn parse_log_delta(cursor: &mut LogCursor, new_text: &str) -> LogDelta {
    let current = split_lines(new_text);

    if !cursor.baseline_taken {
        let stale = current.iter().filter(|l| is_completion_line(l)).count() as u64;
        cursor.baseline_taken = true;
        cursor.baseline_markers = stale;
        cursor.offset = current.len() as u64;
        cursor.window = current;
        cursor.fresh_in_window = 0;
        return LogDelta {
            baseline: true,
            ..Default::default()
        };
    }

    let start = fresh_start(&cursor.window, &current);
    let fresh: Vec<String> = current[start..].to_vec();
    let events: Vec<LogEvent> = fresh.iter().filter_map(|l| parse_line(l)).collect();

    cursor.offset += fresh.len() as u64;
    cursor.completion_markers += events
        .iter()
        .filter(|e| matches!(e, LogEvent::UploadConfirmed(_)))
        .count() as u64;
    cursor.fresh_in_window = (cursor.fresh_in_window + fresh.len()).min(current.len());
    cursor.window = current;

    LogDelta {
        baseline: false,
        fresh_lines: fresh,
        events,
    }
}

fn is_completion_line(line: &str) -> bool {
    matches!(
        marker_body(line, EVENT_MARKER_PREFIX),
        Some(body) if body.starts_with(RemoteEventKind::UploadConfirmed.as_str())
    )
}

/// Text after `prefix`, wherever the prefix appears on the line (container
/// runtimes may prepend timestamps).
fn marker_body<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    line.find(prefix).map(|i| line[i + prefix.len()..].trim())
}

/// Classify one log line.
pub fn parse_line(line: &str) -> Option<LogEvent> {
    if let Some(body) = marker_body(line, PHASE_MARKER_PREFIX) {
        return match JobStatus::parse(body) {
            Some(stage) => Some(LogEvent::Phase(stage)),
            None => Some(LogEvent::MalformedMarker(line.to_string())),
        };
    }
    if let Some(body) = marker_body(line, EVENT_MARKER_PREFIX) {
        let (kind, json) = body.split_once(char::is_whitespace).unwrap_or((body, "{}"));
        return Some(match RemoteEventKind::parse(kind) {
            Some(RemoteEventKind::UploadConfirmed) => {
                match serde_json::from_str::<UploadConfirmedPayload>(json.trim()) {
                    Ok(p) => LogEvent::UploadConfirmed(p),
                    Err(_) => LogEvent::MalformedMarker(line.to_string()),
                }
            }
            Some(RemoteEventKind::JobFailed) => {
                match serde_json::from_str::<JobFailedPayload>(json.trim()) {
                    Ok(p) => LogEvent::JobFailed(p),
                    Err(_) => LogEvent::JobFailed(JobFailedPayload {
                        stage: "unknown".to_string(),
                        message: json.trim().to_string(),
                    }),
                }
            }
            None => LogEvent::MalformedMarker(line.to_string()),
        });
    }
    let lower = line.to_ascii_lowercase();
    if GENERIC_ERROR_WORDS.iter().any(|w| lower.contains(w)) {
        return Some(LogEvent::ErrorLine(line.to_string()));
    }
    None
}

#[derive(Debug, Clone, PartialEq)]
pub struct FatalMarker {
    pub marker: String,
    pub line: String,
}

/// First line carrying an explicit fatal marker (case-sensitive).
pub fn scan_fatal(lines: &[String], markers: &[String]) -> Option<FatalMarker> {
    lines.iter().find_map(|line| {
        markers
            .iter()
            .find(|m| !m.is_empty() && line.contains(m.as_str()))
            .map(|m| FatalMarker {
                marker: m.clone(),
                line: line.clone(),
            })
    })
}

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s"'<>`]+"#).expect("static URL pattern"))
}

/// Most recent URL in `tail` that contains `expected` (typically the output
/// key). None is a soft condition for the caller.
pub fn extract_result_url(tail: &str, expected: &str) -> Option<String> {
    url_regex()
        .find_iter(tail)
        .map(|m| m.as_str().trim_end_matches([',', '.', ';', ')', ']', '}']))
        .filter(|u| expected.is_empty() || u.contains(expected))
        .last()
        .map(|u| u.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpufleet_common::bus::{event_line, phase_line};

    fn confirmed(key: &str) -> String {
        event_line(
            RemoteEventKind::UploadConfirmed,
            &UploadConfirmedPayload {
                bucket: "media".into(),
                key: key.into(),
                url: None,
                size: Some(10),
            },
        )
    }

    fn log_with(lines: usize, marker_at: Option<(usize, String)>) -> Vec<String> {
        (0..lines)
            .map(|i| match &marker_at {
                Some((at, m)) if *at == i => m.clone(),
                _ => format!("frame {} done", i),
            })
            .collect()
    }

    #[test]
    fn cursor_without_baseline_reads_the_first_fetch() {
        let mut cursor = LogCursor::without_baseline();
        let first = log_with(5, Some((3, confirmed("out/new.mp4"))));
        let delta = parse_log_delta(&mut cursor, &first.join("\n"));
        assert!(!delta.baseline);
        assert_eq!(delta.fresh_lines.len(), 5);
        assert_eq!(cursor.completion_markers(), 1);
        assert_eq!(cursor.baseline_markers(), 0);

        let again = parse_log_delta(&mut cursor, &first.join("\n"));
        assert!(again.events.is_empty());
        assert_eq!(cursor.offset(), 5);
    }

    #[test]
    fn stale_marker_at_baseline_then_fresh_marker_triggers_once() {
        let mut cursor = LogCursor::new();
        let first = log_with(50, Some((10, confirmed("out/old.mp4"))));
        let delta = parse_log_delta(&mut cursor, &first.join("\n"));
        assert!(delta.baseline);
        assert!(delta.events.is_empty());
        assert_eq!(cursor.baseline_markers(), 1);

        let mut second = first.clone();
        second.extend([
            phase_line(JobStatus::Uploading),
            "uploading part 1/2".to_string(),
            "uploading part 2/2".to_string(),
            confirmed("out/new.mp4"),
            "bye".to_string(),
        ]);
        let delta = parse_log_delta(&mut cursor, &second.join("\n"));
        let completions: Vec<_> = delta
            .events
            .iter()
            .filter_map(|e| match e {
                LogEvent::UploadConfirmed(p) => Some(p.key.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(completions, vec!["out/new.mp4".to_string()]);
        assert_eq!(delta.fresh_lines.len(), 5);
        assert_eq!(cursor.offset(), 55);
        assert_eq!(cursor.completion_markers(), 1);

        // Same window again: nothing new, no second trigger.
        let delta = parse_log_delta(&mut cursor, &second.join("\n"));
        assert!(delta.events.is_empty());
        assert_eq!(cursor.offset(), 55);
    }

    #[test]
    fn sliding_window_keeps_only_unseen_lines() {
        let mut cursor = LogCursor::new();
        let all: Vec<String> = (0..80).map(|i| format!("line {}", i)).collect();
        parse_log_delta(&mut cursor, &all[0..50].join("\n"));
        // Tail of 50 moved forward by 10 lines.
        let delta = parse_log_delta(&mut cursor, &all[10..60].join("\n"));
        assert_eq!(delta.fresh_lines, all[50..60].to_vec());
        assert_eq!(cursor.offset(), 60);
    }

    #[test]
    fn window_without_overlap_is_entirely_new() {
        let mut cursor = LogCursor::new();
        parse_log_delta(&mut cursor, "a\nb\nc");
        let delta = parse_log_delta(&mut cursor, "x\ny");
        assert_eq!(delta.fresh_lines, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn rebind_starts_a_new_baseline() {
        let mut cursor = LogCursor::new();
        parse_log_delta(&mut cursor, "a");
        let delta = parse_log_delta(&mut cursor, &format!("a\n{}", confirmed("k")));
        assert_eq!(cursor.completion_markers(), 1);
        assert_eq!(delta.events.len(), 1);

        cursor.rebind();
        assert!(!cursor.is_baseline_taken());
        let delta = parse_log_delta(&mut cursor, &format!("a\n{}", confirmed("k")));
        assert!(delta.baseline && delta.events.is_empty());
        assert_eq!(cursor.completion_markers(), 0);
    }

    #[test]
    fn line_classification() {
        assert_eq!(
            parse_line("2024-01-01T00:00:00Z ::phase::processing"),
            Some(LogEvent::Phase(JobStatus::Processing))
        );
        assert!(matches!(
            parse_line("::phase::dancing"),
            Some(LogEvent::MalformedMarker(_))
        ));
        assert_eq!(
            parse_line(r#"::event::job_failed {"stage":"processing","message":"boom"}"#),
            Some(LogEvent::JobFailed(JobFailedPayload {
                stage: "processing".into(),
                message: "boom".into()
            }))
        );
        assert!(matches!(
            parse_line("::event::upload_confirmed not-json"),
            Some(LogEvent::MalformedMarker(_))
        ));
        assert!(matches!(
            parse_line("WARNING: retry failed, trying again"),
            Some(LogEvent::ErrorLine(_))
        ));
        assert_eq!(parse_line("frame 10 done"), None);
    }

    #[test]
    fn fatal_scan_only_sees_post_baseline_lines() {
        let markers: Vec<String> = DEFAULT_FATAL_MARKERS.iter().map(|s| s.to_string()).collect();
        let mut cursor = LogCursor::new();
        parse_log_delta(&mut cursor, "FATAL: previous job died\nidle");
        assert!(scan_fatal(cursor.fresh_tail(100), &markers).is_none());

        parse_log_delta(&mut cursor, "FATAL: previous job died\nidle\nstep\nPIPELINE FAILED at assembling");
        let hit = scan_fatal(cursor.fresh_tail(100), &markers).unwrap();
        assert_eq!(hit.marker, "PIPELINE FAILED");
        assert_eq!(cursor.fresh_tail(100).len(), 2);
    }

    #[test]
    fn result_url_prefers_latest_matching() {
        let tail = "\
uploaded to https://other.example/x.mp4
presigned: https://s3.example/bucket/out/show_20240101T000000Z.mp4?X-Amz-Expires=604800,
final https://s3.example/bucket/out/show_20240101T000000Z.mp4?sig=2).
unrelated https://example.com/docs";
        let url = extract_result_url(tail, "out/show_20240101T000000Z.mp4").unwrap();
        assert_eq!(url, "https://s3.example/bucket/out/show_20240101T000000Z.mp4?sig=2");
        assert_eq!(extract_result_url(tail, "out/missing.mp4"), None);
    }
}
