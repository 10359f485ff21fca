//! Output frame-rate rules.
//!
//! - upscale only: output rate = input rate; a target rate is ignored.
//! - interpolate only: output rate = input rate x factor, so duration holds.
//! - both: output rate = produced frames / original duration, after the
//!   produced count has been checked against what the strategy should yield.

use crate::media::MediaInfo;
use gpufleet_common::{CombinedStrategy, FleetError, FleetResult, JobMode, JobParams, JobStatus};
use tracing::{info, warn};

/// Frames allowed to differ from the expected count before it is a mismatch.
const MIN_FRAME_TOLERANCE: u64 = 2;
const RELATIVE_FRAME_TOLERANCE: f64 = 0.05;

#[derive(Debug, Clone, PartialEq)]
pub struct OutputTiming {
    pub fps: f64,
    pub frame_count: u64,
    pub duration_secs: f64,
    pub expected_frames: Option<u64>,
}

/// Interpolating N frames by `factor` yields the N-1 gaps scaled plus the
/// last frame: 145 frames at 2x -> 289.
pub fn expected_interpolated_frames(input_frames: u64, factor: f64) -> u64 {
    if input_frames == 0 {
        return 0;
    }
    ((input_frames - 1) as f64 * factor).round() as u64 + 1
}

/// Frames a combined job should produce. Upscaling never changes the count,
/// so both orders expect the same number; the strategy only changes where
/// the interpolation work happens.
pub fn expected_combined_frames(input_frames: u64, factor: f64, strategy: CombinedStrategy) -> u64 {
    match strategy {
        CombinedStrategy::InterpolateThenUpscale | CombinedStrategy::UpscaleThenInterpolate => {
            expected_interpolated_frames(input_frames, factor)
        }
    }
}

pub fn frames_within_tolerance(expected: u64, actual: u64) -> bool {
    let allowed = ((expected as f64 * RELATIVE_FRAME_TOLERANCE).round() as u64).max(MIN_FRAME_TOLERANCE);
    expected.abs_diff(actual) <= allowed
}

fn source_duration(input: &MediaInfo) -> Option<f64> {
    if input.duration_secs > 0.0 {
        Some(input.duration_secs)
    } else if input.fps > 0.0 && input.frame_count > 0 {
        Some(input.frame_count as f64 / input.fps)
    } else {
        None
    }
}

/// Decide the assembly frame rate for `produced_frames` output frames.
pub fn plan_output(
    mode: JobMode,
    strategy: CombinedStrategy,
    params: &JobParams,
    input: &MediaInfo,
    produced_frames: u64,
) -> FleetResult<OutputTiming> {
    if input.fps <= 0.0 {
        return Err(FleetError::ProcessorFailure {
            stage: JobStatus::Extracting,
            exit_code: None,
            message: "source frame rate unknown".to_string(),
        });
    }

    let timing = match mode {
        JobMode::Upscale => {
            if let Some(target) = params.target_fps {
                info!(
                    "[framerate] upscale-only job keeps {:.3} fps; target {:.3} ignored",
                    input.fps, target
                );
            }
            OutputTiming {
                fps: input.fps,
                frame_count: produced_frames,
                duration_secs: produced_frames as f64 / input.fps,
                expected_frames: Some(input.frame_count),
            }
        }
        JobMode::Interpolate => {
            let factor = params.effective_factor(input.fps);
            let fps = input.fps * factor;
            let expected = expected_interpolated_frames(input.frame_count, factor);
            if !frames_within_tolerance(expected, produced_frames) {
                warn!(
                    "[framerate] interpolation produced {} frame(s), expected ~{}",
                    produced_frames, expected
                );
            }
            OutputTiming {
                fps,
                frame_count: produced_frames,
                duration_secs: produced_frames as f64 / fps,
                expected_frames: Some(expected),
            }
        }
        JobMode::Both => {
            let factor = params.effective_factor(input.fps);
            let expected = expected_combined_frames(input.frame_count, factor, strategy);
            if !frames_within_tolerance(expected, produced_frames) {
                return Err(FleetError::FrameCountMismatch {
                    expected,
                    actual: produced_frames,
                });
            }
            let duration = source_duration(input).ok_or_else(|| FleetError::ProcessorFailure {
                stage: JobStatus::Extracting,
                exit_code: None,
                message: "source duration unknown".to_string(),
            })?;
            OutputTiming {
                fps: produced_frames as f64 / duration,
                frame_count: produced_frames,
                duration_secs: duration,
                expected_frames: Some(expected),
            }
        }
    };
    Ok(timing)
}
