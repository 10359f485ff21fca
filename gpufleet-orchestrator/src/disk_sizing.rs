use gpufleet_common::JobMode;

const GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Image, toolchain and model weights, independent of the input.
const BASE_GB: u32 = 24;
const MIN_GB: u32 = 32;
const MAX_GB: u32 = 2048;

/// Returns a recommended instance disk size (GB) for a job on `input_bytes`.
/// This is intentionally heuristic and can be overridden.
///
/// Overrides:
/// - `override_gb` (FLEET_DISK_GB): force a fixed size for every instance
///
/// Extracted PNG frames take roughly 30x the compressed input. Upscaling
/// multiplies that by scale², interpolation by the frame factor, and the
/// assembled output is budgeted on top.
pub fn recommended_disk_gb(
    input_bytes: u64,
    mode: JobMode,
    scale: u32,
    factor: f64,
    override_gb: Option<u32>,
) -> u32 {
    if let Some(gb) = override_gb.filter(|gb| *gb > 0) {
        return gb;
    }

    let input_gb = input_bytes as f64 / GB;
    let frames_gb = input_gb * 30.0;
    let scale_sq = (scale.max(1) as f64).powi(2);
    let factor = if factor.is_finite() && factor > 1.0 { factor } else { 1.0 };

    let working_gb = match mode {
        JobMode::Upscale => frames_gb + frames_gb * scale_sq,
        JobMode::Interpolate => frames_gb + frames_gb * factor,
        // Intermediate and final frame sets coexist until assembly.
        JobMode::Both => frames_gb + frames_gb * factor + frames_gb * factor * scale_sq,
    };
    let output_gb = input_gb * scale_sq * factor * 2.0;

    let total = BASE_GB as f64 + input_gb + working_gb + output_gb;
    (total.ceil() as u32).clamp(MIN_GB, MAX_GB)
}
