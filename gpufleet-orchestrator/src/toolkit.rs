//! ffmpeg/ffprobe-backed extraction and assembly, plus the shared helper for
//! running external tools under a timeout.

use crate::media::{AssembleRequest, Assembler, ExtractedMedia, Extractor, MediaInfo};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

const OUTPUT_TAIL_BYTES: usize = 8 * 1024;

pub const FRAME_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp", "tif", "tiff"];

#[derive(Debug)]
pub struct ToolOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// Last few KB of stdout+stderr for diagnostics.
    pub fn tail(&self) -> String {
        let joined = format!("{}\n{}", self.stdout, self.stderr);
        tail_chars(&joined, OUTPUT_TAIL_BYTES)
    }
}

pub(crate) fn tail_chars(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

/// Run `program args` to completion. The child is killed if the timeout
/// elapses. Spawn failures and timeouts are `Err`; a non-zero exit is not.
pub async fn run_tool(program: &str, args: &[String], timeout: Duration) -> Result<ToolOutput> {
    debug!("[tool] {} {}", program, args.join(" "));
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn {}", program))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(res) => res.with_context(|| format!("waiting for {} failed", program))?,
        Err(_) => return Err(anyhow!("{} timed out after {:?}", program, timeout)),
    };
    Ok(ToolOutput {
        success: output.status.success(),
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// True when `nvidia-smi -L` lists at least one GPU.
pub async fn detect_gpu() -> bool {
    match run_tool("nvidia-smi", &["-L".to_string()], Duration::from_secs(10)).await {
        Ok(out) => out.success && out.stdout.lines().any(|l| l.starts_with("GPU")),
        Err(e) => {
            debug!("[tool] no GPU detected: {:#}", e);
            false
        }
    }
}

/// Files in `dir` with a frame extension, sorted by name.
pub async fn list_frames(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("cannot read {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_frame = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| FRAME_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_frame {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// "24000/1001" or "25" -> fps.
pub fn parse_rate(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let v = match raw.split_once('/') {
        Some((n, d)) => {
            let n: f64 = n.trim().parse().ok()?;
            let d: f64 = d.trim().parse().ok()?;
            if d == 0.0 {
                return None;
            }
            n / d
        }
        None => raw.parse().ok()?,
    };
    (v.is_finite() && v > 0.0).then_some(v)
}

fn as_u64(v: &Value) -> Option<u64> {
    v.as_u64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

fn as_f64(v: &Value) -> Option<f64> {
    v.as_f64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Parse `ffprobe -of json` output for the first video stream.
pub fn parse_probe(json: &str, has_audio: bool) -> Result<MediaInfo> {
    let v: Value = serde_json::from_str(json).context("ffprobe output is not JSON")?;
    let stream = v
        .get("streams")
        .and_then(|s| s.as_array())
        .and_then(|s| s.first())
        .ok_or_else(|| anyhow!("ffprobe found no video stream"))?;

    let fps = ["avg_frame_rate", "r_frame_rate"]
        .iter()
        .find_map(|k| stream.get(*k).and_then(|r| r.as_str()).and_then(parse_rate))
        .ok_or_else(|| anyhow!("ffprobe reported no usable frame rate"))?;
    let duration_secs = v
        .get("format")
        .and_then(|f| f.get("duration"))
        .and_then(as_f64)
        .or_else(|| stream.get("duration").and_then(as_f64))
        .unwrap_or(0.0);
    let frame_count = ["nb_read_packets", "nb_frames"]
        .iter()
        .find_map(|k| stream.get(*k).and_then(as_u64))
        .unwrap_or_else(|| (duration_secs * fps).round() as u64);

    Ok(MediaInfo {
        fps,
        frame_count,
        duration_secs,
        width: stream.get("width").and_then(as_u64).unwrap_or(0) as u32,
        height: stream.get("height").and_then(as_u64).unwrap_or(0) as u32,
        has_audio,
    })
}

#[derive(Debug, Clone)]
pub struct FfmpegToolkit {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub timeout: Duration,
    /// x264 constant rate factor used for assembly.
    pub crf: u32,
}

impl Default for FfmpegToolkit {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            timeout: Duration::from_secs(6 * 3600),
            crf: 16,
        }
    }
}

impl FfmpegToolkit {
    async fn run_ok(&self, program: &str, args: Vec<String>) -> Result<ToolOutput> {
        let out = run_tool(program, &args, self.timeout).await?;
        if !out.success {
            return Err(anyhow!(
                "{} exited with {:?}: {}",
                program,
                out.exit_code,
                tail_chars(out.stderr.trim(), 2048)
            ));
        }
        Ok(out)
    }

    async fn has_audio(&self, video: &Path) -> Result<bool> {
        let out = self
            .run_ok(
                &self.ffprobe,
                strings(&["-v", "error", "-select_streams", "a", "-show_entries", "stream=index", "-of", "json"])
                    .into_iter()
                    .chain([video.display().to_string()])
                    .collect(),
            )
            .await?;
        let v: Value = serde_json::from_str(&out.stdout).unwrap_or(Value::Null);
        Ok(v.get("streams")
            .and_then(|s| s.as_array())
            .map(|s| !s.is_empty())
            .unwrap_or(false))
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl Extractor for FfmpegToolkit {
    async fn probe(&self, video: &Path) -> Result<MediaInfo> {
        let has_audio = self.has_audio(video).await?;
        let mut args = strings(&[
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-count_packets",
            "-show_entries",
            "stream=avg_frame_rate,r_frame_rate,nb_frames,nb_read_packets,width,height,duration:format=duration",
            "-of",
            "json",
        ]);
        args.push(video.display().to_string());
        let out = self.run_ok(&self.ffprobe, args).await?;
        parse_probe(&out.stdout, has_audio)
    }

    async fn extract(&self, video: &Path, frames_dir: &Path) -> Result<ExtractedMedia> {
        let info = self.probe(video).await?;
        tokio::fs::create_dir_all(frames_dir).await?;
        let mut args = strings(&["-hide_banner", "-loglevel", "error", "-y", "-i"]);
        args.push(video.display().to_string());
        args.extend(strings(&["-map", "0:v:0", "-vsync", "0"]));
        args.push(frames_dir.join("%08d.png").display().to_string());
        self.run_ok(&self.ffmpeg, args).await?;

        let audio = if info.has_audio {
            let audio_path = frames_dir
                .parent()
                .unwrap_or(frames_dir)
                .join("audio.mka");
            let mut args = strings(&["-hide_banner", "-loglevel", "error", "-y", "-i"]);
            args.push(video.display().to_string());
            args.extend(strings(&["-vn", "-map", "0:a", "-c", "copy"]));
            args.push(audio_path.display().to_string());
            match self.run_ok(&self.ffmpeg, args).await {
                Ok(_) => Some(audio_path),
                Err(e) => {
                    warn!("[ffmpeg] audio extraction failed, output will be silent: {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        let frames = list_frames(frames_dir).await?;
        if frames.is_empty() {
            return Err(anyhow!("ffmpeg extracted no frames from {}", video.display()));
        }
        info!(
            "[ffmpeg] extracted {} frame(s) at {:.3} fps from {}",
            frames.len(),
            info.fps,
            video.display()
        );
        let info = MediaInfo {
            frame_count: frames.len() as u64,
            ..info
        };
        Ok(ExtractedMedia { info, frames, audio })
    }
}

/// Lay frames out as a contiguous `%08d.<ext>` sequence for ffmpeg's image2
/// demuxer. Hard links when possible, copies otherwise.
async fn stage_sequence(frames: &[PathBuf], dir: &Path) -> Result<String> {
    let ext = frames
        .first()
        .and_then(|f| f.extension())
        .and_then(|e| e.to_str())
        .unwrap_or("png")
        .to_string();
    if dir.exists() {
        tokio::fs::remove_dir_all(dir).await?;
    }
    tokio::fs::create_dir_all(dir).await?;
    for (i, frame) in frames.iter().enumerate() {
        let target = dir.join(format!("{:08}.{}", i + 1, ext));
        if tokio::fs::hard_link(frame, &target).await.is_err() {
            tokio::fs::copy(frame, &target)
                .await
                .with_context(|| format!("cannot stage {}", frame.display()))?;
        }
    }
    Ok(ext)
}

#[async_trait]
impl Assembler for FfmpegToolkit {
    async fn assemble(&self, request: &AssembleRequest) -> Result<PathBuf> {
        if request.frames.is_empty() {
            return Err(anyhow!("nothing to assemble"));
        }
        let parent = request
            .output
            .parent()
            .ok_or_else(|| anyhow!("output path {} has no parent", request.output.display()))?;
        tokio::fs::create_dir_all(parent).await?;
        let seq_dir = parent.join("sequence");
        let ext = stage_sequence(&request.frames, &seq_dir).await?;

        let mut args = strings(&["-hide_banner", "-loglevel", "error", "-y", "-framerate"]);
        args.push(format!("{:.6}", request.fps));
        args.push("-i".to_string());
        args.push(seq_dir.join(format!("%08d.{}", ext)).display().to_string());
        if let Some(audio) = &request.audio {
            args.push("-i".to_string());
            args.push(audio.display().to_string());
            args.extend(strings(&["-map", "0:v:0", "-map", "1:a?", "-c:a", "aac", "-shortest"]));
        }
        args.extend(strings(&["-c:v", "libx264", "-pix_fmt", "yuv420p", "-crf"]));
        args.push(self.crf.to_string());
        args.push(request.output.display().to_string());
        self.run_ok(&self.ffmpeg, args).await?;

        if let Err(e) = tokio::fs::remove_dir_all(&seq_dir).await {
            debug!("[ffmpeg] could not remove {}: {}", seq_dir.display(), e);
        }
        info!(
            "[ffmpeg] assembled {} frame(s) at {:.3} fps into {}",
            request.frames.len(),
            request.fps,
            request.output.display()
        );
        Ok(request.output.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_parse_fractions() {
        assert!((parse_rate("24000/1001").unwrap() - 23.976).abs() < 1e-3);
        assert_eq!(parse_rate("25"), Some(25.0));
        assert_eq!(parse_rate("0/0"), None);
        assert_eq!(parse_rate("abc"), None);
    }

    #[test]
    fn probe_json_is_parsed() {
        let json = r#"{
            "streams": [{"width": 1920, "height": 1080, "avg_frame_rate": "24/1",
                         "r_frame_rate": "24/1", "nb_read_packets": "145"}],
            "format": {"duration": "6.041667"}
        }"#;
        let info = parse_probe(json, true).unwrap();
        assert_eq!(info.fps, 24.0);
        assert_eq!(info.frame_count, 145);
        assert_eq!(info.width, 1920);
        assert!(info.has_audio);
        assert!((info.duration_secs - 6.041667).abs() < 1e-6);

        assert!(parse_probe(r#"{"streams": []}"#, false).is_err());
    }

    #[test]
    fn tail_keeps_the_end() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 3), "ab");
    }

    #[tokio::test]
    async fn frames_are_listed_in_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["00000002.png", "00000001.png", "notes.txt"] {
            tokio::fs::write(dir.path().join(name), b"x").await.unwrap();
        }
        let frames = list_frames(dir.path()).await.unwrap();
        let names: Vec<_> = frames
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["00000001.png", "00000002.png"]);
    }

    #[tokio::test]
    async fn missing_tool_is_a_spawn_error() {
        let err = run_tool("gpufleet-definitely-missing-tool", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn sequences_are_renumbered() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("z.png");
        let b = dir.path().join("a.png");
        tokio::fs::write(&a, b"1").await.unwrap();
        tokio::fs::write(&b, b"2").await.unwrap();
        let seq = dir.path().join("seq");
        let ext = stage_sequence(&[a, b], &seq).await.unwrap();
        assert_eq!(ext, "png");
        assert_eq!(tokio::fs::read(seq.join("00000001.png")).await.unwrap(), b"1");
        assert_eq!(tokio::fs::read(seq.join("00000002.png")).await.unwrap(), b"2");
    }
}
