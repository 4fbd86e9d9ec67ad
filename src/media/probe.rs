//! 元数据探测：MediaProbe trait 与基于 ffprobe 的实现
//!
//! 视频/音频/图片走 `ffprobe -print_format json -show_format -show_streams`；其它类型只记录文件大小。

use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::FfmpegSection;
use crate::media::{AssetKind, MediaMetadata};
use crate::tools::run_script;

/// 元数据探测能力
#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaMetadata, String>;
}

/// 调用 ffprobe 的探测器；每次调用都有超时，future 被丢弃时子进程随之终止
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    binary: String,
    timeout: Duration,
}

impl FfprobeProbe {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(cfg: &FfmpegSection) -> Self {
        Self::new(cfg.ffprobe.clone()).with_timeout(Duration::from_secs(cfg.probe_timeout_secs))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for FfprobeProbe {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

#[async_trait]
impl MediaProbe for FfprobeProbe {
    async fn probe(&self, path: &Path) -> Result<MediaMetadata, String> {
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| format!("cannot stat {}: {}", path.display(), e))?
            .len();

        if AssetKind::from_path(path) == AssetKind::Other {
            tracing::debug!(path = %path.display(), "unsupported media type, recording size only");
            return Ok(MediaMetadata {
                size_bytes: Some(size),
                ..Default::default()
            });
        }

        let cwd = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let args = [
            OsStr::new("-v"),
            OsStr::new("quiet"),
            OsStr::new("-print_format"),
            OsStr::new("json"),
            OsStr::new("-show_format"),
            OsStr::new("-show_streams"),
            path.as_os_str(),
        ];
        let output = run_script("probe", &self.binary, &args, cwd, self.timeout, &CancellationToken::new())
            .await
            .map_err(|e| format!("ffprobe {}", e))?;
        if !output.success {
            return Err(format!("ffprobe exit {:?}: {}", output.exit_code, output.stderr.trim()));
        }

        let mut meta = parse_ffprobe_json(&output.stdout)?;
        meta.size_bytes = Some(size);
        Ok(meta)
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    pix_fmt: Option<String>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
    channels: Option<u32>,
    sample_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// 解析 ffprobe 的 JSON 输出
pub fn parse_ffprobe_json(raw: &str) -> Result<MediaMetadata, String> {
    let parsed: ProbeOutput =
        serde_json::from_str(raw).map_err(|e| format!("invalid ffprobe output: {}", e))?;

    let video = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let audio = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));
    if video.is_none() && audio.is_none() {
        return Err("no video or audio stream found".to_string());
    }

    let format_duration = parsed
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok());
    let stream_duration = video
        .or(audio)
        .and_then(|s| s.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok());

    let pix_fmt = video.and_then(|v| v.pix_fmt.clone());
    let grayscale = pix_fmt
        .as_deref()
        .map(|p| p.starts_with("gray"))
        .unwrap_or(false);

    Ok(MediaMetadata {
        width: video.and_then(|v| v.width),
        height: video.and_then(|v| v.height),
        duration_secs: format_duration.or(stream_duration),
        frame_rate: video
            .and_then(|v| v.r_frame_rate.as_deref())
            .and_then(parse_rational),
        codec: video.or(audio).and_then(|s| s.codec_name.clone()),
        pix_fmt,
        audio_channels: audio.and_then(|a| a.channels),
        sample_rate: audio
            .and_then(|a| a.sample_rate.as_deref())
            .and_then(|r| r.parse().ok()),
        grayscale,
        size_bytes: None,
    })
}

/// 解析 `30000/1001` 形式的有理数；分母为 0 时返回 None
fn parse_rational(raw: &str) -> Option<f64> {
    match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                None
            } else {
                Some(num / den)
            }
        }
        None => raw.trim().parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_video_with_audio() {
        let raw = r#"{
            "streams": [
                {"codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080,
                 "pix_fmt": "yuv420p", "r_frame_rate": "30000/1001", "duration": "9.98"},
                {"codec_type": "audio", "codec_name": "aac", "channels": 2, "sample_rate": "44100"}
            ],
            "format": {"duration": "10.000000"}
        }"#;
        let meta = parse_ffprobe_json(raw).unwrap();
        assert_eq!(meta.width, Some(1920));
        assert_eq!(meta.height, Some(1080));
        assert_eq!(meta.duration_secs, Some(10.0));
        assert!((meta.frame_rate.unwrap() - 29.97).abs() < 0.01);
        assert_eq!(meta.codec.as_deref(), Some("h264"));
        assert_eq!(meta.audio_channels, Some(2));
        assert_eq!(meta.sample_rate, Some(44100));
        assert!(!meta.grayscale);
    }

    #[test]
    fn test_parse_grayscale() {
        let raw = r#"{"streams": [{"codec_type": "video", "width": 1080, "height": 1080,
            "pix_fmt": "gray", "r_frame_rate": "25/1", "duration": "10.0"}]}"#;
        let meta = parse_ffprobe_json(raw).unwrap();
        assert!(meta.grayscale);
        assert!(meta.is_square());
        assert_eq!(meta.duration_secs, Some(10.0));
        assert_eq!(meta.frame_rate, Some(25.0));
    }

    #[test]
    fn test_parse_rejects_streamless() {
        assert!(parse_ffprobe_json(r#"{"streams": []}"#).is_err());
        assert!(parse_ffprobe_json("not json").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hung_ffprobe_is_bounded() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let binary = dir.path().join("slow-ffprobe");
        std::fs::write(&binary, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        let clip = dir.path().join("clip.mp4");
        std::fs::write(&clip, "x").unwrap();

        let probe = FfprobeProbe::new(binary.to_string_lossy()).with_timeout(Duration::from_millis(300));
        let started = std::time::Instant::now();
        let err = probe.probe(&clip).await.unwrap_err();
        assert!(err.contains("timed out"), "{}", err);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_parse_rational() {
        assert_eq!(parse_rational("30/1"), Some(30.0));
        assert_eq!(parse_rational("0/0"), None);
        assert_eq!(parse_rational("24"), Some(24.0));
    }
}
