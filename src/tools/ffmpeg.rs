//! FFmpeg 处理工具：生成 Python + ffmpeg-python 脚本完成裁剪、调色、灰度、缩放等变换
//!
//! 沙箱中用 `ffmpeg -f lavfi` 生成与参考资产同分辨率、同时长、同声道布局的黑场/静音替身；
//! 运行后用 ffprobe 检查产物可解析。

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::FfmpegSection;
use crate::media::{Asset, AssetKind, FfprobeProbe, MediaMetadata, MediaProbe};
use crate::tools::{run_script, MediaTool, RunError, RunLimits, ScriptRuntime, Staging, ValidationCheck};

pub const FFMPEG_TOOL_NAME: &str = "FFmpeg Processor";

/// 禁止出现在生成脚本中的子串
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "shutil.rmtree",
    "os.remove(",
    "os.unlink(",
    "os.rmdir(",
    "urllib.request",
    "requests.get",
    "socket.",
    "chmod 777",
    "os.system(",
];

const INSTRUCTIONS: &str = r#"Write a complete, self-contained Python 3 script that uses the ffmpeg-python library.

Rules:
1. The script receives its files on the command line: sys.argv[1:-1] are the input files, sys.argv[-1] is the output file.
2. Use ffmpeg-python syntax (import ffmpeg), not raw command-line strings.
3. Always call ffmpeg.run(..., overwrite_output=True).
4. Never delete, move or modify the input files; write only the output file.
5. On failure print the error (including ffmpeg stderr) and exit with a non-zero status.
6. Respond with Python code only, no explanations and no markdown.

Common operations:
- Crop: stream.filter('crop', w, h, x, y)
- Square crop centered: stream.filter('crop', 'min(iw,ih)', 'min(iw,ih)')
- Grayscale: stream.filter('format', 'gray') and pass pix_fmt='gray' or 'yuv420p' as required by the codec
- Scale: stream.filter('scale', w, h)
- Flip: stream.hflip() / stream.vflip()
- Brightness/contrast/saturation: stream.filter('eq', brightness=0.1, contrast=1.2, saturation=1.3)
- Keep the audio stream when present: ffmpeg.output(video, input.audio, output_file)
"#;

/// FFmpeg 工具：配置给出 python / ffmpeg / ffprobe 路径
pub struct FfmpegTool {
    python: String,
    ffmpeg: String,
    probe: Arc<dyn MediaProbe>,
}

impl FfmpegTool {
    pub fn new(cfg: &FfmpegSection) -> Self {
        Self {
            python: cfg.python.clone(),
            ffmpeg: cfg.ffmpeg.clone(),
            probe: Arc::new(FfprobeProbe::from_config(cfg)),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn MediaProbe>) -> Self {
        self.probe = probe;
        self
    }
}

/// 声道数对应的 lavfi 声道布局名
pub fn channel_layout(channels: u32) -> String {
    match channels {
        1 => "mono".to_string(),
        2 => "stereo".to_string(),
        3 => "2.1".to_string(),
        4 => "quad".to_string(),
        5 => "5.0".to_string(),
        6 => "5.1".to_string(),
        7 => "6.1".to_string(),
        8 => "7.1".to_string(),
        n => format!("{}c", n),
    }
}

/// 生成替身的 ffmpeg 参数；不支持的类型返回 None（改为复制）
pub fn synthetic_args(kind: AssetKind, meta: &MediaMetadata, dest: &Path) -> Option<Vec<String>> {
    let width = meta.width.unwrap_or(640);
    let height = meta.height.unwrap_or(480);
    let duration = meta.duration_secs.unwrap_or(5.0);
    let rate = meta.frame_rate.map(|r| r.round() as u32).unwrap_or(15).max(1);
    let sample_rate = meta.sample_rate.unwrap_or(44100);
    let layout = channel_layout(meta.audio_channels.unwrap_or(2));
    let dest = dest.to_string_lossy().to_string();

    let args: Vec<String> = match kind {
        AssetKind::Video => {
            let mut args = vec![
                "-y".into(),
                "-f".into(),
                "lavfi".into(),
                "-i".into(),
                format!("color=c=black:s={width}x{height}:r={rate}:d={duration}"),
            ];
            if meta.audio_channels.is_some() {
                args.extend([
                    "-f".into(),
                    "lavfi".into(),
                    "-i".into(),
                    format!("anullsrc=r={sample_rate}:cl={layout}"),
                ]);
            }
            args.extend(["-t".into(), duration.to_string(), dest]);
            args
        }
        AssetKind::Image => vec![
            "-y".into(),
            "-f".into(),
            "lavfi".into(),
            "-i".into(),
            format!("color=c=black:s={width}x{height}"),
            "-frames:v".into(),
            "1".into(),
            dest,
        ],
        AssetKind::Audio => vec![
            "-y".into(),
            "-f".into(),
            "lavfi".into(),
            "-i".into(),
            format!("anullsrc=r={sample_rate}:cl={layout}"),
            "-t".into(),
            duration.to_string(),
            dest,
        ],
        AssetKind::Other => return None,
    };
    Some(args)
}

#[async_trait]
impl MediaTool for FfmpegTool {
    fn name(&self) -> &str {
        FFMPEG_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Processes videos and images using FFmpeg for transformations like flipping, rotating, \
         color correction, contrast and brightness changes, cropping, scaling, grayscale conversion \
         and other basic effects. Takes input media files and produces one output file."
    }

    fn prerequisites(&self) -> Vec<String> {
        vec![self.python.clone(), self.ffmpeg.clone(), "ffmpeg-python".to_string()]
    }

    fn instructions(&self) -> &str {
        INSTRUCTIONS
    }

    fn runtime(&self) -> ScriptRuntime {
        ScriptRuntime::new(self.python.clone(), "py")
    }

    fn staging(&self, reference: &Asset) -> Staging {
        match reference.kind {
            AssetKind::Other => Staging::Copy,
            _ => Staging::Synthetic,
        }
    }

    async fn synthesize(&self, reference: &Asset, dest: &Path, limits: RunLimits<'_>) -> Result<(), RunError> {
        let Some(args) = synthetic_args(reference.kind, &reference.metadata, dest) else {
            return Err(RunError::Failed(format!("no stand-in generator for {:?}", reference.kind)));
        };
        tracing::debug!(asset = %reference.name, dest = %dest.display(), "creating synthetic stand-in");
        let cwd = dest.parent().unwrap_or_else(|| Path::new("."));
        let output = run_script("stand-in", &self.ffmpeg, &args, cwd, limits.timeout, limits.cancel).await?;
        if !output.success {
            return Err(RunError::Failed(format!(
                "ffmpeg stand-in generation failed ({:?}): {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    fn screen(&self, script: &str) -> Result<(), String> {
        for forbidden in FORBIDDEN_SUBSTR {
            if script.contains(forbidden) {
                return Err(format!("forbidden pattern: {}", forbidden));
            }
        }
        if !script.contains("ffmpeg") {
            return Err("script does not use ffmpeg".to_string());
        }
        Ok(())
    }

    async fn validate(&self, check: &ValidationCheck<'_>) -> Result<(), String> {
        let meta = self
            .probe
            .probe(check.expected_output)
            .await
            .map_err(|e| format!("output is not readable media: {}", e))?;
        if AssetKind::from_path(check.expected_output) == AssetKind::Video
            && meta.duration_secs.unwrap_or(0.0) <= 0.0
        {
            return Err("output video has zero duration".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> FfmpegTool {
        FfmpegTool::new(&FfmpegSection::default())
    }

    #[test]
    fn test_synthetic_video_matches_reference() {
        let meta = MediaMetadata {
            width: Some(1920),
            height: Some(1080),
            duration_secs: Some(10.0),
            frame_rate: Some(29.97),
            audio_channels: Some(2),
            ..Default::default()
        };
        let args = synthetic_args(AssetKind::Video, &meta, Path::new("/sb/in.mp4")).unwrap();
        assert!(args.contains(&"color=c=black:s=1920x1080:r=30:d=10".to_string()));
        assert!(args.contains(&"anullsrc=r=44100:cl=stereo".to_string()));
        assert_eq!(args.last().unwrap(), "/sb/in.mp4");
    }

    #[test]
    fn test_synthetic_defaults_and_other() {
        let args =
            synthetic_args(AssetKind::Video, &MediaMetadata::default(), Path::new("x.mp4")).unwrap();
        assert!(args.contains(&"color=c=black:s=640x480:r=15:d=5".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("anullsrc")));
        assert!(synthetic_args(AssetKind::Other, &MediaMetadata::default(), Path::new("x")).is_none());
    }

    #[test]
    fn test_stand_in_keeps_channel_layout() {
        let meta = MediaMetadata {
            duration_secs: Some(3.0),
            audio_channels: Some(6),
            sample_rate: Some(48000),
            ..Default::default()
        };
        let args = synthetic_args(AssetKind::Audio, &meta, Path::new("a.wav")).unwrap();
        assert!(args.contains(&"anullsrc=r=48000:cl=5.1".to_string()));
        assert_eq!(channel_layout(1), "mono");
        assert_eq!(channel_layout(4), "quad");
        assert_eq!(channel_layout(8), "7.1");
        assert_eq!(channel_layout(12), "12c");
    }

    #[test]
    fn test_screen_rejects_dangerous_scripts() {
        let t = tool();
        assert!(t.screen("import ffmpeg\nimport shutil\nshutil.rmtree('/')").is_err());
        assert!(t.screen("print('hello')").is_err());
        assert!(t
            .screen("import ffmpeg, sys\nffmpeg.run(ffmpeg.input(sys.argv[1]).output(sys.argv[-1]))")
            .is_ok());
    }

    #[test]
    fn test_staging_choice() {
        let t = tool();
        let video = Asset::new("a.mp4", "assets/a.mp4", MediaMetadata::default());
        let text = Asset::new("a.srt", "assets/a.srt", MediaMetadata::default());
        assert_eq!(t.staging(&video), Staging::Synthetic);
        assert_eq!(t.staging(&text), Staging::Copy);
        assert_eq!(t.runtime().extension, "py");
    }
}
