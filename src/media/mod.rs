//! 媒体资产：类型、元数据与探测能力
//!
//! Asset 创建后不可变；新的编辑总是产出新的 Asset。

pub mod probe;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use probe::{FfprobeProbe, MediaProbe};

/// 资产类别（按扩展名判定）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Video,
    Image,
    Audio,
    Other,
}

impl AssetKind {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "mp4" | "mov" | "mkv" | "avi" | "webm" => AssetKind::Video,
            "png" | "jpg" | "jpeg" | "webp" | "gif" => AssetKind::Image,
            "wav" | "mp3" | "aac" | "flac" | "ogg" | "m4a" => AssetKind::Audio,
            _ => AssetKind::Other,
        }
    }
}

/// 提取出的媒体元数据；不适用的字段为 None
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_secs: Option<f64>,
    pub frame_rate: Option<f64>,
    pub codec: Option<String>,
    pub pix_fmt: Option<String>,
    pub audio_channels: Option<u32>,
    pub sample_rate: Option<u32>,
    /// 像素格式为灰度（gray*）
    #[serde(default)]
    pub grayscale: bool,
    pub size_bytes: Option<u64>,
}

impl MediaMetadata {
    pub fn is_square(&self) -> bool {
        matches!((self.width, self.height), (Some(w), Some(h)) if w == h && w > 0)
    }

    /// 供提示词与日志使用的一行摘要，如 `1920x1080 10.00s 30fps h264`
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let (Some(w), Some(h)) = (self.width, self.height) {
            parts.push(format!("{w}x{h}"));
        }
        if let Some(d) = self.duration_secs {
            parts.push(format!("{d:.2}s"));
        }
        if let Some(r) = self.frame_rate {
            parts.push(format!("{r:.0}fps"));
        }
        if let Some(c) = &self.codec {
            parts.push(c.clone());
        }
        if let Some(ch) = self.audio_channels {
            parts.push(format!("{ch}ch"));
        }
        if self.grayscale {
            parts.push("grayscale".to_string());
        }
        if parts.is_empty() {
            "unknown".to_string()
        } else {
            parts.join(" ")
        }
    }
}

/// 会话内的一个命名媒体对象
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    /// 会话内唯一名称（文件名）
    pub name: String,
    /// 相对会话目录的路径
    pub path: PathBuf,
    pub kind: AssetKind,
    pub metadata: MediaMetadata,
    pub created_at: DateTime<Utc>,
    /// 产出该资产的编辑请求（导入的资产为 None）
    pub produced_by: Option<String>,
}

impl Asset {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, metadata: MediaMetadata) -> Self {
        let path = path.into();
        Self {
            name: name.into(),
            kind: AssetKind::from_path(&path),
            path,
            metadata,
            created_at: Utc::now(),
            produced_by: None,
        }
    }

    pub fn with_producer(mut self, request_id: impl Into<String>) -> Self {
        self.produced_by = Some(request_id.into());
        self
    }

    pub fn extension(&self) -> Option<&str> {
        self.path.extension().and_then(|e| e.to_str())
    }
}
