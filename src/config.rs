//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SPLICE__*` 覆盖（双下划线表示嵌套，如 `SPLICE__GENERATION__MAX_ATTEMPTS=5`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub generation: GenerationSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub tools: ToolsSection,
}

/// [app] 段：会话根目录、沙箱根目录
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    /// 所有会话目录的父目录
    #[serde(default = "default_sessions_root")]
    pub sessions_root: PathBuf,
    /// 沙箱临时目录的父目录，未设置时用系统临时目录
    pub sandbox_root: Option<PathBuf>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            sessions_root: default_sessions_root(),
            sandbox_root: None,
        }
    }
}

fn default_sessions_root() -> PathBuf {
    PathBuf::from("sessions")
}

/// [llm] 段：规划与代码生成所用的后端
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 规划模型，未设置时用 model
    pub planner_model: Option<String>,
    /// 代码生成模型，未设置时用 model
    pub generator_model: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            planner_model: None,
            generator_model: None,
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

/// [generation] 段：自我修正预算
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationSection {
    /// 每个步骤最多生成/验证几次
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

/// [sandbox] 段
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxSection {
    /// 单次验证运行的墙钟超时（秒）
    #[serde(default = "default_sandbox_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_sandbox_timeout_secs(),
        }
    }
}

fn default_sandbox_timeout_secs() -> u64 {
    120
}

/// [execution] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionSection {
    /// 真实资产上单步运行的超时（秒）
    #[serde(default = "default_execution_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_execution_timeout_secs(),
        }
    }
}

fn default_execution_timeout_secs() -> u64 {
    300
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ToolsSection {
    #[serde(default)]
    pub ffmpeg: FfmpegSection,
}

/// [tools.ffmpeg] 段：解释器与二进制路径
#[derive(Debug, Clone, Deserialize)]
pub struct FfmpegSection {
    #[serde(default = "default_python")]
    pub python: String,
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,
    /// 单次 ffprobe 调用的超时（秒）
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for FfmpegSection {
    fn default() -> Self {
        Self {
            python: default_python(),
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

fn default_probe_timeout() -> u64 {
    30
}

/// 从 config 目录加载配置，环境变量 SPLICE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SPLICE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SPLICE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
