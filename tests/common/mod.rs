//! 集成测试共用的替身：文本“媒体”、sh 工具、脚本化规划与生成
//!
//! 测试媒体文件的内容是一行 `WxH;pix_fmt;duration`，FakeProbe 解析它作为元数据。

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use splice::config::AppConfig;
use splice::core::{EditOrchestrator, OrchestratorBuilder};
use splice::media::{Asset, MediaMetadata, MediaProbe};
use splice::pipeline::{CodeGenerator, GenerationRequest, Plan, Planner, Task};
use splice::tools::{
    MediaTool, RunError, RunLimits, ScriptRuntime, Staging, ToolDescriptor, ToolRegistry, ValidationCheck,
};
use tokio::sync::Notify;

pub const TOOL: &str = "FFmpeg Processor";

pub const CROP_SQUARE: &str = r#"IFS=';' read dims fmt dur < "$1"
w=${dims%x*}
h=${dims#*x}
s=$w
[ "$h" -lt "$w" ] && s=$h
printf '%sx%s;%s;%s\n' "$s" "$s" "$fmt" "$dur" > "$2"
"#;

pub const GRAYSCALE: &str = r#"IFS=';' read dims fmt dur < "$1"
printf '%s;gray;%s\n' "$dims" "$dur" > "$2"
"#;

pub fn media_line(width: u32, height: u32, pix_fmt: &str, duration: f64) -> String {
    format!("{}x{};{};{}\n", width, height, pix_fmt, duration)
}

pub struct FakeProbe;

#[async_trait]
impl MediaProbe for FakeProbe {
    async fn probe(&self, path: &Path) -> Result<MediaMetadata, String> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| e.to_string())?;
        let mut parts = raw.trim().split(';');
        let dims = parts.next().ok_or("no dims")?;
        let pix_fmt = parts.next().ok_or("no pix_fmt")?.to_string();
        let duration: f64 = parts
            .next()
            .ok_or("no duration")?
            .parse()
            .map_err(|_| "bad duration".to_string())?;
        let (w, h) = dims.split_once('x').ok_or("bad dims")?;
        Ok(MediaMetadata {
            width: Some(w.parse().map_err(|_| "bad width".to_string())?),
            height: Some(h.parse().map_err(|_| "bad height".to_string())?),
            duration_secs: Some(duration),
            grayscale: pix_fmt.starts_with("gray"),
            pix_fmt: Some(pix_fmt),
            size_bytes: Some(raw.len() as u64),
            ..Default::default()
        })
    }
}

/// sh 脚本工具：替身按参考元数据写出 `WxH;pix_fmt;duration`，校验时记录看到的替身内容
#[derive(Default)]
pub struct ShTool {
    pub staged_seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl MediaTool for ShTool {
    fn name(&self) -> &str {
        TOOL
    }

    fn description(&self) -> &str {
        "edits text media with sh"
    }

    fn instructions(&self) -> &str {
        "write a POSIX sh script; $1 is the input and $2 the output"
    }

    fn runtime(&self) -> ScriptRuntime {
        ScriptRuntime::new("sh", "sh")
    }

    fn staging(&self, _reference: &Asset) -> Staging {
        Staging::Synthetic
    }

    async fn synthesize(&self, reference: &Asset, dest: &Path, _limits: RunLimits<'_>) -> Result<(), RunError> {
        let m = &reference.metadata;
        let line = media_line(
            m.width.unwrap_or(640),
            m.height.unwrap_or(480),
            m.pix_fmt.as_deref().unwrap_or("yuv420p"),
            m.duration_secs.unwrap_or(5.0),
        );
        tokio::fs::write(dest, line)
            .await
            .map_err(|e| RunError::Failed(e.to_string()))
    }

    async fn validate(&self, check: &ValidationCheck<'_>) -> Result<(), String> {
        for staged in check.staged_inputs {
            let text = std::fs::read_to_string(staged).map_err(|e| e.to_string())?;
            self.staged_seen
                .lock()
                .map_err(|e| e.to_string())?
                .push(text.trim().to_string());
        }
        FakeProbe
            .probe(check.expected_output)
            .await
            .map(|_| ())
            .map_err(|e| format!("output is not readable media: {}", e))
    }
}

/// 返回固定计划；可选在返回前等待放行
pub struct FakePlanner {
    result: Result<Plan, String>,
    gate: Option<Arc<Notify>>,
    pub calls: Mutex<usize>,
}

impl FakePlanner {
    pub fn tasks(tasks: &[(&str, &str)]) -> Self {
        Self {
            result: Ok(Plan::new(
                tasks.iter().map(|(d, t)| Task::new(*d, *t)).collect(),
            )),
            gate: None,
            calls: Mutex::new(0),
        }
    }

    pub fn plan(plan: Plan) -> Self {
        Self {
            result: Ok(plan),
            gate: None,
            calls: Mutex::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(message.to_string()),
            gate: None,
            calls: Mutex::new(0),
        }
    }

    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }
}

#[async_trait]
impl Planner for FakePlanner {
    async fn plan(
        &self,
        _prompt: &str,
        _catalog: &[ToolDescriptor],
        _inventory: &[Asset],
    ) -> Result<Plan, String> {
        *self.calls.lock().unwrap() += 1;
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.result.clone()
    }
}

type Script = Box<dyn Fn(&GenerationRequest) -> Result<String, String> + Send + Sync>;

/// 按请求决定脚本，并记录所有请求
pub struct ScriptedGenerator {
    script: Script,
    pub requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new(script: impl Fn(&GenerationRequest) -> Result<String, String> + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 按任务描述选择脚本：含 "crop" 用裁剪，含 "black and white" 用灰度，其余复制
    pub fn by_task() -> Self {
        Self::new(|req| {
            let d = req.task.description.to_lowercase();
            Ok(if d.contains("crop") {
                CROP_SQUARE.to_string()
            } else if d.contains("black and white") {
                GRAYSCALE.to_string()
            } else {
                "cp \"$1\" \"$2\"".to_string()
            })
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl CodeGenerator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, String> {
        self.requests.lock().unwrap().push(request.clone());
        (self.script)(request)
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub orchestrator: Arc<EditOrchestrator>,
    pub generator: Arc<ScriptedGenerator>,
    pub planner: Arc<FakePlanner>,
    pub staged_seen: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    pub fn new(planner: FakePlanner, generator: ScriptedGenerator) -> Self {
        Self::with_attempts(planner, generator, 3)
    }

    pub fn with_attempts(planner: FakePlanner, generator: ScriptedGenerator, max_attempts: u32) -> Self {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.app.sessions_root = dir.path().join("sessions");
        config.app.sandbox_root = Some(dir.path().join("sandboxes"));
        config.generation.max_attempts = max_attempts;

        let tool = ShTool::default();
        let staged_seen = tool.staged_seen.clone();
        let mut registry = ToolRegistry::new();
        registry.register(tool).unwrap();

        let planner = Arc::new(planner);
        let generator = Arc::new(generator);
        let orchestrator = OrchestratorBuilder::new(config)
            .with_registry(registry)
            .with_planner(planner.clone())
            .with_generator(generator.clone())
            .with_probe(Arc::new(FakeProbe))
            .with_timeouts(Duration::from_secs(10), Duration::from_secs(10))
            .build()
            .unwrap();

        Self {
            dir,
            orchestrator: Arc::new(orchestrator),
            generator,
            planner,
            staged_seen,
        }
    }

    /// 写一个源文件并以它创建会话
    pub async fn session_with_video(&self, width: u32, height: u32, duration: f64) -> String {
        let src = self.dir.path().join("clip.mp4");
        std::fs::write(&src, media_line(width, height, "yuv420p", duration)).unwrap();
        self.orchestrator.create_session(Some(&src)).await.unwrap()
    }

    pub fn session_dir(&self, id: &str) -> PathBuf {
        self.dir.path().join("sessions").join(id)
    }

    pub fn count_entries(&self, dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    pub fn sandboxes_left(&self) -> usize {
        self.count_entries(&self.dir.path().join("sandboxes"))
    }
}
