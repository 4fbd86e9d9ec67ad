//! 脚本生成循环：生成 → 沙箱验证 → 失败则带着诊断重试，直到通过或预算耗尽
//!
//! 控制流是一个有界状态机（Drafting → Validating → Accepted / Drafting / Failed），
//! 唯一的状态是尝试记录（transcript）；耗尽时返回 GenerationFailure 并携带全部尝试。

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::core::{EditError, FailureReason};
use crate::media::Asset;
use crate::pipeline::sandbox::{SandboxValidator, ValidationRequest};
use crate::pipeline::Task;
use crate::tools::MediaTool;

/// 代码生成能力：生成请求 → 脚本源码
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, String>;
}

/// 输入资产在生成请求中的描述
#[derive(Debug, Clone, Serialize)]
pub struct InputContext {
    pub name: String,
    pub kind: String,
    pub summary: String,
}

impl From<&Asset> for InputContext {
    fn from(asset: &Asset) -> Self {
        Self {
            name: asset.name.clone(),
            kind: format!("{:?}", asset.kind).to_lowercase(),
            summary: asset.metadata.summary(),
        }
    }
}

/// 一次生成调用的完整输入
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub task: Task,
    pub tool_name: String,
    pub tool_instructions: String,
    pub inputs: Vec<InputContext>,
    pub output_name: String,
    /// 同一请求中前序步骤已接受的脚本
    pub script_history: Vec<String>,
    /// 本任务之前的失败尝试（自我修正反馈）
    pub attempts: Vec<AttemptRecord>,
}

impl GenerationRequest {
    /// 1 起的当前尝试序号
    pub fn attempt_number(&self) -> usize {
        self.attempts.len() + 1
    }

    /// 上下文片段：任务 / 输入 / 前序脚本 / 失败尝试
    pub fn to_prompt_section(&self) -> String {
        let mut s = String::new();
        s.push_str(&format!("## Task\n{}\n\n", self.task.description));
        if let Some(params) = &self.task.params {
            s.push_str(&format!("## Parameters\n{}\n\n", params));
        }
        if !self.inputs.is_empty() {
            s.push_str("## Inputs (in argument order)\n");
            for (i, input) in self.inputs.iter().enumerate() {
                s.push_str(&format!(
                    "{}. {} ({}, {})\n",
                    i + 1,
                    input.name,
                    input.kind,
                    input.summary
                ));
            }
            s.push('\n');
        }
        s.push_str(&format!("## Output\n{}\n\n", self.output_name));
        if !self.script_history.is_empty() {
            s.push_str("## Scripts accepted for earlier steps\n");
            for script in &self.script_history {
                s.push_str(&format!("```\n{}\n```\n", script.trim_end()));
            }
            s.push('\n');
        }
        if !self.attempts.is_empty() {
            s.push_str("## Previous attempts failed\n");
            for a in &self.attempts {
                let reason = a
                    .reason
                    .as_ref()
                    .map(|r| r.to_string())
                    .unwrap_or_default();
                s.push_str(&format!("### Attempt {} ({})\n", a.attempt, reason));
                if let Some(script) = &a.script {
                    s.push_str(&format!("```\n{}\n```\n", script.trim_end()));
                }
                s.push_str(&format!("Error:\n{}\n\n", a.message.trim_end()));
            }
            s.push_str("Fix the problems above and return the corrected script.\n");
        }
        s
    }
}

/// 一次尝试的记录
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub attempt: usize,
    /// None 表示生成能力没有给出脚本
    pub script: Option<String>,
    pub ok: bool,
    pub reason: Option<FailureReason>,
    pub message: String,
    pub produced: Vec<PathBuf>,
    pub generation_ms: u64,
    pub validation_ms: u64,
}

/// 预算耗尽：携带全部尝试记录
#[derive(Debug, Clone, Serialize)]
pub struct GenerationFailure {
    pub task: Task,
    pub attempts: Vec<AttemptRecord>,
    #[serde(with = "crate::core::report::duration_ms")]
    pub generation: Duration,
    #[serde(with = "crate::core::report::duration_ms")]
    pub validation: Duration,
}

impl GenerationFailure {
    /// 最后一次验证的诊断
    pub fn last_message(&self) -> Option<&str> {
        self.attempts.last().map(|a| a.message.as_str())
    }
}

/// 通过验证的脚本
#[derive(Debug, Clone)]
pub struct GeneratedScript {
    pub source: String,
    pub attempts: Vec<AttemptRecord>,
    pub generation: Duration,
    pub validation: Duration,
}

/// 一个步骤的生成上下文
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    /// 参考资产（路径相对 source_dir），按参数顺序
    pub inputs: &'a [Asset],
    pub source_dir: &'a Path,
    pub output_name: &'a str,
    pub script_history: &'a [String],
}

enum DraftState {
    Drafting,
    Validating(String),
    Accepted(String),
    Failed,
}

impl DraftState {
    fn label(&self) -> &'static str {
        match self {
            DraftState::Drafting => "drafting",
            DraftState::Validating(_) => "validating",
            DraftState::Accepted(_) => "accepted",
            DraftState::Failed => "failed",
        }
    }
}

/// 生成循环：持有生成能力与沙箱验证器
pub struct ScriptGenerator {
    generator: Arc<dyn CodeGenerator>,
    sandbox: SandboxValidator,
}

impl ScriptGenerator {
    pub fn new(generator: Arc<dyn CodeGenerator>, sandbox: SandboxValidator) -> Self {
        Self { generator, sandbox }
    }

    pub async fn generate_validated(
        &self,
        task: &Task,
        tool: &dyn MediaTool,
        ctx: StepContext<'_>,
        max_attempts: usize,
        cancel: &CancellationToken,
    ) -> Result<GeneratedScript, EditError> {
        let max_attempts = max_attempts.max(1);
        let inputs: Vec<InputContext> = ctx.inputs.iter().map(InputContext::from).collect();
        let mut transcript: Vec<AttemptRecord> = Vec::with_capacity(max_attempts);
        let mut generation = Duration::ZERO;
        let mut validation = Duration::ZERO;
        let mut generation_ms = 0u64;
        let mut state = DraftState::Drafting;

        loop {
            tracing::debug!(tool = tool.name(), attempt = transcript.len() + 1, state = state.label(), "generation state");
            state = match state {
                DraftState::Drafting => {
                    if cancel.is_cancelled() {
                        return Err(EditError::Cancelled);
                    }
                    let request = GenerationRequest {
                        task: task.clone(),
                        tool_name: tool.name().to_string(),
                        tool_instructions: tool.instructions().to_string(),
                        inputs: inputs.clone(),
                        output_name: ctx.output_name.to_string(),
                        script_history: ctx.script_history.to_vec(),
                        attempts: transcript.clone(),
                    };
                    let start = Instant::now();
                    let generated = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(EditError::Cancelled),
                        out = self.generator.generate(&request) => out,
                    };
                    let elapsed = start.elapsed();
                    generation += elapsed;
                    generation_ms = elapsed.as_millis() as u64;

                    let drafted = match generated.map(|raw| clean_script(&raw)) {
                        Ok(script) if !script.trim().is_empty() => Ok(script),
                        Ok(_) => Err("generator returned an empty script".to_string()),
                        Err(e) => Err(e),
                    };
                    match drafted {
                        Ok(script) => DraftState::Validating(script),
                        Err(message) => {
                            tracing::warn!(tool = tool.name(), attempt = request.attempt_number(), error = %message, "generation attempt failed");
                            transcript.push(AttemptRecord {
                                attempt: request.attempt_number(),
                                script: None,
                                ok: false,
                                reason: Some(FailureReason::Generation(message.clone())),
                                message,
                                produced: Vec::new(),
                                generation_ms,
                                validation_ms: 0,
                            });
                            next_after_failure(transcript.len(), max_attempts)
                        }
                    }
                }
                DraftState::Validating(script) => {
                    let attempt = transcript.len() + 1;
                    let req = ValidationRequest {
                        script: &script,
                        reference_assets: ctx.inputs,
                        source_dir: ctx.source_dir,
                        output_name: ctx.output_name,
                    };
                    let result = self.sandbox.validate(tool, &req, cancel).await;
                    validation += result.duration;
                    if result.reason == Some(FailureReason::Cancelled) {
                        return Err(EditError::Cancelled);
                    }
                    tracing::info!(
                        tool = tool.name(),
                        attempt,
                        ok = result.ok,
                        reason = ?result.reason,
                        "validation finished"
                    );
                    transcript.push(AttemptRecord {
                        attempt,
                        script: Some(script.clone()),
                        ok: result.ok,
                        reason: result.reason.clone(),
                        message: result.message.clone(),
                        produced: result.produced_paths.clone(),
                        generation_ms,
                        validation_ms: result.duration.as_millis() as u64,
                    });
                    if result.ok {
                        DraftState::Accepted(script)
                    } else {
                        next_after_failure(transcript.len(), max_attempts)
                    }
                }
                DraftState::Accepted(source) => {
                    return Ok(GeneratedScript {
                        source,
                        attempts: transcript,
                        generation,
                        validation,
                    })
                }
                DraftState::Failed => {
                    tracing::warn!(tool = tool.name(), attempts = transcript.len(), "self-correction budget exhausted");
                    return Err(EditError::GenerationFailure(GenerationFailure {
                        task: task.clone(),
                        attempts: transcript,
                        generation,
                        validation,
                    }));
                }
            };
        }
    }
}

fn next_after_failure(used: usize, max_attempts: usize) -> DraftState {
    if used < max_attempts {
        DraftState::Drafting
    } else {
        DraftState::Failed
    }
}

static FENCE_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// 去掉 markdown 代码块围栏；有多个代码块时取第一个
pub fn clean_script(raw: &str) -> String {
    let re = FENCE_RE.get_or_init(|| Regex::new(r"(?s)```[A-Za-z0-9_+\-]*[ \t]*\r?\n(.*?)```").ok());
    if let Some(caps) = re.as_ref().and_then(|re| re.captures(raw)) {
        if let Some(body) = caps.get(1) {
            return body.as_str().trim().to_string();
        }
    }
    raw.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaMetadata;
    use crate::tools::{ScriptRuntime, Staging};
    use std::sync::Mutex;

    struct ShTool;

    #[async_trait]
    impl MediaTool for ShTool {
        fn name(&self) -> &str {
            "sh"
        }

        fn description(&self) -> &str {
            "shell"
        }

        fn instructions(&self) -> &str {
            "write a POSIX sh script"
        }

        fn runtime(&self) -> ScriptRuntime {
            ScriptRuntime::new("sh", "sh")
        }

        fn staging(&self, _reference: &Asset) -> Staging {
            Staging::Copy
        }
    }

    /// 依次返回预设脚本，并记录收到的请求
    struct Scripted {
        scripts: Vec<Result<String, String>>,
        seen: Mutex<Vec<GenerationRequest>>,
    }

    impl Scripted {
        fn new(scripts: Vec<Result<&str, &str>>) -> Self {
            Self {
                scripts: scripts
                    .into_iter()
                    .map(|r| r.map(str::to_string).map_err(str::to_string))
                    .collect(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CodeGenerator for Scripted {
        async fn generate(&self, request: &GenerationRequest) -> Result<String, String> {
            let mut seen = self.seen.lock().unwrap();
            let i = seen.len().min(self.scripts.len() - 1);
            seen.push(request.clone());
            self.scripts[i].clone()
        }
    }

    fn fixture() -> (tempfile::TempDir, Vec<Asset>) {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("assets")).unwrap();
        std::fs::write(dir.path().join("assets/in.mp4"), "data").unwrap();
        (
            dir,
            vec![Asset::new("in.mp4", "assets/in.mp4", MediaMetadata::default())],
        )
    }

    async fn run(
        generator: Arc<Scripted>,
        max_attempts: usize,
    ) -> (Result<GeneratedScript, EditError>, tempfile::TempDir) {
        let (dir, inputs) = fixture();
        let looper = ScriptGenerator::new(
            generator,
            SandboxValidator::new(Some(dir.path().join("sb")), 5),
        );
        let history = vec!["echo earlier".to_string()];
        let ctx = StepContext {
            inputs: &inputs,
            source_dir: dir.path(),
            output_name: "out.mp4",
            script_history: &history,
        };
        let result = looper
            .generate_validated(&Task::new("copy", "sh"), &ShTool, ctx, max_attempts, &CancellationToken::new())
            .await;
        (result, dir)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_self_correction_feeds_back_diagnostic() {
        let generator = Arc::new(Scripted::new(vec![
            Ok("echo 'no such filter: grayy' >&2; exit 1"),
            Ok("```sh\ncp \"$1\" \"$2\"\n```"),
        ]));
        let (result, _dir) = run(generator.clone(), 3).await;
        let script = result.unwrap();
        assert_eq!(script.source, "cp \"$1\" \"$2\"");
        assert_eq!(script.attempts.len(), 2);
        assert!(!script.attempts[0].ok);
        assert!(script.attempts[1].ok);

        let seen = generator.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].attempts.is_empty());
        assert_eq!(seen[0].script_history, vec!["echo earlier".to_string()]);
        assert_eq!(seen[1].attempts.len(), 1);
        assert!(seen[1].attempts[0].message.contains("no such filter"));
        assert!(seen[1].to_prompt_section().contains("Previous attempts failed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exhaustion_returns_full_transcript() {
        let generator = Arc::new(Scripted::new(vec![Ok("exit 3")]));
        let (result, dir) = run(generator.clone(), 3).await;
        match result {
            Err(EditError::GenerationFailure(failure)) => {
                assert_eq!(failure.attempts.len(), 3);
                assert!(failure
                    .attempts
                    .iter()
                    .all(|a| a.reason == Some(FailureReason::NonZeroExit(Some(3)))));
            }
            other => panic!("expected GenerationFailure, got {:?}", other.map(|s| s.source)),
        }
        // 所有沙箱都已清理
        assert_eq!(std::fs::read_dir(dir.path().join("sb")).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_zero_exit_without_output_is_not_accepted() {
        let generator = Arc::new(Scripted::new(vec![Ok("echo done")]));
        let (result, _dir) = run(generator, 2).await;
        match result {
            Err(EditError::GenerationFailure(failure)) => {
                assert_eq!(failure.attempts.len(), 2);
                assert_eq!(failure.attempts[0].reason, Some(FailureReason::MissingOutput));
            }
            other => panic!("expected GenerationFailure, got {:?}", other.map(|s| s.source)),
        }
    }

    #[tokio::test]
    async fn test_generator_errors_count_as_attempts() {
        let generator = Arc::new(Scripted::new(vec![Err("rate limited")]));
        let (result, _dir) = run(generator.clone(), 2).await;
        match result {
            Err(EditError::GenerationFailure(failure)) => {
                assert_eq!(failure.attempts.len(), 2);
                assert!(failure.attempts[0].script.is_none());
                assert_eq!(failure.last_message(), Some("rate limited"));
            }
            other => panic!("expected GenerationFailure, got {:?}", other.map(|s| s.source)),
        }
    }

    #[test]
    fn test_clean_script() {
        assert_eq!(clean_script("```python\nimport ffmpeg\n```"), "import ffmpeg");
        assert_eq!(
            clean_script("Here you go:\n```\nprint(1)\n```\nthanks"),
            "print(1)"
        );
        assert_eq!(clean_script("  import ffmpeg\n"), "import ffmpeg");
    }
}
