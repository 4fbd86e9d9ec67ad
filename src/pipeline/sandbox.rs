//! 沙箱验证器：在一次性隔离目录里用替身或副本运行生成脚本
//!
//! 每次验证尝试独占一个 TempDir（`sandbox-*`），无论成功、失败、超时、取消都会被删除；
//! 只读取参考资产，不写沙箱以外的任何位置。超时作为失败返回，本层不重试。

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::core::{EditError, FailureReason};
use crate::media::Asset;
use crate::tools::{list_files, run_script, MediaTool, RunError, RunLimits, Staging, ValidationCheck};

/// 一次验证的结论
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub ok: bool,
    pub reason: Option<FailureReason>,
    /// 诊断文本（进程输出或校验例程的说明）
    pub message: String,
    /// 运行后新出现的文件名（沙箱已删除，只保留名称）
    pub produced_paths: Vec<PathBuf>,
    /// 本次使用的沙箱目录（返回时已不存在）
    pub sandbox_dir: Option<PathBuf>,
    #[serde(with = "crate::core::report::duration_ms")]
    pub duration: Duration,
}

impl ValidationResult {
    fn failed(reason: FailureReason, message: impl Into<String>, start: Instant) -> Self {
        Self {
            ok: false,
            reason: Some(reason),
            message: message.into(),
            produced_paths: Vec::new(),
            sandbox_dir: None,
            duration: start.elapsed(),
        }
    }

    /// `[reason] message` 形式，用于反馈给下一次生成
    pub fn diagnostic(&self) -> String {
        match &self.reason {
            Some(reason) => format!("[{}] {}", reason, self.message),
            None => self.message.clone(),
        }
    }
}

/// 一次验证的输入
#[derive(Debug)]
pub struct ValidationRequest<'a> {
    pub script: &'a str,
    /// 参考资产（路径相对 source_dir）
    pub reference_assets: &'a [Asset],
    pub source_dir: &'a Path,
    /// 期望的产物文件名
    pub output_name: &'a str,
}

/// 沙箱验证器：持有沙箱父目录与超时
#[derive(Debug, Clone)]
pub struct SandboxValidator {
    root: Option<PathBuf>,
    timeout: Duration,
}

impl SandboxValidator {
    pub fn new(root: Option<PathBuf>, timeout_secs: u64) -> Self {
        Self {
            root,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn validate(
        &self,
        tool: &dyn MediaTool,
        req: &ValidationRequest<'_>,
        cancel: &CancellationToken,
    ) -> ValidationResult {
        let start = Instant::now();

        if let Err(why) = tool.screen(req.script) {
            tracing::warn!(tool = tool.name(), reason = %why, "script rejected before running");
            return ValidationResult::failed(FailureReason::Rejected(why.clone()), why, start);
        }

        let mut builder = tempfile::Builder::new();
        builder.prefix("sandbox-");
        let created = match &self.root {
            Some(root) => tokio::fs::create_dir_all(root)
                .await
                .and_then(|_| builder.tempdir_in(root)),
            None => builder.tempdir(),
        };
        let area = match created {
            Ok(area) => area,
            Err(e) => {
                return ValidationResult::failed(
                    FailureReason::Environment("sandbox".to_string()),
                    format!("cannot create sandbox: {}", e),
                    start,
                )
            }
        };
        let sandbox_dir = area.path().to_path_buf();
        tracing::debug!(tool = tool.name(), sandbox = %sandbox_dir.display(), "sandbox created");

        let mut result = self.run_in(tool, req, &sandbox_dir, cancel, start).await;
        result.sandbox_dir = Some(sandbox_dir.clone());

        if let Err(e) = area.close() {
            tracing::warn!(sandbox = %sandbox_dir.display(), error = %e, "sandbox teardown failed");
        }
        result.duration = start.elapsed();
        result
    }

    async fn run_in(
        &self,
        tool: &dyn MediaTool,
        req: &ValidationRequest<'_>,
        sandbox_dir: &Path,
        cancel: &CancellationToken,
        start: Instant,
    ) -> ValidationResult {
        let limits = RunLimits::new(self.timeout, cancel);
        let staged = match self
            .bounded("staging", stage_inputs(tool, req, sandbox_dir, limits), cancel)
            .await
        {
            Ok(Ok(staged)) => staged,
            Ok(Err(RunError::Timeout(_))) => return self.timed_out("staging", start),
            Ok(Err(RunError::Cancelled)) => {
                return ValidationResult::failed(FailureReason::Cancelled, "cancelled", start)
            }
            Ok(Err(RunError::Spawn(why))) | Ok(Err(RunError::Failed(why))) => {
                return ValidationResult::failed(
                    FailureReason::Environment("staging".to_string()),
                    why,
                    start,
                )
            }
            Err(reason) => return self.interrupted(reason, "staging", start),
        };

        let runtime = tool.runtime();
        let script_path = sandbox_dir.join(format!("script.{}", runtime.extension));
        if let Err(e) = tokio::fs::write(&script_path, req.script).await {
            return ValidationResult::failed(
                FailureReason::Environment("script".to_string()),
                format!("cannot write script: {}", e),
                start,
            );
        }
        let output_path = sandbox_dir.join(req.output_name);

        let before: HashSet<PathBuf> = match list_files(sandbox_dir).await {
            Ok(files) => files.into_iter().collect(),
            Err(e) => {
                return ValidationResult::failed(
                    FailureReason::Environment("sandbox".to_string()),
                    e.to_string(),
                    start,
                )
            }
        };

        let args = runtime.args(&script_path, &staged, &output_path);
        let run = run_script(
            "validation",
            &runtime.interpreter,
            &args,
            sandbox_dir,
            self.timeout,
            cancel,
        )
        .await;

        let output = match run {
            Ok(output) => output,
            Err(RunError::Timeout(_)) => return self.timed_out("script", start),
            Err(RunError::Cancelled) => {
                return ValidationResult::failed(FailureReason::Cancelled, "cancelled", start)
            }
            Err(RunError::Spawn(why)) | Err(RunError::Failed(why)) => {
                return ValidationResult::failed(FailureReason::Environment(why.clone()), why, start)
            }
        };

        let produced: Vec<PathBuf> = list_files(sandbox_dir)
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|p| !before.contains(p))
            .collect();
        let produced_names: Vec<PathBuf> = produced
            .iter()
            .filter_map(|p| p.file_name().map(PathBuf::from))
            .collect();

        let mut result = if !output.success {
            ValidationResult::failed(
                FailureReason::NonZeroExit(output.exit_code),
                output.diagnostic(),
                start,
            )
        } else if produced.is_empty() || !output_path.is_file() {
            ValidationResult::failed(
                FailureReason::MissingOutput,
                format!(
                    "script exited successfully but did not produce {}\n{}",
                    req.output_name,
                    output.diagnostic()
                ),
                start,
            )
        } else {
            let check = ValidationCheck {
                script: req.script,
                sandbox_dir,
                reference_assets: req.reference_assets,
                staged_inputs: &staged,
                produced: &produced,
                expected_output: &output_path,
            };
            match self.bounded("check", tool.validate(&check), cancel).await {
                Err(reason) => self.interrupted(reason, "check", start),
                Ok(Ok(())) => ValidationResult {
                    ok: true,
                    reason: None,
                    message: output.diagnostic(),
                    produced_paths: Vec::new(),
                    sandbox_dir: None,
                    duration: start.elapsed(),
                },
                Ok(Err(why)) => ValidationResult::failed(FailureReason::Rejected(why.clone()), why, start),
            }
        };
        result.produced_paths = produced_names;
        result
    }

    /// 工具阶段（替身生成、校验例程）与脚本共用同一超时，并响应取消
    async fn bounded<T>(
        &self,
        phase: &str,
        fut: impl Future<Output = T>,
        cancel: &CancellationToken,
    ) -> Result<T, FailureReason> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FailureReason::Cancelled),
            out = tokio::time::timeout(self.timeout, fut) => out.map_err(|_| {
                tracing::warn!(phase, timeout = ?self.timeout, "sandbox phase timed out");
                FailureReason::Timeout
            }),
        }
    }

    fn interrupted(&self, reason: FailureReason, phase: &str, start: Instant) -> ValidationResult {
        match reason {
            FailureReason::Timeout => self.timed_out(phase, start),
            reason => ValidationResult::failed(reason, "cancelled", start),
        }
    }

    fn timed_out(&self, phase: &str, start: Instant) -> ValidationResult {
        let err = EditError::ValidationTimeout(self.timeout);
        ValidationResult::failed(FailureReason::Timeout, format!("{} ({})", err, phase), start)
    }
}

/// 按工具选择把参考资产复制或合成到沙箱；返回与参考资产一一对应的沙箱路径
async fn stage_inputs(
    tool: &dyn MediaTool,
    req: &ValidationRequest<'_>,
    sandbox_dir: &Path,
    limits: RunLimits<'_>,
) -> Result<Vec<PathBuf>, RunError> {
    let mut staged = Vec::with_capacity(req.reference_assets.len());
    let mut used = HashSet::new();
    for (i, asset) in req.reference_assets.iter().enumerate() {
        let base = asset
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| asset.name.clone());
        let name = if used.insert(base.clone()) {
            base
        } else {
            format!("{}_{}", i, base)
        };
        let dest = sandbox_dir.join(&name);
        match tool.staging(asset) {
            Staging::Copy => {
                let src = req.source_dir.join(&asset.path);
                tokio::fs::copy(&src, &dest)
                    .await
                    .map_err(|e| RunError::Failed(format!("cannot copy {}: {}", src.display(), e)))?;
            }
            Staging::Synthetic => tool.synthesize(asset, &dest, limits).await?,
        }
        staged.push(dest);
    }
    Ok(staged)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::media::MediaMetadata;
    use crate::tools::ScriptRuntime;
    use async_trait::async_trait;

    /// sh 脚本工具；synthetic 时写入参考分辨率文本作为替身
    struct ShTool {
        staging: Staging,
        reject_output: bool,
    }

    #[async_trait]
    impl MediaTool for ShTool {
        fn name(&self) -> &str {
            "sh"
        }

        fn description(&self) -> &str {
            "shell"
        }

        fn instructions(&self) -> &str {
            "write sh"
        }

        fn runtime(&self) -> ScriptRuntime {
            ScriptRuntime::new("sh", "sh")
        }

        fn staging(&self, _reference: &Asset) -> Staging {
            self.staging
        }

        async fn synthesize(&self, reference: &Asset, dest: &Path, _limits: RunLimits<'_>) -> Result<(), RunError> {
            let m = &reference.metadata;
            let text = format!("{}x{}", m.width.unwrap_or(0), m.height.unwrap_or(0));
            tokio::fs::write(dest, text)
                .await
                .map_err(|e| RunError::Failed(e.to_string()))
        }

        fn screen(&self, script: &str) -> Result<(), String> {
            if script.contains("forbidden") {
                Err("forbidden".to_string())
            } else {
                Ok(())
            }
        }

        async fn validate(&self, _check: &ValidationCheck<'_>) -> Result<(), String> {
            if self.reject_output {
                Err("bad output".to_string())
            } else {
                Ok(())
            }
        }
    }

    fn tool() -> ShTool {
        ShTool {
            staging: Staging::Synthetic,
            reject_output: false,
        }
    }

    fn fixture() -> (tempfile::TempDir, Vec<Asset>) {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("assets")).unwrap();
        std::fs::write(dir.path().join("assets/clip.mp4"), "REAL CONTENT").unwrap();
        let meta = MediaMetadata {
            width: Some(1920),
            height: Some(1080),
            duration_secs: Some(10.0),
            ..Default::default()
        };
        (dir, vec![Asset::new("clip.mp4", "assets/clip.mp4", meta)])
    }

    async fn run(tool: &ShTool, script: &str, timeout: Duration) -> (ValidationResult, tempfile::TempDir) {
        let (dir, assets) = fixture();
        let validator = SandboxValidator::new(Some(dir.path().join("sandboxes")), 5).with_timeout(timeout);
        let req = ValidationRequest {
            script,
            reference_assets: &assets,
            source_dir: dir.path(),
            output_name: "out.mp4",
        };
        let result = validator.validate(tool, &req, &CancellationToken::new()).await;
        (result, dir)
    }

    #[tokio::test]
    async fn test_success_against_synthetic_input() {
        let script = "#!/bin/sh\ncat \"$1\" > \"$2\"\n";
        let (result, dir) = run(&tool(), script, Duration::from_secs(5)).await;
        assert!(result.ok, "{}", result.diagnostic());
        assert_eq!(result.produced_paths, vec![PathBuf::from("out.mp4")]);
        assert!(!result.sandbox_dir.unwrap().exists());
        // 真实资产未被改动，且沙箱外没有新文件
        assert_eq!(
            std::fs::read_to_string(dir.path().join("assets/clip.mp4")).unwrap(),
            "REAL CONTENT"
        );
        assert!(!dir.path().join("out.mp4").exists());
    }

    #[tokio::test]
    async fn test_synthetic_stand_in_has_reference_properties() {
        let script = "grep -q 1920x1080 \"$1\" && cp \"$1\" \"$2\"";
        let (result, _dir) = run(&tool(), script, Duration::from_secs(5)).await;
        assert!(result.ok, "{}", result.diagnostic());
    }

    #[tokio::test]
    async fn test_copy_staging_uses_real_bytes() {
        let t = ShTool {
            staging: Staging::Copy,
            reject_output: false,
        };
        let script = "grep -q 'REAL CONTENT' \"$1\" && cp \"$1\" \"$2\"";
        let (result, _dir) = run(&t, script, Duration::from_secs(5)).await;
        assert!(result.ok, "{}", result.diagnostic());
    }

    #[tokio::test]
    async fn test_non_zero_exit_carries_stderr() {
        let (result, _dir) = run(&tool(), "echo broken filter >&2; exit 2", Duration::from_secs(5)).await;
        assert!(!result.ok);
        assert_eq!(result.reason, Some(FailureReason::NonZeroExit(Some(2))));
        assert!(result.message.contains("broken filter"));
        assert!(!result.sandbox_dir.unwrap().exists());
    }

    #[tokio::test]
    async fn test_zero_exit_without_output_is_failure() {
        let (result, _dir) = run(&tool(), "echo did nothing", Duration::from_secs(5)).await;
        assert!(!result.ok);
        assert_eq!(result.reason, Some(FailureReason::MissingOutput));
        assert!(result.produced_paths.is_empty());
        assert!(!result.sandbox_dir.unwrap().exists());
    }

    #[tokio::test]
    async fn test_timeout_reported_and_cleaned_up() {
        let (result, _dir) = run(&tool(), "sleep 5", Duration::from_millis(200)).await;
        assert!(!result.ok);
        assert_eq!(result.reason, Some(FailureReason::Timeout));
        assert!(!result.sandbox_dir.unwrap().exists());
    }

    #[tokio::test]
    async fn test_screen_and_tool_rejection() {
        let (result, _dir) = run(&tool(), "echo forbidden", Duration::from_secs(5)).await;
        assert!(matches!(result.reason, Some(FailureReason::Rejected(_))));

        let t = ShTool {
            staging: Staging::Synthetic,
            reject_output: true,
        };
        let (result, _dir) = run(&t, "cp \"$1\" \"$2\"", Duration::from_secs(5)).await;
        assert_eq!(result.reason, Some(FailureReason::Rejected("bad output".to_string())));
        assert!(!result.sandbox_dir.unwrap().exists());
    }

    /// 替身生成挂起的 FFmpeg 工具：ffmpeg 指向一个只会 sleep 的脚本
    fn hanging_ffmpeg(dir: &Path) -> crate::tools::FfmpegTool {
        use std::os::unix::fs::PermissionsExt;

        let binary = dir.join("slow-ffmpeg");
        std::fs::write(&binary, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        let cfg = crate::config::FfmpegSection {
            ffmpeg: binary.to_string_lossy().to_string(),
            ..Default::default()
        };
        crate::tools::FfmpegTool::new(&cfg)
    }

    #[tokio::test]
    async fn test_hung_stand_in_generation_times_out() {
        let (dir, assets) = fixture();
        let tool = hanging_ffmpeg(dir.path());
        let validator = SandboxValidator::new(Some(dir.path().join("sandboxes")), 30)
            .with_timeout(Duration::from_millis(300));
        let req = ValidationRequest {
            script: "import ffmpeg",
            reference_assets: &assets,
            source_dir: dir.path(),
            output_name: "out.mp4",
        };

        let started = Instant::now();
        let result = validator.validate(&tool, &req, &CancellationToken::new()).await;
        assert_eq!(result.reason, Some(FailureReason::Timeout));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!result.sandbox_dir.unwrap().exists());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_stand_in_generation() {
        let (dir, assets) = fixture();
        let tool = hanging_ffmpeg(dir.path());
        let validator = SandboxValidator::new(Some(dir.path().join("sandboxes")), 30);
        let req = ValidationRequest {
            script: "import ffmpeg",
            reference_assets: &assets,
            source_dir: dir.path(),
            output_name: "out.mp4",
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = validator.validate(&tool, &req, &cancel).await;
        assert_eq!(result.reason, Some(FailureReason::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!result.sandbox_dir.unwrap().exists());
    }
}
