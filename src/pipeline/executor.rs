//! 步骤执行器：在真实资产上运行已通过验证的脚本
//!
//! 不重试；失败时原样返回捕获的输出。不修改历史。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::core::FailureReason;
use crate::tools::{list_files, run_script, MediaTool, RunError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failure,
}

/// 一个任务的执行结果
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub status: StepStatus,
    pub reason: Option<FailureReason>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// 运行后工作目录中新出现的文件
    pub produced: Vec<PathBuf>,
    #[serde(with = "crate::core::report::duration_ms")]
    pub duration: Duration,
}

impl StepResult {
    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }

    fn failed(reason: FailureReason, stderr: String, duration: Duration) -> Self {
        Self {
            status: StepStatus::Failure,
            reason: Some(reason),
            exit_code: None,
            stdout: String::new(),
            stderr,
            produced: Vec::new(),
            duration,
        }
    }

    /// 失败时的诊断文本
    pub fn diagnostic(&self) -> String {
        let reason = self.reason.as_ref().map(|r| r.to_string()).unwrap_or_default();
        let mut s = format!("[{}]", reason);
        if !self.stdout.trim().is_empty() {
            s.push_str(&format!("\nstdout:\n{}", self.stdout.trim_end()));
        }
        if !self.stderr.trim().is_empty() {
            s.push_str(&format!("\nstderr:\n{}", self.stderr.trim_end()));
        }
        s
    }
}

/// 一次真实执行的输入
#[derive(Debug)]
pub struct Execution<'a> {
    pub script: &'a str,
    pub working_dir: &'a Path,
    /// 真实输入的绝对路径，按参数顺序
    pub inputs: &'a [PathBuf],
    pub output: &'a Path,
}

#[derive(Debug, Clone)]
pub struct StepExecutor {
    timeout: Duration,
}

impl StepExecutor {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 把脚本写入工作目录并运行；期望产物缺失同样视为失败
    pub async fn execute(
        &self,
        tool: &dyn MediaTool,
        exec: &Execution<'_>,
        cancel: &CancellationToken,
    ) -> StepResult {
        let start = Instant::now();
        let runtime = tool.runtime();
        let script_path = exec.working_dir.join(format!("step-{}.{}", uuid::Uuid::new_v4(), runtime.extension));
        if let Err(e) = tokio::fs::write(&script_path, exec.script).await {
            return StepResult::failed(
                FailureReason::Environment("script".to_string()),
                format!("cannot write script: {}", e),
                start.elapsed(),
            );
        }

        let before: HashSet<PathBuf> = list_files(exec.working_dir)
            .await
            .unwrap_or_default()
            .into_iter()
            .collect();
        let args = runtime.args(&script_path, exec.inputs, exec.output);
        let run = run_script(
            "execution",
            &runtime.interpreter,
            &args,
            exec.working_dir,
            self.timeout,
            cancel,
        )
        .await;
        // 脚本文件不算产物
        let _ = tokio::fs::remove_file(&script_path).await;

        let output = match run {
            Ok(output) => output,
            Err(RunError::Timeout(after)) => {
                return StepResult::failed(
                    FailureReason::Timeout,
                    format!("timed out after {:?}", after),
                    start.elapsed(),
                )
            }
            Err(RunError::Cancelled) => {
                return StepResult::failed(FailureReason::Cancelled, String::new(), start.elapsed())
            }
            Err(RunError::Spawn(why)) | Err(RunError::Failed(why)) => {
                return StepResult::failed(FailureReason::Environment(why.clone()), why, start.elapsed())
            }
        };

        let produced: Vec<PathBuf> = list_files(exec.working_dir)
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|p| !before.contains(p) && p != &script_path)
            .collect();

        let reason = if !output.success {
            Some(FailureReason::NonZeroExit(output.exit_code))
        } else if !exec.output.is_file() {
            Some(FailureReason::MissingOutput)
        } else {
            None
        };
        if let Some(reason) = &reason {
            tracing::warn!(tool = tool.name(), reason = %reason, "step execution failed");
        }

        StepResult {
            status: if reason.is_none() {
                StepStatus::Success
            } else {
                StepStatus::Failure
            },
            reason,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            produced,
            duration: start.elapsed(),
        }
    }
}
