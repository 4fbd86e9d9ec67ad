//! 子进程运行：超时、取消与输出捕获
//!
//! 沙箱验证与真实执行共用。子进程以 kill_on_drop 启动，超时或取消时 future 被丢弃即终止进程；
//! 每次运行输出一行结构化审计日志（JSON）。

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// 一次子进程运行的完整输出
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// None 表示被信号终止
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ProcessOutput {
    /// 合并 stdout/stderr 作为诊断文本
    pub fn diagnostic(&self) -> String {
        let mut s = String::new();
        if !self.stdout.trim().is_empty() {
            s.push_str("stdout:\n");
            s.push_str(self.stdout.trim_end());
        }
        if !self.stderr.trim().is_empty() {
            if !s.is_empty() {
                s.push('\n');
            }
            s.push_str("stderr:\n");
            s.push_str(self.stderr.trim_end());
        }
        if s.is_empty() {
            s.push_str("(no output)");
        }
        s
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    /// 进程正常结束但结果不可用（非零退出等）
    #[error("{0}")]
    Failed(String),
}

/// 子进程运行的边界：超时与取消令牌
#[derive(Debug, Clone, Copy)]
pub struct RunLimits<'a> {
    pub timeout: Duration,
    pub cancel: &'a CancellationToken,
}

impl<'a> RunLimits<'a> {
    pub fn new(timeout: Duration, cancel: &'a CancellationToken) -> Self {
        Self { timeout, cancel }
    }
}

/// 运行 `program args...`，工作目录为 cwd；超时与取消都会终止子进程
pub async fn run_script<S: AsRef<OsStr>>(
    phase: &str,
    program: &str,
    args: &[S],
    cwd: &Path,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ProcessOutput, RunError> {
    let start = Instant::now();
    let child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| RunError::Spawn(format!("{}: {}", program, e)))?;

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RunError::Cancelled),
        waited = tokio::time::timeout(timeout, child.wait_with_output()) => match waited {
            Err(_) => Err(RunError::Timeout(timeout)),
            Ok(Err(e)) => Err(RunError::Spawn(format!("wait failed: {}", e))),
            Ok(Ok(output)) => Ok(ProcessOutput {
                exit_code: output.status.code(),
                success: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                duration: start.elapsed(),
            }),
        },
    };

    let (ok, outcome, exit_code) = match &result {
        Ok(out) if out.success => (true, "ok", out.exit_code),
        Ok(out) => (false, "error", out.exit_code),
        Err(RunError::Timeout(_)) => (false, "timeout", None),
        Err(RunError::Cancelled) => (false, "cancelled", None),
        Err(RunError::Spawn(_)) => (false, "spawn_failed", None),
        Err(RunError::Failed(_)) => (false, "error", None),
    };
    let audit = serde_json::json!({
        "event": "script_audit",
        "phase": phase,
        "program": program,
        "ok": ok,
        "outcome": outcome,
        "exit_code": exit_code,
        "duration_ms": start.elapsed().as_millis() as u64,
    });
    tracing::info!(audit = %audit.to_string(), "script");

    result
}

/// 列出目录下（一层）的所有文件
pub async fn list_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}
