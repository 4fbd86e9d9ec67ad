//! 编辑请求错误类型与单次尝试的失败原因
//!
//! EditError 是对调用方暴露的分类；FailureReason 记录在每条尝试记录里，供自我修正与报告使用。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::GenerationFailure;

/// 编辑请求可能出现的错误（规划、工具解析、生成、执行、历史导航等）
#[derive(Error, Debug, Clone)]
pub enum EditError {
    /// 规划能力未给出可用的计划（空计划或格式错误）
    #[error("Planning failed: {0}")]
    PlanningFailure(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Duplicate tool: {0}")]
    DuplicateTool(String),

    /// 自我修正预算耗尽，携带完整尝试记录
    #[error("Script generation failed after {} attempt(s)", .0.attempts.len())]
    GenerationFailure(GenerationFailure),

    #[error("Validation timed out after {0:?}")]
    ValidationTimeout(Duration),

    /// 已通过验证的脚本在真实资产上失败（不自动重试）
    #[error("Execution failed at step {step}: {message}")]
    ExecutionFailure { step: usize, message: String },

    #[error("History entry not found: {0}")]
    HistoryNotFound(usize),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// 同一会话已有进行中的编辑请求
    #[error("Session busy: {0}")]
    SessionBusy(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl EditError {
    pub fn kind(&self) -> FailureKind {
        match self {
            EditError::PlanningFailure(_) => FailureKind::PlanningFailure,
            EditError::UnknownTool(_) => FailureKind::UnknownTool,
            EditError::DuplicateTool(_) => FailureKind::DuplicateTool,
            EditError::GenerationFailure(_) => FailureKind::GenerationFailure,
            EditError::ValidationTimeout(_) => FailureKind::ValidationTimeout,
            EditError::ExecutionFailure { .. } => FailureKind::ExecutionFailure,
            EditError::HistoryNotFound(_) => FailureKind::HistoryNotFound,
            EditError::SessionNotFound(_) => FailureKind::SessionNotFound,
            EditError::SessionBusy(_) => FailureKind::SessionBusy,
            EditError::Cancelled => FailureKind::Cancelled,
            EditError::Io(_) => FailureKind::Io,
            EditError::Persistence(_) => FailureKind::Persistence,
        }
    }
}

impl From<std::io::Error> for EditError {
    fn from(e: std::io::Error) -> Self {
        EditError::Io(e.to_string())
    }
}

/// 错误种类（报告中序列化用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PlanningFailure,
    UnknownTool,
    DuplicateTool,
    GenerationFailure,
    ValidationTimeout,
    ExecutionFailure,
    HistoryNotFound,
    SessionNotFound,
    SessionBusy,
    Cancelled,
    Io,
    Persistence,
}

/// 单次验证或执行失败的原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "detail")]
pub enum FailureReason {
    /// 超过墙钟超时
    Timeout,
    /// 进程非零退出（None 表示被信号终止）
    NonZeroExit(Option<i32>),
    /// 进程成功退出但没有产出预期文件
    MissingOutput,
    /// 工具的校验例程拒绝了脚本或产物
    Rejected(String),
    /// 生成能力本身出错，没有得到脚本
    Generation(String),
    /// 进程无法启动或沙箱无法准备
    Environment(String),
    Cancelled,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "Timeout"),
            FailureReason::NonZeroExit(Some(code)) => write!(f, "NonZeroExit({code})"),
            FailureReason::NonZeroExit(None) => write!(f, "NonZeroExit(signal)"),
            FailureReason::MissingOutput => write!(f, "MissingOutput"),
            FailureReason::Rejected(why) => write!(f, "Rejected({why})"),
            FailureReason::Generation(why) => write!(f, "Generation({why})"),
            FailureReason::Environment(why) => write!(f, "Environment({why})"),
            FailureReason::Cancelled => write!(f, "Cancelled"),
        }
    }
}
