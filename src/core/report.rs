//! 执行报告：整体状态、各阶段状态与耗时、步骤记录、新建资产、最终产物与失败诊断
//!
//! ReportCollector 在请求执行过程中累积数据，finish() 产出不可变的 ExecutionReport；
//! 无论成功失败都会写入 `reports/<request_id>.json`。

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::{EditError, FailureKind};
use crate::media::Asset;
use crate::pipeline::{AttemptRecord, Plan, StepResult, Task};

/// Duration 以毫秒整数序列化
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Success,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    NotStarted,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Planning,
    Generation,
    Validation,
    Execution,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub status: PhaseStatus,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
    pub errors: Vec<String>,
}

impl Default for PhaseReport {
    fn default() -> Self {
        Self {
            status: PhaseStatus::NotStarted,
            duration: Duration::ZERO,
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Phases {
    pub planning: PhaseReport,
    pub generation: PhaseReport,
    pub validation: PhaseReport,
    pub execution: PhaseReport,
}

/// 单个步骤的记录
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub task: Task,
    /// 所有生成尝试（含成功的那次）
    pub attempts: Vec<AttemptRecord>,
    /// 已接受脚本的保存位置（相对会话目录）
    pub script: Option<PathBuf>,
    pub execution: Option<StepResult>,
    /// 产出资产名称
    pub output: Option<String>,
}

/// 失败诊断：失败的步骤、最后一条验证器消息与完整尝试记录
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub kind: FailureKind,
    pub message: String,
    pub step: Option<usize>,
    pub last_validator_message: Option<String>,
    pub transcript: Vec<AttemptRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub request_id: String,
    pub session_id: String,
    pub prompt: String,
    pub status: ReportStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(rename = "total_duration_ms", with = "duration_ms")]
    pub total_duration: Duration,
    pub phases: Phases,
    pub plan: Option<Plan>,
    pub steps: Vec<StepReport>,
    pub assets_created: Vec<Asset>,
    pub final_output: Option<String>,
    pub history_index: Option<usize>,
    pub failure: Option<FailureReport>,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.status == ReportStatus::Success
    }
}

pub struct ReportCollector {
    report: ExecutionReport,
    start: Instant,
}

impl ReportCollector {
    pub fn new(request_id: &str, session_id: &str, prompt: &str) -> Self {
        let now = Utc::now();
        Self {
            report: ExecutionReport {
                request_id: request_id.to_string(),
                session_id: session_id.to_string(),
                prompt: prompt.to_string(),
                status: ReportStatus::Failed,
                started_at: now,
                finished_at: now,
                total_duration: Duration::ZERO,
                phases: Phases::default(),
                plan: None,
                steps: Vec::new(),
                assets_created: Vec::new(),
                final_output: None,
                history_index: None,
                failure: None,
            },
            start: Instant::now(),
        }
    }

    fn phase_mut(&mut self, phase: Phase) -> &mut PhaseReport {
        match phase {
            Phase::Planning => &mut self.report.phases.planning,
            Phase::Generation => &mut self.report.phases.generation,
            Phase::Validation => &mut self.report.phases.validation,
            Phase::Execution => &mut self.report.phases.execution,
        }
    }

    /// 累加阶段耗时；未失败的阶段标记为完成
    pub fn record(&mut self, phase: Phase, elapsed: Duration) {
        let p = self.phase_mut(phase);
        p.duration += elapsed;
        if p.status == PhaseStatus::NotStarted {
            p.status = PhaseStatus::Completed;
        }
    }

    pub fn fail_phase(&mut self, phase: Phase, error: impl Into<String>) {
        let p = self.phase_mut(phase);
        p.status = PhaseStatus::Failed;
        p.errors.push(error.into());
    }

    pub fn set_plan(&mut self, plan: &Plan) {
        self.report.plan = Some(plan.clone());
    }

    pub fn push_step(&mut self, step: StepReport) {
        self.report.steps.push(step);
    }

    pub fn last_step_mut(&mut self) -> Option<&mut StepReport> {
        self.report.steps.last_mut()
    }

    pub fn step_mut(&mut self, index: usize) -> Option<&mut StepReport> {
        self.report.steps.iter_mut().find(|s| s.index == index)
    }

    pub fn add_asset(&mut self, asset: Asset) {
        self.report.assets_created.push(asset);
    }

    /// 请求失败：按错误种类标记阶段并附上完整尝试记录
    pub fn fail(&mut self, err: &EditError, step: Option<usize>) {
        let message = err.to_string();
        let (transcript, last_validator_message) = match err {
            EditError::GenerationFailure(f) => (
                f.attempts.clone(),
                f.attempts
                    .iter()
                    .rev()
                    .find(|a| a.script.is_some())
                    .map(|a| a.message.clone()),
            ),
            _ => {
                let transcript: Vec<AttemptRecord> = self
                    .report
                    .steps
                    .iter()
                    .flat_map(|s| s.attempts.iter().cloned())
                    .collect();
                let last = transcript
                    .iter()
                    .rev()
                    .find(|a| a.script.is_some())
                    .map(|a| a.message.clone());
                (transcript, last)
            }
        };

        match err {
            EditError::PlanningFailure(_) => self.fail_phase(Phase::Planning, message.clone()),
            EditError::UnknownTool(_) => self.fail_phase(Phase::Planning, message.clone()),
            EditError::GenerationFailure(f) => {
                self.record(Phase::Generation, f.generation);
                self.record(Phase::Validation, f.validation);
                self.fail_phase(Phase::Validation, message.clone());
            }
            EditError::ValidationTimeout(_) => self.fail_phase(Phase::Validation, message.clone()),
            EditError::ExecutionFailure { .. } => self.fail_phase(Phase::Execution, message.clone()),
            _ => {}
        }

        self.report.status = match err {
            EditError::Cancelled => ReportStatus::Cancelled,
            _ => ReportStatus::Failed,
        };
        self.report.failure = Some(FailureReport {
            kind: err.kind(),
            message,
            step,
            last_validator_message,
            transcript,
        });
    }

    pub fn succeed(&mut self, final_output: &str, history_index: usize) {
        self.report.status = ReportStatus::Success;
        self.report.final_output = Some(final_output.to_string());
        self.report.history_index = Some(history_index);
    }

    pub fn request_id(&self) -> &str {
        &self.report.request_id
    }

    pub fn finish(mut self) -> ExecutionReport {
        self.report.finished_at = Utc::now();
        self.report.total_duration = self.start.elapsed();
        self.report
    }
}
