//! 核心编排层：错误分类、执行报告、会话监管、编排器与构建器

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod report;
pub mod supervisor;

pub use builder::OrchestratorBuilder;
pub use error::{EditError, FailureKind, FailureReason};
pub use orchestrator::EditOrchestrator;
pub use report::{ExecutionReport, FailureReport, PhaseStatus, ReportCollector, ReportStatus, StepReport};
pub use supervisor::{EditGuard, EditSupervisor};
