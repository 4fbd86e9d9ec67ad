//! 编辑流水线：规划 → 生成并在沙箱验证 → 真实执行

pub mod executor;
pub mod generation;
pub mod planner;
pub mod sandbox;

pub use executor::{Execution, StepExecutor, StepResult, StepStatus};
pub use generation::{
    clean_script, AttemptRecord, CodeGenerator, GeneratedScript, GenerationFailure,
    GenerationRequest, InputContext, ScriptGenerator, StepContext,
};
pub use planner::{parse_plan, Plan, Planner, Task};
pub use sandbox::{SandboxValidator, ValidationRequest, ValidationResult};
