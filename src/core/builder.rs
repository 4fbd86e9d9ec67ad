//! 编排器构建器：按配置组装工具注册表、规划/生成能力、沙箱与执行器
//!
//! 未显式注入的协作者用配置中的默认实现（FFmpeg 工具、OpenAI 兼容 LLM、ffprobe）。

use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::{EditError, EditOrchestrator};
use crate::llm::{LlmClient, LlmCodeGenerator, LlmPlanner, OpenAiClient};
use crate::media::{FfprobeProbe, MediaProbe};
use crate::pipeline::{CodeGenerator, Planner, SandboxValidator, ScriptGenerator, StepExecutor};
use crate::session::SessionStore;
use crate::tools::{FfmpegTool, ToolRegistry};

pub struct OrchestratorBuilder {
    config: AppConfig,
    registry: Option<ToolRegistry>,
    planner: Option<Arc<dyn Planner>>,
    generator: Option<Arc<dyn CodeGenerator>>,
    probe: Option<Arc<dyn MediaProbe>>,
    sandbox_timeout: Option<Duration>,
    execution_timeout: Option<Duration>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            registry: None,
            planner: None,
            generator: None,
            probe: None,
            sandbox_timeout: None,
            execution_timeout: None,
        }
    }

    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn CodeGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn MediaProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// 覆盖配置中的秒级超时（测试用更短的时长）
    pub fn with_timeouts(mut self, sandbox: Duration, execution: Duration) -> Self {
        self.sandbox_timeout = Some(sandbox);
        self.execution_timeout = Some(execution);
        self
    }

    /// 默认工具注册表：FFmpeg 工具
    pub fn default_registry(&self, probe: Arc<dyn MediaProbe>) -> Result<ToolRegistry, EditError> {
        let mut registry = ToolRegistry::new();
        registry.register(FfmpegTool::new(&self.config.tools.ffmpeg).with_probe(probe))?;
        Ok(registry)
    }

    fn llm_for(&self, model: Option<&String>) -> Arc<dyn LlmClient> {
        let llm = &self.config.llm;
        let model = model.unwrap_or(&llm.model);
        Arc::new(OpenAiClient::from_config(llm, model))
    }

    pub fn build(self) -> Result<EditOrchestrator, EditError> {
        let probe: Arc<dyn MediaProbe> = match &self.probe {
            Some(probe) => probe.clone(),
            None => Arc::new(FfprobeProbe::from_config(&self.config.tools.ffmpeg)),
        };
        let planner: Arc<dyn Planner> = match &self.planner {
            Some(planner) => planner.clone(),
            None => Arc::new(LlmPlanner::new(self.llm_for(self.config.llm.planner_model.as_ref()))),
        };
        let generator: Arc<dyn CodeGenerator> = match &self.generator {
            Some(generator) => generator.clone(),
            None => Arc::new(LlmCodeGenerator::new(
                self.llm_for(self.config.llm.generator_model.as_ref()),
            )),
        };

        let mut sandbox = SandboxValidator::new(
            self.config.app.sandbox_root.clone(),
            self.config.sandbox.timeout_secs,
        );
        if let Some(timeout) = self.sandbox_timeout {
            sandbox = sandbox.with_timeout(timeout);
        }
        let mut executor = StepExecutor::new(self.config.execution.timeout_secs);
        if let Some(timeout) = self.execution_timeout {
            executor = executor.with_timeout(timeout);
        }

        let registry = match self.registry {
            Some(registry) => registry,
            None => self.default_registry(probe.clone())?,
        };
        tracing::info!(
            tools = registry.len(),
            sessions_root = %self.config.app.sessions_root.display(),
            max_attempts = self.config.generation.max_attempts,
            "orchestrator ready"
        );

        Ok(EditOrchestrator::new(
            Arc::new(registry),
            planner,
            ScriptGenerator::new(generator, sandbox),
            executor,
            probe,
            SessionStore::new(self.config.app.sessions_root.clone()),
            self.config.generation.max_attempts as usize,
        ))
    }
}
