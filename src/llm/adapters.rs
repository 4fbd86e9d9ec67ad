//! 以 LLM 实现的规划能力与代码生成能力

use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message};
use crate::media::Asset;
use crate::pipeline::{clean_script, parse_plan, CodeGenerator, GenerationRequest, Plan, Planner};
use crate::tools::{catalog_json, ToolDescriptor};

const PLANNER_SYSTEM: &str = r#"You are the planner of a media editing system.
Split the user's edit request into an ordered list of atomic tasks. Each task is performed by exactly one tool
and consumes the output of the previous task. Use only tools from the catalog.

Respond with JSON only:
{"tasks": [{"task": "<what to do>", "tool": "<tool name>"}]}
If the request cannot be fulfilled with the available tools, respond with {"tasks": []}."#;

/// LLM 规划器
pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn build_messages(prompt: &str, catalog: &[ToolDescriptor], inventory: &[Asset]) -> Vec<Message> {
        let mut context = format!("## Tools\n{}\n\n## Assets\n", catalog_json(catalog));
        if inventory.is_empty() {
            context.push_str("(none)\n");
        }
        for asset in inventory {
            context.push_str(&format!("- {} ({})\n", asset.name, asset.metadata.summary()));
        }
        vec![
            Message::system(PLANNER_SYSTEM),
            Message::user(format!("{}\n## Request\n{}", context, prompt)),
        ]
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(
        &self,
        prompt: &str,
        catalog: &[ToolDescriptor],
        inventory: &[Asset],
    ) -> Result<Plan, String> {
        let messages = Self::build_messages(prompt, catalog, inventory);
        let output = self.llm.complete(&messages).await?;
        parse_plan(&output).map_err(|e| e.to_string())
    }
}

/// LLM 代码生成器：工具指令作为 system，生成请求上下文作为 user
pub struct LlmCodeGenerator {
    llm: Arc<dyn LlmClient>,
}

impl LlmCodeGenerator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl CodeGenerator for LlmCodeGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, String> {
        let messages = vec![
            Message::system(request.tool_instructions.clone()),
            Message::user(request.to_prompt_section()),
        ];
        let raw = self.llm.complete(&messages).await?;
        Ok(clean_script(&raw))
    }
}
