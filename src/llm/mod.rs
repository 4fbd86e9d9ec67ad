//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock），以及基于 LLM 的规划与代码生成

pub mod adapters;
pub mod mock;
pub mod openai;
pub mod traits;

pub use adapters::{LlmCodeGenerator, LlmPlanner};
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{LlmClient, Message, Role};
