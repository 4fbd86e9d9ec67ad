//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按顺序返回预设回复，最后一条重复使用；记录收到的每组消息。

use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message};

#[derive(Debug, Default)]
pub struct MockLlmClient {
    replies: Vec<String>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl MockLlmClient {
    pub fn new(replies: Vec<impl Into<String>>) -> Self {
        Self {
            replies: replies.into_iter().map(Into::into).collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// 已收到的调用（每次一组消息）
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let n = {
            let mut calls = self.calls.lock().map_err(|e| e.to_string())?;
            calls.push(messages.to_vec());
            calls.len()
        };
        if self.replies.is_empty() {
            return Err("mock has no replies".to_string());
        }
        let i = (n - 1).min(self.replies.len() - 1);
        Ok(self.replies[i].clone())
    }
}
