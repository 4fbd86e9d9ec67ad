//! Planner：把编辑指令拆成有序任务列表
//!
//! 规划能力是外部协作者（prompt + 工具目录 + 资产清单 → 任务列表）；parse_plan 从文本中提取 JSON 并解析为 Plan。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::EditError;
use crate::media::Asset;
use crate::tools::ToolDescriptor;

/// 计划中的一个原子任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// 任务描述（JSON 中为 "task"）
    #[serde(rename = "task")]
    pub description: String,
    /// 指定的工具名
    pub tool: String,
    /// 可选生成参数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    /// 额外显式输入（资产清单中的名称），追加在隐式输入之后
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
}

impl Task {
    pub fn new(description: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            tool: tool.into(),
            params: None,
            inputs: Vec::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<String>) -> Self {
        self.inputs = inputs;
        self
    }
}

/// 一次编辑请求的有序任务列表
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub tasks: Vec<Task>,
}

impl Plan {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// 空计划或任务缺字段时返回 PlanningFailure
    pub fn check(&self) -> Result<(), EditError> {
        if self.tasks.is_empty() {
            return Err(EditError::PlanningFailure("planner returned an empty plan".to_string()));
        }
        for (i, task) in self.tasks.iter().enumerate() {
            if task.description.trim().is_empty() {
                return Err(EditError::PlanningFailure(format!("task {} has no description", i)));
            }
            if task.tool.trim().is_empty() {
                return Err(EditError::PlanningFailure(format!("task {} has no tool", i)));
            }
        }
        Ok(())
    }
}

/// 规划能力
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(
        &self,
        prompt: &str,
        catalog: &[ToolDescriptor],
        inventory: &[Asset],
    ) -> Result<Plan, String>;
}

/// 解析规划输出：支持 ```json 代码块、裸 JSON 对象 `{"tasks": [...]}` 或裸数组 `[...]`
pub fn parse_plan(output: &str) -> Result<Plan, EditError> {
    let trimmed = output.trim();

    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or(rest.trim())
    } else {
        let obj = trimmed.find('{');
        let arr = trimmed.find('[');
        match (obj, arr) {
            (Some(o), Some(a)) if a < o => slice_between(trimmed, a, ']'),
            (Some(o), _) => slice_between(trimmed, o, '}'),
            (None, Some(a)) => slice_between(trimmed, a, ']'),
            (None, None) => {
                return Err(EditError::PlanningFailure(format!(
                    "planner output contains no JSON: {}",
                    trimmed
                )))
            }
        }
    };

    let plan = if json_str.starts_with('[') {
        let tasks: Vec<Task> = serde_json::from_str(json_str)
            .map_err(|e| EditError::PlanningFailure(format!("{}: {}", e, json_str)))?;
        Plan::new(tasks)
    } else {
        serde_json::from_str::<Plan>(json_str)
            .map_err(|e| EditError::PlanningFailure(format!("{}: {}", e, json_str)))?
    };
    plan.check()?;
    Ok(plan)
}

fn slice_between(s: &str, start: usize, close: char) -> &str {
    match s.rfind(close) {
        Some(end) if end > start => &s[start..=end],
        _ => &s[start..],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fenced_plan() {
        let out = "Here is the plan:\n```json\n{\"tasks\": [\
            {\"task\": \"crop to square\", \"tool\": \"FFmpeg Processor\"},\
            {\"task\": \"convert to black and white\", \"tool\": \"FFmpeg Processor\", \"params\": {\"mode\": \"gray\"}}\
            ]}\n```";
        let plan = parse_plan(out).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.tasks[0].description, "crop to square");
        assert_eq!(plan.tasks[1].params, Some(serde_json::json!({"mode": "gray"})));
    }

    #[test]
    fn test_parse_bare_array() {
        let plan = parse_plan(r#"[{"task": "flip", "tool": "FFmpeg Processor", "inputs": ["logo.png"]}]"#)
            .unwrap();
        assert_eq!(plan.tasks[0].inputs, vec!["logo.png".to_string()]);
    }

    #[test]
    fn test_empty_plan_is_planning_failure() {
        let err = parse_plan(r#"{"tasks": []}"#).unwrap_err();
        assert!(matches!(err, EditError::PlanningFailure(_)));
    }

    #[test]
    fn test_malformed_plan_is_planning_failure() {
        assert!(matches!(
            parse_plan("I cannot help with that").unwrap_err(),
            EditError::PlanningFailure(_)
        ));
        assert!(matches!(
            parse_plan(r#"{"tasks": [{"task": "x"}]}"#).unwrap_err(),
            EditError::PlanningFailure(_)
        ));
        assert!(matches!(
            parse_plan(r#"{"tasks": [{"task": "", "tool": "t"}]}"#).unwrap_err(),
            EditError::PlanningFailure(_)
        ));
    }
}
