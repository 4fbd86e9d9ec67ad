//! 工具注册表
//!
//! 所有媒体工具实现 MediaTool trait（描述 / 生成指令 / 沙箱准备 / 校验例程），由 ToolRegistry 按名注册与查找。
//! 注册表在进程启动时填充，之后只读，可放入 Arc 在多个会话间并发读取。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::core::EditError;
use crate::media::Asset;
use crate::pipeline::Task;
use crate::tools::{RunError, RunLimits};

/// 参考资产在沙箱中的准备方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staging {
    /// 逐字节复制真实资产
    Copy,
    /// 由工具生成保留关键属性（分辨率、时长、声道）的替身
    Synthetic,
}

/// 生成脚本的运行方式：`<interpreter> <script> <input...> <output>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRuntime {
    pub interpreter: String,
    /// 脚本文件扩展名（不含点）
    pub extension: String,
}

impl ScriptRuntime {
    pub fn new(interpreter: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            extension: extension.into(),
        }
    }

    /// 组装参数列表（均为绝对路径）
    pub fn args(&self, script: &Path, inputs: &[PathBuf], output: &Path) -> Vec<PathBuf> {
        let mut args = Vec::with_capacity(inputs.len() + 2);
        args.push(script.to_path_buf());
        args.extend(inputs.iter().cloned());
        args.push(output.to_path_buf());
        args
    }
}

/// 工具校验例程的输入：一次沙箱运行后的全部现场
#[derive(Debug)]
pub struct ValidationCheck<'a> {
    pub script: &'a str,
    pub sandbox_dir: &'a Path,
    /// 真实参考资产（只读，不在沙箱内）
    pub reference_assets: &'a [Asset],
    /// 沙箱内准备好的输入（与 reference_assets 一一对应）
    pub staged_inputs: &'a [PathBuf],
    /// 运行后新出现的文件
    pub produced: &'a [PathBuf],
    pub expected_output: &'a Path,
}

/// 媒体工具 trait：名称、描述（供规划能力理解）、生成指令、沙箱准备与校验
#[async_trait]
pub trait MediaTool: Send + Sync {
    /// 工具名称（计划中 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供规划能力选择工具）
    fn description(&self) -> &str;

    /// 运行前提（外部程序等）
    fn prerequisites(&self) -> Vec<String> {
        Vec::new()
    }

    /// 交给代码生成能力的指令文本
    fn instructions(&self) -> &str;

    fn runtime(&self) -> ScriptRuntime;

    /// 产物扩展名；默认沿用第一个输入的扩展名
    fn output_extension(&self, _task: &Task, inputs: &[Asset]) -> String {
        inputs
            .first()
            .and_then(|a| a.extension())
            .unwrap_or("mp4")
            .to_string()
    }

    /// 决定参考资产以复制还是替身的方式进入沙箱
    fn staging(&self, _reference: &Asset) -> Staging {
        Staging::Copy
    }

    /// 生成替身文件；默认写一个空文件。需要子进程时必须遵守 limits
    async fn synthesize(&self, _reference: &Asset, dest: &Path, _limits: RunLimits<'_>) -> Result<(), RunError> {
        tokio::fs::write(dest, b"")
            .await
            .map_err(|e| RunError::Failed(format!("cannot create stand-in {}: {}", dest.display(), e)))
    }

    /// 运行前的静态检查，返回 Err 即拒绝脚本
    fn screen(&self, _script: &str) -> Result<(), String> {
        Ok(())
    }

    /// 运行后的校验例程：检查产物是否合理
    async fn validate(&self, _check: &ValidationCheck<'_>) -> Result<(), String> {
        Ok(())
    }
}

/// 工具描述（列表 / 提交给规划能力）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub prerequisites: Vec<String>,
    pub instructions: String,
}

/// 工具注册表：按名称存储 Arc<dyn MediaTool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn MediaTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；同名已存在时返回 DuplicateTool
    pub fn register(&mut self, tool: impl MediaTool + 'static) -> Result<(), EditError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn MediaTool>) -> Result<(), EditError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(EditError::DuplicateTool(name));
        }
        tracing::debug!(tool = %name, "tool registered");
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn MediaTool>, EditError> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| EditError::UnknownTool(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 所有工具描述，按名称排序
    pub fn list(&self) -> Vec<ToolDescriptor> {
        let mut list: Vec<ToolDescriptor> = self
            .tools
            .values()
            .map(|tool| ToolDescriptor {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                prerequisites: tool.prerequisites(),
                instructions: tool.instructions().to_string(),
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }
}

/// 供提示词使用的工具目录 JSON（仅名称与描述）
pub fn catalog_json(catalog: &[ToolDescriptor]) -> String {
    let tools: Vec<serde_json::Value> = catalog
        .iter()
        .map(|d| serde_json::json!({"name": d.name, "description": d.description}))
        .collect();
    serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
}
