//! Splice - 自然语言驱动的媒体编辑编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、执行报告、会话监管、编排器
//! - **llm**: LLM 客户端与基于 LLM 的规划 / 代码生成
//! - **media**: 资产、元数据与 ffprobe 探测
//! - **observability**: 日志
//! - **pipeline**: 规划、脚本生成循环、沙箱验证、步骤执行
//! - **session**: 会话目录、资产清单与历史树
//! - **tools**: 媒体工具 trait、注册表与 FFmpeg 工具

pub mod config;
pub mod core;
pub mod llm;
pub mod media;
pub mod observability;
pub mod pipeline;
pub mod session;
pub mod tools;

pub use crate::core::{EditError, EditOrchestrator, ExecutionReport, OrchestratorBuilder};
