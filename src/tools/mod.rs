pub mod ffmpeg;
pub mod process;
pub mod registry;

pub use ffmpeg::{FfmpegTool, FFMPEG_TOOL_NAME};
pub use process::{list_files, run_script, ProcessOutput, RunError, RunLimits};
pub use registry::{catalog_json, MediaTool, ScriptRuntime, Staging, ToolDescriptor, ToolRegistry, ValidationCheck};
