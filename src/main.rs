//! splice 命令行
//!
//! 入口：加载配置、初始化日志、构建编排器并执行子命令。edit 期间 Ctrl+C 会取消当前请求并等待清理完成。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use splice::config::load_config;
use splice::core::OrchestratorBuilder;
use splice::{observability, ExecutionReport};

#[derive(Debug, Parser)]
#[command(name = "splice")]
#[command(about = "Natural-language media editing with validated, reversible steps", long_about = None)]
struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a session, optionally importing a source media file
    New { source: Option<PathBuf> },
    /// Import an additional asset into a session
    Import { session: String, path: PathBuf },
    /// Run an edit request against the session's current state
    Edit {
        session: String,
        prompt: Vec<String>,
        /// Print the full execution report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the history tree
    History {
        session: String,
        #[arg(long)]
        json: bool,
    },
    /// Move the current pointer to a history entry
    Checkout { session: String, index: usize },
    /// Move the current pointer to its parent
    Undo { session: String },
    /// Move the current pointer to its most recent child
    Redo { session: String },
    /// List sessions on disk
    Sessions,
    /// List registered tools
    Tools,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let cli = Cli::parse();

    let config = load_config(cli.config.clone()).context("Failed to load config")?;
    let orchestrator = Arc::new(
        OrchestratorBuilder::new(config)
            .build()
            .context("Failed to build orchestrator")?,
    );

    match cli.command {
        Commands::New { source } => {
            let id = orchestrator.create_session(source.as_deref()).await?;
            println!("{}", id);
        }
        Commands::Import { session, path } => {
            let asset = orchestrator.import_asset(&session, &path).await?;
            println!("{} ({})", asset.name, asset.metadata.summary());
        }
        Commands::Edit {
            session,
            prompt,
            json,
        } => {
            let prompt = prompt.join(" ");
            if prompt.trim().is_empty() {
                anyhow::bail!("empty prompt");
            }
            let mut edit = {
                let orchestrator = orchestrator.clone();
                let session = session.clone();
                tokio::spawn(async move { orchestrator.submit_edit(&session, &prompt).await })
            };
            let report = tokio::select! {
                joined = &mut edit => joined.context("edit task panicked")??,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!(session = %session, "interrupt received, cancelling");
                    orchestrator.cancel(&session).await;
                    edit.await.context("edit task panicked")??
                }
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            if !report.is_success() {
                std::process::exit(1);
            }
        }
        Commands::History { session, json } => {
            if json {
                let tree = orchestrator.get_history(&session).await?;
                println!("{}", serde_json::to_string_pretty(&tree)?);
            } else {
                print!("{}", orchestrator.render_history(&session).await?);
            }
        }
        Commands::Checkout { session, index } => {
            orchestrator.set_current(&session, index).await?;
            println!("current -> {}", index);
        }
        Commands::Undo { session } => {
            let index = orchestrator.undo(&session).await?;
            println!("current -> {}", index);
        }
        Commands::Redo { session } => {
            let index = orchestrator.redo(&session).await?;
            println!("current -> {}", index);
        }
        Commands::Sessions => {
            for id in orchestrator.list_sessions().await? {
                println!("{}", id);
            }
        }
        Commands::Tools => {
            for tool in orchestrator.list_tools() {
                println!("{}\n  {}", tool.name, tool.description);
                if !tool.prerequisites.is_empty() {
                    println!("  requires: {}", tool.prerequisites.join(", "));
                }
            }
        }
    }
    Ok(())
}

fn print_report(report: &ExecutionReport) {
    println!("request {} -> {:?}", report.request_id, report.status);
    for step in &report.steps {
        println!(
            "  step {} [{}] {} attempt(s){}",
            step.index + 1,
            step.task.tool,
            step.attempts.len(),
            step.output
                .as_deref()
                .map(|o| format!(" -> {}", o))
                .unwrap_or_default()
        );
    }
    if let Some(output) = &report.final_output {
        println!("output: {} (history entry {})", output, report.history_index.unwrap_or_default());
    }
    if let Some(failure) = &report.failure {
        println!("failed: {}", failure.message);
        if let Some(msg) = &failure.last_validator_message {
            println!("last validator message:\n{}", msg);
        }
    }
}
