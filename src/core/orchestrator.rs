//! 编排器：驱动一次编辑请求从规划到提交
//!
//! 状态：Planning → ExecutingStep(i) → { ExecutingStep(i+1) | Committing | Aborted }
//!
//! - 规划失败或任何任务引用未注册工具时，请求在触碰任何资产之前中止
//! - 每步先在沙箱中生成并验证脚本，再在真实资产上执行；上一步产物是下一步的隐式输入
//! - 只有整个计划成功才提交一个历史条目；中间产物放在请求独占的工作目录里，任何结束路径都会删除
//! - 每个请求（成功或失败）都写一份执行报告到 `reports/<request_id>.json`

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::core::report::{ExecutionReport, Phase, ReportCollector, StepReport};
use crate::core::{EditError, EditSupervisor, FailureReason};
use crate::media::{Asset, MediaProbe};
use crate::pipeline::{
    Execution, GenerationFailure, Plan, Planner, ScriptGenerator, StepContext, StepExecutor, Task,
};
use crate::session::store::probe_or_size;
use crate::session::{write_json_atomic, HistoryNode, NewEntry, Session, SessionStore};
use crate::tools::{MediaTool, ToolDescriptor, ToolRegistry};

/// 编排器的全部协作者
pub struct EditOrchestrator {
    registry: Arc<ToolRegistry>,
    planner: Arc<dyn Planner>,
    generator: ScriptGenerator,
    executor: StepExecutor,
    probe: Arc<dyn MediaProbe>,
    store: SessionStore,
    supervisor: EditSupervisor,
    max_attempts: usize,
}

/// 步骤执行中的失败：错误与失败步骤下标
type Abort = (EditError, Option<usize>);

/// 一个已完成步骤的产物
struct StepOutput {
    asset: Asset,
    script: String,
    extension: String,
}

impl EditOrchestrator {
    pub fn new(
        registry: Arc<ToolRegistry>,
        planner: Arc<dyn Planner>,
        generator: ScriptGenerator,
        executor: StepExecutor,
        probe: Arc<dyn MediaProbe>,
        store: SessionStore,
        max_attempts: usize,
    ) -> Self {
        Self {
            registry,
            planner,
            generator,
            executor,
            probe,
            store,
            supervisor: EditSupervisor::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.registry.list()
    }

    pub async fn list_sessions(&self) -> Result<Vec<String>, EditError> {
        self.store.list().await
    }

    /// 新建会话，可选导入源媒体作为根状态；返回会话 id
    pub async fn create_session(&self, source: Option<&Path>) -> Result<String, EditError> {
        let session = self.store.create(source, self.probe.as_ref()).await?;
        let id = session.lock().await.id.clone();
        Ok(id)
    }

    /// 向会话导入额外资产（不改变历史）
    pub async fn import_asset(&self, session_id: &str, source: &Path) -> Result<Asset, EditError> {
        let session = self.store.open(session_id).await?;
        let mut session = session.lock().await;
        let asset = session.import_file(source, self.probe.as_ref()).await?;
        session.save().await?;
        Ok(asset)
    }

    pub async fn inventory(&self, session_id: &str) -> Result<Vec<Asset>, EditError> {
        let session = self.store.open(session_id).await?;
        let session = session.lock().await;
        Ok(session.inventory.clone())
    }

    /// 历史树（只读视图）
    pub async fn get_history(&self, session_id: &str) -> Result<HistoryNode, EditError> {
        let session = self.store.open(session_id).await?;
        let session = session.lock().await;
        Ok(session.history.tree())
    }

    /// 缩进文本形式的历史树
    pub async fn render_history(&self, session_id: &str) -> Result<String, EditError> {
        let session = self.store.open(session_id).await?;
        let session = session.lock().await;
        Ok(session.history.render())
    }

    /// 当前指针对应的资产
    pub async fn current_asset(&self, session_id: &str) -> Result<Option<Asset>, EditError> {
        let session = self.store.open(session_id).await?;
        let session = session.lock().await;
        Ok(session.current_asset().cloned())
    }

    pub async fn set_current(&self, session_id: &str, index: usize) -> Result<(), EditError> {
        self.navigate(session_id, |s| s.history.set_current(index).map(|_| index))
            .await
            .map(|_| ())
    }

    pub async fn undo(&self, session_id: &str) -> Result<usize, EditError> {
        self.navigate(session_id, |s| s.history.undo()).await
    }

    pub async fn redo(&self, session_id: &str) -> Result<usize, EditError> {
        self.navigate(session_id, |s| s.history.redo()).await
    }

    async fn navigate(
        &self,
        session_id: &str,
        mv: impl FnOnce(&mut Session) -> Result<usize, EditError>,
    ) -> Result<usize, EditError> {
        let session = self.store.open(session_id).await?;
        let mut session = session.lock().await;
        let before = session.history.current_index();
        let index = mv(&mut *session)?;
        if let Err(e) = session.save().await {
            let _ = session.history.set_current(before);
            return Err(e);
        }
        tracing::info!(session = %session_id, from = before, to = index, "history pointer moved");
        Ok(index)
    }

    /// 取消会话中进行中的请求；返回时子进程、沙箱与工作目录都已清理
    pub async fn cancel(&self, session_id: &str) -> bool {
        self.supervisor.cancel(session_id).await
    }

    pub fn is_busy(&self, session_id: &str) -> bool {
        self.supervisor.is_busy(session_id)
    }

    /// 执行一次编辑请求
    ///
    /// 会话不存在或正忙时返回 Err，且不触碰任何状态；其余结果（包括失败）都以报告返回。
    pub async fn submit_edit(&self, session_id: &str, prompt: &str) -> Result<ExecutionReport, EditError> {
        let session = self.store.open(session_id).await?;
        let request_id = uuid::Uuid::new_v4().to_string();
        let guard = self.supervisor.begin(session_id, &request_id)?;
        let cancel = guard.cancel_token().clone();
        let mut session = session.lock().await;

        tracing::info!(session = %session_id, request = %request_id, prompt, "edit request started");
        let mut collector = ReportCollector::new(&request_id, session_id, prompt);

        let work = match tempfile::Builder::new()
            .prefix("req-")
            .tempdir_in(session.paths.work())
        {
            Ok(dir) => dir,
            Err(e) => {
                let err = EditError::Io(format!("cannot create work dir: {}", e));
                collector.fail(&err, None);
                return Ok(self.finish(&session, collector).await);
            }
        };

        let outcome = self
            .run(&session, prompt, &request_id, work.path(), &mut collector, &cancel)
            .await;
        let outcome = match outcome {
            Ok(outputs) => {
                self.commit(&mut session, prompt, &request_id, outputs, &mut collector)
                    .await
            }
            Err(abort) => Err(abort),
        };

        if let Err((err, step)) = &outcome {
            tracing::warn!(session = %session_id, request = %request_id, step = ?step, error = %err, "edit request aborted");
            collector.fail(err, *step);
        }

        // 删除中间产物
        if let Err(e) = work.close() {
            tracing::warn!(request = %request_id, error = %e, "work dir cleanup failed");
        }
        let report = self.finish(&session, collector).await;
        drop(session);
        drop(guard);
        Ok(report)
    }

    /// Planning 与 ExecutingStep(i)；不修改会话状态
    async fn run(
        &self,
        session: &Session,
        prompt: &str,
        request_id: &str,
        work_dir: &Path,
        collector: &mut ReportCollector,
        cancel: &CancellationToken,
    ) -> Result<Vec<StepOutput>, Abort> {
        // Planning
        let catalog = self.registry.list();
        let started = Instant::now();
        let planned = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err((EditError::Cancelled, None)),
            plan = self.planner.plan(prompt, &catalog, &session.inventory) => plan,
        };
        collector.record(Phase::Planning, started.elapsed());
        let plan: Plan = planned.map_err(|e| (EditError::PlanningFailure(e), None))?;
        collector.set_plan(&plan);
        plan.check().map_err(|e| (e, None))?;

        // 任一工具缺失即整个计划无效
        let tools: Vec<Arc<dyn MediaTool>> = plan
            .tasks
            .iter()
            .enumerate()
            .map(|(i, task)| self.registry.get(&task.tool).map_err(|e| (e, Some(i))))
            .collect::<Result<_, _>>()?;
        tracing::info!(request = %request_id, steps = plan.len(), "plan accepted");

        let work_rel = work_dir
            .strip_prefix(session.paths.root())
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| work_dir.to_path_buf());
        let short_id: String = request_id.chars().take(8).collect();

        let mut outputs: Vec<StepOutput> = Vec::with_capacity(plan.len());
        for (i, (task, tool)) in plan.tasks.iter().zip(tools.iter()).enumerate() {
            if cancel.is_cancelled() {
                return Err((EditError::Cancelled, Some(i)));
            }
            let previous = outputs.last().map(|o| o.asset.clone());
            let inputs = self
                .step_inputs(session, task, previous)
                .map_err(|e| (e, Some(i)))?;
            let extension = tool.output_extension(task, &inputs);
            let output_name = format!("step{}_{}.{}", i + 1, short_id, extension);
            let script_history: Vec<String> = outputs.iter().map(|o| o.script.clone()).collect();

            tracing::info!(request = %request_id, step = i, tool = tool.name(), task = %task.description, "step started");

            // 生成并在沙箱中验证
            let ctx = StepContext {
                inputs: &inputs,
                source_dir: session.paths.root(),
                output_name: &output_name,
                script_history: &script_history,
            };
            let generated = self
                .generator
                .generate_validated(task, tool.as_ref(), ctx, self.max_attempts, cancel)
                .await;
            let script = match generated {
                Ok(script) => script,
                Err(err) => {
                    if let EditError::GenerationFailure(GenerationFailure { attempts, .. }) = &err {
                        collector.push_step(StepReport {
                            index: i,
                            task: task.clone(),
                            attempts: attempts.clone(),
                            script: None,
                            execution: None,
                            output: None,
                        });
                    }
                    return Err((err, Some(i)));
                }
            };
            collector.record(Phase::Generation, script.generation);
            collector.record(Phase::Validation, script.validation);
            collector.push_step(StepReport {
                index: i,
                task: task.clone(),
                attempts: script.attempts.clone(),
                script: None,
                execution: None,
                output: None,
            });

            // 真实执行
            let input_paths: Vec<PathBuf> = inputs.iter().map(|a| session.paths.resolve(&a.path)).collect();
            let output_path = work_dir.join(&output_name);
            let exec = Execution {
                script: &script.source,
                working_dir: work_dir,
                inputs: &input_paths,
                output: &output_path,
            };
            let result = self.executor.execute(tool.as_ref(), &exec, cancel).await;
            collector.record(Phase::Execution, result.duration);
            let succeeded = result.is_success();
            let reason = result.reason.clone();
            let diagnostic = result.diagnostic();
            if let Some(step) = collector.last_step_mut() {
                step.execution = Some(result);
            }
            if reason == Some(FailureReason::Cancelled) {
                return Err((EditError::Cancelled, Some(i)));
            }
            if !succeeded {
                return Err((
                    EditError::ExecutionFailure {
                        step: i,
                        message: diagnostic,
                    },
                    Some(i),
                ));
            }

            let metadata = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err((EditError::Cancelled, Some(i))),
                meta = probe_or_size(self.probe.as_ref(), &output_path) => meta,
            };
            let asset = Asset::new(output_name.clone(), work_rel.join(&output_name), metadata)
                .with_producer(request_id);
            tracing::info!(request = %request_id, step = i, output = %asset.name, meta = %asset.metadata.summary(), "step finished");
            if let Some(step) = collector.last_step_mut() {
                step.output = Some(asset.name.clone());
            }
            outputs.push(StepOutput {
                asset,
                script: script.source,
                extension: tool.runtime().extension,
            });
        }
        Ok(outputs)
    }

    /// 步骤输入：上一步产物（第一步为当前资产），再加上任务显式引用的资产
    fn step_inputs(&self, session: &Session, task: &Task, previous: Option<Asset>) -> Result<Vec<Asset>, EditError> {
        let mut inputs: Vec<Asset> = previous
            .or_else(|| session.current_asset().cloned())
            .into_iter()
            .collect();
        for name in &task.inputs {
            if inputs.iter().any(|a| &a.name == name) {
                continue;
            }
            let asset = session
                .asset(name)
                .cloned()
                .ok_or_else(|| EditError::PlanningFailure(format!("task references unknown asset {}", name)))?;
            inputs.push(asset);
        }
        Ok(inputs)
    }

    /// Committing：最终产物移入 assets/，保存脚本，追加一个历史条目
    async fn commit(
        &self,
        session: &mut Session,
        prompt: &str,
        request_id: &str,
        outputs: Vec<StepOutput>,
        collector: &mut ReportCollector,
    ) -> Result<(), Abort> {
        let last_step = outputs.len().saturating_sub(1);
        let Some(last) = outputs.last() else {
            return Err((EditError::PlanningFailure("plan produced no output".to_string()), None));
        };

        let stem = session
            .current_asset()
            .and_then(|a| Path::new(&a.name).file_stem().map(|s| s.to_string_lossy().to_string()))
            .unwrap_or_else(|| "output".to_string());
        let ext = last.asset.extension().unwrap_or_default().to_string();
        let name = session.unique_asset_name(&format!("{}_edit", stem), &ext);
        let dest_rel = PathBuf::from("assets").join(&name);
        let dest = session.paths.resolve(&dest_rel);
        let source = session.paths.resolve(&last.asset.path);
        tokio::fs::rename(&source, &dest)
            .await
            .map_err(|e| (EditError::Io(format!("cannot move output: {}", e)), Some(last_step)))?;

        let mut final_asset = last.asset.clone();
        final_asset.name = name.clone();
        final_asset.path = dest_rel;

        let mut scripts = Vec::with_capacity(outputs.len());
        for (i, out) in outputs.iter().enumerate() {
            let rel = PathBuf::from("scripts").join(format!("{}_step{}.{}", request_id, i + 1, out.extension));
            if let Err(e) = tokio::fs::write(session.paths.resolve(&rel), &out.script).await {
                let _ = tokio::fs::rename(&dest, &source).await;
                return Err((EditError::Io(format!("cannot save script: {}", e)), Some(i)));
            }
            scripts.push(rel);
        }

        let previous_history = session.history.clone();
        let index = session.history.commit(NewEntry {
            asset: Some(name.clone()),
            scripts: scripts.clone(),
            report: Some(report_rel(request_id)),
            prompt: Some(prompt.to_string()),
            request_id: Some(request_id.to_string()),
        });
        session.add_asset(final_asset.clone());

        if let Err(e) = session.save().await {
            // 恢复内存状态，落盘的产物一并撤回
            session.history = previous_history;
            session.inventory.retain(|a| a.name != name);
            let _ = tokio::fs::rename(&dest, &source).await;
            for rel in &scripts {
                let _ = tokio::fs::remove_file(session.paths.resolve(rel)).await;
            }
            return Err((e, None));
        }

        for (step, rel) in scripts.into_iter().enumerate() {
            if let Some(report) = collector.step_mut(step) {
                report.script = Some(rel);
            }
        }
        collector.add_asset(final_asset);
        collector.succeed(&name, index);
        tracing::info!(session = %session.id, request = %request_id, entry = index, asset = %name, "edit committed");
        Ok(())
    }

    /// 写报告文件；写失败只记录日志
    async fn finish(&self, session: &Session, collector: ReportCollector) -> ExecutionReport {
        let path = session.paths.resolve(&report_rel(collector.request_id()));
        let report = collector.finish();
        if let Err(e) = write_json_atomic(&path, &report).await {
            tracing::warn!(path = %path.display(), error = %e, "cannot persist report");
        }
        report
    }
}

fn report_rel(request_id: &str) -> PathBuf {
    PathBuf::from("reports").join(format!("{}.json", request_id))
}
