//! Tiered run execution.
//!
//! Each tier's tasks are spawned into a `JoinSet` and joined completely
//! before the next tier is considered. A task's output only becomes an input
//! downstream after it passed verification, so a consumer never observes a
//! missing or zero-byte file.

use super::builder::{Tier, TierPlan};
use super::state::{ExecutionTimer, RunReport, RunState, RunWarning, TaskResult, TaskStatus};
use super::task::{TaskContext, TaskExecutor, TierKind};
use super::verify::{verify_inputs, verify_output};
use crate::errors::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Events emitted during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        tiers: usize,
        tasks: usize,
    },
    TierStarted {
        tier: usize,
        kind: TierKind,
        tasks: Vec<String>,
    },
    TaskStarted {
        task: String,
        tier: usize,
    },
    TaskFinished {
        task: String,
        status: TaskStatus,
        error: Option<String>,
    },
    TierCompleted {
        tier: usize,
        succeeded: usize,
        failed: usize,
    },
    Warning {
        warning: RunWarning,
    },
    RunFinished {
        run_id: String,
        state: RunState,
    },
}

/// Knobs for the launcher. Mirrors the `[pipeline]` config section.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Parent of every run directory.
    pub scratch_root: PathBuf,
    /// Upper bound on concurrently running tasks.
    pub max_parallel: usize,
    /// A task still running after this long has failed.
    pub task_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scratch_root: std::env::temp_dir().join("planwright-runs"),
            max_parallel: 4,
            task_timeout: Duration::from_secs(900),
        }
    }
}

/// Directory layout of one run: `<scratch_root>/<run_id>/<task>.out`, plus
/// `inputs/` for files the parallel tier reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub inputs_dir: PathBuf,
}

impl RunLayout {
    pub fn new(scratch_root: &Path, run_id: &str) -> Self {
        let run_dir = scratch_root.join(run_id);
        Self {
            run_id: run_id.to_string(),
            inputs_dir: run_dir.join("inputs"),
            run_dir,
        }
    }

    pub fn output_path(&self, task_id: &str) -> PathBuf {
        self.run_dir.join(format!("{}.out", task_id))
    }

    fn resolve_input(&self, input: &Path) -> PathBuf {
        if input.is_absolute() {
            input.to_path_buf()
        } else {
            self.inputs_dir.join(input)
        }
    }
}

/// Handle to a launched run.
///
/// Dropping the handle without calling [`join`](Self::join) or
/// [`detach`](Self::detach) cancels every tier that has not started yet.
#[must_use = "dropping a RunHandle cancels tiers that have not started; call join() or detach()"]
pub struct RunHandle {
    run_id: String,
    run_dir: PathBuf,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<RunReport, PipelineError>>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Skip every tier that has not started. Launched tasks run to completion.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to finish.
    pub async fn join(mut self) -> Result<RunReport, PipelineError> {
        let Some(task) = self.task.take() else {
            return Err(PipelineError::Join(format!("run {} has no task", self.run_id)));
        };
        task.await.map_err(|e| PipelineError::Join(e.to_string()))?
    }

    /// Let the run continue in the background. Returns the run id.
    pub fn detach(mut self) -> String {
        self.task.take();
        debug!(run_id = %self.run_id, "Run detached");
        self.run_id.clone()
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            debug!(run_id = %self.run_id, "RunHandle dropped, cancelling pending tiers");
            self.cancel.cancel();
        }
    }
}

/// Launches tier plans against a [`TaskExecutor`].
pub struct PipelineLauncher {
    config: PipelineConfig,
    executor: Arc<dyn TaskExecutor>,
    event_tx: Option<mpsc::Sender<RunEvent>>,
}

impl PipelineLauncher {
    pub fn new(config: PipelineConfig, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            config,
            executor,
            event_tx: None,
        }
    }

    /// Set the event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<RunEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Create a fresh run directory under a new run id.
    pub async fn prepare(&self) -> Result<RunLayout, PipelineError> {
        let layout = RunLayout::new(&self.config.scratch_root, &Uuid::new_v4().to_string());
        let dir_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| PipelineError::RunDir { path, source }
        };
        tokio::fs::create_dir_all(&self.config.scratch_root)
            .await
            .map_err(dir_err(&self.config.scratch_root))?;
        tokio::fs::create_dir(&layout.run_dir)
            .await
            .map_err(dir_err(&layout.run_dir))?;
        tokio::fs::create_dir(&layout.inputs_dir)
            .await
            .map_err(dir_err(&layout.inputs_dir))?;
        debug!(run_id = %layout.run_id, dir = %layout.run_dir.display(), "Prepared run directory");
        Ok(layout)
    }

    /// Start `plan` in a prepared layout.
    pub fn launch_in(&self, layout: RunLayout, plan: TierPlan) -> RunHandle {
        let cancel = CancellationToken::new();
        let run = RunContext {
            layout: layout.clone(),
            config: self.config.clone(),
            executor: self.executor.clone(),
            event_tx: self.event_tx.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(run.execute(plan));
        RunHandle {
            run_id: layout.run_id,
            run_dir: layout.run_dir,
            cancel,
            task: Some(task),
        }
    }

    /// Prepare a fresh run and start `plan` in it.
    pub async fn launch(&self, plan: TierPlan) -> Result<RunHandle, PipelineError> {
        let layout = self.prepare().await?;
        Ok(self.launch_in(layout, plan))
    }
}

struct RunContext {
    layout: RunLayout,
    config: PipelineConfig,
    executor: Arc<dyn TaskExecutor>,
    event_tx: Option<mpsc::Sender<RunEvent>>,
    cancel: CancellationToken,
}

impl RunContext {
    async fn emit(&self, event: RunEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).await.ok();
        }
    }

    async fn execute(self, plan: TierPlan) -> Result<RunReport, PipelineError> {
        let run_id = self.layout.run_id.clone();
        let result = self.run_tiers(&plan).await;
        match &result {
            Ok(report) => {
                info!(run_id = %run_id, state = ?report.state, duration_ms = report.duration.as_millis() as u64, "Run finished");
                self.emit(RunEvent::RunFinished {
                    run_id,
                    state: report.state,
                })
                .await;
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Run failed");
                self.emit(RunEvent::RunFinished {
                    run_id,
                    state: RunState::Failed,
                })
                .await;
            }
        }
        result
    }

    async fn run_tiers(&self, plan: &TierPlan) -> Result<RunReport, PipelineError> {
        let timer = ExecutionTimer::start();
        let mut report = RunReport::new(&self.layout.run_id, self.layout.run_dir.clone());
        report.state = RunState::Running;

        info!(run_id = %self.layout.run_id, tiers = plan.tiers().len(), tasks = plan.task_count(), "Run started");
        self.emit(RunEvent::RunStarted {
            run_id: self.layout.run_id.clone(),
            tiers: plan.tiers().len(),
            tasks: plan.task_count(),
        })
        .await;

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut previous: Option<&Tier> = None;
        let mut last_tier_failed = false;

        for tier in plan.tiers() {
            if self.cancel.is_cancelled() {
                for pending in &plan.tiers()[tier.index..] {
                    for task in &pending.tasks {
                        report.add_result(TaskResult::skipped(&task.id, pending.kind));
                    }
                }
                warn!(run_id = %self.layout.run_id, tier = tier.index, "Run cancelled, skipping remaining tiers");
                report.state = RunState::Cancelled;
                break;
            }

            let inputs = match tier.kind {
                TierKind::Parallel => self.parallel_inputs(tier).await?,
                TierKind::Sequential => {
                    let Some(prev) = previous else {
                        return Err(PipelineError::InvalidShape(format!(
                            "tier {} is sequential but has no tier before it",
                            tier.index
                        )));
                    };
                    let (inputs, warning) = self.sequential_inputs(tier, prev, &report).await?;
                    if let Some(warning) = warning {
                        self.emit(RunEvent::Warning {
                            warning: warning.clone(),
                        })
                        .await;
                        report.warnings.push(warning);
                    }
                    inputs
                }
            };

            for task in &tier.tasks {
                let output = self.layout.output_path(&task.id);
                match tokio::fs::try_exists(&output).await {
                    Ok(false) => {}
                    Ok(true) => return Err(PipelineError::OutputExists(output)),
                    Err(source) => return Err(PipelineError::OutputCheck { path: output, source }),
                }
            }

            let (succeeded, failed) = self.run_tier(tier, inputs, &semaphore, &mut report).await;
            last_tier_failed = failed > 0;
            previous = Some(tier);

            info!(run_id = %self.layout.run_id, tier = tier.index, succeeded, failed, "Tier completed");
            self.emit(RunEvent::TierCompleted {
                tier: tier.index,
                succeeded,
                failed,
            })
            .await;
        }

        if report.state == RunState::Running {
            report.state = if last_tier_failed {
                RunState::Failed
            } else {
                RunState::Completed
            };
        }
        report.duration = timer.elapsed();
        Ok(report)
    }

    /// Declared inputs of each parallel task, verified before anything
    /// launches.
    async fn parallel_inputs(&self, tier: &Tier) -> Result<Vec<Vec<PathBuf>>, PipelineError> {
        let mut all = Vec::with_capacity(tier.tasks.len());
        for task in &tier.tasks {
            let resolved: Vec<PathBuf> = task
                .inputs
                .iter()
                .map(|p| self.layout.resolve_input(p))
                .collect();
            verify_inputs(&resolved)
                .await
                .map_err(|(path, reason)| PipelineError::VerificationFailed {
                    task: task.id.clone(),
                    path,
                    reason,
                })?;
            all.push(resolved);
        }
        Ok(all)
    }

    /// The verified outputs of `prev`, or `InsufficientInputs` when there are
    /// none.
    async fn sequential_inputs(
        &self,
        tier: &Tier,
        prev: &Tier,
        report: &RunReport,
    ) -> Result<(Vec<Vec<PathBuf>>, Option<RunWarning>), PipelineError> {
        let mut available = Vec::new();
        let mut failures = Vec::new();
        for producer in &prev.tasks {
            match report.output_of(&producer.id) {
                Some(path) => available.push(path.clone()),
                None => failures.push(producer.id.clone()),
            }
        }

        let mut all = Vec::with_capacity(tier.tasks.len());
        let mut warning = None;
        for task in &tier.tasks {
            if available.is_empty() {
                warn!(task = %task.id, expected = prev.tasks.len(), "No verified inputs, not launching");
                return Err(PipelineError::InsufficientInputs {
                    task: task.id.clone(),
                    expected: prev.tasks.len(),
                    failures,
                });
            }
            verify_inputs(&available)
                .await
                .map_err(|(path, reason)| PipelineError::VerificationFailed {
                    task: task.id.clone(),
                    path,
                    reason,
                })?;
            if !failures.is_empty() {
                warn!(
                    task = %task.id,
                    available = available.len(),
                    expected = prev.tasks.len(),
                    failed = ?failures,
                    "Running on partial inputs"
                );
                warning = Some(RunWarning::PartialInputs {
                    task: task.id.clone(),
                    available: available.len(),
                    expected: prev.tasks.len(),
                    failed: failures.clone(),
                });
            }
            all.push(available.clone());
        }
        Ok((all, warning))
    }

    /// Spawn every task of `tier` and join them all.
    async fn run_tier(
        &self,
        tier: &Tier,
        inputs: Vec<Vec<PathBuf>>,
        semaphore: &Arc<Semaphore>,
        report: &mut RunReport,
    ) -> (usize, usize) {
        info!(run_id = %self.layout.run_id, tier = tier.index, kind = ?tier.kind, tasks = ?tier.task_ids(), "Tier started");
        self.emit(RunEvent::TierStarted {
            tier: tier.index,
            kind: tier.kind,
            tasks: tier.task_ids(),
        })
        .await;

        let mut set = JoinSet::new();
        let mut names: HashMap<tokio::task::Id, String> = HashMap::new();
        for (task, inputs) in tier.tasks.iter().zip(inputs) {
            let ctx = TaskContext {
                run_id: self.layout.run_id.clone(),
                task_id: task.id.clone(),
                tier: tier.kind,
                instructions: task.instructions.clone(),
                inputs,
                output_path: self.layout.output_path(&task.id),
            };
            self.emit(RunEvent::TaskStarted {
                task: task.id.clone(),
                tier: tier.index,
            })
            .await;

            let semaphore = semaphore.clone();
            let executor = self.executor.clone();
            let timeout = self.config.task_timeout;
            let handle = set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                run_task(executor, ctx, timeout).await
            });
            names.insert(handle.id(), task.id.clone());
        }

        let mut succeeded = 0;
        let mut failed = 0;
        while let Some(joined) = set.join_next_with_id().await {
            let result = match joined {
                Ok((_, result)) => result,
                Err(e) => {
                    let task = names.get(&e.id()).cloned().unwrap_or_default();
                    TaskResult::failure(&task, tier.kind, format!("task aborted: {}", e), Duration::ZERO)
                }
            };
            if result.succeeded() {
                succeeded += 1;
                debug!(task = %result.task, "Task succeeded");
            } else {
                failed += 1;
                warn!(task = %result.task, error = result.error.as_deref().unwrap_or(""), "Task failed");
            }
            self.emit(RunEvent::TaskFinished {
                task: result.task.clone(),
                status: result.status,
                error: result.error.clone(),
            })
            .await;
            report.add_result(result);
        }
        (succeeded, failed)
    }
}

/// Run one task under its timeout and verify what it wrote.
async fn run_task(executor: Arc<dyn TaskExecutor>, ctx: TaskContext, timeout: Duration) -> TaskResult {
    let timer = ExecutionTimer::start();
    match tokio::time::timeout(timeout, executor.execute(&ctx)).await {
        Err(_) => TaskResult::failure(
            &ctx.task_id,
            ctx.tier,
            format!("timed out after {}s", timeout.as_secs_f64()),
            timer.elapsed(),
        ),
        Ok(Err(e)) => TaskResult::failure(&ctx.task_id, ctx.tier, format!("{:#}", e), timer.elapsed()),
        Ok(Ok(())) => match verify_output(&ctx.output_path).await {
            Ok(_) => TaskResult::success(&ctx.task_id, ctx.tier, ctx.output_path.clone(), timer.elapsed()),
            Err(reason) => TaskResult::failure(
                &ctx.task_id,
                ctx.tier,
                format!("output {} is {}", ctx.output_path.display(), reason),
                timer.elapsed(),
            ),
        },
    }
}
