//! Learn workflow.
//!
//! Turns the agent sessions behind a plan into documentation follow-ups:
//!
//! 1. Move the plan's learn status to `pending` (learn plans are refused)
//! 2. Preprocess every session into chunks under the run's `inputs/`
//! 3. Analyze each chunk in parallel, then synthesize and extract a plan
//! 4. Record `completed_no_plan`, or create the learn plan and record
//!    `completed_with_plan`. The learn plan's id is stored on the source
//!    first, so a retry reuses it instead of creating a second one
//!
//! A failed run leaves the status at `pending` so the workflow can be
//! retried, and posts a `learn-failed` event on the plan.

pub mod prompts;

pub use prompts::{NO_PLAN_SENTINEL, is_no_plan, plan_title};

use crate::errors::{LearnError, UserFacingError};
use crate::lifecycle::{Effect, Lifecycle};
use crate::metadata::Fields;
use crate::pipeline::{PipelineLauncher, RunLayout, RunReport, TaskSpec, TierPlan, TierPlanBuilder};
use crate::plan::{LearnStatus, Plan, PlanId};
use crate::session::{PreprocessStats, Preprocessor, SessionRecord, SourceType, discover_sessions};
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const SYNTHESIZE_TASK: &str = "synthesize";
pub const EXTRACT_PLAN_TASK: &str = "extract-plan";

/// What to learn from. Session identity is passed in, never read from the
/// environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LearnRequest {
    pub plan_id: PlanId,
    pub sessions: Vec<SessionRecord>,
    /// Id of the session that wrote the plan. Every other session counts as
    /// execution.
    pub planning_session_id: Option<String>,
}

impl LearnRequest {
    /// A request over explicit session log paths.
    pub fn from_paths(plan_id: PlanId, paths: &[PathBuf], planning_session_id: Option<String>) -> Self {
        let sessions = paths
            .iter()
            .filter_map(|p| SessionRecord::from_path(p, SourceType::Local, Some(plan_id)))
            .collect();
        Self {
            plan_id,
            sessions,
            planning_session_id,
        }
    }

    /// A request over every `*.jsonl` log under `root`.
    pub fn discover(
        plan_id: PlanId,
        root: &Path,
        planning_session_id: Option<String>,
    ) -> Result<Self, LearnError> {
        Ok(Self {
            plan_id,
            sessions: discover_sessions(root, Some(plan_id))?,
            planning_session_id,
        })
    }

    pub fn session_ids(&self) -> Vec<&str> {
        self.sessions.iter().map(|s| s.id.as_str()).collect()
    }
}

/// Result of a finished learn run.
#[derive(Debug, Clone)]
pub struct LearnOutcome {
    pub plan_id: PlanId,
    pub run_id: String,
    pub status: LearnStatus,
    /// The follow-on plan, when extraction produced one.
    pub learn_plan: Option<Plan>,
    pub report: RunReport,
    pub session_stats: Vec<(String, PreprocessStats)>,
}

pub struct LearnWorkflow {
    lifecycle: Arc<Lifecycle>,
    preprocessor: Preprocessor,
    launcher: PipelineLauncher,
}

impl LearnWorkflow {
    pub fn new(lifecycle: Arc<Lifecycle>, preprocessor: Preprocessor, launcher: PipelineLauncher) -> Self {
        Self {
            lifecycle,
            preprocessor,
            launcher,
        }
    }

    pub async fn run(&self, request: &LearnRequest) -> Result<LearnOutcome, LearnError> {
        let id = request.plan_id;
        match self.lifecycle.begin_learn(id).await? {
            Effect::Changed(_) => {}
            Effect::NoChange(_) => info!(plan_id = %id, "Learn already pending, retrying"),
        }

        let layout = self.launcher.prepare().await?;
        info!(
            plan_id = %id,
            run_id = %layout.run_id,
            sessions = request.sessions.len(),
            "Learn run started"
        );

        match self.learn(request, &layout).await {
            Ok(outcome) => {
                self.post_event(
                    id,
                    "learned",
                    Fields::from([
                        ("run_id".to_string(), json!(outcome.run_id)),
                        ("learn_status".to_string(), outcome.status.to_value()),
                    ]),
                )
                .await;
                Ok(outcome)
            }
            Err(e) => {
                let user = UserFacingError::from(&e);
                warn!(plan_id = %id, run_id = %layout.run_id, kind = user.kind, error = %e, "Learn run failed");
                self.post_event(
                    id,
                    "learn-failed",
                    Fields::from([
                        ("run_id".to_string(), json!(layout.run_id)),
                        ("kind".to_string(), json!(user.kind)),
                        ("detail".to_string(), json!(user.detail)),
                    ]),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn learn(&self, request: &LearnRequest, layout: &RunLayout) -> Result<LearnOutcome, LearnError> {
        let id = request.plan_id;
        let (chunk_files, session_stats) = self.preprocess_all(request, &layout.inputs_dir).await?;
        if chunk_files.is_empty() {
            return Err(LearnError::NoSessionContent(id));
        }

        let plan = build_learn_plan(&chunk_files)?;
        let report = self.launcher.launch_in(layout.clone(), plan).join().await?;

        let Some(output) = report.output_of(EXTRACT_PLAN_TASK) else {
            let detail = report
                .task_results
                .values()
                .filter_map(|r| r.error.as_deref().map(|e| format!("{}: {}", r.task, e)))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(LearnError::SynthesisFailed {
                run_id: report.run_id.clone(),
                detail: if detail.is_empty() {
                    format!("run ended {:?}", report.state)
                } else {
                    detail
                },
            });
        };
        let text = tokio::fs::read_to_string(output)
            .await
            .map_err(|source| LearnError::Io {
                path: output.clone(),
                source,
            })?;

        let (status, learn_plan) = if is_no_plan(&text) {
            let status = self.lifecycle.complete_learn(id, None).await?.into_inner();
            (status, None)
        } else {
            let title = plan_title(&text)
                .map(str::to_string)
                .unwrap_or_else(|| format!("Document learnings from plan {}", id));
            let created = self
                .lifecycle
                .ensure_learn_plan(id, &title, text.trim())
                .await?
                .into_inner();
            let status = self
                .lifecycle
                .complete_learn(id, Some(created.id))
                .await?
                .into_inner();
            (status, Some(created))
        };

        info!(
            plan_id = %id,
            run_id = %report.run_id,
            status = status.name(),
            partial = report.has_partial_inputs(),
            "Learn run finished"
        );
        Ok(LearnOutcome {
            plan_id: id,
            run_id: report.run_id.clone(),
            status,
            learn_plan,
            report,
            session_stats,
        })
    }

    /// Preprocess every session into `inputs_dir`. Returns the chunk file
    /// names relative to it.
    async fn preprocess_all(
        &self,
        request: &LearnRequest,
        inputs_dir: &Path,
    ) -> Result<(Vec<PathBuf>, Vec<(String, PreprocessStats)>), LearnError> {
        let mut seen = HashSet::new();
        let mut files = Vec::new();
        let mut stats = Vec::new();
        for session in &request.sessions {
            if !seen.insert(session.id.as_str()) {
                warn!(session_id = %session.id, path = %session.origin_path.display(), "Duplicate session id, skipping");
                continue;
            }
            let processed = self
                .preprocessor
                .preprocess(session, request.planning_session_id.as_deref())
                .await?;
            if processed.is_empty() {
                debug!(session_id = %session.id, "Session has no content after preprocessing");
            }
            for path in processed.write_chunks(inputs_dir).await? {
                if let Some(name) = path.file_name() {
                    files.push(PathBuf::from(name));
                }
            }
            stats.push((processed.session_id, processed.stats));
        }
        Ok((files, stats))
    }

    async fn post_event(&self, id: PlanId, kind: &str, payload: Fields) {
        if let Err(e) = self.lifecycle.backend().post_event(id, kind, payload).await {
            warn!(plan_id = %id, kind, error = %e, "Failed to post learn event");
        }
    }
}

/// One analysis task per chunk, then synthesis, then extraction.
pub fn build_learn_plan(chunk_files: &[PathBuf]) -> Result<TierPlan, LearnError> {
    let analyses: Vec<String> = (1..=chunk_files.len()).map(|i| format!("analyze-{:02}", i)).collect();
    let mut tasks: Vec<TaskSpec> = analyses
        .iter()
        .zip(chunk_files)
        .map(|(task, file)| TaskSpec::new(task, prompts::ANALYZE_INSTRUCTIONS).with_inputs([file.clone()]))
        .collect();
    tasks.push(TaskSpec::new(SYNTHESIZE_TASK, prompts::SYNTHESIZE_INSTRUCTIONS).depends_on(analyses));
    tasks.push(TaskSpec::new(EXTRACT_PLAN_TASK, prompts::EXTRACT_PLAN_INSTRUCTIONS).depends_on([SYNTHESIZE_TASK]));
    Ok(TierPlanBuilder::new(tasks).build()?)
}
