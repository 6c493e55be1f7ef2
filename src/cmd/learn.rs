//! `planwright learn run` and `planwright preprocess`.

use anyhow::{Context, Result};
use planwright::config::PlanwrightConfig;
use planwright::errors::UserFacingError;
use planwright::learn::{LearnRequest, LearnWorkflow};
use planwright::pipeline::{PipelineLauncher, PromptTaskExecutor, RunEvent};
use planwright::plan::PlanId;
use planwright::remote::TextGenerator;
use planwright::remote::generator::CliGenerator;
use planwright::session::{GeneratorJudge, Preprocessor, SessionRecord, SourceType};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::services;

fn generator(config: &PlanwrightConfig) -> Arc<dyn TextGenerator> {
    let pipeline = &config.toml.pipeline;
    Arc::new(
        CliGenerator::new(
            pipeline.generator_cmd.clone(),
            pipeline.generator_args.clone(),
            config.project_dir.clone(),
        )
        .with_timeout(Duration::from_secs(pipeline.task_timeout_secs)),
    )
}

fn preprocessor(config: &PlanwrightConfig) -> Preprocessor {
    let preprocessor = Preprocessor::new(config.toml.preprocess.clone());
    if config.toml.preprocess.stage2 {
        preprocessor.with_judge(Arc::new(GeneratorJudge::new(generator(config))))
    } else {
        preprocessor
    }
}

/// One progress line per event, on stderr.
fn describe(event: &RunEvent) -> Option<String> {
    match event {
        RunEvent::RunStarted { run_id, tiers, tasks } => {
            Some(format!("run {}: {} tasks in {} tiers", run_id, tasks, tiers))
        }
        RunEvent::TierStarted { tier, tasks, .. } => Some(format!("tier {}: {}", tier, tasks.join(", "))),
        RunEvent::TaskFinished {
            task,
            error: Some(error),
            ..
        } => Some(format!("  {} failed: {}", task, error)),
        RunEvent::TaskFinished { task, .. } => Some(format!("  {} done", task)),
        RunEvent::TierCompleted { tier, succeeded, failed } => {
            Some(format!("tier {} complete: {} ok, {} failed", tier, succeeded, failed))
        }
        RunEvent::TaskStarted { .. } | RunEvent::Warning { .. } | RunEvent::RunFinished { .. } => None,
    }
}

pub async fn cmd_learn_run(
    config: &PlanwrightConfig,
    plan_id: PlanId,
    sessions: &[PathBuf],
    sessions_dir: Option<&Path>,
    planning_session: Option<String>,
    json_output: bool,
) -> Result<()> {
    let request = match sessions_dir {
        Some(dir) => {
            let mut request = LearnRequest::discover(plan_id, dir, planning_session)?;
            let extra = LearnRequest::from_paths(plan_id, sessions, None);
            request.sessions.extend(extra.sessions);
            request
        }
        None => LearnRequest::from_paths(plan_id, sessions, planning_session),
    };
    if request.sessions.is_empty() {
        return Err(UserFacingError::new(
            "no-sessions",
            format!("no session logs were given for plan {}", plan_id),
        )
        .with_remediation("pass --session <path> or --sessions-dir <dir>")
        .into());
    }

    let (tx, mut rx) = mpsc::channel(64);
    let progress = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Some(line) = describe(&event) {
                eprintln!("{}", line);
            }
        }
    });

    let executor = Arc::new(PromptTaskExecutor::new(generator(config)));
    let launcher = PipelineLauncher::new(config.toml.pipeline_config(), executor).with_event_channel(tx);
    let workflow = LearnWorkflow::new(services::open_lifecycle(config)?, preprocessor(config), launcher);

    let result = workflow.run(&request).await;
    drop(workflow);
    let _ = progress.await;
    let outcome = result?;

    if json_output {
        let out = json!({
            "plan_id": outcome.plan_id.0,
            "run_id": outcome.run_id,
            "learn_status": outcome.status.name(),
            "learn_plan_id": outcome.learn_plan.as_ref().map(|p| p.id.0),
            "report": outcome.report,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Learned from plan {} (run {})", outcome.plan_id, outcome.run_id);
    for (session, stats) in &outcome.session_stats {
        println!(
            "  {}: {} of {} records kept",
            session, stats.output_records, stats.stage1.input_records
        );
    }
    match &outcome.learn_plan {
        Some(plan) => println!("Created plan {}: {}", plan.id, plan.title),
        None => println!("No follow-on plan needed."),
    }
    if outcome.report.has_partial_inputs() {
        println!("Warning: some analyses failed; synthesis used partial input.");
    }
    Ok(())
}

/// Reduce one session log into chunk files under `out_dir`, without touching
/// any remote.
pub async fn cmd_preprocess(
    config: &PlanwrightConfig,
    session: &Path,
    out_dir: &Path,
    planning_session: Option<&str>,
) -> Result<()> {
    let record = SessionRecord::from_path(session, SourceType::Local, None)
        .with_context(|| format!("{} has no usable file name", session.display()))?;
    let reduced = preprocessor(config).preprocess(&record, planning_session).await?;
    let paths = reduced.write_chunks(out_dir).await?;

    let out = json!({
        "session_id": reduced.session_id,
        "kind": reduced.kind.as_str(),
        "stats": reduced.stats,
        "chunks": paths,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
