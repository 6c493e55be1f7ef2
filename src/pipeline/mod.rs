//! Tiered task pipeline.
//!
//! A run is a list of tiers. The first tier holds mutually independent tasks
//! over disjoint inputs and runs them concurrently. Every later tier holds a
//! single task whose inputs are the verified outputs of the tier before it.
//!
//! ## Example
//!
//! ```no_run
//! use planwright::pipeline::{PipelineConfig, PipelineLauncher, PromptTaskExecutor, TaskSpec, TierPlanBuilder};
//! use planwright::remote::generator::CliGenerator;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let plan = TierPlanBuilder::new(vec![
//!     TaskSpec::new("analyze-1", "Summarize"),
//!     TaskSpec::new("analyze-2", "Summarize"),
//!     TaskSpec::new("synthesize", "Combine").depends_on(["analyze-1", "analyze-2"]),
//! ])
//! .build()?;
//!
//! let executor = Arc::new(PromptTaskExecutor::new(Arc::new(CliGenerator::new("claude", vec!["-p".into()], ".".into()))));
//! let launcher = PipelineLauncher::new(PipelineConfig::default(), executor);
//! let report = launcher.launch(plan).await?.join().await?;
//! // Tier 0: [analyze-1, analyze-2] - concurrent
//! // Tier 1: [synthesize] - reads both outputs
//! # Ok(())
//! # }
//! ```

mod builder;
mod executor;
mod state;
mod task;
mod verify;

pub use builder::{Tier, TierPlan, TierPlanBuilder};
pub use executor::{PipelineConfig, PipelineLauncher, RunEvent, RunHandle, RunLayout};
pub use state::{RunReport, RunState, RunWarning, TaskResult, TaskStatus};
pub use task::{PromptTaskExecutor, TaskContext, TaskExecutor, TaskSpec, TierKind, write_once};
pub use verify::{VerifyFailure, verify_output};
