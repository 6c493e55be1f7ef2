//! Task definitions and the executor seam.

use crate::remote::TextGenerator;
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Placement of a task in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    /// Mutually independent tasks over disjoint inputs.
    Parallel,
    /// One task consuming the verified outputs of the tier before it.
    Sequential,
}

/// A task as declared by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// What the task should do with its inputs.
    pub instructions: String,
    /// Files a dependency-free task reads. Relative paths are resolved
    /// against the run's `inputs/` directory.
    #[serde(default)]
    pub inputs: Vec<PathBuf>,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            instructions: instructions.into(),
            inputs: Vec::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    pub fn depends_on(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }
}

/// Everything a running task is given. Inputs are path references; content
/// is never inlined.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub run_id: String,
    pub task_id: String,
    pub tier: TierKind,
    pub instructions: String,
    pub inputs: Vec<PathBuf>,
    pub output_path: PathBuf,
}

/// Runs one task. Implementations must write `ctx.output_path` exactly once,
/// for example with [`write_once`].
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, ctx: &TaskContext) -> anyhow::Result<()>;
}

/// Create `path` and write `content`, failing if the file already exists.
pub async fn write_once(path: &Path, content: &str) -> anyhow::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(content.as_bytes())
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    file.flush().await?;
    Ok(())
}

/// Sends the task's instructions and input paths to a [`TextGenerator`] and
/// stores the reply as the output.
pub struct PromptTaskExecutor {
    generator: Arc<dyn TextGenerator>,
}

impl PromptTaskExecutor {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    pub fn build_prompt(ctx: &TaskContext) -> String {
        let mut prompt = ctx.instructions.trim_end().to_string();
        prompt.push_str("\n\n## Input files\n\nRead each of these files:\n");
        for input in &ctx.inputs {
            prompt.push_str(&format!("- {}\n", input.display()));
        }
        prompt
    }
}

#[async_trait]
impl TaskExecutor for PromptTaskExecutor {
    async fn execute(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        let reply = self
            .generator
            .generate(&Self::build_prompt(ctx))
            .await
            .with_context(|| format!("Generation failed for task '{}'", ctx.task_id))?;
        write_once(&ctx.output_path, &reply).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct Canned;

    #[async_trait]
    impl TextGenerator for Canned {
        async fn generate(&self, prompt: &str) -> anyhow::Result<String> {
            Ok(format!("saw {} bytes", prompt.len()))
        }
    }

    fn ctx(output: PathBuf) -> TaskContext {
        TaskContext {
            run_id: "r".into(),
            task_id: "analyze-1".into(),
            tier: TierKind::Parallel,
            instructions: "Summarize the session.".into(),
            inputs: vec![PathBuf::from("/runs/r/inputs/execution-s1-part01.jsonl")],
            output_path: output,
        }
    }

    #[test]
    fn test_prompt_lists_paths_not_content() {
        let prompt = PromptTaskExecutor::build_prompt(&ctx(PathBuf::from("/x")));
        assert!(prompt.starts_with("Summarize the session."));
        assert!(prompt.contains("- /runs/r/inputs/execution-s1-part01.jsonl"));
    }

    #[tokio::test]
    async fn test_prompt_executor_writes_output() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("analyze-1.out");
        let executor = PromptTaskExecutor::new(Arc::new(Canned));
        executor.execute(&ctx(out.clone())).await.unwrap();
        assert!(std::fs::read_to_string(&out).unwrap().starts_with("saw "));
    }

    #[tokio::test]
    async fn test_write_once_refuses_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.out");
        write_once(&path, "first").await.unwrap();
        assert!(write_once(&path, "second").await.is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first");
    }

    #[test]
    fn test_task_spec_builders() {
        let spec = TaskSpec::new("synthesize", "Combine")
            .depends_on(["a", "b"])
            .with_inputs([PathBuf::from("x")]);
        assert_eq!(spec.depends_on, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(spec.inputs, vec![PathBuf::from("x")]);
    }
}
