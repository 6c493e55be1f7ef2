//! Run and task state.

use super::task::TierKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Overall state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    /// Every task of the last tier succeeded.
    Completed,
    Failed,
    /// Cancelled before every tier started.
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Never launched because the run was cancelled first.
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// Outcome of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task: String,
    pub tier: TierKind,
    pub status: TaskStatus,
    /// Set only once the output passed verification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl TaskResult {
    pub fn success(task: &str, tier: TierKind, output_path: PathBuf, duration: Duration) -> Self {
        Self {
            task: task.to_string(),
            tier,
            status: TaskStatus::Succeeded,
            output_path: Some(output_path),
            error: None,
            duration,
        }
    }

    pub fn failure(task: &str, tier: TierKind, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            task: task.to_string(),
            tier,
            status: TaskStatus::Failed,
            output_path: None,
            error: Some(error.into()),
            duration,
        }
    }

    pub fn skipped(task: &str, tier: TierKind) -> Self {
        Self {
            task: task.to_string(),
            tier,
            status: TaskStatus::Skipped,
            output_path: None,
            error: None,
            duration: Duration::ZERO,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }
}

/// Something that went wrong without failing the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunWarning {
    /// A sequential task started with only some of the previous tier's
    /// outputs.
    PartialInputs {
        task: String,
        available: usize,
        expected: usize,
        failed: Vec<String>,
    },
    TaskFailed { task: String, error: String },
}

/// What a finished run reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub state: RunState,
    pub task_results: BTreeMap<String, TaskResult>,
    pub warnings: Vec<RunWarning>,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl RunReport {
    pub fn new(run_id: &str, run_dir: PathBuf) -> Self {
        Self {
            run_id: run_id.to_string(),
            run_dir,
            state: RunState::Idle,
            task_results: BTreeMap::new(),
            warnings: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn add_result(&mut self, result: TaskResult) {
        if let (TaskStatus::Failed, Some(error)) = (result.status, &result.error) {
            self.warnings.push(RunWarning::TaskFailed {
                task: result.task.clone(),
                error: error.clone(),
            });
        }
        self.task_results.insert(result.task.clone(), result);
    }

    pub fn succeeded(&self) -> usize {
        self.count(TaskStatus::Succeeded)
    }

    pub fn failed(&self) -> usize {
        self.count(TaskStatus::Failed)
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.task_results.values().filter(|r| r.status == status).count()
    }

    /// Verified output of `task`, if it succeeded.
    pub fn output_of(&self, task: &str) -> Option<&PathBuf> {
        self.task_results.get(task)?.output_path.as_ref()
    }

    pub fn has_partial_inputs(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, RunWarning::PartialInputs { .. }))
    }
}

/// Tracks execution timing.
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Durations as whole milliseconds.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_terminal() {
        assert!(!RunState::Idle.is_terminal());
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
    }

    #[test]
    fn test_report_counts_and_warnings() {
        let mut report = RunReport::new("r1", PathBuf::from("/tmp/r1"));
        report.add_result(TaskResult::success(
            "a",
            TierKind::Parallel,
            PathBuf::from("/tmp/r1/a.out"),
            Duration::from_secs(1),
        ));
        report.add_result(TaskResult::failure(
            "b",
            TierKind::Parallel,
            "timed out",
            Duration::from_secs(2),
        ));
        report.add_result(TaskResult::skipped("c", TierKind::Sequential));

        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.output_of("a"), Some(&PathBuf::from("/tmp/r1/a.out")));
        assert_eq!(report.output_of("b"), None);
        assert_eq!(
            report.warnings,
            vec![RunWarning::TaskFailed {
                task: "b".into(),
                error: "timed out".into()
            }]
        );
        assert!(!report.has_partial_inputs());
    }

    #[test]
    fn test_report_serializes_duration_as_millis() {
        let mut report = RunReport::new("r1", PathBuf::from("/tmp/r1"));
        report.duration = Duration::from_millis(1500);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["duration"], serde_json::json!(1500));
        assert_eq!(json["state"], serde_json::json!("idle"));
    }

    #[test]
    fn test_oversized_duration_saturates() {
        let mut report = RunReport::new("r1", PathBuf::from("/tmp/r1"));
        report.duration = Duration::MAX;
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["duration"], serde_json::json!(u64::MAX));
    }
}
