//! Typed error hierarchy for planwright.
//!
//! One enum per subsystem:
//! - `CodecError`: metadata block encoding and decoding
//! - `RemoteError` / `VcsError`: collaborator adapters (store, git, dispatch)
//! - `PlanError`: plan backend reads and mutations
//! - `LifecycleError`: stage and learn-status transitions
//! - `PreprocessError`: session log reduction
//! - `PipelineError`: tier planning, verification and execution
//! - `LearnError`: the composed learn workflow
//!
//! Absence is never an error here: backends report it as `Lookup::NotFound`
//! or `Mutation::NotFound`. `UserFacingError` is the filtered form printed by
//! the binary.

use crate::pipeline::VerifyFailure;
use crate::plan::{PlanId, Stage};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the metadata block codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Invalid metadata key '{0}': keys must match [a-z0-9][a-z0-9-]*")]
    InvalidKey(String),

    #[error("Malformed metadata block '{key}': {reason}")]
    Malformed { key: String, reason: String },

    #[error("Failed to serialize metadata block '{key}': {reason}")]
    Serialize { key: String, reason: String },
}

/// Errors from the remote document store or workflow dispatcher.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Remote request failed: {0}")]
    Transport(String),

    #[error("Remote returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Malformed remote response: {0}")]
    Malformed(String),

    #[error("Missing credentials: {0} is not set")]
    MissingCredentials(&'static str),
}

/// Errors from the version-control collaborator.
#[derive(Debug, Error)]
pub enum VcsError {
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("Unknown branch or revision '{0}'")]
    UnknownRef(String),

    #[error("Branch '{0}' already exists")]
    BranchExists(String),

    #[error("Git command failed: {0}")]
    Command(String),
}

/// Errors from plan backends.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Plan {id} is in a corrupted state: {reason}")]
    CorruptedState { id: PlanId, reason: String },

    #[error("Plan backend error: {0}")]
    Backend(#[from] RemoteError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl PlanError {
    pub fn corrupted(id: PlanId, reason: impl Into<String>) -> Self {
        PlanError::CorruptedState {
            id,
            reason: reason.into(),
        }
    }
}

/// Errors from lifecycle transitions.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Plan {0} not found")]
    PlanNotFound(PlanId),

    #[error("Plan {id} cannot move from {from} to {to}")]
    InvalidTransition { id: PlanId, from: Stage, to: Stage },

    #[error("Plan {id} failed guard '{guard}': {detail}")]
    GuardFailed {
        id: PlanId,
        guard: &'static str,
        detail: String,
    },

    #[error("Plan {0} is a learn plan and cannot enter learn itself")]
    LearnCycle(PlanId),

    #[error("Plan {id} learn status cannot move from {from} to {to}")]
    InvalidLearnTransition { id: PlanId, from: String, to: String },

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("Version control error: {0}")]
    Vcs(#[from] VcsError),

    #[error("Workflow dispatch failed: {0}")]
    Dispatch(#[source] RemoteError),
}

/// Errors from session preprocessing.
#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("Failed to read session log {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to discover sessions under {path}: {reason}")]
    Discover { path: PathBuf, reason: String },

    #[error("Failed to write chunk {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Chunk {path} already exists; another session maps to the same file name")]
    ChunkExists { path: PathBuf },
}

/// Errors from pipeline planning and execution.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("Unknown dependency '{dependency}' in task '{task}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("Cycle detected in task dependencies. Involved tasks: {0:?}")]
    Cycle(Vec<String>),

    #[error("Invalid pipeline shape: {0}")]
    InvalidShape(String),

    #[error("Invalid task id '{0}': ids name output files and may not be empty or contain path separators or '..'")]
    InvalidTaskId(String),

    #[error("Verification failed for task '{task}' input {path}: {reason}")]
    VerificationFailed {
        task: String,
        path: PathBuf,
        reason: VerifyFailure,
    },

    #[error("Insufficient inputs for task '{task}': all {expected} upstream outputs are unavailable")]
    InsufficientInputs {
        task: String,
        expected: usize,
        failures: Vec<String>,
    },

    #[error("Output path {0} already exists; run paths are written exactly once")]
    OutputExists(PathBuf),

    #[error("Failed to prepare run directory {path}: {source}")]
    RunDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to check output path {path}: {source}")]
    OutputCheck {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Pipeline run aborted: {0}")]
    Join(String),
}

/// Errors from the learn workflow.
#[derive(Debug, Error)]
pub enum LearnError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Preprocess(#[from] PreprocessError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("No session content to learn from for plan {0}")]
    NoSessionContent(PlanId),

    #[error("Synthesis did not produce a result in run {run_id}: {detail}")]
    SynthesisFailed { run_id: String, detail: String },

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A failure as shown to a person: a short symbolic kind, a readable detail
/// and optional remediation steps. Built from the typed errors above so raw
/// transport text never reaches the terminal unfiltered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserFacingError {
    pub kind: &'static str,
    pub detail: String,
    pub remediation: Vec<String>,
}

impl UserFacingError {
    pub fn new(kind: &'static str, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            remediation: Vec::new(),
        }
    }

    pub fn with_remediation(mut self, step: impl Into<String>) -> Self {
        self.remediation.push(step.into());
        self
    }
}

impl fmt::Display for UserFacingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error[{}]: {}", self.kind, self.detail)?;
        for step in &self.remediation {
            write!(f, "\n  hint: {}", step)?;
        }
        Ok(())
    }
}

impl std::error::Error for UserFacingError {}

impl From<&RemoteError> for UserFacingError {
    fn from(err: &RemoteError) -> Self {
        match err {
            RemoteError::MissingCredentials(var) => UserFacingError::new(
                "missing-credentials",
                format!("{} is not set", var),
            )
            .with_remediation(format!("export {} with a token that can read and write issues", var)),
            RemoteError::Status { status, .. } => UserFacingError::new(
                "backend-unavailable",
                format!("the plan store rejected the request (status {})", status),
            )
            .with_remediation("check the configured repository and token permissions"),
            RemoteError::Transport(_) | RemoteError::Malformed(_) => UserFacingError::new(
                "backend-unavailable",
                "the plan store could not be reached or returned an unexpected response",
            )
            .with_remediation("retry; plan mutations are safe to repeat"),
        }
    }
}

impl From<&PlanError> for UserFacingError {
    fn from(err: &PlanError) -> Self {
        match err {
            PlanError::CorruptedState { id, reason } => {
                UserFacingError::new("corrupted-plan", format!("plan {} is corrupted: {}", id, reason))
                    .with_remediation(format!(
                        "inspect plan {} in the remote store and restore its plan-header block",
                        id
                    ))
            }
            PlanError::Backend(inner) => inner.into(),
            PlanError::Codec(CodecError::InvalidKey(key)) => {
                UserFacingError::new("invalid-metadata-key", format!("'{}' is not a valid metadata key", key))
            }
            PlanError::Codec(_) => {
                UserFacingError::new("corrupted-plan", "a plan metadata block could not be read or written")
            }
        }
    }
}

impl From<&LifecycleError> for UserFacingError {
    fn from(err: &LifecycleError) -> Self {
        match err {
            LifecycleError::PlanNotFound(id) => {
                UserFacingError::new("plan-not-found", format!("plan {} does not exist", id))
            }
            LifecycleError::InvalidTransition { id, from, to } => UserFacingError::new(
                "invalid-transition",
                format!("plan {} is {} and cannot move to {}", id, from, to),
            ),
            LifecycleError::GuardFailed { id, guard, detail } => {
                UserFacingError::new("guard-failed", format!("plan {} failed '{}': {}", id, guard, detail))
            }
            LifecycleError::LearnCycle(id) => UserFacingError::new(
                "learn-cycle",
                format!("plan {} was produced by learn and cannot be learned from", id),
            ),
            LifecycleError::InvalidLearnTransition { id, from, to } => UserFacingError::new(
                "invalid-transition",
                format!("plan {} learn status is {} and cannot move to {}", id, from, to),
            ),
            LifecycleError::Plan(inner) => inner.into(),
            LifecycleError::Vcs(inner) => inner.into(),
            LifecycleError::Dispatch(_) => {
                UserFacingError::new("dispatch-failed", "the implementation workflow could not be triggered")
                    .with_remediation("retry the dispatch; an existing branch will be reused")
            }
        }
    }
}

impl From<&PipelineError> for UserFacingError {
    fn from(err: &PipelineError) -> Self {
        match err {
            PipelineError::InsufficientInputs { task, failures, .. } => UserFacingError::new(
                "insufficient-inputs",
                format!("task '{}' has no verified inputs; failed upstream: {}", task, failures.join(", ")),
            )
            .with_remediation("inspect the run directory for the failed analysis tasks"),
            PipelineError::VerificationFailed { task, path, reason } => UserFacingError::new(
                "verification-failed",
                format!("input {} for task '{}' is {}", path.display(), task, reason),
            ),
            PipelineError::DuplicateTask(_)
            | PipelineError::UnknownDependency { .. }
            | PipelineError::Cycle(_)
            | PipelineError::InvalidShape(_)
            | PipelineError::InvalidTaskId(_) => UserFacingError::new("invalid-pipeline", err.to_string()),
            PipelineError::OutputExists(path) => UserFacingError::new(
                "output-exists",
                format!("{} was already written by another run", path.display()),
            )
            .with_remediation("use a fresh run id"),
            PipelineError::RunDir { path, .. } => UserFacingError::new(
                "scratch-unavailable",
                format!("could not prepare {}", path.display()),
            )
            .with_remediation("check [pipeline] scratch_root in planwright.toml"),
            PipelineError::OutputCheck { path, .. } => UserFacingError::new(
                "scratch-unavailable",
                format!("could not check {}", path.display()),
            )
            .with_remediation("check [pipeline] scratch_root in planwright.toml"),
            PipelineError::Join(_) => UserFacingError::new("run-aborted", "the pipeline run was aborted"),
        }
    }
}

impl From<&PreprocessError> for UserFacingError {
    fn from(err: &PreprocessError) -> Self {
        match err {
            PreprocessError::Read { path, .. } => UserFacingError::new(
                "session-unreadable",
                format!("could not read session log {}", path.display()),
            ),
            PreprocessError::Discover { path, .. } => UserFacingError::new(
                "session-unreadable",
                format!("could not list session logs under {}", path.display()),
            ),
            PreprocessError::Write { path, .. } => UserFacingError::new(
                "scratch-unavailable",
                format!("could not write {}", path.display()),
            ),
            PreprocessError::ChunkExists { path } => UserFacingError::new(
                "chunk-collision",
                format!("{} was already written", path.display()),
            )
            .with_remediation("give each session log a distinct file name, or use an empty output directory"),
        }
    }
}

impl From<&VcsError> for UserFacingError {
    fn from(err: &VcsError) -> Self {
        match err {
            VcsError::UnknownRef(name) => {
                UserFacingError::new("vcs-failed", format!("git has no branch or revision '{}'", name))
            }
            _ => UserFacingError::new("vcs-failed", "a git operation failed")
                .with_remediation("check that the repository is reachable and the branch names are valid"),
        }
    }
}

impl From<&LearnError> for UserFacingError {
    fn from(err: &LearnError) -> Self {
        match err {
            LearnError::Lifecycle(inner) => inner.into(),
            LearnError::Plan(inner) => inner.into(),
            LearnError::Pipeline(inner) => inner.into(),
            LearnError::Preprocess(inner) => inner.into(),
            LearnError::NoSessionContent(id) => UserFacingError::new(
                "no-session-content",
                format!("the sessions for plan {} contain nothing to analyze", id),
            )
            .with_remediation("pass at least one non-empty --session log"),
            LearnError::SynthesisFailed { run_id, .. } => UserFacingError::new(
                "synthesis-failed",
                format!("run {} finished without a synthesized plan", run_id),
            ),
            LearnError::Io { path, .. } => {
                UserFacingError::new("io-failed", format!("could not access {}", path.display()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_error_corrupted_carries_id() {
        let err = PlanError::corrupted(PlanId(42), "plan-header missing");
        match &err {
            PlanError::CorruptedState { id, reason } => {
                assert_eq!(*id, PlanId(42));
                assert_eq!(reason, "plan-header missing");
            }
            _ => panic!("Expected CorruptedState"),
        }
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn lifecycle_error_converts_from_plan_error() {
        let inner = PlanError::Backend(RemoteError::Transport("connection reset".into()));
        let err: LifecycleError = inner.into();
        assert!(matches!(err, LifecycleError::Plan(PlanError::Backend(_))));
    }

    #[test]
    fn user_facing_error_hides_transport_text() {
        let err = PlanError::Backend(RemoteError::Transport("tls handshake eof at 10.0.0.1".into()));
        let user: UserFacingError = (&err).into();
        assert_eq!(user.kind, "backend-unavailable");
        assert!(!user.detail.contains("10.0.0.1"));
        assert!(!user.remediation.is_empty());
    }

    #[test]
    fn missing_token_names_the_variable() {
        let user: UserFacingError = (&RemoteError::MissingCredentials("GITHUB_TOKEN")).into();
        assert_eq!(user.kind, "missing-credentials");
        assert!(user.remediation[0].contains("GITHUB_TOKEN"));
    }

    #[test]
    fn insufficient_inputs_is_distinct_kind() {
        let err = PipelineError::InsufficientInputs {
            task: "synthesize".into(),
            expected: 3,
            failures: vec!["a".into(), "b".into(), "c".into()],
        };
        let user: UserFacingError = (&err).into();
        assert_eq!(user.kind, "insufficient-inputs");
        assert!(user.detail.contains("synthesize"));
    }

    #[test]
    fn user_facing_error_display_lists_hints() {
        let err = UserFacingError::new("plan-not-found", "plan 7 does not exist")
            .with_remediation("check the plan number");
        let text = err.to_string();
        assert!(text.starts_with("error[plan-not-found]: plan 7 does not exist"));
        assert!(text.contains("hint: check the plan number"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&CodecError::InvalidKey("X".into()));
        assert_std_error(&LifecycleError::PlanNotFound(PlanId(1)));
        assert_std_error(&PipelineError::Cycle(vec![]));
        assert_std_error(&LearnError::NoSessionContent(PlanId(1)));
        assert_std_error(&UserFacingError::new("k", "d"));
    }
}
