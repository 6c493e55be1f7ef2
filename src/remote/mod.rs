//! Collaborators consumed by the core.
//!
//! Plans are stored in a remote issue tracker, branches live in git, and
//! implementation work is kicked off through a workflow dispatcher. Each is a
//! trait here so the backends and lifecycle can be exercised against the
//! in-memory implementations in [`memory`].

pub mod generator;
pub mod git;
pub mod github;
pub mod memory;

use crate::errors::{RemoteError, VcsError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An issue as returned by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteIssue {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

/// A pull request as returned by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePull {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub author: String,
    pub head: String,
    pub base: String,
    pub draft: bool,
    pub created_at: DateTime<Utc>,
}

/// A comment on an issue or pull request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteComment {
    pub id: u64,
    pub body: String,
    pub author: String,
}

/// Parameters for opening a pull request.
#[derive(Debug, Clone)]
pub struct NewPull {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
    pub draft: bool,
}

/// A branch known to version control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchInfo {
    pub name: String,
    /// Commit time of the branch tip.
    pub tip_time: DateTime<Utc>,
    /// True when the branch exists on the remote.
    pub remote: bool,
}

/// Size of the change between a branch and its base.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub files_changed: usize,
    pub insertions: usize,
    pub deletions: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.files_changed == 0
    }
}

/// Issue, pull request and comment storage.
///
/// Getters return `Ok(None)` for entities that do not exist. Mutations on
/// absent entities fail with a 404 `RemoteError::Status`; callers check
/// existence first.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn create_issue(
        &self,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<RemoteIssue, RemoteError>;

    async fn get_issue(&self, number: u64) -> Result<Option<RemoteIssue>, RemoteError>;

    async fn update_issue_body(&self, number: u64, body: &str) -> Result<(), RemoteError>;

    async fn create_pull(&self, pull: NewPull) -> Result<RemotePull, RemoteError>;

    async fn get_pull(&self, number: u64) -> Result<Option<RemotePull>, RemoteError>;

    async fn update_pull_body(&self, number: u64, body: &str) -> Result<(), RemoteError>;

    /// Comments on an issue or pull request, oldest first.
    async fn list_comments(&self, number: u64) -> Result<Vec<RemoteComment>, RemoteError>;

    async fn get_comment(&self, comment_id: u64) -> Result<Option<RemoteComment>, RemoteError>;

    async fn create_comment(&self, number: u64, body: &str) -> Result<RemoteComment, RemoteError>;

    async fn update_comment(&self, comment_id: u64, body: &str) -> Result<(), RemoteError>;

    /// Adding a label that is already present is a no-op.
    async fn add_label(&self, number: u64, label: &str) -> Result<(), RemoteError>;

    /// Create `name` on the remote pointing at the tip of `from`.
    async fn create_remote_branch(&self, name: &str, from: &str) -> Result<(), RemoteError>;

    /// Commit a single file to `branch`, creating or replacing it.
    async fn commit_file(
        &self,
        branch: &str,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<(), RemoteError>;
}

/// Branch operations on the working repository.
#[async_trait]
pub trait Vcs: Send + Sync {
    async fn list_branches(&self) -> Result<Vec<BranchInfo>, VcsError>;

    async fn branch_exists(&self, name: &str) -> Result<bool, VcsError>;

    /// Create `name` from `base`. Fails with `BranchExists` if already present.
    async fn create_branch(&self, name: &str, base: &str) -> Result<(), VcsError>;

    async fn push_branch(&self, name: &str) -> Result<(), VcsError>;

    async fn diff_summary(&self, branch: &str, base: &str) -> Result<DiffSummary, VcsError>;
}

/// Triggers a named remote workflow.
#[async_trait]
pub trait WorkflowDispatcher: Send + Sync {
    /// Start `workflow` with the given inputs and return the run id.
    async fn dispatch(
        &self,
        workflow: &str,
        inputs: &BTreeMap<String, String>,
    ) -> Result<String, RemoteError>;
}

/// Generative text. Used by the optional noise judge and by pipeline tasks.
///
/// This trait exists to allow mocking in tests.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> anyhow::Result<String>;
}
