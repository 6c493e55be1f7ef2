//! In-memory collaborators.
//!
//! Used by the test suites and by dry runs. They follow the same contracts as
//! the real adapters: absent entities read as `None`, mutations on absent
//! entities fail with a 404 status, and labels are idempotent.

use super::{
    BranchInfo, DiffSummary, NewPull, RemoteComment, RemoteIssue, RemotePull, RemoteStore, Vcs,
    WorkflowDispatcher,
};
use crate::errors::{RemoteError, VcsError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn not_found(what: &str, id: impl std::fmt::Display) -> RemoteError {
    RemoteError::Status {
        status: 404,
        message: format!("{} {} not found", what, id),
    }
}

#[derive(Debug, Default)]
struct StoreState {
    next_number: u64,
    next_comment_id: u64,
    issues: BTreeMap<u64, RemoteIssue>,
    pulls: BTreeMap<u64, RemotePull>,
    /// comment id -> (parent number, comment)
    comments: BTreeMap<u64, (u64, RemoteComment)>,
    branches: BTreeSet<String>,
    files: BTreeMap<(String, String), String>,
    unreachable: bool,
}

/// An issue tracker held in memory. Issues and pull requests share one
/// number sequence, like the real service.
#[derive(Debug)]
pub struct MemoryStore {
    user: String,
    state: Mutex<StoreState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("main")
    }
}

impl MemoryStore {
    /// A store whose remote already has the `trunk` branch.
    pub fn new(trunk: &str) -> Self {
        let mut state = StoreState {
            next_number: 1,
            next_comment_id: 1000,
            ..Default::default()
        };
        state.branches.insert(trunk.to_string());
        Self {
            user: "planwright-bot".to_string(),
            state: Mutex::new(state),
        }
    }

    /// Make every subsequent call fail with a transport error.
    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.state).unreachable = unreachable;
    }

    /// Replace an issue body or pull description without going through a
    /// backend. Used to simulate hand edits and corruption.
    pub fn overwrite_document(&self, number: u64, body: &str) {
        let mut state = lock(&self.state);
        if let Some(issue) = state.issues.get_mut(&number) {
            issue.body = body.to_string();
        } else if let Some(pull) = state.pulls.get_mut(&number) {
            pull.body = body.to_string();
        }
    }

    pub fn delete_comment(&self, comment_id: u64) {
        lock(&self.state).comments.remove(&comment_id);
    }

    /// Comments on `number`, oldest first.
    pub fn comments(&self, number: u64) -> Vec<RemoteComment> {
        lock(&self.state)
            .comments
            .values()
            .filter(|(parent, _)| *parent == number)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn has_remote_branch(&self, name: &str) -> bool {
        lock(&self.state).branches.contains(name)
    }

    pub fn file(&self, branch: &str, path: &str) -> Option<String> {
        lock(&self.state)
            .files
            .get(&(branch.to_string(), path.to_string()))
            .cloned()
    }

    fn check_reachable(state: &StoreState) -> Result<(), RemoteError> {
        if state.unreachable {
            Err(RemoteError::Transport("connection refused".to_string()))
        } else {
            Ok(())
        }
    }

    fn allocate_number(state: &mut StoreState) -> u64 {
        let number = state.next_number;
        state.next_number += 1;
        number
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn create_issue(
        &self,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<RemoteIssue, RemoteError> {
        let mut state = lock(&self.state);
        Self::check_reachable(&state)?;
        let number = Self::allocate_number(&mut state);
        let mut unique: Vec<String> = Vec::new();
        for label in labels {
            if !unique.contains(label) {
                unique.push(label.clone());
            }
        }
        let issue = RemoteIssue {
            number,
            title: title.to_string(),
            body: body.to_string(),
            labels: unique,
            author: self.user.clone(),
            created_at: Utc::now(),
        };
        state.issues.insert(number, issue.clone());
        Ok(issue)
    }

    async fn get_issue(&self, number: u64) -> Result<Option<RemoteIssue>, RemoteError> {
        let state = lock(&self.state);
        Self::check_reachable(&state)?;
        Ok(state.issues.get(&number).cloned())
    }

    async fn update_issue_body(&self, number: u64, body: &str) -> Result<(), RemoteError> {
        let mut state = lock(&self.state);
        Self::check_reachable(&state)?;
        let issue = state
            .issues
            .get_mut(&number)
            .ok_or_else(|| not_found("issue", number))?;
        issue.body = body.to_string();
        Ok(())
    }

    async fn create_pull(&self, pull: NewPull) -> Result<RemotePull, RemoteError> {
        let mut state = lock(&self.state);
        Self::check_reachable(&state)?;
        if !state.branches.contains(&pull.head) {
            return Err(RemoteError::Status {
                status: 422,
                message: format!("head branch '{}' does not exist", pull.head),
            });
        }
        let number = Self::allocate_number(&mut state);
        let created = RemotePull {
            number,
            title: pull.title,
            body: pull.body,
            labels: Vec::new(),
            author: self.user.clone(),
            head: pull.head,
            base: pull.base,
            draft: pull.draft,
            created_at: Utc::now(),
        };
        state.pulls.insert(number, created.clone());
        Ok(created)
    }

    async fn get_pull(&self, number: u64) -> Result<Option<RemotePull>, RemoteError> {
        let state = lock(&self.state);
        Self::check_reachable(&state)?;
        Ok(state.pulls.get(&number).cloned())
    }

    async fn update_pull_body(&self, number: u64, body: &str) -> Result<(), RemoteError> {
        let mut state = lock(&self.state);
        Self::check_reachable(&state)?;
        let pull = state
            .pulls
            .get_mut(&number)
            .ok_or_else(|| not_found("pull request", number))?;
        pull.body = body.to_string();
        Ok(())
    }

    async fn list_comments(&self, number: u64) -> Result<Vec<RemoteComment>, RemoteError> {
        let state = lock(&self.state);
        Self::check_reachable(&state)?;
        if !state.issues.contains_key(&number) && !state.pulls.contains_key(&number) {
            return Err(not_found("issue", number));
        }
        Ok(state
            .comments
            .values()
            .filter(|(parent, _)| *parent == number)
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn get_comment(&self, comment_id: u64) -> Result<Option<RemoteComment>, RemoteError> {
        let state = lock(&self.state);
        Self::check_reachable(&state)?;
        Ok(state.comments.get(&comment_id).map(|(_, c)| c.clone()))
    }

    async fn create_comment(&self, number: u64, body: &str) -> Result<RemoteComment, RemoteError> {
        let mut state = lock(&self.state);
        Self::check_reachable(&state)?;
        if !state.issues.contains_key(&number) && !state.pulls.contains_key(&number) {
            return Err(not_found("issue", number));
        }
        let id = state.next_comment_id;
        state.next_comment_id += 1;
        let comment = RemoteComment {
            id,
            body: body.to_string(),
            author: self.user.clone(),
        };
        state.comments.insert(id, (number, comment.clone()));
        Ok(comment)
    }

    async fn update_comment(&self, comment_id: u64, body: &str) -> Result<(), RemoteError> {
        let mut state = lock(&self.state);
        Self::check_reachable(&state)?;
        let (_, comment) = state
            .comments
            .get_mut(&comment_id)
            .ok_or_else(|| not_found("comment", comment_id))?;
        comment.body = body.to_string();
        Ok(())
    }

    async fn add_label(&self, number: u64, label: &str) -> Result<(), RemoteError> {
        let mut state = lock(&self.state);
        Self::check_reachable(&state)?;
        let state = &mut *state;
        let labels = match (state.issues.get_mut(&number), state.pulls.get_mut(&number)) {
            (Some(issue), _) => &mut issue.labels,
            (None, Some(pull)) => &mut pull.labels,
            (None, None) => return Err(not_found("issue", number)),
        };
        if !labels.iter().any(|l| l == label) {
            labels.push(label.to_string());
        }
        Ok(())
    }

    async fn create_remote_branch(&self, name: &str, from: &str) -> Result<(), RemoteError> {
        let mut state = lock(&self.state);
        Self::check_reachable(&state)?;
        if !state.branches.contains(from) {
            return Err(RemoteError::Status {
                status: 422,
                message: format!("base branch '{}' does not exist", from),
            });
        }
        state.branches.insert(name.to_string());
        Ok(())
    }

    async fn commit_file(
        &self,
        branch: &str,
        path: &str,
        content: &str,
        _message: &str,
    ) -> Result<(), RemoteError> {
        let mut state = lock(&self.state);
        Self::check_reachable(&state)?;
        if !state.branches.contains(branch) {
            return Err(not_found("branch", branch));
        }
        state
            .files
            .insert((branch.to_string(), path.to_string()), content.to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct VcsState {
    branches: BTreeMap<String, BranchInfo>,
    changes: HashMap<String, DiffSummary>,
    pushed: Vec<String>,
}

/// A repository held in memory.
#[derive(Debug)]
pub struct MemoryVcs {
    state: Mutex<VcsState>,
}

impl MemoryVcs {
    pub fn new(trunk: &str) -> Self {
        let vcs = Self {
            state: Mutex::new(VcsState::default()),
        };
        vcs.add_branch(trunk, Utc::now());
        vcs
    }

    /// Register an existing remote branch with a known tip time.
    pub fn add_branch(&self, name: &str, tip_time: DateTime<Utc>) {
        lock(&self.state).branches.insert(
            name.to_string(),
            BranchInfo {
                name: name.to_string(),
                tip_time,
                remote: true,
            },
        );
    }

    pub fn delete_branch(&self, name: &str) {
        lock(&self.state).branches.remove(name);
    }

    /// Set the diff reported between `branch` and any base.
    pub fn set_changes(&self, branch: &str, diff: DiffSummary) {
        lock(&self.state).changes.insert(branch.to_string(), diff);
    }

    pub fn branch_names(&self) -> Vec<String> {
        lock(&self.state).branches.keys().cloned().collect()
    }

    /// Branches pushed so far, in push order.
    pub fn pushed(&self) -> Vec<String> {
        lock(&self.state).pushed.clone()
    }
}

#[async_trait]
impl Vcs for MemoryVcs {
    async fn list_branches(&self) -> Result<Vec<BranchInfo>, VcsError> {
        Ok(lock(&self.state).branches.values().cloned().collect())
    }

    async fn branch_exists(&self, name: &str) -> Result<bool, VcsError> {
        Ok(lock(&self.state).branches.contains_key(name))
    }

    async fn create_branch(&self, name: &str, base: &str) -> Result<(), VcsError> {
        let mut state = lock(&self.state);
        if state.branches.contains_key(name) {
            return Err(VcsError::BranchExists(name.to_string()));
        }
        if !state.branches.contains_key(base) {
            return Err(VcsError::UnknownRef(base.to_string()));
        }
        state.branches.insert(
            name.to_string(),
            BranchInfo {
                name: name.to_string(),
                tip_time: Utc::now(),
                remote: false,
            },
        );
        Ok(())
    }

    async fn push_branch(&self, name: &str) -> Result<(), VcsError> {
        let mut state = lock(&self.state);
        let branch = state
            .branches
            .get_mut(name)
            .ok_or_else(|| VcsError::UnknownRef(name.to_string()))?;
        branch.remote = true;
        state.pushed.push(name.to_string());
        Ok(())
    }

    async fn diff_summary(&self, branch: &str, base: &str) -> Result<DiffSummary, VcsError> {
        let state = lock(&self.state);
        for name in [branch, base] {
            if !state.branches.contains_key(name) {
                return Err(VcsError::UnknownRef(name.to_string()));
            }
        }
        Ok(state.changes.get(branch).copied().unwrap_or_default())
    }
}

/// Records dispatches and hands out sequential run ids.
#[derive(Debug, Default)]
pub struct MemoryDispatcher {
    dispatches: Mutex<Vec<(String, BTreeMap<String, String>)>>,
    failing: Mutex<bool>,
}

impl MemoryDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *lock(&self.failing) = failing;
    }

    pub fn dispatches(&self) -> Vec<(String, BTreeMap<String, String>)> {
        lock(&self.dispatches).clone()
    }
}

#[async_trait]
impl WorkflowDispatcher for MemoryDispatcher {
    async fn dispatch(
        &self,
        workflow: &str,
        inputs: &BTreeMap<String, String>,
    ) -> Result<String, RemoteError> {
        if *lock(&self.failing) {
            return Err(RemoteError::Status {
                status: 500,
                message: "workflow dispatch failed".to_string(),
            });
        }
        let mut dispatches = lock(&self.dispatches);
        dispatches.push((workflow.to_string(), inputs.clone()));
        Ok(format!("run-{}", dispatches.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_issues_and_pulls_share_numbering() {
        let store = MemoryStore::new("main");
        let issue = store.create_issue("a", "", &[]).await.unwrap();
        store.create_remote_branch("feature", "main").await.unwrap();
        let pull = store
            .create_pull(NewPull {
                title: "b".into(),
                body: String::new(),
                head: "feature".into(),
                base: "main".into(),
                draft: true,
            })
            .await
            .unwrap();
        assert_eq!(issue.number, 1);
        assert_eq!(pull.number, 2);
        assert!(store.get_issue(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_labels_are_idempotent() {
        let store = MemoryStore::default();
        let issue = store.create_issue("a", "", &["plan".into()]).await.unwrap();
        store.add_label(issue.number, "plan").await.unwrap();
        store.add_label(issue.number, "extra").await.unwrap();
        let issue = store.get_issue(issue.number).await.unwrap().unwrap();
        assert_eq!(issue.labels, vec!["plan".to_string(), "extra".to_string()]);
    }

    #[tokio::test]
    async fn test_unreachable_store_errors() {
        let store = MemoryStore::default();
        store.set_unreachable(true);
        assert!(matches!(
            store.get_issue(1).await,
            Err(RemoteError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_vcs_create_and_push() {
        let vcs = MemoryVcs::new("main");
        vcs.create_branch("P1-x", "main").await.unwrap();
        assert!(matches!(
            vcs.create_branch("P1-x", "main").await,
            Err(VcsError::BranchExists(_))
        ));
        vcs.push_branch("P1-x").await.unwrap();
        assert_eq!(vcs.pushed(), vec!["P1-x".to_string()]);
        assert!(vcs.diff_summary("P1-x", "main").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatcher_records_inputs() {
        let dispatcher = MemoryDispatcher::new();
        let mut inputs = BTreeMap::new();
        inputs.insert("plan_id".to_string(), "7".to_string());
        let run = dispatcher.dispatch("implement.yml", &inputs).await.unwrap();
        assert_eq!(run, "run-1");
        assert_eq!(dispatcher.dispatches()[0].1["plan_id"], "7");
    }
}
