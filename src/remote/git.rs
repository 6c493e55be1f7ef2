use super::{BranchInfo, DiffSummary, Vcs};
use crate::errors::VcsError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use git2::{BranchType, Commit, Repository};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Git-backed branch operations.
///
/// The repository is reopened for every call so no `git2::Repository` is
/// held across an await point.
pub struct GitRepo {
    path: PathBuf,
    remote: Option<String>,
}

impl GitRepo {
    /// Open the repository at `path`. `remote` is the name pushes go to;
    /// `None` keeps everything local.
    pub fn new(path: &Path, remote: Option<String>) -> Result<Self, VcsError> {
        Repository::open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            remote,
        })
    }

    fn open(&self) -> Result<Repository, VcsError> {
        Ok(Repository::open(&self.path)?)
    }

    /// Resolve a branch or revision, trying the remote-tracking ref last.
    fn resolve_commit<'r>(&self, repo: &'r Repository, name: &str) -> Result<Commit<'r>, VcsError> {
        if let Ok(obj) = repo.revparse_single(name) {
            return Ok(obj.peel_to_commit()?);
        }
        if let Some(remote) = &self.remote
            && let Ok(obj) = repo.revparse_single(&format!("refs/remotes/{}/{}", remote, name))
        {
            return Ok(obj.peel_to_commit()?);
        }
        Err(VcsError::UnknownRef(name.to_string()))
    }
}

fn commit_time(commit: &Commit<'_>) -> DateTime<Utc> {
    DateTime::from_timestamp(commit.time().seconds(), 0).unwrap_or_default()
}

#[async_trait]
impl Vcs for GitRepo {
    async fn list_branches(&self) -> Result<Vec<BranchInfo>, VcsError> {
        let repo = self.open()?;
        let mut found: BTreeMap<String, BranchInfo> = BTreeMap::new();

        for entry in repo.branches(None)? {
            let (branch, kind) = entry?;
            let Some(full_name) = branch.name()?.map(str::to_string) else {
                continue;
            };
            let name = match kind {
                BranchType::Local => full_name,
                BranchType::Remote => {
                    let Some(remote) = &self.remote else { continue };
                    match full_name.strip_prefix(&format!("{}/", remote)) {
                        Some("HEAD") | None => continue,
                        Some(short) => short.to_string(),
                    }
                }
            };
            let tip_time = commit_time(&branch.get().peel_to_commit()?);
            let is_remote = kind == BranchType::Remote;

            found
                .entry(name.clone())
                .and_modify(|info| {
                    info.remote |= is_remote;
                    info.tip_time = info.tip_time.max(tip_time);
                })
                .or_insert(BranchInfo {
                    name,
                    tip_time,
                    remote: is_remote,
                });
        }

        Ok(found.into_values().collect())
    }

    async fn branch_exists(&self, name: &str) -> Result<bool, VcsError> {
        let repo = self.open()?;
        if repo.find_branch(name, BranchType::Local).is_ok() {
            return Ok(true);
        }
        Ok(match &self.remote {
            Some(remote) => repo
                .find_branch(&format!("{}/{}", remote, name), BranchType::Remote)
                .is_ok(),
            None => false,
        })
    }

    async fn create_branch(&self, name: &str, base: &str) -> Result<(), VcsError> {
        let repo = self.open()?;
        if repo.find_branch(name, BranchType::Local).is_ok() {
            return Err(VcsError::BranchExists(name.to_string()));
        }
        let commit = self.resolve_commit(&repo, base)?;
        repo.branch(name, &commit, false)?;
        Ok(())
    }

    async fn push_branch(&self, name: &str) -> Result<(), VcsError> {
        let Some(remote) = &self.remote else {
            tracing::debug!(branch = %name, "No remote configured, skipping push");
            return Ok(());
        };

        let output = Command::new("git")
            .args(["push", "-u", remote, name])
            .current_dir(&self.path)
            .output()
            .await
            .map_err(|e| VcsError::Command(format!("failed to run git push: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VcsError::Command(format!(
                "git push {} {} failed: {}",
                remote,
                name,
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn diff_summary(&self, branch: &str, base: &str) -> Result<DiffSummary, VcsError> {
        let repo = self.open()?;
        let head = self.resolve_commit(&repo, branch)?;
        let base_commit = self.resolve_commit(&repo, base)?;
        let merge_base = repo.merge_base(head.id(), base_commit.id())?;
        let base_tree = repo.find_commit(merge_base)?.tree()?;
        let head_tree = head.tree()?;

        let diff = repo.diff_tree_to_tree(Some(&base_tree), Some(&head_tree), None)?;
        let stats = diff.stats()?;
        Ok(DiffSummary {
            files_changed: stats.files_changed(),
            insertions: stats.insertions(),
            deletions: stats.deletions(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn setup_repo() -> (tempfile::TempDir, String) {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);

        fs::write(dir.path().join("README.md"), "hello\n").unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("test", "test@test.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap();

        let trunk = repo.head().unwrap().shorthand().unwrap().to_string();
        (dir, trunk)
    }

    /// Commit a file directly onto `branch` without touching the worktree.
    fn commit_to_branch(dir: &Path, branch: &str, name: &str, content: &str) {
        let repo = Repository::open(dir).unwrap();
        let reference = format!("refs/heads/{}", branch);
        let parent = repo
            .find_reference(&reference)
            .unwrap()
            .peel_to_commit()
            .unwrap();
        let blob = repo.blob(content.as_bytes()).unwrap();
        let mut builder = repo.treebuilder(Some(&parent.tree().unwrap())).unwrap();
        builder.insert(name, blob, 0o100644).unwrap();
        let tree = repo.find_tree(builder.write().unwrap()).unwrap();
        let sig = git2::Signature::now("test", "test@test.com").unwrap();
        repo.commit(Some(&reference), &sig, &sig, "change", &tree, &[&parent])
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_and_list_branches() {
        let (dir, trunk) = setup_repo();
        let git = GitRepo::new(dir.path(), None).unwrap();

        git.create_branch("P12-fix-login", &trunk).await.unwrap();
        assert!(git.branch_exists("P12-fix-login").await.unwrap());

        let names: Vec<String> = git
            .list_branches()
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert!(names.contains(&"P12-fix-login".to_string()));
        assert!(names.contains(&trunk));
    }

    #[tokio::test]
    async fn test_create_existing_branch_fails() {
        let (dir, trunk) = setup_repo();
        let git = GitRepo::new(dir.path(), None).unwrap();
        git.create_branch("P1-a", &trunk).await.unwrap();
        assert!(matches!(
            git.create_branch("P1-a", &trunk).await,
            Err(VcsError::BranchExists(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_base_is_error() {
        let (dir, _) = setup_repo();
        let git = GitRepo::new(dir.path(), None).unwrap();
        assert!(matches!(
            git.create_branch("P1-a", "does-not-exist").await,
            Err(VcsError::UnknownRef(_))
        ));
    }

    #[tokio::test]
    async fn test_diff_summary_detects_changes() {
        let (dir, trunk) = setup_repo();
        let git = GitRepo::new(dir.path(), None).unwrap();
        git.create_branch("P3-work", &trunk).await.unwrap();

        let diff = git.diff_summary("P3-work", &trunk).await.unwrap();
        assert!(diff.is_empty());

        commit_to_branch(dir.path(), "P3-work", "new.txt", "one\ntwo\n");
        let diff = git.diff_summary("P3-work", &trunk).await.unwrap();
        assert_eq!(diff.files_changed, 1);
        assert_eq!(diff.insertions, 2);
    }

    #[tokio::test]
    async fn test_push_without_remote_is_noop() {
        let (dir, trunk) = setup_repo();
        let git = GitRepo::new(dir.path(), None).unwrap();
        git.create_branch("P4-x", &trunk).await.unwrap();
        git.push_branch("P4-x").await.unwrap();
    }
}
