//! Wiring of the real adapters behind the library's traits.

use anyhow::{Context, Result};
use planwright::config::PlanwrightConfig;
use planwright::errors::UserFacingError;
use planwright::lifecycle::Lifecycle;
use planwright::plan::{BackendProvider, DraftPrBackend, IssueBackend, PlanBackend};
use planwright::remote::git::GitRepo;
use planwright::remote::github::{GitHubStore, parse_owner_repo_from_url};
use std::sync::Arc;
use tracing::debug;

const REMOTE: &str = "origin";
const DEFAULT_ACTOR: &str = "planwright";

/// `owner/repo` from config or environment, else from the `origin` remote.
pub fn repo_slug(config: &PlanwrightConfig) -> Result<String> {
    if let Some(repo) = &config.toml.backend.repo {
        return Ok(repo.clone());
    }
    let from_remote = git2::Repository::discover(&config.project_dir)
        .ok()
        .and_then(|repo| {
            let url = repo.find_remote(REMOTE).ok()?.url()?.to_string();
            parse_owner_repo_from_url(&url)
        });
    match from_remote {
        Some(slug) => {
            debug!(repo = %slug, "Derived repository from git remote");
            Ok(slug)
        }
        None => Err(UserFacingError::new("missing-repo", "no repository is configured")
            .with_remediation("set [backend] repo in .planwright/planwright.toml or export PLANWRIGHT_REPO")
            .into()),
    }
}

/// Name recorded as `created_by` on new plans.
fn actor(config: &PlanwrightConfig) -> String {
    git2::Repository::discover(&config.project_dir)
        .ok()
        .and_then(|repo| repo.config().ok()?.get_string("user.name").ok())
        .unwrap_or_else(|| DEFAULT_ACTOR.to_string())
}

fn store(config: &PlanwrightConfig) -> Result<Arc<GitHubStore>> {
    let repo = repo_slug(config)?;
    Ok(Arc::new(GitHubStore::from_env(repo, config.toml.backend.trunk.clone())?))
}

fn backend_over(config: &PlanwrightConfig, store: Arc<GitHubStore>) -> Arc<dyn PlanBackend> {
    let actor = actor(config);
    match config.toml.backend.provider {
        BackendProvider::Issue => Arc::new(IssueBackend::new(store, actor)),
        BackendProvider::DraftPr => Arc::new(DraftPrBackend::new(store, actor, config.toml.backend.trunk.clone())),
    }
}

/// The configured plan backend.
pub fn open_backend(config: &PlanwrightConfig) -> Result<Arc<dyn PlanBackend>> {
    Ok(backend_over(config, store(config)?))
}

/// A lifecycle over the configured backend, the project's git repository
/// and GitHub workflow dispatch.
pub fn open_lifecycle(config: &PlanwrightConfig) -> Result<Arc<Lifecycle>> {
    let store = store(config)?;
    let backend = backend_over(config, store.clone());
    let vcs = GitRepo::new(&config.project_dir, Some(REMOTE.to_string()))
        .with_context(|| format!("{} is not a git repository", config.project_dir.display()))?;
    Ok(Arc::new(Lifecycle::new(
        backend,
        Arc::new(vcs),
        store,
        config.toml.lifecycle_config(),
    )))
}
