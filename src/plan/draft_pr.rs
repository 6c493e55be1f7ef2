//! Draft-PR-backed plans.
//!
//! The pull-request description is one document: the `plan-header` block, a
//! fixed delimiter line, then the plan body verbatim. A staging file is
//! committed to the head branch so the remote has a diff to render.

use super::backend::{initial_header, render_event};
use super::{
    BackendProvider, CreatePlanRequest, HEADER_KEY, Lookup, Mutation, Plan, PlanBackend, PlanId,
    keys,
};
use crate::errors::PlanError;
use crate::metadata::{self, ContainerLocation, Fields, MetadataBlock};
use crate::remote::{NewPull, RemotePull, RemoteStore};
use crate::resolver::naming::slugify;
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info};
use uuid::Uuid;

/// Separates the header from the body in the PR description.
pub const BODY_DELIMITER: &str = "<!-- plan-body -->";
/// Prefix of head branches created for draft plans.
pub const DRAFT_BRANCH_PREFIX: &str = "plan-draft/";
/// Directory of staging files committed to draft branches.
pub const STAGING_DIR: &str = ".plan";

static DELIMITER_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^<!-- plan-body -->[ \t]*$").unwrap());

/// Join a rendered header and a body into one description.
pub fn compose_document(header: &str, body: &str) -> String {
    format!("{}\n\n{}\n\n{}", header.trim_end(), BODY_DELIMITER, body)
}

/// Split a description into header text and body. `None` when the
/// delimiter is missing.
pub fn split_document(document: &str) -> Option<(&str, &str)> {
    let delimiter = DELIMITER_LINE.find(document)?;
    let header = &document[..delimiter.start()];
    let rest = &document[delimiter.end()..];
    let body = rest
        .strip_prefix("\n\n")
        .or_else(|| rest.strip_prefix('\n'))
        .unwrap_or(rest);
    Some((header, body))
}

pub struct DraftPrBackend {
    store: Arc<dyn RemoteStore>,
    actor: String,
    base_branch: String,
}

impl DraftPrBackend {
    /// `base_branch` is the trunk draft branches are cut from.
    pub fn new(
        store: Arc<dyn RemoteStore>,
        actor: impl Into<String>,
        base_branch: impl Into<String>,
    ) -> Self {
        Self {
            store,
            actor: actor.into(),
            base_branch: base_branch.into(),
        }
    }

    fn render_header(header: &Fields) -> Result<String, PlanError> {
        let encoded = metadata::encode(HEADER_KEY, header)?;
        Ok(metadata::render_collapsible(HEADER_KEY, &encoded))
    }

    /// Fetch the pull request and split its description.
    async fn fetch(&self, id: PlanId) -> Result<Option<(RemotePull, MetadataBlock, String)>, PlanError> {
        let Some(pull) = self.store.get_pull(id.0).await? else {
            return Ok(None);
        };
        let (header_text, body) = split_document(&pull.body)
            .ok_or_else(|| PlanError::corrupted(id, "plan-body delimiter missing from description"))?;
        let header = MetadataBlock::read(header_text, HEADER_KEY, ContainerLocation::PrimaryDocument)?
            .ok_or_else(|| PlanError::corrupted(id, "plan-header block missing from description"))?;
        let body = body.to_string();
        Ok(Some((pull, header, body)))
    }

    async fn write(&self, pull: &RemotePull, header: &Fields, body: &str) -> Result<(), PlanError> {
        let header_text = match split_document(&pull.body) {
            Some((existing, _)) => metadata::replace_block(existing, HEADER_KEY, header)?,
            None => Self::render_header(header)?,
        };
        let document = compose_document(&header_text, body);
        self.store.update_pull_body(pull.number, &document).await?;
        Ok(())
    }
}

#[async_trait]
impl PlanBackend for DraftPrBackend {
    fn provider(&self) -> BackendProvider {
        BackendProvider::DraftPr
    }

    async fn create_plan(&self, request: CreatePlanRequest) -> Result<Plan, PlanError> {
        let slug = slugify(&request.title, 40);
        let suffix = Uuid::new_v4().simple().to_string();
        let head = format!("{}{}-{}", DRAFT_BRANCH_PREFIX, slug, &suffix[..8]);

        self.store.create_remote_branch(&head, &self.base_branch).await?;
        let staging_path = format!("{}/{}.md", STAGING_DIR, slug);
        let staging = format!("# {}\n\n{}", request.title, request.body);
        self.store
            .commit_file(&head, &staging_path, &staging, &format!("Stage plan: {}", request.title))
            .await?;

        let mut header = initial_header(&request, &self.actor, Utc::now());
        header.insert(keys::EXTERNAL_REF.to_string(), Value::String(head.clone()));
        let document = compose_document(&Self::render_header(&header)?, &request.body);

        let pull = self
            .store
            .create_pull(NewPull {
                title: request.title.clone(),
                body: document,
                head: head.clone(),
                base: self.base_branch.clone(),
                draft: true,
            })
            .await?;
        for label in &request.labels {
            self.store.add_label(pull.number, label).await?;
        }

        let id = PlanId(pull.number);
        info!(plan_id = %id, head = %head, "Created draft-PR-backed plan");
        Plan::from_header(
            id,
            pull.title,
            BackendProvider::DraftPr,
            header,
            request.body,
            request.labels,
        )
    }

    async fn get_plan(&self, id: PlanId) -> Result<Lookup<Plan>, PlanError> {
        let Some((pull, header, body)) = self.fetch(id).await? else {
            return Ok(Lookup::NotFound(id));
        };
        let plan = Plan::from_header(
            id,
            pull.title,
            BackendProvider::DraftPr,
            header.fields,
            body,
            pull.labels,
        )?;
        Ok(Lookup::Found(plan))
    }

    async fn get_metadata_field(
        &self,
        id: PlanId,
        field: &str,
    ) -> Result<Lookup<Option<Value>>, PlanError> {
        Ok(match self.fetch(id).await? {
            Some((_, header, _)) => Lookup::Found(header.get(field).cloned()),
            None => Lookup::NotFound(id),
        })
    }

    async fn update_metadata(&self, id: PlanId, fields: Fields) -> Result<Mutation, PlanError> {
        let Some((pull, mut header, body)) = self.fetch(id).await? else {
            return Ok(Mutation::NotFound(id));
        };
        header.merge(fields);
        self.write(&pull, &header.fields, &body).await?;
        Ok(Mutation::Applied)
    }

    async fn update_body(&self, id: PlanId, body: &str) -> Result<Mutation, PlanError> {
        let Some((pull, header, _)) = self.fetch(id).await? else {
            return Ok(Mutation::NotFound(id));
        };
        self.write(&pull, &header.fields, body).await?;
        Ok(Mutation::Applied)
    }

    async fn add_label(&self, id: PlanId, label: &str) -> Result<Mutation, PlanError> {
        let Some(pull) = self.store.get_pull(id.0).await? else {
            return Ok(Mutation::NotFound(id));
        };
        if !pull.labels.iter().any(|l| l == label) {
            self.store.add_label(id.0, label).await?;
        }
        Ok(Mutation::Applied)
    }

    async fn has_label(&self, id: PlanId, label: &str) -> Result<Lookup<bool>, PlanError> {
        Ok(match self.store.get_pull(id.0).await? {
            Some(pull) => Lookup::Found(pull.labels.iter().any(|l| l == label)),
            None => Lookup::NotFound(id),
        })
    }

    async fn post_event(
        &self,
        id: PlanId,
        kind: &str,
        payload: Fields,
    ) -> Result<Mutation, PlanError> {
        if self.store.get_pull(id.0).await?.is_none() {
            return Ok(Mutation::NotFound(id));
        }
        let rendered = render_event(kind, payload)?;
        self.store.create_comment(id.0, &rendered).await?;
        debug!(plan_id = %id, kind, "Posted plan event");
        Ok(Mutation::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::MemoryStore;

    #[test]
    fn test_compose_and_split() {
        let doc = compose_document("HEADER\n", "line 1\n\nline 2\n");
        let (header, body) = split_document(&doc).unwrap();
        assert_eq!(header.trim(), "HEADER");
        assert_eq!(body, "line 1\n\nline 2\n");
    }

    #[test]
    fn test_split_empty_body() {
        let doc = compose_document("HEADER", "");
        assert_eq!(split_document(&doc).unwrap().1, "");
    }

    #[test]
    fn test_split_uses_first_delimiter() {
        let body = format!("intro\n{}\nquoted", BODY_DELIMITER);
        let doc = compose_document("HEADER", &body);
        assert_eq!(split_document(&doc).unwrap().1, body);
    }

    #[test]
    fn test_split_without_delimiter() {
        assert!(split_document("no delimiter here").is_none());
    }

    #[tokio::test]
    async fn test_create_commits_staging_file_and_opens_draft() {
        let store = Arc::new(MemoryStore::new("main"));
        let backend = DraftPrBackend::new(store.clone(), "octocat", "main");
        let plan = backend
            .create_plan(CreatePlanRequest::new("Add retries", "Do it").with_label("plan"))
            .await
            .unwrap();

        let head = plan.external_ref.clone().unwrap();
        assert!(head.starts_with("plan-draft/add-retries-"));
        assert!(store.has_remote_branch(&head));
        let staged = store.file(&head, ".plan/add-retries.md").unwrap();
        assert!(staged.contains("Do it"));

        let pull = store.get_pull(plan.id.0).await.unwrap().unwrap();
        assert!(pull.draft);
        assert_eq!(pull.base, "main");
        assert!(pull.body.contains(BODY_DELIMITER));
        assert_eq!(pull.labels, vec!["plan".to_string()]);
    }

    #[tokio::test]
    async fn test_header_edit_keeps_body_verbatim() {
        let store = Arc::new(MemoryStore::new("main"));
        let backend = DraftPrBackend::new(store.clone(), "octocat", "main");
        let body = "## Steps\n\n1. one\n2. two\n";
        let plan = backend
            .create_plan(CreatePlanRequest::new("t", body))
            .await
            .unwrap();

        let update = Fields::from([(keys::BRANCH_NAME.to_string(), Value::from("P1-t"))]);
        assert!(backend.update_metadata(plan.id, update).await.unwrap().is_applied());

        let pull = store.get_pull(plan.id.0).await.unwrap().unwrap();
        assert!(pull.body.ends_with(body));
    }
}
