//! Issue-backed plans.
//!
//! The issue body holds a compact `plan-header` block so batch queries only
//! read issue bodies. The plan text lives in a follow-up comment inside a
//! `plan-body` block, referenced from the header by `plan_comment_id`.

use super::backend::{initial_header, render_event};
use super::{
    BODY_KEY, BackendProvider, CreatePlanRequest, HEADER_KEY, Lookup, Mutation, Plan,
    PlanBackend, PlanId, body_fields, body_from_fields, keys,
};
use crate::errors::PlanError;
use crate::metadata::{self, ContainerLocation, Fields, MetadataBlock};
use crate::remote::{RemoteIssue, RemoteStore};
use crate::resolver::FallbackChain;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct IssueBackend {
    store: Arc<dyn RemoteStore>,
    actor: String,
}

impl IssueBackend {
    /// `actor` is recorded as `created_by` on new plans.
    pub fn new(store: Arc<dyn RemoteStore>, actor: impl Into<String>) -> Self {
        Self {
            store,
            actor: actor.into(),
        }
    }

    fn render_body(body: &str) -> Result<String, PlanError> {
        let encoded = metadata::encode(BODY_KEY, &body_fields(body))?;
        Ok(metadata::render_collapsible(BODY_KEY, &encoded))
    }

    fn render_header(header: &Fields) -> Result<String, PlanError> {
        let encoded = metadata::encode(HEADER_KEY, header)?;
        Ok(metadata::render_collapsible(HEADER_KEY, &encoded))
    }

    fn read_header(id: PlanId, issue: &RemoteIssue) -> Result<MetadataBlock, PlanError> {
        MetadataBlock::read(&issue.body, HEADER_KEY, ContainerLocation::PrimaryDocument)?
            .ok_or_else(|| PlanError::corrupted(id, "plan-header block missing from issue body"))
    }

    fn comment_id(header: &MetadataBlock) -> Option<u64> {
        header.get(keys::PLAN_COMMENT_ID).and_then(Value::as_u64)
    }

    /// Find the comment holding the body block: the recorded id first, then
    /// the newest comment carrying a `plan-body` block.
    async fn locate_body_comment(
        &self,
        id: PlanId,
        header: &MetadataBlock,
    ) -> Result<Option<u64>, PlanError> {
        let store = &self.store;
        let recorded = Self::comment_id(header);

        let resolved = FallbackChain::<u64, PlanError>::new("issue-body-comment")
            .step("plan_comment_id", false, move || async move {
                let Some(comment_id) = recorded else {
                    return Ok(None);
                };
                Ok(store.get_comment(comment_id).await?.map(|c| c.id))
            })
            .step("comment_scan", true, move || async move {
                let comments = store.list_comments(id.0).await?;
                Ok(comments
                    .iter()
                    .rev()
                    .find(|c| matches!(metadata::find_block(&c.body, BODY_KEY), Ok(Some(_))))
                    .map(|c| c.id))
            })
            .resolve()
            .await?;

        Ok(resolved.map(|r| r.value))
    }

    /// Load the body: recorded comment, then a scan of all comments, then the
    /// legacy layout where the body block sat in the issue itself.
    async fn load_body(
        &self,
        id: PlanId,
        issue: &RemoteIssue,
        header: &MetadataBlock,
    ) -> Result<String, PlanError> {
        let store = &self.store;
        let recorded = Self::comment_id(header);

        let resolved = FallbackChain::<String, PlanError>::new("issue-body")
            .step("plan_comment_id", false, move || async move {
                let Some(comment_id) = recorded else {
                    return Ok(None);
                };
                let Some(comment) = store.get_comment(comment_id).await? else {
                    return Ok(None);
                };
                Ok(metadata::decode(&comment.body, BODY_KEY)?.and_then(|f| body_from_fields(&f)))
            })
            .step("comment_scan", true, move || async move {
                let comments = store.list_comments(id.0).await?;
                for comment in comments.iter().rev() {
                    if let Ok(Some(fields)) = metadata::decode(&comment.body, BODY_KEY)
                        && let Some(body) = body_from_fields(&fields)
                    {
                        return Ok(Some(body));
                    }
                }
                Ok(None)
            })
            .step("legacy_issue_body", true, move || async move {
                Ok(metadata::decode(&issue.body, BODY_KEY)?.and_then(|f| body_from_fields(&f)))
            })
            .resolve()
            .await?;

        match resolved {
            Some(found) => {
                debug!(plan_id = %id, source = found.source, "Loaded plan body");
                Ok(found.value)
            }
            None => {
                warn!(plan_id = %id, "No plan-body block found; treating body as empty");
                Ok(String::new())
            }
        }
    }

    async fn fetch(&self, id: PlanId) -> Result<Option<(RemoteIssue, MetadataBlock)>, PlanError> {
        let Some(issue) = self.store.get_issue(id.0).await? else {
            return Ok(None);
        };
        let header = Self::read_header(id, &issue)?;
        Ok(Some((issue, header)))
    }

    async fn write_header(&self, issue: &RemoteIssue, header: &MetadataBlock) -> Result<(), PlanError> {
        let body = metadata::replace_block(&issue.body, HEADER_KEY, &header.fields)?;
        self.store.update_issue_body(issue.number, &body).await?;
        Ok(())
    }
}

#[async_trait]
impl PlanBackend for IssueBackend {
    fn provider(&self) -> BackendProvider {
        BackendProvider::Issue
    }

    async fn create_plan(&self, request: CreatePlanRequest) -> Result<Plan, PlanError> {
        let mut header = initial_header(&request, &self.actor, Utc::now());
        let issue = self
            .store
            .create_issue(&request.title, &Self::render_header(&header)?, &request.labels)
            .await?;
        let id = PlanId(issue.number);

        let comment = self
            .store
            .create_comment(issue.number, &Self::render_body(&request.body)?)
            .await?;
        header.insert(keys::PLAN_COMMENT_ID.to_string(), Value::from(comment.id));
        let issue_body = metadata::replace_block(&issue.body, HEADER_KEY, &header)?;
        self.store.update_issue_body(issue.number, &issue_body).await?;

        info!(plan_id = %id, comment_id = comment.id, "Created issue-backed plan");
        Plan::from_header(
            id,
            issue.title,
            BackendProvider::Issue,
            header,
            request.body,
            issue.labels,
        )
    }

    async fn get_plan(&self, id: PlanId) -> Result<Lookup<Plan>, PlanError> {
        let Some((issue, header)) = self.fetch(id).await? else {
            return Ok(Lookup::NotFound(id));
        };
        let body = self.load_body(id, &issue, &header).await?;
        let plan = Plan::from_header(
            id,
            issue.title,
            BackendProvider::Issue,
            header.fields,
            body,
            issue.labels,
        )?;
        Ok(Lookup::Found(plan))
    }

    async fn get_metadata_field(
        &self,
        id: PlanId,
        field: &str,
    ) -> Result<Lookup<Option<Value>>, PlanError> {
        Ok(match self.fetch(id).await? {
            Some((_, header)) => Lookup::Found(header.get(field).cloned()),
            None => Lookup::NotFound(id),
        })
    }

    async fn update_metadata(&self, id: PlanId, fields: Fields) -> Result<Mutation, PlanError> {
        let Some((issue, mut header)) = self.fetch(id).await? else {
            return Ok(Mutation::NotFound(id));
        };
        header.merge(fields);
        self.write_header(&issue, &header).await?;
        Ok(Mutation::Applied)
    }

    async fn update_body(&self, id: PlanId, body: &str) -> Result<Mutation, PlanError> {
        let Some((issue, mut header)) = self.fetch(id).await? else {
            return Ok(Mutation::NotFound(id));
        };
        let rendered = Self::render_body(body)?;

        match self.locate_body_comment(id, &header).await? {
            Some(comment_id) => {
                self.store.update_comment(comment_id, &rendered).await?;
                if Self::comment_id(&header) != Some(comment_id) {
                    header.merge(Fields::from([(
                        keys::PLAN_COMMENT_ID.to_string(),
                        Value::from(comment_id),
                    )]));
                    self.write_header(&issue, &header).await?;
                }
            }
            None => {
                // Body comment was never created or has been deleted.
                let comment = self.store.create_comment(id.0, &rendered).await?;
                header.merge(Fields::from([(
                    keys::PLAN_COMMENT_ID.to_string(),
                    Value::from(comment.id),
                )]));
                self.write_header(&issue, &header).await?;
            }
        }
        Ok(Mutation::Applied)
    }

    async fn add_label(&self, id: PlanId, label: &str) -> Result<Mutation, PlanError> {
        let Some(issue) = self.store.get_issue(id.0).await? else {
            return Ok(Mutation::NotFound(id));
        };
        if !issue.labels.iter().any(|l| l == label) {
            self.store.add_label(id.0, label).await?;
        }
        Ok(Mutation::Applied)
    }

    async fn has_label(&self, id: PlanId, label: &str) -> Result<Lookup<bool>, PlanError> {
        Ok(match self.store.get_issue(id.0).await? {
            Some(issue) => Lookup::Found(issue.labels.iter().any(|l| l == label)),
            None => Lookup::NotFound(id),
        })
    }

    async fn post_event(
        &self,
        id: PlanId,
        kind: &str,
        payload: Fields,
    ) -> Result<Mutation, PlanError> {
        if self.store.get_issue(id.0).await?.is_none() {
            return Ok(Mutation::NotFound(id));
        }
        let rendered = render_event(kind, payload)?;
        self.store.create_comment(id.0, &rendered).await?;
        debug!(plan_id = %id, kind, "Posted plan event");
        Ok(Mutation::Applied)
    }
}
