//! Plans and the backends that store them.
//!
//! A plan is a unit of proposed work tracked in the remote store. Two
//! backends hold plans: [`IssueBackend`] keeps the header in an issue body and
//! the content in a follow-up comment, [`DraftPrBackend`] keeps both in one
//! draft pull-request description. Callers only see [`PlanBackend`].

pub mod backend;
pub mod draft_pr;
pub mod issue;

#[cfg(test)]
mod conformance;

pub use backend::{CreatePlanRequest, Lookup, Mutation, PlanBackend};
pub use draft_pr::DraftPrBackend;
pub use issue::IssueBackend;

use crate::errors::PlanError;
use crate::metadata::Fields;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Key of the header block holding plan metadata.
pub const HEADER_KEY: &str = "plan-header";
/// Key of the block holding the plan body.
pub const BODY_KEY: &str = "plan-body";
/// Field inside the body block that carries the text.
pub const BODY_CONTENT_FIELD: &str = "content";

/// Well-known header fields.
pub mod keys {
    pub const STAGE: &str = "stage";
    pub const CREATED_AT: &str = "created_at";
    pub const CREATED_BY: &str = "created_by";
    pub const BRANCH_NAME: &str = "branch_name";
    pub const BASE_BRANCH: &str = "base_branch";
    pub const EXTERNAL_REF: &str = "external_ref";
    pub const PLAN_COMMENT_ID: &str = "plan_comment_id";
    pub const LEARNED_FROM_ID: &str = "learned_from_id";
    pub const LEARN_STATUS: &str = "learn_status";
    /// Learn plan produced from this plan's sessions, recorded before the
    /// learn status is completed.
    pub const LEARN_PLAN_ID: &str = "learn_plan_id";
    pub const PARENT_PLAN_ID: &str = "parent_plan_id";
    pub const PLAN_TYPE: &str = "plan_type";
    pub const LAST_DISPATCHED_RUN_ID: &str = "last_dispatched_run_id";
    pub const LAST_DISPATCHED_AT: &str = "last_dispatched_at";
    pub const IMPLEMENTATION_OUTCOME: &str = "implementation_outcome";
}

/// Plan identifier. An issue number or a pull-request number depending on
/// the backend that assigned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub u64);

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PlanId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().trim_start_matches('#').parse().map(PlanId)
    }
}

/// Which kind of remote entity a plan is stored as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendProvider {
    #[default]
    Issue,
    DraftPr,
}

impl BackendProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::DraftPr => "draft_pr",
        }
    }
}

impl fmt::Display for BackendProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "issue" | "github-issue" => Ok(Self::Issue),
            "draft_pr" | "draft-pr" | "pr" => Ok(Self::DraftPr),
            other => Err(format!("unknown backend provider '{}'", other)),
        }
    }
}

/// Lifecycle stage of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Planned,
    Submitted,
    Dispatched,
    Implementing,
    ReadyForReview,
    Merged,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Submitted => "submitted",
            Self::Dispatched => "dispatched",
            Self::Implementing => "implementing",
            Self::ReadyForReview => "ready_for_review",
            Self::Merged => "merged",
        }
    }

    /// The only stage reachable from this one.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Self::Planned => Some(Self::Submitted),
            Self::Submitted => Some(Self::Dispatched),
            Self::Dispatched => Some(Self::Implementing),
            Self::Implementing => Some(Self::ReadyForReview),
            Self::ReadyForReview => Some(Self::Merged),
            Self::Merged => None,
        }
    }

    pub fn can_transition_to(&self, to: Stage) -> bool {
        self.next() == Some(to)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planned" => Ok(Self::Planned),
            "submitted" => Ok(Self::Submitted),
            "dispatched" => Ok(Self::Dispatched),
            "implementing" => Ok(Self::Implementing),
            "ready_for_review" => Ok(Self::ReadyForReview),
            "merged" => Ok(Self::Merged),
            other => Err(format!("unknown stage '{}'", other)),
        }
    }
}

/// Progress of mining a plan's sessions for follow-on work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LearnStatus {
    #[default]
    NotStarted,
    Pending,
    CompletedNoPlan,
    CompletedWithPlan { plan_id: PlanId },
    PlanLanded { plan_id: PlanId },
}

impl LearnStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Pending => "pending",
            Self::CompletedNoPlan => "completed_no_plan",
            Self::CompletedWithPlan { .. } => "completed_with_plan",
            Self::PlanLanded { .. } => "plan_landed",
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Distinguishes learn plans (produced by the pipeline) from ordinary ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    #[default]
    Standard,
    Learn,
}

/// A plan as read from a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub id: PlanId,
    pub title: String,
    pub stage: Stage,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub backend_provider: BackendProvider,
    pub branch_name: Option<String>,
    pub external_ref: Option<String>,
    /// The full header, including the fields projected above.
    pub metadata: Fields,
    pub body: String,
    pub learned_from_id: Option<PlanId>,
    pub learn_status: Option<LearnStatus>,
    pub labels: Vec<String>,
}

impl Plan {
    /// Project a decoded header onto a plan.
    ///
    /// `stage`, `created_at` and `created_by` are required; their absence
    /// means the header was damaged.
    pub fn from_header(
        id: PlanId,
        title: String,
        provider: BackendProvider,
        header: Fields,
        body: String,
        labels: Vec<String>,
    ) -> Result<Self, PlanError> {
        let required_str = |field: &str| -> Result<String, PlanError> {
            header
                .get(field)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| PlanError::corrupted(id, format!("header field '{}' missing", field)))
        };

        let stage: Stage = required_str(keys::STAGE)?
            .parse()
            .map_err(|e: String| PlanError::corrupted(id, e))?;
        let created_at = DateTime::parse_from_rfc3339(&required_str(keys::CREATED_AT)?)
            .map_err(|e| PlanError::corrupted(id, format!("created_at: {}", e)))?
            .with_timezone(&Utc);
        let created_by = required_str(keys::CREATED_BY)?;

        let learn_status = match header.get(keys::LEARN_STATUS) {
            None | Some(Value::Null) => None,
            Some(value) => Some(
                serde_json::from_value(value.clone())
                    .map_err(|e| PlanError::corrupted(id, format!("learn_status: {}", e)))?,
            ),
        };

        Ok(Self {
            id,
            title,
            stage,
            created_at,
            created_by,
            backend_provider: provider,
            branch_name: optional_str(&header, keys::BRANCH_NAME),
            external_ref: optional_str(&header, keys::EXTERNAL_REF),
            learned_from_id: optional_id(&header, keys::LEARNED_FROM_ID),
            learn_status,
            metadata: header,
            body,
            labels,
        })
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.metadata.get(name).filter(|v| !v.is_null())
    }

    pub fn parent_plan_id(&self) -> Option<PlanId> {
        optional_id(&self.metadata, keys::PARENT_PLAN_ID)
    }

    pub fn base_branch(&self) -> Option<String> {
        optional_str(&self.metadata, keys::BASE_BRANCH)
    }

    pub fn plan_type(&self) -> PlanType {
        self.field(keys::PLAN_TYPE)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Learn plans were produced by the pipeline and must not feed it again.
    pub fn is_learn_plan(&self) -> bool {
        self.plan_type() == PlanType::Learn || self.learned_from_id.is_some()
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

fn optional_str(fields: &Fields, key: &str) -> Option<String> {
    fields.get(key).and_then(Value::as_str).map(str::to_string)
}

fn optional_id(fields: &Fields, key: &str) -> Option<PlanId> {
    match fields.get(key)? {
        Value::Number(n) => n.as_u64().map(PlanId),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Fields stored in the body block.
pub(crate) fn body_fields(body: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert(BODY_CONTENT_FIELD.to_string(), Value::String(body.to_string()));
    fields
}

/// Body text from a decoded body block.
pub(crate) fn body_from_fields(fields: &Fields) -> Option<String> {
    fields
        .get(BODY_CONTENT_FIELD)
        .and_then(Value::as_str)
        .map(str::to_string)
}
