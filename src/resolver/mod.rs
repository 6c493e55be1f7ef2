//! Plan identity from branch names, and base-branch resolution for stacked
//! plans.

pub mod fallback;
pub mod naming;

pub use fallback::{FallbackChain, Resolved};
pub use naming::{
    BranchName, DEFAULT_MAX_SLUG_LEN, MAX_BRANCH_LEN, branch_matches_id, generate_branch_name,
    parse_branch_name, parse_plan_id, slugify,
};

use crate::errors::PlanError;
use crate::plan::{Lookup, Plan, PlanBackend, PlanId};
use crate::remote::Vcs;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of looking up the plan behind a branch.
#[derive(Debug, Clone, PartialEq)]
pub enum BranchPlan {
    Found(Plan),
    /// The branch does not follow the naming grammar.
    UnrecognizedBranch,
    /// The branch names a plan that does not exist.
    PlanNotFound(PlanId),
}

/// Which branch a plan's work should be based on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseResolution {
    /// No parent declared.
    Trunk(String),
    /// Stacked on the parent plan's branch.
    Parent { parent_id: PlanId, branch: String },
    /// A parent is declared but its branch could not be used.
    TrunkFallback {
        branch: String,
        parent_id: PlanId,
        reason: String,
    },
}

impl BaseResolution {
    pub fn branch(&self) -> &str {
        match self {
            Self::Trunk(branch) | Self::TrunkFallback { branch, .. } => branch,
            Self::Parent { branch, .. } => branch,
        }
    }
}

/// Inputs to [`BranchResolver::plan_id_for_context`], tried in field order.
#[derive(Debug, Clone, Default)]
pub struct PlanContext<'c> {
    /// A plan whose header may point at the target.
    pub referring_plan: Option<PlanId>,
    /// Header field on `referring_plan` holding the target id.
    pub field: &'c str,
    /// Branch whose name may encode the target id.
    pub branch: Option<&'c str>,
    pub default: Option<PlanId>,
}

pub struct BranchResolver {
    backend: Arc<dyn PlanBackend>,
    vcs: Arc<dyn Vcs>,
    prefix: String,
    trunk: String,
}

impl BranchResolver {
    pub fn new(
        backend: Arc<dyn PlanBackend>,
        vcs: Arc<dyn Vcs>,
        prefix: impl Into<String>,
        trunk: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            vcs,
            prefix: prefix.into(),
            trunk: trunk.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn trunk(&self) -> &str {
        &self.trunk
    }

    /// Pure pattern match.
    pub fn resolve_id_from_branch(&self, branch: &str) -> Option<PlanId> {
        parse_plan_id(&self.prefix, branch)
    }

    pub fn branch_matches_id(&self, branch: &str, id: PlanId) -> bool {
        branch_matches_id(&self.prefix, branch, id)
    }

    pub async fn get_plan_for_branch(&self, branch: &str) -> Result<BranchPlan, PlanError> {
        let Some(id) = self.resolve_id_from_branch(branch) else {
            return Ok(BranchPlan::UnrecognizedBranch);
        };
        Ok(match self.backend.get_plan(id).await? {
            Lookup::Found(plan) => BranchPlan::Found(plan),
            Lookup::NotFound(id) => BranchPlan::PlanNotFound(id),
        })
    }

    /// Base branch for `plan`: the parent's recorded branch when a parent is
    /// declared and usable, trunk otherwise. Never fails; every problem with
    /// the parent becomes a logged `TrunkFallback`.
    pub async fn resolve_base_branch(&self, plan: &Plan) -> BaseResolution {
        let Some(parent_id) = plan.parent_plan_id() else {
            return BaseResolution::Trunk(self.trunk.clone());
        };

        match self.parent_branch(parent_id).await {
            Ok(branch) => {
                debug!(plan_id = %plan.id, parent_id = %parent_id, branch = %branch, "Stacking on parent branch");
                BaseResolution::Parent { parent_id, branch }
            }
            Err(reason) => {
                warn!(
                    plan_id = %plan.id,
                    parent_id = %parent_id,
                    reason = %reason,
                    trunk = %self.trunk,
                    "Parent branch unavailable, falling back to trunk"
                );
                BaseResolution::TrunkFallback {
                    branch: self.trunk.clone(),
                    parent_id,
                    reason,
                }
            }
        }
    }

    async fn parent_branch(&self, parent_id: PlanId) -> Result<String, String> {
        let parent = match self.backend.get_plan(parent_id).await {
            Ok(Lookup::Found(parent)) => parent,
            Ok(Lookup::NotFound(_)) => return Err(format!("parent plan {} not found", parent_id)),
            Err(e) => return Err(format!("parent lookup failed: {}", e)),
        };
        let Some(branch) = parent.branch_name else {
            return Err(format!("parent plan {} has no recorded branch", parent_id));
        };
        match self.vcs.branch_exists(&branch).await {
            Ok(true) => Ok(branch),
            Ok(false) => Err(format!("parent branch '{}' no longer exists", branch)),
            Err(e) => Err(format!("could not check parent branch '{}': {}", branch, e)),
        }
    }

    /// Work out which plan a command refers to: a header field on a referring
    /// plan, then the branch name, then the default.
    pub async fn plan_id_for_context(
        &self,
        context: &PlanContext<'_>,
    ) -> Result<Option<Resolved<PlanId>>, PlanError> {
        let backend = &self.backend;
        let prefix = self.prefix.as_str();
        let referring = context.referring_plan;
        let field = context.field;
        let branch = context.branch;
        let default = context.default;

        FallbackChain::<PlanId, PlanError>::new("plan-id-for-context")
            .step("metadata_field", false, move || async move {
                let Some(referring) = referring else {
                    return Ok(None);
                };
                Ok(match backend.get_metadata_field(referring, field).await? {
                    Lookup::Found(Some(Value::Number(n))) => n.as_u64().map(PlanId),
                    Lookup::Found(Some(Value::String(s))) => s.parse().ok(),
                    _ => None,
                })
            })
            .step("branch_name", true, move || async move {
                Ok(branch.and_then(|b| parse_plan_id(prefix, b)))
            })
            .step("default", true, move || async move { Ok(default) })
            .resolve()
            .await
    }
}
