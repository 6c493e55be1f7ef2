//! Idempotent branch provisioning.

use super::Lifecycle;
use crate::errors::LifecycleError;
use crate::plan::Plan;
use crate::remote::BranchInfo;
use crate::resolver::generate_branch_name;
use chrono::Utc;
use tracing::{debug, info};

/// The branch a plan's work lives on after `ensure_branch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsuredBranch {
    pub name: String,
    /// False when the branch was created by this call.
    pub reused: bool,
}

/// Pick one branch among several that name the same plan: newest tip commit
/// first, then name descending.
pub fn select_branch(candidates: &[BranchInfo]) -> Option<&BranchInfo> {
    candidates
        .iter()
        .max_by(|a, b| a.tip_time.cmp(&b.tip_time).then_with(|| a.name.cmp(&b.name)))
}

impl Lifecycle {
    /// Make sure `plan` has a branch, creating and pushing one from `base`
    /// only when none exists. Repeated calls return the same branch.
    ///
    /// Returns only after the branch is fully created and pushed.
    pub async fn ensure_branch(&self, plan: &Plan, base: &str) -> Result<EnsuredBranch, LifecycleError> {
        let vcs = self.vcs();

        if let Some(recorded) = &plan.branch_name
            && self.resolver().branch_matches_id(recorded, plan.id)
            && vcs.branch_exists(recorded).await?
        {
            debug!(plan_id = %plan.id, branch = %recorded, "Reusing recorded branch");
            return Ok(EnsuredBranch {
                name: recorded.clone(),
                reused: true,
            });
        }

        let candidates: Vec<BranchInfo> = vcs
            .list_branches()
            .await?
            .into_iter()
            .filter(|b| self.resolver().branch_matches_id(&b.name, plan.id))
            .collect();

        if let Some(chosen) = select_branch(&candidates) {
            if candidates.len() > 1 {
                let names: Vec<&str> = candidates.iter().map(|b| b.name.as_str()).collect();
                info!(plan_id = %plan.id, chosen = %chosen.name, candidates = ?names, "Multiple branches for plan, using most recent");
            } else {
                debug!(plan_id = %plan.id, branch = %chosen.name, "Reusing existing branch");
            }
            if !chosen.remote {
                vcs.push_branch(&chosen.name).await?;
            }
            return Ok(EnsuredBranch {
                name: chosen.name.clone(),
                reused: true,
            });
        }

        let config = self.config();
        let name = generate_branch_name(
            &config.branch_prefix,
            plan.id,
            &plan.title,
            None,
            Some(Utc::now()),
            config.max_slug_len,
        );
        vcs.create_branch(&name, base).await?;
        vcs.push_branch(&name).await?;
        info!(plan_id = %plan.id, branch = %name, base = %base, "Created plan branch");
        Ok(EnsuredBranch { name, reused: false })
    }
}
