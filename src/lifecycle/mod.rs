//! Plan lifecycle state machine.
//!
//! Stages move strictly forward:
//!
//! ```text
//! planned -> submitted -> dispatched -> implementing -> ready_for_review -> merged
//! ```
//!
//! Learn status is a side track (`not_started -> pending -> completed_* ->
//! plan_landed`). This module is the only writer of `stage` and
//! `learn_status`. Every operation returns `Ok(Effect::Changed(_))`,
//! `Ok(Effect::NoChange(_))` when the plan was already in the target state,
//! or an error.

pub mod branch;

pub use branch::{EnsuredBranch, select_branch};

use crate::errors::LifecycleError;
use crate::metadata::Fields;
use crate::plan::{
    CreatePlanRequest, LearnStatus, Lookup, Mutation, Plan, PlanBackend, PlanId, PlanType, Stage,
    keys,
};
use crate::remote::{DiffSummary, Vcs, WorkflowDispatcher};
use crate::resolver::{BranchResolver, DEFAULT_MAX_SLUG_LEN, FallbackChain, PlanContext};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of an idempotent operation.
#[must_use]
#[derive(Debug, Clone, PartialEq)]
pub enum Effect<T> {
    Changed(T),
    NoChange(T),
}

impl<T> Effect<T> {
    pub fn is_changed(&self) -> bool {
        matches!(self, Effect::Changed(_))
    }

    pub fn value(&self) -> &T {
        match self {
            Effect::Changed(v) | Effect::NoChange(v) => v,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            Effect::Changed(v) | Effect::NoChange(v) => v,
        }
    }
}

/// Knobs for the lifecycle. Mirrors the `[backend]`, `[branches]` and
/// `[lifecycle]` config sections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    pub branch_prefix: String,
    pub max_slug_len: usize,
    pub trunk: String,
    pub plan_label: String,
    pub learn_label: String,
    pub no_changes_label: String,
    pub implement_workflow: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            branch_prefix: "P".to_string(),
            max_slug_len: DEFAULT_MAX_SLUG_LEN,
            trunk: "main".to_string(),
            plan_label: "plan".to_string(),
            learn_label: "learn-plan".to_string(),
            no_changes_label: "no-changes".to_string(),
            implement_workflow: "implement-plan.yml".to_string(),
        }
    }
}

/// What `dispatch` triggered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReceipt {
    pub plan_id: PlanId,
    pub branch_name: String,
    pub base_branch: String,
    pub run_id: String,
    pub branch_reused: bool,
}

/// Result of checking an implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ImplementationOutcome {
    /// The branch differs from its base; the plan moved to review.
    ReadyForReview { diff: DiffSummary },
    /// The branch has no diff. Flagged for a human; the stage is unchanged.
    NoChanges,
}

const NO_CHANGES: &str = "no_changes";
const IMPLEMENTATION_DIFF: &str = "implementation_diff";

fn fields<const N: usize>(pairs: [(&str, Value); N]) -> Fields {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

pub struct Lifecycle {
    backend: Arc<dyn PlanBackend>,
    vcs: Arc<dyn Vcs>,
    dispatcher: Arc<dyn WorkflowDispatcher>,
    resolver: BranchResolver,
    config: LifecycleConfig,
}

impl Lifecycle {
    pub fn new(
        backend: Arc<dyn PlanBackend>,
        vcs: Arc<dyn Vcs>,
        dispatcher: Arc<dyn WorkflowDispatcher>,
        config: LifecycleConfig,
    ) -> Self {
        let resolver = BranchResolver::new(
            backend.clone(),
            vcs.clone(),
            config.branch_prefix.clone(),
            config.trunk.clone(),
        );
        Self {
            backend,
            vcs,
            dispatcher,
            resolver,
            config,
        }
    }

    pub fn backend(&self) -> &Arc<dyn PlanBackend> {
        &self.backend
    }

    pub fn vcs(&self) -> &Arc<dyn Vcs> {
        &self.vcs
    }

    pub fn resolver(&self) -> &BranchResolver {
        &self.resolver
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    async fn load(&self, id: PlanId) -> Result<Plan, LifecycleError> {
        match self.backend.get_plan(id).await? {
            Lookup::Found(plan) => Ok(plan),
            Lookup::NotFound(id) => Err(LifecycleError::PlanNotFound(id)),
        }
    }

    async fn write(&self, id: PlanId, update: Fields) -> Result<(), LifecycleError> {
        match self.backend.update_metadata(id, update).await? {
            Mutation::Applied => Ok(()),
            Mutation::NotFound(id) => Err(LifecycleError::PlanNotFound(id)),
        }
    }

    async fn event(&self, id: PlanId, kind: &str, payload: Fields) -> Result<(), LifecycleError> {
        match self.backend.post_event(id, kind, payload).await? {
            Mutation::Applied => Ok(()),
            Mutation::NotFound(id) => Err(LifecycleError::PlanNotFound(id)),
        }
    }

    /// `Ok(true)` when the move is legal, `Ok(false)` when the plan is
    /// already at `to`.
    fn check_transition(plan: &Plan, to: Stage) -> Result<bool, LifecycleError> {
        if plan.stage == to {
            return Ok(false);
        }
        if plan.stage.can_transition_to(to) {
            return Ok(true);
        }
        Err(LifecycleError::InvalidTransition {
            id: plan.id,
            from: plan.stage,
            to,
        })
    }

    /// Create a plan in `planned`, optionally stacked on `parent`.
    pub async fn create_plan(
        &self,
        title: &str,
        body: &str,
        parent: Option<PlanId>,
    ) -> Result<Plan, LifecycleError> {
        let mut request = CreatePlanRequest::new(title, body).with_label(&self.config.plan_label);
        if let Some(parent) = parent {
            request = request.with_field(keys::PARENT_PLAN_ID, json!(parent.0));
        }
        let plan = self.backend.create_plan(request).await?;
        info!(plan_id = %plan.id, provider = %plan.backend_provider, "Plan created");
        Ok(plan)
    }

    /// Create a learn plan produced from `source`'s sessions.
    pub async fn create_learn_plan(
        &self,
        source: PlanId,
        title: &str,
        body: &str,
    ) -> Result<Plan, LifecycleError> {
        let request = CreatePlanRequest::new(title, body)
            .with_label(&self.config.plan_label)
            .with_label(&self.config.learn_label)
            .with_field(keys::PLAN_TYPE, json!(PlanType::Learn))
            .with_field(keys::LEARNED_FROM_ID, json!(source.0));
        let plan = self.backend.create_plan(request).await?;
        info!(plan_id = %plan.id, source = %source, "Learn plan created");
        Ok(plan)
    }

    /// Create the learn plan for `source`, or return the one an earlier
    /// attempt already recorded on it. The new plan's id is written to the
    /// source before the learn status moves on, so a retry after a failed
    /// `complete_learn` reuses it.
    pub async fn ensure_learn_plan(
        &self,
        source: PlanId,
        title: &str,
        body: &str,
    ) -> Result<Effect<Plan>, LifecycleError> {
        let plan = self.load(source).await?;
        if let Some(existing) = plan.field(keys::LEARN_PLAN_ID).and_then(Value::as_u64).map(PlanId) {
            match self.backend.get_plan(existing).await? {
                Lookup::Found(learn_plan) => {
                    info!(plan_id = %source, learn_plan_id = %existing, "Reusing recorded learn plan");
                    return Ok(Effect::NoChange(learn_plan));
                }
                Lookup::NotFound(_) => {
                    warn!(plan_id = %source, learn_plan_id = %existing, "Recorded learn plan is gone, creating another");
                }
            }
        }

        let created = self.create_learn_plan(source, title, body).await?;
        if let Err(e) = self.write(source, fields([(keys::LEARN_PLAN_ID, json!(created.id.0))])).await {
            warn!(plan_id = %source, learn_plan_id = %created.id, error = %e, "Failed to record learn plan on its source");
            return Err(e);
        }
        Ok(Effect::Changed(created))
    }

    /// `planned -> submitted`: check labels, provision the branch and record it.
    pub async fn submit(&self, id: PlanId) -> Result<Effect<Plan>, LifecycleError> {
        let plan = self.load(id).await?;
        if !Self::check_transition(&plan, Stage::Submitted)? {
            return Ok(Effect::NoChange(plan));
        }
        self.check_labels(&plan)?;

        let base = self.resolver.resolve_base_branch(&plan).await;
        let branch = self.ensure_branch(&plan, base.branch()).await?;

        self.write(
            id,
            fields([
                (keys::STAGE, json!(Stage::Submitted)),
                (keys::BRANCH_NAME, json!(branch.name)),
                (keys::BASE_BRANCH, json!(base.branch())),
            ]),
        )
        .await?;
        info!(plan_id = %id, branch = %branch.name, reused = branch.reused, "Plan submitted");
        Ok(Effect::Changed(self.load(id).await?))
    }

    fn check_labels(&self, plan: &Plan) -> Result<(), LifecycleError> {
        let mut missing = Vec::new();
        if !plan.has_label(&self.config.plan_label) {
            missing.push(self.config.plan_label.as_str());
        }
        if plan.is_learn_plan() && !plan.has_label(&self.config.learn_label) {
            missing.push(self.config.learn_label.as_str());
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::GuardFailed {
                id: plan.id,
                guard: "label-invariant",
                detail: format!("missing label(s): {}", missing.join(", ")),
            })
        }
    }

    /// `submitted -> dispatched`: reuse or create the plan branch, then
    /// trigger the implementation workflow.
    pub async fn dispatch(&self, id: PlanId) -> Result<Effect<DispatchReceipt>, LifecycleError> {
        let plan = self.load(id).await?;
        if !Self::check_transition(&plan, Stage::Dispatched)? {
            let receipt = self.recorded_receipt(&plan);
            if receipt.run_id.is_empty() {
                warn!(plan_id = %id, "Plan was dispatched but its run id was never recorded");
            }
            return Ok(Effect::NoChange(receipt));
        }

        let recorded_base = plan.base_branch();
        let resolver = &self.resolver;
        let plan_ref = &plan;
        let base = FallbackChain::<String, LifecycleError>::new("dispatch-base")
            .step("recorded_base_branch", true, move || async move { Ok(recorded_base) })
            .step("resolve_base_branch", true, move || async move {
                Ok(Some(resolver.resolve_base_branch(plan_ref).await.branch().to_string()))
            })
            .resolve()
            .await?
            .map(|r| r.value)
            .unwrap_or_else(|| self.config.trunk.clone());

        let branch = self.ensure_branch(&plan, &base).await?;
        if !self.resolver.branch_matches_id(&branch.name, id) {
            return Err(LifecycleError::GuardFailed {
                id,
                guard: "branch-matches-id",
                detail: format!("branch '{}' does not name plan {}", branch.name, id),
            });
        }

        let inputs: BTreeMap<String, String> = BTreeMap::from([
            ("plan_id".to_string(), id.to_string()),
            ("branch_name".to_string(), branch.name.clone()),
            ("base_branch".to_string(), base.clone()),
        ]);

        // Claim the stage before triggering so a retry after a failed
        // run-id write cannot start a second run. A null run id marks the
        // claim.
        self.write(
            id,
            fields([
                (keys::STAGE, json!(Stage::Dispatched)),
                (keys::BRANCH_NAME, json!(branch.name)),
                (keys::BASE_BRANCH, json!(base)),
                (keys::LAST_DISPATCHED_RUN_ID, Value::Null),
            ]),
        )
        .await?;

        let run_id = match self
            .dispatcher
            .dispatch(&self.config.implement_workflow, &inputs)
            .await
        {
            Ok(run_id) => run_id,
            Err(e) => {
                if let Err(release) = self
                    .write(id, fields([(keys::STAGE, json!(Stage::Submitted))]))
                    .await
                {
                    warn!(plan_id = %id, error = %release, "Failed to release dispatch claim");
                }
                return Err(LifecycleError::Dispatch(e));
            }
        };

        let now = Utc::now().to_rfc3339();
        self.write(
            id,
            fields([
                (keys::LAST_DISPATCHED_RUN_ID, json!(run_id)),
                (keys::LAST_DISPATCHED_AT, json!(now)),
            ]),
        )
        .await?;
        self.event(
            id,
            "dispatched",
            fields([
                ("run_id", json!(run_id)),
                ("branch_name", json!(branch.name)),
                ("base_branch", json!(base)),
            ]),
        )
        .await?;

        info!(plan_id = %id, run_id = %run_id, branch = %branch.name, reused = branch.reused, "Plan dispatched");
        Ok(Effect::Changed(DispatchReceipt {
            plan_id: id,
            branch_name: branch.name,
            base_branch: base,
            run_id,
            branch_reused: branch.reused,
        }))
    }

    fn recorded_receipt(&self, plan: &Plan) -> DispatchReceipt {
        let text = |key: &str| {
            plan.field(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        DispatchReceipt {
            plan_id: plan.id,
            branch_name: text(keys::BRANCH_NAME),
            base_branch: plan.base_branch().unwrap_or_else(|| self.config.trunk.clone()),
            run_id: text(keys::LAST_DISPATCHED_RUN_ID),
            branch_reused: true,
        }
    }

    /// `dispatched -> implementing`.
    pub async fn mark_implementing(&self, id: PlanId) -> Result<Effect<Plan>, LifecycleError> {
        self.advance(id, Stage::Implementing).await
    }

    /// `ready_for_review -> merged`. A merged learn plan marks its source
    /// plan's learn status as landed.
    pub async fn mark_merged(&self, id: PlanId) -> Result<Effect<Plan>, LifecycleError> {
        let effect = self.advance(id, Stage::Merged).await?;
        if effect.is_changed() {
            self.land_source_plan(id).await?;
        }
        Ok(effect)
    }

    async fn advance(&self, id: PlanId, to: Stage) -> Result<Effect<Plan>, LifecycleError> {
        let plan = self.load(id).await?;
        if !Self::check_transition(&plan, to)? {
            return Ok(Effect::NoChange(plan));
        }
        self.write(id, fields([(keys::STAGE, json!(to))])).await?;
        info!(plan_id = %id, from = %plan.stage, to = %to, "Plan stage changed");
        Ok(Effect::Changed(self.load(id).await?))
    }

    async fn land_source_plan(&self, id: PlanId) -> Result<(), LifecycleError> {
        let source = self
            .resolver
            .plan_id_for_context(&PlanContext {
                referring_plan: Some(id),
                field: keys::LEARNED_FROM_ID,
                ..Default::default()
            })
            .await?;
        let Some(source) = source.map(|r| r.value) else {
            return Ok(());
        };

        let source_plan = match self.backend.get_plan(source).await? {
            Lookup::Found(plan) => plan,
            Lookup::NotFound(_) => {
                warn!(plan_id = %id, source = %source, "Learn source plan not found; nothing to land");
                return Ok(());
            }
        };
        match source_plan.learn_status {
            Some(LearnStatus::CompletedWithPlan { plan_id }) if plan_id == id => {
                self.write_learn_status(source, LearnStatus::PlanLanded { plan_id: id })
                    .await?;
                info!(source = %source, plan_id = %id, "Learn plan landed");
            }
            other => {
                warn!(
                    source = %source,
                    plan_id = %id,
                    status = other.map(|s| s.name()).unwrap_or("not_started"),
                    "Source plan does not reference this learn plan; leaving its status"
                );
            }
        }
        Ok(())
    }

    /// `implementing -> ready_for_review` when the branch has a diff. An empty
    /// diff is its own outcome: labelled, recorded and left in `implementing`.
    pub async fn complete_implementation(
        &self,
        id: PlanId,
    ) -> Result<Effect<ImplementationOutcome>, LifecycleError> {
        let plan = self.load(id).await?;
        if !Self::check_transition(&plan, Stage::ReadyForReview)? {
            let diff = plan
                .field(IMPLEMENTATION_DIFF)
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default();
            return Ok(Effect::NoChange(ImplementationOutcome::ReadyForReview { diff }));
        }

        let Some(branch) = plan.branch_name.clone() else {
            return Err(LifecycleError::GuardFailed {
                id,
                guard: "branch-recorded",
                detail: "plan has no recorded branch".to_string(),
            });
        };
        let base = plan.base_branch().unwrap_or_else(|| self.config.trunk.clone());
        let diff = self.vcs.diff_summary(&branch, &base).await?;

        if diff.is_empty() {
            let already_flagged = plan.field(keys::IMPLEMENTATION_OUTCOME) == Some(&json!(NO_CHANGES));
            if let Mutation::NotFound(id) = self.backend.add_label(id, &self.config.no_changes_label).await? {
                return Err(LifecycleError::PlanNotFound(id));
            }
            if already_flagged {
                return Ok(Effect::NoChange(ImplementationOutcome::NoChanges));
            }
            self.write(id, fields([(keys::IMPLEMENTATION_OUTCOME, json!(NO_CHANGES))]))
                .await?;
            self.event(
                id,
                "no-changes",
                fields([("branch_name", json!(branch)), ("base_branch", json!(base))]),
            )
            .await?;
            warn!(plan_id = %id, branch = %branch, base = %base, "Implementation produced no changes; flagged for review");
            return Ok(Effect::Changed(ImplementationOutcome::NoChanges));
        }

        self.write(
            id,
            fields([
                (keys::STAGE, json!(Stage::ReadyForReview)),
                (keys::IMPLEMENTATION_OUTCOME, json!("ready_for_review")),
                (IMPLEMENTATION_DIFF, json!(diff)),
            ]),
        )
        .await?;
        info!(
            plan_id = %id,
            files = diff.files_changed,
            insertions = diff.insertions,
            deletions = diff.deletions,
            "Plan ready for review"
        );
        Ok(Effect::Changed(ImplementationOutcome::ReadyForReview { diff }))
    }

    async fn write_learn_status(&self, id: PlanId, status: LearnStatus) -> Result<(), LifecycleError> {
        self.write(id, fields([(keys::LEARN_STATUS, status.to_value())])).await
    }

    /// `not_started -> pending`. Learn plans are refused before anything is
    /// written so the pipeline can never feed on its own output.
    pub async fn begin_learn(&self, id: PlanId) -> Result<Effect<LearnStatus>, LifecycleError> {
        let plan = self.load(id).await?;
        if plan.is_learn_plan() {
            return Err(LifecycleError::LearnCycle(id));
        }
        match plan.learn_status.unwrap_or_default() {
            LearnStatus::Pending => Ok(Effect::NoChange(LearnStatus::Pending)),
            LearnStatus::NotStarted => {
                self.write_learn_status(id, LearnStatus::Pending).await?;
                info!(plan_id = %id, "Learn started");
                Ok(Effect::Changed(LearnStatus::Pending))
            }
            other => Err(LifecycleError::InvalidLearnTransition {
                id,
                from: other.name().to_string(),
                to: LearnStatus::Pending.name().to_string(),
            }),
        }
    }

    /// `pending -> completed_no_plan | completed_with_plan`.
    pub async fn complete_learn(
        &self,
        id: PlanId,
        produced: Option<PlanId>,
    ) -> Result<Effect<LearnStatus>, LifecycleError> {
        let plan = self.load(id).await?;
        let target = match produced {
            Some(plan_id) => LearnStatus::CompletedWithPlan { plan_id },
            None => LearnStatus::CompletedNoPlan,
        };
        let current = plan.learn_status.unwrap_or_default();
        if current == target {
            return Ok(Effect::NoChange(target));
        }
        if current != LearnStatus::Pending {
            return Err(LifecycleError::InvalidLearnTransition {
                id,
                from: current.name().to_string(),
                to: target.name().to_string(),
            });
        }
        self.write_learn_status(id, target).await?;
        info!(plan_id = %id, status = target.name(), "Learn completed");
        Ok(Effect::Changed(target))
    }
}

#[cfg(test)]
mod tests;
