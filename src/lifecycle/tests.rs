use super::*;
use crate::errors::RemoteError;
use crate::plan::{DraftPrBackend, IssueBackend};
use crate::remote::memory::{MemoryDispatcher, MemoryStore, MemoryVcs};
use chrono::Duration;

struct Harness {
    store: Arc<MemoryStore>,
    vcs: Arc<MemoryVcs>,
    dispatcher: Arc<MemoryDispatcher>,
    lifecycle: Lifecycle,
}

fn harness_with(make: fn(Arc<MemoryStore>) -> Arc<dyn PlanBackend>) -> Harness {
    let store = Arc::new(MemoryStore::new("main"));
    let vcs = Arc::new(MemoryVcs::new("main"));
    let dispatcher = Arc::new(MemoryDispatcher::new());
    let lifecycle = Lifecycle::new(
        make(store.clone()),
        vcs.clone(),
        dispatcher.clone(),
        LifecycleConfig::default(),
    );
    Harness {
        store,
        vcs,
        dispatcher,
        lifecycle,
    }
}

fn harness() -> Harness {
    harness_with(|store| Arc::new(IssueBackend::new(store, "octocat")))
}

fn changed() -> DiffSummary {
    DiffSummary {
        files_changed: 2,
        insertions: 10,
        deletions: 1,
    }
}

async fn submitted(h: &Harness, title: &str) -> Plan {
    let plan = h.lifecycle.create_plan(title, "steps", None).await.unwrap();
    h.lifecycle.submit(plan.id).await.unwrap().into_inner()
}

#[tokio::test]
async fn test_full_lifecycle() {
    let h = harness();
    let plan = h
        .lifecycle
        .create_plan("Fix login redirect", "steps", None)
        .await
        .unwrap();
    assert_eq!(plan.stage, Stage::Planned);
    assert!(plan.has_label("plan"));

    let plan = h.lifecycle.submit(plan.id).await.unwrap().into_inner();
    assert_eq!(plan.stage, Stage::Submitted);
    let branch = plan.branch_name.clone().unwrap();
    assert!(branch.starts_with(&format!("P{}-fix-login-redirect-", plan.id)));
    assert_eq!(plan.base_branch().as_deref(), Some("main"));
    assert!(h.vcs.pushed().contains(&branch));

    let receipt = h.lifecycle.dispatch(plan.id).await.unwrap();
    assert!(receipt.is_changed());
    let receipt = receipt.into_inner();
    assert_eq!(receipt.branch_name, branch);
    assert!(receipt.branch_reused);
    assert_eq!(receipt.run_id, "run-1");

    let dispatches = h.dispatcher.dispatches();
    assert_eq!(dispatches.len(), 1);
    assert_eq!(dispatches[0].0, "implement-plan.yml");
    assert_eq!(dispatches[0].1["branch_name"], branch);

    let plan = h.lifecycle.mark_implementing(plan.id).await.unwrap().into_inner();
    assert_eq!(plan.stage, Stage::Implementing);

    h.vcs.set_changes(&branch, changed());
    let outcome = h.lifecycle.complete_implementation(plan.id).await.unwrap();
    assert_eq!(
        outcome,
        Effect::Changed(ImplementationOutcome::ReadyForReview { diff: changed() })
    );

    let plan = h.lifecycle.mark_merged(plan.id).await.unwrap().into_inner();
    assert_eq!(plan.stage, Stage::Merged);
    assert_eq!(plan.branch_name.as_deref(), Some(branch.as_str()));
}

#[tokio::test]
async fn test_full_lifecycle_on_draft_pr_backend() {
    let h = harness_with(|store| Arc::new(DraftPrBackend::new(store, "octocat", "main")));
    let plan = submitted(&h, "Add retries").await;
    assert_eq!(plan.backend_provider, crate::plan::BackendProvider::DraftPr);
    let receipt = h.lifecycle.dispatch(plan.id).await.unwrap().into_inner();
    assert_eq!(Some(receipt.branch_name), plan.branch_name);
}

#[tokio::test]
async fn test_repeated_operations_are_no_change() {
    let h = harness();
    let plan = submitted(&h, "Idempotent").await;
    let again = h.lifecycle.submit(plan.id).await.unwrap();
    assert!(!again.is_changed());
    assert_eq!(again.value().branch_name, plan.branch_name);

    let first = h.lifecycle.dispatch(plan.id).await.unwrap().into_inner();
    let second = h.lifecycle.dispatch(plan.id).await.unwrap();
    assert!(!second.is_changed());
    assert_eq!(second.value().run_id, first.run_id);
    assert_eq!(h.dispatcher.dispatches().len(), 1);
}

#[tokio::test]
async fn test_ensure_branch_twice_creates_one_branch() {
    let h = harness();
    let plan = h.lifecycle.create_plan("Once", "steps", None).await.unwrap();

    let first = h.lifecycle.ensure_branch(&plan, "main").await.unwrap();
    assert!(!first.reused);
    let second = h.lifecycle.ensure_branch(&plan, "main").await.unwrap();
    assert!(second.reused);
    assert_eq!(first.name, second.name);

    let matching: Vec<String> = h
        .vcs
        .branch_names()
        .into_iter()
        .filter(|b| h.lifecycle.resolver().branch_matches_id(b, plan.id))
        .collect();
    assert_eq!(matching, vec![first.name]);
}

#[tokio::test]
async fn test_dispatch_reuses_prior_run_branch() {
    let h = harness();
    let plan = h.lifecycle.create_plan("Retry", "steps", None).await.unwrap();
    let prior = format!("P{}-retry-01-01-0900", plan.id);
    h.vcs.add_branch(&prior, Utc::now() - Duration::hours(3));

    let plan = h.lifecycle.submit(plan.id).await.unwrap().into_inner();
    assert_eq!(plan.branch_name.as_deref(), Some(prior.as_str()));

    let receipt = h.lifecycle.dispatch(plan.id).await.unwrap().into_inner();
    assert_eq!(receipt.branch_name, prior);
    assert!(receipt.branch_reused);
}

#[tokio::test]
async fn test_newest_branch_wins_and_others_untouched() {
    let h = harness();
    let plan = h.lifecycle.create_plan("Many", "steps", None).await.unwrap();
    let old = format!("P{}-many-01-01-0900", plan.id);
    let new = format!("P{}-many-01-02-0900", plan.id);
    h.vcs.add_branch(&old, Utc::now() - Duration::days(2));
    h.vcs.add_branch(&new, Utc::now() - Duration::days(1));
    h.vcs.add_branch(&format!("P{}0-other", plan.id), Utc::now());

    let ensured = h.lifecycle.ensure_branch(&plan, "main").await.unwrap();
    assert_eq!(ensured.name, new);
    assert!(h.vcs.branch_names().contains(&old));
}

#[tokio::test]
async fn test_stale_recorded_branch_is_replaced() {
    let h = harness();
    let plan = submitted(&h, "Stale").await;
    let recorded = plan.branch_name.clone().unwrap();
    h.vcs.delete_branch(&recorded);

    let receipt = h.lifecycle.dispatch(plan.id).await.unwrap().into_inner();
    assert!(!receipt.branch_reused);
    assert!(h.lifecycle.resolver().branch_matches_id(&receipt.branch_name, plan.id));
}

#[tokio::test]
async fn test_stacked_plan_branches_from_parent() {
    let h = harness();
    let parent = submitted(&h, "Parent").await;
    let parent_branch = parent.branch_name.clone().unwrap();

    let child = h
        .lifecycle
        .create_plan("Child", "steps", Some(parent.id))
        .await
        .unwrap();
    let child = h.lifecycle.submit(child.id).await.unwrap().into_inner();
    assert_eq!(child.base_branch(), Some(parent_branch.clone()));

    let receipt = h.lifecycle.dispatch(child.id).await.unwrap().into_inner();
    assert_eq!(receipt.base_branch, parent_branch);
}

#[tokio::test]
async fn test_stacked_plan_with_missing_parent_uses_trunk() {
    let h = harness();
    let child = h
        .lifecycle
        .create_plan("Orphan", "steps", Some(PlanId(999)))
        .await
        .unwrap();
    let child = h.lifecycle.submit(child.id).await.unwrap().into_inner();
    assert_eq!(child.base_branch().as_deref(), Some("main"));
}

#[tokio::test]
async fn test_no_changes_outcome() {
    let h = harness();
    let plan = submitted(&h, "Nothing").await;
    let _ = h.lifecycle.dispatch(plan.id).await.unwrap();
    let _ = h.lifecycle.mark_implementing(plan.id).await.unwrap();

    let outcome = h.lifecycle.complete_implementation(plan.id).await.unwrap();
    assert_eq!(outcome, Effect::Changed(ImplementationOutcome::NoChanges));

    let loaded = h.lifecycle.backend().get_plan(plan.id).await.unwrap().found().unwrap();
    assert_eq!(loaded.stage, Stage::Implementing);
    assert!(loaded.has_label("no-changes"));
    assert_eq!(loaded.field(keys::IMPLEMENTATION_OUTCOME), Some(&json!("no_changes")));

    let again = h.lifecycle.complete_implementation(plan.id).await.unwrap();
    assert_eq!(again, Effect::NoChange(ImplementationOutcome::NoChanges));
    let events = h
        .store
        .comments(plan.id.0)
        .into_iter()
        .filter(|c| c.body.contains("event-no-changes"))
        .count();
    assert_eq!(events, 1);
}

#[tokio::test]
async fn test_invalid_transitions() {
    let h = harness();
    let plan = h.lifecycle.create_plan("Skip", "steps", None).await.unwrap();

    let err = h.lifecycle.dispatch(plan.id).await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::InvalidTransition {
            from: Stage::Planned,
            to: Stage::Dispatched,
            ..
        }
    ));
    let err = h.lifecycle.mark_merged(plan.id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidTransition { .. }));

    let loaded = h.lifecycle.backend().get_plan(plan.id).await.unwrap().found().unwrap();
    assert_eq!(loaded.stage, Stage::Planned);
}

#[tokio::test]
async fn test_unknown_plan() {
    let h = harness();
    let err = h.lifecycle.submit(PlanId(404)).await.unwrap_err();
    assert!(matches!(err, LifecycleError::PlanNotFound(PlanId(404))));
}

#[tokio::test]
async fn test_submit_requires_plan_label() {
    let h = harness();
    let plan = h
        .lifecycle
        .backend()
        .create_plan(CreatePlanRequest::new("Unlabelled", "steps"))
        .await
        .unwrap();
    let err = h.lifecycle.submit(plan.id).await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::GuardFailed {
            guard: "label-invariant",
            ..
        }
    ));
    assert!(h.vcs.pushed().is_empty());
}

#[tokio::test]
async fn test_dispatch_failure_leaves_stage() {
    let h = harness();
    let plan = submitted(&h, "Flaky").await;
    h.dispatcher.set_failing(true);

    let err = h.lifecycle.dispatch(plan.id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Dispatch(RemoteError::Status { status: 500, .. })));
    let loaded = h.lifecycle.backend().get_plan(plan.id).await.unwrap().found().unwrap();
    assert_eq!(loaded.stage, Stage::Submitted);

    h.dispatcher.set_failing(false);
    assert!(h.lifecycle.dispatch(plan.id).await.unwrap().is_changed());
}

#[tokio::test]
async fn test_dispatch_records_run_metadata_and_event() {
    let h = harness();
    let plan = submitted(&h, "Recorded").await;
    let receipt = h.lifecycle.dispatch(plan.id).await.unwrap().into_inner();

    let loaded = h.lifecycle.backend().get_plan(plan.id).await.unwrap().found().unwrap();
    assert_eq!(loaded.stage, Stage::Dispatched);
    assert_eq!(
        loaded.field(keys::LAST_DISPATCHED_RUN_ID),
        Some(&json!(receipt.run_id))
    );
    assert!(loaded.field(keys::LAST_DISPATCHED_AT).is_some());
    assert!(
        h.store
            .comments(plan.id.0)
            .iter()
            .any(|c| c.body.contains("event-dispatched"))
    );
}

#[tokio::test]
async fn test_learn_status_transitions() {
    let h = harness();
    let plan = h.lifecycle.create_plan("Source", "steps", None).await.unwrap();

    let err = h.lifecycle.complete_learn(plan.id, None).await.unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidLearnTransition { .. }));

    assert!(h.lifecycle.begin_learn(plan.id).await.unwrap().is_changed());
    assert!(!h.lifecycle.begin_learn(plan.id).await.unwrap().is_changed());

    let done = h.lifecycle.complete_learn(plan.id, None).await.unwrap();
    assert_eq!(done, Effect::Changed(LearnStatus::CompletedNoPlan));
    let again = h.lifecycle.complete_learn(plan.id, None).await.unwrap();
    assert_eq!(again, Effect::NoChange(LearnStatus::CompletedNoPlan));

    let err = h.lifecycle.begin_learn(plan.id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidLearnTransition { .. }));
}

#[tokio::test]
async fn test_learn_plan_cannot_start_learn() {
    let h = harness();
    let source = h.lifecycle.create_plan("Source", "steps", None).await.unwrap();
    let learned = h
        .lifecycle
        .create_learn_plan(source.id, "Follow-up", "steps")
        .await
        .unwrap();
    assert!(learned.is_learn_plan());
    assert!(learned.has_label("learn-plan"));

    let err = h.lifecycle.begin_learn(learned.id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::LearnCycle(id) if id == learned.id));
    let loaded = h.lifecycle.backend().get_plan(learned.id).await.unwrap().found().unwrap();
    assert!(loaded.learn_status.is_none());
}

#[tokio::test]
async fn test_merged_learn_plan_lands_on_source() {
    let h = harness();
    let source = h.lifecycle.create_plan("Source", "steps", None).await.unwrap();
    let _ = h.lifecycle.begin_learn(source.id).await.unwrap();
    let learned = h
        .lifecycle
        .create_learn_plan(source.id, "Follow-up", "steps")
        .await
        .unwrap();
    let _ = h
        .lifecycle
        .complete_learn(source.id, Some(learned.id))
        .await
        .unwrap();

    let learned = h.lifecycle.submit(learned.id).await.unwrap().into_inner();
    let branch = learned.branch_name.clone().unwrap();
    let _ = h.lifecycle.dispatch(learned.id).await.unwrap();
    let _ = h.lifecycle.mark_implementing(learned.id).await.unwrap();
    h.vcs.set_changes(&branch, changed());
    let _ = h.lifecycle.complete_implementation(learned.id).await.unwrap();
    let _ = h.lifecycle.mark_merged(learned.id).await.unwrap();

    let source = h.lifecycle.backend().get_plan(source.id).await.unwrap().found().unwrap();
    assert_eq!(
        source.learn_status,
        Some(LearnStatus::PlanLanded {
            plan_id: learned.id
        })
    );
}

/// Wraps a real backend and fails selected writes on demand.
struct FlakyBackend {
    inner: Arc<dyn PlanBackend>,
    fail_run_id_write: std::sync::atomic::AtomicBool,
    labels_not_found: std::sync::atomic::AtomicBool,
}

impl FlakyBackend {
    fn set(flag: &std::sync::atomic::AtomicBool, value: bool) {
        flag.store(value, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl PlanBackend for FlakyBackend {
    fn provider(&self) -> crate::plan::BackendProvider {
        self.inner.provider()
    }

    async fn create_plan(&self, request: CreatePlanRequest) -> Result<Plan, crate::errors::PlanError> {
        self.inner.create_plan(request).await
    }

    async fn get_plan(&self, id: PlanId) -> Result<Lookup<Plan>, crate::errors::PlanError> {
        self.inner.get_plan(id).await
    }

    async fn get_metadata_field(
        &self,
        id: PlanId,
        field: &str,
    ) -> Result<Lookup<Option<Value>>, crate::errors::PlanError> {
        self.inner.get_metadata_field(id, field).await
    }

    async fn update_metadata(&self, id: PlanId, fields: Fields) -> Result<Mutation, crate::errors::PlanError> {
        let records_run = fields
            .get(keys::LAST_DISPATCHED_RUN_ID)
            .is_some_and(Value::is_string);
        if records_run
            && self
                .fail_run_id_write
                .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            return Err(RemoteError::Transport("connection reset".to_string()).into());
        }
        self.inner.update_metadata(id, fields).await
    }

    async fn update_body(&self, id: PlanId, body: &str) -> Result<Mutation, crate::errors::PlanError> {
        self.inner.update_body(id, body).await
    }

    async fn add_label(&self, id: PlanId, label: &str) -> Result<Mutation, crate::errors::PlanError> {
        if self.labels_not_found.load(std::sync::atomic::Ordering::SeqCst) {
            return Ok(Mutation::NotFound(id));
        }
        self.inner.add_label(id, label).await
    }

    async fn has_label(&self, id: PlanId, label: &str) -> Result<Lookup<bool>, crate::errors::PlanError> {
        self.inner.has_label(id, label).await
    }

    async fn post_event(
        &self,
        id: PlanId,
        kind: &str,
        payload: Fields,
    ) -> Result<Mutation, crate::errors::PlanError> {
        self.inner.post_event(id, kind, payload).await
    }
}

fn flaky_harness() -> (Harness, Arc<FlakyBackend>) {
    let store = Arc::new(MemoryStore::new("main"));
    let vcs = Arc::new(MemoryVcs::new("main"));
    let dispatcher = Arc::new(MemoryDispatcher::new());
    let flaky = Arc::new(FlakyBackend {
        inner: Arc::new(IssueBackend::new(store.clone(), "octocat")),
        fail_run_id_write: Default::default(),
        labels_not_found: Default::default(),
    });
    let lifecycle = Lifecycle::new(flaky.clone(), vcs.clone(), dispatcher.clone(), LifecycleConfig::default());
    (
        Harness {
            store,
            vcs,
            dispatcher,
            lifecycle,
        },
        flaky,
    )
}

#[tokio::test]
async fn test_dispatch_retry_after_lost_run_id_does_not_trigger_twice() {
    let (h, flaky) = flaky_harness();
    let plan = submitted(&h, "Retry safe").await;
    FlakyBackend::set(&flaky.fail_run_id_write, true);

    let err = h.lifecycle.dispatch(plan.id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Plan(_)), "{:?}", err);
    assert_eq!(h.dispatcher.dispatches().len(), 1);

    let loaded = h.lifecycle.backend().get_plan(plan.id).await.unwrap().found().unwrap();
    assert_eq!(loaded.stage, Stage::Dispatched);
    assert!(loaded.field(keys::LAST_DISPATCHED_RUN_ID).is_none());

    let retry = h.lifecycle.dispatch(plan.id).await.unwrap();
    assert!(!retry.is_changed());
    assert_eq!(retry.value().branch_name, plan.branch_name.clone().unwrap());
    assert_eq!(h.dispatcher.dispatches().len(), 1);
}

#[tokio::test]
async fn test_no_changes_label_on_missing_plan_is_an_error() {
    let (h, flaky) = flaky_harness();
    let plan = submitted(&h, "Vanished").await;
    let _ = h.lifecycle.dispatch(plan.id).await.unwrap();
    let _ = h.lifecycle.mark_implementing(plan.id).await.unwrap();
    FlakyBackend::set(&flaky.labels_not_found, true);

    let err = h.lifecycle.complete_implementation(plan.id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::PlanNotFound(id) if id == plan.id));
    let loaded = h.lifecycle.backend().get_plan(plan.id).await.unwrap().found().unwrap();
    assert!(loaded.field(keys::IMPLEMENTATION_OUTCOME).is_none());
}
