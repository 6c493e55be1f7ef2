//! One behavioral suite, instantiated once per backend. Every assertion here
//! must hold for both; a divergence is a bug in one of them.

use super::*;
use crate::errors::{PlanError, RemoteError};
use crate::remote::memory::MemoryStore;
use serde_json::{Value, json};
use std::sync::Arc;

macro_rules! plan_backend_conformance {
    ($suite:ident, $make:expr) => {
        mod $suite {
            use super::*;

            fn harness() -> (Arc<MemoryStore>, Box<dyn PlanBackend>) {
                let store = Arc::new(MemoryStore::new("main"));
                let make: fn(Arc<MemoryStore>) -> Box<dyn PlanBackend> = $make;
                (store.clone(), make(store))
            }

            fn request() -> CreatePlanRequest {
                CreatePlanRequest::new("Fix login redirect", "## Steps\n\n1. Reproduce\n2. Fix\n")
                    .with_label("plan")
            }

            #[tokio::test]
            async fn absent_plan_is_not_found() {
                let (_, backend) = harness();
                let lookup = backend.get_plan(PlanId(404)).await.unwrap();
                assert_eq!(lookup, Lookup::NotFound(PlanId(404)));
                let field = backend.get_metadata_field(PlanId(404), keys::STAGE).await.unwrap();
                assert!(field.is_not_found());
                let labelled = backend.has_label(PlanId(404), "plan").await.unwrap();
                assert!(labelled.is_not_found());
            }

            #[tokio::test]
            async fn created_plan_reads_back() {
                let (_, backend) = harness();
                let created = backend.create_plan(request()).await.unwrap();
                assert_eq!(created.stage, Stage::Planned);
                assert!(created.branch_name.is_none());
                assert_eq!(created.created_by, "octocat");
                assert_eq!(created.backend_provider, backend.provider());

                let loaded = backend.get_plan(created.id).await.unwrap().found().unwrap();
                assert_eq!(loaded.id, created.id);
                assert_eq!(loaded.title, "Fix login redirect");
                assert_eq!(loaded.body, "## Steps\n\n1. Reproduce\n2. Fix\n");
                assert_eq!(loaded.stage, Stage::Planned);
                assert_eq!(loaded.created_at, created.created_at);
                assert!(loaded.branch_name.is_none());
                assert!(loaded.has_label("plan"));
            }

            #[tokio::test]
            async fn metadata_update_is_field_level_merge() {
                let (_, backend) = harness();
                let plan = backend.create_plan(request()).await.unwrap();

                let first = Fields::from([
                    ("alpha".to_string(), json!(1)),
                    ("beta".to_string(), json!("two")),
                ]);
                assert!(backend.update_metadata(plan.id, first).await.unwrap().is_applied());
                let second = Fields::from([("beta".to_string(), json!("changed"))]);
                assert!(backend.update_metadata(plan.id, second).await.unwrap().is_applied());

                let get = |field: &'static str| {
                    let backend = &backend;
                    async move { backend.get_metadata_field(plan.id, field).await.unwrap() }
                };
                assert_eq!(get("alpha").await, Lookup::Found(Some(json!(1))));
                assert_eq!(get("beta").await, Lookup::Found(Some(json!("changed"))));
                assert_eq!(get(keys::STAGE).await, Lookup::Found(Some(json!("planned"))));

                let loaded = backend.get_plan(plan.id).await.unwrap().found().unwrap();
                assert_eq!(loaded.body, plan.body);
            }

            #[tokio::test]
            async fn absent_field_on_existing_plan_is_found_none() {
                let (_, backend) = harness();
                let plan = backend.create_plan(request()).await.unwrap();
                let field = backend.get_metadata_field(plan.id, "never-set").await.unwrap();
                assert_eq!(field, Lookup::Found(None));
            }

            #[tokio::test]
            async fn mutations_on_absent_plan_are_not_found() {
                let (_, backend) = harness();
                let id = PlanId(99);
                assert_eq!(
                    backend.update_metadata(id, Fields::new()).await.unwrap(),
                    Mutation::NotFound(id)
                );
                assert_eq!(backend.update_body(id, "x").await.unwrap(), Mutation::NotFound(id));
                assert_eq!(backend.add_label(id, "plan").await.unwrap(), Mutation::NotFound(id));
                assert_eq!(
                    backend.post_event(id, "note", Fields::new()).await.unwrap(),
                    Mutation::NotFound(id)
                );
            }

            #[tokio::test]
            async fn labels_are_idempotent() {
                let (_, backend) = harness();
                let plan = backend.create_plan(request()).await.unwrap();
                assert!(backend.add_label(plan.id, "no-changes").await.unwrap().is_applied());
                assert!(backend.add_label(plan.id, "no-changes").await.unwrap().is_applied());

                let loaded = backend.get_plan(plan.id).await.unwrap().found().unwrap();
                let count = loaded.labels.iter().filter(|l| *l == "no-changes").count();
                assert_eq!(count, 1);
                assert_eq!(
                    backend.has_label(plan.id, "no-changes").await.unwrap(),
                    Lookup::Found(true)
                );
                assert_eq!(
                    backend.has_label(plan.id, "other").await.unwrap(),
                    Lookup::Found(false)
                );
            }

            #[tokio::test]
            async fn body_update_preserves_metadata() {
                let (_, backend) = harness();
                let plan = backend.create_plan(request()).await.unwrap();
                let fields = Fields::from([(keys::BRANCH_NAME.to_string(), json!("P1-fix"))]);
                let _ = backend.update_metadata(plan.id, fields).await.unwrap();

                assert!(backend.update_body(plan.id, "rewritten").await.unwrap().is_applied());
                let loaded = backend.get_plan(plan.id).await.unwrap().found().unwrap();
                assert_eq!(loaded.body, "rewritten");
                assert_eq!(loaded.branch_name.as_deref(), Some("P1-fix"));
                assert_eq!(loaded.stage, Stage::Planned);
            }

            #[tokio::test]
            async fn body_with_markup_roundtrips() {
                let (_, backend) = harness();
                let body = "```yaml\nkey: value\n```\n\n<!-- END:plan-header -->\n<details>x</details>\n";
                let plan = backend
                    .create_plan(CreatePlanRequest::new("Markup", body))
                    .await
                    .unwrap();
                let loaded = backend.get_plan(plan.id).await.unwrap().found().unwrap();
                assert_eq!(loaded.body, body);
                assert_eq!(loaded.stage, Stage::Planned);
            }

            #[tokio::test]
            async fn damaged_header_is_corrupted_state() {
                let (store, backend) = harness();
                let plan = backend.create_plan(request()).await.unwrap();
                store.overwrite_document(plan.id.0, "someone replaced the description");

                let err = backend.get_plan(plan.id).await.unwrap_err();
                assert!(matches!(err, PlanError::CorruptedState { id, .. } if id == plan.id));
                let err = backend
                    .update_metadata(plan.id, Fields::new())
                    .await
                    .unwrap_err();
                assert!(matches!(err, PlanError::CorruptedState { .. }));
            }

            #[tokio::test]
            async fn unreachable_store_is_backend_error() {
                let (store, backend) = harness();
                let plan = backend.create_plan(request()).await.unwrap();
                store.set_unreachable(true);
                let err = backend.get_plan(plan.id).await.unwrap_err();
                assert!(matches!(err, PlanError::Backend(RemoteError::Transport(_))));
            }

            #[tokio::test]
            async fn event_is_posted_as_comment_block() {
                let (store, backend) = harness();
                let plan = backend.create_plan(request()).await.unwrap();
                let payload = Fields::from([("run_id".to_string(), json!("run-7"))]);
                assert!(backend.post_event(plan.id, "dispatched", payload).await.unwrap().is_applied());

                let event = store
                    .comments(plan.id.0)
                    .into_iter()
                    .find_map(|c| crate::metadata::decode(&c.body, "event-dispatched").unwrap())
                    .unwrap();
                assert_eq!(event["run_id"], json!("run-7"));
                assert!(matches!(event.get("timestamp"), Some(Value::String(_))));
            }

            #[tokio::test]
            async fn extra_request_fields_land_in_header() {
                let (_, backend) = harness();
                let plan = backend
                    .create_plan(
                        request()
                            .with_field(keys::PLAN_TYPE, json!("learn"))
                            .with_field(keys::LEARNED_FROM_ID, json!(12)),
                    )
                    .await
                    .unwrap();
                let loaded = backend.get_plan(plan.id).await.unwrap().found().unwrap();
                assert!(loaded.is_learn_plan());
                assert_eq!(loaded.learned_from_id, Some(PlanId(12)));
            }
        }
    };
}

plan_backend_conformance!(issue_backend, |store| Box::new(IssueBackend::new(store, "octocat")));

plan_backend_conformance!(draft_pr_backend, |store| {
    Box::new(DraftPrBackend::new(store, "octocat", "main"))
});
