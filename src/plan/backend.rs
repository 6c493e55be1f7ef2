use super::{BackendProvider, Plan, PlanId, Stage, keys};
use crate::errors::{CodecError, PlanError};
use crate::metadata::{self, Fields};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

/// Result of a read. Absence is a value, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    NotFound(PlanId),
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound(_) => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Lookup::NotFound(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Lookup::Found(value) => Lookup::Found(f(value)),
            Lookup::NotFound(id) => Lookup::NotFound(id),
        }
    }
}

/// Result of a mutation on a plan that may not exist.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Applied,
    NotFound(PlanId),
}

impl Mutation {
    pub fn is_applied(&self) -> bool {
        matches!(self, Mutation::Applied)
    }
}

/// Everything needed to create a plan.
#[derive(Debug, Clone, Default)]
pub struct CreatePlanRequest {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    /// Extra header fields such as `plan_type` or `parent_plan_id`.
    pub fields: Fields,
}

impl CreatePlanRequest {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        let label = label.into();
        if !self.labels.contains(&label) {
            self.labels.push(label);
        }
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// Storage for plans.
///
/// Both implementations must behave identically; the shared conformance
/// suite in `plan::conformance` runs the same assertions against each.
#[async_trait]
pub trait PlanBackend: Send + Sync {
    fn provider(&self) -> BackendProvider;

    /// Create a plan in the `planned` stage with no branch.
    async fn create_plan(&self, request: CreatePlanRequest) -> Result<Plan, PlanError>;

    async fn get_plan(&self, id: PlanId) -> Result<Lookup<Plan>, PlanError>;

    /// Read one header field without loading the body. An existing plan
    /// without the field is `Found(None)`.
    async fn get_metadata_field(
        &self,
        id: PlanId,
        field: &str,
    ) -> Result<Lookup<Option<Value>>, PlanError>;

    /// Merge `fields` into the header. Fields not named are left untouched.
    async fn update_metadata(&self, id: PlanId, fields: Fields) -> Result<Mutation, PlanError>;

    /// Replace the body, keeping the header.
    async fn update_body(&self, id: PlanId, body: &str) -> Result<Mutation, PlanError>;

    /// Idempotent.
    async fn add_label(&self, id: PlanId, label: &str) -> Result<Mutation, PlanError>;

    async fn has_label(&self, id: PlanId, label: &str) -> Result<Lookup<bool>, PlanError>;

    /// Record an event on the plan as an `event-<kind>` block.
    async fn post_event(&self, id: PlanId, kind: &str, payload: Fields)
    -> Result<Mutation, PlanError>;
}

pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Header for a freshly created plan.
pub(crate) fn initial_header(request: &CreatePlanRequest, created_by: &str, now: DateTime<Utc>) -> Fields {
    let mut header = request.fields.clone();
    header.insert(keys::STAGE.to_string(), Value::String(Stage::Planned.to_string()));
    header.insert(keys::CREATED_AT.to_string(), Value::String(timestamp(now)));
    header.insert(keys::CREATED_BY.to_string(), Value::String(created_by.to_string()));
    header.insert(keys::BRANCH_NAME.to_string(), Value::Null);
    header
}

/// Render an event comment: the payload plus a timestamp, under
/// `event-<kind>`.
pub(crate) fn render_event(kind: &str, mut payload: Fields) -> Result<String, CodecError> {
    let key = format!("event-{}", kind);
    payload.insert("timestamp".to_string(), Value::String(timestamp(Utc::now())));
    Ok(metadata::render_collapsible(&key, &metadata::encode(&key, &payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_initial_header_sets_lifecycle_fields() {
        let request = CreatePlanRequest::new("t", "b").with_field(keys::PARENT_PLAN_ID, json!(3));
        let now = DateTime::parse_from_rfc3339("2024-01-15T14:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let header = initial_header(&request, "octocat", now);
        assert_eq!(header[keys::STAGE], json!("planned"));
        assert_eq!(header[keys::CREATED_AT], json!("2024-01-15T14:30:00Z"));
        assert_eq!(header[keys::BRANCH_NAME], Value::Null);
        assert_eq!(header[keys::PARENT_PLAN_ID], json!(3));
    }

    #[test]
    fn test_request_labels_deduplicated() {
        let request = CreatePlanRequest::new("t", "b").with_label("plan").with_label("plan");
        assert_eq!(request.labels, vec!["plan".to_string()]);
    }

    #[test]
    fn test_render_event_includes_timestamp() {
        let mut payload = Fields::new();
        payload.insert("run_id".into(), json!("run-1"));
        let text = render_event("dispatched", payload).unwrap();
        let decoded = metadata::decode(&text, "event-dispatched").unwrap().unwrap();
        assert_eq!(decoded["run_id"], json!("run-1"));
        assert!(decoded.contains_key("timestamp"));
    }

    #[test]
    fn test_render_event_rejects_bad_kind() {
        assert!(matches!(
            render_event("Bad Kind", Fields::new()),
            Err(CodecError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_lookup_helpers() {
        let found: Lookup<u32> = Lookup::Found(3);
        assert_eq!(found.clone().map(|v| v * 2), Lookup::Found(6));
        assert_eq!(found.found(), Some(3));
        assert!(Lookup::<u32>::NotFound(PlanId(1)).is_not_found());
    }
}
