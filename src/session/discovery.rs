use super::{SessionRecord, SourceType};
use crate::errors::PreprocessError;
use crate::plan::PlanId;
use std::path::Path;
use walkdir::WalkDir;

/// Find `*.jsonl` session logs under `root`, sorted by path. The file stem is
/// the session id.
pub fn discover_sessions(
    root: &Path,
    owning_plan_id: Option<PlanId>,
) -> Result<Vec<SessionRecord>, PreprocessError> {
    let mut sessions = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| PreprocessError::Discover {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        if let Some(record) = SessionRecord::from_path(path, SourceType::Local, owning_plan_id) {
            sessions.push(record);
        }
    }
    Ok(sessions)
}
