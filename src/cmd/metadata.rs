//! `planwright metadata`: read plan header fields and decode blocks offline.

use anyhow::{Context, Result};
use planwright::config::PlanwrightConfig;
use planwright::errors::UserFacingError;
use planwright::metadata::{self, MarkerFormat};
use planwright::plan::{HEADER_KEY, Lookup, PlanId};
use serde_json::{Value, json};
use std::path::Path;

use super::services;

/// Print one header field of a plan. Strings print bare unless `json` is set.
pub async fn cmd_metadata_get(config: &PlanwrightConfig, id: PlanId, field: &str, json: bool) -> Result<()> {
    let backend = services::open_backend(config)?;
    let value = match backend.get_metadata_field(id, field).await? {
        Lookup::NotFound(_) => {
            return Err(UserFacingError::new("plan-not-found", format!("plan {} does not exist", id)).into());
        }
        Lookup::Found(None) => {
            return Err(UserFacingError::new(
                "field-missing",
                format!("plan {} has no '{}' field", id, field),
            )
            .into());
        }
        Lookup::Found(Some(value)) => value,
    };

    match value {
        Value::String(s) if !json => println!("{}", s),
        other => println!("{}", serde_json::to_string(&other)?),
    }
    Ok(())
}

/// Decode the `key` block from a local file and print it as JSON.
pub fn cmd_metadata_decode(path: &Path, key: Option<&str>) -> Result<()> {
    let key = key.unwrap_or(HEADER_KEY);
    let container =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;

    let block = metadata::find_block(&container, key)
        .with_context(|| format!("Block '{}' in {} is malformed", key, path.display()))?;
    let Some(block) = block else {
        return Err(UserFacingError::new(
            "block-missing",
            format!("{} has no '{}' block", path.display(), key),
        )
        .into());
    };

    let format = match block.format {
        MarkerFormat::Current => "current",
        MarkerFormat::Legacy => "legacy",
    };
    let out = json!({
        "key": key,
        "schema_version": block.schema_version,
        "format": format,
        "fields": block.fields,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
