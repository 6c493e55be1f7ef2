//! Marker-delimited YAML blocks.
//!
//! Current format:
//!
//! ````text
//! <!-- BEGIN:plan-header schema=2 -->
//! ```yaml
//! stage: planned
//! ```
//! <!-- END:plan-header -->
//! ````
//!
//! The legacy format (schema 1) used `<!-- metadata-block:KEY -->` and
//! `<!-- /metadata-block:KEY -->` around unfenced YAML. Legacy blocks are
//! read but never written; `replace_block` upgrades them in place.
//!
//! Markers only count at the start of a line, so indented text inside a YAML
//! block scalar can never terminate a block early.

use super::Fields;
use crate::errors::CodecError;
use regex::{Captures, Regex};
use std::ops::Range;
use std::sync::LazyLock;

pub const CURRENT_SCHEMA_VERSION: u32 = 2;
pub const LEGACY_SCHEMA_VERSION: u32 = 1;

// Each marker form captures its key as group 1; callers compare it against
// the key they want.
static BEGIN_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^<!-- BEGIN:([a-z0-9][a-z0-9-]*) schema=(\d+) -->[ \t]*$").unwrap());
static END_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^<!-- END:([a-z0-9][a-z0-9-]*) -->[ \t]*$").unwrap());
static LEGACY_BEGIN_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^<!-- metadata-block:([a-z0-9][a-z0-9-]*) -->[ \t]*$").unwrap());
static LEGACY_END_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^<!-- /metadata-block:([a-z0-9][a-z0-9-]*) -->[ \t]*$").unwrap());

/// Which marker syntax a block was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerFormat {
    Current,
    Legacy,
}

/// A block located inside a container, with its byte span.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBlock {
    pub fields: Fields,
    pub schema_version: u32,
    pub format: MarkerFormat,
    /// Byte range from the start of the opening marker to the end of the
    /// closing marker.
    pub span: Range<usize>,
}

/// Reject keys that could collide with marker syntax.
pub fn validate_key(key: &str) -> Result<(), CodecError> {
    let mut chars = key.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_lowercase() || first.is_ascii_digit() => {
            chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(CodecError::InvalidKey(key.to_string()))
    }
}

/// Encode `fields` as a block named `key` in the current format.
pub fn encode(key: &str, fields: &Fields) -> Result<String, CodecError> {
    validate_key(key)?;
    let yaml = if fields.is_empty() {
        "{}\n".to_string()
    } else {
        serde_yaml::to_string(fields).map_err(|e| CodecError::Serialize {
            key: key.to_string(),
            reason: e.to_string(),
        })?
    };
    Ok(format!(
        "<!-- BEGIN:{key} schema={CURRENT_SCHEMA_VERSION} -->\n```yaml\n{yaml}```\n<!-- END:{key} -->"
    ))
}

/// Decode the block named `key` from `container`.
///
/// Returns `Ok(None)` when no block with that key is present. A block that is
/// present but unterminated or unparseable is an error.
pub fn decode(container: &str, key: &str) -> Result<Option<Fields>, CodecError> {
    Ok(find_block(container, key)?.map(|b| b.fields))
}

/// Locate and decode the block named `key`. Current markers take precedence
/// over legacy ones when both are present.
pub fn find_block(container: &str, key: &str) -> Result<Option<DecodedBlock>, CodecError> {
    validate_key(key)?;

    if let Some(caps) = find_marker(&BEGIN_MARKER, container, key, 0) {
        let (whole, version) = match (caps.get(0), caps.get(2)) {
            (Some(whole), Some(version)) => (whole, version),
            _ => return Err(malformed(key, "opening marker did not match")),
        };
        let schema_version: u32 = version
            .as_str()
            .parse()
            .map_err(|_| malformed(key, "schema version is not a number"))?;
        let closing = find_marker(&END_MARKER, container, key, whole.end())
            .and_then(|caps| caps.get(0))
            .ok_or_else(|| malformed(key, "missing END marker"))?;

        let inner = strip_fence(&container[whole.end()..closing.start()]);
        return Ok(Some(DecodedBlock {
            fields: parse_fields(key, inner)?,
            schema_version,
            format: MarkerFormat::Current,
            span: whole.start()..closing.end(),
        }));
    }

    if let Some(opening) = find_marker(&LEGACY_BEGIN_MARKER, container, key, 0).and_then(|caps| caps.get(0)) {
        let closing = find_marker(&LEGACY_END_MARKER, container, key, opening.end())
            .and_then(|caps| caps.get(0))
            .ok_or_else(|| malformed(key, "missing closing legacy marker"))?;

        let inner = &container[opening.end()..closing.start()];
        return Ok(Some(DecodedBlock {
            fields: parse_fields(key, inner)?,
            schema_version: LEGACY_SCHEMA_VERSION,
            format: MarkerFormat::Legacy,
            span: opening.start()..closing.end(),
        }));
    }

    Ok(None)
}

/// Rewrite the block named `key` with `fields`, preserving all surrounding
/// text. Appends a new block when the key is absent.
pub fn replace_block(container: &str, key: &str, fields: &Fields) -> Result<String, CodecError> {
    let encoded = encode(key, fields)?;
    match find_block(container, key)? {
        Some(block) => {
            let mut out = String::with_capacity(container.len() + encoded.len());
            out.push_str(&container[..block.span.start]);
            out.push_str(&encoded);
            out.push_str(&container[block.span.end..]);
            Ok(out)
        }
        None if container.trim().is_empty() => Ok(encoded),
        None => Ok(format!("{}\n\n{}", container.trim_end(), encoded)),
    }
}

/// First marker starting at or after `from` whose key is `key`.
fn find_marker<'h>(marker: &Regex, container: &'h str, key: &str, from: usize) -> Option<Captures<'h>> {
    marker
        .captures_iter(container)
        .filter(|caps| caps.get(0).is_some_and(|m| m.start() >= from))
        .find(|caps| caps.get(1).is_some_and(|k| k.as_str() == key))
}

fn malformed(key: &str, reason: &str) -> CodecError {
    CodecError::Malformed {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

/// Drop the ```yaml fence lines around a current-format body.
fn strip_fence(inner: &str) -> &str {
    let inner = inner.strip_prefix('\n').unwrap_or(inner);
    let inner = match inner.find('\n') {
        Some(pos) if inner.starts_with("```") => &inner[pos + 1..],
        _ => inner,
    };
    let trimmed = inner.trim_end_matches(['\n', ' ', '\t']);
    match trimmed.rfind('\n') {
        Some(pos) if trimmed[pos + 1..].trim() == "```" => &trimmed[..pos + 1],
        None if trimmed.trim() == "```" => "",
        _ => inner,
    }
}

fn parse_fields(key: &str, yaml: &str) -> Result<Fields, CodecError> {
    if yaml.trim().is_empty() {
        return Ok(Fields::new());
    }
    let value: serde_yaml::Value =
        serde_yaml::from_str(yaml).map_err(|e| malformed(key, &format!("invalid YAML: {}", e)))?;
    if value.is_null() {
        return Ok(Fields::new());
    }
    if !value.is_mapping() {
        return Err(malformed(key, "block body is not a mapping"));
    }
    serde_yaml::from_value(value).map_err(|e| malformed(key, &format!("unsupported field value: {}", e)))
}
