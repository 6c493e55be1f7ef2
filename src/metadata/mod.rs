//! Structured metadata embedded in free-text documents.
//!
//! Plans live inside issue bodies, comments and pull-request descriptions.
//! The codec stores typed fields inside delimited regions of that text so a
//! document can carry both human prose and machine state.

pub mod codec;
pub mod render;

pub use codec::{
    CURRENT_SCHEMA_VERSION, DecodedBlock, LEGACY_SCHEMA_VERSION, MarkerFormat, decode, encode,
    find_block, replace_block, validate_key,
};
pub use render::{render_collapsible, strip_presentation};

use crate::errors::CodecError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field map stored in a block. Ordered so encoding is deterministic.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// Where a block lives relative to the remote entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerLocation {
    /// The issue body or pull-request description.
    PrimaryDocument,
    /// A comment posted after the entity was created.
    FollowUpComment,
}

/// A decoded metadata block together with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataBlock {
    pub key: String,
    pub location: ContainerLocation,
    pub schema_version: u32,
    pub fields: Fields,
}

impl MetadataBlock {
    /// A new block at the current schema version.
    pub fn new(key: impl Into<String>, location: ContainerLocation, fields: Fields) -> Self {
        Self {
            key: key.into(),
            location,
            schema_version: CURRENT_SCHEMA_VERSION,
            fields,
        }
    }

    /// Read the block named `key` out of `container`.
    ///
    /// Returns `Ok(None)` when the key is simply not present.
    pub fn read(
        container: &str,
        key: &str,
        location: ContainerLocation,
    ) -> Result<Option<Self>, CodecError> {
        Ok(find_block(container, key)?.map(|decoded| Self {
            key: key.to_string(),
            location,
            schema_version: decoded.schema_version,
            fields: decoded.fields,
        }))
    }

    /// Encode the block in the current marker format.
    pub fn encode(&self) -> Result<String, CodecError> {
        encode(&self.key, &self.fields)
    }

    /// Encode and wrap in a collapsible section for display.
    pub fn render(&self) -> Result<String, CodecError> {
        Ok(render_collapsible(&self.key, &self.encode()?))
    }

    /// Merge `updates` into this block's fields. Existing keys are overwritten,
    /// everything else is kept.
    pub fn merge(&mut self, updates: Fields) {
        self.fields.extend(updates);
    }

    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.fields.get(field)
    }
}
