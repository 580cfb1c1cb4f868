//! Flow-file records
//!
//! A flow file is a unit of work: an attribute map plus a reference to
//! immutable content held by the content repository.

use crate::claim::ContentClaim;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Core attribute names carried by every flow file.
pub mod attributes {
    /// Stable UUID of the flow file
    pub const UUID: &str = "uuid";
    /// Logical file name
    pub const FILENAME: &str = "filename";
    /// Logical path
    pub const PATH: &str = "path";
    /// Reason a flow file was discarded
    pub const DISCARD_REASON: &str = "discard.reason";
    /// Alternate identifier assigned by an external system
    pub const ALTERNATE_IDENTIFIER: &str = "alternate.identifier";
    /// Marks a flow file produced by replaying a provenance event
    pub const REPLAY: &str = "flowfile.replay";
    /// Wall-clock timestamp at which the replay was performed
    pub const REPLAY_TIMESTAMP: &str = "flowfile.replay.timestamp";
}

/// Reference to a span of content within a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentClaimRef {
    /// The claim identifying the blob
    pub claim: ContentClaim,
    /// Offset of this flow file's content within the claim
    pub offset: u64,
    /// Content length in bytes
    pub size: u64,
}

/// A unit of work traversing the flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowFileRecord {
    /// Monotone sequence id issued by the flow-file repository
    pub id: u64,
    /// Instant this record entered the flow
    pub entry_date: DateTime<Utc>,
    /// Start of this record's lineage (inherited across forks)
    pub lineage_start: DateTime<Utc>,
    /// Lineage identifiers this record descends from
    pub lineage_ids: HashSet<String>,
    /// Attribute map; always contains [`attributes::UUID`]
    pub attributes: HashMap<String, String>,
    /// Content reference, if the record has content
    pub content: Option<ContentClaimRef>,
}

impl FlowFileRecord {
    /// UUID attribute of this record.
    pub fn uuid(&self) -> &str {
        self.attributes
            .get(attributes::UUID)
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Content size in bytes (0 when the record has no content).
    pub fn content_size(&self) -> u64 {
        self.content.as_ref().map(|c| c.size).unwrap_or(0)
    }

    /// Age of the record relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.entry_date
    }
}

/// Builder for flow-file records.
#[derive(Debug, Default)]
pub struct FlowFileBuilder {
    id: u64,
    attributes: HashMap<String, String>,
    lineage_ids: HashSet<String>,
    lineage_start: Option<DateTime<Utc>>,
    content: Option<ContentClaimRef>,
}

impl FlowFileBuilder {
    /// Start a builder for the given repository sequence id.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Set a single attribute.
    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Merge a map of attributes.
    pub fn attributes(mut self, attrs: HashMap<String, String>) -> Self {
        self.attributes.extend(attrs);
        self
    }

    /// Add a lineage identifier.
    pub fn lineage_id(mut self, id: impl Into<String>) -> Self {
        self.lineage_ids.insert(id.into());
        self
    }

    /// Inherit a lineage start instant (defaults to now).
    pub fn lineage_start(mut self, start: DateTime<Utc>) -> Self {
        self.lineage_start = Some(start);
        self
    }

    /// Attach a content reference.
    pub fn content(mut self, content: ContentClaimRef) -> Self {
        self.content = Some(content);
        self
    }

    /// Finish the record, assigning a fresh UUID attribute if absent.
    pub fn build(mut self) -> FlowFileRecord {
        let now = Utc::now();
        self.attributes
            .entry(attributes::UUID.to_string())
            .or_insert_with(|| Uuid::new_v4().to_string());
        FlowFileRecord {
            id: self.id,
            entry_date: now,
            lineage_start: self.lineage_start.unwrap_or(now),
            lineage_ids: self.lineage_ids,
            attributes: self.attributes,
            content: self.content,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_assigns_uuid() {
        let record = FlowFileBuilder::new(1).build();
        assert!(!record.uuid().is_empty());
        assert_eq!(record.content_size(), 0);
    }

    #[test]
    fn test_builder_keeps_explicit_uuid() {
        let record = FlowFileBuilder::new(2)
            .attribute(attributes::UUID, "fixed-uuid")
            .build();
        assert_eq!(record.uuid(), "fixed-uuid");
    }
}
