//! Flow-file records: the unit of work moving across connections.
//!
//! A record is a small, cheaply-cloneable handle: an attribute map plus a
//! reference to immutable content in the content repository. The payload
//! itself never travels through the engine.

use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

use crate::model::claim::ContentClaim;

/// Well-known attribute names carried by every record.
pub mod attributes {
    pub const UUID: &str = "uuid";
    pub const FILENAME: &str = "filename";
    pub const PATH: &str = "path";
    pub const DISCARD_REASON: &str = "discard.reason";
    pub const ALTERNATE_IDENTIFIER: &str = "alternate.identifier";
    pub const REPLAY: &str = "flowfile.replay";
    pub const REPLAY_TIMESTAMP: &str = "flowfile.replay.timestamp";
}

/// An immutable unit of work.
///
/// Identity is the repository-issued sequence number plus the `uuid`
/// attribute. Records are wrapped in [`Arc`] by queues, so cloning a
/// [`FlowFileRecord`] out of a builder is the only copy ever made.
#[derive(Clone, Debug)]
pub struct FlowFileRecord {
    id: u64,
    entry_date: DateTime<Utc>,
    lineage_start_date: DateTime<Utc>,
    lineage_identifiers: FxHashSet<String>,
    attributes: FxHashMap<String, String>,
    content_claim: Option<ContentClaim>,
    content_claim_offset: u64,
    size: u64,
}

impl FlowFileRecord {
    #[must_use]
    pub fn builder() -> FlowFileRecordBuilder {
        FlowFileRecordBuilder::default()
    }

    /// Repository-issued monotone sequence number.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// When the record entered the flow.
    #[must_use]
    pub fn entry_date(&self) -> DateTime<Utc> {
        self.entry_date
    }

    /// When the oldest ancestor of this record entered the flow.
    #[must_use]
    pub fn lineage_start_date(&self) -> DateTime<Utc> {
        self.lineage_start_date
    }

    #[must_use]
    pub fn lineage_identifiers(&self) -> &FxHashSet<String> {
        &self.lineage_identifiers
    }

    #[must_use]
    pub fn attributes(&self) -> &FxHashMap<String, String> {
        &self.attributes
    }

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// The `uuid` attribute, empty when absent (it never should be).
    #[must_use]
    pub fn uuid(&self) -> &str {
        self.attribute(attributes::UUID).unwrap_or_default()
    }

    #[must_use]
    pub fn content_claim(&self) -> Option<&ContentClaim> {
        self.content_claim.as_ref()
    }

    #[must_use]
    pub fn content_claim_offset(&self) -> u64 {
        self.content_claim_offset
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Age of the record relative to `now`.
    #[must_use]
    pub fn age_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.entry_date
    }
}

/// Builder for [`FlowFileRecord`].
///
/// `from_record` seeds the builder with an existing record's fields, which
/// is how triggers derive children and how replay reconstructs a unit of
/// work from provenance.
#[derive(Debug, Default)]
pub struct FlowFileRecordBuilder {
    id: u64,
    entry_date: Option<DateTime<Utc>>,
    lineage_start_date: Option<DateTime<Utc>>,
    lineage_identifiers: FxHashSet<String>,
    attributes: FxHashMap<String, String>,
    content_claim: Option<ContentClaim>,
    content_claim_offset: u64,
    size: u64,
}

impl FlowFileRecordBuilder {
    #[must_use]
    pub fn from_record(record: &FlowFileRecord) -> Self {
        Self {
            id: record.id,
            entry_date: Some(record.entry_date),
            lineage_start_date: Some(record.lineage_start_date),
            lineage_identifiers: record.lineage_identifiers.clone(),
            attributes: record.attributes.clone(),
            content_claim: record.content_claim.clone(),
            content_claim_offset: record.content_claim_offset,
            size: record.size,
        }
    }

    #[must_use]
    pub fn id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn entry_date(mut self, when: DateTime<Utc>) -> Self {
        self.entry_date = Some(when);
        self
    }

    #[must_use]
    pub fn lineage_start_date(mut self, when: DateTime<Utc>) -> Self {
        self.lineage_start_date = Some(when);
        self
    }

    #[must_use]
    pub fn lineage_identifier(mut self, id: impl Into<String>) -> Self {
        self.lineage_identifiers.insert(id.into());
        self
    }

    #[must_use]
    pub fn lineage_identifiers(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.lineage_identifiers.extend(ids);
        self
    }

    #[must_use]
    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn attributes(mut self, attrs: impl IntoIterator<Item = (String, String)>) -> Self {
        self.attributes.extend(attrs);
        self
    }

    #[must_use]
    pub fn remove_attributes(mut self, keys: &[&str]) -> Self {
        for key in keys {
            self.attributes.remove(*key);
        }
        self
    }

    #[must_use]
    pub fn content_claim(mut self, claim: ContentClaim) -> Self {
        self.content_claim = Some(claim);
        self
    }

    #[must_use]
    pub fn content_claim_offset(mut self, offset: u64) -> Self {
        self.content_claim_offset = offset;
        self
    }

    #[must_use]
    pub fn size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<FlowFileRecord> {
        let now = Utc::now();
        Arc::new(FlowFileRecord {
            id: self.id,
            entry_date: self.entry_date.unwrap_or(now),
            lineage_start_date: self.lineage_start_date.or(self.entry_date).unwrap_or(now),
            lineage_identifiers: self.lineage_identifiers,
            attributes: self.attributes,
            content_claim: self.content_claim,
            content_claim_offset: self.content_claim_offset,
            size: self.size,
        })
    }
}
