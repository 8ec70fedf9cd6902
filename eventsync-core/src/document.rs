//! Synchronized documents and deletion tombstones.
//!
//! A [`SyncDocument`] carries an opaque payload plus the metadata the sync
//! engine needs to merge replicas: a per-id `version` that only increases,
//! the server-side `last_modified` used as the pull cursor, and the
//! retention hints used by the device cache.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// How important it is to keep a document cached under storage pressure.
///
/// Ordered from most to least important: `Critical < High < Medium < Low < Temporary`.
/// Eviction removes `Temporary` documents first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetentionPriority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
    Temporary,
}

impl RetentionPriority {
    /// Numeric rank used for storage, 0 (critical) through 4 (temporary).
    pub fn rank(self) -> i64 {
        match self {
            RetentionPriority::Critical => 0,
            RetentionPriority::High => 1,
            RetentionPriority::Medium => 2,
            RetentionPriority::Low => 3,
            RetentionPriority::Temporary => 4,
        }
    }

    /// Inverse of [`RetentionPriority::rank`].
    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(RetentionPriority::Critical),
            1 => Some(RetentionPriority::High),
            2 => Some(RetentionPriority::Medium),
            3 => Some(RetentionPriority::Low),
            4 => Some(RetentionPriority::Temporary),
            _ => None,
        }
    }
}

impl fmt::Display for RetentionPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetentionPriority::Critical => write!(f, "critical"),
            RetentionPriority::High => write!(f, "high"),
            RetentionPriority::Medium => write!(f, "medium"),
            RetentionPriority::Low => write!(f, "low"),
            RetentionPriority::Temporary => write!(f, "temporary"),
        }
    }
}

impl FromStr for RetentionPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(RetentionPriority::Critical),
            "high" => Ok(RetentionPriority::High),
            "medium" => Ok(RetentionPriority::Medium),
            "low" => Ok(RetentionPriority::Low),
            "temporary" => Ok(RetentionPriority::Temporary),
            _ => Err(format!(
                "Invalid retention priority '{}'. Valid options: critical, high, medium, low, temporary",
                s
            )),
        }
    }
}

/// Sync metadata attached to every document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    /// Per-id version, strictly increasing across writes.
    pub version: u64,
    /// Server-side modification time; the pull cursor.
    pub last_modified: DateTime<Utc>,
    /// Device-local time this replica last confirmed the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<DateTime<Utc>>,
    /// After this instant the document is treated as absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retention_priority: RetentionPriority,
    /// Only set on tombstones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Only set on tombstones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<String>,
}

impl DocumentMetadata {
    /// Metadata for a live document at `version`.
    pub fn new(version: u64, last_modified: DateTime<Utc>) -> Self {
        Self {
            version,
            last_modified,
            last_synced: None,
            expires_at: None,
            retention_priority: RetentionPriority::default(),
            deleted_at: None,
            deleted_by: None,
        }
    }
}

/// A document distributed by the sync engine.
///
/// The payload type is left to the application; the engine itself only ever
/// handles `SyncDocument<serde_json::Value>` and never inspects `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDocument<T = Value> {
    pub id: String,
    pub collection: String,
    pub data: T,
    pub metadata: DocumentMetadata,
}

impl<T> SyncDocument<T> {
    /// Creates a live document.
    pub fn new(
        collection: impl Into<String>,
        id: impl Into<String>,
        data: T,
        version: u64,
        last_modified: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            collection: collection.into(),
            data,
            metadata: DocumentMetadata::new(version, last_modified),
        }
    }

    pub fn with_priority(mut self, priority: RetentionPriority) -> Self {
        self.metadata.retention_priority = priority;
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.metadata.expires_at = Some(expires_at);
        self
    }

    pub fn version(&self) -> u64 {
        self.metadata.version
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.metadata.last_modified
    }

    /// True once `expires_at` is at or before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.metadata
            .expires_at
            .map(|expires| expires <= now)
            .unwrap_or(false)
    }

    pub fn is_tombstone(&self) -> bool {
        self.metadata.deleted_at.is_some()
    }

    /// Rejects documents that cannot be merged safely.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.id.trim().is_empty() {
            return Err(CoreError::MalformedDocument(
                "document id is empty".to_string(),
            ));
        }
        if self.collection.trim().is_empty() {
            return Err(CoreError::MalformedDocument(format!(
                "document {} has no collection",
                self.id
            )));
        }
        if self.metadata.version == 0 {
            return Err(CoreError::MalformedDocument(format!(
                "document {}/{} has version 0",
                self.collection, self.id
            )));
        }
        Ok(())
    }
}

impl<T: Serialize> SyncDocument<T> {
    /// Size in bytes of the JSON encoding; what the device quota counts.
    pub fn encoded_size(&self) -> Result<usize, CoreError> {
        Ok(serde_json::to_vec(self)?.len())
    }

    /// Erases the payload type.
    pub fn into_json(self) -> Result<SyncDocument<Value>, CoreError> {
        Ok(SyncDocument {
            id: self.id,
            collection: self.collection,
            data: serde_json::to_value(self.data)?,
            metadata: self.metadata,
        })
    }
}

impl SyncDocument<Value> {
    /// Parses an untyped wire value, validating required metadata.
    pub fn from_value(value: Value) -> Result<Self, CoreError> {
        let doc: SyncDocument<Value> = serde_json::from_value(value)
            .map_err(|e| CoreError::MalformedDocument(e.to_string()))?;
        doc.validate()?;
        Ok(doc)
    }

    /// Decodes the payload into an application type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<SyncDocument<T>, CoreError> {
        Ok(SyncDocument {
            id: self.id.clone(),
            collection: self.collection.clone(),
            data: serde_json::from_value(self.data.clone())?,
            metadata: self.metadata.clone(),
        })
    }
}

/// Tombstone standing in for a deleted document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionRecord {
    pub id: String,
    pub collection: String,
    pub deleted_at: DateTime<Utc>,
    pub deleted_by: String,
    /// Version at the time of deletion; must exceed the last live version.
    pub version: u64,
}

impl DeletionRecord {
    pub fn new(
        collection: impl Into<String>,
        id: impl Into<String>,
        version: u64,
        deleted_at: DateTime<Utc>,
        deleted_by: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            collection: collection.into(),
            deleted_at,
            deleted_by: deleted_by.into(),
            version,
        }
    }

    /// Parses an untyped wire value, validating required fields.
    pub fn from_value(value: Value) -> Result<Self, CoreError> {
        let record: DeletionRecord = serde_json::from_value(value)
            .map_err(|e| CoreError::MalformedDocument(e.to_string()))?;
        if record.id.trim().is_empty() || record.collection.trim().is_empty() {
            return Err(CoreError::MalformedDocument(
                "deletion record without id or collection".to_string(),
            ));
        }
        if record.version == 0 {
            return Err(CoreError::MalformedDocument(format!(
                "deletion record {}/{} has version 0",
                record.collection, record.id
            )));
        }
        Ok(record)
    }
}
