//! Device-local replica.
//!
//! Documents, tombstones and per-collection sync cursors live in one SQLite
//! file (`<data_dir>/<db_name>.db`). Every write goes through a version guard:
//! a record whose version is not newer than what is already stored (live or
//! tombstoned) is dropped silently, so pushes and pulls can be applied in any
//! order.
//!
//! The store enforces a byte quota over live documents. When it is exceeded,
//! documents are evicted until usage falls to [`EVICTION_TARGET_RATIO`] of
//! the limit: expired documents first, then by retention priority (TEMPORARY
//! first, CRITICAL last), then oldest `lastModified` first. Tombstones are not
//! counted and never evicted.

use chrono::{DateTime, Utc};
use eventsync_core::{
    timestamp, CoreError, DeletionRecord, DocumentMetadata, RetentionPriority, SyncDocument,
};
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::SqliteConnection;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Default quota: 50 MiB.
pub const DEFAULT_MAX_STORAGE_SIZE: u64 = 50 * 1024 * 1024;

/// Fraction of the quota eviction brings usage down to.
pub const EVICTION_TARGET_RATIO: f64 = 0.8;

/// Errors that can occur during local storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("I/O error for {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    /// A single document is larger than the whole quota.
    #[error("document too large for storage ({size} bytes, limit {max} bytes)")]
    DocumentTooLarge { size: u64, max: u64 },

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Result of a versioned write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Applied,
    /// Something at the same or a newer version was already stored.
    Stale,
}

/// Storage usage summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub total_size: u64,
    pub document_count: u64,
    pub collection_count: u64,
    pub max_size: u64,
    pub oldest_document: Option<DateTime<Utc>>,
    pub newest_document: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    collection: String,
    id: String,
    version: i64,
    data: String,
    last_modified: i64,
    last_synced: i64,
    expires_at: Option<i64>,
    retention_priority: i64,
}

fn ts(micros: i64) -> Result<DateTime<Utc>, StorageError> {
    timestamp::from_micros(micros)
        .ok_or_else(|| StorageError::Corrupt(format!("timestamp out of range: {}", micros)))
}

impl DocumentRow {
    fn into_document(self) -> Result<SyncDocument, StorageError> {
        let data: Value = serde_json::from_str(&self.data).map_err(CoreError::from)?;
        let version = u64::try_from(self.version)
            .map_err(|_| StorageError::Corrupt(format!("negative version: {}", self.version)))?;
        let priority = RetentionPriority::from_rank(self.retention_priority).ok_or_else(|| {
            StorageError::Corrupt(format!("unknown retention priority {}", self.retention_priority))
        })?;

        let mut metadata = DocumentMetadata::new(version, ts(self.last_modified)?);
        metadata.last_synced = Some(ts(self.last_synced)?);
        metadata.expires_at = self.expires_at.map(ts).transpose()?;
        metadata.retention_priority = priority;

        Ok(SyncDocument {
            id: self.id,
            collection: self.collection,
            data,
            metadata,
        })
    }
}

const SELECT_DOCUMENT: &str = "SELECT collection, id, version, data, last_modified, last_synced, expires_at, retention_priority FROM documents";

/// Local SQLite replica. Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: SqlitePool,
    max_storage_size: Arc<AtomicU64>,
}

impl LocalStore {
    /// Opens `<data_dir>/<db_name>.db`.
    pub async fn open(
        data_dir: &Path,
        db_name: &str,
        max_storage_size: u64,
    ) -> Result<Self, StorageError> {
        Self::open_at(&data_dir.join(format!("{}.db", db_name)), max_storage_size).await
    }

    /// Opens (or creates) the database at `path` and runs migrations.
    pub async fn open_at(path: &Path, max_storage_size: u64) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Io(parent.to_path_buf(), e))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true);

        // One connection: every write is a single serialized transaction.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations/client").run(&pool).await?;

        tracing::debug!("Opened local store at {}", path.display());
        Ok(Self {
            pool,
            max_storage_size: Arc::new(AtomicU64::new(max_storage_size)),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn max_storage_size(&self) -> u64 {
        self.max_storage_size.load(Ordering::Relaxed)
    }

    /// Changes the quota. Takes effect on the next write or
    /// [`ensure_storage_space`](Self::ensure_storage_space).
    pub fn set_max_storage_size(&self, bytes: u64) {
        self.max_storage_size.store(bytes, Ordering::Relaxed);
    }

    fn eviction_target(&self) -> i64 {
        (self.max_storage_size() as f64 * EVICTION_TARGET_RATIO) as i64
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Stores a document unless something at the same or a newer version is
    /// already present. Replacing a tombstone re-creates the document.
    pub async fn put(&self, doc: &SyncDocument) -> Result<PutOutcome, StorageError> {
        doc.validate()?;
        let size = doc.encoded_size()? as u64;
        let max = self.max_storage_size();
        if size > max {
            return Err(StorageError::DocumentTooLarge { size, max });
        }

        let mut tx = self.pool.begin().await?;

        let current = current_version(&mut tx, &doc.collection, &doc.id).await?;
        if current.is_some_and(|v| v >= doc.version() as i64) {
            return Ok(PutOutcome::Stale);
        }

        let replaced: Option<(i64,)> =
            sqlx::query_as("SELECT size FROM documents WHERE collection = ? AND id = ?")
                .bind(&doc.collection)
                .bind(&doc.id)
                .fetch_optional(&mut *tx)
                .await?;
        let replaced = replaced.map(|(s,)| s).unwrap_or(0);

        let occupied = occupied_size(&mut tx).await?;
        if occupied - replaced + size as i64 > max as i64 {
            let target = self.eviction_target() - size as i64;
            let evicted = evict(
                &mut tx,
                occupied - replaced,
                target,
                Some((doc.collection.as_str(), doc.id.as_str())),
            )
            .await?;
            tracing::info!(
                evicted,
                incoming = size,
                "Evicted documents to make room for {}/{}",
                doc.collection,
                doc.id
            );
        }

        let now = timestamp::now();
        let data = serde_json::to_string(&doc.data).map_err(CoreError::from)?;
        sqlx::query(
            r#"
            INSERT INTO documents
                (collection, id, version, data, last_modified, last_synced, expires_at, retention_priority, size)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (collection, id) DO UPDATE SET
                version = excluded.version,
                data = excluded.data,
                last_modified = excluded.last_modified,
                last_synced = excluded.last_synced,
                expires_at = excluded.expires_at,
                retention_priority = excluded.retention_priority,
                size = excluded.size
            "#,
        )
        .bind(&doc.collection)
        .bind(&doc.id)
        .bind(doc.version() as i64)
        .bind(data)
        .bind(timestamp::to_micros(doc.last_modified()))
        .bind(timestamp::to_micros(now))
        .bind(doc.metadata.expires_at.map(timestamp::to_micros))
        .bind(doc.metadata.retention_priority.rank())
        .bind(size as i64)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM tombstones WHERE collection = ? AND id = ?")
            .bind(&doc.collection)
            .bind(&doc.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(PutOutcome::Applied)
    }

    /// Replaces a document with a tombstone, under the same version guard as
    /// [`put`](Self::put).
    pub async fn put_tombstone(&self, record: &DeletionRecord) -> Result<PutOutcome, StorageError> {
        if record.id.is_empty() || record.collection.is_empty() || record.version == 0 {
            return Err(CoreError::MalformedDocument(format!(
                "invalid tombstone {}/{} v{}",
                record.collection, record.id, record.version
            ))
            .into());
        }

        let mut tx = self.pool.begin().await?;

        let current = current_version(&mut tx, &record.collection, &record.id).await?;
        if current.is_some_and(|v| v >= record.version as i64) {
            return Ok(PutOutcome::Stale);
        }

        sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
            .bind(&record.collection)
            .bind(&record.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO tombstones (collection, id, version, deleted_at, deleted_by)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (collection, id) DO UPDATE SET
                version = excluded.version,
                deleted_at = excluded.deleted_at,
                deleted_by = excluded.deleted_by
            "#,
        )
        .bind(&record.collection)
        .bind(&record.id)
        .bind(record.version as i64)
        .bind(timestamp::to_micros(record.deleted_at))
        .bind(&record.deleted_by)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(PutOutcome::Applied)
    }

    /// Drops every live document of a collection. Returns the removed ids.
    pub async fn clear_collection(&self, collection: &str) -> Result<Vec<String>, StorageError> {
        let mut tx = self.pool.begin().await?;
        let ids: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM documents WHERE collection = ? ORDER BY id")
                .bind(collection)
                .fetch_all(&mut *tx)
                .await?;
        sqlx::query("DELETE FROM documents WHERE collection = ?")
            .bind(collection)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Unexpired documents of a collection, ordered by `(lastModified, id)`.
    pub async fn get_by_collection(&self, collection: &str) -> Result<Vec<SyncDocument>, StorageError> {
        let now = timestamp::to_micros(timestamp::now());
        let rows: Vec<DocumentRow> = sqlx::query_as(&format!(
            "{} WHERE collection = ? AND (expires_at IS NULL OR expires_at > ?) ORDER BY last_modified, id",
            SELECT_DOCUMENT
        ))
        .bind(collection)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DocumentRow::into_document).collect()
    }

    /// A single unexpired document.
    pub async fn get_one(&self, collection: &str, id: &str) -> Result<Option<SyncDocument>, StorageError> {
        let now = timestamp::to_micros(timestamp::now());
        let row: Option<DocumentRow> = sqlx::query_as(&format!(
            "{} WHERE collection = ? AND id = ? AND (expires_at IS NULL OR expires_at > ?)",
            SELECT_DOCUMENT
        ))
        .bind(collection)
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DocumentRow::into_document).transpose()
    }

    /// Tombstone for an id, if any.
    pub async fn get_tombstone(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<DeletionRecord>, StorageError> {
        let row: Option<(i64, i64, String)> = sqlx::query_as(
            "SELECT version, deleted_at, deleted_by FROM tombstones WHERE collection = ? AND id = ?",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(version, deleted_at, deleted_by)| -> Result<_, StorageError> {
            Ok(DeletionRecord::new(
                collection,
                id,
                version as u64,
                ts(deleted_at)?,
                deleted_by,
            ))
        })
        .transpose()
    }

    /// Collections with stored documents or a sync cursor.
    pub async fn collections(&self) -> Result<Vec<String>, StorageError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT collection FROM documents UNION SELECT collection FROM sync_meta ORDER BY collection",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(c,)| c).collect())
    }

    pub async fn stats(&self) -> Result<StorageStats, StorageError> {
        let (total_size, document_count, collection_count, oldest, newest): (
            i64,
            i64,
            i64,
            Option<i64>,
            Option<i64>,
        ) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(size), 0), COUNT(*), COUNT(DISTINCT collection),
                   MIN(last_modified), MAX(last_modified)
            FROM documents
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StorageStats {
            total_size: total_size as u64,
            document_count: document_count as u64,
            collection_count: collection_count as u64,
            max_size: self.max_storage_size(),
            oldest_document: oldest.map(ts).transpose()?,
            newest_document: newest.map(ts).transpose()?,
        })
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Deletes documents whose `expiresAt` has passed.
    pub async fn cleanup_expired(&self) -> Result<u64, StorageError> {
        let now = timestamp::to_micros(timestamp::now());
        let result =
            sqlx::query("DELETE FROM documents WHERE expires_at IS NOT NULL AND expires_at <= ?")
                .bind(now)
                .execute(&self.pool)
                .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            tracing::debug!("Removed {} expired document(s)", removed);
        }
        Ok(removed)
    }

    /// If usage exceeds the quota, evicts down to the eviction target.
    /// Returns the number of documents evicted.
    pub async fn ensure_storage_space(&self) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await?;
        let occupied = occupied_size(&mut tx).await?;
        if occupied <= self.max_storage_size() as i64 {
            return Ok(0);
        }

        let evicted = evict(&mut tx, occupied, self.eviction_target(), None).await?;
        tx.commit().await?;

        tracing::info!(evicted, "Storage quota exceeded, evicted documents");
        Ok(evicted)
    }

    // ------------------------------------------------------------------
    // Sync cursors
    // ------------------------------------------------------------------

    pub async fn last_sync(&self, collection: &str) -> Result<Option<DateTime<Utc>>, StorageError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT last_sync FROM sync_meta WHERE collection = ?")
                .bind(collection)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(micros,)| ts(micros)).transpose()
    }

    /// Records the sync cursor. A cursor never moves backwards.
    pub async fn set_last_sync(&self, collection: &str, at: DateTime<Utc>) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO sync_meta (collection, last_sync) VALUES (?, ?)
            ON CONFLICT (collection) DO UPDATE SET
                last_sync = MAX(last_sync, excluded.last_sync)
            "#,
        )
        .bind(collection)
        .bind(timestamp::to_micros(at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Highest version stored for an id, live or tombstoned.
async fn current_version(
    conn: &mut SqliteConnection,
    collection: &str,
    id: &str,
) -> Result<Option<i64>, StorageError> {
    let row: (Option<i64>,) = sqlx::query_as(
        r#"
        SELECT MAX(v) FROM (
            SELECT version AS v FROM documents WHERE collection = ?1 AND id = ?2
            UNION ALL
            SELECT version AS v FROM tombstones WHERE collection = ?1 AND id = ?2
        )
        "#,
    )
    .bind(collection)
    .bind(id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.0)
}

async fn occupied_size(conn: &mut SqliteConnection) -> Result<i64, StorageError> {
    let row: (i64,) = sqlx::query_as("SELECT COALESCE(SUM(size), 0) FROM documents")
        .fetch_one(&mut *conn)
        .await?;
    Ok(row.0)
}

/// Deletes documents in eviction order until `occupied <= target`.
async fn evict(
    conn: &mut SqliteConnection,
    mut occupied: i64,
    target: i64,
    keep: Option<(&str, &str)>,
) -> Result<u64, StorageError> {
    let now = timestamp::to_micros(timestamp::now());
    let candidates: Vec<(String, String, i64)> = sqlx::query_as(
        r#"
        SELECT collection, id, size FROM documents
        ORDER BY (expires_at IS NOT NULL AND expires_at <= ?) DESC,
                 retention_priority DESC,
                 last_modified ASC,
                 collection ASC,
                 id ASC
        "#,
    )
    .bind(now)
    .fetch_all(&mut *conn)
    .await?;

    let mut evicted = 0;
    for (collection, id, size) in candidates {
        if occupied <= target {
            break;
        }
        if keep == Some((collection.as_str(), id.as_str())) {
            continue;
        }

        sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
            .bind(&collection)
            .bind(&id)
            .execute(&mut *conn)
            .await?;
        tracing::debug!("Evicted {}/{} ({} bytes)", collection, id, size);

        occupied -= size;
        evicted += 1;
    }

    Ok(evicted)
}
