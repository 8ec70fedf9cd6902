//! Central document store and permission graph.
//!
//! Everything lives in one SQLite database:
//!
//! ```text
//! documents          (collection, id) -> version, data, last_modified, ...
//! deletions          tombstones, retained until explicit GC
//! document_groups    document-group tags (kept after deletion)
//! user_groups        user-group memberships
//! group_permissions  user-group -> document-group links with a level
//! permissions        direct grants to a user or group
//! ```
//!
//! The sync engine only reads from this store. The write methods are the
//! surface collaborating CRUD handlers (and `eventsync-admin`) use to hand
//! documents to the engine.

use chrono::{DateTime, Utc};
use eventsync_core::{
    timestamp, AccessContext, Action, CoreError, DeletionRecord, DocumentMetadata, GroupId,
    GroupPermission, Permission, PermissionLevel, PermissionScope, Principal, RetentionPriority,
    ScanKey, SyncDocument,
};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// Separator used by `group_concat` when loading a document's groups.
const GROUP_SEPARATOR: char = '\u{1f}';

/// Errors that can occur during server store operations.
#[derive(Debug, Error)]
pub enum ServerStoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("I/O error for {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    /// Identifier is empty or contains control characters.
    #[error("Invalid {0}: {1:?}")]
    InvalidId(&'static str, String),

    /// A write carried a version that is not newer than the stored one.
    #[error("Stale write for {collection}/{id}: version {version} is not newer than {current}")]
    StaleVersion {
        collection: String,
        id: String,
        version: u64,
        current: u64,
    },

    /// A row could not be decoded.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Result of [`ServerStore::upsert_document`].
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub document: SyncDocument,
    /// False when an existing live document was replaced.
    pub created: bool,
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    collection: String,
    id: String,
    version: i64,
    data: String,
    last_modified: i64,
    expires_at: Option<i64>,
    retention_priority: i64,
    groups: Option<String>,
}

#[derive(sqlx::FromRow)]
struct DeletionRow {
    collection: String,
    id: String,
    version: i64,
    deleted_at: i64,
    deleted_by: String,
    groups: Option<String>,
}

#[derive(sqlx::FromRow)]
struct PermissionRow {
    id: i64,
    principal_type: String,
    principal_id: String,
    collection: String,
    item_id: Option<String>,
    actions: String,
    scope: String,
}

fn ts(micros: i64) -> Result<DateTime<Utc>, ServerStoreError> {
    timestamp::from_micros(micros)
        .ok_or_else(|| ServerStoreError::Corrupt(format!("timestamp out of range: {}", micros)))
}

fn version(raw: i64) -> Result<u64, ServerStoreError> {
    u64::try_from(raw).map_err(|_| ServerStoreError::Corrupt(format!("negative version: {}", raw)))
}

fn parse_groups(raw: Option<String>) -> BTreeSet<GroupId> {
    raw.map(|s| {
        s.split(GROUP_SEPARATOR)
            .filter(|g| !g.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

impl DocumentRow {
    fn into_document(self) -> Result<(SyncDocument, BTreeSet<GroupId>), ServerStoreError> {
        let data: Value = serde_json::from_str(&self.data).map_err(CoreError::from)?;
        let mut metadata = DocumentMetadata::new(version(self.version)?, ts(self.last_modified)?);
        metadata.expires_at = self.expires_at.map(ts).transpose()?;
        metadata.retention_priority = RetentionPriority::from_rank(self.retention_priority)
            .ok_or_else(|| {
                ServerStoreError::Corrupt(format!(
                    "unknown retention priority {}",
                    self.retention_priority
                ))
            })?;

        let doc = SyncDocument {
            id: self.id,
            collection: self.collection,
            data,
            metadata,
        };
        Ok((doc, parse_groups(self.groups)))
    }
}

impl DeletionRow {
    fn into_record(self) -> Result<(DeletionRecord, BTreeSet<GroupId>), ServerStoreError> {
        let record = DeletionRecord::new(
            self.collection,
            self.id,
            version(self.version)?,
            ts(self.deleted_at)?,
            self.deleted_by,
        );
        Ok((record, parse_groups(self.groups)))
    }
}

impl PermissionRow {
    fn into_entry(self) -> Result<(i64, Permission), ServerStoreError> {
        let principal = match self.principal_type.as_str() {
            "user" => Principal::User(self.principal_id),
            "group" => Principal::Group(self.principal_id),
            other => {
                return Err(ServerStoreError::Corrupt(format!(
                    "unknown principal type {}",
                    other
                )))
            }
        };
        let scope = match self.scope.as_str() {
            "collection" => PermissionScope::Collection,
            "item" => PermissionScope::Item,
            other => {
                return Err(ServerStoreError::Corrupt(format!(
                    "unknown permission scope {}",
                    other
                )))
            }
        };
        let actions: BTreeSet<Action> =
            serde_json::from_str(&self.actions).map_err(CoreError::from)?;

        Ok((
            self.id,
            Permission {
                principal,
                collection: self.collection,
                item_id: self.item_id,
                actions,
                scope,
            },
        ))
    }
}

/// Server-side SQLite store.
///
/// Document writes are serialized through `write_lock` and each one reads
/// the current version inside its own transaction, so versions assigned to
/// an id never repeat. A writer in another process that races a
/// transaction fails with a busy error instead of reusing a version.
#[derive(Debug, Clone)]
pub struct ServerStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl ServerStore {
    /// Opens (or creates) the database at `path` and runs migrations.
    pub async fn open(path: &Path) -> Result<Self, ServerStoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ServerStoreError::Io(parent.to_path_buf(), e))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations/server").run(&pool).await?;

        tracing::debug!("Opened server store at {}", path.display());
        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Rejects empty identifiers and identifiers with control characters.
    fn validate_id(kind: &'static str, value: &str) -> Result<(), ServerStoreError> {
        if value.trim().is_empty() || value.chars().any(char::is_control) {
            return Err(ServerStoreError::InvalidId(kind, value.to_string()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Permission queries
    // ------------------------------------------------------------------

    /// Groups the user belongs to.
    pub async fn user_group_ids(&self, user_id: &str) -> Result<BTreeSet<GroupId>, ServerStoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT group_id FROM user_groups WHERE user_id = ? ORDER BY group_id")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(g,)| g).collect())
    }

    /// Document-groups an entity is tagged with.
    pub async fn document_group_ids(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<BTreeSet<GroupId>, ServerStoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT group_id FROM document_groups WHERE collection = ? AND document_id = ? ORDER BY group_id",
        )
        .bind(collection)
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(g,)| g).collect())
    }

    /// Every group-to-group permission link.
    pub async fn group_permissions(&self) -> Result<Vec<GroupPermission>, ServerStoreError> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT user_group_id, document_group_id, level FROM group_permissions ORDER BY user_group_id, document_group_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(user_group_id, document_group_id, level)| {
                let level = PermissionLevel::from_value(level).ok_or_else(|| {
                    ServerStoreError::Corrupt(format!("unknown permission level {}", level))
                })?;
                Ok(GroupPermission {
                    user_group_id,
                    document_group_id,
                    level,
                })
            })
            .collect()
    }

    /// Every direct grant.
    pub async fn permissions(&self) -> Result<Vec<Permission>, ServerStoreError> {
        Ok(self
            .permission_entries()
            .await?
            .into_iter()
            .map(|(_, permission)| permission)
            .collect())
    }

    /// Every direct grant with the id `revoke` takes.
    pub async fn permission_entries(&self) -> Result<Vec<(i64, Permission)>, ServerStoreError> {
        let rows: Vec<PermissionRow> = sqlx::query_as(
            "SELECT id, principal_type, principal_id, collection, item_id, actions, scope FROM permissions ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(PermissionRow::into_entry).collect()
    }

    /// Direct grants held by a user, either personally or through a group.
    pub async fn permissions_for(
        &self,
        user_id: &str,
        user_group_ids: &BTreeSet<GroupId>,
    ) -> Result<Vec<Permission>, ServerStoreError> {
        Ok(self
            .permissions()
            .await?
            .into_iter()
            .filter(|p| p.is_held_by(Some(user_id), user_group_ids))
            .collect())
    }

    /// Resolves everything a user can see, once, for reuse across a request.
    pub async fn access_context(&self, user_id: &str) -> Result<AccessContext, ServerStoreError> {
        let groups = self.user_group_ids(user_id).await?;
        let group_permissions = self.group_permissions().await?;
        let permissions = self.permissions_for(user_id, &groups).await?;
        Ok(AccessContext::new(
            Some(user_id.to_string()),
            groups,
            group_permissions,
            permissions,
        ))
    }

    // ------------------------------------------------------------------
    // Candidate scans
    // ------------------------------------------------------------------

    /// Documents of a collection ordered by `(last_modified, id)`.
    ///
    /// `since` is inclusive. Rows at or before `after` are excluded, then
    /// `offset` more are skipped.
    pub async fn scan_documents(
        &self,
        collection: &str,
        since: Option<DateTime<Utc>>,
        after: Option<&ScanKey>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(SyncDocument, BTreeSet<GroupId>)>, ServerStoreError> {
        let since = since.map(timestamp::to_micros).unwrap_or(i64::MIN);
        let after_time = after.map(|k| timestamp::to_micros(k.last_modified));
        let after_id = after.map(|k| k.id.as_str());
        let rows: Vec<DocumentRow> = sqlx::query_as(
            r#"
            SELECT d.collection, d.id, d.version, d.data, d.last_modified, d.expires_at,
                   d.retention_priority,
                   (SELECT group_concat(g.group_id, char(31)) FROM document_groups g
                     WHERE g.collection = d.collection AND g.document_id = d.id) AS groups
            FROM documents d
            WHERE d.collection = ?1 AND d.last_modified >= ?2
              AND (?3 IS NULL OR d.last_modified > ?3 OR (d.last_modified = ?3 AND d.id > ?4))
            ORDER BY d.last_modified ASC, d.id ASC
            LIMIT ?5 OFFSET ?6
            "#,
        )
        .bind(collection)
        .bind(since)
        .bind(after_time)
        .bind(after_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DocumentRow::into_document).collect()
    }

    /// Tombstones of a collection with `deleted_at >= since`, oldest first.
    pub async fn scan_deletions(
        &self,
        collection: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<(DeletionRecord, BTreeSet<GroupId>)>, ServerStoreError> {
        let since = since.map(timestamp::to_micros).unwrap_or(i64::MIN);
        let rows: Vec<DeletionRow> = sqlx::query_as(
            r#"
            SELECT t.collection, t.id, t.version, t.deleted_at, t.deleted_by,
                   (SELECT group_concat(g.group_id, char(31)) FROM document_groups g
                     WHERE g.collection = t.collection AND g.document_id = t.id) AS groups
            FROM deletions t
            WHERE t.collection = ? AND t.deleted_at >= ?
            ORDER BY t.deleted_at ASC, t.id ASC
            "#,
        )
        .bind(collection)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeletionRow::into_record).collect()
    }

    /// Loads a live document.
    pub async fn get_document(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<SyncDocument>, ServerStoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::live_document(&mut conn, collection, id).await
    }

    async fn live_document(
        conn: &mut SqliteConnection,
        collection: &str,
        id: &str,
    ) -> Result<Option<SyncDocument>, ServerStoreError> {
        let row: Option<DocumentRow> = sqlx::query_as(
            r#"
            SELECT collection, id, version, data, last_modified, expires_at, retention_priority,
                   NULL AS groups
            FROM documents WHERE collection = ? AND id = ?
            "#,
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        row.map(|r| r.into_document().map(|(doc, _)| doc))
            .transpose()
    }

    /// Loads a tombstone.
    pub async fn get_deletion(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<DeletionRecord>, ServerStoreError> {
        let row: Option<DeletionRow> = sqlx::query_as(
            r#"
            SELECT collection, id, version, deleted_at, deleted_by, NULL AS groups
            FROM deletions WHERE collection = ? AND id = ?
            "#,
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_record().map(|(record, _)| record))
            .transpose()
    }

    /// Highest version ever assigned to `(collection, id)`, live or deleted.
    async fn current_version(
        conn: &mut SqliteConnection,
        collection: &str,
        id: &str,
    ) -> Result<u64, ServerStoreError> {
        let row: (Option<i64>,) = sqlx::query_as(
            r#"
            SELECT MAX(v) FROM (
                SELECT version AS v FROM documents WHERE collection = ?1 AND id = ?2
                UNION ALL
                SELECT version AS v FROM deletions WHERE collection = ?1 AND id = ?2
            )
            "#,
        )
        .bind(collection)
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;
        row.0.map(version).transpose().map(|v| v.unwrap_or(0))
    }

    // ------------------------------------------------------------------
    // Collaborator writes
    // ------------------------------------------------------------------

    /// Stores a document whose version was assigned by the caller.
    ///
    /// Fails with [`ServerStoreError::StaleVersion`] unless the version is
    /// newer than anything stored for the id. Replaces the group tags when
    /// `groups` is given.
    pub async fn put_document(
        &self,
        doc: &SyncDocument,
        groups: Option<&[GroupId]>,
    ) -> Result<(), ServerStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        Self::write_document(&mut tx, doc, groups).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Creates or updates a document, assigning the next version and a fresh
    /// `last_modified`.
    pub async fn upsert_document(
        &self,
        collection: &str,
        id: &str,
        data: Value,
        groups: Option<&[GroupId]>,
        priority: RetentionPriority,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<UpsertOutcome, ServerStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let created = Self::live_document(&mut tx, collection, id).await?.is_none();
        let next = Self::current_version(&mut tx, collection, id).await? + 1;

        let mut document = SyncDocument::new(collection, id, data, next, timestamp::now())
            .with_priority(priority);
        document.metadata.expires_at = expires_at.map(timestamp::truncate);

        Self::write_document(&mut tx, &document, groups).await?;
        tx.commit().await?;
        Ok(UpsertOutcome { document, created })
    }

    async fn write_document(
        conn: &mut SqliteConnection,
        doc: &SyncDocument,
        groups: Option<&[GroupId]>,
    ) -> Result<(), ServerStoreError> {
        Self::validate_id("collection", &doc.collection)?;
        Self::validate_id("document id", &doc.id)?;
        doc.validate()?;

        let current = Self::current_version(conn, &doc.collection, &doc.id).await?;
        if doc.version() <= current {
            return Err(ServerStoreError::StaleVersion {
                collection: doc.collection.clone(),
                id: doc.id.clone(),
                version: doc.version(),
                current,
            });
        }

        let data = serde_json::to_string(&doc.data).map_err(CoreError::from)?;

        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, version, data, last_modified, expires_at, retention_priority)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (collection, id) DO UPDATE SET
                version = excluded.version,
                data = excluded.data,
                last_modified = excluded.last_modified,
                expires_at = excluded.expires_at,
                retention_priority = excluded.retention_priority
            "#,
        )
        .bind(&doc.collection)
        .bind(&doc.id)
        .bind(doc.version() as i64)
        .bind(&data)
        .bind(timestamp::to_micros(doc.metadata.last_modified))
        .bind(doc.metadata.expires_at.map(timestamp::to_micros))
        .bind(doc.metadata.retention_priority.rank())
        .execute(&mut *conn)
        .await?;

        // Re-creation replaces the tombstone.
        sqlx::query("DELETE FROM deletions WHERE collection = ? AND id = ?")
            .bind(&doc.collection)
            .bind(&doc.id)
            .execute(&mut *conn)
            .await?;

        if let Some(groups) = groups {
            sqlx::query("DELETE FROM document_groups WHERE collection = ? AND document_id = ?")
                .bind(&doc.collection)
                .bind(&doc.id)
                .execute(&mut *conn)
                .await?;

            let unique: HashSet<&GroupId> = groups.iter().collect();
            for group in unique {
                Self::validate_id("group id", group)?;
                sqlx::query(
                    "INSERT INTO document_groups (collection, document_id, group_id) VALUES (?, ?, ?)",
                )
                .bind(&doc.collection)
                .bind(&doc.id)
                .bind(group)
                .execute(&mut *conn)
                .await?;
            }
        }

        Ok(())
    }

    /// Replaces a live document with a tombstone.
    ///
    /// Returns `None` if there was no live document.
    pub async fn delete_document(
        &self,
        collection: &str,
        id: &str,
        deleted_by: &str,
    ) -> Result<Option<DeletionRecord>, ServerStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let record = Self::tombstone(&mut tx, collection, id, deleted_by).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn tombstone(
        conn: &mut SqliteConnection,
        collection: &str,
        id: &str,
        deleted_by: &str,
    ) -> Result<Option<DeletionRecord>, ServerStoreError> {
        let Some(doc) = Self::live_document(conn, collection, id).await? else {
            return Ok(None);
        };

        let record = DeletionRecord::new(
            collection,
            id,
            doc.version() + 1,
            timestamp::now(),
            deleted_by,
        );

        sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .execute(&mut *conn)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO deletions (collection, id, version, deleted_at, deleted_by)
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
        .execute(&mut *conn)
        .await?;

        Ok(Some(record))
    }

    /// Tombstones every live document in a collection.
    pub async fn clear_collection(
        &self,
        collection: &str,
        deleted_by: &str,
    ) -> Result<Vec<DeletionRecord>, ServerStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let ids: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM documents WHERE collection = ? ORDER BY id")
                .bind(collection)
                .fetch_all(&mut *tx)
                .await?;

        let mut records = Vec::with_capacity(ids.len());
        for (id,) in ids {
            if let Some(record) = Self::tombstone(&mut tx, collection, &id, deleted_by).await? {
                records.push(record);
            }
        }

        tx.commit().await?;
        Ok(records)
    }

    /// Drops tombstones deleted before `before`.
    ///
    /// Only safe once every replica has synced past `before`.
    pub async fn gc_tombstones(&self, before: DateTime<Utc>) -> Result<u64, ServerStoreError> {
        let result = sqlx::query("DELETE FROM deletions WHERE deleted_at < ?")
            .bind(timestamp::to_micros(before))
            .execute(&self.pool)
            .await?;

        // Group tags of ids that are now neither live nor tombstoned.
        sqlx::query(
            r#"
            DELETE FROM document_groups WHERE NOT EXISTS (
                SELECT 1 FROM documents d WHERE d.collection = document_groups.collection AND d.id = document_groups.document_id
            ) AND NOT EXISTS (
                SELECT 1 FROM deletions t WHERE t.collection = document_groups.collection AND t.id = document_groups.document_id
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Permission graph administration
    // ------------------------------------------------------------------

    pub async fn add_user_to_group(&self, user_id: &str, group_id: &str) -> Result<(), ServerStoreError> {
        Self::validate_id("user id", user_id)?;
        Self::validate_id("group id", group_id)?;
        sqlx::query("INSERT OR IGNORE INTO user_groups (user_id, group_id) VALUES (?, ?)")
            .bind(user_id)
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Returns true if a membership was removed.
    pub async fn remove_user_from_group(
        &self,
        user_id: &str,
        group_id: &str,
    ) -> Result<bool, ServerStoreError> {
        let result = sqlx::query("DELETE FROM user_groups WHERE user_id = ? AND group_id = ?")
            .bind(user_id)
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// All `(user_id, group_id)` memberships.
    pub async fn memberships(&self) -> Result<Vec<(String, String)>, ServerStoreError> {
        let rows = sqlx::query_as("SELECT user_id, group_id FROM user_groups ORDER BY user_id, group_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Creates or replaces the link between two groups.
    pub async fn link_groups(&self, link: &GroupPermission) -> Result<(), ServerStoreError> {
        Self::validate_id("group id", &link.user_group_id)?;
        Self::validate_id("group id", &link.document_group_id)?;
        sqlx::query(
            r#"
            INSERT INTO group_permissions (user_group_id, document_group_id, level) VALUES (?, ?, ?)
            ON CONFLICT (user_group_id, document_group_id) DO UPDATE SET level = excluded.level
            "#,
        )
        .bind(&link.user_group_id)
        .bind(&link.document_group_id)
        .bind(link.level.value())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns true if a link was removed.
    pub async fn unlink_groups(
        &self,
        user_group_id: &str,
        document_group_id: &str,
    ) -> Result<bool, ServerStoreError> {
        let result = sqlx::query(
            "DELETE FROM group_permissions WHERE user_group_id = ? AND document_group_id = ?",
        )
        .bind(user_group_id)
        .bind(document_group_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Stores a direct grant, returning its row id.
    pub async fn grant(&self, permission: &Permission) -> Result<i64, ServerStoreError> {
        let (principal_type, principal_id) = match &permission.principal {
            Principal::User(id) => ("user", id),
            Principal::Group(id) => ("group", id),
        };
        Self::validate_id("principal id", principal_id)?;
        Self::validate_id("collection", &permission.collection)?;

        let scope = match permission.scope {
            PermissionScope::Collection => "collection",
            PermissionScope::Item => "item",
        };
        let actions = serde_json::to_string(&permission.actions).map_err(CoreError::from)?;

        let result = sqlx::query(
            r#"
            INSERT INTO permissions (principal_type, principal_id, collection, item_id, actions, scope)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(principal_type)
        .bind(principal_id)
        .bind(&permission.collection)
        .bind(&permission.item_id)
        .bind(&actions)
        .bind(scope)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Returns true if a grant was removed.
    pub async fn revoke(&self, permission_id: i64) -> Result<bool, ServerStoreError> {
        let result = sqlx::query("DELETE FROM permissions WHERE id = ?")
            .bind(permission_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (ServerStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = ServerStore::open(&temp_dir.path().join("server.db"))
            .await
            .unwrap();
        (store, temp_dir)
    }

    fn g(ids: &[&str]) -> Vec<GroupId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_validate_id() {
        assert!(ServerStore::validate_id("group id", "family1").is_ok());
        assert!(ServerStore::validate_id("group id", "my-group").is_ok());

        assert!(ServerStore::validate_id("group id", "").is_err());
        assert!(ServerStore::validate_id("group id", "   ").is_err());
        assert!(ServerStore::validate_id("group id", "a\u{1f}b").is_err());
    }

    #[tokio::test]
    async fn test_upsert_assigns_increasing_versions() {
        let (store, _temp) = setup().await;

        let first = store
            .upsert_document("events", "e1", json!({"v": 1}), Some(&g(&["d1"])), RetentionPriority::High, None)
            .await
            .unwrap();
        assert!(first.created);
        assert_eq!(first.document.version(), 1);

        let second = store
            .upsert_document("events", "e1", json!({"v": 2}), None, RetentionPriority::High, None)
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.document.version(), 2);

        let loaded = store.get_document("events", "e1").await.unwrap().unwrap();
        assert_eq!(loaded.version(), 2);
        assert_eq!(loaded.data, json!({"v": 2}));
        assert_eq!(loaded.metadata.retention_priority, RetentionPriority::High);

        // Groups untouched when None is passed
        let groups = store.document_group_ids("events", "e1").await.unwrap();
        assert!(groups.contains("d1"));
    }

    #[tokio::test]
    async fn test_put_document_rejects_stale_version() {
        let (store, _temp) = setup().await;

        let doc = SyncDocument::new("events", "e1", json!({}), 5, timestamp::now());
        store.put_document(&doc, None).await.unwrap();

        let stale = SyncDocument::new("events", "e1", json!({}), 5, timestamp::now());
        let result = store.put_document(&stale, None).await;
        assert!(matches!(
            result,
            Err(ServerStoreError::StaleVersion { current: 5, .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_creates_tombstone_with_next_version() {
        let (store, _temp) = setup().await;

        store
            .upsert_document("events", "e1", json!({}), Some(&g(&["d1"])), RetentionPriority::Medium, None)
            .await
            .unwrap();
        store
            .upsert_document("events", "e1", json!({}), None, RetentionPriority::Medium, None)
            .await
            .unwrap();

        let record = store
            .delete_document("events", "e1", "admin")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.version, 3);
        assert_eq!(record.deleted_by, "admin");

        assert!(store.get_document("events", "e1").await.unwrap().is_none());
        let (tombstone, groups) = store
            .scan_deletions("events", None)
            .await
            .unwrap()
            .pop()
            .unwrap();
        assert_eq!(tombstone, record);
        assert!(groups.contains("d1"));

        // Deleting again is a no-op
        assert!(store
            .delete_document("events", "e1", "admin")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_recreate_after_delete_continues_versions() {
        let (store, _temp) = setup().await;

        store
            .upsert_document("events", "e1", json!({}), None, RetentionPriority::Medium, None)
            .await
            .unwrap();
        store.delete_document("events", "e1", "u1").await.unwrap();

        let outcome = store
            .upsert_document("events", "e1", json!({"again": true}), None, RetentionPriority::Medium, None)
            .await
            .unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.document.version(), 3);
        assert!(store.get_deletion("events", "e1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scan_documents_ordered_and_paged() {
        let (store, _temp) = setup().await;

        for (i, id) in ["c", "a", "b"].iter().enumerate() {
            let ts = timestamp::from_micros(1_000_000 * (i as i64 + 1)).unwrap();
            let doc = SyncDocument::new("events", *id, json!({}), 1, ts);
            store.put_document(&doc, Some(&g(&["d1", "d2"]))).await.unwrap();
        }

        let all = store.scan_documents("events", None, None, 0, 10).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|(d, _)| d.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert_eq!(all[0].1.len(), 2);

        let since = timestamp::from_micros(2_000_000);
        let later = store.scan_documents("events", since, None, 0, 10).await.unwrap();
        assert_eq!(later.len(), 2);

        let skipped = store.scan_documents("events", None, None, 2, 10).await.unwrap();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].0.id, "b");

        let after = ScanKey::of(&all[0].0);
        let resumed = store.scan_documents("events", None, Some(&after), 0, 10).await.unwrap();
        let ids: Vec<&str> = resumed.iter().map(|(d, _)| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_scan_after_key_breaks_timestamp_ties_by_id() {
        let (store, _temp) = setup().await;

        let ts = timestamp::from_micros(5_000_000).unwrap();
        for id in ["x", "y", "z"] {
            let doc = SyncDocument::new("events", id, json!({}), 1, ts);
            store.put_document(&doc, None).await.unwrap();
        }

        let after = ScanKey {
            last_modified: ts,
            id: "x".into(),
        };
        let rows = store.scan_documents("events", None, Some(&after), 0, 10).await.unwrap();
        let ids: Vec<&str> = rows.iter().map(|(d, _)| d.id.as_str()).collect();
        assert_eq!(ids, vec!["y", "z"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_never_share_a_version() {
        let (store, _temp) = setup().await;

        for round in 0..5 {
            let id = format!("e{}", round);
            let writers = (0..4).map(|n| {
                let store = store.clone();
                let id = id.clone();
                tokio::spawn(async move {
                    store
                        .upsert_document("events", &id, json!({"writer": n}), None, RetentionPriority::Medium, None)
                        .await
                        .unwrap()
                        .document
                        .version()
                })
            });

            let mut versions: Vec<u64> = futures::future::join_all(writers)
                .await
                .into_iter()
                .map(|r| r.unwrap())
                .collect();
            versions.sort_unstable();
            assert_eq!(versions, vec![1, 2, 3, 4]);

            let stored = store.get_document("events", &id).await.unwrap().unwrap();
            assert_eq!(stored.version(), 4);
        }

        // A delete racing an update still takes the next version
        let store_a = store.clone();
        let store_b = store.clone();
        let (updated, deleted) = tokio::join!(
            tokio::spawn(async move {
                store_a
                    .upsert_document("events", "e0", json!({}), None, RetentionPriority::Medium, None)
                    .await
                    .unwrap()
                    .document
                    .version()
            }),
            tokio::spawn(async move {
                store_b.delete_document("events", "e0", "admin").await.unwrap()
            }),
        );
        let updated = updated.unwrap();
        let deleted = deleted.unwrap().map(|r| r.version);
        assert_ne!(Some(updated), deleted);
        assert!(updated >= 5);
    }

    #[tokio::test]
    async fn test_access_context_from_graph() {
        let (store, _temp) = setup().await;

        store.add_user_to_group("alice", "staff").await.unwrap();
        store
            .link_groups(&GroupPermission::new("staff", "events-public", PermissionLevel::Edit))
            .await
            .unwrap();
        store
            .grant(&Permission::for_item(
                Principal::User("alice".into()),
                "tickets",
                "t1",
                [Action::Read],
            ))
            .await
            .unwrap();

        let ctx = store.access_context("alice").await.unwrap();
        let doc_groups: BTreeSet<GroupId> = ["events-public".to_string()].into_iter().collect();
        assert!(ctx.can_view("events", "e1", &doc_groups));
        assert!(ctx.can_view("tickets", "t1", &BTreeSet::new()));
        assert!(!ctx.can_view("tickets", "t2", &BTreeSet::new()));

        let bob = store.access_context("bob").await.unwrap();
        assert!(!bob.has_any_access());
    }

    #[tokio::test]
    async fn test_link_groups_replaces_level() {
        let (store, _temp) = setup().await;

        store
            .link_groups(&GroupPermission::new("g1", "d1", PermissionLevel::View))
            .await
            .unwrap();
        store
            .link_groups(&GroupPermission::new("g1", "d1", PermissionLevel::Owner))
            .await
            .unwrap();

        let links = store.group_permissions().await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].level, PermissionLevel::Owner);

        assert!(store.unlink_groups("g1", "d1").await.unwrap());
        assert!(store.group_permissions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_gc_tombstones() {
        let (store, _temp) = setup().await;

        store
            .upsert_document("events", "e1", json!({}), Some(&g(&["d1"])), RetentionPriority::Medium, None)
            .await
            .unwrap();
        let record = store.delete_document("events", "e1", "u1").await.unwrap().unwrap();

        // Nothing older than the deletion
        assert_eq!(store.gc_tombstones(record.deleted_at).await.unwrap(), 0);

        let later = record.deleted_at + chrono::Duration::seconds(1);
        assert_eq!(store.gc_tombstones(later).await.unwrap(), 1);
        assert!(store.get_deletion("events", "e1").await.unwrap().is_none());
        assert!(store
            .document_group_ids("events", "e1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_clear_collection() {
        let (store, _temp) = setup().await;

        for id in ["a", "b"] {
            store
                .upsert_document("tickets", id, json!({}), None, RetentionPriority::Low, None)
                .await
                .unwrap();
        }
        store
            .upsert_document("events", "e1", json!({}), None, RetentionPriority::Low, None)
            .await
            .unwrap();

        let records = store.clear_collection("tickets", "admin").await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(store.scan_documents("tickets", None, None, 0, 10).await.unwrap().is_empty());
        assert_eq!(store.scan_documents("events", None, None, 0, 10).await.unwrap().len(), 1);
    }
}
