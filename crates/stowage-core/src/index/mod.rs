//! The relational metadata index.
//!
//! The filesystem is the source of truth; this index mirrors it so listings,
//! quotas and sharing can be answered without walking disk. Records are keyed
//! by `(owner, path)`. Share links and managed content hang off file records
//! and cascade when a record is deleted.

mod record;

use std::{collections::HashMap, path::Path};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter, types::Type};
use thiserror::Error;
use tracing::{debug, info, instrument, trace};
use uuid::Uuid;

use crate::{
    crypto::EncryptionMethod,
    owner::{Owner, OwnerKind},
    path::VirtualPath,
};

pub use record::{Dependent, DependentStatus, FileRecord, NewRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS owners (
    kind        TEXT NOT NULL CHECK (kind IN ('account', 'organization')),
    id          TEXT NOT NULL,
    quota_bytes INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (kind, id)
);

CREATE TABLE IF NOT EXISTS files (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_kind        TEXT NOT NULL,
    owner_id          TEXT NOT NULL,
    path              TEXT NOT NULL,
    name              TEXT NOT NULL,
    size              INTEGER NOT NULL DEFAULT 0,
    content_type      TEXT,
    is_directory      INTEGER NOT NULL DEFAULT 0,
    parent_path       TEXT NOT NULL DEFAULT '',
    encryption_method TEXT NOT NULL DEFAULT 'none',
    key_id            TEXT,
    encrypted_size    INTEGER,
    sort_position     INTEGER,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL,
    UNIQUE (owner_kind, owner_id, path),
    FOREIGN KEY (owner_kind, owner_id) REFERENCES owners (kind, id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS files_by_parent ON files (owner_kind, owner_id, parent_path);

CREATE TABLE IF NOT EXISTS share_links (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id    INTEGER NOT NULL REFERENCES files (id) ON DELETE CASCADE,
    token      TEXT NOT NULL UNIQUE,
    revoked    INTEGER NOT NULL DEFAULT 0,
    expires_at TEXT
);

CREATE TABLE IF NOT EXISTS managed_content (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id   INTEGER NOT NULL REFERENCES files (id) ON DELETE CASCADE,
    published INTEGER NOT NULL DEFAULT 0
);
";

const FILE_COLUMNS: &str = "id, owner_kind, owner_id, path, name, size, content_type, is_directory, \
     parent_path, encryption_method, key_id, encrypted_size, sort_position, created_at, updated_at";

/// Errors from the metadata index.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("value out of range for {column}")]
    OutOfRange { column: &'static str },

    #[error("owner {0} is not registered")]
    UnknownOwner(Owner),
}

/// Changes for one owner, applied atomically by [`FileIndex::apply`].
#[derive(Debug, Default, Clone)]
pub struct IndexBatch {
    pub creates: Vec<NewRecord>,
    pub updates: Vec<(i64, NewRecord)>,
    pub deletes: Vec<i64>,
}

impl IndexBatch {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Row counts from an applied [`IndexBatch`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

fn to_i64(value: u64, column: &'static str) -> Result<i64, IndexError> {
    i64::try_from(value).map_err(|_| IndexError::OutOfRange { column })
}

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn get_u64(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value).map_err(|e| conversion_error(idx, e))
}

fn get_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    let kind: String = row.get(1)?;
    let kind: OwnerKind = kind.parse().map_err(|e| conversion_error(1, e))?;
    let owner_id: String = row.get(2)?;
    let owner_id = Uuid::parse_str(&owner_id).map_err(|e| conversion_error(2, e))?;
    let method: String = row.get(9)?;
    let method: EncryptionMethod = method.parse().map_err(|e| conversion_error(9, e))?;
    let encrypted_size: Option<i64> = row.get(11)?;

    Ok(FileRecord {
        id: row.get(0)?,
        owner: Owner::new(kind, owner_id),
        path: row.get(3)?,
        name: row.get(4)?,
        size: get_u64(row, 5)?,
        content_type: row.get(6)?,
        is_directory: row.get(7)?,
        parent_path: row.get(8)?,
        encryption_method: method,
        key_id: row.get(10)?,
        encrypted_size: encrypted_size
            .map(u64::try_from)
            .transpose()
            .map_err(|e| conversion_error(11, e))?,
        sort_position: row.get(12)?,
        created_at: get_time(row, 13)?,
        updated_at: get_time(row, 14)?,
    })
}

fn insert_record(conn: &Connection, owner: &Owner, record: &NewRecord, now: &str) -> Result<i64, IndexError> {
    conn.execute(
        "INSERT INTO files (owner_kind, owner_id, path, name, size, content_type, is_directory,
                            parent_path, encryption_method, key_id, encrypted_size, sort_position,
                            created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
        params![
            owner.kind().as_str(),
            owner.id().to_string(),
            record.path,
            record.name,
            to_i64(record.size, "size")?,
            record.content_type,
            record.is_directory,
            record.parent_path,
            record.encryption_method.as_str(),
            record.key_id,
            record.encrypted_size.map(|s| to_i64(s, "encrypted_size")).transpose()?,
            record.sort_position,
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn update_record(conn: &Connection, id: i64, record: &NewRecord, now: &str) -> Result<usize, IndexError> {
    Ok(conn.execute(
        "UPDATE files SET path = ?2, name = ?3, size = ?4, content_type = ?5, is_directory = ?6,
                          parent_path = ?7, encryption_method = ?8, key_id = ?9,
                          encrypted_size = ?10, sort_position = ?11, updated_at = ?12
         WHERE id = ?1",
        params![
            id,
            record.path,
            record.name,
            to_i64(record.size, "size")?,
            record.content_type,
            record.is_directory,
            record.parent_path,
            record.encryption_method.as_str(),
            record.key_id,
            record.encrypted_size.map(|s| to_i64(s, "encrypted_size")).transpose()?,
            record.sort_position,
            now,
        ],
    )?)
}

fn delete_ids(conn: &Connection, ids: &[i64]) -> Result<usize, IndexError> {
    if ids.is_empty() {
        return Ok(0);
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!("DELETE FROM files WHERE id IN ({placeholders})");
    Ok(conn.execute(&sql, params_from_iter(ids.iter()))?)
}

/// SQL predicate matching `path` itself and everything beneath it.
///
/// Uses a prefix comparison instead of `LIKE` so `%` and `_` in names are
/// taken literally.
const SUBTREE_PREDICATE: &str =
    "(path = ?3 OR (length(path) > length(?3) AND substr(path, 1, length(?3) + 1) = ?3 || '/'))";

/// SQLite-backed metadata index.
///
/// The connection sits behind a mutex; each public call holds it for the
/// duration of one statement or one transaction.
pub struct FileIndex {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for FileIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileIndex").finish_non_exhaustive()
    }
}

impl FileIndex {
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        debug!(path = %path.display(), "opened index database");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, IndexError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, IndexError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ---------------------------------------------------------------------
    // Owners
    // ---------------------------------------------------------------------

    /// Register an owner, or update its quota. A quota of 0 means unlimited.
    pub fn register_owner(&self, owner: &Owner, quota_bytes: u64) -> Result<(), IndexError> {
        self.conn.lock().execute(
            "INSERT INTO owners (kind, id, quota_bytes) VALUES (?1, ?2, ?3)
             ON CONFLICT (kind, id) DO UPDATE SET quota_bytes = excluded.quota_bytes",
            params![
                owner.kind().as_str(),
                owner.id().to_string(),
                to_i64(quota_bytes, "quota_bytes")?
            ],
        )?;
        Ok(())
    }

    /// Registered owners of `kind`, in stable order.
    pub fn owners(&self, kind: OwnerKind) -> Result<Vec<Owner>, IndexError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM owners WHERE kind = ?1 ORDER BY id")?;
        let ids = stmt
            .query_map([kind.as_str()], |row| {
                let id: String = row.get(0)?;
                Uuid::parse_str(&id).map_err(|e| conversion_error(0, e))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids.into_iter().map(|id| Owner::new(kind, id)).collect())
    }

    pub fn owner_exists(&self, owner: &Owner) -> Result<bool, IndexError> {
        let found: Option<i64> = self
            .conn
            .lock()
            .query_row(
                "SELECT 1 FROM owners WHERE kind = ?1 AND id = ?2",
                params![owner.kind().as_str(), owner.id().to_string()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn owner_quota(&self, owner: &Owner) -> Result<u64, IndexError> {
        let quota: Option<i64> = self
            .conn
            .lock()
            .query_row(
                "SELECT quota_bytes FROM owners WHERE kind = ?1 AND id = ?2",
                params![owner.kind().as_str(), owner.id().to_string()],
                |r| r.get(0),
            )
            .optional()?;
        let quota = quota.ok_or(IndexError::UnknownOwner(*owner))?;
        u64::try_from(quota).map_err(|_| IndexError::OutOfRange {
            column: "quota_bytes",
        })
    }

    /// Sum of logical sizes of all of `owner`'s records.
    pub fn storage_used(&self, owner: &Owner) -> Result<u64, IndexError> {
        let used: i64 = self.conn.lock().query_row(
            "SELECT COALESCE(SUM(size), 0) FROM files WHERE owner_kind = ?1 AND owner_id = ?2",
            params![owner.kind().as_str(), owner.id().to_string()],
            |r| r.get(0),
        )?;
        u64::try_from(used).map_err(|_| IndexError::OutOfRange { column: "size" })
    }

    /// Sum of logical sizes of `path` and all records beneath it.
    pub fn subtree_size(&self, owner: &Owner, path: &VirtualPath) -> Result<u64, IndexError> {
        let sql = format!(
            "SELECT COALESCE(SUM(size), 0) FROM files
             WHERE owner_kind = ?1 AND owner_id = ?2 AND {SUBTREE_PREDICATE}"
        );
        let size: i64 = self.conn.lock().query_row(
            &sql,
            params![owner.kind().as_str(), owner.id().to_string(), path.as_str()],
            |r| r.get(0),
        )?;
        u64::try_from(size).map_err(|_| IndexError::OutOfRange { column: "size" })
    }

    // ---------------------------------------------------------------------
    // File records
    // ---------------------------------------------------------------------

    pub fn get(&self, owner: &Owner, path: &VirtualPath) -> Result<Option<FileRecord>, IndexError> {
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE owner_kind = ?1 AND owner_id = ?2 AND path = ?3"
        );
        Ok(self
            .conn
            .lock()
            .query_row(
                &sql,
                params![owner.kind().as_str(), owner.id().to_string(), path.as_str()],
                file_from_row,
            )
            .optional()?)
    }

    /// Fetch the records for `paths` in one query, keyed by path.
    pub fn get_many(&self, owner: &Owner, paths: &[VirtualPath]) -> Result<HashMap<String, FileRecord>, IndexError> {
        if paths.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = (0..paths.len())
            .map(|i| format!("?{}", i + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE owner_kind = ?1 AND owner_id = ?2 AND path IN ({placeholders})"
        );

        let mut values: Vec<String> = Vec::with_capacity(paths.len() + 2);
        values.push(owner.kind().as_str().to_string());
        values.push(owner.id().to_string());
        values.extend(paths.iter().map(|p| p.as_str().to_string()));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params_from_iter(values.iter()), file_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        trace!(requested = paths.len(), found = records.len(), "batched record lookup");
        Ok(records.into_iter().map(|r| (r.path.clone(), r)).collect())
    }

    /// Every record owned by `owner`.
    pub fn list_owner(&self, owner: &Owner) -> Result<Vec<FileRecord>, IndexError> {
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE owner_kind = ?1 AND owner_id = ?2 ORDER BY path"
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params![owner.kind().as_str(), owner.id().to_string()], file_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Direct children of `parent`: explicit positions first, then by name.
    pub fn list_children(&self, owner: &Owner, parent: &VirtualPath) -> Result<Vec<FileRecord>, IndexError> {
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE owner_kind = ?1 AND owner_id = ?2 AND parent_path = ?3
             ORDER BY sort_position IS NULL, sort_position, name"
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(
                params![owner.kind().as_str(), owner.id().to_string(), parent.as_str()],
                file_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// `path` and every record beneath it.
    pub fn list_subtree(&self, owner: &Owner, path: &VirtualPath) -> Result<Vec<FileRecord>, IndexError> {
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE owner_kind = ?1 AND owner_id = ?2 AND {SUBTREE_PREDICATE} ORDER BY path"
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(
                params![owner.kind().as_str(), owner.id().to_string(), path.as_str()],
                file_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Ids of each path's record and every record beneath it, keyed by path.
    ///
    /// All lookups run under one lock, so the map is a single snapshot.
    pub fn subtree_ids(&self, owner: &Owner, paths: &[VirtualPath]) -> Result<HashMap<String, Vec<i64>>, IndexError> {
        let sql = format!("SELECT id FROM files WHERE owner_kind = ?1 AND owner_id = ?2 AND {SUBTREE_PREDICATE}");
        let (kind, id) = (owner.kind().as_str(), owner.id().to_string());

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let mut subtrees = HashMap::with_capacity(paths.len());
        for path in paths {
            let ids = stmt
                .query_map(params![kind, id, path.as_str()], |row| row.get(0))?
                .collect::<Result<Vec<i64>, _>>()?;
            subtrees.insert(path.as_str().to_string(), ids);
        }
        Ok(subtrees)
    }

    pub fn create(&self, owner: &Owner, record: &NewRecord) -> Result<FileRecord, IndexError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        let id = insert_record(&conn, owner, record, &now)?;
        let sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1");
        Ok(conn.query_row(&sql, [id], file_from_row)?)
    }

    /// Insert or overwrite the record at `record.path`.
    pub fn upsert(&self, owner: &Owner, record: &NewRecord) -> Result<FileRecord, IndexError> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM files WHERE owner_kind = ?1 AND owner_id = ?2 AND path = ?3",
                params![owner.kind().as_str(), owner.id().to_string(), record.path],
                |r| r.get(0),
            )
            .optional()?;
        let id = match existing {
            Some(id) => {
                update_record(&tx, id, record, &now)?;
                id
            }
            None => insert_record(&tx, owner, record, &now)?,
        };
        let sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1");
        let stored = tx.query_row(&sql, [id], file_from_row)?;
        tx.commit()?;
        Ok(stored)
    }

    /// Record that a file's stored form changed (e.g. after encryption).
    pub fn update_storage(
        &self,
        id: i64,
        size: u64,
        encryption_method: EncryptionMethod,
        key_id: Option<&str>,
        encrypted_size: Option<u64>,
    ) -> Result<(), IndexError> {
        self.conn.lock().execute(
            "UPDATE files SET size = ?2, encryption_method = ?3, key_id = ?4, encrypted_size = ?5,
                              updated_at = ?6
             WHERE id = ?1",
            params![
                id,
                to_i64(size, "size")?,
                encryption_method.as_str(),
                key_id,
                encrypted_size.map(|s| to_i64(s, "encrypted_size")).transpose()?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Re-path `from` and all descendants to live under `to`, in one transaction.
    #[instrument(level = "debug", skip(self), fields(%owner, %from, %to))]
    pub fn rename_subtree(&self, owner: &Owner, from: &VirtualPath, to: &VirtualPath) -> Result<usize, IndexError> {
        let records = self.list_subtree(owner, from)?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut renamed = 0;
        for record in records {
            let Ok(current) = crate::path::normalize(&record.path) else {
                continue;
            };
            let Some(new_path) = current.rebase(from, to) else {
                continue;
            };
            tx.execute(
                "UPDATE files SET path = ?2, name = ?3, parent_path = ?4, updated_at = ?5 WHERE id = ?1",
                params![
                    record.id,
                    new_path.as_str(),
                    new_path.file_name().unwrap_or_default(),
                    new_path.parent_path(),
                    now,
                ],
            )?;
            renamed += 1;
        }
        tx.commit()?;
        Ok(renamed)
    }

    /// Delete records by id in a single statement. Dependents cascade.
    pub fn delete_ids(&self, ids: &[i64]) -> Result<usize, IndexError> {
        let deleted = delete_ids(&self.conn.lock(), ids)?;
        debug!(deleted, "deleted index records");
        Ok(deleted)
    }

    /// Apply one owner's batch in a single transaction.
    #[instrument(level = "debug", skip(self, batch), fields(%owner))]
    pub fn apply(&self, owner: &Owner, batch: &IndexBatch) -> Result<BatchOutcome, IndexError> {
        if batch.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut outcome = BatchOutcome::default();
        for record in &batch.creates {
            insert_record(&tx, owner, record, &now)?;
            outcome.created += 1;
        }
        for (id, record) in &batch.updates {
            outcome.updated += update_record(&tx, *id, record, &now)?;
        }
        outcome.deleted = delete_ids(&tx, &batch.deletes)?;
        tx.commit()?;

        info!(
            created = outcome.created,
            updated = outcome.updated,
            deleted = outcome.deleted,
            "applied index batch"
        );
        Ok(outcome)
    }

    // ---------------------------------------------------------------------
    // Dependents
    // ---------------------------------------------------------------------

    pub fn add_share_link(
        &self,
        file_id: i64,
        token: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<i64, IndexError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO share_links (file_id, token, expires_at) VALUES (?1, ?2, ?3)",
            params![file_id, token, expires_at.map(|t| t.to_rfc3339())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn revoke_share_link(&self, id: i64) -> Result<(), IndexError> {
        self.conn
            .lock()
            .execute("UPDATE share_links SET revoked = 1 WHERE id = ?1", [id])?;
        Ok(())
    }

    pub fn add_managed_content(&self, file_id: i64, published: bool) -> Result<i64, IndexError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO managed_content (file_id, published) VALUES (?1, ?2)",
            params![file_id, published],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Everything that references `file_id`, with status resolved as of now.
    pub fn dependents(&self, file_id: i64) -> Result<Vec<Dependent>, IndexError> {
        let now = Utc::now();
        let conn = self.conn.lock();

        let mut out = Vec::new();
        let mut stmt = conn.prepare("SELECT id, revoked, expires_at FROM share_links WHERE file_id = ?1")?;
        let links = stmt.query_map([file_id], |row| {
            let expires_at: Option<String> = row.get(2)?;
            let expires_at = expires_at
                .map(|s| DateTime::parse_from_rfc3339(&s).map(|t| t.with_timezone(&Utc)))
                .transpose()
                .map_err(|e| conversion_error(2, e))?;
            Ok(Dependent::share_link(row.get(0)?, row.get(1)?, expires_at, now))
        })?;
        for link in links {
            out.push(link?);
        }

        let mut stmt = conn.prepare("SELECT id, published FROM managed_content WHERE file_id = ?1")?;
        let content = stmt.query_map([file_id], |row| {
            Ok(Dependent::managed_content(row.get(0)?, row.get(1)?))
        })?;
        for item in content {
            out.push(item?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::normalize;

    fn account() -> Owner {
        Owner::Account(Uuid::new_v4())
    }

    fn record(path: &str, size: u64) -> NewRecord {
        NewRecord::file(&normalize(path).unwrap(), size)
    }

    fn setup() -> (FileIndex, Owner) {
        let index = FileIndex::open_in_memory().unwrap();
        let owner = account();
        index.register_owner(&owner, 0).unwrap();
        (index, owner)
    }

    #[test]
    fn create_and_get() {
        let (index, owner) = setup();
        let created = index.create(&owner, &record("docs/a.txt", 12)).unwrap();
        assert_eq!(created.parent_path, "docs");
        assert_eq!(created.name, "a.txt");
        assert_eq!(created.content_type.as_deref(), Some("text/plain"));

        let fetched = index.get(&owner, &normalize("docs/a.txt").unwrap()).unwrap().unwrap();
        assert_eq!(fetched, created);
        assert!(index.get(&owner, &normalize("nope").unwrap()).unwrap().is_none());
    }

    #[test]
    fn paths_are_unique_per_owner() {
        let (index, owner) = setup();
        index.create(&owner, &record("a.txt", 1)).unwrap();
        assert!(index.create(&owner, &record("a.txt", 1)).is_err());

        let other = account();
        index.register_owner(&other, 0).unwrap();
        index.create(&other, &record("a.txt", 1)).unwrap();
    }

    #[test]
    fn unregistered_owner_is_rejected() {
        let index = FileIndex::open_in_memory().unwrap();
        assert!(index.create(&account(), &record("a.txt", 1)).is_err());
        assert!(matches!(
            index.owner_quota(&account()),
            Err(IndexError::UnknownOwner(_))
        ));
    }

    #[test]
    fn get_many_uses_one_query() {
        let (index, owner) = setup();
        index.create(&owner, &record("a", 1)).unwrap();
        index.create(&owner, &record("b", 2)).unwrap();
        let found = index
            .get_many(
                &owner,
                &[normalize("a").unwrap(), normalize("b").unwrap(), normalize("c").unwrap()],
            )
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["b"].size, 2);
    }

    #[test]
    fn children_order_by_position_then_name() {
        let (index, owner) = setup();
        index.create(&owner, &record("d/b", 0)).unwrap();
        index.create(&owner, &record("d/a", 0)).unwrap();
        let mut pinned = record("d/z", 0);
        pinned.sort_position = Some(0);
        index.create(&owner, &pinned).unwrap();

        let names: Vec<_> = index
            .list_children(&owner, &normalize("d").unwrap())
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, ["z", "a", "b"]);
    }

    #[test]
    fn subtree_queries_respect_segments() {
        let (index, owner) = setup();
        index.create(&owner, &NewRecord::directory(&normalize("a").unwrap())).unwrap();
        index.create(&owner, &record("a/x", 5)).unwrap();
        index.create(&owner, &record("a/y/z", 7)).unwrap();
        index.create(&owner, &record("ab", 100)).unwrap();
        index.create(&owner, &record("a_%", 1000)).unwrap();

        assert_eq!(index.subtree_size(&owner, &normalize("a").unwrap()).unwrap(), 12);
        assert_eq!(index.storage_used(&owner).unwrap(), 1112);

        let moved = index
            .rename_subtree(&owner, &normalize("a").unwrap(), &normalize("b/c").unwrap())
            .unwrap();
        assert_eq!(moved, 3);
        let z = index.get(&owner, &normalize("b/c/y/z").unwrap()).unwrap().unwrap();
        assert_eq!(z.parent_path, "b/c/y");
        let top = index.get(&owner, &normalize("b/c").unwrap()).unwrap().unwrap();
        assert_eq!(top.name, "c");
        assert!(index.get(&owner, &normalize("ab").unwrap()).unwrap().is_some());
    }

    #[test]
    fn batch_is_atomic() {
        let (index, owner) = setup();
        index.create(&owner, &record("dup", 1)).unwrap();

        let batch = IndexBatch {
            creates: vec![record("fresh", 1), record("dup", 1)],
            ..IndexBatch::default()
        };
        assert!(index.apply(&owner, &batch).is_err());
        assert!(index.get(&owner, &normalize("fresh").unwrap()).unwrap().is_none());
    }

    #[test]
    fn delete_cascades_dependents() {
        let (index, owner) = setup();
        let file = index.create(&owner, &record("shared.pdf", 10)).unwrap();
        index.add_share_link(file.id, "tok", None).unwrap();
        index.add_managed_content(file.id, false).unwrap();
        assert_eq!(index.dependents(file.id).unwrap().len(), 2);

        assert_eq!(index.delete_ids(&[file.id]).unwrap(), 1);
        assert!(index.dependents(file.id).unwrap().is_empty());
    }

    #[test]
    fn dependent_status_is_resolved() {
        let (index, owner) = setup();
        let file = index.create(&owner, &record("f", 1)).unwrap();
        let live = index.add_share_link(file.id, "live", None).unwrap();
        let expired = index
            .add_share_link(file.id, "old", Some(Utc::now() - chrono::Duration::hours(1)))
            .unwrap();
        let revoked = index.add_share_link(file.id, "gone", None).unwrap();
        index.revoke_share_link(revoked).unwrap();

        let deps = index.dependents(file.id).unwrap();
        let status = |id| deps.iter().find(|d| d.id() == id).unwrap().status();
        assert_eq!(status(live), DependentStatus::Active);
        assert_eq!(status(expired), DependentStatus::Inactive);
        assert_eq!(status(revoked), DependentStatus::Inactive);
    }
}
