//! SQLite implementation of IEntryStore
//!
//! ## Type Mapping
//!
//! | Domain Type          | SQL Type | Strategy                                         |
//! |----------------------|----------|--------------------------------------------------|
//! | EntryId              | TEXT     | UUID string via `.to_string()` / `FromStr`       |
//! | EntryKind            | TEXT     | `"file"` / `"directory"` via `name()`            |
//! | EntryState           | INTEGER  | raw bits via `bits()` / `from_bits()`            |
//! | Sha1Hash, Md5Hash    | TEXT     | lowercase hex, NULL when unknown                 |
//! | DateTime<Utc>        | TEXT     | RFC 3339 with nanoseconds                        |
//! | AdapterBinding       | row      | one `bindings` row per (entry, adapter)          |
//!
//! Binding rows are replaced wholesale on every write. An adapter may reuse a
//! unique id once the item it named is gone (inode reuse on local disks), so
//! writing a binding first detaches that id from whichever entry held it.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use treesync_core::domain::{
    AdapterBinding, AdapterId, ContentHashes, CursorToken, Entry, EntryId, EntryKind, EntryParts,
    EntryState, Md5Hash, Sha1Hash, UniqueId,
};
use treesync_core::ports::{EntryCounts, IEntryStore};

use crate::CacheError;

/// SQLite-backed entry store
pub struct SqliteEntryStore {
    pool: SqlitePool,
}

impl SqliteEntryStore {
    /// Creates a new store over the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Every remembered cursor, ordered by adapter
    pub async fn list_cursors(&self) -> anyhow::Result<Vec<(AdapterId, CursorToken)>> {
        let rows = sqlx::query("SELECT adapter_id, token FROM cursors ORDER BY adapter_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> anyhow::Result<(AdapterId, CursorToken)> {
                let adapter = AdapterId::new(row.get("adapter_id")).map_err(CacheError::from)?;
                let token = CursorToken::new(row.get("token")).map_err(CacheError::from)?;
                Ok((adapter, token))
            })
            .collect()
    }

    async fn load_bindings(
        &self,
        sql: &str,
        bind: Option<String>,
    ) -> Result<HashMap<String, Vec<AdapterBinding>>, CacheError> {
        let mut query = sqlx::query(sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        let mut map: HashMap<String, Vec<AdapterBinding>> = HashMap::new();
        for row in &rows {
            let entry_id: String = row.get("entry_id");
            map.entry(entry_id).or_default().push(binding_from_row(row)?);
        }
        Ok(map)
    }

    async fn write_entry(&self, entry: &Entry, insert: bool) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        let id = entry.id().to_string();

        let sql = if insert {
            "INSERT INTO entries \
             (parent_id, name, kind, created, modified, size, \
              source_sha1, source_md5, destination_sha1, destination_md5, state, id) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        } else {
            "UPDATE entries SET \
             parent_id = ?, name = ?, kind = ?, created = ?, modified = ?, size = ?, \
             source_sha1 = ?, source_md5 = ?, destination_sha1 = ?, destination_md5 = ?, \
             state = ? \
             WHERE id = ?"
        };

        let result = sqlx::query(sql)
            .bind(entry.parent_id().map(|p| p.to_string()))
            .bind(entry.name())
            .bind(entry.kind().name())
            .bind(format_datetime(&entry.created()))
            .bind(format_datetime(&entry.modified()))
            .bind(entry.size() as i64)
            .bind(entry.source_hashes().sha1.as_ref().map(|h| h.as_str()))
            .bind(entry.source_hashes().md5.as_ref().map(|h| h.as_str()))
            .bind(entry.destination_hashes().sha1.as_ref().map(|h| h.as_str()))
            .bind(entry.destination_hashes().md5.as_ref().map(|h| h.as_str()))
            .bind(i64::from(entry.state().bits()))
            .bind(&id)
            .execute(&mut *tx)
            .await?;

        if !insert && result.rows_affected() == 0 {
            anyhow::bail!("Entry {} does not exist", id);
        }

        replace_bindings(&mut tx, &id, entry.bindings()).await?;
        tx.commit().await?;

        tracing::trace!(entry_id = %id, insert, "Saved entry");
        Ok(())
    }
}

// ============================================================================
// Helper functions for type conversion
// ============================================================================

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, CacheError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            CacheError::SerializationError(format!("Failed to parse datetime '{}': {}", s, e))
        })
}

fn hashes_from_row(row: &SqliteRow, prefix: &str) -> Result<ContentHashes, CacheError> {
    let sha1: Option<String> = row.get(format!("{prefix}_sha1").as_str());
    let md5: Option<String> = row.get(format!("{prefix}_md5").as_str());
    Ok(ContentHashes {
        sha1: sha1.map(Sha1Hash::new).transpose()?,
        md5: md5.map(Md5Hash::new).transpose()?,
    })
}

fn binding_from_row(row: &SqliteRow) -> Result<AdapterBinding, CacheError> {
    Ok(AdapterBinding::new(
        AdapterId::new(row.get("adapter_id"))?,
        UniqueId::new(row.get("unique_id"))?,
    ))
}

// ============================================================================
// Row mapping functions
// ============================================================================

fn entry_from_row(row: &SqliteRow, bindings: Vec<AdapterBinding>) -> Result<Entry, CacheError> {
    let id_str: String = row.get("id");
    let parent_str: Option<String> = row.get("parent_id");
    let kind_str: String = row.get("kind");
    let created: String = row.get("created");
    let modified: String = row.get("modified");
    let size: i64 = row.get("size");
    let state: i64 = row.get("state");

    let parse_id = |s: &str| {
        EntryId::from_str(s).map_err(|e| {
            CacheError::SerializationError(format!("Invalid entry id '{}': {}", s, e))
        })
    };

    let parts = EntryParts {
        id: parse_id(&id_str)?,
        parent_id: parent_str.as_deref().map(parse_id).transpose()?,
        name: row.get("name"),
        kind: EntryKind::from_name(&kind_str)?,
        created: parse_datetime(&created)?,
        modified: parse_datetime(&modified)?,
        size: u64::try_from(size)
            .map_err(|_| CacheError::SerializationError(format!("Negative size {}", size)))?,
        source_hashes: hashes_from_row(row, "source")?,
        destination_hashes: hashes_from_row(row, "destination")?,
        state: EntryState::from_bits(state as u8),
        bindings,
    };
    Ok(Entry::from_parts(parts)?)
}

fn entries_from_rows(
    rows: &[SqliteRow],
    mut bindings: HashMap<String, Vec<AdapterBinding>>,
) -> Result<Vec<Entry>, CacheError> {
    rows.iter()
        .map(|row| {
            let id: String = row.get("id");
            entry_from_row(row, bindings.remove(&id).unwrap_or_default())
        })
        .collect()
}

async fn replace_bindings(
    tx: &mut Transaction<'_, Sqlite>,
    entry_id: &str,
    bindings: &[AdapterBinding],
) -> Result<(), CacheError> {
    sqlx::query("DELETE FROM bindings WHERE entry_id = ?")
        .bind(entry_id)
        .execute(&mut **tx)
        .await?;

    for binding in bindings {
        sqlx::query("DELETE FROM bindings WHERE adapter_id = ? AND unique_id = ?")
            .bind(binding.adapter_id.as_str())
            .bind(binding.unique_id.as_str())
            .execute(&mut **tx)
            .await?;
        sqlx::query("INSERT INTO bindings (entry_id, adapter_id, unique_id) VALUES (?, ?, ?)")
            .bind(entry_id)
            .bind(binding.adapter_id.as_str())
            .bind(binding.unique_id.as_str())
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

// ============================================================================
// IEntryStore implementation
// ============================================================================

#[async_trait::async_trait]
impl IEntryStore for SqliteEntryStore {
    async fn get_entry(&self, id: EntryId) -> anyhow::Result<Option<Entry>> {
        let id_str = id.to_string();
        let row = sqlx::query("SELECT * FROM entries WHERE id = ?")
            .bind(&id_str)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => {
                let mut bindings = self
                    .load_bindings("SELECT * FROM bindings WHERE entry_id = ?", Some(id_str))
                    .await?;
                let own = bindings.drain().flat_map(|(_, b)| b).collect();
                Ok(Some(entry_from_row(r, own)?))
            }
            None => Ok(None),
        }
    }

    async fn get_root(&self) -> anyhow::Result<Option<Entry>> {
        let id: Option<String> =
            sqlx::query_scalar("SELECT id FROM entries WHERE parent_id IS NULL LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        match id {
            Some(id) => {
                let id = EntryId::from_str(&id)
                    .map_err(|e| CacheError::SerializationError(e.to_string()))?;
                self.get_entry(id).await
            }
            None => Ok(None),
        }
    }

    async fn get_children(&self, parent: EntryId) -> anyhow::Result<Vec<Entry>> {
        let parent_str = parent.to_string();
        let rows = sqlx::query("SELECT * FROM entries WHERE parent_id = ? ORDER BY name")
            .bind(&parent_str)
            .fetch_all(&self.pool)
            .await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let bindings = self
            .load_bindings(
                "SELECT b.* FROM bindings b JOIN entries e ON b.entry_id = e.id \
                 WHERE e.parent_id = ?",
                Some(parent_str),
            )
            .await?;
        Ok(entries_from_rows(&rows, bindings)?)
    }

    async fn get_by_binding(
        &self,
        adapter: &AdapterId,
        unique_id: &UniqueId,
    ) -> anyhow::Result<Option<Entry>> {
        let id: Option<String> = sqlx::query_scalar(
            "SELECT entry_id FROM bindings WHERE adapter_id = ? AND unique_id = ?",
        )
        .bind(adapter.as_str())
        .bind(unique_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match id {
            Some(id) => {
                let id = EntryId::from_str(&id)
                    .map_err(|e| CacheError::SerializationError(e.to_string()))?;
                self.get_entry(id).await
            }
            None => Ok(None),
        }
    }

    async fn get_all(&self) -> anyhow::Result<Vec<Entry>> {
        let rows = sqlx::query("SELECT * FROM entries")
            .fetch_all(&self.pool)
            .await?;
        let bindings = self.load_bindings("SELECT * FROM bindings", None).await?;
        Ok(entries_from_rows(&rows, bindings)?)
    }

    async fn insert_entry(&self, entry: &Entry) -> anyhow::Result<()> {
        self.write_entry(entry, true).await
    }

    async fn update_entry(&self, entry: &Entry) -> anyhow::Result<()> {
        self.write_entry(entry, false).await
    }

    async fn get_cursor(&self, adapter: &AdapterId) -> anyhow::Result<Option<CursorToken>> {
        let token: Option<String> =
            sqlx::query_scalar("SELECT token FROM cursors WHERE adapter_id = ?")
                .bind(adapter.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(token
            .map(CursorToken::new)
            .transpose()
            .map_err(CacheError::from)?)
    }

    async fn set_cursor(&self, adapter: &AdapterId, token: &CursorToken) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO cursors (adapter_id, token, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(adapter_id) DO UPDATE SET token = excluded.token, \
             updated_at = excluded.updated_at",
        )
        .bind(adapter.as_str())
        .bind(token.as_str())
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool)
        .await?;

        tracing::debug!(adapter = %adapter, "Cursor saved");
        Ok(())
    }

    async fn count_entries(&self) -> anyhow::Result<EntryCounts> {
        let deleted = i64::from(EntryState::IS_DELETED);
        let not_sync = i64::from(EntryState::NOT_SYNCHRONIZED);

        let row = sqlx::query(
            "SELECT \
               COALESCE(SUM(CASE WHEN kind = 'file' AND (state & ?1) = 0 THEN 1 ELSE 0 END), 0) AS files, \
               COALESCE(SUM(CASE WHEN kind = 'directory' AND (state & ?1) = 0 THEN 1 ELSE 0 END), 0) AS directories, \
               COALESCE(SUM(CASE WHEN (state & ?1) != 0 THEN 1 ELSE 0 END), 0) AS deleted, \
               COALESCE(SUM(CASE WHEN (state & ?1) = 0 AND (state & ?2) != 0 THEN 1 ELSE 0 END), 0) AS not_synchronized \
             FROM entries WHERE parent_id IS NOT NULL",
        )
        .bind(deleted)
        .bind(not_sync)
        .fetch_one(&self.pool)
        .await?;

        let get = |name: &str| -> u64 {
            let value: i64 = row.get(name);
            value.max(0) as u64
        };
        Ok(EntryCounts {
            files: get("files"),
            directories: get("directories"),
            deleted: get("deleted"),
            not_synchronized: get("not_synchronized"),
        })
    }
}
