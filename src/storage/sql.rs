// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL catalog repository (SQLite or MySQL through the sqlx `Any` driver).
//!
//! Schema:
//! ```sql
//! CREATE TABLE revisions (
//!   surrogate_id VARCHAR(36) PRIMARY KEY,
//!   level VARCHAR(16) NOT NULL,
//!   natural_id VARCHAR(255) NOT NULL,
//!   parent_ref VARCHAR(36),
//!   predecessor VARCHAR(36),
//!   source_hashes TEXT NOT NULL,    -- JSON array, one hash per source
//!   aggregate_hash VARCHAR(64) NOT NULL,
//!   size_bytes BIGINT NOT NULL,
//!   min_timestamp BIGINT NOT NULL,
//!   max_timestamp BIGINT NOT NULL,
//!   init_version BIGINT NOT NULL,
//!   rev_version BIGINT NOT NULL,
//!   final_version BIGINT NOT NULL,  -- 0 while live
//!   is_new, expanded, done, revised BIGINT NOT NULL,
//!   skip_mask BIGINT NOT NULL,
//!   metadata TEXT
//! )
//! CREATE TABLE revision_edges (
//!   parent_id VARCHAR(36) NOT NULL,
//!   child_id VARCHAR(36) NOT NULL,
//!   PRIMARY KEY (parent_id, child_id)
//! )
//! ```
//!
//! Flags are BIGINT because the `Any` driver only decodes `i64` from it.
//! Text columns are read as `String` first, then as bytes: the `Any` driver
//! hands MySQL TEXT back as a BLOB.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::{debug, info};

use super::traits::{
    CatalogConnector, CatalogStore, EgestReport, LevelCounts, RevisionBatch, StorageError,
};
use crate::resilience::retry::{retry, RetryConfig};
use crate::revision::{Level, Revision, SourceHashes, SurrogateId};
use crate::sources::SourceMask;

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const COLUMNS: &str = "r.surrogate_id, r.level, r.natural_id, r.parent_ref, r.predecessor, \
    r.source_hashes, r.aggregate_hash, r.size_bytes, r.min_timestamp, r.max_timestamp, \
    r.init_version, r.rev_version, r.final_version, r.is_new, r.expanded, r.done, r.revised, \
    r.skip_mask, r.metadata";

fn backend(e: impl std::fmt::Display) -> StorageError {
    StorageError::Backend(e.to_string())
}

#[derive(Clone)]
pub struct SqlCatalog {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlCatalog {
    /// Connect with startup-mode retry (fails fast if the URL is wrong) and
    /// create the schema if missing.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        let catalog = Self::open(connection_string).await?;
        if catalog.is_sqlite {
            catalog.enable_wal_mode().await?;
        }
        catalog.init_schema().await?;
        info!(sqlite = catalog.is_sqlite, "SQL catalog ready");
        Ok(catalog)
    }

    /// Connect only; the schema must already exist.
    async fn open(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let mut options = AnyPoolOptions::new()
            .max_connections(if is_sqlite { 4 } else { 10 })
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300));
        if is_sqlite {
            // workers open their own pools against the same file
            options = options.after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA busy_timeout = 5000").execute(conn).await?;
                    Ok(())
                })
            });
        }

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            options
                .clone()
                .connect(connection_string)
                .await
                .map_err(backend)
        })
        .await?;

        Ok(Self { pool, is_sqlite })
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS revisions (
                    surrogate_id TEXT PRIMARY KEY,
                    level TEXT NOT NULL,
                    natural_id TEXT NOT NULL,
                    parent_ref TEXT,
                    predecessor TEXT,
                    source_hashes TEXT NOT NULL,
                    aggregate_hash TEXT NOT NULL,
                    size_bytes INTEGER NOT NULL,
                    min_timestamp INTEGER NOT NULL,
                    max_timestamp INTEGER NOT NULL,
                    init_version INTEGER NOT NULL,
                    rev_version INTEGER NOT NULL,
                    final_version INTEGER NOT NULL,
                    is_new INTEGER NOT NULL,
                    expanded INTEGER NOT NULL,
                    done INTEGER NOT NULL,
                    revised INTEGER NOT NULL,
                    skip_mask INTEGER NOT NULL,
                    metadata TEXT
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_revisions_natural ON revisions (level, natural_id)",
                "CREATE INDEX IF NOT EXISTS idx_revisions_state ON revisions (level, final_version, done)",
                "CREATE INDEX IF NOT EXISTS idx_revisions_rev_version ON revisions (rev_version)",
                r#"
                CREATE TABLE IF NOT EXISTS revision_edges (
                    parent_id TEXT NOT NULL,
                    child_id TEXT NOT NULL,
                    PRIMARY KEY (parent_id, child_id)
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_edges_child ON revision_edges (child_id)",
            ]
        } else {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS revisions (
                    surrogate_id VARCHAR(36) PRIMARY KEY,
                    level VARCHAR(16) NOT NULL,
                    natural_id VARCHAR(255) NOT NULL,
                    parent_ref VARCHAR(36),
                    predecessor VARCHAR(36),
                    source_hashes TEXT NOT NULL,
                    aggregate_hash VARCHAR(64) NOT NULL,
                    size_bytes BIGINT NOT NULL,
                    min_timestamp BIGINT NOT NULL,
                    max_timestamp BIGINT NOT NULL,
                    init_version BIGINT NOT NULL,
                    rev_version BIGINT NOT NULL,
                    final_version BIGINT NOT NULL,
                    is_new BIGINT NOT NULL,
                    expanded BIGINT NOT NULL,
                    done BIGINT NOT NULL,
                    revised BIGINT NOT NULL,
                    skip_mask BIGINT NOT NULL,
                    metadata TEXT,
                    INDEX idx_revisions_natural (level, natural_id),
                    INDEX idx_revisions_state (level, final_version, done),
                    INDEX idx_revisions_rev_version (rev_version)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS revision_edges (
                    parent_id VARCHAR(36) NOT NULL,
                    child_id VARCHAR(36) NOT NULL,
                    PRIMARY KEY (parent_id, child_id),
                    INDEX idx_edges_child (child_id)
                )
                "#,
            ]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql).execute(&self.pool).await.map_err(backend)
            })
            .await?;
        }
        Ok(())
    }

    fn upsert_sql(&self) -> &'static str {
        if self.is_sqlite {
            "INSERT INTO revisions (surrogate_id, level, natural_id, parent_ref, predecessor, \
                source_hashes, aggregate_hash, size_bytes, min_timestamp, max_timestamp, \
                init_version, rev_version, final_version, is_new, expanded, done, revised, \
                skip_mask, metadata) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(surrogate_id) DO UPDATE SET \
                source_hashes = excluded.source_hashes, \
                aggregate_hash = excluded.aggregate_hash, \
                size_bytes = excluded.size_bytes, \
                min_timestamp = excluded.min_timestamp, \
                max_timestamp = excluded.max_timestamp, \
                rev_version = excluded.rev_version, \
                final_version = excluded.final_version, \
                expanded = excluded.expanded, \
                done = excluded.done, \
                revised = excluded.revised, \
                skip_mask = excluded.skip_mask, \
                metadata = excluded.metadata"
        } else {
            "INSERT INTO revisions (surrogate_id, level, natural_id, parent_ref, predecessor, \
                source_hashes, aggregate_hash, size_bytes, min_timestamp, max_timestamp, \
                init_version, rev_version, final_version, is_new, expanded, done, revised, \
                skip_mask, metadata) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE \
                source_hashes = VALUES(source_hashes), \
                aggregate_hash = VALUES(aggregate_hash), \
                size_bytes = VALUES(size_bytes), \
                min_timestamp = VALUES(min_timestamp), \
                max_timestamp = VALUES(max_timestamp), \
                rev_version = VALUES(rev_version), \
                final_version = VALUES(final_version), \
                expanded = VALUES(expanded), \
                done = VALUES(done), \
                revised = VALUES(revised), \
                skip_mask = VALUES(skip_mask), \
                metadata = VALUES(metadata)"
        }
    }

    fn insert_edge_sql(&self) -> &'static str {
        if self.is_sqlite {
            "INSERT OR IGNORE INTO revision_edges (parent_id, child_id) VALUES (?, ?)"
        } else {
            "INSERT IGNORE INTO revision_edges (parent_id, child_id) VALUES (?, ?)"
        }
    }

    fn copy_edges_sql(&self) -> &'static str {
        if self.is_sqlite {
            "INSERT OR IGNORE INTO revision_edges (parent_id, child_id) \
             SELECT ?, child_id FROM revision_edges WHERE parent_id = ?"
        } else {
            "INSERT IGNORE INTO revision_edges (parent_id, child_id) \
             SELECT ?, child_id FROM revision_edges WHERE parent_id = ?"
        }
    }

    async fn apply(&self, batch: &RevisionBatch) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await
            .map_err(|e| StorageError::Backend(format!("Failed to begin transaction: {}", e)))?;

        for rev in batch.upserts() {
            let source_hashes = serde_json::to_string(&rev.source_hashes).map_err(backend)?;
            let metadata = if rev.metadata.is_null() {
                None
            } else {
                Some(serde_json::to_string(&rev.metadata).map_err(backend)?)
            };
            sqlx::query(self.upsert_sql())
                .bind(rev.surrogate_id.to_string())
                .bind(rev.level.as_str())
                .bind(&rev.natural_id)
                .bind(rev.parent_ref.map(|id| id.to_string()))
                .bind(rev.predecessor.map(|id| id.to_string()))
                .bind(source_hashes)
                .bind(&rev.aggregate_hash)
                .bind(rev.size_bytes as i64)
                .bind(rev.min_timestamp)
                .bind(rev.max_timestamp)
                .bind(i64::from(rev.init_version))
                .bind(i64::from(rev.rev_version))
                .bind(i64::from(rev.final_version))
                .bind(i64::from(rev.is_new))
                .bind(i64::from(rev.expanded))
                .bind(i64::from(rev.done))
                .bind(i64::from(rev.revised))
                .bind(rev.skip_mask.bits() as i64)
                .bind(metadata)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }

        for (from, to) in batch.copied_links() {
            sqlx::query(self.copy_edges_sql())
                .bind(to.to_string())
                .bind(from.to_string())
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }

        for (parent, child) in batch.unlinks() {
            sqlx::query("DELETE FROM revision_edges WHERE parent_id = ? AND child_id = ?")
                .bind(parent.to_string())
                .bind(child.to_string())
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }

        for (parent, child) in batch.links() {
            sqlx::query(self.insert_edge_sql())
                .bind(parent.to_string())
                .bind(child.to_string())
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }

        for id in batch.discards() {
            let id = id.to_string();
            sqlx::query("DELETE FROM revision_edges WHERE parent_id = ? OR child_id = ?")
                .bind(&id)
                .bind(&id)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
            sqlx::query("DELETE FROM revisions WHERE surrogate_id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }

        tx.commit().await
            .map_err(|e| StorageError::Backend(format!("Failed to commit transaction: {}", e)))?;
        Ok(())
    }

    async fn count_where(&self, level: Level, condition: &str) -> Result<u64, StorageError> {
        let sql = format!("SELECT COUNT(*) AS cnt FROM revisions WHERE level = ? AND {}", condition);
        let row = sqlx::query(&sql)
            .bind(level.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        let count: i64 = row.try_get("cnt").map_err(backend)?;
        Ok(count as u64)
    }
}

/// Read a text column as String (SQLite) or bytes (MySQL TEXT).
fn text(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(column)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

fn required_text(row: &AnyRow, column: &str) -> Result<String, StorageError> {
    text(row, column).ok_or_else(|| StorageError::Backend(format!("column '{}' missing", column)))
}

fn int(row: &AnyRow, column: &str) -> Result<i64, StorageError> {
    row.try_get::<i64, _>(column).map_err(backend)
}

fn surrogate(value: &str) -> Result<SurrogateId, StorageError> {
    value
        .parse()
        .map_err(|e| StorageError::Backend(format!("bad surrogate id '{}': {}", value, e)))
}

fn optional_surrogate(value: Option<String>) -> Result<Option<SurrogateId>, StorageError> {
    value.filter(|v| !v.is_empty()).map(|v| surrogate(&v)).transpose()
}

fn row_to_revision(row: &AnyRow) -> Result<Revision, StorageError> {
    let level: Level = required_text(row, "level")?.parse().map_err(backend)?;
    let source_hashes: SourceHashes =
        serde_json::from_str(&required_text(row, "source_hashes")?).map_err(backend)?;
    let metadata = match text(row, "metadata") {
        Some(json) if !json.is_empty() => serde_json::from_str(&json).map_err(backend)?,
        _ => serde_json::Value::Null,
    };

    Ok(Revision {
        level,
        natural_id: required_text(row, "natural_id")?,
        surrogate_id: surrogate(&required_text(row, "surrogate_id")?)?,
        parent_ref: optional_surrogate(text(row, "parent_ref"))?,
        predecessor: optional_surrogate(text(row, "predecessor"))?,
        source_hashes,
        aggregate_hash: text(row, "aggregate_hash").unwrap_or_default(),
        size_bytes: int(row, "size_bytes")? as u64,
        min_timestamp: int(row, "min_timestamp")?,
        max_timestamp: int(row, "max_timestamp")?,
        init_version: int(row, "init_version")? as u32,
        rev_version: int(row, "rev_version")? as u32,
        final_version: int(row, "final_version")? as u32,
        is_new: int(row, "is_new")? != 0,
        expanded: int(row, "expanded")? != 0,
        done: int(row, "done")? != 0,
        revised: int(row, "revised")? != 0,
        skip_mask: SourceMask::from_bits(int(row, "skip_mask")? as u64),
        metadata,
    })
}

fn rows_to_revisions(rows: &[AnyRow]) -> Result<Vec<Revision>, StorageError> {
    rows.iter().map(row_to_revision).collect()
}

#[async_trait]
impl CatalogStore for SqlCatalog {
    async fn close(&self) {
        self.pool.close().await;
    }

    async fn get(&self, id: &SurrogateId) -> Result<Option<Revision>, StorageError> {
        let sql = format!("SELECT {} FROM revisions r WHERE r.surrogate_id = ?", COLUMNS);
        let id = id.to_string();
        let row = retry("sql_get", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(&id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;
        row.as_ref().map(row_to_revision).transpose()
    }

    async fn live(&self, level: Level, natural_id: &str) -> Result<Option<Revision>, StorageError> {
        let sql = format!(
            "SELECT {} FROM revisions r WHERE r.level = ? AND r.natural_id = ? AND r.final_version = 0",
            COLUMNS
        );
        let row = retry("sql_live", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(level.as_str())
                .bind(natural_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;
        row.as_ref().map(row_to_revision).transpose()
    }

    async fn history(&self, level: Level, natural_id: &str) -> Result<Vec<Revision>, StorageError> {
        let sql = format!(
            "SELECT {} FROM revisions r WHERE r.level = ? AND r.natural_id = ? \
             ORDER BY r.rev_version, CASE WHEN r.final_version = 0 THEN 1 ELSE 0 END",
            COLUMNS
        );
        let rows = retry("sql_history", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(level.as_str())
                .bind(natural_id)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;
        rows_to_revisions(&rows)
    }

    async fn children(&self, parent: &SurrogateId) -> Result<Vec<Revision>, StorageError> {
        let sql = format!(
            "SELECT {} FROM revisions r JOIN revision_edges e ON e.child_id = r.surrogate_id \
             WHERE e.parent_id = ? ORDER BY r.natural_id",
            COLUMNS
        );
        let parent = parent.to_string();
        let rows = retry("sql_children", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(&parent)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;
        rows_to_revisions(&rows)
    }

    async fn not_done(&self, level: Level) -> Result<Vec<Revision>, StorageError> {
        let sql = format!(
            "SELECT {} FROM revisions r WHERE r.level = ? AND r.final_version = 0 AND r.done = 0 \
             ORDER BY r.natural_id",
            COLUMNS
        );
        let rows = retry("sql_not_done", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(level.as_str())
                .fetch_all(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;
        rows_to_revisions(&rows)
    }

    async fn counts(&self, level: Level) -> Result<LevelCounts, StorageError> {
        let done = self.count_where(level, "final_version = 0 AND done = 1").await?;
        let not_done = self.count_where(level, "final_version = 0 AND done = 0").await?;
        let retired = self.count_where(level, "final_version <> 0").await?;
        Ok(LevelCounts {
            live: done + not_done,
            done,
            not_done,
            retired,
        })
    }

    async fn commit(&self, batch: RevisionBatch) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }
        let result = retry("sql_commit", &RetryConfig::query(), || self.apply(&batch)).await;
        crate::metrics::record_store_operation(
            "sql",
            "commit",
            if result.is_ok() { "success" } else { "error" },
        );
        result
    }

    async fn egest_version(&self, version: u32) -> Result<EgestReport, StorageError> {
        let version = i64::from(version);
        let mut tx = self.pool.begin().await
            .map_err(|e| StorageError::Backend(format!("Failed to begin transaction: {}", e)))?;

        sqlx::query(
            "DELETE FROM revision_edges WHERE \
             parent_id IN (SELECT surrogate_id FROM revisions WHERE rev_version = ?) \
             OR child_id IN (SELECT surrogate_id FROM revisions WHERE rev_version = ?)",
        )
        .bind(version)
        .bind(version)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        let deleted = sqlx::query("DELETE FROM revisions WHERE rev_version = ?")
            .bind(version)
            .execute(&mut *tx)
            .await
            .map_err(backend)?
            .rows_affected();

        let restored = if version > 1 {
            sqlx::query("UPDATE revisions SET final_version = 0 WHERE final_version = ?")
                .bind(version - 1)
                .execute(&mut *tx)
                .await
                .map_err(backend)?
                .rows_affected()
        } else {
            0
        };

        tx.commit().await
            .map_err(|e| StorageError::Backend(format!("Failed to commit transaction: {}", e)))?;

        crate::metrics::record_store_operation("sql", "egest", "success");
        debug!(version, deleted, restored, "Version egested");
        Ok(EgestReport { deleted, restored })
    }
}

/// Opens a fresh pool per worker against the same database. Only the
/// first pool sets the schema up.
#[derive(Debug, Clone)]
pub struct SqlConnector {
    url: String,
    prepared: Arc<AtomicBool>,
}

impl SqlConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            prepared: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn open(&self) -> Result<SqlCatalog, StorageError> {
        if self.prepared.load(Ordering::Acquire) {
            return SqlCatalog::open(&self.url).await;
        }
        let catalog = SqlCatalog::new(&self.url).await?;
        self.prepared.store(true, Ordering::Release);
        Ok(catalog)
    }
}

#[async_trait]
impl CatalogConnector for SqlConnector {
    async fn connect(&self) -> Result<Arc<dyn CatalogStore>, StorageError> {
        Ok(Arc::new(self.open().await?))
    }
}
