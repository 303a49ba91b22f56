//! HS: normalized main record + per-parent child tables, with safe online
//! schema migration (spec §2 HS, §4.4). Schema evolution is introspection
//! driven — `PRAGMA table_info` then conditional `ALTER TABLE ADD COLUMN` —
//! rather than a fixed migration file, so an upgrade never requires the
//! operator to run a separate migration step. Grounded directly in
//! `HistoryManager._ensure_database_exists`/`_ensure_table_schema`
//! (`original_source/routes/utils/history_manager.py`); `sqlx::SqlitePool`
//! is the teacher's persistence stack (`src/database.rs`), used here in
//! place of its static `sqlx::migrate!` macro because the spec calls for
//! introspect-then-ALTER evolution instead of versioned migration files.

use std::collections::HashSet;

use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::error::Result;
use crate::models::{ChildTrackRow, DownloadHistory, DownloadHistoryWrite};

/// `(column name, SQL type)` pairs, in the order they should be added when
/// missing. Mirrors `expected_download_history_columns` in the original.
const DOWNLOAD_HISTORY_COLUMNS: &[(&str, &str)] = &[
    ("download_type", "TEXT NOT NULL DEFAULT ''"),
    ("title", "TEXT NOT NULL DEFAULT ''"),
    ("artists", "TEXT"),
    ("timestamp", "TEXT"),
    ("status", "TEXT NOT NULL DEFAULT 'unknown'"),
    ("service", "TEXT"),
    ("quality_format", "TEXT"),
    ("quality_bitrate", "TEXT"),
    ("total_tracks", "INTEGER"),
    ("successful_tracks", "INTEGER"),
    ("failed_tracks", "INTEGER"),
    ("skipped_tracks", "INTEGER"),
    ("children_table", "TEXT"),
    ("task_id", "TEXT"),
    ("external_ids", "TEXT"),
    ("metadata", "TEXT"),
];

const CHILD_TABLE_COLUMNS: &[(&str, &str)] = &[
    ("title", "TEXT NOT NULL DEFAULT ''"),
    ("artists", "TEXT"),
    ("album_title", "TEXT"),
    ("duration_ms", "INTEGER"),
    ("track_number", "INTEGER"),
    ("disc_number", "INTEGER"),
    ("explicit", "BOOLEAN"),
    ("status", "TEXT NOT NULL DEFAULT 'unknown'"),
    ("external_ids", "TEXT"),
    ("genres", "TEXT"),
    ("isrc", "TEXT"),
    ("timestamp", "TEXT"),
    ("position", "INTEGER"),
    ("metadata", "TEXT"),
    ("service", "TEXT"),
    ("quality_format", "TEXT"),
    ("quality_bitrate", "TEXT"),
];

/// Legacy columns that migrate into `timestamp` the first time it is added,
/// tried in this order (spec SPEC_FULL.md §"Supplemented features").
const LEGACY_TIMESTAMP_COLUMNS: &[&str] = &["time", "created_at", "date"];

pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Idempotently creates `download_history` and upgrades its schema.
    /// Safe to call on every startup (spec §4.4: "online schema migration").
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS download_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                download_type TEXT NOT NULL,
                title TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        self.ensure_table_schema("download_history", DOWNLOAD_HISTORY_COLUMNS).await?;
        self.migrate_legacy_download_history_columns().await?;
        self.ensure_download_history_indexes().await?;
        self.migrate_existing_child_tables().await?;

        Ok(())
    }

    async fn existing_columns(&self, table: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("name"))
            .collect())
    }

    /// Add any column from `expected` missing from the live table. Failures
    /// on one column are logged and do not prevent the rest (spec: schema
    /// evolution is best-effort and non-fatal, per the original's
    /// try/except-per-statement shape).
    async fn ensure_table_schema(&self, table: &str, expected: &[(&str, &str)]) -> Result<()> {
        let existing = self.existing_columns(table).await?;
        for (column, sql_type) in expected {
            if existing.contains(*column) {
                continue;
            }
            let stmt = format!("ALTER TABLE {table} ADD COLUMN {column} {sql_type}");
            match sqlx::query(&stmt).execute(&self.pool).await {
                Ok(_) => info!(table, column, "added missing column"),
                Err(e) => warn!(table, column, error = %e, "could not add column"),
            }
        }
        Ok(())
    }

    async fn migrate_legacy_download_history_columns(&self) -> Result<()> {
        let cols = self.existing_columns("download_history").await?;

        if let Some(legacy) = LEGACY_TIMESTAMP_COLUMNS.iter().find(|c| cols.contains(**c)) {
            let _ = sqlx::query(&format!(
                "UPDATE download_history SET timestamp = {legacy} WHERE timestamp IS NULL"
            ))
            .execute(&self.pool)
            .await;
        }

        if cols.contains("quality") {
            let _ = sqlx::query(
                "UPDATE download_history SET quality_format = quality WHERE quality_format IS NULL",
            )
            .execute(&self.pool)
            .await;
        }
        if cols.contains("bitrate") {
            let _ = sqlx::query(
                "UPDATE download_history SET quality_bitrate = bitrate WHERE quality_bitrate IS NULL",
            )
            .execute(&self.pool)
            .await;
        }
        Ok(())
    }

    async fn ensure_download_history_indexes(&self) -> Result<()> {
        let cols = self.existing_columns("download_history").await?;
        if cols.contains("timestamp") {
            let _ = sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_download_history_timestamp ON download_history(timestamp)",
            )
            .execute(&self.pool)
            .await;
        }
        if cols.contains("download_type") && cols.contains("status") {
            let _ = sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_download_history_type_status ON download_history(download_type, status)",
            )
            .execute(&self.pool)
            .await;
        }
        if cols.contains("task_id") {
            let _ = sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_download_history_task_id ON download_history(task_id)",
            )
            .execute(&self.pool)
            .await;
        }
        if cols.contains("task_id") && cols.contains("download_type") && cols.contains("external_ids") {
            let _ = sqlx::query(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_download_history_task_type_external \
                 ON download_history(task_id, download_type, external_ids)",
            )
            .execute(&self.pool)
            .await;
        }
        Ok(())
    }

    async fn child_table_names(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type='table' AND (name LIKE 'album_%' OR name LIKE 'playlist_%')",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|row| row.get::<String, _>("name")).collect())
    }

    async fn migrate_existing_child_tables(&self) -> Result<()> {
        for table in self.child_table_names().await? {
            if table == "download_history" {
                continue;
            }
            if let Err(e) = self.ensure_child_table(&table).await {
                warn!(table, error = %e, "non-fatal: failed to migrate children table");
            }
        }
        Ok(())
    }

    /// Create (or upgrade) a dynamically-named child table for a given
    /// album/playlist task (spec §4.2 step 4). The name is derived from the
    /// parent kind and a slug of the task id, e.g. `album_3fa85f64`.
    pub async fn ensure_child_table(&self, table_name: &str) -> Result<()> {
        validate_table_name(table_name)?;
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS {table_name} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL
            )"#
        ))
        .execute(&self.pool)
        .await?;
        self.ensure_table_schema(table_name, CHILD_TABLE_COLUMNS).await?;
        Ok(())
    }

    pub fn child_table_name(parent_kind: &str, task_id: &str) -> String {
        let slug: String = task_id.chars().filter(|c| c.is_ascii_alphanumeric()).take(16).collect();
        format!("{parent_kind}_{slug}")
    }

    /// Upsert the parent row for a task. Matches on `task_id` since HS never
    /// creates two parent rows for the same fingerprint (spec §4.4 write
    /// contract).
    pub async fn upsert_download_history(&self, record: &DownloadHistoryWrite) -> Result<i64> {
        let artists = serde_json::to_string(&record.artists)?;
        let external_ids = serde_json::to_string(&record.external_ids)?;
        let metadata = serde_json::to_string(&record.metadata)?;
        let now = chrono::Utc::now().to_rfc3339();

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM download_history WHERE task_id = ?",
        )
        .bind(&record.task_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = existing {
            sqlx::query(
                r#"UPDATE download_history SET
                    download_type = ?, title = ?, artists = ?, status = ?, service = ?,
                    quality_format = ?, quality_bitrate = ?, total_tracks = ?,
                    successful_tracks = ?, failed_tracks = ?, skipped_tracks = ?,
                    children_table = ?, external_ids = ?, metadata = ?
                WHERE id = ?"#,
            )
            .bind(&record.download_type)
            .bind(&record.title)
            .bind(&artists)
            .bind(&record.status)
            .bind(&record.service)
            .bind(&record.quality_format)
            .bind(&record.quality_bitrate)
            .bind(record.total_tracks)
            .bind(record.successful_tracks)
            .bind(record.failed_tracks)
            .bind(record.skipped_tracks)
            .bind(&record.children_table)
            .bind(&external_ids)
            .bind(&metadata)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(id)
        } else {
            let result = sqlx::query(
                r#"INSERT INTO download_history
                    (download_type, title, artists, timestamp, status, service,
                     quality_format, quality_bitrate, total_tracks, successful_tracks,
                     failed_tracks, skipped_tracks, children_table, task_id, external_ids, metadata)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(&record.download_type)
            .bind(&record.title)
            .bind(&artists)
            .bind(&now)
            .bind(&record.status)
            .bind(&record.service)
            .bind(&record.quality_format)
            .bind(&record.quality_bitrate)
            .bind(record.total_tracks)
            .bind(record.successful_tracks)
            .bind(record.failed_tracks)
            .bind(record.skipped_tracks)
            .bind(&record.children_table)
            .bind(&record.task_id)
            .bind(&external_ids)
            .bind(&metadata)
            .execute(&self.pool)
            .await?;
            Ok(result.last_insert_rowid())
        }
    }

    pub async fn insert_child_row(&self, table_name: &str, row: &ChildTrackRow) -> Result<()> {
        validate_table_name(table_name)?;
        sqlx::query(&format!(
            r#"INSERT INTO {table_name}
                (title, artists, album_title, duration_ms, track_number, disc_number,
                 explicit, status, external_ids, genres, isrc, timestamp, position,
                 metadata, service, quality_format, quality_bitrate)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#
        ))
        .bind(&row.title)
        .bind(&row.artists)
        .bind(&row.album_title)
        .bind(row.duration_ms)
        .bind(row.track_number)
        .bind(row.disc_number)
        .bind(row.explicit)
        .bind(&row.status)
        .bind(&row.external_ids)
        .bind(&row.genres)
        .bind(&row.isrc)
        .bind(row.timestamp.to_rfc3339())
        .bind(row.position)
        .bind(&row.metadata)
        .bind(&row.service)
        .bind(&row.quality_format)
        .bind(&row.quality_bitrate)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_by_task_id(&self, task_id: &str) -> Result<Option<DownloadHistory>> {
        let row = sqlx::query_as::<_, DownloadHistory>(
            "SELECT id, download_type, title, artists, timestamp, status, service, \
             quality_format, quality_bitrate, total_tracks, successful_tracks, failed_tracks, \
             skipped_tracks, children_table, task_id, external_ids, metadata \
             FROM download_history WHERE task_id = ?",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_children(&self, table_name: &str) -> Result<Vec<ChildTrackRow>> {
        validate_table_name(table_name)?;
        let rows = sqlx::query_as::<_, ChildTrackRow>(&format!(
            "SELECT title, artists, album_title, duration_ms, track_number, disc_number, \
             explicit, status, external_ids, genres, isrc, timestamp, position, metadata, \
             service, quality_format, quality_bitrate FROM {table_name} ORDER BY position"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Paginated listing with optional `download_type`/`status` filters,
    /// newest first (spec §4.4 "list with pagination and filters").
    pub async fn list_download_history(
        &self,
        filter: &HistoryFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DownloadHistory>> {
        let mut clauses = Vec::new();
        if filter.download_type.is_some() {
            clauses.push("download_type = ?");
        }
        if filter.status.is_some() {
            clauses.push("status = ?");
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let sql = format!(
            "SELECT id, download_type, title, artists, timestamp, status, service, \
             quality_format, quality_bitrate, total_tracks, successful_tracks, failed_tracks, \
             skipped_tracks, children_table, task_id, external_ids, metadata \
             FROM download_history {where_clause} ORDER BY timestamp DESC LIMIT ? OFFSET ?"
        );
        let mut query = sqlx::query_as::<_, DownloadHistory>(&sql);
        if let Some(download_type) = &filter.download_type {
            query = query.bind(download_type);
        }
        if let Some(status) = &filter.status {
            query = query.bind(status);
        }
        query = query.bind(limit).bind(offset);
        Ok(query.fetch_all(&self.pool).await?)
    }

    /// Case-insensitive substring search over `title`/`artists` (spec §4.4
    /// "search by title/artist").
    pub async fn search_download_history(&self, query: &str, limit: i64, offset: i64) -> Result<Vec<DownloadHistory>> {
        let pattern = format!("%{}%", query.replace('%', "\\%").replace('_', "\\_"));
        let rows = sqlx::query_as::<_, DownloadHistory>(
            "SELECT id, download_type, title, artists, timestamp, status, service, \
             quality_format, quality_bitrate, total_tracks, successful_tracks, failed_tracks, \
             skipped_tracks, children_table, task_id, external_ids, metadata \
             FROM download_history \
             WHERE title LIKE ? ESCAPE '\\' OR artists LIKE ? ESCAPE '\\' \
             ORDER BY timestamp DESC LIMIT ? OFFSET ?",
        )
        .bind(&pattern)
        .bind(&pattern)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Counts and successful-track totals grouped by `(download_type,
    /// status)` (spec §4.4 "aggregate stats").
    pub async fn stats(&self) -> Result<Vec<HistoryStats>> {
        let rows = sqlx::query(
            "SELECT download_type, status, COUNT(*) as count, \
             COALESCE(SUM(successful_tracks), 0) as successful_tracks \
             FROM download_history GROUP BY download_type, status",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| HistoryStats {
                download_type: row.get("download_type"),
                status: row.get("status"),
                count: row.get("count"),
                successful_tracks: row.get("successful_tracks"),
            })
            .collect())
    }

    /// Deletes `download_history` rows (and their child tables, if any) older
    /// than `retain_days` days. Returns the number of parent rows removed
    /// (spec SPEC_FULL.md §"Supplemented features" retention/cleanup).
    pub async fn cleanup_older_than(&self, retain_days: i64) -> Result<u64> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(retain_days)).to_rfc3339();

        let stale: Vec<Option<String>> = sqlx::query_scalar(
            "SELECT children_table FROM download_history WHERE timestamp < ? AND children_table IS NOT NULL",
        )
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await?;

        for table in stale.into_iter().flatten() {
            if validate_table_name(&table).is_err() {
                continue;
            }
            if let Err(e) = sqlx::query(&format!("DROP TABLE IF EXISTS {table}")).execute(&self.pool).await {
                warn!(table, error = %e, "non-fatal: failed to drop stale child table");
            }
        }

        let result = sqlx::query("DELETE FROM download_history WHERE timestamp < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub download_type: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HistoryStats {
    pub download_type: String,
    pub status: String,
    pub count: i64,
    pub successful_tracks: i64,
}

/// Child/parent table names are derived internally from a kind prefix plus a
/// filtered task-id slug, never from raw user input, but this guards against
/// ever interpolating anything else into a bare SQL identifier position.
fn validate_table_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.chars().next().map(|c| c.is_ascii_alphabetic()).unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(crate::error::AppError::Configuration(format!(
            "invalid table name: {name}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> HistoryStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = HistoryStore::new(pool);
        store.ensure_schema().await.unwrap();
        store
    }

    fn sample_record(task_id: &str) -> DownloadHistoryWrite {
        DownloadHistoryWrite {
            download_type: "track".to_string(),
            title: "Song".to_string(),
            artists: vec!["Artist".to_string()],
            status: "completed".to_string(),
            service: "spotify".to_string(),
            quality_format: Some("OGG".to_string()),
            quality_bitrate: Some("320".to_string()),
            total_tracks: 1,
            successful_tracks: 1,
            failed_tracks: 0,
            skipped_tracks: 0,
            children_table: None,
            task_id: task_id.to_string(),
            external_ids: serde_json::json!({}),
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn ensure_schema_is_idempotent() {
        let store = memory_store().await;
        store.ensure_schema().await.unwrap();
        store.ensure_schema().await.unwrap();
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips_by_task_id() {
        let store = memory_store().await;
        store.upsert_download_history(&sample_record("t1")).await.unwrap();

        let fetched = store.get_by_task_id("t1").await.unwrap().unwrap();
        assert_eq!(fetched.title, "Song");
        assert_eq!(fetched.status, "completed");
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_task_id() {
        let store = memory_store().await;
        store.upsert_download_history(&sample_record("t1")).await.unwrap();
        let mut second = sample_record("t1");
        second.status = "error".to_string();
        store.upsert_download_history(&second).await.unwrap();

        let fetched = store.get_by_task_id("t1").await.unwrap().unwrap();
        assert_eq!(fetched.status, "error");

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM download_history")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn child_table_round_trips_rows() {
        let store = memory_store().await;
        let table = HistoryStore::child_table_name("album", "abc-123-def");
        store.ensure_child_table(&table).await.unwrap();

        store
            .insert_child_row(
                &table,
                &ChildTrackRow {
                    title: "Track 1".to_string(),
                    artists: Some("Artist".to_string()),
                    album_title: Some("Album".to_string()),
                    duration_ms: Some(210_000),
                    track_number: Some(1),
                    disc_number: Some(1),
                    explicit: false,
                    status: "completed".to_string(),
                    external_ids: None,
                    genres: None,
                    isrc: None,
                    timestamp: chrono::Utc::now(),
                    position: Some(1),
                    metadata: None,
                    service: Some("spotify".to_string()),
                    quality_format: None,
                    quality_bitrate: None,
                },
            )
            .await
            .unwrap();

        let rows = store.list_children(&table).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "Track 1");
    }

    #[tokio::test]
    async fn rejects_malformed_table_names() {
        let store = memory_store().await;
        let err = store.ensure_child_table("album_ok; DROP TABLE x").await.unwrap_err();
        assert!(matches!(err, crate::error::AppError::Configuration(_)));
    }

    #[tokio::test]
    async fn list_filters_by_download_type_and_status() {
        let store = memory_store().await;
        store.upsert_download_history(&sample_record("t1")).await.unwrap();
        let mut failed = sample_record("t2");
        failed.status = "error".to_string();
        store.upsert_download_history(&failed).await.unwrap();

        let filter = HistoryFilter { download_type: None, status: Some("error".to_string()) };
        let rows = store.list_download_history(&filter, 10, 0).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].task_id.as_deref(), Some("t2"));
    }

    #[tokio::test]
    async fn search_matches_title_or_artists() {
        let store = memory_store().await;
        store.upsert_download_history(&sample_record("t1")).await.unwrap();

        let rows = store.search_download_history("son", 10, 0).await.unwrap();
        assert_eq!(rows.len(), 1);

        let rows = store.search_download_history("nomatch", 10, 0).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn stats_groups_by_type_and_status() {
        let store = memory_store().await;
        store.upsert_download_history(&sample_record("t1")).await.unwrap();
        let mut failed = sample_record("t2");
        failed.status = "error".to_string();
        failed.successful_tracks = 0;
        store.upsert_download_history(&failed).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.len(), 2);
        assert!(stats.iter().any(|s| s.status == "completed" && s.count == 1));
        assert!(stats.iter().any(|s| s.status == "error" && s.count == 1));
    }

    #[tokio::test]
    async fn cleanup_removes_stale_rows_and_their_child_tables() {
        let store = memory_store().await;
        let mut old_record = sample_record("old");
        old_record.children_table = Some(HistoryStore::child_table_name("album", "old"));
        store.ensure_child_table(old_record.children_table.as_ref().unwrap()).await.unwrap();
        store.upsert_download_history(&old_record).await.unwrap();

        // Backdate the row past the retention window.
        sqlx::query("UPDATE download_history SET timestamp = ? WHERE task_id = 'old'")
            .bind((chrono::Utc::now() - chrono::Duration::days(400)).to_rfc3339())
            .execute(&store.pool)
            .await
            .unwrap();

        store.upsert_download_history(&sample_record("fresh")).await.unwrap();

        let removed = store.cleanup_older_than(365).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_by_task_id("old").await.unwrap().is_none());
        assert!(store.get_by_task_id("fresh").await.unwrap().is_some());

        let table_exists: Option<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='table' AND name = ?",
        )
        .bind(HistoryStore::child_table_name("album", "old"))
        .fetch_optional(&store.pool)
        .await
        .unwrap();
        assert!(table_exists.is_none());
    }
}
