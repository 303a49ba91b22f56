//! TSS: key-value + list + pub/sub coordination store holding per-task state
//! (spec §2 TSS, §4.5, §5). Single source of truth for live task state,
//! shared by SQM, WR, and any SSE-style consumer subscribed to a task's
//! update channel.
//!
//! Key layout (spec §5):
//! - `task:{id}:info` — JSON task description, TTL 7 days, single writer (SQM).
//! - `task:{id}:status` — append-only list of JSON `TaskStatus` entries.
//! - `task:{id}:status:next_id` — monotonic per-task counter.
//! - `task_updates:{id}` — pub/sub channel carrying `{task_id, status_id}`.

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::models::{Task, TaskStatus};

const TASK_INFO_TTL_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Storage operations TSS needs from its backing store. Implemented against
/// Redis in production (string/list/pub-sub commands) and an in-memory fake
/// in tests, mirroring the split used by [`crate::services::rate_limiter`].
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn set_with_ttl(&self, key: &str, value: String, ttl_seconds: u64) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
    async fn incr(&self, key: &str) -> Result<i64>;
    async fn list_push(&self, key: &str, value: String) -> Result<()>;
    async fn list_all(&self, key: &str) -> Result<Vec<String>>;
    async fn list_last(&self, key: &str) -> Result<Option<String>>;
    async fn publish(&self, channel: &str, message: String) -> Result<()>;
    async fn delete(&self, keys: &[String]) -> Result<()>;
}

#[derive(Clone)]
pub struct TaskStateStore {
    store: std::sync::Arc<dyn CoordinationStore>,
}

impl TaskStateStore {
    pub fn new(store: std::sync::Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    fn info_key(task_id: &str) -> String {
        format!("task:{task_id}:info")
    }

    fn status_key(task_id: &str) -> String {
        format!("task:{task_id}:status")
    }

    fn next_id_key(task_id: &str) -> String {
        format!("task:{task_id}:status:next_id")
    }

    fn updates_channel(task_id: &str) -> String {
        format!("task_updates:{task_id}")
    }

    /// Persist a task description with the spec's 7-day TTL (spec §4.1 step 4).
    pub async fn put_task_info(&self, task: &Task) -> Result<()> {
        let json = serde_json::to_string(task)?;
        self.store
            .set_with_ttl(&Self::info_key(&task.task_id), json, TASK_INFO_TTL_SECONDS)
            .await
    }

    pub async fn get_task_info(&self, task_id: &str) -> Result<Option<Task>> {
        match self.store.get(&Self::info_key(task_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Every live task-info key, for SQM.list (spec §4.3 List).
    pub async fn all_task_ids(&self) -> Result<Vec<String>> {
        let prefix = "task:";
        let keys = self.store.keys_with_prefix(prefix).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| {
                let rest = k.strip_prefix("task:")?;
                rest.strip_suffix(":info").map(|id| id.to_string())
            })
            .collect())
    }

    /// Append a status entry with a freshly allocated, strictly-increasing
    /// `status_id` (spec §4.6, §8: "dense and strictly increasing within a
    /// task"), then notify subscribers on its update channel.
    pub async fn append_status(
        &self,
        task_id: &str,
        status: crate::models::TaskState,
        payload: serde_json::Value,
    ) -> Result<TaskStatus> {
        let next_id = self.store.incr(&Self::next_id_key(task_id)).await?;
        let entry = TaskStatus::new(next_id as u64, status, payload);
        let json = serde_json::to_string(&entry)?;
        self.store.list_push(&Self::status_key(task_id), json).await?;

        let notification = serde_json::json!({
            "task_id": task_id,
            "status_id": entry.status_id,
        });
        self.store
            .publish(&Self::updates_channel(task_id), notification.to_string())
            .await?;
        debug!(task_id, status_id = entry.status_id, "appended task status");
        Ok(entry)
    }

    pub async fn latest_status(&self, task_id: &str) -> Result<Option<TaskStatus>> {
        match self.store.list_last(&Self::status_key(task_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn full_status_log(&self, task_id: &str) -> Result<Vec<TaskStatus>> {
        let raws = self.store.list_all(&Self::status_key(task_id)).await?;
        raws.into_iter()
            .map(|raw| serde_json::from_str(&raw).map_err(Into::into))
            .collect()
    }

    /// Remove every key for a task. Used when HS has durably absorbed a
    /// terminal task and TSS no longer needs to hold it (an optimization over
    /// waiting out the 7-day TTL; never required for correctness).
    pub async fn purge(&self, task_id: &str) -> Result<()> {
        self.store
            .delete(&[
                Self::info_key(task_id),
                Self::status_key(task_id),
                Self::next_id_key(task_id),
            ])
            .await
    }
}

/// Production backend: Redis strings/lists/pub-sub via a `deadpool-redis`
/// pool. Key enumeration uses `SCAN` rather than `KEYS`, following the
/// teacher's `cleanup_jobs` (`src/services/job_queue.rs`), so a large task
/// population never blocks the server with a single `O(n)` command.
pub struct RedisCoordinationStore {
    pool: deadpool_redis::Pool,
    scan_batch_size: usize,
}

impl RedisCoordinationStore {
    pub fn new(pool: deadpool_redis::Pool) -> Self {
        Self {
            pool,
            scan_batch_size: 200,
        }
    }
}

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
    async fn set_with_ttl(&self, key: &str, value: String, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.pool.get().await?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.pool.get().await?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut found = Vec::new();
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(self.scan_batch_size)
                .query_async(&mut conn)
                .await?;
            found.extend(keys);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(found)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.pool.get().await?;
        let value: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn list_push(&self, key: &str, value: String) -> Result<()> {
        let mut conn = self.pool.get().await?;
        redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn list_all(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let values: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn list_last(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.pool.get().await?;
        let values: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(-1)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(values.into_iter().next())
    }

    async fn publish(&self, channel: &str, message: String) -> Result<()> {
        let mut conn = self.pool.get().await?;
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get().await?;
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}
