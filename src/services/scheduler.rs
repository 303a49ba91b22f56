//! SQM: accepts submissions, deduplicates by fingerprint, assigns ids,
//! writes initial state into TSS, and dispatches onto one of the two named
//! worker pools (spec §2 SQM, §4.1, §4.3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{Task, TaskDisplay, TaskKind, TaskParameters, TaskState};
use crate::services::task_state_store::TaskStateStore;

/// The two named worker pools jobs are dispatched onto (spec §2 SQM).
/// Artist submissions never occupy a pool slot themselves (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerPool {
    Downloads,
    Utility,
}

impl WorkerPool {
    fn for_kind(kind: TaskKind) -> Self {
        match kind {
            TaskKind::Track | TaskKind::Album | TaskKind::Playlist => WorkerPool::Downloads,
            TaskKind::Artist => WorkerPool::Utility,
        }
    }
}

/// One dispatched unit of work, handed to whichever worker picks it off a
/// pool's channel.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub task: Task,
}

/// Strip query parameters and a trailing slash so the same logical resource
/// always fingerprints identically regardless of how the client phrased the
/// URL (spec §3 Fingerprint, §4.1 step 1).
pub fn canonicalize_source_url(raw: &str) -> String {
    let without_query = raw.split('?').next().unwrap_or(raw);
    without_query.trim_end_matches('/').to_lowercase()
}

pub fn fingerprint(kind: TaskKind, source_url: &str) -> String {
    format!("{}:{}", kind.as_str(), canonicalize_source_url(source_url))
}

pub struct Scheduler {
    tss: TaskStateStore,
    pools: HashMap<WorkerPool, mpsc::UnboundedSender<Dispatch>>,
    paused: AtomicBool,
    max_retries: u32,
}

/// Parameters for a fresh submission (spec §4.1).
pub struct SubmitRequest {
    pub kind: TaskKind,
    pub source_url: String,
    pub display: TaskDisplay,
    pub parameters: TaskParameters,
    pub original_request: serde_json::Value,
    pub submitter: Option<String>,
    pub from_watch: bool,
}

impl Scheduler {
    pub fn new(
        tss: TaskStateStore,
        pools: HashMap<WorkerPool, mpsc::UnboundedSender<Dispatch>>,
        max_retries: u32,
    ) -> Self {
        Self {
            tss,
            pools,
            paused: AtomicBool::new(false),
            max_retries,
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Accept a new submission. Computes the fingerprint, checks for a live
    /// duplicate, assigns an id, writes `task:{id}:info`, appends the initial
    /// `QUEUED` status, and dispatches to the appropriate pool (spec §4.1).
    pub async fn submit(&self, request: SubmitRequest) -> Result<String> {
        let fp = fingerprint(request.kind, &request.source_url);
        if let Some(existing_id) = self.find_live_duplicate(&fp).await? {
            return Err(AppError::DuplicateDownload {
                existing_task_id: existing_id,
            });
        }

        let task_id = Uuid::new_v4().to_string();
        let task = Task {
            task_id: task_id.clone(),
            kind: request.kind,
            source_url: request.source_url,
            display: request.display,
            parameters: request.parameters,
            original_request: request.original_request,
            retry_of: None,
            retry_count: 0,
            created_at: Utc::now(),
            submitter: request.submitter,
            children_table: None,
            from_watch: request.from_watch,
        };

        self.tss.put_task_info(&task).await?;

        let queue_position = self.tss.all_task_ids().await?.len();
        self.tss
            .append_status(
                &task_id,
                TaskState::Queued,
                serde_json::json!({ "queue_position": queue_position }),
            )
            .await?;

        if task.kind.enqueues_worker_job() {
            self.dispatch(&task)?;
        }

        info!(task_id, kind = task.kind.as_str(), "submitted task");
        Ok(task_id)
    }

    fn dispatch(&self, task: &Task) -> Result<()> {
        if self.is_paused() {
            // Spec §4.3 Pause/Resume: queued while paused, no worker picks it
            // up until resume. The task already sits in TSS as QUEUED; there
            // is nothing further to do until `resume` replays the backlog.
            return Ok(());
        }
        let pool = WorkerPool::for_kind(task.kind);
        let sender = self
            .pools
            .get(&pool)
            .ok_or_else(|| AppError::Configuration(format!("no worker pool registered for {pool:?}")))?;
        sender
            .send(Dispatch { task: task.clone() })
            .map_err(|e| AppError::Other(anyhow::anyhow!("worker pool channel closed: {e}")))
    }

    /// Re-submit a failed task's work under a fresh task id linked via
    /// `retry_of`. Only tasks whose last recorded status is `ERROR` are
    /// eligible; a cancelled task must be resubmitted as a new job instead
    /// (spec §4.1 Retry).
    pub async fn retry(&self, task_id: &str) -> Result<String> {
        let original = self
            .tss
            .get_task_info(task_id)
            .await?
            .ok_or_else(|| AppError::TaskNotFound(task_id.to_string()))?;

        let latest = self.tss.latest_status(task_id).await?;
        let is_retryable = matches!(latest.map(|s| s.status), Some(TaskState::Error));
        if !is_retryable {
            return Err(AppError::RetryNotAllowed {
                task_id: task_id.to_string(),
                reason: "the last recorded status is not ERROR".to_string(),
            });
        }
        if original.retry_count >= self.max_retries {
            return Err(AppError::RetryNotAllowed {
                task_id: task_id.to_string(),
                reason: format!("retry_count {} has reached max_retries {}", original.retry_count, self.max_retries),
            });
        }

        let new_id = Uuid::new_v4().to_string();
        let retried = Task {
            task_id: new_id.clone(),
            retry_of: Some(task_id.to_string()),
            retry_count: original.retry_count + 1,
            created_at: Utc::now(),
            children_table: None,
            ..original
        };

        self.tss.put_task_info(&retried).await?;
        let queue_position = self.tss.all_task_ids().await?.len();
        self.tss
            .append_status(
                &new_id,
                TaskState::Queued,
                serde_json::json!({ "queue_position": queue_position, "retry_of": task_id }),
            )
            .await?;

        if retried.kind.enqueues_worker_job() {
            self.dispatch(&retried)?;
        }

        Ok(new_id)
    }

    /// Appends CANCELLED; safe to call on an unknown id (spec §4.3 Cancel).
    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        if self.tss.get_task_info(task_id).await?.is_none() {
            return Ok(());
        }
        let latest = self.tss.latest_status(task_id).await?;
        if latest.map(|s| s.status.is_terminal()).unwrap_or(false) {
            return Ok(());
        }
        self.tss
            .append_status(task_id, TaskState::Cancelled, serde_json::json!({}))
            .await?;
        Ok(())
    }

    /// Enumerates every task id with its kind, display, latest status, and
    /// timestamp (spec §4.3 List).
    pub async fn list(&self) -> Result<Vec<(String, TaskKind, TaskDisplay, Option<TaskState>, Option<chrono::DateTime<Utc>>)>> {
        let mut out = Vec::new();
        for task_id in self.tss.all_task_ids().await? {
            let Some(task) = self.tss.get_task_info(&task_id).await? else {
                continue;
            };
            let latest = self.tss.latest_status(&task_id).await?;
            out.push((
                task_id,
                task.kind,
                task.display,
                latest.as_ref().map(|s| s.status),
                latest.as_ref().map(|s| s.timestamp),
            ));
        }
        Ok(out)
    }

    /// Per-pool count of tasks currently sitting at `QUEUED`, grounded in the
    /// teacher's `get_queue_depths` (US-022).
    pub async fn queue_depths(&self) -> Result<HashMap<WorkerPool, u64>> {
        let mut depths = HashMap::new();
        depths.insert(WorkerPool::Downloads, 0);
        depths.insert(WorkerPool::Utility, 0);
        for task_id in self.tss.all_task_ids().await? {
            let Some(task) = self.tss.get_task_info(&task_id).await? else {
                continue;
            };
            let latest = self.tss.latest_status(&task_id).await?;
            if matches!(latest.map(|s| s.status), Some(TaskState::Queued)) {
                *depths.entry(WorkerPool::for_kind(task.kind)).or_insert(0) += 1;
            }
        }
        Ok(depths)
    }

    async fn find_live_duplicate(&self, fp: &str) -> Result<Option<String>> {
        for task_id in self.tss.all_task_ids().await? {
            let Some(task) = self.tss.get_task_info(&task_id).await? else {
                continue;
            };
            if fingerprint(task.kind, &task.source_url) != fp {
                continue;
            }
            let latest = self.tss.latest_status(&task_id).await?;
            let is_terminal = latest.map(|s| s.status.is_terminal()).unwrap_or(false);
            if !is_terminal {
                return Ok(Some(task_id));
            }
        }
        Ok(None)
    }
}

pub fn new_pool_channel() -> (mpsc::UnboundedSender<Dispatch>, mpsc::UnboundedReceiver<Dispatch>) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::task_state_store::fake::InMemoryStore;

    fn params() -> TaskParameters {
        TaskParameters {
            service: "spotify".to_string(),
            fallback: false,
            spotify_quality: "NORMAL".to_string(),
            deezer_quality: "NORMAL".to_string(),
            real_time: false,
            convert_to: None,
            bitrate: None,
            custom_dir_format: "%artist%".to_string(),
            custom_track_format: "%title%".to_string(),
            tracknum_padding: true,
            pad_number_width: 2,
        }
    }

    fn request(kind: TaskKind, url: &str) -> SubmitRequest {
        SubmitRequest {
            kind,
            source_url: url.to_string(),
            display: TaskDisplay {
                name: "Song".to_string(),
                artist: None,
            },
            parameters: params(),
            original_request: serde_json::json!({}),
            submitter: None,
            from_watch: false,
        }
    }

    fn scheduler_with_downloads_pool() -> (Scheduler, mpsc::UnboundedReceiver<Dispatch>) {
        let tss = TaskStateStore::new(Arc::new(InMemoryStore::new()));
        let (tx, rx) = new_pool_channel();
        let mut pools = HashMap::new();
        pools.insert(WorkerPool::Downloads, tx);
        pools.insert(WorkerPool::Utility, new_pool_channel().0);
        (Scheduler::new(tss, pools, 3), rx)
    }

    #[tokio::test]
    async fn canonicalize_strips_query_and_trailing_slash() {
        assert_eq!(
            canonicalize_source_url("https://open.spotify.com/track/abc?si=xyz"),
            "https://open.spotify.com/track/abc"
        );
        assert_eq!(
            canonicalize_source_url("https://open.spotify.com/track/abc/"),
            "https://open.spotify.com/track/abc"
        );
    }

    #[tokio::test]
    async fn duplicate_submission_of_a_live_task_is_rejected() {
        let (scheduler, _rx) = scheduler_with_downloads_pool();
        let url = "https://open.spotify.com/track/abc";
        let first = scheduler.submit(request(TaskKind::Track, url)).await.unwrap();

        let err = scheduler
            .submit(request(TaskKind::Track, &format!("{url}?si=zzz")))
            .await
            .unwrap_err();
        match err {
            AppError::DuplicateDownload { existing_task_id } => assert_eq!(existing_task_id, first),
            other => panic!("expected DuplicateDownload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn submitting_after_cancellation_creates_a_new_task() {
        let (scheduler, _rx) = scheduler_with_downloads_pool();
        let url = "https://open.spotify.com/track/abc";
        let first = scheduler.submit(request(TaskKind::Track, url)).await.unwrap();
        scheduler.cancel(&first).await.unwrap();

        let second = scheduler.submit(request(TaskKind::Track, url)).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn artist_submission_never_dispatches_to_a_pool() {
        let (scheduler, mut rx) = scheduler_with_downloads_pool();
        scheduler
            .submit(request(TaskKind::Artist, "https://open.spotify.com/artist/abc"))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn pausing_prevents_dispatch_but_still_queues_in_tss() {
        let (scheduler, mut rx) = scheduler_with_downloads_pool();
        scheduler.pause();
        let task_id = scheduler
            .submit(request(TaskKind::Track, "https://open.spotify.com/track/abc"))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
        let latest = scheduler.tss.latest_status(&task_id).await.unwrap().unwrap();
        assert_eq!(latest.status, TaskState::Queued);
    }

    #[tokio::test]
    async fn cancel_is_a_no_op_for_unknown_ids() {
        let (scheduler, _rx) = scheduler_with_downloads_pool();
        scheduler.cancel("does-not-exist").await.unwrap();
    }

    #[tokio::test]
    async fn retry_requires_the_last_status_to_be_error() {
        let (scheduler, _rx) = scheduler_with_downloads_pool();
        let task_id = scheduler
            .submit(request(TaskKind::Track, "https://open.spotify.com/track/abc"))
            .await
            .unwrap();

        let err = scheduler.retry(&task_id).await.unwrap_err();
        assert!(matches!(err, AppError::RetryNotAllowed { .. }));

        // Cancellation does not make a task retryable; it must be resubmitted.
        scheduler.cancel(&task_id).await.unwrap();
        let err = scheduler.retry(&task_id).await.unwrap_err();
        assert!(matches!(err, AppError::RetryNotAllowed { .. }));

        scheduler
            .tss
            .append_status(&task_id, TaskState::Error, serde_json::json!({ "message": "boom" }))
            .await
            .unwrap();
        let retried_id = scheduler.retry(&task_id).await.unwrap();
        assert_ne!(retried_id, task_id);

        let retried_task = scheduler.tss.get_task_info(&retried_id).await.unwrap().unwrap();
        assert_eq!(retried_task.retry_of, Some(task_id));
        assert_eq!(retried_task.retry_count, 1);
    }

    #[tokio::test]
    async fn retry_is_refused_once_max_retries_is_reached() {
        let tss = TaskStateStore::new(Arc::new(InMemoryStore::new()));
        let (tx, _rx) = new_pool_channel();
        let mut pools = HashMap::new();
        pools.insert(WorkerPool::Downloads, tx);
        pools.insert(WorkerPool::Utility, new_pool_channel().0);
        let scheduler = Scheduler::new(tss, pools, 1);

        let task_id = scheduler
            .submit(request(TaskKind::Track, "https://open.spotify.com/track/abc"))
            .await
            .unwrap();
        scheduler
            .tss
            .append_status(&task_id, TaskState::Error, serde_json::json!({}))
            .await
            .unwrap();
        let retried_id = scheduler.retry(&task_id).await.unwrap();

        scheduler
            .tss
            .append_status(&retried_id, TaskState::Error, serde_json::json!({}))
            .await
            .unwrap();
        let err = scheduler.retry(&retried_id).await.unwrap_err();
        assert!(matches!(err, AppError::RetryNotAllowed { .. }));
    }

    #[tokio::test]
    async fn queue_depths_counts_queued_tasks_per_pool() {
        let (scheduler, _rx) = scheduler_with_downloads_pool();
        scheduler.submit(request(TaskKind::Track, "https://open.spotify.com/track/abc")).await.unwrap();
        scheduler.submit(request(TaskKind::Album, "https://open.spotify.com/album/def")).await.unwrap();
        scheduler.submit(request(TaskKind::Artist, "https://open.spotify.com/artist/ghi")).await.unwrap();

        let depths = scheduler.queue_depths().await.unwrap();
        assert_eq!(depths[&WorkerPool::Downloads], 2);
        assert_eq!(depths[&WorkerPool::Utility], 1);
    }
}
