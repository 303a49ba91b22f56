//! WR: runs one dispatched job end-to-end, translating fetch-library events
//! into TSS status appends and, on a terminal transition, into HS rows (spec
//! §2 WR, §4.2, §4.6). Grounded in the teacher's worker loop over a job
//! channel (`execute_job` in `src/services/job_queue.rs`), adapted from a
//! generic `JobHandler` dispatch to this service's fixed download pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::DownloadConfig;
use crate::error::{AppError, Result};
use crate::models::{ChildTrackRow, ChildTrackStatus, DownloadHistoryWrite, FetchEvent, Task, TaskKind, TaskState};
use crate::services::external::{CredentialResolver, FetchClient, ServiceAccount};
use crate::services::history_store::HistoryStore;
use crate::services::progress::ProgressNormalizer;
use crate::services::scheduler::{Dispatch, WorkerPool};
use crate::services::task_state_store::TaskStateStore;

/// Running counters kept across the attempt(s) for a single job, used to
/// synthesize a parent history row when the fetch library's final summary
/// doesn't carry one (spec §4.6 "done ... for an album/playlist parent").
#[derive(Debug, Default, Clone)]
struct JobCounters {
    total_tracks: i64,
    successful_tracks: i64,
    failed_tracks: i64,
    skipped_tracks: i64,
    /// Running count of `downloading` events observed this job, used to
    /// compute the parent `overall_progress` rollup for an album/playlist
    /// (spec §4.6: "on downloading, increment current_track_num ... for an
    /// album/playlist parent with total_tracks>0, compute overall_progress").
    current_track_num: i64,
}

/// Drives one worker pool's channel, running jobs with bounded concurrency
/// via a semaphore (spec §5: `downloads` pool concurrency = `maxConcurrentDownloads`,
/// `utility` pool fixed ≈3).
pub struct WorkerPoolRunner {
    pool: WorkerPool,
    tss: TaskStateStore,
    history: Arc<HistoryStore>,
    fetch_client: Arc<dyn FetchClient>,
    credential_resolver: Arc<dyn CredentialResolver>,
    download_config: DownloadConfig,
    concurrency: Arc<tokio::sync::Semaphore>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPoolRunner {
    pub fn new(
        pool: WorkerPool,
        tss: TaskStateStore,
        history: Arc<HistoryStore>,
        fetch_client: Arc<dyn FetchClient>,
        credential_resolver: Arc<dyn CredentialResolver>,
        download_config: DownloadConfig,
        concurrency: usize,
    ) -> Self {
        Self {
            pool,
            tss,
            history,
            fetch_client,
            credential_resolver,
            download_config,
            concurrency: Arc::new(tokio::sync::Semaphore::new(concurrency.max(1))),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Drains `rx` until the channel closes or shutdown is requested,
    /// spawning one task per dispatched job (spec §4.2 "isolation": each job
    /// runs in its own execution context so cancelling one never touches its
    /// siblings).
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Dispatch>) {
        let mut in_flight = Vec::new();
        while let Some(Dispatch { task }) = rx.recv().await {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let runner = self.clone();
            let permit = match runner.concurrency.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            in_flight.push(tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = runner.run_job(task.clone()).await {
                    error!(task_id = task.task_id, pool = ?runner.pool, error = %e, "job execution failed");
                }
            }));
        }
        // The channel only closes on process shutdown; wait for whatever was
        // already dispatched to finish instead of dropping it mid-flight.
        for handle in in_flight {
            let _ = handle.await;
        }
    }

    async fn run_job(&self, task: Task) -> Result<()> {
        // Best-effort cancellation observed before start (spec §7
        // CancellationRequested: "if observed before the worker starts, the
        // job is skipped with an interrupted entry").
        if let Some(latest) = self.tss.latest_status(&task.task_id).await? {
            if latest.status == TaskState::Cancelled {
                info!(task_id = task.task_id, "job skipped, cancellation observed before start");
                return Ok(());
            }
        }

        self.tss
            .append_status(&task.task_id, TaskState::Processing, serde_json::json!({}))
            .await?;

        let accounts = self.credential_resolver.resolve(&task.parameters).await?;

        let children_table = if matches!(task.kind, TaskKind::Album | TaskKind::Playlist) {
            let table_name = HistoryStore::child_table_name(task.kind.as_str(), &task.task_id);
            self.history.ensure_child_table(&table_name).await?;
            let mut with_table = task.clone();
            with_table.children_table = Some(table_name.clone());
            self.tss.put_task_info(&with_table).await?;
            Some(table_name)
        } else {
            None
        };

        let mut last_err: Option<AppError> = None;
        for account in accounts {
            match self.attempt(&task, account, children_table.as_deref()).await {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }

        let err = last_err.unwrap_or_else(|| AppError::FetchError {
            message: "no credential account available".to_string(),
            can_retry: false,
        });
        self.record_failure(&task, &err).await?;
        Ok(())
    }

    /// Runs the fetch library once under a single account, bridging its
    /// synchronous progress callback into normalized TSS/HS writes. Events
    /// are captured via an unbounded channel the closure pushes into
    /// synchronously; since the fake (and any real binding compatible with
    /// this trait) invokes the callback inline during the `.await`, draining
    /// the channel after the future resolves delivers them in order without
    /// needing a concurrently-polled stream.
    async fn attempt(&self, task: &Task, account: ServiceAccount, children_table: Option<&str>) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<FetchEvent>();
        let on_event: Box<dyn Fn(FetchEvent) + Send + Sync> = Box::new(move |event| {
            let _ = tx.send(event);
        });

        let quality = account.quality_in(&task.parameters).to_string();
        let outcome = self
            .fetch_client
            .run(task.kind, &task.source_url, account, &task.parameters, on_event)
            .await?;

        let mut normalizer = ProgressNormalizer::new();
        let mut counters = JobCounters::default();
        let mut final_summary: Option<serde_json::Value> = None;

        while let Ok(event) = rx.try_recv() {
            self.apply_event(task, children_table, &mut normalizer, &mut counters, event).await?;
        }

        // Re-check for a concurrent cancellation before committing the
        // terminal event; a CANCELLED append already present wins (spec §5:
        // "the next append from the progress callback will be ignored
        // because it transitions from a terminal state").
        if let Some(latest) = self.tss.latest_status(&task.task_id).await? {
            if latest.status == TaskState::Cancelled {
                return Ok(());
            }
        }

        if let FetchEvent::Done { summary, .. } = &outcome {
            final_summary = summary.clone();
        }
        // The callback stream may already have carried this exact terminal
        // event (a backing implementation that forwards everything to
        // on_event); only append it again if normalization hasn't already
        // reached a terminal state from the drained events.
        if !normalizer.is_terminal() {
            self.apply_event(task, children_table, &mut normalizer, &mut counters, outcome.clone()).await?;
        }

        match outcome {
            FetchEvent::Error { message } => Err(AppError::FetchError {
                message,
                can_retry: task.retry_count < self.download_config.max_retries,
            }),
            // `run()` returning is, by contract, the end of this job; any
            // `Done` it hands back is the terminal event regardless of
            // whether it happens to carry a per-track or a parent summary.
            FetchEvent::Done { .. } => {
                self.finalize_history(task, children_table, &counters, final_summary, &quality)
                    .await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn apply_event(
        &self,
        task: &Task,
        children_table: Option<&str>,
        normalizer: &mut ProgressNormalizer,
        counters: &mut JobCounters,
        event: FetchEvent,
    ) -> Result<()> {
        match &event {
            FetchEvent::Initializing { total_tracks, .. } => {
                if let Some(total) = total_tracks {
                    counters.total_tracks = *total as i64;
                }
            }
            FetchEvent::Downloading { .. } => counters.current_track_num += 1,
            FetchEvent::Skipped { .. } => counters.skipped_tracks += 1,
            FetchEvent::Error { .. } => counters.failed_tracks += 1,
            FetchEvent::Done { track, summary, .. } if track.is_some() && summary.is_none() => {
                counters.successful_tracks += 1;
                if let (Some(table), Some(track_value)) = (children_table, track) {
                    self.write_child_row(table, track_value, counters.successful_tracks).await?;
                }
            }
            _ => {}
        }

        let (state, mut payload) = normalizer.normalize(event)?;
        // Parent-scoped progress rollup for album/playlist parents (spec
        // §4.6); folded into the same entry rather than a second append, so
        // no state transition ever produces two status rows.
        if state == TaskState::Downloading && children_table.is_some() && counters.total_tracks > 0 {
            if let Some(obj) = payload.as_object_mut() {
                obj.insert(
                    "overall_progress".to_string(),
                    serde_json::json!(crate::models::progress::overall_progress(
                        counters.current_track_num as u32,
                        counters.total_tracks as u32,
                    )),
                );
            }
        }
        self.tss.append_status(&task.task_id, state, payload).await?;
        Ok(())
    }

    async fn write_child_row(&self, table: &str, track_value: &serde_json::Value, position: i64) -> Result<()> {
        let row = ChildTrackRow {
            title: track_value.get("title").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            artists: track_value.get("artists").and_then(|v| v.as_str()).map(str::to_string),
            album_title: track_value.get("album").and_then(|v| v.as_str()).map(str::to_string),
            duration_ms: track_value.get("duration_ms").and_then(|v| v.as_i64()),
            track_number: track_value.get("track_number").and_then(|v| v.as_i64()),
            disc_number: track_value.get("disc_number").and_then(|v| v.as_i64()),
            explicit: track_value.get("explicit").and_then(|v| v.as_bool()).unwrap_or(false),
            status: ChildTrackStatus::Completed.as_str().to_string(),
            external_ids: track_value.get("external_ids").map(|v| v.to_string()),
            genres: track_value.get("genres").map(|v| v.to_string()),
            isrc: track_value.get("isrc").and_then(|v| v.as_str()).map(str::to_string),
            timestamp: chrono::Utc::now(),
            position: Some(position),
            metadata: None,
            service: None,
            quality_format: None,
            quality_bitrate: None,
        };
        self.history.insert_child_row(table, &row).await
    }

    async fn finalize_history(
        &self,
        task: &Task,
        children_table: Option<&str>,
        counters: &JobCounters,
        summary: Option<serde_json::Value>,
        quality: &str,
    ) -> Result<()> {
        let (successful, failed, skipped, total) = match &summary {
            Some(s) => (
                s.get("successful_tracks").and_then(|v| v.as_i64()).unwrap_or(counters.successful_tracks),
                s.get("failed_tracks").and_then(|v| v.as_i64()).unwrap_or(counters.failed_tracks),
                s.get("skipped_tracks").and_then(|v| v.as_i64()).unwrap_or(counters.skipped_tracks),
                s.get("total_tracks").and_then(|v| v.as_i64()).unwrap_or(counters.total_tracks),
            ),
            None => (counters.successful_tracks, counters.failed_tracks, counters.skipped_tracks, counters.total_tracks),
        };

        let record = DownloadHistoryWrite {
            download_type: task.kind.as_str().to_string(),
            title: task.display.name.clone(),
            artists: task.display.artist.clone().map(|a| vec![a]).unwrap_or_default(),
            status: "completed".to_string(),
            service: task.parameters.service.clone(),
            quality_format: Some(quality.to_string()),
            quality_bitrate: task.parameters.bitrate.clone(),
            total_tracks: total.max(if children_table.is_some() { 0 } else { 1 }),
            successful_tracks: successful,
            failed_tracks: failed,
            skipped_tracks: skipped,
            children_table: children_table.map(str::to_string),
            task_id: task.task_id.clone(),
            external_ids: serde_json::json!({}),
            metadata: serde_json::json!({ "source_url": task.source_url }),
        };
        self.history.upsert_download_history(&record).await?;
        Ok(())
    }

    async fn record_failure(&self, task: &Task, err: &AppError) -> Result<()> {
        warn!(task_id = task.task_id, error = %err, "job failed");
        let can_retry = task.retry_count < self.download_config.max_retries;
        self.tss
            .append_status(
                &task.task_id,
                TaskState::Error,
                serde_json::json!({
                    "error": err.to_string(),
                    "can_retry": can_retry,
                    "retry_count": task.retry_count,
                    "max_retries": self.download_config.max_retries,
                }),
            )
            .await?;
        Ok(())
    }
}
