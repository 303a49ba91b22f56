//! Artist fan-out: the controller-level reaction to an `artist` submission
//! (spec §4.7). An artist task never occupies a worker slot
//! ([`crate::models::TaskKind::enqueues_worker_job`]); instead this module
//! walks the full discography via MP/RL and submits one `album` task per
//! matching album, then closes out the artist task's own status log.
//!
//! Distinct from [`crate::services::watch_engine::WatchEngine`]'s artist
//! reconciliation: that runs one page per tick, forever, against a *watched*
//! artist's persisted cursor; this runs once, to completion, in reaction to a
//! single user submission, and has no cursor to persist.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{resolve_task_parameters, DownloadConfig};
use crate::error::{AppError, Result};
use crate::models::{Task, TaskDisplay, TaskKind, TaskState};
use crate::services::metadata_provider::{MetadataProvider, MAX_PAGE_LIMIT};
use crate::services::scheduler::{Scheduler, SubmitRequest};
use crate::services::task_state_store::TaskStateStore;

/// An album that matched the configured `album_group` filter but was already
/// queued under a different task id.
#[derive(Debug, Clone)]
pub struct DuplicateAlbum {
    pub album_id: String,
    pub existing_task_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct ArtistFanoutResult {
    pub queued_task_ids: Vec<String>,
    pub duplicates: Vec<DuplicateAlbum>,
}

pub struct ArtistFanout {
    metadata: Arc<MetadataProvider>,
    scheduler: Arc<Scheduler>,
    tss: TaskStateStore,
    download_config: DownloadConfig,
    album_groups: Vec<String>,
}

impl ArtistFanout {
    pub fn new(
        metadata: Arc<MetadataProvider>,
        scheduler: Arc<Scheduler>,
        tss: TaskStateStore,
        download_config: DownloadConfig,
        album_groups: Vec<String>,
    ) -> Self {
        Self {
            metadata,
            scheduler,
            tss,
            download_config,
            album_groups,
        }
    }

    /// Runs the fan-out for one artist task to completion, appending
    /// `PROCESSING` before the scan and `COMPLETE` with a summary afterward
    /// (spec §4.7).
    pub async fn run(&self, task: &Task) -> Result<ArtistFanoutResult> {
        if task.kind != TaskKind::Artist {
            return Err(AppError::Configuration(format!(
                "artist fan-out invoked for non-artist task {} ({:?})",
                task.task_id, task.kind
            )));
        }

        let artist_id = spotify_id_from_url(&task.source_url);
        self.tss.append_status(&task.task_id, TaskState::Processing, serde_json::json!({})).await?;

        let mut result = ArtistFanoutResult::default();
        let mut offset = 0u32;
        loop {
            let page = self
                .metadata
                .get_artist_discography(&artist_id, offset, MAX_PAGE_LIMIT, &self.album_groups)
                .await?;

            for album in &page.items {
                if !self.album_groups.contains(&album.album_group) {
                    continue;
                }
                let params = resolve_task_parameters(&self.download_config, &HashMap::new());
                let submitted = self
                    .scheduler
                    .submit(SubmitRequest {
                        kind: TaskKind::Album,
                        source_url: format!("https://open.spotify.com/album/{}", album.id),
                        display: TaskDisplay { name: album.name.clone(), artist: album.artists.first().cloned() },
                        parameters: params,
                        original_request: serde_json::json!({ "artist_task_id": task.task_id }),
                        submitter: task.submitter.clone(),
                        from_watch: false,
                    })
                    .await;
                match submitted {
                    Ok(queued_id) => result.queued_task_ids.push(queued_id),
                    Err(AppError::DuplicateDownload { existing_task_id }) => {
                        result.duplicates.push(DuplicateAlbum { album_id: album.id.clone(), existing_task_id })
                    }
                    Err(e) => return Err(e),
                }
            }

            offset += page.items.len() as u32;
            if !page.has_more() {
                break;
            }
        }

        self.tss
            .append_status(
                &task.task_id,
                TaskState::Complete,
                serde_json::json!({
                    "queued_task_ids": result.queued_task_ids,
                    "duplicate_count": result.duplicates.len(),
                }),
            )
            .await?;

        Ok(result)
    }
}

fn spotify_id_from_url(source_url: &str) -> String {
    source_url.split('?').next().unwrap_or(source_url).trim_end_matches('/').rsplit('/').next().unwrap_or("").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskParameters;
    use crate::services::metadata_provider::fake::FakeCatalogClient;
    use crate::services::metadata_provider::ArtistAlbumItem;
    use crate::services::rate_limiter::{fake::InMemoryBackend, RateLimiter, RateLimiterConfig};
    use crate::services::scheduler::{new_pool_channel, WorkerPool};
    use crate::services::task_state_store::fake::InMemoryStore;
    use chrono::Utc;
    use std::collections::HashMap as Map;

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

    fn artist_task(task_id: &str) -> Task {
        Task {
            task_id: task_id.to_string(),
            kind: TaskKind::Artist,
            source_url: "https://open.spotify.com/artist/a1".to_string(),
            display: TaskDisplay { name: "Artist".to_string(), artist: None },
            parameters: params(),
            original_request: serde_json::json!({}),
            retry_of: None,
            retry_count: 0,
            created_at: Utc::now(),
            submitter: None,
            children_table: None,
            from_watch: false,
        }
    }

    fn fanout(catalog: Arc<FakeCatalogClient>, album_groups: Vec<String>) -> (ArtistFanout, TaskStateStore) {
        let tss = TaskStateStore::new(Arc::new(InMemoryStore::new()));
        let mut pools = Map::new();
        pools.insert(WorkerPool::Downloads, new_pool_channel().0);
        pools.insert(WorkerPool::Utility, new_pool_channel().0);
        let scheduler = Arc::new(Scheduler::new(tss.clone(), pools, 3));

        let rl = Arc::new(RateLimiter::new(Arc::new(InMemoryBackend::new()), RateLimiterConfig::default()));
        let metadata = Arc::new(MetadataProvider::new(catalog, rl));

        (
            ArtistFanout::new(metadata, scheduler, tss.clone(), DownloadConfig::default(), album_groups),
            tss,
        )
    }

    #[tokio::test]
    async fn queues_one_album_task_per_matching_group_and_completes() {
        let catalog = Arc::new(FakeCatalogClient::new());
        catalog.artist_albums.lock().await.insert(
            "a1".to_string(),
            vec![
                ArtistAlbumItem { id: "al1".to_string(), name: "Album".to_string(), artists: vec!["Artist".to_string()], album_group: "album".to_string() },
                ArtistAlbumItem { id: "al2".to_string(), name: "Single".to_string(), artists: vec!["Artist".to_string()], album_group: "single".to_string() },
                ArtistAlbumItem { id: "al3".to_string(), name: "Feature".to_string(), artists: vec!["Artist".to_string()], album_group: "appears_on".to_string() },
            ],
        );

        let (fanout, tss) = fanout(catalog, vec!["album".to_string(), "single".to_string()]);
        let task = artist_task("artist-task-1");
        tss.put_task_info(&task).await.unwrap();

        let result = fanout.run(&task).await.unwrap();
        assert_eq!(result.queued_task_ids.len(), 2);
        assert!(result.duplicates.is_empty());

        let latest = tss.latest_status("artist-task-1").await.unwrap().unwrap();
        assert_eq!(latest.status, TaskState::Complete);
        assert_eq!(latest.payload["queued_task_ids"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_album_submission_is_collected_not_fatal() {
        let catalog = Arc::new(FakeCatalogClient::new());
        catalog.artist_albums.lock().await.insert(
            "a1".to_string(),
            vec![ArtistAlbumItem { id: "al1".to_string(), name: "Album".to_string(), artists: vec!["Artist".to_string()], album_group: "album".to_string() }],
        );

        let (fanout, tss) = fanout(catalog, vec!["album".to_string()]);
        let task = artist_task("artist-task-1");
        tss.put_task_info(&task).await.unwrap();

        // Pre-submit the same album so the fan-out's own submission collides.
        let params = resolve_task_parameters(&DownloadConfig::default(), &HashMap::new());
        let existing_id = fanout
            .scheduler
            .submit(SubmitRequest {
                kind: TaskKind::Album,
                source_url: "https://open.spotify.com/album/al1".to_string(),
                display: TaskDisplay { name: "Album".to_string(), artist: None },
                parameters: params,
                original_request: serde_json::json!({}),
                submitter: None,
                from_watch: false,
            })
            .await
            .unwrap();

        let result = fanout.run(&task).await.unwrap();
        assert!(result.queued_task_ids.is_empty());
        assert_eq!(result.duplicates.len(), 1);
        assert_eq!(result.duplicates[0].existing_task_id, existing_id);
    }

    #[tokio::test]
    async fn rejects_non_artist_tasks() {
        let catalog = Arc::new(FakeCatalogClient::new());
        let (fanout, tss) = fanout(catalog, vec!["album".to_string()]);
        let mut task = artist_task("t1");
        task.kind = TaskKind::Track;
        tss.put_task_info(&task).await.unwrap();

        let err = fanout.run(&task).await.unwrap_err();
        assert!(matches!(err, AppError::Configuration(_)));
    }
}
