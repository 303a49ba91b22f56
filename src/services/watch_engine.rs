//! WE: round-robin ticker that reconciles one watched playlist or artist per
//! tick against MP, enqueuing newly discovered tracks/albums via SQM (spec
//! §2 WE, §4.8). Grounded in the teacher's independent `tokio::time::interval`
//! background loops (`TokenVaultBackgroundService` in
//! `src/services/token_vault_background.rs`), generalized from several fixed
//! periodic jobs to a single ticker that advances over a round-robin set.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::{resolve_task_parameters, DownloadConfig, WatchConfig};
use crate::error::{AppError, Result};
use crate::models::{
    ArtistAlbum, ArtistAlbumDownloadStatus, PlaylistTrack, TaskDisplay, TaskKind, WatchedItem, WatchedPlaylist,
};
use crate::services::metadata_provider::{MetadataProvider, PlaylistMeta};
use crate::services::scheduler::{Scheduler, SubmitRequest};
use crate::services::watch_store::WatchStore;

pub struct WatchEngine {
    store: Arc<WatchStore>,
    metadata: Arc<MetadataProvider>,
    scheduler: Arc<Scheduler>,
    config: WatchConfig,
    download_config: DownloadConfig,
    downloads_dir: std::path::PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
    round_robin_index: AtomicUsize,
}

impl WatchEngine {
    pub fn new(
        store: Arc<WatchStore>,
        metadata: Arc<MetadataProvider>,
        scheduler: Arc<Scheduler>,
        config: WatchConfig,
        download_config: DownloadConfig,
        downloads_dir: std::path::PathBuf,
    ) -> Self {
        Self {
            store,
            metadata,
            scheduler,
            config,
            download_config,
            downloads_dir,
            locks: DashMap::new(),
            round_robin_index: AtomicUsize::new(0),
        }
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks.entry(id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    fn page_limit(&self) -> u32 {
        self.config.max_items_per_run.clamp(1, 50)
    }

    /// Runs forever at `watchPollIntervalSeconds`, processing exactly one
    /// item per tick (spec §4.8 step 3). A failed tick is logged and never
    /// aborts the loop.
    pub async fn run(self: Arc<Self>) {
        let period = Duration::from_secs(self.config.watch_poll_interval_seconds.max(1));
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick().await {
                warn!(error = %e, "watch tick failed");
            }
        }
    }

    /// One round-robin step: pick exactly one watched item and reconcile it
    /// (spec §4.8 Scheduler).
    pub async fn tick(&self) -> Result<()> {
        let items = self.store.round_robin_items().await?;
        if items.is_empty() {
            return Ok(());
        }
        let idx = self.round_robin_index.fetch_add(1, Ordering::SeqCst) % items.len();
        match &items[idx] {
            WatchedItem::Playlist(id) => self.reconcile_playlist(id).await,
            WatchedItem::Artist(id) => self.reconcile_artist(id).await,
        }
    }

    async fn reconcile_playlist(&self, spotify_id: &str) -> Result<()> {
        let lock = self.lock_for(spotify_id);
        let _guard = lock.lock().await;

        let meta = self
            .metadata
            .get_playlist(spotify_id)
            .await
            .map_err(|e| AppError::WatchProviderFailure { item_id: spotify_id.to_string(), message: e.to_string() })?;

        let mut stored = self.store.get_watched_playlist(spotify_id).await?.ok_or_else(|| {
            AppError::Configuration(format!("watched playlist {spotify_id} has no stored record"))
        })?;

        if self.config.use_snapshot_id_checking
            && stored.snapshot_id.as_deref() == Some(meta.snapshot_id.as_str())
            && stored.total_tracks == meta.total_tracks as i64
        {
            return Ok(());
        }

        if stored.total_tracks == meta.total_tracks as i64 {
            self.targeted_sync(&mut stored, &meta).await
        } else {
            self.full_sync(&mut stored, &meta).await
        }
    }

    /// Refreshes stale per-row snapshot ids without touching the playlist's
    /// own `snapshot_id` (spec §4.8 Targeted sync).
    async fn targeted_sync(&self, stored: &mut WatchedPlaylist, meta: &PlaylistMeta) -> Result<()> {
        let table = WatchStore::playlist_tracks_table(&stored.spotify_id);
        self.store.ensure_playlist_tracks_table(&table).await?;

        let page = self
            .metadata
            .get_playlist_tracks(&stored.spotify_id, stored.batch_next_offset as u32, self.page_limit())
            .await
            .map_err(|e| AppError::WatchProviderFailure { item_id: stored.spotify_id.clone(), message: e.to_string() })?;

        for item in &page.items {
            self.store
                .upsert_playlist_track(
                    &table,
                    &PlaylistTrack {
                        spotify_track_id: item.track_id.clone(),
                        title: Some(item.title.clone()),
                        artists: Some(item.artists.join(", ")),
                        album: item.album.clone(),
                        track_number: item.track_number.map(i64::from),
                        duration_ms: item.duration_ms.map(|n| n as i64),
                        added_at_playlist: item.added_at,
                        added_to_db: Utc::now(),
                        is_present_in_spotify: true,
                        last_seen_in_spotify: Some(Utc::now()),
                        snapshot_id: Some(meta.snapshot_id.clone()),
                        final_path: None,
                    },
                )
                .await?;
        }

        let next_offset = stored.batch_next_offset + page.items.len() as i64;
        stored.batch_next_offset = if page.items.is_empty() || next_offset >= stored.total_tracks {
            0
        } else {
            next_offset
        };
        self.store.upsert_watched_playlist(stored).await
    }

    /// Fetches one page of the playlist, submits track jobs for anything not
    /// already locally known, and — on reaching the end of the scan — closes
    /// out the snapshot and regenerates the `.m3u` file (spec §4.8 Full sync).
    async fn full_sync(&self, stored: &mut WatchedPlaylist, meta: &PlaylistMeta) -> Result<()> {
        let table = WatchStore::playlist_tracks_table(&stored.spotify_id);
        self.store.ensure_playlist_tracks_table(&table).await?;

        if stored.batch_processing_snapshot_id.as_deref() != Some(meta.snapshot_id.as_str()) {
            stored.batch_next_offset = 0;
            stored.batch_processing_snapshot_id = Some(meta.snapshot_id.clone());
        }

        let page = self
            .metadata
            .get_playlist_tracks(&stored.spotify_id, stored.batch_next_offset as u32, self.page_limit())
            .await
            .map_err(|e| AppError::WatchProviderFailure { item_id: stored.spotify_id.clone(), message: e.to_string() })?;

        let known_ids: HashSet<String> =
            self.store.list_playlist_tracks(&table).await?.into_iter().map(|t| t.spotify_track_id).collect();

        for item in &page.items {
            if !known_ids.contains(&item.track_id) {
                let params = resolve_task_parameters(&self.download_config, &HashMap::new());
                let submitted = self
                    .scheduler
                    .submit(SubmitRequest {
                        kind: TaskKind::Track,
                        source_url: format!("https://open.spotify.com/track/{}", item.track_id),
                        display: TaskDisplay { name: item.title.clone(), artist: item.artists.first().cloned() },
                        parameters: params,
                        original_request: serde_json::json!({ "playlist_id": stored.spotify_id }),
                        submitter: None,
                        from_watch: true,
                    })
                    .await;
                if let Err(e) = submitted {
                    if !matches!(e, AppError::DuplicateDownload { .. }) {
                        return Err(e);
                    }
                }
            }

            self.store
                .upsert_playlist_track(
                    &table,
                    &PlaylistTrack {
                        spotify_track_id: item.track_id.clone(),
                        title: Some(item.title.clone()),
                        artists: Some(item.artists.join(", ")),
                        album: item.album.clone(),
                        track_number: item.track_number.map(i64::from),
                        duration_ms: item.duration_ms.map(|n| n as i64),
                        added_at_playlist: item.added_at,
                        added_to_db: Utc::now(),
                        is_present_in_spotify: true,
                        last_seen_in_spotify: Some(Utc::now()),
                        snapshot_id: Some(meta.snapshot_id.clone()),
                        final_path: None,
                    },
                )
                .await?;
        }

        let next_offset = stored.batch_next_offset + page.items.len() as i64;
        if next_offset < meta.total_tracks as i64 {
            stored.batch_next_offset = next_offset;
            self.store.upsert_watched_playlist(stored).await
        } else {
            stored.batch_processing_snapshot_id = None;
            stored.snapshot_id = Some(meta.snapshot_id.clone());
            stored.total_tracks = meta.total_tracks as i64;
            stored.batch_next_offset = 0;
            stored.last_checked = Some(Utc::now());
            self.store.upsert_watched_playlist(stored).await?;
            self.generate_m3u(stored).await
        }
    }

    async fn reconcile_artist(&self, spotify_id: &str) -> Result<()> {
        let lock = self.lock_for(spotify_id);
        let _guard = lock.lock().await;

        let mut stored = self
            .store
            .get_watched_artist(spotify_id)
            .await?
            .ok_or_else(|| AppError::Configuration(format!("watched artist {spotify_id} has no stored record")))?;

        let table = WatchStore::artist_albums_table(spotify_id);
        self.store.ensure_artist_albums_table(&table).await?;

        let page = self
            .metadata
            .get_artist_discography(
                spotify_id,
                stored.batch_next_offset as u32,
                self.page_limit(),
                &self.config.watched_artist_album_group,
            )
            .await
            .map_err(|e| AppError::WatchProviderFailure { item_id: spotify_id.to_string(), message: e.to_string() })?;

        for album in &page.items {
            if !self.config.watched_artist_album_group.contains(&album.album_group) {
                continue;
            }
            if self.store.get_artist_album(&table, &album.id).await?.is_some() {
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
                    original_request: serde_json::json!({ "artist_id": spotify_id }),
                    submitter: None,
                    from_watch: true,
                })
                .await;
            let download_task_id = match submitted {
                Ok(task_id) => Some(task_id),
                Err(AppError::DuplicateDownload { existing_task_id }) => Some(existing_task_id),
                Err(e) => return Err(e),
            };

            self.store
                .upsert_artist_album(
                    &table,
                    &ArtistAlbum {
                        album_spotify_id: album.id.clone(),
                        name: Some(album.name.clone()),
                        artists: Some(album.artists.join(", ")),
                        added_to_db: Utc::now(),
                        last_seen_on_spotify: Some(Utc::now()),
                        download_task_id,
                        download_status: ArtistAlbumDownloadStatus::Initiated as i64,
                        is_fully_downloaded_managed_by_app: false,
                    },
                )
                .await?;
        }

        let next_offset = stored.batch_next_offset + page.items.len() as i64;
        if page.has_more() {
            stored.batch_next_offset = next_offset;
        } else {
            stored.batch_next_offset = 0;
            stored.total_albums_on_spotify = page.total as i64;
        }
        stored.last_checked = Some(Utc::now());
        self.store.upsert_watched_artist(&stored).await
    }

    /// Writes the playlist's present, located tracks as an `.m3u` file (spec
    /// §4.8 M3U generation).
    async fn generate_m3u(&self, stored: &WatchedPlaylist) -> Result<()> {
        let table = WatchStore::playlist_tracks_table(&stored.spotify_id);
        let rows = self.store.list_playlist_tracks(&table).await?;

        let mut content = String::from("#EXTM3U\n");
        for row in rows.iter().filter(|r| r.is_present_in_spotify) {
            let Some(final_path) = &row.final_path else { continue };
            let duration_seconds = row.duration_ms.unwrap_or(0) / 1000;
            let artist = row.artists.as_deref().unwrap_or_default();
            let title = row.title.as_deref().unwrap_or_default();
            content.push_str(&format!("#EXTINF:{duration_seconds},{artist} - {title}\n{final_path}\n"));
        }

        std::fs::create_dir_all(&self.downloads_dir)
            .map_err(|e| AppError::Other(anyhow::anyhow!("could not create downloads dir: {e}")))?;
        let path = self.downloads_dir.join(format!("{}.m3u", sanitize_filename(&stored.name)));
        std::fs::write(&path, content).map_err(|e| AppError::Other(anyhow::anyhow!("could not write m3u: {e}")))?;
        Ok(())
    }
}

fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == ' ' || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
