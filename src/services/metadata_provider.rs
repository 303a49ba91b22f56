//! MP: thin cacheable wrapper over the remote catalogue APIs (spec §2 MP,
//! §4.2 step 3, §6). Every outbound call is routed through RL first; on a
//! rate-limited response the call is retried after recording the barrier on
//! RL, the same retry shape the rate limiter itself uses internally.
//!
//! The actual HTTP client is modeled as a [`CatalogClient`] trait, following
//! the teacher's `SpotifySyncWorker` (`src/services/catalog_sync/spotify.rs`):
//! a thin `reqwest`-backed struct in production, a scripted fake in tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::services::rate_limiter::RateLimiter;

/// Spotify never returns more than 50 items per page for playlist tracks or
/// artist discography (spec §6).
pub const MAX_PAGE_LIMIT: u32 = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackMeta {
    pub id: String,
    pub title: String,
    pub artists: Vec<String>,
    pub album: Option<String>,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    pub duration_ms: Option<u64>,
    pub isrc: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlbumMeta {
    pub id: String,
    pub title: String,
    pub artists: Vec<String>,
    pub total_tracks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistMeta {
    pub id: String,
    pub name: String,
    pub owner_id: Option<String>,
    pub owner_name: Option<String>,
    pub snapshot_id: String,
    pub total_tracks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistTrackItem {
    pub track_id: String,
    pub title: String,
    pub artists: Vec<String>,
    pub album: Option<String>,
    pub track_number: Option<u32>,
    pub duration_ms: Option<u64>,
    pub added_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtistMeta {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtistAlbumItem {
    pub id: String,
    pub name: String,
    pub artists: Vec<String>,
    /// One of `album`, `single`, `compilation`, `appears_on` (spec §4.7).
    pub album_group: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeMeta {
    pub id: String,
    pub title: String,
    pub show: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub offset: u32,
    pub limit: u32,
    pub total: u32,
}

impl<T> Page<T> {
    pub fn has_more(&self) -> bool {
        self.offset + (self.items.len() as u32) < self.total
    }
}

/// Raw remote calls, unaware of RL or caching. A production implementation
/// talks to the Spotify/Deezer Web APIs over `reqwest`; tests use a scripted
/// fake (see `fake` module below).
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn get_track(&self, id: &str) -> Result<TrackMeta>;
    async fn get_album(&self, id: &str) -> Result<AlbumMeta>;
    async fn get_album_tracks(&self, id: &str, offset: u32, limit: u32) -> Result<Page<TrackMeta>>;
    async fn get_playlist(&self, id: &str) -> Result<PlaylistMeta>;
    async fn get_playlist_tracks(&self, id: &str, offset: u32, limit: u32) -> Result<Page<PlaylistTrackItem>>;
    async fn get_artist(&self, id: &str) -> Result<ArtistMeta>;
    async fn get_artist_discography(
        &self,
        id: &str,
        offset: u32,
        limit: u32,
        include_groups: &[String],
    ) -> Result<Page<ArtistAlbumItem>>;
    async fn get_episode(&self, id: &str) -> Result<EpisodeMeta>;
}

/// Production client: Spotify Web API over `reqwest`. Grounded in the
/// teacher's `SpotifySyncWorker` token/HTTP plumbing, trimmed to the
/// read-only catalogue endpoints this service needs.
pub struct SpotifyCatalogClient {
    http: reqwest::Client,
    access_token: tokio::sync::RwLock<Option<String>>,
    client_id: String,
    client_secret: String,
}

const SPOTIFY_API_BASE: &str = "https://api.spotify.com/v1";

impl SpotifyCatalogClient {
    pub fn new(client_id: String, client_secret: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            access_token: tokio::sync::RwLock::new(None),
            client_id,
            client_secret,
        }
    }

    async fn ensure_token(&self) -> Result<String> {
        if let Some(token) = self.access_token.read().await.clone() {
            return Ok(token);
        }
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
        }
        let resp: TokenResponse = self
            .http
            .post("https://accounts.spotify.com/api/token")
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        *self.access_token.write().await = Some(resp.access_token.clone());
        Ok(resp.access_token)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
        let token = self.ensure_token().await?;
        let resp = self
            .http
            .get(format!("{SPOTIFY_API_BASE}{path}"))
            .bearer_auth(token)
            .send()
            .await?;
        if resp.status().as_u16() == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let msg = match retry_after {
                Some(s) => format!("429 Too Many Requests; Retry-After: {s}"),
                None => "429 Too Many Requests".to_string(),
            };
            return Err(AppError::RateLimited(msg));
        }
        Ok(resp.error_for_status()?.json().await?)
    }
}

#[async_trait]
impl CatalogClient for SpotifyCatalogClient {
    async fn get_track(&self, id: &str) -> Result<TrackMeta> {
        self.get_json(&format!("/tracks/{id}")).await
    }

    async fn get_album(&self, id: &str) -> Result<AlbumMeta> {
        self.get_json(&format!("/albums/{id}")).await
    }

    async fn get_album_tracks(&self, id: &str, offset: u32, limit: u32) -> Result<Page<TrackMeta>> {
        let limit = limit.min(MAX_PAGE_LIMIT);
        self.get_json(&format!("/albums/{id}/tracks?offset={offset}&limit={limit}")).await
    }

    async fn get_playlist(&self, id: &str) -> Result<PlaylistMeta> {
        self.get_json(&format!("/playlists/{id}")).await
    }

    async fn get_playlist_tracks(&self, id: &str, offset: u32, limit: u32) -> Result<Page<PlaylistTrackItem>> {
        let limit = limit.min(MAX_PAGE_LIMIT);
        self.get_json(&format!("/playlists/{id}/tracks?offset={offset}&limit={limit}")).await
    }

    async fn get_artist(&self, id: &str) -> Result<ArtistMeta> {
        self.get_json(&format!("/artists/{id}")).await
    }

    async fn get_artist_discography(
        &self,
        id: &str,
        offset: u32,
        limit: u32,
        include_groups: &[String],
    ) -> Result<Page<ArtistAlbumItem>> {
        let limit = limit.min(MAX_PAGE_LIMIT);
        let groups = if include_groups.is_empty() {
            "single,album,appears_on".to_string()
        } else {
            include_groups.join(",")
        };
        self.get_json(&format!(
            "/artists/{id}/albums?offset={offset}&limit={limit}&include_groups={}",
            urlencoding::encode(&groups)
        ))
        .await
    }

    async fn get_episode(&self, id: &str) -> Result<EpisodeMeta> {
        self.get_json(&format!("/episodes/{id}")).await
    }
}

const PLAYLIST_CACHE_TTL: Duration = Duration::from_secs(300);
const RETRY_ATTEMPTS: u32 = 3;

/// The RL-gated facade every other component calls into for remote metadata
/// (spec §4.2). Playlist metadata is cached for 5 minutes (spec §6).
pub struct MetadataProvider {
    client: Arc<dyn CatalogClient>,
    rate_limiter: Arc<RateLimiter>,
    playlist_cache: Cache<String, PlaylistMeta>,
}

impl MetadataProvider {
    pub fn new(client: Arc<dyn CatalogClient>, rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            client,
            rate_limiter,
            playlist_cache: Cache::builder().time_to_live(PLAYLIST_CACHE_TTL).max_capacity(10_000).build(),
        }
    }

    /// Run `op` behind RL, retrying through RL's 429 handling on a rate-limit
    /// error (spec §4.2 step 3, §9 429 handling).
    async fn guarded<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        for attempt in 0..RETRY_ATTEMPTS {
            self.rate_limiter.acquire().await?;
            match op().await {
                Ok(v) => return Ok(v),
                Err(AppError::RateLimited(msg)) => {
                    let retry_after = RateLimiter::parse_retry_after(&msg);
                    self.rate_limiter.record_rate_limited(retry_after, attempt).await?;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(AppError::RateLimited(
            "metadata provider exhausted retries after repeated 429s".to_string(),
        ))
    }

    pub async fn get_track(&self, id: &str) -> Result<TrackMeta> {
        self.guarded(|| self.client.get_track(id)).await
    }

    pub async fn get_album(&self, id: &str) -> Result<AlbumMeta> {
        self.guarded(|| self.client.get_album(id)).await
    }

    pub async fn get_album_tracks(&self, id: &str, offset: u32, limit: u32) -> Result<Page<TrackMeta>> {
        let limit = limit.min(MAX_PAGE_LIMIT);
        self.guarded(|| self.client.get_album_tracks(id, offset, limit)).await
    }

    /// Cached for 5 minutes; cache key is the playlist id (spec §6).
    pub async fn get_playlist(&self, id: &str) -> Result<PlaylistMeta> {
        if let Some(cached) = self.playlist_cache.get(id).await {
            return Ok(cached);
        }
        let fetched = self.guarded(|| self.client.get_playlist(id)).await?;
        self.playlist_cache.insert(id.to_string(), fetched.clone()).await;
        Ok(fetched)
    }

    pub async fn get_playlist_tracks(&self, id: &str, offset: u32, limit: u32) -> Result<Page<PlaylistTrackItem>> {
        let limit = limit.min(MAX_PAGE_LIMIT);
        self.guarded(|| self.client.get_playlist_tracks(id, offset, limit)).await
    }

    pub async fn get_artist(&self, id: &str) -> Result<ArtistMeta> {
        self.guarded(|| self.client.get_artist(id)).await
    }

    pub async fn get_artist_discography(
        &self,
        id: &str,
        offset: u32,
        limit: u32,
        include_groups: &[String],
    ) -> Result<Page<ArtistAlbumItem>> {
        let limit = limit.min(MAX_PAGE_LIMIT);
        self.guarded(|| self.client.get_artist_discography(id, offset, limit, include_groups)).await
    }

    pub async fn get_episode(&self, id: &str) -> Result<EpisodeMeta> {
        self.guarded(|| self.client.get_episode(id)).await
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeCatalogClient;
    use super::*;
    use crate::services::rate_limiter::fake::InMemoryBackend;
    use crate::services::rate_limiter::RateLimiterConfig;

    fn provider(client: Arc<FakeCatalogClient>) -> MetadataProvider {
        let rl = Arc::new(RateLimiter::new(Arc::new(InMemoryBackend::new()), RateLimiterConfig::default()));
        MetadataProvider::new(client, rl)
    }

    #[tokio::test]
    async fn playlist_lookup_is_cached_across_calls() {
        let client = Arc::new(FakeCatalogClient::new());
        client.playlists.lock().await.insert(
            "p1".to_string(),
            PlaylistMeta {
                id: "p1".to_string(),
                name: "Mix".to_string(),
                owner_id: None,
                owner_name: None,
                snapshot_id: "snap1".to_string(),
                total_tracks: 3,
            },
        );
        let mp = provider(client.clone());

        mp.get_playlist("p1").await.unwrap();
        mp.get_playlist("p1").await.unwrap();

        assert_eq!(client.call_count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limited_call_retries_through_rl() {
        let client = Arc::new(FakeCatalogClient::new());
        client.fail_times.store(1, std::sync::atomic::Ordering::SeqCst);
        client.playlists.lock().await.insert(
            "p1".to_string(),
            PlaylistMeta {
                id: "p1".to_string(),
                name: "Mix".to_string(),
                owner_id: None,
                owner_name: None,
                snapshot_id: "snap1".to_string(),
                total_tracks: 3,
            },
        );
        let mp = provider(client.clone());
        let result = mp.get_playlist("p1").await.unwrap();
        assert_eq!(result.name, "Mix");
        assert_eq!(client.call_count.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn playlist_track_pagination_never_exceeds_fifty() {
        let client = Arc::new(FakeCatalogClient::new());
        let mp = provider(client);
        let page = mp.get_playlist_tracks("p1", 0, 500).await.unwrap();
        assert_eq!(page.limit, MAX_PAGE_LIMIT);
    }
}
