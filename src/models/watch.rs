//! Watch subsystem data model: WatchedPlaylist/PlaylistTrack/WatchedArtist/ArtistAlbum
//! (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WatchedPlaylist {
    pub spotify_id: String,
    pub name: String,
    pub owner_id: Option<String>,
    pub owner_name: Option<String>,
    pub total_tracks: i64,
    pub snapshot_id: Option<String>,
    pub batch_next_offset: i64,
    pub batch_processing_snapshot_id: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
    pub added_at: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PlaylistTrack {
    pub spotify_track_id: String,
    pub title: Option<String>,
    pub artists: Option<String>,
    pub album: Option<String>,
    pub track_number: Option<i64>,
    pub duration_ms: Option<i64>,
    pub added_at_playlist: Option<DateTime<Utc>>,
    pub added_to_db: DateTime<Utc>,
    pub is_present_in_spotify: bool,
    pub last_seen_in_spotify: Option<DateTime<Utc>>,
    pub snapshot_id: Option<String>,
    pub final_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WatchedArtist {
    pub spotify_id: String,
    pub name: String,
    pub total_albums_on_spotify: i64,
    pub batch_next_offset: i64,
    pub last_checked: Option<DateTime<Utc>>,
    pub added_at: DateTime<Utc>,
    pub is_active: bool,
}

/// Discriminates the three states download_status can be in for an
/// ArtistAlbum row (spec §3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[repr(i64)]
pub enum ArtistAlbumDownloadStatus {
    None = 0,
    Initiated = 1,
    Completed = 2,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ArtistAlbum {
    pub album_spotify_id: String,
    pub name: Option<String>,
    pub artists: Option<String>,
    pub added_to_db: DateTime<Utc>,
    pub last_seen_on_spotify: Option<DateTime<Utc>>,
    pub download_task_id: Option<String>,
    pub download_status: i64,
    pub is_fully_downloaded_managed_by_app: bool,
}

/// A single watched item, as the round-robin scheduler sees it (spec §4.8).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum WatchedItem {
    Playlist(String),
    Artist(String),
}
