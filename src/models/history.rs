//! History store data model: DownloadHistory / ChildTrackRow (spec §3, §4.4).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DownloadHistory {
    pub id: i64,
    pub download_type: String,
    pub title: String,
    pub artists: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status: String,
    pub service: Option<String>,
    pub quality_format: Option<String>,
    pub quality_bitrate: Option<String>,
    pub total_tracks: Option<i64>,
    pub successful_tracks: Option<i64>,
    pub failed_tracks: Option<i64>,
    pub skipped_tracks: Option<i64>,
    pub children_table: Option<String>,
    pub task_id: Option<String>,
    pub external_ids: Option<String>,
    pub metadata: Option<String>,
}

/// A fully-specified parent row ready to be upserted by HS (spec §4.4 write
/// contract). Kept distinct from `DownloadHistory` (the read-side row, which
/// includes the autoincrement `id`) so callers never have to fabricate one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadHistoryWrite {
    pub download_type: String,
    pub title: String,
    pub artists: Vec<String>,
    pub status: String,
    pub service: String,
    pub quality_format: Option<String>,
    pub quality_bitrate: Option<String>,
    pub total_tracks: i64,
    pub successful_tracks: i64,
    pub failed_tracks: i64,
    pub skipped_tracks: i64,
    pub children_table: Option<String>,
    pub task_id: String,
    pub external_ids: serde_json::Value,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChildTrackStatus {
    Completed,
    Failed,
    Skipped,
}

impl ChildTrackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildTrackStatus::Completed => "completed",
            ChildTrackStatus::Failed => "failed",
            ChildTrackStatus::Skipped => "skipped",
        }
    }
}

/// One row in a dynamically-named `album_*`/`playlist_*` child table (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChildTrackRow {
    pub title: String,
    pub artists: Option<String>,
    pub album_title: Option<String>,
    pub duration_ms: Option<i64>,
    pub track_number: Option<i64>,
    pub disc_number: Option<i64>,
    pub explicit: bool,
    pub status: String,
    pub external_ids: Option<String>,
    pub genres: Option<String>,
    pub isrc: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub position: Option<i64>,
    pub metadata: Option<String>,
    pub service: Option<String>,
    pub quality_format: Option<String>,
    pub quality_bitrate: Option<String>,
}
