//! Task and TaskStatus data model (spec §3, §4.5).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The four kinds of reference a user can submit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Track,
    Album,
    Playlist,
    Artist,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Track => "track",
            TaskKind::Album => "album",
            TaskKind::Playlist => "playlist",
            TaskKind::Artist => "artist",
        }
    }

    /// Artist submissions are a fan-out operation (§4.7); they never occupy a
    /// worker slot themselves.
    pub fn enqueues_worker_job(&self) -> bool {
        !matches!(self, TaskKind::Artist)
    }
}

/// Display metadata shown to a user for a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDisplay {
    pub name: String,
    pub artist: Option<String>,
}

/// Per-service quality/format knobs resolved from config + caller overrides
/// (spec §4.1 step 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskParameters {
    pub service: String,
    pub fallback: bool,
    /// Quality to use when the fetch library runs under the Spotify account
    /// (spec §4.2 step 3: "quality per service").
    pub spotify_quality: String,
    /// Quality to use when the fetch library runs under the Deezer account.
    pub deezer_quality: String,
    pub real_time: bool,
    pub convert_to: Option<String>,
    pub bitrate: Option<String>,
    pub custom_dir_format: String,
    pub custom_track_format: String,
    pub tracknum_padding: bool,
    pub pad_number_width: u32,
}

/// A unit of work submitted to SQM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub kind: TaskKind,
    pub source_url: String,
    pub display: TaskDisplay,
    pub parameters: TaskParameters,
    pub original_request: serde_json::Value,
    pub retry_of: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub submitter: Option<String>,
    /// Name of the per-parent child table in HS, set once the worker creates
    /// it (spec §4.2 step 4); only meaningful for album/playlist kinds.
    pub children_table: Option<String>,
    /// True when this submission originated from WE rather than a direct
    /// user request (spec §4.1 step 6 / §4.8).
    pub from_watch: bool,
}

/// The non-terminal/terminal states a task can occupy (spec §4.5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Queued,
    Processing,
    Initializing,
    Downloading,
    Progress,
    RealTime,
    TrackProgress,
    TrackComplete,
    Skipped,
    Retrying,
    Complete,
    Error,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Complete | TaskState::Error | TaskState::Cancelled)
    }
}

/// One append-only entry in a task's status log (spec §3 TaskStatus).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub status_id: u64,
    pub timestamp: DateTime<Utc>,
    pub status: TaskState,
    pub payload: serde_json::Value,
}

impl TaskStatus {
    pub fn new(status_id: u64, status: TaskState, payload: serde_json::Value) -> Self {
        Self {
            status_id,
            timestamp: Utc::now(),
            status,
            payload,
        }
    }
}
