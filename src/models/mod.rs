//! Data model shared by every component.

pub mod history;
pub mod progress;
pub mod task;
pub mod watch;

pub use history::{ChildTrackRow, ChildTrackStatus, DownloadHistory, DownloadHistoryWrite};
pub use progress::FetchEvent;
pub use task::{Task, TaskDisplay, TaskKind, TaskParameters, TaskState, TaskStatus};
pub use watch::{ArtistAlbum, ArtistAlbumDownloadStatus, PlaylistTrack, WatchedArtist, WatchedItem, WatchedPlaylist};
