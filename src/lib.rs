//! Download orchestration service: scheduler, rate limiter, watch
//! reconciliation, and history store for Spotify/Deezer-sourced music (spec
//! §1-§9). Re-exports mirror the teacher's `lib.rs`, minus its axum
//! `Router`/`AppState` — this crate has no HTTP layer of its own (§1: HTTP
//! route handlers are an external collaborator).

pub mod config;
pub mod error;
pub mod models;
pub mod services;

pub use config::{DownloadConfig, InfraConfig, MainConfig, WatchConfig};
pub use error::{AppError, Result};
pub use models::*;
pub use services::artist_fanout::{ArtistFanout, ArtistFanoutResult, DuplicateAlbum};
pub use services::external::{CredentialResolver, DeezerThenSpotifyResolver, FetchClient, ServiceAccount};
pub use services::history_store::HistoryStore;
pub use services::metadata_provider::MetadataProvider;
pub use services::progress::ProgressNormalizer;
pub use services::rate_limiter::{RateLimiter, RateLimiterConfig};
pub use services::scheduler::{Scheduler, SubmitRequest, WorkerPool};
pub use services::task_state_store::TaskStateStore;
pub use services::watch_engine::WatchEngine;
pub use services::watch_store::WatchStore;
pub use services::worker::WorkerPoolRunner;
