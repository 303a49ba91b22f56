//! Traits for the two black-box collaborators named in spec §1/§6: the fetch
//! library (actually downloads and converts audio) and the credential store
//! (resolves which service account a task should run under). Neither is
//! reimplemented here — WR only needs to call them and react to their
//! outcome, so they are modeled as traits with an in-memory fake for tests,
//! matching the teacher's `JobHandler` (`src/services/job_queue.rs`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{FetchEvent, TaskKind, TaskParameters};

/// One resolved account the fetch library can run a job under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServiceAccount {
    Spotify,
    Deezer,
}

impl ServiceAccount {
    /// The quality string to use for this account (spec §4.2 step 3:
    /// "quality per service"). Each account reads its own config knob rather
    /// than a single shared one, since a Deezer-first fallback attempt must
    /// not reuse the Spotify quality string and vice versa.
    pub fn quality_in<'a>(&self, parameters: &'a TaskParameters) -> &'a str {
        match self {
            ServiceAccount::Spotify => &parameters.spotify_quality,
            ServiceAccount::Deezer => &parameters.deezer_quality,
        }
    }
}

/// Resolves which account(s) a task should attempt, in priority order
/// (spec SPEC_FULL.md §"Supplemented features": credential fallback
/// routing). `primary` first; `fallback` tried only when `parameters.fallback`
/// is set and the primary attempt fails with a retryable error.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, parameters: &TaskParameters) -> Result<Vec<ServiceAccount>>;
}

/// Default resolver: a Spotify source with fallback enabled tries Deezer
/// first, then falls back to Spotify; a Deezer source never falls back.
/// Grounded in the original's account/fallback selection
/// (`routes/utils/celery_tasks.py`: `main = deezer; fallback = spotify` for a
/// spotify source with fallback enabled, `fallback = None` for a deezer
/// source regardless of the flag).
pub struct DeezerThenSpotifyResolver;

#[async_trait]
impl CredentialResolver for DeezerThenSpotifyResolver {
    async fn resolve(&self, parameters: &TaskParameters) -> Result<Vec<ServiceAccount>> {
        if parameters.service == "deezer" {
            return Ok(vec![ServiceAccount::Deezer]);
        }
        if parameters.fallback {
            return Ok(vec![ServiceAccount::Deezer, ServiceAccount::Spotify]);
        }
        Ok(vec![ServiceAccount::Spotify])
    }
}

/// A single download/conversion attempt, driven by the fetch library. The
/// library is expected to invoke the progress callback with raw
/// [`FetchEvent`]s as it works, and to return the final event (normally
/// `FetchEvent::Done`, possibly `FetchEvent::Error`).
#[async_trait]
pub trait FetchClient: Send + Sync {
    async fn run(
        &self,
        kind: TaskKind,
        source_url: &str,
        account: ServiceAccount,
        parameters: &TaskParameters,
        on_event: Box<dyn Fn(FetchEvent) + Send + Sync>,
    ) -> Result<FetchEvent>;
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted outcome fake: returns the Nth configured event in sequence,
    /// repeating the last entry forever. Lets tests drive WR through success,
    /// retryable failure, and terminal failure paths deterministically.
    pub struct ScriptedFetchClient {
        pub outcomes: Vec<FetchEvent>,
        call_count: AtomicUsize,
    }

    impl ScriptedFetchClient {
        pub fn new(outcomes: Vec<FetchEvent>) -> Self {
            Self {
                outcomes,
                call_count: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl FetchClient for ScriptedFetchClient {
        async fn run(
            &self,
            _kind: TaskKind,
            _source_url: &str,
            _account: ServiceAccount,
            _parameters: &TaskParameters,
            on_event: Box<dyn Fn(FetchEvent) + Send + Sync>,
        ) -> Result<FetchEvent> {
            let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
            let outcome = self
                .outcomes
                .get(idx)
                .or_else(|| self.outcomes.last())
                .cloned()
                .unwrap_or(FetchEvent::Error {
                    message: "no scripted outcome".to_string(),
                });
            on_event(FetchEvent::Initializing {
                total_tracks: Some(1),
                name: None,
            });
            Ok(outcome)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(service: &str, fallback: bool) -> TaskParameters {
        TaskParameters {
            service: service.to_string(),
            fallback,
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

    #[tokio::test]
    async fn resolver_returns_only_primary_without_fallback() {
        let resolver = DeezerThenSpotifyResolver;
        let accounts = resolver.resolve(&params("spotify", false)).await.unwrap();
        assert_eq!(accounts, vec![ServiceAccount::Spotify]);
    }

    #[tokio::test]
    async fn resolver_tries_deezer_before_spotify_when_fallback_enabled() {
        let resolver = DeezerThenSpotifyResolver;
        let accounts = resolver.resolve(&params("spotify", true)).await.unwrap();
        assert_eq!(accounts, vec![ServiceAccount::Deezer, ServiceAccount::Spotify]);
    }

    #[tokio::test]
    async fn resolver_never_adds_a_fallback_for_a_deezer_source() {
        let resolver = DeezerThenSpotifyResolver;
        let accounts = resolver.resolve(&params("deezer", true)).await.unwrap();
        assert_eq!(accounts, vec![ServiceAccount::Deezer]);

        let accounts = resolver.resolve(&params("deezer", false)).await.unwrap();
        assert_eq!(accounts, vec![ServiceAccount::Deezer]);
    }

    #[tokio::test]
    async fn resolver_picks_the_matching_quality_per_account() {
        let mut parameters = params("spotify", true);
        parameters.spotify_quality = "HIGH".to_string();
        parameters.deezer_quality = "FLAC".to_string();
        assert_eq!(ServiceAccount::Spotify.quality_in(&parameters), "HIGH");
        assert_eq!(ServiceAccount::Deezer.quality_in(&parameters), "FLAC");
    }
}
