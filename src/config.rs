//! Configuration: infra settings from the environment, download settings from
//! a hot-reloadable JSON file (spec §9 design notes, SPEC_FULL.md §12).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

const REQUIRED_VERSION: &str = "3.3.0";
const TARGET_VERSION: &str = "3.3.1";

/// Infrastructure settings: database/redis locations and log verbosity.
/// Loaded once at startup from the process environment, following the
/// teacher's `AppConfig::from_env` convention.
#[derive(Debug, Clone)]
pub struct InfraConfig {
    pub database_url: String,
    pub redis_url: String,
    pub rust_log: String,
    pub config_dir: PathBuf,
    pub downloads_dir: PathBuf,
    pub spotify_client_id: String,
    pub spotify_client_secret: String,
}

impl InfraConfig {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://data/history.db".to_string());
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let config_dir = std::env::var("CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/config"));
        let downloads_dir = std::env::var("DOWNLOADS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./downloads"));
        // Credential storage internals are out of scope (spec §1); these two
        // are only what MP's production `SpotifyCatalogClient` needs to
        // authenticate, not a general account store.
        let spotify_client_id = std::env::var("SPOTIFY_CLIENT_ID").unwrap_or_default();
        let spotify_client_secret = std::env::var("SPOTIFY_CLIENT_SECRET").unwrap_or_default();

        if database_url.is_empty() {
            return Err(AppError::Configuration("DATABASE_URL is empty".into()));
        }

        Ok(Self {
            database_url,
            redis_url,
            rust_log,
            config_dir,
            downloads_dir,
            spotify_client_id,
            spotify_client_secret,
        })
    }
}

/// Download behavior settings (spec §4.1 step 3). Lives in `main.json` under
/// the root object; hot-reloadable without a process restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadConfig {
    pub service: String,
    pub fallback: bool,
    pub spotify_quality: String,
    pub deezer_quality: String,
    pub real_time: bool,
    #[serde(default)]
    pub convert_to: Option<String>,
    #[serde(default)]
    pub bitrate: Option<String>,
    pub max_concurrent_downloads: u32,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub retry_delay_increase: u64,
    pub custom_dir_format: String,
    pub custom_track_format: String,
    pub tracknum_padding: bool,
    pub pad_number_width: u32,
    pub incomplete_download_folder: String,
}

impl DownloadConfig {
    /// Retry deferral per spec §4.1 Retry: `initial_delay + retry_count * delay_increase`.
    pub fn retry_delay_for(&self, retry_count: u32) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.retry_delay_seconds + retry_count as u64 * self.retry_delay_increase,
        )
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            service: "spotify".to_string(),
            fallback: false,
            spotify_quality: "NORMAL".to_string(),
            deezer_quality: "MP3_320".to_string(),
            real_time: false,
            convert_to: None,
            bitrate: None,
            max_concurrent_downloads: 3,
            max_retries: 3,
            retry_delay_seconds: 5,
            retry_delay_increase: 5,
            custom_dir_format: "%artist%/%album%".to_string(),
            custom_track_format: "%tracknum% - %title%".to_string(),
            tracknum_padding: true,
            pad_number_width: 2,
            incomplete_download_folder: "./incomplete".to_string(),
        }
    }
}

/// Watch subsystem settings, stored under `main.json`'s `watch` key
/// (spec §4.8). Defaults and legacy-key migration mirror the original
/// `DEFAULT_WATCH_CONFIG` / `get_watch_config` behavior exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WatchConfig {
    pub enabled: bool,
    pub watch_poll_interval_seconds: u64,
    pub watched_artist_album_group: Vec<String>,
    pub delay_between_playlists_seconds: u64,
    pub delay_between_artists_seconds: u64,
    pub use_snapshot_id_checking: bool,
    pub max_items_per_run: u32,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            watch_poll_interval_seconds: 3600,
            watched_artist_album_group: vec!["album".to_string(), "single".to_string()],
            delay_between_playlists_seconds: 2,
            delay_between_artists_seconds: 5,
            use_snapshot_id_checking: true,
            max_items_per_run: 50,
        }
    }
}

/// Root document of `main.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MainConfig {
    pub version: String,
    pub downloads: DownloadConfig,
    pub watch: WatchConfig,
}

impl Default for MainConfig {
    fn default() -> Self {
        Self {
            version: TARGET_VERSION.to_string(),
            downloads: DownloadConfig::default(),
            watch: WatchConfig::default(),
        }
    }
}

/// Raw, legacy-tolerant view of `main.json`'s `watch` block, used only during
/// load to detect and rewrite snake_case keys (spec SPEC_FULL.md §12).
fn migrate_watch_keys(raw: &mut serde_json::Map<String, serde_json::Value>) -> bool {
    let legacy_to_camel: &[(&str, &str)] = &[
        ("watch_poll_interval_seconds", "watchPollIntervalSeconds"),
        ("watched_artist_album_group", "watchedArtistAlbumGroup"),
        (
            "delay_between_playlists_seconds",
            "delayBetweenPlaylistsSeconds",
        ),
        (
            "delay_between_artists_seconds",
            "delayBetweenArtistsSeconds",
        ),
        ("use_snapshot_id_checking", "useSnapshotIdChecking"),
        ("max_tracks_per_run", "maxItemsPerRun"),
        ("max_items_per_run", "maxItemsPerRun"),
    ];

    let mut migrated = false;
    for (legacy, camel) in legacy_to_camel {
        if raw.contains_key(*legacy) && !raw.contains_key(*camel) {
            if let Some(v) = raw.remove(*legacy) {
                raw.insert((*camel).to_string(), v);
                migrated = true;
            }
        }
    }

    if raw.contains_key("maxTracksPerRun") && !raw.contains_key("maxItemsPerRun") {
        if let Some(v) = raw.get("maxTracksPerRun").cloned() {
            raw.insert("maxItemsPerRun".to_string(), v);
            migrated = true;
        }
    }

    if let Some(v) = raw.get("maxItemsPerRun") {
        if let Some(n) = v.as_i64() {
            let clamped = n.clamp(1, 50);
            if clamped != n {
                raw.insert("maxItemsPerRun".to_string(), serde_json::json!(clamped));
                migrated = true;
            }
        }
    }

    migrated
}

/// Load `main.json`, applying legacy-key migration and the 3.3.0→3.3.1
/// version gate, writing the migrated document back to disk when anything
/// changed. Creates a default file (already at the target version) if none
/// exists.
pub fn load_main_config(config_dir: &Path) -> Result<MainConfig> {
    std::fs::create_dir_all(config_dir)
        .map_err(|e| AppError::Configuration(format!("could not create config dir: {e}")))?;
    let path = config_dir.join("main.json");

    if !path.exists() {
        let cfg = MainConfig::default();
        write_main_config(&path, &cfg)?;
        return Ok(cfg);
    }

    let text = std::fs::read_to_string(&path)
        .map_err(|e| AppError::Configuration(format!("could not read {}: {e}", path.display())))?;
    let mut raw: serde_json::Value = serde_json::from_str(&text)?;

    let version = raw
        .get("version")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let version = match version {
        None => {
            return Err(AppError::VersionMismatch {
                found: "<missing>".to_string(),
                expected: vec![REQUIRED_VERSION.to_string(), TARGET_VERSION.to_string()],
            })
        }
        Some(v) => v,
    };

    let mut needs_save = false;
    match version.as_str() {
        v if v == REQUIRED_VERSION => {
            raw["version"] = serde_json::json!(TARGET_VERSION);
            needs_save = true;
        }
        v if v == TARGET_VERSION => {}
        other => {
            return Err(AppError::VersionMismatch {
                found: other.to_string(),
                expected: vec![REQUIRED_VERSION.to_string()],
            })
        }
    }

    if let Some(watch_obj) = raw.get_mut("watch") {
        if let Some(map) = watch_obj.as_object_mut() {
            let watch_defaults = serde_json::to_value(WatchConfig::default())?;
            if let Some(default_map) = watch_defaults.as_object() {
                for (k, v) in default_map {
                    if !map.contains_key(k) {
                        map.insert(k.clone(), v.clone());
                    }
                }
            }
            if migrate_watch_keys(map) {
                needs_save = true;
            }
        }
    } else {
        raw["watch"] = serde_json::to_value(WatchConfig::default())?;
        needs_save = true;
    }

    if raw.get("downloads").is_none() {
        raw["downloads"] = serde_json::to_value(DownloadConfig::default())?;
        needs_save = true;
    }

    let cfg: MainConfig = serde_json::from_value(raw.clone())?;

    if needs_save {
        write_main_config(&path, &cfg)?;
    }

    Ok(cfg)
}

fn write_main_config(path: &Path, cfg: &MainConfig) -> Result<()> {
    let text = serde_json::to_string_pretty(cfg)?;
    std::fs::write(path, text + "\n")
        .map_err(|e| AppError::Configuration(format!("could not write {}: {e}", path.display())))?;
    Ok(())
}

/// Runtime-resolved per-submission parameters: `DownloadConfig` merged with
/// whatever overrides the caller supplied (spec §4.1 step 3).
pub fn resolve_task_parameters(
    base: &DownloadConfig,
    overrides: &HashMap<String, serde_json::Value>,
) -> crate::models::TaskParameters {
    let get_str = |key: &str, default: &str| -> String {
        overrides
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| default.to_string())
    };
    let get_bool = |key: &str, default: bool| -> bool {
        overrides.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
    };

    crate::models::TaskParameters {
        service: get_str("service", &base.service),
        fallback: get_bool("fallback", base.fallback),
        spotify_quality: get_str("spotify_quality", &base.spotify_quality),
        deezer_quality: get_str("deezer_quality", &base.deezer_quality),
        real_time: get_bool("real_time", base.real_time),
        convert_to: overrides
            .get("convert_to")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or_else(|| base.convert_to.clone()),
        bitrate: overrides
            .get("bitrate")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or_else(|| base.bitrate.clone()),
        custom_dir_format: get_str("custom_dir_format", &base.custom_dir_format),
        custom_track_format: get_str("custom_track_format", &base.custom_track_format),
        tracknum_padding: get_bool("tracknum_padding", base.tracknum_padding),
        pad_number_width: overrides
            .get("pad_number_width")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .unwrap_or(base.pad_number_width),
    }
}

/// Resolve the staging directory for in-progress downloads, falling back to
/// `./downloads` when the configured folder cannot be created or written to
/// (spec §6: `incompleteDownloadFolder` ... "if unusable, falls back to
/// `./downloads`").
pub fn resolve_incomplete_download_folder(base: &DownloadConfig) -> std::path::PathBuf {
    let configured = std::path::PathBuf::from(&base.incomplete_download_folder);
    match std::fs::create_dir_all(&configured) {
        Ok(()) => configured,
        Err(_) => std::path::PathBuf::from("./downloads"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_snake_case_watch_keys_migrate_to_camel_case() {
        let mut map = serde_json::Map::new();
        map.insert("max_tracks_per_run".to_string(), serde_json::json!(75));
        let migrated = migrate_watch_keys(&mut map);
        assert!(migrated);
        assert_eq!(map.get("maxItemsPerRun"), Some(&serde_json::json!(50)));
        assert!(!map.contains_key("max_tracks_per_run"));
    }

    #[test]
    fn max_items_per_run_clamps_into_one_to_fifty() {
        let mut map = serde_json::Map::new();
        map.insert("maxItemsPerRun".to_string(), serde_json::json!(0));
        migrate_watch_keys(&mut map);
        assert_eq!(map.get("maxItemsPerRun"), Some(&serde_json::json!(1)));

        let mut map2 = serde_json::Map::new();
        map2.insert("maxItemsPerRun".to_string(), serde_json::json!(999));
        migrate_watch_keys(&mut map2);
        assert_eq!(map2.get("maxItemsPerRun"), Some(&serde_json::json!(50)));
    }

    #[test]
    fn load_main_config_creates_default_at_target_version() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_main_config(dir.path()).unwrap();
        assert_eq!(cfg.version, TARGET_VERSION);
        assert!(dir.path().join("main.json").exists());
    }

    #[test]
    fn load_main_config_bumps_required_version_to_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "version": REQUIRED_VERSION,
                "downloads": DownloadConfig::default(),
                "watch": WatchConfig::default(),
            })
            .to_string(),
        )
        .unwrap();

        let cfg = load_main_config(dir.path()).unwrap();
        assert_eq!(cfg.version, TARGET_VERSION);

        let reloaded: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reloaded["version"], TARGET_VERSION);
    }

    #[test]
    fn load_main_config_rejects_unsupported_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.json");
        std::fs::write(&path, serde_json::json!({"version": "2.0.0"}).to_string()).unwrap();

        let err = load_main_config(dir.path()).unwrap_err();
        match err {
            AppError::VersionMismatch { found, .. } => assert_eq!(found, "2.0.0"),
            other => panic!("wrong error variant: {other:?}"),
        }
    }

    #[test]
    fn resolve_task_parameters_overrides_win_over_base() {
        let base = DownloadConfig::default();
        let mut overrides = HashMap::new();
        overrides.insert("spotify_quality".to_string(), serde_json::json!("LOSSLESS"));
        let params = resolve_task_parameters(&base, &overrides);
        assert_eq!(params.spotify_quality, "LOSSLESS");
        assert_eq!(params.deezer_quality, base.deezer_quality);
        assert_eq!(params.service, base.service);
    }
}
