//! Persistence for the watch subsystem: `watched_playlists`/`watched_artists`
//! plus dynamically-named per-item child tables holding the tracks/albums WE
//! has already seen (spec §3, §4.8). Schema here is fixed at creation time
//! rather than evolved column-by-column like HS, since these tables are new
//! to this service rather than inherited from an older on-disk layout; the
//! `CREATE TABLE IF NOT EXISTS` + child-table pattern is still grounded in
//! [`crate::services::history_store::HistoryStore`].
//!
//! Child tables are named `playlist_tracks_{slug}`/`artist_albums_{slug}`,
//! deliberately distinct from HS's `album_*`/`playlist_*` prefixes so the two
//! stores can share one SQLite file without colliding on the same database
//! (see DESIGN.md).

use sqlx::SqlitePool;

use crate::error::{AppError, Result};
use crate::models::{ArtistAlbum, PlaylistTrack, WatchedArtist, WatchedItem, WatchedPlaylist};

pub struct WatchStore {
    pool: SqlitePool,
}

impl WatchStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS watched_playlists (
                spotify_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                owner_id TEXT,
                owner_name TEXT,
                total_tracks INTEGER NOT NULL DEFAULT 0,
                snapshot_id TEXT,
                batch_next_offset INTEGER NOT NULL DEFAULT 0,
                batch_processing_snapshot_id TEXT,
                last_checked TEXT,
                added_at TEXT NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT 1
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS watched_artists (
                spotify_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                total_albums_on_spotify INTEGER NOT NULL DEFAULT 0,
                batch_next_offset INTEGER NOT NULL DEFAULT 0,
                last_checked TEXT,
                added_at TEXT NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT 1
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub fn playlist_tracks_table(spotify_id: &str) -> String {
        let slug: String = spotify_id.chars().filter(|c| c.is_ascii_alphanumeric()).take(16).collect();
        format!("playlist_tracks_{slug}")
    }

    pub fn artist_albums_table(spotify_id: &str) -> String {
        let slug: String = spotify_id.chars().filter(|c| c.is_ascii_alphanumeric()).take(16).collect();
        format!("artist_albums_{slug}")
    }

    pub async fn ensure_playlist_tracks_table(&self, table_name: &str) -> Result<()> {
        validate_table_name(table_name)?;
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS {table_name} (
                spotify_track_id TEXT PRIMARY KEY,
                title TEXT,
                artists TEXT,
                album TEXT,
                track_number INTEGER,
                duration_ms INTEGER,
                added_at_playlist TEXT,
                added_to_db TEXT NOT NULL,
                is_present_in_spotify BOOLEAN NOT NULL DEFAULT 1,
                last_seen_in_spotify TEXT,
                snapshot_id TEXT,
                final_path TEXT
            )"#
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn ensure_artist_albums_table(&self, table_name: &str) -> Result<()> {
        validate_table_name(table_name)?;
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS {table_name} (
                album_spotify_id TEXT PRIMARY KEY,
                name TEXT,
                artists TEXT,
                added_to_db TEXT NOT NULL,
                last_seen_on_spotify TEXT,
                download_task_id TEXT,
                download_status INTEGER NOT NULL DEFAULT 0,
                is_fully_downloaded_managed_by_app BOOLEAN NOT NULL DEFAULT 0
            )"#
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_watched_playlist(&self, playlist: &WatchedPlaylist) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO watched_playlists
                (spotify_id, name, owner_id, owner_name, total_tracks, snapshot_id,
                 batch_next_offset, batch_processing_snapshot_id, last_checked, added_at, is_active)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(spotify_id) DO UPDATE SET
                name = excluded.name, owner_id = excluded.owner_id, owner_name = excluded.owner_name,
                total_tracks = excluded.total_tracks, snapshot_id = excluded.snapshot_id,
                batch_next_offset = excluded.batch_next_offset,
                batch_processing_snapshot_id = excluded.batch_processing_snapshot_id,
                last_checked = excluded.last_checked, is_active = excluded.is_active"#,
        )
        .bind(&playlist.spotify_id)
        .bind(&playlist.name)
        .bind(&playlist.owner_id)
        .bind(&playlist.owner_name)
        .bind(playlist.total_tracks)
        .bind(&playlist.snapshot_id)
        .bind(playlist.batch_next_offset)
        .bind(&playlist.batch_processing_snapshot_id)
        .bind(playlist.last_checked.map(|t| t.to_rfc3339()))
        .bind(playlist.added_at.to_rfc3339())
        .bind(playlist.is_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_watched_playlist(&self, spotify_id: &str) -> Result<Option<WatchedPlaylist>> {
        let row = sqlx::query_as::<_, WatchedPlaylist>(
            "SELECT spotify_id, name, owner_id, owner_name, total_tracks, snapshot_id, \
             batch_next_offset, batch_processing_snapshot_id, last_checked, added_at, is_active \
             FROM watched_playlists WHERE spotify_id = ?",
        )
        .bind(spotify_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_watched_playlists(&self) -> Result<Vec<WatchedPlaylist>> {
        let rows = sqlx::query_as::<_, WatchedPlaylist>(
            "SELECT spotify_id, name, owner_id, owner_name, total_tracks, snapshot_id, \
             batch_next_offset, batch_processing_snapshot_id, last_checked, added_at, is_active \
             FROM watched_playlists WHERE is_active = 1 ORDER BY added_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn upsert_watched_artist(&self, artist: &WatchedArtist) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO watched_artists
                (spotify_id, name, total_albums_on_spotify, batch_next_offset, last_checked, added_at, is_active)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(spotify_id) DO UPDATE SET
                name = excluded.name, total_albums_on_spotify = excluded.total_albums_on_spotify,
                batch_next_offset = excluded.batch_next_offset, last_checked = excluded.last_checked,
                is_active = excluded.is_active"#,
        )
        .bind(&artist.spotify_id)
        .bind(&artist.name)
        .bind(artist.total_albums_on_spotify)
        .bind(artist.batch_next_offset)
        .bind(artist.last_checked.map(|t| t.to_rfc3339()))
        .bind(artist.added_at.to_rfc3339())
        .bind(artist.is_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_watched_artist(&self, spotify_id: &str) -> Result<Option<WatchedArtist>> {
        let row = sqlx::query_as::<_, WatchedArtist>(
            "SELECT spotify_id, name, total_albums_on_spotify, batch_next_offset, last_checked, added_at, is_active \
             FROM watched_artists WHERE spotify_id = ?",
        )
        .bind(spotify_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_watched_artists(&self) -> Result<Vec<WatchedArtist>> {
        let rows = sqlx::query_as::<_, WatchedArtist>(
            "SELECT spotify_id, name, total_albums_on_spotify, batch_next_offset, last_checked, added_at, is_active \
             FROM watched_artists WHERE is_active = 1 ORDER BY added_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Stable round-robin order: playlists first, then artists, each sorted
    /// by `added_at` (spec §4.8: "exactly one watched item in round-robin
    /// order").
    pub async fn round_robin_items(&self) -> Result<Vec<WatchedItem>> {
        let mut items: Vec<WatchedItem> = self
            .list_watched_playlists()
            .await?
            .into_iter()
            .map(|p| WatchedItem::Playlist(p.spotify_id))
            .collect();
        items.extend(
            self.list_watched_artists()
                .await?
                .into_iter()
                .map(|a| WatchedItem::Artist(a.spotify_id)),
        );
        Ok(items)
    }

    pub async fn upsert_playlist_track(&self, table_name: &str, track: &PlaylistTrack) -> Result<()> {
        validate_table_name(table_name)?;
        sqlx::query(&format!(
            r#"INSERT INTO {table_name}
                (spotify_track_id, title, artists, album, track_number, duration_ms,
                 added_at_playlist, added_to_db, is_present_in_spotify, last_seen_in_spotify,
                 snapshot_id, final_path)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(spotify_track_id) DO UPDATE SET
                title = excluded.title, artists = excluded.artists, album = excluded.album,
                track_number = excluded.track_number, duration_ms = excluded.duration_ms,
                is_present_in_spotify = excluded.is_present_in_spotify,
                last_seen_in_spotify = excluded.last_seen_in_spotify,
                snapshot_id = excluded.snapshot_id,
                final_path = COALESCE(excluded.final_path, {table_name}.final_path)"#
        ))
        .bind(&track.spotify_track_id)
        .bind(&track.title)
        .bind(&track.artists)
        .bind(&track.album)
        .bind(track.track_number)
        .bind(track.duration_ms)
        .bind(track.added_at_playlist.map(|t| t.to_rfc3339()))
        .bind(track.added_to_db.to_rfc3339())
        .bind(track.is_present_in_spotify)
        .bind(track.last_seen_in_spotify.map(|t| t.to_rfc3339()))
        .bind(&track.snapshot_id)
        .bind(&track.final_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_playlist_tracks(&self, table_name: &str) -> Result<Vec<PlaylistTrack>> {
        validate_table_name(table_name)?;
        let rows = sqlx::query_as::<_, PlaylistTrack>(&format!(
            "SELECT spotify_track_id, title, artists, album, track_number, duration_ms, \
             added_at_playlist, added_to_db, is_present_in_spotify, last_seen_in_spotify, \
             snapshot_id, final_path FROM {table_name} ORDER BY track_number"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Marks every track row not present in `seen_track_ids` as no longer
    /// present in Spotify, without deleting it — local history for a track
    /// dropped from the playlist is kept (spec §8: "total_tracks decreased").
    pub async fn mark_tracks_not_present(&self, table_name: &str, seen_track_ids: &[String]) -> Result<()> {
        validate_table_name(table_name)?;
        if seen_track_ids.is_empty() {
            sqlx::query(&format!("UPDATE {table_name} SET is_present_in_spotify = 0"))
                .execute(&self.pool)
                .await?;
            return Ok(());
        }
        let placeholders = seen_track_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "UPDATE {table_name} SET is_present_in_spotify = 0 WHERE spotify_track_id NOT IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql);
        for id in seen_track_ids {
            query = query.bind(id);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    pub async fn set_track_final_path(&self, table_name: &str, spotify_track_id: &str, final_path: &str) -> Result<()> {
        validate_table_name(table_name)?;
        sqlx::query(&format!("UPDATE {table_name} SET final_path = ? WHERE spotify_track_id = ?"))
            .bind(final_path)
            .bind(spotify_track_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn upsert_artist_album(&self, table_name: &str, album: &ArtistAlbum) -> Result<()> {
        validate_table_name(table_name)?;
        sqlx::query(&format!(
            r#"INSERT INTO {table_name}
                (album_spotify_id, name, artists, added_to_db, last_seen_on_spotify,
                 download_task_id, download_status, is_fully_downloaded_managed_by_app)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(album_spotify_id) DO UPDATE SET
                name = excluded.name, artists = excluded.artists,
                last_seen_on_spotify = excluded.last_seen_on_spotify,
                download_task_id = excluded.download_task_id,
                download_status = excluded.download_status,
                is_fully_downloaded_managed_by_app = excluded.is_fully_downloaded_managed_by_app"#
        ))
        .bind(&album.album_spotify_id)
        .bind(&album.name)
        .bind(&album.artists)
        .bind(album.added_to_db.to_rfc3339())
        .bind(album.last_seen_on_spotify.map(|t| t.to_rfc3339()))
        .bind(&album.download_task_id)
        .bind(album.download_status)
        .bind(album.is_fully_downloaded_managed_by_app)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_artist_album(&self, table_name: &str, album_spotify_id: &str) -> Result<Option<ArtistAlbum>> {
        validate_table_name(table_name)?;
        let row = sqlx::query_as::<_, ArtistAlbum>(&format!(
            "SELECT album_spotify_id, name, artists, added_to_db, last_seen_on_spotify, \
             download_task_id, download_status, is_fully_downloaded_managed_by_app \
             FROM {table_name} WHERE album_spotify_id = ?"
        ))
        .bind(album_spotify_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_artist_albums(&self, table_name: &str) -> Result<Vec<ArtistAlbum>> {
        validate_table_name(table_name)?;
        let rows = sqlx::query_as::<_, ArtistAlbum>(&format!(
            "SELECT album_spotify_id, name, artists, added_to_db, last_seen_on_spotify, \
             download_task_id, download_status, is_fully_downloaded_managed_by_app \
             FROM {table_name} ORDER BY added_to_db"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

fn validate_table_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.chars().next().map(|c| c.is_ascii_alphabetic()).unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(AppError::Configuration(format!("invalid table name: {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn memory_store() -> WatchStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = WatchStore::new(pool);
        store.ensure_schema().await.unwrap();
        store
    }

    fn sample_playlist(id: &str) -> WatchedPlaylist {
        WatchedPlaylist {
            spotify_id: id.to_string(),
            name: "Mix".to_string(),
            owner_id: Some("owner".to_string()),
            owner_name: None,
            total_tracks: 3,
            snapshot_id: Some("snap1".to_string()),
            batch_next_offset: 0,
            batch_processing_snapshot_id: None,
            last_checked: None,
            added_at: Utc::now(),
            is_active: true,
        }
    }

    #[tokio::test]
    async fn upsert_then_get_playlist_round_trips() {
        let store = memory_store().await;
        store.upsert_watched_playlist(&sample_playlist("p1")).await.unwrap();

        let fetched = store.get_watched_playlist("p1").await.unwrap().unwrap();
        assert_eq!(fetched.name, "Mix");
        assert_eq!(fetched.total_tracks, 3);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_spotify_id() {
        let store = memory_store().await;
        store.upsert_watched_playlist(&sample_playlist("p1")).await.unwrap();
        let mut updated = sample_playlist("p1");
        updated.total_tracks = 7;
        store.upsert_watched_playlist(&updated).await.unwrap();

        let all = store.list_watched_playlists().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].total_tracks, 7);
    }

    #[tokio::test]
    async fn round_robin_items_lists_playlists_then_artists() {
        let store = memory_store().await;
        store.upsert_watched_playlist(&sample_playlist("p1")).await.unwrap();
        store
            .upsert_watched_artist(&WatchedArtist {
                spotify_id: "a1".to_string(),
                name: "Artist".to_string(),
                total_albums_on_spotify: 0,
                batch_next_offset: 0,
                last_checked: None,
                added_at: Utc::now(),
                is_active: true,
            })
            .await
            .unwrap();

        let items = store.round_robin_items().await.unwrap();
        assert_eq!(items, vec![WatchedItem::Playlist("p1".to_string()), WatchedItem::Artist("a1".to_string())]);
    }

    #[tokio::test]
    async fn playlist_track_child_table_round_trips_and_marks_absent() {
        let store = memory_store().await;
        let table = WatchStore::playlist_tracks_table("p1");
        store.ensure_playlist_tracks_table(&table).await.unwrap();

        store
            .upsert_playlist_track(
                &table,
                &PlaylistTrack {
                    spotify_track_id: "t1".to_string(),
                    title: Some("Song".to_string()),
                    artists: Some("Artist".to_string()),
                    album: None,
                    track_number: Some(1),
                    duration_ms: Some(200_000),
                    added_at_playlist: None,
                    added_to_db: Utc::now(),
                    is_present_in_spotify: true,
                    last_seen_in_spotify: None,
                    snapshot_id: Some("snap1".to_string()),
                    final_path: None,
                },
            )
            .await
            .unwrap();

        store.mark_tracks_not_present(&table, &[]).await.unwrap();
        let rows = store.list_playlist_tracks(&table).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].is_present_in_spotify);
    }

    #[tokio::test]
    async fn artist_albums_child_table_round_trips() {
        let store = memory_store().await;
        let table = WatchStore::artist_albums_table("a1");
        store.ensure_artist_albums_table(&table).await.unwrap();

        store
            .upsert_artist_album(
                &table,
                &ArtistAlbum {
                    album_spotify_id: "al1".to_string(),
                    name: Some("Album".to_string()),
                    artists: Some("Artist".to_string()),
                    added_to_db: Utc::now(),
                    last_seen_on_spotify: None,
                    download_task_id: None,
                    download_status: 0,
                    is_fully_downloaded_managed_by_app: false,
                },
            )
            .await
            .unwrap();

        let albums = store.list_artist_albums(&table).await.unwrap();
        assert_eq!(albums.len(), 1);
        assert_eq!(albums[0].album_spotify_id, "al1");
    }

    #[tokio::test]
    async fn rejects_malformed_table_names() {
        let store = memory_store().await;
        let err = store.ensure_playlist_tracks_table("p1; DROP TABLE x").await.unwrap_err();
        assert!(matches!(err, AppError::Configuration(_)));
    }
}
