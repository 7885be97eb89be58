//! Video persistence layer.
//!
//! Each row pairs the display metadata shown in listings with the three
//! fields that decide playback: the stored raw filename, an optional external
//! URL and the HLS master playlist path. The playback URL itself is never
//! stored; see [`crate::playback`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PER_PAGE: u32 = 12;
pub const MAX_PER_PAGE: u32 = 50;
pub const DEFAULT_TITLE: &str = "Untitled";
pub const DEFAULT_CREATOR: &str = "Anonymous";

/// Browse categories. Unknown slugs fall back to [`Category::Trending`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[default]
    Trending,
    Gaming,
    Music,
    Film,
}

pub const CATEGORIES: [Category; 4] = [
    Category::Trending,
    Category::Gaming,
    Category::Music,
    Category::Film,
];

impl Category {
    pub fn slug(self) -> &'static str {
        match self {
            Category::Trending => "trending",
            Category::Gaming => "gaming",
            Category::Music => "music",
            Category::Film => "film",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Category::Trending => "Trending",
            Category::Gaming => "Gaming",
            Category::Music => "Music",
            Category::Film => "Film & Animation",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        CATEGORIES
            .into_iter()
            .find(|category| category.slug().eq_ignore_ascii_case(slug.trim()))
    }

    pub fn from_slug_or_default(slug: Option<&str>) -> Self {
        slug.and_then(Self::from_slug).unwrap_or(Category::Trending)
    }
}

/// Row stored in the `videos` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub id: i64,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub category: String,
    pub creator: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumb_url: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub duration: String,
    pub views: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    pub created_at: String,
    /// Name of the raw upload inside the upload root. Written once.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stored_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
    /// Master playlist path relative to the HLS root. Written at most once.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hls_manifest: Option<String>,
}

/// Fields supplied when a video is first inserted.
#[derive(Debug, Clone, Default)]
pub struct NewVideo {
    pub title: String,
    pub description: String,
    pub category: Category,
    pub creator: String,
    pub thumb_url: Option<String>,
    pub user_id: Option<i64>,
    pub stored_filename: Option<String>,
    pub external_url: Option<String>,
    pub hls_manifest: Option<String>,
}

/// Listing filter as accepted by `GET /api/videos`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VideoQuery {
    pub q: Option<String>,
    #[serde(alias = "cat")]
    pub category: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl VideoQuery {
    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn per_page(&self) -> u32 {
        self.per_page
            .unwrap_or(DEFAULT_PER_PAGE)
            .clamp(1, MAX_PER_PAGE)
    }

    fn search_pattern(&self) -> Option<String> {
        let q = self.q.as_deref()?.trim();
        if q.is_empty() {
            return None;
        }
        let escaped = q
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        Some(format!("%{escaped}%"))
    }

    /// Known categories match case-insensitively; anything else is passed
    /// through as-is and matches no row.
    fn category_slug(&self) -> Option<String> {
        let value = self.category.as_deref()?.trim();
        if value.is_empty() {
            return None;
        }
        Some(match Category::from_slug(value) {
            Some(category) => category.slug().to_owned(),
            None => value.to_owned(),
        })
    }
}

/// One page of a listing plus the total number of matches.
#[derive(Debug, Clone, Serialize)]
pub struct VideoPage {
    pub page: u32,
    pub per_page: u32,
    pub total: i64,
    pub items: Vec<VideoRecord>,
}

const VIDEO_COLUMNS: &str = "id, title, description, category, creator, thumb_url, duration, \
     views, user_id, created_at, stored_filename, external_url, hls_manifest";

/// Wrapper around the SQLite connection that performs writes.
#[derive(Debug)]
pub struct MetadataStore {
    conn: Connection,
}

impl MetadataStore {
    /// Opens (and if necessary creates) the SQLite DB and ensures the expected
    /// schema exists. WAL mode keeps readers from blocking the writer.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("opening video DB {}", path.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling WAL mode for video DB")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("setting video DB synchronous mode")?;

        let mut store = Self { conn };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;

        tx.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS videos (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                category TEXT NOT NULL DEFAULT 'trending',
                creator TEXT NOT NULL DEFAULT 'Anonymous',
                thumb_url TEXT,
                duration TEXT NOT NULL DEFAULT '',
                views INTEGER NOT NULL DEFAULT 0,
                user_id INTEGER,
                created_at TEXT NOT NULL,
                stored_filename TEXT,
                external_url TEXT,
                hls_manifest TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_videos_category ON videos(category);
            CREATE INDEX IF NOT EXISTS idx_videos_created ON videos(created_at);
            "#,
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Inserts a new video and returns it as stored.
    pub fn insert_video(&self, video: &NewVideo) -> Result<VideoRecord> {
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        self.conn
            .execute(
                r#"
                INSERT INTO videos (
                    title, description, category, creator, thumb_url, user_id,
                    created_at, stored_filename, external_url, hls_manifest
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    video.title,
                    video.description,
                    video.category.slug(),
                    video.creator,
                    video.thumb_url,
                    video.user_id,
                    created_at,
                    video.stored_filename,
                    video.external_url,
                    video.hls_manifest,
                ],
            )
            .context("inserting video")?;

        let id = self.conn.last_insert_rowid();
        fetch_video(&self.conn, id)?.with_context(|| format!("video {id} vanished after insert"))
    }

    /// Records the HLS manifest for `id`. Returns false when the video does not
    /// exist or already has a manifest; the column is never overwritten.
    pub fn set_hls_manifest(&self, id: i64, manifest: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE videos SET hls_manifest = ?2 WHERE id = ?1 AND hls_manifest IS NULL",
                params![id, manifest],
            )
            .with_context(|| format!("recording HLS manifest for video {id}"))?;
        Ok(changed == 1)
    }

    pub fn increment_views(&self, id: i64) -> Result<()> {
        self.conn
            .execute("UPDATE videos SET views = views + 1 WHERE id = ?1", params![id])
            .with_context(|| format!("incrementing views for video {id}"))?;
        Ok(())
    }

    /// Removes the row and hands it back so the caller can clean up files.
    pub fn delete_video(&mut self, id: i64) -> Result<Option<VideoRecord>> {
        let tx = self.conn.transaction()?;
        let existing = fetch_video(&tx, id)?;
        if existing.is_some() {
            tx.execute("DELETE FROM videos WHERE id = ?1", params![id])
                .with_context(|| format!("deleting video {id}"))?;
        }
        tx.commit()?;
        Ok(existing)
    }
}

/// Lightweight cloneable reader that opens a short-lived connection for each
/// query, so request handlers never contend on the writer connection.
#[derive(Clone, Debug)]
pub struct MetadataReader {
    db_path: PathBuf,
}

impl MetadataReader {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            db_path: path.as_ref().to_path_buf(),
        })
    }

    fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("opening video DB {}", self.db_path.display()))?;
        f(&conn)
    }

    pub fn get_video(&self, id: i64) -> Result<Option<VideoRecord>> {
        self.with_connection(|conn| fetch_video(conn, id))
    }

    /// Newest-first page of videos matching `query`. The search term matches
    /// title or creator, case-insensitively.
    pub fn list_videos(&self, query: &VideoQuery) -> Result<VideoPage> {
        let page = query.page();
        let per_page = query.per_page();
        let pattern = query.search_pattern();
        let category = query.category_slug();
        let offset = i64::from(page - 1) * i64::from(per_page);

        self.with_connection(|conn| {
            const FILTER: &str = r#"
                WHERE (?1 IS NULL OR category = ?1)
                  AND (?2 IS NULL
                       OR title LIKE ?2 ESCAPE '\'
                       OR creator LIKE ?2 ESCAPE '\')
            "#;

            let total: i64 = conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM videos {FILTER}"),
                    params![category, pattern],
                    |row| row.get(0),
                )
                .context("counting videos")?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {VIDEO_COLUMNS} FROM videos {FILTER} \
                 ORDER BY created_at DESC, id DESC LIMIT ?3 OFFSET ?4"
            ))?;
            let mut rows = stmt.query(params![category, pattern, per_page, offset])?;
            let mut items = Vec::new();
            while let Some(row) = rows.next()? {
                items.push(row_to_video(row)?);
            }

            Ok(VideoPage {
                page,
                per_page,
                total,
                items,
            })
        })
    }
}

fn fetch_video(conn: &Connection, id: i64) -> Result<Option<VideoRecord>> {
    let mut stmt = conn.prepare(&format!("SELECT {VIDEO_COLUMNS} FROM videos WHERE id = ?1"))?;
    let record = stmt
        .query_row(params![id], |row| Ok(row_to_video(row)))
        .optional()
        .with_context(|| format!("loading video {id}"))?;
    record.transpose()
}

fn row_to_video(row: &Row<'_>) -> Result<VideoRecord> {
    Ok(VideoRecord {
        id: row.get("id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        category: row.get("category")?,
        creator: row.get("creator")?,
        thumb_url: row.get("thumb_url")?,
        duration: row.get("duration")?,
        views: row.get("views")?,
        user_id: row.get("user_id")?,
        created_at: row.get("created_at")?,
        stored_filename: row.get("stored_filename")?,
        external_url: row.get("external_url")?,
        hls_manifest: row.get("hls_manifest")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_video(title: &str, category: Category, creator: &str) -> NewVideo {
        NewVideo {
            title: title.into(),
            category,
            creator: creator.into(),
            stored_filename: Some(format!("{}.mp4", title.to_lowercase())),
            ..NewVideo::default()
        }
    }

    fn open_store() -> Result<(tempfile::TempDir, MetadataStore, MetadataReader)> {
        let dir = tempdir()?;
        let db_path = dir.path().join("db").join("ashn.db");
        let store = MetadataStore::open(&db_path)?;
        let reader = MetadataReader::new(&db_path)?;
        Ok((dir, store, reader))
    }

    #[test]
    fn insert_and_fetch_round_trip() -> Result<()> {
        let (_dir, store, reader) = open_store()?;
        let inserted = store.insert_video(&new_video("Sunset", Category::Film, "ana"))?;
        assert!(inserted.id > 0);
        assert_eq!(inserted.category, "film");
        assert_eq!(inserted.views, 0);
        assert!(inserted.hls_manifest.is_none());

        let fetched = reader.get_video(inserted.id)?.expect("video stored");
        assert_eq!(fetched, inserted);
        assert!(reader.get_video(inserted.id + 100)?.is_none());
        Ok(())
    }

    #[test]
    fn hls_manifest_is_written_at_most_once() -> Result<()> {
        let (_dir, store, reader) = open_store()?;
        let video = store.insert_video(&new_video("Clip", Category::Music, "bo"))?;

        assert!(store.set_hls_manifest(video.id, "video_1/master.m3u8")?);
        assert!(!store.set_hls_manifest(video.id, "video_2/master.m3u8")?);
        assert!(!store.set_hls_manifest(video.id + 1, "video_3/master.m3u8")?);

        let stored = reader.get_video(video.id)?.unwrap();
        assert_eq!(stored.hls_manifest.as_deref(), Some("video_1/master.m3u8"));
        Ok(())
    }

    #[test]
    fn list_videos_filters_searches_and_paginates() -> Result<()> {
        let (_dir, store, reader) = open_store()?;
        for i in 0..5 {
            store.insert_video(&new_video(&format!("Speedrun{i}"), Category::Gaming, "zed"))?;
        }
        store.insert_video(&new_video("Concert", Category::Music, "Speedy Sam"))?;
        store.insert_video(&new_video("100%_real", Category::Music, "eve"))?;

        let gaming = reader.list_videos(&VideoQuery {
            category: Some("gaming".into()),
            per_page: Some(2),
            page: Some(2),
            ..VideoQuery::default()
        })?;
        assert_eq!(gaming.total, 5);
        assert_eq!(gaming.items.len(), 2);
        assert_eq!(gaming.page, 2);
        assert_eq!(gaming.items[0].title, "Speedrun2");

        let search = reader.list_videos(&VideoQuery {
            q: Some("SPEED".into()),
            ..VideoQuery::default()
        })?;
        assert_eq!(search.total, 6);
        assert_eq!(search.items[0].title, "Concert");

        let literal = reader.list_videos(&VideoQuery {
            q: Some("%_".into()),
            ..VideoQuery::default()
        })?;
        assert_eq!(literal.total, 1);
        assert_eq!(literal.items[0].title, "100%_real");

        let upper = reader.list_videos(&VideoQuery {
            category: Some("MUSIC".into()),
            ..VideoQuery::default()
        })?;
        assert_eq!(upper.total, 2);
        Ok(())
    }

    #[test]
    fn list_videos_unknown_category_matches_nothing() -> Result<()> {
        let (_dir, store, reader) = open_store()?;
        store.insert_video(&new_video("Default", Category::Trending, "ana"))?;

        let unknown = reader.list_videos(&VideoQuery {
            category: Some("cooking".into()),
            ..VideoQuery::default()
        })?;
        assert_eq!(unknown.total, 0);
        assert!(unknown.items.is_empty());

        let blank = reader.list_videos(&VideoQuery {
            category: Some("  ".into()),
            ..VideoQuery::default()
        })?;
        assert_eq!(blank.total, 1);
        Ok(())
    }

    #[test]
    fn video_query_clamps_pagination() {
        let query = VideoQuery {
            page: Some(0),
            per_page: Some(500),
            ..VideoQuery::default()
        };
        assert_eq!(query.page(), 1);
        assert_eq!(query.per_page(), MAX_PER_PAGE);
        assert_eq!(VideoQuery::default().per_page(), DEFAULT_PER_PAGE);
        let tiny = VideoQuery {
            per_page: Some(0),
            ..VideoQuery::default()
        };
        assert_eq!(tiny.per_page(), 1);
    }

    #[test]
    fn delete_returns_removed_row_and_views_increment() -> Result<()> {
        let (_dir, mut store, reader) = open_store()?;
        let video = store.insert_video(&new_video("Gone", Category::Trending, "kai"))?;
        store.increment_views(video.id)?;
        store.increment_views(video.id)?;
        assert_eq!(reader.get_video(video.id)?.unwrap().views, 2);

        let removed = store.delete_video(video.id)?.expect("row existed");
        assert_eq!(removed.stored_filename.as_deref(), Some("gone.mp4"));
        assert!(reader.get_video(video.id)?.is_none());
        assert!(store.delete_video(video.id)?.is_none());
        Ok(())
    }

    #[test]
    fn category_parsing_falls_back_to_trending() {
        assert_eq!(Category::from_slug("MUSIC"), Some(Category::Music));
        assert_eq!(Category::from_slug_or_default(Some("cooking")), Category::Trending);
        assert_eq!(Category::from_slug_or_default(None), Category::Trending);
        assert_eq!(Category::Film.label(), "Film & Animation");
    }
}
