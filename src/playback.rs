//! Playback URL resolution for stored videos.
//!
//! The URL is derived on every read instead of being persisted, because the
//! route prefixes belong to the deployment and may change between requests.

use crate::metadata::VideoRecord;

pub const DEFAULT_MEDIA_ROUTE: &str = "/media";
pub const DEFAULT_HLS_ROUTE: &str = "/hls";

/// Route prefixes under which the two asset roots are served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackRoutes {
    /// Serves files from the raw upload root.
    pub media: String,
    /// Serves files from the HLS root.
    pub hls: String,
}

impl Default for PlaybackRoutes {
    fn default() -> Self {
        Self {
            media: DEFAULT_MEDIA_ROUTE.to_owned(),
            hls: DEFAULT_HLS_ROUTE.to_owned(),
        }
    }
}

fn join_route(prefix: &str, relative: &str) -> String {
    format!(
        "{}/{}",
        prefix.trim_end_matches('/'),
        relative.trim_start_matches('/')
    )
}

/// Picks the URL a client should play: the HLS master playlist if one was
/// produced, else the raw upload, else the external URL, else `""`.
pub fn resolve_url(record: &VideoRecord, routes: &PlaybackRoutes) -> String {
    if let Some(manifest) = record.hls_manifest.as_deref().filter(|m| !m.is_empty()) {
        return join_route(&routes.hls, manifest);
    }
    if let Some(filename) = record.stored_filename.as_deref().filter(|f| !f.is_empty()) {
        return join_route(&routes.media, filename);
    }
    record.external_url.clone().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(manifest: Option<&str>, stored: Option<&str>, external: Option<&str>) -> VideoRecord {
        VideoRecord {
            hls_manifest: manifest.map(str::to_owned),
            stored_filename: stored.map(str::to_owned),
            external_url: external.map(str::to_owned),
            ..VideoRecord::default()
        }
    }

    #[test]
    fn manifest_wins_over_raw_file() {
        let routes = PlaybackRoutes::default();
        let video = record(Some("abc/master.m3u8"), Some("raw.mp4"), None);
        assert_eq!(resolve_url(&video, &routes), "/hls/abc/master.m3u8");
    }

    #[test]
    fn raw_file_wins_over_external_url() {
        let routes = PlaybackRoutes::default();
        let video = record(None, Some("raw.mp4"), Some("https://example.com/x.mp4"));
        assert_eq!(resolve_url(&video, &routes), "/media/raw.mp4");
    }

    #[test]
    fn external_url_is_returned_unchanged() {
        let routes = PlaybackRoutes::default();
        let video = record(None, None, Some("https://example.com/x.mp4"));
        assert_eq!(resolve_url(&video, &routes), "https://example.com/x.mp4");
    }

    #[test]
    fn nothing_playable_resolves_to_empty() {
        assert_eq!(resolve_url(&record(None, None, None), &PlaybackRoutes::default()), "");
    }

    #[test]
    fn resolution_is_repeatable_and_honors_prefixes() {
        let routes = PlaybackRoutes {
            media: "/cdn/media/".into(),
            hls: "https://streams.example.com/hls".into(),
        };
        let video = record(Some("video_1/master.m3u8"), Some("raw.mp4"), None);
        let first = resolve_url(&video, &routes);
        assert_eq!(first, "https://streams.example.com/hls/video_1/master.m3u8");
        assert_eq!(resolve_url(&video, &routes), first);

        let raw = record(None, Some("raw.mp4"), None);
        assert_eq!(resolve_url(&raw, &routes), "/cdn/media/raw.mp4");
    }
}
