//! Raw upload handling: extension allowlist, collision-free naming and the
//! atomic write of the client payload into the flat upload root.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::security::secure_filename;

/// Container formats browsers can play back directly.
pub const ALLOWED_EXTENSIONS: [&str; 5] = ["mp4", "webm", "ogg", "mov", "m4v"];

/// Upper bound on `-N` suffixes tried before giving up on a base name.
pub const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Stem used when nothing of the client filename survives sanitization.
const FALLBACK_STEM: &str = "upload";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("no free filename for {base}{ext} after {attempts} attempts")]
    NameExhausted {
        base: String,
        ext: String,
        attempts: u32,
    },
    #[error("io error at {path}: {source}")]
    Io {
        source: io::Error,
        path: PathBuf,
    },
}

/// A raw upload that now lives on disk under a name nobody else holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUpload {
    pub filename: String,
    pub path: PathBuf,
    pub bytes: u64,
}

impl StoredUpload {
    /// The stored name without its extension.
    pub fn stem(&self) -> &str {
        split_base_ext(&self.filename).0
    }
}

/// Text after the last `.`, if any.
fn extension(filename: &str) -> Option<&str> {
    filename.rsplit_once('.').map(|(_, ext)| ext)
}

/// Returns true when `filename` ends in one of [`ALLOWED_EXTENSIONS`],
/// compared case-insensitively. Names without a dot are rejected.
pub fn is_allowed(filename: &str) -> bool {
    extension(filename).is_some_and(|ext| {
        ALLOWED_EXTENSIONS
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(ext))
    })
}

/// Splits like `os.path.splitext`: the extension keeps its dot and a leading
/// dot does not start an extension.
fn split_base_ext(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    }
}

/// Sanitizes a client filename, keeping an allowed extension even when the
/// stem sanitizes away entirely (`éé.mp4` becomes `upload.mp4`).
pub fn sanitized_name(raw: &str) -> String {
    let name = secure_filename(raw);
    if let Some(ext) = extension(raw).filter(|_| is_allowed(raw)) {
        let kept = extension(&name).is_some_and(|current| current.eq_ignore_ascii_case(ext));
        if !kept {
            let raw_stem = &raw[..raw.len() - ext.len() - 1];
            let stem = secure_filename(raw_stem);
            let stem = if stem.is_empty() { FALLBACK_STEM } else { stem.as_str() };
            return format!("{stem}.{}", ext.to_ascii_lowercase());
        }
    }
    if name.is_empty() {
        FALLBACK_STEM.to_owned()
    } else {
        name
    }
}

fn candidate(base: &str, ext: &str, attempt: u32) -> String {
    if attempt == 0 {
        format!("{base}{ext}")
    } else {
        format!("{base}-{attempt}{ext}")
    }
}

/// Picks the first of `base.ext`, `base-1.ext`, `base-2.ext`, … that does not
/// exist in `target_dir`.
///
/// The name is only free at the moment of the check. Writers that must not
/// race each other should use [`store_upload`], which reserves atomically.
pub fn reserve_name(raw: &str, target_dir: &Path) -> Result<String, UploadError> {
    let name = sanitized_name(raw);
    let (base, ext) = split_base_ext(&name);
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let candidate = candidate(base, ext, attempt);
        let path = target_dir.join(&candidate);
        let taken = path
            .try_exists()
            .map_err(|source| UploadError::Io { source, path })?;
        if !taken {
            return Ok(candidate);
        }
    }
    Err(UploadError::NameExhausted {
        base: base.to_owned(),
        ext: ext.to_owned(),
        attempts: MAX_NAME_ATTEMPTS,
    })
}

/// Creates the first free `base[-N].ext` in `target_dir` with exclusive
/// create semantics, so two concurrent uploads never end up sharing a file.
fn create_unique(name: &str, target_dir: &Path) -> Result<(String, PathBuf, File), UploadError> {
    let (base, ext) = split_base_ext(name);
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let candidate = candidate(base, ext, attempt);
        let path = target_dir.join(&candidate);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((candidate, path, file)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                debug!(name = %candidate, "upload name taken, probing next suffix");
            }
            Err(source) => return Err(UploadError::Io { source, path }),
        }
    }
    Err(UploadError::NameExhausted {
        base: base.to_owned(),
        ext: ext.to_owned(),
        attempts: MAX_NAME_ATTEMPTS,
    })
}

/// Reserves a collision-free name for `raw` in `target_dir` and streams
/// `payload` into it. A failed write removes the partial file.
pub fn store_upload<R: Read>(
    raw: &str,
    target_dir: &Path,
    mut payload: R,
) -> Result<StoredUpload, UploadError> {
    let name = sanitized_name(raw);
    let (filename, path, file) = create_unique(&name, target_dir)?;

    let mut writer = BufWriter::new(file);
    let written = io::copy(&mut payload, &mut writer).and_then(|bytes| {
        writer.flush()?;
        Ok(bytes)
    });

    match written {
        Ok(bytes) => Ok(StoredUpload {
            filename,
            path,
            bytes,
        }),
        Err(source) => {
            drop(writer);
            if let Err(err) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %err, "could not remove partial upload");
            }
            Err(UploadError::Io { source, path })
        }
    }
}

/// Blocking [`Read`] over chunks sent from async code, so a request body can
/// be written by [`store_upload`] on a blocking thread without buffering it
/// whole. An `Err` item fails the read; a closed channel is end of file.
#[derive(Debug)]
pub struct ChunkReader<B> {
    chunks: mpsc::Receiver<io::Result<B>>,
    current: Option<B>,
    offset: usize,
}

/// Creates the sending half and the reader. Must be read outside of async
/// contexts, e.g. from `spawn_blocking`.
pub fn chunk_channel<B>(capacity: usize) -> (mpsc::Sender<io::Result<B>>, ChunkReader<B>) {
    let (sender, chunks) = mpsc::channel(capacity);
    let reader = ChunkReader {
        chunks,
        current: None,
        offset: 0,
    };
    (sender, reader)
}

impl<B: AsRef<[u8]>> Read for ChunkReader<B> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(chunk) = &self.current {
                let rest = &chunk.as_ref()[self.offset..];
                if !rest.is_empty() {
                    let n = rest.len().min(buf.len());
                    buf[..n].copy_from_slice(&rest[..n]);
                    self.offset += n;
                    return Ok(n);
                }
            }
            match self.chunks.blocking_recv() {
                Some(Ok(chunk)) => {
                    self.current = Some(chunk);
                    self.offset = 0;
                }
                Some(Err(err)) => return Err(err),
                None => return Ok(0),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn is_allowed_rejects_missing_or_unknown_extensions() {
        for name in ["movie", "movie.", "movie.avi", "movie.mp4.exe", "mp4", ""] {
            assert!(!is_allowed(name), "{name} should be rejected");
        }
    }

    #[test]
    fn is_allowed_ignores_case() {
        for name in ["Clip.MP4", "a.WebM", "b.ogg", "c.Mov", "d.m4V"] {
            assert!(is_allowed(name), "{name} should be accepted");
        }
    }

    #[test]
    fn sanitized_name_keeps_allowed_extension() {
        assert_eq!(sanitized_name("éé.mp4"), "upload.mp4");
        assert_eq!(sanitized_name("été.mp4"), "t.mp4");
        assert_eq!(sanitized_name("../holiday clip.MOV"), "holiday_clip.MOV");
        assert_eq!(sanitized_name("???"), "upload");
    }

    #[test]
    fn reserve_name_tries_numbered_suffixes() -> anyhow::Result<()> {
        let dir = tempdir()?;
        assert_eq!(reserve_name("movie.mp4", dir.path())?, "movie.mp4");

        fs::write(dir.path().join("movie.mp4"), b"a")?;
        assert_eq!(reserve_name("movie.mp4", dir.path())?, "movie-1.mp4");

        fs::write(dir.path().join("movie-1.mp4"), b"b")?;
        assert_eq!(reserve_name("movie.mp4", dir.path())?, "movie-2.mp4");
        Ok(())
    }

    #[test]
    fn reserve_name_sanitizes_traversal() -> anyhow::Result<()> {
        let dir = tempdir()?;
        assert_eq!(reserve_name("../../etc/clip.webm", dir.path())?, "clip.webm");
        Ok(())
    }

    #[test]
    fn store_upload_never_overwrites_existing_files() -> anyhow::Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("movie.mp4"), b"original")?;

        let stored = store_upload("movie.mp4", dir.path(), &b"second"[..])?;
        assert_eq!(stored.filename, "movie-1.mp4");
        assert_eq!(stored.bytes, 6);
        assert_eq!(stored.stem(), "movie-1");
        assert_eq!(fs::read(dir.path().join("movie.mp4"))?, b"original");
        assert_eq!(fs::read(&stored.path)?, b"second");
        Ok(())
    }

    #[test]
    fn store_upload_hands_out_distinct_names_across_threads() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let root = dir.path().to_path_buf();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let root = root.clone();
                std::thread::spawn(move || {
                    store_upload("race.mp4", &root, format!("payload-{i}").as_bytes())
                })
            })
            .collect();

        let mut names = Vec::new();
        for handle in handles {
            names.push(handle.join().expect("thread panicked")?.filename);
        }
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 8);
        Ok(())
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::other("connection reset"))
        }
    }

    #[test]
    fn store_upload_removes_partial_file_on_error() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let err = store_upload("broken.mp4", dir.path(), FailingReader).unwrap_err();
        assert!(matches!(err, UploadError::Io { .. }));
        assert!(!dir.path().join("broken.mp4").exists());
        Ok(())
    }

    #[test]
    fn chunk_reader_streams_into_store_upload() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (sender, reader) = chunk_channel::<Vec<u8>>(2);
        let root = dir.path().to_path_buf();
        let writer = std::thread::spawn(move || store_upload("streamed.mp4", &root, reader));

        for part in [&b"abc"[..], b"", b"defgh"] {
            sender.blocking_send(Ok(part.to_vec()))?;
        }
        drop(sender);

        let stored = writer.join().expect("writer panicked")?;
        assert_eq!(stored.bytes, 8);
        assert_eq!(fs::read(&stored.path)?, b"abcdefgh");
        Ok(())
    }

    #[test]
    fn chunk_reader_error_aborts_the_upload() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (sender, reader) = chunk_channel::<Vec<u8>>(2);
        let root = dir.path().to_path_buf();
        let writer = std::thread::spawn(move || store_upload("cut.mp4", &root, reader));

        sender.blocking_send(Ok(b"partial".to_vec()))?;
        sender.blocking_send(Err(io::Error::other("client went away")))?;
        drop(sender);

        let err = writer.join().expect("writer panicked").unwrap_err();
        assert!(matches!(err, UploadError::Io { .. }));
        assert!(!dir.path().join("cut.mp4").exists());
        Ok(())
    }
}
