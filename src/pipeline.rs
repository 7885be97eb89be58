//! Upload ingestion: the policy that ties validation, raw storage, the HLS
//! driver and the video store together.
//!
//! Only problems before or during the raw write abort an upload. Everything
//! that goes wrong on the transcode path becomes a warning and the video
//! stays playable from its original file.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{error, info, warn};

use crate::config::RuntimePaths;
use crate::encoder::{Encoder, allocate_output_dir};
use crate::metadata::{
    Category, DEFAULT_CREATOR, DEFAULT_TITLE, MetadataStore, NewVideo, VideoRecord,
};
use crate::security::resolve_within;
use crate::upload::{StoredUpload, UploadError, is_allowed, store_upload};

/// The two roots the pipeline writes into.
#[derive(Debug, Clone)]
pub struct MediaPaths {
    pub upload_root: PathBuf,
    pub hls_root: PathBuf,
}

impl MediaPaths {
    pub fn new(upload_root: impl Into<PathBuf>, hls_root: impl Into<PathBuf>) -> Self {
        Self {
            upload_root: upload_root.into(),
            hls_root: hls_root.into(),
        }
    }
}

impl From<&RuntimePaths> for MediaPaths {
    fn from(runtime: &RuntimePaths) -> Self {
        Self::new(&runtime.upload_root, &runtime.hls_root)
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("no file received")]
    MissingFile,
    #[error("unsupported file extension: {0}")]
    UnsupportedExtension(String),
    #[error(transparent)]
    Storage(#[from] UploadError),
    #[error("could not save video record: {0:#}")]
    Persist(anyhow::Error),
}

/// Descriptive fields sent alongside the file.
#[derive(Debug, Clone, Default)]
pub struct UploadMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub creator: Option<String>,
    pub external_url: Option<String>,
    pub user_id: Option<i64>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

impl UploadMetadata {
    /// Normalizes the form fields into an insertable row for `stored`.
    pub fn into_new_video(self, stored: &StoredUpload, hls_manifest: Option<String>) -> NewVideo {
        NewVideo {
            title: non_empty(self.title).unwrap_or_else(|| DEFAULT_TITLE.to_owned()),
            description: non_empty(self.description).unwrap_or_default(),
            category: Category::from_slug_or_default(self.category.as_deref()),
            creator: non_empty(self.creator).unwrap_or_else(|| DEFAULT_CREATOR.to_owned()),
            thumb_url: Some(format!(
                "https://picsum.photos/seed/ashn-{}/640/360",
                stored.stem()
            )),
            user_id: self.user_id,
            stored_filename: Some(stored.filename.clone()),
            external_url: non_empty(self.external_url),
            hls_manifest,
        }
    }
}

/// Everything the HTTP layer hands over for one upload.
#[derive(Debug)]
pub struct UploadRequest<R> {
    pub filename: String,
    pub payload: R,
    pub to_hls: bool,
    pub metadata: UploadMetadata,
}

/// Why no transcode was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotRequested,
    EncoderUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscodeOutcome {
    Skipped(SkipReason),
    /// Master playlist path relative to the HLS root.
    Ready(String),
    /// User-facing warning; the raw upload remains the playback source.
    Failed(String),
}

impl TranscodeOutcome {
    pub fn manifest(&self) -> Option<&str> {
        match self {
            TranscodeOutcome::Ready(manifest) => Some(manifest),
            _ => None,
        }
    }

    pub fn warning(&self) -> Option<&str> {
        match self {
            TranscodeOutcome::Failed(warning) => Some(warning),
            _ => None,
        }
    }
}

/// Validates the client filename and writes the payload under a fresh name in
/// the upload root. Nothing touches the disk for a rejected extension.
pub fn accept_upload<R: Read>(
    paths: &MediaPaths,
    filename: &str,
    payload: R,
) -> Result<StoredUpload, IngestError> {
    if filename.trim().is_empty() {
        return Err(IngestError::MissingFile);
    }
    if !is_allowed(filename) {
        return Err(IngestError::UnsupportedExtension(filename.to_owned()));
    }

    fs::create_dir_all(&paths.upload_root).map_err(|source| UploadError::Io {
        source,
        path: paths.upload_root.clone(),
    })?;
    let stored = store_upload(filename, &paths.upload_root, payload)?;
    info!(
        filename = %stored.filename,
        bytes = stored.bytes,
        "stored raw upload"
    );
    Ok(stored)
}

fn remove_partial_output(dir: &Path) {
    if let Err(err) = fs::remove_dir_all(dir) {
        warn!(dir = %dir.display(), error = %err, "could not remove failed HLS output");
    }
}

/// Runs the HLS driver when it was asked for and the encoder is installed.
/// Never fails: driver errors come back as [`TranscodeOutcome::Failed`].
pub fn run_transcode(
    encoder: &Encoder,
    paths: &MediaPaths,
    stored: &StoredUpload,
    requested: bool,
) -> TranscodeOutcome {
    if !requested {
        return TranscodeOutcome::Skipped(SkipReason::NotRequested);
    }
    if !encoder.is_available() {
        info!(
            encoder = %encoder.program().display(),
            "encoder not installed; keeping direct playback"
        );
        return TranscodeOutcome::Skipped(SkipReason::EncoderUnavailable);
    }

    let output_dir = match allocate_output_dir(&paths.hls_root) {
        Ok(dir) => dir,
        Err(err) => {
            warn!(error = %err, "could not prepare HLS output directory");
            return TranscodeOutcome::Failed(format!(
                "HLS transcoding failed ({err}); the original upload is used for playback"
            ));
        }
    };

    match encoder.transcode(&stored.path, &output_dir, &paths.hls_root) {
        Ok(manifest) => TranscodeOutcome::Ready(manifest),
        Err(err) => {
            warn!(
                filename = %stored.filename,
                error = %err,
                "HLS transcode failed; falling back to the raw upload"
            );
            remove_partial_output(&output_dir);
            TranscodeOutcome::Failed(
                "HLS transcoding failed; the original upload is used for playback".to_owned(),
            )
        }
    }
}

/// Result of a finished upload: the stored row plus non-fatal warnings.
#[derive(Debug, Clone)]
pub struct Ingested {
    pub record: VideoRecord,
    pub outcome: TranscodeOutcome,
    pub warnings: Vec<String>,
}

/// Synchronous upload path: store the file, transcode inline if requested,
/// then insert the row with whatever manifest the transcode produced. The
/// store is only locked for the insert.
pub fn ingest_upload<R: Read>(
    store: &Mutex<MetadataStore>,
    encoder: &Encoder,
    paths: &MediaPaths,
    request: UploadRequest<R>,
) -> Result<Ingested, IngestError> {
    let stored = accept_upload(paths, &request.filename, request.payload)?;
    ingest_stored(
        store,
        encoder,
        paths,
        stored,
        request.to_hls,
        request.metadata,
    )
}

/// Inline path for a file that is already on disk. If the row cannot be
/// written, the raw file and any HLS output are removed again.
pub fn ingest_stored(
    store: &Mutex<MetadataStore>,
    encoder: &Encoder,
    paths: &MediaPaths,
    stored: StoredUpload,
    to_hls: bool,
    metadata: UploadMetadata,
) -> Result<Ingested, IngestError> {
    let outcome = run_transcode(encoder, paths, &stored, to_hls);

    let new_video = metadata.into_new_video(&stored, outcome.manifest().map(str::to_owned));
    let inserted = store.lock().insert_video(&new_video);
    let record = match inserted {
        Ok(record) => record,
        Err(err) => {
            discard_upload(&stored);
            if let Some(manifest) = outcome.manifest() {
                remove_hls_output(paths, manifest);
            }
            return Err(IngestError::Persist(err));
        }
    };

    let warnings = outcome.warning().map(str::to_owned).into_iter().collect();
    Ok(Ingested {
        record,
        outcome,
        warnings,
    })
}

/// Deferred upload path: store the file and insert the row without a
/// manifest. The caller decides whether to queue a transcode.
pub fn record_upload<R: Read>(
    store: &Mutex<MetadataStore>,
    paths: &MediaPaths,
    filename: &str,
    payload: R,
    metadata: UploadMetadata,
) -> Result<(VideoRecord, StoredUpload), IngestError> {
    let stored = accept_upload(paths, filename, payload)?;
    let record = record_stored(store, &stored, metadata)?;
    Ok((record, stored))
}

/// Inserts the row for an already stored file, removing the file if the
/// insert fails.
pub fn record_stored(
    store: &Mutex<MetadataStore>,
    stored: &StoredUpload,
    metadata: UploadMetadata,
) -> Result<VideoRecord, IngestError> {
    let inserted = store
        .lock()
        .insert_video(&metadata.into_new_video(stored, None));
    inserted.map_err(|err| {
        discard_upload(stored);
        IngestError::Persist(err)
    })
}

/// Removes a stored raw upload that will not be referenced by any row.
pub fn discard_upload(stored: &StoredUpload) {
    if let Err(err) = fs::remove_file(&stored.path) {
        warn!(path = %stored.path.display(), error = %err, "could not remove raw upload");
    }
}

fn remove_raw_upload(paths: &MediaPaths, filename: &str) -> bool {
    let Some(raw) = resolve_within(&paths.upload_root, filename) else {
        return false;
    };
    match fs::remove_file(&raw) {
        Ok(()) => true,
        Err(err) => {
            warn!(path = %raw.display(), error = %err, "could not remove raw upload");
            false
        }
    }
}

/// Removes the `video_*` directory a manifest path points into.
fn remove_hls_output(paths: &MediaPaths, manifest: &str) -> bool {
    let Some(dir) = manifest
        .split('/')
        .next()
        .and_then(|dir| resolve_within(&paths.hls_root, dir))
    else {
        return false;
    };
    match fs::remove_dir_all(&dir) {
        Ok(()) => true,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "could not remove HLS output");
            false
        }
    }
}

/// Best-effort removal of the raw upload and HLS directory of a deleted
/// video. Returns how many assets were removed.
pub fn remove_assets(paths: &MediaPaths, record: &VideoRecord) -> usize {
    let raw = record
        .stored_filename
        .as_deref()
        .is_some_and(|name| remove_raw_upload(paths, name));
    let hls = record
        .hls_manifest
        .as_deref()
        .is_some_and(|manifest| remove_hls_output(paths, manifest));
    usize::from(raw) + usize::from(hls)
}

/// Pollable state of a background transcode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Ready { manifest: String },
    Failed { warning: String },
    Skipped { reason: SkipReason },
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

impl From<TranscodeOutcome> for JobStatus {
    fn from(outcome: TranscodeOutcome) -> Self {
        match outcome {
            TranscodeOutcome::Skipped(reason) => JobStatus::Skipped { reason },
            TranscodeOutcome::Ready(manifest) => JobStatus::Ready { manifest },
            TranscodeOutcome::Failed(warning) => JobStatus::Failed { warning },
        }
    }
}

#[derive(Debug)]
struct TranscodeJob {
    video_id: i64,
    stored: StoredUpload,
}

type JobTable = Arc<RwLock<HashMap<i64, JobStatus>>>;

/// Background worker that runs transcodes one at a time so uploads can
/// return before the encoder finishes.
#[derive(Clone)]
pub struct TranscodeQueue {
    sender: mpsc::UnboundedSender<TranscodeJob>,
    jobs: JobTable,
}

impl TranscodeQueue {
    /// Spawns the worker task on the current tokio runtime.
    pub fn start(encoder: Encoder, paths: MediaPaths, store: Arc<Mutex<MetadataStore>>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let jobs: JobTable = Arc::new(RwLock::new(HashMap::new()));
        tokio::spawn(run_worker(
            receiver,
            Arc::new(encoder),
            Arc::new(paths),
            store,
            jobs.clone(),
        ));
        Self { sender, jobs }
    }

    /// Queues a transcode of `stored` for `video_id`.
    pub fn submit(&self, video_id: i64, stored: StoredUpload) -> JobStatus {
        let status = match self.sender.send(TranscodeJob { video_id, stored }) {
            Ok(()) => JobStatus::Queued,
            Err(_) => {
                error!(video_id, "transcode worker is gone; job dropped");
                JobStatus::Failed {
                    warning: "HLS transcoding is unavailable; the original upload is used for playback"
                        .to_owned(),
                }
            }
        };
        self.jobs.write().insert(video_id, status.clone());
        status
    }

    pub fn status(&self, video_id: i64) -> Option<JobStatus> {
        self.jobs.read().get(&video_id).cloned()
    }

    /// Drops the job entry, e.g. once its video was deleted.
    pub fn forget(&self, video_id: i64) {
        self.jobs.write().remove(&video_id);
    }
}

async fn run_worker(
    mut receiver: mpsc::UnboundedReceiver<TranscodeJob>,
    encoder: Arc<Encoder>,
    paths: Arc<MediaPaths>,
    store: Arc<Mutex<MetadataStore>>,
    jobs: JobTable,
) {
    while let Some(job) = receiver.recv().await {
        let video_id = job.video_id;
        // a forgotten entry means the video was deleted while queued
        let wanted = set_if_tracked(&jobs, video_id, JobStatus::Running);
        if !wanted {
            info!(video_id, "skipping transcode for a forgotten job");
            continue;
        }

        let encoder = encoder.clone();
        let paths = paths.clone();
        let store = store.clone();
        let result = task::spawn_blocking(move || {
            let outcome = run_transcode(&encoder, &paths, &job.stored, true);
            let TranscodeOutcome::Ready(manifest) = &outcome else {
                return outcome;
            };
            let recorded = store.lock().set_hls_manifest(video_id, manifest);
            match recorded {
                Ok(true) => outcome,
                Ok(false) => {
                    warn!(video_id, "video gone or already has a manifest; discarding HLS output");
                    remove_hls_output(&paths, manifest);
                    TranscodeOutcome::Failed(
                        "HLS output was discarded because the video no longer accepts it"
                            .to_owned(),
                    )
                }
                Err(err) => {
                    warn!(video_id, error = %format!("{err:#}"), "could not record HLS manifest");
                    remove_hls_output(&paths, manifest);
                    TranscodeOutcome::Failed(
                        "HLS output could not be recorded; the original upload is used for playback"
                            .to_owned(),
                    )
                }
            }
        })
        .await;

        let status = match result {
            Ok(outcome) => JobStatus::from(outcome),
            Err(err) => {
                error!(video_id, error = %err, "transcode task panicked");
                JobStatus::Failed {
                    warning: "HLS transcoding failed; the original upload is used for playback"
                        .to_owned(),
                }
            }
        };
        info!(video_id, status = ?status, "background transcode finished");
        set_if_tracked(&jobs, video_id, status);
    }
}

/// Updates a job entry only while it is still tracked.
fn set_if_tracked(jobs: &JobTable, video_id: i64, status: JobStatus) -> bool {
    match jobs.write().get_mut(&video_id) {
        Some(entry) => {
            *entry = status;
            true
        }
        None => false,
    }
}
