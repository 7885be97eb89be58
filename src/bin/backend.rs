use std::{
    io,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use ashn_media::{
    config::{RuntimePaths, TranscodeMode, load_runtime_paths},
    encoder::Encoder,
    metadata::{CATEGORIES, MetadataReader, MetadataStore, VideoQuery, VideoRecord},
    pipeline::{
        IngestError, JobStatus, MediaPaths, SkipReason, TranscodeQueue, UploadMetadata,
        accept_upload, discard_upload, ingest_stored, record_stored, remove_assets,
    },
    playback::{PlaybackRoutes, resolve_url},
    security::{ensure_not_root, resolve_within},
    upload::{StoredUpload, chunk_channel, is_allowed},
};
use axum::{
    Json, Router,
    body::Body,
    extract::{
        DefaultBodyLimit, Multipart, Path as AxumPath, Query, State,
        multipart::{Field, MultipartError},
    },
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use mime_guess::MimeGuess;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{fs::File, signal, task};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct AppState {
    reader: MetadataReader,
    store: Arc<Mutex<MetadataStore>>,
    encoder: Arc<Encoder>,
    paths: Arc<MediaPaths>,
    routes: Arc<PlaybackRoutes>,
    queue: Option<TranscodeQueue>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::MissingFile | IngestError::UnsupportedExtension(_) => {
                Self::bad_request(err.to_string())
            }
            IngestError::Storage(_) | IngestError::Persist(_) => {
                warn!(error = %err, "upload failed");
                Self::internal("could not store upload")
            }
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        Self {
            status: err.status(),
            message: err.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// A record as clients see it: stored fields plus the derived playback URL.
#[derive(Serialize)]
struct VideoView {
    #[serde(flatten)]
    record: VideoRecord,
    source_url: String,
    hls: bool,
}

impl VideoView {
    fn new(record: VideoRecord, routes: &PlaybackRoutes) -> Self {
        let source_url = resolve_url(&record, routes);
        let hls = record.hls_manifest.is_some();
        Self {
            record,
            source_url,
            hls,
        }
    }
}

#[derive(Serialize)]
struct UploadResponse {
    #[serde(flatten)]
    video: VideoView,
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    transcode: Option<JobStatus>,
}

#[derive(Serialize)]
struct VideoListResponse {
    page: u32,
    per_page: u32,
    total: i64,
    items: Vec<VideoView>,
}

#[derive(Serialize)]
struct CategoryInfo {
    slug: &'static str,
    label: &'static str,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "ashn_media=info,backend=info".into()),
        )
        .init();

    ensure_not_root("ashn backend")?;
    let runtime = load_runtime_paths()?;
    runtime.prepare()?;

    let state = build_state(&runtime)?;

    let app = Router::new()
        .route("/api/categories", get(list_categories))
        .route("/api/videos", get(list_videos).post(upload_video))
        .route("/api/videos/{id}", get(get_video).delete(delete_video))
        .route("/api/videos/{id}/transcode", get(transcode_status))
        .route("/media/{*path}", get(serve_media))
        .route("/hls/{*path}", get(serve_hls))
        .layer(DefaultBodyLimit::max(runtime.max_upload_bytes))
        .with_state(state);

    let host: IpAddr = runtime
        .ashn_host
        .parse()
        .with_context(|| format!("parsing ASHN_HOST {:?}", runtime.ashn_host))?;
    let addr = SocketAddr::new(host, runtime.ashn_port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(%addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn build_state(runtime: &RuntimePaths) -> Result<AppState> {
    let store = MetadataStore::open(&runtime.database_path)
        .context("initializing video store")?;
    let store = Arc::new(Mutex::new(store));
    let reader = MetadataReader::new(&runtime.database_path)
        .context("initializing video reader")?;

    let encoder = Encoder::new(&runtime.encoder_path).with_timeout(runtime.encoder_timeout);
    if !encoder.is_available() {
        warn!(
            encoder = %runtime.encoder_path.display(),
            "encoder not found; uploads will be served as raw files"
        );
    }
    let paths = MediaPaths::from(runtime);

    let queue = match runtime.transcode_mode {
        TranscodeMode::Inline => None,
        TranscodeMode::Background => Some(TranscodeQueue::start(
            encoder.clone(),
            paths.clone(),
            store.clone(),
        )),
    };
    info!(mode = ?runtime.transcode_mode, "transcode mode");

    Ok(AppState {
        reader,
        store,
        encoder: Arc::new(encoder),
        paths: Arc::new(paths),
        routes: Arc::new(PlaybackRoutes::default()),
        queue,
    })
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
}

async fn list_categories() -> Json<Vec<CategoryInfo>> {
    Json(
        CATEGORIES
            .iter()
            .map(|category| CategoryInfo {
                slug: category.slug(),
                label: category.label(),
            })
            .collect(),
    )
}

async fn list_videos(
    State(state): State<AppState>,
    Query(query): Query<VideoQuery>,
) -> ApiResult<Json<VideoListResponse>> {
    let reader = state.reader.clone();
    let page = task::spawn_blocking(move || reader.list_videos(&query))
        .await
        .map_err(|err| ApiError::internal(format!("task join error: {err}")))?
        .map_err(|err| ApiError::internal(format!("{err:#}")))?;

    let items = page
        .items
        .into_iter()
        .map(|record| VideoView::new(record, &state.routes))
        .collect();
    Ok(Json(VideoListResponse {
        page: page.page,
        per_page: page.per_page,
        total: page.total,
        items,
    }))
}

async fn get_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<Json<VideoView>> {
    let store = state.store.clone();
    let reader = state.reader.clone();
    let record = task::spawn_blocking(move || -> Result<Option<VideoRecord>> {
        store.lock().increment_views(id)?;
        reader.get_video(id)
    })
    .await
    .map_err(|err| ApiError::internal(format!("task join error: {err}")))?
    .map_err(|err| ApiError::internal(format!("{err:#}")))?
    .ok_or_else(|| ApiError::not_found("video not found"))?;

    Ok(Json(VideoView::new(record, &state.routes)))
}

async fn delete_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<StatusCode> {
    let store = state.store.clone();
    let paths = state.paths.clone();
    let removed = task::spawn_blocking(move || -> Result<Option<usize>> {
        let Some(record) = store.lock().delete_video(id)? else {
            return Ok(None);
        };
        Ok(Some(remove_assets(&paths, &record)))
    })
    .await
    .map_err(|err| ApiError::internal(format!("task join error: {err}")))?
    .map_err(|err| ApiError::internal(format!("{err:#}")))?
    .ok_or_else(|| ApiError::not_found("video not found"))?;

    if let Some(queue) = &state.queue {
        queue.forget(id);
    }
    info!(video_id = id, assets = removed, "deleted video");
    Ok(StatusCode::NO_CONTENT)
}

async fn transcode_status(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<Json<JobStatus>> {
    let queue = state
        .queue
        .as_ref()
        .ok_or_else(|| ApiError::not_found("background transcoding is disabled"))?;
    queue
        .status(id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("no transcode job for this video"))
}

/// Checkbox semantics: any value other than an explicit "off" enables.
fn flag_enabled(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "off" | "no"
    )
}

/// Chunks buffered between the request and the blocking file writer.
const UPLOAD_CHUNK_QUEUE: usize = 8;

struct UploadForm {
    stored: StoredUpload,
    to_hls: bool,
    metadata: UploadMetadata,
}

/// Streams the `file` part to disk while collecting the text fields. The
/// stored file is removed again if the rest of the form is rejected.
async fn read_upload_form(state: &AppState, mut multipart: Multipart) -> ApiResult<UploadForm> {
    let mut stored = None;
    let fields = collect_upload_fields(state, &mut multipart, &mut stored).await;
    match (fields, stored) {
        (Ok((to_hls, metadata)), Some(stored)) => Ok(UploadForm {
            stored,
            to_hls,
            metadata,
        }),
        (Ok(_), None) => Err(IngestError::MissingFile.into()),
        (Err(err), stored) => {
            if let Some(stored) = stored {
                discard_upload(&stored);
            }
            Err(err)
        }
    }
}

async fn collect_upload_fields(
    state: &AppState,
    multipart: &mut Multipart,
    stored: &mut Option<StoredUpload>,
) -> ApiResult<(bool, UploadMetadata)> {
    let mut to_hls = false;
    let mut metadata = UploadMetadata::default();

    while let Some(field) = multipart.next_field().await? {
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };
        if name == "file" {
            let filename = field.file_name().unwrap_or_default().to_owned();
            if filename.is_empty() {
                continue;
            }
            if stored.is_some() {
                return Err(ApiError::bad_request("only one file per upload"));
            }
            *stored = Some(stream_to_disk(state, filename, field).await?);
            continue;
        }

        let value = field.text().await?;
        match name.as_str() {
            "title" => metadata.title = Some(value),
            "description" => metadata.description = Some(value),
            "category" | "cat" => metadata.category = Some(value),
            "creator" => metadata.creator = Some(value),
            "external_url" => metadata.external_url = Some(value),
            "user_id" => {
                let id = value
                    .trim()
                    .parse()
                    .map_err(|_| ApiError::bad_request("user_id must be an integer"))?;
                metadata.user_id = Some(id);
            }
            "to_hls" => to_hls = flag_enabled(&value),
            _ => {}
        }
    }

    Ok((to_hls, metadata))
}

/// Feeds the part chunk by chunk to a blocking writer in the upload root.
async fn stream_to_disk(
    state: &AppState,
    filename: String,
    mut field: Field<'_>,
) -> ApiResult<StoredUpload> {
    // reject before reading the body
    if !is_allowed(&filename) {
        return Err(IngestError::UnsupportedExtension(filename).into());
    }

    let (sender, reader) = chunk_channel(UPLOAD_CHUNK_QUEUE);
    let paths = state.paths.clone();
    let writer = task::spawn_blocking(move || accept_upload(&paths, &filename, reader));

    let mut failure = None;
    loop {
        match field.chunk().await {
            Ok(Some(chunk)) => {
                // a closed channel means the writer failed; its error is returned below
                if sender.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                let _ = sender.send(Err(io::Error::other(err.to_string()))).await;
                failure = Some(err);
                break;
            }
        }
    }
    drop(sender);

    let stored = writer
        .await
        .map_err(|err| ApiError::internal(format!("task join error: {err}")))?;
    if let Some(err) = failure {
        if let Ok(stored) = &stored {
            discard_upload(stored);
        }
        return Err(err.into());
    }
    Ok(stored?)
}

async fn upload_video(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<UploadResponse>)> {
    let UploadForm {
        stored,
        to_hls,
        metadata,
    } = read_upload_form(&state, multipart).await?;

    let response = match &state.queue {
        None => {
            let store = state.store.clone();
            let encoder = state.encoder.clone();
            let paths = state.paths.clone();
            let ingested = task::spawn_blocking(move || {
                ingest_stored(&store, &encoder, &paths, stored, to_hls, metadata)
            })
            .await
            .map_err(|err| ApiError::internal(format!("task join error: {err}")))??;

            UploadResponse {
                video: VideoView::new(ingested.record, &state.routes),
                warnings: ingested.warnings,
                transcode: None,
            }
        }
        Some(queue) => {
            let store = state.store.clone();
            let (record, stored) = task::spawn_blocking(move || {
                record_stored(&store, &stored, metadata).map(|record| (record, stored))
            })
            .await
            .map_err(|err| ApiError::internal(format!("task join error: {err}")))??;

            let status = if to_hls {
                queue.submit(record.id, stored)
            } else {
                JobStatus::Skipped {
                    reason: SkipReason::NotRequested,
                }
            };
            let warnings = match &status {
                JobStatus::Failed { warning } => vec![warning.clone()],
                _ => Vec::new(),
            };
            UploadResponse {
                video: VideoView::new(record, &state.routes),
                warnings,
                transcode: Some(status),
            }
        }
    };

    info!(
        video_id = response.video.record.id,
        hls = response.video.hls,
        "upload accepted"
    );
    Ok((StatusCode::CREATED, Json(response)))
}

async fn serve_media(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
) -> ApiResult<Response> {
    // uploads live flat in the root, next to the HLS tree and the database
    if path.contains('/') || !is_allowed(&path) {
        return Err(ApiError::not_found("file not found"));
    }
    let file = resolve_within(&state.paths.upload_root, &path)
        .ok_or_else(|| ApiError::not_found("file not found"))?;
    stream_file(file).await
}

async fn serve_hls(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
) -> ApiResult<Response> {
    let file = resolve_within(&state.paths.hls_root, &path)
        .ok_or_else(|| ApiError::not_found("file not found"))?;
    stream_file(file).await
}

fn content_type(path: &std::path::Path) -> Option<HeaderValue> {
    let mime = match path.extension().and_then(|ext| ext.to_str()) {
        Some("m3u8") => "application/vnd.apple.mpegurl".to_owned(),
        Some("ts") => "video/mp2t".to_owned(),
        _ => MimeGuess::from_path(path).first()?.to_string(),
    };
    HeaderValue::from_str(&mime).ok()
}

async fn stream_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let is_file = file
        .metadata()
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false);
    if !is_file {
        return Err(ApiError::not_found("file not found"));
    }

    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);
    let mut response = body.into_response();
    if let Some(value) = content_type(&path) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}
