use anyhow::{Context, Result, anyhow, bail};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ashn-env";
pub const DEFAULT_ASHN_PORT: u16 = 8080;
pub const DEFAULT_ASHN_HOST: &str = "127.0.0.1";
pub const DEFAULT_ENCODER: &str = "ffmpeg";
pub const DEFAULT_ENCODER_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;
pub const DATABASE_FILE: &str = "ashn.db";
pub const HLS_SUBDIR: &str = "hls";

/// Where the HLS ladder is produced relative to the upload request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TranscodeMode {
    /// The upload response waits for the encoder.
    #[default]
    Inline,
    /// The upload returns immediately and a worker runs the encoder.
    Background,
}

impl TranscodeMode {
    fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "inline" | "sync" => Ok(Self::Inline),
            "background" | "worker" => Ok(Self::Background),
            other => bail!("unknown TRANSCODE_MODE {other:?} (expected inline or background)"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub upload_root: Option<PathBuf>,
    pub hls_root: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub ashn_port: Option<u16>,
    pub ashn_host: Option<String>,
    pub encoder_path: Option<PathBuf>,
    pub encoder_timeout_secs: Option<u64>,
    pub max_upload_bytes: Option<usize>,
    pub transcode_mode: Option<TranscodeMode>,
}

/// Fully resolved settings the backend runs with.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub upload_root: PathBuf,
    pub hls_root: PathBuf,
    pub database_path: PathBuf,
    pub ashn_port: u16,
    pub ashn_host: String,
    pub encoder_path: PathBuf,
    pub encoder_timeout: Duration,
    pub max_upload_bytes: usize,
    pub transcode_mode: TranscodeMode,
}

impl RuntimePaths {
    /// Creates the upload and HLS roots so handlers can assume they exist.
    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.upload_root)
            .with_context(|| format!("creating {}", self.upload_root.display()))?;
        fs::create_dir_all(&self.hls_root)
            .with_context(|| format!("creating {}", self.hls_root.display()))?;
        Ok(())
    }
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"');
            match key.trim() {
                "UPLOAD_ROOT" => cfg.upload_root = Some(PathBuf::from(value)),
                "HLS_ROOT" => {
                    if !value.is_empty() {
                        cfg.hls_root = Some(PathBuf::from(value));
                    }
                }
                "DATABASE_PATH" => {
                    if !value.is_empty() {
                        cfg.database_path = Some(PathBuf::from(value));
                    }
                }
                "ASHN_PORT" => {
                    let port: u16 = value
                        .parse()
                        .with_context(|| format!("Parsing ASHN_PORT from {}", path.display()))?;
                    cfg.ashn_port = Some(port);
                }
                "ASHN_HOST" => {
                    if !value.is_empty() {
                        cfg.ashn_host = Some(value.to_string());
                    }
                }
                "ENCODER_PATH" => {
                    if !value.is_empty() {
                        cfg.encoder_path = Some(PathBuf::from(value));
                    }
                }
                "ENCODER_TIMEOUT_SECS" => {
                    let secs: u64 = value.parse().with_context(|| {
                        format!("Parsing ENCODER_TIMEOUT_SECS from {}", path.display())
                    })?;
                    cfg.encoder_timeout_secs = Some(secs);
                }
                "MAX_UPLOAD_BYTES" => {
                    let bytes: usize = value.parse().with_context(|| {
                        format!("Parsing MAX_UPLOAD_BYTES from {}", path.display())
                    })?;
                    cfg.max_upload_bytes = Some(bytes);
                }
                "TRANSCODE_MODE" => {
                    if !value.is_empty() {
                        cfg.transcode_mode = Some(TranscodeMode::parse(value).with_context(
                            || format!("Parsing TRANSCODE_MODE from {}", path.display()),
                        )?);
                    }
                }
                _ => {}
            }
        }
    }
    Ok(Some(cfg))
}

pub fn load_runtime_paths() -> Result<RuntimePaths> {
    load_runtime_paths_from(Path::new(DEFAULT_CONFIG_PATH))
}

pub fn load_runtime_paths_from(path: impl AsRef<Path>) -> Result<RuntimePaths> {
    let path = path.as_ref();
    let cfg = read_env_config(path)?
        .ok_or_else(|| anyhow!("Missing config file at {}", path.display()))?;
    let upload_root = cfg
        .upload_root
        .ok_or_else(|| anyhow!("UPLOAD_ROOT not set in {}", path.display()))?;
    let hls_root = cfg
        .hls_root
        .unwrap_or_else(|| upload_root.join(HLS_SUBDIR));
    let database_path = cfg
        .database_path
        .unwrap_or_else(|| upload_root.join(DATABASE_FILE));
    let ashn_port = cfg.ashn_port.unwrap_or(DEFAULT_ASHN_PORT);
    let ashn_host = cfg
        .ashn_host
        .clone()
        .unwrap_or_else(|| DEFAULT_ASHN_HOST.to_string());
    let encoder_path = cfg
        .encoder_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENCODER));
    let encoder_timeout = Duration::from_secs(
        cfg.encoder_timeout_secs
            .unwrap_or(DEFAULT_ENCODER_TIMEOUT_SECS),
    );
    if encoder_timeout.is_zero() {
        bail!("ENCODER_TIMEOUT_SECS must be positive in {}", path.display());
    }
    Ok(RuntimePaths {
        upload_root,
        hls_root,
        database_path,
        ashn_port,
        ashn_host,
        encoder_path,
        encoder_timeout,
        max_upload_bytes: cfg.max_upload_bytes.unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
        transcode_mode: cfg.transcode_mode.unwrap_or_default(),
    })
}
