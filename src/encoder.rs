//! ffmpeg driver that turns one uploaded file into a two-rendition HLS ladder.
//!
//! Layout produced under the per-asset output directory:
//!
//! ```text
//! video_<millis>/
//!   master.m3u8
//!   v0/index.m3u8  v0/seg_000.ts ...   (640x360)
//!   v1/index.m3u8  v1/seg_000.ts ...   (1280x720)
//! ```
//!
//! Both renditions share a fixed GOP so segment boundaries line up and a
//! player can switch between them at any segment.

use std::ffi::OsString;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Component, Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::runtime;
use tokio::time;
use tracing::{info, warn};

pub const MASTER_PLAYLIST: &str = "master.m3u8";
pub const VARIANT_PLAYLIST: &str = "index.m3u8";
pub const SEGMENT_PATTERN: &str = "seg_%03d.ts";
pub const SEGMENT_SECONDS: u32 = 4;
pub const GOP_FRAMES: u32 = 48;
pub const AUDIO_CODEC: &str = "aac";
pub const AUDIO_SAMPLE_RATE: u32 = 48_000;
pub const VIDEO_CODEC: &str = "h264";
pub const VIDEO_PROFILE: &str = "main";
/// Characters of encoder stderr kept in errors and logs.
pub const DIAGNOSTIC_LIMIT: usize = 2000;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

const OUTPUT_DIR_PREFIX: &str = "video_";
const MAX_DIR_ATTEMPTS: u32 = 100;

/// One rung of the adaptive ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rendition {
    /// Subdirectory holding the rendition's playlist and segments.
    pub dir: &'static str,
    pub width: u32,
    pub height: u32,
    pub crf: u8,
    /// Bandwidth advertised in the master playlist, in bits per second.
    pub bandwidth: u64,
}

impl Rendition {
    pub fn playlist_uri(&self) -> String {
        format!("{}/{}", self.dir, VARIANT_PLAYLIST)
    }
}

pub const RENDITIONS: [Rendition; 2] = [
    Rendition {
        dir: "v0",
        width: 640,
        height: 360,
        crf: 23,
        bandwidth: 800_000,
    },
    Rendition {
        dir: "v1",
        width: 1280,
        height: 720,
        crf: 21,
        bandwidth: 2_500_000,
    },
];

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("io error at {path}: {source}")]
    Io {
        source: io::Error,
        path: PathBuf,
    },
    #[error("failed to start encoder {program}: {source}")]
    Spawn {
        source: io::Error,
        program: PathBuf,
    },
    #[error("encoder exited with {status}: {diagnostics}")]
    Process {
        status: ExitStatus,
        diagnostics: String,
    },
    #[error("encoder killed after running for {0:?}")]
    Timeout(Duration),
    #[error("{path} is not inside the HLS root")]
    OutsideRoot { path: PathBuf },
    #[error("could not allocate an output directory under {root}")]
    DirectoryExhausted { root: PathBuf },
}

/// Handle on the external encoder binary.
#[derive(Debug, Clone)]
pub struct Encoder {
    program: PathBuf,
    timeout: Duration,
}

impl Encoder {
    /// `program` is either a bare name looked up on `PATH` or a path.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Checks whether the encoder can be launched, without launching it.
    pub fn is_available(&self) -> bool {
        which::which(&self.program).is_ok()
    }

    /// Runs the encoder over `input` and returns the master playlist path
    /// relative to `hls_root`, using `/` separators.
    ///
    /// Blocks until the encoder exits or the timeout fires. A zero exit
    /// without a master playlist gets a synthesized one pointing at the
    /// expected rendition playlists; the renditions themselves are not checked.
    pub fn transcode(
        &self,
        input: &Path,
        output_dir: &Path,
        hls_root: &Path,
    ) -> Result<String, TranscodeError> {
        let master_path = output_dir.join(MASTER_PLAYLIST);
        let manifest = relative_manifest(&master_path, hls_root)?;

        for rendition in &RENDITIONS {
            let dir = output_dir.join(rendition.dir);
            fs::create_dir_all(&dir).map_err(|source| TranscodeError::Io { source, path: dir })?;
        }

        let mut command = Command::new(&self.program);
        command.args(hls_args(input, output_dir));

        info!(
            input = %input.display(),
            output = %output_dir.display(),
            "starting HLS transcode"
        );
        let started = Instant::now();
        let run = run_with_timeout(command, &self.program, self.timeout)?;

        if !run.status.success() {
            let diagnostics = truncate_diagnostics(&run.stderr);
            warn!(
                status = %run.status,
                diagnostics = %diagnostics,
                "encoder failed"
            );
            return Err(TranscodeError::Process {
                status: run.status,
                diagnostics,
            });
        }

        if !master_path.exists() {
            warn!(
                path = %master_path.display(),
                "encoder exited cleanly without a master playlist; writing fallback"
            );
            fs::write(&master_path, master_playlist()).map_err(|source| TranscodeError::Io {
                source,
                path: master_path.clone(),
            })?;
        }

        info!(
            manifest = %manifest,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "HLS transcode finished"
        );
        Ok(manifest)
    }
}

/// Command line for the fixed two-rendition ladder.
pub fn hls_args(input: &Path, output_dir: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-y".into(), "-i".into(), input.into()];

    for (idx, rendition) in RENDITIONS.iter().enumerate() {
        args.extend(
            [
                format!("-filter:v:{idx}"),
                format!(
                    "scale=w={}:h={}:force_original_aspect_ratio=decrease",
                    rendition.width, rendition.height
                ),
                format!("-c:a:{idx}"),
                AUDIO_CODEC.to_owned(),
                format!("-ar:a:{idx}"),
                AUDIO_SAMPLE_RATE.to_string(),
                format!("-c:v:{idx}"),
                VIDEO_CODEC.to_owned(),
                format!("-profile:v:{idx}"),
                VIDEO_PROFILE.to_owned(),
                format!("-crf:v:{idx}"),
                rendition.crf.to_string(),
            ]
            .map(OsString::from),
        );
    }

    let gop = GOP_FRAMES.to_string();
    for arg in ["-sc_threshold", "0", "-g", gop.as_str(), "-keyint_min", gop.as_str()] {
        args.push(arg.into());
    }

    for _ in &RENDITIONS {
        for arg in ["-map", "0:v:0", "-map", "0:a:0?"] {
            args.push(arg.into());
        }
    }

    let stream_map = (0..RENDITIONS.len())
        .map(|idx| format!("v:{idx},a:{idx}"))
        .collect::<Vec<_>>()
        .join(" ");

    args.extend(
        [
            "-var_stream_map".to_owned(),
            stream_map,
            "-master_pl_name".to_owned(),
            MASTER_PLAYLIST.to_owned(),
            "-f".to_owned(),
            "hls".to_owned(),
            "-hls_time".to_owned(),
            SEGMENT_SECONDS.to_string(),
            "-hls_playlist_type".to_owned(),
            "vod".to_owned(),
            "-hls_segment_filename".to_owned(),
        ]
        .map(OsString::from),
    );
    args.push(output_dir.join("v%v").join(SEGMENT_PATTERN).into());
    args.push(output_dir.join("v%v").join(VARIANT_PLAYLIST).into());
    args
}

/// Master playlist listing every rendition of [`RENDITIONS`].
pub fn master_playlist() -> String {
    let mut playlist = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    for rendition in &RENDITIONS {
        playlist.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{}\n{}\n",
            rendition.bandwidth,
            rendition.width,
            rendition.height,
            rendition.playlist_uri()
        ));
    }
    playlist
}

/// Creates a fresh `video_<millis>` directory under `hls_root`, adding a
/// `-N` suffix when two uploads land in the same millisecond.
pub fn allocate_output_dir(hls_root: &Path) -> Result<PathBuf, TranscodeError> {
    fs::create_dir_all(hls_root).map_err(|source| TranscodeError::Io {
        source,
        path: hls_root.to_path_buf(),
    })?;

    let token = format!("{OUTPUT_DIR_PREFIX}{}", Utc::now().timestamp_millis());
    for attempt in 0..MAX_DIR_ATTEMPTS {
        let name = if attempt == 0 {
            token.clone()
        } else {
            format!("{token}-{attempt}")
        };
        let dir = hls_root.join(name);
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(source) => return Err(TranscodeError::Io { source, path: dir }),
        }
    }
    Err(TranscodeError::DirectoryExhausted {
        root: hls_root.to_path_buf(),
    })
}

fn relative_manifest(master_path: &Path, hls_root: &Path) -> Result<String, TranscodeError> {
    let outside = || TranscodeError::OutsideRoot {
        path: master_path.to_path_buf(),
    };
    let relative = master_path.strip_prefix(hls_root).map_err(|_| outside())?;

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return Err(outside()),
        }
    }
    Ok(parts.join("/"))
}

/// Keeps the first [`DIAGNOSTIC_LIMIT`] characters of the encoder's stderr.
pub fn truncate_diagnostics(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    text.chars().take(DIAGNOSTIC_LIMIT).collect()
}

struct ProcessRun {
    status: ExitStatus,
    stderr: Vec<u8>,
}

/// Spawns `command` with stderr captured and waits at most `timeout`,
/// killing and reaping the child once the deadline passes.
///
/// Runs on a private current-thread runtime so callers stay synchronous,
/// including from inside `spawn_blocking`.
fn run_with_timeout(
    mut command: Command,
    program: &Path,
    timeout: Duration,
) -> Result<ProcessRun, TranscodeError> {
    let runtime = runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|source| TranscodeError::Io {
            source,
            path: program.to_path_buf(),
        })?;

    runtime.block_on(async {
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscodeError::Spawn {
                source,
                program: program.to_path_buf(),
            })?;

        let mut stderr_pipe = child.stderr.take();
        let read_stderr = async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        };

        let finished = time::timeout(timeout, async {
            let (status, stderr) = tokio::join!(child.wait(), read_stderr);
            (status, stderr)
        })
        .await;

        match finished {
            Ok((Ok(status), stderr)) => Ok(ProcessRun { status, stderr }),
            Ok((Err(source), _)) => Err(TranscodeError::Io {
                source,
                path: program.to_path_buf(),
            }),
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs_f64(), "encoder timed out; killing it");
                if let Err(err) = child.kill().await {
                    warn!(error = %err, "failed to kill timed out encoder");
                }
                Err(TranscodeError::Timeout(timeout))
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::{TempDir, tempdir};

    #[cfg(unix)]
    fn write_stub(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}"))?;
        let mut perms = fs::metadata(&path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms)?;
        Ok(path)
    }

    struct Workspace {
        _temp: TempDir,
        bin: PathBuf,
        hls_root: PathBuf,
        input: PathBuf,
    }

    fn workspace() -> Result<Workspace> {
        let temp = tempdir()?;
        let bin = temp.path().join("bin");
        let hls_root = temp.path().join("hls");
        fs::create_dir_all(&bin)?;
        fs::create_dir_all(&hls_root)?;
        let input = temp.path().join("clip.mp4");
        fs::write(&input, b"not really a video")?;
        Ok(Workspace {
            _temp: temp,
            bin,
            hls_root,
            input,
        })
    }

    /// Parses `(bandwidth, width, height, uri)` tuples out of a master playlist.
    fn variants(playlist: &str) -> Vec<(u64, u32, u32, String)> {
        let mut lines = playlist.lines();
        let mut found = Vec::new();
        while let Some(line) = lines.next() {
            let Some(attrs) = line.strip_prefix("#EXT-X-STREAM-INF:") else {
                continue;
            };
            let mut bandwidth = 0;
            let mut resolution = (0, 0);
            for attr in attrs.split(',') {
                if let Some(value) = attr.strip_prefix("BANDWIDTH=") {
                    bandwidth = value.parse().unwrap();
                }
                if let Some(value) = attr.strip_prefix("RESOLUTION=") {
                    let (w, h) = value.split_once('x').unwrap();
                    resolution = (w.parse().unwrap(), h.parse().unwrap());
                }
            }
            let uri = lines.next().unwrap().to_owned();
            found.push((bandwidth, resolution.0, resolution.1, uri));
        }
        found
    }

    #[test]
    fn hls_args_describe_the_fixed_ladder() {
        let args: Vec<String> = hls_args(Path::new("/in/clip.mp4"), Path::new("/out/video_1"))
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        let joined = args.join(" ");

        assert_eq!(&args[..3], ["-y", "-i", "/in/clip.mp4"]);
        assert!(joined.contains("scale=w=640:h=360:force_original_aspect_ratio=decrease"));
        assert!(joined.contains("scale=w=1280:h=720:force_original_aspect_ratio=decrease"));
        assert!(joined.contains("-crf:v:0 23"));
        assert!(joined.contains("-crf:v:1 21"));
        assert!(joined.contains("-g 48 -keyint_min 48"));
        assert!(joined.contains("-hls_time 4"));
        assert!(joined.contains("-hls_playlist_type vod"));
        assert!(joined.contains("-master_pl_name master.m3u8"));
        assert_eq!(args.iter().filter(|arg| *arg == "0:a:0?").count(), 2);
        let map_idx = args.iter().position(|arg| arg == "-var_stream_map").unwrap();
        assert_eq!(args[map_idx + 1], "v:0,a:0 v:1,a:1");
        assert_eq!(args[args.len() - 2], "/out/video_1/v%v/seg_%03d.ts");
        assert_eq!(args[args.len() - 1], "/out/video_1/v%v/index.m3u8");
    }

    #[test]
    fn master_playlist_lists_both_renditions() {
        let found = variants(&master_playlist());
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].3, "v0/index.m3u8");
        assert_eq!(found[1].3, "v1/index.m3u8");
        assert!(found[0].0 < found[1].0);
        assert!(found[0].1 < found[1].1 && found[0].2 < found[1].2);
    }

    #[test]
    fn truncate_diagnostics_caps_length() {
        let noisy = "x".repeat(DIAGNOSTIC_LIMIT * 3);
        assert_eq!(truncate_diagnostics(noisy.as_bytes()).len(), DIAGNOSTIC_LIMIT);
        assert_eq!(truncate_diagnostics(b"short"), "short");
    }

    #[test]
    fn relative_manifest_uses_forward_slashes() -> Result<()> {
        let root = Path::new("/srv/hls");
        let master = root.join("video_9").join(MASTER_PLAYLIST);
        assert_eq!(relative_manifest(&master, root)?, "video_9/master.m3u8");
        assert!(matches!(
            relative_manifest(Path::new("/tmp/master.m3u8"), root),
            Err(TranscodeError::OutsideRoot { .. })
        ));
        Ok(())
    }

    #[test]
    fn allocate_output_dir_never_reuses_a_directory() -> Result<()> {
        let ws = workspace()?;
        let first = allocate_output_dir(&ws.hls_root)?;
        let second = allocate_output_dir(&ws.hls_root)?;
        assert_ne!(first, second);
        assert!(first.is_dir() && second.is_dir());
        assert!(
            first
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with(OUTPUT_DIR_PREFIX)
        );
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn availability_follows_the_filesystem() -> Result<()> {
        let ws = workspace()?;
        let stub = write_stub(&ws.bin, "ffmpeg", "exit 0\n")?;
        assert!(Encoder::new(&stub).is_available());

        let plain = ws.bin.join("not-executable");
        fs::write(&plain, "data")?;
        assert!(!Encoder::new(&plain).is_available());
        assert!(!Encoder::new(ws.bin.join("missing")).is_available());
        assert!(!Encoder::new("ashn-encoder-that-does-not-exist").is_available());
        assert!(Encoder::new("sh").is_available());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn transcode_returns_encoder_master_playlist() -> Result<()> {
        let ws = workspace()?;
        let stub = write_stub(
            &ws.bin,
            "ffmpeg",
            r#"for last in "$@"; do :; done
out=$(dirname "$(dirname "$last")")
printf '%s\n' "$@" > "$out/args.txt"
printf '#EXTM3U\n#EXT-X-PLAYLIST-TYPE:VOD\n' > "$out/v0/index.m3u8"
printf '#EXTM3U\n#EXT-X-PLAYLIST-TYPE:VOD\n' > "$out/v1/index.m3u8"
printf '#EXTM3U\n# from encoder\n' > "$out/master.m3u8"
"#,
        )?;
        let output = ws.hls_root.join("video_1");

        let manifest = Encoder::new(&stub).transcode(&ws.input, &output, &ws.hls_root)?;

        assert_eq!(manifest, "video_1/master.m3u8");
        let master = fs::read_to_string(output.join(MASTER_PLAYLIST))?;
        assert!(master.contains("# from encoder"));
        let recorded = fs::read_to_string(output.join("args.txt"))?;
        assert!(recorded.lines().any(|line| line == ws.input.to_string_lossy()));
        assert!(recorded.lines().any(|line| line == "vod"));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn transcode_surfaces_nonzero_exit() -> Result<()> {
        let ws = workspace()?;
        let stub = write_stub(
            &ws.bin,
            "ffmpeg",
            "echo 'clip.mp4: Invalid data found when processing input' >&2\nexit 1\n",
        )?;
        let output = ws.hls_root.join("video_2");

        let err = Encoder::new(&stub)
            .transcode(&ws.input, &output, &ws.hls_root)
            .unwrap_err();

        match err {
            TranscodeError::Process {
                status,
                diagnostics,
            } => {
                assert_eq!(status.code(), Some(1));
                assert!(diagnostics.contains("Invalid data found"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!output.join(MASTER_PLAYLIST).exists());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn transcode_synthesizes_missing_master_playlist() -> Result<()> {
        let ws = workspace()?;
        let stub = write_stub(&ws.bin, "ffmpeg", "exit 0\n")?;
        let output = ws.hls_root.join("video_3");

        let manifest = Encoder::new(&stub).transcode(&ws.input, &output, &ws.hls_root)?;

        assert_eq!(manifest, "video_3/master.m3u8");
        assert!(output.join("v0").is_dir());
        assert!(output.join("v1").is_dir());
        let found = variants(&fs::read_to_string(output.join(MASTER_PLAYLIST))?);
        let uris: Vec<&str> = found.iter().map(|v| v.3.as_str()).collect();
        assert_eq!(uris, ["v0/index.m3u8", "v1/index.m3u8"]);
        let (low, high) = (&found[0], &found[1]);
        assert_ne!(low.0, high.0);
        assert!(low.0 < high.0);
        assert!(low.1 < high.1 && low.2 < high.2);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn transcode_kills_hung_encoder() -> Result<()> {
        let ws = workspace()?;
        let stub = write_stub(&ws.bin, "ffmpeg", "exec sleep 30\n")?;
        let output = ws.hls_root.join("video_4");
        let started = Instant::now();

        let err = Encoder::new(&stub)
            .with_timeout(Duration::from_millis(200))
            .transcode(&ws.input, &output, &ws.hls_root)
            .unwrap_err();

        assert!(matches!(err, TranscodeError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
        Ok(())
    }

    #[test]
    fn transcode_reports_missing_program() -> Result<()> {
        let ws = workspace()?;
        let err = Encoder::new(ws.bin.join("absent"))
            .transcode(&ws.input, &ws.hls_root.join("video_5"), &ws.hls_root)
            .unwrap_err();
        assert!(matches!(err, TranscodeError::Spawn { .. }));
        Ok(())
    }
}
