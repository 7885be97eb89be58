#![forbid(unsafe_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use ashn_media::{
    config::{DEFAULT_ENCODER, DEFAULT_ENCODER_TIMEOUT_SECS, HLS_SUBDIR},
    encoder::{Encoder, allocate_output_dir},
};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Transcode a video into the two-rendition HLS ladder."
)]
struct Cli {
    #[arg(value_name = "INPUT", help = "Video file to transcode")]
    input: PathBuf,
    #[arg(
        long = "output-dir",
        value_name = "DIR",
        help = "Directory to write the ladder into (its parent is the HLS root)"
    )]
    output_dir: Option<PathBuf>,
    #[arg(
        long = "hls-root",
        value_name = "DIR",
        help = "HLS root to allocate a video_<millis> directory in (default: <input dir>/hls)",
        conflicts_with = "output_dir"
    )]
    hls_root: Option<PathBuf>,
    #[arg(
        long = "encoder",
        value_name = "PATH",
        default_value = DEFAULT_ENCODER,
        help = "Encoder binary, looked up on PATH when bare"
    )]
    encoder: PathBuf,
    #[arg(
        long = "timeout-secs",
        value_name = "N",
        default_value_t = DEFAULT_ENCODER_TIMEOUT_SECS,
        help = "Kill the encoder after this many seconds"
    )]
    timeout_secs: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "ashn_media=info,transcode=info".into()),
        )
        .init();

    let cli = Cli::parse();
    if cli.timeout_secs == 0 {
        bail!("--timeout-secs must be positive");
    }
    if !cli.input.is_file() {
        bail!("input {} is not a file", cli.input.display());
    }

    let encoder =
        Encoder::new(&cli.encoder).with_timeout(Duration::from_secs(cli.timeout_secs));
    if !encoder.is_available() {
        bail!(
            "encoder {} is not installed or not executable",
            cli.encoder.display()
        );
    }

    let (hls_root, output_dir) = output_location(&cli)?;
    info!(
        input = %cli.input.display(),
        output = %output_dir.display(),
        "transcoding"
    );
    let manifest = encoder
        .transcode(&cli.input, &output_dir, &hls_root)
        .with_context(|| format!("transcoding {}", cli.input.display()))?;

    println!("{}", hls_root.join(manifest).display());
    Ok(())
}

/// Resolves the HLS root and, for `--output-dir`, the fixed output directory.
/// Paths are made absolute first so a bare relative directory has a parent.
fn plan_output(cli: &Cli) -> Result<(PathBuf, Option<PathBuf>)> {
    if let Some(dir) = &cli.output_dir {
        let dir = absolute(dir)?;
        let root = dir
            .parent()
            .with_context(|| format!("{} has no parent directory", dir.display()))?
            .to_path_buf();
        return Ok((root, Some(dir)));
    }

    let root = match &cli.hls_root {
        Some(root) => absolute(root)?,
        None => absolute(&cli.input)?
            .parent()
            .unwrap_or_else(|| Path::new("/"))
            .join(HLS_SUBDIR),
    };
    Ok((root, None))
}

fn output_location(cli: &Cli) -> Result<(PathBuf, PathBuf)> {
    let (root, dir) = plan_output(cli)?;
    let dir = match dir {
        Some(dir) => {
            fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
            dir
        }
        None => allocate_output_dir(&root)
            .with_context(|| format!("allocating output directory under {}", root.display()))?,
    };
    Ok((root, dir))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("resolving {}", path.display()))
}
