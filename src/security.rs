#![forbid(unsafe_code)]

//! Shared security helpers: privilege checks, client filename scrubbing and
//! path confinement for the static media routes.

use std::path::{Component, Path, PathBuf};

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when a binary is started as root. Uploaded files are written
/// with the privileges of the serving account, so the backend must run under
/// the dedicated unprivileged user.
pub fn ensure_not_root(process: &str) -> Result<()> {
    if Uid::current().is_root() {
        bail!("{process} must not be run as root; please use the ashn service account");
    }
    Ok(())
}

/// Turns an untrusted client filename into a flat, filesystem-safe token.
///
/// Only the final path component survives (both `/` and `\` count as
/// separators), whitespace runs collapse to `_`, anything outside
/// `[A-Za-z0-9._-]` is dropped and leading/trailing dots and underscores are
/// trimmed so the result can never be `..` or a hidden file. The result may be
/// empty; callers pick their own fallback.
pub fn secure_filename(raw: &str) -> String {
    let last = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let joined = last.split_whitespace().collect::<Vec<_>>().join("_");
    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    kept.trim_matches(|c| c == '.' || c == '_').to_owned()
}

/// Joins a URL-supplied relative path onto `root`, refusing anything that
/// could escape it (`..`, absolute paths, drive prefixes, empty paths).
pub fn resolve_within(root: &Path, relative: &str) -> Option<PathBuf> {
    if relative.is_empty() || relative.contains('\\') {
        return None;
    }

    let candidate = Path::new(relative);
    let mut resolved = root.to_path_buf();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }

    if resolved == root {
        return None;
    }
    Some(resolved)
}
