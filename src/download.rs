use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use directories::BaseDirs;
use regex::Regex;
use tracing::{debug, info};

use crate::annas::default_filename;
use crate::backend::Backend;
use crate::domain::{DownloadReport, DownloadRequest, DownloadStatus, Source};
use crate::error::BookError;

static UNSAFE_FILENAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).expect("valid regex"));

/// Directory candidates in priority order; the first present one wins.
#[derive(Debug, Clone, Default)]
pub struct OutputDirs {
    pub explicit: Option<PathBuf>,
    pub configured: Option<PathBuf>,
    pub backend_default: Option<PathBuf>,
    pub fallback: Option<PathBuf>,
}

impl OutputDirs {
    pub fn resolve(&self) -> Result<PathBuf, BookError> {
        self.explicit
            .clone()
            .or_else(|| self.configured.clone())
            .or_else(|| self.backend_default.clone())
            .or_else(|| self.fallback.clone())
            .or_else(fallback_download_dir)
            .ok_or_else(|| {
                BookError::Filesystem("unable to resolve a download directory".to_string())
            })
    }
}

/// `~/Downloads`, used when nothing else names a directory.
pub fn fallback_download_dir() -> Option<PathBuf> {
    BaseDirs::new().map(|dirs| dirs.home_dir().join("Downloads"))
}

pub fn sanitize_filename(name: &str) -> String {
    let cleaned = UNSAFE_FILENAME_CHARS.replace_all(name.trim(), "_");
    let cleaned = cleaned.trim_matches('.').trim();
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Fetches the book through `backend` and writes it under the resolved
/// directory. The file only appears at its final path once every byte is on
/// disk; an existing file is replaced.
pub fn download(
    backend: &dyn Backend,
    request: &DownloadRequest,
    dirs: &OutputDirs,
) -> Result<DownloadReport, BookError> {
    let source = backend.source();
    request.validate(source)?;
    backend.ensure_configured()?;

    let dir = dirs.resolve()?;
    fs::create_dir_all(&dir)
        .map_err(|err| BookError::Filesystem(format!("create {}: {err}", dir.display())))?;
    let dir = fs::canonicalize(&dir)
        .map_err(|err| BookError::Filesystem(format!("resolve {}: {err}", dir.display())))?;

    let mut request = request.clone();
    if source == Source::Annas && request.filename.is_none() {
        request.filename = Some(default_filename(&request.hash));
    }

    let mut payload = backend.fetch(&request)?;
    let filename = request
        .filename
        .clone()
        .or_else(|| payload.filename.take())
        .unwrap_or_else(|| default_filename(&request.hash));
    let target = dir.join(sanitize_filename(&filename));
    debug!(path = %target.display(), "writing download");

    let size = write_atomic(&dir, &target, &mut payload.reader, |size| {
        match payload.expected_len {
            Some(expected) if expected != size => Err(BookError::Unavailable {
                backend: source,
                message: "transfer was truncated".to_string(),
                detail: Some(format!("expected {expected} bytes, received {size}")),
            }),
            _ => Ok(()),
        }
    })?;
    info!(%source, size, path = %target.display(), "download complete");

    Ok(DownloadReport {
        source,
        status: DownloadStatus::Ok,
        path: target.to_string_lossy().into_owned(),
        size,
        quota: None,
    })
}

/// Copies `reader` into a `.part` file next to `target` and renames it into
/// place only if `check` accepts the byte count.
fn write_atomic(
    dir: &Path,
    target: &Path,
    reader: &mut dyn io::Read,
    check: impl FnOnce(u64) -> Result<(), BookError>,
) -> Result<u64, BookError> {
    let mut temp = tempfile::Builder::new()
        .prefix(".book-download")
        .suffix(".part")
        .tempfile_in(dir)
        .map_err(|err| BookError::Filesystem(err.to_string()))?;
    let size = io::copy(reader, temp.as_file_mut()).map_err(|err| {
        BookError::Filesystem(format!("write {}: {err}", target.display()))
    })?;
    temp.as_file_mut()
        .flush()
        .and_then(|()| temp.as_file().sync_all())
        .map_err(|err| BookError::Filesystem(err.to_string()))?;
    check(size)?;
    temp.persist(target)
        .map_err(|err| BookError::Filesystem(err.error.to_string()))?;
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_reserved_characters() {
        assert_eq!(
            sanitize_filename("Deep: Learning / Vol 1?.pdf"),
            "Deep_ Learning _ Vol 1_.pdf"
        );
        assert_eq!(sanitize_filename("../"), "_");
        assert_eq!(sanitize_filename("  "), "download");
    }

    #[test]
    fn explicit_dir_wins() {
        let dirs = OutputDirs {
            explicit: Some(PathBuf::from("/tmp/explicit")),
            configured: Some(PathBuf::from("/tmp/configured")),
            backend_default: None,
            fallback: Some(PathBuf::from("/tmp/fallback")),
        };
        assert_eq!(dirs.resolve().unwrap(), PathBuf::from("/tmp/explicit"));

        let dirs = OutputDirs {
            explicit: None,
            ..dirs
        };
        assert_eq!(dirs.resolve().unwrap(), PathBuf::from("/tmp/configured"));
    }
}
