//! Sandboxed file transfer for `file_upload` and `file_download`.
//!
//! ## Path validation
//!
//! A client-supplied filename must be a single plain path component: no
//! directory separators, no `.`/`..`, no absolute paths, no null bytes. The
//! target is `<sandbox dir>/<filename>`, and for files that already exist the
//! canonical path must still lie inside the sandbox (symlinks cannot escape).
//!
//! ## Atomicity
//!
//! Uploads use a temp-file-then-rename pattern in the sandbox directory, so
//! readers never see a partially-written file.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::UploadError;

/// Monotonic counter to uniquify temp file names across concurrent uploads.
static WRITE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Resolve `filename` inside `dir`, rejecting anything that could land
/// outside it.
pub async fn resolve_in_sandbox(dir: &Path, filename: &str) -> Result<PathBuf, UploadError> {
    let invalid = || UploadError::InvalidFilename(filename.to_string());
    if filename.is_empty() || filename.contains('\0') {
        return Err(invalid());
    }
    let mut components = Path::new(filename).components();
    let name = match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => name,
        _ => return Err(invalid()),
    };
    // Normal components never contain separators, but a trailing slash
    // ("name/") is silently dropped by `components()`.
    if filename.ends_with('/') {
        return Err(invalid());
    }

    let target = dir.join(name);
    if target.parent() != Some(dir) {
        return Err(UploadError::OutsideSandbox(filename.to_string()));
    }
    if tokio::fs::symlink_metadata(&target).await.is_ok() {
        ensure_within(dir, &target, filename).await?;
    }
    Ok(target)
}

/// Fail unless the canonical form of `target` lies inside `dir`.
async fn ensure_within(dir: &Path, target: &Path, filename: &str) -> Result<(), UploadError> {
    let root = tokio::fs::canonicalize(dir).await?;
    match tokio::fs::canonicalize(target).await {
        Ok(resolved) if resolved.starts_with(&root) => Ok(()),
        // Dangling symlink: the rename replaces the link itself, never its target.
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Ok(_) => Err(UploadError::OutsideSandbox(filename.to_string())),
        Err(e) => Err(e.into()),
    }
}

/// Atomically write `data` to `path`.
pub async fn write_upload(path: &Path, data: &[u8]) -> Result<(), UploadError> {
    let parent = path.parent().unwrap_or(Path::new("."));
    let seq = WRITE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp_path = parent.join(format!(".termgate_tmp_{}_{}", std::process::id(), seq));

    if let Err(e) = tokio::fs::write(&temp_path, data).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(io_error(e, path));
    }
    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(io_error(e, path));
    }
    Ok(())
}

/// Read a sandboxed file for download, refusing files over `max_size`.
pub async fn read_download(path: &Path, max_size: usize) -> Result<Vec<u8>, UploadError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| io_error(e, path))?;
    if metadata.is_dir() {
        return Err(UploadError::InvalidFilename(path.display().to_string()));
    }
    if metadata.len() > max_size as u64 {
        return Err(UploadError::TooLarge {
            size: metadata.len(),
            max: max_size,
        });
    }
    tokio::fs::read(path).await.map_err(|e| io_error(e, path))
}

fn io_error(e: std::io::Error, path: &Path) -> UploadError {
    match e.kind() {
        ErrorKind::NotFound => UploadError::NotFound(display_name(path)),
        ErrorKind::PermissionDenied => UploadError::PermissionDenied(display_name(path)),
        _ => UploadError::Io(e),
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}
