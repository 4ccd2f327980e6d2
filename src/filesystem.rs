//! Idempotent filesystem helpers
//!
//! Used during bootstrap, before any service runs, and by the service adapters
//! when they write their own config files.

use std::fs;
use std::io::Write;
use std::path::Path;

use tracing::debug;

use crate::{Error, Result};

/// Mode for private keys and credentials
pub const MODE_PRIVATE: u32 = 0o600;

/// Mode for world-readable config and certificates
pub const MODE_PUBLIC: u32 = 0o644;

/// Mode for executables
pub const MODE_EXECUTABLE: u32 = 0o755;

/// Whether anything exists at `path` (following symlinks)
pub fn file_exists(path: &Path) -> bool {
    path.exists()
}

/// Create `path` and its parents if missing
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| {
        Error::filesystem(format!("failed to create directory {}: {}", path.display(), e))
    })
}

/// Write `contents` to `path` with the given permission bits, replacing any existing file
///
/// The parent directory is created on demand. The file is created with `mode`
/// directly, so a private key is never readable by others, even briefly.
pub fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }

    let mut file = options
        .open(path)
        .map_err(|e| Error::filesystem(format!("failed to open {}: {}", path.display(), e)))?;
    file.write_all(contents)
        .map_err(|e| Error::filesystem(format!("failed to write {}: {}", path.display(), e)))?;

    // The mode passed to open() is filtered by umask and ignored for existing files
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| {
            Error::filesystem(format!("failed to set mode on {}: {}", path.display(), e))
        })?;
    }

    Ok(())
}

/// Copy `source` to `dest` with `mode`, unless `dest` already exists
///
/// Returns whether a copy happened.
pub fn copy_if_missing(source: &Path, dest: &Path, mode: u32) -> Result<bool> {
    if file_exists(dest) {
        debug!(path = %dest.display(), "Already present, skipping");
        return Ok(false);
    }

    let contents = fs::read(source).map_err(|e| {
        Error::filesystem(format!("failed to read {}: {}", source.display(), e))
    })?;
    write_file(dest, &contents, mode)?;

    debug!(source = %source.display(), dest = %dest.display(), "Copied");
    Ok(true)
}

/// Copy `source` to `dest` as an executable, unless `dest` already exists
pub fn extract_binary(source: &Path, dest: &Path) -> Result<bool> {
    copy_if_missing(source, dest, MODE_EXECUTABLE)
}

/// Point `link` at `target`, replacing whatever is at `link`
///
/// An existing file, symlink or empty directory at `link` is removed first.
pub fn ensure_symlink(target: &Path, link: &Path) -> Result<()> {
    if let Some(parent) = link.parent() {
        ensure_dir(parent)?;
    }

    match fs::symlink_metadata(link) {
        Ok(meta) if meta.is_dir() => fs::remove_dir(link),
        Ok(_) => fs::remove_file(link),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
    .map_err(|e| {
        Error::filesystem(format!("failed to remove existing {}: {}", link.display(), e))
    })?;

    #[cfg(unix)]
    std::os::unix::fs::symlink(target, link).map_err(|e| {
        Error::filesystem(format!(
            "failed to link {} -> {}: {}",
            link.display(),
            target.display(),
            e
        ))
    })?;

    debug!(link = %link.display(), target = %target.display(), "Symlink in place");
    Ok(())
}
