//! Unix socket setup for the daemon's two endpoints.

use anyhow::{bail, Context, Result};
use log::debug;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::Path;
use tokio::net::UnixListener;

/// Owner-only, for the passphrase hand-off.
pub const SECRETS_SOCKET_MODE: u32 = 0o600;
/// World-connectable; the API never carries secrets.
pub const API_SOCKET_MODE: u32 = 0o666;

/// Bind `path`, replacing a stale socket left by a previous run.
///
/// Anything at `path` that is not a socket is left alone and reported.
pub fn bind(path: &Path, mode: u32) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create socket directory {}", parent.display()))?;
    }

    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            debug!("removing stale socket {}", path.display());
            fs::remove_file(path)
                .with_context(|| format!("remove stale socket {}", path.display()))?;
        }
        Ok(_) => bail!("{} exists and is not a socket", path.display()),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("inspect {}", path.display()));
        }
    }

    let listener =
        UnixListener::bind(path).with_context(|| format!("bind {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("set permissions on {}", path.display()))?;
    Ok(listener)
}

/// Best-effort removal at shutdown.
pub fn remove(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != ErrorKind::NotFound {
            debug!("could not remove {}: {err}", path.display());
        }
    }
}
