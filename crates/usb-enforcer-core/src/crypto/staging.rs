//! Owner-only scratch space for data preserved across a re-format.

use crate::error::{EnforcerError, EnforcerResult};
use log::debug;
use std::ffi::CString;
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{symlink, DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const STAGING_MODE: u32 = 0o700;

fn staging_err(path: &Path, reason: impl Into<String>) -> EnforcerError {
    EnforcerError::Staging {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// A `0700` directory under the staging root holding one operation's copy.
#[derive(Debug)]
pub struct StagingArea {
    path: PathBuf,
}

impl StagingArea {
    pub fn create(root: &Path, tag: &str) -> EnforcerResult<Self> {
        DirBuilder::new()
            .recursive(true)
            .mode(STAGING_MODE)
            .create(root)
            .map_err(|err| staging_err(root, err.to_string()))?;
        fs::set_permissions(root, fs::Permissions::from_mode(STAGING_MODE))
            .map_err(|err| staging_err(root, err.to_string()))?;

        let path = root.join(tag);
        DirBuilder::new()
            .mode(STAGING_MODE)
            .create(&path)
            .map_err(|err| staging_err(&path, err.to_string()))?;
        // umask may have trimmed the mode bits.
        fs::set_permissions(&path, fs::Permissions::from_mode(STAGING_MODE))
            .map_err(|err| staging_err(&path, err.to_string()))?;
        debug!("created staging area {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn remove(self) -> EnforcerResult<()> {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(staging_err(&self.path, err.to_string())),
        }
    }

    /// Give up ownership without deleting; used when the copy must survive.
    pub fn into_path(self) -> PathBuf {
        self.path
    }
}

/// Total bytes of regular files below `root`. Symlinks are not followed.
pub fn tree_size(root: &Path) -> EnforcerResult<u64> {
    let mut total = 0u64;
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|err| staging_err(root, err.to_string()))?;
        if entry.file_type().is_file() {
            let meta = entry
                .metadata()
                .map_err(|err| staging_err(entry.path(), err.to_string()))?;
            total = total.saturating_add(meta.len());
        }
    }
    Ok(total)
}

/// Bytes available to unprivileged writers on the filesystem holding `path`.
pub fn available_space(path: &Path) -> EnforcerResult<u64> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| staging_err(path, "path contains a NUL byte"))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(staging_err(path, io::Error::last_os_error().to_string()));
    }
    Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
}

/// Fail unless `required` fits in `available` minus `headroom_percent`.
pub fn ensure_capacity(
    root: &Path,
    required: u64,
    available: u64,
    headroom_percent: u8,
) -> EnforcerResult<()> {
    let headroom = available / 100 * u64::from(headroom_percent.min(100));
    let usable = available.saturating_sub(headroom);
    if required > usable {
        return Err(staging_err(
            root,
            format!("need {required} bytes but only {usable} usable ({available} free)"),
        ));
    }
    Ok(())
}

/// Copy the tree under `src` into `dst`, keeping permissions and symlinks.
pub fn copy_tree(src: &Path, dst: &Path) -> EnforcerResult<u64> {
    let mut copied = 0u64;
    for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|err| staging_err(src, err.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|err| staging_err(entry.path(), err.to_string()))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|err| staging_err(&target, err.to_string()))?;
            let mode = entry
                .metadata()
                .map_err(|err| staging_err(entry.path(), err.to_string()))?
                .permissions()
                .mode();
            fs::set_permissions(&target, fs::Permissions::from_mode(mode))
                .map_err(|err| staging_err(&target, err.to_string()))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())
                .map_err(|err| staging_err(entry.path(), err.to_string()))?;
            symlink(&link, &target).map_err(|err| staging_err(&target, err.to_string()))?;
        } else if file_type.is_file() {
            copied += fs::copy(entry.path(), &target)
                .map_err(|err| staging_err(&target, err.to_string()))?;
        } else {
            debug!("skipping special file {}", entry.path().display());
        }
    }
    Ok(copied)
}
