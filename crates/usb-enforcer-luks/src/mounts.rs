//! Mount table lookup.

use std::fs;
use std::path::{Path, PathBuf};
use usb_enforcer_core::error::EnforcerResult;

/// Alternate mount table, used by tests and containers without `/proc`.
pub const MOUNTS_OVERRIDE_ENV: &str = "USB_ENFORCER_MOUNTS_PATH";

pub(crate) const PROC_MOUNTS: &str = "/proc/mounts";

pub(crate) fn default_mount_table() -> PathBuf {
    std::env::var_os(MOUNTS_OVERRIDE_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(PROC_MOUNTS))
}

/// Every mount point of `devnode` listed in `table`.
pub(crate) fn find_mount_points(table: &Path, devnode: &Path) -> EnforcerResult<Vec<PathBuf>> {
    let contents = fs::read_to_string(table)?;
    let mut wanted = vec![devnode.to_path_buf()];
    if let Ok(canonical) = fs::canonicalize(devnode) {
        if canonical != devnode {
            wanted.push(canonical);
        }
    }
    Ok(parse_mounts(&contents, &wanted))
}

fn parse_mounts(mounts: &str, wanted: &[PathBuf]) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for line in mounts.lines() {
        let mut parts = line.split_whitespace();
        let (Some(device), Some(mountpoint)) = (parts.next(), parts.next()) else {
            continue;
        };
        let device = PathBuf::from(unescape_mount_field(device));
        if wanted.iter().any(|candidate| *candidate == device) {
            found.push(PathBuf::from(unescape_mount_field(mountpoint)));
        }
    }
    found
}

fn unescape_mount_field(input: &str) -> String {
    let mut chars = input.chars().peekable();
    let mut output = String::with_capacity(input.len());

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            output.push(ch);
            continue;
        }
        let mut oct = String::new();
        while oct.len() < 3 {
            match chars.peek() {
                Some(next) if next.is_digit(8) => {
                    oct.push(*next);
                    chars.next();
                }
                _ => break,
            }
        }
        match u8::from_str_radix(&oct, 8) {
            Ok(value) if oct.len() == 3 => output.push(value as char),
            _ => {
                output.push('\\');
                output.push_str(&oct);
            }
        }
    }

    output
}
