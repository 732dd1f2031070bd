//! Provider contract for disk-encryption and filesystem tooling.
//!
//! Mirrors the phases of the encrypt/unlock workflows: every method maps to a
//! single external invocation so the workflow can tag failures by phase.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};

/// On-disk LUKS header generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LuksVersion {
    Luks1,
    Luks2,
}

impl LuksVersion {
    /// `cryptsetup --type` spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Luks1 => "luks1",
            Self::Luks2 => "luks2",
        }
    }

    pub fn from_number(version: u8) -> Option<Self> {
        match version {
            1 => Some(Self::Luks1),
            2 => Some(Self::Luks2),
            _ => None,
        }
    }
}

/// Filesystems the encrypt workflow is able to create.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemType {
    #[default]
    Exfat,
    Ext4,
    /// FAT32.
    Vfat,
}

impl FilesystemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exfat => "exfat",
            Self::Ext4 => "ext4",
            Self::Vfat => "vfat",
        }
    }

    /// Accepts the spellings users and `blkid` commonly produce.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "exfat" => Some(Self::Exfat),
            "ext4" => Some(Self::Ext4),
            "vfat" | "fat32" | "fat" => Some(Self::Vfat),
            _ => None,
        }
    }
}

impl fmt::Display for FilesystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key-derivation function for new LUKS keyslots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum KdfKind {
    #[default]
    Argon2id,
    Pbkdf2,
}

impl KdfKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Argon2id => "argon2id",
            Self::Pbkdf2 => "pbkdf2",
        }
    }
}

/// Parameters for a fresh LUKS container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LuksFormatParams {
    pub version: LuksVersion,
    pub kdf: KdfKind,
    /// Cipher specification, e.g. `aes-xts-plain64`.
    pub cipher: String,
    /// Key size in bits.
    pub key_size: u32,
    pub label: Option<String>,
}

/// Abstraction over `cryptsetup`, `mkfs.*`, `blkid`, and `mount`.
pub trait CryptTooling {
    type Error: Error + Send + Sync + 'static;

    /// Read the LUKS header of `device`, `None` when it is not a LUKS container.
    fn luks_version(&self, device: &str) -> Result<Option<LuksVersion>, Self::Error>;

    /// Write a new LUKS header to `device` protected by `passphrase`.
    fn luks_format(
        &self,
        device: &str,
        params: &LuksFormatParams,
        passphrase: &[u8],
    ) -> Result<(), Self::Error>;

    /// Unlock `device` as `/dev/mapper/<name>` and return the mapped node.
    fn open(
        &self,
        device: &str,
        name: &str,
        passphrase: &[u8],
        read_only: bool,
    ) -> Result<PathBuf, Self::Error>;

    /// Tear down a mapping; closing an absent mapping is not an error.
    fn close(&self, name: &str) -> Result<(), Self::Error>;

    /// Create a filesystem on `device`.
    fn make_filesystem(
        &self,
        device: &Path,
        fs: FilesystemType,
        label: Option<&str>,
    ) -> Result<(), Self::Error>;

    /// Detected filesystem type on `device`, `None` when blank.
    fn filesystem_type(&self, device: &Path) -> Result<Option<String>, Self::Error>;

    /// Mount `device` at `mountpoint` with the given options.
    fn mount(&self, device: &Path, mountpoint: &Path, options: &[String])
        -> Result<(), Self::Error>;

    /// Unmount whatever is mounted at `mountpoint`.
    fn unmount(&self, mountpoint: &Path) -> Result<(), Self::Error>;

    /// Every current mount point of `device`.
    fn mount_points(&self, device: &Path) -> Result<Vec<PathBuf>, Self::Error>;
}
