//! Raw block-device properties as reported by the hotplug layer.

use serde::{Deserialize, Serialize};
use std::error::Error;

/// Whole disk or partition, mirroring udev's `DEVTYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevType {
    Disk,
    Partition,
}

/// Snapshot of the properties the classifier needs for one device node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProperties {
    /// Device node, e.g. `/dev/sdb1`. Stable key for the registry.
    pub path: String,
    /// Bus the device hangs off (`usb`, `ata`, `nvme`, ...), if known.
    pub bus: Option<String>,
    pub devtype: DevType,
    /// `ID_FS_TYPE`, e.g. `exfat` or `crypto_LUKS`.
    pub fs_type: Option<String>,
    /// `ID_FS_USAGE`, e.g. `filesystem` or `crypto`.
    pub fs_usage: Option<String>,
    /// LUKS header version when the node is a crypto container (1 or 2).
    pub luks_version: Option<u8>,
    /// True for a decrypted dm-crypt mapping.
    pub is_mapper: bool,
    /// Parent disk node for partitions.
    pub parent: Option<String>,
    /// True when a whole disk carries a partition table.
    pub has_partitions: bool,
}

impl DeviceProperties {
    /// Minimal properties for a node; callers fill in what they observed.
    pub fn new(path: impl Into<String>, devtype: DevType) -> Self {
        Self {
            path: path.into(),
            bus: None,
            devtype,
            fs_type: None,
            fs_usage: None,
            luks_version: None,
            is_mapper: false,
            parent: None,
            has_partitions: false,
        }
    }

    pub fn is_usb(&self) -> bool {
        self.bus
            .as_deref()
            .map(|bus| bus.eq_ignore_ascii_case("usb"))
            .unwrap_or(false)
    }

    pub fn is_partition(&self) -> bool {
        self.devtype == DevType::Partition
    }
}

/// Re-reads the current properties of a device node on demand.
///
/// Used after a crypto workflow finishes, when the on-disk format may have
/// changed underneath the registry entry.
pub trait DeviceProbe {
    type Error: Error + Send + Sync + 'static;

    /// Return `None` when the node no longer exists.
    fn probe(&self, path: &str) -> Result<Option<DeviceProperties>, Self::Error>;
}
