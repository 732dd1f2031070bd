//! Device classification and the per-device enforcement record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use usb_enforcer_provider::{DevType, DeviceProperties, LuksVersion};

/// LUKS on-disk magic, `"LUKS\xba\xbe"`, followed by a big-endian `u16` version.
const LUKS_MAGIC: &[u8; 6] = b"LUKS\xba\xbe";
/// LUKS2 secondary header magic, `"SKUL\xba\xbe"`.
const LUKS2_SECONDARY_MAGIC: &[u8; 6] = b"SKUL\xba\xbe";
pub const LUKS_HEADER_PROBE_LEN: usize = 8;

/// What kind of volume a device node carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    PlaintextPartition,
    PlaintextDisk,
    Luks1,
    Luks2,
    Mapper,
    NonUsb,
    Unsupported,
}

impl DeviceClass {
    pub fn is_plaintext(&self) -> bool {
        matches!(self, DeviceClass::PlaintextPartition | DeviceClass::PlaintextDisk)
    }

    pub fn luks_version(&self) -> Option<LuksVersion> {
        match self {
            DeviceClass::Luks1 => Some(LuksVersion::Luks1),
            DeviceClass::Luks2 => Some(LuksVersion::Luks2),
            DeviceClass::PlaintextPartition
            | DeviceClass::PlaintextDisk
            | DeviceClass::Mapper
            | DeviceClass::NonUsb
            | DeviceClass::Unsupported => None,
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeviceClass::PlaintextPartition => "plaintext-partition",
            DeviceClass::PlaintextDisk => "plaintext-disk",
            DeviceClass::Luks1 => "luks1",
            DeviceClass::Luks2 => "luks2",
            DeviceClass::Mapper => "mapper",
            DeviceClass::NonUsb => "non-usb",
            DeviceClass::Unsupported => "unsupported",
        };
        f.write_str(label)
    }
}

/// Enforcement status of a single device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementState {
    Unmonitored,
    ReadOnlyEnforced,
    WriteAllowed,
    Exempt,
    Suspended,
}

impl fmt::Display for EnforcementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EnforcementState::Unmonitored => "unmonitored",
            EnforcementState::ReadOnlyEnforced => "read-only-enforced",
            EnforcementState::WriteAllowed => "write-allowed",
            EnforcementState::Exempt => "exempt",
            EnforcementState::Suspended => "suspended",
        };
        f.write_str(label)
    }
}

/// Map raw device properties to a [`DeviceClass`].
///
/// Rules apply in priority order: bus filter, mapper, crypto container,
/// filesystem, then `Unsupported`. A whole disk carrying a partition table is
/// `Unsupported`; its partitions are evaluated individually.
pub fn classify(props: &DeviceProperties, usb_only: bool) -> DeviceClass {
    if usb_only && !props.is_usb() {
        return DeviceClass::NonUsb;
    }

    if props.is_mapper {
        return DeviceClass::Mapper;
    }

    if props.devtype == DevType::Disk && props.has_partitions {
        return DeviceClass::Unsupported;
    }

    if is_crypto_container(props) {
        return match props.luks_version.and_then(LuksVersion::from_number) {
            Some(LuksVersion::Luks1) => DeviceClass::Luks1,
            Some(LuksVersion::Luks2) => DeviceClass::Luks2,
            None => DeviceClass::Unsupported,
        };
    }

    match props.fs_type.as_deref().map(str::trim) {
        Some(fs) if !fs.is_empty() => match props.devtype {
            DevType::Partition => DeviceClass::PlaintextPartition,
            DevType::Disk => DeviceClass::PlaintextDisk,
        },
        _ => DeviceClass::Unsupported,
    }
}

/// Short reason for an `Unsupported` verdict, suitable for logs.
pub fn unsupported_reason(props: &DeviceProperties) -> &'static str {
    if props.devtype == DevType::Disk && props.has_partitions {
        "whole disk with a partition table"
    } else if is_crypto_container(props) {
        if is_luks(props) {
            "unreadable or unknown LUKS header version"
        } else {
            "crypto container that is not LUKS"
        }
    } else {
        "no filesystem detected"
    }
}

fn is_crypto_container(props: &DeviceProperties) -> bool {
    props
        .fs_usage
        .as_deref()
        .map(|usage| usage.eq_ignore_ascii_case("crypto"))
        .unwrap_or(false)
        || is_luks(props)
}

fn is_luks(props: &DeviceProperties) -> bool {
    props
        .fs_type
        .as_deref()
        .map(|fs| fs.eq_ignore_ascii_case("crypto_LUKS"))
        .unwrap_or(false)
}

/// Decode the LUKS version from the first bytes of a block device.
pub fn probe_luks_header(header: &[u8]) -> Option<LuksVersion> {
    if header.len() < LUKS_HEADER_PROBE_LEN {
        return None;
    }
    let magic = &header[..6];
    if magic != LUKS_MAGIC && magic != LUKS2_SECONDARY_MAGIC {
        return None;
    }
    let version = u16::from_be_bytes([header[6], header[7]]);
    u8::try_from(version).ok().and_then(LuksVersion::from_number)
}

/// Authoritative registry record for one device node.
#[derive(Debug, Clone)]
pub struct Device {
    pub props: DeviceProperties,
    pub class: DeviceClass,
    pub state: EnforcementState,
    pub last_seen: DateTime<Utc>,
    /// Where the decrypted volume is mounted after a successful workflow.
    pub mountpoint: Option<String>,
}

impl Device {
    pub fn new(props: DeviceProperties, class: DeviceClass, state: EnforcementState) -> Self {
        Self {
            props,
            class,
            state,
            last_seen: Utc::now(),
            mountpoint: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.props.path
    }

    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            path: self.props.path.clone(),
            class: self.class,
            state: self.state,
            bus: self.props.bus.clone(),
            filesystem: self.props.fs_type.clone(),
            parent: self.props.parent.clone(),
            last_seen: self.last_seen,
            mountpoint: self.mountpoint.clone(),
            operation: None,
        }
    }
}

/// Client-facing view of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub path: String,
    pub class: DeviceClass,
    pub state: EnforcementState,
    #[serde(default)]
    pub bus: Option<String>,
    #[serde(default)]
    pub filesystem: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub mountpoint: Option<String>,
    #[serde(default)]
    pub operation: Option<crate::operation::OperationSummary>,
}
