//! The host platform: system tooling plus udev-backed device probing.

use crate::udev_monitor;
use std::path::{Path, PathBuf};
use usb_enforcer_core::EnforcerError;
use usb_enforcer_luks::SystemTooling;
use usb_enforcer_provider::{
    BlockControl, CryptTooling, DeviceProbe, DeviceProperties, FilesystemType, LuksFormatParams,
    LuksVersion, SessionProbe,
};

type Result<T> = std::result::Result<T, EnforcerError>;

pub struct HostPlatform {
    tooling: SystemTooling,
}

impl HostPlatform {
    pub fn new(tooling: SystemTooling) -> Self {
        Self { tooling }
    }
}

impl DeviceProbe for HostPlatform {
    type Error = EnforcerError;

    fn probe(&self, path: &str) -> Result<Option<DeviceProperties>> {
        udev_monitor::probe_node(path).map_err(|err| {
            EnforcerError::Provider(format!("udev lookup of {path} failed: {err}"))
        })
    }
}

impl BlockControl for HostPlatform {
    type Error = EnforcerError;

    fn set_read_only(&self, device: &str, read_only: bool) -> Result<()> {
        self.tooling.set_read_only(device, read_only)
    }

    fn is_read_only(&self, device: &str) -> Result<bool> {
        self.tooling.is_read_only(device)
    }
}

impl SessionProbe for HostPlatform {
    type Error = EnforcerError;

    fn active_user_groups(&self) -> Result<Vec<String>> {
        self.tooling.active_user_groups()
    }
}

impl CryptTooling for HostPlatform {
    type Error = EnforcerError;

    fn luks_version(&self, device: &str) -> Result<Option<LuksVersion>> {
        self.tooling.luks_version(device)
    }

    fn luks_format(
        &self,
        device: &str,
        params: &LuksFormatParams,
        passphrase: &[u8],
    ) -> Result<()> {
        self.tooling.luks_format(device, params, passphrase)
    }

    fn open(
        &self,
        device: &str,
        name: &str,
        passphrase: &[u8],
        read_only: bool,
    ) -> Result<PathBuf> {
        self.tooling.open(device, name, passphrase, read_only)
    }

    fn close(&self, name: &str) -> Result<()> {
        self.tooling.close(name)
    }

    fn make_filesystem(
        &self,
        device: &Path,
        fs: FilesystemType,
        label: Option<&str>,
    ) -> Result<()> {
        self.tooling.make_filesystem(device, fs, label)
    }

    fn filesystem_type(&self, device: &Path) -> Result<Option<String>> {
        self.tooling.filesystem_type(device)
    }

    fn mount(&self, device: &Path, mountpoint: &Path, options: &[String]) -> Result<()> {
        self.tooling.mount(device, mountpoint, options)
    }

    fn unmount(&self, mountpoint: &Path) -> Result<()> {
        self.tooling.unmount(mountpoint)
    }

    fn mount_points(&self, device: &Path) -> Result<Vec<PathBuf>> {
        self.tooling.mount_points(device)
    }
}
