//! Minimal in-memory platform for exercising the listeners.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use usb_enforcer_core::{
    EnforcementEngine, EnforcerConfig, EnforcerContext, EnforcerError, EnforcerService,
};
use usb_enforcer_provider::{
    BlockControl, CryptTooling, DeviceProbe, DeviceProperties, FilesystemType, LuksFormatParams,
    LuksVersion, SessionProbe,
};

type Result<T> = std::result::Result<T, EnforcerError>;

#[derive(Default)]
pub(crate) struct StubPlatform {
    read_only: Mutex<HashMap<String, bool>>,
}

pub(crate) fn stub_service() -> EnforcerService<StubPlatform> {
    let ctx = EnforcerContext::new(EnforcerConfig::default(), Arc::new(StubPlatform::default()));
    EnforcerService::new(Arc::new(EnforcementEngine::new(ctx)))
}

fn unavailable<T>() -> Result<T> {
    Err(EnforcerError::Provider("not available in tests".into()))
}

impl BlockControl for StubPlatform {
    type Error = EnforcerError;

    fn set_read_only(&self, device: &str, read_only: bool) -> Result<()> {
        self.read_only
            .lock()
            .unwrap()
            .insert(device.to_string(), read_only);
        Ok(())
    }

    fn is_read_only(&self, device: &str) -> Result<bool> {
        Ok(self
            .read_only
            .lock()
            .unwrap()
            .get(device)
            .copied()
            .unwrap_or(false))
    }
}

impl SessionProbe for StubPlatform {
    type Error = EnforcerError;

    fn active_user_groups(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

impl DeviceProbe for StubPlatform {
    type Error = EnforcerError;

    fn probe(&self, _path: &str) -> Result<Option<DeviceProperties>> {
        Ok(None)
    }
}

impl CryptTooling for StubPlatform {
    type Error = EnforcerError;

    fn luks_version(&self, _device: &str) -> Result<Option<LuksVersion>> {
        Ok(None)
    }

    fn luks_format(&self, _: &str, _: &LuksFormatParams, _: &[u8]) -> Result<()> {
        unavailable()
    }

    fn open(&self, _: &str, _: &str, _: &[u8], _: bool) -> Result<PathBuf> {
        unavailable()
    }

    fn close(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn make_filesystem(&self, _: &Path, _: FilesystemType, _: Option<&str>) -> Result<()> {
        unavailable()
    }

    fn filesystem_type(&self, _device: &Path) -> Result<Option<String>> {
        Ok(None)
    }

    fn mount(&self, _: &Path, _: &Path, _: &[String]) -> Result<()> {
        unavailable()
    }

    fn unmount(&self, _mountpoint: &Path) -> Result<()> {
        Ok(())
    }

    fn mount_points(&self, _device: &Path) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }
}
