//! In-memory platform used by the core test suites.
//!
//! Each fake disk owns a backing directory standing in for its filesystem
//! contents. Mounting copies the backing directory into the mountpoint and
//! unmounting a writable mount copies it back.

use crate::crypto::staging::copy_tree;
use crate::error::{EnforcerError, EnforcerResult};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use usb_enforcer_provider::{
    BlockControl, CryptTooling, DevType, DeviceProbe, DeviceProperties, FilesystemType,
    LuksFormatParams, LuksVersion, SessionProbe,
};

struct FakeDisk {
    props: DeviceProperties,
    luks: Option<(LuksVersion, Vec<u8>)>,
    fs: Option<String>,
    backing: PathBuf,
    present: bool,
}

struct Mount {
    source: String,
    read_only: bool,
}

#[derive(Default)]
struct FakeState {
    disks: HashMap<String, FakeDisk>,
    read_only: HashMap<String, bool>,
    busy: HashMap<String, u32>,
    groups: Vec<String>,
    session_delay: Duration,
    mappings: HashMap<String, (String, bool)>,
    mounts: HashMap<PathBuf, Mount>,
    fail_mkfs: bool,
    calls: Vec<String>,
}

pub struct FakePlatform {
    root: PathBuf,
    state: Mutex<FakeState>,
}

fn provider(message: impl Into<String>) -> EnforcerError {
    EnforcerError::Provider(message.into())
}

fn clear_dir(dir: &Path) -> EnforcerResult<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    Ok(())
}

pub fn usb_props(path: &str) -> DeviceProperties {
    let is_partition = path.chars().last().map(|c| c.is_ascii_digit()).unwrap_or(false);
    let devtype = if is_partition {
        DevType::Partition
    } else {
        DevType::Disk
    };
    let mut props = DeviceProperties::new(path, devtype);
    props.bus = Some("usb".into());
    if is_partition {
        props.parent = Some(path.trim_end_matches(|c: char| c.is_ascii_digit()).to_string());
    }
    props
}

impl FakePlatform {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            state: Mutex::new(FakeState::default()),
        }
    }

    fn add(&self, path: &str, luks: Option<(LuksVersion, Vec<u8>)>, fs: Option<&str>) -> PathBuf {
        let backing = self
            .root
            .join("disks")
            .join(path.trim_start_matches('/').replace('/', "_"));
        fs::create_dir_all(&backing).unwrap();
        let mut state = self.state.lock().unwrap();
        state.disks.insert(
            path.to_string(),
            FakeDisk {
                props: usb_props(path),
                luks,
                fs: fs.map(str::to_string),
                backing: backing.clone(),
                present: true,
            },
        );
        backing
    }

    /// Plaintext volume; returns its backing directory for seeding files.
    pub fn add_plaintext(&self, path: &str, fs: &str) -> PathBuf {
        self.add(path, None, Some(fs))
    }

    pub fn add_luks(&self, path: &str, version: LuksVersion, passphrase: &[u8], fs: &str) -> PathBuf {
        self.add(path, Some((version, passphrase.to_vec())), Some(fs))
    }

    pub fn add_blank(&self, path: &str) {
        self.add(path, None, None);
    }

    pub fn unplug(&self, path: &str) {
        if let Some(disk) = self.state.lock().unwrap().disks.get_mut(path) {
            disk.present = false;
        }
    }

    pub fn set_groups(&self, groups: &[&str]) {
        self.state.lock().unwrap().groups = groups.iter().map(|g| g.to_string()).collect();
    }

    /// Stretch every session-group lookup by `delay`.
    pub fn slow_sessions(&self, delay: Duration) {
        self.state.lock().unwrap().session_delay = delay;
    }

    /// Make the next `times` read-only changes on `path` report busy.
    pub fn busy_for(&self, path: &str, times: u32) {
        self.state.lock().unwrap().busy.insert(path.to_string(), times);
    }

    pub fn fail_mkfs(&self) {
        self.state.lock().unwrap().fail_mkfs = true;
    }

    pub fn props(&self, path: &str) -> DeviceProperties {
        self.probe(path).unwrap().unwrap()
    }

    /// Simulated raw write; fails when the block device is read-only.
    pub fn write_block(&self, path: &str) -> EnforcerResult<()> {
        let state = self.state.lock().unwrap();
        if state.read_only.get(path).copied().unwrap_or(false) {
            return Err(provider(format!("{path}: Operation not permitted (read-only)")));
        }
        Ok(())
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn active_mappings(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().unwrap().mappings.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_mounted(&self, mountpoint: &Path) -> bool {
        self.state.lock().unwrap().mounts.contains_key(mountpoint)
    }

    /// Resolve a raw or `/dev/mapper/<name>` path to its disk key.
    fn resolve(state: &FakeState, device: &Path) -> Option<String> {
        let text = device.to_string_lossy();
        if let Some(name) = text.strip_prefix("/dev/mapper/") {
            return state.mappings.get(name).map(|(disk, _)| disk.clone());
        }
        state.disks.contains_key(&*text).then(|| text.into_owned())
    }
}

impl BlockControl for FakePlatform {
    type Error = EnforcerError;

    fn set_read_only(&self, device: &str, read_only: bool) -> EnforcerResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("setro {device} {read_only}"));
        if let Some(remaining) = state.busy.get_mut(device) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(EnforcerError::DeviceBusy(device.to_string()));
            }
        }
        state.read_only.insert(device.to_string(), read_only);
        Ok(())
    }

    fn is_read_only(&self, device: &str) -> EnforcerResult<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .read_only
            .get(device)
            .copied()
            .unwrap_or(false))
    }
}

impl SessionProbe for FakePlatform {
    type Error = EnforcerError;

    fn active_user_groups(&self) -> EnforcerResult<Vec<String>> {
        let (groups, delay) = {
            let state = self.state.lock().unwrap();
            (state.groups.clone(), state.session_delay)
        };
        thread::sleep(delay);
        Ok(groups)
    }
}

impl DeviceProbe for FakePlatform {
    type Error = EnforcerError;

    fn probe(&self, path: &str) -> EnforcerResult<Option<DeviceProperties>> {
        let state = self.state.lock().unwrap();
        let Some(disk) = state.disks.get(path).filter(|disk| disk.present) else {
            return Ok(None);
        };
        let mut props = disk.props.clone();
        match &disk.luks {
            Some((version, _)) => {
                props.fs_type = Some("crypto_LUKS".into());
                props.fs_usage = Some("crypto".into());
                props.luks_version = Some(match version {
                    LuksVersion::Luks1 => 1,
                    LuksVersion::Luks2 => 2,
                });
            }
            None => {
                props.fs_type = disk.fs.clone();
                props.fs_usage = disk.fs.as_ref().map(|_| "filesystem".to_string());
            }
        }
        Ok(Some(props))
    }
}

impl CryptTooling for FakePlatform {
    type Error = EnforcerError;

    fn luks_version(&self, device: &str) -> EnforcerResult<Option<LuksVersion>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .disks
            .get(device)
            .and_then(|disk| disk.luks.as_ref().map(|(v, _)| *v)))
    }

    fn luks_format(
        &self,
        device: &str,
        params: &LuksFormatParams,
        passphrase: &[u8],
    ) -> EnforcerResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(format!("luksFormat {device} {} {}", params.kdf.as_str(), params.cipher));
        if state.read_only.get(device).copied().unwrap_or(false) {
            return Err(provider(format!("{device} is read-only")));
        }
        if state.mounts.values().any(|m| m.source == device) {
            return Err(EnforcerError::DeviceBusy(device.to_string()));
        }
        let disk = state
            .disks
            .get_mut(device)
            .ok_or_else(|| provider(format!("{device} does not exist")))?;
        disk.luks = Some((params.version, passphrase.to_vec()));
        disk.fs = None;
        clear_dir(&disk.backing)
    }

    fn open(
        &self,
        device: &str,
        name: &str,
        passphrase: &[u8],
        read_only: bool,
    ) -> EnforcerResult<PathBuf> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("open {device} {name} ro={read_only}"));
        let disk = state
            .disks
            .get(device)
            .ok_or_else(|| provider(format!("{device} does not exist")))?;
        match &disk.luks {
            Some((_, key)) if key.as_slice() == passphrase => {}
            Some(_) => return Err(provider("No key available with this passphrase.")),
            None => return Err(provider(format!("{device} is not a LUKS device"))),
        }
        if state.mappings.contains_key(name) {
            return Err(provider(format!("Device {name} already exists.")));
        }
        state
            .mappings
            .insert(name.to_string(), (device.to_string(), read_only));
        Ok(PathBuf::from(format!("/dev/mapper/{name}")))
    }

    fn close(&self, name: &str) -> EnforcerResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("close {name}"));
        state.mappings.remove(name);
        Ok(())
    }

    fn make_filesystem(
        &self,
        device: &Path,
        fs: FilesystemType,
        label: Option<&str>,
    ) -> EnforcerResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!(
            "mkfs {} {} {}",
            fs.as_str(),
            device.display(),
            label.unwrap_or("")
        ));
        if state.fail_mkfs {
            return Err(provider(format!("mkfs.{fs} exited with status 1")));
        }
        let key = Self::resolve(&state, device)
            .ok_or_else(|| provider(format!("{} does not exist", device.display())))?;
        let disk = state
            .disks
            .get_mut(&key)
            .ok_or_else(|| provider("disk vanished"))?;
        disk.fs = Some(fs.as_str().to_string());
        clear_dir(&disk.backing)
    }

    fn filesystem_type(&self, device: &Path) -> EnforcerResult<Option<String>> {
        let state = self.state.lock().unwrap();
        let Some(key) = Self::resolve(&state, device) else {
            return Ok(None);
        };
        Ok(state.disks.get(&key).and_then(|disk| disk.fs.clone()))
    }

    fn mount(&self, device: &Path, mountpoint: &Path, options: &[String]) -> EnforcerResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!(
            "mount {} {} {}",
            device.display(),
            mountpoint.display(),
            options.join(",")
        ));
        let key = Self::resolve(&state, device)
            .ok_or_else(|| provider(format!("{} does not exist", device.display())))?;
        let disk = state
            .disks
            .get(&key)
            .ok_or_else(|| provider("disk vanished"))?;
        if disk.fs.is_none() {
            return Err(provider("wrong fs type, bad option, bad superblock"));
        }
        let mapped_ro = device
            .to_string_lossy()
            .strip_prefix("/dev/mapper/")
            .and_then(|name| state.mappings.get(name))
            .map(|(_, ro)| *ro)
            .unwrap_or(false);
        let read_only = mapped_ro || options.iter().any(|opt| opt == "ro");
        clear_dir(mountpoint)?;
        copy_tree(&disk.backing, mountpoint)?;
        state.mounts.insert(
            mountpoint.to_path_buf(),
            Mount {
                source: device.to_string_lossy().into_owned(),
                read_only,
            },
        );
        Ok(())
    }

    fn unmount(&self, mountpoint: &Path) -> EnforcerResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("umount {}", mountpoint.display()));
        let mount = state
            .mounts
            .remove(mountpoint)
            .ok_or_else(|| provider(format!("{}: not mounted", mountpoint.display())))?;
        if !mount.read_only {
            if let Some(key) = Self::resolve(&state, Path::new(&mount.source)) {
                if let Some(disk) = state.disks.get(&key) {
                    clear_dir(&disk.backing)?;
                    copy_tree(mountpoint, &disk.backing)?;
                }
            }
        }
        clear_dir(mountpoint)
    }

    fn mount_points(&self, device: &Path) -> EnforcerResult<Vec<PathBuf>> {
        let state = self.state.lock().unwrap();
        let wanted = device.to_string_lossy().into_owned();
        let mut found: Vec<PathBuf> = state
            .mounts
            .iter()
            .filter(|(_, mount)| mount.source == wanted)
            .map(|(mountpoint, _)| mountpoint.clone())
            .collect();
        found.sort();
        Ok(found)
    }
}
