//! Encrypt and unlock workflows driving the external disk tooling.
//!
//! Each workflow is a fixed phase sequence. Every phase is announced to the
//! enforcement engine before it starts so subscribers can follow along, and
//! any failure is tagged with the phase it happened in. On failure only the
//! steps already taken are undone: mounts are released, the mapping is
//! closed, and preserved data is kept unless the device was never touched.

pub mod staging;

use crate::config::EnforcerConfig;
use crate::context::{EnforcerContext, Platform};
use crate::device::{Device, DeviceClass};
use crate::enforcement::EnforcementEngine;
use crate::error::{EnforcerError, EnforcerResult};
use crate::operation::{OperationId, Phase};
use crate::retry::retry_transient;
use crate::secrets::SecretBytes;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use staging::StagingArea;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use usb_enforcer_provider::{FilesystemType, LuksFormatParams, LuksVersion};

const MAPPING_PREFIX: &str = "usbenc-";

/// Client-selectable knobs for `RequestEncrypt`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptOptions {
    /// Falls back to `encryption.filesystem_type`.
    #[serde(default)]
    pub filesystem_type: Option<FilesystemType>,
    #[serde(default)]
    pub preserve_data: bool,
    /// Permit re-formatting a device that already holds a LUKS container.
    #[serde(default)]
    pub reformat_luks: bool,
    #[serde(default)]
    pub label: Option<String>,
}

/// dm-crypt mapping name for `device`, e.g. `usbenc-sdb1`.
pub fn mapping_name(device: &str) -> String {
    let base = Path::new(device)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| device.to_string());
    let sanitized: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{MAPPING_PREFIX}{sanitized}")
}

/// Mount options for a decrypted volume, forcing `ro` when asked.
pub fn encrypted_mount_options(base: &[String], read_only: bool) -> Vec<String> {
    if !read_only {
        return base.to_vec();
    }
    let mut options: Vec<String> = base
        .iter()
        .filter(|opt| opt.as_str() != "rw" && opt.as_str() != "ro")
        .cloned()
        .collect();
    options.push("ro".to_string());
    options
}

/// Why `device` may not be encrypted, if it may not.
pub fn encrypt_eligibility(device: &Device, options: &EncryptOptions) -> Result<(), String> {
    let props = &device.props;
    match device.class {
        DeviceClass::PlaintextPartition | DeviceClass::PlaintextDisk => {}
        DeviceClass::Unsupported => {
            if props.has_partitions {
                return Err("disk carries a partition table; encrypt a partition instead".into());
            }
            if props.fs_usage.as_deref() == Some("crypto") {
                return Err("holds an unrecognised crypto container".into());
            }
        }
        DeviceClass::Luks1 | DeviceClass::Luks2 => {
            if !options.reformat_luks {
                return Err(format!(
                    "already a {} container; set reformat_luks to re-encrypt",
                    device.class
                ));
            }
        }
        DeviceClass::Mapper => return Err("is an unlocked mapping, not a raw device".into()),
        DeviceClass::NonUsb => return Err("is not attached over USB".into()),
    }
    if options.preserve_data && !device.class.is_plaintext() {
        return Err(format!("has no plaintext data to preserve ({})", device.class));
    }
    Ok(())
}

/// Why `device` may not be unlocked, if it may not.
pub fn unlock_eligibility(cfg: &EnforcerConfig, device: &Device) -> Result<(), String> {
    match device.class {
        DeviceClass::Luks2 => Ok(()),
        DeviceClass::Luks1 if cfg.policy.allow_luks1_readonly => Ok(()),
        DeviceClass::Luks1 => Err("LUKS1 unlock is disabled by policy".into()),
        DeviceClass::PlaintextPartition
        | DeviceClass::PlaintextDisk
        | DeviceClass::Mapper
        | DeviceClass::NonUsb
        | DeviceClass::Unsupported => Err(format!("not a LUKS container ({})", device.class)),
    }
}

pub fn check_passphrase(cfg: &EnforcerConfig, passphrase: &SecretBytes) -> EnforcerResult<()> {
    let got = passphrase.char_len();
    let min = cfg.encryption.min_passphrase_length;
    if got < min {
        return Err(EnforcerError::PassphraseTooShort { min, got });
    }
    Ok(())
}

/// What a workflow has done so far, for proportional cleanup.
#[derive(Default)]
struct Progress {
    source_mount: Option<PathBuf>,
    staging: Option<StagingArea>,
    formatted: bool,
    mapping: Option<String>,
    mountpoint: Option<PathBuf>,
}

trait PhaseExt<T> {
    fn phase(self, phase: Phase) -> EnforcerResult<T>;
}

impl<T> PhaseExt<T> for EnforcerResult<T> {
    fn phase(self, phase: Phase) -> EnforcerResult<T> {
        self.map_err(|err| err.in_phase(phase))
    }
}

impl<T> PhaseExt<T> for std::io::Result<T> {
    fn phase(self, phase: Phase) -> EnforcerResult<T> {
        self.map_err(|err| EnforcerError::from(err).in_phase(phase))
    }
}

pub struct CryptoEngine<P: Platform> {
    engine: Arc<EnforcementEngine<P>>,
}

impl<P: Platform> CryptoEngine<P> {
    pub fn new(engine: Arc<EnforcementEngine<P>>) -> Self {
        Self { engine }
    }

    fn ctx(&self) -> &Arc<EnforcerContext<P>> {
        self.engine.context()
    }

    fn platform(&self) -> &P {
        &self.ctx().platform
    }

    /// Announce `phase`, refusing to continue once the device is gone.
    fn step(&self, id: &OperationId, phase: Phase) -> EnforcerResult<()> {
        if self.engine.is_aborted(id) {
            return Err(EnforcerError::Crypto {
                phase,
                message: "device was removed".into(),
            });
        }
        self.engine.enter_phase(id, phase);
        Ok(())
    }

    /// Turn `device` into a LUKS2 volume and mount it. Returns the mountpoint.
    pub fn encrypt(
        &self,
        id: &OperationId,
        device: &Device,
        passphrase: &SecretBytes,
        options: &EncryptOptions,
    ) -> EnforcerResult<PathBuf> {
        let cfg = self.ctx().config();
        let mut progress = Progress::default();
        let result = self.encrypt_phases(id, device, passphrase, options, &cfg, &mut progress);
        if let Err(err) = &result {
            warn!("encrypt of {} failed: {err}", device.path());
            self.cleanup(id, device.path(), progress);
        }
        result
    }

    fn encrypt_phases(
        &self,
        id: &OperationId,
        device: &Device,
        passphrase: &SecretBytes,
        options: &EncryptOptions,
        cfg: &EnforcerConfig,
        progress: &mut Progress,
    ) -> EnforcerResult<PathBuf> {
        let path = device.path();
        let platform = self.platform();

        self.step(id, Phase::Validate)?;
        check_passphrase(cfg, passphrase).phase(Phase::Validate)?;
        encrypt_eligibility(device, options)
            .map_err(|reason| EnforcerError::Ineligible {
                path: path.to_string(),
                reason,
            })
            .phase(Phase::Validate)?;
        if options.preserve_data {
            let source = self.source_mount(id, path, cfg, progress).phase(Phase::Validate)?;
            let required = staging::tree_size(&source).phase(Phase::Validate)?;
            let root = cfg.staging_root();
            let available =
                staging::available_space(&existing_ancestor(&root)).phase(Phase::Validate)?;
            staging::ensure_capacity(&root, required, available, cfg.staging.headroom_percent)
                .phase(Phase::Validate)?;

            self.step(id, Phase::PreserveData)?;
            let area = StagingArea::create(&root, id.as_str()).phase(Phase::PreserveData)?;
            self.engine
                .record_staging(id, Some(area.path().to_path_buf()));
            let copied = staging::copy_tree(&source, area.path());
            progress.staging = Some(area);
            let copied = copied.phase(Phase::PreserveData)?;
            info!("preserved {copied} bytes from {path}");
        }

        self.step(id, Phase::LuksFormat)?;
        self.release_device(path, cfg, progress)
            .phase(Phase::LuksFormat)?;
        let params = LuksFormatParams {
            version: LuksVersion::Luks2,
            kdf: cfg.encryption.kdf.kind,
            cipher: cfg.encryption.cipher.kind.clone(),
            key_size: cfg.encryption.cipher.key_size,
            label: options.label.clone(),
        };
        platform
            .luks_format(path, &params, passphrase.expose())
            .phase(Phase::LuksFormat)?;
        progress.formatted = true;

        self.step(id, Phase::Open)?;
        let name = mapping_name(path);
        let mapped = platform
            .open(path, &name, passphrase.expose(), false)
            .phase(Phase::Open)?;
        progress.mapping = Some(name.clone());

        self.step(id, Phase::MakeFilesystem)?;
        let fs_type = options
            .filesystem_type
            .unwrap_or(cfg.encryption.filesystem_type);
        let label = options
            .label
            .clone()
            .unwrap_or_else(|| cfg.encryption.label.clone());
        platform
            .make_filesystem(&mapped, fs_type, Some(&label))
            .phase(Phase::MakeFilesystem)?;

        let mountpoint = cfg.mount_root().join(&name);
        if progress.staging.is_some() {
            self.step(id, Phase::RestoreData)?;
            self.mount_at(&mapped, &mountpoint, cfg, false, progress)
                .phase(Phase::RestoreData)?;
            if let Some(area) = progress.staging.take() {
                let restored = staging::copy_tree(area.path(), &mountpoint);
                let staged_at = area.path().to_path_buf();
                if let Err(err) = area.remove() {
                    warn!("failed to remove staging area {}: {err}", staged_at.display());
                }
                self.engine.record_staging(id, None);
                let restored = restored.phase(Phase::RestoreData)?;
                info!("restored {restored} bytes onto encrypted {path}");
            }
        }

        self.step(id, Phase::Mount)?;
        if progress.mountpoint.is_none() {
            self.mount_at(&mapped, &mountpoint, cfg, false, progress)
                .phase(Phase::Mount)?;
        }

        self.step(id, Phase::Finalize)?;
        match platform.luks_version(path).phase(Phase::Finalize)? {
            Some(LuksVersion::Luks2) => {}
            other => {
                return Err(EnforcerError::Crypto {
                    phase: Phase::Finalize,
                    message: format!("expected a LUKS2 header after format, found {other:?}"),
                })
            }
        }
        info!("{path} encrypted and mounted at {}", mountpoint.display());
        Ok(mountpoint)
    }

    /// Open an existing container and mount it. Returns the mountpoint.
    pub fn unlock(
        &self,
        id: &OperationId,
        device: &Device,
        passphrase: &SecretBytes,
    ) -> EnforcerResult<PathBuf> {
        let cfg = self.ctx().config();
        let mut progress = Progress::default();
        let result = self.unlock_phases(id, device, passphrase, &cfg, &mut progress);
        if let Err(err) = &result {
            warn!("unlock of {} failed: {err}", device.path());
            self.cleanup(id, device.path(), progress);
        }
        result
    }

    fn unlock_phases(
        &self,
        id: &OperationId,
        device: &Device,
        passphrase: &SecretBytes,
        cfg: &EnforcerConfig,
        progress: &mut Progress,
    ) -> EnforcerResult<PathBuf> {
        let path = device.path();
        let platform = self.platform();
        let read_only = device.class == DeviceClass::Luks1;

        self.step(id, Phase::Open)?;
        unlock_eligibility(cfg, device)
            .map_err(|reason| EnforcerError::Ineligible {
                path: path.to_string(),
                reason,
            })
            .phase(Phase::Open)?;
        let name = mapping_name(path);
        let mapped = platform
            .open(path, &name, passphrase.expose(), read_only)
            .phase(Phase::Open)?;
        progress.mapping = Some(name.clone());

        self.step(id, Phase::VerifyFilesystem)?;
        let fs_type = platform
            .filesystem_type(&mapped)
            .phase(Phase::VerifyFilesystem)?
            .ok_or_else(|| EnforcerError::Crypto {
                phase: Phase::VerifyFilesystem,
                message: format!("no filesystem found on {}", mapped.display()),
            })?;

        self.step(id, Phase::Mount)?;
        let mountpoint = cfg.mount_root().join(&name);
        self.mount_at(&mapped, &mountpoint, cfg, read_only, progress)
            .phase(Phase::Mount)?;
        info!(
            "{path} unlocked ({fs_type}{}) at {}",
            if read_only { ", read-only" } else { "" },
            mountpoint.display()
        );
        Ok(mountpoint)
    }

    fn mount_at(
        &self,
        mapped: &Path,
        mountpoint: &Path,
        cfg: &EnforcerConfig,
        read_only: bool,
        progress: &mut Progress,
    ) -> EnforcerResult<()> {
        fs::create_dir_all(mountpoint)?;
        let options = encrypted_mount_options(&cfg.mount.default_encrypted_mount_opts, read_only);
        self.platform().mount(mapped, mountpoint, &options)?;
        progress.mountpoint = Some(mountpoint.to_path_buf());
        Ok(())
    }

    /// Find or create a read-only mount of the plaintext source.
    fn source_mount(
        &self,
        id: &OperationId,
        path: &str,
        cfg: &EnforcerConfig,
        progress: &mut Progress,
    ) -> EnforcerResult<PathBuf> {
        let platform = self.platform();
        if let Some(existing) = platform.mount_points(Path::new(path))?.into_iter().next() {
            return Ok(existing);
        }
        let dir = cfg.mount_root().join(format!(".preserve-{}", id.as_str()));
        fs::create_dir_all(&dir)?;
        if let Err(err) = platform.mount(Path::new(path), &dir, &cfg.mount.default_plain_mount_opts)
        {
            let _ = fs::remove_dir(&dir);
            return Err(err);
        }
        progress.source_mount = Some(dir.clone());
        Ok(dir)
    }

    /// Detach every mount of `path` and lift the block read-only flag.
    fn release_device(
        &self,
        path: &str,
        cfg: &EnforcerConfig,
        progress: &mut Progress,
    ) -> EnforcerResult<()> {
        let platform = self.platform();
        if let Some(source) = progress.source_mount.take() {
            retry_transient(&cfg.retry, "unmount preserve source", || {
                platform.unmount(&source)
            })?;
            let _ = fs::remove_dir(&source);
        }
        for mountpoint in platform.mount_points(Path::new(path))? {
            retry_transient(&cfg.retry, "unmount before format", || {
                platform.unmount(&mountpoint)
            })?;
        }
        retry_transient(&cfg.retry, "clear read-only before format", || {
            platform.set_read_only(path, false)
        })
    }

    fn cleanup(&self, id: &OperationId, path: &str, progress: Progress) {
        let platform = self.platform();
        if let Some(mountpoint) = progress.mountpoint {
            match platform.unmount(&mountpoint) {
                Ok(()) => {
                    let _ = fs::remove_dir(&mountpoint);
                }
                Err(err) => warn!("cleanup: unmount {} failed: {err}", mountpoint.display()),
            }
        }
        if let Some(name) = progress.mapping {
            if let Err(err) = platform.close(&name) {
                warn!("cleanup: closing mapping {name} failed: {err}");
            }
        }
        if let Some(source) = progress.source_mount {
            match platform.unmount(&source) {
                Ok(()) => {
                    let _ = fs::remove_dir(&source);
                }
                Err(err) => warn!("cleanup: unmount {} failed: {err}", source.display()),
            }
        }
        if let Some(area) = progress.staging {
            if progress.formatted {
                let kept = area.into_path();
                warn!(
                    "{path} was re-formatted before the failure; preserved data kept at {}",
                    kept.display()
                );
            } else {
                if let Err(err) = area.remove() {
                    warn!("cleanup: {err}");
                }
                self.engine.record_staging(id, None);
            }
        }
    }
}

fn existing_ancestor(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|candidate| candidate.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"))
}
