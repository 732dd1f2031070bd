//! Configuration model and helpers used by the enforcer daemon and clients.

use crate::error::{EnforcerError, EnforcerResult};
use log::info;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use usb_enforcer_provider::{FilesystemType, KdfKind};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/usb-enforcer/config.toml";
pub const CONFIG_PATH_ENV: &str = "USB_ENFORCER_CONFIG";

const BOOTSTRAP_TEMPLATE: &str = r#"# Auto-generated USB enforcer configuration.
# Plaintext removable volumes are forced read-only; LUKS2 volumes may be unlocked writable.

[policy]
enforce_on_usb_only = true
allow_luks1_readonly = true
exempted_groups = []

[mount]
default_plain_mount_opts = ["ro", "nosuid", "nodev", "noexec"]
default_encrypted_mount_opts = ["rw", "nosuid", "nodev"]
mount_root = "/run/media/usb-enforcer"

[encryption]
min_passphrase_length = 12
filesystem_type = "exfat"
label = "ENCRYPTED"

[encryption.kdf]
type = "argon2id"

[encryption.cipher]
type = "aes-xts-plain64"
key_size = 512

[secrets]
socket_path = "/run/usb-enforcer/secrets.sock"
token_ttl_secs = 120
reaper_interval_secs = 15

[api]
socket_path = "/run/usb-enforcer/api.sock"
event_buffer = 256

[monitor]
debounce_ms = 750

[tools]
timeout_secs = 30
format_timeout_secs = 600

[staging]
root = "/var/lib/usb-enforcer/staging"
headroom_percent = 5

[retry]
max_attempts = 4
base_delay_ms = 250
max_delay_ms = 4000
jitter_ratio = 0.1
"#;

pub fn bootstrap_template() -> &'static str {
    BOOTSTRAP_TEMPLATE
}

/// Which devices are enforced and who bypasses enforcement.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PolicyCfg {
    #[serde(default = "default_true")]
    pub enforce_on_usb_only: bool,

    #[serde(default = "default_true")]
    pub allow_luks1_readonly: bool,

    #[serde(default)]
    pub exempted_groups: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for PolicyCfg {
    fn default() -> Self {
        Self {
            enforce_on_usb_only: true,
            allow_luks1_readonly: true,
            exempted_groups: Vec::new(),
        }
    }
}

/// Mount options for plaintext and encrypted volumes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MountCfg {
    #[serde(default = "default_plain_mount_opts")]
    pub default_plain_mount_opts: Vec<String>,

    #[serde(default = "default_encrypted_mount_opts")]
    pub default_encrypted_mount_opts: Vec<String>,

    #[serde(default = "default_mount_root")]
    pub mount_root: String,
}

fn default_plain_mount_opts() -> Vec<String> {
    ["ro", "nosuid", "nodev", "noexec"]
        .iter()
        .map(|opt| opt.to_string())
        .collect()
}

fn default_encrypted_mount_opts() -> Vec<String> {
    ["rw", "nosuid", "nodev"]
        .iter()
        .map(|opt| opt.to_string())
        .collect()
}

fn default_mount_root() -> String {
    "/run/media/usb-enforcer".to_string()
}

impl Default for MountCfg {
    fn default() -> Self {
        Self {
            default_plain_mount_opts: default_plain_mount_opts(),
            default_encrypted_mount_opts: default_encrypted_mount_opts(),
            mount_root: default_mount_root(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct KdfCfg {
    #[serde(default, rename = "type")]
    pub kind: KdfKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CipherCfg {
    #[serde(default = "default_cipher", rename = "type")]
    pub kind: String,

    #[serde(default = "default_key_size")]
    pub key_size: u32,
}

fn default_cipher() -> String {
    "aes-xts-plain64".to_string()
}

fn default_key_size() -> u32 {
    512
}

impl Default for CipherCfg {
    fn default() -> Self {
        Self {
            kind: default_cipher(),
            key_size: default_key_size(),
        }
    }
}

/// Parameters for freshly encrypted volumes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EncryptionCfg {
    #[serde(default = "default_min_passphrase_length")]
    pub min_passphrase_length: usize,

    #[serde(default)]
    pub filesystem_type: FilesystemType,

    #[serde(default)]
    pub kdf: KdfCfg,

    #[serde(default)]
    pub cipher: CipherCfg,

    #[serde(default = "default_label")]
    pub label: String,
}

fn default_min_passphrase_length() -> usize {
    12
}

fn default_label() -> String {
    "ENCRYPTED".to_string()
}

impl Default for EncryptionCfg {
    fn default() -> Self {
        Self {
            min_passphrase_length: default_min_passphrase_length(),
            filesystem_type: FilesystemType::default(),
            kdf: KdfCfg::default(),
            cipher: CipherCfg::default(),
            label: default_label(),
        }
    }
}

/// Secrets Channel endpoint and token lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SecretsCfg {
    #[serde(default = "default_secrets_socket")]
    pub socket_path: String,

    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,

    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
}

fn default_secrets_socket() -> String {
    "/run/usb-enforcer/secrets.sock".to_string()
}

fn default_token_ttl_secs() -> u64 {
    120
}

fn default_reaper_interval_secs() -> u64 {
    15
}

impl Default for SecretsCfg {
    fn default() -> Self {
        Self {
            socket_path: default_secrets_socket(),
            token_ttl_secs: default_token_ttl_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
        }
    }
}

/// Remote API endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ApiCfg {
    #[serde(default = "default_api_socket")]
    pub socket_path: String,

    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_api_socket() -> String {
    "/run/usb-enforcer/api.sock".to_string()
}

fn default_event_buffer() -> usize {
    256
}

impl Default for ApiCfg {
    fn default() -> Self {
        Self {
            socket_path: default_api_socket(),
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MonitorCfg {
    /// Window in which repeated add events for one path are coalesced.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_debounce_ms() -> u64 {
    750
}

impl Default for MonitorCfg {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

/// External tool timeouts and optional binary overrides.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolsCfg {
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_format_timeout_secs")]
    pub format_timeout_secs: u64,

    #[serde(default)]
    pub cryptsetup_path: Option<String>,

    #[serde(default)]
    pub blockdev_path: Option<String>,

    #[serde(default)]
    pub blkid_path: Option<String>,

    #[serde(default)]
    pub mount_path: Option<String>,

    #[serde(default)]
    pub umount_path: Option<String>,

    #[serde(default)]
    pub loginctl_path: Option<String>,

    #[serde(default)]
    pub id_path: Option<String>,

    /// Directory holding the `mkfs.<fs>` helpers.
    #[serde(default)]
    pub mkfs_dir: Option<String>,
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_format_timeout_secs() -> u64 {
    600
}

impl Default for ToolsCfg {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout_secs(),
            format_timeout_secs: default_format_timeout_secs(),
            cryptsetup_path: None,
            blockdev_path: None,
            blkid_path: None,
            mount_path: None,
            umount_path: None,
            loginctl_path: None,
            id_path: None,
            mkfs_dir: None,
        }
    }
}

/// Where preserved data is held while a volume is re-formatted.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StagingCfg {
    #[serde(default = "default_staging_root")]
    pub root: String,

    #[serde(default = "default_headroom_percent")]
    pub headroom_percent: u8,
}

fn default_staging_root() -> String {
    "/var/lib/usb-enforcer/staging".to_string()
}

fn default_headroom_percent() -> u8 {
    5
}

impl Default for StagingCfg {
    fn default() -> Self {
        Self {
            root: default_staging_root(),
            headroom_percent: default_headroom_percent(),
        }
    }
}

/// Shared retry/backoff strategy used when applying read-only enforcement.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetryCfg {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_retry_jitter")]
    pub jitter_ratio: f64,
}

fn default_retry_attempts() -> u32 {
    4
}

fn default_retry_base_delay() -> u64 {
    250
}

fn default_retry_max_delay() -> u64 {
    4_000
}

fn default_retry_jitter() -> f64 {
    0.1
}

impl Default for RetryCfg {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_delay(),
            max_delay_ms: default_retry_max_delay(),
            jitter_ratio: default_retry_jitter(),
        }
    }
}

/// Top-level configuration snapshot loaded from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct EnforcerConfig {
    #[serde(default)]
    pub policy: PolicyCfg,

    #[serde(default)]
    pub mount: MountCfg,

    #[serde(default)]
    pub encryption: EncryptionCfg,

    #[serde(default)]
    pub secrets: SecretsCfg,

    #[serde(default)]
    pub api: ApiCfg,

    #[serde(default)]
    pub monitor: MonitorCfg,

    #[serde(default)]
    pub tools: ToolsCfg,

    #[serde(default)]
    pub staging: StagingCfg,

    #[serde(default)]
    pub retry: RetryCfg,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub format: ConfigFormat,
}

/// Tracks whether we parsed TOML or YAML so writes preserve format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

impl EnforcerConfig {
    /// Resolve the config path from `USB_ENFORCER_CONFIG`, falling back to the default.
    pub fn resolve_path() -> PathBuf {
        std::env::var(CONFIG_PATH_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load configuration from disk, writing a bootstrap template when missing.
    pub fn load_or_bootstrap<P: AsRef<Path>>(path: P) -> EnforcerResult<Self> {
        let target = path.as_ref();
        if target.exists() {
            return Self::load(target);
        }

        let created = ensure_bootstrap_file(target).map_err(|err| {
            EnforcerError::InvalidConfig(format!(
                "failed to initialise configuration at {}: {err}",
                target.display()
            ))
        })?;
        if created {
            info!("configuration bootstrap created at {}", target.display());
        }
        Self::load(target)
    }

    /// Read a config file from disk and detect its format by extension.
    pub fn load<P: AsRef<Path>>(path: P) -> EnforcerResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml")
        );
        let mut cfg = if is_yaml {
            serde_yaml::from_str::<Self>(&contents)?
        } else {
            toml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();
        cfg.format = if is_yaml {
            ConfigFormat::Yaml
        } else {
            ConfigFormat::Toml
        };
        Ok(cfg)
    }

    /// Load and reject the snapshot when validation finds issues.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> EnforcerResult<Self> {
        let cfg = Self::load_or_bootstrap(path)?;
        let issues = cfg.validate();
        if !issues.is_empty() {
            return Err(EnforcerError::InvalidConfig(issues.join("; ")));
        }
        Ok(cfg)
    }

    /// Perform a validation pass and return human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.encryption.min_passphrase_length == 0 {
            issues.push("encryption.min_passphrase_length must be at least 1".to_string());
        }
        if !matches!(self.encryption.cipher.key_size, 256 | 512) {
            issues.push(format!(
                "encryption.cipher.key_size must be 256 or 512 (got {})",
                self.encryption.cipher.key_size
            ));
        }
        if self.encryption.cipher.kind.trim().is_empty() {
            issues.push("encryption.cipher.type must not be empty".to_string());
        }

        for (field, value) in [
            ("secrets.socket_path", &self.secrets.socket_path),
            ("api.socket_path", &self.api.socket_path),
            ("mount.mount_root", &self.mount.mount_root),
            ("staging.root", &self.staging.root),
        ] {
            if !Path::new(value).is_absolute() {
                issues.push(format!("{field} must be an absolute path (got {value:?})"));
            }
        }
        if self.secrets.socket_path == self.api.socket_path {
            issues.push("secrets.socket_path and api.socket_path must differ".to_string());
        }

        if self.secrets.token_ttl_secs == 0 {
            issues.push("secrets.token_ttl_secs must be greater than 0".to_string());
        }
        if self.secrets.reaper_interval_secs == 0 {
            issues.push("secrets.reaper_interval_secs must be greater than 0".to_string());
        }
        if self.api.event_buffer == 0 {
            issues.push("api.event_buffer must be greater than 0".to_string());
        }
        if self.tools.timeout_secs == 0 || self.tools.format_timeout_secs == 0 {
            issues.push("tools timeouts must be greater than 0".to_string());
        }
        if self.staging.headroom_percent >= 100 {
            issues.push("staging.headroom_percent must be below 100".to_string());
        }

        for group in &self.policy.exempted_groups {
            if group.trim().is_empty() {
                issues.push("policy.exempted_groups contains an empty entry".to_string());
            }
        }

        if self.retry.max_attempts == 0 {
            issues.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.base_delay_ms == 0 {
            issues.push("retry.base_delay_ms must be greater than 0".to_string());
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            issues.push(
                "retry.max_delay_ms must be greater than or equal to retry.base_delay_ms"
                    .to_string(),
            );
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            issues.push("retry.jitter_ratio must be between 0.0 and 1.0".to_string());
        }

        issues
    }

    /// True when `groups` intersects `policy.exempted_groups`.
    pub fn is_exempt<S: AsRef<str>>(&self, groups: &[S]) -> bool {
        groups.iter().any(|group| {
            self.policy
                .exempted_groups
                .iter()
                .any(|exempt| exempt == group.as_ref())
        })
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.secrets.token_ttl_secs)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.monitor.debounce_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tools.timeout_secs)
    }

    pub fn format_timeout(&self) -> Duration {
        Duration::from_secs(self.tools.format_timeout_secs)
    }

    pub fn mount_root(&self) -> PathBuf {
        PathBuf::from(&self.mount.mount_root)
    }

    pub fn staging_root(&self) -> PathBuf {
        PathBuf::from(&self.staging.root)
    }

    /// Persist the configuration back to its original on-disk format.
    pub fn save(&self) -> EnforcerResult<()> {
        let payload = match self.format {
            ConfigFormat::Toml => toml::to_string_pretty(self)?,
            ConfigFormat::Yaml => serde_yaml::to_string(self)?,
        };
        fs::write(&self.path, payload)?;
        Ok(())
    }
}

/// Holder for the current immutable snapshot; swapped wholesale on reload.
#[derive(Debug)]
pub struct ConfigStore {
    current: RwLock<Arc<EnforcerConfig>>,
}

impl ConfigStore {
    pub fn new(config: EnforcerConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<EnforcerConfig> {
        self.current
            .read()
            .expect("config lock poisoned")
            .clone()
    }

    /// Atomically replace the snapshot; readers holding the old Arc keep it.
    pub fn replace(&self, config: EnforcerConfig) {
        *self.current.write().expect("config lock poisoned") = Arc::new(config);
    }

    /// Reload from `path`, keeping the previous snapshot if the new one is invalid.
    pub fn reload(&self, path: &Path) -> EnforcerResult<()> {
        let fresh = EnforcerConfig::load_validated(path)?;
        self.replace(fresh);
        info!("configuration reloaded from {}", path.display());
        Ok(())
    }
}

fn ensure_bootstrap_file(path: &Path) -> io::Result<bool> {
    if path.exists() {
        return Ok(false);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    match OpenOptions::new().create_new(true).write(true).open(path) {
        Ok(mut file) => {
            file.write_all(BOOTSTRAP_TEMPLATE.as_bytes())?;
            file.flush()?;
            #[cfg(unix)]
            fs::set_permissions(path, PermissionsExt::from_mode(0o640))?;
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn bootstrap_template_round_trips_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("etc").join("config.toml");
        let cfg = EnforcerConfig::load_or_bootstrap(&path).unwrap();

        assert!(path.exists());
        assert_eq!(cfg.path, path);
        assert!(cfg.policy.enforce_on_usb_only);
        assert_eq!(cfg.encryption.min_passphrase_length, 12);
        assert_eq!(cfg.encryption.filesystem_type, FilesystemType::Exfat);
        assert_eq!(cfg.encryption.kdf.kind, KdfKind::Argon2id);
        assert_eq!(cfg.encryption.cipher.kind, "aes-xts-plain64");
        assert_eq!(cfg.encryption.cipher.key_size, 512);
        assert!(cfg.validate().is_empty(), "{:?}", cfg.validate());

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
    }

    #[test]
    fn yaml_is_detected_by_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "policy:\n  exempted_groups: [dlp-exempt]\nencryption:\n  filesystem_type: ext4\n  kdf:\n    type: pbkdf2\n",
        )
        .unwrap();

        let cfg = EnforcerConfig::load(&path).unwrap();
        assert_eq!(cfg.format, ConfigFormat::Yaml);
        assert_eq!(cfg.policy.exempted_groups, vec!["dlp-exempt".to_string()]);
        assert_eq!(cfg.encryption.filesystem_type, FilesystemType::Ext4);
        assert_eq!(cfg.encryption.kdf.kind, KdfKind::Pbkdf2);
        assert!(cfg.policy.allow_luks1_readonly);
    }

    #[test]
    fn validate_flags_bad_key_size_and_relative_paths() {
        let mut cfg = EnforcerConfig::default();
        cfg.encryption.cipher.key_size = 128;
        cfg.api.socket_path = "api.sock".into();
        cfg.retry.max_delay_ms = 1;

        let issues = cfg.validate();
        assert!(issues.iter().any(|issue| issue.contains("key_size")));
        assert!(issues.iter().any(|issue| issue.contains("api.socket_path")));
        assert!(issues.iter().any(|issue| issue.contains("retry.max_delay_ms")));
    }

    #[test]
    fn exemption_matches_any_configured_group() {
        let mut cfg = EnforcerConfig::default();
        assert!(!cfg.is_exempt(&["wheel"]));
        cfg.policy.exempted_groups = vec!["dlp-exempt".into()];
        assert!(cfg.is_exempt(&["users", "dlp-exempt"]));
        assert!(!cfg.is_exempt::<&str>(&[]));
    }

    #[test]
    fn store_reload_keeps_previous_snapshot_on_invalid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[encryption]\nmin_passphrase_length = 16\n").unwrap();

        let store = ConfigStore::new(EnforcerConfig::load(&path).unwrap());
        let before = store.snapshot();
        assert_eq!(before.encryption.min_passphrase_length, 16);

        fs::write(&path, "[encryption.cipher]\nkey_size = 100\n").unwrap();
        assert!(store.reload(&path).is_err());
        assert_eq!(store.snapshot().encryption.min_passphrase_length, 16);

        fs::write(&path, "[encryption]\nmin_passphrase_length = 20\n").unwrap();
        store.reload(&path).unwrap();
        assert_eq!(store.snapshot().encryption.min_passphrase_length, 20);
        assert_eq!(before.encryption.min_passphrase_length, 16);
    }
}
