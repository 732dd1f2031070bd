use crate::command::{
    action_unsupported, already_gone, classify_failure, classify_open_failure,
    dev_mapper_node_exists, ToolCommand,
};
use crate::mounts::{default_mount_table, find_mount_points};
use log::{debug, warn};
use std::collections::BTreeSet;
use std::env;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use usb_enforcer_core::config::EnforcerConfig;
use usb_enforcer_core::device::{probe_luks_header, LUKS_HEADER_PROBE_LEN};
use usb_enforcer_core::error::{EnforcerError, EnforcerResult};
use usb_enforcer_provider::{
    BlockControl, CryptTooling, FilesystemType, LuksFormatParams, LuksVersion, SessionProbe,
};

const SYSTEM_BIN_DIRS: &[&str] = &[
    "/usr/sbin",
    "/usr/bin",
    "/sbin",
    "/bin",
    "/usr/local/sbin",
    "/usr/local/bin",
];

const DEV_MAPPER: &str = "/dev/mapper";

/// Host implementation of every platform contract, driven through the
/// standard block, crypto, and login utilities.
#[derive(Debug, Clone)]
pub struct SystemTooling {
    cryptsetup: ToolCommand,
    blockdev: ToolCommand,
    blkid: ToolCommand,
    mount: ToolCommand,
    umount: ToolCommand,
    loginctl: Option<ToolCommand>,
    id: Option<ToolCommand>,
    mkfs_dir: Option<PathBuf>,
    format_timeout: Duration,
    mount_table: PathBuf,
}

impl SystemTooling {
    /// Resolve every binary up front so a broken install fails at startup.
    pub fn from_config(config: &EnforcerConfig) -> EnforcerResult<Self> {
        let tools = &config.tools;
        let timeout = config.tool_timeout();
        let command = |name: &str, configured: &Option<String>| -> EnforcerResult<ToolCommand> {
            Ok(ToolCommand::new(
                resolve_tool(name, configured.as_deref())?,
                timeout,
            ))
        };

        let loginctl = resolve_optional("loginctl", tools.loginctl_path.as_deref())?
            .map(|path| ToolCommand::new(path, timeout));
        if loginctl.is_none() {
            warn!("loginctl not found; exempted groups can never match an active session");
        }
        let id = resolve_optional("id", tools.id_path.as_deref())?
            .map(|path| ToolCommand::new(path, timeout));

        let mkfs_dir = match configured_path(tools.mkfs_dir.as_deref()) {
            Some(dir) if !dir.is_dir() => {
                return Err(EnforcerError::InvalidConfig(format!(
                    "mkfs directory not found at {}",
                    dir.display()
                )));
            }
            other => other,
        };

        Ok(Self {
            cryptsetup: command("cryptsetup", &tools.cryptsetup_path)?,
            blockdev: command("blockdev", &tools.blockdev_path)?,
            blkid: command("blkid", &tools.blkid_path)?,
            mount: command("mount", &tools.mount_path)?,
            umount: command("umount", &tools.umount_path)?,
            loginctl,
            id,
            mkfs_dir,
            format_timeout: config.format_timeout(),
            mount_table: default_mount_table(),
        })
    }

    /// Read mounts from `path` instead of `/proc/mounts`.
    pub fn with_mount_table(mut self, path: impl Into<PathBuf>) -> Self {
        self.mount_table = path.into();
        self
    }

    /// One-line description of the resolved binaries, for startup logs.
    pub fn describe(&self) -> String {
        let optional = |tool: &Option<ToolCommand>| {
            tool.as_ref()
                .map(|tool| tool.binary().display().to_string())
                .unwrap_or_else(|| "-".to_string())
        };
        format!(
            "cryptsetup={} blockdev={} blkid={} mount={} umount={} loginctl={} id={}",
            self.cryptsetup.binary().display(),
            self.blockdev.binary().display(),
            self.blkid.binary().display(),
            self.mount.binary().display(),
            self.umount.binary().display(),
            optional(&self.loginctl),
            optional(&self.id),
        )
    }

    fn mkfs(&self, fs: FilesystemType) -> EnforcerResult<ToolCommand> {
        let name = format!("mkfs.{}", fs.as_str());
        let binary = match &self.mkfs_dir {
            Some(dir) => {
                let candidate = dir.join(&name);
                if !candidate.exists() {
                    return Err(EnforcerError::Provider(format!(
                        "{name} not found in {}",
                        dir.display()
                    )));
                }
                candidate
            }
            None => locate(&name).ok_or_else(|| {
                EnforcerError::Provider(format!("unable to locate {name}; is it installed?"))
            })?,
        };
        Ok(ToolCommand::new(binary, self.format_timeout))
    }

    fn open_args<'a>(
        verb: &'a str,
        device: &'a str,
        name: &'a str,
        read_only: bool,
    ) -> Vec<&'a str> {
        let mut args = vec![verb];
        if verb == "open" {
            args.extend(["--type", "luks"]);
        }
        args.push("--batch-mode");
        if read_only {
            args.push("--readonly");
        }
        args.extend(["--key-file", "-", device, name]);
        args
    }
}

impl BlockControl for SystemTooling {
    type Error = EnforcerError;

    fn set_read_only(&self, device: &str, read_only: bool) -> EnforcerResult<()> {
        let (flag, action) = if read_only {
            ("--setro", format!("set {device} read-only"))
        } else {
            ("--setrw", format!("set {device} writable"))
        };
        debug!("blockdev {flag} {device}");
        self.blockdev.run_checked(&[flag, device], None, &action)?;
        Ok(())
    }

    fn is_read_only(&self, device: &str) -> EnforcerResult<bool> {
        let out = self.blockdev.run_checked(
            &["--getro", device],
            None,
            &format!("query read-only flag of {device}"),
        )?;
        match out.stdout.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(EnforcerError::Provider(format!(
                "unexpected blockdev --getro output for {device}: {other:?}"
            ))),
        }
    }
}

impl CryptTooling for SystemTooling {
    type Error = EnforcerError;

    fn luks_version(&self, device: &str) -> EnforcerResult<Option<LuksVersion>> {
        let mut header = [0u8; LUKS_HEADER_PROBE_LEN];
        let mut file = File::open(device)?;
        match file.read_exact(&mut header) {
            Ok(()) => Ok(probe_luks_header(&header)),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn luks_format(
        &self,
        device: &str,
        params: &LuksFormatParams,
        passphrase: &[u8],
    ) -> EnforcerResult<()> {
        let key_size = params.key_size.to_string();
        let mut args = vec![
            "luksFormat",
            "--batch-mode",
            "--type",
            params.version.as_str(),
            "--pbkdf",
            params.kdf.as_str(),
            "--cipher",
            params.cipher.as_str(),
            "--key-size",
            key_size.as_str(),
        ];
        if let (LuksVersion::Luks2, Some(label)) = (params.version, params.label.as_deref()) {
            args.extend(["--label", label]);
        }
        args.extend(["--key-file", "-", device]);

        debug!(
            "cryptsetup luksFormat {device} ({}, {}, {})",
            params.version.as_str(),
            params.kdf.as_str(),
            params.cipher
        );
        self.cryptsetup
            .with_timeout(self.format_timeout)
            .run_checked(&args, Some(passphrase), &format!("format {device}"))?;
        Ok(())
    }

    fn open(
        &self,
        device: &str,
        name: &str,
        passphrase: &[u8],
        read_only: bool,
    ) -> EnforcerResult<PathBuf> {
        if dev_mapper_node_exists(name) {
            return Err(EnforcerError::Provider(format!(
                "mapping `{name}` is already active under {DEV_MAPPER}"
            )));
        }

        let mut out = self.cryptsetup.run(
            &Self::open_args("open", device, name, read_only),
            Some(passphrase),
        )?;
        if !out.success() && action_unsupported(&out) {
            out = self.cryptsetup.run(
                &Self::open_args("luksOpen", device, name, read_only),
                Some(passphrase),
            )?;
        }

        if out.success() {
            debug!("opened {device} as {name} (read-only: {read_only})");
            return Ok(Path::new(DEV_MAPPER).join(name));
        }
        Err(classify_open_failure(name, device, &out))
    }

    fn close(&self, name: &str) -> EnforcerResult<()> {
        let mut out = self.cryptsetup.run(&["close", name], None)?;
        if !out.success() && action_unsupported(&out) {
            out = self.cryptsetup.run(&["luksClose", name], None)?;
        }
        if out.success() || already_gone(&out) {
            return Ok(());
        }
        Err(classify_failure(
            "cryptsetup",
            &format!("close mapping `{name}`"),
            &out,
        ))
    }

    fn make_filesystem(
        &self,
        device: &Path,
        fs: FilesystemType,
        label: Option<&str>,
    ) -> EnforcerResult<()> {
        let mkfs = self.mkfs(fs)?;
        let label = label.map(|label| fit_label(fs, label));
        let target = device.to_string_lossy().into_owned();

        let mut args: Vec<&str> = match fs {
            FilesystemType::Exfat => Vec::new(),
            FilesystemType::Ext4 => vec!["-F", "-q"],
            FilesystemType::Vfat => vec!["-F", "32"],
        };
        if let Some(label) = label.as_deref().filter(|label| !label.is_empty()) {
            let flag = match fs {
                FilesystemType::Exfat | FilesystemType::Ext4 => "-L",
                FilesystemType::Vfat => "-n",
            };
            args.extend([flag, label]);
        }
        args.push(target.as_str());

        debug!("{} {}", mkfs.name(), args.join(" "));
        mkfs.run_checked(&args, None, &format!("create {fs} on {target}"))?;
        Ok(())
    }

    fn filesystem_type(&self, device: &Path) -> EnforcerResult<Option<String>> {
        let target = device.to_string_lossy();
        let out = self
            .blkid
            .run(&["-p", "-o", "value", "-s", "TYPE", &*target], None)?;
        match out.status {
            0 => Ok(out
                .stdout
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map(str::to_string)),
            // blkid exits 2 when nothing was detected.
            2 => Ok(None),
            _ => Err(classify_failure(
                "blkid",
                &format!("probe {target}"),
                &out,
            )),
        }
    }

    fn mount(&self, device: &Path, mountpoint: &Path, options: &[String]) -> EnforcerResult<()> {
        let source = device.to_string_lossy();
        let target = mountpoint.to_string_lossy();
        let joined = options.join(",");
        let mut args = Vec::new();
        if !joined.is_empty() {
            args.extend(["-o", joined.as_str()]);
        }
        args.extend([&*source, &*target]);

        debug!("mount {}", args.join(" "));
        self.mount
            .run_checked(&args, None, &format!("mount {source} at {target}"))?;
        Ok(())
    }

    fn unmount(&self, mountpoint: &Path) -> EnforcerResult<()> {
        let target = mountpoint.to_string_lossy();
        let out = self.umount.run(&[&*target], None)?;
        if out.success() || already_gone(&out) {
            return Ok(());
        }
        Err(classify_failure("umount", &format!("unmount {target}"), &out))
    }

    fn mount_points(&self, device: &Path) -> EnforcerResult<Vec<PathBuf>> {
        find_mount_points(&self.mount_table, device)
    }
}

impl SessionProbe for SystemTooling {
    type Error = EnforcerError;

    fn active_user_groups(&self) -> EnforcerResult<Vec<String>> {
        let loginctl = self
            .loginctl
            .as_ref()
            .ok_or_else(|| EnforcerError::Provider("loginctl is not available".into()))?;
        let id = self
            .id
            .as_ref()
            .ok_or_else(|| EnforcerError::Provider("id is not available".into()))?;

        let sessions = loginctl.run_checked(&["list-sessions", "--no-legend"], None, "list sessions")?;
        let mut users = BTreeSet::new();
        for session in parse_session_ids(&sessions.stdout) {
            let out = loginctl.run_checked(
                &[
                    "show-session",
                    session.as_str(),
                    "-p",
                    "Active",
                    "-p",
                    "Name",
                    "-p",
                    "Class",
                ],
                None,
                &format!("inspect session {session}"),
            )?;
            if let Some(user) = active_session_user(&out.stdout) {
                users.insert(user);
            }
        }

        let mut groups = BTreeSet::new();
        for user in &users {
            let out = id.run_checked(&["-Gn", user.as_str()], None, &format!("list groups of {user}"))?;
            groups.extend(out.stdout.split_whitespace().map(str::to_string));
        }
        debug!("{} active session user(s), {} group(s)", users.len(), groups.len());
        Ok(groups.into_iter().collect())
    }
}

fn parse_session_ids(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|id| id.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_'))
        .map(str::to_string)
        .collect()
}

/// User name of an active, user-class session in `show-session` output.
fn active_session_user(properties: &str) -> Option<String> {
    let mut active = false;
    let mut user_class = true;
    let mut name = None;
    for line in properties.lines() {
        match line.trim().split_once('=') {
            Some(("Active", value)) => active = value == "yes",
            Some(("Class", value)) => user_class = value.starts_with("user"),
            Some(("Name", value)) if !value.is_empty() => name = Some(value.to_string()),
            _ => {}
        }
    }
    if active && user_class {
        name
    } else {
        None
    }
}

/// Trim a label to what the target filesystem can store.
fn fit_label(fs: FilesystemType, label: &str) -> String {
    let limit = match fs {
        FilesystemType::Exfat | FilesystemType::Vfat => 11,
        FilesystemType::Ext4 => 16,
    };
    let trimmed: String = label.trim().chars().take(limit).collect();
    if fs == FilesystemType::Vfat {
        trimmed.to_ascii_uppercase()
    } else {
        trimmed
    }
}

fn configured_path(configured: Option<&str>) -> Option<PathBuf> {
    configured
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

fn resolve_tool(name: &str, configured: Option<&str>) -> EnforcerResult<PathBuf> {
    if let Some(path) = resolve_optional(name, configured)? {
        return Ok(path);
    }
    Err(EnforcerError::InvalidConfig(format!(
        "unable to locate {name} binary; tried {SYSTEM_BIN_DIRS:?} and PATH"
    )))
}

/// A configured path must exist; otherwise search the usual places.
fn resolve_optional(name: &str, configured: Option<&str>) -> EnforcerResult<Option<PathBuf>> {
    if let Some(candidate) = configured_path(configured) {
        if !candidate.exists() {
            return Err(EnforcerError::InvalidConfig(format!(
                "{name} binary not found at {}",
                candidate.display()
            )));
        }
        return Ok(Some(candidate));
    }
    Ok(locate(name))
}

fn locate(name: &str) -> Option<PathBuf> {
    SYSTEM_BIN_DIRS
        .iter()
        .map(|dir| Path::new(dir).join(name))
        .find(|candidate| candidate.exists())
        .or_else(|| find_in_path(name))
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.exists())
}
