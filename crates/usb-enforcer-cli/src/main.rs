//! Command-line client for the USB enforcement daemon.

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, Subcommand};
use log::debug;
use rpassword::prompt_password;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use usb_enforcer_core::{
    logging, ApiRequest, ApiResponse, DeviceSummary, EncryptOptions, EnforcerConfig,
    EnforcerEvent, EventType, OperationKind,
};
use usb_enforcer_provider::FilesystemType;
use zeroize::Zeroizing;

mod client;

use client::{describe_failure, submit_secret, ApiClient};

/// Top-level options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "usb-enforcer",
    version,
    about = "Inspect USB devices and request encryption or unlock from the enforcement daemon."
)]
struct Cli {
    /// Configuration file used to locate the daemon sockets.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Remote API socket; overrides `api.socket_path`.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Secrets channel socket; overrides `secrets.socket_path`.
    #[arg(long)]
    secrets_socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List tracked devices with their class and enforcement state.
    List {
        #[arg(long)]
        json: bool,
    },

    /// Show one device.
    Status {
        path: String,
        #[arg(long)]
        json: bool,
    },

    /// Unlock a LUKS2 device and mount it writable.
    Unlock {
        path: String,

        /// Block until the operation completes or fails.
        #[arg(long)]
        wait: bool,

        /// Read the passphrase from the first line of stdin instead of prompting.
        #[arg(long)]
        passphrase_stdin: bool,
    },

    /// Encrypt a plaintext device as LUKS2. Destroys data unless --preserve is given.
    Encrypt {
        path: String,

        /// Filesystem created inside the container (exfat, ext4, vfat).
        #[arg(long = "fs")]
        filesystem: Option<String>,

        /// Copy existing files into the new container.
        #[arg(long)]
        preserve: bool,

        /// Allow re-formatting a device that already holds LUKS.
        #[arg(long)]
        reformat_luks: bool,

        #[arg(long)]
        label: Option<String>,

        #[arg(long)]
        wait: bool,

        #[arg(long)]
        passphrase_stdin: bool,
    },

    /// Stream daemon events until interrupted.
    Watch,

    /// Print the JSON schema for the configuration file.
    Schema,

    /// Validate a configuration file and report issues.
    Validate {
        /// Defaults to the configured path.
        file: Option<PathBuf>,
    },

    /// Check that the daemon answers.
    Ping,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init("warn");

    let config_path = cli.config.clone().unwrap_or_else(EnforcerConfig::resolve_path);
    let command = match cli.command {
        Commands::Validate { file } => {
            return validate(file.as_deref().unwrap_or(&config_path));
        }
        Commands::Schema => {
            let schema = schema_for!(EnforcerConfig);
            println!("{}", to_string_pretty(&schema)?);
            return Ok(());
        }
        command => command,
    };

    let config = load_client_config(&config_path)?;
    let api_socket = cli
        .socket
        .unwrap_or_else(|| PathBuf::from(&config.api.socket_path));
    let secrets_socket = cli
        .secrets_socket
        .unwrap_or_else(|| PathBuf::from(&config.secrets.socket_path));

    match command {
        Commands::List { json } => {
            let mut api = ApiClient::connect(&api_socket)?;
            let devices = match api.call(&ApiRequest::ListDevices)? {
                ApiResponse::Devices { devices } => devices,
                other => bail!(describe_failure(&other)),
            };
            if json {
                println!("{}", to_string_pretty(&devices)?);
            } else {
                print_table(&devices);
            }
        }
        Commands::Status { path, json } => {
            let mut api = ApiClient::connect(&api_socket)?;
            let device = match api.call(&ApiRequest::GetDeviceStatus { path })? {
                ApiResponse::Device { device } => device,
                other => bail!(describe_failure(&other)),
            };
            if json {
                println!("{}", to_string_pretty(&device)?);
            } else {
                print_device(&device);
            }
        }
        Commands::Unlock {
            path,
            wait,
            passphrase_stdin,
        } => {
            let passphrase = read_passphrase(passphrase_stdin, false)?;
            let token = submit_secret(
                &secrets_socket,
                &path,
                OperationKind::Unlock,
                passphrase.as_bytes(),
            )?;
            drop(passphrase);
            let request = ApiRequest::RequestUnlock {
                path: path.clone(),
                token,
            };
            start_operation(&api_socket, &path, request, wait)?;
        }
        Commands::Encrypt {
            path,
            filesystem,
            preserve,
            reformat_luks,
            label,
            wait,
            passphrase_stdin,
        } => {
            let filesystem_type = match filesystem.as_deref() {
                Some(raw) => Some(
                    FilesystemType::parse(raw)
                        .with_context(|| format!("unsupported filesystem `{raw}`"))?,
                ),
                None => None,
            };
            let options = EncryptOptions {
                filesystem_type,
                preserve_data: preserve,
                reformat_luks,
                label,
            };
            let passphrase = read_passphrase(passphrase_stdin, true)?;
            let token = submit_secret(
                &secrets_socket,
                &path,
                OperationKind::Encrypt,
                passphrase.as_bytes(),
            )?;
            drop(passphrase);
            let request = ApiRequest::RequestEncrypt {
                path: path.clone(),
                token,
                options,
            };
            start_operation(&api_socket, &path, request, wait)?;
        }
        Commands::Watch => {
            let mut events = ApiClient::connect(&api_socket)?.subscribe()?;
            loop {
                match events.recv()? {
                    ApiResponse::Event { event } => print_event(&event),
                    other => debug!("ignoring {other:?}"),
                }
            }
        }
        Commands::Ping => {
            let mut api = ApiClient::connect(&api_socket)?;
            match api.call(&ApiRequest::Ping)? {
                ApiResponse::Pong { version } => {
                    println!("daemon is up (version {version})");
                }
                other => bail!(describe_failure(&other)),
            }
        }
        Commands::Validate { .. } | Commands::Schema => {}
    }

    Ok(())
}

/// Socket locations come from the config when it exists; a missing file means defaults.
fn load_client_config(path: &Path) -> Result<EnforcerConfig> {
    if !path.exists() {
        debug!("{} not found; using default socket paths", path.display());
        return Ok(EnforcerConfig::default());
    }
    EnforcerConfig::load(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn validate(path: &Path) -> Result<()> {
    let config = EnforcerConfig::load(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    let issues = config.validate();
    if issues.is_empty() {
        println!("Configuration {} is valid.", path.display());
        return Ok(());
    }
    eprintln!("Configuration {} has {} issue(s):", path.display(), issues.len());
    for issue in &issues {
        eprintln!("  - {issue}");
    }
    std::process::exit(1);
}

fn read_passphrase(from_stdin: bool, confirm: bool) -> Result<Zeroizing<String>> {
    if from_stdin {
        let mut line = Zeroizing::new(String::new());
        io::stdin()
            .lock()
            .read_line(&mut line)
            .context("read passphrase from stdin")?;
        let trimmed = Zeroizing::new(line.trim_end_matches(['\r', '\n']).to_string());
        ensure!(!trimmed.is_empty(), "no passphrase on stdin");
        return Ok(trimmed);
    }

    let first = Zeroizing::new(prompt_password("Passphrase: ")?);
    ensure!(!first.is_empty(), "passphrase must not be empty");
    if confirm {
        let second = Zeroizing::new(prompt_password("Confirm passphrase: ")?);
        ensure!(*first == *second, "passphrases do not match");
    }
    Ok(first)
}

/// Send an unlock or encrypt request; with `wait`, follow its events to the end.
fn start_operation(api_socket: &Path, path: &str, request: ApiRequest, wait: bool) -> Result<()> {
    // Subscribe before the request so no phase event is missed.
    let mut events = if wait {
        Some(ApiClient::connect(api_socket)?.subscribe()?)
    } else {
        None
    };

    let mut api = ApiClient::connect(api_socket)?;
    let operation_id = match api.call(&request)? {
        ApiResponse::Operation { operation_id } => operation_id,
        other => bail!(describe_failure(&other)),
    };
    println!("operation {operation_id} started for {path}");

    let Some(events) = events.as_mut() else {
        return Ok(());
    };
    loop {
        let event = match events.recv()? {
            ApiResponse::Event { event } => event,
            other => {
                debug!("ignoring {other:?}");
                continue;
            }
        };
        if event.path != path {
            continue;
        }
        match wait_outcome(&event) {
            Some(WaitOutcome::Completed(mountpoint)) => {
                if mountpoint.is_empty() {
                    println!("done");
                } else {
                    println!("done; mounted at {mountpoint}");
                }
                return Ok(());
            }
            Some(WaitOutcome::Failed(reason)) => bail!("operation failed: {reason}"),
            Some(WaitOutcome::Aborted) => bail!("operation aborted: {path} was removed"),
            None => {
                if event.event_type == EventType::OperationPhase {
                    println!("  {}", event.detail);
                }
            }
        }
    }
}

/// How a watched operation ended.
#[derive(Debug, PartialEq, Eq)]
enum WaitOutcome {
    Completed(String),
    Failed(String),
    Aborted,
}

fn wait_outcome(event: &EnforcerEvent) -> Option<WaitOutcome> {
    match event.event_type {
        EventType::OperationCompleted => Some(WaitOutcome::Completed(event.detail.clone())),
        EventType::OperationFailed => Some(WaitOutcome::Failed(event.detail.clone())),
        EventType::OperationAborted => Some(WaitOutcome::Aborted),
        _ => None,
    }
}

fn print_table(devices: &[DeviceSummary]) {
    if devices.is_empty() {
        println!("No block devices tracked.");
        return;
    }
    println!(
        "{:<28} {:<22} {:<22} {:<6} {:<12} MOUNT",
        "PATH", "CLASS", "STATE", "BUS", "FS"
    );
    for device in devices {
        println!(
            "{:<28} {:<22} {:<22} {:<6} {:<12} {}",
            device.path,
            device.class.to_string(),
            device.state.to_string(),
            device.bus.as_deref().unwrap_or("-"),
            device.filesystem.as_deref().unwrap_or("-"),
            device.mountpoint.as_deref().unwrap_or("-"),
        );
    }
}

fn print_device(device: &DeviceSummary) {
    println!("path:       {}", device.path);
    println!("class:      {}", device.class);
    println!("state:      {}", device.state);
    println!("bus:        {}", device.bus.as_deref().unwrap_or("-"));
    println!("filesystem: {}", device.filesystem.as_deref().unwrap_or("-"));
    println!("parent:     {}", device.parent.as_deref().unwrap_or("-"));
    println!("mountpoint: {}", device.mountpoint.as_deref().unwrap_or("-"));
    println!("last seen:  {}", device.last_seen.to_rfc3339());
    if let Some(op) = &device.operation {
        println!(
            "operation:  {} {} ({}{})",
            op.kind,
            op.id,
            op.phase,
            if op.aborted { ", aborted" } else { "" }
        );
    }
}

fn print_event(event: &EnforcerEvent) {
    println!(
        "{} {:<20} {} {}",
        event.at.format("%H:%M:%S"),
        event.event_type.as_str(),
        event.path,
        event.detail
    );
}
