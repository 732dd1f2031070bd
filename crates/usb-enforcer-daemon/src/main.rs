//! Privileged daemon: forces plaintext USB storage read-only and brokers
//! LUKS2 encrypt/unlock requests from unprivileged clients.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::thread;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio::{select, signal as ctrl};
use usb_enforcer_core::{
    logging, privilege, run_event_loop, DeviceEvent, EnforcementEngine, EnforcerConfig,
    EnforcerContext, EnforcerService, Platform,
};
use usb_enforcer_luks::SystemTooling;

mod api_server;
mod platform;
mod secrets_server;
mod sockets;
#[cfg(test)]
mod stub;
mod udev_monitor;

use platform::HostPlatform;
use sockets::{API_SOCKET_MODE, SECRETS_SOCKET_MODE};

#[derive(Parser, Debug)]
#[command(
    name = "usb-enforcerd",
    version,
    about = "USB data-loss-prevention enforcement daemon."
)]
struct Args {
    /// Configuration file (TOML or YAML). Defaults to $USB_ENFORCER_CONFIG,
    /// then /etc/usb-enforcer/config.toml.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate configuration and resolve external tools, then exit.
    #[arg(long)]
    check: bool,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run().await {
        error!("daemon exit: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level);

    let config_path = args.config.unwrap_or_else(EnforcerConfig::resolve_path);
    let config = EnforcerConfig::load_validated(&config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;
    let tooling = SystemTooling::from_config(&config).context("resolve system tools")?;
    info!("tools: {}", tooling.describe());

    if args.check {
        info!("configuration {} is valid", config_path.display());
        return Ok(());
    }
    privilege::ensure_root()?;

    info!(
        "USB enforcer daemon booting (config: {}, usb-only: {}, exempted groups: {:?})",
        config_path.display(),
        config.policy.enforce_on_usb_only,
        config.policy.exempted_groups
    );
    prepare_directories(&config)?;

    let secrets_path = PathBuf::from(&config.secrets.socket_path);
    let api_path = PathBuf::from(&config.api.socket_path);
    let secrets_listener = sockets::bind(&secrets_path, SECRETS_SOCKET_MODE)
        .context("create secrets channel socket")?;
    let api_listener =
        sockets::bind(&api_path, API_SOCKET_MODE).context("bind remote API socket")?;
    let reaper_every = Duration::from_secs(config.secrets.reaper_interval_secs);

    let ctx = EnforcerContext::new(config, Arc::new(HostPlatform::new(tooling)));
    let engine = Arc::new(EnforcementEngine::new(ctx.clone()));
    let service = EnforcerService::new(engine.clone());

    let (event_tx, event_rx) = mpsc::channel();
    let shutdown_tx = event_tx.clone();
    let _monitor = udev_monitor::spawn(event_tx).context("start udev monitor")?;
    let event_loop = spawn_event_loop(engine, event_rx).context("start device event loop")?;

    let secrets_handle = tokio::spawn(secrets_server::serve(secrets_listener, service.clone()));
    let api_handle = tokio::spawn(api_server::serve(api_listener, service.clone()));
    let reaper_handle = tokio::spawn(reap_tokens(service, reaper_every));
    let reload_handle = tokio::spawn(reload_on_hangup(ctx, config_path));

    let mut terminate = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let outcome = select! {
        res = secrets_handle => res.context("secrets channel task")?,
        res = api_handle => res.context("remote API task")?,
        res = reaper_handle => res.context("token reaper task")?,
        res = reload_handle => res.context("config reload task")?,
        _ = event_loop => Err(anyhow!("device monitoring stopped")),
        _ = ctrl::ctrl_c() => {
            info!("received interrupt; shutting down");
            Ok(())
        }
        _ = terminate.recv() => {
            info!("received SIGTERM; shutting down");
            Ok(())
        }
    };

    // The loop thread is detached; stop it before the process exits.
    let _ = shutdown_tx.send(DeviceEvent::Shutdown);
    sockets::remove(&secrets_path);
    sockets::remove(&api_path);
    outcome
}

/// Run the device event loop on its own thread. The receiver resolves when
/// the loop returns or panics.
fn spawn_event_loop(
    engine: Arc<EnforcementEngine<HostPlatform>>,
    events: mpsc::Receiver<DeviceEvent>,
) -> std::io::Result<oneshot::Receiver<()>> {
    let (done_tx, done_rx) = oneshot::channel();
    thread::Builder::new()
        .name("device-events".into())
        .spawn(move || {
            run_event_loop(&engine, events);
            let _ = done_tx.send(());
        })?;
    Ok(done_rx)
}

fn prepare_directories(config: &EnforcerConfig) -> Result<()> {
    let mount_root = config.mount_root();
    fs::create_dir_all(&mount_root)
        .with_context(|| format!("create mount root {}", mount_root.display()))?;

    let staging = config.staging_root();
    fs::create_dir_all(&staging)
        .with_context(|| format!("create staging root {}", staging.display()))?;
    fs::set_permissions(&staging, fs::Permissions::from_mode(0o700))
        .with_context(|| format!("restrict staging root {}", staging.display()))?;
    Ok(())
}

/// Scrub expired tokens on a fixed cadence.
async fn reap_tokens<P: Platform>(service: EnforcerService<P>, every: Duration) -> Result<()> {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        service.purge_tokens();
    }
}

/// Swap in a fresh configuration snapshot on SIGHUP; a bad file keeps the old one.
async fn reload_on_hangup<P: Platform>(ctx: Arc<EnforcerContext<P>>, path: PathBuf) -> Result<()> {
    let mut hangup = signal(SignalKind::hangup()).context("install SIGHUP handler")?;
    while hangup.recv().await.is_some() {
        let before = ctx.config();
        match ctx.config.reload(&path) {
            Ok(()) => {
                let after = ctx.config();
                if after.secrets.socket_path != before.secrets.socket_path
                    || after.api.socket_path != before.api.socket_path
                {
                    warn!("socket path changes take effect after a restart");
                }
            }
            Err(err) => warn!("configuration reload rejected, keeping previous snapshot: {err}"),
        }
    }
    Ok(())
}
