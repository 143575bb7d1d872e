pub mod command;
pub mod config;
pub mod control;
pub mod device;
pub mod mqtt;
pub mod registry;

use crate::config::{BridgeConfig, ConfigError};
use crate::control::ControlAction;
use crate::mqtt::connectivity::ConnectivityProbe;
use crate::mqtt::engine::{ConnectionEngine, ConnectionState};
use crate::registry::Registry;
use clap::Parser;
use color_eyre::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// MQTT bridge for home devices
#[derive(Parser, Debug)]
#[command(name = "devicelink", version)]
struct Cli {
    /// Configuration file, defaults to <config dir>/devicelink/config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds to wait after the first connect before sending requests
    #[arg(long, default_value_t = 10)]
    settle_secs: u64,

    /// Command ids to fire, or `<device id>=on|off|<level>`
    requests: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(BridgeConfig::default_path);
    let mut config = load_config(&config_path);

    let registry = Arc::new(Registry::new(config.device_options()));
    let engine = ConnectionEngine::new(config.mqtt_config(), Arc::clone(&registry));
    let shutdown = CancellationToken::new();

    let (home_tx, home_rx) = watch::channel(config.home().to_string());
    let updates = tokio::spawn(log_updates(Arc::clone(&registry), home_rx, shutdown.clone()));
    let mut probe = start_probe(&config, &engine, &shutdown);

    if engine.connect().await {
        info!("Bridge connected");
    } else if config.mqtt_config().is_configured() {
        warn!("Initial connect failed, waiting for the network");
    }

    let requests = parse_requests(&cli.requests);
    if !requests.is_empty() {
        let engine = engine.clone();
        let settle = Duration::from_secs(cli.settle_secs);
        tokio::spawn(send_after_settle(engine, requests, settle));
    }

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut hangup = signal(SignalKind::hangup())?;
        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result?;
                    break;
                }
                _ = hangup.recv() => {
                    info!("SIGHUP received, reloading {}", config_path.display());
                    let reloaded = load_config(&config_path);
                    let moved = engine.reconfigure(reloaded.mqtt_config());
                    if moved || reloaded.probe_differs(&config) {
                        if let Some(old) = probe.take() {
                            old.stop().await;
                        }
                        probe = start_probe(&reloaded, &engine, &shutdown);
                    }
                    if reloaded.devices != config.devices {
                        warn!("Device options changed, they apply after a restart");
                    }
                    home_tx.send_replace(reloaded.home().to_string());
                    config = reloaded;
                }
            }
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    shutdown.cancel();
    if let Some(probe) = probe.take() {
        probe.stop().await;
    }
    engine.shutdown().await;
    if let Err(e) = updates.await {
        error!("Update logger failed: {}", e);
    }
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

// Configuration problems are never fatal, the engine idles instead
fn load_config(path: &Path) -> BridgeConfig {
    match BridgeConfig::load(path) {
        Ok(config) => config,
        Err(e @ ConfigError::NotFound(_)) => {
            warn!("{}, running without a broker", e);
            BridgeConfig::unconfigured()
        }
        Err(e) => {
            error!("{}, running without a broker", e);
            BridgeConfig::unconfigured()
        }
    }
}

struct RunningProbe {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RunningProbe {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("Connectivity probe failed: {}", e);
        }
    }
}

fn start_probe(
    config: &BridgeConfig,
    engine: &ConnectionEngine,
    shutdown: &CancellationToken,
) -> Option<RunningProbe> {
    let mqtt = config.mqtt_config();
    if !mqtt.is_configured() {
        return None;
    }

    match ConnectivityProbe::new(mqtt.broker(), config.probe_interval()) {
        Some(probe) => {
            let cancel = shutdown.child_token();
            let task = probe.spawn(engine.clone(), cancel.clone());
            Some(RunningProbe { cancel, task })
        }
        None => {
            info!("Connectivity probe disabled, assuming the network is present");
            engine.notify_connectivity(true);
            None
        }
    }
}

fn parse_requests(raw: &[String]) -> Vec<(String, ControlAction)> {
    raw.iter()
        .filter_map(|request| {
            let parsed = control::parse_request(request);
            if parsed.is_none() {
                warn!("Ignoring malformed request {:?}", request);
            }
            parsed
        })
        .collect()
}

async fn send_after_settle(
    engine: ConnectionEngine,
    requests: Vec<(String, ControlAction)>,
    settle: Duration,
) {
    let mut states = engine.watch_state();
    if states
        .wait_for(|state| *state == ConnectionState::Connected)
        .await
        .is_err()
    {
        return;
    }

    info!("Waiting {:?} for device state to settle", settle);
    tokio::time::sleep(settle).await;

    for (control_id, action) in requests {
        if !control::perform(&engine, &control_id, action).await {
            error!("Request {} {:?} was not accepted", control_id, action);
        }
    }
}

async fn log_updates(
    registry: Arc<Registry>,
    home: watch::Receiver<String>,
    shutdown: CancellationToken,
) {
    let mut devices = registry.subscribe(Vec::<String>::new()).await;
    loop {
        let device = tokio::select! {
            _ = shutdown.cancelled() => break,
            device = devices.next() => match device {
                Some(device) => device,
                None => break,
            },
        };

        let home = home.borrow().clone();
        for view in control::controls_for(&device, &home) {
            info!(
                "[{}] {} ({}): {}",
                view.structure, view.title, view.id, view.status_text
            );
        }
    }
}
