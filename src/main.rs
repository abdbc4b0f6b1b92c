//! presence-monitor - watch devices announced over MQTT

use clap::{Parser, Subcommand};
use mqtt_presence::config::PresenceConfig;
use mqtt_presence::observability::init_default_logging;
use mqtt_presence::transport::MqttError;
use mqtt_presence::{Identity, Manager, MqttTransport, UpdateType};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Observe MQTT device presence
#[derive(Parser)]
#[command(name = "presence-monitor")]
#[command(about = "Observe devices announced over MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Broker URL, overrides the configuration file
    #[arg(short, long, env = "MQTT_BROKER_URL")]
    broker: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log every device that is added, updated or removed
    Monitor,
    /// Wait for one device and print its announcement
    Wait {
        /// Device topic
        #[arg(long)]
        topic: String,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Monitor => run_monitor(config).await,
        Commands::Wait {
            topic,
            timeout_secs,
        } => run_wait(config, &topic, Duration::from_secs(timeout_secs)).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(cli: &Cli) -> Result<PresenceConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            PresenceConfig::load_from_file(path)?
        }
        None => {
            let default_path = PathBuf::from("presence.toml");
            if default_path.exists() {
                info!("Loading configuration from: {}", default_path.display());
                PresenceConfig::load_from_file(&default_path)?
            } else {
                PresenceConfig::default()
            }
        }
    };

    if let Some(broker) = &cli.broker {
        config.mqtt.broker_url = broker.clone();
    }
    config.validate()?;
    Ok(config)
}

struct Session {
    manager: Arc<Manager>,
    cancel: CancellationToken,
    supervisor: JoinHandle<Result<(), MqttError>>,
}

/// Connect and build the manager; Ctrl-C cancels everything
fn start(config: PresenceConfig) -> Result<Session, Box<dyn std::error::Error>> {
    let retry_delay = config.reconnect_delay();
    let transport = Arc::new(MqttTransport::new(config)?);
    let manager = Manager::new(transport.clone());
    let cancel = CancellationToken::new();

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
        }
        shutdown.cancel();
    });

    let supervisor = tokio::spawn(supervise(transport, cancel.clone(), retry_delay));
    Ok(Session {
        manager,
        cancel,
        supervisor,
    })
}

/// Keep the supervisor running, restarting it when it hands a failed
/// connection attempt back
async fn supervise(
    transport: Arc<MqttTransport>,
    cancel: CancellationToken,
    retry_delay: Duration,
) -> Result<(), MqttError> {
    loop {
        match transport.start(cancel.clone()).await {
            (true, Err(e)) => {
                warn!("Connection attempt failed, retrying in {:?}: {}", retry_delay, e);
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(retry_delay) => {}
                }
            }
            (_, Err(MqttError::Cancelled)) | (_, Ok(())) => return Ok(()),
            (false, Err(e)) => return Err(e),
        }
    }
}

async fn run_monitor(config: PresenceConfig) -> Result<(), Box<dyn std::error::Error>> {
    let Session {
        manager,
        cancel,
        supervisor,
    } = start(config)?;
    let mut updates = manager.update_channel();
    let runner = manager.spawn(cancel.clone());

    while let Some(update) = updates.recv().await {
        let device = &update.device;
        match update.update_type {
            UpdateType::Added => info!(
                topic = %device.id(),
                name = %device.name(),
                device_type = %device.device_type(),
                reachable = device.is_reachable(),
                "Device added"
            ),
            UpdateType::Updated => {
                for change in &update.changes {
                    info!(
                        topic = %device.id(),
                        field = %change.field,
                        old = %change.old,
                        new = %change.new,
                        "Device updated"
                    );
                }
            }
            UpdateType::Removed => info!(topic = %device.id(), "Device removed"),
        }
    }

    cancel.cancel();
    runner.await??;
    supervisor.await??;
    Ok(())
}

async fn run_wait(
    config: PresenceConfig,
    topic: &str,
    timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let Session {
        manager,
        cancel,
        supervisor,
    } = start(config)?;
    let runner = manager.spawn(cancel.clone());

    let device = tokio::select! {
        device = manager.wait_for_device_timeout(topic, timeout) => device,
        _ = cancel.cancelled() => manager.device(topic),
    };
    cancel.cancel();
    runner.await??;
    supervisor.await??;

    let device = device.into_result()?;
    println!("{}", serde_json::to_string_pretty(&device.info())?);
    if !device.is_reachable() {
        warn!(topic = %topic, "Device is known but not confirmed reachable");
    }
    Ok(())
}

fn handle_config_command(
    config: PresenceConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
