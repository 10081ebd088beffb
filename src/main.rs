//! Cloud link daemon
//!
//! Keeps a device connected to its cloud IoT bridge, publishes a telemetry
//! heartbeat and logs the commands and configuration it receives.

use clap::{Parser, Subcommand};
use iot_cloud_link::observability::init_default_logging;
use iot_cloud_link::transport::mqtt::ConnectionState;
use iot_cloud_link::{CloudCallbacks, CloudError, CloudHandler, CloudLinkConfig, DriveMode};
use std::future::Future;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

/// Resilient MQTT link between a device and its cloud IoT bridge
#[derive(Parser)]
#[command(name = "cloud-link")]
#[command(about = "Token-authenticated cloud IoT connection with key rotation and backoff")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "CLOUD_LINK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and stay connected until interrupted
    Run {
        /// Seconds between telemetry heartbeats (0 disables them)
        #[arg(long, default_value_t = 60)]
        telemetry_interval_secs: u64,
    },
    /// Print a freshly signed device token
    Token,
    /// Validate configuration
    Config {
        /// Show current configuration with secrets redacted
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run {
            telemetry_interval_secs,
        } => run_link(config, telemetry_interval_secs).await,
        Commands::Token => print_token(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<CloudLinkConfig, Box<dyn std::error::Error>> {
    let path = match config_path {
        Some(path) => path.clone(),
        None => ["device.toml", "config/device.toml"]
            .into_iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
            .ok_or("No configuration file found. Provide one with -c/--config or create device.toml")?,
    };

    info!("Loading configuration from: {}", path.display());
    Ok(CloudLinkConfig::load_from_file(&path)?)
}

/// Callbacks that log everything the cloud sends
struct LoggingCallbacks;

impl CloudCallbacks for LoggingCallbacks {
    fn on_connected(&self) {
        info!("Cloud link ready");
    }

    fn on_command(&self, topic: &str, payload: &[u8]) {
        info!(topic, payload = %String::from_utf8_lossy(payload), "Command received");
    }

    fn on_config_update(&self, payload: &[u8]) {
        info!(payload = %String::from_utf8_lossy(payload), "Configuration received");
    }

    fn on_state_change(&self, state: ConnectionState) {
        info!(%state, "Cloud link state changed");
    }
}

async fn run_link(
    config: CloudLinkConfig,
    telemetry_interval_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let tick = Duration::from_millis(config.runtime.tick_ms.max(1));
    let mut handler = CloudHandler::new(config).with_callbacks(Arc::new(LoggingCallbacks));
    handler.setup().await?;
    info!(mode = ?handler.mode(), "Cloud link running");

    drive_until(&mut handler, tick, telemetry_interval_secs, signal::ctrl_c()).await;

    let status = handler.status().await;
    info!(
        state = %status.state,
        interval_ms = status.interval_ms,
        last_return_code = %status.last_return_code,
        "Final link status"
    );
    handler.cleanup().await;
    Ok(())
}

/// Drive the link until `shutdown` completes
///
/// `shutdown` is polled across loop iterations, so a signal that lands
/// while a step or heartbeat publish is in flight is still observed.
async fn drive_until<F: Future>(
    handler: &mut CloudHandler,
    tick: Duration,
    telemetry_interval_secs: u64,
    shutdown: F,
) {
    let started = Instant::now();
    let mut step = interval(tick);
    step.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let heartbeat_period = Duration::from_secs(telemetry_interval_secs.max(1));
    let mut heartbeat = interval(heartbeat_period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received interrupt, shutting down");
                break;
            }
            _ = step.tick(), if handler.mode() == DriveMode::Cooperative => {
                handler.step().await;
            }
            _ = heartbeat.tick(), if telemetry_interval_secs > 0 => {
                let payload = serde_json::json!({
                    "uptime_secs": started.elapsed().as_secs(),
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                });
                if !handler.publish_telemetry(payload.to_string().as_bytes()).await {
                    warn!("Telemetry heartbeat not delivered");
                }
            }
        }
    }
}

async fn print_token(mut config: CloudLinkConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.connection.enabled = true;
    let mut handler = CloudHandler::new(config).with_mode(DriveMode::Cooperative);
    handler.setup().await?;

    let token = handler.device_token().await.ok_or(CloudError::ClockNotReady);
    handler.cleanup().await;

    println!("{}", token?);
    Ok(())
}

fn handle_config_command(
    config: &CloudLinkConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(&config.redacted())?);
    }

    info!("Configuration validation complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use iot_cloud_link::testing::mocks::{ManualClock, MockFactory};
    use iot_cloud_link::DeviceSection;

    fn cooperative_handler(factory: &MockFactory) -> CloudHandler {
        let device = DeviceSection {
            project_id: "proj".to_string(),
            location: "europe-west1".to_string(),
            registry_id: "reg".to_string(),
            device_id: "dev-1".to_string(),
        };
        let mut config = CloudLinkConfig::new(device, vec!["A".to_string()]);
        config.reconnect.health_probe_attempts = 1;
        config.reconnect.health_probe_delay_ms = 0;
        CloudHandler::new(config)
            .with_factory(Arc::new(factory.clone()))
            .with_clock(Arc::new(ManualClock::synced()))
            .with_mode(DriveMode::Cooperative)
    }

    #[tokio::test]
    async fn test_shutdown_observed_while_stepping_continuously() {
        let factory = MockFactory::new("dev-1");
        let mut handler = cooperative_handler(&factory);
        handler.setup().await.unwrap();

        // step ticks fire far more often than the shutdown deadline
        let shutdown = tokio::time::sleep(Duration::from_millis(50));
        let finished = tokio::time::timeout(
            Duration::from_secs(5),
            drive_until(&mut handler, Duration::from_millis(1), 0, shutdown),
        )
        .await;

        assert!(finished.is_ok(), "loop ignored the shutdown signal");
        assert!(factory.client.poll_count() > 1);
        assert_eq!(handler.state().await, ConnectionState::Connected);
        handler.cleanup().await;
    }

    #[tokio::test]
    async fn test_heartbeat_publishes_telemetry() {
        let factory = MockFactory::new("dev-1");
        let mut handler = cooperative_handler(&factory);
        handler.setup().await.unwrap();

        let shutdown = tokio::time::sleep(Duration::from_millis(50));
        drive_until(&mut handler, Duration::from_millis(5), 60, shutdown).await;

        let telemetry: Vec<_> = factory
            .client
            .published()
            .into_iter()
            .filter(|(topic, _)| topic.ends_with("/events"))
            .collect();
        assert_eq!(telemetry.len(), 1);
        let payload: serde_json::Value = serde_json::from_slice(&telemetry[0].1).unwrap();
        assert!(payload.get("uptime_secs").is_some());
        handler.cleanup().await;
    }
}
