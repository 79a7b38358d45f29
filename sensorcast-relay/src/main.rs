//! SensorCast relay binary.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use sensorcast_common::init_tracing;
use sensorcast_relay::{Hub, RelayConfig, UpstreamSubscriber, ViewerServer};

/// Relay MQTT sensor telemetry to WebSocket viewers.
#[derive(Parser, Debug)]
#[command(name = "sensorcast-relay")]
#[command(about = "Relay MQTT sensor telemetry to live WebSocket viewers")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<String>,

    /// MQTT broker address (overrides config).
    #[arg(long)]
    broker: Option<String>,

    /// MQTT topic to relay (overrides config).
    #[arg(long)]
    topic: Option<String>,

    /// Viewer listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Number of records kept and sent to viewers (overrides config).
    #[arg(long)]
    capacity: Option<usize>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        RelayConfig::load_from_file(config_path)?
    } else {
        RelayConfig::default()
    };

    // CLI overrides
    if let Some(broker) = args.broker {
        config.mqtt.broker = broker;
    }
    if let Some(topic) = args.topic {
        config.mqtt.topic = topic;
    }
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(capacity) = args.capacity {
        config.history.capacity = capacity;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    init_tracing(&config.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        broker = %config.mqtt.broker,
        topic = %config.mqtt.topic,
        capacity = config.history.capacity,
        "Starting SensorCast relay"
    );

    let listen_addr: SocketAddr = config
        .server
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let hub = Arc::new(Hub::new());

    // Without a listener there is nothing to relay to
    let server = ViewerServer::bind(hub.clone(), listen_addr, config.viewer.clone())
        .await
        .map_err(|e| {
            error!(error = %e, "Cannot start viewer server");
            e
        })?;

    let subscriber =
        UpstreamSubscriber::new(hub.clone(), config.mqtt.clone(), config.history.capacity);

    // Start subscriber
    let subscriber_shutdown = shutdown_rx.clone();
    let subscriber_task = tokio::spawn(async move {
        if let Err(e) = subscriber.run(subscriber_shutdown).await {
            error!("Subscriber error: {}", e);
        }
    });

    // Start viewer server
    let server_shutdown = shutdown_rx.clone();
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run(server_shutdown).await {
            error!("Viewer server error: {}", e);
        }
    });

    wait_for_signal().await;

    // Signal shutdown
    shutdown_tx.send(true)?;

    // Wait for tasks to complete
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = subscriber_task.await;
        let _ = server_task.await;
    })
    .await;

    let stats = hub.stats();
    info!(
        messages_received = stats.messages_received,
        messages_accepted = stats.messages_accepted,
        messages_dropped = stats.messages_dropped,
        frames_sent = stats.frames_sent,
        frames_dropped = stats.frames_dropped,
        viewers_total = stats.viewers_total,
        "Final statistics"
    );

    info!("Relay stopped");
    Ok(())
}

/// Wait for Ctrl+C or, on Unix, SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
                return;
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
    }
    info!("Received Ctrl+C, shutting down...");
}
