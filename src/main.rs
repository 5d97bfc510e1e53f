use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use hermod::backend::{BackendCommand, BackendConnection};
use hermod::config::{self, BackendConfig, Config, ProbeConfig};
use hermod::monitor::{self, MonitorEvent, MonitorSink};
use hermod::protocol::ErrPacket;
use hermod::router::{ChannelUpstream, ReplyEvent};
use hermod::session::{ClientSession, SessionState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = load_or_default_config();

    if config.backends.is_empty() {
        warn!("No backends configured, nothing to probe");
        return Ok(());
    }

    // Maintenance requests (ER_HOST_IS_BLOCKED) land here; a full proxy
    // would hand them to its monitor instead
    let (monitor, mut monitor_events) = monitor::channel();
    tokio::spawn(async move {
        while let Some(event) = monitor_events.recv().await {
            match event {
                MonitorEvent::SetMaintenance { server, reason } => {
                    warn!(server = %server, reason = %reason, "Server flagged for maintenance");
                }
            }
        }
    });

    let mut failures = 0;
    for backend in &config.backends {
        match probe_backend(backend, &config.probe, monitor.clone()).await {
            Ok(()) => info!(backend = %backend.label(), "Probe succeeded"),
            Err(e) => {
                failures += 1;
                error!(backend = %backend.label(), error = %e, "Probe failed");
            }
        }
    }

    if failures > 0 {
        return Err(anyhow!("{failures} backend(s) failed the probe"));
    }
    Ok(())
}

/// Connect, authenticate, ping and (optionally) run the probe query against
/// one backend, logging the tagged reply.
async fn probe_backend(
    backend: &BackendConfig,
    probe: &ProbeConfig,
    monitor: MonitorSink,
) -> anyhow::Result<()> {
    let session = Arc::new(
        ClientSession::new(&backend.user)
            .with_password(&backend.password)
            .with_database(backend.database.clone().unwrap_or_default()),
    );

    let (upstream, mut replies) = ChannelUpstream::channel();
    let connection = BackendConnection::connect(backend, session.clone(), Box::new(upstream))
        .await
        .context("backend connection failed")?
        .with_monitor(monitor);

    let (commands, mut command_rx) = mpsc::channel::<BackendCommand>(16);
    let driver = tokio::spawn(async move {
        let mut connection = connection;
        let result = connection.run(&mut command_rx).await;
        (connection, result)
    });

    // The ping reply is consumed internally; the probe query produces the
    // observable reply
    commands.send(BackendCommand::ping()).await?;
    if !probe.query.is_empty() {
        commands
            .send(BackendCommand::query(&probe.query).track_state())
            .await?;

        let timeout = Duration::from_millis(probe.timeout_ms);
        let reply = tokio::time::timeout(timeout, complete_reply(&mut replies))
            .await
            .map_err(|_| anyhow!("timed out waiting for the probe reply"))??;

        info!(
            backend = %backend.label(),
            command = ?reply.command(),
            rows = reply.rows(),
            fields = reply.field_count(),
            warnings = reply.num_warnings(),
            "Probe reply complete"
        );
    }

    // Close down without reporting the teardown as a failure
    session.set_state(SessionState::Stopping);
    commands.send(BackendCommand::quit()).await?;
    drop(commands);

    let (connection, result) = driver.await?;
    if let Err(e) = result {
        // Hangup after COM_QUIT is the expected way out
        info!(backend = %backend.label(), reason = %e, "Connection closed");
    }
    drop(connection);
    Ok(())
}

/// Wait for the reply that completes the probe query
async fn complete_reply(
    replies: &mut mpsc::UnboundedReceiver<ReplyEvent>,
) -> anyhow::Result<hermod::backend::Reply> {
    while let Some(event) = replies.recv().await {
        match event {
            ReplyEvent::Data { reply, .. } => {
                if let Some(error) = reply.error() {
                    return Err(anyhow!(
                        "backend returned error {}: {}",
                        error.code,
                        error.message
                    ));
                }
                if reply.is_complete() {
                    return Ok(reply);
                }
            }
            ReplyEvent::Error { message, .. } => {
                let detail = ErrPacket::parse(message.get(4..).unwrap_or_default())
                    .map(|e| e.error_message)
                    .unwrap_or_else(|| "unknown error".to_string());
                return Err(anyhow!("backend failed: {detail}"));
            }
        }
    }
    Err(anyhow!("connection closed before the reply completed"))
}

fn load_or_default_config() -> Config {
    let config_paths = ["config/hermod.toml", "hermod.toml"];

    for path in config_paths {
        match config::load_config(path) {
            Ok(config) => {
                info!(path = path, "Loaded configuration");
                return config;
            }
            Err(e) => {
                warn!(path = path, error = %e, "Failed to load config");
            }
        }
    }

    info!("Using default configuration");
    Config::default()
}
