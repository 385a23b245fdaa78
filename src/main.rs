//! # relay
//!
//! Gateway binary: loads settings, opens the state store, and drives the
//! session pipeline from a console transport until ctrl-c.

#![deny(unsafe_code)]

mod console;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use relay_core::directory::{ChannelProfile, StaticDirectory};
use relay_core::ChannelId;
use relay_server::settings::apply_overrides;
use relay_server::{load_settings, start_admin, Collaborators, Manager};
use relay_telemetry::init_telemetry;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::console::{read_stdin, ConsoleTransport, EchoEngine};

/// Conversational relay gateway.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "Conversational relay gateway")]
struct Cli {
    /// JSON settings file merged over the defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// State backend: memory, sqlite or redis.
    #[arg(long)]
    backend: Option<String>,

    /// Key prefix shared by every instance of one deployment.
    #[arg(long)]
    namespace: Option<String>,

    #[arg(long)]
    redis_url: Option<String>,

    #[arg(long)]
    sqlite_path: Option<PathBuf>,

    /// Serve the admin router on this port (0 for auto-assign).
    #[arg(long)]
    admin_port: Option<u16>,

    /// Human-readable logs instead of JSON.
    #[arg(long)]
    pretty: bool,
}

impl Cli {
    /// Flags expressed as the environment overrides they stand for, so they
    /// win over both the file and the process environment.
    fn overrides(&self) -> HashMap<&'static str, String> {
        let mut map = HashMap::new();
        if let Some(v) = &self.backend {
            map.insert("RELAY_BACKEND", v.clone());
        }
        if let Some(v) = &self.namespace {
            map.insert("RELAY_NAMESPACE", v.clone());
        }
        if let Some(v) = &self.redis_url {
            map.insert("RELAY_REDIS_URL", v.clone());
        }
        if let Some(v) = &self.sqlite_path {
            map.insert("RELAY_SQLITE_PATH", v.to_string_lossy().into_owned());
        }
        if let Some(v) = self.admin_port {
            map.insert("RELAY_ADMIN_PORT", v.to_string());
        }
        if self.pretty {
            map.insert("RELAY_LOG_FORMAT", "pretty".into());
        }
        map
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let mut settings =
        load_settings(args.config.as_deref()).context("Failed to load settings")?;
    let overrides = args.overrides();
    apply_overrides(&mut settings, |name| overrides.get(name).cloned());
    settings.validate().context("Invalid settings")?;

    let telemetry = init_telemetry(settings.telemetry_config());
    let metrics = telemetry.metrics();

    if settings.server.channels.is_empty() {
        settings.server.channels.push("console".into());
    }
    let channel = ChannelId::from_raw(settings.server.channels[0].clone());
    let directory = StaticDirectory::with_profiles(
        settings
            .server
            .channels
            .iter()
            .map(|c| ChannelProfile::open(ChannelId::from_raw(c.clone()), "echo".into(), "local")),
    );
    let collaborators = Collaborators {
        transport: Arc::new(ConsoleTransport::new()),
        directory: Arc::new(directory),
        engine: Arc::new(EchoEngine),
    };

    let admin_host = settings.server.admin_host.clone();
    let admin_port = settings.server.admin_port;
    let manager = Manager::start(settings, collaborators, metrics)
        .await
        .context("Failed to start relay")?;

    let cancel = CancellationToken::new();
    let admin = match admin_port {
        Some(port) => Some(
            start_admin(Arc::clone(&manager), &admin_host, port, cancel.child_token())
                .await
                .context("Failed to start admin router")?,
        ),
        None => None,
    };
    if let Some(admin) = &admin {
        tracing::info!(port = admin.port, "admin router ready");
    }

    let (tx, rx) = mpsc::channel(256);
    let reader = tokio::spawn(read_stdin(channel.clone(), tx, cancel.child_token()));
    let runner = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.run(rx).await })
    };
    tracing::info!(channel_id = %channel, "relay ready, type `chat: message` lines");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;
    tracing::info!("Shutting down");

    cancel.cancel();
    manager.shutdown().await;
    let _ = runner.await;
    match reader.await {
        Ok(Err(e)) => tracing::warn!(error = %e, "stdin reader failed"),
        Ok(Ok(())) | Err(_) => {}
    }
    if let Some(admin) = admin {
        admin.stopped().await;
    }
    Ok(())
}
