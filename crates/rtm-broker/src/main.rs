//! # rtm-broker
//!
//! RTM broker binary: loads settings, installs logging and metrics, serves
//! the built-in message types and shuts down on ctrl-c or SIGTERM.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rtm_core::logging::init_subscriber;
use rtm_server::auth::{AnonymousAuthenticator, Authenticator, JwtAuthenticator};
use rtm_server::config::ServerConfig;
use rtm_server::dispatch::handlers::register_builtins;
use rtm_server::dispatch::{AuthorizerRegistry, HandlerRegistry};
use rtm_server::server::RtmServer;
use rtm_server::shutdown::wait_for_signal;
use rtm_settings::{AuthSettings, RtmSettings};
use tracing::info;

/// RTM connection broker.
#[derive(Parser, Debug)]
#[command(name = "rtm-broker", about = "Real-time messaging connection broker")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (defaults to `~/.rtm/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter directive, e.g. `debug` or `rtm_server=trace`.
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn settings_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(rtm_settings::settings_path)
    }

    /// Flags win over the settings file and environment.
    fn apply(&self, settings: &mut RtmSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json {
            settings.logging.json = true;
        }
    }
}

fn load(path: &Path, args: &Cli) -> Result<RtmSettings> {
    let mut settings = rtm_settings::load_settings_from_path(path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    args.apply(&mut settings);
    Ok(settings)
}

fn authenticator(settings: &AuthSettings) -> Arc<dyn Authenticator> {
    match JwtAuthenticator::from_settings(settings) {
        Some(jwt) => {
            info!(require_token = settings.require_token, "jwt authentication enabled");
            Arc::new(jwt)
        }
        None => Arc::new(AnonymousAuthenticator),
    }
}

fn builtin_tables() -> (HandlerRegistry, AuthorizerRegistry) {
    let mut handlers = HandlerRegistry::new();
    let mut authorizers = AuthorizerRegistry::new();
    register_builtins(&mut handlers, &mut authorizers);
    (handlers, authorizers)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = load(&args.settings_path(), &args)?;

    init_subscriber(&settings.logging.level, settings.logging.json);
    let metrics = rtm_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let (handlers, authorizers) = builtin_tables();
    let type_count = handlers.message_types().len();
    let config = ServerConfig::from(&settings);

    let server = RtmServer::new(config, handlers, authorizers, authenticator(&settings.auth))
        .context("Invalid registration table")?
        .with_metrics(metrics);

    let addr = server
        .listen()
        .await
        .context("Failed to bind server")?;

    info!("RTM broker listening on ws://{addr}/rtm ({type_count} message types registered)");

    wait_for_signal()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down...");
    let report = server.shutdown().await;
    info!(
        drained = report.drained,
        forced = report.forced,
        skipped = report.skipped,
        "connections closed"
    );

    info!("Shutdown complete");
    Ok(())
}
