//! Lodestar command line client.
//!
//! Registers, resolves and watches services in an etcd-backed registry.

mod commands;
mod config;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use lodestar_client::store::EtcdStore;
use lodestar_client::{Instance, Registry};
use tracing::info;

use crate::config::AppConfig;
use crate::logging::LoggingConfig;

#[derive(Debug, Parser)]
#[command(name = "lodestar", version, about = "Service registration and discovery over etcd")]
struct Cli {
    /// Configuration file (toml, yaml or json)
    #[arg(short = 'c', long = "config", env = "LODESTAR_CONFIG")]
    config: Option<PathBuf>,
    /// etcd endpoints, comma separated
    #[arg(long = "endpoints", env = "LODESTAR_ENDPOINTS", value_delimiter = ',')]
    endpoints: Vec<String>,
    /// Key-space root
    #[arg(long = "namespace")]
    namespace: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register an instance and keep it registered until Ctrl-C
    Register(RegisterArgs),
    /// Print the live instances of a service
    Resolve { name: String },
    /// Print instance snapshots of a service as they change
    Watch { name: String },
}

#[derive(Debug, Args)]
struct RegisterArgs {
    #[arg(long = "name")]
    name: String,
    /// Instance id; a random UUID when omitted
    #[arg(long = "id")]
    id: Option<String>,
    #[arg(long = "version", default_value = "")]
    version: String,
    /// Endpoint URI, repeatable
    #[arg(long = "endpoint")]
    endpoints: Vec<String>,
    /// Metadata entry as key=value, repeatable
    #[arg(long = "metadata", value_parser = parse_key_value)]
    metadata: Vec<(String, String)>,
    #[arg(long = "deregister-timeout-secs", default_value_t = 5)]
    deregister_timeout_secs: u64,
}

impl RegisterArgs {
    fn instance(&self) -> Instance {
        let id = self
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.metadata.iter().fold(
            Instance::new(id, self.name.clone())
                .with_version(self.version.clone())
                .with_endpoints(self.endpoints.iter().cloned()),
            |instance, (key, value)| instance.with_metadata(key.clone(), value.clone()),
        )
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got {:?}", s)),
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut app_config = AppConfig::load(cli.config.as_deref())?;
    app_config.override_with(&cli.endpoints, cli.namespace.as_deref());

    let logging_config = LoggingConfig::from_section(&app_config.logging).with_env_overrides();
    let _logging_guard = logging::init_logging(&logging_config)?;

    let store = EtcdStore::connect(&app_config.store.etcd_options())
        .await
        .context("failed to connect to etcd")?;
    let registry = Registry::new(Arc::new(store), app_config.registry.options())
        .context("invalid registry configuration")?;
    info!(namespace = %registry.options().namespace, "Registry ready");

    let mut stdout = std::io::stdout().lock();
    match cli.command {
        Command::Register(args) => {
            let instance = args.instance();
            commands::register(
                &registry,
                &instance,
                ctrl_c(),
                Duration::from_secs(args.deregister_timeout_secs),
            )
            .await?;
        }
        Command::Resolve { name } => {
            let count = commands::resolve(&registry, &name, &mut stdout).await?;
            info!(service = %name, count, "Resolved instances");
        }
        Command::Watch { name } => {
            commands::watch(&registry, &name, ctrl_c(), &mut stdout).await?;
        }
    }

    registry.shutdown().await;
    Ok(())
}
