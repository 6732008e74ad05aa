//! mclink - split-proxy pair that batches, compresses, and dedups
//! Minecraft traffic over an expensive link.

use anyhow::{Context, Result};
use clap::Parser;
use mclink_core::{Config, HookChain, Role};
use mclink_proxy::{ExternalProxy, InternalProxy};
use std::path::PathBuf;
use tracing::info;

/// Command line surface. Everything else lives in the config file.
#[derive(Debug, Parser)]
#[command(name = "mclink", version, about)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "mclink.toml")]
    config: PathBuf,

    /// Override the configured role.
    #[arg(short, long, value_parser = parse_role)]
    role: Option<Role>,

    /// Force debug logging (same as debug = true in the config).
    #[arg(short, long)]
    debug: bool,
}

fn parse_role(value: &str) -> Result<Role, String> {
    match value {
        "internal" => Ok(Role::Internal),
        "external" => Ok(Role::External),
        other => Err(format!("Unknown role {other:?} (internal|external)")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;
    if let Some(role) = cli.role {
        config.role = role;
    }
    if cli.debug {
        config.debug = true;
    }

    // RUST_LOG wins; the config's debug flag sets the default otherwise.
    let default_level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    info!(
        "Starting mclink v{} as the {:?} proxy",
        env!("CARGO_PKG_VERSION"),
        config.role
    );

    let proxy = async {
        match config.role {
            Role::External => {
                let proxy = ExternalProxy::bind(config).await?;
                proxy.run(HookChain::new(), HookChain::new()).await
            }
            Role::Internal => {
                let proxy = InternalProxy::bind(config).await?;
                proxy.run(HookChain::new(), HookChain::new()).await
            }
        }
    };

    tokio::select! {
        result = proxy => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted; shutting down");
            Ok(())
        }
    }
}
