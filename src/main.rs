//! worker-bridge CLI entry point.
//!
//! Loads a TOML configuration, applies command-line overrides and runs the
//! HTTP host.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use worker_bridge_common::{ConfigFile, DeploymentTarget, InstanceStrategy};
use worker_bridge_server::BridgeServer;

#[derive(Debug, Parser)]
#[command(name = "worker-bridge", version, about)]
struct Args {
    /// TOML configuration file.
    #[arg(short, long, env = "WORKER_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Guest module (`.wasm`, `.wat` or `.cwasm`), replacing `[module]`.
    #[arg(short, long, env = "WORKER_BRIDGE_MODULE")]
    module: Option<PathBuf>,

    /// Address to listen on.
    #[arg(short, long, env = "BIND_ADDR")]
    bind: Option<SocketAddr>,

    /// Deployment target: cloudflare or browser.
    #[arg(long, env = "WORKER_BRIDGE_TARGET")]
    target: Option<DeploymentTarget>,

    /// Instance strategy: fresh or reuse.
    #[arg(long, env = "WORKER_BRIDGE_STRATEGY")]
    strategy: Option<InstanceStrategy>,
}

impl Args {
    /// Load the config file, or defaults, and apply the flags on top.
    fn into_config(self) -> anyhow::Result<ConfigFile> {
        let mut config = match &self.config {
            Some(path) => ConfigFile::from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => ConfigFile::default(),
        };

        if let Some(module) = self.module {
            let module = module.display().to_string();
            config.module.url = None;
            if module.ends_with(".cwasm") {
                config.module.path = None;
                config.module.precompiled = Some(module);
            } else {
                config.module.precompiled = None;
                config.module.path = Some(module);
            }
        }
        if let Some(bind) = self.bind {
            config.server.bind_addr = bind.to_string();
        }
        if let Some(target) = self.target {
            config.runtime.bridge.target = target;
        }
        if let Some(strategy) = self.strategy {
            config.runtime.bridge.instance_strategy = strategy;
        }

        config.module.validate()?;
        anyhow::ensure!(
            !config.module.is_empty(),
            "No guest module configured. Pass --module or set [module] in the config file"
        );
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,worker_bridge=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Args::parse().into_config()?;

    info!(
        bind_addr = %config.server.bind_addr,
        target = %config.runtime.bridge.target,
        strategy = %config.runtime.bridge.instance_strategy,
        pages = config.server.pages,
        "Configuration loaded"
    );

    let server = BridgeServer::new(&config)?;

    info!("Server initialized. Available endpoints:");
    info!("  GET  /__health            - Health check");
    info!("  GET  /__ready             - Readiness check");
    info!("  POST /__scheduled         - Scheduled trigger (?cron=&time=)");
    info!("  POST /__queue/:queue      - Queue batch (JSON array)");
    info!("  POST /__email             - Incoming email (?from=&to=)");
    info!("  ANY  /*                   - Request handler");

    server.run().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_flag_overrides_config() {
        let args = Args::parse_from([
            "worker-bridge",
            "--module",
            "app.cwasm",
            "--strategy",
            "reuse",
        ]);
        let config = args.into_config().unwrap();

        assert_eq!(config.module.precompiled.as_deref(), Some("app.cwasm"));
        assert!(config.module.path.is_none());
        assert_eq!(config.runtime.bridge.instance_strategy, InstanceStrategy::Reuse);
    }

    #[test]
    fn test_missing_module_rejected() {
        let args = Args::parse_from(["worker-bridge"]);
        assert!(args.into_config().is_err());
    }

    #[test]
    fn test_unknown_target_rejected() {
        assert!(Args::try_parse_from(["worker-bridge", "--target", "lambda"]).is_err());
    }
}
