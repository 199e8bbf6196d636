mod config;
mod logging;
mod ping;
mod signals;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use registry::{RegistrarSettings, Resolver};
use registry_transport_grpc::{NodeState, RpcServer, ServiceNode, TransportError};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;

/// Lease-backed service registration and discovery node
#[derive(Parser)]
#[command(name = "registry-node")]
#[command(about = "Register a gRPC service instance and resolve services through the registry")]
#[command(version)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Register and serve the built-in ping service until signalled
    Serve {
        /// Service name override
        #[arg(long)]
        name: Option<String>,
        /// Advertised address override (`host:port`, port 0 picks one)
        #[arg(long)]
        address: Option<String>,
        /// Service version override
        #[arg(long)]
        service_version: Option<String>,
    },
    /// Print the endpoint set of a service as JSON lines on every change
    Resolve {
        service: String,
        /// Only follow this version partition
        #[arg(long)]
        service_version: Option<String>,
        /// Exit after the first synchronised set
        #[arg(long)]
        once: bool,
    },
    /// Validate configuration, print it as JSON and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = NodeConfig::load(cli.config.as_deref())?;
    let command = cli.command.unwrap_or(Commands::Serve {
        name: None,
        address: None,
        service_version: None,
    });
    apply_cli_overrides(&mut config, &command);

    logging::init_logging(&config.logging, cli.verbose)?;
    config.validate()?;

    match command {
        Commands::Serve { .. } => serve(&config).await,
        Commands::Resolve { service, once, .. } => resolve(config, &service, once).await,
        Commands::Check => check(&config),
    }
}

fn apply_cli_overrides(config: &mut NodeConfig, command: &Commands) {
    match command {
        Commands::Serve {
            name,
            address,
            service_version,
        } => {
            if let Some(name) = name {
                config.service.name.clone_from(name);
            }
            if let Some(address) = address {
                config.service.address.clone_from(address);
            }
            if let Some(version) = service_version {
                config.service.version.clone_from(version);
            }
        }
        Commands::Resolve {
            service_version, ..
        } => {
            if service_version.is_some() {
                config.resolver.version.clone_from(service_version);
            }
        }
        Commands::Check => {}
    }
}

fn check(config: &NodeConfig) -> Result<()> {
    tracing::info!("configuration is valid");
    println!("{}", config.to_json()?);
    Ok(())
}

async fn serve(config: &NodeConfig) -> Result<()> {
    let shutdown = CancellationToken::new();
    signals::cancel_on_signal(shutdown.clone());

    let client = registry::store::connect(&config.store)
        .await
        .context("failed to connect to the coordination store")?;
    let server = RpcServer::new(config.server_settings())?.with_routes(ping::routes());
    let node = Arc::new(ServiceNode::new(
        client,
        server,
        RegistrarSettings::from(&config.store),
    ));
    node.init().await.context("failed to register service")?;
    if let Some(registrar) = node.registrar() {
        tracing::info!(
            service = %registrar.descriptor().service_name,
            address = %registrar.descriptor().address,
            key = %registrar.descriptor().registry_key(),
            "service registered"
        );
    }

    let mut serving = {
        let node = Arc::clone(&node);
        tokio::spawn(async move { node.run().await })
    };
    let finished_early = tokio::select! {
        () = shutdown.cancelled() => None,
        result = &mut serving => Some(result),
    };

    // Deregister before the listener goes away.
    let closed = node.close().await;
    let served = match finished_early {
        Some(result) => result,
        None => serving.await,
    };
    let served = served.context("gRPC server task panicked")?;
    if !stopped_by_close(&served) {
        served?;
    }
    closed?;
    Ok(())
}

/// `run` loses the race against a shutdown that began before it reached
/// `Serving`; that is a normal stop, not a failure.
fn stopped_by_close(result: &Result<(), TransportError>) -> bool {
    matches!(
        result,
        Err(TransportError::InvalidState {
            from: NodeState::Draining | NodeState::Stopped,
            ..
        })
    )
}

async fn resolve(config: NodeConfig, service: &str, once: bool) -> Result<()> {
    let shutdown = CancellationToken::new();
    signals::cancel_on_signal(shutdown.clone());

    let client = registry::store::connect(&config.store)
        .await
        .context("failed to connect to the coordination store")?;
    let resolver = Resolver::new(client, config.resolver).with_cancellation(&shutdown);
    let watch = resolver.resolve(service)?;
    let mut updates = watch.updates();

    loop {
        let set = tokio::select! {
            () = shutdown.cancelled() => break,
            next = updates.next() => match next {
                Some(set) => set,
                None => break,
            },
        };
        if set.state() == registry::SyncState::Syncing {
            continue;
        }
        let line = serde_json::json!({
            "service": service,
            "state": set.state().to_string(),
            "endpoints": set.descriptors().collect::<Vec<_>>(),
        });
        println!("{line}");
        if once {
            break;
        }
    }
    watch.shutdown().await;
    Ok(())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn serve_overrides_replace_service_identity() {
        let mut cfg = NodeConfig::default();
        apply_cli_overrides(
            &mut cfg,
            &Commands::Serve {
                name: Some("orders".to_owned()),
                address: Some("10.0.0.1:9000".to_owned()),
                service_version: None,
            },
        );
        assert_eq!(cfg.service.name, "orders");
        assert_eq!(cfg.service.address, "10.0.0.1:9000");
        assert_eq!(cfg.service.version, "v1");
    }

    #[test]
    fn resolve_override_sets_version_filter() {
        let mut cfg = NodeConfig::default();
        apply_cli_overrides(
            &mut cfg,
            &Commands::Resolve {
                service: "orders".to_owned(),
                service_version: Some("v2".to_owned()),
                once: true,
            },
        );
        assert_eq!(cfg.resolver.version.as_deref(), Some("v2"));
    }

    #[test]
    fn run_rejected_by_shutdown_counts_as_stop() {
        let draining: Result<(), TransportError> = Err(TransportError::InvalidState {
            from: NodeState::Draining,
            to: NodeState::Serving,
        });
        assert!(stopped_by_close(&draining));
        assert!(stopped_by_close(&Err(TransportError::InvalidState {
            from: NodeState::Stopped,
            to: NodeState::Serving,
        })));
        assert!(!stopped_by_close(&Err(TransportError::InvalidState {
            from: NodeState::Unconfigured,
            to: NodeState::Serving,
        })));
        assert!(!stopped_by_close(&Ok(())));
    }

    #[tokio::test]
    async fn shutdown_before_serving_is_clean() {
        let store = registry::MemoryStore::new();
        let server = RpcServer::new(NodeConfig::default().server_settings()).unwrap();
        let node = ServiceNode::new(Arc::new(store), server, RegistrarSettings::default());
        node.init().await.unwrap();
        node.close().await.unwrap();

        let served = node.run().await;
        assert!(stopped_by_close(&served));
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["registry-node", "-vv", "resolve", "orders", "--once"])
            .unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(
            cli.command,
            Some(Commands::Resolve { once: true, .. })
        ));
    }
}
