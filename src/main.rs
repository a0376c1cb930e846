use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use blastproxy::config;
use blastproxy::core::Core;
use blastproxy::events;
use blastproxy::node::NodeAgent;
use blastproxy::proxy;

#[derive(Parser)]
#[command(name = "blastproxy")]
#[command(version, about = "HTTP load-balancing proxy with self-registering backends", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(long, global = true)]
    config: Option<String>,

    /// Environment overlay to apply from the config file
    #[arg(long, global = true)]
    environment: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy and its registration channel
    Proxy,

    /// Keep an already running backend registered with a proxy
    Node {
        /// Hostname the proxy should forward to
        #[arg(long)]
        hostname: Option<String>,

        /// Port the proxy should forward to
        #[arg(long)]
        port: Option<u16>,

        /// Maximum requests per supervisor cycle
        #[arg(long)]
        connections: Option<u32>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let mut config = config::load_config(cli.config.as_deref(), cli.environment.as_deref())?;

    match cli.command {
        Commands::Proxy => {
            let core = Core::new(config)?;
            tokio::spawn(events::log_events(core.events.subscribe()));

            info!(
                proxy = %core.config.proxy.listen_addr(),
                control = %core.config.cluster.listen_addr(),
                "starting blastproxy"
            );

            tokio::select! {
                result = proxy::run_server(&core) => result?,
                _ = tokio::signal::ctrl_c() => info!("shutting down"),
            }
        }
        Commands::Node {
            hostname,
            port,
            connections,
        } => {
            if let Some(hostname) = hostname {
                config.node.hostname = hostname;
            }
            if let Some(port) = port {
                config.node.port = port;
            }
            if connections.is_some() {
                config.node.connections = connections;
            }

            let agent = NodeAgent::new(config.node);
            info!(
                node = %format!("{}:{}", agent.config().hostname, agent.config().port),
                proxy = %agent.config().proxy_url(),
                "starting node agent"
            );
            agent
                .run(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await;
        }
    }

    Ok(())
}
