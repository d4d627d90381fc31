//! fluxnode binary

use clap::{Parser, Subcommand};
use fluxnode::node::shutdown_signal;
use fluxnode::{BuildInfo, Config, Node};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "fluxnode")]
#[command(about = "Broker and data node with cluster bootstrap")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Run {
        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Hostname advertised to other cluster members
        #[arg(long)]
        hostname: Option<String>,

        /// Cluster URLs to join (comma-separated); applies to broker and data node
        #[arg(long, value_delimiter = ',')]
        join: Vec<String>,
    },

    /// Print the default configuration
    Config,

    /// Print version information
    Version,
}

fn init_tracing(config: &Config) {
    let mut filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    if config.logging.raft_tracing {
        if let Ok(directive) = "fluxnode::broker=debug".parse() {
            filter = filter.add_directive(directive);
        }
    }
    if config.logging.write_tracing {
        for target in ["fluxnode::node::ingest=debug", "fluxnode::data::server=debug"] {
            if let Ok(directive) = target.parse() {
                filter = filter.add_directive(directive);
            }
        }
    }
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let build = BuildInfo::default();

    match cli.command {
        Commands::Run {
            config,
            hostname,
            join,
        } => {
            let mut config = Config::load(config.as_deref())?;
            // CLI has priority over file and environment
            if let Some(hostname) = hostname {
                config.hostname = hostname;
            }
            if !join.is_empty() {
                config.broker.join_urls = join.clone();
                config.data.join_urls = join;
            }
            config.validate()?;
            init_tracing(&config);

            tracing::info!(version = %build.version, commit = %build.commit, "starting fluxnode");
            let mut node = Node::new(config, build);

            if let Err(e) = node.open().await {
                tracing::error!(error = %e, "bootstrap failed");
                if let Err(close_err) = node.close().await {
                    tracing::error!(error = %close_err, "cleanup after failed bootstrap");
                }
                return Err(e.into());
            }

            let fatal = tokio::select! {
                _ = shutdown_signal() => None,
                err = node.fatal_error() => err,
            };

            node.close().await?;
            if let Some(e) = fatal {
                tracing::error!(error = %e, "fatal error, node stopped");
                return Err(e.into());
            }
            tracing::info!("node stopped");
        }
        Commands::Config => {
            print!("{}", Config::default().to_toml()?);
        }
        Commands::Version => {
            println!("fluxnode v{} (git: {})", build.version, build.commit);
        }
    }

    Ok(())
}
