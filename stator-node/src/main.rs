//! # statord
//!
//! Single-process stator node. Reads newline-delimited JSON from stdin:
//! commands go through the API manager and print their result on stdout,
//! raw event envelopes go straight onto the in-process bus.

mod bus;
mod config;
mod intake;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use stator_manager::ApiManager;
use stator_mapper::ProjectionCompiler;
use stator_runtime::{
    ChannelDispatcher, Collaborators, DefaultPathPolicy, MemoryRepository, Node,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::NodeConfig;

#[derive(Parser)]
#[command(name = "statord")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(long, env = "STATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Name of this node in the placement table
    #[arg(long, env = "STATOR_NODE_NAME")]
    node_name: Option<String>,

    /// Number of queues entities are hashed into
    #[arg(long, env = "STATOR_QUEUE_COUNT")]
    queue_count: Option<usize>,

    /// What a plain replace does when the parent path is missing
    #[arg(long, value_enum, env = "STATOR_DEFAULT_PATH_POLICY")]
    default_path_policy: Option<PathPolicyArg>,

    /// Request timeout in milliseconds
    #[arg(long, env = "STATOR_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum PathPolicyArg {
    Reject,
    Ignore,
    Create,
}

impl From<PathPolicyArg> for DefaultPathPolicy {
    fn from(arg: PathPolicyArg) -> Self {
        match arg {
            PathPolicyArg::Reject => DefaultPathPolicy::Reject,
            PathPolicyArg::Ignore => DefaultPathPolicy::Ignore,
            PathPolicyArg::Create => DefaultPathPolicy::Create,
        }
    }
}

impl Cli {
    fn apply(&self, config: &mut NodeConfig) {
        if let Some(name) = &self.node_name {
            config.runtime.node_name = name.clone();
        }
        if let Some(count) = self.queue_count {
            config.runtime.queue_count = count;
        }
        if let Some(policy) = self.default_path_policy {
            config.runtime.default_path_policy = policy.into();
        }
        if let Some(timeout) = self.timeout_ms {
            config.holder.timeout_ms = timeout;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries command results, logs go to stderr
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(if cli.verbose {
                tracing::Level::DEBUG.into()
            } else {
                tracing::Level::INFO.into()
            }),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = NodeConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    let repository = Arc::new(MemoryRepository::new());
    let (dispatcher, bus_rx) = ChannelDispatcher::new();
    let dispatcher = Arc::new(dispatcher);
    let (shutdown, shutdown_rx) = watch::channel(false);

    let node = Arc::new(Node::new(
        config.runtime.clone(),
        Collaborators::new(repository.clone(), dispatcher.clone(), Arc::new(bus::LogPublisher)),
    ));
    node.initialize_metadata().await?;

    let manager = ApiManager::new(
        &config.holder,
        dispatcher.clone(),
        repository,
        Arc::new(ProjectionCompiler::new()),
        shutdown_rx.clone(),
    );
    let router = tokio::spawn(bus::route(
        bus_rx,
        node.clone(),
        manager.holder().clone(),
        shutdown_rx,
    ));

    info!(
        node = %config.runtime.node_name,
        queues = config.runtime.queue_count,
        "statord ready"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match intake::ingest(line, &manager, dispatcher.as_ref()).await {
                    Ok(Some(output)) => println!("{}", output),
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, "rejected input line"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    shutdown.send_replace(true);
    node.shutdown().await;
    if let Err(err) = router.await {
        warn!(error = %err, "bus router failed");
    }
    Ok(())
}
