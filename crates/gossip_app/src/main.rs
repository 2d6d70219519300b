mod logging;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::info;

use gossip_network::{
    ClusterConfig, ClusterMember, Connection, GossipMessage, GossipNode, NodeConfig, RawMessage,
};

const DEFAULT_ITERATIONS: usize = 500;
const BULK_MESSAGE_SIZE: usize = 1024 * 1024;
const TEXT_MESSAGE_TYPE: u8 = 1;
const BULK_MESSAGE_TYPE: u8 = 0;

/// `gossip-demo [--log-dir DIR] [cluster-config.json] [iterations]`
#[derive(Debug, PartialEq)]
struct Args {
    log_dir: Option<PathBuf>,
    config_path: Option<PathBuf>,
    iterations: usize,
}

impl Args {
    fn parse() -> Result<Self> {
        Self::parse_from(std::env::args().skip(1))
    }

    fn parse_from<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut log_dir = None;
        let mut positional = Vec::new();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            if arg == "--log-dir" {
                let dir = args.next().context("--log-dir needs a directory")?;
                log_dir = Some(PathBuf::from(dir));
            } else {
                positional.push(arg);
            }
        }

        let mut positional = positional.into_iter();
        let config_path = positional.next().map(PathBuf::from);
        let iterations = match positional.next() {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("Invalid iteration count: {raw}"))?,
            None => DEFAULT_ITERATIONS,
        };
        if let Some(extra) = positional.next() {
            anyhow::bail!("Unexpected argument: {extra}");
        }

        Ok(Self {
            log_dir,
            config_path,
            iterations,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse()?;
    let _log_guard = match &args.log_dir {
        Some(dir) => logging::init_logging_to_dir(dir, logging::DEFAULT_FILTER)?,
        None => logging::init_logging()?,
    };

    // An explicit config file must load.
    let cluster_config = match &args.config_path {
        Some(path) => ClusterConfig::load_from_file(path)
            .with_context(|| format!("Failed to load cluster config {}", path.display()))?,
        None => ClusterConfig::new("ClusterKey"),
    };

    let node1_addr: SocketAddr = "127.0.0.1:30000".parse()?;
    let node2_addr: SocketAddr = "127.0.0.1:30001".parse()?;
    let node1 = GossipNode::new(NodeConfig::new(node1_addr, "tag1"), cluster_config.clone())?;
    let node2 = GossipNode::new(NodeConfig::new(node2_addr, "tag2"), cluster_config)?;

    let result = run(&node1, &node2, args.iterations).await;

    node1.dispose().await;
    node2.dispose().await;
    result
}

async fn run(node1: &GossipNode, node2: &GossipNode, iterations: usize) -> Result<()> {
    node1.cluster().join(ClusterMember::new(
        node1.node_id(),
        node2.node_config().clone(),
        node2.authenticator(),
    ))?;
    node2.cluster().join(ClusterMember::new(
        node2.node_id(),
        node1.node_config().clone(),
        node1.authenticator(),
    ))?;

    node1.on_message_received(print_text_message);
    node2.on_message_received(print_text_message);

    node1.start_listening().await?;
    node2.start_listening().await?;

    let hello = GossipMessage::from(RawMessage::new(TEXT_MESSAGE_TYPE, "Hello World!"));
    node1
        .cluster()
        .broadcast_message(&hello, |m| m.has_tag("tag2"))
        .await?;

    let bulk = GossipMessage::from(RawMessage::new(BULK_MESSAGE_TYPE, vec![0u8; BULK_MESSAGE_SIZE]));
    let started = Instant::now();
    let mut tasks = Vec::with_capacity(iterations);
    for _ in 0..iterations {
        let node = node1.clone();
        let bulk = bulk.clone();
        tasks.push(tokio::spawn(async move {
            node.cluster().broadcast_all(&bulk).await
        }));
    }

    let mut bytes = 0u64;
    for task in tasks {
        bytes += task.await??.bytes;
    }

    let elapsed = started.elapsed();
    let megabytes = bytes as f64 / (1024.0 * 1024.0);
    info!(
        "{iterations} iterations of {} MB transferred in {elapsed:?} ({:.1} MB/s)",
        BULK_MESSAGE_SIZE / 1024 / 1024,
        megabytes / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    Ok(())
}

fn print_text_message(node: &GossipNode, _connection: &Connection, message: &GossipMessage) {
    let Some(raw) = message.as_raw() else {
        return;
    };
    if raw.message_type() != TEXT_MESSAGE_TYPE {
        return;
    }
    info!("Node received: {}", node.node_id().to_hex_lower());
    info!("Message Size: {} bytes", raw.size());
    match raw.as_str() {
        Ok(text) => info!("Message String: {text}"),
        Err(e) => info!("Message String: <{e}>"),
    }
}
