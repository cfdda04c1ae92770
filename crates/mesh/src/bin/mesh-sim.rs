//! Mesh Simulator
//!
//! Runs a line of in-process nodes (`node-0 - node-1 - ... - node-N`),
//! floods one broadcast from the first node and prints per-node stats.
//! Adjacent nodes share a channel hub, so each hop is a real relay.

use anyhow::{bail, Context};
use ghostmesh_core::{logging, Config};
use ghostmesh_mesh::{ChannelHub, ChannelTransport, MeshNode, MeshStats, BROADCAST};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// One line of output per node
#[derive(Debug, Serialize)]
struct NodeReport {
    name: String,
    node_id: String,
    stats: MeshStats,
}

struct Args {
    config: Option<PathBuf>,
    nodes: usize,
    hops: Option<u8>,
    message: String,
    json_logs: bool,
}

fn print_usage() {
    println!("Usage: mesh-sim [--config <path>] [--nodes <n>] [--hops <n>] [--message <text>] [--json-logs]");
}

fn value(raw: &[String], i: usize) -> anyhow::Result<&String> {
    raw.get(i + 1)
        .with_context(|| format!("{} needs a value", raw[i]))
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        config: None,
        nodes: 4,
        hops: None,
        message: "hello mesh".to_string(),
        json_logs: false,
    };

    let raw: Vec<String> = std::env::args().skip(1).collect();
    let mut i = 0;
    while i < raw.len() {
        match raw[i].as_str() {
            "--config" | "-c" => {
                args.config = Some(PathBuf::from(value(&raw, i)?));
                i += 1;
            }
            "--nodes" | "-n" => {
                args.nodes = value(&raw, i)?.parse().context("--nodes must be a number")?;
                i += 1;
            }
            "--hops" => {
                args.hops = Some(value(&raw, i)?.parse().context("--hops must be a number")?);
                i += 1;
            }
            "--message" | "-m" => {
                args.message = value(&raw, i)?.clone();
                i += 1;
            }
            "--json-logs" => args.json_logs = true,
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => bail!("unknown argument '{}'", other),
        }
        i += 1;
    }

    if args.nodes < 2 {
        bail!("--nodes must be at least 2");
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    if args.json_logs {
        logging::init_json();
    } else {
        logging::init();
    }

    let mut config = match &args.config {
        Some(path) => Config::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default_config(),
    };
    config.mesh.keep_alive_interval_secs = 0;
    if let Some(hops) = args.hops {
        config.mesh.default_hop_count = hops;
    }

    let hubs: Vec<Arc<ChannelHub>> = (0..args.nodes - 1).map(|_| ChannelHub::new()).collect();
    let mut nodes = Vec::with_capacity(args.nodes);
    for i in 0..args.nodes {
        let name = format!("node-{}", i);
        let mut node_config = config.clone();
        node_config.mesh.node_name = name.clone();

        let mut builder = MeshNode::builder(node_config);
        if i > 0 {
            builder = builder.transport(Arc::new(ChannelTransport::new("LAN", name.clone(), hubs[i - 1].clone())));
        }
        if let Some(hub) = hubs.get(i) {
            builder = builder.transport(Arc::new(ChannelTransport::new("WiFiDirect", name.clone(), hub.clone())));
        }
        let node = builder.build()?;
        node.start().await?;
        nodes.push((name, node));
    }

    let id = nodes[0].1.send_text(BROADCAST, &args.message)?;
    info!(packet_id = %id, nodes = nodes.len(), "Broadcast sent");
    tokio::time::sleep(Duration::from_millis(250)).await;

    for (name, node) in &nodes {
        let report = NodeReport {
            name: name.clone(),
            node_id: node.node_id().to_string(),
            stats: node.stats().await,
        };
        println!("{}", serde_json::to_string(&report)?);
    }

    for (_, node) in &nodes {
        node.stop().await;
    }
    Ok(())
}
