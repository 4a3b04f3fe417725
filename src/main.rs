//! subnetd daemon entry point.

use std::sync::Arc;

use log::{error, info};
use tokio::signal;

mod agent;
mod condition;
mod config;
mod error;
mod feed;
mod master;
mod network;
mod pool;
mod resolve;
mod rules;
mod store;
mod types;

use agent::{start_node, NodeSettings};
use config::Config;
use master::start_master;
use resolve::{AddressResolver, DnsResolver};
use rules::LocalRules;
use store::MemoryStore;
use types::{HostSubnet, Machine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting subnetd with config: {:?}", cfg);
    let network = cfg.cluster_network_config()?;

    // Control-plane store
    let subnets = MemoryStore::<HostSubnet>::new();
    let machines = MemoryStore::<Machine>::new();

    let resolver: Arc<dyn AddressResolver> = Arc::new(DnsResolver::from_system_conf()?);
    let node_ip = match &cfg.node_ip {
        Some(ip) => ip.clone(),
        None => resolver.resolve(&cfg.node_name).await?.to_string(),
    };
    machines
        .create(Machine::new(&cfg.node_name).with_address(&node_ip))
        .await?;

    let rules = Arc::new(LocalRules::new());
    let mut handles = Vec::new();

    // Master: subnet assignment
    if cfg.role.runs_master() {
        let handle = start_master(
            network,
            Arc::new(subnets.clone()),
            Arc::new(machines.clone()),
            Arc::clone(&resolver),
            machines.clone(),
            cfg.resync_interval(),
        )
        .await?;
        info!("Master started for cluster network {}", network.cluster_network);
        handles.push(handle);
    }

    // Node: local overlay rules
    if cfg.role.runs_node() {
        let settings = NodeSettings {
            host_name: cfg.node_name.clone(),
            local_ip: node_ip.clone(),
            mtu: cfg.mtu,
            retry: cfg.self_subnet_retry(),
            resync_interval: cfg.resync_interval(),
        };
        let (changed, handle) = start_node(
            network,
            Arc::new(subnets.clone()),
            rules.clone(),
            settings,
            subnets.clone(),
        )
        .await?;
        info!(
            "Node {} ({}) started, network configuration changed: {}",
            cfg.node_name, node_ip, changed
        );
        handles.push(handle);
    }

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    for handle in handles {
        handle.abort();
    }
    if cfg.role.runs_node() {
        info!("{} overlay rules installed at shutdown", rules.peer_rules().await.len());
    }

    info!("Shutdown complete.");
    Ok(())
}
