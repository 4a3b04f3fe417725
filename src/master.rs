//! Cluster master: assigns one host subnet to every machine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::condition::NodeConditionReconciler;
use crate::error::{Error, Result};
use crate::feed::{ChangeFeed, DeltaHandler};
use crate::network::{parse_cidr, ClusterNetworkConfig};
use crate::pool::{AddressPool, SubnetAllocator};
use crate::resolve::AddressResolver;
use crate::store::{NodeClient, SubnetRegistry, WatchSource};
use crate::types::{Delta, DeltaKind, HostSubnet, Machine};

pub struct MasterController {
    registry: Arc<dyn SubnetRegistry>,
    resolver: Arc<dyn AddressResolver>,
    conditions: NodeConditionReconciler,
    pool: Box<dyn AddressPool>,
    /// Last address reconciled per machine uid. Only suppresses repeated work.
    node_addresses: HashMap<String, String>,
}

impl MasterController {
    /// Rebuilds the allocation pool from the records already in the registry.
    ///
    /// Records with an invalid host IP are reported but still keep their
    /// subnet reserved.
    pub async fn bootstrap(
        network: ClusterNetworkConfig,
        registry: Arc<dyn SubnetRegistry>,
        nodes: Arc<dyn NodeClient>,
        resolver: Arc<dyn AddressResolver>,
    ) -> Result<Self> {
        let subnets = registry.list().await?;
        let mut in_use = Vec::with_capacity(subnets.len());
        for sub in &subnets {
            in_use.push(sub.subnet.clone());
            match network.validate_node_ip(&sub.host_ip) {
                Ok(()) => info!("Found existing HostSubnet {}", sub),
                // Not fatal: the record can still be corrected by an operator.
                Err(e) => warn!("Failed to validate HostSubnet {}: {}", sub, e),
            }
        }

        let pool = SubnetAllocator::new(
            network.cluster_network,
            network.host_subnet_length,
            in_use.as_slice(),
        )?;

        Ok(Self {
            registry,
            resolver,
            conditions: NodeConditionReconciler::new(nodes),
            pool: Box::new(pool),
            node_addresses: HashMap::new(),
        })
    }

    /// Ensures `name` has a record pointing at `node_ip`.
    async fn reconcile_machine(&mut self, name: &str, node_ip: &str) -> Result<()> {
        match self.registry.get(name).await {
            Ok(mut sub) => {
                if sub.host_ip == node_ip {
                    return Ok(());
                }
                // Node IP changed; the subnet stays.
                sub.host_ip = node_ip.to_string();
                let sub = self.registry.update(sub).await?;
                info!("Updated HostSubnet {}", sub);
                return Ok(());
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let subnet = self.pool.allocate()?;
        let sub = HostSubnet::new(name, node_ip, subnet.to_string());
        match self.registry.create(sub).await {
            Ok(sub) => {
                info!("Created HostSubnet {}", sub);
                Ok(())
            }
            Err(e) => {
                self.pool.release(subnet);
                Err(e)
            }
        }
    }

    async fn delete_machine(&mut self, name: &str) -> Result<()> {
        let sub = self.registry.get(name).await?;
        let subnet = parse_cidr(&sub.subnet)?;
        self.pool.release(subnet);
        match self.registry.delete(name).await {
            Ok(()) => info!("Deleted HostSubnet {}", sub),
            Err(e) if e.is_not_found() => debug!("HostSubnet {} already deleted", sub),
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

/// The address a machine is reached at: its first reported address, or its
/// name resolved.
pub async fn machine_ip(machine: &Machine, resolver: &dyn AddressResolver) -> Result<String> {
    match machine.status.addresses.first() {
        Some(addr) if !addr.address.is_empty() => Ok(addr.address.clone()),
        _ => resolver
            .resolve(&machine.metadata.name)
            .await
            .map(|ip| ip.to_string()),
    }
}

#[async_trait]
impl DeltaHandler<Machine> for MasterController {
    async fn handle(&mut self, delta: Delta<Machine>) -> Result<()> {
        let machine = delta.object;
        let name = machine.metadata.name.clone();
        let uid = machine.metadata.uid.clone();

        let node_ip = machine_ip(&machine, self.resolver.as_ref())
            .await
            .map_err(|e| {
                Error::Resolve(format!(
                    "failed to get node IP for {}, skipping {} event: {}",
                    name, delta.kind, e
                ))
            })?;

        match delta.kind {
            DeltaKind::Synced | DeltaKind::Added | DeltaKind::Updated => {
                self.conditions.reconcile(&machine).await;

                if self.node_addresses.get(&uid) == Some(&node_ip) {
                    return Ok(());
                }
                // Node status changes far more often than addresses, so only
                // log past the check above.
                debug!("Watch {} event for Node {:?}", delta.kind, name);

                self.reconcile_machine(&name, &node_ip).await?;
                self.node_addresses.insert(uid, node_ip);
            }
            DeltaKind::Deleted => {
                debug!("Watch {} event for Node {:?}", delta.kind, name);
                self.node_addresses.remove(&uid);
                self.delete_machine(&name).await?;
            }
        }
        Ok(())
    }
}

/// Bootstraps the master and starts its machine watch in the background.
///
/// Only bootstrap errors are returned; the watch runs until the process exits.
/// Machines are replayed every `resync_interval`, which retries failed events.
pub async fn start_master<S>(
    network: ClusterNetworkConfig,
    registry: Arc<dyn SubnetRegistry>,
    nodes: Arc<dyn NodeClient>,
    resolver: Arc<dyn AddressResolver>,
    machines: S,
    resync_interval: Duration,
) -> Result<JoinHandle<()>>
where
    S: WatchSource<Machine> + 'static,
{
    let master = MasterController::bootstrap(network, registry, nodes, resolver).await?;
    let feed = ChangeFeed::<Machine, S>::new(machines).with_resync_interval(resync_interval);
    Ok(tokio::spawn(feed.run(master)))
}
