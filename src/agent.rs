//! Per-machine agent: installs overlay rules toward every other machine's
//! subnet.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::error::{Error, Result};
use crate::feed::{ChangeFeed, DeltaHandler};
use crate::network::{parse_cidr, ClusterNetworkConfig};
use crate::rules::{BaseConfig, RuleApplier};
use crate::store::{SubnetRegistry, WatchSource};
use crate::types::{Delta, DeltaKind, HostSubnet};

/// How long the agent waits for the master to assign its subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelfSubnetRetry {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for SelfSubnetRetry {
    fn default() -> Self {
        // 30 seconds in total.
        Self {
            attempts: 60,
            interval: Duration::from_millis(500),
        }
    }
}

/// Polls the registry for this host's own record.
///
/// The host IP of the record must be valid; the agent cannot work without a
/// sane assignment of its own.
pub async fn init_self_subnet(
    registry: &dyn SubnetRegistry,
    network: &ClusterNetworkConfig,
    host_name: &str,
    retry: SelfSubnetRetry,
) -> Result<HostSubnet> {
    let mut found = None;
    for attempt in 0..retry.attempts {
        match registry.get(host_name).await {
            Ok(sub) => {
                found = Some(sub);
                break;
            }
            Err(e) => {
                warn!(
                    "Could not find an allocated subnet for node {}: {}. Waiting...",
                    host_name, e
                );
                if attempt + 1 < retry.attempts {
                    sleep(retry.interval).await;
                }
            }
        }
    }
    let sub = found.ok_or_else(|| Error::StartupTimeout {
        name: host_name.to_string(),
        attempts: retry.attempts,
    })?;

    network
        .validate_node_ip(&sub.host_ip)
        .map_err(|e| Error::AddressInvalid(format!("failed to validate own HostSubnet: {}", e)))?;

    info!("Found local HostSubnet {}", sub);
    Ok(sub)
}

pub struct AgentController {
    network: ClusterNetworkConfig,
    local_ip: String,
    rules: Arc<dyn RuleApplier>,
    /// Last record a rule was installed for, keyed by record uid.
    subnets: HashMap<String, HostSubnet>,
}

impl AgentController {
    pub fn new(
        network: ClusterNetworkConfig,
        local_ip: impl Into<String>,
        rules: Arc<dyn RuleApplier>,
    ) -> Self {
        Self {
            network,
            local_ip: local_ip.into(),
            rules,
            subnets: HashMap::new(),
        }
    }
}

#[async_trait]
impl DeltaHandler<HostSubnet> for AgentController {
    async fn handle(&mut self, delta: Delta<HostSubnet>) -> Result<()> {
        let sub = delta.object;
        if sub.host_ip == self.local_ip {
            return Ok(());
        }

        debug!("Watch {} event for HostSubnet {:?}", delta.kind, sub.metadata.name);
        match delta.kind {
            DeltaKind::Synced | DeltaKind::Added | DeltaKind::Updated => {
                if let Some(old) = self.subnets.get(&sub.metadata.uid) {
                    if old.host_ip == sub.host_ip {
                        return Ok(());
                    }
                    // The old rule goes before a rule toward the new address
                    // is considered.
                    self.rules.remove_peer_rule(old).await?;
                    self.subnets.remove(&sub.metadata.uid);
                }

                if let Err(e) = self.network.validate_node_ip(&sub.host_ip) {
                    warn!("Ignoring invalid subnet for node {}: {}", sub.host_ip, e);
                    return Ok(());
                }

                self.rules.install_peer_rule(&sub).await?;
                self.subnets.insert(sub.metadata.uid.clone(), sub);
            }
            DeltaKind::Deleted => {
                // The installed rule may still point at an older address.
                let installed = match self.subnets.get(&sub.metadata.uid) {
                    Some(installed) => installed.clone(),
                    None => sub,
                };
                self.rules.remove_peer_rule(&installed).await?;
                self.subnets.remove(&installed.metadata.uid);
            }
        }
        Ok(())
    }
}

/// Identity and tunables of the local machine.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub host_name: String,
    pub local_ip: String,
    pub mtu: u32,
    pub retry: SelfSubnetRetry,
    pub resync_interval: Duration,
}

/// Waits for this host's subnet, applies the base overlay configuration and
/// starts the subnet watch in the background.
///
/// Returns whether the base configuration changed, together with the handle
/// of the detached watch.
pub async fn start_node<S>(
    network: ClusterNetworkConfig,
    registry: Arc<dyn SubnetRegistry>,
    rules: Arc<dyn RuleApplier>,
    settings: NodeSettings,
    subnets: S,
) -> Result<(bool, JoinHandle<()>)>
where
    S: WatchSource<HostSubnet> + 'static,
{
    let local =
        init_self_subnet(registry.as_ref(), &network, &settings.host_name, settings.retry).await?;
    let local_subnet = parse_cidr(&local.subnet)?;

    let changed = rules
        .install_base_config(BaseConfig {
            local_subnet,
            cluster_network: network.cluster_network,
            service_network: network.service_network,
            mtu: settings.mtu,
        })
        .await?;

    let agent = AgentController::new(network, settings.local_ip, rules);
    let feed =
        ChangeFeed::<HostSubnet, S>::new(subnets).with_resync_interval(settings.resync_interval);
    let handle = tokio::spawn(feed.run(agent));
    Ok((changed, handle))
}
