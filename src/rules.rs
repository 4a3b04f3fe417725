//! Local overlay configuration applied by the node agent.

use std::collections::BTreeMap;
use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use log::{debug, info};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::network::parse_cidr;
use crate::types::HostSubnet;

/// Node-wide overlay setup: the local subnet plus routes for the cluster and
/// service ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseConfig {
    pub local_subnet: Ipv4Net,
    pub cluster_network: Ipv4Net,
    pub service_network: Ipv4Net,
    pub mtu: u32,
}

/// Routes a remote host subnet through a tunnel to the host's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerRule {
    pub subnet: Ipv4Net,
    pub remote_ip: IpAddr,
}

impl PeerRule {
    pub fn for_subnet(record: &HostSubnet) -> Result<Self> {
        let subnet = parse_cidr(&record.subnet)
            .map_err(|e| Error::RuleApplyFailed(format!("{}: {}", record, e)))?;
        let remote_ip = record.host_ip.parse().map_err(|_| {
            Error::RuleApplyFailed(format!("{}: unparsable host IP", record))
        })?;
        Ok(Self { subnet, remote_ip })
    }
}

#[async_trait]
pub trait RuleApplier: Send + Sync {
    /// Applies the base configuration and reports whether anything changed.
    async fn install_base_config(&self, config: BaseConfig) -> Result<bool>;

    async fn install_peer_rule(&self, record: &HostSubnet) -> Result<()>;

    async fn remove_peer_rule(&self, record: &HostSubnet) -> Result<()>;
}

#[derive(Default)]
struct Table {
    base: Option<BaseConfig>,
    peers: BTreeMap<Ipv4Net, IpAddr>,
}

/// Rule table kept in process memory.
#[derive(Default)]
pub struct LocalRules {
    table: Mutex<Table>,
}

impl LocalRules {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn base_config(&self) -> Option<BaseConfig> {
        self.table.lock().await.base
    }

    pub async fn peer_rules(&self) -> Vec<PeerRule> {
        self.table
            .lock()
            .await
            .peers
            .iter()
            .map(|(subnet, remote_ip)| PeerRule {
                subnet: *subnet,
                remote_ip: *remote_ip,
            })
            .collect()
    }
}

#[async_trait]
impl RuleApplier for LocalRules {
    async fn install_base_config(&self, config: BaseConfig) -> Result<bool> {
        let mut table = self.table.lock().await;
        if table.base == Some(config) {
            debug!("Base overlay configuration unchanged");
            return Ok(false);
        }
        info!(
            "Configuring overlay: local subnet {}, cluster network {}, service network {}, mtu {}",
            config.local_subnet, config.cluster_network, config.service_network, config.mtu
        );
        table.base = Some(config);
        Ok(true)
    }

    async fn install_peer_rule(&self, record: &HostSubnet) -> Result<()> {
        let rule = PeerRule::for_subnet(record)?;
        let mut table = self.table.lock().await;
        if let Some(existing) = table.peers.get(&rule.subnet) {
            if *existing != rule.remote_ip {
                return Err(Error::RuleApplyFailed(format!(
                    "subnet {} is already routed to {}",
                    rule.subnet, existing
                )));
            }
        }
        table.peers.insert(rule.subnet, rule.remote_ip);
        info!("Added overlay rule {} via {}", rule.subnet, rule.remote_ip);
        Ok(())
    }

    async fn remove_peer_rule(&self, record: &HostSubnet) -> Result<()> {
        let rule = PeerRule::for_subnet(record)?;
        let mut table = self.table.lock().await;
        match table.peers.get(&rule.subnet) {
            Some(existing) if *existing == rule.remote_ip => {
                table.peers.remove(&rule.subnet);
                info!("Removed overlay rule {} via {}", rule.subnet, rule.remote_ip);
            }
            _ => debug!("No overlay rule {} via {} to remove", rule.subnet, rule.remote_ip),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(subnet: &str) -> BaseConfig {
        BaseConfig {
            local_subnet: subnet.parse().unwrap(),
            cluster_network: "10.128.0.0/14".parse().unwrap(),
            service_network: "172.30.0.0/16".parse().unwrap(),
            mtu: 1450,
        }
    }

    #[tokio::test]
    async fn base_config_reports_changes() {
        let rules = LocalRules::new();
        assert!(rules.install_base_config(base("10.128.0.0/23")).await.unwrap());
        assert!(!rules.install_base_config(base("10.128.0.0/23")).await.unwrap());
        assert!(rules.install_base_config(base("10.128.2.0/23")).await.unwrap());
        assert_eq!(rules.base_config().await, Some(base("10.128.2.0/23")));
    }

    #[tokio::test]
    async fn peer_rules() {
        let rules = LocalRules::new();
        let peer = HostSubnet::new("node-b", "192.168.1.11", "10.128.2.0/23");
        rules.install_peer_rule(&peer).await.unwrap();
        rules.install_peer_rule(&peer).await.unwrap();
        assert_eq!(rules.peer_rules().await.len(), 1);

        let moved = HostSubnet::new("node-b", "192.168.1.12", "10.128.2.0/23");
        assert!(matches!(
            rules.install_peer_rule(&moved).await,
            Err(Error::RuleApplyFailed(_))
        ));

        rules.remove_peer_rule(&moved).await.unwrap();
        assert_eq!(rules.peer_rules().await.len(), 1);
        rules.remove_peer_rule(&peer).await.unwrap();
        assert!(rules.peer_rules().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_record_fails() {
        let rules = LocalRules::new();
        let bad = HostSubnet::new("node-b", "192.168.1.11", "not-a-subnet");
        assert!(matches!(
            rules.install_peer_rule(&bad).await,
            Err(Error::RuleApplyFailed(_))
        ));
    }
}
