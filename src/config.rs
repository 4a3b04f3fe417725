use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::agent::SelfSubnetRetry;
use crate::feed::RESYNC_INTERVAL;
use crate::network::ClusterNetworkConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Node,
    /// Master and node in one process.
    All,
}

impl Role {
    pub fn runs_master(self) -> bool {
        matches!(self, Role::Master | Role::All)
    }

    pub fn runs_node(self) -> bool {
        matches!(self, Role::Node | Role::All)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub role: Role,
    pub node_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_ip: Option<String>,
    pub cluster_network: String,
    /// Prefix length of each host subnet.
    pub host_subnet_length: u32,
    pub service_network: String,
    pub mtu: u32,
    pub self_subnet_retries: u32,
    pub self_subnet_interval_ms: u64,
    /// How often each watch replays its full listing.
    pub resync_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::All,
            node_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into()),
            node_ip: None,
            cluster_network: "10.128.0.0/14".into(),
            host_subnet_length: 23,
            service_network: "172.30.0.0/16".into(),
            mtu: 1450,
            self_subnet_retries: 60,
            self_subnet_interval_ms: 500,
            resync_interval_secs: RESYNC_INTERVAL.as_secs(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("subnetd.toml"))
                .merge(Json::file("subnetd.json"))
                .merge(Env::prefixed("SUBNETD_")),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        if config.node_name.trim().is_empty() {
            anyhow::bail!("node_name must not be empty");
        }
        if config.self_subnet_retries == 0 {
            anyhow::bail!("self_subnet_retries must be at least 1");
        }
        if config.resync_interval_secs == 0 {
            anyhow::bail!("resync_interval_secs must be at least 1");
        }
        Ok(config)
    }

    pub fn cluster_network_config(&self) -> crate::error::Result<ClusterNetworkConfig> {
        ClusterNetworkConfig::parse(
            &self.cluster_network,
            self.host_subnet_length,
            &self.service_network,
        )
    }

    pub fn self_subnet_retry(&self) -> SelfSubnetRetry {
        SelfSubnetRetry {
            attempts: self.self_subnet_retries,
            interval: Duration::from_millis(self.self_subnet_interval_ms),
        }
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }
}
