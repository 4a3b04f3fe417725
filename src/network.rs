//! Cluster-wide network configuration.

use std::net::IpAddr;

use ipnet::Ipv4Net;

use crate::error::{Error, Result};

/// Immutable description of the overlay address plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterNetworkConfig {
    /// Parent range carved into per-host subnets.
    pub cluster_network: Ipv4Net,
    /// Prefix length of every host subnet.
    pub host_subnet_length: u8,
    pub service_network: Ipv4Net,
}

impl ClusterNetworkConfig {
    pub fn new(
        cluster_network: Ipv4Net,
        host_subnet_length: u8,
        service_network: Ipv4Net,
    ) -> Result<Self> {
        if host_subnet_length < cluster_network.prefix_len() || host_subnet_length > 32 {
            return Err(Error::ConfigInvalid(format!(
                "host subnet length /{} does not fit inside cluster network {}",
                host_subnet_length, cluster_network
            )));
        }
        let cluster_network = cluster_network.trunc();
        let service_network = service_network.trunc();
        if cluster_network.contains(&service_network) || service_network.contains(&cluster_network) {
            return Err(Error::ConfigInvalid(format!(
                "service network {} overlaps cluster network {}",
                service_network, cluster_network
            )));
        }
        Ok(Self {
            cluster_network,
            host_subnet_length,
            service_network,
        })
    }

    pub fn parse(cluster_network: &str, host_subnet_length: u32, service_network: &str) -> Result<Self> {
        let cluster = parse_cidr(cluster_network)
            .map_err(|e| Error::ConfigInvalid(format!("cluster network: {}", e)))?;
        let service = parse_cidr(service_network)
            .map_err(|e| Error::ConfigInvalid(format!("service network: {}", e)))?;
        let length = u8::try_from(host_subnet_length).map_err(|_| {
            Error::ConfigInvalid(format!("host subnet length {} out of range", host_subnet_length))
        })?;
        Self::new(cluster, length, service)
    }

    /// Checks that `node_ip` is usable as an overlay tunnel endpoint.
    ///
    /// An address inside the cluster or service network would route overlay
    /// traffic back into the overlay.
    pub fn validate_node_ip(&self, node_ip: &str) -> Result<()> {
        if node_ip.is_empty() {
            return Err(Error::AddressInvalid("empty node IP".into()));
        }
        let addr: IpAddr = node_ip
            .parse()
            .map_err(|_| Error::AddressInvalid(format!("failed to parse node IP {}", node_ip)))?;
        if addr.is_loopback() || addr.is_unspecified() {
            return Err(Error::AddressInvalid(format!("invalid node IP {:?}", node_ip)));
        }
        if let IpAddr::V4(v4) = addr {
            if self.cluster_network.contains(&v4) {
                return Err(Error::AddressInvalid(format!(
                    "node IP {} conflicts with cluster network {}",
                    node_ip, self.cluster_network
                )));
            }
            if self.service_network.contains(&v4) {
                return Err(Error::AddressInvalid(format!(
                    "node IP {} conflicts with service network {}",
                    node_ip, self.service_network
                )));
            }
        }
        Ok(())
    }
}

/// Parses a CIDR string and normalizes it to its network address.
pub fn parse_cidr(cidr: &str) -> Result<Ipv4Net> {
    cidr.trim()
        .parse::<Ipv4Net>()
        .map(|net| net.trunc())
        .map_err(|e| Error::SubnetParse {
            subnet: cidr.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClusterNetworkConfig {
        ClusterNetworkConfig::parse("10.128.0.0/14", 23, "172.30.0.0/16").unwrap()
    }

    #[test]
    fn rejects_prefix_shorter_than_cluster() {
        let err = ClusterNetworkConfig::parse("10.0.0.0/8", 7, "172.30.0.0/16").unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));

        let err = ClusterNetworkConfig::parse("10.0.0.0/8", 33, "172.30.0.0/16").unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn rejects_malformed_ranges() {
        assert!(matches!(
            ClusterNetworkConfig::parse("10.0.0.0", 24, "172.30.0.0/16"),
            Err(Error::ConfigInvalid(_))
        ));
        assert!(matches!(
            ClusterNetworkConfig::parse("10.0.0.0/8", 24, "10.30.0.0/16"),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn normalizes_cluster_network() {
        let config = ClusterNetworkConfig::parse("10.1.2.3/8", 24, "172.30.0.0/16").unwrap();
        assert_eq!(config.cluster_network.to_string(), "10.0.0.0/8");
    }

    #[test]
    fn validate_node_ip() {
        let config = config();
        assert!(config.validate_node_ip("192.168.1.10").is_ok());
        assert!(config.validate_node_ip("fd00::10").is_ok());

        for bad in ["", "127.0.0.1", "0.0.0.0", "not-an-ip", "10.128.4.1", "172.30.0.9"] {
            assert!(
                matches!(config.validate_node_ip(bad), Err(Error::AddressInvalid(_))),
                "{} should be rejected",
                bad
            );
        }
    }
}
