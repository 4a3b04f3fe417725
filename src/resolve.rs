//! Resolution of machine names to overlay endpoint addresses.

use std::net::IpAddr;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use log::debug;

use crate::error::{Error, Result};

#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<IpAddr>;
}

/// Resolves through the system DNS configuration.
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
}

impl DnsResolver {
    pub fn from_system_conf() -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| Error::Resolve(format!("failed to load system resolv.conf: {}", e)))?;
        Ok(Self { resolver })
    }
}

#[async_trait]
impl AddressResolver for DnsResolver {
    async fn resolve(&self, name: &str) -> Result<IpAddr> {
        if let Ok(addr) = name.parse::<IpAddr>() {
            return Ok(addr);
        }
        let lookup = self
            .resolver
            .lookup_ip(name)
            .await
            .map_err(|e| Error::Resolve(format!("lookup of {} failed: {}", name, e)))?;
        let addrs: Vec<IpAddr> = lookup.iter().collect();
        debug!("Resolved {} to {:?}", name, addrs);
        pick_address(&addrs).ok_or_else(|| {
            Error::Resolve(format!("no usable IPv4 address found for {}", name))
        })
    }
}

/// First non-loopback IPv4 address.
fn pick_address(addrs: &[IpAddr]) -> Option<IpAddr> {
    addrs
        .iter()
        .copied()
        .find(|addr| addr.is_ipv4() && !addr.is_loopback() && !addr.is_unspecified())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_first_usable_ipv4() {
        let addrs: Vec<IpAddr> = ["127.0.0.1", "fd00::1", "192.168.1.10", "192.168.1.11"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        assert_eq!(pick_address(&addrs), Some("192.168.1.10".parse().unwrap()));
        assert_eq!(pick_address(&addrs[..2]), None);
    }

    #[tokio::test]
    async fn ip_literal_resolves_to_itself() {
        let Ok(resolver) = DnsResolver::from_system_conf() else {
            return;
        };
        let addr = resolver.resolve("192.168.1.10").await.unwrap();
        assert_eq!(addr, "192.168.1.10".parse::<IpAddr>().unwrap());
    }
}
