//! Host subnet allocation.
//!
//! The master owns a single [`AddressPool`] and only touches it from its
//! reconciliation task, so implementations take `&mut self` and do no locking.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use log::warn;

use crate::error::{Error, Result};
use crate::network::parse_cidr;

pub trait AddressPool: Send {
    /// Hands out a subnet that no other caller currently holds.
    fn allocate(&mut self) -> Result<Ipv4Net>;

    /// Returns a subnet to the pool. Releasing a free or foreign subnet is a
    /// logged no-op.
    fn release(&mut self, subnet: Ipv4Net);
}

/// First-fit allocator of fixed-size blocks inside a parent range.
///
/// Blocks are tracked by their index inside the parent range, so the lowest
/// free block is always issued next.
#[derive(Debug, Clone)]
pub struct SubnetAllocator {
    network: Ipv4Net,
    host_subnet_length: u8,
    allocated: BTreeSet<u64>,
}

impl SubnetAllocator {
    /// Builds an allocator for `network` and marks `in_use` as already issued.
    ///
    /// Entries that do not parse or fall outside `network` are logged and
    /// skipped.
    pub fn new<S: AsRef<str>>(network: Ipv4Net, host_subnet_length: u8, in_use: &[S]) -> Result<Self> {
        if host_subnet_length < network.prefix_len() || host_subnet_length > 32 {
            return Err(Error::ConfigInvalid(format!(
                "subnet length /{} does not fit in {}",
                host_subnet_length, network
            )));
        }
        let mut allocator = Self {
            network: network.trunc(),
            host_subnet_length,
            allocated: BTreeSet::new(),
        };
        for entry in in_use {
            let entry = entry.as_ref();
            let subnet = match parse_cidr(entry) {
                Ok(subnet) => subnet,
                Err(e) => {
                    warn!("Ignoring in-use subnet that failed to parse: {}", e);
                    continue;
                }
            };
            match allocator.block_range(&subnet) {
                Some((first, last)) => allocator.allocated.extend(first..=last),
                None => warn!(
                    "Ignoring in-use subnet {} outside of cluster network {}",
                    subnet, allocator.network
                ),
            }
        }
        Ok(allocator)
    }

    fn block_count(&self) -> u64 {
        1u64 << (self.host_subnet_length - self.network.prefix_len())
    }

    fn block_shift(&self) -> u32 {
        32 - u32::from(self.host_subnet_length)
    }

    /// Indices of the blocks covered by `subnet`, if it lies inside the range.
    fn block_range(&self, subnet: &Ipv4Net) -> Option<(u64, u64)> {
        if !self.network.contains(subnet) {
            return None;
        }
        let base = u64::from(u32::from(self.network.network()));
        let first = (u64::from(u32::from(subnet.network())) - base) >> self.block_shift();
        let last = (u64::from(u32::from(subnet.broadcast())) - base) >> self.block_shift();
        Some((first, last))
    }

    fn block(&self, index: u64) -> Result<Ipv4Net> {
        let base = u64::from(u32::from(self.network.network()));
        let addr = Ipv4Addr::from((base + (index << self.block_shift())) as u32);
        Ipv4Net::new(addr, self.host_subnet_length)
            .map_err(|e| Error::ConfigInvalid(e.to_string()))
    }

    #[cfg(test)]
    pub fn is_allocated(&self, subnet: &Ipv4Net) -> bool {
        match self.block_range(subnet) {
            Some((first, last)) => (first..=last).all(|i| self.allocated.contains(&i)),
            None => false,
        }
    }

    #[cfg(test)]
    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }
}

impl AddressPool for SubnetAllocator {
    fn allocate(&mut self) -> Result<Ipv4Net> {
        let mut candidate = 0u64;
        for &index in &self.allocated {
            if index != candidate {
                break;
            }
            candidate += 1;
        }
        if candidate >= self.block_count() {
            return Err(Error::PoolExhausted(self.network.to_string()));
        }
        let subnet = self.block(candidate)?;
        self.allocated.insert(candidate);
        Ok(subnet)
    }

    fn release(&mut self, subnet: Ipv4Net) {
        let subnet = subnet.trunc();
        let Some((first, last)) = self.block_range(&subnet) else {
            warn!(
                "Not releasing subnet {} outside of cluster network {}",
                subnet, self.network
            );
            return;
        };
        let mut released = false;
        for index in first..=last {
            released |= self.allocated.remove(&index);
        }
        if !released {
            warn!("Released subnet {} was not allocated", subnet);
        }
    }
}
