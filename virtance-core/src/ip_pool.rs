//! Region-scoped address pools and candidate generation
//!
//! A pool is a CIDR of one IP version and one [`PoolType`]. Allocation scans a
//! randomized candidate list and takes the first address whose uniqueness key
//! is not yet present in storage (see [`crate::ip_allocator`]).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    error::{VirtanceError, VirtanceResult},
    types::{AllocationId, ComputeNodeId, PoolId, VirtanceId},
};

/// Distance between sampled IPv6 candidates
pub const IPV6_STRIDE: u128 = 16;

/// Upper bound on IPv6 candidates examined per pool
pub const IPV6_MAX_CANDIDATES: usize = 1 << 16;

/// Addresses skipped at each end of an IPv4 range (network and gateway,
/// broadcast and reserved)
const IPV4_EDGE_RESERVED: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolType {
    /// Node-internal network, unique per compute node
    Compute,
    Private,
    Public,
}

impl PoolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolType::Compute => "compute",
            PoolType::Private => "private",
            PoolType::Public => "public",
        }
    }
}

impl std::fmt::Display for PoolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpVersion {
    V4,
    V6,
}

impl std::fmt::Display for IpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpVersion::V4 => f.write_str("ipv4"),
            IpVersion::V6 => f.write_str("ipv6"),
        }
    }
}

/// An address pool (network) in a region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressPool {
    pub id: PoolId,
    pub name: String,
    pub region: String,
    pub pool_type: PoolType,
    pub subnet: IpNet,
    pub gateway: IpAddr,
    pub dns: Vec<IpAddr>,
    pub active: bool,
}

impl AddressPool {
    pub fn version(&self) -> IpVersion {
        match self.subnet {
            IpNet::V4(_) => IpVersion::V4,
            IpNet::V6(_) => IpVersion::V6,
        }
    }

    pub fn netmask(&self) -> IpAddr {
        self.subnet.netmask()
    }

    pub fn validate(&self) -> VirtanceResult<()> {
        if !self.subnet.contains(&self.gateway) {
            return Err(VirtanceError::InvalidConfiguration {
                message: format!(
                    "Gateway {} is not within subnet {} of {}",
                    self.gateway, self.subnet, self.id
                ),
            });
        }
        if self.region.is_empty() {
            return Err(VirtanceError::InvalidConfiguration {
                message: format!("Pool {} has no region", self.id),
            });
        }
        Ok(())
    }

    /// Uniqueness scope of an address in this pool
    ///
    /// Compute pools are shared by every node in the region, so the same
    /// address may be handed out once per node.
    pub fn scope_for(&self, compute: Option<ComputeNodeId>) -> AllocationScope {
        match (self.pool_type, compute) {
            (PoolType::Compute, Some(node)) => AllocationScope::Node(node),
            _ => AllocationScope::Pool,
        }
    }

    /// Candidate addresses in the order they should be tried
    pub fn candidates<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<IpAddr> {
        match self.subnet {
            IpNet::V4(net) => ipv4_candidates(&net, rng)
                .into_iter()
                .map(IpAddr::V4)
                .collect(),
            IpNet::V6(net) => ipv6_candidates(&net, rng)
                .into_iter()
                .map(IpAddr::V6)
                .collect(),
        }
    }
}

/// Usable IPv4 hosts of a subnet in random order
///
/// Every address of the CIDR is enumerated and the first two and last two are
/// dropped. Subnets with four or fewer addresses have no usable range.
pub fn ipv4_candidates<R: Rng + ?Sized>(net: &Ipv4Net, rng: &mut R) -> Vec<Ipv4Addr> {
    let first = u32::from(net.network());
    let last = u32::from(net.broadcast());
    let total = u64::from(last - first) + 1;
    if total <= u64::from(IPV4_EDGE_RESERVED * 2) {
        return Vec::new();
    }

    let mut addrs: Vec<Ipv4Addr> = (first + IPV4_EDGE_RESERVED..=last - IPV4_EDGE_RESERVED)
        .map(Ipv4Addr::from)
        .collect();
    addrs.shuffle(rng);
    addrs
}

/// Sparse IPv6 candidates in random order
///
/// Candidates start one stride past the network address and step by
/// [`IPV6_STRIDE`] up to the end of the subnet. At most
/// [`IPV6_MAX_CANDIDATES`] of them are drawn, without repetition.
pub fn ipv6_candidates<R: Rng + ?Sized>(net: &Ipv6Net, rng: &mut R) -> Vec<Ipv6Addr> {
    let start = u128::from(net.network()).saturating_add(IPV6_STRIDE);
    let end = u128::from(net.broadcast()).saturating_add(1);
    if start >= end {
        return Vec::new();
    }

    let slots = (end - start - 1) / IPV6_STRIDE + 1;
    let length = usize::try_from(slots).unwrap_or(usize::MAX);
    let amount = length.min(IPV6_MAX_CANDIDATES);

    rand::seq::index::sample(rng, length, amount)
        .into_iter()
        .map(|slot| Ipv6Addr::from(start + slot as u128 * IPV6_STRIDE))
        .collect()
}

/// Scope within which an allocated address must be unique
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationScope {
    Pool,
    Node(ComputeNodeId),
}

impl AllocationScope {
    /// Key of the storage-level uniqueness index
    pub fn unique_key(&self, pool: PoolId, address: &IpAddr) -> String {
        match self {
            AllocationScope::Pool => format!("{}/*/{}", pool.0, address),
            AllocationScope::Node(node) => format!("{}/{}/{}", pool.0, node.0, address),
        }
    }
}

/// An allocated address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressAllocation {
    pub id: AllocationId,
    pub pool_id: PoolId,
    pub pool_type: PoolType,
    pub address: IpAddr,
    pub scope: AllocationScope,
    /// Unset for floating addresses that are not bound
    pub virtance_id: Option<VirtanceId>,
    pub is_floating: bool,
    pub created_at: DateTime<Utc>,
}

impl AddressAllocation {
    pub fn version(&self) -> IpVersion {
        match self.address {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    pub fn unique_key(&self) -> String {
        self.scope.unique_key(self.pool_id, &self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn pool(cidr: &str, gateway: &str, pool_type: PoolType) -> AddressPool {
        AddressPool {
            id: PoolId(1),
            name: "test".to_string(),
            region: "fra1".to_string(),
            pool_type,
            subnet: cidr.parse().unwrap(),
            gateway: gateway.parse().unwrap(),
            dns: vec![],
            active: true,
        }
    }

    #[test]
    fn test_ipv4_edges_are_excluded() {
        let net: Ipv4Net = "192.168.10.0/29".parse().unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let mut got = ipv4_candidates(&net, &mut rng);
        got.sort();
        let expected: Vec<Ipv4Addr> = (2..=5).map(|i| Ipv4Addr::new(192, 168, 10, i)).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_tiny_ipv4_subnet_has_no_candidates() {
        let mut rng = StdRng::seed_from_u64(7);
        for cidr in ["10.0.0.0/30", "10.0.0.0/31", "10.0.0.1/32"] {
            let net: Ipv4Net = cidr.parse().unwrap();
            assert!(ipv4_candidates(&net, &mut rng).is_empty(), "{}", cidr);
        }
    }

    #[test]
    fn test_ipv6_candidates_are_bounded_and_strided() {
        let net: Ipv6Net = "2001:db8::/64".parse().unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let got = ipv6_candidates(&net, &mut rng);
        assert_eq!(got.len(), IPV6_MAX_CANDIDATES);

        let base = u128::from(net.network());
        let unique: HashSet<_> = got.iter().collect();
        assert_eq!(unique.len(), got.len());
        for addr in &got {
            let offset = u128::from(*addr) - base;
            assert!(offset >= IPV6_STRIDE);
            assert_eq!(offset % IPV6_STRIDE, 0);
        }
    }

    #[test]
    fn test_small_ipv6_subnet() {
        // /120 has 256 addresses: slots at 16, 32, ..., 240
        let net: Ipv6Net = "2001:db8::/120".parse().unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let got = ipv6_candidates(&net, &mut rng);
        assert_eq!(got.len(), 15);
    }

    #[test]
    fn test_compute_scope_includes_node() {
        let compute = pool("10.255.0.0/16", "10.255.0.1", PoolType::Compute);
        let public = pool("203.0.113.0/24", "203.0.113.1", PoolType::Public);
        let addr: IpAddr = "10.255.0.9".parse().unwrap();

        let node_scope = compute.scope_for(Some(ComputeNodeId(4)));
        assert_eq!(node_scope.unique_key(compute.id, &addr), "1/4/10.255.0.9");
        assert_eq!(
            public.scope_for(Some(ComputeNodeId(4))),
            AllocationScope::Pool
        );
    }

    #[test]
    fn test_gateway_outside_subnet_is_rejected() {
        let bad = pool("203.0.113.0/24", "198.51.100.1", PoolType::Public);
        assert!(bad.validate().is_err());
    }
}
