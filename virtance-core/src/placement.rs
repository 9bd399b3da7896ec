//! Compute-node selection
//!
//! The orchestrator only consumes a node id from a [`ComputeSelector`]. The
//! shipped [`CapacitySelector`] picks the most available active node in the
//! virtance's region that still fits the demand under the configured
//! overcommit and ceiling limits.

use std::collections::HashMap;

use tracing::debug;

use crate::{
    config::PlacementConfig,
    error::VirtanceResult,
    storage::Store,
    types::{ComputeNode, ComputeNodeId, ResourceDemand, Size, Virtance},
};

/// Chooses the compute node for a new virtance
pub trait ComputeSelector: Send + Sync {
    /// Returns `None` when no node in the region can take the demand
    fn select(&self, region: &str, demand: &ResourceDemand) -> VirtanceResult<Option<ComputeNodeId>>;
}

/// Resources committed on one node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeResourceUsage {
    pub used_vcpus: u32,
    pub used_memory: u64,
    pub used_disk: u64,
}

impl NodeResourceUsage {
    /// Whether `demand` fits on `node` on top of this usage
    pub fn can_accommodate(
        &self,
        node: &ComputeNode,
        demand: &ResourceDemand,
        limits: &PlacementConfig,
    ) -> bool {
        if !node.active {
            return false;
        }

        let vcpu_limit = (f64::from(node.vcpu) * limits.cpu_overcommit_ratio).floor() as u64;
        if u64::from(self.used_vcpus) + u64::from(demand.vcpu) > vcpu_limit {
            return false;
        }

        let memory_limit = (node.memory as f64 * limits.memory_ceiling).floor() as u64;
        if self.used_memory + demand.memory > memory_limit {
            return false;
        }

        let disk_limit = (node.disk as f64 * limits.disk_ceiling).floor() as u64;
        self.used_disk + demand.disk <= disk_limit
    }

    /// Share of the node's memory still free, 0.0 to 1.0
    pub fn availability_score(&self, node: &ComputeNode) -> f64 {
        if node.memory == 0 {
            return 0.0;
        }
        node.memory.saturating_sub(self.used_memory) as f64 / node.memory as f64
    }
}

/// Default selector based on committed capacity
pub struct CapacitySelector {
    store: Store,
    limits: PlacementConfig,
}

impl CapacitySelector {
    pub fn new(store: Store, limits: PlacementConfig) -> Self {
        Self { store, limits }
    }

    fn usage_by_node(&self) -> VirtanceResult<HashMap<ComputeNodeId, NodeResourceUsage>> {
        self.store.read("compute usage", |txn| {
            let sizes: HashMap<_, _> = txn
                .scan_records::<Size>()?
                .into_iter()
                .map(|s| (s.id, s))
                .collect();

            let mut usage: HashMap<ComputeNodeId, NodeResourceUsage> = HashMap::new();
            for virtance in txn.scan_records::<Virtance>()? {
                let (Some(node), Some(size)) = (virtance.compute_id, sizes.get(&virtance.size_id))
                else {
                    continue;
                };
                let entry = usage.entry(node).or_default();
                entry.used_vcpus += size.vcpu;
                entry.used_memory += size.memory;
                entry.used_disk += size.disk;
            }
            Ok(usage)
        })
    }
}

impl ComputeSelector for CapacitySelector {
    fn select(&self, region: &str, demand: &ResourceDemand) -> VirtanceResult<Option<ComputeNodeId>> {
        let nodes: Vec<ComputeNode> = self.store.list()?;
        let usage = self.usage_by_node()?;
        let empty = NodeResourceUsage::default();

        let best = nodes
            .iter()
            .filter(|n| n.region == region)
            .map(|n| (n, usage.get(&n.id).unwrap_or(&empty)))
            .filter(|(n, u)| u.can_accommodate(n, demand, &self.limits))
            .max_by(|(a, ua), (b, ub)| {
                ua.availability_score(a)
                    .total_cmp(&ub.availability_score(b))
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|(n, _)| n.id);

        debug!(region, ?demand, selected = ?best, "Compute selection");
        Ok(best)
    }
}
