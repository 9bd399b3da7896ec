//! Address allocation from region-scoped pools
//!
//! Allocation is randomized first-fit: candidates from
//! [`AddressPool::candidates`] are tried in order and the first one whose
//! uniqueness key can be claimed wins. The claim and the allocation record are
//! written in one transaction, and the `address_unique` index is the
//! correctness backstop: a key already held is skipped, never overwritten.

use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::{
    abstractions::time::Clock,
    error::{VirtanceError, VirtanceResult},
    ip_pool::{AddressAllocation, AddressPool, AllocationScope, IpVersion, PoolType},
    storage::{DatabaseTransaction, Store, ADDRESS_UNIQUE_TABLE},
    types::{AllocationId, PoolId, Virtance, VirtanceId},
};

const ALLOCATION_SEQUENCE: &str = "address_allocation";

/// Allocation counts for one pool
#[derive(Debug, Clone, PartialEq)]
pub struct PoolUsage {
    pub pool: AddressPool,
    pub allocated: usize,
    pub floating: usize,
}

/// Allocates and releases addresses
#[derive(Clone)]
pub struct AddressAllocator {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl AddressAllocator {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Active pools of a region with the given type and version, in id order
    pub fn active_pools(
        &self,
        region: &str,
        pool_type: PoolType,
        version: IpVersion,
    ) -> VirtanceResult<Vec<AddressPool>> {
        let pools: Vec<AddressPool> = self.store.list()?;
        Ok(pools
            .into_iter()
            .filter(|p| {
                p.active && p.region == region && p.pool_type == pool_type && p.version() == version
            })
            .collect())
    }

    /// Allocate an address for a virtance
    ///
    /// Returns `None` when no active pool exists or every pool is exhausted.
    /// Nothing is written in that case.
    pub fn allocate(
        &self,
        virtance: &Virtance,
        pool_type: PoolType,
        version: IpVersion,
    ) -> VirtanceResult<Option<AddressAllocation>> {
        self.allocate_with_rng(virtance, pool_type, version, &mut rand::thread_rng())
    }

    pub fn allocate_with_rng<R: Rng + ?Sized>(
        &self,
        virtance: &Virtance,
        pool_type: PoolType,
        version: IpVersion,
        rng: &mut R,
    ) -> VirtanceResult<Option<AddressAllocation>> {
        if pool_type == PoolType::Compute && virtance.compute_id.is_none() {
            return Err(VirtanceError::InvalidOperation {
                operation: "allocate compute address".to_string(),
                reason: format!("{} has no compute node", virtance.id),
            });
        }

        let pools = self.active_pools(&virtance.region, pool_type, version)?;
        if pools.is_empty() {
            warn!(
                virtance_id = virtance.id.0,
                region = %virtance.region,
                "No active {} {} pool", pool_type, version
            );
            return Ok(None);
        }

        for pool in &pools {
            let scope = pool.scope_for(virtance.compute_id);
            if let Some(allocation) =
                self.claim_first_free(pool, scope, Some(virtance.id), false, rng)?
            {
                info!(
                    virtance_id = virtance.id.0,
                    pool = pool.id.0,
                    "Allocated {} address {}", pool_type, allocation.address
                );
                return Ok(Some(allocation));
            }
            debug!(pool = pool.id.0, "Pool exhausted, trying next");
        }

        warn!(
            virtance_id = virtance.id.0,
            region = %virtance.region,
            "All {} {} pools exhausted", pool_type, version
        );
        Ok(None)
    }

    /// Allocate an unbound floating address from the region's public IPv4 pools
    pub fn allocate_floating(&self, region: &str) -> VirtanceResult<Option<AddressAllocation>> {
        let mut rng = rand::thread_rng();
        for pool in self.active_pools(region, PoolType::Public, IpVersion::V4)? {
            if let Some(allocation) =
                self.claim_first_free(&pool, AllocationScope::Pool, None, true, &mut rng)?
            {
                info!(pool = pool.id.0, "Allocated floating address {}", allocation.address);
                return Ok(Some(allocation));
            }
        }
        Ok(None)
    }

    fn claim_first_free<R: Rng + ?Sized>(
        &self,
        pool: &AddressPool,
        scope: AllocationScope,
        virtance_id: Option<VirtanceId>,
        is_floating: bool,
        rng: &mut R,
    ) -> VirtanceResult<Option<AddressAllocation>> {
        let candidates = pool.candidates(rng);
        let now = self.clock.now();

        self.store.write("allocate address", |txn| {
            for address in candidates {
                let key = scope.unique_key(pool.id, &address);
                if txn.get_index(ADDRESS_UNIQUE_TABLE, &key)?.is_some() {
                    continue;
                }

                let id = AllocationId(txn.next_id(ALLOCATION_SEQUENCE)?);
                match txn.insert_unique(ADDRESS_UNIQUE_TABLE, &key, id.0) {
                    Ok(()) => {}
                    Err(e) if e.is_conflict() => {
                        debug!("Address {} taken concurrently, retrying", address);
                        continue;
                    }
                    Err(e) => return Err(e),
                }

                let allocation = AddressAllocation {
                    id,
                    pool_id: pool.id,
                    pool_type: pool.pool_type,
                    address,
                    scope,
                    virtance_id,
                    is_floating,
                    created_at: now,
                };
                txn.put_record(&allocation)?;
                return Ok(Some(allocation));
            }
            Ok(None)
        })
    }

    /// Every allocation held by a virtance, floating ones included
    pub fn allocations_for(&self, virtance_id: VirtanceId) -> VirtanceResult<Vec<AddressAllocation>> {
        self.store.read("list virtance addresses", |txn| {
            allocations_of(txn, virtance_id)
        })
    }

    /// The virtance's own (non-floating) address of a pool type and version
    pub fn find(
        &self,
        virtance_id: VirtanceId,
        pool_type: PoolType,
        version: IpVersion,
    ) -> VirtanceResult<Option<AddressAllocation>> {
        Ok(self
            .allocations_for(virtance_id)?
            .into_iter()
            .find(|a| !a.is_floating && a.pool_type == pool_type && a.version() == version))
    }

    /// Existing address or a fresh allocation
    pub fn find_or_allocate(
        &self,
        virtance: &Virtance,
        pool_type: PoolType,
        version: IpVersion,
    ) -> VirtanceResult<Option<AddressAllocation>> {
        match self.find(virtance.id, pool_type, version)? {
            Some(existing) => Ok(Some(existing)),
            None => self.allocate(virtance, pool_type, version),
        }
    }

    /// Release one allocation and its uniqueness key
    pub fn release(&self, allocation_id: AllocationId) -> VirtanceResult<bool> {
        self.store.write("release address", |txn| {
            match txn.get_record::<AddressAllocation>(allocation_id.0)? {
                Some(allocation) => {
                    remove_allocation(txn, &allocation)?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    /// Allocation counts per pool
    pub fn pool_usage(&self) -> VirtanceResult<Vec<PoolUsage>> {
        self.store.read("pool usage", |txn| {
            let pools: Vec<AddressPool> = txn.scan_records()?;
            let allocations: Vec<AddressAllocation> = txn.scan_records()?;
            Ok(pools
                .into_iter()
                .map(|pool| {
                    let in_pool: Vec<_> = allocations.iter().filter(|a| a.pool_id == pool.id).collect();
                    PoolUsage {
                        allocated: in_pool.len(),
                        floating: in_pool.iter().filter(|a| a.is_floating).count(),
                        pool,
                    }
                })
                .collect())
        })
    }

    pub fn pool(&self, id: PoolId) -> VirtanceResult<AddressPool> {
        self.store.require(id.0)
    }
}

pub(crate) fn allocations_of(
    txn: &DatabaseTransaction,
    virtance_id: VirtanceId,
) -> VirtanceResult<Vec<AddressAllocation>> {
    Ok(txn
        .scan_records::<AddressAllocation>()?
        .into_iter()
        .filter(|a| a.virtance_id == Some(virtance_id))
        .collect())
}

pub(crate) fn remove_allocation(
    txn: &DatabaseTransaction,
    allocation: &AddressAllocation,
) -> VirtanceResult<()> {
    txn.remove_index(ADDRESS_UNIQUE_TABLE, &allocation.unique_key())?;
    txn.remove_record::<AddressAllocation>(allocation.id.0)?;
    Ok(())
}

/// Drop every non-floating allocation of a virtance inside `txn`
///
/// Floating addresses stay allocated to their owner; they are only unbound.
pub(crate) fn release_virtance_addresses(
    txn: &DatabaseTransaction,
    virtance_id: VirtanceId,
) -> VirtanceResult<usize> {
    let mut released = 0;
    for mut allocation in allocations_of(txn, virtance_id)? {
        if allocation.is_floating {
            allocation.virtance_id = None;
            txn.put_record(&allocation)?;
        } else {
            remove_allocation(txn, &allocation)?;
            released += 1;
        }
    }
    Ok(released)
}
