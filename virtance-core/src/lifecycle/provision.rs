//! CREATE and REBUILD
//!
//! A CREATE that finds no node or address leaves nothing behind: the node is
//! only recorded once every address is held, and addresses taken by the
//! failed run are dropped again.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use super::{Abort, Step, VirtanceOrchestrator};
use crate::{
    common::OptionContext,
    compute_gateway::{CreateRequest, DiskImage, InterfaceConfig, NetworkDescriptor, RebuildRequest},
    error::VirtanceResult,
    event_lease::LeaseToken,
    ip_allocator::{allocations_of, remove_allocation},
    ip_pool::{AddressAllocation, IpVersion, PoolType},
    metering::{open_in, MeteredEntity},
    notifier::CreatedNotice,
    types::{AllocationId, Image, KeyPair, PowerState, ResourceDemand, Size, Virtance},
};

/// The three IPv4 addresses every virtance has, plus an optional IPv6 one
struct Addresses {
    compute: AddressAllocation,
    public: AddressAllocation,
    private: AddressAllocation,
    public_v6: Option<AddressAllocation>,
}

impl VirtanceOrchestrator {
    pub(super) async fn create(
        &self,
        token: &LeaseToken,
        mut virtance: Virtance,
        password: Option<&str>,
    ) -> Step<Option<String>> {
        let size: Size = self.store.require(virtance.size_id.0)?;
        let template: Image = self.store.require(virtance.template_id.0)?;

        let held: HashSet<AllocationId> = self
            .allocator
            .allocations_for(virtance.id)?
            .into_iter()
            .map(|a| a.id)
            .collect();
        let placed_now = virtance.compute_id.is_none();
        if placed_now {
            let demand = ResourceDemand::from(&size);
            let Some(node_id) = self.selector.select(&virtance.region, &demand)? else {
                return Err(Abort::NotAvailable("compute node".to_string()));
            };
            virtance.compute_id = Some(node_id);
        }

        let addresses = match self.resolve_addresses(&virtance) {
            Ok(addresses) => addresses,
            Err(Abort::NotAvailable(resource)) => {
                self.discard_allocations(&virtance, &held)?;
                return Err(Abort::NotAvailable(resource));
            }
            Err(e) => return Err(e),
        };

        if let (true, Some(node_id)) = (placed_now, virtance.compute_id) {
            self.store.write("assign compute node", |txn| {
                let mut stored: Virtance = txn.require_record(virtance.id.0)?;
                stored.compute_id = Some(node_id);
                txn.put_record(&stored)
            })?;
            info!(virtance_id = virtance.id.0, node = node_id.0, "Compute node assigned");
        }

        let request = CreateRequest {
            id: virtance.id,
            uuid: virtance.uuid,
            name: virtance.name.clone(),
            vcpu: size.vcpu,
            memory: size.memory,
            images: vec![self.disk_image(&virtance, &size, &template)],
            network: self.network_descriptor(&addresses)?,
            ssh_keys: self.authorized_keys(&virtance)?,
            password_hash: self.hash_password(password)?,
        };

        let gateway = self.gateway(&virtance)?;
        gateway.create_virtance(&request).await?;

        let rates = self.ledger.virtance_rates(&virtance, &size);
        let now = self.clock.now();
        self.finish(token, |txn, stored| {
            stored.power = PowerState::Active;
            open_in(txn, MeteredEntity::Virtance(stored.id), &rates, now)?;
            if template.kind.is_artifact() {
                let mut image: Image = txn.require_record(template.id.0)?;
                image.event = None;
                txn.put_record(&image)?;
            }
            Ok(())
        })?;

        if self.config.notify_on_create {
            let notice = CreatedNotice {
                virtance_id: virtance.id,
                user_id: virtance.user_id,
                hostname: virtance.name.clone(),
                address: addresses.public.address,
                region: virtance.region.clone(),
                distribution: template.description.clone(),
            };
            if let Err(e) = self.notifier.virtance_created(&notice).await {
                warn!(virtance_id = virtance.id.0, "Create notice not sent: {}", e);
            }
        }

        Ok(virtance.compute_id.map(|node| format!("placed on {}", node)))
    }

    /// Reinstall from the template, keeping the existing addresses
    pub(super) async fn rebuild(&self, token: &LeaseToken, virtance: &Virtance) -> Step<Option<String>> {
        let size: Size = self.store.require(virtance.size_id.0)?;
        let template: Image = self.store.require(virtance.template_id.0)?;
        let addresses = self.existing_addresses(virtance)?;

        let request = RebuildRequest {
            id: virtance.id,
            name: virtance.name.clone(),
            images: vec![self.disk_image(virtance, &size, &template)],
            network: self.network_descriptor(&addresses)?,
            ssh_keys: self.authorized_keys(virtance)?,
            password_hash: self.hash_password(None)?,
        };

        self.gateway(virtance)?.rebuild_virtance(&request).await?;
        self.finish_with_power(token, PowerState::Active)?;
        Ok(None)
    }

    fn resolve_addresses(&self, virtance: &Virtance) -> Step<Addresses> {
        let take = |pool_type: PoolType| -> Step<AddressAllocation> {
            self.allocator
                .find_or_allocate(virtance, pool_type, IpVersion::V4)?
                .ok_or_else(|| Abort::NotAvailable(format!("{} ipv4 address", pool_type)))
        };
        let compute = take(PoolType::Compute)?;
        let public = take(PoolType::Public)?;
        let private = take(PoolType::Private)?;

        let v6_pools = self
            .allocator
            .active_pools(&virtance.region, PoolType::Public, IpVersion::V6)?;
        let public_v6 = if v6_pools.is_empty() {
            None
        } else {
            self.allocator
                .find_or_allocate(virtance, PoolType::Public, IpVersion::V6)?
        };

        debug!(
            virtance_id = virtance.id.0,
            public = %public.address,
            private = %private.address,
            "Addresses resolved"
        );
        Ok(Addresses {
            compute,
            public,
            private,
            public_v6,
        })
    }

    /// Drop allocations taken by this run, keeping those held before it
    fn discard_allocations(&self, virtance: &Virtance, held: &HashSet<AllocationId>) -> VirtanceResult<()> {
        let discarded = self.store.write("discard create addresses", |txn| {
            let mut discarded = 0;
            for allocation in allocations_of(txn, virtance.id)? {
                if !allocation.is_floating && !held.contains(&allocation.id) {
                    remove_allocation(txn, &allocation)?;
                    discarded += 1;
                }
            }
            Ok(discarded)
        })?;
        debug!(virtance_id = virtance.id.0, discarded, "Create addresses discarded");
        Ok(())
    }

    fn existing_addresses(&self, virtance: &Virtance) -> VirtanceResult<Addresses> {
        let require = |pool_type: PoolType| -> VirtanceResult<AddressAllocation> {
            self.allocator
                .find(virtance.id, pool_type, IpVersion::V4)?
                .not_found(format!("{} address of {}", pool_type, virtance.id))
        };
        Ok(Addresses {
            compute: require(PoolType::Compute)?,
            public: require(PoolType::Public)?,
            private: require(PoolType::Private)?,
            public_v6: self.allocator.find(virtance.id, PoolType::Public, IpVersion::V6)?,
        })
    }

    fn interface(&self, allocation: &AddressAllocation, with_dns: bool) -> VirtanceResult<InterfaceConfig> {
        let pool = self.allocator.pool(allocation.pool_id)?;
        Ok(InterfaceConfig {
            address: allocation.address,
            gateway: pool.gateway,
            netmask: pool.netmask(),
            dns: if with_dns { pool.dns.clone() } else { Vec::new() },
        })
    }

    fn network_descriptor(&self, addresses: &Addresses) -> VirtanceResult<NetworkDescriptor> {
        Ok(NetworkDescriptor {
            public_primary: self.interface(&addresses.public, true)?,
            public_secondary: self.interface(&addresses.compute, false)?,
            private: self.interface(&addresses.private, false)?,
            v6: addresses
                .public_v6
                .as_ref()
                .map(|a| self.interface(a, true))
                .transpose()?,
        })
    }

    fn disk_image(&self, virtance: &Virtance, size: &Size, template: &Image) -> DiskImage {
        DiskImage {
            primary: true,
            name: virtance.domain_name(&self.config.vm_name_prefix),
            size: size.disk,
            image_type: template.kind.remote_type().to_string(),
            md5sum: template.md5sum.clone(),
            file_name: template.file_name.clone(),
            public_url: self.config.public_images_url.clone(),
        }
    }

    /// Keys of the virtance's key pairs, then the service key if any
    fn authorized_keys(&self, virtance: &Virtance) -> VirtanceResult<Vec<String>> {
        let mut keys = Vec::with_capacity(virtance.keypair_ids.len() + 1);
        for id in &virtance.keypair_ids {
            let keypair: KeyPair = self.store.require(id.0)?;
            keys.push(keypair.public_key);
        }
        if let Some(service_key) = &virtance.service_key {
            keys.push(service_key.clone());
        }
        Ok(keys)
    }
}
