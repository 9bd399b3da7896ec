//! Cascading dependency coordinator
//!
//! Severs a virtance's links to shared resources. Every step follows the same
//! shape: mark the resource's event, build its descriptor from stored state,
//! call the compute node, then unlink and clear the event on success. A
//! failure is logged against both the resource and the virtance and leaves
//! the link in place.
//!
//! Steps are idempotent: a link that is already gone counts as done, so a
//! DELETE that failed half way can simply be run again.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{info, info_span, warn, Instrument};

use crate::{
    compute_gateway::{
        ComputeGateway, FirewallDescriptor, FloatingIpRequest, GatewayConnector, GatewayFailure,
        LoadBalancerDescriptor,
    },
    dependency_links::{
        Firewall, FirewallAttachment, FloatingIp, LoadBalancer, LoadBalancerMember, ResourceEvent,
        RuleDirection,
    },
    error::VirtanceResult,
    ip_allocator::allocations_of,
    ip_pool::{AddressAllocation, IpVersion, PoolType},
    orchestration_log::{EntityRef, OrchestrationLog},
    storage::Store,
    types::{
        ComputeNode, FirewallId, FloatingIpId, LinkId, LoadBalancerId, Virtance, VirtanceId,
    },
};

const LINK_SEQUENCE: &str = "link";

/// One severable link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeStep {
    FirewallDetach(FirewallId),
    FloatingIpUnassign(FloatingIpId),
    LoadBalancerRemove(LoadBalancerId),
}

impl CascadeStep {
    pub fn operation(&self) -> &'static str {
        match self {
            CascadeStep::FirewallDetach(_) => "firewall_detach",
            CascadeStep::FloatingIpUnassign(_) => "floating_ip_unassign",
            CascadeStep::LoadBalancerRemove(_) => "load_balancer_reload",
        }
    }
}

/// Result of one link operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    Done,
    /// Nothing to do, the link does not exist
    AlreadyAbsent,
    Failed(GatewayFailure),
}

impl LinkOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, LinkOutcome::Failed(_))
    }
}

/// Result of severing every link of a virtance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CascadeOutcome {
    Completed { severed: Vec<CascadeStep> },
    Failed {
        step: CascadeStep,
        detail: String,
        severed: Vec<CascadeStep>,
    },
}

#[derive(Clone)]
pub struct DependencyCoordinator {
    store: Store,
    connector: Arc<dyn GatewayConnector>,
    log: OrchestrationLog,
}

/// Public and private IPv4 addresses of a virtance, if it has both
fn primary_addresses(allocations: &[AddressAllocation]) -> Option<(IpAddr, IpAddr)> {
    let find = |pool_type| {
        allocations
            .iter()
            .find(|a| !a.is_floating && a.pool_type == pool_type && a.version() == IpVersion::V4)
            .map(|a| a.address)
    };
    Some((find(PoolType::Public)?, find(PoolType::Private)?))
}

impl DependencyCoordinator {
    pub fn new(store: Store, connector: Arc<dyn GatewayConnector>, log: OrchestrationLog) -> Self {
        Self {
            store,
            connector,
            log,
        }
    }

    fn gateway_for(&self, virtance: &Virtance) -> VirtanceResult<Option<Arc<dyn ComputeGateway>>> {
        match virtance.compute_id {
            Some(node_id) => {
                let node: ComputeNode = self.store.require(node_id.0)?;
                Ok(Some(self.connector.connect(&node)?))
            }
            None => Ok(None),
        }
    }

    fn record_failure(
        &self,
        resource: EntityRef,
        virtance_id: VirtanceId,
        operation: &str,
        failure: &GatewayFailure,
    ) -> VirtanceResult<()> {
        self.log.error(resource, operation, failure.detail.clone())?;
        self.log
            .error(EntityRef::Virtance(virtance_id), operation, failure.detail.clone())
    }

    fn set_firewall_event(&self, id: FirewallId, event: Option<ResourceEvent>) -> VirtanceResult<Firewall> {
        self.store.write("mark firewall", |txn| {
            let mut firewall: Firewall = txn.require_record(id.0)?;
            firewall.event = event;
            txn.put_record(&firewall)?;
            Ok(firewall)
        })
    }

    fn find_attachment(
        &self,
        firewall_id: FirewallId,
        virtance_id: VirtanceId,
    ) -> VirtanceResult<Option<FirewallAttachment>> {
        Ok(self
            .store
            .list::<FirewallAttachment>()?
            .into_iter()
            .find(|a| a.firewall_id == firewall_id && a.virtance_id == virtance_id))
    }

    /// Remove a firewall from a virtance
    ///
    /// With `unlink` false the attachment record survives, which is what an
    /// update needs before re-attaching with new rules.
    pub async fn detach_firewall(
        &self,
        firewall_id: FirewallId,
        virtance_id: VirtanceId,
        unlink: bool,
    ) -> VirtanceResult<LinkOutcome> {
        let Some(attachment) = self.find_attachment(firewall_id, virtance_id)? else {
            return Ok(LinkOutcome::AlreadyAbsent);
        };
        let virtance: Virtance = self.store.require(virtance_id.0)?;
        self.set_firewall_event(firewall_id, Some(ResourceEvent::Detach))?;

        let allocations = self
            .store
            .read("firewall addresses", |txn| allocations_of(txn, virtance_id))?;
        let remote = match (self.gateway_for(&virtance)?, primary_addresses(&allocations)) {
            (Some(gateway), Some((public, private))) => {
                gateway.firewall_detach(firewall_id, public, private).await
            }
            // never reached the node, nothing to remove there
            _ => Ok(()),
        };

        if let Err(failure) = remote {
            self.record_failure(EntityRef::Firewall(firewall_id), virtance_id, "firewall_detach", &failure)?;
            return Ok(LinkOutcome::Failed(failure));
        }

        self.store.write("detach firewall", |txn| {
            if unlink {
                txn.remove_record::<FirewallAttachment>(attachment.id.0)?;
            }
            let mut firewall: Firewall = txn.require_record(firewall_id.0)?;
            firewall.event = None;
            txn.put_record(&firewall)
        })?;
        info!(firewall = firewall_id.0, virtance_id = virtance_id.0, "Firewall detached");
        Ok(LinkOutcome::Done)
    }

    /// Apply a firewall's rules to a virtance
    pub async fn attach_firewall(
        &self,
        firewall_id: FirewallId,
        virtance_id: VirtanceId,
    ) -> VirtanceResult<LinkOutcome> {
        let virtance: Virtance = self.store.require(virtance_id.0)?;
        let firewall = self.set_firewall_event(firewall_id, Some(ResourceEvent::Attach))?;

        if self.find_attachment(firewall_id, virtance_id)?.is_none() {
            self.store.write("link firewall", |txn| {
                txn.put_record(&FirewallAttachment {
                    id: LinkId(txn.next_id(LINK_SEQUENCE)?),
                    firewall_id,
                    virtance_id,
                })
            })?;
        }

        let allocations = self
            .store
            .read("firewall addresses", |txn| allocations_of(txn, virtance_id))?;
        let remote = match (self.gateway_for(&virtance)?, primary_addresses(&allocations)) {
            (Some(gateway), Some((public_address, private_address))) => {
                let descriptor = FirewallDescriptor {
                    firewall_id,
                    public_address,
                    private_address,
                    inbound: firewall.rules_in(RuleDirection::Inbound),
                    outbound: firewall.rules_in(RuleDirection::Outbound),
                };
                gateway.firewall_attach(&descriptor).await
            }
            _ => Err(GatewayFailure::new(format!(
                "{} has no compute node or addresses yet",
                virtance_id
            ))),
        };

        if let Err(failure) = remote {
            self.record_failure(EntityRef::Firewall(firewall_id), virtance_id, "firewall_attach", &failure)?;
            return Ok(LinkOutcome::Failed(failure));
        }

        self.set_firewall_event(firewall_id, None)?;
        info!(firewall = firewall_id.0, virtance_id = virtance_id.0, "Firewall attached");
        Ok(LinkOutcome::Done)
    }

    /// Replace the rules applied to a virtance
    ///
    /// Runs as detach then attach. If the attach fails after a successful
    /// detach the virtance is left without the firewall, and the failure is
    /// in the error log of both.
    pub async fn update_firewall(
        &self,
        firewall_id: FirewallId,
        virtance_id: VirtanceId,
    ) -> VirtanceResult<LinkOutcome> {
        self.set_firewall_event(firewall_id, Some(ResourceEvent::Update))?;
        match self.detach_firewall(firewall_id, virtance_id, false).await? {
            LinkOutcome::Failed(failure) => Ok(LinkOutcome::Failed(failure)),
            LinkOutcome::Done | LinkOutcome::AlreadyAbsent => {
                self.attach_firewall(firewall_id, virtance_id).await
            }
        }
    }

    fn floating_of(&self, id: FloatingIpId) -> VirtanceResult<(FloatingIp, AddressAllocation)> {
        self.store.read("load floating ip", |txn| {
            let floating: FloatingIp = txn.require_record(id.0)?;
            let allocation: AddressAllocation = txn.require_record(floating.allocation_id.0)?;
            Ok((floating, allocation))
        })
    }

    fn set_floating_event(&self, id: FloatingIpId, event: Option<ResourceEvent>) -> VirtanceResult<()> {
        self.store.write("mark floating ip", |txn| {
            let mut floating: FloatingIp = txn.require_record(id.0)?;
            floating.event = event;
            txn.put_record(&floating)
        })
    }

    fn floating_request(
        &self,
        virtance: &Virtance,
        allocation: &AddressAllocation,
    ) -> VirtanceResult<Option<FloatingIpRequest>> {
        let allocations = self
            .store
            .read("floating ip addresses", |txn| allocations_of(txn, virtance.id))?;
        Ok(primary_addresses(&allocations).map(|(fixed_address, _)| FloatingIpRequest {
            virtance_id: virtance.id,
            floating_address: allocation.address,
            fixed_address,
        }))
    }

    /// Bind a floating address to a virtance
    pub async fn assign_floating_ip(
        &self,
        floating_id: FloatingIpId,
        virtance_id: VirtanceId,
    ) -> VirtanceResult<LinkOutcome> {
        let (_, allocation) = self.floating_of(floating_id)?;
        if allocation.virtance_id == Some(virtance_id) {
            return Ok(LinkOutcome::AlreadyAbsent);
        }
        let virtance: Virtance = self.store.require(virtance_id.0)?;
        self.set_floating_event(floating_id, Some(ResourceEvent::Assign))?;

        let remote = match (self.gateway_for(&virtance)?, self.floating_request(&virtance, &allocation)?) {
            (Some(gateway), Some(request)) => gateway.assign_floating_ip(&request).await,
            _ => Err(GatewayFailure::new(format!(
                "{} has no compute node or public address yet",
                virtance_id
            ))),
        };

        if let Err(failure) = remote {
            self.record_failure(
                EntityRef::FloatingIp(floating_id),
                virtance_id,
                "floating_ip_assign",
                &failure,
            )?;
            return Ok(LinkOutcome::Failed(failure));
        }

        self.store.write("bind floating ip", |txn| {
            let mut allocation: AddressAllocation = txn.require_record(allocation.id.0)?;
            allocation.virtance_id = Some(virtance_id);
            txn.put_record(&allocation)?;
            let mut floating: FloatingIp = txn.require_record(floating_id.0)?;
            floating.event = None;
            txn.put_record(&floating)
        })?;
        Ok(LinkOutcome::Done)
    }

    /// Unbind a floating address from whatever virtance holds it
    pub async fn unassign_floating_ip(&self, floating_id: FloatingIpId) -> VirtanceResult<LinkOutcome> {
        let (_, allocation) = self.floating_of(floating_id)?;
        let Some(virtance_id) = allocation.virtance_id else {
            return Ok(LinkOutcome::AlreadyAbsent);
        };
        let virtance: Virtance = self.store.require(virtance_id.0)?;
        self.set_floating_event(floating_id, Some(ResourceEvent::Unassign))?;

        let remote = match (self.gateway_for(&virtance)?, self.floating_request(&virtance, &allocation)?) {
            (Some(gateway), Some(request)) => gateway.unassign_floating_ip(&request).await,
            _ => Ok(()),
        };

        if let Err(failure) = remote {
            self.record_failure(
                EntityRef::FloatingIp(floating_id),
                virtance_id,
                "floating_ip_unassign",
                &failure,
            )?;
            return Ok(LinkOutcome::Failed(failure));
        }

        self.store.write("unbind floating ip", |txn| {
            let mut allocation: AddressAllocation = txn.require_record(allocation.id.0)?;
            allocation.virtance_id = None;
            txn.put_record(&allocation)?;
            let mut floating: FloatingIp = txn.require_record(floating_id.0)?;
            floating.event = None;
            txn.put_record(&floating)
        })?;
        info!(floating_ip = floating_id.0, virtance_id = virtance_id.0, "Floating IP unassigned");
        Ok(LinkOutcome::Done)
    }

    /// Push a load balancer's configuration, leaving out `excluded` backends
    async fn push_load_balancer(
        &self,
        lb: &LoadBalancer,
        excluded: Option<VirtanceId>,
    ) -> VirtanceResult<Result<(), GatewayFailure>> {
        let (lb_virtance, backends) = self.store.read("load balancer state", |txn| {
            let lb_virtance: Virtance = txn.require_record(lb.virtance_id.0)?;
            let mut backends = Vec::new();
            for member in txn.scan_records::<LoadBalancerMember>()? {
                if member.load_balancer_id != lb.id
                    || member.is_deleted
                    || Some(member.virtance_id) == excluded
                {
                    continue;
                }
                let private = allocations_of(txn, member.virtance_id)?
                    .into_iter()
                    .find(|a| a.pool_type == PoolType::Private && a.version() == IpVersion::V4);
                if let Some(private) = private {
                    backends.push(private.address);
                }
            }
            Ok((lb_virtance, backends))
        })?;

        let descriptor = LoadBalancerDescriptor {
            load_balancer_id: lb.id,
            forwarding_rules: lb.forwarding_rules.clone(),
            health_check: lb.health_check.clone(),
            sticky_sessions: lb.sticky_sessions.clone(),
            redirect_http_to_https: lb.redirect_http_to_https,
            backends,
        };

        Ok(match self.gateway_for(&lb_virtance)? {
            Some(gateway) => gateway.reload_load_balancer(&descriptor).await,
            None => Err(GatewayFailure::new(format!(
                "load balancer {} has no compute node",
                lb.id
            ))),
        })
    }

    fn set_lb_event(&self, id: LoadBalancerId, event: Option<ResourceEvent>) -> VirtanceResult<LoadBalancer> {
        self.store.write("mark load balancer", |txn| {
            let mut lb: LoadBalancer = txn.require_record(id.0)?;
            lb.event = event;
            txn.put_record(&lb)?;
            Ok(lb)
        })
    }

    /// Remove a virtance from a load balancer's backends
    pub async fn remove_from_load_balancer(
        &self,
        lb_id: LoadBalancerId,
        virtance_id: VirtanceId,
    ) -> VirtanceResult<LinkOutcome> {
        let member = self
            .store
            .list::<LoadBalancerMember>()?
            .into_iter()
            .find(|m| m.load_balancer_id == lb_id && m.virtance_id == virtance_id && !m.is_deleted);
        let Some(member) = member else {
            return Ok(LinkOutcome::AlreadyAbsent);
        };

        let lb = self.set_lb_event(lb_id, Some(ResourceEvent::Reload))?;
        if let Err(failure) = self.push_load_balancer(&lb, Some(virtance_id)).await? {
            self.record_failure(EntityRef::LoadBalancer(lb_id), virtance_id, "load_balancer_reload", &failure)?;
            return Ok(LinkOutcome::Failed(failure));
        }

        self.store.write("remove load balancer member", |txn| {
            let mut member: LoadBalancerMember = txn.require_record(member.id.0)?;
            member.is_deleted = true;
            txn.put_record(&member)?;
            let mut lb: LoadBalancer = txn.require_record(lb_id.0)?;
            lb.event = None;
            txn.put_record(&lb)
        })?;
        info!(load_balancer = lb_id.0, virtance_id = virtance_id.0, "Removed from load balancer");
        Ok(LinkOutcome::Done)
    }

    /// Push the current configuration of a load balancer
    pub async fn reload_load_balancer(&self, lb_id: LoadBalancerId) -> VirtanceResult<LinkOutcome> {
        let lb = self.set_lb_event(lb_id, Some(ResourceEvent::Reload))?;
        if let Err(failure) = self.push_load_balancer(&lb, None).await? {
            self.record_failure(EntityRef::LoadBalancer(lb_id), lb.virtance_id, "load_balancer_reload", &failure)?;
            return Ok(LinkOutcome::Failed(failure));
        }
        self.set_lb_event(lb_id, None)?;
        Ok(LinkOutcome::Done)
    }

    /// Sever every link of a virtance
    ///
    /// Order is firewalls, then floating IPs, then load balancer membership.
    /// The first failure stops the cascade; links severed before it stay
    /// severed.
    pub async fn sever_all(&self, virtance: &Virtance) -> VirtanceResult<CascadeOutcome> {
        let span = info_span!("cascade", virtance_id = virtance.id.0);
        async {
            let mut plan = Vec::new();
            for attachment in self.store.list::<FirewallAttachment>()? {
                if attachment.virtance_id == virtance.id {
                    plan.push(CascadeStep::FirewallDetach(attachment.firewall_id));
                }
            }

            let bound = self.store.read("bound floating ips", |txn| {
                let floating: Vec<FloatingIp> = txn.scan_records()?;
                let mut bound = Vec::new();
                for f in floating {
                    let allocation: AddressAllocation = txn.require_record(f.allocation_id.0)?;
                    if allocation.virtance_id == Some(virtance.id) {
                        bound.push(f.id);
                    }
                }
                Ok(bound)
            })?;
            plan.extend(bound.into_iter().map(CascadeStep::FloatingIpUnassign));

            let lbs: Vec<LoadBalancer> = self.store.list()?;
            for member in self.store.list::<LoadBalancerMember>()? {
                let live_lb = lbs
                    .iter()
                    .any(|lb| lb.id == member.load_balancer_id && !lb.is_deleted);
                if member.virtance_id == virtance.id && !member.is_deleted && live_lb {
                    plan.push(CascadeStep::LoadBalancerRemove(member.load_balancer_id));
                }
            }

            let mut severed = Vec::new();
            for step in plan {
                let outcome = match step {
                    CascadeStep::FirewallDetach(id) => self.detach_firewall(id, virtance.id, true).await?,
                    CascadeStep::FloatingIpUnassign(id) => self.unassign_floating_ip(id).await?,
                    CascadeStep::LoadBalancerRemove(id) => {
                        self.remove_from_load_balancer(id, virtance.id).await?
                    }
                };
                match outcome {
                    LinkOutcome::Done => severed.push(step),
                    LinkOutcome::AlreadyAbsent => {}
                    LinkOutcome::Failed(failure) => {
                        warn!(step = step.operation(), "Cascade stopped: {}", failure);
                        return Ok(CascadeOutcome::Failed {
                            step,
                            detail: failure.detail,
                            severed,
                        });
                    }
                }
            }
            Ok(CascadeOutcome::Completed { severed })
        }
        .instrument(span)
        .await
    }
}
