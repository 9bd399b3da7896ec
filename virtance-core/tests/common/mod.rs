// Common helpers for integration tests

#![allow(dead_code)]

use std::time::Duration;

use virtance_core::{
    dependency_links::{
        Firewall, FirewallAttachment, FloatingIp, LoadBalancer, LoadBalancerMember,
    },
    test_helpers::Fixture,
    types::{FirewallId, FloatingIpId, LinkId, LoadBalancerId, Virtance},
};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("virtance_core=debug")
        .with_test_writer()
        .try_init();
}

/// Attach a firewall record to a virtance without calling the node
pub fn link_firewall(fx: &Fixture, virtance: &Virtance, id: u64) -> FirewallId {
    let firewall = Firewall {
        id: FirewallId(id),
        user_id: virtance.user_id,
        name: format!("fw-{}", id),
        rules: Vec::new(),
        event: None,
    };
    fx.store.put(&firewall).unwrap();
    fx.store
        .put(&FirewallAttachment {
            id: LinkId(fx.store.next_id("link").unwrap()),
            firewall_id: firewall.id,
            virtance_id: virtance.id,
        })
        .unwrap();
    firewall.id
}

/// Bind a fresh floating address to a virtance
pub fn bind_floating_ip(fx: &Fixture, virtance: &Virtance, id: u64) -> FloatingIpId {
    let mut allocation = fx
        .allocator()
        .allocate_floating("fra1")
        .unwrap()
        .expect("floating address available");
    allocation.virtance_id = Some(virtance.id);
    fx.store.put(&allocation).unwrap();
    let floating = FloatingIp {
        id: FloatingIpId(id),
        user_id: virtance.user_id,
        allocation_id: allocation.id,
        event: None,
    };
    fx.store.put(&floating).unwrap();
    floating.id
}

/// Make `backend` a member of a load balancer running on `host`
pub fn join_load_balancer(fx: &Fixture, host: &Virtance, backend: &Virtance, id: u64) -> LoadBalancerId {
    let lb = LoadBalancer {
        id: LoadBalancerId(id),
        user_id: host.user_id,
        name: format!("lb-{}", id),
        virtance_id: host.id,
        forwarding_rules: Vec::new(),
        health_check: Default::default(),
        sticky_sessions: None,
        redirect_http_to_https: false,
        event: None,
        is_deleted: false,
    };
    fx.store.put(&lb).unwrap();
    fx.store
        .put(&LoadBalancerMember {
            id: LinkId(fx.store.next_id("link").unwrap()),
            load_balancer_id: lb.id,
            virtance_id: backend.id,
            is_deleted: false,
        })
        .unwrap();
    lb.id
}
