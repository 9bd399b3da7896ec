//! DELETE and the dependency cascade

mod common;

use pretty_assertions::assert_eq;
use virtance_core::{
    cascade::{CascadeOutcome, CascadeStep, LinkOutcome},
    dependency_links::{FirewallAttachment, LoadBalancerMember},
    ip_pool::AddressAllocation,
    lifecycle::{Operation, OperationOutcome},
    metering::MeteredEntity,
    orchestration_log::EntityRef,
    test_helpers::{utc, Fixture, GatewayCall},
    types::{Size, Virtance, VirtanceEvent},
};

use common::{bind_floating_ip, join_load_balancer, link_firewall};

#[tokio::test]
async fn test_delete_severs_links_in_order() {
    common::init_tracing();
    let fx = Fixture::new();
    fx.add_network();
    let lb_host = fx.add_running_virtance();
    let v = fx.add_running_virtance();

    let fw = link_firewall(&fx, &v, 1);
    bind_floating_ip(&fx, &v, 1);
    let lb = join_load_balancer(&fx, &lb_host, &v, 1);
    let entity = MeteredEntity::Virtance(v.id);
    let ledger = fx.ledger();
    ledger
        .ensure_open_interval(entity, &ledger.virtance_rates(&v, &fx.size))
        .unwrap();
    fx.clock.set_time(utc(2024, 1, 20, 8, 0));

    let outcome = fx.orchestrator().run(v.id, &Operation::Delete).await.unwrap();
    assert_eq!(outcome, OperationOutcome::Completed);

    let calls = fx.gateway.calls();
    let floating_address = match &calls[1] {
        GatewayCall::UnassignFloatingIp(address) => *address,
        other => panic!("Expected floating IP unassign, got {:?}", other),
    };
    assert_eq!(
        calls,
        vec![
            GatewayCall::FirewallDetach(fw),
            GatewayCall::UnassignFloatingIp(floating_address),
            GatewayCall::ReloadLoadBalancer {
                id: lb,
                backends: Vec::new()
            },
            GatewayCall::Delete(v.id),
        ]
    );

    assert!(fx.store.get::<Virtance>(v.id.0).unwrap().is_none());
    assert!(fx.store.list::<FirewallAttachment>().unwrap().is_empty());
    assert!(fx.store.list::<LoadBalancerMember>().unwrap()[0].is_deleted);

    // the floating address survives, unbound
    let remaining: Vec<AddressAllocation> = fx
        .store
        .list::<AddressAllocation>()
        .unwrap()
        .into_iter()
        .filter(|a| a.virtance_id != Some(lb_host.id))
        .collect();
    assert_eq!(remaining.len(), 1);
    assert!(remaining[0].is_floating);
    assert_eq!(remaining[0].virtance_id, None);

    let intervals = ledger.intervals_for(entity).unwrap();
    assert_eq!(intervals.len(), 1);
    assert_eq!(intervals[0].stopped, Some(utc(2024, 1, 20, 8, 0)));
}

#[tokio::test]
async fn test_failed_detach_blocks_remote_delete() {
    let fx = Fixture::new();
    fx.add_network();
    let v = fx.add_running_virtance();
    let fw = link_firewall(&fx, &v, 7);
    fx.gateway.fail("firewall_detach", "nwfilter busy");
    let orchestrator = fx.orchestrator();

    let outcome = orchestrator.run(v.id, &Operation::Delete).await.unwrap();
    assert_eq!(
        outcome,
        OperationOutcome::Failed {
            detail: "nwfilter busy".to_string()
        }
    );
    assert!(!fx.gateway.methods().contains(&"delete"));

    let stored = fx.virtance(v.id);
    assert_eq!(stored.event, Some(VirtanceEvent::Delete));
    assert_eq!(fx.allocator().allocations_for(v.id).unwrap().len(), 3);

    let log = fx.log();
    assert_eq!(log.errors_for(EntityRef::Firewall(fw)).unwrap().len(), 1);
    let errors = log.errors_for(EntityRef::Virtance(v.id)).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].operation, "firewall_detach");

    fx.gateway.succeed("firewall_detach");
    let retry = orchestrator.run(v.id, &Operation::Delete).await.unwrap();
    assert!(retry.is_completed());
    assert!(fx.store.get::<Virtance>(v.id.0).unwrap().is_none());
}

#[tokio::test]
async fn test_retry_skips_links_already_severed() {
    let fx = Fixture::new();
    fx.add_network();
    let lb_host = fx.add_running_virtance();
    let v = fx.add_running_virtance();
    let fw = link_firewall(&fx, &v, 2);
    let lb = join_load_balancer(&fx, &lb_host, &v, 2);
    fx.gateway.fail("reload_load_balancer", "haproxy reload failed");
    let coordinator = fx.orchestrator().cascade().clone();

    match coordinator.sever_all(&v).await.unwrap() {
        CascadeOutcome::Failed { step, severed, .. } => {
            assert_eq!(step, CascadeStep::LoadBalancerRemove(lb));
            assert_eq!(severed, vec![CascadeStep::FirewallDetach(fw)]);
        }
        other => panic!("Expected failure, got {:?}", other),
    }
    assert!(!fx.store.list::<LoadBalancerMember>().unwrap()[0].is_deleted);

    fx.gateway.clear_calls();
    fx.gateway.succeed("reload_load_balancer");
    let outcome = coordinator.sever_all(&v).await.unwrap();
    assert_eq!(
        outcome,
        CascadeOutcome::Completed {
            severed: vec![CascadeStep::LoadBalancerRemove(lb)]
        }
    );
    assert_eq!(fx.gateway.methods(), vec!["reload_load_balancer"]);
}

#[tokio::test]
async fn test_link_operations_are_idempotent() {
    let fx = Fixture::new();
    fx.add_network();
    let v = fx.add_running_virtance();
    let coordinator = fx.orchestrator().cascade().clone();
    let fw = link_firewall(&fx, &v, 3);
    let fip = bind_floating_ip(&fx, &v, 3);

    assert_eq!(
        coordinator.detach_firewall(fw, v.id, true).await.unwrap(),
        LinkOutcome::Done
    );
    assert_eq!(
        coordinator.detach_firewall(fw, v.id, true).await.unwrap(),
        LinkOutcome::AlreadyAbsent
    );
    assert_eq!(
        coordinator.unassign_floating_ip(fip).await.unwrap(),
        LinkOutcome::Done
    );
    assert_eq!(
        coordinator.unassign_floating_ip(fip).await.unwrap(),
        LinkOutcome::AlreadyAbsent
    );

    assert_eq!(
        coordinator.assign_floating_ip(fip, v.id).await.unwrap(),
        LinkOutcome::Done
    );
    assert_eq!(
        coordinator.assign_floating_ip(fip, v.id).await.unwrap(),
        LinkOutcome::AlreadyAbsent
    );
}

#[tokio::test]
async fn test_update_firewall_detaches_then_attaches() {
    let fx = Fixture::new();
    fx.add_network();
    let v = fx.add_running_virtance();
    let coordinator = fx.orchestrator().cascade().clone();
    let fw = link_firewall(&fx, &v, 4);

    let outcome = coordinator.update_firewall(fw, v.id).await.unwrap();
    assert_eq!(outcome, LinkOutcome::Done);
    assert_eq!(
        fx.gateway.calls(),
        vec![GatewayCall::FirewallDetach(fw), GatewayCall::FirewallAttach(fw)]
    );
    // the link itself is kept
    assert_eq!(fx.store.list::<FirewallAttachment>().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unplaced_delete_skips_node_and_billing() {
    let fx = Fixture::new();
    fx.add_network();
    let v = fx.add_virtance();

    let outcome = fx.orchestrator().run(v.id, &Operation::Delete).await.unwrap();
    assert!(outcome.is_completed());
    assert!(fx.gateway.calls().is_empty());
    assert!(fx
        .ledger()
        .intervals_for(MeteredEntity::Virtance(v.id))
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_delete_without_open_interval_compensates() {
    let fx = Fixture::new();
    fx.add_network();
    let v = fx.add_running_virtance();

    fx.orchestrator().run(v.id, &Operation::Delete).await.unwrap();

    let intervals = fx
        .ledger()
        .intervals_for(MeteredEntity::Virtance(v.id))
        .unwrap();
    assert_eq!(intervals.len(), 1);
    assert_eq!(intervals[0].started, utc(2024, 1, 15, 9, 0));
    assert_eq!(intervals[0].stopped, Some(utc(2024, 1, 15, 10, 0)));
}

#[tokio::test]
async fn test_delete_with_missing_size_never_reaches_node() {
    let fx = Fixture::new();
    fx.add_network();
    let v = fx.add_running_virtance();
    fx.store
        .write("drop size", |txn| txn.remove_record::<Size>(fx.size.id.0))
        .unwrap();

    let result = fx.orchestrator().run(v.id, &Operation::Delete).await;
    assert!(result.is_err());

    assert!(fx.gateway.calls().is_empty());
    assert!(fx.store.get::<Virtance>(v.id.0).unwrap().is_some());
    assert_eq!(fx.allocator().allocations_for(v.id).unwrap().len(), 3);
}
