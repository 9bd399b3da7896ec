//! End-to-end orchestration runs against the mock compute gateway

mod common;

use std::time::Duration;

use pretty_assertions::assert_eq;
use rust_decimal_macros::dec;
use virtance_core::{
    compute_gateway::{MediaSlot, RemoteAction, RemoteStatus},
    ip_pool::{AddressAllocation, AddressPool, PoolType},
    lifecycle::{ImageRetirement, Operation, OperationOutcome},
    metering::MeteredEntity,
    orchestration_log::EntityRef,
    test_helpers::{utc, Fixture, GatewayCall},
    types::{
        Image, ImageEvent, ImageId, ImageKind, PowerAction, PowerState, Size, SizeId, Virtance,
        VirtanceEvent,
    },
};

fn power(action: PowerAction) -> Operation {
    Operation::Power { action }
}

#[tokio::test]
async fn test_create_places_allocates_and_opens_billing() {
    common::init_tracing();
    let fx = Fixture::new();
    fx.add_network();
    let v = fx.add_virtance();
    let orchestrator = fx.orchestrator();

    let outcome = orchestrator
        .run(v.id, &Operation::Create { password: None })
        .await
        .unwrap();
    assert_eq!(outcome, OperationOutcome::Completed);

    let stored = fx.virtance(v.id);
    assert_eq!(stored.compute_id, Some(fx.node_id));
    assert_eq!(stored.power, PowerState::Active);
    assert_eq!(stored.event, None);

    let mut types: Vec<PoolType> = fx
        .allocator()
        .allocations_for(v.id)
        .unwrap()
        .iter()
        .map(|a| a.pool_type)
        .collect();
    types.sort_by_key(|t| t.as_str());
    assert_eq!(types, vec![PoolType::Compute, PoolType::Private, PoolType::Public]);

    let request = fx.gateway.last_create().unwrap();
    assert_eq!(request.vcpu, 1);
    assert!(request.password_hash.starts_with("$6$"));
    assert!(request.network.v6.is_none());
    assert_eq!(request.images[0].file_name, "debian-12-x64.qcow2");

    let interval = fx
        .ledger()
        .open_interval(MeteredEntity::Virtance(v.id))
        .unwrap()
        .unwrap();
    assert_eq!(interval.started, utc(2024, 1, 15, 10, 0));
    assert_eq!(interval.amount, dec!(0.0060));

    let history = fx.log().history_for(EntityRef::Virtance(v.id)).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].operation, "create");
}

#[tokio::test]
async fn test_create_without_private_pool_is_not_available() {
    let fx = Fixture::new();
    fx.add_pool(PoolType::Compute, "10.255.0.0/24", "10.255.0.1");
    fx.add_pool(PoolType::Public, "203.0.113.0/24", "203.0.113.1");
    let v = fx.add_virtance();

    let outcome = fx
        .orchestrator()
        .run(v.id, &Operation::Create { password: None })
        .await
        .unwrap();
    assert_eq!(
        outcome,
        OperationOutcome::NotAvailable {
            resource: "private ipv4 address".to_string()
        }
    );

    // nothing reached the node and nothing is billed
    assert!(fx.gateway.calls().is_empty());
    let stored = fx.virtance(v.id);
    assert_eq!(stored.event, Some(VirtanceEvent::Create));
    assert_eq!(stored.compute_id, None);
    assert!(fx.allocator().allocations_for(v.id).unwrap().is_empty());
    assert!(fx
        .ledger()
        .intervals_for(MeteredEntity::Virtance(v.id))
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_delete_after_unavailable_create_stays_local() {
    let fx = Fixture::new();
    fx.add_pool(PoolType::Compute, "10.255.0.0/24", "10.255.0.1");
    fx.add_pool(PoolType::Public, "203.0.113.0/24", "203.0.113.1");
    let v = fx.add_virtance();
    let orchestrator = fx.orchestrator();

    let outcome = orchestrator
        .run(v.id, &Operation::Create { password: None })
        .await
        .unwrap();
    assert!(matches!(outcome, OperationOutcome::NotAvailable { .. }));

    fx.leases().release(v.id).unwrap();
    let outcome = orchestrator.run(v.id, &Operation::Delete).await.unwrap();
    assert!(outcome.is_completed());

    assert!(fx.gateway.calls().is_empty());
    assert!(fx.store.get::<Virtance>(v.id.0).unwrap().is_none());
    assert!(fx
        .ledger()
        .intervals_for(MeteredEntity::Virtance(v.id))
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_unavailable_create_keeps_addresses_from_earlier_attempt() {
    let fx = Fixture::new();
    fx.add_network();
    let v = fx.add_virtance();
    let orchestrator = fx.orchestrator();

    fx.gateway.fail("create", "node unreachable");
    let outcome = orchestrator
        .run(v.id, &Operation::Create { password: None })
        .await
        .unwrap();
    assert!(matches!(outcome, OperationOutcome::Failed { .. }));
    let held = fx.allocator().allocations_for(v.id).unwrap();
    assert_eq!(held.len(), 3);

    // the private address goes away, the rest of the earlier attempt stays
    let private = held
        .iter()
        .find(|a| a.pool_type == PoolType::Private)
        .unwrap()
        .clone();
    fx.allocator().release(private.id).unwrap();
    let mut pool: AddressPool = fx.store.require(private.pool_id.0).unwrap();
    pool.active = false;
    fx.store.put(&pool).unwrap();

    let outcome = orchestrator
        .run(v.id, &Operation::Create { password: None })
        .await
        .unwrap();
    assert!(matches!(outcome, OperationOutcome::NotAvailable { .. }));
    assert_eq!(fx.virtance(v.id).compute_id, Some(fx.node_id));
    let mut left: Vec<PoolType> = fx
        .allocator()
        .allocations_for(v.id)
        .unwrap()
        .iter()
        .map(|a| a.pool_type)
        .collect();
    left.sort_by_key(|t| t.as_str());
    assert_eq!(left, vec![PoolType::Compute, PoolType::Public]);
}

#[tokio::test]
async fn test_create_failure_is_logged_and_retry_reuses_addresses() {
    let fx = Fixture::new();
    fx.add_network();
    let v = fx.add_virtance();
    let orchestrator = fx.orchestrator();

    fx.gateway.fail("create", "image download failed");
    let outcome = orchestrator
        .run(v.id, &Operation::Create { password: None })
        .await
        .unwrap();
    assert_eq!(
        outcome,
        OperationOutcome::Failed {
            detail: "image download failed".to_string()
        }
    );
    let errors = fx.log().errors_for(EntityRef::Virtance(v.id)).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].operation, "create");
    assert_eq!(fx.virtance(v.id).event, Some(VirtanceEvent::Create));

    let before: Vec<AddressAllocation> = fx.allocator().allocations_for(v.id).unwrap();
    fx.gateway.succeed("create");
    let retry = orchestrator
        .run(v.id, &Operation::Create { password: None })
        .await
        .unwrap();
    assert!(retry.is_completed());
    assert_eq!(fx.allocator().allocations_for(v.id).unwrap(), before);
}

#[tokio::test]
async fn test_rebuild_keeps_addresses_and_billing() {
    let fx = Fixture::new();
    fx.add_network();
    let v = fx.add_running_virtance();
    let before = fx.allocator().allocations_for(v.id).unwrap();

    let outcome = fx.orchestrator().run(v.id, &Operation::Rebuild).await.unwrap();
    assert!(outcome.is_completed());

    assert_eq!(fx.gateway.calls(), vec![GatewayCall::Rebuild(v.id)]);
    let request = fx.gateway.last_rebuild().unwrap();
    let public = before
        .iter()
        .find(|a| a.pool_type == PoolType::Public)
        .unwrap();
    assert_eq!(request.network.public_primary.address, public.address);
    assert!(request.password_hash.starts_with("$6$"));

    assert_eq!(fx.allocator().allocations_for(v.id).unwrap(), before);
    assert!(fx
        .ledger()
        .intervals_for(MeteredEntity::Virtance(v.id))
        .unwrap()
        .is_empty());
    let stored = fx.virtance(v.id);
    assert_eq!(stored.event, None);
    assert_eq!(stored.power, PowerState::Active);
}

#[tokio::test]
async fn test_restore_clears_image_event() {
    let fx = Fixture::new();
    fx.add_network();
    let mut v = fx.add_running_virtance();
    v.power = PowerState::Inactive;
    fx.store.put(&v).unwrap();

    let backup = Image {
        id: ImageId(fx.store.next_id("image").unwrap()),
        name: "nightly".to_string(),
        kind: ImageKind::Backup,
        event: Some(ImageEvent::Restore),
        user_id: Some(v.user_id),
        source: Some(v.id),
        distribution: "Debian".to_string(),
        description: "Debian 12 x64".to_string(),
        md5sum: String::new(),
        file_name: "backup-1.qcow2".to_string(),
        file_size: 0,
        disk_size: 25,
        regions: ["fra1".to_string()].into(),
        created_at: utc(2024, 1, 14, 3, 0),
        is_deleted: false,
    };
    fx.store.put(&backup).unwrap();

    let outcome = fx
        .orchestrator()
        .run(v.id, &Operation::Restore { image_id: backup.id })
        .await
        .unwrap();
    assert!(outcome.is_completed());

    assert_eq!(
        fx.gateway.calls(),
        vec![GatewayCall::Restore(v.id, "backup-1.qcow2".to_string())]
    );
    let image: Image = fx.store.require(backup.id.0).unwrap();
    assert_eq!(image.event, None);
    let stored = fx.virtance(v.id);
    assert_eq!(stored.power, PowerState::Active);
    assert_eq!(stored.event, None);
}

#[tokio::test]
async fn test_reset_password_sends_crypt_hash() {
    let fx = Fixture::new();
    fx.add_network();
    let v = fx.add_running_virtance();

    let outcome = fx
        .orchestrator()
        .run(
            v.id,
            &Operation::ResetPassword {
                password: Some("correct horse".to_string()),
            },
        )
        .await
        .unwrap();
    assert!(outcome.is_completed());

    assert_eq!(fx.gateway.calls(), vec![GatewayCall::ResetPassword(v.id)]);
    let hash = fx.gateway.last_password_hash().unwrap();
    assert!(hash.starts_with("$6$"));
    assert!(!hash.contains("correct horse"));
    assert_eq!(fx.virtance(v.id).event, None);
    assert!(fx.leases().current(v.id).unwrap().is_none());
}

#[tokio::test]
async fn test_busy_virtance_is_not_touched() {
    let fx = Fixture::new();
    fx.add_network();
    let v = fx.add_running_virtance();
    fx.leases().request(v.id, VirtanceEvent::Snapshot).unwrap();

    let outcome = fx
        .orchestrator()
        .run(v.id, &power(PowerAction::PowerOff))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        OperationOutcome::Busy {
            in_flight: VirtanceEvent::Snapshot
        }
    );
    assert!(fx.gateway.calls().is_empty());
}

#[tokio::test]
async fn test_shutdown_escalates_after_poll_budget() {
    let fx = Fixture::new();
    fx.add_network();
    let v = fx.add_running_virtance();
    fx.gateway.set_status(RemoteStatus::Running);

    let outcome = fx
        .orchestrator()
        .run(v.id, &power(PowerAction::Shutdown))
        .await
        .unwrap();
    assert!(outcome.is_completed());

    assert_eq!(fx.gateway.count(&GatewayCall::Status(v.id)), 60);
    assert_eq!(
        fx.gateway
            .count(&GatewayCall::Action(v.id, RemoteAction::PowerOff)),
        1
    );
    assert_eq!(fx.clock.sleeps().len(), 60);
    assert!(fx.clock.sleeps().iter().all(|s| *s == Duration::from_secs(1)));
    assert_eq!(fx.virtance(v.id).power, PowerState::Inactive);
}

#[tokio::test]
async fn test_clean_shutdown_never_forces() {
    let fx = Fixture::new();
    fx.add_network();
    let v = fx.add_running_virtance();
    fx.gateway
        .queue_statuses([RemoteStatus::Running, RemoteStatus::Running]);

    fx.orchestrator()
        .run(v.id, &power(PowerAction::Shutdown))
        .await
        .unwrap();

    assert_eq!(fx.gateway.count(&GatewayCall::Status(v.id)), 3);
    assert_eq!(
        fx.gateway
            .count(&GatewayCall::Action(v.id, RemoteAction::PowerOff)),
        0
    );
    let history = fx.log().history_for(EntityRef::Virtance(v.id)).unwrap();
    assert_eq!(history[0].message.as_deref(), Some("clean shutdown after 3 polls"));
}

#[tokio::test]
async fn test_failed_forced_power_off_fails_shutdown() {
    let fx = Fixture::new();
    fx.add_network();
    let v = fx.add_running_virtance();
    fx.gateway.set_status(RemoteStatus::Paused);
    fx.gateway.fail("power_off", "domain is locked");

    let outcome = fx
        .orchestrator()
        .run(v.id, &power(PowerAction::Shutdown))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        OperationOutcome::Failed {
            detail: "domain is locked".to_string()
        }
    );
    assert_eq!(fx.gateway.methods().last(), Some(&"power_off"));
    let stored = fx.virtance(v.id);
    assert_eq!(stored.event, Some(VirtanceEvent::Shutdown));
    assert_eq!(stored.power, PowerState::Active);
}

#[tokio::test]
async fn test_reboot_with_failed_power_on_is_left_off() {
    let fx = Fixture::new();
    fx.add_network();
    let v = fx.add_running_virtance();
    fx.gateway.fail("power_on", "qemu crashed");

    let outcome = fx
        .orchestrator()
        .run(v.id, &power(PowerAction::Reboot))
        .await
        .unwrap();
    assert!(matches!(outcome, OperationOutcome::Failed { .. }));
    let stored = fx.virtance(v.id);
    assert_eq!(stored.power, PowerState::Inactive);
    assert_eq!(stored.event, Some(VirtanceEvent::Reboot));
}

#[tokio::test]
async fn test_reboot_is_shutdown_then_power_on() {
    let fx = Fixture::new();
    fx.add_network();
    let v = fx.add_running_virtance();

    fx.orchestrator()
        .run(v.id, &power(PowerAction::Reboot))
        .await
        .unwrap();

    let actions: Vec<GatewayCall> = fx
        .gateway
        .calls()
        .into_iter()
        .filter(|c| matches!(c, GatewayCall::Action(..)))
        .collect();
    assert_eq!(
        actions,
        vec![
            GatewayCall::Action(v.id, RemoteAction::Shutdown),
            GatewayCall::Action(v.id, RemoteAction::PowerOn),
        ]
    );
    assert_eq!(fx.virtance(v.id).power, PowerState::Active);
}

#[tokio::test]
async fn test_resize_closes_and_reopens_interval() {
    let fx = Fixture::new();
    fx.add_network();
    let v = fx.add_running_virtance();
    let entity = MeteredEntity::Virtance(v.id);
    let ledger = fx.ledger();
    ledger
        .ensure_open_interval(entity, &ledger.virtance_rates(&v, &fx.size))
        .unwrap();

    let bigger = Size {
        id: SizeId(2),
        slug: "s-2vcpu-2gb".to_string(),
        vcpu: 2,
        memory: 2048,
        disk: 50,
        price: dec!(0.0179),
    };
    fx.store.put(&bigger).unwrap();
    fx.clock.set_time(utc(2024, 1, 15, 14, 30));

    let outcome = fx
        .orchestrator()
        .run(v.id, &Operation::Resize { size_id: bigger.id })
        .await
        .unwrap();
    assert!(outcome.is_completed());

    let intervals = ledger.intervals_for(entity).unwrap();
    assert_eq!(intervals.len(), 2);
    assert_eq!(intervals[0].stopped, Some(utc(2024, 1, 15, 14, 30)));
    assert_eq!(intervals[0].rate, dec!(0.0060));
    assert!(intervals[1].is_open());
    assert_eq!(intervals[1].size_id, Some(SizeId(2)));
    assert_eq!(intervals[1].rate, dec!(0.0179));
    assert_eq!(fx.virtance(v.id).size_id, SizeId(2));
    assert_eq!(
        fx.gateway.calls(),
        vec![GatewayCall::Resize {
            id: v.id,
            vcpu: 2,
            memory: 2048,
            disk: 50
        }]
    );
}

#[tokio::test]
async fn test_resize_without_open_interval_backdates_one() {
    let fx = Fixture::new();
    fx.add_network();
    let v = fx.add_running_virtance();
    let entity = MeteredEntity::Virtance(v.id);

    let bigger = Size {
        id: SizeId(2),
        slug: "s-2vcpu-2gb".to_string(),
        vcpu: 2,
        memory: 2048,
        disk: 50,
        price: dec!(0.0179),
    };
    fx.store.put(&bigger).unwrap();
    fx.clock.set_time(utc(2024, 1, 15, 14, 30));

    let outcome = fx
        .orchestrator()
        .run(v.id, &Operation::Resize { size_id: bigger.id })
        .await
        .unwrap();
    assert!(outcome.is_completed());

    // the missing stretch is covered by an hour at the old rate
    let intervals = fx.ledger().intervals_for(entity).unwrap();
    assert_eq!(intervals.len(), 2);
    assert_eq!(intervals[0].started, utc(2024, 1, 15, 13, 30));
    assert_eq!(intervals[0].stopped, Some(utc(2024, 1, 15, 14, 30)));
    assert_eq!(intervals[0].rate, dec!(0.0060));
    assert_eq!(intervals[0].amount, dec!(0.0060));
    assert!(intervals[1].is_open());
    assert_eq!(intervals[1].started, utc(2024, 1, 15, 14, 30));
    assert_eq!(intervals[1].rate, dec!(0.0179));
}

#[tokio::test]
async fn test_snapshot_records_image_and_billing() {
    let fx = Fixture::new();
    fx.add_network();
    let v = fx.add_running_virtance();

    let outcome = fx
        .orchestrator()
        .run(
            v.id,
            &Operation::Snapshot {
                display_name: "before upgrade".to_string(),
            },
        )
        .await
        .unwrap();
    assert!(outcome.is_completed());

    let snapshot = fx
        .store
        .list::<Image>()
        .unwrap()
        .into_iter()
        .find(|i| i.kind == ImageKind::Snapshot)
        .unwrap();
    assert_eq!(snapshot.name, "before upgrade");
    assert_eq!(snapshot.source, Some(v.id));
    assert!(snapshot.regions.contains("fra1"));
    assert!(fx
        .ledger()
        .open_interval(MeteredEntity::Snapshot(snapshot.id))
        .unwrap()
        .is_some());
    assert_eq!(fx.virtance(v.id).event, None);
}

#[tokio::test]
async fn test_backup_then_retire() {
    let fx = Fixture::new();
    fx.add_network();
    let v = fx.add_running_virtance();
    let orchestrator = fx.orchestrator();

    orchestrator.run(v.id, &Operation::Backup).await.unwrap();
    let backup = fx
        .store
        .list::<Image>()
        .unwrap()
        .into_iter()
        .find(|i| i.kind == ImageKind::Backup)
        .unwrap();
    assert!(backup.name.starts_with("backup-"));
    assert!(fx
        .ledger()
        .intervals_for(MeteredEntity::Snapshot(backup.id))
        .unwrap()
        .is_empty());

    let retired = orchestrator.retire_image(backup.id).await.unwrap();
    assert_eq!(retired, ImageRetirement::Retired);
    let stored: Image = fx.store.require(backup.id.0).unwrap();
    assert!(stored.is_deleted);
    assert!(stored.regions.is_empty());
    assert!(fx.gateway.volumes("default").is_empty());
}

#[tokio::test]
async fn test_retire_failure_keeps_region() {
    let fx = Fixture::new();
    fx.add_network();
    let v = fx.add_running_virtance();
    let orchestrator = fx.orchestrator();
    orchestrator
        .run(
            v.id,
            &Operation::Snapshot {
                display_name: "nightly".to_string(),
            },
        )
        .await
        .unwrap();
    let snapshot = fx
        .store
        .list::<Image>()
        .unwrap()
        .into_iter()
        .find(|i| i.kind == ImageKind::Snapshot)
        .unwrap();

    fx.gateway.fail("delete_storage_volume", "volume in use");
    let retired = orchestrator.retire_image(snapshot.id).await.unwrap();
    assert_eq!(
        retired,
        ImageRetirement::Failed {
            region: "fra1".to_string(),
            detail: "region fra1: volume in use".to_string(),
        }
    );
    let stored: Image = fx.store.require(snapshot.id.0).unwrap();
    assert!(!stored.is_deleted);
    assert!(stored.regions.contains("fra1"));
    let errors = fx.log().errors_for(EntityRef::Image(snapshot.id)).unwrap();
    assert_eq!(errors[0].operation, "delete_image_snapshot");
}

#[tokio::test]
async fn test_recovery_mode_mounts_once() {
    let fx = Fixture::new();
    fx.add_network();
    let v = fx.add_running_virtance();
    let orchestrator = fx.orchestrator();

    orchestrator.run(v.id, &Operation::EnableRecoveryMode).await.unwrap();
    assert!(fx.virtance(v.id).recovery_mode);

    // already mounted: the second enable does not mount again
    fx.leases().request(v.id, VirtanceEvent::EnableRecoveryMode).unwrap();
    orchestrator.run(v.id, &Operation::EnableRecoveryMode).await.unwrap();
    let mounts = fx
        .gateway
        .methods()
        .into_iter()
        .filter(|m| *m == "mount_media")
        .count();
    assert_eq!(mounts, 1);

    orchestrator.run(v.id, &Operation::DisableRecoveryMode).await.unwrap();
    assert!(!fx.virtance(v.id).recovery_mode);
    assert!(fx.gateway.methods().contains(&"unmount_media"));
}

#[tokio::test]
async fn test_recovery_mode_without_media_slot_fails() {
    let fx = Fixture::new();
    fx.add_network();
    let v = fx.add_running_virtance();
    fx.gateway.set_media(Vec::<MediaSlot>::new());

    let outcome = fx
        .orchestrator()
        .run(v.id, &Operation::EnableRecoveryMode)
        .await
        .unwrap();
    assert!(matches!(outcome, OperationOutcome::Failed { .. }));
    assert!(!fx.virtance(v.id).recovery_mode);
}

#[tokio::test]
async fn test_disable_backups_keeps_flag_when_a_backup_survives() {
    let fx = Fixture::new();
    fx.add_network();
    let mut v = fx.add_running_virtance();
    v.backup_enabled = true;
    fx.store.put(&v).unwrap();
    let orchestrator = fx.orchestrator();

    orchestrator.run(v.id, &Operation::Backup).await.unwrap();
    orchestrator.run(v.id, &Operation::Backup).await.unwrap();

    fx.gateway.fail("delete_storage_volume", "pool locked");
    let outcome = orchestrator.run(v.id, &Operation::DisableBackups).await.unwrap();
    assert_eq!(
        outcome,
        OperationOutcome::Failed {
            detail: "2 of 2 backups were not deleted".to_string()
        }
    );
    assert!(fx.virtance(v.id).backup_enabled);

    fx.gateway.succeed("delete_storage_volume");
    let retry = orchestrator.run(v.id, &Operation::DisableBackups).await.unwrap();
    assert!(retry.is_completed());
    assert!(!fx.virtance(v.id).backup_enabled);
}
