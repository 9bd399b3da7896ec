//! Month rollover and hourly accrual

mod common;

use chrono::Duration;
use pretty_assertions::assert_eq;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use virtance_core::{
    metering::{MeteredEntity, SweepReport},
    sweepers::MeteringSweeper,
    test_helpers::{utc, Fixture},
    types::VirtanceEvent,
};

#[test]
fn test_rollover_splits_interval_at_month_boundary() {
    let fx = Fixture::at(utc(2024, 1, 15, 10, 0));
    let v = fx.add_virtance();
    let entity = MeteredEntity::Virtance(v.id);
    let ledger = fx.ledger();
    let opened = ledger
        .ensure_open_interval(entity, &ledger.virtance_rates(&v, &fx.size))
        .unwrap();
    assert_eq!(opened.rate, dec!(0.0060));

    let sweeper = MeteringSweeper::new(fx.ledger());
    let report = sweeper.run_once(utc(2024, 2, 1, 0, 5)).unwrap();
    assert_eq!(
        report,
        SweepReport {
            rolled_over: true,
            closed: 1,
            opened: 1,
            accrued: 0,
            repaired: 0,
        }
    );

    let intervals = ledger.intervals_for(entity).unwrap();
    assert_eq!(intervals.len(), 2);
    assert_eq!(
        intervals[0].stopped.unwrap().to_rfc3339(),
        "2024-01-31T23:59:59.999999+00:00"
    );
    assert_eq!(intervals[1].started, utc(2024, 2, 1, 0, 0));
    assert_eq!(intervals[1].rate, dec!(0.0060));
    assert!(intervals[1].is_open());

    // a second sweep in the same hour changes nothing
    let again = sweeper.run_once(utc(2024, 2, 1, 0, 40)).unwrap();
    assert_eq!(again.closed, 0);
    assert_eq!(again.opened, 0);
    assert_eq!(ledger.intervals_for(entity).unwrap().len(), 2);
}

#[test]
fn test_missed_rollover_is_repaired() {
    let fx = Fixture::at(utc(2024, 1, 15, 10, 0));
    let v = fx.add_virtance();
    let entity = MeteredEntity::Virtance(v.id);
    let ledger = fx.ledger();
    ledger
        .ensure_open_interval(entity, &ledger.virtance_rates(&v, &fx.size))
        .unwrap();

    let report = MeteringSweeper::new(fx.ledger())
        .run_once(utc(2024, 2, 1, 3, 0))
        .unwrap();
    assert!(!report.rolled_over);
    assert_eq!(report.repaired, 1);
    assert_eq!(report.accrued, 1);

    let intervals = ledger.intervals_for(entity).unwrap();
    assert_eq!(intervals[1].started, utc(2024, 2, 1, 0, 0));
    assert_eq!(intervals[1].amount, dec!(0.0120));
}

#[test]
fn test_hourly_sweep_accrues_backup_surcharge() {
    let fx = Fixture::at(utc(2024, 1, 15, 10, 0));
    let mut v = fx.add_virtance();
    v.backup_enabled = true;
    fx.store.put(&v).unwrap();
    let entity = MeteredEntity::Virtance(v.id);
    let ledger = fx.ledger();
    let rates = ledger.virtance_rates(&v, &fx.size);
    assert_eq!(rates.backup_rate, dec!(0.0012));
    ledger.ensure_open_interval(entity, &rates).unwrap();

    let sweeper = MeteringSweeper::new(fx.ledger());
    for hour in 11..14 {
        sweeper.run_once(utc(2024, 1, 15, hour, 0)).unwrap();
    }

    let interval = ledger.open_interval(entity).unwrap().unwrap();
    assert_eq!(interval.amount, dec!(0.0240));
    assert_eq!(interval.backup_amount, dec!(0.0048));
    assert_eq!(interval.last_charged, utc(2024, 1, 15, 13, 0));
}

#[test]
fn test_unfinished_create_is_not_billed() {
    let fx = Fixture::at(utc(2024, 1, 15, 10, 0));
    let v = fx.add_virtance();
    fx.leases().request(v.id, VirtanceEvent::Create).unwrap();

    let report = MeteringSweeper::new(fx.ledger())
        .run_once(utc(2024, 1, 15, 11, 0))
        .unwrap();
    assert_eq!(report.opened, 0);
    assert!(fx
        .ledger()
        .intervals_for(MeteredEntity::Virtance(v.id))
        .unwrap()
        .is_empty());
}

#[test]
fn test_january_interval_closes_with_hourly_sum() {
    let fx = Fixture::at(utc(2024, 1, 15, 10, 0));
    let v = fx.add_virtance();
    let entity = MeteredEntity::Virtance(v.id);
    let ledger = fx.ledger();
    ledger
        .ensure_open_interval(entity, &ledger.virtance_rates(&v, &fx.size))
        .unwrap();

    let sweeper = MeteringSweeper::new(fx.ledger());
    let mut hour = utc(2024, 1, 15, 11, 0);
    let end = utc(2024, 2, 1, 0, 0);
    let mut swept = 0;
    while hour < end {
        sweeper.run_once(hour).unwrap();
        hour += Duration::hours(1);
        swept += 1;
    }
    // 11:00 on the 15th through 23:00 on the 31st
    assert_eq!(swept, 397);
    sweeper.run_once(end).unwrap();

    // the opening hour plus one charge per sweep
    let intervals = ledger.intervals_for(entity).unwrap();
    assert_eq!(intervals.len(), 2);
    let january = &intervals[0];
    assert_eq!(january.amount, dec!(0.0060) * Decimal::from(398));
    assert_eq!(january.amount, dec!(2.3880));
    assert_eq!(
        january.stopped.unwrap().to_rfc3339(),
        "2024-01-31T23:59:59.999999+00:00"
    );
    assert_eq!(intervals[1].started, end);
    assert_eq!(intervals[1].amount, dec!(0.0060));
}
