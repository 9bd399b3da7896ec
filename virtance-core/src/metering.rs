//! Usage metering ledger
//!
//! Every billable entity has exactly one open [`UsageInterval`] while it
//! exists. The `open_intervals` index enforces that at the storage layer: an
//! interval is only opened by claiming the entity's index key, and closed by
//! releasing it in the same transaction that sets `stopped`.
//!
//! Charges are taken in advance, one hour at a time. Opening an interval
//! charges the hour it was opened in; the hourly sweep charges each later hour
//! exactly once, tracked by `last_charged`. On the first hour of a calendar
//! month the sweep closes every interval carried over from the previous month
//! at its last instant and opens a fresh one dated to the month start.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, DurationRound, TimeZone, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    abstractions::time::Clock,
    common::OptionContext,
    config::MeteringConfig,
    error::{VirtanceError, VirtanceResult},
    storage::{DatabaseTransaction, Store, OPEN_INTERVAL_TABLE},
    types::{Image, ImageId, ImageKind, IntervalId, Size, SizeId, Virtance, VirtanceEvent, VirtanceId},
};

const INTERVAL_SEQUENCE: &str = "usage_interval";

/// Something billed by the hour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum MeteredEntity {
    Virtance(VirtanceId),
    Snapshot(ImageId),
}

impl MeteredEntity {
    /// Key in the `open_intervals` index
    pub fn key(&self) -> String {
        match self {
            MeteredEntity::Virtance(id) => format!("virtance/{}", id.0),
            MeteredEntity::Snapshot(id) => format!("image/{}", id.0),
        }
    }
}

impl std::fmt::Display for MeteredEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// Hourly prices applied to an interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rates {
    pub size_id: Option<SizeId>,
    pub rate: Decimal,
    pub backup_rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageInterval {
    pub id: IntervalId,
    pub entity: MeteredEntity,
    pub size_id: Option<SizeId>,
    /// Hourly rate at the time the interval was opened
    pub rate: Decimal,
    pub amount: Decimal,
    pub backup_amount: Decimal,
    pub started: DateTime<Utc>,
    pub stopped: Option<DateTime<Utc>>,
    /// Start of the last hour already charged
    pub last_charged: DateTime<Utc>,
}

impl UsageInterval {
    pub fn is_open(&self) -> bool {
        self.stopped.is_none()
    }
}

/// How an interval ended
#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    Closed(UsageInterval),
    /// No interval was open; a one-hour interval ending now was recorded
    Compensated(UsageInterval),
}

impl CloseOutcome {
    pub fn interval(&self) -> &UsageInterval {
        match self {
            CloseOutcome::Closed(i) | CloseOutcome::Compensated(i) => i,
        }
    }
}

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub rolled_over: bool,
    pub closed: usize,
    pub opened: usize,
    pub accrued: usize,
    pub repaired: usize,
}

pub fn hour_start(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(chrono::Duration::hours(1)).unwrap_or(t)
}

pub fn month_start(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(t.year(), t.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(t)
}

/// Last representable instant before `month_start`, at microsecond precision
pub fn previous_month_end(month_start: DateTime<Utc>) -> DateTime<Utc> {
    month_start - chrono::Duration::microseconds(1)
}

pub fn is_rollover_hour(t: DateTime<Utc>) -> bool {
    t.day() == 1 && t.hour() == 0
}

/// Whether a virtance is billed; one whose creation never completed is not
pub fn is_billable(virtance: &Virtance) -> bool {
    virtance.event != Some(VirtanceEvent::Create)
}

/// The open interval of an entity, if any
pub(crate) fn open_interval_in(
    txn: &DatabaseTransaction,
    entity: MeteredEntity,
) -> VirtanceResult<Option<UsageInterval>> {
    match txn.get_index(OPEN_INTERVAL_TABLE, &entity.key())? {
        Some(id) => Ok(Some(txn.require_record(id)?)),
        None => Ok(None),
    }
}

/// Open an interval unless one is already open
///
/// The first hour, the one containing `started`, is charged immediately.
pub(crate) fn open_in(
    txn: &DatabaseTransaction,
    entity: MeteredEntity,
    rates: &Rates,
    started: DateTime<Utc>,
) -> VirtanceResult<Option<UsageInterval>> {
    if txn.get_index(OPEN_INTERVAL_TABLE, &entity.key())?.is_some() {
        return Ok(None);
    }

    let id = IntervalId(txn.next_id(INTERVAL_SEQUENCE)?);
    txn.insert_unique(OPEN_INTERVAL_TABLE, &entity.key(), id.0)?;

    let interval = UsageInterval {
        id,
        entity,
        size_id: rates.size_id,
        rate: rates.rate,
        amount: rates.rate,
        backup_amount: rates.backup_rate,
        started,
        stopped: None,
        last_charged: hour_start(started),
    };
    txn.put_record(&interval)?;
    debug!(entity = %entity, started = %started, "Opened usage interval");
    Ok(Some(interval))
}

/// Close the entity's open interval at `stopped`
///
/// When none is open, a compensating interval covering the hour before
/// `stopped` is recorded at `fallback` rates so the period is still billed.
pub(crate) fn close_in(
    txn: &DatabaseTransaction,
    entity: MeteredEntity,
    stopped: DateTime<Utc>,
    fallback: &Rates,
) -> VirtanceResult<CloseOutcome> {
    if let Some(mut interval) = open_interval_in(txn, entity)? {
        interval.stopped = Some(stopped);
        txn.remove_index(OPEN_INTERVAL_TABLE, &entity.key())?;
        txn.put_record(&interval)?;
        debug!(entity = %entity, stopped = %stopped, "Closed usage interval");
        return Ok(CloseOutcome::Closed(interval));
    }

    warn!(
        entity = %entity,
        "No open usage interval found, recording a compensating one"
    );
    let started = stopped - chrono::Duration::hours(1);
    let interval = UsageInterval {
        id: IntervalId(txn.next_id(INTERVAL_SEQUENCE)?),
        entity,
        size_id: fallback.size_id,
        rate: fallback.rate,
        amount: fallback.rate,
        backup_amount: fallback.backup_rate,
        started,
        stopped: Some(stopped),
        last_charged: hour_start(started),
    };
    txn.put_record(&interval)?;
    Ok(CloseOutcome::Compensated(interval))
}

/// Maintains billing intervals
#[derive(Clone)]
pub struct UsageLedger {
    store: Store,
    clock: Arc<dyn Clock>,
    config: MeteringConfig,
}

impl UsageLedger {
    pub fn new(store: Store, clock: Arc<dyn Clock>, config: MeteringConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Rates for a virtance on a given size
    pub fn virtance_rates(&self, virtance: &Virtance, size: &Size) -> Rates {
        Rates {
            size_id: Some(size.id),
            rate: size.price,
            backup_rate: if virtance.backup_enabled {
                self.config.backup_rate(size.price)
            } else {
                Decimal::ZERO
            },
        }
    }

    pub fn snapshot_rates(&self) -> Rates {
        Rates {
            size_id: None,
            rate: self.config.snapshot_hourly_rate,
            backup_rate: Decimal::ZERO,
        }
    }

    /// Open an interval now unless one is already open; returns the open one
    pub fn ensure_open_interval(
        &self,
        entity: MeteredEntity,
        rates: &Rates,
    ) -> VirtanceResult<UsageInterval> {
        let now = self.clock.now();
        self.store.write("ensure open interval", |txn| {
            if let Some(opened) = open_in(txn, entity, rates, now)? {
                return Ok(opened);
            }
            open_interval_in(txn, entity)?
                .context(&format!("open interval index for {} is dangling", entity))
        })
    }

    /// Close the entity's open interval now
    pub fn close_interval(
        &self,
        entity: MeteredEntity,
        fallback: &Rates,
    ) -> VirtanceResult<CloseOutcome> {
        let now = self.clock.now();
        self.store
            .write("close interval", |txn| close_in(txn, entity, now, fallback))
    }

    /// Charge the current hour onto the open interval, once
    ///
    /// Returns the updated interval, or `None` when there is no open interval
    /// or the hour was already charged.
    pub fn accrue(
        &self,
        entity: MeteredEntity,
        backup_rate: Decimal,
    ) -> VirtanceResult<Option<UsageInterval>> {
        let hour = hour_start(self.clock.now());
        self.store.write("accrue interval", |txn| {
            let Some(mut interval) = open_interval_in(txn, entity)? else {
                return Ok(None);
            };
            if !charge_hour(&mut interval, hour, backup_rate) {
                return Ok(None);
            }
            txn.put_record(&interval)?;
            Ok(Some(interval))
        })
    }

    pub fn open_interval(&self, entity: MeteredEntity) -> VirtanceResult<Option<UsageInterval>> {
        self.store
            .read("get open interval", |txn| open_interval_in(txn, entity))
    }

    /// All intervals of an entity, oldest first
    pub fn intervals_for(&self, entity: MeteredEntity) -> VirtanceResult<Vec<UsageInterval>> {
        Ok(self
            .store
            .list::<UsageInterval>()?
            .into_iter()
            .filter(|i| i.entity == entity)
            .collect())
    }

    /// Hourly sweep over every billable entity
    pub fn sweep(&self, now: DateTime<Utc>) -> VirtanceResult<SweepReport> {
        let current_month = month_start(now);
        let current_hour = hour_start(now);
        let rollover = is_rollover_hour(now);

        self.store.write("metering sweep", |txn| {
            let mut report = SweepReport {
                rolled_over: rollover,
                ..Default::default()
            };

            let sizes: HashMap<SizeId, Size> = txn
                .scan_records::<Size>()?
                .into_iter()
                .map(|s| (s.id, s))
                .collect();

            let mut billable: Vec<(MeteredEntity, Rates)> = Vec::new();
            for virtance in txn.scan_records::<Virtance>()? {
                if !is_billable(&virtance) {
                    continue;
                }
                let Some(size) = sizes.get(&virtance.size_id) else {
                    warn!(virtance_id = virtance.id.0, "Size missing, not metered");
                    continue;
                };
                billable.push((
                    MeteredEntity::Virtance(virtance.id),
                    self.virtance_rates(&virtance, size),
                ));
            }
            for image in txn.scan_records::<Image>()? {
                if image.kind == ImageKind::Snapshot && !image.is_deleted {
                    billable.push((MeteredEntity::Snapshot(image.id), self.snapshot_rates()));
                }
            }

            for (entity, rates) in &billable {
                match open_interval_in(txn, *entity)? {
                    Some(interval) if interval.started < current_month => {
                        // carried over from an earlier month
                        if !rollover {
                            warn!(entity = %entity, "Month rollover was missed, repairing");
                            report.repaired += 1;
                        }
                        close_in(txn, *entity, previous_month_end(current_month), rates)?;
                        report.closed += 1;
                        let mut fresh = open_in(txn, *entity, rates, current_month)?
                            .ok_or_else(|| VirtanceError::Internal {
                                message: format!("interval for {} reopened concurrently", entity),
                            })?;
                        report.opened += 1;
                        if charge_hour(&mut fresh, current_hour, rates.backup_rate) {
                            txn.put_record(&fresh)?;
                            report.accrued += 1;
                        }
                    }
                    Some(mut interval) => {
                        if charge_hour(&mut interval, current_hour, rates.backup_rate) {
                            txn.put_record(&interval)?;
                            report.accrued += 1;
                        }
                    }
                    None => {
                        let started = if rollover {
                            current_month
                        } else {
                            report.repaired += 1;
                            now - chrono::Duration::hours(1)
                        };
                        if let Some(mut fresh) = open_in(txn, *entity, rates, started)? {
                            report.opened += 1;
                            if charge_hour(&mut fresh, current_hour, rates.backup_rate) {
                                txn.put_record(&fresh)?;
                                report.accrued += 1;
                            }
                        }
                    }
                }
            }

            // intervals of entities that are gone or no longer billable
            for interval in txn.scan_records::<UsageInterval>()? {
                if interval.is_open()
                    && interval.started < current_month
                    && !billable.iter().any(|(e, _)| *e == interval.entity)
                {
                    let fallback = Rates {
                        size_id: interval.size_id,
                        rate: interval.rate,
                        backup_rate: Decimal::ZERO,
                    };
                    close_in(txn, interval.entity, previous_month_end(current_month), &fallback)?;
                    report.closed += 1;
                }
            }

            info!(
                rolled_over = report.rolled_over,
                closed = report.closed,
                opened = report.opened,
                accrued = report.accrued,
                repaired = report.repaired,
                "Metering sweep finished"
            );
            Ok(report)
        })
    }
}

/// Charge `hour` onto an open interval unless it was already charged
fn charge_hour(interval: &mut UsageInterval, hour: DateTime<Utc>, backup_rate: Decimal) -> bool {
    if interval.last_charged >= hour {
        return false;
    }
    interval.amount += interval.rate;
    interval.backup_amount += backup_rate;
    interval.last_charged = hour;
    true
}
