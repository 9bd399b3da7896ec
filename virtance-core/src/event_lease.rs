//! Per-virtance event lease
//!
//! `Virtance.event` names the one operation in flight. The lease backing it
//! turns the old read-then-write marker into conditional updates inside a
//! single write transaction:
//!
//! - `request` marks the event when nothing else is in flight (`Pending`)
//! - `claim` moves it to `Running` with an expiry; an expired `Running` lease
//!   for the same event can be claimed again after a runner crash
//! - `complete` clears the event, `fail` keeps it set for retry
//! - `release` is the operator's out-of-band reset
//!
//! A different event is always refused with [`VirtanceError::Busy`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    abstractions::time::Clock,
    error::{VirtanceError, VirtanceResult},
    storage::{DatabaseTransaction, Store},
    types::{Virtance, VirtanceEvent, VirtanceId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum LeaseState {
    Pending,
    Running { expires_at: DateTime<Utc> },
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLease {
    pub virtance_id: VirtanceId,
    pub event: VirtanceEvent,
    pub token: Uuid,
    pub state: LeaseState,
    pub updated_at: DateTime<Utc>,
}

impl EventLease {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, LeaseState::Running { expires_at } if expires_at > now)
    }
}

/// Proof of a successful claim, needed to complete or fail the operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    pub virtance_id: VirtanceId,
    pub event: VirtanceEvent,
    token: Uuid,
}

#[derive(Clone)]
pub struct EventLeases {
    store: Store,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
}

fn busy(virtance_id: VirtanceId, in_flight: VirtanceEvent) -> VirtanceError {
    VirtanceError::Busy {
        virtance_id: virtance_id.0,
        in_flight,
    }
}

impl EventLeases {
    pub fn new(store: Store, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            store,
            clock,
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::minutes(30)),
        }
    }

    /// Mark `event` as requested for a virtance
    ///
    /// Requesting the event that already failed puts it back to `Pending`.
    pub fn request(&self, virtance_id: VirtanceId, event: VirtanceEvent) -> VirtanceResult<()> {
        let now = self.clock.now();
        self.store.write("request event", |txn| {
            let mut virtance: Virtance = txn.require_record(virtance_id.0)?;

            if let Some(lease) = txn.get_record::<EventLease>(virtance_id.0)? {
                if lease.event != event || lease.is_live(now) {
                    return Err(busy(virtance_id, lease.event));
                }
            } else if let Some(current) = virtance.event {
                if current != event {
                    return Err(busy(virtance_id, current));
                }
            }

            txn.put_record(&EventLease {
                virtance_id,
                event,
                token: Uuid::new_v4(),
                state: LeaseState::Pending,
                updated_at: now,
            })?;
            virtance.event = Some(event);
            txn.put_record(&virtance)?;
            debug!(virtance_id = virtance_id.0, %event, "Event requested");
            Ok(())
        })
    }

    /// Take the lease for running `event`
    pub fn claim(&self, virtance_id: VirtanceId, event: VirtanceEvent) -> VirtanceResult<LeaseToken> {
        let now = self.clock.now();
        let expires_at = now + self.ttl;
        self.store.write("claim event", |txn| {
            let mut virtance: Virtance = txn.require_record(virtance_id.0)?;

            match txn.get_record::<EventLease>(virtance_id.0)? {
                Some(lease) if lease.event != event => return Err(busy(virtance_id, lease.event)),
                Some(lease) if lease.is_live(now) => return Err(busy(virtance_id, lease.event)),
                Some(lease) => {
                    if let LeaseState::Running { .. } = lease.state {
                        warn!(
                            virtance_id = virtance_id.0,
                            %event,
                            "Taking over expired lease"
                        );
                    }
                }
                None => {
                    if let Some(current) = virtance.event {
                        if current != event {
                            return Err(busy(virtance_id, current));
                        }
                    }
                }
            }

            let token = Uuid::new_v4();
            txn.put_record(&EventLease {
                virtance_id,
                event,
                token,
                state: LeaseState::Running { expires_at },
                updated_at: now,
            })?;
            if virtance.event != Some(event) {
                virtance.event = Some(event);
                txn.put_record(&virtance)?;
            }
            Ok(LeaseToken {
                virtance_id,
                event,
                token,
            })
        })
    }

    /// Clear the event after success
    pub fn complete(&self, token: &LeaseToken) -> VirtanceResult<()> {
        self.store.write("complete event", |txn| complete_in(txn, token))
    }

    /// Keep the event set after a failure
    pub fn fail(&self, token: &LeaseToken) -> VirtanceResult<()> {
        let now = self.clock.now();
        self.store.write("fail event", |txn| {
            let mut lease = held_lease(txn, token)?;
            lease.state = LeaseState::Failed;
            lease.updated_at = now;
            txn.put_record(&lease)
        })
    }

    /// Operator reset of a stuck event
    pub fn release(&self, virtance_id: VirtanceId) -> VirtanceResult<Option<EventLease>> {
        self.store.write("release event", |txn| {
            let lease = txn.get_record::<EventLease>(virtance_id.0)?;
            txn.remove_record::<EventLease>(virtance_id.0)?;
            if let Some(mut virtance) = txn.get_record::<Virtance>(virtance_id.0)? {
                if virtance.event.take().is_some() {
                    txn.put_record(&virtance)?;
                }
            }
            info!(virtance_id = virtance_id.0, "Event released by operator");
            Ok(lease)
        })
    }

    pub fn current(&self, virtance_id: VirtanceId) -> VirtanceResult<Option<EventLease>> {
        self.store.get(virtance_id.0)
    }
}

fn held_lease(txn: &DatabaseTransaction, token: &LeaseToken) -> VirtanceResult<EventLease> {
    match txn.get_record::<EventLease>(token.virtance_id.0)? {
        Some(lease) if lease.token == token.token => Ok(lease),
        _ => Err(VirtanceError::InvalidOperation {
            operation: token.event.to_string(),
            reason: format!("lease on virtance {} is no longer held", token.virtance_id.0),
        }),
    }
}

/// Clear the event inside an existing write transaction
///
/// The virtance may already be gone when the operation deleted it.
pub(crate) fn complete_in(txn: &DatabaseTransaction, token: &LeaseToken) -> VirtanceResult<()> {
    held_lease(txn, token)?;
    txn.remove_record::<EventLease>(token.virtance_id.0)?;
    if let Some(mut virtance) = txn.get_record::<Virtance>(token.virtance_id.0)? {
        if virtance.event == Some(token.event) {
            virtance.event = None;
            txn.put_record(&virtance)?;
        }
    }
    Ok(())
}
