//! Append-only error and history logs
//!
//! Entries are only ever appended; nothing updates or removes them. Each one
//! is keyed by the entity it concerns, the operation name, and the time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{
    abstractions::time::Clock,
    error::VirtanceResult,
    storage::{DatabaseTransaction, Store},
    types::{FirewallId, FloatingIpId, ImageId, LoadBalancerId, LogEntryId, VirtanceId},
};

const ERROR_SEQUENCE: &str = "error_log";
const HISTORY_SEQUENCE: &str = "history_log";

/// The entity a log entry is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum EntityRef {
    Virtance(VirtanceId),
    Image(ImageId),
    Firewall(FirewallId),
    FloatingIp(FloatingIpId),
    LoadBalancer(LoadBalancerId),
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityRef::Virtance(id) => id.fmt(f),
            EntityRef::Image(id) => id.fmt(f),
            EntityRef::Firewall(id) => id.fmt(f),
            EntityRef::FloatingIp(id) => id.fmt(f),
            EntityRef::LoadBalancer(id) => id.fmt(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub id: LogEntryId,
    pub entity: EntityRef,
    pub operation: String,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: LogEntryId,
    pub entity: EntityRef,
    pub operation: String,
    pub message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct OrchestrationLog {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl OrchestrationLog {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Record a failed operation
    pub fn error(
        &self,
        entity: EntityRef,
        operation: &str,
        message: impl Into<String>,
    ) -> VirtanceResult<()> {
        let message = message.into();
        error!(entity = %entity, operation, "{}", message);
        let now = self.clock.now();
        self.store
            .write("append error", |txn| append_error(txn, entity, operation, &message, now))
    }

    /// Record a completed operation
    pub fn history(
        &self,
        entity: EntityRef,
        operation: &str,
        message: Option<String>,
    ) -> VirtanceResult<()> {
        let now = self.clock.now();
        self.store.write("append history", |txn| {
            let entry = HistoryEntry {
                id: LogEntryId(txn.next_id(HISTORY_SEQUENCE)?),
                entity,
                operation: operation.to_string(),
                message: message.clone(),
                recorded_at: now,
            };
            txn.put_record(&entry)
        })
    }

    /// Errors recorded against an entity, oldest first
    pub fn errors_for(&self, entity: EntityRef) -> VirtanceResult<Vec<ErrorEntry>> {
        Ok(self
            .store
            .list::<ErrorEntry>()?
            .into_iter()
            .filter(|e| e.entity == entity)
            .collect())
    }

    pub fn history_for(&self, entity: EntityRef) -> VirtanceResult<Vec<HistoryEntry>> {
        Ok(self
            .store
            .list::<HistoryEntry>()?
            .into_iter()
            .filter(|e| e.entity == entity)
            .collect())
    }
}

fn append_error(
    txn: &DatabaseTransaction,
    entity: EntityRef,
    operation: &str,
    message: &str,
    now: DateTime<Utc>,
) -> VirtanceResult<()> {
    let entry = ErrorEntry {
        id: LogEntryId(txn.next_id(ERROR_SEQUENCE)?),
        entity,
        operation: operation.to_string(),
        message: message.to_string(),
        recorded_at: now,
    };
    txn.put_record(&entry)
}
