//! Virtance lifecycle orchestrator
//!
//! Drives one virtance through one operation end to end. A run claims the
//! virtance's event lease, resolves what the operation needs, calls the
//! compute node and, on success, writes the resulting state and clears the
//! event in a single transaction.
//!
//! Outcomes:
//! - a gateway failure is recorded in the error log under the operation name
//!   and leaves the event set for retry
//! - a missing compute node or address aborts before any remote call
//! - storage and data-integrity errors propagate to the caller

mod power;
mod provision;
mod storage_ops;
mod teardown;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha_crypt::{sha512_simple, Sha512Params};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    abstractions::time::Clock,
    cascade::{CascadeStep, DependencyCoordinator},
    compute_gateway::{ComputeGateway, GatewayConnector, GatewayFailure},
    config::{OrchestratorConfig, VirtanceConfig},
    error::{VirtanceError, VirtanceResult},
    event_lease::{complete_in, EventLeases, LeaseToken},
    ip_allocator::AddressAllocator,
    metering::UsageLedger,
    notifier::Notifier,
    orchestration_log::{EntityRef, OrchestrationLog},
    placement::ComputeSelector,
    storage::{DatabaseTransaction, Store},
    types::{
        ComputeNode, ImageId, PowerAction, PowerState, SizeId, Virtance, VirtanceEvent,
        VirtanceId,
    },
};

pub use storage_ops::ImageRetirement;

/// An operation requested for one virtance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "operation")]
pub enum Operation {
    Create { password: Option<String> },
    Rebuild,
    Power { action: PowerAction },
    Resize { size_id: SizeId },
    Snapshot { display_name: String },
    Backup,
    Restore { image_id: ImageId },
    ResetPassword { password: Option<String> },
    EnableRecoveryMode,
    DisableRecoveryMode,
    DisableBackups,
    Delete,
}

impl Operation {
    /// Event marking this operation as in flight
    pub fn event(&self) -> VirtanceEvent {
        match self {
            Operation::Create { .. } => VirtanceEvent::Create,
            Operation::Rebuild => VirtanceEvent::Rebuild,
            Operation::Power { action } => action.event(),
            Operation::Resize { .. } => VirtanceEvent::Resize,
            Operation::Snapshot { .. } => VirtanceEvent::Snapshot,
            Operation::Backup => VirtanceEvent::Backup,
            Operation::Restore { .. } => VirtanceEvent::Restore,
            Operation::ResetPassword { .. } => VirtanceEvent::ResetPassword,
            Operation::EnableRecoveryMode => VirtanceEvent::EnableRecoveryMode,
            Operation::DisableRecoveryMode => VirtanceEvent::DisableRecoveryMode,
            Operation::DisableBackups => VirtanceEvent::DisableBackups,
            Operation::Delete => VirtanceEvent::Delete,
        }
    }

    /// Tag used in the error and history logs
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "create",
            Operation::Rebuild => "rebuild",
            Operation::Power { action } => action.as_str(),
            Operation::Resize { .. } => "resize",
            Operation::Snapshot { .. } => "snapshot",
            Operation::Backup => "backup",
            Operation::Restore { .. } => "restore",
            Operation::ResetPassword { .. } => "reset_password",
            Operation::EnableRecoveryMode => "enable_recovery_mode",
            Operation::DisableRecoveryMode => "disable_recovery_mode",
            Operation::DisableBackups => "disable_backups",
            Operation::Delete => "delete",
        }
    }
}

/// A queued unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationUnit {
    pub virtance_id: VirtanceId,
    pub operation: Operation,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    /// State written and event cleared
    Completed,
    /// The compute node reported an error; event left set
    Failed { detail: String },
    /// A compute node or address could not be allocated; nothing remote happened
    NotAvailable { resource: String },
    /// Another operation holds the virtance
    Busy { in_flight: VirtanceEvent },
}

impl OperationOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, OperationOutcome::Completed)
    }
}

/// Why an operation stopped before completing
#[derive(Debug)]
pub(crate) enum Abort {
    Remote(GatewayFailure),
    /// Cascade step failed; already logged against both ends of the link
    Cascade { step: CascadeStep, detail: String },
    NotAvailable(String),
    Fatal(VirtanceError),
}

impl From<VirtanceError> for Abort {
    fn from(err: VirtanceError) -> Self {
        Abort::Fatal(err)
    }
}

impl From<GatewayFailure> for Abort {
    fn from(failure: GatewayFailure) -> Self {
        Abort::Remote(failure)
    }
}

pub(crate) type Step<T = ()> = Result<T, Abort>;

#[derive(Clone)]
pub struct VirtanceOrchestrator {
    store: Store,
    config: OrchestratorConfig,
    clock: Arc<dyn Clock>,
    connector: Arc<dyn GatewayConnector>,
    selector: Arc<dyn ComputeSelector>,
    notifier: Arc<dyn Notifier>,
    allocator: AddressAllocator,
    ledger: UsageLedger,
    leases: EventLeases,
    log: OrchestrationLog,
    cascade: DependencyCoordinator,
}

impl VirtanceOrchestrator {
    pub fn new(
        store: Store,
        config: &VirtanceConfig,
        clock: Arc<dyn Clock>,
        connector: Arc<dyn GatewayConnector>,
        selector: Arc<dyn ComputeSelector>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let log = OrchestrationLog::new(store.clone(), clock.clone());
        Self {
            allocator: AddressAllocator::new(store.clone(), clock.clone()),
            ledger: UsageLedger::new(store.clone(), clock.clone(), config.metering.clone()),
            leases: EventLeases::new(store.clone(), clock.clone(), config.orchestrator.lease_ttl),
            cascade: DependencyCoordinator::new(store.clone(), connector.clone(), log.clone()),
            log,
            store,
            config: config.orchestrator.clone(),
            clock,
            connector,
            selector,
            notifier,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn allocator(&self) -> &AddressAllocator {
        &self.allocator
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    pub fn leases(&self) -> &EventLeases {
        &self.leases
    }

    pub fn log(&self) -> &OrchestrationLog {
        &self.log
    }

    pub fn cascade(&self) -> &DependencyCoordinator {
        &self.cascade
    }

    /// Run one operation to completion or failure
    pub async fn run(
        &self,
        virtance_id: VirtanceId,
        operation: &Operation,
    ) -> VirtanceResult<OperationOutcome> {
        let token = match self.leases.claim(virtance_id, operation.event()) {
            Ok(token) => token,
            Err(VirtanceError::Busy { in_flight, .. }) => {
                warn!(
                    virtance_id = virtance_id.0,
                    operation = operation.name(),
                    %in_flight,
                    "Virtance busy, not running"
                );
                return Ok(OperationOutcome::Busy { in_flight });
            }
            Err(e) => return Err(e),
        };

        let span = info_span!(
            "orchestrate",
            virtance_id = virtance_id.0,
            operation = operation.name()
        );
        let result = self.execute(&token, operation).instrument(span).await;
        let entity = EntityRef::Virtance(virtance_id);

        match result {
            Ok(note) => {
                self.log.history(entity, operation.name(), note)?;
                info!(virtance_id = virtance_id.0, operation = operation.name(), "Operation completed");
                Ok(OperationOutcome::Completed)
            }
            Err(Abort::Remote(failure)) => {
                self.log.error(entity, operation.name(), failure.detail.clone())?;
                self.leases.fail(&token)?;
                Ok(OperationOutcome::Failed {
                    detail: failure.detail,
                })
            }
            Err(Abort::Cascade { step, detail }) => {
                warn!(
                    virtance_id = virtance_id.0,
                    step = step.operation(),
                    "{} stopped by dependency cascade", operation.name()
                );
                self.leases.fail(&token)?;
                Ok(OperationOutcome::Failed { detail })
            }
            Err(Abort::NotAvailable(resource)) => {
                warn!(
                    virtance_id = virtance_id.0,
                    operation = operation.name(),
                    "No {} available", resource
                );
                self.leases.fail(&token)?;
                Ok(OperationOutcome::NotAvailable { resource })
            }
            Err(Abort::Fatal(err)) => {
                error!(
                    virtance_id = virtance_id.0,
                    operation = operation.name(),
                    "Operation aborted: {}", err
                );
                if let Err(lease_err) = self.leases.fail(&token) {
                    warn!(virtance_id = virtance_id.0, "Failed to mark lease failed: {}", lease_err);
                }
                Err(err)
            }
        }
    }

    async fn execute(&self, token: &LeaseToken, operation: &Operation) -> Step<Option<String>> {
        let virtance: Virtance = self.store.require(token.virtance_id.0)?;
        match operation {
            Operation::Create { password } => self.create(token, virtance, password.as_deref()).await,
            Operation::Rebuild => self.rebuild(token, &virtance).await,
            Operation::Power { action } => self.power(token, &virtance, *action).await,
            Operation::Resize { size_id } => self.resize(token, &virtance, *size_id).await,
            Operation::Snapshot { display_name } => {
                self.snapshot(token, &virtance, Some(display_name)).await
            }
            Operation::Backup => self.snapshot(token, &virtance, None).await,
            Operation::Restore { image_id } => self.restore(token, &virtance, *image_id).await,
            Operation::ResetPassword { password } => {
                self.reset_password(token, &virtance, password.as_deref()).await
            }
            Operation::EnableRecoveryMode => self.enable_recovery_mode(token, &virtance).await,
            Operation::DisableRecoveryMode => self.disable_recovery_mode(token, &virtance).await,
            Operation::DisableBackups => self.disable_backups(token, &virtance).await,
            Operation::Delete => self.delete(token, &virtance).await,
        }
    }

    /// Gateway of the node hosting an already placed virtance
    fn gateway(&self, virtance: &Virtance) -> Step<Arc<dyn ComputeGateway>> {
        let node_id = virtance.compute_id.ok_or_else(|| VirtanceError::InvalidOperation {
            operation: "connect".to_string(),
            reason: format!("{} has no compute node", virtance.id),
        })?;
        let node: ComputeNode = self.store.require(node_id.0)?;
        Ok(self.connector.connect(&node)?)
    }

    /// Write the operation's result and clear its event in one transaction
    fn finish<F>(&self, token: &LeaseToken, f: F) -> VirtanceResult<()>
    where
        F: FnOnce(&DatabaseTransaction, &mut Virtance) -> VirtanceResult<()>,
    {
        self.store.write(token.event.as_str(), |txn| {
            let mut virtance: Virtance = txn.require_record(token.virtance_id.0)?;
            f(txn, &mut virtance)?;
            txn.put_record(&virtance)?;
            complete_in(txn, token)
        })
    }

    /// Clear the event and set the power state
    fn finish_with_power(&self, token: &LeaseToken, power: PowerState) -> VirtanceResult<()> {
        self.finish(token, |_, virtance| {
            virtance.power = power;
            Ok(())
        })
    }

    /// sha512-crypt hash of `password`, or of a random one
    fn hash_password(&self, password: Option<&str>) -> VirtanceResult<String> {
        let generated;
        let password = match password {
            Some(p) => p,
            None => {
                generated = Uuid::new_v4().simple().to_string()[..20].to_string();
                &generated
            }
        };
        let params = Sha512Params::new(self.config.password_hash_rounds as usize).map_err(|e| {
            VirtanceError::PasswordHash {
                message: format!("{:?}", e),
            }
        })?;
        sha512_simple(password, &params).map_err(|e| VirtanceError::PasswordHash {
            message: format!("{:?}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_events_and_names() {
        let reboot = Operation::Power {
            action: PowerAction::Reboot,
        };
        assert_eq!(reboot.event(), VirtanceEvent::Reboot);
        assert_eq!(reboot.name(), "reboot");
        assert_eq!(Operation::Backup.event(), VirtanceEvent::Backup);
        assert_eq!(Operation::DisableBackups.name(), "disable_backups");
    }

    #[test]
    fn test_unit_encoding() {
        let unit = OrchestrationUnit {
            virtance_id: VirtanceId(4),
            operation: Operation::Resize { size_id: SizeId(2) },
        };
        let json = serde_json::to_value(&unit).unwrap();
        assert_eq!(json["operation"]["operation"], "resize");
        let back: OrchestrationUnit = serde_json::from_value(json).unwrap();
        assert_eq!(back, unit);
    }
}
