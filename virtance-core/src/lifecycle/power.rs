//! Power actions and the shutdown escalation

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{Step, VirtanceOrchestrator};
use crate::{
    compute_gateway::{ComputeGateway, RemoteAction},
    error::VirtanceResult,
    event_lease::LeaseToken,
    types::{PowerAction, PowerState, Virtance, VirtanceId},
};

/// How a shutdown ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShutdownResult {
    /// The guest reported shutoff within the poll budget
    Clean { polls: u32 },
    /// The poll budget ran out and a forced power off succeeded
    Forced,
}

impl VirtanceOrchestrator {
    pub(super) async fn power(
        &self,
        token: &LeaseToken,
        virtance: &Virtance,
        action: PowerAction,
    ) -> Step<Option<String>> {
        let gateway = self.gateway(virtance)?;

        let (power, note) = match action {
            PowerAction::PowerOn => {
                gateway.action(virtance.id, RemoteAction::PowerOn).await?;
                (PowerState::Active, None)
            }
            PowerAction::PowerOff => {
                gateway.action(virtance.id, RemoteAction::PowerOff).await?;
                (PowerState::Inactive, None)
            }
            PowerAction::PowerCycle => {
                gateway.action(virtance.id, RemoteAction::PowerCycle).await?;
                (PowerState::Active, None)
            }
            PowerAction::Shutdown => {
                let result = self.shutdown(&gateway, virtance.id).await?;
                (PowerState::Inactive, Some(describe(result)))
            }
            PowerAction::Reboot => {
                let result = self.shutdown(&gateway, virtance.id).await?;
                if let Err(failure) = gateway.action(virtance.id, RemoteAction::PowerOn).await {
                    // it is off now, whatever happens to the event
                    self.set_power(virtance.id, PowerState::Inactive)?;
                    return Err(failure.into());
                }
                (PowerState::Active, Some(describe(result)))
            }
        };

        self.finish_with_power(token, power)?;
        Ok(note)
    }

    /// Ask the guest to shut down and wait for it
    ///
    /// Polls `status` up to `shutdown_poll_attempts` times, sleeping
    /// `shutdown_poll_interval` between polls. If the guest never reports
    /// shutoff, exactly one forced power off is sent and its result decides
    /// the outcome.
    pub(crate) async fn shutdown(
        &self,
        gateway: &Arc<dyn ComputeGateway>,
        id: VirtanceId,
    ) -> Step<ShutdownResult> {
        gateway.action(id, RemoteAction::Shutdown).await?;

        for poll in 1..=self.config.shutdown_poll_attempts {
            match gateway.status(id).await {
                Ok(status) if status.is_shutoff() => {
                    debug!(virtance_id = id.0, polls = poll, "Guest shut off");
                    return Ok(ShutdownResult::Clean { polls: poll });
                }
                Ok(status) => debug!(virtance_id = id.0, ?status, "Waiting for shutoff"),
                Err(failure) => debug!(virtance_id = id.0, "Status poll failed: {}", failure),
            }
            self.clock.sleep(self.config.shutdown_poll_interval).await;
        }

        warn!(
            virtance_id = id.0,
            attempts = self.config.shutdown_poll_attempts,
            "Guest did not shut down, forcing power off"
        );
        gateway.action(id, RemoteAction::PowerOff).await?;
        info!(virtance_id = id.0, "Forced power off succeeded");
        Ok(ShutdownResult::Forced)
    }

    fn set_power(&self, id: VirtanceId, power: PowerState) -> VirtanceResult<()> {
        self.store.write("set power state", |txn| {
            let mut virtance: Virtance = txn.require_record(id.0)?;
            virtance.power = power;
            txn.put_record(&virtance)
        })
    }
}

fn describe(result: ShutdownResult) -> String {
    match result {
        ShutdownResult::Clean { polls } => format!("clean shutdown after {} polls", polls),
        ShutdownResult::Forced => "forced power off".to_string(),
    }
}
