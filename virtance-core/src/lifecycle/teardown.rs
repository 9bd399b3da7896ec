//! DELETE

use tracing::{debug, info};

use super::{Abort, Step, VirtanceOrchestrator};
use crate::{
    cascade::CascadeOutcome,
    event_lease::{complete_in, LeaseToken},
    ip_allocator::release_virtance_addresses,
    metering::{close_in, MeteredEntity},
    types::{Size, Virtance},
};

impl VirtanceOrchestrator {
    /// Sever dependencies, destroy the domain, then drop local state
    ///
    /// Nothing local is removed unless the compute node confirmed the delete.
    /// Links severed before a failure stay severed; a retry skips them.
    pub(super) async fn delete(&self, token: &LeaseToken, virtance: &Virtance) -> Step<Option<String>> {
        let size: Size = self.store.require(virtance.size_id.0)?;
        let rates = self.ledger.virtance_rates(virtance, &size);

        let severed = match self.cascade.sever_all(virtance).await? {
            CascadeOutcome::Completed { severed } => severed,
            CascadeOutcome::Failed { step, detail, .. } => {
                return Err(Abort::Cascade { step, detail });
            }
        };
        debug!(virtance_id = virtance.id.0, severed = severed.len(), "Dependencies severed");

        let placed = virtance.compute_id.is_some();
        if placed {
            self.gateway(virtance)?.delete_virtance(virtance.id).await?;
        }

        let now = self.clock.now();

        let released = self.store.write("delete virtance", |txn| {
            let released = release_virtance_addresses(txn, virtance.id)?;
            // a virtance that never reached a node was never billed
            if placed {
                close_in(txn, MeteredEntity::Virtance(virtance.id), now, &rates)?;
            }
            txn.remove_record::<Virtance>(virtance.id.0)?;
            complete_in(txn, token)?;
            Ok(released)
        })?;

        info!(
            virtance_id = virtance.id.0,
            released,
            "Virtance deleted"
        );
        Ok(Some(format!(
            "{} links severed, {} addresses released",
            severed.len(),
            released
        )))
    }
}
