//! Worker pool executing orchestration units
//!
//! Units for different virtances run concurrently, bounded by a semaphore.
//! Units for the same virtance are kept apart by the event lease, not by the
//! queue.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    error::{VirtanceError, VirtanceResult},
    event_lease::EventLeases,
    lifecycle::{Operation, OperationOutcome, OrchestrationUnit, VirtanceOrchestrator},
    types::VirtanceId,
};

/// Accepts operations and queues them for the worker pool
#[derive(Clone)]
pub struct Dispatcher {
    leases: EventLeases,
    sender: mpsc::UnboundedSender<OrchestrationUnit>,
}

impl Dispatcher {
    pub fn new(leases: EventLeases, sender: mpsc::UnboundedSender<OrchestrationUnit>) -> Self {
        Self { leases, sender }
    }

    /// Mark the operation's event, then queue it
    ///
    /// Fails with `Busy` when another operation holds the virtance. Once this
    /// returns `Ok` the operation is visible as in flight.
    pub fn submit(&self, virtance_id: VirtanceId, operation: Operation) -> VirtanceResult<()> {
        let event = operation.event();
        self.leases.request(virtance_id, event)?;

        let unit = OrchestrationUnit {
            virtance_id,
            operation,
        };
        if self.sender.send(unit).is_err() {
            if let Err(e) = self.leases.release(virtance_id) {
                warn!(virtance_id = virtance_id.0, "Failed to release unqueued event: {}", e);
            }
            return Err(VirtanceError::Internal {
                message: "worker pool is not running".to_string(),
            });
        }
        debug!(virtance_id = virtance_id.0, %event, "Operation queued");
        Ok(())
    }
}

/// Drains the queue, running each unit as its own task
pub struct WorkerPool {
    handle: JoinHandle<()>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("handle", &"<JoinHandle>")
            .finish()
    }
}

impl WorkerPool {
    /// Start the pool and return the dispatcher feeding it
    ///
    /// The pool stops once every dispatcher clone is dropped and the units
    /// already accepted have finished.
    pub fn start(orchestrator: Arc<VirtanceOrchestrator>, concurrency: usize) -> (Self, Dispatcher) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(orchestrator.leases().clone(), sender);
        let handle = tokio::spawn(drain(orchestrator, receiver, concurrency.max(1)));
        info!(concurrency, "Worker pool started");
        (Self { handle }, dispatcher)
    }

    /// Wait for the pool to finish
    pub async fn join(self) -> VirtanceResult<()> {
        self.handle.await.map_err(|e| VirtanceError::Internal {
            message: format!("worker pool task failed: {}", e),
        })
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

async fn drain(
    orchestrator: Arc<VirtanceOrchestrator>,
    mut receiver: mpsc::UnboundedReceiver<OrchestrationUnit>,
    concurrency: usize,
) {
    let permits = Arc::new(Semaphore::new(concurrency));

    while let Some(unit) = receiver.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match orchestrator.run(unit.virtance_id, &unit.operation).await {
                Ok(OperationOutcome::Completed) => {}
                Ok(outcome) => debug!(
                    virtance_id = unit.virtance_id.0,
                    operation = unit.operation.name(),
                    ?outcome,
                    "Operation did not complete"
                ),
                Err(e) => error!(
                    virtance_id = unit.virtance_id.0,
                    operation = unit.operation.name(),
                    "Orchestration failed: {}", e
                ),
            }
        });
    }

    // wait for units still running
    let _ = permits.acquire_many(concurrency as u32).await;
    info!("Worker pool drained");
}
