//! Scheduled sweepers
//!
//! Two jobs run on fixed intervals, independent of user operations:
//! - metering: the hourly [`UsageLedger::sweep`] over virtances and snapshots
//! - backups: starts due backups, at most one per compute node at a time, and
//!   retires the oldest backup above the per-virtance ceiling

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::{
    abstractions::time::Clock,
    common::ResultContext,
    config::BackupConfig,
    error::{VirtanceError, VirtanceResult},
    lifecycle::{ImageRetirement, Operation, VirtanceOrchestrator},
    metering::{SweepReport, UsageLedger},
    storage::Store,
    types::{ComputeNodeId, Image, ImageId, ImageKind, Virtance, VirtanceEvent, VirtanceId},
    work_queue::Dispatcher,
};

pub struct MeteringSweeper {
    ledger: UsageLedger,
}

impl MeteringSweeper {
    pub fn new(ledger: UsageLedger) -> Self {
        Self { ledger }
    }

    pub fn run_once(&self, now: DateTime<Utc>) -> VirtanceResult<SweepReport> {
        self.ledger.sweep(now)
    }
}

/// What one backup sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupReport {
    pub started: Vec<VirtanceId>,
    pub retired: Vec<ImageId>,
    /// Virtances passed over because their node already runs a backup
    pub deferred: usize,
}

pub struct BackupSweeper {
    store: Store,
    orchestrator: Arc<VirtanceOrchestrator>,
    dispatcher: Dispatcher,
    config: BackupConfig,
}

impl BackupSweeper {
    pub fn new(
        store: Store,
        orchestrator: Arc<VirtanceOrchestrator>,
        dispatcher: Dispatcher,
        config: BackupConfig,
    ) -> Self {
        Self {
            store,
            orchestrator,
            dispatcher,
            config,
        }
    }

    /// Live backups of each virtance, newest first
    fn backups_of(&self, images: &[Image], virtance_id: VirtanceId) -> Vec<Image> {
        let mut backups: Vec<Image> = images
            .iter()
            .filter(|i| i.kind == ImageKind::Backup && !i.is_deleted && i.source == Some(virtance_id))
            .cloned()
            .collect();
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        backups
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> VirtanceResult<BackupReport> {
        let mut virtances: Vec<Virtance> = self
            .store
            .list::<Virtance>()?
            .into_iter()
            .filter(|v| v.backup_enabled)
            .collect();
        virtances.sort_by_key(|v| v.id);
        let images: Vec<Image> = self.store.list()?;

        let mut busy_nodes: HashSet<ComputeNodeId> = virtances
            .iter()
            .filter(|v| v.event == Some(VirtanceEvent::Backup))
            .filter_map(|v| v.compute_id)
            .collect();

        let period = chrono::Duration::days(i64::from(self.config.period_days));
        let mut report = BackupReport::default();

        for virtance in &virtances {
            let Some(node) = virtance.compute_id else {
                continue;
            };
            if busy_nodes.contains(&node) {
                report.deferred += 1;
                continue;
            }

            let backups = self.backups_of(&images, virtance.id);
            let due = match backups.first() {
                None => true,
                Some(newest) => now - newest.created_at >= period,
            };

            if due {
                match self.dispatcher.submit(virtance.id, Operation::Backup) {
                    Ok(()) => {
                        busy_nodes.insert(node);
                        report.started.push(virtance.id);
                    }
                    Err(VirtanceError::Busy { in_flight, .. }) => {
                        debug!(virtance_id = virtance.id.0, %in_flight, "Backup due but virtance busy");
                    }
                    Err(e) => return Err(e),
                }
            }

            if backups.len() > self.config.max_backups {
                if let Some(oldest) = backups.last() {
                    match self.orchestrator.retire_image(oldest.id).await? {
                        ImageRetirement::Retired => report.retired.push(oldest.id),
                        ImageRetirement::Failed { region, .. } => {
                            warn!(image = oldest.id.0, %region, "Backup retirement failed");
                        }
                    }
                }
            }
        }

        info!(
            started = report.started.len(),
            retired = report.retired.len(),
            deferred = report.deferred,
            "Backup sweep finished"
        );
        Ok(report)
    }
}

/// Runs both sweepers on their intervals
pub struct SweeperService {
    metering: Arc<MeteringSweeper>,
    backups: Arc<BackupSweeper>,
    clock: Arc<dyn Clock>,
    metering_interval: Duration,
    backup_interval: Duration,
    handles: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for SweeperService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweeperService")
            .field("metering_interval", &self.metering_interval)
            .field("backup_interval", &self.backup_interval)
            .field("running", &self.is_running())
            .finish()
    }
}

impl SweeperService {
    pub fn new(
        metering: MeteringSweeper,
        backups: BackupSweeper,
        clock: Arc<dyn Clock>,
        metering_interval: Duration,
        backup_interval: Duration,
    ) -> Self {
        Self {
            metering: Arc::new(metering),
            backups: Arc::new(backups),
            clock,
            metering_interval,
            backup_interval,
            handles: Vec::new(),
        }
    }

    pub fn start(&mut self) {
        if self.is_running() {
            warn!("SweeperService is already running");
            return;
        }

        let metering = self.metering.clone();
        let clock = self.clock.clone();
        let period = self.metering_interval;
        self.handles.push(tokio::spawn(async move {
            info!("Starting metering sweeper with interval: {:?}", period);
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                let _ = metering.run_once(clock.now()).log_error("Metering sweep failed");
            }
        }));

        let backups = self.backups.clone();
        let clock = self.clock.clone();
        let period = self.backup_interval;
        self.handles.push(tokio::spawn(async move {
            info!("Starting backup sweeper with interval: {:?}", period);
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                let _ = backups.run_once(clock.now()).await.log_error("Backup sweep failed");
            }
        }));

        info!("SweeperService started");
    }

    pub fn stop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        info!("SweeperService stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    /// Run both sweeps once, metering first
    pub async fn run_once(&self, now: DateTime<Utc>) -> VirtanceResult<(SweepReport, BackupReport)> {
        let metering = self.metering.run_once(now)?;
        let backups = self.backups.run_once(now).await?;
        Ok((metering, backups))
    }
}

impl Drop for SweeperService {
    fn drop(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}
