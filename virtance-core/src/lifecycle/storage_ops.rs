//! Operations on a virtance's disk, size and media, and image retirement

use std::collections::BTreeSet;

use rand::seq::SliceRandom;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Abort, Step, VirtanceOrchestrator};
use crate::{
    compute_gateway::{GatewayFailure, MediaSlot},
    error::{VirtanceError, VirtanceResult},
    event_lease::{complete_in, LeaseToken},
    metering::{close_in, open_in, MeteredEntity},
    orchestration_log::EntityRef,
    types::{ComputeNode, Image, ImageEvent, ImageId, ImageKind, PowerState, Size, SizeId, Virtance},
};

const IMAGE_SEQUENCE: &str = "image";

/// Result of retiring a snapshot or backup image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRetirement {
    /// Volumes removed from every region and the image soft-deleted
    Retired,
    /// A compute node refused; the image keeps its remaining regions
    Failed { region: String, detail: String },
}

impl VirtanceOrchestrator {
    pub(super) async fn resize(
        &self,
        token: &LeaseToken,
        virtance: &Virtance,
        size_id: SizeId,
    ) -> Step<Option<String>> {
        let old_size: Size = self.store.require(virtance.size_id.0)?;
        let new_size: Size = self.store.require(size_id.0)?;

        self.gateway(virtance)?
            .resize(virtance.id, new_size.vcpu, new_size.memory, new_size.disk)
            .await?;

        let old_rates = self.ledger.virtance_rates(virtance, &old_size);
        let new_rates = self.ledger.virtance_rates(virtance, &new_size);
        let entity = MeteredEntity::Virtance(virtance.id);
        let now = self.clock.now();

        self.finish(token, |txn, stored| {
            stored.power = PowerState::Active;
            stored.size_id = new_size.id;
            close_in(txn, entity, now, &old_rates)?;
            open_in(txn, entity, &new_rates, now)?.ok_or_else(|| VirtanceError::Internal {
                message: format!("interval for {} still open after close", entity),
            })?;
            Ok(())
        })?;

        Ok(Some(format!("{} -> {}", old_size.slug, new_size.slug)))
    }

    /// SNAPSHOT with a display name, BACKUP without
    pub(super) async fn snapshot(
        &self,
        token: &LeaseToken,
        virtance: &Virtance,
        display_name: Option<&String>,
    ) -> Step<Option<String>> {
        let template: Image = self.store.require(virtance.template_id.0)?;
        let (kind, remote_name, image_name) = match display_name {
            Some(display) => {
                let hex = Uuid::new_v4().simple().to_string();
                (ImageKind::Snapshot, hex, display.clone())
            }
            None => {
                let name = format!("backup-{}", Uuid::new_v4().simple());
                (ImageKind::Backup, name.clone(), name)
            }
        };

        let artifact = self.gateway(virtance)?.snapshot(virtance.id, &remote_name).await?;

        let now = self.clock.now();
        let snapshot_rates = self.ledger.snapshot_rates();
        let image_id = self.store.write("record image", |txn| {
            let image = Image {
                id: ImageId(txn.next_id(IMAGE_SEQUENCE)?),
                name: image_name.clone(),
                kind,
                event: None,
                user_id: Some(virtance.user_id),
                source: Some(virtance.id),
                distribution: template.distribution.clone(),
                description: template.description.clone(),
                md5sum: artifact.md5sum.clone(),
                file_name: artifact.file_name.clone(),
                file_size: artifact.size,
                disk_size: artifact.disk_size,
                regions: BTreeSet::from([virtance.region.clone()]),
                created_at: now,
                is_deleted: false,
            };
            txn.put_record(&image)?;
            if kind == ImageKind::Snapshot {
                open_in(txn, MeteredEntity::Snapshot(image.id), &snapshot_rates, now)?;
            }
            complete_in(txn, token)?;
            Ok(image.id)
        })?;

        info!(virtance_id = virtance.id.0, image = image_id.0, "Recorded {:?} image", kind);
        Ok(Some(image_id.to_string()))
    }

    pub(super) async fn restore(
        &self,
        token: &LeaseToken,
        virtance: &Virtance,
        image_id: ImageId,
    ) -> Step<Option<String>> {
        let image: Image = self.store.require(image_id.0)?;
        self.gateway(virtance)?
            .restore(virtance.id, &image.file_name, image.disk_size)
            .await?;

        self.finish(token, |txn, stored| {
            stored.power = PowerState::Active;
            let mut image: Image = txn.require_record(image_id.0)?;
            image.event = None;
            txn.put_record(&image)
        })?;
        Ok(Some(image_id.to_string()))
    }

    pub(super) async fn reset_password(
        &self,
        token: &LeaseToken,
        virtance: &Virtance,
        password: Option<&str>,
    ) -> Step<Option<String>> {
        let hash = self.hash_password(password)?;
        self.gateway(virtance)?.reset_password(virtance.id, &hash).await?;
        self.finish_with_power(token, PowerState::Active)?;
        Ok(None)
    }

    async fn first_media_slot(&self, virtance: &Virtance) -> Step<MediaSlot> {
        let slots = self.gateway(virtance)?.media(virtance.id).await?;
        slots
            .into_iter()
            .next()
            .ok_or_else(|| Abort::Remote(GatewayFailure::new("virtance has no media slot")))
    }

    /// Mount the recovery ISO unless it is already mounted
    pub(super) async fn enable_recovery_mode(
        &self,
        token: &LeaseToken,
        virtance: &Virtance,
    ) -> Step<Option<String>> {
        let iso = &self.config.recovery_iso_name;
        let slot = self.first_media_slot(virtance).await?;
        let mounted = slot.path.as_deref().is_some_and(|p| p.ends_with(iso.as_str()));
        if mounted {
            debug!(virtance_id = virtance.id.0, "Recovery ISO already mounted");
        } else {
            self.gateway(virtance)?
                .mount_media(virtance.id, &slot.dev, iso)
                .await?;
        }

        self.finish(token, |_, stored| {
            stored.power = PowerState::Active;
            stored.recovery_mode = true;
            Ok(())
        })?;
        Ok(None)
    }

    /// Unmount whatever is in the first media slot
    pub(super) async fn disable_recovery_mode(
        &self,
        token: &LeaseToken,
        virtance: &Virtance,
    ) -> Step<Option<String>> {
        let slot = self.first_media_slot(virtance).await?;
        match &slot.path {
            Some(path) => {
                self.gateway(virtance)?
                    .unmount_media(virtance.id, &slot.dev, path)
                    .await?
            }
            None => debug!(virtance_id = virtance.id.0, "No media mounted"),
        }

        self.finish(token, |_, stored| {
            stored.power = PowerState::Active;
            stored.recovery_mode = false;
            Ok(())
        })?;
        Ok(None)
    }

    /// Retire every backup; backups stay enabled unless all of them went
    pub(super) async fn disable_backups(
        &self,
        token: &LeaseToken,
        virtance: &Virtance,
    ) -> Step<Option<String>> {
        let backups: Vec<Image> = self
            .store
            .list::<Image>()?
            .into_iter()
            .filter(|i| i.kind == ImageKind::Backup && !i.is_deleted && i.source == Some(virtance.id))
            .collect();

        let total = backups.len();
        let mut remaining = total;
        for backup in backups {
            if self.retire_image(backup.id).await? == ImageRetirement::Retired {
                remaining -= 1;
            }
        }

        if remaining > 0 {
            return Err(Abort::Remote(GatewayFailure::new(format!(
                "{} of {} backups were not deleted",
                remaining, total
            ))));
        }

        self.finish(token, |_, stored| {
            stored.power = PowerState::Active;
            stored.backup_enabled = false;
            Ok(())
        })?;
        Ok(Some(format!("{} backups retired", total)))
    }

    /// Remove a snapshot or backup from every region holding it
    ///
    /// Each region is handled by the first active node, in random order, that
    /// has a volume named after the image's file. A region where no node has
    /// the volume any more counts as done. The first gateway failure is
    /// logged against the image and stops the retirement; running it again
    /// continues with the regions still listed.
    pub async fn retire_image(&self, image_id: ImageId) -> VirtanceResult<ImageRetirement> {
        let image = self.store.write("mark image deleting", |txn| {
            let mut image: Image = txn.require_record(image_id.0)?;
            image.event = Some(ImageEvent::Delete);
            txn.put_record(&image)?;
            Ok(image)
        })?;
        let operation = match image.kind {
            ImageKind::Snapshot => "delete_image_snapshot",
            ImageKind::Backup => "delete_image_backup",
            _ => {
                return Err(VirtanceError::InvalidOperation {
                    operation: "retire image".to_string(),
                    reason: format!("{} is a template, not a snapshot or backup", image.id),
                })
            }
        };

        let nodes: Vec<ComputeNode> = self.store.list()?;
        for region in &image.regions {
            let mut candidates: Vec<&ComputeNode> = nodes
                .iter()
                .filter(|n| n.active && &n.region == region)
                .collect();
            candidates.shuffle(&mut rand::thread_rng());

            if let Err(failure) = self.delete_volume(&candidates, &image.file_name).await? {
                let detail = format!("region {}: {}", region, failure.detail);
                self.log.error(EntityRef::Image(image.id), operation, detail.clone())?;
                return Ok(ImageRetirement::Failed {
                    region: region.clone(),
                    detail,
                });
            }

            self.store.write("drop image region", |txn| {
                let mut stored: Image = txn.require_record(image_id.0)?;
                stored.regions.remove(region);
                txn.put_record(&stored)
            })?;
        }

        let now = self.clock.now();
        let rates = self.ledger.snapshot_rates();
        self.store.write("retire image", |txn| {
            let mut stored: Image = txn.require_record(image_id.0)?;
            stored.is_deleted = true;
            stored.event = None;
            txn.put_record(&stored)?;
            if stored.kind == ImageKind::Snapshot {
                close_in(txn, MeteredEntity::Snapshot(image_id), now, &rates)?;
            }
            Ok(())
        })?;
        self.log.history(EntityRef::Image(image_id), operation, None)?;
        info!(image = image_id.0, "Image retired");
        Ok(ImageRetirement::Retired)
    }

    /// Delete the volume named `file_name` from the first node that has it
    async fn delete_volume(
        &self,
        nodes: &[&ComputeNode],
        file_name: &str,
    ) -> VirtanceResult<Result<(), GatewayFailure>> {
        for node in nodes {
            let gateway = self.connector.connect(node)?;
            let pools = match gateway.storage_pools().await {
                Ok(pools) => pools,
                Err(failure) => return Ok(Err(failure)),
            };
            for pool in pools {
                let volumes = match gateway.storage_volumes(&pool).await {
                    Ok(volumes) => volumes,
                    Err(failure) => return Ok(Err(failure)),
                };
                if volumes.iter().any(|v| v == file_name) {
                    debug!(node = %node.name, %pool, file_name, "Deleting volume");
                    return Ok(gateway.delete_storage_volume(&pool, file_name).await);
                }
            }
        }
        warn!(file_name, "Volume not found on any node, treating as removed");
        Ok(Ok(()))
    }
}
