use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> u64 {
                id.0
            }
        }
    };
}

id_type!(
    /// Unique identifier for a virtance
    VirtanceId,
    "virtance"
);
id_type!(ComputeNodeId, "compute");
id_type!(SizeId, "size");
id_type!(ImageId, "image");
id_type!(KeyPairId, "keypair");
id_type!(UserId, "user");
id_type!(PoolId, "pool");
id_type!(AllocationId, "ip");
id_type!(FirewallId, "firewall");
id_type!(FloatingIpId, "floating-ip");
id_type!(LoadBalancerId, "lbaas");
id_type!(IntervalId, "interval");
id_type!(LinkId, "link");
id_type!(LogEntryId, "log");

/// In-flight operation marker on a virtance
///
/// At most one event is set at a time. It is shown to users as "in progress"
/// and guarded by an [`crate::event_lease::EventLease`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VirtanceEvent {
    Create,
    PowerOn,
    PowerOff,
    PowerCycle,
    Shutdown,
    Reboot,
    Resize,
    Snapshot,
    Restore,
    Backup,
    DisableBackups,
    Rebuild,
    ResetPassword,
    EnableRecoveryMode,
    DisableRecoveryMode,
    Delete,
}

impl VirtanceEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            VirtanceEvent::Create => "create",
            VirtanceEvent::PowerOn => "power_on",
            VirtanceEvent::PowerOff => "power_off",
            VirtanceEvent::PowerCycle => "power_cycle",
            VirtanceEvent::Shutdown => "shutdown",
            VirtanceEvent::Reboot => "reboot",
            VirtanceEvent::Resize => "resize",
            VirtanceEvent::Snapshot => "snapshot",
            VirtanceEvent::Restore => "restore",
            VirtanceEvent::Backup => "backup",
            VirtanceEvent::DisableBackups => "disable_backups",
            VirtanceEvent::Rebuild => "rebuild",
            VirtanceEvent::ResetPassword => "reset_password",
            VirtanceEvent::EnableRecoveryMode => "enable_recovery_mode",
            VirtanceEvent::DisableRecoveryMode => "disable_recovery_mode",
            VirtanceEvent::Delete => "delete",
        }
    }
}

impl std::fmt::Display for VirtanceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Power actions accepted by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    PowerOn,
    PowerOff,
    PowerCycle,
    Shutdown,
    /// Not a remote action: executed as shutdown followed by power on
    Reboot,
}

impl PowerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerAction::PowerOn => "power_on",
            PowerAction::PowerOff => "power_off",
            PowerAction::PowerCycle => "power_cycle",
            PowerAction::Shutdown => "shutdown",
            PowerAction::Reboot => "reboot",
        }
    }

    pub fn event(&self) -> VirtanceEvent {
        match self {
            PowerAction::PowerOn => VirtanceEvent::PowerOn,
            PowerAction::PowerOff => VirtanceEvent::PowerOff,
            PowerAction::PowerCycle => VirtanceEvent::PowerCycle,
            PowerAction::Shutdown => VirtanceEvent::Shutdown,
            PowerAction::Reboot => VirtanceEvent::Reboot,
        }
    }
}

impl std::fmt::Display for PowerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Active,
    Inactive,
}

/// What a virtance is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VirtanceKind {
    Standard,
    LoadBalancer,
    Database,
}

/// A tenant-owned virtual machine instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Virtance {
    pub id: VirtanceId,
    pub uuid: Uuid,
    pub name: String,
    pub user_id: UserId,
    pub region: String,
    /// Unset until the first CREATE resolves a node
    pub compute_id: Option<ComputeNodeId>,
    pub size_id: SizeId,
    pub template_id: ImageId,
    pub kind: VirtanceKind,
    pub keypair_ids: Vec<KeyPairId>,
    /// Public key owned by the load balancer or database service running on this virtance
    pub service_key: Option<String>,
    pub backup_enabled: bool,
    pub recovery_mode: bool,
    pub event: Option<VirtanceEvent>,
    pub power: PowerState,
    pub created_at: DateTime<Utc>,
}

impl Virtance {
    /// Domain name used on the compute node
    pub fn domain_name(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.id.0)
    }

    pub fn is_active(&self) -> bool {
        self.power == PowerState::Active
    }
}

/// Sizing plan with its hourly price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub id: SizeId,
    pub slug: String,
    pub vcpu: u32,
    /// Memory in MiB
    pub memory: u64,
    /// Disk in GiB
    pub disk: u64,
    pub price: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    Distribution,
    Application,
    Snapshot,
    Backup,
    LoadBalancer,
    Database,
}

impl ImageKind {
    /// Image type as understood by the compute node
    pub fn remote_type(&self) -> &'static str {
        match self {
            ImageKind::Distribution | ImageKind::LoadBalancer | ImageKind::Database => {
                "distribution"
            }
            ImageKind::Application => "application",
            ImageKind::Snapshot => "snapshot",
            ImageKind::Backup => "backup",
        }
    }

    /// Images produced from a virtance's disk
    pub fn is_artifact(&self) -> bool {
        matches!(self, ImageKind::Snapshot | ImageKind::Backup)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageEvent {
    Create,
    Restore,
    Delete,
}

/// Template, snapshot or backup image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: ImageId,
    pub name: String,
    pub kind: ImageKind,
    pub event: Option<ImageEvent>,
    pub user_id: Option<UserId>,
    /// Virtance the image was taken from
    pub source: Option<VirtanceId>,
    pub distribution: String,
    pub description: String,
    pub md5sum: String,
    pub file_name: String,
    pub file_size: u64,
    pub disk_size: u64,
    pub regions: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub is_deleted: bool,
}

/// A fleet member hosting virtances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeNode {
    pub id: ComputeNodeId,
    pub name: String,
    pub region: String,
    pub hostname: String,
    pub token: String,
    pub vcpu: u32,
    /// Memory in MiB
    pub memory: u64,
    /// Disk in GiB
    pub disk: u64,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyPair {
    pub id: KeyPairId,
    pub user_id: UserId,
    pub name: String,
    pub public_key: String,
}

/// Resources a virtance needs from its compute node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDemand {
    pub vcpu: u32,
    pub memory: u64,
    pub disk: u64,
}

impl From<&Size> for ResourceDemand {
    fn from(size: &Size) -> Self {
        Self {
            vcpu: size.vcpu,
            memory: size.memory,
            disk: size.disk,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_match_wire_names() {
        assert_eq!(VirtanceEvent::EnableRecoveryMode.to_string(), "enable_recovery_mode");
        let json = serde_json::to_string(&VirtanceEvent::PowerCycle).unwrap();
        assert_eq!(json, "\"power_cycle\"");
    }

    #[test]
    fn test_id_display() {
        assert_eq!(VirtanceId(42).to_string(), "virtance-42");
        assert_eq!(PoolId(3).to_string(), "pool-3");
    }

    #[test]
    fn test_service_images_are_created_as_distributions() {
        assert_eq!(ImageKind::LoadBalancer.remote_type(), "distribution");
        assert_eq!(ImageKind::Database.remote_type(), "distribution");
        assert_eq!(ImageKind::Snapshot.remote_type(), "snapshot");
    }
}
