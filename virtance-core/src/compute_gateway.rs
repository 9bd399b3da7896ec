//! Contract of the remote compute-node agent
//!
//! Each compute node exposes the same set of operations. Every call returns
//! either its success payload or a [`GatewayFailure`] carrying the
//! human-readable detail reported by the node. A failure is definitive for
//! that call: the orchestrator records it and stops, it never retries.
//!
//! Transport and encoding live behind [`GatewayConnector`].

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    dependency_links::{FirewallRule, ForwardingRule, HealthCheck, StickySessions},
    error::VirtanceResult,
    types::{ComputeNode, FirewallId, LoadBalancerId, VirtanceId},
};

/// Error reported by a compute node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayFailure {
    pub detail: String,
}

impl GatewayFailure {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for GatewayFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.detail)
    }
}

pub type GatewayResult<T> = Result<T, GatewayFailure>;

/// Power actions understood by the compute node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteAction {
    PowerOn,
    PowerOff,
    PowerCycle,
    Shutdown,
}

/// Domain state reported by `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Running,
    Shutoff,
    Paused,
    Other(String),
}

impl RemoteStatus {
    pub fn is_shutoff(&self) -> bool {
        matches!(self, RemoteStatus::Shutoff)
    }
}

/// Disk image the node should download and expand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskImage {
    pub primary: bool,
    pub name: String,
    /// Disk size in GiB
    pub size: u64,
    pub image_type: String,
    pub md5sum: String,
    pub file_name: String,
    pub public_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub address: IpAddr,
    pub gateway: IpAddr,
    pub netmask: IpAddr,
    pub dns: Vec<IpAddr>,
}

/// Network layout of a virtance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    pub public_primary: InterfaceConfig,
    /// Node-internal address bound to the public interface
    pub public_secondary: InterfaceConfig,
    pub private: InterfaceConfig,
    pub v6: Option<InterfaceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub id: VirtanceId,
    pub uuid: Uuid,
    pub name: String,
    pub vcpu: u32,
    pub memory: u64,
    pub images: Vec<DiskImage>,
    pub network: NetworkDescriptor,
    pub ssh_keys: Vec<String>,
    pub password_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebuildRequest {
    pub id: VirtanceId,
    pub name: String,
    pub images: Vec<DiskImage>,
    pub network: NetworkDescriptor,
    pub ssh_keys: Vec<String>,
    pub password_hash: String,
}

/// Artifact produced by `snapshot`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotArtifact {
    pub md5sum: String,
    pub file_name: String,
    pub size: u64,
    pub disk_size: u64,
}

/// A removable media slot of a domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaSlot {
    pub dev: String,
    /// Mounted image, if any
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallDescriptor {
    pub firewall_id: FirewallId,
    pub public_address: IpAddr,
    pub private_address: IpAddr,
    pub inbound: Vec<FirewallRule>,
    pub outbound: Vec<FirewallRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloatingIpRequest {
    pub virtance_id: VirtanceId,
    pub floating_address: IpAddr,
    pub fixed_address: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerDescriptor {
    pub load_balancer_id: LoadBalancerId,
    pub forwarding_rules: Vec<ForwardingRule>,
    pub health_check: HealthCheck,
    pub sticky_sessions: Option<StickySessions>,
    pub redirect_http_to_https: bool,
    /// Private addresses of the backend virtances
    pub backends: Vec<IpAddr>,
}

/// Operations of one compute node
#[async_trait]
pub trait ComputeGateway: Send + Sync {
    async fn create_virtance(&self, request: &CreateRequest) -> GatewayResult<()>;

    /// Reinstall the disk in place, keeping addresses
    async fn rebuild_virtance(&self, request: &RebuildRequest) -> GatewayResult<()>;

    async fn delete_virtance(&self, id: VirtanceId) -> GatewayResult<()>;

    async fn action(&self, id: VirtanceId, action: RemoteAction) -> GatewayResult<()>;

    async fn status(&self, id: VirtanceId) -> GatewayResult<RemoteStatus>;

    async fn resize(&self, id: VirtanceId, vcpu: u32, memory: u64, disk: u64) -> GatewayResult<()>;

    async fn snapshot(&self, id: VirtanceId, name: &str) -> GatewayResult<SnapshotArtifact>;

    async fn restore(&self, id: VirtanceId, file_name: &str, disk_size: u64) -> GatewayResult<()>;

    async fn reset_password(&self, id: VirtanceId, password_hash: &str) -> GatewayResult<()>;

    async fn media(&self, id: VirtanceId) -> GatewayResult<Vec<MediaSlot>>;

    async fn mount_media(&self, id: VirtanceId, dev: &str, image: &str) -> GatewayResult<()>;

    async fn unmount_media(&self, id: VirtanceId, dev: &str, path: &str) -> GatewayResult<()>;

    async fn firewall_attach(&self, descriptor: &FirewallDescriptor) -> GatewayResult<()>;

    async fn firewall_detach(
        &self,
        firewall_id: FirewallId,
        public_address: IpAddr,
        private_address: IpAddr,
    ) -> GatewayResult<()>;

    async fn assign_floating_ip(&self, request: &FloatingIpRequest) -> GatewayResult<()>;

    async fn unassign_floating_ip(&self, request: &FloatingIpRequest) -> GatewayResult<()>;

    async fn reload_load_balancer(&self, descriptor: &LoadBalancerDescriptor) -> GatewayResult<()>;

    /// Names of the node's storage pools
    async fn storage_pools(&self) -> GatewayResult<Vec<String>>;

    /// Names of the volumes in a storage pool
    async fn storage_volumes(&self, pool: &str) -> GatewayResult<Vec<String>>;

    async fn delete_storage_volume(&self, pool: &str, volume: &str) -> GatewayResult<()>;
}

/// Opens a gateway to a compute node from its address and credential
pub trait GatewayConnector: Send + Sync {
    fn connect(&self, node: &ComputeNode) -> VirtanceResult<Arc<dyn ComputeGateway>>;
}
