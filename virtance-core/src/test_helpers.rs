//! Test fixtures shared by unit and integration tests
//!
//! [`Fixture`] owns a temporary database, a [`MockClock`] and one compute node
//! in region `fra1`. [`MockComputeGateway`] records every call in order and
//! fails the methods it was told to fail.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rust_decimal_macros::dec;
use tempfile::TempDir;
use uuid::Uuid;

use crate::{
    abstractions::time::{Clock, MockClock},
    compute_gateway::{
        ComputeGateway, CreateRequest, FirewallDescriptor, FloatingIpRequest, GatewayConnector,
        GatewayFailure, GatewayResult, LoadBalancerDescriptor, MediaSlot, RebuildRequest,
        RemoteAction, RemoteStatus, SnapshotArtifact,
    },
    config::VirtanceConfig,
    error::VirtanceResult,
    event_lease::EventLeases,
    ip_allocator::AddressAllocator,
    ip_pool::{AddressPool, IpVersion, PoolType},
    lifecycle::VirtanceOrchestrator,
    metering::UsageLedger,
    notifier::LogNotifier,
    orchestration_log::OrchestrationLog,
    placement::CapacitySelector,
    storage::Store,
    types::{
        ComputeNode, ComputeNodeId, FirewallId, Image, ImageId, ImageKind, LoadBalancerId, PoolId,
        PowerState, Size, SizeId, UserId, Virtance, VirtanceId, VirtanceKind,
    },
};

pub const REGION: &str = "fra1";

/// UTC timestamp at minute precision
pub fn utc(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, minute, 0)
        .single()
        .expect("valid timestamp")
}

/// One recorded gateway call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Create(VirtanceId),
    Rebuild(VirtanceId),
    Delete(VirtanceId),
    Action(VirtanceId, RemoteAction),
    Status(VirtanceId),
    Resize { id: VirtanceId, vcpu: u32, memory: u64, disk: u64 },
    Snapshot(VirtanceId, String),
    Restore(VirtanceId, String),
    ResetPassword(VirtanceId),
    Media(VirtanceId),
    Mount { id: VirtanceId, dev: String, image: String },
    Unmount { id: VirtanceId, dev: String, path: String },
    FirewallAttach(FirewallId),
    FirewallDetach(FirewallId),
    AssignFloatingIp(IpAddr),
    UnassignFloatingIp(IpAddr),
    ReloadLoadBalancer { id: LoadBalancerId, backends: Vec<IpAddr> },
    StoragePools,
    StorageVolumes(String),
    DeleteVolume { pool: String, volume: String },
}

impl GatewayCall {
    /// Name used with [`MockComputeGateway::fail`]
    pub fn method(&self) -> &'static str {
        match self {
            GatewayCall::Create(_) => "create",
            GatewayCall::Rebuild(_) => "rebuild",
            GatewayCall::Delete(_) => "delete",
            GatewayCall::Action(_, RemoteAction::PowerOn) => "power_on",
            GatewayCall::Action(_, RemoteAction::PowerOff) => "power_off",
            GatewayCall::Action(_, RemoteAction::PowerCycle) => "power_cycle",
            GatewayCall::Action(_, RemoteAction::Shutdown) => "shutdown",
            GatewayCall::Status(_) => "status",
            GatewayCall::Resize { .. } => "resize",
            GatewayCall::Snapshot(_, _) => "snapshot",
            GatewayCall::Restore(_, _) => "restore",
            GatewayCall::ResetPassword(_) => "reset_password",
            GatewayCall::Media(_) => "media",
            GatewayCall::Mount { .. } => "mount_media",
            GatewayCall::Unmount { .. } => "unmount_media",
            GatewayCall::FirewallAttach(_) => "firewall_attach",
            GatewayCall::FirewallDetach(_) => "firewall_detach",
            GatewayCall::AssignFloatingIp(_) => "assign_floating_ip",
            GatewayCall::UnassignFloatingIp(_) => "unassign_floating_ip",
            GatewayCall::ReloadLoadBalancer { .. } => "reload_load_balancer",
            GatewayCall::StoragePools => "storage_pools",
            GatewayCall::StorageVolumes(_) => "storage_volumes",
            GatewayCall::DeleteVolume { .. } => "delete_storage_volume",
        }
    }
}

#[derive(Debug)]
struct GatewayState {
    calls: Vec<GatewayCall>,
    failures: HashMap<&'static str, String>,
    statuses: VecDeque<RemoteStatus>,
    default_status: RemoteStatus,
    media: Vec<MediaSlot>,
    volumes: HashMap<String, Vec<String>>,
    last_create: Option<CreateRequest>,
    last_rebuild: Option<RebuildRequest>,
    last_password_hash: Option<String>,
}

/// Scripted in-memory compute node
#[derive(Debug)]
pub struct MockComputeGateway {
    state: Mutex<GatewayState>,
}

impl Default for MockComputeGateway {
    fn default() -> Self {
        Self {
            state: Mutex::new(GatewayState {
                calls: Vec::new(),
                failures: HashMap::new(),
                statuses: VecDeque::new(),
                default_status: RemoteStatus::Shutoff,
                media: vec![MediaSlot {
                    dev: "hda".to_string(),
                    path: None,
                }],
                volumes: HashMap::from([("default".to_string(), Vec::new())]),
                last_create: None,
                last_rebuild: None,
                last_password_hash: None,
            }),
        }
    }
}

impl MockComputeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call of `method` fail with `detail`
    pub fn fail(&self, method: &'static str, detail: &str) {
        self.state.lock().failures.insert(method, detail.to_string());
    }

    pub fn succeed(&self, method: &'static str) {
        self.state.lock().failures.remove(method);
    }

    /// Status returned once the queued statuses run out
    pub fn set_status(&self, status: RemoteStatus) {
        self.state.lock().default_status = status;
    }

    pub fn queue_statuses(&self, statuses: impl IntoIterator<Item = RemoteStatus>) {
        self.state.lock().statuses.extend(statuses);
    }

    pub fn set_media(&self, media: Vec<MediaSlot>) {
        self.state.lock().media = media;
    }

    pub fn add_volume(&self, pool: &str, volume: &str) {
        self.state
            .lock()
            .volumes
            .entry(pool.to_string())
            .or_default()
            .push(volume.to_string());
    }

    pub fn volumes(&self, pool: &str) -> Vec<String> {
        self.state.lock().volumes.get(pool).cloned().unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().calls.clone()
    }

    pub fn methods(&self) -> Vec<&'static str> {
        self.state.lock().calls.iter().map(|c| c.method()).collect()
    }

    pub fn count(&self, call: &GatewayCall) -> usize {
        self.state.lock().calls.iter().filter(|c| *c == call).count()
    }

    pub fn last_create(&self) -> Option<CreateRequest> {
        self.state.lock().last_create.clone()
    }

    pub fn last_rebuild(&self) -> Option<RebuildRequest> {
        self.state.lock().last_rebuild.clone()
    }

    pub fn last_password_hash(&self) -> Option<String> {
        self.state.lock().last_password_hash.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn record(&self, call: GatewayCall) -> GatewayResult<()> {
        let mut state = self.state.lock();
        let method = call.method();
        state.calls.push(call);
        match state.failures.get(method) {
            Some(detail) => Err(GatewayFailure::new(detail.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ComputeGateway for MockComputeGateway {
    async fn create_virtance(&self, request: &CreateRequest) -> GatewayResult<()> {
        self.state.lock().last_create = Some(request.clone());
        self.record(GatewayCall::Create(request.id))
    }

    async fn rebuild_virtance(&self, request: &RebuildRequest) -> GatewayResult<()> {
        self.state.lock().last_rebuild = Some(request.clone());
        self.record(GatewayCall::Rebuild(request.id))
    }

    async fn delete_virtance(&self, id: VirtanceId) -> GatewayResult<()> {
        self.record(GatewayCall::Delete(id))
    }

    async fn action(&self, id: VirtanceId, action: RemoteAction) -> GatewayResult<()> {
        self.record(GatewayCall::Action(id, action))
    }

    async fn status(&self, id: VirtanceId) -> GatewayResult<RemoteStatus> {
        self.record(GatewayCall::Status(id))?;
        let mut state = self.state.lock();
        let default = state.default_status.clone();
        Ok(state.statuses.pop_front().unwrap_or(default))
    }

    async fn resize(&self, id: VirtanceId, vcpu: u32, memory: u64, disk: u64) -> GatewayResult<()> {
        self.record(GatewayCall::Resize {
            id,
            vcpu,
            memory,
            disk,
        })
    }

    async fn snapshot(&self, id: VirtanceId, name: &str) -> GatewayResult<SnapshotArtifact> {
        self.record(GatewayCall::Snapshot(id, name.to_string()))?;
        self.add_volume("default", name);
        Ok(SnapshotArtifact {
            md5sum: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            file_name: name.to_string(),
            size: 1 << 30,
            disk_size: 25,
        })
    }

    async fn restore(&self, id: VirtanceId, file_name: &str, _disk_size: u64) -> GatewayResult<()> {
        self.record(GatewayCall::Restore(id, file_name.to_string()))
    }

    async fn reset_password(&self, id: VirtanceId, password_hash: &str) -> GatewayResult<()> {
        self.state.lock().last_password_hash = Some(password_hash.to_string());
        self.record(GatewayCall::ResetPassword(id))
    }

    async fn media(&self, id: VirtanceId) -> GatewayResult<Vec<MediaSlot>> {
        self.record(GatewayCall::Media(id))?;
        Ok(self.state.lock().media.clone())
    }

    async fn mount_media(&self, id: VirtanceId, dev: &str, image: &str) -> GatewayResult<()> {
        self.record(GatewayCall::Mount {
            id,
            dev: dev.to_string(),
            image: image.to_string(),
        })?;
        let mut state = self.state.lock();
        if let Some(slot) = state.media.iter_mut().find(|s| s.dev == dev) {
            slot.path = Some(format!("/var/lib/libvirt/isos/{}", image));
        }
        Ok(())
    }

    async fn unmount_media(&self, id: VirtanceId, dev: &str, path: &str) -> GatewayResult<()> {
        self.record(GatewayCall::Unmount {
            id,
            dev: dev.to_string(),
            path: path.to_string(),
        })?;
        let mut state = self.state.lock();
        if let Some(slot) = state.media.iter_mut().find(|s| s.dev == dev) {
            slot.path = None;
        }
        Ok(())
    }

    async fn firewall_attach(&self, descriptor: &FirewallDescriptor) -> GatewayResult<()> {
        self.record(GatewayCall::FirewallAttach(descriptor.firewall_id))
    }

    async fn firewall_detach(
        &self,
        firewall_id: FirewallId,
        _public_address: IpAddr,
        _private_address: IpAddr,
    ) -> GatewayResult<()> {
        self.record(GatewayCall::FirewallDetach(firewall_id))
    }

    async fn assign_floating_ip(&self, request: &FloatingIpRequest) -> GatewayResult<()> {
        self.record(GatewayCall::AssignFloatingIp(request.floating_address))
    }

    async fn unassign_floating_ip(&self, request: &FloatingIpRequest) -> GatewayResult<()> {
        self.record(GatewayCall::UnassignFloatingIp(request.floating_address))
    }

    async fn reload_load_balancer(&self, descriptor: &LoadBalancerDescriptor) -> GatewayResult<()> {
        self.record(GatewayCall::ReloadLoadBalancer {
            id: descriptor.load_balancer_id,
            backends: descriptor.backends.clone(),
        })
    }

    async fn storage_pools(&self) -> GatewayResult<Vec<String>> {
        self.record(GatewayCall::StoragePools)?;
        let mut pools: Vec<String> = self.state.lock().volumes.keys().cloned().collect();
        pools.sort();
        Ok(pools)
    }

    async fn storage_volumes(&self, pool: &str) -> GatewayResult<Vec<String>> {
        self.record(GatewayCall::StorageVolumes(pool.to_string()))?;
        Ok(self.volumes(pool))
    }

    async fn delete_storage_volume(&self, pool: &str, volume: &str) -> GatewayResult<()> {
        self.record(GatewayCall::DeleteVolume {
            pool: pool.to_string(),
            volume: volume.to_string(),
        })?;
        if let Some(volumes) = self.state.lock().volumes.get_mut(pool) {
            volumes.retain(|v| v != volume);
        }
        Ok(())
    }
}

/// Hands out the same mock gateway for every node
#[derive(Debug, Clone)]
pub struct MockConnector {
    pub gateway: Arc<MockComputeGateway>,
    connected: Arc<Mutex<Vec<ComputeNodeId>>>,
}

impl MockConnector {
    pub fn new(gateway: Arc<MockComputeGateway>) -> Self {
        Self {
            gateway,
            connected: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Nodes connected to, in order
    pub fn connected(&self) -> Vec<ComputeNodeId> {
        self.connected.lock().clone()
    }
}

impl GatewayConnector for MockConnector {
    fn connect(&self, node: &ComputeNode) -> VirtanceResult<Arc<dyn ComputeGateway>> {
        self.connected.lock().push(node.id);
        Ok(self.gateway.clone())
    }
}

/// Temporary database with one compute node, one size and one template
pub struct Fixture {
    pub store: Store,
    pub clock: MockClock,
    pub config: VirtanceConfig,
    pub node_id: ComputeNodeId,
    pub size: Size,
    pub template: Image,
    pub gateway: Arc<MockComputeGateway>,
    pub connector: MockConnector,
    _dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self::at(utc(2024, 1, 15, 10, 0))
    }

    pub fn at(now: DateTime<Utc>) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let store = Store::open(dir.path().join("virtance.redb")).expect("open store");
        let clock = MockClock::at(now);
        let gateway = Arc::new(MockComputeGateway::new());

        let size = Size {
            id: SizeId(1),
            slug: "s-1vcpu-1gb".to_string(),
            vcpu: 1,
            memory: 1024,
            disk: 25,
            price: dec!(0.0060),
        };
        store.put(&size).expect("put size");

        let template = Image {
            id: ImageId(store.next_id("image").expect("image id")),
            name: "debian-12".to_string(),
            kind: ImageKind::Distribution,
            event: None,
            user_id: None,
            source: None,
            distribution: "debian".to_string(),
            description: "Debian 12 x64".to_string(),
            md5sum: "0f1e2d3c4b5a69788796a5b4c3d2e1f0".to_string(),
            file_name: "debian-12-x64.qcow2".to_string(),
            file_size: 400 << 20,
            disk_size: 2,
            regions: BTreeSet::from([REGION.to_string()]),
            created_at: now,
            is_deleted: false,
        };
        store.put(&template).expect("put template");

        let mut fixture = Self {
            store,
            clock,
            config: VirtanceConfig::default(),
            node_id: ComputeNodeId(0),
            size,
            template,
            connector: MockConnector::new(gateway.clone()),
            gateway,
            _dir: dir,
        };
        fixture.node_id = fixture.add_node("cmp1").id;
        fixture
    }

    fn clock_arc(&self) -> Arc<dyn Clock> {
        Arc::new(self.clock.clone())
    }

    pub fn add_node(&self, name: &str) -> ComputeNode {
        let node = ComputeNode {
            id: ComputeNodeId(self.store.next_id("compute_node").expect("node id")),
            name: name.to_string(),
            region: REGION.to_string(),
            hostname: format!("{}.{}.internal", name, REGION),
            token: Uuid::new_v4().simple().to_string(),
            vcpu: 32,
            memory: 65536,
            disk: 2000,
            active: true,
        };
        self.store.put(&node).expect("put node");
        node
    }

    pub fn add_pool(&self, pool_type: PoolType, cidr: &str, gateway: &str) -> AddressPool {
        let pool = AddressPool {
            id: PoolId(self.store.next_id("address_pool").expect("pool id")),
            name: format!("{}-{}", pool_type, cidr),
            region: REGION.to_string(),
            pool_type,
            subnet: cidr.parse().expect("cidr"),
            gateway: gateway.parse().expect("gateway"),
            dns: vec!["1.1.1.1".parse().expect("dns")],
            active: true,
        };
        pool.validate().expect("valid pool");
        self.store.put(&pool).expect("put pool");
        pool
    }

    /// Compute, public and private IPv4 pools
    pub fn add_network(&self) {
        self.add_pool(PoolType::Compute, "10.255.0.0/24", "10.255.0.1");
        self.add_pool(PoolType::Public, "203.0.113.0/24", "203.0.113.1");
        self.add_pool(PoolType::Private, "10.10.0.0/24", "10.10.0.1");
    }

    /// A virtance waiting for CREATE, not yet placed
    pub fn add_virtance(&self) -> Virtance {
        let id = VirtanceId(self.store.next_id("virtance").expect("virtance id"));
        let virtance = Virtance {
            id,
            uuid: Uuid::new_v4(),
            name: format!("web-{}", id.0),
            user_id: UserId(1),
            region: REGION.to_string(),
            compute_id: None,
            size_id: self.size.id,
            template_id: self.template.id,
            kind: VirtanceKind::Standard,
            keypair_ids: Vec::new(),
            service_key: None,
            backup_enabled: false,
            recovery_mode: false,
            event: None,
            power: PowerState::Inactive,
            created_at: self.clock.now(),
        };
        self.store.put(&virtance).expect("put virtance");
        virtance
    }

    /// A running virtance on the fixture's node with all three addresses
    ///
    /// Needs [`Fixture::add_network`] first.
    pub fn add_running_virtance(&self) -> Virtance {
        let mut virtance = self.add_virtance();
        virtance.compute_id = Some(self.node_id);
        virtance.power = PowerState::Active;
        self.store.put(&virtance).expect("put virtance");

        let allocator = self.allocator();
        for pool_type in [PoolType::Compute, PoolType::Public, PoolType::Private] {
            allocator
                .allocate(&virtance, pool_type, IpVersion::V4)
                .expect("allocate")
                .expect("address available");
        }
        virtance
    }

    pub fn virtance(&self, id: VirtanceId) -> Virtance {
        self.store.require(id.0).expect("virtance exists")
    }

    pub fn allocator(&self) -> AddressAllocator {
        AddressAllocator::new(self.store.clone(), self.clock_arc())
    }

    pub fn leases(&self) -> EventLeases {
        EventLeases::new(
            self.store.clone(),
            self.clock_arc(),
            self.config.orchestrator.lease_ttl,
        )
    }

    pub fn log(&self) -> OrchestrationLog {
        OrchestrationLog::new(self.store.clone(), self.clock_arc())
    }

    pub fn ledger(&self) -> UsageLedger {
        UsageLedger::new(self.store.clone(), self.clock_arc(), self.config.metering.clone())
    }

    pub fn orchestrator(&self) -> VirtanceOrchestrator {
        VirtanceOrchestrator::new(
            self.store.clone(),
            &self.config,
            self.clock_arc(),
            Arc::new(self.connector.clone()),
            Arc::new(CapacitySelector::new(
                self.store.clone(),
                self.config.placement.clone(),
            )),
            Arc::new(LogNotifier),
        )
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}
