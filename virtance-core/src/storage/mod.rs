//! Persistent state on top of redb
//!
//! Every table is created up front by [`init_database_tables`], since read
//! transactions cannot open a table that has never been written.

pub mod database_transaction;

pub use database_transaction::DatabaseTransaction;

use std::path::Path;
use std::sync::Arc;

use redb::{Database, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

use crate::{
    common::error_context::StorageContext,
    dependency_links::{Firewall, FirewallAttachment, FloatingIp, LoadBalancer, LoadBalancerMember},
    error::{VirtanceError, VirtanceResult},
    event_lease::EventLease,
    ip_pool::{AddressAllocation, AddressPool},
    metering::UsageInterval,
    orchestration_log::{ErrorEntry, HistoryEntry},
    types::{ComputeNode, Image, KeyPair, Size, Virtance},
};

pub type RecordTable = TableDefinition<'static, u64, &'static [u8]>;
pub type IndexTable = TableDefinition<'static, &'static str, u64>;

// Fleet and catalog
pub const VIRTANCE_TABLE: RecordTable = TableDefinition::new("virtances");
pub const SIZE_TABLE: RecordTable = TableDefinition::new("sizes");
pub const IMAGE_TABLE: RecordTable = TableDefinition::new("images");
pub const COMPUTE_NODE_TABLE: RecordTable = TableDefinition::new("compute_nodes");
pub const KEYPAIR_TABLE: RecordTable = TableDefinition::new("keypairs");

// Addressing
pub const ADDRESS_POOL_TABLE: RecordTable = TableDefinition::new("address_pools");
pub const ADDRESS_ALLOCATION_TABLE: RecordTable = TableDefinition::new("address_allocations");
/// `pool/scope/address` -> allocation id
pub const ADDRESS_UNIQUE_TABLE: IndexTable = TableDefinition::new("address_unique");

// Dependency links
pub const FIREWALL_TABLE: RecordTable = TableDefinition::new("firewalls");
pub const FIREWALL_ATTACHMENT_TABLE: RecordTable = TableDefinition::new("firewall_attachments");
pub const FLOATING_IP_TABLE: RecordTable = TableDefinition::new("floating_ips");
pub const LOAD_BALANCER_TABLE: RecordTable = TableDefinition::new("load_balancers");
pub const LOAD_BALANCER_MEMBER_TABLE: RecordTable = TableDefinition::new("load_balancer_members");

// Metering
pub const USAGE_INTERVAL_TABLE: RecordTable = TableDefinition::new("usage_intervals");
/// metered entity -> its one open interval
pub const OPEN_INTERVAL_TABLE: IndexTable = TableDefinition::new("open_intervals");

// Orchestration
pub const EVENT_LEASE_TABLE: RecordTable = TableDefinition::new("event_leases");
pub const ERROR_LOG_TABLE: RecordTable = TableDefinition::new("error_log");
pub const HISTORY_LOG_TABLE: RecordTable = TableDefinition::new("history_log");

pub const SEQUENCE_TABLE: IndexTable = TableDefinition::new("sequences");

/// A serde struct stored in its own `u64`-keyed table
pub trait Record: Serialize + DeserializeOwned {
    const TABLE: RecordTable;
    /// Human-readable name used in errors and logs
    const KIND: &'static str;

    fn record_id(&self) -> u64;
}

macro_rules! record {
    ($ty:ty, $table:ident, $kind:literal, |$r:ident| $id:expr) => {
        impl Record for $ty {
            const TABLE: RecordTable = $table;
            const KIND: &'static str = $kind;

            fn record_id(&self) -> u64 {
                let $r = self;
                $id
            }
        }
    };
}

record!(Virtance, VIRTANCE_TABLE, "virtance", |r| r.id.0);
record!(Size, SIZE_TABLE, "size", |r| r.id.0);
record!(Image, IMAGE_TABLE, "image", |r| r.id.0);
record!(ComputeNode, COMPUTE_NODE_TABLE, "compute node", |r| r.id.0);
record!(KeyPair, KEYPAIR_TABLE, "keypair", |r| r.id.0);
record!(AddressPool, ADDRESS_POOL_TABLE, "address pool", |r| r.id.0);
record!(AddressAllocation, ADDRESS_ALLOCATION_TABLE, "address allocation", |r| r.id.0);
record!(Firewall, FIREWALL_TABLE, "firewall", |r| r.id.0);
record!(FirewallAttachment, FIREWALL_ATTACHMENT_TABLE, "firewall attachment", |r| r.id.0);
record!(FloatingIp, FLOATING_IP_TABLE, "floating ip", |r| r.id.0);
record!(LoadBalancer, LOAD_BALANCER_TABLE, "load balancer", |r| r.id.0);
record!(LoadBalancerMember, LOAD_BALANCER_MEMBER_TABLE, "load balancer member", |r| r.id.0);
record!(UsageInterval, USAGE_INTERVAL_TABLE, "usage interval", |r| r.id.0);
record!(EventLease, EVENT_LEASE_TABLE, "event lease", |r| r.virtance_id.0);
record!(ErrorEntry, ERROR_LOG_TABLE, "error log entry", |r| r.id.0);
record!(HistoryEntry, HISTORY_LOG_TABLE, "history log entry", |r| r.id.0);

/// Initialize all database tables
pub fn init_database_tables(database: &Database) -> VirtanceResult<()> {
    let write_txn = database.begin_write()?;

    for table in [
        VIRTANCE_TABLE,
        SIZE_TABLE,
        IMAGE_TABLE,
        COMPUTE_NODE_TABLE,
        KEYPAIR_TABLE,
        ADDRESS_POOL_TABLE,
        ADDRESS_ALLOCATION_TABLE,
        FIREWALL_TABLE,
        FIREWALL_ATTACHMENT_TABLE,
        FLOATING_IP_TABLE,
        LOAD_BALANCER_TABLE,
        LOAD_BALANCER_MEMBER_TABLE,
        USAGE_INTERVAL_TABLE,
        EVENT_LEASE_TABLE,
        ERROR_LOG_TABLE,
        HISTORY_LOG_TABLE,
    ] {
        let _ = write_txn.open_table(table)?;
    }
    for index in [ADDRESS_UNIQUE_TABLE, OPEN_INTERVAL_TABLE, SEQUENCE_TABLE] {
        let _ = write_txn.open_table(index)?;
    }

    write_txn.commit()?;
    Ok(())
}

/// Shared handle to the orchestrator database
#[derive(Clone)]
pub struct Store {
    database: Arc<Database>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open or create the database file and make sure every table exists
    pub fn open(path: impl AsRef<Path>) -> VirtanceResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let database = Database::create(path).storage_context("open database")?;
        Self::from_database(Arc::new(database))
    }

    pub fn from_database(database: Arc<Database>) -> VirtanceResult<Self> {
        init_database_tables(&database)?;
        Ok(Self { database })
    }

    /// Run `f` inside a read transaction
    pub fn read<T, F>(&self, operation: &str, f: F) -> VirtanceResult<T>
    where
        F: FnOnce(&DatabaseTransaction) -> VirtanceResult<T>,
    {
        let txn = DatabaseTransaction::begin_read(&self.database, operation)?;
        f(&txn)
    }

    /// Run `f` inside a write transaction
    ///
    /// Commits when `f` returns `Ok`; any error aborts the transaction so no
    /// partial write is ever visible.
    pub fn write<T, F>(&self, operation: &str, f: F) -> VirtanceResult<T>
    where
        F: FnOnce(&DatabaseTransaction) -> VirtanceResult<T>,
    {
        let txn = DatabaseTransaction::begin_write(&self.database, operation)?;
        match f(&txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = txn.abort() {
                    warn!("Failed to abort transaction for {}: {}", operation, abort_err);
                }
                Err(e)
            }
        }
    }

    pub fn get<R: Record>(&self, id: u64) -> VirtanceResult<Option<R>> {
        self.read(&format!("get {}", R::KIND), |txn| txn.get_record(id))
    }

    /// Fetch a record that must exist; a missing row is a data-integrity error
    pub fn require<R: Record>(&self, id: u64) -> VirtanceResult<R> {
        self.get(id)?.ok_or_else(|| VirtanceError::NotFound {
            resource: format!("{} {}", R::KIND, id),
        })
    }

    pub fn list<R: Record>(&self) -> VirtanceResult<Vec<R>> {
        self.read(&format!("list {}", R::KIND), |txn| txn.scan_records())
    }

    pub fn put<R: Record>(&self, record: &R) -> VirtanceResult<()> {
        self.write(&format!("put {}", R::KIND), |txn| txn.put_record(record))
    }

    /// Allocate the next id of a sequence in its own transaction
    pub fn next_id(&self, sequence: &str) -> VirtanceResult<u64> {
        self.write(&format!("next {} id", sequence), |txn| txn.next_id(sequence))
    }
}
