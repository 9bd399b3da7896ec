//! Virtance lifecycle orchestration
//!
//! Drives tenant virtual machines ("virtances") through their lifecycle on a
//! fleet of compute nodes: address allocation, remote calls to the node
//! agents, dependency teardown, usage metering and the scheduled sweeps.

pub mod abstractions;
pub mod cascade;
pub mod common;
pub mod compute_gateway;
pub mod config;
pub mod dependency_links;
pub mod error;
pub mod event_lease;
pub mod ip_allocator;
pub mod ip_pool;
pub mod lifecycle;
pub mod metering;
pub mod notifier;
pub mod orchestration_log;
pub mod placement;
pub mod storage;
pub mod sweepers;
pub mod types;
pub mod work_queue;

// Test helpers are exposed for integration tests
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use error::{VirtanceError, VirtanceResult};
