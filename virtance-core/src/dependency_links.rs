//! Shared resources a virtance can be linked to
//!
//! Firewalls, floating IPs and load balancers each carry their own `event`
//! marker. A link must be severed before the owning virtance can be deleted.

use serde::{Deserialize, Serialize};

use crate::types::{
    AllocationId, FirewallId, FloatingIpId, LinkId, LoadBalancerId, UserId, VirtanceId,
};

/// In-flight operation on a shared resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceEvent {
    Attach,
    Detach,
    Update,
    Assign,
    Unassign,
    Reload,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub direction: RuleDirection,
    pub protocol: String,
    pub action: String,
    pub ports: String,
    /// CIDRs in `address/prefix` form
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Firewall {
    pub id: FirewallId,
    pub user_id: UserId,
    pub name: String,
    pub rules: Vec<FirewallRule>,
    pub event: Option<ResourceEvent>,
}

impl Firewall {
    pub fn rules_in(&self, direction: RuleDirection) -> Vec<FirewallRule> {
        self.rules
            .iter()
            .filter(|r| r.direction == direction)
            .cloned()
            .collect()
    }
}

/// Link between a firewall and a virtance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallAttachment {
    pub id: LinkId,
    pub firewall_id: FirewallId,
    pub virtance_id: VirtanceId,
}

/// A floating address owned by a user
///
/// It is bound to a virtance through the `virtance_id` of its allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloatingIp {
    pub id: FloatingIpId,
    pub user_id: UserId,
    pub allocation_id: AllocationId,
    pub event: Option<ResourceEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingRule {
    pub entry_protocol: String,
    pub entry_port: u16,
    pub target_protocol: String,
    pub target_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub protocol: String,
    pub port: u16,
    pub path: String,
    pub check_interval_seconds: u32,
    pub response_timeout_seconds: u32,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            protocol: "tcp".to_string(),
            port: 80,
            path: "/".to_string(),
            check_interval_seconds: 10,
            response_timeout_seconds: 5,
            healthy_threshold: 3,
            unhealthy_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickySessions {
    pub cookie_name: String,
    pub cookie_ttl_seconds: u32,
}

/// A load balancer service, itself running on a virtance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub id: LoadBalancerId,
    pub user_id: UserId,
    pub name: String,
    pub virtance_id: VirtanceId,
    pub forwarding_rules: Vec<ForwardingRule>,
    pub health_check: HealthCheck,
    pub sticky_sessions: Option<StickySessions>,
    pub redirect_http_to_https: bool,
    pub event: Option<ResourceEvent>,
    pub is_deleted: bool,
}

/// Backend membership of a virtance in a load balancer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerMember {
    pub id: LinkId,
    pub load_balancer_id: LoadBalancerId,
    pub virtance_id: VirtanceId,
    pub is_deleted: bool,
}
