//! User notices sent after an operation

use std::net::IpAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::VirtanceResult,
    types::{UserId, VirtanceId},
};

/// Sent once CREATE succeeds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedNotice {
    pub virtance_id: VirtanceId,
    pub user_id: UserId,
    pub hostname: String,
    pub address: IpAddr,
    pub region: String,
    pub distribution: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn virtance_created(&self, notice: &CreatedNotice) -> VirtanceResult<()>;
}

/// Writes notices to the log instead of delivering them
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn virtance_created(&self, notice: &CreatedNotice) -> VirtanceResult<()> {
        info!(
            virtance_id = notice.virtance_id.0,
            user = notice.user_id.0,
            hostname = %notice.hostname,
            address = %notice.address,
            region = %notice.region,
            "Virtance created: {}", notice.distribution
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_notifier_accepts_notice() {
        let notice = CreatedNotice {
            virtance_id: VirtanceId(3),
            user_id: UserId(1),
            hostname: "web-3".to_string(),
            address: "203.0.113.7".parse().unwrap(),
            region: "fra1".to_string(),
            distribution: "Debian 12 x64".to_string(),
        };
        tokio_test::block_on(LogNotifier.virtance_created(&notice)).unwrap();
    }
}
