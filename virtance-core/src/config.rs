//! Configuration loaded from TOML with environment overrides
//!
//! One [`VirtanceConfig`] is built at startup and handed to each component's
//! constructor. Nothing reads configuration from global state.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{VirtanceError, VirtanceResult};

/// Complete configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtanceConfig {
    pub storage: StorageConfig,
    pub orchestrator: OrchestratorConfig,
    pub placement: PlacementConfig,
    pub metering: MeteringConfig,
    pub backups: BackupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path of the redb database file
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Delay between status polls while waiting for a clean shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_poll_interval: Duration,

    /// Polls before escalating to a forced power off
    pub shutdown_poll_attempts: u32,

    /// How long a running operation holds its event lease before another
    /// runner may take it over
    #[serde(with = "humantime_serde")]
    pub lease_ttl: Duration,

    /// Orchestration units executed at the same time
    pub worker_concurrency: usize,

    /// ISO mounted while a virtance is in recovery mode
    pub recovery_iso_name: String,

    /// Where compute nodes download template images from
    pub public_images_url: String,

    /// Prefix of the domain name on the compute node
    pub vm_name_prefix: String,

    pub password_hash_rounds: u32,

    /// Send a notice when CREATE succeeds
    pub notify_on_create: bool,
}

/// Capacity limits used by the default compute selector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    pub cpu_overcommit_ratio: f64,
    /// Fraction of node memory that may be committed
    pub memory_ceiling: f64,
    /// Fraction of node disk that may be committed
    pub disk_ceiling: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeteringConfig {
    /// Backup surcharge as a percentage of the size price
    pub backup_cost_percentage: Decimal,

    pub snapshot_hourly_rate: Decimal,

    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Age after which a fresh backup is taken
    pub period_days: u32,

    /// Backups kept per virtance before the oldest is retired
    pub max_backups: usize,

    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/virtance.redb"),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            shutdown_poll_interval: Duration::from_secs(1),
            shutdown_poll_attempts: 60,
            lease_ttl: Duration::from_secs(30 * 60),
            worker_concurrency: 8,
            recovery_iso_name: "finnix-125.iso".to_string(),
            public_images_url: "https://cloud-images.webvirt.cloud".to_string(),
            vm_name_prefix: "Virtance-".to_string(),
            password_hash_rounds: 5000,
            notify_on_create: true,
        }
    }
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            cpu_overcommit_ratio: 2.0,
            memory_ceiling: 0.85,
            disk_ceiling: 0.85,
        }
    }
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            backup_cost_percentage: dec!(20),
            snapshot_hourly_rate: Decimal::ZERO,
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            period_days: 7,
            max_backups: 4,
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl MeteringConfig {
    /// Backup surcharge for a given hourly price
    pub fn backup_rate(&self, price: Decimal) -> Decimal {
        price * self.backup_cost_percentage / dec!(100)
    }
}

impl VirtanceConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> VirtanceResult<Self> {
        let contents = fs::read_to_string(path.as_ref()).map_err(|e| VirtanceError::Configuration {
            message: format!("Failed to read config file {}: {}", path.as_ref().display(), e),
        })?;

        let mut config: VirtanceConfig =
            toml::from_str(&contents).map_err(|e| VirtanceError::Configuration {
                message: format!("Failed to parse TOML: {}", e),
            })?;

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("VIRTANCE_DB_PATH") {
            self.storage.path = PathBuf::from(path);
        }
        if let Ok(workers) = std::env::var("VIRTANCE_WORKERS") {
            if let Ok(workers) = workers.parse() {
                self.orchestrator.worker_concurrency = workers;
            }
        }
        if let Ok(url) = std::env::var("VIRTANCE_PUBLIC_IMAGES_URL") {
            self.orchestrator.public_images_url = url;
        }
        if let Ok(iso) = std::env::var("VIRTANCE_RECOVERY_ISO") {
            self.orchestrator.recovery_iso_name = iso;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> VirtanceResult<()> {
        let invalid = |message: &str| {
            Err(VirtanceError::InvalidConfiguration {
                message: message.to_string(),
            })
        };

        if self.storage.path.as_os_str().is_empty() {
            return invalid("Storage path cannot be empty");
        }
        if self.orchestrator.shutdown_poll_attempts == 0 {
            return invalid("Shutdown poll attempts must be at least 1");
        }
        if self.orchestrator.worker_concurrency == 0 {
            return invalid("Worker concurrency must be at least 1");
        }
        if self.orchestrator.lease_ttl.is_zero() {
            return invalid("Lease TTL must be positive");
        }
        if self.placement.cpu_overcommit_ratio < 1.0 {
            return invalid("CPU overcommit ratio must be >= 1.0");
        }
        for ceiling in [self.placement.memory_ceiling, self.placement.disk_ceiling] {
            if !(0.0..=1.0).contains(&ceiling) || ceiling == 0.0 {
                return invalid("Capacity ceilings must be within (0, 1]");
            }
        }
        if self.metering.backup_cost_percentage < Decimal::ZERO {
            return invalid("Backup cost percentage cannot be negative");
        }
        if self.metering.sweep_interval.is_zero() || self.backups.sweep_interval.is_zero() {
            return invalid("Sweep intervals must be positive");
        }
        if self.backups.max_backups == 0 {
            return invalid("At least one backup must be kept");
        }
        if self.backups.period_days == 0 {
            return invalid("Backup period must be at least one day");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = VirtanceConfig::default();
        config.validate().unwrap();
        assert_eq!(config.orchestrator.shutdown_poll_attempts, 60);
        assert_eq!(config.backups.max_backups, 4);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: VirtanceConfig = toml::from_str(
            r#"
            [orchestrator]
            shutdown_poll_interval = "500ms"
            worker_concurrency = 2

            [backups]
            period_days = 3
            "#,
        )
        .unwrap();

        assert_eq!(
            config.orchestrator.shutdown_poll_interval,
            Duration::from_millis(500)
        );
        assert_eq!(config.orchestrator.worker_concurrency, 2);
        assert_eq!(config.orchestrator.recovery_iso_name, "finnix-125.iso");
        assert_eq!(config.backups.period_days, 3);
        assert_eq!(config.backups.max_backups, 4);
    }

    #[test]
    fn test_backup_rate() {
        let metering = MeteringConfig::default();
        assert_eq!(metering.backup_rate(dec!(0.0060)), dec!(0.0012));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = VirtanceConfig::default();
        config.orchestrator.worker_concurrency = 0;
        assert!(config.validate().is_err());
    }
}
