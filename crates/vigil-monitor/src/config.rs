//! Configuration for the Vigil monitor.

use serde::Deserialize;

use vigil_core::types::ScanProfile;
use vigil_core::VigilError;

use crate::target::ScanTarget;

/// Top-level monitor configuration.
///
/// Loaded from the `[monitor]` section of `vigil.toml` (or another file
/// prefix) layered with `VIGIL_MONITOR__` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Path to the external scan tool binary.
    #[serde(default = "default_scanner_path")]
    pub scanner_path: String,

    /// Root directory for snapshot and diff storage.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: String,

    /// Default scan profile if not specified per target.
    #[serde(default)]
    pub default_profile: ScanProfile,

    /// Recurring scan targets registered at startup.
    #[serde(default)]
    pub targets: Vec<TargetSchedule>,

    /// Smallest allowed recurring interval.
    #[serde(default = "default_min_interval")]
    pub min_interval_secs: u64,

    /// Concurrency ceiling for simultaneous scan executions.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_scans: usize,

    /// Retries after a failed scan attempt (total attempts = retries + 1).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay after a failed attempt.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Backoff cap.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Backoff growth factor between attempts.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Per-scan execution timeout.
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_secs: u64,

    /// Diffs with more total changes than this raise a significant-change
    /// signal.
    #[serde(default = "default_change_threshold")]
    pub significant_change_threshold: u32,

    /// Cadence of the health-check loop.
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,

    /// How long `stop()` waits for in-flight scans before abandoning them.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Consecutive storage failures before the circuit opens.
    #[serde(default = "default_storage_failure_threshold")]
    pub storage_failure_threshold: u32,

    /// How long the storage circuit stays open before a half-open trial.
    #[serde(default = "default_storage_reset_timeout")]
    pub storage_reset_timeout_secs: u64,

    /// Retention window for snapshots and diffs, applied by the sweep job.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Match devices across snapshots by MAC instead of IP.
    #[serde(default)]
    pub track_by_mac: bool,
}

/// A recurring scan target with its schedule.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetSchedule {
    /// Target expression: CIDR, dashed IPv4 range, or single IP.
    pub range: String,

    /// Human-readable name for this target.
    pub name: Option<String>,

    /// Scan profile override for this target.
    pub profile: Option<ScanProfile>,

    /// Scan interval in seconds.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Whether this target is scanned.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl MonitorConfig {
    /// Load configuration from the given file prefix plus environment
    /// overrides, falling back to defaults when neither is present.
    pub fn load(file_prefix: &str) -> Result<Self, VigilError> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(file_prefix).required(false))
            .add_source(
                config::Environment::with_prefix("VIGIL_MONITOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| VigilError::Validation(format!("configuration unreadable: {e}")))?;

        match cfg.get::<MonitorConfig>("monitor") {
            Ok(c) => Ok(c),
            Err(_) => Ok(MonitorConfig::default()),
        }
    }

    /// Reject configurations that cannot produce a working monitor.
    pub fn validate(&self) -> Result<(), VigilError> {
        if self.max_concurrent_scans == 0 {
            return Err(VigilError::Validation(
                "max_concurrent_scans must be at least 1".to_string(),
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(VigilError::Validation(
                "backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.min_interval_secs == 0 || self.scan_timeout_secs == 0 {
            return Err(VigilError::Validation(
                "min_interval_secs and scan_timeout_secs must be positive".to_string(),
            ));
        }
        for target in self.targets.iter().filter(|t| t.enabled) {
            ScanTarget::parse(&target.range)?;
            if target.interval_secs < self.min_interval_secs {
                return Err(VigilError::Validation(format!(
                    "target {} interval {}s is below the minimum {}s",
                    target.range, target.interval_secs, self.min_interval_secs
                )));
            }
        }
        Ok(())
    }
}

fn default_scanner_path() -> String {
    "vigil-scan".to_string()
}

fn default_storage_dir() -> String {
    "./vigil-data".to_string()
}

fn default_min_interval() -> u64 {
    60
}

fn default_max_concurrent() -> usize {
    4
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_scan_timeout() -> u64 {
    300
}

fn default_change_threshold() -> u32 {
    5
}

fn default_health_interval() -> u64 {
    30
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_storage_failure_threshold() -> u32 {
    5
}

fn default_storage_reset_timeout() -> u64 {
    60
}

fn default_retention_days() -> u32 {
    90
}

fn default_interval() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            scanner_path: default_scanner_path(),
            storage_dir: default_storage_dir(),
            default_profile: ScanProfile::default(),
            targets: Vec::new(),
            min_interval_secs: default_min_interval(),
            max_concurrent_scans: default_max_concurrent(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            scan_timeout_secs: default_scan_timeout(),
            significant_change_threshold: default_change_threshold(),
            health_interval_secs: default_health_interval(),
            shutdown_grace_secs: default_shutdown_grace(),
            storage_failure_threshold: default_storage_failure_threshold(),
            storage_reset_timeout_secs: default_storage_reset_timeout(),
            retention_days: default_retention_days(),
            track_by_mac: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = MonitorConfig::default();
        assert_eq!(config.scanner_path, "vigil-scan");
        assert_eq!(config.default_profile, ScanProfile::Discovery);
        assert_eq!(config.max_concurrent_scans, 4);
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let config = MonitorConfig {
            max_concurrent_scans: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            VigilError::Validation(_)
        ));
    }

    #[test]
    fn validate_rejects_bad_target_range() {
        let config = MonitorConfig {
            targets: vec![TargetSchedule {
                range: "office-lan".to_string(),
                name: None,
                profile: None,
                interval_secs: 3600,
                enabled: true,
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_ignores_disabled_targets() {
        let config = MonitorConfig {
            targets: vec![TargetSchedule {
                range: "office-lan".to_string(),
                name: None,
                profile: None,
                interval_secs: 10,
                enabled: false,
            }],
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_sub_minimum_interval() {
        let config = MonitorConfig {
            targets: vec![TargetSchedule {
                range: "10.0.0.0/24".to_string(),
                name: None,
                profile: None,
                interval_secs: 5,
                enabled: true,
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
