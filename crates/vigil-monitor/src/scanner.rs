//! Scanner adapter boundary.
//!
//! A [`Scanner`] runs one scan against a target and returns the normalized
//! device list. The stock implementation shells out to an external scan
//! tool via `tokio::process::Command`; the tool owns probing and
//! fingerprinting and prints the device list as JSON on stdout.

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::{timeout, Duration, Instant};

use vigil_core::types::{Device, ScanProfile};
use vigil_core::{Transient, VigilError};

use crate::target::ScanTarget;

/// Errors from a single scan execution.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("Scan tool not found at {path}: {source}")]
    Launch {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Scan timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Scan tool exited with code {code}: {stderr}")]
    Tool { code: i32, stderr: String },

    #[error("Scan output is not a valid device list: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Scan cancelled")]
    Cancelled,
}

impl Transient for ScanError {
    fn is_transient(&self) -> bool {
        // A missing binary or malformed output contract will not fix itself
        // between attempts; timeouts and tool failures often do.
        matches!(self, ScanError::Timeout { .. } | ScanError::Tool { .. })
    }
}

impl From<ScanError> for VigilError {
    fn from(err: ScanError) -> Self {
        VigilError::Scan(err.to_string())
    }
}

/// Executes one scan against a target with the given profile.
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(
        &self,
        target: &ScanTarget,
        profile: ScanProfile,
        timeout: Duration,
    ) -> Result<Vec<Device>, ScanError>;
}

/// Wrapper around the external scan tool binary.
pub struct CommandScanner {
    tool_path: String,
}

impl CommandScanner {
    pub fn new(tool_path: &str) -> Self {
        Self {
            tool_path: tool_path.to_string(),
        }
    }

    /// Verify the scan tool is installed and accessible.
    pub async fn verify_installation(&self) -> Result<String, ScanError> {
        let output = Command::new(&self.tool_path)
            .arg("--version")
            .output()
            .await
            .map_err(|e| ScanError::Launch {
                path: self.tool_path.clone(),
                source: e,
            })?;

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Flags selecting scan depth for each profile.
    fn profile_args(profile: ScanProfile) -> &'static [&'static str] {
        match profile {
            ScanProfile::Quick => &["--ping-only"],
            ScanProfile::Discovery => &["--top-ports", "1000", "--service-names"],
            ScanProfile::Comprehensive => &["--all-ports", "--service-versions", "--os-detect"],
        }
    }
}

#[async_trait]
impl Scanner for CommandScanner {
    /// Run the scan tool with `--format json`, bounded by `timeout`.
    ///
    /// The child is killed if the timeout elapses or the future is dropped.
    async fn scan(
        &self,
        target: &ScanTarget,
        profile: ScanProfile,
        scan_timeout: Duration,
    ) -> Result<Vec<Device>, ScanError> {
        let start = Instant::now();

        tracing::info!(
            target = %target,
            profile = %profile,
            timeout_secs = scan_timeout.as_secs(),
            "Starting scan"
        );

        let mut command = Command::new(&self.tool_path);
        command
            .args(Self::profile_args(profile))
            .arg("--format")
            .arg("json")
            .arg(target.to_string())
            .kill_on_drop(true);

        let output = timeout(scan_timeout, command.output())
            .await
            .map_err(|_| ScanError::Timeout {
                secs: scan_timeout.as_secs(),
            })?
            .map_err(|e| ScanError::Launch {
                path: self.tool_path.clone(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(ScanError::Tool {
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        let devices: Vec<Device> = serde_json::from_slice(&output.stdout)?;

        tracing::info!(
            target = %target,
            devices = devices.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Scan complete"
        );

        Ok(devices)
    }
}
