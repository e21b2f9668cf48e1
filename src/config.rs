use crate::client::DEFAULT_BANNER;
use crate::protocol::{AdbError, MAX_PAYLOAD};
use crate::transport::RetryPolicy;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

/// Manager settings. Every field has a default, so an empty TOML file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdbConfig {
    /// Address the local daemon listens on
    pub host: IpAddr,
    /// How long to wait for the daemon to be discovered
    pub discovery_timeout_ms: u64,
    pub connect_attempts: u32,
    pub connect_retry_delay_ms: u64,
    /// CNXN banner
    pub banner: String,
    /// Name appended to the public key and used as the certificate CN
    pub device_name: String,
    pub max_payload: u32,
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            discovery_timeout_ms: 1000,
            connect_attempts: 5,
            connect_retry_delay_ms: 1000,
            banner: DEFAULT_BANNER.to_string(),
            device_name: "wadb-rs".to_string(),
            max_payload: MAX_PAYLOAD,
        }
    }
}

impl AdbConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, AdbError> {
        toml::from_str(source).map_err(|e| AdbError::IoError(format!("Invalid config: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self, AdbError> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| AdbError::IoError(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&source)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.connect_attempts,
            delay: Duration::from_millis(self.connect_retry_delay_ms),
        }
    }
}
