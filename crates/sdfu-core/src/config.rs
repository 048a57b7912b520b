//! Session configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::protocol::{FIRMWARE_ATTEMPTS, INIT_ATTEMPTS, OPERATION_TIMEOUT_MS};

/// Configuration for a DFU session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bound on connect, each control operation and each packet write.
    pub operation_timeout_ms: u64,
    /// Attempts for the init packet before a CRC mismatch is fatal.
    pub init_attempts: u32,
    /// Attempts per firmware page before a CRC mismatch is fatal.
    pub firmware_attempts: u32,
    /// Use acknowledged writes on the packet characteristic.
    pub packet_write_with_response: bool,
    /// Always resend the init packet, even if the device already holds it.
    pub force_init: bool,
    /// How long to wait for the link to drop after a finished update.
    pub disconnect_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: OPERATION_TIMEOUT_MS,
            init_attempts: INIT_ATTEMPTS,
            firmware_attempts: FIRMWARE_ATTEMPTS,
            packet_write_with_response: true,
            force_init: false,
            disconnect_timeout_ms: OPERATION_TIMEOUT_MS,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.operation_timeout(), Duration::from_secs(5));
        assert_eq!(config.init_attempts, 3);
        assert_eq!(config.firmware_attempts, 3);
        assert!(config.packet_write_with_response);
        assert!(!config.force_init);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SessionConfig =
            toml::from_str("firmware_attempts = 5\npacket_write_with_response = false\n").unwrap();
        assert_eq!(config.firmware_attempts, 5);
        assert!(!config.packet_write_with_response);
        assert_eq!(config.operation_timeout_ms, 5000);
        assert_eq!(config.init_attempts, 3);
    }

    #[test]
    fn test_file_round_trip() {
        let path = std::env::temp_dir().join(format!("sdfu-config-{}.toml", std::process::id()));
        let config = SessionConfig {
            force_init: true,
            disconnect_timeout_ms: 1500,
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        let loaded = SessionConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(SessionConfig::load_from_file("/nonexistent/sdfu.toml").is_err());
    }
}
