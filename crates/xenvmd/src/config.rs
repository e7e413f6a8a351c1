//! Daemon configuration.
//!
//! Read once at startup from a TOML file, merged with command-line
//! overrides, validated, and immutable thereafter.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use xenvm_proto::{XvError, XvResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// TCP port to listen on.
    #[serde(default)]
    pub listen_port: Option<u16>,
    /// Unix-domain socket path to listen on.
    #[serde(default)]
    pub listen_path: Option<String>,
    /// Extent batch granted per top-up, in MiB.
    pub host_allocation_quantum: i64,
    /// Host free-pool level that triggers a top-up, in MiB.
    pub host_low_water_mark: i64,
    /// Volume group name.
    pub vg: String,
    /// Block devices holding the volume group.
    pub devices: Vec<String>,
    /// Back-off for transient ring and state-wait conditions.
    #[serde(default = "default_interval_ms")]
    pub retry_interval_ms: u64,
    /// Free-pool controller tick interval.
    #[serde(default = "default_interval_ms")]
    pub freepool_interval_ms: u64,
}

fn default_interval_ms() -> u64 {
    5000
}

impl Config {
    pub fn from_path(path: &Path) -> XvResult<Config> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| XvError::Msg(format!("cannot read config {}: {e}", path.display())))?;
        toml::from_str(&text)
            .map_err(|e| XvError::Msg(format!("cannot parse config {}: {e}", path.display())))
    }

    /// Check the merged configuration. At least one listen endpoint must
    /// remain after command-line overrides.
    pub fn validate(&self) -> XvResult<()> {
        if self.devices.is_empty() {
            return Err(XvError::Msg("at least one device is required".to_string()));
        }
        if self.listen_port.is_none() && self.listen_path.is_none() {
            return Err(XvError::Msg(
                "one of listen_port / listen_path must be set".to_string(),
            ));
        }
        if self.host_allocation_quantum <= 0 {
            return Err(XvError::Msg(
                "host_allocation_quantum must be positive".to_string(),
            ));
        }
        if self.host_low_water_mark < 0 {
            return Err(XvError::Msg(
                "host_low_water_mark must not be negative".to_string(),
            ));
        }
        if self.vg.is_empty() {
            return Err(XvError::Msg("vg name must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn freepool_interval(&self) -> Duration {
        Duration::from_millis(self.freepool_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        toml::from_str(
            r#"
            listen_port = 4000
            host_allocation_quantum = 64
            host_low_water_mark = 16
            vg = "vg0"
            devices = ["/dev/loop0"]
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_and_defaults() {
        let config = sample();
        assert_eq!(config.listen_port, Some(4000));
        assert_eq!(config.listen_path, None);
        assert_eq!(config.host_allocation_quantum, 64);
        assert_eq!(config.retry_interval(), Duration::from_secs(5));
        assert_eq!(config.freepool_interval(), Duration::from_secs(5));
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_requires_an_endpoint() {
        let mut config = sample();
        config.listen_port = None;
        assert!(config.validate().is_err());
        config.listen_path = Some("/run/xenvmd".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_requires_devices() {
        let mut config = sample();
        config.devices.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_quantum() {
        let mut config = sample();
        config.host_allocation_quantum = 0;
        assert!(config.validate().is_err());
    }
}
