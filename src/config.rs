use serde::{Deserialize, Serialize};
use whdriver::DriverConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub driver: DriverConfig,
    pub platform: PlatformConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where packets come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlatformConfig {
    /// Real board: /dev/mem registers, GPIO edges, UIO completion interrupt
    Linux { uio_device: String },
    /// Simulated board fed with synthetic packets
    Simulate { packets_per_second: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub proc_interrupts: String,
    /// Controller whose interrupt line is shared by SPI0 and SPI6
    pub completion_controller: String,
    /// Controllers that must not be claimed by a kernel SPI driver
    pub conflicting_controllers: Vec<String>,
    /// Skip discovery and use this interrupt number
    pub irq: Option<u32>,
}

/// UDP destination for one receiver's payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Receiver number as reported in the status word, 0..3
    pub receiver: u8,
    pub target: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogBackend {
    Env,
    Syslog,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub backend: LogBackend,
    /// Level used when RUST_LOG is not set
    pub level: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            proc_interrupts: "/proc/interrupts".to_string(),
            completion_controller: "fe204a00.spi".to_string(),
            conflicting_controllers: vec!["fe204000.spi".to_string(), "fe204c00.spi".to_string()],
            irq: None,
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self { interval_secs: 10 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            backend: LogBackend::Env,
            level: "info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            driver: DriverConfig::default(),
            platform: PlatformConfig::Simulate {
                packets_per_second: 100,
            },
            discovery: DiscoveryConfig::default(),
            outputs: vec![],
            stats: StatsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_yaml() {
        let yaml = r#"
platform:
  kind: linux
  uio_device: /dev/uio0
outputs:
  - receiver: 0
    target: 127.0.0.1:9001
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.platform,
            PlatformConfig::Linux {
                uio_device: "/dev/uio0".to_string()
            }
        );
        assert_eq!(config.outputs.len(), 1);
        assert_eq!(config.discovery.completion_controller, "fe204a00.spi");
        assert_eq!(config.driver.timeout_ticks, 5);
        assert_eq!(config.stats.interval_secs, 10);
        assert_eq!(config.logging.backend, LogBackend::Env);
    }

    #[test]
    fn test_driver_overrides() {
        let yaml = r#"
driver:
  tick_period_ms: 50
platform:
  kind: simulate
  packets_per_second: 20
logging:
  backend: syslog
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.driver.tick_period_ms, 50);
        assert_eq!(config.driver.ring_capacity, 4096);
        assert_eq!(config.logging.backend, LogBackend::Syslog);
        assert_eq!(config.logging.level, "info");
    }
}
