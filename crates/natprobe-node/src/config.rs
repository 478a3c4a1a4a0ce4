//! Configuration types for natprobe-node.
//! Parsed from ~/.natprobe/config.toml.

use natprobe_discovery::ProbeTiming;
use natprobe_endpoint::{EndpointSpec, IpFamily, NATT_DISCOVERY_PORT_CONFIG};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This gateway's advertised endpoint.
    pub local: EndpointSpec,
    #[serde(default)]
    pub discovery: DiscoverySection,
    /// Static endpoint directory: remote gateways to discover.
    #[serde(default)]
    pub remotes: Vec<EndpointSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Re-probe resolved endpoints this often. Unset disables re-validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revalidate_interval_secs: Option<u64>,
    #[serde(default = "default_ip_family")]
    pub ip_family: IpFamily,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            tick_interval_ms: default_tick_interval_ms(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            max_attempts: default_max_attempts(),
            revalidate_interval_secs: None,
            ip_family: default_ip_family(),
        }
    }
}

impl DiscoverySection {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.bind_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid discovery bind_addr {:?}: {e}", self.bind_addr))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn probe_timing(&self) -> ProbeTiming {
        ProbeTiming {
            retry_base: Duration::from_millis(self.retry_base_ms),
            retry_max: Duration::from_millis(self.retry_max_ms.max(self.retry_base_ms)),
            max_attempts: self.max_attempts.max(1),
            revalidate_interval: self.revalidate_interval_secs.map(Duration::from_secs),
        }
    }
}

// Default value functions
fn default_bind_addr() -> String {
    "0.0.0.0:4490".into()
}
fn default_tick_interval_ms() -> u64 {
    1000
}
fn default_retry_base_ms() -> u64 {
    1000
}
fn default_retry_max_ms() -> u64 {
    16_000
}
fn default_max_attempts() -> u32 {
    6
}
fn default_ip_family() -> IpFamily {
    IpFamily::V4
}

impl NodeConfig {
    /// Load config from file, or use defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Local endpoint as advertised to peers.
    ///
    /// Validates the identity and fills `natt-discovery-port` from the bind
    /// address when the operator did not set it.
    pub fn local_endpoint(&self) -> anyhow::Result<EndpointSpec> {
        let mut spec = self.local.clone();
        spec.generate_name()?;

        let bind = self.discovery.bind_addr()?;
        spec.backend_config
            .entry(NATT_DISCOVERY_PORT_CONFIG.to_string())
            .or_insert_with(|| bind.port().to_string());
        spec.nat_discovery_port()?;

        Ok(spec)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            local: EndpointSpec::new("cluster1", "gateway1"),
            discovery: DiscoverySection::default(),
            remotes: Vec::new(),
        }
    }
}
