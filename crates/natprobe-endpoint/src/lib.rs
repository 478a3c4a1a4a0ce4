//! natprobe endpoint model -- gateway identity and advertised addresses.
//!
//! An endpoint is one gateway of one cluster. It advertises public, private
//! and health-check addresses (one per IP family) plus free-form backend
//! configuration carrying the ports it listens on.

pub mod address;
pub mod local;

pub use address::{AddressSet, IpFamily};
pub use local::LocalEndpoint;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

/// Backend config key: UDP port the NAT discovery responder listens on.
pub const NATT_DISCOVERY_PORT_CONFIG: &str = "natt-discovery-port";

/// Backend config key: UDP port tunnels are dialed on.
pub const UDP_PORT_CONFIG: &str = "udp-port";

/// Backend config key: gateway is exposed through a load balancer.
pub const USING_LOAD_BALANCER_CONFIG: &str = "using-load-balancer";

pub const DEFAULT_NATT_DISCOVERY_PORT: u16 = 4490;
pub const DEFAULT_UDP_PORT: u16 = 4500;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("cluster ID cannot be empty")]
    EmptyClusterId,
    #[error("cable name cannot be empty")]
    EmptyCableName,
    #[error("error parsing backend config {key}: invalid port {value:?}")]
    InvalidPort { key: String, value: String },
    #[error("error parsing backend config {key}: invalid bool {value:?}")]
    InvalidBool { key: String, value: String },
}

/// Federation-wide identity of a gateway endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointIdentity {
    pub cluster_id: String,
    pub endpoint_id: String,
}

impl fmt::Display for EndpointIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster_id, self.endpoint_id)
    }
}

/// Advertised state of a gateway endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawEndpointSpec")]
pub struct EndpointSpec {
    pub cluster_id: String,
    /// Endpoint ID, unique within the federation.
    pub cable_name: String,
    pub hostname: String,
    pub backend: String,
    pub public_ips: AddressSet,
    pub private_ips: AddressSet,
    pub health_check_ips: AddressSet,
    pub backend_config: BTreeMap<String, String>,
}

/// On-disk / wire form. Accepts the legacy scalar address fields.
#[derive(Deserialize)]
struct RawEndpointSpec {
    cluster_id: String,
    cable_name: String,
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    backend: String,
    #[serde(default)]
    public_ips: Vec<IpAddr>,
    #[serde(default)]
    public_ip: Option<IpAddr>,
    #[serde(default)]
    private_ips: Vec<IpAddr>,
    #[serde(default)]
    private_ip: Option<IpAddr>,
    #[serde(default)]
    health_check_ips: Vec<IpAddr>,
    #[serde(default)]
    health_check_ip: Option<IpAddr>,
    #[serde(default)]
    backend_config: BTreeMap<String, String>,
}

impl From<RawEndpointSpec> for EndpointSpec {
    fn from(raw: RawEndpointSpec) -> Self {
        Self {
            cluster_id: raw.cluster_id,
            cable_name: raw.cable_name,
            hostname: raw.hostname,
            backend: raw.backend,
            public_ips: AddressSet::from_parts(raw.public_ips, raw.public_ip),
            private_ips: AddressSet::from_parts(raw.private_ips, raw.private_ip),
            health_check_ips: AddressSet::from_parts(raw.health_check_ips, raw.health_check_ip),
            backend_config: raw.backend_config,
        }
    }
}

impl EndpointSpec {
    pub fn new(cluster_id: impl Into<String>, cable_name: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            cable_name: cable_name.into(),
            ..Default::default()
        }
    }

    pub fn identity(&self) -> EndpointIdentity {
        EndpointIdentity {
            cluster_id: self.cluster_id.clone(),
            endpoint_id: self.cable_name.clone(),
        }
    }

    pub fn get_public_ip(&self, family: IpFamily) -> Option<IpAddr> {
        self.public_ips.get(family)
    }

    pub fn set_public_ip(&mut self, ip: IpAddr) {
        self.public_ips.set(ip);
    }

    pub fn get_private_ip(&self, family: IpFamily) -> Option<IpAddr> {
        self.private_ips.get(family)
    }

    pub fn set_private_ip(&mut self, ip: IpAddr) {
        self.private_ips.set(ip);
    }

    pub fn get_health_check_ip(&self, family: IpFamily) -> Option<IpAddr> {
        self.health_check_ips.get(family)
    }

    pub fn set_health_check_ip(&mut self, ip: IpAddr) {
        self.health_check_ips.set(ip);
    }

    /// Resource name: `<cluster>-<cable>`, lowercased and sanitized.
    pub fn generate_name(&self) -> Result<String, EndpointError> {
        if self.cluster_id.is_empty() {
            return Err(EndpointError::EmptyClusterId);
        }
        if self.cable_name.is_empty() {
            return Err(EndpointError::EmptyCableName);
        }
        Ok(ensure_valid_name(&format!(
            "{}-{}",
            self.cluster_id, self.cable_name
        )))
    }

    /// Identity-level equality. Addresses are not compared.
    pub fn equals(&self, other: &EndpointSpec) -> bool {
        self.cluster_id == other.cluster_id
            && self.cable_name == other.cable_name
            && self.hostname == other.hostname
            && self.backend == other.backend
            && self.has_same_backend_config(other)
    }

    fn has_same_backend_config(&self, other: &EndpointSpec) -> bool {
        // Load-balanced gateways stamp volatile keys on start; only the mode matters.
        if self.is_using_load_balancer() && other.is_using_load_balancer() {
            return true;
        }
        self.backend_config == other.backend_config
    }

    fn is_using_load_balancer(&self) -> bool {
        self.backend_config
            .get(USING_LOAD_BALANCER_CONFIG)
            .is_some_and(|v| v == "true")
    }

    /// Port from backend config; `default` when the key is absent or empty.
    pub fn backend_port(&self, key: &str, default: u16) -> Result<u16, EndpointError> {
        match self.backend_config.get(key).map(String::as_str) {
            None | Some("") => Ok(default),
            Some(value) => parse_port(value).ok_or_else(|| EndpointError::InvalidPort {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    pub fn backend_bool(&self, key: &str, default: Option<bool>) -> Result<Option<bool>, EndpointError> {
        match self.backend_config.get(key).map(String::as_str) {
            None | Some("") => Ok(default),
            Some(value) => parse_bool(value)
                .map(Some)
                .ok_or_else(|| EndpointError::InvalidBool {
                    key: key.to_string(),
                    value: value.to_string(),
                }),
        }
    }

    /// NAT discovery port, or `None` if this endpoint does not run a responder.
    pub fn nat_discovery_port(&self) -> Result<Option<u16>, EndpointError> {
        if !self.backend_config.contains_key(NATT_DISCOVERY_PORT_CONFIG) {
            return Ok(None);
        }
        self.backend_port(NATT_DISCOVERY_PORT_CONFIG, DEFAULT_NATT_DISCOVERY_PORT)
            .map(Some)
    }

    pub fn tunnel_port(&self) -> Result<u16, EndpointError> {
        self.backend_port(UDP_PORT_CONFIG, DEFAULT_UDP_PORT)
    }
}

fn parse_port(value: &str) -> Option<u16> {
    match value.trim().parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

fn ensure_valid_name(name: &str) -> String {
    let mapped: String = name
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    mapped
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}
