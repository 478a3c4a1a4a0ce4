//! Wire message types for NAT discovery.
//!
//! A gateway probes a remote with a `DiscoveryRequest` declaring the addresses
//! it believes it is using; the remote answers with a `DiscoveryResponse`
//! describing what it actually observed. Every nested field is optional on the
//! wire so that handlers can detect and report malformed peers.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Shared
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDetails {
    pub cluster_id: String,
    pub endpoint_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPortPair {
    /// Textual IP; empty when the sender could not determine it.
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub port: u16,
}

impl IpPortPair {
    pub fn new(ip: impl ToString, port: u16) -> Self {
        Self {
            ip: ip.to_string(),
            port,
        }
    }
}

// ============================================================================
// Request
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    #[serde(default)]
    pub request_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<EndpointDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<EndpointDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub using_src: Option<IpPortPair>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub using_dst: Option<IpPortPair>,
}

impl DiscoveryRequest {
    pub fn sender_endpoint_id(&self) -> &str {
        self.sender.as_ref().map_or("", |s| s.endpoint_id.as_str())
    }

    pub fn receiver_endpoint_id(&self) -> &str {
        self.receiver.as_ref().map_or("", |r| r.endpoint_id.as_str())
    }
}

// ============================================================================
// Response
// ============================================================================

/// Outcome reported by the responder. Encoded as a numeric code so newer
/// peers can add codes without breaking older decoders. An absent code
/// reads as `OK`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum ResponseType {
    #[default]
    Ok,
    NatDetected,
    UnknownDstCluster,
    UnknownDstEndpoint,
    Malformed,
    Unrecognized(i32),
}

impl ResponseType {
    pub fn code(self) -> i32 {
        match self {
            ResponseType::Ok => 0,
            ResponseType::NatDetected => 1,
            ResponseType::UnknownDstCluster => 2,
            ResponseType::UnknownDstEndpoint => 3,
            ResponseType::Malformed => 4,
            ResponseType::Unrecognized(code) => code,
        }
    }

    /// `OK` or `NAT_DETECTED`: the probe reached the intended endpoint.
    pub fn is_success(self) -> bool {
        matches!(self, ResponseType::Ok | ResponseType::NatDetected)
    }
}

impl From<i32> for ResponseType {
    fn from(code: i32) -> Self {
        match code {
            0 => ResponseType::Ok,
            1 => ResponseType::NatDetected,
            2 => ResponseType::UnknownDstCluster,
            3 => ResponseType::UnknownDstEndpoint,
            4 => ResponseType::Malformed,
            other => ResponseType::Unrecognized(other),
        }
    }
}

impl From<ResponseType> for i32 {
    fn from(response: ResponseType) -> Self {
        response.code()
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseType::Ok => f.write_str("OK"),
            ResponseType::NatDetected => f.write_str("NAT_DETECTED"),
            ResponseType::UnknownDstCluster => f.write_str("UNKNOWN_DST_CLUSTER"),
            ResponseType::UnknownDstEndpoint => f.write_str("UNKNOWN_DST_ENDPOINT"),
            ResponseType::Malformed => f.write_str("MALFORMED"),
            ResponseType::Unrecognized(code) => write!(f, "{code}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    #[serde(default)]
    pub request_number: u32,
    #[serde(default)]
    pub response: ResponseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<EndpointDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<EndpointDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_src: Option<IpPortPair>,
    #[serde(default)]
    pub src_ip_nat_detected: bool,
    #[serde(default)]
    pub src_port_nat_detected: bool,
    #[serde(default)]
    pub dst_ip_nat_detected: bool,
}

impl DiscoveryResponse {
    pub fn sender_endpoint_id(&self) -> &str {
        self.sender.as_ref().map_or("", |s| s.endpoint_id.as_str())
    }

    pub fn receiver_endpoint_id(&self) -> &str {
        self.receiver.as_ref().map_or("", |r| r.endpoint_id.as_str())
    }
}

// ============================================================================
// Envelope
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMessage {
    Request(DiscoveryRequest),
    Response(DiscoveryResponse),
}

impl DiscoveryMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            DiscoveryMessage::Request(_) => "request",
            DiscoveryMessage::Response(_) => "response",
        }
    }
}
