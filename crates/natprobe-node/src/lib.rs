//! natprobe Node -- library crate for gateway NAT discovery.
//!
//! Re-exports the engine, its transport seams, the discovery task and config
//! so the binary and integration tests share one code path.

pub mod config;
pub mod discovery_task;
pub mod nat_discovery;
pub mod request_handle;
pub mod response_handle;
pub mod transport;

pub use nat_discovery::{DiscoveryError, NatDiscovery};

use std::path::PathBuf;

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
