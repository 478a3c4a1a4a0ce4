//! Per-role address sets keyed by IP family.
//!
//! One ordered list, at most one entry per family. The legacy single-address
//! value older consumers read is derived from the IPv4 entry, never stored.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    #[serde(alias = "ipv4")]
    V4,
    #[serde(alias = "ipv6")]
    V6,
}

impl IpFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => f.write_str("IPv4"),
            IpFamily::V6 => f.write_str("IPv6"),
        }
    }
}

/// Ordered address list holding at most one address per family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<IpAddr>", into = "Vec<IpAddr>")]
pub struct AddressSet {
    ips: Vec<IpAddr>,
}

impl AddressSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a family-indexed list plus the legacy scalar field.
    ///
    /// The legacy value only fills the IPv4 slot when the list has none.
    pub fn from_parts(ips: impl IntoIterator<Item = IpAddr>, legacy: Option<IpAddr>) -> Self {
        let mut set = Self::new();
        for ip in ips {
            if set.get(IpFamily::of(&ip)).is_none() {
                set.ips.push(ip);
            }
        }
        if let Some(legacy) = legacy {
            if set.get(IpFamily::V4).is_none() && IpFamily::of(&legacy) == IpFamily::V4 {
                set.ips.push(legacy);
            }
        }
        set
    }

    pub fn get(&self, family: IpFamily) -> Option<IpAddr> {
        self.ips
            .iter()
            .copied()
            .find(|ip| IpFamily::of(ip) == family)
    }

    /// Replace the entry for `ip`'s family, or append one.
    pub fn set(&mut self, ip: IpAddr) {
        let family = IpFamily::of(&ip);
        match self.ips.iter_mut().find(|e| IpFamily::of(e) == family) {
            Some(existing) => *existing = ip,
            None => self.ips.push(ip),
        }
    }

    pub fn remove(&mut self, family: IpFamily) -> Option<IpAddr> {
        let idx = self.ips.iter().position(|ip| IpFamily::of(ip) == family)?;
        Some(self.ips.remove(idx))
    }

    /// The legacy single-address value: the IPv4 entry.
    pub fn legacy(&self) -> Option<IpAddr> {
        self.get(IpFamily::V4)
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpAddr> {
        self.ips.iter()
    }

    pub fn len(&self) -> usize {
        self.ips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty()
    }
}

impl From<Vec<IpAddr>> for AddressSet {
    fn from(ips: Vec<IpAddr>) -> Self {
        Self::from_parts(ips, None)
    }
}

impl From<AddressSet> for Vec<IpAddr> {
    fn from(set: AddressSet) -> Self {
        set.ips
    }
}
