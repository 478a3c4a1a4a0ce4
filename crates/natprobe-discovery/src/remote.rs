//! Per-remote NAT discovery state.
//!
//! Each remote endpoint has two independently probed roles, public and
//! private. A role moves `Unresolved -> Pending -> Resolved(use_nat)` and
//! re-enters `Pending` whenever a fresh probe goes out. Correlation uses the
//! last request id sent for the role, which survives resolution so that
//! retransmitted responses are recognised and ignored.

use natprobe_endpoint::{EndpointSpec, IpFamily, DEFAULT_UDP_PORT};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Instant;

use crate::ProbeTiming;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressRole {
    Public,
    Private,
}

impl AddressRole {
    pub fn name(&self) -> &'static str {
        match self {
            AddressRole::Public => "public",
            AddressRole::Private => "private",
        }
    }
}

impl fmt::Display for AddressRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleState {
    Unresolved,
    /// Probe outstanding. `previous` is the outcome before this probe, if any.
    Pending {
        request_id: u32,
        previous: Option<bool>,
    },
    Resolved {
        use_nat: bool,
    },
}

impl RoleState {
    /// Best known outcome: the resolution, or the one being re-validated.
    pub fn resolved_nat(&self) -> Option<bool> {
        match self {
            RoleState::Resolved { use_nat } => Some(*use_nat),
            RoleState::Pending { previous, .. } => *previous,
            RoleState::Unresolved => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, RoleState::Resolved { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            RoleState::Unresolved => "unresolved",
            RoleState::Pending { .. } => "pending",
            RoleState::Resolved { .. } => "resolved",
        }
    }
}

/// Probe bookkeeping for one role of one remote.
#[derive(Debug, Clone)]
pub struct RoleProbe {
    pub state: RoleState,
    pub last_request_id: Option<u32>,
    /// Probes sent since the role last settled.
    pub attempts: u32,
    pub next_probe_at: Option<Instant>,
    pub resolved_at: Option<Instant>,
    /// Gave up after `max_attempts` without an answer.
    pub exhausted: bool,
}

impl Default for RoleProbe {
    fn default() -> Self {
        Self {
            state: RoleState::Unresolved,
            last_request_id: None,
            attempts: 0,
            next_probe_at: None,
            resolved_at: None,
            exhausted: false,
        }
    }
}

impl RoleProbe {
    /// Record an outgoing probe. Overwrites the previous request id.
    pub(crate) fn record_request(&mut self, request_id: u32, now: Instant, timing: &ProbeTiming) {
        let previous = self.state.resolved_nat();
        self.state = RoleState::Pending {
            request_id,
            previous,
        };
        self.last_request_id = Some(request_id);
        self.attempts += 1;
        self.exhausted = false;
        self.next_probe_at = Some(now + timing.retry_backoff(self.attempts));
    }

    /// Returns true only when the known outcome changed.
    pub(crate) fn transition(&mut self, use_nat: bool, now: Instant) -> bool {
        let changed = match self.state {
            RoleState::Resolved { use_nat: current } if current == use_nat => return false,
            RoleState::Pending {
                previous: Some(previous),
                ..
            } => previous != use_nat,
            _ => true,
        };

        self.state = RoleState::Resolved { use_nat };
        self.attempts = 0;
        self.next_probe_at = None;
        self.resolved_at = Some(now);
        self.exhausted = false;
        changed
    }

    pub(crate) fn retry_due(&self, now: Instant) -> bool {
        matches!(self.state, RoleState::Pending { .. })
            && !self.exhausted
            && self.next_probe_at.is_some_and(|t| now >= t)
    }
}

/// Resolved Endpoint Record handed to the tunnel layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatEndpointInfo {
    pub endpoint: EndpointSpec,
    pub use_ip: IpAddr,
    pub use_port: u16,
    pub use_nat: bool,
    /// Role that produced the record; `None` when discovery gave up.
    pub selected: Option<AddressRole>,
}

impl NatEndpointInfo {
    pub fn is_fallback(&self) -> bool {
        self.selected.is_none()
    }
}

/// NAT discovery state for one remote endpoint.
#[derive(Debug, Clone)]
pub struct RemoteEndpointNat {
    pub(crate) endpoint: EndpointSpec,
    pub(crate) family: IpFamily,
    pub(crate) discovery_port: u16,
    pub(crate) public: RoleProbe,
    pub(crate) private: RoleProbe,
    pub(crate) started: Instant,
    pub(crate) fallback_published: bool,
    /// Last record handed out, so an identical one is not sent twice.
    pub(crate) last_published: Option<NatEndpointInfo>,
}

impl RemoteEndpointNat {
    pub fn new(endpoint: EndpointSpec, family: IpFamily, discovery_port: u16, now: Instant) -> Self {
        Self {
            endpoint,
            family,
            discovery_port,
            public: RoleProbe::default(),
            private: RoleProbe::default(),
            started: now,
            fallback_published: false,
            last_published: None,
        }
    }

    pub fn endpoint(&self) -> &EndpointSpec {
        &self.endpoint
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint.cable_name
    }

    pub fn discovery_port(&self) -> u16 {
        self.discovery_port
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn role(&self, role: AddressRole) -> &RoleProbe {
        match role {
            AddressRole::Public => &self.public,
            AddressRole::Private => &self.private,
        }
    }

    pub(crate) fn role_mut(&mut self, role: AddressRole) -> &mut RoleProbe {
        match role {
            AddressRole::Public => &mut self.public,
            AddressRole::Private => &mut self.private,
        }
    }

    pub fn last_public_request_id(&self) -> Option<u32> {
        self.public.last_request_id
    }

    pub fn last_private_request_id(&self) -> Option<u32> {
        self.private.last_request_id
    }

    pub fn public_ip(&self) -> Option<IpAddr> {
        self.endpoint.get_public_ip(self.family)
    }

    pub fn private_ip(&self) -> Option<IpAddr> {
        self.endpoint.get_private_ip(self.family)
    }

    /// Address probed for `role`, if the remote advertises one.
    pub fn address_for(&self, role: AddressRole) -> Option<IpAddr> {
        match role {
            AddressRole::Public => self.public_ip(),
            AddressRole::Private => self.private_ip(),
        }
    }

    /// Roles the remote advertises an address for, private first.
    pub fn advertised_roles(&self) -> Vec<AddressRole> {
        [AddressRole::Private, AddressRole::Public]
            .into_iter()
            .filter(|role| self.address_for(*role).is_some())
            .collect()
    }

    pub fn transition_to_public_ip(&mut self, sender_id: &str, use_nat: bool, now: Instant) -> bool {
        let changed = self.public.transition(use_nat, now);
        if changed {
            tracing::info!(
                endpoint = sender_id,
                ip = ?self.public_ip(),
                use_nat,
                "nat: public IP resolved"
            );
        } else {
            tracing::debug!(endpoint = sender_id, use_nat, "nat: public IP unchanged");
        }
        changed
    }

    /// The caller must already have checked the response came from the
    /// private address on record.
    pub fn transition_to_private_ip(&mut self, sender_id: &str, use_nat: bool, now: Instant) -> bool {
        let changed = self.private.transition(use_nat, now);
        if changed {
            tracing::info!(
                endpoint = sender_id,
                ip = ?self.private_ip(),
                use_nat,
                "nat: private IP resolved"
            );
        } else {
            tracing::debug!(endpoint = sender_id, use_nat, "nat: private IP unchanged");
        }
        changed
    }

    /// Build the dial-able record from the resolved roles.
    ///
    /// Private wins when it resolved without NAT; otherwise public; a private
    /// address behind NAT is the last resort.
    pub fn to_nat_endpoint_info(&self) -> Option<NatEndpointInfo> {
        let private = self.private.state.resolved_nat().zip(self.private_ip());
        let public = self.public.state.resolved_nat().zip(self.public_ip());

        let (role, use_nat, ip) = match (private, public) {
            (Some((false, ip)), _) => (AddressRole::Private, false, ip),
            (_, Some((use_nat, ip))) => (AddressRole::Public, use_nat, ip),
            (Some((true, ip)), None) => (AddressRole::Private, true, ip),
            (None, None) => return None,
        };

        Some(self.record(ip, use_nat, Some(role)))
    }

    /// Record used when discovery cannot resolve: public (or legacy) address,
    /// NAT assumed.
    pub fn fallback_endpoint_info(&self) -> Option<NatEndpointInfo> {
        let ip = self.public_ip().or_else(|| self.private_ip())?;
        Some(self.record(ip, true, None))
    }

    /// The current record, unless it equals the last one handed out.
    pub(crate) fn take_unpublished_record(&mut self) -> Option<NatEndpointInfo> {
        let info = self.to_nat_endpoint_info()?;
        if self.last_published.as_ref() == Some(&info) {
            return None;
        }
        self.last_published = Some(info.clone());
        Some(info)
    }

    pub fn any_resolved(&self) -> bool {
        self.public.state.resolved_nat().is_some() || self.private.state.resolved_nat().is_some()
    }

    fn record(&self, use_ip: IpAddr, use_nat: bool, selected: Option<AddressRole>) -> NatEndpointInfo {
        let use_port = self.endpoint.tunnel_port().unwrap_or_else(|e| {
            tracing::warn!(endpoint = %self.endpoint.cable_name, "nat: {e}, using default tunnel port");
            DEFAULT_UDP_PORT
        });

        NatEndpointInfo {
            endpoint: self.endpoint.clone(),
            use_ip,
            use_port,
            use_nat,
            selected,
        }
    }
}
