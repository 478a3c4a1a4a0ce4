//! natprobe Discovery -- peer NAT state table and probe scheduling.
//!
//! Pure state, no I/O: the engine asks the table which probes to send, sends
//! them outside the lock, and feeds responses back in. Time is passed in
//! explicitly so retry and give-up behaviour is testable without sleeping.

pub mod remote;

pub use remote::{AddressRole, NatEndpointInfo, RemoteEndpointNat, RoleProbe, RoleState};

use natprobe_endpoint::{EndpointIdentity, EndpointSpec, IpFamily};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

/// Default delay before the first retry.
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(1);

/// Default ceiling on the retry delay.
pub const DEFAULT_RETRY_MAX: Duration = Duration::from_secs(16);

/// Default probes per role before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 6;

/// Doubling stops growing the delay after this many attempts.
const BACKOFF_SATURATION: u32 = 16;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("received response from unknown endpoint {0:?}")]
    UnknownEndpoint(String),
    #[error(
        "received response for unknown request id {request_id:#x} from {endpoint:?}, \
         last public request id: {last_public:?}, last private request id: {last_private:?}"
    )]
    UnknownRequestId {
        endpoint: String,
        request_id: u32,
        last_public: Option<u32>,
        last_private: Option<u32>,
    },
    #[error(
        "response for NAT discovery on endpoint {endpoint:?} private IP {expected:?} comes from \
         different IP {observed}, NAT on private IPs is unlikely and filtered for security reasons"
    )]
    SpoofedPrivateResponse {
        endpoint: String,
        expected: Option<IpAddr>,
        observed: IpAddr,
    },
}

/// Retry and re-validation timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTiming {
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub max_attempts: u32,
    /// Re-probe resolved roles this often; `None` disables re-validation.
    pub revalidate_interval: Option<Duration>,
}

impl Default for ProbeTiming {
    fn default() -> Self {
        Self {
            retry_base: DEFAULT_RETRY_BASE,
            retry_max: DEFAULT_RETRY_MAX,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            revalidate_interval: None,
        }
    }
}

impl ProbeTiming {
    /// Wait after the `attempt`-th probe: min(base * 2^(attempt-1), max).
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(BACKOFF_SATURATION);
        self.retry_base
            .saturating_mul(1u32 << shift)
            .min(self.retry_max)
    }
}

/// A probe the engine must send. Already recorded as pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedProbe {
    pub endpoint_id: String,
    pub receiver: EndpointIdentity,
    pub role: AddressRole,
    pub request_id: u32,
    pub destination: SocketAddr,
}

/// Work produced by one scheduling tick.
#[derive(Debug, Default)]
pub struct TickActions {
    pub probes: Vec<PlannedProbe>,
    /// Endpoints that gave up; publish these records.
    pub fallbacks: Vec<NatEndpointInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// New remote; probe it.
    Added,
    /// Same spec already tracked; nothing to do.
    Unchanged,
    /// Spec changed; state was reset, probe again.
    Replaced,
    /// Remote runs no discovery responder; publish this record as-is.
    Legacy(Option<NatEndpointInfo>),
}

/// Table of remote endpoints under discovery, keyed by endpoint ID.
pub struct NatTable {
    remotes: HashMap<String, RemoteEndpointNat>,
    timing: ProbeTiming,
    family: IpFamily,
    next_request_id: u32,
}

impl NatTable {
    pub fn new(timing: ProbeTiming, family: IpFamily) -> Self {
        Self::with_first_request_id(timing, family, rand::random())
    }

    pub fn with_first_request_id(timing: ProbeTiming, family: IpFamily, first: u32) -> Self {
        Self {
            remotes: HashMap::new(),
            timing,
            family,
            next_request_id: first,
        }
    }

    pub fn timing(&self) -> &ProbeTiming {
        &self.timing
    }

    pub fn family(&self) -> IpFamily {
        self.family
    }

    pub fn len(&self) -> usize {
        self.remotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remotes.is_empty()
    }

    pub fn get(&self, endpoint_id: &str) -> Option<&RemoteEndpointNat> {
        self.remotes.get(endpoint_id)
    }

    pub fn endpoint_ids(&self) -> impl Iterator<Item = &String> {
        self.remotes.keys()
    }

    /// Start tracking a remote, or refresh it if its spec changed.
    pub fn add_endpoint(&mut self, spec: EndpointSpec, now: Instant) -> AddOutcome {
        let endpoint_id = spec.cable_name.clone();

        let discovery_port = match spec.nat_discovery_port() {
            Ok(Some(port)) => port,
            Ok(None) => {
                tracing::info!(
                    endpoint = %endpoint_id,
                    "nat: remote does not run NAT discovery, using legacy settings"
                );
                return self.legacy_outcome(spec, now);
            }
            Err(e) => {
                tracing::warn!(endpoint = %endpoint_id, "nat: {e}, using legacy settings");
                return self.legacy_outcome(spec, now);
            }
        };

        if let Some(existing) = self.remotes.get(&endpoint_id) {
            if existing.endpoint == spec {
                return AddOutcome::Unchanged;
            }
        }

        let replaced = self
            .remotes
            .insert(
                endpoint_id.clone(),
                RemoteEndpointNat::new(spec, self.family, discovery_port, now),
            )
            .is_some();

        tracing::info!(
            endpoint = %endpoint_id,
            replaced,
            table_size = self.remotes.len(),
            "nat: remote endpoint tracked"
        );

        if replaced {
            AddOutcome::Replaced
        } else {
            AddOutcome::Added
        }
    }

    fn legacy_outcome(&mut self, spec: EndpointSpec, now: Instant) -> AddOutcome {
        self.remotes.remove(&spec.cable_name);
        let remote = RemoteEndpointNat::new(spec, self.family, 0, now);
        AddOutcome::Legacy(remote.fallback_endpoint_info())
    }

    pub fn remove_endpoint(&mut self, endpoint_id: &str) -> Option<RemoteEndpointNat> {
        let removed = self.remotes.remove(endpoint_id);
        if removed.is_some() {
            tracing::info!(
                endpoint = endpoint_id,
                table_size = self.remotes.len(),
                "nat: remote endpoint removed"
            );
        }
        removed
    }

    /// Allocate a request number no outstanding probe is using.
    fn allocate_request_id(&mut self) -> u32 {
        loop {
            let id = self.next_request_id;
            self.next_request_id = self.next_request_id.wrapping_add(1);
            let in_use = self.remotes.values().any(|r| {
                r.public.last_request_id == Some(id) || r.private.last_request_id == Some(id)
            });
            if !in_use {
                return id;
            }
        }
    }

    fn plan_role(&mut self, endpoint_id: &str, role: AddressRole, now: Instant) -> Option<PlannedProbe> {
        let request_id = self.allocate_request_id();
        let timing = self.timing.clone();
        let remote = self.remotes.get_mut(endpoint_id)?;
        let ip = remote.address_for(role)?;

        remote.role_mut(role).record_request(request_id, now, &timing);

        Some(PlannedProbe {
            endpoint_id: endpoint_id.to_string(),
            receiver: remote.endpoint.identity(),
            role,
            request_id,
            destination: SocketAddr::new(ip, remote.discovery_port),
        })
    }

    /// Probe every advertised role of a remote now.
    ///
    /// Request ids are recorded before this returns, so a response that
    /// races the send still correlates.
    pub fn plan_check_request(&mut self, endpoint_id: &str, now: Instant) -> Vec<PlannedProbe> {
        let roles = match self.remotes.get(endpoint_id) {
            Some(remote) => remote.advertised_roles(),
            None => return Vec::new(),
        };

        roles
            .into_iter()
            .filter_map(|role| self.plan_role(endpoint_id, role, now))
            .collect()
    }

    /// One scheduling pass: retries, re-validation and give-up.
    pub fn tick(&mut self, now: Instant) -> TickActions {
        let mut actions = TickActions::default();
        let ids: Vec<String> = self.remotes.keys().cloned().collect();

        for id in ids {
            for role in [AddressRole::Private, AddressRole::Public] {
                if let Some(probe) = self.tick_role(&id, role, now) {
                    actions.probes.push(probe);
                }
            }

            if let Some(remote) = self.remotes.get_mut(&id) {
                if let Some(info) = Self::check_give_up(remote) {
                    actions.fallbacks.push(info);
                }
            }
        }

        actions
    }

    fn tick_role(&mut self, endpoint_id: &str, role: AddressRole, now: Instant) -> Option<PlannedProbe> {
        let max_attempts = self.timing.max_attempts;
        let revalidate = self.timing.revalidate_interval;

        let remote = self.remotes.get_mut(endpoint_id)?;
        remote.address_for(role)?;
        let probe = remote.role_mut(role);

        let due = match probe.state {
            RoleState::Unresolved => probe.attempts == 0 && !probe.exhausted,
            RoleState::Pending { previous, .. } => {
                if !probe.retry_due(now) {
                    false
                } else if probe.attempts >= max_attempts {
                    match previous {
                        // re-validation went unanswered; keep the known outcome
                        Some(use_nat) => {
                            probe.state = RoleState::Resolved { use_nat };
                            probe.attempts = 0;
                            probe.next_probe_at = None;
                            probe.resolved_at = Some(now);
                        }
                        None => {
                            probe.exhausted = true;
                            probe.next_probe_at = None;
                            tracing::warn!(
                                endpoint = endpoint_id,
                                role = role.name(),
                                attempts = probe.attempts,
                                "nat: no response to NAT discovery, giving up on role"
                            );
                        }
                    }
                    false
                } else {
                    true
                }
            }
            RoleState::Resolved { .. } => match (revalidate, probe.resolved_at) {
                (Some(interval), Some(at)) => now.duration_since(at) >= interval,
                _ => false,
            },
        };

        if !due {
            return None;
        }

        tracing::debug!(endpoint = endpoint_id, role = role.name(), "nat: probe due");
        self.plan_role(endpoint_id, role, now)
    }

    /// Fallback record once every advertised role gave up and none resolved.
    fn check_give_up(remote: &mut RemoteEndpointNat) -> Option<NatEndpointInfo> {
        if remote.fallback_published || remote.any_resolved() {
            return None;
        }
        let roles = remote.advertised_roles();
        if !roles.iter().all(|role| remote.role(*role).exhausted) {
            return None;
        }

        remote.fallback_published = true;
        let info = remote.fallback_endpoint_info()?;
        remote.last_published = Some(info.clone());
        tracing::warn!(
            endpoint = %remote.endpoint.cable_name,
            use_ip = %info.use_ip,
            "nat: discovery failed, falling back to public address with NAT"
        );
        Some(info)
    }

    /// Correlate a successful response with an outstanding probe.
    ///
    /// Returns the record to publish when the outcome changed and differs
    /// from the last record published. The caller has already rejected
    /// malformed responses and non-success codes.
    pub fn handle_response(
        &mut self,
        sender_id: &str,
        request_id: u32,
        observed_ip: IpAddr,
        use_nat: bool,
        now: Instant,
    ) -> Result<Option<NatEndpointInfo>, CorrelationError> {
        let remote = self
            .remotes
            .get_mut(sender_id)
            .ok_or_else(|| CorrelationError::UnknownEndpoint(sender_id.to_string()))?;

        if remote.public.last_request_id == Some(request_id) {
            if !remote.transition_to_public_ip(sender_id, use_nat, now) {
                return Ok(None);
            }
            return Ok(remote.take_unpublished_record());
        }

        if remote.private.last_request_id == Some(request_id) {
            let expected = remote.private_ip();
            if expected != Some(observed_ip) {
                return Err(CorrelationError::SpoofedPrivateResponse {
                    endpoint: sender_id.to_string(),
                    expected,
                    observed: observed_ip,
                });
            }

            if use_nat {
                tracing::warn!(
                    endpoint = sender_id,
                    private_ip = %observed_ip,
                    "nat: response for private IP says src was modified, which is unexpected"
                );
            }

            if !remote.transition_to_private_ip(sender_id, use_nat, now) {
                return Ok(None);
            }
            return Ok(remote.take_unpublished_record());
        }

        Err(CorrelationError::UnknownRequestId {
            endpoint: sender_id.to_string(),
            request_id,
            last_public: remote.public.last_request_id,
            last_private: remote.private.last_request_id,
        })
    }
}
