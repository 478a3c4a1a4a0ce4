//! NAT discovery engine -- probe dispatch and inbound datagram routing.
//!
//! The peer table lives behind one async mutex. It is held only while the
//! table is read or mutated (and while resulting records are queued, so one
//! endpoint's records leave in the order they were determined); every socket
//! send happens after the guard is dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use natprobe_discovery::{
    AddOutcome, CorrelationError, NatEndpointInfo, NatTable, PlannedProbe, ProbeTiming,
    RemoteEndpointNat,
};
use natprobe_endpoint::{EndpointIdentity, EndpointSpec, IpFamily, LocalEndpoint};
use natprobe_protocol::{
    decode_message, encode_message, DiscoveryMessage, DiscoveryRequest, EndpointDetails,
    IpPortPair, ProtocolError, ResponseType,
};
use tokio::sync::{mpsc, Mutex};

use crate::transport::{DatagramTransport, SourceResolver};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Correlation(#[from] CorrelationError),
    #[error("malformed response: missing {0}")]
    MalformedResponse(&'static str),
    #[error("remote endpoint {endpoint:?} responded with {code}")]
    RemoteError { endpoint: String, code: ResponseType },
    #[error("short write: sent {sent} of {expected} bytes")]
    ShortWrite { sent: usize, expected: usize },
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

pub(crate) fn endpoint_details(identity: EndpointIdentity) -> EndpointDetails {
    EndpointDetails {
        cluster_id: identity.cluster_id,
        endpoint_id: identity.endpoint_id,
    }
}

/// Cloneable handle to one discovery engine.
#[derive(Clone)]
pub struct NatDiscovery {
    pub(crate) table: Arc<Mutex<NatTable>>,
    pub(crate) local: LocalEndpoint,
    pub(crate) family: IpFamily,
    transport: Arc<dyn DatagramTransport>,
    resolver: Arc<dyn SourceResolver>,
    ready_tx: mpsc::UnboundedSender<NatEndpointInfo>,
    local_port: u16,
}

impl NatDiscovery {
    pub fn new(
        local: LocalEndpoint,
        transport: Arc<dyn DatagramTransport>,
        resolver: Arc<dyn SourceResolver>,
        timing: ProbeTiming,
        family: IpFamily,
        ready_tx: mpsc::UnboundedSender<NatEndpointInfo>,
    ) -> Result<Self, DiscoveryError> {
        let local_port = transport.local_addr()?.port();
        Ok(Self {
            table: Arc::new(Mutex::new(NatTable::new(timing, family))),
            local,
            family,
            transport,
            resolver,
            ready_tx,
            local_port,
        })
    }

    pub fn transport(&self) -> &Arc<dyn DatagramTransport> {
        &self.transport
    }

    pub fn local_endpoint(&self) -> &LocalEndpoint {
        &self.local
    }

    /// Copy of the discovery state for one remote.
    pub async fn remote(&self, endpoint_id: &str) -> Option<RemoteEndpointNat> {
        self.table.lock().await.get(endpoint_id).cloned()
    }

    /// Start discovery for a remote endpoint entering the federation.
    pub async fn add_endpoint(&self, spec: EndpointSpec) -> Result<(), DiscoveryError> {
        let local = self.local.spec();
        if spec.cluster_id == local.cluster_id {
            tracing::debug!(
                endpoint = %spec.cable_name,
                cluster = %spec.cluster_id,
                "nat: skipping endpoint of the local cluster"
            );
            return Ok(());
        }

        let endpoint_id = spec.cable_name.clone();
        let now = Instant::now();
        let probes = {
            let mut table = self.table.lock().await;
            match table.add_endpoint(spec, now) {
                AddOutcome::Added | AddOutcome::Replaced => {
                    table.plan_check_request(&endpoint_id, now)
                }
                AddOutcome::Unchanged => Vec::new(),
                AddOutcome::Legacy(Some(info)) => {
                    self.publish(info);
                    Vec::new()
                }
                AddOutcome::Legacy(None) => {
                    tracing::warn!(
                        endpoint = %endpoint_id,
                        "nat: legacy endpoint advertises no usable address"
                    );
                    Vec::new()
                }
            }
        };

        self.send_probes(&probes).await
    }

    pub async fn remove_endpoint(&self, endpoint_id: &str) {
        self.table.lock().await.remove_endpoint(endpoint_id);
    }

    /// Probe every advertised address of a remote right now.
    pub async fn send_check_request(&self, endpoint_id: &str) -> Result<(), DiscoveryError> {
        let probes = self
            .table
            .lock()
            .await
            .plan_check_request(endpoint_id, Instant::now());
        self.send_probes(&probes).await
    }

    /// One scheduling pass: retries, re-validation and give-up fallbacks.
    pub async fn check_endpoints(&self) {
        let probes = {
            let mut table = self.table.lock().await;
            let actions = table.tick(Instant::now());
            for info in actions.fallbacks {
                self.publish(info);
            }
            actions.probes
        };

        // failures are logged by send_probes; the role stays pending
        let _ = self.send_probes(&probes).await;
    }

    /// Route one received datagram to the request or response path.
    pub async fn handle_datagram(&self, data: &[u8], src: SocketAddr) -> Result<(), DiscoveryError> {
        match decode_message(data)? {
            DiscoveryMessage::Request(request) => {
                self.handle_request_from_address(request, src).await
            }
            DiscoveryMessage::Response(response) => {
                self.handle_response_from_address(response, src).await
            }
        }
    }

    /// Send every probe; a failed send does not stop the others.
    /// Returns the first error.
    async fn send_probes(&self, probes: &[PlannedProbe]) -> Result<(), DiscoveryError> {
        let mut first_error = None;
        for probe in probes {
            if let Err(e) = self.send_request(probe).await {
                tracing::warn!(
                    endpoint = %probe.endpoint_id,
                    role = probe.role.name(),
                    destination = %probe.destination,
                    request_number = probe.request_id,
                    "nat: failed to send discovery request: {e}"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn send_request(&self, probe: &PlannedProbe) -> Result<(), DiscoveryError> {
        let local = self.local.spec();
        let dst = probe.destination;
        let source_ip = self
            .resolver
            .source_for(dst.ip())
            .map(|ip| ip.to_string())
            .unwrap_or_default();

        let request = DiscoveryRequest {
            request_number: probe.request_id,
            sender: Some(endpoint_details(local.identity())),
            receiver: Some(endpoint_details(probe.receiver.clone())),
            using_src: Some(IpPortPair::new(&source_ip, self.local_port)),
            using_dst: Some(IpPortPair::new(dst.ip(), dst.port())),
        };

        tracing::debug!(
            request_number = probe.request_id,
            endpoint = %probe.endpoint_id,
            role = probe.role.name(),
            using_src = %source_ip,
            using_dst = %dst,
            "nat: sending discovery request"
        );

        self.send_datagram(&DiscoveryMessage::Request(request), dst)
            .await
    }

    pub(crate) async fn send_datagram(
        &self,
        message: &DiscoveryMessage,
        dst: SocketAddr,
    ) -> Result<(), DiscoveryError> {
        let bytes = encode_message(message)?;
        let sent = self.transport.send_to(&bytes, dst).await?;
        if sent != bytes.len() {
            return Err(DiscoveryError::ShortWrite {
                sent,
                expected: bytes.len(),
            });
        }
        Ok(())
    }

    /// Queue a record for the consumer. Never blocks.
    pub(crate) fn publish(&self, info: NatEndpointInfo) {
        tracing::info!(
            endpoint = %info.endpoint.cable_name,
            use_ip = %info.use_ip,
            use_port = info.use_port,
            use_nat = info.use_nat,
            selected = info.selected.map_or("fallback", |r| r.name()),
            "nat: endpoint ready"
        );
        if self.ready_tx.send(info).is_err() {
            tracing::debug!("nat: ready channel closed, record dropped");
        }
    }
}
