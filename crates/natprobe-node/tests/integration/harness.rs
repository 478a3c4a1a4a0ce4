//! Test harness for in-process natprobe-node integration tests.
//!
//! Provides TestEngine (one discovery engine on a real loopback UDP socket),
//! TestEngineBuilder (identity, addresses, resolver) and RawPeer (a bare
//! socket for hand-crafted datagrams).

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use natprobe_discovery::{NatEndpointInfo, ProbeTiming};
use natprobe_endpoint::{EndpointSpec, IpFamily, LocalEndpoint, NATT_DISCOVERY_PORT_CONFIG};
use natprobe_node::discovery_task::{self, DirectoryEvent};
use natprobe_node::transport::{DatagramTransport, RouteSourceResolver, SourceResolver, UdpTransport};
use natprobe_node::NatDiscovery;
use natprobe_protocol::{decode_message, encode_message, DiscoveryMessage, MAX_DATAGRAM_SIZE};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

pub const TICK: Duration = Duration::from_millis(50);

pub fn fast_timing() -> ProbeTiming {
    ProbeTiming {
        retry_base: Duration::from_millis(100),
        retry_max: Duration::from_millis(400),
        max_attempts: 10,
        revalidate_interval: None,
    }
}

/// Retries far beyond any test's duration, so request ids stay put.
pub fn slow_timing() -> ProbeTiming {
    ProbeTiming {
        retry_base: Duration::from_secs(30),
        retry_max: Duration::from_secs(30),
        max_attempts: 2,
        revalidate_interval: None,
    }
}

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

/// Declares a per-destination source address, simulating NAT for chosen
/// destinations; everything else goes through the routing table.
pub struct MappedSourceResolver {
    pub overrides: HashMap<IpAddr, IpAddr>,
}

impl SourceResolver for MappedSourceResolver {
    fn source_for(&self, dst: IpAddr) -> Option<IpAddr> {
        self.overrides
            .get(&dst)
            .copied()
            .or_else(|| RouteSourceResolver.source_for(dst))
    }
}

/// A running discovery engine with its reader loop.
pub struct TestEngine {
    pub nd: NatDiscovery,
    pub addr: SocketAddr,
    pub spec: EndpointSpec,
    ready_rx: mpsc::UnboundedReceiver<NatEndpointInfo>,
    events_tx: mpsc::Sender<DirectoryEvent>,
    shutdown_tx: broadcast::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

#[allow(dead_code)]
impl TestEngine {
    pub async fn add_remote(&self, spec: EndpointSpec) {
        self.events_tx
            .send(DirectoryEvent::Added(spec))
            .await
            .unwrap();
    }

    pub async fn remove_remote(&self, endpoint_id: &str) {
        self.events_tx
            .send(DirectoryEvent::Removed(endpoint_id.to_string()))
            .await
            .unwrap();
    }

    /// Wait for the next published record.
    pub async fn next_record(&mut self, timeout: Duration) -> anyhow::Result<NatEndpointInfo> {
        match tokio::time::timeout(timeout, self.ready_rx.recv()).await {
            Ok(Some(info)) => Ok(info),
            Ok(None) => anyhow::bail!("ready channel closed"),
            Err(_) => anyhow::bail!("timeout waiting for resolved endpoint record"),
        }
    }

    /// Collect records until one matches `pred`, or timeout.
    pub async fn wait_record<F>(
        &mut self,
        timeout: Duration,
        pred: F,
    ) -> anyhow::Result<Vec<NatEndpointInfo>>
    where
        F: Fn(&NatEndpointInfo) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut seen = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let info = match self.next_record(remaining).await {
                Ok(info) => info,
                Err(e) => anyhow::bail!("{e}; records so far: {seen:?}"),
            };
            let done = pred(&info);
            seen.push(info);
            if done {
                return Ok(seen);
            }
        }
    }

    /// Assert nothing is published for `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        if let Ok(info) = self.next_record(window).await {
            panic!("unexpected record published: {info:?}");
        }
    }

    /// Stop the reader loop. Returns true if it exited in time.
    pub async fn shutdown(self) -> bool {
        let _ = self.shutdown_tx.send(());
        matches!(
            tokio::time::timeout(Duration::from_secs(2), self.handle).await,
            Ok(Ok(()))
        )
    }
}

pub struct TestEngineBuilder {
    cluster_id: String,
    endpoint_id: String,
    bind_ip: IpAddr,
    public_ip: Option<IpAddr>,
    private_ip: Option<IpAddr>,
    resolver: Option<Arc<dyn SourceResolver>>,
    timing: ProbeTiming,
}

#[allow(dead_code)]
impl TestEngineBuilder {
    pub fn new(cluster_id: &str, endpoint_id: &str) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            endpoint_id: endpoint_id.to_string(),
            bind_ip: ip("127.0.0.1"),
            public_ip: None,
            private_ip: Some(ip("127.0.0.1")),
            resolver: None,
            timing: fast_timing(),
        }
    }

    pub fn bind_ip(mut self, bind_ip: &str) -> Self {
        self.bind_ip = ip(bind_ip);
        self
    }

    pub fn public_ip(mut self, public_ip: Option<&str>) -> Self {
        self.public_ip = public_ip.map(ip);
        self
    }

    pub fn private_ip(mut self, private_ip: Option<&str>) -> Self {
        self.private_ip = private_ip.map(ip);
        self
    }

    pub fn resolver(mut self, resolver: impl SourceResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn timing(mut self, timing: ProbeTiming) -> Self {
        self.timing = timing;
        self
    }

    pub async fn build(self) -> anyhow::Result<TestEngine> {
        let transport = Arc::new(UdpTransport::bind(SocketAddr::new(self.bind_ip, 0)).await?);
        let addr = transport.local_addr()?;

        let mut spec = EndpointSpec::new(&self.cluster_id, &self.endpoint_id);
        if let Some(public) = self.public_ip {
            spec.set_public_ip(public);
        }
        if let Some(private) = self.private_ip {
            spec.set_private_ip(private);
        }
        spec.backend_config
            .insert(NATT_DISCOVERY_PORT_CONFIG.into(), addr.port().to_string());

        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(RouteSourceResolver) as Arc<dyn SourceResolver>);
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let nd = NatDiscovery::new(
            LocalEndpoint::new(spec.clone()),
            transport,
            resolver,
            self.timing,
            IpFamily::V4,
            ready_tx,
        )?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let (events_tx, events_rx) = mpsc::channel(16);
        let handle = tokio::spawn(discovery_task::run_discovery_loop(
            nd.clone(),
            events_rx,
            TICK,
            shutdown_tx.subscribe(),
        ));

        Ok(TestEngine {
            nd,
            addr,
            spec,
            ready_rx,
            events_tx,
            shutdown_tx,
            handle,
        })
    }
}

/// Bare UDP socket speaking the wire format directly.
pub struct RawPeer {
    pub socket: UdpSocket,
}

#[allow(dead_code)]
impl RawPeer {
    pub async fn bind() -> anyhow::Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind("127.0.0.1:0").await?,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    pub async fn send(&self, message: &DiscoveryMessage, dst: SocketAddr) -> anyhow::Result<()> {
        let bytes = encode_message(message)?;
        self.socket.send_to(&bytes, dst).await?;
        Ok(())
    }

    pub async fn send_raw(&self, bytes: &[u8], dst: SocketAddr) -> anyhow::Result<()> {
        self.socket.send_to(bytes, dst).await?;
        Ok(())
    }

    pub async fn recv(&self, timeout: Duration) -> anyhow::Result<(DiscoveryMessage, SocketAddr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (n, src) = tokio::time::timeout(timeout, self.socket.recv_from(&mut buf)).await??;
        Ok((decode_message(&buf[..n])?, src))
    }
}
