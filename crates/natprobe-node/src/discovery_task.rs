//! Discovery background task -- one reader loop for the discovery socket.
//!
//! Each iteration waits on one of:
//!   1. an inbound datagram -> request or response handler
//!   2. the scheduling tick -> retries, re-validation, give-up fallbacks
//!   3. endpoint directory events -> start or stop discovering a remote
//!   4. shutdown
//!
//! Errors from one datagram or one endpoint are logged and never end the loop.

use std::net::SocketAddr;
use std::time::Duration;

use natprobe_endpoint::EndpointSpec;
use natprobe_protocol::MAX_DATAGRAM_SIZE;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;

use crate::nat_discovery::{DiscoveryError, NatDiscovery};

/// Change in the set of remote endpoints known to the federation.
#[derive(Debug, Clone)]
pub enum DirectoryEvent {
    Added(EndpointSpec),
    /// Endpoint ID (cable name) of the departed remote.
    Removed(String),
}

/// Run the discovery loop until shutdown.
pub async fn run_discovery_loop(
    nd: NatDiscovery,
    mut events: mpsc::Receiver<DirectoryEvent>,
    tick_interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    // one spare byte so oversized datagrams are seen as such, not truncated
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut events_open = true;

    tracing::info!(
        tick_ms = tick_interval.as_millis() as u64,
        local = %nd.local_endpoint().spec().identity(),
        "nat: discovery loop started"
    );

    loop {
        tokio::select! {
            result = nd.transport().recv_from(&mut buf) => match result {
                Ok((n, src)) => {
                    if let Err(e) = nd.handle_datagram(&buf[..n], src).await {
                        log_datagram_error(&e, src);
                    }
                }
                Err(e) => {
                    // ICMP unreachable surfaces here on some platforms
                    tracing::debug!("nat: receive error: {e}");
                }
            },
            _ = ticker.tick() => {
                nd.check_endpoints().await;
            }
            event = events.recv(), if events_open => match event {
                Some(DirectoryEvent::Added(spec)) => {
                    let endpoint = spec.cable_name.clone();
                    if let Err(e) = nd.add_endpoint(spec).await {
                        tracing::warn!(%endpoint, "nat: initial probe failed, will retry: {e}");
                    }
                }
                Some(DirectoryEvent::Removed(endpoint)) => {
                    nd.remove_endpoint(&endpoint).await;
                }
                None => {
                    tracing::debug!("nat: endpoint directory closed");
                    events_open = false;
                }
            },
            _ = shutdown.recv() => {
                tracing::info!("nat: discovery loop shutting down");
                break;
            }
        }
    }
}

fn log_datagram_error(e: &DiscoveryError, src: SocketAddr) {
    match e {
        DiscoveryError::Protocol(_) | DiscoveryError::MalformedResponse(_) => {
            tracing::warn!(%src, "nat: dropping malformed datagram: {e}");
        }
        DiscoveryError::Correlation(_) => {
            tracing::warn!(%src, "nat: rejected discovery response: {e}");
        }
        DiscoveryError::RemoteError { .. } => {
            tracing::warn!(%src, "nat: remote reported discovery error: {e}");
        }
        _ => {
            tracing::warn!(%src, "nat: error handling datagram: {e}");
        }
    }
}
