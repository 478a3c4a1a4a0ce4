//! Initiator-side scenarios: probing remotes and publishing records.

use std::collections::HashMap;
use std::time::Duration;

use natprobe_discovery::{AddressRole, ProbeTiming, RoleState};
use natprobe_endpoint::{EndpointSpec, NATT_DISCOVERY_PORT_CONFIG};
use natprobe_node::DiscoveryError;
use natprobe_protocol::{DiscoveryMessage, DiscoveryResponse, ResponseType};

use crate::harness::{ip, slow_timing, MappedSourceResolver, RawPeer, TestEngine, TestEngineBuilder};

const WAIT: Duration = Duration::from_secs(5);

/// Poll until `role` of `endpoint_id` is resolved, or timeout.
async fn wait_resolved(engine: &TestEngine, endpoint_id: &str, role: AddressRole) -> RoleState {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(remote) = engine.nd.remote(endpoint_id).await {
            let state = remote.role(role).state;
            if state.is_resolved() {
                return state;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timeout waiting for {endpoint_id} {role} to resolve"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Remote spec whose discovery port is a raw socket under test control.
fn raw_remote_spec(raw: &RawPeer, public: Option<&str>, private: Option<&str>) -> EndpointSpec {
    let mut spec = EndpointSpec::new("west", "gw-west");
    if let Some(public) = public {
        spec.set_public_ip(ip(public));
    }
    if let Some(private) = private {
        spec.set_private_ip(ip(private));
    }
    spec.backend_config
        .insert(NATT_DISCOVERY_PORT_CONFIG.into(), raw.addr().port().to_string());
    spec
}

fn answer(request: &DiscoveryMessage, response: ResponseType) -> DiscoveryResponse {
    let DiscoveryMessage::Request(request) = request else {
        panic!("expected request, got {request:?}");
    };
    DiscoveryResponse {
        request_number: request.request_number,
        response,
        sender: request.receiver.clone(),
        receiver: request.sender.clone(),
        received_src: request.using_src.clone(),
        src_ip_nat_detected: false,
        src_port_nat_detected: false,
        dst_ip_nat_detected: false,
    }
}

/// Remote advertises only a private address; the probe reaches it
/// untranslated and the private address is published without NAT.
#[tokio::test]
async fn test_private_only_endpoint_resolves_without_nat() {
    let mut east = TestEngineBuilder::new("east", "gw-east").build().await.unwrap();
    let west = TestEngineBuilder::new("west", "gw-west")
        .private_ip(Some("127.0.0.1"))
        .build()
        .await
        .unwrap();

    east.add_remote(west.spec.clone()).await;

    let info = east.next_record(WAIT).await.unwrap();
    assert_eq!(info.endpoint.cable_name, "gw-west");
    assert_eq!(info.use_ip, ip("127.0.0.1"));
    assert!(!info.use_nat);
    assert_eq!(info.selected, Some(AddressRole::Private));
    assert_eq!(info.use_port, natprobe_endpoint::DEFAULT_UDP_PORT);

    east.expect_silence(Duration::from_millis(300)).await;
    assert!(east.shutdown().await);
    assert!(west.shutdown().await);
}

/// Public probe is translated (declared source differs from the observed
/// one), private probe is not: the final record prefers the private address.
#[tokio::test]
async fn test_public_nat_private_direct_prefers_private() {
    let resolver = MappedSourceResolver {
        overrides: HashMap::from([(ip("127.0.0.2"), ip("192.0.2.50"))]),
    };
    let mut east = TestEngineBuilder::new("east", "gw-east")
        .resolver(resolver)
        .build()
        .await
        .unwrap();
    let west = TestEngineBuilder::new("west", "gw-west")
        .bind_ip("0.0.0.0")
        .public_ip(Some("127.0.0.2"))
        .private_ip(Some("127.0.0.1"))
        .build()
        .await
        .unwrap();

    east.add_remote(west.spec.clone()).await;

    east.wait_record(WAIT, |info| info.selected == Some(AddressRole::Private))
        .await
        .unwrap();

    assert_eq!(
        wait_resolved(&east, "gw-west", AddressRole::Public).await,
        RoleState::Resolved { use_nat: true }
    );
    assert_eq!(
        wait_resolved(&east, "gw-west", AddressRole::Private).await,
        RoleState::Resolved { use_nat: false }
    );

    let remote = east.nd.remote("gw-west").await.unwrap();
    let info = remote.to_nat_endpoint_info().unwrap();
    assert_eq!(info.use_ip, ip("127.0.0.1"));
    assert!(!info.use_nat);

    east.shutdown().await;
    west.shutdown().await;
}

/// A response with an unknown request number changes nothing; the real
/// answer resolves the role; a retransmission of it publishes nothing.
#[tokio::test]
async fn test_response_correlation_over_the_wire() {
    let mut east = TestEngineBuilder::new("east", "gw-east")
        .timing(slow_timing())
        .build()
        .await
        .unwrap();
    let raw = RawPeer::bind().await.unwrap();

    east.add_remote(raw_remote_spec(&raw, None, Some("127.0.0.1"))).await;
    let (request, _) = raw.recv(WAIT).await.unwrap();
    let before = east.nd.remote("gw-west").await.unwrap();

    let mut stale = answer(&request, ResponseType::Ok);
    stale.request_number = stale.request_number.wrapping_add(7);
    let err = east
        .nd
        .handle_response_from_address(stale.clone(), raw.addr())
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::Correlation(_)));
    raw.send(&DiscoveryMessage::Response(stale), east.addr)
        .await
        .unwrap();
    east.expect_silence(Duration::from_millis(200)).await;

    let unchanged = east.nd.remote("gw-west").await.unwrap();
    assert_eq!(
        unchanged.role(AddressRole::Private).state,
        before.role(AddressRole::Private).state
    );

    let good = DiscoveryMessage::Response(answer(&request, ResponseType::Ok));
    raw.send(&good, east.addr).await.unwrap();
    let info = east.next_record(WAIT).await.unwrap();
    assert_eq!(info.use_ip, ip("127.0.0.1"));
    assert!(!info.use_nat);

    raw.send(&good, east.addr).await.unwrap();
    east.expect_silence(Duration::from_millis(200)).await;

    east.shutdown().await;
}

/// A private-role response from an address other than the recorded private
/// address is dropped.
#[tokio::test]
async fn test_spoofed_private_response_ignored() {
    let mut east = TestEngineBuilder::new("east", "gw-east")
        .timing(slow_timing())
        .build()
        .await
        .unwrap();
    let raw = RawPeer::bind().await.unwrap();

    // probes go to 127.0.0.5, which nobody answers; the forgery comes from 127.0.0.1
    east.add_remote(raw_remote_spec(&raw, None, Some("127.0.0.5"))).await;

    let request_id = loop {
        if let Some(id) = east
            .nd
            .remote("gw-west")
            .await
            .and_then(|r| r.last_private_request_id())
        {
            break id;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    let forged = DiscoveryResponse {
        request_number: request_id,
        response: ResponseType::Ok,
        sender: Some(natprobe_protocol::EndpointDetails {
            cluster_id: "west".into(),
            endpoint_id: "gw-west".into(),
        }),
        receiver: Some(natprobe_protocol::EndpointDetails {
            cluster_id: "east".into(),
            endpoint_id: "gw-east".into(),
        }),
        received_src: Some(natprobe_protocol::IpPortPair::new("127.0.0.1", east.addr.port())),
        src_ip_nat_detected: false,
        src_port_nat_detected: false,
        dst_ip_nat_detected: false,
    };
    raw.send(&DiscoveryMessage::Response(forged), east.addr)
        .await
        .unwrap();

    east.expect_silence(Duration::from_millis(300)).await;
    let remote = east.nd.remote("gw-west").await.unwrap();
    assert!(!remote.role(AddressRole::Private).state.is_resolved());

    east.shutdown().await;
}

/// A remote that never answers degrades to its public address with NAT.
#[tokio::test]
async fn test_unresponsive_remote_falls_back() {
    let timing = ProbeTiming {
        retry_base: Duration::from_millis(30),
        retry_max: Duration::from_millis(60),
        max_attempts: 3,
        revalidate_interval: None,
    };
    let mut east = TestEngineBuilder::new("east", "gw-east")
        .timing(timing)
        .build()
        .await
        .unwrap();
    let silent = RawPeer::bind().await.unwrap();

    east.add_remote(raw_remote_spec(&silent, Some("127.0.0.1"), None))
        .await;

    let info = east.next_record(WAIT).await.unwrap();
    assert!(info.is_fallback());
    assert!(info.use_nat);
    assert_eq!(info.use_ip, ip("127.0.0.1"));

    // initial probe plus two retries, then nothing
    let mut probes = 0;
    while silent.recv(Duration::from_millis(300)).await.is_ok() {
        probes += 1;
    }
    assert_eq!(probes, 3);
    east.expect_silence(Duration::from_millis(200)).await;

    east.shutdown().await;
}

/// A remote without a discovery port is published at once from its spec.
#[tokio::test]
async fn test_legacy_remote_published_without_probing() {
    let mut east = TestEngineBuilder::new("east", "gw-east").build().await.unwrap();

    let mut legacy = EndpointSpec::new("west", "gw-legacy");
    legacy.set_public_ip(ip("203.0.113.9"));
    east.add_remote(legacy).await;

    let info = east.next_record(WAIT).await.unwrap();
    assert_eq!(info.endpoint.cable_name, "gw-legacy");
    assert_eq!(info.use_ip, ip("203.0.113.9"));
    assert!(info.use_nat);
    assert!(east.nd.remote("gw-legacy").await.is_none());

    east.shutdown().await;
}

/// Removing a remote drops its state; late responses no longer correlate.
#[tokio::test]
async fn test_removed_remote_forgotten() {
    let east = TestEngineBuilder::new("east", "gw-east")
        .timing(slow_timing())
        .build()
        .await
        .unwrap();
    let raw = RawPeer::bind().await.unwrap();

    east.add_remote(raw_remote_spec(&raw, None, Some("127.0.0.1"))).await;
    let (request, _) = raw.recv(WAIT).await.unwrap();

    east.remove_remote("gw-west").await;
    let deadline = tokio::time::Instant::now() + WAIT;
    while east.nd.remote("gw-west").await.is_some() {
        assert!(tokio::time::Instant::now() < deadline, "remote not removed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let err = east
        .nd
        .handle_response_from_address(answer(&request, ResponseType::Ok), raw.addr())
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::Correlation(_)));

    east.shutdown().await;
}
