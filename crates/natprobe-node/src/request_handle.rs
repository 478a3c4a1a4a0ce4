//! Responder side: answer discovery requests from other gateways.
//!
//! Compares what the requester claims (`using_src`, `using_dst`) with what we
//! observe on the socket. The destination check assumes requests arrive on
//! the local private address of the probe's family.

use std::net::{IpAddr, SocketAddr};

use natprobe_endpoint::{EndpointSpec, IpFamily};
use natprobe_protocol::{
    DiscoveryMessage, DiscoveryRequest, DiscoveryResponse, IpPortPair, ResponseType,
};

use crate::nat_discovery::{endpoint_details, DiscoveryError, NatDiscovery};

impl NatDiscovery {
    pub async fn handle_request_from_address(
        &self,
        request: DiscoveryRequest,
        src: SocketAddr,
    ) -> Result<(), DiscoveryError> {
        let local = self.local.spec();
        let response = build_response(&local, &request, src, self.family);

        match response.response {
            ResponseType::Malformed => tracing::warn!(
                request_number = request.request_number,
                %src,
                "nat: received malformed discovery request"
            ),
            ResponseType::UnknownDstCluster | ResponseType::UnknownDstEndpoint => tracing::warn!(
                request_number = request.request_number,
                %src,
                receiver = ?request.receiver,
                local = %local.identity(),
                "nat: discovery request addressed to a different endpoint"
            ),
            _ => tracing::debug!(
                request_number = request.request_number,
                sender = request.sender_endpoint_id(),
                %src,
                response = %response.response,
                src_ip_nat = response.src_ip_nat_detected,
                src_port_nat = response.src_port_nat_detected,
                dst_ip_nat = response.dst_ip_nat_detected,
                "nat: answering discovery request"
            ),
        }

        self.send_response_to_address(response, src).await
    }

    async fn send_response_to_address(
        &self,
        response: DiscoveryResponse,
        dst: SocketAddr,
    ) -> Result<(), DiscoveryError> {
        let request_number = response.request_number;
        self.send_datagram(&DiscoveryMessage::Response(response), dst)
            .await
            .inspect_err(|e| {
                tracing::warn!(
                    request_number,
                    %dst,
                    "nat: failed to send discovery response: {e}"
                )
            })
    }
}

/// Build the answer to `request`, observed arriving from `src`.
pub fn build_response(
    local: &EndpointSpec,
    request: &DiscoveryRequest,
    src: SocketAddr,
    default_family: IpFamily,
) -> DiscoveryResponse {
    let observed_ip = src.ip().to_canonical();

    let mut response = DiscoveryResponse {
        request_number: request.request_number,
        response: ResponseType::Ok,
        sender: Some(endpoint_details(local.identity())),
        receiver: request.sender.clone(),
        received_src: Some(IpPortPair::new(observed_ip, src.port())),
        src_ip_nat_detected: false,
        src_port_nat_detected: false,
        dst_ip_nat_detected: false,
    };

    let (Some(receiver), Some(using_src), Some(using_dst), Some(_)) = (
        request.receiver.as_ref(),
        request.using_src.as_ref(),
        request.using_dst.as_ref(),
        request.sender.as_ref(),
    ) else {
        response.response = ResponseType::Malformed;
        return response;
    };

    if receiver.cluster_id != local.cluster_id {
        response.response = ResponseType::UnknownDstCluster;
        return response;
    }

    if receiver.endpoint_id != local.cable_name {
        response.response = ResponseType::UnknownDstEndpoint;
        return response;
    }

    response.src_ip_nat_detected =
        !using_src.ip.is_empty() && parse_ip(&using_src.ip) != Some(observed_ip);
    response.src_port_nat_detected = using_src.port != src.port();

    let dst_ip = parse_ip(&using_dst.ip);
    let family = dst_ip.as_ref().map_or(default_family, IpFamily::of);
    response.dst_ip_nat_detected = match (dst_ip, local.get_private_ip(family)) {
        (Some(dst), Some(private)) => dst != private,
        _ => true,
    };

    if response.src_ip_nat_detected || response.src_port_nat_detected || response.dst_ip_nat_detected
    {
        response.response = ResponseType::NatDetected;
    }

    response
}

fn parse_ip(s: &str) -> Option<IpAddr> {
    s.parse::<IpAddr>().ok().map(|ip| ip.to_canonical())
}
