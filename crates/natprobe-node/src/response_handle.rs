//! Initiator side: correlate responses to our probes and publish outcomes.

use std::net::SocketAddr;
use std::time::Instant;

use natprobe_protocol::{DiscoveryResponse, ResponseType};

use crate::nat_discovery::{DiscoveryError, NatDiscovery};

impl NatDiscovery {
    pub async fn handle_response_from_address(
        &self,
        response: DiscoveryResponse,
        src: SocketAddr,
    ) -> Result<(), DiscoveryError> {
        let sender = response
            .sender
            .as_ref()
            .ok_or(DiscoveryError::MalformedResponse("sender"))?;
        if response.receiver.is_none() {
            return Err(DiscoveryError::MalformedResponse("receiver"));
        }
        let received_src = response
            .received_src
            .as_ref()
            .ok_or(DiscoveryError::MalformedResponse("received_src"))?;

        if !response.response.is_success() {
            return Err(DiscoveryError::RemoteError {
                endpoint: sender.endpoint_id.clone(),
                code: response.response,
            });
        }

        let use_nat = response.response == ResponseType::NatDetected;

        tracing::debug!(
            request_number = response.request_number,
            sender = %sender.endpoint_id,
            %src,
            response = %response.response,
            received_src = %format_args!("{}:{}", received_src.ip, received_src.port),
            src_ip_nat = response.src_ip_nat_detected,
            src_port_nat = response.src_port_nat_detected,
            dst_ip_nat = response.dst_ip_nat_detected,
            "nat: received discovery response"
        );

        let mut table = self.table.lock().await;
        let changed = table.handle_response(
            &sender.endpoint_id,
            response.request_number,
            src.ip().to_canonical(),
            use_nat,
            Instant::now(),
        )?;

        // queued under the lock so this endpoint's records stay ordered
        if let Some(info) = changed {
            self.publish(info);
        }

        Ok(())
    }
}
