//! Hub-side routing relay
//!
//! Forwards the inner payload of a [`RoutingRequest`] to the named member
//! and answers the origin with a [`RoutingResultReply`] under the request's
//! correlation id.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{Membership, Transmitter};
use crate::protocol::{
    Frame, Identity, RelayDelivery, RoutingOutcome, RoutingRequest, RoutingResultReply,
};

pub struct Relay {
    membership: Arc<Membership>,
    delay: Duration,
}

impl Relay {
    pub fn new(membership: Arc<Membership>, delay: Duration) -> Self {
        Self { membership, delay }
    }

    /// Run the request after the dispatch delay, off the read loop
    pub fn submit(
        self: &Arc<Self>,
        origin: Identity,
        reply_to: Transmitter,
        correlation_id: Option<Uuid>,
        request: RoutingRequest,
    ) -> JoinHandle<RoutingOutcome> {
        let relay = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(relay.delay).await;
            relay.execute(origin, &reply_to, correlation_id, request)
        })
    }

    /// Forward and reply
    pub fn execute(
        &self,
        origin: Identity,
        reply_to: &Transmitter,
        correlation_id: Option<Uuid>,
        request: RoutingRequest,
    ) -> RoutingOutcome {
        let target = request.target.clone();
        let outcome = self.forward(origin.clone(), request);
        tracing::debug!("Routing {} -> {}: {:?}", origin, target, outcome);

        match correlation_id {
            Some(id) => {
                let reply = Frame::new(RoutingResultReply { outcome }).with_correlation(id);
                reply_to.send_serial(reply);
            }
            None => tracing::debug!("Routing request from {} carried no correlation id", origin),
        }
        outcome
    }

    fn forward(&self, origin: Identity, request: RoutingRequest) -> RoutingOutcome {
        let Some(session) = self.membership.lookup(&request.target) else {
            return RoutingOutcome::FailedNoClient;
        };

        let delivery = Frame::new(RelayDelivery {
            origin,
            inner: request.inner,
        });
        if session.transmitter.send_serial(delivery) {
            RoutingOutcome::Success
        } else {
            RoutingOutcome::FailedUnknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DocumentPacket, KeepAlive};
    use std::net::SocketAddr;

    #[tokio::test]
    async fn test_unknown_target_is_no_client() {
        let relay = Arc::new(Relay::new(Arc::new(Membership::new()), Duration::ZERO));
        let request = RoutingRequest::new(Identity::generate("ghost"), &KeepAlive);

        let outcome = relay
            .submit(Identity::generate("a"), Transmitter::detached(), Some(Uuid::new_v4()), request)
            .await
            .unwrap();
        assert_eq!(outcome, RoutingOutcome::FailedNoClient);
    }

    #[tokio::test]
    async fn test_closed_target_is_unknown_failure() {
        let membership = Arc::new(Membership::new());
        let target = Identity::generate("b");
        let addr: SocketAddr = "127.0.0.1:2".parse().unwrap();
        membership
            .admit(addr, target.clone(), Transmitter::detached())
            .unwrap();

        let relay = Relay::new(membership, Duration::ZERO);
        let request = RoutingRequest::new(target, &DocumentPacket::new(serde_json::json!(1)));
        let outcome = relay.execute(Identity::generate("a"), &Transmitter::detached(), None, request);
        assert_eq!(outcome, RoutingOutcome::FailedUnknown);
    }

    #[tokio::test]
    async fn test_dispatch_is_delayed() {
        let relay = Arc::new(Relay::new(Arc::new(Membership::new()), Duration::from_millis(80)));
        let request = RoutingRequest::new(Identity::generate("ghost"), &KeepAlive);

        let start = std::time::Instant::now();
        relay
            .submit(Identity::generate("a"), Transmitter::detached(), None, request)
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(75));
    }
}
