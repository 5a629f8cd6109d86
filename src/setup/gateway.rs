use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{node::SetupNode, Error};
use crate::{
    crypto::PublicKey,
    metrics::Metrics,
    rpc::{Failure, FailureCode, Handler, Request, Response},
};

/// Rpc entry point of a [`SetupNode`] for a single requesting router.
pub(super) struct SetupGateway<M> {
    node: SetupNode<M>,
    requester: PublicKey,
}

impl<M> SetupGateway<M> {
    pub fn new(node: SetupNode<M>, requester: PublicKey) -> Self {
        Self { node, requester }
    }
}

#[async_trait]
impl<M> Handler for SetupGateway<M>
where
    M: Metrics + Send + Sync + 'static,
{
    async fn handle(&self, request: Request) -> Response {
        let Request::DialRouteGroup(route) = request else {
            return Response::Failure(Failure::new(
                FailureCode::BadRequest,
                "setup nodes only dial route groups",
            ));
        };

        info!(requester = %self.requester, desc = %route.desc, "Received route group request");
        let cancel = CancellationToken::new();
        let timeout = self.node.config().request_timeout;
        let res = tokio::time::timeout(timeout, self.node.dial_route_group(&cancel, route)).await;
        // Abort anything still in flight on a timeout.
        cancel.cancel();

        match res {
            Ok(Ok(rules)) => Response::EdgeRules(rules),
            Ok(Err(e)) => {
                warn!(requester = %self.requester, err = %e, "Failed to dial route group");
                let code = match e {
                    Error::InvalidRoute(_) => FailureCode::BadRequest,
                    _ => FailureCode::DialRouteGroup,
                };
                Response::Failure(Failure::new(code, e))
            }
            Err(_) => {
                warn!(requester = %self.requester, ?timeout, "Route group request timed out");
                Response::Failure(Failure::new(
                    FailureCode::Timeout,
                    "route group setup timed out",
                ))
            }
        }
    }
}
