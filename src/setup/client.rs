use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Error;
use crate::{
    crypto::PublicKey,
    network::{Dialer, SETUP_PORT},
    routing::{BidirectionalRoute, EdgeRules},
    rpc::{Request, Response, RpcClient, RpcError},
};

/// Asks a setup node to create a route group.
#[async_trait]
pub trait RouteGroupDialer: Send + Sync {
    /// Dial the route group through one of the given setup nodes. On success, the returned edge
    /// rules must be installed by the caller.
    async fn dial_route_group(
        &self,
        cancel: &CancellationToken,
        dialer: &dyn Dialer,
        setup_nodes: &[PublicKey],
        route: BidirectionalRoute,
    ) -> Result<EdgeRules, Error>;
}

/// [`RouteGroupDialer`] talking to setup nodes over rpc. Setup nodes are tried in order, until
/// one of them can be reached.
#[derive(Debug, Default, Clone, Copy)]
pub struct SetupClient;

impl SetupClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RouteGroupDialer for SetupClient {
    async fn dial_route_group(
        &self,
        cancel: &CancellationToken,
        dialer: &dyn Dialer,
        setup_nodes: &[PublicKey],
        route: BidirectionalRoute,
    ) -> Result<EdgeRules, Error> {
        let mut last_err = None;
        let mut client = None;
        for &pk in setup_nodes {
            let res = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                res = dialer.dial(pk, SETUP_PORT) => res,
            };
            match res {
                Ok(conn) => {
                    client = Some(RpcClient::new(conn));
                    break;
                }
                Err(e) => {
                    warn!(setup_node = %pk, err = %e, "Failed to dial setup node");
                    last_err = Some(Error::DialSetupNode {
                        pk,
                        source: e.into(),
                    });
                }
            }
        }
        let Some(client) = client else {
            return Err(last_err.unwrap_or(Error::NoSetupNodes));
        };

        let pk = client.remote();
        debug!(setup_node = %pk, desc = %route.desc, "Requesting route group");
        let res = client.call(cancel, Request::DialRouteGroup(route)).await;
        client.close().await;

        match res {
            Ok(Response::EdgeRules(rules)) => Ok(rules),
            Ok(_) => Err(Error::Remote {
                pk,
                source: RpcError::UnexpectedResponse("DialRouteGroup"),
            }),
            Err(RpcError::Cancelled) => Err(Error::Cancelled),
            Err(source) => Err(Error::Remote { pk, source }),
        }
    }
}
