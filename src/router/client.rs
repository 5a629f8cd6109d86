//! Client for the rpc interface a router exposes to setup nodes.

use std::{collections::HashMap, fmt};

use futures::{stream::FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    crypto::PublicKey,
    network::{Conn, Dialer, AWAIT_SETUP_PORT},
    routing::{EdgeRules, RouteId, Rule},
    rpc::{Request, Response, RpcClient, RpcError},
};

/// Connection of a setup node to a router.
pub struct RouterClient {
    rpc: RpcClient,
}

impl fmt::Debug for RouterClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterClient")
            .field("remote", &self.remote())
            .finish()
    }
}

/// Failure to dial a router.
#[derive(Debug, thiserror::Error)]
#[error("failed to dial router {pk}: {source}")]
pub struct DialError {
    pub pk: PublicKey,
    #[source]
    pub source: RpcError,
}

impl RouterClient {
    /// Dial the router of the given visor.
    pub async fn dial(
        cancel: &CancellationToken,
        dialer: &dyn Dialer,
        pk: PublicKey,
    ) -> Result<Self, RpcError> {
        let conn = tokio::select! {
            _ = cancel.cancelled() => return Err(RpcError::Cancelled),
            conn = dialer.dial(pk, AWAIT_SETUP_PORT) => conn?,
        };
        Ok(Self::new(conn))
    }

    pub fn new(conn: Box<dyn Conn>) -> Self {
        Self {
            rpc: RpcClient::new(conn),
        }
    }

    #[inline]
    pub fn remote(&self) -> PublicKey {
        self.rpc.remote()
    }

    /// Install the rules of the responding edge of a route group.
    pub async fn add_edge_rules(
        &self,
        cancel: &CancellationToken,
        rules: EdgeRules,
    ) -> Result<bool, RpcError> {
        match self.rpc.call(cancel, Request::AddEdgeRules(rules)).await? {
            Response::Ok(ok) => Ok(ok),
            _ => Err(RpcError::UnexpectedResponse("AddEdgeRules")),
        }
    }

    /// Install transit rules.
    pub async fn add_intermediary_rules(
        &self,
        cancel: &CancellationToken,
        rules: Vec<Rule>,
    ) -> Result<bool, RpcError> {
        match self
            .rpc
            .call(cancel, Request::AddIntermediaryRules(rules))
            .await?
        {
            Response::Ok(ok) => Ok(ok),
            _ => Err(RpcError::UnexpectedResponse("AddIntermediaryRules")),
        }
    }

    /// Reserve `n` route ids on the router.
    pub async fn reserve_ids(
        &self,
        cancel: &CancellationToken,
        n: u8,
    ) -> Result<Vec<RouteId>, RpcError> {
        match self.rpc.call(cancel, Request::ReserveIds(n)).await? {
            Response::RouteIds(ids) if ids.len() == n as usize => Ok(ids),
            _ => Err(RpcError::UnexpectedResponse("ReserveIDs")),
        }
    }

    pub async fn close(&self) {
        self.rpc.close().await;
    }
}

/// Dial the routers of all given visors concurrently.
///
/// The first failure aborts the dials still in progress, and closes the clients which were
/// already connected.
pub async fn make_map(
    cancel: &CancellationToken,
    dialer: &dyn Dialer,
    pks: &[PublicKey],
) -> Result<HashMap<PublicKey, RouterClient>, DialError> {
    let cancel = cancel.child_token();
    let mut dials = pks
        .iter()
        .map(|&pk| {
            let cancel = &cancel;
            async move { (pk, RouterClient::dial(cancel, dialer, pk).await) }
        })
        .collect::<FuturesUnordered<_>>();

    let mut clients = HashMap::with_capacity(pks.len());
    let mut first_err = None;
    while let Some((pk, res)) = dials.next().await {
        match res {
            Ok(client) => {
                trace!(remote = %pk, "Dialed router");
                clients.insert(pk, client);
            }
            Err(source) => {
                if first_err.is_none() {
                    debug!(remote = %pk, err = %source, "Failed to dial router");
                    cancel.cancel();
                    first_err = Some(DialError { pk, source });
                }
            }
        }
    }

    if let Some(err) = first_err {
        close_all(&clients).await;
        return Err(err);
    }

    Ok(clients)
}

/// Close every client in the map.
pub async fn close_all(clients: &HashMap<PublicKey, RouterClient>) {
    futures::future::join_all(clients.values().map(|client| client.close())).await;
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::make_map;
    use crate::{crypto::PublicKey, network::AWAIT_SETUP_PORT, rpc::RpcError, testutil::MemNetwork};

    #[tokio::test]
    async fn make_map_dials_everyone() {
        let network = MemNetwork::new();
        let pks: Vec<_> = (1..=3).map(|n| PublicKey::from([n; 32])).collect();
        let _listeners: Vec<_> = pks
            .iter()
            .map(|pk| network.listen(*pk, AWAIT_SETUP_PORT))
            .collect();

        let dialer = network.dialer(PublicKey::from([9; 32]));
        let clients = make_map(&CancellationToken::new(), &dialer, &pks)
            .await
            .expect("All routers are reachable");
        assert_eq!(clients.len(), 3);
        for pk in &pks {
            assert_eq!(clients[pk].remote(), *pk);
        }
    }

    #[tokio::test]
    async fn make_map_fails_on_unreachable_router() {
        let network = MemNetwork::new();
        let reachable = PublicKey::from([1; 32]);
        let unreachable = PublicKey::from([2; 32]);
        let _listener = network.listen(reachable, AWAIT_SETUP_PORT);

        let dialer = network.dialer(PublicKey::from([9; 32]));
        let err = make_map(&CancellationToken::new(), &dialer, &[reachable, unreachable])
            .await
            .expect_err("One router can't be dialed");
        assert_eq!(err.pk, unreachable);
        assert!(matches!(err.source, RpcError::Io(_)));
    }
}
