use std::sync::Arc;

use futures::{stream::FuturesUnordered, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{gateway::SetupGateway, id_reserver::IdReserver, rules::generate_rules, Error};
use crate::{
    config::SetupConfig,
    crypto::PublicKey,
    metrics::{Metrics, NoMetrics},
    network::{Dialer, Listener},
    routing::{BidirectionalRoute, EdgeRules, RulesMap},
    rpc,
};

/// A setup node, creating route groups on request of routers.
pub struct SetupNode<M = NoMetrics> {
    inner: Arc<NodeInner<M>>,
}

struct NodeInner<M> {
    config: SetupConfig,
    dialer: Arc<dyn Dialer>,
    metrics: M,
}

impl<M> Clone for SetupNode<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M> SetupNode<M>
where
    M: Metrics + Send + Sync + 'static,
{
    pub fn new(config: SetupConfig, dialer: Arc<dyn Dialer>, metrics: M) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                config,
                dialer,
                metrics,
            }),
        }
    }

    #[inline]
    pub fn public_key(&self) -> PublicKey {
        self.inner.config.public_key
    }

    #[inline]
    pub(super) fn config(&self) -> &SetupConfig {
        &self.inner.config
    }

    /// Accept connections from routers and answer their requests, until `cancel` fires or the
    /// listener fails.
    pub async fn serve<L>(&self, mut listener: L, cancel: CancellationToken) -> std::io::Result<()>
    where
        L: Listener,
    {
        info!(pk = %self.public_key(), "Serving setup node");
        loop {
            let conn = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                conn = listener.accept() => conn?,
            };
            let requester = conn.remote_pk();
            debug!(%requester, "Accepted setup connection");

            let gateway = SetupGateway::new(self.clone(), requester);
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = rpc::serve(conn, &gateway, &cancel).await {
                    debug!(%requester, err = %e, "Setup connection failed");
                }
            });
        }
    }

    /// Create a route group: reserve ids on every visor, generate and distribute the rules, and
    /// return the rules for the initiating visor.
    pub async fn dial_route_group(
        &self,
        cancel: &CancellationToken,
        route: BidirectionalRoute,
    ) -> Result<EdgeRules, Error> {
        let start = Instant::now();
        let res = self.setup_route_group(cancel, route).await;
        match &res {
            Ok(_) => self.inner.metrics.setup_route_group_dialed(start.elapsed()),
            Err(_) => self.inner.metrics.setup_route_group_failed(),
        }
        res
    }

    async fn setup_route_group(
        &self,
        cancel: &CancellationToken,
        route: BidirectionalRoute,
    ) -> Result<EdgeRules, Error> {
        route.check()?;
        let desc = route.desc;
        info!(src = %desc.src_pk(), dst = %desc.dst_pk(), "Setting up route group");

        let mut idr = IdReserver::new(
            cancel,
            self.inner.dialer.as_ref(),
            &[route.forward.as_slice(), route.reverse.as_slice()],
        )
        .await?;
        debug!(total = idr.total_ids(), "Reserving route ids");

        let res = self.install_rules(cancel, &mut idr, &route).await;
        idr.close().await;
        res
    }

    async fn install_rules(
        &self,
        cancel: &CancellationToken,
        idr: &mut IdReserver,
        route: &BidirectionalRoute,
    ) -> Result<EdgeRules, Error> {
        idr.reserve_ids(cancel).await?;
        trace!(ids = %idr, "Reserved route ids");

        let (forward_route, reverse_route) = route.forward_and_reverse();
        let rules = generate_rules(idr, &[forward_route.clone(), reverse_route.clone()])?;
        debug!(
            forward = rules.forward.len(),
            consume = rules.consume.len(),
            intermediary = rules.intermediary.len(),
            "Generated rules"
        );

        let src = route.desc.src_pk();
        let dst = route.desc.dst_pk();
        let init_rules = EdgeRules {
            desc: reverse_route.desc,
            forward: *rules.forward.get(&src).ok_or(Error::MissingRules(src))?,
            reverse: *rules.consume.get(&src).ok_or(Error::MissingRules(src))?,
        };
        let resp_rules = EdgeRules {
            desc: forward_route.desc,
            forward: *rules.forward.get(&dst).ok_or(Error::MissingRules(dst))?,
            reverse: *rules.consume.get(&dst).ok_or(Error::MissingRules(dst))?,
        };

        add_intermediary_rules(cancel, idr, rules.intermediary).await?;

        debug!(remote = %dst, rules = %resp_rules, "Adding edge rules to responding visor");
        let client = idr.client(&dst).ok_or(Error::NoClient(dst))?;
        let ok = client
            .add_edge_rules(cancel, resp_rules)
            .await
            .map_err(|source| Error::AddEdgeRules { pk: dst, source })?;
        if !ok {
            return Err(Error::RulesRejected(dst));
        }

        debug!(remote = %src, rules = %init_rules, "Returning edge rules to initiating visor");
        Ok(init_rules)
    }
}

/// Push the transit rules to all intermediary visors concurrently. The first failure aborts the
/// remaining pushes.
async fn add_intermediary_rules(
    cancel: &CancellationToken,
    idr: &IdReserver,
    rules: RulesMap,
) -> Result<(), Error> {
    let cancel = cancel.child_token();
    let mut pushes = rules
        .into_iter()
        .map(|(pk, rules)| {
            let client = idr.client(&pk);
            let cancel = &cancel;
            async move {
                let client = client.ok_or(Error::NoClient(pk))?;
                debug!(remote = %pk, count = rules.len(), "Adding rules to intermediary visor");
                let ok = client
                    .add_intermediary_rules(cancel, rules)
                    .await
                    .map_err(|source| Error::AddIntermediaryRules { pk, source })?;
                if ok {
                    Ok::<_, Error>(())
                } else {
                    Err(Error::RulesRejected(pk))
                }
            }
        })
        .collect::<FuturesUnordered<_>>();

    let mut first_err = None;
    while let Some(res) = pushes.next().await {
        if let Err(e) = res {
            if first_err.is_none() {
                warn!(err = %e, "Failed to add intermediary rules");
                cancel.cancel();
                first_err = Some(e);
            }
        }
    }

    first_err.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::SetupNode;
    use crate::{
        config::SetupConfig,
        crypto::PublicKey,
        metrics::NoMetrics,
        network::{Dialer, Listener, AWAIT_SETUP_PORT, SETUP_PORT},
        routing::{
            BidirectionalRoute, EdgeRules, Hop, RouteDescriptor, RouteError, RouteId, Rule,
            RuleKind,
        },
        rpc::{self, Failure, FailureCode, Handler, Request, Response},
        setup::Error,
        testutil::MemNetwork,
        transport::TransportId,
    };

    type PushedRules = HashMap<PublicKey, Vec<Rule>>;

    /// Router side recording every rule pushed to it.
    struct RecordingRouter {
        pk: PublicKey,
        next_id: Mutex<u32>,
        pushed: Arc<Mutex<PushedRules>>,
        edges: Arc<Mutex<HashMap<PublicKey, EdgeRules>>>,
        reject_rules: bool,
    }

    #[async_trait]
    impl Handler for RecordingRouter {
        async fn handle(&self, request: Request) -> Response {
            match request {
                Request::ReserveIds(n) => {
                    let mut next = self.next_id.lock().unwrap();
                    let ids = (0..n as u32).map(|i| RouteId::new(*next + i)).collect();
                    *next += n as u32;
                    Response::RouteIds(ids)
                }
                Request::AddIntermediaryRules(_) if self.reject_rules => {
                    Response::Failure(Failure::new(FailureCode::AddRules, "table full"))
                }
                Request::AddIntermediaryRules(rules) => {
                    self.pushed
                        .lock()
                        .unwrap()
                        .entry(self.pk)
                        .or_default()
                        .extend(rules);
                    Response::Ok(true)
                }
                Request::AddEdgeRules(rules) => {
                    self.edges.lock().unwrap().insert(self.pk, rules);
                    Response::Ok(true)
                }
                Request::DialRouteGroup(_) => {
                    Response::Failure(Failure::new(FailureCode::BadRequest, "not a setup node"))
                }
            }
        }
    }

    struct Harness {
        node: SetupNode,
        pushed: Arc<Mutex<PushedRules>>,
        edges: Arc<Mutex<HashMap<PublicKey, EdgeRules>>>,
    }

    fn pk(n: u8) -> PublicKey {
        PublicKey::from([n; 32])
    }

    fn harness(rejecting: Option<PublicKey>) -> Harness {
        let network = MemNetwork::new();
        let pushed = Arc::new(Mutex::new(HashMap::new()));
        let edges = Arc::new(Mutex::new(HashMap::new()));
        for n in 1..=3 {
            let mut listener = network.listen(pk(n), AWAIT_SETUP_PORT);
            let pushed = pushed.clone();
            let edges = edges.clone();
            tokio::spawn(async move {
                let router = Arc::new(RecordingRouter {
                    pk: pk(n),
                    next_id: Mutex::new(n as u32 * 100),
                    pushed,
                    edges,
                    reject_rules: rejecting == Some(pk(n)),
                });
                while let Ok(conn) = listener.accept().await {
                    let router = router.clone();
                    tokio::spawn(async move {
                        let _ = rpc::serve(conn, router.as_ref(), &CancellationToken::new()).await;
                    });
                }
            });
        }
        let node = SetupNode::new(
            SetupConfig::new(pk(9)),
            Arc::new(network.dialer(pk(9))),
            NoMetrics,
        );
        Harness {
            node,
            pushed,
            edges,
        }
    }

    fn route() -> BidirectionalRoute {
        let (ab, bc) = (TransportId::new_random(), TransportId::new_random());
        let (a, b, c) = (pk(1), pk(2), pk(3));
        BidirectionalRoute {
            desc: RouteDescriptor::new(a, c, 1, 2),
            keep_alive: Duration::from_secs(30),
            forward: vec![
                Hop { tp_id: ab, from: a, to: b },
                Hop { tp_id: bc, from: b, to: c },
            ],
            reverse: vec![
                Hop { tp_id: bc, from: c, to: b },
                Hop { tp_id: ab, from: b, to: a },
            ],
        }
    }

    #[tokio::test]
    async fn distributes_rules() {
        let h = harness(None);
        let route = route();

        let init = h
            .node
            .dial_route_group(&CancellationToken::new(), route.clone())
            .await
            .expect("Route group is set up");

        // Initiator: forward rule towards B, consume rule for the reverse direction.
        assert_eq!(init.desc, route.desc.invert());
        assert!(matches!(init.forward.kind(), RuleKind::Forward { .. }));
        assert_eq!(init.forward.route_descriptor(), Ok(route.desc));
        assert_eq!(init.reverse.route_descriptor(), Ok(route.desc.invert()));
        assert!(matches!(init.reverse.kind(), RuleKind::Consume { .. }));

        // Responder got the mirror image.
        let edges = h.edges.lock().unwrap();
        assert_eq!(edges.len(), 1);
        let resp = edges[&pk(3)];
        assert_eq!(resp.desc, route.desc);
        assert_eq!(resp.forward.route_descriptor(), Ok(route.desc.invert()));
        assert_eq!(resp.reverse.route_descriptor(), Ok(route.desc));

        // Only B got transit rules, one for each direction. The ids chain up across visors.
        let pushed = h.pushed.lock().unwrap();
        assert_eq!(pushed.len(), 1);
        let b_rules = &pushed[&pk(2)];
        assert_eq!(b_rules.len(), 2);
        let to_c = b_rules
            .iter()
            .find(|rule| rule.next_route_id() == Ok(resp.reverse.key_route_id()))
            .expect("B relays towards C");
        assert_eq!(init.forward.next_route_id(), Ok(to_c.key_route_id()));
        let to_a = b_rules
            .iter()
            .find(|rule| rule.next_route_id() == Ok(init.reverse.key_route_id()))
            .expect("B relays towards A");
        assert_eq!(resp.forward.next_route_id(), Ok(to_a.key_route_id()));
    }

    #[tokio::test]
    async fn rejects_invalid_route_before_dialing() {
        let h = harness(None);
        let mut route = route();
        route.reverse.clear();

        let err = h
            .node
            .dial_route_group(&CancellationToken::new(), route)
            .await
            .expect_err("Route has no reverse hops");
        assert!(matches!(err, Error::InvalidRoute(RouteError::NoReverseHops)));
        assert!(h.pushed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_intermediary_push_fails_setup() {
        let h = harness(Some(pk(2)));

        let err = h
            .node
            .dial_route_group(&CancellationToken::new(), route())
            .await
            .expect_err("B rejects its rules");
        assert!(matches!(err, Error::AddIntermediaryRules { pk: visor, .. } if visor == pk(2)));
        assert!(h.edges.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn serve_answers_dial_requests() {
        let h = harness(None);
        let network = MemNetwork::new();
        let listener = network.listen(pk(9), SETUP_PORT);
        let cancel = CancellationToken::new();
        {
            let node = h.node.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { node.serve(listener, cancel).await });
        }

        let conn = network
            .dialer(pk(1))
            .dial(pk(9), SETUP_PORT)
            .await
            .expect("Setup node listens");
        let client = rpc::RpcClient::new(conn);
        let resp = client
            .call(&cancel, Request::DialRouteGroup(route()))
            .await
            .expect("Setup succeeds");
        assert!(matches!(resp, Response::EdgeRules(_)));

        let mut bad = route();
        bad.forward.clear();
        let err = client
            .call(&cancel, Request::DialRouteGroup(bad))
            .await
            .expect_err("Route is invalid");
        assert!(matches!(
            err,
            rpc::RpcError::Failure(Failure {
                code: FailureCode::BadRequest,
                ..
            })
        ));
        cancel.cancel();
    }
}
