//! The router of a visor.
//!
//! The router owns the [`RoutingTable`] of the visor and all local [`RouteGroup`]s. It relays
//! packets along the routes passing through the visor, hands packets for local route groups to
//! those groups, dials new route groups through a setup node, and accepts route groups which were
//! set up by a remote visor.

use std::{
    collections::HashSet,
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::{
    sync::mpsc,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::RouterConfig,
    crypto::PublicKey,
    metrics::{Metrics, NoMetrics},
    network::{Dialer, Listener},
    routing::{
        BidirectionalRoute, EdgeRules, Hop, Packet, PacketError, PacketType, Port,
        RouteDescriptor, RouteId, Rule, RuleError, RuleKind, RoutingTable, TableError,
    },
    rpc,
    setup::{self, RouteGroupDialer},
    transport::{TransportId, TransportManager},
};

mod client;
mod gateway;
mod route_finder;
mod route_group;

pub use client::{close_all, make_map, DialError, RouterClient};
pub use route_finder::{RouteFinder, RouteFinderError, RouteOptions};
pub use route_group::{RouteGroup, Status};

use gateway::RouterGateway;
use route_group::{ClosedRouteGroup, RoutePath};

/// Time between two attempts to find routes.
const ROUTE_FIND_RETRY_INTERVAL: Duration = Duration::from_millis(500);
/// Time after which no new attempt to find routes is made.
const ROUTE_FIND_RETRY_DURATION: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("remote public key is empty")]
    RemoteEmptyPk,
    #[error("io: read/write on closed pipe")]
    ClosedPipe,
    #[error("i/o timeout")]
    Timeout,
    #[error("route group has no rules")]
    NoRules,
    #[error("unknown transport {0}")]
    BadTransport(TransportId),
    #[error("no route group for {0}")]
    NoRouteGroup(RouteDescriptor),
    #[error("use of closed network connection")]
    RouterClosed,
    #[error("operation cancelled")]
    Cancelled,
    #[error("no route from {0} to {1}")]
    NoRoute(PublicKey, PublicKey),
    #[error(transparent)]
    RouteFinder(#[from] RouteFinderError),
    #[error(transparent)]
    Setup(#[from] setup::Error),
    #[error("routing table: {0}")]
    Table(#[from] TableError),
    #[error(transparent)]
    Rule(#[from] RuleError),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("transport: {0}")]
    Transport(#[from] io::Error),
}

impl Error {
    /// Checks if the error is caused by an expired deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    /// Checks if the error is caused by using something which was closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::ClosedPipe | Error::RouterClosed)
    }
}

/// The collaborators a [`Router`] relies on.
pub struct RouterDeps {
    pub transport_manager: Arc<dyn TransportManager>,
    pub route_finder: Arc<dyn RouteFinder>,
    /// Dialer on the overlay network, used to reach setup nodes.
    pub dialer: Arc<dyn Dialer>,
    pub setup_dialer: Arc<dyn RouteGroupDialer>,
}

pub struct Router<M = NoMetrics> {
    inner: Arc<RouterInner<M>>,
}

struct RouterInner<M> {
    config: RouterConfig,
    table: RoutingTable,
    tm: Arc<dyn TransportManager>,
    route_finder: Arc<dyn RouteFinder>,
    dialer: Arc<dyn Dialer>,
    setup_dialer: Arc<dyn RouteGroupDialer>,
    trusted_setup_nodes: HashSet<PublicKey>,
    route_groups: DashMap<RouteDescriptor, RouteGroup, ahash::RandomState>,
    /// Edge rules pushed by setup nodes, waiting to be accepted. Taken on close.
    accept_tx: Mutex<Option<mpsc::Sender<EdgeRules>>>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<EdgeRules>>,
    /// Channel injected into route groups, so they can notify the router once they are closed.
    closed_sink: mpsc::UnboundedSender<ClosedRouteGroup>,
    /// Set once [`Router::close`] starts. Packets are still relayed until `cancel` fires, so
    /// route groups can finish their close handshake.
    closing: AtomicBool,
    cancel: CancellationToken,
    metrics: M,
}

impl<M> Clone for Router<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M> Router<M>
where
    M: Metrics + Clone + Send + Sync + 'static,
{
    /// Create a new router. Background tasks are spawned on the current tokio runtime, they run
    /// until the router is closed.
    pub fn new(config: RouterConfig, deps: RouterDeps, metrics: M) -> Self {
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_buffer_size.max(1));
        let (closed_sink, closed_stream) = mpsc::unbounded_channel();
        let trusted_setup_nodes = config.setup_nodes.iter().copied().collect();

        let router = Router {
            inner: Arc::new(RouterInner {
                config,
                table: RoutingTable::new(),
                tm: deps.transport_manager,
                route_finder: deps.route_finder,
                dialer: deps.dialer,
                setup_dialer: deps.setup_dialer,
                trusted_setup_nodes,
                route_groups: DashMap::with_hasher(ahash::RandomState::new()),
                accept_tx: Mutex::new(Some(accept_tx)),
                accept_rx: tokio::sync::Mutex::new(accept_rx),
                closed_sink,
                closing: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                metrics,
            }),
        };

        tokio::spawn(Router::rules_gc_loop(router.clone()));
        tokio::spawn(Router::process_closed_route_groups(
            router.clone(),
            closed_stream,
        ));

        router
    }

    /// The identity of the local visor.
    #[inline]
    pub fn public_key(&self) -> PublicKey {
        self.inner.config.public_key
    }

    /// Route options bounded by the configured hop limits.
    pub fn route_options(&self) -> RouteOptions {
        RouteOptions {
            min_hops: self.inner.config.min_hops,
            max_hops: self.inner.config.max_hops,
        }
    }

    /// Start relaying packets from the transport manager, and accepting rules from setup nodes on
    /// the given listener.
    pub fn serve<L>(&self, setup_listener: L)
    where
        L: Listener + 'static,
    {
        info!(pk = %self.public_key(), "Starting router");
        tokio::spawn(self.clone().serve_transport_manager());
        tokio::spawn(self.clone().serve_setup(setup_listener));
    }

    /// Create a route group to the given remote visor.
    pub async fn dial_routes(
        &self,
        cancel: &CancellationToken,
        remote: PublicKey,
        local_port: Port,
        remote_port: Port,
        opts: RouteOptions,
    ) -> Result<RouteGroup, Error> {
        if remote.is_null() {
            error!("Failed to dial routes: remote public key is empty");
            return Err(Error::RemoteEmptyPk);
        }
        if self.is_closing() {
            return Err(Error::RouterClosed);
        }

        let local = self.public_key();
        let (forward, reverse) = self.fetch_best_routes(cancel, local, remote, opts).await?;
        let route = BidirectionalRoute {
            desc: RouteDescriptor::new(local, remote, local_port, remote_port),
            keep_alive: self.inner.config.route_keep_alive,
            forward,
            reverse,
        };

        let rules = self
            .inner
            .setup_dialer
            .dial_route_group(
                cancel,
                self.inner.dialer.as_ref(),
                &self.inner.config.setup_nodes,
                route,
            )
            .await
            .map_err(|e| {
                error!(%remote, err = %e, "Failed to dial route group");
                if e.is_cancelled() {
                    Error::Cancelled
                } else {
                    Error::Setup(e)
                }
            })?;

        let rg = self.create_route_group(rules)?;
        info!(%remote, local_port, remote_port, "Created new routes");
        Ok(rg)
    }

    /// Wait for a route group set up by a remote visor.
    pub async fn accept_routes(&self, cancel: &CancellationToken) -> Result<RouteGroup, Error> {
        let mut accept_rx = self.inner.accept_rx.lock().await;
        let rules = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = self.inner.cancel.cancelled() => return Err(Error::RouterClosed),
            rules = accept_rx.recv() => rules.ok_or(Error::RouterClosed)?,
        };
        drop(accept_rx);

        self.create_route_group(rules)
    }

    /// Queue edge rules pushed by a setup node, to be picked up by
    /// [`accept_routes`](Self::accept_routes).
    pub async fn introduce_rules(&self, rules: EdgeRules) -> Result<(), Error> {
        let tx = self.inner.accept_tx.lock().unwrap().clone();
        let Some(tx) = tx else {
            return Err(Error::ClosedPipe);
        };
        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(Error::ClosedPipe),
            res = tx.send(rules) => res.map_err(|_| Error::ClosedPipe),
        }
    }

    /// Store rules in the routing table.
    pub fn save_routing_rules(&self, rules: &[Rule]) {
        for rule in rules {
            self.inner.table.save_rule(*rule);
            debug!(route_id = %rule.key_route_id(), %rule, "Saved routing rule");
        }
    }

    /// Reserve `n` route ids which have never been handed out before.
    pub fn reserve_keys(&self, n: usize) -> Result<Vec<RouteId>, Error> {
        self.inner.table.reserve_keys(n).map_err(|e| {
            error!(n, err = %e, "Failed to reserve route ids");
            e.into()
        })
    }

    /// Amount of rules in the routing table.
    pub fn routes_count(&self) -> usize {
        self.inner.table.count()
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.inner.table.all_rules()
    }

    pub fn rule(&self, id: RouteId) -> Result<Rule, Error> {
        Ok(self.inner.table.rule(id)?)
    }

    pub fn save_rule(&self, rule: Rule) {
        self.inner.table.save_rule(rule);
    }

    /// Remove rules from the routing table. Route groups using a removed consume rule are
    /// closed.
    pub fn del_rules(&self, ids: &[RouteId]) {
        let rules: Vec<_> = ids
            .iter()
            .filter_map(|id| match self.inner.table.rule(*id) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    debug!(route_id = %id, err = %e, "Failed to get rule on removal");
                    None
                }
            })
            .collect();

        self.inner.table.del_rules(ids);

        for rule in &rules {
            self.remove_route_group_of_rule(rule);
        }
    }

    /// Checks if the given visor may push rules to this router.
    pub fn setup_is_trusted(&self, pk: &PublicKey) -> bool {
        self.inner.trusted_setup_nodes.contains(pk)
    }

    /// The open route group with the given descriptor, if any.
    pub fn route_group(&self, desc: &RouteDescriptor) -> Option<RouteGroup> {
        self.inner.route_groups.get(desc).map(|rg| rg.value().clone())
    }

    /// Close all route groups and stop the router. Closing a closed router does nothing.
    pub async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing router and all route groups");

        self.inner.accept_tx.lock().unwrap().take();
        // Route groups stay registered while closing, so close replies still reach them.
        let route_groups: Vec<_> = self
            .inner
            .route_groups
            .iter()
            .map(|rg| rg.value().clone())
            .collect();
        futures::future::join_all(route_groups.iter().map(|rg| rg.close())).await;
        self.inner.route_groups.clear();

        self.inner.cancel.cancel();
    }

    #[inline]
    fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// Save the rules of a new route group, and register the route group. An existing route group
    /// with the same descriptor is replaced and closed.
    fn create_route_group(&self, rules: EdgeRules) -> Result<RouteGroup, Error> {
        if self.is_closing() {
            return Err(Error::RouterClosed);
        }
        debug!(desc = %rules.desc, "Creating route group");
        let tp_id = rules.forward.next_transport_id()?;
        let transport = self
            .inner
            .tm
            .transport(&tp_id)
            .ok_or(Error::BadTransport(tp_id))?;

        self.save_routing_rules(&[rules.forward, rules.reverse]);

        let rg = RouteGroup::new(
            self.inner.config.route_group.clone(),
            rules.desc,
            self.inner.table.clone(),
            vec![RoutePath {
                forward: rules.forward,
                reverse: rules.reverse,
                transport,
            }],
            Some(self.inner.closed_sink.clone()),
        );

        if let Some(old) = self.inner.route_groups.insert(rules.desc, rg.clone()) {
            info!(desc = %rules.desc, "Route group already exists, closing the old one");
            tokio::spawn(async move { old.close().await });
        }
        // The router might have started closing after the check above, in which case it did not
        // see this route group.
        if self.is_closing() {
            self.inner
                .route_groups
                .remove_if(&rules.desc, |_, registered| registered.id() == rg.id());
            tokio::spawn(async move { rg.close().await });
            return Err(Error::RouterClosed);
        }
        self.inner.metrics.router_route_group_created();

        Ok(rg)
    }

    async fn fetch_best_routes(
        &self,
        cancel: &CancellationToken,
        src: PublicKey,
        dst: PublicKey,
        opts: RouteOptions,
    ) -> Result<(Vec<Hop>, Vec<Hop>), Error> {
        debug!(%src, %dst, "Requesting new routes");
        let forward = [src, dst];
        let reverse = [dst, src];
        let deadline = Instant::now() + ROUTE_FIND_RETRY_DURATION;

        loop {
            let err = match self
                .inner
                .route_finder
                .find_routes(&[forward, reverse], opts)
                .await
            {
                Ok(mut paths) => {
                    let fwd = paths.remove(&forward).and_then(|p| p.into_iter().next());
                    let rev = paths.remove(&reverse).and_then(|p| p.into_iter().next());
                    match (fwd, rev) {
                        (Some(fwd), Some(rev)) => {
                            debug!(forward = fwd.len(), reverse = rev.len(), "Found routes");
                            return Ok((fwd, rev));
                        }
                        _ => Error::NoRoute(src, dst),
                    }
                }
                Err(RouteFinderError::TransportNotFound) => {
                    return Err(RouteFinderError::TransportNotFound.into())
                }
                Err(e) => e.into(),
            };

            if Instant::now() >= deadline {
                return Err(err);
            }
            debug!(err = %err, "Failed to find routes, retrying");
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(ROUTE_FIND_RETRY_INTERVAL) => {}
            }
        }
    }

    async fn serve_transport_manager(self) {
        loop {
            let packet = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                packet = self.inner.tm.read_packet() => packet,
            };

            match packet {
                Ok(packet) => {
                    if let Err(e) = self.handle_transport_packet(packet).await {
                        debug!(err = %e, "Failed to handle transport packet");
                        self.inner.metrics.router_packet_dropped();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                    info!("Transport manager stopped serving");
                    break;
                }
                Err(e) => {
                    error!(err = %e, "Failed to read packet");
                }
            }
        }
        debug!("Transport manager loop exited");
    }

    async fn serve_setup<L>(self, mut listener: L)
    where
        L: Listener,
    {
        loop {
            let conn = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                conn = listener.accept() => conn,
            };
            let conn = match conn {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(err = %e, "Setup listener stopped");
                    break;
                }
            };

            let remote = conn.remote_pk();
            if !self.setup_is_trusted(&remote) {
                info!(%remote, "Closing connection from untrusted setup node");
                self.inner.metrics.router_untrusted_setup_connection();
                continue;
            }

            debug!(%remote, "Serving setup node connection");
            let gateway = RouterGateway::new(self.clone());
            let cancel = self.inner.cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = rpc::serve(conn, &gateway, &cancel).await {
                    debug!(%remote, err = %e, "Setup node connection failed");
                }
            });
        }
        debug!("Setup loop exited");
    }

    async fn handle_transport_packet(&self, packet: Packet) -> Result<(), Error> {
        let id = packet.route_id();
        let rule = self.inner.table.rule(id)?;
        trace!(route_id = %id, packet_type = %packet.packet_type(), %rule, "Handling packet");

        match packet.packet_type() {
            PacketType::Close => {
                let res = self.handle_close_packet(packet, &rule).await;
                self.inner.table.del_rules(&[id]);
                res
            }
            // Looking up a consume rule already counts as activity.
            PacketType::KeepAlive if rule.next_hop().is_none() => Ok(()),
            _ => match rule.kind() {
                RuleKind::Consume { desc } => self.deliver(desc, packet).await,
                RuleKind::Forward { .. } | RuleKind::Intermediary { .. } => {
                    self.forward_packet(packet, &rule).await
                }
            },
        }
    }

    async fn handle_close_packet(&self, packet: Packet, rule: &Rule) -> Result<(), Error> {
        let RuleKind::Consume { desc } = rule.kind() else {
            trace!(route_id = %rule.key_route_id(), "Relaying close packet");
            return self.forward_packet(packet, rule).await;
        };

        let rg = self
            .route_group(desc)
            .ok_or(Error::NoRouteGroup(*desc))?;
        if rg.is_closed() {
            return Err(Error::ClosedPipe);
        }
        rg.handle_packet(packet).await
    }

    async fn deliver(&self, desc: &RouteDescriptor, packet: Packet) -> Result<(), Error> {
        let rg = self
            .route_group(desc)
            .ok_or(Error::NoRouteGroup(*desc))?;
        rg.handle_packet(packet).await?;
        self.inner.metrics.router_packet_consumed();
        Ok(())
    }

    /// Relay a packet to the next hop of the rule, under the next route id.
    async fn forward_packet(&self, packet: Packet, rule: &Rule) -> Result<(), Error> {
        let next = rule.next_hop().ok_or(RuleError::NoSuchField {
            rule_type: rule.rule_type(),
            field: "next_route_id",
        })?;
        let tp = self
            .inner
            .tm
            .transport(&next.transport_id)
            .ok_or(Error::BadTransport(next.transport_id))?;

        tp.write_packet(packet.with_route_id(next.route_id)).await?;

        if let Err(e) = self.inner.table.update_activity(rule.key_route_id()) {
            error!(route_id = %rule.key_route_id(), err = %e, "Failed to update rule activity");
        }
        self.inner.metrics.router_packet_forwarded();
        trace!(
            route_id = %rule.key_route_id(),
            next_route_id = %next.route_id,
            transport = %next.transport_id,
            "Forwarded packet"
        );

        Ok(())
    }

    async fn rules_gc_loop(self) {
        let interval = self.inner.config.rules_gc_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = ticker.tick() => self.rules_gc(),
            }
        }
    }

    fn rules_gc(&self) {
        let removed = self.inner.table.collect_garbage();
        if removed.is_empty() {
            return;
        }
        debug!(rules_count = removed.len(), "Removed timed out rules");
        self.inner.metrics.router_rules_collected(removed.len());

        for rule in &removed {
            self.remove_route_group_of_rule(rule);
        }
    }

    /// Close the route group using the given rule, if it is a consume rule.
    fn remove_route_group_of_rule(&self, rule: &Rule) {
        let RuleKind::Consume { desc } = rule.kind() else {
            return;
        };
        let Some((_, rg)) = self.inner.route_groups.remove(desc) else {
            return;
        };
        if rg.is_closed() {
            return;
        }
        info!(%desc, "Closing route group of removed rule");
        tokio::spawn(async move { rg.close().await });
    }

    async fn process_closed_route_groups(
        self,
        mut closed_stream: mpsc::UnboundedReceiver<ClosedRouteGroup>,
    ) {
        loop {
            let closed = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                closed = closed_stream.recv() => match closed {
                    Some(closed) => closed,
                    None => break,
                },
            };
            // The route group might have been replaced in the meantime.
            self.inner
                .route_groups
                .remove_if(&closed.desc, |_, rg| rg.id() == closed.id);
            self.inner.metrics.router_route_group_closed();
            debug!(desc = %closed.desc, "Route group removed");
        }
    }
}
