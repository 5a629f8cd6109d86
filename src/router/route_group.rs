//! Route groups: bidirectional virtual connections over routes.
//!
//! A route group owns the edge rules of a route at one visor. Outgoing data is packed into data
//! packets using the forward rule and written on the transport of the first hop. Incoming packets
//! for the route group arrive from the [`Router`](super::Router), which looks them up through the
//! consume rule.
//!
//! Every route group runs a background task which owns the close state of the group, sends keep
//! alives and probes the route. Closing follows a two phase handshake: the side closing first
//! sends a close packet over every path and waits (bounded by a timeout) until the remote
//! replied with a close packet on each of them. The remote, on seeing the close packet, replies
//! and tears down its side immediately.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, trace, warn};

use super::Error;
use crate::{
    config::RouteGroupConfig,
    deadline::Deadline,
    routing::{Addr, CloseCode, Packet, PacketType, RouteDescriptor, RoutingTable, Rule},
    transport::Transport,
};

/// Source of unique route group ids, used to tell apart route groups with the same descriptor.
static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// One path of a route group: the rules at this edge, and the transport for the first hop.
#[derive(Clone)]
pub(crate) struct RoutePath {
    pub forward: Rule,
    pub reverse: Rule,
    pub transport: Arc<dyn Transport>,
}

/// Lifecycle of a [`RouteGroup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The route group can be used.
    Open,
    /// The route group was closed locally, and waits for the remote to confirm.
    Closing,
    /// The remote closed the route group. Buffered data can still be read.
    RemoteClosed,
    /// The route group is fully closed.
    Closed,
}

/// Notification sent to the owner of a route group once it is done.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClosedRouteGroup {
    pub desc: RouteDescriptor,
    pub id: u64,
}

/// A bidirectional virtual connection to a remote visor.
///
/// Cloning a `RouteGroup` gives a new handle to the same connection.
#[derive(Clone)]
pub struct RouteGroup {
    inner: Arc<Inner>,
}

impl fmt::Debug for RouteGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteGroup")
            .field("desc", &self.desc())
            .field("status", &self.status())
            .finish()
    }
}

struct Inner {
    id: u64,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<Event>,
    reader: tokio::sync::Mutex<Reader>,
    read_deadline: Deadline,
    write_deadline: Deadline,
}

/// State accessed by both the handles and the background task.
struct Shared {
    desc: RouteDescriptor,
    config: RouteGroupConfig,
    table: RoutingTable,
    paths: Vec<RoutePath>,
    status: watch::Sender<Status>,
    data_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    last_sent: Mutex<Instant>,
    stats: NetworkStats,
}

struct Reader {
    rx: mpsc::Receiver<Bytes>,
    leftover: Bytes,
}

enum Event {
    Close(oneshot::Sender<()>),
    ClosePacket,
}

impl RouteGroup {
    pub(crate) fn new(
        config: RouteGroupConfig,
        desc: RouteDescriptor,
        table: RoutingTable,
        paths: Vec<RoutePath>,
        closed_sink: Option<mpsc::UnboundedSender<ClosedRouteGroup>>,
    ) -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let (data_tx, data_rx) = mpsc::channel(config.read_buffer_size.max(1));
        let (status, _) = watch::channel(Status::Open);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            desc,
            config,
            table,
            paths,
            status,
            data_tx: Mutex::new(Some(data_tx)),
            last_sent: Mutex::new(Instant::now()),
            stats: NetworkStats::new(),
        });

        let actor = Actor {
            id,
            shared: shared.clone(),
            events: events_rx,
            state: State::Open,
            close_waiters: Vec::new(),
            closed_sink,
        };
        tokio::spawn(actor.run());

        debug!(%desc, "Created route group");

        Self {
            inner: Arc::new(Inner {
                id,
                shared,
                events: events_tx,
                reader: tokio::sync::Mutex::new(Reader {
                    rx: data_rx,
                    leftover: Bytes::new(),
                }),
                read_deadline: Deadline::new(),
                write_deadline: Deadline::new(),
            }),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// The descriptor identifying this route group. The source is the remote visor, the
    /// destination is the local visor.
    #[inline]
    pub fn desc(&self) -> RouteDescriptor {
        self.inner.shared.desc
    }

    pub fn local_addr(&self) -> Addr {
        self.inner.shared.desc.dst()
    }

    pub fn remote_addr(&self) -> Addr {
        self.inner.shared.desc.src()
    }

    pub fn status(&self) -> Status {
        *self.inner.shared.status.borrow()
    }

    /// Checks if the route group can still be used to send data.
    pub fn is_alive(&self) -> bool {
        self.status() == Status::Open
    }

    pub fn is_closed(&self) -> bool {
        self.status() == Status::Closed
    }

    /// Read data sent by the remote. Returns `Ok(0)` once the remote closed the route group and
    /// all data has been read.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut status = self.inner.shared.status.subscribe();
        if *status.borrow_and_update() == Status::Closed {
            return Err(Error::ClosedPipe);
        }
        if self.inner.read_deadline.expired() {
            return Err(Error::Timeout);
        }

        let mut reader = self.inner.reader.lock().await;
        if !reader.leftover.is_empty() {
            return Ok(copy_chunk(&mut reader.leftover, buf));
        }

        let mut data = tokio::select! {
            _ = self.inner.read_deadline.wait() => return Err(Error::Timeout),
            _ = status.wait_for(|s| *s == Status::Closed) => return Err(Error::ClosedPipe),
            data = reader.rx.recv() => match data {
                Some(data) => data,
                None => return Ok(0),
            },
        };

        let n = copy_chunk(&mut data, buf);
        reader.leftover = data;
        Ok(n)
    }

    /// Send data to the remote. The data must fit in a single packet. Only the first path of
    /// the route group is used.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        let shared = &self.inner.shared;
        if *shared.status.borrow() != Status::Open {
            return Err(Error::ClosedPipe);
        }
        if self.inner.write_deadline.expired() {
            return Err(Error::Timeout);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let path = shared.paths.first().ok_or(Error::NoRules)?;
        let packet = Packet::data(path.forward.next_route_id()?, buf)?;

        tokio::select! {
            _ = self.inner.write_deadline.wait() => return Err(Error::Timeout),
            res = path.transport.write_packet(packet) => res?,
        }

        let key = path.forward.key_route_id();
        if let Err(e) = shared.table.update_activity(key) {
            debug!(route_id = %key, err = %e, "Failed to update activity of forward rule");
        }
        *shared.last_sent.lock().unwrap() = Instant::now();
        shared.stats.add_sent(buf.len());

        Ok(buf.len())
    }

    /// Close the route group. Returns once the route group is closed, this can take up to the
    /// configured close timeout if the remote does not respond. Closing a closed route group does
    /// nothing.
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        let (tx, rx) = oneshot::channel();
        if self.inner.events.send(Event::Close(tx)).is_err() {
            return;
        }
        // The sender is dropped if the task exits without answering, which also means the route
        // group is done.
        let _ = rx.await;
    }

    /// Set both the read and write deadline. `None` disables the deadline.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.inner.read_deadline.set(deadline);
        self.inner.write_deadline.set(deadline);
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.inner.read_deadline.set(deadline);
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.inner.write_deadline.set(deadline);
    }

    /// Round trip time of the route, as measured by the last network probe.
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.inner.shared.stats.latency.load(Ordering::Relaxed))
    }

    /// Rate at which the remote receives our data, in bytes per second.
    pub fn upload_speed(&self) -> u64 {
        self.inner.shared.stats.upload_speed.load(Ordering::Relaxed)
    }

    /// Rate at which we receive data from the remote, in bytes per second.
    pub fn download_speed(&self) -> u64 {
        self.inner.shared.stats.download_speed.load(Ordering::Relaxed)
    }

    pub fn bandwidth_sent(&self) -> u64 {
        self.inner.shared.stats.bandwidth_sent.load(Ordering::Relaxed)
    }

    pub fn bandwidth_received(&self) -> u64 {
        self.inner.shared.stats.bandwidth_received.load(Ordering::Relaxed)
    }

    /// Handle a packet the router received for this route group.
    pub(crate) async fn handle_packet(&self, packet: Packet) -> Result<(), Error> {
        match packet.packet_type() {
            PacketType::Data => self.handle_data_packet(packet).await,
            PacketType::Close => {
                trace!(desc = %self.desc(), code = ?packet.close_code(), "Received close packet");
                // The task is only gone once the route group is closed.
                self.inner
                    .events
                    .send(Event::ClosePacket)
                    .map_err(|_| Error::ClosedPipe)
            }
            PacketType::Ping => {
                let (timestamp, throughput) = packet.ping_payload()?;
                self.inner
                    .shared
                    .stats
                    .upload_speed
                    .store(throughput, Ordering::Relaxed);
                self.inner.shared.send_pong(timestamp).await
            }
            PacketType::Pong => {
                let sent = packet.pong_timestamp()?;
                let rtt = unix_millis().saturating_sub(sent);
                self.inner.shared.stats.latency.store(rtt, Ordering::Relaxed);
                Ok(())
            }
            PacketType::Error => {
                warn!(
                    desc = %self.desc(),
                    err = %String::from_utf8_lossy(packet.payload()),
                    "Remote reported an error on route group"
                );
                Ok(())
            }
            PacketType::KeepAlive | PacketType::Handshake => {
                trace!(desc = %self.desc(), packet_type = %packet.packet_type(), "Ignoring packet");
                Ok(())
            }
        }
    }

    async fn handle_data_packet(&self, packet: Packet) -> Result<(), Error> {
        let payload = packet.payload_bytes();
        if payload.is_empty() {
            return Ok(());
        }
        let shared = &self.inner.shared;
        let tx = shared.data_tx.lock().unwrap().clone();
        let Some(tx) = tx else {
            return Err(Error::ClosedPipe);
        };
        shared.stats.add_received(payload.len());

        let mut status = shared.status.subscribe();
        tokio::select! {
            res = tx.send(payload) => res.map_err(|_| Error::ClosedPipe),
            _ = status.wait_for(|s| *s == Status::Closed) => Err(Error::ClosedPipe),
        }
    }
}

fn copy_chunk(src: &mut Bytes, dst: &mut [u8]) -> usize {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
    *src = src.slice(n..);
    n
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl Shared {
    /// Send a close packet on every path. Returns the amount of paths the packet was sent on.
    async fn broadcast_close_packets(&self) -> usize {
        let mut sent = 0;
        for path in &self.paths {
            match self
                .send_on_path(path, |id| Packet::close(id, CloseCode::CloseRequested))
                .await
            {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!(desc = %self.desc, err = %e, "Failed to send close packet");
                }
            }
        }
        sent
    }

    async fn send_keep_alives(&self) {
        for path in &self.paths {
            match self.send_on_path(path, Packet::keep_alive).await {
                Ok(()) => {
                    let key = path.forward.key_route_id();
                    if let Err(e) = self.table.update_activity(key) {
                        debug!(route_id = %key, err = %e, "Failed to update activity of forward rule");
                    }
                }
                Err(e) => {
                    debug!(desc = %self.desc, err = %e, "Failed to send keep alive");
                }
            }
        }
    }

    async fn send_ping(&self) -> Result<(), Error> {
        let path = self.paths.first().ok_or(Error::NoRules)?;
        let throughput = self.stats.remote_throughput();
        self.stats.download_speed.store(throughput, Ordering::Relaxed);
        self.send_on_path(path, |id| Packet::ping(id, unix_millis(), throughput))
            .await
    }

    async fn send_pong(&self, timestamp: u64) -> Result<(), Error> {
        let path = self.paths.first().ok_or(Error::NoRules)?;
        self.send_on_path(path, |id| Packet::pong(id, timestamp))
            .await
    }

    async fn send_on_path(
        &self,
        path: &RoutePath,
        make_packet: impl FnOnce(crate::routing::RouteId) -> Packet,
    ) -> Result<(), Error> {
        let packet = make_packet(path.forward.next_route_id()?);
        path.transport.write_packet(packet).await?;
        Ok(())
    }

    /// Remove the rules of this route group from the table.
    fn delete_rules(&self) {
        let ids: Vec<_> = self
            .paths
            .iter()
            .flat_map(|path| [path.forward.key_route_id(), path.reverse.key_route_id()])
            .collect();
        self.table.del_rules(&ids);
    }

    /// Stop accepting data. The reader gets EOF once it drained the buffered data.
    fn close_data_channel(&self) {
        self.data_tx.lock().unwrap().take();
    }
}

/// Close handshake state, owned by the background task.
enum State {
    Open,
    Closing {
        replies_pending: usize,
        deadline: Instant,
    },
    RemoteClosed,
    Closed,
}

struct Actor {
    id: u64,
    shared: Arc<Shared>,
    events: mpsc::UnboundedReceiver<Event>,
    state: State,
    close_waiters: Vec<oneshot::Sender<()>>,
    closed_sink: Option<mpsc::UnboundedSender<ClosedRouteGroup>>,
}

impl Actor {
    async fn run(mut self) {
        let config = self.shared.config.clone();
        let mut keep_alive = tokio::time::interval_at(
            Instant::now() + config.keep_alive_interval,
            config.keep_alive_interval,
        );
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut probe = tokio::time::interval_at(
            Instant::now() + config.network_probe_interval,
            config.network_probe_interval,
        );
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let open = matches!(self.state, State::Open);
            let close_deadline = match self.state {
                State::Closing { deadline, .. } => Some(deadline),
                _ => None,
            };

            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else {
                        // All handles are gone.
                        break;
                    };
                    self.handle_event(event).await;
                }
                _ = keep_alive.tick(), if open => {
                    let since_last_send = self.shared.last_sent.lock().unwrap().elapsed();
                    if since_last_send >= config.keep_alive_interval {
                        self.shared.send_keep_alives().await;
                    }
                }
                _ = probe.tick(), if open => {
                    if let Err(e) = self.shared.send_ping().await {
                        trace!(desc = %self.shared.desc, err = %e, "Failed to send network probe");
                    }
                }
                _ = tokio::time::sleep_until(close_deadline.unwrap_or_else(Instant::now)), if close_deadline.is_some() => {
                    if let State::Closing { replies_pending, .. } = self.state {
                        warn!(
                            desc = %self.shared.desc,
                            replies_pending,
                            "Timed out waiting for close replies"
                        );
                    }
                    self.finalize();
                }
            }

            if matches!(self.state, State::Closed) {
                break;
            }
        }

        trace!(desc = %self.shared.desc, "Route group task exited");
    }

    async fn handle_event(&mut self, event: Event) {
        match (event, &mut self.state) {
            (Event::Close(reply), State::Open) => {
                debug!(desc = %self.shared.desc, "Closing route group");
                self.shared.status.send_replace(Status::Closing);
                self.close_waiters.push(reply);
                let sent = self.shared.broadcast_close_packets().await;
                if sent == 0 {
                    self.finalize();
                } else {
                    self.state = State::Closing {
                        replies_pending: sent,
                        deadline: Instant::now() + self.shared.config.close_timeout,
                    };
                }
            }
            (Event::Close(reply), State::Closing { .. }) => {
                self.close_waiters.push(reply);
            }
            (Event::Close(reply), State::RemoteClosed) => {
                self.close_waiters.push(reply);
                self.finalize();
            }
            (Event::Close(reply), State::Closed) => {
                let _ = reply.send(());
            }
            (Event::ClosePacket, State::Open) => {
                debug!(desc = %self.shared.desc, "Route group closed by remote");
                self.shared.broadcast_close_packets().await;
                self.shared.delete_rules();
                self.shared.close_data_channel();
                self.state = State::RemoteClosed;
                self.shared.status.send_replace(Status::RemoteClosed);
                self.notify_closed();
            }
            (
                Event::ClosePacket,
                State::Closing {
                    replies_pending, ..
                },
            ) => {
                *replies_pending = replies_pending.saturating_sub(1);
                if *replies_pending == 0 {
                    self.finalize();
                }
            }
            (Event::ClosePacket, State::RemoteClosed | State::Closed) => {
                trace!(desc = %self.shared.desc, "Ignoring close packet on closed route group");
            }
        }
    }

    /// Tear down the local side of the route group.
    fn finalize(&mut self) {
        self.shared.delete_rules();
        self.shared.close_data_channel();
        self.state = State::Closed;
        self.shared.status.send_replace(Status::Closed);
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
        self.notify_closed();
        debug!(desc = %self.shared.desc, "Route group closed");
    }

    /// Tell the owner the route group is done. Only the first call has an effect.
    fn notify_closed(&mut self) {
        if let Some(sink) = self.closed_sink.take() {
            let _ = sink.send(ClosedRouteGroup {
                desc: self.shared.desc,
                id: self.id,
            });
        }
    }
}

/// Traffic statistics of a route group.
struct NetworkStats {
    /// Round trip time in milliseconds.
    latency: AtomicU64,
    upload_speed: AtomicU64,
    download_speed: AtomicU64,
    bandwidth_sent: AtomicU64,
    bandwidth_received: AtomicU64,
    /// Start of the current throughput window, and the amount of bytes received at that point.
    throughput_window: Mutex<(Instant, u64)>,
}

impl NetworkStats {
    fn new() -> Self {
        Self {
            latency: AtomicU64::new(0),
            upload_speed: AtomicU64::new(0),
            download_speed: AtomicU64::new(0),
            bandwidth_sent: AtomicU64::new(0),
            bandwidth_received: AtomicU64::new(0),
            throughput_window: Mutex::new((Instant::now(), 0)),
        }
    }

    fn add_sent(&self, amount: usize) {
        self.bandwidth_sent
            .fetch_add(amount as u64, Ordering::Relaxed);
    }

    fn add_received(&self, amount: usize) {
        self.bandwidth_received
            .fetch_add(amount as u64, Ordering::Relaxed);
    }

    /// Bytes per second received since the last call, and start a new window.
    fn remote_throughput(&self) -> u64 {
        let now = Instant::now();
        let received = self.bandwidth_received.load(Ordering::Relaxed);
        let mut window = self.throughput_window.lock().unwrap();
        let (start, received_at_start) = *window;
        *window = (now, received);

        let elapsed = now.saturating_duration_since(start).as_millis() as u64;
        if elapsed == 0 {
            return 0;
        }
        received.saturating_sub(received_at_start) * 1000 / elapsed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{sync::mpsc, time::Instant};

    use super::{ClosedRouteGroup, RouteGroup, RoutePath, Status};
    use crate::{
        config::RouteGroupConfig,
        crypto::PublicKey,
        router::Error,
        routing::{CloseCode, Packet, PacketType, RouteDescriptor, RouteId, RoutingTable, Rule},
        testutil::MemTransport,
        transport::TransportId,
    };

    const KEEP_ALIVE: Duration = Duration::from_secs(30);

    struct Fixture {
        rg: RouteGroup,
        table: RoutingTable,
        outbound: mpsc::UnboundedReceiver<Packet>,
        closed: mpsc::UnboundedReceiver<ClosedRouteGroup>,
    }

    fn desc() -> RouteDescriptor {
        // Remote is the source, local the destination.
        RouteDescriptor::new(PublicKey::from([2; 32]), PublicKey::from([1; 32]), 2, 1)
    }

    fn fixture(config: RouteGroupConfig) -> Fixture {
        let table = RoutingTable::new();
        let tp_id = TransportId::new_random();
        let forward = Rule::forward(
            KEEP_ALIVE,
            RouteId::new(1),
            RouteId::new(10),
            tp_id,
            desc().invert(),
        );
        let reverse = Rule::consume(KEEP_ALIVE, RouteId::new(2), desc());
        table.save_rule(forward);
        table.save_rule(reverse);

        let (transport, outbound) = MemTransport::capture(tp_id, desc().src_pk());
        let (closed_tx, closed) = mpsc::unbounded_channel();
        let rg = RouteGroup::new(
            config,
            desc(),
            table.clone(),
            vec![RoutePath {
                forward,
                reverse,
                transport,
            }],
            Some(closed_tx),
        );
        Fixture {
            rg,
            table,
            outbound,
            closed,
        }
    }

    #[tokio::test]
    async fn write_uses_forward_rule() {
        let mut f = fixture(RouteGroupConfig::default());
        assert_eq!(f.rg.write(b"hello").await.expect("Can write"), 5);

        let packet = f.outbound.recv().await.expect("Packet was sent");
        assert_eq!(packet.packet_type(), PacketType::Data);
        assert_eq!(packet.route_id(), RouteId::new(10));
        assert_eq!(packet.payload(), b"hello");
        assert_eq!(f.rg.bandwidth_sent(), 5);
    }

    #[tokio::test]
    async fn empty_write_sends_nothing() {
        let mut f = fixture(RouteGroupConfig::default());
        assert_eq!(f.rg.write(b"").await.expect("Can write"), 0);
        f.rg.write(b"x").await.expect("Can write");

        let packet = f.outbound.recv().await.expect("Packet was sent");
        assert_eq!(packet.payload(), b"x");
        assert_eq!(f.rg.bandwidth_sent(), 1);
        assert!(format!("{:?}", f.rg).contains("Open"));
    }

    #[tokio::test]
    async fn read_buffers_surplus() {
        let f = fixture(RouteGroupConfig::default());
        f.rg.handle_packet(Packet::data(RouteId::new(2), b"hello world").expect("Fits"))
            .await
            .expect("Route group is open");

        let mut buf = [0; 5];
        assert_eq!(f.rg.read(&mut buf).await.expect("Can read"), 5);
        assert_eq!(&buf, b"hello");
        let mut buf = [0; 16];
        let n = f.rg.read(&mut buf).await.expect("Can read");
        assert_eq!(&buf[..n], b" world");
        assert_eq!(f.rg.bandwidth_received(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn read_deadline() {
        let f = fixture(RouteGroupConfig::default());
        f.rg.set_read_deadline(Some(Instant::now() + Duration::from_secs(1)));
        let mut buf = [0; 8];
        let err = f.rg.read(&mut buf).await.expect_err("Nothing to read");
        assert!(err.is_timeout());

        // An expired deadline fails immediately, clearing it allows reads again.
        assert!(f.rg.read(&mut buf).await.expect_err("Still expired").is_timeout());
        f.rg.set_read_deadline(None);
        f.rg.handle_packet(Packet::data(RouteId::new(2), b"x").expect("Fits"))
            .await
            .expect("Route group is open");
        assert_eq!(f.rg.read(&mut buf).await.expect("Can read"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_completes_on_reply() {
        let mut f = fixture(RouteGroupConfig::default());
        let start = Instant::now();

        let closer = {
            let rg = f.rg.clone();
            tokio::spawn(async move { rg.close().await })
        };

        let packet = f.outbound.recv().await.expect("Close packet was sent");
        assert_eq!(packet.packet_type(), PacketType::Close);
        assert_eq!(packet.route_id(), RouteId::new(10));
        assert_eq!(f.rg.status(), Status::Closing);
        assert!(f.rg.write(b"late").await.expect_err("Closing").is_closed());

        f.rg.handle_packet(Packet::close(RouteId::new(2), CloseCode::CloseRequested))
            .await
            .expect("Reply is accepted");
        closer.await.expect("Close does not panic");

        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(f.rg.is_closed());
        assert_eq!(f.table.count(), 0);
        let closed = f.closed.recv().await.expect("Owner is notified");
        assert_eq!(closed.desc, desc());
        assert_eq!(closed.id, f.rg.id());
    }

    #[tokio::test(start_paused = true)]
    async fn close_times_out_without_reply() {
        let f = fixture(RouteGroupConfig::default());
        let start = Instant::now();
        f.rg.close().await;
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_millis(2_100));
        assert!(f.rg.is_closed());
        assert_eq!(f.table.count(), 0);

        // Closing again is a no-op.
        f.rg.close().await;
        let mut buf = [0; 4];
        assert!(matches!(f.rg.read(&mut buf).await, Err(Error::ClosedPipe)));
        assert!(matches!(f.rg.write(b"x").await, Err(Error::ClosedPipe)));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_close_is_answered() {
        let mut f = fixture(RouteGroupConfig::default());
        f.rg.handle_packet(Packet::data(RouteId::new(2), b"bye").expect("Fits"))
            .await
            .expect("Route group is open");
        f.rg.handle_packet(Packet::close(RouteId::new(2), CloseCode::CloseRequested))
            .await
            .expect("Close is accepted");

        let reply = f.outbound.recv().await.expect("Close reply was sent");
        assert_eq!(reply.packet_type(), PacketType::Close);
        f.closed.recv().await.expect("Owner is notified");
        assert_eq!(f.rg.status(), Status::RemoteClosed);
        assert!(!f.rg.is_alive());

        // Buffered data is still readable, then EOF.
        let mut buf = [0; 8];
        assert_eq!(f.rg.read(&mut buf).await.expect("Can read"), 3);
        assert_eq!(f.rg.read(&mut buf).await.expect("EOF"), 0);
        assert!(f.rg.write(b"x").await.expect_err("Remote closed").is_closed());

        // Local close does not wait on anything.
        let start = Instant::now();
        f.rg.close().await;
        assert!(start.elapsed() < Duration::from_millis(10));
        assert!(f.rg.is_closed());
        assert!(f.outbound.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_sent_when_idle() {
        let config = RouteGroupConfig {
            keep_alive_interval: Duration::from_secs(1),
            network_probe_interval: Duration::from_secs(3600),
            ..RouteGroupConfig::default()
        };
        let mut f = fixture(config);

        let packet = f.outbound.recv().await.expect("Keep alive was sent");
        assert_eq!(packet.packet_type(), PacketType::KeepAlive);
        assert_eq!(packet.route_id(), RouteId::new(10));
    }

    #[tokio::test(start_paused = true)]
    async fn ping_is_answered_and_pong_measures_latency() {
        let mut f = fixture(RouteGroupConfig::default());
        f.rg.handle_packet(Packet::ping(RouteId::new(2), 1, 4096))
            .await
            .expect("Ping is handled");
        assert_eq!(f.rg.upload_speed(), 4096);
        let pong = f.outbound.recv().await.expect("Pong was sent");
        assert_eq!(pong.pong_timestamp(), Ok(1));

        f.rg.handle_packet(Packet::pong(RouteId::new(2), super::unix_millis()))
            .await
            .expect("Pong is handled");
        assert!(f.rg.latency() < Duration::from_secs(1));
    }
}
