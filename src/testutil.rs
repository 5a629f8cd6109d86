//! In memory overlay network and transports, to run several visors in a single test.

use std::{
    collections::HashMap,
    io,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf},
    sync::mpsc,
};

use crate::{
    crypto::PublicKey,
    network::{Conn, Dialer, Listener},
    router::{RouteFinder, RouteFinderError, RouteOptions},
    routing::{Packet, Path, PathEdges, Port},
    transport::{Transport, TransportId, TransportManager},
};

const DUPLEX_BUFFER: usize = 64 * 1024;

/// One end of an in memory stream between two visors.
pub struct MemConn {
    remote: PublicKey,
    stream: DuplexStream,
}

impl MemConn {
    /// Create a connected pair. The first end is held by `local`, the second by `remote`.
    pub fn pair(local: PublicKey, remote: PublicKey) -> (MemConn, MemConn) {
        Self::pair_with_capacity(local, remote, DUPLEX_BUFFER)
    }

    /// Like [`pair`](Self::pair), but writes block once `capacity` bytes are unread.
    pub fn pair_with_capacity(
        local: PublicKey,
        remote: PublicKey,
        capacity: usize,
    ) -> (MemConn, MemConn) {
        let (a, b) = tokio::io::duplex(capacity);
        (
            MemConn { remote, stream: a },
            MemConn {
                remote: local,
                stream: b,
            },
        )
    }
}

impl Conn for MemConn {
    fn remote_pk(&self) -> PublicKey {
        self.remote
    }
}

impl AsyncRead for MemConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

type Listeners = HashMap<(PublicKey, Port), mpsc::UnboundedSender<Box<dyn Conn>>>;

/// An overlay network where visors can listen on ports and dial each other.
#[derive(Clone, Default)]
pub struct MemNetwork {
    listeners: Arc<Mutex<Listeners>>,
}

impl MemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen(&self, pk: PublicKey, port: Port) -> MemListener {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().unwrap().insert((pk, port), tx);
        MemListener { rx }
    }

    pub fn dialer(&self, local: PublicKey) -> MemDialer {
        MemDialer {
            network: self.clone(),
            local,
        }
    }
}

pub struct MemDialer {
    network: MemNetwork,
    local: PublicKey,
}

#[async_trait]
impl Dialer for MemDialer {
    async fn dial(&self, remote: PublicKey, port: Port) -> io::Result<Box<dyn Conn>> {
        let listener = self
            .network
            .listeners
            .lock()
            .unwrap()
            .get(&(remote, port))
            .cloned()
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        let (local, remote) = MemConn::pair(self.local, remote);
        listener
            .send(Box::new(remote))
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        Ok(Box::new(local))
    }
}

pub struct MemListener {
    rx: mpsc::UnboundedReceiver<Box<dyn Conn>>,
}

#[async_trait]
impl Listener for MemListener {
    async fn accept(&mut self) -> io::Result<Box<dyn Conn>> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

/// A transport delivering packets into a channel.
pub struct MemTransport {
    id: TransportId,
    remote: PublicKey,
    sink: mpsc::UnboundedSender<Packet>,
}

impl MemTransport {
    /// A transport whose written packets can be inspected through the returned receiver.
    pub fn capture(
        id: TransportId,
        remote: PublicKey,
    ) -> (Arc<MemTransport>, mpsc::UnboundedReceiver<Packet>) {
        let (sink, rx) = mpsc::unbounded_channel();
        (Arc::new(MemTransport { id, remote, sink }), rx)
    }
}

#[async_trait]
impl Transport for MemTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn remote(&self) -> PublicKey {
        self.remote
    }

    async fn write_packet(&self, packet: Packet) -> io::Result<()> {
        self.sink
            .send(packet)
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }
}

/// The transports of a single visor.
pub struct MemTransportManager {
    local: PublicKey,
    inbound_tx: mpsc::UnboundedSender<Packet>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>,
    transports: Mutex<HashMap<TransportId, Arc<dyn Transport>>>,
}

impl MemTransportManager {
    pub fn new(local: PublicKey) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            local,
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            transports: Mutex::new(HashMap::new()),
        })
    }

    /// Connect two visors with a new transport, returning its id.
    pub fn connect(a: &Arc<Self>, b: &Arc<Self>) -> TransportId {
        let id = TransportId::new_random();
        a.add_transport(Arc::new(MemTransport {
            id,
            remote: b.local,
            sink: b.inbound_tx.clone(),
        }));
        b.add_transport(Arc::new(MemTransport {
            id,
            remote: a.local,
            sink: a.inbound_tx.clone(),
        }));
        id
    }

    pub fn add_transport(&self, transport: Arc<dyn Transport>) {
        self.transports
            .lock()
            .unwrap()
            .insert(transport.id(), transport);
    }

    /// Deliver a packet as if it arrived on one of the transports.
    pub fn inject(&self, packet: Packet) {
        let _ = self.inbound_tx.send(packet);
    }
}

#[async_trait]
impl TransportManager for MemTransportManager {
    async fn read_packet(&self) -> io::Result<Packet> {
        self.inbound_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }

    fn transport(&self, id: &TransportId) -> Option<Arc<dyn Transport>> {
        self.transports.lock().unwrap().get(id).cloned()
    }
}

/// A route finder returning fixed paths.
#[derive(Default)]
pub struct StaticRouteFinder {
    routes: Mutex<HashMap<PathEdges, Vec<Path>>>,
}

impl StaticRouteFinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(&self, path: Path) {
        let (Some(first), Some(last)) = (path.first(), path.last()) else {
            return;
        };
        let edges = [first.from, last.to];
        self.routes
            .lock()
            .unwrap()
            .entry(edges)
            .or_default()
            .push(path);
    }
}

#[async_trait]
impl RouteFinder for StaticRouteFinder {
    async fn find_routes(
        &self,
        edges: &[PathEdges],
        _opts: RouteOptions,
    ) -> Result<HashMap<PathEdges, Vec<Path>>, RouteFinderError> {
        let routes = self.routes.lock().unwrap();
        let mut found = HashMap::new();
        for edge in edges {
            let paths = routes
                .get(edge)
                .cloned()
                .ok_or_else(|| RouteFinderError::Other(format!("no route {} -> {}", edge[0], edge[1])))?;
            found.insert(*edge, paths);
        }
        Ok(found)
    }
}
