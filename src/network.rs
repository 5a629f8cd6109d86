//! Point to point streams over the overlay network.
//!
//! Routers and setup nodes talk to each other over reliable streams addressed by
//! `(public key, port)`. How these streams are established is up to the overlay, this module
//! only defines the interface.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{crypto::PublicKey, routing::Port};

/// Port on which setup nodes accept route group requests.
pub const SETUP_PORT: Port = 36;

/// Port on which routers accept rules pushed by setup nodes.
pub const AWAIT_SETUP_PORT: Port = 136;

/// A reliable, ordered stream to a remote visor.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// The visor on the other end of the stream.
    fn remote_pk(&self) -> PublicKey;
}

/// Opens streams to remote visors.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, remote: PublicKey, port: Port) -> io::Result<Box<dyn Conn>>;
}

/// Accepts streams opened by remote visors on a local port.
#[async_trait]
pub trait Listener: Send {
    /// Wait for the next incoming stream. An error means the listener is closed.
    async fn accept(&mut self) -> io::Result<Box<dyn Conn>>;
}
