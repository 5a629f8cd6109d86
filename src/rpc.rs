//! Request/response calls between routers and setup nodes.
//!
//! Calls are carried over an overlay [`Conn`]. Every message is a length delimited frame holding
//! a JSON encoded [`Envelope`]. A connection carries one call at a time, the sequence number in
//! the envelope pairs a response with its request, so a response to an abandoned call is skipped
//! by the next one.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::{
    codec::{Framed, LengthDelimitedCodec},
    sync::CancellationToken,
};
use tracing::{debug, trace};

use crate::{
    crypto::PublicKey,
    network::Conn,
    routing::{BidirectionalRoute, EdgeRules, RouteId, Rule},
};

/// Largest frame accepted on an rpc connection.
const MAX_FRAME_SIZE: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Ask a setup node to create a route group.
    DialRouteGroup(BidirectionalRoute),
    /// Push the rules of the responding edge of a route group to a router.
    AddEdgeRules(EdgeRules),
    /// Push transit rules to a router.
    AddIntermediaryRules(Vec<Rule>),
    /// Reserve route ids on a router.
    ReserveIds(u8),
}

impl Request {
    fn name(&self) -> &'static str {
        match self {
            Request::DialRouteGroup(_) => "DialRouteGroup",
            Request::AddEdgeRules(_) => "AddEdgeRules",
            Request::AddIntermediaryRules(_) => "AddIntermediaryRules",
            Request::ReserveIds(_) => "ReserveIDs",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    EdgeRules(EdgeRules),
    Ok(bool),
    RouteIds(Vec<RouteId>),
    Failure(Failure),
}

/// Category of a [`Failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCode {
    Internal,
    BadRequest,
    Timeout,
    DialRouteGroup,
    AddRules,
    ReserveIds,
}

/// An error reported by the remote side of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct Failure {
    pub code: FailureCode,
    pub message: String,
}

impl Failure {
    pub fn new(code: FailureCode, message: impl ToString) -> Self {
        Self {
            code,
            message: message.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("rpc connection: {0}")]
    Io(#[from] io::Error),
    #[error("rpc encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("rpc connection closed")]
    ConnectionClosed,
    #[error("call cancelled")]
    Cancelled,
    #[error(transparent)]
    Failure(#[from] Failure),
    #[error("unexpected response to {0}")]
    UnexpectedResponse(&'static str),
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    seq: u64,
    body: T,
}

fn framed(conn: Box<dyn Conn>) -> Framed<Box<dyn Conn>, LengthDelimitedCodec> {
    Framed::new(
        conn,
        LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_SIZE)
            .new_codec(),
    )
}

struct ClientState {
    framed: Framed<Box<dyn Conn>, LengthDelimitedCodec>,
    next_seq: u64,
}

/// The calling side of an rpc connection.
pub struct RpcClient {
    remote: PublicKey,
    state: Mutex<ClientState>,
}

impl RpcClient {
    pub fn new(conn: Box<dyn Conn>) -> Self {
        Self {
            remote: conn.remote_pk(),
            state: Mutex::new(ClientState {
                framed: framed(conn),
                next_seq: 0,
            }),
        }
    }

    /// The visor this client talks to.
    #[inline]
    pub fn remote(&self) -> PublicKey {
        self.remote
    }

    /// Perform a call. A [`Failure`] response is returned as an error. If `cancel` fires before
    /// the response arrives, the call is abandoned. A request which started to be written is
    /// always written in full, so the connection stays usable for the next call.
    pub async fn call(
        &self,
        cancel: &CancellationToken,
        request: Request,
    ) -> Result<Response, RpcError> {
        let name = request.name();
        let mut state = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RpcError::Cancelled),
            state = self.state.lock() => state,
        };
        let seq = state.next_seq;
        state.next_seq += 1;

        let frame = serde_json::to_vec(&Envelope { seq, body: request })?;
        state.framed.send(Bytes::from(frame)).await?;

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RpcError::Cancelled),
            res = self.receive(&mut state.framed, seq) => res?,
        };
        trace!(remote = %self.remote, call = name, "Received rpc response");
        match response {
            Response::Failure(failure) => Err(failure.into()),
            response => Ok(response),
        }
    }

    /// Wait for the response with the given sequence number.
    async fn receive(
        &self,
        framed: &mut Framed<Box<dyn Conn>, LengthDelimitedCodec>,
        seq: u64,
    ) -> Result<Response, RpcError> {
        loop {
            let frame = framed.next().await.ok_or(RpcError::ConnectionClosed)??;
            let envelope: Envelope<Response> = serde_json::from_slice(&frame)?;
            if envelope.seq == seq {
                return Ok(envelope.body);
            }
            debug!(
                remote = %self.remote,
                seq = envelope.seq,
                expected = seq,
                "Skipping response to abandoned call"
            );
        }
    }

    /// Close the underlying connection.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let Err(e) = SinkExt::<Bytes>::close(&mut state.framed).await {
            debug!(remote = %self.remote, err = %e, "Failed to close rpc connection cleanly");
        }
    }
}

/// The serving side of an rpc connection.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}

/// Answer calls arriving on `conn` until the remote closes the connection or `cancel` fires.
pub async fn serve<H>(
    conn: Box<dyn Conn>,
    handler: &H,
    cancel: &CancellationToken,
) -> Result<(), RpcError>
where
    H: Handler + ?Sized,
{
    let remote = conn.remote_pk();
    let mut framed = framed(conn);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = framed.next() => frame,
        };
        let Some(frame) = frame else {
            trace!(%remote, "Rpc connection closed by remote");
            return Ok(());
        };

        let envelope: Envelope<Request> = serde_json::from_slice(&frame?)?;
        trace!(%remote, call = envelope.body.name(), seq = envelope.seq, "Serving rpc call");
        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            response = handler.handle(envelope.body) => response,
        };

        let frame = serde_json::to_vec(&Envelope {
            seq: envelope.seq,
            body: response,
        })?;
        framed.send(Bytes::from(frame)).await?;
    }
}
