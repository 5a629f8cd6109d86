//! The setup node: a trusted service which creates route groups on behalf of routers.
//!
//! A router asks a setup node to dial a [`BidirectionalRoute`](crate::routing::BidirectionalRoute).
//! The setup node reserves route ids on every visor along both paths, generates the rules for
//! every hop, pushes the transit rules to intermediary visors and the edge rules to the
//! responding visor, and finally returns the edge rules of the initiating visor.

use crate::{crypto::PublicKey, routing::RouteError, rpc::RpcError};

mod client;
mod gateway;
mod id_reserver;
mod node;
mod rules;

pub use client::{RouteGroupDialer, SetupClient};
pub use id_reserver::IdReserver;
pub use node::SetupNode;
pub use rules::{generate_rules, GeneratedRules, IdSource};

/// Errors while setting up a route group.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid route: {0}")]
    InvalidRoute(#[from] RouteError),
    #[error("failed to reserve route ids on {pk}: {source}")]
    Reserve { pk: PublicKey, source: RpcError },
    #[error("ran out of reserved route ids for {0}")]
    NoKey(PublicKey),
    #[error("visor {0} needs more than 255 route ids")]
    TooManyIds(PublicKey),
    #[error("no router client for {0}")]
    NoClient(PublicKey),
    #[error("no rules generated for {0}")]
    MissingRules(PublicKey),
    #[error("failed to add intermediary rules on {pk}: {source}")]
    AddIntermediaryRules { pk: PublicKey, source: RpcError },
    #[error("failed to add edge rules on {pk}: {source}")]
    AddEdgeRules { pk: PublicKey, source: RpcError },
    #[error("visor {0} rejected the rules")]
    RulesRejected(PublicKey),
    #[error("failed to dial setup node {pk}: {source}")]
    DialSetupNode { pk: PublicKey, source: RpcError },
    #[error("setup node {pk} failed to dial route group: {source}")]
    Remote { pk: PublicKey, source: RpcError },
    #[error("no setup nodes configured")]
    NoSetupNodes,
    #[error("setup cancelled")]
    Cancelled,
}

impl Error {
    /// The underlying rpc error, if any.
    fn rpc_error(&self) -> Option<&RpcError> {
        match self {
            Error::Reserve { source, .. }
            | Error::AddIntermediaryRules { source, .. }
            | Error::AddEdgeRules { source, .. }
            | Error::DialSetupNode { source, .. }
            | Error::Remote { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Checks if this error is only the result of the operation being cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled) || matches!(self.rpc_error(), Some(RpcError::Cancelled))
    }
}
