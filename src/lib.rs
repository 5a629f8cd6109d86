//! Multi-hop routing core of an overlay mesh.
//!
//! Visors relay packets along routes using per-hop [`Rule`](routing::Rule)s. A [`Router`] owns
//! the routing table of a visor and exposes the ends of routes as [`RouteGroup`]s, bidirectional
//! virtual connections to remote visors. New route groups are created by a [`SetupNode`], which
//! reserves route ids on every visor of a route and distributes the rules.

pub mod config;
pub mod crypto;
mod deadline;
pub mod metrics;
pub mod network;
pub mod router;
pub mod routing;
pub mod rpc;
pub mod setup;
pub mod transport;

#[cfg(test)]
mod testutil;

pub use config::{RouteGroupConfig, RouterConfig, SetupConfig};
pub use crypto::{PublicKey, SecretKey};
pub use metrics::{Metrics, NoMetrics};
pub use router::{RouteGroup, Router, RouterDeps};
pub use routing::{Packet, RouteDescriptor, RouteId, Rule, RoutingTable};
pub use setup::{SetupClient, SetupNode};
