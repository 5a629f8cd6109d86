use std::collections::HashMap;

use async_trait::async_trait;

use crate::{
    config::{DEFAULT_MAX_HOPS, DEFAULT_MIN_HOPS},
    routing::{Path, PathEdges},
};

/// Bounds on the routes returned by a [`RouteFinder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteOptions {
    pub min_hops: u16,
    pub max_hops: u16,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self {
            min_hops: DEFAULT_MIN_HOPS,
            max_hops: DEFAULT_MAX_HOPS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteFinderError {
    /// One of the requested edges has no transport at all, retrying won't help.
    #[error("transport not found")]
    TransportNotFound,
    #[error("route finder: {0}")]
    Other(String),
}

/// Service computing paths through the transport graph.
#[async_trait]
pub trait RouteFinder: Send + Sync {
    /// Find paths for every pair of edges. The result holds an entry for each requested pair.
    async fn find_routes(
        &self,
        edges: &[PathEdges],
        opts: RouteOptions,
    ) -> Result<HashMap<PathEdges, Vec<Path>>, RouteFinderError>;
}
