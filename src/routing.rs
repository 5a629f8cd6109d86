//! Routing primitives: route identifiers, descriptors, rules, packets, routes, and the routing
//! table holding the rules of a visor.

mod descriptor;
pub mod packet;
mod route;
pub mod rule;
pub mod table;

pub use descriptor::{Addr, Port, RouteDescriptor, RouteId, ROUTE_DESCRIPTOR_SIZE};
pub use packet::{CloseCode, Packet, PacketCodec, PacketError, PacketType};
pub use route::{
    BidirectionalRoute, EdgeRules, Hop, Path, PathEdges, Route, RouteError, RulesMap,
};
pub use rule::{NextHop, Rule, RuleError, RuleKind, RuleSummary, RuleType};
pub use table::{RoutingTable, TableError};

use std::time::Duration;

/// Default keep alive of the rules of a route.
pub const DEFAULT_ROUTE_KEEP_ALIVE: Duration = Duration::from_secs(30);
