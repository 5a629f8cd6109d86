//! Runtime metrics of routers and setup nodes. The main item of interest is the [`Metrics`]
//! trait. Users can provide their own implementation of this, or use [`NoMetrics`] to disable
//! gathering metrics.

use std::time::Duration;

/// The collection of all metrics exported by a [`Router`](crate::router::Router) or a
/// [`SetupNode`](crate::setup::SetupNode). All methods have a default implementation, so an
/// implementation only needs to override the metrics it is interested in.
pub trait Metrics {
    /// A new route group was registered on the [`Router`](crate::router::Router), either dialed
    /// or accepted.
    #[inline]
    fn router_route_group_created(&self) {}

    /// A route group was removed from the [`Router`](crate::router::Router) after it closed.
    #[inline]
    fn router_route_group_closed(&self) {}

    /// The [`Router`](crate::router::Router) relayed a packet to the next hop of a route.
    #[inline]
    fn router_packet_forwarded(&self) {}

    /// The [`Router`](crate::router::Router) handed a packet to a local route group.
    #[inline]
    fn router_packet_consumed(&self) {}

    /// The [`Router`](crate::router::Router) could not do anything with a received packet.
    #[inline]
    fn router_packet_dropped(&self) {}

    /// The rule garbage collector removed `amount` timed out rules.
    #[inline]
    fn router_rules_collected(&self, _amount: usize) {}

    /// A visor which is not a trusted setup node tried to push rules.
    #[inline]
    fn router_untrusted_setup_connection(&self) {}

    /// The [`SetupNode`](crate::setup::SetupNode) set up a route group.
    #[inline]
    fn setup_route_group_dialed(&self, _duration: Duration) {}

    /// The [`SetupNode`](crate::setup::SetupNode) failed to set up a route group.
    #[inline]
    fn setup_route_group_failed(&self) {}
}

/// A [`Metrics`] implementation which doesn't record anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMetrics;

impl Metrics for NoMetrics {}
