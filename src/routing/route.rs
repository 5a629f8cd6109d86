//! Routes as paths of hops between visors, and the rules installed for them.

use core::fmt;
use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

use super::{descriptor::RouteDescriptor, rule::Rule};
use crate::{crypto::PublicKey, transport::TransportId};

/// A single transport level link between two visors, as part of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hop {
    pub tp_id: TransportId,
    pub from: PublicKey,
    pub to: PublicKey,
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} @ {}", self.from, self.to, self.tp_id)
    }
}

/// An ordered list of hops, leading from a source visor to a destination visor.
pub type Path = Vec<Hop>;

/// The (source, destination) visors a path must connect.
pub type PathEdges = [PublicKey; 2];

/// A single direction of a route group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub desc: RouteDescriptor,
    pub hops: Path,
    pub keep_alive: Duration,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[KeepAlive: {:?}] {}", self.keep_alive, self.desc)?;
        for (i, hop) in self.hops.iter().enumerate() {
            write!(f, "\n\t{}: {}", i, hop)?;
        }
        Ok(())
    }
}

/// Both directions of a route group, as requested from a setup node.
///
/// The descriptor is expressed from the point of view of the initiator: its source is the
/// initiator, its destination the responder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidirectionalRoute {
    pub desc: RouteDescriptor,
    pub keep_alive: Duration,
    pub forward: Path,
    pub reverse: Path,
}

/// Reasons a [`BidirectionalRoute`] is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("bidirectional route does not have forward hops")]
    NoForwardHops,
    #[error("bidirectional route does not have reverse hops")]
    NoReverseHops,
    #[error("bidirectional route has an invalid route descriptor")]
    InvalidDesc,
}

impl BidirectionalRoute {
    /// Split into the forward [`Route`] and the reverse [`Route`]. The reverse route is described
    /// by the inverted descriptor.
    pub fn forward_and_reverse(&self) -> (Route, Route) {
        let forward = Route {
            desc: self.desc,
            hops: self.forward.clone(),
            keep_alive: self.keep_alive,
        };
        let reverse = Route {
            desc: self.desc.invert(),
            hops: self.reverse.clone(),
            keep_alive: self.keep_alive,
        };
        (forward, reverse)
    }

    /// Check that both directions have hops, and that the hops actually connect the ends of the
    /// descriptor.
    pub fn check(&self) -> Result<(), RouteError> {
        let (Some(fwd_first), Some(fwd_last)) = (self.forward.first(), self.forward.last()) else {
            return Err(RouteError::NoForwardHops);
        };
        let (Some(rev_first), Some(rev_last)) = (self.reverse.first(), self.reverse.last()) else {
            return Err(RouteError::NoReverseHops);
        };

        let src = self.desc.src_pk();
        let dst = self.desc.dst_pk();
        if src != fwd_first.from || src != rev_last.to {
            return Err(RouteError::InvalidDesc);
        }
        if dst != rev_first.from || dst != fwd_last.to {
            return Err(RouteError::InvalidDesc);
        }

        Ok(())
    }
}

impl fmt::Display for BidirectionalRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (fwd, rev) = self.forward_and_reverse();
        write!(f, "FWD: {}\nREV: {}", fwd, rev)
    }
}

/// The rules installed at one edge of a route group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRules {
    pub desc: RouteDescriptor,
    pub forward: Rule,
    pub reverse: Rule,
}

impl fmt::Display for EdgeRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EdgeRules{{desc: {}, forward: {}, reverse: {}}}",
            self.desc, self.forward, self.reverse
        )
    }
}

/// Rules to install, per visor.
pub type RulesMap = HashMap<PublicKey, Vec<Rule>>;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{BidirectionalRoute, Hop, RouteError};
    use crate::{crypto::PublicKey, routing::RouteDescriptor, transport::TransportId};

    fn pk(b: u8) -> PublicKey {
        PublicKey::from([b; 32])
    }

    fn hop(from: PublicKey, to: PublicKey) -> Hop {
        Hop {
            tp_id: TransportId::new_random(),
            from,
            to,
        }
    }

    fn route(a: PublicKey, b: PublicKey, c: PublicKey) -> BidirectionalRoute {
        BidirectionalRoute {
            desc: RouteDescriptor::new(a, c, 1, 2),
            keep_alive: Duration::from_secs(30),
            forward: vec![hop(a, b), hop(b, c)],
            reverse: vec![hop(c, b), hop(b, a)],
        }
    }

    #[test]
    fn valid_route_passes_check() {
        assert_eq!(route(pk(1), pk(2), pk(3)).check(), Ok(()));
    }

    #[test]
    fn check_rejects_empty_paths() {
        let mut r = route(pk(1), pk(2), pk(3));
        r.forward.clear();
        assert_eq!(r.check(), Err(RouteError::NoForwardHops));

        let mut r = route(pk(1), pk(2), pk(3));
        r.reverse.clear();
        assert_eq!(r.check(), Err(RouteError::NoReverseHops));
    }

    #[test]
    fn check_rejects_mismatched_descriptor() {
        let mut r = route(pk(1), pk(2), pk(3));
        r.desc = RouteDescriptor::new(pk(9), pk(3), 1, 2);
        assert_eq!(r.check(), Err(RouteError::InvalidDesc));

        let mut r = route(pk(1), pk(2), pk(3));
        r.desc = RouteDescriptor::new(pk(1), pk(2), 1, 2);
        assert_eq!(r.check(), Err(RouteError::InvalidDesc));
    }

    #[test]
    fn reverse_route_uses_inverted_descriptor() {
        let r = route(pk(1), pk(2), pk(3));
        let (fwd, rev) = r.forward_and_reverse();
        assert_eq!(fwd.desc, r.desc);
        assert_eq!(rev.desc, r.desc.invert());
        assert_eq!(fwd.hops, r.forward);
        assert_eq!(rev.hops, r.reverse);
    }
}
