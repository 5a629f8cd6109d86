use std::collections::HashMap;

use tracing::trace;

use super::Error;
use crate::{
    crypto::PublicKey,
    routing::{Route, RouteId, Rule, RulesMap},
};

/// A source of reserved route ids, per visor.
pub trait IdSource {
    /// Take the next reserved id of the given visor.
    fn pop_id(&mut self, pk: &PublicKey) -> Option<RouteId>;
}

/// The rules for every visor on a set of routes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GeneratedRules {
    /// Forward rule of the first visor of every route.
    pub forward: HashMap<PublicKey, Rule>,
    /// Consume rule of the last visor of every route.
    pub consume: HashMap<PublicKey, Rule>,
    /// Rules for the transit visors of every route.
    pub intermediary: RulesMap,
}

/// Generate the rules for the given routes.
///
/// Every hop of a route is keyed by an id of the visor it starts at, and points to an id of the
/// visor it ends at. The first hop gets a forward rule, the other hops intermediary rules, and the
/// destination gets a consume rule keyed by the id the last hop points to. Ids are drawn from one
/// pool per visor, so a visor on several routes uses distinct ids for each of them.
pub fn generate_rules<S>(ids: &mut S, routes: &[Route]) -> Result<GeneratedRules, Error>
where
    S: IdSource + ?Sized,
{
    let mut rules = GeneratedRules::default();

    for route in routes {
        let Some(first) = route.hops.first() else {
            continue;
        };
        let mut rid = ids.pop_id(&first.from).ok_or(Error::NoKey(first.from))?;

        for (i, hop) in route.hops.iter().enumerate() {
            let next_rid = ids.pop_id(&hop.to).ok_or(Error::NoKey(hop.to))?;

            if i == 0 {
                let rule = Rule::forward(route.keep_alive, rid, next_rid, hop.tp_id, route.desc);
                trace!(visor = %hop.from, %rule, "Generated forward rule");
                rules.forward.insert(hop.from, rule);
            } else {
                let rule = Rule::intermediary(route.keep_alive, rid, next_rid, hop.tp_id);
                trace!(visor = %hop.from, %rule, "Generated intermediary rule");
                rules.intermediary.entry(hop.from).or_default().push(rule);
            }

            rid = next_rid;
        }

        let rule = Rule::consume(route.keep_alive, rid, route.desc);
        trace!(visor = %route.desc.dst_pk(), %rule, "Generated consume rule");
        rules.consume.insert(route.desc.dst_pk(), rule);
    }

    Ok(rules)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, VecDeque},
        time::Duration,
    };

    use super::{generate_rules, IdSource};
    use crate::{
        crypto::PublicKey,
        routing::{BidirectionalRoute, Hop, RouteDescriptor, RouteId, RuleKind},
        setup::Error,
        transport::TransportId,
    };

    struct FixedIds(HashMap<PublicKey, VecDeque<RouteId>>);

    impl IdSource for FixedIds {
        fn pop_id(&mut self, pk: &PublicKey) -> Option<RouteId> {
            self.0.get_mut(pk)?.pop_front()
        }
    }

    fn pk(n: u8) -> PublicKey {
        PublicKey::from([n; 32])
    }

    /// A -> B -> C and back.
    fn route(ab: TransportId, bc: TransportId) -> BidirectionalRoute {
        let (a, b, c) = (pk(1), pk(2), pk(3));
        BidirectionalRoute {
            desc: RouteDescriptor::new(a, c, 1, 2),
            keep_alive: Duration::from_secs(30),
            forward: vec![
                Hop { tp_id: ab, from: a, to: b },
                Hop { tp_id: bc, from: b, to: c },
            ],
            reverse: vec![
                Hop { tp_id: bc, from: c, to: b },
                Hop { tp_id: ab, from: b, to: a },
            ],
        }
    }

    fn ids(base: u32) -> VecDeque<RouteId> {
        [base, base + 1].into_iter().map(RouteId::new).collect()
    }

    #[test]
    fn rules_for_two_hop_route() {
        let (ab, bc) = (TransportId::new_random(), TransportId::new_random());
        let route = route(ab, bc);
        let (fwd, rev) = route.forward_and_reverse();
        let mut pool = FixedIds(HashMap::from([
            (pk(1), ids(10)),
            (pk(2), ids(20)),
            (pk(3), ids(30)),
        ]));

        let rules = generate_rules(&mut pool, &[fwd, rev]).expect("Enough ids are reserved");

        // Forward direction: A(10) -> B(20) -> C(30).
        let a_fwd = rules.forward[&pk(1)];
        assert_eq!(a_fwd.key_route_id(), RouteId::new(10));
        assert_eq!(a_fwd.next_route_id(), Ok(RouteId::new(20)));
        assert_eq!(a_fwd.next_transport_id(), Ok(ab));
        assert_eq!(a_fwd.route_descriptor(), Ok(route.desc));
        let c_consume = rules.consume[&pk(3)];
        assert_eq!(c_consume.key_route_id(), RouteId::new(30));
        assert_eq!(c_consume.route_descriptor(), Ok(route.desc));

        // Reverse direction: C(31) -> B(21) -> A(11).
        let c_fwd = rules.forward[&pk(3)];
        assert_eq!(c_fwd.key_route_id(), RouteId::new(31));
        assert_eq!(c_fwd.next_route_id(), Ok(RouteId::new(21)));
        assert_eq!(c_fwd.route_descriptor(), Ok(route.desc.invert()));
        let a_consume = rules.consume[&pk(1)];
        assert_eq!(a_consume.key_route_id(), RouteId::new(11));
        assert_eq!(a_consume.route_descriptor(), Ok(route.desc.invert()));

        // B relays both directions.
        let b_rules = &rules.intermediary[&pk(2)];
        assert_eq!(b_rules.len(), 2);
        assert!(b_rules
            .iter()
            .all(|rule| matches!(rule.kind(), RuleKind::Intermediary { .. })));
        assert_eq!(b_rules[0].key_route_id(), RouteId::new(20));
        assert_eq!(b_rules[0].next_route_id(), Ok(RouteId::new(30)));
        assert_eq!(b_rules[0].next_transport_id(), Ok(bc));
        assert_eq!(b_rules[1].key_route_id(), RouteId::new(21));
        assert_eq!(b_rules[1].next_route_id(), Ok(RouteId::new(11)));
        assert_eq!(b_rules[1].next_transport_id(), Ok(ab));

        assert!(!rules.intermediary.contains_key(&pk(1)));
        assert!(!rules.intermediary.contains_key(&pk(3)));
    }

    #[test]
    fn missing_ids() {
        let route = route(TransportId::new_random(), TransportId::new_random());
        let (fwd, _) = route.forward_and_reverse();
        let mut pool = FixedIds(HashMap::from([(pk(1), ids(10)), (pk(2), ids(20))]));

        let err = generate_rules(&mut pool, &[fwd]).expect_err("C has no ids");
        assert!(matches!(err, Error::NoKey(visor) if visor == pk(3)));
    }
}
