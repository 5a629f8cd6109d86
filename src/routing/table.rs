//! The routing table of a visor.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use tokio::time::Instant;
use tracing::trace;

use super::{
    descriptor::{RouteDescriptor, RouteId},
    rule::{Rule, RuleType},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("no available routeIDs")]
    NoAvailableRoutes,
    #[error("rule with route ID {0} not found")]
    RuleNotFound(RouteId),
    #[error("rule with route ID {0} keep alive timeout exceeded")]
    RuleTimedOut(RouteId),
}

struct Entry {
    rule: Rule,
    last_activity: Instant,
}

impl Entry {
    fn timed_out(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) > self.rule.keep_alive()
    }
}

struct TableInner {
    next_id: u32,
    rules: HashMap<RouteId, Entry>,
}

/// Rules of a visor, keyed by [`RouteId`].
///
/// Every rule has an activity timestamp. A rule which saw no activity for longer than its keep
/// alive is timed out, and is no longer handed out. Timed out rules are removed by
/// [`RoutingTable::collect_garbage`].
///
/// Cloning a `RoutingTable` gives a handle to the same table.
#[derive(Clone)]
pub struct RoutingTable {
    inner: Arc<RwLock<TableInner>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(TableInner {
                next_id: 0,
                rules: HashMap::new(),
            })),
        }
    }

    /// Reserve `n` route ids which have never been handed out before.
    pub fn reserve_keys(&self, n: usize) -> Result<Vec<RouteId>, TableError> {
        let mut inner = self.inner.write().unwrap();

        if inner.next_id as u64 + n as u64 >= u32::MAX as u64 {
            return Err(TableError::NoAvailableRoutes);
        }

        let first = inner.next_id + 1;
        inner.next_id += n as u32;
        Ok((first..=inner.next_id).map(RouteId::new).collect())
    }

    /// Store a rule under its key, replacing any rule already stored there. The rule starts out
    /// active.
    pub fn save_rule(&self, rule: Rule) {
        trace!(route_id = %rule.key_route_id(), %rule, "Saving rule");
        self.inner.write().unwrap().rules.insert(
            rule.key_route_id(),
            Entry {
                rule,
                last_activity: Instant::now(),
            },
        );
    }

    /// Get the rule stored under `id`. Timed out rules are not returned.
    ///
    /// Looking up a consume rule counts as activity on that rule.
    pub fn rule(&self, id: RouteId) -> Result<Rule, TableError> {
        let now = Instant::now();
        let mut inner = self.inner.write().unwrap();
        let entry = inner
            .rules
            .get_mut(&id)
            .ok_or(TableError::RuleNotFound(id))?;

        if entry.timed_out(now) {
            return Err(TableError::RuleTimedOut(id));
        }

        if entry.rule.rule_type() == RuleType::Consume {
            entry.last_activity = now;
        }

        Ok(entry.rule)
    }

    /// Mark the rule stored under `id` as active.
    pub fn update_activity(&self, id: RouteId) -> Result<(), TableError> {
        let now = Instant::now();
        let mut inner = self.inner.write().unwrap();
        let entry = inner
            .rules
            .get_mut(&id)
            .ok_or(TableError::RuleNotFound(id))?;

        if entry.timed_out(now) {
            return Err(TableError::RuleTimedOut(id));
        }

        entry.last_activity = now;

        Ok(())
    }

    /// All rules which are not timed out.
    pub fn all_rules(&self) -> Vec<Rule> {
        let now = Instant::now();
        self.inner
            .read()
            .unwrap()
            .rules
            .values()
            .filter(|entry| !entry.timed_out(now))
            .map(|entry| entry.rule)
            .collect()
    }

    /// All rules which are not timed out and belong to the route group identified by `desc`.
    pub fn rules_with_desc(&self, desc: &RouteDescriptor) -> Vec<Rule> {
        let now = Instant::now();
        self.inner
            .read()
            .unwrap()
            .rules
            .values()
            .filter(|entry| !entry.timed_out(now))
            .filter(|entry| entry.rule.route_descriptor().ok().as_ref() == Some(desc))
            .map(|entry| entry.rule)
            .collect()
    }

    /// Remove the rules stored under the given ids. Missing ids are ignored.
    pub fn del_rules(&self, ids: &[RouteId]) {
        let mut inner = self.inner.write().unwrap();
        for id in ids {
            inner.rules.remove(id);
        }
    }

    /// Remove all timed out rules, returning them.
    pub fn collect_garbage(&self) -> Vec<Rule> {
        let now = Instant::now();
        let mut removed = Vec::new();
        self.inner.write().unwrap().rules.retain(|_, entry| {
            if entry.timed_out(now) {
                removed.push(entry.rule);
                false
            } else {
                true
            }
        });
        removed
    }

    /// Amount of rules in the table, including ones which are timed out but not yet collected.
    pub fn count(&self) -> usize {
        self.inner.read().unwrap().rules.len()
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}
