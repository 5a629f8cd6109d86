use core::fmt;
use std::collections::{HashMap, VecDeque};

use futures::{stream::FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{rules::IdSource, Error};
use crate::{
    crypto::PublicKey,
    network::Dialer,
    router::{close_all, make_map, RouterClient},
    routing::{Hop, RouteId},
};

/// Reserves route ids on every router along a set of paths.
///
/// The amount of ids needed from every visor follows from the paths: a visor needs an id for
/// every hop arriving at it, and the first visor of a path needs one more for the first hop.
pub struct IdReserver {
    total: usize,
    rec: HashMap<PublicKey, u8>,
    clients: HashMap<PublicKey, RouterClient>,
    ids: HashMap<PublicKey, VecDeque<RouteId>>,
}

impl IdReserver {
    /// Dial the routers of every visor on the paths. Empty paths are ignored.
    pub async fn new(
        cancel: &CancellationToken,
        dialer: &dyn Dialer,
        paths: &[&[Hop]],
    ) -> Result<Self, Error> {
        let mut total = 0;
        let mut rec = HashMap::<PublicKey, usize>::new();
        for hops in paths {
            let Some(first) = hops.first() else {
                continue;
            };
            *rec.entry(first.from).or_default() += 1;
            for hop in hops.iter() {
                *rec.entry(hop.to).or_default() += 1;
            }
            total += hops.len() + 1;
        }

        let rec = rec
            .into_iter()
            .map(|(pk, n)| u8::try_from(n).map(|n| (pk, n)).map_err(|_| Error::TooManyIds(pk)))
            .collect::<Result<HashMap<_, _>, _>>()?;

        let pks: Vec<_> = rec.keys().copied().collect();
        let clients = make_map(cancel, dialer, &pks)
            .await
            .map_err(|e| Error::Reserve {
                pk: e.pk,
                source: e.source,
            })?;

        Ok(Self {
            total,
            rec,
            clients,
            ids: HashMap::with_capacity(pks.len()),
        })
    }

    /// Reserve the ids on all routers concurrently. The first failure aborts the other
    /// reservations, and closes the connections to all routers.
    pub async fn reserve_ids(&mut self, cancel: &CancellationToken) -> Result<(), Error> {
        let cancel = cancel.child_token();
        let mut reservations = self
            .rec
            .iter()
            .map(|(&pk, &n)| {
                let client = self.clients.get(&pk);
                let cancel = &cancel;
                async move {
                    let Some(client) = client else {
                        return Err(Error::NoClient(pk));
                    };
                    client
                        .reserve_ids(cancel, n)
                        .await
                        .map(|ids| (pk, ids))
                        .map_err(|source| Error::Reserve { pk, source })
                }
            })
            .collect::<FuturesUnordered<_>>();

        let mut reserved = Vec::with_capacity(self.rec.len());
        let mut first_err = None;
        while let Some(res) = reservations.next().await {
            match res {
                Ok(ids) => reserved.push(ids),
                Err(e) => {
                    if first_err.is_none() {
                        debug!(err = %e, "Failed to reserve route ids");
                        cancel.cancel();
                        first_err = Some(e);
                    }
                }
            }
        }
        drop(reservations);

        if let Some(err) = first_err {
            close_all(&self.clients).await;
            return Err(err);
        }

        self.ids
            .extend(reserved.into_iter().map(|(pk, ids)| (pk, ids.into())));
        Ok(())
    }

    /// Take the next reserved id of the given visor.
    pub fn pop_id(&mut self, pk: &PublicKey) -> Option<RouteId> {
        self.ids.get_mut(pk)?.pop_front()
    }

    /// The total amount of ids reserved over all routers.
    pub fn total_ids(&self) -> usize {
        self.total
    }

    /// The client connected to the router of the given visor.
    pub fn client(&self, pk: &PublicKey) -> Option<&RouterClient> {
        self.clients.get(pk)
    }

    /// Close the connections to all routers.
    pub async fn close(&self) {
        close_all(&self.clients).await;
    }
}

impl IdSource for IdReserver {
    fn pop_id(&mut self, pk: &PublicKey) -> Option<RouteId> {
        IdReserver::pop_id(self, pk)
    }
}

impl fmt::Display for IdReserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (pk, ids) in &self.ids {
            map.entry(&pk.to_string(), ids);
        }
        map.finish()
    }
}
