use async_trait::async_trait;
use tracing::{debug, warn};

use super::Router;
use crate::{
    metrics::Metrics,
    rpc::{Failure, FailureCode, Handler, Request, Response},
};

/// Rpc entry point of a [`Router`] for trusted setup nodes.
pub(super) struct RouterGateway<M> {
    router: Router<M>,
}

impl<M> RouterGateway<M> {
    pub fn new(router: Router<M>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl<M> Handler for RouterGateway<M>
where
    M: Metrics + Clone + Send + Sync + 'static,
{
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::AddEdgeRules(rules) => {
                debug!(rules = %rules, "Received edge rules");
                match self.router.introduce_rules(rules).await {
                    Ok(()) => Response::Ok(true),
                    Err(e) => {
                        warn!(err = %e, "Failed to introduce edge rules");
                        Response::Failure(Failure::new(FailureCode::AddRules, e))
                    }
                }
            }
            Request::AddIntermediaryRules(rules) => {
                debug!(count = rules.len(), "Received intermediary rules");
                self.router.save_routing_rules(&rules);
                Response::Ok(true)
            }
            Request::ReserveIds(n) => match self.router.reserve_keys(n as usize) {
                Ok(ids) => Response::RouteIds(ids),
                Err(e) => {
                    warn!(n, err = %e, "Failed to reserve route ids");
                    Response::Failure(Failure::new(FailureCode::ReserveIds, e))
                }
            },
            Request::DialRouteGroup(_) => Response::Failure(Failure::new(
                FailureCode::BadRequest,
                "routers don't dial route groups for others",
            )),
        }
    }
}
