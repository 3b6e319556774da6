//! Route synchronization: rebuilds the gateway table from the state store.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use hermes_state::{LoadBalancerType, RouteStore};

use crate::dispatcher::{Gateway, GatewayRoute};
use crate::error::GatewayResult;

/// Outcome of one [`RouteSync::sync`] pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncStats {
    pub routes_synced: u32,
    pub routes_inactive: u32,
    /// Routes whose `load_balancer_id` names no stored config; they fall
    /// back to round-robin.
    pub missing_balancers: u32,
}

/// Bridges the route store to a [`Gateway`].
pub struct RouteSync {
    gateway: Arc<Gateway>,
}

impl RouteSync {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Full rebuild: every active route, in creation order, with the
    /// strategy of its load balancer config.
    pub async fn sync(&self, store: &dyn RouteStore) -> GatewayResult<SyncStats> {
        let kinds: HashMap<String, LoadBalancerType> = store
            .list_load_balancers()
            .await?
            .into_iter()
            .map(|lb| (lb.id, lb.kind))
            .collect();

        let mut stats = SyncStats::default();
        let mut table = Vec::new();
        for route in store.list_routes().await? {
            if !route.active {
                stats.routes_inactive += 1;
                continue;
            }
            let balancer = match route.load_balancer_id.as_deref() {
                None | Some("") => LoadBalancerType::RoundRobin,
                Some(id) => match kinds.get(id) {
                    Some(kind) => *kind,
                    None => {
                        warn!(route_id = %route.id, load_balancer_id = id, "load balancer config not found, using round-robin");
                        stats.missing_balancers += 1;
                        LoadBalancerType::RoundRobin
                    }
                },
            };
            stats.routes_synced += 1;
            table.push(GatewayRoute { route, balancer });
        }

        self.gateway.update_routes(table).await;
        info!(
            routes = stats.routes_synced,
            inactive = stats.routes_inactive,
            missing_balancers = stats.missing_balancers,
            "route sync complete"
        );
        Ok(stats)
    }
}
