//! hermes-gateway — the Hermes API gateway.
//!
//! Requests are matched against an ordered table of path-prefix routes.
//! The matched route's load balancer picks one of its targets (or the
//! owning service's endpoint when the route lists none) and the request
//! is forwarded there with `X-Forwarded-*` headers.
//!
//! # Architecture
//!
//! ```text
//! RouteStore ──RouteSync::sync──▶ Gateway (RwLock<Vec<RouteEntry>>)
//!                                   │
//! axum fallback ──▶ Gateway::forward ├── select → LoadBalancer::next_target
//!                                   └── hyper client → upstream
//! ```

pub mod dispatcher;
pub mod error;
pub mod load_balancer;
pub mod sync;

pub use dispatcher::{Gateway, GatewayRoute, Selection, gateway_router};
pub use error::{GatewayError, GatewayResult};
pub use load_balancer::{
    LeastConnectionsBalancer, LoadBalancer, NoTargets, RandomBalancer, RoundRobinBalancer,
    new_load_balancer,
};
pub use sync::{RouteSync, SyncStats};
