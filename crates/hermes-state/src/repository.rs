//! Repository traits the registry, health, and gateway layers are
//! written against.
//!
//! Every method is one atomic unit from the caller's point of view.
//! Absence is reported as [`StateError::NotFound`](crate::StateError::NotFound)
//! rather than folded into a generic failure, and unique-key collisions
//! as [`StateError::Conflict`](crate::StateError::Conflict).

use async_trait::async_trait;

use crate::error::StateResult;
use crate::types::*;

/// Persistence for services, their versions, and dependency edges.
#[async_trait]
pub trait ServiceStore: Send + Sync {
    /// Insert a new service. Fails with `Conflict` if the ID or name is taken.
    async fn create_service(&self, service: &Service) -> StateResult<()>;

    async fn get_service(&self, id: &str) -> StateResult<Service>;

    async fn get_service_by_name(&self, name: &str) -> StateResult<Service>;

    async fn list_services(&self, query: &ServiceQuery) -> StateResult<Page<Service>>;

    /// Services matching every filter except the dependency and version
    /// options, which the registry applies on top.
    async fn search_services(&self, query: &DiscoveryQuery) -> StateResult<Vec<Service>>;

    /// Replace a stored service. Fails with `Conflict` if a rename collides.
    async fn update_service(&self, service: &Service) -> StateResult<()>;

    /// Delete a service together with its versions, dependency edges
    /// (both directions), health checks, custom metrics, and thresholds.
    /// History is kept.
    async fn delete_service(&self, id: &str) -> StateResult<()>;

    async fn update_service_status(&self, id: &str, status: ServiceStatus) -> StateResult<()>;

    async fn update_last_seen(&self, id: &str) -> StateResult<()>;

    // Versions

    /// Insert a version. When `version.is_active` is set, every sibling is
    /// deactivated in the same transaction.
    async fn create_version(&self, version: &ServiceVersion) -> StateResult<ServiceVersion>;

    async fn get_version(&self, service_id: &str, version: &str) -> StateResult<ServiceVersion>;

    async fn list_versions(&self, service_id: &str) -> StateResult<Vec<ServiceVersion>>;

    /// Mark one version active and all of its siblings inactive.
    async fn activate_version(&self, service_id: &str, version: &str) -> StateResult<()>;

    // Dependencies

    /// Insert an edge. Fails with `Conflict` if the ordered pair exists.
    async fn add_dependency(&self, dependency: &ServiceDependency)
    -> StateResult<ServiceDependency>;

    /// Outgoing edges of `service_id`.
    async fn list_dependencies(&self, service_id: &str) -> StateResult<Vec<ServiceDependency>>;

    /// Incoming edges of `dependency_id`.
    async fn list_dependents(&self, dependency_id: &str) -> StateResult<Vec<ServiceDependency>>;

    async fn remove_dependency(&self, service_id: &str, dependency_id: &str) -> StateResult<()>;
}

/// Persistence for health checks, history, custom metrics, and thresholds.
#[async_trait]
pub trait HealthStore: Send + Sync {
    async fn create_check(&self, check: &HealthCheck) -> StateResult<HealthCheck>;

    async fn get_check(&self, id: CheckId) -> StateResult<HealthCheck>;

    async fn list_checks(&self, service_id: &str) -> StateResult<Vec<HealthCheck>>;

    async fn update_check(&self, check: &HealthCheck) -> StateResult<()>;

    async fn delete_check(&self, id: CheckId) -> StateResult<()>;

    /// Every enabled `ACTIVE` check, across all services.
    async fn list_enabled_active_checks(&self) -> StateResult<Vec<HealthCheck>>;

    /// Add one to the check's failure counter and return the updated check.
    async fn increment_check_failures(&self, id: CheckId) -> StateResult<HealthCheck>;

    async fn reset_check_failures(&self, id: CheckId) -> StateResult<()>;

    /// Append a history row; the store assigns its ID.
    async fn record_history(&self, entry: &HealthHistory) -> StateResult<HealthHistory>;

    /// Newest-first history for a service.
    async fn list_history(
        &self,
        service_id: &str,
        query: &HistoryQuery,
    ) -> StateResult<Page<HealthHistory>>;

    /// Insert or replace the metric identified by (service, name).
    async fn upsert_metric(&self, metric: &CustomHealthMetric) -> StateResult<CustomHealthMetric>;

    async fn list_metrics(&self, service_id: &str) -> StateResult<Vec<CustomHealthMetric>>;

    async fn delete_metric(&self, service_id: &str, name: &str) -> StateResult<()>;

    async fn create_threshold(&self, threshold: &HealthThreshold) -> StateResult<HealthThreshold>;

    async fn get_threshold(&self, id: u64) -> StateResult<HealthThreshold>;

    async fn list_thresholds(&self, service_id: &str) -> StateResult<Vec<HealthThreshold>>;

    async fn update_threshold(&self, threshold: &HealthThreshold) -> StateResult<()>;

    async fn delete_threshold(&self, id: u64) -> StateResult<()>;
}

/// Persistence for gateway routes and load balancer configs.
#[async_trait]
pub trait RouteStore: Send + Sync {
    /// Insert or replace. The store assigns `seq` on first insert.
    async fn put_route(&self, route: &Route) -> StateResult<()>;

    async fn get_route(&self, id: &str) -> StateResult<Route>;

    /// Routes in the order they were first stored. Overwriting a route
    /// keeps its position.
    async fn list_routes(&self) -> StateResult<Vec<Route>>;

    async fn delete_route(&self, id: &str) -> StateResult<()>;

    async fn put_load_balancer(&self, config: &LoadBalancerConfig) -> StateResult<()>;

    async fn get_load_balancer(&self, id: &str) -> StateResult<LoadBalancerConfig>;

    async fn list_load_balancers(&self) -> StateResult<Vec<LoadBalancerConfig>>;
}
