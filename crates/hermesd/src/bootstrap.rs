//! Start-up registration of the services and routes declared in the
//! config file. Entries that already exist are left alone, so restarting
//! with the same file is a no-op.

use anyhow::Context;
use tracing::{debug, info};
use uuid::Uuid;

use hermes_health::HealthService;
use hermes_registry::ServiceRegistry;
use hermes_state::{
    HealthCheckRequest, HealthCheckType, LoadBalancerConfig, LoadBalancerType, Route, RouteStore,
    ServiceRegistration, epoch_millis,
};

use crate::config::{HealthCheckConfig, HermesConfig, RouteConfig, ServiceConfig, parse_duration};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BootstrapStats {
    pub services_registered: u32,
    pub checks_created: u32,
    pub routes_created: u32,
    pub skipped: u32,
}

pub async fn bootstrap(
    config: &HermesConfig,
    registry: &ServiceRegistry,
    health: &HealthService,
    routes: &dyn RouteStore,
) -> anyhow::Result<BootstrapStats> {
    let mut stats = BootstrapStats::default();

    for entry in &config.services {
        match registry.get_by_name(&entry.name).await {
            Ok(existing) => {
                debug!(name = %entry.name, service_id = %existing.id, "service already registered");
                stats.skipped += 1;
                continue;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e).context(format!("failed to look up service {}", entry.name)),
        }

        let service = registry
            .register(registration(entry))
            .await
            .with_context(|| format!("failed to register service {}", entry.name))?;
        stats.services_registered += 1;

        if let Some(check) = &entry.health_check {
            health
                .create_check(&service.id, check_request(entry, check))
                .await
                .with_context(|| format!("failed to create health check for {}", entry.name))?;
            stats.checks_created += 1;
        }
    }

    let existing = routes.list_routes().await.context("failed to list routes")?;
    for entry in &config.routes {
        if existing.iter().any(|r| r.path == entry.path) {
            debug!(path = %entry.path, "route already exists");
            stats.skipped += 1;
            continue;
        }

        let service = registry
            .get_by_name(&entry.service)
            .await
            .with_context(|| format!("route {} refers to unknown service {}", entry.path, entry.service))?;

        let load_balancer_id = match entry.load_balancer {
            LoadBalancerType::RoundRobin => None,
            kind => Some(ensure_load_balancer(routes, kind).await?),
        };

        let now = epoch_millis();
        let route = new_route(entry, service.id, load_balancer_id, now);
        routes
            .put_route(&route)
            .await
            .with_context(|| format!("failed to store route {}", entry.path))?;
        stats.routes_created += 1;
    }

    info!(
        services = stats.services_registered,
        checks = stats.checks_created,
        routes = stats.routes_created,
        skipped = stats.skipped,
        "bootstrap complete"
    );
    Ok(stats)
}

fn registration(entry: &ServiceConfig) -> ServiceRegistration {
    ServiceRegistration {
        name: entry.name.clone(),
        description: entry.description.clone(),
        endpoint: entry.endpoint.clone(),
        service_type: entry.service_type.clone(),
        metadata: entry.metadata.clone(),
        tags: entry.tags.clone(),
        registered_by: "hermesd".to_string(),
    }
}

fn check_request(service: &ServiceConfig, check: &HealthCheckConfig) -> HealthCheckRequest {
    let secs = |value: &Option<String>| {
        value
            .as_deref()
            .and_then(parse_duration)
            .map(|d| i64::try_from(d.as_secs().max(1)).unwrap_or(i64::MAX))
            .unwrap_or(0)
    };
    HealthCheckRequest {
        name: check.name.clone().unwrap_or_else(|| format!("{}-http", service.name)),
        check_type: Some(HealthCheckType::Active),
        endpoint: check_url(&service.endpoint, &check.endpoint),
        interval: secs(&check.interval),
        timeout: secs(&check.timeout),
        method: check.method.clone().unwrap_or_default(),
        expected_status: check.expected_status.unwrap_or(200),
        headers: Some(check.headers.clone()),
        threshold_count: check.threshold_count.unwrap_or(0),
        ..HealthCheckRequest::default()
    }
}

/// Absolute URLs are used as given; anything else is a path on the
/// service endpoint.
fn check_url(service_endpoint: &str, check_endpoint: &str) -> String {
    if check_endpoint.starts_with("http://") || check_endpoint.starts_with("https://") {
        return check_endpoint.to_string();
    }
    let base = service_endpoint.trim_end_matches('/');
    match check_endpoint {
        "" => format!("{base}/health"),
        path if path.starts_with('/') => format!("{base}{path}"),
        path => format!("{base}/{path}"),
    }
}

/// One shared config per strategy, keyed by its type.
async fn ensure_load_balancer(
    routes: &dyn RouteStore,
    kind: LoadBalancerType,
) -> anyhow::Result<String> {
    let id = format!("lb-{kind}");
    match routes.get_load_balancer(&id).await {
        Ok(_) => return Ok(id),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e).context(format!("failed to look up load balancer {id}")),
    }

    let now = epoch_millis();
    routes
        .put_load_balancer(&LoadBalancerConfig {
            id: id.clone(),
            name: kind.to_string(),
            kind,
            created_at: now,
            updated_at: now,
        })
        .await
        .with_context(|| format!("failed to store load balancer {id}"))?;
    Ok(id)
}

fn new_route(
    entry: &RouteConfig,
    service_id: String,
    load_balancer_id: Option<String>,
    now: u64,
) -> Route {
    Route {
        id: format!("route-{}", Uuid::new_v4().simple()),
        path: entry.path.clone(),
        description: entry.description.clone(),
        service_id,
        load_balancer_id,
        targets: entry.targets.clone(),
        active: true,
        headers: entry.headers.clone(),
        seq: 0,
        created_at: now,
        updated_at: now,
    }
}
