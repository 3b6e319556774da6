//! End-to-end scenarios across the registry, health, and gateway crates.
//!
//! Upstreams are throw-away axum servers on 127.0.0.1:0 so probes and
//! proxied requests go over real sockets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use http_body_util::BodyExt;
use tower::ServiceExt;

use hermes_gateway::{Gateway, RouteSync, gateway_router};
use hermes_health::{HealthCheckScheduler, HealthService, HttpProber, Transition};
use hermes_registry::ServiceRegistry;
use hermes_state::*;

struct Harness {
    store: StateStore,
    registry: ServiceRegistry,
    health: Arc<HealthService>,
}

fn harness(store: StateStore) -> Harness {
    let registry = ServiceRegistry::new(Arc::new(store.clone()));
    let health = Arc::new(HealthService::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(HttpProber::new()),
    ));
    Harness {
        store,
        registry,
        health,
    }
}

/// Upstream whose `/healthz` answers 200, or 503 while `failing` is set.
async fn spawn_upstream(name: &'static str, failing: Arc<AtomicBool>) -> SocketAddr {
    let app = Router::new()
        .route(
            "/healthz",
            get(move || {
                let failing = failing.clone();
                async move {
                    if failing.load(Ordering::SeqCst) {
                        StatusCode::SERVICE_UNAVAILABLE
                    } else {
                        StatusCode::OK
                    }
                }
            }),
        )
        .fallback(move || async move { name });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn registration(name: &str, endpoint: &str) -> ServiceRegistration {
    ServiceRegistration {
        name: name.to_string(),
        endpoint: endpoint.to_string(),
        ..Default::default()
    }
}

fn dependency(id: &str) -> DependencyRequest {
    DependencyRequest {
        dependency_id: id.to_string(),
        dependency_type: "REQUIRED".to_string(),
        description: String::new(),
    }
}

#[tokio::test]
async fn registry_and_health_scenario() {
    let h = harness(StateStore::open_in_memory().unwrap());
    let failing = Arc::new(AtomicBool::new(false));
    let upstream = spawn_upstream("s1", failing.clone()).await;

    let s1 = h.registry.register(registration("S1", "http://s1:8080")).await.unwrap();
    let s2 = h.registry.register(registration("S2", "http://s2:8080")).await.unwrap();
    assert_eq!(s1.status, ServiceStatus::Unknown);

    h.registry.add_dependency(&s1.id, dependency(&s2.id)).await.unwrap();
    let err = h
        .registry
        .add_dependency(&s2.id, dependency(&s1.id))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert!(err.to_string().starts_with("circular dependency detected"));

    let check = h
        .health
        .create_check(
            &s1.id,
            HealthCheckRequest {
                name: "s1-http".to_string(),
                check_type: Some(HealthCheckType::Active),
                endpoint: format!("http://{upstream}/healthz"),
                interval: 5,
                timeout: 2,
                expected_status: 200,
                threshold_count: 3,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    failing.store(true, Ordering::SeqCst);
    let mut transitions = Vec::new();
    for _ in 0..3 {
        let outcome = h.health.run_active_check(&check).await.unwrap();
        transitions.push(outcome.transition);
    }
    assert_eq!(
        transitions,
        [
            Transition::Unchanged,
            Transition::Unchanged,
            Transition::ThresholdReached
        ]
    );
    assert_eq!(
        h.registry.get(&s1.id).await.unwrap().status,
        ServiceStatus::Unhealthy
    );
    assert_eq!(h.health.get_check(check.id).await.unwrap().timeout_count, 3);

    failing.store(false, Ordering::SeqCst);
    let outcome = h.health.run_active_check(&check).await.unwrap();
    assert_eq!(outcome.transition, Transition::Recovered);
    assert_eq!(
        h.registry.get(&s1.id).await.unwrap().status,
        ServiceStatus::Healthy
    );
    assert_eq!(h.health.get_check(check.id).await.unwrap().timeout_count, 0);

    let history = h.health.history(&s1.id, &HistoryQuery::default()).await.unwrap();
    assert_eq!(history.total, 4);
    assert_eq!(history.items[0].status, ServiceStatus::Healthy);
    assert!(
        history.items[1..]
            .iter()
            .all(|e| e.status == ServiceStatus::Unhealthy)
    );

    // S2 was never probed or reported.
    assert_eq!(
        h.registry.get(&s2.id).await.unwrap().status,
        ServiceStatus::Unknown
    );
}

#[tokio::test]
async fn duplicate_registration_leaves_first_untouched() {
    let h = harness(StateStore::open_in_memory().unwrap());
    let first = h.registry.register(registration("orders", "http://a:1")).await.unwrap();

    let err = h
        .registry
        .register(registration("orders", "http://b:2"))
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let stored = h.registry.get_by_name("orders").await.unwrap();
    assert_eq!(stored.id, first.id);
    assert_eq!(stored.endpoint, "http://a:1");
    let page = h.registry.list(&ServiceQuery::default()).await.unwrap();
    assert_eq!(page.total, 1);
}

#[tokio::test]
async fn longer_dependency_cycles_are_accepted() {
    let h = harness(StateStore::open_in_memory().unwrap());
    let a = h.registry.register(registration("a", "http://a")).await.unwrap();
    let b = h.registry.register(registration("b", "http://b")).await.unwrap();
    let c = h.registry.register(registration("c", "http://c")).await.unwrap();

    h.registry.add_dependency(&a.id, dependency(&b.id)).await.unwrap();
    h.registry.add_dependency(&b.id, dependency(&c.id)).await.unwrap();
    h.registry.add_dependency(&c.id, dependency(&a.id)).await.unwrap();
    assert_eq!(h.registry.list_dependents(&a.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn scheduler_marks_service_unhealthy_and_back() {
    let h = harness(StateStore::open_in_memory().unwrap());
    let failing = Arc::new(AtomicBool::new(true));
    let upstream = spawn_upstream("s1", failing.clone()).await;
    let s1 = h.registry.register(registration("S1", "http://s1:8080")).await.unwrap();
    h.health
        .create_check(
            &s1.id,
            HealthCheckRequest {
                name: "fast".to_string(),
                endpoint: format!("http://{upstream}/healthz"),
                interval: 1,
                timeout: 1,
                expected_status: 200,
                threshold_count: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let scheduler = HealthCheckScheduler::new(h.health.clone(), Duration::from_secs(60));
    scheduler.start().unwrap();

    // Immediate run plus one tick reaches the threshold of 2.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(
        h.registry.get(&s1.id).await.unwrap().status,
        ServiceStatus::Unhealthy
    );

    failing.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(1200)).await;
    scheduler.stop();
    assert_eq!(
        h.registry.get(&s1.id).await.unwrap().status,
        ServiceStatus::Healthy
    );
}

#[tokio::test]
async fn gateway_routes_to_registered_service_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("hermes.redb");
    let one = spawn_upstream("one", Arc::new(AtomicBool::new(false))).await;
    let two = spawn_upstream("two", Arc::new(AtomicBool::new(false))).await;

    {
        let h = harness(StateStore::open(&db_path).unwrap());
        let svc = h
            .registry
            .register(registration("web", &format!("http://{one}")))
            .await
            .unwrap();
        for (id, path, targets, created_at) in [
            ("r-api", "/api", vec![format!("http://{one}"), format!("http://{two}")], 1),
            ("r-web", "/", Vec::new(), 2),
        ] {
            h.store
                .put_route(&Route {
                    id: id.to_string(),
                    path: path.to_string(),
                    description: String::new(),
                    service_id: svc.id.clone(),
                    load_balancer_id: None,
                    targets,
                    active: true,
                    headers: HashMap::new(),
                    seq: 0,
                    created_at,
                    updated_at: created_at,
                })
                .await
                .unwrap();
        }
    }

    let store = StateStore::open(&db_path).unwrap();
    let gateway = Arc::new(Gateway::new(Arc::new(store.clone())));
    let stats = RouteSync::new(gateway.clone()).sync(&store).await.unwrap();
    assert_eq!(stats.routes_synced, 2);
    let app = gateway_router(gateway);

    let mut bodies = Vec::new();
    for uri in ["/api/a", "/api/b", "/home"] {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = app.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        bodies.push(String::from_utf8(bytes.to_vec()).unwrap());
    }
    // "/api" round-robins; "/" falls back to the service endpoint.
    assert_eq!(bodies, ["one", "two", "one"]);
}
