//! Gateway dispatcher: route matching, target selection, forwarding.
//!
//! The route table is an ordered list behind a read/write lock. A request
//! goes to the first active route whose path is a prefix of the request
//! path, in table order. There is no longest-prefix rule, so a broad
//! prefix placed early shadows narrower ones after it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::uri::{Authority, Scheme, Uri};
use axum::response::{IntoResponse, Response};
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use hermes_state::{LoadBalancerType, Route, ServiceStore};

use crate::error::{GatewayError, GatewayResult};
use crate::load_balancer::{LoadBalancer, new_load_balancer};

/// Default deadline for an upstream to return response headers.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Connection-scoped headers that are not forwarded in either direction.
const HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::UPGRADE,
];

/// A route plus the strategy that picks among its targets.
#[derive(Debug, Clone)]
pub struct GatewayRoute {
    pub route: Route,
    pub balancer: LoadBalancerType,
}

struct RouteEntry {
    route: Route,
    kind: LoadBalancerType,
    /// `None` when `kind` has no implementation.
    balancer: Option<Arc<dyn LoadBalancer>>,
}

/// A chosen target. Dropping it releases the target's slot in the
/// route's balancer.
pub struct Selection {
    pub route: Route,
    pub target: String,
    balancer: Arc<dyn LoadBalancer>,
}

impl Drop for Selection {
    fn drop(&mut self) {
        self.balancer.release(&self.target);
    }
}

/// Path-prefix reverse proxy.
pub struct Gateway {
    routes: RwLock<Vec<RouteEntry>>,
    services: Arc<dyn ServiceStore>,
    client: Client<HttpConnector, Body>,
    upstream_timeout: Duration,
}

impl Gateway {
    pub fn new(services: Arc<dyn ServiceStore>) -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
            services,
            client: Client::builder(TokioExecutor::new()).build_http(),
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
        }
    }

    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    /// Replace the whole route table.
    ///
    /// A route that keeps its id and strategy keeps its balancer state, so
    /// round-robin position and open connection counts survive a refresh.
    pub async fn update_routes(&self, routes: Vec<GatewayRoute>) {
        let mut table = self.routes.write().await;

        let entries: Vec<RouteEntry> = routes
            .into_iter()
            .map(|GatewayRoute { route, balancer: kind }| {
                let existing = table
                    .iter()
                    .find(|e| e.route.id == route.id && e.kind == kind)
                    .and_then(|e| e.balancer.clone());
                let balancer = existing.or_else(|| match new_load_balancer(kind) {
                    Ok(lb) => Some(Arc::from(lb)),
                    Err(e) => {
                        warn!(route_id = %route.id, path = %route.path, error = %e, "route balancer unavailable");
                        None
                    }
                });
                RouteEntry {
                    route,
                    kind,
                    balancer,
                }
            })
            .collect();

        *table = entries;
        info!(routes = table.len(), "gateway routes updated");
    }

    /// Routes currently in the table, in match order.
    pub async fn routes(&self) -> Vec<Route> {
        self.routes
            .read()
            .await
            .iter()
            .map(|e| e.route.clone())
            .collect()
    }

    /// Match `path` to a route and pick one of its targets.
    pub async fn select(&self, path: &str) -> GatewayResult<Selection> {
        let (route, kind, balancer) = {
            let table = self.routes.read().await;
            let entry = table
                .iter()
                .find(|e| e.route.active && path.starts_with(&e.route.path))
                .ok_or_else(|| GatewayError::NoRoute(path.to_string()))?;
            (entry.route.clone(), entry.kind, entry.balancer.clone())
        };
        let balancer = balancer.ok_or(GatewayError::UnsupportedBalancer(kind))?;

        let candidates = if route.targets.is_empty() {
            let service = self.services.get_service(&route.service_id).await?;
            if service.endpoint.is_empty() {
                Vec::new()
            } else {
                vec![service.endpoint]
            }
        } else {
            route.targets.clone()
        };

        let target = balancer
            .next_target(&candidates)
            .map_err(|_| GatewayError::NoTargets(route.path.clone()))?;
        Ok(Selection {
            route,
            target,
            balancer,
        })
    }

    /// Proxy one request to the target chosen for its path.
    pub async fn forward(
        &self,
        req: Request,
        client_addr: Option<SocketAddr>,
    ) -> GatewayResult<Response> {
        let selection = self.select(req.uri().path()).await?;
        let (mut parts, body) = req.into_parts();

        let (scheme, authority, uri) = upstream_uri(&selection.target, &parts.uri)?;

        let original_host = parts
            .headers
            .get(header::HOST)
            .cloned()
            .or_else(|| {
                parts
                    .uri
                    .authority()
                    .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            });

        let headers = &mut parts.headers;
        for name in &HOP_BY_HOP {
            headers.remove(name);
        }
        if let Some(host) = original_host {
            headers.insert(X_FORWARDED_HOST, host);
        }
        if let Ok(proto) = HeaderValue::from_str(scheme.as_str()) {
            headers.insert(X_FORWARDED_PROTO, proto);
        }
        if let Some(ip) = client_addr.and_then(|a| HeaderValue::from_str(&a.ip().to_string()).ok()) {
            headers.insert(X_FORWARDED_FOR, ip);
        }
        if let Ok(host) = HeaderValue::from_str(authority.as_str()) {
            headers.insert(header::HOST, host);
        }
        for (name, value) in &selection.route.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => {
                    warn!(route_id = %selection.route.id, header = %name, "skipping invalid route header");
                }
            }
        }
        parts.uri = uri;

        debug!(
            route = %selection.route.path,
            target = %selection.target,
            uri = %parts.uri,
            "forwarding request"
        );

        let upstream = Request::from_parts(parts, body);
        let response =
            match tokio::time::timeout(self.upstream_timeout, self.client.request(upstream)).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    return Err(GatewayError::Upstream {
                        target: selection.target.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(_) => return Err(GatewayError::UpstreamTimeout(selection.target.clone())),
            };

        let (mut parts, incoming) = response.into_parts();
        for name in &HOP_BY_HOP {
            parts.headers.remove(name);
        }
        // The selection lives as long as the response body is streaming.
        let body = incoming.map_frame(move |frame| {
            let _held = &selection;
            frame
        });
        Ok(Response::from_parts(parts, Body::new(body)))
    }
}

/// Rewrite `original` onto `target`: scheme and authority come from the
/// target, the target's path is prefixed onto the request path, and the
/// request query is kept.
fn upstream_uri(target: &str, original: &Uri) -> GatewayResult<(Scheme, Authority, Uri)> {
    let invalid = |reason: &str| GatewayError::InvalidTarget {
        target: target.to_string(),
        reason: reason.to_string(),
    };

    let base: Uri = target.parse().map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;
    let scheme = base.scheme().cloned().ok_or_else(|| invalid("missing scheme"))?;
    let authority = base
        .authority()
        .cloned()
        .ok_or_else(|| invalid("missing host"))?;

    let mut path_and_query = join_paths(base.path(), original.path());
    if let Some(query) = original.query() {
        path_and_query.push('?');
        path_and_query.push_str(query);
    }

    let uri = Uri::builder()
        .scheme(scheme.clone())
        .authority(authority.clone())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| invalid(&e.to_string()))?;
    Ok((scheme, authority, uri))
}

/// Join two path segments with exactly one slash between them.
fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

/// axum router that sends every request through `gateway`.
pub fn gateway_router(gateway: Arc<Gateway>) -> Router {
    Router::new().fallback(proxy).with_state(gateway)
}

async fn proxy(State(gateway): State<Arc<Gateway>>, req: Request) -> Response {
    let client_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let path = req.uri().path().to_string();

    match gateway.forward(req, client_addr).await {
        Ok(response) => response,
        Err(e) => {
            match &e {
                GatewayError::NoRoute(_) => debug!(path = %path, "no route for request"),
                _ => warn!(path = %path, error = %e, "gateway request failed"),
            }
            e.response_parts().into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashMap};

    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use hermes_state::{Service, ServiceStatus, StateStore};
    use tower::ServiceExt;

    async fn spawn_upstream(name: &'static str) -> String {
        let app = Router::new()
            .fallback(move |headers: HeaderMap, uri: Uri| async move {
                let header = |key: &str| {
                    headers
                        .get(key)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-")
                        .to_string()
                };
                format!(
                    "{name} {} host={} fwd-host={} proto={} for={} tenant={}",
                    uri,
                    header("host"),
                    header("x-forwarded-host"),
                    header("x-forwarded-proto"),
                    header("x-forwarded-for"),
                    header("x-tenant"),
                )
            })
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    "late"
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn route(id: &str, path: &str, targets: Vec<String>) -> Route {
        Route {
            id: id.to_string(),
            path: path.to_string(),
            description: String::new(),
            service_id: "svc-1".to_string(),
            load_balancer_id: None,
            targets,
            active: true,
            headers: HashMap::new(),
            seq: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn round_robin(route: Route) -> GatewayRoute {
        GatewayRoute {
            route,
            balancer: LoadBalancerType::RoundRobin,
        }
    }

    async fn gateway_with_service(endpoint: &str) -> Gateway {
        let store = StateStore::open_in_memory().unwrap();
        store
            .create_service(&Service {
                id: "svc-1".to_string(),
                name: "users".to_string(),
                description: String::new(),
                endpoint: endpoint.to_string(),
                status: ServiceStatus::Healthy,
                service_type: String::new(),
                metadata: HashMap::new(),
                tags: BTreeSet::new(),
                registered_by: "self".to_string(),
                last_seen: 0,
                created_at: 0,
                updated_at: 0,
            })
            .await
            .unwrap();
        Gateway::new(Arc::new(store))
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn request(uri: &str) -> Request {
        Request::builder()
            .uri(uri)
            .header("host", "gateway.local")
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn join_paths_uses_one_slash() {
        assert_eq!(join_paths("/", "/users"), "/users");
        assert_eq!(join_paths("/v1/", "/users"), "/v1/users");
        assert_eq!(join_paths("/v1", "users"), "/v1/users");
        assert_eq!(join_paths("/v1", "/users"), "/v1/users");
    }

    #[test]
    fn upstream_uri_rewrites_scheme_and_host() {
        let original: Uri = "/api/users?page=2".parse().unwrap();
        let (scheme, authority, uri) = upstream_uri("http://10.0.0.1:9000/base", &original).unwrap();
        assert_eq!(scheme.as_str(), "http");
        assert_eq!(authority.as_str(), "10.0.0.1:9000");
        assert_eq!(uri.to_string(), "http://10.0.0.1:9000/base/api/users?page=2");

        assert!(matches!(
            upstream_uri("not a url", &original),
            Err(GatewayError::InvalidTarget { .. })
        ));
        assert!(matches!(
            upstream_uri("/relative", &original),
            Err(GatewayError::InvalidTarget { .. })
        ));
    }

    #[tokio::test]
    async fn first_registered_prefix_wins() {
        let gateway = gateway_with_service("http://svc").await;
        gateway
            .update_routes(vec![
                round_robin(route("r1", "/api", vec!["http://broad".to_string()])),
                round_robin(route("r2", "/api/users", vec!["http://narrow".to_string()])),
            ])
            .await;

        let selection = gateway.select("/api/users/1").await.unwrap();
        assert_eq!(selection.route.id, "r1");
        assert_eq!(selection.target, "http://broad");
    }

    #[tokio::test]
    async fn inactive_routes_are_skipped() {
        let gateway = gateway_with_service("http://svc").await;
        let mut inactive = route("r1", "/api", vec!["http://old".to_string()]);
        inactive.active = false;
        gateway
            .update_routes(vec![
                round_robin(inactive),
                round_robin(route("r2", "/api", vec!["http://new".to_string()])),
            ])
            .await;

        assert_eq!(gateway.select("/api").await.unwrap().target, "http://new");
    }

    #[tokio::test]
    async fn unmatched_path_is_no_route() {
        let gateway = gateway_with_service("http://svc").await;
        gateway
            .update_routes(vec![round_robin(route("r1", "/api", vec!["http://a".to_string()]))])
            .await;
        assert!(matches!(
            gateway.select("/other").await,
            Err(GatewayError::NoRoute(_))
        ));
    }

    #[tokio::test]
    async fn empty_targets_fall_back_to_service_endpoint() {
        let gateway = gateway_with_service("http://users:8080").await;
        gateway
            .update_routes(vec![round_robin(route("r1", "/users", Vec::new()))])
            .await;
        assert_eq!(
            gateway.select("/users/7").await.unwrap().target,
            "http://users:8080"
        );
    }

    #[tokio::test]
    async fn empty_targets_and_endpoint_is_no_targets() {
        let gateway = gateway_with_service("").await;
        gateway
            .update_routes(vec![round_robin(route("r1", "/users", Vec::new()))])
            .await;
        assert!(matches!(
            gateway.select("/users").await,
            Err(GatewayError::NoTargets(_))
        ));
    }

    #[tokio::test]
    async fn update_replaces_table_and_keeps_balancer_state() {
        let gateway = gateway_with_service("http://svc").await;
        let targets = vec!["http://a".to_string(), "http://b".to_string()];
        gateway
            .update_routes(vec![round_robin(route("r1", "/api", targets.clone()))])
            .await;
        assert_eq!(gateway.select("/api").await.unwrap().target, "http://a");

        gateway
            .update_routes(vec![
                round_robin(route("r1", "/api", targets)),
                round_robin(route("r2", "/web", vec!["http://w".to_string()])),
            ])
            .await;
        assert_eq!(gateway.routes().await.len(), 2);
        assert_eq!(gateway.select("/api").await.unwrap().target, "http://b");

        gateway.update_routes(Vec::new()).await;
        assert!(gateway.routes().await.is_empty());
    }

    #[tokio::test]
    async fn dropping_selection_releases_least_connections_slot() {
        let gateway = gateway_with_service("http://svc").await;
        gateway
            .update_routes(vec![GatewayRoute {
                route: route(
                    "r1",
                    "/api",
                    vec!["http://a".to_string(), "http://b".to_string()],
                ),
                balancer: LoadBalancerType::LeastConnections,
            }])
            .await;

        let first = gateway.select("/api").await.unwrap();
        assert_eq!(first.target, "http://a");
        let second = gateway.select("/api").await.unwrap();
        assert_eq!(second.target, "http://b");

        drop(first);
        assert_eq!(gateway.select("/api").await.unwrap().target, "http://a");
    }

    #[tokio::test]
    async fn proxies_request_with_forwarded_headers() {
        let upstream = spawn_upstream("one").await;
        let gateway = gateway_with_service("http://svc").await;
        let mut r = route("r1", "/api", vec![upstream.clone()]);
        r.headers.insert("x-tenant".to_string(), "acme".to_string());
        gateway.update_routes(vec![round_robin(r)]).await;

        let mut req = request("/api/users?page=2");
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 168, 1, 20], 40000))));
        let response = gateway_router(Arc::new(gateway)).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let authority = upstream.trim_start_matches("http://");
        let body = body_text(response).await;
        assert_eq!(
            body,
            format!(
                "one /api/users?page=2 host={authority} fwd-host=gateway.local proto=http for=192.168.1.20 tenant=acme"
            )
        );
    }

    #[tokio::test]
    async fn round_robin_spreads_over_upstreams() {
        let one = spawn_upstream("one").await;
        let two = spawn_upstream("two").await;
        let gateway = gateway_with_service("http://svc").await;
        gateway
            .update_routes(vec![round_robin(route("r1", "/", vec![one, two]))])
            .await;
        let app = gateway_router(Arc::new(gateway));

        let mut names = Vec::new();
        for _ in 0..4 {
            let response = app.clone().oneshot(request("/ping")).await.unwrap();
            let body = body_text(response).await;
            names.push(body.split(' ').next().unwrap_or_default().to_string());
        }
        assert_eq!(names, ["one", "two", "one", "two"]);
    }

    #[tokio::test]
    async fn error_statuses() {
        let upstream = spawn_upstream("one").await;
        let gateway = gateway_with_service("").await.with_upstream_timeout(Duration::from_millis(500));
        gateway
            .update_routes(vec![
                round_robin(route("slow", "/slow", vec![upstream])),
                round_robin(route("empty", "/empty", Vec::new())),
                round_robin(route("bad", "/bad", vec!["::nope::".to_string()])),
                round_robin(route("down", "/down", vec!["http://127.0.0.1:1".to_string()])),
                GatewayRoute {
                    route: route("weighted", "/weighted", vec!["http://a".to_string()]),
                    balancer: LoadBalancerType::WeightedRoundRobin,
                },
            ])
            .await;
        let app = gateway_router(Arc::new(gateway));

        let cases = [
            ("/missing", StatusCode::NOT_FOUND, "route not found"),
            ("/empty", StatusCode::INTERNAL_SERVER_ERROR, "failed to route request"),
            ("/bad", StatusCode::INTERNAL_SERVER_ERROR, "failed to route request"),
            ("/weighted", StatusCode::INTERNAL_SERVER_ERROR, "failed to route request"),
            ("/down", StatusCode::BAD_GATEWAY, "upstream request failed"),
            ("/slow", StatusCode::GATEWAY_TIMEOUT, "upstream request timed out"),
        ];
        for (path, status, text) in cases {
            let response = app.clone().oneshot(request(path)).await.unwrap();
            assert_eq!(response.status(), status, "{path}");
            assert_eq!(body_text(response).await, text, "{path}");
        }
    }
}
