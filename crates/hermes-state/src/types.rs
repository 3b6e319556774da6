//! Domain types for the Hermes registry.
//!
//! These types represent the persisted state of services, versions,
//! dependency edges, health checks and their history, custom metrics,
//! thresholds, and gateway routes. All types are serializable to/from
//! JSON for storage in redb tables. Timestamps are Unix epoch
//! milliseconds.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Unique identifier for a service (`svc-xxxxxxxx`).
pub type ServiceId = String;

/// Identifier for a health check.
pub type CheckId = u64;

// ── Service ───────────────────────────────────────────────────────

/// Health status of a service as shown in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    #[default]
    Unknown,
    Healthy,
    Warning,
    Unhealthy,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Unknown => "UNKNOWN",
            ServiceStatus::Healthy => "HEALTHY",
            ServiceStatus::Warning => "WARNING",
            ServiceStatus::Unhealthy => "UNHEALTHY",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UNKNOWN" => Ok(ServiceStatus::Unknown),
            "HEALTHY" => Ok(ServiceStatus::Healthy),
            "WARNING" => Ok(ServiceStatus::Warning),
            "UNHEALTHY" => Ok(ServiceStatus::Unhealthy),
            other => Err(format!("unknown service status: {other}")),
        }
    }
}

/// Canonical registry record of a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Base URL of the service.
    pub endpoint: String,
    pub status: ServiceStatus,
    #[serde(rename = "type", default)]
    pub service_type: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub registered_by: String,
    pub last_seen: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Data needed to register a new service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceRegistration {
    pub name: String,
    pub description: String,
    pub endpoint: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub metadata: HashMap<String, String>,
    pub tags: Vec<String>,
    pub registered_by: String,
}

/// Fields of a service that may be changed after registration.
///
/// `None` leaves the current value in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub endpoint: Option<String>,
    #[serde(rename = "type")]
    pub service_type: Option<String>,
    pub metadata: Option<HashMap<String, String>>,
    pub tags: Option<Vec<String>>,
}

/// Basic list filter with pagination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceQuery {
    pub status: Option<ServiceStatus>,
    #[serde(rename = "type")]
    pub service_type: Option<String>,
    /// Every listed tag must be present on the service.
    pub tags: Vec<String>,
    /// Substring match on the service name.
    pub search: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for ServiceQuery {
    fn default() -> Self {
        Self {
            status: None,
            service_type: None,
            tags: Vec::new(),
            search: None,
            limit: 20,
            offset: 0,
        }
    }
}

/// Extended discovery filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryQuery {
    #[serde(flatten)]
    pub base: ServiceQuery,
    /// Any-of match on service status.
    pub health_status: Vec<ServiceStatus>,
    pub metadata_key: Option<String>,
    pub metadata_value: Option<String>,
    pub include_versions: bool,
    pub version: Option<String>,
    pub active_version_only: bool,
    /// Only services that depend on this service ID.
    pub dependency_id: Option<ServiceId>,
    /// Only services that this service ID depends on.
    pub dependency_of: Option<ServiceId>,
    /// Only services seen strictly after this epoch-millis instant.
    pub last_seen_since: Option<u64>,
}

/// One page of a filtered listing plus the unpaginated match count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

impl<T> Page<T> {
    /// Slice `all` by offset/limit, keeping the full count. A zero limit
    /// means "no limit".
    pub fn paginate(all: Vec<T>, offset: usize, limit: usize) -> Self {
        let total = all.len();
        let take = if limit == 0 { usize::MAX } else { limit };
        let items = all.into_iter().skip(offset).take(take).collect();
        Self { items, total }
    }
}

// ── Versions ──────────────────────────────────────────────────────

/// One deployed version of a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceVersion {
    pub id: u64,
    pub service_id: ServiceId,
    pub version: String,
    pub is_active: bool,
    pub endpoint: String,
    #[serde(default)]
    pub description: String,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ServiceVersion {
    /// Build the composite key for the versions table.
    pub fn table_key(&self) -> String {
        version_key(&self.service_id, &self.version)
    }
}

/// Data needed to add a version to a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VersionRequest {
    pub version: String,
    pub is_active: bool,
    pub endpoint: String,
    pub description: String,
}

// ── Dependencies ──────────────────────────────────────────────────

/// Strength of a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DependencyType {
    Required,
    Optional,
}

impl DependencyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyType::Required => "REQUIRED",
            DependencyType::Optional => "OPTIONAL",
        }
    }
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DependencyType {
    type Err = String;

    /// Exact, case-sensitive match.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REQUIRED" => Ok(DependencyType::Required),
            "OPTIONAL" => Ok(DependencyType::Optional),
            other => Err(format!(
                "invalid dependency type {other:?}, must be one of: REQUIRED, OPTIONAL"
            )),
        }
    }
}

/// Directed edge `service_id → dependency_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceDependency {
    pub id: u64,
    pub service_id: ServiceId,
    pub dependency_id: ServiceId,
    pub dependency_type: DependencyType,
    #[serde(default)]
    pub description: String,
    pub created_at: u64,
}

impl ServiceDependency {
    /// Build the composite key for the dependencies table.
    pub fn table_key(&self) -> String {
        dependency_key(&self.service_id, &self.dependency_id)
    }
}

/// Data needed to add a dependency edge. The type arrives as free text
/// and is validated by the registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DependencyRequest {
    pub dependency_id: ServiceId,
    pub dependency_type: String,
    pub description: String,
}

// ── Health checks ─────────────────────────────────────────────────

/// How a health check is performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthCheckType {
    /// Probed by the scheduler.
    Active,
    /// Reported by the service itself.
    Passive,
}

/// Health check configuration attached to a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheck {
    pub id: CheckId,
    pub service_id: ServiceId,
    pub name: String,
    #[serde(rename = "type")]
    pub check_type: HealthCheckType,
    /// Full URL probed by active checks.
    pub endpoint: String,
    /// Seconds between probes.
    pub interval: i64,
    /// Probe deadline in seconds.
    pub timeout: i64,
    pub method: String,
    /// Expected HTTP status; zero accepts any response.
    pub expected_status: u16,
    /// Stored for callers; not evaluated by the prober.
    #[serde(default)]
    pub expected_body: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub retries: u32,
    /// Consecutive failures before the service is marked unhealthy.
    pub threshold_count: u32,
    /// Current consecutive failure count.
    pub timeout_count: u32,
    pub enabled: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl HealthCheck {
    /// Whether the scheduler should run this check.
    pub fn is_schedulable(&self) -> bool {
        self.enabled && self.check_type == HealthCheckType::Active
    }
}

/// Create/update payload for a health check.
///
/// On update, zero and empty values leave the stored field untouched;
/// `enabled` is always applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthCheckRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub check_type: Option<HealthCheckType>,
    pub endpoint: String,
    pub interval: i64,
    pub timeout: i64,
    pub method: String,
    pub expected_status: u16,
    pub expected_body: String,
    pub headers: Option<HashMap<String, String>>,
    pub retries: u32,
    pub threshold_count: u32,
    pub enabled: bool,
}

impl Default for HealthCheckRequest {
    fn default() -> Self {
        Self {
            name: String::new(),
            check_type: None,
            endpoint: String::new(),
            interval: 0,
            timeout: 0,
            method: String::new(),
            expected_status: 0,
            expected_body: String::new(),
            headers: None,
            retries: 0,
            threshold_count: 0,
            enabled: true,
        }
    }
}

// ── History ───────────────────────────────────────────────────────

/// One recorded check outcome. Never mutated after insertion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthHistory {
    pub id: u64,
    pub service_id: ServiceId,
    pub check_id: Option<CheckId>,
    pub status: ServiceStatus,
    #[serde(default)]
    pub message: String,
    pub response_time_ms: u64,
    pub status_code: u16,
    #[serde(default)]
    pub details: HashMap<String, String>,
    pub timestamp: u64,
}

impl HealthHistory {
    /// A fresh, unsaved history row for `service_id`. The store assigns `id`.
    pub fn new(service_id: &str, status: ServiceStatus) -> Self {
        Self {
            id: 0,
            service_id: service_id.to_string(),
            check_id: None,
            status,
            message: String::new(),
            response_time_ms: 0,
            status_code: 0,
            details: HashMap::new(),
            timestamp: epoch_millis(),
        }
    }

    /// Build the composite key for the history table.
    pub fn table_key(&self) -> String {
        format!("{}/{:020}/{:020}", self.service_id, self.timestamp, self.id)
    }
}

/// Time-ranged history filter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HistoryQuery {
    /// Inclusive lower bound (epoch millis).
    pub start_time: Option<u64>,
    /// Inclusive upper bound (epoch millis).
    pub end_time: Option<u64>,
    pub status: Option<ServiceStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            start_time: None,
            end_time: None,
            status: None,
            limit: 100,
            offset: 0,
        }
    }
}

/// Passive health report sent by a service about itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthReport {
    pub status: ServiceStatus,
    pub message: String,
    pub response_time_ms: u64,
    pub status_code: u16,
    pub details: HashMap<String, String>,
    pub metrics: Vec<MetricUpdate>,
}

// ── Custom metrics and thresholds ─────────────────────────────────

/// Latest value of a service-defined metric, keyed by (service, name).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomHealthMetric {
    pub id: u64,
    pub service_id: ServiceId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub value: f64,
    #[serde(default)]
    pub unit: String,
    pub warning_threshold: Option<f64>,
    pub critical_threshold: Option<f64>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl CustomHealthMetric {
    /// Build the composite key for the custom metrics table.
    pub fn table_key(&self) -> String {
        metric_key(&self.service_id, &self.name)
    }
}

/// Upsert payload for a custom metric.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricUpdate {
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub description: Option<String>,
    pub warning_threshold: Option<f64>,
    pub critical_threshold: Option<f64>,
}

/// Comparison used by a [`HealthThreshold`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComparisonType {
    #[default]
    GreaterThan,
    LessThan,
    EqualTo,
}

/// Warning/critical rule for a named metric. Informational only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthThreshold {
    pub id: u64,
    pub service_id: ServiceId,
    pub metric_name: String,
    pub warning_value: f64,
    pub critical_value: f64,
    pub comparison_type: ComparisonType,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Create/update payload for a threshold.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThresholdRequest {
    pub metric_name: String,
    pub warning_value: f64,
    pub critical_value: f64,
    pub comparison_type: Option<ComparisonType>,
}

// ── Gateway ───────────────────────────────────────────────────────

/// Load balancing strategy tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancerType {
    #[default]
    RoundRobin,
    Random,
    LeastConnections,
    /// Declared for configuration compatibility; no strategy implements it.
    WeightedRoundRobin,
}

impl LoadBalancerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancerType::RoundRobin => "round-robin",
            LoadBalancerType::Random => "random",
            LoadBalancerType::LeastConnections => "least-connections",
            LoadBalancerType::WeightedRoundRobin => "weighted-round-robin",
        }
    }
}

impl fmt::Display for LoadBalancerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalancerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(LoadBalancerType::RoundRobin),
            "random" => Ok(LoadBalancerType::Random),
            "least-connections" => Ok(LoadBalancerType::LeastConnections),
            "weighted-round-robin" => Ok(LoadBalancerType::WeightedRoundRobin),
            other => Err(format!("unsupported load balancer type: {other}")),
        }
    }
}

/// Named load balancer configuration referenced by routes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadBalancerConfig {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: LoadBalancerType,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Path-prefix route owned by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Route {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub description: String,
    pub service_id: ServiceId,
    pub load_balancer_id: Option<String>,
    /// Ordered upstream base URLs.
    #[serde(default)]
    pub targets: Vec<String>,
    pub active: bool,
    /// Static headers set on every forwarded request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Creation sequence assigned by the store on first write. Routes
    /// are matched in this order.
    #[serde(default)]
    pub seq: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Keys and time ─────────────────────────────────────────────────

pub fn version_key(service_id: &str, version: &str) -> String {
    format!("{service_id}/{version}")
}

pub fn dependency_key(service_id: &str, dependency_id: &str) -> String {
    format!("{service_id}/{dependency_id}")
}

pub fn metric_key(service_id: &str, name: &str) -> String {
    format!("{service_id}/{name}")
}

/// Current time as Unix epoch milliseconds.
pub fn epoch_millis() -> u64 {
    let since_epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    u64::try_from(since_epoch.as_millis()).unwrap_or(u64::MAX)
}
