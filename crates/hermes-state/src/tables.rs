//! redb table definitions for the Hermes state store.
//!
//! Record tables use `&str` or `u64` keys and `&[u8]` values
//! (JSON-serialized domain types). Child records use composite keys of
//! the form `{service_id}/{child}` so they can be found by prefix scan.

use redb::TableDefinition;

/// A table of JSON-encoded records keyed by string.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// A table of JSON-encoded records keyed by numeric ID.
pub type JsonIdTable = TableDefinition<'static, u64, &'static [u8]>;

/// Services keyed by service ID.
pub const SERVICES: JsonTable = TableDefinition::new("services");

/// Unique name index: service name → service ID.
pub const SERVICE_NAMES: TableDefinition<&str, &str> = TableDefinition::new("service_names");

/// Versions keyed by `{service_id}/{version}`.
pub const VERSIONS: JsonTable = TableDefinition::new("versions");

/// Dependency edges keyed by `{service_id}/{dependency_id}`.
pub const DEPENDENCIES: JsonTable = TableDefinition::new("dependencies");

/// Health checks keyed by check ID.
pub const HEALTH_CHECKS: JsonIdTable = TableDefinition::new("health_checks");

/// Append-only history keyed by `{service_id}/{timestamp_ms:020}/{id:020}`.
pub const HEALTH_HISTORY: JsonTable = TableDefinition::new("health_history");

/// Custom metrics keyed by `{service_id}/{name}`.
pub const CUSTOM_METRICS: JsonTable = TableDefinition::new("custom_metrics");

/// Health thresholds keyed by threshold ID.
pub const HEALTH_THRESHOLDS: JsonIdTable = TableDefinition::new("health_thresholds");

/// Gateway routes keyed by route ID.
pub const ROUTES: JsonTable = TableDefinition::new("routes");

/// Load balancer configs keyed by load balancer ID.
pub const LOAD_BALANCERS: JsonTable = TableDefinition::new("load_balancers");

/// Monotonic ID sequences keyed by sequence name.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

pub const SEQ_VERSIONS: &str = "versions";
pub const SEQ_DEPENDENCIES: &str = "dependencies";
pub const SEQ_HEALTH_CHECKS: &str = "health_checks";
pub const SEQ_HEALTH_HISTORY: &str = "health_history";
pub const SEQ_CUSTOM_METRICS: &str = "custom_metrics";
pub const SEQ_HEALTH_THRESHOLDS: &str = "health_thresholds";
pub const SEQ_ROUTES: &str = "routes";
