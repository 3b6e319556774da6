//! hermesd.toml configuration.
//!
//! Every section is optional. Durations are strings such as `"5s"`,
//! `"500ms"`, `"2m"` or a bare number of seconds.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use hermes_state::LoadBalancerType;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HermesConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub log_level: Option<String>,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub gateway: GatewayConfig,
    pub services: Vec<ServiceConfig>,
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Gateway listen address.
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/hermes"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub supervisor_interval: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            supervisor_interval: "60s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub route_refresh_interval: String,
    pub upstream_timeout: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            route_refresh_interval: "30s".to_string(),
            upstream_timeout: "30s".to_string(),
        }
    }
}

/// A service registered at start-up unless one with the same name exists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub description: String,
    pub endpoint: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub health_check: Option<HealthCheckConfig>,
}

/// Active HTTP check created alongside a bootstrapped service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub name: Option<String>,
    /// Full URL, or a path appended to the service endpoint.
    pub endpoint: String,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub method: Option<String>,
    pub expected_status: Option<u16>,
    pub threshold_count: Option<u32>,
    pub headers: HashMap<String, String>,
}

/// A gateway route created at start-up unless its path already exists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub path: String,
    pub description: String,
    /// Name of the owning service.
    pub service: String,
    pub targets: Vec<String>,
    pub load_balancer: LoadBalancerType,
    pub headers: HashMap<String, String>,
}

impl HermesConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: HermesConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn supervisor_interval(&self) -> anyhow::Result<Duration> {
        positive_duration("scheduler.supervisor_interval", &self.scheduler.supervisor_interval)
    }

    pub fn route_refresh_interval(&self) -> anyhow::Result<Duration> {
        positive_duration("gateway.route_refresh_interval", &self.gateway.route_refresh_interval)
    }

    pub fn upstream_timeout(&self) -> anyhow::Result<Duration> {
        positive_duration("gateway.upstream_timeout", &self.gateway.upstream_timeout)
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.supervisor_interval()?;
        self.route_refresh_interval()?;
        self.upstream_timeout()?;

        for service in &self.services {
            if service.name.trim().is_empty() || service.endpoint.trim().is_empty() {
                bail!("every [[services]] entry needs a name and an endpoint");
            }
            if let Some(check) = &service.health_check {
                for (key, value) in [("interval", &check.interval), ("timeout", &check.timeout)] {
                    if let Some(value) = value {
                        positive_duration(&format!("services.{}.health_check.{key}", service.name), value)?;
                    }
                }
            }
        }
        for route in &self.routes {
            if !route.path.starts_with('/') {
                bail!("route path {:?} must start with '/'", route.path);
            }
            if route.service.trim().is_empty() {
                bail!("route {} needs a service name", route.path);
            }
        }
        Ok(())
    }
}

fn positive_duration(key: &str, value: &str) -> anyhow::Result<Duration> {
    match parse_duration(value) {
        Some(d) if !d.is_zero() => Ok(d),
        _ => bail!("{key}: invalid duration {value:?}"),
    }
}

/// Parse a duration written as digits and an optional unit: `ms`, `s`,
/// `m` or `h`. A bare number is seconds. Out-of-range values are rejected.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (digits, unit) = s.split_at(s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len()));
    let value: u64 = digits.parse().ok()?;
    let secs_per_unit = match unit {
        "ms" => return Some(Duration::from_millis(value)),
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        _ => return None,
    };
    value.checked_mul(secs_per_unit).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration(" 30 "), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("5d"), None);
        assert_eq!(parse_duration("ms"), None);
        assert_eq!(parse_duration("-5s"), None);
    }

    #[test]
    fn parse_duration_rejects_overflow() {
        let max = u64::MAX.to_string();
        assert_eq!(parse_duration(&format!("{max}s")), Some(Duration::from_secs(u64::MAX)));
        assert_eq!(parse_duration(&format!("{max}m")), None);
        assert_eq!(parse_duration(&format!("{max}h")), None);
        let hours = u64::MAX / 3600;
        assert_eq!(
            parse_duration(&format!("{hours}h")),
            Some(Duration::from_secs(hours * 3600))
        );
        assert_eq!(parse_duration(&format!("{}h", hours + 1)), None);
        assert_eq!(parse_duration("18446744073709551616"), None);
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = HermesConfig::parse("").unwrap();
        assert_eq!(config.server.listen, SocketAddr::from(([0, 0, 0, 0], 8080)));
        assert_eq!(config.storage.data_dir, PathBuf::from("/var/lib/hermes"));
        assert_eq!(config.supervisor_interval().unwrap(), Duration::from_secs(60));
        assert_eq!(config.route_refresh_interval().unwrap(), Duration::from_secs(30));
        assert_eq!(config.upstream_timeout().unwrap(), Duration::from_secs(30));
        assert!(config.services.is_empty());
        assert!(config.routes.is_empty());
        assert!(config.log_level.is_none());
    }

    #[test]
    fn full_config_parses() {
        let config = HermesConfig::parse(
            r#"
log_level = "warn,hermesd=info"

[server]
listen = "127.0.0.1:9090"

[storage]
data_dir = "/tmp/hermes"

[scheduler]
supervisor_interval = "10s"

[gateway]
route_refresh_interval = "5s"
upstream_timeout = "2500ms"

[[services]]
name = "orders"
endpoint = "http://orders:8080"
type = "http"
tags = ["core", "payments"]
metadata = { team = "checkout" }

[services.health_check]
endpoint = "/healthz"
interval = "15s"
expected_status = 200

[[routes]]
path = "/orders"
service = "orders"
targets = ["http://orders-1:8080", "http://orders-2:8080"]
load_balancer = "least-connections"
headers = { x-gateway = "hermes" }
"#,
        )
        .unwrap();

        assert_eq!(config.log_level.as_deref(), Some("warn,hermesd=info"));
        assert_eq!(config.server.listen.port(), 9090);
        assert_eq!(config.upstream_timeout().unwrap(), Duration::from_millis(2500));

        let orders = &config.services[0];
        assert_eq!(orders.service_type, "http");
        assert_eq!(orders.tags, ["core", "payments"]);
        assert_eq!(orders.metadata["team"], "checkout");
        let check = orders.health_check.as_ref().unwrap();
        assert_eq!(check.endpoint, "/healthz");
        assert_eq!(check.expected_status, Some(200));

        let route = &config.routes[0];
        assert_eq!(route.load_balancer, LoadBalancerType::LeastConnections);
        assert_eq!(route.targets.len(), 2);
        assert_eq!(route.headers["x-gateway"], "hermes");
    }

    #[test]
    fn invalid_values_are_rejected() {
        for bad in [
            "[scheduler]\nsupervisor_interval = \"0s\"",
            "[gateway]\nupstream_timeout = \"later\"",
            "[[services]]\nname = \"orders\"",
            "[[services]]\nname = \"a\"\nendpoint = \"http://a\"\n[services.health_check]\nendpoint = \"/h\"\ninterval = \"x\"",
            "[[routes]]\npath = \"orders\"\nservice = \"orders\"",
            "[[routes]]\npath = \"/orders\"",
            "[[routes]]\npath = \"/o\"\nservice = \"o\"\nload_balancer = \"sticky\"",
        ] {
            assert!(HermesConfig::parse(bad).is_err(), "accepted: {bad}");
        }
    }

    #[test]
    fn round_trips_through_toml() {
        let config = HermesConfig::parse("[server]\nlisten = \"127.0.0.1:7000\"").unwrap();
        let text = config.to_toml_string().unwrap();
        let again = HermesConfig::parse(&text).unwrap();
        assert_eq!(again.server.listen, config.server.listen);
    }

    #[test]
    fn from_file_reports_missing_path() {
        let err = HermesConfig::from_file(Path::new("/nonexistent/hermesd.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config"));
    }
}
