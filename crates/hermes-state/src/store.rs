//! StateStore: redb-backed persistence for the Hermes registry.
//!
//! Implements [`ServiceStore`], [`HealthStore`], and [`RouteStore`] over a
//! single redb database. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).
//!
//! Each trait method runs in exactly one redb transaction, which is what
//! makes sibling deactivation, counter increments, and unique-name checks
//! atomic for callers.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, Table, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::repository::{HealthStore, RouteStore, ServiceStore};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonRw<'txn> = Table<'txn, &'static str, &'static [u8]>;
type JsonIdRw<'txn> = Table<'txn, u64, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        self.write(|txn| {
            // Opening a table in a write transaction creates it if absent.
            for def in [
                SERVICES,
                VERSIONS,
                DEPENDENCIES,
                HEALTH_HISTORY,
                CUSTOM_METRICS,
                ROUTES,
                LOAD_BALANCERS,
            ] {
                txn.open_table(def).map_err(map_err!(Table))?;
            }
            txn.open_table(HEALTH_CHECKS).map_err(map_err!(Table))?;
            txn.open_table(HEALTH_THRESHOLDS).map_err(map_err!(Table))?;
            txn.open_table(SERVICE_NAMES).map_err(map_err!(Table))?;
            txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            Ok(())
        })
    }

    /// Run `f` inside a write transaction and commit if it succeeds.
    /// Returning an error drops (aborts) the transaction.
    fn write<R>(&self, f: impl FnOnce(&WriteTransaction) -> StateResult<R>) -> StateResult<R> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = f(&txn)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(result)
    }

    fn read_one<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        load(&table, key)
    }

    fn read_by_id<T: DeserializeOwned>(&self, def: JsonIdTable, id: u64) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        load_id(&table, id)
    }

    /// All records whose key starts with `prefix` (empty prefix = all), in key order.
    fn read_prefix<T: DeserializeOwned>(&self, def: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        Ok(load_prefix(&table, prefix)?
            .into_iter()
            .map(|(_, value)| value)
            .collect())
    }

    fn read_all_ids<T: DeserializeOwned>(&self, def: JsonIdTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        load_all_ids(&table)
    }
}

// ── Encoding helpers ──────────────────────────────────────────────

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn load<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<T>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => decode(guard.value()).map(Some),
        None => Ok(None),
    }
}

fn load_id<T: DeserializeOwned>(
    table: &impl ReadableTable<u64, &'static [u8]>,
    id: u64,
) -> StateResult<Option<T>> {
    match table.get(id).map_err(map_err!(Read))? {
        Some(guard) => decode(guard.value()).map(Some),
        None => Ok(None),
    }
}

fn load_prefix<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> StateResult<Vec<(String, T)>> {
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if key.value().starts_with(prefix) {
            results.push((key.value().to_string(), decode(value.value())?));
        }
    }
    Ok(results)
}

fn load_all_ids<T: DeserializeOwned>(
    table: &impl ReadableTable<u64, &'static [u8]>,
) -> StateResult<Vec<T>> {
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        results.push(decode(value.value())?);
    }
    Ok(results)
}

fn save<T: Serialize>(table: &mut JsonRw<'_>, key: &str, value: &T) -> StateResult<()> {
    let bytes = encode(value)?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

fn save_id<T: Serialize>(table: &mut JsonIdRw<'_>, id: u64, value: &T) -> StateResult<()> {
    let bytes = encode(value)?;
    table
        .insert(id, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Allocate the next value of a named sequence inside `txn`.
fn next_id(txn: &WriteTransaction, sequence: &str) -> StateResult<u64> {
    let mut table = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
    let next = table
        .get(sequence)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0)
        + 1;
    table.insert(sequence, next).map_err(map_err!(Write))?;
    Ok(next)
}

/// Child rows removed along with a service.
struct DeleteCounts {
    versions: usize,
    dependencies: usize,
    checks: usize,
    metrics: usize,
    thresholds: usize,
}

fn service_prefix(service_id: &str) -> String {
    format!("{service_id}/")
}

fn not_found(what: &str, key: impl std::fmt::Display) -> StateError {
    StateError::NotFound(format!("{what} {key}"))
}

/// Basic list filter shared by `list_services` and `search_services`.
fn matches_query(service: &Service, query: &ServiceQuery) -> bool {
    if query.status.is_some_and(|status| service.status != status) {
        return false;
    }
    if let Some(kind) = query.service_type.as_deref().filter(|k| !k.is_empty()) {
        if service.service_type != kind {
            return false;
        }
    }
    query.tags.iter().all(|tag| service.tags.contains(tag))
}

fn matches_discovery(service: &Service, query: &DiscoveryQuery) -> bool {
    if !matches_query(service, &query.base) {
        return false;
    }
    if let Some(search) = query.base.search.as_deref().filter(|s| !s.is_empty()) {
        let needle = search.to_lowercase();
        if !service.name.to_lowercase().contains(&needle)
            && !service.description.to_lowercase().contains(&needle)
        {
            return false;
        }
    }
    if !query.health_status.is_empty() && !query.health_status.contains(&service.status) {
        return false;
    }
    if let Some(key) = query.metadata_key.as_deref().filter(|k| !k.is_empty()) {
        match (service.metadata.get(key), query.metadata_value.as_deref()) {
            (None, _) => return false,
            (Some(actual), Some(expected)) if !expected.is_empty() && actual != expected => {
                return false;
            }
            _ => {}
        }
    }
    if let Some(since) = query.last_seen_since {
        if service.last_seen <= since {
            return false;
        }
    }
    true
}

fn sort_services(services: &mut [Service]) {
    services.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
}

// ── Services ──────────────────────────────────────────────────────

#[async_trait]
impl ServiceStore for StateStore {
    async fn create_service(&self, service: &Service) -> StateResult<()> {
        self.write(|txn| {
            let mut names = txn.open_table(SERVICE_NAMES).map_err(map_err!(Table))?;
            if names
                .get(service.name.as_str())
                .map_err(map_err!(Read))?
                .is_some()
            {
                return Err(StateError::Conflict(format!(
                    "service name {} already registered",
                    service.name
                )));
            }
            let mut table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            if table
                .get(service.id.as_str())
                .map_err(map_err!(Read))?
                .is_some()
            {
                return Err(StateError::Conflict(format!(
                    "service id {} already in use",
                    service.id
                )));
            }
            save(&mut table, &service.id, service)?;
            names
                .insert(service.name.as_str(), service.id.as_str())
                .map_err(map_err!(Write))?;
            Ok(())
        })?;
        debug!(service_id = %service.id, name = %service.name, "service stored");
        Ok(())
    }

    async fn get_service(&self, id: &str) -> StateResult<Service> {
        self.read_one(SERVICES, id)?
            .ok_or_else(|| not_found("service", id))
    }

    async fn get_service_by_name(&self, name: &str) -> StateResult<Service> {
        let id = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let names = txn.open_table(SERVICE_NAMES).map_err(map_err!(Table))?;
            let found = names
                .get(name)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_string());
            found
        };
        match id {
            Some(id) => self.get_service(&id).await,
            None => Err(not_found("service named", name)),
        }
    }

    async fn list_services(&self, query: &ServiceQuery) -> StateResult<Page<Service>> {
        let mut services: Vec<Service> = self
            .read_prefix(SERVICES, "")?
            .into_iter()
            .filter(|s: &Service| matches_query(s, query))
            .filter(|s| match query.search.as_deref() {
                Some(search) if !search.is_empty() => s.name.contains(search),
                _ => true,
            })
            .collect();
        sort_services(&mut services);
        Ok(Page::paginate(services, query.offset, query.limit))
    }

    async fn search_services(&self, query: &DiscoveryQuery) -> StateResult<Vec<Service>> {
        let mut services: Vec<Service> = self
            .read_prefix(SERVICES, "")?
            .into_iter()
            .filter(|s: &Service| matches_discovery(s, query))
            .collect();
        sort_services(&mut services);
        Ok(services)
    }

    async fn update_service(&self, service: &Service) -> StateResult<()> {
        self.write(|txn| {
            let mut table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            let existing: Service =
                load(&table, &service.id)?.ok_or_else(|| not_found("service", &service.id))?;
            if existing.name != service.name {
                let mut names = txn.open_table(SERVICE_NAMES).map_err(map_err!(Table))?;
                let owner = names
                    .get(service.name.as_str())
                    .map_err(map_err!(Read))?
                    .map(|guard| guard.value().to_string());
                if owner.is_some_and(|owner| owner != service.id) {
                    return Err(StateError::Conflict(format!(
                        "service name {} already registered",
                        service.name
                    )));
                }
                names
                    .remove(existing.name.as_str())
                    .map_err(map_err!(Write))?;
                names
                    .insert(service.name.as_str(), service.id.as_str())
                    .map_err(map_err!(Write))?;
            }
            save(&mut table, &service.id, service)
        })?;
        debug!(service_id = %service.id, "service updated");
        Ok(())
    }

    async fn delete_service(&self, id: &str) -> StateResult<()> {
        let counts = self.write(|txn| {
            let mut table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            let existing: Service = load(&table, id)?.ok_or_else(|| not_found("service", id))?;
            table.remove(id).map_err(map_err!(Write))?;

            let mut names = txn.open_table(SERVICE_NAMES).map_err(map_err!(Table))?;
            names
                .remove(existing.name.as_str())
                .map_err(map_err!(Write))?;

            let prefix = service_prefix(id);

            let mut versions = txn.open_table(VERSIONS).map_err(map_err!(Table))?;
            let version_keys: Vec<String> = load_prefix::<ServiceVersion>(&versions, &prefix)?
                .into_iter()
                .map(|(key, _)| key)
                .collect();
            for key in &version_keys {
                versions.remove(key.as_str()).map_err(map_err!(Write))?;
            }

            // Edges in both directions.
            let mut deps = txn.open_table(DEPENDENCIES).map_err(map_err!(Table))?;
            let dep_keys: Vec<String> = load_prefix::<ServiceDependency>(&deps, "")?
                .into_iter()
                .filter(|(_, dep)| dep.service_id == id || dep.dependency_id == id)
                .map(|(key, _)| key)
                .collect();
            for key in &dep_keys {
                deps.remove(key.as_str()).map_err(map_err!(Write))?;
            }

            let mut checks = txn.open_table(HEALTH_CHECKS).map_err(map_err!(Table))?;
            let check_ids: Vec<u64> = load_all_ids::<HealthCheck>(&checks)?
                .into_iter()
                .filter(|check| check.service_id == id)
                .map(|check| check.id)
                .collect();
            for check_id in &check_ids {
                checks.remove(*check_id).map_err(map_err!(Write))?;
            }

            let mut metrics = txn.open_table(CUSTOM_METRICS).map_err(map_err!(Table))?;
            let metric_keys: Vec<String> = load_prefix::<CustomHealthMetric>(&metrics, &prefix)?
                .into_iter()
                .map(|(key, _)| key)
                .collect();
            for key in &metric_keys {
                metrics.remove(key.as_str()).map_err(map_err!(Write))?;
            }

            let mut thresholds = txn.open_table(HEALTH_THRESHOLDS).map_err(map_err!(Table))?;
            let threshold_ids: Vec<u64> = load_all_ids::<HealthThreshold>(&thresholds)?
                .into_iter()
                .filter(|threshold| threshold.service_id == id)
                .map(|threshold| threshold.id)
                .collect();
            for threshold_id in &threshold_ids {
                thresholds.remove(*threshold_id).map_err(map_err!(Write))?;
            }

            Ok(DeleteCounts {
                versions: version_keys.len(),
                dependencies: dep_keys.len(),
                checks: check_ids.len(),
                metrics: metric_keys.len(),
                thresholds: threshold_ids.len(),
            })
        })?;
        debug!(
            service_id = %id,
            versions = counts.versions,
            dependencies = counts.dependencies,
            checks = counts.checks,
            metrics = counts.metrics,
            thresholds = counts.thresholds,
            "service deleted"
        );
        Ok(())
    }

    async fn update_service_status(&self, id: &str, status: ServiceStatus) -> StateResult<()> {
        self.write(|txn| {
            let mut table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            let mut service: Service =
                load(&table, id)?.ok_or_else(|| not_found("service", id))?;
            service.status = status;
            service.updated_at = epoch_millis();
            save(&mut table, id, &service)
        })?;
        debug!(service_id = %id, %status, "service status stored");
        Ok(())
    }

    async fn update_last_seen(&self, id: &str) -> StateResult<()> {
        self.write(|txn| {
            let mut table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            let mut service: Service =
                load(&table, id)?.ok_or_else(|| not_found("service", id))?;
            service.last_seen = epoch_millis();
            save(&mut table, id, &service)
        })
    }

    async fn create_version(&self, version: &ServiceVersion) -> StateResult<ServiceVersion> {
        let stored = self.write(|txn| {
            let id = next_id(txn, SEQ_VERSIONS)?;
            let mut table = txn.open_table(VERSIONS).map_err(map_err!(Table))?;
            let key = version.table_key();
            if load::<ServiceVersion>(&table, &key)?.is_some() {
                return Err(StateError::Conflict(format!(
                    "version {} already exists for service {}",
                    version.version, version.service_id
                )));
            }
            if version.is_active {
                let now = epoch_millis();
                for (sibling_key, mut sibling) in
                    load_prefix::<ServiceVersion>(&table, &service_prefix(&version.service_id))?
                {
                    if sibling.is_active {
                        sibling.is_active = false;
                        sibling.updated_at = now;
                        save(&mut table, &sibling_key, &sibling)?;
                    }
                }
            }
            let stored = ServiceVersion {
                id,
                ..version.clone()
            };
            save(&mut table, &key, &stored)?;
            Ok(stored)
        })?;
        debug!(service_id = %stored.service_id, version = %stored.version, "version stored");
        Ok(stored)
    }

    async fn get_version(&self, service_id: &str, version: &str) -> StateResult<ServiceVersion> {
        let key = version_key(service_id, version);
        self.read_one(VERSIONS, &key)?
            .ok_or_else(|| not_found("version", &key))
    }

    async fn list_versions(&self, service_id: &str) -> StateResult<Vec<ServiceVersion>> {
        let mut versions: Vec<ServiceVersion> =
            self.read_prefix(VERSIONS, &service_prefix(service_id))?;
        versions.sort_by_key(|v| v.id);
        Ok(versions)
    }

    async fn activate_version(&self, service_id: &str, version: &str) -> StateResult<()> {
        self.write(|txn| {
            let mut table = txn.open_table(VERSIONS).map_err(map_err!(Table))?;
            let target = version_key(service_id, version);
            if load::<ServiceVersion>(&table, &target)?.is_none() {
                return Err(not_found("version", &target));
            }
            let now = epoch_millis();
            for (key, mut sibling) in
                load_prefix::<ServiceVersion>(&table, &service_prefix(service_id))?
            {
                let active = key == target;
                if sibling.is_active != active {
                    sibling.is_active = active;
                    sibling.updated_at = now;
                    save(&mut table, &key, &sibling)?;
                }
            }
            Ok(())
        })?;
        debug!(%service_id, %version, "version activated");
        Ok(())
    }

    async fn add_dependency(
        &self,
        dependency: &ServiceDependency,
    ) -> StateResult<ServiceDependency> {
        self.write(|txn| {
            let id = next_id(txn, SEQ_DEPENDENCIES)?;
            let mut table = txn.open_table(DEPENDENCIES).map_err(map_err!(Table))?;
            let key = dependency.table_key();
            if load::<ServiceDependency>(&table, &key)?.is_some() {
                return Err(StateError::Conflict(format!(
                    "dependency {} -> {} already exists",
                    dependency.service_id, dependency.dependency_id
                )));
            }
            let stored = ServiceDependency {
                id,
                ..dependency.clone()
            };
            save(&mut table, &key, &stored)?;
            Ok(stored)
        })
    }

    async fn list_dependencies(&self, service_id: &str) -> StateResult<Vec<ServiceDependency>> {
        let mut deps: Vec<ServiceDependency> =
            self.read_prefix(DEPENDENCIES, &service_prefix(service_id))?;
        deps.sort_by_key(|d| d.id);
        Ok(deps)
    }

    async fn list_dependents(&self, dependency_id: &str) -> StateResult<Vec<ServiceDependency>> {
        let mut deps: Vec<ServiceDependency> = self
            .read_prefix(DEPENDENCIES, "")?
            .into_iter()
            .filter(|d: &ServiceDependency| d.dependency_id == dependency_id)
            .collect();
        deps.sort_by_key(|d| d.id);
        Ok(deps)
    }

    async fn remove_dependency(&self, service_id: &str, dependency_id: &str) -> StateResult<()> {
        let key = dependency_key(service_id, dependency_id);
        self.write(|txn| {
            let mut table = txn.open_table(DEPENDENCIES).map_err(map_err!(Table))?;
            let existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
            if existed {
                Ok(())
            } else {
                Err(not_found("dependency", &key))
            }
        })
    }
}

// ── Health ────────────────────────────────────────────────────────

#[async_trait]
impl HealthStore for StateStore {
    async fn create_check(&self, check: &HealthCheck) -> StateResult<HealthCheck> {
        let stored = self.write(|txn| {
            let id = next_id(txn, SEQ_HEALTH_CHECKS)?;
            let mut table = txn.open_table(HEALTH_CHECKS).map_err(map_err!(Table))?;
            let stored = HealthCheck {
                id,
                ..check.clone()
            };
            save_id(&mut table, id, &stored)?;
            Ok(stored)
        })?;
        debug!(check_id = stored.id, service_id = %stored.service_id, "health check stored");
        Ok(stored)
    }

    async fn get_check(&self, id: CheckId) -> StateResult<HealthCheck> {
        self.read_by_id(HEALTH_CHECKS, id)?
            .ok_or_else(|| not_found("health check", id))
    }

    async fn list_checks(&self, service_id: &str) -> StateResult<Vec<HealthCheck>> {
        Ok(self
            .read_all_ids(HEALTH_CHECKS)?
            .into_iter()
            .filter(|c: &HealthCheck| c.service_id == service_id)
            .collect())
    }

    async fn update_check(&self, check: &HealthCheck) -> StateResult<()> {
        self.write(|txn| {
            let mut table = txn.open_table(HEALTH_CHECKS).map_err(map_err!(Table))?;
            if load_id::<HealthCheck>(&table, check.id)?.is_none() {
                return Err(not_found("health check", check.id));
            }
            save_id(&mut table, check.id, check)
        })
    }

    async fn delete_check(&self, id: CheckId) -> StateResult<()> {
        self.write(|txn| {
            let mut table = txn.open_table(HEALTH_CHECKS).map_err(map_err!(Table))?;
            let existed = table.remove(id).map_err(map_err!(Write))?.is_some();
            if existed {
                Ok(())
            } else {
                Err(not_found("health check", id))
            }
        })
    }

    async fn list_enabled_active_checks(&self) -> StateResult<Vec<HealthCheck>> {
        Ok(self
            .read_all_ids(HEALTH_CHECKS)?
            .into_iter()
            .filter(HealthCheck::is_schedulable)
            .collect())
    }

    async fn increment_check_failures(&self, id: CheckId) -> StateResult<HealthCheck> {
        self.write(|txn| {
            let mut table = txn.open_table(HEALTH_CHECKS).map_err(map_err!(Table))?;
            let mut check: HealthCheck =
                load_id(&table, id)?.ok_or_else(|| not_found("health check", id))?;
            check.timeout_count = check.timeout_count.saturating_add(1);
            save_id(&mut table, id, &check)?;
            Ok(check)
        })
    }

    async fn reset_check_failures(&self, id: CheckId) -> StateResult<()> {
        self.write(|txn| {
            let mut table = txn.open_table(HEALTH_CHECKS).map_err(map_err!(Table))?;
            let mut check: HealthCheck =
                load_id(&table, id)?.ok_or_else(|| not_found("health check", id))?;
            if check.timeout_count != 0 {
                check.timeout_count = 0;
                save_id(&mut table, id, &check)?;
            }
            Ok(())
        })
    }

    async fn record_history(&self, entry: &HealthHistory) -> StateResult<HealthHistory> {
        self.write(|txn| {
            let id = next_id(txn, SEQ_HEALTH_HISTORY)?;
            let mut table = txn.open_table(HEALTH_HISTORY).map_err(map_err!(Table))?;
            let stored = HealthHistory {
                id,
                ..entry.clone()
            };
            save(&mut table, &stored.table_key(), &stored)?;
            Ok(stored)
        })
    }

    async fn list_history(
        &self,
        service_id: &str,
        query: &HistoryQuery,
    ) -> StateResult<Page<HealthHistory>> {
        let mut rows: Vec<HealthHistory> = self
            .read_prefix(HEALTH_HISTORY, &service_prefix(service_id))?
            .into_iter()
            .filter(|h: &HealthHistory| {
                query.start_time.is_none_or(|start| h.timestamp >= start)
                    && query.end_time.is_none_or(|end| h.timestamp <= end)
                    && query.status.is_none_or(|status| h.status == status)
            })
            .collect();
        // Keys sort oldest first.
        rows.reverse();
        Ok(Page::paginate(rows, query.offset, query.limit))
    }

    async fn upsert_metric(&self, metric: &CustomHealthMetric) -> StateResult<CustomHealthMetric> {
        self.write(|txn| {
            let key = metric.table_key();
            let existing: Option<CustomHealthMetric> = {
                let table = txn.open_table(CUSTOM_METRICS).map_err(map_err!(Table))?;
                load(&table, &key)?
            };
            let now = epoch_millis();
            let stored = match existing {
                Some(prev) => CustomHealthMetric {
                    id: prev.id,
                    created_at: prev.created_at,
                    updated_at: now,
                    ..metric.clone()
                },
                None => CustomHealthMetric {
                    id: next_id(txn, SEQ_CUSTOM_METRICS)?,
                    created_at: now,
                    updated_at: now,
                    ..metric.clone()
                },
            };
            let mut table = txn.open_table(CUSTOM_METRICS).map_err(map_err!(Table))?;
            save(&mut table, &key, &stored)?;
            Ok(stored)
        })
    }

    async fn list_metrics(&self, service_id: &str) -> StateResult<Vec<CustomHealthMetric>> {
        self.read_prefix(CUSTOM_METRICS, &service_prefix(service_id))
    }

    async fn delete_metric(&self, service_id: &str, name: &str) -> StateResult<()> {
        let key = metric_key(service_id, name);
        self.write(|txn| {
            let mut table = txn.open_table(CUSTOM_METRICS).map_err(map_err!(Table))?;
            let existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
            if existed {
                Ok(())
            } else {
                Err(not_found("custom metric", &key))
            }
        })
    }

    async fn create_threshold(&self, threshold: &HealthThreshold) -> StateResult<HealthThreshold> {
        self.write(|txn| {
            let id = next_id(txn, SEQ_HEALTH_THRESHOLDS)?;
            let mut table = txn.open_table(HEALTH_THRESHOLDS).map_err(map_err!(Table))?;
            let stored = HealthThreshold {
                id,
                ..threshold.clone()
            };
            save_id(&mut table, id, &stored)?;
            Ok(stored)
        })
    }

    async fn get_threshold(&self, id: u64) -> StateResult<HealthThreshold> {
        self.read_by_id(HEALTH_THRESHOLDS, id)?
            .ok_or_else(|| not_found("health threshold", id))
    }

    async fn list_thresholds(&self, service_id: &str) -> StateResult<Vec<HealthThreshold>> {
        Ok(self
            .read_all_ids(HEALTH_THRESHOLDS)?
            .into_iter()
            .filter(|t: &HealthThreshold| service_id.is_empty() || t.service_id == service_id)
            .collect())
    }

    async fn update_threshold(&self, threshold: &HealthThreshold) -> StateResult<()> {
        self.write(|txn| {
            let mut table = txn.open_table(HEALTH_THRESHOLDS).map_err(map_err!(Table))?;
            if load_id::<HealthThreshold>(&table, threshold.id)?.is_none() {
                return Err(not_found("health threshold", threshold.id));
            }
            save_id(&mut table, threshold.id, threshold)
        })
    }

    async fn delete_threshold(&self, id: u64) -> StateResult<()> {
        self.write(|txn| {
            let mut table = txn.open_table(HEALTH_THRESHOLDS).map_err(map_err!(Table))?;
            let existed = table.remove(id).map_err(map_err!(Write))?.is_some();
            if existed {
                Ok(())
            } else {
                Err(not_found("health threshold", id))
            }
        })
    }
}

// ── Routes ────────────────────────────────────────────────────────

#[async_trait]
impl RouteStore for StateStore {
    async fn put_route(&self, route: &Route) -> StateResult<()> {
        let seq = self.write(|txn| {
            let existing: Option<Route> = {
                let table = txn.open_table(ROUTES).map_err(map_err!(Table))?;
                load(&table, &route.id)?
            };
            // An overwrite keeps its place in match order.
            let seq = match existing {
                Some(prev) if prev.seq > 0 => prev.seq,
                _ => next_id(txn, SEQ_ROUTES)?,
            };
            let stored = Route {
                seq,
                ..route.clone()
            };
            let mut table = txn.open_table(ROUTES).map_err(map_err!(Table))?;
            save(&mut table, &route.id, &stored)?;
            Ok(seq)
        })?;
        debug!(route_id = %route.id, path = %route.path, seq, "route stored");
        Ok(())
    }

    async fn get_route(&self, id: &str) -> StateResult<Route> {
        self.read_one(ROUTES, id)?
            .ok_or_else(|| not_found("route", id))
    }

    async fn list_routes(&self) -> StateResult<Vec<Route>> {
        let mut routes: Vec<Route> = self.read_prefix(ROUTES, "")?;
        routes.sort_by(|a, b| a.seq.cmp(&b.seq).then_with(|| a.id.cmp(&b.id)));
        Ok(routes)
    }

    async fn delete_route(&self, id: &str) -> StateResult<()> {
        self.write(|txn| {
            let mut table = txn.open_table(ROUTES).map_err(map_err!(Table))?;
            let existed = table.remove(id).map_err(map_err!(Write))?.is_some();
            if existed {
                Ok(())
            } else {
                Err(not_found("route", id))
            }
        })
    }

    async fn put_load_balancer(&self, config: &LoadBalancerConfig) -> StateResult<()> {
        self.write(|txn| {
            let mut table = txn.open_table(LOAD_BALANCERS).map_err(map_err!(Table))?;
            save(&mut table, &config.id, config)
        })
    }

    async fn get_load_balancer(&self, id: &str) -> StateResult<LoadBalancerConfig> {
        self.read_one(LOAD_BALANCERS, id)?
            .ok_or_else(|| not_found("load balancer", id))
    }

    async fn list_load_balancers(&self) -> StateResult<Vec<LoadBalancerConfig>> {
        self.read_prefix(LOAD_BALANCERS, "")
    }
}
