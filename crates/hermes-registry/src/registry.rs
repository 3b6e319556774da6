//! ServiceRegistry: business rules over the service store.
//!
//! The store guarantees atomicity of single writes and uniqueness of
//! keys; the registry adds request validation, ID assignment, the
//! dependency graph rules, and discovery post-processing.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use hermes_state::*;

use crate::error::{RegistryError, RegistryResult};

const DEFAULT_REGISTERED_BY: &str = "self";
const ID_ATTEMPTS: usize = 3;

/// Registry of services, their versions, and their dependency edges.
#[derive(Clone)]
pub struct ServiceRegistry {
    store: Arc<dyn ServiceStore>,
}

impl ServiceRegistry {
    pub fn new(store: Arc<dyn ServiceStore>) -> Self {
        Self { store }
    }

    // ── Services ───────────────────────────────────────────────────

    /// Register a new service. Its status starts as `UNKNOWN`.
    pub async fn register(&self, reg: ServiceRegistration) -> RegistryResult<Service> {
        if reg.name.trim().is_empty() {
            return Err(RegistryError::Validation("service name is required".into()));
        }
        if reg.endpoint.trim().is_empty() {
            return Err(RegistryError::Validation("service endpoint is required".into()));
        }

        match self.store.get_service_by_name(&reg.name).await {
            Ok(_) => return Err(RegistryError::DuplicateName(reg.name)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let now = epoch_millis();
        let registered_by = if reg.registered_by.is_empty() {
            DEFAULT_REGISTERED_BY.to_string()
        } else {
            reg.registered_by
        };
        let service = Service {
            id: new_service_id(),
            name: reg.name,
            description: reg.description,
            endpoint: reg.endpoint,
            status: ServiceStatus::Unknown,
            service_type: reg.service_type,
            metadata: reg.metadata,
            tags: reg.tags.into_iter().collect(),
            registered_by,
            last_seen: now,
            created_at: now,
            updated_at: now,
        };

        let service = self.insert_service(service, new_service_id).await?;
        info!(service_id = %service.id, name = %service.name, "service registered");
        Ok(service)
    }

    /// Store a new service, drawing a fresh id from `next_id` when the
    /// current one is taken. A name conflict is never retried.
    async fn insert_service(
        &self,
        mut service: Service,
        mut next_id: impl FnMut() -> ServiceId,
    ) -> RegistryResult<Service> {
        let mut attempt = 1;
        loop {
            let reason = match self.store.create_service(&service).await {
                Ok(()) => return Ok(service),
                Err(StateError::Conflict(reason)) => reason,
                Err(e) => return Err(e.into()),
            };
            // A concurrent registration of the same name loses here.
            match self.store.get_service_by_name(&service.name).await {
                Ok(_) => return Err(RegistryError::DuplicateName(service.name)),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
            if attempt == ID_ATTEMPTS {
                return Err(StateError::Conflict(reason).into());
            }
            warn!(service_id = %service.id, attempt, "service id already in use, retrying");
            service.id = next_id();
            attempt += 1;
        }
    }

    pub async fn get(&self, id: &str) -> RegistryResult<Service> {
        self.store
            .get_service(id)
            .await
            .map_err(missing("service", id))
    }

    pub async fn get_by_name(&self, name: &str) -> RegistryResult<Service> {
        self.store
            .get_service_by_name(name)
            .await
            .map_err(missing("service named", name))
    }

    /// Filtered, paginated listing. `total` counts every match.
    pub async fn list(&self, query: &ServiceQuery) -> RegistryResult<Page<Service>> {
        Ok(self.store.list_services(query).await?)
    }

    /// Apply a partial update. A new name is accepted only if unused.
    pub async fn update(&self, id: &str, update: ServiceUpdate) -> RegistryResult<Service> {
        let mut service = self.get(id).await?;

        if let Some(name) = update.name.filter(|n| *n != service.name) {
            if name.trim().is_empty() {
                return Err(RegistryError::Validation("service name is required".into()));
            }
            match self.store.get_service_by_name(&name).await {
                Ok(_) => return Err(RegistryError::DuplicateName(name)),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
            service.name = name;
        }
        if let Some(description) = update.description {
            service.description = description;
        }
        if let Some(endpoint) = update.endpoint {
            service.endpoint = endpoint;
        }
        if let Some(service_type) = update.service_type {
            service.service_type = service_type;
        }
        if let Some(metadata) = update.metadata {
            service.metadata = metadata;
        }
        if let Some(tags) = update.tags {
            service.tags = tags.into_iter().collect();
        }
        service.updated_at = epoch_millis();

        self.store
            .update_service(&service)
            .await
            .map_err(|e| match e {
                StateError::Conflict(_) => RegistryError::DuplicateName(service.name.clone()),
                StateError::NotFound(_) => RegistryError::NotFound(format!("service {id}")),
                other => other.into(),
            })?;

        info!(service_id = %service.id, name = %service.name, "service updated");
        Ok(service)
    }

    /// Delete a service and everything hanging off it except history.
    pub async fn delete(&self, id: &str) -> RegistryResult<()> {
        self.store
            .delete_service(id)
            .await
            .map_err(missing("service", id))?;
        info!(service_id = %id, "service deleted");
        Ok(())
    }

    /// Record that the service was seen just now.
    pub async fn touch(&self, id: &str) -> RegistryResult<()> {
        self.store
            .update_last_seen(id)
            .await
            .map_err(missing("service", id))?;
        debug!(service_id = %id, "service last-seen updated");
        Ok(())
    }

    /// Administrative status override.
    pub async fn update_status(&self, id: &str, status: ServiceStatus) -> RegistryResult<()> {
        self.store
            .update_service_status(id, status)
            .await
            .map_err(missing("service", id))?;
        info!(service_id = %id, %status, "service status updated");
        Ok(())
    }

    // ── Discovery ──────────────────────────────────────────────────

    /// Advanced search. Every filter is applied before pagination, so
    /// `total` is the number of services matching all of them.
    pub async fn discover(&self, query: &DiscoveryQuery) -> RegistryResult<Page<Service>> {
        let mut services = self.store.search_services(query).await?;

        let dependency_id = non_empty(&query.dependency_id);
        let dependency_of = non_empty(&query.dependency_of);

        if let Some(target) = dependency_id {
            let dependents: HashSet<String> = self
                .store
                .list_dependents(target)
                .await?
                .into_iter()
                .map(|d| d.service_id)
                .collect();
            services.retain(|s| dependents.contains(&s.id));
        }
        if let Some(owner) = dependency_of {
            let dependencies: HashSet<String> = self
                .store
                .list_dependencies(owner)
                .await?
                .into_iter()
                .map(|d| d.dependency_id)
                .collect();
            services.retain(|s| dependencies.contains(&s.id));
        }

        let mut page = Page::paginate(services, query.base.offset, query.base.limit);

        if query.include_versions {
            for service in &mut page.items {
                let versions = self.store.list_versions(&service.id).await?;
                annotate_versions(service, versions, query);
            }
        }

        if dependency_id.is_some() || dependency_of.is_some() {
            for service in &mut page.items {
                match self.store.list_dependencies(&service.id).await {
                    Ok(deps) => annotate_dependencies(service, &deps),
                    Err(e) => {
                        warn!(service_id = %service.id, error = %e, "failed to load dependencies for discovery");
                    }
                }
            }
        }

        Ok(page)
    }

    // ── Versions ───────────────────────────────────────────────────

    /// Add a version. The first version of a service is always active;
    /// an active request deactivates the others.
    pub async fn add_version(
        &self,
        service_id: &str,
        req: VersionRequest,
    ) -> RegistryResult<ServiceVersion> {
        if req.version.trim().is_empty() {
            return Err(RegistryError::Validation("version is required".into()));
        }
        if req.endpoint.trim().is_empty() {
            return Err(RegistryError::Validation("version endpoint is required".into()));
        }
        self.get(service_id).await?;

        match self.store.get_version(service_id, &req.version).await {
            Ok(_) => {
                return Err(RegistryError::DuplicateVersion {
                    service_id: service_id.to_string(),
                    version: req.version,
                });
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let is_first = self.store.list_versions(service_id).await?.is_empty();
        let now = epoch_millis();
        let version = ServiceVersion {
            id: 0,
            service_id: service_id.to_string(),
            version: req.version,
            is_active: req.is_active || is_first,
            endpoint: req.endpoint,
            description: req.description,
            created_at: now,
            updated_at: now,
        };

        let stored = self
            .store
            .create_version(&version)
            .await
            .map_err(|e| match e {
                StateError::Conflict(_) => RegistryError::DuplicateVersion {
                    service_id: service_id.to_string(),
                    version: version.version.clone(),
                },
                other => other.into(),
            })?;

        info!(%service_id, version = %stored.version, active = stored.is_active, "service version added");
        Ok(stored)
    }

    pub async fn list_versions(&self, service_id: &str) -> RegistryResult<Vec<ServiceVersion>> {
        self.get(service_id).await?;
        Ok(self.store.list_versions(service_id).await?)
    }

    /// Make `version` the single active version of the service.
    pub async fn activate_version(&self, service_id: &str, version: &str) -> RegistryResult<()> {
        self.get(service_id).await?;
        self.store
            .activate_version(service_id, version)
            .await
            .map_err(missing("version", version))?;
        info!(%service_id, %version, "service version activated");
        Ok(())
    }

    // ── Dependencies ───────────────────────────────────────────────

    /// Add the edge `service_id → req.dependency_id`.
    ///
    /// Both services must exist and the type must be exactly `REQUIRED`
    /// or `OPTIONAL`. Only a direct back-edge (`dependency_id →
    /// service_id`) is rejected as circular; longer cycles are accepted.
    pub async fn add_dependency(
        &self,
        service_id: &str,
        req: DependencyRequest,
    ) -> RegistryResult<ServiceDependency> {
        self.store
            .get_service(service_id)
            .await
            .map_err(missing("source service", service_id))?;
        self.store
            .get_service(&req.dependency_id)
            .await
            .map_err(missing("dependency service", &req.dependency_id))?;

        let dependency_type: DependencyType = req
            .dependency_type
            .parse()
            .map_err(RegistryError::Validation)?;

        let back_edges = self.store.list_dependencies(&req.dependency_id).await?;
        if back_edges.iter().any(|d| d.dependency_id == service_id) {
            return Err(RegistryError::CircularDependency {
                service_id: service_id.to_string(),
                dependency_id: req.dependency_id,
            });
        }

        let edge = ServiceDependency {
            id: 0,
            service_id: service_id.to_string(),
            dependency_id: req.dependency_id,
            dependency_type,
            description: req.description,
            created_at: epoch_millis(),
        };
        let stored = self
            .store
            .add_dependency(&edge)
            .await
            .map_err(|e| match e {
                StateError::Conflict(_) => RegistryError::DuplicateDependency {
                    service_id: edge.service_id.clone(),
                    dependency_id: edge.dependency_id.clone(),
                },
                other => other.into(),
            })?;

        info!(
            %service_id,
            dependency_id = %stored.dependency_id,
            dependency_type = %stored.dependency_type,
            "service dependency added"
        );
        Ok(stored)
    }

    /// Outgoing edges of a service.
    pub async fn list_dependencies(&self, service_id: &str) -> RegistryResult<Vec<ServiceDependency>> {
        self.get(service_id).await?;
        Ok(self.store.list_dependencies(service_id).await?)
    }

    /// Incoming edges: services that depend on `service_id`.
    pub async fn list_dependents(&self, service_id: &str) -> RegistryResult<Vec<ServiceDependency>> {
        self.get(service_id).await?;
        Ok(self.store.list_dependents(service_id).await?)
    }

    pub async fn remove_dependency(&self, service_id: &str, dependency_id: &str) -> RegistryResult<()> {
        self.store
            .remove_dependency(service_id, dependency_id)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    RegistryError::DependencyNotFound
                } else {
                    e.into()
                }
            })?;
        info!(%service_id, %dependency_id, "service dependency removed");
        Ok(())
    }
}

/// `svc-` followed by the first 8 hex characters of a random UUID.
fn new_service_id() -> ServiceId {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("svc-{}", &uuid[..8])
}

/// Map a store `NotFound` to a registry `NotFound` naming the record.
fn missing(what: &str, key: &str) -> impl FnOnce(StateError) -> RegistryError {
    move |e| {
        if e.is_not_found() {
            RegistryError::NotFound(format!("{what} {key}"))
        } else {
            RegistryError::State(e)
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn annotate_versions(service: &mut Service, versions: Vec<ServiceVersion>, query: &DiscoveryQuery) {
    let wanted = non_empty(&query.version);
    let selected = versions
        .into_iter()
        .filter(|v| wanted.is_none_or(|w| v.version == w))
        .filter(|v| !query.active_version_only || v.is_active);
    for (i, v) in selected.enumerate() {
        service.metadata.insert(format!("version_{i}"), v.version.clone());
        service
            .metadata
            .insert(format!("version_{i}_endpoint"), v.endpoint.clone());
        if v.is_active {
            service
                .metadata
                .insert("active_version".to_string(), v.version);
        }
    }
}

fn annotate_dependencies(service: &mut Service, deps: &[ServiceDependency]) {
    for (i, dep) in deps.iter().enumerate() {
        service
            .metadata
            .insert(format!("dependency_{i}"), dep.dependency_id.clone());
        service
            .metadata
            .insert(format!("dependency_{i}_type"), dep.dependency_type.to_string());
    }
}
