//! HealthService: health check management, passive reports, and the
//! active-check entry point used by the scheduler.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use hermes_state::*;

use crate::checker::{ProbeOutcome, Prober};
use crate::error::{HealthError, HealthResult};
use crate::status::{self, Transition};

const DEFAULT_INTERVAL_SECS: i64 = 60;
const DEFAULT_TIMEOUT_SECS: i64 = 5;
const DEFAULT_METHOD: &str = "GET";
const DEFAULT_RETRIES: u32 = 1;
const DEFAULT_THRESHOLD_COUNT: u32 = 3;

/// What one active check run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckOutcome {
    pub probe: ProbeOutcome,
    /// The check's failure counter after this run.
    pub failures: u32,
    pub transition: Transition,
}

/// Health management over the service and health stores.
#[derive(Clone)]
pub struct HealthService {
    services: Arc<dyn ServiceStore>,
    health: Arc<dyn HealthStore>,
    prober: Arc<dyn Prober>,
}

impl HealthService {
    pub fn new(
        services: Arc<dyn ServiceStore>,
        health: Arc<dyn HealthStore>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        Self {
            services,
            health,
            prober,
        }
    }

    async fn require_service(&self, service_id: &str) -> HealthResult<Service> {
        self.services.get_service(service_id).await.map_err(|e| {
            if e.is_not_found() {
                HealthError::NotFound(format!("service {service_id}"))
            } else {
                e.into()
            }
        })
    }

    // ── Checks ─────────────────────────────────────────────────────

    /// Create a check. Unset fields get defaults; active checks need an
    /// endpoint.
    pub async fn create_check(
        &self,
        service_id: &str,
        req: HealthCheckRequest,
    ) -> HealthResult<HealthCheck> {
        self.require_service(service_id).await?;

        if req.name.trim().is_empty() {
            return Err(HealthError::Validation("health check name is required".into()));
        }
        let check_type = req.check_type.unwrap_or(HealthCheckType::Active);
        if check_type == HealthCheckType::Active && req.endpoint.trim().is_empty() {
            return Err(HealthError::Validation(
                "active health checks require an endpoint".into(),
            ));
        }

        let now = epoch_millis();
        let check = HealthCheck {
            id: 0,
            service_id: service_id.to_string(),
            name: req.name,
            check_type,
            endpoint: req.endpoint,
            interval: positive_or(req.interval, DEFAULT_INTERVAL_SECS),
            timeout: positive_or(req.timeout, DEFAULT_TIMEOUT_SECS),
            method: if req.method.is_empty() {
                DEFAULT_METHOD.to_string()
            } else {
                req.method
            },
            expected_status: req.expected_status,
            expected_body: req.expected_body,
            headers: req.headers.unwrap_or_default(),
            retries: nonzero_or(req.retries, DEFAULT_RETRIES),
            threshold_count: nonzero_or(req.threshold_count, DEFAULT_THRESHOLD_COUNT),
            timeout_count: 0,
            enabled: req.enabled,
            created_at: now,
            updated_at: now,
        };

        let stored = self.health.create_check(&check).await?;
        info!(check_id = stored.id, %service_id, name = %stored.name, "health check created");
        Ok(stored)
    }

    pub async fn list_checks(&self, service_id: &str) -> HealthResult<Vec<HealthCheck>> {
        Ok(self.health.list_checks(service_id).await?)
    }

    pub async fn get_check(&self, id: CheckId) -> HealthResult<HealthCheck> {
        self.health
            .get_check(id)
            .await
            .map_err(|e| check_missing(e, id))
    }

    /// Partial update: zero and empty fields keep their stored values,
    /// `enabled` is always applied.
    pub async fn update_check(&self, id: CheckId, req: HealthCheckRequest) -> HealthResult<HealthCheck> {
        let mut check = self.get_check(id).await?;

        if !req.name.is_empty() {
            check.name = req.name;
        }
        if let Some(check_type) = req.check_type {
            check.check_type = check_type;
        }
        if !req.endpoint.is_empty() {
            check.endpoint = req.endpoint;
        }
        if req.interval > 0 {
            check.interval = req.interval;
        }
        if req.timeout > 0 {
            check.timeout = req.timeout;
        }
        if !req.method.is_empty() {
            check.method = req.method;
        }
        if req.expected_status > 0 {
            check.expected_status = req.expected_status;
        }
        if !req.expected_body.is_empty() {
            check.expected_body = req.expected_body;
        }
        if let Some(headers) = req.headers {
            check.headers = headers;
        }
        if req.retries > 0 {
            check.retries = req.retries;
        }
        if req.threshold_count > 0 {
            check.threshold_count = req.threshold_count;
        }
        check.enabled = req.enabled;
        check.updated_at = epoch_millis();

        self.health
            .update_check(&check)
            .await
            .map_err(|e| check_missing(e, id))?;
        info!(check_id = id, enabled = check.enabled, "health check updated");
        Ok(check)
    }

    pub async fn delete_check(&self, id: CheckId) -> HealthResult<()> {
        self.health
            .delete_check(id)
            .await
            .map_err(|e| check_missing(e, id))?;
        info!(check_id = id, "health check deleted");
        Ok(())
    }

    /// Enabled active checks across all services.
    pub async fn schedulable_checks(&self) -> HealthResult<Vec<HealthCheck>> {
        Ok(self.health.list_enabled_active_checks().await?)
    }

    // ── Passive reports ────────────────────────────────────────────

    /// Apply a self-reported status verbatim, append history, and upsert
    /// any attached metrics. Metric failures are logged only.
    pub async fn report(&self, service_id: &str, report: HealthReport) -> HealthResult<HealthHistory> {
        self.require_service(service_id).await?;

        self.services
            .update_service_status(service_id, report.status)
            .await?;

        let entry = HealthHistory {
            message: report.message,
            response_time_ms: report.response_time_ms,
            status_code: report.status_code,
            details: report.details,
            ..HealthHistory::new(service_id, report.status)
        };
        let stored = self.health.record_history(&entry).await?;

        for update in report.metrics {
            let name = update.name.clone();
            if let Err(e) = self.write_metric(service_id, update).await {
                error!(%service_id, metric = %name, error = %e, "failed to update custom metric");
            }
        }

        info!(%service_id, status = %stored.status, "service health reported");
        Ok(stored)
    }

    // ── Active checks ──────────────────────────────────────────────

    /// Probe once and apply the outcome to the check and its service.
    ///
    /// Failure handling errors (counter increment, status write) are
    /// returned; on the success path they are only logged.
    pub async fn run_active_check(&self, check: &HealthCheck) -> HealthResult<CheckOutcome> {
        debug!(check_id = check.id, service_id = %check.service_id, "running active health check");

        let probe = self.prober.probe(check).await;
        if probe.is_success() {
            Ok(self.handle_success(check, probe).await)
        } else {
            self.handle_failure(check, probe).await
        }
    }

    async fn handle_success(&self, check: &HealthCheck, probe: ProbeOutcome) -> CheckOutcome {
        if let Err(e) = self.health.reset_check_failures(check.id).await {
            error!(check_id = check.id, error = %e, "failed to reset health check failures");
        }

        let entry = HealthHistory {
            check_id: Some(check.id),
            response_time_ms: probe.response_time_ms,
            status_code: probe.status_code,
            ..HealthHistory::new(&check.service_id, ServiceStatus::Healthy)
        };
        if let Err(e) = self.health.record_history(&entry).await {
            error!(check_id = check.id, error = %e, "failed to record health history");
        }

        let mut outcome = CheckOutcome {
            probe,
            failures: 0,
            transition: Transition::Unchanged,
        };

        let service = match self.services.get_service(&check.service_id).await {
            Ok(service) => service,
            Err(e) => {
                error!(service_id = %check.service_id, error = %e, "failed to load service");
                return outcome;
            }
        };

        outcome.transition = status::on_success(service.status);
        if let Some(target) = outcome.transition.target() {
            info!(
                service_id = %service.id,
                from = %service.status,
                reason = status::RECOVERED_MESSAGE,
                "service recovered, marking HEALTHY"
            );
            if let Err(e) = self
                .services
                .update_service_status(&service.id, target)
                .await
            {
                error!(service_id = %service.id, error = %e, "failed to update service status");
            }
        }
        outcome
    }

    async fn handle_failure(&self, check: &HealthCheck, probe: ProbeOutcome) -> HealthResult<CheckOutcome> {
        let updated = self.health.increment_check_failures(check.id).await?;

        let entry = HealthHistory {
            check_id: Some(check.id),
            message: status::CHECK_FAILED_MESSAGE.to_string(),
            response_time_ms: probe.response_time_ms,
            status_code: probe.status_code,
            ..HealthHistory::new(&check.service_id, ServiceStatus::Unhealthy)
        };
        if let Err(e) = self.health.record_history(&entry).await {
            error!(check_id = check.id, error = %e, "failed to record health history");
        }

        let transition = status::on_failure(updated.timeout_count, updated.threshold_count);
        if let Some(target) = transition.target() {
            warn!(
                service_id = %check.service_id,
                failures = updated.timeout_count,
                threshold = updated.threshold_count,
                reason = %status::threshold_message(&check.name, updated.timeout_count),
                "health check failures reached threshold, marking UNHEALTHY"
            );
            self.services
                .update_service_status(&check.service_id, target)
                .await?;
        } else {
            debug!(
                check_id = check.id,
                failures = updated.timeout_count,
                threshold = updated.threshold_count,
                result = ?probe.result,
                "health check failed below threshold"
            );
        }

        Ok(CheckOutcome {
            probe,
            failures: updated.timeout_count,
            transition,
        })
    }

    // ── History ────────────────────────────────────────────────────

    /// Newest-first history. Rows outlive their service.
    pub async fn history(&self, service_id: &str, query: &HistoryQuery) -> HealthResult<Page<HealthHistory>> {
        Ok(self.health.list_history(service_id, query).await?)
    }

    // ── Custom metrics ─────────────────────────────────────────────

    pub async fn list_metrics(&self, service_id: &str) -> HealthResult<Vec<CustomHealthMetric>> {
        Ok(self.health.list_metrics(service_id).await?)
    }

    /// Insert or replace the latest value of a named metric.
    pub async fn upsert_metric(
        &self,
        service_id: &str,
        update: MetricUpdate,
    ) -> HealthResult<CustomHealthMetric> {
        self.require_service(service_id).await?;
        self.write_metric(service_id, update).await
    }

    async fn write_metric(
        &self,
        service_id: &str,
        update: MetricUpdate,
    ) -> HealthResult<CustomHealthMetric> {
        if update.name.trim().is_empty() {
            return Err(HealthError::Validation("metric name is required".into()));
        }
        let previous = self
            .health
            .list_metrics(service_id)
            .await?
            .into_iter()
            .find(|m| m.name == update.name);
        let metric = merge_metric(service_id, previous, update);
        Ok(self.health.upsert_metric(&metric).await?)
    }

    pub async fn delete_metric(&self, service_id: &str, name: &str) -> HealthResult<()> {
        self.health
            .delete_metric(service_id, name)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    HealthError::NotFound(format!("metric {name} of service {service_id}"))
                } else {
                    e.into()
                }
            })
    }

    // ── Thresholds ─────────────────────────────────────────────────

    pub async fn create_threshold(
        &self,
        service_id: &str,
        req: ThresholdRequest,
    ) -> HealthResult<HealthThreshold> {
        self.require_service(service_id).await?;
        if req.metric_name.trim().is_empty() {
            return Err(HealthError::Validation("metric name is required".into()));
        }
        let now = epoch_millis();
        let threshold = HealthThreshold {
            id: 0,
            service_id: service_id.to_string(),
            metric_name: req.metric_name,
            warning_value: req.warning_value,
            critical_value: req.critical_value,
            comparison_type: req.comparison_type.unwrap_or_default(),
            created_at: now,
            updated_at: now,
        };
        let stored = self.health.create_threshold(&threshold).await?;
        info!(threshold_id = stored.id, %service_id, metric = %stored.metric_name, "health threshold created");
        Ok(stored)
    }

    /// Thresholds of one service; an empty ID lists all of them.
    pub async fn list_thresholds(&self, service_id: &str) -> HealthResult<Vec<HealthThreshold>> {
        Ok(self.health.list_thresholds(service_id).await?)
    }

    /// Warning and critical values are always replaced; name and
    /// comparison only when supplied.
    pub async fn update_threshold(&self, id: u64, req: ThresholdRequest) -> HealthResult<HealthThreshold> {
        let mut threshold = self
            .health
            .get_threshold(id)
            .await
            .map_err(|e| threshold_missing(e, id))?;

        if !req.metric_name.is_empty() {
            threshold.metric_name = req.metric_name;
        }
        threshold.warning_value = req.warning_value;
        threshold.critical_value = req.critical_value;
        if let Some(comparison) = req.comparison_type {
            threshold.comparison_type = comparison;
        }
        threshold.updated_at = epoch_millis();

        self.health
            .update_threshold(&threshold)
            .await
            .map_err(|e| threshold_missing(e, id))?;
        Ok(threshold)
    }

    pub async fn delete_threshold(&self, id: u64) -> HealthResult<()> {
        self.health
            .delete_threshold(id)
            .await
            .map_err(|e| threshold_missing(e, id))
    }
}

fn positive_or(value: i64, default: i64) -> i64 {
    if value > 0 { value } else { default }
}

fn nonzero_or(value: u32, default: u32) -> u32 {
    if value > 0 { value } else { default }
}

fn check_missing(e: StateError, id: CheckId) -> HealthError {
    if e.is_not_found() {
        HealthError::NotFound(format!("health check {id}"))
    } else {
        e.into()
    }
}

fn threshold_missing(e: StateError, id: u64) -> HealthError {
    if e.is_not_found() {
        HealthError::NotFound(format!("health threshold {id}"))
    } else {
        e.into()
    }
}

/// Value and unit always replace; description and thresholds only when
/// the update carries them.
fn merge_metric(
    service_id: &str,
    previous: Option<CustomHealthMetric>,
    update: MetricUpdate,
) -> CustomHealthMetric {
    let (description, warning, critical) = match &previous {
        Some(prev) => (
            update.description.unwrap_or_else(|| prev.description.clone()),
            update.warning_threshold.or(prev.warning_threshold),
            update.critical_threshold.or(prev.critical_threshold),
        ),
        None => (
            update.description.unwrap_or_default(),
            update.warning_threshold,
            update.critical_threshold,
        ),
    };
    CustomHealthMetric {
        id: previous.as_ref().map_or(0, |p| p.id),
        service_id: service_id.to_string(),
        name: update.name,
        description,
        value: update.value,
        unit: update.unit,
        warning_threshold: warning,
        critical_threshold: critical,
        created_at: 0,
        updated_at: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashMap, VecDeque};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::checker::ProbeResult;

    /// Prober that replays a fixed script of outcomes.
    struct ScriptedProber {
        script: Mutex<VecDeque<ProbeResult>>,
    }

    impl ScriptedProber {
        fn new(script: &[ProbeResult]) -> Self {
            Self {
                script: Mutex::new(script.iter().copied().collect()),
            }
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, _check: &HealthCheck) -> ProbeOutcome {
            let result = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ProbeResult::Passed);
            ProbeOutcome {
                result,
                status_code: if result == ProbeResult::Passed { 200 } else { 0 },
                response_time_ms: 3,
            }
        }
    }

    async fn setup(script: &[ProbeResult]) -> (HealthService, StateStore, Service) {
        let store = StateStore::open_in_memory().unwrap();
        let now = epoch_millis();
        let service = Service {
            id: "svc-1".to_string(),
            name: "orders".to_string(),
            description: String::new(),
            endpoint: "http://orders:8080".to_string(),
            status: ServiceStatus::Unknown,
            service_type: "http".to_string(),
            metadata: HashMap::new(),
            tags: BTreeSet::new(),
            registered_by: "self".to_string(),
            last_seen: now,
            created_at: now,
            updated_at: now,
        };
        store.create_service(&service).await.unwrap();
        let health = HealthService::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(ScriptedProber::new(script)),
        );
        (health, store, service)
    }

    fn active_request() -> HealthCheckRequest {
        HealthCheckRequest {
            name: "ping".into(),
            endpoint: "http://orders:8080/healthz".into(),
            interval: 5,
            timeout: 2,
            expected_status: 200,
            threshold_count: 3,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_check_applies_defaults() {
        let (health, _, svc) = setup(&[]).await;
        let check = health
            .create_check(
                &svc.id,
                HealthCheckRequest {
                    name: "ping".into(),
                    endpoint: "http://orders:8080/healthz".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(check.check_type, HealthCheckType::Active);
        assert_eq!(check.interval, 60);
        assert_eq!(check.timeout, 5);
        assert_eq!(check.method, "GET");
        assert_eq!(check.retries, 1);
        assert_eq!(check.threshold_count, 3);
        assert!(check.enabled);
    }

    #[tokio::test]
    async fn create_check_validates() {
        let (health, _, svc) = setup(&[]).await;

        let err = health
            .create_check("svc-missing", active_request())
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = health
            .create_check(
                &svc.id,
                HealthCheckRequest {
                    name: "ping".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HealthError::Validation(_)));

        // Passive checks need no endpoint.
        health
            .create_check(
                &svc.id,
                HealthCheckRequest {
                    name: "self-report".into(),
                    check_type: Some(HealthCheckType::Passive),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn update_check_is_partial_except_enabled() {
        let (health, _, svc) = setup(&[]).await;
        let check = health.create_check(&svc.id, active_request()).await.unwrap();

        let updated = health
            .update_check(
                check.id,
                HealthCheckRequest {
                    timeout: 9,
                    enabled: false,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.timeout, 9);
        assert_eq!(updated.name, "ping");
        assert_eq!(updated.interval, 5);
        assert!(!updated.enabled);

        assert!(health.schedulable_checks().await.unwrap().is_empty());
        assert!(
            health
                .update_check(999, HealthCheckRequest::default())
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn passive_report_applies_status_verbatim() {
        let (health, store, svc) = setup(&[]).await;

        let entry = health
            .report(
                &svc.id,
                HealthReport {
                    status: ServiceStatus::Warning,
                    message: "disk 91%".into(),
                    metrics: vec![MetricUpdate {
                        name: "disk_used".into(),
                        value: 91.0,
                        unit: "%".into(),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(entry.status, ServiceStatus::Warning);
        assert_eq!(entry.check_id, None);
        assert_eq!(store.get_service(&svc.id).await.unwrap().status, ServiceStatus::Warning);
        let metrics = health.list_metrics(&svc.id).await.unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].value, 91.0);

        let err = health
            .report("svc-missing", HealthReport::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn report_with_bad_metric_still_succeeds() {
        let (health, store, svc) = setup(&[]).await;
        health
            .report(
                &svc.id,
                HealthReport {
                    status: ServiceStatus::Healthy,
                    metrics: vec![MetricUpdate::default()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(store.get_service(&svc.id).await.unwrap().status, ServiceStatus::Healthy);
        assert!(health.list_metrics(&svc.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failures_trip_threshold_then_success_recovers() {
        use ProbeResult::*;
        let (health, store, svc) = setup(&[Passed, Failed, TimedOut, StatusMismatch, Passed]).await;
        let check = health.create_check(&svc.id, active_request()).await.unwrap();

        let outcome = health.run_active_check(&check).await.unwrap();
        assert_eq!(outcome.transition, Transition::Recovered);
        assert_eq!(store.get_service(&svc.id).await.unwrap().status, ServiceStatus::Healthy);

        let outcome = health.run_active_check(&check).await.unwrap();
        assert_eq!(outcome.failures, 1);
        assert_eq!(outcome.transition, Transition::Unchanged);
        health.run_active_check(&check).await.unwrap();
        // Two failures: displayed status unchanged.
        assert_eq!(store.get_service(&svc.id).await.unwrap().status, ServiceStatus::Healthy);

        let outcome = health.run_active_check(&check).await.unwrap();
        assert_eq!(outcome.failures, 3);
        assert_eq!(outcome.transition, Transition::ThresholdReached);
        assert_eq!(store.get_service(&svc.id).await.unwrap().status, ServiceStatus::Unhealthy);

        let outcome = health.run_active_check(&check).await.unwrap();
        assert_eq!(outcome.transition, Transition::Recovered);
        assert_eq!(store.get_service(&svc.id).await.unwrap().status, ServiceStatus::Healthy);
        assert_eq!(health.get_check(check.id).await.unwrap().timeout_count, 0);

        let history = health
            .history(&svc.id, &HistoryQuery::default())
            .await
            .unwrap();
        assert_eq!(history.total, 5);
        let failed = history
            .items
            .iter()
            .filter(|h| h.status == ServiceStatus::Unhealthy)
            .count();
        assert_eq!(failed, 3);
        assert!(history.items.iter().all(|h| h.check_id == Some(check.id)));
    }

    #[tokio::test]
    async fn failure_on_deleted_check_is_error() {
        let (health, _, svc) = setup(&[ProbeResult::Failed]).await;
        let check = health.create_check(&svc.id, active_request()).await.unwrap();
        health.delete_check(check.id).await.unwrap();

        let err = health.run_active_check(&check).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn metric_upsert_keeps_thresholds_when_omitted() {
        let (health, _, svc) = setup(&[]).await;
        health
            .upsert_metric(
                &svc.id,
                MetricUpdate {
                    name: "latency".into(),
                    value: 10.0,
                    unit: "ms".into(),
                    warning_threshold: Some(100.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let metric = health
            .upsert_metric(
                &svc.id,
                MetricUpdate {
                    name: "latency".into(),
                    value: 250.0,
                    unit: "ms".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(metric.value, 250.0);
        assert_eq!(metric.warning_threshold, Some(100.0));
        assert_eq!(health.list_metrics(&svc.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn threshold_lifecycle() {
        let (health, _, svc) = setup(&[]).await;
        let threshold = health
            .create_threshold(
                &svc.id,
                ThresholdRequest {
                    metric_name: "latency".into(),
                    warning_value: 100.0,
                    critical_value: 500.0,
                    comparison_type: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(threshold.comparison_type, ComparisonType::GreaterThan);

        let updated = health
            .update_threshold(
                threshold.id,
                ThresholdRequest {
                    warning_value: 50.0,
                    critical_value: 80.0,
                    comparison_type: Some(ComparisonType::LessThan),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.metric_name, "latency");
        assert_eq!(updated.comparison_type, ComparisonType::LessThan);

        assert_eq!(health.list_thresholds("").await.unwrap().len(), 1);
        health.delete_threshold(threshold.id).await.unwrap();
        assert!(health.delete_threshold(threshold.id).await.unwrap_err().is_not_found());
    }
}
