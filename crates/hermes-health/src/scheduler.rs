//! Health check scheduler: runs active checks on their intervals.
//!
//! A supervisor task ticks at a coarse period. Each tick fetches every
//! enabled active check, groups them by interval, and spawns one loop per
//! group. That set of loops is a generation: the next supervisor tick
//! retires it and builds a fresh one, so check changes take effect on the
//! next tick. A retired loop stops ticking but probes it already
//! dispatched run to completion.
//!
//! Each probe runs as its own task. Nothing prevents a slow run of a
//! check from overlapping the next tick's run of the same check.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use hermes_state::HealthCheck;

use crate::error::SchedulerError;
use crate::service::HealthService;

/// Default supervisor period.
pub const DEFAULT_SUPERVISOR_INTERVAL: Duration = Duration::from_secs(60);

struct Running {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Background scheduler for active health checks.
pub struct HealthCheckScheduler {
    service: Arc<HealthService>,
    supervisor_interval: Duration,
    running: Mutex<Option<Running>>,
}

impl HealthCheckScheduler {
    pub fn new(service: Arc<HealthService>, supervisor_interval: Duration) -> Self {
        Self {
            service,
            supervisor_interval,
            running: Mutex::new(None),
        }
    }

    /// Spawn the supervisor on the current tokio runtime.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let runtime = Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let service = self.service.clone();
        let period = self.supervisor_interval;
        let handle = runtime.spawn(async move {
            supervise(service, period, shutdown_rx).await;
        });
        *running = Some(Running {
            handle,
            shutdown_tx,
        });

        info!(supervisor_interval = ?period, "health check scheduler started");
        Ok(())
    }

    /// Signal the supervisor and every interval loop to stop ticking.
    /// In-flight probes are left to finish.
    pub fn stop(&self) {
        let taken = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = taken {
            let _ = running.shutdown_tx.send(true);
            info!("health check scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}

impl Drop for HealthCheckScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Supervisor loop: rebuild the interval groups on every tick.
async fn supervise(service: Arc<HealthService>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut current: Option<watch::Sender<bool>> = None;
    let mut generation: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let checks = match service.schedulable_checks().await {
                    Ok(checks) => checks,
                    Err(e) => {
                        // Keep the previous generation running.
                        error!(error = %e, "failed to fetch active health checks");
                        continue;
                    }
                };

                generation += 1;
                let (retire_tx, retire_rx) = watch::channel(false);
                if let Some(previous) = current.replace(retire_tx) {
                    let _ = previous.send(true);
                }

                let groups = group_by_interval(checks);
                info!(
                    generation,
                    groups = groups.len(),
                    checks = groups.values().map(Vec::len).sum::<usize>(),
                    "health check groups rebuilt"
                );
                for (interval, checks) in groups {
                    tokio::spawn(run_group(
                        service.clone(),
                        interval,
                        checks,
                        retire_rx.clone(),
                        shutdown.clone(),
                    ));
                }
            }
        }
    }

    if let Some(previous) = current.take() {
        let _ = previous.send(true);
    }
    debug!("health check supervisor exiting");
}

/// Partition checks by interval in seconds. Non-positive intervals are
/// skipped.
fn group_by_interval(checks: Vec<HealthCheck>) -> BTreeMap<u64, Vec<HealthCheck>> {
    let mut groups: BTreeMap<u64, Vec<HealthCheck>> = BTreeMap::new();
    for check in checks {
        match u64::try_from(check.interval) {
            Ok(secs) if secs > 0 => groups.entry(secs).or_default().push(check),
            _ => {
                warn!(
                    check_id = check.id,
                    service_id = %check.service_id,
                    interval = check.interval,
                    "skipping health check with non-positive interval"
                );
            }
        }
    }
    groups
}

/// One interval group: dispatch every check immediately, then on every
/// tick, until retired or shut down.
async fn run_group(
    service: Arc<HealthService>,
    interval_secs: u64,
    checks: Vec<HealthCheck>,
    mut retire: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(interval_secs, checks = checks.len(), "health check group starting");

    loop {
        tokio::select! {
            biased;
            _ = retire.changed() => break,
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if *retire.borrow() || *shutdown.borrow() {
                    break;
                }
                for check in &checks {
                    dispatch(service.clone(), check.clone());
                }
            }
        }
    }

    debug!(interval_secs, "health check group retired");
}

fn dispatch(service: Arc<HealthService>, check: HealthCheck) {
    tokio::spawn(async move {
        match service.run_active_check(&check).await {
            Ok(outcome) => {
                debug!(
                    check_id = check.id,
                    service_id = %check.service_id,
                    result = ?outcome.probe.result,
                    failures = outcome.failures,
                    "active health check finished"
                );
            }
            Err(e) => {
                error!(
                    check_id = check.id,
                    service_id = %check.service_id,
                    error = %e,
                    "failed to run active health check"
                );
            }
        }
    });
}
