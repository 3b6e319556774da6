//! Health status state machine for active checks.
//!
//! Passive reports bypass this module entirely: the reported status is
//! applied verbatim. Active outcomes go through [`on_success`] and
//! [`on_failure`], which decide whether the owning service's registry
//! status changes.

use hermes_state::ServiceStatus;

pub const RECOVERED_MESSAGE: &str = "Service recovered";
pub const CHECK_FAILED_MESSAGE: &str = "Health check failed";

/// Effect of one active check outcome on the owning service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Registry status stays as it is.
    Unchanged,
    /// A success on a service that was not `HEALTHY`.
    Recovered,
    /// The failure counter reached the check's threshold.
    ThresholdReached,
}

impl Transition {
    /// Status to write to the registry, if any.
    pub fn target(&self) -> Option<ServiceStatus> {
        match self {
            Transition::Unchanged => None,
            Transition::Recovered => Some(ServiceStatus::Healthy),
            Transition::ThresholdReached => Some(ServiceStatus::Unhealthy),
        }
    }
}

/// A single success recovers the service regardless of threshold.
pub fn on_success(current: ServiceStatus) -> Transition {
    if current == ServiceStatus::Healthy {
        Transition::Unchanged
    } else {
        Transition::Recovered
    }
}

/// `failures` is the counter after this failure was added.
pub fn on_failure(failures: u32, threshold: u32) -> Transition {
    if failures >= threshold {
        Transition::ThresholdReached
    } else {
        Transition::Unchanged
    }
}

pub fn threshold_message(check_name: &str, failures: u32) -> String {
    format!("Health check '{check_name}' failed {failures} times")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_recovers_any_non_healthy_status() {
        for status in [
            ServiceStatus::Unknown,
            ServiceStatus::Warning,
            ServiceStatus::Unhealthy,
        ] {
            assert_eq!(on_success(status), Transition::Recovered);
            assert_eq!(on_success(status).target(), Some(ServiceStatus::Healthy));
        }
        assert_eq!(on_success(ServiceStatus::Healthy), Transition::Unchanged);
    }

    #[test]
    fn failures_below_threshold_leave_status() {
        assert_eq!(on_failure(1, 3), Transition::Unchanged);
        assert_eq!(on_failure(2, 3), Transition::Unchanged);
        assert_eq!(on_failure(2, 3).target(), None);
    }

    #[test]
    fn failure_at_or_past_threshold_marks_unhealthy() {
        assert_eq!(on_failure(3, 3), Transition::ThresholdReached);
        assert_eq!(on_failure(7, 3).target(), Some(ServiceStatus::Unhealthy));
    }

    #[test]
    fn zero_threshold_trips_on_first_failure() {
        assert_eq!(on_failure(1, 0), Transition::ThresholdReached);
    }

    #[test]
    fn threshold_message_names_check() {
        assert_eq!(
            threshold_message("ping", 3),
            "Health check 'ping' failed 3 times"
        );
    }
}
