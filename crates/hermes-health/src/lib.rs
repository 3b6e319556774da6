//! hermes-health — health monitoring for registered services.
//!
//! Active checks are HTTP probes run on a schedule; passive checks are
//! status reports the services send about themselves. Both feed the
//! registry status of the owning service.
//!
//! # Architecture
//!
//! ```text
//! HealthCheckScheduler
//!   ├── Supervisor tick (coarse, rebuilds groups)
//!   │   └── Per-interval loop → one task per check per tick
//!   └── HealthService::run_active_check
//!       ├── Prober::probe → ProbeOutcome
//!       ├── status::on_success / on_failure → Transition
//!       └── HealthStore (counter, history) + ServiceStore (status)
//! ```
//!
//! # Thresholds
//!
//! Each failure bumps the check's counter and is recorded in history,
//! but the service is only marked `UNHEALTHY` once the counter reaches
//! the check's `threshold_count`. A single success resets the counter
//! and restores `HEALTHY`.

pub mod checker;
pub mod error;
pub mod scheduler;
pub mod service;
pub mod status;

pub use checker::{HttpProber, ProbeOutcome, ProbeResult, Prober};
pub use error::{HealthError, HealthResult, SchedulerError};
pub use scheduler::HealthCheckScheduler;
pub use service::{CheckOutcome, HealthService};
pub use status::Transition;
