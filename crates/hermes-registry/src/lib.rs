//! hermes-registry — service registration, discovery, and dependency graph.
//!
//! [`ServiceRegistry`] is the entry point the HTTP layer and the daemon
//! call into. It is written against the [`ServiceStore`] trait from
//! `hermes-state`, so any backend that honours the store contract can be
//! plugged in.
//!
//! ```text
//! ServiceRegistry
//!   ├── register / update / delete / touch / update_status
//!   ├── list / discover (filters, version + dependency annotation)
//!   ├── versions (add, list, activate)
//!   └── dependencies (validated add, list, dependents, remove)
//! ```
//!
//! [`ServiceStore`]: hermes_state::ServiceStore

pub mod error;
pub mod registry;

pub use error::{RegistryError, RegistryResult};
pub use registry::ServiceRegistry;
