//! hermes-state — registry state for Hermes.
//!
//! Holds the domain model shared by every other crate (services,
//! versions, dependency edges, health checks, history, routes), the
//! repository traits the core is written against, and a
//! [redb](https://docs.rs/redb)-backed implementation of those traits.
//!
//! # Architecture
//!
//! ```text
//! ServiceStore ─┐
//! HealthStore  ─┼── StateStore (redb, on-disk or in-memory)
//! RouteStore   ─┘
//! ```
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{service_id}/{version}`, `{service_id}/{dependency_id}`)
//! allow prefix scans for child records. Each trait method is a single
//! write transaction, so every mutation is atomic on its own; nothing
//! spans two calls.

pub mod error;
pub mod repository;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use repository::{HealthStore, RouteStore, ServiceStore};
pub use store::StateStore;
pub use types::*;
