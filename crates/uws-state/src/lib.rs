//! uws-state: service health model and status store for the UWS supervisor.
//!
//! Defines the per-service descriptor the control loop mutates, the probe
//! result it records, and the status snapshot published to dashboards.
//!
//! # Architecture
//!
//! `StatusStore` is backed by [redb](https://docs.rs/redb). Each service's
//! latest `ServiceStatus` is JSON-serialized into a single table keyed by
//! service id, so readers always see the last committed snapshot for every
//! service independently.
//!
//! The store is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`) and can
//! be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StatusStore;
pub use types::*;
