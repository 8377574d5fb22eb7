//! Relay Foundation
//!
//! Concrete implementations of the `relay-kernel` contracts: the OS process
//! launcher, per-domain connection pools, request correlation, batch
//! coordination, capability caching, and the [`WorkerEngine`] facade that
//! ties them together.

// correlator module - Correlation id to waiting caller
pub mod correlator;

// connection module - One worker process and its reader task
pub mod connection;

// process module - OS process launcher
pub mod process;

// pool module - Per-domain connection pool
pub mod pool;

// metrics module - Per-operation execution statistics
pub mod metrics;

// capability module - TTL capability cache
pub mod capability;

// batch module - Bounded-concurrency batch coordinator
pub mod batch;

// engine module - Facade over pools, metrics and caches
pub mod engine;

pub use batch::{BatchCoordinator, ProgressCallback};
pub use capability::CapabilityCache;
pub use connection::Connection;
pub use correlator::{CorrelatorStats, PendingResponse, RequestCorrelator};
pub use engine::WorkerEngine;
pub use metrics::OperationMetrics;
pub use pool::{ConnectionPool, PooledConnection, ReleaseOutcome};
pub use process::ProcessLauncher;
