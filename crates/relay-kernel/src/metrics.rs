//! Metric snapshot types exposed by the engine.
//!
//! These are plain serializable snapshots; the live counters behind them
//! live in `relay-foundation`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::DomainType;

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Process spawned, handshake not yet answered.
    Starting,
    Idle,
    /// Exactly one request in flight.
    Busy,
    /// Finishing its current request, then closing.
    Draining,
    /// Failed a health check or its stream broke; will be evicted.
    Unhealthy,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Starting => "starting",
            ConnectionState::Idle => "idle",
            ConnectionState::Busy => "busy",
            ConnectionState::Draining => "draining",
            ConnectionState::Unhealthy => "unhealthy",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Diagnostic view of one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub domain: DomainType,
    pub state: ConnectionState,
    pub is_healthy: bool,
    pub usage_count: u64,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub process_id: Option<u32>,
    pub current_operation: Option<String>,
    pub consecutive_timeouts: u32,
}

/// Counters and gauges of one domain's pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionPoolMetrics {
    pub domain: DomainType,
    pub min_size: usize,
    pub max_size: usize,
    pub total_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    /// Successful acquisitions.
    pub total_requests: u64,
    /// Acquisitions served by an existing idle connection.
    pub pool_hits: u64,
    /// Acquisitions that spawned a new connection.
    pub pool_misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub spawn_failures: u64,
    pub average_connection_age_ms: f64,
    pub connections: Vec<ConnectionInfo>,
}

/// Aggregate of every invocation of one operation name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationMetric {
    pub operation: String,
    pub total_invocations: u64,
    pub successful_invocations: u64,
    pub failed_invocations: u64,
    pub min_execution_time_ms: f64,
    pub max_execution_time_ms: f64,
    pub total_execution_time_ms: f64,
    pub first_invocation: Option<DateTime<Utc>>,
    pub last_invocation: Option<DateTime<Utc>>,
}

impl OperationMetric {
    pub fn average_execution_time_ms(&self) -> f64 {
        if self.total_invocations == 0 {
            0.0
        } else {
            self.total_execution_time_ms / self.total_invocations as f64
        }
    }

    pub fn success_rate(&self) -> f64 {
        crate::batch::success_rate(
            self.successful_invocations as usize,
            self.total_invocations as usize,
        )
    }
}

/// Diagnostic view of one capability cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityEntryInfo {
    pub domain: DomainType,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub access_count: u64,
}
