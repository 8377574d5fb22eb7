use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ConfigError, ConfigResult};
use crate::domain::DomainType;

/// Environment variable every worker process receives with its domain tag.
pub const WORKER_DOMAIN_ENV: &str = "RELAY_WORKER_DOMAIN";

/// Connection pool settings for one domain. Durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections kept warm even when idle.
    pub min_size: usize,
    /// Hard cap on live connections.
    pub max_size: usize,
    /// How long `acquire` waits before failing with `PoolExhausted`.
    pub acquire_timeout_ms: u64,
    /// Idle connections older than this are closed, down to `min_size`.
    pub idle_timeout_ms: u64,
    /// Period of the eviction / health-check / replenish sweep.
    pub maintenance_interval_ms: u64,
    pub health_check_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Consecutive request timeouts after which a connection is evicted.
    pub max_consecutive_timeouts: u32,
    /// Consecutive undecodable lines after which a connection is unhealthy.
    pub max_protocol_errors: u32,
    /// How long shutdown waits for busy connections to drain.
    pub shutdown_grace_ms: u64,
    pub handshake_action: String,
    pub health_check_action: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 4,
            acquire_timeout_ms: 10_000,
            idle_timeout_ms: 300_000,
            maintenance_interval_ms: 30_000,
            health_check_timeout_ms: 5_000,
            handshake_timeout_ms: 15_000,
            max_consecutive_timeouts: 3,
            max_protocol_errors: 3,
            shutdown_grace_ms: 5_000,
            handshake_action: "handshake".to_string(),
            health_check_action: "health_check".to_string(),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_size(mut self, min: usize) -> Self {
        self.min_size = min;
        self
    }

    pub fn with_max_size(mut self, max: usize) -> Self {
        self.max_size = max;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval_ms = duration_ms(interval);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_max_consecutive_timeouts(mut self, n: u32) -> Self {
        self.max_consecutive_timeouts = n;
        self
    }

    pub fn with_max_protocol_errors(mut self, n: u32) -> Self {
        self.max_protocol_errors = n;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = duration_ms(grace);
        self
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn validate(&self, scope: &str) -> ConfigResult<()> {
        if self.max_size == 0 {
            return Err(ConfigError::invalid(
                format!("{scope}.max_size"),
                "must be greater than 0",
            ));
        }
        if self.max_size > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(ConfigError::invalid(
                format!("{scope}.max_size"),
                format!("must not exceed {}", tokio::sync::Semaphore::MAX_PERMITS),
            ));
        }
        if self.min_size > self.max_size {
            return Err(ConfigError::invalid(
                format!("{scope}.min_size"),
                format!("{} exceeds max_size {}", self.min_size, self.max_size),
            ));
        }
        let timeouts = [
            ("acquire_timeout_ms", self.acquire_timeout_ms),
            ("idle_timeout_ms", self.idle_timeout_ms),
            ("maintenance_interval_ms", self.maintenance_interval_ms),
            ("health_check_timeout_ms", self.health_check_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("shutdown_grace_ms", self.shutdown_grace_ms),
        ];
        for (field, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::invalid(
                    format!("{scope}.{field}"),
                    "must be greater than 0",
                ));
            }
        }
        if self.max_consecutive_timeouts == 0 {
            return Err(ConfigError::invalid(
                format!("{scope}.max_consecutive_timeouts"),
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// How to launch a worker process.
///
/// `{domain}` inside any argument is replaced with the domain tag. Entries
/// in `env` are `NAME=value` pairs; names keep their case.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, name: &str, value: &str) -> Self {
        self.env.push(format!("{name}={value}"));
        self
    }

    /// Arguments with `{domain}` substituted.
    pub fn args_for(&self, domain: DomainType) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace("{domain}", domain.as_str()))
            .collect()
    }

    /// `env` split into pairs; entries without `=` are skipped.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .filter_map(|entry| {
                entry
                    .split_once('=')
                    .map(|(k, v)| (k.trim().to_string(), v.to_string()))
            })
            .filter(|(k, _)| !k.is_empty())
            .collect()
    }
}

/// Per-domain replacement of the default pool and worker settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainOverride {
    pub pool: Option<PoolConfig>,
    pub worker: Option<WorkerCommand>,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Deadline for `execute` calls that do not pass one.
    pub default_timeout_ms: u64,
    /// Lifetime of a cached capability payload.
    pub capability_ttl_ms: u64,
    /// Action sent (domain-qualified) to describe a domain's capabilities.
    pub capabilities_action: String,
    pub pool: PoolConfig,
    pub worker: WorkerCommand,
    /// Keyed by domain tag (`model`, `inference`, ...).
    pub domains: BTreeMap<String, DomainOverride>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            capability_ttl_ms: 300_000,
            capabilities_action: "get_capabilities".to_string(),
            pool: PoolConfig::default(),
            worker: WorkerCommand::default(),
            domains: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_worker(mut self, worker: WorkerCommand) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_capability_ttl(mut self, ttl: Duration) -> Self {
        self.capability_ttl_ms = duration_ms(ttl);
        self
    }

    pub fn with_domain_pool(mut self, domain: DomainType, pool: PoolConfig) -> Self {
        self.domains
            .entry(domain.as_str().to_string())
            .or_default()
            .pool = Some(pool);
        self
    }

    pub fn with_domain_worker(mut self, domain: DomainType, worker: WorkerCommand) -> Self {
        self.domains
            .entry(domain.as_str().to_string())
            .or_default()
            .worker = Some(worker);
        self
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn capability_ttl(&self) -> Duration {
        Duration::from_millis(self.capability_ttl_ms)
    }

    fn override_for(&self, domain: DomainType) -> Option<&DomainOverride> {
        self.domains
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(domain.as_str()))
            .map(|(_, o)| o)
    }

    /// Effective pool settings for `domain`.
    pub fn pool_for(&self, domain: DomainType) -> PoolConfig {
        self.override_for(domain)
            .and_then(|o| o.pool.clone())
            .unwrap_or_else(|| self.pool.clone())
    }

    /// Effective worker command for `domain`.
    pub fn worker_for(&self, domain: DomainType) -> WorkerCommand {
        self.override_for(domain)
            .and_then(|o| o.worker.clone())
            .unwrap_or_else(|| self.worker.clone())
    }

    /// Domains with an explicit override section.
    pub fn configured_domains(&self) -> Vec<DomainType> {
        let mut domains: Vec<DomainType> = self
            .domains
            .keys()
            .filter_map(|key| key.parse().ok())
            .collect();
        domains.sort();
        domains
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.default_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "default_timeout_ms",
                "must be greater than 0",
            ));
        }
        if self.capabilities_action.trim().is_empty() {
            return Err(ConfigError::invalid("capabilities_action", "must not be empty"));
        }
        self.pool.validate("pool")?;
        for (key, entry) in &self.domains {
            key.parse::<DomainType>()
                .map_err(|e| ConfigError::invalid(format!("domains.{key}"), e.to_string()))?;
            if let Some(pool) = &entry.pool {
                pool.validate(&format!("domains.{key}.pool"))?;
            }
        }
        Ok(())
    }

    /// Load from a file with `RELAY__*` environment overrides, then validate.
    #[cfg(feature = "config")]
    pub fn load(path: &str) -> crate::error::KernelResult<Self> {
        use error_stack::{Report, ResultExt};

        let config: EngineConfig = super::load_with_env(path, "RELAY")
            .map_err(crate::error::KernelError::from)
            .map_err(Report::new)
            .attach(format!("loading engine config from {path}"))?;
        config
            .validate()
            .map_err(crate::error::KernelError::from)
            .map_err(Report::new)
            .attach(format!("validating engine config from {path}"))?;
        Ok(config)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
