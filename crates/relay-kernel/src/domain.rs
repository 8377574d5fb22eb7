//! Worker domain tags.
//!
//! Every worker process serves exactly one [`DomainType`], and every request
//! names the domain whose pool should serve it. The set is closed: adding a
//! domain means adding a variant here.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The category of worker process a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainType {
    Device,
    Memory,
    Model,
    Inference,
    Postprocessing,
    Processing,
}

impl DomainType {
    /// All domains, in declaration order.
    pub const ALL: [DomainType; 6] = [
        DomainType::Device,
        DomainType::Memory,
        DomainType::Model,
        DomainType::Inference,
        DomainType::Postprocessing,
        DomainType::Processing,
    ];

    /// Wire tag used as the action namespace and in the worker environment.
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainType::Device => "device",
            DomainType::Memory => "memory",
            DomainType::Model => "model",
            DomainType::Inference => "inference",
            DomainType::Postprocessing => "postprocessing",
            DomainType::Processing => "processing",
        }
    }

    /// Namespace `action` under this domain unless it already carries a prefix.
    ///
    /// `get_status` becomes `memory.get_status`; `memory.get_status` and
    /// `system.ping` are returned unchanged.
    pub fn qualify(&self, action: &str) -> String {
        if action.contains('.') {
            action.to_string()
        } else {
            format!("{}.{}", self.as_str(), action)
        }
    }
}

impl fmt::Display for DomainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name a known domain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown domain type: {0}")]
pub struct UnknownDomain(pub String);

impl FromStr for DomainType {
    type Err = UnknownDomain;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DomainType::ALL
            .iter()
            .copied()
            .find(|d| d.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownDomain(s.to_string()))
    }
}
