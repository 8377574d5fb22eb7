//! The single-request execution seam.
//!
//! Batch coordination and capability caching only need "send one action to
//! a domain and wait". Keeping that behind a trait lets them run against the
//! real engine or a scripted double.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::DomainType;
use crate::error::EngineResult;

#[async_trait]
pub trait RequestExecutor: Send + Sync {
    /// Send `action` with `payload` to a `domain` worker and wait for its reply.
    ///
    /// `timeout` of `None` means the executor's default deadline.
    async fn execute(
        &self,
        domain: DomainType,
        action: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> EngineResult<Value>;
}
