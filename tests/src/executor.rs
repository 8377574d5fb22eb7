use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_kernel::DomainType;
use relay_kernel::error::{EngineError, EngineResult};
use relay_kernel::executor::RequestExecutor;
use serde_json::Value;

type Responder = Arc<dyn Fn(DomainType, &str, Value, u32) -> EngineResult<Value> + Send + Sync>;

#[derive(Default)]
struct ExecutorState {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    /// Attempt counter per payload
    attempts: Mutex<HashMap<String, u32>>,
    history: Mutex<Vec<(DomainType, String, Value)>>,
}

/// A scripted [`RequestExecutor`].
///
/// The responder receives the attempt number of the payload (1 for the
/// first call with that payload), so retry behaviour can be scripted.
/// With a delay configured, a call whose timeout is shorter than the delay
/// fails with [`EngineError::Timeout`] after the timeout elapses.
#[derive(Clone)]
pub struct MockExecutor {
    responder: Responder,
    delay: Duration,
    state: Arc<ExecutorState>,
}

impl MockExecutor {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(DomainType, &str, Value, u32) -> EngineResult<Value> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            delay: Duration::ZERO,
            state: Arc::new(ExecutorState::default()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Total calls so far
    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls that were running at the same time
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn history(&self) -> Vec<(DomainType, String, Value)> {
        self.state.history.lock().clone()
    }
}

#[async_trait]
impl RequestExecutor for MockExecutor {
    async fn execute(
        &self,
        domain: DomainType,
        action: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> EngineResult<Value> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let attempt = {
            let mut attempts = self.state.attempts.lock();
            let count = attempts.entry(payload.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        self.state
            .history
            .lock()
            .push((domain, action.to_string(), payload.clone()));

        let result = match timeout {
            Some(limit) if !self.delay.is_zero() && limit < self.delay => {
                tokio::time::sleep(limit).await;
                Err(EngineError::Timeout {
                    action: action.to_string(),
                    timeout: limit,
                })
            }
            _ => {
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                (self.responder)(domain, action, payload, attempt)
            }
        };

        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
