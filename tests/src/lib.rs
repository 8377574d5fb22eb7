//! Relay Testing Framework
//!
//! Provides in-process worker doubles for exercising the engine without
//! spawning real processes.

pub mod executor;
pub mod worker;

pub use executor::MockExecutor;
pub use worker::{MockLauncher, MockReply};

/// Assert how many requests with a given qualified action the mock workers
/// received.
#[macro_export]
macro_rules! assert_action_sent {
    ($launcher:expr, $action:expr, $expected_count:expr) => {
        let count = $launcher.requests_for($action);
        assert_eq!(
            count, $expected_count,
            "Expected action '{}' to be sent {} times, but it was sent {} times",
            $action, $expected_count, count
        );
    };
}
