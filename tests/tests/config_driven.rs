use std::fs;
use std::sync::Arc;

use relay_foundation::WorkerEngine;
use relay_kernel::DomainType;
use relay_kernel::config::{ConfigError, EngineConfig};
use relay_kernel::error::{EngineError, KernelError};
use relay_testing::{MockLauncher, MockReply};
use serde_json::json;
use tempfile::TempDir;

const ENGINE_TOML: &str = r#"
default_timeout_ms = 1500
capability_ttl_ms = 60000

[pool]
min_size = 0
max_size = 3
acquire_timeout_ms = 200

[worker]
program = "python3"
args = ["-m", "workers.main", "--worker-type", "{domain}"]
env = ["PYTHONUNBUFFERED=1"]

[domains.model.pool]
max_size = 1
acquire_timeout_ms = 100
"#;

#[tokio::test]
async fn test_engine_uses_per_domain_overrides_from_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("relay.toml");
    fs::write(&path, ENGINE_TOML).unwrap();

    let config = EngineConfig::load(path.to_str().unwrap()).unwrap();
    assert_eq!(config.worker_for(DomainType::Model).program, "python3");
    assert_eq!(
        config.worker_for(DomainType::Device).args_for(DomainType::Device),
        vec!["-m", "workers.main", "--worker-type", "device"]
    );

    let launcher = MockLauncher::new(|cmd| {
        MockReply::Delayed(
            std::time::Duration::from_millis(300),
            Box::new(MockReply::success(cmd.data.clone())),
        )
    });
    let engine = WorkerEngine::with_launcher(config, Arc::new(launcher.clone())).unwrap();

    assert_eq!(engine.pool_metrics(DomainType::Model).unwrap().max_size, 1);
    assert_eq!(engine.pool_metrics(DomainType::Inference).unwrap().max_size, 3);

    // The model pool holds a single worker, so a second caller is turned away.
    let first = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .execute(DomainType::Model, "load_model", json!({ "name": "tiny" }), None)
                .await
        })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let second = engine
        .execute(DomainType::Model, "load_model", json!({ "name": "tiny" }), None)
        .await;
    assert!(matches!(second, Err(EngineError::PoolExhausted { .. })));
    assert_eq!(first.await.unwrap().unwrap(), json!({ "name": "tiny" }));

    // The inference pool is larger and serves both at once.
    let (a, b) = tokio::join!(
        engine.execute(DomainType::Inference, "run", json!(1), None),
        engine.execute(DomainType::Inference, "run", json!(2), None),
    );
    assert_eq!(a.unwrap(), json!(1));
    assert_eq!(b.unwrap(), json!(2));
    assert_eq!(launcher.launched_for(DomainType::Inference), 2);

    engine.shutdown().await;
}

#[test]
fn test_invalid_pool_bounds_are_rejected_on_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("relay.toml");
    fs::write(&path, "[pool]\nmin_size = 4\nmax_size = 2\n").unwrap();

    let report = EngineConfig::load(path.to_str().unwrap()).unwrap_err();
    assert!(matches!(
        report.current_context(),
        KernelError::Config(ConfigError::Invalid { .. })
    ));
}

#[test]
fn test_unknown_extension_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("relay.conf");
    fs::write(&path, "anything").unwrap();

    let report = EngineConfig::load(path.to_str().unwrap()).unwrap_err();
    assert!(matches!(
        report.current_context(),
        KernelError::Config(ConfigError::UnsupportedFormat(_))
    ));
}
