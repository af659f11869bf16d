use super::settings::{Settings, StoreBackend};
use super::{load_config, load_config_from};
use serial_test::serial;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.store.backend, StoreBackend::Memory);
    assert_eq!(settings.broker.default_max_retries, 3);
    assert_eq!(settings.broker.retry_base_delay_ms, 1_000);
    assert_eq!(settings.broker.retry_max_delay_ms, 60_000);
    assert_eq!(settings.broker.poll_interval_ms, 100);
    assert_eq!(settings.consumer.workers, 10);
    assert_eq!(settings.consumer.consume_timeout_ms, 5_000);
    assert_eq!(settings.consumer.handler_timeout_ms, 60_000);
    assert_eq!(settings.logging.level, "info");
}

#[test]
#[serial]
fn missing_file_falls_back_to_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("absent");
    let cfg = load_config_from(path.to_str().unwrap()).expect("load_config failed");
    assert_eq!(cfg, Settings::default());
}

#[test]
#[serial]
fn file_overrides_only_given_values() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("eventcore.toml");
    let toml = r#"
        [store]
        backend = "sled"
        path = "/var/lib/eventcore"

        [broker]
        default_max_retries = 5

        [consumer]
        workers = 4
    "#;
    fs::write(&path, toml).expect("write config file");

    let cfg = load_config_from(path.to_str().unwrap()).expect("load_config failed");
    assert_eq!(cfg.store.backend, StoreBackend::Sled);
    assert_eq!(cfg.store.path, "/var/lib/eventcore");
    assert_eq!(cfg.broker.default_max_retries, 5);
    assert_eq!(cfg.broker.poll_interval_ms, 100);
    assert_eq!(cfg.consumer.workers, 4);
    assert_eq!(cfg.consumer.idle_wait_ms, 100);
}

#[test]
#[serial]
fn environment_overrides_defaults() {
    temp_env::with_vars(
        [
            ("EVENTCORE_BROKER__POLL_INTERVAL_MS", Some("25")),
            ("EVENTCORE_LOGGING__LEVEL", Some("debug")),
        ],
        || {
            let cfg = load_config().expect("load_config failed");
            assert_eq!(cfg.broker.poll_interval_ms, 25);
            assert_eq!(cfg.logging.level, "debug");
            assert_eq!(cfg.consumer.workers, 10);
        },
    );
}
