use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use attest_shim::config::DaemonConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "ATTEST_SHIM_CONFIG",
        "ATTEST_SHIM_CONFIG_DIR",
        "ATTEST_SHIM_SOCKET",
        "ATTEST_SHIM_PACKAGES_LIST",
        "ATTEST_SHIM_WORKERS",
        "ATTEST_SHIM_BOOTSTRAP_ATTEMPTS",
        "ATTEST_SHIM_POLL_INTERVAL_MS",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "config_dir": "/tmp/shim",
            "packages_list": "/tmp/packages.list",
            "workers": 8,
            "cache": { "keys": 50 },
            "bootstrap": { "attempts": 5, "delay_ms": 250 },
            "watcher": { "poll_interval_ms": 1000 }
        }"#,
    );

    std::env::set_var("ATTEST_SHIM_CONFIG", file.path());
    std::env::set_var("ATTEST_SHIM_WORKERS", "2");
    std::env::set_var("ATTEST_SHIM_SOCKET", "/tmp/other.sock");

    let cfg = DaemonConfig::load().expect("load config");
    assert_eq!(cfg.config_dir, PathBuf::from("/tmp/shim"));
    assert_eq!(cfg.socket_path(), PathBuf::from("/tmp/other.sock"));
    assert_eq!(cfg.packages_list, PathBuf::from("/tmp/packages.list"));
    assert_eq!(cfg.workers, 2);
    assert_eq!(cfg.caches.keys, 50);
    assert_eq!(cfg.caches.provisioning, 100);
    assert_eq!(cfg.bootstrap.attempts, 5);
    assert_eq!(cfg.bootstrap.delay, Duration::from_millis(250));
    assert_eq!(cfg.poll_interval, Duration::from_secs(1));
    assert_eq!(
        cfg.runtime_file("target.txt"),
        PathBuf::from("/tmp/shim/target.txt")
    );

    clear_env();
}

#[test]
fn defaults_apply_without_a_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = DaemonConfig::load().expect("load defaults");
    assert_eq!(cfg.socket_path(), cfg.config_dir.join("attest_shim.sock"));
    assert_eq!(cfg.caches.keys, 1000);
    assert_eq!(cfg.bootstrap.attempts, 3);
    assert!(cfg.workers > 0);
}

#[test]
fn socket_defaults_from_overridden_config_dir() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(r#"{ "config_dir": "/tmp/from-file" }"#);
    std::env::set_var("ATTEST_SHIM_CONFIG_DIR", "/tmp/from-env");

    let cfg = DaemonConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.config_dir, PathBuf::from("/tmp/from-env"));
    assert_eq!(
        cfg.socket_path(),
        PathBuf::from("/tmp/from-env/attest_shim.sock")
    );

    clear_env();
}

#[test]
fn explicit_path_wins_over_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(r#"{ "config_dir": "/tmp/explicit" }"#);
    std::env::set_var("ATTEST_SHIM_CONFIG", "/nonexistent/attest_shim.json");

    let cfg = DaemonConfig::load_from(Some(file.path())).expect("load explicit");
    assert_eq!(cfg.config_dir, PathBuf::from("/tmp/explicit"));

    clear_env();
}

#[test]
fn rejects_zero_workers_and_bad_numbers() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("ATTEST_SHIM_WORKERS", "0");
    let err = DaemonConfig::load().expect_err("zero workers");
    assert!(err.to_string().contains("workers"));

    std::env::set_var("ATTEST_SHIM_WORKERS", "many");
    let err = DaemonConfig::load().expect_err("non-numeric workers");
    assert!(err.to_string().contains("ATTEST_SHIM_WORKERS"));

    clear_env();
    std::env::set_var("ATTEST_SHIM_BOOTSTRAP_ATTEMPTS", "0");
    assert!(DaemonConfig::load().is_err());

    clear_env();
}

#[test]
fn missing_or_invalid_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("ATTEST_SHIM_CONFIG", "/nonexistent/attest_shim.json");
    let err = DaemonConfig::load().expect_err("missing file");
    assert!(err.to_string().contains("failed to read config file"));

    let file = write_config("{ not json");
    let err = DaemonConfig::load_from(Some(file.path())).expect_err("invalid json");
    assert!(err.to_string().contains("invalid config file"));

    clear_env();
}
