use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dispatcher::CacheCapacities;

const DEFAULT_CONFIG_DIR: &str = "/data/adb/attest_shim";
const DEFAULT_SOCKET_NAME: &str = "attest_shim.sock";
const DEFAULT_PACKAGES_LIST: &str = "/data/system/packages.list";
const DEFAULT_KEY_CACHE_CAPACITY: usize = 1000;
const DEFAULT_PROVISIONING_CACHE_CAPACITY: usize = 100;
const DEFAULT_BOOTSTRAP_ATTEMPTS: u32 = 3;
const DEFAULT_BOOTSTRAP_DELAY_MS: u64 = 1000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;
const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Deserialize, Default)]
struct DaemonConfigFile {
    config_dir: Option<PathBuf>,
    socket_path: Option<PathBuf>,
    packages_list: Option<PathBuf>,
    workers: Option<usize>,
    cache: Option<CacheConfigFile>,
    bootstrap: Option<BootstrapConfigFile>,
    watcher: Option<WatcherConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CacheConfigFile {
    keys: Option<usize>,
    provisioning: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct BootstrapConfigFile {
    attempts: Option<u32>,
    delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct WatcherConfigFile {
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Directory holding the watched runtime files.
    pub config_dir: PathBuf,
    /// Explicit hook socket; see [`DaemonConfig::socket_path`].
    pub socket_override: Option<PathBuf>,
    pub packages_list: PathBuf,
    pub workers: usize,
    pub caches: CacheCapacities,
    pub bootstrap: BootstrapSettings,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct BootstrapSettings {
    pub attempts: u32,
    pub delay: Duration,
}

impl DaemonConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ATTEST_SHIM_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like [`DaemonConfig::load`] with an explicit file taking the place of
    /// `ATTEST_SHIM_CONFIG`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let file_cfg = match config_path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: DaemonConfigFile) -> Self {
        let config_dir = file
            .config_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR));
        let caches = CacheCapacities {
            keys: file
                .cache
                .as_ref()
                .and_then(|cache| cache.keys)
                .unwrap_or(DEFAULT_KEY_CACHE_CAPACITY),
            provisioning: file
                .cache
                .as_ref()
                .and_then(|cache| cache.provisioning)
                .unwrap_or(DEFAULT_PROVISIONING_CACHE_CAPACITY),
        };
        let bootstrap = BootstrapSettings {
            attempts: file
                .bootstrap
                .as_ref()
                .and_then(|b| b.attempts)
                .unwrap_or(DEFAULT_BOOTSTRAP_ATTEMPTS),
            delay: Duration::from_millis(
                file.bootstrap
                    .as_ref()
                    .and_then(|b| b.delay_ms)
                    .unwrap_or(DEFAULT_BOOTSTRAP_DELAY_MS),
            ),
        };
        let poll_interval = Duration::from_millis(
            file.watcher
                .and_then(|w| w.poll_interval_ms)
                .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        );
        Self {
            config_dir,
            socket_override: file.socket_path,
            packages_list: file
                .packages_list
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PACKAGES_LIST)),
            workers: file.workers.unwrap_or(DEFAULT_WORKERS),
            caches,
            bootstrap,
            poll_interval,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(dir) = env_nonempty("ATTEST_SHIM_CONFIG_DIR") {
            self.config_dir = PathBuf::from(dir);
        }
        if let Some(path) = env_nonempty("ATTEST_SHIM_SOCKET") {
            self.socket_override = Some(PathBuf::from(path));
        }
        if let Some(path) = env_nonempty("ATTEST_SHIM_PACKAGES_LIST") {
            self.packages_list = PathBuf::from(path);
        }
        if let Some(workers) = env_nonempty("ATTEST_SHIM_WORKERS") {
            self.workers = workers
                .parse()
                .map_err(|_| anyhow!("ATTEST_SHIM_WORKERS must be a positive integer"))?;
        }
        if let Some(attempts) = env_nonempty("ATTEST_SHIM_BOOTSTRAP_ATTEMPTS") {
            self.bootstrap.attempts = attempts
                .parse()
                .map_err(|_| anyhow!("ATTEST_SHIM_BOOTSTRAP_ATTEMPTS must be a positive integer"))?;
        }
        if let Some(ms) = env_nonempty("ATTEST_SHIM_POLL_INTERVAL_MS") {
            let ms: u64 = ms.parse().map_err(|_| {
                anyhow!("ATTEST_SHIM_POLL_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.poll_interval = Duration::from_millis(ms);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.caches.keys == 0 || self.caches.provisioning == 0 {
            return Err(anyhow!("cache capacities must be greater than zero"));
        }
        if self.bootstrap.attempts == 0 {
            return Err(anyhow!("bootstrap attempts must be greater than zero"));
        }
        if self.workers == 0 {
            return Err(anyhow!("workers must be greater than zero"));
        }
        if self.poll_interval.is_zero() {
            return Err(anyhow!("poll interval must be greater than zero"));
        }
        Ok(())
    }

    /// The explicit socket if one was given, else `attest_shim.sock` inside
    /// the final config directory.
    pub fn socket_path(&self) -> PathBuf {
        self.socket_override
            .clone()
            .unwrap_or_else(|| self.config_dir.join(DEFAULT_SOCKET_NAME))
    }

    /// Path of a runtime file inside the config directory.
    pub fn runtime_file(&self, name: &str) -> PathBuf {
        self.config_dir.join(name)
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<DaemonConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
