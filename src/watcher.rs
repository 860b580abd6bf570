//! Polls the runtime configuration directory and republishes the snapshot.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use crate::device::{parse_build_vars, DeviceProfile, SecurityPatchOverrides};
use crate::policy::{ModeFlags, PolicySnapshot};
use crate::snapshot::{Snapshot, SnapshotCell};

pub const TARGET_FILE: &str = "target.txt";
pub const GLOBAL_MODE_FILE: &str = "global_mode";
pub const TEE_BROKEN_MODE_FILE: &str = "tee_broken_mode";
pub const RKP_BYPASS_FILE: &str = "rkp_bypass";
pub const BUILD_VARS_FILE: &str = "spoof_build_vars";
pub const SECURITY_PATCH_FILE: &str = "security_patch.txt";
pub const MODULE_HASH_FILE: &str = "module_hash";

const WATCHED: [&str; 7] = [
    TARGET_FILE,
    GLOBAL_MODE_FILE,
    TEE_BROKEN_MODE_FILE,
    RKP_BYPASS_FILE,
    BUILD_VARS_FILE,
    SECURITY_PATCH_FILE,
    MODULE_HASH_FILE,
];
const POLL_SLICE: Duration = Duration::from_millis(50);

/// Builds a complete snapshot from `dir`. Missing files mean "off" / "empty".
pub fn load_snapshot(dir: &Path, hardware_broken_detected: bool) -> Result<Snapshot> {
    let modes = ModeFlags {
        global: dir.join(GLOBAL_MODE_FILE).exists(),
        hardware_broken: dir.join(TEE_BROKEN_MODE_FILE).exists(),
        hardware_broken_detected,
        rkp_bypass: dir.join(RKP_BYPASS_FILE).exists(),
    };
    let rules = if modes.global {
        String::new()
    } else {
        read_optional(&dir.join(TARGET_FILE))?
    };
    let mut device = match read_optional(&dir.join(BUILD_VARS_FILE))? {
        raw if raw.is_empty() => DeviceProfile::default(),
        raw => DeviceProfile::from_build_vars(&parse_build_vars(&raw)),
    };
    device.module_hash = parse_module_hash(&read_optional(&dir.join(MODULE_HASH_FILE))?);
    let security_patch =
        SecurityPatchOverrides::parse(&read_optional(&dir.join(SECURITY_PATCH_FILE))?);
    Ok(Snapshot {
        policy: PolicySnapshot::from_lines(rules.lines(), modes),
        device,
        security_patch,
    })
}

fn parse_module_hash(raw: &str) -> Option<Vec<u8>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match hex::decode(raw) {
        Ok(hash) => Some(hash),
        Err(err) => {
            log::error!("ignoring malformed {}: {}", MODULE_HASH_FILE, err);
            None
        }
    }
}

fn read_optional(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(raw),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(anyhow!("failed to read {}: {}", path.display(), err)),
    }
}

type Fingerprint = Vec<Option<SystemTime>>;

fn fingerprint(dir: &Path) -> Fingerprint {
    WATCHED
        .iter()
        .map(|name| {
            std::fs::metadata(dir.join(name))
                .and_then(|m| m.modified())
                .ok()
        })
        .collect()
}

pub struct ConfigWatcher {
    dir: PathBuf,
    snapshots: Arc<SnapshotCell>,
    interval: Duration,
    /// File times observed just before the last successful load.
    loaded: Mutex<Option<Fingerprint>>,
}

impl ConfigWatcher {
    pub fn new(dir: impl Into<PathBuf>, snapshots: Arc<SnapshotCell>, interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            snapshots,
            interval,
            loaded: Mutex::new(None),
        }
    }

    /// Rebuilds and publishes the snapshot, keeping the bootstrap-detected flag.
    /// On error the previous snapshot stays in place.
    pub fn reload(&self) -> Result<()> {
        let seen = fingerprint(&self.dir);
        let detected = self.snapshots.load().policy.modes.hardware_broken_detected;
        let next = load_snapshot(&self.dir, detected)?;
        log::info!(
            "config reloaded: {} hack / {} generate rules, global={} tee_broken={} rkp_bypass={} patch_overrides={}",
            next.policy.rules.hack.len(),
            next.policy.rules.generate.len(),
            next.policy.modes.global,
            next.policy.modes.hardware_broken,
            next.policy.modes.rkp_bypass,
            next.security_patch.per_package.len()
        );
        self.snapshots.update(move |current| {
            let mut next = next;
            next.policy.modes.hardware_broken_detected =
                current.policy.modes.hardware_broken_detected;
            next
        });
        *self.loaded.lock() = Some(seen);
        Ok(())
    }

    /// Whether any watched file changed since the last successful load.
    fn is_stale(&self, current: &Fingerprint) -> bool {
        self.loaded.lock().as_ref() != Some(current)
    }

    pub fn spawn(self) -> WatcherHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::spawn(move || self.run(&shutdown_thread));
        WatcherHandle {
            shutdown,
            join: Some(join),
        }
    }

    fn run(&self, shutdown: &AtomicBool) {
        let mut failed: Option<Fingerprint> = None;
        loop {
            let current = fingerprint(&self.dir);
            if self.is_stale(&current) && failed.as_ref() != Some(&current) {
                match self.reload() {
                    Ok(()) => failed = None,
                    Err(err) => {
                        log::error!("config reload failed, keeping previous: {}", err);
                        failed = Some(current);
                    }
                }
            }
            let deadline = Instant::now() + self.interval;
            while Instant::now() < deadline {
                if shutdown.load(Ordering::SeqCst) {
                    return;
                }
                std::thread::sleep(POLL_SLICE.min(self.interval));
            }
        }
    }
}
#[derive(Debug)]
pub struct WatcherHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl WatcherHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("config watcher thread panicked"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn empty_directory_yields_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let snapshot = load_snapshot(dir.path(), false)?;
        assert_eq!(snapshot.policy.modes, ModeFlags::default());
        assert!(snapshot.policy.rules.hack.is_empty());
        assert_eq!(snapshot.device, DeviceProfile::default());
        Ok(())
    }

    #[test]
    fn flag_files_and_rules_are_read() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join(TARGET_FILE), "com.google.*\ncom.bank.app!\n")?;
        fs::write(dir.path().join(RKP_BYPASS_FILE), "")?;
        fs::write(dir.path().join(BUILD_VARS_FILE), "DEVICE=husky\n")?;
        let snapshot = load_snapshot(dir.path(), true)?;
        assert!(snapshot.policy.modes.rkp_bypass);
        assert!(snapshot.policy.modes.hardware_broken_detected);
        assert!(snapshot.policy.rules.hack.matches("com.google.android.gms"));
        assert!(snapshot.policy.rules.generate.matches("com.bank.app"));
        assert_eq!(snapshot.device.device, "husky");
        Ok(())
    }

    #[test]
    fn reload_keeps_detected_flag() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cell = Arc::new(SnapshotCell::default());
        cell.update(|s| {
            let mut next = s.clone();
            next.policy.modes.hardware_broken_detected = true;
            next
        });
        fs::write(dir.path().join(GLOBAL_MODE_FILE), "")?;
        let watcher = ConfigWatcher::new(dir.path(), cell.clone(), Duration::from_millis(10));
        watcher.reload()?;
        let now = cell.load();
        assert!(now.policy.modes.global);
        assert!(now.policy.modes.hardware_broken_detected);
        Ok(())
    }

    #[test]
    fn watcher_picks_up_changes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cell = Arc::new(SnapshotCell::default());
        let handle =
            ConfigWatcher::new(dir.path(), cell.clone(), Duration::from_millis(20)).spawn();
        fs::write(dir.path().join(RKP_BYPASS_FILE), "")?;
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cell.load().policy.modes.rkp_bypass && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        handle.stop()?;
        assert!(cell.load().policy.modes.rkp_bypass);
        Ok(())
    }

    #[test]
    fn edit_before_spawn_is_not_lost() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cell = Arc::new(SnapshotCell::default());
        let watcher = ConfigWatcher::new(dir.path(), cell.clone(), Duration::from_millis(20));
        watcher.reload()?;
        assert!(!cell.load().policy.modes.rkp_bypass);

        fs::write(dir.path().join(RKP_BYPASS_FILE), "")?;
        std::thread::sleep(Duration::from_millis(50));
        let handle = watcher.spawn();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !cell.load().policy.modes.rkp_bypass && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        handle.stop()?;
        assert!(cell.load().policy.modes.rkp_bypass);
        Ok(())
    }

    #[test]
    fn patch_overrides_and_module_hash_are_read() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(
            dir.path().join(SECURITY_PATCH_FILE),
            "# comment\n2024-01-05\ncom.bank.app=today\n",
        )?;
        fs::write(dir.path().join(MODULE_HASH_FILE), "  0a0BfF\n")?;
        let snapshot = load_snapshot(dir.path(), false)?;
        assert_eq!(snapshot.security_patch.default.as_deref(), Some("2024-01-05"));
        assert_eq!(
            snapshot.security_patch.lookup(&["com.bank.app"]),
            Some("today")
        );
        assert_eq!(snapshot.device.module_hash, Some(vec![0x0a, 0x0b, 0xff]));

        fs::write(dir.path().join(MODULE_HASH_FILE), "not-hex")?;
        let snapshot = load_snapshot(dir.path(), false)?;
        assert_eq!(snapshot.device.module_hash, None);
        Ok(())
    }
}
