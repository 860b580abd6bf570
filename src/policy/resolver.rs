use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

/// Android user ids are folded into the uid as `user * 100000 + app_id`.
pub const PER_USER_RANGE: u32 = 100_000;

#[derive(Debug, Error)]
pub enum PolicyLookupError {
    #[error("package list {path} unavailable: {source}")]
    Unavailable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no packages registered for uid {0}")]
    UnknownUid(u32),
}

/// Maps a caller uid to the package names sharing it.
pub trait PackageResolver: Send + Sync {
    fn packages_for_uid(&self, uid: u32) -> Result<Vec<String>, PolicyLookupError>;
}

/// Resolves uids from the system `packages.list`, reloading it when its
/// modification time changes.
pub struct PackagesListResolver {
    path: PathBuf,
    state: Mutex<Option<LoadedList>>,
}

struct LoadedList {
    modified: Option<SystemTime>,
    by_app_id: HashMap<u32, Vec<String>>,
}

impl PackagesListResolver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn unavailable(&self, source: std::io::Error) -> PolicyLookupError {
        PolicyLookupError::Unavailable {
            path: self.path.clone(),
            source,
        }
    }
}

impl PackageResolver for PackagesListResolver {
    fn packages_for_uid(&self, uid: u32) -> Result<Vec<String>, PolicyLookupError> {
        let modified = std::fs::metadata(&self.path)
            .map_err(|e| self.unavailable(e))?
            .modified()
            .ok();
        let mut state = self.state.lock();
        let stale = match state.as_ref() {
            Some(loaded) => loaded.modified != modified || modified.is_none(),
            None => true,
        };
        if stale {
            let raw = std::fs::read_to_string(&self.path).map_err(|e| self.unavailable(e))?;
            let by_app_id = parse_packages_list(&raw);
            log::debug!(
                "loaded {} uids from {}",
                by_app_id.len(),
                self.path.display()
            );
            *state = Some(LoadedList {
                modified,
                by_app_id,
            });
        }
        state
            .as_ref()
            .and_then(|loaded| loaded.by_app_id.get(&(uid % PER_USER_RANGE)))
            .filter(|packages| !packages.is_empty())
            .cloned()
            .ok_or(PolicyLookupError::UnknownUid(uid))
    }
}

/// Parses `<package> <app_id> ...` lines; malformed lines are skipped.
pub fn parse_packages_list(raw: &str) -> HashMap<u32, Vec<String>> {
    let mut out: HashMap<u32, Vec<String>> = HashMap::new();
    for line in raw.lines() {
        let mut fields = line.split_whitespace();
        let (Some(name), Some(app_id)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Ok(app_id) = app_id.parse::<u32>() else {
            continue;
        };
        out.entry(app_id).or_default().push(name.to_string());
    }
    out
}
