//! Per-caller forging policy.
//!
//! Rules come from a line-oriented file and land in one of two disjoint
//! rulesets: "hack" callers get a substituted certificate chain on their real
//! key, "generate" callers get a fully forged key and response. Mode flags can
//! override the rulesets entirely; see [`PolicySnapshot::need_generate`].

use std::sync::Arc;

use crate::device::DeviceProfile;
use crate::snapshot::{Snapshot, SnapshotCell};

pub mod resolver;
mod trie;

pub use resolver::{PackageResolver, PackagesListResolver, PolicyLookupError};
pub use trie::PackageTrie;

/// Hack and generate rulesets built from one rule list.
#[derive(Clone, Debug, Default)]
pub struct RuleSets {
    pub hack: PackageTrie,
    pub generate: PackageTrie,
}

impl RuleSets {
    /// Routes rule lines into rulesets.
    ///
    /// Blank lines and `#` comments are skipped. A trailing `!` sends a rule to
    /// the generate set; with `hardware_broken` every rule goes there and the
    /// hack set stays empty.
    pub fn parse<'a, I>(lines: I, hardware_broken: bool) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut out = Self::default();
        for line in lines {
            let rule = line.trim();
            if rule.is_empty() || rule.starts_with('#') {
                continue;
            }
            match rule.strip_suffix('!') {
                Some(stripped) => {
                    let stripped = stripped.trim();
                    if !stripped.is_empty() {
                        out.generate.insert(stripped);
                    }
                }
                None if hardware_broken => out.generate.insert(rule),
                None => out.hack.insert(rule),
            }
        }
        out
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModeFlags {
    /// Every caller is in scope regardless of rules.
    pub global: bool,
    /// Configured: the hardware security layer is unusable.
    pub hardware_broken: bool,
    /// Detected at bootstrap: no TEE security level was announced.
    pub hardware_broken_detected: bool,
    /// Forge remote key provisioning calls.
    pub rkp_bypass: bool,
}

impl ModeFlags {
    pub fn effective_hardware_broken(&self) -> bool {
        self.hardware_broken || self.hardware_broken_detected
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Verdict {
    pub hack: bool,
    pub generate: bool,
}

/// Immutable rules plus mode flags. Decisions are a pure function of this
/// value and the caller's package names.
#[derive(Clone, Debug, Default)]
pub struct PolicySnapshot {
    pub rules: RuleSets,
    pub modes: ModeFlags,
}

impl PolicySnapshot {
    pub fn from_lines<'a, I>(lines: I, modes: ModeFlags) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let rules = if modes.global {
            RuleSets::default()
        } else {
            RuleSets::parse(lines, modes.hardware_broken)
        };
        Self { rules, modes }
    }

    /// Whether answering requires the caller's package names at all.
    pub fn needs_packages(&self) -> bool {
        !self.modes.global && !(self.rules.hack.is_empty() && self.rules.generate.is_empty())
    }

    pub fn need_hack<S: AsRef<str>>(&self, packages: &[S]) -> bool {
        if self.modes.effective_hardware_broken() {
            false
        } else if self.modes.global {
            true
        } else {
            self.rules.hack.matches_any(packages)
        }
    }

    pub fn need_generate<S: AsRef<str>>(&self, packages: &[S]) -> bool {
        let broken = self.modes.effective_hardware_broken();
        match (broken, self.modes.global) {
            (true, true) => true,
            (false, true) => false,
            (true, false) => {
                self.rules.generate.matches_any(packages) || self.rules.hack.matches_any(packages)
            }
            (false, false) => self.rules.generate.matches_any(packages),
        }
    }

    pub fn verdict<S: AsRef<str>>(&self, packages: &[S]) -> Verdict {
        Verdict {
            hack: self.need_hack(packages),
            generate: self.need_generate(packages),
        }
    }
}

/// Evaluates the current policy snapshot for a caller uid.
/// What one caller sees: its verdict and the device identity to report to it.
#[derive(Clone, Debug)]
pub struct CallerView {
    pub verdict: Verdict,
    pub device: DeviceProfile,
}

pub struct PolicyEngine {
    snapshots: Arc<SnapshotCell>,
    resolver: Arc<dyn PackageResolver>,
}

impl PolicyEngine {
    pub fn new(snapshots: Arc<SnapshotCell>, resolver: Arc<dyn PackageResolver>) -> Self {
        Self {
            snapshots,
            resolver,
        }
    }

    pub fn snapshots(&self) -> &Arc<SnapshotCell> {
        &self.snapshots
    }

    pub fn verdict(&self, uid: u32) -> Verdict {
        let snapshot = self.snapshots.load();
        let packages = if snapshot.policy.needs_packages() {
            self.resolve(uid)
        } else {
            Vec::new()
        };
        snapshot.policy.verdict(&packages)
    }

    pub fn need_hack(&self, uid: u32) -> bool {
        self.verdict(uid).hack
    }

    pub fn need_generate(&self, uid: u32) -> bool {
        self.verdict(uid).generate
    }

    /// Verdict and device view for `uid`, both taken from the current snapshot.
    pub fn caller(&self, uid: u32) -> CallerView {
        self.caller_on(&self.snapshots.load(), uid)
    }

    /// Like [`PolicyEngine::caller`], against a snapshot the caller already holds.
    /// Packages are looked up at most once.
    pub fn caller_on(&self, snapshot: &Snapshot, uid: u32) -> CallerView {
        let overrides = &snapshot.security_patch;
        let packages = if snapshot.policy.needs_packages() || overrides.needs_packages() {
            self.resolve(uid)
        } else {
            Vec::new()
        };
        let verdict = snapshot.policy.verdict(&packages);
        let device = match overrides.lookup(&packages) {
            Some(value) => snapshot
                .device
                .with_patch_override(value, chrono::Local::now().date_naive()),
            None => snapshot.device.clone(),
        };
        CallerView { verdict, device }
    }

    /// Records whether bootstrap found the hardware security layer missing.
    pub fn set_hardware_broken_detected(&self, detected: bool) {
        self.snapshots.update(|current| {
            let mut next = current.clone();
            next.policy.modes.hardware_broken_detected = detected;
            next
        });
        log::info!(
            "auto-detected broken hardware mode is {}",
            if detected { "enabled" } else { "disabled" }
        );
    }

    fn resolve(&self, uid: u32) -> Vec<String> {
        match self.resolver.packages_for_uid(uid) {
            Ok(packages) => packages,
            Err(err) => {
                log::warn!("package lookup for uid={} failed, treating as unlisted: {}", uid, err);
                Vec::new()
            }
        }
    }
}
