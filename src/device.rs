//! Device identity reported in forged responses.

use chrono::{Datelike, NaiveDate};
use std::collections::HashMap;

pub const DEFAULT_OS_VERSION: i32 = 140000;
pub const DEFAULT_PATCH_LEVEL: i32 = 202404;
pub const DEFAULT_PATCH_LEVEL_LONG: i32 = 20240401;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceProfile {
    pub brand: String,
    pub manufacturer: String,
    pub product: String,
    pub model: String,
    pub device: String,
    pub os_version: i32,
    /// `YYYYMM`
    pub patch_level: i32,
    /// `YYYYMMDD`
    pub patch_level_long: i32,
    /// Reported as the module hash when present.
    pub module_hash: Option<Vec<u8>>,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            brand: "google".to_string(),
            manufacturer: "Google".to_string(),
            product: "generic".to_string(),
            model: "Pixel".to_string(),
            device: "generic".to_string(),
            os_version: DEFAULT_OS_VERSION,
            patch_level: DEFAULT_PATCH_LEVEL,
            patch_level_long: DEFAULT_PATCH_LEVEL_LONG,
            module_hash: None,
        }
    }
}

impl DeviceProfile {
    /// Builds a profile from `KEY=VALUE` build variables; unknown keys are ignored.
    pub fn from_build_vars(vars: &HashMap<String, String>) -> Self {
        let mut out = Self::default();
        let text = |key: &str, slot: &mut String| {
            if let Some(value) = vars.get(key).filter(|v| !v.is_empty()) {
                *slot = value.clone();
            }
        };
        text("BRAND", &mut out.brand);
        text("MANUFACTURER", &mut out.manufacturer);
        text("PRODUCT", &mut out.product);
        text("MODEL", &mut out.model);
        text("DEVICE", &mut out.device);
        if let Some(raw) = vars.get("OS_VERSION") {
            match raw.parse() {
                Ok(v) => out.os_version = v,
                Err(_) => log::warn!("invalid OS_VERSION {:?}, keeping {}", raw, out.os_version),
            }
        }
        if let Some(raw) = vars.get("SECURITY_PATCH") {
            out.patch_level = convert_patch_level(raw, false);
            out.patch_level_long = convert_patch_level(raw, true);
        }
        out
    }

    /// The profile one caller sees when a patch level override applies to it.
    /// Only the OS patch level changes; vendor and boot levels stay global.
    pub fn with_patch_override(&self, value: &str, today: NaiveDate) -> Self {
        let mut out = self.clone();
        out.patch_level = convert_patch_level(&expand_patch_date(value, today), false);
        out
    }
}

/// Patch level overrides read from `security_patch.txt`.
///
/// A `package=VALUE` line applies to one package, a bare `VALUE` line is the
/// default for every other caller.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecurityPatchOverrides {
    pub default: Option<String>,
    pub per_package: HashMap<String, String>,
}

impl SecurityPatchOverrides {
    pub fn parse(raw: &str) -> Self {
        let mut out = Self::default();
        for line in raw.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once('=') {
                Some((package, value)) => {
                    out.per_package
                        .insert(package.trim().to_string(), value.trim().to_string());
                }
                None => out.default = Some(line.to_string()),
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.default.is_none() && self.per_package.is_empty()
    }

    pub fn needs_packages(&self) -> bool {
        !self.per_package.is_empty()
    }

    /// Keyed on the caller's first package; falls back to the default.
    pub fn lookup<S: AsRef<str>>(&self, packages: &[S]) -> Option<&str> {
        packages
            .first()
            .and_then(|first| self.per_package.get(first.as_ref()))
            .or(self.default.as_ref())
            .map(String::as_str)
    }
}

/// Resolves `today` and the `YYYY`, `MM`, `DD` placeholders against `today`.
pub fn expand_patch_date(value: &str, today: NaiveDate) -> String {
    if value.eq_ignore_ascii_case("today") {
        return today.format("%Y-%m-%d").to_string();
    }
    value
        .replace("YYYY", &format!("{:04}", today.year()))
        .replace("MM", &format!("{:02}", today.month()))
        .replace("DD", &format!("{:02}", today.day()))
}

/// Parses `KEY=VALUE` lines, skipping blanks and `#` comments.
pub fn parse_build_vars(raw: &str) -> HashMap<String, String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Converts `YYYY-MM-DD` to `YYYYMM` (short) or `YYYYMMDD` (long).
pub fn convert_patch_level(raw: &str, long: bool) -> i32 {
    let parsed: Option<Vec<i32>> = raw
        .trim()
        .split('-')
        .map(|part| part.parse::<i32>().ok())
        .collect();
    match parsed.as_deref() {
        Some([year, month, day]) if long => year * 10000 + month * 100 + day,
        Some([year, month, ..]) if !long => year * 100 + month,
        _ => {
            log::warn!("invalid patch level {:?}", raw);
            if long {
                DEFAULT_PATCH_LEVEL_LONG
            } else {
                DEFAULT_PATCH_LEVEL
            }
        }
    }
}
