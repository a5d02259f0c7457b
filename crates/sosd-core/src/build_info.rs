//! Build metadata embedded by `build.rs`.
//!
//! Reported in PROBE replies, the admin `/health` endpoint, and
//! `sosd --version`.

use serde::{Deserialize, Serialize};

/// Short git commit hash, or `unknown` outside a checkout.
pub const GIT_HASH: &str = env!("SOSD_GIT_HASH");

/// Unix epoch seconds, as a string.
pub const BUILD_TIMESTAMP: &str = env!("SOSD_BUILD_TIMESTAMP");

/// Cargo profile (`debug`, `release`, ...).
pub const BUILD_PROFILE: &str = env!("SOSD_BUILD_PROFILE");

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// `"0.1.0 (abc1234, debug)"`
pub fn version_string() -> String {
    format!("{VERSION} ({GIT_HASH}, {BUILD_PROFILE})")
}

/// Build time in seconds since the Unix epoch, if the stamp parses.
pub fn built_at() -> Option<u64> {
    BUILD_TIMESTAMP.parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub version: String,
    pub git_hash: String,
    pub build_profile: String,
    pub built_at: Option<u64>,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION.to_string(),
            git_hash: GIT_HASH.to_string(),
            build_profile: BUILD_PROFILE.to_string(),
            built_at: built_at(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_string() {
        let v = version_string();
        assert!(v.starts_with(VERSION));
        assert!(v.contains(BUILD_PROFILE));
    }

    #[test]
    fn test_build_info_current() {
        let info = BuildInfo::current();
        assert_eq!(info.version, VERSION);
        assert!(!info.git_hash.is_empty());
        assert!(info.built_at.is_some());
    }
}
