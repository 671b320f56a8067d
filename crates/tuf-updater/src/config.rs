//! Updater limits and their environment overrides.
//!
//! Every ceiling bounds work an untrusted mirror can cause: root rotations
//! per refresh, delegated roles per lookup, and bytes per download.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use tracing::warn;

const ENV_MAX_ROOT_ROTATIONS: &str = "TUF_MAX_ROOT_ROTATIONS";
const ENV_MAX_DELEGATIONS: &str = "TUF_MAX_DELEGATIONS";
const ENV_MAX_DELEGATION_DEPTH: &str = "TUF_MAX_DELEGATION_DEPTH";
const ENV_ROOT_SIZE_CAP: &str = "TUF_ROOT_SIZE_CAP";
const ENV_TIMESTAMP_SIZE_CAP: &str = "TUF_TIMESTAMP_SIZE_CAP";
const ENV_SNAPSHOT_SIZE_CAP: &str = "TUF_SNAPSHOT_SIZE_CAP";
const ENV_TARGETS_SIZE_CAP: &str = "TUF_TARGETS_SIZE_CAP";
const ENV_TARGET_SIZE_CAP: &str = "TUF_TARGET_SIZE_CAP";
/// Per-request timeout, in seconds.
const ENV_FETCH_TIMEOUT: &str = "TUF_FETCH_TIMEOUT_SECS";
const ENV_PREFIX_TARGETS_WITH_HASH: &str = "TUF_PREFIX_TARGETS_WITH_HASH";

/// Limits applied by an [`Updater`](crate::Updater).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdaterConfig {
    /// Root versions accepted during a single refresh.
    pub max_root_rotations: u64,
    /// Roles visited per target lookup, the top-level targets role included.
    pub max_delegations: usize,
    /// Longest delegation chain followed.
    pub max_delegation_depth: usize,
    pub root_size_cap: u64,
    pub timestamp_size_cap: u64,
    /// Used when the timestamp does not pin the snapshot length.
    pub snapshot_size_cap: u64,
    /// Used when the snapshot does not pin a targets role's length.
    pub targets_size_cap: u64,
    /// Largest target download accepted.
    pub target_size_cap_default: u64,
    /// Timeout applied to every single fetch.
    pub fetch_timeout: Duration,
    /// Request `dir/<hash>.<name>` for targets of consistent-snapshot repositories.
    pub prefix_targets_with_hash: bool,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            max_root_rotations: 32,
            max_delegations: 32,
            max_delegation_depth: 16,
            root_size_cap: 512_000,
            timestamp_size_cap: 16_384,
            snapshot_size_cap: 2_000_000,
            targets_size_cap: 5_000_000,
            target_size_cap_default: 1024 * 1024 * 1024,
            fetch_timeout: Duration::from_secs(30),
            prefix_targets_with_hash: true,
        }
    }
}

impl UpdaterConfig {
    /// Defaults overlaid with `TUF_*` variables from the process environment.
    pub fn from_os_env() -> Self {
        Self::from_env_iter(env::vars())
    }

    /// Defaults overlaid with `TUF_*` entries from an iterator (typically for tests).
    ///
    /// Unparseable or zero values are ignored with a warning.
    pub fn from_env_iter<I, K, V>(iter: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let defaults = Self::default();
        let number = |name: &str, default: u64| parse_positive(name, map.get(name), default);
        let count = |name: &str, default: usize| {
            usize::try_from(number(name, default as u64)).unwrap_or(default)
        };

        Self {
            max_root_rotations: number(ENV_MAX_ROOT_ROTATIONS, defaults.max_root_rotations),
            max_delegations: count(ENV_MAX_DELEGATIONS, defaults.max_delegations),
            max_delegation_depth: count(ENV_MAX_DELEGATION_DEPTH, defaults.max_delegation_depth),
            root_size_cap: number(ENV_ROOT_SIZE_CAP, defaults.root_size_cap),
            timestamp_size_cap: number(ENV_TIMESTAMP_SIZE_CAP, defaults.timestamp_size_cap),
            snapshot_size_cap: number(ENV_SNAPSHOT_SIZE_CAP, defaults.snapshot_size_cap),
            targets_size_cap: number(ENV_TARGETS_SIZE_CAP, defaults.targets_size_cap),
            target_size_cap_default: number(ENV_TARGET_SIZE_CAP, defaults.target_size_cap_default),
            fetch_timeout: Duration::from_secs(number(
                ENV_FETCH_TIMEOUT,
                defaults.fetch_timeout.as_secs(),
            )),
            prefix_targets_with_hash: parse_bool(
                map.get(ENV_PREFIX_TARGETS_WITH_HASH).map(String::as_str),
                defaults.prefix_targets_with_hash,
            ),
        }
    }
}

/// Parses a strictly positive integer, falling back to `default`.
fn parse_positive(name: &str, value: Option<&String>, default: u64) -> u64 {
    let Some(raw) = value.map(|v| v.trim()).filter(|v| !v.is_empty()) else {
        return default;
    };
    match raw.parse::<u64>() {
        Ok(parsed) if parsed > 0 => parsed,
        _ => {
            warn!(variable = name, value = raw, default, "tuf: ignoring invalid limit override");
            default
        }
    }
}

/// Parses boolean values from strings, falling back to the provided default.
fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value.map(|s| s.trim().to_ascii_lowercase()) {
        Some(ref v) if ["1", "true", "t", "yes", "y"].contains(&v.as_str()) => true,
        Some(ref v) if ["0", "false", "f", "no", "n"].contains(&v.as_str()) => false,
        _ => default,
    }
}
