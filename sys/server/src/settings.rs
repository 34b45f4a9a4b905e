// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Environment-driven tuning knobs.
//!
//! All of these have working defaults; the environment only overrides.
//! Malformed values are reported as errors at init, never silently
//! replaced with the default.

use std::time::Duration;

use abi::Rank;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SettingsError {
    /// Variable name and the rejected value.
    BadValue(&'static str, String),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HostmapMode {
    Enabled,
    Leaders,
    Disabled,
}

#[derive(Clone, Debug)]
pub struct Settings {
    /// Quiescence threshold before the master starts a global idle check.
    pub max_idle: Duration,
    /// Minimum gap after a fruitless steal attempt.
    pub steal_backoff: Duration,
    /// Minimum gap between any two steal attempts from one server.
    pub steal_rate_limit: Duration,
    /// Serve-loop budgets before yielding back to the outer loop.
    pub loop_max_requests: u32,
    pub loop_max_polls: u32,
    pub loop_max_sleeps: u32,
    pub debug: bool,
    pub trace: bool,
    /// Ranks allowed to emit debug logging; `None` = all.
    pub debug_ranks: Option<Vec<Rank>>,
    pub perf_counters: bool,
    pub perf_counters_print: bool,
    /// Capacity of each closed-id LRU cache.
    pub closed_cache_size: usize,
    pub hostmap_mode: HostmapMode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_idle: Duration::from_millis(100),
            steal_backoff: Duration::from_millis(20),
            steal_rate_limit: Duration::from_micros(500),
            loop_max_requests: 128,
            loop_max_polls: 10_000,
            loop_max_sleeps: 100,
            debug: false,
            trace: false,
            debug_ranks: None,
            perf_counters: false,
            perf_counters_print: false,
            closed_cache_size: 4096,
            hostmap_mode: HostmapMode::Enabled,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, SettingsError> {
        let mut s = Self::default();

        if let Some(v) = env_seconds("MAX_IDLE")? {
            s.max_idle = v;
        }
        if let Some(v) = env_seconds("STEAL_BACKOFF")? {
            s.steal_backoff = v;
        }
        if let Some(v) = env_seconds("STEAL_RATE_LIMIT")? {
            s.steal_rate_limit = v;
        }
        if let Some(v) = env_u32("LOOP_MAX_REQUESTS")? {
            s.loop_max_requests = v;
        }
        if let Some(v) = env_u32("LOOP_MAX_POLLS")? {
            s.loop_max_polls = v;
        }
        if let Some(v) = env_u32("LOOP_MAX_SLEEPS")? {
            s.loop_max_sleeps = v;
        }
        if let Some(v) = env_bool("DEBUG")? {
            s.debug = v;
        }
        if let Some(v) = env_bool("TRACE")? {
            s.trace = v;
        }
        if let Some(v) = env_ranks("DEBUG_RANKS")? {
            s.debug_ranks = Some(v);
        }
        if let Some(v) = env_bool("PERF_COUNTERS")? {
            s.perf_counters = v;
        }
        if let Some(v) = env_bool("PERF_COUNTERS_PRINT")? {
            s.perf_counters_print = v;
        }
        if let Some(v) = env_u32("CLOSED_CACHE_SIZE")? {
            s.closed_cache_size = v as usize;
        }
        if let Some(v) = env_hostmap("HOSTMAP_MODE")? {
            s.hostmap_mode = v;
        }
        if let Some(true) = env_bool("DISABLE_HOSTMAP")? {
            s.hostmap_mode = HostmapMode::Disabled;
        }

        Ok(s)
    }

    /// Should this rank emit debug-level logging?
    pub fn debug_enabled(&self, rank: Rank) -> bool {
        self.debug && self.rank_selected(rank)
    }

    pub fn trace_enabled(&self, rank: Rank) -> bool {
        self.trace && self.rank_selected(rank)
    }

    fn rank_selected(&self, rank: Rank) -> bool {
        match &self.debug_ranks {
            None => true,
            Some(ranks) => ranks.contains(&rank),
        }
    }
}

fn get(name: &'static str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_seconds(name: &'static str) -> Result<Option<Duration>, SettingsError> {
    let Some(v) = get(name) else { return Ok(None) };
    match v.parse::<f64>() {
        Ok(secs) if secs > 0.0 && secs.is_finite() => {
            Ok(Some(Duration::from_secs_f64(secs)))
        }
        _ => Err(SettingsError::BadValue(name, v)),
    }
}

fn env_u32(name: &'static str) -> Result<Option<u32>, SettingsError> {
    let Some(v) = get(name) else { return Ok(None) };
    v.parse::<u32>()
        .map(Some)
        .map_err(|_| SettingsError::BadValue(name, v))
}

fn env_bool(name: &'static str) -> Result<Option<bool>, SettingsError> {
    let Some(v) = get(name) else { return Ok(None) };
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(Some(true)),
        "0" | "false" | "no" => Ok(Some(false)),
        _ => Err(SettingsError::BadValue(name, v)),
    }
}

fn env_ranks(name: &'static str) -> Result<Option<Vec<Rank>>, SettingsError> {
    let Some(v) = get(name) else { return Ok(None) };
    let mut ranks = Vec::new();
    for part in v.split(',') {
        match part.trim().parse::<Rank>() {
            Ok(r) => ranks.push(r),
            Err(_) => return Err(SettingsError::BadValue(name, v)),
        }
    }
    Ok(Some(ranks))
}

fn env_hostmap(
    name: &'static str,
) -> Result<Option<HostmapMode>, SettingsError> {
    let Some(v) = get(name) else { return Ok(None) };
    match v.to_ascii_uppercase().as_str() {
        "ENABLED" => Ok(Some(HostmapMode::Enabled)),
        "LEADERS" => Ok(Some(HostmapMode::Leaders)),
        "DISABLED" => Ok(Some(HostmapMode::Disabled)),
        _ => Err(SettingsError::BadValue(name, v)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment variables are process-global, so these tests each use
    // distinct names via the parser helpers rather than mutating shared
    // ones concurrently.

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.max_idle, Duration::from_millis(100));
        assert_eq!(s.steal_backoff, Duration::from_millis(20));
        assert_eq!(s.steal_rate_limit, Duration::from_micros(500));
        assert_eq!(s.loop_max_requests, 128);
        assert_eq!(s.closed_cache_size, 4096);
        assert_eq!(s.hostmap_mode, HostmapMode::Enabled);
    }

    #[test]
    fn seconds_parsing() {
        std::env::set_var("TEST_SECONDS_OK", "0.25");
        assert_eq!(
            env_seconds("TEST_SECONDS_OK").unwrap(),
            Some(Duration::from_millis(250)),
        );
        std::env::set_var("TEST_SECONDS_BAD", "-1");
        assert!(env_seconds("TEST_SECONDS_BAD").is_err());
        assert_eq!(env_seconds("TEST_SECONDS_UNSET").unwrap(), None);
    }

    #[test]
    fn bool_parsing() {
        std::env::set_var("TEST_BOOL_T", "TRUE");
        std::env::set_var("TEST_BOOL_F", "0");
        std::env::set_var("TEST_BOOL_BAD", "maybe");
        assert_eq!(env_bool("TEST_BOOL_T").unwrap(), Some(true));
        assert_eq!(env_bool("TEST_BOOL_F").unwrap(), Some(false));
        assert!(env_bool("TEST_BOOL_BAD").is_err());
    }

    #[test]
    fn rank_list_parsing() {
        std::env::set_var("TEST_RANKS", "0, 3,17");
        assert_eq!(env_ranks("TEST_RANKS").unwrap(), Some(vec![0, 3, 17]));
        std::env::set_var("TEST_RANKS_BAD", "0,x");
        assert!(env_ranks("TEST_RANKS_BAD").is_err());
    }

    #[test]
    fn debug_rank_gating() {
        let mut s = Settings {
            debug: true,
            ..Settings::default()
        };
        assert!(s.debug_enabled(5));
        s.debug_ranks = Some(vec![1, 2]);
        assert!(!s.debug_enabled(5));
        assert!(s.debug_enabled(2));
        s.debug = false;
        assert!(!s.debug_enabled(2));
    }
}
