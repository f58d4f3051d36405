// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Injected configuration for the reconciliation core.
//!
//! All tunables live in one [`Config`] struct that is passed into
//! constructors; nothing in the core reads global state. The surrounding
//! controller manager builds the struct from its own flag/file handling and
//! hands it down as `Arc<Config>`.

use crate::constants;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

/// Provider-call rate limit options.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterOptions {
    /// Whether provider-call rate limiting is enforced
    pub enabled: bool,
    /// Sustained requests per second granted to each provider
    pub qps: u32,
    /// Burst capacity on top of the sustained rate
    pub burst: u32,
}

impl Default for RateLimiterOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            qps: 10,
            burst: 20,
        }
    }
}

/// Configuration of the reconciliation core.
///
/// Field names follow the option table of the controller; durations are
/// stored in seconds (or milliseconds where noted) so the struct stays
/// serde-friendly, with typed accessors alongside.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Responsibility selector for entry objects
    pub class: String,

    /// Owner id this controller stamps on records it manages
    pub ident: String,

    /// Default record TTL in seconds
    pub ttl: u64,

    /// Hosted-zone cache TTL in seconds
    pub cache_ttl: u64,

    /// Minimum inter-zone-reconciliation delay in seconds
    pub dns_delay: u64,

    /// Delay in seconds after losing the provider for an entry
    pub reschedule_delay: u64,

    /// Parallelism of the initial sweep
    pub setup: usize,

    /// Bypass the zone state cache entirely
    pub disable_zone_state_caching: bool,

    /// Per-provider change-request batch cap
    pub batch_size: usize,

    /// Provider pagination/throttling retry cap
    pub max_retries: u32,

    /// Zone ids to treat as non-existent
    pub blocked_zones: BTreeSet<String>,

    /// Provider-call rate limit
    pub rate_limiter: RateLimiterOptions,

    /// Directory for persisted zone-state cache files; `None` disables
    /// persistence
    pub cache_dir: Option<PathBuf>,

    /// Number of concurrently running lookup jobs
    pub concurrent_lookups: usize,

    /// Lookup scheduler check period in milliseconds
    pub lookup_check_period_millis: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            class: "rezone".to_string(),
            ident: "rezone".to_string(),
            ttl: constants::DEFAULT_RECORD_TTL,
            cache_ttl: constants::DEFAULT_CACHE_TTL.as_secs(),
            dns_delay: constants::DEFAULT_DNS_DELAY.as_secs(),
            reschedule_delay: constants::DEFAULT_RESCHEDULE_DELAY.as_secs(),
            setup: 10,
            disable_zone_state_caching: false,
            batch_size: constants::DEFAULT_BATCH_SIZE,
            max_retries: constants::DEFAULT_MAX_RETRIES,
            blocked_zones: BTreeSet::new(),
            rate_limiter: RateLimiterOptions::default(),
            cache_dir: None,
            concurrent_lookups: constants::DEFAULT_CONCURRENT_LOOKUPS,
            lookup_check_period_millis: constants::LOOKUP_CHECK_PERIOD.as_millis() as u64,
        }
    }
}

impl Config {
    /// Minimum delay between two reconciliations of the same zone.
    #[must_use]
    pub fn dns_delay(&self) -> Duration {
        Duration::from_secs(self.dns_delay)
    }

    /// Delay applied to an entry after it loses its provider.
    #[must_use]
    pub fn reschedule_delay(&self) -> Duration {
        Duration::from_secs(self.reschedule_delay)
    }

    /// TTL of a cached zone state.
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl)
    }

    /// Lookup scheduler check period.
    #[must_use]
    pub fn lookup_check_period(&self) -> Duration {
        Duration::from_millis(self.lookup_check_period_millis)
    }

    /// Whether the given zone id is administratively blocked.
    #[must_use]
    pub fn is_zone_blocked(&self, zone_id: &str) -> bool {
        self.blocked_zones.contains(zone_id)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod config_tests;
