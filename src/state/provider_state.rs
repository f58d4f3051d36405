// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Live provider records tracked by the state layer.
//!
//! A [`ProviderState`] is an immutable snapshot of one registered provider:
//! its selection domains/zones after validation, its shared account, its
//! update group (the provenance key, typically the namespace of the provider
//! object) and an optional rate limiter. The registry replaces the whole
//! snapshot on provider updates.

use crate::account::DnsAccount;
use crate::rate_limiter::ProviderRateLimiter;
use crate::selector::provider_match_len;
use crate::state::zone::ZoneInfo;
use std::sync::Arc;

/// Snapshot of one registered provider.
#[derive(Clone)]
pub struct ProviderState {
    /// Cluster-unique provider name
    pub name: String,
    /// Provenance key preventing change groups from collapsing across
    /// provider boundaries that merely share credentials
    pub update_group: String,
    /// The shared upstream account
    pub account: Arc<DnsAccount>,
    /// Domains this provider answers for (disjoint from excluded after
    /// selection)
    pub included_domains: Vec<String>,
    /// Domains carved out of the included set
    pub excluded_domains: Vec<String>,
    /// Explicit zone-id allow list; empty means "any discovered zone"
    pub included_zones: Vec<String>,
    /// Explicit zone-id deny list
    pub excluded_zones: Vec<String>,
    /// Default record TTL for entries served by this provider
    pub default_ttl: Option<u64>,
    /// Optional provider-call rate limiter
    pub rate_limiter: Option<Arc<ProviderRateLimiter>>,
    /// False while the provider's configuration is rejected
    pub valid: bool,
}

impl ProviderState {
    /// Build a valid provider snapshot with the given selection domains.
    #[must_use]
    pub fn new(
        name: &str,
        update_group: &str,
        account: Arc<DnsAccount>,
        included_domains: Vec<String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            update_group: update_group.to_string(),
            account,
            included_domains,
            excluded_domains: Vec::new(),
            included_zones: Vec::new(),
            excluded_zones: Vec::new(),
            default_ttl: None,
            rate_limiter: None,
            valid: true,
        }
    }

    /// The account hash shared with providers presenting equal credentials.
    #[must_use]
    pub fn account_hash(&self) -> &str {
        &self.account.hash
    }

    /// Match score of `dns_name` against this provider's selection; 0 means
    /// "does not match".
    #[must_use]
    pub fn match_name(&self, dns_name: &str) -> usize {
        provider_match_len(dns_name, &self.included_domains, &self.excluded_domains)
    }

    /// Whether this provider covers the given hosted zone.
    #[must_use]
    pub fn covers_zone(&self, zone: &ZoneInfo) -> bool {
        let zone_key = zone.id.to_string();
        if self.excluded_zones.iter().any(|z| *z == zone_key) {
            return false;
        }
        if !self.included_zones.is_empty() {
            return self.included_zones.iter().any(|z| *z == zone_key);
        }
        self.match_name(&zone.domain) > 0
    }
}

impl std::fmt::Debug for ProviderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderState")
            .field("name", &self.name)
            .field("update_group", &self.update_group)
            .field("account", &self.account.hash)
            .field("included_domains", &self.included_domains)
            .field("excluded_domains", &self.excluded_domains)
            .field("valid", &self.valid)
            .finish_non_exhaustive()
    }
}
