// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Hosted-zone identity and authority model.
//!
//! A hosted zone is identified by `(providerType, id)` and carries a
//! canonical domain. Forwarded sub-domains are holes in the zone's
//! authority: names under them are served elsewhere and never reconciled
//! here.
//!
//! A zone may carry at most one active [`ZonePolicy`]; competing policies
//! are rejected at registration time, first one wins.

use crate::selector::match_domain_len;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identity of a hosted zone at an upstream provider.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ZoneId {
    /// The provider type that hosts the zone (e.g. `aws-route53`)
    pub provider_type: String,
    /// The provider-scoped zone id
    pub id: String,
}

impl ZoneId {
    /// Build a zone id.
    #[must_use]
    pub fn new(provider_type: &str, id: &str) -> Self {
        Self {
            provider_type: provider_type.to_string(),
            id: id.to_string(),
        }
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider_type, self.id)
    }
}

/// Operational policy attached to a hosted zone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZonePolicy {
    /// Name of the policy object claiming the zone
    pub name: String,
    /// Override of the zone-state cache TTL in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone_state_cache_ttl: Option<u64>,
}

/// A discovered hosted zone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneInfo {
    /// Zone identity
    pub id: ZoneId,
    /// Canonical key of the zone (stable across re-discovery)
    pub key: String,
    /// Canonical domain of the zone (normalized, no trailing dot)
    pub domain: String,
    /// Sub-domains forwarded elsewhere; holes in this zone's authority
    pub forwarded_domains: Vec<String>,
    /// Whether the zone is private (split-horizon deployments)
    pub is_private: bool,
    /// The active policy; at most one per zone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<ZonePolicy>,
}

impl ZoneInfo {
    /// Build a zone with no forwarded sub-domains.
    #[must_use]
    pub fn new(id: ZoneId, domain: &str) -> Self {
        let key = id.to_string();
        Self {
            id,
            key,
            domain: crate::dnsset::normalize_dns_name(domain),
            forwarded_domains: Vec::new(),
            is_private: false,
            policy: None,
        }
    }

    /// Attach a policy to the zone.
    ///
    /// # Errors
    ///
    /// Rejects a second, different policy: a zone carries at most one
    /// active policy, and the first claimant keeps it.
    pub fn apply_policy(&mut self, policy: ZonePolicy) -> Result<(), crate::dns_errors::DnsError> {
        match &self.policy {
            None => {
                self.policy = Some(policy);
                Ok(())
            }
            Some(active) if *active == policy => Ok(()),
            Some(active) => Err(crate::dns_errors::DnsError::Config {
                reason: format!(
                    "zone '{}' already bound to policy '{}', rejecting '{}'",
                    self.id, active.name, policy.name
                ),
            }),
        }
    }

    /// The policy's cache-TTL override, if any.
    #[must_use]
    pub fn cache_ttl_override(&self) -> Option<Duration> {
        self.policy
            .as_ref()
            .and_then(|p| p.zone_state_cache_ttl)
            .map(Duration::from_secs)
    }

    /// Authority match: the length of the zone domain if the zone
    /// authoritatively covers `dns_name`, else 0.
    ///
    /// A name is covered when it is a dns-suffix match of the zone domain
    /// and not under any forwarded sub-domain.
    #[must_use]
    pub fn match_name(&self, dns_name: &str) -> usize {
        let len = match_domain_len(dns_name, &self.domain);
        if len == 0 {
            return 0;
        }
        for forwarded in &self.forwarded_domains {
            if match_domain_len(dns_name, forwarded) > 0 {
                return 0;
            }
        }
        len
    }
}

#[cfg(test)]
#[path = "zone_tests.rs"]
mod zone_tests;
