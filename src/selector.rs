// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Name matching and provider selection.
//!
//! All selection in the core reduces to dns-suffix matching: providers
//! declare included/excluded domains, zones have a canonical domain, and an
//! entry is routed to the provider with the longest winning match.
//!
//! A provider covers a name only when inclusion strictly dominates
//! exclusion: `match = ilen > elen ? ilen : 0`.

use crate::dnsset::normalize_dns_name;
use crate::state::provider_state::ProviderState;
use std::sync::Arc;

/// Length of `domain` if `dns_name` equals it or is a subdomain of it,
/// else 0. Both sides are normalized before comparison.
#[must_use]
pub fn match_domain_len(dns_name: &str, domain: &str) -> usize {
    let name = normalize_dns_name(dns_name);
    let domain = normalize_dns_name(domain);
    if domain.is_empty() {
        return 0;
    }
    if name == domain {
        return domain.len();
    }
    let suffix = format!(".{domain}");
    if name.ends_with(&suffix) {
        return domain.len();
    }
    0
}

/// Longest match of `dns_name` against a list of domains; 0 if none match.
#[must_use]
pub fn best_match_len(dns_name: &str, domains: &[String]) -> usize {
    domains
        .iter()
        .map(|d| match_domain_len(dns_name, d))
        .max()
        .unwrap_or(0)
}

/// Provider match score for a name.
///
/// The longest included-domain match must strictly dominate the longest
/// excluded-domain match, otherwise the provider does not cover the name.
#[must_use]
pub fn provider_match_len(dns_name: &str, included: &[String], excluded: &[String]) -> usize {
    let ilen = best_match_len(dns_name, included);
    let elen = best_match_len(dns_name, excluded);
    if ilen > elen {
        ilen
    } else {
        0
    }
}

/// Select the provider responsible for `dns_name`.
///
/// Iterates all valid providers and keeps the one with the highest match
/// score. Ties are broken first toward the provider whose update group
/// equals the entry's, then toward the lexicographically smaller account
/// hash so selection stays deterministic.
///
/// Returns `None` when no provider matches; the caller reports "no matching
/// provider" on the entry.
#[must_use]
pub fn lookup_for<'a, I>(
    providers: I,
    dns_name: &str,
    update_group: &str,
) -> Option<Arc<ProviderState>>
where
    I: IntoIterator<Item = &'a Arc<ProviderState>>,
{
    let mut found: Option<(&Arc<ProviderState>, usize)> = None;
    for provider in providers {
        if !provider.valid {
            continue;
        }
        let len = provider.match_name(dns_name);
        if len == 0 {
            continue;
        }
        match found {
            None => found = Some((provider, len)),
            Some((best, best_len)) => {
                if len > best_len {
                    found = Some((provider, len));
                } else if len == best_len && better_tie_break(provider, best, update_group) {
                    found = Some((provider, len));
                }
            }
        }
    }
    found.map(|(p, _)| p.clone())
}

/// True if `candidate` wins the tie against `current` for an entry in
/// `update_group`.
fn better_tie_break(
    candidate: &Arc<ProviderState>,
    current: &Arc<ProviderState>,
    update_group: &str,
) -> bool {
    let candidate_grouped = candidate.update_group == update_group;
    let current_grouped = current.update_group == update_group;
    if candidate_grouped != current_grouped {
        return candidate_grouped;
    }
    candidate.account_hash() < current.account_hash()
}

#[cfg(test)]
#[path = "selector_tests.rs"]
mod selector_tests;
