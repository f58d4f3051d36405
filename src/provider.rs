// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! The provider contract implemented by upstream DNS adapters.
//!
//! The core talks to cloud-managed (or in-memory) DNS backends exclusively
//! through [`DnsHandler`]. Adapters live outside this crate; the contract
//! pins down exactly what the reconciliation engine needs:
//!
//! - zone discovery ([`DnsHandler::get_zones`])
//! - full zone reads ([`DnsHandler::get_zone_state`])
//! - batched change execution ([`DnsHandler::execute_requests`]) with
//!   per-request completion reporting
//! - conflict arbitration ([`DnsHandler::report_zone_state_conflict`])

use crate::dns_errors::DnsError;
use crate::dnsset::{DnsSet, DnsSets, RecordType};
use crate::state::zone::ZoneInfo;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// The action of a change request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangeAction {
    /// Create a record set that does not exist upstream
    Create,
    /// Replace an existing record set in place
    Update,
    /// Remove an existing record set
    Delete,
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeAction::Create => "create",
            ChangeAction::Update => "update",
            ChangeAction::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Completion callback for one reconciliation attempt of one entry.
///
/// Exactly one of the methods is effective per attempt; implementations must
/// tolerate (and ignore) later calls in the same attempt.
pub trait DoneHandler: Send + Sync {
    /// All change requests for the entry were applied (or none were needed).
    fn succeeded(&self);
    /// A change request for the entry failed.
    fn failed(&self, err: &DnsError);
    /// The entry was deferred by a rate limiter; retried later.
    fn throttled(&self);
    /// The entry's spec is invalid; not retried until the spec changes.
    fn set_invalid(&self, err: &DnsError);
}

/// Shared completion handle attached to change requests.
pub type Done = Arc<dyn DoneHandler>;

/// A single create/update/delete request against one record set.
///
/// Exactly one of `addition`/`deletion` is set for create/delete; both are
/// set for update (deletion carries the observed set being replaced).
#[derive(Clone)]
pub struct ChangeRequest {
    /// What to do
    pub action: ChangeAction,
    /// The record type this request touches
    pub rtype: RecordType,
    /// The desired record bundle (create/update)
    pub addition: Option<DnsSet>,
    /// The observed record bundle being removed or replaced (update/delete)
    pub deletion: Option<DnsSet>,
    /// Completion callback of the owning entry, if any
    pub done: Option<Done>,
}

impl ChangeRequest {
    /// Build a create request.
    #[must_use]
    pub fn create(rtype: RecordType, addition: DnsSet, done: Option<Done>) -> Self {
        Self {
            action: ChangeAction::Create,
            rtype,
            addition: Some(addition),
            deletion: None,
            done,
        }
    }

    /// Build an update request replacing `deletion` with `addition`.
    #[must_use]
    pub fn update(rtype: RecordType, addition: DnsSet, deletion: DnsSet, done: Option<Done>) -> Self {
        Self {
            action: ChangeAction::Update,
            rtype,
            addition: Some(addition),
            deletion: Some(deletion),
            done,
        }
    }

    /// Build a delete request.
    #[must_use]
    pub fn delete(rtype: RecordType, deletion: DnsSet, done: Option<Done>) -> Self {
        Self {
            action: ChangeAction::Delete,
            rtype,
            deletion: Some(deletion),
            addition: None,
            done,
        }
    }

    /// The set name this request touches.
    ///
    /// # Panics
    ///
    /// Panics if the request violates the addition/deletion invariant; such
    /// a request can only be produced by a bug in the change model.
    #[must_use]
    pub fn name(&self) -> &crate::dnsset::DnsSetName {
        self.addition
            .as_ref()
            .or(self.deletion.as_ref())
            .map(|s| &s.name)
            .expect("change request without addition or deletion")
    }
}

impl fmt::Debug for ChangeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeRequest")
            .field("action", &self.action)
            .field("rtype", &self.rtype)
            .field("name", &self.name().to_string())
            .finish_non_exhaustive()
    }
}

/// The observed record sets of a zone, as read from the upstream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ZoneState {
    /// All record bundles keyed by set name
    pub dns_sets: DnsSets,
}

impl ZoneState {
    /// Wrap a set map.
    #[must_use]
    pub fn new(dns_sets: DnsSets) -> Self {
        Self { dns_sets }
    }
}

/// Provider-declared rate limit for upstream calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimit {
    /// Sustained request budget per day
    pub requests_per_day: u32,
    /// Burst capacity on top of the sustained rate
    pub burst: u32,
}

/// Per-record-set read access for providers that support it (e.g. reading a
/// single TXT lock record without a full zone read).
#[async_trait]
pub trait DedicatedDnsAccess: Send + Sync {
    /// Read the record set of one (name, type) pair.
    async fn get_record_set(
        &self,
        zone: &ZoneInfo,
        name: &crate::dnsset::DnsSetName,
        rtype: RecordType,
    ) -> Result<Option<DnsSet>, DnsError>;
}

/// Contract implemented by upstream DNS provider adapters.
#[async_trait]
pub trait DnsHandler: Send + Sync {
    /// The provider type of this handler (e.g. `aws-route53`).
    fn provider_type(&self) -> &str;

    /// Discover the hosted zones visible to this account.
    async fn get_zones(&self) -> Result<Vec<ZoneInfo>, DnsError>;

    /// Read the full record-set state of a zone.
    async fn get_zone_state(&self, zone: &ZoneInfo) -> Result<ZoneState, DnsError>;

    /// Apply a batch of change requests.
    ///
    /// The batch is atomic at the upstream's granularity; partial success is
    /// surfaced through each request's [`DoneHandler`].
    ///
    /// # Errors
    ///
    /// Returns an error when the batch as a whole failed; per-request
    /// callbacks may still have been invoked for the requests that were
    /// applied before the failure.
    async fn execute_requests(
        &self,
        zone: &ZoneInfo,
        state: &ZoneState,
        requests: &[ChangeRequest],
    ) -> Result<(), DnsError>;

    /// Decide whether a zone-state conflict warrants a refetch.
    async fn report_zone_state_conflict(&self, _zone: &ZoneInfo, _err: &DnsError) -> bool {
        false
    }

    /// Per-record-set read access, if the provider supports it.
    fn dedicated_dns_access(&self) -> Option<&dyn DedicatedDnsAccess> {
        None
    }

    /// Release upstream resources held by this handler.
    ///
    /// Called exactly once, when the last provider sharing the handler's
    /// account releases it.
    async fn shutdown(&self) {}
}
