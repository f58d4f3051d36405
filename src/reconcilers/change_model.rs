// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! The change model: per-zone diffing of desired against observed record
//! sets.
//!
//! A [`ChangeModel`] lives for exactly one zone reconciliation. `setup`
//! reads the observed sets and distributes every observed name into a
//! per-provider change group (or the dangling bucket when no live provider
//! claims it). `apply`/`delete` record intents and append the minimal
//! create/update/delete requests; `cleanup` removes leftover sets owned by
//! this controller; `update` executes each group's requests in batches
//! against its provider.
//!
//! Groups are keyed by `(account hash, provider update group)`. Two entries
//! whose providers share credentials but sit in different update groups must
//! never collapse into one group; the update group is part of the provider
//! contract for exactly this reason.

use crate::config::Config;
use crate::constants::DEFAULT_PREFIX;
use crate::dns_errors::DnsError;
use crate::dnsset::{DnsSet, DnsSetName, DnsSets, Ownership, RecordType, RoutingPolicy, Target};
use crate::metrics;
use crate::provider::{ChangeRequest, Done, ZoneState};
use crate::selector::lookup_for;
use crate::state::provider_state::ProviderState;
use crate::state::zone::ZoneInfo;
use crate::zone_cache::ZoneStateCache;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of one `apply` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Change requests were queued; `update` will execute them
    Applied,
    /// Desired state already matches the observed state; nothing queued
    QueuedNoOp,
    /// A provider rate limiter deferred the application; retry after the
    /// delay. The name counts as applied so cleanup leaves it alone.
    RateLimited(Duration),
}

/// Group key: account hash plus the provider's update group.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChangeGroupKey {
    /// SHA-224 account hash of the provider
    pub account_hash: String,
    /// The provider's update group (provenance boundary)
    pub update_group: String,
}

impl ChangeGroupKey {
    fn for_provider(provider: &ProviderState) -> Self {
        Self {
            account_hash: provider.account_hash().to_string(),
            update_group: provider.update_group.clone(),
        }
    }
}

/// One provider's bundle of pending change requests.
pub struct ChangeGroup {
    /// The provider executing this group
    pub provider: Arc<ProviderState>,
    /// Observed sets distributed to this group during setup
    pub observed: DnsSets,
    /// Pending requests, in emission order
    pub requests: Vec<ChangeRequest>,
}

/// Per-zone aggregate driving one reconciliation.
pub struct ChangeModel {
    cfg: Arc<Config>,
    ownership: Ownership,
    zone: Arc<ZoneInfo>,
    providers: Vec<Arc<ProviderState>>,
    default_provider: Arc<ProviderState>,
    /// Resolved addresses for CNAME synthesis, fed by the lookup processor
    resolved: HashMap<String, Vec<IpAddr>>,
    observed: DnsSets,
    /// Group each observed name was distributed to; `None` means dangling
    observed_groups: HashMap<DnsSetName, Option<ChangeGroupKey>>,
    /// Names touched by apply/delete; cleanup leaves them alone
    touched: HashSet<DnsSetName>,
    /// Desired sets recorded by apply (including pseudo-applies)
    applied: HashMap<DnsSetName, DnsSet>,
    /// Observed names no live provider claims
    dangling: DnsSets,
    groups: BTreeMap<ChangeGroupKey, ChangeGroup>,
    ready: bool,
}

impl ChangeModel {
    /// Build a model for one zone reconciliation.
    #[must_use]
    pub fn new(
        cfg: Arc<Config>,
        ownership: Ownership,
        zone: Arc<ZoneInfo>,
        providers: Vec<Arc<ProviderState>>,
        default_provider: Arc<ProviderState>,
    ) -> Self {
        Self {
            cfg,
            ownership,
            zone,
            providers,
            default_provider,
            resolved: HashMap::new(),
            observed: DnsSets::new(),
            observed_groups: HashMap::new(),
            touched: HashSet::new(),
            applied: HashMap::new(),
            dangling: DnsSets::new(),
            groups: BTreeMap::new(),
            ready: false,
        }
    }

    /// Feed resolved addresses for multi-CNAME synthesis.
    pub fn set_resolved_addresses(&mut self, resolved: HashMap<String, Vec<IpAddr>>) {
        self.resolved = resolved;
    }

    /// Read the observed sets of the zone (through the cache) and
    /// distribute each observed name into its provider group.
    ///
    /// # Errors
    ///
    /// Propagates the zone read failure; the model is unusable afterwards.
    pub async fn setup(&mut self, cache: &ZoneStateCache) -> Result<(), DnsError> {
        let state = cache
            .get(&self.zone, self.default_provider.account.handler())
            .await?;
        self.distribute_observed(state);
        self.ready = true;
        Ok(())
    }

    fn distribute_observed(&mut self, state: ZoneState) {
        for (name, set) in &state.dns_sets {
            match lookup_for(&self.providers, &name.dns_name, "") {
                Some(provider) => {
                    let key = ChangeGroupKey::for_provider(&provider);
                    self.group_for(&provider)
                        .observed
                        .insert(name.clone(), set.clone());
                    self.observed_groups.insert(name.clone(), Some(key));
                }
                None => {
                    self.dangling.insert(name.clone(), set.clone());
                    self.observed_groups.insert(name.clone(), None);
                }
            }
        }
        debug!(
            zone = %self.zone.id,
            observed = state.dns_sets.len(),
            dangling = self.dangling.len(),
            "Distributed observed record sets"
        );
        self.observed = state.dns_sets;
    }

    fn group_for(&mut self, provider: &Arc<ProviderState>) -> &mut ChangeGroup {
        let key = ChangeGroupKey::for_provider(provider);
        self.groups.entry(key).or_insert_with(|| ChangeGroup {
            provider: provider.clone(),
            observed: DnsSets::new(),
            requests: Vec::new(),
        })
    }

    /// The provider groups accumulated so far.
    #[must_use]
    pub fn provider_groups(&self) -> &BTreeMap<ChangeGroupKey, ChangeGroup> {
        &self.groups
    }

    /// Observed sets nobody claims.
    #[must_use]
    pub fn dangling(&self) -> &DnsSets {
        &self.dangling
    }

    /// Desired sets recorded by apply calls, pseudo-applies included.
    #[must_use]
    pub fn applied(&self) -> &HashMap<DnsSetName, DnsSet> {
        &self.applied
    }

    /// Record the intent that `name` should resolve to `targets`.
    ///
    /// Selects a provider, diffs against the observed set and queues the
    /// minimal change requests in that provider's group. Repeated calls for
    /// the same name replace the earlier requests.
    ///
    /// # Errors
    ///
    /// - [`DnsError::NoMatchingProvider`] when selection fails
    /// - [`DnsError::AlreadyBusyForOwner`] when the observed set belongs to
    ///   a foreign controller
    ///
    /// Both are also reported through `done`.
    #[allow(clippy::too_many_arguments)]
    pub fn apply(
        &mut self,
        name: &DnsSetName,
        update_group: &str,
        done: &Done,
        targets: &[Target],
        ttl: u64,
        routing_policy: Option<RoutingPolicy>,
    ) -> Result<ApplyOutcome, DnsError> {
        debug_assert!(self.ready, "apply before setup");
        let Some(provider) = lookup_for(&self.providers, &name.dns_name, update_group) else {
            let err = DnsError::NoMatchingProvider {
                dns_name: name.dns_name.clone(),
            };
            done.failed(&err);
            return Err(err);
        };

        let observed = self.observed.get(name).cloned();
        if let Some(observed) = &observed {
            if observed.is_foreign(&self.ownership) {
                let err = DnsError::AlreadyBusyForOwner {
                    owner: observed.owner().unwrap_or("unknown").to_string(),
                };
                done.failed(&err);
                return Err(err);
            }
        }

        // provider rate limit gate: pseudo-apply and retry later
        if let Some(limiter) = &provider.rate_limiter {
            if let Err(delay) = limiter.try_accept() {
                self.touched.insert(name.clone());
                if let Some(observed) = observed {
                    self.applied.insert(name.clone(), observed);
                }
                done.throttled();
                return Ok(ApplyOutcome::RateLimited(delay));
            }
        }

        let desired =
            self.new_dns_set_for_targets(name, observed.as_ref(), ttl, routing_policy, targets);
        let requests = self.diff(name, observed.as_ref(), &desired, &provider, done);

        self.touched.insert(name.clone());
        self.applied.insert(name.clone(), desired);
        if requests.is_empty() {
            return Ok(ApplyOutcome::QueuedNoOp);
        }
        self.replace_requests_for(name);
        for (route, request) in requests {
            self.groups
                .get_mut(&route)
                .expect("route to unknown group")
                .requests
                .push(request);
        }
        Ok(ApplyOutcome::Applied)
    }

    /// Like `apply`, but queues nothing: reports whether a modification
    /// would occur. Used under rate limiting and for dry runs.
    ///
    /// # Errors
    ///
    /// Same selection and ownership errors as `apply`, without done-handler
    /// side effects.
    pub fn check(
        &mut self,
        name: &DnsSetName,
        update_group: &str,
        targets: &[Target],
        ttl: u64,
        routing_policy: Option<RoutingPolicy>,
    ) -> Result<bool, DnsError> {
        let Some(provider) = lookup_for(&self.providers, &name.dns_name, update_group) else {
            return Err(DnsError::NoMatchingProvider {
                dns_name: name.dns_name.clone(),
            });
        };
        let observed = self.observed.get(name).cloned();
        if let Some(observed) = &observed {
            if observed.is_foreign(&self.ownership) {
                return Err(DnsError::AlreadyBusyForOwner {
                    owner: observed.owner().unwrap_or("unknown").to_string(),
                });
            }
        }
        let desired =
            self.new_dns_set_for_targets(name, observed.as_ref(), ttl, routing_policy, targets);
        let noop: Done = Arc::new(NoopDone);
        let requests = self.diff(name, observed.as_ref(), &desired, &provider, &noop);
        Ok(!requests.is_empty())
    }

    /// Mark `name` as touched without emitting requests, keeping any
    /// observed records through cleanup. Used for stale entries whose
    /// records must survive an invalid spec.
    pub fn retain(&mut self, name: &DnsSetName) {
        self.touched.insert(name.clone());
    }

    /// Schedule removal of every record type observed for `name`.
    ///
    /// Returns `false` when nothing is observed for the name.
    pub fn delete(&mut self, name: &DnsSetName, update_group: &str, done: &Done) -> bool {
        debug_assert!(self.ready, "delete before setup");
        self.touched.insert(name.clone());
        let Some(observed) = self.observed.get(name).cloned() else {
            return false;
        };
        let route = self.route_for_observed(name, update_group);
        let Some(route) = route else {
            warn!(zone = %self.zone.id, name = %name, "No provider can delete dangling records");
            return false;
        };
        self.replace_requests_for(name);
        let mut emitted = false;
        for rtype in observed.record_types() {
            let request = ChangeRequest::delete(rtype, observed.clone(), Some(done.clone()));
            self.groups
                .get_mut(&route)
                .expect("route to unknown group")
                .requests
                .push(request);
            emitted = true;
        }
        emitted
    }

    /// Emit deletions for every observed set owned by this controller that
    /// no apply/delete touched. Foreign and unowned sets are left alone.
    ///
    /// Returns whether any deletion was queued.
    pub fn cleanup(&mut self) -> bool {
        debug_assert!(self.ready, "cleanup before setup");
        let leftover: Vec<(DnsSetName, DnsSet)> = self
            .observed
            .iter()
            .filter(|(name, _)| !self.touched.contains(*name))
            .map(|(name, set)| (name.clone(), set.clone()))
            .collect();

        let mut modified = false;
        for (name, set) in leftover {
            if !set.is_owned_by(&self.ownership) {
                continue;
            }
            let Some(route) = self.route_for_observed(&name, "") else {
                info!(
                    zone = %self.zone.id,
                    name = %name,
                    "Obsolete owned records are dangling, keeping them"
                );
                continue;
            };
            info!(zone = %self.zone.id, name = %name, "Cleaning up obsolete record sets");
            for rtype in set.record_types() {
                let request = ChangeRequest::delete(rtype, set.clone(), None);
                self.groups
                    .get_mut(&route)
                    .expect("route to unknown group")
                    .requests
                    .push(request);
                modified = true;
            }
        }
        modified
    }

    /// Execute every group's requests in batches against its provider.
    ///
    /// Successful batches mutate the cached zone state in place; a batch
    /// failure invalidates the cache, fails the remaining requests' done
    /// handlers and aborts the group.
    ///
    /// # Errors
    ///
    /// The first batch failure, after bookkeeping.
    pub async fn update(&mut self, cache: &ZoneStateCache) -> Result<(), DnsError> {
        debug_assert!(self.ready, "update before setup");
        let state = ZoneState::new(self.observed.clone());
        let mut first_error: Option<DnsError> = None;

        for (key, group) in &mut self.groups {
            if group.requests.is_empty() {
                continue;
            }
            let handler = group.provider.account.handler().clone();
            let batch_size = self.cfg.batch_size.max(1);
            let mut failed_at: Option<(usize, DnsError)> = None;

            for (index, batch) in group.requests.chunks(batch_size).enumerate() {
                match Self::execute_batch(&handler, &self.zone, &state, batch, self.cfg.max_retries)
                    .await
                {
                    Ok(()) => {
                        cache.apply_requests(&self.zone.id, batch, true);
                        for request in batch {
                            metrics::record_change_requests(&request.action.to_string(), 1);
                        }
                    }
                    Err(err) => {
                        warn!(
                            zone = %self.zone.id,
                            group = ?key,
                            batch = index,
                            error = %err,
                            "Change batch failed"
                        );
                        cache.apply_requests(&self.zone.id, batch, false);
                        failed_at = Some((index, err));
                        break;
                    }
                }
            }

            if let Some((index, err)) = failed_at {
                // requests in batches never attempted still owe a callback
                for batch in group.requests.chunks(batch_size).skip(index + 1) {
                    for request in batch {
                        if let Some(done) = &request.done {
                            done.failed(&err);
                        }
                    }
                }
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Number of queued requests across all groups.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.groups.values().map(|g| g.requests.len()).sum()
    }

    /// Execute one batch, waiting out upstream throttling up to the retry
    /// cap. Other failures are not retried here; the zone back-off handles
    /// them.
    async fn execute_batch(
        handler: &Arc<dyn crate::provider::DnsHandler>,
        zone: &ZoneInfo,
        state: &ZoneState,
        batch: &[ChangeRequest],
        max_retries: u32,
    ) -> Result<(), DnsError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match handler.execute_requests(zone, state, batch).await {
                Err(DnsError::Throttled { delay }) if attempt <= max_retries => {
                    debug!(zone = %zone.id, attempt, ?delay, "Upstream throttled, retrying batch");
                    tokio::time::sleep(delay.min(Duration::from_secs(30))).await;
                }
                other => return other,
            }
        }
    }

    // ========================================================================
    // internals
    // ========================================================================

    /// Build the desired set for `name` from the entry targets.
    ///
    /// Multiple CNAME targets are synthesized into address records using the
    /// lookup processor's resolved addresses; the original hostnames are
    /// recorded in the sorted `cnames` attribute.
    fn new_dns_set_for_targets(
        &self,
        name: &DnsSetName,
        observed: Option<&DnsSet>,
        ttl: u64,
        routing_policy: Option<RoutingPolicy>,
        targets: &[Target],
    ) -> DnsSet {
        let mut desired = DnsSet::new(name.clone());
        desired.routing_policy = routing_policy;

        if observed.is_none_or(|o| !o.is_foreign(&self.ownership)) {
            desired.set_owner(&self.cfg.ident, DEFAULT_PREFIX);
        }

        let cnames: Vec<&Target> = targets
            .iter()
            .filter(|t| t.rtype == RecordType::CNAME)
            .collect();
        if cnames.len() > 1 {
            let mut hostnames = Vec::with_capacity(cnames.len());
            for target in cnames {
                hostnames.push(target.value.clone());
                if let Some(addrs) = self.resolved.get(&target.value) {
                    for addr in addrs {
                        let rtype = match addr {
                            IpAddr::V4(_) => RecordType::A,
                            IpAddr::V6(_) => RecordType::AAAA,
                        };
                        desired.add_record(rtype, ttl, &addr.to_string());
                    }
                }
            }
            desired.set_cnames(hostnames);
        } else {
            for target in targets {
                desired.add_record(target.rtype, ttl, &target.value);
            }
        }
        desired
    }

    /// Per-type diff between `observed` and `desired`, routed per provider.
    fn diff(
        &mut self,
        name: &DnsSetName,
        observed: Option<&DnsSet>,
        desired: &DnsSet,
        provider: &Arc<ProviderState>,
        done: &Done,
    ) -> Vec<(ChangeGroupKey, ChangeRequest)> {
        let new_key = ChangeGroupKey::for_provider(provider);
        // materialize the target group
        let _ = self.group_for(provider);
        let mut out = Vec::new();

        let Some(observed) = observed else {
            for rtype in desired.record_types() {
                out.push((
                    new_key.clone(),
                    ChangeRequest::create(rtype, desired.clone(), Some(done.clone())),
                ));
            }
            return out;
        };

        let old_key = self.observed_groups.get(name).cloned().flatten();
        let provider_changed = old_key.as_ref().is_some_and(|k| *k != new_key);
        // deletes run under the credentials that own the observed records,
        // falling back to the newly selected provider for dangling sets
        let delete_route = match &old_key {
            Some(key) if self.groups.contains_key(key) => key.clone(),
            _ => new_key.clone(),
        };

        if provider_changed {
            // no in-place update across providers
            for rtype in desired.record_types() {
                out.push((
                    new_key.clone(),
                    ChangeRequest::create(rtype, desired.clone(), Some(done.clone())),
                ));
            }
            for rtype in observed.record_types() {
                out.push((
                    delete_route.clone(),
                    ChangeRequest::delete(rtype, observed.clone(), Some(done.clone())),
                ));
            }
            return out;
        }

        // a routing-policy change rewrites every set of the name, even when
        // the record values themselves still match
        let policy_changed = observed.routing_policy != desired.routing_policy;
        for rtype in desired.record_types() {
            match observed.get(rtype) {
                None => out.push((
                    new_key.clone(),
                    ChangeRequest::create(rtype, desired.clone(), Some(done.clone())),
                )),
                Some(oset)
                    if oset == desired.get(rtype).expect("desired set exists")
                        && !policy_changed => {}
                Some(_) => out.push((
                    new_key.clone(),
                    ChangeRequest::update(
                        rtype,
                        desired.clone(),
                        observed.clone(),
                        Some(done.clone()),
                    ),
                )),
            }
        }
        for rtype in observed.record_types() {
            if desired.get(rtype).is_none() {
                out.push((
                    delete_route.clone(),
                    ChangeRequest::delete(rtype, observed.clone(), Some(done.clone())),
                ));
            }
        }
        out
    }

    /// Drop earlier requests for `name` across all groups (at-most-one
    /// request per `(name, type)` in one model; later applies win).
    fn replace_requests_for(&mut self, name: &DnsSetName) {
        for group in self.groups.values_mut() {
            group.requests.retain(|r| r.name() != name);
        }
    }

    /// The group responsible for an observed name's records.
    fn route_for_observed(
        &mut self,
        name: &DnsSetName,
        update_group: &str,
    ) -> Option<ChangeGroupKey> {
        if let Some(Some(key)) = self.observed_groups.get(name) {
            if self.groups.contains_key(key) {
                return Some(key.clone());
            }
        }
        let provider = lookup_for(&self.providers, &name.dns_name, update_group)?;
        let key = ChangeGroupKey::for_provider(&provider);
        let _ = self.group_for(&provider);
        Some(key)
    }
}

struct NoopDone;

impl crate::provider::DoneHandler for NoopDone {
    fn succeeded(&self) {}
    fn failed(&self, _err: &DnsError) {}
    fn throttled(&self) {}
    fn set_invalid(&self, _err: &DnsError) {}
}

#[cfg(test)]
#[path = "change_model_tests.rs"]
mod change_model_tests;
