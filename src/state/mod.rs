// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! The state layer: entry index, provider/zone registries and duplicate
//! handling.
//!
//! One read/write lock guards the entry index, the DNS-name index, the
//! provider and zone maps and the blocking-entries map. Per-entry spin locks
//! exist inside the state lock so updates can drop to entry scope without
//! blocking unrelated entries.
//!
//! The layer never calls into the scheduler directly; everything it wants
//! reconciled is emitted as a [`Trigger`] through an injected channel.

pub mod entry;
pub mod lock;
pub mod provider_state;
pub mod zone;

use crate::account::{AccountCache, OwnerCache, OwnerChangeset};
use crate::config::Config;
use crate::constants::{ENTRY_CONTENTION_DELAY_MAX, ENTRY_CONTENTION_DELAY_MIN};
use crate::dns_errors::DnsError;
use crate::dnsset::DnsSetName;
use crate::selector::lookup_for;
use crate::state::entry::{validate_spec, EntryHandle, EntrySpec, EntryState};
use crate::state::lock::EntryZoneLock;
use crate::state::provider_state::ProviderState;
use crate::state::zone::{ZoneId, ZoneInfo};
use chrono::{DateTime, Utc};
use rand::RngExt;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Reconciliation work emitted by the state layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// Reconcile a hosted zone
    Zone(ZoneId),
    /// Reconcile a hosted zone after a delay
    ZoneDelayed(ZoneId, Duration),
    /// Re-reconcile an entry by object name
    Entry(String),
    /// Re-reconcile an entry after a delay
    EntryDelayed(String, Duration),
}

/// Sink for triggers; the dispatcher owns the receiving end.
pub type TriggerSink = mpsc::UnboundedSender<Trigger>;

/// Duplicate-queue key: earliest creation wins, ties broken by object name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct DupKey {
    created_at: DateTime<Utc>,
    object_name: String,
}

struct StateInner {
    entries: HashMap<String, Arc<EntryHandle>>,
    /// Active claimant per DNS set name
    dns_names: HashMap<DnsSetName, String>,
    /// Waiting duplicates per DNS set name, earliest first
    duplicates: HashMap<DnsSetName, BinaryHeap<Reverse<DupKey>>>,
    providers: BTreeMap<String, Arc<ProviderState>>,
    zones: BTreeMap<ZoneId, Arc<ZoneInfo>>,
    /// Entries whose reconciliation is known to be in flight, per zone
    blocking: HashMap<ZoneId, BTreeSet<String>>,
}

/// Everything the zone scheduler needs for one zone reconciliation.
pub struct ZoneReconcileData {
    /// The zone being reconciled
    pub zone: Arc<ZoneInfo>,
    /// Valid providers covering the zone
    pub providers: Vec<Arc<ProviderState>>,
    /// Provider used for the observed-state read
    pub default_provider: Arc<ProviderState>,
    /// Entries to apply
    pub entries: Vec<Arc<EntryHandle>>,
    /// Entries whose records must be removed (deletion or obsolescence)
    pub deleting: Vec<Arc<EntryHandle>>,
    /// Entries whose spec went invalid but whose records are kept
    pub stale: Vec<Arc<EntryHandle>>,
}

/// The state layer.
pub struct State {
    cfg: Arc<Config>,
    inner: RwLock<StateInner>,
    /// Entry/zone reconciliation lock registry
    pub lock: EntryZoneLock,
    /// Shared upstream accounts
    pub accounts: AccountCache,
    /// Owner identity refcounts
    pub owners: OwnerCache,
    triggers: TriggerSink,
}

impl State {
    /// Build a state layer emitting triggers into `triggers`.
    #[must_use]
    pub fn new(cfg: Arc<Config>, triggers: TriggerSink) -> Self {
        Self {
            cfg,
            inner: RwLock::new(StateInner {
                entries: HashMap::new(),
                dns_names: HashMap::new(),
                duplicates: HashMap::new(),
                providers: BTreeMap::new(),
                zones: BTreeMap::new(),
                blocking: HashMap::new(),
            }),
            lock: EntryZoneLock::new(),
            accounts: AccountCache::new(),
            owners: OwnerCache::new(),
            triggers,
        }
    }

    /// The configuration this state layer runs with.
    #[must_use]
    pub fn config(&self) -> &Arc<Config> {
        &self.cfg
    }

    fn send(&self, trigger: Trigger) {
        // a dropped receiver means the dispatcher is shutting down
        let _ = self.triggers.send(trigger);
    }

    // ========================================================================
    // Entry operations
    // ========================================================================

    /// Apply an observed entry change.
    ///
    /// Runs validation, provider/zone resolution and duplicate detection,
    /// then enqueues the owning zone when the entry is modified.
    ///
    /// # Errors
    ///
    /// [`DnsError::LockContention`] when the entry's spin lock could not be
    /// taken within its budget; a randomized retry has already been
    /// scheduled.
    pub fn update_entry(&self, spec: EntrySpec) -> Result<(), DnsError> {
        #[cfg(debug_assertions)]
        let _order = lock::order::enter(lock::order::Level::State);

        let mut inner = self.inner.write().expect("state lock poisoned");
        let object_name = spec.object_name.clone();

        let (handle, existed) = match inner.entries.get(&object_name) {
            Some(handle) => (handle.clone(), true),
            None => {
                let handle = Arc::new(EntryHandle::new(spec.clone()));
                inner.entries.insert(object_name.clone(), handle.clone());
                (handle, false)
            }
        };

        if existed && !handle.lock.try_lock_spinning(None) {
            let delay = random_contention_delay();
            warn!(entry = %object_name, ?delay, "Entry spin lock contended, rescheduling");
            self.send(Trigger::EntryDelayed(object_name.clone(), delay));
            return Err(DnsError::LockContention { what: object_name });
        }
        let result = self.update_entry_locked(&mut inner, &handle, spec, existed);
        if existed {
            handle.lock.unlock();
        }
        result
    }

    #[allow(clippy::too_many_lines)]
    fn update_entry_locked(
        &self,
        inner: &mut StateInner,
        handle: &Arc<EntryHandle>,
        spec: EntrySpec,
        existed: bool,
    ) -> Result<(), DnsError> {
        let object_name = spec.object_name.clone();

        // ignore-annotation short-circuit
        if spec.ignored && !spec.deleting {
            self.release_name_claim(inner, handle);
            handle.with_data(|d| {
                d.spec = spec;
                d.valid = false;
                d.duplicate = false;
                d.state = EntryState::Ignored;
                d.message = None;
            });
            debug!(entry = %object_name, "Entry carries ignore annotation");
            return Ok(());
        }

        let validation = validate_spec(&spec);
        let (name, targets, valid, validation_err) = match validation {
            Ok((name, targets)) => (name, targets, true, None),
            Err(err) => (
                DnsSetName::with_identifier(&spec.dns_name, &spec.set_identifier),
                Vec::new(),
                false,
                Some(err),
            ),
        };

        // provider + zone resolution
        let provider = lookup_for(inner.providers.values(), &name.dns_name, &spec.update_group);
        let zone = provider
            .as_ref()
            .and_then(|p| best_zone_for(&inner.zones, p, &name.dns_name));

        let old_name = handle.with_data(|d| d.name.clone());
        let old_zone = handle.with_data(|d| d.zone_id.clone());
        let old_active = handle.with_data(|d| d.active_zone.clone());

        // the DNS name moved: release the old claim and clean up the old zone
        if existed && old_name != name {
            self.release_name_claim(inner, handle);
            if let Some(zone_id) = &old_zone {
                if inner.zones.contains_key(zone_id) {
                    self.send(Trigger::Zone(zone_id.clone()));
                }
            }
        }

        // the active zone moved while records may still exist in the old one:
        // trigger the old zone whenever it still exists
        let new_zone_id = zone.as_ref().map(|z| z.id.clone());
        if let Some(active) = &old_active {
            if new_zone_id.as_ref() != Some(active) && inner.zones.contains_key(active) {
                self.send(Trigger::Zone(active.clone()));
            }
        }

        // duplicate detection, earliest creation wins
        let mut duplicate = false;
        if valid {
            match inner.dns_names.get(&name).cloned() {
                Some(claimant) if claimant != object_name => {
                    let claimant_key = inner
                        .entries
                        .get(&claimant)
                        .map(|e| e.with_data(|d| (d.spec.created_at, d.spec.object_name.clone())));
                    let ours = (spec.created_at, object_name.clone());
                    match claimant_key {
                        Some(theirs) if theirs <= ours => {
                            duplicate = true;
                            inner
                                .duplicates
                                .entry(name.clone())
                                .or_default()
                                .push(Reverse(DupKey {
                                    created_at: spec.created_at,
                                    object_name: object_name.clone(),
                                }));
                            info!(
                                entry = %object_name,
                                claimant = %theirs.1,
                                dns_name = %name,
                                "Duplicate DNS name, earlier entry wins"
                            );
                        }
                        _ => {
                            // the newcomer is older: displace the claimant
                            if let Some(old) = inner.entries.get(&claimant).cloned() {
                                old.with_data(|d| d.duplicate = true);
                                inner
                                    .duplicates
                                    .entry(name.clone())
                                    .or_default()
                                    .push(Reverse(DupKey {
                                        created_at: old.with_data(|d| d.spec.created_at),
                                        object_name: claimant.clone(),
                                    }));
                                self.send(Trigger::Entry(claimant));
                            }
                            inner.dns_names.insert(name.clone(), object_name.clone());
                        }
                    }
                }
                Some(_) => {}
                None => {
                    inner.dns_names.insert(name.clone(), object_name.clone());
                }
            }
        } else {
            self.release_name_claim(inner, handle);
        }

        // write back
        let modified = handle.with_data(|d| {
            let was = (
                d.name.clone(),
                d.targets.clone(),
                d.spec.ttl,
                d.zone_id.clone(),
                d.spec.deleting,
                d.valid,
            );
            d.spec = spec;
            d.name = name.clone();
            d.targets = targets;
            d.valid = valid;
            d.duplicate = duplicate;
            d.provider_name = provider.as_ref().map(|p| p.name.clone());
            d.account_hash = provider.as_ref().map(|p| p.account_hash().to_string());
            d.zone_id = new_zone_id.clone();
            let now = (
                d.name.clone(),
                d.targets.clone(),
                d.spec.ttl,
                d.zone_id.clone(),
                d.spec.deleting,
                d.valid,
            );
            d.modified = !existed || was != now;

            if duplicate {
                d.state = EntryState::Error;
                d.message = Some(
                    DnsError::AlreadyBusyForEntry {
                        object_name: inner
                            .dns_names
                            .get(&name)
                            .cloned()
                            .unwrap_or_default(),
                    }
                    .to_string(),
                );
            } else if !valid {
                d.state = EntryState::Invalid;
                d.message = validation_err.as_ref().map(ToString::to_string);
            } else if d.provider_name.is_none() {
                d.state = EntryState::Error;
                d.message = Some(format!("no matching provider for '{}'", d.name.dns_name));
            } else if d.zone_id.is_none() {
                d.state = EntryState::Error;
                d.message = Some(format!("no hosted zone for '{}'", d.name.dns_name));
            } else if d.modified {
                d.state = EntryState::Pending;
                d.message = None;
            }
            d.modified
        });

        if valid && !duplicate && provider.is_none() {
            // entry lost (or never had) its provider: recheck later
            self.send(Trigger::EntryDelayed(
                object_name.clone(),
                self.cfg.reschedule_delay(),
            ));
        }

        if modified {
            if let Some(zone_id) = new_zone_id {
                self.send(Trigger::Zone(zone_id));
            }
        }
        Ok(())
    }

    /// Remove a deleted entry from the index.
    ///
    /// Triggers the owning zone for upstream cleanup and reactivates the
    /// earliest waiting duplicate of the DNS name, if any.
    pub fn entry_deleted(&self, object_name: &str) {
        #[cfg(debug_assertions)]
        let _order = lock::order::enter(lock::order::Level::State);

        let mut inner = self.inner.write().expect("state lock poisoned");
        let Some(handle) = inner.entries.remove(object_name) else {
            return;
        };
        self.release_name_claim(&mut inner, &handle);

        if let Some(zone_id) = handle.with_data(|d| d.active_zone.clone().or(d.zone_id.clone())) {
            if inner.zones.contains_key(&zone_id) {
                self.send(Trigger::Zone(zone_id));
            }
        }
        for names in inner.blocking.values_mut() {
            names.remove(object_name);
        }
        info!(entry = %object_name, "Entry removed from index");
    }

    /// Release the entry's DNS-name claim and promote the earliest waiting
    /// duplicate.
    fn release_name_claim(&self, inner: &mut StateInner, handle: &Arc<EntryHandle>) {
        let name = handle.with_data(|d| d.name.clone());
        if inner.dns_names.get(&name).map(String::as_str) != Some(handle.object_name.as_str()) {
            return;
        }
        inner.dns_names.remove(&name);

        // promote the earliest live duplicate
        while let Some(queue) = inner.duplicates.get_mut(&name) {
            let Some(Reverse(key)) = queue.pop() else {
                inner.duplicates.remove(&name);
                break;
            };
            let Some(next) = inner.entries.get(&key.object_name).cloned() else {
                continue; // deleted while waiting
            };
            let still_claims = next.with_data(|d| d.duplicate && d.name == name);
            if !still_claims {
                continue;
            }
            next.with_data(|d| {
                d.duplicate = false;
                d.state = EntryState::Pending;
                d.message = None;
                d.modified = true;
            });
            inner.dns_names.insert(name.clone(), key.object_name.clone());
            info!(entry = %key.object_name, dns_name = %name, "Reactivating duplicate entry");
            self.send(Trigger::Entry(key.object_name));
            break;
        }
    }

    /// Re-enqueue every entry whose owner id appears in the changeset.
    pub fn trigger_entries_by_owner(&self, changeset: &OwnerChangeset) {
        let touched = changeset.touched();
        if touched.is_empty() {
            return;
        }
        let inner = self.inner.read().expect("state lock poisoned");
        for (object_name, handle) in &inner.entries {
            let owner = handle.with_data(|d| {
                d.spec
                    .owner_id
                    .clone()
                    .unwrap_or_else(|| self.cfg.ident.clone())
                    .to_ascii_lowercase()
            });
            if touched.contains(&owner) {
                self.send(Trigger::Entry(object_name.clone()));
            }
        }
    }

    /// Fetch a provider snapshot by name.
    #[must_use]
    pub fn provider(&self, name: &str) -> Option<Arc<ProviderState>> {
        self.inner
            .read()
            .expect("state lock poisoned")
            .providers
            .get(name)
            .cloned()
    }

    /// Fetch an entry handle by object name.
    #[must_use]
    pub fn entry(&self, object_name: &str) -> Option<Arc<EntryHandle>> {
        self.inner
            .read()
            .expect("state lock poisoned")
            .entries
            .get(object_name)
            .cloned()
    }

    // ========================================================================
    // Provider and zone registries
    // ========================================================================

    /// Register or replace a provider snapshot.
    ///
    /// Entries that resolve to this provider (or currently have none) are
    /// re-enqueued so selection reruns.
    pub fn update_provider(&self, provider: Arc<ProviderState>) {
        let mut retrigger = Vec::new();
        {
            let mut inner = self.inner.write().expect("state lock poisoned");
            inner.providers.insert(provider.name.clone(), provider.clone());
            for (object_name, handle) in &inner.entries {
                let affected = handle.with_data(|d| {
                    d.provider_name.is_none()
                        || d.provider_name.as_deref() == Some(provider.name.as_str())
                        || provider.match_name(&d.name.dns_name) > 0
                });
                if affected {
                    retrigger.push(object_name.clone());
                }
            }
        }
        info!(provider = %provider.name, entries = retrigger.len(), "Provider registered");
        for object_name in retrigger {
            self.send(Trigger::Entry(object_name));
        }
    }

    /// Remove a provider; its entries are re-enqueued and will report "no
    /// matching provider" unless another provider covers them.
    pub fn provider_deleted(&self, name: &str) {
        let mut retrigger = Vec::new();
        let removed = {
            let mut inner = self.inner.write().expect("state lock poisoned");
            let removed = inner.providers.remove(name).is_some();
            for (object_name, handle) in &inner.entries {
                if handle.with_data(|d| d.provider_name.as_deref() == Some(name)) {
                    retrigger.push(object_name.clone());
                }
            }
            removed
        };
        if removed {
            info!(provider = %name, entries = retrigger.len(), "Provider removed");
        }
        for object_name in retrigger {
            self.send(Trigger::Entry(object_name));
        }
    }

    /// Replace the set of discovered hosted zones, dropping blocked ones.
    pub fn set_zones(&self, zones: Vec<ZoneInfo>) {
        let mut inner = self.inner.write().expect("state lock poisoned");
        inner.zones.clear();
        for zone in zones {
            if self.cfg.is_zone_blocked(&zone.id.to_string()) {
                debug!(zone = %zone.id, "Ignoring blocked zone");
                continue;
            }
            inner.zones.insert(zone.id.clone(), Arc::new(zone));
        }
    }

    /// A registered zone by id.
    #[must_use]
    pub fn zone(&self, zone_id: &ZoneId) -> Option<Arc<ZoneInfo>> {
        self.inner
            .read()
            .expect("state lock poisoned")
            .zones
            .get(zone_id)
            .cloned()
    }

    /// All registered zone ids.
    #[must_use]
    pub fn zone_ids(&self) -> Vec<ZoneId> {
        self.inner
            .read()
            .expect("state lock poisoned")
            .zones
            .keys()
            .cloned()
            .collect()
    }

    // ========================================================================
    // Blocking entries
    // ========================================================================

    /// Mark an entry's reconciliation as in flight for a zone.
    pub fn add_blocking_entry(&self, zone_id: &ZoneId, object_name: &str) {
        let mut inner = self.inner.write().expect("state lock poisoned");
        inner
            .blocking
            .entry(zone_id.clone())
            .or_default()
            .insert(object_name.to_string());
    }

    /// Clear an in-flight marker.
    pub fn remove_blocking_entry(&self, zone_id: &ZoneId, object_name: &str) {
        let mut inner = self.inner.write().expect("state lock poisoned");
        if let Some(names) = inner.blocking.get_mut(zone_id) {
            names.remove(object_name);
            if names.is_empty() {
                inner.blocking.remove(zone_id);
            }
        }
    }

    /// True while any entry reconciliation is in flight for the zone.
    #[must_use]
    pub fn has_blocking_entries(&self, zone_id: &ZoneId) -> bool {
        self.inner
            .read()
            .expect("state lock poisoned")
            .blocking
            .get(zone_id)
            .is_some_and(|names| !names.is_empty())
    }

    // ========================================================================
    // Zone reconciliation view
    // ========================================================================

    /// Assemble the data one zone reconciliation needs.
    ///
    /// Returns `None` when the zone is unknown or no valid provider covers
    /// it.
    #[must_use]
    pub fn zone_reconcile_data(&self, zone_id: &ZoneId) -> Option<ZoneReconcileData> {
        let inner = self.inner.read().expect("state lock poisoned");
        let zone = inner.zones.get(zone_id)?.clone();

        let providers: Vec<Arc<ProviderState>> = inner
            .providers
            .values()
            .filter(|p| p.valid && p.covers_zone(&zone))
            .cloned()
            .collect();
        let default_provider = providers
            .iter()
            .max_by_key(|p| p.match_name(&zone.domain))
            .cloned()?;

        let mut entries = Vec::new();
        let mut deleting = Vec::new();
        let mut stale = Vec::new();
        for handle in inner.entries.values() {
            let (in_zone, was_active) = handle.with_data(|d| {
                (
                    d.zone_id.as_ref() == Some(zone_id),
                    d.active_zone.as_ref() == Some(zone_id),
                )
            });
            if !in_zone && !was_active {
                continue;
            }
            let (valid, duplicate, is_deleting, obsolete) = handle.with_data(|d| {
                (d.valid, d.duplicate, d.spec.deleting, d.obsolete)
            });
            if is_deleting || obsolete || (!in_zone && was_active) {
                deleting.push(handle.clone());
            } else if duplicate {
                // duplicates neither apply nor delete; the active claimant owns the name
            } else if valid {
                entries.push(handle.clone());
            } else {
                stale.push(handle.clone());
            }
        }

        Some(ZoneReconcileData {
            zone,
            providers,
            default_provider,
            entries,
            deleting,
            stale,
        })
    }
}

/// The best zone for a provider and DNS name: longest authority match,
/// public zones preferred, then lexicographic id for determinism.
fn best_zone_for(
    zones: &BTreeMap<ZoneId, Arc<ZoneInfo>>,
    provider: &Arc<ProviderState>,
    dns_name: &str,
) -> Option<Arc<ZoneInfo>> {
    zones
        .values()
        .filter(|z| provider.covers_zone(z))
        .filter_map(|z| {
            let len = z.match_name(dns_name);
            (len > 0).then_some((z, len))
        })
        .max_by(|(a, alen), (b, blen)| {
            alen.cmp(blen)
                .then_with(|| b.is_private.cmp(&a.is_private))
                .then_with(|| b.id.cmp(&a.id))
        })
        .map(|(z, _)| z.clone())
}

fn random_contention_delay() -> Duration {
    let mut rng = rand::rng();
    let span = ENTRY_CONTENTION_DELAY_MAX - ENTRY_CONTENTION_DELAY_MIN;
    ENTRY_CONTENTION_DELAY_MIN + span.mul_f64(rng.random_range(0.0..=1.0))
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod state_tests;
