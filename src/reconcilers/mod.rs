// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Reconciliation controllers for the external-DNS core.
//!
//! This module wires the pieces together the way the surrounding controller
//! manager consumes them:
//!
//! 1. **Events** - keyed entry/provider events arrive from the declarative
//!    watch layer (out of scope here) through [`Dispatcher`] channels
//! 2. **State** - the state layer indexes entries, resolves providers and
//!    zones, and emits triggers
//! 3. **Zones** - the zone scheduler serializes per-zone reconciliations
//!    driving the change model
//! 4. **Lookups** - the lookup processor re-resolves CNAME targets and
//!    re-enqueues entries on IP-set changes
//!
//! Worker pools: two workers consume entry events, two consume provider
//! events, a single worker serializes zone commands and one task runs the
//! lookup loop.

pub mod change_model;
pub mod zone_scheduler;

pub use change_model::{ApplyOutcome, ChangeGroupKey, ChangeModel};
pub use zone_scheduler::ZoneScheduler;

use crate::account::AccountConfig;
use crate::config::Config;
use crate::constants::{DEFAULT_LOOKUP_INTERVAL, ENTRY_WORKERS, PROVIDER_WORKERS};
use crate::dns_errors::DnsError;
use crate::dnsset::RecordType;
use crate::finalizers::{should_retain_finalizer, FinalizerManager};
use crate::lookup::{EntryTrigger, LookupHost, LookupProcessor};
use crate::provider::{DnsHandler, RateLimit};
use crate::rate_limiter::ProviderRateLimiter;
use crate::state::entry::EntrySpec;
use crate::state::provider_state::ProviderState;
use crate::state::zone::ZoneInfo;
use crate::state::{State, Trigger};
use crate::zone_cache::ZoneStateCache;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

/// Keyed entry events delivered by the watch layer.
#[derive(Clone, Debug)]
pub enum EntryEvent {
    /// The entry was created or its spec changed
    Upsert(EntrySpec),
    /// The declarative object is gone
    Delete(String),
}

/// Declarative provider input.
#[derive(Clone)]
pub struct ProviderConfig {
    /// Cluster-unique provider name
    pub name: String,
    /// Provenance key (typically the provider object's namespace)
    pub update_group: String,
    /// Credential material identifying the upstream account
    pub account: AccountConfig,
    /// Domains the provider answers for
    pub included_domains: Vec<String>,
    /// Domains carved out
    pub excluded_domains: Vec<String>,
    /// Explicit zone allow list
    pub included_zones: Vec<String>,
    /// Explicit zone deny list
    pub excluded_zones: Vec<String>,
    /// Default record TTL for entries served by this provider
    pub default_ttl: Option<u64>,
    /// Provider-declared rate limit
    pub rate_limit: Option<RateLimit>,
}

/// Keyed provider events delivered by the watch layer.
#[derive(Clone)]
pub enum ProviderEvent {
    /// The provider was created or its spec changed
    Upsert(ProviderConfig),
    /// The provider object is gone
    Delete(String),
}

/// Creates upstream handlers for accounts; adapters register through this.
pub trait HandlerFactory: Send + Sync {
    /// Build a handler for the account described by `config`.
    ///
    /// # Errors
    ///
    /// Configuration errors become provider status errors.
    fn create(&self, config: &AccountConfig) -> Result<Arc<dyn DnsHandler>, DnsError>;
}

/// Adapter feeding lookup-processor triggers back into the dispatcher.
struct LookupTriggerSink {
    triggers: mpsc::UnboundedSender<Trigger>,
}

impl EntryTrigger for LookupTriggerSink {
    fn trigger_entry(&self, object_name: &str) {
        let _ = self.triggers.send(Trigger::Entry(object_name.to_string()));
    }
}

/// The reconciler dispatcher: owns the channels, the worker pools and the
/// per-entry critical section.
pub struct Dispatcher {
    cfg: Arc<Config>,
    /// The state layer
    pub state: Arc<State>,
    /// The zone scheduler
    pub scheduler: Arc<ZoneScheduler>,
    /// The lookup processor
    pub lookup: Arc<LookupProcessor>,
    cache: Arc<ZoneStateCache>,
    handler_factory: Arc<dyn HandlerFactory>,
    entry_tx: mpsc::UnboundedSender<EntryEvent>,
    provider_tx: mpsc::UnboundedSender<ProviderEvent>,
    triggers: mpsc::UnboundedSender<Trigger>,
    /// Zones discovered per provider name, merged into the state registry
    discovered: StdMutex<BTreeMap<String, Vec<ZoneInfo>>>,
    finalizers: StdMutex<Option<Arc<dyn FinalizerManager>>>,
    shutdown_tx: watch::Sender<bool>,
    receivers: StdMutex<Option<Receivers>>,
}

struct Receivers {
    entries: mpsc::UnboundedReceiver<EntryEvent>,
    providers: mpsc::UnboundedReceiver<ProviderEvent>,
    triggers: mpsc::UnboundedReceiver<Trigger>,
    zone_commands: mpsc::UnboundedReceiver<crate::state::zone::ZoneId>,
}

impl Dispatcher {
    /// Wire up the core against a handler factory and a resolver.
    ///
    /// # Errors
    ///
    /// Propagates cache-directory failures when persistence is configured.
    pub fn new(
        cfg: Arc<Config>,
        handler_factory: Arc<dyn HandlerFactory>,
        resolver: Arc<dyn LookupHost>,
    ) -> anyhow::Result<Arc<Self>> {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let (entry_tx, entry_rx) = mpsc::unbounded_channel();
        let (provider_tx, provider_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let state = Arc::new(State::new(cfg.clone(), trigger_tx.clone()));
        let cache = Arc::new(ZoneStateCache::with_persistence(cfg.clone())?);
        let (scheduler, zone_rx) =
            ZoneScheduler::new(cfg.clone(), state.clone(), cache.clone(), trigger_tx.clone());
        let lookup = LookupProcessor::new(
            resolver,
            Arc::new(LookupTriggerSink {
                triggers: trigger_tx.clone(),
            }),
            cfg.concurrent_lookups,
            Some(cfg.lookup_check_period()),
        );
        scheduler.set_address_source(lookup.clone());

        Ok(Arc::new(Self {
            cfg,
            state,
            scheduler,
            lookup,
            cache,
            handler_factory,
            entry_tx,
            provider_tx,
            triggers: trigger_tx,
            discovered: StdMutex::new(BTreeMap::new()),
            finalizers: StdMutex::new(None),
            shutdown_tx,
            receivers: StdMutex::new(Some(Receivers {
                entries: entry_rx,
                providers: provider_rx,
                triggers: trigger_rx,
                zone_commands: zone_rx,
            })),
        }))
    }

    /// Spawn the worker pools. Call once.
    ///
    /// # Panics
    ///
    /// Panics when called twice; the receivers can only be taken once.
    pub fn start(self: &Arc<Self>) {
        let receivers = self
            .receivers
            .lock()
            .expect("receivers poisoned")
            .take()
            .expect("dispatcher already started");

        let entry_rx = Arc::new(Mutex::new(receivers.entries));
        for worker in 0..ENTRY_WORKERS {
            let dispatcher = self.clone();
            let rx = entry_rx.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    let event = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            event = rx.recv() => event,
                            _ = shutdown.changed() => None,
                        }
                    };
                    let Some(event) = event else { break };
                    dispatcher.process_entry_event(event).await;
                }
                debug!(worker, "Entry worker stopped");
            });
        }

        let provider_rx = Arc::new(Mutex::new(receivers.providers));
        for worker in 0..PROVIDER_WORKERS {
            let dispatcher = self.clone();
            let rx = provider_rx.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    let event = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            event = rx.recv() => event,
                            _ = shutdown.changed() => None,
                        }
                    };
                    let Some(event) = event else { break };
                    dispatcher.process_provider_event(event).await;
                }
                debug!(worker, "Provider worker stopped");
            });
        }

        // trigger router
        {
            let dispatcher = self.clone();
            let mut rx = receivers.triggers;
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    let trigger = tokio::select! {
                        trigger = rx.recv() => trigger,
                        _ = shutdown.changed() => None,
                    };
                    let Some(trigger) = trigger else { break };
                    dispatcher.route_trigger(trigger);
                }
                debug!("Trigger router stopped");
            });
        }

        tokio::spawn(
            self.scheduler
                .clone()
                .run(receivers.zone_commands, self.shutdown_tx.subscribe()),
        );
        tokio::spawn(self.lookup.clone().run(self.shutdown_tx.subscribe()));
        info!("Reconciler dispatcher started");
    }

    /// Plug in the declarative layer's finalizer handling.
    pub fn set_finalizer_manager(&self, manager: Arc<dyn FinalizerManager>) {
        *self.finalizers.lock().expect("finalizers poisoned") = Some(manager);
    }

    /// Submit an entry event.
    pub fn handle_entry_event(&self, event: EntryEvent) {
        let _ = self.entry_tx.send(event);
    }

    /// Submit a provider event.
    pub fn handle_provider_event(&self, event: ProviderEvent) {
        let _ = self.provider_tx.send(event);
    }

    /// Run the initial sweep over all entries known at start-up, with the
    /// configured parallelism.
    pub async fn run_initial_sweep(self: &Arc<Self>, specs: Vec<EntrySpec>) {
        use futures::StreamExt;
        let parallelism = self.cfg.setup.max(1);
        futures::stream::iter(specs)
            .for_each_concurrent(parallelism, |spec| {
                let dispatcher = self.clone();
                async move {
                    dispatcher.process_entry_event(EntryEvent::Upsert(spec)).await;
                }
            })
            .await;
        info!("Initial sweep complete");
    }

    /// Record owner-object activations and re-trigger affected entries.
    pub fn owners_activated<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let changeset = self.state.owners.activate(ids);
        self.state.trigger_entries_by_owner(&changeset);
    }

    /// Record owner-object deactivations and re-trigger affected entries.
    pub fn owners_deactivated<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let changeset = self.state.owners.deactivate(ids);
        self.state.trigger_entries_by_owner(&changeset);
    }

    /// Stop the worker pools and drain the cache flusher.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.cache.shutdown().await;
        info!("Reconciler dispatcher stopped");
    }

    fn route_trigger(self: &Arc<Self>, trigger: Trigger) {
        match trigger {
            Trigger::Zone(zone_id) => self.scheduler.trigger_hosted_zone(&zone_id),
            Trigger::ZoneDelayed(zone_id, delay) => {
                self.scheduler.trigger_hosted_zone_after(zone_id, delay);
            }
            Trigger::Entry(object_name) => {
                // re-reconcile from the last observed spec
                if let Some(handle) = self.state.entry(&object_name) {
                    let spec = handle.with_data(|d| d.spec.clone());
                    self.handle_entry_event(EntryEvent::Upsert(spec));
                    // a re-trigger usually means the desired records changed
                    // without a spec change (lookup results, ownership): the
                    // zone has to diff again either way
                    if let Some(zone_id) = handle.zone_id() {
                        self.scheduler.trigger_hosted_zone(&zone_id);
                    }
                }
            }
            Trigger::EntryDelayed(object_name, delay) => {
                let dispatcher = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    dispatcher.route_trigger(Trigger::Entry(object_name));
                });
            }
        }
    }

    /// Entry-event critical section: lock, update state, maintain lookup
    /// jobs, unlock.
    async fn process_entry_event(self: &Arc<Self>, event: EntryEvent) {
        match event {
            EntryEvent::Upsert(spec) => {
                let object_name = spec.object_name.clone();
                let dns_name = spec.dns_name.clone();
                if !self
                    .state
                    .lock
                    .try_lock_entry_reconciliation(&object_name, &dns_name)
                {
                    // the entry is held by a zone reconciliation; the unlock
                    // path re-triggers it
                    debug!(entry = %object_name, "Entry locked, deferring");
                    return;
                }

                // while the entry is being reconciled its zone must wait
                let blocking_zone = self
                    .state
                    .entry(&object_name)
                    .and_then(|handle| handle.zone_id());
                if let Some(zone_id) = &blocking_zone {
                    self.state.add_blocking_entry(zone_id, &object_name);
                }

                match self.state.update_entry(spec) {
                    Ok(()) => self.sync_lookup_job(&object_name),
                    Err(DnsError::LockContention { .. }) => {
                        // randomized retry already scheduled by the state layer
                    }
                    Err(err) => {
                        warn!(entry = %object_name, error = %err, "Entry update failed");
                    }
                }
                self.sync_finalizer(&object_name).await;

                if let Some(zone_id) = &blocking_zone {
                    self.state.remove_blocking_entry(zone_id, &object_name);
                }
                self.state.lock.unlock_entry_reconciliation(&object_name);
            }
            EntryEvent::Delete(object_name) => {
                self.lookup.delete(&object_name);
                self.state.entry_deleted(&object_name);
            }
        }
    }

    /// Keep the entry object's finalizer in line with its upstream records.
    async fn sync_finalizer(&self, object_name: &str) {
        let manager = self.finalizers.lock().expect("finalizers poisoned").clone();
        let Some(manager) = manager else {
            return;
        };
        let Some(handle) = self.state.entry(object_name) else {
            return;
        };
        let retain = handle.with_data(|d| should_retain_finalizer(d));
        let result = if retain {
            manager.retain(object_name).await
        } else {
            manager.release(object_name).await
        };
        if let Err(err) = result {
            warn!(entry = %object_name, retain, error = %err, "Finalizer update failed");
        }
    }

    /// Keep the lookup job of an entry in sync with its CNAME targets.
    fn sync_lookup_job(&self, object_name: &str) {
        let Some(handle) = self.state.entry(object_name) else {
            return;
        };
        let hostnames: Vec<String> = handle.with_data(|d| {
            if !d.valid || d.duplicate {
                return Vec::new();
            }
            d.targets
                .iter()
                .filter(|t| t.rtype == RecordType::CNAME)
                .map(|t| t.value.clone())
                .collect()
        });
        // single-CNAME entries pass the hostname through unresolved
        if hostnames.len() > 1 {
            self.lookup.upsert(
                object_name,
                hostnames,
                BTreeSet::new(),
                DEFAULT_LOOKUP_INTERVAL,
            );
        } else {
            self.lookup.delete(object_name);
        }
    }

    async fn process_provider_event(self: &Arc<Self>, event: ProviderEvent) {
        match event {
            ProviderEvent::Upsert(config) => {
                if let Err(err) = self.upsert_provider(config).await {
                    warn!(error = %err, "Provider update failed");
                }
            }
            ProviderEvent::Delete(name) => self.delete_provider(&name).await,
        }
    }

    async fn upsert_provider(self: &Arc<Self>, config: ProviderConfig) -> Result<(), DnsError> {
        let account = self.state.accounts.get(&config.name, &config.account, |c| {
            self.handler_factory.create(c)
        })?;

        let mut provider = ProviderState::new(
            &config.name,
            &config.update_group,
            account.clone(),
            config.included_domains.clone(),
        );
        provider.excluded_domains = config.excluded_domains.clone();
        provider.included_zones = config.included_zones.clone();
        provider.excluded_zones = config.excluded_zones.clone();
        provider.default_ttl = config.default_ttl;
        provider.rate_limiter = match (&config.rate_limit, self.cfg.rate_limiter.enabled) {
            (Some(limit), _) => Some(Arc::new(ProviderRateLimiter::new(*limit))),
            (None, true) => Some(Arc::new(ProviderRateLimiter::per_second(
                self.cfg.rate_limiter.qps,
                self.cfg.rate_limiter.burst,
            ))),
            (None, false) => None,
        };

        // discover this account's zones before the provider goes live
        let zones = match account.handler().get_zones().await {
            Ok(zones) => zones,
            Err(err) => {
                warn!(provider = %config.name, error = %err, "Zone discovery failed");
                provider.valid = false;
                Vec::new()
            }
        };
        {
            let mut discovered = self.discovered.lock().expect("discovered poisoned");
            discovered.insert(config.name.clone(), zones);
            let merged = merge_zones(&discovered);
            self.state.set_zones(merged);
        }
        self.state.update_provider(Arc::new(provider));
        Ok(())
    }

    async fn delete_provider(self: &Arc<Self>, name: &str) {
        let account_hash = self
            .state
            .provider(name)
            .map(|p| p.account_hash().to_string());
        {
            let mut discovered = self.discovered.lock().expect("discovered poisoned");
            discovered.remove(name);
            let merged = merge_zones(&discovered);
            self.state.set_zones(merged);
        }
        self.state.provider_deleted(name);
        if let Some(hash) = account_hash {
            self.state.accounts.release(name, &hash).await;
        }
    }
}

/// Union of per-provider zone discoveries, first discovery wins per id.
///
/// Policies carried by later discoveries of the same zone are folded in;
/// a competing second policy is dropped with a warning so every zone keeps
/// at most one active policy.
fn merge_zones(discovered: &BTreeMap<String, Vec<ZoneInfo>>) -> Vec<ZoneInfo> {
    let mut merged: BTreeMap<crate::state::zone::ZoneId, ZoneInfo> = BTreeMap::new();
    for zones in discovered.values() {
        for zone in zones {
            match merged.get_mut(&zone.id) {
                None => {
                    merged.insert(zone.id.clone(), zone.clone());
                }
                Some(existing) => {
                    if let Some(policy) = &zone.policy {
                        if let Err(err) = existing.apply_policy(policy.clone()) {
                            warn!(zone = %zone.id, error = %err, "Conflicting zone policy dropped");
                        }
                    }
                }
            }
        }
    }
    merged.into_values().collect()
}
