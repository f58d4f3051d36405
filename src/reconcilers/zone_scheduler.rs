// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Per-zone reconciliation scheduling.
//!
//! Zone reconciliations are serialized through a single worker; per zone, a
//! busy flag guarantees exclusivity, a minimum inter-reconciliation delay
//! keeps upstream call volume bounded, and an adaptive rate limiter backs
//! retries off after failures (up to 10 minutes) and decays them after
//! successes.
//!
//! One reconciliation: defer while blocking entries are in flight, take the
//! busy flag, lock every entry to be touched (releasing everything on
//! partial failure), drive the change model, then unlock and re-trigger
//! whatever accumulated.

use crate::config::Config;
use crate::constants::{BLOCKED_ZONE_DELAY, BUSY_ZONE_DELAY, DELAY_EVENT_THRESHOLD};
use crate::dns_errors::DnsError;
use crate::dnsset::{Ownership, RecordType};
use crate::lookup::AddressSource;
use crate::metrics;
use crate::provider::{Done, DoneHandler};
use crate::rate_limiter::ZoneRateLimiter;
use crate::reconcilers::change_model::{ApplyOutcome, ChangeModel};
use crate::state::entry::{EntryHandle, EntryState};
use crate::state::zone::ZoneId;
use crate::state::{State, Trigger, TriggerSink, ZoneReconcileData};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

struct ZoneSchedState {
    busy: AtomicBool,
    next: Mutex<Instant>,
    limiter: ZoneRateLimiter,
}

impl Default for ZoneSchedState {
    fn default() -> Self {
        Self {
            busy: AtomicBool::new(false),
            next: Mutex::new(Instant::now()),
            limiter: ZoneRateLimiter::default(),
        }
    }
}

/// Outcome recorded for one entry during a reconciliation attempt.
#[derive(Clone, Debug, Default)]
enum AttemptOutcome {
    #[default]
    Pending,
    Succeeded,
    Failed(String),
    Throttled,
    Invalid(String),
}

/// Done handler binding change requests back to their entry.
///
/// The first failure wins; success only sticks if nothing failed. The
/// scheduler reads the final outcome once the model has executed.
struct EntryDone {
    outcome: Mutex<AttemptOutcome>,
}

impl EntryDone {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(AttemptOutcome::Pending),
        })
    }

    fn outcome(&self) -> AttemptOutcome {
        self.outcome.lock().expect("outcome poisoned").clone()
    }
}

impl DoneHandler for EntryDone {
    fn succeeded(&self) {
        let mut outcome = self.outcome.lock().expect("outcome poisoned");
        if matches!(*outcome, AttemptOutcome::Pending) {
            *outcome = AttemptOutcome::Succeeded;
        }
    }

    fn failed(&self, err: &DnsError) {
        let mut outcome = self.outcome.lock().expect("outcome poisoned");
        if !matches!(*outcome, AttemptOutcome::Invalid(_)) {
            *outcome = AttemptOutcome::Failed(err.to_string());
        }
    }

    fn throttled(&self) {
        let mut outcome = self.outcome.lock().expect("outcome poisoned");
        if matches!(*outcome, AttemptOutcome::Pending | AttemptOutcome::Succeeded) {
            *outcome = AttemptOutcome::Throttled;
        }
    }

    fn set_invalid(&self, err: &DnsError) {
        *self.outcome.lock().expect("outcome poisoned") = AttemptOutcome::Invalid(err.to_string());
    }
}

/// Serializes and paces reconciliations of hosted zones.
pub struct ZoneScheduler {
    cfg: Arc<Config>,
    state: Arc<State>,
    cache: Arc<crate::zone_cache::ZoneStateCache>,
    zones: Mutex<HashMap<ZoneId, Arc<ZoneSchedState>>>,
    pending: Mutex<HashSet<ZoneId>>,
    commands: mpsc::UnboundedSender<ZoneId>,
    triggers: TriggerSink,
    addresses: Mutex<Option<Arc<dyn AddressSource>>>,
}

impl ZoneScheduler {
    /// Build a scheduler; the returned receiver feeds [`Self::run`].
    #[must_use]
    pub fn new(
        cfg: Arc<Config>,
        state: Arc<State>,
        cache: Arc<crate::zone_cache::ZoneStateCache>,
        triggers: TriggerSink,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ZoneId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                cfg,
                state,
                cache,
                zones: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashSet::new()),
                commands: tx,
                triggers,
                addresses: Mutex::new(None),
            }),
            rx,
        )
    }

    /// Inject the source of resolved addresses for CNAME synthesis.
    pub fn set_address_source(&self, source: Arc<dyn AddressSource>) {
        *self.addresses.lock().expect("addresses poisoned") = Some(source);
    }

    /// Enqueue a zone for reconciliation, collapsing repeated triggers.
    pub fn trigger_hosted_zone(&self, zone_id: &ZoneId) {
        let mut pending = self.pending.lock().expect("pending poisoned");
        if pending.insert(zone_id.clone()) {
            let _ = self.commands.send(zone_id.clone());
        }
    }

    /// Enqueue a zone after a delay.
    pub fn trigger_hosted_zone_after(self: &Arc<Self>, zone_id: ZoneId, delay: Duration) {
        if delay > DELAY_EVENT_THRESHOLD {
            info!(zone = %zone_id, ?delay, "Delaying zone reconciliation");
        }
        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.trigger_hosted_zone(&zone_id);
        });
    }

    /// Single-worker command loop serializing zone reconciliations.
    pub async fn run(
        self: Arc<Self>,
        mut commands: mpsc::UnboundedReceiver<ZoneId>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let zone_id = tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(zone_id) => zone_id,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };
            self.pending.lock().expect("pending poisoned").remove(&zone_id);
            if let Err(err) = self.reconcile_zone(&zone_id).await {
                warn!(zone = %zone_id, error = %err, "Zone reconciliation failed");
            }
        }
        debug!("Zone scheduler stopped");
    }

    fn sched_state(&self, zone_id: &ZoneId) -> Arc<ZoneSchedState> {
        self.zones
            .lock()
            .expect("zones poisoned")
            .entry(zone_id.clone())
            .or_default()
            .clone()
    }

    /// Reconcile one hosted zone.
    ///
    /// # Errors
    ///
    /// Returns the first upstream failure; a retry has been scheduled with
    /// the zone's backed-off delay.
    #[allow(clippy::too_many_lines)]
    pub async fn reconcile_zone(self: &Arc<Self>, zone_id: &ZoneId) -> Result<(), DnsError> {
        let started = Instant::now();

        // entries known to be mid-reconciliation defer the whole zone
        if self.state.has_blocking_entries(zone_id) {
            self.trigger_hosted_zone_after(zone_id.clone(), BLOCKED_ZONE_DELAY);
            metrics::record_zone_reconciliation(
                &zone_id.to_string(),
                "deferred",
                started.elapsed(),
            );
            return Ok(());
        }

        let Some(data) = self.state.zone_reconcile_data(zone_id) else {
            debug!(zone = %zone_id, "Zone unknown or uncovered, nothing to reconcile");
            return Ok(());
        };

        let sched = self.sched_state(zone_id);
        let now = Instant::now();
        {
            let next = sched.next.lock().expect("next poisoned");
            if now < *next {
                let remaining = *next - now;
                self.trigger_hosted_zone_after(zone_id.clone(), remaining);
                metrics::record_zone_reconciliation(
                    &zone_id.to_string(),
                    "deferred",
                    started.elapsed(),
                );
                return Ok(());
            }
        }

        if sched
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.trigger_hosted_zone_after(zone_id.clone(), BUSY_ZONE_DELAY);
            return Ok(());
        }

        // busy flag taken; from here on every exit must release it
        let result = self.reconcile_locked(zone_id, &sched, data).await;

        let status = match &result {
            Ok(()) => "success",
            Err(DnsError::LockContention { .. }) => "deferred",
            Err(_) => "error",
        };
        sched.busy.store(false, Ordering::Release);
        for object_name in self.state.lock.unlock_zone_reconciliation(zone_id) {
            let _ = self.triggers.send(Trigger::Entry(object_name));
        }
        metrics::record_zone_reconciliation(&zone_id.to_string(), status, started.elapsed());
        result
    }

    async fn reconcile_locked(
        self: &Arc<Self>,
        zone_id: &ZoneId,
        sched: &ZoneSchedState,
        data: ZoneReconcileData,
    ) -> Result<(), DnsError> {
        let all_entries: Vec<Arc<EntryHandle>> = data
            .entries
            .iter()
            .chain(&data.deleting)
            .chain(&data.stale)
            .cloned()
            .collect();
        let lock_pairs: Vec<(String, String)> = all_entries
            .iter()
            .map(|e| (e.object_name.clone(), e.name().dns_name))
            .collect();

        let blocked =
            self.state
                .lock
                .try_lock_zone_reconciliation(zone_id, &data.zone.domain, &lock_pairs);
        if !blocked.is_empty() {
            debug!(zone = %zone_id, blocked = blocked.len(), "Entries busy, deferring zone");
            self.trigger_hosted_zone_after(zone_id.clone(), BUSY_ZONE_DELAY);
            return Err(DnsError::LockContention {
                what: zone_id.to_string(),
            });
        }

        let ownership = self.ownership();
        let mut model = ChangeModel::new(
            self.cfg.clone(),
            ownership,
            data.zone.clone(),
            data.providers.clone(),
            data.default_provider.clone(),
        );
        model.set_resolved_addresses(self.resolved_addresses(&all_entries));

        let outcome = self
            .drive_model(&mut model, &data)
            .await;

        match outcome {
            Ok(retry_delay) => {
                sched.limiter.succeeded();
                *sched.next.lock().expect("next poisoned") =
                    Instant::now() + self.cfg.dns_delay();
                if let Some(delay) = retry_delay {
                    // rate-limited entries want another pass
                    self.trigger_hosted_zone_after(zone_id.clone(), delay);
                }
                Ok(())
            }
            Err(err) => {
                let delay = sched.limiter.failed();
                *sched.next.lock().expect("next poisoned") = Instant::now() + delay;
                self.trigger_hosted_zone_after(zone_id.clone(), delay);
                Err(err)
            }
        }
    }

    /// Feed the model: deletions, applies, stale retention, cleanup, update.
    ///
    /// Returns the earliest rate-limit retry delay, if any entry was
    /// deferred.
    async fn drive_model(
        self: &Arc<Self>,
        model: &mut ChangeModel,
        data: &ZoneReconcileData,
    ) -> Result<Option<Duration>, DnsError> {
        model.setup(&self.cache).await?;

        let mut dones: Vec<(Arc<EntryHandle>, Arc<EntryDone>, bool)> = Vec::new();
        let mut retry_delay: Option<Duration> = None;

        // deletions first so re-used names see a consistent observed state
        for entry in &data.deleting {
            let done = EntryDone::new();
            let (name, group) = entry.with_data(|d| (d.name.clone(), d.spec.update_group.clone()));
            let removed = model.delete(&name, &group, &(done.clone() as Done));
            if !removed {
                done.succeeded(); // nothing upstream, deletion is trivially done
            }
            dones.push((entry.clone(), done, true));
        }

        // stale entries keep their records but are reported as stale
        for entry in &data.stale {
            let name = entry.with_data(|d| d.name.clone());
            model.retain(&name);
            entry.set_state(
                EntryState::Stale,
                entry.with_data(|d| d.message.clone()),
            );
        }

        for entry in &data.entries {
            let done = EntryDone::new();
            let (name, group, targets, ttl, policy) = entry.with_data(|d| {
                (
                    d.name.clone(),
                    d.spec.update_group.clone(),
                    d.targets.clone(),
                    d.spec.ttl,
                    d.spec.routing_policy.clone(),
                )
            });
            let ttl = ttl
                .or(data.default_provider.default_ttl)
                .unwrap_or(self.cfg.ttl);
            match model.apply(&name, &group, &(done.clone() as Done), &targets, ttl, policy) {
                Ok(ApplyOutcome::Applied) => {}
                Ok(ApplyOutcome::QueuedNoOp) => done.succeeded(),
                Ok(ApplyOutcome::RateLimited(delay)) => {
                    retry_delay = Some(retry_delay.map_or(delay, |d| d.min(delay)));
                }
                Err(err) => {
                    debug!(entry = %entry.object_name, error = %err, "Apply rejected");
                }
            }
            dones.push((entry.clone(), done, false));
        }

        if model.cleanup() {
            debug!("Cleanup queued deletions for obsolete record sets");
        }

        let update_result = model.update(&self.cache).await;
        self.finalize_entries(&data.zone.id, dones);
        update_result.map(|()| retry_delay)
    }

    /// Write attempt outcomes back to entry status.
    fn finalize_entries(
        &self,
        zone_id: &ZoneId,
        dones: Vec<(Arc<EntryHandle>, Arc<EntryDone>, bool)>,
    ) {
        for (entry, done, was_deletion) in dones {
            match done.outcome() {
                AttemptOutcome::Succeeded => {
                    if was_deletion {
                        let had_records = entry.with_data(|d| {
                            let had = d.active_zone.take().is_some();
                            d.modified = false;
                            had
                        });
                        // the dispatcher releases the finalizer once it sees
                        // the records are gone; index removal follows when
                        // the watch layer confirms the object deletion
                        if had_records {
                            let _ = self
                                .triggers
                                .send(Trigger::Entry(entry.object_name.clone()));
                        }
                    } else {
                        entry.with_data(|d| {
                            d.state = EntryState::Ready;
                            d.message = None;
                            d.active_zone = Some(zone_id.clone());
                            d.modified = false;
                        });
                    }
                }
                AttemptOutcome::Failed(message) => {
                    entry.set_state(EntryState::Error, Some(message));
                }
                AttemptOutcome::Invalid(message) => {
                    entry.set_state(EntryState::Invalid, Some(message));
                }
                AttemptOutcome::Throttled => {
                    entry.set_state(EntryState::Pending, Some("throttled".to_string()));
                }
                AttemptOutcome::Pending => {}
            }
        }
    }

    /// Owner identities this instance answers for: the configured ident plus
    /// all active owner objects.
    fn ownership(&self) -> Ownership {
        let mut ids = self.state.owners.active_ids();
        ids.insert(self.cfg.ident.to_ascii_lowercase());
        Ownership::from_ids(ids)
    }

    /// Resolved addresses of every CNAME target of the entries.
    fn resolved_addresses(&self, entries: &[Arc<EntryHandle>]) -> HashMap<String, Vec<IpAddr>> {
        let source = self.addresses.lock().expect("addresses poisoned").clone();
        let Some(source) = source else {
            return HashMap::new();
        };
        let mut resolved = HashMap::new();
        for entry in entries {
            let hosts = entry.with_data(|d| {
                d.targets
                    .iter()
                    .filter(|t| t.rtype == RecordType::CNAME)
                    .map(|t| t.value.clone())
                    .collect::<Vec<_>>()
            });
            for host in hosts {
                if let Some(addrs) = source.resolved_addresses(&host) {
                    resolved.insert(host, addrs);
                }
            }
        }
        resolved
    }
}

#[cfg(test)]
#[path = "zone_scheduler_tests.rs"]
mod zone_scheduler_tests;
