// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! In-process DNS backend.
//!
//! Implements the full [`DnsHandler`] contract against process-local state.
//! Serves two purposes: the test backend for the reconciliation engine, and
//! the apply-logic used by the zone state cache to mutate cached zone reads
//! in place after successful change execution.

use crate::dns_errors::DnsError;
use crate::dnsset::{DnsSets, RecordType};
use crate::provider::{ChangeAction, ChangeRequest, DnsHandler, ZoneState};
use crate::state::zone::{ZoneId, ZoneInfo};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// In-process hosted-zone store implementing the provider contract.
pub struct InMemoryHandler {
    provider_type: String,
    zones: Mutex<BTreeMap<ZoneId, (ZoneInfo, DnsSets)>>,
    /// Injected failure for the next `execute_requests` call (tests)
    fail_execute: AtomicBool,
    /// Injected failure for `get_zone_state` calls (tests)
    fail_zone_state: AtomicBool,
    zone_state_reads: AtomicU64,
    shut_down: AtomicBool,
}

impl InMemoryHandler {
    /// Create an empty backend for a provider type.
    #[must_use]
    pub fn new(provider_type: &str) -> Self {
        Self {
            provider_type: provider_type.to_string(),
            zones: Mutex::new(BTreeMap::new()),
            fail_execute: AtomicBool::new(false),
            fail_zone_state: AtomicBool::new(false),
            zone_state_reads: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Register a hosted zone.
    pub fn add_zone(&self, zone: ZoneInfo) {
        self.zones
            .lock()
            .expect("in-memory zones poisoned")
            .insert(zone.id.clone(), (zone, DnsSets::new()));
    }

    /// Replace the record sets of a zone.
    pub fn set_zone_sets(&self, zone_id: &ZoneId, sets: DnsSets) {
        if let Some((_, existing)) = self
            .zones
            .lock()
            .expect("in-memory zones poisoned")
            .get_mut(zone_id)
        {
            *existing = sets;
        }
    }

    /// Snapshot of a zone's record sets.
    #[must_use]
    pub fn zone_sets(&self, zone_id: &ZoneId) -> DnsSets {
        self.zones
            .lock()
            .expect("in-memory zones poisoned")
            .get(zone_id)
            .map(|(_, sets)| sets.clone())
            .unwrap_or_default()
    }

    /// Make the next `execute_requests` call fail (tests).
    pub fn fail_next_execute(&self) {
        self.fail_execute.store(true, Ordering::SeqCst);
    }

    /// Make `get_zone_state` calls fail until cleared (tests).
    pub fn set_fail_zone_state(&self, fail: bool) {
        self.fail_zone_state.store(fail, Ordering::SeqCst);
    }

    /// Number of `get_zone_state` calls served.
    #[must_use]
    pub fn zone_state_reads(&self) -> u64 {
        self.zone_state_reads.load(Ordering::SeqCst)
    }

    /// True once `shutdown` was called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Apply one change request to a set map.
    ///
    /// Creates and updates write the request's record type plus the META
    /// attributes of the desired bundle; deletes remove the record type and
    /// drop the whole name once no real type remains.
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::Generic`] when a delete references a name or type
    /// that is not present.
    pub fn apply_to_sets(sets: &mut DnsSets, request: &ChangeRequest) -> Result<(), DnsError> {
        let name = request.name().clone();
        match request.action {
            ChangeAction::Create | ChangeAction::Update => {
                let addition = request
                    .addition
                    .as_ref()
                    .ok_or_else(|| DnsError::Generic("change request without addition".into()))?;
                let target = sets
                    .entry(name.clone())
                    .or_insert_with(|| crate::dnsset::DnsSet::new(name));
                if let Some(rset) = addition.get(request.rtype) {
                    target.sets.insert(request.rtype, rset.clone());
                }
                if let Some(meta) = addition.get(RecordType::Meta) {
                    target.sets.insert(RecordType::Meta, meta.clone());
                }
                target.routing_policy = addition.routing_policy.clone();
            }
            ChangeAction::Delete => {
                let Some(existing) = sets.get_mut(&name) else {
                    return Err(DnsError::Generic(format!(
                        "delete of unknown name '{name}'"
                    )));
                };
                existing.sets.remove(&request.rtype);
                if existing.record_types().next().is_none() {
                    sets.remove(&name);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DnsHandler for InMemoryHandler {
    fn provider_type(&self) -> &str {
        &self.provider_type
    }

    async fn get_zones(&self) -> Result<Vec<ZoneInfo>, DnsError> {
        Ok(self
            .zones
            .lock()
            .expect("in-memory zones poisoned")
            .values()
            .map(|(zone, _)| zone.clone())
            .collect())
    }

    async fn get_zone_state(&self, zone: &ZoneInfo) -> Result<ZoneState, DnsError> {
        self.zone_state_reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_zone_state.load(Ordering::SeqCst) {
            return Err(DnsError::Transient {
                reason: "injected zone-state failure".to_string(),
            });
        }
        let zones = self.zones.lock().expect("in-memory zones poisoned");
        match zones.get(&zone.id) {
            Some((_, sets)) => Ok(ZoneState::new(sets.clone())),
            None => Err(DnsError::NoSuchHostedZone {
                zone: zone.id.to_string(),
            }),
        }
    }

    async fn execute_requests(
        &self,
        zone: &ZoneInfo,
        _state: &ZoneState,
        requests: &[ChangeRequest],
    ) -> Result<(), DnsError> {
        if self.fail_execute.swap(false, Ordering::SeqCst) {
            let err = DnsError::Transient {
                reason: "injected execute failure".to_string(),
            };
            for request in requests {
                if let Some(done) = &request.done {
                    done.failed(&err);
                }
            }
            return Err(err);
        }

        let mut zones = self.zones.lock().expect("in-memory zones poisoned");
        let Some((_, sets)) = zones.get_mut(&zone.id) else {
            return Err(DnsError::NoSuchHostedZone {
                zone: zone.id.to_string(),
            });
        };
        for request in requests {
            debug!(
                zone = %zone.id,
                action = %request.action,
                rtype = %request.rtype,
                name = %request.name(),
                "Applying change request"
            );
            Self::apply_to_sets(sets, request)?;
            if let Some(done) = &request.done {
                done.succeeded();
            }
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[path = "inmemory_tests.rs"]
mod inmemory_tests;
