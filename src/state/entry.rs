// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Entries: the reconciler's view of declarative DNS record requests.
//!
//! An [`EntryHandle`] is the long-lived in-memory object for one declarative
//! entry. Its mutable payload sits behind a short-critical-section mutex;
//! reconciliation exclusivity is a separate spin lock with a bounded
//! acquisition budget so the state layer never blocks on a busy entry.

use crate::constants::ENTRY_SPIN_BUDGET;
use crate::dns_errors::DnsError;
use crate::dnsset::{DnsSetName, RecordType, RoutingPolicy, Target};
use crate::state::zone::ZoneId;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Reconciliation state of an entry, as surfaced on its status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    /// Observed but not yet reconciled
    Pending,
    /// All records applied upstream
    Ready,
    /// Reconciliation failed; retried per error class
    Error,
    /// Previously applied records kept, current spec not applicable
    Stale,
    /// Spec rejected; not retried until it changes
    Invalid,
    /// Carries the ignore annotation; not reconciled
    Ignored,
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryState::Pending => "pending",
            EntryState::Ready => "ready",
            EntryState::Error => "error",
            EntryState::Stale => "stale",
            EntryState::Invalid => "invalid",
            EntryState::Ignored => "ignored",
        };
        f.write_str(s)
    }
}

/// The declarative input of one entry, as delivered by the watch layer.
#[derive(Clone, Debug)]
pub struct EntrySpec {
    /// Cluster-unique object key (e.g. `namespace/name`)
    pub object_name: String,
    /// Desired DNS name
    pub dns_name: String,
    /// Routing-policy set identifier; empty for plain entries
    pub set_identifier: String,
    /// Desired routing policy, applied across all record sets of the name
    pub routing_policy: Option<RoutingPolicy>,
    /// Raw target values (hostnames, IP addresses, quoted text)
    pub targets: Vec<String>,
    /// Desired record TTL; falls back to provider default, then global
    pub ttl: Option<u64>,
    /// Provenance key, typically the namespace of the entry object
    pub update_group: String,
    /// Owner identity override for multi-tenant deployments
    pub owner_id: Option<String>,
    /// The entry carries the ignore annotation
    pub ignored: bool,
    /// The declarative object has a deletion timestamp
    pub deleting: bool,
    /// Creation time; the monotonic duplicate tie-break
    pub created_at: DateTime<Utc>,
    /// Spec generation, echoed as observed generation on status
    pub generation: i64,
}

/// User-visible status of an entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryStatus {
    /// Current reconciliation state
    pub state: EntryState,
    /// Human-readable detail, set for error-like states
    pub message: Option<String>,
    /// Name of the responsible provider
    pub provider: Option<String>,
    /// Id of the hosted zone the entry belongs to
    pub zone: Option<String>,
    /// Spec generation this status reflects
    pub observed_generation: i64,
}

/// Mutable payload of an entry.
#[derive(Debug)]
pub struct EntryData {
    /// Latest declarative input
    pub spec: EntrySpec,
    /// Normalized set name derived from the spec
    pub name: DnsSetName,
    /// Validated, typed targets
    pub targets: Vec<Target>,
    /// Current reconciliation state
    pub state: EntryState,
    /// Status detail for error-like states
    pub message: Option<String>,
    /// Responsible provider, if resolved
    pub provider_name: Option<String>,
    /// Account hash of the responsible provider
    pub account_hash: Option<String>,
    /// Hosted zone the entry routes to, if resolved
    pub zone_id: Option<ZoneId>,
    /// Zone whose upstream records currently reflect this entry
    pub active_zone: Option<ZoneId>,
    /// Spec passed validation
    pub valid: bool,
    /// Another (earlier) entry claims the same DNS name
    pub duplicate: bool,
    /// Desired state differs from what was last applied
    pub modified: bool,
    /// The declarative object is gone; kept only for upstream cleanup
    pub obsolete: bool,
}

impl EntryData {
    /// The user-visible status of this entry.
    #[must_use]
    pub fn status(&self) -> EntryStatus {
        EntryStatus {
            state: self.state,
            message: self.message.clone(),
            provider: self.provider_name.clone(),
            zone: self.zone_id.as_ref().map(ToString::to_string),
            observed_generation: self.spec.generation,
        }
    }
}

/// Validate an entry spec: normalize the name, derive typed targets.
///
/// CNAME targets may appear more than once (the change model synthesizes
/// address records from them), but mixing CNAME targets with address or text
/// targets is rejected. A routing policy and a set identifier only make
/// sense together: either both are present or neither is.
///
/// # Errors
///
/// Returns [`DnsError::Validation`] describing the first violation.
pub fn validate_spec(spec: &EntrySpec) -> Result<(DnsSetName, Vec<Target>), DnsError> {
    let invalid = |reason: &str| DnsError::Validation {
        object_name: spec.object_name.clone(),
        reason: reason.to_string(),
    };

    if spec.dns_name.trim_end_matches('.').is_empty() {
        return Err(invalid("empty DNS name"));
    }
    let name = DnsSetName::with_identifier(&spec.dns_name, &spec.set_identifier);
    if name.dns_name.starts_with('.') || name.dns_name.contains("..") {
        return Err(invalid("malformed DNS name"));
    }

    if spec.routing_policy.is_some() && spec.set_identifier.is_empty() {
        return Err(invalid("routing policy requires a set identifier"));
    }
    if spec.routing_policy.is_none() && !spec.set_identifier.is_empty() {
        return Err(invalid("set identifier requires a routing policy"));
    }

    if spec.targets.is_empty() && !spec.deleting {
        return Err(invalid("no targets"));
    }

    let mut targets = Vec::with_capacity(spec.targets.len());
    for raw in &spec.targets {
        if raw.is_empty() {
            return Err(invalid("empty target"));
        }
        let target = Target::from_value(raw);
        if !targets.contains(&target) {
            targets.push(target);
        }
    }

    let has_cname = targets.iter().any(|t| t.rtype == RecordType::CNAME);
    let has_other = targets.iter().any(|t| t.rtype != RecordType::CNAME);
    if has_cname && has_other {
        return Err(invalid("CNAME targets cannot be mixed with other record types"));
    }

    Ok((name, targets))
}

/// Bounded spin lock guarding one entry's reconciliation.
#[derive(Debug, Default)]
pub struct EntrySpinLock {
    held: AtomicBool,
}

impl EntrySpinLock {
    /// Try to take the lock immediately.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Spin on the lock for up to `budget`; the default budget is ~10 ms.
    #[must_use]
    pub fn try_lock_spinning(&self, budget: Option<Duration>) -> bool {
        let budget = budget.unwrap_or(ENTRY_SPIN_BUDGET);
        let deadline = Instant::now() + budget;
        loop {
            if self.try_lock() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::yield_now();
        }
    }

    /// Release the lock.
    pub fn unlock(&self) {
        self.held.store(false, Ordering::Release);
    }

    /// True while held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// The long-lived in-memory object for one declarative entry.
pub struct EntryHandle {
    /// Cluster-unique object key
    pub object_name: String,
    /// Reconciliation exclusivity (spin lock, bounded acquisition)
    pub lock: EntrySpinLock,
    data: Mutex<EntryData>,
}

impl EntryHandle {
    /// Build a handle for a freshly observed entry.
    ///
    /// The spec is not validated here; [`crate::state::State::update_entry`]
    /// runs validation and records the outcome.
    #[must_use]
    pub fn new(spec: EntrySpec) -> Self {
        let name = DnsSetName::with_identifier(&spec.dns_name, &spec.set_identifier);
        let object_name = spec.object_name.clone();
        Self {
            object_name,
            lock: EntrySpinLock::default(),
            data: Mutex::new(EntryData {
                spec,
                name,
                targets: Vec::new(),
                state: EntryState::Pending,
                message: None,
                provider_name: None,
                account_hash: None,
                zone_id: None,
                active_zone: None,
                valid: false,
                duplicate: false,
                modified: true,
                obsolete: false,
            }),
        }
    }

    /// Run `f` against the mutable payload.
    ///
    /// The closure must not block or call back into the state layer.
    pub fn with_data<R>(&self, f: impl FnOnce(&mut EntryData) -> R) -> R {
        let mut data = self.data.lock().expect("entry data poisoned");
        f(&mut data)
    }

    /// The normalized set name.
    #[must_use]
    pub fn name(&self) -> DnsSetName {
        self.with_data(|d| d.name.clone())
    }

    /// The current reconciliation state.
    #[must_use]
    pub fn state(&self) -> EntryState {
        self.with_data(|d| d.state)
    }

    /// The resolved zone id, if any.
    #[must_use]
    pub fn zone_id(&self) -> Option<ZoneId> {
        self.with_data(|d| d.zone_id.clone())
    }

    /// The user-visible status snapshot.
    #[must_use]
    pub fn status(&self) -> EntryStatus {
        self.with_data(|d| d.status())
    }

    /// Record a state transition with an optional message.
    pub fn set_state(&self, state: EntryState, message: Option<String>) {
        self.with_data(|d| {
            d.state = state;
            d.message = message;
        });
    }
}

impl fmt::Debug for EntryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryHandle")
            .field("object_name", &self.object_name)
            .field("locked", &self.lock.is_locked())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "entry_tests.rs"]
mod entry_tests;
