// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Two-level locking between entry reconciliation and zone reconciliation.
//!
//! The dispatcher reconciles single entries; the zone scheduler reconciles
//! whole zones, touching many entries at once. This registry keeps the two
//! from overlapping:
//!
//! - an entry reconciliation cannot start while any zone whose domain covers
//!   the entry's DNS name holds the entry;
//! - a zone reconciliation reports (rather than waits for) entries that are
//!   individually held or still inside the post-zone outstanding window.
//!
//! Multiple zone ids may hold the same entry (a private and a public zone
//! sharing a domain); an entry is only free when the last holder releases.
//!
//! Debug builds additionally carry a lock-order tracker: the state lock,
//! entry spin locks and zone state must be acquired in that order, and never
//! the state lock while a zone busy flag is held.

use crate::constants::OUTSTANDING_TIMEOUT;
use crate::selector::match_domain_len;
use crate::state::zone::ZoneId;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Default)]
struct EntryLockState {
    dns_name: String,
    /// Held by the entry-level dispatcher
    entry_held: bool,
    /// Zone reconciliations currently holding the entry, with their domains
    zones: BTreeMap<ZoneId, String>,
    /// Triggers accumulated while the entry was held
    triggers: u32,
    /// End of the post-zone outstanding window
    outstanding_until: Option<Instant>,
}

impl EntryLockState {
    fn is_free(&self) -> bool {
        !self.entry_held && self.zones.is_empty() && self.triggers == 0
            && self.outstanding_until.is_none_or(|t| Instant::now() >= t)
    }
}

/// Registry coordinating entry-level and zone-level reconciliation locks.
#[derive(Default)]
pub struct EntryZoneLock {
    inner: Mutex<HashMap<String, EntryLockState>>,
}

impl EntryZoneLock {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the entry-level lock for a single-entry reconciliation.
    ///
    /// Fails when the entry is held by any zone reconciliation whose domain
    /// covers `dns_name`; the failed attempt is recorded so the entry is
    /// re-triggered once the zone unlocks.
    #[must_use]
    pub fn try_lock_entry_reconciliation(&self, object_name: &str, dns_name: &str) -> bool {
        let mut inner = self.inner.lock().expect("entry-zone lock poisoned");
        let slot = inner.entry_with_default(object_name);
        slot.dns_name = dns_name.to_string();

        if slot.entry_held {
            slot.triggers += 1;
            return false;
        }
        let covered = slot
            .zones
            .values()
            .any(|domain| match_domain_len(dns_name, domain) > 0);
        if covered {
            slot.triggers += 1;
            debug!(entry = object_name, "Entry held by zone reconciliation, queuing trigger");
            return false;
        }
        slot.entry_held = true;
        true
    }

    /// Release the entry-level lock.
    pub fn unlock_entry_reconciliation(&self, object_name: &str) {
        let mut inner = self.inner.lock().expect("entry-zone lock poisoned");
        if let Some(slot) = inner.get_mut(object_name) {
            slot.entry_held = false;
            if slot.is_free() {
                inner.remove(object_name);
            }
        }
    }

    /// Lock `entries` for a zone reconciliation.
    ///
    /// Returns the object names that could NOT be taken: entries held by the
    /// dispatcher, entries still inside the outstanding window, and any
    /// individually-held entry (even outside `entries`) whose DNS name the
    /// zone domain covers. The remaining entries are locked for `zone_id`.
    #[must_use]
    pub fn try_lock_zone_reconciliation(
        &self,
        zone_id: &ZoneId,
        zone_domain: &str,
        entries: &[(String, String)],
    ) -> Vec<String> {
        let mut inner = self.inner.lock().expect("entry-zone lock poisoned");
        let mut blocked = Vec::new();
        let now = Instant::now();

        for (object_name, dns_name) in entries {
            let slot = inner.entry_with_default(object_name);
            slot.dns_name = dns_name.clone();
            let outstanding = slot.outstanding_until.is_some_and(|t| now < t);
            if slot.entry_held || outstanding {
                blocked.push(object_name.clone());
                continue;
            }
            slot.zones.insert(zone_id.clone(), zone_domain.to_string());
        }

        // entries held individually elsewhere but belonging to this domain
        for (object_name, slot) in inner.iter() {
            if slot.entry_held
                && match_domain_len(&slot.dns_name, zone_domain) > 0
                && !blocked.contains(object_name)
                && !entries.iter().any(|(name, _)| name == object_name)
            {
                blocked.push(object_name.clone());
            }
        }
        blocked
    }

    /// Release all entries held for `zone_id`.
    ///
    /// Returns the entries that accumulated triggers during the hold; every
    /// released entry gets its outstanding deadline stamped.
    #[must_use]
    pub fn unlock_zone_reconciliation(&self, zone_id: &ZoneId) -> Vec<String> {
        let mut inner = self.inner.lock().expect("entry-zone lock poisoned");
        let mut to_trigger = Vec::new();
        let deadline = Instant::now() + OUTSTANDING_TIMEOUT;

        let names: Vec<String> = inner
            .iter()
            .filter(|(_, slot)| slot.zones.contains_key(zone_id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            let slot = inner.get_mut(&name).expect("slot disappeared");
            slot.zones.remove(zone_id);
            if slot.zones.is_empty() {
                slot.outstanding_until = Some(deadline);
                if slot.triggers > 0 {
                    slot.triggers = 0;
                    to_trigger.push(name);
                }
            }
        }
        to_trigger
    }

    /// True if the entry is currently held by anyone.
    #[must_use]
    pub fn is_held(&self, object_name: &str) -> bool {
        self.inner
            .lock()
            .expect("entry-zone lock poisoned")
            .get(object_name)
            .is_some_and(|slot| slot.entry_held || !slot.zones.is_empty())
    }
}

trait EntryWithDefault {
    fn entry_with_default(&mut self, key: &str) -> &mut EntryLockState;
}

impl EntryWithDefault for HashMap<String, EntryLockState> {
    fn entry_with_default(&mut self, key: &str) -> &mut EntryLockState {
        self.entry(key.to_string()).or_default()
    }
}

/// Debug-build lock-order tracker.
///
/// Levels: state lock (1) -> entry spin lock (2) -> zone state (3). Each
/// thread may only move to strictly higher levels while holding a guard.
#[cfg(debug_assertions)]
pub mod order {
    use std::cell::Cell;

    thread_local! {
        static CURRENT: Cell<u8> = const { Cell::new(0) };
    }

    /// Lock levels, in required acquisition order.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum Level {
        /// The state layer's read/write lock
        State = 1,
        /// A per-entry spin lock
        Entry = 2,
        /// A zone mutex or busy flag
        Zone = 3,
    }

    /// RAII guard restoring the previous level on drop.
    pub struct OrderGuard {
        previous: u8,
    }

    impl Drop for OrderGuard {
        fn drop(&mut self) {
            CURRENT.with(|c| c.set(self.previous));
        }
    }

    /// Record entering `level`; panics when the order is violated.
    #[must_use]
    pub fn enter(level: Level) -> OrderGuard {
        CURRENT.with(|current| {
            let previous = current.get();
            assert!(
                (level as u8) > previous,
                "lock order violation: acquiring level {level:?} while at {previous}"
            );
            current.set(level as u8);
            OrderGuard { previous }
        })
    }
}

#[cfg(test)]
#[path = "lock_tests.rs"]
mod lock_tests;
