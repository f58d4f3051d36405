// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Finalizer management port.
//!
//! The declarative layer pins entry objects with a finalizer while their
//! upstream records exist. The core does not touch objects itself; it only
//! decides *whether* the finalizer must stay and asks the port to retain or
//! release it. The surrounding controller manager implements the port
//! against its object store.

use crate::state::entry::EntryData;
use anyhow::Result;
use async_trait::async_trait;

/// Port to the declarative layer's finalizer handling.
#[async_trait]
pub trait FinalizerManager: Send + Sync {
    /// Ensure the finalizer is present on the entry object.
    ///
    /// Idempotent; called whenever the core still needs the object pinned.
    ///
    /// # Errors
    ///
    /// Object-store failures; the caller retries on the next reconciliation.
    async fn retain(&self, object_name: &str) -> Result<()>;

    /// Remove the finalizer, allowing the object to be deleted.
    ///
    /// # Errors
    ///
    /// Object-store failures; the caller retries on the next reconciliation.
    async fn release(&self, object_name: &str) -> Result<()>;
}

/// Whether the entry object must keep its finalizer.
///
/// The finalizer stays as long as upstream records may exist: the entry was
/// applied to a zone and that application has not been undone yet. Entries
/// that never made it upstream (invalid, duplicate, unmatched) can go at any
/// time.
#[must_use]
pub fn should_retain_finalizer(data: &EntryData) -> bool {
    if data.active_zone.is_some() {
        return true;
    }
    // not yet applied but about to be: keep the object pinned so deletion
    // always passes through upstream cleanup
    data.valid && !data.duplicate && !data.spec.deleting && data.zone_id.is_some()
}

#[cfg(test)]
#[path = "finalizers_tests.rs"]
mod finalizers_tests;
