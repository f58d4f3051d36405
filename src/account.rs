// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Shared DNS accounts and owner-identity bookkeeping.
//!
//! Providers that present identical credentials share one upstream handler.
//! The [`AccountCache`] coalesces them by a SHA-224 hash over the account
//! properties, provider type and raw provider configuration; the handler is
//! created on first use and shut down when the last provider releases it.
//!
//! The [`OwnerCache`] refcounts owner identities declared by owner objects.
//! Transitions between zero and nonzero emit a changeset that drives entry
//! re-triggering in multi-tenant deployments.

use crate::dns_errors::DnsError;
use crate::provider::DnsHandler;
use sha2::{Digest, Sha224};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Credential and configuration material identifying one upstream account.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccountConfig {
    /// Provider type the account belongs to (e.g. `aws-route53`)
    pub provider_type: String,
    /// Secret-derived account properties (keys sorted for hashing)
    pub properties: BTreeMap<String, String>,
    /// Raw provider configuration as passed through by the declarative API
    pub provider_config: String,
}

/// SHA-224 hash identifying an upstream account.
///
/// Two providers with the same hash share one [`DnsAccount`].
#[must_use]
pub fn account_hash(config: &AccountConfig) -> String {
    let mut hasher = Sha224::new();
    for (key, value) in &config.properties {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update([0u8]);
    hasher.update(config.provider_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(config.provider_config.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// A refcounted upstream account shared by providers with equal credentials.
pub struct DnsAccount {
    /// The account hash (cache key)
    pub hash: String,
    /// Provider type of the handler
    pub provider_type: String,
    handler: Arc<dyn DnsHandler>,
}

impl DnsAccount {
    /// Build an account around an existing handler.
    ///
    /// Embedders normally go through [`AccountCache::get`], which adds
    /// credential coalescing and refcounting on top.
    #[must_use]
    pub fn new(hash: &str, provider_type: &str, handler: Arc<dyn DnsHandler>) -> Self {
        Self {
            hash: hash.to_string(),
            provider_type: provider_type.to_string(),
            handler,
        }
    }

    /// The upstream handler. Callers must never mutate handler state
    /// directly; all mutations go through change requests.
    #[must_use]
    pub fn handler(&self) -> &Arc<dyn DnsHandler> {
        &self.handler
    }
}

impl std::fmt::Debug for DnsAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsAccount")
            .field("hash", &self.hash)
            .field("provider_type", &self.provider_type)
            .finish_non_exhaustive()
    }
}

struct AccountSlot {
    account: Arc<DnsAccount>,
    clients: BTreeSet<String>,
}

/// Cache of shared [`DnsAccount`]s keyed by account hash.
#[derive(Default)]
pub struct AccountCache {
    slots: Mutex<HashMap<String, AccountSlot>>,
}

impl AccountCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the shared account for `config`, registering
    /// `provider_name` as a client.
    ///
    /// # Errors
    ///
    /// Propagates handler construction failures from `factory`.
    pub fn get<F>(
        &self,
        provider_name: &str,
        config: &AccountConfig,
        factory: F,
    ) -> Result<Arc<DnsAccount>, DnsError>
    where
        F: FnOnce(&AccountConfig) -> Result<Arc<dyn DnsHandler>, DnsError>,
    {
        let hash = account_hash(config);
        let mut slots = self.slots.lock().expect("account cache poisoned");
        if let Some(slot) = slots.get_mut(&hash) {
            slot.clients.insert(provider_name.to_string());
            debug!(
                provider = provider_name,
                account = %hash,
                clients = slot.clients.len(),
                "Reusing shared DNS account"
            );
            return Ok(slot.account.clone());
        }

        let handler = factory(config)?;
        let account = Arc::new(DnsAccount {
            hash: hash.clone(),
            provider_type: config.provider_type.clone(),
            handler,
        });
        let mut clients = BTreeSet::new();
        clients.insert(provider_name.to_string());
        slots.insert(
            hash.clone(),
            AccountSlot {
                account: account.clone(),
                clients,
            },
        );
        info!(provider = provider_name, account = %hash, "Created DNS account");
        Ok(account)
    }

    /// Release `provider_name`'s reference on the account with `hash`.
    ///
    /// When the last client releases, the account is removed and its handler
    /// shut down.
    pub async fn release(&self, provider_name: &str, hash: &str) {
        let destroyed = {
            let mut slots = self.slots.lock().expect("account cache poisoned");
            let now_empty = match slots.get_mut(hash) {
                Some(slot) => {
                    slot.clients.remove(provider_name);
                    slot.clients.is_empty()
                }
                None => false,
            };
            if now_empty {
                slots.remove(hash).map(|slot| slot.account)
            } else {
                None
            }
        };
        if let Some(account) = destroyed {
            info!(account = %hash, "Destroying DNS account, shutting down handler");
            account.handler.shutdown().await;
        }
    }

    /// Number of live shared accounts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().expect("account cache poisoned").len()
    }

    /// True if no account is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The client provider names of the account with `hash`.
    #[must_use]
    pub fn clients_of(&self, hash: &str) -> BTreeSet<String> {
        self.slots
            .lock()
            .expect("account cache poisoned")
            .get(hash)
            .map(|slot| slot.clients.clone())
            .unwrap_or_default()
    }
}

/// Changeset emitted when owner identities transition between active and
/// inactive.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OwnerChangeset {
    /// Owner ids that went from zero to nonzero refcount
    pub activated: BTreeSet<String>,
    /// Owner ids that went from nonzero to zero refcount
    pub deactivated: BTreeSet<String>,
}

impl OwnerChangeset {
    /// True if no identity changed activation state.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.activated.is_empty() && self.deactivated.is_empty()
    }

    /// All ids touched by this changeset.
    #[must_use]
    pub fn touched(&self) -> BTreeSet<String> {
        self.activated.union(&self.deactivated).cloned().collect()
    }
}

/// Refcounts of owner identities declared by active owner objects.
#[derive(Default)]
pub struct OwnerCache {
    counts: Mutex<BTreeMap<String, usize>>,
}

impl OwnerCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one more declaration of each id; ids crossing 0 -> 1 appear
    /// in the returned changeset.
    pub fn activate<I, S>(&self, ids: I) -> OwnerChangeset
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut counts = self.counts.lock().expect("owner cache poisoned");
        let mut changeset = OwnerChangeset::default();
        for id in ids {
            let id = id.as_ref().to_ascii_lowercase();
            let count = counts.entry(id.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                changeset.activated.insert(id);
            }
        }
        changeset
    }

    /// Drop one declaration of each id; ids crossing 1 -> 0 appear in the
    /// returned changeset.
    pub fn deactivate<I, S>(&self, ids: I) -> OwnerChangeset
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut counts = self.counts.lock().expect("owner cache poisoned");
        let mut changeset = OwnerChangeset::default();
        for id in ids {
            let id = id.as_ref().to_ascii_lowercase();
            if let Some(count) = counts.get_mut(&id) {
                *count -= 1;
                if *count == 0 {
                    counts.remove(&id);
                    changeset.deactivated.insert(id);
                }
            }
        }
        changeset
    }

    /// The currently active owner ids.
    #[must_use]
    pub fn active_ids(&self) -> BTreeSet<String> {
        self.counts
            .lock()
            .expect("owner cache poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
#[path = "account_tests.rs"]
mod account_tests;
