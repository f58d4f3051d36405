// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! TTL-bounded memoization of upstream zone reads.
//!
//! Zone reads are the most expensive upstream calls; the cache amortizes
//! them across reconciliations. After successful change execution the cached
//! state is mutated in place (using the in-memory apply logic) so the next
//! reconciliation needs no refetch; failed executions invalidate the entry.
//!
//! Optional disk persistence writes one JSON file per zone through a
//! channel-fed coalescing flusher. Shutdown drains pending writes
//! deterministically; start-up removes files older than 24 hours.

use crate::config::Config;
use crate::constants::{CACHE_FILE_MAX_AGE, CACHE_SCHEMA_VERSION};
use crate::dns_errors::DnsError;
use crate::dnsset::DnsSet;
use crate::inmemory::InMemoryHandler;
use crate::metrics;
use crate::provider::{ChangeRequest, DnsHandler, ZoneState};
use crate::state::zone::{ZoneId, ZoneInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Persisted schema: zone identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedZone {
    provider_type: String,
    id: String,
    key: String,
    domain: String,
    forwarded_domains: Vec<String>,
}

impl From<&ZoneInfo> for PersistedZone {
    fn from(zone: &ZoneInfo) -> Self {
        Self {
            provider_type: zone.id.provider_type.clone(),
            id: zone.id.id.clone(),
            key: zone.key.clone(),
            domain: zone.domain.clone(),
            forwarded_domains: zone.forwarded_domains.clone(),
        }
    }
}

/// Opaque provider handler data persisted alongside the zone state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandlerData {
    /// Handler name
    pub name: String,
    /// Handler-defined schema version
    pub version: String,
    /// Opaque payload
    pub value: serde_json::Value,
}

/// Persisted schema of one zone-state file.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct PersistedZoneState {
    version: String,
    valid: DateTime<Utc>,
    zone: PersistedZone,
    dnssets: BTreeMap<String, DnsSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    handler_data: Option<HandlerData>,
}

struct CacheSlot {
    zone: ZoneInfo,
    state: ZoneState,
    valid_until: Instant,
}

enum FlushCmd {
    Write(ZoneId, Box<PersistedZoneState>),
    Remove(ZoneId),
}

/// Cache of upstream zone states keyed by zone id.
pub struct ZoneStateCache {
    cfg: Arc<Config>,
    slots: Mutex<HashMap<ZoneId, CacheSlot>>,
    flusher_tx: Mutex<Option<mpsc::UnboundedSender<FlushCmd>>>,
    flusher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ZoneStateCache {
    /// Create a cache without disk persistence.
    #[must_use]
    pub fn new(cfg: Arc<Config>) -> Self {
        Self {
            cfg,
            slots: Mutex::new(HashMap::new()),
            flusher_tx: Mutex::new(None),
            flusher: Mutex::new(None),
        }
    }

    /// Create a cache persisting to `cfg.cache_dir`, loading still-valid
    /// files and removing stale ones.
    ///
    /// # Errors
    ///
    /// Propagates directory creation failures; unreadable cache files are
    /// skipped with a warning.
    pub fn with_persistence(cfg: Arc<Config>) -> anyhow::Result<Self> {
        let Some(dir) = cfg.cache_dir.clone() else {
            return Ok(Self::new(cfg));
        };
        std::fs::create_dir_all(&dir)?;

        let mut cache = Self::new(cfg);
        cache.load_dir(&dir);

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_flusher(dir, rx));
        *cache.flusher_tx.lock().expect("flusher poisoned") = Some(tx);
        *cache.flusher.lock().expect("flusher poisoned") = Some(handle);
        Ok(cache)
    }

    fn load_dir(&mut self, dir: &Path) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "Cannot read cache dir");
                return;
            }
        };
        let now = Utc::now();
        let mut slots = self.slots.lock().expect("cache slots poisoned");
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            // stale files are removed, not loaded
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|m| m.elapsed().ok())
                .is_some_and(|age| age > CACHE_FILE_MAX_AGE);
            if stale {
                info!(file = %path.display(), "Removing stale zone cache file");
                let _ = std::fs::remove_file(&path);
                continue;
            }
            match read_persisted(&path) {
                Ok(persisted) => {
                    if persisted.valid <= now {
                        debug!(file = %path.display(), "Skipping expired zone cache file");
                        continue;
                    }
                    let remaining = (persisted.valid - now)
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    let zone_id = ZoneId::new(&persisted.zone.provider_type, &persisted.zone.id);
                    let mut zone = ZoneInfo::new(zone_id.clone(), &persisted.zone.domain);
                    zone.key = persisted.zone.key.clone();
                    zone.forwarded_domains = persisted.zone.forwarded_domains.clone();
                    let dns_sets = persisted
                        .dnssets
                        .values()
                        .map(|set| (set.name.clone(), set.clone()))
                        .collect();
                    slots.insert(
                        zone_id,
                        CacheSlot {
                            zone,
                            state: ZoneState::new(dns_sets),
                            valid_until: Instant::now() + remaining,
                        },
                    );
                }
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "Skipping unreadable zone cache file");
                }
            }
        }
        info!(zones = slots.len(), "Loaded persisted zone states");
    }

    /// The TTL for a zone's cached state: the zone policy's override when
    /// present, otherwise the configured default.
    fn ttl_for(&self, zone: &ZoneInfo) -> Duration {
        zone.cache_ttl_override().unwrap_or_else(|| self.cfg.cache_ttl())
    }

    /// Read a zone's state, serving from cache while valid.
    ///
    /// The cache TTL is the configured default unless the zone's policy
    /// overrides it. On upstream failure with a previously cached state, the
    /// stale state is served and revalidated for half that TTL.
    ///
    /// # Errors
    ///
    /// Propagates the upstream read failure when no cached state exists.
    pub async fn get(
        &self,
        zone: &ZoneInfo,
        handler: &Arc<dyn DnsHandler>,
    ) -> Result<ZoneState, DnsError> {
        if self.cfg.disable_zone_state_caching {
            return handler.get_zone_state(zone).await;
        }

        {
            let slots = self.slots.lock().expect("cache slots poisoned");
            if let Some(slot) = slots.get(&zone.id) {
                if Instant::now() < slot.valid_until {
                    metrics::ZONE_CACHE_HITS_TOTAL.inc();
                    return Ok(slot.state.clone());
                }
            }
        }
        metrics::ZONE_CACHE_MISSES_TOTAL.inc();

        match handler.get_zone_state(zone).await {
            Ok(state) => {
                self.store(zone, state.clone(), self.ttl_for(zone));
                Ok(state)
            }
            Err(err) => {
                // keep serving the stale state for half the TTL
                let mut slots = self.slots.lock().expect("cache slots poisoned");
                if let Some(slot) = slots.get_mut(&zone.id) {
                    warn!(zone = %zone.id, error = %err, "Zone read failed, serving stale state");
                    slot.valid_until = Instant::now() + self.ttl_for(zone) / 2;
                    return Ok(slot.state.clone());
                }
                Err(err)
            }
        }
    }

    fn store(&self, zone: &ZoneInfo, state: ZoneState, ttl: Duration) {
        let mut slots = self.slots.lock().expect("cache slots poisoned");
        slots.insert(
            zone.id.clone(),
            CacheSlot {
                zone: zone.clone(),
                state: state.clone(),
                valid_until: Instant::now() + ttl,
            },
        );
        drop(slots);
        self.persist(zone, &state, ttl);
    }

    fn flusher_sender(&self) -> Option<mpsc::UnboundedSender<FlushCmd>> {
        self.flusher_tx.lock().expect("flusher poisoned").clone()
    }

    fn persist(&self, zone: &ZoneInfo, state: &ZoneState, ttl: Duration) {
        let Some(tx) = self.flusher_sender() else {
            return;
        };
        let valid =
            Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let dnssets = state
            .dns_sets
            .values()
            .map(|set| (set.name.to_string(), set.clone()))
            .collect();
        let persisted = PersistedZoneState {
            version: CACHE_SCHEMA_VERSION.to_string(),
            valid,
            zone: PersistedZone::from(zone),
            dnssets,
            handler_data: None,
        };
        let _ = tx.send(FlushCmd::Write(zone.id.clone(), Box::new(persisted)));
    }

    /// Mutate the cached state in place after change execution.
    ///
    /// On success the requests are applied to the cached sets; on failure
    /// the cache entry is invalidated so the next reconciliation refetches.
    pub fn apply_requests(&self, zone_id: &ZoneId, requests: &[ChangeRequest], success: bool) {
        if self.cfg.disable_zone_state_caching {
            return;
        }
        if !success {
            self.invalidate(zone_id);
            return;
        }
        let mut slots = self.slots.lock().expect("cache slots poisoned");
        let Some(slot) = slots.get_mut(zone_id) else {
            return;
        };
        for request in requests {
            if let Err(err) = InMemoryHandler::apply_to_sets(&mut slot.state.dns_sets, request) {
                warn!(zone = %zone_id, error = %err, "Cached state diverged, invalidating");
                slots.remove(zone_id);
                drop(slots);
                if let Some(tx) = self.flusher_sender() {
                    let _ = tx.send(FlushCmd::Remove(zone_id.clone()));
                }
                return;
            }
        }
        let zone = slot.zone.clone();
        let state = slot.state.clone();
        let remaining = slot.valid_until.saturating_duration_since(Instant::now());
        drop(slots);
        self.persist(&zone, &state, remaining);
    }

    /// Drop the cached state of a zone.
    pub fn invalidate(&self, zone_id: &ZoneId) {
        self.slots
            .lock()
            .expect("cache slots poisoned")
            .remove(zone_id);
        if let Some(tx) = self.flusher_sender() {
            let _ = tx.send(FlushCmd::Remove(zone_id.clone()));
        }
    }

    /// Shut the flusher down, draining pending writes.
    pub async fn shutdown(&self) {
        // dropping the sender closes the channel; the flusher drains and exits
        self.flusher_tx.lock().expect("flusher poisoned").take();
        let handle = self.flusher.lock().expect("flusher poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// File name for a zone id: `/` replaced by `_`.
fn cache_file_name(zone_id: &ZoneId) -> String {
    zone_id.to_string().replace('/', "_")
}

fn read_persisted(path: &Path) -> anyhow::Result<PersistedZoneState> {
    let raw = std::fs::read(path)?;
    let persisted: PersistedZoneState = serde_json::from_slice(&raw)?;
    if persisted.version != CACHE_SCHEMA_VERSION {
        anyhow::bail!("unsupported cache schema version '{}'", persisted.version);
    }
    Ok(persisted)
}

/// Coalescing write loop: the latest pending write per zone wins. The loop
/// drains everything still pending when the channel closes, making shutdown
/// deterministic.
async fn run_flusher(dir: PathBuf, mut rx: mpsc::UnboundedReceiver<FlushCmd>) {
    let debounce = Duration::from_millis(100);
    loop {
        let Some(first) = rx.recv().await else {
            break; // channel closed, nothing pending
        };
        let mut pending: HashMap<ZoneId, Option<Box<PersistedZoneState>>> = HashMap::new();
        absorb(&mut pending, first);

        // coalesce whatever arrives within the debounce window
        let deadline = tokio::time::Instant::now() + debounce;
        let mut closed = false;
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => absorb(&mut pending, cmd),
                    None => { closed = true; break; }
                },
                () = tokio::time::sleep_until(deadline) => break,
            }
        }
        flush_pending(&dir, std::mem::take(&mut pending));
        if closed {
            break;
        }
    }
    // drain anything the close raced in
    let mut pending = HashMap::new();
    while let Ok(cmd) = rx.try_recv() {
        absorb(&mut pending, cmd);
    }
    flush_pending(&dir, pending);
    debug!("Zone cache flusher stopped");
}

fn absorb(pending: &mut HashMap<ZoneId, Option<Box<PersistedZoneState>>>, cmd: FlushCmd) {
    match cmd {
        FlushCmd::Write(zone_id, persisted) => {
            pending.insert(zone_id, Some(persisted));
        }
        FlushCmd::Remove(zone_id) => {
            pending.insert(zone_id, None);
        }
    }
}

fn flush_pending(dir: &Path, pending: HashMap<ZoneId, Option<Box<PersistedZoneState>>>) {
    for (zone_id, persisted) in pending {
        let path = dir.join(cache_file_name(&zone_id));
        let result = match persisted {
            Some(persisted) => write_atomically(dir, &path, &persisted),
            None => std::fs::remove_file(&path).or_else(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    Ok(())
                } else {
                    Err(err.into())
                }
            }),
        };
        if let Err(err) = result {
            warn!(zone = %zone_id, error = %err, "Zone cache write failed");
        }
    }
}

fn write_atomically(
    dir: &Path,
    path: &Path,
    persisted: &PersistedZoneState,
) -> anyhow::Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, persisted)?;
    tmp.flush()?;
    tmp.persist(path)?;
    Ok(())
}

#[cfg(test)]
#[path = "zone_cache_tests.rs"]
mod zone_cache_tests;
