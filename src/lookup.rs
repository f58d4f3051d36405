// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! The lookup processor: periodic re-resolution of CNAME target hostnames.
//!
//! A cooperative single-threaded scheduler pops jobs from a min-heap keyed
//! by due time, skips jobs whose previous run is still in flight, and spawns
//! bounded workers (a semaphore caps concurrency). A worker re-resolves all
//! hostnames of its job; when the resolved IP set differs from the last run
//! the owning entry is enqueued for re-reconciliation.
//!
//! Hostname resolution retries temporary and timeout failures up to five
//! times with 500 ms waits; not-found errors are returned verbatim.

use crate::constants::{
    HOSTS_PER_JOB_CONCURRENCY, LOOKUP_CHECK_PERIOD, LOOKUP_RETRIES, LOOKUP_RETRY_WAIT,
};
use crate::dns_errors::{DnsLookupError, LookupErrorKind};
use crate::metrics;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Hostname resolution port; production uses the system resolver, tests
/// inject stubs.
#[async_trait]
pub trait LookupHost: Send + Sync {
    /// Resolve a hostname to its addresses.
    async fn lookup_host(&self, host: &str) -> Result<Vec<IpAddr>, DnsLookupError>;
}

/// Source of previously resolved addresses, consumed by the change model
/// for multi-CNAME synthesis.
pub trait AddressSource: Send + Sync {
    /// The last resolved addresses of `host`, if any.
    fn resolved_addresses(&self, host: &str) -> Option<Vec<IpAddr>>;
}

/// Receiver of entry re-reconciliation requests.
pub trait EntryTrigger: Send + Sync {
    /// Enqueue the entry with this object name.
    fn trigger_entry(&self, object_name: &str);
}

/// System resolver backed by hickory.
pub struct SystemLookupHost {
    resolver: TokioAsyncResolver,
}

impl SystemLookupHost {
    /// Build a resolver from the system configuration.
    ///
    /// # Errors
    ///
    /// Propagates resolver construction failures (unreadable
    /// `/etc/resolv.conf` and friends).
    pub fn from_system_conf() -> anyhow::Result<Self> {
        Ok(Self {
            resolver: TokioAsyncResolver::tokio_from_system_conf()?,
        })
    }
}

#[async_trait]
impl LookupHost for SystemLookupHost {
    async fn lookup_host(&self, host: &str) -> Result<Vec<IpAddr>, DnsLookupError> {
        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => Ok(lookup.iter().collect()),
            Err(err) => {
                let kind = match err.kind() {
                    ResolveErrorKind::NoRecordsFound { .. } => LookupErrorKind::NotFound,
                    ResolveErrorKind::Timeout => LookupErrorKind::Timeout,
                    ResolveErrorKind::Io(_) | ResolveErrorKind::NoConnections => {
                        LookupErrorKind::Temporary
                    }
                    _ => LookupErrorKind::Other,
                };
                Err(DnsLookupError {
                    host: host.to_string(),
                    message: err.to_string(),
                    kind,
                })
            }
        }
    }
}

/// Aggregated resolution results of one job run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LookupResults {
    /// The hostnames that were resolved
    pub hostnames: Vec<String>,
    /// Deduplicated IPv4 addresses, sorted
    pub ipv4_addrs: Vec<Ipv4Addr>,
    /// Deduplicated IPv6 addresses, sorted
    pub ipv6_addrs: Vec<Ipv6Addr>,
    /// Errors encountered, one per failing hostname
    pub errors: Vec<DnsLookupError>,
    /// Union of all resolved addresses
    pub all_ips: BTreeSet<IpAddr>,
    /// Addresses per hostname
    pub per_host: HashMap<String, Vec<IpAddr>>,
}

/// Resolve all hostnames, up to four concurrently, deduplicating the
/// resulting addresses. The aggregate is independent of hostname order.
pub async fn lookup_all_hostnames_ips(
    resolver: &Arc<dyn LookupHost>,
    hosts: &[String],
) -> LookupResults {
    let outcomes: Vec<(String, Result<Vec<IpAddr>, DnsLookupError>)> = stream::iter(hosts.to_vec())
        .map(|host| {
            let resolver = resolver.clone();
            async move {
                let result = resolve_with_retry(&resolver, &host).await;
                (host, result)
            }
        })
        .buffer_unordered(HOSTS_PER_JOB_CONCURRENCY)
        .collect()
        .await;

    let mut results = LookupResults {
        hostnames: hosts.to_vec(),
        ..LookupResults::default()
    };
    for (host, outcome) in outcomes {
        match outcome {
            Ok(addrs) => {
                for addr in &addrs {
                    results.all_ips.insert(*addr);
                }
                results.per_host.insert(host, addrs);
            }
            Err(err) => results.errors.push(err),
        }
    }
    for addr in &results.all_ips {
        match addr {
            IpAddr::V4(v4) => results.ipv4_addrs.push(*v4),
            IpAddr::V6(v6) => results.ipv6_addrs.push(*v6),
        }
    }
    results
}

/// Resolve one hostname, retrying temporary and timeout failures.
async fn resolve_with_retry(
    resolver: &Arc<dyn LookupHost>,
    host: &str,
) -> Result<Vec<IpAddr>, DnsLookupError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match resolver.lookup_host(host).await {
            Ok(addrs) => return Ok(addrs),
            Err(err) if err.is_retryable() && attempt < LOOKUP_RETRIES => {
                debug!(host, attempt, error = %err, "Retrying hostname resolution");
                tokio::time::sleep(LOOKUP_RETRY_WAIT).await;
            }
            Err(err) => return Err(err),
        }
    }
}

struct JobSlot {
    hostnames: Vec<String>,
    interval: Duration,
    scheduled_at: Instant,
    all_ips: BTreeSet<IpAddr>,
    running: Arc<AtomicBool>,
}

struct ProcessorInner {
    heap: BinaryHeap<Reverse<(Instant, String)>>,
    jobs: HashMap<String, JobSlot>,
    host_addrs: HashMap<String, Vec<IpAddr>>,
}

/// Counters exposed for tests and metrics.
#[derive(Debug, Default)]
pub struct LookupStats {
    /// Jobs executed
    pub lookups: AtomicU64,
    /// Jobs skipped because the previous run was still in flight
    pub skipped: AtomicU64,
    /// Jobs whose resolved IP set changed
    pub changed: AtomicU64,
    /// Jobs that hit at least one resolution error
    pub errors: AtomicU64,
}

/// Cooperative scheduler for periodic hostname re-resolution.
pub struct LookupProcessor {
    inner: Mutex<ProcessorInner>,
    resolver: Arc<dyn LookupHost>,
    enqueue: Arc<dyn EntryTrigger>,
    semaphore: Arc<Semaphore>,
    check_period: Duration,
    running: AtomicBool,
    /// Execution counters
    pub stats: LookupStats,
}

impl LookupProcessor {
    /// Build a processor with the given resolver, entry sink and worker cap.
    #[must_use]
    pub fn new(
        resolver: Arc<dyn LookupHost>,
        enqueue: Arc<dyn EntryTrigger>,
        concurrent_jobs: usize,
        check_period: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ProcessorInner {
                heap: BinaryHeap::new(),
                jobs: HashMap::new(),
                host_addrs: HashMap::new(),
            }),
            resolver,
            enqueue,
            semaphore: Arc::new(Semaphore::new(concurrent_jobs.max(1))),
            check_period: check_period.unwrap_or(LOOKUP_CHECK_PERIOD),
            running: AtomicBool::new(false),
            stats: LookupStats::default(),
        })
    }

    /// Insert or update the job for `object_name`.
    ///
    /// `last_ips` seeds change detection: the first run only enqueues the
    /// entry when its result differs from this baseline.
    pub fn upsert(
        &self,
        object_name: &str,
        hostnames: Vec<String>,
        last_ips: BTreeSet<IpAddr>,
        interval: Duration,
    ) {
        let mut inner = self.inner.lock().expect("lookup inner poisoned");
        let now = Instant::now();
        match inner.jobs.get_mut(object_name) {
            Some(slot) => {
                slot.hostnames = hostnames;
                slot.interval = interval;
            }
            None => {
                let slot = JobSlot {
                    hostnames,
                    interval,
                    scheduled_at: now,
                    all_ips: last_ips,
                    running: Arc::new(AtomicBool::new(false)),
                };
                inner.jobs.insert(object_name.to_string(), slot);
                inner.heap.push(Reverse((now, object_name.to_string())));
            }
        }
    }

    /// Remove the job for `object_name`; stale heap entries are dropped
    /// lazily.
    pub fn delete(&self, object_name: &str) {
        self.inner
            .lock()
            .expect("lookup inner poisoned")
            .jobs
            .remove(object_name);
    }

    /// Number of registered jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("lookup inner poisoned").jobs.len()
    }

    /// True when no job is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True while the scheduler loop runs.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Scheduler loop: sleep until the next job (or the check period), pop
    /// due jobs and spawn workers. Exits when `shutdown` fires; in-flight
    /// workers finish on their own.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.running.store(true, Ordering::SeqCst);
        loop {
            let sleep_for = self.next_wakeup();
            tokio::select! {
                () = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.changed() => break,
            }
            let due = self.pop_due();
            for (object_name, hostnames, running, baseline) in due {
                let permit = match self.semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break, // semaphore closed, shutting down
                };
                let processor = self.clone();
                tokio::spawn(async move {
                    processor
                        .run_job(&object_name, hostnames, baseline)
                        .await;
                    running.store(false, Ordering::SeqCst);
                    drop(permit);
                });
            }
        }
        self.running.store(false, Ordering::SeqCst);
        debug!("Lookup processor stopped");
    }

    fn next_wakeup(&self) -> Duration {
        let inner = self.inner.lock().expect("lookup inner poisoned");
        let now = Instant::now();
        match inner.heap.peek() {
            Some(Reverse((due, _))) if *due > now => due.duration_since(now).min(self.check_period),
            Some(_) => Duration::ZERO,
            None => self.check_period,
        }
    }

    /// Pop all due jobs, rescheduling each by its interval. Jobs still
    /// running are counted as skipped; stale heap entries are discarded.
    #[allow(clippy::type_complexity)]
    fn pop_due(
        &self,
    ) -> Vec<(String, Vec<String>, Arc<AtomicBool>, BTreeSet<IpAddr>)> {
        let mut inner = self.inner.lock().expect("lookup inner poisoned");
        let now = Instant::now();
        let mut due = Vec::new();
        while let Some(Reverse((when, _))) = inner.heap.peek() {
            if *when > now {
                break;
            }
            let Some(Reverse((when, object_name))) = inner.heap.pop() else {
                break;
            };
            let Some(slot) = inner.jobs.get_mut(&object_name) else {
                continue; // deleted while queued
            };
            if slot.scheduled_at != when {
                continue; // superseded schedule
            }
            slot.scheduled_at = now + slot.interval;
            let next = slot.scheduled_at;
            if slot.running.load(Ordering::SeqCst) {
                self.stats.skipped.fetch_add(1, Ordering::SeqCst);
                metrics::LOOKUPS_SKIPPED_TOTAL.inc();
            } else {
                slot.running.store(true, Ordering::SeqCst);
                due.push((
                    object_name.clone(),
                    slot.hostnames.clone(),
                    slot.running.clone(),
                    slot.all_ips.clone(),
                ));
            }
            inner.heap.push(Reverse((next, object_name)));
        }
        due
    }

    /// Resolve one job and enqueue its entry when the IP set changed.
    async fn run_job(
        &self,
        object_name: &str,
        hostnames: Vec<String>,
        baseline: BTreeSet<IpAddr>,
    ) {
        self.stats.lookups.fetch_add(1, Ordering::SeqCst);
        metrics::LOOKUPS_TOTAL.inc();

        let results = lookup_all_hostnames_ips(&self.resolver, &hostnames).await;
        if !results.errors.is_empty() {
            self.stats.errors.fetch_add(1, Ordering::SeqCst);
            for err in &results.errors {
                warn!(entry = object_name, error = %err, "Hostname resolution failed");
            }
        }

        let failed_run = results.all_ips.is_empty() && !results.errors.is_empty();
        let changed = {
            let mut inner = self.inner.lock().expect("lookup inner poisoned");
            for (host, addrs) in &results.per_host {
                inner.host_addrs.insert(host.clone(), addrs.clone());
            }
            match inner.jobs.get_mut(object_name) {
                // a run producing only errors keeps the previous baseline
                Some(_) if failed_run => false,
                Some(slot) => {
                    let changed = slot.all_ips != results.all_ips;
                    slot.all_ips = results.all_ips.clone();
                    changed
                }
                None => false, // deleted mid-run
            }
        };
        if changed {
            self.stats.changed.fetch_add(1, Ordering::SeqCst);
            metrics::LOOKUP_CHANGES_TOTAL.inc();
            debug!(
                entry = object_name,
                ips = results.all_ips.len(),
                was = baseline.len(),
                "Resolved IP set changed"
            );
            self.enqueue.trigger_entry(object_name);
        }
    }
}

impl AddressSource for LookupProcessor {
    fn resolved_addresses(&self, host: &str) -> Option<Vec<IpAddr>> {
        self.inner
            .lock()
            .expect("lookup inner poisoned")
            .host_addrs
            .get(host)
            .cloned()
    }
}

#[cfg(test)]
#[path = "lookup_tests.rs"]
mod lookup_tests;
