// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for the lookup processor and hostname resolution

#[cfg(test)]
mod tests {
    use crate::dns_errors::{DnsLookupError, LookupErrorKind};
    use crate::lookup::{
        lookup_all_hostnames_ips, EntryTrigger, LookupHost, LookupProcessor,
    };
    use async_trait::async_trait;
    use std::collections::{BTreeSet, HashMap};
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::watch;

    /// Scriptable resolver with per-host call counters.
    #[derive(Default)]
    struct StubResolver {
        addrs: Mutex<HashMap<String, Vec<IpAddr>>>,
        counts: Mutex<HashMap<String, u64>>,
        /// number of leading failures per host, with their kind
        failures: Mutex<HashMap<String, (u32, LookupErrorKind)>>,
        latency: Duration,
    }

    impl StubResolver {
        fn set(&self, host: &str, addrs: &[&str]) {
            self.addrs.lock().unwrap().insert(
                host.to_string(),
                addrs.iter().map(|a| a.parse().unwrap()).collect(),
            );
        }

        fn count(&self, host: &str) -> u64 {
            self.counts.lock().unwrap().get(host).copied().unwrap_or(0)
        }

        fn fail_times(&self, host: &str, times: u32, kind: LookupErrorKind) {
            self.failures
                .lock()
                .unwrap()
                .insert(host.to_string(), (times, kind));
        }
    }

    #[async_trait]
    impl LookupHost for StubResolver {
        async fn lookup_host(&self, host: &str) -> Result<Vec<IpAddr>, DnsLookupError> {
            *self.counts.lock().unwrap().entry(host.to_string()).or_insert(0) += 1;
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            {
                let mut failures = self.failures.lock().unwrap();
                if let Some((left, kind)) = failures.get_mut(host) {
                    if *left > 0 {
                        *left -= 1;
                        let kind = *kind;
                        return Err(DnsLookupError {
                            host: host.to_string(),
                            message: "scripted failure".to_string(),
                            kind,
                        });
                    }
                }
            }
            match self.addrs.lock().unwrap().get(host) {
                Some(addrs) => Ok(addrs.clone()),
                None => Err(DnsLookupError {
                    host: host.to_string(),
                    message: "no such host".to_string(),
                    kind: LookupErrorKind::NotFound,
                }),
            }
        }
    }

    #[derive(Default)]
    struct CountingTrigger {
        counts: Mutex<HashMap<String, u64>>,
        total: AtomicU64,
    }

    impl CountingTrigger {
        fn count(&self, object_name: &str) -> u64 {
            self.counts
                .lock()
                .unwrap()
                .get(object_name)
                .copied()
                .unwrap_or(0)
        }
    }

    impl EntryTrigger for CountingTrigger {
        fn trigger_entry(&self, object_name: &str) {
            *self
                .counts
                .lock()
                .unwrap()
                .entry(object_name.to_string())
                .or_insert(0) += 1;
            self.total.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ips(addrs: &[&str]) -> BTreeSet<IpAddr> {
        addrs.iter().map(|a| a.parse().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_lookup_all_is_order_independent() {
        let stub = Arc::new(StubResolver::default());
        stub.set("a.example", &["1.1.1.1", "2001:db8::1"]);
        stub.set("b.example", &["1.1.1.2", "1.1.1.1"]); // overlaps with a
        let resolver: Arc<dyn LookupHost> = stub.clone();

        let forward =
            lookup_all_hostnames_ips(&resolver, &["a.example".into(), "b.example".into()]).await;
        let backward =
            lookup_all_hostnames_ips(&resolver, &["b.example".into(), "a.example".into()]).await;

        assert_eq!(forward.all_ips, backward.all_ips);
        assert_eq!(forward.all_ips.len(), 3); // deduplicated
        assert_eq!(forward.ipv4_addrs.len(), 2);
        assert_eq!(forward.ipv6_addrs.len(), 1);
        assert!(forward.errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_temporary_failures_are_retried() {
        let stub = Arc::new(StubResolver::default());
        stub.set("flaky.example", &["1.1.1.1"]);
        stub.fail_times("flaky.example", 2, LookupErrorKind::Temporary);
        let resolver: Arc<dyn LookupHost> = stub.clone();

        let results = lookup_all_hostnames_ips(&resolver, &["flaky.example".into()]).await;
        assert!(results.errors.is_empty());
        assert_eq!(results.all_ips, ips(&["1.1.1.1"]));
        assert_eq!(stub.count("flaky.example"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_give_up_after_budget() {
        let stub = Arc::new(StubResolver::default());
        stub.set("down.example", &["1.1.1.1"]);
        stub.fail_times("down.example", 99, LookupErrorKind::Timeout);
        let resolver: Arc<dyn LookupHost> = stub.clone();

        let results = lookup_all_hostnames_ips(&resolver, &["down.example".into()]).await;
        assert_eq!(results.errors.len(), 1);
        assert!(results.errors[0].is_timeout());
        assert_eq!(stub.count("down.example"), 5);
    }

    #[tokio::test]
    async fn test_not_found_returned_verbatim() {
        let stub = Arc::new(StubResolver::default());
        let resolver: Arc<dyn LookupHost> = stub.clone();

        let results = lookup_all_hostnames_ips(&resolver, &["ghost.example".into()]).await;
        assert_eq!(results.errors.len(), 1);
        assert!(results.errors[0].is_not_found());
        // not-found is not retried
        assert_eq!(stub.count("ghost.example"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_respects_intervals_without_changes() {
        let stub = Arc::new(StubResolver::default());
        stub.set("host1", &["10.0.0.1"]);
        stub.set("host2", &["10.0.0.2"]);
        stub.set("host3a", &["10.0.0.3"]);
        stub.set("host3b", &["10.0.0.4"]);
        stub.set("host3c", &["10.0.0.5"]);
        let trigger = Arc::new(CountingTrigger::default());
        let processor = LookupProcessor::new(
            stub.clone(),
            trigger.clone(),
            2,
            Some(Duration::from_millis(10)),
        );

        // baselines match what the resolver returns: no change expected
        processor.upsert(
            "ns1/e1",
            vec!["host1".into()],
            ips(&["10.0.0.1"]),
            Duration::from_millis(1),
        );
        processor.upsert(
            "ns1/e2",
            vec!["host2".into()],
            ips(&["10.0.0.2"]),
            Duration::from_millis(2),
        );
        processor.upsert(
            "ns1/e3",
            vec!["host3a".into(), "host3b".into(), "host3c".into()],
            ips(&["10.0.0.3", "10.0.0.4", "10.0.0.5"]),
            Duration::from_millis(3),
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(processor.clone().run(stop_rx));
        tokio::time::sleep(Duration::from_millis(36)).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        let host1 = stub.count("host1");
        let host2 = stub.count("host2");
        let host3a = stub.count("host3a");
        let host3c = stub.count("host3c");
        assert!((18..=54).contains(&host1), "host1 resolved {host1} times");
        assert!((9..=27).contains(&host2), "host2 resolved {host2} times");
        assert!((6..=18).contains(&host3a), "host3a resolved {host3a} times");
        // hostnames of one job run together
        assert!(host3c.abs_diff(host3a) <= 1);
        // stable results: nothing enqueued
        assert_eq!(trigger.total.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_ip_set_enqueues_entry_once() {
        let stub = Arc::new(StubResolver::default());
        stub.set("host2", &["10.0.0.2"]);
        let trigger = Arc::new(CountingTrigger::default());
        let processor = LookupProcessor::new(
            stub.clone(),
            trigger.clone(),
            2,
            Some(Duration::from_millis(10)),
        );
        processor.upsert(
            "ns1/e2",
            vec!["host2".into()],
            ips(&["10.0.0.2"]),
            Duration::from_millis(2),
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(processor.clone().run(stop_rx));

        tokio::time::sleep(Duration::from_millis(18)).await;
        assert_eq!(trigger.count("ns1/e2"), 0);
        stub.set("host2", &["1.1.1.42"]);
        tokio::time::sleep(Duration::from_millis(18)).await;

        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        // the change is reported exactly once; later runs see a stable set
        assert_eq!(trigger.count("ns1/e2"), 1);
        assert_eq!(processor.stats.changed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_jobs_are_skipped_not_queued() {
        let stub = Arc::new(StubResolver {
            latency: Duration::from_millis(50),
            ..StubResolver::default()
        });
        stub.set("slow.example", &["10.0.0.9"]);
        let trigger = Arc::new(CountingTrigger::default());
        let processor = LookupProcessor::new(
            stub.clone(),
            trigger.clone(),
            1,
            Some(Duration::from_millis(10)),
        );
        processor.upsert(
            "ns1/slow",
            vec!["slow.example".into()],
            ips(&["10.0.0.9"]),
            Duration::from_millis(1),
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(processor.clone().run(stop_rx));
        tokio::time::sleep(Duration::from_millis(40)).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        // the 50ms resolution spans many 1ms ticks; those ticks are skipped
        assert!(processor.stats.skipped.load(Ordering::SeqCst) > 0);
        assert!(stub.count("slow.example") <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_clears_running_flag() {
        let stub = Arc::new(StubResolver::default());
        stub.set("host1", &["10.0.0.1"]);
        let trigger = Arc::new(CountingTrigger::default());
        let processor = LookupProcessor::new(
            stub,
            trigger,
            2,
            Some(Duration::from_millis(10)),
        );
        processor.upsert(
            "ns1/e1",
            vec!["host1".into()],
            BTreeSet::new(),
            Duration::from_millis(5),
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(processor.clone().run(stop_rx));
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(processor.is_running());

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
        // the flag clears within one check period of the cancellation
        assert!(!processor.is_running());
    }

    #[tokio::test]
    async fn test_delete_removes_job() {
        let stub = Arc::new(StubResolver::default());
        let trigger = Arc::new(CountingTrigger::default());
        let processor = LookupProcessor::new(stub, trigger, 2, None);
        processor.upsert(
            "ns1/e1",
            vec!["host1".into()],
            BTreeSet::new(),
            Duration::from_millis(5),
        );
        assert_eq!(processor.len(), 1);
        processor.delete("ns1/e1");
        assert!(processor.is_empty());
    }
}
