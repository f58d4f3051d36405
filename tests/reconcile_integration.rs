// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Integration tests driving the reconciliation core end to end against the
//! in-memory backend: provider registration, entry application, duplicate
//! resolution and record cleanup.

use chrono::{Duration as ChronoDuration, Utc};
use rezone::account::AccountConfig;
use rezone::config::Config;
use rezone::dns_errors::{DnsError, DnsLookupError, LookupErrorKind};
use rezone::dnsset::{DnsSetName, RecordType};
use rezone::inmemory::InMemoryHandler;
use rezone::lookup::LookupHost;
use rezone::provider::DnsHandler;
use rezone::reconcilers::{
    Dispatcher, EntryEvent, HandlerFactory, ProviderConfig, ProviderEvent,
};
use rezone::state::entry::{EntrySpec, EntryState};
use rezone::state::zone::{ZoneId, ZoneInfo};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct SharedHandlerFactory {
    handler: Arc<InMemoryHandler>,
}

impl HandlerFactory for SharedHandlerFactory {
    fn create(&self, _config: &AccountConfig) -> Result<Arc<dyn DnsHandler>, DnsError> {
        Ok(self.handler.clone())
    }
}

#[derive(Default)]
struct StubResolver {
    addrs: Mutex<HashMap<String, Vec<IpAddr>>>,
}

#[async_trait::async_trait]
impl LookupHost for StubResolver {
    async fn lookup_host(&self, host: &str) -> Result<Vec<IpAddr>, DnsLookupError> {
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

fn provider_config(name: &str, group: &str, access_key: &str) -> ProviderConfig {
    ProviderConfig {
        name: name.to_string(),
        update_group: group.to_string(),
        account: AccountConfig {
            provider_type: "inmemory".to_string(),
            properties: BTreeMap::from([("accessKey".to_string(), access_key.to_string())]),
            provider_config: String::new(),
        },
        included_domains: vec!["example.test".to_string()],
        excluded_domains: Vec::new(),
        included_zones: Vec::new(),
        excluded_zones: Vec::new(),
        default_ttl: None,
        rate_limit: None,
    }
}

fn entry(object_name: &str, group: &str, dns_name: &str, targets: &[&str]) -> EntrySpec {
    EntrySpec {
        object_name: object_name.to_string(),
        dns_name: dns_name.to_string(),
        set_identifier: String::new(),
        routing_policy: None,
        targets: targets.iter().map(|s| (*s).to_string()).collect(),
        ttl: Some(120),
        update_group: group.to_string(),
        owner_id: None,
        ignored: false,
        deleting: false,
        created_at: Utc::now(),
        generation: 1,
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn rig() -> (Arc<Dispatcher>, Arc<InMemoryHandler>, ZoneId) {
    let handler = Arc::new(InMemoryHandler::new("inmemory"));
    let zone_id = ZoneId::new("inmemory", "z1");
    handler.add_zone(ZoneInfo::new(zone_id.clone(), "example.test"));

    let cfg = Arc::new(Config {
        ident: "prod-dns".to_string(),
        dns_delay: 0,
        ..Config::default()
    });
    let dispatcher = Dispatcher::new(
        cfg,
        Arc::new(SharedHandlerFactory {
            handler: handler.clone(),
        }),
        Arc::new(StubResolver::default()),
    )
    .unwrap();
    dispatcher.start();
    (dispatcher, handler, zone_id)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn entries_from_two_namespaces_keep_separate_providers() {
    let (dispatcher, handler, zone_id) = rig();
    dispatcher.handle_provider_event(ProviderEvent::Upsert(provider_config(
        "ns1/provider", "ns1", "KEY1",
    )));
    dispatcher.handle_provider_event(ProviderEvent::Upsert(provider_config(
        "ns2/provider", "ns2", "KEY2",
    )));
    let state = dispatcher.state.clone();
    wait_for("providers", || {
        state.provider("ns1/provider").is_some() && state.provider("ns2/provider").is_some()
    })
    .await;

    dispatcher.handle_entry_event(EntryEvent::Upsert(entry(
        "ns1/svc1",
        "ns1",
        "project1-service.example.test",
        &["192.0.2.1"],
    )));
    dispatcher.handle_entry_event(EntryEvent::Upsert(entry(
        "ns2/svc2",
        "ns2",
        "project2-service.example.test",
        &["192.0.2.2"],
    )));

    wait_for("both entries ready", || {
        [("ns1/svc1", ()), ("ns2/svc2", ())].iter().all(|(name, ())| {
            state
                .entry(name)
                .is_some_and(|e| e.state() == EntryState::Ready)
        })
    })
    .await;

    // each entry was routed to the provider of its own namespace
    let hash1 = state
        .entry("ns1/svc1")
        .unwrap()
        .with_data(|d| d.account_hash.clone())
        .unwrap();
    let hash2 = state
        .entry("ns2/svc2")
        .unwrap()
        .with_data(|d| d.account_hash.clone())
        .unwrap();
    assert_ne!(hash1, hash2);

    let sets = handler.zone_sets(&zone_id);
    assert_eq!(sets.len(), 2);
    dispatcher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_name_resolves_to_earliest_and_recovers() {
    let (dispatcher, handler, zone_id) = rig();
    dispatcher.handle_provider_event(ProviderEvent::Upsert(provider_config(
        "ns1/provider", "ns1", "KEY1",
    )));
    let state = dispatcher.state.clone();
    wait_for("provider", || state.provider("ns1/provider").is_some()).await;

    let mut older = entry("ns1/older", "ns1", "shared.example.test", &["192.0.2.1"]);
    older.created_at = Utc::now() - ChronoDuration::seconds(600);
    dispatcher.handle_entry_event(EntryEvent::Upsert(older));
    wait_for("older entry ready", || {
        state
            .entry("ns1/older")
            .is_some_and(|e| e.state() == EntryState::Ready)
    })
    .await;

    dispatcher.handle_entry_event(EntryEvent::Upsert(entry(
        "ns1/younger",
        "ns1",
        "shared.example.test",
        &["192.0.2.9"],
    )));
    wait_for("younger marked duplicate", || {
        state
            .entry("ns1/younger")
            .is_some_and(|e| e.state() == EntryState::Error)
    })
    .await;

    // the upstream still carries the older entry's record
    let sets = handler.zone_sets(&zone_id);
    let set = sets.get(&DnsSetName::new("shared.example.test")).unwrap();
    assert!(set.get(RecordType::A).unwrap().records.contains("192.0.2.1"));

    // deleting the older entry reactivates the duplicate
    dispatcher.handle_entry_event(EntryEvent::Delete("ns1/older".to_string()));
    wait_for("younger takes over", || {
        handler
            .zone_sets(&zone_id)
            .get(&DnsSetName::new("shared.example.test"))
            .and_then(|s| s.get(RecordType::A).cloned())
            .is_some_and(|a| a.records.contains("192.0.2.9"))
    })
    .await;
    assert_eq!(
        state.entry("ns1/younger").unwrap().state(),
        EntryState::Ready
    );
    dispatcher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn foreign_records_are_left_alone() {
    let (dispatcher, handler, zone_id) = rig();

    // a record set owned by another controller pre-exists in the zone
    let mut foreign = rezone::dnsset::DnsSet::new(DnsSetName::new("foreign.example.test"));
    foreign.add_record(RecordType::A, 120, "198.51.100.1");
    foreign.set_owner("other-controller", "comment-");
    handler.set_zone_sets(
        &zone_id,
        [(foreign.name.clone(), foreign)].into_iter().collect(),
    );

    dispatcher.handle_provider_event(ProviderEvent::Upsert(provider_config(
        "ns1/provider", "ns1", "KEY1",
    )));
    let state = dispatcher.state.clone();
    wait_for("provider", || state.provider("ns1/provider").is_some()).await;

    dispatcher.handle_entry_event(EntryEvent::Upsert(entry(
        "ns1/thief",
        "ns1",
        "foreign.example.test",
        &["192.0.2.1"],
    )));
    wait_for("entry rejected", || {
        state.entry("ns1/thief").is_some_and(|e| {
            e.state() == EntryState::Error
                && e.status()
                    .message
                    .is_some_and(|m| m.contains("already busy for owner"))
        })
    })
    .await;

    // the foreign record was neither replaced nor cleaned up
    let sets = handler.zone_sets(&zone_id);
    let set = sets.get(&DnsSetName::new("foreign.example.test")).unwrap();
    assert!(set.get(RecordType::A).unwrap().records.contains("198.51.100.1"));
    dispatcher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn target_change_flows_to_upstream() {
    let (dispatcher, handler, zone_id) = rig();
    dispatcher.handle_provider_event(ProviderEvent::Upsert(provider_config(
        "ns1/provider", "ns1", "KEY1",
    )));
    let state = dispatcher.state.clone();
    wait_for("provider", || state.provider("ns1/provider").is_some()).await;

    dispatcher.handle_entry_event(EntryEvent::Upsert(entry(
        "ns1/web",
        "ns1",
        "web.example.test",
        &["192.0.2.1"],
    )));
    wait_for("initial record", || {
        handler
            .zone_sets(&zone_id)
            .get(&DnsSetName::new("web.example.test"))
            .is_some()
    })
    .await;

    let mut changed = entry("ns1/web", "ns1", "web.example.test", &["192.0.2.7"]);
    changed.generation = 2;
    dispatcher.handle_entry_event(EntryEvent::Upsert(changed));
    wait_for("record updated", || {
        handler
            .zone_sets(&zone_id)
            .get(&DnsSetName::new("web.example.test"))
            .and_then(|s| s.get(RecordType::A).cloned())
            .is_some_and(|a| a.records.contains("192.0.2.7"))
    })
    .await;

    let status = state.entry("ns1/web").unwrap().status();
    assert_eq!(status.state, EntryState::Ready);
    assert_eq!(status.observed_generation, 2);
    assert_eq!(status.zone.as_deref(), Some("inmemory/z1"));
    dispatcher.shutdown().await;
}
