// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for the state layer: entry index, duplicates, registries

#[cfg(test)]
mod tests {
    use crate::account::{DnsAccount, OwnerChangeset};
    use crate::config::Config;
    use crate::inmemory::InMemoryHandler;
    use crate::state::entry::{EntrySpec, EntryState};
    use crate::state::provider_state::ProviderState;
    use crate::state::zone::{ZoneId, ZoneInfo};
    use crate::state::{State, Trigger};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::Arc;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn new_state() -> (State, UnboundedReceiver<Trigger>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (State::new(Arc::new(Config::default()), tx), rx)
    }

    fn provider(name: &str, group: &str, hash: &str, domains: &[&str]) -> Arc<ProviderState> {
        let account = Arc::new(DnsAccount::new(
            hash,
            "inmemory",
            Arc::new(InMemoryHandler::new("inmemory")),
        ));
        Arc::new(ProviderState::new(
            name,
            group,
            account,
            domains.iter().map(|s| (*s).to_string()).collect(),
        ))
    }

    fn spec(object_name: &str, dns_name: &str, age_secs: i64) -> EntrySpec {
        EntrySpec {
            object_name: object_name.to_string(),
            dns_name: dns_name.to_string(),
            set_identifier: String::new(),
            routing_policy: None,
            targets: vec!["192.0.2.1".to_string()],
            ttl: Some(120),
            update_group: object_name.split('/').next().unwrap_or("default").to_string(),
            owner_id: None,
            ignored: false,
            deleting: false,
            created_at: Utc::now() - ChronoDuration::seconds(age_secs),
            generation: 1,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<Trigger>) -> Vec<Trigger> {
        let mut out = Vec::new();
        while let Ok(t) = rx.try_recv() {
            out.push(t);
        }
        out
    }

    fn setup_zone(state: &State) -> ZoneId {
        let zone_id = ZoneId::new("inmemory", "z1");
        state.set_zones(vec![ZoneInfo::new(zone_id.clone(), "example.test")]);
        state.update_provider(provider("ns1/p1", "ns1", "aaaa", &["example.test"]));
        zone_id
    }

    #[test]
    fn test_update_entry_resolves_provider_and_zone() {
        let (state, mut rx) = new_state();
        let zone_id = setup_zone(&state);
        drain(&mut rx);

        state.update_entry(spec("ns1/a", "a.example.test", 100)).unwrap();
        let handle = state.entry("ns1/a").unwrap();
        assert_eq!(handle.state(), EntryState::Pending);
        assert_eq!(handle.zone_id(), Some(zone_id.clone()));
        assert!(handle.with_data(|d| d.valid));

        let triggers = drain(&mut rx);
        assert!(triggers.contains(&Trigger::Zone(zone_id)));
    }

    #[test]
    fn test_no_matching_provider_sets_error_and_reschedules() {
        let (state, mut rx) = new_state();
        state.update_entry(spec("ns1/a", "a.example.test", 100)).unwrap();

        let handle = state.entry("ns1/a").unwrap();
        assert_eq!(handle.state(), EntryState::Error);
        assert!(handle
            .status()
            .message
            .unwrap()
            .contains("no matching provider"));

        let triggers = drain(&mut rx);
        assert!(triggers
            .iter()
            .any(|t| matches!(t, Trigger::EntryDelayed(name, _) if name == "ns1/a")));
    }

    #[test]
    fn test_ignore_annotation_short_circuit() {
        let (state, _rx) = new_state();
        let mut s = spec("ns1/a", "a.example.test", 100);
        s.ignored = true;
        state.update_entry(s).unwrap();
        assert_eq!(state.entry("ns1/a").unwrap().state(), EntryState::Ignored);
    }

    #[test]
    fn test_invalid_spec_moves_to_invalid() {
        let (state, _rx) = new_state();
        setup_zone(&state);
        let mut s = spec("ns1/a", "a.example.test", 100);
        s.targets.clear();
        state.update_entry(s).unwrap();
        assert_eq!(state.entry("ns1/a").unwrap().state(), EntryState::Invalid);
    }

    #[test]
    fn test_duplicate_earlier_wins() {
        let (state, mut rx) = new_state();
        setup_zone(&state);
        drain(&mut rx);

        state.update_entry(spec("ns1/old", "dup.example.test", 500)).unwrap();
        state.update_entry(spec("ns1/new", "dup.example.test", 10)).unwrap();

        let old = state.entry("ns1/old").unwrap();
        let new = state.entry("ns1/new").unwrap();
        assert!(!old.with_data(|d| d.duplicate));
        assert!(new.with_data(|d| d.duplicate));
        assert_eq!(new.state(), EntryState::Error);
        assert!(new.status().message.unwrap().contains("already busy"));
    }

    #[test]
    fn test_duplicate_displaces_younger_claimant() {
        let (state, mut rx) = new_state();
        setup_zone(&state);

        state.update_entry(spec("ns1/young", "dup.example.test", 10)).unwrap();
        drain(&mut rx);
        state.update_entry(spec("ns1/older", "dup.example.test", 500)).unwrap();

        let young = state.entry("ns1/young").unwrap();
        let older = state.entry("ns1/older").unwrap();
        assert!(young.with_data(|d| d.duplicate));
        assert!(!older.with_data(|d| d.duplicate));

        // the displaced entry is re-enqueued to pick up its duplicate status
        let triggers = drain(&mut rx);
        assert!(triggers.contains(&Trigger::Entry("ns1/young".to_string())));
    }

    #[test]
    fn test_duplicate_reactivation_on_delete() {
        let (state, mut rx) = new_state();
        let zone_id = setup_zone(&state);

        state.update_entry(spec("ns1/first", "dup.example.test", 500)).unwrap();
        state.update_entry(spec("ns1/second", "dup.example.test", 100)).unwrap();
        state.update_entry(spec("ns1/third", "dup.example.test", 10)).unwrap();
        drain(&mut rx);

        state.entry_deleted("ns1/first");

        // the earliest waiting duplicate takes over
        let second = state.entry("ns1/second").unwrap();
        let third = state.entry("ns1/third").unwrap();
        assert!(!second.with_data(|d| d.duplicate));
        assert_eq!(second.state(), EntryState::Pending);
        assert!(third.with_data(|d| d.duplicate));

        let triggers = drain(&mut rx);
        assert!(triggers.contains(&Trigger::Entry("ns1/second".to_string())));
        assert!(triggers.contains(&Trigger::Zone(zone_id)));
    }

    #[test]
    fn test_name_change_triggers_old_zone() {
        let (state, mut rx) = new_state();
        let zone_id = setup_zone(&state);
        state.update_entry(spec("ns1/a", "a.example.test", 100)).unwrap();
        drain(&mut rx);

        state.update_entry(spec("ns1/a", "b.example.test", 100)).unwrap();
        let triggers = drain(&mut rx);
        // old zone cleanup plus new-state apply collapse onto the same zone here
        assert!(triggers.contains(&Trigger::Zone(zone_id)));

        // the old name is free again
        state.update_entry(spec("ns1/other", "a.example.test", 50)).unwrap();
        assert!(!state.entry("ns1/other").unwrap().with_data(|d| d.duplicate));
    }

    #[test]
    fn test_active_zone_change_triggers_old_zone() {
        let (state, mut rx) = new_state();
        setup_zone(&state);
        let other_zone = ZoneId::new("inmemory", "z2");
        state.set_zones(vec![
            ZoneInfo::new(ZoneId::new("inmemory", "z1"), "example.test"),
            ZoneInfo::new(other_zone.clone(), "old.zone.test"),
        ]);

        state.update_entry(spec("ns1/a", "a.example.test", 100)).unwrap();
        state
            .entry("ns1/a")
            .unwrap()
            .with_data(|d| d.active_zone = Some(other_zone.clone()));
        drain(&mut rx);

        // any update that re-resolves away from the recorded active zone
        // must trigger the old zone while it still exists
        state.update_entry(spec("ns1/a", "a.example.test", 100)).unwrap();
        let triggers = drain(&mut rx);
        assert!(triggers.contains(&Trigger::Zone(other_zone)));
    }

    #[test]
    fn test_blocked_zone_is_invisible() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut cfg = Config::default();
        cfg.blocked_zones.insert("inmemory/hidden".to_string());
        let state = State::new(Arc::new(cfg), tx);

        state.set_zones(vec![
            ZoneInfo::new(ZoneId::new("inmemory", "hidden"), "example.test"),
            ZoneInfo::new(ZoneId::new("inmemory", "visible"), "other.test"),
        ]);
        assert_eq!(state.zone_ids(), vec![ZoneId::new("inmemory", "visible")]);
    }

    #[test]
    fn test_blocking_entries() {
        let (state, _rx) = new_state();
        let zone_id = ZoneId::new("inmemory", "z1");
        assert!(!state.has_blocking_entries(&zone_id));
        state.add_blocking_entry(&zone_id, "ns1/a");
        assert!(state.has_blocking_entries(&zone_id));
        state.remove_blocking_entry(&zone_id, "ns1/a");
        assert!(!state.has_blocking_entries(&zone_id));
    }

    #[test]
    fn test_zone_reconcile_data_partitions_entries() {
        let (state, _rx) = new_state();
        let zone_id = setup_zone(&state);

        state.update_entry(spec("ns1/apply", "apply.example.test", 100)).unwrap();
        let mut del = spec("ns1/delete", "delete.example.test", 100);
        del.deleting = true;
        state.update_entry(del).unwrap();

        let data = state.zone_reconcile_data(&zone_id).unwrap();
        let names = |entries: &[Arc<crate::state::entry::EntryHandle>]| {
            entries.iter().map(|e| e.object_name.clone()).collect::<Vec<_>>()
        };
        assert_eq!(names(&data.entries), vec!["ns1/apply".to_string()]);
        assert_eq!(names(&data.deleting), vec!["ns1/delete".to_string()]);
        assert_eq!(data.providers.len(), 1);
    }

    #[test]
    fn test_zone_reconcile_data_unknown_zone() {
        let (state, _rx) = new_state();
        assert!(state
            .zone_reconcile_data(&ZoneId::new("inmemory", "nope"))
            .is_none());
    }

    #[test]
    fn test_trigger_entries_by_owner() {
        let (state, mut rx) = new_state();
        setup_zone(&state);
        let mut s = spec("ns1/owned", "owned.example.test", 100);
        s.owner_id = Some("Tenant-A".to_string());
        state.update_entry(s).unwrap();
        state.update_entry(spec("ns1/plain", "plain.example.test", 100)).unwrap();
        drain(&mut rx);

        let mut changeset = OwnerChangeset::default();
        changeset.activated.insert("tenant-a".to_string());
        state.trigger_entries_by_owner(&changeset);

        let triggers = drain(&mut rx);
        assert_eq!(triggers, vec![Trigger::Entry("ns1/owned".to_string())]);
    }

    #[test]
    fn test_spin_lock_contention_reschedules() {
        let (state, mut rx) = new_state();
        setup_zone(&state);
        state.update_entry(spec("ns1/a", "a.example.test", 100)).unwrap();
        drain(&mut rx);

        let handle = state.entry("ns1/a").unwrap();
        assert!(handle.lock.try_lock());
        let err = state.update_entry(spec("ns1/a", "a.example.test", 100)).unwrap_err();
        assert!(matches!(err, crate::dns_errors::DnsError::LockContention { .. }));
        handle.lock.unlock();

        let triggers = drain(&mut rx);
        assert!(triggers.iter().any(|t| matches!(
            t,
            Trigger::EntryDelayed(name, delay)
                if name == "ns1/a"
                    && *delay >= std::time::Duration::from_secs(3)
                    && *delay <= std::time::Duration::from_secs(6)
        )));
    }
}
