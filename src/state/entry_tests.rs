// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for entry validation and the entry spin lock

#[cfg(test)]
mod tests {
    use crate::dns_errors::DnsError;
    use crate::dnsset::RecordType;
    use crate::state::entry::{
        validate_spec, EntryHandle, EntrySpec, EntrySpinLock, EntryState,
    };
    use chrono::Utc;
    use std::time::Duration;

    fn spec(dns_name: &str, targets: &[&str]) -> EntrySpec {
        EntrySpec {
            object_name: "ns1/test-entry".to_string(),
            dns_name: dns_name.to_string(),
            set_identifier: String::new(),
            routing_policy: None,
            targets: targets.iter().map(|s| (*s).to_string()).collect(),
            ttl: None,
            update_group: "ns1".to_string(),
            owner_id: None,
            ignored: false,
            deleting: false,
            created_at: Utc::now(),
            generation: 1,
        }
    }

    #[test]
    fn test_validate_normalizes_name() {
        let (name, targets) = validate_spec(&spec("Foo.Example.Test.", &["192.0.2.1"])).unwrap();
        assert_eq!(name.dns_name, "foo.example.test");
        assert_eq!(targets[0].rtype, RecordType::A);
    }

    #[test]
    fn test_validate_rejects_empty_name() {
        let err = validate_spec(&spec("", &["192.0.2.1"])).unwrap_err();
        assert!(matches!(err, DnsError::Validation { .. }));
    }

    #[test]
    fn test_validate_rejects_missing_targets() {
        let err = validate_spec(&spec("foo.example.test", &[])).unwrap_err();
        assert!(matches!(err, DnsError::Validation { .. }));
    }

    #[test]
    fn test_validate_allows_missing_targets_when_deleting() {
        let mut s = spec("foo.example.test", &[]);
        s.deleting = true;
        assert!(validate_spec(&s).is_ok());
    }

    #[test]
    fn test_validate_deduplicates_targets() {
        let (_, targets) =
            validate_spec(&spec("foo.example.test", &["192.0.2.1", "192.0.2.1"])).unwrap();
        assert_eq!(targets.len(), 1);
    }

    #[test]
    fn test_validate_rejects_cname_mix() {
        let err =
            validate_spec(&spec("foo.example.test", &["alias.example", "192.0.2.1"])).unwrap_err();
        assert!(matches!(err, DnsError::Validation { .. }));
    }

    #[test]
    fn test_validate_routing_policy_needs_set_identifier() {
        use crate::dnsset::RoutingPolicy;
        use std::collections::BTreeMap;

        let mut s = spec("foo.example.test", &["192.0.2.1"]);
        s.routing_policy = Some(RoutingPolicy {
            policy: "weighted".to_string(),
            parameters: BTreeMap::new(),
        });
        let err = validate_spec(&s).unwrap_err();
        assert!(matches!(err, DnsError::Validation { .. }));

        // pairing them up is fine
        s.set_identifier = "blue".to_string();
        let (name, _) = validate_spec(&s).unwrap();
        assert_eq!(name.set_identifier, "blue");
    }

    #[test]
    fn test_validate_set_identifier_needs_routing_policy() {
        let mut s = spec("foo.example.test", &["192.0.2.1"]);
        s.set_identifier = "blue".to_string();
        let err = validate_spec(&s).unwrap_err();
        assert!(matches!(err, DnsError::Validation { .. }));
    }

    #[test]
    fn test_validate_allows_multiple_cnames() {
        let (_, targets) =
            validate_spec(&spec("foo.example.test", &["a.example", "b.example"])).unwrap();
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().all(|t| t.rtype == RecordType::CNAME));
    }

    #[test]
    fn test_spin_lock_budget() {
        let lock = EntrySpinLock::default();
        assert!(lock.try_lock());
        assert!(lock.is_locked());

        // contended acquisition gives up within the budget
        let started = std::time::Instant::now();
        assert!(!lock.try_lock_spinning(Some(Duration::from_millis(5))));
        assert!(started.elapsed() >= Duration::from_millis(5));
        assert!(started.elapsed() < Duration::from_millis(250));

        lock.unlock();
        assert!(lock.try_lock_spinning(None));
        lock.unlock();
    }

    #[test]
    fn test_entry_handle_starts_pending_and_modified() {
        let handle = EntryHandle::new(spec("foo.example.test", &["192.0.2.1"]));
        assert_eq!(handle.state(), EntryState::Pending);
        assert!(handle.with_data(|d| d.modified));
        assert!(!handle.with_data(|d| d.valid));
    }

    #[test]
    fn test_status_snapshot() {
        let handle = EntryHandle::new(spec("foo.example.test", &["192.0.2.1"]));
        handle.set_state(EntryState::Error, Some("no matching provider".into()));
        let status = handle.status();
        assert_eq!(status.state, EntryState::Error);
        assert_eq!(status.message.as_deref(), Some("no matching provider"));
        assert_eq!(status.observed_generation, 1);
    }
}
