// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for the entry/zone lock registry

#[cfg(test)]
mod tests {
    use crate::state::lock::EntryZoneLock;
    use crate::state::zone::ZoneId;

    fn zone(id: &str) -> ZoneId {
        ZoneId::new("inmemory", id)
    }

    fn pair(object_name: &str, dns_name: &str) -> (String, String) {
        (object_name.to_string(), dns_name.to_string())
    }

    #[test]
    fn test_entry_lock_roundtrip() {
        let lock = EntryZoneLock::new();
        assert!(lock.try_lock_entry_reconciliation("ns1/a", "a.example.test"));
        assert!(lock.is_held("ns1/a"));
        assert!(!lock.try_lock_entry_reconciliation("ns1/a", "a.example.test"));
        lock.unlock_entry_reconciliation("ns1/a");
        assert!(!lock.is_held("ns1/a"));
    }

    #[test]
    fn test_zone_hold_blocks_matching_entry_lock() {
        let lock = EntryZoneLock::new();
        let blocked = lock.try_lock_zone_reconciliation(
            &zone("z1"),
            "example.test",
            &[pair("ns1/a", "a.example.test")],
        );
        assert!(blocked.is_empty());

        // entry under the zone's domain: blocked, trigger recorded
        assert!(!lock.try_lock_entry_reconciliation("ns1/a", "a.example.test"));

        let triggers = lock.unlock_zone_reconciliation(&zone("z1"));
        assert_eq!(triggers, vec!["ns1/a".to_string()]);
    }

    #[test]
    fn test_zone_reports_dispatcher_held_entries() {
        let lock = EntryZoneLock::new();
        assert!(lock.try_lock_entry_reconciliation("ns1/a", "a.example.test"));

        let blocked = lock.try_lock_zone_reconciliation(
            &zone("z1"),
            "example.test",
            &[pair("ns1/a", "a.example.test"), pair("ns1/b", "b.example.test")],
        );
        assert_eq!(blocked, vec!["ns1/a".to_string()]);

        // the unblocked entry was locked for the zone
        assert!(lock.is_held("ns1/b"));
        let _ = lock.unlock_zone_reconciliation(&zone("z1"));
        lock.unlock_entry_reconciliation("ns1/a");
    }

    #[test]
    fn test_zone_reports_foreign_held_entry_in_domain() {
        let lock = EntryZoneLock::new();
        // individually held entry not in the zone's entry list but under its domain
        assert!(lock.try_lock_entry_reconciliation("ns2/c", "c.example.test"));

        let blocked = lock.try_lock_zone_reconciliation(
            &zone("z1"),
            "example.test",
            &[pair("ns1/a", "a.example.test")],
        );
        assert_eq!(blocked, vec!["ns2/c".to_string()]);
    }

    #[test]
    fn test_outstanding_window_blocks_zone_relock() {
        let lock = EntryZoneLock::new();
        let blocked = lock.try_lock_zone_reconciliation(
            &zone("z1"),
            "example.test",
            &[pair("ns1/a", "a.example.test")],
        );
        assert!(blocked.is_empty());
        let _ = lock.unlock_zone_reconciliation(&zone("z1"));

        // within the outstanding window the entry counts as busy
        let blocked = lock.try_lock_zone_reconciliation(
            &zone("z2"),
            "example.test",
            &[pair("ns1/a", "a.example.test")],
        );
        assert_eq!(blocked, vec!["ns1/a".to_string()]);
    }

    #[test]
    fn test_shared_domain_zones_unlock_on_last_release() {
        let lock = EntryZoneLock::new();
        // a private and a public zone sharing a domain hold the same entry
        let blocked = lock.try_lock_zone_reconciliation(
            &zone("public"),
            "example.test",
            &[pair("ns1/a", "a.example.test")],
        );
        assert!(blocked.is_empty());
        let blocked = lock.try_lock_zone_reconciliation(
            &zone("private"),
            "example.test",
            &[pair("ns1/a", "a.example.test")],
        );
        assert!(blocked.is_empty());

        assert!(!lock.try_lock_entry_reconciliation("ns1/a", "a.example.test"));
        let triggers = lock.unlock_zone_reconciliation(&zone("public"));
        // still held by the private zone: no trigger release yet
        assert!(triggers.is_empty());
        assert!(lock.is_held("ns1/a"));

        let triggers = lock.unlock_zone_reconciliation(&zone("private"));
        assert_eq!(triggers, vec!["ns1/a".to_string()]);
    }

    #[test]
    fn test_entry_lock_outside_zone_domain_is_free() {
        let lock = EntryZoneLock::new();
        let blocked = lock.try_lock_zone_reconciliation(
            &zone("z1"),
            "example.test",
            &[pair("ns1/a", "a.example.test")],
        );
        assert!(blocked.is_empty());

        // unrelated name: not covered by the zone hold
        assert!(lock.try_lock_entry_reconciliation("ns9/other", "other.test"));
        lock.unlock_entry_reconciliation("ns9/other");
        let _ = lock.unlock_zone_reconciliation(&zone("z1"));
    }

    #[cfg(debug_assertions)]
    #[test]
    fn test_lock_order_tracker() {
        use crate::state::lock::order::{enter, Level};

        {
            let _state = enter(Level::State);
            let _entry = enter(Level::Entry);
            let _zone = enter(Level::Zone);
        }
        // guards dropped: starting over at zone level alone is fine
        let _zone = enter(Level::Zone);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "lock order violation")]
    fn test_lock_order_violation_panics() {
        use crate::state::lock::order::{enter, Level};

        let _zone = enter(Level::Zone);
        let _state = enter(Level::State);
    }
}
