// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for reconciliation error types

#[cfg(test)]
mod tests {
    use crate::dns_errors::{DnsError, DnsLookupError, LookupErrorKind};
    use std::time::Duration;

    #[test]
    fn test_transient_errors_are_retryable() {
        let err = DnsError::Transient {
            reason: "HTTP 503 from route53".to_string(),
        };
        assert!(err.is_transient());

        let err = DnsError::Throttled {
            delay: Duration::from_secs(30),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn test_conflict_errors_are_permanent() {
        let err = DnsError::AlreadyBusyForEntry {
            object_name: "ns1/entry-a".to_string(),
        };
        assert!(!err.is_transient());

        let err = DnsError::AlreadyBusyForOwner {
            owner: "other-controller".to_string(),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn test_validation_errors_are_permanent() {
        let err = DnsError::Validation {
            object_name: "default/broken".to_string(),
            reason: "no targets".to_string(),
        };
        assert!(!err.is_transient());
        assert_eq!(err.status_reason(), "InvalidEntry");
    }

    #[test]
    fn test_lock_contention_is_not_transient_upstream() {
        // Lock contention reschedules with its own randomized back-off and
        // must not feed the zone failure back-off.
        let err = DnsError::LockContention {
            what: "aws/Z123".to_string(),
        };
        assert!(!err.is_transient());
        assert_eq!(err.status_reason(), "LockContention");
    }

    #[test]
    fn test_lookup_error_flags() {
        let err = DnsLookupError {
            host: "a.example".to_string(),
            message: "no such host".to_string(),
            kind: LookupErrorKind::NotFound,
        };
        assert!(err.is_not_found());
        assert!(!err.is_temporary());
        assert!(!err.is_retryable());

        let err = DnsLookupError {
            host: "b.example".to_string(),
            message: "i/o timeout".to_string(),
            kind: LookupErrorKind::Timeout,
        };
        assert!(err.is_timeout());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_lookup_error_wraps_into_dns_error() {
        let err: DnsError = DnsLookupError {
            host: "c.example".to_string(),
            message: "temporary failure".to_string(),
            kind: LookupErrorKind::Temporary,
        }
        .into();
        assert!(err.is_transient());
        assert_eq!(err.status_reason(), "LookupFailed");
    }

    #[test]
    fn test_status_reasons_are_stable() {
        let cases: Vec<(DnsError, &str)> = vec![
            (
                DnsError::Config {
                    reason: "bad secret".into(),
                },
                "InvalidConfiguration",
            ),
            (
                DnsError::NoSuchHostedZone {
                    zone: "aws/Z1".into(),
                },
                "NoSuchHostedZone",
            ),
            (
                DnsError::NoMatchingProvider {
                    dns_name: "x.example.test".into(),
                },
                "NoMatchingProvider",
            ),
            (DnsError::Generic("boom".into()), "ReconciliationFailed"),
        ];
        for (err, reason) in cases {
            assert_eq!(err.status_reason(), reason);
        }
    }

    #[test]
    fn test_anyhow_conversion() {
        let err: DnsError = anyhow::anyhow!("upstream exploded").into();
        assert!(matches!(err, DnsError::Generic(_)));
        assert!(err.is_transient());
    }
}
