// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Error types for the reconciliation core.
//!
//! This module provides specialized error types for:
//! - Provider configuration and selection failures
//! - Transient upstream failures (throttling, 5xx, DNS timeouts)
//! - Conflicts between entries or with foreign-owned records
//! - Target validation failures
//! - Lock contention during entry and zone reconciliation
//!
//! These errors provide structured error handling for reconciliation,
//! enabling better error reporting in entry status and metrics.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while resolving hostnames for CNAME-typed entries.
///
/// The classification flags mirror the underlying resolver error so callers
/// can decide between retrying, failing the entry, and surfacing the error
/// verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("lookup of '{host}' failed: {message}")]
pub struct DnsLookupError {
    /// The hostname that failed to resolve
    pub host: String,
    /// Human-readable description of the failure
    pub message: String,
    /// Classification of the failure
    pub kind: LookupErrorKind,
}

/// Classification of a hostname resolution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupErrorKind {
    /// The name does not exist (NXDOMAIN / no records); returned verbatim
    NotFound,
    /// A temporary failure reported by the resolver; retried
    Temporary,
    /// The resolution timed out; retried
    Timeout,
    /// Any other failure
    Other,
}

impl DnsLookupError {
    /// True if the name does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind == LookupErrorKind::NotFound
    }

    /// True if the resolver reported a temporary failure.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.kind == LookupErrorKind::Temporary
    }

    /// True if the resolution timed out.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.kind == LookupErrorKind::Timeout
    }

    /// True if a retry with the same inputs may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.is_temporary() || self.is_timeout()
    }
}

/// Composite error type for all reconciliation failures.
///
/// This is the primary error type returned by the state layer, the change
/// model and the zone scheduler. The variants follow the error taxonomy of
/// the controller: configuration, transient upstream, conflict, validation
/// and lock contention each propagate differently.
#[derive(Error, Debug, Clone)]
pub enum DnsError {
    /// Bad provider, secret or selection configuration.
    ///
    /// Surfaced to provider status and only rechecked after the recheck
    /// window, never retried eagerly.
    #[error("invalid configuration: {reason}")]
    Config {
        /// Explanation of what is invalid
        reason: String,
    },

    /// Transient upstream failure (rate limit, 5xx, DNS timeout).
    ///
    /// Retried with per-zone exponential back-off.
    #[error("transient upstream failure: {reason}")]
    Transient {
        /// Description of the upstream failure
        reason: String,
    },

    /// The upstream throttled the request; retry after the given delay.
    #[error("throttled, retry in {delay:?}")]
    Throttled {
        /// Remaining delay reported by the rate limiter
        delay: Duration,
    },

    /// Another entry already claims the DNS name.
    ///
    /// Reported on the later entry's status; not retried until inputs change.
    #[error("DNS name already busy for entry '{object_name}'")]
    AlreadyBusyForEntry {
        /// Object name of the earlier entry holding the DNS name
        object_name: String,
    },

    /// The observed record set is owned by a foreign controller instance.
    #[error("DNS name already busy for owner '{owner}'")]
    AlreadyBusyForOwner {
        /// Owner identity found on the observed record set
        owner: String,
    },

    /// No valid provider matches the entry's DNS name.
    #[error("no matching provider for '{dns_name}'")]
    NoMatchingProvider {
        /// The DNS name that matched no provider
        dns_name: String,
    },

    /// The hosted zone does not exist upstream.
    ///
    /// Swallowed during provider deletion; the provider is re-enqueued to
    /// refresh its status.
    #[error("no such hosted zone '{zone}'")]
    NoSuchHostedZone {
        /// The zone id that was not found
        zone: String,
    },

    /// Invalid target or unresolvable CNAME.
    ///
    /// The entry moves to `invalid` and is not retried until its spec
    /// changes.
    #[error("invalid entry '{object_name}': {reason}")]
    Validation {
        /// Object name of the invalid entry
        object_name: String,
        /// Explanation of what is invalid
        reason: String,
    },

    /// A spin lock or zone busy flag could not be acquired.
    ///
    /// Rescheduled with randomized back-off.
    #[error("lock contention on {what}")]
    LockContention {
        /// What could not be locked (entry object name or zone id)
        what: String,
    },

    /// Hostname resolution failure from the lookup processor.
    #[error(transparent)]
    Lookup(#[from] DnsLookupError),

    /// Generic error for operations that don't fit other categories
    #[error("reconciliation failed: {0}")]
    Generic(String),
}

impl DnsError {
    /// Returns true if this error is transient and the operation should be
    /// retried with back-off.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient { .. } | Self::Throttled { .. } | Self::Generic(_) => true,
            Self::Lookup(err) => err.is_retryable(),
            Self::Config { .. }
            | Self::AlreadyBusyForEntry { .. }
            | Self::AlreadyBusyForOwner { .. }
            | Self::NoMatchingProvider { .. }
            | Self::NoSuchHostedZone { .. }
            | Self::Validation { .. }
            | Self::LockContention { .. } => false,
        }
    }

    /// Returns the status reason code recorded on entry or provider status.
    #[must_use]
    pub fn status_reason(&self) -> &'static str {
        match self {
            Self::Config { .. } => "InvalidConfiguration",
            Self::Transient { .. } => "UpstreamFailure",
            Self::Throttled { .. } => "Throttled",
            Self::AlreadyBusyForEntry { .. } => "AlreadyBusyForEntry",
            Self::AlreadyBusyForOwner { .. } => "AlreadyBusyForOwner",
            Self::NoMatchingProvider { .. } => "NoMatchingProvider",
            Self::NoSuchHostedZone { .. } => "NoSuchHostedZone",
            Self::Validation { .. } => "InvalidEntry",
            Self::LockContention { .. } => "LockContention",
            Self::Lookup(_) => "LookupFailed",
            Self::Generic(_) => "ReconciliationFailed",
        }
    }
}

// Conversion from anyhow::Error to DnsError for orchestration seams
impl From<anyhow::Error> for DnsError {
    fn from(err: anyhow::Error) -> Self {
        Self::Generic(err.to_string())
    }
}

#[cfg(test)]
#[path = "dns_errors_tests.rs"]
mod dns_errors_tests;
