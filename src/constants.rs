// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Global constants for the rezone reconciliation core.
//!
//! This module contains all numeric and string constants used throughout the codebase.
//! Constants are organized by category for easy maintenance.

use std::time::Duration;

// ============================================================================
// Ownership Constants
// ============================================================================

/// META attribute key carrying the owner identity of a record set
pub const ATTR_OWNER: &str = "owner";

/// META attribute key carrying the record-name prefix the controller stamps
pub const ATTR_PREFIX: &str = "prefix";

/// META attribute key carrying the sorted, comma-joined CNAME targets of a
/// synthesized address set
pub const ATTR_CNAMES: &str = "cnames";

/// Default record-name prefix stamped on controller-owned sets
pub const DEFAULT_PREFIX: &str = "comment-";

// ============================================================================
// Scheduling Constants
// ============================================================================

/// Minimum delay between two reconciliations of the same hosted zone
pub const DEFAULT_DNS_DELAY: Duration = Duration::from_secs(10);

/// Delay before re-reconciling a zone that is blocked by in-flight entries
pub const BLOCKED_ZONE_DELAY: Duration = Duration::from_secs(5);

/// Reschedule delay when a zone is found busy
pub const BUSY_ZONE_DELAY: Duration = Duration::from_secs(10);

/// Lower bound of the randomized reschedule window on entry lock contention
pub const ENTRY_CONTENTION_DELAY_MIN: Duration = Duration::from_secs(3);

/// Upper bound of the randomized reschedule window on entry lock contention
pub const ENTRY_CONTENTION_DELAY_MAX: Duration = Duration::from_secs(6);

/// Reschedule delay for an entry that lost its provider
pub const DEFAULT_RESCHEDULE_DELAY: Duration = Duration::from_secs(120);

/// Time budget for spinning on a per-entry lock
pub const ENTRY_SPIN_BUDGET: Duration = Duration::from_millis(10);

/// Window after a zone unlock during which its entries still count as busy
pub const OUTSTANDING_TIMEOUT: Duration = Duration::from_secs(15);

/// Reconciliation delays above this threshold are surfaced in the event log
pub const DELAY_EVENT_THRESHOLD: Duration = Duration::from_secs(2);

// ============================================================================
// Zone Rate Limiter Constants
// ============================================================================

/// Floor of the adaptive per-zone retry interval
pub const ZONE_BACKOFF_MIN: Duration = Duration::from_secs(10);

/// Ceiling of the adaptive per-zone retry interval
pub const ZONE_BACKOFF_MAX: Duration = Duration::from_secs(600);

// ============================================================================
// Lookup Processor Constants
// ============================================================================

/// Period between heap checks when no job is due
pub const LOOKUP_CHECK_PERIOD: Duration = Duration::from_millis(10);

/// Default number of concurrently running lookup jobs
pub const DEFAULT_CONCURRENT_LOOKUPS: usize = 4;

/// Number of hostnames resolved concurrently within a single job
pub const HOSTS_PER_JOB_CONCURRENCY: usize = 4;

/// Retry attempts for a hostname resolution hitting a temporary failure
pub const LOOKUP_RETRIES: u32 = 5;

/// Wait between hostname resolution retries
pub const LOOKUP_RETRY_WAIT: Duration = Duration::from_millis(500);

/// Re-resolution interval for multi-CNAME entries
pub const DEFAULT_LOOKUP_INTERVAL: Duration = Duration::from_secs(30);

// ============================================================================
// Zone State Cache Constants
// ============================================================================

/// Default TTL of a cached zone state
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(120);

/// Persisted cache files older than this are removed on start-up
pub const CACHE_FILE_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

/// Schema version written into persisted zone-state files
pub const CACHE_SCHEMA_VERSION: &str = "1";

// ============================================================================
// Change Execution Constants
// ============================================================================

/// Default per-provider change-request batch cap
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Default provider pagination/throttling retry cap
pub const DEFAULT_MAX_RETRIES: u32 = 7;

/// Default record TTL in seconds when neither entry nor provider set one
pub const DEFAULT_RECORD_TTL: u64 = 300;

// ============================================================================
// Worker Pool Constants
// ============================================================================

/// Workers consuming entry events
pub const ENTRY_WORKERS: usize = 2;

/// Workers consuming provider events
pub const PROVIDER_WORKERS: usize = 2;
