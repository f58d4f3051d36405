// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! In-memory representation of fully-qualified DNS names and their typed
//! record sets.
//!
//! A [`DnsSet`] is the fully-hydrated record bundle for one name: at most one
//! [`RecordSet`] per record type, plus a synthetic `META` record set that
//! carries controller attributes (owner identity, record prefix, original
//! CNAME targets) encoded as `key=value` records.

use crate::constants::{ATTR_CNAMES, ATTR_OWNER, ATTR_PREFIX};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;

/// Record types handled by the reconciliation core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RecordType {
    /// IPv4 address record
    A,
    /// IPv6 address record
    AAAA,
    /// Canonical name record
    CNAME,
    /// Text record
    TXT,
    /// Synthetic record set carrying controller attributes
    #[serde(rename = "META")]
    Meta,
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordType::A => "A",
            RecordType::AAAA => "AAAA",
            RecordType::CNAME => "CNAME",
            RecordType::TXT => "TXT",
            RecordType::Meta => "META",
        };
        f.write_str(s)
    }
}

/// Normalize a DNS name: lowercase, trailing dot stripped.
#[must_use]
pub fn normalize_dns_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// A DNS name together with its routing-policy set identifier.
///
/// Equality is pair equality; names are normalized on construction.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DnsSetName {
    /// The fully-qualified DNS name (normalized)
    pub dns_name: String,
    /// Distinguishes multiple sets for the same name under routing policies;
    /// empty for plain sets
    pub set_identifier: String,
}

impl DnsSetName {
    /// Create a normalized set name without a set identifier.
    #[must_use]
    pub fn new(dns_name: &str) -> Self {
        Self {
            dns_name: normalize_dns_name(dns_name),
            set_identifier: String::new(),
        }
    }

    /// Create a normalized set name with a set identifier.
    #[must_use]
    pub fn with_identifier(dns_name: &str, set_identifier: &str) -> Self {
        Self {
            dns_name: normalize_dns_name(dns_name),
            set_identifier: set_identifier.to_string(),
        }
    }
}

impl fmt::Display for DnsSetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.set_identifier.is_empty() {
            write!(f, "{}", self.dns_name)
        } else {
            write!(f, "{}#{}", self.dns_name, self.set_identifier)
        }
    }
}

/// A typed record set: record type, TTL, and an unordered set of opaque
/// record values.
///
/// Equality ignores record order but is strict on TTL and type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSet {
    /// The record type of every value in this set
    pub rtype: RecordType,
    /// Time-to-live in seconds
    pub ttl: u64,
    /// The record values; unordered and deduplicated
    pub records: BTreeSet<String>,
}

impl RecordSet {
    /// Create a record set from an iterator of values.
    #[must_use]
    pub fn new<I, S>(rtype: RecordType, ttl: u64, records: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rtype,
            ttl,
            records: records.into_iter().map(Into::into).collect(),
        }
    }

    /// True if the set holds no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of record values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Routing policy applied consistently across all record sets of a name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    /// Policy type (e.g. `weighted`)
    pub policy: String,
    /// Policy parameters
    pub parameters: BTreeMap<String, String>,
}

/// The fully-hydrated record bundle for one DNS name.
///
/// Invariants: at most one record set per type; CNAME and A/AAAA are mutually
/// exclusive unless the address sets were synthesized from multiple CNAME
/// targets (in which case the original hostnames are retained in the
/// `cnames` META attribute).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsSet {
    /// The name (and set identifier) this bundle belongs to
    pub name: DnsSetName,
    /// Optional routing policy, consistent across all sets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_policy: Option<RoutingPolicy>,
    /// Record sets keyed by type
    pub sets: BTreeMap<RecordType, RecordSet>,
}

impl DnsSet {
    /// Create an empty bundle for a name.
    #[must_use]
    pub fn new(name: DnsSetName) -> Self {
        Self {
            name,
            routing_policy: None,
            sets: BTreeMap::new(),
        }
    }

    /// Add a record value, creating the typed set with the given TTL on
    /// first use.
    pub fn add_record(&mut self, rtype: RecordType, ttl: u64, value: &str) {
        self.sets
            .entry(rtype)
            .or_insert_with(|| RecordSet {
                rtype,
                ttl,
                records: BTreeSet::new(),
            })
            .records
            .insert(value.to_string());
    }

    /// The record set of the given type, if present.
    #[must_use]
    pub fn get(&self, rtype: RecordType) -> Option<&RecordSet> {
        self.sets.get(&rtype)
    }

    /// Read a META attribute.
    #[must_use]
    pub fn attr(&self, key: &str) -> Option<&str> {
        let prefix = format!("{key}=");
        self.sets.get(&RecordType::Meta).and_then(|meta| {
            meta.records
                .iter()
                .find(|r| r.starts_with(&prefix))
                .map(|r| &r[prefix.len()..])
        })
    }

    /// Set a META attribute, replacing any prior value for the key.
    pub fn set_attr(&mut self, key: &str, value: &str) {
        let prefix = format!("{key}=");
        let meta = self.sets.entry(RecordType::Meta).or_insert_with(|| RecordSet {
            rtype: RecordType::Meta,
            ttl: 600,
            records: BTreeSet::new(),
        });
        meta.records.retain(|r| !r.starts_with(&prefix));
        meta.records.insert(format!("{prefix}{value}"));
    }

    /// The owner identity stamped on this set, if any.
    #[must_use]
    pub fn owner(&self) -> Option<&str> {
        self.attr(ATTR_OWNER)
    }

    /// Stamp the controller's owner identity and record prefix.
    pub fn set_owner(&mut self, owner: &str, prefix: &str) {
        self.set_attr(ATTR_OWNER, owner);
        self.set_attr(ATTR_PREFIX, prefix);
    }

    /// Record the original CNAME hostnames of a synthesized address set,
    /// sorted and comma-joined.
    pub fn set_cnames<I, S>(&mut self, hostnames: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sorted: BTreeSet<String> = hostnames.into_iter().map(Into::into).collect();
        let joined = sorted.into_iter().collect::<Vec<_>>().join(",");
        self.set_attr(ATTR_CNAMES, &joined);
    }

    /// True if the set carries the given owner identity.
    #[must_use]
    pub fn is_owned_by(&self, ownership: &Ownership) -> bool {
        match self.owner() {
            Some(owner) => ownership.is_responsible(owner),
            None => false,
        }
    }

    /// True if the set carries an owner identity foreign to this controller.
    ///
    /// An unowned set (no META owner) is not foreign: it may be adopted.
    #[must_use]
    pub fn is_foreign(&self, ownership: &Ownership) -> bool {
        match self.owner() {
            Some(owner) => !ownership.is_responsible(owner),
            None => false,
        }
    }

    /// Record types present, excluding the synthetic META set.
    pub fn record_types(&self) -> impl Iterator<Item = RecordType> + '_ {
        self.sets.keys().copied().filter(|t| *t != RecordType::Meta)
    }
}

/// All record bundles of a zone, keyed by set name.
pub type DnsSets = BTreeMap<DnsSetName, DnsSet>;

/// The owner identities this controller instance answers for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ownership {
    ids: BTreeSet<String>,
}

impl Ownership {
    /// Ownership for a single identifier.
    #[must_use]
    pub fn new(ident: &str) -> Self {
        let mut ids = BTreeSet::new();
        ids.insert(ident.to_ascii_lowercase());
        Self { ids }
    }

    /// Ownership for a set of identifiers (multi-tenant deployments).
    #[must_use]
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            ids: ids
                .into_iter()
                .map(|s| s.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    /// True if this controller answers for the given owner id.
    #[must_use]
    pub fn is_responsible(&self, owner: &str) -> bool {
        self.ids.contains(&owner.to_ascii_lowercase())
    }

    /// The active owner ids.
    #[must_use]
    pub fn ids(&self) -> &BTreeSet<String> {
        &self.ids
    }
}

/// A single desired target of an entry.
///
/// The record type is derived from the target value: IPv4 addresses become
/// `A` records, IPv6 addresses `AAAA`, quoted values `TXT`, anything else a
/// `CNAME` hostname.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    /// The derived record type
    pub rtype: RecordType,
    /// The record value (hostname, address or text)
    pub value: String,
}

impl Target {
    /// Derive a target from a raw entry value.
    #[must_use]
    pub fn from_value(value: &str) -> Self {
        if let Ok(addr) = value.parse::<IpAddr>() {
            let rtype = match addr {
                IpAddr::V4(_) => RecordType::A,
                IpAddr::V6(_) => RecordType::AAAA,
            };
            return Self {
                rtype,
                value: value.to_string(),
            };
        }
        if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            return Self {
                rtype: RecordType::TXT,
                value: value.to_string(),
            };
        }
        Self {
            rtype: RecordType::CNAME,
            value: normalize_dns_name(value),
        }
    }

    /// Build an explicit text target.
    #[must_use]
    pub fn text(value: &str) -> Self {
        Self {
            rtype: RecordType::TXT,
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
#[path = "dnsset_tests.rs"]
mod dnsset_tests;
