// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

#![allow(unexpected_cfgs)]

//! # Rezone - Hosted-Zone Reconciliation Core
//!
//! Rezone is the reconciliation engine of an external DNS controller: a fleet
//! of declarative DNS-record objects ("entries") is continuously reflected
//! into hosted zones at upstream DNS providers.
//!
//! ## Overview
//!
//! This library provides the core functionality, including:
//!
//! - The DNS-set model and the per-zone change model (diffing desired
//!   against observed record sets, partitioned per provider)
//! - The state layer indexing entries by DNS name with deterministic
//!   duplicate handling
//! - The zone scheduler serializing reconciliations per zone with rate
//!   limits and adaptive back-off
//! - The lookup processor re-resolving CNAME targets in the background
//! - Shared account and zone-state caches amortizing upstream calls
//!
//! The declarative watch machinery, the concrete cloud adapters and the
//! command line live in the surrounding controller manager; they talk to the
//! core through the [`provider::DnsHandler`] contract and the
//! [`reconcilers::Dispatcher`] event channels.
//!
//! ## Modules
//!
//! - [`dnsset`] - names, typed record sets and ownership attributes
//! - [`reconcilers`] - the change model, the zone scheduler, the dispatcher
//! - [`state`] - the entry index and the provider/zone registries
//! - [`lookup`] - periodic hostname re-resolution
//! - [`zone_cache`] - TTL-bounded zone reads with optional persistence
//!
//! ## Example
//!
//! ```rust,no_run
//! use rezone::config::Config;
//! use rezone::lookup::SystemLookupHost;
//! use rezone::reconcilers::Dispatcher;
//! use std::sync::Arc;
//!
//! # fn handler_factory() -> Arc<dyn rezone::reconcilers::HandlerFactory> { unimplemented!() }
//! # async fn example() -> anyhow::Result<()> {
//! let cfg = Arc::new(Config {
//!     ident: "prod-dns".to_string(),
//!     ..Config::default()
//! });
//! let resolver = Arc::new(SystemLookupHost::from_system_conf()?);
//! let dispatcher = Dispatcher::new(cfg, handler_factory(), resolver)?;
//! dispatcher.start();
//! # Ok(())
//! # }
//! ```

pub mod account;
pub mod config;
pub mod constants;
pub mod dns_errors;
pub mod dnsset;
pub mod finalizers;
pub mod inmemory;
pub mod lookup;
pub mod metrics;
pub mod provider;
pub mod rate_limiter;
pub mod reconcilers;
pub mod selector;
pub mod state;
pub mod zone_cache;
