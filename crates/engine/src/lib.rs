//! vigil-engine: the core alert processing engine.
//!
//! Periodically evaluates rule expressions against Prometheus-compatible
//! data sources, tracks per-series alert lifecycles, aggregates lifecycle
//! events into groups shared across replicas through a KV store, and
//! dispatches grouped, deduplicated, silence-aware notifications through
//! pluggable channels.
//!
//! Storage, user administration, and the CRUD surface are collaborators:
//! the engine consumes them through the traits in [`repos`] and [`kv`].

#![deny(rust_2018_idioms)]

use std::net::SocketAddr;
use std::sync::Arc;

pub mod daemon;
pub mod datasource;
pub mod error;
pub mod evaluator;
pub mod fingerprint;
pub mod grouper;
pub mod http_server;
pub mod kv;
pub mod lock;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod repos;
pub mod router;
pub mod scheduler;
pub mod silence;
pub mod templates;

pub use daemon::{memory_deps, run, run_with_shutdown};
pub use error::{Error, Result};
pub use grouper::GroupingConfig;
pub use scheduler::SchedulerConfig;

use crate::repos::{
	ChannelRepo, DataSourceRepo, EventRepo, RecordRepo, RuleRepo, SettingsRepo, SilenceRepo,
};

/// The engine's collaborators, wired at startup.
pub struct Deps {
	pub rules: Arc<dyn RuleRepo>,
	pub datasources: Arc<dyn DataSourceRepo>,
	pub events: Arc<dyn EventRepo>,
	pub silences: Arc<dyn SilenceRepo>,
	pub channels: Arc<dyn ChannelRepo>,
	pub records: Arc<dyn RecordRepo>,
	pub settings: Arc<dyn SettingsRepo>,
}

/// Configuration for the engine daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
	/// Redis-compatible KV store URL; `None` falls back to in-memory
	/// grouping and locking (single-node operation).
	pub redis_url: Option<String>,
	pub grouping: GroupingConfig,
	pub scheduler: SchedulerConfig,
	/// Addresses to try binding the status server to; empty disables it.
	pub server_addrs: Vec<SocketAddr>,
}

impl Default for DaemonConfig {
	fn default() -> Self {
		Self {
			redis_url: None,
			grouping: GroupingConfig::default(),
			scheduler: SchedulerConfig::default(),
			server_addrs: Vec::new(),
		}
	}
}
