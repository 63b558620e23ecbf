//! Repository seams.
//!
//! The engine reads configuration (rules, data sources, channels, silences,
//! settings) and owns the alert-event lifecycle, but it never sees a
//! concrete store: everything goes through these traits. The `memory`
//! module provides single-node implementations; `vigil-postgres` provides
//! the relational ones.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{
	AlertEvent, AlertEventHistory, DataSource, NotificationChannel, NotificationRecord, Rule,
	SilenceRule, SmtpConfig,
};

pub mod memory;

/// All state changes of a single rule-tick, committed atomically.
///
/// An archive entry implies deletion of the active event row with the same
/// fingerprint.
#[derive(Debug, Default)]
pub struct TickBatch {
	pub upserts: Vec<AlertEvent>,
	pub archives: Vec<AlertEventHistory>,
}

impl TickBatch {
	pub fn is_empty(&self) -> bool {
		self.upserts.is_empty() && self.archives.is_empty()
	}
}

#[async_trait]
pub trait RuleRepo: Send + Sync {
	async fn enabled(&self) -> Result<Vec<Rule>>;
	async fn by_id(&self, id: i64) -> Result<Option<Rule>>;
}

#[async_trait]
pub trait DataSourceRepo: Send + Sync {
	/// Returns the data source only if it exists and is enabled.
	async fn enabled_by_id(&self, id: i64) -> Result<Option<DataSource>>;
}

#[async_trait]
pub trait EventRepo: Send + Sync {
	async fn active_for_rule(&self, rule_id: i64) -> Result<Vec<AlertEvent>>;
	async fn commit_tick(&self, batch: TickBatch) -> Result<()>;
	/// Stamp `last_sent_at` on the given fingerprints after a successful
	/// dispatch. Fingerprints that have since been archived are ignored.
	async fn mark_sent(&self, fingerprints: &[String], at: DateTime<Utc>) -> Result<()>;
}

#[async_trait]
pub trait SilenceRepo: Send + Sync {
	/// Silences of the tenant that are enabled and within their window.
	async fn active_for_tenant(
		&self,
		tenant_id: i64,
		now: DateTime<Utc>,
	) -> Result<Vec<SilenceRule>>;
}

#[async_trait]
pub trait ChannelRepo: Send + Sync {
	/// Enabled channels of the tenant restricted to the given ids.
	async fn enabled_by_ids(
		&self,
		tenant_id: i64,
		ids: &[i64],
	) -> Result<Vec<NotificationChannel>>;
	/// Enabled channels of the tenant marked as default.
	async fn tenant_defaults(&self, tenant_id: i64) -> Result<Vec<NotificationChannel>>;
}

#[async_trait]
pub trait RecordRepo: Send + Sync {
	async fn append(&self, record: NotificationRecord) -> Result<()>;
}

#[async_trait]
pub trait SettingsRepo: Send + Sync {
	async fn smtp_config(&self) -> Result<Option<SmtpConfig>>;
}
