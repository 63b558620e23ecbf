//! In-memory repository implementations for single-node operation and
//! tests. Each repo is a mutex-guarded map or vec with the same observable
//! behavior as the relational implementations.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{
	AlertEvent, AlertEventHistory, DataSource, NotificationChannel, NotificationRecord, Rule,
	SilenceRule, SmtpConfig,
};
use crate::repos::{
	ChannelRepo, DataSourceRepo, EventRepo, RecordRepo, RuleRepo, SettingsRepo, SilenceRepo,
	TickBatch,
};

#[derive(Default)]
pub struct MemoryRules {
	rules: Mutex<Vec<Rule>>,
}

impl MemoryRules {
	pub fn new(rules: Vec<Rule>) -> Self {
		Self {
			rules: Mutex::new(rules),
		}
	}
}

#[async_trait]
impl RuleRepo for MemoryRules {
	async fn enabled(&self) -> Result<Vec<Rule>> {
		let rules = self.rules.lock().expect("rules mutex poisoned");
		Ok(rules.iter().filter(|r| r.is_enabled).cloned().collect())
	}

	async fn by_id(&self, id: i64) -> Result<Option<Rule>> {
		let rules = self.rules.lock().expect("rules mutex poisoned");
		Ok(rules.iter().find(|r| r.id == id).cloned())
	}
}

#[derive(Default)]
pub struct MemoryDataSources {
	sources: Mutex<Vec<DataSource>>,
}

impl MemoryDataSources {
	pub fn new(sources: Vec<DataSource>) -> Self {
		Self {
			sources: Mutex::new(sources),
		}
	}
}

#[async_trait]
impl DataSourceRepo for MemoryDataSources {
	async fn enabled_by_id(&self, id: i64) -> Result<Option<DataSource>> {
		let sources = self.sources.lock().expect("sources mutex poisoned");
		Ok(sources
			.iter()
			.find(|ds| ds.id == id && ds.is_enabled)
			.cloned())
	}
}

/// Active events keyed by fingerprint plus an append-only history, mutated
/// under one mutex so a tick batch applies atomically.
#[derive(Default)]
pub struct MemoryEvents {
	inner: Mutex<EventsInner>,
}

#[derive(Default)]
struct EventsInner {
	active: HashMap<String, AlertEvent>,
	history: Vec<AlertEventHistory>,
}

impl MemoryEvents {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn active(&self) -> Vec<AlertEvent> {
		let inner = self.inner.lock().expect("events mutex poisoned");
		inner.active.values().cloned().collect()
	}

	pub fn by_fingerprint(&self, fingerprint: &str) -> Option<AlertEvent> {
		let inner = self.inner.lock().expect("events mutex poisoned");
		inner.active.get(fingerprint).cloned()
	}

	pub fn history(&self) -> Vec<AlertEventHistory> {
		let inner = self.inner.lock().expect("events mutex poisoned");
		inner.history.clone()
	}
}

#[async_trait]
impl EventRepo for MemoryEvents {
	async fn active_for_rule(&self, rule_id: i64) -> Result<Vec<AlertEvent>> {
		let inner = self.inner.lock().expect("events mutex poisoned");
		Ok(inner
			.active
			.values()
			.filter(|e| e.rule_id == rule_id)
			.cloned()
			.collect())
	}

	async fn commit_tick(&self, batch: TickBatch) -> Result<()> {
		let mut inner = self.inner.lock().expect("events mutex poisoned");
		for event in batch.upserts {
			inner.active.insert(event.fingerprint.clone(), event);
		}
		for archived in batch.archives {
			inner.active.remove(&archived.fingerprint);
			inner.history.push(archived);
		}
		Ok(())
	}

	async fn mark_sent(&self, fingerprints: &[String], at: DateTime<Utc>) -> Result<()> {
		let mut inner = self.inner.lock().expect("events mutex poisoned");
		for fingerprint in fingerprints {
			if let Some(event) = inner.active.get_mut(fingerprint) {
				event.last_sent_at = Some(at);
			}
		}
		Ok(())
	}
}

#[derive(Default)]
pub struct MemorySilences {
	silences: Mutex<Vec<SilenceRule>>,
}

impl MemorySilences {
	pub fn new(silences: Vec<SilenceRule>) -> Self {
		Self {
			silences: Mutex::new(silences),
		}
	}
}

#[async_trait]
impl SilenceRepo for MemorySilences {
	async fn active_for_tenant(
		&self,
		tenant_id: i64,
		now: DateTime<Utc>,
	) -> Result<Vec<SilenceRule>> {
		let silences = self.silences.lock().expect("silences mutex poisoned");
		Ok(silences
			.iter()
			.filter(|s| s.tenant_id == tenant_id && s.is_active(now))
			.cloned()
			.collect())
	}
}

#[derive(Default)]
pub struct MemoryChannels {
	channels: Mutex<Vec<NotificationChannel>>,
}

impl MemoryChannels {
	pub fn new(channels: Vec<NotificationChannel>) -> Self {
		Self {
			channels: Mutex::new(channels),
		}
	}
}

#[async_trait]
impl ChannelRepo for MemoryChannels {
	async fn enabled_by_ids(
		&self,
		tenant_id: i64,
		ids: &[i64],
	) -> Result<Vec<NotificationChannel>> {
		let channels = self.channels.lock().expect("channels mutex poisoned");
		Ok(channels
			.iter()
			.filter(|c| c.tenant_id == tenant_id && c.is_enabled && ids.contains(&c.id))
			.cloned()
			.collect())
	}

	async fn tenant_defaults(&self, tenant_id: i64) -> Result<Vec<NotificationChannel>> {
		let channels = self.channels.lock().expect("channels mutex poisoned");
		Ok(channels
			.iter()
			.filter(|c| c.tenant_id == tenant_id && c.is_enabled && c.is_default)
			.cloned()
			.collect())
	}
}

#[derive(Default)]
pub struct MemoryRecords {
	records: Mutex<Vec<NotificationRecord>>,
}

impl MemoryRecords {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn all(&self) -> Vec<NotificationRecord> {
		self.records.lock().expect("records mutex poisoned").clone()
	}
}

#[async_trait]
impl RecordRepo for MemoryRecords {
	async fn append(&self, record: NotificationRecord) -> Result<()> {
		self.records
			.lock()
			.expect("records mutex poisoned")
			.push(record);
		Ok(())
	}
}

#[derive(Default)]
pub struct MemorySettings {
	smtp: Mutex<Option<SmtpConfig>>,
}

impl MemorySettings {
	pub fn new(smtp: Option<SmtpConfig>) -> Self {
		Self {
			smtp: Mutex::new(smtp),
		}
	}
}

#[async_trait]
impl SettingsRepo for MemorySettings {
	async fn smtp_config(&self) -> Result<Option<SmtpConfig>> {
		Ok(self.smtp.lock().expect("settings mutex poisoned").clone())
	}
}
