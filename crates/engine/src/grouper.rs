//! Alertmanager-style grouping over the shared KV store.
//!
//! Groups are keyed by rule name plus the rule's `group_by` label values
//! and live in the KV store so every replica converges on the same send
//! decisions. Appends are idempotent per fingerprint; exclusive send rights
//! are taken separately through the group lock (see `lock`).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::Result;
use crate::kv::KvStore;
use crate::model::{AlertEvent, AlertGroup, AlertSnapshot, GroupStats, Labels, Rule};

const FIRING_PREFIX: &str = "alert:group:firing:";
const RECOVERY_PREFIX: &str = "alert:group:recovery:";

/// Sliding lifetime of a group record in the KV store.
const GROUP_TTL: Duration = Duration::from_secs(7200);

#[derive(Debug, Clone)]
pub struct GroupingConfig {
	/// How long a new group buffers before its first send.
	pub group_wait: Duration,
	/// Minimum spacing between successive sends of the same group.
	pub group_interval: Duration,
	/// How often an already-sent, still-firing group is re-announced.
	pub repeat_interval: Duration,
}

impl Default for GroupingConfig {
	fn default() -> Self {
		Self {
			group_wait: Duration::from_secs(10),
			group_interval: Duration::from_secs(30),
			repeat_interval: Duration::from_secs(3600),
		}
	}
}

pub struct Grouper {
	kv: Arc<dyn KvStore>,
	config: GroupingConfig,
}

impl Grouper {
	pub fn new(kv: Arc<dyn KvStore>, config: GroupingConfig) -> Self {
		Self { kv, config }
	}

	pub fn config(&self) -> &GroupingConfig {
		&self.config
	}

	/// Derive the group key and group labels for an alert under a rule.
	///
	/// The key is `rule:<name>` extended, in declared `group_by` order, with
	/// `|<label>:<value>` for each label present and non-empty on the alert.
	pub fn derive_group_key(rule: &Rule, labels: &Labels) -> (String, Labels) {
		let mut parts = vec![format!("rule:{}", rule.name)];
		let mut group_labels = Labels::new();
		group_labels.insert("alertname".into(), rule.name.clone());

		for key in &rule.route_config.group_by {
			if let Some(value) = labels.get(key)
				&& !value.is_empty()
			{
				parts.push(format!("{key}:{value}"));
				group_labels.insert(key.clone(), value.clone());
			}
		}

		(parts.join("|"), group_labels)
	}

	fn kv_key(group_key: &str, is_recovery: bool) -> String {
		let prefix = if is_recovery {
			RECOVERY_PREFIX
		} else {
			FIRING_PREFIX
		};
		format!("{prefix}{group_key}")
	}

	/// Add a firing alert to its group, creating the group on first sight.
	/// Returns the group key.
	pub async fn add_firing(
		&self,
		alert: &AlertEvent,
		rule: &Rule,
		now: DateTime<Utc>,
	) -> Result<String> {
		let (group_key, group_labels) = Self::derive_group_key(rule, &alert.labels);
		self.append(&group_key, group_labels, rule, alert, false, now)
			.await?;
		Ok(group_key)
	}

	/// Add a recovered alert to the recovery-side group. Returns the
	/// recovery group key.
	pub async fn add_recovery(
		&self,
		alert: &AlertEvent,
		rule: &Rule,
		now: DateTime<Utc>,
	) -> Result<String> {
		let (base_key, group_labels) = Self::derive_group_key(rule, &alert.labels);
		let recovery_key = format!("recovery:{base_key}");
		self.append(&recovery_key, group_labels, rule, alert, true, now)
			.await?;
		Ok(recovery_key)
	}

	/// Read-modify-write append, idempotent per fingerprint. Concurrent
	/// writers may race; because the operation is a set-union on
	/// fingerprints, replays converge rather than duplicate.
	async fn append(
		&self,
		group_key: &str,
		group_labels: Labels,
		rule: &Rule,
		alert: &AlertEvent,
		is_recovery: bool,
		now: DateTime<Utc>,
	) -> Result<()> {
		let kv_key = Self::kv_key(group_key, is_recovery);

		let mut group = match self.kv.get(&kv_key).await? {
			Some(raw) => serde_json::from_str::<AlertGroup>(&raw)?,
			None => {
				info!(%group_key, is_recovery, "creating alert group");
				AlertGroup {
					group_key: group_key.to_string(),
					group_labels,
					rule_id: rule.id,
					rule_name: rule.name.clone(),
					alerts: Vec::new(),
					created_at: now,
					last_updated_at: now,
					sent: false,
				}
			}
		};

		if !group.contains(&alert.fingerprint) {
			group.alerts.push(AlertSnapshot::from(alert));
			group.last_updated_at = now;
			self.kv
				.set_ex(&kv_key, &serde_json::to_string(&group)?, GROUP_TTL)
				.await?;
			debug!(%group_key, alerts = group.alerts.len(), "alert appended to group");
		}

		Ok(())
	}

	/// Readiness: a non-empty group is ready when it is unsent and
	/// `group_wait` has elapsed since creation, or already sent and
	/// `repeat_interval` has elapsed since its last update.
	pub fn is_ready(&self, group: &AlertGroup, now: DateTime<Utc>) -> bool {
		if group.alerts.is_empty() {
			return false;
		}

		if group.sent {
			now - group.last_updated_at
				>= chrono::Duration::from_std(self.config.repeat_interval)
					.unwrap_or(chrono::Duration::MAX)
		} else {
			now - group.created_at
				>= chrono::Duration::from_std(self.config.group_wait)
					.unwrap_or(chrono::Duration::MAX)
		}
	}

	/// All groups due for dispatch, paired with whether they are recovery
	/// groups.
	pub async fn ready_groups(&self, now: DateTime<Utc>) -> Result<Vec<(AlertGroup, bool)>> {
		let mut ready = Vec::new();
		for (prefix, is_recovery) in [(FIRING_PREFIX, false), (RECOVERY_PREFIX, true)] {
			for key in self.kv.scan_prefix(prefix).await? {
				let Some(raw) = self.kv.get(&key).await? else {
					continue;
				};
				let group: AlertGroup = serde_json::from_str(&raw)?;
				if self.is_ready(&group, now) {
					info!(
						group_key = %group.group_key,
						alerts = group.alerts.len(),
						is_recovery,
						"group ready for dispatch"
					);
					ready.push((group, is_recovery));
				}
			}
		}
		Ok(ready)
	}

	/// Mark a group sent, refreshing `last_updated_at` so `repeat_interval`
	/// counts from this send.
	pub async fn mark_sent(
		&self,
		group_key: &str,
		is_recovery: bool,
		now: DateTime<Utc>,
	) -> Result<()> {
		let kv_key = Self::kv_key(group_key, is_recovery);
		if let Some(raw) = self.kv.get(&kv_key).await? {
			let mut group: AlertGroup = serde_json::from_str(&raw)?;
			group.sent = true;
			group.last_updated_at = now;
			self.kv
				.set_ex(&kv_key, &serde_json::to_string(&group)?, GROUP_TTL)
				.await?;
		}
		Ok(())
	}

	pub async fn delete_group(&self, group_key: &str, is_recovery: bool) -> Result<()> {
		self.kv.del(&Self::kv_key(group_key, is_recovery)).await?;
		debug!(%group_key, is_recovery, "deleted group");
		Ok(())
	}

	/// Drop a fingerprint from every firing group so an already-recovered
	/// alert cannot be re-announced by a repeat send. Groups emptied by the
	/// removal are deleted.
	pub async fn remove_fingerprint(&self, fingerprint: &str) -> Result<()> {
		for key in self.kv.scan_prefix(FIRING_PREFIX).await? {
			let Some(raw) = self.kv.get(&key).await? else {
				continue;
			};
			let mut group: AlertGroup = serde_json::from_str(&raw)?;
			let before = group.alerts.len();
			group.alerts.retain(|a| a.fingerprint != fingerprint);

			if group.alerts.len() < before {
				if group.alerts.is_empty() {
					self.kv.del(&key).await?;
					debug!(group_key = %group.group_key, "removed last alert, deleting group");
				} else {
					self.kv
						.set_ex(&key, &serde_json::to_string(&group)?, GROUP_TTL)
						.await?;
				}
			}
		}
		Ok(())
	}

	pub async fn stats(&self) -> Result<GroupStats> {
		let mut stats = GroupStats::default();
		for (prefix, is_recovery) in [(FIRING_PREFIX, false), (RECOVERY_PREFIX, true)] {
			for key in self.kv.scan_prefix(prefix).await? {
				let Some(raw) = self.kv.get(&key).await? else {
					continue;
				};
				let group: AlertGroup = serde_json::from_str(&raw)?;
				stats.total_groups += 1;
				if is_recovery {
					stats.recovery_groups += 1;
				} else {
					stats.firing_groups += 1;
				}
				stats.total_alerts += group.alerts.len();
				if !is_recovery {
					stats.firing_alerts += group.alerts.len();
				}
				if group.sent {
					stats.sent_groups += 1;
				} else {
					stats.pending_groups += 1;
				}
			}
		}
		Ok(stats)
	}
}
