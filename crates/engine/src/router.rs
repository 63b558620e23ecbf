//! Routing of lifecycle events into grouped or direct sends.
//!
//! Silences are checked first on the firing path. Grouped alerts buffer in
//! the shared grouper and leave sending to the grouping worker; non-grouped
//! rules send immediately under a per-fingerprint distributed lock with a
//! minimum re-send interval.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::evaluator::LifecycleSink;
use crate::grouper::Grouper;
use crate::lock::LockManager;
use crate::model::{AlertEvent, AlertSnapshot, Rule};
use crate::notify::Dispatcher;
use crate::repos::{EventRepo, SilenceRepo};
use crate::silence::CompiledMatchers;

/// Minimum spacing between direct (non-grouped) sends of one fingerprint,
/// in seconds.
const DIRECT_SEND_MIN_INTERVAL: i64 = 300;

pub struct AlertRouter {
	grouper: Arc<Grouper>,
	dispatcher: Arc<Dispatcher>,
	silences: Arc<dyn SilenceRepo>,
	events: Arc<dyn EventRepo>,
	locks: LockManager,
	/// Matchers compiled once per silence rule and reused across ticks.
	compiled: Mutex<HashMap<i64, Arc<CompiledMatchers>>>,
}

impl AlertRouter {
	pub fn new(
		grouper: Arc<Grouper>,
		dispatcher: Arc<Dispatcher>,
		silences: Arc<dyn SilenceRepo>,
		events: Arc<dyn EventRepo>,
		locks: LockManager,
	) -> Self {
		Self {
			grouper,
			dispatcher,
			silences,
			events,
			locks,
			compiled: Mutex::new(HashMap::new()),
		}
	}

	pub async fn is_silenced(&self, event: &AlertEvent, now: DateTime<Utc>) -> Result<bool> {
		let silences = self
			.silences
			.active_for_tenant(event.tenant_id, now)
			.await?;

		for silence in silences {
			let matchers = {
				let mut cache = self.compiled.lock().expect("matcher cache poisoned");
				match cache.get(&silence.id) {
					Some(compiled) => compiled.clone(),
					None => match CompiledMatchers::compile(&silence.matchers) {
						Ok(compiled) => {
							let compiled = Arc::new(compiled);
							cache.insert(silence.id, compiled.clone());
							compiled
						}
						Err(err) => {
							warn!(silence = %silence.name, "skipping malformed silence: {err}");
							continue;
						}
					},
				}
			};

			if matchers.matches(&event.labels) {
				info!(
					fingerprint = %event.fingerprint,
					silence = %silence.name,
					"alert is silenced"
				);
				return Ok(true);
			}
		}

		Ok(false)
	}

	async fn direct_send(
		&self,
		event: &AlertEvent,
		rule: &Rule,
		is_recovery: bool,
		now: DateTime<Utc>,
	) -> Result<()> {
		// The fingerprint lock keeps concurrent replicas from double
		// sending; losing the race just skips this attempt.
		let Some(guard) = self.locks.try_acquire_alert(&event.fingerprint).await? else {
			debug!(fingerprint = %event.fingerprint, "another replica is sending this alert");
			return Ok(());
		};

		if !is_recovery
			&& let Some(last_sent) = event.last_sent_at
			&& (now - last_sent).num_seconds() < DIRECT_SEND_MIN_INTERVAL
		{
			debug!(fingerprint = %event.fingerprint, "below direct-send interval, skipping");
			guard.release().await;
			return Ok(());
		}

		let (_, group_labels) = Grouper::derive_group_key(rule, &event.labels);
		let snapshot = AlertSnapshot::from(event);
		let outcome = self
			.dispatcher
			.dispatch(
				std::slice::from_ref(&snapshot),
				&group_labels,
				rule,
				is_recovery,
			)
			.await;

		if outcome.is_ok()
			&& let Err(err) = self
				.events
				.mark_sent(std::slice::from_ref(&event.fingerprint), now)
				.await
		{
			warn!(fingerprint = %event.fingerprint, "failed to stamp last_sent_at: {err}");
		}
		guard.release().await;
		outcome
	}
}

#[async_trait]
impl LifecycleSink for AlertRouter {
	async fn alert_fired(
		&self,
		event: &AlertEvent,
		rule: &Rule,
		now: DateTime<Utc>,
	) -> Result<()> {
		if self.is_silenced(event, now).await? {
			return Ok(());
		}

		if rule.route_config.enable_grouping {
			let group_key = self.grouper.add_firing(event, rule, now).await?;
			debug!(fingerprint = %event.fingerprint, %group_key, "alert added to group");
			Ok(())
		} else {
			self.direct_send(event, rule, false, now).await
		}
	}

	async fn alert_resolved(
		&self,
		event: &AlertEvent,
		rule: &Rule,
		now: DateTime<Utc>,
	) -> Result<()> {
		// Whatever happens next, a recovered alert must not linger in
		// firing groups where a repeat send would re-announce it.
		self.grouper.remove_fingerprint(&event.fingerprint).await?;

		if rule.route_config.enable_grouping && rule.route_config.enable_recovery_grouping {
			let group_key = self.grouper.add_recovery(event, rule, now).await?;
			debug!(fingerprint = %event.fingerprint, %group_key, "recovery added to group");
			Ok(())
		} else {
			self.direct_send(event, rule, true, now).await
		}
	}
}
