//! Periodic driving of the engine: the evaluation tick and the grouping
//! worker.
//!
//! The evaluation loop fans out one task per enabled rule; each task is
//! independent and failures are isolated to their iteration. The grouping
//! worker scans for ready groups, claims exclusive send rights per group
//! through the distributed lock, and dispatches. Shutdown cancels the loops
//! and then awaits in-flight tasks rather than aborting them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::evaluator::RuleEvaluator;
use crate::grouper::Grouper;
use crate::lock::LockManager;
use crate::metrics;
use crate::model::AlertGroup;
use crate::notify::Dispatcher;
use crate::repos::{EventRepo, RuleRepo};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
	/// Global fan-out tick for rule evaluation.
	pub eval_tick: Duration,
	/// Grouping worker tick.
	pub worker_tick: Duration,
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		Self {
			eval_tick: Duration::from_secs(15),
			worker_tick: Duration::from_secs(5),
		}
	}
}

pub struct Scheduler {
	rules: Arc<dyn RuleRepo>,
	events: Arc<dyn EventRepo>,
	evaluator: Arc<RuleEvaluator>,
	grouper: Arc<Grouper>,
	dispatcher: Arc<Dispatcher>,
	locks: LockManager,
	config: SchedulerConfig,
	shutdown: CancellationToken,
	tracker: TaskTracker,
	/// Last evaluation time per rule, for per-rule `eval_interval` gating.
	last_eval: Mutex<HashMap<i64, DateTime<Utc>>>,
}

impl Scheduler {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		rules: Arc<dyn RuleRepo>,
		events: Arc<dyn EventRepo>,
		evaluator: Arc<RuleEvaluator>,
		grouper: Arc<Grouper>,
		dispatcher: Arc<Dispatcher>,
		locks: LockManager,
		config: SchedulerConfig,
		shutdown: CancellationToken,
	) -> Arc<Self> {
		Arc::new(Self {
			rules,
			events,
			evaluator,
			grouper,
			dispatcher,
			locks,
			config,
			shutdown,
			tracker: TaskTracker::new(),
			last_eval: Mutex::new(HashMap::new()),
		})
	}

	pub async fn run(self: Arc<Self>) {
		// Small random delay so replicas started together do not all hit
		// the data sources at the same instant.
		let jitter = Duration::from_millis(rand::random::<u64>() % 5000);
		sleep(jitter).await;

		let mut eval_ticker = interval(self.config.eval_tick);
		eval_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
		let mut worker_ticker = interval(self.config.worker_tick);
		worker_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

		info!("scheduler started");

		loop {
			tokio::select! {
				_ = self.shutdown.cancelled() => {
					info!("scheduler received shutdown signal");
					break;
				}
				_ = eval_ticker.tick() => {
					self.evaluate_all(Utc::now()).await;
				}
				_ = worker_ticker.tick() => {
					if let Err(err) = self.clone().worker_tick(Utc::now()).await {
						error!("grouping worker iteration failed: {err}");
					}
				}
			}
		}

		// In-flight rule ticks and dispatches finish; nothing new starts.
		self.tracker.close();
		self.tracker.wait().await;
		info!("scheduler stopped");
	}

	/// Fan out one task per enabled rule whose own interval has elapsed.
	async fn evaluate_all(&self, now: DateTime<Utc>) {
		let rules = match self.rules.enabled().await {
			Ok(rules) => rules,
			Err(err) => {
				error!("failed to load rules: {err}");
				return;
			}
		};

		debug!(count = rules.len(), "evaluating rules");

		for rule in rules {
			if !self.rule_due(rule.id, rule.eval_interval, now) {
				continue;
			}

			let evaluator = self.evaluator.clone();
			self.tracker.spawn(async move {
				if let Err(err) = evaluator.evaluate_rule(&rule, now).await {
					error!(rule = %rule.name, "rule evaluation failed: {err}");
				}
			});
		}
	}

	fn rule_due(&self, rule_id: i64, eval_interval: i64, now: DateTime<Utc>) -> bool {
		let mut last_eval = self.last_eval.lock().expect("last_eval mutex poisoned");
		match last_eval.get(&rule_id) {
			Some(last) if (now - *last).num_seconds() < eval_interval => false,
			_ => {
				last_eval.insert(rule_id, now);
				true
			}
		}
	}

	/// One grouping-worker iteration: update stats, then dispatch every
	/// ready group under its send lock.
	pub async fn worker_tick(self: Arc<Self>, now: DateTime<Utc>) -> Result<()> {
		let stats = self.grouper.stats().await?;
		if stats.total_groups > 0 {
			debug!(
				total = stats.total_groups,
				firing = stats.firing_groups,
				recovery = stats.recovery_groups,
				alerts = stats.total_alerts,
				"group stats"
			);
		}
		metrics::set_alerts_firing(stats.firing_alerts);

		for (group, is_recovery) in self.grouper.ready_groups(now).await? {
			let scheduler = self.clone();
			self.tracker.spawn(async move {
				if let Err(err) = scheduler.send_group(&group, is_recovery, now).await {
					error!(group_key = %group.group_key, "failed to send group: {err}");
				}
			});
		}

		Ok(())
	}

	/// Claim the group's send lock and dispatch it. Replicas race on the
	/// lock; losing means another replica is already sending this group.
	async fn send_group(
		&self,
		group: &AlertGroup,
		is_recovery: bool,
		now: DateTime<Utc>,
	) -> Result<()> {
		let Some(guard) = self.locks.try_acquire_group(&group.group_key).await? else {
			debug!(group_key = %group.group_key, "group is being sent elsewhere");
			return Ok(());
		};

		let outcome = self.dispatch_group(group, is_recovery, now).await;
		guard.release().await;
		outcome
	}

	async fn dispatch_group(
		&self,
		group: &AlertGroup,
		is_recovery: bool,
		now: DateTime<Utc>,
	) -> Result<()> {
		let Some(rule) = self.rules.by_id(group.rule_id).await? else {
			// The rule is gone; drop the group instead of rescanning it
			// forever.
			warn!(group_key = %group.group_key, rule_id = group.rule_id, "group has no rule, dropping");
			self.grouper
				.delete_group(&group.group_key, is_recovery)
				.await?;
			return Ok(());
		};

		info!(
			group_key = %group.group_key,
			alerts = group.alerts.len(),
			is_recovery,
			"dispatching group"
		);
		self.dispatcher
			.dispatch(&group.alerts, &group.group_labels, &rule, is_recovery)
			.await?;

		let fingerprints: Vec<String> = group
			.alerts
			.iter()
			.map(|alert| alert.fingerprint.clone())
			.collect();
		self.events.mark_sent(&fingerprints, now).await?;
		metrics::inc_groups_sent();

		if is_recovery {
			// Recoveries are one-shot; re-announcing them is never useful.
			self.grouper
				.delete_group(&group.group_key, is_recovery)
				.await?;
		} else {
			self.grouper
				.mark_sent(&group.group_key, is_recovery, now)
				.await?;
		}

		Ok(())
	}
}
