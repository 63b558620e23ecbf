//! Rule evaluation: one independent tick per enabled rule.
//!
//! Each tick queries the rule's data source, fingerprints the resulting
//! series, and drives the per-fingerprint state machine
//! (`pending → firing → resolved`). All state changes of a tick commit in
//! one batch; lifecycle events are routed only after the commit succeeds,
//! so a rolled-back tick emits nothing and the next tick retries naturally.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::datasource::SeriesSource;
use crate::error::Result;
use crate::fingerprint::{effective_labels, fingerprint};
use crate::metrics;
use crate::model::{AlertEvent, AlertEventHistory, AlertStatus, Rule};
use crate::repos::{DataSourceRepo, EventRepo, TickBatch};
use crate::templates::render_annotations;

/// Receiver of edge-triggered lifecycle events. `alert_fired` is emitted
/// exactly on the pending→firing transition, `alert_resolved` exactly on
/// the transition into resolved.
#[async_trait]
pub trait LifecycleSink: Send + Sync {
	async fn alert_fired(
		&self,
		event: &AlertEvent,
		rule: &Rule,
		now: DateTime<Utc>,
	) -> Result<()>;
	async fn alert_resolved(
		&self,
		event: &AlertEvent,
		rule: &Rule,
		now: DateTime<Utc>,
	) -> Result<()>;
}

pub struct RuleEvaluator {
	source: Arc<dyn SeriesSource>,
	datasources: Arc<dyn DataSourceRepo>,
	events: Arc<dyn EventRepo>,
	sink: Arc<dyn LifecycleSink>,
}

impl RuleEvaluator {
	pub fn new(
		source: Arc<dyn SeriesSource>,
		datasources: Arc<dyn DataSourceRepo>,
		events: Arc<dyn EventRepo>,
		sink: Arc<dyn LifecycleSink>,
	) -> Self {
		Self {
			source,
			datasources,
			events,
			sink,
		}
	}

	pub async fn evaluate_rule(&self, rule: &Rule, now: DateTime<Utc>) -> Result<()> {
		let Some(datasource) = self.datasources.enabled_by_id(rule.datasource_id).await?
		else {
			warn!(rule = %rule.name, datasource_id = rule.datasource_id, "data source unavailable");
			return Ok(());
		};

		// A query failure makes this tick a no-op for the rule: no
		// transitions, in particular no resolves from a blind tick.
		let samples = match self.source.query(&datasource, &rule.expr).await {
			Ok(samples) => samples,
			Err(err) => {
				warn!(rule = %rule.name, "data source query failed: {err}");
				metrics::inc_eval_failures();
				return Err(err);
			}
		};

		// Fingerprint the series; two series with identical effective
		// labels collapse onto one event.
		let mut candidates = HashMap::new();
		for sample in samples {
			let labels = effective_labels(&datasource.extra_labels, &sample.labels, &rule.labels);
			let fp = fingerprint(rule.id, &labels);
			candidates.insert(fp, (labels, sample.value));
		}

		let existing: HashMap<String, AlertEvent> = self
			.events
			.active_for_rule(rule.id)
			.await?
			.into_iter()
			.map(|event| (event.fingerprint.clone(), event))
			.collect();

		let mut batch = TickBatch::default();
		let mut fired = Vec::new();
		let mut resolved = Vec::new();
		let mut seen = HashSet::new();

		for (fp, (labels, value)) in candidates {
			seen.insert(fp.clone());

			match existing.get(&fp) {
				Some(prior) => {
					let mut event = prior.clone();
					event.last_eval_at = now;
					event.value = value;
					event.annotations = render_annotations(&rule.annotations, &labels, value);

					match event.status {
						// A lingering resolved row reactivates through
						// pending with a fresh start time.
						AlertStatus::Resolved => {
							event.status = AlertStatus::Pending;
							event.started_at = now;
						}
						AlertStatus::Pending => {
							if (now - event.started_at).num_seconds() >= rule.for_duration {
								event.status = AlertStatus::Firing;
								info!(
									rule = %rule.name,
									fingerprint = %event.fingerprint,
									"alert firing"
								);
								fired.push(event.clone());
							}
						}
						AlertStatus::Firing => {}
					}

					batch.upserts.push(event);
				}
				None => {
					debug!(rule = %rule.name, fingerprint = %fp, "new pending alert");
					batch.upserts.push(AlertEvent {
						fingerprint: fp,
						rule_id: rule.id,
						rule_name: rule.name.clone(),
						status: AlertStatus::Pending,
						severity: rule.severity.clone(),
						started_at: now,
						last_eval_at: now,
						last_sent_at: None,
						value,
						annotations: render_annotations(&rule.annotations, &labels, value),
						labels,
						expr: rule.expr.clone(),
						tenant_id: rule.tenant_id,
						project_id: rule.project_id,
					});
				}
			}
		}

		// Active alerts whose series vanished this tick resolve and move
		// to history.
		for (fp, prior) in &existing {
			if seen.contains(fp)
				|| !matches!(prior.status, AlertStatus::Pending | AlertStatus::Firing)
			{
				continue;
			}

			let mut event = prior.clone();
			event.status = AlertStatus::Resolved;
			event.last_eval_at = now;
			info!(rule = %rule.name, fingerprint = %fp, "alert resolved");

			batch.archives.push(AlertEventHistory::archive(&event, now));
			resolved.push(event);
		}

		self.events.commit_tick(batch).await?;
		metrics::inc_rules_evaluated();

		for event in &fired {
			if let Err(err) = self.sink.alert_fired(event, rule, now).await {
				warn!(fingerprint = %event.fingerprint, "routing fire event failed: {err}");
			}
		}
		for event in &resolved {
			if let Err(err) = self.sink.alert_resolved(event, rule, now).await {
				warn!(fingerprint = %event.fingerprint, "routing resolve event failed: {err}");
			}
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;
	use std::sync::Mutex;

	use super::*;
	use crate::datasource::Sample;
	use crate::error::Error;
	use crate::model::{DataSource, Labels};
	use crate::repos::memory::{MemoryDataSources, MemoryEvents};

	/// Programmable data source: a queue of responses, one per tick.
	#[derive(Default)]
	struct StubSource {
		responses: Mutex<Vec<Result<Vec<Sample>>>>,
	}

	impl StubSource {
		fn push(&self, response: Result<Vec<Sample>>) {
			self.responses.lock().unwrap().push(response);
		}
	}

	#[async_trait]
	impl SeriesSource for StubSource {
		async fn query(&self, _: &DataSource, _: &str) -> Result<Vec<Sample>> {
			let mut responses = self.responses.lock().unwrap();
			if responses.is_empty() {
				Ok(Vec::new())
			} else {
				responses.remove(0)
			}
		}
	}

	#[derive(Default)]
	struct RecordingSink {
		fired: Mutex<Vec<String>>,
		resolved: Mutex<Vec<String>>,
	}

	#[async_trait]
	impl LifecycleSink for RecordingSink {
		async fn alert_fired(
			&self,
			event: &AlertEvent,
			_: &Rule,
			_: DateTime<Utc>,
		) -> Result<()> {
			self.fired.lock().unwrap().push(event.fingerprint.clone());
			Ok(())
		}

		async fn alert_resolved(
			&self,
			event: &AlertEvent,
			_: &Rule,
			_: DateTime<Utc>,
		) -> Result<()> {
			self.resolved.lock().unwrap().push(event.fingerprint.clone());
			Ok(())
		}
	}

	struct Fixture {
		source: Arc<StubSource>,
		events: Arc<MemoryEvents>,
		sink: Arc<RecordingSink>,
		evaluator: RuleEvaluator,
		rule: Rule,
	}

	fn fixture(for_duration: i64) -> Fixture {
		let source = Arc::new(StubSource::default());
		let events = Arc::new(MemoryEvents::new());
		let sink = Arc::new(RecordingSink::default());
		let datasources = Arc::new(MemoryDataSources::new(vec![DataSource {
			id: 1,
			name: "prom".into(),
			kind: "prometheus".into(),
			url: "http://prom:9090".into(),
			auth: Default::default(),
			http: Default::default(),
			extra_labels: Labels::new(),
			is_enabled: true,
			tenant_id: 1,
			project_id: None,
		}]));

		let evaluator = RuleEvaluator::new(
			source.clone(),
			datasources,
			events.clone(),
			sink.clone(),
		);

		let rule = Rule {
			id: 1,
			name: "HighCPU".into(),
			expr: "cpu > 90".into(),
			eval_interval: 15,
			for_duration,
			severity: "critical".into(),
			labels: Labels::new(),
			annotations: BTreeMap::new(),
			route_config: Default::default(),
			datasource_id: 1,
			tenant_id: 1,
			project_id: None,
			is_enabled: true,
		};

		Fixture {
			source,
			events,
			sink,
			evaluator,
			rule,
		}
	}

	fn sample(instance: &str, value: f64) -> Sample {
		Sample {
			labels: [("instance".to_string(), instance.to_string())].into(),
			value,
			timestamp: 0.0,
		}
	}

	#[tokio::test]
	async fn new_series_creates_pending_event() {
		let f = fixture(60);
		let t0 = Utc::now();

		f.source.push(Ok(vec![sample("a", 5.0)]));
		f.evaluator.evaluate_rule(&f.rule, t0).await.unwrap();

		let active = f.events.active();
		assert_eq!(active.len(), 1);
		assert_eq!(active[0].status, AlertStatus::Pending);
		assert_eq!(active[0].started_at, t0);
		assert_eq!(active[0].last_eval_at, t0);
		assert!(f.sink.fired.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn pending_fires_only_after_for_duration() {
		let f = fixture(60);
		let t0 = Utc::now();

		for offset in [0, 15, 30, 45, 59] {
			f.source.push(Ok(vec![sample("a", 5.0)]));
			f.evaluator
				.evaluate_rule(&f.rule, t0 + chrono::Duration::seconds(offset))
				.await
				.unwrap();
			assert_eq!(
				f.events.active()[0].status,
				AlertStatus::Pending,
				"still pending at t+{offset}"
			);
		}

		f.source.push(Ok(vec![sample("a", 5.0)]));
		f.evaluator
			.evaluate_rule(&f.rule, t0 + chrono::Duration::seconds(60))
			.await
			.unwrap();

		let active = f.events.active();
		assert_eq!(active[0].status, AlertStatus::Firing);
		assert_eq!(active[0].started_at, t0);
		assert_eq!(f.sink.fired.lock().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn firing_stays_firing_and_updates_value() {
		let f = fixture(0);
		let t0 = Utc::now();

		f.source.push(Ok(vec![sample("a", 5.0)]));
		f.evaluator.evaluate_rule(&f.rule, t0).await.unwrap();
		f.source.push(Ok(vec![sample("a", 6.0)]));
		f.evaluator
			.evaluate_rule(&f.rule, t0 + chrono::Duration::seconds(15))
			.await
			.unwrap();

		// Fired on the second tick; a third tick keeps it firing.
		f.source.push(Ok(vec![sample("a", 7.5)]));
		f.evaluator
			.evaluate_rule(&f.rule, t0 + chrono::Duration::seconds(30))
			.await
			.unwrap();

		let active = f.events.active();
		assert_eq!(active[0].status, AlertStatus::Firing);
		assert_eq!(active[0].value, 7.5);
		assert_eq!(f.sink.fired.lock().unwrap().len(), 1, "fire is edge-triggered");
	}

	#[tokio::test]
	async fn vanished_series_resolves_and_archives() {
		let f = fixture(0);
		let t0 = Utc::now();

		f.source.push(Ok(vec![sample("a", 5.0)]));
		f.evaluator.evaluate_rule(&f.rule, t0).await.unwrap();
		f.source.push(Ok(vec![sample("a", 5.0)]));
		f.evaluator
			.evaluate_rule(&f.rule, t0 + chrono::Duration::seconds(15))
			.await
			.unwrap();

		f.source.push(Ok(vec![]));
		f.evaluator
			.evaluate_rule(&f.rule, t0 + chrono::Duration::seconds(120))
			.await
			.unwrap();

		assert!(f.events.active().is_empty());
		let history = f.events.history();
		assert_eq!(history.len(), 1);
		assert_eq!(history[0].status, AlertStatus::Resolved);
		assert_eq!(history[0].duration_secs, 120);
		assert_eq!(f.sink.resolved.lock().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn query_error_makes_the_tick_a_noop() {
		let f = fixture(0);
		let t0 = Utc::now();

		f.source.push(Ok(vec![sample("a", 5.0)]));
		f.evaluator.evaluate_rule(&f.rule, t0).await.unwrap();
		f.source.push(Ok(vec![sample("a", 5.0)]));
		f.evaluator
			.evaluate_rule(&f.rule, t0 + chrono::Duration::seconds(15))
			.await
			.unwrap();

		// The outage tick must not resolve the firing alert.
		f.source.push(Err(Error::Query("connection refused".into())));
		let result = f
			.evaluator
			.evaluate_rule(&f.rule, t0 + chrono::Duration::seconds(30))
			.await;
		assert!(result.is_err());

		let active = f.events.active();
		assert_eq!(active.len(), 1);
		assert_eq!(active[0].status, AlertStatus::Firing);
		assert!(f.sink.resolved.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn annotations_render_on_creation_and_update() {
		let mut f = fixture(0);
		f.rule.annotations.insert(
			"summary".into(),
			"{{ $labels.instance }} at {{ $value }}".into(),
		);
		let t0 = Utc::now();

		f.source.push(Ok(vec![sample("a", 5.0)]));
		f.evaluator.evaluate_rule(&f.rule, t0).await.unwrap();
		assert_eq!(f.events.active()[0].annotations["summary"], "a at 5");

		f.source.push(Ok(vec![sample("a", 9.0)]));
		f.evaluator
			.evaluate_rule(&f.rule, t0 + chrono::Duration::seconds(15))
			.await
			.unwrap();
		assert_eq!(f.events.active()[0].annotations["summary"], "a at 9");
	}

	#[tokio::test]
	async fn reactivation_resets_started_at_and_goes_through_pending() {
		let f = fixture(60);
		let t0 = Utc::now();

		f.source.push(Ok(vec![sample("a", 5.0)]));
		f.evaluator.evaluate_rule(&f.rule, t0).await.unwrap();
		f.source.push(Ok(vec![]));
		f.evaluator
			.evaluate_rule(&f.rule, t0 + chrono::Duration::seconds(15))
			.await
			.unwrap();
		assert!(f.events.active().is_empty());

		// Series returns: a fresh pending event with a new start time.
		let t2 = t0 + chrono::Duration::seconds(300);
		f.source.push(Ok(vec![sample("a", 5.0)]));
		f.evaluator.evaluate_rule(&f.rule, t2).await.unwrap();

		let active = f.events.active();
		assert_eq!(active.len(), 1);
		assert_eq!(active[0].status, AlertStatus::Pending);
		assert_eq!(active[0].started_at, t2);
	}

	#[tokio::test]
	async fn identical_effective_labels_collapse_to_one_event() {
		let f = fixture(0);
		let t0 = Utc::now();

		f.source
			.push(Ok(vec![sample("a", 5.0), sample("a", 6.0)]));
		f.evaluator.evaluate_rule(&f.rule, t0).await.unwrap();
		assert_eq!(f.events.active().len(), 1);
	}
}
