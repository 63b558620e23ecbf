//! End-to-end lifecycle scenarios: evaluation → grouping → worker →
//! webhook delivery, against in-memory collaborators and a local HTTP sink.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::Json;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use vigil_engine::datasource::{Sample, SeriesSource};
use vigil_engine::error::Result;
use vigil_engine::evaluator::RuleEvaluator;
use vigil_engine::grouper::{Grouper, GroupingConfig};
use vigil_engine::kv::MemoryKv;
use vigil_engine::lock::LockManager;
use vigil_engine::model::{
	AlertStatus, ChannelKind, DataSource, FilterConfig, Labels, MatchOp, Matcher,
	NotificationChannel, RouteConfig, Rule, SendStatus, SilenceRule,
};
use vigil_engine::notify::Dispatcher;
use vigil_engine::repos::memory::{
	MemoryChannels, MemoryDataSources, MemoryEvents, MemoryRecords, MemoryRules,
	MemorySettings, MemorySilences,
};
use vigil_engine::router::AlertRouter;
use vigil_engine::scheduler::{Scheduler, SchedulerConfig};

/// Programmable data source: one queued response per evaluation tick.
#[derive(Default)]
struct StubSource {
	responses: Mutex<Vec<Vec<Sample>>>,
}

impl StubSource {
	fn push(&self, samples: Vec<Sample>) {
		self.responses.lock().unwrap().push(samples);
	}
}

#[async_trait]
impl SeriesSource for StubSource {
	async fn query(&self, _: &DataSource, _: &str) -> Result<Vec<Sample>> {
		let mut responses = self.responses.lock().unwrap();
		if responses.is_empty() {
			Ok(Vec::new())
		} else {
			Ok(responses.remove(0))
		}
	}
}

fn sample(instance: &str, value: f64) -> Sample {
	Sample {
		labels: [("instance".to_string(), instance.to_string())].into(),
		value,
		timestamp: 0.0,
	}
}

/// Local HTTP endpoint collecting webhook payloads.
async fn spawn_webhook_sink() -> (String, Arc<Mutex<Vec<serde_json::Value>>>) {
	let received: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));
	let sink = received.clone();

	let app = Router::new().route(
		"/hook",
		post(move |Json(body): Json<serde_json::Value>| {
			let sink = sink.clone();
			async move {
				sink.lock().unwrap().push(body);
				StatusCode::OK
			}
		}),
	);

	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		axum::serve(listener, app).await.unwrap();
	});

	(format!("http://{addr}/hook"), received)
}

struct Harness {
	source: Arc<StubSource>,
	events: Arc<MemoryEvents>,
	records: Arc<MemoryRecords>,
	grouper: Arc<Grouper>,
	evaluator: Arc<RuleEvaluator>,
	scheduler: Arc<Scheduler>,
	rule: Rule,
}

fn rule(webhook_channel: bool) -> Rule {
	Rule {
		id: 1,
		name: "HighCPU".into(),
		expr: "cpu > 90".into(),
		eval_interval: 15,
		for_duration: 60,
		severity: "critical".into(),
		labels: Labels::new(),
		annotations: BTreeMap::new(),
		route_config: RouteConfig {
			group_by: vec!["instance".into()],
			notification_channels: if webhook_channel { vec![1] } else { vec![] },
			enable_grouping: true,
			enable_recovery_grouping: true,
		},
		datasource_id: 1,
		tenant_id: 1,
		project_id: None,
		is_enabled: true,
	}
}

fn harness(rule: Rule, webhook_url: Option<&str>, silences: Vec<SilenceRule>) -> Harness {
	let source = Arc::new(StubSource::default());
	let events = Arc::new(MemoryEvents::new());
	let records = Arc::new(MemoryRecords::new());

	let channels = match webhook_url {
		Some(url) => vec![NotificationChannel {
			id: 1,
			name: "hook".into(),
			kind: ChannelKind::Webhook,
			config: serde_json::json!({"url": url}),
			filter_config: FilterConfig::default(),
			is_enabled: true,
			is_default: false,
			tenant_id: 1,
			project_id: None,
		}],
		None => Vec::new(),
	};

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

	let kv = Arc::new(MemoryKv::new());
	let grouper = Arc::new(Grouper::new(kv.clone(), GroupingConfig::default()));
	let locks = LockManager::new(kv);
	let dispatcher = Arc::new(Dispatcher::new(
		Arc::new(MemoryChannels::new(channels)),
		records.clone(),
		Arc::new(MemorySettings::default()),
		reqwest::Client::new(),
	));
	let router = Arc::new(AlertRouter::new(
		grouper.clone(),
		dispatcher.clone(),
		Arc::new(MemorySilences::new(silences)),
		events.clone(),
		locks.clone(),
	));
	let evaluator = Arc::new(RuleEvaluator::new(
		source.clone(),
		datasources,
		events.clone(),
		router,
	));

	let rules = Arc::new(MemoryRules::new(vec![rule.clone()]));
	let scheduler = Scheduler::new(
		rules,
		events.clone(),
		evaluator.clone(),
		grouper.clone(),
		dispatcher,
		locks,
		SchedulerConfig::default(),
		CancellationToken::new(),
	);

	Harness {
		source,
		events,
		records,
		grouper,
		evaluator,
		scheduler,
		rule,
	}
}

async fn wait_for<F: Fn() -> bool>(condition: F, what: &str) {
	for _ in 0..200 {
		if condition() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn pending_then_fire_then_grouped_webhook_delivery() {
	let (url, received) = spawn_webhook_sink().await;
	let h = harness(rule(true), Some(&url), Vec::new());
	let t0 = Utc::now();

	// Ticks at t=0..45 leave the alert pending.
	for offset in [0, 15, 30, 45] {
		h.source.push(vec![sample("a", 5.0)]);
		h.evaluator
			.evaluate_rule(&h.rule, t0 + chrono::Duration::seconds(offset))
			.await
			.unwrap();
	}
	let active = h.events.active();
	assert_eq!(active.len(), 1);
	assert_eq!(active[0].status, AlertStatus::Pending);

	// t=60: for_duration reached, alert fires and lands in its group.
	let t_fire = t0 + chrono::Duration::seconds(60);
	h.source.push(vec![sample("a", 5.0)]);
	h.evaluator.evaluate_rule(&h.rule, t_fire).await.unwrap();
	assert_eq!(h.events.active()[0].status, AlertStatus::Firing);

	let stats = h.grouper.stats().await.unwrap();
	assert_eq!(stats.firing_groups, 1);
	assert_eq!(stats.pending_groups, 1);

	// Before group_wait elapses the worker must not send.
	h.scheduler
		.clone()
		.worker_tick(t_fire + chrono::Duration::seconds(5))
		.await
		.unwrap();
	tokio::time::sleep(Duration::from_millis(50)).await;
	assert!(received.lock().unwrap().is_empty());

	// t=75: group_wait elapsed, the worker dispatches.
	h.scheduler
		.clone()
		.worker_tick(t_fire + chrono::Duration::seconds(15))
		.await
		.unwrap();
	wait_for(|| !received.lock().unwrap().is_empty(), "webhook delivery").await;

	// Alertmanager-shaped default payload.
	let payload = received.lock().unwrap()[0].clone();
	assert_eq!(payload["status"], "firing");
	assert_eq!(payload["groupLabels"]["alertname"], "HighCPU");
	assert_eq!(payload["groupLabels"]["instance"], "a");
	assert_eq!(payload["alerts"].as_array().unwrap().len(), 1);
	let alert = &payload["alerts"][0];
	assert!(alert["fingerprint"].is_string());
	assert!(alert["startsAt"].is_string());
	assert_eq!(alert["value"], 5.0);

	// One success record per (channel, alert).
	wait_for(|| !h.records.all().is_empty(), "notification record").await;
	let records = h.records.all();
	assert_eq!(records.len(), 1);
	assert_eq!(records[0].status, SendStatus::Success);
	assert_eq!(records[0].channel_kind, ChannelKind::Webhook);

	// The group survives as sent, and the event got its send stamp.
	wait_for(
		|| h.events.active()[0].last_sent_at.is_some(),
		"last_sent_at stamp",
	)
	.await;
	let mut sent = 0;
	for _ in 0..200 {
		sent = h.grouper.stats().await.unwrap().sent_groups;
		if sent == 1 {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	assert_eq!(sent, 1, "group must be kept and marked sent");
}

#[tokio::test]
async fn active_silence_suppresses_the_send_path() {
	let (url, received) = spawn_webhook_sink().await;
	let t0 = Utc::now();

	let silence = SilenceRule {
		id: 1,
		name: "maintenance".into(),
		matchers: vec![Matcher {
			label: "instance".into(),
			op: MatchOp::Eq,
			value: "a".into(),
		}],
		starts_at: t0 - chrono::Duration::hours(1),
		ends_at: t0 + chrono::Duration::hours(1),
		is_enabled: true,
		tenant_id: 1,
		project_id: None,
	};
	let h = harness(rule(true), Some(&url), vec![silence]);

	h.source.push(vec![sample("a", 5.0)]);
	h.evaluator.evaluate_rule(&h.rule, t0).await.unwrap();
	let t_fire = t0 + chrono::Duration::seconds(60);
	h.source.push(vec![sample("a", 5.0)]);
	h.evaluator.evaluate_rule(&h.rule, t_fire).await.unwrap();

	// The alert fired but the silence short-circuits before grouping.
	assert_eq!(h.events.active()[0].status, AlertStatus::Firing);
	let stats = h.grouper.stats().await.unwrap();
	assert_eq!(stats.total_groups, 0);

	h.scheduler
		.clone()
		.worker_tick(t_fire + chrono::Duration::seconds(15))
		.await
		.unwrap();
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert!(received.lock().unwrap().is_empty());
	assert!(h.records.all().is_empty());
}

#[tokio::test]
async fn recovery_archives_regroups_and_sends_once() {
	let (url, received) = spawn_webhook_sink().await;
	let h = harness(rule(true), Some(&url), Vec::new());
	let t0 = Utc::now();

	h.source.push(vec![sample("a", 5.0)]);
	h.evaluator.evaluate_rule(&h.rule, t0).await.unwrap();
	let t_fire = t0 + chrono::Duration::seconds(60);
	h.source.push(vec![sample("a", 5.0)]);
	h.evaluator.evaluate_rule(&h.rule, t_fire).await.unwrap();

	// t=120: the series vanishes; the alert resolves.
	let t_resolve = t0 + chrono::Duration::seconds(120);
	h.source.push(Vec::new());
	h.evaluator.evaluate_rule(&h.rule, t_resolve).await.unwrap();

	assert!(h.events.active().is_empty());
	let history = h.events.history();
	assert_eq!(history.len(), 1);
	assert_eq!(history[0].duration_secs, 120);

	// The fingerprint left the firing side and sits in a recovery group.
	let stats = h.grouper.stats().await.unwrap();
	assert_eq!(stats.firing_groups, 0);
	assert_eq!(stats.recovery_groups, 1);

	// t=130: recovery group is ready; recovery groups are one-shot.
	h.scheduler
		.clone()
		.worker_tick(t_resolve + chrono::Duration::seconds(10))
		.await
		.unwrap();
	wait_for(|| !received.lock().unwrap().is_empty(), "recovery delivery").await;

	let payload = received.lock().unwrap()[0].clone();
	assert_eq!(payload["status"], "resolved");

	// Deleted after the successful send.
	let mut deleted = false;
	for _ in 0..200 {
		if h.grouper.stats().await.unwrap().total_groups == 0 {
			deleted = true;
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	assert!(deleted, "recovery group must be deleted after its send");
}

#[tokio::test]
async fn continuously_firing_group_repeats_after_repeat_interval() {
	let (url, received) = spawn_webhook_sink().await;
	let h = harness(rule(true), Some(&url), Vec::new());
	let t0 = Utc::now();

	h.source.push(vec![sample("a", 5.0)]);
	h.evaluator.evaluate_rule(&h.rule, t0).await.unwrap();
	let t_fire = t0 + chrono::Duration::seconds(60);
	h.source.push(vec![sample("a", 5.0)]);
	h.evaluator.evaluate_rule(&h.rule, t_fire).await.unwrap();

	// First send once group_wait elapses.
	let t_send = t_fire + chrono::Duration::seconds(10);
	h.scheduler.clone().worker_tick(t_send).await.unwrap();
	wait_for(|| received.lock().unwrap().len() == 1, "first send").await;
	for _ in 0..200 {
		if h.grouper.stats().await.unwrap().sent_groups == 1 {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}

	// Just before repeat_interval: nothing.
	h.scheduler
		.clone()
		.worker_tick(t_send + chrono::Duration::seconds(3599))
		.await
		.unwrap();
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert_eq!(received.lock().unwrap().len(), 1);

	// At repeat_interval: the still-firing group goes out again.
	h.scheduler
		.clone()
		.worker_tick(t_send + chrono::Duration::seconds(3600))
		.await
		.unwrap();
	wait_for(|| received.lock().unwrap().len() == 2, "repeat send").await;
}
