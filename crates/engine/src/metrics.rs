//! Prometheus metrics for the engine.
//!
//! Tracks the following metrics:
//! - `vigil_rules_evaluated_total`: Rule evaluations performed (counter)
//! - `vigil_eval_failures_total`: Rule evaluations that failed (counter)
//! - `vigil_alerts_firing`: Alerts currently firing (gauge)
//! - `vigil_groups_sent_total`: Alert groups dispatched (counter)
//! - `vigil_notifications_sent_total`: Channel sends that succeeded (counter)
//! - `vigil_notifications_failed_total`: Channel sends that failed (counter)

use std::sync::OnceLock;

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use crate::error::{Error, Result};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static RULES_EVALUATED_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static EVAL_FAILURES_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static ALERTS_FIRING: OnceLock<IntGauge> = OnceLock::new();
static GROUPS_SENT_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static NOTIFICATIONS_SENT_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static NOTIFICATIONS_FAILED_TOTAL: OnceLock<IntCounter> = OnceLock::new();

pub fn init_metrics() {
	if REGISTRY.get().is_some() {
		return;
	}

	let registry = Registry::new();

	let rules_evaluated = IntCounter::new(
		"vigil_rules_evaluated_total",
		"Rule evaluations performed",
	)
	.expect("failed to create rules_evaluated metric");
	let eval_failures = IntCounter::new(
		"vigil_eval_failures_total",
		"Rule evaluations that failed",
	)
	.expect("failed to create eval_failures metric");
	let alerts_firing =
		IntGauge::new("vigil_alerts_firing", "Alerts currently firing")
			.expect("failed to create alerts_firing metric");
	let groups_sent = IntCounter::new(
		"vigil_groups_sent_total",
		"Alert groups dispatched",
	)
	.expect("failed to create groups_sent metric");
	let notifications_sent = IntCounter::new(
		"vigil_notifications_sent_total",
		"Channel sends that succeeded",
	)
	.expect("failed to create notifications_sent metric");
	let notifications_failed = IntCounter::new(
		"vigil_notifications_failed_total",
		"Channel sends that failed",
	)
	.expect("failed to create notifications_failed metric");

	for metric in [
		Box::new(rules_evaluated.clone()) as Box<dyn prometheus::core::Collector>,
		Box::new(eval_failures.clone()),
		Box::new(alerts_firing.clone()),
		Box::new(groups_sent.clone()),
		Box::new(notifications_sent.clone()),
		Box::new(notifications_failed.clone()),
	] {
		registry
			.register(metric)
			.expect("failed to register metric");
	}

	let _ = REGISTRY.set(registry);
	let _ = RULES_EVALUATED_TOTAL.set(rules_evaluated);
	let _ = EVAL_FAILURES_TOTAL.set(eval_failures);
	let _ = ALERTS_FIRING.set(alerts_firing);
	let _ = GROUPS_SENT_TOTAL.set(groups_sent);
	let _ = NOTIFICATIONS_SENT_TOTAL.set(notifications_sent);
	let _ = NOTIFICATIONS_FAILED_TOTAL.set(notifications_failed);
}

pub fn inc_rules_evaluated() {
	if let Some(metric) = RULES_EVALUATED_TOTAL.get() {
		metric.inc();
	}
}

pub fn inc_eval_failures() {
	if let Some(metric) = EVAL_FAILURES_TOTAL.get() {
		metric.inc();
	}
}

pub fn set_alerts_firing(count: usize) {
	if let Some(metric) = ALERTS_FIRING.get() {
		metric.set(count as i64);
	}
}

pub fn inc_groups_sent() {
	if let Some(metric) = GROUPS_SENT_TOTAL.get() {
		metric.inc();
	}
}

pub fn inc_notifications_sent() {
	if let Some(metric) = NOTIFICATIONS_SENT_TOTAL.get() {
		metric.inc();
	}
}

pub fn inc_notifications_failed() {
	if let Some(metric) = NOTIFICATIONS_FAILED_TOTAL.get() {
		metric.inc();
	}
}

pub fn gather_metrics() -> Result<String> {
	let registry = REGISTRY
		.get()
		.ok_or_else(|| Error::Config("metrics not initialized".into()))?;
	let metric_families = registry.gather();
	let encoder = TextEncoder::new();
	let mut buffer = Vec::new();
	encoder
		.encode(&metric_families, &mut buffer)
		.map_err(|err| Error::Config(format!("encoding metrics: {err}")))?;
	String::from_utf8(buffer).map_err(|err| Error::Config(format!("metrics not utf-8: {err}")))
}
