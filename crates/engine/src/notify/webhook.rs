use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{AlertSnapshot, Labels};
use crate::notify::{SendContext, render, CHANNEL_TIMEOUT};
use crate::templates;

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
	pub url: String,
	#[serde(default = "WebhookConfig::default_method")]
	pub method: String,
	#[serde(default)]
	pub headers: std::collections::BTreeMap<String, String>,
	#[serde(default = "WebhookConfig::default_body_template")]
	pub body_template: String,
}

impl WebhookConfig {
	fn default_method() -> String {
		"POST".into()
	}

	fn default_body_template() -> String {
		"default".into()
	}
}

pub struct WebhookSender {
	pub config: WebhookConfig,
}

impl WebhookSender {
	pub async fn send(&self, ctx: &SendContext<'_>) -> Result<()> {
		let payload = build_payload(
			&self.config.body_template,
			ctx.alerts,
			ctx.group_labels,
			ctx.is_recovery,
		);

		let request = match self.config.method.to_uppercase().as_str() {
			"POST" => ctx.http.post(&self.config.url),
			"PUT" => ctx.http.put(&self.config.url),
			other => {
				return Err(Error::Config(format!(
					"unsupported webhook method {other:?}"
				)));
			}
		};

		let mut request = request.timeout(CHANNEL_TIMEOUT).json(&payload);
		for (name, value) in &self.config.headers {
			request = request.header(name, value);
		}

		debug!(url = %self.config.url, alerts = ctx.alerts.len(), "posting webhook");
		request.send().await?.error_for_status()?;
		Ok(())
	}
}

/// The default payload mirrors the alertmanager webhook shape. A custom
/// `body_template` is rendered with the substitution engine against the
/// first alert and must produce valid JSON; otherwise the default payload
/// is substituted.
pub fn build_payload(
	body_template: &str,
	alerts: &[AlertSnapshot],
	group_labels: &Labels,
	is_recovery: bool,
) -> serde_json::Value {
	if body_template != "default" {
		let first = &alerts[0];
		let rendered = templates::render(body_template, &first.labels, first.value);
		match serde_json::from_str(&rendered) {
			Ok(payload) => return payload,
			Err(err) => {
				warn!("webhook body template produced invalid JSON, using default payload: {err}");
			}
		}
	}

	default_payload(alerts, group_labels, is_recovery)
}

fn default_payload(
	alerts: &[AlertSnapshot],
	group_labels: &Labels,
	is_recovery: bool,
) -> serde_json::Value {
	json!({
		"status": if is_recovery { "resolved" } else { "firing" },
		"groupLabels": group_labels,
		"commonLabels": render::common_labels(alerts),
		"alerts": alerts
			.iter()
			.map(|alert| json!({
				"fingerprint": alert.fingerprint,
				"status": alert.status,
				"labels": alert.labels,
				"annotations": render::annotations(alert),
				"startsAt": alert.started_at,
				"value": alert.value,
			}))
			.collect::<Vec<_>>(),
	})
}
