use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::Result;
use crate::model::AlertSnapshot;
use crate::notify::{SendContext, render, CHANNEL_TIMEOUT};

const CARD_BATCH_LIMIT: usize = 10;

#[derive(Debug, Clone, Deserialize)]
pub struct FeishuConfig {
	pub webhook_url: String,
	#[serde(default = "FeishuConfig::default_card_type")]
	pub card_type: String,
}

impl FeishuConfig {
	fn default_card_type() -> String {
		"advanced".into()
	}
}

pub struct FeishuSender {
	pub config: FeishuConfig,
}

impl FeishuSender {
	pub async fn send(&self, ctx: &SendContext<'_>) -> Result<()> {
		let body = if self.config.card_type == "advanced" {
			if let [alert] = ctx.alerts {
				build_card(alert, ctx.is_recovery)
			} else {
				build_batch_card(ctx.alerts, ctx.is_recovery)
			}
		} else {
			let content = if let [alert] = ctx.alerts {
				render::alert_text(alert, ctx.is_recovery)
			} else {
				render::batch_text(ctx.alerts, ctx.is_recovery)
			};
			json!({"msg_type": "text", "content": {"text": content}})
		};

		debug!(url = %self.config.webhook_url, "posting feishu card");
		ctx.http
			.post(&self.config.webhook_url)
			.timeout(CHANNEL_TIMEOUT)
			.json(&body)
			.send()
			.await?
			.error_for_status()?;
		Ok(())
	}
}

/// Interactive card for a single alert: red header while firing, green on
/// recovery.
fn build_card(alert: &AlertSnapshot, is_recovery: bool) -> serde_json::Value {
	let (color, status_text) = header(is_recovery);

	let rendered = render::annotations(alert);
	let mut info = format!(
		"**告警名称**: {}\n**告警等级**: {}\n**当前值**: {}",
		alert.rule_name, alert.severity, alert.value
	);
	if let Some(summary) = rendered.get("summary") {
		info.push_str(&format!("\n\n**摘要**: {summary}"));
	}
	if let Some(description) = rendered.get("description") {
		info.push_str(&format!("\n**描述**: {description}"));
	}

	let labels_text = alert
		.labels
		.iter()
		.map(|(k, v)| format!("**{k}**: {v}"))
		.collect::<Vec<_>>()
		.join("\n");

	json!({
		"msg_type": "interactive",
		"card": {
			"config": {"wide_screen_mode": true},
			"header": {
				"title": {"content": format!("🔔 {status_text}"), "tag": "plain_text"},
				"template": color,
			},
			"elements": [
				{"tag": "div", "text": {"content": info, "tag": "lark_md"}},
				{"tag": "hr"},
				{"tag": "div", "text": {"content": format!("**标签**:\n{labels_text}"), "tag": "lark_md"}},
			],
		},
	})
}

/// Card for a multi-alert group, rendering at most ten items with an
/// overflow suffix.
fn build_batch_card(alerts: &[AlertSnapshot], is_recovery: bool) -> serde_json::Value {
	let (color, status_text) = header(is_recovery);
	let shown = alerts.len().min(CARD_BATCH_LIMIT);

	let mut elements = vec![
		json!({"tag": "div", "text": {
			"content": format!("**告警规则**: {}", alerts[0].rule_name),
			"tag": "lark_md",
		}}),
		json!({"tag": "hr"}),
	];

	for (idx, alert) in alerts.iter().take(CARD_BATCH_LIMIT).enumerate() {
		elements.push(json!({"tag": "div", "text": {
			"content": format!(
				"**告警 {}** [{}]\n值: {}\n标签: {}",
				idx + 1,
				alert.severity,
				alert.value,
				render::labels_inline(&alert.labels),
			),
			"tag": "lark_md",
		}}));
		if idx + 1 < shown {
			elements.push(json!({"tag": "hr"}));
		}
	}

	if alerts.len() > CARD_BATCH_LIMIT {
		elements.push(json!({"tag": "div", "text": {
			"content": format!("**还有 {} 条告警未显示...**", alerts.len() - CARD_BATCH_LIMIT),
			"tag": "lark_md",
		}}));
	}

	json!({
		"msg_type": "interactive",
		"card": {
			"config": {"wide_screen_mode": true},
			"header": {
				"title": {
					"content": format!("🔔 {status_text} (共 {} 条)", alerts.len()),
					"tag": "plain_text",
				},
				"template": color,
			},
			"elements": elements,
		},
	})
}

fn header(is_recovery: bool) -> (&'static str, &'static str) {
	if is_recovery {
		("green", "告警恢复")
	} else {
		("red", "告警触发")
	}
}
