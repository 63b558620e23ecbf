//! Shared message rendering for the plain-text and email channels.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::model::{AlertSnapshot, Labels};
use crate::templates;

const TEXT_BATCH_LIMIT: usize = 20;
const HTML_BATCH_LIMIT: usize = 50;

pub fn format_time(at: DateTime<Utc>) -> String {
	at.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Annotations with any remaining template patterns substituted against the
/// alert's own labels and value. Channels always send rendered annotations.
pub fn annotations(alert: &AlertSnapshot) -> BTreeMap<String, String> {
	templates::render_annotations(&alert.annotations, &alert.labels, alert.value)
}

fn labels_lines(labels: &Labels) -> String {
	labels
		.iter()
		.map(|(k, v)| format!("{k}: {v}"))
		.collect::<Vec<_>>()
		.join("\n")
}

pub fn labels_inline(labels: &Labels) -> String {
	labels
		.iter()
		.map(|(k, v)| format!("{k}={v}"))
		.collect::<Vec<_>>()
		.join(", ")
}

/// Plain-text body for a single alert.
pub fn alert_text(alert: &AlertSnapshot, is_recovery: bool) -> String {
	let status = if is_recovery { "【恢复】" } else { "【告警】" };

	let rendered = annotations(alert);
	let mut annotations_text = String::new();
	if let Some(summary) = rendered.get("summary") {
		annotations_text.push_str(&format!("\n摘要: {summary}"));
	}
	if let Some(description) = rendered.get("description") {
		annotations_text.push_str(&format!("\n描述: {description}"));
	}

	format!(
		"{status}\n告警名称: {}\n告警等级: {}\n当前值: {}\n触发时间: {}{annotations_text}\n\n标签:\n{}\n",
		alert.rule_name,
		alert.severity,
		alert.value,
		format_time(alert.started_at),
		labels_lines(&alert.labels),
	)
}

/// Plain-text body for a group, capped at twenty entries.
pub fn batch_text(alerts: &[AlertSnapshot], is_recovery: bool) -> String {
	let status = if is_recovery { "【恢复】" } else { "【告警】" };
	let rule_name = &alerts[0].rule_name;

	let mut text = format!("{status} {rule_name}\n共 {} 条告警\n", alerts.len());
	for (idx, alert) in alerts.iter().take(TEXT_BATCH_LIMIT).enumerate() {
		text.push_str(&format!(
			"\n告警 {}:\n  等级: {}\n  值: {}\n  时间: {}\n  标签: {}\n",
			idx + 1,
			alert.severity,
			alert.value,
			format_time(alert.started_at),
			labels_inline(&alert.labels),
		));
	}
	if alerts.len() > TEXT_BATCH_LIMIT {
		text.push_str(&format!(
			"\n还有 {} 条告警未显示...",
			alerts.len() - TEXT_BATCH_LIMIT
		));
	}
	text
}

fn labels_rows(labels: &Labels) -> String {
	labels
		.iter()
		.map(|(k, v)| format!("<tr><td><strong>{k}</strong></td><td>{v}</td></tr>"))
		.collect::<String>()
}

fn html_shell(status: &str, status_color: &str, heading: &str, content: &str) -> String {
	format!(
		r#"<html>
<head>
<style>
body {{ font-family: Arial, sans-serif; }}
.header {{ background-color: {status_color}; color: white; padding: 20px; text-align: center; }}
.content {{ padding: 20px; }}
table {{ border-collapse: collapse; width: 100%; margin-bottom: 20px; }}
td {{ padding: 8px; border-bottom: 1px solid #ddd; }}
</style>
</head>
<body>
<div class="header"><h1>{status}</h1>{heading}</div>
<div class="content">{content}</div>
</body>
</html>"#
	)
}

/// HTML body for a single alert.
pub fn email_html(alert: &AlertSnapshot, is_recovery: bool) -> String {
	let (status, color) = if is_recovery {
		("告警恢复", "#28a745")
	} else {
		("告警触发", "#dc3545")
	};

	let rendered = annotations(alert);
	let mut annotations_html = String::new();
	if rendered.contains_key("summary") || rendered.contains_key("description") {
		annotations_html.push_str("<h3>告警信息</h3><table>");
		if let Some(summary) = rendered.get("summary") {
			annotations_html.push_str(&format!(
				"<tr><td><strong>摘要</strong></td><td>{summary}</td></tr>"
			));
		}
		if let Some(description) = rendered.get("description") {
			annotations_html.push_str(&format!(
				"<tr><td><strong>描述</strong></td><td>{description}</td></tr>"
			));
		}
		annotations_html.push_str("</table>");
	}

	let content = format!(
		"<h2>{}</h2><table>\
		<tr><td><strong>告警等级</strong></td><td>{}</td></tr>\
		<tr><td><strong>当前值</strong></td><td>{}</td></tr>\
		<tr><td><strong>触发时间</strong></td><td>{}</td></tr>\
		</table>{annotations_html}<h3>标签</h3><table>{}</table>",
		alert.rule_name,
		alert.severity,
		alert.value,
		format_time(alert.started_at),
		labels_rows(&alert.labels),
	);

	html_shell(status, color, "", &content)
}

/// HTML body for a group, capped at fifty entries.
pub fn email_batch_html(alerts: &[AlertSnapshot], is_recovery: bool) -> String {
	let (status, color) = if is_recovery {
		("告警恢复", "#28a745")
	} else {
		("告警触发", "#dc3545")
	};

	let heading = format!("<h2>{} (共 {} 条)</h2>", alerts[0].rule_name, alerts.len());

	let mut content = String::new();
	for (idx, alert) in alerts.iter().take(HTML_BATCH_LIMIT).enumerate() {
		content.push_str(&format!(
			r#"<div style="margin-bottom: 20px; padding: 15px; border: 1px solid #ddd; border-radius: 5px;">
<h3 style="margin-top: 0;">告警 {} - {}</h3>
<table>
<tr><td><strong>当前值</strong></td><td>{}</td></tr>
<tr><td><strong>触发时间</strong></td><td>{}</td></tr>
</table>
<h4>标签</h4>
<table>{}</table>
</div>"#,
			idx + 1,
			alert.severity.to_uppercase(),
			alert.value,
			format_time(alert.started_at),
			labels_rows(&alert.labels),
		));
	}
	if alerts.len() > HTML_BATCH_LIMIT {
		content.push_str(&format!(
			"<p><strong>还有 {} 条告警未显示...</strong></p>",
			alerts.len() - HTML_BATCH_LIMIT
		));
	}

	html_shell(status, color, &heading, &content)
}

/// Labels shared by every alert in the batch.
pub fn common_labels(alerts: &[AlertSnapshot]) -> Labels {
	let Some((first, rest)) = alerts.split_first() else {
		return Labels::new();
	};

	first
		.labels
		.iter()
		.filter(|(k, v)| rest.iter().all(|a| a.labels.get(*k) == Some(v)))
		.map(|(k, v)| (k.clone(), v.clone()))
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::AlertStatus;

	fn snapshot(labels: &[(&str, &str)]) -> AlertSnapshot {
		AlertSnapshot {
			fingerprint: "fp".into(),
			rule_name: "HighCPU".into(),
			severity: "critical".into(),
			status: AlertStatus::Firing,
			value: 95.0,
			labels: labels
				.iter()
				.map(|(k, v)| (k.to_string(), v.to_string()))
				.collect(),
			annotations: BTreeMap::new(),
			started_at: Utc::now(),
			expr: "cpu > 90".into(),
			tenant_id: 1,
		}
	}

	#[test]
	fn common_labels_is_the_intersection() {
		let mut a = snapshot(&[("env", "prod"), ("instance", "a")]);
		let b = snapshot(&[("env", "prod"), ("instance", "b")]);
		a.fingerprint = "fp-a".into();

		let common = common_labels(&[a, b]);
		assert_eq!(common.len(), 1);
		assert_eq!(common.get("env").map(String::as_str), Some("prod"));
	}

	#[test]
	fn single_alert_text_carries_status_marker() {
		let alert = snapshot(&[("instance", "a")]);
		assert!(alert_text(&alert, false).starts_with("【告警】"));
		assert!(alert_text(&alert, true).starts_with("【恢复】"));
	}

	#[test]
	fn batch_text_caps_at_twenty() {
		let alerts: Vec<_> = (0..25)
			.map(|i| {
				let mut a = snapshot(&[("instance", &format!("host-{i}"))]);
				a.fingerprint = format!("fp-{i}");
				a
			})
			.collect();
		let text = batch_text(&alerts, false);
		assert!(text.contains("共 25 条告警"));
		assert!(text.contains("还有 5 条告警未显示"));
	}

	#[test]
	fn templated_annotations_render_at_send_time() {
		let mut alert = snapshot(&[("instance", "a")]);
		alert.annotations.insert(
			"summary".into(),
			"cpu on {{ $labels.instance }} at {{ $value }}".into(),
		);
		let text = alert_text(&alert, false);
		assert!(text.contains("摘要: cpu on a at 95"));
	}
}
