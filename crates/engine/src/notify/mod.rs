//! Notification dispatch.
//!
//! Resolves the channels for a batch of alerts, renders the batch per
//! channel kind, sends concurrently, and records one NotificationRecord per
//! (channel, alert) pair. A failure on one channel never affects another.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::model::{
	AlertSnapshot, ChannelKind, FilterConfig, Labels, NotificationChannel, NotificationRecord,
	Rule, SendStatus, SmtpConfig,
};
use crate::repos::{ChannelRepo, RecordRepo, SettingsRepo};

mod dingtalk;
mod email;
mod feishu;
pub mod render;
mod wechat;
pub mod webhook;

use dingtalk::{DingtalkConfig, DingtalkSender};
use email::{EmailChannelConfig, EmailSender};
use feishu::{FeishuConfig, FeishuSender};
use wechat::{WechatConfig, WechatSender};
use webhook::{WebhookConfig, WebhookSender};

/// Per-request timeout for all webhook-style channels.
pub(crate) const CHANNEL_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a channel needs to produce and deliver one message.
pub struct SendContext<'a> {
	pub http: &'a reqwest::Client,
	pub smtp: Option<&'a SmtpConfig>,
	pub alerts: &'a [AlertSnapshot],
	pub group_labels: &'a Labels,
	pub is_recovery: bool,
}

/// Sealed dispatch over the supported channel kinds. Each variant owns its
/// parsed configuration; building a sender validates the channel config up
/// front so a malformed channel fails fast with a config error.
pub enum ChannelSender {
	Feishu(FeishuSender),
	Dingtalk(DingtalkSender),
	Wechat(WechatSender),
	Email(EmailSender),
	Webhook(WebhookSender),
}

impl ChannelSender {
	pub fn from_channel(channel: &NotificationChannel) -> Result<Self> {
		fn parse<T: serde::de::DeserializeOwned>(
			channel: &NotificationChannel,
		) -> Result<T> {
			serde_json::from_value(channel.config.clone()).map_err(|err| {
				Error::Config(format!(
					"channel {} ({}) has invalid config: {err}",
					channel.name,
					channel.kind.as_str(),
				))
			})
		}

		Ok(match channel.kind {
			ChannelKind::Feishu => Self::Feishu(FeishuSender {
				config: parse::<FeishuConfig>(channel)?,
			}),
			ChannelKind::Dingtalk => Self::Dingtalk(DingtalkSender {
				config: parse::<DingtalkConfig>(channel)?,
			}),
			ChannelKind::Wechat => Self::Wechat(WechatSender {
				config: parse::<WechatConfig>(channel)?,
			}),
			ChannelKind::Email => Self::Email(EmailSender {
				config: parse::<EmailChannelConfig>(channel)?,
			}),
			ChannelKind::Webhook => Self::Webhook(WebhookSender {
				config: parse::<WebhookConfig>(channel)?,
			}),
		})
	}

	pub async fn send(&self, ctx: &SendContext<'_>) -> Result<()> {
		match self {
			Self::Feishu(sender) => sender.send(ctx).await,
			Self::Dingtalk(sender) => sender.send(ctx).await,
			Self::Wechat(sender) => sender.send(ctx).await,
			Self::Email(sender) => sender.send(ctx).await,
			Self::Webhook(sender) => sender.send(ctx).await,
		}
	}
}

pub struct Dispatcher {
	channels: Arc<dyn ChannelRepo>,
	records: Arc<dyn RecordRepo>,
	settings: Arc<dyn SettingsRepo>,
	http: reqwest::Client,
}

impl Dispatcher {
	pub fn new(
		channels: Arc<dyn ChannelRepo>,
		records: Arc<dyn RecordRepo>,
		settings: Arc<dyn SettingsRepo>,
		http: reqwest::Client,
	) -> Self {
		Self {
			channels,
			records,
			settings,
			http,
		}
	}

	/// Send one batch (a group's snapshots, or a single direct alert) to
	/// every resolved channel. Returns an error only when no channel could
	/// be attempted; individual channel failures are recorded and logged.
	pub async fn dispatch(
		&self,
		alerts: &[AlertSnapshot],
		group_labels: &Labels,
		rule: &Rule,
		is_recovery: bool,
	) -> Result<()> {
		let Some(first) = alerts.first() else {
			return Ok(());
		};

		let channels = self.resolve_channels(first, rule).await?;
		if channels.is_empty() {
			warn!(rule = %rule.name, "no notification channels resolved");
			return Ok(());
		}

		// SMTP settings are process-wide; fetch once per dispatch and only
		// when an email channel is in play.
		let smtp = if channels.iter().any(|c| c.kind == ChannelKind::Email) {
			self.settings.smtp_config().await?
		} else {
			None
		};

		let ctx = SendContext {
			http: &self.http,
			smtp: smtp.as_ref(),
			alerts,
			group_labels,
			is_recovery,
		};

		futures::future::join_all(
			channels
				.iter()
				.map(|channel| self.send_to_channel(channel, &ctx)),
		)
		.await;

		Ok(())
	}

	/// Channel resolution per the rule's routing config: explicit ids
	/// restricted to the tenant's enabled channels, else the tenant's
	/// enabled defaults; both further narrowed by label filters.
	async fn resolve_channels(
		&self,
		first: &AlertSnapshot,
		rule: &Rule,
	) -> Result<Vec<NotificationChannel>> {
		let ids = &rule.route_config.notification_channels;
		let candidates = if ids.is_empty() {
			self.channels.tenant_defaults(first.tenant_id).await?
		} else {
			self.channels.enabled_by_ids(first.tenant_id, ids).await?
		};

		Ok(candidates
			.into_iter()
			.filter(|channel| passes_filter(first, &channel.filter_config))
			.collect())
	}

	async fn send_to_channel(&self, channel: &NotificationChannel, ctx: &SendContext<'_>) {
		let outcome = match ChannelSender::from_channel(channel) {
			Ok(sender) => sender.send(ctx).await,
			Err(err) => Err(err),
		};

		match &outcome {
			Ok(()) => {
				info!(
					channel = %channel.name,
					kind = channel.kind.as_str(),
					alerts = ctx.alerts.len(),
					"notification sent"
				);
				metrics::inc_notifications_sent();
			}
			Err(err) => {
				error!(
					channel = %channel.name,
					kind = channel.kind.as_str(),
					"notification failed: {err}"
				);
				metrics::inc_notifications_failed();
			}
		}

		let error_message = outcome.err().map(|err| err.to_string());
		let status = if error_message.is_none() {
			SendStatus::Success
		} else {
			SendStatus::Failed
		};

		for alert in ctx.alerts {
			let record = NotificationRecord {
				channel_id: channel.id,
				channel_name: channel.name.clone(),
				channel_kind: channel.kind,
				alert_fingerprint: alert.fingerprint.clone(),
				rule_name: alert.rule_name.clone(),
				severity: alert.severity.clone(),
				status,
				error_message: error_message.clone(),
				content: serde_json::to_value(alert).unwrap_or_else(|_| json!({})),
				sent_at: Utc::now(),
				tenant_id: alert.tenant_id,
			};
			if let Err(err) = self.records.append(record).await {
				error!("failed to persist notification record: {err}");
			}
		}
	}
}

/// Include/exclude label filtering, using the group's representative
/// (first) alert. Empty value sets are ignored.
pub fn passes_filter(alert: &AlertSnapshot, filter: &FilterConfig) -> bool {
	for (key, values) in &filter.include_labels {
		if values.is_empty() {
			continue;
		}
		match alert.labels.get(key) {
			Some(value) if values.contains(value) => {}
			_ => return false,
		}
	}

	for (key, values) in &filter.exclude_labels {
		if let Some(value) = alert.labels.get(key)
			&& values.contains(value)
		{
			return false;
		}
	}

	true
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;

	use chrono::Utc;

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
			expr: String::new(),
			tenant_id: 1,
		}
	}

	fn filter(
		include: &[(&str, &[&str])],
		exclude: &[(&str, &[&str])],
	) -> FilterConfig {
		FilterConfig {
			include_labels: include
				.iter()
				.map(|(k, vs)| {
					(k.to_string(), vs.iter().map(|v| v.to_string()).collect())
				})
				.collect(),
			exclude_labels: exclude
				.iter()
				.map(|(k, vs)| {
					(k.to_string(), vs.iter().map(|v| v.to_string()).collect())
				})
				.collect(),
		}
	}

	#[test]
	fn include_filter_requires_membership() {
		let alert = snapshot(&[("severity", "critical")]);
		assert!(passes_filter(
			&alert,
			&filter(&[("severity", &["critical", "warning"])], &[]),
		));
		assert!(!passes_filter(
			&alert,
			&filter(&[("severity", &["info"])], &[]),
		));
		// Missing label fails a non-empty include set.
		assert!(!passes_filter(&alert, &filter(&[("team", &["db"])], &[])));
	}

	#[test]
	fn exclude_filter_drops_matches() {
		let alert = snapshot(&[("team", "test")]);
		assert!(!passes_filter(&alert, &filter(&[], &[("team", &["test"])])));
		assert!(passes_filter(&alert, &filter(&[], &[("team", &["web"])])));
		// Missing label never matches an exclude set.
		assert!(passes_filter(&alert, &filter(&[], &[("env", &["prod"])])));
	}

	#[test]
	fn empty_filter_passes_everything() {
		let alert = snapshot(&[]);
		assert!(passes_filter(&alert, &FilterConfig::default()));
	}

	#[test]
	fn malformed_channel_config_is_a_config_error() {
		let channel = NotificationChannel {
			id: 1,
			name: "hook".into(),
			kind: ChannelKind::Webhook,
			config: serde_json::json!({"no_url_here": true}),
			filter_config: FilterConfig::default(),
			is_enabled: true,
			is_default: false,
			tenant_id: 1,
			project_id: None,
		};
		assert!(matches!(
			ChannelSender::from_channel(&channel),
			Err(Error::Config(_)),
		));
	}
}
