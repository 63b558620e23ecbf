use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::debug;

use crate::error::{Error, Result};
use crate::notify::{SendContext, render, CHANNEL_TIMEOUT};

#[derive(Debug, Clone, Deserialize)]
pub struct DingtalkConfig {
	pub webhook_url: String,
	#[serde(default)]
	pub secret: Option<String>,
}

pub struct DingtalkSender {
	pub config: DingtalkConfig,
}

impl DingtalkSender {
	pub async fn send(&self, ctx: &SendContext<'_>) -> Result<()> {
		let url = match self.config.secret.as_deref() {
			Some(secret) if !secret.is_empty() => signed_url(
				&self.config.webhook_url,
				secret,
				chrono::Utc::now().timestamp_millis(),
			)?,
			_ => self.config.webhook_url.clone(),
		};

		let content = if let [alert] = ctx.alerts {
			render::alert_text(alert, ctx.is_recovery)
		} else {
			render::batch_text(ctx.alerts, ctx.is_recovery)
		};
		let body = json!({"msgtype": "text", "text": {"content": content}});

		debug!(url = %self.config.webhook_url, "posting dingtalk message");
		ctx.http
			.post(&url)
			.timeout(CHANNEL_TIMEOUT)
			.json(&body)
			.send()
			.await?
			.error_for_status()?;
		Ok(())
	}
}

/// DingTalk signing: HMAC-SHA256 of `"<timestamp>\n<secret>"` keyed by the
/// secret, base64- then url-encoded, appended as query parameters.
fn signed_url(webhook_url: &str, secret: &str, timestamp_ms: i64) -> Result<String> {
	let string_to_sign = format!("{timestamp_ms}\n{secret}");

	let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
		.map_err(|err| Error::Config(format!("invalid dingtalk secret: {err}")))?;
	mac.update(string_to_sign.as_bytes());
	let signature = BASE64.encode(mac.finalize().into_bytes());
	let sign = utf8_percent_encode(&signature, NON_ALPHANUMERIC).to_string();

	Ok(format!("{webhook_url}&timestamp={timestamp_ms}&sign={sign}"))
}
