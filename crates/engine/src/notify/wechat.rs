use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::Result;
use crate::notify::{SendContext, render, CHANNEL_TIMEOUT};

#[derive(Debug, Clone, Deserialize)]
pub struct WechatConfig {
	pub webhook_url: String,
}

pub struct WechatSender {
	pub config: WechatConfig,
}

impl WechatSender {
	pub async fn send(&self, ctx: &SendContext<'_>) -> Result<()> {
		let content = if let [alert] = ctx.alerts {
			render::alert_text(alert, ctx.is_recovery)
		} else {
			render::batch_text(ctx.alerts, ctx.is_recovery)
		};
		let body = json!({"msgtype": "text", "text": {"content": content}});

		debug!(url = %self.config.webhook_url, "posting wechat message");
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
