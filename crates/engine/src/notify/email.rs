use lettre::message::{MultiPart, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::SmtpConfig;
use crate::notify::{SendContext, render};

#[derive(Debug, Clone, Deserialize)]
pub struct EmailChannelConfig {
	pub to: Vec<String>,
	#[serde(default)]
	pub cc: Vec<String>,
	#[serde(default = "EmailChannelConfig::default_subject_prefix")]
	pub subject_prefix: String,
}

impl EmailChannelConfig {
	fn default_subject_prefix() -> String {
		"[Alert]".into()
	}
}

pub struct EmailSender {
	pub config: EmailChannelConfig,
}

impl EmailSender {
	pub async fn send(&self, ctx: &SendContext<'_>) -> Result<()> {
		let smtp = ctx.smtp.ok_or_else(|| {
			Error::Config("SMTP is not configured in system settings".into())
		})?;

		let status = if ctx.is_recovery { "恢复" } else { "触发" };
		let (subject, plain, html) = if let [alert] = ctx.alerts {
			(
				format!(
					"{} {} - {} ({status})",
					self.config.subject_prefix,
					alert.severity.to_uppercase(),
					alert.rule_name,
				),
				render::alert_text(alert, ctx.is_recovery),
				render::email_html(alert, ctx.is_recovery),
			)
		} else {
			(
				format!(
					"{} {} - {} 条告警 ({status})",
					self.config.subject_prefix,
					ctx.alerts[0].rule_name,
					ctx.alerts.len(),
				),
				render::batch_text(ctx.alerts, ctx.is_recovery),
				render::email_batch_html(ctx.alerts, ctx.is_recovery),
			)
		};

		let message = build_message(&self.config, smtp, &subject, plain, html)?;

		// One connection per send; sends are rare enough that pooling SMTP
		// sessions is not worth the state.
		let transport = build_transport(smtp)?;
		debug!(to = ?self.config.to, %subject, "sending email");
		transport
			.send(message)
			.await
			.map_err(|err| Error::Channel(format!("smtp send: {err}")))?;
		Ok(())
	}
}

fn parse_mailbox(address: &str) -> Result<Mailbox> {
	address
		.parse()
		.map_err(|err| Error::Config(format!("invalid email address {address:?}: {err}")))
}

fn build_message(
	config: &EmailChannelConfig,
	smtp: &SmtpConfig,
	subject: &str,
	plain: String,
	html: String,
) -> Result<Message> {
	if config.to.is_empty() {
		return Err(Error::Config("email channel has no recipients".into()));
	}

	let mut builder = Message::builder()
		.from(parse_mailbox(&smtp.from_addr)?)
		.subject(subject);
	for to in &config.to {
		builder = builder.to(parse_mailbox(to)?);
	}
	for cc in &config.cc {
		builder = builder.cc(parse_mailbox(cc)?);
	}

	builder
		.multipart(MultiPart::alternative_plain_html(plain, html))
		.map_err(|err| Error::Channel(format!("building email: {err}")))
}

fn build_transport(smtp: &SmtpConfig) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
	let builder = if smtp.use_tls {
		AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host)
	} else {
		AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)
	}
	.map_err(|err| Error::Config(format!("smtp relay {}: {err}", smtp.host)))?;

	Ok(builder
		.port(smtp.port)
		.credentials(Credentials::new(
			smtp.username.clone(),
			smtp.password.clone(),
		))
		.build())
}
