//! Repository implementations over PostgreSQL.
//!
//! Hand-written typed queries; JSON-typed columns (labels, annotations,
//! routing and channel configs) round-trip through serde. A rule-tick
//! batch commits inside one transaction so the tick is atomic.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::Row;
use tokio_postgres::types::ToSql;

use vigil_engine::Deps;
use vigil_engine::error::{Error, Result};
use vigil_engine::model::{
	AlertEvent, AlertEventHistory, AlertStatus, ChannelKind, DataSource, NotificationChannel,
	NotificationRecord, Rule, SilenceRule, SmtpConfig,
};
use vigil_engine::repos::{
	ChannelRepo, DataSourceRepo, EventRepo, RecordRepo, RuleRepo, SettingsRepo, SilenceRepo,
	TickBatch,
};

use crate::pool::PgPool;

fn db_err(context: &str, err: tokio_postgres::Error) -> Error {
	Error::Persistence(format!("{context}: {err}"))
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value, what: &str) -> Result<T> {
	serde_json::from_value(value)
		.map_err(|err| Error::Persistence(format!("decoding {what}: {err}")))
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<serde_json::Value> {
	serde_json::to_value(value)
		.map_err(|err| Error::Persistence(format!("encoding {what}: {err}")))
}

fn status_from_str(status: &str) -> Result<AlertStatus> {
	match status {
		"pending" => Ok(AlertStatus::Pending),
		"firing" => Ok(AlertStatus::Firing),
		"resolved" => Ok(AlertStatus::Resolved),
		other => Err(Error::Persistence(format!("unknown alert status {other:?}"))),
	}
}

fn kind_from_str(kind: &str) -> Result<ChannelKind> {
	match kind {
		"feishu" => Ok(ChannelKind::Feishu),
		"dingtalk" => Ok(ChannelKind::Dingtalk),
		"wechat" => Ok(ChannelKind::Wechat),
		"email" => Ok(ChannelKind::Email),
		"webhook" => Ok(ChannelKind::Webhook),
		other => Err(Error::Persistence(format!("unknown channel kind {other:?}"))),
	}
}

pub struct PgRules {
	pool: PgPool,
}

const RULE_COLUMNS: &str = "id, name, expr, eval_interval, for_duration, severity, labels, \
	annotations, route_config, datasource_id, tenant_id, project_id, is_enabled";

fn rule_from_row(row: &Row) -> Result<Rule> {
	Ok(Rule {
		id: row.get("id"),
		name: row.get("name"),
		expr: row.get("expr"),
		eval_interval: row.get("eval_interval"),
		for_duration: row.get("for_duration"),
		severity: row.get("severity"),
		labels: from_json(row.get("labels"), "rule labels")?,
		annotations: from_json(row.get("annotations"), "rule annotations")?,
		route_config: from_json(row.get("route_config"), "rule route_config")?,
		datasource_id: row.get("datasource_id"),
		tenant_id: row.get("tenant_id"),
		project_id: row.get("project_id"),
		is_enabled: row.get("is_enabled"),
	})
}

#[async_trait]
impl RuleRepo for PgRules {
	async fn enabled(&self) -> Result<Vec<Rule>> {
		let conn = self.pool.get().await?;
		let rows = conn
			.query(
				format!("SELECT {RULE_COLUMNS} FROM alert_rule WHERE is_enabled").as_str(),
				&[],
			)
			.await
			.map_err(|err| db_err("loading enabled rules", err))?;
		rows.iter().map(rule_from_row).collect()
	}

	async fn by_id(&self, id: i64) -> Result<Option<Rule>> {
		let conn = self.pool.get().await?;
		let row = conn
			.query_opt(
				format!("SELECT {RULE_COLUMNS} FROM alert_rule WHERE id = $1").as_str(),
				&[&id],
			)
			.await
			.map_err(|err| db_err("loading rule", err))?;
		row.as_ref().map(rule_from_row).transpose()
	}
}

pub struct PgDataSources {
	pool: PgPool,
}

#[async_trait]
impl DataSourceRepo for PgDataSources {
	async fn enabled_by_id(&self, id: i64) -> Result<Option<DataSource>> {
		let conn = self.pool.get().await?;
		let row = conn
			.query_opt(
				"SELECT id, name, kind, url, auth_config, http_config, extra_labels, \
				 is_enabled, tenant_id, project_id \
				 FROM datasource WHERE id = $1 AND is_enabled",
				&[&id],
			)
			.await
			.map_err(|err| db_err("loading data source", err))?;

		row.map(|row| {
			Ok(DataSource {
				id: row.get("id"),
				name: row.get("name"),
				kind: row.get("kind"),
				url: row.get("url"),
				auth: from_json(row.get("auth_config"), "datasource auth_config")?,
				http: from_json(row.get("http_config"), "datasource http_config")?,
				extra_labels: from_json(row.get("extra_labels"), "datasource extra_labels")?,
				is_enabled: row.get("is_enabled"),
				tenant_id: row.get("tenant_id"),
				project_id: row.get("project_id"),
			})
		})
		.transpose()
	}
}

pub struct PgEvents {
	pool: PgPool,
}

fn event_from_row(row: &Row) -> Result<AlertEvent> {
	let status: String = row.get("status");
	Ok(AlertEvent {
		fingerprint: row.get("fingerprint"),
		rule_id: row.get("rule_id"),
		rule_name: row.get("rule_name"),
		status: status_from_str(&status)?,
		severity: row.get("severity"),
		started_at: row.get("started_at"),
		last_eval_at: row.get("last_eval_at"),
		last_sent_at: row.get("last_sent_at"),
		value: row.get("value"),
		labels: from_json(row.get("labels"), "event labels")?,
		annotations: from_json(row.get("annotations"), "event annotations")?,
		expr: row.get("expr"),
		tenant_id: row.get("tenant_id"),
		project_id: row.get("project_id"),
	})
}

#[async_trait]
impl EventRepo for PgEvents {
	async fn active_for_rule(&self, rule_id: i64) -> Result<Vec<AlertEvent>> {
		let conn = self.pool.get().await?;
		let rows = conn
			.query(
				"SELECT fingerprint, rule_id, rule_name, status, severity, started_at, \
				 last_eval_at, last_sent_at, value, labels, annotations, expr, \
				 tenant_id, project_id \
				 FROM alert_event WHERE rule_id = $1",
				&[&rule_id],
			)
			.await
			.map_err(|err| db_err("loading active events", err))?;
		rows.iter().map(event_from_row).collect()
	}

	async fn commit_tick(&self, batch: TickBatch) -> Result<()> {
		if batch.is_empty() {
			return Ok(());
		}

		let mut conn = self.pool.get().await?;
		let tx = conn
			.transaction()
			.await
			.map_err(|err| db_err("opening transaction", err))?;

		for event in &batch.upserts {
			let params: [&(dyn ToSql + Sync); 14] = [
				&event.fingerprint,
				&event.rule_id,
				&event.rule_name,
				&event.status.as_str(),
				&event.severity,
				&event.started_at,
				&event.last_eval_at,
				&event.last_sent_at,
				&event.value,
				&to_json(&event.labels, "event labels")?,
				&to_json(&event.annotations, "event annotations")?,
				&event.expr,
				&event.tenant_id,
				&event.project_id,
			];
			tx.execute(
				"INSERT INTO alert_event (fingerprint, rule_id, rule_name, status, \
				 severity, started_at, last_eval_at, last_sent_at, value, labels, \
				 annotations, expr, tenant_id, project_id) \
				 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
				 ON CONFLICT (fingerprint) DO UPDATE SET \
				 status = EXCLUDED.status, severity = EXCLUDED.severity, \
				 started_at = EXCLUDED.started_at, last_eval_at = EXCLUDED.last_eval_at, \
				 value = EXCLUDED.value, labels = EXCLUDED.labels, \
				 annotations = EXCLUDED.annotations",
				&params,
			)
			.await
			.map_err(|err| db_err("upserting event", err))?;
		}

		for archived in &batch.archives {
			let params: [&(dyn ToSql + Sync); 15] = [
				&archived.fingerprint,
				&archived.rule_id,
				&archived.rule_name,
				&archived.status.as_str(),
				&archived.severity,
				&archived.started_at,
				&archived.resolved_at,
				&archived.duration_secs,
				&archived.value,
				&to_json(&archived.labels, "history labels")?,
				&to_json(&archived.annotations, "history annotations")?,
				&archived.expr,
				&archived.tenant_id,
				&archived.project_id,
				&archived.fingerprint,
			];
			tx.execute(
				"WITH archived AS (\
				 INSERT INTO alert_event_history (fingerprint, rule_id, rule_name, \
				 status, severity, started_at, resolved_at, duration_secs, value, \
				 labels, annotations, expr, tenant_id, project_id) \
				 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)) \
				 DELETE FROM alert_event WHERE fingerprint = $15",
				&params,
			)
			.await
			.map_err(|err| db_err("archiving event", err))?;
		}

		tx.commit()
			.await
			.map_err(|err| db_err("committing tick", err))
	}

	async fn mark_sent(&self, fingerprints: &[String], at: DateTime<Utc>) -> Result<()> {
		if fingerprints.is_empty() {
			return Ok(());
		}
		let conn = self.pool.get().await?;
		conn.execute(
			"UPDATE alert_event SET last_sent_at = $1 WHERE fingerprint = ANY($2)",
			&[&at, &fingerprints.to_vec()],
		)
		.await
		.map_err(|err| db_err("stamping last_sent_at", err))?;
		Ok(())
	}
}

pub struct PgSilences {
	pool: PgPool,
}

#[async_trait]
impl SilenceRepo for PgSilences {
	async fn active_for_tenant(
		&self,
		tenant_id: i64,
		now: DateTime<Utc>,
	) -> Result<Vec<SilenceRule>> {
		let conn = self.pool.get().await?;
		let rows = conn
			.query(
				"SELECT id, name, matchers, starts_at, ends_at, is_enabled, \
				 tenant_id, project_id \
				 FROM silence_rule \
				 WHERE tenant_id = $1 AND is_enabled AND starts_at <= $2 AND ends_at >= $2",
				&[&tenant_id, &now],
			)
			.await
			.map_err(|err| db_err("loading silences", err))?;

		rows.iter()
			.map(|row| {
				Ok(SilenceRule {
					id: row.get("id"),
					name: row.get("name"),
					matchers: from_json(row.get("matchers"), "silence matchers")?,
					starts_at: row.get("starts_at"),
					ends_at: row.get("ends_at"),
					is_enabled: row.get("is_enabled"),
					tenant_id: row.get("tenant_id"),
					project_id: row.get("project_id"),
				})
			})
			.collect()
	}
}

pub struct PgChannels {
	pool: PgPool,
}

const CHANNEL_COLUMNS: &str = "id, name, kind, config, filter_config, is_enabled, is_default, \
	tenant_id, project_id";

fn channel_from_row(row: &Row) -> Result<NotificationChannel> {
	let kind: String = row.get("kind");
	Ok(NotificationChannel {
		id: row.get("id"),
		name: row.get("name"),
		kind: kind_from_str(&kind)?,
		config: row.get("config"),
		filter_config: from_json(row.get("filter_config"), "channel filter_config")?,
		is_enabled: row.get("is_enabled"),
		is_default: row.get("is_default"),
		tenant_id: row.get("tenant_id"),
		project_id: row.get("project_id"),
	})
}

#[async_trait]
impl ChannelRepo for PgChannels {
	async fn enabled_by_ids(
		&self,
		tenant_id: i64,
		ids: &[i64],
	) -> Result<Vec<NotificationChannel>> {
		let conn = self.pool.get().await?;
		let rows = conn
			.query(
				format!(
					"SELECT {CHANNEL_COLUMNS} FROM notification_channel \
					 WHERE tenant_id = $1 AND is_enabled AND id = ANY($2)"
				)
				.as_str(),
				&[&tenant_id, &ids.to_vec()],
			)
			.await
			.map_err(|err| db_err("loading channels", err))?;
		rows.iter().map(channel_from_row).collect()
	}

	async fn tenant_defaults(&self, tenant_id: i64) -> Result<Vec<NotificationChannel>> {
		let conn = self.pool.get().await?;
		let rows = conn
			.query(
				format!(
					"SELECT {CHANNEL_COLUMNS} FROM notification_channel \
					 WHERE tenant_id = $1 AND is_enabled AND is_default"
				)
				.as_str(),
				&[&tenant_id],
			)
			.await
			.map_err(|err| db_err("loading default channels", err))?;
		rows.iter().map(channel_from_row).collect()
	}
}

pub struct PgRecords {
	pool: PgPool,
}

#[async_trait]
impl RecordRepo for PgRecords {
	async fn append(&self, record: NotificationRecord) -> Result<()> {
		let conn = self.pool.get().await?;
		let status = match record.status {
			vigil_engine::model::SendStatus::Success => "success",
			vigil_engine::model::SendStatus::Failed => "failed",
		};
		let params: [&(dyn ToSql + Sync); 11] = [
			&record.channel_id,
			&record.channel_name,
			&record.channel_kind.as_str(),
			&record.alert_fingerprint,
			&record.rule_name,
			&record.severity,
			&status,
			&record.error_message,
			&record.content,
			&record.sent_at,
			&record.tenant_id,
		];
		conn.execute(
			"INSERT INTO notification_record (channel_id, channel_name, channel_kind, \
			 alert_fingerprint, rule_name, severity, status, error_message, content, \
			 sent_at, tenant_id) \
			 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
			&params,
		)
		.await
		.map_err(|err| db_err("appending notification record", err))?;
		Ok(())
	}
}

pub struct PgSettings {
	pool: PgPool,
}

#[async_trait]
impl SettingsRepo for PgSettings {
	async fn smtp_config(&self) -> Result<Option<SmtpConfig>> {
		let conn = self.pool.get().await?;
		let row = conn
			.query_opt(
				"SELECT value FROM system_settings WHERE key = 'smtp_config'",
				&[],
			)
			.await
			.map_err(|err| db_err("loading smtp settings", err))?;

		row.map(|row| from_json(row.get("value"), "smtp config"))
			.transpose()
	}
}

/// Wire every repository over one shared pool.
pub fn pg_deps(pool: PgPool) -> Deps {
	Deps {
		rules: Arc::new(PgRules { pool: pool.clone() }),
		datasources: Arc::new(PgDataSources { pool: pool.clone() }),
		events: Arc::new(PgEvents { pool: pool.clone() }),
		silences: Arc::new(PgSilences { pool: pool.clone() }),
		channels: Arc::new(PgChannels { pool: pool.clone() }),
		records: Arc::new(PgRecords { pool: pool.clone() }),
		settings: Arc::new(PgSettings { pool }),
	}
}
