use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label sets are ordered maps so that fingerprinting and rendering are
/// deterministic regardless of insertion order.
pub type Labels = BTreeMap<String, String>;

fn enabled() -> bool {
	true
}

/// An alert rule as persisted by the CRUD collaborators.
///
/// The expression is opaque to the engine and forwarded verbatim to the
/// rule's data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
	pub id: i64,
	pub name: String,
	pub expr: String,

	/// Evaluation interval in seconds.
	#[serde(default = "Rule::default_eval_interval")]
	pub eval_interval: i64,
	/// How long a series must keep matching before `pending` escalates to
	/// `firing`, in seconds.
	#[serde(default)]
	pub for_duration: i64,

	#[serde(default = "Rule::default_severity")]
	pub severity: String,
	#[serde(default)]
	pub labels: Labels,
	#[serde(default)]
	pub annotations: BTreeMap<String, String>,
	#[serde(default)]
	pub route_config: RouteConfig,

	pub datasource_id: i64,
	pub tenant_id: i64,
	#[serde(default)]
	pub project_id: Option<i64>,
	#[serde(default = "enabled")]
	pub is_enabled: bool,
}

impl Rule {
	fn default_eval_interval() -> i64 {
		60
	}

	fn default_severity() -> String {
		"warning".into()
	}
}

/// Per-rule notification routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
	/// Label keys (in declared order) that split this rule's alerts into
	/// separate groups.
	#[serde(default)]
	pub group_by: Vec<String>,
	/// Explicit channel ids; empty means "tenant default channels".
	#[serde(default)]
	pub notification_channels: Vec<i64>,
	#[serde(default = "enabled")]
	pub enable_grouping: bool,
	#[serde(default = "enabled")]
	pub enable_recovery_grouping: bool,
}

impl Default for RouteConfig {
	fn default() -> Self {
		Self {
			group_by: Vec::new(),
			notification_channels: Vec::new(),
			enable_grouping: true,
			enable_recovery_grouping: true,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
	pub id: i64,
	pub name: String,
	/// e.g. "prometheus" or "victoriametrics"; anything speaking the
	/// Prometheus HTTP query API.
	pub kind: String,
	pub url: String,
	#[serde(default)]
	pub auth: AuthConfig,
	#[serde(default)]
	pub http: HttpConfig,
	/// Merged into every series this source produces.
	#[serde(default)]
	pub extra_labels: Labels,
	#[serde(default = "enabled")]
	pub is_enabled: bool,
	pub tenant_id: i64,
	#[serde(default)]
	pub project_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AuthConfig {
	#[default]
	None,
	Bearer {
		token: String,
	},
	Basic {
		username: String,
		password: String,
	},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
	#[serde(default = "HttpConfig::default_timeout")]
	pub timeout_secs: u64,
	#[serde(default = "enabled")]
	pub verify_ssl: bool,
}

impl HttpConfig {
	fn default_timeout() -> u64 {
		30
	}
}

impl Default for HttpConfig {
	fn default() -> Self {
		Self {
			timeout_secs: Self::default_timeout(),
			verify_ssl: true,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
	Pending,
	Firing,
	Resolved,
}

impl AlertStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Pending => "pending",
			Self::Firing => "firing",
			Self::Resolved => "resolved",
		}
	}
}

impl std::fmt::Display for AlertStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// An active alert, keyed by fingerprint.
///
/// Exactly one active event exists per fingerprint; the evaluator is the
/// only writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
	pub fingerprint: String,
	pub rule_id: i64,
	pub rule_name: String,
	pub status: AlertStatus,
	pub severity: String,
	pub started_at: DateTime<Utc>,
	pub last_eval_at: DateTime<Utc>,
	#[serde(default)]
	pub last_sent_at: Option<DateTime<Utc>>,
	pub value: f64,
	pub labels: Labels,
	pub annotations: BTreeMap<String, String>,
	pub expr: String,
	pub tenant_id: i64,
	#[serde(default)]
	pub project_id: Option<i64>,
}

/// Immutable archive row for a resolved alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEventHistory {
	pub fingerprint: String,
	pub rule_id: i64,
	pub rule_name: String,
	pub status: AlertStatus,
	pub severity: String,
	pub started_at: DateTime<Utc>,
	pub resolved_at: DateTime<Utc>,
	pub duration_secs: i64,
	pub value: f64,
	pub labels: Labels,
	pub annotations: BTreeMap<String, String>,
	pub expr: String,
	pub tenant_id: i64,
	#[serde(default)]
	pub project_id: Option<i64>,
}

impl AlertEventHistory {
	pub fn archive(event: &AlertEvent, resolved_at: DateTime<Utc>) -> Self {
		Self {
			fingerprint: event.fingerprint.clone(),
			rule_id: event.rule_id,
			rule_name: event.rule_name.clone(),
			status: AlertStatus::Resolved,
			severity: event.severity.clone(),
			started_at: event.started_at,
			resolved_at,
			duration_secs: (resolved_at - event.started_at).num_seconds(),
			value: event.value,
			labels: event.labels.clone(),
			annotations: event.annotations.clone(),
			expr: event.expr.clone(),
			tenant_id: event.tenant_id,
			project_id: event.project_id,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchOp {
	#[serde(rename = "=")]
	Eq,
	#[serde(rename = "!=")]
	Ne,
	#[serde(rename = "=~")]
	Re,
	#[serde(rename = "!~")]
	NotRe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Matcher {
	pub label: String,
	#[serde(rename = "operator")]
	pub op: MatchOp,
	pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SilenceRule {
	pub id: i64,
	pub name: String,
	pub matchers: Vec<Matcher>,
	pub starts_at: DateTime<Utc>,
	pub ends_at: DateTime<Utc>,
	#[serde(default = "enabled")]
	pub is_enabled: bool,
	pub tenant_id: i64,
	#[serde(default)]
	pub project_id: Option<i64>,
}

impl SilenceRule {
	pub fn is_active(&self, now: DateTime<Utc>) -> bool {
		self.is_enabled && self.starts_at <= now && now <= self.ends_at
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
	Feishu,
	Dingtalk,
	Wechat,
	Email,
	Webhook,
}

impl ChannelKind {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Feishu => "feishu",
			Self::Dingtalk => "dingtalk",
			Self::Wechat => "wechat",
			Self::Email => "email",
			Self::Webhook => "webhook",
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
	/// The channel receives a group only if, for every key with a non-empty
	/// value set, the representative alert's label value is in that set.
	#[serde(default)]
	pub include_labels: BTreeMap<String, Vec<String>>,
	/// The channel is dropped if any key matches.
	#[serde(default)]
	pub exclude_labels: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannel {
	pub id: i64,
	pub name: String,
	pub kind: ChannelKind,
	/// Kind-specific configuration, validated when the sender is built.
	pub config: serde_json::Value,
	#[serde(default)]
	pub filter_config: FilterConfig,
	#[serde(default = "enabled")]
	pub is_enabled: bool,
	#[serde(default)]
	pub is_default: bool,
	pub tenant_id: i64,
	#[serde(default)]
	pub project_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
	Success,
	Failed,
}

/// Append-only record of one (channel, alert) delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
	pub channel_id: i64,
	pub channel_name: String,
	pub channel_kind: ChannelKind,
	pub alert_fingerprint: String,
	pub rule_name: String,
	pub severity: String,
	pub status: SendStatus,
	pub error_message: Option<String>,
	pub content: serde_json::Value,
	pub sent_at: DateTime<Utc>,
	pub tenant_id: i64,
}

/// Process-wide SMTP configuration, read from the system-settings
/// collaborator under `key = "smtp_config"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
	pub host: String,
	pub port: u16,
	pub username: String,
	pub password: String,
	#[serde(default = "enabled")]
	pub use_tls: bool,
	pub from_addr: String,
}

/// Point-in-time copy of an alert, embedded in group records so a group can
/// be rendered and sent after its underlying event has been archived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSnapshot {
	pub fingerprint: String,
	pub rule_name: String,
	pub severity: String,
	pub status: AlertStatus,
	pub value: f64,
	pub labels: Labels,
	pub annotations: BTreeMap<String, String>,
	pub started_at: DateTime<Utc>,
	pub expr: String,
	pub tenant_id: i64,
}

impl From<&AlertEvent> for AlertSnapshot {
	fn from(event: &AlertEvent) -> Self {
		Self {
			fingerprint: event.fingerprint.clone(),
			rule_name: event.rule_name.clone(),
			severity: event.severity.clone(),
			status: event.status,
			value: event.value,
			labels: event.labels.clone(),
			annotations: event.annotations.clone(),
			started_at: event.started_at,
			expr: event.expr.clone(),
			tenant_id: event.tenant_id,
		}
	}
}

/// Group record as shared between replicas through the KV store.
///
/// Plain value type, JSON-encoded; no references so any replica can
/// round-trip it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertGroup {
	pub group_key: String,
	pub group_labels: Labels,
	pub rule_id: i64,
	pub rule_name: String,
	pub alerts: Vec<AlertSnapshot>,
	pub created_at: DateTime<Utc>,
	pub last_updated_at: DateTime<Utc>,
	pub sent: bool,
}

impl AlertGroup {
	pub fn contains(&self, fingerprint: &str) -> bool {
		self.alerts.iter().any(|a| a.fingerprint == fingerprint)
	}
}

/// Live counters for the `/stats` endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GroupStats {
	pub total_groups: usize,
	pub firing_groups: usize,
	pub recovery_groups: usize,
	pub total_alerts: usize,
	pub sent_groups: usize,
	pub pending_groups: usize,
	/// Alerts held in firing groups only; feeds the firing gauge, not the
	/// stats endpoint.
	#[serde(skip)]
	pub firing_alerts: usize,
}
