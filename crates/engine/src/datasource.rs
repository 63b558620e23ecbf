//! Prometheus-compatible data source client.
//!
//! Expressions are opaque strings; the client only knows how to reach the
//! instant-query endpoint, authenticate, and parse the vector result shape.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{AuthConfig, DataSource, Labels};

/// One instant-vector sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
	pub labels: Labels,
	pub value: f64,
	pub timestamp: f64,
}

/// Seam between the evaluator and the outside world; tests substitute a
/// stub returning synthetic series.
#[async_trait]
pub trait SeriesSource: Send + Sync {
	async fn query(&self, datasource: &DataSource, expr: &str) -> Result<Vec<Sample>>;
}

#[derive(Debug, Clone, Default)]
pub struct PromClient;

impl PromClient {
	pub fn new() -> Self {
		Self
	}

	/// Append `/api/v1/query` to the base URL unless the path is already
	/// present.
	fn query_url(base: &str) -> String {
		let base = base.trim_end_matches('/');
		if base.ends_with("/api/v1") {
			format!("{base}/query")
		} else if base.contains("/api/v1/") {
			base.to_string()
		} else {
			format!("{base}/api/v1/query")
		}
	}
}

#[async_trait]
impl SeriesSource for PromClient {
	async fn query(&self, datasource: &DataSource, expr: &str) -> Result<Vec<Sample>> {
		let url = Self::query_url(&datasource.url);
		debug!(%url, datasource = %datasource.name, "querying data source");

		// Clients are cheap to build and verify_ssl is per-datasource, so
		// one client per query keeps the TLS configuration honest.
		let client = reqwest::Client::builder()
			.timeout(Duration::from_secs(datasource.http.timeout_secs))
			.danger_accept_invalid_certs(!datasource.http.verify_ssl)
			.build()?;

		let mut request = client.get(&url).query(&[("query", expr)]);
		request = match &datasource.auth {
			AuthConfig::None => request,
			AuthConfig::Bearer { token } => {
				let header = if token.starts_with("Bearer ") {
					token.clone()
				} else {
					format!("Bearer {token}")
				};
				request.header(reqwest::header::AUTHORIZATION, header)
			}
			AuthConfig::Basic { username, password } => {
				request.basic_auth(username, Some(password))
			}
		};

		let response = request.send().await?;
		let status = response.status();
		if !status.is_success() {
			let body = response.text().await.unwrap_or_default();
			warn!(%url, %status, "data source returned an error status");
			return Err(Error::Query(format!("{url}: http {status}: {body}")));
		}

		let body: QueryResponse = response.json().await?;
		parse_response(body)
	}
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
	status: String,
	#[serde(default)]
	data: Option<QueryData>,
	#[serde(default)]
	error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
	#[serde(default)]
	result: Vec<SeriesResult>,
}

#[derive(Debug, Deserialize)]
struct SeriesResult {
	#[serde(default)]
	metric: Labels,
	/// `[timestamp, "stringified-number"]`
	value: (f64, String),
}

fn parse_response(body: QueryResponse) -> Result<Vec<Sample>> {
	if body.status != "success" {
		return Err(Error::Query(format!(
			"query failed: {}",
			body.error.unwrap_or_else(|| "unknown error".into())
		)));
	}

	body.data
		.map(|data| data.result)
		.unwrap_or_default()
		.into_iter()
		.map(|series| {
			let value = series.value.1.parse::<f64>().map_err(|_| {
				Error::Query(format!("non-numeric sample value {:?}", series.value.1))
			})?;
			Ok(Sample {
				labels: series.metric,
				value,
				timestamp: series.value.0,
			})
		})
		.collect()
}
