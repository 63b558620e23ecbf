//! HTTP server exposing engine status, grouper stats, and metrics.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, warn};

use crate::grouper::Grouper;
use crate::metrics;

#[derive(Clone)]
pub struct ServerState {
	pub started_at: DateTime<Utc>,
	pub pid: u32,
	pub grouper: Arc<Grouper>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
	name: String,
	version: String,
	started_at: String,
	pid: u32,
}

pub async fn start_server(state: ServerState, addrs: Vec<std::net::SocketAddr>) {
	let app = Router::new()
		.route("/status", get(handle_status))
		.route("/stats", get(handle_stats))
		.route("/metrics", get(handle_metrics))
		.layer(
			TraceLayer::new_for_http()
				.make_span_with(
					DefaultMakeSpan::new()
						.level(Level::INFO)
						.include_headers(false),
				)
				.on_response(
					DefaultOnResponse::new()
						.level(Level::INFO)
						.include_headers(false),
				),
		)
		.with_state(Arc::new(state));

	let mut listener = None;
	for addr in &addrs {
		match tokio::net::TcpListener::bind(addr).await {
			Ok(bound) => {
				info!("HTTP server listening on http://{addr}");
				listener = Some(bound);
				break;
			}
			Err(err) => {
				warn!("failed to bind HTTP server to {addr}: {err}");
			}
		}
	}

	let Some(listener) = listener else {
		warn!("no usable HTTP server address, continuing without");
		return;
	};

	if let Err(err) = axum::serve(listener, app).await {
		error!("HTTP server error: {err}");
	}
}

async fn handle_status(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
	Json(StatusResponse {
		name: "vigil-engine".to_string(),
		version: env!("CARGO_PKG_VERSION").to_string(),
		started_at: state.started_at.to_rfc3339(),
		pid: state.pid,
	})
}

async fn handle_stats(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
	match state.grouper.stats().await {
		Ok(stats) => Json(stats).into_response(),
		Err(err) => {
			error!("failed to gather group stats: {err}");
			(
				StatusCode::INTERNAL_SERVER_ERROR,
				format!("failed to gather group stats: {err}\n"),
			)
				.into_response()
		}
	}
}

async fn handle_metrics() -> impl IntoResponse {
	match metrics::gather_metrics() {
		Ok(text) => (StatusCode::OK, text).into_response(),
		Err(err) => {
			error!("failed to gather metrics: {err}");
			(
				StatusCode::INTERNAL_SERVER_ERROR,
				format!("failed to gather metrics: {err}\n"),
			)
				.into_response()
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::grouper::GroupingConfig;
	use crate::kv::MemoryKv;

	fn test_state() -> ServerState {
		ServerState {
			started_at: Utc::now(),
			pid: std::process::id(),
			grouper: Arc::new(Grouper::new(
				Arc::new(MemoryKv::new()),
				GroupingConfig::default(),
			)),
		}
	}

	#[tokio::test]
	async fn status_endpoint_reports_name_and_version() {
		let response = handle_status(State(Arc::new(test_state())))
			.await
			.into_response();
		assert_eq!(response.status(), StatusCode::OK);

		let body = axum::body::to_bytes(response.into_body(), usize::MAX)
			.await
			.unwrap();
		let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
		assert_eq!(status["name"], "vigil-engine");
		assert!(status["version"].as_str().is_some_and(|v| !v.is_empty()));
	}

	#[tokio::test]
	async fn stats_endpoint_reports_group_counters() {
		let response = handle_stats(State(Arc::new(test_state())))
			.await
			.into_response();
		assert_eq!(response.status(), StatusCode::OK);

		let body = axum::body::to_bytes(response.into_body(), usize::MAX)
			.await
			.unwrap();
		let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
		assert_eq!(stats["total_groups"], 0);
		assert_eq!(stats["pending_groups"], 0);
		assert!(stats.get("firing_alerts").is_none());
	}

	#[tokio::test]
	async fn metrics_endpoint_returns_prometheus_text() {
		metrics::init_metrics();
		let response = handle_metrics().await.into_response();
		assert_eq!(response.status(), StatusCode::OK);

		let body = axum::body::to_bytes(response.into_body(), usize::MAX)
			.await
			.unwrap();
		let text = String::from_utf8(body.to_vec()).unwrap();
		assert!(text.contains("# HELP"));
	}
}
