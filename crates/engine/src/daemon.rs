//! Daemon wiring: dependencies in, running engine out.
//!
//! Every collaborator arrives as an explicit trait object; there is no
//! hidden global state. Shutdown is cooperative: signals cancel the
//! scheduler, which awaits in-flight rule ticks and dispatches before the
//! daemon returns.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::datasource::PromClient;
use crate::error::Result;
use crate::evaluator::RuleEvaluator;
use crate::grouper::Grouper;
use crate::http_server::{self, ServerState};
use crate::kv::{KvStore, MemoryKv, RedisKv};
use crate::lock::LockManager;
use crate::metrics;
use crate::notify::Dispatcher;
use crate::router::AlertRouter;
use crate::scheduler::Scheduler;
use crate::{DaemonConfig, Deps};

pub async fn run(config: DaemonConfig, deps: Deps) -> Result<()> {
	let shutdown = CancellationToken::new();
	install_signal_handlers(shutdown.clone());
	run_with_shutdown(config, deps, shutdown).await
}

pub async fn run_with_shutdown(
	config: DaemonConfig,
	deps: Deps,
	shutdown: CancellationToken,
) -> Result<()> {
	info!("starting vigil engine");
	metrics::init_metrics();

	// Prefer the shared KV store; without one, grouping and locking stay
	// correct on a single node through the in-memory implementation.
	let kv: Arc<dyn KvStore> = match &config.redis_url {
		Some(url) => Arc::new(RedisKv::connect(url).await?),
		None => {
			warn!("no redis url configured; using in-memory grouping (single-node only)");
			Arc::new(MemoryKv::new())
		}
	};

	let grouper = Arc::new(Grouper::new(kv.clone(), config.grouping.clone()));
	let locks = LockManager::new(kv);
	let dispatcher = Arc::new(Dispatcher::new(
		deps.channels.clone(),
		deps.records.clone(),
		deps.settings.clone(),
		reqwest::Client::new(),
	));
	let router = Arc::new(AlertRouter::new(
		grouper.clone(),
		dispatcher.clone(),
		deps.silences.clone(),
		deps.events.clone(),
		locks.clone(),
	));
	let evaluator = Arc::new(RuleEvaluator::new(
		Arc::new(PromClient::new()),
		deps.datasources.clone(),
		deps.events.clone(),
		router,
	));

	let scheduler = Scheduler::new(
		deps.rules.clone(),
		deps.events.clone(),
		evaluator,
		grouper.clone(),
		dispatcher,
		locks,
		config.scheduler.clone(),
		shutdown.clone(),
	);

	if !config.server_addrs.is_empty() {
		let state = ServerState {
			started_at: Utc::now(),
			pid: std::process::id(),
			grouper,
		};
		let addrs = config.server_addrs.clone();
		let server_shutdown = shutdown.clone();
		tokio::spawn(async move {
			tokio::select! {
				() = http_server::start_server(state, addrs) => {}
				() = server_shutdown.cancelled() => {}
			}
		});
	}

	info!("engine started");
	scheduler.run().await;
	info!("engine stopped");
	Ok(())
}

fn install_signal_handlers(shutdown: CancellationToken) {
	let ctrl_c = shutdown.clone();
	tokio::spawn(async move {
		match tokio::signal::ctrl_c().await {
			Ok(()) => {
				info!("received SIGINT, shutting down");
				ctrl_c.cancel();
			}
			Err(err) => error!("unable to listen for shutdown signal: {err}"),
		}
	});

	#[cfg(unix)]
	{
		tokio::spawn(async move {
			use tokio::signal::unix::{SignalKind, signal};
			let mut sigterm =
				signal(SignalKind::terminate()).expect("failed to setup SIGTERM handler");
			sigterm.recv().await;
			info!("received SIGTERM, shutting down");
			shutdown.cancel();
		});
	}
}

/// Convenience constructor for a fully in-memory dependency set.
pub fn memory_deps() -> Deps {
	use crate::repos::memory::{
		MemoryChannels, MemoryDataSources, MemoryEvents, MemoryRecords, MemoryRules,
		MemorySettings, MemorySilences,
	};

	Deps {
		rules: Arc::new(MemoryRules::default()),
		datasources: Arc::new(MemoryDataSources::default()),
		events: Arc::new(MemoryEvents::new()),
		silences: Arc::new(MemorySilences::default()),
		channels: Arc::new(MemoryChannels::default()),
		records: Arc::new(MemoryRecords::new()),
		settings: Arc::new(MemorySettings::default()),
	}
}
