use std::str::FromStr;
use std::time::Duration;

use mobc::{Connection, Pool};
use mobc_postgres::PgConnectionManager;
use tokio_postgres::NoTls;
use tracing::debug;

use vigil_engine::error::{Error, Result};

pub type PgConnection = Connection<PgConnectionManager<NoTls>>;

#[derive(Clone)]
pub struct PgPool {
	inner: Pool<PgConnectionManager<NoTls>>,
}

impl PgPool {
	/// Returns a single connection, either fresh or reused from the pool.
	pub async fn get(&self) -> Result<PgConnection> {
		self.inner
			.get()
			.await
			.map_err(|err| Error::Persistence(format!("acquiring connection: {err}")))
	}
}

/// Create a connection pool from a `postgresql://` connection URL and
/// verify it with a round-trip query.
pub async fn create_pool(url: &str, application_name: &str) -> Result<PgPool> {
	let mut config = tokio_postgres::Config::from_str(url)
		.map_err(|err| Error::Config(format!("parsing connection url: {err}")))?;
	config.application_name(application_name);

	debug!("creating postgres pool");
	let manager = PgConnectionManager::new(config, NoTls);
	let pool = PgPool {
		inner: Pool::builder()
			.max_open(20)
			.max_lifetime(Some(Duration::from_secs(3600)))
			.build(manager),
	};

	debug!("checking postgres pool");
	let conn = pool.get().await?;
	conn.simple_query("SELECT 1")
		.await
		.map_err(|err| Error::Persistence(format!("checking connection: {err}")))?;

	Ok(pool)
}
