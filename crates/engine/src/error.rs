pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Engine error taxonomy.
///
/// Every variant maps to one recovery policy: transport and query errors
/// make the current tick a no-op for that rule, persistence errors roll the
/// tick back, and configuration and channel errors fail a single delivery
/// with a recorded message.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("transport error: {0}")]
	Transport(#[from] reqwest::Error),

	#[error("data source query failed: {0}")]
	Query(String),

	#[error("persistence error: {0}")]
	Persistence(String),

	#[error("kv store error: {0}")]
	Kv(String),

	#[error("configuration error: {0}")]
	Config(String),

	#[error("channel send failed: {0}")]
	Channel(String),
}

impl From<redis::RedisError> for Error {
	fn from(err: redis::RedisError) -> Self {
		Self::Kv(err.to_string())
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Self::Kv(format!("serializing kv record: {err}"))
	}
}
