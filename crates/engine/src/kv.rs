//! Shared KV store abstraction.
//!
//! The engine only needs the handful of atomic primitives the grouping and
//! locking layers are built on: GET, SETEX, SET NX EX, DEL, a scripted
//! compare-and-delete, and prefix scans. `RedisKv` is the distributed
//! implementation; `MemoryKv` carries identical semantics for single-node
//! operation and tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::info;

use crate::error::Result;

#[async_trait]
pub trait KvStore: Send + Sync {
	async fn get(&self, key: &str) -> Result<Option<String>>;
	/// Set with a TTL, unconditionally.
	async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
	/// Atomic set-if-absent with a TTL. Returns whether the key was set.
	async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;
	async fn del(&self, key: &str) -> Result<()>;
	/// Delete only if the current value equals `expected`. Returns whether
	/// a deletion happened.
	async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;
	async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

const COMPARE_AND_DELETE: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
	return redis.call('del', KEYS[1])
else
	return 0
end
"#;

pub struct RedisKv {
	conn: redis::aio::ConnectionManager,
	cad_script: redis::Script,
}

impl RedisKv {
	pub async fn connect(url: &str) -> Result<Self> {
		let client = redis::Client::open(url)?;
		let conn = client.get_connection_manager().await?;
		info!("connected to redis");
		Ok(Self {
			conn,
			cad_script: redis::Script::new(COMPARE_AND_DELETE),
		})
	}
}

#[async_trait]
impl KvStore for RedisKv {
	async fn get(&self, key: &str) -> Result<Option<String>> {
		let mut conn = self.conn.clone();
		Ok(conn.get(key).await?)
	}

	async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
		let mut conn = self.conn.clone();
		let _: () = conn.set_ex(key, value, ttl.as_secs()).await?;
		Ok(())
	}

	async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
		let mut conn = self.conn.clone();
		let reply: Option<String> = redis::cmd("SET")
			.arg(key)
			.arg(value)
			.arg("NX")
			.arg("EX")
			.arg(ttl.as_secs())
			.query_async(&mut conn)
			.await?;
		Ok(reply.is_some())
	}

	async fn del(&self, key: &str) -> Result<()> {
		let mut conn = self.conn.clone();
		let _: () = conn.del(key).await?;
		Ok(())
	}

	async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
		let mut conn = self.conn.clone();
		let deleted: i64 = self
			.cad_script
			.key(key)
			.arg(expected)
			.invoke_async(&mut conn)
			.await?;
		Ok(deleted > 0)
	}

	async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
		let mut conn = self.conn.clone();
		let pattern = format!("{prefix}*");
		let mut keys = Vec::new();
		let mut iter: redis::AsyncIter<'_, String> = conn.scan_match(pattern).await?;
		while let Some(key) = iter.next_item().await {
			keys.push(key);
		}
		Ok(keys)
	}
}

#[derive(Default)]
pub struct MemoryKv {
	entries: Mutex<HashMap<String, Entry>>,
}

struct Entry {
	value: String,
	expires_at: Instant,
}

impl MemoryKv {
	pub fn new() -> Self {
		Self::default()
	}

	fn live(entry: &Entry) -> bool {
		entry.expires_at > Instant::now()
	}
}

#[async_trait]
impl KvStore for MemoryKv {
	async fn get(&self, key: &str) -> Result<Option<String>> {
		let mut entries = self.entries.lock().expect("kv mutex poisoned");
		let value = entries
			.get(key)
			.filter(|entry| Self::live(entry))
			.map(|entry| entry.value.clone());
		if value.is_none() {
			entries.remove(key);
		}
		Ok(value)
	}

	async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
		let mut entries = self.entries.lock().expect("kv mutex poisoned");
		entries.insert(
			key.to_string(),
			Entry {
				value: value.to_string(),
				expires_at: Instant::now() + ttl,
			},
		);
		Ok(())
	}

	async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
		let mut entries = self.entries.lock().expect("kv mutex poisoned");
		if entries.get(key).is_some_and(Self::live) {
			return Ok(false);
		}
		entries.insert(
			key.to_string(),
			Entry {
				value: value.to_string(),
				expires_at: Instant::now() + ttl,
			},
		);
		Ok(true)
	}

	async fn del(&self, key: &str) -> Result<()> {
		self.entries.lock().expect("kv mutex poisoned").remove(key);
		Ok(())
	}

	async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
		let mut entries = self.entries.lock().expect("kv mutex poisoned");
		let held = entries
			.get(key)
			.is_some_and(|entry| Self::live(entry) && entry.value == expected);
		if held {
			entries.remove(key);
		}
		Ok(held)
	}

	async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
		let entries = self.entries.lock().expect("kv mutex poisoned");
		Ok(entries
			.iter()
			.filter(|(key, entry)| key.starts_with(prefix) && Self::live(entry))
			.map(|(key, _)| key.clone())
			.collect())
	}
}
