//! PostgreSQL collaborators for the vigil engine: a mobc connection pool
//! and implementations of the engine's repository traits with typed query
//! methods.

#![deny(rust_2018_idioms)]

pub mod pool;
pub mod repos;

pub use pool::{PgPool, create_pool};
pub use repos::{
	PgChannels, PgDataSources, PgEvents, PgRecords, PgRules, PgSettings, PgSilences, pg_deps,
};
