//! Storage layer for Chatline.
//!
//! Opens the SQLite pool shared by the server and owns the schema of the
//! `users` and `messages` tables. Queries against those tables live in
//! `chatline-messages`.

mod migrations;
mod pool;

pub use migrations::{run_migrations, schema_version, MigrationError, MigrationReport};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError, Synchronous, IN_MEMORY};
