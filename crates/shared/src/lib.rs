//! Tunnelshop shared infrastructure
//!
//! Database pool construction, embedded migrations and tracing setup used by
//! both the API server and the background worker.

pub mod db;
pub mod telemetry;

pub use db::{create_pool, run_migrations, DbError};
pub use telemetry::init_tracing;
