/// Database abstraction layer
///
/// Persists the trust store (`trusted_addresses`) and the tenant registry
/// tables (`tenants`, `callers`) in a local LibSQL (SQLite) file.

pub mod repository;
pub mod migrations;
pub mod models;

pub use repository::{Database, DatabaseImpl, StoreError};

use anyhow::Result;

/// Initialize database with schema
pub async fn initialize_database(conn: &libsql::Connection) -> Result<()> {
    migrations::run_migrations(conn).await
}
