use anyhow::Result;
use libsql::Connection;

/// Schema version - increment when making schema changes
const SCHEMA_VERSION: i32 = 2;

/// Run database migrations
///
/// This is the single source of truth for database schema.
pub async fn run_migrations(conn: &Connection) -> Result<()> {
    // Create schema_migrations table first (tracks applied migrations)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL,
            description TEXT
        )",
        (),
    )
    .await?;

    let current_version = get_current_version(conn).await?;

    if current_version >= SCHEMA_VERSION {
        tracing::info!("Database schema is up to date (version {})", current_version);
        return Ok(());
    }

    tracing::info!("Running migrations from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        run_migration_v1(conn).await?;
        record_migration(conn, 1, "Initial schema").await?;
    }

    if current_version < 2 {
        run_migration_v2(conn).await?;
        record_migration(conn, 2, "Add expiry and ownership indexes").await?;
    }

    tracing::info!("Database migrations completed successfully (now at version {})", SCHEMA_VERSION);
    Ok(())
}

/// Get current schema version from database
async fn get_current_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn.query("SELECT MAX(version) FROM schema_migrations", ()).await?;

    if let Some(row) = rows.next().await? {
        let version: Option<i32> = row.get(0)?;
        Ok(version.unwrap_or(0))
    } else {
        Ok(0)
    }
}

/// Record that a migration was applied
async fn record_migration(conn: &Connection, version: i32, description: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    conn.execute(
        "INSERT INTO schema_migrations (version, applied_at, description) VALUES (?, ?, ?)",
        libsql::params![version, now, description],
    )
    .await?;

    tracing::info!("Applied migration v{}: {}", version, description);
    Ok(())
}

/// Migration v1: Initial schema
/// Creates tenants, callers and trusted_addresses tables
async fn run_migration_v1(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS tenants (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            host TEXT NOT NULL,
            channel_user TEXT NOT NULL DEFAULT 'root',
            credential_reference TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    // Callers are created by the authentication flow; only the account link lives here.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS callers (
            id INTEGER PRIMARY KEY,
            tenant_id INTEGER,
            FOREIGN KEY (tenant_id) REFERENCES tenants(id) ON DELETE RESTRICT
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS trusted_addresses (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            address TEXT NOT NULL UNIQUE,
            owner INTEGER,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            CHECK (expires_at > created_at)
        )",
        (),
    )
    .await?;

    Ok(())
}

/// Migration v2: indexes used by the sweeper and the registry
async fn run_migration_v2(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_trusted_addresses_expires_at ON trusted_addresses(expires_at)",
        (),
    )
    .await?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_trusted_addresses_owner ON trusted_addresses(owner)",
        (),
    )
    .await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_callers_tenant ON callers(tenant_id)", ()).await?;

    tracing::info!("Added expiry and ownership indexes");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_migrations_are_idempotent() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("migrations.db");
        let db = libsql::Builder::new_local(path.to_string_lossy().to_string()).build().await?;
        let conn = db.connect()?;

        run_migrations(&conn).await?;
        run_migrations(&conn).await?;

        assert_eq!(get_current_version(&conn).await?, SCHEMA_VERSION);

        let mut rows = conn.query("SELECT COUNT(*) FROM schema_migrations", ()).await?;
        let row = rows.next().await?.expect("count row");
        assert_eq!(row.get::<i64>(0)?, SCHEMA_VERSION as i64);
        Ok(())
    }

    #[tokio::test]
    async fn test_expiry_check_constraint() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("constraint.db");
        let db = libsql::Builder::new_local(path.to_string_lossy().to_string()).build().await?;
        let conn = db.connect()?;
        run_migrations(&conn).await?;

        let result = conn
            .execute(
                "INSERT INTO trusted_addresses (address, owner, created_at, expires_at) VALUES ('10.0.0.1', NULL, 100, 100)",
                (),
            )
            .await;
        assert!(result.is_err());
        Ok(())
    }
}
