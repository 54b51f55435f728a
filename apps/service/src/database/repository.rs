use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Row, params};
use thiserror::Error;

use super::models::{Caller, CallerId, Tenant, TrustedAddress};
use crate::firewall::Address;
use crate::pool::LibsqlPool;

/// An insert can race with a concurrent delete of the row it collided with.
const UPSERT_ATTEMPTS: usize = 3;

/// Registry-level refusals, surfaced through `anyhow` so callers can downcast
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("tenant '{name}' is still referenced by {callers} caller(s)")]
    TenantInUse { name: String, callers: i64 },
    #[error("tenant name '{0}' already exists")]
    TenantNameTaken(String),
    #[error("tenant {0} not found")]
    TenantNotFound(i64),
}

/// Database trait for abstracting database operations
#[async_trait]
pub trait Database: Send + Sync {
    /// Insert a trust record, or extend the existing one for the same address.
    ///
    /// `expires_at` only ever moves forward. Returns the stored row.
    async fn upsert_trusted(
        &self,
        address: &Address,
        owner: Option<CallerId>,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<TrustedAddress>;

    /// Get the trust record for an address
    async fn get_trusted(&self, address: &Address) -> Result<Option<TrustedAddress>>;

    /// Get all trust records, soonest expiry first
    async fn list_trusted(&self) -> Result<Vec<TrustedAddress>>;

    /// Get every record with `expires_at <= cutoff`
    async fn select_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<TrustedAddress>>;

    /// Delete the record for an address; returns whether a row existed
    async fn delete_trusted(&self, address: &Address) -> Result<bool>;

    /// Delete a selected record only if its expiry is still the one observed
    async fn delete_trusted_if_unchanged(&self, id: i64, expires_at: DateTime<Utc>) -> Result<bool>;

    /// Save a new tenant and return its id
    async fn create_tenant(&self, tenant: &Tenant) -> Result<i64>;

    /// Get a tenant by id
    async fn get_tenant(&self, id: i64) -> Result<Option<Tenant>>;

    /// Get all tenants ordered by name
    async fn list_tenants(&self) -> Result<Vec<Tenant>>;

    /// Delete a tenant; refused while any caller references it
    async fn delete_tenant(&self, id: i64) -> Result<()>;

    /// Link a caller to a tenant (or unlink with `None`)
    async fn assign_caller(&self, caller: CallerId, tenant_id: Option<i64>) -> Result<()>;

    /// Get the caller's account link
    async fn get_caller(&self, caller: CallerId) -> Result<Option<Caller>>;

    /// Follow the caller's account reference to its tenant
    async fn tenant_for_caller(&self, caller: CallerId) -> Result<Option<Tenant>>;
}

/// LibSQL database implementation
pub struct DatabaseImpl {
    pool: LibsqlPool,
}

impl DatabaseImpl {
    /// Create a new database instance from a pool
    pub fn new_from_pool(pool: LibsqlPool) -> Self {
        Self { pool }
    }

    /// Get a connection from the pool
    async fn get_conn(&self) -> Result<deadpool::managed::Object<crate::pool::LibsqlManager>> {
        Ok(self.pool.get().await?)
    }
}

const TRUSTED_COLUMNS: &str = "id, address, owner, created_at, expires_at";
const TENANT_COLUMNS: &str = "id, name, host, channel_user, credential_reference";

fn row_to_trusted(row: &Row) -> Result<TrustedAddress> {
    let raw_address: String = row.get(1)?;
    let address = Address::parse(&raw_address)
        .with_context(|| format!("corrupt address '{raw_address}' in trusted_addresses"))?;

    Ok(TrustedAddress {
        id: Some(row.get(0)?),
        address,
        owner: row.get::<Option<i64>>(2)?.map(CallerId),
        created_at: TrustedAddress::i64_to_timestamp(row.get(3)?),
        expires_at: TrustedAddress::i64_to_timestamp(row.get(4)?),
    })
}

fn row_to_tenant(row: &Row) -> Result<Tenant> {
    Ok(Tenant {
        id: Some(row.get(0)?),
        name: row.get(1)?,
        host: row.get(2)?,
        channel_user: row.get(3)?,
        credential_reference: row.get(4)?,
    })
}

/// SQLite reports uniqueness violations as a constraint failure with this text.
fn is_unique_violation(error: &libsql::Error) -> bool {
    match error {
        libsql::Error::SqliteFailure(code, message) => {
            (code & 0xff) == 19 && message.contains("UNIQUE constraint failed")
        }
        other => other.to_string().contains("UNIQUE constraint failed"),
    }
}

#[async_trait]
impl Database for DatabaseImpl {
    async fn upsert_trusted(
        &self,
        address: &Address,
        owner: Option<CallerId>,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<TrustedAddress> {
        let conn = self.get_conn().await?;
        let address_str = address.to_string();
        let created_at = TrustedAddress::timestamp_to_i64(now);
        let expires_at = TrustedAddress::timestamp_to_i64(expires_at);
        let owner = owner.map(|caller| caller.0);

        for _ in 0..UPSERT_ATTEMPTS {
            let inserted = conn
                .execute(
                    "INSERT INTO trusted_addresses (address, owner, created_at, expires_at) VALUES (?, ?, ?, ?)",
                    params![address_str.clone(), owner, created_at, expires_at],
                )
                .await;

            match inserted {
                Ok(_) => {
                    return Ok(TrustedAddress {
                        id: Some(conn.last_insert_rowid()),
                        address: *address,
                        owner: owner.map(CallerId),
                        created_at: TrustedAddress::i64_to_timestamp(created_at),
                        expires_at: TrustedAddress::i64_to_timestamp(expires_at),
                    });
                }
                Err(e) if is_unique_violation(&e) => {
                    tracing::debug!(address = %address_str, "Address already trusted, extending expiry");
                }
                Err(e) => return Err(e.into()),
            }

            let updated = conn
                .execute(
                    "UPDATE trusted_addresses SET expires_at = MAX(expires_at, ?), owner = COALESCE(?, owner) WHERE address = ?",
                    params![expires_at, owner, address_str.clone()],
                )
                .await?;

            if updated > 0 {
                let mut rows = conn
                    .query(
                        &format!("SELECT {TRUSTED_COLUMNS} FROM trusted_addresses WHERE address = ?"),
                        params![address_str.clone()],
                    )
                    .await?;
                if let Some(row) = rows.next().await? {
                    return row_to_trusted(&row);
                }
            }
            // The conflicting row vanished between insert and update; try inserting again.
        }

        anyhow::bail!("could not record trust for {address_str} after {UPSERT_ATTEMPTS} attempts")
    }

    async fn get_trusted(&self, address: &Address) -> Result<Option<TrustedAddress>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {TRUSTED_COLUMNS} FROM trusted_addresses WHERE address = ?"),
                params![address.to_string()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_trusted(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_trusted(&self) -> Result<Vec<TrustedAddress>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {TRUSTED_COLUMNS} FROM trusted_addresses ORDER BY expires_at ASC, id ASC"),
                (),
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_trusted(&row)?);
        }
        Ok(records)
    }

    async fn select_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<TrustedAddress>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {TRUSTED_COLUMNS} FROM trusted_addresses WHERE expires_at <= ? ORDER BY id ASC"),
                params![TrustedAddress::timestamp_to_i64(cutoff)],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_trusted(&row)?);
        }
        Ok(records)
    }

    async fn delete_trusted(&self, address: &Address) -> Result<bool> {
        let conn = self.get_conn().await?;
        let deleted = conn
            .execute("DELETE FROM trusted_addresses WHERE address = ?", params![address.to_string()])
            .await?;
        Ok(deleted > 0)
    }

    async fn delete_trusted_if_unchanged(&self, id: i64, expires_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.get_conn().await?;
        let deleted = conn
            .execute(
                "DELETE FROM trusted_addresses WHERE id = ? AND expires_at = ?",
                params![id, TrustedAddress::timestamp_to_i64(expires_at)],
            )
            .await?;
        Ok(deleted > 0)
    }

    async fn create_tenant(&self, tenant: &Tenant) -> Result<i64> {
        let conn = self.get_conn().await?;
        let created_at = chrono::Utc::now().timestamp();

        let inserted = conn
            .execute(
                "INSERT INTO tenants (name, host, channel_user, credential_reference, created_at) VALUES (?, ?, ?, ?, ?)",
                params![
                    tenant.name.clone(),
                    tenant.host.clone(),
                    tenant.channel_user.clone(),
                    tenant.credential_reference.clone(),
                    created_at
                ],
            )
            .await;

        match inserted {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => {
                Err(StoreError::TenantNameTaken(tenant.name.clone()).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_tenant(&self, id: i64) -> Result<Option<Tenant>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(&format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = ?"), params![id])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_tenant(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let conn = self.get_conn().await?;
        let mut rows =
            conn.query(&format!("SELECT {TENANT_COLUMNS} FROM tenants ORDER BY name ASC"), ()).await?;

        let mut tenants = Vec::new();
        while let Some(row) = rows.next().await? {
            tenants.push(row_to_tenant(&row)?);
        }
        Ok(tenants)
    }

    async fn delete_tenant(&self, id: i64) -> Result<()> {
        let tenant = self.get_tenant(id).await?.ok_or(StoreError::TenantNotFound(id))?;

        let conn = self.get_conn().await?;
        let mut rows = conn
            .query("SELECT COUNT(*) FROM callers WHERE tenant_id = ?", params![id])
            .await?;
        let callers: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };

        if callers > 0 {
            return Err(StoreError::TenantInUse { name: tenant.name, callers }.into());
        }

        // ON DELETE RESTRICT still guards a caller linked after the count.
        conn.execute("DELETE FROM tenants WHERE id = ?", params![id]).await?;
        Ok(())
    }

    async fn assign_caller(&self, caller: CallerId, tenant_id: Option<i64>) -> Result<()> {
        if let Some(id) = tenant_id {
            if self.get_tenant(id).await?.is_none() {
                return Err(StoreError::TenantNotFound(id).into());
            }
        }

        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO callers (id, tenant_id) VALUES (?, ?) ON CONFLICT(id) DO UPDATE SET tenant_id = excluded.tenant_id",
            params![caller.0, tenant_id],
        )
        .await?;
        Ok(())
    }

    async fn get_caller(&self, caller: CallerId) -> Result<Option<Caller>> {
        let conn = self.get_conn().await?;
        let mut rows =
            conn.query("SELECT id, tenant_id FROM callers WHERE id = ?", params![caller.0]).await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Caller {
                id: CallerId(row.get(0)?),
                tenant_id: row.get(1)?,
            })),
            None => Ok(None),
        }
    }

    async fn tenant_for_caller(&self, caller: CallerId) -> Result<Option<Tenant>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT t.id, t.name, t.host, t.channel_user, t.credential_reference
                 FROM callers c JOIN tenants t ON t.id = c.tenant_id
                 WHERE c.id = ?",
                params![caller.0],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_tenant(&row)?)),
            None => Ok(None),
        }
    }
}
