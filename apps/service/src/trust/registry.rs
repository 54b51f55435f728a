//! Caller → tenant resolution.
//!
//! A caller reaches an enforcement host through its account link. Callers
//! without a link fall back to the configured default tenant, if any; with no
//! default they resolve to nothing and every operation for them is inert.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::database::Database;
use crate::database::models::{CallerId, Tenant, TrustedAddress};

/// Records sharing one enforcement host.
#[derive(Debug, Clone)]
pub struct TenantBatch {
    pub tenant: Tenant,
    pub records: Vec<TrustedAddress>,
}

/// Result of splitting a selection by resolved tenant.
#[derive(Debug, Default)]
pub struct Grouping {
    pub batches: Vec<TenantBatch>,
    /// Records whose owner resolves to no tenant at all.
    pub orphans: Vec<TrustedAddress>,
}

pub struct TenantRegistry {
    database: Arc<dyn Database>,
    fallback: Option<Tenant>,
}

impl TenantRegistry {
    pub fn new(database: Arc<dyn Database>, fallback: Option<Tenant>) -> Self {
        Self { database, fallback }
    }

    pub fn fallback(&self) -> Option<&Tenant> {
        self.fallback.as_ref()
    }

    /// Resolve the tenant for a caller, fresh from the store on every call
    pub async fn resolve(&self, caller: Option<CallerId>) -> Result<Option<Tenant>> {
        if let Some(caller) = caller {
            if let Some(tenant) = self.database.tenant_for_caller(caller).await? {
                return Ok(Some(tenant));
            }
            debug!(%caller, "Caller has no account link, using fallback tenant");
        }
        Ok(self.fallback.clone())
    }

    /// Every tenant an address could live on: stored tenants plus the fallback
    pub async fn all_tenants(&self) -> Result<Vec<Tenant>> {
        let mut tenants = self.database.list_tenants().await?;
        if let Some(fallback) = &self.fallback {
            tenants.push(fallback.clone());
        }
        Ok(tenants)
    }

    /// Group records by resolved tenant, resolving each distinct owner once
    pub async fn group_by_tenant(&self, records: Vec<TrustedAddress>) -> Result<Grouping> {
        let mut resolved: HashMap<Option<CallerId>, Option<Tenant>> = HashMap::new();
        let mut batches: BTreeMap<Option<i64>, TenantBatch> = BTreeMap::new();
        let mut orphans = Vec::new();

        for record in records {
            let tenant = match resolved.get(&record.owner) {
                Some(tenant) => tenant.clone(),
                None => {
                    let tenant = self.resolve(record.owner).await?;
                    resolved.insert(record.owner, tenant.clone());
                    tenant
                }
            };

            match tenant {
                Some(tenant) => batches
                    .entry(tenant.id)
                    .or_insert_with(|| TenantBatch { tenant, records: Vec::new() })
                    .records
                    .push(record),
                None => orphans.push(record),
            }
        }

        Ok(Grouping { batches: batches.into_values().collect(), orphans })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::tests::{TestEnv, record};

    #[tokio::test]
    async fn test_resolve_follows_account_link() -> Result<()> {
        let env = TestEnv::new(None).await?;
        let tenant_id = env.add_tenant("prod", "pbx-prod").await?;
        env.database.assign_caller(CallerId(1), Some(tenant_id)).await?;

        let tenant = env.registry.resolve(Some(CallerId(1))).await?.unwrap();
        assert_eq!(tenant.host, "pbx-prod");
        Ok(())
    }

    #[tokio::test]
    async fn test_unlinked_caller_without_fallback_is_inert() -> Result<()> {
        let env = TestEnv::new(None).await?;
        assert!(env.registry.resolve(Some(CallerId(9))).await?.is_none());
        assert!(env.registry.resolve(None).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_unlinked_caller_uses_fallback() -> Result<()> {
        let env = TestEnv::new(Some("pbx-legacy")).await?;
        let tenant = env.registry.resolve(Some(CallerId(9))).await?.unwrap();
        assert_eq!(tenant.id, None);
        assert_eq!(tenant.host, "pbx-legacy");
        Ok(())
    }

    #[tokio::test]
    async fn test_resolution_is_not_cached_between_calls() -> Result<()> {
        let env = TestEnv::new(None).await?;
        let a = env.add_tenant("a", "pbx-a").await?;
        let b = env.add_tenant("b", "pbx-b").await?;

        env.database.assign_caller(CallerId(1), Some(a)).await?;
        assert_eq!(env.registry.resolve(Some(CallerId(1))).await?.unwrap().host, "pbx-a");

        env.database.assign_caller(CallerId(1), Some(b)).await?;
        assert_eq!(env.registry.resolve(Some(CallerId(1))).await?.unwrap().host, "pbx-b");
        Ok(())
    }

    #[tokio::test]
    async fn test_group_by_tenant() -> Result<()> {
        let env = TestEnv::new(None).await?;
        let a = env.add_tenant("a", "pbx-a").await?;
        let b = env.add_tenant("b", "pbx-b").await?;
        env.database.assign_caller(CallerId(1), Some(a)).await?;
        env.database.assign_caller(CallerId(2), Some(b)).await?;
        env.database.assign_caller(CallerId(3), Some(a)).await?;

        let grouping = env
            .registry
            .group_by_tenant(vec![
                record(1, "10.0.0.1", Some(1)),
                record(2, "10.0.0.2", Some(2)),
                record(3, "10.0.0.3", Some(3)),
                record(4, "10.0.0.4", None),
            ])
            .await?;

        assert_eq!(grouping.batches.len(), 2);
        let hosts: Vec<(&str, usize)> = grouping
            .batches
            .iter()
            .map(|batch| (batch.tenant.host.as_str(), batch.records.len()))
            .collect();
        assert_eq!(hosts, vec![("pbx-a", 2), ("pbx-b", 1)]);
        assert_eq!(grouping.orphans.len(), 1);
        Ok(())
    }
}
