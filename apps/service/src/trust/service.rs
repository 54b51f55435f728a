use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::clock::Clock;
use super::registry::TenantRegistry;
use crate::database::Database;
use crate::database::models::{CallerId, TrustedAddress};
use crate::firewall::{Address, FirewallError, FirewallErrorKind, FirewallProvider};

#[derive(Debug, Error)]
pub enum TrustError {
    #[error(transparent)]
    Firewall(#[from] FirewallError),
    #[error("trust store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl TrustError {
    /// Kind of the remote failure, if this was one
    pub fn firewall_kind(&self) -> Option<FirewallErrorKind> {
        match self {
            TrustError::Firewall(e) => Some(e.kind()),
            TrustError::Store(_) => None,
        }
    }
}

/// Local records compared against one tenant's live listing.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    pub tenant: String,
    /// Recorded locally but not present on the firewall.
    pub missing_remote: Vec<String>,
    /// Present on the firewall with no local record.
    pub unknown_remote: Vec<String>,
    /// Set when the listing could not be read.
    pub error: Option<String>,
}

impl DriftReport {
    pub fn is_consistent(&self) -> bool {
        self.error.is_none() && self.missing_remote.is_empty() && self.unknown_remote.is_empty()
    }
}

/// Coordinates the firewall gateways with the trust store.
///
/// Remote confirmation always comes first: no local record is created or
/// extended unless the enforcement host reported success.
pub struct TrustService {
    database: Arc<dyn Database>,
    registry: Arc<TenantRegistry>,
    firewalls: Arc<dyn FirewallProvider>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl TrustService {
    pub fn new(
        database: Arc<dyn Database>,
        registry: Arc<TenantRegistry>,
        firewalls: Arc<dyn FirewallProvider>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self { database, registry, firewalls, clock, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Trust `address` on the caller's firewall and record it until now + TTL.
    ///
    /// Returns `Ok(None)` when the caller resolves to no tenant. If the record
    /// cannot be stored, the remote trust is undone before the error returns.
    pub async fn trust(
        &self,
        address: &Address,
        caller: Option<CallerId>,
    ) -> Result<Option<TrustedAddress>, TrustError> {
        let now = self.clock.now();

        let Some(tenant) = self.registry.resolve(caller).await? else {
            debug!(%address, ?caller, "No tenant for caller, skipping trust");
            return Ok(None);
        };

        let firewall = self.firewalls.for_tenant(&tenant)?;
        if let Err(e) = firewall.trust(address).await {
            warn!(%address, tenant = %tenant.name, kind = %e.kind(), "Remote trust failed: {e}");
            return Err(e.into());
        }

        let record = match self.database.upsert_trusted(address, caller, now, now + self.ttl).await {
            Ok(record) => record,
            Err(e) => {
                // Without a row the sweeper would never see this address again.
                match firewall.untrust(address).await {
                    Ok(()) => error!(%address, tenant = %tenant.name, "Failed to record trust, remote trust rolled back: {e:#}"),
                    Err(untrust) => error!(
                        %address,
                        tenant = %tenant.name,
                        "Failed to record trust and to roll back remote trust ({untrust}): {e:#}"
                    ),
                }
                return Err(TrustError::Store(e));
            }
        };
        info!(
            %address,
            tenant = %tenant.name,
            expires_at = %record.expires_at,
            "Address trusted"
        );
        Ok(Some(record))
    }

    /// Untrust `address` remotely and drop its local record either way.
    ///
    /// Returns whether a local record existed. A remote failure is returned
    /// after the local record has been removed.
    pub async fn revoke(&self, address: &Address) -> Result<bool, TrustError> {
        let record = self.database.get_trusted(address).await?;
        let owner = record.as_ref().and_then(|r| r.owner);

        let remote = match self.registry.resolve(owner).await? {
            Some(tenant) => match self.firewalls.for_tenant(&tenant) {
                Ok(firewall) => firewall.untrust(address).await,
                Err(e) => Err(e),
            },
            None => {
                debug!(%address, "No tenant for address, skipping remote untrust");
                Ok(())
            }
        };

        let removed = self.database.delete_trusted(address).await?;

        match remote {
            Ok(()) => {
                info!(%address, removed, "Address revoked");
                Ok(removed)
            }
            Err(e) => {
                warn!(%address, removed, kind = %e.kind(), "Remote untrust failed, local record removed anyway: {e}");
                Err(e.into())
            }
        }
    }

    /// Ask the firewall itself, not the local store.
    pub async fn is_trusted(&self, address: &Address, caller: Option<CallerId>) -> bool {
        let tenant = match self.registry.resolve(caller).await {
            Ok(Some(tenant)) => tenant,
            Ok(None) => return false,
            Err(e) => {
                warn!(%address, "Tenant resolution failed: {e:#}");
                return false;
            }
        };

        let listing = match self.firewalls.for_tenant(&tenant) {
            Ok(firewall) => firewall.list_trusted().await,
            Err(e) => Err(e),
        };

        match listing {
            Ok(entries) => entries.iter().any(|entry| address.matches_listing_entry(entry)),
            Err(e) => {
                warn!(%address, tenant = %tenant.name, "Could not read trusted listing: {e}");
                false
            }
        }
    }

    /// Compare local records with every tenant's live listing.
    pub async fn audit(&self) -> Result<Vec<DriftReport>, TrustError> {
        let records = self.database.list_trusted().await?;
        let mut grouping = self.registry.group_by_tenant(records).await?;

        let mut reports = Vec::new();
        for tenant in self.registry.all_tenants().await? {
            let local = grouping
                .batches
                .iter()
                .position(|batch| batch.tenant.id == tenant.id)
                .map(|index| grouping.batches.swap_remove(index).records)
                .unwrap_or_default();

            let listing = match self.firewalls.for_tenant(&tenant) {
                Ok(firewall) => firewall.list_trusted().await,
                Err(e) => Err(e),
            };

            let report = match listing {
                Ok(entries) => DriftReport {
                    tenant: tenant.name.clone(),
                    missing_remote: local
                        .iter()
                        .filter(|r| !entries.iter().any(|e| r.address.matches_listing_entry(e)))
                        .map(|r| r.address.to_string())
                        .collect(),
                    unknown_remote: entries
                        .iter()
                        .filter(|e| !local.iter().any(|r| r.address.matches_listing_entry(e)))
                        .cloned()
                        .collect(),
                    error: None,
                },
                Err(e) => DriftReport {
                    tenant: tenant.name.clone(),
                    missing_remote: Vec::new(),
                    unknown_remote: Vec::new(),
                    error: Some(e.to_string()),
                },
            };

            if !report.is_consistent() {
                warn!(
                    tenant = %report.tenant,
                    missing_remote = report.missing_remote.len(),
                    unknown_remote = report.unknown_remote.len(),
                    "Trust state drift detected"
                );
            }
            reports.push(report);
        }

        Ok(reports)
    }
}
