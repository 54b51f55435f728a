//! Periodic reconciliation of expired trust records with the firewalls.
//!
//! Each run takes its cutoff once, selects every record expired at that
//! cutoff, untrusts the addresses per tenant and then deletes the selected
//! rows. Deletion is scoped by the expiry value the run observed, so a record
//! renewed to a later expiry in the meantime survives. A renewal that lands
//! between select and delete without changing the stored expiry is an
//! accepted race.
//!
//! Runs never overlap: a trigger that fires while a run is in flight is
//! skipped.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::clock::Clock;
use super::registry::{TenantBatch, TenantRegistry};
use crate::database::Database;
use crate::database::models::TrustedAddress;
use crate::firewall::{FirewallError, FirewallProvider};

/// One address the run could not untrust.
#[derive(Debug, Clone, Serialize)]
pub struct SweepFailure {
    pub address: String,
    pub tenant: String,
    pub error: String,
}

/// What a single run did.
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub cutoff: DateTime<Utc>,
    pub selected: usize,
    pub untrusted: usize,
    pub failures: Vec<SweepFailure>,
    /// Rows deleted from the store.
    pub removed: usize,
    /// Rows kept for retry because their remote untrust failed.
    pub retained: usize,
    /// Rows left alone because they were renewed after selection.
    pub renewed: usize,
    /// Rows with no resolvable tenant, deleted locally only.
    pub orphaned: usize,
}

impl SweepReport {
    fn empty(cutoff: DateTime<Utc>) -> Self {
        Self {
            cutoff,
            selected: 0,
            untrusted: 0,
            failures: Vec::new(),
            removed: 0,
            retained: 0,
            renewed: 0,
            orphaned: 0,
        }
    }
}

/// Per-address remote outcome for one tenant batch.
struct BatchOutcome {
    tenant: String,
    results: Vec<(TrustedAddress, Result<(), FirewallError>)>,
}

pub struct Sweeper {
    database: Arc<dyn Database>,
    registry: Arc<TenantRegistry>,
    firewalls: Arc<dyn FirewallProvider>,
    clock: Arc<dyn Clock>,
    retain_failed: bool,
    running: Mutex<()>,
}

impl Sweeper {
    pub fn new(
        database: Arc<dyn Database>,
        registry: Arc<TenantRegistry>,
        firewalls: Arc<dyn FirewallProvider>,
        clock: Arc<dyn Clock>,
        retain_failed: bool,
    ) -> Self {
        Self { database, registry, firewalls, clock, retain_failed, running: Mutex::new(()) }
    }

    /// Run one sweep unless another is already in flight.
    ///
    /// Returns `None` when skipped or when the run could not complete; the
    /// failure is logged, never returned.
    pub async fn run_once(&self) -> Option<SweepReport> {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("Previous sweep still running, skipping this trigger");
            return None;
        };

        match self.sweep().await {
            Ok(report) => {
                if report.selected > 0 {
                    info!(
                        selected = report.selected,
                        untrusted = report.untrusted,
                        failed = report.failures.len(),
                        removed = report.removed,
                        retained = report.retained,
                        renewed = report.renewed,
                        orphaned = report.orphaned,
                        "Sweep completed"
                    );
                } else {
                    debug!("Sweep completed, nothing expired");
                }
                Some(report)
            }
            Err(e) => {
                error!("Sweep aborted: {e:#}");
                None
            }
        }
    }

    /// Start the background loop; the first run happens immediately.
    pub fn start_periodic(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!("Sweeper started (every {}s)", period.as_secs());
            loop {
                interval.tick().await;
                self.run_once().await;
            }
        })
    }

    async fn sweep(&self) -> Result<SweepReport> {
        let cutoff = self.clock.now();
        let expired = self.database.select_expired(cutoff).await?;

        let mut report = SweepReport::empty(cutoff);
        if expired.is_empty() {
            return Ok(report);
        }
        report.selected = expired.len();

        let grouping = self.registry.group_by_tenant(expired).await?;

        let outcomes = join_all(grouping.batches.into_iter().map(|batch| self.untrust_batch(batch))).await;

        for outcome in outcomes {
            for (record, result) in outcome.results {
                match result {
                    Ok(()) => {
                        report.untrusted += 1;
                        self.delete_selected(&record, &mut report).await;
                    }
                    Err(e) => {
                        warn!(address = %record.address, tenant = %outcome.tenant, kind = %e.kind(), "Failed to untrust expired address: {e}");
                        report.failures.push(SweepFailure {
                            address: record.address.to_string(),
                            tenant: outcome.tenant.clone(),
                            error: e.to_string(),
                        });
                        if self.retain_failed {
                            report.retained += 1;
                        } else {
                            self.delete_selected(&record, &mut report).await;
                        }
                    }
                }
            }
        }

        for record in grouping.orphans {
            warn!(address = %record.address, owner = ?record.owner, "Expired address has no tenant, removing local record only");
            report.orphaned += 1;
            self.delete_selected(&record, &mut report).await;
        }

        Ok(report)
    }

    /// Untrust every address of one tenant; failures stay per address.
    async fn untrust_batch(&self, batch: TenantBatch) -> BatchOutcome {
        let TenantBatch { tenant, records } = batch;

        let firewall = match self.firewalls.for_tenant(&tenant) {
            Ok(firewall) => firewall,
            Err(e) => {
                return BatchOutcome {
                    tenant: tenant.name,
                    results: records.into_iter().map(|r| (r, Err(e.clone()))).collect(),
                };
            }
        };

        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let result = firewall.untrust(&record.address).await;
            results.push((record, result));
        }

        BatchOutcome { tenant: tenant.name, results }
    }

    async fn delete_selected(&self, record: &TrustedAddress, report: &mut SweepReport) {
        let Some(id) = record.id else {
            return;
        };

        match self.database.delete_trusted_if_unchanged(id, record.expires_at).await {
            Ok(true) => report.removed += 1,
            Ok(false) => {
                debug!(address = %record.address, "Record renewed since selection, keeping it");
                report.renewed += 1;
            }
            Err(e) => {
                warn!(address = %record.address, "Failed to delete expired record: {e:#}");
            }
        }
    }
}
