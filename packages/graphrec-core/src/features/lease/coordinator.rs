use graphrec_storage::{Lease, LeaseStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::errors::Result;
use crate::shared::CallPolicy;

#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    Acquired(Lease),
    /// Another holder has a valid lease
    Busy,
}

impl AcquireOutcome {
    pub fn lease(self) -> Option<Lease> {
        match self {
            AcquireOutcome::Acquired(lease) => Some(lease),
            AcquireOutcome::Busy => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenewOutcome {
    Renewed(Lease),
    /// Expired or taken over; the holder must stop work immediately
    Lost,
}

/// Acquire / renew / release on top of a [`LeaseStore`]
///
/// Store calls carry the configured deadline and are retried on transient
/// failures; exhausted retries surface as `CoreError::Unavailable`.
#[derive(Clone)]
pub struct LeaseCoordinator {
    store: Arc<dyn LeaseStore>,
    policy: CallPolicy,
}

impl LeaseCoordinator {
    pub fn new(store: Arc<dyn LeaseStore>, policy: CallPolicy) -> Self {
        Self { store, policy }
    }

    pub async fn acquire(
        &self,
        job_name: &str,
        holder_id: &str,
        lease_duration: Duration,
    ) -> Result<AcquireOutcome> {
        let granted = self
            .policy
            .call("lease.acquire", || {
                self.store.try_acquire(job_name, holder_id, lease_duration)
            })
            .await?;

        Ok(match granted {
            Some(lease) => {
                info!(
                    job = job_name,
                    holder = holder_id,
                    fencing_token = lease.fencing_token,
                    expires_at = %lease.expires_at,
                    "lease acquired"
                );
                AcquireOutcome::Acquired(lease)
            }
            None => {
                debug!(job = job_name, holder = holder_id, "lease busy");
                AcquireOutcome::Busy
            }
        })
    }

    pub async fn renew(&self, lease: &Lease, lease_duration: Duration) -> Result<RenewOutcome> {
        let renewed = self
            .policy
            .call("lease.renew", || self.store.try_renew(lease, lease_duration))
            .await?;

        Ok(match renewed {
            Some(lease) => {
                debug!(job = %lease.job_name, expires_at = %lease.expires_at, "lease renewed");
                RenewOutcome::Renewed(lease)
            }
            None => {
                info!(job = %lease.job_name, holder = %lease.holder_id, "lease lost");
                RenewOutcome::Lost
            }
        })
    }

    /// Releasing a lease that is no longer held is a no-op
    pub async fn release(&self, lease: &Lease) -> Result<()> {
        let released = self
            .policy
            .call("lease.release", || self.store.release(lease))
            .await?;
        if released {
            info!(job = %lease.job_name, holder = %lease.holder_id, "lease released");
        } else {
            debug!(job = %lease.job_name, "release of a lease no longer held");
        }
        Ok(())
    }

    pub async fn current(&self, job_name: &str) -> Result<Option<Lease>> {
        self.policy
            .call("lease.current", || self.store.current(job_name))
            .await
    }
}
