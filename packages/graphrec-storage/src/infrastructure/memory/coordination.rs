//! In-memory lease, ledger and checkpoint stores

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::FaultSwitch;
use crate::domain::clock::{to_chrono, Clock, SystemClock};
use crate::domain::models::{Checkpoint, Lease};
use crate::domain::ports::{CheckpointStore, IdempotencyStore, LeaseStore};
use crate::error::Result;

// ═══════════════════════════════════════════════════════════════════════════
// Leases
// ═══════════════════════════════════════════════════════════════════════════

/// Lease table keyed by job name
///
/// Released or expired rows are kept so the fencing token keeps counting.
#[derive(Clone)]
pub struct InMemoryLeaseStore {
    leases: Arc<Mutex<HashMap<String, Lease>>>,
    clock: Arc<dyn Clock>,
    faults: Arc<FaultSwitch>,
}

impl InMemoryLeaseStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: Arc::new(Mutex::new(HashMap::new())),
            clock,
            faults: Arc::new(FaultSwitch::default()),
        }
    }

    pub fn faults(&self) -> &FaultSwitch {
        &self.faults
    }
}

impl Default for InMemoryLeaseStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn try_acquire(
        &self,
        job_name: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>> {
        self.faults.check("lease store")?;
        let now = self.clock.now();
        let expires_at = now + to_chrono(ttl);
        let mut leases = self.leases.lock();

        let fencing_token = match leases.get(job_name) {
            Some(current) if current.is_valid_at(now) => {
                if current.holder_id != holder_id {
                    return Ok(None);
                }
                current.fencing_token
            }
            Some(previous) => previous.fencing_token + 1,
            None => 1,
        };

        let lease = Lease {
            job_name: job_name.to_string(),
            holder_id: holder_id.to_string(),
            expires_at,
            fencing_token,
        };
        leases.insert(job_name.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn try_renew(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>> {
        self.faults.check("lease store")?;
        let now = self.clock.now();
        let mut leases = self.leases.lock();

        match leases.get_mut(&lease.job_name) {
            Some(current) if current.same_grant(lease) && current.is_valid_at(now) => {
                current.expires_at = now + to_chrono(ttl);
                Ok(Some(current.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<bool> {
        self.faults.check("lease store")?;
        let now = self.clock.now();
        let mut leases = self.leases.lock();

        match leases.get_mut(&lease.job_name) {
            Some(current) if current.same_grant(lease) && current.is_valid_at(now) => {
                current.expires_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn current(&self, job_name: &str) -> Result<Option<Lease>> {
        self.faults.check("lease store")?;
        let now = self.clock.now();
        Ok(self
            .leases
            .lock()
            .get(job_name)
            .filter(|lease| lease.is_valid_at(now))
            .cloned())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Idempotency ledger
// ═══════════════════════════════════════════════════════════════════════════

/// Event id → mark expiry
#[derive(Clone)]
pub struct InMemoryIdempotencyStore {
    marks: Arc<DashMap<String, DateTime<Utc>>>,
    clock: Arc<dyn Clock>,
    faults: Arc<FaultSwitch>,
}

impl InMemoryIdempotencyStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            marks: Arc::new(DashMap::new()),
            clock,
            faults: Arc::new(FaultSwitch::default()),
        }
    }

    pub fn faults(&self) -> &FaultSwitch {
        &self.faults
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn insert_if_absent(&self, event_id: &str, retention: Duration) -> Result<bool> {
        self.faults.check("idempotency store")?;
        let now = self.clock.now();
        let expires_at = now + to_chrono(retention);

        // The shard lock held by the entry makes check-and-insert atomic
        match self.marks.entry(event_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() <= now {
                    occupied.insert(expires_at);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(expires_at);
                Ok(true)
            }
        }
    }

    async fn remove(&self, event_id: &str) -> Result<bool> {
        self.faults.check("idempotency store")?;
        Ok(self.marks.remove(event_id).is_some())
    }

    async fn contains(&self, event_id: &str) -> Result<bool> {
        self.faults.check("idempotency store")?;
        let now = self.clock.now();
        Ok(self
            .marks
            .get(event_id)
            .map_or(false, |expires_at| *expires_at > now))
    }

    async fn purge_expired(&self) -> Result<usize> {
        self.faults.check("idempotency store")?;
        let now = self.clock.now();
        let before = self.marks.len();
        self.marks.retain(|_, expires_at| *expires_at > now);
        Ok(before.saturating_sub(self.marks.len()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Checkpoints
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Clone, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Arc<RwLock<HashMap<String, Checkpoint>>>,
    faults: Arc<FaultSwitch>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &FaultSwitch {
        &self.faults
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, job_name: &str) -> Result<Option<Checkpoint>> {
        self.faults.check("checkpoint store")?;
        Ok(self.checkpoints.read().get(job_name).cloned())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<bool> {
        self.faults.check("checkpoint store")?;
        let mut checkpoints = self.checkpoints.write();
        if let Some(stored) = checkpoints.get(&checkpoint.job_name) {
            if stored.fencing_token > checkpoint.fencing_token {
                return Ok(false);
            }
        }
        checkpoints.insert(checkpoint.job_name.clone(), checkpoint.clone());
        Ok(true)
    }

    async fn clear(&self, job_name: &str, fencing_token: u64) -> Result<bool> {
        self.faults.check("checkpoint store")?;
        let mut checkpoints = self.checkpoints.write();
        match checkpoints.get(job_name) {
            Some(stored) if stored.fencing_token > fencing_token => Ok(false),
            _ => {
                checkpoints.remove(job_name);
                Ok(true)
            }
        }
    }
}
