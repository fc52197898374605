//! In-memory partitioned event log and dead-letter sink

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::FaultSwitch;
use crate::domain::models::{DeadLetter, RawEvent};
use crate::domain::ports::{DeadLetterSink, EventSource};
use crate::error::{Result, StorageError};

#[derive(Default)]
struct PartitionLog {
    events: Vec<RawEvent>,
    committed: u64,
}

/// Append-only log per partition with a committed offset
///
/// Offsets are positions in the partition, so appending an event that was
/// already delivered models an at-least-once redelivery.
#[derive(Clone, Default)]
pub struct InMemoryEventLog {
    partitions: Arc<RwLock<BTreeMap<String, PartitionLog>>>,
    faults: Arc<FaultSwitch>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &FaultSwitch {
        &self.faults
    }

    /// Append to the event's partition; returns the assigned offset
    pub fn append(&self, mut event: RawEvent) -> u64 {
        let mut partitions = self.partitions.write();
        let log = partitions.entry(event.partition_key.clone()).or_default();
        let offset = log.events.len() as u64;
        event.offset = offset;
        log.events.push(event);
        offset
    }

    /// Move the committed offset back, as a consumer-group reset would
    pub fn rewind(&self, partition: &str, offset: u64) {
        if let Some(log) = self.partitions.write().get_mut(partition) {
            log.committed = log.committed.min(offset);
        }
    }

    /// Events not yet committed in a partition
    pub fn lag(&self, partition: &str) -> u64 {
        self.partitions
            .read()
            .get(partition)
            .map_or(0, |log| (log.events.len() as u64).saturating_sub(log.committed))
    }
}

#[async_trait]
impl EventSource for InMemoryEventLog {
    async fn partitions(&self) -> Result<Vec<String>> {
        self.faults.check("event log")?;
        Ok(self.partitions.read().keys().cloned().collect())
    }

    async fn fetch(&self, partition: &str, from: u64, max: usize) -> Result<Vec<RawEvent>> {
        self.faults.check("event log")?;
        let partitions = self.partitions.read();
        let Some(log) = partitions.get(partition) else {
            return Ok(Vec::new());
        };
        let start = usize::try_from(from).unwrap_or(usize::MAX);
        Ok(log.events.iter().skip(start).take(max).cloned().collect())
    }

    async fn committed_offset(&self, partition: &str) -> Result<u64> {
        self.faults.check("event log")?;
        Ok(self
            .partitions
            .read()
            .get(partition)
            .map_or(0, |log| log.committed))
    }

    async fn commit(&self, partition: &str, next_offset: u64) -> Result<()> {
        self.faults.check("event log")?;
        let mut partitions = self.partitions.write();
        let log = partitions
            .get_mut(partition)
            .ok_or_else(|| StorageError::not_found(format!("partition {}", partition)))?;
        if next_offset > log.events.len() as u64 {
            return Err(StorageError::conflict(format!(
                "offset {} beyond end of partition {}",
                next_offset, partition
            )));
        }
        log.committed = log.committed.max(next_offset);
        Ok(())
    }
}

/// Collects dead letters for inspection
#[derive(Clone, Default)]
pub struct InMemoryDeadLetters {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
}

impl InMemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().clone()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetters {
    async fn publish(&self, letter: DeadLetter) -> Result<()> {
        self.letters.lock().push(letter);
        Ok(())
    }
}
