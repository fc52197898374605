//! Entities whose index document could not be written

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use graphrec_storage::EntityId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesyncRecord {
    pub entity_id: EntityId,
    /// Highest notification version that failed
    pub version: u64,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

/// Registry drained by the reconciliation sweep
#[derive(Debug, Default)]
pub struct DesyncRegistry {
    entries: DashMap<EntityId, DesyncRecord>,
}

impl DesyncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps the record with the highest version per entity
    pub fn record(&self, record: DesyncRecord) {
        self.entries
            .entry(record.entity_id.clone())
            .and_modify(|existing| {
                if record.version >= existing.version {
                    *existing = record.clone();
                }
            })
            .or_insert(record);
    }

    pub fn remove(&self, entity_id: &str) -> bool {
        self.entries.remove(entity_id).is_some()
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.entries.contains_key(entity_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take every record, ordered by entity id
    pub fn drain(&self) -> Vec<DesyncRecord> {
        let ids: Vec<EntityId> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut records: Vec<DesyncRecord> = ids
            .iter()
            .filter_map(|id| self.entries.remove(id).map(|(_, record)| record))
            .collect();
        records.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, version: u64) -> DesyncRecord {
        DesyncRecord {
            entity_id: id.into(),
            version,
            reason: "index down".into(),
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_record_keeps_highest_version() {
        let registry = DesyncRegistry::new();
        registry.record(record("u1", 3));
        registry.record(record("u1", 2));
        registry.record(record("a1", 1));

        assert_eq!(registry.len(), 2);
        let drained = registry.drain();
        assert_eq!(drained[0].entity_id, "a1");
        assert_eq!(drained[1].version, 3);
        assert!(registry.is_empty());
    }
}
