//! In-memory graph store

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use super::FaultSwitch;
use crate::domain::models::*;
use crate::domain::ports::GraphStore;
use crate::error::{Result, StorageError};

#[derive(Default)]
struct GraphState {
    entities: BTreeMap<EntityId, Entity>,
    relationships: BTreeMap<RelationshipKey, Relationship>,
    /// target → keys of incoming relationships
    incoming: HashMap<EntityId, BTreeSet<RelationshipKey>>,
}

/// Graph held behind a single lock so a conditional write is atomic
#[derive(Clone, Default)]
pub struct InMemoryGraphStore {
    state: Arc<RwLock<GraphState>>,
    faults: Arc<FaultSwitch>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &FaultSwitch {
        &self.faults
    }

    pub fn relationship_count(&self) -> usize {
        self.state.read().relationships.len()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        self.faults.check("graph store")?;
        Ok(self.state.read().entities.get(id).cloned())
    }

    async fn conditional_write(&self, write: ConditionalWrite) -> Result<WriteOutcome> {
        self.faults.check("graph store")?;
        let mut state = self.state.write();

        let current_version = state.entities.get(&write.entity.id).map(|e| e.version);
        if current_version != write.expected_version {
            return Ok(WriteOutcome::Conflict { current_version });
        }

        if let Some(rel) = &write.relationship {
            for endpoint in [&rel.source, &rel.target] {
                if endpoint != &write.entity.id && !state.entities.contains_key(endpoint) {
                    return Err(StorageError::not_found(format!("entity {}", endpoint)));
                }
            }
        }

        state
            .entities
            .insert(write.entity.id.clone(), write.entity);

        if let Some(rel) = write.relationship {
            let key = rel.key();
            state
                .incoming
                .entry(rel.target.clone())
                .or_default()
                .insert(key.clone());
            state.relationships.insert(key, rel);
        }

        Ok(WriteOutcome::Applied)
    }

    async fn get_relationship(&self, key: &RelationshipKey) -> Result<Option<Relationship>> {
        self.faults.check("graph store")?;
        Ok(self.state.read().relationships.get(key).cloned())
    }

    async fn relationships_from(
        &self,
        source: &str,
        rel_type: Option<&str>,
    ) -> Result<Vec<Relationship>> {
        self.faults.check("graph store")?;
        let state = self.state.read();
        let start = RelationshipKey::new(source, "", "");
        Ok(state
            .relationships
            .range(start..)
            .take_while(|(key, _)| key.source == source)
            .filter(|(key, _)| rel_type.map_or(true, |t| key.rel_type == t))
            .map(|(_, rel)| rel.clone())
            .collect())
    }

    async fn relationships_to(
        &self,
        target: &str,
        rel_type: Option<&str>,
    ) -> Result<Vec<Relationship>> {
        self.faults.check("graph store")?;
        let state = self.state.read();
        let Some(keys) = state.incoming.get(target) else {
            return Ok(Vec::new());
        };
        Ok(keys
            .iter()
            .filter(|key| rel_type.map_or(true, |t| key.rel_type == t))
            .filter_map(|key| state.relationships.get(key).cloned())
            .collect())
    }

    async fn scan_entities(&self, after: Option<&str>, limit: usize) -> Result<Vec<Entity>> {
        self.faults.check("graph store")?;
        let state = self.state.read();
        let iter: Box<dyn Iterator<Item = &Entity>> = match after {
            Some(after) => Box::new(
                state
                    .entities
                    .range::<str, _>((
                        std::ops::Bound::Excluded(after),
                        std::ops::Bound::Unbounded,
                    ))
                    .map(|(_, e)| e),
            ),
            None => Box::new(state.entities.values()),
        };
        Ok(iter.take(limit).cloned().collect())
    }

    async fn count_entities(&self) -> Result<usize> {
        self.faults.check("graph store")?;
        Ok(self.state.read().entities.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entity(id: &str, version: u64) -> Entity {
        let mut e = Entity::new(id, "user", Attributes::new(), Utc::now());
        e.version = version;
        e
    }

    fn create(id: &str) -> ConditionalWrite {
        ConditionalWrite {
            entity: entity(id, 1),
            expected_version: None,
            relationship: None,
        }
    }

    #[tokio::test]
    async fn test_conditional_write_create_and_conflict() {
        let store = InMemoryGraphStore::new();
        assert_eq!(
            store.conditional_write(create("u1")).await.unwrap(),
            WriteOutcome::Applied
        );

        // Creating again must conflict with the existing version
        assert_eq!(
            store.conditional_write(create("u1")).await.unwrap(),
            WriteOutcome::Conflict {
                current_version: Some(1)
            }
        );

        let update = ConditionalWrite {
            entity: entity("u1", 2),
            expected_version: Some(1),
            relationship: None,
        };
        assert_eq!(
            store.conditional_write(update).await.unwrap(),
            WriteOutcome::Applied
        );
        assert_eq!(store.get_entity("u1").await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_relationship_requires_target() {
        let store = InMemoryGraphStore::new();
        let write = ConditionalWrite {
            entity: entity("u1", 1),
            expected_version: None,
            relationship: Some(Relationship::new("u1", "item9", "viewed", 1.0, Utc::now())),
        };
        let err = store.conditional_write(write).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
        assert!(store.get_entity("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_relationship_indexes() {
        let store = InMemoryGraphStore::new();
        store.conditional_write(create("item7")).await.unwrap();
        store.conditional_write(create("u1")).await.unwrap();
        store.conditional_write(create("u2")).await.unwrap();

        for (src, version) in [("u1", 1), ("u2", 1)] {
            let write = ConditionalWrite {
                entity: entity(src, version + 1),
                expected_version: Some(version),
                relationship: Some(Relationship::new(src, "item7", "viewed", 1.0, Utc::now())),
            };
            store.conditional_write(write).await.unwrap();
        }

        let incoming = store.relationships_to("item7", None).await.unwrap();
        assert_eq!(incoming.len(), 2);
        let outgoing = store.relationships_from("u1", Some("viewed")).await.unwrap();
        assert_eq!(outgoing.len(), 1);
        assert!(store
            .relationships_from("u1", Some("bought"))
            .await
            .unwrap()
            .is_empty());
        // "u1" must not match "u10"-style prefixes
        assert!(store.relationships_from("u", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scan_entities_ordered() {
        let store = InMemoryGraphStore::new();
        for id in ["c", "a", "b", "d"] {
            store.conditional_write(create(id)).await.unwrap();
        }
        let first: Vec<_> = store
            .scan_entities(None, 2)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(first, vec!["a", "b"]);

        let rest: Vec<_> = store
            .scan_entities(Some("b"), 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(rest, vec!["c", "d"]);
    }

    #[tokio::test]
    async fn test_fault_switch_makes_store_unavailable() {
        let store = InMemoryGraphStore::new();
        store.faults().set_down(true);
        let err = store.get_entity("u1").await.unwrap_err();
        assert!(err.is_transient());
    }
}
