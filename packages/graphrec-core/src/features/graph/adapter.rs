use chrono::{DateTime, Utc};
use graphrec_storage::{
    Attributes, ChangeNotification, Clock, ConditionalWrite, Entity, GraphStore, MutationKind,
    Relationship, UNKNOWN_ENTITY_TYPE,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::notifier::{ChangeListener, ChangeNotifier};
use crate::config::StoreConfig;
use crate::errors::{CoreError, Result};
use crate::shared::CallPolicy;

/// What a mutation wants to do with the entity it just read
enum Plan {
    Write(ConditionalWrite),
    Unchanged(Entity),
}

/// Versioned access to the canonical graph
///
/// Each mutation bumps the affected entity's version exactly once (the
/// source entity for relationships) and publishes a notification after the
/// commit.
pub struct GraphAdapter {
    store: Arc<dyn GraphStore>,
    clock: Arc<dyn Clock>,
    policy: CallPolicy,
    max_conflict_retries: u32,
    notifier: Arc<ChangeNotifier>,
}

impl GraphAdapter {
    pub fn new(
        store: Arc<dyn GraphStore>,
        clock: Arc<dyn Clock>,
        policy: CallPolicy,
        max_conflict_retries: u32,
    ) -> Self {
        Self {
            store,
            clock,
            policy,
            max_conflict_retries,
            notifier: Arc::new(ChangeNotifier::new()),
        }
    }

    pub fn from_config(
        store: Arc<dyn GraphStore>,
        clock: Arc<dyn Clock>,
        config: &StoreConfig,
    ) -> Self {
        Self::new(
            store,
            clock,
            CallPolicy::from_config(config),
            config.max_conflict_retries,
        )
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ChangeNotification> {
        self.notifier.subscribe()
    }

    pub fn add_listener(&self, listener: Arc<dyn ChangeListener>) {
        self.notifier.add_listener(listener);
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Mutations
    // ═══════════════════════════════════════════════════════════════════════

    /// Create the entity or merge `attributes` into the existing map
    pub async fn upsert_entity(
        &self,
        entity_type: &str,
        id: &str,
        attributes: Attributes,
    ) -> Result<Entity> {
        require_id(id)?;
        if entity_type.is_empty() {
            return Err(CoreError::validation("entity type must not be empty"));
        }

        let (entity, _) = self
            .mutate(id, MutationKind::EntityUpserted, |current, now| {
                let (entity, expected_version) = match current {
                    Some(existing) => {
                        let mut next = existing.next_version(now);
                        // an implicit endpoint learns its type; a known type is
                        // never downgraded to the placeholder
                        if entity_type != UNKNOWN_ENTITY_TYPE {
                            next.entity_type = entity_type.to_string();
                        }
                        next.attributes
                            .extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
                        (next, Some(existing.version))
                    }
                    None => (Entity::new(id, entity_type, attributes.clone(), now), None),
                };
                Ok(Plan::Write(ConditionalWrite {
                    entity,
                    expected_version,
                    relationship: None,
                }))
            })
            .await?;
        Ok(entity)
    }

    /// Upsert `source → target`; missing endpoints are created as `unknown`
    pub async fn upsert_relationship(
        &self,
        source: &str,
        target: &str,
        rel_type: &str,
        weight: f64,
    ) -> Result<Relationship> {
        require_id(source)?;
        require_id(target)?;
        if rel_type.is_empty() {
            return Err(CoreError::validation("relationship type must not be empty"));
        }
        if !weight.is_finite() || weight < 0.0 {
            return Err(CoreError::validation(format!(
                "relationship weight must be finite and >= 0, got {}",
                weight
            )));
        }

        if source != target {
            self.ensure_endpoint(target).await?;
        }

        let (_, relationship) = self
            .mutate(source, MutationKind::RelationshipUpserted, |current, now| {
                let (entity, expected_version) = match current {
                    Some(existing) => {
                        let version = existing.version;
                        (existing.next_version(now), Some(version))
                    }
                    None => (
                        Entity::new(source, UNKNOWN_ENTITY_TYPE, Attributes::new(), now),
                        None,
                    ),
                };
                Ok(Plan::Write(ConditionalWrite {
                    entity,
                    expected_version,
                    relationship: Some(Relationship::new(source, target, rel_type, weight, now)),
                }))
            })
            .await?;

        relationship.ok_or_else(|| CoreError::not_found(format!("relationship from {}", source)))
    }

    /// Tombstoning twice is a no-op; unknown ids are `NotFound`
    pub async fn tombstone_entity(&self, id: &str) -> Result<Entity> {
        require_id(id)?;
        let (entity, _) = self
            .mutate(id, MutationKind::Tombstoned, |current, now| {
                let existing =
                    current.ok_or_else(|| CoreError::not_found(format!("entity {}", id)))?;
                if existing.tombstoned {
                    return Ok(Plan::Unchanged(existing));
                }
                let mut next = existing.next_version(now);
                next.tombstoned = true;
                Ok(Plan::Write(ConditionalWrite {
                    entity: next,
                    expected_version: Some(existing.version),
                    relationship: None,
                }))
            })
            .await?;
        Ok(entity)
    }

    /// Read-modify-write loop bounded by `max_conflict_retries`
    async fn mutate<F>(
        &self,
        id: &str,
        kind: MutationKind,
        plan: F,
    ) -> Result<(Entity, Option<Relationship>)>
    where
        F: Fn(Option<Entity>, DateTime<Utc>) -> Result<Plan>,
    {
        let attempts = self.max_conflict_retries + 1;
        for attempt in 1..=attempts {
            let current = self.get_entity(id).await?;
            let write = match plan(current, self.clock.now())? {
                Plan::Unchanged(entity) => return Ok((entity, None)),
                Plan::Write(write) => write,
            };

            let entity = write.entity.clone();
            let relationship = write.relationship.clone();
            if self.commit(write).await? {
                self.publish(&entity, kind).await;
                return Ok((entity, relationship));
            }
            debug!(entity_id = id, attempt, "version conflict, re-reading");
        }

        warn!(entity_id = id, attempts, "giving up after repeated version conflicts");
        Err(CoreError::Conflict {
            entity_id: id.to_string(),
            attempts,
        })
    }

    /// Returns false on a version conflict
    async fn commit(&self, write: ConditionalWrite) -> Result<bool> {
        let outcome = self
            .policy
            .call("graph.conditional_write", || {
                self.store.conditional_write(write.clone())
            })
            .await?;

        match outcome {
            graphrec_storage::WriteOutcome::Applied => Ok(true),
            graphrec_storage::WriteOutcome::Conflict { current_version } => {
                // A timed-out attempt may have committed before the retry saw
                // its own write as a conflict.
                if current_version == Some(write.entity.version) {
                    let stored = self.get_entity(&write.entity.id).await?;
                    return Ok(stored.as_ref() == Some(&write.entity));
                }
                Ok(false)
            }
        }
    }

    async fn ensure_endpoint(&self, id: &str) -> Result<()> {
        if self.get_entity(id).await?.is_some() {
            return Ok(());
        }
        let entity = Entity::new(id, UNKNOWN_ENTITY_TYPE, Attributes::new(), self.clock.now());
        let created = self
            .commit(ConditionalWrite {
                entity: entity.clone(),
                expected_version: None,
                relationship: None,
            })
            .await?;
        // losing the race means another writer created it
        if created {
            self.publish(&entity, MutationKind::EntityUpserted).await;
        }
        Ok(())
    }

    async fn publish(&self, entity: &Entity, kind: MutationKind) {
        self.notifier
            .publish(ChangeNotification {
                entity_id: entity.id.clone(),
                entity_type: entity.entity_type.clone(),
                version: entity.version,
                kind,
            })
            .await;
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        self.policy
            .call("graph.get_entity", || self.store.get_entity(id))
            .await
    }

    /// Outgoing relationships, heaviest first, ties by most recent update
    pub async fn neighbors(
        &self,
        id: &str,
        rel_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Relationship>> {
        let mut relationships = self.outgoing(id, rel_type).await?;
        relationships.sort_by(|a, b| {
            b.weight
                .total_cmp(&a.weight)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
                .then_with(|| a.target.cmp(&b.target))
        });
        relationships.truncate(limit);
        Ok(relationships)
    }

    pub async fn outgoing(&self, id: &str, rel_type: Option<&str>) -> Result<Vec<Relationship>> {
        self.policy
            .call("graph.relationships_from", || {
                self.store.relationships_from(id, rel_type)
            })
            .await
    }

    pub async fn incoming(&self, id: &str, rel_type: Option<&str>) -> Result<Vec<Relationship>> {
        self.policy
            .call("graph.relationships_to", || {
                self.store.relationships_to(id, rel_type)
            })
            .await
    }

    /// Entities ordered by id, strictly after `after`
    pub async fn scan_entities(&self, after: Option<&str>, limit: usize) -> Result<Vec<Entity>> {
        self.policy
            .call("graph.scan_entities", || self.store.scan_entities(after, limit))
            .await
    }
}

fn require_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(CoreError::validation("entity id must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::RetryPolicy;
    use async_trait::async_trait;
    use graphrec_storage::{AttrValue, InMemoryGraphStore, ManualClock, RelationshipKey};
    use std::time::Duration;

    fn adapter() -> (GraphAdapter, InMemoryGraphStore, Arc<ManualClock>) {
        let store = InMemoryGraphStore::new();
        let clock = Arc::new(ManualClock::default());
        let policy = CallPolicy::new(RetryPolicy::immediate(3), Duration::from_secs(1));
        (
            GraphAdapter::new(Arc::new(store.clone()), clock.clone(), policy, 4),
            store,
            clock,
        )
    }

    fn attrs(pairs: &[(&str, AttrValue)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_upsert_entity_creates_then_merges() {
        let (graph, _, _) = adapter();

        let created = graph
            .upsert_entity("user", "u1", attrs(&[("name", "Ada".into())]))
            .await
            .unwrap();
        assert_eq!(created.version, 1);

        let merged = graph
            .upsert_entity("user", "u1", attrs(&[("age", 36i64.into())]))
            .await
            .unwrap();
        assert_eq!(merged.version, 2);
        assert_eq!(merged.attributes.len(), 2);
        assert_eq!(merged.attributes["name"], AttrValue::from("Ada"));
    }

    #[tokio::test]
    async fn test_relationship_creates_unknown_endpoints() {
        let (graph, store, _) = adapter();

        let rel = graph
            .upsert_relationship("u42", "item7", "viewed", 1.0)
            .await
            .unwrap();
        assert_eq!(rel.key(), RelationshipKey::new("u42", "item7", "viewed"));

        let source = graph.get_entity("u42").await.unwrap().unwrap();
        let target = graph.get_entity("item7").await.unwrap().unwrap();
        assert_eq!(source.entity_type, UNKNOWN_ENTITY_TYPE);
        assert_eq!(source.version, 1);
        assert_eq!(target.entity_type, UNKNOWN_ENTITY_TYPE);
        assert_eq!(store.relationship_count(), 1);

        // the placeholder type is replaced by the first real upsert
        let typed = graph
            .upsert_entity("item", "item7", Attributes::new())
            .await
            .unwrap();
        assert_eq!(typed.entity_type, "item");
        let again = graph
            .upsert_entity(UNKNOWN_ENTITY_TYPE, "item7", Attributes::new())
            .await
            .unwrap();
        assert_eq!(again.entity_type, "item");
    }

    #[tokio::test]
    async fn test_relationship_upsert_replaces_weight_and_bumps_source() {
        let (graph, store, clock) = adapter();
        graph
            .upsert_relationship("u1", "i1", "viewed", 1.0)
            .await
            .unwrap();
        clock.advance(Duration::from_secs(5));
        let rel = graph
            .upsert_relationship("u1", "i1", "viewed", 3.5)
            .await
            .unwrap();

        assert_eq!(rel.weight, 3.5);
        assert_eq!(store.relationship_count(), 1);
        assert_eq!(graph.get_entity("u1").await.unwrap().unwrap().version, 2);
        assert_eq!(graph.get_entity("i1").await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_invalid_weight_rejected() {
        let (graph, store, _) = adapter();
        for weight in [f64::NAN, f64::INFINITY, -1.0] {
            let err = graph
                .upsert_relationship("u1", "i1", "viewed", weight)
                .await
                .unwrap_err();
            assert!(matches!(err, CoreError::Validation(_)));
        }
        assert_eq!(store.relationship_count(), 0);
        assert!(graph.get_entity("i1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tombstone_semantics() {
        let (graph, _, _) = adapter();
        let mut rx = graph.subscribe();

        assert!(matches!(
            graph.tombstone_entity("ghost").await,
            Err(CoreError::NotFound(_))
        ));

        graph
            .upsert_entity("item", "i1", Attributes::new())
            .await
            .unwrap();
        let tombstoned = graph.tombstone_entity("i1").await.unwrap();
        assert!(tombstoned.tombstoned);
        assert_eq!(tombstoned.version, 2);

        let again = graph.tombstone_entity("i1").await.unwrap();
        assert_eq!(again.version, 2);

        assert_eq!(rx.recv().await.unwrap().kind, MutationKind::EntityUpserted);
        assert_eq!(rx.recv().await.unwrap().kind, MutationKind::Tombstoned);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_neighbors_sorted_by_weight_then_recency() {
        let (graph, _, clock) = adapter();
        graph.upsert_relationship("u1", "a", "viewed", 1.0).await.unwrap();
        clock.advance(Duration::from_secs(1));
        graph.upsert_relationship("u1", "b", "viewed", 5.0).await.unwrap();
        clock.advance(Duration::from_secs(1));
        graph.upsert_relationship("u1", "c", "viewed", 1.0).await.unwrap();
        graph.upsert_relationship("u1", "d", "bought", 9.0).await.unwrap();

        let all: Vec<_> = graph
            .neighbors("u1", None, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.target)
            .collect();
        assert_eq!(all, vec!["d", "b", "c", "a"]);

        let viewed = graph.neighbors("u1", Some("viewed"), 2).await.unwrap();
        assert_eq!(viewed.len(), 2);
        assert_eq!(viewed[0].target, "b");
        assert_eq!(viewed[1].target, "c");
    }

    #[tokio::test]
    async fn test_notifications_carry_committed_version() {
        let (graph, _, _) = adapter();
        let mut rx = graph.subscribe();

        graph.upsert_relationship("u1", "i1", "viewed", 1.0).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!((first.entity_id.as_str(), first.version), ("i1", 1));
        let second = rx.recv().await.unwrap();
        assert_eq!((second.entity_id.as_str(), second.version), ("u1", 1));
        assert_eq!(second.kind, MutationKind::RelationshipUpserted);
    }

    /// Store whose first conditional write always loses a race
    struct RacingStore {
        inner: InMemoryGraphStore,
        losses: parking_lot::Mutex<u32>,
    }

    #[async_trait]
    impl GraphStore for RacingStore {
        async fn get_entity(&self, id: &str) -> graphrec_storage::Result<Option<Entity>> {
            self.inner.get_entity(id).await
        }

        async fn conditional_write(
            &self,
            write: ConditionalWrite,
        ) -> graphrec_storage::Result<graphrec_storage::WriteOutcome> {
            let lose = {
                let mut losses = self.losses.lock();
                let lose = *losses > 0;
                if lose {
                    *losses -= 1;
                }
                lose
            };
            if lose {
                // a competing writer bumps the version first
                if let Some(current) = self.inner.get_entity(&write.entity.id).await? {
                    let bumped =
                        current.next_version(current.updated_at + chrono::Duration::seconds(1));
                    self.inner
                        .conditional_write(ConditionalWrite {
                            entity: bumped,
                            expected_version: Some(current.version),
                            relationship: None,
                        })
                        .await?;
                }
            }
            self.inner.conditional_write(write).await
        }

        async fn get_relationship(
            &self,
            key: &RelationshipKey,
        ) -> graphrec_storage::Result<Option<Relationship>> {
            self.inner.get_relationship(key).await
        }

        async fn relationships_from(
            &self,
            source: &str,
            rel_type: Option<&str>,
        ) -> graphrec_storage::Result<Vec<Relationship>> {
            self.inner.relationships_from(source, rel_type).await
        }

        async fn relationships_to(
            &self,
            target: &str,
            rel_type: Option<&str>,
        ) -> graphrec_storage::Result<Vec<Relationship>> {
            self.inner.relationships_to(target, rel_type).await
        }

        async fn scan_entities(
            &self,
            after: Option<&str>,
            limit: usize,
        ) -> graphrec_storage::Result<Vec<Entity>> {
            self.inner.scan_entities(after, limit).await
        }

        async fn count_entities(&self) -> graphrec_storage::Result<usize> {
            self.inner.count_entities().await
        }
    }

    #[tokio::test]
    async fn test_conflict_is_retried_after_reread() {
        let inner = InMemoryGraphStore::new();
        let store = Arc::new(RacingStore {
            inner: inner.clone(),
            losses: parking_lot::Mutex::new(0),
        });
        let graph = GraphAdapter::new(
            store.clone(),
            Arc::new(ManualClock::default()),
            CallPolicy::new(RetryPolicy::immediate(1), Duration::from_secs(1)),
            3,
        );
        graph.upsert_entity("user", "u1", Attributes::new()).await.unwrap();

        *store.losses.lock() = 2;
        let entity = graph
            .upsert_entity("user", "u1", attrs(&[("k", true.into())]))
            .await
            .unwrap();
        // two competing bumps plus our own
        assert_eq!(entity.version, 4);
        assert_eq!(inner.get_entity("u1").await.unwrap().unwrap(), entity);
    }

    #[tokio::test]
    async fn test_conflict_retries_are_bounded() {
        let inner = InMemoryGraphStore::new();
        let store = Arc::new(RacingStore {
            inner,
            losses: parking_lot::Mutex::new(0),
        });
        let graph = GraphAdapter::new(
            store.clone(),
            Arc::new(ManualClock::default()),
            CallPolicy::new(RetryPolicy::immediate(1), Duration::from_secs(1)),
            1,
        );
        graph.upsert_entity("user", "u1", Attributes::new()).await.unwrap();
        *store.losses.lock() = 10;

        let err = graph
            .upsert_entity("user", "u1", Attributes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict { attempts: 2, .. }));
    }
}
