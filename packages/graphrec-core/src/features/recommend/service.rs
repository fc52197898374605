use graphrec_storage::{EntityId, Relationship};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::RecommendConfig;
use crate::errors::{CoreError, Result};
use crate::features::cache::{CacheLookup, RecommendationCache};
use crate::features::graph::GraphAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Cached,
    Recomputed,
    /// Served from an outdated entry because the graph was unavailable
    Stale,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recommendations {
    pub entity_id: EntityId,
    pub items: Vec<EntityId>,
    pub freshness: Freshness,
}

pub struct RecommendationService {
    graph: Arc<GraphAdapter>,
    cache: Arc<RecommendationCache>,
    config: RecommendConfig,
}

impl RecommendationService {
    pub fn new(
        graph: Arc<GraphAdapter>,
        cache: Arc<RecommendationCache>,
        config: RecommendConfig,
    ) -> Self {
        Self {
            graph,
            cache,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<RecommendationCache> {
        &self.cache
    }

    /// Cached list when current, otherwise recomputed and cached
    pub async fn recommend(&self, entity_id: &str, limit: Option<usize>) -> Result<Recommendations> {
        let limit = limit.unwrap_or(self.config.default_limit);

        let lookup = match self.cache.get(entity_id).await {
            Ok(lookup) => lookup,
            Err(err) if err.is_transient() => return self.degrade(entity_id, limit, err).await,
            Err(err) => return Err(err),
        };
        if let CacheLookup::Hit(mut items) = lookup {
            items.truncate(limit);
            return Ok(Recommendations {
                entity_id: entity_id.to_string(),
                items,
                freshness: Freshness::Cached,
            });
        }

        match self.refresh(entity_id).await {
            Ok(mut items) => {
                items.truncate(limit);
                Ok(Recommendations {
                    entity_id: entity_id.to_string(),
                    items,
                    freshness: Freshness::Recomputed,
                })
            }
            Err(err) if err.is_transient() => self.degrade(entity_id, limit, err).await,
            Err(err) => Err(err),
        }
    }

    /// Recompute from the graph and store, stamped with the version read
    /// before the traversal
    pub async fn refresh(&self, entity_id: &str) -> Result<Vec<EntityId>> {
        let (version, items) = self.compute(entity_id).await?;
        self.cache.put(entity_id, items.clone(), version, None).await?;
        Ok(items)
    }

    /// `(graph_version, ranked items)` without touching the cache
    pub async fn compute(&self, entity_id: &str) -> Result<(u64, Vec<EntityId>)> {
        let source = self
            .graph
            .get_entity(entity_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("entity {}", entity_id)))?;
        if source.tombstoned {
            return Ok((source.version, Vec::new()));
        }

        let outgoing = self.followed(self.graph.outgoing(entity_id, None).await?);
        let already_linked: HashSet<EntityId> = outgoing.iter().map(|r| r.target.clone()).collect();

        let mut scores: HashMap<EntityId, f64> = HashMap::new();
        let mut peer_links: HashMap<EntityId, Vec<Relationship>> = HashMap::new();

        for first in self.strongest(outgoing) {
            let peers = self.followed(self.graph.incoming(&first.target, None).await?);
            for peer in self.strongest(peers) {
                if peer.source == entity_id {
                    continue;
                }
                if !peer_links.contains_key(&peer.source) {
                    let links = self.followed(self.graph.outgoing(&peer.source, None).await?);
                    peer_links.insert(peer.source.clone(), self.strongest(links));
                }
                let Some(links) = peer_links.get(&peer.source) else {
                    continue;
                };
                for candidate in links {
                    if candidate.target == entity_id || already_linked.contains(&candidate.target) {
                        continue;
                    }
                    *scores.entry(candidate.target.clone()).or_insert(0.0) +=
                        first.weight * peer.weight * candidate.weight;
                }
            }
        }

        let mut ranked: Vec<(EntityId, f64)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut items = Vec::new();
        for (candidate, _) in ranked {
            if items.len() >= self.cache.max_items() {
                break;
            }
            match self.graph.get_entity(&candidate).await? {
                Some(entity) if !entity.tombstoned => items.push(candidate),
                _ => {}
            }
        }

        debug!(entity_id, version = source.version, items = items.len(), "recommendations computed");
        Ok((source.version, items))
    }

    async fn degrade(&self, entity_id: &str, limit: usize, cause: CoreError) -> Result<Recommendations> {
        match self.cache.peek(entity_id).await {
            Ok(Some(entry)) => {
                warn!(entity_id, error = %cause, "graph unavailable, serving stale recommendations");
                let mut items = entry.items;
                items.truncate(limit);
                Ok(Recommendations {
                    entity_id: entity_id.to_string(),
                    items,
                    freshness: Freshness::Stale,
                })
            }
            _ => Err(cause),
        }
    }

    fn followed(&self, relationships: Vec<Relationship>) -> Vec<Relationship> {
        if self.config.rel_types.is_empty() {
            return relationships;
        }
        relationships
            .into_iter()
            .filter(|r| self.config.rel_types.iter().any(|t| t == &r.rel_type))
            .collect()
    }

    /// Heaviest `fanout_limit` relationships
    fn strongest(&self, mut relationships: Vec<Relationship>) -> Vec<Relationship> {
        relationships.sort_by(|a, b| {
            b.weight
                .total_cmp(&a.weight)
                .then_with(|| a.source.cmp(&b.source))
                .then_with(|| a.target.cmp(&b.target))
        });
        relationships.truncate(self.config.fanout_limit);
        relationships
    }
}
