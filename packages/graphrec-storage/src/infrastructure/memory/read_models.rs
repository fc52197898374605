//! In-memory search index and recommendation cache

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use super::FaultSwitch;
use crate::domain::clock::{Clock, SystemClock};
use crate::domain::models::{CacheEntry, EntityId, IndexDocument};
use crate::domain::ports::{CacheStore, SearchIndex};
use crate::error::Result;

// ═══════════════════════════════════════════════════════════════════════════
// Search index
// ═══════════════════════════════════════════════════════════════════════════

/// Ordered document map with substring matching
#[derive(Clone, Default)]
pub struct InMemorySearchIndex {
    docs: Arc<RwLock<BTreeMap<EntityId, IndexDocument>>>,
    faults: Arc<FaultSwitch>,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &FaultSwitch {
        &self.faults
    }

    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }

    fn write_if_newer(docs: &mut BTreeMap<EntityId, IndexDocument>, doc: IndexDocument) -> bool {
        match docs.get(&doc.entity_id) {
            Some(existing) if existing.version >= doc.version => false,
            _ => {
                docs.insert(doc.entity_id.clone(), doc);
                true
            }
        }
    }
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn get(&self, entity_id: &str) -> Result<Option<IndexDocument>> {
        self.faults.check("search index")?;
        Ok(self.docs.read().get(entity_id).cloned())
    }

    async fn get_version(&self, entity_id: &str) -> Result<Option<u64>> {
        self.faults.check("search index")?;
        Ok(self.docs.read().get(entity_id).map(|d| d.version))
    }

    async fn upsert_if_newer(&self, doc: IndexDocument) -> Result<bool> {
        self.faults.check("search index")?;
        Ok(Self::write_if_newer(&mut self.docs.write(), doc))
    }

    async fn delete(&self, entity_id: &str) -> Result<bool> {
        self.faults.check("search index")?;
        Ok(self.docs.write().remove(entity_id).is_some())
    }

    async fn bulk_upsert(&self, docs: Vec<IndexDocument>) -> Result<usize> {
        self.faults.check("search index")?;
        let mut stored = self.docs.write();
        Ok(docs
            .into_iter()
            .map(|doc| Self::write_if_newer(&mut stored, doc))
            .filter(|written| *written)
            .count())
    }

    async fn keys_in_range(
        &self,
        after: Option<&str>,
        until: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(EntityId, u64)>> {
        self.faults.check("search index")?;
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        let upper = until.map_or(Bound::Unbounded, Bound::Included);
        Ok(self
            .docs
            .read()
            .range::<str, _>((lower, upper))
            .take(limit)
            .map(|(id, doc)| (id.clone(), doc.version))
            .collect())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<EntityId>> {
        self.faults.check("search index")?;
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .docs
            .read()
            .values()
            .filter(|doc| !doc.tombstoned)
            .filter(|doc| {
                let text = doc.text.to_lowercase();
                terms.iter().all(|term| text.contains(term.as_str()))
            })
            .take(limit)
            .map(|doc| doc.entity_id.clone())
            .collect())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Recommendation cache
// ═══════════════════════════════════════════════════════════════════════════

/// Cache map with clock-driven expiry
#[derive(Clone)]
pub struct InMemoryCacheStore {
    entries: Arc<Mutex<HashMap<EntityId, CacheEntry>>>,
    clock: Arc<dyn Clock>,
    faults: Arc<FaultSwitch>,
}

impl InMemoryCacheStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
            faults: Arc::new(FaultSwitch::default()),
        }
    }

    pub fn faults(&self) -> &FaultSwitch {
        &self.faults
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, entity_id: &str) -> Result<Option<CacheEntry>> {
        self.faults.check("cache store")?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let expired = entries.get(entity_id).map(|entry| entry.is_expired(now));
        match expired {
            Some(true) => {
                entries.remove(entity_id);
                Ok(None)
            }
            Some(false) => Ok(entries.get(entity_id).cloned()),
            None => Ok(None),
        }
    }

    async fn put_if_newer(&self, entry: CacheEntry) -> Result<bool> {
        self.faults.check("cache store")?;
        let mut entries = self.entries.lock();
        match entries.get(&entry.entity_id) {
            Some(existing) if existing.graph_version > entry.graph_version => Ok(false),
            _ => {
                entries.insert(entry.entity_id.clone(), entry);
                Ok(true)
            }
        }
    }

    async fn invalidate(&self, entity_id: &str) -> Result<bool> {
        self.faults.check("cache store")?;
        Ok(self.entries.lock().remove(entity_id).is_some())
    }
}
