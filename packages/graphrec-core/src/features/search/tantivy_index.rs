//! Tantivy-backed search index
//!
//! # Schema
//!
//! 1. `entity_id` - raw keyword (STORED, exact match, upsert key)
//! 2. `entity_type` - raw keyword (STORED)
//! 3. `version` - u64 (INDEXED, STORED)
//! 4. `tombstoned` - u64 0/1 (INDEXED), excluded from `search`
//! 5. `text` - full text (tokenized, not stored)
//! 6. `payload` - the whole `IndexDocument` as JSON (STORED)
//!
//! Writes are serialized through one writer; every write commits and
//! reloads the reader so reads observe it immediately.

use async_trait::async_trait;
use graphrec_storage::{EntityId, IndexDocument, SearchIndex, StorageError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tantivy::{
    collector::{DocSetCollector, TopDocs},
    doc,
    query::{AllQuery, BooleanQuery, Occur, Query, QueryParser, TermQuery},
    schema::{
        Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value, INDEXED, STORED,
        TEXT,
    },
    Index, IndexReader, IndexWriter, ReloadPolicy, Searcher, TantivyDocument, Term,
};
use tracing::{debug, info};

pub const FIELD_ENTITY_ID: &str = "entity_id";
pub const FIELD_ENTITY_TYPE: &str = "entity_type";
pub const FIELD_VERSION: &str = "version";
pub const FIELD_TOMBSTONED: &str = "tombstoned";
pub const FIELD_TEXT: &str = "text";
pub const FIELD_PAYLOAD: &str = "payload";

/// Tantivy's minimum is 15MB
pub const DEFAULT_WRITER_HEAP_BYTES: usize = 50_000_000;

fn build_schema() -> Schema {
    let mut schema_builder = Schema::builder();

    let keyword = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer("raw")
                .set_index_option(IndexRecordOption::Basic),
        )
        .set_stored();
    schema_builder.add_text_field(FIELD_ENTITY_ID, keyword.clone());
    schema_builder.add_text_field(FIELD_ENTITY_TYPE, keyword);

    schema_builder.add_u64_field(FIELD_VERSION, INDEXED | STORED);
    schema_builder.add_u64_field(FIELD_TOMBSTONED, INDEXED);
    schema_builder.add_text_field(FIELD_TEXT, TEXT);
    schema_builder.add_text_field(FIELD_PAYLOAD, STORED);

    schema_builder.build()
}

#[derive(Debug, Clone, Copy)]
struct IndexFields {
    entity_id: Field,
    entity_type: Field,
    version: Field,
    tombstoned: Field,
    text: Field,
    payload: Field,
}

impl IndexFields {
    fn resolve(schema: &Schema) -> Result<Self, StorageError> {
        let field = |name: &str| {
            schema
                .get_field(name)
                .map_err(|e| index_error("index schema mismatch", e))
        };
        Ok(Self {
            entity_id: field(FIELD_ENTITY_ID)?,
            entity_type: field(FIELD_ENTITY_TYPE)?,
            version: field(FIELD_VERSION)?,
            tombstoned: field(FIELD_TOMBSTONED)?,
            text: field(FIELD_TEXT)?,
            payload: field(FIELD_PAYLOAD)?,
        })
    }
}

/// Tantivy errors surface as `Database` storage errors (transient)
fn index_error(context: &str, err: tantivy::TantivyError) -> StorageError {
    StorageError::database(format!("{}: {}", context, err)).with_source(err)
}

pub struct TantivySearchIndex {
    index: Index,
    reader: IndexReader,
    writer: Arc<Mutex<IndexWriter>>,
    fields: IndexFields,
}

impl TantivySearchIndex {
    pub fn in_memory(writer_heap_bytes: usize) -> Result<Self, StorageError> {
        let index = Index::create_in_ram(build_schema());
        Self::from_index(index, writer_heap_bytes)
    }

    /// Open the index in `dir`, creating it on first use
    pub fn open_in_dir(dir: impl AsRef<Path>, writer_heap_bytes: usize) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        let index = if dir.join("meta.json").exists() {
            Index::open_in_dir(dir).map_err(|e| index_error("failed to open index", e))?
        } else {
            std::fs::create_dir_all(dir)?;
            Index::create_in_dir(dir, build_schema())
                .map_err(|e| index_error("failed to create index", e))?
        };
        info!(path = %dir.display(), "search index opened");
        Self::from_index(index, writer_heap_bytes)
    }

    fn from_index(index: Index, writer_heap_bytes: usize) -> Result<Self, StorageError> {
        let fields = IndexFields::resolve(&index.schema())?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(|e| index_error("failed to create reader", e))?;
        let writer = index
            .writer(writer_heap_bytes)
            .map_err(|e| index_error("failed to create writer", e))?;

        Ok(Self {
            index,
            reader,
            writer: Arc::new(Mutex::new(writer)),
            fields,
        })
    }

    fn id_term(&self, entity_id: &str) -> Term {
        Term::from_field_text(self.fields.entity_id, entity_id)
    }

    fn find(&self, searcher: &Searcher, entity_id: &str) -> Result<Option<TantivyDocument>, StorageError> {
        let query = TermQuery::new(self.id_term(entity_id), IndexRecordOption::Basic);
        let top = searcher
            .search(&query, &TopDocs::with_limit(1))
            .map_err(|e| index_error("lookup failed", e))?;
        match top.first() {
            Some((_, address)) => Ok(Some(
                searcher
                    .doc(*address)
                    .map_err(|e| index_error("failed to retrieve doc", e))?,
            )),
            None => Ok(None),
        }
    }

    fn stored_version(&self, doc: &TantivyDocument) -> u64 {
        doc.get_first(self.fields.version)
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }

    fn decode(&self, doc: &TantivyDocument) -> Result<IndexDocument, StorageError> {
        let payload = doc
            .get_first(self.fields.payload)
            .and_then(|v| v.as_str())
            .ok_or_else(|| StorageError::serialization("index document without payload"))?;
        Ok(serde_json::from_str(payload)?)
    }

    fn encode(&self, doc: &IndexDocument) -> Result<TantivyDocument, StorageError> {
        Ok(doc!(
            self.fields.entity_id => doc.entity_id.clone(),
            self.fields.entity_type => doc.entity_type.clone(),
            self.fields.version => doc.version,
            self.fields.tombstoned => u64::from(doc.tombstoned),
            self.fields.text => doc.text.clone(),
            self.fields.payload => serde_json::to_string(doc)?,
        ))
    }

    fn commit(&self, writer: &mut IndexWriter) -> Result<(), StorageError> {
        writer
            .commit()
            .map_err(|e| index_error("failed to commit", e))?;
        self.reader
            .reload()
            .map_err(|e| index_error("failed to reload reader", e))
    }

    /// Upsert each newer document under the writer lock; caller commits
    fn stage_if_newer(
        &self,
        writer: &IndexWriter,
        staged: &mut HashMap<EntityId, u64>,
        doc: IndexDocument,
    ) -> Result<bool, StorageError> {
        let indexed = match staged.get(&doc.entity_id) {
            Some(version) => Some(*version),
            None => self
                .find(&self.reader.searcher(), &doc.entity_id)?
                .map(|d| self.stored_version(&d)),
        };
        if indexed.is_some_and(|v| v >= doc.version) {
            return Ok(false);
        }

        let encoded = self.encode(&doc)?;
        writer.delete_term(self.id_term(&doc.entity_id));
        writer
            .add_document(encoded)
            .map_err(|e| index_error("failed to add document", e))?;
        staged.insert(doc.entity_id, doc.version);
        Ok(true)
    }

    pub fn num_docs(&self) -> u64 {
        self.reader.searcher().num_docs()
    }
}

#[async_trait]
impl SearchIndex for TantivySearchIndex {
    async fn get(&self, entity_id: &str) -> graphrec_storage::Result<Option<IndexDocument>> {
        let searcher = self.reader.searcher();
        self.find(&searcher, entity_id)?
            .map(|doc| self.decode(&doc))
            .transpose()
    }

    async fn get_version(&self, entity_id: &str) -> graphrec_storage::Result<Option<u64>> {
        let searcher = self.reader.searcher();
        Ok(self
            .find(&searcher, entity_id)?
            .map(|doc| self.stored_version(&doc)))
    }

    async fn upsert_if_newer(&self, doc: IndexDocument) -> graphrec_storage::Result<bool> {
        let mut writer = self.writer.lock();
        let written = self.stage_if_newer(&writer, &mut HashMap::new(), doc)?;
        if written {
            self.commit(&mut writer)?;
        }
        Ok(written)
    }

    async fn delete(&self, entity_id: &str) -> graphrec_storage::Result<bool> {
        let mut writer = self.writer.lock();
        if self.find(&self.reader.searcher(), entity_id)?.is_none() {
            return Ok(false);
        }
        writer.delete_term(self.id_term(entity_id));
        self.commit(&mut writer)?;
        Ok(true)
    }

    async fn bulk_upsert(&self, docs: Vec<IndexDocument>) -> graphrec_storage::Result<usize> {
        let mut writer = self.writer.lock();
        let mut staged = HashMap::new();
        let mut written = 0;
        for doc in docs {
            if self.stage_if_newer(&writer, &mut staged, doc)? {
                written += 1;
            }
        }
        if written > 0 {
            self.commit(&mut writer)?;
        }
        debug!(written, "bulk index upsert");
        Ok(written)
    }

    async fn keys_in_range(
        &self,
        after: Option<&str>,
        until: Option<&str>,
        limit: usize,
    ) -> graphrec_storage::Result<Vec<(EntityId, u64)>> {
        let searcher = self.reader.searcher();
        let addresses = searcher
            .search(&AllQuery, &DocSetCollector)
            .map_err(|e| index_error("range scan failed", e))?;

        let mut keys = Vec::new();
        for address in addresses {
            let doc: TantivyDocument = searcher
                .doc(address)
                .map_err(|e| index_error("failed to retrieve doc", e))?;
            let Some(id) = doc.get_first(self.fields.entity_id).and_then(|v| v.as_str()) else {
                continue;
            };
            if after.is_some_and(|a| id <= a) || until.is_some_and(|u| id > u) {
                continue;
            }
            keys.push((id.to_string(), self.stored_version(&doc)));
        }
        keys.sort_by(|a, b| a.0.cmp(&b.0));
        keys.truncate(limit);
        Ok(keys)
    }

    async fn search(&self, query: &str, limit: usize) -> graphrec_storage::Result<Vec<EntityId>> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let searcher = self.reader.searcher();
        let mut parser = QueryParser::for_index(&self.index, vec![self.fields.text]);
        parser.set_conjunction_by_default();
        let (parsed, errors) = parser.parse_query_lenient(query);
        if !errors.is_empty() {
            debug!(query, errors = errors.len(), "lenient query parse");
        }

        let live_only: Vec<(Occur, Box<dyn Query>)> = vec![
            (Occur::Must, parsed),
            (
                Occur::MustNot,
                Box::new(TermQuery::new(
                    Term::from_field_u64(self.fields.tombstoned, 1),
                    IndexRecordOption::Basic,
                )),
            ),
        ];
        let top_docs = searcher
            .search(&BooleanQuery::new(live_only), &TopDocs::with_limit(limit))
            .map_err(|e| index_error("search failed", e))?;

        let mut ids = Vec::with_capacity(top_docs.len());
        for (_, address) in top_docs {
            let doc: TantivyDocument = searcher
                .doc(address)
                .map_err(|e| index_error("failed to retrieve doc", e))?;
            if let Some(id) = doc.get_first(self.fields.entity_id).and_then(|v| v.as_str()) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphrec_storage::Attributes;
    use tempfile::TempDir;

    fn doc(id: &str, version: u64, text: &str) -> IndexDocument {
        IndexDocument {
            entity_id: id.into(),
            entity_type: "item".into(),
            version,
            tombstoned: false,
            text: text.into(),
            attributes: Attributes::new(),
            top_neighbors: vec![],
        }
    }

    fn index() -> TantivySearchIndex {
        TantivySearchIndex::in_memory(DEFAULT_WRITER_HEAP_BYTES).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_if_newer_keeps_highest_version() {
        let index = index();
        assert!(index.upsert_if_newer(doc("i1", 3, "red shoes")).await.unwrap());
        assert!(!index.upsert_if_newer(doc("i1", 2, "old")).await.unwrap());
        assert!(!index.upsert_if_newer(doc("i1", 3, "same")).await.unwrap());

        let stored = index.get("i1").await.unwrap().unwrap();
        assert_eq!(stored.version, 3);
        assert_eq!(stored.text, "red shoes");
        assert_eq!(index.num_docs(), 1);
    }

    #[tokio::test]
    async fn test_search_skips_tombstoned() {
        let index = index();
        index.upsert_if_newer(doc("i1", 1, "red shoes")).await.unwrap();
        index.upsert_if_newer(doc("i2", 1, "red hat")).await.unwrap();
        let mut gone = doc("i3", 2, "red scarf");
        gone.tombstoned = true;
        index.upsert_if_newer(gone).await.unwrap();

        let mut hits = index.search("red", 10).await.unwrap();
        hits.sort();
        assert_eq!(hits, vec!["i1", "i2"]);
        assert_eq!(index.search("red shoes", 10).await.unwrap(), vec!["i1"]);
        assert!(index.search("   ", 10).await.unwrap().is_empty());

        // still retrievable for history
        assert!(index.get("i3").await.unwrap().unwrap().tombstoned);
    }

    #[tokio::test]
    async fn test_keys_in_range_and_delete() {
        let index = index();
        let written = index
            .bulk_upsert(vec![doc("a", 1, "x"), doc("b", 2, "x"), doc("c", 3, "x"), doc("b", 1, "x")])
            .await
            .unwrap();
        assert_eq!(written, 3);

        let keys = index.keys_in_range(Some("a"), Some("c"), 10).await.unwrap();
        assert_eq!(keys, vec![("b".to_string(), 2), ("c".to_string(), 3)]);
        assert_eq!(index.keys_in_range(None, None, 1).await.unwrap().len(), 1);

        assert!(index.delete("b").await.unwrap());
        assert!(!index.delete("b").await.unwrap());
        assert_eq!(index.get_version("b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reopen_from_directory() {
        let dir = TempDir::new().unwrap();
        {
            let index = TantivySearchIndex::open_in_dir(dir.path(), DEFAULT_WRITER_HEAP_BYTES).unwrap();
            index.upsert_if_newer(doc("i1", 4, "blue")).await.unwrap();
        }
        let index = TantivySearchIndex::open_in_dir(dir.path(), DEFAULT_WRITER_HEAP_BYTES).unwrap();
        assert_eq!(index.get_version("i1").await.unwrap(), Some(4));
    }
}
